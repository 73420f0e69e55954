/*
 * Process and Thread Scenarios
 *
 * fork, thread creation, CPU handover, orphaning and the capability gates,
 * plus allocator conservation across a whole process lifetime.
 */

use super::support::{
    args_of, make_kernel, new_server, read_user_u32, sys, tcb_of, write_user_u32,
};
use crate::caps::CapSet;
use crate::memory::{VirtAddr, VmFlags};
use crate::status::Status;
use crate::syscall::numbers::Syscall;
use crate::thread::tcb;

const OK: usize = 0;

fn rw_flags() -> usize {
    (VmFlags::READ | VmFlags::WRITE).bits()
}

#[test]
fn fork_copies_the_address_space() {
    let mut k = make_kernel(48 * 1024 * 1024);
    let init = k.spawn_init(0, VirtAddr::new(0x10_0000)).unwrap();
    let t = tcb_of(&k, init);

    sys(&mut k, 0, Syscall::ReqMem, [4096, rw_flags(), 0, 0, 0]);
    let args = args_of(t);
    assert_eq!(args[0], OK);
    let va = VirtAddr::new(args[1]);

    let parent_vmem = unsafe { t.as_ref().proc_vmem };
    write_user_u32(parent_vmem, va, 0xdead_beef);

    sys(&mut k, 0, Syscall::Fork, [0, 0, 0, 0, 0]);
    let args = args_of(t);
    assert_eq!(args[0], OK);
    let child_pid = args[1];
    assert_ne!(child_pid, 0);

    let c = tcb_of(&k, child_pid);
    unsafe {
        // fresh root identity
        let cr = c.as_ref();
        assert_eq!(cr.tid, child_pid);
        assert_eq!(cr.rid, child_pid);
        assert_eq!(cr.pid, child_pid);
        assert_eq!(cr.eid, child_pid);
    }

    // child sees the parent's value in its own frames
    let child_vmem = unsafe { c.as_ref().proc_vmem };
    assert_eq!(read_user_u32(child_vmem, va), 0xdead_beef);

    // child answer registers: (OK, 0, parent_pid)
    let cargs = args_of(c);
    assert_eq!(&cargs[..3], &[OK, 0, init]);

    // writes stay private in both directions
    write_user_u32(child_vmem, va, 0xfeed_face);
    assert_eq!(read_user_u32(parent_vmem, va), 0xdead_beef);
    write_user_u32(parent_vmem, va, 0x0bad_f00d);
    assert_eq!(read_user_u32(child_vmem, va), 0xfeed_face);
}

#[test]
fn create_starts_a_thread_in_the_process() {
    let mut k = make_kernel(32 * 1024 * 1024);
    let init = k.spawn_init(0, VirtAddr::new(0x10_0000)).unwrap();
    let t = tcb_of(&k, init);

    sys(&mut k, 0, Syscall::Create, [0x4_2000, 10, 20, 30, 40]);
    let args = args_of(t);
    assert_eq!(args[0], OK);
    let new_tid = args[1];

    let c = tcb_of(&k, new_tid);
    unsafe {
        let cr = c.as_ref();
        // same process, own id
        assert_eq!(cr.pid, init);
        assert_eq!(cr.rid, init);
        assert_eq!(cr.tid, new_tid);
        assert_eq!(cr.exec, VirtAddr::new(0x4_2000));
        assert!(cr.thread_stack_size > 0);
    }

    // the new thread starts with (tid, d0..d3)
    let cargs = args_of(c);
    assert_eq!(&cargs[..5], &[new_tid, 10, 20, 30, 40]);
}

#[test]
fn swap_moves_the_cpu() {
    let mut k = make_kernel(32 * 1024 * 1024);
    let init = k.spawn_init(0, VirtAddr::new(0x10_0000)).unwrap();
    let t = tcb_of(&k, init);

    sys(&mut k, 0, Syscall::Create, [0x4_2000, 0, 0, 0, 0]);
    let new_tid = args_of(t)[1];

    sys(&mut k, 0, Syscall::Swap, [new_tid, 0, 0, 0, 0]);
    let cur = k.current(0).unwrap();
    assert_eq!(unsafe { cur.as_ref().tid }, new_tid);

    // swapping to a running thread is refused
    sys(&mut k, 0, Syscall::Swap, [new_tid, 0, 0, 0, 0]);
    assert_eq!(args_of(cur)[0], Status::ErrExt.code() as usize);

    // the old thread's pending result says OK
    assert_eq!(args_of(t)[0], OK);
}

#[test]
fn exit_destroys_and_hands_over() {
    let mut k = make_kernel(32 * 1024 * 1024);
    let init = k.spawn_init(0, VirtAddr::new(0x10_0000)).unwrap();
    let t = tcb_of(&k, init);

    sys(&mut k, 0, Syscall::Create, [0x4_2000, 0, 0, 0, 0]);
    let worker_tid = args_of(t)[1];

    // switch to the worker, then let it exit back to init
    sys(&mut k, 0, Syscall::Swap, [worker_tid, 0, 0, 0, 0]);
    sys(&mut k, 0, Syscall::Exit, [init, 0, 0, 0, 0]);

    assert!(k.tcbs.get(worker_tid).is_none());
    let cur = k.current(0).unwrap();
    assert_eq!(unsafe { cur.as_ref().tid }, init);
}

#[test]
fn orphan_unwinds_and_is_destroyed() {
    let mut k = make_kernel(48 * 1024 * 1024);
    let _init = k.spawn_init(0, VirtAddr::new(0x10_0000)).unwrap();
    let q = new_server(&mut k, 0, 0xb0_0000);

    // p's root thread calls into q
    let p = new_server(&mut k, 0, 0xa0_0000);
    let pt = tcb_of(&k, p);
    k.use_tcb(0, pt);
    sys(&mut k, 0, Syscall::IpcReq, [q, 1, 2, 3, 4]);
    unsafe {
        assert_eq!(pt.as_ref().pid, q);
    }

    // p dies while its root thread is visiting q
    tcb::destroy_proc(&mut k.mm, &k.tcbs, pt, true);
    unsafe {
        assert!(pt.as_ref().zombie());
    }

    // the thread can observe that its home is gone: the rid no longer
    // names a live process
    let rid = unsafe { pt.as_ref().rid };
    assert!(unsafe { k.tcbs.get(rid).unwrap().as_ref().zombie() });

    // q's handler answers; the unwind finds no live caller and the thread
    // is destroyed as an orphan
    let effect = sys(&mut k, 0, Syscall::IpcResp, [0, 0, 0, 0, 0]);
    assert_eq!(effect, crate::syscall::Effect::Idle);
    assert!(k.tcbs.get(p).is_none());
    assert!(k.current(0).is_none());

    // q is unaffected
    assert!(!unsafe { tcb_of(&k, q).as_ref().zombie() });
}

#[test]
fn detach_makes_a_voluntary_orphan() {
    let mut k = make_kernel(32 * 1024 * 1024);
    let init = k.spawn_init(0, VirtAddr::new(0x10_0000)).unwrap();
    let t = tcb_of(&k, init);

    sys(&mut k, 0, Syscall::Create, [0x4_2000, 0, 0, 0, 0]);
    let worker_tid = args_of(t)[1];
    sys(&mut k, 0, Syscall::Swap, [worker_tid, 0, 0, 0, 0]);

    let w = tcb_of(&k, worker_tid);
    sys(&mut k, 0, Syscall::Detach, [0, 0, 0, 0, 0]);
    unsafe {
        assert!(w.as_ref().orphaned);
        assert!(!w.as_ref().is_proc());
    }
    assert_eq!(args_of(w)[0], OK);

    // detaching twice is an error
    sys(&mut k, 0, Syscall::Detach, [0, 0, 0, 0, 0]);
    assert_eq!(args_of(w)[0], Status::ErrInval.code() as usize);
}

#[test]
fn capability_gates_hold() {
    let mut k = make_kernel(32 * 1024 * 1024);
    let init = k.spawn_init(0, VirtAddr::new(0x10_0000)).unwrap();
    let t = tcb_of(&k, init);

    // strip PROC from init and watch fork bounce
    sys(&mut k, 0, Syscall::ClearCap, [init, CapSet::PROC.bits(), 0, 0, 0]);
    sys(&mut k, 0, Syscall::Fork, [0, 0, 0, 0, 0]);
    assert_eq!(args_of(t)[0], Status::ErrPerm.code() as usize);

    // hand it back, recording the old set
    sys(&mut k, 0, Syscall::SetCap, [init, CapSet::PROC.bits(), 0, 0, 0]);
    let old = args_of(t)[1];
    assert_eq!(old & CapSet::PROC.bits(), 0);

    sys(&mut k, 0, Syscall::GetCap, [init, 0, 0, 0, 0]);
    assert_ne!(args_of(t)[1] & CapSet::PROC.bits(), 0);

    // a capless process cannot mint capabilities
    let srv = new_server(&mut k, 0, 0x20_0000);
    let s = tcb_of(&k, srv);
    unsafe { (*s.as_ptr()).caps = CapSet::empty() };
    k.use_tcb(0, s);
    sys(&mut k, 0, Syscall::SetCap, [srv, CapSet::CAPS.bits(), 0, 0, 0]);
    assert_eq!(args_of(s)[0], Status::ErrPerm.code() as usize);
}

#[test]
fn conf_parameters_read_and_write() {
    let mut k = make_kernel(32 * 1024 * 1024);
    let init = k.spawn_init(0, VirtAddr::new(0x10_0000)).unwrap();
    let t = tcb_of(&k, init);

    sys(&mut k, 0, Syscall::ConfGet, [crate::config::CONF_PAGE_SIZE, 1, 0, 0, 0]);
    assert_eq!(args_of(t)[1], 2 * 1024 * 1024);

    sys(&mut k, 0, Syscall::ConfGet, [crate::config::CONF_RAM_SIZE, 0, 0, 0, 0]);
    assert_eq!(args_of(t)[1], 32 * 1024 * 1024);

    sys(&mut k, 0, Syscall::ConfSet, [
        crate::config::CONF_THREAD_STACK,
        128 * 1024,
        0,
        0,
        0,
    ]);
    assert_eq!(args_of(t)[0], OK);
    assert_eq!(k.conf.thread_stack_size, 128 * 1024);

    // ram usage tracks the physical allocator
    sys(&mut k, 0, Syscall::ConfGet, [crate::config::CONF_RAM_USAGE, 0, 0, 0, 0]);
    assert_eq!(args_of(t)[1], k.mm.pmem.query_used());
}

#[test]
fn out_of_range_syscalls_are_rejected() {
    let mut k = make_kernel(32 * 1024 * 1024);
    let init = k.spawn_init(0, VirtAddr::new(0x10_0000)).unwrap();
    let t = tcb_of(&k, init);

    crate::syscall::handle_syscall(&mut k, 0, 999, [0, 0, 0, 0, 0]);
    assert_eq!(args_of(t)[0], Status::ErrInval.code() as usize);
}

#[test]
fn process_lifetime_conserves_memory() {
    let mut k = make_kernel(48 * 1024 * 1024);
    let init = k.spawn_init(0, VirtAddr::new(0x10_0000)).unwrap();
    let t = tcb_of(&k, init);

    let baseline = k.mm.pmem.query_used();

    // a full process life: fork, switch to the child, allocate, free, exit
    sys(&mut k, 0, Syscall::Fork, [0, 0, 0, 0, 0]);
    let child = args_of(t)[1];
    sys(&mut k, 0, Syscall::Swap, [child, 0, 0, 0, 0]);

    let c = tcb_of(&k, child);
    sys(&mut k, 0, Syscall::ReqMem, [32 * 1024, rw_flags(), 0, 0, 0]);
    let va = args_of(c)[1];
    sys(&mut k, 0, Syscall::FreeMem, [va, 0, 0, 0, 0]);
    assert_eq!(args_of(c)[0], OK);

    sys(&mut k, 0, Syscall::Exit, [init, 0, 0, 0, 0]);
    assert!(k.tcbs.get(child).is_none());

    assert_eq!(k.mm.pmem.query_used(), baseline);
}
