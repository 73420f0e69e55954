/*
 * Process and Thread Syscalls
 *
 * Creation, duplication, destruction and CPU handover. The kernel has no
 * scheduler; userspace moves the CPU around explicitly with swap, and exit
 * optionally hands the CPU to a chosen successor.
 */

use core::ptr::NonNull;

use super::{Effect, fail};
use crate::caps::CapSet;
use crate::kernel::Kernel;
use crate::memory::address_space;
use crate::memory::region::find_used_region;
use crate::memory::{VirtAddr, VmFlags};
use crate::status::Status;
use crate::thread::notify::{self, NotifyFlags};
use crate::thread::rpc;
use crate::thread::tcb::{self, Tcb};
use crate::thread::{CpuId, Tid};

/// create(func, d0..d3) -> (status, new_tid)
///
/// The new thread joins the caller's process and starts at `func` with its
/// own tid and the payload in its argument registers.
pub fn create(k: &mut Kernel, t: NonNull<Tcb>, func: usize, data: [usize; 4]) -> Effect {
    let Some(c) = tcb::create_thread(&mut k.mm, &mut k.tcbs, Some(t)) else {
        return fail(t, Status::ErrOomem);
    };

    if tcb::alloc_stack(&mut k.mm, &k.tcbs, c, k.conf.thread_stack_size).is_err() {
        tcb::destroy_thread(&mut k.mm, &k.tcbs, c);
        return fail(t, Status::ErrOomem);
    }

    unsafe {
        let cp = c.as_ptr();
        (*cp).exec = VirtAddr::new(func);

        if let Some(regs) = rpc::regs_of(&*cp) {
            let regs = regs.as_ptr();
            (*regs).set_args(&[(*cp).tid, data[0], data[1], data[2], data[3]]);
            (*regs).sp = (*cp).thread_stack.add((*cp).thread_stack_size).as_usize();
        }

        rpc::set_args(t.as_ref(), &[Status::Ok.code() as usize, (*cp).tid]);
    }

    Effect::Resume
}

/// fork() -> parent: (status, child_pid); child: (status, 0, parent_pid)
pub fn fork(k: &mut Kernel, t: NonNull<Tcb>) -> Effect {
    if !unsafe { t.as_ref().caps }.has(CapSet::PROC) {
        return fail(t, Status::ErrPerm);
    }

    let parent_eid = unsafe { t.as_ref().eid };
    let Some(parent) = k.tcbs.get(parent_eid) else {
        return fail(t, Status::ErrInval);
    };

    let Some(n) = tcb::create_proc(&mut k.mm, &mut k.tcbs, Some(parent)) else {
        return fail(t, Status::ErrOomem);
    };

    unsafe {
        let np = n.as_ptr();
        (*np).notify_id = t.as_ref().notify_id;

        // the child picks these up when it is first scheduled
        rpc::set_args(&*np, &[Status::Ok.code() as usize, 0, parent_eid]);

        rpc::set_args(t.as_ref(), &[Status::Ok.code() as usize, (*np).pid]);
    }

    Effect::Resume
}

/// exec(bin, interp) -> status; on success the process restarts at the new
/// image and the syscall does not logically return.
///
/// The TCB survives an exec: identity, capabilities and kernel stack stay,
/// only userspace state is reset.
pub fn exec(k: &mut Kernel, t: NonNull<Tcb>, bin: usize, interp: usize) -> Effect {
    let Some(loader) = k.loader else {
        return fail(t, Status::ErrNoInit);
    };

    let eid = unsafe { t.as_ref().eid };
    let Some(proc) = k.tcbs.get(eid) else {
        return fail(t, Status::ErrInval);
    };

    let bin_va = VirtAddr::new(bin);
    let interp_va = VirtAddr::new(interp);

    {
        let Kernel { mm, tcbs, .. } = k;
        let uv = unsafe { &mut (*proc.as_ptr()).uvmem };

        // keep the binary (and interpreter) mapped across the teardown
        let Some(b) = find_used_region(&uv.region, bin_va) else {
            return fail(t, Status::ErrInval);
        };
        unsafe { (*b).flags.insert(VmFlags::KEEP) };

        let i = if interp != 0 {
            let Some(i) = find_used_region(&uv.region, interp_va) else {
                unsafe { (*b).flags.remove(VmFlags::KEEP) };
                return fail(t, Status::ErrInval);
            };
            unsafe { (*i).flags.insert(VmFlags::KEEP) };
            Some(i)
        } else {
            None
        };

        let mut on_unref = tcb::unref_sink(tcbs);
        address_space::clear_uvmem(mm, uv, &mut on_unref);

        unsafe {
            (*b).flags.remove(VmFlags::KEEP);
            if let Some(i) = i {
                (*i).flags.remove(VmFlags::KEEP);
            }
        }
    }

    let caller = unsafe { t.as_ref().tid };
    let target = unsafe { proc.as_ref().tid };
    let res = loader(k, caller, target, bin_va, interp_va);
    fail(t, res)
}

/// spawn(bin, interp) -> (status, new_pid)
pub fn spawn(k: &mut Kernel, t: NonNull<Tcb>, bin: usize, interp: usize) -> Effect {
    if !unsafe { t.as_ref().caps }.has(CapSet::PROC) {
        return fail(t, Status::ErrPerm);
    }

    let Some(loader) = k.loader else {
        return fail(t, Status::ErrNoInit);
    };

    let Some(n) = tcb::create_proc(&mut k.mm, &mut k.tcbs, None) else {
        return fail(t, Status::ErrOomem);
    };

    let (new_pid, caller) = unsafe {
        let np = n.as_ptr();
        (*np).notify_id = t.as_ref().notify_id;
        ((*np).pid, t.as_ref().tid)
    };

    let res = loader(k, caller, new_pid, VirtAddr::new(bin), VirtAddr::new(interp));
    rpc::set_args(unsafe { t.as_ref() }, &[res.code() as usize, new_pid]);
    Effect::Resume
}

/// kill(tid) -> status
pub fn kill(k: &mut Kernel, t: NonNull<Tcb>, tid: Tid) -> Effect {
    if !unsafe { t.as_ref().caps }.has(CapSet::PROC) {
        return fail(t, Status::ErrPerm);
    }

    let Some(r) = k.tcbs.get(tid) else {
        return fail(t, Status::ErrInval);
    };

    if !unsafe { r.as_ref().is_proc() } {
        return fail(t, Status::ErrInval);
    }

    // a root thread still on a CPU or away mid-RPC unwinds on its own
    let still_running =
        unsafe { k.cpus.running(r.as_ref()) || r.as_ref().is_rpc() || r == t };
    let res = tcb::destroy_proc(&mut k.mm, &k.tcbs, r, still_running);
    fail(t, res)
}

/// Hand the CPU over. Shared by swap and exit.
fn switch_to(k: &mut Kernel, cpu: CpuId, s: NonNull<Tcb>) -> Effect {
    k.use_tcb(cpu, s);

    unsafe {
        let sp = s.as_ptr();
        if (*sp).orphaned && !(*sp).is_rpc() {
            // an orphan out of frames has nothing to run in
            k.cpus.set_current(cpu, core::ptr::null_mut());
            tcb::destroy_thread(&mut k.mm, &k.tcbs, s);
            return Effect::Idle;
        }

        if !(*sp).notify_flags.is_empty() {
            notify::notify(k, cpu, s, NotifyFlags::empty());
        }
    }

    Effect::Resume
}

/// swap(tid) -> status on the old thread; the CPU continues on the new one.
pub fn swap(k: &mut Kernel, cpu: CpuId, t: NonNull<Tcb>, tid: Tid) -> Effect {
    if !unsafe { t.as_ref().caps }.has(CapSet::PROC) {
        return fail(t, Status::ErrPerm);
    }

    let Some(s) = k.tcbs.get(tid) else {
        return fail(t, Status::ErrInval);
    };

    if unsafe { s.as_ref().zombie() } {
        return fail(t, Status::ErrNf);
    }

    if k.cpus.running(unsafe { s.as_ref() }) {
        return fail(t, Status::ErrExt);
    }

    rpc::set_status(unsafe { t.as_ref() }, Status::Ok);
    switch_to(k, cpu, s)
}

/// exit(tid) -> destroys the calling thread; with a nonzero tid the CPU
/// moves there first, otherwise the hart goes idle.
pub fn exit(k: &mut Kernel, cpu: CpuId, t: NonNull<Tcb>, tid: Tid) -> Effect {
    let mut effect = Effect::Idle;

    if tid != 0 {
        let Some(s) = k.tcbs.get(tid) else {
            return fail(t, Status::ErrInval);
        };

        if unsafe { s.as_ref().zombie() } {
            return fail(t, Status::ErrNf);
        }

        if k.cpus.running(unsafe { s.as_ref() }) {
            return fail(t, Status::ErrExt);
        }

        effect = switch_to(k, cpu, s);
    } else if k.cpus.current(cpu) == Some(t) {
        k.cpus.set_current(cpu, core::ptr::null_mut());
    }

    unsafe {
        if t.as_ref().is_proc() {
            // the exiting root thread is done executing
            tcb::destroy_proc(&mut k.mm, &k.tcbs, t, false);
        } else {
            tcb::destroy_thread(&mut k.mm, &k.tcbs, t);
        }
    }

    effect
}

/// detach() -> status; the thread voluntarily orphans itself from its root
/// process and keeps running wherever it currently is.
pub fn detach(k: &mut Kernel, cpu: CpuId, t: NonNull<Tcb>) -> Effect {
    if !unsafe { t.as_ref().caps }.has(CapSet::PROC) {
        return fail(t, Status::ErrPerm);
    }

    let tp = t.as_ptr();
    unsafe {
        if (*tp).orphaned {
            return fail(t, Status::ErrInval);
        }

        // result first: the orphan notice below may migrate the thread
        rpc::set_status(&*tp, Status::Ok);
        rpc::orphanize(&mut *tp);
    }

    notify::notify(k, cpu, t, NotifyFlags::empty());
    Effect::Resume
}
