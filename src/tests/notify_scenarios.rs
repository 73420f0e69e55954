/*
 * Notification Scenarios
 *
 * Delivery through notification frames, coalescing of repeated posts and
 * deferral while the recipient is away on RPC.
 */

use super::support::{args_of, make_kernel, new_server, sys, tcb_of};
use crate::memory::VirtAddr;
use crate::syscall::numbers::{Syscall, USER_NOTIFY};
use crate::thread::notify::NotifyFlags;

#[test]
fn self_signal_runs_the_handler_frame() {
    let mut k = make_kernel(32 * 1024 * 1024);
    let init = k.spawn_init(0, VirtAddr::new(0x10_0000)).unwrap();
    let t = tcb_of(&k, init);

    // init handles its own notifications once it registers a callback
    sys(&mut k, 0, Syscall::IpcServer, [0x30_0000, 0, 0, 0, 0]);
    sys(&mut k, 0, Syscall::IpcNotify, [init, 0, 0, 0, 0]);

    unsafe {
        let tr = t.as_ref();
        assert!(tr.is_rpc());
        assert_eq!(tr.exec, VirtAddr::new(0x30_0000));
        assert!(tr.notify_flags.is_empty());
    }

    // the handler frame carries (0, tid, USER_NOTIFY, flags, eid)
    let args = args_of(t);
    assert_eq!(args[0], 0);
    assert_eq!(args[1], init);
    assert_eq!(args[2], USER_NOTIFY);
    assert_eq!(args[3], NotifyFlags::SIGNAL.bits());
    assert_eq!(args[4], init);

    // finishing the handler returns to the interrupted context
    sys(&mut k, 0, Syscall::IpcResp, [0, 0, 0, 0, 0]);
    unsafe {
        assert!(!t.as_ref().is_rpc());
        assert_eq!(t.as_ref().pid, init);
    }
}

#[test]
fn signals_coalesce_and_wait_for_home() {
    let mut k = make_kernel(32 * 1024 * 1024);
    let init = k.spawn_init(0, VirtAddr::new(0x10_0000)).unwrap();
    let srv = new_server(&mut k, 0, 0x20_0000);
    let t = tcb_of(&k, init);

    sys(&mut k, 0, Syscall::IpcServer, [0x30_0000, 0, 0, 0, 0]);

    // go visiting; signals posted meanwhile stay queued
    sys(&mut k, 0, Syscall::IpcReq, [srv, 0, 0, 0, 0]);
    k.post_notification(0, init, NotifyFlags::SIGNAL);
    k.post_notification(0, init, NotifyFlags::SIGNAL);

    unsafe {
        assert_eq!(t.as_ref().pid, srv);
        assert_eq!(t.as_ref().notify_flags, NotifyFlags::SIGNAL);
    }

    // returning home delivers exactly one coalesced signal
    sys(&mut k, 0, Syscall::IpcResp, [0, 0, 0, 0, 0]);
    unsafe {
        let tr = t.as_ref();
        assert!(tr.is_rpc());
        assert_eq!(tr.exec, VirtAddr::new(0x30_0000));
        assert!(tr.notify_flags.is_empty());
    }
    assert_eq!(args_of(t)[3], NotifyFlags::SIGNAL.bits());
}

#[test]
fn timer_interrupts_a_visit() {
    let mut k = make_kernel(32 * 1024 * 1024);
    let init = k.spawn_init(0, VirtAddr::new(0x10_0000)).unwrap();
    let srv = new_server(&mut k, 0, 0x20_0000);
    let t = tcb_of(&k, init);

    sys(&mut k, 0, Syscall::IpcServer, [0x30_0000, 0, 0, 0, 0]);
    sys(&mut k, 0, Syscall::IpcReq, [srv, 0, 0, 0, 0]);
    let visiting_stack = unsafe { t.as_ref().rpc_stack };

    // timers do not wait for the thread to come home
    k.post_notification(0, init, NotifyFlags::TIMER);

    unsafe {
        let tr = t.as_ref();
        assert!(tr.notify_flags.is_empty());
        assert_eq!(tr.exec, VirtAddr::new(0x30_0000));
        assert!(tr.rpc_stack < visiting_stack);
    }
    assert_eq!(args_of(t)[3], NotifyFlags::TIMER.bits());

    // handler finishes, the thread is back in the visited server
    sys(&mut k, 0, Syscall::IpcResp, [0, 0, 0, 0, 0]);
    unsafe {
        assert_eq!(t.as_ref().pid, srv);
        assert_eq!(t.as_ref().rpc_stack, visiting_stack);
    }
}

#[test]
fn missing_handler_drops_the_queue() {
    let mut k = make_kernel(32 * 1024 * 1024);
    let init = k.spawn_init(0, VirtAddr::new(0x10_0000)).unwrap();
    let t = tcb_of(&k, init);

    // no callback registered anywhere
    k.post_notification(0, init, NotifyFlags::SIGNAL);
    unsafe {
        assert!(t.as_ref().notify_flags.is_empty());
        assert!(!t.as_ref().is_rpc());
    }
}

#[test]
fn irq_routes_to_registered_thread() {
    let mut k = make_kernel(32 * 1024 * 1024);
    let init = k.spawn_init(0, VirtAddr::new(0x10_0000)).unwrap();
    let t = tcb_of(&k, init);

    sys(&mut k, 0, Syscall::IpcServer, [0x30_0000, 0, 0, 0, 0]);
    sys(&mut k, 0, Syscall::IrqReq, [9, 0, 0, 0, 0]);
    assert_eq!(args_of(t)[0], 0);

    k.handle_irq(0, 9);
    unsafe {
        assert!(t.as_ref().is_rpc());
    }
    assert_eq!(args_of(t)[3], NotifyFlags::IRQ.bits());
}
