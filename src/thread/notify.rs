/*
 * Notifications
 *
 * Asynchronous events (timer, IRQ, user signal, orphaning) delivered to a
 * thread by pushing a notification-flagged RPC frame and migrating the
 * thread into the process named by its notify_id.
 *
 * Pending events are a bitmask, so multiple posts of one kind coalesce into
 * a single delivery. Signals and orphan notices wait until the thread is
 * back in its root process; timer and IRQ events interrupt a visit too.
 * Delivery also waits for RPC stack headroom, and for threads running on
 * another CPU it is deferred behind an IPI.
 */

use core::ptr::NonNull;

use bitflags::bitflags;

use super::rpc::{self, IpcFlags};
use super::tcb::{Identity, Tcb};
use super::CpuId;
use crate::arch;
use crate::kernel::Kernel;
use crate::syscall::numbers::USER_NOTIFY;

bitflags! {
    /// Pending notification kinds of a thread.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NotifyFlags: usize {
        /// User-posted signal.
        const SIGNAL = 1 << 0;
        /// Timer fired.
        const TIMER = 1 << 1;
        /// Hardware interrupt routed to this thread.
        const IRQ = 1 << 2;
        /// The thread's root process died.
        const ORPHANED = 1 << 3;
    }
}

impl NotifyFlags {
    /// Events delivered even while the thread is mid-RPC. The handler runs
    /// with IRQs disabled until it cooperatively yields.
    pub fn critical() -> NotifyFlags {
        NotifyFlags::TIMER | NotifyFlags::IRQ
    }
}

/// Queue `flags` on `t` and deliver whatever is eligible right now. Called
/// with empty flags to retry queued events at natural delivery points
/// (RPC return, context switch, IPI).
pub fn notify(k: &mut Kernel, cpu: CpuId, t_ptr: NonNull<Tcb>, flags: NotifyFlags) {
    let t = unsafe { &mut *t_ptr.as_ptr() };
    t.notify_flags.insert(flags);

    if t.notify_flags.is_empty() {
        return;
    }

    let Some(r) = k.tcbs.get(t.notify_id) else {
        log::error!("thread {} notify handler unavailable", t.tid);
        t.notify_flags = NotifyFlags::empty();
        return;
    };

    let handler_dead =
        unsafe { (*r.as_ptr()).zombie() || (*r.as_ptr()).callback.is_null() };
    if handler_dead {
        log::error!("thread {} notify callback unavailable", t.tid);
        t.notify_flags = NotifyFlags::empty();
        return;
    }

    // signals wait until the thread is back home; critical events go now
    if !t.notify_flags.intersects(NotifyFlags::critical()) && t.is_rpc() {
        return;
    }

    // wait for stack room and retry at the next delivery point
    if !rpc::enough_rpc_stack(&k.conf, t) {
        return;
    }

    // the thread is busy on another CPU; poke it and let it drain the
    // queue on its own trap entry
    if k.cpus.running(t) && k.cpus.current(cpu) != Some(t_ptr) {
        k.cpus.pending_ipi[t.cpu_id] = true;
        arch::send_ipi(t.cpu_id);
        return;
    }

    let mut deliver = NotifyFlags::empty();
    if !t.is_rpc() {
        deliver |= t.notify_flags & (NotifyFlags::SIGNAL | NotifyFlags::ORPHANED);
    }
    if t.notify_flags.intersects(NotifyFlags::critical()) {
        deliver |= t.notify_flags & NotifyFlags::critical();
        arch::disable_irqs();
    }

    if deliver.is_empty() {
        return;
    }

    // an idle recipient is taken over; a current one just migrates
    if k.cpus.current(cpu) != Some(t_ptr) {
        k.use_tcb(cpu, t_ptr);
    }

    // sender 0 marks the kernel itself
    let args = [0, t.tid, USER_NOTIFY, deliver.bits(), t.eid, 0];
    let frame = match rpc::enter_rpc(&mut k.mm, t, args, IpcFlags::NOTIFY) {
        Ok(frame) => frame,
        Err(e) => {
            log::error!("notification frame push failed: {}", e);
            return;
        }
    };

    let target_rid = unsafe { (*r.as_ptr()).rid };
    rpc::finalize_rpc(t, r, frame);
    let id = Identity {
        eid: t.eid,
        pid: t.pid,
    }
    .on_fwd(target_rid);
    t.set_identity(id);

    t.notify_flags.remove(deliver);
}
