/*
 * IPC Syscalls
 *
 * The migrating-thread call surface: req/fwd push a frame, tail/kick reuse
 * the caller's frame so the response skips the current host, resp pops. The
 * handler runs as the calling thread inside the target's address space,
 * entered at the callback the target registered with ipc_server.
 */

use core::ptr::NonNull;

use super::{Effect, fail};
use crate::caps::CapSet;
use crate::kernel::Kernel;
use crate::status::Status;
use crate::thread::notify::{self, NotifyFlags};
use crate::thread::rpc::{self, IpcFlags, LeaveOutcome};
use crate::thread::tcb::{self, Tcb};
use crate::thread::{CpuId, Tid};

/// Common worker for all four migrating flavors.
fn do_ipc(
    k: &mut Kernel,
    _cpu: CpuId,
    t_ptr: NonNull<Tcb>,
    pid: Tid,
    data: [usize; 4],
    flags: IpcFlags,
) -> Effect {
    let t = unsafe { &mut *t_ptr.as_ptr() };

    if !rpc::enough_rpc_stack(&k.conf, t) {
        return fail(t_ptr, Status::ErrOomem);
    }

    let Some(r) = k.tcbs.get(pid) else {
        return fail(t_ptr, Status::ErrInval);
    };

    let (target_ok, target_rid, callback) = unsafe {
        let r = r.as_ptr();
        ((*r).is_proc() && !(*r).zombie(), (*r).rid, (*r).callback)
    };

    if !target_ok {
        return fail(t_ptr, Status::ErrInval);
    }

    if callback.is_null() {
        return fail(t_ptr, Status::ErrNoInit);
    }

    // a reused frame abandons the current host for good; its visit
    // reference goes with it
    if flags.contains(IpcFlags::TAIL)
        && t.is_rpc()
        && let Some(host) = k.tcbs.get(t.pid)
    {
        tcb::unreference_proc(&mut k.mm, &k.tcbs, host);
    }

    // the handler sees who is effectively asking, before any id moves
    let args = [t.eid, t.tid, data[0], data[1], data[2], data[3]];

    let frame = match rpc::enter_rpc(&mut k.mm, t, args, flags) {
        Ok(frame) => frame,
        Err(e) => return fail(t_ptr, e),
    };

    rpc::finalize_rpc(t, r, frame);

    let id = t.identity();
    t.set_identity(if flags.contains(IpcFlags::FORWARD) {
        id.on_fwd(target_rid)
    } else {
        id.on_req(target_rid)
    });

    Effect::Resume
}

/// ipc_req(pid, d0..d3): plain request.
pub fn ipc_req(
    k: &mut Kernel,
    cpu: CpuId,
    t: NonNull<Tcb>,
    pid: Tid,
    data: [usize; 4],
) -> Effect {
    do_ipc(k, cpu, t, pid, data, IpcFlags::empty())
}

/// ipc_fwd(pid, d0..d3): request on behalf of the original caller.
pub fn ipc_fwd(
    k: &mut Kernel,
    cpu: CpuId,
    t: NonNull<Tcb>,
    pid: Tid,
    data: [usize; 4],
) -> Effect {
    do_ipc(k, cpu, t, pid, data, IpcFlags::FORWARD)
}

/// ipc_tail(pid, d0..d3): hand the conversation over; the response goes to
/// our own caller.
pub fn ipc_tail(
    k: &mut Kernel,
    cpu: CpuId,
    t: NonNull<Tcb>,
    pid: Tid,
    data: [usize; 4],
) -> Effect {
    do_ipc(k, cpu, t, pid, data, IpcFlags::TAIL)
}

/// ipc_kick(pid, d0..d3): tail variant that keeps the effective id.
pub fn ipc_kick(
    k: &mut Kernel,
    cpu: CpuId,
    t: NonNull<Tcb>,
    pid: Tid,
    data: [usize; 4],
) -> Effect {
    do_ipc(k, cpu, t, pid, data, IpcFlags::TAIL | IpcFlags::FORWARD)
}

/// ipc_resp(d0..d3): pop the current frame; the caller sees
/// (OK, responder, d0..d3).
pub fn ipc_resp(k: &mut Kernel, cpu: CpuId, t_ptr: NonNull<Tcb>, data: [usize; 4]) -> Effect {
    let t = unsafe { &mut *t_ptr.as_ptr() };

    if !t.is_rpc() {
        // responding without a frame is a userspace bug
        return fail(t_ptr, Status::ErrMisc);
    }

    // the visit is over, drop the hold on the host process
    if let Some(host) = k.tcbs.get(t.pid) {
        tcb::unreference_proc(&mut k.mm, &k.tcbs, host);
    }

    let ret = [
        Status::Ok.code() as usize,
        t.pid,
        data[0],
        data[1],
        data[2],
        data[3],
    ];

    match rpc::leave_rpc(k, cpu, t_ptr, Some(ret)) {
        LeaveOutcome::Resumed => Effect::Resume,
        LeaveOutcome::Destroyed => Effect::Idle,
    }
}

/// ipc_server(callback): register the current process's RPC entry point.
/// Address 0 unregisters.
pub fn ipc_server(k: &mut Kernel, t: NonNull<Tcb>, callback: usize) -> Effect {
    let pid = unsafe { t.as_ref().pid };
    let Some(proc) = k.tcbs.get(pid) else {
        return fail(t, Status::ErrInval);
    };

    unsafe {
        (*proc.as_ptr()).callback = crate::memory::VirtAddr::new(callback);
    }

    fail(t, Status::Ok)
}

/// ipc_notify(tid): queue a signal for a thread. Notifying anyone but
/// yourself takes CAP_NOTIFY.
pub fn ipc_notify(k: &mut Kernel, cpu: CpuId, t: NonNull<Tcb>, tid: Tid) -> Effect {
    let (own_tid, caps) = unsafe {
        let t = t.as_ref();
        (t.tid, t.caps)
    };

    if tid != own_tid && !caps.has(CapSet::NOTIFY) {
        return fail(t, Status::ErrPerm);
    }

    let Some(r) = k.tcbs.get(tid) else {
        return fail(t, Status::ErrInval);
    };

    // set our result first: delivery may migrate this thread or switch the
    // CPU away, and the args must be waiting when we are next scheduled
    rpc::set_status(unsafe { t.as_ref() }, Status::Ok);
    notify::notify(k, cpu, r, NotifyFlags::SIGNAL);

    Effect::Resume
}
