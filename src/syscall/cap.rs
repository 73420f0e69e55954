/*
 * Capability Syscalls
 *
 * Changing anyone's capability set takes CAP_CAPS; reading is free. All
 * three report the target's previous set.
 */

use core::ptr::NonNull;

use super::{Effect, fail};
use crate::caps::CapSet;
use crate::kernel::Kernel;
use crate::status::Status;
use crate::thread::rpc;
use crate::thread::tcb::Tcb;
use crate::thread::Tid;

/// set_cap(tid, caps) -> (status, old_caps)
pub fn set_cap(k: &mut Kernel, t: NonNull<Tcb>, tid: Tid, caps: usize) -> Effect {
    if !unsafe { t.as_ref().caps }.has(CapSet::CAPS) {
        return fail(t, Status::ErrPerm);
    }

    let Some(c) = k.tcbs.get(tid) else {
        return fail(t, Status::ErrNf);
    };

    let old = unsafe {
        let cp = c.as_ptr();
        let old = (*cp).caps;
        (*cp).caps.insert(CapSet::from_bits_truncate(caps));
        old
    };

    rpc::set_args(unsafe { t.as_ref() }, &[
        Status::Ok.code() as usize,
        old.bits(),
    ]);
    Effect::Resume
}

/// get_cap(tid) -> (status, caps)
pub fn get_cap(k: &mut Kernel, t: NonNull<Tcb>, tid: Tid) -> Effect {
    let Some(c) = k.tcbs.get(tid) else {
        return fail(t, Status::ErrNf);
    };

    let caps = unsafe { c.as_ref().caps };
    rpc::set_args(unsafe { t.as_ref() }, &[
        Status::Ok.code() as usize,
        caps.bits(),
    ]);
    Effect::Resume
}

/// clear_cap(tid, caps) -> (status, old_caps)
pub fn clear_cap(k: &mut Kernel, t: NonNull<Tcb>, tid: Tid, caps: usize) -> Effect {
    if !unsafe { t.as_ref().caps }.has(CapSet::CAPS) {
        return fail(t, Status::ErrPerm);
    }

    let Some(c) = k.tcbs.get(tid) else {
        return fail(t, Status::ErrNf);
    };

    let old = unsafe {
        let cp = c.as_ptr();
        let old = (*cp).caps;
        (*cp).caps.remove(CapSet::from_bits_truncate(caps));
        old
    };

    rpc::set_args(unsafe { t.as_ref() }, &[
        Status::Ok.code() as usize,
        old.bits(),
    ]);
    Effect::Resume
}
