/*
 * Configuration and Power Syscalls
 *
 * Runtime parameters are world-readable; writing takes CAP_CONF, power
 * control takes CAP_POWER.
 */

use core::ptr::NonNull;

use super::numbers::{POWEROFF_COLD_REBOOT, POWEROFF_SHUTDOWN, POWEROFF_WARM_REBOOT};
use super::{Effect, fail};
use crate::arch::PoweroffKind;
use crate::caps::CapSet;
use crate::config::{
    self, CONF_MAX_THREADS, CONF_PAGE_SIZE, CONF_RAM_SIZE, CONF_RAM_USAGE,
    CONF_RPC_STACK, CONF_THREAD_STACK,
};
use crate::kernel::Kernel;
use crate::memory::{BASE_PAGE_SIZE, align_up, orders};
use crate::status::Status;
use crate::thread::rpc;
use crate::thread::tcb::Tcb;

/// conf_get(param, arg) -> (status, value)
pub fn conf_get(k: &mut Kernel, t: NonNull<Tcb>, param: usize, arg: usize) -> Effect {
    let value = match param {
        CONF_THREAD_STACK => k.conf.thread_stack_size,
        CONF_RPC_STACK => k.conf.rpc_stack_size,
        CONF_RAM_USAGE => k.mm.pmem.query_used(),
        CONF_RAM_SIZE => k.ram_size,
        CONF_PAGE_SIZE => {
            if arg >= orders().count() {
                0
            } else {
                orders().size(arg)
            }
        }
        CONF_MAX_THREADS => k.tcbs.capacity(),
        _ => return fail(t, Status::ErrNf),
    };

    rpc::set_args(unsafe { t.as_ref() }, &[Status::Ok.code() as usize, value]);
    Effect::Resume
}

/// conf_set(param, value) -> status
pub fn conf_set(k: &mut Kernel, t: NonNull<Tcb>, param: usize, value: usize) -> Effect {
    if !unsafe { t.as_ref().caps }.has(CapSet::CONF) {
        return fail(t, Status::ErrPerm);
    }

    match param {
        CONF_THREAD_STACK => {
            k.conf.thread_stack_size = align_up(value, BASE_PAGE_SIZE);
        }
        CONF_RPC_STACK => {
            let size = align_up(value, BASE_PAGE_SIZE);
            let layout = config::layout();
            let window =
                layout.rpc_stack_top.as_usize() - layout.rpc_stack_base.as_usize();
            if size > window {
                return fail(t, Status::ErrMisc);
            }

            k.conf.rpc_stack_size = size;
        }
        _ => return fail(t, Status::ErrInval),
    }

    fail(t, Status::Ok)
}

/// poweroff(type); does not return on hardware.
pub fn poweroff(_k: &mut Kernel, t: NonNull<Tcb>, kind: usize) -> Effect {
    if !unsafe { t.as_ref().caps }.has(CapSet::POWER) {
        return fail(t, Status::ErrPerm);
    }

    let kind = match kind {
        POWEROFF_SHUTDOWN => PoweroffKind::Shutdown,
        POWEROFF_COLD_REBOOT => PoweroffKind::ColdReboot,
        POWEROFF_WARM_REBOOT => PoweroffKind::WarmReboot,
        _ => return fail(t, Status::ErrInval),
    };

    Effect::Poweroff(kind)
}

/// sleep(); the hart idles until an interrupt wakes it.
pub fn sleep(_k: &mut Kernel, t: NonNull<Tcb>) -> Effect {
    if !unsafe { t.as_ref().caps }.has(CapSet::POWER) {
        return fail(t, Status::ErrPerm);
    }

    rpc::set_status(unsafe { t.as_ref() }, Status::Ok);
    Effect::Idle
}
