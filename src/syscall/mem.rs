/*
 * Memory Syscalls
 *
 * Allocation requests land in the caller's *effective* process: a server
 * handling a forwarded request allocates into the original caller's address
 * space, which is the point of ipc_fwd.
 */

use core::ptr::NonNull;

use super::{Effect, fail};
use crate::caps::CapSet;
use crate::kernel::Kernel;
use crate::memory::address_space;
use crate::memory::{PhysAddr, VirtAddr, VmFlags};
use crate::status::Status;
use crate::thread::rpc;
use crate::thread::tcb::{self, Tcb};

/// The effective process thread of the caller, the one memory operations
/// act on.
fn eff_proc(k: &Kernel, t: NonNull<Tcb>) -> Option<NonNull<Tcb>> {
    let proc = k.tcbs.get(unsafe { t.as_ref().eid })?;
    if unsafe { proc.as_ref().zombie() } {
        return None;
    }

    Some(proc)
}

/// req_mem(size, flags) -> (status, va)
pub fn req_mem(k: &mut Kernel, t: NonNull<Tcb>, size: usize, flags: usize) -> Effect {
    let Some(proc) = eff_proc(k, t) else {
        return fail(t, Status::ErrInval);
    };

    let flags = VmFlags::from_bits_truncate(flags).sanitize_user();
    let uv = unsafe { &mut (*proc.as_ptr()).uvmem };
    match address_space::alloc_uvmem(&mut k.mm, uv, size, flags) {
        Ok((va, _)) => {
            rpc::set_args(unsafe { t.as_ref() }, &[
                Status::Ok.code() as usize,
                va.as_usize(),
            ]);
            Effect::ResumeFlush
        }
        Err(_) => fail(t, Status::ErrOomem),
    }
}

/// req_fixmem(fixed_va, size, flags) -> (status, va)
pub fn req_fixmem(
    k: &mut Kernel,
    t: NonNull<Tcb>,
    fixed: usize,
    size: usize,
    flags: usize,
) -> Effect {
    let Some(proc) = eff_proc(k, t) else {
        return fail(t, Status::ErrInval);
    };

    let flags = VmFlags::from_bits_truncate(flags).sanitize_user();
    let uv = unsafe { &mut (*proc.as_ptr()).uvmem };
    match address_space::alloc_fixed_uvmem(&mut k.mm, uv, VirtAddr::new(fixed), size, flags)
    {
        Ok((va, _)) => {
            rpc::set_args(unsafe { t.as_ref() }, &[
                Status::Ok.code() as usize,
                va.as_usize(),
            ]);
            Effect::ResumeFlush
        }
        Err(_) => fail(t, Status::ErrOomem),
    }
}

/// req_pmem(paddr, size, flags) -> (status, va)
pub fn req_pmem(
    k: &mut Kernel,
    t: NonNull<Tcb>,
    paddr: usize,
    size: usize,
    flags: usize,
) -> Effect {
    let Some(proc) = eff_proc(k, t) else {
        return fail(t, Status::ErrInval);
    };

    let flags = VmFlags::from_bits_truncate(flags).sanitize_user();
    let uv = unsafe { &mut (*proc.as_ptr()).uvmem };
    match address_space::alloc_devmem(&mut k.mm, uv, PhysAddr::new(paddr), size, flags) {
        Ok((va, _)) => {
            rpc::set_args(unsafe { t.as_ref() }, &[
                Status::Ok.code() as usize,
                va.as_usize(),
            ]);
            Effect::ResumeFlush
        }
        Err(e) => fail(t, e),
    }
}

/// req_sharedmem(size, flags) -> (status, va, actual_size)
pub fn req_sharedmem(k: &mut Kernel, t: NonNull<Tcb>, size: usize, flags: usize) -> Effect {
    if !unsafe { t.as_ref().caps }.has(CapSet::SHARED) {
        return fail(t, Status::ErrPerm);
    }

    let Some(proc) = eff_proc(k, t) else {
        return fail(t, Status::ErrInval);
    };

    let flags = VmFlags::from_bits_truncate(flags).sanitize_user();
    let uv = unsafe { &mut (*proc.as_ptr()).uvmem };
    match address_space::alloc_shared_uvmem(&mut k.mm, uv, size, flags) {
        Ok((va, asize)) => {
            rpc::set_args(unsafe { t.as_ref() }, &[
                Status::Ok.code() as usize,
                va.as_usize(),
                asize,
            ]);
            Effect::ResumeFlush
        }
        Err(_) => fail(t, Status::ErrOomem),
    }
}

/// ref_sharedmem(owner_tid, owner_va, flags) -> (status, va, actual_size)
pub fn ref_sharedmem(
    k: &mut Kernel,
    t: NonNull<Tcb>,
    owner_tid: usize,
    owner_va: usize,
    flags: usize,
) -> Effect {
    if !unsafe { t.as_ref().caps }.has(CapSet::SHARED) {
        return fail(t, Status::ErrPerm);
    }

    let Some(owner) = k.tcbs.get(owner_tid) else {
        return fail(t, Status::ErrInval);
    };

    // the region lives in the owner's root process
    let owner_rid = unsafe { owner.as_ref().rid };
    let Some(owner_root) = k.tcbs.get(owner_rid) else {
        return fail(t, Status::ErrInval);
    };
    if unsafe { owner_root.as_ref().zombie() } {
        return fail(t, Status::ErrInval);
    }

    let Some(proc) = eff_proc(k, t) else {
        return fail(t, Status::ErrInval);
    };

    // referencing your own region would alias the bookkeeping
    if proc == owner_root {
        return fail(t, Status::ErrInval);
    }

    let flags = VmFlags::from_bits_truncate(flags).sanitize_user();
    let dst = unsafe { &mut (*proc.as_ptr()).uvmem };
    let src = unsafe { &mut (*owner_root.as_ptr()).uvmem };
    match address_space::ref_shared_uvmem(
        &mut k.mm,
        dst,
        src,
        owner_rid,
        VirtAddr::new(owner_va),
        flags,
    ) {
        Ok((va, asize)) => {
            // the reference keeps the owner process alive
            tcb::reference_proc(owner_root);
            rpc::set_args(unsafe { t.as_ref() }, &[
                Status::Ok.code() as usize,
                va.as_usize(),
                asize,
            ]);
            Effect::ResumeFlush
        }
        Err(e) => fail(t, e),
    }
}

/// free_mem(va) -> (status)
pub fn free_mem(k: &mut Kernel, t: NonNull<Tcb>, va: usize) -> Effect {
    let Some(proc) = eff_proc(k, t) else {
        return fail(t, Status::ErrInval);
    };

    let Kernel { mm, tcbs, .. } = k;
    let mut on_unref = tcb::unref_sink(tcbs);
    let uv = unsafe { &mut (*proc.as_ptr()).uvmem };
    let res = address_space::free_uvmem(mm, uv, VirtAddr::new(va), &mut on_unref);
    if res.is_err() {
        return fail(t, res);
    }

    rpc::set_status(unsafe { t.as_ref() }, Status::Ok);
    Effect::ResumeFlush
}
