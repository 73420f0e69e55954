/*
 * RPC Stack
 *
 * The migrating-thread call machinery. Each thread owns a private window of
 * user address space, [rpc_stack_base, rpc_stack_top), mapped only in its
 * rpc overlay table. Every call into another process consumes one page of
 * the window, growing down: the page holds a CallCtx record at its top with
 * the register save area directly below, and the rest is the handler's
 * stack. tcb.rpc_stack points at the bottom of the deepest frame; the empty
 * sentinel is the window top.
 *
 * Pages above the current frame belong to the callers and are made
 * inaccessible to userspace for the duration of the visit by dropping their
 * USER bit.
 *
 * All address arithmetic on the window is confined to this module; the rest
 * of the kernel moves through enter_rpc/finalize_rpc/leave_rpc.
 */

use core::ptr::NonNull;

use bitflags::bitflags;

use super::notify::{self, NotifyFlags};
use super::tcb::{self, Identity, Regs, Tcb};
use super::{CpuId, Tid};
use crate::config::{self, RuntimeConf};
use crate::kernel::Kernel;
use crate::memory::region::Mm;
use crate::memory::{BASE_PAGE, BASE_PAGE_SIZE, VirtAddr, VmFlags, physmap};
use crate::status::Status;

/// Call frame record at the top of each RPC stack frame. Successive frames
/// chain through `rpc_stack` back to the empty sentinel.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CallCtx {
    /// Userspace PC to resume the caller at.
    pub exec: VirtAddr,
    /// Caller-side identity.
    pub pid: Tid,
    pub eid: Tid,
    /// Value of tcb.rpc_stack before this frame was pushed.
    pub rpc_stack: VirtAddr,
    /// Frame was pushed to deliver a notification; it carries no response.
    pub notify: bool,
}

bitflags! {
    /// IPC call flavors, combined by the syscall layer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IpcFlags: u32 {
        /// Reuse the current frame instead of pushing; the response then
        /// lands at the caller's caller.
        const TAIL = 1 << 0;
        /// Keep the effective id of the original caller.
        const FORWARD = 1 << 1;
        /// Notification delivery frame.
        const NOTIFY = 1 << 2;
    }
}

/// What leave_rpc did with the thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// Thread resumes in the restored frame's process.
    Resumed,
    /// Thread was an orphan out of frames and has been destroyed.
    Destroyed,
}

/// The empty-stack sentinel test.
pub fn stack_empty(rpc_stack: VirtAddr) -> bool {
    rpc_stack >= config::layout().rpc_stack_top
}

/// Top of the usable window: where the next frame would end.
pub fn rpc_position(t: &Tcb) -> VirtAddr {
    t.rpc_stack
}

/// Room for one more frame page plus the configured handler headroom?
pub fn enough_rpc_stack(conf: &RuntimeConf, t: &Tcb) -> bool {
    let position = rpc_position(t).as_usize();
    match position.checked_sub(BASE_PAGE_SIZE + conf.rpc_stack_size) {
        Some(bottom) => bottom >= config::layout().rpc_stack_base.as_usize(),
        None => false,
    }
}

/// Resolve a window address through the thread's rpc table. The range must
/// not cross a page boundary.
fn resolve_window(t: &Tcb, va: VirtAddr, len: usize) -> Option<NonNull<u8>> {
    let page = va.align_down(BASE_PAGE_SIZE);
    debug_assert!(va.as_usize() + len <= page.as_usize() + BASE_PAGE_SIZE);

    let (pa, _, _) = t.rpc_vmem.stat_vpage(page).ok()?;
    let offset = va.as_usize() - page.as_usize();
    NonNull::new(unsafe { physmap::phys_ptr::<u8>(pa.add(offset)) })
}

/// The register save area a trap return would restore from: directly below
/// tcb.regs. tcb.regs only ever takes two kinds of values, the address of
/// the TCB itself (trap context on the kernel stack page) or a CallCtx
/// address inside the RPC window; everything not the TCB goes through the
/// rpc table.
pub fn regs_of(t: &Tcb) -> Option<NonNull<Regs>> {
    if t.regs.is_null() {
        return None;
    }

    let base = t.regs.sub(size_of::<Regs>());
    if t.regs.as_usize() == t as *const Tcb as usize {
        NonNull::new(base.as_usize() as *mut Regs)
    } else {
        resolve_window(t, base, size_of::<Regs>()).map(NonNull::cast)
    }
}

/// Write the return/argument registers of a thread.
pub fn set_args(t: &Tcb, vals: &[usize]) {
    let Some(regs) = regs_of(t) else {
        panic!("thread {} has no register save area", t.tid);
    };

    unsafe { (*regs.as_ptr()).set_args(vals) };
}

/// Shorthand for reporting a bare status.
pub fn set_status(t: &Tcb, status: Status) {
    set_args(t, &[status.code() as usize]);
}

/// Read back a thread's argument registers.
pub fn get_args(t: &Tcb) -> [usize; 6] {
    let Some(regs) = regs_of(t) else {
        panic!("thread {} has no register save area", t.tid);
    };

    unsafe { (*regs.as_ptr()).args() }
}

fn ctx_va(position: VirtAddr) -> VirtAddr {
    position.sub(size_of::<CallCtx>())
}

fn read_ctx(t: &Tcb, position: VirtAddr) -> CallCtx {
    let va = ctx_va(position);
    let Some(p) = resolve_window(t, va, size_of::<CallCtx>()) else {
        panic!("rpc frame at {} is not mapped", va);
    };

    unsafe { p.cast::<CallCtx>().as_ptr().read() }
}

fn write_ctx(t: &Tcb, position: VirtAddr, ctx: CallCtx) {
    let va = ctx_va(position);
    let Some(p) = resolve_window(t, va, size_of::<CallCtx>()) else {
        panic!("rpc frame at {} is not mapped", va);
    };

    unsafe { p.cast::<CallCtx>().as_ptr().write(ctx) };
}

/// Make sure the frame page starting at `bottom` is mapped and accessible.
/// Frames below the first one are mapped on demand here rather than from a
/// fault handler, so migration itself never faults.
fn ensure_frame_page(mm: &mut Mm, t: &mut Tcb, bottom: VirtAddr) -> Status {
    let flags = VmFlags::VALID | VmFlags::READ | VmFlags::WRITE | VmFlags::USER;

    match t.rpc_vmem.stat_vpage(bottom) {
        Ok(_) => {
            // page may have been stripped of USER while a deeper call held
            // the window
            t.rpc_vmem.set_vpage_flags(bottom, VmFlags::USER);
            Status::Ok
        }
        Err(_) => {
            let Some(page) = mm.pmem.alloc_page(BASE_PAGE) else {
                return Status::ErrOomem;
            };

            let res = t.rpc_vmem.map_vpage(&mut mm.pmem, page, bottom, flags, BASE_PAGE);
            if res.is_err() {
                mm.pmem.free_page(BASE_PAGE, page);
                return res;
            }

            Status::Ok
        }
    }
}

/// Hide the callers' most recent frame page from the visited process.
fn mark_rpc_invalid(t: &Tcb, bottom: VirtAddr) {
    let above = bottom.add(BASE_PAGE_SIZE);
    if above < config::layout().rpc_stack_top {
        t.rpc_vmem.clear_vpage_flags(above, VmFlags::USER);
    }
}

/// Re-expose a frame page on the way back out.
fn mark_rpc_valid(t: &Tcb, bottom: VirtAddr) {
    if bottom < config::layout().rpc_stack_top {
        t.rpc_vmem.set_vpage_flags(bottom, VmFlags::USER);
    }
}

/// Push (or, for tail calls, reuse) a call frame and park the outgoing
/// argument registers in it. Returns the new frame bottom for
/// finalize_rpc.
pub fn enter_rpc(
    mm: &mut Mm,
    t: &mut Tcb,
    args: [usize; 6],
    flags: IpcFlags,
) -> Result<VirtAddr, Status> {
    if flags.contains(IpcFlags::TAIL) && t.is_rpc() {
        // reuse the current frame: the saved caller context stays as it is,
        // so the eventual response skips the current host
        set_args(t, &args);
        return Ok(t.rpc_stack);
    }

    let position = rpc_position(t);
    let new_stack = position.sub(BASE_PAGE_SIZE);

    let res = ensure_frame_page(mm, t, new_stack);
    if res.is_err() {
        return Err(res);
    }

    write_ctx(
        t,
        position,
        CallCtx {
            exec: t.exec,
            pid: t.pid,
            eid: t.eid,
            rpc_stack: position,
            notify: flags.contains(IpcFlags::NOTIFY),
        },
    );

    t.regs = ctx_va(position);
    t.rpc_stack = new_stack;

    let Some(regs) = regs_of(t) else {
        return Err(Status::ErrMisc);
    };
    unsafe {
        let mut fresh = Regs::default();
        fresh.set_args(&args);
        fresh.sp = t.regs.sub(size_of::<Regs>()).as_usize();
        regs.as_ptr().write(fresh);
    }

    Ok(new_stack)
}

/// Commit the migration: the thread's private view starts tracking the
/// target process, execution continues at the target's callback, and the
/// target gains a reference for the duration of the visit. The identity
/// transition is the caller's job, it differs per flavor.
pub fn finalize_rpc(t: &mut Tcb, r: NonNull<Tcb>, frame_bottom: VirtAddr) {
    let (r_vmem, r_callback) = unsafe {
        let r = r.as_ptr();
        ((*r).proc_vmem, (*r).callback)
    };

    t.rpc_vmem.clone_user_from(r_vmem);
    t.exec = r_callback;
    tcb::reference_proc(r);

    mark_rpc_invalid(t, frame_bottom);
}

/// Mark a thread orphaned: its root process is gone.
pub fn orphanize(t: &mut Tcb) {
    t.orphaned = true;
    t.notify_flags.insert(NotifyFlags::ORPHANED);
}

/// Pop back towards the caller, writing `ret` into its register save area.
/// Frames whose target process has died in the meantime are skipped with
/// ERR_NF; a thread that runs out of frames with a dead root becomes an
/// orphan and is destroyed on the spot.
pub fn leave_rpc(
    k: &mut Kernel,
    cpu: CpuId,
    t_ptr: NonNull<Tcb>,
    ret: Option<[usize; 6]>,
) -> LeaveOutcome {
    let t = unsafe { &mut *t_ptr.as_ptr() };

    let mut position = t.rpc_stack.add(BASE_PAGE_SIZE);
    let mut ctx = read_ctx(t, position);
    t.regs = ctx_va(position);

    if !ctx.notify
        && let Some(vals) = ret
    {
        set_args(t, &vals);
    }

    loop {
        match k.tcbs.get(ctx.pid) {
            Some(r) if unsafe { (*r.as_ptr()).is_proc() && !(*r.as_ptr()).zombie() } => {
                break;
            }
            found => {
                if stack_empty(ctx.rpc_stack) {
                    // the root itself is gone; its membership reference is
                    // dropped when the orphan is destroyed below
                    orphanize(t);
                    break;
                }

                // returning into a dead process; drop the visit reference
                // its entry once took
                if let Some(r) = found {
                    tcb::unreference_proc(&mut k.mm, &k.tcbs, r);
                }

                position = ctx.rpc_stack.add(BASE_PAGE_SIZE);
                ctx = read_ctx(t, position);
                t.regs = ctx_va(position);
                if !ctx.notify {
                    set_status(t, Status::ErrNf);
                }
            }
        }
    }

    t.exec = ctx.exec;
    mark_rpc_valid(t, ctx.rpc_stack);
    t.rpc_stack = ctx.rpc_stack;
    let saved = Identity {
        eid: ctx.eid,
        pid: ctx.pid,
    };
    let id = t.identity().on_resp(saved);
    t.set_identity(id);

    if t.orphaned && !t.is_rpc() {
        // the last frame of an orphan unwound; nothing is left to return to
        if k.cpus.current(cpu) == Some(t_ptr) {
            k.cpus.set_current(cpu, core::ptr::null_mut());
        }

        tcb::destroy_thread(&mut k.mm, &k.tcbs, t_ptr);
        return LeaveOutcome::Destroyed;
    }

    if !t.notify_flags.is_empty() {
        notify::notify(k, cpu, t_ptr, NotifyFlags::empty());
    }

    LeaveOutcome::Resumed
}
