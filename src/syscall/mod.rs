/*
 * Syscall Dispatch
 *
 * Entry point for every system call. The trap glue saves registers, takes
 * the big kernel lock and hands the raw number plus five arguments in; the
 * returned Effect tells it what to do on the way out (plain return, TLB
 * broadcast first, idle the hart, or power off).
 *
 * Handlers communicate results by writing the (status, ar0..ar4) tuple into
 * the calling thread's register save area; migrating calls write into the
 * frame the thread continues on instead.
 */

pub mod cap;
pub mod conf;
pub mod ipc;
pub mod mem;
pub mod numbers;
pub mod proc;

use core::ptr::NonNull;

use numbers::Syscall;

use crate::arch::PoweroffKind;
use crate::kernel::Kernel;
use crate::status::Status;
use crate::thread::rpc;
use crate::thread::tcb::Tcb;
use crate::thread::CpuId;

/// What the trap glue must do after a syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Return to userspace on the current thread.
    Resume,
    /// Mappings changed: broadcast a TLB flush, then return.
    ResumeFlush,
    /// No runnable thread (or an explicit sleep); idle until an interrupt.
    Idle,
    /// Power state change, does not return.
    Poweroff(PoweroffKind),
}

/// Report a bare status to the calling thread and resume it.
fn fail(t: NonNull<Tcb>, status: Status) -> Effect {
    rpc::set_status(unsafe { t.as_ref() }, status);
    Effect::Resume
}

/// Dispatch one system call for the current thread of `cpu`.
pub fn handle_syscall(k: &mut Kernel, cpu: CpuId, nr: usize, args: [usize; 5]) -> Effect {
    let Some(t) = k.current(cpu) else {
        log::error!("syscall {} with no current thread on cpu {}", nr, cpu);
        return Effect::Idle;
    };

    let Some(syscall) = Syscall::from_raw(nr) else {
        log::error!(
            "syscall {} outside allowed range [0 - {}]",
            nr,
            Syscall::COUNT - 1
        );
        return fail(t, Status::ErrInval);
    };

    let [a, b, c, d, e] = args;

    match syscall {
        Syscall::Noop => {
            log::info!("sys_noop");
            fail(t, Status::Ok)
        }
        Syscall::Putch => {
            crate::utils::debug::put_char(a as u8);
            fail(t, Status::Ok)
        }

        Syscall::ReqMem => mem::req_mem(k, t, a, b),
        Syscall::ReqPmem => mem::req_pmem(k, t, a, b, c),
        Syscall::ReqFixmem => mem::req_fixmem(k, t, a, b, c),
        Syscall::ReqSharedmem => mem::req_sharedmem(k, t, a, b),
        Syscall::RefSharedmem => mem::ref_sharedmem(k, t, a, b, c),
        Syscall::FreeMem => mem::free_mem(k, t, a),

        Syscall::IpcServer => ipc::ipc_server(k, t, a),
        Syscall::IpcReq => ipc::ipc_req(k, cpu, t, a, [b, c, d, e]),
        Syscall::IpcFwd => ipc::ipc_fwd(k, cpu, t, a, [b, c, d, e]),
        Syscall::IpcTail => ipc::ipc_tail(k, cpu, t, a, [b, c, d, e]),
        Syscall::IpcKick => ipc::ipc_kick(k, cpu, t, a, [b, c, d, e]),
        Syscall::IpcResp => ipc::ipc_resp(k, cpu, t, [a, b, c, d]),
        Syscall::IpcNotify => ipc::ipc_notify(k, cpu, t, a),

        Syscall::Create => proc::create(k, t, a, [b, c, d, e]),
        Syscall::Fork => proc::fork(k, t),
        Syscall::Exec => proc::exec(k, t, a, b),
        Syscall::Spawn => proc::spawn(k, t, a, b),
        Syscall::Kill => proc::kill(k, t, a),
        Syscall::Swap => proc::swap(k, cpu, t, a),
        Syscall::Exit => proc::exit(k, cpu, t, a),
        Syscall::Detach => proc::detach(k, cpu, t),

        Syscall::SetCap => cap::set_cap(k, t, a, b),
        Syscall::GetCap => cap::get_cap(k, t, a),
        Syscall::ClearCap => cap::clear_cap(k, t, a, b),

        Syscall::ConfSet => conf::conf_set(k, t, a, b),
        Syscall::ConfGet => conf::conf_get(k, t, a, b),

        Syscall::Poweroff => conf::poweroff(k, t, a),
        Syscall::Sleep => conf::sleep(k, t),

        Syscall::IrqReq => {
            let tid = unsafe { t.as_ref().tid };
            let res = k.irqs.register(a, tid);
            fail(t, res)
        }
    }
}
