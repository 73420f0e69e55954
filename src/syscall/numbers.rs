/*
 * Syscall Numbers
 *
 * Dense syscall enumeration shared with userspace. The dispatch table
 * rejects anything outside the range with ERR_INVAL, so the numbering can
 * stay packed.
 */

/// Syscall identifiers. a7 carries the number, a0..a4 the arguments; the
/// kernel answers in a0..a5 as (status, ar0..ar4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Syscall {
    /// Do nothing, successfully.
    Noop = 0,
    /// Emit one debug character.
    Putch = 1,

    /// Allocate user memory.
    ReqMem = 2,
    /// Map a fixed physical range (device memory).
    ReqPmem = 3,
    /// Allocate user memory at a fixed address.
    ReqFixmem = 4,
    /// Allocate shareable memory.
    ReqSharedmem = 5,
    /// Map another process's shared region.
    RefSharedmem = 6,
    /// Free any of the above.
    FreeMem = 7,

    /// Register the calling process's RPC entry point.
    IpcServer = 8,
    /// Migrating call.
    IpcReq = 9,
    /// Migrating call preserving the effective id.
    IpcFwd = 10,
    /// Migrating call reusing the current frame.
    IpcTail = 11,
    /// Frame-reusing call preserving the effective id.
    IpcKick = 12,
    /// Return to the caller.
    IpcResp = 13,
    /// Post a signal notification.
    IpcNotify = 14,

    /// Create a thread in the current process.
    Create = 15,
    /// Duplicate the effective process.
    Fork = 16,
    /// Replace the current process image.
    Exec = 17,
    /// Create a process from a binary.
    Spawn = 18,
    /// Kill a process.
    Kill = 19,
    /// Switch the CPU to another thread.
    Swap = 20,
    /// Destroy the calling thread, optionally switching away.
    Exit = 21,
    /// Detach from the root process.
    Detach = 22,

    /// Capability management.
    SetCap = 23,
    GetCap = 24,
    ClearCap = 25,

    /// Runtime configuration.
    ConfSet = 26,
    ConfGet = 27,

    /// Power control.
    Poweroff = 28,
    Sleep = 29,

    /// Claim a hardware interrupt line.
    IrqReq = 30,
}

impl Syscall {
    /// Decode a raw syscall number.
    pub fn from_raw(nr: usize) -> Option<Syscall> {
        Some(match nr {
            0 => Syscall::Noop,
            1 => Syscall::Putch,
            2 => Syscall::ReqMem,
            3 => Syscall::ReqPmem,
            4 => Syscall::ReqFixmem,
            5 => Syscall::ReqSharedmem,
            6 => Syscall::RefSharedmem,
            7 => Syscall::FreeMem,
            8 => Syscall::IpcServer,
            9 => Syscall::IpcReq,
            10 => Syscall::IpcFwd,
            11 => Syscall::IpcTail,
            12 => Syscall::IpcKick,
            13 => Syscall::IpcResp,
            14 => Syscall::IpcNotify,
            15 => Syscall::Create,
            16 => Syscall::Fork,
            17 => Syscall::Exec,
            18 => Syscall::Spawn,
            19 => Syscall::Kill,
            20 => Syscall::Swap,
            21 => Syscall::Exit,
            22 => Syscall::Detach,
            23 => Syscall::SetCap,
            24 => Syscall::GetCap,
            25 => Syscall::ClearCap,
            26 => Syscall::ConfSet,
            27 => Syscall::ConfGet,
            28 => Syscall::Poweroff,
            29 => Syscall::Sleep,
            30 => Syscall::IrqReq,
            _ => return None,
        })
    }

    /// One past the highest valid number.
    pub const COUNT: usize = 31;
}

/// Callback reason code userspace receives in a notification frame.
pub const USER_NOTIFY: usize = 1;

/// Poweroff types.
pub const POWEROFF_SHUTDOWN: usize = 0;
pub const POWEROFF_COLD_REBOOT: usize = 1;
pub const POWEROFF_WARM_REBOOT: usize = 2;
