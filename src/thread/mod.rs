/*
 * Thread Control
 *
 * Thread control blocks, thread identity, the migrating-thread RPC stack
 * machinery and asynchronous notifications.
 */

pub mod notify;
pub mod rpc;
pub mod tcb;

/// Thread identifier. Unique while the TCB exists, never 0 for a live
/// thread; 0 stands for "the kernel" in notification arguments.
pub type Tid = usize;

/// Index of a CPU (hart).
pub type CpuId = usize;

/// Upper bound on supported harts.
pub const MAX_CPUS: usize = 16;

pub use tcb::{Identity, ProcState, Regs, Tcb, TcbTable};
