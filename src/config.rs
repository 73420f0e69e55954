/*
 * Kernel Configuration
 *
 * Paging mode selection, the virtual memory layout derived from it, and the
 * runtime-tunable parameters exposed through conf_get/conf_set.
 *
 * The layout is chosen once at boot (from the paging mode the bootstrap
 * probed) and never changes afterwards; it lives in a spin::Once so every
 * subsystem can read it without carrying a context pointer.
 */

use spin::Once;

use crate::memory::VirtAddr;

/// Hardware paging mode. Decides page-table geometry and the virtual
/// memory layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    Sv32,
    Sv39,
    Sv48,
}

const KIB: usize = 1 << 10;
const MIB: usize = 1 << 20;

/// Fixed virtual memory layout for one paging mode.
///
/// The RPC stack window occupies exactly one top-level page-table slot right
/// above the user arena, so a thread's private RPC mappings survive
/// `clone_uvmem` (which only copies the user slots below `uvmem_end`).
#[derive(Debug, Clone, Copy)]
pub struct VmLayout {
    /// Direct-map window base: VA(p) = p + dmap for RAM-resident pages.
    pub dmap: usize,
    /// First allocatable user virtual address.
    pub uvmem_start: VirtAddr,
    /// End of the user arena, exclusive.
    pub uvmem_end: VirtAddr,
    /// Bottom of the per-thread RPC stack window.
    pub rpc_stack_base: VirtAddr,
    /// Top of the per-thread RPC stack window; frames grow down from here.
    pub rpc_stack_top: VirtAddr,
    /// Bytes at the bottom of the user arena that unconstrained allocations
    /// never return, so NULL stays unmapped.
    pub uvmem_reserved: usize,
}

impl VmLayout {
    /// Layout for a paging mode. The 64-bit layouts are computed in u64 so
    /// the match still compiles for 32-bit targets, where only the Sv32 arm
    /// can ever be taken.
    pub fn for_mode(mode: PagingMode) -> VmLayout {
        const GIB64: u64 = 1 << 30;
        const TIB64: u64 = 1 << 40;
        match mode {
            // 32-bit: 2 GiB of user space, 8 MiB RPC window below it.
            PagingMode::Sv32 => VmLayout {
                dmap: 0x8000_0000,
                uvmem_start: VirtAddr::new(4 * KIB),
                uvmem_end: VirtAddr::new((2 * GIB64 - 16 * MIB as u64) as usize),
                rpc_stack_base: VirtAddr::new((2 * GIB64 - 16 * MIB as u64) as usize),
                rpc_stack_top: VirtAddr::new((2 * GIB64 - 8 * MIB as u64) as usize),
                uvmem_reserved: 64 * KIB,
            },
            // Sv39: user arena up to 248 GiB, one gigapage of RPC window.
            PagingMode::Sv39 => VmLayout {
                dmap: 0xffff_ffc0_0000_0000_u64 as usize,
                uvmem_start: VirtAddr::new(4 * KIB),
                uvmem_end: VirtAddr::new((248 * GIB64) as usize),
                rpc_stack_base: VirtAddr::new((248 * GIB64) as usize),
                rpc_stack_top: VirtAddr::new((249 * GIB64) as usize),
                uvmem_reserved: 64 * KIB,
            },
            // Sv48: user arena up to 64 TiB minus one top-level slot.
            PagingMode::Sv48 => VmLayout {
                dmap: 0xffff_8000_0000_0000_u64 as usize,
                uvmem_start: VirtAddr::new(4 * KIB),
                uvmem_end: VirtAddr::new((64 * TIB64 - 512 * GIB64) as usize),
                rpc_stack_base: VirtAddr::new((64 * TIB64 - 512 * GIB64) as usize),
                rpc_stack_top: VirtAddr::new((64 * TIB64) as usize),
                uvmem_reserved: 64 * KIB,
            },
        }
    }
}

static LAYOUT: Once<VmLayout> = Once::new();

/// Select the virtual memory layout. Called once at boot, before any
/// address-space operation.
pub fn init_layout(layout: VmLayout) {
    LAYOUT.call_once(|| layout);
}

/// The active layout. Panics if the kernel was never configured.
pub fn layout() -> &'static VmLayout {
    LAYOUT.get().expect("vm layout not initialized")
}

/// Runtime-tunable parameters, adjusted through conf_set with CAP_CONF.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConf {
    /// Userspace stack size handed to new threads.
    pub thread_stack_size: usize,
    /// Headroom each RPC invocation must leave below its frame.
    pub rpc_stack_size: usize,
}

impl Default for RuntimeConf {
    fn default() -> Self {
        RuntimeConf {
            thread_stack_size: 2 * MIB,
            rpc_stack_size: 512 * KIB,
        }
    }
}

/// Configuration parameter identifiers for conf_get/conf_set.
pub const CONF_THREAD_STACK: usize = 0;
pub const CONF_RPC_STACK: usize = 1;
pub const CONF_RAM_USAGE: usize = 2;
pub const CONF_RAM_SIZE: usize = 3;
pub const CONF_PAGE_SIZE: usize = 4;
pub const CONF_MAX_THREADS: usize = 5;
