/*
 * Test Harness
 *
 * One page-aligned heap arena plays the role of physical RAM for the whole
 * test binary; the direct map points at it, and a bump cursor carves out a
 * private RAM range per test so tests can run in parallel. Addresses handed
 * to the kernel are fake physical addresses starting at FAKE_RAM_BASE.
 */

use core::ptr::NonNull;

use spin::{Mutex, Once};

use crate::caps::CapSet;
use crate::config::{self, PagingMode, VmLayout};
use crate::kernel::{BootInfo, Kernel};
use crate::memory::paging::Vmem;
use crate::memory::phys::Pmem;
use crate::memory::region::{Mm, RegionPool};
use crate::memory::{
    self, BASE_PAGE_SIZE, OrderTable, PhysAddr, VirtAddr, physmap,
};
use crate::syscall::numbers::Syscall;
use crate::syscall::{self, Effect};
use crate::thread::tcb::{self, Tcb};
use crate::thread::{CpuId, Tid};

/// Size of the shared backing arena. Every test carves its private RAM out
/// of this one allocation. Allocated zeroed and lazily by the host, so only
/// touched pages cost real memory.
const ARENA_BYTES: usize = 2 * 1024 * 1024 * 1024;

/// Where the fake physical address space starts.
const FAKE_RAM_BASE: usize = 0x8000_0000;

struct Arena {
    next: usize,
}

static ARENA: Once<Mutex<Arena>> = Once::new();

/// Bring up the global geometry (Sv39), the logger and the arena. Every
/// test path funnels through here; only the first call does work.
pub fn init_harness() {
    crate::utils::debug::init();
    memory::init_orders(OrderTable::for_mode(PagingMode::Sv39));
    config::init_layout(VmLayout::for_mode(PagingMode::Sv39));

    ARENA.call_once(|| {
        let layout = std::alloc::Layout::from_size_align(ARENA_BYTES, BASE_PAGE_SIZE)
            .expect("arena layout");
        let host = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!host.is_null(), "test arena allocation failed");

        physmap::init((host as usize).wrapping_sub(FAKE_RAM_BASE));
        Mutex::new(Arena { next: 0 })
    });
}

/// Carve a chunk of fake RAM out of the arena. Ranges start on large-page
/// boundaries so they behave like real RAM bases.
pub fn reserve(bytes: usize) -> PhysAddr {
    init_harness();

    let mut arena = ARENA.get().unwrap().lock();
    let large = memory::order_size(1);
    arena.next = memory::align_up(arena.next, large);
    let aligned = memory::align_up(bytes, BASE_PAGE_SIZE);
    assert!(
        arena.next + aligned <= ARENA_BYTES,
        "test arena exhausted; raise ARENA_BYTES"
    );

    let pa = PhysAddr::new(FAKE_RAM_BASE + arena.next);
    arena.next += aligned;
    pa
}

/// A standalone memory-management context over a private RAM range, for
/// tests below the kernel layer.
pub fn make_mm(ram_bytes: usize) -> Mm {
    let base = reserve(ram_bytes);

    let probe = Pmem::probe_pmap(ram_bytes);
    let (mut pmem, actual) = unsafe { Pmem::populate_pmap(base, ram_bytes, base) };
    assert_eq!(probe, actual);
    pmem.mark_area_used(base, base.add(actual));

    let nodes = RegionPool::new(&mut pmem).expect("region pool");
    Mm { pmem, nodes }
}

/// A full kernel over a private RAM range, bootstrapped through the real
/// boot path with a fake one-page kernel image.
pub fn make_kernel(ram_bytes: usize) -> Kernel {
    let base = reserve(ram_bytes);

    let info = BootInfo {
        mode: PagingMode::Sv39,
        dmap_offset: physmap::offset(),
        ram_base: base,
        ram_size: ram_bytes,
        kernel_image: (base, BASE_PAGE_SIZE),
        initrd: None,
        fdt: None,
        reserved: heapless::Vec::new(),
    };

    let mut k = Kernel::bootstrap(info).expect("bootstrap failed");
    // keep test address spaces small
    k.conf.thread_stack_size = 64 * 1024;
    k
}

/// Issue one syscall as the current thread of `cpu`.
pub fn sys(k: &mut Kernel, cpu: CpuId, nr: Syscall, args: [usize; 5]) -> Effect {
    syscall::handle_syscall(k, cpu, nr as usize, args)
}

/// The register-visible result tuple of a thread.
pub fn args_of(t: NonNull<Tcb>) -> [usize; 6] {
    crate::thread::rpc::get_args(unsafe { t.as_ref() })
}

pub fn tcb_of(k: &Kernel, tid: Tid) -> NonNull<Tcb> {
    k.tcbs.get(tid).expect("no such tcb")
}

/// Create a bare process with full capabilities and a registered RPC
/// callback, the way a freshly loaded server would end up.
pub fn new_server(k: &mut Kernel, cpu: CpuId, callback: usize) -> Tid {
    let t = tcb::create_proc(&mut k.mm, &mut k.tcbs, None).expect("create_proc");
    unsafe {
        (*t.as_ptr()).caps = CapSet::all();
        (*t.as_ptr()).exec = VirtAddr::new(0x1000);
    }

    let saved = k.current(cpu);
    k.use_tcb(cpu, t);
    sys(k, cpu, Syscall::IpcServer, [callback, 0, 0, 0, 0]);
    assert_eq!(args_of(t)[0], 0);

    match saved {
        Some(s) => k.use_tcb(cpu, s),
        None => k.cpus.set_current(cpu, core::ptr::null_mut()),
    }

    unsafe { t.as_ref().tid }
}

/// Resolve a user virtual address through a page table, honoring whatever
/// leaf order backs it.
fn user_ptr(vmem: Vmem, va: VirtAddr) -> *mut u8 {
    let (pa, order, _) = vmem
        .stat_vpage(va.align_down(BASE_PAGE_SIZE))
        .expect("address not mapped");
    let leaf_base = va.align_down(memory::order_size(order));
    let offset = va.as_usize() - leaf_base.as_usize();
    unsafe { physmap::phys_ptr::<u8>(pa.add(offset)) }
}

/// Write a u32 at a user virtual address.
pub fn write_user_u32(vmem: Vmem, va: VirtAddr, value: u32) {
    unsafe { (user_ptr(vmem, va) as *mut u32).write_unaligned(value) };
}

/// Read a u32 from a user virtual address.
pub fn read_user_u32(vmem: Vmem, va: VirtAddr) -> u32 {
    unsafe { (user_ptr(vmem, va) as *const u32).read_unaligned() }
}
