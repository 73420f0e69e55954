/*
 * Memory Subsystem
 *
 * Core memory types shared by every other module: physical and virtual
 * address newtypes, the page/region flag word, and the page-order table
 * describing the geometric page-size hierarchy of the active paging mode.
 *
 * Physical and virtual addresses are distinct semantic types. The kernel is
 * mapped in a fixed high direct-map window (see physmap), so a PhysAddr can
 * always be turned into a dereferencable pointer, while user VirtAddrs can
 * only be resolved by walking a page table.
 */

pub mod address_space;
pub mod bitmap;
pub mod nodes;
pub mod paging;
pub mod phys;
pub mod physmap;
pub mod region;
pub mod sptree;

use bitflags::bitflags;
use spin::Once;

use crate::config::PagingMode;

/// A physical memory address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(usize);

impl PhysAddr {
    pub const fn new(addr: usize) -> Self {
        PhysAddr(addr)
    }

    pub const fn zero() -> Self {
        PhysAddr(0)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn add(self, offset: usize) -> Self {
        PhysAddr(self.0 + offset)
    }

    pub fn align_down(self, align: usize) -> Self {
        PhysAddr(align_down(self.0, align))
    }

    pub fn is_aligned(self, align: usize) -> bool {
        is_aligned(self.0, align)
    }
}

impl core::fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "pa:{:#x}", self.0)
    }
}

/// A virtual memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(usize);

impl VirtAddr {
    pub const fn new(addr: usize) -> Self {
        VirtAddr(addr)
    }

    pub const fn zero() -> Self {
        VirtAddr(0)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn add(self, offset: usize) -> Self {
        VirtAddr(self.0 + offset)
    }

    pub fn sub(self, offset: usize) -> Self {
        VirtAddr(self.0 - offset)
    }

    pub fn align_down(self, align: usize) -> Self {
        VirtAddr(align_down(self.0, align))
    }

    pub fn align_up(self, align: usize) -> Self {
        VirtAddr(align_up(self.0, align))
    }

    pub fn is_aligned(self, align: usize) -> bool {
        is_aligned(self.0, align)
    }

    /// Page number of the base page containing this address.
    pub fn page(self) -> usize {
        self.0 / BASE_PAGE_SIZE
    }

    /// Address of a base page number.
    pub fn from_page(page: usize) -> VirtAddr {
        VirtAddr(page * BASE_PAGE_SIZE)
    }
}

impl core::fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "va:{:#x}", self.0)
    }
}

bitflags! {
    /// Page and region flags.
    ///
    /// The low byte mirrors the RISC-V PTE flag bits exactly and is what the
    /// page-table walker installs. The region tracker's metadata bits live in
    /// the upper half of the word; the two sets share one word so a region's
    /// flags can be handed to the walker unmasked.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VmFlags: usize {
        /// Mapping is valid.
        const VALID = 1 << 0;
        /// Readable.
        const READ = 1 << 1;
        /// Writable.
        const WRITE = 1 << 2;
        /// Executable.
        const EXEC = 1 << 3;
        /// Accessible from user mode.
        const USER = 1 << 4;
        /// Global mapping, survives address-space switches.
        const GLOBAL = 1 << 5;
        /// Accessed, set by hardware or eagerly by the kernel.
        const ACCESSED = 1 << 6;
        /// Dirty.
        const DIRTY = 1 << 7;

        /// Region is allocated (region tracker metadata).
        const USED = 1 << 16;
        /// Region survives clear_uvmem (exec keeps the binary this way).
        const KEEP = 1 << 17;
        /// Region is shared memory.
        const SHARED = 1 << 18;
        /// Region has no frames of its own (device memory, shared refs).
        const NONBACKED = 1 << 19;
    }
}

impl VmFlags {
    /// The bits the hardware page-table entry carries.
    pub fn pte_bits(self) -> usize {
        self.bits() & 0xff
    }

    /// Restrict userspace-supplied flags to r/w/x and force valid+user.
    pub fn sanitize_user(self) -> VmFlags {
        (self & (VmFlags::READ | VmFlags::WRITE | VmFlags::EXEC))
            | VmFlags::VALID
            | VmFlags::USER
    }
}

/// Page order; 0 is the base page, each next order is one page-table level
/// larger.
pub type Order = usize;

/// Base page order.
pub const BASE_PAGE: Order = 0;

/// Size in bytes of the base page, common to Sv32/Sv39/Sv48.
pub const BASE_PAGE_SIZE: usize = 4096;

/// Highest number of page orders any supported mode has (Sv48).
pub const MAX_ORDERS: usize = 4;

/// Table of page orders for the active paging mode.
///
/// Populated once at boot. Invariant: for every order o > 0,
/// size(o) == size(o-1) * width(o-1).
#[derive(Debug, Clone, Copy)]
pub struct OrderTable {
    count: usize,
    va_bits: u32,
    shifts: [u32; MAX_ORDERS],
}

impl OrderTable {
    /// Geometry of one paging mode.
    pub fn for_mode(mode: PagingMode) -> OrderTable {
        match mode {
            PagingMode::Sv32 => OrderTable {
                count: 2,
                va_bits: 32,
                shifts: [12, 22, 0, 0],
            },
            PagingMode::Sv39 => OrderTable {
                count: 3,
                va_bits: 39,
                shifts: [12, 21, 30, 0],
            },
            PagingMode::Sv48 => OrderTable {
                count: 4,
                va_bits: 48,
                shifts: [12, 21, 30, 39],
            },
        }
    }

    /// Number of orders.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Largest supported order.
    pub fn max_order(&self) -> Order {
        self.count - 1
    }

    /// Address shift of an order.
    pub fn shift(&self, order: Order) -> u32 {
        self.shifts[order]
    }

    /// Size in bytes of a page of the given order.
    pub fn size(&self, order: Order) -> usize {
        1 << self.shifts[order]
    }

    /// How many pages of this order tile one page of the next order.
    /// Zero for the top order, which has nothing above it.
    pub fn width(&self, order: Order) -> usize {
        if order + 1 < self.count {
            1 << (self.shifts[order + 1] - self.shifts[order])
        } else {
            0
        }
    }

    /// Entries in a page table at the given level. Same as width() except at
    /// the top level, where the remaining virtual address bits decide.
    pub fn table_entries(&self, order: Order) -> usize {
        if order + 1 < self.count {
            self.width(order)
        } else {
            1 << (self.va_bits - self.shifts[order])
        }
    }

    /// Largest order whose page size is not larger than the given size;
    /// BASE_PAGE if even the base page is larger.
    pub fn nearest_order(&self, size: usize) -> Order {
        for order in (0..self.count).rev() {
            if self.size(order) <= size {
                return order;
            }
        }
        BASE_PAGE
    }
}

static ORDERS: Once<OrderTable> = Once::new();

/// Install the order table. Called once at boot from the probed paging mode.
pub fn init_orders(table: OrderTable) {
    ORDERS.call_once(|| table);
}

/// The active order table. Panics if the kernel was never configured.
pub fn orders() -> &'static OrderTable {
    ORDERS.get().expect("page order table not initialized")
}

/// Size in bytes of a page of the given order.
pub fn order_size(order: Order) -> usize {
    orders().size(order)
}

/// Largest supported page order.
pub fn max_order() -> Order {
    orders().max_order()
}

/// Round up to the next multiple of a power-of-two alignment.
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Round down to a multiple of a power-of-two alignment.
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Check alignment to a power of two.
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

/// Bytes to whole base pages, rounding up.
pub const fn pages_for(bytes: usize) -> usize {
    align_up(bytes, BASE_PAGE_SIZE) / BASE_PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_geometry() {
        let t = OrderTable::for_mode(PagingMode::Sv39);
        assert_eq!(t.size(0), 4096);
        assert_eq!(t.size(1), 2 * 1024 * 1024);
        assert_eq!(t.size(2), 1024 * 1024 * 1024);
        assert_eq!(t.width(0), 512);
        assert_eq!(t.width(2), 0);
        assert_eq!(t.table_entries(2), 512);
        for o in 1..t.count() {
            assert_eq!(t.size(o), t.size(o - 1) * t.width(o - 1));
        }

        let t32 = OrderTable::for_mode(PagingMode::Sv32);
        assert_eq!(t32.size(1), 4 * 1024 * 1024);
        assert_eq!(t32.table_entries(1), 1024);
        assert_eq!(t32.width(0), 1024);

        let t48 = OrderTable::for_mode(PagingMode::Sv48);
        assert_eq!(t48.max_order(), 3);
        assert_eq!(t48.size(3), 512 * 1024 * 1024 * 1024usize);
    }

    #[test]
    fn nearest_order_picks_largest_fit() {
        let t = OrderTable::for_mode(PagingMode::Sv39);
        assert_eq!(t.nearest_order(4096), 0);
        assert_eq!(t.nearest_order(3 * 1024 * 1024), 1);
        assert_eq!(t.nearest_order(1024 * 1024 * 1024), 2);
        assert_eq!(t.nearest_order(100), 0);
    }

    #[test]
    fn flag_halves_do_not_collide() {
        let all_page = VmFlags::VALID
            | VmFlags::READ
            | VmFlags::WRITE
            | VmFlags::EXEC
            | VmFlags::USER
            | VmFlags::GLOBAL
            | VmFlags::ACCESSED
            | VmFlags::DIRTY;
        let all_region =
            VmFlags::USED | VmFlags::KEEP | VmFlags::SHARED | VmFlags::NONBACKED;
        assert_eq!(all_page.bits() & all_region.bits(), 0);
        assert_eq!(all_page.bits(), all_page.pte_bits());
        assert_eq!(
            (VmFlags::WRITE | VmFlags::USED).pte_bits(),
            VmFlags::WRITE.bits()
        );
    }

    #[test]
    fn sanitize_strips_everything_else() {
        let f = (VmFlags::READ | VmFlags::GLOBAL | VmFlags::USED).sanitize_user();
        assert!(f.contains(VmFlags::READ | VmFlags::VALID | VmFlags::USER));
        assert!(!f.contains(VmFlags::GLOBAL));
        assert!(!f.contains(VmFlags::USED));
    }
}
