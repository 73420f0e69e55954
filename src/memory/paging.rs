/*
 * Page-Table Walker
 *
 * Maps, unmaps and inspects single virtual pages of any order in a
 * tree-structured RISC-V page table (Sv32/Sv39/Sv48; geometry comes from the
 * order table). All table access goes through the direct map, so the walker
 * can operate on any table root, not just the active one.
 *
 * PTE format: (ppn << 10) | flags, flags in the low byte. An entry with only
 * VALID set is a branch to the next level, an entry with any permission bit
 * is a leaf.
 *
 * Top-level writes are reported as INFO_SEFF: threads sharing the address
 * space on other CPUs need a TLB resync before the kernel lock is dropped.
 */

use spin::Once;

use super::phys::Pmem;
use super::physmap;
use super::{BASE_PAGE, BASE_PAGE_SIZE, Order, PhysAddr, VirtAddr, VmFlags, orders};
use crate::status::Status;

/// Handle to one hardware page table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vmem {
    root: PhysAddr,
}

const PTE_PPN_SHIFT: u32 = 10;

fn to_pte(pa: PhysAddr, flags: VmFlags) -> usize {
    ((pa.as_usize() >> orders().shift(BASE_PAGE)) << PTE_PPN_SHIFT) | flags.pte_bits()
}

fn pte_flags(pte: usize) -> VmFlags {
    VmFlags::from_bits_truncate(pte & 0xff)
}

fn pte_pa(pte: usize) -> PhysAddr {
    PhysAddr::new((pte >> PTE_PPN_SHIFT) << orders().shift(BASE_PAGE))
}

fn is_active(pte: usize) -> bool {
    pte_flags(pte).contains(VmFlags::VALID)
}

fn is_leaf(pte: usize) -> bool {
    is_active(pte) && !(pte_flags(pte) & !VmFlags::VALID).is_empty()
}

fn is_branch(pte: usize) -> bool {
    is_active(pte) && (pte_flags(pte) & !VmFlags::VALID).is_empty()
}

/// Index of a virtual address in the table at the given level.
fn index_of(va: VirtAddr, order: Order) -> usize {
    (va.as_usize() >> orders().shift(order)) & (orders().table_entries(order) - 1)
}

/// Pointer to one entry of a table page.
unsafe fn entry_ptr(table: PhysAddr, index: usize) -> *mut usize {
    unsafe { physmap::phys_ptr::<usize>(table).add(index) }
}

/// Kernel half of the top-level table, identical in every address space:
/// `count` top-order direct-map entries starting at `first_index`.
#[derive(Debug, Clone, Copy)]
pub struct KernelWindow {
    pub first_index: usize,
    pub count: usize,
    pub base: PhysAddr,
    pub flags: VmFlags,
}

static KERNEL_WINDOW: Once<KernelWindow> = Once::new();

/// Register the kernel window installed into every created table. The boot
/// code calls this once; without it tables are created with an empty kernel
/// half, which is what the host test harness wants.
pub fn init_kernel_window(window: KernelWindow) {
    KERNEL_WINDOW.call_once(|| window);
}

impl Vmem {
    /// Placeholder for a not-yet-created table.
    pub const fn null() -> Vmem {
        Vmem {
            root: PhysAddr::zero(),
        }
    }

    pub fn is_null(self) -> bool {
        self.root.is_null()
    }

    /// Physical address of the table root, in the form satp wants it.
    pub fn root(self) -> PhysAddr {
        self.root
    }

    /// Allocate and populate a fresh top-level table.
    pub fn create(pmem: &mut Pmem) -> Option<Vmem> {
        let root = pmem.alloc_page(BASE_PAGE)?;
        unsafe { physmap::phys_zero(root, BASE_PAGE_SIZE) };

        let vmem = Vmem { root };
        vmem.populate_kernel_map();
        Some(vmem)
    }

    /// Write the shared kernel gigapage entries into the top-level table.
    fn populate_kernel_map(self) {
        let Some(win) = KERNEL_WINDOW.get() else {
            return;
        };

        let top = orders().max_order();
        let span = orders().size(top);
        for i in 0..win.count {
            unsafe {
                *entry_ptr(self.root, win.first_index + i) =
                    to_pte(win.base.add(i * span), win.flags | VmFlags::VALID);
            }
        }
    }

    /// Walk to the leaf entry mapping `va`. Returns the entry pointer and
    /// the order it was found at.
    unsafe fn find_pte(self, va: VirtAddr) -> Option<(*mut usize, Order)> {
        let mut table = self.root;
        let mut order = orders().max_order();

        loop {
            let idx = index_of(va, order);
            let entry = unsafe { entry_ptr(table, idx) };
            let pte = unsafe { *entry };

            if !is_active(pte) {
                return None;
            }

            if is_leaf(pte) {
                return Some((entry, order));
            }

            if order == BASE_PAGE {
                // branch entry below the last level, the table is corrupt
                return None;
            }

            table = pte_pa(pte);
            order -= 1;
        }
    }

    /// Install a leaf mapping `va -> pa` at the given order, allocating
    /// interior tables as needed. Returns `InfoSeff` when the top-level
    /// table was written.
    pub fn map_vpage(
        self,
        pmem: &mut Pmem,
        pa: PhysAddr,
        va: VirtAddr,
        flags: VmFlags,
        order: Order,
    ) -> Status {
        let top = orders().max_order();
        let mut table = self.root;
        let mut level = top;
        let mut side_effect = false;

        while level != order {
            let idx = index_of(va, level);
            let entry = unsafe { entry_ptr(table, idx) };
            let pte = unsafe { *entry };

            if !is_active(pte) {
                let Some(new_table) = pmem.alloc_page(BASE_PAGE) else {
                    return Status::ErrOomem;
                };
                unsafe {
                    physmap::phys_zero(new_table, BASE_PAGE_SIZE);
                    *entry = to_pte(new_table, VmFlags::VALID);
                }
                if level == top {
                    side_effect = true;
                }
            } else if is_leaf(pte) {
                // a larger mapping already covers this address
                return Status::ErrInval;
            }

            table = pte_pa(unsafe { *entry });
            level -= 1;
        }

        let idx = index_of(va, level);
        let entry = unsafe { entry_ptr(table, idx) };
        let pte = unsafe { *entry };
        if is_branch(pte) && level > BASE_PAGE {
            // mapping a large page over an existing subtree; drop the
            // subtree or its tables would leak
            unsafe { destroy_branch(pmem, pte_pa(pte), level - 1) };
        }

        unsafe { *entry = to_pte(pa, flags | VmFlags::VALID) };

        if level == top || side_effect {
            Status::InfoSeff
        } else {
            Status::Ok
        }
    }

    /// Remove the leaf mapping `va`, garbage-collecting interior tables
    /// that became empty. Returns `InfoSeff` when the top-level table was
    /// written, `ErrNf` when nothing was mapped.
    pub fn unmap_vpage(self, pmem: &mut Pmem, va: VirtAddr) -> Status {
        let top = orders().max_order();
        let mut tables = [PhysAddr::zero(); super::MAX_ORDERS];
        let mut indexes = [0usize; super::MAX_ORDERS];

        let mut table = self.root;
        let mut order = top;
        let found = loop {
            let idx = index_of(va, order);
            let pte = unsafe { *entry_ptr(table, idx) };
            tables[order] = table;
            indexes[order] = idx;

            if !is_active(pte) {
                return Status::ErrNf;
            }

            if is_leaf(pte) {
                break order;
            }

            if order == BASE_PAGE {
                return Status::ErrNf;
            }

            table = pte_pa(pte);
            order -= 1;
        };

        unsafe { *entry_ptr(tables[found], indexes[found]) = 0 };
        let mut side_effect = found == top;

        // free interior tables that just became all-empty
        let mut level = found;
        while level < top {
            let table = tables[level];
            let entries = orders().table_entries(level);
            let empty = (0..entries).all(|i| unsafe { *entry_ptr(table, i) } == 0);
            if !empty {
                break;
            }

            unsafe { *entry_ptr(tables[level + 1], indexes[level + 1]) = 0 };
            pmem.free_page(BASE_PAGE, table);

            level += 1;
            if level == top {
                side_effect = true;
            }
        }

        if side_effect { Status::InfoSeff } else { Status::Ok }
    }

    /// Look up the mapping of `va`.
    pub fn stat_vpage(self, va: VirtAddr) -> Result<(PhysAddr, Order, VmFlags), Status> {
        unsafe {
            let (entry, order) = self.find_pte(va).ok_or(Status::ErrNf)?;
            let pte = *entry;
            Ok((pte_pa(pte), order, pte_flags(pte)))
        }
    }

    /// Set flag bits on an existing mapping.
    pub fn set_vpage_flags(self, va: VirtAddr, flags: VmFlags) -> Status {
        unsafe {
            let Some((entry, order)) = self.find_pte(va) else {
                return Status::ErrNf;
            };

            *entry = to_pte(pte_pa(*entry), pte_flags(*entry) | flags);
            if order == orders().max_order() {
                Status::InfoSeff
            } else {
                Status::Ok
            }
        }
    }

    /// Clear flag bits on an existing mapping.
    pub fn clear_vpage_flags(self, va: VirtAddr, flags: VmFlags) -> Status {
        unsafe {
            let Some((entry, order)) = self.find_pte(va) else {
                return Status::ErrNf;
            };

            *entry = to_pte(pte_pa(*entry), pte_flags(*entry) & !flags);
            if order == orders().max_order() {
                Status::InfoSeff
            } else {
                Status::Ok
            }
        }
    }

    /// Copy the user half of the top-level table from `src` into this
    /// table, making the thread's private view track the target process.
    /// The RPC window slot and the kernel half are left alone.
    pub fn clone_user_from(self, src: Vmem) {
        let top = orders().max_order();
        let span = orders().size(top);
        let count = crate::config::layout().uvmem_end.as_usize() / span;

        for i in 0..count {
            unsafe {
                *entry_ptr(self.root, i) = *entry_ptr(src.root, i);
            }
        }
    }

    /// Free the table and every interior table below it. Leaf targets are
    /// not touched; the region layer owns those.
    pub fn destroy(self, pmem: &mut Pmem) {
        unsafe { destroy_branch(pmem, self.root, orders().max_order()) };
    }
}

/// Recursively free a table page and its branch descendants.
unsafe fn destroy_branch(pmem: &mut Pmem, table: PhysAddr, level: Order) {
    unsafe {
        if level > BASE_PAGE {
            for i in 0..orders().table_entries(level) {
                let pte = *entry_ptr(table, i);
                if is_branch(pte) {
                    destroy_branch(pmem, pte_pa(pte), level - 1);
                }
            }
        }

        pmem.free_page(BASE_PAGE, table);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support;

    #[test]
    fn map_stat_unmap_roundtrip() {
        let mut mm = support::make_mm(8 * 1024 * 1024);
        let vmem = Vmem::create(&mut mm.pmem).unwrap();

        let frame = mm.pmem.alloc_page(BASE_PAGE).unwrap();
        let va = VirtAddr::new(0x4000_0000 + 0x7000);
        let flags = VmFlags::VALID | VmFlags::READ | VmFlags::WRITE | VmFlags::USER;

        let res = vmem.map_vpage(&mut mm.pmem, frame, va, flags, BASE_PAGE);
        assert!(!res.is_err());

        // stat returns exactly what was mapped
        let (pa, order, f) = vmem.stat_vpage(va).unwrap();
        assert_eq!(pa, frame);
        assert_eq!(order, BASE_PAGE);
        assert_eq!(f, flags);

        assert!(!vmem.unmap_vpage(&mut mm.pmem, va).is_err());
        assert_eq!(vmem.stat_vpage(va), Err(Status::ErrNf));
    }

    #[test]
    fn top_level_map_reports_side_effect() {
        let mut mm = support::make_mm(8 * 1024 * 1024);
        let vmem = Vmem::create(&mut mm.pmem).unwrap();
        let top = orders().max_order();

        let res = vmem.map_vpage(
            &mut mm.pmem,
            PhysAddr::new(0x8000_0000),
            VirtAddr::new(0x4000_0000),
            VmFlags::VALID | VmFlags::READ,
            top,
        );
        assert_eq!(res, Status::InfoSeff);
    }

    #[test]
    fn interior_tables_are_collected_on_unmap() {
        let mut mm = support::make_mm(8 * 1024 * 1024);
        let vmem = Vmem::create(&mut mm.pmem).unwrap();
        let flags = VmFlags::VALID | VmFlags::READ;

        let baseline = mm.pmem.query_used();

        let frame = mm.pmem.alloc_page(BASE_PAGE).unwrap();
        let va = VirtAddr::new(0x1234_5000);
        vmem.map_vpage(&mut mm.pmem, frame, va, flags, BASE_PAGE);
        // two interior tables were allocated on the way down
        assert!(mm.pmem.query_used() > baseline + BASE_PAGE_SIZE);

        vmem.unmap_vpage(&mut mm.pmem, va);
        mm.pmem.free_page(BASE_PAGE, frame);
        assert_eq!(mm.pmem.query_used(), baseline);
    }

    #[test]
    fn shared_prefixes_reuse_interior_tables() {
        let mut mm = support::make_mm(8 * 1024 * 1024);
        let vmem = Vmem::create(&mut mm.pmem).unwrap();
        let flags = VmFlags::VALID | VmFlags::READ;

        let f1 = mm.pmem.alloc_page(BASE_PAGE).unwrap();
        let f2 = mm.pmem.alloc_page(BASE_PAGE).unwrap();
        vmem.map_vpage(&mut mm.pmem, f1, VirtAddr::new(0x10_0000), flags, BASE_PAGE);
        let used_after_first = mm.pmem.query_used();

        // same 2M region, must not allocate another interior table
        vmem.map_vpage(&mut mm.pmem, f2, VirtAddr::new(0x10_1000), flags, BASE_PAGE);
        assert_eq!(mm.pmem.query_used(), used_after_first);

        let (pa1, _, _) = vmem.stat_vpage(VirtAddr::new(0x10_0000)).unwrap();
        let (pa2, _, _) = vmem.stat_vpage(VirtAddr::new(0x10_1000)).unwrap();
        assert_eq!(pa1, f1);
        assert_eq!(pa2, f2);
    }

    #[test]
    fn user_half_clone_tracks_source() {
        let mut mm = support::make_mm(8 * 1024 * 1024);
        let src = Vmem::create(&mut mm.pmem).unwrap();
        let dst = Vmem::create(&mut mm.pmem).unwrap();
        let flags = VmFlags::VALID | VmFlags::READ | VmFlags::USER;

        let frame = mm.pmem.alloc_page(BASE_PAGE).unwrap();
        let va = VirtAddr::new(0x4000_3000);
        src.map_vpage(&mut mm.pmem, frame, va, flags, BASE_PAGE);

        assert_eq!(dst.stat_vpage(va), Err(Status::ErrNf));
        dst.clone_user_from(src);
        let (pa, _, _) = dst.stat_vpage(va).unwrap();
        assert_eq!(pa, frame);
    }
}
