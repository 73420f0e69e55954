/*
 * Memory Region Tracker
 *
 * Chooses virtual-address ranges inside one address space, remembers which
 * ranges are used so they can be freed, and coalesces neighboring holes.
 *
 * A region root keeps two height-hinted trees over the same nodes: free
 * regions keyed by (size, start) so the allocator can search by size, and
 * used regions keyed by start for exact lookup. Additionally every region
 * sits in an address-ordered doubly-linked list that tiles the whole arena
 * without gaps; a region without the USED flag is a hole.
 *
 * Region nodes come from a fixed-size slab (nodes.rs). Addresses inside
 * regions are stored in base-page units.
 */

use core::ptr;

use super::nodes::NodePool;
use super::paging::Vmem;
use super::phys::Pmem;
use super::sptree::{self, SpDir, SpNode, SpRoot};
use super::{
    BASE_PAGE_SIZE, Order, VirtAddr, VmFlags, align_up, is_aligned, max_order,
    order_size, orders, pages_for,
};
use crate::status::Status;
use crate::thread::Tid;

/// What backs a region's pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// The region owns its frames. The refcount counts the owner itself
    /// plus every live shared-memory reference to it.
    Owned { refcount: usize },
    /// The region borrows the frames of a shared region in another process:
    /// `shaddr` is the owner-side virtual address.
    Linked { owner: Tid, shaddr: VirtAddr },
}

/// One contiguous range of user virtual pages with uniform flags.
#[repr(C)]
pub struct Region {
    /// Tree node, first so tree pointers cast back to the region.
    pub(super) sp_n: SpNode,
    /// Address-ordered neighbors.
    pub next: *mut Region,
    pub prev: *mut Region,
    /// Bounds in base-page units, start inclusive, end exclusive.
    pub start: usize,
    pub end: usize,
    pub flags: VmFlags,
    pub backing: Backing,
}

impl Region {
    pub fn is_used(&self) -> bool {
        self.flags.contains(VmFlags::USED)
    }

    pub fn is_kept(&self) -> bool {
        self.flags.contains(VmFlags::KEEP)
    }

    pub fn start_addr(&self) -> VirtAddr {
        VirtAddr::from_page(self.start)
    }

    pub fn size_bytes(&self) -> usize {
        (self.end - self.start) * BASE_PAGE_SIZE
    }

    fn pages(&self) -> usize {
        self.end - self.start
    }
}

/// Recover the region from a pointer to its embedded tree node.
fn container(n: *mut SpNode) -> *mut Region {
    n as *mut Region
}

/// Slab pool of region nodes.
pub struct RegionPool(NodePool);

impl RegionPool {
    pub fn new(pmem: &mut Pmem) -> Option<RegionPool> {
        Some(RegionPool(NodePool::new(pmem, size_of::<Region>())?))
    }

    fn get(&mut self, pmem: &mut Pmem) -> Option<*mut Region> {
        let p = self.0.get(pmem)? as *mut Region;
        unsafe {
            p.write(Region {
                sp_n: SpNode::new(),
                next: ptr::null_mut(),
                prev: ptr::null_mut(),
                start: 0,
                end: 0,
                flags: VmFlags::empty(),
                backing: Backing::Owned { refcount: 1 },
            });
        }
        Some(p)
    }

    fn put(&mut self, pmem: &mut Pmem, m: *mut Region) {
        self.0.put(pmem, m as *mut u8);
    }

    pub fn destroy(&mut self, pmem: &mut Pmem) {
        self.0.destroy(pmem);
    }
}

/// The memory-management context threaded through every allocation path:
/// the physical allocator plus the region-node slab.
pub struct Mm {
    pub pmem: Pmem,
    pub nodes: RegionPool,
}

/// Region bookkeeping of one address space.
pub struct RegionRoot {
    free_regions: SpRoot,
    used_regions: SpRoot,
    /// Pages at the arena bottom never handed out by an unconstrained
    /// allocation.
    reserved: usize,
    /// Arena bounds in pages.
    pub start: usize,
    pub end: usize,
}

// Tree pointers are only followed under the big kernel lock.
unsafe impl Send for RegionRoot {}

impl RegionRoot {
    pub const fn empty() -> RegionRoot {
        RegionRoot {
            free_regions: SpRoot::new(),
            used_regions: SpRoot::new(),
            reserved: 0,
            start: 0,
            end: 0,
        }
    }
}

/// Insert a free region; the free tree is keyed by (size, start) with
/// smaller addresses to the left among equal sizes.
unsafe fn insert_free_region(root: &mut RegionRoot, m: *mut Region) {
    unsafe {
        let mut n = root.free_regions.root();
        let mut p = ptr::null_mut();
        let mut d = SpDir::Left;
        let start = (*m).start;
        let size = (*m).pages();

        while !n.is_null() {
            let t = container(n);
            let nsize = (*t).pages();
            p = n;

            if size < nsize {
                n = (*n).left();
                d = SpDir::Left;
            } else if size > nsize {
                n = (*n).right();
                d = SpDir::Right;
            } else if start < (*t).start {
                n = (*n).left();
                d = SpDir::Left;
            } else {
                n = (*n).right();
                d = SpDir::Right;
            }
        }

        sptree::insert(&mut root.free_regions, p, &raw mut (*m).sp_n, d);
    }
}

/// Insert a used region, keyed by start. Starts are unique, the arena tiling
/// guarantees it.
unsafe fn insert_used_region(root: &mut RegionRoot, m: *mut Region) {
    unsafe {
        let mut n = root.used_regions.root();
        let mut p = ptr::null_mut();
        let mut d = SpDir::Left;
        let start = (*m).start;

        while !n.is_null() {
            let t = container(n);
            p = n;

            if start < (*t).start {
                n = (*n).left();
                d = SpDir::Left;
            } else {
                n = (*n).right();
                d = SpDir::Right;
            }
        }

        sptree::insert(&mut root.used_regions, p, &raw mut (*m).sp_n, d);
    }
}

/// Initialize an arena covering `[start, start + arena_size)` bytes with the
/// low `reserved` bytes protected from unconstrained allocation.
pub fn init_region(
    mm: &mut Mm,
    root: &mut RegionRoot,
    start: VirtAddr,
    arena_size: usize,
    reserved: usize,
) -> Status {
    let Mm { pmem, nodes } = mm;
    let Some(m) = nodes.get(pmem) else {
        return Status::ErrOomem;
    };

    let start = start.page();
    let arena_pages = arena_size / BASE_PAGE_SIZE;
    unsafe {
        (*m).start = start;
        (*m).end = start + arena_pages;

        root.reserved = reserved / BASE_PAGE_SIZE;
        root.start = start;
        root.end = start + arena_pages;
        insert_free_region(root, m);
    }

    Status::Ok
}

unsafe fn destroy_subtree(mm: &mut Mm, n: *mut SpNode) {
    unsafe {
        if n.is_null() {
            return;
        }

        destroy_subtree(mm, (*n).left());
        destroy_subtree(mm, (*n).right());

        let Mm { pmem, nodes } = mm;
        nodes.put(pmem, container(n));
    }
}

/// Free every node of an arena, used and free alike.
pub fn destroy_region(mm: &mut Mm, root: &mut RegionRoot) {
    unsafe {
        destroy_subtree(mm, root.free_regions.root());
        destroy_subtree(mm, root.used_regions.root());
    }
    root.free_regions = SpRoot::new();
    root.used_regions = SpRoot::new();
}

/// Exact-start lookup of a used region.
pub fn find_used_region(root: &RegionRoot, va: VirtAddr) -> Option<*mut Region> {
    let target = va.page();
    let mut n = root.used_regions.root();
    unsafe {
        while !n.is_null() {
            let t = container(n);
            if target == (*t).start {
                return Some(t);
            }

            n = if target < (*t).start {
                (*n).left()
            } else {
                (*n).right()
            };
        }
    }

    None
}

/// Used region with the start closest to an address; falls back to the free
/// tree root when nothing is in use yet.
pub fn find_closest_used_region(root: &RegionRoot, va: VirtAddr) -> Option<*mut Region> {
    let mut n = root.used_regions.root();
    if n.is_null() {
        let f = root.free_regions.root();
        return if f.is_null() { None } else { Some(container(f)) };
    }

    let target = va.page();
    let mut closest = None;
    let mut best = usize::MAX;
    unsafe {
        while !n.is_null() {
            let t = container(n);
            let d = target.abs_diff((*t).start);

            if d == 0 {
                return Some(t);
            }

            if d < best {
                closest = Some(t);
                best = d;
            }

            n = if target < (*t).start {
                (*n).left()
            } else {
                (*n).right()
            };
        }
    }

    closest
}

/// First region of the address-ordered list.
pub fn find_first_region(root: &RegionRoot) -> Option<*mut Region> {
    let mut m = find_closest_used_region(root, VirtAddr::zero())?;
    unsafe {
        while !(*m).prev.is_null() {
            m = (*m).prev;
        }
    }
    Some(m)
}

/// Byte size of the largest page order not larger than `bytes`; 0 when even
/// the second-smallest order is too big to matter.
fn po_align(bytes: usize) -> usize {
    for order in (1..=max_order()).rev() {
        if bytes >= order_size(order) {
            return order_size(order);
        }
    }

    0
}

fn align_up_pages(page: usize, align: usize) -> usize {
    if align == 0 { page } else { align_up(page, align) }
}

/// Search the free tree for a region admitting `pages`, preferring starts
/// aligned to the largest power-of-two order at or below the request so the
/// mapping can later use large pages. Returns the region and the offset of
/// the chosen start from the region's start.
///
/// Descends only to the right: larger blocks and higher addresses, away from
/// the NULL page. `quick_best` remembers the first region the request fits
/// in at all, as the unaligned fallback. The reserved low zone is used only
/// when no other candidate remains, and then the allocation is pushed to the
/// top end of the region.
pub fn find_free_region(
    root: &RegionRoot,
    pages: usize,
    align: &mut usize,
) -> Option<*mut Region> {
    *align = 0;
    let offset = po_align(pages * BASE_PAGE_SIZE) / BASE_PAGE_SIZE;
    let mut quick_best = None;

    let mut n = root.free_regions.root();
    unsafe {
        while !n.is_null() {
            let t = container(n);
            let start = align_up_pages((*t).start, offset);
            let qsize = (*t).pages();
            let bsize = (*t).end.saturating_sub(start);

            let resv_end = root.start + root.reserved;
            if start < resv_end {
                // overlapping the reserved zone; only acceptable as the very
                // last resort
                if !(*n).right().is_null() {
                    n = (*n).right();
                    continue;
                }

                if quick_best.is_some() {
                    return quick_best;
                }

                // park the allocation at the top end of the region, which
                // clears the reserved pages whenever there is room to
                if qsize >= pages {
                    *align = ((*t).end - pages) - (*t).start;
                    return Some(t);
                }

                return None;
            }

            if quick_best.is_none() && pages <= qsize {
                quick_best = Some(t);
            }

            if pages <= bsize {
                *align = start - (*t).start;
                return Some(t);
            }

            n = (*n).right();
        }
    }

    quick_best
}

/// Carve a used region out of a free one. `align` is the offset of the new
/// region's start from the free region's start; the cut-offs on either side
/// go back to the free tree. Fails without side effects when the slab cannot
/// supply the split nodes.
unsafe fn partition_region(
    mm: &mut Mm,
    root: &mut RegionRoot,
    m: *mut Region,
    pages: usize,
    align: usize,
    flags: VmFlags,
    pid: Tid,
) -> Option<VirtAddr> {
    unsafe {
        let pre_start = (*m).start;
        let pre_end = pre_start + align;
        let start = pre_end;
        let end = start + pages;
        let post_start = end;
        let post_end = (*m).end;

        // grab split nodes up front so failure cannot leave a torn list
        let Mm { pmem, nodes } = mm;
        let pre_node = if pre_start != pre_end {
            Some(nodes.get(pmem)?)
        } else {
            None
        };
        let post_node = if post_start != post_end {
            match nodes.get(pmem) {
                Some(n) => Some(n),
                None => {
                    if let Some(p) = pre_node {
                        nodes.put(pmem, p);
                    }
                    return None;
                }
            }
        } else {
            None
        };

        sptree::remove(&mut root.free_regions, &raw mut (*m).sp_n);

        if let Some(n) = pre_node {
            (*n).start = pre_start;
            (*n).end = pre_end;
            (*n).prev = (*m).prev;
            (*n).next = m;
            (*m).prev = n;
            if !(*n).prev.is_null() {
                (*(*n).prev).next = n;
            }

            insert_free_region(root, n);
        }

        if let Some(n) = post_node {
            (*n).start = post_start;
            (*n).end = post_end;
            (*n).prev = m;
            (*n).next = (*m).next;
            (*m).next = n;
            if !(*n).next.is_null() {
                (*(*n).next).prev = n;
            }

            insert_free_region(root, n);
        }

        (*m).start = start;
        (*m).end = end;
        (*m).flags = flags | VmFlags::USED;
        (*m).backing = if pid == 0 {
            Backing::Owned { refcount: 1 }
        } else {
            Backing::Linked {
                owner: pid,
                shaddr: VirtAddr::zero(),
            }
        };

        insert_used_region(root, m);
        Some(VirtAddr::from_page(start))
    }
}

/// Best-fit allocation tagged with the owning process of the shared source,
/// 0 for private regions. Returns the start and the page-rounded size.
pub fn alloc_shared_region(
    mm: &mut Mm,
    root: &mut RegionRoot,
    size: usize,
    flags: VmFlags,
    pid: Tid,
) -> Option<(VirtAddr, usize)> {
    let asize = align_up(size, BASE_PAGE_SIZE);
    let pages = asize / BASE_PAGE_SIZE;

    let mut align = 0;
    let m = find_free_region(root, pages, &mut align)?;
    let va = unsafe { partition_region(mm, root, m, pages, align, flags, pid)? };
    Some((va, asize))
}

/// Best-fit private allocation.
pub fn alloc_region(
    mm: &mut Mm,
    root: &mut RegionRoot,
    size: usize,
    flags: VmFlags,
) -> Option<(VirtAddr, usize)> {
    alloc_shared_region(mm, root, size, flags, 0)
}

/// Allocation at a caller-chosen start; only succeeds when the whole range
/// lies inside one free hole.
pub fn alloc_shared_fixed_region(
    mm: &mut Mm,
    root: &mut RegionRoot,
    start: VirtAddr,
    size: usize,
    flags: VmFlags,
    pid: Tid,
) -> Option<(VirtAddr, usize)> {
    let asize = align_up(size, BASE_PAGE_SIZE);
    let pages = asize / BASE_PAGE_SIZE;
    let target = start.page();

    let mut m = find_closest_used_region(root, start)?;

    unsafe {
        // walk the neighbor list to the region actually containing target
        while !((*m).start <= target && target < (*m).end) {
            m = if target > (*m).start {
                (*m).next
            } else {
                (*m).prev
            };

            if m.is_null() {
                return None;
            }
        }

        if (*m).is_used() {
            return None;
        }

        if target + pages > (*m).end {
            return None;
        }

        let va = partition_region(mm, root, m, pages, target - (*m).start, flags, pid)?;
        Some((va, asize))
    }
}

/// Fixed-start private allocation.
pub fn alloc_fixed_region(
    mm: &mut Mm,
    root: &mut RegionRoot,
    start: VirtAddr,
    size: usize,
    flags: VmFlags,
) -> Option<(VirtAddr, usize)> {
    alloc_shared_fixed_region(mm, root, start, size, flags, 0)
}

unsafe fn try_coalesce_prev(mm: &mut Mm, root: &mut RegionRoot, m: *mut Region) {
    unsafe {
        loop {
            if m.is_null() || (*m).is_used() {
                return;
            }

            let p = (*m).prev;
            if p.is_null() || (*p).is_used() {
                return;
            }

            (*m).start = (*p).start;
            (*m).prev = (*p).prev;

            if !(*m).prev.is_null() {
                (*(*m).prev).next = m;
            }

            sptree::remove(&mut root.free_regions, &raw mut (*p).sp_n);
            let Mm { pmem, nodes } = mm;
            nodes.put(pmem, p);
        }
    }
}

unsafe fn try_coalesce_next(mm: &mut Mm, root: &mut RegionRoot, m: *mut Region) {
    unsafe {
        loop {
            if m.is_null() || (*m).is_used() {
                return;
            }

            let n = (*m).next;
            if n.is_null() || (*n).is_used() {
                return;
            }

            (*m).end = (*n).end;
            (*m).next = (*n).next;

            if !(*m).next.is_null() {
                (*(*m).next).prev = m;
            }

            sptree::remove(&mut root.free_regions, &raw mut (*n).sp_n);
            let Mm { pmem, nodes } = mm;
            nodes.put(pmem, n);
        }
    }
}

/// Release a used region found by address.
pub fn free_region(mm: &mut Mm, root: &mut RegionRoot, start: VirtAddr) -> Status {
    // an unaligned address is a corrupted or foreign pointer
    if !start.is_aligned(BASE_PAGE_SIZE) {
        return Status::ErrAlign;
    }

    let Some(m) = find_used_region(root, start) else {
        return Status::ErrNf;
    };

    free_known_region(mm, root, m);
    Status::Ok
}

/// Release a region already looked up: take it off the used tree, merge it
/// with free neighbors, insert into the free tree.
pub fn free_known_region(mm: &mut Mm, root: &mut RegionRoot, m: *mut Region) {
    unsafe {
        sptree::remove(&mut root.used_regions, &raw mut (*m).sp_n);
        (*m).flags.remove(VmFlags::USED);

        try_coalesce_prev(mm, root, m);
        try_coalesce_next(mm, root, m);
        insert_free_region(root, m);
    }
}

/// Mapping callback for map_fill_region. Receives the mm context, the page
/// table being filled, a scratch offset carried across invocations, the
/// virtual address, the flags and the page order the walker suggests.
///
/// `Ok` accepts the suggestion, `InfoTrgn` asks the walker to drop to the
/// next smaller order, any error aborts the walk.
pub type RegionHandler<'a> =
    dyn FnMut(&mut Mm, &mut Vmem, &mut usize, VirtAddr, VmFlags, Order) -> Status + 'a;

/// Walk `[start, start + bytes)` emitting maximal-order callback calls.
///
/// Iterates orders from the largest down; within one order the runner
/// advances as long as it stays aligned and enough pages remain, so a
/// region aligned to the top order is covered entirely by top-order calls.
/// Returns the actual start, or None when the handler reported an error.
pub fn map_fill_region(
    mm: &mut Mm,
    vmem: &mut Vmem,
    handler: &mut RegionHandler,
    offset: usize,
    start: VirtAddr,
    bytes: usize,
    flags: VmFlags,
) -> Option<VirtAddr> {
    let mut runner = start.page();
    let mut pages = pages_for(bytes);
    let actual_start = VirtAddr::from_page(runner);
    let mut offset = offset;

    for order in (0..orders().count()).rev() {
        if pages == 0 {
            break;
        }

        let o_pages = orders().size(order) / BASE_PAGE_SIZE;
        if !is_aligned(runner, o_pages) {
            continue;
        }

        while pages >= o_pages {
            let res = handler(
                mm,
                vmem,
                &mut offset,
                VirtAddr::from_page(runner),
                flags,
                order,
            );
            if res == Status::InfoTrgn {
                break;
            }

            if res.is_err() {
                return None;
            }

            pages -= o_pages;
            runner += o_pages;
        }
    }

    if pages != 0 {
        return None;
    }

    Some(actual_start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support;

    fn fresh_arena(mm: &mut Mm) -> RegionRoot {
        let mut root = RegionRoot::empty();
        // 1 MiB arena at 64 KiB with one reserved page
        let res = init_region(
            mm,
            &mut root,
            VirtAddr::new(0x10000),
            0x100000,
            BASE_PAGE_SIZE,
        );
        assert_eq!(res, Status::Ok);
        root
    }

    #[test]
    fn alloc_and_free_roundtrip() {
        let mut mm = support::make_mm(4 * 1024 * 1024);
        let mut root = fresh_arena(&mut mm);

        let (va, size) = alloc_region(&mut mm, &mut root, 8192, VmFlags::READ).unwrap();
        assert_eq!(size, 8192);
        let m = find_used_region(&root, va).unwrap();
        unsafe {
            assert!((*m).is_used());
            assert_eq!((*m).size_bytes(), 8192);
        }

        assert_eq!(free_region(&mut mm, &mut root, va), Status::Ok);
        assert_eq!(free_region(&mut mm, &mut root, va), Status::ErrNf);
    }

    #[test]
    fn unaligned_free_is_rejected() {
        let mut mm = support::make_mm(4 * 1024 * 1024);
        let mut root = fresh_arena(&mut mm);
        assert_eq!(
            free_region(&mut mm, &mut root, VirtAddr::new(0x10001)),
            Status::ErrAlign
        );
    }

    #[test]
    fn neighbors_tile_without_gaps() {
        let mut mm = support::make_mm(4 * 1024 * 1024);
        let mut root = fresh_arena(&mut mm);

        let mut vas = Vec::new();
        for _ in 0..8 {
            let (va, _) = alloc_region(&mut mm, &mut root, 4096, VmFlags::READ).unwrap();
            vas.push(va);
        }

        // walk the linked list from the first region: monotonic starts,
        // next.start == end, whole arena covered
        let mut m = find_first_region(&root).unwrap();
        unsafe {
            assert_eq!((*m).start, root.start);
            let mut end = (*m).end;
            while !(*m).next.is_null() {
                let n = (*m).next;
                assert_eq!((*n).start, end);
                end = (*n).end;
                m = n;
            }
            assert_eq!(end, root.end);
        }

        for va in vas {
            assert_eq!(free_region(&mut mm, &mut root, va), Status::Ok);
        }
    }

    #[test]
    fn coalescing_leaves_single_hole() {
        // allocate three adjacent pages, free in A, C, B order, expect
        // one hole spanning the arena
        let mut mm = support::make_mm(4 * 1024 * 1024);
        let mut root = fresh_arena(&mut mm);

        let (a, _) = alloc_region(&mut mm, &mut root, 4096, VmFlags::READ).unwrap();
        let (b, _) = alloc_region(&mut mm, &mut root, 4096, VmFlags::READ).unwrap();
        let (c, _) = alloc_region(&mut mm, &mut root, 4096, VmFlags::READ).unwrap();

        assert_eq!(free_region(&mut mm, &mut root, a), Status::Ok);
        assert_eq!(free_region(&mut mm, &mut root, c), Status::Ok);
        assert_eq!(free_region(&mut mm, &mut root, b), Status::Ok);

        let first = find_first_region(&root).unwrap();
        unsafe {
            assert!(!(*first).is_used());
            assert_eq!((*first).start, root.start);
            assert_eq!((*first).end, root.end);
            assert!((*first).next.is_null());
            assert!((*first).prev.is_null());
        }
    }

    #[test]
    fn fixed_alloc_requires_free_hole() {
        let mut mm = support::make_mm(4 * 1024 * 1024);
        let mut root = fresh_arena(&mut mm);

        let at = VirtAddr::new(0x20000);
        let (va, _) =
            alloc_fixed_region(&mut mm, &mut root, at, 2 * 4096, VmFlags::READ).unwrap();
        assert_eq!(va, at);

        // overlap with the now-used range must fail
        assert!(alloc_fixed_region(&mut mm, &mut root, at, 4096, VmFlags::READ).is_none());
        assert!(
            alloc_fixed_region(
                &mut mm,
                &mut root,
                at.add(4096),
                4096,
                VmFlags::READ
            )
            .is_none()
        );
    }

    #[test]
    fn reserved_zone_is_last_resort() {
        let mut mm = support::make_mm(4 * 1024 * 1024);
        let mut root = RegionRoot::empty();
        // arena of 16 pages, low 4 reserved
        init_region(
            &mut mm,
            &mut root,
            VirtAddr::new(0x10000),
            16 * BASE_PAGE_SIZE,
            4 * BASE_PAGE_SIZE,
        );

        // 12 pages fit above the reservation
        let (a, _) =
            alloc_region(&mut mm, &mut root, 12 * BASE_PAGE_SIZE, VmFlags::READ).unwrap();
        assert!(a.page() >= root.start + 4);

        // next allocation only fits by dipping towards the reserved zone,
        // and is placed at the top of the remaining hole
        let (b, _) = alloc_region(&mut mm, &mut root, 2 * BASE_PAGE_SIZE, VmFlags::READ)
            .unwrap();
        assert!(b.page() >= root.start + 2);

        // asking for more than fits above the reservation fails
        assert!(
            alloc_region(&mut mm, &mut root, 4 * BASE_PAGE_SIZE, VmFlags::READ).is_none()
        );
    }

    #[test]
    fn large_allocations_prefer_aligned_starts() {
        let mut mm = support::make_mm(8 * 1024 * 1024);
        let mut root = RegionRoot::empty();
        // 8 MiB arena at an unaligned-for-2M start
        init_region(
            &mut mm,
            &mut root,
            VirtAddr::new(0x10000),
            8 * 1024 * 1024,
            0,
        );

        let two_m = 2 * 1024 * 1024;
        let (va, _) = alloc_region(&mut mm, &mut root, two_m, VmFlags::READ).unwrap();
        assert!(va.is_aligned(two_m), "got {va}");
    }
}
