/*
 * User Virtual Memory
 *
 * Per-process facade bundling a region tracker, the hardware page table and
 * the owning thread id. Only the root thread of a process owns its Uvmem;
 * the other threads carry the owner's id and reach the structure through
 * the TCB table.
 *
 * Responsibilities:
 * - back freshly reserved regions with physical frames at the largest page
 *   orders the addresses allow (map_fill_region with an allocating handler)
 * - shared-memory lifetime: the owning region counts itself plus every
 *   live reference; frames are released when the count hits zero
 * - fork-style duplication of a whole address space
 *
 * Cross-process bookkeeping (dropping a reference must touch the owner's
 * region tree, which lives in another TCB) is routed through small caller
 * provided callbacks, so this module never looks into the thread table.
 */

use super::paging::Vmem;
use super::region::{
    self, Backing, Mm, Region, RegionRoot, alloc_fixed_region, alloc_region,
    alloc_shared_fixed_region, alloc_shared_region, find_first_region,
    find_used_region, free_known_region, map_fill_region,
};
use super::{
    BASE_PAGE, BASE_PAGE_SIZE, Order, PhysAddr, VirtAddr, VmFlags, align_down, align_up,
    order_size, orders, physmap,
};
use crate::config;
use crate::status::Status;
use crate::thread::Tid;

/// Userspace virtual memory of one process.
pub struct Uvmem {
    /// Thread id of the owning root thread. Zombie or orphaned threads keep
    /// a backwards reference here.
    pub owner: Tid,
    /// The process page table.
    pub vmem: Vmem,
    /// Region bookkeeping for the user arena.
    pub region: RegionRoot,
}

impl Uvmem {
    pub const fn empty() -> Uvmem {
        Uvmem {
            owner: 0,
            vmem: Vmem::null(),
            region: RegionRoot::empty(),
        }
    }
}

/// Called when a shared-memory reference held by a freed region must be
/// dropped: (mm, owner thread, owner-side address).
pub type UnrefSink<'a> = dyn FnMut(&mut Mm, Tid, VirtAddr) + 'a;

/// Set up the user arena of a fresh process.
pub fn init_uvmem(mm: &mut Mm, uv: &mut Uvmem, owner: Tid, vmem: Vmem) -> Status {
    let layout = config::layout();
    uv.owner = owner;
    uv.vmem = vmem;
    // the reserved low pages keep NULL and its neighborhood unmappable
    region::init_region(
        mm,
        &mut uv.region,
        layout.uvmem_start,
        layout.uvmem_end.as_usize() - layout.uvmem_start.as_usize(),
        layout.uvmem_reserved,
    )
}

/// Snap a byte range to base-page boundaries.
fn align_range(start: usize, bytes: usize) -> (usize, usize) {
    let new_start = align_down(start, BASE_PAGE_SIZE);
    let new_top = align_up(start + bytes, BASE_PAGE_SIZE);
    (new_start, new_top - new_start)
}

/// Back `[va, va+bytes)` with fresh frames, preferring the largest page
/// order each address admits; `max_ord` caps the order (shared regions are
/// forced to base pages so referrers can clone them leaf by leaf).
fn map_region(
    mm: &mut Mm,
    vmem: &mut Vmem,
    va: VirtAddr,
    bytes: usize,
    max_ord: Order,
    flags: VmFlags,
) -> Status {
    let mut handler = |mm: &mut Mm,
                       vmem: &mut Vmem,
                       _offset: &mut usize,
                       at: VirtAddr,
                       fl: VmFlags,
                       order: Order|
     -> Status {
        if order > max_ord {
            return Status::InfoTrgn;
        }

        let Some(page) = mm.pmem.alloc_page(order) else {
            // a smaller order may still have pages
            return if order == BASE_PAGE {
                Status::ErrOomem
            } else {
                Status::InfoTrgn
            };
        };

        let res = vmem.map_vpage(&mut mm.pmem, page, at, fl, order);
        if res.is_err() {
            mm.pmem.free_page(order, page);
            return if order == BASE_PAGE { res } else { Status::InfoTrgn };
        }

        Status::Ok
    };

    match map_fill_region(mm, vmem, &mut handler, 0, va, bytes, flags) {
        Some(_) => Status::Ok,
        None => Status::ErrOomem,
    }
}

/// Map `[va, va+bytes)` onto the fixed physical range starting at `pa`,
/// base page by base page. Device memory path; no frames are allocated.
fn map_fixed_region(
    mm: &mut Mm,
    vmem: &mut Vmem,
    va: VirtAddr,
    pa: PhysAddr,
    bytes: usize,
    flags: VmFlags,
) -> Status {
    let (start, bytes) = align_range(pa.as_usize(), bytes);

    let mut handler = |mm: &mut Mm,
                       vmem: &mut Vmem,
                       offset: &mut usize,
                       at: VirtAddr,
                       fl: VmFlags,
                       order: Order|
     -> Status {
        if order != BASE_PAGE {
            return Status::InfoTrgn;
        }

        let page = PhysAddr::new(*offset);
        let res = vmem.map_vpage(&mut mm.pmem, page, at, fl, order);
        if res.is_err() {
            return res;
        }

        *offset += BASE_PAGE_SIZE;
        Status::Ok
    };

    match map_fill_region(mm, vmem, &mut handler, start, va, bytes, flags) {
        Some(_) => Status::Ok,
        None => Status::ErrMisc,
    }
}

/// Install leaf-identical mappings of `[from, from+bytes)` in `src` at `to`
/// in `dst`, pointing at the same frames.
fn clone_mapped_region(
    mm: &mut Mm,
    dst: &mut Vmem,
    src: Vmem,
    from: VirtAddr,
    to: VirtAddr,
    bytes: usize,
    flags: VmFlags,
) -> Status {
    let (_, bytes) = align_range(from.as_usize(), bytes);
    let mut from = from;
    let mut to = to;
    let mut left = bytes;

    while left > 0 {
        let (pa, order, _) = match src.stat_vpage(from) {
            Ok(found) => found,
            Err(e) => return e,
        };

        let res = dst.map_vpage(&mut mm.pmem, pa, to, flags, order);
        if res.is_err() {
            return res;
        }

        let size = order_size(order);
        left = left.saturating_sub(size);
        from = from.add(size);
        to = to.add(size);
    }

    Status::Ok
}

/// Copy `[from, from+bytes)` of `src` into fresh frames mapped at `to` in
/// `dst`, page order by page order.
fn copy_mapped_region(
    mm: &mut Mm,
    dst: &mut Vmem,
    src: Vmem,
    from: VirtAddr,
    to: VirtAddr,
    bytes: usize,
) -> Status {
    let (_, bytes) = align_range(from.as_usize(), bytes);
    let mut from = from;
    let mut to = to;
    let mut left = bytes;

    while left > 0 {
        let (pa, order, flags) = match src.stat_vpage(from) {
            Ok(found) => found,
            Err(e) => return e,
        };

        let Some(page) = mm.pmem.alloc_page(order) else {
            return Status::ErrOomem;
        };

        let res = dst.map_vpage(&mut mm.pmem, page, to, flags, order);
        if res.is_err() {
            mm.pmem.free_page(order, page);
            return res;
        }

        let size = order_size(order);
        unsafe { physmap::phys_copy(page, pa, size) };

        left = left.saturating_sub(size);
        from = from.add(size);
        to = to.add(size);
    }

    Status::Ok
}

/// Tear down the mappings of `[va, va+bytes)` and free the frames behind
/// them. Stops at the first unmapped page; the fill walker maps regions as
/// one contiguous run from the start, so a hole marks the end of a partial
/// mapping.
fn unmap_region(mm: &mut Mm, vmem: &mut Vmem, va: VirtAddr, bytes: usize) {
    let (start, bytes) = align_range(va.as_usize(), bytes);
    let mut va = VirtAddr::new(start);
    let mut left = bytes;

    while left > 0 {
        let Ok((pa, order, _)) = vmem.stat_vpage(va) else {
            return;
        };

        vmem.unmap_vpage(&mut mm.pmem, va);
        mm.pmem.free_page(order, pa);

        let size = order_size(order);
        left = left.saturating_sub(size);
        va = va.add(size);
    }
}

/// Tear down mappings without releasing the frames, for regions whose
/// frames belong to someone else.
fn unmap_fixed_region(mm: &mut Mm, vmem: &mut Vmem, va: VirtAddr, bytes: usize) {
    let (start, bytes) = align_range(va.as_usize(), bytes);
    let mut va = VirtAddr::new(start);
    let mut left = bytes;

    while left > 0 {
        let Ok((_, order, _)) = vmem.stat_vpage(va) else {
            return;
        };

        vmem.unmap_vpage(&mut mm.pmem, va);

        let size = order_size(order);
        left = left.saturating_sub(size);
        va = va.add(size);
    }
}

/// Drop the mapping behind a region: frames are freed only when the region
/// owns them. A reference to another process's shared region is reported
/// through `on_unref`.
unsafe fn free_mapping(mm: &mut Mm, uv: &mut Uvmem, m: *mut Region, on_unref: &mut UnrefSink) {
    unsafe {
        let start = (*m).start_addr();
        let bytes = (*m).size_bytes();

        match (*m).backing {
            Backing::Linked { owner, shaddr } => {
                unmap_fixed_region(mm, &mut uv.vmem, start, bytes);
                on_unref(mm, owner, shaddr);
            }
            Backing::Owned { .. } => {
                if (*m).flags.contains(VmFlags::NONBACKED) {
                    unmap_fixed_region(mm, &mut uv.vmem, start, bytes);
                } else {
                    unmap_region(mm, &mut uv.vmem, start, bytes);
                }
            }
        }
    }
}

/// Drop one reference to the shared region at `shaddr` in its owner's
/// space; the frames go away with the last one.
pub fn unref_shared_region(mm: &mut Mm, owner_uv: &mut Uvmem, shaddr: VirtAddr) {
    let Some(m) = find_used_region(&owner_uv.region, shaddr) else {
        return;
    };

    unsafe {
        let Backing::Owned { refcount } = &mut (*m).backing else {
            return;
        };

        assert!(*refcount >= 1, "shared region refcount underflow");
        *refcount -= 1;
        if *refcount > 0 {
            return;
        }

        let start = (*m).start_addr();
        let bytes = (*m).size_bytes();
        unmap_region(mm, &mut owner_uv.vmem, start, bytes);
        free_known_region(mm, &mut owner_uv.region, m);
    }
}

/// Reserve and back a fresh region. Returns the start and the page-rounded
/// size; on failure any partial mapping is rolled back.
pub fn alloc_uvmem(
    mm: &mut Mm,
    uv: &mut Uvmem,
    size: usize,
    flags: VmFlags,
) -> Result<(VirtAddr, usize), Status> {
    let (va, asize) =
        alloc_region(mm, &mut uv.region, size, flags).ok_or(Status::ErrOomem)?;

    let mut vmem = uv.vmem;
    let res = map_region(mm, &mut vmem, va, asize, orders().max_order(), flags);
    if res.is_err() {
        unmap_region(mm, &mut vmem, va, asize);
        region::free_region(mm, &mut uv.region, va);
        return Err(res);
    }

    Ok((va, asize))
}

/// Like alloc_uvmem at a caller-fixed address.
pub fn alloc_fixed_uvmem(
    mm: &mut Mm,
    uv: &mut Uvmem,
    start: VirtAddr,
    size: usize,
    flags: VmFlags,
) -> Result<(VirtAddr, usize), Status> {
    let (va, asize) = alloc_fixed_region(mm, &mut uv.region, start, size, flags)
        .ok_or(Status::ErrOomem)?;

    let mut vmem = uv.vmem;
    let res = map_region(mm, &mut vmem, va, asize, orders().max_order(), flags);
    if res.is_err() {
        unmap_region(mm, &mut vmem, va, asize);
        region::free_region(mm, &mut uv.region, va);
        return Err(res);
    }

    Ok((va, asize))
}

/// Allocate a shareable region. Committed with base pages only, so a
/// referrer in a different top-level table can clone the mapping leaf by
/// leaf.
pub fn alloc_shared_uvmem(
    mm: &mut Mm,
    uv: &mut Uvmem,
    size: usize,
    flags: VmFlags,
) -> Result<(VirtAddr, usize), Status> {
    let (va, asize) = alloc_region(mm, &mut uv.region, size, flags | VmFlags::SHARED)
        .ok_or(Status::ErrOomem)?;

    let mut vmem = uv.vmem;
    let res = map_region(mm, &mut vmem, va, asize, BASE_PAGE, flags);
    if res.is_err() {
        unmap_region(mm, &mut vmem, va, asize);
        region::free_region(mm, &mut uv.region, va);
        return Err(res);
    }

    Ok((va, asize))
}

/// Map a fixed physical range (device memory). The region is NONBACKED:
/// freeing it unmaps without touching the frames.
pub fn alloc_devmem(
    mm: &mut Mm,
    uv: &mut Uvmem,
    pa: PhysAddr,
    size: usize,
    flags: VmFlags,
) -> Result<(VirtAddr, usize), Status> {
    if !pa.is_aligned(BASE_PAGE_SIZE) {
        return Err(Status::ErrAlign);
    }

    let (va, asize) = alloc_region(mm, &mut uv.region, size, flags | VmFlags::NONBACKED)
        .ok_or(Status::ErrOomem)?;

    let mut vmem = uv.vmem;
    let res = map_fixed_region(mm, &mut vmem, va, pa, asize, flags);
    if res.is_err() {
        unmap_fixed_region(mm, &mut vmem, va, asize);
        region::free_region(mm, &mut uv.region, va);
        return Err(res);
    }

    Ok((va, asize))
}

/// Reference a shared region of `src` (owned by thread `owner_rid`) from
/// `dst`. The new region borrows the owner's frames and remembers where
/// they came from; the owner's refcount goes up by one. The caller adds the
/// matching thread reference.
pub fn ref_shared_uvmem(
    mm: &mut Mm,
    dst: &mut Uvmem,
    src: &mut Uvmem,
    owner_rid: Tid,
    va: VirtAddr,
    flags: VmFlags,
) -> Result<(VirtAddr, usize), Status> {
    let m = find_used_region(&src.region, va).ok_or(Status::ErrNf)?;

    unsafe {
        if !(*m).flags.contains(VmFlags::SHARED) {
            return Err(Status::ErrInval);
        }

        let bytes = (*m).size_bytes();
        let region_flags = (*m).flags | VmFlags::NONBACKED;
        let (v, asize) =
            alloc_shared_region(mm, &mut dst.region, bytes, region_flags, owner_rid)
                .ok_or(Status::ErrOomem)?;

        let mut dst_vmem = dst.vmem;
        let res = clone_mapped_region(mm, &mut dst_vmem, src.vmem, va, v, asize, flags);
        if res.is_err() {
            unmap_fixed_region(mm, &mut dst_vmem, v, asize);
            region::free_region(mm, &mut dst.region, v);
            return Err(res);
        }

        let d = find_used_region(&dst.region, v).ok_or(Status::ErrMisc)?;
        (*d).backing = Backing::Linked {
            owner: owner_rid,
            shaddr: va,
        };

        let Backing::Owned { refcount } = &mut (*m).backing else {
            return Err(Status::ErrInval);
        };
        *refcount += 1;

        Ok((v, asize))
    }
}

/// Duplicate `src` into the empty `dst` (fork). Private regions are copied
/// frame by frame; references to foreign shared regions are re-referenced.
/// `resolve` maps an owner thread id to its Uvmem, `on_ref` records the
/// extra thread reference a cloned link takes.
pub fn copy_uvmem(
    mm: &mut Mm,
    dst: &mut Uvmem,
    src: &Uvmem,
    resolve: &mut dyn FnMut(Tid) -> Option<*mut Uvmem>,
    on_ref: &mut dyn FnMut(Tid),
) -> Status {
    let Some(mut m) = find_first_region(&src.region) else {
        return Status::Ok;
    };

    unsafe {
        while !m.is_null() {
            if !(*m).is_used() {
                m = (*m).next;
                continue;
            }

            let start = (*m).start_addr();
            let bytes = (*m).size_bytes();

            let res = match (*m).backing {
                Backing::Owned { .. } => {
                    copy_owned_region(mm, dst, src, m, start, bytes)
                }
                Backing::Linked { owner, shaddr } => copy_linked_region(
                    mm, dst, m, owner, shaddr, start, bytes, resolve, on_ref,
                ),
            };

            if res.is_err() {
                return res;
            }

            m = (*m).next;
        }
    }

    Status::Ok
}

unsafe fn copy_owned_region(
    mm: &mut Mm,
    dst: &mut Uvmem,
    src: &Uvmem,
    m: *mut Region,
    start: VirtAddr,
    bytes: usize,
) -> Status {
    unsafe {
        let flags = (*m).flags;
        if alloc_fixed_region(mm, &mut dst.region, start, bytes, flags).is_none() {
            return Status::ErrOomem;
        }

        if flags.contains(VmFlags::NONBACKED) {
            return Status::Ok;
        }

        let mut dst_vmem = dst.vmem;
        let res = copy_mapped_region(mm, &mut dst_vmem, src.vmem, start, start, bytes);
        if res.is_err() {
            region::free_region(mm, &mut dst.region, start);
            unmap_region(mm, &mut dst_vmem, start, bytes);
            return res;
        }

        Status::Ok
    }
}

#[allow(clippy::too_many_arguments)]
unsafe fn copy_linked_region(
    mm: &mut Mm,
    dst: &mut Uvmem,
    m: *mut Region,
    owner: Tid,
    shaddr: VirtAddr,
    start: VirtAddr,
    bytes: usize,
    resolve: &mut dyn FnMut(Tid) -> Option<*mut Uvmem>,
    on_ref: &mut dyn FnMut(Tid),
) -> Status {
    unsafe {
        let Some(owner_uv) = resolve(owner) else {
            return Status::ErrNf;
        };

        let flags = (*m).flags;
        if alloc_shared_fixed_region(mm, &mut dst.region, start, bytes, flags, owner)
            .is_none()
        {
            return Status::ErrOomem;
        }

        let mut dst_vmem = dst.vmem;
        let res = clone_mapped_region(
            mm,
            &mut dst_vmem,
            (*owner_uv).vmem,
            shaddr,
            start,
            bytes,
            flags,
        );
        if res.is_err() {
            region::free_region(mm, &mut dst.region, start);
            unmap_fixed_region(mm, &mut dst_vmem, start, bytes);
            return res;
        }

        let Some(d) = find_used_region(&dst.region, start) else {
            return Status::ErrMisc;
        };
        (*d).backing = Backing::Linked { owner, shaddr };

        if let Some(src_m) = find_used_region(&(*owner_uv).region, shaddr)
            && let Backing::Owned { refcount } = &mut (*src_m).backing
        {
            *refcount += 1;
        }

        on_ref(owner);
        Status::Ok
    }
}

/// Free one allocation by start address. A shared owner with outstanding
/// references cannot be freed this way.
pub fn free_uvmem(
    mm: &mut Mm,
    uv: &mut Uvmem,
    va: VirtAddr,
    on_unref: &mut UnrefSink,
) -> Status {
    let Some(m) = find_used_region(&uv.region, va) else {
        return Status::ErrNf;
    };

    unsafe {
        if let Backing::Owned { refcount } = (*m).backing
            && refcount > 1
        {
            return Status::ErrInval;
        }

        free_mapping(mm, uv, m, on_unref);
        free_known_region(mm, &mut uv.region, m);
    }

    Status::Ok
}

/// Free every region not marked KEEP. The owner's own hold on a shared
/// region is dropped, but the region survives until its last referrer lets
/// go.
pub fn clear_uvmem(mm: &mut Mm, uv: &mut Uvmem, on_unref: &mut UnrefSink) {
    let Some(mut m) = find_first_region(&uv.region) else {
        return;
    };

    unsafe {
        while !m.is_null() {
            if (*m).is_kept() || !(*m).is_used() {
                m = (*m).next;
                continue;
            }

            if let Backing::Owned { refcount } = &mut (*m).backing
                && *refcount > 1
            {
                // someone still references this shared region; drop our own
                // count so it dies with the last referrer
                *refcount -= 1;
                m = (*m).next;
                continue;
            }

            free_mapping(mm, uv, m, on_unref);
            free_known_region(mm, &mut uv.region, m);
            // the node survives the free and its neighbor links were
            // refreshed by coalescing, so the walk continues from it
            m = (*m).next;
        }
    }
}

/// Free everything, KEEP or not, and drop all region nodes.
pub fn purge_uvmem(mm: &mut Mm, uv: &mut Uvmem, on_unref: &mut UnrefSink) {
    let first = find_first_region(&uv.region);
    if let Some(mut m) = first {
        unsafe {
            while !m.is_null() {
                if !(*m).is_used() {
                    m = (*m).next;
                    continue;
                }

                if let Backing::Owned { refcount } = &mut (*m).backing
                    && *refcount > 1
                {
                    // outstanding references keep the frames alive; they
                    // are orphaned to the referrers rather than yanked
                    *refcount -= 1;
                    m = (*m).next;
                    continue;
                }

                free_mapping(mm, uv, m, on_unref);
                m = (*m).next;
            }
        }
    }

    region::destroy_region(mm, &mut uv.region);
}

/// Purge and destroy the page table itself. Idempotent, a killed process
/// can be reaped through here a second time.
pub fn destroy_uvmem(mm: &mut Mm, uv: &mut Uvmem, on_unref: &mut UnrefSink) {
    if uv.vmem.is_null() {
        return;
    }

    purge_uvmem(mm, uv, on_unref);
    uv.vmem.destroy(&mut mm.pmem);
    uv.vmem = Vmem::null();
}
