/*
 * Direct Physical Map
 *
 * The kernel keeps all of RAM mapped at a fixed offset in the high half of
 * the address space: VA(p) = p + offset. The mapping is established once by
 * the bootstrap (or by the test harness, which points the offset at a heap
 * arena standing in for RAM) and never changes, so translation is pure
 * arithmetic.
 *
 * All kernel access to physical memory goes through here; nothing else in
 * the crate casts a physical address to a pointer.
 */

use spin::Once;

use super::{PhysAddr, VirtAddr};

static OFFSET: Once<usize> = Once::new();

/// Install the direct-map offset. Called exactly once, before any physical
/// memory is touched.
pub fn init(offset: usize) {
    OFFSET.call_once(|| offset);
}

/// The active direct-map offset.
pub fn offset() -> usize {
    *OFFSET.get().expect("physmap not initialized")
}

/// Translate a physical address into its direct-mapped virtual address.
pub fn phys_to_virt(pa: PhysAddr) -> VirtAddr {
    VirtAddr::new(pa.as_usize().wrapping_add(offset()))
}

/// Translate a direct-mapped virtual address back to physical.
pub fn virt_to_phys(va: VirtAddr) -> PhysAddr {
    PhysAddr::new(va.as_usize().wrapping_sub(offset()))
}

/// Get a typed pointer to physical memory through the direct map.
///
/// # Safety
///
/// `pa` must point at RAM owned by the caller for the duration of the
/// accesses made through the returned pointer, and the direct map must have
/// been initialized.
pub unsafe fn phys_ptr<T>(pa: PhysAddr) -> *mut T {
    phys_to_virt(pa).as_usize() as *mut T
}

/// Zero a byte range of physical memory.
///
/// # Safety
///
/// Same requirements as `phys_ptr`, for the whole range.
pub unsafe fn phys_zero(pa: PhysAddr, len: usize) {
    unsafe { core::ptr::write_bytes(phys_ptr::<u8>(pa), 0, len) };
}

/// Copy between two non-overlapping physical ranges.
///
/// # Safety
///
/// Same requirements as `phys_ptr`, for both ranges, which must not overlap.
pub unsafe fn phys_copy(dst: PhysAddr, src: PhysAddr, len: usize) {
    unsafe {
        core::ptr::copy_nonoverlapping(phys_ptr::<u8>(src), phys_ptr::<u8>(dst), len)
    };
}
