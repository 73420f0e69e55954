/*
 * Physical Page Allocator
 *
 * Allocates physical pages of any supported order. Each order owns a bucket
 * of bitmaps; every bitmap of bucket o covers exactly one page of order o+1,
 * and a freelist chains the bitmaps that still have unset bits. When an
 * order runs dry it allocates one page from the order above, resets the
 * bitmap covering it and hands out pieces; when a bitmap empties again the
 * higher-order page is given back (demotion cascade in reverse).
 *
 * A bit is 1 iff the corresponding page is allocated or covered by a
 * higher-order allocation. Bitmaps with no free bits are detached from the
 * freelist but persist in the contiguous per-bucket array, so address
 * arithmetic can always find them again.
 *
 * All structures live inside the managed RAM itself, at a spot the boot
 * code picks after probing the required size; probe and populate must agree
 * on that size byte for byte.
 */

use core::ptr;

use super::bitmap;
use super::physmap;
use super::{BASE_PAGE, BASE_PAGE_SIZE, Order, PhysAddr, align_up, orders};
use crate::status::Status;

/// Page bitmap node. Trailed by its bit array in memory.
#[repr(C)]
struct Bmap {
    /// Valid bits in this node. Usually the bucket's full width, smaller for
    /// a trailing node covering the end of RAM.
    size: usize,
    /// Count of set bits.
    used: usize,
    /// Freelist links.
    next: *mut Bmap,
    prev: *mut Bmap,
    // u8 bits[] follows
}

/// Bucket of bitmaps for one page order. Trailed by the contiguous bitmap
/// array.
#[repr(C)]
struct Bucket {
    /// Bits per regular bitmap node.
    bits: usize,
    /// Byte size of a page of this order.
    page_size: usize,
    /// Total pages of this order the bucket covers.
    pages: usize,
    /// Freelist head.
    head: *mut Bmap,
    // struct Bmap bmap[] follows
}

/// Byte size of one bitmap node slot for a bucket width.
fn set_size(bits: usize) -> usize {
    align_up(size_of::<Bmap>() + bits.div_ceil(8), align_of::<Bmap>())
}

/// The physical map: one bucket per order present in RAM.
pub struct Pmem {
    /// Physical base of the managed RAM range.
    base: PhysAddr,
    buckets: [*mut Bucket; super::MAX_ORDERS],
    /// Bytes currently in use.
    used: usize,
}

// Raw bucket pointers are only touched under the big kernel lock.
unsafe impl Send for Pmem {}

impl Pmem {
    /// Bitmap bit slice of a node.
    ///
    /// # Safety
    ///
    /// `bmap` must point at a live node whose trailing array holds at least
    /// `size` bits.
    unsafe fn bits_of<'a>(bmap: *mut Bmap) -> &'a mut [u8] {
        unsafe {
            let base = bmap.add(1) as *mut u8;
            core::slice::from_raw_parts_mut(base, (*bmap).size.div_ceil(8))
        }
    }

    /// Node at index `set` within a bucket.
    unsafe fn get_set(bucket: *mut Bucket, set: usize) -> *mut Bmap {
        unsafe {
            let first = bucket.add(1) as *mut u8;
            first.add(set_size((*bucket).bits) * set) as *mut Bmap
        }
    }

    /// Index of a node within its bucket.
    unsafe fn get_set_index(bucket: *mut Bucket, bmap: *mut Bmap) -> usize {
        unsafe {
            let first = bucket.add(1) as usize;
            (bmap as usize - first) / set_size((*bucket).bits)
        }
    }

    /// Attach a node to its bucket's freelist. No-op if already attached;
    /// a linked tail node only betrays itself through its prev pointer, so
    /// both links are checked. Newly attached nodes go to the head, keeping
    /// hot bitmaps hot.
    unsafe fn attach_set(bucket: *mut Bucket, bmap: *mut Bmap) {
        unsafe {
            if !(*bmap).next.is_null()
                || !(*bmap).prev.is_null()
                || (*bucket).head == bmap
            {
                return;
            }

            (*bmap).next = (*bucket).head;
            (*bucket).head = bmap;
            if !(*bmap).next.is_null() {
                (*(*bmap).next).prev = bmap;
            }
        }
    }

    /// Remove a node from its bucket's freelist.
    unsafe fn detach_set(bucket: *mut Bucket, bmap: *mut Bmap) {
        unsafe {
            if (*bucket).head == bmap {
                (*bucket).head = (*bmap).next;
            }

            if !(*bmap).next.is_null() {
                (*(*bmap).next).prev = (*bmap).prev;
            }

            if !(*bmap).prev.is_null() {
                (*(*bmap).prev).next = (*bmap).next;
            }

            (*bmap).next = ptr::null_mut();
            (*bmap).prev = ptr::null_mut();
        }
    }

    /// Physical address of the page at (node, bit) within a bucket.
    unsafe fn page_addr(&self, bucket: *mut Bucket, set: usize, bit: usize) -> PhysAddr {
        unsafe {
            self.base
                .add(set * (*bucket).page_size * (*bucket).bits)
                .add(bit * (*bucket).page_size)
        }
    }

    /// Node index and bit an address corresponds to, or None when the
    /// address lies beyond the bucket's coverage (trailing scraps of RAM).
    unsafe fn get_bit(&self, bucket: *mut Bucket, addr: PhysAddr) -> Option<(usize, usize)> {
        unsafe {
            let off = addr.as_usize() - self.base.as_usize();
            let page = off / (*bucket).page_size;
            if page >= (*bucket).pages {
                return None;
            }

            Some((page / (*bucket).bits, page % (*bucket).bits))
        }
    }

    fn bucket(&self, order: Order) -> *mut Bucket {
        if order >= orders().count() {
            return ptr::null_mut();
        }

        self.buckets[order]
    }

    /// Non-accounting worker for free_page. Returns whether the usage
    /// counter should be updated.
    unsafe fn do_free(&mut self, order: Order, addr: PhysAddr) -> bool {
        let bucket = self.bucket(order);
        if bucket.is_null() {
            return false;
        }

        unsafe {
            let Some((set, bit)) = self.get_bit(bucket, addr) else {
                return false;
            };

            let bmap = Self::get_set(bucket, set);
            assert!((*bmap).used > 0, "double free of {addr}");
            (*bmap).used -= 1;

            let bits = Self::bits_of(bmap);
            assert!(bitmap::is_set(bits, bit), "double free of {addr}");
            bitmap::clear(bits, bit);
            Self::attach_set(bucket, bmap);

            if (*bmap).used == 0 {
                Self::detach_set(bucket, bmap);

                // a completely clear bitmap covering a full higher-order
                // page hands that page back
                if (*bmap).size == orders().width(order) && orders().width(order) != 0 {
                    self.do_free(order + 1, self.page_addr(bucket, set, bit));
                }
            }
        }

        true
    }

    /// Free a previously allocated page. Freeing at a different order than
    /// the page was allocated at corrupts the map; freeing an unallocated
    /// page is a kernel bug and panics.
    pub fn free_page(&mut self, order: Order, addr: PhysAddr) {
        if unsafe { self.do_free(order, addr) } {
            self.used -= orders().size(order);
        }
    }

    /// Non-accounting worker for alloc_page.
    unsafe fn do_alloc(&mut self, order: Order) -> Option<PhysAddr> {
        let bucket = self.bucket(order);
        if bucket.is_null() {
            return None;
        }

        unsafe {
            let mut bmap = (*bucket).head;
            if bmap.is_null() {
                // order is dry, split one page of the order above
                let above = self.do_alloc(order + 1)?;

                let (set, _) = self.get_bit(bucket, above)?;
                bmap = Self::get_set(bucket, set);
                (*bmap).size = orders().width(order);
                (*bmap).used = 0;
                (*bmap).next = ptr::null_mut();
                (*bmap).prev = ptr::null_mut();
                bitmap::clear_all(Self::bits_of(bmap), (*bmap).size);
                Self::attach_set(bucket, bmap);
                return self.do_alloc(order);
            }

            (*bmap).used += 1;

            let set = Self::get_set_index(bucket, bmap);
            let bits = Self::bits_of(bmap);
            let bit = bitmap::find_first_unset(bits, (*bmap).size)
                .expect("bitmap on freelist with no free bits");
            bitmap::set(bits, bit);

            if (*bmap).used == (*bmap).size {
                Self::detach_set(bucket, bmap);
            }

            Some(self.page_addr(bucket, set, bit))
        }
    }

    /// Allocate one page of the given order. None when RAM of that order is
    /// exhausted.
    pub fn alloc_page(&mut self, order: Order) -> Option<PhysAddr> {
        let page = unsafe { self.do_alloc(order) };
        if page.is_some() {
            self.used += orders().size(order);
        }

        page
    }

    /// Non-accounting worker for mark_used.
    unsafe fn do_mark_used(&mut self, order: Order, addr: PhysAddr) -> bool {
        let bucket = self.bucket(order);
        if bucket.is_null() {
            return false;
        }

        unsafe {
            let Some((set, bit)) = self.get_bit(bucket, addr) else {
                return false;
            };

            let bmap = Self::get_set(bucket, set);
            if (*bmap).used == 0 {
                bitmap::clear_all(Self::bits_of(bmap), (*bmap).size);
                Self::attach_set(bucket, bmap);
                self.do_mark_used(order + 1, addr);
            }

            // a page already in use is left alone, boot-time reservations
            // are allowed to overlap
            let bits = Self::bits_of(bmap);
            if bitmap::is_set(bits, bit) {
                return false;
            }

            (*bmap).used += 1;
            bitmap::set(bits, bit);

            if (*bmap).used == (*bmap).size {
                Self::detach_set(bucket, bmap);
            }
        }

        true
    }

    /// Mark a specific physical page in use. Idempotent; used at boot to
    /// reserve the kernel image, FDT, initrd, the map itself and every
    /// reserved-memory range.
    pub fn mark_used(&mut self, order: Order, addr: PhysAddr) {
        if unsafe { self.do_mark_used(order, addr) } {
            self.used += orders().size(order);
        }
    }

    /// Mark a whole byte range used, page by page.
    pub fn mark_area_used(&mut self, base: PhysAddr, top: PhysAddr) {
        if top < base {
            panic!("mark_area_used: top {top} < base {base}");
        }

        let mut area_left = top.as_usize() - base.as_usize();
        let mut runner = base;
        while area_left >= BASE_PAGE_SIZE {
            self.mark_used(BASE_PAGE, runner);
            runner = runner.add(BASE_PAGE_SIZE);
            area_left -= BASE_PAGE_SIZE;
        }

        if area_left != 0 {
            self.mark_used(BASE_PAGE, runner);
        }
    }

    /// Bytes currently allocated or reserved.
    pub fn query_used(&self) -> usize {
        self.used
    }

    /// Probe/populate worker for one bucket. `bucket` is a direct-mapped
    /// cursor when populating, a plain byte counter when probing. Returns
    /// the cursor right after the bucket's last byte.
    unsafe fn maybe_populate_bucket(
        bucket: *mut Bucket,
        mut n: usize,
        order: Order,
        first: bool,
        populate: bool,
    ) -> usize {
        let mut bits = orders().width(order);
        if bits == 0 {
            bits = n;
        }

        if populate {
            unsafe {
                (*bucket).bits = bits;
                (*bucket).page_size = orders().size(order);
                (*bucket).pages = n;
                (*bucket).head = ptr::null_mut();
            }
        }

        let slot = set_size(bits);
        let mut cont = bucket as usize + size_of::<Bucket>();

        let sets = n / bits;
        for _ in 0..sets {
            if populate {
                unsafe {
                    let bmap = cont as *mut Bmap;
                    ptr::write_bytes(bmap as *mut u8, 0, slot);
                    (*bmap).size = bits;
                    if first {
                        Self::attach_set(bucket, bmap);
                    }
                }
            }

            n -= bits;
            cont += slot;
        }

        if n != 0 {
            if populate {
                unsafe {
                    let bmap = cont as *mut Bmap;
                    ptr::write_bytes(bmap as *mut u8, 0, slot);
                    (*bmap).size = n;
                    if first {
                        Self::attach_set(bucket, bmap);
                    }
                }
            }

            cont += slot;
        }

        cont
    }

    /// Probe how many bytes the map needs, or populate it. One algorithm
    /// with a write switch, so the two cannot disagree about the size.
    unsafe fn maybe_populate(
        &mut self,
        ram_size: usize,
        start: PhysAddr,
        populate: bool,
    ) -> usize {
        // work in direct-mapped addresses so bucket-internal pointers come
        // out dereferencable
        let mut cont = if populate {
            physmap::phys_to_virt(start).as_usize()
        } else {
            start.as_usize()
        };
        let begin = cont;

        let mut first = true;
        for order in (0..orders().count()).rev() {
            let num = ram_size / orders().size(order);
            if num == 0 {
                continue;
            }

            let bucket = cont as *mut Bucket;
            if populate {
                self.buckets[order] = bucket;
            }

            cont = unsafe {
                Self::maybe_populate_bucket(bucket, num, order, first, populate)
            };
            first = false;
        }

        cont - begin
    }

    /// Size in bytes the physical map will occupy for a RAM range.
    pub fn probe_pmap(ram_size: usize) -> usize {
        let mut probe = Pmem {
            base: PhysAddr::zero(),
            buckets: [ptr::null_mut(); super::MAX_ORDERS],
            used: 0,
        };
        unsafe { probe.maybe_populate(ram_size, PhysAddr::zero(), false) }
    }

    /// Build the physical map at `start`. Returns the map and the bytes it
    /// wrote, which the boot code checks against probe_pmap.
    ///
    /// # Safety
    ///
    /// `[start, start + probe_pmap(ram_size))` must be unused RAM inside
    /// `[ram_base, ram_base + ram_size)` and the direct map must be up.
    pub unsafe fn populate_pmap(
        ram_base: PhysAddr,
        ram_size: usize,
        start: PhysAddr,
    ) -> (Pmem, usize) {
        let mut pmem = Pmem {
            base: ram_base,
            buckets: [ptr::null_mut(); super::MAX_ORDERS],
            used: 0,
        };
        let size = unsafe { pmem.maybe_populate(ram_size, start, true) };
        (pmem, size)
    }
}

/// One physical range the boot code wants kept out of the allocator.
#[derive(Debug, Clone, Copy, Default)]
pub struct AvoidRegion {
    pub base: PhysAddr,
    pub size: usize,
}

/// Overlap test between two physical ranges.
fn overlaps(base1: PhysAddr, size1: usize, base2: PhysAddr, size2: usize) -> bool {
    let (b1, b2) = (base1.as_usize(), base2.as_usize());
    let bottom = b1 >= b2 && b1 < b2 + size2;
    let top = b1 + size1 > b2 && b1 + size1 <= b2 + size2;
    bottom || top
}

/// Pick a base for a block of `size` bytes inside RAM that overlaps none of
/// the avoidance regions. Tries the word-aligned address right after each
/// region; regions outside RAM (ROM and friends) just never match.
pub fn select_base(
    ram_base: PhysAddr,
    ram_size: usize,
    size: usize,
    avoid: &[AvoidRegion],
) -> Option<PhysAddr> {
    'candidate: for region in avoid {
        let base = PhysAddr::new(align_up(
            region.base.as_usize() + region.size,
            size_of::<usize>(),
        ));

        if !overlaps(base, size, ram_base, ram_size) {
            continue;
        }

        for other in avoid {
            if overlaps(base, size, other.base, other.size) {
                continue 'candidate;
            }
        }

        return Some(base);
    }

    None
}

/// Boot entry: probe the map size, place it while avoiding the regions the
/// bootstrap found, populate, verify probe == populate, then reserve every
/// avoided range that lies in RAM.
pub fn init_pmem(
    ram_base: PhysAddr,
    ram_size: usize,
    avoid: &mut heapless::Vec<AvoidRegion, 64>,
) -> Result<Pmem, Status> {
    log::info!("initializing pmem");
    log::info!(
        "using ram range [{:#x} - {:#x}]",
        ram_base.as_usize(),
        ram_base.as_usize() + ram_size
    );

    let probe_size = Pmem::probe_pmap(ram_size);
    log::info!("pmem map probe size returned {}", probe_size);

    let pmap_base =
        select_base(ram_base, ram_size, probe_size, avoid).ok_or(Status::ErrOomem)?;
    log::info!("choosing to place pmem map at {}", pmap_base);

    let (mut pmem, actual_size) =
        unsafe { Pmem::populate_pmap(ram_base, ram_size, pmap_base) };
    if probe_size != actual_size {
        panic!("probe_size ({probe_size:#x}) != actual_size ({actual_size:#x})");
    }

    avoid
        .push(AvoidRegion {
            base: pmap_base,
            size: actual_size,
        })
        .map_err(|_| Status::ErrOomem)?;

    for region in avoid.iter() {
        if !overlaps(region.base, region.size, ram_base, ram_size) {
            continue;
        }

        let top = region.base.add(region.size);
        pmem.mark_area_used(region.base, top);
        log::info!(
            "marked [{:#x} - {:#x}] reserved",
            region.base.as_usize(),
            top.as_usize()
        );
    }

    Ok(pmem)
}
