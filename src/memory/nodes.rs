/*
 * Node Slab
 *
 * Fixed-size object allocator over base pages, in the style of a one-bucket
 * jemalloc: every base page starts with a small header, then an occupancy
 * bitmap, then an array of equally sized node slots. A list links all pages
 * of a pool together and a second list tracks pages that still have free
 * slots; freeing the last node of a page returns the page to the physical
 * allocator, except for the last remaining page which is kept warm.
 *
 * The region tracker is the main customer, allocating one node per memory
 * region.
 */

use core::ptr;

use super::bitmap;
use super::phys::Pmem;
use super::physmap;
use super::{BASE_PAGE, BASE_PAGE_SIZE, PhysAddr};

/// Header at the front of every slab page.
#[repr(C)]
struct NodeRegion {
    /// All-pages list, newest first.
    next: *mut NodeRegion,
    prev: *mut NodeRegion,
    /// Pages-with-free-slots list.
    av_next: *mut NodeRegion,
    av_prev: *mut NodeRegion,
    /// Occupied slots in this page.
    used_nodes: usize,
    // bitmap bytes and the node array follow
}

/// Start of the slab page containing a node pointer. Slab pages are base
/// pages, so masking the low bits recovers the header.
fn region_of(p: *mut u8) -> *mut NodeRegion {
    ((p as usize) & !(BASE_PAGE_SIZE - 1)) as *mut NodeRegion
}

/// One slab pool handing out nodes of a single size.
pub struct NodePool {
    /// Newest page.
    head: *mut NodeRegion,
    /// Newest page with free slots.
    av_head: *mut NodeRegion,
    node_size: usize,
    /// Byte offset of the bitmap within a page.
    bitmap: usize,
    /// Byte offset of the first node slot within a page.
    first_node: usize,
    /// Node slots per page.
    max_nodes: usize,
}

// Only touched under the big kernel lock.
unsafe impl Send for NodePool {}

impl NodePool {
    /// Create a pool for nodes of `node_size` bytes.
    pub fn new(pmem: &mut Pmem, node_size: usize) -> Option<NodePool> {
        let bitmap_off = size_of::<NodeRegion>();

        // ideal values first, then lose the slots the header eats
        let max_nodes = BASE_PAGE_SIZE / node_size;
        let bitmap_size = max_nodes / 8 + 1;
        let first_node = (bitmap_off + bitmap_size).div_ceil(node_size) * node_size;

        let mut pool = NodePool {
            head: ptr::null_mut(),
            av_head: ptr::null_mut(),
            node_size,
            bitmap: bitmap_off,
            first_node,
            max_nodes: max_nodes - first_node / node_size,
        };

        let region = pool.create_region(pmem)?;
        pool.head = region;
        pool.av_head = region;
        Some(pool)
    }

    /// Give every page back to the physical allocator.
    pub fn destroy(&mut self, pmem: &mut Pmem) {
        let mut region = self.head;
        while !region.is_null() {
            let dead = region;
            region = unsafe { (*region).prev };
            pmem.free_page(BASE_PAGE, unsafe { Self::region_addr(dead) });
        }

        self.head = ptr::null_mut();
        self.av_head = ptr::null_mut();
    }

    unsafe fn region_addr(region: *mut NodeRegion) -> PhysAddr {
        physmap::virt_to_phys(super::VirtAddr::new(region as usize))
    }

    fn create_region(&mut self, pmem: &mut Pmem) -> Option<*mut NodeRegion> {
        let page = pmem.alloc_page(BASE_PAGE)?;
        unsafe {
            physmap::phys_zero(page, BASE_PAGE_SIZE);
            Some(physmap::phys_ptr::<NodeRegion>(page))
        }
    }

    unsafe fn bitmap_of<'a>(&self, region: *mut NodeRegion) -> &'a mut [u8] {
        unsafe {
            let base = (region as *mut u8).add(self.bitmap);
            core::slice::from_raw_parts_mut(base, self.max_nodes / 8 + 1)
        }
    }

    /// Grab the first free slot in a page.
    unsafe fn find_free_node(&self, region: *mut NodeRegion) -> Option<*mut u8> {
        unsafe {
            let bits = self.bitmap_of(region);
            let i = bitmap::find_first_unset(bits, self.max_nodes)?;
            bitmap::set(bits, i);
            Some((region as *mut u8).add(self.first_node + i * self.node_size))
        }
    }

    unsafe fn pop_av_head(&mut self) {
        unsafe {
            let t = self.av_head;
            self.av_head = (*t).av_next;
            if !self.av_head.is_null() {
                (*self.av_head).av_prev = ptr::null_mut();
            }

            (*t).av_next = ptr::null_mut();
            (*t).av_prev = ptr::null_mut();
        }
    }

    unsafe fn push_av_head(&mut self, region: *mut NodeRegion) {
        unsafe {
            (*region).av_prev = ptr::null_mut();
            (*region).av_next = self.av_head;
            if !self.av_head.is_null() {
                (*self.av_head).av_prev = region;
            }

            self.av_head = region;
        }
    }

    /// Allocate one node. The memory is not zeroed.
    pub fn get(&mut self, pmem: &mut Pmem) -> Option<*mut u8> {
        if self.av_head.is_null() {
            let region = self.create_region(pmem)?;
            unsafe {
                (*region).prev = self.head;
                (*self.head).next = region;
            }
            self.head = region;
            self.av_head = region;
        }

        unsafe {
            let p = self.find_free_node(self.av_head)?;
            (*self.av_head).used_nodes += 1;
            if (*self.av_head).used_nodes == self.max_nodes {
                self.pop_av_head();
            }

            Some(p)
        }
    }

    /// Unlink a page from both lists and hand it back, unless it is the
    /// last one.
    unsafe fn free_region(&mut self, pmem: &mut Pmem, region: *mut NodeRegion) {
        unsafe {
            let av_n = (*region).av_next;
            let av_p = (*region).av_prev;

            if !av_n.is_null() {
                (*av_n).av_prev = av_p;
            }

            if !av_p.is_null() {
                (*av_p).av_next = av_n;
            }

            if region == self.av_head {
                self.pop_av_head();
            }

            let n = (*region).next;
            let p = (*region).prev;

            if !n.is_null() {
                (*n).prev = p;
            }

            if !p.is_null() {
                (*p).next = n;
            }

            if region == self.head {
                if !(*self.head).prev.is_null() {
                    (*self.head).next = ptr::null_mut();
                    self.head = (*self.head).prev;
                } else {
                    // keep the final page around for the next allocation
                    self.push_av_head(region);
                    return;
                }
            }

            pmem.free_page(BASE_PAGE, Self::region_addr(region));
        }
    }

    /// Free a node previously returned by get().
    pub fn put(&mut self, pmem: &mut Pmem, p: *mut u8) {
        let region = region_of(p);
        unsafe {
            let bits = self.bitmap_of(region);
            let i = (p as usize - (region as usize + self.first_node)) / self.node_size;
            bitmap::clear(bits, i);

            (*region).used_nodes -= 1;
            if (*region).used_nodes == 0 {
                self.free_region(pmem, region);
            } else if (*region).av_next.is_null()
                && (*region).av_prev.is_null()
                && region != self.av_head
            {
                self.push_av_head(region);
            }
        }
    }
}
