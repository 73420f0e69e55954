/*
 * Physical Allocator Scenarios
 *
 * Exhaustion and conservation over a fabricated RAM range, probe/populate
 * agreement, reservation idempotence and the order split/merge cascade.
 */

use super::support::{make_mm, reserve};
use crate::memory::phys::Pmem;
use crate::memory::{BASE_PAGE, BASE_PAGE_SIZE, PhysAddr};

#[test]
fn probe_and_populate_agree() {
    for size in [
        4 * 1024 * 1024,
        64 * 1024 * 1024 - 12 * 1024,
        7 * 1024 * 1024 + 8 * 1024,
    ] {
        let base = reserve(size);
        let probe = Pmem::probe_pmap(size);
        let (_, actual) = unsafe { Pmem::populate_pmap(base, size, base) };
        assert_eq!(probe, actual, "disagreement for ram size {size:#x}");
    }
}

#[test]
fn exhaustion_hands_out_every_page_once() {
    // drain a 64 MiB range page by page
    let mut mm = make_mm(64 * 1024 * 1024);
    let baseline = mm.pmem.query_used();
    let expected = (64 * 1024 * 1024 - baseline) / BASE_PAGE_SIZE;

    let mut pages: Vec<PhysAddr> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    while let Some(page) = mm.pmem.alloc_page(BASE_PAGE) {
        assert!(seen.insert(page.as_usize()), "page {page} handed out twice");
        pages.push(page);
    }

    assert_eq!(pages.len(), expected);

    for page in pages.into_iter().rev() {
        mm.pmem.free_page(BASE_PAGE, page);
    }

    assert_eq!(mm.pmem.query_used(), baseline);
}

#[test]
fn first_unset_bit_keeps_allocation_monotonic() {
    let mut mm = make_mm(8 * 1024 * 1024);
    let a = mm.pmem.alloc_page(BASE_PAGE).unwrap();
    let b = mm.pmem.alloc_page(BASE_PAGE).unwrap();
    let c = mm.pmem.alloc_page(BASE_PAGE).unwrap();
    assert!(a < b && b < c);

    // freeing the middle page makes its bit the first unset again
    mm.pmem.free_page(BASE_PAGE, b);
    assert_eq!(mm.pmem.alloc_page(BASE_PAGE), Some(b));
}

#[test]
fn split_pages_merge_back_into_large_ones() {
    let mut mm = make_mm(16 * 1024 * 1024);
    let baseline = mm.pmem.query_used();
    let order1 = crate::memory::order_size(1);

    // drain order 1, then the base-page scraps of partially used bitmaps
    let mut large = Vec::new();
    while let Some(p) = mm.pmem.alloc_page(1) {
        large.push(p);
    }
    assert!(!large.is_empty());

    let mut scraps = Vec::new();
    while let Some(p) = mm.pmem.alloc_page(BASE_PAGE) {
        scraps.push(p);
    }

    // everything is taken now, the split path fails cleanly
    assert_eq!(mm.pmem.alloc_page(BASE_PAGE), None);

    // give one large page back; exactly one bitmap worth of base pages
    // flows again, and returning all of them restores the large page
    let victim = large.pop().unwrap();
    mm.pmem.free_page(1, victim);

    let mut small = Vec::new();
    for _ in 0..(order1 / BASE_PAGE_SIZE) {
        small.push(mm.pmem.alloc_page(BASE_PAGE).expect("split failed"));
    }
    assert_eq!(mm.pmem.alloc_page(BASE_PAGE), None);

    for p in small {
        mm.pmem.free_page(BASE_PAGE, p);
    }
    assert_eq!(mm.pmem.alloc_page(1), Some(victim));
    mm.pmem.free_page(1, victim);

    for p in large {
        mm.pmem.free_page(1, p);
    }
    for p in scraps {
        mm.pmem.free_page(BASE_PAGE, p);
    }
    assert_eq!(mm.pmem.query_used(), baseline);
}

#[test]
fn mark_used_is_idempotent() {
    let mut mm = make_mm(8 * 1024 * 1024);
    let baseline = mm.pmem.query_used();

    let page = mm.pmem.alloc_page(BASE_PAGE).unwrap();
    mm.pmem.free_page(BASE_PAGE, page);
    assert_eq!(mm.pmem.query_used(), baseline);

    mm.pmem.mark_used(BASE_PAGE, page);
    let after_first = mm.pmem.query_used();
    assert_eq!(after_first, baseline + BASE_PAGE_SIZE);

    // overlapping boot reservations are a no-op the second time
    mm.pmem.mark_used(BASE_PAGE, page);
    assert_eq!(mm.pmem.query_used(), after_first);

    // and the page is never handed out while reserved
    let mut pages = Vec::new();
    while let Some(p) = mm.pmem.alloc_page(BASE_PAGE) {
        assert_ne!(p, page);
        pages.push(p);
    }
    for p in pages {
        mm.pmem.free_page(BASE_PAGE, p);
    }
}

#[test]
#[should_panic(expected = "double free")]
fn double_free_is_fatal() {
    let mut mm = make_mm(4 * 1024 * 1024);
    let page = mm.pmem.alloc_page(BASE_PAGE).unwrap();
    mm.pmem.free_page(BASE_PAGE, page);
    mm.pmem.free_page(BASE_PAGE, page);
}
