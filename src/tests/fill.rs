/*
 * Region Walker Scenarios
 *
 * The callback walker must emit maximal orders for aligned ranges, drop
 * order on request, and abort on errors without emitting further calls.
 */

use super::support::make_mm;
use crate::memory::paging::Vmem;
use crate::memory::region::{Mm, map_fill_region};
use crate::memory::{Order, VirtAddr, VmFlags, order_size};
use crate::status::Status;

#[test]
fn aligned_range_uses_only_the_top_order() {
    let mut mm = make_mm(8 * 1024 * 1024);
    let mut vmem = Vmem::create(&mut mm.pmem).unwrap();

    let top = order_size(2);
    let mut calls: Vec<(VirtAddr, Order)> = Vec::new();
    let mut handler = |_mm: &mut Mm, _vm: &mut Vmem, _off: &mut usize, va: VirtAddr, _fl: VmFlags, order: Order| {
        calls.push((va, order));
        Status::Ok
    };

    // a range aligned to the top order, two top pages long, produces
    // exactly two top-order invocations
    let start = VirtAddr::new(top);
    let res = map_fill_region(
        &mut mm,
        &mut vmem,
        &mut handler,
        0,
        start,
        2 * top,
        VmFlags::READ,
    );
    assert_eq!(res, Some(start));
    assert_eq!(calls, vec![(start, 2), (start.add(top), 2)]);
}

#[test]
fn trgn_drops_to_the_next_order() {
    let mut mm = make_mm(8 * 1024 * 1024);
    let mut vmem = Vmem::create(&mut mm.pmem).unwrap();

    let top = order_size(2);
    let mid = order_size(1);
    let mut calls: Vec<Order> = Vec::new();
    let mut handler = |_mm: &mut Mm, _vm: &mut Vmem, _off: &mut usize, _va: VirtAddr, _fl: VmFlags, order: Order| {
        calls.push(order);
        if order > 1 { Status::InfoTrgn } else { Status::Ok }
    };

    // a whole top-order page, but the handler refuses anything above
    // order 1 (the handler only counts, so nothing is actually mapped)
    let start = VirtAddr::new(top);
    let res = map_fill_region(
        &mut mm,
        &mut vmem,
        &mut handler,
        0,
        start,
        top,
        VmFlags::READ,
    );
    assert_eq!(res, Some(start));
    // one refused top attempt, then middle-order acceptances for the rest
    assert_eq!(calls[0], 2);
    assert_eq!(calls.len(), 1 + top / mid);
    assert!(calls[1..].iter().all(|&o| o == 1));
}

#[test]
fn unaligned_start_skips_large_orders() {
    let mut mm = make_mm(8 * 1024 * 1024);
    let mut vmem = Vmem::create(&mut mm.pmem).unwrap();

    let mut max_seen = 0;
    let mut count = 0;
    let mut handler = |_mm: &mut Mm, _vm: &mut Vmem, _off: &mut usize, _va: VirtAddr, _fl: VmFlags, order: Order| {
        max_seen = max_seen.max(order);
        count += 1;
        Status::Ok
    };

    // one base page off a middle-order boundary: only base pages fit
    let start = VirtAddr::new(order_size(1) + 4096);
    map_fill_region(
        &mut mm,
        &mut vmem,
        &mut handler,
        0,
        start,
        4 * 4096,
        VmFlags::READ,
    );
    assert_eq!(max_seen, 0);
    assert_eq!(count, 4);
}

#[test]
fn errors_abort_the_walk() {
    let mut mm = make_mm(8 * 1024 * 1024);
    let mut vmem = Vmem::create(&mut mm.pmem).unwrap();

    let mut calls = 0;
    let mut handler = |_mm: &mut Mm, _vm: &mut Vmem, _off: &mut usize, _va: VirtAddr, _fl: VmFlags, _o: Order| {
        calls += 1;
        if calls == 2 {
            Status::ErrOomem
        } else {
            Status::Ok
        }
    };

    let res = map_fill_region(
        &mut mm,
        &mut vmem,
        &mut handler,
        0,
        VirtAddr::new(0x8000),
        4 * 4096,
        VmFlags::READ,
    );
    assert_eq!(res, None);
    assert_eq!(calls, 2);
}
