/*
 * Architecture Layer
 *
 * Thin veneer over the machine: address-space switching, TLB maintenance,
 * inter-processor interrupts and SBI-backed power control. Everything here
 * is a no-op when the crate is built for the host, where the kernel state
 * machine runs under cargo test without real hardware behind it.
 */

#[cfg(target_arch = "riscv64")]
pub mod riscv64;

use crate::config::PagingMode;
use crate::memory::paging::Vmem;

/// Poweroff flavors of the poweroff syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoweroffKind {
    Shutdown,
    ColdReboot,
    WarmReboot,
}

/// Point the MMU at a page table.
pub fn use_vmem(vmem: Vmem, mode: PagingMode) {
    #[cfg(target_arch = "riscv64")]
    riscv64::use_vmem(vmem, mode);
    #[cfg(not(target_arch = "riscv64"))]
    let _ = (vmem, mode);
}

/// Flush the whole TLB of the current hart.
pub fn flush_tlb_full() {
    #[cfg(target_arch = "riscv64")]
    riscv64::flush_tlb_full();
}

/// Ask every other hart to flush, then flush locally.
pub fn flush_tlb_all() {
    #[cfg(target_arch = "riscv64")]
    riscv64::flush_tlb_all();
}

/// Kick a hart so it re-enters the kernel and drains pending work.
pub fn send_ipi(hart: usize) {
    #[cfg(target_arch = "riscv64")]
    riscv64::send_ipi(hart);
    #[cfg(not(target_arch = "riscv64"))]
    let _ = hart;
}

/// Enable external interrupts on the current hart.
pub fn enable_irqs() {
    #[cfg(target_arch = "riscv64")]
    riscv64::enable_irqs();
}

/// Disable external interrupts on the current hart.
pub fn disable_irqs() {
    #[cfg(target_arch = "riscv64")]
    riscv64::disable_irqs();
}

/// Idle until the next interrupt.
pub fn wait_for_interrupt() {
    #[cfg(target_arch = "riscv64")]
    riscv64::wait_for_interrupt();
}

/// Power the machine off or reboot it. Returns only on the host build.
pub fn poweroff(kind: PoweroffKind) {
    #[cfg(target_arch = "riscv64")]
    riscv64::poweroff(kind);
    #[cfg(not(target_arch = "riscv64"))]
    log::info!("poweroff requested: {:?}", kind);
}
