/*
 * RISC-V 64 Support
 *
 * satp programming, fences and the few SBI calls the kernel core needs.
 * SBI calls follow the v0.2 calling convention: extension id in a7,
 * function id in a6, arguments in a0.., error/value back in a0/a1.
 */

use core::arch::asm;

use riscv::register::satp;

use super::PoweroffKind;
use crate::config::PagingMode;
use crate::memory::paging::Vmem;
use crate::memory::{BASE_PAGE, orders};

/// sPI bit in sstatus/sie handling is left to the trap glue; these helpers
/// only gate the global interrupt-enable.
pub fn enable_irqs() {
    unsafe { riscv::register::sstatus::set_sie() };
}

pub fn disable_irqs() {
    unsafe { riscv::register::sstatus::clear_sie() };
}

pub fn wait_for_interrupt() {
    riscv::asm::wfi();
}

/// Install a page-table root into satp and fence.
pub fn use_vmem(vmem: Vmem, mode: PagingMode) {
    let ppn = vmem.root().as_usize() >> orders().shift(BASE_PAGE);
    let mode = match mode {
        // Sv32 is an rv32 mode; satp on rv64 has no encoding for it
        PagingMode::Sv32 => satp::Mode::Bare,
        PagingMode::Sv39 => satp::Mode::Sv39,
        PagingMode::Sv48 => satp::Mode::Sv48,
    };

    unsafe { satp::set(mode, 0, ppn) };
    flush_tlb_full();
}

pub fn flush_tlb_full() {
    riscv::asm::sfence_vma_all();
}

/// Fence locally and ask the SBI to run remote fences on every other hart.
pub fn flush_tlb_all() {
    riscv::asm::sfence_vma_all();
    // sbi_remote_sfence_vma(hart_mask = all, start = 0, size = -1)
    sbi_call(EXT_RFENCE, 1, usize::MAX, 0);
}

pub fn send_ipi(hart: usize) {
    sbi_call(EXT_IPI, 0, 1 << hart, 0);
}

pub fn poweroff(kind: PoweroffKind) {
    let reset_type = match kind {
        PoweroffKind::Shutdown => 0,
        PoweroffKind::ColdReboot => 1,
        PoweroffKind::WarmReboot => 2,
    };

    sbi_call(EXT_SRST, 0, reset_type, 0);
}

const EXT_IPI: usize = 0x73_5049;
const EXT_RFENCE: usize = 0x52_464e43;
const EXT_SRST: usize = 0x53_5253_54;

/// Minimal SBI v0.2 ecall wrapper. The error code is returned; callers in
/// the core treat SBI failure as advisory.
fn sbi_call(ext: usize, func: usize, arg0: usize, arg1: usize) -> isize {
    let error: isize;
    unsafe {
        asm!(
            "ecall",
            in("a7") ext,
            in("a6") func,
            inlateout("a0") arg0 => error,
            in("a1") arg1,
            options(nostack),
        );
    }
    error
}
