/*
 * IRQ Routing
 *
 * Maps hardware interrupt ids onto the threads that asked for them. The
 * actual interrupt controller lives with the trap glue; it reports fired
 * lines through Kernel::handle_irq, which turns them into NOTIFY_IRQ
 * events.
 */

use crate::status::Status;
use crate::thread::Tid;

/// Highest interrupt id the routing table accepts.
pub const MAX_IRQS: usize = 128;

/// IRQ id to handler thread table.
pub struct IrqTable {
    handlers: [Tid; MAX_IRQS],
}

impl IrqTable {
    pub const fn new() -> IrqTable {
        IrqTable {
            handlers: [0; MAX_IRQS],
        }
    }

    /// Claim an interrupt line for a thread. A line has one owner; a second
    /// claim displaces the first.
    pub fn register(&mut self, irq: usize, tid: Tid) -> Status {
        if irq >= MAX_IRQS {
            return Status::ErrInval;
        }

        self.handlers[irq] = tid;
        Status::Ok
    }

    /// The thread registered for a line, if any.
    pub fn handler(&self, irq: usize) -> Option<Tid> {
        if irq >= MAX_IRQS || self.handlers[irq] == 0 {
            return None;
        }

        Some(self.handlers[irq])
    }
}

impl Default for IrqTable {
    fn default() -> Self {
        IrqTable::new()
    }
}
