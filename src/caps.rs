/*
 * Thread Capabilities
 *
 * A fixed capability enumeration carried per thread control block. Bits are
 * set and cleared only by a thread holding CAPS, and consulted at the entry
 * of each privileged syscall.
 */

use bitflags::bitflags;

bitflags! {
    /// Capability set of a thread.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CapSet: usize {
        /// May set or clear capabilities on other threads.
        const CAPS = 1 << 0;
        /// May fork, spawn, kill, swap and detach.
        const PROC = 1 << 1;
        /// May notify threads other than itself.
        const NOTIFY = 1 << 2;
        /// May perform IPC calls.
        const CALL = 1 << 3;
        /// May power off or sleep the machine.
        const POWER = 1 << 4;
        /// May write runtime configuration parameters.
        const CONF = 1 << 5;
        /// May allocate or reference shared memory.
        const SHARED = 1 << 6;
    }
}

impl CapSet {
    /// Check for a single capability.
    pub fn has(self, cap: CapSet) -> bool {
        self.contains(cap)
    }
}
