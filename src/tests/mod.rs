/*
 * Test Suite
 *
 * Scenario tests for the kernel state machine, driven on the host against
 * an in-memory arena standing in for physical RAM. Module-local unit tests
 * live next to their code; everything here exercises whole subsystems
 * through the public syscall surface.
 */

pub mod support;

mod fill;
mod notify_scenarios;
mod pmem_scenarios;
mod proc_scenarios;
