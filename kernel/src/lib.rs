// =============================================================================
// PMOS — Protected-Mode Core
// =============================================================================
//
// Everything the boot binary needs, as a library:
//
//   arch    — GDT, TSS and IDT for 32-bit protected mode, plus the entry stubs
//   traps   — register snapshot, exception and hardware-interrupt dispatch
//   drivers — PIT timer, PS/2 keyboard, PS/2 mouse
//   sync    — interrupt-safe spin lock
//   config  — compile-time kernel configuration
//
// Only the `load` paths and the stubs touch the CPU directly. The rest is
// plain data plus `PortIo` calls, so it also builds and runs its tests on
// the host against `khal::mock::MockPorts`.
// =============================================================================

#![no_std]

#[cfg(test)]
extern crate std;

pub mod arch;
pub mod config;
pub mod drivers;
pub mod sync;
pub mod traps;

pub use config::KernelConfig;
