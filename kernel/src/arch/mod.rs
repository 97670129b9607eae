// =============================================================================
// PMOS — Architecture (i686 protected mode)
// =============================================================================
//
// Descriptor tables the CPU consults on every privilege change and every
// interrupt. `gdt` and `tss` set up the flat segment model and the ring-0
// stack, `idt` wires all 256 vectors to the entry stubs in `stubs`.
//
// Table construction is plain data and is tested on the host; only the
// `load` paths and the stubs themselves touch the CPU.
// =============================================================================

pub mod gdt;
pub mod idt;
pub mod tss;

#[cfg(target_arch = "x86")]
pub mod stubs;
