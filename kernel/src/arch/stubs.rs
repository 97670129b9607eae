//! Entry stubs for every interrupt vector (see `stubs.S`).

use super::idt::IDT_ENTRIES;

core::arch::global_asm!(include_str!("stubs.S"));

unsafe extern "C" {
    /// Address of `__isr_stub_<n>` at index `n`.
    static __isr_stub_table: [u32; IDT_ENTRIES];
}

/// Stub addresses indexed by vector, ready for `idt::init`.
pub fn stub_table() -> &'static [u32; IDT_ENTRIES] {
    // SAFETY: the table is immutable data emitted by the assembler.
    unsafe { &*(&raw const __isr_stub_table) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_vector_has_its_own_stub() {
        let table = stub_table();
        assert!(table.iter().all(|&stub| stub != 0));
        for (vector, stub) in table.iter().enumerate().skip(1) {
            assert_ne!(*stub, table[vector - 1], "vector {vector}");
        }
    }
}
