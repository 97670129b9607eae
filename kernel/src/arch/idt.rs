//! Interrupt Descriptor Table for 32-bit protected mode.
//!
//! 256 eight-byte gates, one per vector. Every gate is installed at boot and
//! points at its own entry stub, so no vector can ever land on garbage:
//! 0-31 reach the exception dispatcher, 32-47 the hardware-interrupt
//! dispatcher, and the rest a logging default.

use core::mem::size_of;

use bitflags::bitflags;
use spin::Once;
use x86_64::PrivilegeLevel;
use x86_64::structures::gdt::SegmentSelector;

use khal::cpu::{self, DescriptorTablePointer};

use super::gdt::KERNEL_CODE_SELECTOR;

/// Number of entries in the IDT.
pub const IDT_ENTRIES: usize = 256;

bitflags! {
    /// Attribute byte of a gate (descriptor bits 40-47).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct GateAttributes: u8 {
        /// 32-bit interrupt gate: IF is cleared on entry.
        const INTERRUPT_32 = 0x0E;
        /// 32-bit trap gate: IF is left alone.
        const TRAP_32 = 0x0F;
        const DPL_LOW = 1 << 5;
        const DPL_HIGH = 1 << 6;
        const PRESENT = 1 << 7;
    }
}

impl GateAttributes {
    /// Present ring-0 interrupt gate, `0x8E`.
    pub const KERNEL_INTERRUPT: Self = Self::PRESENT.union(Self::INTERRUPT_32);

    /// Same attributes, reachable by `int` from `dpl` and above.
    pub const fn with_dpl(self, dpl: PrivilegeLevel) -> Self {
        let cleared = self.difference(Self::DPL_LOW.union(Self::DPL_HIGH));
        Self::from_bits_retain(cleared.bits() | ((dpl as u8) << 5))
    }

    pub const fn is_present(self) -> bool {
        self.contains(Self::PRESENT)
    }
}

/// One gate descriptor.
///
/// Format (64 bits):
/// - Bits 0-15:  handler offset bits 0-15
/// - Bits 16-31: code segment selector
/// - Bits 32-39: reserved, zero
/// - Bits 40-47: P, DPL, gate type
/// - Bits 48-63: handler offset bits 16-31
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Gate {
    offset_low: u16,
    selector: u16,
    reserved: u8,
    attributes: GateAttributes,
    offset_high: u16,
}

impl Gate {
    /// A gate with the present bit clear.
    pub const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            reserved: 0,
            attributes: GateAttributes::empty(),
            offset_high: 0,
        }
    }

    pub const fn new(handler: u32, selector: SegmentSelector, attributes: GateAttributes) -> Self {
        Self {
            offset_low: handler as u16,
            selector: selector.0,
            reserved: 0,
            attributes,
            offset_high: (handler >> 16) as u16,
        }
    }

    pub const fn handler(&self) -> u32 {
        (self.offset_low as u32) | ((self.offset_high as u32) << 16)
    }

    pub const fn selector(&self) -> u16 {
        self.selector
    }

    pub const fn attributes(&self) -> GateAttributes {
        self.attributes
    }

    /// The descriptor as one little-endian quadword.
    pub const fn raw(&self) -> u64 {
        (self.offset_low as u64)
            | ((self.selector as u64) << 16)
            | ((self.attributes.bits() as u64) << 40)
            | ((self.offset_high as u64) << 48)
    }
}

/// The Interrupt Descriptor Table.
#[repr(C, align(8))]
pub struct Idt {
    entries: [Gate; IDT_ENTRIES],
}

impl Idt {
    /// A table with every gate missing.
    pub const fn new() -> Self {
        Self {
            entries: [Gate::missing(); IDT_ENTRIES],
        }
    }

    /// A table whose gate `n` is a present ring-0 interrupt gate pointing
    /// at `stubs[n]` through the kernel code segment.
    pub fn with_stubs(stubs: &[u32; IDT_ENTRIES]) -> Self {
        let mut idt = Self::new();
        for (vector, &stub) in stubs.iter().enumerate() {
            idt.install_gate(
                vector as u8,
                stub,
                KERNEL_CODE_SELECTOR,
                GateAttributes::KERNEL_INTERRUPT,
            );
        }
        idt
    }

    /// Write one gate.
    pub fn install_gate(
        &mut self,
        vector: u8,
        handler: u32,
        selector: SegmentSelector,
        attributes: GateAttributes,
    ) {
        self.entries[vector as usize] = Gate::new(handler, selector, attributes);
    }

    #[inline]
    pub fn gate(&self, vector: u8) -> &Gate {
        &self.entries[vector as usize]
    }

    pub fn gates(&self) -> &[Gate; IDT_ENTRIES] {
        &self.entries
    }

    /// Activate this table with `lidt`.
    ///
    /// # Safety
    ///
    /// Every present gate must point at a valid entry stub.
    pub unsafe fn load(&'static self) {
        let pointer = DescriptorTablePointer {
            limit: (size_of::<Self>() - 1) as u16,
            base: self as *const Self as usize as u32,
        };
        unsafe { cpu::load_idt(&pointer) };
    }
}

impl Default for Idt {
    fn default() -> Self {
        Self::new()
    }
}

static IDT: Once<Idt> = Once::new();

/// Install a gate for every vector from `stubs` and load the table.
///
/// All 256 gates are written before `lidt` runs, so a fault taken the
/// moment protection is active still finds a valid gate.
///
/// # Safety
///
/// Each `stubs[n]` must be the address of an entry stub for vector `n`.
pub unsafe fn init(stubs: &[u32; IDT_ENTRIES]) {
    let idt = IDT.call_once(|| Idt::with_stubs(stubs));
    unsafe { idt.load() };
    log::info!("idt: {} gates loaded", IDT_ENTRIES);
}
