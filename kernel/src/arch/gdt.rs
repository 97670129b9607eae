//! Global Descriptor Table for 32-bit protected mode.
//!
//! Memory is flat: every code and data segment spans the full 4 GiB from
//! base 0, so segmentation only carries privilege levels. The table holds
//! six entries:
//!
//! | index | selector | descriptor                          |
//! |-------|----------|-------------------------------------|
//! | 0     | 0x00     | null (required)                     |
//! | 1     | 0x08     | kernel code, ring 0                 |
//! | 2     | 0x10     | kernel data, ring 0                 |
//! | 3     | 0x1B     | user code, ring 3                   |
//! | 4     | 0x23     | user data, ring 3                   |
//! | 5     | 0x28     | TSS, 32-bit available               |

use core::mem::size_of;

use bitflags::bitflags;
use spin::Once;
use x86_64::PrivilegeLevel;
use x86_64::structures::gdt::SegmentSelector;

use khal::cpu::{self, DescriptorTablePointer};

use super::tss::TaskState;

/// Number of GDT entries.
pub const GDT_ENTRIES: usize = 6;

pub const KERNEL_CODE_SELECTOR: SegmentSelector = SegmentSelector::new(1, PrivilegeLevel::Ring0);
pub const KERNEL_DATA_SELECTOR: SegmentSelector = SegmentSelector::new(2, PrivilegeLevel::Ring0);
pub const USER_CODE_SELECTOR: SegmentSelector = SegmentSelector::new(3, PrivilegeLevel::Ring3);
pub const USER_DATA_SELECTOR: SegmentSelector = SegmentSelector::new(4, PrivilegeLevel::Ring3);
pub const TSS_SELECTOR: SegmentSelector = SegmentSelector::new(5, PrivilegeLevel::Ring0);

bitflags! {
    /// Access byte (descriptor bits 40-47).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u8 {
        const ACCESSED = 1 << 0;
        /// Readable for code, writable for data.
        const READ_WRITE = 1 << 1;
        const CONFORMING = 1 << 2;
        const EXECUTABLE = 1 << 3;
        /// Code/data segment (clear for system descriptors such as the TSS).
        const CODE_DATA = 1 << 4;
        const DPL_RING3 = 3 << 5;
        const PRESENT = 1 << 7;
        /// System type 0x9: available 32-bit TSS.
        const TSS_AVAILABLE = 0x09;
    }
}

bitflags! {
    /// Flags nibble (descriptor bits 52-55).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u8 {
        /// 32-bit default operand size.
        const SIZE_32 = 1 << 2;
        /// Limit counts 4 KiB pages instead of bytes.
        const GRANULARITY_4K = 1 << 3;
    }
}

/// Largest 20-bit limit; with 4 KiB granularity it covers 4 GiB.
pub const FLAT_LIMIT: u32 = 0xF_FFFF;

/// One 8-byte segment descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct SegmentDescriptor(u64);

impl SegmentDescriptor {
    /// The null descriptor (entry 0).
    pub const NULL: Self = Self(0);

    /// Pack a descriptor. Only the low 20 bits of `limit` are kept.
    pub const fn new(base: u32, limit: u32, access: Access, flags: Flags) -> Self {
        let base = base as u64;
        let limit = limit as u64;
        let mut raw = 0u64;
        raw |= limit & 0xFFFF;
        raw |= (base & 0xFF_FFFF) << 16;
        raw |= (access.bits() as u64) << 40;
        raw |= ((limit >> 16) & 0xF) << 48;
        raw |= ((flags.bits() & 0xF) as u64) << 52;
        raw |= ((base >> 24) & 0xFF) << 56;
        Self(raw)
    }

    /// Flat 4 GiB code or data segment at `dpl`.
    pub const fn flat(code: bool, dpl: PrivilegeLevel) -> Self {
        let mut access = Access::PRESENT.union(Access::CODE_DATA).union(Access::READ_WRITE);
        if code {
            access = access.union(Access::EXECUTABLE);
        }
        if let PrivilegeLevel::Ring3 = dpl {
            access = access.union(Access::DPL_RING3);
        }
        Self::new(
            0,
            FLAT_LIMIT,
            access,
            Flags::SIZE_32.union(Flags::GRANULARITY_4K),
        )
    }

    /// Descriptor for a TSS at `base`, ring 0, byte granular.
    pub const fn tss(base: u32, limit: u32) -> Self {
        Self::new(
            base,
            limit,
            Access::PRESENT.union(Access::TSS_AVAILABLE),
            Flags::empty(),
        )
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn base(self) -> u32 {
        (((self.0 >> 16) & 0xFF_FFFF) | (((self.0 >> 56) & 0xFF) << 24)) as u32
    }

    pub const fn limit(self) -> u32 {
        ((self.0 & 0xFFFF) | (((self.0 >> 48) & 0xF) << 16)) as u32
    }

    pub const fn access(self) -> Access {
        Access::from_bits_retain((self.0 >> 40) as u8)
    }

    pub const fn flags(self) -> Flags {
        Flags::from_bits_retain(((self.0 >> 52) & 0xF) as u8)
    }

    /// Descriptor privilege level.
    pub fn dpl(self) -> PrivilegeLevel {
        PrivilegeLevel::from_u16(((self.0 >> 45) & 0b11) as u16)
    }
}

/// The segment table itself.
#[derive(Debug)]
#[repr(C, align(8))]
pub struct SegmentTable {
    entries: [SegmentDescriptor; GDT_ENTRIES],
}

impl SegmentTable {
    /// Build the six-entry table with the TSS descriptor pointing at
    /// `tss_base`.
    pub const fn build(tss_base: u32) -> Self {
        Self {
            entries: [
                SegmentDescriptor::NULL,
                SegmentDescriptor::flat(true, PrivilegeLevel::Ring0),
                SegmentDescriptor::flat(false, PrivilegeLevel::Ring0),
                SegmentDescriptor::flat(true, PrivilegeLevel::Ring3),
                SegmentDescriptor::flat(false, PrivilegeLevel::Ring3),
                SegmentDescriptor::tss(tss_base, TaskState::LIMIT),
            ],
        }
    }

    /// Entry named by `selector`, if it is inside the table.
    pub fn entry(&self, selector: SegmentSelector) -> Option<SegmentDescriptor> {
        self.entries.get(selector.index() as usize).copied()
    }

    /// Load this table, reload every segment register and activate the TSS.
    ///
    /// # Safety
    ///
    /// The TSS descriptor must point at a `TaskState` that lives forever.
    pub unsafe fn load(&'static self) {
        let pointer = DescriptorTablePointer {
            limit: (size_of::<Self>() - 1) as u16,
            base: self as *const Self as usize as u32,
        };
        unsafe {
            cpu::load_gdt(&pointer, KERNEL_CODE_SELECTOR.0, KERNEL_DATA_SELECTOR.0);
            cpu::load_task_register(TSS_SELECTOR.0);
        }
    }
}

// =============================================================================
// Global instances
// =============================================================================

static TSS: TaskState = TaskState::new();
static GDT: Once<SegmentTable> = Once::new();

/// Build the segment table and TSS and switch the CPU to them.
///
/// Runs once at boot, before the IDT is loaded and before interrupts are
/// enabled. Later calls are no-ops.
pub fn build_segments(kernel_stack_top: u32) {
    if GDT.is_completed() {
        return;
    }
    TSS.init(KERNEL_DATA_SELECTOR.0, kernel_stack_top);
    let gdt = GDT.call_once(|| SegmentTable::build(TSS.address()));
    // SAFETY: both tables are statics and the TSS descriptor points at TSS.
    unsafe { gdt.load() };
    log::info!(
        "gdt: {} entries loaded, tss at {:#010x}, esp0 {:#010x}",
        GDT_ENTRIES,
        TSS.address(),
        kernel_stack_top
    );
}

/// Change the stack the CPU switches to on entry from ring 3.
pub fn set_kernel_stack(stack_top: u32) {
    TSS.set_kernel_stack(stack_top);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors_are_index_times_eight_plus_rpl() {
        assert_eq!(KERNEL_CODE_SELECTOR.0, 0x08);
        assert_eq!(KERNEL_DATA_SELECTOR.0, 0x10);
        assert_eq!(USER_CODE_SELECTOR.0, 0x1B);
        assert_eq!(USER_DATA_SELECTOR.0, 0x23);
        assert_eq!(TSS_SELECTOR.0, 0x28);
    }

    #[test]
    fn flat_descriptors_match_canonical_encodings() {
        let table = SegmentTable::build(0);
        let raw = |sel| table.entry(sel).unwrap().raw();

        assert_eq!(table.entries[0].raw(), 0);
        assert_eq!(raw(KERNEL_CODE_SELECTOR), 0x00CF_9A00_0000_FFFF);
        assert_eq!(raw(KERNEL_DATA_SELECTOR), 0x00CF_9200_0000_FFFF);
        assert_eq!(raw(USER_CODE_SELECTOR), 0x00CF_FA00_0000_FFFF);
        assert_eq!(raw(USER_DATA_SELECTOR), 0x00CF_F200_0000_FFFF);
    }

    #[test]
    fn tss_descriptor_splits_base_and_limit() {
        let table = SegmentTable::build(0x1234_5678);
        let tss = table.entry(TSS_SELECTOR).unwrap();

        assert_eq!(tss.raw(), 0x1200_8934_5678_0067);
        assert_eq!(tss.base(), 0x1234_5678);
        assert_eq!(tss.limit(), 103);
        assert_eq!(tss.access(), Access::PRESENT | Access::TSS_AVAILABLE);
        assert_eq!(tss.flags(), Flags::empty());
        assert_eq!(tss.dpl(), PrivilegeLevel::Ring0);
    }

    #[test]
    fn user_segments_carry_ring3() {
        let table = SegmentTable::build(0);
        assert_eq!(table.entry(USER_CODE_SELECTOR).unwrap().dpl(), PrivilegeLevel::Ring3);
        assert_eq!(table.entry(KERNEL_DATA_SELECTOR).unwrap().dpl(), PrivilegeLevel::Ring0);
        assert_eq!(table.entry(USER_DATA_SELECTOR).unwrap().limit(), FLAT_LIMIT);
    }

    #[test]
    fn entry_outside_the_table_is_none() {
        let table = SegmentTable::build(0);
        assert!(table.entry(SegmentSelector::new(6, PrivilegeLevel::Ring0)).is_none());
    }
}
