//! Register snapshot built by the entry stubs.

use core::fmt;

/// Number of processor exception vectors.
pub const EXCEPTION_COUNT: usize = 32;

/// Human-readable names of the processor exceptions, by vector.
pub const EXCEPTION_NAMES: [&str; EXCEPTION_COUNT] = [
    "Division By Zero",
    "Debug",
    "Non Maskable Interrupt",
    "Breakpoint",
    "Into Detected Overflow",
    "Out of Bounds",
    "Invalid Opcode",
    "No Coprocessor",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Bad TSS",
    "Segment Not Present",
    "Stack Fault",
    "General Protection Fault",
    "Page Fault",
    "Unknown Interrupt",
    "Coprocessor Fault",
    "Alignment Check",
    "Machine Check",
    "SIMD Floating-Point",
    "Virtualization",
    "Control Protection",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Hypervisor Injection",
    "VMM Communication",
    "Security Exception",
    "Reserved",
];

/// Name of `vector` if it is a processor exception.
pub fn exception_name(vector: u8) -> &'static str {
    EXCEPTION_NAMES
        .get(vector as usize)
        .copied()
        .unwrap_or("Unknown Interrupt")
}

/// Whether the CPU pushes an error code for `vector`.
pub const fn has_error_code(vector: u8) -> bool {
    matches!(vector, 8 | 10..=14 | 17 | 21 | 29 | 30)
}

/// Everything the stub saved, lowest address first.
///
/// The layout follows the push order in `stubs.S`: segment registers, the
/// `pushad` block, the vector and error code pushed by the stub, then the
/// frame the CPU pushed. The snapshot is only valid for the duration of the
/// handler call that receives it.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct InterruptFrame {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// ESP as it was before `pushad` ran.
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    /// Vector number, pushed by the stub.
    pub vector: u32,
    /// Hardware error code, or zero when the vector has none.
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
}

impl InterruptFrame {
    /// A zeroed frame for `vector`, as if raised from ring 0.
    pub const fn synthetic(vector: u8) -> Self {
        Self {
            gs: 0x10,
            fs: 0x10,
            es: 0x10,
            ds: 0x10,
            edi: 0,
            esi: 0,
            ebp: 0,
            esp: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            vector: vector as u32,
            error_code: 0,
            eip: 0,
            cs: 0x08,
            eflags: 0x202,
        }
    }

    pub const fn vector(&self) -> u8 {
        self.vector as u8
    }

    /// The hardware error code, for vectors that have one.
    pub const fn error_code(&self) -> Option<u32> {
        if has_error_code(self.vector()) {
            Some(self.error_code)
        } else {
            None
        }
    }

    /// Whether the interrupted code ran in ring 3.
    pub const fn from_user(&self) -> bool {
        self.cs & 0b11 == 3
    }
}

impl fmt::Debug for InterruptFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptFrame")
            .field("vector", &self.vector)
            .field("error_code", &format_args!("{:#x}", self.error_code))
            .field("eip", &format_args!("{:#010x}", self.eip))
            .field("cs", &format_args!("{:#06x}", self.cs))
            .field("eflags", &format_args!("{:#010x}", self.eflags))
            .field("eax", &format_args!("{:#010x}", self.eax))
            .field("ebx", &format_args!("{:#010x}", self.ebx))
            .field("ecx", &format_args!("{:#010x}", self.ecx))
            .field("edx", &format_args!("{:#010x}", self.edx))
            .field("esi", &format_args!("{:#010x}", self.esi))
            .field("edi", &format_args!("{:#010x}", self.edi))
            .field("ebp", &format_args!("{:#010x}", self.ebp))
            .field("esp", &format_args!("{:#010x}", self.esp))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn layout_follows_stub_push_order() {
        assert_eq!(offset_of!(InterruptFrame, ds), 12);
        assert_eq!(offset_of!(InterruptFrame, edi), 16);
        assert_eq!(offset_of!(InterruptFrame, eax), 44);
        assert_eq!(offset_of!(InterruptFrame, vector), 48);
        assert_eq!(offset_of!(InterruptFrame, error_code), 52);
        assert_eq!(offset_of!(InterruptFrame, eip), 56);
        assert_eq!(size_of::<InterruptFrame>(), 68);
    }

    #[test]
    fn error_code_only_for_vectors_that_push_one() {
        let mut frame = InterruptFrame::synthetic(14);
        frame.error_code = 0x2;
        assert_eq!(frame.error_code(), Some(0x2));

        let frame = InterruptFrame::synthetic(0);
        assert_eq!(frame.error_code(), None);

        let with_code: std::vec::Vec<u8> = (0..32).filter(|&v| has_error_code(v)).collect();
        assert_eq!(with_code, [8, 10, 11, 12, 13, 14, 17, 21, 29, 30]);
    }

    #[test]
    fn names_cover_all_exceptions() {
        assert_eq!(exception_name(0), "Division By Zero");
        assert_eq!(exception_name(13), "General Protection Fault");
        assert_eq!(exception_name(14), "Page Fault");
        assert_eq!(exception_name(31), "Reserved");
        assert_eq!(exception_name(32), "Unknown Interrupt");
    }

    #[test]
    fn privilege_comes_from_cs() {
        let mut frame = InterruptFrame::synthetic(3);
        assert!(!frame.from_user());
        frame.cs = 0x1B;
        assert!(frame.from_user());
    }
}
