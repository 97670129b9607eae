//! 32-bit Task State Segment.
//!
//! No hardware task switching is done; the TSS exists only so the CPU can
//! find the ring-0 stack (`ss0:esp0`) when an interrupt arrives while ring-3
//! code runs. The saved register image is zeroed and never read.

use core::mem::size_of;
use core::sync::atomic::{AtomicU32, Ordering};

/// Hardware TSS layout (104 bytes).
///
/// `esp0` and `ss0` are atomics so the single static instance can be
/// updated in place through a shared reference; `AtomicU32` has the same
/// in-memory representation as `u32`.
#[repr(C)]
#[allow(dead_code)] // read by the CPU, not by Rust
pub struct TaskState {
    prev_task_link: u32,
    /// Stack pointer loaded on a transition to ring 0.
    esp0: AtomicU32,
    /// Stack segment loaded on a transition to ring 0.
    ss0: AtomicU32,
    esp1: u32,
    ss1: u32,
    esp2: u32,
    ss2: u32,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u32,
    cs: u32,
    ss: u32,
    ds: u32,
    fs: u32,
    gs: u32,
    ldt_selector: u32,
    trap: u16,
    /// Offset of the I/O permission bitmap. Pointing past the end of the
    /// segment means there is none, so ring 3 gets no port access.
    iomap_base: u16,
}

impl TaskState {
    /// A TSS with every field zeroed and no I/O bitmap.
    pub const fn new() -> Self {
        Self {
            prev_task_link: 0,
            esp0: AtomicU32::new(0),
            ss0: AtomicU32::new(0),
            esp1: 0,
            ss1: 0,
            esp2: 0,
            ss2: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            cs: 0,
            ss: 0,
            ds: 0,
            fs: 0,
            gs: 0,
            ldt_selector: 0,
            trap: 0,
            iomap_base: size_of::<Self>() as u16,
        }
    }

    /// Segment limit for the TSS descriptor (inclusive).
    pub const LIMIT: u32 = (size_of::<Self>() - 1) as u32;

    /// Set the privileged stack used on ring 3 → ring 0 transitions.
    pub fn init(&self, kernel_data_selector: u16, kernel_stack_top: u32) {
        self.ss0.store(kernel_data_selector as u32, Ordering::Relaxed);
        self.esp0.store(kernel_stack_top, Ordering::Relaxed);
    }

    /// Replace only the ring-0 stack pointer.
    ///
    /// Must not race with a privilege transition that still uses the old
    /// stack; callers update it with interrupts disabled, before dropping to
    /// ring 3.
    pub fn set_kernel_stack(&self, stack_top: u32) {
        self.esp0.store(stack_top, Ordering::Release);
    }

    pub fn kernel_stack(&self) -> u32 {
        self.esp0.load(Ordering::Acquire)
    }

    pub fn kernel_stack_segment(&self) -> u16 {
        self.ss0.load(Ordering::Relaxed) as u16
    }

    /// Linear address of this TSS, for its GDT descriptor.
    pub fn address(&self) -> u32 {
        self as *const Self as usize as u32
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    #[test]
    fn layout_matches_hardware() {
        assert_eq!(size_of::<TaskState>(), 104);
        assert_eq!(offset_of!(TaskState, esp0), 4);
        assert_eq!(offset_of!(TaskState, ss0), 8);
        assert_eq!(offset_of!(TaskState, cr3), 28);
        assert_eq!(offset_of!(TaskState, ldt_selector), 96);
        assert_eq!(offset_of!(TaskState, iomap_base), 102);
        assert_eq!(TaskState::LIMIT, 103);
    }

    #[test]
    fn set_kernel_stack_touches_only_esp0() {
        let tss = TaskState::new();
        tss.init(0x10, 0x9_0000);
        tss.set_kernel_stack(0x8_F000);

        assert_eq!(tss.kernel_stack(), 0x8_F000);
        assert_eq!(tss.kernel_stack_segment(), 0x10);
        assert_eq!(tss.eax, 0);
        assert_eq!(tss.iomap_base, 104);
    }
}
