// =============================================================================
// CPU control: interrupt flag, halt, descriptor-table loads, CR2
// =============================================================================
//
// On the 32-bit target these are thin wrappers around single privileged
// instructions. Every other build (host tests, tooling) gets a hosted model
// with the same API: the interrupt flag lives in a thread-local, `halt`
// yields the thread, and CR2 reads as zero. Code above this module never
// needs its own `cfg` to stay testable.
// =============================================================================

use x86_64::registers::rflags::RFlags;

/// Operand of `lgdt`/`lidt` in 32-bit mode: 16-bit limit, 32-bit base.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct DescriptorTablePointer {
    /// Size of the table in bytes, minus one.
    pub limit: u16,
    /// Linear address of the first entry.
    pub base: u32,
}

/// Disable interrupts, run `f`, then restore the interrupt flag to what it
/// was before the call.
#[inline]
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let was_enabled = interrupts_enabled();
    disable_interrupts();
    let result = f();
    if was_enabled {
        enable_interrupts();
    }
    result
}

// =============================================================================
// Bare-metal i686
// =============================================================================

#[cfg(target_arch = "x86")]
mod imp {
    use super::{DescriptorTablePointer, RFlags};
    use core::arch::asm;

    #[inline]
    pub fn interrupts_enabled() -> bool {
        let eflags: u32;
        unsafe {
            asm!("pushfd", "pop {}", out(reg) eflags, options(nomem, preserves_flags));
        }
        RFlags::from_bits_truncate(eflags as u64).contains(RFlags::INTERRUPT_FLAG)
    }

    #[inline]
    pub fn disable_interrupts() {
        unsafe { asm!("cli", options(nomem, nostack)) }
    }

    #[inline]
    pub fn enable_interrupts() {
        unsafe { asm!("sti", options(nomem, nostack)) }
    }

    #[inline]
    pub fn halt() {
        unsafe { asm!("hlt", options(nomem, nostack)) }
    }

    pub fn halt_forever() -> ! {
        loop {
            unsafe { asm!("cli", "hlt", options(nomem, nostack)) }
        }
    }

    #[inline]
    pub fn read_cr2() -> u32 {
        let value: u32;
        unsafe {
            asm!("mov {}, cr2", out(reg) value, options(nomem, nostack, preserves_flags));
        }
        value
    }

    #[inline]
    pub fn pause() {
        core::hint::spin_loop();
    }

    pub unsafe fn load_gdt(pointer: &DescriptorTablePointer, code: u16, data: u16) {
        unsafe {
            asm!("lgdt [{}]", in(reg) pointer, options(readonly, nostack, preserves_flags));

            // Far return to reload CS with the new code selector.
            asm!(
                "push {sel}",
                "lea {tmp}, [2f]",
                "push {tmp}",
                "retf",
                "2:",
                sel = in(reg) code as u32,
                tmp = lateout(reg) _,
                options(preserves_flags)
            );

            asm!(
                "mov ds, {sel:x}",
                "mov es, {sel:x}",
                "mov fs, {sel:x}",
                "mov gs, {sel:x}",
                "mov ss, {sel:x}",
                sel = in(reg) data as u32,
                options(nostack, preserves_flags)
            );
        }
    }

    pub unsafe fn load_task_register(selector: u16) {
        unsafe { asm!("ltr {0:x}", in(reg) selector as u32, options(nostack, preserves_flags)) }
    }

    pub unsafe fn load_idt(pointer: &DescriptorTablePointer) {
        unsafe { asm!("lidt [{}]", in(reg) pointer, options(readonly, nostack, preserves_flags)) }
    }
}

// =============================================================================
// Hosted model
// =============================================================================

#[cfg(not(target_arch = "x86"))]
mod imp {
    extern crate std;

    use super::{DescriptorTablePointer, RFlags};
    use core::cell::Cell;

    std::thread_local! {
        static EFLAGS: Cell<RFlags> = const { Cell::new(RFlags::INTERRUPT_FLAG) };
    }

    pub fn interrupts_enabled() -> bool {
        EFLAGS.with(|f| f.get().contains(RFlags::INTERRUPT_FLAG))
    }

    pub fn disable_interrupts() {
        EFLAGS.with(|f| f.set(f.get() - RFlags::INTERRUPT_FLAG));
    }

    pub fn enable_interrupts() {
        EFLAGS.with(|f| f.set(f.get() | RFlags::INTERRUPT_FLAG));
    }

    pub fn halt() {
        std::thread::yield_now();
    }

    pub fn halt_forever() -> ! {
        disable_interrupts();
        loop {
            std::thread::park();
        }
    }

    pub fn read_cr2() -> u32 {
        0
    }

    pub fn pause() {
        core::hint::spin_loop();
    }

    pub unsafe fn load_gdt(_pointer: &DescriptorTablePointer, _code: u16, _data: u16) {}

    pub unsafe fn load_task_register(_selector: u16) {}

    pub unsafe fn load_idt(_pointer: &DescriptorTablePointer) {}
}

// =============================================================================
// Public API
// =============================================================================

/// Returns whether maskable interrupts are currently enabled (EFLAGS.IF).
#[inline]
pub fn interrupts_enabled() -> bool {
    imp::interrupts_enabled()
}

/// Clears the interrupt flag (`cli`).
#[inline]
pub fn disable_interrupts() {
    imp::disable_interrupts()
}

/// Sets the interrupt flag (`sti`).
#[inline]
pub fn enable_interrupts() {
    imp::enable_interrupts()
}

/// Halts until the next interrupt arrives.
///
/// With interrupts disabled this never wakes up; polling loops must only
/// call it with IF set.
#[inline]
pub fn halt() {
    imp::halt()
}

/// Disables interrupts and halts for good.
pub fn halt_forever() -> ! {
    imp::halt_forever()
}

/// Spin-loop hint for busy waits.
#[inline]
pub fn pause() {
    imp::pause()
}

/// Linear address of the most recent page fault.
#[inline]
pub fn read_cr2() -> u32 {
    imp::read_cr2()
}

/// Loads a new GDT, reloads CS through a far return and all data segment
/// registers with `data`.
///
/// # Safety
///
/// `pointer` must describe a table that stays valid forever, and `code`
/// and `data` must select a 32-bit code and a writable data descriptor in it.
pub unsafe fn load_gdt(pointer: &DescriptorTablePointer, code: u16, data: u16) {
    unsafe { imp::load_gdt(pointer, code, data) }
}

/// Activates the task-state segment named by `selector` (`ltr`).
///
/// # Safety
///
/// `selector` must name an available 32-bit TSS descriptor in the loaded GDT.
pub unsafe fn load_task_register(selector: u16) {
    unsafe { imp::load_task_register(selector) }
}

/// Loads the interrupt descriptor table (`lidt`).
///
/// # Safety
///
/// Every gate in the table must point at a valid entry stub, and the table
/// must stay valid forever.
pub unsafe fn load_idt(pointer: &DescriptorTablePointer) {
    unsafe { imp::load_idt(pointer) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn without_interrupts_restores_prior_state() {
        enable_interrupts();
        let inside = without_interrupts(interrupts_enabled);
        assert!(!inside);
        assert!(interrupts_enabled());

        disable_interrupts();
        without_interrupts(|| ());
        assert!(!interrupts_enabled());
        enable_interrupts();
    }
}
