//! Interrupt and trap handling.
//!
//! Every vector enters through its stub in `arch/stubs.S`, which builds an
//! [`InterruptFrame`] and calls `trap_entry`. From there [`Traps::handle`]
//! routes the vector:
//!
//! - 0-31: [`ExceptionDispatcher`], fatal unless a handler is registered
//! - the 16 PIC vectors (32-47 after remapping): [`IrqDispatcher`]
//! - everything else: logged and ignored

pub mod exceptions;
pub mod frame;
pub mod irq;

use kdisplay::Surface;
use khal::port::{PortIo, Ports};

use crate::config::KernelConfig;

pub use exceptions::{Disposition, ExceptionDispatcher, ExceptionError, ExceptionHandler};
pub use frame::{InterruptFrame, exception_name};
pub use irq::{IrqDispatcher, IrqError, IrqHandler};

/// Which dispatcher owns a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Exception(u8),
    Irq(u8),
    Unassigned(u8),
}

/// Both dispatchers.
pub struct Traps<P: PortIo> {
    pub exceptions: ExceptionDispatcher,
    pub irqs: IrqDispatcher<P>,
}

impl<P: PortIo> Traps<P> {
    pub const fn new(ports: P) -> Self {
        Self {
            exceptions: ExceptionDispatcher::new(),
            irqs: IrqDispatcher::new(ports),
        }
    }

    pub fn route(&self, vector: u8) -> Route {
        if (vector as usize) < frame::EXCEPTION_COUNT {
            Route::Exception(vector)
        } else if let Some(line) = self.irqs.line_for(vector) {
            Route::Irq(line)
        } else {
            Route::Unassigned(vector)
        }
    }

    /// Dispatch one trap. `Halt` means the caller must stop the CPU.
    pub fn handle(&self, frame: &InterruptFrame, display: &mut dyn Surface) -> Disposition {
        match self.route(frame.vector()) {
            Route::Exception(_) => self.exceptions.dispatch(frame, display),
            Route::Irq(_) => {
                self.irqs.dispatch(frame);
                Disposition::Resume
            }
            Route::Unassigned(vector) => {
                log::warn!("trap: unexpected vector {} at eip {:#010x}", vector, frame.eip);
                Disposition::Resume
            }
        }
    }
}

// =============================================================================
// Global instance
// =============================================================================

// SAFETY: the kernel runs in ring 0, and the PIC ports belong to the dispatcher.
static TRAPS: Traps<Ports> = Traps::new(unsafe { Ports::new() });

/// Load the IDT, remap the PICs with every line masked, and apply the
/// exception policy from `config`. Interrupts must still be disabled.
pub fn init(config: &KernelConfig) {
    #[cfg(target_arch = "x86")]
    // SAFETY: the stub table holds one valid entry stub per vector.
    unsafe {
        crate::arch::idt::init(crate::arch::stubs::stub_table());
    }

    TRAPS
        .irqs
        .init(config.pic_master_offset, config.pic_slave_offset);

    if config.resumable_faults {
        exceptions::install_resumable_faults(&TRAPS.exceptions);
    }
}

/// Install `handler` for hardware `line` and unmask it.
pub fn register_irq(line: u8, handler: &'static dyn IrqHandler) -> Result<(), IrqError> {
    TRAPS.irqs.register(line, handler)
}

/// Mask hardware `line` and remove its handler.
pub fn unregister_irq(line: u8) -> Result<(), IrqError> {
    TRAPS.irqs.unregister(line).map(|_| ())
}

/// Install `handler` for exception `vector`; it replaces the fatal default.
pub fn register_exception(
    vector: u8,
    handler: &'static dyn ExceptionHandler,
) -> Result<(), ExceptionError> {
    TRAPS.exceptions.register(vector, handler)
}

/// Interrupts delivered on hardware `line` since boot.
pub fn irq_count(line: u8) -> u32 {
    TRAPS.irqs.count(line)
}

/// Called by `__isr_common` with the saved registers.
#[cfg(target_arch = "x86")]
#[unsafe(no_mangle)]
extern "C" fn trap_entry(frame: &mut InterruptFrame) {
    // SAFETY: the VGA text buffer is identity-mapped and only written here
    // and by the panic path, both with interrupts disabled.
    let mut display = unsafe { kdisplay::TextModeSurface::new(kdisplay::VGA_TEXT_BASE) };
    if TRAPS.handle(frame, &mut display) == Disposition::Halt {
        khal::cpu::halt_forever();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use exceptions::tests::RecordingSurface;
    use khal::mock::MockPorts;
    use khal::pic::{PIC1_COMMAND, PIC2_COMMAND};
    use std::boxed::Box;

    #[derive(Default)]
    struct Hits(AtomicUsize);

    impl ExceptionHandler for Hits {
        fn handle(&self, _frame: &InterruptFrame, _display: &mut dyn Surface) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl IrqHandler for Hits {
        fn handle(&self, _line: u8, _frame: &InterruptFrame) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn traps() -> Traps<MockPorts> {
        let traps = Traps::new(MockPorts::new());
        traps.irqs.init(32, 40);
        traps
    }

    #[test]
    fn routing_partitions_the_vector_space() {
        let traps = traps();
        assert_eq!(traps.route(0), Route::Exception(0));
        assert_eq!(traps.route(31), Route::Exception(31));
        assert_eq!(traps.route(32), Route::Irq(0));
        assert_eq!(traps.route(40), Route::Irq(8));
        assert_eq!(traps.route(47), Route::Irq(15));
        assert_eq!(traps.route(48), Route::Unassigned(48));
        assert_eq!(traps.route(255), Route::Unassigned(255));
    }

    #[test]
    fn every_vector_reaches_its_handler_or_documented_default() {
        let traps = traps();
        let breakpoint: &'static Hits = Box::leak(Box::default());
        let keyboard: &'static Hits = Box::leak(Box::default());
        traps.exceptions.register(3, breakpoint).unwrap();
        traps.irqs.register(1, keyboard).unwrap();

        for vector in 0..=255u8 {
            traps.irqs.pics().ports().clear_writes();
            let mut display = RecordingSurface::default();
            let outcome = traps.handle(&InterruptFrame::synthetic(vector), &mut display);
            let eois = traps
                .irqs
                .pics()
                .ports()
                .writes()
                .into_iter()
                .filter(|&(port, _)| port == PIC1_COMMAND || port == PIC2_COMMAND)
                .count();

            match vector {
                3 => assert_eq!(outcome, Disposition::Resume),
                0..=31 => {
                    assert_eq!(outcome, Disposition::Halt, "vector {vector}");
                    assert!(display.contains(exception_name(vector)));
                }
                32..=39 => {
                    assert_eq!(outcome, Disposition::Resume);
                    assert_eq!(eois, 1, "vector {vector}");
                }
                40..=47 => {
                    assert_eq!(outcome, Disposition::Resume);
                    assert_eq!(eois, 2, "vector {vector}");
                }
                _ => {
                    assert_eq!(outcome, Disposition::Resume);
                    assert_eq!(eois, 0, "vector {vector}");
                }
            }
        }
        khal::cpu::enable_interrupts();

        assert_eq!(breakpoint.0.load(Ordering::SeqCst), 1);
        assert_eq!(keyboard.0.load(Ordering::SeqCst), 1);
    }
}
