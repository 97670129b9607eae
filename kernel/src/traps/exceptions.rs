//! Exception dispatcher for vectors 0-31.
//!
//! Each vector is either handled (a registered [`ExceptionHandler`] runs and
//! execution resumes) or falls through to the fatal default: interrupts off,
//! a register dump on the display, and the CPU halted for good.

use core::fmt;

use kdisplay::{CHAR_HEIGHT, Color, Surface};
use khal::cpu;

use super::frame::{EXCEPTION_COUNT, InterruptFrame, exception_name};
use crate::sync::SpinLock;

/// Something that can service a processor exception and let execution
/// continue.
pub trait ExceptionHandler: Sync {
    fn handle(&self, frame: &InterruptFrame, display: &mut dyn Surface);
}

impl<F> ExceptionHandler for F
where
    F: Fn(&InterruptFrame, &mut dyn Surface) + Sync,
{
    fn handle(&self, frame: &InterruptFrame, display: &mut dyn Surface) {
        self(frame, display)
    }
}

/// What the entry path must do once dispatch returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Return from the interrupt.
    Resume,
    /// The system is dead; halt forever.
    Halt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionError {
    /// Not a processor exception vector (0-31).
    InvalidVector(u8),
}

type Slot = Option<&'static dyn ExceptionHandler>;

/// Handler table for the 32 exception vectors.
pub struct ExceptionDispatcher {
    handlers: SpinLock<[Slot; EXCEPTION_COUNT]>,
}

impl ExceptionDispatcher {
    /// Every vector starts on the fatal default.
    pub const fn new() -> Self {
        Self {
            handlers: SpinLock::new([None; EXCEPTION_COUNT]),
        }
    }

    /// Install `handler` for `vector`, replacing any previous one.
    pub fn register(
        &self,
        vector: u8,
        handler: &'static dyn ExceptionHandler,
    ) -> Result<(), ExceptionError> {
        let mut handlers = self.handlers.lock();
        let slot = handlers
            .get_mut(vector as usize)
            .ok_or(ExceptionError::InvalidVector(vector))?;
        *slot = Some(handler);
        Ok(())
    }

    /// Put `vector` back on the fatal default. Returns the handler that was
    /// installed, if any.
    pub fn unregister(&self, vector: u8) -> Result<Slot, ExceptionError> {
        let mut handlers = self.handlers.lock();
        let slot = handlers
            .get_mut(vector as usize)
            .ok_or(ExceptionError::InvalidVector(vector))?;
        Ok(slot.take())
    }

    pub fn is_registered(&self, vector: u8) -> bool {
        matches!(self.handlers.lock().get(vector as usize), Some(Some(_)))
    }

    /// Run the handler for the frame's vector, or the fatal default.
    pub fn dispatch(&self, frame: &InterruptFrame, display: &mut dyn Surface) -> Disposition {
        // Copy the slot out so the table lock is not held across the call.
        let handler = self
            .handlers
            .lock()
            .get(frame.vector() as usize)
            .copied()
            .flatten();

        match handler {
            Some(handler) => {
                handler.handle(frame, display);
                Disposition::Resume
            }
            None => {
                cpu::disable_interrupts();
                report_fatal(frame, display);
                Disposition::Halt
            }
        }
    }
}

impl Default for ExceptionDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

// ── Fatal diagnostic ─────────────────────────────────────────────

const PANEL_X: u32 = 8;
const PANEL_Y: u32 = 8;
const TEXT_X: u32 = PANEL_X + 16;

/// Draw the register dump for an unhandled exception and mirror it to the
/// log.
pub fn report_fatal(frame: &InterruptFrame, display: &mut dyn Surface) {
    let vector = frame.vector();
    let name = exception_name(vector);

    log::error!("unhandled exception {} ({}): {:?}", vector, name, frame);

    let width = display.width().saturating_sub(2 * PANEL_X);
    display.fill_rect(PANEL_X, PANEL_Y, width, 10 * CHAR_HEIGHT, Color::NAVY);

    let mut out = Lines { display, y: PANEL_Y + CHAR_HEIGHT / 2 };
    out.line(format_args!("EXCEPTION OCCURRED:"), Color::RED);
    out.line(format_args!("Exception {}: {}", vector, name), Color::WHITE);
    match frame.error_code() {
        Some(code) => out.line(format_args!("Error code: {:#010X}", code), Color::WHITE),
        None => out.line(format_args!("Error code: none"), Color::WHITE),
    }
    out.line(
        format_args!(
            "EAX={:08X} EBX={:08X} ECX={:08X} EDX={:08X}",
            frame.eax, frame.ebx, frame.ecx, frame.edx
        ),
        Color::WHITE,
    );
    out.line(
        format_args!(
            "ESI={:08X} EDI={:08X} EBP={:08X} ESP={:08X}",
            frame.esi, frame.edi, frame.ebp, frame.esp
        ),
        Color::WHITE,
    );
    out.line(
        format_args!("EIP={:08X} CS={:04X} EFLAGS={:08X}", frame.eip, frame.cs, frame.eflags),
        Color::WHITE,
    );
    if vector == PAGE_FAULT {
        out.line(format_args!("CR2={:08X} (faulting address)", cpu::read_cr2()), Color::WHITE);
    }
    out.line(format_args!("System halted. Please restart."), Color::YELLOW);
}

/// Writes successive text lines down the panel.
struct Lines<'a> {
    display: &'a mut dyn Surface,
    y: u32,
}

impl Lines<'_> {
    fn line(&mut self, args: fmt::Arguments, color: Color) {
        self.display.draw_fmt(TEXT_X, self.y, args, color);
        self.y += CHAR_HEIGHT;
    }
}

// ── Resumable debug handlers ─────────────────────────────────────

/// Screen row used by the one-line debug reports.
const DEBUG_LINE_Y: u32 = 20 * CHAR_HEIGHT;

/// Page fault: report CR2 and return. Debug builds only; the faulting
/// instruction is retried, so this can loop.
pub struct PageFaultReporter;

impl ExceptionHandler for PageFaultReporter {
    fn handle(&self, frame: &InterruptFrame, display: &mut dyn Surface) {
        let address = cpu::read_cr2();
        log::warn!(
            "page fault at {:#010x}, error {:#x}, eip {:#010x}",
            address,
            frame.error_code,
            frame.eip
        );
        display.draw_fmt(
            PANEL_X,
            DEBUG_LINE_Y,
            format_args!("Page fault at address: {:#010X}", address),
            Color::RED,
        );
    }
}

/// General-protection fault: report the error code and return.
pub struct GeneralProtectionReporter;

impl ExceptionHandler for GeneralProtectionReporter {
    fn handle(&self, frame: &InterruptFrame, display: &mut dyn Surface) {
        log::warn!(
            "general protection fault, error {:#x}, eip {:#010x}",
            frame.error_code,
            frame.eip
        );
        display.draw_fmt(
            PANEL_X,
            DEBUG_LINE_Y + CHAR_HEIGHT,
            format_args!("General Protection Fault: {:#X}", frame.error_code),
            Color::RED,
        );
    }
}

pub const PAGE_FAULT: u8 = 14;
pub const GENERAL_PROTECTION: u8 = 13;

/// Make page faults and general-protection faults log and resume instead
/// of halting.
pub fn install_resumable_faults(dispatcher: &ExceptionDispatcher) {
    static PF: PageFaultReporter = PageFaultReporter;
    static GP: GeneralProtectionReporter = GeneralProtectionReporter;

    // Both vectors are in range, so neither call can fail.
    let _ = dispatcher.register(PAGE_FAULT, &PF);
    let _ = dispatcher.register(GENERAL_PROTECTION, &GP);
    log::warn!("exceptions: page and general-protection faults are resumable (debug mode)");
}
