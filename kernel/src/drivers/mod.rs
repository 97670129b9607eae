// =============================================================================
// PMOS — Built-in Drivers
// =============================================================================
//
// The three devices the core cannot run without:
//
//   timer.rs    — PIT channel 0 on line 0: ticks, seconds, periodic callbacks
//   keyboard.rs — PS/2 first port on line 1: scancodes into a line queue
//   mouse.rs    — PS/2 auxiliary port on line 12: packets into a pointer
//
// Each driver owns its state behind one interrupt-safe lock. Its interrupt
// handler and its foreground accessors are the only code that touches it.
// Keyboard and mouse share the i8042 controller below; the controller has no
// state of its own beyond the hardware.
// =============================================================================

pub mod keyboard;
pub mod mouse;
pub mod timer;

use khal::port::Ports;
use khal::ps2::Ps2Controller;

use crate::config::KernelConfig;
use crate::traps::IrqError;

// SAFETY: ring 0; the i8042 ports are only used through this controller.
static PS2: Ps2Controller<Ports> = Ps2Controller::new(unsafe { Ports::new() });

/// Bring up all three drivers and unmask their lines. Interrupts must still
/// be disabled; the PICs must already be remapped.
pub fn init(config: &KernelConfig) -> Result<(), IrqError> {
    timer::init(config.timer_hz)?;
    keyboard::init()?;
    mouse::init(config)?;
    Ok(())
}
