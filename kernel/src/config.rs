//! Compile-time kernel configuration.
//!
//! There is no configuration file to read at boot. The values below are
//! fixed at build time, with cargo features selecting the few behaviors that
//! differ between development and normal builds:
//!
//! - `resumable-faults`: page faults and general-protection faults log one
//!   line and return instead of halting. A debugging aid only; resuming
//!   after either fault is unsound in general.
//! - `verbose`: log at `Debug` instead of `Info`.

use log::LevelFilter;

/// Boot-time parameters for the core and its drivers.
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    /// PIT interrupt rate.
    pub timer_hz: u32,
    /// Vector of hardware line 0.
    pub pic_master_offset: u8,
    /// Vector of hardware line 8.
    pub pic_slave_offset: u8,
    /// Visible screen area the pointer is clamped to.
    pub screen_width: u32,
    pub screen_height: u32,
    /// Side of the (square) pointer sprite.
    pub cursor_size: u32,
    /// Pointer position before the first packet.
    pub pointer_start: (u32, u32),
    /// Install the log-and-resume page/GP fault handlers.
    pub resumable_faults: bool,
    pub log_level: LevelFilter,
}

impl KernelConfig {
    pub const DEFAULT: KernelConfig = KernelConfig {
        timer_hz: 100,
        pic_master_offset: 32,
        pic_slave_offset: 40,
        screen_width: 1024,
        screen_height: 768,
        cursor_size: 16,
        pointer_start: (400, 300),
        resumable_faults: cfg!(feature = "resumable-faults"),
        log_level: if cfg!(feature = "verbose") {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        },
    };
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
