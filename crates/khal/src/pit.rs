//! 8253/8254 PIT (Programmable Interval Timer), channel 0.
//!
//! Channel 0 is wired to hardware line 0. It counts down from a 16-bit
//! divisor at [`PIT_BASE_HZ`] and, in mode 3, produces one interrupt per
//! full count.

use crate::port::PortIo;

/// Input clock of the PIT.
pub const PIT_BASE_HZ: u32 = 1_193_182;

/// Channel 0 data port.
pub const PIT_CHANNEL0: u16 = 0x40;
/// Mode/command register.
pub const PIT_COMMAND: u16 = 0x43;

/// Channel 0, access lo/hi byte, mode 3 (square wave), binary counting.
pub const PIT_CMD_CH0_SQUARE_WAVE: u8 = 0x36;

/// Slowest reachable rate, with the divisor at its 65536 maximum.
pub const PIT_MIN_HZ: u32 = PIT_BASE_HZ.div_ceil(65_536);

/// Divisor register value for `hz`, clamped to the counter's range.
///
/// A register value of 0 means 65536, the slowest rate.
pub fn divisor_for(hz: u32) -> u16 {
    if hz == 0 {
        return 0;
    }
    let divisor = (PIT_BASE_HZ / hz).clamp(1, 65_536);
    if divisor == 65_536 { 0 } else { divisor as u16 }
}

/// Frequency actually produced by a divisor register value.
pub fn frequency_for(divisor: u16) -> u32 {
    let divisor = if divisor == 0 { 65_536 } else { divisor as u32 };
    PIT_BASE_HZ / divisor
}

/// Channel 0 of the PIT.
pub struct Pit<P: PortIo> {
    ports: P,
}

impl<P: PortIo> Pit<P> {
    pub const fn new(ports: P) -> Self {
        Self { ports }
    }

    /// Program channel 0 as a square-wave generator at roughly `hz`.
    ///
    /// Returns the divisor written to the counter.
    pub fn set_frequency(&self, hz: u32) -> u16 {
        let divisor = divisor_for(hz);
        self.ports.write_u8(PIT_COMMAND, PIT_CMD_CH0_SQUARE_WAVE);
        self.ports.write_u8(PIT_CHANNEL0, (divisor & 0xFF) as u8);
        self.ports.write_u8(PIT_CHANNEL0, (divisor >> 8) as u8);
        divisor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPorts;

    #[test]
    fn divisor_for_100_hz() {
        assert_eq!(divisor_for(100), 11_931);
        assert_eq!(frequency_for(11_931), 100);
    }

    #[test]
    fn divisor_clamps_to_counter_range() {
        assert_eq!(divisor_for(5_000_000), 1);
        assert_eq!(divisor_for(1), 0);
        assert_eq!(divisor_for(0), 0);
        assert_eq!(frequency_for(0), 18);
        assert_eq!(PIT_MIN_HZ, 19);
    }

    #[test]
    fn programs_command_then_low_and_high_byte() {
        let pit = Pit::new(MockPorts::new());
        let divisor = pit.set_frequency(1000);

        assert_eq!(divisor, 1193);
        assert_eq!(
            pit.ports.writes(),
            [
                (PIT_COMMAND, 0x36),
                (PIT_CHANNEL0, (1193 & 0xFF) as u8),
                (PIT_CHANNEL0, (1193 >> 8) as u8),
            ]
        );
    }
}
