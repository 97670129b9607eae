//! i8042 PS/2 controller.
//!
//! Keyboard and mouse share one data port (0x60) and one status/command
//! port (0x64). Every wait here is a bounded spin: a device that never
//! answers turns into a [`Ps2Error`] instead of a hung boot.

use bitflags::bitflags;

use crate::port::PortIo;

// ── Ports ─────────────────────────────────────────────────────────

/// Data port: scancodes and mouse bytes in, device commands out.
pub const PS2_DATA: u16 = 0x60;
/// Status register (read).
pub const PS2_STATUS: u16 = 0x64;
/// Controller command register (write).
pub const PS2_COMMAND: u16 = 0x64;

// ── Controller commands ──────────────────────────────────────────

pub const CMD_READ_CONFIG: u8 = 0x20;
pub const CMD_WRITE_CONFIG: u8 = 0x60;
pub const CMD_ENABLE_AUX: u8 = 0xA8;
pub const CMD_ENABLE_FIRST_PORT: u8 = 0xAE;
/// Route the next data byte to the auxiliary (mouse) device.
pub const CMD_WRITE_AUX: u8 = 0xD4;
/// Pulse the CPU reset line.
pub const CMD_PULSE_RESET: u8 = 0xFE;

// ── Device responses ─────────────────────────────────────────────

pub const ACK: u8 = 0xFA;
pub const RESEND: u8 = 0xFE;
pub const SELF_TEST_PASSED: u8 = 0xAA;

/// Status polls before a wait gives up.
pub const SPIN_LIMIT: u32 = 100_000;

/// Bytes `flush` reads before giving up on a stuck output buffer.
const FLUSH_LIMIT: usize = 16;

bitflags! {
    /// Status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u8 {
        /// A byte is waiting in the output buffer.
        const OUTPUT_FULL = 0x01;
        /// The controller has not consumed the last byte written.
        const INPUT_FULL = 0x02;
        const SYSTEM = 0x04;
        /// Last write went to the command register.
        const COMMAND = 0x08;
        /// The waiting byte came from the auxiliary device.
        const AUX_DATA = 0x20;
        const TIMEOUT = 0x40;
        const PARITY = 0x80;
    }
}

bitflags! {
    /// Controller configuration byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Config: u8 {
        const FIRST_PORT_IRQ = 0x01;
        const SECOND_PORT_IRQ = 0x02;
        const SYSTEM = 0x04;
        const FIRST_PORT_CLOCK_OFF = 0x10;
        const SECOND_PORT_CLOCK_OFF = 0x20;
        const TRANSLATION = 0x40;
    }
}

/// PS/2 handshake failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ps2Error {
    /// The controller never drained its input buffer.
    InputFull,
    /// No byte arrived in the output buffer.
    OutputEmpty,
    /// The device answered something other than ACK.
    NoAck { command: u8, response: u8 },
}

/// The controller, reached through a [`PortIo`] backend.
pub struct Ps2Controller<P: PortIo> {
    ports: P,
}

impl<P: PortIo> Ps2Controller<P> {
    pub const fn new(ports: P) -> Self {
        Self { ports }
    }

    pub fn ports(&self) -> &P {
        &self.ports
    }

    pub fn status(&self) -> Status {
        Status::from_bits_retain(self.ports.read_u8(PS2_STATUS))
    }

    /// Wait until the controller can accept a byte.
    pub fn wait_write(&self) -> Result<(), Ps2Error> {
        for _ in 0..SPIN_LIMIT {
            if !self.status().contains(Status::INPUT_FULL) {
                return Ok(());
            }
        }
        Err(Ps2Error::InputFull)
    }

    /// Wait until a byte is available to read.
    pub fn wait_read(&self) -> Result<(), Ps2Error> {
        for _ in 0..SPIN_LIMIT {
            if self.status().contains(Status::OUTPUT_FULL) {
                return Ok(());
            }
        }
        Err(Ps2Error::OutputEmpty)
    }

    /// Send a command byte to the controller itself.
    pub fn write_command(&self, command: u8) -> Result<(), Ps2Error> {
        self.wait_write()?;
        self.ports.write_u8(PS2_COMMAND, command);
        Ok(())
    }

    /// Send a byte to the first-port device (keyboard).
    pub fn write_data(&self, byte: u8) -> Result<(), Ps2Error> {
        self.wait_write()?;
        self.ports.write_u8(PS2_DATA, byte);
        Ok(())
    }

    /// Send a byte to the auxiliary device (mouse).
    pub fn write_aux(&self, byte: u8) -> Result<(), Ps2Error> {
        self.write_command(CMD_WRITE_AUX)?;
        self.write_data(byte)
    }

    /// Wait for and read one byte.
    pub fn read_data(&self) -> Result<u8, Ps2Error> {
        self.wait_read()?;
        Ok(self.ports.read_u8(PS2_DATA))
    }

    /// Read the data port without waiting. Interrupt handlers use this: the
    /// interrupt itself means a byte is there.
    pub fn read_data_now(&self) -> u8 {
        self.ports.read_u8(PS2_DATA)
    }

    /// Send `command` to the keyboard and require an ACK.
    pub fn send_device(&self, command: u8) -> Result<(), Ps2Error> {
        self.write_data(command)?;
        self.expect_ack(command)
    }

    /// Send `command` to the mouse and require an ACK.
    pub fn send_aux(&self, command: u8) -> Result<(), Ps2Error> {
        self.write_aux(command)?;
        self.expect_ack(command)
    }

    fn expect_ack(&self, command: u8) -> Result<(), Ps2Error> {
        match self.read_data()? {
            ACK => Ok(()),
            response => Err(Ps2Error::NoAck { command, response }),
        }
    }

    pub fn read_config(&self) -> Result<Config, Ps2Error> {
        self.write_command(CMD_READ_CONFIG)?;
        self.read_data().map(Config::from_bits_retain)
    }

    pub fn write_config(&self, config: Config) -> Result<(), Ps2Error> {
        self.write_command(CMD_WRITE_CONFIG)?;
        self.write_data(config.bits())
    }

    /// Discard whatever is sitting in the output buffer. Returns the number
    /// of bytes dropped.
    pub fn flush(&self) -> usize {
        let mut dropped = 0;
        while dropped < FLUSH_LIMIT && self.status().contains(Status::OUTPUT_FULL) {
            self.ports.read_u8(PS2_DATA);
            dropped += 1;
        }
        dropped
    }

    /// Ask the controller to reset the CPU. Best effort: if the input buffer
    /// never drains the command is written anyway.
    pub fn pulse_reset(&self) {
        let _ = self.wait_write();
        self.ports.write_u8(PS2_COMMAND, CMD_PULSE_RESET);
    }
}
