//! 16550 UART on COM1, used as the log sink.

use core::fmt;
use spin::Mutex;

use crate::cpu;
use crate::port::{PortIo, Ports};

/// COM1 base port address.
pub const COM1: u16 = 0x3F8;

// Register offsets from the base port.
const DATA: u16 = 0;
const INT_ENABLE: u16 = 1;
const FIFO_CTRL: u16 = 2;
const LINE_CTRL: u16 = 3;
const MODEM_CTRL: u16 = 4;
const LINE_STATUS: u16 = 5;

/// Line status: transmit holding register empty.
const LSR_THR_EMPTY: u8 = 0x20;
/// Line control: divisor latch access.
const LCR_DLAB: u8 = 0x80;
/// Line control: 8 data bits, no parity, one stop bit.
const LCR_8N1: u8 = 0x03;

/// Spins on the transmit-empty bit before a byte is dropped.
const TX_SPIN_LIMIT: u32 = 100_000;

/// A 16550-compatible UART.
pub struct SerialPort<P: PortIo> {
    ports: P,
    base: u16,
    ready: bool,
}

impl<P: PortIo> SerialPort<P> {
    pub const fn new(ports: P, base: u16) -> Self {
        Self { ports, base, ready: false }
    }

    /// Program `baud` (dividing 115200), 8N1, FIFOs on, polled mode.
    ///
    /// Returns false when the loopback self-test fails; output is then
    /// discarded.
    pub fn init(&mut self, baud: u32) -> bool {
        let p = &self.ports;
        let divisor = (115_200 / baud.max(1)).clamp(1, 0xFFFF) as u16;

        p.write_u8(self.base + INT_ENABLE, 0x00);
        p.write_u8(self.base + LINE_CTRL, LCR_DLAB);
        p.write_u8(self.base + DATA, (divisor & 0xFF) as u8);
        p.write_u8(self.base + INT_ENABLE, (divisor >> 8) as u8);
        p.write_u8(self.base + LINE_CTRL, LCR_8N1);
        // Enable and clear FIFOs, 14-byte threshold.
        p.write_u8(self.base + FIFO_CTRL, 0xC7);

        // Loopback self-test.
        p.write_u8(self.base + MODEM_CTRL, 0x1E);
        p.write_u8(self.base + DATA, 0xAE);
        if p.read_u8(self.base + DATA) != 0xAE {
            self.ready = false;
            return false;
        }

        // Normal operation: DTR, RTS, OUT1, OUT2. Interrupts stay off.
        p.write_u8(self.base + MODEM_CTRL, 0x0F);
        self.ready = true;
        true
    }

    pub fn write_byte(&self, byte: u8) {
        if !self.ready {
            return;
        }
        for _ in 0..TX_SPIN_LIMIT {
            if self.ports.read_u8(self.base + LINE_STATUS) & LSR_THR_EMPTY != 0 {
                self.ports.write_u8(self.base + DATA, byte);
                return;
            }
            cpu::pause();
        }
    }
}

impl<P: PortIo> fmt::Write for SerialPort<P> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

/// Global COM1 instance.
static SERIAL: Mutex<SerialPort<Ports>> =
    Mutex::new(SerialPort::new(unsafe { Ports::new() }, COM1));

/// Initialize COM1 at 38400 baud.
pub fn init() -> bool {
    cpu::without_interrupts(|| SERIAL.lock().init(38_400))
}

/// Write a string to COM1.
pub fn write_str(s: &str) {
    use fmt::Write;
    cpu::without_interrupts(|| {
        let _ = SERIAL.lock().write_str(s);
    });
}

/// Write formatted arguments to COM1.
pub fn write_fmt(args: fmt::Arguments) {
    use fmt::Write;
    cpu::without_interrupts(|| {
        let _ = SERIAL.lock().write_fmt(args);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPorts;
    use core::fmt::Write;

    #[test]
    fn failed_loopback_discards_output() {
        let mut port = SerialPort::new(MockPorts::new(), COM1);
        port.ports.script(COM1, &[0x00]);
        assert!(!port.init(38_400));

        port.ports.clear_writes();
        port.write_str("lost").unwrap();
        assert!(port.ports.writes().is_empty());
    }

    #[test]
    fn newline_is_sent_as_crlf() {
        let mut port = SerialPort::new(MockPorts::new(), COM1);
        port.ports.script(COM1, &[0xAE]);
        port.ports.set_default(COM1 + LINE_STATUS, LSR_THR_EMPTY);
        assert!(port.init(38_400));
        assert_eq!(port.ports.writes()[2], (COM1, 3));

        port.ports.clear_writes();
        port.write_str("ok\n").unwrap();
        assert_eq!(port.ports.writes_to(COM1), b"ok\r\n");
    }
}
