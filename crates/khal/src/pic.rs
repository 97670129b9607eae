//! Cascaded 8259 PIC (Programmable Interrupt Controller) driver.
//!
//! Two 8259s are chained: the slave's output feeds master line 2. Out of
//! reset both deliver on vectors 0x08-0x0F / 0x70-0x77, which collides with
//! CPU exceptions, so [`ChainedPics::remap`] moves them to a chosen range
//! (32-47 in this kernel) before interrupts are ever enabled.

use core::sync::atomic::{AtomicU8, Ordering};

use crate::port::PortIo;

/// I/O port addresses for the master PIC.
pub const PIC1_COMMAND: u16 = 0x20;
pub const PIC1_DATA: u16 = 0x21;

/// I/O port addresses for the slave PIC.
pub const PIC2_COMMAND: u16 = 0xA0;
pub const PIC2_DATA: u16 = 0xA1;

/// ICW1: begin initialization.
const ICW1_INIT: u8 = 0x10;
/// ICW1: ICW4 will be sent.
const ICW1_ICW4: u8 = 0x01;
/// ICW3 (master): a slave is attached on line 2.
const ICW3_MASTER_SLAVE_ON_2: u8 = 0x04;
/// ICW3 (slave): cascade identity 2.
const ICW3_SLAVE_ID: u8 = 0x02;
/// ICW4: 8086/88 mode.
const ICW4_8086: u8 = 0x01;

/// OCW2: non-specific end of interrupt.
pub const PIC_EOI: u8 = 0x20;

/// Master line the slave is cascaded on.
pub const CASCADE_LINE: u8 = 2;

/// Number of hardware lines across both controllers.
pub const LINE_COUNT: u8 = 16;

/// The master/slave 8259 pair.
pub struct ChainedPics<P: PortIo> {
    ports: P,
    master_offset: AtomicU8,
    slave_offset: AtomicU8,
}

impl<P: PortIo> ChainedPics<P> {
    /// Wrap the controller pair. Offsets start at the BIOS defaults until
    /// [`remap`](Self::remap) runs.
    pub const fn new(ports: P) -> Self {
        Self {
            ports,
            master_offset: AtomicU8::new(0x08),
            slave_offset: AtomicU8::new(0x70),
        }
    }

    /// Port backend, mostly for inspection in tests.
    pub fn ports(&self) -> &P {
        &self.ports
    }

    /// Vector of master line 0.
    pub fn master_offset(&self) -> u8 {
        self.master_offset.load(Ordering::Relaxed)
    }

    /// Vector of slave line 0 (hardware line 8).
    pub fn slave_offset(&self) -> u8 {
        self.slave_offset.load(Ordering::Relaxed)
    }

    /// Reinitialize both controllers so lines 0-7 raise `master_base..+8`
    /// and lines 8-15 raise `slave_base..+8`.
    ///
    /// The interrupt masks in effect before the call are restored afterwards.
    pub fn remap(&self, master_base: u8, slave_base: u8) {
        let p = &self.ports;
        let (mask1, mask2) = self.masks();

        // ICW1: begin initialization (cascade mode, ICW4 needed)
        p.write_u8(PIC1_COMMAND, ICW1_INIT | ICW1_ICW4);
        p.io_wait();
        p.write_u8(PIC2_COMMAND, ICW1_INIT | ICW1_ICW4);
        p.io_wait();

        // ICW2: vector offsets
        p.write_u8(PIC1_DATA, master_base);
        p.io_wait();
        p.write_u8(PIC2_DATA, slave_base);
        p.io_wait();

        // ICW3: cascade wiring
        p.write_u8(PIC1_DATA, ICW3_MASTER_SLAVE_ON_2);
        p.io_wait();
        p.write_u8(PIC2_DATA, ICW3_SLAVE_ID);
        p.io_wait();

        // ICW4: 8086 mode
        p.write_u8(PIC1_DATA, ICW4_8086);
        p.io_wait();
        p.write_u8(PIC2_DATA, ICW4_8086);
        p.io_wait();

        p.write_u8(PIC1_DATA, mask1);
        p.write_u8(PIC2_DATA, mask2);

        self.master_offset.store(master_base, Ordering::Relaxed);
        self.slave_offset.store(slave_base, Ordering::Relaxed);
    }

    /// Current (master, slave) mask registers. A set bit means masked.
    pub fn masks(&self) -> (u8, u8) {
        (self.ports.read_u8(PIC1_DATA), self.ports.read_u8(PIC2_DATA))
    }

    /// Mask every line on both controllers.
    pub fn mask_all(&self) {
        self.ports.write_u8(PIC1_DATA, 0xFF);
        self.ports.write_u8(PIC2_DATA, 0xFF);
    }

    /// Stop `line` (0-15) from raising interrupts.
    pub fn mask(&self, line: u8) {
        let (port, bit) = Self::mask_bit(line);
        let value = self.ports.read_u8(port);
        self.ports.write_u8(port, value | bit);
    }

    /// Allow `line` (0-15) to raise interrupts. Unmasking a slave line also
    /// unmasks the cascade line on the master, without which nothing from
    /// the slave gets through.
    pub fn unmask(&self, line: u8) {
        let (port, bit) = Self::mask_bit(line);
        let value = self.ports.read_u8(port);
        self.ports.write_u8(port, value & !bit);

        if port == PIC2_DATA {
            let master = self.ports.read_u8(PIC1_DATA);
            self.ports.write_u8(PIC1_DATA, master & !(1 << CASCADE_LINE));
        }
    }

    /// Acknowledge the interrupt that arrived on `vector`: slave first when
    /// the vector belongs to a slave line, then always the master.
    pub fn send_eoi(&self, vector: u8) {
        if self.is_slave_vector(vector) {
            self.ports.write_u8(PIC2_COMMAND, PIC_EOI);
        }
        self.ports.write_u8(PIC1_COMMAND, PIC_EOI);
    }

    /// Whether `vector` falls in the slave controller's range.
    pub fn is_slave_vector(&self, vector: u8) -> bool {
        let base = self.slave_offset();
        vector >= base && vector < base.wrapping_add(8)
    }

    /// Map a hardware line to its data port and mask bit.
    fn mask_bit(line: u8) -> (u16, u8) {
        let line = line % LINE_COUNT;
        if line < 8 {
            (PIC1_DATA, 1 << line)
        } else {
            (PIC2_DATA, 1 << (line - 8))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPorts;
    use crate::port::POST_PORT;

    fn pics() -> ChainedPics<MockPorts> {
        ChainedPics::new(MockPorts::new())
    }

    #[test]
    fn remap_sends_four_icws_to_each_controller_and_restores_masks() {
        let pics = pics();
        pics.ports().set_default(PIC1_DATA, 0xB8);
        pics.ports().set_default(PIC2_DATA, 0x8E);

        pics.remap(32, 40);

        let writes: std::vec::Vec<_> = pics
            .ports()
            .writes()
            .into_iter()
            .filter(|(port, _)| *port != POST_PORT)
            .collect();
        assert_eq!(
            writes,
            [
                (PIC1_COMMAND, 0x11),
                (PIC2_COMMAND, 0x11),
                (PIC1_DATA, 32),
                (PIC2_DATA, 40),
                (PIC1_DATA, 0x04),
                (PIC2_DATA, 0x02),
                (PIC1_DATA, 0x01),
                (PIC2_DATA, 0x01),
                (PIC1_DATA, 0xB8),
                (PIC2_DATA, 0x8E),
            ]
        );
        assert_eq!(pics.master_offset(), 32);
        assert_eq!(pics.slave_offset(), 40);
    }

    #[test]
    fn eoi_goes_to_slave_then_master_for_slave_vectors() {
        let pics = pics();
        pics.remap(32, 40);
        pics.ports().clear_writes();

        pics.send_eoi(44);
        assert_eq!(
            pics.ports().writes(),
            [(PIC2_COMMAND, PIC_EOI), (PIC1_COMMAND, PIC_EOI)]
        );

        pics.ports().clear_writes();
        pics.send_eoi(33);
        assert_eq!(pics.ports().writes(), [(PIC1_COMMAND, PIC_EOI)]);
    }

    #[test]
    fn mask_and_unmask_flip_one_bit() {
        let pics = pics();
        pics.ports().set_default(PIC1_DATA, 0xFF);
        pics.ports().set_default(PIC2_DATA, 0xFF);

        pics.unmask(1);
        assert_eq!(pics.ports().writes(), [(PIC1_DATA, 0xFD)]);

        pics.ports().clear_writes();
        pics.ports().set_default(PIC1_DATA, 0x00);
        pics.mask(3);
        assert_eq!(pics.ports().writes(), [(PIC1_DATA, 0x08)]);
    }

    #[test]
    fn unmasking_a_slave_line_opens_the_cascade() {
        let pics = pics();
        pics.ports().set_default(PIC1_DATA, 0xFF);
        pics.ports().set_default(PIC2_DATA, 0xFF);

        pics.unmask(12);
        assert_eq!(
            pics.ports().writes(),
            [(PIC2_DATA, 0xEF), (PIC1_DATA, 0xFB)]
        );
    }
}
