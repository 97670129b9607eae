//! Hardware-interrupt dispatcher for the 16 PIC lines.
//!
//! Owns the PIC pair and a table of per-line handlers. Dispatch always ends
//! with an EOI, whether or not a handler ran: a line that never sees its EOI
//! never interrupts again.

use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use khal::pic::{ChainedPics, LINE_COUNT};
use khal::port::PortIo;

use super::frame::InterruptFrame;
use crate::sync::SpinLock;

/// Device code run for one hardware line, in interrupt context with
/// interrupts disabled. Must not block or wait for another interrupt.
pub trait IrqHandler: Sync {
    fn handle(&self, line: u8, frame: &InterruptFrame);
}

impl<F> IrqHandler for F
where
    F: Fn(u8, &InterruptFrame) + Sync,
{
    fn handle(&self, line: u8, frame: &InterruptFrame) {
        self(line, frame)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqError {
    /// Hardware lines are 0-15.
    InvalidLine(u8),
}

type Slot = Option<&'static dyn IrqHandler>;

const LINES: usize = LINE_COUNT as usize;

/// PIC pair plus the handler table.
pub struct IrqDispatcher<P: PortIo> {
    pics: ChainedPics<P>,
    handlers: SpinLock<[Slot; LINES]>,
    counts: [AtomicU32; LINES],
    /// Lines already reported as unhandled, one bit each.
    reported: AtomicU16,
}

impl<P: PortIo> IrqDispatcher<P> {
    pub const fn new(ports: P) -> Self {
        Self {
            pics: ChainedPics::new(ports),
            handlers: SpinLock::new([None; LINES]),
            counts: [const { AtomicU32::new(0) }; LINES],
            reported: AtomicU16::new(0),
        }
    }

    pub fn pics(&self) -> &ChainedPics<P> {
        &self.pics
    }

    /// Remap the PICs to `master_base`/`slave_base` and mask every line.
    /// Runs once, before any handler is registered and before `sti`.
    pub fn init(&self, master_base: u8, slave_base: u8) {
        self.pics.remap(master_base, slave_base);
        self.pics.mask_all();
        log::info!(
            "pic: lines 0-7 -> vectors {}-{}, lines 8-15 -> {}-{}",
            master_base,
            master_base + 7,
            slave_base,
            slave_base + 7
        );
    }

    /// Install `handler` for `line` and unmask the line.
    pub fn register(&self, line: u8, handler: &'static dyn IrqHandler) -> Result<(), IrqError> {
        let index = Self::index(line)?;
        self.handlers.lock()[index] = Some(handler);
        self.reported.fetch_and(!(1 << line), Ordering::Relaxed);
        self.pics.unmask(line);
        Ok(())
    }

    /// Mask `line` and remove its handler. Returns the handler that was
    /// installed, if any.
    pub fn unregister(&self, line: u8) -> Result<Slot, IrqError> {
        let index = Self::index(line)?;
        self.pics.mask(line);
        Ok(self.handlers.lock()[index].take())
    }

    pub fn is_registered(&self, line: u8) -> bool {
        Self::index(line).is_ok_and(|i| self.handlers.lock()[i].is_some())
    }

    /// Interrupts delivered on `line` since boot.
    pub fn count(&self, line: u8) -> u32 {
        Self::index(line).map_or(0, |i| self.counts[i].load(Ordering::Relaxed))
    }

    /// Hardware line raised on `vector`, if `vector` belongs to the PICs.
    pub fn line_for(&self, vector: u8) -> Option<u8> {
        let master = self.pics.master_offset();
        let slave = self.pics.slave_offset();
        if (master..master.saturating_add(8)).contains(&vector) {
            Some(vector - master)
        } else if (slave..slave.saturating_add(8)).contains(&vector) {
            Some(vector - slave + 8)
        } else {
            None
        }
    }

    /// Run the handler for the frame's line, then acknowledge the PIC.
    ///
    /// An unregistered line is logged once and otherwise ignored.
    pub fn dispatch(&self, frame: &InterruptFrame) {
        let vector = frame.vector();
        let Some(line) = self.line_for(vector) else {
            log::warn!("irq: vector {} is not a PIC line", vector);
            return;
        };

        // Acknowledged on every path out of this function.
        let _eoi = Eoi { pics: &self.pics, vector };

        self.counts[line as usize].fetch_add(1, Ordering::Relaxed);
        let handler = self.handlers.lock()[line as usize];
        match handler {
            Some(handler) => handler.handle(line, frame),
            None => {
                let bit = 1 << line;
                if self.reported.fetch_or(bit, Ordering::Relaxed) & bit == 0 {
                    log::warn!("irq: no handler for line {} (vector {})", line, vector);
                }
            }
        }
    }

    fn index(line: u8) -> Result<usize, IrqError> {
        if line < LINE_COUNT {
            Ok(line as usize)
        } else {
            Err(IrqError::InvalidLine(line))
        }
    }
}

/// Sends the EOI for `vector` when dropped.
struct Eoi<'a, P: PortIo> {
    pics: &'a ChainedPics<P>,
    vector: u8,
}

impl<P: PortIo> Drop for Eoi<'_, P> {
    fn drop(&mut self) {
        self.pics.send_eoi(self.vector);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;
    use khal::mock::MockPorts;
    use khal::pic::{PIC1_COMMAND, PIC1_DATA, PIC2_COMMAND, PIC2_DATA, PIC_EOI};
    use std::boxed::Box;

    #[derive(Default)]
    struct Counter {
        calls: AtomicUsize,
        last_line: AtomicUsize,
    }

    impl IrqHandler for Counter {
        fn handle(&self, line: u8, _frame: &InterruptFrame) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_line.store(line as usize, Ordering::SeqCst);
        }
    }

    fn dispatcher() -> IrqDispatcher<MockPorts> {
        let irqs = IrqDispatcher::new(MockPorts::new());
        irqs.pics().ports().set_default(PIC1_DATA, 0xFF);
        irqs.pics().ports().set_default(PIC2_DATA, 0xFF);
        irqs.init(32, 40);
        irqs.pics().ports().clear_writes();
        irqs
    }

    fn leak_counter() -> &'static Counter {
        Box::leak(Box::default())
    }

    #[test]
    fn master_line_runs_handler_once_and_sends_one_eoi() {
        let irqs = dispatcher();
        let counter = leak_counter();
        irqs.register(1, counter).unwrap();
        assert_eq!(irqs.pics().ports().writes(), [(PIC1_DATA, 0xFD)]);
        irqs.pics().ports().clear_writes();

        irqs.dispatch(&InterruptFrame::synthetic(33));

        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(counter.last_line.load(Ordering::SeqCst), 1);
        assert_eq!(irqs.pics().ports().writes(), [(PIC1_COMMAND, PIC_EOI)]);
        assert_eq!(irqs.count(1), 1);
    }

    #[test]
    fn slave_line_acknowledges_slave_then_master() {
        let irqs = dispatcher();
        let counter = leak_counter();
        irqs.register(12, counter).unwrap();
        irqs.pics().ports().clear_writes();

        irqs.dispatch(&InterruptFrame::synthetic(44));

        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(counter.last_line.load(Ordering::SeqCst), 12);
        assert_eq!(
            irqs.pics().ports().writes(),
            [(PIC2_COMMAND, PIC_EOI), (PIC1_COMMAND, PIC_EOI)]
        );
    }

    #[test]
    fn unregistered_line_is_still_acknowledged() {
        let irqs = dispatcher();
        irqs.dispatch(&InterruptFrame::synthetic(39));
        irqs.dispatch(&InterruptFrame::synthetic(39));
        assert_eq!(
            irqs.pics().ports().writes(),
            [(PIC1_COMMAND, PIC_EOI), (PIC1_COMMAND, PIC_EOI)]
        );
        assert_eq!(irqs.count(7), 2);
    }

    #[test]
    fn closures_can_be_handlers() {
        static HITS: AtomicUsize = AtomicUsize::new(0);
        static HANDLER: fn(u8, &InterruptFrame) = |_, _| {
            HITS.fetch_add(1, Ordering::SeqCst);
        };

        let irqs = dispatcher();
        irqs.register(3, &HANDLER).unwrap();
        irqs.dispatch(&InterruptFrame::synthetic(35));
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregister_masks_and_clears() {
        let irqs = dispatcher();
        let counter = leak_counter();
        irqs.register(0, counter).unwrap();
        irqs.pics().ports().clear_writes();

        assert!(irqs.unregister(0).unwrap().is_some());
        assert!(!irqs.is_registered(0));
        assert_eq!(irqs.pics().ports().writes(), [(PIC1_DATA, 0xFF)]);

        irqs.dispatch(&InterruptFrame::synthetic(32));
        assert_eq!(counter.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn line_numbers_are_validated() {
        let irqs = dispatcher();
        assert_eq!(irqs.register(16, leak_counter()), Err(IrqError::InvalidLine(16)));
        assert_eq!(irqs.line_for(31), None);
        assert_eq!(irqs.line_for(47), Some(15));
        assert_eq!(irqs.line_for(48), None);
    }

    #[test]
    fn non_pic_vectors_get_no_eoi() {
        let irqs = dispatcher();
        irqs.dispatch(&InterruptFrame::synthetic(0x80));
        assert!(irqs.pics().ports().writes().is_empty());
    }
}
