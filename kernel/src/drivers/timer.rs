//! PIT-driven system tick.
//!
//! Every tick bumps the tick counter, rolls the seconds counter once per
//! `frequency` ticks and runs the periodic callbacks that are due. Callbacks
//! live in a fixed arena; the handle returned on registration carries the
//! slot's generation, so a handle that outlived its callback is rejected
//! instead of removing whatever reused the slot.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use khal::cpu;
use khal::pit::{self, Pit};
use khal::port::{PortIo, Ports};

use crate::sync::SpinLock;
use crate::traps::{self, InterruptFrame, IrqError, IrqHandler};

/// Hardware line of PIT channel 0.
pub const TIMER_LINE: u8 = 0;

/// Capacity of the callback arena.
pub const MAX_CALLBACKS: usize = 16;

/// A periodic callback. Runs in interrupt context: it must not sleep or
/// wait for another interrupt.
pub type Callback = fn(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerError {
    /// The interval rounds to no time at all.
    ZeroInterval,
    /// Every callback slot is taken.
    TableFull,
    /// The handle was already unregistered, or never valid.
    StaleHandle,
    /// No frequency has been programmed yet.
    NotInitialized,
}

/// Names one registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackHandle {
    index: u16,
    generation: u16,
}

impl CallbackHandle {
    /// Never returned by a registration.
    pub const INVALID: Self = Self {
        index: u16::MAX,
        generation: 0,
    };

    pub const fn is_valid(self) -> bool {
        (self.index as usize) < MAX_CALLBACKS
    }
}

#[derive(Clone, Copy)]
struct Periodic {
    callback: Callback,
    arg: usize,
    interval: u32,
    next_due: u32,
}

#[derive(Clone, Copy)]
struct Slot {
    generation: u16,
    entry: Option<Periodic>,
}

impl Slot {
    const EMPTY: Self = Self {
        generation: 0,
        entry: None,
    };
}

/// Tick state plus the callback arena.
pub struct Timer {
    ticks: AtomicU32,
    seconds: AtomicU32,
    /// Ticks since the last whole second.
    partial: AtomicU32,
    /// Ticks per second; zero until programmed.
    frequency: AtomicU32,
    callbacks: SpinLock<[Slot; MAX_CALLBACKS]>,
}

impl Timer {
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU32::new(0),
            seconds: AtomicU32::new(0),
            partial: AtomicU32::new(0),
            frequency: AtomicU32::new(0),
            callbacks: SpinLock::new([Slot::EMPTY; MAX_CALLBACKS]),
        }
    }

    /// Program `pit` for roughly `hz` and count at the rate it actually
    /// produces. Returns that rate.
    pub fn start<P: PortIo>(&self, pit: &Pit<P>, hz: u32) -> u32 {
        let divisor = pit.set_frequency(hz);
        let effective = pit::frequency_for(divisor);
        log::debug!("timer: divisor {} -> {} Hz", divisor, effective);
        self.set_frequency(effective);
        effective
    }

    /// Set the tick rate used for second and millisecond conversions.
    pub fn set_frequency(&self, hz: u32) {
        self.frequency.store(hz, Ordering::Relaxed);
    }

    pub fn frequency(&self) -> u32 {
        self.frequency.load(Ordering::Relaxed)
    }

    pub fn ticks(&self) -> u32 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn elapsed_seconds(&self) -> u32 {
        self.seconds.load(Ordering::Relaxed)
    }

    /// One timer interrupt.
    pub fn tick(&self) {
        let now = self.ticks.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

        let hz = self.frequency();
        if hz != 0 {
            let partial = self.partial.load(Ordering::Relaxed) + 1;
            if partial >= hz {
                self.partial.store(0, Ordering::Relaxed);
                self.seconds.fetch_add(1, Ordering::Relaxed);
            } else {
                self.partial.store(partial, Ordering::Relaxed);
            }
        }

        // Collect under the lock, call after it: a callback may register or
        // unregister without deadlocking on the arena.
        let mut due: [Option<(CallbackHandle, Callback, usize)>; MAX_CALLBACKS] =
            [None; MAX_CALLBACKS];
        {
            let mut slots = self.callbacks.lock();
            for (index, (slot, due)) in slots.iter_mut().zip(due.iter_mut()).enumerate() {
                let generation = slot.generation;
                let Some(periodic) = slot.entry.as_mut() else {
                    continue;
                };
                if reached(now, periodic.next_due) {
                    let handle = CallbackHandle {
                        index: index as u16,
                        generation,
                    };
                    *due = Some((handle, periodic.callback, periodic.arg));
                    periodic.next_due = periodic.next_due.wrapping_add(periodic.interval);
                }
            }
        }

        for (handle, callback, arg) in due.into_iter().flatten() {
            // An earlier callback this tick may have unregistered this one.
            if self.is_live(handle) {
                callback(arg);
            }
        }
    }

    fn is_live(&self, handle: CallbackHandle) -> bool {
        let slots = self.callbacks.lock();
        slots
            .get(handle.index as usize)
            .is_some_and(|slot| slot.generation == handle.generation && slot.entry.is_some())
    }

    /// Run `callback(arg)` every `interval_ms`, first one interval from now.
    pub fn register_periodic(
        &self,
        callback: Callback,
        arg: usize,
        interval_ms: u32,
    ) -> Result<CallbackHandle, TimerError> {
        let hz = self.frequency();
        if hz == 0 {
            return Err(TimerError::NotInitialized);
        }
        if interval_ms == 0 {
            return Err(TimerError::ZeroInterval);
        }
        let interval = ms_to_ticks(interval_ms, hz).max(1);

        let mut slots = self.callbacks.lock();
        let (index, slot) = slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.entry.is_none())
            .ok_or(TimerError::TableFull)?;
        slot.entry = Some(Periodic {
            callback,
            arg,
            interval,
            next_due: self.ticks().wrapping_add(interval),
        });
        Ok(CallbackHandle {
            index: index as u16,
            generation: slot.generation,
        })
    }

    /// Remove the callback behind `handle`.
    pub fn unregister(&self, handle: CallbackHandle) -> Result<(), TimerError> {
        let mut slots = self.callbacks.lock();
        let slot = slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.entry.is_some());
        match slot {
            Some(slot) => {
                slot.entry = None;
                slot.generation = slot.generation.wrapping_add(1);
                Ok(())
            }
            None => {
                log::debug!("timer: stale handle {:?}", handle);
                Err(TimerError::StaleHandle)
            }
        }
    }

    /// Halt until `ms` worth of ticks have passed.
    ///
    /// Needs interrupts enabled, so never call it from an interrupt handler.
    /// Returns at once if the timer was never programmed.
    pub fn sleep(&self, ms: u32) {
        let hz = self.frequency();
        if hz == 0 {
            return;
        }
        let wait = ms_to_ticks(ms, hz);
        let start = self.ticks();
        while self.ticks().wrapping_sub(start) < wait {
            cpu::halt();
        }
    }

    pub fn time_string(&self) -> Uptime {
        Uptime::from_seconds(self.elapsed_seconds())
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether `now` is at or past `due`, across counter wrap-around.
fn reached(now: u32, due: u32) -> bool {
    (now.wrapping_sub(due) as i32) >= 0
}

fn ms_to_ticks(ms: u32, hz: u32) -> u32 {
    let ticks = ms as u64 * hz as u64 / 1000;
    ticks.min(u32::MAX as u64) as u32
}

/// Pause for about `us` microseconds without the timer.
///
/// Each `pause` takes roughly two microseconds on the machines this runs on,
/// so short waits are approximate and never shorter than requested on those.
pub fn sleep_us(us: u32) {
    for _ in 0..us / 2 {
        cpu::pause();
    }
}

/// Elapsed time rendered as `HH:MM:SS`. Hours wrap at 100.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Uptime([u8; 8]);

impl Uptime {
    pub fn from_seconds(seconds: u32) -> Self {
        let hours = (seconds / 3600) % 100;
        let minutes = (seconds % 3600) / 60;
        let secs = seconds % 60;
        let digit = |n: u32| b'0' + n as u8;
        Self([
            digit(hours / 10),
            digit(hours % 10),
            b':',
            digit(minutes / 10),
            digit(minutes % 10),
            b':',
            digit(secs / 10),
            digit(secs % 10),
        ])
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.0).unwrap_or("??:??:??")
    }
}

impl fmt::Display for Uptime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Global instance
// =============================================================================

static TIMER: Timer = Timer::new();

struct TimerIrq;

impl IrqHandler for TimerIrq {
    fn handle(&self, _line: u8, _frame: &InterruptFrame) {
        TIMER.tick();
    }
}

static TIMER_IRQ: TimerIrq = TimerIrq;

/// Program the PIT for `hz` and unmask line 0.
pub fn init(hz: u32) -> Result<(), IrqError> {
    // SAFETY: ring 0; the PIT ports are only touched here.
    let pit = Pit::new(unsafe { Ports::new() });
    let effective = TIMER.start(&pit, hz);
    traps::register_irq(TIMER_LINE, &TIMER_IRQ)?;
    log::info!("timer: running at {} Hz", effective);
    Ok(())
}

pub fn ticks() -> u32 {
    TIMER.ticks()
}

pub fn elapsed_seconds() -> u32 {
    TIMER.elapsed_seconds()
}

pub fn frequency() -> u32 {
    TIMER.frequency()
}

pub fn sleep(ms: u32) {
    TIMER.sleep(ms)
}

pub fn register_periodic(
    callback: Callback,
    arg: usize,
    interval_ms: u32,
) -> Result<CallbackHandle, TimerError> {
    TIMER.register_periodic(callback, arg, interval_ms)
}

pub fn unregister(handle: CallbackHandle) -> Result<(), TimerError> {
    TIMER.unregister(handle)
}

pub fn time_string() -> Uptime {
    TIMER.time_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;
    use khal::mock::MockPorts;
    use khal::pit::{PIT_CHANNEL0, PIT_COMMAND};
    use std::sync::Mutex;
    use std::vec::Vec;

    fn timer_at(hz: u32) -> Timer {
        let timer = Timer::new();
        timer.set_frequency(hz);
        timer
    }

    #[test]
    fn thousand_ticks_at_100_hz_is_ten_seconds() {
        let timer = timer_at(100);
        for _ in 0..1000 {
            timer.tick();
        }
        assert_eq!(timer.ticks(), 1000);
        assert_eq!(timer.elapsed_seconds(), 10);
        assert_eq!(timer.time_string().as_str(), "00:00:10");
    }

    #[test]
    fn periodic_callback_fires_on_its_interval_and_never_early() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        fn bump(_: usize) {
            FIRED.fetch_add(1, Ordering::SeqCst);
        }

        let timer = timer_at(100);
        timer.register_periodic(bump, 0, 500).unwrap();

        for tick in 1..=160u32 {
            let before = FIRED.load(Ordering::SeqCst);
            timer.tick();
            let fired = FIRED.load(Ordering::SeqCst) - before;
            assert_eq!(fired, usize::from(tick % 50 == 0), "tick {tick}");
        }
        assert_eq!(FIRED.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn simultaneous_callbacks_run_in_slot_order() {
        static ORDER: Mutex<Vec<usize>> = Mutex::new(Vec::new());
        fn record(arg: usize) {
            ORDER.lock().unwrap().push(arg);
        }

        let timer = timer_at(1000);
        timer.register_periodic(record, 1, 2).unwrap();
        timer.register_periodic(record, 2, 2).unwrap();
        timer.register_periodic(record, 3, 4).unwrap();
        for _ in 0..4 {
            timer.tick();
        }
        assert_eq!(*ORDER.lock().unwrap(), [1, 2, 1, 2, 3]);
    }

    #[test]
    fn unregistered_callback_stops_and_handle_goes_stale() {
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        fn bump(_: usize) {
            FIRED.fetch_add(1, Ordering::SeqCst);
        }

        let timer = timer_at(100);
        let handle = timer.register_periodic(bump, 0, 10).unwrap();
        timer.tick();
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);

        timer.unregister(handle).unwrap();
        timer.tick();
        assert_eq!(FIRED.load(Ordering::SeqCst), 1);
        assert_eq!(timer.unregister(handle), Err(TimerError::StaleHandle));

        // The slot is reused under a new generation.
        let reused = timer.register_periodic(bump, 0, 10).unwrap();
        assert_ne!(reused, handle);
        assert_eq!(timer.unregister(handle), Err(TimerError::StaleHandle));
        assert_eq!(timer.unregister(reused), Ok(()));
        assert_eq!(
            timer.unregister(CallbackHandle::INVALID),
            Err(TimerError::StaleHandle)
        );
    }

    #[test]
    fn callback_unregistered_earlier_in_the_same_tick_does_not_run() {
        static TIMER: Timer = Timer::new();
        static VICTIM: Mutex<Option<CallbackHandle>> = Mutex::new(None);
        static VICTIM_RUNS: AtomicUsize = AtomicUsize::new(0);
        fn killer(_: usize) {
            if let Some(handle) = VICTIM.lock().unwrap().take() {
                TIMER.unregister(handle).unwrap();
            }
        }
        fn victim(_: usize) {
            VICTIM_RUNS.fetch_add(1, Ordering::SeqCst);
        }

        TIMER.set_frequency(100);
        TIMER.register_periodic(killer, 0, 10).unwrap();
        let handle = TIMER.register_periodic(victim, 0, 10).unwrap();
        *VICTIM.lock().unwrap() = Some(handle);

        TIMER.tick();
        assert_eq!(VICTIM_RUNS.load(Ordering::SeqCst), 0);
        assert_eq!(TIMER.unregister(handle), Err(TimerError::StaleHandle));

        TIMER.tick();
        assert_eq!(VICTIM_RUNS.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn registration_errors() {
        fn noop(_: usize) {}

        assert_eq!(
            Timer::new().register_periodic(noop, 0, 10),
            Err(TimerError::NotInitialized)
        );

        let timer = timer_at(100);
        assert_eq!(timer.register_periodic(noop, 0, 0), Err(TimerError::ZeroInterval));
        for _ in 0..MAX_CALLBACKS {
            assert!(timer.register_periodic(noop, 0, 1).unwrap().is_valid());
        }
        assert_eq!(timer.register_periodic(noop, 0, 1), Err(TimerError::TableFull));
    }

    #[test]
    fn sleep_waits_for_ticks() {
        let timer = timer_at(100);
        let done = std::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                while !done.load(Ordering::SeqCst) {
                    timer.tick();
                    std::thread::yield_now();
                }
            });
            timer.sleep(100);
            assert!(timer.ticks() >= 10);
            done.store(true, Ordering::SeqCst);
        });
    }

    #[test]
    fn sleep_without_frequency_returns() {
        Timer::new().sleep(1000);
    }

    #[test]
    fn start_programs_the_pit() {
        let timer = Timer::new();
        let pit = Pit::new(MockPorts::new());
        assert_eq!(timer.start(&pit, 100), 100);
        assert_eq!(timer.frequency(), 100);
    }

    #[test]
    fn pit_sees_command_then_divisor() {
        let ports = MockPorts::new();
        let pit = Pit::new(&ports);
        Timer::new().start(&pit, 100);
        assert_eq!(
            ports.writes(),
            [(PIT_COMMAND, 0x36), (PIT_CHANNEL0, 0x9B), (PIT_CHANNEL0, 0x2E)]
        );
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(Uptime::from_seconds(0).as_str(), "00:00:00");
        assert_eq!(Uptime::from_seconds(3 * 3600 + 25 * 60 + 7).as_str(), "03:25:07");
        assert_eq!(std::format!("{}", Uptime::from_seconds(59)), "00:00:59");
    }

    #[test]
    fn due_check_survives_wraparound() {
        assert!(reached(5, 5));
        assert!(reached(6, 5));
        assert!(!reached(4, 5));
        assert!(reached(2, u32::MAX - 1));
        assert!(!reached(u32::MAX - 1, 2));
    }
}
