// =============================================================================
// PMOS — Interrupt-safe Ticket Spinlock
// =============================================================================
//
// Two counters: `next_ticket` and `now_serving`. Locking takes a ticket and
// spins until it is served; unlocking serves the next ticket.
//
// IRQ SAFETY:
//   Interrupts are disabled BEFORE the ticket is taken and restored to their
//   previous state when the guard drops. On a single CPU that is what makes
//   the lock correct at all:
//     1. Foreground code holds lock L with interrupts enabled
//     2. An interrupt fires and its handler tries to take L
//     3. The handler spins forever, since the foreground can't run to
//        release L until the handler returns
//   With IF cleared while L is held, step 2 cannot happen.
//
//   The saved state is restored exactly, so nesting works and a lock taken
//   inside an interrupt handler (IF already clear) leaves IF clear.
// =============================================================================

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use khal::cpu;

/// A ticket-based spinlock that disables interrupts while held.
pub struct SpinLock<T> {
    /// The next ticket to be dispensed.
    next_ticket: AtomicU32,

    /// The ticket currently allowed in.
    now_serving: AtomicU32,

    data: UnsafeCell<T>,
}

// SAFETY: the lock hands out access to `T` to one holder at a time.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new, unlocked spinlock. Usable in statics.
    pub const fn new(value: T) -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            now_serving: AtomicU32::new(0),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock with interrupts disabled.
    ///
    /// The previous interrupt state is restored when the guard drops:
    ///   - enabled before → disabled while held, re-enabled on unlock
    ///   - already disabled → stays disabled
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let irq_was_enabled = cpu::interrupts_enabled();
        cpu::disable_interrupts();

        let my_ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.now_serving.load(Ordering::Acquire) != my_ticket {
            cpu::pause();
        }

        SpinLockGuard {
            lock: self,
            irq_was_enabled,
        }
    }

    /// Acquires the lock only if it is free right now.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let irq_was_enabled = cpu::interrupts_enabled();
        cpu::disable_interrupts();

        let current = self.now_serving.load(Ordering::Relaxed);
        let result = self.next_ticket.compare_exchange(
            current,
            current.wrapping_add(1),
            Ordering::Acquire,
            Ordering::Relaxed,
        );

        match result {
            Ok(_) => Some(SpinLockGuard {
                lock: self,
                irq_was_enabled,
            }),
            Err(_) => {
                if irq_was_enabled {
                    cpu::enable_interrupts();
                }
                None
            }
        }
    }

    /// Exclusive access without locking; `&mut self` already proves it.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// RAII guard for a held spinlock. Dropping it releases the lock and
/// restores the interrupt flag.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    irq_was_enabled: bool,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves we hold the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves we hold the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.now_serving.fetch_add(1, Ordering::Release);
        if self.irq_was_enabled {
            cpu::enable_interrupts();
        }
    }
}
