// =============================================================================
// PMOS — Synchronization
// =============================================================================
//
// There is one CPU and no scheduler, so the only concurrency is an interrupt
// handler preempting foreground code. Driver state shared between the two
// lives behind `SpinLock`, which disables interrupts while held: the handler
// can then never find the lock taken by the code it interrupted.
//
// Lock ordering: a handler table lock is never held while a handler runs,
// and no driver lock is held across a call into another driver.
// =============================================================================

pub mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard};
