//! Volatile access to physical memory.
//!
//! Paging is never enabled, so a physical address is also the address the
//! CPU dereferences.

/// Read a `T` from physical address `addr` without letting the compiler
/// elide or reorder the access.
///
/// # Safety
///
/// `addr` must be suitably aligned for `T` and refer to memory (or a
/// device window) that is valid to read.
#[inline]
pub unsafe fn volatile_read<T: Copy>(addr: usize) -> T {
    unsafe { core::ptr::read_volatile(addr as *const T) }
}

/// Write `value` to physical address `addr` as a volatile store.
///
/// # Safety
///
/// `addr` must be suitably aligned for `T` and refer to memory (or a
/// device window) that is valid to write and not aliased by Rust references.
#[inline]
pub unsafe fn volatile_write<T: Copy>(addr: usize, value: T) {
    unsafe { core::ptr::write_volatile(addr as *mut T, value) }
}
