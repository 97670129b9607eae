//! x86 port I/O.
//!
//! Everything above this module talks to hardware through the [`PortIo`]
//! trait. [`Ports`] is the only implementation that executes `in`/`out`,
//! and constructing it is the single unsafe step: once a `Ports` exists,
//! reading and writing ports through it is safe.

/// Byte- and word-wide access to the x86 I/O port space.
pub trait PortIo {
    /// Read one byte from `port`.
    fn read_u8(&self, port: u16) -> u8;

    /// Write one byte to `port`.
    fn write_u8(&self, port: u16, value: u8);

    /// Read one 16-bit word from `port`.
    fn read_u16(&self, port: u16) -> u16;

    /// Write one 16-bit word to `port`.
    fn write_u16(&self, port: u16, value: u16);

    /// Short delay for slow legacy devices, done by writing the POST
    /// diagnostic port.
    #[inline]
    fn io_wait(&self) {
        self.write_u8(POST_PORT, 0);
    }
}

/// Unused diagnostic port; writes to it take about one microsecond.
pub const POST_PORT: u16 = 0x80;

/// Real port access via the `in` and `out` instructions.
#[derive(Debug, Clone, Copy)]
pub struct Ports {
    _private: (),
}

impl Ports {
    /// Obtain a handle to the machine's I/O ports.
    ///
    /// # Safety
    ///
    /// The caller must run at a privilege level allowed to execute `in`
    /// and `out` (ring 0 in this kernel). Port writes reach real devices,
    /// so only the drivers that own a port may use it.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl PortIo for Ports {
    #[inline]
    fn read_u8(&self, port: u16) -> u8 {
        let value: u8;
        unsafe {
            core::arch::asm!(
                "in al, dx",
                in("dx") port,
                out("al") value,
                options(nomem, nostack, preserves_flags)
            );
        }
        value
    }

    #[inline]
    fn write_u8(&self, port: u16, value: u8) {
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") port,
                in("al") value,
                options(nomem, nostack, preserves_flags)
            );
        }
    }

    #[inline]
    fn read_u16(&self, port: u16) -> u16 {
        let value: u16;
        unsafe {
            core::arch::asm!(
                "in ax, dx",
                in("dx") port,
                out("ax") value,
                options(nomem, nostack, preserves_flags)
            );
        }
        value
    }

    #[inline]
    fn write_u16(&self, port: u16, value: u16) {
        unsafe {
            core::arch::asm!(
                "out dx, ax",
                in("dx") port,
                in("ax") value,
                options(nomem, nostack, preserves_flags)
            );
        }
    }
}

impl<T: PortIo + ?Sized> PortIo for &T {
    #[inline]
    fn read_u8(&self, port: u16) -> u8 {
        (**self).read_u8(port)
    }

    #[inline]
    fn write_u8(&self, port: u16, value: u8) {
        (**self).write_u8(port, value)
    }

    #[inline]
    fn read_u16(&self, port: u16) -> u16 {
        (**self).read_u16(port)
    }

    #[inline]
    fn write_u16(&self, port: u16, value: u16) {
        (**self).write_u16(port, value)
    }
}
