//! Hardware Abstraction Layer.
//!
//! The one place that touches ports, physical memory and privileged CPU
//! state. Controller drivers are generic over [`PortIo`] so they can be
//! driven by [`mock::MockPorts`] in host tests.
#![no_std]

#[cfg(any(test, feature = "mock"))]
extern crate std;

pub mod cpu;
pub mod mmio;
pub mod pic;
pub mod pit;
pub mod port;
pub mod ps2;
pub mod serial;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use port::{PortIo, Ports};
