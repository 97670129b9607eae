//! Scriptable [`PortIo`] backend for host-side tests.
//!
//! Writes are recorded in order. Reads pop from a per-port script and fall
//! back to a per-port default (zero unless set) once the script runs dry.

use std::collections::{BTreeMap, VecDeque};
use std::vec::Vec;

use spin::Mutex;

use crate::port::PortIo;

#[derive(Default)]
struct State {
    writes: Vec<(u16, u8)>,
    word_writes: Vec<(u16, u16)>,
    scripted: BTreeMap<u16, VecDeque<u8>>,
    defaults: BTreeMap<u16, u8>,
    reads: usize,
}

/// Recording port backend.
#[derive(Default)]
pub struct MockPorts {
    state: Mutex<State>,
}

impl MockPorts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value returned by reads of `port` when nothing is scripted.
    pub fn set_default(&self, port: u16, value: u8) {
        self.state.lock().defaults.insert(port, value);
    }

    /// Queue bytes that successive reads of `port` return.
    pub fn script(&self, port: u16, bytes: &[u8]) {
        self.state
            .lock()
            .scripted
            .entry(port)
            .or_default()
            .extend(bytes.iter().copied());
    }

    /// Byte writes so far, oldest first.
    pub fn writes(&self) -> Vec<(u16, u8)> {
        self.state.lock().writes.clone()
    }

    /// Byte writes to one port, oldest first.
    pub fn writes_to(&self, port: u16) -> Vec<u8> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|(p, _)| *p == port)
            .map(|&(_, v)| v)
            .collect()
    }

    /// Word writes so far, oldest first.
    pub fn word_writes(&self) -> Vec<(u16, u16)> {
        self.state.lock().word_writes.clone()
    }

    /// Total number of reads served.
    pub fn read_count(&self) -> usize {
        self.state.lock().reads
    }

    pub fn clear_writes(&self) {
        let mut state = self.state.lock();
        state.writes.clear();
        state.word_writes.clear();
    }
}

impl PortIo for MockPorts {
    fn read_u8(&self, port: u16) -> u8 {
        let mut state = self.state.lock();
        state.reads += 1;
        if let Some(value) = state.scripted.get_mut(&port).and_then(VecDeque::pop_front) {
            return value;
        }
        state.defaults.get(&port).copied().unwrap_or(0)
    }

    fn write_u8(&self, port: u16, value: u8) {
        self.state.lock().writes.push((port, value));
    }

    fn read_u16(&self, port: u16) -> u16 {
        let lo = self.read_u8(port) as u16;
        let hi = self.read_u8(port) as u16;
        lo | (hi << 8)
    }

    fn write_u16(&self, port: u16, value: u16) {
        self.state.lock().word_writes.push((port, value));
    }
}
