//! PS/2 keyboard, scancode set 1 as delivered by the controller's
//! translation.
//!
//! The interrupt handler decodes one byte at a time into a 256-byte queue.
//! Foreground code drains whole lines with [`read_line`].

use bitflags::bitflags;

use khal::cpu;
use khal::port::PortIo;
use khal::ps2::{self, Ps2Controller, Ps2Error};

use crate::sync::SpinLock;
use crate::traps::{self, InterruptFrame, IrqError, IrqHandler};

/// Hardware line of the first PS/2 port.
pub const KEYBOARD_LINE: u8 = 1;

/// Bytes the input queue holds.
pub const QUEUE_CAPACITY: usize = 256;

// ── Scancodes ─────────────────────────────────────────────────────

const RELEASE_BIT: u8 = 0x80;
const EXTENDED_PREFIX: u8 = 0xE0;

pub const SC_BACKSPACE: u8 = 0x0E;
pub const SC_TAB: u8 = 0x0F;
pub const SC_ENTER: u8 = 0x1C;
pub const SC_CTRL: u8 = 0x1D;
pub const SC_LEFT_SHIFT: u8 = 0x2A;
pub const SC_RIGHT_SHIFT: u8 = 0x36;
pub const SC_ALT: u8 = 0x38;
pub const SC_CAPS_LOCK: u8 = 0x3A;
/// Keypad `.`; Delete when extended.
pub const SC_DELETE: u8 = 0x53;

// ── Device commands ──────────────────────────────────────────────

const CMD_SET_LEDS: u8 = 0xED;
const CMD_SCANCODE_SET: u8 = 0xF0;
const SCANCODE_SET_2: u8 = 0x02;
const LED_CAPS_LOCK: u8 = 0x04;

const fn keymap(prefix: &[u8]) -> [u8; 128] {
    let mut map = [0; 128];
    let mut i = 0;
    while i < prefix.len() {
        map[i] = prefix[i];
        i += 1;
    }
    map
}

/// US layout, no modifiers. Zero marks keys that produce no character.
pub const UNSHIFTED: [u8; 128] =
    keymap(b"\0\x001234567890-=\0\0qwertyuiop[]\0\0asdfghjkl;'`\0\\zxcvbnm,./\0*\0 ");

/// US layout with shift held.
pub const SHIFTED: [u8; 128] =
    keymap(b"\0\0!@#$%^&*()_+\0\0QWERTYUIOP{}\0\0ASDFGHJKL:\"~\0|ZXCVBNM<>?\0*\0 ");

bitflags! {
    /// Modifier keys currently held, plus the caps-lock toggle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Modifiers: u8 {
        const LEFT_SHIFT = 1 << 0;
        const RIGHT_SHIFT = 1 << 1;
        const CTRL = 1 << 2;
        const ALT = 1 << 3;
        const CAPS_LOCK = 1 << 4;
    }
}

/// What one scancode did, for the parts the decoder cannot do itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEvent {
    /// Nothing visible: a release, a modifier, a prefix, or a dropped byte.
    None,
    /// A byte was queued.
    Queued(u8),
    /// The newest unread byte was removed.
    Erased,
    /// Caps lock toggled; the indicator lights need updating.
    CapsLock(bool),
    /// Control+Alt+Delete.
    Reset,
}

/// Fixed-size byte queue. Full means the new byte is dropped.
struct RingBuffer {
    buf: [u8; QUEUE_CAPACITY],
    read: usize,
    count: usize,
}

impl RingBuffer {
    const fn new() -> Self {
        Self {
            buf: [0; QUEUE_CAPACITY],
            read: 0,
            count: 0,
        }
    }

    fn push(&mut self, byte: u8) -> bool {
        if self.count == QUEUE_CAPACITY {
            return false;
        }
        self.buf[(self.read + self.count) % QUEUE_CAPACITY] = byte;
        self.count += 1;
        true
    }

    fn pop(&mut self) -> Option<u8> {
        if self.count == 0 {
            return None;
        }
        let byte = self.buf[self.read];
        self.read = (self.read + 1) % QUEUE_CAPACITY;
        self.count -= 1;
        Some(byte)
    }

    fn last(&self) -> Option<u8> {
        self.count
            .checked_sub(1)
            .map(|newest| self.buf[(self.read + newest) % QUEUE_CAPACITY])
    }

    fn pop_back(&mut self) -> Option<u8> {
        let byte = self.last()?;
        self.count -= 1;
        Some(byte)
    }

    fn len(&self) -> usize {
        self.count
    }

    fn is_full(&self) -> bool {
        self.count == QUEUE_CAPACITY
    }
}

/// Decoder state and the input queue.
pub struct KeyboardState {
    modifiers: Modifiers,
    key_down: [bool; 128],
    extended: bool,
    queue: RingBuffer,
    /// Newlines in the queue.
    lines: usize,
}

impl KeyboardState {
    pub const fn new() -> Self {
        Self {
            modifiers: Modifiers::empty(),
            key_down: [false; 128],
            extended: false,
            queue: RingBuffer::new(),
            lines: 0,
        }
    }

    pub fn modifiers(&self) -> Modifiers {
        self.modifiers
    }

    pub fn is_key_down(&self, code: u8) -> bool {
        self.key_down.get(code as usize).copied().unwrap_or(false)
    }

    pub fn has_line(&self) -> bool {
        self.lines > 0
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Decode one byte from the data port.
    pub fn on_scancode(&mut self, byte: u8) -> KeyEvent {
        match byte {
            EXTENDED_PREFIX => {
                self.extended = true;
                return KeyEvent::None;
            }
            ps2::ACK | ps2::RESEND => return KeyEvent::None,
            _ => {}
        }

        let extended = core::mem::take(&mut self.extended);
        let pressed = byte & RELEASE_BIT == 0;
        let code = byte & !RELEASE_BIT;

        // Print Screen wraps itself in extended fake shifts.
        if extended && (code == SC_LEFT_SHIFT || code == SC_RIGHT_SHIFT) {
            return KeyEvent::None;
        }

        self.key_down[code as usize] = pressed;

        match code {
            SC_LEFT_SHIFT => self.modifiers.set(Modifiers::LEFT_SHIFT, pressed),
            SC_RIGHT_SHIFT => self.modifiers.set(Modifiers::RIGHT_SHIFT, pressed),
            SC_CTRL => self.modifiers.set(Modifiers::CTRL, pressed),
            SC_ALT => self.modifiers.set(Modifiers::ALT, pressed),
            _ => {}
        }
        if !pressed {
            return KeyEvent::None;
        }

        match code {
            SC_LEFT_SHIFT | SC_RIGHT_SHIFT | SC_CTRL | SC_ALT => KeyEvent::None,
            SC_CAPS_LOCK => {
                self.modifiers.toggle(Modifiers::CAPS_LOCK);
                KeyEvent::CapsLock(self.caps_lock())
            }
            SC_DELETE if self.ctrl() && self.alt() => KeyEvent::Reset,
            SC_BACKSPACE => self.erase(),
            SC_ENTER => self.enqueue(b'\n'),
            SC_TAB => self.enqueue(b'\t'),
            _ => match self.translate(code) {
                0 => KeyEvent::None,
                byte => self.enqueue(byte),
            },
        }
    }

    /// Character for `code` under the current modifiers, or zero.
    pub fn translate(&self, code: u8) -> u8 {
        let index = code as usize & 0x7F;
        let byte = if self.shift() {
            SHIFTED[index]
        } else {
            UNSHIFTED[index]
        };
        if self.caps_lock() && byte.is_ascii_alphabetic() {
            byte ^ 0x20
        } else {
            byte
        }
    }

    fn enqueue(&mut self, byte: u8) -> KeyEvent {
        if !self.queue.push(byte) {
            return KeyEvent::None;
        }
        if byte == b'\n' {
            self.lines += 1;
        }
        KeyEvent::Queued(byte)
    }

    /// Drop the newest unread byte, but never a finished line.
    fn erase(&mut self) -> KeyEvent {
        match self.queue.last() {
            Some(b'\n') | None => KeyEvent::None,
            Some(_) => {
                self.queue.pop_back();
                KeyEvent::Erased
            }
        }
    }

    /// Whether `read_line` into a buffer of `capacity` can finish now.
    fn line_ready(&self, capacity: usize) -> bool {
        self.has_line() || self.queue.is_full() || self.queue.len() >= capacity
    }

    /// Move bytes into `buf` up to and excluding the first newline, which
    /// is consumed. Stops early when `buf` is full.
    fn drain_line(&mut self, buf: &mut [u8]) -> usize {
        let mut len = 0;
        while len < buf.len() {
            match self.queue.pop() {
                Some(b'\n') => {
                    self.lines -= 1;
                    break;
                }
                Some(byte) => {
                    buf[len] = byte;
                    len += 1;
                }
                None => break,
            }
        }
        len
    }

    pub fn shift(&self) -> bool {
        self.modifiers
            .intersects(Modifiers::LEFT_SHIFT | Modifiers::RIGHT_SHIFT)
    }

    pub fn ctrl(&self) -> bool {
        self.modifiers.contains(Modifiers::CTRL)
    }

    pub fn alt(&self) -> bool {
        self.modifiers.contains(Modifiers::ALT)
    }

    pub fn caps_lock(&self) -> bool {
        self.modifiers.contains(Modifiers::CAPS_LOCK)
    }
}

impl Default for KeyboardState {
    fn default() -> Self {
        Self::new()
    }
}

/// The driver: decoder state behind an interrupt-safe lock.
pub struct Keyboard {
    state: SpinLock<KeyboardState>,
}

impl Keyboard {
    pub const fn new() -> Self {
        Self {
            state: SpinLock::new(KeyboardState::new()),
        }
    }

    /// Enable the first port and select scancode set 2, which the controller
    /// translates to set 1.
    pub fn init<P: PortIo>(&self, ps2: &Ps2Controller<P>) -> Result<(), Ps2Error> {
        ps2.write_command(ps2::CMD_ENABLE_FIRST_PORT)?;
        ps2.send_device(CMD_SCANCODE_SET)?;
        ps2.send_device(SCANCODE_SET_2)?;
        ps2.flush();
        *self.state.lock() = KeyboardState::new();
        Ok(())
    }

    /// Interrupt path: read one byte and act on it.
    ///
    /// A reset request has already pulsed the reset line when this returns
    /// [`KeyEvent::Reset`]; the caller only has to stop.
    pub fn handle_irq<P: PortIo>(&self, ps2: &Ps2Controller<P>) -> KeyEvent {
        let byte = ps2.read_data_now();
        let event = self.state.lock().on_scancode(byte);
        match event {
            KeyEvent::CapsLock(on) => {
                if let Err(err) = set_leds(ps2, if on { LED_CAPS_LOCK } else { 0 }) {
                    log::warn!("keyboard: LED update failed: {:?}", err);
                }
            }
            KeyEvent::Reset => {
                log::warn!("keyboard: ctrl+alt+del, resetting");
                ps2.pulse_reset();
            }
            _ => {}
        }
        event
    }

    /// Block until a line is complete, then copy it into `buf` without the
    /// newline. A line longer than `buf` is returned in pieces.
    pub fn read_line(&self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        loop {
            {
                let mut state = self.state.lock();
                if state.line_ready(buf.len()) {
                    return state.drain_line(buf);
                }
            }
            cpu::halt();
        }
    }

    /// Run `f` with the state locked.
    pub fn with_state<R>(&self, f: impl FnOnce(&KeyboardState) -> R) -> R {
        f(&self.state.lock())
    }
}

impl Default for Keyboard {
    fn default() -> Self {
        Self::new()
    }
}

/// Indicator handshake. The ACKs come back as ordinary interrupts and
/// the decoder skips them.
fn set_leds<P: PortIo>(ps2: &Ps2Controller<P>, leds: u8) -> Result<(), Ps2Error> {
    ps2.write_data(CMD_SET_LEDS)?;
    ps2.write_data(leds)
}

// =============================================================================
// Global instance
// =============================================================================

static KEYBOARD: Keyboard = Keyboard::new();

struct KeyboardIrq;

impl IrqHandler for KeyboardIrq {
    fn handle(&self, _line: u8, _frame: &InterruptFrame) {
        if KEYBOARD.handle_irq(&super::PS2) == KeyEvent::Reset {
            cpu::halt_forever();
        }
    }
}

static KEYBOARD_IRQ: KeyboardIrq = KeyboardIrq;

/// Bring up the keyboard and unmask line 1. A keyboard that does not answer
/// is logged and left enabled: typing may still work.
pub fn init() -> Result<(), IrqError> {
    if let Err(err) = KEYBOARD.init(&super::PS2) {
        log::warn!("keyboard: init handshake failed: {:?}", err);
    }
    traps::register_irq(KEYBOARD_LINE, &KEYBOARD_IRQ)?;
    log::info!("keyboard: ready");
    Ok(())
}

pub fn read_line(buf: &mut [u8]) -> usize {
    KEYBOARD.read_line(buf)
}

pub fn is_key_down(code: u8) -> bool {
    KEYBOARD.with_state(|s| s.is_key_down(code))
}

pub fn has_line() -> bool {
    KEYBOARD.with_state(KeyboardState::has_line)
}

pub fn shift() -> bool {
    KEYBOARD.with_state(KeyboardState::shift)
}

pub fn ctrl() -> bool {
    KEYBOARD.with_state(KeyboardState::ctrl)
}

pub fn alt() -> bool {
    KEYBOARD.with_state(KeyboardState::alt)
}

pub fn caps_lock() -> bool {
    KEYBOARD.with_state(KeyboardState::caps_lock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use khal::mock::MockPorts;
    use khal::ps2::{PS2_COMMAND, PS2_DATA, PS2_STATUS, Status};

    fn press(state: &mut KeyboardState, code: u8) -> KeyEvent {
        state.on_scancode(code)
    }

    fn release(state: &mut KeyboardState, code: u8) -> KeyEvent {
        state.on_scancode(code | RELEASE_BIT)
    }

    fn tap(state: &mut KeyboardState, code: u8) -> KeyEvent {
        let event = press(state, code);
        release(state, code);
        event
    }

    fn drain(state: &mut KeyboardState) -> std::vec::Vec<u8> {
        core::iter::from_fn(|| state.queue.pop()).collect()
    }

    #[test]
    fn printable_codes_follow_unshifted_table() {
        let mut state = KeyboardState::new();
        for code in 0..0x80u8 {
            assert_eq!(state.translate(code), UNSHIFTED[code as usize], "code {code:#x}");
        }
        assert_eq!(tap(&mut state, 0x1E), KeyEvent::Queued(b'a'));
        assert_eq!(tap(&mut state, 0x02), KeyEvent::Queued(b'1'));
        assert_eq!(tap(&mut state, 0x39), KeyEvent::Queued(b' '));
    }

    #[test]
    fn shift_selects_shifted_table() {
        let mut state = KeyboardState::new();
        press(&mut state, SC_LEFT_SHIFT);
        for code in 0..0x80u8 {
            assert_eq!(state.translate(code), SHIFTED[code as usize], "code {code:#x}");
        }
        release(&mut state, SC_LEFT_SHIFT);
        assert!(!state.shift());

        press(&mut state, SC_RIGHT_SHIFT);
        assert_eq!(tap(&mut state, 0x02), KeyEvent::Queued(b'!'));
    }

    #[test]
    fn caps_lock_folds_letters_only() {
        let mut state = KeyboardState::new();
        assert_eq!(tap(&mut state, SC_CAPS_LOCK), KeyEvent::CapsLock(true));
        for code in 0..0x80u8 {
            let plain = UNSHIFTED[code as usize];
            let expected = if plain.is_ascii_lowercase() {
                plain.to_ascii_uppercase()
            } else {
                plain
            };
            assert_eq!(state.translate(code), expected, "code {code:#x}");
        }

        press(&mut state, SC_LEFT_SHIFT);
        assert_eq!(state.translate(0x1E), b'a');
        assert_eq!(state.translate(0x02), b'!');
        release(&mut state, SC_LEFT_SHIFT);

        assert_eq!(tap(&mut state, SC_CAPS_LOCK), KeyEvent::CapsLock(false));
        assert_eq!(state.translate(0x1E), b'a');
    }

    #[test]
    fn release_and_key_down_table() {
        let mut state = KeyboardState::new();
        assert_eq!(press(&mut state, 0x10), KeyEvent::Queued(b'q'));
        assert!(state.is_key_down(0x10));
        assert_eq!(release(&mut state, 0x10), KeyEvent::None);
        assert!(!state.is_key_down(0x10));
        assert!(!state.is_key_down(0xFF));
        assert_eq!(drain(&mut state), b"q");
    }

    #[test]
    fn queue_is_fifo_and_drops_newest_when_full() {
        let mut state = KeyboardState::new();
        let letters = [0x10u8, 0x11, 0x12, 0x13];
        for i in 0..QUEUE_CAPACITY {
            tap(&mut state, letters[i % letters.len()]);
        }
        assert_eq!(state.queued(), QUEUE_CAPACITY);

        assert_eq!(tap(&mut state, 0x2C), KeyEvent::None);
        assert_eq!(state.queued(), QUEUE_CAPACITY);

        let drained = drain(&mut state);
        assert_eq!(drained.len(), QUEUE_CAPACITY);
        for (i, &byte) in drained.iter().enumerate() {
            assert_eq!(byte, b"qwer"[i % 4]);
        }
    }

    #[test]
    fn backspace_removes_newest_unread_byte() {
        let mut state = KeyboardState::new();
        tap(&mut state, 0x23); // h
        tap(&mut state, 0x17); // i
        assert_eq!(tap(&mut state, SC_BACKSPACE), KeyEvent::Erased);
        tap(&mut state, SC_ENTER);
        assert_eq!(tap(&mut state, SC_BACKSPACE), KeyEvent::None);
        assert_eq!(drain(&mut state), b"h\n");

        assert_eq!(tap(&mut state, SC_BACKSPACE), KeyEvent::None);
    }

    #[test]
    fn enter_completes_a_line_and_tab_is_queued() {
        let mut state = KeyboardState::new();
        tap(&mut state, 0x14); // t
        assert_eq!(tap(&mut state, SC_TAB), KeyEvent::Queued(b'\t'));
        assert!(!state.has_line());
        assert_eq!(tap(&mut state, SC_ENTER), KeyEvent::Queued(b'\n'));
        assert!(state.has_line());

        let mut buf = [0u8; 16];
        assert_eq!(state.drain_line(&mut buf), 2);
        assert_eq!(&buf[..2], b"t\t");
        assert!(!state.has_line());
    }

    #[test]
    fn extended_keys_update_modifiers() {
        let mut state = KeyboardState::new();
        press(&mut state, EXTENDED_PREFIX);
        press(&mut state, SC_CTRL);
        assert!(state.ctrl());
        press(&mut state, EXTENDED_PREFIX);
        press(&mut state, SC_ALT);
        assert!(state.alt());

        // Print Screen's fake shift does not stick.
        press(&mut state, EXTENDED_PREFIX);
        press(&mut state, SC_LEFT_SHIFT);
        assert!(!state.shift());
    }

    #[test]
    fn ctrl_alt_delete_requests_reset() {
        let mut state = KeyboardState::new();
        press(&mut state, SC_CTRL);
        assert_eq!(tap(&mut state, SC_DELETE), KeyEvent::None);
        press(&mut state, SC_ALT);
        assert_eq!(press(&mut state, SC_DELETE), KeyEvent::Reset);

        press(&mut state, EXTENDED_PREFIX);
        assert_eq!(press(&mut state, SC_DELETE), KeyEvent::Reset);
    }

    #[test]
    fn acks_are_not_keys() {
        let mut state = KeyboardState::new();
        assert_eq!(state.on_scancode(ps2::ACK), KeyEvent::None);
        assert!(!state.is_key_down(ps2::ACK & 0x7F));
    }

    fn controller() -> Ps2Controller<MockPorts> {
        let ctrl = Ps2Controller::new(MockPorts::new());
        ctrl.ports().set_default(PS2_STATUS, Status::OUTPUT_FULL.bits());
        ctrl
    }

    #[test]
    fn caps_lock_interrupt_updates_leds() {
        let keyboard = Keyboard::new();
        let ps2 = controller();
        ps2.ports().script(PS2_DATA, &[SC_CAPS_LOCK]);

        assert_eq!(keyboard.handle_irq(&ps2), KeyEvent::CapsLock(true));
        assert_eq!(ps2.ports().writes_to(PS2_DATA), [CMD_SET_LEDS, LED_CAPS_LOCK]);
        assert!(keyboard.with_state(KeyboardState::caps_lock));
    }

    #[test]
    fn reset_pulses_controller() {
        let keyboard = Keyboard::new();
        let ps2 = controller();
        ps2.ports().script(PS2_DATA, &[SC_CTRL, SC_ALT, SC_DELETE]);

        keyboard.handle_irq(&ps2);
        keyboard.handle_irq(&ps2);
        assert_eq!(keyboard.handle_irq(&ps2), KeyEvent::Reset);
        assert_eq!(ps2.ports().writes(), [(PS2_COMMAND, ps2::CMD_PULSE_RESET)]);
    }

    #[test]
    fn init_enables_port_and_selects_set_two() {
        let keyboard = Keyboard::new();
        let ps2 = controller();
        ps2.ports().script(PS2_DATA, &[ps2::ACK, ps2::ACK]);

        keyboard.init(&ps2).unwrap();
        assert_eq!(
            ps2.ports().writes(),
            [
                (PS2_COMMAND, ps2::CMD_ENABLE_FIRST_PORT),
                (PS2_DATA, CMD_SCANCODE_SET),
                (PS2_DATA, SCANCODE_SET_2),
            ]
        );
    }

    #[test]
    fn read_line_returns_queued_line() {
        let keyboard = Keyboard::new();
        let ps2 = controller();
        // "ok\n" then "x" left queued.
        ps2.ports().script(
            PS2_DATA,
            &[0x18, 0x98, 0x25, 0xA5, SC_ENTER, SC_ENTER | RELEASE_BIT, 0x2D],
        );
        for _ in 0..7 {
            keyboard.handle_irq(&ps2);
        }

        let mut buf = [0u8; 32];
        let len = keyboard.read_line(&mut buf);
        assert_eq!(&buf[..len], b"ok");
        assert_eq!(keyboard.with_state(KeyboardState::queued), 1);
        assert_eq!(keyboard.read_line(&mut []), 0);
    }

    #[test]
    fn read_line_splits_long_input() {
        let keyboard = Keyboard::new();
        {
            let mut state = keyboard.state.lock();
            for code in [0x10, 0x11, 0x12, 0x13, SC_ENTER] {
                tap(&mut state, code);
            }
        }

        let mut buf = [0u8; 3];
        assert_eq!(keyboard.read_line(&mut buf), 3);
        assert_eq!(&buf, b"qwe");
        assert_eq!(keyboard.read_line(&mut buf), 1);
        assert_eq!(&buf[..1], b"r");
        assert!(!keyboard.with_state(KeyboardState::has_line));
    }
}
