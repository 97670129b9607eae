//! PS/2 mouse on the auxiliary port.
//!
//! Bytes arrive one per interrupt and are assembled into 3-byte packets, or
//! 4-byte packets once the IntelliMouse knock has switched on the wheel.
//! Byte 0 of every packet has bit 3 set; a packet without it is thrown away
//! whole and the next byte starts a new packet.

use bitflags::bitflags;

use khal::port::PortIo;
use khal::ps2::{self, Config, Ps2Controller, Ps2Error};

use crate::config::KernelConfig;
use crate::sync::SpinLock;
use crate::traps::{self, InterruptFrame, IrqError, IrqHandler};

/// Hardware line of the auxiliary PS/2 port.
pub const MOUSE_LINE: u8 = 12;

// ── Device commands ──────────────────────────────────────────────

const CMD_RESET: u8 = 0xFF;
const CMD_SET_DEFAULTS: u8 = 0xF6;
const CMD_SET_SAMPLE_RATE: u8 = 0xF3;
const CMD_GET_DEVICE_ID: u8 = 0xF2;
const CMD_ENABLE_STREAMING: u8 = 0xF4;

/// Sample rates that switch an IntelliMouse into wheel mode.
const WHEEL_KNOCK: [u8; 3] = [200, 100, 80];
/// Device id reported once the wheel is on.
const ID_WHEEL: u8 = 0x03;

// ── Packet byte 0 ────────────────────────────────────────────────

const SYNC_BIT: u8 = 0x08;
const X_SIGN: u8 = 0x10;
const Y_SIGN: u8 = 0x20;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Buttons: u8 {
        const LEFT = 0x01;
        const RIGHT = 0x02;
        const MIDDLE = 0x04;
    }
}

/// One decoded packet. `dy` already points down the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub buttons: Buttons,
    pub dx: i32,
    pub dy: i32,
    pub dz: i32,
}

impl Packet {
    /// Decode an assembled packet, or `None` if the sync bit is clear.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (&flags, rest) = bytes.split_first()?;
        if flags & SYNC_BIT == 0 || rest.len() < 2 {
            return None;
        }
        Some(Self {
            buttons: Buttons::from_bits_truncate(flags),
            dx: extend(rest[0], flags & X_SIGN != 0),
            dy: -extend(rest[1], flags & Y_SIGN != 0),
            dz: rest.get(2).map_or(0, |&z| z as i8 as i32),
        })
    }
}

/// 9-bit two's complement: the delta byte plus its sign bit from byte 0.
fn extend(raw: u8, negative: bool) -> i32 {
    if negative {
        raw as i32 - 0x100
    } else {
        raw as i32
    }
}

/// Pointer position, buttons, wheel, and the packet being assembled.
pub struct MouseState {
    x: i32,
    y: i32,
    wheel: i32,
    buttons: Buttons,
    packet: [u8; 4],
    fill: usize,
    has_wheel: bool,
    max_x: i32,
    max_y: i32,
}

impl MouseState {
    pub const fn new(config: &KernelConfig) -> Self {
        let cursor = config.cursor_size as i32;
        let mut state = Self {
            x: 0,
            y: 0,
            wheel: 0,
            buttons: Buttons::empty(),
            packet: [0; 4],
            fill: 0,
            has_wheel: false,
            max_x: config.screen_width as i32 - cursor - 1,
            max_y: config.screen_height as i32 - cursor - 1,
        };
        state.x = clamp(config.pointer_start.0 as i32, state.max_x);
        state.y = clamp(config.pointer_start.1 as i32, state.max_y);
        state
    }

    fn packet_len(&self) -> usize {
        if self.has_wheel { 4 } else { 3 }
    }

    /// Take one byte from the device. Returns the packet it completed, if it
    /// completed a valid one.
    pub fn feed(&mut self, byte: u8) -> Option<Packet> {
        self.packet[self.fill] = byte;
        self.fill += 1;
        if self.fill < self.packet_len() {
            return None;
        }
        let len = self.fill;
        self.fill = 0;

        let packet = Packet::decode(&self.packet[..len])?;
        self.apply(packet);
        Some(packet)
    }

    fn apply(&mut self, packet: Packet) {
        self.buttons = packet.buttons;
        self.x = clamp(self.x + packet.dx, self.max_x);
        self.y = clamp(self.y + packet.dy, self.max_y);
        self.wheel = self.wheel.wrapping_add(packet.dz);
    }

    pub fn set_position(&mut self, x: i32, y: i32) {
        self.x = clamp(x, self.max_x);
        self.y = clamp(y, self.max_y);
    }

    /// Switch packet framing. Any half-assembled packet is dropped.
    fn set_wheel(&mut self, has_wheel: bool) {
        self.has_wheel = has_wheel;
        self.fill = 0;
    }

    pub fn position(&self) -> (i32, i32) {
        (self.x, self.y)
    }

    pub fn wheel(&self) -> i32 {
        self.wheel
    }

    pub fn buttons(&self) -> Buttons {
        self.buttons
    }

    pub fn has_wheel(&self) -> bool {
        self.has_wheel
    }
}

const fn clamp(value: i32, max: i32) -> i32 {
    if value < 0 {
        0
    } else if value > max {
        max
    } else {
        value
    }
}

/// The driver: pointer state behind an interrupt-safe lock.
pub struct Mouse {
    state: SpinLock<MouseState>,
}

impl Mouse {
    pub const fn new(config: &KernelConfig) -> Self {
        Self {
            state: SpinLock::new(MouseState::new(config)),
        }
    }

    /// Bring up the auxiliary port and the device.
    ///
    /// Controller failures are returned. Device commands that go
    /// unacknowledged are logged and skipped, enable-streaming included; a
    /// failed wheel probe leaves the packet framing as it was.
    pub fn init<P: PortIo>(
        &self,
        ps2: &Ps2Controller<P>,
        config: &KernelConfig,
    ) -> Result<(), Ps2Error> {
        {
            let mut state = self.state.lock();
            let has_wheel = state.has_wheel;
            *state = MouseState::new(config);
            state.set_wheel(has_wheel);
        }

        ps2.write_command(ps2::CMD_ENABLE_AUX)?;
        let controller = ps2.read_config()?;
        ps2.write_config((controller | Config::SECOND_PORT_IRQ) - Config::SECOND_PORT_CLOCK_OFF)?;

        soft(CMD_RESET, reset(ps2));
        soft(CMD_SET_DEFAULTS, ps2.send_aux(CMD_SET_DEFAULTS));
        match probe_wheel(ps2) {
            Ok(has_wheel) => {
                self.state.lock().set_wheel(has_wheel);
                log::info!(
                    "mouse: {}",
                    if has_wheel { "wheel detected" } else { "standard 3-button" }
                );
            }
            Err(err) => soft(CMD_GET_DEVICE_ID, Err(err)),
        }
        soft(CMD_ENABLE_STREAMING, ps2.send_aux(CMD_ENABLE_STREAMING));
        ps2.flush();
        Ok(())
    }

    /// Interrupt path: read one byte and feed it to the assembler.
    pub fn handle_irq<P: PortIo>(&self, ps2: &Ps2Controller<P>) -> Option<Packet> {
        let byte = ps2.read_data_now();
        self.state.lock().feed(byte)
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut MouseState) -> R) -> R {
        f(&mut self.state.lock())
    }
}

fn soft(command: u8, result: Result<(), Ps2Error>) {
    if let Err(err) = result {
        log::warn!("mouse: command {:#04x} not applied: {:?}", command, err);
    }
}

/// Reset, then collect the self-test result and the device id that follow.
fn reset<P: PortIo>(ps2: &Ps2Controller<P>) -> Result<(), Ps2Error> {
    ps2.send_aux(CMD_RESET)?;
    match ps2.read_data()? {
        ps2::SELF_TEST_PASSED => {}
        response => return Err(Ps2Error::NoAck { command: CMD_RESET, response }),
    }
    ps2.read_data()?;
    Ok(())
}

fn set_sample_rate<P: PortIo>(ps2: &Ps2Controller<P>, rate: u8) -> Result<(), Ps2Error> {
    ps2.send_aux(CMD_SET_SAMPLE_RATE)?;
    ps2.send_aux(rate)
}

/// The IntelliMouse knock, then ask for the id.
fn probe_wheel<P: PortIo>(ps2: &Ps2Controller<P>) -> Result<bool, Ps2Error> {
    for rate in WHEEL_KNOCK {
        set_sample_rate(ps2, rate)?;
    }
    ps2.send_aux(CMD_GET_DEVICE_ID)?;
    Ok(ps2.read_data()? == ID_WHEEL)
}

// =============================================================================
// Global instance
// =============================================================================

static MOUSE: Mouse = Mouse::new(&KernelConfig::DEFAULT);

struct MouseIrq;

impl IrqHandler for MouseIrq {
    fn handle(&self, _line: u8, _frame: &InterruptFrame) {
        MOUSE.handle_irq(&super::PS2);
    }
}

static MOUSE_IRQ: MouseIrq = MouseIrq;

/// Bring up the mouse and unmask line 12. Setup failures are logged; the
/// line is unmasked either way, so a device that starts streaming later is
/// still heard.
pub fn init(config: &KernelConfig) -> Result<(), IrqError> {
    if let Err(err) = MOUSE.init(&super::PS2, config) {
        log::warn!("mouse: controller setup failed: {:?}", err);
    }
    traps::register_irq(MOUSE_LINE, &MOUSE_IRQ)?;
    log::info!("mouse: ready");
    Ok(())
}

pub fn position() -> (i32, i32) {
    MOUSE.with_state(|s| s.position())
}

pub fn set_position(x: i32, y: i32) {
    MOUSE.with_state(|s| s.set_position(x, y))
}

pub fn wheel() -> i32 {
    MOUSE.with_state(|s| s.wheel())
}

pub fn buttons() -> Buttons {
    MOUSE.with_state(|s| s.buttons())
}

pub fn left() -> bool {
    buttons().contains(Buttons::LEFT)
}

pub fn right() -> bool {
    buttons().contains(Buttons::RIGHT)
}

pub fn middle() -> bool {
    buttons().contains(Buttons::MIDDLE)
}
