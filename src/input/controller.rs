//! Gamepad Input
//!
//! gilrs-backed polling of standard-mapping gamepads, the binary
//! controller messages and the rumble round-trip: rumble state pushed by
//! the server is stored per slot and replayed on a 50 ms interval with
//! 60 ms effects so consecutive effects overlap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use gilrs::ff::{BaseEffect, BaseEffectType, EffectBuilder, Replay, Ticks};
use gilrs::{Axis, Button, Event, EventType, Gilrs};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::transport::DataChannel;
use crate::utils::ByteBuffer;

/// Standard-mapping button bits (XInput wButtons layout, widened to u32).
pub const BTN_DPAD_UP: u32 = 0x0001;
pub const BTN_DPAD_DOWN: u32 = 0x0002;
pub const BTN_DPAD_LEFT: u32 = 0x0004;
pub const BTN_DPAD_RIGHT: u32 = 0x0008;
pub const BTN_START: u32 = 0x0010;
pub const BTN_BACK: u32 = 0x0020;
pub const BTN_LEFT_STICK: u32 = 0x0040;
pub const BTN_RIGHT_STICK: u32 = 0x0080;
pub const BTN_LEFT_BUMPER: u32 = 0x0100;
pub const BTN_RIGHT_BUMPER: u32 = 0x0200;
pub const BTN_A: u32 = 0x1000;
pub const BTN_B: u32 = 0x2000;
pub const BTN_X: u32 = 0x4000;
pub const BTN_Y: u32 = 0x8000;

/// Capability flags advertised in the add message.
pub const CAP_RUMBLE: u16 = 0x0001;
pub const CAP_TRIGGER_RUMBLE: u16 = 0x0002;

/// Every button of the standard mapping.
pub const SUPPORTED_BUTTONS: u32 = BTN_DPAD_UP
    | BTN_DPAD_DOWN
    | BTN_DPAD_LEFT
    | BTN_DPAD_RIGHT
    | BTN_START
    | BTN_BACK
    | BTN_LEFT_STICK
    | BTN_RIGHT_STICK
    | BTN_LEFT_BUMPER
    | BTN_RIGHT_BUMPER
    | BTN_A
    | BTN_B
    | BTN_X
    | BTN_Y;

/// Analog stick deadzone (fraction of full deflection).
const STICK_DEADZONE: f32 = 0.15;

/// Rumble replay cadence and effect length; effects outlive the cadence so
/// sustained rumble has no gaps.
const RUMBLE_REPLAY_INTERVAL: Duration = Duration::from_millis(50);
const RUMBLE_EFFECT_MS: u32 = 60;

const TAG_ADD: u8 = 0;
const TAG_REMOVE: u8 = 1;
const TAG_STATE: u8 = 0;

/// User-facing controller options.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub invert_ab: bool,
    pub invert_xy: bool,
    /// State send interval override in milliseconds.
    pub send_interval_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            invert_ab: false,
            invert_xy: false,
            send_interval_ms: 16,
        }
    }
}

/// Snapshot of one gamepad's controls.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ControllerState {
    pub buttons: u32,
    /// Triggers in [0,1].
    pub left_trigger: f32,
    pub right_trigger: f32,
    /// Sticks in [-1,1], Y up-positive.
    pub left_x: f32,
    pub left_y: f32,
    pub right_x: f32,
    pub right_y: f32,
}

/// Rumble pushed by the server on the controllers channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RumbleCommand {
    Dual { slot: u8, low: u16, high: u16 },
    Trigger { slot: u8, left: u16, right: u16 },
}

impl RumbleCommand {
    pub fn slot(&self) -> u8 {
        match self {
            RumbleCommand::Dual { slot, .. } | RumbleCommand::Trigger { slot, .. } => *slot,
        }
    }
}

/// Add message on the controllers channel.
pub fn serialize_add(buf: &mut ByteBuffer, slot: u8, supported: u32, capabilities: u16) -> Vec<u8> {
    buf.clear();
    buf.put_u8(TAG_ADD);
    buf.put_u8(slot);
    buf.put_u32(supported);
    buf.put_u16(capabilities);
    buf.as_slice().to_vec()
}

/// Remove message on the controllers channel.
pub fn serialize_remove(buf: &mut ByteBuffer, slot: u8) -> Vec<u8> {
    buf.clear();
    buf.put_u8(TAG_REMOVE);
    buf.put_u8(slot);
    buf.as_slice().to_vec()
}

/// Apply the A/B and X/Y inversions from the controller config.
fn remap_buttons(buttons: u32, config: &ControllerConfig) -> u32 {
    let mut out = buttons;
    if config.invert_ab {
        out &= !(BTN_A | BTN_B);
        if buttons & BTN_A != 0 {
            out |= BTN_B;
        }
        if buttons & BTN_B != 0 {
            out |= BTN_A;
        }
    }
    if config.invert_xy {
        out &= !(BTN_X | BTN_Y);
        if buttons & BTN_X != 0 {
            out |= BTN_Y;
        }
        if buttons & BTN_Y != 0 {
            out |= BTN_X;
        }
    }
    out
}

/// Per-frame state message on the controllerN channel. Triggers scale to
/// u8::MAX, sticks to i16::MAX with Y inverted.
pub fn serialize_state(
    buf: &mut ByteBuffer,
    state: &ControllerState,
    config: &ControllerConfig,
) -> Vec<u8> {
    let scale_trigger = |value: f32| (value.clamp(0.0, 1.0) * 255.0) as u8;
    let scale_stick = |value: f32| (value.clamp(-1.0, 1.0) * 32767.0) as i16;

    buf.clear();
    buf.put_u8(TAG_STATE);
    buf.put_u32(remap_buttons(state.buttons, config));
    buf.put_u8(scale_trigger(state.left_trigger));
    buf.put_u8(scale_trigger(state.right_trigger));
    buf.put_i16(scale_stick(state.left_x));
    buf.put_i16(scale_stick(state.left_y).saturating_neg());
    buf.put_i16(scale_stick(state.right_x));
    buf.put_i16(scale_stick(state.right_y).saturating_neg());
    buf.as_slice().to_vec()
}

/// Parse a rumble ingress message from the controllers channel.
pub fn parse_rumble(data: &[u8]) -> Option<RumbleCommand> {
    if data.len() < 6 {
        return None;
    }
    let slot = data[1];
    let a = u16::from_be_bytes([data[2], data[3]]);
    let b = u16::from_be_bytes([data[4], data[5]]);
    match data[0] {
        0 => Some(RumbleCommand::Dual {
            slot,
            low: a,
            high: b,
        }),
        1 => Some(RumbleCommand::Trigger {
            slot,
            left: a,
            right: b,
        }),
        _ => None,
    }
}

#[derive(Default, Clone, Copy)]
struct RumbleState {
    low_frequency_motor: u16,
    high_frequency_motor: u16,
    left_trigger: u16,
    right_trigger: u16,
}

impl RumbleState {
    fn is_idle(&self) -> bool {
        self.low_frequency_motor == 0 && self.high_frequency_motor == 0
    }
}

struct Slot {
    gamepad_id: gilrs::GamepadId,
    rumble: RumbleState,
    effect: Option<gilrs::ff::Effect>,
}

/// Gamepad polling and rumble replay on a dedicated thread.
pub struct ControllerManager {
    running: Arc<AtomicBool>,
    config: Arc<Mutex<ControllerConfig>>,
    rumble_tx: Mutex<Option<mpsc::Sender<RumbleCommand>>>,
}

impl ControllerManager {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            config: Arc::new(Mutex::new(config)),
            rumble_tx: Mutex::new(None),
        }
    }

    pub fn set_config(&self, config: ControllerConfig) {
        *self.config.lock() = config;
    }

    /// Queue a rumble command for the polling thread.
    pub fn push_rumble(&self, command: RumbleCommand) {
        if let Some(tx) = self.rumble_tx.lock().as_ref() {
            let _ = tx.send(command);
        }
    }

    /// Start polling. `control` is the controllers channel; `per_slot`
    /// holds one channel per virtual controller ordinal.
    pub fn start(&self, control: DataChannel, per_slot: Vec<DataChannel>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let (rumble_tx, rumble_rx) = mpsc::channel();
        *self.rumble_tx.lock() = Some(rumble_tx);

        let running = self.running.clone();
        let config = self.config.clone();

        std::thread::spawn(move || {
            poll_loop(running, config, control, per_slot, rumble_rx);
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        *self.rumble_tx.lock() = None;
    }
}

impl Default for ControllerManager {
    fn default() -> Self {
        Self::new(ControllerConfig::default())
    }
}

fn poll_loop(
    running: Arc<AtomicBool>,
    config: Arc<Mutex<ControllerConfig>>,
    control: DataChannel,
    per_slot: Vec<DataChannel>,
    rumble_rx: mpsc::Receiver<RumbleCommand>,
) {
    let mut gilrs = match Gilrs::new() {
        Ok(gilrs) => gilrs,
        Err(err) => {
            warn!("gamepad support disabled: {err}");
            return;
        }
    };

    let mut buf = ByteBuffer::with_capacity(16);
    let mut slots: HashMap<u8, Slot> = HashMap::new();
    let mut last_rumble_replay = Instant::now();
    let mut last_state_send = Instant::now();

    // Pads connected before the session started.
    let initial: Vec<gilrs::GamepadId> = gilrs.gamepads().map(|(id, _)| id).collect();
    for id in initial {
        attach_gamepad(&mut gilrs, id, &mut slots, &control, &per_slot, &mut buf);
    }

    while running.load(Ordering::Relaxed) {
        while let Some(Event { id, event, .. }) = gilrs.next_event() {
            match event {
                EventType::Connected => {
                    attach_gamepad(&mut gilrs, id, &mut slots, &control, &per_slot, &mut buf)
                }
                EventType::Disconnected => {
                    if let Some(slot) = slots
                        .iter()
                        .find(|(_, s)| s.gamepad_id == id)
                        .map(|(slot, _)| *slot)
                    {
                        info!("gamepad detached from slot {slot}");
                        slots.remove(&slot);
                        control.send(&serialize_remove(&mut buf, slot));
                    }
                }
                _ => {}
            }
        }

        // Server-pushed rumble updates the stored per-slot state.
        while let Ok(command) = rumble_rx.try_recv() {
            if let Some(slot) = slots.get_mut(&command.slot()) {
                match command {
                    RumbleCommand::Dual { low, high, .. } => {
                        slot.rumble.low_frequency_motor = low;
                        slot.rumble.high_frequency_motor = high;
                    }
                    RumbleCommand::Trigger { left, right, .. } => {
                        slot.rumble.left_trigger = left;
                        slot.rumble.right_trigger = right;
                    }
                }
            }
        }

        // Replay stored rumble so sustained effects overlap.
        if last_rumble_replay.elapsed() >= RUMBLE_REPLAY_INTERVAL {
            last_rumble_replay = Instant::now();
            for slot in slots.values_mut() {
                slot.effect = if slot.rumble.is_idle() {
                    None
                } else {
                    play_rumble(&mut gilrs, slot)
                };
            }
        }

        let send_interval = Duration::from_millis(config.lock().send_interval_ms.max(1));
        if last_state_send.elapsed() >= send_interval {
            last_state_send = Instant::now();
            let config = *config.lock();
            for (slot_id, slot) in &slots {
                let Some(channel) = per_slot.get(*slot_id as usize) else {
                    continue;
                };
                let state = read_state(&gilrs, slot.gamepad_id);
                channel.send(&serialize_state(&mut buf, &state, &config));
            }
        }

        std::thread::sleep(Duration::from_millis(1));
    }

    info!("gamepad polling stopped");
}

fn attach_gamepad(
    gilrs: &mut Gilrs,
    id: gilrs::GamepadId,
    slots: &mut HashMap<u8, Slot>,
    control: &DataChannel,
    per_slot: &[DataChannel],
    buf: &mut ByteBuffer,
) {
    if slots.values().any(|s| s.gamepad_id == id) {
        return;
    }
    let Some(slot) = (0..per_slot.len() as u8).find(|slot| !slots.contains_key(slot)) else {
        warn!("no free controller slot for new gamepad");
        return;
    };

    let gamepad = gilrs.gamepad(id);
    let mut capabilities = 0u16;
    if gamepad.is_ff_supported() {
        capabilities |= CAP_RUMBLE;
    }

    info!("gamepad '{}' attached to slot {slot}", gamepad.name());
    slots.insert(
        slot,
        Slot {
            gamepad_id: id,
            rumble: RumbleState::default(),
            effect: None,
        },
    );
    control.send(&serialize_add(buf, slot, SUPPORTED_BUTTONS, capabilities));
}

fn apply_deadzone(value: f32) -> f32 {
    if value.abs() < STICK_DEADZONE {
        0.0
    } else {
        value.signum() * (value.abs() - STICK_DEADZONE) / (1.0 - STICK_DEADZONE)
    }
}

fn read_state(gilrs: &Gilrs, id: gilrs::GamepadId) -> ControllerState {
    let gamepad = gilrs.gamepad(id);

    let mut buttons = 0u32;
    let mut press = |button: Button, bit: u32| {
        if gamepad.is_pressed(button) {
            buttons |= bit;
        }
    };
    press(Button::DPadUp, BTN_DPAD_UP);
    press(Button::DPadDown, BTN_DPAD_DOWN);
    press(Button::DPadLeft, BTN_DPAD_LEFT);
    press(Button::DPadRight, BTN_DPAD_RIGHT);
    press(Button::Start, BTN_START);
    press(Button::Select, BTN_BACK);
    press(Button::LeftThumb, BTN_LEFT_STICK);
    press(Button::RightThumb, BTN_RIGHT_STICK);
    // gilrs names the digital bumpers LeftTrigger/RightTrigger.
    press(Button::LeftTrigger, BTN_LEFT_BUMPER);
    press(Button::RightTrigger, BTN_RIGHT_BUMPER);
    press(Button::South, BTN_A);
    press(Button::East, BTN_B);
    press(Button::West, BTN_X);
    press(Button::North, BTN_Y);

    // Analog triggers live on the Z axes; some pads only expose the
    // digital Trigger2 buttons.
    let trigger = |axis: Axis, button: Button| {
        let value = gamepad.value(axis);
        if value.abs() < 0.01 && gamepad.is_pressed(button) {
            1.0
        } else if value < 0.0 {
            (value + 1.0) / 2.0
        } else {
            value
        }
    };

    ControllerState {
        buttons,
        left_trigger: trigger(Axis::LeftZ, Button::LeftTrigger2),
        right_trigger: trigger(Axis::RightZ, Button::RightTrigger2),
        left_x: apply_deadzone(gamepad.value(Axis::LeftStickX)),
        left_y: apply_deadzone(gamepad.value(Axis::LeftStickY)),
        right_x: apply_deadzone(gamepad.value(Axis::RightStickX)),
        right_y: apply_deadzone(gamepad.value(Axis::RightStickY)),
    }
}

/// Play one 60 ms dual-rumble effect from the stored state.
fn play_rumble(gilrs: &mut Gilrs, slot: &mut Slot) -> Option<gilrs::ff::Effect> {
    let replay = Replay {
        after: Ticks::from_ms(0),
        play_for: Ticks::from_ms(RUMBLE_EFFECT_MS),
        with_delay: Ticks::from_ms(0),
    };

    let effect = EffectBuilder::new()
        .add_effect(BaseEffect {
            kind: BaseEffectType::Strong {
                magnitude: slot.rumble.low_frequency_motor,
            },
            scheduling: replay,
            ..Default::default()
        })
        .add_effect(BaseEffect {
            kind: BaseEffectType::Weak {
                magnitude: slot.rumble.high_frequency_motor,
            },
            scheduling: replay,
            ..Default::default()
        })
        .gamepads(&[slot.gamepad_id])
        .finish(gilrs)
        .ok()?;

    match effect.play() {
        Ok(()) => {
            debug!(
                "rumble: low={} high={}",
                slot.rumble.low_frequency_motor, slot.rumble.high_frequency_motor
            );
            Some(effect)
        }
        Err(err) => {
            trace!("rumble play failed: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove_layouts() {
        let mut buf = ByteBuffer::new();
        let frame = serialize_add(&mut buf, 1, SUPPORTED_BUTTONS, CAP_RUMBLE);
        assert_eq!(frame[0], 0);
        assert_eq!(frame[1], 1);
        assert_eq!(
            u32::from_be_bytes(frame[2..6].try_into().unwrap()),
            SUPPORTED_BUTTONS
        );
        assert_eq!(u16::from_be_bytes(frame[6..8].try_into().unwrap()), CAP_RUMBLE);

        assert_eq!(serialize_remove(&mut buf, 2), vec![1, 2]);
    }

    #[test]
    fn state_scaling_and_y_inversion() {
        let mut buf = ByteBuffer::new();
        let state = ControllerState {
            buttons: BTN_A | BTN_DPAD_UP,
            left_trigger: 1.0,
            right_trigger: 0.5,
            left_x: 1.0,
            left_y: 1.0,
            right_x: -1.0,
            right_y: -0.5,
        };
        let frame = serialize_state(&mut buf, &state, &ControllerConfig::default());

        assert_eq!(frame[0], 0);
        assert_eq!(
            u32::from_be_bytes(frame[1..5].try_into().unwrap()),
            BTN_A | BTN_DPAD_UP
        );
        assert_eq!(frame[5], 255);
        assert_eq!(frame[6], 127);
        assert_eq!(i16::from_be_bytes(frame[7..9].try_into().unwrap()), 32767);
        // Y axes inverted.
        assert_eq!(i16::from_be_bytes(frame[9..11].try_into().unwrap()), -32767);
        assert_eq!(i16::from_be_bytes(frame[11..13].try_into().unwrap()), -32767);
        assert_eq!(i16::from_be_bytes(frame[13..15].try_into().unwrap()), 16383);
    }

    #[test]
    fn invert_ab_swaps_face_buttons() {
        let config = ControllerConfig {
            invert_ab: true,
            ..Default::default()
        };
        assert_eq!(remap_buttons(BTN_A, &config), BTN_B);
        assert_eq!(remap_buttons(BTN_B, &config), BTN_A);
        assert_eq!(remap_buttons(BTN_A | BTN_B, &config), BTN_A | BTN_B);
        assert_eq!(remap_buttons(BTN_X, &config), BTN_X);
    }

    #[test]
    fn invert_xy_swaps_face_buttons() {
        let config = ControllerConfig {
            invert_xy: true,
            ..Default::default()
        };
        assert_eq!(remap_buttons(BTN_X, &config), BTN_Y);
        assert_eq!(remap_buttons(BTN_Y | BTN_A, &config), BTN_X | BTN_A);
    }

    #[test]
    fn rumble_parsing() {
        // Dual rumble: low 0x8000, high 0xC000 for slot 0.
        let parsed = parse_rumble(&[0, 0, 0x80, 0x00, 0xC0, 0x00]).unwrap();
        assert_eq!(
            parsed,
            RumbleCommand::Dual {
                slot: 0,
                low: 0x8000,
                high: 0xC000
            }
        );

        let parsed = parse_rumble(&[1, 2, 0x00, 0x10, 0x00, 0x20]).unwrap();
        assert_eq!(
            parsed,
            RumbleCommand::Trigger {
                slot: 2,
                left: 0x10,
                right: 0x20
            }
        );

        assert_eq!(parse_rumble(&[0, 0, 1]), None);
        assert_eq!(parse_rumble(&[9, 0, 0, 0, 0, 0]), None);
    }

    #[test]
    fn deadzone_rescales() {
        assert_eq!(apply_deadzone(0.1), 0.0);
        assert_eq!(apply_deadzone(-0.1), 0.0);
        assert!(apply_deadzone(1.0) > 0.999);
        assert!((apply_deadzone(0.575) - 0.5).abs() < 0.01);
    }
}
