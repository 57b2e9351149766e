//! Input Subsystem
//!
//! Translates local human-interface events into the server's compact
//! binary protocol. Every message is assembled in a pre-allocated
//! `ByteBuffer` and dispatched to its logical channel; input is enabled
//! only once the session reaches ConnectionComplete.

pub mod controller;
pub mod keyboard;
pub mod mouse;
pub mod touch;

pub use controller::{ControllerConfig, ControllerManager, RumbleCommand};
pub use mouse::MouseMode;
pub use touch::{TouchInput, TouchMode, TouchOutput, TouchPoint, Viewport};

use log::debug;

use crate::transport::DataChannel;
use crate::utils::ByteBuffer;

use keyboard::{virtual_key, MOD_ALT, MOD_CTRL, MOD_META, MOD_SHIFT};
use mouse::MouseInput;

/// Channels the manager writes to, handed over when the session streams.
pub struct InputChannels {
    pub keyboard: DataChannel,
    pub mouse: DataChannel,
    pub touch: DataChannel,
}

/// Feedback for the embedder (events that are not wire messages).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFeedback {
    ShowScreenKeyboard,
    HideScreenKeyboard,
}

/// Keyboard, mouse and touch translation front-end.
pub struct InputManager {
    buf: ByteBuffer,
    mouse: MouseInput,
    touch: TouchInput,
    modifiers: u8,
    channels: Option<InputChannels>,
}

impl InputManager {
    pub fn new(mouse_mode: MouseMode, touch_mode: TouchMode) -> Self {
        Self {
            buf: ByteBuffer::with_capacity(64),
            mouse: MouseInput::new(mouse_mode),
            touch: TouchInput::new(touch_mode, false),
            modifiers: 0,
            channels: None,
        }
    }

    /// Enable dispatch once the session is streaming.
    pub fn enable(&mut self, channels: InputChannels, server_touch: bool) {
        self.touch.set_server_touch(server_touch);
        self.channels = Some(channels);
        debug!("input channels enabled (server touch: {server_touch})");
    }

    pub fn disable(&mut self) {
        self.channels = None;
        self.modifiers = 0;
    }

    pub fn is_enabled(&self) -> bool {
        self.channels.is_some()
    }

    pub fn set_mouse_mode(&mut self, mode: MouseMode) {
        self.mouse.set_mode(mode);
    }

    pub fn set_touch_mode(&mut self, mode: TouchMode) {
        self.touch.set_mode(mode);
    }

    fn update_modifiers(&mut self, code: &str, down: bool) {
        let bit = match code {
            "ShiftLeft" | "ShiftRight" => MOD_SHIFT,
            "ControlLeft" | "ControlRight" => MOD_CTRL,
            "AltLeft" | "AltRight" => MOD_ALT,
            "MetaLeft" | "MetaRight" => MOD_META,
            _ => return,
        };
        if down {
            self.modifiers |= bit;
        } else {
            self.modifiers &= !bit;
        }
    }

    /// Key transition by physical code. Unmapped codes are dropped.
    pub fn on_key(&mut self, code: &str, down: bool) {
        self.update_modifiers(code, down);

        let Some(channels) = &self.channels else {
            return;
        };
        let Some(key_code) = virtual_key(code) else {
            return;
        };
        let frame = keyboard::serialize_key(&mut self.buf, down, self.modifiers, key_code);
        channels.keyboard.send(&frame);
    }

    /// Inject composed text.
    pub fn on_text(&mut self, text: &str) {
        let Some(channels) = &self.channels else {
            return;
        };
        if text.is_empty() {
            return;
        }
        let frame = keyboard::serialize_text(&mut self.buf, text);
        channels.keyboard.send(&frame);
    }

    /// Pointer movement: deltas in client pixels plus the normalized
    /// position within the viewport.
    pub fn on_mouse_move(&mut self, dx: i16, dy: i16, nx: f32, ny: f32) {
        let Some(channels) = &self.channels else {
            return;
        };
        for frame in self.mouse.on_move(dx, dy, nx, ny) {
            channels.mouse.send(&frame);
        }
    }

    pub fn on_mouse_button(&mut self, down: bool, button: u8, nx: f32, ny: f32) {
        let Some(channels) = &self.channels else {
            return;
        };
        for frame in self.mouse.on_button(down, button, nx, ny) {
            channels.mouse.send(&frame);
        }
    }

    pub fn on_mouse_wheel(&mut self, delta_x: i16, delta_y: i16) {
        let Some(channels) = &self.channels else {
            return;
        };
        for frame in self.mouse.on_wheel(delta_x, delta_y) {
            channels.mouse.send(&frame);
        }
    }

    /// Touch lifecycle; returns feedback events for the embedder.
    pub fn on_touch_start(
        &mut self,
        viewport: &Viewport,
        point: &TouchPoint,
        now_ms: u64,
    ) -> Vec<InputFeedback> {
        let outputs = self.touch.on_start(viewport, point, now_ms);
        self.route_touch(outputs)
    }

    pub fn on_touch_move(
        &mut self,
        viewport: &Viewport,
        point: &TouchPoint,
        now_ms: u64,
    ) -> Vec<InputFeedback> {
        let outputs = self.touch.on_move(viewport, point, now_ms);
        self.route_touch(outputs)
    }

    pub fn on_touch_end(
        &mut self,
        viewport: &Viewport,
        point: &TouchPoint,
        now_ms: u64,
    ) -> Vec<InputFeedback> {
        let outputs = self.touch.on_end(viewport, point, now_ms);
        self.route_touch(outputs)
    }

    pub fn on_touch_cancel(&mut self, point_id: u32) {
        let outputs = self.touch.on_cancel(point_id);
        self.route_touch(outputs);
    }

    fn route_touch(&mut self, outputs: Vec<TouchOutput>) -> Vec<InputFeedback> {
        let mut feedback = Vec::new();
        let Some(channels) = &self.channels else {
            return feedback;
        };
        for output in outputs {
            match output {
                TouchOutput::Touch(frame) => channels.touch.send(&frame),
                TouchOutput::Mouse(frame) => channels.mouse.send(&frame),
                TouchOutput::ShowKeyboard => feedback.push(InputFeedback::ShowScreenKeyboard),
                TouchOutput::HideKeyboard => feedback.push(InputFeedback::HideScreenKeyboard),
            }
        }
        feedback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelId;

    fn manager_with_channels() -> (
        InputManager,
        tokio::sync::mpsc::UnboundedReceiver<bytes::Bytes>,
    ) {
        let (keyboard, kb_out) = DataChannel::new(ChannelId::Keyboard);
        let (mouse, _mouse_out) = DataChannel::new(ChannelId::Mouse);
        let (touch, _touch_out) = DataChannel::new(ChannelId::Touch);

        let mut manager = InputManager::new(MouseMode::Relative, TouchMode::MouseRelative);
        manager.enable(
            InputChannels {
                keyboard,
                mouse,
                touch,
            },
            false,
        );
        (manager, kb_out.rx)
    }

    #[test]
    fn disabled_manager_drops_everything() {
        let mut manager = InputManager::new(MouseMode::Relative, TouchMode::MouseRelative);
        manager.on_key("KeyA", true);
        manager.on_mouse_move(1, 1, 0.5, 0.5);
        assert!(!manager.is_enabled());
    }

    #[test]
    fn key_events_carry_modifier_state() {
        let (mut manager, mut rx) = manager_with_channels();

        manager.on_key("ShiftLeft", true);
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame[1], 1); // down
        assert_eq!(frame[2], keyboard::MOD_SHIFT);

        manager.on_key("KeyA", true);
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame[2], keyboard::MOD_SHIFT);
        assert_eq!(&frame[3..5], &[0x00, 0x41]);

        manager.on_key("ShiftLeft", false);
        rx.try_recv().unwrap();
        manager.on_key("KeyA", false);
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame[2], 0);
    }

    #[test]
    fn unmapped_keys_dropped_silently() {
        let (mut manager, mut rx) = manager_with_channels();
        manager.on_key("MediaSelect", true);
        assert!(rx.try_recv().is_err());
    }
}
