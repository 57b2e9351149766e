//! Mouse Input
//!
//! The three pointer modes and the binary mouse messages. Absolute
//! positions are normalized to a 4096x4096 reference surface.

use crate::utils::ByteBuffer;

pub const BUTTON_LEFT: u8 = 0;
pub const BUTTON_MIDDLE: u8 = 1;
pub const BUTTON_RIGHT: u8 = 2;

/// Absolute-position reference surface.
pub const REFERENCE_SIZE: i16 = 4096;

const TAG_MOVE_RELATIVE: u8 = 0;
const TAG_POSITION_ABSOLUTE: u8 = 1;
const TAG_BUTTON: u8 = 2;
const TAG_WHEEL: u8 = 3;

/// Pointer translation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MouseMode {
    /// Movement deltas only.
    #[default]
    Relative,
    /// Absolute position on every move.
    Follow,
    /// Absolute position on button-down, deltas while any button is held.
    PointAndDrag,
}

/// Tag 0: relative movement.
pub fn serialize_move(buf: &mut ByteBuffer, dx: i16, dy: i16) -> Vec<u8> {
    buf.clear();
    buf.put_u8(TAG_MOVE_RELATIVE);
    buf.put_i16(dx);
    buf.put_i16(dy);
    buf.as_slice().to_vec()
}

/// Tag 1: absolute position against a reference surface.
pub fn serialize_position(buf: &mut ByteBuffer, x: i16, y: i16, ref_w: i16, ref_h: i16) -> Vec<u8> {
    buf.clear();
    buf.put_u8(TAG_POSITION_ABSOLUTE);
    buf.put_i16(x);
    buf.put_i16(y);
    buf.put_i16(ref_w);
    buf.put_i16(ref_h);
    buf.as_slice().to_vec()
}

/// Tag 2: button transition.
pub fn serialize_button(buf: &mut ByteBuffer, is_down: bool, button: u8) -> Vec<u8> {
    buf.clear();
    buf.put_u8(TAG_BUTTON);
    buf.put_u8(is_down as u8);
    buf.put_u8(button);
    buf.as_slice().to_vec()
}

/// Tag 3: wheel. Vertical is negated at source so positive scrolls up.
pub fn serialize_wheel(buf: &mut ByteBuffer, delta_x: i16, delta_y: i16) -> Vec<u8> {
    buf.clear();
    buf.put_u8(TAG_WHEEL);
    buf.put_i16(delta_x);
    buf.put_i16(delta_y.saturating_neg());
    buf.as_slice().to_vec()
}

/// Scale a normalized [0,1] coordinate onto the reference surface.
pub fn to_reference(normalized: f32) -> i16 {
    (normalized.clamp(0.0, 1.0) * REFERENCE_SIZE as f32) as i16
}

/// Mode-dependent pointer state machine. Produces ready-to-send frames.
pub struct MouseInput {
    mode: MouseMode,
    buttons_held: u8,
    buf: ByteBuffer,
}

impl MouseInput {
    pub fn new(mode: MouseMode) -> Self {
        Self {
            mode,
            buttons_held: 0,
            buf: ByteBuffer::with_capacity(16),
        }
    }

    pub fn mode(&self) -> MouseMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: MouseMode) {
        self.mode = mode;
        self.buttons_held = 0;
    }

    /// Pointer movement: `(dx, dy)` in client pixels, `(nx, ny)` normalized
    /// against the viewport.
    pub fn on_move(&mut self, dx: i16, dy: i16, nx: f32, ny: f32) -> Vec<Vec<u8>> {
        match self.mode {
            MouseMode::Relative => vec![serialize_move(&mut self.buf, dx, dy)],
            MouseMode::Follow => vec![serialize_position(
                &mut self.buf,
                to_reference(nx),
                to_reference(ny),
                REFERENCE_SIZE,
                REFERENCE_SIZE,
            )],
            MouseMode::PointAndDrag => {
                if self.buttons_held != 0 {
                    vec![serialize_move(&mut self.buf, dx, dy)]
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Button transition at a normalized position.
    pub fn on_button(&mut self, is_down: bool, button: u8, nx: f32, ny: f32) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();

        // Point-and-drag pins the cursor on the press position first.
        if is_down && self.mode == MouseMode::PointAndDrag {
            frames.push(serialize_position(
                &mut self.buf,
                to_reference(nx),
                to_reference(ny),
                REFERENCE_SIZE,
                REFERENCE_SIZE,
            ));
        }

        let bit = 1u8 << (button & 0x07);
        if is_down {
            self.buttons_held |= bit;
        } else {
            self.buttons_held &= !bit;
        }

        frames.push(serialize_button(&mut self.buf, is_down, button));
        frames
    }

    /// Wheel deltas in source orientation (positive `delta_y` = scroll down).
    pub fn on_wheel(&mut self, delta_x: i16, delta_y: i16) -> Vec<Vec<u8>> {
        vec![serialize_wheel(&mut self.buf, delta_x, delta_y)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_layouts() {
        let mut buf = ByteBuffer::new();
        assert_eq!(
            serialize_move(&mut buf, -2, 3),
            vec![0, 0xFF, 0xFE, 0x00, 0x03]
        );
        assert_eq!(
            serialize_position(&mut buf, 819, 819, 4096, 4096),
            vec![1, 0x03, 0x33, 0x03, 0x33, 0x10, 0x00, 0x10, 0x00]
        );
        assert_eq!(serialize_button(&mut buf, true, BUTTON_RIGHT), vec![2, 1, 2]);
    }

    #[test]
    fn wheel_vertical_negated() {
        let mut buf = ByteBuffer::new();
        // Scroll down (positive delta) goes out negative.
        assert_eq!(serialize_wheel(&mut buf, 0, 120), vec![3, 0, 0, 0xFF, 0x88]);
    }

    #[test]
    fn relative_mode_sends_deltas() {
        let mut mouse = MouseInput::new(MouseMode::Relative);
        let frames = mouse.on_move(5, -5, 0.5, 0.5);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][0], TAG_MOVE_RELATIVE);
    }

    #[test]
    fn follow_mode_sends_scaled_absolute() {
        let mut mouse = MouseInput::new(MouseMode::Follow);
        let frames = mouse.on_move(5, -5, 0.25, 0.75);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][0], TAG_POSITION_ABSOLUTE);
        let x = i16::from_be_bytes([frames[0][1], frames[0][2]]);
        let y = i16::from_be_bytes([frames[0][3], frames[0][4]]);
        assert_eq!((x, y), (1024, 3072));
    }

    #[test]
    fn point_and_drag_gates_moves_on_held_button() {
        let mut mouse = MouseInput::new(MouseMode::PointAndDrag);
        assert!(mouse.on_move(1, 1, 0.1, 0.1).is_empty());

        let frames = mouse.on_button(true, BUTTON_LEFT, 0.5, 0.5);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0][0], TAG_POSITION_ABSOLUTE);
        assert_eq!(frames[1][0], TAG_BUTTON);

        assert_eq!(mouse.on_move(1, 1, 0.6, 0.6).len(), 1);

        let frames = mouse.on_button(false, BUTTON_LEFT, 0.6, 0.6);
        assert_eq!(frames.len(), 1);
        assert!(mouse.on_move(1, 1, 0.7, 0.7).is_empty());
    }
}
