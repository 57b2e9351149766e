//! Touch Input
//!
//! Per-identifier touch tracking, the three touch modes and the gesture
//! overrides (two-finger scroll, three-finger screen keyboard). Pointer
//! modes synthesize mouse messages; raw mode forwards touch frames when
//! the server advertises the touch capability.

use std::collections::HashMap;

use crate::utils::ByteBuffer;

use super::mouse::{
    serialize_button, serialize_move, serialize_position, serialize_wheel, to_reference,
    BUTTON_LEFT, BUTTON_RIGHT, REFERENCE_SIZE,
};

/// Click recognition thresholds.
pub const CLICK_DISTANCE_PX: f32 = 30.0;
pub const CLICK_MIN_MS: u64 = 100;
pub const CLICK_MAX_MS: u64 = 300;
/// Vertical travel of the three-finger keyboard gesture.
pub const KEYBOARD_GESTURE_PX: f32 = 100.0;

const TAG_START: u8 = 0;
const TAG_MOVE: u8 = 1;
const TAG_END: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TouchMode {
    /// Forward raw touches when the server supports them.
    Touch,
    /// First touch steers a relative mouse.
    #[default]
    MouseRelative,
    /// Tap-to-position with drag.
    PointAndDrag,
}

/// The embedding element's client rectangle.
#[derive(Debug, Clone, Copy)]
pub struct Viewport {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl Viewport {
    /// Normalize a client coordinate; `None` when outside the rect.
    pub fn normalize(&self, x: f32, y: f32) -> Option<(f32, f32)> {
        if self.width <= 0.0 || self.height <= 0.0 {
            return None;
        }
        let nx = (x - self.left) / self.width;
        let ny = (y - self.top) / self.height;
        if (0.0..=1.0).contains(&nx) && (0.0..=1.0).contains(&ny) {
            Some((nx, ny))
        } else {
            None
        }
    }
}

/// One contact as reported by the environment.
#[derive(Debug, Clone, Copy)]
pub struct TouchPoint {
    pub id: u32,
    pub client_x: f32,
    pub client_y: f32,
    pub force: f32,
    pub radius_x: f32,
    pub radius_y: f32,
    pub rotation: u16,
}

/// Per-identifier contact record.
#[derive(Debug, Clone)]
struct TouchTrack {
    start_ms: u64,
    origin_x: f32,
    origin_y: f32,
    current_x: f32,
    current_y: f32,
    mouse_clicked: bool,
    mouse_moved: bool,
}

impl TouchTrack {
    fn travel(&self) -> f32 {
        let dx = self.current_x - self.origin_x;
        let dy = self.current_y - self.origin_y;
        (dx * dx + dy * dy).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gesture {
    None,
    /// Two fingers: wheel scrolling.
    Scroll,
    /// Three fingers: screen keyboard show/hide.
    Keyboard { fired: bool },
}

/// Output of the touch recognizer, routed by the input manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TouchOutput {
    /// Raw frame for the touch channel.
    Touch(Vec<u8>),
    /// Synthesized frame for the mouse channel.
    Mouse(Vec<u8>),
    ShowKeyboard,
    HideKeyboard,
}

/// Touch state machine.
pub struct TouchInput {
    mode: TouchMode,
    server_touch: bool,
    tracks: HashMap<u32, TouchTrack>,
    primary: Option<u32>,
    gesture: Gesture,
    buf: ByteBuffer,
}

impl TouchInput {
    pub fn new(mode: TouchMode, server_touch: bool) -> Self {
        Self {
            mode,
            server_touch,
            tracks: HashMap::new(),
            primary: None,
            gesture: Gesture::None,
            buf: ByteBuffer::with_capacity(32),
        }
    }

    pub fn set_mode(&mut self, mode: TouchMode) {
        self.mode = mode;
    }

    pub fn set_server_touch(&mut self, server_touch: bool) {
        self.server_touch = server_touch;
    }

    /// Raw forwarding applies only when the server can take touches;
    /// otherwise the mode degrades to mouse emulation.
    fn raw_mode(&self) -> bool {
        self.mode == TouchMode::Touch && self.server_touch
    }

    fn serialize_touch(&mut self, tag: u8, point: &TouchPoint, nx: f32, ny: f32) -> Vec<u8> {
        self.buf.clear();
        self.buf.put_u8(tag);
        self.buf.put_u32(point.id);
        self.buf.put_f32(nx);
        self.buf.put_f32(ny);
        self.buf.put_f32(point.force);
        self.buf.put_f32(point.radius_x);
        self.buf.put_f32(point.radius_y);
        self.buf.put_u16(point.rotation);
        self.buf.as_slice().to_vec()
    }

    /// Re-derive the gesture after a membership change.
    fn refresh_gesture(&mut self) {
        let count = self.tracks.len();
        let primary_engaged = self
            .primary
            .and_then(|id| self.tracks.get(&id))
            .map(|t| t.mouse_clicked)
            .unwrap_or(false);

        self.gesture = match count {
            3 => match self.gesture {
                Gesture::Keyboard { fired } => Gesture::Keyboard { fired },
                _ => Gesture::Keyboard { fired: false },
            },
            2 if !primary_engaged => Gesture::Scroll,
            _ => Gesture::None,
        };

        // A gesture claims the primary contact: its release must not click.
        if self.gesture != Gesture::None {
            if let Some(track) = self.primary.and_then(|id| self.tracks.get_mut(&id)) {
                track.mouse_moved = true;
            }
        }
    }

    pub fn on_start(&mut self, vp: &Viewport, point: &TouchPoint, now_ms: u64) -> Vec<TouchOutput> {
        let Some((nx, ny)) = vp.normalize(point.client_x, point.client_y) else {
            return Vec::new();
        };

        self.tracks.insert(
            point.id,
            TouchTrack {
                start_ms: now_ms,
                origin_x: point.client_x,
                origin_y: point.client_y,
                current_x: point.client_x,
                current_y: point.client_y,
                mouse_clicked: false,
                mouse_moved: false,
            },
        );

        if self.raw_mode() {
            return vec![TouchOutput::Touch(self.serialize_touch(TAG_START, point, nx, ny))];
        }

        if self.primary.is_none() {
            self.primary = Some(point.id);
        }
        self.refresh_gesture();
        Vec::new()
    }

    pub fn on_move(&mut self, vp: &Viewport, point: &TouchPoint, _now_ms: u64) -> Vec<TouchOutput> {
        let Some(track) = self.tracks.get_mut(&point.id) else {
            return Vec::new();
        };
        let prev_x = track.current_x;
        let prev_y = track.current_y;
        track.current_x = point.client_x;
        track.current_y = point.client_y;

        let Some((nx, ny)) = vp.normalize(point.client_x, point.client_y) else {
            return Vec::new();
        };

        if self.raw_mode() {
            return vec![TouchOutput::Touch(self.serialize_touch(TAG_MOVE, point, nx, ny))];
        }

        if self.primary != Some(point.id) {
            return Vec::new();
        }

        let dx = (point.client_x - prev_x) as i16;
        let dy = (point.client_y - prev_y) as i16;

        match self.gesture {
            Gesture::Scroll => {
                // Wheel from finger motion, horizontal inverted.
                vec![TouchOutput::Mouse(serialize_wheel(
                    &mut self.buf,
                    dx.saturating_neg(),
                    dy,
                ))]
            }
            Gesture::Keyboard { fired } => {
                if fired {
                    return Vec::new();
                }
                let total_dy = point.client_y
                    - self.tracks.get(&point.id).map(|t| t.origin_y).unwrap_or(0.0);
                if total_dy <= -KEYBOARD_GESTURE_PX {
                    self.gesture = Gesture::Keyboard { fired: true };
                    vec![TouchOutput::ShowKeyboard]
                } else if total_dy >= KEYBOARD_GESTURE_PX {
                    self.gesture = Gesture::Keyboard { fired: true };
                    vec![TouchOutput::HideKeyboard]
                } else {
                    Vec::new()
                }
            }
            Gesture::None => match self.mode {
                TouchMode::PointAndDrag => {
                    let Some(track) = self.tracks.get_mut(&point.id) else {
                        return Vec::new();
                    };
                    if track.mouse_clicked {
                        track.mouse_moved = true;
                        return vec![TouchOutput::Mouse(serialize_move(&mut self.buf, dx, dy))];
                    }
                    if track.travel() > CLICK_DISTANCE_PX {
                        // Drag engages: pin the cursor at the press origin,
                        // then hold the button for the rest of the contact.
                        track.mouse_clicked = true;
                        track.mouse_moved = true;
                        let (ox, oy) = (track.origin_x, track.origin_y);
                        let Some((onx, ony)) = vp.normalize(ox, oy) else {
                            return Vec::new();
                        };
                        vec![
                            TouchOutput::Mouse(serialize_position(
                                &mut self.buf,
                                to_reference(onx),
                                to_reference(ony),
                                REFERENCE_SIZE,
                                REFERENCE_SIZE,
                            )),
                            TouchOutput::Mouse(serialize_button(&mut self.buf, true, BUTTON_LEFT)),
                        ]
                    } else {
                        Vec::new()
                    }
                }
                _ => {
                    let Some(track) = self.tracks.get_mut(&point.id) else {
                        return Vec::new();
                    };
                    if track.travel() > CLICK_DISTANCE_PX {
                        track.mouse_moved = true;
                    }
                    vec![TouchOutput::Mouse(serialize_move(&mut self.buf, dx, dy))]
                }
            },
        }
    }

    pub fn on_end(&mut self, vp: &Viewport, point: &TouchPoint, now_ms: u64) -> Vec<TouchOutput> {
        let Some(track) = self.tracks.remove(&point.id) else {
            return Vec::new();
        };

        if self.raw_mode() {
            let outputs = vp
                .normalize(point.client_x, point.client_y)
                .map(|(nx, ny)| {
                    vec![TouchOutput::Touch(self.serialize_touch(TAG_END, point, nx, ny))]
                })
                .unwrap_or_default();
            return outputs;
        }

        let mut outputs = Vec::new();
        if self.primary == Some(point.id) {
            self.primary = None;

            if track.mouse_clicked {
                // Ongoing drag: release the held button.
                outputs.push(TouchOutput::Mouse(serialize_button(
                    &mut self.buf,
                    false,
                    BUTTON_LEFT,
                )));
            } else if !track.mouse_moved && track.travel() <= CLICK_DISTANCE_PX {
                let duration = now_ms.saturating_sub(track.start_ms);
                let button = if (CLICK_MIN_MS..=CLICK_MAX_MS).contains(&duration) {
                    Some(BUTTON_LEFT)
                } else if duration > CLICK_MAX_MS {
                    Some(BUTTON_RIGHT)
                } else {
                    None
                };

                if let Some(button) = button {
                    if self.mode == TouchMode::PointAndDrag {
                        // Taps position the cursor where the contact began.
                        if let Some((onx, ony)) = vp.normalize(track.origin_x, track.origin_y) {
                            outputs.push(TouchOutput::Mouse(serialize_position(
                                &mut self.buf,
                                to_reference(onx),
                                to_reference(ony),
                                REFERENCE_SIZE,
                                REFERENCE_SIZE,
                            )));
                        }
                    }
                    outputs.push(TouchOutput::Mouse(serialize_button(&mut self.buf, true, button)));
                    outputs.push(TouchOutput::Mouse(serialize_button(&mut self.buf, false, button)));
                }
            }
        }

        self.refresh_gesture();
        outputs
    }

    /// Cancelled contacts never produce clicks.
    pub fn on_cancel(&mut self, point_id: u32) -> Vec<TouchOutput> {
        if self.tracks.remove(&point_id).is_some() {
            if self.primary == Some(point_id) {
                self.primary = None;
            }
            self.refresh_gesture();
        }
        Vec::new()
    }

    pub fn active_touches(&self) -> usize {
        self.tracks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vp() -> Viewport {
        Viewport {
            left: 0.0,
            top: 0.0,
            width: 500.0,
            height: 500.0,
        }
    }

    fn point(id: u32, x: f32, y: f32) -> TouchPoint {
        TouchPoint {
            id,
            client_x: x,
            client_y: y,
            force: 0.5,
            radius_x: 1.0,
            radius_y: 1.0,
            rotation: 0,
        }
    }

    fn mouse_frames(outputs: &[TouchOutput]) -> Vec<&Vec<u8>> {
        outputs
            .iter()
            .filter_map(|o| match o {
                TouchOutput::Mouse(frame) => Some(frame),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn tap_emits_position_then_left_click() {
        // Scenario: touchstart (100,100), touchend (102,101) after 120 ms,
        // pointAndDrag, rect (0,0,500,500).
        let mut touch = TouchInput::new(TouchMode::PointAndDrag, false);
        assert!(touch.on_start(&vp(), &point(7, 100.0, 100.0), 1_000).is_empty());
        let outputs = touch.on_end(&vp(), &point(7, 102.0, 101.0), 1_120);

        let frames = mouse_frames(&outputs);
        assert_eq!(frames.len(), 3);
        // Absolute position at the press origin: 100/500 * 4096 = 819.
        assert_eq!(frames[0], &vec![1, 0x03, 0x33, 0x03, 0x33, 0x10, 0x00, 0x10, 0x00]);
        // Left down, then left up.
        assert_eq!(frames[1], &vec![2, 1, 0]);
        assert_eq!(frames[2], &vec![2, 0, 0]);
    }

    #[test]
    fn long_press_is_right_click() {
        let mut touch = TouchInput::new(TouchMode::MouseRelative, false);
        touch.on_start(&vp(), &point(1, 50.0, 50.0), 0);
        let outputs = touch.on_end(&vp(), &point(1, 51.0, 52.0), 400);

        let frames = mouse_frames(&outputs);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], &vec![2, 1, BUTTON_RIGHT]);
        assert_eq!(frames[1], &vec![2, 0, BUTTON_RIGHT]);
    }

    #[test]
    fn too_quick_release_is_no_click() {
        let mut touch = TouchInput::new(TouchMode::MouseRelative, false);
        touch.on_start(&vp(), &point(1, 50.0, 50.0), 0);
        assert!(touch.on_end(&vp(), &point(1, 50.0, 50.0), 50).is_empty());
    }

    #[test]
    fn primary_moves_emit_relative_mouse() {
        let mut touch = TouchInput::new(TouchMode::MouseRelative, false);
        touch.on_start(&vp(), &point(1, 100.0, 100.0), 0);
        let outputs = touch.on_move(&vp(), &point(1, 104.0, 98.0), 16);

        let frames = mouse_frames(&outputs);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], &vec![0, 0, 4, 0xFF, 0xFE]);
    }

    #[test]
    fn drag_engages_after_significant_travel() {
        let mut touch = TouchInput::new(TouchMode::PointAndDrag, false);
        touch.on_start(&vp(), &point(1, 100.0, 100.0), 0);

        // Below threshold: nothing.
        assert!(touch.on_move(&vp(), &point(1, 110.0, 100.0), 16).is_empty());

        // Crossing 30 px: absolute position at origin, then left down.
        let outputs = touch.on_move(&vp(), &point(1, 140.0, 100.0), 32);
        let frames = mouse_frames(&outputs);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0][0], 1);
        assert_eq!(frames[1], &vec![2, 1, BUTTON_LEFT]);

        // Further motion: relative deltas.
        let outputs = touch.on_move(&vp(), &point(1, 145.0, 103.0), 48);
        assert_eq!(mouse_frames(&outputs)[0][0], 0);

        // Release: button up only.
        let outputs = touch.on_end(&vp(), &point(1, 145.0, 103.0), 200);
        let frames = mouse_frames(&outputs);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], &vec![2, 0, BUTTON_LEFT]);
    }

    #[test]
    fn two_fingers_scroll() {
        let mut touch = TouchInput::new(TouchMode::MouseRelative, false);
        touch.on_start(&vp(), &point(1, 100.0, 100.0), 0);
        touch.on_start(&vp(), &point(2, 150.0, 100.0), 10);

        let outputs = touch.on_move(&vp(), &point(1, 104.0, 110.0), 20);
        let frames = mouse_frames(&outputs);
        assert_eq!(frames.len(), 1);
        // Wheel tag, horizontal inverted (-4), vertical negated at source
        // (down motion scrolls down: +10 in, -10 out).
        assert_eq!(frames[0], &vec![3, 0xFF, 0xFC, 0xFF, 0xF6]);

        // Scrolling consumed the contact: release does not click.
        touch.on_end(&vp(), &point(2, 150.0, 100.0), 150);
        assert!(touch.on_end(&vp(), &point(1, 104.0, 110.0), 160).is_empty());
    }

    #[test]
    fn three_finger_swipe_up_shows_keyboard() {
        // Scenario: three touchstarts, primary drifts y by -150 px.
        let mut touch = TouchInput::new(TouchMode::MouseRelative, false);
        touch.on_start(&vp(), &point(1, 200.0, 300.0), 0);
        touch.on_start(&vp(), &point(2, 250.0, 300.0), 5);
        touch.on_start(&vp(), &point(3, 300.0, 300.0), 10);

        let mut all = Vec::new();
        all.extend(touch.on_move(&vp(), &point(1, 200.0, 250.0), 20));
        all.extend(touch.on_move(&vp(), &point(1, 200.0, 150.0), 40));
        all.extend(touch.on_move(&vp(), &point(1, 200.0, 140.0), 60));

        assert_eq!(all, vec![TouchOutput::ShowKeyboard]);
        assert!(mouse_frames(&all).is_empty());
    }

    #[test]
    fn three_finger_swipe_down_hides_keyboard() {
        let mut touch = TouchInput::new(TouchMode::MouseRelative, false);
        touch.on_start(&vp(), &point(1, 200.0, 100.0), 0);
        touch.on_start(&vp(), &point(2, 250.0, 100.0), 5);
        touch.on_start(&vp(), &point(3, 300.0, 100.0), 10);

        let outputs = touch.on_move(&vp(), &point(1, 200.0, 220.0), 30);
        assert_eq!(outputs, vec![TouchOutput::HideKeyboard]);
    }

    #[test]
    fn outside_viewport_is_dropped() {
        let mut touch = TouchInput::new(TouchMode::Touch, true);
        assert!(touch.on_start(&vp(), &point(1, 600.0, 100.0), 0).is_empty());
        assert_eq!(touch.active_touches(), 0);
    }

    #[test]
    fn raw_mode_forwards_touch_frames() {
        let mut touch = TouchInput::new(TouchMode::Touch, true);
        let outputs = touch.on_start(&vp(), &point(9, 250.0, 250.0), 0);
        assert_eq!(outputs.len(), 1);
        let TouchOutput::Touch(frame) = &outputs[0] else {
            panic!("expected raw touch frame");
        };
        assert_eq!(frame.len(), 27);
        assert_eq!(frame[0], 0); // start tag
        assert_eq!(&frame[1..5], &[0, 0, 0, 9]); // id
        // Normalized 0.5 as big-endian f32.
        assert_eq!(&frame[5..9], &0.5f32.to_be_bytes());
    }

    #[test]
    fn touch_mode_without_capability_emulates_mouse() {
        let mut touch = TouchInput::new(TouchMode::Touch, false);
        touch.on_start(&vp(), &point(1, 100.0, 100.0), 0);
        let outputs = touch.on_move(&vp(), &point(1, 105.0, 100.0), 16);
        assert_eq!(mouse_frames(&outputs).len(), 1);
    }

    #[test]
    fn lifecycle_start_moves_end() {
        // Per identifier: start, zero or more moves, exactly one end.
        let mut touch = TouchInput::new(TouchMode::Touch, true);
        touch.on_start(&vp(), &point(1, 10.0, 10.0), 0);
        assert_eq!(touch.active_touches(), 1);
        touch.on_move(&vp(), &point(1, 20.0, 20.0), 10);
        touch.on_end(&vp(), &point(1, 20.0, 20.0), 20);
        assert_eq!(touch.active_touches(), 0);
        // A second end for the same identifier produces nothing.
        assert!(touch.on_end(&vp(), &point(1, 20.0, 20.0), 30).is_empty());
    }
}
