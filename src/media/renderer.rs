//! Frame Renderers
//!
//! Terminal pipeline stages: the surface sink hands decoded frames to the
//! embedding window through a latest-frame slot, the canvas renderer keeps
//! its own backing store and draws with aspect-preserving bars.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;

use crate::app::SharedFrame;

use super::VideoFrame;

/// Downstream consumer of decoded frames.
pub trait FrameSink: Send {
    fn mount(&mut self) {}
    fn submit(&mut self, frame: VideoFrame);
    fn unmount(&mut self) {}
}

/// Presents frames through the embedder's `SharedFrame` slot.
///
/// Presentation can be paused (the native analog of a blocked autoplay);
/// `on_user_interaction` resumes it.
pub struct SurfaceSink {
    shared: Arc<SharedFrame>,
    paused: Arc<AtomicBool>,
}

impl SurfaceSink {
    pub fn new(shared: Arc<SharedFrame>) -> Self {
        Self {
            shared,
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pause_handle(&self) -> Arc<AtomicBool> {
        self.paused.clone()
    }

    /// Resume presentation if it was paused.
    pub fn on_user_interaction(&self) {
        if self.paused.swap(false, Ordering::AcqRel) {
            info!("presentation resumed by user interaction");
        }
    }
}

impl FrameSink for SurfaceSink {
    fn mount(&mut self) {
        debug!("surface sink mounted");
    }

    fn submit(&mut self, frame: VideoFrame) {
        if !self.paused.load(Ordering::Acquire) {
            self.shared.write(frame);
        }
    }

    fn unmount(&mut self) {
        debug!("surface sink unmounted");
    }
}

/// Destination rectangle for an aspect-preserving draw.
///
/// Compensates for the canvas being stretched to the client rect: the
/// frame-aspect image is inset with letterbox (top/bottom) or pillarbox
/// (left/right) bars so the stretched result keeps the frame's aspect.
pub fn fit_rect(
    frame_w: u32,
    frame_h: u32,
    client_w: u32,
    client_h: u32,
) -> (u32, u32, u32, u32) {
    if frame_w == 0 || frame_h == 0 || client_w == 0 || client_h == 0 {
        return (0, 0, frame_w, frame_h);
    }

    let frame_aspect = frame_w as f64 / frame_h as f64;
    let client_aspect = client_w as f64 / client_h as f64;

    if client_aspect > frame_aspect {
        // Client is wider: pillarbox.
        let draw_w = (frame_w as f64 * frame_aspect / client_aspect).round() as u32;
        let x = (frame_w - draw_w.min(frame_w)) / 2;
        (x, 0, draw_w.min(frame_w), frame_h)
    } else {
        // Client is taller: letterbox.
        let draw_h = (frame_h as f64 * client_aspect / frame_aspect).round() as u32;
        let y = (frame_h - draw_h.min(frame_h)) / 2;
        (0, y, frame_w, draw_h.min(frame_h))
    }
}

struct CanvasState {
    pending: Option<VideoFrame>,
    client_w: u32,
    client_h: u32,
    canvas_w: u32,
    canvas_h: u32,
    pixels: Vec<u8>,
    frames_drawn: u64,
}

/// Software canvas renderer.
///
/// Retains only the newest pending frame; each render tick resizes the
/// backing store to the frame's intrinsic size, clears it and draws the
/// frame into the computed fit rectangle.
#[derive(Clone)]
pub struct CanvasRenderer {
    state: Arc<Mutex<CanvasState>>,
}

impl CanvasRenderer {
    pub fn new(client_w: u32, client_h: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(CanvasState {
                pending: None,
                client_w,
                client_h,
                canvas_w: 0,
                canvas_h: 0,
                pixels: Vec::new(),
                frames_drawn: 0,
            })),
        }
    }

    /// Track the embedding element's client size (for bar computation).
    pub fn set_client_size(&self, width: u32, height: u32) {
        let mut state = self.state.lock();
        state.client_w = width;
        state.client_h = height;
    }

    pub fn canvas_size(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.canvas_w, state.canvas_h)
    }

    pub fn frames_drawn(&self) -> u64 {
        self.state.lock().frames_drawn
    }

    /// Copy of the backing store (RGBA).
    pub fn pixels(&self) -> Vec<u8> {
        self.state.lock().pixels.clone()
    }

    /// Draw the pending frame, if any. Returns true when a draw happened.
    pub fn render_tick(&self) -> bool {
        let mut state = self.state.lock();
        let Some(frame) = state.pending.take() else {
            return false;
        };

        if state.canvas_w != frame.width || state.canvas_h != frame.height {
            state.canvas_w = frame.width;
            state.canvas_h = frame.height;
            state.pixels = vec![0; (frame.width * frame.height * 4) as usize];
            debug!("canvas resized to {}x{}", frame.width, frame.height);
        } else {
            state.pixels.fill(0);
        }

        let (dst_x, dst_y, dst_w, dst_h) =
            fit_rect(frame.width, frame.height, state.client_w, state.client_h);
        if dst_w == 0 || dst_h == 0 {
            return false;
        }

        let rgba = frame.to_rgba();
        let canvas_w = state.canvas_w as usize;

        // Nearest-neighbor blit into the fit rectangle.
        for dy in 0..dst_h as usize {
            let src_y = dy * frame.height as usize / dst_h as usize;
            let dst_row = (dst_y as usize + dy) * canvas_w;
            for dx in 0..dst_w as usize {
                let src_x = dx * frame.width as usize / dst_w as usize;
                let src_i = (src_y * frame.width as usize + src_x) * 4;
                let dst_i = (dst_row + dst_x as usize + dx) * 4;
                state.pixels[dst_i..dst_i + 4].copy_from_slice(&rgba[src_i..src_i + 4]);
            }
        }

        state.frames_drawn += 1;
        true
    }
}

impl FrameSink for CanvasRenderer {
    fn submit(&mut self, frame: VideoFrame) {
        // Previous pending frame is dropped: newest wins.
        self.state.lock().pending = Some(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_aspect_fills_canvas() {
        assert_eq!(fit_rect(1280, 720, 1920, 1080), (0, 0, 1280, 720));
    }

    #[test]
    fn taller_client_letterboxes() {
        let (x, y, w, h) = fit_rect(1280, 720, 900, 900);
        assert_eq!((x, w), (0, 1280));
        assert!(h < 720);
        assert_eq!(y, (720 - h) / 2);
    }

    #[test]
    fn wider_client_pillarboxes() {
        let (x, y, w, h) = fit_rect(1280, 720, 3200, 900);
        assert_eq!((y, h), (0, 720));
        assert!(w < 1280);
        assert_eq!(x, (1280 - w) / 2);
    }

    #[test]
    fn newest_frame_wins() {
        let mut renderer = CanvasRenderer::new(1280, 720);
        let mut first = VideoFrame::empty(16, 16);
        first.timestamp_us = 1;
        let mut second = VideoFrame::empty(16, 16);
        second.timestamp_us = 2;

        renderer.submit(first);
        renderer.submit(second);

        assert!(renderer.render_tick());
        // Only one frame retained: second tick has nothing to draw.
        assert!(!renderer.render_tick());
        assert_eq!(renderer.frames_drawn(), 1);
    }

    #[test]
    fn canvas_resizes_to_frame() {
        let mut renderer = CanvasRenderer::new(1280, 720);
        renderer.submit(VideoFrame::empty(1280, 720));
        renderer.render_tick();
        assert_eq!(renderer.canvas_size(), (1280, 720));
        assert_eq!(renderer.pixels().len(), 1280 * 720 * 4);
    }
}
