//! Session Types
//!
//! Shared frame handoff, stream parameters and the events the session
//! engine surfaces to its observers.

use std::sync::atomic::{AtomicU64, Ordering};
use parking_lot::Mutex;

use crate::media::VideoFrame;
use crate::signaling::Colorspace;

/// Latest-frame holder between the decode pipeline and the embedder.
///
/// The decoder writes, the presenter takes; only the newest frame is
/// retained, which keeps the presentation queue at depth one.
pub struct SharedFrame {
    frame: Mutex<Option<VideoFrame>>,
    frame_count: AtomicU64,
    last_read_count: AtomicU64,
}

impl SharedFrame {
    pub fn new() -> Self {
        Self {
            frame: Mutex::new(None),
            frame_count: AtomicU64::new(0),
            last_read_count: AtomicU64::new(0),
        }
    }

    /// Write a new frame (called by the decode stage).
    pub fn write(&self, frame: VideoFrame) {
        *self.frame.lock() = Some(frame);
        self.frame_count.fetch_add(1, Ordering::Release);
    }

    pub fn has_new_frame(&self) -> bool {
        self.frame_count.load(Ordering::Acquire) > self.last_read_count.load(Ordering::Acquire)
    }

    /// Take the latest frame; `None` when nothing new arrived since the
    /// last read. Moves instead of cloning.
    pub fn read(&self) -> Option<VideoFrame> {
        let current = self.frame_count.load(Ordering::Acquire);
        let last = self.last_read_count.load(Ordering::Acquire);
        if current > last {
            self.last_read_count.store(current, Ordering::Release);
            self.frame.lock().take()
        } else {
            None
        }
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Relaxed)
    }
}

impl Default for SharedFrame {
    fn default() -> Self {
        Self::new()
    }
}

/// Requested stream parameters carried by Init.
#[derive(Debug, Clone)]
pub struct StreamParams {
    pub host_id: u32,
    pub app_id: u32,
    pub bitrate: u32,
    pub packet_size: u32,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub video_frame_queue_size: u32,
    pub play_audio_local: bool,
    pub audio_sample_queue_size: u32,
    pub colorspace: Colorspace,
    pub full_range: bool,
}

impl StreamParams {
    pub fn new(host_id: u32, app_id: u32) -> Self {
        Self {
            host_id,
            app_id,
            bitrate: 20_000,
            packet_size: 1024,
            fps: 60,
            width: 1920,
            height: 1080,
            video_frame_queue_size: 2,
            play_audio_local: false,
            audio_sample_queue_size: 4,
            colorspace: Colorspace::Rec709,
            full_range: false,
        }
    }
}

/// Whether a failure still allows the session to continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    Recover,
    Fatal,
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingSetup,
    Negotiating,
    Streaming,
    Terminated,
    Fatal,
}

/// Events surfaced to session observers (the UI shell).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    StageStarting { stage: String },
    StageComplete { stage: String },
    StageFailed { stage: String, error_code: i32 },
    /// Diagnostic line with its origin prefix already applied.
    Diagnostic { line: String, hint: RecoveryHint },
    /// Opaque free-form server message.
    ServerMessage(String),
    AppUpdated(serde_json::Value),
    ShowScreenKeyboard,
    HideScreenKeyboard,
    Stats(crate::stats::StreamStats),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_frame_keeps_newest_only() {
        let shared = SharedFrame::new();
        assert!(shared.read().is_none());

        let mut first = VideoFrame::empty(2, 2);
        first.timestamp_us = 1;
        let mut second = VideoFrame::empty(2, 2);
        second.timestamp_us = 2;

        shared.write(first);
        shared.write(second);
        assert!(shared.has_new_frame());

        let frame = shared.read().expect("latest frame");
        assert_eq!(frame.timestamp_us, 2);
        assert!(!shared.has_new_frame());
        assert!(shared.read().is_none());
        assert_eq!(shared.frame_count(), 2);
    }
}
