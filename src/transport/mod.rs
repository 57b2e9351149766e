//! Transport Channels
//!
//! Logical channel identities, the per-channel policy table and the
//! transport-agnostic `DataChannel` handle shared by the WebRTC and
//! WebSocket transports.

pub mod webrtc;
pub mod websocket;

pub use webrtc::WebRtcTransport;
pub use websocket::WebSocketTransport;

use std::borrow::Cow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::warn;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::media::{AudioChunk, VideoUnit};
use crate::utils::ByteBuffer;

/// Highest controllerN channel ordinal.
pub const MAX_CONTROLLERS: u8 = 4;

/// Logical channel identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelId {
    HostVideo,
    HostAudio,
    General,
    Keyboard,
    Mouse,
    Touch,
    Controllers,
    Stats,
    Controller(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
    Bidirectional,
}

/// Delivery guarantees of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelPolicy {
    pub direction: Direction,
    pub ordered: bool,
    pub reliable: bool,
}

impl ChannelId {
    /// Wire label (data channel label / diagnostic name).
    pub fn label(&self) -> Cow<'static, str> {
        match self {
            ChannelId::HostVideo => Cow::Borrowed("HOST_VIDEO"),
            ChannelId::HostAudio => Cow::Borrowed("HOST_AUDIO"),
            ChannelId::General => Cow::Borrowed("general"),
            ChannelId::Keyboard => Cow::Borrowed("keyboard"),
            ChannelId::Mouse => Cow::Borrowed("mouse"),
            ChannelId::Touch => Cow::Borrowed("touch"),
            ChannelId::Controllers => Cow::Borrowed("controllers"),
            ChannelId::Stats => Cow::Borrowed("stats"),
            ChannelId::Controller(n) => Cow::Owned(format!("controller{n}")),
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "HOST_VIDEO" => Some(ChannelId::HostVideo),
            "HOST_AUDIO" => Some(ChannelId::HostAudio),
            "general" => Some(ChannelId::General),
            "keyboard" => Some(ChannelId::Keyboard),
            "mouse" => Some(ChannelId::Mouse),
            "touch" => Some(ChannelId::Touch),
            "controllers" => Some(ChannelId::Controllers),
            "stats" => Some(ChannelId::Stats),
            _ => label
                .strip_prefix("controller")
                .and_then(|n| n.parse::<u8>().ok())
                .filter(|n| *n < MAX_CONTROLLERS)
                .map(ChannelId::Controller),
        }
    }

    /// Channel tag for the WebSocket multiplexer framing.
    pub fn wire_id(&self) -> u8 {
        match self {
            ChannelId::HostVideo => 0,
            ChannelId::HostAudio => 1,
            ChannelId::General => 2,
            ChannelId::Keyboard => 3,
            ChannelId::Mouse => 4,
            ChannelId::Touch => 5,
            ChannelId::Controllers => 6,
            ChannelId::Stats => 7,
            ChannelId::Controller(n) => 16 + n,
        }
    }

    pub fn from_wire_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(ChannelId::HostVideo),
            1 => Some(ChannelId::HostAudio),
            2 => Some(ChannelId::General),
            3 => Some(ChannelId::Keyboard),
            4 => Some(ChannelId::Mouse),
            5 => Some(ChannelId::Touch),
            6 => Some(ChannelId::Controllers),
            7 => Some(ChannelId::Stats),
            16..=19 => Some(ChannelId::Controller(id - 16)),
            _ => None,
        }
    }

    /// Media ingress channels carry coded frames, not datagram payloads.
    pub fn is_media(&self) -> bool {
        matches!(self, ChannelId::HostVideo | ChannelId::HostAudio)
    }

    /// Per-channel delivery policy.
    pub fn policy(&self) -> ChannelPolicy {
        match self {
            ChannelId::HostVideo | ChannelId::HostAudio => ChannelPolicy {
                direction: Direction::Inbound,
                ordered: true,
                reliable: false,
            },
            ChannelId::General => ChannelPolicy {
                direction: Direction::Inbound,
                ordered: true,
                reliable: true,
            },
            ChannelId::Keyboard => ChannelPolicy {
                direction: Direction::Outbound,
                ordered: true,
                reliable: true,
            },
            ChannelId::Mouse | ChannelId::Touch => ChannelPolicy {
                direction: Direction::Outbound,
                ordered: true,
                reliable: false,
            },
            ChannelId::Controllers => ChannelPolicy {
                direction: Direction::Outbound,
                ordered: true,
                reliable: true,
            },
            ChannelId::Stats => ChannelPolicy {
                direction: Direction::Bidirectional,
                ordered: true,
                reliable: true,
            },
            ChannelId::Controller(_) => ChannelPolicy {
                direction: Direction::Outbound,
                ordered: true,
                reliable: false,
            },
        }
    }

    /// Every data channel the client registers at transport setup.
    pub fn client_data_channels() -> Vec<ChannelId> {
        let mut ids = vec![
            ChannelId::Keyboard,
            ChannelId::Mouse,
            ChannelId::Touch,
            ChannelId::Controllers,
            ChannelId::Stats,
        ];
        ids.extend((0..MAX_CONTROLLERS).map(ChannelId::Controller));
        ids
    }
}

/// Lifecycle and recovery hints surfaced by a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected,
    /// The transport healed; re-enable paths disabled by an earlier hint.
    Recovered,
    Fatal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebRtc,
    WebSocket,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::WebRtc => "WebRTC",
            TransportKind::WebSocket => "WebSocket",
        }
    }
}

type Listener = Box<dyn Fn(&[u8]) + Send + Sync>;

struct DataChannelInner {
    id: ChannelId,
    tx: mpsc::UnboundedSender<Bytes>,
    buffered: Arc<AtomicUsize>,
    listeners: Mutex<Vec<Listener>>,
}

/// Outbound half handed to the transport's pump task.
pub(crate) struct ChannelOutbound {
    pub rx: mpsc::UnboundedReceiver<Bytes>,
    pub buffered: Arc<AtomicUsize>,
}

/// Transport-agnostic channel handle.
///
/// Frames are sent immediately when the underlying channel is open;
/// otherwise they queue in the pump's unbounded FIFO and drain on open.
#[derive(Clone)]
pub struct DataChannel {
    inner: Arc<DataChannelInner>,
}

impl DataChannel {
    pub(crate) fn new(id: ChannelId) -> (Self, ChannelOutbound) {
        let (tx, rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        (
            Self {
                inner: Arc::new(DataChannelInner {
                    id,
                    tx,
                    buffered: buffered.clone(),
                    listeners: Mutex::new(Vec::new()),
                }),
            },
            ChannelOutbound { rx, buffered },
        )
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    /// Queue one frame for transmission.
    pub fn send(&self, frame: &[u8]) {
        self.inner
            .buffered
            .fetch_add(frame.len(), Ordering::Relaxed);
        if self.inner.tx.send(Bytes::copy_from_slice(frame)).is_err() {
            warn!("channel {} closed, dropping frame", self.inner.id.label());
        }
    }

    /// Estimated bytes queued but not yet handed to the socket.
    pub fn buffered_bytes(&self) -> usize {
        self.inner.buffered.load(Ordering::Relaxed)
    }

    /// Register an inbound frame listener.
    pub fn on_message(&self, listener: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.inner.listeners.lock().push(Box::new(listener));
    }

    /// Dispatch an inbound frame to every listener.
    pub(crate) fn dispatch(&self, data: &[u8]) {
        for listener in self.inner.listeners.lock().iter() {
            listener(data);
        }
    }
}

/// A negotiated transport, ready to carry the session.
pub enum Transport {
    WebRtc(WebRtcTransport),
    WebSocket(WebSocketTransport),
}

impl Transport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::WebRtc(_) => TransportKind::WebRtc,
            Transport::WebSocket(_) => TransportKind::WebSocket,
        }
    }

    pub fn channel(&self, id: ChannelId) -> Option<DataChannel> {
        match self {
            Transport::WebRtc(t) => t.channel(id),
            Transport::WebSocket(t) => t.channel(id),
        }
    }

    pub fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        match self {
            Transport::WebRtc(t) => t.take_events(),
            Transport::WebSocket(t) => t.take_events(),
        }
    }

    pub fn take_video_ingress(&mut self) -> Option<mpsc::Receiver<VideoUnit>> {
        match self {
            Transport::WebRtc(t) => t.take_video_ingress(),
            Transport::WebSocket(t) => t.take_video_ingress(),
        }
    }

    pub fn take_audio_ingress(&mut self) -> Option<mpsc::Receiver<AudioChunk>> {
        match self {
            Transport::WebRtc(t) => t.take_audio_ingress(),
            Transport::WebSocket(t) => t.take_audio_ingress(),
        }
    }

    /// Inbound WebRTC signaling; a no-op on the fallback transport.
    pub async fn handle_signal(
        &self,
        payload: crate::signaling::WebRtcPayload,
    ) -> anyhow::Result<()> {
        match self {
            Transport::WebRtc(t) => t.handle_signal(payload).await,
            Transport::WebSocket(_) => Ok(()),
        }
    }

    pub async fn close(&self) {
        if let Transport::WebRtc(t) = self {
            t.close().await;
        }
    }
}

/// Wire layout of a HOST_VIDEO frame in data mode:
/// `u8 flags (bit0 = key)` + `u64 timestamp_us` + `u32 duration_us` + payload.
pub fn encode_video_frame(unit: &VideoUnit) -> Vec<u8> {
    let mut buf = ByteBuffer::with_capacity(13 + unit.data.len());
    let key = matches!(unit.frame_type, crate::media::FrameType::Key);
    buf.put_u8(key as u8);
    buf.put_u64(unit.timestamp_us);
    buf.put_u32(unit.duration_us as u32);
    buf.put_bytes(&unit.data);
    buf.as_slice().to_vec()
}

pub fn decode_video_frame(data: &[u8]) -> Option<VideoUnit> {
    if data.len() < 13 {
        return None;
    }
    let flags = data[0];
    let timestamp_us = u64::from_be_bytes(data[1..9].try_into().ok()?);
    let duration_us = u32::from_be_bytes(data[9..13].try_into().ok()?) as u64;
    Some(VideoUnit {
        data: data[13..].to_vec(),
        timestamp_us,
        duration_us,
        frame_type: if flags & 1 != 0 {
            crate::media::FrameType::Key
        } else {
            crate::media::FrameType::Delta
        },
    })
}

/// Wire layout of a HOST_AUDIO frame in data mode:
/// `u64 timestamp_us` + `u32 duration_us` + payload.
pub fn decode_audio_frame(data: &[u8]) -> Option<AudioChunk> {
    if data.len() < 12 {
        return None;
    }
    let timestamp_us = u64::from_be_bytes(data[..8].try_into().ok()?);
    let duration_us = u32::from_be_bytes(data[8..12].try_into().ok()?) as u64;
    Some(AudioChunk {
        data: data[12..].to_vec(),
        timestamp_us,
        duration_us,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::FrameType;

    #[test]
    fn policy_table_matches_protocol() {
        assert_eq!(
            ChannelId::Mouse.policy(),
            ChannelPolicy {
                direction: Direction::Outbound,
                ordered: true,
                reliable: false
            }
        );
        assert!(ChannelId::Keyboard.policy().reliable);
        assert!(ChannelId::Controllers.policy().reliable);
        assert!(!ChannelId::Controller(0).policy().reliable);
        assert_eq!(ChannelId::Stats.policy().direction, Direction::Bidirectional);
        assert!(ChannelId::HostVideo.is_media());
    }

    #[test]
    fn wire_id_round_trip() {
        for id in ChannelId::client_data_channels()
            .into_iter()
            .chain([ChannelId::HostVideo, ChannelId::HostAudio, ChannelId::General])
        {
            assert_eq!(ChannelId::from_wire_id(id.wire_id()), Some(id));
        }
        assert_eq!(ChannelId::from_wire_id(99), None);
    }

    #[test]
    fn label_round_trip() {
        assert_eq!(ChannelId::from_label("controller2"), Some(ChannelId::Controller(2)));
        assert_eq!(ChannelId::from_label("controller9"), None);
        assert_eq!(ChannelId::from_label("keyboard"), Some(ChannelId::Keyboard));
        assert_eq!(ChannelId::Controller(1).label(), "controller1");
    }

    #[test]
    fn channel_buffers_until_pumped() {
        let (channel, mut outbound) = DataChannel::new(ChannelId::Keyboard);
        channel.send(&[1, 2, 3]);
        channel.send(&[4]);
        assert_eq!(channel.buffered_bytes(), 4);

        let first = outbound.rx.try_recv().unwrap();
        assert_eq!(&first[..], &[1, 2, 3]);
        outbound
            .buffered
            .fetch_sub(first.len(), std::sync::atomic::Ordering::Relaxed);
        assert_eq!(channel.buffered_bytes(), 1);
    }

    #[test]
    fn listeners_receive_dispatch() {
        let (channel, _outbound) = DataChannel::new(ChannelId::Stats);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        channel.on_message(move |data| seen_clone.lock().push(data.to_vec()));

        channel.dispatch(&[9, 9]);
        assert_eq!(seen.lock().as_slice(), &[vec![9, 9]]);
    }

    #[test]
    fn video_frame_round_trip() {
        let unit = VideoUnit {
            data: vec![0, 0, 0, 1, 0x65, 0xAA],
            timestamp_us: 123_456_789,
            duration_us: 16_667,
            frame_type: FrameType::Key,
        };
        let encoded = encode_video_frame(&unit);
        let decoded = decode_video_frame(&encoded).unwrap();
        assert_eq!(decoded.data, unit.data);
        assert_eq!(decoded.timestamp_us, unit.timestamp_us);
        assert_eq!(decoded.duration_us, unit.duration_us);
        assert_eq!(decoded.frame_type, FrameType::Key);
    }
}
