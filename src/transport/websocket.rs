//! WebSocket Fallback Transport
//!
//! Multiplexes every logical channel onto one reliable ordered WebSocket.
//! Each frame is tagged with the channel's wire id and length-prefixed:
//! `u8 wire channel id` + `u32 big-endian payload length` + payload.
//! Media arrives in data mode on the HOST_VIDEO / HOST_AUDIO channels;
//! there are no inbound tracks.

use std::collections::HashMap;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::media::{AudioChunk, VideoUnit};
use crate::signaling::stream_url;

use super::{
    decode_audio_frame, decode_video_frame, ChannelId, DataChannel, TransportEvent,
};

/// Frame header: wire id + payload length.
const FRAME_HEADER_LEN: usize = 5;

/// Derive the data-transport URL from the REST origin.
pub fn transport_url(base: &str) -> Result<Url> {
    let mut url = stream_url(base)?;
    url.set_path("/host/stream/transport");
    Ok(url)
}

pub fn encode_frame(id: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.push(id);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn decode_frame(data: &[u8]) -> Option<(u8, &[u8])> {
    if data.len() < FRAME_HEADER_LEN {
        return None;
    }
    let id = data[0];
    let len = u32::from_be_bytes(data[1..5].try_into().ok()?) as usize;
    if data.len() != FRAME_HEADER_LEN + len {
        return None;
    }
    Some((id, &data[FRAME_HEADER_LEN..]))
}

/// WebSocket transport: one socket, internal channel framing.
pub struct WebSocketTransport {
    channels: HashMap<ChannelId, DataChannel>,
    events_rx: Option<mpsc::Receiver<TransportEvent>>,
    video_rx: Option<mpsc::Receiver<VideoUnit>>,
    audio_rx: Option<mpsc::Receiver<AudioChunk>>,
}

impl WebSocketTransport {
    pub async fn connect(base_url: &str, video_queue: usize, audio_queue: usize) -> Result<Self> {
        let url = transport_url(base_url)?;
        info!("connecting data transport: {url}");

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .context("data transport handshake failed")?;
        let (mut write, mut read) = ws_stream.split();

        let (event_tx, events_rx) = mpsc::channel::<TransportEvent>(16);
        let (video_tx, video_rx) = mpsc::channel::<VideoUnit>(video_queue.max(1));
        let (audio_tx, audio_rx) = mpsc::channel::<AudioChunk>(audio_queue.max(1));

        // All channel pumps funnel into a single writer.
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<(u8, Bytes)>();

        let mut channels = HashMap::new();
        for id in [ChannelId::General]
            .into_iter()
            .chain(ChannelId::client_data_channels())
        {
            let (handle, mut outbound) = DataChannel::new(id);
            channels.insert(id, handle);

            let wire_id = id.wire_id();
            let writer = writer_tx.clone();
            tokio::spawn(async move {
                while let Some(frame) = outbound.rx.recv().await {
                    let len = frame.len();
                    if writer.send((wire_id, frame)).is_err() {
                        break;
                    }
                    outbound
                        .buffered
                        .fetch_sub(len, std::sync::atomic::Ordering::Relaxed);
                }
            });
        }

        // Writer task.
        tokio::spawn(async move {
            while let Some((wire_id, payload)) = writer_rx.recv().await {
                let frame = encode_frame(wire_id, &payload);
                if let Err(err) = write.send(Message::Binary(frame.into())).await {
                    warn!("data transport send failed: {err}");
                    break;
                }
            }
        });

        // Reader task.
        let reader_channels = channels.clone();
        let reader_events = event_tx.clone();
        tokio::spawn(async move {
            while let Some(result) = read.next().await {
                match result {
                    Ok(Message::Binary(data)) => {
                        let Some((wire_id, payload)) = decode_frame(&data) else {
                            warn!("malformed transport frame ({} bytes)", data.len());
                            continue;
                        };
                        let Some(id) = ChannelId::from_wire_id(wire_id) else {
                            debug!("frame for unknown channel {wire_id}");
                            continue;
                        };

                        match id {
                            ChannelId::HostVideo => {
                                if let Some(unit) = decode_video_frame(payload) {
                                    if video_tx.try_send(unit).is_err() {
                                        debug!("video ingress full, dropping unit");
                                    }
                                }
                            }
                            ChannelId::HostAudio => {
                                if let Some(chunk) = decode_audio_frame(payload) {
                                    if audio_tx.try_send(chunk).is_err() {
                                        debug!("audio ingress full, dropping chunk");
                                    }
                                }
                            }
                            _ => {
                                if let Some(channel) = reader_channels.get(&id) {
                                    channel.dispatch(payload);
                                }
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                        let _ = reader_events
                            .send(TransportEvent::Fatal(format!(
                                "data transport closed: {reason}"
                            )))
                            .await;
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        let _ = reader_events
                            .send(TransportEvent::Fatal(format!("data transport error: {err}")))
                            .await;
                        break;
                    }
                }
            }
        });

        event_tx
            .send(TransportEvent::Connected)
            .await
            .context("transport event channel closed")?;
        let _ = event_tx.send(TransportEvent::Recovered).await;

        Ok(Self {
            channels,
            events_rx: Some(events_rx),
            video_rx: Some(video_rx),
            audio_rx: Some(audio_rx),
        })
    }

    pub fn channel(&self, id: ChannelId) -> Option<DataChannel> {
        self.channels.get(&id).cloned()
    }

    pub fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events_rx.take()
    }

    pub fn take_video_ingress(&mut self) -> Option<mpsc::Receiver<VideoUnit>> {
        self.video_rx.take()
    }

    pub fn take_audio_ingress(&mut self) -> Option<mpsc::Receiver<AudioChunk>> {
        self.audio_rx.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let payload = vec![1u8, 2, 3, 4, 5];
        let frame = encode_frame(ChannelId::Mouse.wire_id(), &payload);
        let (id, decoded) = decode_frame(&frame).unwrap();
        assert_eq!(id, ChannelId::Mouse.wire_id());
        assert_eq!(decoded, &payload[..]);
    }

    #[test]
    fn truncated_frames_rejected() {
        let frame = encode_frame(3, &[1, 2, 3]);
        assert!(decode_frame(&frame[..frame.len() - 1]).is_none());
        assert!(decode_frame(&[3, 0, 0]).is_none());
    }

    #[test]
    fn empty_payload_frames() {
        let frame = encode_frame(7, &[]);
        let (id, payload) = decode_frame(&frame).unwrap();
        assert_eq!(id, 7);
        assert!(payload.is_empty());
    }

    #[test]
    fn transport_url_derivation() {
        assert_eq!(
            transport_url("https://host.example/api").unwrap().as_str(),
            "wss://host.example/host/stream/transport"
        );
    }
}
