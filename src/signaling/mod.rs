//! Stream Signaling
//!
//! JSON control protocol over the stream WebSocket (the REST origin with
//! the scheme swapped to ws(s) and path `/host/stream`). Client and server
//! messages are externally tagged unions; any bare string from the server
//! is an opaque server message and is never parsed further.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

/// SDP description exchanged during WebRTC negotiation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RtcDescription {
    #[serde(rename = "type")]
    pub ty: SdpType,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RtcIceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// WebRTC signaling payload, mirrored in both directions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WebRtcPayload {
    Description(RtcDescription),
    AddIceCandidate(RtcIceCandidate),
}

/// Transport selection advertised with SetTransport.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DataTransport {
    #[serde(rename = "WebRTC")]
    WebRtc,
    #[serde(rename = "WebSocket")]
    WebSocket,
}

/// Colorspace hint for the negotiated stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Colorspace {
    Rec601,
    #[default]
    Rec709,
    Rec2020,
}

/// Client → server control messages.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub enum ClientMessage {
    Init {
        host_id: u32,
        app_id: u32,
        bitrate: u32,
        packet_size: u32,
        fps: u32,
        width: u32,
        height: u32,
        video_frame_queue_size: u32,
        play_audio_local: bool,
        audio_sample_queue_size: u32,
        video_supported_formats: u32,
        colorspace: Colorspace,
        full_range: bool,
    },
    SetTransport(DataTransport),
    WebRtc(WebRtcPayload),
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
pub struct ServerCapabilities {
    #[serde(default)]
    pub touch: bool,
}

/// Server → client control messages, tagged by their sole key.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub enum ServerMessage {
    StageStarting {
        stage: String,
    },
    StageComplete {
        stage: String,
    },
    StageFailed {
        stage: String,
        error_code: i32,
    },
    Setup {
        ice_servers: Vec<IceServer>,
    },
    ConnectionComplete {
        capabilities: ServerCapabilities,
        format: u32,
        width: u32,
        height: u32,
        fps: u32,
        audio_channels: u32,
        audio_sample_rate: u32,
    },
    ConnectionTerminated {
        error_code: i32,
    },
    UpdateApp {
        app: serde_json::Value,
    },
    WebRtc(WebRtcPayload),
}

/// One inbound signaling frame: a tagged object or a free-form string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Incoming {
    Message(ServerMessage),
    Text(String),
}

/// Events surfaced by the signaling client.
#[derive(Debug)]
pub enum SignalingEvent {
    Open,
    Message(ServerMessage),
    /// Opaque server text, surfaced as an info line.
    ServerText(String),
    Closed(String),
    Error(String),
}

/// Derive the stream signaling URL from the REST origin.
pub fn stream_url(base: &str) -> Result<Url> {
    let mut url = Url::parse(base).context("invalid base url")?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => anyhow::bail!("unsupported scheme: {other}"),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("failed to set websocket scheme"))?;
    url.set_path("/host/stream");
    Ok(url)
}

/// Outbound handle; messages queue until the socket pump is running.
#[derive(Clone)]
pub struct SignalingSender {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl SignalingSender {
    pub fn send(&self, message: ClientMessage) {
        if self.tx.send(message).is_err() {
            warn!("signaling channel closed, dropping message");
        }
    }
}

/// Stream signaling client over one WebSocket.
pub struct SignalingClient {
    url: Url,
    out_tx: mpsc::UnboundedSender<ClientMessage>,
    out_rx: Option<mpsc::UnboundedReceiver<ClientMessage>>,
    event_tx: mpsc::Sender<SignalingEvent>,
}

impl SignalingClient {
    pub fn new(base_url: &str, event_tx: mpsc::Sender<SignalingEvent>) -> Result<Self> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        Ok(Self {
            url: stream_url(base_url)?,
            out_tx,
            out_rx: Some(out_rx),
            event_tx,
        })
    }

    /// Handle for queueing outbound messages; usable before `connect`.
    pub fn sender(&self) -> SignalingSender {
        SignalingSender {
            tx: self.out_tx.clone(),
        }
    }

    /// Open the socket and start the send/receive pumps.
    pub async fn connect(&mut self) -> Result<()> {
        info!("connecting stream signaling: {}", self.url);

        let (ws_stream, response) = connect_async(self.url.as_str())
            .await
            .context("signaling websocket handshake failed")?;
        debug!("signaling connected: {:?}", response.status());

        let (mut write, mut read) = ws_stream.split();

        // Sender pump: drains the pre-open queue first, then live traffic.
        let mut out_rx = self
            .out_rx
            .take()
            .context("signaling client already connected")?;
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(err) => {
                        error!("failed to serialize signaling message: {err}");
                        continue;
                    }
                };
                if let Err(err) = write.send(Message::Text(json.into())).await {
                    error!("signaling send failed: {err}");
                    break;
                }
            }
        });

        // Receiver pump.
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(result) = read.next().await {
                match result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Incoming>(&text) {
                        Ok(Incoming::Message(message)) => {
                            let _ = event_tx.send(SignalingEvent::Message(message)).await;
                        }
                        Ok(Incoming::Text(text)) => {
                            let _ = event_tx.send(SignalingEvent::ServerText(text)).await;
                        }
                        Err(err) => {
                            warn!("unparseable signaling frame: {err}");
                            let _ = event_tx
                                .send(SignalingEvent::Error(format!("malformed signaling: {err}")))
                                .await;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                        warn!("signaling closed: {reason}");
                        let _ = event_tx.send(SignalingEvent::Closed(reason)).await;
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        error!("signaling receive error: {err}");
                        let _ = event_tx.send(SignalingEvent::Error(err.to_string())).await;
                        break;
                    }
                }
            }
        });

        self.event_tx
            .send(SignalingEvent::Open)
            .await
            .context("signaling event channel closed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_url_swaps_scheme() {
        assert_eq!(
            stream_url("https://host.example:8443/api").unwrap().as_str(),
            "wss://host.example:8443/host/stream"
        );
        assert_eq!(
            stream_url("http://127.0.0.1:8080").unwrap().as_str(),
            "ws://127.0.0.1:8080/host/stream"
        );
    }

    #[test]
    fn init_serializes_externally_tagged() {
        let message = ClientMessage::Init {
            host_id: 1,
            app_id: 2,
            bitrate: 20_000,
            packet_size: 1024,
            fps: 60,
            width: 1280,
            height: 720,
            video_frame_queue_size: 2,
            play_audio_local: false,
            audio_sample_queue_size: 4,
            video_supported_formats: 0x0005,
            colorspace: Colorspace::Rec709,
            full_range: false,
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&message).unwrap()).unwrap();
        assert_eq!(json["Init"]["host_id"], 1);
        assert_eq!(json["Init"]["video_supported_formats"], 5);
        assert_eq!(json["Init"]["colorspace"], "Rec709");
    }

    #[test]
    fn set_transport_uses_protocol_names() {
        let json = serde_json::to_string(&ClientMessage::SetTransport(DataTransport::WebRtc)).unwrap();
        assert_eq!(json, r#"{"SetTransport":"WebRTC"}"#);
        let json = serde_json::to_string(&ClientMessage::SetTransport(DataTransport::WebSocket)).unwrap();
        assert_eq!(json, r#"{"SetTransport":"WebSocket"}"#);
    }

    #[test]
    fn description_round_trip() {
        let payload = WebRtcPayload::Description(RtcDescription {
            ty: SdpType::Answer,
            sdp: "v=0".into(),
        });
        let json = serde_json::to_string(&ClientMessage::WebRtc(payload)).unwrap();
        assert!(json.contains(r#""type":"answer""#));
        assert!(json.contains(r#""WebRtc""#));
    }

    #[test]
    fn parses_setup_message() {
        let incoming: Incoming =
            serde_json::from_str(r#"{"Setup":{"ice_servers":[{"urls":["stun:x"]}]}}"#).unwrap();
        match incoming {
            Incoming::Message(ServerMessage::Setup { ice_servers }) => {
                assert_eq!(ice_servers.len(), 1);
                assert_eq!(ice_servers[0].urls, vec!["stun:x".to_string()]);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn parses_connection_complete() {
        let json = r#"{"ConnectionComplete":{"format":4,"width":1280,"height":720,"fps":60,
            "audio_channels":2,"audio_sample_rate":48000,"capabilities":{"touch":false}}}"#;
        let incoming: Incoming = serde_json::from_str(json).unwrap();
        match incoming {
            Incoming::Message(ServerMessage::ConnectionComplete {
                format,
                width,
                capabilities,
                ..
            }) => {
                assert_eq!(format, 4);
                assert_eq!(width, 1280);
                assert!(!capabilities.touch);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn plain_string_is_opaque() {
        let incoming: Incoming = serde_json::from_str(r#""maintenance at noon""#).unwrap();
        assert!(matches!(incoming, Incoming::Text(text) if text == "maintenance at noon"));
    }

    #[test]
    fn ice_candidate_field_names() {
        let json = r#"{"AddIceCandidate":{"candidate":"candidate:1 1 udp 1 1.2.3.4 5 typ host",
            "sdpMid":"0","sdpMLineIndex":0}}"#;
        let payload: WebRtcPayload = serde_json::from_str(json).unwrap();
        match payload {
            WebRtcPayload::AddIceCandidate(c) => {
                assert_eq!(c.sdp_mid.as_deref(), Some("0"));
                assert_eq!(c.sdp_mline_index, Some(0));
                assert_eq!(c.username_fragment, None);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }
}
