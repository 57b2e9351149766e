//! WebRTC Transport
//!
//! Polite-peer connection carrying the inbound media tracks and the full
//! set of data channels. Local descriptions are produced on negotiation
//! need; remote offers are always accepted and answered. ICE candidates
//! received before a remote description are buffered and drained once the
//! peer can take them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

use crate::media::{AudioChunk, FrameType, VideoUnit};
use crate::signaling::{RtcDescription, RtcIceCandidate, SdpType, WebRtcPayload};

use super::{ChannelId, ChannelOutbound, DataChannel, TransportEvent};

/// MIME type for H265/HEVC video (not in the default codec set).
const MIME_TYPE_H265: &str = "video/H265";
/// MIME type for AV1 video.
const MIME_TYPE_AV1: &str = "video/AV1";

/// Queue sizes for the media ingress channels. Overflow drops the oldest
/// pending unit: standing queues are traded for latency.
#[derive(Debug, Clone, Copy)]
pub struct IngressQueues {
    pub video: usize,
    pub audio: usize,
}

impl Default for IngressQueues {
    fn default() -> Self {
        Self { video: 2, audio: 4 }
    }
}

struct PeerShared {
    making_offer: AtomicBool,
    have_remote: AtomicBool,
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
}

/// WebRTC transport: peer, channels, media ingress.
pub struct WebRtcTransport {
    peer: Arc<RTCPeerConnection>,
    channels: HashMap<ChannelId, DataChannel>,
    shared: Arc<PeerShared>,
    signal_tx: mpsc::Sender<WebRtcPayload>,
    events_rx: Option<mpsc::Receiver<TransportEvent>>,
    video_rx: Option<mpsc::Receiver<VideoUnit>>,
    audio_rx: Option<mpsc::Receiver<AudioChunk>>,
}

impl WebRtcTransport {
    /// Create the peer, register every client data channel and the media
    /// transceivers, and start negotiating.
    pub async fn connect(
        ice_servers: Vec<crate::signaling::IceServer>,
        queues: IngressQueues,
        signal_tx: mpsc::Sender<WebRtcPayload>,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("register default codecs")?;

        // H265 and AV1 are not in the default set; payload types are left
        // dynamic for SDP negotiation.
        for mime_type in [MIME_TYPE_H265, MIME_TYPE_AV1] {
            media_engine.register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: mime_type.to_string(),
                        clock_rate: 90000,
                        channels: 0,
                        sdp_fmtp_line: String::new(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: 0,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )?;
        }

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(SettingEngine::default())
            .build();

        let rtc_ice_servers = ice_servers
            .into_iter()
            .map(|server| RTCIceServer {
                urls: server.urls,
                username: server.username.unwrap_or_default(),
                credential: server.credential.unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers,
            ..Default::default()
        };

        let peer = Arc::new(api.new_peer_connection(config).await?);
        info!("peer connection created");

        let shared = Arc::new(PeerShared {
            making_offer: AtomicBool::new(false),
            have_remote: AtomicBool::new(false),
            pending_candidates: Mutex::new(Vec::new()),
        });

        let (event_tx, events_rx) = mpsc::channel::<TransportEvent>(16);
        let (video_tx, video_rx) = mpsc::channel::<VideoUnit>(queues.video.max(1));
        let (audio_tx, audio_rx) = mpsc::channel::<AudioChunk>(queues.audio.max(1));

        // -- Connection state: recover on connected, fatal on failed or on
        // disconnect once gathering has finished.
        let event_tx_state = event_tx.clone();
        let peer_for_state = Arc::downgrade(&peer);
        peer.on_peer_connection_state_change(Box::new(move |state| {
            let tx = event_tx_state.clone();
            let peer = peer_for_state.clone();
            info!("peer connection state: {state:?}");
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Connected => {
                        let _ = tx.send(TransportEvent::Connected).await;
                        let _ = tx.send(TransportEvent::Recovered).await;
                    }
                    RTCPeerConnectionState::Failed => {
                        let _ = tx
                            .send(TransportEvent::Fatal("peer entered failed state".into()))
                            .await;
                    }
                    RTCPeerConnectionState::Disconnected => {
                        let gathering_complete = peer
                            .upgrade()
                            .map(|p| p.ice_gathering_state() == RTCIceGatheringState::Complete)
                            .unwrap_or(true);
                        if gathering_complete {
                            let _ = tx
                                .send(TransportEvent::Fatal(
                                    "peer disconnected with gathering complete".into(),
                                ))
                                .await;
                        }
                    }
                    _ => {}
                }
            })
        }));

        // -- Local candidates flow back through signaling.
        let signal_tx_ice = signal_tx.clone();
        peer.on_ice_candidate(Box::new(move |candidate| {
            let tx = signal_tx_ice.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                let Ok(json) = candidate.to_json() else {
                    return;
                };
                debug!("gathered local ICE candidate: {}", json.candidate);
                let _ = tx
                    .send(WebRtcPayload::AddIceCandidate(RtcIceCandidate {
                        candidate: json.candidate,
                        sdp_mid: json.sdp_mid,
                        sdp_mline_index: json.sdp_mline_index,
                        username_fragment: json.username_fragment,
                    }))
                    .await;
            })
        }));

        // -- Negotiation needed: offer as the polite peer.
        let signal_tx_nego = signal_tx.clone();
        let peer_for_nego = Arc::downgrade(&peer);
        let shared_nego = shared.clone();
        peer.on_negotiation_needed(Box::new(move || {
            let tx = signal_tx_nego.clone();
            let peer = peer_for_nego.clone();
            let shared = shared_nego.clone();
            Box::pin(async move {
                let Some(peer) = peer.upgrade() else {
                    return;
                };
                shared.making_offer.store(true, Ordering::Release);

                let result: Result<()> = async {
                    let offer = peer.create_offer(None).await?;
                    peer.set_local_description(offer.clone()).await?;
                    tx.send(WebRtcPayload::Description(RtcDescription {
                        ty: SdpType::Offer,
                        sdp: offer.sdp,
                    }))
                    .await
                    .context("signaling gone")?;
                    Ok(())
                }
                .await;

                shared.making_offer.store(false, Ordering::Release);
                if let Err(err) = result {
                    warn!("negotiation failed: {err:#}");
                }
            })
        }));

        // -- Media ingress.
        peer.on_track(Box::new(move |track, _receiver, _transceiver| {
            let track_kind = track.kind();
            info!(
                "track received: kind={track_kind:?}, id={}, codec={:?}",
                track.id(),
                track.codec()
            );

            let video_tx = video_tx.clone();
            let audio_tx = audio_tx.clone();
            tokio::spawn(async move {
                let mut buffer = vec![0u8; 1500];
                // One access unit accumulates until the marker bit.
                let mut assembly: Vec<u8> = Vec::with_capacity(256 * 1024);
                let mut packet_count: u64 = 0;

                loop {
                    match track.read(&mut buffer).await {
                        Ok((packet, _)) => {
                            packet_count += 1;
                            if packet_count == 1 {
                                info!(
                                    "first RTP packet on {:?} track ({} bytes, ssrc {})",
                                    track_kind,
                                    packet.payload.len(),
                                    packet.header.ssrc
                                );
                            }

                            if track_kind == RTPCodecType::Video {
                                assembly.extend_from_slice(&packet.payload);
                                if packet.header.marker {
                                    let unit = VideoUnit {
                                        data: std::mem::take(&mut assembly),
                                        // 90 kHz RTP clock to microseconds.
                                        timestamp_us: packet.header.timestamp as u64 * 1000 / 90,
                                        duration_us: 0,
                                        frame_type: FrameType::Delta,
                                    };
                                    if video_tx.try_send(unit).is_err() {
                                        debug!("video ingress full, dropping unit");
                                    }
                                }
                            } else {
                                let chunk = AudioChunk {
                                    data: packet.payload.to_vec(),
                                    // 48 kHz RTP clock to microseconds.
                                    timestamp_us: packet.header.timestamp as u64 * 125 / 6,
                                    duration_us: 0,
                                };
                                if audio_tx.try_send(chunk).is_err() {
                                    debug!("audio ingress full, dropping chunk");
                                }
                            }
                        }
                        Err(err) => {
                            warn!("{track_kind:?} track read ended: {err}");
                            break;
                        }
                    }
                }
            });

            Box::pin(async {})
        }));

        // -- Register outbound/bidirectional data channels per the policy
        // table, plus handles for the server-created inbound ones.
        let mut channels = HashMap::new();
        for id in [ChannelId::General]
            .into_iter()
            .chain(ChannelId::client_data_channels())
        {
            let (handle, outbound) = DataChannel::new(id);
            channels.insert(id, handle.clone());

            if id == ChannelId::General {
                continue; // created by the server, wired in on_data_channel
            }

            let policy = id.policy();
            let init = RTCDataChannelInit {
                ordered: Some(policy.ordered),
                max_retransmits: (!policy.reliable).then_some(0),
                ..Default::default()
            };
            let dc = peer
                .create_data_channel(&id.label(), Some(init))
                .await
                .with_context(|| format!("create data channel {}", id.label()))?;

            wire_channel(dc, handle, outbound);
        }

        // -- Server-created channels (general).
        let channels_for_cb: HashMap<ChannelId, DataChannel> = channels.clone();
        peer.on_data_channel(Box::new(move |dc| {
            let label = dc.label().to_string();
            info!("data channel received: {label}");
            let handle = ChannelId::from_label(&label).and_then(|id| channels_for_cb.get(&id).cloned());
            Box::pin(async move {
                let Some(handle) = handle else {
                    warn!("unknown inbound data channel: {label}");
                    return;
                };
                let dispatch_to = handle.clone();
                dc.on_message(Box::new(move |msg| {
                    let handle = dispatch_to.clone();
                    let data = msg.data.to_vec();
                    Box::pin(async move {
                        handle.dispatch(&data);
                    })
                }));
            })
        }));

        // -- Media transceivers; without them the offer has no m-lines.
        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            peer.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: Vec::new(),
                }),
            )
            .await?;
        }

        Ok(Self {
            peer,
            channels,
            shared,
            signal_tx,
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

    /// Feed one signaling payload from the server into the peer.
    pub async fn handle_signal(&self, payload: WebRtcPayload) -> Result<()> {
        match payload {
            WebRtcPayload::Description(description) => {
                let is_offer = description.ty == SdpType::Offer;
                if is_offer && self.shared.making_offer.load(Ordering::Acquire) {
                    // Polite peer: the remote offer wins the collision.
                    debug!("offer collision, yielding to remote");
                }

                let remote = match description.ty {
                    SdpType::Offer => RTCSessionDescription::offer(description.sdp),
                    SdpType::Answer => RTCSessionDescription::answer(description.sdp),
                    SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
                    SdpType::Rollback => {
                        warn!("ignoring rollback description");
                        return Ok(());
                    }
                }
                .context("invalid remote description")?;

                self.peer
                    .set_remote_description(remote)
                    .await
                    .context("set remote description")?;
                self.shared.have_remote.store(true, Ordering::Release);
                self.drain_pending_candidates().await;

                if is_offer {
                    let answer = self.peer.create_answer(None).await?;
                    self.peer.set_local_description(answer.clone()).await?;
                    self.signal_tx
                        .send(WebRtcPayload::Description(RtcDescription {
                            ty: SdpType::Answer,
                            sdp: answer.sdp,
                        }))
                        .await
                        .context("signaling gone")?;
                }
            }
            WebRtcPayload::AddIceCandidate(candidate) => {
                let init = RTCIceCandidateInit {
                    candidate: candidate.candidate,
                    sdp_mid: candidate.sdp_mid,
                    sdp_mline_index: candidate.sdp_mline_index,
                    username_fragment: candidate.username_fragment,
                };

                if !self.shared.have_remote.load(Ordering::Acquire) {
                    debug!("buffering ICE candidate until a peer description exists");
                    self.shared.pending_candidates.lock().push(init);
                    return Ok(());
                }

                if let Err(err) = self.peer.add_ice_candidate(init).await {
                    warn!("failed to add ICE candidate: {err}");
                }
            }
        }
        Ok(())
    }

    async fn drain_pending_candidates(&self) {
        let pending: Vec<_> = self.shared.pending_candidates.lock().drain(..).collect();
        for candidate in pending {
            if let Err(err) = self.peer.add_ice_candidate(candidate).await {
                warn!("failed to add buffered ICE candidate: {err}");
            }
        }
    }

    pub async fn close(&self) {
        let _ = self.peer.close().await;
    }
}

/// Attach the outbound pump and inbound dispatch of one `DataChannel`
/// handle to its RTC channel. Outbound frames queue until open.
fn wire_channel(dc: Arc<RTCDataChannel>, handle: DataChannel, mut outbound: ChannelOutbound) {
    let (open_tx, open_rx) = tokio::sync::oneshot::channel::<()>();
    let open_tx = Arc::new(Mutex::new(Some(open_tx)));

    let label = dc.label().to_string();
    let open_label = label.clone();
    let open_tx_cb = open_tx.clone();
    dc.on_open(Box::new(move || {
        debug!("data channel '{open_label}' open");
        if let Some(tx) = open_tx_cb.lock().take() {
            let _ = tx.send(());
        }
        Box::pin(async {})
    }));

    let dispatch_to = handle.clone();
    dc.on_message(Box::new(move |msg| {
        let handle = dispatch_to.clone();
        let data = msg.data.to_vec();
        Box::pin(async move {
            handle.dispatch(&data);
        })
    }));

    tokio::spawn(async move {
        if open_rx.await.is_err() && dc.ready_state() != RTCDataChannelState::Open {
            warn!("channel {label} never opened");
            return;
        }
        while let Some(frame) = outbound.rx.recv().await {
            let len = frame.len();
            if let Err(err) = dc.send(&frame).await {
                warn!("send on {label} failed: {err}");
                break;
            }
            outbound
                .buffered
                .fetch_sub(len, std::sync::atomic::Ordering::Relaxed);
        }
    });
}
