//! Session Engine
//!
//! Drives one streaming session: the signaling state machine, transport
//! negotiation with WebSocket fallback, media pipeline attachment, input
//! enablement and the periodic stats merge. Observers receive typed
//! `SessionEvent`s; the embedder presents frames from the `SharedFrame`.

pub mod config;
pub mod types;

pub use config::{CodecPreference, SidebarEdge, SizePreset, StreamSettings};
pub use types::{RecoveryHint, SessionEvent, SessionState, SharedFrame, StreamParams};

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::api::ApiError;
use crate::input::{
    controller::parse_rumble, ControllerManager, InputChannels, InputManager,
};
use crate::media::pipeline::PayloadKind;
use crate::media::{
    audio::AudioPipeline, build_video_pipeline, probe_decoder_support, CodecSupport,
    PipelineError, VideoFormat, VideoPipeline,
};
use crate::signaling::{
    ClientMessage, DataTransport, IceServer, ServerMessage, SignalingClient, SignalingEvent,
    WebRtcPayload,
};
use crate::stats::{ServerStats, StatsCollector};
use crate::transport::{
    webrtc::IngressQueues, ChannelId, Transport, TransportEvent, TransportKind, WebRtcTransport,
    WebSocketTransport,
};

/// Session failure taxonomy.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport failure: {0}")]
    TransportFatal(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("stage {stage} failed with code {error_code}")]
    StageFailed { stage: String, error_code: i32 },
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("missing capability: {0}")]
    Capability(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Which data transport to attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportPreference {
    /// WebRTC first, WebSocket when it fails.
    #[default]
    Auto,
    WebRtc,
    WebSocket,
}

/// One streaming session.
pub struct Session {
    base_url: String,
    params: StreamParams,
    settings: StreamSettings,
    transport_pref: TransportPreference,
    shared_frame: Arc<SharedFrame>,
    input: Arc<Mutex<InputManager>>,
    controller: Arc<ControllerManager>,
    event_tx: mpsc::Sender<SessionEvent>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: Option<mpsc::Receiver<()>>,
    state: SessionState,
}

/// Handle for stopping a running session from outside.
#[derive(Clone)]
pub struct SessionShutdown {
    tx: mpsc::Sender<()>,
}

impl SessionShutdown {
    pub async fn shutdown(&self) {
        let _ = self.tx.send(()).await;
    }
}

impl Session {
    pub fn new(
        base_url: impl Into<String>,
        params: StreamParams,
        settings: StreamSettings,
        transport_pref: TransportPreference,
        event_tx: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let input = Arc::new(Mutex::new(InputManager::new(
            settings.mouse_mode,
            settings.touch_mode,
        )));
        let controller = Arc::new(ControllerManager::new(settings.controller));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        Self {
            base_url: base_url.into(),
            params,
            settings,
            transport_pref,
            shared_frame: Arc::new(SharedFrame::new()),
            input,
            controller,
            event_tx,
            shutdown_tx,
            shutdown_rx: Some(shutdown_rx),
            state: SessionState::Idle,
        }
    }

    /// Latest-frame handoff for the presenting window.
    pub fn shared_frame(&self) -> Arc<SharedFrame> {
        self.shared_frame.clone()
    }

    /// Input front-end for the embedder's event handlers.
    pub fn input(&self) -> Arc<Mutex<InputManager>> {
        self.input.clone()
    }

    pub fn shutdown_handle(&self) -> SessionShutdown {
        SessionShutdown {
            tx: self.shutdown_tx.clone(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    async fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            info!("session state: {:?} -> {:?}", self.state, state);
            self.state = state;
            let _ = self.event_tx.send(SessionEvent::StateChanged(state)).await;
        }
    }

    async fn diagnostic(&self, line: String, hint: RecoveryHint) {
        warn!("{line}");
        let _ = self
            .event_tx
            .send(SessionEvent::Diagnostic { line, hint })
            .await;
    }

    /// Run the session to completion.
    pub async fn run(mut self) -> Result<(), SessionError> {
        // Capability check before anything touches the network: the user's
        // codec constraint must intersect what this environment decodes.
        let probed = probe_decoder_support();
        let requested = self.settings.requested_codecs();
        let effective = requested.and(&probed);
        if effective.is_empty() {
            self.diagnostic(
                "Decoder: No supported video renderer found".into(),
                RecoveryHint::Fatal,
            )
            .await;
            self.set_state(SessionState::Fatal).await;
            return Err(PipelineError::NoSupportedRenderer.into());
        }

        let (sig_event_tx, mut sig_event_rx) = mpsc::channel::<SignalingEvent>(64);
        let mut signaling = SignalingClient::new(&self.base_url, sig_event_tx)
            .map_err(SessionError::Other)?;
        let sender = signaling.sender();

        // Init is queued before the socket opens and flushed on open.
        sender.send(ClientMessage::Init {
            host_id: self.params.host_id,
            app_id: self.params.app_id,
            bitrate: self.params.bitrate,
            packet_size: self.params.packet_size,
            fps: self.params.fps,
            width: self.params.width,
            height: self.params.height,
            video_frame_queue_size: self.params.video_frame_queue_size,
            play_audio_local: self.params.play_audio_local,
            audio_sample_queue_size: self.params.audio_sample_queue_size,
            video_supported_formats: effective.to_bitmask(),
            colorspace: self.params.colorspace,
            full_range: self.params.full_range,
        });

        signaling.connect().await.map_err(SessionError::Other)?;
        self.set_state(SessionState::AwaitingSetup).await;

        // Outbound WebRTC signaling from the transport.
        let (signal_tx, mut signal_rx) = mpsc::channel::<WebRtcPayload>(32);

        let mut transport: Option<Transport> = None;
        let mut transport_events: Option<mpsc::Receiver<TransportEvent>> = None;
        let mut video_rx: Option<mpsc::Receiver<crate::media::VideoUnit>> = None;
        let mut audio_rx: Option<mpsc::Receiver<crate::media::AudioChunk>> = None;
        let mut decode_stats_rx: Option<mpsc::Receiver<crate::media::DecodeStats>> = None;
        let (server_stats_tx, mut server_stats_rx) = mpsc::channel::<ServerStats>(16);

        let mut pipeline: Option<VideoPipeline> = None;
        let mut audio_pipeline: Option<AudioPipeline> = None;
        let mut collector: Option<StatsCollector> = None;
        let mut last_stats_tick = Instant::now();
        let mut stats_interval = tokio::time::interval(Duration::from_secs(1));
        let mut shutdown_rx = self.shutdown_rx.take().expect("session can run only once");

        let result = loop {
            tokio::select! {
                biased;

                Some(()) = shutdown_rx.recv() => {
                    info!("session shutdown requested");
                    break Ok(());
                }

                Some(payload) = signal_rx.recv() => {
                    sender.send(ClientMessage::WebRtc(payload));
                }

                Some(event) = sig_event_rx.recv() => {
                    match event {
                        SignalingEvent::Open => {
                            debug!("control channel open, Init flushed");
                        }
                        SignalingEvent::Message(message) => {
                            match self.handle_server_message(
                                message,
                                &sender,
                                &signal_tx,
                                &effective,
                                &mut transport,
                                &mut transport_events,
                                &mut video_rx,
                                &mut audio_rx,
                                &mut decode_stats_rx,
                                &server_stats_tx,
                                &mut pipeline,
                                &mut audio_pipeline,
                                &mut collector,
                            ).await {
                                Ok(true) => {}
                                Ok(false) => break Ok(()),
                                Err(err) => break Err(err),
                            }
                        }
                        SignalingEvent::ServerText(text) => {
                            let _ = self.event_tx.send(SessionEvent::ServerMessage(text)).await;
                        }
                        SignalingEvent::Closed(reason) => {
                            self.diagnostic(
                                format!("Server: control channel closed: {reason}"),
                                RecoveryHint::Fatal,
                            ).await;
                            break Err(SessionError::TransportFatal(reason));
                        }
                        SignalingEvent::Error(error) => {
                            self.diagnostic(
                                format!("Server: {error}"),
                                RecoveryHint::Fatal,
                            ).await;
                            break Err(SessionError::Protocol(error));
                        }
                    }
                }

                Some(event) = recv_opt(&mut transport_events) => {
                    match event {
                        TransportEvent::Connected => {
                            info!("transport connected");
                        }
                        TransportEvent::Recovered => {
                            self.diagnostic(
                                "WebRTC: connection healthy".into(),
                                RecoveryHint::Recover,
                            ).await;
                        }
                        TransportEvent::Fatal(reason) => {
                            self.diagnostic(
                                format!("WebRTC: {reason}"),
                                RecoveryHint::Fatal,
                            ).await;
                            break Err(SessionError::TransportFatal(reason));
                        }
                    }
                }

                Some(unit) = recv_opt(&mut video_rx) => {
                    if let Some(collector) = collector.as_mut() {
                        collector.note_unit_received(unit.data.len());
                    }
                    if let Some(pipeline) = pipeline.as_mut() {
                        let started = Instant::now();
                        pipeline.push_unit(&unit);
                        if let Some(collector) = collector.as_mut() {
                            collector.note_assembly_time(started.elapsed().as_secs_f64() * 1000.0);
                        }
                    }
                }

                Some(chunk) = recv_opt(&mut audio_rx) => {
                    if let Some(audio) = audio_pipeline.as_ref() {
                        audio.push_chunk(chunk);
                    }
                }

                Some(stats) = recv_opt(&mut decode_stats_rx) => {
                    if let Some(collector) = collector.as_mut() {
                        if stats.frame_produced {
                            collector.note_frame_decoded(stats.decode_time_ms, stats.key_frame);
                            collector.note_processing_time(stats.decode_time_ms as f64);
                            if stats.frame_width != 0 {
                                collector.note_frame_size(stats.frame_width, stats.frame_height);
                            }
                        } else {
                            collector.note_frame_dropped();
                        }
                    }
                    if stats.needs_keyframe {
                        debug!("decoder requested a keyframe");
                    }
                }

                Some(stats) = server_stats_rx.recv() => {
                    if let Some(collector) = collector.as_mut() {
                        collector.apply_server_stats(stats);
                    }
                }

                _ = stats_interval.tick() => {
                    if let Some(collector) = collector.as_mut() {
                        let elapsed = last_stats_tick.elapsed().as_secs_f64();
                        last_stats_tick = Instant::now();
                        let snapshot = collector.tick(elapsed);
                        let _ = self.event_tx.send(SessionEvent::Stats(snapshot)).await;
                    }
                }
            }
        };

        // Teardown: the render sink and input paths must be released
        // before another session can attach.
        self.input.lock().disable();
        self.controller.stop();
        if let Some(transport) = transport.as_ref() {
            transport.close().await;
        }
        drop(pipeline);

        match &result {
            Ok(()) => self.set_state(SessionState::Terminated).await,
            Err(_) => self.set_state(SessionState::Fatal).await,
        }
        result
    }

    /// Handle one control message. `Ok(false)` ends the session cleanly.
    #[allow(clippy::too_many_arguments)]
    async fn handle_server_message(
        &mut self,
        message: ServerMessage,
        sender: &crate::signaling::SignalingSender,
        signal_tx: &mpsc::Sender<WebRtcPayload>,
        effective: &CodecSupport,
        transport: &mut Option<Transport>,
        transport_events: &mut Option<mpsc::Receiver<TransportEvent>>,
        video_rx: &mut Option<mpsc::Receiver<crate::media::VideoUnit>>,
        audio_rx: &mut Option<mpsc::Receiver<crate::media::AudioChunk>>,
        decode_stats_rx: &mut Option<mpsc::Receiver<crate::media::DecodeStats>>,
        server_stats_tx: &mpsc::Sender<ServerStats>,
        pipeline: &mut Option<VideoPipeline>,
        audio_pipeline: &mut Option<AudioPipeline>,
        collector: &mut Option<StatsCollector>,
    ) -> Result<bool, SessionError> {
        match message {
            ServerMessage::StageStarting { stage } => {
                debug!("stage starting: {stage}");
                let _ = self
                    .event_tx
                    .send(SessionEvent::StageStarting { stage })
                    .await;
            }
            ServerMessage::StageComplete { stage } => {
                debug!("stage complete: {stage}");
                let _ = self
                    .event_tx
                    .send(SessionEvent::StageComplete { stage })
                    .await;
            }
            ServerMessage::StageFailed { stage, error_code } => {
                self.diagnostic(
                    format!("Server: stage {stage} failed (code {error_code})"),
                    RecoveryHint::Fatal,
                )
                .await;
                let _ = self
                    .event_tx
                    .send(SessionEvent::StageFailed { stage: stage.clone(), error_code })
                    .await;
                return Err(SessionError::StageFailed { stage, error_code });
            }
            ServerMessage::Setup { ice_servers } => {
                if transport.is_some() {
                    return Err(SessionError::Protocol("duplicate Setup".into()));
                }
                let mut new_transport = self
                    .start_transport(ice_servers, sender, signal_tx.clone())
                    .await?;
                *transport_events = new_transport.take_events();
                *video_rx = new_transport.take_video_ingress();
                *audio_rx = new_transport.take_audio_ingress();
                *transport = Some(new_transport);
                self.set_state(SessionState::Negotiating).await;
            }
            ServerMessage::ConnectionComplete {
                capabilities,
                format,
                width,
                height,
                fps,
                audio_channels,
                audio_sample_rate,
            } => {
                let transport = transport
                    .as_ref()
                    .ok_or_else(|| SessionError::Protocol("ConnectionComplete before Setup".into()))?;

                let format = VideoFormat::from_mask_bit(format).ok_or_else(|| {
                    SessionError::Protocol(format!("unknown negotiated format bit {format}"))
                })?;
                if !effective.get(format).is_usable() {
                    return Err(SessionError::Protocol(format!(
                        "server selected unoffered format {format}"
                    )));
                }
                info!(
                    "connection complete: {format} {width}x{height}@{fps}, \
                     audio {audio_channels}ch@{audio_sample_rate}"
                );

                // Size and attach the media pipeline.
                let ingress = match transport.kind() {
                    TransportKind::WebRtc => PayloadKind::VideoTrack,
                    TransportKind::WebSocket => PayloadKind::Data,
                };
                let plan = build_video_pipeline(
                    ingress,
                    self.settings.canvas_renderer,
                    &self.settings.requested_codecs(),
                    &probe_decoder_support(),
                )?;
                let (new_pipeline, stats_rx) = VideoPipeline::instantiate(
                    &plan,
                    format,
                    self.shared_frame.clone(),
                    (width, height),
                )?;
                *pipeline = Some(new_pipeline);
                *decode_stats_rx = Some(stats_rx);
                *collector = Some(StatsCollector::new("openh264".into(), fps));

                // Audio sink, unless audio stays on the host.
                if !self.params.play_audio_local {
                    match AudioPipeline::spawn(audio_sample_rate, audio_channels) {
                        Ok(audio) => *audio_pipeline = Some(audio),
                        Err(err) => {
                            self.diagnostic(
                                format!("Decoder: audio disabled: {err:#}"),
                                RecoveryHint::Recover,
                            )
                            .await;
                        }
                    }
                }

                self.attach_input(transport, capabilities.touch, server_stats_tx);
                self.set_state(SessionState::Streaming).await;
            }
            ServerMessage::ConnectionTerminated { error_code } => {
                self.diagnostic(
                    format!("Server: connection terminated (code {error_code})"),
                    RecoveryHint::Fatal,
                )
                .await;
                return Ok(false);
            }
            ServerMessage::UpdateApp { app } => {
                let _ = self.event_tx.send(SessionEvent::AppUpdated(app)).await;
            }
            ServerMessage::WebRtc(payload) => {
                let transport = transport
                    .as_ref()
                    .ok_or_else(|| SessionError::Protocol("WebRtc signaling before Setup".into()))?;
                transport
                    .handle_signal(payload)
                    .await
                    .map_err(SessionError::Other)?;
            }
        }
        Ok(true)
    }

    /// Start the configured transport; Auto falls back to WebSocket when
    /// the WebRTC attempt fails outright.
    async fn start_transport(
        &mut self,
        ice_servers: Vec<IceServer>,
        sender: &crate::signaling::SignalingSender,
        signal_tx: mpsc::Sender<WebRtcPayload>,
    ) -> Result<Transport, SessionError> {
        let queues = IngressQueues {
            video: self.params.video_frame_queue_size as usize,
            audio: self.params.audio_sample_queue_size as usize,
        };

        if matches!(
            self.transport_pref,
            TransportPreference::Auto | TransportPreference::WebRtc
        ) {
            match WebRtcTransport::connect(ice_servers, queues, signal_tx).await {
                Ok(transport) => {
                    sender.send(ClientMessage::SetTransport(DataTransport::WebRtc));
                    return Ok(Transport::WebRtc(transport));
                }
                Err(err) if self.transport_pref == TransportPreference::Auto => {
                    self.diagnostic(
                        format!("WebRTC: unavailable, falling back to WebSocket: {err:#}"),
                        RecoveryHint::Recover,
                    )
                    .await;
                }
                Err(err) => {
                    return Err(SessionError::TransportFatal(format!("{err:#}")));
                }
            }
        }

        let transport = WebSocketTransport::connect(
            &self.base_url,
            queues.video,
            queues.audio,
        )
        .await
        .map_err(|err| SessionError::TransportFatal(format!("{err:#}")))?;
        sender.send(ClientMessage::SetTransport(DataTransport::WebSocket));
        Ok(Transport::WebSocket(transport))
    }

    /// Enable the input paths once the server is ready for them.
    fn attach_input(
        &self,
        transport: &Transport,
        server_touch: bool,
        server_stats_tx: &mpsc::Sender<ServerStats>,
    ) {
        let (Some(keyboard), Some(mouse), Some(touch)) = (
            transport.channel(ChannelId::Keyboard),
            transport.channel(ChannelId::Mouse),
            transport.channel(ChannelId::Touch),
        ) else {
            warn!("input channels missing on transport");
            return;
        };

        self.input.lock().enable(
            InputChannels {
                keyboard,
                mouse,
                touch,
            },
            server_touch,
        );

        // Controllers: polling plus the rumble ingress round-trip.
        if let Some(controllers) = transport.channel(ChannelId::Controllers) {
            let per_slot: Vec<_> = (0..crate::transport::MAX_CONTROLLERS)
                .filter_map(|n| transport.channel(ChannelId::Controller(n)))
                .collect();

            let manager = self.controller.clone();
            controllers.on_message(move |data| {
                if let Some(command) = parse_rumble(data) {
                    manager.push_rumble(command);
                }
            });
            self.controller.start(controllers, per_slot);
        }

        // Server-pushed stats arrive as JSON on the stats channel.
        if let Some(stats) = transport.channel(ChannelId::Stats) {
            let tx = server_stats_tx.clone();
            stats.on_message(move |data| {
                match serde_json::from_slice::<ServerStats>(data) {
                    Ok(message) => {
                        let _ = tx.try_send(message);
                    }
                    Err(err) => debug!("unparseable stats message: {err}"),
                }
            });
        }
    }
}

/// Receive from an optional channel; pends forever while absent.
async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
