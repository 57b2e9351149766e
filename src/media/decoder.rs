//! Video Decoder Feed
//!
//! A `DecoderBackend` turns length-prefixed chunks into frames; the
//! `DecodeStage` wraps a backend plus its frame sink and optionally runs
//! them on a dedicated thread, communicating by channel (copy on send).

use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::mpsc as tokio_mpsc;

use super::codec::{CodecSupport, Support, VideoFormat};
use super::renderer::FrameSink;
use super::{CodecFamily, DecoderDescription, FrameType, VideoChunk, VideoFrame};

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("decoder configure rejected: {0}")]
    Configure(String),
    #[error("decode call rejected: {0}")]
    Decode(String),
    #[error("keyframe arrived without parameter sets")]
    MissingParameterSets,
    #[error("no decoder backend supports {0}")]
    UnsupportedFormat(VideoFormat),
}

/// A codec implementation able to decode one format family.
pub trait DecoderBackend: Send {
    fn name(&self) -> &'static str;

    /// Capability contribution of this backend to the probe.
    fn supported_formats(&self) -> CodecSupport;

    /// Reset and reconfigure from an out-of-band description.
    fn configure(
        &mut self,
        format: VideoFormat,
        description: &DecoderDescription,
    ) -> Result<(), DecoderError>;

    fn decode(&mut self, chunk: &VideoChunk) -> Result<Vec<VideoFrame>, DecoderError>;

    fn reset(&mut self);
}

/// Probe the decode capabilities of every in-tree backend.
///
/// The composed map is what the Init message advertises and what the
/// pipeline builder ANDs against pipe masks.
pub fn probe_decoder_support() -> CodecSupport {
    let mut support = CodecSupport::none();
    for backend_support in [Openh264Backend::probe()] {
        for format in VideoFormat::ALL {
            let level = support.get(format);
            let contributed = backend_support.get(format);
            // A variant is as supported as the best backend that claims it.
            if matches!(level, Support::Unsupported)
                || (matches!(level, Support::Maybe) && matches!(contributed, Support::Supported))
            {
                support.set(format, contributed);
            }
        }
    }
    support
}

/// Create the backend responsible for a negotiated format.
pub fn backend_for(format: VideoFormat) -> Result<Box<dyn DecoderBackend>, DecoderError> {
    match format.family() {
        CodecFamily::H264 => Ok(Box::new(Openh264Backend::new())),
        _ => Err(DecoderError::UnsupportedFormat(format)),
    }
}

// ---------------------------------------------------------------------------
// openh264 backend

/// Software H.264 decoder.
///
/// openh264 consumes Annex-B, so the length-prefixed records are unwrapped
/// back to start codes and the cached parameter sets are replayed ahead of
/// every keyframe.
pub struct Openh264Backend {
    decoder: Option<openh264::decoder::Decoder>,
    sps: Vec<u8>,
    pps: Vec<u8>,
    scratch: Vec<u8>,
}

impl Openh264Backend {
    pub fn new() -> Self {
        Self {
            decoder: None,
            sps: Vec::new(),
            pps: Vec::new(),
            scratch: Vec::new(),
        }
    }

    fn probe() -> CodecSupport {
        // Baseline/main/high 4:2:0 is solid; 4:4:4 depends on the encoded
        // profile actually negotiated, which only configure() can tell.
        CodecSupport::none()
            .with(VideoFormat::H264, Support::Supported)
            .with(VideoFormat::H264High8_444, Support::Maybe)
    }

    /// Rebuild the Annex-B stream the decoder expects from length-prefixed
    /// records, replaying SPS/PPS ahead of keyframes.
    fn to_annex_b(&mut self, chunk: &VideoChunk) -> Result<&[u8], DecoderError> {
        self.scratch.clear();

        if chunk.frame_type == FrameType::Key {
            for ps in [&self.sps, &self.pps] {
                if !ps.is_empty() {
                    self.scratch.extend_from_slice(&[0, 0, 0, 1]);
                    self.scratch.extend_from_slice(ps);
                }
            }
        }

        let data = &chunk.data;
        let mut offset = 0;
        while offset + 4 <= data.len() {
            let len = u32::from_be_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]) as usize;
            offset += 4;
            if offset + len > data.len() {
                return Err(DecoderError::Decode("truncated length-prefixed record".into()));
            }
            self.scratch.extend_from_slice(&[0, 0, 0, 1]);
            self.scratch.extend_from_slice(&data[offset..offset + len]);
            offset += len;
        }

        Ok(&self.scratch)
    }
}

impl Default for Openh264Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl DecoderBackend for Openh264Backend {
    fn name(&self) -> &'static str {
        "openh264"
    }

    fn supported_formats(&self) -> CodecSupport {
        Self::probe()
    }

    fn configure(
        &mut self,
        format: VideoFormat,
        description: &DecoderDescription,
    ) -> Result<(), DecoderError> {
        if format.family() != CodecFamily::H264 {
            return Err(DecoderError::UnsupportedFormat(format));
        }

        let (sps, pps) = parse_avcc(&description.data)
            .ok_or_else(|| DecoderError::Configure("malformed AVCC description".into()))?;
        self.sps = sps;
        self.pps = pps;

        let decoder = openh264::decoder::Decoder::new()
            .map_err(|e| DecoderError::Configure(e.to_string()))?;
        self.decoder = Some(decoder);
        info!("openh264 configured for {}", format);
        Ok(())
    }

    fn decode(&mut self, chunk: &VideoChunk) -> Result<Vec<VideoFrame>, DecoderError> {
        let timestamp_us = chunk.timestamp_us;
        let annex_b = self.to_annex_b(chunk)?.to_vec();

        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| DecoderError::Decode("decoder not configured".into()))?;

        let mut frames = Vec::new();
        if let Some(yuv) = decoder
            .decode(&annex_b)
            .map_err(|e| DecoderError::Decode(e.to_string()))?
        {
            use openh264::formats::YUVSource;

            let (width, height) = yuv.dimensions();
            let (y_stride, u_stride, v_stride) = yuv.strides();
            frames.push(VideoFrame {
                width: width as u32,
                height: height as u32,
                y_plane: yuv.y().to_vec(),
                u_plane: yuv.u().to_vec(),
                v_plane: yuv.v().to_vec(),
                y_stride: y_stride as u32,
                u_stride: u_stride as u32,
                v_stride: v_stride as u32,
                timestamp_us,
            });
        }

        Ok(frames)
    }

    fn reset(&mut self) {
        self.decoder = None;
        self.sps.clear();
        self.pps.clear();
    }
}

/// Pull the first SPS and PPS out of an AVCDecoderConfigurationRecord.
fn parse_avcc(data: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    if data.len() < 7 || data[0] != 1 {
        return None;
    }

    let sps_count = (data[5] & 0x1F) as usize;
    let mut offset = 6;
    let mut sps = None;
    for _ in 0..sps_count {
        let len = u16::from_be_bytes([*data.get(offset)?, *data.get(offset + 1)?]) as usize;
        offset += 2;
        if sps.is_none() {
            sps = Some(data.get(offset..offset + len)?.to_vec());
        }
        offset += len;
    }

    let pps_count = *data.get(offset)? as usize;
    offset += 1;
    let mut pps = None;
    for _ in 0..pps_count {
        let len = u16::from_be_bytes([*data.get(offset)?, *data.get(offset + 1)?]) as usize;
        offset += 2;
        if pps.is_none() {
            pps = Some(data.get(offset..offset + len)?.to_vec());
        }
        offset += len;
    }

    Some((sps?, pps?))
}

// ---------------------------------------------------------------------------
// Decode stage

/// Per-chunk decode feedback for the stats collector.
#[derive(Debug, Clone, Default)]
pub struct DecodeStats {
    pub decode_time_ms: f32,
    pub frame_produced: bool,
    pub key_frame: bool,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Set when the stage wants the server to produce a fresh keyframe.
    pub needs_keyframe: bool,
}

enum DecoderCommand {
    Configure(DecoderDescription),
    Decode(VideoChunk),
    Stop,
}

struct DecodeWorker {
    backend: Box<dyn DecoderBackend>,
    sink: Box<dyn FrameSink>,
    format: VideoFormat,
    configured: bool,
    errored: bool,
    keyframes_without_description: u32,
    stats_tx: tokio_mpsc::Sender<DecodeStats>,
}

impl DecodeWorker {
    fn handle_configure(&mut self, description: DecoderDescription) {
        self.backend.reset();
        match self.backend.configure(self.format, &description) {
            Ok(()) => {
                self.configured = true;
                self.errored = false;
                self.keyframes_without_description = 0;
            }
            Err(err) => {
                warn!("decoder configure failed: {err}");
                self.errored = true;
            }
        }
    }

    fn handle_decode(&mut self, chunk: VideoChunk) {
        // An errored stage drops everything until a fresh setup.
        if self.errored {
            return;
        }

        if !self.configured {
            if chunk.frame_type == FrameType::Key {
                self.keyframes_without_description += 1;
                // One keyframe may legitimately race the description; the
                // second one without it is a protocol defect.
                if self.keyframes_without_description > 1 {
                    warn!("decoder error: {}", DecoderError::MissingParameterSets);
                    self.errored = true;
                }
                let _ = self.stats_tx.try_send(DecodeStats {
                    needs_keyframe: true,
                    ..Default::default()
                });
            }
            return;
        }

        let started = Instant::now();
        match self.backend.decode(&chunk) {
            Ok(frames) => {
                let produced = !frames.is_empty();
                let (mut width, mut height) = (0, 0);
                for frame in frames {
                    width = frame.width;
                    height = frame.height;
                    self.sink.submit(frame);
                }
                let _ = self.stats_tx.try_send(DecodeStats {
                    decode_time_ms: started.elapsed().as_secs_f32() * 1000.0,
                    frame_produced: produced,
                    key_frame: chunk.frame_type == FrameType::Key,
                    frame_width: width,
                    frame_height: height,
                    needs_keyframe: false,
                });
            }
            Err(err) => {
                warn!("decode failed, pipeline errored until re-setup: {err}");
                self.errored = true;
                let _ = self.stats_tx.try_send(DecodeStats {
                    needs_keyframe: true,
                    ..Default::default()
                });
            }
        }
    }
}

enum StageImpl {
    /// Decode inline on the caller.
    Main(Box<DecodeWorker>),
    /// Decode on a dedicated thread, fed by channel.
    Worker {
        cmd_tx: mpsc::Sender<DecoderCommand>,
        handle: Option<thread::JoinHandle<()>>,
    },
}

/// A decode stage bound to its downstream frame sink.
pub struct DecodeStage {
    inner: StageImpl,
}

impl DecodeStage {
    /// Build a main-environment stage (decode happens on the pushing call).
    pub fn new_main(
        backend: Box<dyn DecoderBackend>,
        format: VideoFormat,
        mut sink: Box<dyn FrameSink>,
    ) -> (Self, tokio_mpsc::Receiver<DecodeStats>) {
        let (stats_tx, stats_rx) = tokio_mpsc::channel(64);
        sink.mount();
        let worker = DecodeWorker {
            backend,
            sink,
            format,
            configured: false,
            errored: false,
            keyframes_without_description: 0,
            stats_tx,
        };
        (
            Self {
                inner: StageImpl::Main(Box::new(worker)),
            },
            stats_rx,
        )
    }

    /// Build a worker-environment stage on its own thread.
    pub fn new_worker(
        backend: Box<dyn DecoderBackend>,
        format: VideoFormat,
        mut sink: Box<dyn FrameSink>,
    ) -> (Self, tokio_mpsc::Receiver<DecodeStats>) {
        let (stats_tx, stats_rx) = tokio_mpsc::channel(64);
        let (cmd_tx, cmd_rx) = mpsc::channel::<DecoderCommand>();

        let handle = thread::spawn(move || {
            sink.mount();
            let mut worker = DecodeWorker {
                backend,
                sink,
                format,
                configured: false,
                errored: false,
                keyframes_without_description: 0,
                stats_tx,
            };

            while let Ok(cmd) = cmd_rx.recv() {
                match cmd {
                    DecoderCommand::Configure(description) => {
                        worker.handle_configure(description)
                    }
                    DecoderCommand::Decode(chunk) => worker.handle_decode(chunk),
                    DecoderCommand::Stop => break,
                }
            }

            worker.sink.unmount();
            debug!("video decode thread stopped");
        });

        (
            Self {
                inner: StageImpl::Worker {
                    cmd_tx,
                    handle: Some(handle),
                },
            },
            stats_rx,
        )
    }

    /// Reset and reconfigure the decoder from a new description.
    pub fn configure(&mut self, description: DecoderDescription) {
        match &mut self.inner {
            StageImpl::Main(worker) => worker.handle_configure(description),
            StageImpl::Worker { cmd_tx, .. } => {
                let _ = cmd_tx.send(DecoderCommand::Configure(description));
            }
        }
    }

    /// Feed one decodable chunk.
    pub fn decode(&mut self, chunk: VideoChunk) {
        match &mut self.inner {
            StageImpl::Main(worker) => worker.handle_decode(chunk),
            StageImpl::Worker { cmd_tx, .. } => {
                let _ = cmd_tx.send(DecoderCommand::Decode(chunk));
            }
        }
    }

    /// True once the stage refuses further input (fresh setup required).
    pub fn is_errored(&self) -> bool {
        match &self.inner {
            StageImpl::Main(worker) => worker.errored,
            // The worker thread owns the flag; callers observe it through
            // the needs_keyframe stats instead.
            StageImpl::Worker { .. } => false,
        }
    }
}

impl Drop for DecodeStage {
    fn drop(&mut self) {
        match &mut self.inner {
            StageImpl::Main(worker) => worker.sink.unmount(),
            StageImpl::Worker { cmd_tx, handle } => {
                let _ = cmd_tx.send(DecoderCommand::Stop);
                if let Some(handle) = handle.take() {
                    let _ = handle.join();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct NullBackend {
        configured: bool,
        fail_decode: bool,
        decoded: Arc<Mutex<Vec<u64>>>,
    }

    impl DecoderBackend for NullBackend {
        fn name(&self) -> &'static str {
            "null"
        }

        fn supported_formats(&self) -> CodecSupport {
            CodecSupport::all_supported()
        }

        fn configure(
            &mut self,
            _format: VideoFormat,
            _description: &DecoderDescription,
        ) -> Result<(), DecoderError> {
            self.configured = true;
            Ok(())
        }

        fn decode(&mut self, chunk: &VideoChunk) -> Result<Vec<VideoFrame>, DecoderError> {
            if self.fail_decode {
                return Err(DecoderError::Decode("synthetic failure".into()));
            }
            self.decoded.lock().push(chunk.timestamp_us);
            Ok(vec![VideoFrame::empty(16, 16)])
        }

        fn reset(&mut self) {
            self.configured = false;
        }
    }

    struct CountingSink(Arc<Mutex<u32>>);

    impl FrameSink for CountingSink {
        fn submit(&mut self, _frame: VideoFrame) {
            *self.0.lock() += 1;
        }
    }

    fn chunk(frame_type: FrameType, timestamp_us: u64) -> VideoChunk {
        VideoChunk {
            data: vec![0, 0, 0, 1, 0x65],
            timestamp_us,
            duration_us: 0,
            frame_type,
        }
    }

    fn description() -> DecoderDescription {
        DecoderDescription {
            family: CodecFamily::H264,
            data: vec![1, 0x64, 0, 0x2A, 0xFF],
        }
    }

    #[test]
    fn second_keyframe_without_description_errors() {
        let frames = Arc::new(Mutex::new(0));
        let decoded = Arc::new(Mutex::new(Vec::new()));
        let backend = NullBackend {
            configured: false,
            fail_decode: false,
            decoded,
        };
        let (mut stage, _stats) = DecodeStage::new_main(
            Box::new(backend),
            VideoFormat::H264,
            Box::new(CountingSink(frames.clone())),
        );

        stage.decode(chunk(FrameType::Key, 1));
        assert!(!stage.is_errored()); // one-attempt grace
        stage.decode(chunk(FrameType::Key, 2));
        assert!(stage.is_errored());
        assert_eq!(*frames.lock(), 0);
    }

    #[test]
    fn decode_error_poisons_until_reconfigure() {
        let frames = Arc::new(Mutex::new(0));
        let decoded = Arc::new(Mutex::new(Vec::new()));
        let backend = NullBackend {
            configured: false,
            fail_decode: true,
            decoded: decoded.clone(),
        };
        let (mut stage, _stats) = DecodeStage::new_main(
            Box::new(backend),
            VideoFormat::H264,
            Box::new(CountingSink(frames.clone())),
        );

        stage.configure(description());
        stage.decode(chunk(FrameType::Key, 1));
        assert!(stage.is_errored());
        stage.decode(chunk(FrameType::Delta, 2));
        assert!(decoded.lock().is_empty());

        // Fresh setup recovers the stage.
        stage.configure(description());
        assert!(!stage.is_errored());
    }

    #[test]
    fn frames_flow_to_sink_in_order() {
        let frames = Arc::new(Mutex::new(0));
        let decoded = Arc::new(Mutex::new(Vec::new()));
        let backend = NullBackend {
            configured: false,
            fail_decode: false,
            decoded: decoded.clone(),
        };
        let (mut stage, _stats) = DecodeStage::new_main(
            Box::new(backend),
            VideoFormat::H264,
            Box::new(CountingSink(frames.clone())),
        );

        stage.configure(description());
        stage.decode(chunk(FrameType::Key, 1));
        stage.decode(chunk(FrameType::Delta, 2));
        stage.decode(chunk(FrameType::Delta, 3));

        assert_eq!(*frames.lock(), 3);
        assert_eq!(*decoded.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn probe_reports_h264() {
        let support = probe_decoder_support();
        assert!(support.get(VideoFormat::H264).is_usable());
        assert!(!support.get(VideoFormat::Av1Main8).is_usable());
    }
}
