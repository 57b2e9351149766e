//! Media Pipeline Builder
//!
//! Candidate pipelines are tables of typed pipe descriptors. The builder
//! walks them in priority order and keeps the first one whose types chain,
//! whose pipes run in their chosen environment and whose composed codec
//! mask is non-empty. The winner is instantiated from the sink outward.

use std::sync::Arc;

use log::{info, warn};
use thiserror::Error;
use tokio::sync::mpsc as tokio_mpsc;

use crate::app::SharedFrame;

use super::codec::{CodecSupport, VideoFormat};
use super::decoder::{backend_for, DecodeStage, DecodeStats, DecoderError};
use super::depacketize::Depacketizer;
use super::renderer::{CanvasRenderer, FrameSink, SurfaceSink};
use super::VideoUnit;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("No supported video renderer found")]
    NoSupportedRenderer,
    #[error("negotiated format {0} outside the pipeline's codec mask")]
    FormatOutsideMask(VideoFormat),
    #[error(transparent)]
    Decoder(#[from] DecoderError),
}

/// What a pipe consumes or produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Decode units reassembled from an inbound media track.
    VideoTrack,
    /// Decode units framed on the HOST_VIDEO data channel.
    Data,
    /// Length-prefixed decodable chunks.
    Chunk,
    /// Decoded frames.
    Frame,
}

/// Where a pipe executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecEnv {
    Main,
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeKind {
    Depacketize,
    Decode,
    SurfaceSink,
    CanvasSink,
}

impl PipeKind {
    /// Environments a pipe kind can run in. Sinks touch presentation state
    /// and stay on the main environment.
    fn supports_env(self, env: ExecEnv) -> bool {
        match self {
            PipeKind::Decode => true,
            PipeKind::Depacketize | PipeKind::SurfaceSink | PipeKind::CanvasSink => {
                env == ExecEnv::Main
            }
        }
    }
}

/// One stage of a candidate pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PipeSpec {
    pub kind: PipeKind,
    pub input: PayloadKind,
    pub output: PayloadKind,
    pub env: ExecEnv,
}

impl PipeSpec {
    /// Codec constraint this pipe contributes, if any.
    fn mask(&self, probed: &CodecSupport) -> CodecSupport {
        match self.kind {
            PipeKind::Decode => *probed,
            _ => CodecSupport::all_supported(),
        }
    }
}

/// A validated pipeline: ordered pipes plus the composed codec mask.
#[derive(Debug, Clone)]
pub struct PipelinePlan {
    pub pipes: Vec<PipeSpec>,
    pub mask: CodecSupport,
}

impl PipelinePlan {
    pub fn terminates_in_canvas(&self) -> bool {
        matches!(self.pipes.last().map(|p| p.kind), Some(PipeKind::CanvasSink))
    }

    pub fn uses_worker_decode(&self) -> bool {
        self.pipes
            .iter()
            .any(|p| p.kind == PipeKind::Decode && p.env == ExecEnv::Worker)
    }
}

fn candidate(ingress: PayloadKind, decode_env: ExecEnv, sink: PipeKind) -> Vec<PipeSpec> {
    vec![
        PipeSpec {
            kind: PipeKind::Depacketize,
            input: ingress,
            output: PayloadKind::Chunk,
            env: ExecEnv::Main,
        },
        PipeSpec {
            kind: PipeKind::Decode,
            input: PayloadKind::Chunk,
            output: PayloadKind::Frame,
            env: decode_env,
        },
        PipeSpec {
            kind: sink,
            input: PayloadKind::Frame,
            output: PayloadKind::Frame,
            env: ExecEnv::Main,
        },
    ]
}

/// Candidate pipelines in priority order.
fn candidates(ingress: PayloadKind) -> Vec<Vec<PipeSpec>> {
    match ingress {
        PayloadKind::VideoTrack => vec![
            candidate(PayloadKind::VideoTrack, ExecEnv::Worker, PipeKind::SurfaceSink),
            candidate(PayloadKind::VideoTrack, ExecEnv::Main, PipeKind::CanvasSink),
        ],
        _ => vec![
            candidate(PayloadKind::Data, ExecEnv::Worker, PipeKind::SurfaceSink),
            candidate(PayloadKind::Data, ExecEnv::Main, PipeKind::SurfaceSink),
            candidate(PayloadKind::Data, ExecEnv::Main, PipeKind::CanvasSink),
        ],
    }
}

fn validate(pipes: &[PipeSpec], ingress: PayloadKind, probed: &CodecSupport) -> Option<CodecSupport> {
    let first = pipes.first()?;
    if first.input != ingress {
        return None;
    }

    let mut mask = CodecSupport::all_supported();
    let mut prev_output = first.input;
    for pipe in pipes {
        // Adjacent pipes must agree on the payload type and every pipe must
        // be supported in its chosen environment.
        if pipe.input != prev_output || !pipe.kind.supports_env(pipe.env) {
            return None;
        }
        prev_output = pipe.output;
        mask = mask.and(&pipe.mask(probed));
    }

    if mask.is_empty() {
        return None;
    }
    Some(mask)
}

/// Select the highest-priority viable pipeline.
///
/// `requested` is the user's codec constraint (preference/force flag applied),
/// `probed` is the environment's decode capability.
pub fn build_video_pipeline(
    ingress: PayloadKind,
    force_canvas: bool,
    requested: &CodecSupport,
    probed: &CodecSupport,
) -> Result<PipelinePlan, PipelineError> {
    let effective = requested.and(probed);

    for pipes in candidates(ingress) {
        if force_canvas && !matches!(pipes.last().map(|p| p.kind), Some(PipeKind::CanvasSink)) {
            continue;
        }

        if let Some(mask) = validate(&pipes, ingress, &effective) {
            info!(
                "selected video pipeline: {:?} (mask 0x{:03x})",
                pipes.iter().map(|p| p.kind).collect::<Vec<_>>(),
                mask.to_bitmask()
            );
            return Ok(PipelinePlan { pipes, mask });
        }
    }

    warn!("No supported video renderer found");
    Err(PipelineError::NoSupportedRenderer)
}

/// A running video pipeline: depacketizer front, decode stage, sink.
pub struct VideoPipeline {
    depacketizer: Depacketizer,
    decode: DecodeStage,
    canvas: Option<CanvasRenderer>,
}

impl VideoPipeline {
    /// Instantiate a plan for the negotiated format, wiring stages from the
    /// sink outward.
    pub fn instantiate(
        plan: &PipelinePlan,
        format: VideoFormat,
        shared_frame: Arc<SharedFrame>,
        client_size: (u32, u32),
    ) -> Result<(Self, tokio_mpsc::Receiver<DecodeStats>), PipelineError> {
        if !plan.mask.get(format).is_usable() {
            return Err(PipelineError::FormatOutsideMask(format));
        }

        // Sink first.
        let mut canvas = None;
        let sink: Box<dyn FrameSink> = if plan.terminates_in_canvas() {
            let renderer = CanvasRenderer::new(client_size.0, client_size.1);
            canvas = Some(renderer.clone());
            Box::new(renderer)
        } else {
            Box::new(SurfaceSink::new(shared_frame))
        };

        // Then the decode stage wrapping it.
        let backend = backend_for(format)?;
        let (decode, stats_rx) = if plan.uses_worker_decode() {
            DecodeStage::new_worker(backend, format, sink)
        } else {
            DecodeStage::new_main(backend, format, sink)
        };

        // Finally the depacketizer front.
        let depacketizer = Depacketizer::new(format.family());

        Ok((
            Self {
                depacketizer,
                decode,
                canvas,
            },
            stats_rx,
        ))
    }

    /// Push one decode unit through the pipeline.
    pub fn push_unit(&mut self, unit: &VideoUnit) {
        let out = self.depacketizer.push(unit);
        if let Some(description) = out.description {
            self.decode.configure(description);
        }
        if let Some(chunk) = out.chunk {
            self.decode.decode(chunk);
        }
    }

    /// The canvas renderer, when the plan terminates in one.
    pub fn canvas(&self) -> Option<&CanvasRenderer> {
        self.canvas.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::codec::Support;

    fn h264_only() -> CodecSupport {
        CodecSupport::none().with(VideoFormat::H264, Support::Supported)
    }

    #[test]
    fn data_ingress_prefers_worker_surface() {
        let plan = build_video_pipeline(
            PayloadKind::Data,
            false,
            &CodecSupport::all_supported(),
            &h264_only(),
        )
        .unwrap();

        let kinds: Vec<_> = plan.pipes.iter().map(|p| p.kind).collect();
        assert_eq!(
            kinds,
            vec![PipeKind::Depacketize, PipeKind::Decode, PipeKind::SurfaceSink]
        );
        assert!(plan.uses_worker_decode());
    }

    #[test]
    fn canvas_forced_data_path() {
        let plan = build_video_pipeline(
            PayloadKind::Data,
            true,
            &CodecSupport::all_supported(),
            &h264_only(),
        )
        .unwrap();

        let kinds: Vec<_> = plan.pipes.iter().map(|p| p.kind).collect();
        assert_eq!(
            kinds,
            vec![PipeKind::Depacketize, PipeKind::Decode, PipeKind::CanvasSink]
        );
        assert!(!plan.uses_worker_decode());
        assert_eq!(plan.mask.to_bitmask(), VideoFormat::H264.mask_bit());
    }

    #[test]
    fn codec_mismatch_rejects_pipeline() {
        // User requests AV1 only, environment has no AV1 decode.
        let requested = CodecSupport::none().with(VideoFormat::Av1Main8, Support::Supported);
        let err = build_video_pipeline(PayloadKind::Data, false, &requested, &h264_only());
        assert!(matches!(err, Err(PipelineError::NoSupportedRenderer)));
    }

    #[test]
    fn adjacent_types_always_chain() {
        for ingress in [PayloadKind::VideoTrack, PayloadKind::Data] {
            for pipes in candidates(ingress) {
                let mut prev = pipes[0].input;
                for pipe in &pipes {
                    assert_eq!(pipe.input, prev, "pipe input must match upstream output");
                    assert!(pipe.kind.supports_env(pipe.env));
                    prev = pipe.output;
                }
                assert_eq!(prev, PayloadKind::Frame, "pipelines end in a frame sink");
            }
        }
    }

    #[test]
    fn format_outside_mask_refused_at_instantiation() {
        let plan = build_video_pipeline(
            PayloadKind::Data,
            false,
            &CodecSupport::all_supported(),
            &h264_only(),
        )
        .unwrap();

        let err = VideoPipeline::instantiate(
            &plan,
            VideoFormat::H265,
            Arc::new(SharedFrame::new()),
            (1280, 720),
        );
        assert!(matches!(err, Err(PipelineError::FormatOutsideMask(_))));
    }
}
