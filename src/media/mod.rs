//! Media Pipeline
//!
//! Codec tables, depacketizing, video decoding, rendering and audio.

pub mod audio;
pub mod codec;
pub mod decoder;
pub mod depacketize;
pub mod pipeline;
pub mod renderer;

pub use audio::{AudioPipeline, AudioPlayer, OpusAudioDecoder};
pub use codec::{CodecFamily, CodecSupport, Support, VideoFormat};
pub use decoder::{probe_decoder_support, DecodeStage, DecodeStats, DecoderBackend};
pub use depacketize::{Depacketized, Depacketizer};
pub use pipeline::{build_video_pipeline, PipelineError, PipelinePlan, VideoPipeline};
pub use renderer::{CanvasRenderer, FrameSink, SurfaceSink};

/// Whether a coded unit is a random access point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Key,
    Delta,
}

/// One coded video decode unit as delivered by the transport.
///
/// For data-mode ingress the payload is an Annex-B byte stream; for track
/// ingress it is the reassembled access unit of one frame.
#[derive(Debug, Clone)]
pub struct VideoUnit {
    pub data: Vec<u8>,
    pub timestamp_us: u64,
    pub duration_us: u64,
    pub frame_type: FrameType,
}

/// A decodable chunk after depacketizing: length-prefixed coded units.
#[derive(Debug, Clone)]
pub struct VideoChunk {
    pub data: Vec<u8>,
    pub timestamp_us: u64,
    pub duration_us: u64,
    pub frame_type: FrameType,
}

/// One coded audio chunk (container-less Opus).
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub data: Vec<u8>,
    pub timestamp_us: u64,
    pub duration_us: u64,
}

/// Out-of-band decoder configuration synthesized from parameter sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderDescription {
    pub family: CodecFamily,
    /// AVCC / HvcC record; empty for AV1 (profile tuple only).
    pub data: Vec<u8>,
}

/// Decoded video frame (YUV 4:2:0 planar).
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub y_plane: Vec<u8>,
    pub u_plane: Vec<u8>,
    pub v_plane: Vec<u8>,
    pub y_stride: u32,
    pub u_stride: u32,
    pub v_stride: u32,
    pub timestamp_us: u64,
}

impl VideoFrame {
    pub fn empty(width: u32, height: u32) -> Self {
        let y_size = (width * height) as usize;
        let uv_size = y_size / 4;

        Self {
            width,
            height,
            y_plane: vec![0; y_size],
            u_plane: vec![128; uv_size],
            v_plane: vec![128; uv_size],
            y_stride: width,
            u_stride: width / 2,
            v_stride: width / 2,
            timestamp_us: 0,
        }
    }

    /// Convert to packed RGBA with integer math (canvas fallback path).
    pub fn to_rgba(&self) -> Vec<u8> {
        let width = self.width as usize;
        let height = self.height as usize;
        let mut rgba = vec![0u8; width * height * 4];

        for row in 0..height {
            let y_row = row * self.y_stride as usize;
            let uv_row = (row / 2) * self.u_stride as usize;
            let out_row = row * width * 4;

            for col in 0..width {
                let y = *self.y_plane.get(y_row + col).unwrap_or(&0) as i32;
                let u = *self.u_plane.get(uv_row + col / 2).unwrap_or(&128) as i32 - 128;
                let v = *self.v_plane.get(uv_row + col / 2).unwrap_or(&128) as i32 - 128;

                let r = (y + ((359 * v) >> 8)).clamp(0, 255) as u8;
                let g = (y - ((88 * u + 183 * v) >> 8)).clamp(0, 255) as u8;
                let b = (y + ((454 * u) >> 8)).clamp(0, 255) as u8;

                let i = out_row + col * 4;
                rgba[i] = r;
                rgba[i + 1] = g;
                rgba[i + 2] = b;
                rgba[i + 3] = 255;
            }
        }

        rgba
    }
}
