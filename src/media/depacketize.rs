//! Annex-B Depacketizer
//!
//! Splits Annex-B byte streams on start codes, siphons parameter sets into
//! out-of-band decoder descriptions and rewrites the remaining NAL units as
//! 4-byte length-prefixed records for the decoder.

use log::{debug, warn};

use super::codec::CodecFamily;
use super::{DecoderDescription, FrameType, VideoChunk, VideoUnit};

const NAL_H264_SPS: u8 = 7;
const NAL_H264_PPS: u8 = 8;
const NAL_H264_IDR: u8 = 5;

const NAL_H265_VPS: u8 = 32;
const NAL_H265_SPS: u8 = 33;
const NAL_H265_PPS: u8 = 34;

/// Output of one depacketizer push.
#[derive(Debug, Default)]
pub struct Depacketized {
    /// Freshly synthesized decoder description. The decode stage must
    /// reset and reconfigure before feeding the chunk.
    pub description: Option<DecoderDescription>,
    /// Length-prefixed chunk, present only when decodable (key-typed or a
    /// description has been seen).
    pub chunk: Option<VideoChunk>,
}

/// Annex-B to length-prefixed rewriter with parameter-set extraction.
pub struct Depacketizer {
    family: CodecFamily,
    vps: Option<Vec<u8>>,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    has_description: bool,
    /// Reused frame assembly buffer; doubled when insufficient.
    frame: Vec<u8>,
    frame_len: usize,
}

impl Depacketizer {
    pub fn new(family: CodecFamily) -> Self {
        Self {
            family,
            vps: None,
            sps: None,
            pps: None,
            // AV1 needs no bitstream-derived description; the profile tuple
            // configures the decoder at setup.
            has_description: matches!(family, CodecFamily::Av1),
            frame: vec![0; 64 * 1024],
            frame_len: 0,
        }
    }

    pub fn family(&self) -> CodecFamily {
        self.family
    }

    pub fn has_description(&self) -> bool {
        self.has_description
    }

    /// Drop cached parameter sets and the description flag (stream restart).
    pub fn reset(&mut self) {
        self.vps = None;
        self.sps = None;
        self.pps = None;
        self.has_description = matches!(self.family, CodecFamily::Av1);
        self.frame_len = 0;
    }

    /// Process one decode unit.
    pub fn push(&mut self, unit: &VideoUnit) -> Depacketized {
        match self.family {
            CodecFamily::Av1 => self.push_av1(unit),
            CodecFamily::H264 | CodecFamily::H265 => self.push_annex_b(unit),
        }
    }

    /// AV1 passes through without rewriting.
    fn push_av1(&mut self, unit: &VideoUnit) -> Depacketized {
        Depacketized {
            description: None,
            chunk: Some(VideoChunk {
                data: unit.data.clone(),
                timestamp_us: unit.timestamp_us,
                duration_us: unit.duration_us,
                frame_type: unit.frame_type,
            }),
        }
    }

    fn push_annex_b(&mut self, unit: &VideoUnit) -> Depacketized {
        self.frame_len = 0;
        let mut saw_idr = false;
        let mut saw_parameter_set = false;

        for nal in split_nal_units(&unit.data) {
            if nal.is_empty() {
                continue;
            }

            match self.family {
                CodecFamily::H264 => {
                    let nal_type = nal[0] & 0x1F;
                    match nal_type {
                        NAL_H264_SPS => {
                            debug!("caching H264 SPS ({} bytes)", nal.len());
                            self.sps = Some(nal.to_vec());
                            saw_parameter_set = true;
                        }
                        NAL_H264_PPS => {
                            debug!("caching H264 PPS ({} bytes)", nal.len());
                            self.pps = Some(nal.to_vec());
                            saw_parameter_set = true;
                        }
                        _ => {
                            saw_idr |= nal_type == NAL_H264_IDR;
                            self.append_record(nal);
                        }
                    }
                }
                CodecFamily::H265 => {
                    let nal_type = (nal[0] >> 1) & 0x3F;
                    match nal_type {
                        NAL_H265_VPS => {
                            debug!("caching H265 VPS ({} bytes)", nal.len());
                            self.vps = Some(nal.to_vec());
                            saw_parameter_set = true;
                        }
                        NAL_H265_SPS => {
                            debug!("caching H265 SPS ({} bytes)", nal.len());
                            self.sps = Some(nal.to_vec());
                            saw_parameter_set = true;
                        }
                        NAL_H265_PPS => {
                            debug!("caching H265 PPS ({} bytes)", nal.len());
                            self.pps = Some(nal.to_vec());
                            saw_parameter_set = true;
                        }
                        // IRAP pictures (BLA/IDR/CRA)
                        16..=21 => {
                            saw_idr = true;
                            self.append_record(nal);
                        }
                        _ => self.append_record(nal),
                    }
                }
                CodecFamily::Av1 => unreachable!(),
            }
        }

        let description = if saw_parameter_set {
            self.try_synthesize_description()
        } else {
            None
        };

        let frame_type = if saw_idr || unit.frame_type == FrameType::Key {
            FrameType::Key
        } else {
            FrameType::Delta
        };

        let decodable = frame_type == FrameType::Key || self.has_description;
        let chunk = if decodable && self.frame_len > 0 {
            Some(VideoChunk {
                data: self.frame[..self.frame_len].to_vec(),
                timestamp_us: unit.timestamp_us,
                duration_us: unit.duration_us,
                frame_type,
            })
        } else {
            if self.frame_len > 0 {
                warn!("dropping undecodable unit ({} bytes, no description yet)", self.frame_len);
            }
            None
        };

        Depacketized { description, chunk }
    }

    /// Append one NAL unit as a 4-byte big-endian length record.
    fn append_record(&mut self, nal: &[u8]) {
        let needed = self.frame_len + 4 + nal.len();
        if needed > self.frame.len() {
            let mut new_len = self.frame.len().max(1);
            while new_len < needed {
                new_len *= 2;
            }
            self.frame.resize(new_len, 0);
        }

        let len = (nal.len() as u32).to_be_bytes();
        self.frame[self.frame_len..self.frame_len + 4].copy_from_slice(&len);
        self.frame[self.frame_len + 4..needed].copy_from_slice(nal);
        self.frame_len = needed;
    }

    /// Synthesize the out-of-band description once every required parameter
    /// set has been captured.
    fn try_synthesize_description(&mut self) -> Option<DecoderDescription> {
        match self.family {
            CodecFamily::H264 => match (self.sps.take(), self.pps.take()) {
                (Some(sps), Some(pps)) => {
                    self.has_description = true;
                    Some(DecoderDescription {
                        family: CodecFamily::H264,
                        data: build_avcc(&sps, &pps),
                    })
                }
                (sps, pps) => {
                    self.sps = sps;
                    self.pps = pps;
                    None
                }
            },
            CodecFamily::H265 => match (self.vps.take(), self.sps.take(), self.pps.take()) {
                (Some(vps), Some(sps), Some(pps)) => {
                    self.has_description = true;
                    Some(DecoderDescription {
                        family: CodecFamily::H265,
                        data: build_hvcc(&vps, &sps, &pps),
                    })
                }
                (vps, sps, pps) => {
                    self.vps = vps;
                    self.sps = sps;
                    self.pps = pps;
                    None
                }
            },
            CodecFamily::Av1 => None,
        }
    }
}

/// Split an Annex-B byte stream into NAL unit payloads (start codes removed).
pub fn split_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut start: Option<usize> = None;
    let mut i = 0;

    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            // 4-byte start code is a 3-byte one with a leading zero.
            let code_start = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            if let Some(s) = start {
                units.push(&data[s..code_start]);
            }
            start = Some(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }

    if let Some(s) = start {
        if s <= data.len() {
            units.push(&data[s..]);
        }
    }

    units
}

/// AVCDecoderConfigurationRecord with one SPS and one PPS.
fn build_avcc(sps: &[u8], pps: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(11 + sps.len() + pps.len());
    out.push(1); // configurationVersion
    out.push(sps.get(1).copied().unwrap_or(0)); // AVCProfileIndication
    out.push(sps.get(2).copied().unwrap_or(0)); // profile_compatibility
    out.push(sps.get(3).copied().unwrap_or(0)); // AVCLevelIndication
    out.push(0xFF); // lengthSizeMinusOne = 3
    out.push(0xE1); // one SPS
    out.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    out.extend_from_slice(sps);
    out.push(1); // one PPS
    out.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    out.extend_from_slice(pps);
    out
}

/// Minimal HEVCDecoderConfigurationRecord carrying the three parameter-set
/// arrays. Profile fields are left zeroed; decoders parse them from the
/// parameter sets themselves.
fn build_hvcc(vps: &[u8], sps: &[u8], pps: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(23 + 5 * 3 + vps.len() + sps.len() + pps.len());
    out.push(1); // configurationVersion
    out.extend_from_slice(&[0; 20]);
    out.push(0x03); // lengthSizeMinusOne = 3
    out.push(3); // numOfArrays

    for (nal_type, nal) in [(NAL_H265_VPS, vps), (NAL_H265_SPS, sps), (NAL_H265_PPS, pps)] {
        out.push(nal_type); // array_completeness=0 | NAL unit type
        out.extend_from_slice(&1u16.to_be_bytes()); // numNalus
        out.extend_from_slice(&(nal.len() as u16).to_be_bytes());
        out.extend_from_slice(nal);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annex_b(units: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, unit) in units.iter().enumerate() {
            // Mix 3- and 4-byte start codes.
            if i % 2 == 0 {
                out.extend_from_slice(&[0, 0, 0, 1]);
            } else {
                out.extend_from_slice(&[0, 0, 1]);
            }
            out.extend_from_slice(unit);
        }
        out
    }

    fn unit(data: Vec<u8>, frame_type: FrameType) -> VideoUnit {
        VideoUnit {
            data,
            timestamp_us: 1_000,
            duration_us: 16_667,
            frame_type,
        }
    }

    #[test]
    fn split_handles_both_start_code_lengths() {
        let data = annex_b(&[&[0x67, 1, 2, 3], &[0x68, 4], &[0x65, 5, 6]]);
        let units = split_nal_units(&data);
        assert_eq!(units.len(), 3);
        assert_eq!(units[0], &[0x67, 1, 2, 3]);
        assert_eq!(units[1], &[0x68, 4]);
        assert_eq!(units[2], &[0x65, 5, 6]);
    }

    #[test]
    fn h264_parameter_sets_build_description() {
        let sps = vec![0x67, 0x64, 0x00, 0x2A, 0xAA];
        let pps = vec![0x68, 0xEE, 0x38];
        let idr = vec![0x65, 1, 2, 3, 4];
        let mut depack = Depacketizer::new(CodecFamily::H264);

        let out = depack.push(&unit(annex_b(&[&sps, &pps, &idr]), FrameType::Key));

        let desc = out.description.expect("description synthesized");
        assert_eq!(desc.data[0], 1);
        assert_eq!(desc.data[1..4], [0x64, 0x00, 0x2A]); // SPS bytes 1..3
        assert_eq!(desc.data[4], 0xFF);
        assert!(depack.has_description());

        // Chunk holds only the IDR, length-prefixed, no parameter sets.
        let chunk = out.chunk.expect("key chunk decodable");
        assert_eq!(chunk.frame_type, FrameType::Key);
        assert_eq!(&chunk.data[..4], &(idr.len() as u32).to_be_bytes());
        assert_eq!(&chunk.data[4..], &idr[..]);
    }

    #[test]
    fn delta_without_description_is_dropped() {
        let mut depack = Depacketizer::new(CodecFamily::H264);
        let out = depack.push(&unit(annex_b(&[&[0x41, 9, 9]]), FrameType::Delta));
        assert!(out.chunk.is_none());
        assert!(out.description.is_none());

        // After a description arrives, deltas flow.
        let sps = vec![0x67, 0x64, 0x00, 0x2A];
        let pps = vec![0x68, 0xEE];
        depack.push(&unit(annex_b(&[&sps, &pps, &[0x65, 1]]), FrameType::Key));
        let out = depack.push(&unit(annex_b(&[&[0x41, 9, 9]]), FrameType::Delta));
        assert!(out.chunk.is_some());
    }

    #[test]
    fn h265_needs_all_three_parameter_sets() {
        let vps = vec![32 << 1, 0xAA];
        let sps = vec![33 << 1, 0xBB];
        let pps = vec![34 << 1, 0xCC];
        let idr = vec![19 << 1, 1, 2];
        let mut depack = Depacketizer::new(CodecFamily::H265);

        let out = depack.push(&unit(annex_b(&[&vps, &sps]), FrameType::Delta));
        assert!(out.description.is_none());
        assert!(!depack.has_description());

        let out = depack.push(&unit(annex_b(&[&pps, &idr]), FrameType::Key));
        let desc = out.description.expect("hvcc synthesized");
        assert_eq!(desc.data[0], 1);
        assert_eq!(desc.data[22], 3); // three arrays
        assert!(depack.has_description());
        assert!(out.chunk.is_some());
    }

    #[test]
    fn av1_passes_through_unmodified() {
        let mut depack = Depacketizer::new(CodecFamily::Av1);
        let payload = vec![0x12, 0x00, 0x0A, 0x0B];
        let out = depack.push(&unit(payload.clone(), FrameType::Delta));
        assert!(out.description.is_none());
        assert_eq!(out.chunk.unwrap().data, payload);
    }

    #[test]
    fn rewriting_preserves_non_parameter_nals() {
        // Property: concatenated length-prefixed payloads equal the
        // start-code split minus parameter sets.
        let sps = vec![0x67, 1, 2, 3];
        let pps = vec![0x68, 4];
        let nals: Vec<Vec<u8>> = vec![
            vec![0x65, 10, 11, 12],
            vec![0x41, 13],
            vec![0x41, 14, 15],
        ];
        let mut all: Vec<&[u8]> = vec![&sps, &pps];
        all.extend(nals.iter().map(|n| n.as_slice()));

        let mut depack = Depacketizer::new(CodecFamily::H264);
        let out = depack.push(&unit(annex_b(&all), FrameType::Key));
        let chunk = out.chunk.unwrap();

        let mut reassembled = Vec::new();
        let mut offset = 0;
        let mut count = 0;
        while offset < chunk.data.len() {
            let len = u32::from_be_bytes(chunk.data[offset..offset + 4].try_into().unwrap()) as usize;
            reassembled.extend_from_slice(&chunk.data[offset + 4..offset + 4 + len]);
            offset += 4 + len;
            count += 1;
        }

        let expected: Vec<u8> = nals.iter().flatten().copied().collect();
        assert_eq!(reassembled, expected);
        assert_eq!(count, nals.len());
    }

    #[test]
    fn frame_buffer_grows_for_large_units() {
        let mut depack = Depacketizer::new(CodecFamily::H264);
        let big = {
            let mut v = vec![0x65u8];
            v.extend(std::iter::repeat(0xAB).take(200 * 1024));
            v
        };
        let out = depack.push(&unit(annex_b(&[&big]), FrameType::Key));
        let chunk = out.chunk.unwrap();
        assert_eq!(chunk.data.len(), 4 + big.len());
    }
}
