//! Audio Pipeline
//!
//! Opus decode and playback through cpal. The decoder and the output
//! stream live on a dedicated thread fed by channel so the session loop
//! never blocks on the audio device.

use anyhow::{Context, Result};
use audiopus::{Channels, SampleRate};
use log::{error, info, warn};
use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use super::AudioChunk;

/// Opus decoder for the audio data path.
///
/// Chunk timestamps and durations arrive as zero for container-less Opus;
/// the packets are self-framing so both are ignored.
pub struct OpusAudioDecoder {
    inner: audiopus::coder::Decoder,
    channels: usize,
    pcm: Vec<i16>,
}

impl OpusAudioDecoder {
    pub fn new(sample_rate: u32, channels: u32) -> Result<Self> {
        let opus_rate = match sample_rate {
            48000 => SampleRate::Hz48000,
            24000 => SampleRate::Hz24000,
            16000 => SampleRate::Hz16000,
            12000 => SampleRate::Hz12000,
            8000 => SampleRate::Hz8000,
            _ => anyhow::bail!("unsupported Opus sample rate: {sample_rate}"),
        };
        let opus_channels = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            _ => anyhow::bail!("unsupported channel count: {channels}"),
        };

        let inner = audiopus::coder::Decoder::new(opus_rate, opus_channels)
            .map_err(|e| anyhow::anyhow!("failed to create Opus decoder: {e:?}"))?;

        info!("Opus decoder ready: {}Hz, {} channels", sample_rate, channels);

        Ok(Self {
            inner,
            channels: channels as usize,
            // 120 ms at 48 kHz is the largest Opus frame.
            pcm: vec![0i16; 5760 * channels as usize],
        })
    }

    /// Decode one packet to interleaved PCM.
    pub fn decode(&mut self, chunk: &AudioChunk) -> Result<Vec<i16>> {
        let packet = audiopus::packet::Packet::try_from(&chunk.data[..])
            .map_err(|e| anyhow::anyhow!("invalid Opus packet: {e:?}"))?;
        let output = audiopus::MutSignals::try_from(&mut self.pcm[..])
            .map_err(|e| anyhow::anyhow!("invalid Opus output buffer: {e:?}"))?;
        let samples_per_channel = self
            .inner
            .decode(Some(packet), output, false)
            .map_err(|e| anyhow::anyhow!("Opus decode failed: {e:?}"))?;

        Ok(self.pcm[..samples_per_channel * self.channels].to_vec())
    }
}

struct AudioBuffer {
    samples: Vec<i16>,
    read_pos: usize,
    write_pos: usize,
    capacity: usize,
}

impl AudioBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0i16; capacity],
            read_pos: 0,
            write_pos: 0,
            capacity,
        }
    }

    fn write(&mut self, data: &[i16]) {
        for &sample in data {
            self.samples[self.write_pos] = sample;
            self.write_pos = (self.write_pos + 1) % self.capacity;
        }
    }

    fn read(&mut self, out: &mut [i16]) {
        for sample in out.iter_mut() {
            if self.read_pos == self.write_pos {
                // Underrun: output silence.
                *sample = 0;
            } else {
                *sample = self.samples[self.read_pos];
                self.read_pos = (self.read_pos + 1) % self.capacity;
            }
        }
    }
}

/// Audio player using cpal.
pub struct AudioPlayer {
    sample_rate: u32,
    channels: u32,
    buffer: Arc<Mutex<AudioBuffer>>,
    _stream: Option<cpal::Stream>,
}

impl AudioPlayer {
    pub fn new(sample_rate: u32, channels: u32) -> Result<Self> {
        use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .context("no audio output device found")?;

        info!("audio device: {}", device.name().unwrap_or_default());

        // Room for ~200 ms of audio.
        let buffer_size = (sample_rate as usize) * (channels as usize) / 5;
        let buffer = Arc::new(Mutex::new(AudioBuffer::new(buffer_size)));

        let config = cpal::StreamConfig {
            channels: channels as u16,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let buffer_clone = buffer.clone();
        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [i16], _| {
                    buffer_clone.lock().read(data);
                },
                |err| {
                    error!("audio stream error: {}", err);
                },
                None,
            )
            .context("failed to create audio stream")?;

        stream.play().context("failed to start audio playback")?;
        info!("audio player started: {}Hz, {} channels", sample_rate, channels);

        Ok(Self {
            sample_rate,
            channels,
            buffer,
            _stream: Some(stream),
        })
    }

    pub fn push_samples(&self, samples: &[i16]) {
        self.buffer.lock().write(samples);
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }
}

/// Data-path audio: a decode+playback thread fed with coded chunks.
pub struct AudioPipeline {
    chunk_tx: mpsc::Sender<AudioChunk>,
}

impl AudioPipeline {
    pub fn spawn(sample_rate: u32, channels: u32) -> Result<Self> {
        let mut decoder = OpusAudioDecoder::new(sample_rate, channels)?;
        let (chunk_tx, chunk_rx) = mpsc::channel::<AudioChunk>();

        thread::Builder::new()
            .name("audio-pipeline".into())
            .spawn(move || {
                let player = match AudioPlayer::new(sample_rate, channels) {
                    Ok(player) => player,
                    Err(err) => {
                        warn!("audio disabled, no player: {err:#}");
                        return;
                    }
                };

                while let Ok(chunk) = chunk_rx.recv() {
                    match decoder.decode(&chunk) {
                        Ok(samples) => player.push_samples(&samples),
                        Err(err) => warn!("dropping audio chunk: {err:#}"),
                    }
                }
                info!("audio pipeline stopped");
            })
            .context("spawn audio thread")?;

        Ok(Self { chunk_tx })
    }

    /// Forward one coded chunk to the decode thread.
    pub fn push_chunk(&self, chunk: AudioChunk) {
        let _ = self.chunk_tx.send(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_underrun_is_silence() {
        let mut buf = AudioBuffer::new(8);
        buf.write(&[1, 2, 3]);

        let mut out = [99i16; 5];
        buf.read(&mut out);
        assert_eq!(out, [1, 2, 3, 0, 0]);
    }

    #[test]
    fn ring_buffer_wraps() {
        let mut buf = AudioBuffer::new(4);
        buf.write(&[1, 2, 3]);
        let mut out = [0i16; 3];
        buf.read(&mut out);
        buf.write(&[4, 5, 6]);
        buf.read(&mut out);
        assert_eq!(out, [4, 5, 6]);
    }

    #[test]
    fn unsupported_rate_rejected() {
        assert!(OpusAudioDecoder::new(44100, 2).is_err());
        assert!(OpusAudioDecoder::new(48000, 6).is_err());
    }
}
