//! Stream Statistics
//!
//! Periodic video-receiver snapshots merged with the latency figures the
//! server pushes on the stats channel.

use serde::Deserialize;

/// Server-pushed statistics received as JSON on the stats channel.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub enum ServerStats {
    Rtt {
        rtt: f32,
        rtt_variance: f32,
    },
    Video {
        host_processing_min: f32,
        host_processing_max: f32,
        host_processing_avg: f32,
        streamer_processing_min: f32,
        streamer_processing_max: f32,
        streamer_processing_avg: f32,
    },
}

/// One merged statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    // Receiver side
    pub decoder_implementation: String,
    pub frame_width: u32,
    pub frame_height: u32,
    pub fps: f32,
    pub target_fps: u32,
    pub bitrate_mbps: f32,
    pub jitter_buffer_delay_ms: f32,
    pub jitter_buffer_target_ms: f32,
    pub jitter_buffer_minimum_ms: f32,
    pub total_decode_time_ms: f64,
    pub total_assembly_time_ms: f64,
    pub total_processing_time_ms: f64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub frames_decoded: u64,
    pub frames_dropped: u64,
    pub key_frames_decoded: u64,
    // Server reported
    pub rtt_ms: f32,
    pub rtt_variance_ms: f32,
    pub host_processing_min_ms: f32,
    pub host_processing_max_ms: f32,
    pub host_processing_avg_ms: f32,
    pub streamer_processing_min_ms: f32,
    pub streamer_processing_max_ms: f32,
    pub streamer_processing_avg_ms: f32,
}

impl StreamStats {
    pub fn format_resolution(&self) -> String {
        if self.frame_width == 0 {
            "N/A".to_string()
        } else {
            format!("{}x{}", self.frame_width, self.frame_height)
        }
    }
}

/// Accumulates receiver-side counters and produces periodic snapshots.
pub struct StatsCollector {
    stats: StreamStats,
    frames_at_last_tick: u64,
    bytes_this_period: u64,
}

impl StatsCollector {
    pub fn new(decoder_implementation: String, target_fps: u32) -> Self {
        let mut stats = StreamStats {
            decoder_implementation,
            target_fps,
            ..Default::default()
        };
        // Latency-first policy: the target stays pinned at zero.
        stats.jitter_buffer_target_ms = 0.0;
        Self {
            stats,
            frames_at_last_tick: 0,
            bytes_this_period: 0,
        }
    }

    /// One coded unit arrived from the transport.
    pub fn note_unit_received(&mut self, bytes: usize) {
        self.stats.packets_received += 1;
        self.bytes_this_period += bytes as u64;
    }

    pub fn note_packets_lost(&mut self, lost: u64) {
        self.stats.packets_lost = lost;
    }

    pub fn note_frame_decoded(&mut self, decode_time_ms: f32, key_frame: bool) {
        self.stats.frames_decoded += 1;
        if key_frame {
            self.stats.key_frames_decoded += 1;
        }
        self.stats.total_decode_time_ms += decode_time_ms as f64;
    }

    pub fn note_frame_dropped(&mut self) {
        self.stats.frames_dropped += 1;
    }

    pub fn note_frame_size(&mut self, width: u32, height: u32) {
        self.stats.frame_width = width;
        self.stats.frame_height = height;
    }

    pub fn note_assembly_time(&mut self, ms: f64) {
        self.stats.total_assembly_time_ms += ms;
    }

    pub fn note_processing_time(&mut self, ms: f64) {
        self.stats.total_processing_time_ms += ms;
    }

    pub fn note_jitter_delay(&mut self, delay_ms: f32, minimum_ms: f32) {
        self.stats.jitter_buffer_delay_ms = delay_ms;
        self.stats.jitter_buffer_minimum_ms = minimum_ms;
    }

    /// Merge one server-pushed stats message.
    pub fn apply_server_stats(&mut self, message: ServerStats) {
        match message {
            ServerStats::Rtt { rtt, rtt_variance } => {
                self.stats.rtt_ms = rtt;
                self.stats.rtt_variance_ms = rtt_variance;
            }
            ServerStats::Video {
                host_processing_min,
                host_processing_max,
                host_processing_avg,
                streamer_processing_min,
                streamer_processing_max,
                streamer_processing_avg,
            } => {
                self.stats.host_processing_min_ms = host_processing_min;
                self.stats.host_processing_max_ms = host_processing_max;
                self.stats.host_processing_avg_ms = host_processing_avg;
                self.stats.streamer_processing_min_ms = streamer_processing_min;
                self.stats.streamer_processing_max_ms = streamer_processing_max;
                self.stats.streamer_processing_avg_ms = streamer_processing_avg;
            }
        }
    }

    /// Close the current period and emit a snapshot.
    pub fn tick(&mut self, elapsed_secs: f64) -> StreamStats {
        if elapsed_secs > 0.0 {
            let frames = self.stats.frames_decoded - self.frames_at_last_tick;
            self.stats.fps = (frames as f64 / elapsed_secs) as f32;
            self.stats.bitrate_mbps =
                ((self.bytes_this_period as f64 * 8.0) / (elapsed_secs * 1_000_000.0)) as f32;
        }
        self.frames_at_last_tick = self.stats.frames_decoded;
        self.bytes_this_period = 0;
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rtt_message() {
        let message: ServerStats =
            serde_json::from_str(r#"{"Rtt":{"rtt":12.5,"rtt_variance":0.75}}"#).unwrap();
        assert_eq!(
            message,
            ServerStats::Rtt {
                rtt: 12.5,
                rtt_variance: 0.75
            }
        );
    }

    #[test]
    fn parses_video_message() {
        let json = r#"{"Video":{"host_processing_min":1.0,"host_processing_max":5.0,
            "host_processing_avg":2.5,"streamer_processing_min":0.5,
            "streamer_processing_max":2.0,"streamer_processing_avg":1.0}}"#;
        let message: ServerStats = serde_json::from_str(json).unwrap();
        let mut collector = StatsCollector::new("test".into(), 60);
        collector.apply_server_stats(message);
        let snapshot = collector.tick(1.0);
        assert_eq!(snapshot.host_processing_avg_ms, 2.5);
        assert_eq!(snapshot.streamer_processing_max_ms, 2.0);
    }

    #[test]
    fn fps_and_bitrate_per_period() {
        let mut collector = StatsCollector::new("openh264".into(), 60);
        for _ in 0..60 {
            collector.note_unit_received(25_000);
            collector.note_frame_decoded(2.0, false);
        }
        let snapshot = collector.tick(1.0);
        assert_eq!(snapshot.fps, 60.0);
        assert!((snapshot.bitrate_mbps - 12.0).abs() < 0.01);
        assert_eq!(snapshot.frames_decoded, 60);

        // Next period starts from zero.
        let snapshot = collector.tick(1.0);
        assert_eq!(snapshot.fps, 0.0);
        assert_eq!(snapshot.bitrate_mbps, 0.0);
    }

    #[test]
    fn key_frames_counted() {
        let mut collector = StatsCollector::new("openh264".into(), 60);
        collector.note_frame_decoded(1.0, true);
        collector.note_frame_decoded(1.0, false);
        let snapshot = collector.tick(1.0);
        assert_eq!(snapshot.key_frames_decoded, 1);
        assert_eq!(snapshot.frames_decoded, 2);
        assert_eq!(snapshot.jitter_buffer_target_ms, 0.0);
    }
}
