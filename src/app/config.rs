//! Stream Settings
//!
//! User preferences for the streaming session, persisted as JSON under
//! the platform config directory.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::input::{ControllerConfig, MouseMode, TouchMode};
use crate::media::codec::{CodecSupport, Support, VideoFormat};

/// Stream size: a preset or explicit dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SizePreset {
    /// 1280x720
    Hd,
    /// 1920x1080
    #[default]
    FullHd,
    /// 2560x1440
    Qhd,
    /// 3840x2160
    Uhd,
    /// Use `custom_width`/`custom_height`.
    Custom,
}

impl SizePreset {
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match self {
            SizePreset::Hd => Some((1280, 720)),
            SizePreset::FullHd => Some((1920, 1080)),
            SizePreset::Qhd => Some((2560, 1440)),
            SizePreset::Uhd => Some((3840, 2160)),
            SizePreset::Custom => None,
        }
    }
}

/// Preferred codec family for negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CodecPreference {
    #[default]
    H264,
    H265,
    Av1,
}

/// Sidebar attachment edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SidebarEdge {
    #[default]
    Left,
    Right,
}

/// User preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Video size preset.
    pub size: SizePreset,
    pub custom_width: u32,
    pub custom_height: u32,

    /// Preferred codec, and whether it is the only one offered.
    pub codec: CodecPreference,
    pub force_codec: bool,

    /// Force the canvas renderer path.
    pub canvas_renderer: bool,

    /// Play audio on the host instead of the client.
    pub play_audio_local: bool,

    pub mouse_mode: MouseMode,
    pub touch_mode: TouchMode,
    pub controller: ControllerConfig,

    pub sidebar_edge: SidebarEdge,
    /// Physical key code toggling fullscreen.
    pub fullscreen_keybind: String,

    pub bitrate_kbps: u32,
    pub fps: u32,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            size: SizePreset::FullHd,
            custom_width: 1920,
            custom_height: 1080,
            codec: CodecPreference::H264,
            force_codec: false,
            canvas_renderer: false,
            play_audio_local: false,
            mouse_mode: MouseMode::Relative,
            touch_mode: TouchMode::MouseRelative,
            controller: ControllerConfig::default(),
            sidebar_edge: SidebarEdge::Left,
            fullscreen_keybind: "F11".to_string(),
            bitrate_kbps: 20_000,
            fps: 60,
        }
    }
}

impl StreamSettings {
    fn file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("lumen-streamer").join("settings.json"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::file_path().ok_or_else(|| anyhow::anyhow!("no config directory"))?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::file_path().ok_or_else(|| anyhow::anyhow!("no config directory"))?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Effective stream dimensions.
    pub fn dimensions(&self) -> (u32, u32) {
        self.size
            .dimensions()
            .unwrap_or((self.custom_width.max(1), self.custom_height.max(1)))
    }

    /// The codec constraint offered to the pipeline builder: the forced
    /// family alone, or every variant with the preference intact.
    pub fn requested_codecs(&self) -> CodecSupport {
        if !self.force_codec {
            return CodecSupport::all_supported();
        }

        let mut mask = CodecSupport::none();
        for format in VideoFormat::ALL {
            let matches = matches!(
                (self.codec, format.family()),
                (CodecPreference::H264, crate::media::CodecFamily::H264)
                    | (CodecPreference::H265, crate::media::CodecFamily::H265)
                    | (CodecPreference::Av1, crate::media::CodecFamily::Av1)
            );
            if matches {
                mask.set(format, Support::Supported);
            }
        }
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut settings = StreamSettings::default();
        settings.canvas_renderer = true;
        settings.fps = 120;
        settings.save_to(&path).unwrap();

        let loaded = StreamSettings::load_from(&path).unwrap();
        assert!(loaded.canvas_renderer);
        assert_eq!(loaded.fps, 120);
        assert_eq!(loaded.size, SizePreset::FullHd);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.json");
        let settings = StreamSettings::load_from(&path).unwrap();
        assert_eq!(settings.fps, 60);
    }

    #[test]
    fn preset_and_custom_dimensions() {
        let mut settings = StreamSettings::default();
        assert_eq!(settings.dimensions(), (1920, 1080));

        settings.size = SizePreset::Custom;
        settings.custom_width = 2560;
        settings.custom_height = 1080;
        assert_eq!(settings.dimensions(), (2560, 1080));
    }

    #[test]
    fn forced_codec_restricts_mask() {
        let mut settings = StreamSettings::default();
        settings.codec = CodecPreference::Av1;
        settings.force_codec = true;

        let mask = settings.requested_codecs();
        assert!(mask.get(VideoFormat::Av1Main8).is_usable());
        assert!(!mask.get(VideoFormat::H264).is_usable());

        settings.force_codec = false;
        assert!(settings.requested_codecs().get(VideoFormat::H264).is_usable());
    }

    #[test]
    fn unknown_fields_ignored_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"fps": 30, "some_future_field": 1}"#).unwrap();
        let settings = StreamSettings::load_from(&path).unwrap();
        assert_eq!(settings.fps, 30);
    }
}
