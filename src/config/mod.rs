//! Engine Configuration
//!
//! Read-only settings for the translation core, stored in TOML format.
//! The orchestrator takes a snapshot of these at start; callers own the
//! settings store itself.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings consumed by the translation core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Translation behavior
    pub translation: TranslationSettings,
    /// OCR thresholds
    pub ocr: OcrSettings,
    /// Frame change detection and stabilization
    pub image_change: ImageChangeSettings,
    /// Capture driver options
    pub capture: CaptureSettings,
}

/// Translation-related settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationSettings {
    /// Source language (ISO-639-1 code or display name, canonicalized at the edges)
    pub source_language: String,
    /// Target language
    pub target_language: String,
    /// Live-mode loop interval in milliseconds
    pub auto_translation_interval_ms: u32,
    /// How long a single-shot translation stays on screen
    pub single_translation_display_seconds: u32,
    /// Cooldown after a completed translation before the next iteration runs
    pub post_translation_cooldown_seconds: u32,
    /// Restrict to the local engine (skips the cloud fork entirely)
    pub use_local_engine: bool,
    /// Merge OCR regions into line/paragraph chunks
    pub enable_text_grouping: bool,
    /// Keep paragraph structure when grouping lines
    pub preserve_paragraphs: bool,
    /// Vertical-center tolerance for same-line grouping, in line heights
    pub same_line_threshold: f32,
    /// Vertical gap that splits paragraphs, in line heights
    pub paragraph_separation_threshold: f32,
    /// Service-layer text-change threshold. Surfaced as configuration only;
    /// the pipeline gate uses its own authoritative 10% value.
    pub text_change_threshold: f32,
}

impl Default for TranslationSettings {
    fn default() -> Self {
        Self {
            source_language: "auto".to_string(),
            target_language: "en".to_string(),
            auto_translation_interval_ms: 100,
            single_translation_display_seconds: 5,
            post_translation_cooldown_seconds: 3,
            use_local_engine: false,
            enable_text_grouping: true,
            preserve_paragraphs: true,
            same_line_threshold: 0.5,
            paragraph_separation_threshold: 1.5,
            text_change_threshold: 0.10,
        }
    }
}

/// OCR-related settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrSettings {
    /// Minimum confidence for a detection to survive filtering (0.0 - 1.0)
    pub detection_threshold: f32,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            detection_threshold: 0.5,
        }
    }
}

/// Frame-change and stabilization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageChangeSettings {
    /// Change fraction above which stabilization engages (screen in transition)
    pub screen_stabilization_threshold: f32,
    /// Change fraction below which an engaged stabilization releases
    pub screen_stabilization_recovery_threshold: f32,
}

impl Default for ImageChangeSettings {
    fn default() -> Self {
        Self {
            screen_stabilization_threshold: 0.50,
            screen_stabilization_recovery_threshold: 0.35,
        }
    }
}

/// Defaults for the capture driver's options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// JPEG-style quality hint for drivers that downsample (1 - 100)
    pub quality: u8,
    /// Capture the cursor in frames
    pub include_cursor: bool,
    /// Driver-side capture interval in milliseconds
    pub interval_ms: u32,
    /// Driver optimization level (0 = off)
    pub optimization_level: u8,
    /// Margin applied around a learned region of interest
    pub roi_scale_factor: f32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            quality: 85,
            include_cursor: false,
            interval_ms: 100,
            optimization_level: 1,
            roi_scale_factor: 1.2,
        }
    }
}

/// Load settings from a TOML file
pub fn load_settings(path: &Path) -> Result<EngineSettings> {
    let content = std::fs::read_to_string(path)?;
    let settings: EngineSettings = toml::from_str(&content)?;
    Ok(settings)
}

/// Save settings to a TOML file
pub fn save_settings(settings: &EngineSettings, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(settings)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Map a language display name to its ISO-639-1 code.
///
/// Codes pass through unchanged (case-lowered); unknown names are returned
/// lowercased so downstream engines can decide how to handle them.
pub fn canonicalize_language(name: &str) -> String {
    let trimmed = name.trim();
    // Already a two-letter code
    if trimmed.len() == 2 && trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        return trimmed.to_ascii_lowercase();
    }
    match trimmed.to_ascii_lowercase().as_str() {
        "auto" | "detect" | "auto-detect" => "auto".to_string(),
        "english" => "en".to_string(),
        "japanese" => "ja".to_string(),
        "chinese" | "chinese (simplified)" | "simplified chinese" => "zh".to_string(),
        "chinese (traditional)" | "traditional chinese" => "zh-tw".to_string(),
        "korean" => "ko".to_string(),
        "french" => "fr".to_string(),
        "german" => "de".to_string(),
        "spanish" => "es".to_string(),
        "portuguese" => "pt".to_string(),
        "italian" => "it".to_string(),
        "russian" => "ru".to_string(),
        "arabic" => "ar".to_string(),
        "hindi" => "hi".to_string(),
        "indonesian" => "id".to_string(),
        "thai" => "th".to_string(),
        "vietnamese" => "vi".to_string(),
        "turkish" => "tr".to_string(),
        "polish" => "pl".to_string(),
        "dutch" => "nl".to_string(),
        "ukrainian" => "uk".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_settings() {
        let settings = EngineSettings::default();

        assert_eq!(settings.translation.auto_translation_interval_ms, 100);
        assert_eq!(settings.translation.single_translation_display_seconds, 5);
        assert_eq!(settings.translation.post_translation_cooldown_seconds, 3);
        assert!(!settings.translation.use_local_engine);
        assert!(settings.translation.enable_text_grouping);
        assert!(settings.translation.preserve_paragraphs);
        assert!((settings.translation.same_line_threshold - 0.5).abs() < 1e-6);
        assert!((settings.translation.paragraph_separation_threshold - 1.5).abs() < 1e-6);
        assert!((settings.translation.text_change_threshold - 0.10).abs() < 1e-6);

        assert!((settings.ocr.detection_threshold - 0.5).abs() < 1e-6);

        assert!((settings.image_change.screen_stabilization_threshold - 0.50).abs() < 1e-6);
        assert!(
            (settings.image_change.screen_stabilization_recovery_threshold - 0.35).abs() < 1e-6
        );
    }

    #[test]
    fn test_settings_round_trip() {
        let mut settings = EngineSettings::default();
        settings.translation.target_language = "ja".to_string();
        settings.translation.auto_translation_interval_ms = 250;
        settings.image_change.screen_stabilization_threshold = 0.6;

        let toml_str = toml::to_string_pretty(&settings).unwrap();
        let parsed: EngineSettings = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.translation.target_language, "ja");
        assert_eq!(parsed.translation.auto_translation_interval_ms, 250);
        assert!((parsed.image_change.screen_stabilization_threshold - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: EngineSettings = toml::from_str(
            r#"
            [translation]
            target_language = "fr"
            "#,
        )
        .unwrap();

        assert_eq!(parsed.translation.target_language, "fr");
        // Everything else falls back to defaults
        assert_eq!(parsed.translation.auto_translation_interval_ms, 100);
        assert!((parsed.ocr.detection_threshold - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_save_and_load_settings() {
        let settings = EngineSettings::default();
        let temp_file = NamedTempFile::new().unwrap();

        save_settings(&settings, temp_file.path()).unwrap();
        let loaded = load_settings(temp_file.path()).unwrap();

        assert_eq!(
            loaded.translation.target_language,
            settings.translation.target_language
        );
        assert_eq!(loaded.capture.quality, settings.capture.quality);
    }

    #[test]
    fn test_load_settings_invalid_toml() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), "this is not valid toml {{{{").unwrap();
        assert!(load_settings(temp_file.path()).is_err());
    }

    #[test]
    fn test_canonicalize_language() {
        assert_eq!(canonicalize_language("Japanese"), "ja");
        assert_eq!(canonicalize_language("chinese (simplified)"), "zh");
        assert_eq!(canonicalize_language("EN"), "en");
        assert_eq!(canonicalize_language("ja"), "ja");
        assert_eq!(canonicalize_language("Auto"), "auto");
        // Unknown names pass through lowercased
        assert_eq!(canonicalize_language("Klingon"), "klingon");
    }
}
