//! Settings storage
//!
//! Session settings persisted as JSON in the data directory.

use crate::inference::backend::{ContextConfig, SamplerConfig, DEFAULT_CONTEXT_SIZE, MIN_CONTEXT_SIZE};
use crate::inference::session::{LengthLimit, SessionOptions};
use crate::inference::stop::{DEFAULT_STOP_MARKERS, DEFAULT_STOP_STRINGS};
use crate::inference::worker::TurnDefaults;
use crate::storage::{get_data_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Settings for one inference session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Decode threads; `None` picks from the core count
    pub threads: Option<u32>,
    /// KV cache size in tokens
    pub context_size: u32,
    /// Slots in the decode batch (and llama's n_batch)
    pub batch_capacity: u32,
    pub max_sequences: u32,
    /// Number of GPU layers to offload (0 = CPU only)
    pub gpu_layers: u32,
    /// Ceiling on the length of one turn
    pub max_new_tokens: usize,
    pub length_limit: LengthLimit,
    /// Parse `<|im_start|>` and friends in prompts as control tokens
    pub parse_special: bool,
    pub reject_long_prompts: bool,
    pub clear_cache_between_turns: bool,
    pub stop_strings: Vec<String>,
    pub stop_markers: Vec<String>,
    /// System prompt prepended to conversations
    pub system_prompt: String,
    pub sampler: SamplerConfig,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            threads: None,
            context_size: DEFAULT_CONTEXT_SIZE,
            batch_capacity: 512,
            max_sequences: 1,
            gpu_layers: 0,
            max_new_tokens: 512,
            length_limit: LengthLimit::Generated,
            parse_special: true,
            reject_long_prompts: false,
            clear_cache_between_turns: true,
            stop_strings: DEFAULT_STOP_STRINGS.iter().map(|s| s.to_string()).collect(),
            stop_markers: DEFAULT_STOP_MARKERS.iter().map(|s| s.to_string()).collect(),
            system_prompt: "You are a helpful AI assistant.".to_string(),
            sampler: SamplerConfig::default(),
        }
    }
}

impl SessionSettings {
    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges
    pub fn validate(&mut self) {
        if self.threads == Some(0) {
            self.threads = None;
        }
        self.context_size = self.context_size.max(MIN_CONTEXT_SIZE);

        if self.batch_capacity == 0 {
            self.batch_capacity = 512;
        }
        if self.max_sequences == 0 {
            self.max_sequences = 1;
        }
        if self.max_new_tokens == 0 {
            self.max_new_tokens = 512;
        }

        // Marker scanning needs at least one marker
        self.stop_markers.retain(|m| !m.is_empty());
        if self.stop_markers.is_empty() {
            self.stop_markers = DEFAULT_STOP_MARKERS.iter().map(|s| s.to_string()).collect();
        }
        self.stop_strings.retain(|s| !s.is_empty());

        let sampler = &mut self.sampler;
        sampler.temperature = sampler.temperature.clamp(0.0, 2.0);
        sampler.top_p = sampler.top_p.clamp(0.0, 1.0);
        sampler.min_p = sampler.min_p.clamp(0.0, 1.0);
        sampler.penalty_last_n = sampler.penalty_last_n.max(-1);
    }

    /// Options the session is built with
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            context: ContextConfig {
                threads: self.threads,
                context_size: self.context_size,
                batch_capacity: self.batch_capacity,
                max_sequences: self.max_sequences,
            },
            gpu_layers: self.gpu_layers,
            sampler: self.sampler.clone(),
            stop_strings: self.stop_strings.clone(),
            stop_markers: self.stop_markers.clone(),
            length_limit: self.length_limit,
            reject_long_prompts: self.reject_long_prompts,
        }
    }

    pub fn turn_defaults(&self) -> TurnDefaults {
        TurnDefaults {
            max_new_tokens: self.max_new_tokens,
            parse_special: self.parse_special,
            clear_cache_between_turns: self.clear_cache_between_turns,
        }
    }
}

/// Get the settings file path
pub fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> SessionSettings {
    let result = get_settings_path().and_then(|path| load_settings_from(&path));
    match result {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            SessionSettings::default()
        }
    }
}

/// Loads and validates settings from `path`. A missing file gives defaults.
pub fn load_settings_from(path: &Path) -> Result<SessionSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(SessionSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: SessionSettings = serde_json::from_str(&json)?;

    // Validate loaded settings
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to the data directory
pub fn save_settings(settings: &SessionSettings) -> Result<(), StorageError> {
    save_settings_to(settings, &get_settings_path()?)
}

pub fn save_settings_to(settings: &SessionSettings, path: &Path) -> Result<(), StorageError> {
    // Ensure the parent directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = SessionSettings::default();
        assert_eq!(settings.context_size, 1024);
        assert_eq!(settings.max_new_tokens, 512);
        assert_eq!(settings.length_limit, LengthLimit::Generated);
        assert!(settings.parse_special);
        assert!(settings.clear_cache_between_turns);
        assert_eq!(settings.stop_markers, vec!["<|im_end|>".to_string()]);
        assert_eq!(settings.sampler.seed, 0xFFFF_FFFF);
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = SessionSettings::default();
        settings.threads = Some(0);
        settings.context_size = 16;
        settings.batch_capacity = 0;
        settings.stop_markers = vec![String::new()];
        settings.sampler.temperature = 5.0;
        settings.sampler.top_p = 2.0;
        settings.validate();

        assert_eq!(settings.threads, None);
        assert_eq!(settings.context_size, MIN_CONTEXT_SIZE);
        assert_eq!(settings.batch_capacity, 512);
        assert_eq!(settings.stop_markers, vec!["<|im_end|>".to_string()]);
        assert_eq!(settings.sampler.temperature, 2.0);
        assert_eq!(settings.sampler.top_p, 1.0);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let settings: SessionSettings =
            serde_json::from_str(r#"{"context_size": 2048, "length_limit": "absolute"}"#).unwrap();
        assert_eq!(settings.context_size, 2048);
        assert_eq!(settings.length_limit, LengthLimit::Absolute);
        assert_eq!(settings.max_new_tokens, 512);
    }

    #[test]
    fn test_settings_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = SessionSettings::default();
        settings.threads = Some(6);
        settings.system_prompt = "Answer in French.".to_string();
        save_settings_to(&settings, &path).unwrap();

        let loaded = load_settings_from(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_settings_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(loaded, SessionSettings::default());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            load_settings_from(&path),
            Err(StorageError::JsonError(_))
        ));
    }

    #[test]
    fn test_options_follow_settings() {
        let mut settings = SessionSettings::default();
        settings.context_size = 4096;
        settings.gpu_layers = 99;
        settings.reject_long_prompts = true;

        let options = settings.session_options();
        assert_eq!(options.context.context_size, 4096);
        assert_eq!(options.gpu_layers, 99);
        assert!(options.reject_long_prompts);

        let defaults = settings.turn_defaults();
        assert_eq!(defaults.max_new_tokens, 512);
    }
}
