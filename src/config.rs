//! Configuration loading and merging for the recorder.
//!
//! Configuration comes from an optional TOML file merged with CLI
//! overrides; every field has a sensible default so the recorder runs with
//! no file at all.

use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default plugin execution timeout in seconds.
pub const DEFAULT_PLUGIN_TIMEOUT_SECS: u64 = 5;

/// Main configuration for the `record` subcommand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// WebSocket base URL of the STT server.
    pub server_url: String,
    /// API key sent in the `kyutai-api-key` header.
    pub api_key: String,
    /// Directory transcripts are written into.
    pub output_dir: String,
    /// strftime-style filename template (`%Y %m %d %H %M %S`).
    pub filename_template: String,
    /// Gain multiplier applied to captured samples before clipping.
    pub gain: f64,
    /// Input device index; -1 selects the OS default device.
    pub device_index: i32,
    /// Reserved: pause streaming on VAD end-of-turn.
    pub vad_pause: bool,
    /// Seconds of silence after which a line break is inserted.
    pub pause_threshold: f64,
    /// Seconds of dead air after which the connection is recycled; 0 disables.
    pub dead_air_reset: f64,
    /// Verbose stderr output.
    pub debug: bool,
    pub metadata: MetadataConfig,
}

/// Configuration for the metadata sidecars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Seconds between `%% time:` heartbeat lines; 0 disables the heartbeat.
    pub heartbeat_interval: u64,
    /// Detect Zoom meetings and write start/end markers.
    pub zoom_detection: bool,
    /// Detect Google Meet meetings and write start/end markers.
    pub meet_detection: bool,
    /// External plugins executed at lifecycle events.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<PluginConfig>,
}

/// An external plugin executed at a lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Tag used on the `%% <name>:` metadata lines this plugin produces.
    pub name: String,
    /// Shell command to execute.
    pub command: String,
    /// When the plugin runs.
    pub trigger: Trigger,
    /// Seconds between runs (periodic trigger only).
    #[serde(default)]
    pub interval: u64,
    /// Seconds the plugin may run before being killed.
    #[serde(default = "default_plugin_timeout")]
    pub timeout: u64,
}

fn default_plugin_timeout() -> u64 {
    DEFAULT_PLUGIN_TIMEOUT_SECS
}

/// Lifecycle event a plugin is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    OnStart,
    OnMeetingStart,
    OnMeetingEnd,
    Periodic,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Trigger::OnStart => "on_start",
            Trigger::OnMeetingStart => "on_meeting_start",
            Trigger::OnMeetingEnd => "on_meeting_end",
            Trigger::Periodic => "periodic",
        };
        f.write_str(name)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8080".to_string(),
            api_key: "public_token".to_string(),
            output_dir: ".".to_string(),
            filename_template: "transcript_%Y%m%d_%H%M%S.txt".to_string(),
            gain: 1.0,
            device_index: -1,
            vad_pause: false,
            pause_threshold: 2.0,
            dead_air_reset: 0.0,
            debug: false,
            metadata: MetadataConfig::default(),
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: 60,
            zoom_detection: false,
            meet_detection: false,
            plugins: Vec::new(),
        }
    }
}

/// CLI values that override file configuration when explicitly given.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub server_url: Option<String>,
    pub api_key: Option<String>,
    pub output_dir: Option<String>,
    pub filename_template: Option<String>,
    pub gain: Option<f64>,
    pub device_index: Option<i32>,
    pub vad_pause: Option<bool>,
    pub pause_threshold: Option<f64>,
    pub dead_air_reset: Option<f64>,
    pub debug: Option<bool>,
    pub heartbeat_interval: Option<u64>,
    pub zoom_detection: Option<bool>,
    pub meet_detection: Option<bool>,
}

impl Config {
    /// Load configuration from a TOML file. A missing file yields defaults;
    /// an unreadable or invalid file is an error.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file as TOML")
    }

    /// Apply CLI overrides on top of file values.
    pub fn merge(mut self, overrides: &Overrides) -> Self {
        if let Some(v) = &overrides.server_url {
            self.server_url = v.clone();
        }
        if let Some(v) = &overrides.api_key {
            self.api_key = v.clone();
        }
        if let Some(v) = &overrides.output_dir {
            self.output_dir = v.clone();
        }
        if let Some(v) = &overrides.filename_template {
            self.filename_template = v.clone();
        }
        if let Some(v) = overrides.gain {
            self.gain = v;
        }
        if let Some(v) = overrides.device_index {
            self.device_index = v;
        }
        if let Some(v) = overrides.vad_pause {
            self.vad_pause = v;
        }
        if let Some(v) = overrides.pause_threshold {
            self.pause_threshold = v;
        }
        if let Some(v) = overrides.dead_air_reset {
            self.dead_air_reset = v;
        }
        if let Some(v) = overrides.debug {
            self.debug = v;
        }
        if let Some(v) = overrides.heartbeat_interval {
            self.metadata.heartbeat_interval = v;
        }
        if let Some(v) = overrides.zoom_detection {
            self.metadata.zoom_detection = v;
        }
        if let Some(v) = overrides.meet_detection {
            self.metadata.meet_detection = v;
        }
        self
    }

    /// Check invariants that would otherwise surface deep in the pipeline.
    pub fn validate(&self) -> Result<()> {
        if self.server_url.is_empty() {
            bail!("server URL is required");
        }
        if self.gain <= 0.0 {
            bail!("gain must be positive");
        }
        if self.pause_threshold < 0.0 {
            bail!("pause threshold must be non-negative");
        }
        if self.dead_air_reset < 0.0 {
            bail!("dead-air reset threshold must be non-negative");
        }
        Ok(())
    }

    /// Resolve the transcript path for a session starting at `now`.
    pub fn output_path(&self, now: NaiveDateTime) -> PathBuf {
        let filename = expand_filename_template(&self.filename_template, now);
        expand_path(&self.output_dir).join(filename)
    }
}

/// Locate the config file: an explicit path wins, then the standard
/// locations in order of preference.
pub fn find_config_file(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    let mut locations = vec![PathBuf::from(".localscribe.toml")];
    if let Some(config) = dirs::config_dir() {
        locations.push(config.join("localscribe").join("config.toml"));
    }
    if let Some(home) = dirs::home_dir() {
        locations.push(home.join(".localscribe.toml"));
    }

    locations.into_iter().find(|p| p.exists())
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_path(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand the strftime-lite placeholders supported by filename templates.
pub fn expand_filename_template(template: &str, now: NaiveDateTime) -> String {
    let replacements = [
        ("%Y", now.format("%Y").to_string()),
        ("%m", now.format("%m").to_string()),
        ("%d", now.format("%d").to_string()),
        ("%H", now.format("%H").to_string()),
        ("%M", now.format("%M").to_string()),
        ("%S", now.format("%S").to_string()),
    ];

    let mut result = template.to_string();
    for (placeholder, value) in replacements {
        result = result.replace(placeholder, &value);
    }
    result
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
