//! Settings for the gateway and the worker
//!
//! Defaults are overridden by an optional TOML file and then by
//! `PARLEY__SECTION__KEY` environment variables.

use crate::{ParleyError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const ENV_PREFIX: &str = "PARLEY__";

/// Complete settings tree
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub heartbeat: HeartbeatConfig,
    pub inference_service: InferenceServiceConfig,
    pub voice_chat: VoiceChatConfig,
    pub worker: WorkerConfig,
}

/// Gateway HTTP listener
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8021,
        }
    }
}

/// Heartbeat monitor timing and its cross-instance lease
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub lock_key: String,
    /// Lease expiry in seconds
    pub lock_timeout: u64,
    /// Seconds between probe passes
    pub monitoring_interval: u64,
    /// Seconds between expired-lock sweeps
    pub cleanup_interval: u64,
    /// Per-probe timeout in seconds
    pub probe_timeout: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            lock_key: "inference:heartbeat:lock".to_string(),
            lock_timeout: 20,
            monitoring_interval: 10,
            cleanup_interval: 20,
            probe_timeout: 5,
        }
    }
}

impl HeartbeatConfig {
    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_secs(self.monitoring_interval)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_timeout)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout)
    }
}

/// Service registry limits
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceServiceConfig {
    /// A service whose last heartbeat is older than this (seconds) is unhealthy
    pub heartbeat_timeout: i64,
    /// A BUSY lock older than this (seconds) is swept
    pub lock_timeout: i64,
    /// Optional JSON snapshot of the registry
    pub store_path: Option<PathBuf>,
}

impl Default for InferenceServiceConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: 20,
            lock_timeout: 200,
            store_path: None,
        }
    }
}

/// Per-session turn-taking and media parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceChatConfig {
    pub enable_voice_interruption: bool,
    pub voice_interruption_threshold: f32,
    pub vad_workers: usize,
    /// Full-window score that starts an utterance
    pub vad_onset: f32,
    /// Full-window score below which an utterance may end
    pub vad_offset: f32,
    /// Minimum utterance length before silence is confirmed
    pub vad_hold_ms: u64,
    /// Consecutive low tail scores needed to race ahead
    pub race_debounce: u32,
    /// Delay between duplex generate start and first audio
    pub duplex_initial_delay_ms: u64,
    pub resource_check_interval: u64,
    pub image_interval_ms: u64,
    pub image_interval_high_fps_ms: u64,
    pub token_ttl: u64,
    pub audio_input_queue: usize,
    pub audio_output_queue: usize,
    pub text_queue: usize,
    /// 20 ms frames buffered toward the front end before frames are dropped
    pub outbound_frame_queue: usize,
}

impl Default for VoiceChatConfig {
    fn default() -> Self {
        Self {
            enable_voice_interruption: false,
            voice_interruption_threshold: 0.85,
            vad_workers: 10,
            vad_onset: 0.4,
            vad_offset: 0.1,
            vad_hold_ms: 300,
            race_debounce: 2,
            duplex_initial_delay_ms: 1000,
            resource_check_interval: 3,
            image_interval_ms: 850,
            image_interval_high_fps_ms: 180,
            token_ttl: 600,
            audio_input_queue: 1000,
            audio_output_queue: 1000,
            text_queue: 200,
            outbound_frame_queue: 50,
        }
    }
}

impl VoiceChatConfig {
    pub fn image_interval(&self, high_fps: bool) -> Duration {
        if high_fps {
            Duration::from_millis(self.image_interval_high_fps_ms)
        } else {
            Duration::from_millis(self.image_interval_ms)
        }
    }

    pub fn resource_check_interval(&self) -> Duration {
        Duration::from_secs(self.resource_check_interval)
    }
}

/// Backend bridge settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub host: String,
    pub port: u16,
    pub engine_host: String,
    /// Defaults to `port + 10000`
    pub engine_port: Option<u16>,
    pub engine_binary: Option<PathBuf>,
    pub engine_args: Vec<String>,
    pub model_dir: PathBuf,
    pub output_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub register_url: Option<String>,
    pub advertise_ip: Option<String>,
    pub service_name: String,
    pub duplex: bool,
    pub gpu_check_enabled: bool,
    pub gpu_memory_threshold_mb: u64,
    pub prefill_timeout: u64,
    pub decode_timeout: u64,
    pub simplex_poll_ms: u64,
    pub duplex_poll_ms: u64,
    /// Polls without a new artifact after decode finished with no output
    pub simplex_idle_polls: u32,
    pub duplex_final_wait_ms: u64,
    pub duplex_final_idle_polls: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8060,
            engine_host: "127.0.0.1".to_string(),
            engine_port: None,
            engine_binary: None,
            engine_args: Vec::new(),
            model_dir: PathBuf::from("models"),
            output_dir: PathBuf::from("output"),
            temp_dir: PathBuf::from("temp_streaming_prefill"),
            register_url: None,
            advertise_ip: None,
            service_name: "o45-cpp".to_string(),
            duplex: false,
            gpu_check_enabled: false,
            gpu_memory_threshold_mb: 2000,
            prefill_timeout: 30,
            decode_timeout: 600,
            simplex_poll_ms: 10,
            duplex_poll_ms: 50,
            simplex_idle_polls: 1000,
            duplex_final_wait_ms: 3000,
            duplex_final_idle_polls: 10,
        }
    }
}

impl WorkerConfig {
    pub fn engine_port(&self) -> u16 {
        self.engine_port
            .unwrap_or_else(|| self.port.saturating_add(10000))
    }

    pub fn engine_url(&self) -> String {
        format!("http://{}:{}", self.engine_host, self.engine_port())
    }

    pub fn side_port(&self) -> u16 {
        self.port.saturating_add(1)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_duplex(mut self, duplex: bool) -> Self {
        self.duplex = duplex;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }
}

impl Settings {
    /// Load defaults, then the TOML file (if any), then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut tree = toml::Value::try_from(Settings::default())
            .map_err(|e| ParleyError::ConfigError(format!("Failed to encode defaults: {}", e)))?;

        if let Some(path) = path {
            let text = std::fs::read_to_string(path).map_err(|e| {
                ParleyError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
            })?;
            let file: toml::Value = toml::from_str(&text).map_err(|e| {
                ParleyError::ConfigError(format!("Failed to parse {}: {}", path.display(), e))
            })?;
            merge(&mut tree, file);
            info!("Loaded settings from {}", path.display());
        }

        apply_env_overrides(&mut tree, std::env::vars());

        let settings: Settings = tree
            .try_into()
            .map_err(|e| ParleyError::ConfigError(format!("Invalid settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let vc = &self.voice_chat;
        if vc.vad_offset >= vc.vad_onset {
            return Err(ParleyError::ConfigError(format!(
                "vad_offset ({}) must be below vad_onset ({})",
                vc.vad_offset, vc.vad_onset
            )));
        }
        if !(0.0..=1.0).contains(&vc.voice_interruption_threshold) {
            return Err(ParleyError::ConfigError(
                "voice_interruption_threshold must be within 0.0..=1.0".into(),
            ));
        }
        if vc.vad_workers == 0 {
            return Err(ParleyError::ConfigError("vad_workers must be at least 1".into()));
        }
        if vc.race_debounce == 0 {
            return Err(ParleyError::ConfigError("race_debounce must be at least 1".into()));
        }
        if vc.audio_input_queue == 0
            || vc.audio_output_queue == 0
            || vc.text_queue == 0
            || vc.outbound_frame_queue == 0
        {
            return Err(ParleyError::ConfigError("queue sizes must be non-zero".into()));
        }
        if self.heartbeat.monitoring_interval == 0 {
            return Err(ParleyError::ConfigError(
                "heartbeat.monitoring_interval must be non-zero".into(),
            ));
        }
        if self.worker.port == u16::MAX {
            return Err(ParleyError::ConfigError(
                "worker.port leaves no room for the side listener".into(),
            ));
        }
        Ok(())
    }
}

fn merge(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn apply_env_overrides(tree: &mut toml::Value, vars: impl Iterator<Item = (String, String)>) {
    for (name, raw) in vars {
        let Some(rest) = name.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let path: Vec<String> = rest.split("__").map(|s| s.to_ascii_lowercase()).collect();
        if path.iter().any(|s| s.is_empty()) {
            continue;
        }

        // Parse as a TOML literal so numbers and booleans keep their type
        let value = toml::from_str::<toml::Table>(&format!("v = {}", raw))
            .ok()
            .and_then(|mut t| t.remove("v"))
            .unwrap_or(toml::Value::String(raw));

        let mut cursor = &mut *tree;
        for (i, segment) in path.iter().enumerate() {
            let toml::Value::Table(table) = cursor else {
                break;
            };
            if i + 1 == path.len() {
                debug!("Env override {} applied", name);
                table.insert(segment.clone(), value.clone());
                break;
            }
            cursor = table
                .entry(segment.clone())
                .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 8021);
        assert_eq!(settings.heartbeat.lock_key, "inference:heartbeat:lock");
        assert_eq!(settings.inference_service.lock_timeout, 200);
        assert!(!settings.voice_chat.enable_voice_interruption);
        assert_eq!(settings.voice_chat.voice_interruption_threshold, 0.85);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_engine_port_defaults_to_offset() {
        let worker = WorkerConfig::default().with_port(8060);
        assert_eq!(worker.engine_port(), 18060);
        assert_eq!(worker.side_port(), 8061);
        assert_eq!(worker.engine_url(), "http://127.0.0.1:18060");
    }

    #[test]
    fn test_file_and_env_layering() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 9000\n[voice_chat]\nvad_race_unused = 1").unwrap();

        let mut tree = toml::Value::try_from(Settings::default()).unwrap();
        let text = std::fs::read_to_string(file.path()).unwrap();
        merge(&mut tree, toml::from_str(&text).unwrap());
        apply_env_overrides(
            &mut tree,
            vec![
                ("PARLEY__VOICE_CHAT__ENABLE_VOICE_INTERRUPTION".to_string(), "true".to_string()),
                ("PARLEY__WORKER__REGISTER_URL".to_string(), "http://gw:8021".to_string()),
                ("UNRELATED".to_string(), "x".to_string()),
            ]
            .into_iter(),
        );
        let settings: Settings = tree.try_into().unwrap();

        assert_eq!(settings.server.port, 9000);
        assert!(settings.voice_chat.enable_voice_interruption);
        assert_eq!(settings.worker.register_url.as_deref(), Some("http://gw:8021"));
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let mut settings = Settings::default();
        settings.voice_chat.vad_offset = 0.5;
        assert!(settings.validate().is_err());
    }
}
