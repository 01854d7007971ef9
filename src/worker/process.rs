//! Engine process lifecycle and the GPU memory guard

use super::driver::{reset_output_dir, Driver};
use crate::config::WorkerConfig;
use crate::{ParleyError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const HEALTH_WAIT: Duration = Duration::from_secs(180);
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Pick the LLM weights in `model_dir`: preferred quantizations first, then
/// any `.gguf` that is not an audio/vision/tts/projector file
pub fn detect_llm_model(model_dir: &Path) -> Option<PathBuf> {
    let mut files: Vec<String> = std::fs::read_dir(model_dir)
        .ok()?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name.ends_with(".gguf"))
        .collect();
    files.sort();

    for tag in ["Q4_K_M", "Q4_K_S", "Q8_0", "Q5_K_M", "F16"] {
        if let Some(name) = files.iter().find(|name| name.contains(tag)) {
            return Some(model_dir.join(name));
        }
    }
    files
        .iter()
        .find(|name| {
            let lower = name.to_lowercase();
            !["audio", "vision", "tts", "projector"]
                .iter()
                .any(|skip| lower.contains(skip))
        })
        .map(|name| model_dir.join(name))
}

/// The engine server binary, run as a child process
pub struct EngineProcess {
    binary: PathBuf,
    args: Vec<String>,
    health_url: String,
    child: Option<Child>,
}

impl EngineProcess {
    /// `None` when no binary is configured and the engine is managed elsewhere
    pub fn from_config(config: &WorkerConfig) -> Result<Option<Self>> {
        let Some(binary) = config.engine_binary.clone() else {
            return Ok(None);
        };
        let model = detect_llm_model(&config.model_dir).ok_or_else(|| {
            ParleyError::ConfigError(format!(
                "No LLM model found in {}",
                config.model_dir.display()
            ))
        })?;

        let mut args = vec![
            "--host".to_string(),
            "0.0.0.0".to_string(),
            "--port".to_string(),
            config.engine_port().to_string(),
            "--model".to_string(),
            model.to_string_lossy().to_string(),
            "--ctx-size".to_string(),
            "8192".to_string(),
            "--n-gpu-layers".to_string(),
            "99".to_string(),
        ];
        args.extend(config.engine_args.iter().cloned());

        Ok(Some(Self {
            binary,
            args,
            health_url: format!("{}/health", config.engine_url()),
            child: None,
        }))
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// Spawn the engine and wait until `/health` answers
    pub async fn start(&mut self) -> Result<()> {
        if !self.binary.exists() {
            return Err(ParleyError::ConfigError(format!(
                "Engine binary not found: {}",
                self.binary.display()
            )));
        }

        info!("Starting engine: {} {}", self.binary.display(), self.args.join(" "));
        let mut child = Command::new(&self.binary)
            .args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr));
        }
        self.child = Some(child);

        let client = reqwest::Client::new();
        let deadline = tokio::time::Instant::now() + HEALTH_WAIT;
        while tokio::time::Instant::now() < deadline {
            if let Ok(resp) = client
                .get(&self.health_url)
                .timeout(Duration::from_secs(2))
                .send()
                .await
            {
                if resp.status().is_success() {
                    info!("Engine is healthy");
                    return Ok(());
                }
            }
            if let Some(child) = self.child.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    self.child = None;
                    return Err(ParleyError::backend(
                        None,
                        format!("engine exited during startup: {}", status),
                    ));
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        Err(ParleyError::backend(
            None,
            format!("engine not healthy after {}s", HEALTH_WAIT.as_secs()),
        ))
    }

    /// SIGTERM, then SIGKILL after a grace period
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Some(pid) = child.id() {
            let _ = Command::new("kill")
                .arg("-TERM")
                .arg(pid.to_string())
                .status()
                .await;
        }
        match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
            Ok(Ok(status)) => info!("Engine stopped: {}", status),
            _ => {
                warn!("Engine did not exit in time, killing it");
                if let Err(e) = child.kill().await {
                    error!("Failed to kill engine: {}", e);
                }
            }
        }
    }
}

async fn forward_lines<R: tokio::io::AsyncRead + Unpin>(reader: R) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "parley::engine", "{}", line);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GpuMemory {
    pub total_mb: u64,
    pub used_mb: u64,
    pub free_mb: u64,
}

/// Parse one `total, used, free` line of `nvidia-smi` CSV output
pub fn parse_gpu_memory(output: &str) -> Option<GpuMemory> {
    let line = output.lines().next()?;
    let parts: Vec<u64> = line
        .split(',')
        .map(|p| p.trim().parse::<u64>())
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    match parts.as_slice() {
        [total_mb, used_mb, free_mb, ..] => Some(GpuMemory {
            total_mb: *total_mb,
            used_mb: *used_mb,
            free_mb: *free_mb,
        }),
        _ => None,
    }
}

#[async_trait]
pub trait MemoryProbe: Send + Sync {
    async fn query(&self) -> Option<GpuMemory>;
}

/// Queries the first GPU in `CUDA_VISIBLE_DEVICES`
pub struct NvidiaSmi;

#[async_trait]
impl MemoryProbe for NvidiaSmi {
    async fn query(&self) -> Option<GpuMemory> {
        let gpu_id = std::env::var("CUDA_VISIBLE_DEVICES")
            .ok()
            .and_then(|v| v.split(',').next().map(str::to_string))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "0".to_string());

        let output = tokio::time::timeout(
            Duration::from_secs(5),
            Command::new("nvidia-smi")
                .arg("--query-gpu=memory.total,memory.used,memory.free")
                .arg("--format=csv,noheader,nounits")
                .arg(format!("--id={}", gpu_id))
                .output(),
        )
        .await
        .ok()?
        .ok()?;

        if !output.status.success() {
            debug!("nvidia-smi exited with {}", output.status);
            return None;
        }
        parse_gpu_memory(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Restarts the engine when GPU memory runs low
pub struct Supervisor {
    driver: Arc<Driver>,
    process: Mutex<Option<EngineProcess>>,
    probe: Arc<dyn MemoryProbe>,
    restart_lock: Mutex<()>,
    restart_pause: Duration,
}

impl Supervisor {
    pub fn new(driver: Arc<Driver>, process: Option<EngineProcess>, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            driver,
            process: Mutex::new(process),
            probe,
            restart_lock: Mutex::new(()),
            restart_pause: Duration::from_secs(2),
        }
    }

    pub fn with_restart_pause(mut self, pause: Duration) -> Self {
        self.restart_pause = pause;
        self
    }

    pub fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }

    pub async fn start_engine(&self) -> Result<()> {
        if let Some(process) = self.process.lock().await.as_mut() {
            process.start().await?;
        }
        Ok(())
    }

    pub async fn stop_engine(&self) {
        if let Some(process) = self.process.lock().await.as_mut() {
            process.stop().await;
        }
    }

    /// Check free GPU memory and restart below the threshold. Returns true
    /// if a restart ran.
    pub async fn check_memory(&self) -> bool {
        let config = self.driver.config();
        if !config.gpu_check_enabled {
            return false;
        }
        let threshold = config.gpu_memory_threshold_mb;

        let Some(memory) = self.probe.query().await else {
            return false;
        };
        if memory.free_mb >= threshold {
            debug!(free_mb = memory.free_mb, "GPU memory ok");
            return false;
        }

        warn!(free_mb = memory.free_mb, threshold, "GPU memory low");
        let _guard = self.restart_lock.lock().await;
        // Another restart may have freed memory while we waited
        if let Some(memory) = self.probe.query().await {
            if memory.free_mb >= threshold {
                return false;
            }
        }

        match self.restart().await {
            Ok(()) => true,
            Err(e) => {
                error!("Engine restart failed: {}", e);
                false
            }
        }
    }

    /// Stop, reset output and session state, relaunch, re-create the
    /// engine context. Requests are rejected while this runs.
    pub async fn restart(&self) -> Result<()> {
        self.driver.set_restarting(true);
        let result = async {
            info!("Restarting engine");
            self.stop_engine().await;
            tokio::time::sleep(self.restart_pause).await;
            reset_output_dir(&self.driver.config().output_dir)?;
            self.driver.reset_for_restart().await;
            self.start_engine().await?;
            self.driver.reinitialize_engine().await
        }
        .await;
        self.driver.set_restarting(false);

        match &result {
            Ok(()) => info!("Engine restart complete"),
            Err(e) => error!("Engine restart incomplete: {}", e),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gpu_memory() {
        assert_eq!(
            parse_gpu_memory("24576, 22800, 1776\n"),
            Some(GpuMemory {
                total_mb: 24576,
                used_mb: 22800,
                free_mb: 1776
            })
        );
        assert_eq!(parse_gpu_memory(""), None);
        assert_eq!(parse_gpu_memory("N/A, 1, 2"), None);
        assert_eq!(parse_gpu_memory("1, 2"), None);
    }

    #[test]
    fn test_detect_llm_model() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["audio-encoder.gguf", "Model-F16.gguf", "Model-Q4_K_M.gguf", "readme.md"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        assert_eq!(
            detect_llm_model(dir.path()),
            Some(dir.path().join("Model-Q4_K_M.gguf"))
        );

        let other = tempfile::tempdir().unwrap();
        std::fs::write(other.path().join("tts-model.gguf"), b"").unwrap();
        std::fs::write(other.path().join("omni.gguf"), b"").unwrap();
        assert_eq!(detect_llm_model(other.path()), Some(other.path().join("omni.gguf")));
    }
}
