use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use nvsmi_core::{ExporterConfig, SmiConfig};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to launch {}: {source}", .binary.display())]
    Launch {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} exited with code {code:?}: {stderr}", .binary.display())]
    ExitStatus {
        binary: PathBuf,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Failed to read fixture {}: {source}", .path.display())]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Produces one raw `nvidia-smi -q -x` document per call.
#[async_trait]
pub trait SmiSource: Send + Sync {
    async fn query(&self) -> Result<Vec<u8>, SourceError>;

    /// Human readable origin, used in logs
    fn describe(&self) -> String;
}

/// Runs the nvidia-smi binary and captures its stdout.
pub struct CommandSource {
    binary: PathBuf,
    args: Vec<String>,
}

impl CommandSource {
    pub fn new(binary: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            binary: binary.into(),
            args,
        }
    }

    pub fn from_smi_config(config: &SmiConfig) -> Self {
        Self::new(config.binary.clone(), config.args.clone())
    }
}

#[async_trait]
impl SmiSource for CommandSource {
    #[instrument(skip(self), fields(binary = %self.binary.display()))]
    async fn query(&self) -> Result<Vec<u8>, SourceError> {
        let output = Command::new(&self.binary)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(out) => out,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("nvidia-smi not found - is the NVIDIA driver installed?");
                return Err(SourceError::Launch {
                    binary: self.binary.clone(),
                    source: e,
                });
            }
            Err(e) => {
                debug!("nvidia-smi execution failed: {}", e);
                return Err(SourceError::Launch {
                    binary: self.binary.clone(),
                    source: e,
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            debug!(status = %output.status, "nvidia-smi exited unsuccessfully");
            return Err(SourceError::ExitStatus {
                binary: self.binary.clone(),
                code: output.status.code(),
                stderr,
            });
        }

        debug!(bytes = output.stdout.len(), "nvidia-smi executed successfully");
        Ok(output.stdout)
    }

    fn describe(&self) -> String {
        let mut line = self.binary.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Serves a captured nvidia-smi document from disk. The file is re-read on
/// every query so it can be edited while the exporter runs.
pub struct FixtureSource {
    path: PathBuf,
}

impl FixtureSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SmiSource for FixtureSource {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn query(&self) -> Result<Vec<u8>, SourceError> {
        tokio::fs::read(&self.path)
            .await
            .map_err(|source| SourceError::Fixture {
                path: self.path.clone(),
                source,
            })
    }

    fn describe(&self) -> String {
        format!("fixture {}", self.path.display())
    }
}

/// Picks the fixture in test mode, the binary otherwise.
pub fn build_source(config: &ExporterConfig) -> Arc<dyn SmiSource> {
    if config.test_mode {
        Arc::new(FixtureSource::new(config.smi.fixture_path.clone()))
    } else {
        Arc::new(CommandSource::from_smi_config(&config.smi))
    }
}
