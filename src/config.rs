use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::database::Role;
use crate::sandbox::{Language, default_languages};

const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";
const DEFAULT_BIND_PORT: u16 = 12345;
const DEFAULT_TIME_LIMIT: MicroSecond = MicroSecond(5_000_000);
const DEFAULT_OUTPUT_LIMIT: ByteSize = ByteSize(1024 * 1024);
const DEFAULT_SWEEP_INTERVAL: Second = Second(60);
const DEFAULT_OPEN_FILES: u64 = 256;
const DEFAULT_FILE_SIZE: ByteSize = ByteSize(16 * 1024 * 1024);
const DEFAULT_ADDRESS_SPACE: ByteSize = ByteSize(4 * 1024 * 1024 * 1024);

#[derive(Parser)]
#[command(name = "coderun", version = "0.1", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: String,

    /// Whether to flush the existing identity database
    #[arg(long = "flush-data", short = 'f', default_value_t = false)]
    pub flush_data: bool,
}

impl CliArgs {
    /// Load the configuration from the specified file
    pub fn to_config(&self) -> std::io::Result<Config> {
        let file = std::fs::File::open(&self.config_path)?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| e.into())
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        self.bind_address
            .clone()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string())
    }

    pub fn bind_port(&self) -> u16 {
        self.bind_port.unwrap_or(DEFAULT_BIND_PORT)
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct SandboxConfig {
    /// Directory under which per-request workspaces are created
    pub workspace_root: Option<PathBuf>,
    /// Wall-clock budget for the whole compile + run pipeline
    pub time_limit: Option<MicroSecond>,
    /// Cap applied to each captured output stream
    pub output_limit: Option<ByteSize>,
    pub max_concurrent: Option<usize>,
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub limits: ResourceLimits,
    pub run_as: Option<RunAs>,
    pub sweep_interval: Option<Second>,
    pub languages: Option<Vec<LanguageConfig>>,
}

impl SandboxConfig {
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("coderun-workspaces"))
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_micros(self.time_limit.unwrap_or(DEFAULT_TIME_LIMIT).0)
    }

    pub fn output_limit(&self) -> usize {
        self.output_limit.unwrap_or(DEFAULT_OUTPUT_LIMIT).0 as usize
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
            .filter(|n| *n > 0)
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval.unwrap_or(DEFAULT_SWEEP_INTERVAL).0)
    }

    /// Configured pipelines, or the built-in toolchain wiring when none are given
    pub fn languages(&self) -> Vec<LanguageConfig> {
        self.languages.clone().unwrap_or_else(default_languages)
    }
}

#[derive(Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Timeouts only, no resource ceilings
    Plain,
    #[default]
    Rlimit,
}

/// Ceilings applied to every spawned step by the `rlimit` backend
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU seconds; derived from the time limit when absent
    pub cpu_time: Option<Second>,
    pub address_space: Option<ByteSize>,
    pub open_files: Option<u64>,
    pub file_size: Option<ByteSize>,
    /// Processes owned by the executing user. The count includes every process
    /// of that user, so it is only defaulted when steps run as `run_as`.
    pub processes: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_time: None,
            // Leaves room for the JVM's reservations with the default heap flags
            address_space: Some(DEFAULT_ADDRESS_SPACE),
            open_files: Some(DEFAULT_OPEN_FILES),
            file_size: Some(DEFAULT_FILE_SIZE),
            processes: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunAs {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LanguageConfig {
    pub name: Language,
    /// Source file name; `%MAIN%` expands to the detected entry name
    pub file_name: String,
    pub compile: Option<Vec<String>>,
    pub run: Vec<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct AuthConfig {
    #[serde(default)]
    pub require_active_subscription: bool,
    #[serde(default)]
    pub identities: Vec<IdentityConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct IdentityConfig {
    pub token: String,
    pub name: String,
    pub role: Role,
    #[serde(default = "default_subscription_status")]
    pub subscription_status: String,
}

fn default_subscription_status() -> String {
    "inactive".to_string()
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MicroSecond(pub u64);

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Second(pub u64);

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);
