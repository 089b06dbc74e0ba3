//! Server configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Value `OPSDECK_ALLOW_REMOTE_TERMINAL` must hold to accept non-loopback terminal peers
pub const REMOTE_TERMINAL_OPT_IN: &str = "1";

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP server host
    #[serde(default = "default_http_host")]
    pub http_host: String,

    /// HTTP server port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Directory holding the `ralph` and `ralph-once` executables.
    /// Bare invocations of those commands are rewritten to absolute paths.
    #[serde(default)]
    pub ralph_bin_dir: Option<PathBuf>,

    /// Accept terminal connections from non-loopback peers
    #[serde(default)]
    pub allow_remote_terminal: bool,

    /// Shell launched inside terminal sessions
    #[serde(default = "default_terminal_shell")]
    pub terminal_shell: String,

    /// Maximum number of live terminal sessions
    #[serde(default = "default_max_terminal_sessions")]
    pub max_terminal_sessions: usize,

    /// Seconds a session may sit with zero viewers before it is reaped
    #[serde(default = "default_orphan_timeout_secs")]
    pub orphan_timeout_secs: u64,

    /// Interval of the orphan reaper
    #[serde(default = "default_orphan_sweep_secs")]
    pub orphan_sweep_secs: u64,

    /// Lines retained per process for replay
    #[serde(default = "default_output_buffer_lines")]
    pub output_buffer_lines: usize,

    /// How long to wait for pipe readers to flush after a process exits
    #[serde(default = "default_output_drain_ms")]
    pub output_drain_ms: u64,

    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    /// Seconds an exited process record is kept before being purged
    #[serde(default = "default_process_retention_secs")]
    pub process_retention_secs: u64,

    /// Interval of the exited-process sweeper
    #[serde(default = "default_process_sweep_secs")]
    pub process_sweep_secs: u64,

    /// Log format: "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_http_host() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    4680
}

fn default_terminal_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
}

fn default_max_terminal_sessions() -> usize {
    10
}

fn default_orphan_timeout_secs() -> u64 {
    300 // 5 minutes
}

fn default_orphan_sweep_secs() -> u64 {
    30
}

fn default_output_buffer_lines() -> usize {
    1000
}

fn default_output_drain_ms() -> u64 {
    500
}

fn default_kill_grace_ms() -> u64 {
    3000
}

fn default_process_retention_secs() -> u64 {
    3600 // 1 hour
}

fn default_process_sweep_secs() -> u64 {
    60
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Config::default();

        if let Ok(val) = std::env::var("OPSDECK_HTTP_HOST") {
            config.http_host = val;
        }
        if let Ok(val) = std::env::var("OPSDECK_HTTP_PORT") {
            config.http_port = val
                .parse()
                .map_err(|_| anyhow::anyhow!("OPSDECK_HTTP_PORT must be a port number"))?;
        }
        if let Ok(val) = std::env::var("OPSDECK_RALPH_BIN_DIR") {
            if !val.trim().is_empty() {
                config.ralph_bin_dir = Some(PathBuf::from(val));
            }
        }
        if let Ok(val) = std::env::var("OPSDECK_ALLOW_REMOTE_TERMINAL") {
            config.allow_remote_terminal = val == REMOTE_TERMINAL_OPT_IN;
        }
        if let Ok(val) = std::env::var("OPSDECK_TERMINAL_SHELL") {
            config.terminal_shell = val;
        }
        if let Ok(val) = std::env::var("OPSDECK_MAX_TERMINAL_SESSIONS") {
            if let Ok(max) = val.parse() {
                config.max_terminal_sessions = max;
            }
        }
        if let Ok(val) = std::env::var("OPSDECK_ORPHAN_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse() {
                config.orphan_timeout_secs = secs;
            }
        }
        if let Ok(val) = std::env::var("OPSDECK_ORPHAN_SWEEP_SECS") {
            if let Ok(secs) = val.parse() {
                config.orphan_sweep_secs = secs;
            }
        }
        if let Ok(val) = std::env::var("OPSDECK_OUTPUT_BUFFER_LINES") {
            if let Ok(lines) = val.parse() {
                config.output_buffer_lines = lines;
            }
        }
        if let Ok(val) = std::env::var("OPSDECK_OUTPUT_DRAIN_MS") {
            if let Ok(ms) = val.parse() {
                config.output_drain_ms = ms;
            }
        }
        if let Ok(val) = std::env::var("OPSDECK_KILL_GRACE_MS") {
            if let Ok(ms) = val.parse() {
                config.kill_grace_ms = ms;
            }
        }
        if let Ok(val) = std::env::var("OPSDECK_PROCESS_RETENTION_SECS") {
            if let Ok(secs) = val.parse() {
                config.process_retention_secs = secs;
            }
        }
        if let Ok(val) = std::env::var("OPSDECK_PROCESS_SWEEP_SECS") {
            if let Ok(secs) = val.parse() {
                config.process_sweep_secs = secs;
            }
        }
        if let Ok(val) = std::env::var("OPSDECK_LOG_FORMAT") {
            config.log_format = val;
        }

        Ok(config)
    }

    pub fn orphan_timeout(&self) -> Duration {
        Duration::from_secs(self.orphan_timeout_secs)
    }

    pub fn orphan_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.orphan_sweep_secs.max(1))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn output_drain(&self) -> Duration {
        Duration::from_millis(self.output_drain_ms)
    }

    pub fn process_retention(&self) -> Duration {
        Duration::from_secs(self.process_retention_secs)
    }

    pub fn process_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.process_sweep_secs.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_host: default_http_host(),
            http_port: default_http_port(),
            ralph_bin_dir: None,
            allow_remote_terminal: false,
            terminal_shell: default_terminal_shell(),
            max_terminal_sessions: default_max_terminal_sessions(),
            orphan_timeout_secs: default_orphan_timeout_secs(),
            orphan_sweep_secs: default_orphan_sweep_secs(),
            output_buffer_lines: default_output_buffer_lines(),
            output_drain_ms: default_output_drain_ms(),
            kill_grace_ms: default_kill_grace_ms(),
            process_retention_secs: default_process_retention_secs(),
            process_sweep_secs: default_process_sweep_secs(),
            log_format: default_log_format(),
        }
    }
}
