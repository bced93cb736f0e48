// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::registry::RegistryMode;

/// Agent session runtime for external AI coding agents.
#[derive(Debug, Clone, Parser)]
#[command(name = "orbitmesh", version, about)]
pub struct Config {
    /// Base directory for persisted session state.
    #[arg(long, env = "ORBITMESH_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Provider kind for the CLI session (shell, stdio, pty, sidecar).
    #[arg(long, env = "ORBITMESH_PROVIDER", default_value = "shell")]
    pub provider: String,

    /// Working directory for the agent subprocess (defaults to the
    /// current directory).
    #[arg(long, env = "ORBITMESH_WORKING_DIR")]
    pub working_dir: Option<PathBuf>,

    /// Task label attached to the CLI session.
    #[arg(long, env = "ORBITMESH_TASK")]
    pub task: Option<String>,

    /// Command registry mode (disabled, strict, permissive).
    #[arg(long, env = "ORBITMESH_REGISTRY_MODE", default_value = "permissive")]
    pub registry_mode: String,

    /// Global cap on agent subprocess argument count.
    #[arg(long, env = "ORBITMESH_MAX_ARGS", default_value = "64")]
    pub max_args: usize,

    /// Global cap on a single argument's byte length.
    #[arg(long, env = "ORBITMESH_MAX_ARG_LEN", default_value = "4096")]
    pub max_arg_len: usize,

    /// Consecutive failures before the circuit breaker trips.
    #[arg(long, env = "ORBITMESH_BREAKER_THRESHOLD", default_value = "3")]
    pub breaker_threshold: u32,

    /// Circuit breaker cooldown in milliseconds.
    #[arg(long, env = "ORBITMESH_BREAKER_COOLDOWN_MS", default_value = "30000")]
    pub breaker_cooldown_ms: u64,

    /// Input buffer queue capacity.
    #[arg(long, env = "ORBITMESH_INPUT_CAPACITY", default_value = "64")]
    pub input_capacity: usize,

    /// Cap on inputs retained while paused (0 = unbounded).
    #[arg(long, env = "ORBITMESH_INPUT_OVERFLOW_CAP", default_value = "1024")]
    pub input_overflow_cap: usize,

    /// Bytes of output retained in a session snapshot.
    #[arg(long, env = "ORBITMESH_OUTPUT_CAP", default_value = "262144")]
    pub output_cap: usize,

    /// Hard cap on one JSON line from an agent.
    #[arg(long, env = "ORBITMESH_MAX_LINE_BYTES", default_value = "1048576")]
    pub max_line_bytes: usize,

    /// Graceful stop deadline in milliseconds before escalating to kill.
    #[arg(long, env = "ORBITMESH_STOP_GRACE_MS", default_value = "5000")]
    pub stop_grace_ms: u64,

    /// Sidecar dial-back deadline in milliseconds.
    #[arg(long, env = "ORBITMESH_HANDSHAKE_MS", default_value = "10000")]
    pub handshake_ms: u64,

    /// Log format (json or text).
    #[arg(long, env = "ORBITMESH_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "ORBITMESH_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Agent command to run (after --). Required for stdio/pty/sidecar.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.registry_mode_enum()?;

        if self.log_format != "json" && self.log_format != "text" {
            anyhow::bail!("invalid log format: {}", self.log_format);
        }

        if self.output_cap == 0 {
            anyhow::bail!("--output-cap must be positive");
        }
        if self.max_line_bytes == 0 {
            anyhow::bail!("--max-line-bytes must be positive");
        }
        if self.breaker_threshold == 0 {
            anyhow::bail!("--breaker-threshold must be positive");
        }

        // The shell provider supplies its own command; every other
        // variant launches what the caller passed after --.
        if self.provider != "shell" && self.command.is_empty() {
            anyhow::bail!("provider {:?} requires a command after --", self.provider);
        }

        Ok(())
    }

    /// Parse the registry mode string into an enum.
    pub fn registry_mode_enum(&self) -> anyhow::Result<RegistryMode> {
        self.registry_mode.parse::<RegistryMode>().map_err(|e| anyhow::anyhow!(e))
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.breaker_cooldown_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
