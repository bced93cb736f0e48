// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Allow-list policy over the external commands providers may spawn.
//!
//! This is misconfiguration detection and resource capping, not a
//! sandbox. The registry is built once at startup and handed to
//! providers as a shared value — no global mutable state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default cap on argument count when neither the entry nor the
/// constructor overrides it.
pub const DEFAULT_MAX_ARGS: usize = 64;
/// Default cap on a single argument's byte length.
pub const DEFAULT_MAX_ARG_LEN: usize = 4096;

/// Why a spawn request was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("command registry is disabled")]
    Disabled,
    #[error("command not registered: {0}")]
    NotRegistered(String),
    #[error("command not allowed for {name}: {command}")]
    CommandNotAllowed { name: String, command: String },
    #[error("command path must be absolute: {0}")]
    InvalidPath(String),
    #[error("too many arguments: {count} > {max}")]
    ArgsTooMany { count: usize, max: usize },
    #[error("argument too long: {len} > {max}")]
    ArgTooLong { len: usize, max: usize },
    #[error("argument not allowed: {0:?}")]
    InvalidArg(String),
}

/// Registry enforcement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryMode {
    /// Every request is rejected.
    Disabled,
    /// The request must match a registered entry.
    Strict,
    /// Any absolute command within the caps is allowed.
    Permissive,
}

impl std::str::FromStr for RegistryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(Self::Disabled),
            "strict" => Ok(Self::Strict),
            "permissive" => Ok(Self::Permissive),
            other => Err(format!("invalid registry mode: {other}")),
        }
    }
}

/// Argument policy for a registered command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArgPolicy {
    /// Any arguments, subject to the caps.
    Any,
    /// Every argument must appear in this list.
    List(Vec<String>),
}

/// One registered command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEntry {
    pub name: String,
    /// Absolute path of the allowed binary.
    pub command: PathBuf,
    pub args: ArgPolicy,
    /// Per-entry cap overriding the registry default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_args: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_arg_len: Option<usize>,
}

impl CommandEntry {
    pub fn new(name: impl Into<String>, command: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: ArgPolicy::Any,
            max_args: None,
            max_arg_len: None,
        }
    }

    pub fn with_args(mut self, args: ArgPolicy) -> Self {
        self.args = args;
        self
    }

    pub fn with_max_args(mut self, max: usize) -> Self {
        self.max_args = Some(max);
        self
    }

    pub fn with_max_arg_len(mut self, max: usize) -> Self {
        self.max_arg_len = Some(max);
        self
    }
}

/// A spawn a provider is about to perform.
#[derive(Debug)]
pub struct SpawnRequest<'a> {
    pub name: &'a str,
    pub command: &'a Path,
    pub args: &'a [String],
}

/// Validates subprocess commands against registered entries and caps.
#[derive(Debug)]
pub struct CommandRegistry {
    mode: RegistryMode,
    entries: HashMap<String, CommandEntry>,
    max_args: usize,
    max_arg_len: usize,
}

impl CommandRegistry {
    pub fn new(mode: RegistryMode) -> Self {
        Self {
            mode,
            entries: HashMap::new(),
            max_args: DEFAULT_MAX_ARGS,
            max_arg_len: DEFAULT_MAX_ARG_LEN,
        }
    }

    pub fn with_caps(mut self, max_args: usize, max_arg_len: usize) -> Self {
        self.max_args = max_args;
        self.max_arg_len = max_arg_len;
        self
    }

    pub fn mode(&self) -> RegistryMode {
        self.mode
    }

    /// Register an entry. Relative command paths are rejected.
    pub fn register(&mut self, entry: CommandEntry) -> Result<(), RegistryError> {
        if !entry.command.is_absolute() {
            return Err(RegistryError::InvalidPath(entry.command.display().to_string()));
        }
        self.entries.insert(entry.name.clone(), entry);
        Ok(())
    }

    /// Validate a spawn request under the current mode.
    pub fn validate(&self, req: &SpawnRequest<'_>) -> Result<(), RegistryError> {
        if self.mode == RegistryMode::Disabled {
            return Err(RegistryError::Disabled);
        }

        if !req.command.is_absolute() {
            return Err(RegistryError::InvalidPath(req.command.display().to_string()));
        }

        let entry = match self.mode {
            RegistryMode::Strict => {
                let entry = self
                    .entries
                    .get(req.name)
                    .ok_or_else(|| RegistryError::NotRegistered(req.name.to_owned()))?;
                if entry.command != req.command {
                    return Err(RegistryError::CommandNotAllowed {
                        name: req.name.to_owned(),
                        command: req.command.display().to_string(),
                    });
                }
                Some(entry)
            }
            _ => self.entries.get(req.name),
        };

        let max_args = entry.and_then(|e| e.max_args).unwrap_or(self.max_args);
        if req.args.len() > max_args {
            return Err(RegistryError::ArgsTooMany { count: req.args.len(), max: max_args });
        }

        let max_arg_len = entry.and_then(|e| e.max_arg_len).unwrap_or(self.max_arg_len);
        for arg in req.args {
            if arg.len() > max_arg_len {
                return Err(RegistryError::ArgTooLong { len: arg.len(), max: max_arg_len });
            }
            if arg.contains('\0') {
                return Err(RegistryError::InvalidArg(arg.clone()));
            }
            if let Some(CommandEntry { args: ArgPolicy::List(allowed), .. }) = entry {
                if !allowed.contains(arg) {
                    return Err(RegistryError::InvalidArg(arg.clone()));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
