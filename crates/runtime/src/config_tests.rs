// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;

use super::*;

fn parse(args: &[&str]) -> Config {
    Config::parse_from(args)
}

#[test]
fn defaults_validate_for_the_shell_provider() -> anyhow::Result<()> {
    let config = parse(&["orbitmesh"]);
    config.validate()?;
    assert_eq!(config.provider, "shell");
    assert_eq!(config.registry_mode, "permissive");
    assert_eq!(config.breaker_threshold, 3);
    assert!(config.command.is_empty());
    Ok(())
}

#[test]
fn trailing_command_is_captured() -> anyhow::Result<()> {
    let config = parse(&["orbitmesh", "--provider", "stdio", "--", "/usr/bin/agent", "--fast"]);
    config.validate()?;
    assert_eq!(config.command, vec!["/usr/bin/agent", "--fast"]);
    Ok(())
}

#[test]
fn non_shell_provider_requires_a_command() {
    let config = parse(&["orbitmesh", "--provider", "stdio"]);
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("requires a command"));
}

#[test]
fn invalid_registry_mode_is_rejected() {
    let config = parse(&["orbitmesh", "--registry-mode", "jail"]);
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("invalid registry mode"));
}

#[test]
fn invalid_log_format_is_rejected() {
    let config = parse(&["orbitmesh", "--log-format", "xml"]);
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("invalid log format"));
}

#[yare::parameterized(
    output_cap = { &["orbitmesh", "--output-cap", "0"] },
    line_cap = { &["orbitmesh", "--max-line-bytes", "0"] },
    threshold = { &["orbitmesh", "--breaker-threshold", "0"] },
)]
fn zero_caps_are_rejected(args: &[&str]) {
    let config = parse(args);
    assert!(config.validate().is_err());
}

#[test]
fn duration_accessors() {
    let config = parse(&[
        "orbitmesh",
        "--breaker-cooldown-ms",
        "250",
        "--stop-grace-ms",
        "1500",
        "--handshake-ms",
        "400",
    ]);
    assert_eq!(config.breaker_cooldown(), std::time::Duration::from_millis(250));
    assert_eq!(config.stop_grace(), std::time::Duration::from_millis(1500));
    assert_eq!(config.handshake_timeout(), std::time::Duration::from_millis(400));
}

#[test]
fn registry_mode_enum_parses() -> anyhow::Result<()> {
    let config = parse(&["orbitmesh", "--registry-mode", "strict"]);
    assert_eq!(config.registry_mode_enum()?, crate::registry::RegistryMode::Strict);
    Ok(())
}
