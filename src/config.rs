/*
 *  config.rs
 *
 *  ledwire - pixels on the wire
 *  (c) 2020-26 Stuart Hunter
 *
 *  Runner configuration: CLI, config file, merge and validation
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  See <http://www.gnu.org/licenses/> to get a copy of the GNU General
 *  Public License.
 *
 */

use clap::{ArgAction, Parser, ValueHint};
use dirs_next::home_dir;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use std::{fs, path::{Path, PathBuf}};
use thiserror::Error;

use crate::device::{BufferPolicy, ConfigMatcher, TransferConfig};

pub const DEFAULT_FPS: u32 = 30;

/// Error type for config loading/validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Top-level runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub log_level: Option<String>,   // e.g., "info" | "debug"
    pub policy: Option<String>,      // "host" | "copy" | "nocopy"
    pub fps: Option<u32>,
    /// frames to stream; 0 or absent streams until the fleet is gone
    pub frames: Option<u64>,
    pub transfer: Option<TransferSettings>,
    /// device records, handed to devices untouched
    pub devices: Option<Value>,
}

/// Engine tunables; anything missing keeps the engine default
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransferSettings {
    pub buffers: Option<usize>,
    pub max_in_flight: Option<usize>,
    pub submit_attempts: Option<u32>,
    pub cancel_timeout_ms: Option<u64>,
    pub sync_timeout_ms: Option<u64>,
}

impl Config {
    pub fn buffer_policy(&self) -> Result<BufferPolicy, ConfigError> {
        match self.policy.as_deref() {
            None => Ok(BufferPolicy::for_host()),
            Some(p) => p.parse().map_err(ConfigError::Validation),
        }
    }

    pub fn transfer_config(&self) -> TransferConfig {
        let mut tc = TransferConfig::default();
        if let Some(t) = self.transfer.as_ref() {
            if let Some(n) = t.buffers         { tc.buffers = n; }
            if let Some(n) = t.max_in_flight   { tc.max_in_flight = n; }
            if let Some(n) = t.submit_attempts { tc.submit_attempts = n; }
            if let Some(ms) = t.cancel_timeout_ms { tc.cancel_timeout = Duration::from_millis(ms); }
            if let Some(ms) = t.sync_timeout_ms   { tc.sync_timeout = Duration::from_millis(ms); }
        }
        tc
    }

    pub fn fps(&self) -> u32 {
        self.fps.unwrap_or(DEFAULT_FPS)
    }

    /// The device tree, or an empty one
    pub fn device_tree(&self) -> Value {
        self.devices.clone().unwrap_or_else(|| Value::Array(Vec::new()))
    }
}

/// CLI overrides. All fields are Options so we can layer them over the file.
#[derive(Debug, Parser, Clone, Default)]
#[command(name = "ledwire", about = "Drive LED pixel hardware from OPC frames", disable_help_flag = false)]
pub struct Cli {
    /// Path to a YAML or JSON config file (overrides search)
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub log_level: Option<String>,
    /// transfer buffer policy: host | copy | nocopy
    #[arg(long)]
    pub policy: Option<String>,
    #[arg(long)]
    pub fps: Option<u32>,
    #[arg(long)]
    pub frames: Option<u64>,
    /// dump fully merged config (after overrides) and exit
    #[arg(long, action = ArgAction::SetTrue)]
    pub dump_config: bool,
}

/// Public entry point: parse CLI, read the config file, merge, validate.
pub fn load() -> Result<Config, ConfigError> {
    let cli = Cli::parse();
    let cfg = load_from(&cli)?;

    if cli.dump_config {
        // Pretty YAML of effective config (nice for debugging)
        let s = serde_yaml::to_string(&cfg)?;
        println!("{s}");
        std::process::exit(0);
    }

    Ok(cfg)
}

/// Everything `load` does short of parsing argv
pub fn load_from(cli: &Cli) -> Result<Config, ConfigError> {
    // 1) defaults (from `Default` impl)
    let mut cfg = Config::default();

    // 2) config file (explicit path or search)
    if let Some(p) = cli.config.as_ref() {
        if p.exists() {
            merge(&mut cfg, read_file(p)?);
        } else {
            return Err(ConfigError::Validation(format!(
                "Config file not found: {}",
                p.display()
            )));
        }
    } else if let Some(p) = find_config_file() {
        merge(&mut cfg, read_file(&p)?);
    }

    // 3) CLI overrides (highest precedence)
    apply_cli_overrides(&mut cfg, cli);

    // 4) Validate
    validate(&cfg)?;
    Ok(cfg)
}

/// Try common locations in order (first hit wins).
fn find_config_file() -> Option<PathBuf> {
    // XDG-style: ~/.config/ledwire/config.yaml
    if let Some(home) = home_dir() {
        for rel in &[".config/ledwire/config.yaml", ".config/ledwire/config.json", ".config/ledwire.yaml"] {
            let p = home.join(rel);
            if p.exists() { return Some(p) }
        }
    }
    // project local
    for candidate in &["ledwire.yaml", "ledwire.json", "config/ledwire.yaml"] {
        let p = PathBuf::from(candidate);
        if p.exists() { return Some(p) }
    }
    None
}

/// JSON by extension, YAML otherwise
pub fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let s = fs::read_to_string(path)?;
    let is_json = path.extension().is_some_and(|e| e.eq_ignore_ascii_case("json"));
    let cfg = if is_json { serde_json::from_str(&s)? } else { serde_yaml::from_str(&s)? };
    Ok(cfg)
}

/// Shallow merge `src` into `dst`, Option-by-Option.
fn merge(dst: &mut Config, src: Config) {
    if src.log_level.is_some() { dst.log_level = src.log_level; }
    if src.policy.is_some()    { dst.policy = src.policy; }
    if src.fps.is_some()       { dst.fps = src.fps; }
    if src.frames.is_some()    { dst.frames = src.frames; }
    if src.devices.is_some()   { dst.devices = src.devices; }
    match (&mut dst.transfer, src.transfer) {
        (None, Some(t)) => dst.transfer = Some(t),
        (Some(d), Some(s)) => merge_transfer(d, s),
        _ => {}
    }
}

fn merge_transfer(dst: &mut TransferSettings, src: TransferSettings) {
    if src.buffers.is_some()           { dst.buffers = src.buffers; }
    if src.max_in_flight.is_some()     { dst.max_in_flight = src.max_in_flight; }
    if src.submit_attempts.is_some()   { dst.submit_attempts = src.submit_attempts; }
    if src.cancel_timeout_ms.is_some() { dst.cancel_timeout_ms = src.cancel_timeout_ms; }
    if src.sync_timeout_ms.is_some()   { dst.sync_timeout_ms = src.sync_timeout_ms; }
}

fn apply_cli_overrides(cfg: &mut Config, cli: &Cli) {
    if cli.log_level.is_some() { cfg.log_level = cli.log_level.clone(); }
    if cli.policy.is_some()    { cfg.policy = cli.policy.clone(); }
    if cli.fps.is_some()       { cfg.fps = cli.fps; }
    if cli.frames.is_some()    { cfg.frames = cli.frames; }
}

/// Put any invariants here (required fields, ranges, etc.)
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    cfg.buffer_policy()?;
    if let Some(fps) = cfg.fps {
        if fps == 0 || fps > 1000 {
            return Err(ConfigError::Validation("fps must be 1..=1000".into()));
        }
    }
    if let Some(t) = cfg.transfer.as_ref() {
        if t.buffers.is_some_and(|n| n < 2) {
            return Err(ConfigError::Validation("transfer buffers must be >= 2".into()));
        }
        if t.max_in_flight == Some(0) || t.submit_attempts == Some(0) {
            return Err(ConfigError::Validation("max_in_flight and submit_attempts must be > 0".into()));
        }
    }
    if let Some(devices) = cfg.devices.as_ref() {
        let shaped = devices.is_array() || devices.get("devices").is_some_and(Value::is_array);
        if !shaped {
            return Err(ConfigError::Validation("devices must be a list of records".into()));
        }
        if let Some(i) = ConfigMatcher::records(devices).iter().position(|r| !r.is_object()) {
            return Err(ConfigError::Validation(format!("device record {} is not a map", i)));
        }
    }
    Ok(())
}
