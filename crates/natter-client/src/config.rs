// Client-side defaults and environment/YAML configuration helpers.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

pub(crate) const DEFAULT_INBOX_PREFIX: &str = "_INBOX";
pub(crate) const DEFAULT_FLUSH_QUEUE_DEPTH: usize = 1024;
pub(crate) const DEFAULT_WRITE_BUFFER_BYTES: usize = 32 * 1024;
pub(crate) const DEFAULT_READ_BUFFER_BYTES: usize = 32 * 1024;
pub(crate) const DEFAULT_MAX_CONTROL_LINE_BYTES: usize = 4096;
pub(crate) const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2_000;

/// Hard safety cap for a single inbound payload.
///
/// The parser allocates a buffer sized by the advertised byte count, so a
/// buggy or hostile server could otherwise force an arbitrarily large
/// allocation. Override with `NATTER_MAX_PAYLOAD_BYTES`.
pub(crate) const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Sent to the server in `CONNECT` when set.
    pub name: Option<String>,
    /// First subject token of every request inbox.
    pub inbox_prefix: String,
    pub flush_queue_depth: usize,
    pub write_buffer_bytes: usize,
    pub read_buffer_bytes: usize,
    pub max_control_line_bytes: usize,
    pub max_payload_bytes: usize,
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ClientConfigOverride {
    name: Option<String>,
    inbox_prefix: Option<String>,
    flush_queue_depth: Option<usize>,
    write_buffer_bytes: Option<usize>,
    read_buffer_bytes: Option<usize>,
    max_control_line_bytes: Option<usize>,
    max_payload_bytes: Option<usize>,
    connect_timeout_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: None,
            inbox_prefix: DEFAULT_INBOX_PREFIX.to_string(),
            flush_queue_depth: DEFAULT_FLUSH_QUEUE_DEPTH,
            write_buffer_bytes: DEFAULT_WRITE_BUFFER_BYTES,
            read_buffer_bytes: DEFAULT_READ_BUFFER_BYTES,
            max_control_line_bytes: DEFAULT_MAX_CONTROL_LINE_BYTES,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl ClientConfig {
    /// Defaults, then `NATTER_*` environment overrides, then the YAML file at
    /// `config_path` (or `NATTER_CLIENT_CONFIG`) when one is given.
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("NATTER_CLIENT_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents =
                fs::read_to_string(path).with_context(|| format!("read client config: {path}"))?;
            let override_cfg: ClientConfigOverride =
                serde_yaml::from_str(&contents).context("parse client config yaml")?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = read_string_env("NATTER_CLIENT_NAME") {
            config.name = Some(value);
        }
        if let Some(value) =
            read_string_env("NATTER_INBOX_PREFIX").filter(|value| is_valid_prefix(value))
        {
            config.inbox_prefix = value;
        }
        if let Some(value) = read_usize_env("NATTER_FLUSH_QUEUE_DEPTH") {
            config.flush_queue_depth = value;
        }
        if let Some(value) = read_usize_env("NATTER_WRITE_BUFFER_BYTES") {
            config.write_buffer_bytes = value;
        }
        if let Some(value) = read_usize_env("NATTER_READ_BUFFER_BYTES") {
            config.read_buffer_bytes = value;
        }
        if let Some(value) = read_usize_env("NATTER_MAX_CONTROL_LINE_BYTES") {
            config.max_control_line_bytes = value;
        }
        if let Some(value) = read_usize_env("NATTER_MAX_PAYLOAD_BYTES") {
            config.max_payload_bytes = value;
        }
        if let Some(value) = read_u64_env("NATTER_CONNECT_TIMEOUT_MS") {
            config.connect_timeout_ms = value;
        }
        config
    }
}

impl ClientConfigOverride {
    fn apply(self, config: &mut ClientConfig) {
        if let Some(value) = self.name.filter(|value| !value.is_empty()) {
            config.name = Some(value);
        }
        if let Some(value) = self.inbox_prefix.filter(|value| is_valid_prefix(value)) {
            config.inbox_prefix = value;
        }
        if let Some(value) = self.flush_queue_depth.filter(|value| *value > 0) {
            config.flush_queue_depth = value;
        }
        if let Some(value) = self.write_buffer_bytes.filter(|value| *value > 0) {
            config.write_buffer_bytes = value;
        }
        if let Some(value) = self.read_buffer_bytes.filter(|value| *value > 0) {
            config.read_buffer_bytes = value;
        }
        if let Some(value) = self.max_control_line_bytes.filter(|value| *value > 0) {
            config.max_control_line_bytes = value;
        }
        if let Some(value) = self.max_payload_bytes.filter(|value| *value > 0) {
            config.max_payload_bytes = value;
        }
        if let Some(value) = self.connect_timeout_ms.filter(|value| *value > 0) {
            config.connect_timeout_ms = value;
        }
    }
}

// The prefix becomes a subject token, so it must survive validation once the
// random suffix is appended.
fn is_valid_prefix(value: &str) -> bool {
    natter_wire::validate_subject(value).is_ok() && !value.contains(['*', '>'])
}

fn read_string_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}
