//! Configuration: tuning settings and the bridged tool description.
//!
//! Settings come from the environment (all optional, every key has a
//! default); the tool itself comes from a VS Code-style `mcp.json` document.
//! Both are resolved once at startup and read-only afterwards; a malformed
//! value or an unresolvable `${input:ID}` token is fatal.

use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;
pub const DEFAULT_MAX_SUBSCRIBERS: usize = 100;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_RESTART_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_RESTART_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Path of the tool configuration file (`MCP_CONFIG_PATH`, else `mcp.json`).
#[must_use]
pub fn config_path_from_env() -> PathBuf {
    std::env::var("MCP_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("mcp.json"))
}

/// Tuning knobs for the bridge. Read-only after startup.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Listen port for the HTTP server.
    pub port: u16,
    /// Per-subscriber queue byte ceiling; also caps the replay buffer.
    pub max_buffer_size: usize,
    /// Per-engine subscriber count ceiling.
    pub max_subscribers: usize,
    /// Ingress body byte ceiling.
    pub max_message_size: usize,
    /// Period between keepalive comments on the event-stream engine.
    pub keepalive_interval: Duration,
    /// Subscriber idle cutoff.
    pub stream_timeout: Duration,
    /// First restart delay; doubles per consecutive restart.
    pub restart_backoff_base: Duration,
    /// Upper bound on the restart delay.
    pub restart_backoff_max: Duration,
    /// Spawn the child on first use instead of at startup.
    pub lazy_start: bool,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            max_subscribers: DEFAULT_MAX_SUBSCRIBERS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            restart_backoff_base: DEFAULT_RESTART_BACKOFF_BASE,
            restart_backoff_max: DEFAULT_RESTART_BACKOFF_MAX,
            lazy_start: false,
        }
    }
}

impl BridgeSettings {
    /// Load settings from the process environment.
    ///
    /// Durations are milliseconds. Unset keys fall back to defaults;
    /// unparseable values are a [`ConfigError`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] but with an injectable variable source.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            port: parse_var(&lookup, "PORT")?.unwrap_or(defaults.port),
            max_buffer_size: parse_var(&lookup, "MAX_BUFFER_SIZE")?
                .unwrap_or(defaults.max_buffer_size),
            max_subscribers: parse_var(&lookup, "MAX_SUBSCRIBERS")?
                .unwrap_or(defaults.max_subscribers),
            max_message_size: parse_var(&lookup, "MAX_MESSAGE_SIZE")?
                .unwrap_or(defaults.max_message_size),
            keepalive_interval: parse_var(&lookup, "KEEPALIVE_INTERVAL")?
                .map_or(defaults.keepalive_interval, Duration::from_millis),
            stream_timeout: parse_var(&lookup, "STREAM_TIMEOUT")?
                .map_or(defaults.stream_timeout, Duration::from_millis),
            restart_backoff_base: parse_var(&lookup, "RESTART_BACKOFF_BASE")?
                .map_or(defaults.restart_backoff_base, Duration::from_millis),
            restart_backoff_max: parse_var(&lookup, "RESTART_BACKOFF_MAX")?
                .map_or(defaults.restart_backoff_max, Duration::from_millis),
            lazy_start: parse_bool_var(&lookup, "LAZY_START")?.unwrap_or(defaults.lazy_start),
        })
    }
}

fn parse_var<T>(
    lookup: impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_owned(),
                value: raw,
                reason: e.to_string(),
            }),
    }
}

fn parse_bool_var(
    lookup: impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<bool>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_owned(),
                value: raw,
                reason: "expected true or false".to_owned(),
            }),
        },
    }
}

/// Immutable description of the bridged tool: an executable and its
/// fully-resolved arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// One declared input in the tool config file.
#[derive(Debug, Clone, Deserialize)]
pub struct InputDecl {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ToolConfigFile {
    #[serde(default)]
    inputs: Vec<InputDecl>,
    #[serde(default)]
    servers: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ServerEntry {
    #[serde(rename = "type")]
    kind: Option<String>,
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
}

/// Load the tool description from an `mcp.json`-style document and resolve
/// its `${input:ID}` tokens against the process environment.
pub fn load_tool_spec(path: &Path) -> Result<ToolSpec, ConfigError> {
    load_tool_spec_with_lookup(path, |key| std::env::var(key).ok())
}

/// Same as [`load_tool_spec`] but with an injectable variable source.
pub fn load_tool_spec_with_lookup(
    path: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ToolSpec, ConfigError> {
    let display = path.display().to_string();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
        path: display.clone(),
        source,
    })?;
    let file: ToolConfigFile =
        serde_json::from_str(&raw).map_err(|source| ConfigError::ParseFailed {
            path: display.clone(),
            source,
        })?;

    // First declared stdio entry wins; entries without a type are stdio.
    for (name, value) in &file.servers {
        let entry: ServerEntry = match serde_json::from_value(value.clone()) {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        if entry.kind.as_deref().is_some_and(|kind| kind != "stdio") {
            continue;
        }
        let command = entry
            .command
            .ok_or_else(|| ConfigError::MissingCommand { name: name.clone() })?;
        let args = entry
            .args
            .iter()
            .map(|arg| substitute_inputs(arg, &file.inputs, &lookup))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(ToolSpec { command, args });
    }

    Err(ConfigError::NoStdioServer { path: display })
}

/// Replace every `${input:ID}` occurrence in `arg`.
///
/// Resolution order: `INPUT_<ID>` variable, then `<ID>` directly, then the
/// declared default. No match is fatal.
fn substitute_inputs(
    arg: &str,
    inputs: &[InputDecl],
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<String, ConfigError> {
    const OPEN: &str = "${input:";

    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + OPEN.len()..];
        let Some(end) = after.find('}') else {
            // Unterminated token: keep it verbatim.
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let id = &after[..end];
        let value = lookup(&format!("INPUT_{id}"))
            .or_else(|| lookup(id))
            .or_else(|| {
                inputs
                    .iter()
                    .find(|input| input.id == id)
                    .and_then(|input| input.default.clone())
            })
            .ok_or_else(|| ConfigError::UnresolvedInput { id: id.to_owned() })?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Resolve a spec's args against an explicit variable map. Test seam and
/// programmatic entry point.
pub fn resolve_tool_args(
    spec: &ToolSpec,
    inputs: &[InputDecl],
    vars: &HashMap<String, String>,
) -> Result<ToolSpec, ConfigError> {
    let args = spec
        .args
        .iter()
        .map(|arg| substitute_inputs(arg, inputs, |key| vars.get(key).cloned()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ToolSpec {
        command: spec.command.clone(),
        args,
    })
}
