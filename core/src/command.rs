//! Command model: what an operator declares in the configuration and what a
//! single HTTP request turns into at execution time.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::cancel::CancelScope;
use crate::error::AgentErr;
use crate::text::split_trimmed;

/// Sentinel resource name the main command is registered under.
pub const MAIN_RESOURCE: &str = ":default-resource:";

/// HTTP methods the exec handlers accept.
pub const ACCEPTED_METHODS: [&str; 5] = ["GET", "POST", "PUT", "PATCH", "DELETE"];

/// Canonicalize a method name; `None` when it is not an accepted method.
pub fn normalize_method(name: &str) -> Option<String> {
    let canonical = name.to_uppercase();
    ACCEPTED_METHODS
        .contains(&canonical.as_str())
        .then_some(canonical)
}

/// A command string plus its derived `|`-separated sub-commands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandDescriptor {
    #[serde(default)]
    pub command: String,

    /// Execution timeout in seconds; `0` disables the timeout.
    #[serde(default)]
    pub timeout: f64,

    #[serde(skip)]
    sub_commands: Vec<String>,
}

impl CommandDescriptor {
    pub fn new(command: impl Into<String>, timeout: f64) -> Result<Self, AgentErr> {
        let mut descriptor = Self {
            command: command.into(),
            timeout,
            sub_commands: Vec::new(),
        };
        descriptor.prepare()?;
        Ok(descriptor)
    }

    /// Derive the sub-command list from the command string. Must be called
    /// once after deserialization; `new` does it for hand-built values.
    pub fn prepare(&mut self) -> Result<(), AgentErr> {
        if self.command.is_empty() {
            return Err(AgentErr::Config("command must not be empty".to_string()));
        }
        if self.timeout < 0.0 {
            return Err(AgentErr::Config(format!(
                "execution timeout must not be negative, got {}",
                self.timeout
            )));
        }
        self.sub_commands = split_trimmed(&self.command, '|');
        if self.sub_commands.is_empty() {
            return Err(AgentErr::Config(format!(
                "command `{}` contains no sub-commands",
                self.command
            )));
        }
        Ok(())
    }

    pub fn sub_commands(&self) -> &[String] {
        &self.sub_commands
    }

    /// The command string with normalized whitespace around each `|`.
    pub fn canonical(&self) -> String {
        self.sub_commands.join(" | ")
    }

    /// Shell-style word splitting of one sub-command.
    pub fn tokenize(sub_command: &str) -> Result<Vec<String>, AgentErr> {
        let tokens = shlex::split(sub_command).ok_or_else(|| {
            AgentErr::Config(format!("sub-command `{sub_command}` is not parseable"))
        })?;
        if tokens.is_empty() {
            return Err(AgentErr::Config("sub-command must not be empty".to_string()));
        }
        Ok(tokens)
    }
}

/// A named resource: a default command, optional per-method overrides, an
/// optional URL pattern and resource-local settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandEntrypoint {
    #[serde(default)]
    pub default: Option<CommandDescriptor>,

    #[serde(default)]
    pub methods: Option<HashMap<String, CommandDescriptor>>,

    #[serde(default)]
    pub pattern: Option<String>,

    #[serde(default)]
    pub settings: Option<Map<String, Value>>,

    #[serde(default, rename = "settings-format")]
    pub settings_format: Option<String>,
}

impl CommandEntrypoint {
    /// Derive sub-command lists for every descriptor in the entrypoint.
    pub fn prepare(&mut self) -> Result<(), AgentErr> {
        if let Some(default) = self.default.as_mut() {
            default.prepare()?;
        }
        if let Some(methods) = self.methods.as_mut() {
            for descriptor in methods.values_mut() {
                descriptor.prepare()?;
            }
        }
        Ok(())
    }
}

/// Per-request execution descriptor. Lives for exactly one HTTP request.
#[derive(Debug, Clone, Default)]
pub struct CommandInvocation {
    /// Environment for the child processes, `(key, value)` pairs. Empty means
    /// "inherit the agent's environment untouched".
    pub envs: Vec<(String, String)>,

    /// Command string that bypasses the resource registry when present.
    pub direct_command: Option<String>,

    /// Resource to resolve; `None` selects the main resource.
    pub resource_name: Option<String>,

    /// HTTP method of the request, canonical upper-case.
    pub method_name: String,

    /// Correlation id taken from the request, for logs.
    pub request_id: Option<String>,

    /// Timeout override in seconds; `0` means "use the descriptor's".
    pub execution_timeout: f64,

    /// Cancellation scope of the request, when one exists.
    pub cancel: Option<CancelScope>,
}

/// What a finished (or killed) execution looked like.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionState {
    pub is_timeout: bool,
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn descriptor_splits_on_pipes() {
        let descriptor = CommandDescriptor::new("echo Hello Opwire | wc", 0.0).expect("descriptor");
        assert_eq!(descriptor.sub_commands(), ["echo Hello Opwire", "wc"]);
        assert_eq!(descriptor.canonical(), "echo Hello Opwire | wc");
    }

    #[test]
    fn descriptor_canonical_is_stable() {
        let descriptor =
            CommandDescriptor::new("  grep hello |  sort |uniq ", 0.0).expect("descriptor");
        let again =
            CommandDescriptor::new(descriptor.canonical(), 0.0).expect("canonical descriptor");
        assert_eq!(descriptor.canonical(), again.canonical());
        assert_eq!(descriptor.sub_commands(), again.sub_commands());
    }

    #[test]
    fn descriptor_rejects_empty_command() {
        assert!(CommandDescriptor::new("", 0.0).is_err());
        assert!(CommandDescriptor::new(" | ", 0.0).is_err());
        assert!(CommandDescriptor::new("ls", -1.0).is_err());
    }

    #[test]
    fn tokenize_respects_quotes() {
        let tokens = CommandDescriptor::tokenize("sh -c 'sleep 1; date'").expect("tokens");
        assert_eq!(tokens, ["sh", "-c", "sleep 1; date"]);
    }

    #[test]
    fn tokenize_rejects_unbalanced_quotes() {
        assert!(CommandDescriptor::tokenize("echo 'unterminated").is_err());
        assert!(CommandDescriptor::tokenize("   ").is_err());
    }

    #[test]
    fn entrypoint_deserializes_from_config_json() {
        let mut entrypoint: CommandEntrypoint = serde_json::from_value(serde_json::json!({
            "default": { "command": "pwd" },
            "methods": { "POST": { "command": "cat | wc -l", "timeout": 2.5 } },
            "pattern": "/ops/{target}"
        }))
        .expect("entrypoint");
        entrypoint.prepare().expect("prepare");
        let posted = entrypoint
            .methods
            .as_ref()
            .and_then(|m| m.get("POST"))
            .expect("POST descriptor");
        assert_eq!(posted.sub_commands(), ["cat", "wc -l"]);
        assert_eq!(posted.timeout, 2.5);
    }
}
