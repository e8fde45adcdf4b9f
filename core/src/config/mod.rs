//! Configuration model and loading.
//!
//! The file is JSON with kebab-case keys. Loading goes through three steps:
//! locate (search series), parse (serde), validate (explicit checks). The
//! rest of the agent only ever sees a `Configuration` that passed all three.

mod fs;
mod locator;
mod validator;

pub use fs::FileSystem;
pub use fs::OsFileSystem;
pub use locator::Locator;
pub use validator::RESOURCE_NAME_PATTERN;
pub use validator::Validator;

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use tracing::info;

use crate::command::CommandEntrypoint;
use crate::error::AgentErr;
use crate::text::parse_duration;
use crate::text::split_trimmed;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Configuration {
    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub agent: Option<AgentConf>,

    #[serde(default, rename = "main-resource")]
    pub main: Option<CommandEntrypoint>,

    #[serde(default)]
    pub resources: Option<HashMap<String, CommandEntrypoint>>,

    #[serde(default)]
    pub settings: Option<Map<String, Value>>,

    #[serde(default)]
    pub settings_format: Option<String>,

    #[serde(default)]
    pub http_server: Option<HttpServerConf>,

    #[serde(default)]
    pub logging: Option<LoggingConf>,
}

impl Configuration {
    /// Derive sub-command lists for every descriptor in the file.
    pub fn prepare(&mut self) -> Result<(), AgentErr> {
        if let Some(main) = self.main.as_mut() {
            main.prepare()?;
        }
        if let Some(resources) = self.resources.as_mut() {
            for entrypoint in resources.values_mut() {
                entrypoint.prepare()?;
            }
        }
        Ok(())
    }

    pub fn explanation_enabled(&self) -> bool {
        self.agent
            .as_ref()
            .and_then(|agent| agent.explanation_enabled)
            .unwrap_or(false)
    }

    pub fn combine_stderr_stdout(&self) -> bool {
        self.agent
            .as_ref()
            .and_then(|agent| agent.combine_stderr_stdout)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AgentConf {
    #[serde(default)]
    pub explanation_enabled: Option<bool>,

    #[serde(default)]
    pub combine_stderr_stdout: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HttpServerConf {
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub baseurl: Option<String>,

    #[serde(default)]
    pub max_header_bytes: Option<usize>,

    #[serde(default)]
    pub read_timeout: Option<String>,

    #[serde(default)]
    pub write_timeout: Option<String>,

    #[serde(default)]
    pub close_timeout: Option<String>,

    #[serde(default)]
    pub concurrent_limit_enabled: Option<bool>,

    #[serde(default)]
    pub concurrent_limit_total: Option<usize>,

    #[serde(default)]
    pub single_flight_enabled: Option<bool>,

    #[serde(default)]
    pub single_flight_req_id: Option<String>,

    #[serde(default)]
    pub single_flight_by_method: Option<bool>,

    #[serde(default)]
    pub single_flight_by_path: Option<bool>,

    #[serde(default)]
    pub single_flight_by_headers: Option<String>,

    #[serde(default)]
    pub single_flight_by_queries: Option<String>,

    #[serde(default)]
    pub single_flight_by_body: Option<bool>,

    #[serde(default)]
    pub single_flight_by_userip: Option<bool>,

    #[serde(default)]
    pub single_flight_body_limit: Option<usize>,

    #[serde(default)]
    pub single_flight_bind_followers: Option<bool>,
}

impl HttpServerConf {
    pub fn concurrent_limit_enabled(&self) -> bool {
        self.concurrent_limit_enabled.unwrap_or(false)
    }

    pub fn concurrent_limit_total(&self) -> usize {
        self.concurrent_limit_total.unwrap_or(0)
    }

    pub fn single_flight_enabled(&self) -> bool {
        self.single_flight_enabled.unwrap_or(false)
    }

    pub fn single_flight_by_headers(&self) -> Vec<String> {
        self.single_flight_by_headers
            .as_deref()
            .map(|raw| split_trimmed(raw, ','))
            .unwrap_or_default()
    }

    pub fn single_flight_by_queries(&self) -> Vec<String> {
        self.single_flight_by_queries
            .as_deref()
            .map(|raw| split_trimmed(raw, ','))
            .unwrap_or_default()
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout.as_deref().and_then(parse_duration)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout.as_deref().and_then(parse_duration)
    }

    pub fn close_timeout(&self) -> Option<Duration> {
        self.close_timeout.as_deref().and_then(parse_duration)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LoggingConf {
    #[serde(default)]
    pub enabled: Option<bool>,

    #[serde(default)]
    pub format: Option<String>,

    #[serde(default)]
    pub level: Option<String>,
}

/// Locates, parses and validates the configuration file.
pub struct Manager {
    fs: Arc<dyn FileSystem>,
    locator: Locator,
    validator: Validator,
}

impl Manager {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            locator: Locator::new(fs.clone()),
            validator: Validator::new(),
            fs,
        }
    }

    /// Load the configuration, if any file is found.
    ///
    /// Returns the parsed configuration together with the path it came from.
    /// No file at all is not an error; an unreadable, unparseable or invalid
    /// file is.
    pub fn load(
        &self,
        arg_config_path: Option<&Path>,
    ) -> Result<Option<(Configuration, PathBuf)>, AgentErr> {
        let Some((path, source)) = self.locator.config_path(arg_config_path) else {
            info!("configuration file not found");
            return Ok(None);
        };
        info!(path = %path.display(), source = %source, "configuration located");

        let raw = self.fs.read(&path).map_err(|error| {
            AgentErr::Config(format!("failed to read {}: {error}", path.display()))
        })?;
        let mut configuration: Configuration =
            serde_json::from_slice(&raw).map_err(|error| {
                AgentErr::Config(format!("failed to parse {}: {error}", path.display()))
            })?;
        configuration.prepare()?;

        let problems = self.validator.validate(&configuration);
        if !problems.is_empty() {
            let mut lines = vec!["the configuration is not valid, errors:".to_string()];
            lines.extend(problems);
            return Err(AgentErr::Config(lines.join("\n - ")));
        }
        Ok(Some((configuration, path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn full_configuration_parses() {
        let mut configuration: Configuration = serde_json::from_str(
            r#"{
                "version": "v1.1.0",
                "agent": { "explanation-enabled": true },
                "main-resource": { "default": { "command": "echo main" } },
                "resources": {
                    "echo": {
                        "default": { "command": "grep hello" },
                        "methods": { "post": { "command": "wc -l" } },
                        "pattern": "/echo/{word}"
                    }
                },
                "settings": { "shared": 1 },
                "settings-format": "flat",
                "http-server": {
                    "port": 17779,
                    "baseurl": "/$",
                    "close-timeout": "2s",
                    "concurrent-limit-enabled": true,
                    "single-flight-enabled": true,
                    "single-flight-by-headers": "X-A, X-B"
                },
                "logging": { "level": "debug", "format": "json" }
            }"#,
        )
        .expect("configuration");
        configuration.prepare().expect("prepare");

        assert!(configuration.explanation_enabled());
        assert!(!configuration.combine_stderr_stdout());
        let http = configuration.http_server.expect("http-server");
        assert_eq!(http.port, Some(17779));
        assert_eq!(http.close_timeout(), Some(Duration::from_secs(2)));
        assert_eq!(http.single_flight_by_headers(), vec!["X-A", "X-B"]);
        assert!(http.concurrent_limit_enabled());
    }

    #[test]
    fn missing_sections_default_off() {
        let configuration: Configuration = serde_json::from_str("{}").expect("configuration");
        assert!(!configuration.explanation_enabled());
        assert!(configuration.http_server.is_none());
    }
}
