//! Human-readable rendering of a request and its result, used by the
//! explanation headers instead of (or after) executing the command.

use serde_json::Map;
use serde_json::Value;

use crate::command::CommandInvocation;
use crate::error::AgentErr;
use crate::executor::Executor;
use crate::serializer::OPWIRE_REQUEST;
use crate::state_store::StateStore;
use crate::text::Alignment;
use crate::text::pad_string;

use super::OPWIRE_SETTINGS_PREFIX;

const LINE_LENGTH: usize = 80;
const SEED: &str = "-";

#[derive(Debug, Clone, Copy, Default)]
pub struct TextFormatter;

impl TextFormatter {
    pub fn print_section(&self, buf: &mut String, label: &str, data: &str) {
        if data.is_empty() {
            return;
        }
        let header = pad_string(&format!("[{label}"), Alignment::Left, LINE_LENGTH, SEED);
        let footer = pad_string(&format!("{label}]"), Alignment::Right, LINE_LENGTH, SEED);
        buf.push_str(&format!("\n{header}\n{data}\n{footer}\n"));
    }

    pub fn print_collection(&self, buf: &mut String, label: &str, items: &[String]) {
        if items.is_empty() {
            return;
        }
        let lines: Vec<String> = items
            .iter()
            .enumerate()
            .map(|(index, item)| format!("{}) {item}", index + 1))
            .collect();
        self.print_section(buf, label, &lines.join("\n"));
    }

    /// Pretty-print `text` as JSON when it parses, dump it verbatim when not.
    pub fn print_json_string(&self, buf: &mut String, label: &str, text: &str) {
        if text.is_empty() {
            return;
        }
        match serde_json::from_str::<Map<String, Value>>(text) {
            Ok(object) => self.print_json_object(buf, label, &object),
            Err(_) => self.print_section(buf, &format!("{label} (text)"), text),
        }
    }

    pub fn print_json_object(&self, buf: &mut String, label: &str, object: &Map<String, Value>) {
        if object.is_empty() {
            return;
        }
        if let Ok(pretty) = serde_json::to_string_pretty(object) {
            self.print_section(buf, label, &pretty);
        }
    }
}

/// Render the "what would run" part of an explanation.
pub fn render_request(
    formatter: &TextFormatter,
    executor: &Executor,
    state_store: &StateStore,
    invocation: &CommandInvocation,
    stdin: &[u8],
) -> String {
    let mut buf = String::new();

    if let Some(edition) = state_store.get_as_json("edition") {
        formatter.print_json_string(&mut buf, "edition", &edition);
    }
    if let Some(request) = env_value(invocation, OPWIRE_REQUEST) {
        formatter.print_json_string(&mut buf, "request", request);
    }

    let mut resolved_resource: Option<String> = None;
    match invocation.direct_command.as_deref().filter(|c| !c.is_empty()) {
        Some(direct) => {
            formatter.print_section(&mut buf, "command", &format!("direct-command: \"{direct}\""));
        }
        None => {
            let mut command_info = Map::new();

            let mut provided = Map::new();
            provided.insert(
                "resource".to_string(),
                Value::from(invocation.resource_name.clone().unwrap_or_default()),
            );
            provided.insert("method".to_string(), Value::from(invocation.method_name.clone()));
            if invocation.execution_timeout > 0.0 {
                provided.insert("timeout".to_string(), Value::from(invocation.execution_timeout));
            }
            command_info.insert("provided".to_string(), Value::Object(provided));

            let mut resolved = Map::new();
            if let Ok((descriptor, resource, method)) =
                executor.resolve_command_descriptor(invocation)
            {
                resolved.insert("resource".to_string(), Value::from(resource.clone()));
                resolved.insert("method".to_string(), Value::from(method));
                resolved.insert("command".to_string(), Value::from(descriptor.command.clone()));
                let timeout = Executor::execution_timeout(&descriptor, invocation);
                if timeout > 0.0 {
                    resolved.insert("timeout".to_string(), Value::from(timeout));
                }
                resolved_resource = resource;
            }
            command_info.insert("resolved".to_string(), Value::Object(resolved));

            formatter.print_json_object(&mut buf, "command", &command_info);
        }
    }

    if let Some(resource) = resolved_resource.as_deref() {
        let settings = executor.get_settings(resource);
        match settings {
            [(key, value)] if key == OPWIRE_SETTINGS_PREFIX => {
                formatter.print_json_string(&mut buf, "settings", value);
            }
            _ => {
                let rendered: Vec<String> = settings
                    .iter()
                    .map(|(key, value)| format!("{key}={value}"))
                    .collect();
                formatter.print_collection(&mut buf, "settings", &rendered);
            }
        }
    }

    formatter.print_section(&mut buf, "stdin", &String::from_utf8_lossy(stdin));
    buf
}

/// Render a full explanation: the request plus what the execution produced.
#[allow(clippy::too_many_arguments)]
pub fn render_result(
    formatter: &TextFormatter,
    executor: &Executor,
    state_store: &StateStore,
    invocation: &CommandInvocation,
    stdin: &[u8],
    error: Option<&AgentErr>,
    stdout: &[u8],
    stderr: &[u8],
) -> String {
    let mut buf = render_request(formatter, executor, state_store, invocation, stdin);
    match error {
        Some(error) => {
            formatter.print_section(&mut buf, "stderr", &String::from_utf8_lossy(stderr));
            formatter.print_section(&mut buf, "error", &error.to_string());
        }
        None => {
            formatter.print_section(&mut buf, "stdout", &String::from_utf8_lossy(stdout));
        }
    }
    buf
}

fn env_value<'a>(invocation: &'a CommandInvocation, key: &str) -> Option<&'a str> {
    invocation
        .envs
        .iter()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.as_str())
}
