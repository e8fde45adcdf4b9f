//! Resource registry and command execution.
//!
//! The executor owns the mapping from `(resource, method)` to command
//! descriptors, resolves an invocation to the descriptor that should run,
//! and drives the pipe chain with the configured timeout and the request's
//! cancellation scope.

use std::collections::HashMap;
use std::time::Duration;
use std::time::Instant;

use serde_json::Map;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::command::CommandDescriptor;
use crate::command::CommandInvocation;
use crate::command::ExecutionState;
use crate::command::MAIN_RESOURCE;
use crate::error::AgentErr;
use crate::pipe_chain::ChainInput;
use crate::pipe_chain::OutputSink;
use crate::pipe_chain::PipeChain;
use crate::settings;

#[derive(Debug, Default)]
struct Entrypoint {
    default: Option<CommandDescriptor>,
    methods: HashMap<String, CommandDescriptor>,
}

#[derive(Debug, Default)]
pub struct Executor {
    commands: HashMap<String, Entrypoint>,
    settings_envs: HashMap<String, Vec<(String, String)>>,
}

impl Executor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a descriptor. Zero names target the main resource, one name a
    /// resource default, two names a method of a resource.
    ///
    /// Registering a default clears any methods registered for that resource
    /// before: the default is the base the method table refines, so a new
    /// base resets the table.
    pub fn register(
        &mut self,
        descriptor: &CommandDescriptor,
        names: &[&str],
    ) -> Result<(), AgentErr> {
        let (resource, method) = match names {
            [] => (MAIN_RESOURCE, None),
            [resource] => (*resource, None),
            [resource, method, ..] => (*resource, Some(*method)),
        };
        if resource.is_empty() || method.is_some_and(str::is_empty) {
            return Err(AgentErr::Config(
                "resource and method names must not be empty".to_string(),
            ));
        }
        let mut prepared = descriptor.clone();
        prepared.prepare()?;

        let entrypoint = self.commands.entry(resource.to_string()).or_default();
        match method {
            None => {
                entrypoint.default = Some(prepared);
                entrypoint.methods.clear();
            }
            Some(method) => {
                entrypoint
                    .methods
                    .insert(method.to_uppercase(), prepared);
            }
        }
        Ok(())
    }

    /// Encode and cache the settings env entries for one resource.
    pub fn store_settings(
        &mut self,
        prefix: &str,
        settings: &Map<String, Value>,
        format: &str,
        resource_name: &str,
    ) -> Result<(), AgentErr> {
        let envs = settings::to_envs(prefix, settings, format)?;
        self.settings_envs.insert(resource_name.to_string(), envs);
        Ok(())
    }

    pub fn get_settings(&self, resource_name: &str) -> &[(String, String)] {
        self.settings_envs
            .get(resource_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Pick the descriptor an invocation should run.
    ///
    /// A direct command wins over the registry; otherwise the resource (main
    /// when unnamed) is looked up and the method table consulted before the
    /// default. Returns the descriptor plus the resolved resource and method
    /// names (both absent for a direct command).
    pub fn resolve_command_descriptor(
        &self,
        invocation: &CommandInvocation,
    ) -> Result<(CommandDescriptor, Option<String>, Option<String>), AgentErr> {
        if let Some(direct) = invocation
            .direct_command
            .as_deref()
            .filter(|cmd| !cmd.is_empty())
        {
            let descriptor = CommandDescriptor::new(direct, 0.0)?;
            return Ok((descriptor, None, None));
        }

        let resource = invocation
            .resource_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(MAIN_RESOURCE);
        let entrypoint = self
            .commands
            .get(resource)
            .ok_or_else(|| AgentErr::Resolution {
                resource: resource.to_string(),
            })?;

        let method = invocation.method_name.to_uppercase();
        if let Some(descriptor) = entrypoint.methods.get(&method) {
            return Ok((
                descriptor.clone(),
                Some(resource.to_string()),
                Some(method),
            ));
        }
        let descriptor = entrypoint
            .default
            .clone()
            .ok_or_else(|| AgentErr::Resolution {
                resource: resource.to_string(),
            })?;
        Ok((descriptor, Some(resource.to_string()), None))
    }

    /// Effective timeout in seconds: invocation override, else descriptor,
    /// else none.
    pub fn execution_timeout(descriptor: &CommandDescriptor, invocation: &CommandInvocation) -> f64 {
        if invocation.execution_timeout > 0.0 {
            invocation.execution_timeout
        } else if descriptor.timeout > 0.0 {
            descriptor.timeout
        } else {
            0.0
        }
    }

    /// Run the invocation, streaming `input` into the chain and collecting
    /// stdout/stderr into the sinks.
    ///
    /// The execution state always carries the wall-clock duration; the
    /// timeout flag is set only when the timeout killed the chain — a plain
    /// cancellation surfaces the chain's own error without it.
    pub async fn run(
        &self,
        input: Option<ChainInput>,
        invocation: &CommandInvocation,
        out: OutputSink,
        err: OutputSink,
    ) -> (ExecutionState, Result<(), AgentErr>) {
        let started = Instant::now();
        let mut state = ExecutionState::default();

        let resolved = self.resolve_command_descriptor(invocation);
        let (descriptor, resource, _method) = match resolved {
            Ok(resolved) => resolved,
            Err(error) => {
                state.duration = started.elapsed();
                return (state, Err(error));
            }
        };
        let settings_envs = resource
            .as_deref()
            .map(|name| self.get_settings(name))
            .unwrap_or_default();
        let commands = match build_commands(&descriptor, invocation, settings_envs) {
            Ok(commands) => commands,
            Err(error) => {
                state.duration = started.elapsed();
                return (state, Err(error));
            }
        };

        let timeout = Self::execution_timeout(&descriptor, invocation);
        debug!(
            resource = resource.as_deref().unwrap_or("<direct>"),
            method = %invocation.method_name,
            request_id = invocation.request_id.as_deref().unwrap_or_default(),
            timeout,
            "running command chain"
        );

        let chain = PipeChain::new();
        let guard = StopGuard::arm(chain.clone());
        let mut worker = tokio::spawn(chain.clone().run(input, out, err, commands));

        let result = match invocation.cancel.clone() {
            Some(scope) => {
                tokio::select! {
                    joined = &mut worker => flatten(joined),
                    _ = sleep_secs(timeout), if timeout > 0.0 => {
                        chain.stop();
                        state.is_timeout = true;
                        flatten(worker.await)
                    }
                    _ = scope.cancelled() => {
                        chain.stop();
                        flatten(worker.await)
                    }
                }
            }
            None if timeout > 0.0 => {
                tokio::select! {
                    joined = &mut worker => flatten(joined),
                    _ = sleep_secs(timeout) => {
                        chain.stop();
                        state.is_timeout = true;
                        flatten(worker.await)
                    }
                }
            }
            None => flatten(worker.await),
        };
        guard.disarm();

        state.duration = started.elapsed();
        (state, result)
    }
}

/// Kills the chain if the owning future is dropped before completion.
struct StopGuard {
    chain: PipeChain,
    armed: bool,
}

impl StopGuard {
    fn arm(chain: PipeChain) -> Self {
        Self { chain, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        if self.armed {
            self.chain.stop();
        }
    }
}

async fn sleep_secs(seconds: f64) {
    if seconds > 0.0 {
        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
    } else {
        std::future::pending::<()>().await;
    }
}

fn flatten(
    joined: Result<Result<(), AgentErr>, tokio::task::JoinError>,
) -> Result<(), AgentErr> {
    match joined {
        Ok(result) => result,
        Err(join_error) => Err(AgentErr::Io(std::io::Error::other(join_error))),
    }
}

fn build_commands(
    descriptor: &CommandDescriptor,
    invocation: &CommandInvocation,
    settings_envs: &[(String, String)],
) -> Result<Vec<Command>, AgentErr> {
    let mut env_pairs = invocation.envs.clone();
    env_pairs.extend(settings_envs.iter().cloned());

    let mut commands = Vec::with_capacity(descriptor.sub_commands().len());
    for sub_command in descriptor.sub_commands() {
        let tokens = CommandDescriptor::tokenize(sub_command)?;
        let mut command = Command::new(&tokens[0]);
        command.args(&tokens[1..]);
        if !env_pairs.is_empty() {
            command.env_clear();
            command.envs(env_pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        commands.push(command);
    }
    Ok(commands)
}
