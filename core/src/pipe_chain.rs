//! Process pipeline runner.
//!
//! Spawns an ordered chain of child processes, feeds the first one from an
//! input reader, pipes every stdout into the next stdin, funnels every
//! stderr into a shared sink and waits for the chain front-to-back. A
//! [`PipeChain::stop`] kills whatever is still alive; the invariant is that
//! no child survives its invocation.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::error::AgentErr;

/// Shared byte buffer a stream reader appends into.
pub type OutputSink = Arc<Mutex<Vec<u8>>>;

/// Boxed reader feeding the first process's stdin.
pub type ChainInput = Box<dyn AsyncRead + Send + Unpin>;

const READ_CHUNK_SIZE: usize = 8192;

pub fn new_sink() -> OutputSink {
    Arc::new(Mutex::new(Vec::new()))
}

/// Drain a sink, leaving it empty.
pub fn take_sink(sink: &OutputSink) -> Vec<u8> {
    std::mem::take(&mut *sink.lock().unwrap_or_else(|e| e.into_inner()))
}

#[derive(Debug, Clone, Default)]
pub struct PipeChain {
    stopped: Arc<AtomicBool>,
    stop_signal: Arc<Notify>,
}

impl PipeChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request immediate termination of the chain. Idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.stop_signal.notify_one();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Run the chain to completion.
    ///
    /// Returns the error of the first failing process; a process killed via
    /// [`stop`](Self::stop) surfaces whatever status the kill produced.
    pub async fn run(
        self,
        input: Option<ChainInput>,
        out: OutputSink,
        err: OutputSink,
        commands: Vec<Command>,
    ) -> Result<(), AgentErr> {
        if commands.is_empty() {
            return Err(AgentErr::Config("command chain is empty".to_string()));
        }
        let count = commands.len();
        let mut children: Vec<Child> = Vec::with_capacity(count);
        let mut programs: Vec<String> = Vec::with_capacity(count);
        let mut io_tasks: Vec<JoinHandle<()>> = Vec::new();
        let mut input = input;
        let mut upstream = None;

        for (index, mut command) in commands.into_iter().enumerate() {
            if self.is_stopped() {
                debug!(index, "stop observed before start, skipping the rest of the chain");
                break;
            }
            let program = command
                .as_std()
                .get_program()
                .to_string_lossy()
                .into_owned();
            command.stdout(Stdio::piped());
            command.stderr(Stdio::piped());
            if index > 0 || input.is_some() {
                command.stdin(Stdio::piped());
            } else {
                command.stdin(Stdio::null());
            }
            command.kill_on_drop(true);

            let mut child = match command.spawn() {
                Ok(child) => child,
                Err(source) => {
                    kill_from(&mut children, 0, &programs);
                    return Err(AgentErr::Spawn { program, source });
                }
            };

            if let Some(stderr) = child.stderr.take() {
                io_tasks.push(tokio::spawn(copy_to_sink(stderr, err.clone())));
            }
            if index == 0 {
                if let (Some(stdin), Some(reader)) = (child.stdin.take(), input.take()) {
                    io_tasks.push(tokio::spawn(pump(reader, stdin)));
                }
            } else if let (Some(stdin), Some(prev)) = (child.stdin.take(), upstream.take()) {
                io_tasks.push(tokio::spawn(pump(prev, stdin)));
            }
            if index == count - 1 {
                if let Some(stdout) = child.stdout.take() {
                    io_tasks.push(tokio::spawn(copy_to_sink(stdout, out.clone())));
                }
            } else {
                upstream = child.stdout.take();
            }

            programs.push(program);
            children.push(child);
        }

        if children.is_empty() {
            return Err(AgentErr::Io(std::io::Error::other(
                "pipeline stopped before any process started",
            )));
        }

        let mut failure: Option<AgentErr> = None;
        for index in 0..children.len() {
            if self.is_stopped() {
                kill_from(&mut children, index, &programs);
            }
            let waited = tokio::select! {
                status = children[index].wait() => Some(status),
                _ = self.stop_signal.notified() => None,
            };
            let status = match waited {
                Some(status) => status,
                None => {
                    // Stop arrived while waiting: kill everything still
                    // running, then reap the current process for its status.
                    kill_from(&mut children, index, &programs);
                    children[index].wait().await
                }
            };
            let status = match status {
                Ok(status) => status,
                Err(source) => {
                    kill_from(&mut children, index, &programs);
                    failure = Some(AgentErr::Io(source));
                    break;
                }
            };
            // Closing of this process's stdout pipe (EOF downstream) follows
            // its exit; the pump task drops the next stdin right after.
            if !status.success() {
                kill_from(&mut children, index + 1, &programs);
                failure = Some(AgentErr::Pipeline {
                    program: programs[index].clone(),
                    status,
                });
                break;
            }
        }

        // Let the stream readers run to EOF so no output bytes are lost and
        // no pipe reader leaks.
        for task in io_tasks {
            let _ = task.await;
        }

        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn kill_from(children: &mut [Child], from: usize, programs: &[String]) {
    for (offset, child) in children.iter_mut().enumerate().skip(from) {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(index = offset, program = %programs[offset], %status, "process already finished");
            }
            _ => {
                debug!(index = offset, program = %programs[offset], "process is running, killing it now");
                if let Err(error) = child.start_kill() {
                    warn!(index = offset, program = %programs[offset], %error, "kill failed");
                }
            }
        }
    }
}

async fn copy_to_sink<R>(mut reader: R, sink: OutputSink)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                sink.lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .extend_from_slice(&chunk[..n]);
            }
        }
    }
}

async fn pump<R, W>(mut reader: R, mut writer: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // A broken pipe just means the downstream process went away first.
    let _ = tokio::io::copy(&mut reader, &mut writer).await;
}
