//! HTTP front of the agent: routing, request lifecycle, readiness and
//! graceful shutdown.

mod conn;
mod explain;
mod handlers;
mod router;
mod static_files;

pub use router::EXEC_BASEURL;
pub use router::EXEC_BASEURL_DEPRECATED;

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use hyper::Server;
use hyper::server::conn::AddrStream;
use hyper::service::make_service_fn;
use hyper::service::service_fn;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::info;
use tracing::warn;

use crate::command::CommandEntrypoint;
use crate::command::MAIN_RESOURCE;
use crate::command::normalize_method;
use crate::config::Configuration;
use crate::edition::Edition;
use crate::error::AgentErr;
use crate::executor::Executor;
use crate::restrictor::ReqRestrictor;
use crate::serializer::ReqSerializer;
use crate::settings;
use crate::state_store::StateStore;

use conn::TimedIncoming;
use conn::TimedStream;
use router::Router;

pub const DEFAULT_PORT: u16 = 17779;
const DEFAULT_MAX_HEADER_BYTES: usize = 1 << 22; // 4 MiB
const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

pub const REQ_HEADER_REQUEST_ID: &str = "Opwire-Request-Id";
pub const REQ_HEADER_EXECUTION_TIMEOUT: &str = "Opwire-Execution-Timeout";
pub const REQ_HEADER_SUPPRESS_EXECUTION: &str = "Opwire-Suppress-Running";
pub const REQ_HEADER_EXPLAIN_SUCCESS: &str = "Opwire-Explain-Success";
pub const REQ_HEADER_EXPLAIN_FAILURE: &str = "Opwire-Explain-Failure";

pub const RES_HEADER_ERROR_MESSAGE: &str = "X-Error-Message";
pub const RES_HEADER_EXEC_DURATION: &str = "X-Exec-Duration";

const OPWIRE_SETTINGS_PREFIX: &str = "OPWIRE_SETTINGS";

/// Startup options the CLI injects once; read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct ServeOptions {
    pub direct_command: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub static_mounts: HashMap<String, PathBuf>,
    pub edition: Edition,
}

pub(crate) struct ServerState {
    pub(crate) executor: Executor,
    pub(crate) restrictor: ReqRestrictor,
    pub(crate) serializer: ReqSerializer,
    pub(crate) state_store: StateStore,
    pub(crate) router: Router,
    pub(crate) explanation_enabled: bool,
    pub(crate) combine_output: bool,
    pub(crate) direct_command: Option<String>,
    pub(crate) edition_env: String,
    ready: AtomicI32,
}

impl ServerState {
    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) != 0
    }

    pub(crate) fn lock(&self) {
        self.ready.store(0, Ordering::Release);
    }

    pub(crate) fn unlock(&self) {
        self.ready.store(1, Ordering::Release);
    }
}

/// The agent server, configured and ready to bind.
pub struct AgentServer {
    state: Arc<ServerState>,
    addr: SocketAddr,
    max_header_bytes: usize,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    close_timeout: Duration,
}

impl AgentServer {
    /// Wire the components up from a validated configuration. The resource
    /// registry, the routing table and all options are frozen here.
    pub fn new(conf: Configuration, options: ServeOptions) -> Result<Self, AgentErr> {
        let mut executor = Executor::new();
        let mut resource_names = Vec::new();
        if let Some(main) = conf.main.as_ref() {
            register_resource(&mut executor, MAIN_RESOURCE, main, &conf)?;
            resource_names.push(MAIN_RESOURCE.to_string());
        }
        if let Some(resources) = conf.resources.as_ref() {
            for (name, entrypoint) in resources {
                register_resource(&mut executor, name, entrypoint, &conf)?;
                resource_names.push(name.clone());
            }
        }
        resource_names.sort();

        let mut static_mounts = HashMap::new();
        for (prefix, dir) in &options.static_mounts {
            if dir.is_dir() {
                info!(prefix = %prefix, dir = %dir.display(), "static mount registered");
                static_mounts.insert(prefix.clone(), dir.clone());
            } else {
                warn!(prefix = %prefix, dir = %dir.display(), "static mount skipped, not a directory");
            }
        }

        let router = Router::new(&conf, &static_mounts)?;
        let restrictor = ReqRestrictor::new(conf.http_server.as_ref());

        let state_store = StateStore::new();
        state_store.store("edition", serde_json::to_value(&options.edition)?);
        state_store.store("resources", serde_json::to_value(&resource_names)?);

        let addr = bind_addr(&conf, &options)?;
        let http = conf.http_server.as_ref();
        let read_timeout = http.and_then(|h| h.read_timeout());
        let write_timeout = http.and_then(|h| h.write_timeout());
        let close_timeout = http
            .and_then(|h| h.close_timeout())
            .or(write_timeout)
            .unwrap_or(DEFAULT_CLOSE_TIMEOUT);
        let max_header_bytes = http
            .and_then(|h| h.max_header_bytes)
            .unwrap_or(DEFAULT_MAX_HEADER_BYTES);

        let state = Arc::new(ServerState {
            executor,
            restrictor,
            serializer: ReqSerializer::new(),
            state_store,
            router,
            explanation_enabled: conf.explanation_enabled(),
            combine_output: conf.combine_stderr_stdout(),
            direct_command: options.direct_command.clone(),
            edition_env: options.edition.to_env_value(),
            ready: AtomicI32::new(0),
        });

        Ok(Self {
            state,
            addr,
            max_header_bytes,
            read_timeout,
            write_timeout,
            close_timeout,
        })
    }

    /// Bind the listener and start serving. The readiness flag flips to
    /// ready once the server task is running. Connections are wrapped with
    /// the configured read/write deadlines before hyper sees them.
    pub fn start(self) -> Result<ServerHandle, AgentErr> {
        let listener = std::net::TcpListener::bind(self.addr)?;
        listener.set_nonblocking(true)?;
        let incoming = TimedIncoming::new(listener, self.read_timeout, self.write_timeout)?;
        let local_addr = incoming.local_addr();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let state = self.state.clone();
        let make_svc = make_service_fn(move |conn: &TimedStream<AddrStream>| {
            let remote = conn.remote_addr();
            let state = state.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |request| {
                    handlers::handle_request(state.clone(), remote, request)
                }))
            }
        });

        let server = Server::builder(incoming)
            .http1_max_buf_size(self.max_header_bytes)
            .serve(make_svc)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
        let task = tokio::spawn(server);

        self.state.unlock();
        self.state
            .state_store
            .store("listen-addr", serde_json::Value::from(local_addr.to_string()));
        info!(addr = %local_addr, "agent server is listening");

        Ok(ServerHandle {
            local_addr,
            state: self.state,
            close_timeout: self.close_timeout,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// Serve until a termination signal arrives, then drain gracefully.
    pub async fn serve(self) -> Result<(), AgentErr> {
        let mut handle = self.start()?;
        tokio::select! {
            _ = shutdown_signal() => {
                info!("termination signal received, agent is shutting down");
                handle.shutdown().await
            }
            result = handle.join() => result,
        }
    }
}

/// A running server: readiness control and the shutdown state machine.
pub struct ServerHandle {
    local_addr: SocketAddr,
    state: Arc<ServerState>,
    close_timeout: Duration,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<(), hyper::Error>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    pub fn lock(&self) {
        self.state.lock();
    }

    pub fn unlock(&self) {
        self.state.unlock();
    }

    /// Wait for the server task to end on its own (listener failure).
    pub async fn join(&mut self) -> Result<(), AgentErr> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let result = flatten_serve(task.await);
        self.task = None;
        result
    }

    /// Drain and stop: flip readiness off, give in-flight requests the close
    /// timeout to finish, then shut the listener down and wait once more.
    pub async fn shutdown(&mut self) -> Result<(), AgentErr> {
        if self.state.is_ready() {
            self.state.lock();
            info!(timeout = ?self.close_timeout, "no new requests allowed, draining");
            tokio::time::sleep(self.close_timeout).await;
        }
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            match tokio::time::timeout(self.close_timeout, task).await {
                Ok(joined) => flatten_serve(joined)?,
                Err(_) => warn!("server did not stop within the close timeout"),
            }
        }
        info!("agent server is closed");
        Ok(())
    }
}

fn flatten_serve(
    joined: Result<Result<(), hyper::Error>, tokio::task::JoinError>,
) -> Result<(), AgentErr> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(AgentErr::Io(std::io::Error::other(error))),
        Err(error) => Err(AgentErr::Io(std::io::Error::other(error))),
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::SignalKind;
    use tokio::signal::unix::signal;

    let mut terminate = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut tstp = signal(SignalKind::from_raw(libc::SIGTSTP)).expect("install SIGTSTP handler");
    tokio::select! {
        _ = terminate.recv() => {}
        _ = tstp.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn register_resource(
    executor: &mut Executor,
    name: &str,
    entrypoint: &CommandEntrypoint,
    conf: &Configuration,
) -> Result<(), AgentErr> {
    if let Some(default) = entrypoint.default.as_ref() {
        if name == MAIN_RESOURCE {
            executor.register(default, &[])?;
        } else {
            executor.register(default, &[name])?;
        }
    }
    if let Some(methods) = entrypoint.methods.as_ref() {
        for (method, descriptor) in methods {
            if let Some(canonical) = normalize_method(method) {
                executor.register(descriptor, &[name, canonical.as_str()])?;
            }
        }
    }

    let merged = settings::combine(entrypoint.settings.as_ref(), conf.settings.as_ref());
    if !merged.is_empty() {
        let format = entrypoint
            .settings_format
            .as_deref()
            .or(conf.settings_format.as_deref())
            .unwrap_or("json");
        executor.store_settings(OPWIRE_SETTINGS_PREFIX, &merged, format, name)?;
    }
    Ok(())
}

fn bind_addr(conf: &Configuration, options: &ServeOptions) -> Result<SocketAddr, AgentErr> {
    let http = conf.http_server.as_ref();
    let mut host = http
        .and_then(|h| h.host.clone())
        .filter(|h| !h.is_empty())
        .unwrap_or_default();
    if let Some(given) = options.host.as_ref().filter(|h| !h.is_empty()) {
        host = given.clone();
    }
    if host.is_empty() {
        host = "0.0.0.0".to_string();
    }

    let mut port = http.and_then(|h| h.port).unwrap_or(DEFAULT_PORT);
    if let Some(given) = options.port {
        port = given;
    }

    format!("{host}:{port}")
        .to_socket_addrs()
        .map_err(AgentErr::Io)?
        .next()
        .ok_or_else(|| AgentErr::Config(format!("cannot resolve listen address {host}:{port}")))
}
