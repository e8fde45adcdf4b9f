//! opwire-core: expose command-line programs as a disciplined HTTP service.
//!
//! An operator declares named resources binding HTTP paths and methods to
//! shell command pipelines; the agent turns each request into a bounded
//! subprocess invocation, streaming the request body into the first process
//! and answering with the last process's output.

pub mod cancel;
pub mod command;
pub mod config;
pub mod edition;
pub mod error;
pub mod executor;
pub mod pipe_chain;
pub mod restrictor;
pub mod serializer;
pub mod server;
pub mod settings;
pub mod state_store;
pub mod text;

pub use command::CommandDescriptor;
pub use command::CommandEntrypoint;
pub use command::CommandInvocation;
pub use command::ExecutionState;
pub use command::MAIN_RESOURCE;
pub use config::Configuration;
pub use config::Manager as ConfigManager;
pub use config::OsFileSystem;
pub use edition::Edition;
pub use error::AgentErr;
pub use executor::Executor;
pub use pipe_chain::PipeChain;
pub use restrictor::ReqRestrictor;
pub use serializer::ReqSerializer;
pub use serializer::RequestPacket;
pub use server::AgentServer;
pub use server::ServeOptions;
pub use server::ServerHandle;
pub use state_store::StateStore;
