//! Per-request handling: admission, execution, response mapping.
//!
//! This is the single translation point between the error domain and wire
//! responses.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::Body;
use hyper::HeaderMap;
use hyper::Method;
use hyper::Request;
use hyper::Response;
use hyper::StatusCode;
use hyper::body::HttpBody;
use tokio::io::AsyncWriteExt;
use tokio::io::DuplexStream;
use tracing::info;

use crate::cancel;
use crate::command::CommandInvocation;
use crate::command::normalize_method;
use crate::edition::OPWIRE_EDITION;
use crate::error::AgentErr;
use crate::executor::Executor;
use crate::pipe_chain::ChainInput;
use crate::pipe_chain::OutputSink;
use crate::pipe_chain::new_sink;
use crate::pipe_chain::take_sink;
use crate::restrictor::DigestInput;
use crate::restrictor::ExecOutcome;
use crate::serializer::OPWIRE_REQUEST;
use crate::text::parse_duration;

use super::REQ_HEADER_EXECUTION_TIMEOUT;
use super::REQ_HEADER_EXPLAIN_FAILURE;
use super::REQ_HEADER_EXPLAIN_SUCCESS;
use super::REQ_HEADER_REQUEST_ID;
use super::REQ_HEADER_SUPPRESS_EXECUTION;
use super::RES_HEADER_ERROR_MESSAGE;
use super::RES_HEADER_EXEC_DURATION;
use super::ServerState;
use super::explain;
use super::explain::TextFormatter;
use super::router::Route;
use super::static_files;

const BODY_PIPE_CAPACITY: usize = 64 * 1024;

pub(crate) async fn handle_request(
    state: Arc<ServerState>,
    remote: SocketAddr,
    request: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let path = request.uri().path().to_string();
    let response = match state.router.resolve(&path) {
        None => status_response(StatusCode::NOT_FOUND),
        Some(Route::Health) => health(&state, request.method()),
        Some(Route::Lock) => {
            state.lock();
            status_response(StatusCode::OK)
        }
        Some(Route::Unlock) => {
            state.unlock();
            status_response(StatusCode::OK)
        }
        Some(Route::Static { root, rest }) => static_files::serve(&root, &rest).await,
        Some(Route::Exec { resource }) => {
            execute(state.clone(), remote, request, resource, true, BTreeMap::new()).await
        }
        Some(Route::Pattern { resource, params }) => {
            execute(state.clone(), remote, request, Some(resource), false, params).await
        }
    };
    Ok(response)
}

fn health(state: &ServerState, method: &Method) -> Response<Body> {
    if !state.is_ready() {
        return json_response(StatusCode::SERVICE_UNAVAILABLE, "{\"ready\":false}");
    }
    if method == Method::GET {
        json_response(StatusCode::OK, "{\"ready\":true,\"alive\":true}")
    } else {
        status_response(StatusCode::METHOD_NOT_ALLOWED)
    }
}

async fn execute(
    state: Arc<ServerState>,
    remote: SocketAddr,
    request: Request<Body>,
    resource: Option<String>,
    default_url: bool,
    params: BTreeMap<String, String>,
) -> Response<Body> {
    if !state.is_ready() {
        return status_response(StatusCode::SERVICE_UNAVAILABLE);
    }
    let Some(method) = normalize_method(request.method().as_str()) else {
        return status_response(StatusCode::METHOD_NOT_ALLOWED);
    };
    let (suppress, explain_success, explain_failure) = if state.explanation_enabled {
        (
            has_header(request.headers(), REQ_HEADER_SUPPRESS_EXECUTION),
            has_header(request.headers(), REQ_HEADER_EXPLAIN_SUCCESS),
            has_header(request.headers(), REQ_HEADER_EXPLAIN_FAILURE),
        )
    } else {
        (false, false, false)
    };

    let (parts, body) = request.into_parts();

    let packet_params = (!default_url).then_some(&params);
    let encoded = match state
        .serializer
        .encode(&parts.method, &parts.uri, &parts.headers, packet_params)
    {
        Ok(encoded) => encoded,
        Err(error) => return error_response(StatusCode::BAD_REQUEST, &error),
    };

    // The body is buffered only when the fingerprint needs it or when a
    // suppressed run must display it; otherwise it streams into the chain.
    let capture: Option<OutputSink> = state.explanation_enabled.then(new_sink);
    let wants_body = state.restrictor.has_single_flight() && state.restrictor.wants_body();
    let mut fingerprint_body: Option<Vec<u8>> = None;
    let input: ChainInput = if wants_body || suppress {
        let limit = wants_body.then(|| state.restrictor.body_limit());
        let bytes = match read_body(body, limit).await {
            Ok(bytes) => bytes,
            Err(BodyError::TooLarge) => {
                return text_plain(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    Body::from("request body exceeds the configured buffering limit"),
                );
            }
            Err(BodyError::Io(error)) => {
                return error_response(StatusCode::BAD_REQUEST, &AgentErr::Io(error));
            }
        };
        if let Some(capture) = capture.as_ref() {
            capture
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .extend_from_slice(&bytes);
        }
        if wants_body {
            fingerprint_body = Some(bytes.clone());
        }
        Box::new(std::io::Cursor::new(bytes))
    } else {
        let (writer, reader) = tokio::io::duplex(BODY_PIPE_CAPACITY);
        tokio::spawn(pump_body(body, writer, capture.clone()));
        Box::new(reader)
    };

    let mut envs: Vec<(String, String)> = std::env::vars().collect();
    envs.push((OPWIRE_EDITION.to_string(), state.edition_env.clone()));
    envs.push((OPWIRE_REQUEST.to_string(), encoded));

    let request_id = header_string(&parts.headers, REQ_HEADER_REQUEST_ID);
    let execution_timeout = header_string(&parts.headers, REQ_HEADER_EXECUTION_TIMEOUT)
        .as_deref()
        .and_then(parse_duration)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    let (cancel_handle, cancel_scope) = cancel::scope();
    let invocation = CommandInvocation {
        envs,
        direct_command: state.direct_command.clone(),
        resource_name: resource,
        method_name: method,
        request_id,
        execution_timeout,
        cancel: Some(cancel_scope),
    };
    info!(
        resource = invocation.resource_name.as_deref().unwrap_or_default(),
        method = %invocation.method_name,
        request_id = invocation.request_id.as_deref().unwrap_or_default(),
        "command invoked"
    );

    if suppress {
        drop(input);
        let stdin = capture.as_ref().map(take_sink).unwrap_or_default();
        let rendered = explain::render_request(
            &TextFormatter,
            &state.executor,
            &state.state_store,
            &invocation,
            &stdin,
        );
        return text_plain(StatusCode::RESET_CONTENT, Body::from(rendered));
    }

    let _permit = match state.restrictor.acquire().await {
        Ok(permit) => permit,
        Err(error) => {
            return text_plain(
                StatusCode::INTERNAL_SERVER_ERROR,
                Body::from(format!("Failed to acquire permits, error: [{error}]")),
            );
        }
    };

    // Cloned before the invocation moves into the action; the explanation
    // renderer needs it after the run.
    let rendering_invocation = invocation.clone();
    let combine = state.combine_output;
    let executor_state = state.clone();
    let action = async move {
        let out = new_sink();
        let err = if combine { out.clone() } else { new_sink() };
        let (exec_state, result) = executor_state
            .executor
            .run(Some(input), &invocation, out.clone(), err.clone())
            .await;
        let stdout = Arc::new(take_sink(&out));
        let stderr = if combine {
            stdout.clone()
        } else {
            Arc::new(take_sink(&err))
        };
        ExecOutcome {
            state: exec_state,
            error: result.err().map(Arc::new),
            stdout,
            stderr,
        }
    };

    let outcome = if state.restrictor.has_single_flight() {
        let digest_input = DigestInput {
            method: rendering_invocation.method_name.as_str(),
            path: parts.uri.path(),
            headers: &parts.headers,
            query: parts.uri.query().unwrap_or_default(),
            remote_addr: Some(remote),
            body: fingerprint_body.as_deref(),
        };
        let key = state
            .restrictor
            .flight_key(&digest_input)
            .unwrap_or_default();
        let follower_deadline = follower_deadline(&state, &rendering_invocation);
        let (outcome, _shared) = state
            .restrictor
            .filter_by_digest(key, follower_deadline, action)
            .await;
        outcome
    } else {
        Some(action.await)
    };
    drop(cancel_handle);

    let Some(outcome) = outcome else {
        return text_plain(
            StatusCode::INTERNAL_SERVER_ERROR,
            Body::from("execution finished without a result"),
        );
    };

    let stdin = capture.as_ref().map(take_sink).unwrap_or_default();
    render_outcome(
        &state,
        &rendering_invocation,
        &stdin,
        outcome,
        explain_success,
        explain_failure,
    )
}

/// Detached followers wait at most the execution timeout of the command they
/// would have run; bound followers wait for the leader however long it takes.
fn follower_deadline(state: &ServerState, invocation: &CommandInvocation) -> Option<Duration> {
    if state.restrictor.bind_followers() {
        return None;
    }
    state
        .executor
        .resolve_command_descriptor(invocation)
        .ok()
        .map(|(descriptor, _, _)| Executor::execution_timeout(&descriptor, invocation))
        .filter(|timeout| *timeout > 0.0)
        .map(Duration::from_secs_f64)
}

fn render_outcome(
    state: &ServerState,
    invocation: &CommandInvocation,
    stdin: &[u8],
    outcome: ExecOutcome,
    explain_success: bool,
    explain_failure: bool,
) -> Response<Body> {
    let duration = (outcome.state.duration > Duration::ZERO)
        .then(|| format!("{:.6}", outcome.state.duration.as_secs_f64()));

    if outcome.state.is_timeout {
        return build_text(
            StatusCode::REQUEST_TIMEOUT,
            Body::from("Running processes are killed"),
            duration,
            None,
        );
    }

    match outcome.error.as_deref() {
        Some(error) if explain_failure => {
            let rendered = explain::render_result(
                &TextFormatter,
                &state.executor,
                &state.state_store,
                invocation,
                stdin,
                Some(error),
                &outcome.stdout,
                &outcome.stderr,
            );
            build_text(
                StatusCode::INTERNAL_SERVER_ERROR,
                Body::from(rendered),
                duration,
                None,
            )
        }
        Some(error) => build_text(
            StatusCode::INTERNAL_SERVER_ERROR,
            Body::from(outcome.stderr.as_ref().clone()),
            duration,
            Some(error.to_string()),
        ),
        None if explain_success => {
            let rendered = explain::render_result(
                &TextFormatter,
                &state.executor,
                &state.state_store,
                invocation,
                stdin,
                None,
                &outcome.stdout,
                &outcome.stderr,
            );
            build_text(StatusCode::RESET_CONTENT, Body::from(rendered), duration, None)
        }
        None => build_text(
            StatusCode::OK,
            Body::from(outcome.stdout.as_ref().clone()),
            duration,
            None,
        ),
    }
}

enum BodyError {
    TooLarge,
    Io(std::io::Error),
}

async fn read_body(mut body: Body, limit: Option<usize>) -> Result<Vec<u8>, BodyError> {
    let mut buffer = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|error| BodyError::Io(std::io::Error::other(error)))?;
        if let Some(limit) = limit {
            if buffer.len() + chunk.len() > limit {
                return Err(BodyError::TooLarge);
            }
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer)
}

async fn pump_body(mut body: Body, mut writer: DuplexStream, capture: Option<OutputSink>) {
    while let Some(chunk) = body.data().await {
        let Ok(chunk) = chunk else {
            break;
        };
        if let Some(capture) = capture.as_ref() {
            capture
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .extend_from_slice(&chunk);
        }
        if writer.write_all(&chunk).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

fn has_header(headers: &HeaderMap, name: &str) -> bool {
    headers.get(name).is_some_and(|value| !value.is_empty())
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
        .filter(|value| !value.is_empty())
}

fn status_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

fn json_response(status: StatusCode, body: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| status_response(StatusCode::INTERNAL_SERVER_ERROR))
}

fn text_plain(status: StatusCode, body: Body) -> Response<Body> {
    build_text(status, body, None, None)
}

fn error_response(status: StatusCode, error: &AgentErr) -> Response<Body> {
    build_text(status, Body::empty(), None, Some(error.to_string()))
}

fn build_text(
    status: StatusCode,
    body: Body,
    duration: Option<String>,
    error_message: Option<String>,
) -> Response<Body> {
    let mut builder = Response::builder()
        .status(status)
        .header("Content-Type", "text/plain");
    if let Some(duration) = duration {
        builder = builder.header(RES_HEADER_EXEC_DURATION, duration);
    }
    if let Some(message) = error_message {
        builder = builder.header(RES_HEADER_ERROR_MESSAGE, sanitize_header_value(&message));
    }
    builder
        .body(body)
        .unwrap_or_else(|_| status_response(StatusCode::INTERNAL_SERVER_ERROR))
}

/// Header values must be a single line of visible characters.
fn sanitize_header_value(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}
