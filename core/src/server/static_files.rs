//! Static file serving for configured mounts.

use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use hyper::Body;
use hyper::Response;
use hyper::StatusCode;

pub async fn serve(root: &Path, rest: &str) -> Response<Body> {
    let relative = rest.trim_start_matches('/');
    let Some(target) = sanitize(root, relative) else {
        return status_response(StatusCode::NOT_FOUND);
    };
    let target = if target.is_dir() {
        target.join("index.html")
    } else {
        target
    };

    match tokio::fs::read(&target).await {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", content_type(&target))
            .body(Body::from(bytes))
            .unwrap_or_else(|_| status_response(StatusCode::INTERNAL_SERVER_ERROR)),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            status_response(StatusCode::NOT_FOUND)
        }
        Err(_) => status_response(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// Resolve `relative` under `root`, refusing anything that escapes it.
fn sanitize(root: &Path, relative: &str) -> Option<PathBuf> {
    let candidate = Path::new(relative);
    if candidate
        .components()
        .any(|part| !matches!(part, Component::Normal(_) | Component::CurDir))
    {
        return None;
    }
    Some(root.join(candidate))
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("wasm") => "application/wasm",
        _ => "application/octet-stream",
    }
}

fn status_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}
