//! End-to-end tests: a real server on an ephemeral port, driven over HTTP.

use std::time::Duration;
use std::time::Instant;

use opwire_core::AgentServer;
use opwire_core::Configuration;
use opwire_core::ServeOptions;
use opwire_core::server::ServerHandle;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;

fn start_server(conf: serde_json::Value) -> ServerHandle {
    start_server_with(conf, ServeOptions::default())
}

fn start_server_with(conf: serde_json::Value, mut options: ServeOptions) -> ServerHandle {
    let configuration: Configuration = serde_json::from_value(conf).expect("configuration");
    options.host = Some("127.0.0.1".to_string());
    options.port = Some(0);
    AgentServer::new(configuration, options)
        .expect("server")
        .start()
        .expect("start")
}

fn base_url(handle: &ServerHandle) -> String {
    format!("http://{}", handle.local_addr())
}

fn duration_header(response: &reqwest::Response) -> Option<f64> {
    response
        .headers()
        .get("X-Exec-Duration")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_pipeline_returns_matched_lines() {
    let handle = start_server(serde_json::json!({
        "resources": {
            "echo": { "default": { "command": "grep hello" } }
        }
    }));
    let response = reqwest::Client::new()
        .post(format!("{}/$/echo", base_url(&handle)))
        .body("hello grep\ngoodbye grep")
        .send()
        .await
        .expect("response");

    assert_eq!(response.status(), 200);
    let duration = duration_header(&response).expect("duration header");
    assert!(duration > 0.0);
    assert_eq!(response.text().await.expect("body"), "hello grep\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn method_override_selects_the_method_descriptor() {
    let handle = start_server(serde_json::json!({
        "resources": {
            "ops": {
                "default": { "command": "echo main-default" },
                "methods": { "POST": { "command": "echo posted" } }
            }
        }
    }));
    let client = reqwest::Client::new();
    let url = format!("{}/$/ops", base_url(&handle));

    let get = client.get(&url).send().await.expect("get");
    assert_eq!(get.status(), 200);
    assert_eq!(get.text().await.expect("body"), "main-default\n");

    let post = client.post(&url).send().await.expect("post");
    assert_eq!(post.status(), 200);
    assert_eq!(post.text().await.expect("body"), "posted\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn main_resource_chains_processes() {
    let handle = start_server(serde_json::json!({
        "main-resource": { "default": { "command": "echo Hello Opwire | wc" } }
    }));
    let response = reqwest::Client::new()
        .get(format!("{}/$", base_url(&handle)))
        .send()
        .await
        .expect("response");

    assert_eq!(response.status(), 200);
    let body = response.text().await.expect("body");
    let counts: Vec<u32> = body
        .split_whitespace()
        .map(|field| field.parse().expect("count"))
        .collect();
    assert_eq!(counts, vec![1, 2, 13]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deprecated_run_alias_still_routes() {
    let handle = start_server(serde_json::json!({
        "resources": {
            "echo": { "default": { "command": "echo from-run" } }
        }
    }));
    let response = reqwest::Client::new()
        .get(format!("{}/run/echo", base_url(&handle)))
        .send()
        .await
        .expect("response");
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.expect("body"), "from-run\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timeout_kills_the_chain_with_408() {
    let handle = start_server(serde_json::json!({
        "resources": {
            "slow": { "default": { "command": "sleep 5", "timeout": 1 } }
        }
    }));
    let started = Instant::now();
    let response = reqwest::Client::new()
        .get(format!("{}/$/slow", base_url(&handle)))
        .send()
        .await
        .expect("response");

    assert_eq!(response.status(), 408);
    assert!(started.elapsed() < Duration::from_secs(4));
    let duration = duration_header(&response).expect("duration header");
    assert!((0.9..3.0).contains(&duration), "duration was {duration}");
    assert_eq!(
        response.text().await.expect("body"),
        "Running processes are killed"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timeout_header_overrides_the_descriptor() {
    let handle = start_server(serde_json::json!({
        "resources": {
            "slow": { "default": { "command": "sleep 5" } }
        }
    }));
    let started = Instant::now();
    let response = reqwest::Client::new()
        .get(format!("{}/$/slow", base_url(&handle)))
        .header("Opwire-Execution-Timeout", "300ms")
        .send()
        .await
        .expect("response");
    assert_eq!(response.status(), 408);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_flight_coalesces_identical_requests() {
    let handle = start_server(serde_json::json!({
        "resources": {
            "slow": { "default": { "command": "sh -c 'sleep 0.4; date +%s%N'" } }
        },
        "http-server": {
            "single-flight-enabled": true,
            "single-flight-by-method": true,
            "single-flight-by-path": true
        }
    }));
    let url = format!("{}/$/slow", base_url(&handle));
    let client = reqwest::Client::new();

    let mut requests = Vec::new();
    for _ in 0..10 {
        let client = client.clone();
        let url = url.clone();
        requests.push(tokio::spawn(async move {
            let response = client.get(&url).send().await.expect("response");
            assert_eq!(response.status(), 200);
            response.text().await.expect("body")
        }));
    }
    let mut bodies = Vec::new();
    for request in requests {
        bodies.push(request.await.expect("join"));
    }
    assert!(!bodies[0].is_empty());
    assert!(
        bodies.iter().all(|body| body == &bodies[0]),
        "all coalesced responses must carry identical bytes: {bodies:?}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_command_maps_to_500_with_stderr() {
    let handle = start_server(serde_json::json!({
        "resources": {
            "broken": { "default": { "command": "sh -c 'echo oops >&2; exit 3'" } }
        }
    }));
    let response = reqwest::Client::new()
        .get(format!("{}/$/broken", base_url(&handle)))
        .send()
        .await
        .expect("response");

    assert_eq!(response.status(), 500);
    let message = response
        .headers()
        .get("X-Error-Message")
        .expect("error header")
        .to_str()
        .expect("header value")
        .to_string();
    assert!(message.contains("sh"), "got {message}");
    assert_eq!(response.text().await.expect("body"), "oops\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn combined_output_interleaves_both_streams() {
    let handle = start_server(serde_json::json!({
        "agent": { "combine-stderr-stdout": true },
        "resources": {
            "both": { "default": { "command": "sh -c 'echo out; echo err >&2'" } }
        }
    }));
    let response = reqwest::Client::new()
        .get(format!("{}/$/both", base_url(&handle)))
        .send()
        .await
        .expect("response");
    assert_eq!(response.status(), 200);
    let body = response.text().await.expect("body");
    assert!(body.contains("out\n"), "got {body}");
    assert!(body.contains("err\n"), "got {body}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_resource_is_a_500_resolution_failure() {
    let handle = start_server(serde_json::json!({}));
    let response = reqwest::Client::new()
        .get(format!("{}/$/ghost", base_url(&handle)))
        .send()
        .await
        .expect("response");
    assert_eq!(response.status(), 500);
    let message = response
        .headers()
        .get("X-Error-Message")
        .expect("error header")
        .to_str()
        .expect("header value")
        .to_string();
    assert!(message.contains("ghost"), "got {message}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsupported_method_is_405_and_unknown_path_404() {
    let handle = start_server(serde_json::json!({
        "resources": { "echo": { "default": { "command": "echo hi" } } }
    }));
    let client = reqwest::Client::new();

    let options = client
        .request(
            reqwest::Method::OPTIONS,
            format!("{}/$/echo", base_url(&handle)),
        )
        .send()
        .await
        .expect("options");
    assert_eq!(options.status(), 405);

    let missing = client
        .get(format!("{}/definitely/not/routed", base_url(&handle)))
        .send()
        .await
        .expect("missing");
    assert_eq!(missing.status(), 404);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pattern_route_exposes_path_variables() {
    let handle = start_server(serde_json::json!({
        "resources": {
            "ops": {
                "default": { "command": "sh -c 'echo \"$OPWIRE_REQUEST\"'" },
                "pattern": "/ops/{target}"
            }
        }
    }));
    let response = reqwest::Client::new()
        .get(format!("{}/ops/db", base_url(&handle)))
        .send()
        .await
        .expect("response");
    assert_eq!(response.status(), 200);
    let body = response.text().await.expect("body");
    assert!(body.contains("\"target\":\"db\""), "got {body}");
    assert!(body.contains("\"path\":\"/ops/db\""), "got {body}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_lock_and_unlock_flip_readiness() {
    let handle = start_server(serde_json::json!({
        "resources": { "echo": { "default": { "command": "echo hi" } } }
    }));
    let client = reqwest::Client::new();
    let base = base_url(&handle);

    let health = client.get(format!("{base}/_/health")).send().await.expect("health");
    assert_eq!(health.status(), 200);
    assert_eq!(
        health.text().await.expect("body"),
        "{\"ready\":true,\"alive\":true}"
    );

    let post_health = client.post(format!("{base}/_/health")).send().await.expect("post");
    assert_eq!(post_health.status(), 405);

    let lock = client.post(format!("{base}/_/lock")).send().await.expect("lock");
    assert_eq!(lock.status(), 200);

    let locked_health = client.get(format!("{base}/_/health")).send().await.expect("health");
    assert_eq!(locked_health.status(), 503);
    assert_eq!(locked_health.text().await.expect("body"), "{\"ready\":false}");

    let locked_exec = client.get(format!("{base}/$/echo")).send().await.expect("exec");
    assert_eq!(locked_exec.status(), 503);

    let unlock = client.post(format!("{base}/_/unlock")).send().await.expect("unlock");
    assert_eq!(unlock.status(), 200);
    let exec = client.get(format!("{base}/$/echo")).send().await.expect("exec");
    assert_eq!(exec.status(), 200);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn suppress_running_explains_without_executing() {
    let handle = start_server(serde_json::json!({
        "agent": { "explanation-enabled": true },
        "resources": {
            "echo": { "default": { "command": "grep hello" } }
        }
    }));
    let response = reqwest::Client::new()
        .post(format!("{}/$/echo", base_url(&handle)))
        .header("Opwire-Suppress-Running", "true")
        .body("suppressed input")
        .send()
        .await
        .expect("response");

    assert_eq!(response.status(), 205);
    let body = response.text().await.expect("body");
    assert!(body.contains("[command"), "got {body}");
    assert!(body.contains("grep hello"), "got {body}");
    assert!(body.contains("suppressed input"), "got {body}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn explain_success_wraps_the_result() {
    let handle = start_server(serde_json::json!({
        "agent": { "explanation-enabled": true },
        "resources": {
            "echo": { "default": { "command": "echo explained" } }
        }
    }));
    let response = reqwest::Client::new()
        .get(format!("{}/$/echo", base_url(&handle)))
        .header("Opwire-Explain-Success", "1")
        .send()
        .await
        .expect("response");
    assert_eq!(response.status(), 205);
    let body = response.text().await.expect("body");
    assert!(body.contains("[stdout"), "got {body}");
    assert!(body.contains("explained"), "got {body}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn explanation_headers_are_inert_when_disabled() {
    let handle = start_server(serde_json::json!({
        "resources": {
            "echo": { "default": { "command": "echo plain" } }
        }
    }));
    let response = reqwest::Client::new()
        .get(format!("{}/$/echo", base_url(&handle)))
        .header("Opwire-Explain-Success", "1")
        .send()
        .await
        .expect("response");
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.expect("body"), "plain\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn graceful_shutdown_drains_in_flight_requests() {
    let handle = start_server(serde_json::json!({
        "resources": {
            "slow": { "default": { "command": "sh -c 'sleep 0.6; echo done'" } }
        },
        "http-server": { "close-timeout": "400ms" }
    }));
    let base = base_url(&handle);
    let client = reqwest::Client::new();

    let in_flight = {
        let client = client.clone();
        let url = format!("{base}/$/slow");
        tokio::spawn(async move { client.get(&url).send().await.expect("in-flight") })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut handle = handle;
    let shutdown = tokio::spawn(async move {
        let result = handle.shutdown().await;
        (handle, result)
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Inside the drain window: the service is locked but still answering.
    let rejected = client
        .get(format!("{base}/$/slow"))
        .send()
        .await
        .expect("rejected");
    assert_eq!(rejected.status(), 503);

    let response = in_flight.await.expect("join");
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.expect("body"), "done\n");

    let (handle, result) = shutdown.await.expect("join");
    result.expect("shutdown");
    assert!(!handle.is_ready());
    let refused = client.get(format!("{base}/$/slow")).send().await;
    assert!(refused.is_err(), "the listener must be closed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn configured_read_timeout_drops_stalled_clients() {
    let handle = start_server(serde_json::json!({
        "resources": {
            "echo": { "default": { "command": "cat" } }
        },
        "http-server": { "read-timeout": "300ms" }
    }));
    let mut stream = tokio::net::TcpStream::connect(handle.local_addr())
        .await
        .expect("connect");
    stream
        .write_all(b"POST /$/echo HTTP/1.1\r\nhost: localhost\r\ncontent-length: 100\r\n\r\npartial")
        .await
        .expect("send a partial request");

    // The body never completes; the read deadline must close the connection.
    let mut rest = Vec::new();
    let closed =
        tokio::time::timeout(Duration::from_secs(3), stream.read_to_end(&mut rest)).await;
    assert!(closed.is_ok(), "a stalled connection must be closed by the server");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn direct_command_overrides_every_resource() {
    let handle = start_server_with(
        serde_json::json!({
            "resources": { "echo": { "default": { "command": "echo ignored" } } }
        }),
        ServeOptions {
            direct_command: Some("echo direct-wins".to_string()),
            ..ServeOptions::default()
        },
    );
    let response = reqwest::Client::new()
        .get(format!("{}/$/echo", base_url(&handle)))
        .send()
        .await
        .expect("response");
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.expect("body"), "direct-wins\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn settings_reach_the_child_environment() {
    let handle = start_server(serde_json::json!({
        "settings": { "region": "eu-1" },
        "resources": {
            "show": { "default": { "command": "sh -c 'echo \"$OPWIRE_SETTINGS\"'" } }
        }
    }));
    let response = reqwest::Client::new()
        .get(format!("{}/$/show", base_url(&handle)))
        .send()
        .await
        .expect("response");
    assert_eq!(response.status(), 200);
    let body = response.text().await.expect("body");
    assert!(body.contains("\"region\":\"eu-1\""), "got {body}");
}
