// Stand-in worker for the router: speaks the ready/exit protocol and serves
// a few canned endpoints. Used by the integration tests.
//
// Behaviour switches (all optional):
//   --mock-ready-delay-ms N     wait N ms before announcing readiness
//   --mock-no-ready             never announce readiness
//   --mock-ignore-exit          ignore the router's exit command
//   --mock-fail-startup CODE    exit with CODE before becoming ready
//   --mock-kill-self-after-ms N SIGKILL itself N ms after becoming ready

use std::convert::Infallible;
use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use hyper::body::Bytes;
use hyper::header::{HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE, SERVER};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};

use llama_router::web::request::parse_query_param;
use llama_router::web::worker::control::announce_ready_and_watch;
use llama_router::web::worker::invocation::ROUTER_PORT_ENV;

#[derive(Debug, Clone, Default)]
struct MockArgs {
    host: String,
    port: u16,
    alias: String,
    ready_delay: Duration,
    no_ready: bool,
    ignore_exit: bool,
    fail_startup: Option<i32>,
    kill_self_after: Option<Duration>,
}

impl MockArgs {
    fn parse(args: &[String]) -> Result<Self, String> {
        let mut out = MockArgs {
            host: "127.0.0.1".to_string(),
            ..MockArgs::default()
        };
        let mut i = 0;
        while i < args.len() {
            let arg = args[i].as_str();
            let value = args.get(i + 1).filter(|v| !v.starts_with('-'));
            let number = |v: Option<&String>| -> Result<u64, String> {
                v.ok_or_else(|| format!("{arg} needs a value"))?
                    .parse::<u64>()
                    .map_err(|e| format!("{arg}: {e}"))
            };
            let mut consumed = value.is_some();
            match arg {
                "--host" => out.host = value.cloned().unwrap_or_default(),
                "--port" => {
                    out.port = u16::try_from(number(value)?).map_err(|e| format!("--port: {e}"))?
                }
                "--alias" => out.alias = value.cloned().unwrap_or_default(),
                "--mock-ready-delay-ms" => out.ready_delay = Duration::from_millis(number(value)?),
                "--mock-fail-startup" => {
                    out.fail_startup = Some(i32::try_from(number(value)?).unwrap_or(1))
                }
                "--mock-kill-self-after-ms" => {
                    out.kill_self_after = Some(Duration::from_millis(number(value)?))
                }
                "--mock-no-ready" => {
                    out.no_ready = true;
                    consumed = false;
                }
                "--mock-ignore-exit" => {
                    out.ignore_exit = true;
                    consumed = false;
                }
                // Any other option; its value (if any) is skipped.
                _ => {}
            }
            i += if consumed { 2 } else { 1 };
        }
        Ok(out)
    }
}

fn main() {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = match MockArgs::parse(&argv) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("mock_worker: {e}");
            std::process::exit(2);
        }
    };

    let router_port = std::env::var(ROUTER_PORT_ENV).unwrap_or_default();
    eprintln!(
        "mock_worker: alias={} port={} router_port={router_port}",
        args.alias, args.port
    );

    if let Some(code) = args.fail_startup {
        eprintln!("mock_worker: failing startup with code {code}");
        std::process::exit(code);
    }

    let listener = match TcpListener::bind((args.host.as_str(), args.port)) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("mock_worker: bind failed: {e}");
            std::process::exit(3);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("mock_worker: runtime failed: {e}");
            std::process::exit(4);
        }
    };

    let served = args.clone();
    runtime.spawn(async move {
        if let Err(e) = serve(listener, served).await {
            eprintln!("mock_worker: server error: {e}");
        }
    });

    thread::sleep(args.ready_delay);
    if !args.no_ready {
        let ignore_exit = args.ignore_exit;
        let watched = announce_ready_and_watch(move |code| {
            if ignore_exit {
                eprintln!("mock_worker: ignoring exit command");
                return;
            }
            eprintln!("mock_worker: exit command received");
            std::process::exit(code);
        });
        if let Err(e) = watched {
            eprintln!("mock_worker: cannot watch stdin: {e}");
            std::process::exit(5);
        }
    }

    if let Some(delay) = args.kill_self_after {
        thread::sleep(delay);
        eprintln!("mock_worker: killing myself");
        kill_self();
    }

    // Serve until killed or told to exit.
    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}

#[cfg(not(windows))]
fn kill_self() {
    // SAFETY: plain signal to our own pid.
    unsafe {
        libc::kill(libc::getpid(), libc::SIGKILL);
    }
}

#[cfg(windows)]
fn kill_self() {
    std::process::abort();
}

async fn serve(listener: TcpListener, args: MockArgs) -> Result<(), hyper::Error> {
    if let Err(e) = listener.set_nonblocking(true) {
        eprintln!("mock_worker: set_nonblocking failed: {e}");
    }
    let make_svc = make_service_fn(move |_conn| {
        let args = args.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(req, args.clone()))) }
    });
    Server::from_tcp(listener)?.serve(make_svc).await
}

fn text(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn handle(req: Request<Body>, args: MockArgs) -> Result<Response<Body>, Infallible> {
    let query = req.uri().query().unwrap_or("").to_string();
    let path = req.uri().path().to_string();

    let response = match (req.method().clone(), path.as_str()) {
        (Method::GET, "/health") => text(StatusCode::OK, r#"{"status":"ok"}"#),
        (Method::GET, "/props") => {
            let body = serde_json::json!({ "alias": args.alias, "port": args.port });
            let mut response = text(StatusCode::OK, body.to_string());
            let headers = response.headers_mut();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            headers.insert(SERVER, HeaderValue::from_static("mock_worker"));
            headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("mock"));
            if let Ok(alias) = HeaderValue::from_str(&args.alias) {
                headers.insert("x-mock-alias", alias);
            }
            response
        }
        (Method::GET, "/chunks") => {
            let n = parse_query_param(&query, "n")
                .and_then(|v| v.parse().ok())
                .unwrap_or(5u32);
            let delay = parse_query_param(&query, "delay_ms")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10u64);
            let (mut sender, body) = Body::channel();
            tokio::spawn(async move {
                for i in 0..n {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    if sender.send_data(Bytes::from(format!("c{i}\n"))).await.is_err() {
                        return;
                    }
                }
            });
            text(StatusCode::OK, body)
        }
        (Method::GET, "/slow") => {
            let (mut sender, body) = Body::channel();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    if sender.send_data(Bytes::from_static(b"tick\n")).await.is_err() {
                        eprintln!("mock_worker: /slow client went away");
                        return;
                    }
                }
            });
            text(StatusCode::OK, body)
        }
        (Method::POST, _) => {
            let body = hyper::body::to_bytes(req.into_body()).await.unwrap_or_default();
            let mut response = text(StatusCode::OK, body);
            if let Ok(value) = HeaderValue::from_str(&path) {
                response.headers_mut().insert("x-echo-path", value);
            }
            response
        }
        _ => text(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}
