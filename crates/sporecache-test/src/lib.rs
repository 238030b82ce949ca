//! Helpers for testing the caches against real HTTP backends.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using a [`JsonServer`], make sure that the server is held until all requests to
//!    the server have been made. Dropping it stops serving and later requests fail to connect.
//!    Assign it to a variable: `let server = JsonServer::new();`.
//!
//!  - Tests talking to a server must run on real time. With paused tokio time, the clock jumps
//!    ahead whenever the runtime waits on the network, and client timeouts fire right away.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{OriginalUri, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use reqwest::Url;
use serde_json::{Value, json};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the sporecache crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("sporecache_service=trace,sporecache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// One scripted response of a [`JsonServer`].
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: StatusCode,
    pub body: Value,
    pub delay: Duration,
}

impl Reply {
    pub fn ok(body: Value) -> Self {
        Self {
            status: StatusCode::OK,
            body,
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: StatusCode) -> Self {
        Self {
            status,
            body: json!({"detail": status.canonical_reason()}),
            delay: Duration::ZERO,
        }
    }

    /// Answers only after `delay`.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug, Default)]
struct Routes {
    replies: BTreeMap<String, VecDeque<Reply>>,
    hits: BTreeMap<String, usize>,
}

/// A JSON backend with scripted responses and per-path hit counts.
///
/// Every path answers with its scripted replies in order. The last reply is repeated once the
/// script runs out. Paths without a script answer `404`.
pub struct JsonServer {
    server: Server,
    routes: Arc<Mutex<Routes>>,
}

impl JsonServer {
    pub fn new() -> Self {
        let routes: Arc<Mutex<Routes>> = Default::default();
        let router = Router::new()
            .fallback(respond)
            .with_state(Arc::clone(&routes));
        let server = Server::with_router(router);

        Self { server, routes }
    }

    /// Appends `reply` to the script of `path`.
    pub fn reply(&self, path: &str, reply: Reply) -> &Self {
        let mut routes = self.routes.lock().unwrap();
        routes
            .replies
            .entry(normalize(path))
            .or_default()
            .push_back(reply);
        self
    }

    /// Number of requests received for `path`.
    pub fn hits(&self, path: &str) -> usize {
        let routes = self.routes.lock().unwrap();
        routes.hits.get(&normalize(path)).copied().unwrap_or_default()
    }

    pub fn url(&self, path: &str) -> Url {
        self.server.url(path)
    }
}

impl Default for JsonServer {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

async fn respond(State(routes): State<Arc<Mutex<Routes>>>, OriginalUri(uri): OriginalUri) -> Response {
    let reply = {
        let mut routes = routes.lock().unwrap();
        let path = uri.path().to_owned();
        *routes.hits.entry(path.clone()).or_default() += 1;

        match routes.replies.get_mut(&path) {
            Some(script) if script.len() > 1 => script.pop_front(),
            Some(script) => script.front().cloned(),
            None => None,
        }
    };

    let reply = reply.unwrap_or_else(|| Reply::status(StatusCode::NOT_FOUND));
    if !reply.delay.is_zero() {
        tokio::time::sleep(reply.delay).await;
    }
    (reply.status, axum::Json(reply.body)).into_response()
}
