//! Local origin server for exercising the fetch paths

use axum::{
    extract::State,
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct OriginState {
    requests: AtomicUsize,
    offline: AtomicBool,
}

/// Origin bound to an ephemeral port. Serves:
/// - `/soundfonts/<name>.json`: `{"instrument":"<name>"}`
/// - `/bytes/<n>`: `n` bytes of `x`
/// - `/app.js`, `/page`: small static bodies
pub(crate) struct Origin {
    pub base_url: String,
    state: Arc<OriginState>,
}

impl Origin {
    pub(crate) fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    pub(crate) fn set_offline(&self, offline: bool) {
        self.state.offline.store(offline, Ordering::SeqCst);
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

pub(crate) async fn spawn_origin() -> Origin {
    let state = Arc::new(OriginState::default());
    let router = Router::new().fallback(serve).with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await });

    Origin {
        base_url: format!("http://{}", addr),
        state,
    }
}

async fn serve(State(state): State<Arc<OriginState>>, uri: Uri) -> Response {
    state.requests.fetch_add(1, Ordering::SeqCst);
    if state.offline.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let path = uri.path();
    if let Some(name) = path.strip_prefix("/soundfonts/") {
        let name = name.trim_end_matches(".json");
        return (
            [(header::CONTENT_TYPE, "application/json")],
            format!("{{\"instrument\":\"{}\"}}", name),
        )
            .into_response();
    }
    if let Some(n) = path.strip_prefix("/bytes/").and_then(|n| n.parse::<usize>().ok()) {
        return (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            vec![b'x'; n],
        )
            .into_response();
    }
    match path {
        "/app.js" => (
            [(header::CONTENT_TYPE, "application/javascript")],
            "console.log('app')",
        )
            .into_response(),
        "/page" => ([(header::CONTENT_TYPE, "text/html")], "<html></html>").into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}
