//! Development server with live reload.
//!
//! Serves the output directory over HTTP. Every HTML response gets a small
//! script injected before `</body>` that connects to a WebSocket at
//! [`RELOAD_PATH`] and reloads the page when the server says so. A reload is
//! broadcast when:
//!
//! - anything under the project root changes (debounced by
//!   `server.debounce_ms`, skipping the `server.ignore` directories), or
//! - a watch rule finishes rerunning its stages.
//!
//! [`run_dev`] runs the server and the [watch loop](crate::watch) side by
//! side until Ctrl-C.

use crate::config::ServerConfig;
use crate::pipeline::Pipeline;
use crate::watch::{self, WatchError};
use axum::Router;
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use maud::{PreEscaped, html};
use notify::RecursiveMode;
use notify_debouncer_mini::{DebounceEventResult, Debouncer, new_debouncer};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tower::ServiceExt;
use tower_http::services::ServeDir;

/// WebSocket endpoint the injected script connects to.
pub const RELOAD_PATH: &str = "/__sitepipe/reload";

const RELOAD_CHANNEL_CAPACITY: usize = 16;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid address {0}")]
    Address(String),
    #[error("File watch error: {0}")]
    Watch(#[from] WatchError),
    #[error("Failed to watch project root: {0}")]
    RootWatch(#[from] notify::Error),
}

/// Broadcasts reload requests to every connected browser.
#[derive(Debug, Clone)]
pub struct Reloader {
    tx: broadcast::Sender<()>,
}

impl Default for Reloader {
    fn default() -> Self {
        Self::new()
    }
}

impl Reloader {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(RELOAD_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Ask every connected page to reload. Returns how many were told.
    pub fn reload(&self) -> usize {
        let sent = self.tx.send(()).unwrap_or(0);
        tracing::debug!(clients = sent, "reload");
        sent
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }
}

/// The script injected into served pages.
pub fn reload_script() -> maud::Markup {
    let js = format!(
        "(function(){{var p=location.protocol==='https:'?'wss://':'ws://';\
         var s=new WebSocket(p+location.host+'{RELOAD_PATH}');\
         s.onmessage=function(e){{if(e.data==='reload')location.reload();}};}})();"
    );
    html! {
        script { (PreEscaped(js)) }
    }
}

/// Insert the reload script before the last `</body>`, or append it when the
/// page has no body end tag.
pub fn inject_reload_script(page: &str) -> String {
    let script = reload_script().into_string();
    match page.to_ascii_lowercase().rfind("</body>") {
        Some(idx) => format!("{}{}{}", &page[..idx], script, &page[idx..]),
        None => format!("{page}{script}"),
    }
}

#[derive(Clone)]
struct AppState {
    files: ServeDir,
    reloader: Reloader,
}

/// Routes: the reload socket, everything else from `output`.
pub fn router(output: &Path, reloader: Reloader) -> Router {
    let state = AppState {
        files: ServeDir::new(output),
        reloader,
    };
    Router::new()
        .route(RELOAD_PATH, get(reload_socket))
        .fallback(serve_site)
        .with_state(state)
}

async fn serve_site(State(state): State<AppState>, request: Request) -> Response {
    let response = match state.files.oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    };
    let is_html = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/html"));
    if !is_html {
        return response.map(Body::new);
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(Body::new(body), usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    let page = inject_reload_script(&String::from_utf8_lossy(&bytes));
    parts.headers.remove(header::CONTENT_LENGTH);
    Response::from_parts(parts, Body::from(page))
}

async fn reload_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let rx = state.reloader.subscribe();
    ws.on_upgrade(move |socket| forward_reloads(socket, rx))
}

async fn forward_reloads(socket: WebSocket, mut rx: broadcast::Receiver<()>) {
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            reload = rx.recv() => match reload {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    if sender.send(Message::Text("reload".into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

/// Watch the whole project root and reload on any change outside `config.ignore`.
pub fn watch_root(
    root: &Path,
    config: &ServerConfig,
    reloader: Reloader,
) -> Result<Debouncer<notify::RecommendedWatcher>, ServerError> {
    let root_owned = root.to_path_buf();
    let ignore = config.ignore.clone();
    let mut debouncer = new_debouncer(
        Duration::from_millis(config.debounce_ms),
        move |result: DebounceEventResult| match result {
            Ok(events) => {
                if events.iter().any(|e| !is_ignored(&root_owned, &e.path, &ignore)) {
                    reloader.reload();
                }
            }
            Err(e) => tracing::warn!("watch error: {e:?}"),
        },
    )?;
    debouncer.watcher().watch(root, RecursiveMode::Recursive)?;
    Ok(debouncer)
}

/// True when the first component of `path` below `root` is an ignored name.
fn is_ignored(root: &Path, path: &Path, ignore: &[String]) -> bool {
    path.strip_prefix(root)
        .ok()
        .and_then(|rel| rel.components().next())
        .is_some_and(|first| ignore.iter().any(|i| first.as_os_str() == i.as_str()))
}

/// Launch the platform's URL opener. Failure only logs.
fn open_browser(url: &str) {
    let mut cmd = if cfg!(target_os = "macos") {
        std::process::Command::new("open")
    } else if cfg!(target_os = "windows") {
        let mut c = std::process::Command::new("cmd");
        c.args(["/C", "start", ""]);
        c
    } else {
        std::process::Command::new("xdg-open")
    };
    if let Err(e) = cmd.arg(url).spawn() {
        tracing::warn!("could not open a browser: {e}");
    }
}

/// Serve `output` until `shutdown` resolves.
pub async fn serve(
    config: &ServerConfig,
    output: &Path,
    reloader: Reloader,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|_| ServerError::Address(format!("{}:{}", config.host, config.port)))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let url = format!("http://{addr}");
    tracing::info!("Serving {} at {url}", output.display());
    if config.open {
        open_browser(&url);
    }
    axum::serve(listener, router(output, reloader))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// The `dev` command: dev server plus watch loop, no initial build.
pub fn run_dev(pipeline: &Pipeline) -> Result<(), ServerError> {
    let layout = pipeline.layout();
    let server_config = &pipeline.config().server;
    let reloader = Reloader::new();
    let rules = watch::rules(layout)?;
    let _root_watcher = watch_root(&layout.root, server_config, reloader.clone())?;
    let stop = AtomicBool::new(false);
    let runtime = tokio::runtime::Runtime::new()?;

    let on_change = || {
        reloader.reload();
    };

    std::thread::scope(|s| {
        let watcher = s.spawn(|| watch::run(pipeline, &rules, &on_change, &stop));

        let served = runtime.block_on(serve(
            server_config,
            &layout.output,
            reloader.clone(),
            async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Received shutdown signal");
                }
            },
        ));

        stop.store(true, Ordering::SeqCst);
        let watched = match watcher.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        };
        served?;
        watched?;
        tracing::info!("Server shutdown complete");
        Ok(())
    })
}
