//! Development live reload.
//!
//! A filesystem watcher over the program directory rebuilds the route table
//! on change. Every installed table is announced to clients subscribed to
//! `/__livereload` as a server-sent `reload` event carrying the route count.

use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::{
    extract::State,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeno_common::RuntimeError;

use crate::state::AppState;

/// Path of the SSE endpoint.
pub const ENDPOINT: &str = "/__livereload";

/// Quiet period after the last change before rebuilding.
const DEBOUNCE: Duration = Duration::from_millis(200);

/// Broadcasts route table swaps to connected clients.
#[derive(Debug)]
pub struct LiveReload {
    tx: broadcast::Sender<usize>,
}

impl LiveReload {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    /// Announce a freshly installed table of `routes` routes.
    pub fn announce(&self, routes: usize) {
        // No subscribers is fine.
        let _ = self.tx.send(routes);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<usize> {
        self.tx.subscribe()
    }

    pub fn client_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for LiveReload {
    fn default() -> Self {
        Self::new()
    }
}

/// `GET /__livereload`: one `reload` event per installed table.
pub(crate) async fn events(State(state): State<AppState>) -> Response {
    let Some(live) = state.live_reload() else {
        return axum::http::StatusCode::NOT_FOUND.into_response();
    };
    let rx = live.subscribe();
    debug!(clients = live.client_count(), "live reload client connected");

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(routes) => {
                    let event = Event::default().event("reload").data(routes.to_string());
                    return Some((Ok::<_, Infallible>(event), rx));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

/// Watch `dir` and reload the program of `state` whenever a file under it
/// changes, until `cancel` fires.
///
/// A failed rebuild is logged and the previous table keeps serving.
///
/// # Errors
///
/// Returns `Io` if the watcher cannot be created or `dir` cannot be watched.
pub fn watch(
    state: AppState,
    dir: &Path,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>, RuntimeError> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher: RecommendedWatcher =
        notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
            Ok(event) if is_change(&event.kind) => {
                let _ = tx.send(event.paths);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "file watcher error"),
        })
        .map_err(|e| RuntimeError::io(format!("failed to create file watcher: {e}")))?;
    watcher
        .watch(dir, RecursiveMode::Recursive)
        .map_err(|e| RuntimeError::io(format!("failed to watch {}: {e}", dir.display())))?;

    let dir: PathBuf = dir.to_path_buf();
    info!(dir = %dir.display(), "live reload watching");

    Ok(tokio::spawn(async move {
        let _watcher = watcher;
        loop {
            let paths = tokio::select! {
                () = cancel.cancelled() => break,
                paths = rx.recv() => match paths {
                    Some(paths) => paths,
                    None => break,
                },
            };
            // Editors write in bursts; wait for the last event.
            let mut changed = paths.len();
            while let Ok(Some(more)) = tokio::time::timeout(DEBOUNCE, rx.recv()).await {
                changed += more.len();
            }
            debug!(changed, "program sources changed");

            match state.reload().await {
                Ok(routes) => info!(routes, "live reload rebuilt routes"),
                Err(e) => warn!(error = %e, "live reload failed; keeping previous routes"),
            }
        }
        debug!(dir = %dir.display(), "live reload stopped");
    }))
}

fn is_change(kind: &EventKind) -> bool {
    kind.is_create() || kind.is_modify() || kind.is_remove()
}
