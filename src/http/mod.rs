use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};

use crate::engine::Engine;
use crate::status::StatusScope;

/// Run the web front-end: status documents, SSE event and log streams, the
/// badge, archived artifacts and the dashboard page.
pub async fn run_http(addr: SocketAddr, engine: Arc<Engine>) {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(index_handler))
        .route("/api/status", get(home_status_handler))
        .route("/api/jobs", get(all_status_handler))
        .route("/api/jobs/{name}", get(job_status_handler))
        .route("/api/jobs/{name}/{number}", get(run_status_handler))
        .route("/api/events", get(events_handler))
        .route("/api/log/{name}/{number}", get(log_stream_handler))
        .route("/log/{name}/{number}", get(log_handler))
        .route("/badge/{badge}", get(badge_handler))
        .route("/archive/{*path}", get(archive_handler))
        .layer(cors)
        .with_state(engine);

    tracing::info!(addr = %addr, "Starting http server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind http server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Http server failed");
    }
}

async fn index_handler(State(engine): State<Arc<Engine>>) -> Html<String> {
    // A custom/index.html in the home directory overrides the built-in page.
    let custom = engine.settings().home.join("custom").join("index.html");
    match tokio::fs::read_to_string(custom).await {
        Ok(template) => Html(template),
        Err(_) => Html(include_str!("index.html").to_string()),
    }
}

fn status_response(result: crate::error::Result<serde_json::Value>) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Status query failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn home_status_handler(State(engine): State<Arc<Engine>>) -> Response {
    status_response(engine.get_status(StatusScope::Home).await)
}

async fn all_status_handler(State(engine): State<Arc<Engine>>) -> Response {
    status_response(engine.get_status(StatusScope::All).await)
}

#[derive(Deserialize)]
struct JobStatusQuery {
    #[serde(default)]
    page: i64,
    #[serde(default)]
    field: Option<String>,
    #[serde(default)]
    order: Option<String>,
}

async fn job_status_handler(
    State(engine): State<Arc<Engine>>,
    Path(name): Path<String>,
    Query(query): Query<JobStatusQuery>,
) -> Response {
    let scope = StatusScope::Job {
        job: name,
        page: query.page.max(0),
        field: query.field.unwrap_or_else(|| "number".to_string()),
        order_desc: query.order.as_deref() != Some("asc"),
    };
    status_response(engine.get_status(scope).await)
}

async fn run_status_handler(
    State(engine): State<Arc<Engine>>,
    Path((name, number)): Path<(String, i64)>,
) -> Response {
    status_response(engine.get_status(StatusScope::Run { job: name, number }).await)
}

async fn events_handler(
    State(engine): State<Arc<Engine>>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let mut events = engine.events().subscribe_events();
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(32);
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if tx
                        .send(Ok(Event::default().data(event.payload.to_string())))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                // A lagged subscriber misses intermediate events but the
                // stream itself stays usable.
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });
    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default())
}

async fn log_stream_handler(
    State(engine): State<Arc<Engine>>,
    Path((name, number)): Path<(String, i64)>,
) -> Response {
    // Subscribe before snapshotting the buffer so no chunk falls in between;
    // the overlap window may repeat a chunk, which live tails tolerate.
    let mut logs = engine.events().subscribe_logs();
    let (text, complete) = match engine.handle_log_request(&name, number).await {
        Ok(Some(log)) => log,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Log request failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(32);
    tokio::spawn(async move {
        if !text.is_empty() && tx.send(Ok(Event::default().data(text))).await.is_err() {
            return;
        }
        if complete {
            return;
        }
        loop {
            match logs.recv().await {
                Ok(chunk) => {
                    if chunk.job != name || chunk.number != number {
                        continue;
                    }
                    if chunk.complete {
                        break;
                    }
                    if tx.send(Ok(Event::default().data(chunk.chunk))).await.is_err() {
                        break;
                    }
                }
                // The end-of-stream marker could be among the dropped
                // messages; tear the stream down rather than hang.
                Err(RecvError::Lagged(_)) => break,
                Err(RecvError::Closed) => break,
            }
        }
    });
    Sse::new(ReceiverStream::new(rx))
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn log_handler(
    State(engine): State<Arc<Engine>>,
    Path((name, number)): Path<(String, i64)>,
) -> Response {
    match engine.handle_log_request(&name, number).await {
        Ok(Some((text, _complete))) => text.into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Log request failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn badge_handler(
    State(engine): State<Arc<Engine>>,
    Path(badge): Path<String>,
) -> Response {
    let Some(name) = badge.strip_suffix(".svg") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match engine.handle_badge_request(name).await {
        Ok(Some(svg)) => ([(header::CONTENT_TYPE, "image/svg+xml")], svg).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Badge request failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn archive_handler(
    State(engine): State<Arc<Engine>>,
    Path(path): Path<String>,
) -> Response {
    match engine.get_artifact(&path).await {
        Some(file) => {
            let stream = ReaderStream::new(file);
            (
                [(header::CONTENT_TYPE, "application/octet-stream")],
                Body::from_stream(stream),
            )
                .into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
