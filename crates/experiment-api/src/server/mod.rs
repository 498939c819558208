use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::Method;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use contracts::{
    ApiError, ErrorCode, EventRecord, ExperimentConfig, InputKind, OutcomeSignal, SessionStatus,
    SCHEMA_VERSION_V1,
};
use experiment_core::{Acceptance, InputDisposition, SessionError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tracing::info;

use crate::{
    open_session, session_id_for, FinalizeReport, NoticeEnvelope, OpenSessionError, RuntimeError,
    RuntimeSettings, SessionHandle,
};

const DEFAULT_PAGE_SIZE: usize = 500;
const MAX_PAGE_SIZE: usize = 5000;

include!("error.rs");
include!("state.rs");
include!("routes/control.rs");
include!("routes/query.rs");
include!("routes/stream.rs");
include!("util.rs");

/// Serves the session API. `settings` seeds every session's file locations;
/// each request's config can still override the log directory.
pub async fn serve(addr: SocketAddr, settings: Option<RuntimeSettings>) -> Result<(), ServerError> {
    let state = AppState::new(settings);
    let app = router_with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "session api listening");
    axum::serve(listener, app).await?;

    Ok(())
}

pub fn router(settings: Option<RuntimeSettings>) -> Router {
    router_with_state(AppState::new(settings))
}

fn router_with_state(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/sessions", post(create_session).get(list_sessions))
        .route("/api/v1/sessions/{session_id}/start", post(start_session))
        .route("/api/v1/sessions/{session_id}/input", post(submit_input))
        .route("/api/v1/sessions/{session_id}/outcome", post(deliver_outcome))
        .route("/api/v1/sessions/{session_id}/force_end", post(force_end))
        .route("/api/v1/sessions/{session_id}/abort", post(abort_session))
        .route("/api/v1/sessions/{session_id}/status", get(get_status))
        .route("/api/v1/sessions/{session_id}/records", get(get_records))
        .route("/api/v1/sessions/{session_id}/finalize", post(finalize_session))
        .route("/api/v1/sessions/{session_id}/stream", get(stream_session))
        .layer(middleware::from_fn(cors_middleware))
        .with_state(state)
}

async fn cors_middleware(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = Response::new(axum::body::Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        apply_cors_headers(response.headers_mut());
        return response;
    }

    let mut response = next.run(request).await;
    apply_cors_headers(response.headers_mut());
    response
}
