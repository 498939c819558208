#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CreateSessionRequest {
    WithOptions(CreateSessionOptions),
    Config(ExperimentConfig),
}

#[derive(Debug, Deserialize)]
struct CreateSessionOptions {
    config: ExperimentConfig,
    auto_start: Option<bool>,
}

#[derive(Debug, Serialize)]
struct CreateSessionResponse {
    schema_version: String,
    session_id: String,
    status: SessionStatus,
    started: bool,
}

#[derive(Debug, Serialize)]
struct InputResponse {
    schema_version: String,
    session_id: String,
    input: String,
    accepted: bool,
    status: SessionStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OutcomeRequest {
    /// Redelivers the session's last signal when absent.
    signal: Option<OutcomeSignal>,
}

#[derive(Debug, Serialize)]
struct OutcomeResponse {
    schema_version: String,
    session_id: String,
    acceptance: String,
    detail: Option<String>,
}

#[derive(Debug, Serialize)]
struct ForceEndResponse {
    schema_version: String,
    session_id: String,
    ended_movement: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AbortRequest {
    detail: Option<String>,
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, HttpApiError> {
    let (config, auto_start) = match request {
        CreateSessionRequest::Config(config) => (config, true),
        CreateSessionRequest::WithOptions(options) => {
            (options.config, options.auto_start.unwrap_or(true))
        }
    };

    let started_at = Utc::now();
    let session_id = session_id_for(&config.participant.participant_id, started_at);
    let settings = {
        let mut inner = state.inner.lock().await;
        inner.reserve(&session_id)?;
        inner.settings_for(&config)
    };

    let opened = {
        let settings = settings.clone();
        tokio::task::spawn_blocking(move || open_session(config, &settings, started_at)).await
    };

    let handle = {
        let mut inner = state.inner.lock().await;
        inner.reserved.remove(&session_id);
        let session = match opened {
            Ok(result) => result.map_err(HttpApiError::from_open)?,
            Err(err) => {
                return Err(HttpApiError::internal(
                    "session setup task failed",
                    Some(err.to_string()),
                ))
            }
        };
        let handle = SessionHandle::spawn(session, Some(settings.submitter()));
        inner.sessions.insert(session_id, handle.clone());
        handle
    };

    let status = if auto_start {
        handle.start().await.map_err(HttpApiError::from_runtime)?
    } else {
        handle.status().await.map_err(HttpApiError::from_runtime)?
    };
    info!(session_id = handle.session_id(), started = auto_start, "session created");

    Ok(Json(CreateSessionResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        session_id: handle.session_id().to_string(),
        status,
        started: auto_start,
    }))
}

async fn start_session(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<SessionStatus>, HttpApiError> {
    let handle = require_session(&state, &session_id).await?;
    let status = handle.start().await.map_err(HttpApiError::from_runtime)?;
    Ok(Json(status))
}

async fn submit_input(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
    Json(input): Json<InputKind>,
) -> Result<Json<InputResponse>, HttpApiError> {
    let handle = require_session(&state, &session_id).await?;
    let disposition = handle
        .input(input)
        .await
        .map_err(HttpApiError::from_runtime)?;
    let status = handle.status().await.map_err(HttpApiError::from_runtime)?;

    Ok(Json(InputResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        session_id,
        input: input.label(),
        accepted: disposition == InputDisposition::Accepted,
        status,
    }))
}

async fn deliver_outcome(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<OutcomeRequest>,
) -> Result<Json<OutcomeResponse>, HttpApiError> {
    let handle = require_session(&state, &session_id).await?;
    let acceptance = handle
        .deliver_outcome(request.signal)
        .await
        .map_err(HttpApiError::from_runtime)?;
    let (acceptance, detail) = acceptance_fields(&acceptance);

    Ok(Json(OutcomeResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        session_id,
        acceptance,
        detail,
    }))
}

async fn force_end(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<ForceEndResponse>, HttpApiError> {
    let handle = require_session(&state, &session_id).await?;
    let ended_movement = handle
        .force_end()
        .await
        .map_err(HttpApiError::from_runtime)?;

    Ok(Json(ForceEndResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        session_id,
        ended_movement,
    }))
}

async fn abort_session(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<AbortRequest>,
) -> Result<Json<FinalizeReport>, HttpApiError> {
    let handle = require_session(&state, &session_id).await?;
    let detail = request
        .detail
        .filter(|detail| !detail.trim().is_empty())
        .unwrap_or_else(|| "aborted via api".to_string());
    let report = handle
        .abort(detail)
        .await
        .map_err(HttpApiError::from_runtime)?;
    Ok(Json(report))
}

async fn finalize_session(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<FinalizeReport>, HttpApiError> {
    let handle = require_session(&state, &session_id).await?;
    let report = handle
        .finalize()
        .await
        .map_err(HttpApiError::from_runtime)?;
    Ok(Json(report))
}
