#[derive(Debug, Serialize)]
struct SessionSummary {
    session_id: String,
    status: Option<SessionStatus>,
}

#[derive(Debug, Serialize)]
struct ListSessionsResponse {
    schema_version: String,
    sessions: Vec<SessionSummary>,
}

#[derive(Debug, Deserialize)]
struct RecordsQuery {
    cursor: Option<usize>,
    page_size: Option<usize>,
}

#[derive(Debug, Serialize)]
struct RecordsResponse {
    schema_version: String,
    session_id: String,
    total: usize,
    next_cursor: Option<usize>,
    records: Vec<EventRecord>,
}

async fn list_sessions(
    State(state): State<AppState>,
) -> Result<Json<ListSessionsResponse>, HttpApiError> {
    let mut handles = {
        let inner = state.inner.lock().await;
        inner.sessions.values().cloned().collect::<Vec<_>>()
    };
    handles.sort_by(|a, b| a.session_id().cmp(b.session_id()));

    let mut sessions = Vec::with_capacity(handles.len());
    for handle in handles {
        sessions.push(SessionSummary {
            session_id: handle.session_id().to_string(),
            status: handle.status().await.ok(),
        });
    }

    Ok(Json(ListSessionsResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        sessions,
    }))
}

async fn get_status(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<SessionStatus>, HttpApiError> {
    let handle = require_session(&state, &session_id).await?;
    let status = handle.status().await.map_err(HttpApiError::from_runtime)?;
    Ok(Json(status))
}

async fn get_records(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
    Query(query): Query<RecordsQuery>,
) -> Result<Json<RecordsResponse>, HttpApiError> {
    let handle = require_session(&state, &session_id).await?;
    let size = page_size(query.page_size);
    let page = handle
        .records(query.cursor.unwrap_or(0), size)
        .await
        .map_err(HttpApiError::from_runtime)?;
    let (_, _, next_cursor) = paginate(page.total, query.cursor, Some(size))?;

    Ok(Json(RecordsResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        session_id,
        total: page.total,
        next_cursor,
        records: page.records,
    }))
}
