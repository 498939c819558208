async fn stream_session(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, HttpApiError> {
    let handle = require_session(&state, &session_id).await?;
    let status = handle.status().await.map_err(HttpApiError::from_runtime)?;
    let initial_message = StreamMessage::session_status(&status);
    let rx = handle.subscribe();

    Ok(ws.on_upgrade(move |socket| stream_socket(socket, rx, session_id, initial_message)))
}

async fn stream_socket(
    mut socket: WebSocket,
    mut rx: broadcast::Receiver<NoticeEnvelope>,
    session_id: String,
    initial_message: StreamMessage,
) {
    if send_stream_message(&mut socket, &initial_message)
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                        break;
                    }
                    _ => {}
                }
            }
            outgoing = rx.recv() => {
                match outgoing {
                    Ok(envelope) => {
                        if send_stream_message(&mut socket, &StreamMessage::notice(&envelope))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        let warning = StreamMessage::warning(
                            &session_id,
                            format!("stream client lagged and skipped {skipped} notice(s)"),
                        );

                        if send_stream_message(&mut socket, &warning).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        }
    }
}

async fn send_stream_message(
    socket: &mut WebSocket,
    message: &StreamMessage,
) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(message).map_err(axum::Error::new)?;
    socket.send(Message::Text(payload.into())).await
}

#[derive(Debug, Clone, Serialize)]
struct StreamMessage {
    schema_version: String,
    #[serde(rename = "type")]
    message_type: String,
    session_id: String,
    sequence: Option<u64>,
    at_ms: Option<u64>,
    payload: Value,
}

impl StreamMessage {
    fn session_status(status: &SessionStatus) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            message_type: "session.status".to_string(),
            session_id: status.session_id.clone(),
            sequence: None,
            at_ms: None,
            payload: json!(status),
        }
    }

    fn notice(envelope: &NoticeEnvelope) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            message_type: "session.notice".to_string(),
            session_id: envelope.session_id.clone(),
            sequence: Some(envelope.sequence),
            at_ms: Some(envelope.at_ms),
            payload: json!(envelope.notice),
        }
    }

    fn warning(session_id: &str, warning: String) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            message_type: "warning".to_string(),
            session_id: session_id.to_string(),
            sequence: None,
            at_ms: None,
            payload: json!({ "message": warning }),
        }
    }
}
