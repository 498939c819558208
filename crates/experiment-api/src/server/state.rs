#[derive(Clone)]
struct AppState {
    inner: std::sync::Arc<Mutex<ServerInner>>,
}

impl AppState {
    fn new(settings: Option<RuntimeSettings>) -> Self {
        Self {
            inner: std::sync::Arc::new(Mutex::new(ServerInner {
                settings,
                sessions: HashMap::new(),
                reserved: HashSet::new(),
            })),
        }
    }
}

#[derive(Debug)]
struct ServerInner {
    /// Fixed file locations; `None` derives them from each session's config.
    settings: Option<RuntimeSettings>,
    sessions: HashMap<String, SessionHandle>,
    /// Ids whose log file is being opened.
    reserved: HashSet<String>,
}

impl ServerInner {
    /// Claims `session_id` until its session is registered or the claim is
    /// released.
    fn reserve(&mut self, session_id: &str) -> Result<(), HttpApiError> {
        if self.sessions.contains_key(session_id) || !self.reserved.insert(session_id.to_string()) {
            return Err(HttpApiError::conflict(
                "session_id already exists",
                Some(format!("session_id={session_id}")),
            ));
        }
        Ok(())
    }

    fn settings_for(&self, config: &ExperimentConfig) -> RuntimeSettings {
        self.settings
            .clone()
            .unwrap_or_else(|| RuntimeSettings::from_config(config))
    }
}

/// Clones the handle out so the server lock is not held across the actor call.
async fn require_session(state: &AppState, session_id: &str) -> Result<SessionHandle, HttpApiError> {
    let inner = state.inner.lock().await;
    inner
        .sessions
        .get(session_id)
        .cloned()
        .ok_or_else(|| HttpApiError::session_not_found(session_id))
}
