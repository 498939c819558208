#[derive(Debug)]
pub enum ServerError {
    Io(std::io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "server io error: {err}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

#[derive(Debug)]
struct HttpApiError {
    status: StatusCode,
    error: ApiError,
}

impl HttpApiError {
    fn session_not_found(session_id: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: ApiError::new(
                ErrorCode::SessionNotFound,
                "session_id does not match a known session",
                Some(format!("session_id={session_id}")),
            ),
        }
    }

    fn conflict(message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            error: ApiError::new(ErrorCode::SessionStateConflict, message, details),
        }
    }

    fn invalid_input(message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: ApiError::new(ErrorCode::InvalidInput, message, details),
        }
    }

    fn internal(message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: ApiError::new(ErrorCode::InternalError, message, details),
        }
    }

    fn from_runtime(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Session(SessionError::NotStarted) => {
                Self::conflict("session has not been started", None)
            }
            RuntimeError::Session(SessionError::AlreadyStarted) => {
                Self::conflict("session was already started", None)
            }
            RuntimeError::Session(SessionError::Ended(reason)) => Self::conflict(
                "session has ended",
                Some(format!("end_reason={reason}")),
            ),
            RuntimeError::StillRunning => Self::conflict("session is still running", None),
            RuntimeError::NoSignal => {
                Self::invalid_input("no outcome signal is available to redeliver", None)
            }
            RuntimeError::Closed => Self::internal("session runtime has stopped", None),
        }
    }

    fn from_open(err: OpenSessionError) -> Self {
        match err {
            OpenSessionError::Config(err) => Self {
                status: StatusCode::BAD_REQUEST,
                error: ApiError::new(
                    ErrorCode::InvalidConfig,
                    "experiment config is invalid",
                    Some(err.to_string()),
                ),
            },
            OpenSessionError::Log(err) => {
                Self::internal("session log file could not be created", Some(err.to_string()))
            }
        }
    }
}

impl IntoResponse for HttpApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.error)).into_response()
    }
}
