use {
    axum::{
        Json,
        http::StatusCode,
        response::{IntoResponse, Response},
    },
    brainproxy_protocol::{ErrorBody, error_types},
};

/// Request-level failures, each mapped to an HTTP status and an
/// OpenAI-style error body.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("{0}")]
    Internal(String),
}

impl ProxyError {
    pub fn upstream(err: &anyhow::Error) -> Self {
        Self::Upstream(format!("{err:#}"))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn body(&self) -> ErrorBody {
        let kind = match self {
            Self::InvalidRequest(_) => error_types::INVALID_REQUEST,
            Self::Unauthorized(_) => error_types::AUTHENTICATION,
            Self::Upstream(_) => error_types::UPSTREAM,
            Self::Internal(_) => error_types::INTERNAL,
        };
        ErrorBody::new(kind, self.to_string())
    }
}

impl From<brainproxy_common::Error> for ProxyError {
    fn from(err: brainproxy_common::Error) -> Self {
        match err {
            e @ brainproxy_common::Error::InvalidTenant { .. } => {
                Self::InvalidRequest(e.to_string())
            },
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}
