/// Errors raised while adapting a request to an application.
#[derive(thiserror::Error, Debug, Clone)]
pub enum GatewayError {
    /// A state-machine transition the convention does not allow.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The application raised.
    #[error("application fault: {0}")]
    Application(String),

    /// The synchronous application overran its configured deadline.
    #[error("application timed out")]
    Timeout,

    #[error("invalid HTTP method: {method}")]
    InvalidMethod { method: String },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("invalid header: {message}")]
    InvalidHeader { message: String },

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl GatewayError {
    pub fn protocol(message: impl Into<String>) -> Self {
        GatewayError::Protocol(message.into())
    }

    pub fn application(message: impl Into<String>) -> Self {
        GatewayError::Application(message.into())
    }
}

impl From<http::Error> for GatewayError {
    fn from(e: http::Error) -> Self {
        GatewayError::InvalidHeader {
            message: e.to_string(),
        }
    }
}

impl From<tether_core::Error> for GatewayError {
    fn from(e: tether_core::Error) -> Self {
        GatewayError::InvalidRequest {
            message: e.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
