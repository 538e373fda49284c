//! Metadata shared by the runtime crates: process configuration, the record
//! of the invocation in flight, and the web-event payload types.

use thiserror::Error;

pub mod config;
pub mod context;
pub mod events;

pub use config::{load_config, Config, InitType};
pub use context::{ClientContext, CognitoIdentity, InvocationHeaders, InvocationRequest};

#[derive(Error, Debug)]
pub enum FaasError {
    #[error("AWS_LAMBDA_RUNTIME_API is not set; the Runtime API cannot be addressed")]
    MissingRuntimeApi,

    #[error("Serialization Error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Decode Error: {0}")]
    Decode(#[from] base64::DecodeError),
}

pub type Result<T> = std::result::Result<T, FaasError>;

/// Current wall-clock time as epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    #[test]
    fn test_error_sources_convert() {
        let err: FaasError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(matches!(err, FaasError::Serialization(_)));

        let err: FaasError = STANDARD.decode("%%%").unwrap_err().into();
        assert!(matches!(err, FaasError::Decode(_)));

        assert!(FaasError::MissingRuntimeApi
            .to_string()
            .contains("AWS_LAMBDA_RUNTIME_API"));
    }
}
