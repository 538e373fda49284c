//! Process-wide runtime configuration.
//!
//! Loaded once at startup from the execution environment and never mutated
//! afterwards. The engine owns the value and lends it to every invocation.

use crate::{FaasError, Result};
use std::fmt;

pub const RUNTIME_API_KEY: &str = "AWS_LAMBDA_RUNTIME_API";
pub const REGION_KEY: &str = "AWS_REGION";
pub const DEFAULT_REGION_KEY: &str = "AWS_DEFAULT_REGION";
pub const ACCESS_KEY_ID_KEY: &str = "AWS_ACCESS_KEY_ID";
pub const SECRET_ACCESS_KEY_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const SESSION_TOKEN_KEY: &str = "AWS_SESSION_TOKEN";
pub const FUNCTION_NAME_KEY: &str = "AWS_LAMBDA_FUNCTION_NAME";
pub const FUNCTION_VERSION_KEY: &str = "AWS_LAMBDA_FUNCTION_VERSION";
pub const HANDLER_KEY: &str = "_HANDLER";
pub const MEMORY_SIZE_KEY: &str = "AWS_LAMBDA_FUNCTION_MEMORY_SIZE";
pub const INIT_TYPE_KEY: &str = "AWS_LAMBDA_INITIALIZATION_TYPE";
pub const LOG_GROUP_KEY: &str = "AWS_LAMBDA_LOG_GROUP_NAME";
pub const LOG_STREAM_KEY: &str = "AWS_LAMBDA_LOG_STREAM_NAME";

pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_MEMORY_MB: u32 = 128;

/// How the execution environment brought this instance up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitType {
    #[default]
    OnDemand,
    Provisioned,
    SnapStart,
}

impl InitType {
    /// Parses the environment's spelling; anything unrecognised is `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "on-demand" => Some(InitType::OnDemand),
            "provisioned-concurrency" => Some(InitType::Provisioned),
            "snap-start" => Some(InitType::SnapStart),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InitType::OnDemand => "on-demand",
            InitType::Provisioned => "provisioned-concurrency",
            InitType::SnapStart => "snap-start",
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Config {
    /// `host:port` of the Runtime API.
    pub runtime_api: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub function_name: String,
    pub function_version: String,
    /// Handler path as configured on the function (`_HANDLER`).
    pub handler: String,
    pub memory_size_mb: u32,
    pub init_type: InitType,
    pub log_group_name: String,
    pub log_stream_name: String,
}

impl Config {
    /// Loads the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        load_config(|key| std::env::var(key).ok())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("runtime_api", &self.runtime_api)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &redact(&self.secret_access_key))
            .field("session_token", &redact(&self.session_token))
            .field("function_name", &self.function_name)
            .field("function_version", &self.function_version)
            .field("handler", &self.handler)
            .field("memory_size_mb", &self.memory_size_mb)
            .field("init_type", &self.init_type)
            .field("log_group_name", &self.log_group_name)
            .field("log_stream_name", &self.log_stream_name)
            .finish()
    }
}

fn redact(value: &str) -> &'static str {
    if value.is_empty() {
        ""
    } else {
        "<redacted>"
    }
}

/// Builds a [`Config`] from an arbitrary key lookup.
///
/// Region, memory size and init type fall back to defaults when absent or
/// unparsable. The only hard requirement is a non-empty Runtime API origin.
pub fn load_config<F>(lookup: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).unwrap_or_default();

    let runtime_api = get(RUNTIME_API_KEY).trim().to_string();
    if runtime_api.is_empty() {
        return Err(FaasError::MissingRuntimeApi);
    }

    let region = lookup(REGION_KEY)
        .filter(|r| !r.is_empty())
        .or_else(|| lookup(DEFAULT_REGION_KEY).filter(|r| !r.is_empty()))
        .unwrap_or_else(|| DEFAULT_REGION.to_string());

    let memory_size_mb = lookup(MEMORY_SIZE_KEY)
        .and_then(|m| m.trim().parse::<u32>().ok())
        .filter(|m| *m > 0)
        .unwrap_or(DEFAULT_MEMORY_MB);

    let init_type = lookup(INIT_TYPE_KEY)
        .and_then(|t| InitType::parse(&t))
        .unwrap_or_default();

    Ok(Config {
        runtime_api,
        region,
        access_key_id: get(ACCESS_KEY_ID_KEY),
        secret_access_key: get(SECRET_ACCESS_KEY_KEY),
        session_token: get(SESSION_TOKEN_KEY),
        function_name: get(FUNCTION_NAME_KEY),
        function_version: get(FUNCTION_VERSION_KEY),
        handler: get(HANDLER_KEY),
        memory_size_mb,
        init_type,
        log_group_name: get(LOG_GROUP_KEY),
        log_stream_name: get(LOG_STREAM_KEY),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_load_full_config() {
        let vars = env(&[
            (RUNTIME_API_KEY, "127.0.0.1:9001"),
            (REGION_KEY, "eu-west-1"),
            (ACCESS_KEY_ID_KEY, "AKIA"),
            (SECRET_ACCESS_KEY_KEY, "secret"),
            (SESSION_TOKEN_KEY, "token"),
            (FUNCTION_NAME_KEY, "echo"),
            (FUNCTION_VERSION_KEY, "$LATEST"),
            (HANDLER_KEY, "bootstrap.handler"),
            (MEMORY_SIZE_KEY, "512"),
            (INIT_TYPE_KEY, "snap-start"),
            (LOG_GROUP_KEY, "/aws/lambda/echo"),
            (LOG_STREAM_KEY, "2024/01/01/[$LATEST]abc"),
        ]);
        let config = load_config(|k| vars.get(k).cloned()).unwrap();

        assert_eq!(config.runtime_api, "127.0.0.1:9001");
        assert_eq!(config.region, "eu-west-1");
        assert_eq!(config.function_name, "echo");
        assert_eq!(config.handler, "bootstrap.handler");
        assert_eq!(config.memory_size_mb, 512);
        assert_eq!(config.init_type, InitType::SnapStart);
        assert_eq!(config.log_group_name, "/aws/lambda/echo");
    }

    #[test]
    fn test_defaults_when_absent_or_malformed() {
        let vars = env(&[
            (RUNTIME_API_KEY, "localhost:9001"),
            (MEMORY_SIZE_KEY, "lots"),
            (INIT_TYPE_KEY, "warm"),
        ]);
        let config = load_config(|k| vars.get(k).cloned()).unwrap();

        assert_eq!(config.region, DEFAULT_REGION);
        assert_eq!(config.memory_size_mb, DEFAULT_MEMORY_MB);
        assert_eq!(config.init_type, InitType::OnDemand);
        assert!(config.session_token.is_empty());
    }

    #[test]
    fn test_region_falls_back_to_default_region_key() {
        let vars = env(&[
            (RUNTIME_API_KEY, "localhost:9001"),
            (DEFAULT_REGION_KEY, "ap-south-1"),
        ]);
        let config = load_config(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(config.region, "ap-south-1");
    }

    #[test]
    fn test_missing_runtime_api_is_fatal() {
        let vars = env(&[(RUNTIME_API_KEY, "  "), (REGION_KEY, "us-west-2")]);
        let err = load_config(|k| vars.get(k).cloned()).unwrap_err();
        assert!(matches!(err, FaasError::MissingRuntimeApi));

        let err = load_config(|_| None).unwrap_err();
        assert!(matches!(err, FaasError::MissingRuntimeApi));
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let vars = env(&[
            (RUNTIME_API_KEY, "localhost:9001"),
            (SECRET_ACCESS_KEY_KEY, "hunter2"),
            (SESSION_TOKEN_KEY, "sess"),
        ]);
        let config = load_config(|k| vars.get(k).cloned()).unwrap();
        let printed = format!("{config:?}");
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("sess\""));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn test_init_type_round_trips_its_spelling() {
        for t in [InitType::OnDemand, InitType::Provisioned, InitType::SnapStart] {
            assert_eq!(InitType::parse(t.as_str()), Some(t));
        }
        assert_eq!(InitType::parse("cold"), None);
    }
}
