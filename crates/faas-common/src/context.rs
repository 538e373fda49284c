//! Per-invocation metadata.
//!
//! One [`InvocationRequest`] lives for the whole process and is overwritten
//! in place for every invocation, then reset before the next poll. Nothing
//! borrowed from it may outlive the iteration that filled it.

use crate::{now_millis, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Raw header values of a `next` response, exactly as received.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationHeaders {
    pub request_id: Option<String>,
    pub trace_id: Option<String>,
    pub invoked_function_arn: Option<String>,
    pub deadline_ms: Option<String>,
    pub client_context: Option<String>,
    pub cognito_identity: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationRequest {
    pub request_id: String,
    pub trace_id: String,
    pub invoked_function_arn: String,
    /// Epoch milliseconds; `0` when the header was missing or malformed.
    pub deadline_ms: u64,
    pub client_context: Option<String>,
    pub cognito_identity: Option<String>,
    pub payload: Vec<u8>,
}

impl InvocationRequest {
    /// Builds a fresh record from one invocation.
    pub fn from_invocation(headers: InvocationHeaders, payload: Vec<u8>) -> Self {
        let mut request = Self::default();
        request.apply_invocation(headers, payload);
        request
    }

    /// Overwrites every per-invocation field.
    pub fn apply_invocation(&mut self, headers: InvocationHeaders, payload: Vec<u8>) {
        self.request_id = headers.request_id.unwrap_or_default();
        self.trace_id = headers.trace_id.unwrap_or_default();
        self.invoked_function_arn = headers.invoked_function_arn.unwrap_or_default();
        self.deadline_ms = headers
            .deadline_ms
            .and_then(|d| d.trim().parse::<u64>().ok())
            .unwrap_or(0);
        self.client_context = headers.client_context.filter(|c| !c.is_empty());
        self.cognito_identity = headers.cognito_identity.filter(|c| !c.is_empty());
        self.payload = payload;
    }

    /// Drops everything belonging to the finished invocation.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn has_request_id(&self) -> bool {
        !self.request_id.is_empty()
    }

    /// Milliseconds until the deadline. Advisory; may be negative.
    pub fn remaining_ms(&self) -> i64 {
        self.remaining_ms_at(now_millis())
    }

    pub fn remaining_ms_at(&self, now_ms: i64) -> i64 {
        i64::try_from(self.deadline_ms)
            .unwrap_or(i64::MAX)
            .saturating_sub(now_ms)
    }

    /// Decodes the client context blob sent by mobile SDK callers.
    pub fn client_context(&self) -> Result<Option<ClientContext>> {
        match &self.client_context {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    pub fn cognito_identity(&self) -> Result<Option<CognitoIdentity>> {
        match &self.cognito_identity {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientApplication {
    #[serde(default)]
    pub installation_id: String,
    #[serde(default)]
    pub app_title: String,
    #[serde(default)]
    pub app_version_name: String,
    #[serde(default)]
    pub app_version_code: String,
    #[serde(default)]
    pub app_package_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientContext {
    #[serde(default)]
    pub client: Option<ClientApplication>,
    #[serde(default)]
    pub custom: HashMap<String, String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CognitoIdentity {
    #[serde(default, alias = "cognitoIdentityId")]
    pub identity_id: String,
    #[serde(default, alias = "cognitoIdentityPoolId")]
    pub identity_pool_id: String,
}
