//! Web-request-shaped trigger payloads and the prelude used to answer them
//! over a streamed response.

use crate::Result;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Content type announcing that the stream starts with an [`HttpResponsePrelude`].
pub const HTTP_INTEGRATION_CONTENT_TYPE: &str =
    "application/vnd.awslambda.http-integration-response";

/// Separates the JSON prelude from the response body.
const PRELUDE_DELIMITER: [u8; 8] = [0; 8];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionUrlRequest {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub raw_path: String,
    #[serde(default)]
    pub raw_query_string: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub query_string_parameters: HashMap<String, String>,
    #[serde(default)]
    pub cookies: Vec<String>,
    #[serde(default)]
    pub request_context: RequestContext,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub is_base64_encoded: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub api_id: String,
    #[serde(default)]
    pub domain_name: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub time_epoch: i64,
    #[serde(default)]
    pub http: HttpDescription,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpDescription {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub source_ip: String,
    #[serde(default)]
    pub user_agent: String,
}

impl FunctionUrlRequest {
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Request body bytes, base64-decoded when the event says so.
    pub fn decoded_body(&self) -> Result<Vec<u8>> {
        match &self.body {
            None => Ok(Vec::new()),
            Some(body) if self.is_base64_encoded => Ok(STANDARD.decode(body)?),
            Some(body) => Ok(body.as_bytes().to_vec()),
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Status line and headers written ahead of a streamed web response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponsePrelude {
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cookies: Vec<String>,
}

impl Default for HttpResponsePrelude {
    fn default() -> Self {
        Self {
            status_code: 200,
            headers: HashMap::new(),
            cookies: Vec::new(),
        }
    }
}

impl HttpResponsePrelude {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.cookies.push(cookie.into());
        self
    }

    /// Serialized prelude: the JSON metadata followed by eight NUL bytes.
    pub fn to_prelude(&self) -> Result<Vec<u8>> {
        let mut out = serde_json::to_vec(self)?;
        out.extend_from_slice(&PRELUDE_DELIMITER);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event(body: Option<&str>, base64: bool) -> Vec<u8> {
        json!({
            "version": "2.0",
            "rawPath": "/orders/42",
            "rawQueryString": "expand=true",
            "headers": { "Content-Type": "application/json", "x-trace": "t1" },
            "queryStringParameters": { "expand": "true" },
            "cookies": ["session=abc"],
            "requestContext": {
                "accountId": "123456789012",
                "requestId": "req-1",
                "timeEpoch": 1700000000000i64,
                "http": {
                    "method": "POST",
                    "path": "/orders/42",
                    "protocol": "HTTP/1.1",
                    "sourceIp": "10.0.0.1",
                    "userAgent": "curl/8"
                }
            },
            "body": body,
            "isBase64Encoded": base64
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn test_decode_function_url_event() {
        let event =
            FunctionUrlRequest::from_slice(&sample_event(Some("{\"a\":1}"), false)).unwrap();
        assert_eq!(event.raw_path, "/orders/42");
        assert_eq!(event.request_context.http.method, "POST");
        assert_eq!(event.request_context.time_epoch, 1_700_000_000_000);
        assert_eq!(event.header("content-type"), Some("application/json"));
        assert_eq!(event.decoded_body().unwrap(), b"{\"a\":1}");
    }

    #[test]
    fn test_base64_body_is_decoded() {
        let event = FunctionUrlRequest::from_slice(&sample_event(Some("aGVsbG8="), true)).unwrap();
        assert_eq!(event.decoded_body().unwrap(), b"hello");

        let event = FunctionUrlRequest::from_slice(&sample_event(Some("%%%"), true)).unwrap();
        assert!(event.decoded_body().is_err());
    }

    #[test]
    fn test_missing_body_is_empty() {
        let event = FunctionUrlRequest::from_slice(&sample_event(None, false)).unwrap();
        assert!(event.decoded_body().unwrap().is_empty());
    }

    #[test]
    fn test_prelude_ends_with_delimiter() {
        let prelude = HttpResponsePrelude::new(201)
            .with_header("content-type", "text/plain")
            .with_cookie("a=b")
            .to_prelude()
            .unwrap();

        let (meta, tail) = prelude.split_at(prelude.len() - 8);
        assert_eq!(tail, &[0u8; 8]);
        let parsed: serde_json::Value = serde_json::from_slice(meta).unwrap();
        assert_eq!(parsed["statusCode"], 201);
        assert_eq!(parsed["headers"]["content-type"], "text/plain");
        assert_eq!(parsed["cookies"][0], "a=b");
    }

    #[test]
    fn test_default_prelude_omits_empty_collections() {
        let prelude = HttpResponsePrelude::default().to_prelude().unwrap();
        assert_eq!(&prelude[..prelude.len() - 8], br#"{"statusCode":200}"#);
    }
}
