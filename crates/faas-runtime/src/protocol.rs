//! Runtime API protocol client
//!
//! Encodes the four fixed endpoints plus the streaming response variant, and
//! turns every HTTP status into a typed outcome. Only transport and parse
//! failures are errors here; deciding whether the process should stop is left
//! to the engine.

use crate::transport::{
    ChunkedRequest, Transport, TransportError, TransportRequest, TransportResponse,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use faas_common::{InvocationHeaders, InvocationRequest};
use http::header::{CONTENT_TYPE, TRAILER, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, error, warn};

pub const API_VERSION: &str = "2018-06-01";

pub const REQUEST_ID_HEADER: &str = "lambda-runtime-aws-request-id";
pub const TRACE_ID_HEADER: &str = "lambda-runtime-trace-id";
pub const FUNCTION_ARN_HEADER: &str = "lambda-runtime-invoked-function-arn";
pub const DEADLINE_HEADER: &str = "lambda-runtime-deadline-ms";
pub const CLIENT_CONTEXT_HEADER: &str = "lambda-runtime-client-context";
pub const COGNITO_IDENTITY_HEADER: &str = "lambda-runtime-cognito-identity";
/// Full header names; they double as the trailer names of a failed stream.
pub const ERROR_TYPE_HEADER: &str = "lambda-runtime-function-error-type";
pub const ERROR_BODY_TRAILER: &str = "lambda-runtime-function-error-body";
pub const RESPONSE_MODE_HEADER: &str = "lambda-runtime-function-response-mode";

const STREAMING_MODE: &str = "streaming";

pub fn init_error_path() -> String {
    format!("/{API_VERSION}/runtime/init/error")
}

pub fn next_path() -> String {
    format!("/{API_VERSION}/runtime/invocation/next")
}

pub fn response_path(request_id: &str) -> String {
    format!("/{API_VERSION}/runtime/invocation/{request_id}/response")
}

pub fn error_path(request_id: &str) -> String {
    format!("/{API_VERSION}/runtime/invocation/{request_id}/error")
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("Malformed Runtime API response: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Transport failures leave the connection in an unknown state.
    pub fn is_transport(&self) -> bool {
        matches!(self, ProtocolError::Transport(_))
    }
}

/// Where an error originated; selects the `errorType` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Initialization or runtime-internal failures.
    Runtime,
    /// Anything raised by the function body.
    Handler,
}

impl ErrorCategory {
    pub fn prefix(&self) -> &'static str {
        match self {
            ErrorCategory::Runtime => "Runtime",
            ErrorCategory::Handler => "Handler",
        }
    }
}

/// A named error as reported to the Runtime API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub name: String,
    pub message: String,
}

impl ErrorReport {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// `<Category>.<Name>`
    pub fn error_type(&self, category: ErrorCategory) -> String {
        format!("{}.{}", category.prefix(), self.name)
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl<E: std::error::Error> From<E> for ErrorReport {
    fn from(err: E) -> Self {
        Self::new(short_type_name::<E>(), err.to_string())
    }
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Error body returned by the Runtime API for rejected calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    #[serde(default)]
    pub error_type: String,
    #[serde(default)]
    pub error_message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorRequestBody<'a> {
    error_type: String,
    error_message: &'a str,
    stack_trace: Vec<String>,
}

/// JSON body for the init and invocation error endpoints.
pub fn format_error_envelope(category: ErrorCategory, report: &ErrorReport) -> Vec<u8> {
    let body = ErrorRequestBody {
        error_type: report.error_type(category),
        error_message: &report.message,
        stack_trace: Vec::new(),
    };
    // Serializing a struct of strings cannot fail.
    serde_json::to_vec(&body).unwrap_or_default()
}

pub fn parse_envelope(body: &[u8]) -> Result<ErrorEnvelope, ProtocolError> {
    Ok(serde_json::from_slice(body)?)
}

/// Status codes the Runtime API contract knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Ok,
    Accepted,
    BadRequest,
    Forbidden,
    PayloadTooLarge,
    ContainerError,
    Unknown(u16),
}

impl StatusClass {
    pub fn from_code(code: u16) -> Self {
        match code {
            200 => StatusClass::Ok,
            202 => StatusClass::Accepted,
            400 => StatusClass::BadRequest,
            403 => StatusClass::Forbidden,
            413 => StatusClass::PayloadTooLarge,
            500 => StatusClass::ContainerError,
            other => StatusClass::Unknown(other),
        }
    }
}

/// An invocation as delivered by `next`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextInvocation {
    pub headers: InvocationHeaders,
    pub payload: Vec<u8>,
}

impl NextInvocation {
    pub fn into_request(self) -> InvocationRequest {
        InvocationRequest::from_invocation(self.headers, self.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextOutcome {
    Accepted(NextInvocation),
    Forbidden(ErrorEnvelope),
    ContainerError,
    UnknownStatus(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitErrorOutcome {
    Accepted,
    BadRequest(ErrorEnvelope),
    Forbidden(ErrorEnvelope),
    ContainerError,
    UnknownStatus(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    Accepted,
    BadRequest(ErrorEnvelope),
    Forbidden(ErrorEnvelope),
    PayloadTooLarge(ErrorEnvelope),
    ContainerError,
    UnknownStatus(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorOutcome {
    Accepted,
    BadRequest(ErrorEnvelope),
    Forbidden(ErrorEnvelope),
    ContainerError,
    UnknownStatus(u16),
}

impl NextOutcome {
    pub fn from_response(response: TransportResponse) -> Result<Self, ProtocolError> {
        Ok(match StatusClass::from_code(response.status) {
            StatusClass::Ok => NextOutcome::Accepted(NextInvocation {
                headers: parse_invocation_headers(&response.headers),
                payload: response.body.to_vec(),
            }),
            StatusClass::Forbidden => NextOutcome::Forbidden(parse_envelope(&response.body)?),
            StatusClass::ContainerError => NextOutcome::ContainerError,
            _ => NextOutcome::UnknownStatus(response.status),
        })
    }
}

impl InitErrorOutcome {
    pub fn from_response(response: TransportResponse) -> Result<Self, ProtocolError> {
        Ok(match StatusClass::from_code(response.status) {
            StatusClass::Accepted => InitErrorOutcome::Accepted,
            StatusClass::BadRequest => {
                InitErrorOutcome::BadRequest(parse_envelope(&response.body)?)
            }
            StatusClass::Forbidden => InitErrorOutcome::Forbidden(parse_envelope(&response.body)?),
            StatusClass::ContainerError => InitErrorOutcome::ContainerError,
            _ => InitErrorOutcome::UnknownStatus(response.status),
        })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            InitErrorOutcome::ContainerError | InitErrorOutcome::UnknownStatus(_)
        )
    }
}

impl ResponseOutcome {
    pub fn from_response(response: TransportResponse) -> Result<Self, ProtocolError> {
        Ok(match StatusClass::from_code(response.status) {
            StatusClass::Accepted => ResponseOutcome::Accepted,
            StatusClass::BadRequest => ResponseOutcome::BadRequest(parse_envelope(&response.body)?),
            StatusClass::Forbidden => ResponseOutcome::Forbidden(parse_envelope(&response.body)?),
            StatusClass::PayloadTooLarge => {
                ResponseOutcome::PayloadTooLarge(parse_envelope(&response.body)?)
            }
            StatusClass::ContainerError => ResponseOutcome::ContainerError,
            _ => ResponseOutcome::UnknownStatus(response.status),
        })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ResponseOutcome::ContainerError | ResponseOutcome::UnknownStatus(_)
        )
    }

    /// Every outcome closes the invocation; rejected ones are only worth a log line.
    pub fn log(&self, request_id: &str) {
        match self {
            ResponseOutcome::Accepted => debug!(request_id, "Response accepted"),
            ResponseOutcome::BadRequest(env)
            | ResponseOutcome::Forbidden(env)
            | ResponseOutcome::PayloadTooLarge(env) => warn!(
                request_id,
                error_type = %env.error_type,
                error_message = %env.error_message,
                "Runtime API rejected the response"
            ),
            ResponseOutcome::ContainerError => {
                error!(request_id, "Runtime API reported a container error for the response")
            }
            ResponseOutcome::UnknownStatus(status) => {
                error!(request_id, status, "Unexpected status for the response")
            }
        }
    }
}

impl ErrorOutcome {
    pub fn from_response(response: TransportResponse) -> Result<Self, ProtocolError> {
        Ok(match StatusClass::from_code(response.status) {
            StatusClass::Accepted => ErrorOutcome::Accepted,
            StatusClass::BadRequest => ErrorOutcome::BadRequest(parse_envelope(&response.body)?),
            StatusClass::Forbidden => ErrorOutcome::Forbidden(parse_envelope(&response.body)?),
            StatusClass::ContainerError => ErrorOutcome::ContainerError,
            _ => ErrorOutcome::UnknownStatus(response.status),
        })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorOutcome::ContainerError | ErrorOutcome::UnknownStatus(_)
        )
    }

    pub fn log(&self, request_id: &str) {
        match self {
            ErrorOutcome::Accepted => debug!(request_id, "Error report accepted"),
            ErrorOutcome::BadRequest(env) | ErrorOutcome::Forbidden(env) => warn!(
                request_id,
                error_type = %env.error_type,
                error_message = %env.error_message,
                "Runtime API rejected the error report"
            ),
            ErrorOutcome::ContainerError => {
                error!(request_id, "Runtime API reported a container error for the error report")
            }
            ErrorOutcome::UnknownStatus(status) => {
                error!(request_id, status, "Unexpected status for the error report")
            }
        }
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
}

pub fn parse_invocation_headers(headers: &HeaderMap) -> InvocationHeaders {
    InvocationHeaders {
        request_id: header_string(headers, REQUEST_ID_HEADER),
        trace_id: header_string(headers, TRACE_ID_HEADER),
        invoked_function_arn: header_string(headers, FUNCTION_ARN_HEADER),
        deadline_ms: header_string(headers, DEADLINE_HEADER),
        client_context: header_string(headers, CLIENT_CONTEXT_HEADER),
        cognito_identity: header_string(headers, COGNITO_IDENTITY_HEADER),
    }
}

/// hyper only emits trailer fields announced in the `Trailer` header.
fn declared_trailers() -> HeaderValue {
    header_value(&format!("{ERROR_TYPE_HEADER}, {ERROR_BODY_TRAILER}"))
}

/// Header values cannot carry control characters; drop them rather than fail the report.
fn header_value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap_or_else(|_| {
        let cleaned: String = value
            .chars()
            .filter(|c| c.is_ascii() && !c.is_ascii_control())
            .collect();
        HeaderValue::from_str(&cleaned).unwrap_or_else(|_| HeaderValue::from_static("Unknown"))
    })
}

/// An open streamed response for one invocation.
pub struct StreamHandle {
    request_id: String,
    body: Box<dyn ChunkedRequest>,
}

impl StreamHandle {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

pub struct RuntimeClient {
    transport: Box<dyn Transport>,
}

impl RuntimeClient {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::from_boxed(Box::new(transport))
    }

    pub fn from_boxed(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn report_init_failure(
        &mut self,
        report: &ErrorReport,
    ) -> Result<InitErrorOutcome, ProtocolError> {
        debug!(error_type = %report.name, "Reporting init failure");
        let request = error_request(init_error_path(), ErrorCategory::Runtime, report);
        InitErrorOutcome::from_response(self.transport.send(request)?)
    }

    /// Long-polls for the next invocation. May block indefinitely.
    pub fn poll_next(&mut self) -> Result<NextOutcome, ProtocolError> {
        let response = self.transport.send(TransportRequest::get(next_path()))?;
        NextOutcome::from_response(response)
    }

    pub fn report_success(
        &mut self,
        request_id: &str,
        payload: &[u8],
    ) -> Result<ResponseOutcome, ProtocolError> {
        debug!(request_id, bytes = payload.len(), "Sending response");
        let request = TransportRequest::post(
            response_path(request_id),
            Some(Bytes::copy_from_slice(payload)),
        );
        ResponseOutcome::from_response(self.transport.send(request)?)
    }

    pub fn report_failure(
        &mut self,
        request_id: &str,
        report: &ErrorReport,
    ) -> Result<ErrorOutcome, ProtocolError> {
        debug!(request_id, error_type = %report.name, "Sending error report");
        let request = error_request(error_path(request_id), ErrorCategory::Handler, report);
        ErrorOutcome::from_response(self.transport.send(request)?)
    }

    /// Opens a chunked response, writing `prelude` before any caller data.
    pub fn open_stream(
        &mut self,
        request_id: &str,
        content_type: &str,
        prelude: Option<&[u8]>,
    ) -> Result<StreamHandle, ProtocolError> {
        debug!(request_id, content_type, "Opening streamed response");
        let request = TransportRequest::post(response_path(request_id), None)
            .header(CONTENT_TYPE, header_value(content_type))
            .header(
                HeaderName::from_static(RESPONSE_MODE_HEADER),
                HeaderValue::from_static(STREAMING_MODE),
            )
            .header(TRANSFER_ENCODING, HeaderValue::from_static("chunked"))
            .header(TRAILER, declared_trailers());

        let mut body = self.transport.open_chunked(request)?;
        if let Some(prelude) = prelude.filter(|p| !p.is_empty()) {
            body.append_chunk(prelude)?;
        }
        Ok(StreamHandle {
            request_id: request_id.to_string(),
            body,
        })
    }

    pub fn append_stream(
        &mut self,
        handle: &mut StreamHandle,
        bytes: &[u8],
    ) -> Result<(), ProtocolError> {
        Ok(handle.body.append_chunk(bytes)?)
    }

    /// Ends the streamed body. An error travels in trailers, its message base64-encoded.
    pub fn close_stream(
        &mut self,
        handle: StreamHandle,
        error: Option<&ErrorReport>,
    ) -> Result<ResponseOutcome, ProtocolError> {
        let trailers = error.map(|report| {
            let mut trailers = HeaderMap::new();
            trailers.insert(
                HeaderName::from_static(ERROR_TYPE_HEADER),
                header_value(&report.name),
            );
            trailers.insert(
                HeaderName::from_static(ERROR_BODY_TRAILER),
                header_value(&STANDARD.encode(report.message.as_bytes())),
            );
            trailers
        });
        debug!(
            request_id = %handle.request_id,
            with_error = trailers.is_some(),
            "Closing streamed response"
        );
        ResponseOutcome::from_response(handle.body.close_chunked(trailers)?)
    }
}

fn error_request(path: String, category: ErrorCategory, report: &ErrorReport) -> TransportRequest {
    TransportRequest::post(path, Some(Bytes::from(format_error_envelope(category, report))))
        .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .header(
            HeaderName::from_static(ERROR_TYPE_HEADER),
            header_value(&report.name),
        )
}
