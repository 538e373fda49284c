//! Streaming response state machine
//!
//! One machine per invocation. It starts `Pending`, becomes `Active` once the
//! chunked response is open and ends after the terminating chunk. A transport
//! failure poisons it for good: every later call returns
//! [`StreamError::RuntimeFail`] without touching the transport, and the
//! engine refuses to reuse the instance.

use crate::protocol::{ErrorReport, ResponseOutcome, RuntimeClient, StreamHandle};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Pending,
    Active,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    None,
    /// The function failed after the stream was opened; reported through trailers.
    Handler,
    /// The transport failed; the connection can no longer be trusted.
    Runtime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamState {
    pub lifecycle: Lifecycle,
    pub fault: Fault,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            lifecycle: Lifecycle::Pending,
            fault: Fault::None,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream has not been opened")]
    InactiveStream,
    #[error("stream is closed")]
    ClosedStream,
    #[error("stream transport failed")]
    RuntimeFail,
}

/// What a function body may do with its response stream.
pub trait ResponseStream {
    /// Opens the stream. Opening an already opened or ended stream does nothing.
    fn open(&mut self, content_type: &str) -> Result<(), StreamError> {
        self.open_with_prelude(content_type, None)
    }

    /// Opens the stream and sends `prelude` ahead of any written bytes.
    fn open_with_prelude(
        &mut self,
        content_type: &str,
        prelude: Option<&[u8]>,
    ) -> Result<(), StreamError>;

    /// Buffers bytes until the next flush.
    fn write(&mut self, bytes: &[u8]) -> Result<(), StreamError>;

    /// Sends buffered bytes as one chunk.
    fn flush(&mut self) -> Result<(), StreamError>;

    fn publish(&mut self, bytes: &[u8]) -> Result<(), StreamError> {
        self.write(bytes)?;
        self.flush()
    }

    fn close(&mut self) -> Result<(), StreamError>;

    /// Ends the stream, carrying the error in trailers.
    fn close_with_error(&mut self, report: &ErrorReport) -> Result<(), StreamError>;

    fn state(&self) -> StreamState;
}

/// Engine-owned stream bound to one invocation.
pub struct InvocationStream<'a> {
    client: &'a mut RuntimeClient,
    request_id: &'a str,
    state: StreamState,
    handle: Option<StreamHandle>,
    pending: Vec<u8>,
    outcome: Option<ResponseOutcome>,
}

impl<'a> InvocationStream<'a> {
    pub fn new(client: &'a mut RuntimeClient, request_id: &'a str) -> Self {
        Self {
            client,
            request_id,
            state: StreamState::default(),
            handle: None,
            pending: Vec::new(),
            outcome: None,
        }
    }

    pub(crate) fn client_mut(&mut self) -> &mut RuntimeClient {
        &mut *self.client
    }

    /// Terminal outcome reported by the Runtime API once closed.
    pub fn outcome(&self) -> Option<&ResponseOutcome> {
        self.outcome.as_ref()
    }

    fn check_writable(&self) -> Result<(), StreamError> {
        match (self.state.fault, self.state.lifecycle) {
            (Fault::Runtime, _) => Err(StreamError::RuntimeFail),
            (Fault::Handler, _) => Err(StreamError::ClosedStream),
            (_, Lifecycle::Pending) => Err(StreamError::InactiveStream),
            (_, Lifecycle::Ended) => Err(StreamError::ClosedStream),
            (_, Lifecycle::Active) => Ok(()),
        }
    }

    /// Guard shared by `close` and `close_with_error`; `Ok(false)` means already ended.
    fn check_closable(&self) -> Result<bool, StreamError> {
        match (self.state.fault, self.state.lifecycle) {
            (Fault::Runtime, _) => Err(StreamError::RuntimeFail),
            (_, Lifecycle::Pending) => Err(StreamError::InactiveStream),
            (_, Lifecycle::Ended) => Ok(false),
            (_, Lifecycle::Active) => Ok(true),
        }
    }

    fn runtime_fault(&mut self, reason: &dyn std::fmt::Display) -> StreamError {
        error!(request_id = self.request_id, error = %reason, "Streamed response transport failed");
        self.state = StreamState {
            lifecycle: Lifecycle::Ended,
            fault: Fault::Runtime,
        };
        self.handle = None;
        self.pending.clear();
        StreamError::RuntimeFail
    }

    fn send_pending(&mut self) -> Result<(), StreamError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let bytes = std::mem::take(&mut self.pending);
        let Some(handle) = self.handle.as_mut() else {
            return Err(self.runtime_fault(&"stream handle missing"));
        };
        match self.client.append_stream(handle, &bytes) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.runtime_fault(&e)),
        }
    }

    fn finish(&mut self, error: Option<&ErrorReport>) -> Result<(), StreamError> {
        self.send_pending()?;
        let Some(handle) = self.handle.take() else {
            return Err(self.runtime_fault(&"stream handle missing"));
        };
        match self.client.close_stream(handle, error) {
            Ok(outcome) => {
                outcome.log(self.request_id);
                self.outcome = Some(outcome);
                self.state.lifecycle = Lifecycle::Ended;
                Ok(())
            }
            Err(e) => Err(self.runtime_fault(&e)),
        }
    }
}

impl ResponseStream for InvocationStream<'_> {
    fn open_with_prelude(
        &mut self,
        content_type: &str,
        prelude: Option<&[u8]>,
    ) -> Result<(), StreamError> {
        if self.state.fault == Fault::Runtime {
            return Err(StreamError::RuntimeFail);
        }
        if self.state.lifecycle != Lifecycle::Pending {
            return Ok(());
        }
        match self.client.open_stream(self.request_id, content_type, prelude) {
            Ok(handle) => {
                debug!(request_id = self.request_id, "Stream opened");
                self.handle = Some(handle);
                self.state.lifecycle = Lifecycle::Active;
                Ok(())
            }
            Err(e) => Err(self.runtime_fault(&e)),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), StreamError> {
        self.check_writable()?;
        self.pending.extend_from_slice(bytes);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StreamError> {
        self.check_writable()?;
        self.send_pending()
    }

    fn close(&mut self) -> Result<(), StreamError> {
        if !self.check_closable()? {
            return Ok(());
        }
        self.finish(None)
    }

    fn close_with_error(&mut self, report: &ErrorReport) -> Result<(), StreamError> {
        if !self.check_closable()? {
            return Ok(());
        }
        self.state.fault = Fault::Handler;
        self.finish(Some(report))
    }

    fn state(&self) -> StreamState {
        self.state
    }
}
