//! Scripted in-memory transport for exercising the protocol client and engine
//! without a Runtime API.

use crate::protocol::{DEADLINE_HEADER, REQUEST_ID_HEADER};
use crate::transport::{
    ChunkedRequest, Transport, TransportError, TransportRequest, TransportResponse,
};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A request as seen by the mock, including any streamed chunks.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub streamed: bool,
    pub chunks: Vec<Vec<u8>>,
    pub trailers: Option<HeaderMap>,
    pub finished: bool,
}

impl RecordedRequest {
    fn new(request: TransportRequest, streamed: bool) -> Self {
        Self {
            method: request.method,
            path: request.path,
            headers: request.headers,
            body: request.body.map(|b| b.to_vec()).unwrap_or_default(),
            streamed,
            chunks: Vec::new(),
            trailers: None,
            finished: !streamed,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// All streamed chunks concatenated.
    pub fn streamed_body(&self) -> Vec<u8> {
        self.chunks.concat()
    }
}

enum Reply {
    Response(TransportResponse),
    Failure(String),
}

#[derive(Default)]
struct MockState {
    replies: VecDeque<Reply>,
    requests: Vec<RecordedRequest>,
    fail_chunks_after: Option<usize>,
    fail_next_open: bool,
    calls: usize,
}

impl MockState {
    fn next_reply(&mut self) -> Result<TransportResponse, TransportError> {
        match self.replies.pop_front() {
            Some(Reply::Response(response)) => Ok(response),
            Some(Reply::Failure(reason)) => Err(TransportError::Closed(reason)),
            None => Err(TransportError::Closed("no scripted reply left".to_string())),
        }
    }
}

/// Cloning shares the script and the recorded traffic.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_response(&self, status: u16, body: impl Into<Bytes>) {
        self.push_response_with_headers(status, &[], body);
    }

    pub fn push_response_with_headers(
        &self,
        status: u16,
        headers: &[(&str, &str)],
        body: impl Into<Bytes>,
    ) {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                map.append(name, value);
            }
        }
        self.lock().replies.push_back(Reply::Response(TransportResponse {
            status,
            headers: map,
            body: body.into(),
        }));
    }

    /// A `next` response carrying one invocation.
    pub fn push_next_invocation(
        &self,
        request_id: &str,
        deadline_ms: &str,
        payload: impl Into<Bytes>,
    ) {
        self.push_response_with_headers(
            200,
            &[(REQUEST_ID_HEADER, request_id), (DEADLINE_HEADER, deadline_ms)],
            payload,
        );
    }

    pub fn push_accepted(&self) {
        self.push_response(202, r#"{"status":"OK"}"#);
    }

    pub fn push_transport_failure(&self, reason: &str) {
        self.lock().replies.push_back(Reply::Failure(reason.to_string()));
    }

    /// Every chunk appended after the first `n` fails.
    pub fn fail_chunks_after(&self, n: usize) {
        self.lock().fail_chunks_after = Some(n);
    }

    pub fn fail_next_open(&self) {
        self.lock().fail_next_open = true;
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    /// Number of transport operations attempted, including failed ones.
    pub fn calls(&self) -> usize {
        self.lock().calls
    }

    pub fn remaining_replies(&self) -> usize {
        self.lock().replies.len()
    }

    pub fn boxed(&self) -> Box<dyn Transport> {
        Box::new(self.clone())
    }
}

impl Transport for MockTransport {
    fn send(&mut self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let mut state = self.lock();
        state.calls += 1;
        state.requests.push(RecordedRequest::new(request, false));
        state.next_reply()
    }

    fn open_chunked(
        &mut self,
        request: TransportRequest,
    ) -> Result<Box<dyn ChunkedRequest>, TransportError> {
        let mut state = self.lock();
        state.calls += 1;
        if std::mem::take(&mut state.fail_next_open) {
            return Err(TransportError::Closed("injected open failure".to_string()));
        }
        state.requests.push(RecordedRequest::new(request, true));
        Ok(Box::new(MockChunked {
            state: Arc::clone(&self.state),
            index: state.requests.len() - 1,
        }))
    }
}

struct MockChunked {
    state: Arc<Mutex<MockState>>,
    index: usize,
}

impl MockChunked {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ChunkedRequest for MockChunked {
    fn append_chunk(&mut self, chunk: &[u8]) -> Result<(), TransportError> {
        let index = self.index;
        let mut state = self.lock();
        state.calls += 1;
        let sent = state.requests[index].chunks.len();
        if state.fail_chunks_after.is_some_and(|limit| sent >= limit) {
            return Err(TransportError::Closed("injected chunk failure".to_string()));
        }
        state.requests[index].chunks.push(chunk.to_vec());
        Ok(())
    }

    fn close_chunked(
        self: Box<Self>,
        trailers: Option<HeaderMap>,
    ) -> Result<TransportResponse, TransportError> {
        let index = self.index;
        let mut state = self.lock();
        state.calls += 1;
        state.requests[index].trailers = trailers;
        state.requests[index].finished = true;
        state.next_reply()
    }
}
