//! HTTP transport to the Runtime API
//!
//! The protocol client only needs a blocking request/response primitive and a
//! chunked-upload primitive. [`HyperTransport`] provides both over a single
//! persistent HTTP/1.1 connection, driven by a private current-thread tokio
//! runtime so the rest of the crate stays synchronous.

use bytes::Bytes;
use http::header::HOST;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::client::conn::http1::{self, SendRequest};
use hyper::Response;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Frames in flight between the caller and the connection task. Kept at one
/// so a flush only returns once hyper has taken the chunk.
const CHUNK_BUFFER: usize = 1;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to connect to Runtime API at {origin}: {source}")]
    Connect {
        origin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
    #[error("Invalid request: {0}")]
    InvalidRequest(#[from] http::Error),
    #[error("Connection closed: {0}")]
    Closed(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One request to the Runtime API, addressed by origin-form path.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl TransportRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn post(path: impl Into<String>, body: Option<Bytes>) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            headers: HeaderMap::new(),
            body,
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Blocking request/response primitive.
pub trait Transport {
    fn send(&mut self, request: TransportRequest) -> Result<TransportResponse, TransportError>;

    /// Starts a request whose body is supplied incrementally.
    fn open_chunked(
        &mut self,
        request: TransportRequest,
    ) -> Result<Box<dyn ChunkedRequest>, TransportError>;
}

/// An in-flight chunked request body.
pub trait ChunkedRequest {
    fn append_chunk(&mut self, chunk: &[u8]) -> Result<(), TransportError>;

    /// Terminates the body, optionally with trailer fields, and waits for the response.
    fn close_chunked(
        self: Box<Self>,
        trailers: Option<HeaderMap>,
    ) -> Result<TransportResponse, TransportError>;
}

type RequestBody = BoxBody<Bytes, Infallible>;
type FrameSender = mpsc::Sender<Result<Frame<Bytes>, Infallible>>;

pub struct HyperTransport {
    origin: String,
    runtime: Arc<Runtime>,
    sender: Option<SendRequest<RequestBody>>,
}

impl HyperTransport {
    /// Builds the transport and opens the first connection eagerly so an
    /// unreachable origin surfaces during startup.
    pub fn connect(origin: &str) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let mut transport = Self {
            origin: origin.to_string(),
            runtime: Arc::new(runtime),
            sender: None,
        };
        transport.ready()?;
        Ok(transport)
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    fn ready(&mut self) -> Result<(), TransportError> {
        if let Some(sender) = self.sender.as_mut() {
            if self.runtime.block_on(sender.ready()).is_ok() {
                return Ok(());
            }
            debug!(origin = %self.origin, "Runtime API connection closed, reconnecting");
        }
        let sender = self.runtime.block_on(handshake(&self.origin))?;
        self.sender = Some(sender);
        Ok(())
    }

    fn build(
        &self,
        request: TransportRequest,
        body: RequestBody,
    ) -> Result<http::Request<RequestBody>, TransportError> {
        let mut builder = http::Request::builder()
            .method(request.method)
            .uri(request.path)
            .header(HOST, self.origin.as_str());
        if let Some(headers) = builder.headers_mut() {
            headers.extend(request.headers);
        }
        Ok(builder.body(body)?)
    }

    fn sender(&mut self) -> Result<&mut SendRequest<RequestBody>, TransportError> {
        self.sender
            .as_mut()
            .ok_or_else(|| TransportError::Closed("no Runtime API connection".to_string()))
    }
}

impl Transport for HyperTransport {
    fn send(&mut self, mut request: TransportRequest) -> Result<TransportResponse, TransportError> {
        self.ready()?;
        let body = Full::new(request.body.take().unwrap_or_default()).boxed();
        let http_request = self.build(request, body)?;

        let runtime = Arc::clone(&self.runtime);
        let sender = self.sender()?;
        let result = runtime.block_on(async {
            let response = sender.send_request(http_request).await?;
            collect(response).await
        });
        if result.is_err() {
            self.sender = None;
        }
        result
    }

    fn open_chunked(
        &mut self,
        mut request: TransportRequest,
    ) -> Result<Box<dyn ChunkedRequest>, TransportError> {
        self.ready()?;
        let leading = request.body.take();
        let (frames, rx) = mpsc::channel(CHUNK_BUFFER);
        let body = StreamBody::new(ReceiverStream::new(rx)).boxed();
        let http_request = self.build(request, body)?;

        let runtime = Arc::clone(&self.runtime);
        let pending = self.sender()?.send_request(http_request);
        let response = runtime.spawn(pending);

        let mut chunked = HyperChunked {
            runtime,
            frames: Some(frames),
            response,
        };
        if let Some(leading) = leading {
            chunked.append_chunk(&leading)?;
        }
        Ok(Box::new(chunked))
    }
}

async fn handshake(origin: &str) -> Result<SendRequest<RequestBody>, TransportError> {
    let stream = TcpStream::connect(origin)
        .await
        .map_err(|source| TransportError::Connect {
            origin: origin.to_string(),
            source,
        })?;
    stream.set_nodelay(true)?;

    let (sender, connection) = http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(error = %e, "Runtime API connection failed");
        }
    });
    Ok(sender)
}

async fn collect(response: Response<Incoming>) -> Result<TransportResponse, TransportError> {
    let (parts, body) = response.into_parts();
    let body = body.collect().await?.to_bytes();
    Ok(TransportResponse {
        status: parts.status.as_u16(),
        headers: parts.headers,
        body,
    })
}

struct HyperChunked {
    runtime: Arc<Runtime>,
    frames: Option<FrameSender>,
    response: JoinHandle<hyper::Result<Response<Incoming>>>,
}

fn dropped() -> TransportError {
    TransportError::Closed("Runtime API stopped reading the streamed body".to_string())
}

impl ChunkedRequest for HyperChunked {
    fn append_chunk(&mut self, chunk: &[u8]) -> Result<(), TransportError> {
        // An empty data frame would read as the terminating chunk.
        if chunk.is_empty() {
            return Ok(());
        }
        let frames = self
            .frames
            .as_ref()
            .ok_or_else(|| TransportError::Closed("chunked body already finished".to_string()))?;
        let frame = Frame::data(Bytes::copy_from_slice(chunk));
        self.runtime.block_on(async {
            frames.send(Ok(frame)).await.map_err(|_| dropped())?;
            // Wait until the connection task has pulled the frame.
            frames.reserve().await.map(drop).map_err(|_| dropped())
        })
    }

    fn close_chunked(
        self: Box<Self>,
        trailers: Option<HeaderMap>,
    ) -> Result<TransportResponse, TransportError> {
        let HyperChunked {
            runtime,
            frames,
            response,
        } = *self;

        if let (Some(frames), Some(trailers)) = (frames.as_ref(), trailers) {
            runtime
                .block_on(frames.send(Ok(Frame::trailers(trailers))))
                .map_err(|_| dropped())?;
        }
        drop(frames);

        runtime.block_on(async {
            match response.await {
                Ok(response) => collect(response?).await,
                Err(e) => Err(TransportError::Closed(format!(
                    "streamed request task failed: {e}"
                ))),
            }
        })
    }
}
