//! Custom function runtime for the Runtime API.
//!
//! The crate is layered bottom-up:
//! - [`transport`]: blocking HTTP/1.1 to the Runtime API, including chunked uploads with trailers
//! - [`protocol`]: the fixed endpoints and their typed outcomes
//! - [`stream`]: the per-invocation streaming response state machine
//! - [`engine`]: the poll, dispatch, reset loop and the startup sequence
//! - [`handler`]: ready-made processors for buffered, JSON and streaming functions
//!
//! Most functions only need [`run`]:
//!
//! ```no_run
//! use faas_runtime::{handler_fn, Context, ErrorReport};
//!
//! let exit = faas_runtime::run(|_config| {
//!     Ok::<_, ErrorReport>(handler_fn(|_ctx: Context<'_>, payload: &[u8]| Ok(payload.to_vec())))
//! });
//! ```

pub mod engine;
pub mod handler;
pub mod protocol;
pub mod stream;
pub mod testing;
pub mod transport;

pub use engine::{
    processor_fn, start, Engine, EngineExit, EngineOptions, Flow, ForbiddenPolicy, Invocation,
    Processor, ReplyError, StartupError, Step,
};
pub use faas_common::{Config, FaasError, InvocationRequest};
pub use handler::{handler_fn, json_handler, streaming_fn, Context, HandlerFn, StreamingFn};
pub use protocol::{ErrorCategory, ErrorReport, ProtocolError, RuntimeClient};
pub use stream::{Fault, Lifecycle, ResponseStream, StreamError, StreamState};
pub use transport::{HyperTransport, Transport, TransportError};

/// Starts the runtime from the process environment over a real connection
/// and serves invocations until a fatal outcome.
pub fn run<I, P>(init: I) -> Result<EngineExit, StartupError>
where
    I: FnOnce(&Config) -> Result<P, ErrorReport>,
    P: Processor,
{
    start(
        |key| std::env::var(key).ok(),
        |origin| Ok(Box::new(HyperTransport::connect(origin)?) as Box<dyn Transport>),
        EngineOptions::default(),
        init,
    )
}
