//! Ready-made processors for the common handler shapes.
//!
//! Each adapter runs the function body, answers the Runtime API with the
//! result or a `Handler.<Name>` error, and turns transport failures while
//! answering into [`Flow::Abort`]. Panics are caught and reported as
//! `Handler.Panic`.

use crate::engine::{Flow, Invocation, Processor, ReplyError};
use crate::protocol::ErrorReport;
use crate::stream::{Fault, Lifecycle, ResponseStream, StreamError};
use faas_common::{Config, InvocationRequest};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use tracing::warn;

/// Read-only invocation metadata passed to handlers.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    pub config: &'a Config,
    pub request: &'a InvocationRequest,
}

impl<'a> Context<'a> {
    pub fn request_id(&self) -> &'a str {
        &self.request.request_id
    }

    pub fn trace_id(&self) -> &'a str {
        &self.request.trace_id
    }

    pub fn invoked_function_arn(&self) -> &'a str {
        &self.request.invoked_function_arn
    }

    pub fn deadline_ms(&self) -> u64 {
        self.request.deadline_ms
    }

    /// Advisory; nothing here enforces the deadline.
    pub fn remaining_ms(&self) -> i64 {
        self.request.remaining_ms()
    }
}

impl<'a> Invocation<'a> {
    pub fn context(&self) -> Context<'a> {
        Context {
            config: self.config(),
            request: self.request(),
        }
    }
}

fn panic_report(payload: Box<dyn Any + Send>) -> ErrorReport {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string());
    ErrorReport::new("Panic", message)
}

fn run_guarded<T>(f: impl FnOnce() -> Result<T, ErrorReport>) -> Result<T, ErrorReport> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| Err(panic_report(payload)))
}

fn reply_flow<T>(result: Result<T, ReplyError>) -> Flow {
    match result {
        Ok(_) => Flow::Continue,
        Err(e) if e.is_transport() => Flow::Abort,
        Err(e) => {
            warn!(error = %e, "Invocation answer was not delivered");
            Flow::Continue
        }
    }
}

/// Buffered handler: the whole response is returned at once.
pub struct HandlerFn<F>(F);

pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: FnMut(Context<'_>, &[u8]) -> Result<Vec<u8>, ErrorReport>,
{
    HandlerFn(f)
}

impl<F> Processor for HandlerFn<F>
where
    F: FnMut(Context<'_>, &[u8]) -> Result<Vec<u8>, ErrorReport>,
{
    fn process(&mut self, invocation: &mut Invocation<'_>) -> Flow {
        let ctx = invocation.context();
        let payload = invocation.payload();
        match run_guarded(|| (self.0)(ctx, payload)) {
            Ok(body) => reply_flow(invocation.respond(&body)),
            Err(report) => {
                warn!(request_id = ctx.request_id(), error = %report, "Handler failed");
                reply_flow(invocation.fail(&report))
            }
        }
    }
}

/// JSON in, JSON out. An undecodable payload is answered with `Handler.InvalidPayload`.
pub fn json_handler<T, R, F>(
    mut f: F,
) -> HandlerFn<impl FnMut(Context<'_>, &[u8]) -> Result<Vec<u8>, ErrorReport>>
where
    T: DeserializeOwned,
    R: Serialize,
    F: FnMut(Context<'_>, T) -> Result<R, ErrorReport>,
{
    handler_fn(move |ctx: Context<'_>, payload: &[u8]| {
        let input: T = serde_json::from_slice(payload)
            .map_err(|e| ErrorReport::new("InvalidPayload", e.to_string()))?;
        let output = f(ctx, input)?;
        serde_json::to_vec(&output).map_err(|e| ErrorReport::new("InvalidResponse", e.to_string()))
    })
}

/// Streaming handler: writes to the response stream as it goes.
///
/// An error after the stream was opened travels in trailers and the loop
/// continues; an error before opening is reported like a buffered failure.
pub struct StreamingFn<F>(F);

pub fn streaming_fn<F>(f: F) -> StreamingFn<F>
where
    F: FnMut(Context<'_>, &[u8], &mut dyn ResponseStream) -> Result<(), ErrorReport>,
{
    StreamingFn(f)
}

impl<F> Processor for StreamingFn<F>
where
    F: FnMut(Context<'_>, &[u8], &mut dyn ResponseStream) -> Result<(), ErrorReport>,
{
    fn process(&mut self, invocation: &mut Invocation<'_>) -> Flow {
        let ctx = invocation.context();
        let payload = invocation.payload();
        let result = run_guarded(|| (self.0)(ctx, payload, invocation.stream()));

        let state = invocation.stream_state();
        if state.fault == Fault::Runtime {
            return Flow::Abort;
        }
        let Err(report) = result else {
            return Flow::Continue;
        };
        warn!(request_id = ctx.request_id(), error = %report, "Streaming handler failed");

        match state.lifecycle {
            Lifecycle::Active => match invocation.stream().close_with_error(&report) {
                Ok(()) => Flow::Continue,
                Err(StreamError::RuntimeFail) => Flow::Abort,
                Err(e) => {
                    warn!(error = %e, "Could not attach the error to the stream");
                    Flow::Continue
                }
            },
            Lifecycle::Pending => reply_flow(invocation.fail(&report)),
            Lifecycle::Ended => {
                warn!(
                    request_id = ctx.request_id(),
                    "Handler failed after closing its stream; error not delivered"
                );
                Flow::Continue
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faas_common::config::RUNTIME_API_KEY;
    use faas_common::{load_config, InvocationHeaders};

    #[test]
    fn test_panic_payloads_become_reports() {
        let report = run_guarded::<()>(|| panic!("static message"));
        assert_eq!(report.unwrap_err(), ErrorReport::new("Panic", "static message"));

        let code = 7;
        let report = run_guarded::<()>(|| panic!("formatted {code}"));
        assert_eq!(report.unwrap_err().message, "formatted 7");
    }

    #[test]
    fn test_context_exposes_request_metadata() {
        let config =
            load_config(|k| (k == RUNTIME_API_KEY).then(|| "localhost:9001".to_string())).unwrap();
        let request = InvocationRequest::from_invocation(
            InvocationHeaders {
                request_id: Some("abc".to_string()),
                trace_id: Some("Root=1-abc".to_string()),
                invoked_function_arn: Some("arn:aws:lambda:us-east-1:1:function:f".to_string()),
                deadline_ms: Some("42".to_string()),
                ..Default::default()
            },
            Vec::new(),
        );
        let ctx = Context {
            config: &config,
            request: &request,
        };
        assert_eq!(ctx.request_id(), "abc");
        assert_eq!(ctx.trace_id(), "Root=1-abc");
        assert_eq!(ctx.invoked_function_arn(), "arn:aws:lambda:us-east-1:1:function:f");
        assert_eq!(ctx.deadline_ms(), 42);
        assert!(ctx.remaining_ms() < 0);
    }
}
