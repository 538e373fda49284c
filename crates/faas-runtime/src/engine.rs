//! The event loop: poll, dispatch, reset.
//!
//! The engine is the only component that decides whether the process keeps
//! serving. The protocol client reports typed outcomes, the processor reports
//! a [`Flow`], and the engine combines both with its own view of the
//! invocation (stream faults, transport failures) to pick the next step.

use crate::protocol::{
    ErrorEnvelope, ErrorOutcome, ErrorReport, InitErrorOutcome, NextOutcome, ProtocolError,
    ResponseOutcome, RuntimeClient,
};
use crate::stream::{Fault, InvocationStream, Lifecycle, ResponseStream, StreamState};
use crate::transport::{Transport, TransportError};
use faas_common::{load_config, Config, FaasError, InvocationRequest};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn};

/// Environment variable carrying the current invocation's trace id.
pub const TRACE_ID_ENV: &str = "_X_AMZN_TRACE_ID";

/// What the processor wants after an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The instance is unsafe to reuse.
    Abort,
}

/// Handles one invocation: runs the function and answers the Runtime API.
pub trait Processor {
    fn process(&mut self, invocation: &mut Invocation<'_>) -> Flow;
}

impl<P: Processor + ?Sized> Processor for Box<P> {
    fn process(&mut self, invocation: &mut Invocation<'_>) -> Flow {
        (**self).process(invocation)
    }
}

/// Adapts a closure into a [`Processor`].
pub struct ProcessorFn<F>(F);

pub fn processor_fn<F>(f: F) -> ProcessorFn<F>
where
    F: FnMut(&mut Invocation<'_>) -> Flow,
{
    ProcessorFn(f)
}

impl<F> Processor for ProcessorFn<F>
where
    F: FnMut(&mut Invocation<'_>) -> Flow,
{
    fn process(&mut self, invocation: &mut Invocation<'_>) -> Flow {
        (self.0)(invocation)
    }
}

#[derive(Error, Debug)]
pub enum ReplyError {
    #[error("invocation was already answered")]
    AlreadyAnswered,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ReplyError {
    pub fn is_transport(&self) -> bool {
        matches!(self, ReplyError::Protocol(e) if e.is_transport())
    }
}

/// Borrowed view of the current invocation handed to the processor.
///
/// Everything here lives only for one loop iteration.
pub struct Invocation<'a> {
    config: &'a Config,
    request: &'a InvocationRequest,
    stream: InvocationStream<'a>,
    answered: bool,
    transport_failed: bool,
}

impl<'a> Invocation<'a> {
    pub fn new(
        config: &'a Config,
        request: &'a InvocationRequest,
        client: &'a mut RuntimeClient,
    ) -> Self {
        Self {
            config,
            request,
            stream: InvocationStream::new(client, &request.request_id),
            answered: false,
            transport_failed: false,
        }
    }

    pub fn config(&self) -> &'a Config {
        self.config
    }

    pub fn request(&self) -> &'a InvocationRequest {
        self.request
    }

    pub fn request_id(&self) -> &'a str {
        &self.request.request_id
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.request.payload
    }

    /// True once a response, an error or a stream has been started.
    pub fn is_answered(&self) -> bool {
        self.answered || self.stream.state().lifecycle != Lifecycle::Pending
    }

    pub fn stream_state(&self) -> StreamState {
        self.stream.state()
    }

    /// The response stream capability. Opening it answers the invocation.
    pub fn stream(&mut self) -> &mut dyn ResponseStream {
        &mut self.stream
    }

    /// Sends the whole response at once.
    pub fn respond(&mut self, body: &[u8]) -> Result<ResponseOutcome, ReplyError> {
        if self.is_answered() {
            return Err(ReplyError::AlreadyAnswered);
        }
        self.answered = true;
        let request_id = self.request_id();
        match self.stream.client_mut().report_success(request_id, body) {
            Ok(outcome) => {
                outcome.log(request_id);
                Ok(outcome)
            }
            Err(e) => Err(self.reply_failed(e)),
        }
    }

    /// Reports a function error for this invocation.
    pub fn fail(&mut self, report: &ErrorReport) -> Result<ErrorOutcome, ReplyError> {
        if self.is_answered() {
            return Err(ReplyError::AlreadyAnswered);
        }
        self.answered = true;
        let request_id = self.request_id();
        match self.stream.client_mut().report_failure(request_id, report) {
            Ok(outcome) => {
                outcome.log(request_id);
                Ok(outcome)
            }
            Err(e) => Err(self.reply_failed(e)),
        }
    }

    fn reply_failed(&mut self, e: ProtocolError) -> ReplyError {
        error!(request_id = self.request_id(), error = %e, "Failed to answer invocation");
        if e.is_transport() {
            self.transport_failed = true;
        }
        ReplyError::Protocol(e)
    }

    /// Engine-side completion: close what the processor left open, answer
    /// what it left unanswered, and veto reuse after a transport fault.
    fn finish(mut self, flow: Flow) -> Flow {
        match self.stream.state().lifecycle {
            Lifecycle::Active => {
                debug!(request_id = self.request_id(), "Closing stream left open by the handler");
                if let Err(e) = self.stream.close() {
                    warn!(request_id = self.request_id(), error = %e, "Failed to close stream");
                }
            }
            Lifecycle::Pending if !self.answered => {
                warn!(
                    request_id = self.request_id(),
                    "Handler returned without producing a response"
                );
                let report = ErrorReport::new("NoResponse", "handler returned without a response");
                // Failures are logged inside `fail`.
                let _ = self.fail(&report);
            }
            _ => {}
        }

        if self.transport_failed || self.stream.state().fault == Fault::Runtime {
            if flow == Flow::Continue {
                warn!(
                    request_id = self.request_id(),
                    "Transport failed during the invocation; refusing to reuse the instance"
                );
            }
            return Flow::Abort;
        }
        flow
    }
}

/// What to do when `next` answers 403.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForbiddenPolicy {
    /// Log and poll again.
    #[default]
    Retry,
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub forbidden_policy: ForbiddenPolicy,
    /// Export each invocation's trace id as `_X_AMZN_TRACE_ID`.
    pub propagate_trace_id: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            forbidden_policy: ForbiddenPolicy::Retry,
            propagate_trace_id: true,
        }
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineExit {
    ContainerError,
    UnknownStatus(u16),
    Transport(String),
    MalformedResponse(String),
    Forbidden(ErrorEnvelope),
    /// The processor or the engine deemed the instance unsafe to reuse.
    Aborted,
}

/// Result of one loop iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Continue,
    Exit(EngineExit),
}

pub struct Engine {
    config: Config,
    client: RuntimeClient,
    request: InvocationRequest,
    options: EngineOptions,
}

impl Engine {
    pub fn new(config: Config, client: RuntimeClient) -> Self {
        Self::with_options(config, client, EngineOptions::default())
    }

    pub fn with_options(config: Config, client: RuntimeClient, options: EngineOptions) -> Self {
        Self {
            config,
            client,
            request: InvocationRequest::default(),
            options,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Loops until a fatal outcome or an aborted invocation.
    pub fn run<P: Processor + ?Sized>(&mut self, processor: &mut P) -> EngineExit {
        info!(
            function = %self.config.function_name,
            version = %self.config.function_version,
            "Runtime engine started"
        );
        loop {
            if let Step::Exit(exit) = self.step(processor) {
                info!(reason = ?exit, "Runtime engine stopped");
                return exit;
            }
        }
    }

    /// Polls for one invocation and dispatches it.
    pub fn step<P: Processor + ?Sized>(&mut self, processor: &mut P) -> Step {
        let next = match self.client.poll_next() {
            Ok(NextOutcome::Accepted(next)) => next,
            Ok(NextOutcome::Forbidden(envelope)) => {
                warn!(
                    error_type = %envelope.error_type,
                    error_message = %envelope.error_message,
                    policy = ?self.options.forbidden_policy,
                    "Runtime API refused the next invocation"
                );
                return match self.options.forbidden_policy {
                    ForbiddenPolicy::Retry => Step::Continue,
                    ForbiddenPolicy::Terminate => Step::Exit(EngineExit::Forbidden(envelope)),
                };
            }
            Ok(NextOutcome::ContainerError) => {
                error!("Runtime API reported a container error");
                return Step::Exit(EngineExit::ContainerError);
            }
            Ok(NextOutcome::UnknownStatus(status)) => {
                error!(status, "Unexpected status from the next-invocation endpoint");
                return Step::Exit(EngineExit::UnknownStatus(status));
            }
            Err(ProtocolError::Transport(e)) => {
                error!(error = %e, "Failed to poll for the next invocation");
                return Step::Exit(EngineExit::Transport(e.to_string()));
            }
            Err(ProtocolError::Parse(e)) => {
                error!(error = %e, "Malformed next-invocation response");
                return Step::Exit(EngineExit::MalformedResponse(e.to_string()));
            }
        };

        self.request.apply_invocation(next.headers, next.payload);
        let flow = if self.request.has_request_id() {
            self.dispatch(processor)
        } else {
            error!("Invocation arrived without a request id; skipping");
            Flow::Continue
        };
        self.request.reset();

        match flow {
            Flow::Continue => Step::Continue,
            Flow::Abort => Step::Exit(EngineExit::Aborted),
        }
    }

    fn dispatch<P: Processor + ?Sized>(&mut self, processor: &mut P) -> Flow {
        let span = info_span!("invocation", request_id = %self.request.request_id);
        let _entered = span.enter();
        debug!(
            deadline_ms = self.request.deadline_ms,
            bytes = self.request.payload.len(),
            "Dispatching invocation"
        );

        let propagate = self.options.propagate_trace_id && !self.request.trace_id.is_empty();
        if propagate {
            std::env::set_var(TRACE_ID_ENV, &self.request.trace_id);
        }

        let mut invocation = Invocation::new(&self.config, &self.request, &mut self.client);
        let flow = processor.process(&mut invocation);
        let flow = invocation.finish(flow);

        if propagate {
            std::env::remove_var(TRACE_ID_ENV);
        }
        flow
    }
}

#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Configuration Error: {0}")]
    Config(#[from] FaasError),
    #[error("Failed to open Runtime API client: {0}")]
    Transport(#[from] TransportError),
    #[error("Function initialization failed: {0}")]
    Init(ErrorReport),
}

/// Startup sequence: load config, open the client, initialize the function,
/// then hand control to the engine.
///
/// A failing `init` is reported to the Runtime API as `Runtime.<Name>`
/// before returning; there is no invocation to serve at that point.
pub fn start<L, C, I, P>(
    lookup: L,
    connect: C,
    options: EngineOptions,
    init: I,
) -> Result<EngineExit, StartupError>
where
    L: Fn(&str) -> Option<String>,
    C: FnOnce(&str) -> Result<Box<dyn Transport>, TransportError>,
    I: FnOnce(&Config) -> Result<P, ErrorReport>,
    P: Processor,
{
    let config = load_config(lookup).map_err(|e| {
        error!(error = %e, "Failed to load runtime configuration");
        e
    })?;
    debug!(config = ?config, "Runtime configuration loaded");

    let transport = connect(&config.runtime_api).map_err(|e| {
        error!(error = %e, runtime_api = %config.runtime_api, "Failed to reach the Runtime API");
        e
    })?;
    let mut client = RuntimeClient::from_boxed(transport);

    let mut processor = match init(&config) {
        Ok(processor) => processor,
        Err(report) => {
            error!(
                error_type = %report.name,
                error = %report.message,
                "Function initialization failed"
            );
            report_init_failure(&mut client, &report);
            return Err(StartupError::Init(report));
        }
    };

    let mut engine = Engine::with_options(config, client, options);
    Ok(engine.run(&mut processor))
}

/// Best effort: the process is terminating whatever the outcome.
fn report_init_failure(client: &mut RuntimeClient, report: &ErrorReport) {
    match client.report_init_failure(report) {
        Ok(InitErrorOutcome::Accepted) => debug!("Init failure reported"),
        Ok(InitErrorOutcome::BadRequest(env)) | Ok(InitErrorOutcome::Forbidden(env)) => warn!(
            error_type = %env.error_type,
            error_message = %env.error_message,
            "Runtime API rejected the init failure report"
        ),
        Ok(outcome) => error!(outcome = ?outcome, "Init failure report hit a fatal outcome"),
        Err(e) => error!(error = %e, "Failed to report init failure"),
    }
}
