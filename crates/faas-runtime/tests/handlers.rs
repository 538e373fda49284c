//! Handler adapters driven through the engine.

use faas_common::config::RUNTIME_API_KEY;
use faas_common::events::{HttpResponsePrelude, HTTP_INTEGRATION_CONTENT_TYPE};
use faas_common::load_config;
use faas_runtime::protocol::{parse_envelope, ERROR_TYPE_HEADER};
use faas_runtime::testing::MockTransport;
use faas_runtime::*;
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
struct Greeting {
    name: String,
}

#[derive(Serialize)]
struct Reply {
    message: String,
}

fn engine(mock: &MockTransport) -> Engine {
    let config =
        load_config(|key| (key == RUNTIME_API_KEY).then(|| "127.0.0.1:9001".to_string())).unwrap();
    Engine::with_options(
        config,
        RuntimeClient::new(mock.clone()),
        EngineOptions {
            propagate_trace_id: false,
            ..Default::default()
        },
    )
}

fn greeter() -> impl Processor {
    json_handler(|_ctx: Context<'_>, input: Greeting| {
        if input.name.is_empty() {
            return Err(ErrorReport::new("EmptyName", "name must not be empty"));
        }
        Ok(Reply {
            message: format!("hello {}", input.name),
        })
    })
}

#[test]
fn test_json_handler_round_trips_payload() {
    let mock = MockTransport::new();
    mock.push_next_invocation("abc", "0", r#"{"name":"ferris"}"#);
    mock.push_accepted();
    let mut processor = greeter();

    assert_eq!(engine(&mock).step(&mut processor), Step::Continue);
    let sent = &mock.requests()[1];
    assert_eq!(sent.path, "/2018-06-01/runtime/invocation/abc/response");
    assert_eq!(sent.body, br#"{"message":"hello ferris"}"#.to_vec());
}

#[test]
fn test_json_handler_rejects_undecodable_payload() {
    let mock = MockTransport::new();
    mock.push_next_invocation("abc", "0", "not json");
    mock.push_accepted();
    let mut processor = greeter();

    assert_eq!(engine(&mock).step(&mut processor), Step::Continue);
    let sent = &mock.requests()[1];
    assert_eq!(sent.path, "/2018-06-01/runtime/invocation/abc/error");
    assert_eq!(sent.header(ERROR_TYPE_HEADER), Some("InvalidPayload"));
    let envelope = parse_envelope(&sent.body).unwrap();
    assert_eq!(envelope.error_type, "Handler.InvalidPayload");
}

#[test]
fn test_handler_error_is_reported_with_handler_prefix() {
    let mock = MockTransport::new();
    mock.push_next_invocation("abc", "0", r#"{"name":""}"#);
    mock.push_accepted();
    let mut processor = greeter();

    assert_eq!(engine(&mock).step(&mut processor), Step::Continue);
    let body: serde_json::Value = serde_json::from_slice(&mock.requests()[1].body).unwrap();
    assert_eq!(
        body,
        serde_json::json!({
            "errorType": "Handler.EmptyName",
            "errorMessage": "name must not be empty",
            "stackTrace": []
        })
    );
}

#[test]
fn test_std_errors_convert_with_short_type_name() {
    let mock = MockTransport::new();
    mock.push_next_invocation("abc", "0", "{}");
    mock.push_accepted();
    let mut processor = handler_fn(|_ctx: Context<'_>, _payload: &[u8]| {
        let parsed: u32 = "nope".parse()?;
        Ok(parsed.to_string().into_bytes())
    });

    assert_eq!(engine(&mock).step(&mut processor), Step::Continue);
    let envelope = parse_envelope(&mock.requests()[1].body).unwrap();
    assert_eq!(envelope.error_type, "Handler.ParseIntError");
}

#[test]
fn test_panicking_handler_is_reported_and_loop_survives() {
    let mock = MockTransport::new();
    mock.push_next_invocation("abc", "0", "{}");
    mock.push_accepted();
    mock.push_next_invocation("def", "0", "{}");
    mock.push_accepted();
    mock.push_response(500, "");
    let mut processor = handler_fn(|ctx: Context<'_>, _payload: &[u8]| {
        if ctx.request_id() == "abc" {
            panic!("handler blew up");
        }
        Ok(b"fine".to_vec())
    });

    assert_eq!(
        engine(&mock).run(&mut processor),
        EngineExit::ContainerError
    );
    let sent = mock.requests();
    let envelope = parse_envelope(&sent[1].body).unwrap();
    assert_eq!(envelope.error_type, "Handler.Panic");
    assert_eq!(envelope.error_message, "handler blew up");
    assert_eq!(sent[3].path, "/2018-06-01/runtime/invocation/def/response");
    assert_eq!(sent[3].body, b"fine".to_vec());
}

#[test]
fn test_streaming_handler_sends_prelude_then_chunks() {
    let mock = MockTransport::new();
    mock.push_next_invocation("abc", "0", "{}");
    mock.push_accepted();
    let mut processor = streaming_fn(
        |_ctx: Context<'_>, _payload: &[u8], stream: &mut dyn ResponseStream| {
            let prelude = HttpResponsePrelude::new(201)
                .with_header("content-type", "text/plain")
                .to_prelude()?;
            stream.open_with_prelude(HTTP_INTEGRATION_CONTENT_TYPE, Some(prelude.as_slice()))?;
            stream.publish(b"one")?;
            stream.publish(b"two")?;
            Ok(stream.close()?)
        },
    );

    assert_eq!(engine(&mock).step(&mut processor), Step::Continue);
    let streamed = &mock.requests()[1];
    assert_eq!(streamed.header("content-type"), Some(HTTP_INTEGRATION_CONTENT_TYPE));
    assert_eq!(streamed.chunks.len(), 3);
    let (json, separator) = streamed.chunks[0].split_at(streamed.chunks[0].len() - 8);
    assert_eq!(separator, &[0u8; 8]);
    let prelude: serde_json::Value = serde_json::from_slice(json).unwrap();
    assert_eq!(prelude["statusCode"], 201);
    assert_eq!(streamed.chunks[1..], [b"one".to_vec(), b"two".to_vec()]);
    assert!(streamed.finished);
    assert!(streamed.trailers.is_none());
}

#[test]
fn test_streaming_error_after_open_goes_to_trailers() {
    let mock = MockTransport::new();
    mock.push_next_invocation("abc", "0", "{}");
    mock.push_accepted();
    let mut processor = streaming_fn(
        |_ctx: Context<'_>, _payload: &[u8], stream: &mut dyn ResponseStream| {
            stream.open("text/plain")?;
            stream.publish(b"partial")?;
            Err(ErrorReport::new("Boom", "kaboom"))
        },
    );

    assert_eq!(engine(&mock).step(&mut processor), Step::Continue);
    let sent = mock.requests();
    assert_eq!(sent.len(), 2);
    let trailers = sent[1].trailers.as_ref().unwrap();
    assert_eq!(trailers.get(ERROR_TYPE_HEADER).unwrap(), "Boom");
}

#[test]
fn test_streaming_error_before_open_uses_error_endpoint() {
    let mock = MockTransport::new();
    mock.push_next_invocation("abc", "0", "{}");
    mock.push_accepted();
    let mut processor = streaming_fn(
        |_ctx: Context<'_>, _payload: &[u8], _stream: &mut dyn ResponseStream| {
            Err(ErrorReport::new("NotReady", "cache cold"))
        },
    );

    assert_eq!(engine(&mock).step(&mut processor), Step::Continue);
    let sent = &mock.requests()[1];
    assert_eq!(sent.path, "/2018-06-01/runtime/invocation/abc/error");
    assert_eq!(parse_envelope(&sent.body).unwrap().error_type, "Handler.NotReady");
}

#[test]
fn test_streaming_handler_that_never_opens_gets_no_response_error() {
    let mock = MockTransport::new();
    mock.push_next_invocation("abc", "0", "{}");
    mock.push_accepted();
    let mut processor = streaming_fn(
        |_ctx: Context<'_>, _payload: &[u8], _stream: &mut dyn ResponseStream| Ok(()),
    );

    assert_eq!(engine(&mock).step(&mut processor), Step::Continue);
    let envelope = parse_envelope(&mock.requests()[1].body).unwrap();
    assert_eq!(envelope.error_type, "Handler.NoResponse");
}

#[test]
fn test_streaming_transport_failure_aborts() {
    let mock = MockTransport::new();
    mock.push_next_invocation("abc", "0", "{}");
    mock.fail_next_open();
    let mut processor = streaming_fn(
        |_ctx: Context<'_>, _payload: &[u8], stream: &mut dyn ResponseStream| {
            Ok(stream.open("text/plain")?)
        },
    );

    assert_eq!(
        engine(&mock).step(&mut processor),
        Step::Exit(EngineExit::Aborted)
    );
}
