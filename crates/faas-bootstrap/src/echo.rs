use faas_common::Config;
use faas_runtime::{
    json_handler, streaming_fn, Context, ErrorReport, Processor, ResponseStream,
};
use serde_json::Value;
use tracing::info;

/// Handler suffix selecting the streaming echo.
const STREAM_SUFFIX: &str = ".stream";

pub fn is_streaming(handler: &str) -> bool {
    handler.ends_with(STREAM_SUFFIX)
}

/// Picks the echo flavor from `_HANDLER`.
pub fn init(config: &Config) -> Result<Box<dyn Processor>, ErrorReport> {
    if is_streaming(&config.handler) {
        info!(handler = %config.handler, "Serving streaming echo");
        Ok(Box::new(streaming_fn(stream_lines)))
    } else {
        info!(handler = %config.handler, "Serving JSON echo");
        Ok(Box::new(json_handler(|_ctx: Context<'_>, payload: Value| {
            Ok::<_, ErrorReport>(payload)
        })))
    }
}

/// Streams the payload back, one chunk per line.
fn stream_lines(
    _ctx: Context<'_>,
    payload: &[u8],
    stream: &mut dyn ResponseStream,
) -> Result<(), ErrorReport> {
    stream.open("text/plain")?;
    for line in payload.split_inclusive(|b| *b == b'\n') {
        stream.publish(line)?;
    }
    Ok(stream.close()?)
}
