use color_eyre::eyre;
use faas_runtime::EngineExit;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod echo;

fn main() -> eyre::Result<()> {
    // Local runs point AWS_LAMBDA_RUNTIME_API at an emulator through `.env`.
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting function runtime...");

    let exit = faas_runtime::run(echo::init)?;
    match exit {
        EngineExit::Aborted => error!("Instance is no longer safe to reuse; exiting"),
        ref other => error!(reason = ?other, "Runtime API loop ended"),
    }
    Err(eyre::eyre!("runtime stopped: {exit:?}"))
}
