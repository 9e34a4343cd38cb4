use anyhow::Error;
use envconfig::Envconfig;
use mixpanel_import::{
    config::Config,
    error::{get_user_message, with_user_message},
    job::{ImportJob, ImportSummary},
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let log_layer: tracing_subscriber::filter::Filtered<
        tracing_subscriber::fmt::Layer<tracing_subscriber::Registry>,
        EnvFilter,
        tracing_subscriber::Registry,
    > = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

async fn import(config: &Config) -> Result<ImportSummary, Error> {
    let ingestion_config = with_user_message(config.ingestion_config())?;
    let sink = config.sink_config()?.construct().await?;

    ImportJob::new(ingestion_config, sink)
        .with_batch_size(config.batch_size)
        .run()
        .await
}

#[tokio::main]
pub async fn main() -> Result<(), Error> {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_from_env()?;

    match import(&config).await {
        Ok(summary) => {
            info!(
                "Imported {} records from {} lines",
                summary.records_emitted, summary.lines_read
            );
        }
        Err(e) => {
            // A developer can tag an error with a user facing message, which we surface here
            error!("Import failed: {}. Cause: {:?}", get_user_message(&e), e);
            return Err(e);
        }
    }

    info!("Shutting down");

    Ok(())
}
