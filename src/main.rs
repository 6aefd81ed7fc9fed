use std::process;

use optimist::{config, demo, error::AppError, infra::telemetry};
use serde_json::json;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Demo(config::DemoArgs::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Demo(args) => {
            info!(
                scenario = %args.scenario,
                latency_ms = settings.demo.latency.as_millis() as u64,
                "Replaying scenario"
            );
            let reports = demo::run(args.scenario, &settings).await?;
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
        config::Command::CheckConfig(_) => {
            let resolved = json!({
                "logging": {
                    "level": settings.logging.level.to_string(),
                    "format": format!("{:?}", settings.logging.format),
                },
                "cache": {
                    "stale_time_seconds": settings.cache.stale_time.as_secs(),
                    "refetch_queue_limit": settings.cache.refetch_queue_limit.get(),
                    "refetch_batch_limit": settings.cache.refetch_batch_limit.get(),
                    "refetch_active_on_invalidate": settings.cache.refetch_active_on_invalidate,
                },
                "retry": {
                    "mutation_max_retries": settings.retry.mutation_max_retries,
                    "query_max_retries": settings.retry.query_max_retries,
                    "base_delay_ms": settings.retry.base_delay.as_millis() as u64,
                    "max_delay_ms": settings.retry.max_delay.as_millis() as u64,
                },
                "demo": {
                    "latency_ms": settings.demo.latency.as_millis() as u64,
                },
            });
            println!("{}", serde_json::to_string_pretty(&resolved)?);
        }
    }

    Ok(())
}
