use std::sync::Arc;
use std::time::Duration;

use crate::commands::{self, CommandError, CommandResult, EXIT_DB, EXIT_MIGRATION, EXIT_SWEEP};
use greenlight_core::audit::TracingAuditSink;
use greenlight_core::config::{AppConfig, LogFormat};
use greenlight_core::engine::{ApprovalEngine, EngineOptions};
use greenlight_core::notify::TracingNotificationSink;
use greenlight_core::scheduler::TimeoutScheduler;
use greenlight_db::{connect_with_settings, migrations, SqlStore};

pub fn run(watch: bool) -> CommandResult {
    let config = match commands::load_config("sweep") {
        Ok(config) => config,
        Err(result) => return result,
    };
    init_logging(&config);

    let runtime = match commands::build_runtime("sweep") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| CommandError::new("db_connectivity", error.to_string(), EXIT_DB))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| CommandError::new("migration", error.to_string(), EXIT_MIGRATION))?;

        let store = Arc::new(SqlStore::new(pool.clone()));
        let engine = Arc::new(ApprovalEngine::new(
            store,
            TracingNotificationSink,
            TracingAuditSink,
            EngineOptions {
                system_actor: config.engine.system_actor.clone(),
                quorum_counting: config.engine.quorum_counting,
            },
        ));
        let scheduler = TimeoutScheduler::new(engine);

        let message = if watch {
            let period = Duration::from_secs(config.scheduler.interval_secs);
            tokio::select! {
                _ = scheduler.run(period) => String::new(),
                _ = tokio::signal::ctrl_c() => "sweep loop interrupted, shutting down".to_string(),
            }
        } else {
            let report = scheduler
                .scan_and_dispatch()
                .await
                .map_err(|error| CommandError::new("sweep", error.to_string(), EXIT_SWEEP))?;
            format!(
                "scanned {} pending, dispatched {} timeouts, {} failures",
                report.scanned, report.dispatched, report.failures
            )
        };

        pool.close().await;
        Ok::<String, CommandError>(message)
    });

    match result {
        Ok(message) => CommandResult::success("sweep", message),
        Err(error) => CommandResult::failure("sweep", error),
    }
}

fn init_logging(config: &AppConfig) {
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    let builder = tracing_subscriber::fmt().with_target(false).with_max_level(log_level);
    // try_init so repeated invocations inside one process (tests) stay quiet.
    let _ = match config.logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}
