use crate::commands::{self, CommandError, CommandResult, EXIT_DB, EXIT_MIGRATION};
use greenlight_db::{connect_with_settings, migrations};

pub fn run() -> CommandResult {
    let config = match commands::load_config("migrate") {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match commands::build_runtime("migrate") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let applied = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| CommandError::new("db_connectivity", error.to_string(), EXIT_DB))?;

        let outcome = migrations::run_pending(&pool)
            .await
            .map_err(|error| CommandError::new("migration", error.to_string(), EXIT_MIGRATION));
        pool.close().await;
        outcome.map(|()| migrations::available())
    });

    match applied {
        Ok(count) => CommandResult::success(
            "migrate",
            format!("schema is current at migration {count} on `{}`", config.database.url),
        ),
        Err(error) => CommandResult::failure("migrate", error),
    }
}
