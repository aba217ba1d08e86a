use vocario_core::config::{AppConfig, LoadOptions};
use vocario_db::{connect_with_settings, migrations};

use crate::commands::{runtime, CommandResult, EXIT_DATABASE, EXIT_MIGRATION};

pub fn run() -> CommandResult {
    run_with(LoadOptions::default())
}

pub fn run_with(options: LoadOptions) -> CommandResult {
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => return CommandResult::config_failure("migrate", error),
    };
    let runtime = match runtime() {
        Ok(runtime) => runtime,
        Err(error) => return CommandResult::runtime_failure("migrate", error),
    };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), EXIT_DATABASE))?;

        let applied = async {
            migrations::run_pending(&pool).await.map_err(|error| error.to_string())?;
            migrations::applied_count(&pool).await.map_err(|error| error.to_string())
        }
        .await;
        pool.close().await;
        applied.map_err(|message| ("migration", message, EXIT_MIGRATION))
    });

    match result {
        Ok(applied) => CommandResult::success(
            "migrate",
            format!("session schema up to date ({applied} migration(s) applied)"),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("migrate", error_class, message, exit_code)
        }
    }
}
