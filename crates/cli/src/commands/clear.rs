use crate::commands::CommandResult;
use banter_core::config::{AppConfig, LoadOptions};
use banter_core::domain::conversation::ConversationId;
use banter_db::{connect_with_settings, migrations, CheckpointRepository, SqlCheckpointRepository};

pub fn run(conversation: &str) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "clear",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "clear",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let repository = SqlCheckpointRepository::new(pool.clone());
        repository
            .clear(&ConversationId(conversation.to_string()))
            .await
            .map_err(|error| ("history_clear", error.to_string(), 6u8))?;

        pool.close().await;
        Ok::<(), (&'static str, String, u8)>(())
    });

    match result {
        Ok(()) => CommandResult::success(
            "clear",
            format!("cleared stored history for conversation `{conversation}`"),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("clear", error_class, message, exit_code)
        }
    }
}
