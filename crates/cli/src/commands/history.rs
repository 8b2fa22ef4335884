use crate::commands::CommandResult;
use banter_core::config::{AppConfig, LoadOptions};
use banter_core::domain::conversation::{ConversationId, Message};
use banter_db::{connect_with_settings, migrations, CheckpointRepository, SqlCheckpointRepository};

pub fn run(conversation: &str) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "history",
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
                "history",
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
        let state = repository
            .load(&ConversationId(conversation.to_string()))
            .await
            .map_err(|error| ("history_read", error.to_string(), 6u8))?;

        pool.close().await;
        Ok::<_, (&'static str, String, u8)>(state)
    });

    match result {
        Ok(Some(state)) => CommandResult::success("history", render(conversation, &state.messages)),
        Ok(None) => CommandResult::success(
            "history",
            format!("no stored messages for conversation `{conversation}`"),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("history", error_class, message, exit_code)
        }
    }
}

fn render(conversation: &str, messages: &[Message]) -> String {
    if messages.is_empty() {
        return format!("no stored messages for conversation `{conversation}`");
    }

    let mut lines =
        vec![format!("{} stored message(s) for conversation `{conversation}`:", messages.len())];
    for message in messages {
        lines.push(format!("  - [{}] {}", message.role.as_str(), describe(message)));
    }
    lines.join("\n")
}

fn describe(message: &Message) -> String {
    if message.content.is_empty() && !message.tool_calls.is_empty() {
        let names: Vec<&str> = message.tool_calls.iter().map(|call| call.name.as_str()).collect();
        return format!("(requested tools: {})", names.join(", "));
    }
    message.content.clone()
}
