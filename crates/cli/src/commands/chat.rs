use std::io::Write;
use std::sync::Arc;

use crate::commands::CommandResult;
use banter_agent::runtime::{AgentRuntime, TurnError, TurnEvent};
use banter_core::config::{AppConfig, LoadOptions};
use banter_core::domain::conversation::{ConversationId, UserId};
use banter_db::{connect_with_settings, migrations};

pub fn run(message: &str, conversation: &str, user: &str, stream: bool) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "chat",
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
                "chat",
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

        let agent = Arc::new(
            AgentRuntime::from_config(&config, pool.clone())
                .map_err(|error| ("agent_init", error.to_string(), 6u8))?,
        );
        let conversation_id = ConversationId(conversation.to_string());
        let user_id = UserId(user.to_string());

        let reply = if stream {
            run_streaming(&agent, &conversation_id, &user_id, message).await?
        } else {
            agent
                .handle_message(&conversation_id, &user_id, message)
                .await
                .map(|message| message.content)
                .map_err(classify_turn_error)?
        };

        pool.close().await;
        Ok::<String, (&'static str, String, u8)>(reply)
    });

    match result {
        Ok(reply) => CommandResult::success("chat", reply),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("chat", error_class, message, exit_code)
        }
    }
}

/// Prints tokens to stdout as they arrive. The returned string is the status
/// line for the command envelope, not the reply itself.
async fn run_streaming(
    agent: &Arc<AgentRuntime>,
    conversation_id: &ConversationId,
    user_id: &UserId,
    message: &str,
) -> Result<String, (&'static str, String, u8)> {
    let mut events = Arc::clone(agent)
        .handle_message_stream(conversation_id, user_id, message)
        .await
        .map_err(classify_turn_error)?;

    let mut printed_any = false;
    loop {
        match events.recv().await {
            Some(TurnEvent::Token(token)) => {
                print!("{token}");
                let _ = std::io::stdout().flush();
                printed_any = true;
            }
            Some(TurnEvent::Completed(_)) => {
                if printed_any {
                    println!();
                }
                return Ok(format!(
                    "streamed reply stored for conversation `{}`",
                    conversation_id.0
                ));
            }
            Some(TurnEvent::Failed { message }) => {
                if printed_any {
                    println!();
                }
                return Err(("turn_failed", message, 8));
            }
            None => {
                if printed_any {
                    println!();
                }
                return Err((
                    "turn_failed",
                    "event stream ended before the reply was finalized".to_string(),
                    8,
                ));
            }
        }
    }
}

fn classify_turn_error(error: TurnError) -> (&'static str, String, u8) {
    match &error {
        TurnError::Exhausted(_) | TurnError::Fatal { .. } => {
            ("provider_unavailable", error.to_string(), 7)
        }
        _ => ("turn_failed", error.to_string(), 8),
    }
}
