use botqueue::queue::processor::{boxed, parse_payload};
use botqueue::queue::{Outcome, Priority, ProcessorOptions, ProcessorRegistry};
use serde::Deserialize;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tracing::info;

#[derive(Deserialize)]
struct ChatMessagePayload {
    text: String,
}

#[derive(Deserialize)]
struct NotificationPayload {
    text: String,
    #[serde(default)]
    silent: bool,
}

#[derive(Deserialize)]
struct SkillCallPayload {
    skill: String,
    #[serde(default)]
    args: serde_json::Value,
    /// Post the result back to the channel as a notification.
    #[serde(default)]
    notify: bool,
}

pub fn build_registry(default_timeout: Duration) -> Arc<ProcessorRegistry> {
    let mut registry = ProcessorRegistry::new().with_default_timeout(default_timeout);

    // Demo processors. Replace these with the bot's real integrations.
    registry.register("chat_message", |payload, ctx| {
        boxed(async move {
            let msg: ChatMessagePayload = match parse_payload(payload) {
                Ok(msg) => msg,
                Err(outcome) => return outcome,
            };
            if msg.text.trim().is_empty() {
                return Outcome::fatal("empty chat message");
            }
            info!(
                item_id = %ctx.item_id,
                user_id = ctx.user_id.as_deref().unwrap_or("-"),
                channel_id = ctx.channel_id.as_deref().unwrap_or("-"),
                chars = msg.text.chars().count(),
                "chat message handled"
            );
            Outcome::Success
        })
    });

    registry.register_with_options(
        "notification",
        |payload, ctx| {
            boxed(async move {
                let note: NotificationPayload = match parse_payload(payload) {
                    Ok(note) => note,
                    Err(outcome) => return outcome,
                };
                if ctx.channel_id.is_none() {
                    return Outcome::fatal("notification without a channel");
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
                info!(
                    item_id = %ctx.item_id,
                    silent = note.silent,
                    chars = note.text.len(),
                    "notification delivered"
                );
                Outcome::Success
            })
        },
        ProcessorOptions::new()
            .max_concurrency(16)
            .timeout(Duration::from_secs(10)),
    );

    registry.register_with_options(
        "skill_call",
        |payload, ctx| {
            boxed(async move {
                let call: SkillCallPayload = match parse_payload(payload) {
                    Ok(call) => call,
                    Err(outcome) => return outcome,
                };
                let result = match call.skill.as_str() {
                    "echo" => call.args.clone(),
                    "time" => json!({"unix": unix_now()}),
                    other => return Outcome::fatal(format!("unknown skill {other}")),
                };

                if call.notify {
                    let note = json!({"text": format!("{}: {}", call.skill, result)});
                    if let Err(e) = ctx
                        .spawn_child("notification", Priority::NORMAL, note)
                        .await
                    {
                        return Outcome::recoverable(format!("could not queue notification: {e}"));
                    }
                }
                Outcome::Success
            })
        },
        ProcessorOptions::new().timeout(Duration::from_secs(30)),
    );

    Arc::new(registry)
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
