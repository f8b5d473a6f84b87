//! Replay a recorded change log into a message window.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use tracing::{debug, warn};

use chatsync_core::MessageStore;
use chatsync_types::{ChangeEvent, ChangeOp, ChatId, Message, Reaction, Table};

/// One entry of a change log, as emitted by the change feed.
#[derive(Debug, Deserialize)]
struct LoggedChange {
    op: ChangeOp,
    table: Table,
    record: Value,
}

/// Counters for the replay summary.
#[derive(Debug, Default)]
struct ReplayStats {
    applied: usize,
    redundant: usize,
    skipped: usize,
}

/// Run the replay command.
pub async fn run(path: &Path, chat: Option<ChatId>, json: bool) -> Result<()> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let changes: Vec<LoggedChange> =
        serde_json::from_str(&content).context("Change log must be a JSON array of {op, table, record}")?;

    let chat_id = match chat.or_else(|| first_chat(&changes)) {
        Some(chat_id) => chat_id,
        None => bail!("No message in the log names a chat; pass --chat"),
    };

    let (store, stats) = replay(chat_id, changes);

    let messages: Vec<&Message> = store.messages().into_iter().map(|m| &m.message).collect();
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&messages).context("Failed to encode window")?
        );
        return Ok(());
    }

    println!("=== chat {} ===", chat_id);
    println!();
    for message in &messages {
        println!("{}", format_message(message));
    }
    println!();
    println!(
        "{} messages ({} changes applied, {} redundant, {} skipped)",
        messages.len(),
        stats.applied,
        stats.redundant,
        stats.skipped
    );

    Ok(())
}

/// Chat of the first decodable message record.
fn first_chat(changes: &[LoggedChange]) -> Option<ChatId> {
    changes
        .iter()
        .filter(|c| c.table == Table::Messages && c.op != ChangeOp::Delete)
        .find_map(|c| c.record.get("chat_id"))
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
}

fn replay(chat_id: ChatId, changes: Vec<LoggedChange>) -> (MessageStore, ReplayStats) {
    let mut store = MessageStore::new(chat_id);
    let mut stats = ReplayStats::default();

    for (index, change) in changes.into_iter().enumerate() {
        let changed = match change.table {
            Table::Messages => match ChangeEvent::<Message>::decode(change.op, &change.record) {
                Ok(event) => store.apply_event(event),
                Err(e) => {
                    warn!(index, error = %e, "Skipping change");
                    stats.skipped += 1;
                    continue;
                }
            },
            Table::MessageReactions => {
                match ChangeEvent::<Reaction>::decode(change.op, &change.record) {
                    Ok(event) => store.apply_reaction(event),
                    Err(e) => {
                        warn!(index, error = %e, "Skipping change");
                        stats.skipped += 1;
                        continue;
                    }
                }
            }
            other => {
                debug!(index, table = %other, "Ignoring change outside the message window");
                stats.skipped += 1;
                continue;
            }
        };

        if changed {
            stats.applied += 1;
        } else {
            stats.redundant += 1;
        }
    }

    (store, stats)
}

fn format_message(message: &Message) -> String {
    let mut line = format!(
        "{}  {}  {}",
        message.created_at.format("%Y-%m-%d %H:%M:%S"),
        &message.user_id.to_string()[..8],
        message.content
    );
    if let Some(url) = &message.file_url {
        line.push_str(&format!(" [file: {}]", url));
    }
    for reaction in message.visible_reactions() {
        line.push_str(&format!(" {}", reaction.emoji));
    }
    if !message.read_by.is_empty() {
        line.push_str(&format!(" (read by {})", message.read_by.len()));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatsync_types::{MessageId, UserId};
    use serde_json::json;

    fn change(op: &str, table: &str, record: Value) -> LoggedChange {
        serde_json::from_value(json!({ "op": op, "table": table, "record": record })).unwrap()
    }

    fn message(id: MessageId, chat: ChatId, content: &str, at: &str) -> Value {
        json!({
            "id": id,
            "chat_id": chat,
            "user_id": UserId::new(),
            "content": content,
            "created_at": at,
        })
    }

    #[test]
    fn replay_orders_and_dedups() {
        let chat = ChatId::new();
        let (a, b) = (MessageId::new(), MessageId::new());
        let late = message(b, chat, "second", "2024-01-01T00:00:02Z");
        let changes = vec![
            change("INSERT", "messages", late.clone()),
            change("INSERT", "messages", message(a, chat, "first", "2024-01-01T00:00:01Z")),
            change("INSERT", "messages", late),
        ];

        let (store, stats) = replay(chat, changes);

        let contents: Vec<&str> = store
            .messages()
            .iter()
            .map(|m| m.message.content.as_str())
            .collect();
        assert_eq!(contents, vec!["first", "second"]);
        assert_eq!(stats.applied, 2);
        assert_eq!(stats.redundant, 1);
    }

    #[test]
    fn replay_skips_other_tables_and_bad_records() {
        let chat = ChatId::new();
        let changes = vec![
            change("INSERT", "chats", json!({ "id": chat })),
            change("INSERT", "messages", json!({ "content": "no ids" })),
        ];

        let (store, stats) = replay(chat, changes);
        assert!(store.is_empty());
        assert_eq!(stats.skipped, 2);
    }

    #[test]
    fn first_chat_comes_from_message_records() {
        let chat = ChatId::new();
        let changes = vec![
            change("DELETE", "messages", json!({ "id": MessageId::new() })),
            change("INSERT", "messages", message(MessageId::new(), chat, "x", "2024-01-01T00:00:00Z")),
        ];
        assert_eq!(first_chat(&changes), Some(chat));
    }
}
