//! Scripted session against the in-memory collaborator.

use anyhow::{Context, Result};
use chrono::{TimeDelta, Utc};
use serde_json::json;
use std::path::Path;
use std::time::Duration;

use chatsync_client::{
    Collaborators, DeliveryStatus, EngineConfig, EngineSnapshot, MockBackend, SyncEngine,
};
use chatsync_types::{ChatId, MessageId, Table, UserId};

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Run the demo command.
pub async fn run(config: Option<&Path>) -> Result<()> {
    let config = match config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?,
        None => EngineConfig::default(),
    };

    let mock = MockBackend::new();
    let ann = UserId::new();
    let bob = UserId::new();
    for (id, name) in [(ann, "ann"), (bob, "bob")] {
        mock.seed(
            Table::Profiles,
            json!({ "id": id, "username": name, "created_at": Utc::now() }),
        );
    }
    let chat = ChatId::new();
    mock.seed(
        Table::Chats,
        json!({
            "id": chat,
            "created_at": Utc::now(),
            "is_group": false,
            "participants": [ann, bob],
        }),
    );
    mock.seed(
        Table::Messages,
        json!({
            "id": MessageId::new(),
            "chat_id": chat,
            "user_id": bob,
            "content": "are you there?",
            "created_at": Utc::now() - TimeDelta::minutes(1),
        }),
    );

    let engine = SyncEngine::new(Collaborators::single(mock.clone()), config);
    let mut events = engine.events();

    engine.attach_session();
    mock.set_user(Some(ann));
    wait_for(&engine, |s| s.user_id == Some(ann) && !s.chats.is_empty())
        .await
        .context("Session did not start")?;

    engine.select_chat(chat).await.context("Failed to open chat")?;
    engine.send_message("hi bob").await.context("Failed to send")?;
    mock.remote_insert(
        Table::Messages,
        json!({
            "id": MessageId::new(),
            "chat_id": chat,
            "user_id": bob,
            "content": "hey!",
            "created_at": Utc::now(),
        }),
    );
    let snapshot = wait_for(&engine, |s| s.messages.len() == 3)
        .await
        .context("Remote message never arrived")?;

    print_snapshot(&snapshot);

    println!();
    println!("Events:");
    while let Ok(event) = events.try_recv() {
        println!("  {:?}", event);
    }

    engine.shutdown().await;
    Ok(())
}

async fn wait_for(
    engine: &SyncEngine,
    pred: impl Fn(&EngineSnapshot) -> bool,
) -> Result<EngineSnapshot> {
    let mut rx = engine.subscribe();
    let snapshot = tokio::time::timeout(STEP_TIMEOUT, async {
        loop {
            let snapshot = rx.borrow_and_update().clone();
            if pred(&snapshot) {
                return Ok::<_, tokio::sync::watch::error::RecvError>(snapshot);
            }
            rx.changed().await?;
        }
    })
    .await
    .context("Timed out")?;
    snapshot.context("Engine stopped")
}

fn print_snapshot(snapshot: &EngineSnapshot) {
    println!("=== chatsync demo ===");
    println!();
    println!("Chats:");
    for view in &snapshot.chats {
        let marker = if Some(view.chat.id) == snapshot.selected_chat {
            "*"
        } else {
            " "
        };
        println!("  {} {}", marker, view.display_name);
    }
    println!();
    println!("Messages ({:?}):", snapshot.selection);
    for stored in &snapshot.messages {
        let status = match &stored.status {
            DeliveryStatus::Confirmed => String::new(),
            DeliveryStatus::Pending => " (sending)".to_string(),
            DeliveryStatus::Failed { reason } => format!(" (failed: {})", reason),
        };
        println!(
            "  {}: {}{}",
            snapshot.username(&stored.message.user_id),
            stored.message.content,
            status
        );
    }
}
