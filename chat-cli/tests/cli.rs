//! Command-line behaviour of the chatsync binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn chatsync() -> Command {
    Command::cargo_bin("chatsync").unwrap()
}

const CHAT: &str = "6f1c2a3e-0000-4000-8000-000000000001";
const USER: &str = "7a2b3c4d-0000-4000-8000-000000000002";

fn change_log() -> tempfile::NamedTempFile {
    let log = format!(
        r#"[
  {{ "op": "INSERT", "table": "messages", "record": {{
      "id": "00000000-0000-4000-8000-0000000000b2", "chat_id": "{chat}", "user_id": "{user}",
      "content": "second", "created_at": "2024-01-01T00:00:02Z" }} }},
  {{ "op": "INSERT", "table": "messages", "record": {{
      "id": "00000000-0000-4000-8000-0000000000a1", "chat_id": "{chat}", "user_id": "{user}",
      "content": "first", "created_at": "2024-01-01T00:00:01Z" }} }},
  {{ "op": "INSERT", "table": "message_reactions", "record": {{
      "id": "00000000-0000-4000-8000-0000000000c3", "message_id": "00000000-0000-4000-8000-0000000000a1",
      "user_id": "{user}", "emoji": "+1" }} }}
]"#,
        chat = CHAT,
        user = USER
    );
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(log.as_bytes()).unwrap();
    file
}

#[test]
fn replay_prints_ordered_window() {
    let log = change_log();

    chatsync()
        .arg("replay")
        .arg("--events")
        .arg(log.path())
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("=== chat {} ===", CHAT)))
        .stdout(predicate::str::is_match("(?s)first \\+1.*second").unwrap())
        .stdout(predicate::str::contains("2 messages (3 changes applied"));
}

#[test]
fn replay_json_output() {
    let log = change_log();

    chatsync()
        .args(["replay", "--json", "--events"])
        .arg(log.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("\"content\": \"first\""));
}

#[test]
fn replay_of_other_chat_is_empty() {
    let log = change_log();

    chatsync()
        .arg("replay")
        .arg("--events")
        .arg(log.path())
        .args(["--chat", "11111111-0000-4000-8000-000000000000"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 messages"));
}

#[test]
fn replay_rejects_non_array() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "{{\"op\": \"INSERT\"}}").unwrap();

    chatsync()
        .args(["replay", "--events"])
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("JSON array"));
}

#[test]
fn check_config_accepts_valid_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[storage]\nbucket = \"attachments\"").unwrap();

    chatsync()
        .arg("check-config")
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Bucket:   attachments"))
        .stdout(predicate::str::contains("OK"));
}

#[test]
fn check_config_rejects_invalid_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[typing]\nwindow_ms = 0").unwrap();

    chatsync()
        .arg("check-config")
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("typing.window_ms"));
}

#[test]
fn demo_runs_a_session() {
    chatsync()
        .arg("demo")
        .assert()
        .success()
        .stdout(predicate::str::contains("* bob"))
        .stdout(predicate::str::contains("ann: hi bob"))
        .stdout(predicate::str::contains("bob: hey!"));
}
