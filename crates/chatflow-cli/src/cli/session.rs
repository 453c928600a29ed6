//! Session browsing commands: list, show, delete.

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use chatflow_core::chat::repository::SessionPersistence;
use chatflow_types::message::{Message, Role};

use super::truncate_chars;
use crate::state::AppState;

/// List saved sessions with title, id, and last modification time.
///
/// # Examples
///
/// ```bash
/// chatflow sessions list
/// chatflow sessions list --json
/// ```
pub async fn list_sessions(state: &AppState, json: bool) -> Result<()> {
    let sessions = state
        .store
        .list()
        .await
        .context("Failed to list sessions")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }

    if sessions.is_empty() {
        println!();
        println!(
            "  {} No sessions found in {}",
            style("i").blue().bold(),
            style(state.store.dir().display()).yellow()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Title").fg(Color::White),
        Cell::new("Chat ID").fg(Color::White),
        Cell::new("Modified").fg(Color::White),
    ]);

    for session in &sessions {
        let title = session.title.as_deref().unwrap_or("(untitled)");
        let modified = session
            .modified
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M")
            .to_string();
        table.add_row(vec![
            Cell::new(truncate_chars(title, 40)).fg(Color::Cyan),
            Cell::new(&session.chat_id).fg(Color::DarkGrey),
            Cell::new(modified).fg(Color::White),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    println!(
        "  {} session{}",
        style(sessions.len()).bold(),
        if sessions.len() == 1 { "" } else { "s" }
    );
    println!();
    Ok(())
}

/// Print every message of a session.
pub async fn show_session(state: &AppState, chat_id: &str, json: bool) -> Result<()> {
    let snapshot = state
        .store
        .load(chat_id)
        .await
        .with_context(|| format!("Session '{chat_id}' could not be loaded"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot.messages)?);
        return Ok(());
    }

    let title = snapshot.title.as_deref().unwrap_or("Untitled session");
    println!();
    println!("  {}", style(title).cyan().bold());
    println!("  {}", style(&snapshot.chat_id).dim());
    println!();

    for message in &snapshot.messages {
        println!("  {}", role_label(message));
        let text = message.text();
        if !text.is_empty() {
            for line in text.lines() {
                println!("    {line}");
            }
        }
        for call in message.tool_calls() {
            println!(
                "    {} {}({})",
                style("->").yellow(),
                style(call.name()).yellow(),
                truncate_chars(&call.function.arguments, 60)
            );
        }
        println!();
    }
    Ok(())
}

/// Delete a saved session.
pub async fn delete_session(state: &AppState, chat_id: &str, json: bool) -> Result<()> {
    state
        .store
        .delete(chat_id)
        .await
        .with_context(|| format!("Session '{chat_id}' could not be deleted"))?;

    if json {
        println!("{}", serde_json::json!({ "deleted": chat_id }));
    } else {
        println!(
            "  {} Deleted session {}",
            style("✓").green().bold(),
            style(chat_id).cyan()
        );
    }
    Ok(())
}

fn role_label(message: &Message) -> String {
    let time = message
        .info
        .time
        .map(|t| t.with_timezone(&chrono::Local).format(" %H:%M").to_string())
        .unwrap_or_default();
    match message.role() {
        Role::System => format!("{}{}", style("System").magenta().bold(), style(time).dim()),
        Role::User => format!("{}{}", style("User").green().bold(), style(time).dim()),
        Role::Assistant => format!("{}{}", style("Assistant").blue().bold(), style(time).dim()),
        Role::Tool => format!(
            "{} {}{}",
            style("Tool").yellow().bold(),
            style(message.tool_call_id().unwrap_or_default()).dim(),
            style(time).dim()
        ),
    }
}
