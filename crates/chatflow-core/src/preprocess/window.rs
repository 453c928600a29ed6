//! History windowing and tool-chain repair.

use chatflow_types::message::{Message, Role};

/// Select the system message plus a trailing slice of history.
///
/// Walks backward from the end, spending one unit of `budget` per non-tool
/// message; tool results are free so they stay with the call that produced
/// them. Returns owned copies in chronological order.
pub fn window(history: &[Message], budget: usize) -> Vec<Message> {
    let Some((head, rest)) = history.split_first() else {
        return Vec::new();
    };

    let mut spent = 0;
    let mut start = rest.len();
    for (i, message) in rest.iter().enumerate().rev() {
        if message.role() != Role::Tool {
            if spent == budget {
                break;
            }
            spent += 1;
        }
        start = i;
    }

    let mut out = Vec::with_capacity(1 + rest.len() - start);
    out.push(head.clone());
    out.extend(rest[start..].iter().cloned());
    out
}

/// Re-insert messages from `history` until a user message follows the head.
///
/// Anchors on the message at index 1 of `messages`, finds it in the full
/// history, and walks backward from there. Returns how many messages were
/// re-inserted.
pub fn repair(messages: &mut Vec<Message>, history: &[Message]) -> usize {
    let Some(anchor) = messages.get(1) else {
        return 0;
    };
    if anchor.role() == Role::User {
        return 0;
    }
    let Some(anchor_index) = history.iter().position(|m| m.id() == anchor.id()) else {
        tracing::warn!(
            message_id = %anchor.id(),
            "Window anchor not found in history, skipping repair"
        );
        return 0;
    };

    let mut inserted = 0;
    for message in history[1..anchor_index].iter().rev() {
        messages.insert(1, message.clone());
        inserted += 1;
        if message.role() == Role::User {
            break;
        }
    }
    if inserted > 0 {
        tracing::debug!(inserted, "Repaired windowed history");
    }
    inserted
}
