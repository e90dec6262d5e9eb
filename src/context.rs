//! Prompt-size estimation and quota-pressure trimming
//!
//! Estimation is a character-based approximation (1 token ≈ 4 characters) used for quota
//! reservations, not for billing. The true counts come back from the upstream and are
//! reconciled when the reservation is finalized.
//!
//! # Examples
//!
//! ```rust
//! use tool_gateway::{estimate_tokens, trim_to_budget, Message};
//!
//! let messages = vec![
//!     Message::system("You are a helpful assistant"),
//!     Message::user("x".repeat(40_000)),
//!     Message::user("What's the weather in Ottawa?"),
//! ];
//! let trimmed = trim_to_budget(&messages, 6_000);
//! assert_eq!(trimmed.len(), 2);
//! assert!(estimate_tokens(&trimmed) < 6_000);
//! ```

use crate::types::{IMAGE_CHAR_COST, Message};

/// Characters charged per message for role formatting
const MESSAGE_OVERHEAD_CHARS: usize = 8;

/// Characters charged once per conversation
const CONVERSATION_OVERHEAD_CHARS: usize = 16;

/// Estimate tokens for a bare string
pub fn estimate_text_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

fn message_chars(message: &Message) -> usize {
    let attachments: usize = message
        .attachments
        .iter()
        .map(|a| {
            if a.is_image() {
                IMAGE_CHAR_COST
            } else {
                // base64 expands by 4/3
                a.data.len() * 3 / 4
            }
        })
        .sum();
    MESSAGE_OVERHEAD_CHARS + message.content.char_len() + attachments
}

/// Estimate tokens for one message, including its role overhead
pub fn estimate_message_tokens(message: &Message) -> usize {
    message_chars(message).div_ceil(4)
}

/// Estimate token count for a message list
///
/// # Note
///
/// This is an APPROXIMATION. Real tokenizers land within roughly 70-85% of it for
/// English text; the reservation is corrected at finalize time.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    if messages.is_empty() {
        return 0;
    }
    let total: usize =
        messages.iter().map(message_chars).sum::<usize>() + CONVERSATION_OVERHEAD_CHARS;
    total.div_ceil(4)
}

/// Drop messages until the estimate fits `budget` tokens.
///
/// - System messages and the final message are always kept.
/// - Any other message that alone exceeds half the budget is dropped.
/// - Remaining messages are dropped oldest first.
///
/// The result keeps the original order and may still exceed the budget when the kept
/// messages alone are larger.
pub fn trim_to_budget(messages: &[Message], budget: usize) -> Vec<Message> {
    if messages.is_empty() || estimate_tokens(messages) <= budget {
        return messages.to_vec();
    }

    let last = messages.len() - 1;
    let droppable = |i: usize| i != last && messages[i].role != "system";

    let mut keep: Vec<bool> = (0..messages.len())
        .map(|i| !(droppable(i) && estimate_message_tokens(&messages[i]) > budget / 2))
        .collect();

    let current = |keep: &[bool]| {
        let kept: Vec<Message> = messages
            .iter()
            .zip(keep)
            .filter(|(_, k)| **k)
            .map(|(m, _)| m.clone())
            .collect();
        estimate_tokens(&kept)
    };

    for i in 0..messages.len() {
        if current(&keep) <= budget {
            break;
        }
        if droppable(i) && keep[i] {
            keep[i] = false;
        }
    }

    let trimmed: Vec<Message> = messages
        .iter()
        .zip(&keep)
        .filter(|(_, k)| **k)
        .map(|(m, _)| m.clone())
        .collect();

    if trimmed.len() < messages.len() {
        log::debug!(
            "trimmed prompt from {} to {} messages to fit {} tokens",
            messages.len(),
            trimmed.len(),
            budget
        );
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Attachment;

    #[test]
    fn test_estimate_tokens_empty() {
        assert_eq!(estimate_tokens(&[]), 0);
    }

    #[test]
    fn test_estimate_tokens_simple() {
        let messages = vec![Message::user("Hello world")];
        // (11 + 8 + 16) / 4 rounded up
        assert_eq!(estimate_tokens(&messages), 9);
    }

    #[test]
    fn test_estimate_text_tokens_rounds_up() {
        assert_eq!(estimate_text_tokens(""), 0);
        assert_eq!(estimate_text_tokens("abc"), 1);
        assert_eq!(estimate_text_tokens("abcde"), 2);
        // counts characters, not bytes
        assert_eq!(estimate_text_tokens("éééé"), 1);
    }

    #[test]
    fn test_image_attachment_has_fixed_cost() {
        let msg = Message::user("").with_attachment(Attachment {
            name: None,
            content_type: "image/png".into(),
            data: "A".repeat(100_000),
        });
        assert_eq!(estimate_message_tokens(&msg), (8 + IMAGE_CHAR_COST).div_ceil(4));
    }

    #[test]
    fn test_trim_keeps_everything_under_budget() {
        let messages = vec![Message::system("s"), Message::user("hi")];
        assert_eq!(trim_to_budget(&messages, 100), messages);
    }

    #[test]
    fn test_trim_drops_oldest_first() {
        let messages = vec![
            Message::system("rules"),
            Message::user("a".repeat(400)),
            Message::assistant("b".repeat(400)),
            Message::user("c".repeat(400)),
            Message::user("final"),
        ];
        let trimmed = trim_to_budget(&messages, 250);
        assert_eq!(trimmed.first().map(|m| m.role.as_str()), Some("system"));
        assert_eq!(trimmed.last(), messages.last());
        assert!(estimate_tokens(&trimmed) <= 250);
        // the newest middle message survives
        assert!(trimmed.contains(&messages[3]));
        assert!(!trimmed.contains(&messages[1]));
    }

    #[test]
    fn test_trim_drops_oversized_middle_message() {
        let messages = vec![
            Message::user("old"),
            Message::user("x".repeat(20_000)),
            Message::user("final"),
        ];
        let trimmed = trim_to_budget(&messages, 1_000);
        assert_eq!(trimmed.len(), 2);
        assert_eq!(trimmed[0], messages[0]);
        assert_eq!(trimmed[1], messages[2]);
    }

    #[test]
    fn test_trim_never_drops_final_or_system() {
        let messages = vec![
            Message::system("s".repeat(8_000)),
            Message::user("f".repeat(8_000)),
        ];
        let trimmed = trim_to_budget(&messages, 100);
        assert_eq!(trimmed, messages);
    }
}
