//! Outbound helpers: 4000-char splitting, Markdown fallback, MarkdownV2
//! escaping for out-of-band notices.

use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::ParseMode;
use tracing::warn;

/// Maximum characters per Telegram message (platform limit is 4096).
pub const CHUNK_MAX: usize = 4000;
const SEND_RETRIES: usize = 3;

/// Split on `\n` boundaries into ≤`limit` chunks; a single oversized line
/// is cut at the limit (backed off to a char boundary).
pub fn split_chunks(text: &str, limit: usize) -> Vec<String> {
    if text.len() <= limit {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut remaining = text;
    while remaining.len() > limit {
        let mut window_end = limit;
        while !remaining.is_char_boundary(window_end) {
            window_end -= 1;
        }
        // A newline at index 0 would produce an empty chunk (which the
        // platform rejects); cut at the window instead.
        let split_at = match remaining[..window_end].rfind('\n') {
            Some(pos) if pos > 0 => pos,
            _ => window_end,
        };
        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start_matches('\n');
    }
    if !remaining.is_empty() {
        chunks.push(remaining.to_string());
    }
    chunks
}

/// Escape the characters MarkdownV2 treats as markup.
pub fn escape_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    for ch in text.chars() {
        match ch {
            '_' | '*' | '[' | ']' | '(' | ')' | '~' | '`' | '>' | '#' | '+' | '-' | '=' | '|'
            | '{' | '}' | '.' | '!' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}

/// Send `text` in chunks. Each chunk first attempts Markdown; a parse
/// rejection falls back to plain text. Transient failures retry with a
/// short sleep.
pub async fn send_chunked(bot: &Bot, chat_id: ChatId, text: &str) -> Result<(), String> {
    for chunk in split_chunks(text, CHUNK_MAX) {
        let mut delivered = false;
        let mut last_err = String::new();
        for attempt in 0..SEND_RETRIES {
            match bot
                .send_message(chat_id, &chunk)
                .parse_mode(ParseMode::Markdown)
                .await
            {
                Ok(_) => {
                    delivered = true;
                    break;
                }
                Err(markdown_err) => {
                    // Markdown parse errors are permanent for this text —
                    // retry immediately as plain text.
                    match bot.send_message(chat_id, &chunk).await {
                        Ok(_) => {
                            delivered = true;
                            break;
                        }
                        Err(e) => {
                            last_err = format!("{markdown_err}; plain: {e}");
                            warn!(attempt, error = %last_err, "Telegram send failed, retrying");
                            tokio::time::sleep(Duration::from_secs(2)).await;
                        }
                    }
                }
            }
        }
        if !delivered {
            return Err(last_err);
        }
    }
    Ok(())
}

/// Out-of-band notice: MarkdownV2 with escaped dynamic parts, plaintext
/// fallback on parse failure.
pub async fn send_notice(bot: &Bot, chat_id: ChatId, markdown_v2: &str, plain: &str) {
    let attempt = bot
        .send_message(chat_id, markdown_v2)
        .parse_mode(ParseMode::MarkdownV2)
        .await;
    if attempt.is_err() {
        let _ = bot.send_message(chat_id, plain).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_respect_limit() {
        let line = "b".repeat(3000);
        let text = format!("{line}\n{line}");
        let chunks = split_chunks(&text, CHUNK_MAX);
        assert_eq!(chunks.len(), 2);
        for c in &chunks {
            assert!(c.len() <= CHUNK_MAX);
        }
    }

    #[test]
    fn hard_cut_without_newline() {
        let text = "y".repeat(9000);
        let chunks = split_chunks(&text, CHUNK_MAX);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), CHUNK_MAX);
    }

    #[test]
    fn leading_newline_never_yields_an_empty_chunk() {
        let text = format!("\n{}", "y".repeat(6000));
        let chunks = split_chunks(&text, CHUNK_MAX);
        assert!(chunks.iter().all(|c| !c.is_empty()));
    }

    #[test]
    fn markdown_v2_escaping() {
        assert_eq!(escape_markdown_v2("a_b"), "a\\_b");
        assert_eq!(escape_markdown_v2("x.y!"), "x\\.y\\!");
        assert_eq!(escape_markdown_v2("plain"), "plain");
    }
}
