//! Outbound message helpers for the Discord bridge.

use std::time::Duration;

use serenity::http::Http;
use serenity::model::id::ChannelId;
use tracing::warn;

/// Maximum characters per Discord message (platform limit is 2000).
pub const CHUNK_MAX: usize = 1900;
/// Retries for rate-limited or transient send failures.
const SEND_RETRIES: usize = 3;

/// Split `text` into chunks of at most `limit` characters, preferring `\n`
/// boundaries. A single line longer than the limit is cut at the limit
/// (backed off to a char boundary).
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

/// Send `text` in ≤[`CHUNK_MAX`]-char chunks, retrying each chunk on
/// transient failure with a short sleep.
pub async fn send_chunked(http: &Http, channel_id: ChannelId, text: &str) -> Result<(), String> {
    for chunk in split_chunks(text, CHUNK_MAX) {
        let mut last_err = String::new();
        let mut sent = false;
        for attempt in 0..SEND_RETRIES {
            match channel_id.say(http, &chunk).await {
                Ok(_) => {
                    sent = true;
                    break;
                }
                Err(e) => {
                    last_err = e.to_string();
                    warn!(attempt, error = %last_err, "Discord send failed, retrying");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
        if !sent {
            return Err(last_err);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_single_chunk() {
        assert_eq!(split_chunks("hello", CHUNK_MAX), vec!["hello"]);
    }

    #[test]
    fn splits_on_newline_boundaries() {
        let line = "a".repeat(1200);
        let text = format!("{line}\n{line}");
        let chunks = split_chunks(&text, CHUNK_MAX);
        assert_eq!(chunks.len(), 2);
        for c in &chunks {
            assert!(c.len() <= CHUNK_MAX);
        }
    }

    #[test]
    fn no_newline_cuts_at_exact_limit() {
        let text = "x".repeat(4000);
        let chunks = split_chunks(&text, CHUNK_MAX);
        assert_eq!(chunks[0].len(), CHUNK_MAX);
        assert_eq!(chunks[1].len(), CHUNK_MAX);
        assert_eq!(chunks[2].len(), 4000 - 2 * CHUNK_MAX);
    }

    #[test]
    fn leading_newline_never_yields_an_empty_chunk() {
        let text = format!("\n{}", "x".repeat(3000));
        let chunks = split_chunks(&text, CHUNK_MAX);
        assert!(chunks.iter().all(|c| !c.is_empty()));
        assert_eq!(chunks.concat().matches('x').count(), 3000);
    }

    #[test]
    fn multibyte_text_never_splits_inside_a_char() {
        let text = "ü".repeat(2000);
        for chunk in split_chunks(&text, CHUNK_MAX) {
            assert!(chunk.len() <= CHUNK_MAX);
            assert!(std::str::from_utf8(chunk.as_bytes()).is_ok());
        }
    }
}
