//! Chunking strategies, selected via config.
//!
//! `token_count` is approximated by whitespace-separated word count; no
//! subword tokenizer is wired in, so all three chunkers use the same
//! unit to keep `chunk_size`/`min_chunk_size`/`max_chunk_size` comparable
//! across strategies.

use pipeline_core::config::ChunkingConfig;

/// A raw chunk before persistence: only what the chunker can compute
/// from the message text. The chunk stage adds
/// `archive_id`/`message_id`/`thread_id`/`key` when building the domain
/// `Chunk`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChunk {
    pub text: String,
    pub token_count: usize,
    pub start_offset: Option<usize>,
    pub end_offset: Option<usize>,
}

fn word_boundaries(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;
    for (idx, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if let Some(s) = start.take() {
                spans.push((s, idx));
            }
        } else if start.is_none() {
            start = Some(idx);
        }
    }
    if let Some(s) = start {
        spans.push((s, text.len()));
    }
    spans
}

/// Token-window: a sliding window of `chunk_size` tokens with `overlap`
/// overlap; drops the final chunk if it falls below `min_chunk_size`,
/// unless it's the only chunk produced; never exceeds `max_chunk_size`.
pub fn chunk_token_window(text: &str, config: &ChunkingConfig) -> Vec<RawChunk> {
    let words = word_boundaries(text);
    if words.is_empty() {
        return Vec::new();
    }

    let window = config.chunk_size.min(config.max_chunk_size).max(1);
    let step = window.saturating_sub(config.chunk_overlap).max(1);

    let mut chunks = Vec::new();
    let mut start_idx = 0usize;
    while start_idx < words.len() {
        let end_idx = (start_idx + window).min(words.len());
        let (start_offset, _) = words[start_idx];
        let (_, end_offset) = words[end_idx - 1];
        let token_count = end_idx - start_idx;
        chunks.push(RawChunk {
            text: text[start_offset..end_offset].to_string(),
            token_count,
            start_offset: Some(start_offset),
            end_offset: Some(end_offset),
        });
        if end_idx == words.len() {
            break;
        }
        start_idx += step;
    }

    if chunks.len() > 1 {
        if let Some(last) = chunks.last() {
            if last.token_count < config.min_chunk_size {
                chunks.pop();
            }
        }
    }

    chunks
}

/// Fixed-size: exactly `messages_per_chunk` messages per chunk. This
/// function already operates over the full list of message bodies for a
/// given chunking unit (the caller groups messages before calling); the
/// last chunk may end up smaller.
pub fn chunk_fixed_size(message_bodies: &[String], config: &ChunkingConfig) -> Vec<RawChunk> {
    let group_size = config.messages_per_chunk.max(1);
    message_bodies
        .chunks(group_size)
        .map(|group| {
            let text = group.join("\n\n");
            let token_count = word_boundaries(&text).len();
            RawChunk { text, token_count, start_offset: None, end_offset: None }
        })
        .collect()
}

/// Semantic: splits into sentences on `.`/`!`/`?` followed by
/// whitespace, then greedily packs whole sentences up to `chunk_size`
/// tokens without exceeding it.
pub fn chunk_semantic(text: &str, config: &ChunkingConfig) -> Vec<RawChunk> {
    let sentences = split_sentences(text);
    if sentences.is_empty() {
        return Vec::new();
    }

    let target = config.chunk_size.min(config.max_chunk_size).max(1);
    let mut chunks = Vec::new();
    let mut current_text = String::new();
    let mut current_tokens = 0usize;
    let mut current_start: Option<usize> = None;
    let mut current_end: Option<usize> = None;

    for (start, end, sentence) in sentences {
        let sentence_tokens = word_boundaries(sentence).len();
        let would_exceed = current_tokens > 0 && current_tokens + sentence_tokens > target;
        if would_exceed {
            chunks.push(RawChunk {
                text: std::mem::take(&mut current_text),
                token_count: current_tokens,
                start_offset: current_start,
                end_offset: current_end,
            });
            current_tokens = 0;
            current_start = None;
        }
        if current_text.is_empty() {
            current_start = Some(start);
        } else {
            current_text.push(' ');
        }
        current_text.push_str(sentence);
        current_tokens += sentence_tokens;
        current_end = Some(end);
    }

    if !current_text.is_empty() {
        chunks.push(RawChunk {
            text: current_text,
            token_count: current_tokens,
            start_offset: current_start,
            end_offset: current_end,
        });
    }

    if chunks.len() > 1 {
        if let Some(last) = chunks.last() {
            if last.token_count < config.min_chunk_size {
                let overflow = chunks.pop().unwrap();
                if let Some(prev) = chunks.last_mut() {
                    prev.text.push(' ');
                    prev.text.push_str(&overflow.text);
                    prev.token_count += overflow.token_count;
                    prev.end_offset = overflow.end_offset;
                } else {
                    chunks.push(overflow);
                }
            }
        }
    }

    chunks
}

fn split_sentences(text: &str) -> Vec<(usize, usize, &str)> {
    let mut spans = Vec::new();
    let mut start = 0usize;
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let (idx, ch) = chars[i];
        if matches!(ch, '.' | '!' | '?') {
            let boundary = idx + ch.len_utf8();
            let next_is_whitespace_or_end = chars.get(i + 1).map(|(_, c)| c.is_whitespace()).unwrap_or(true);
            if next_is_whitespace_or_end {
                let sentence = text[start..boundary].trim();
                if !sentence.is_empty() {
                    spans.push((start, boundary, sentence));
                }
                start = boundary;
            }
        }
        i += 1;
    }
    if start < text.len() {
        let sentence = text[start..].trim();
        if !sentence.is_empty() {
            spans.push((start, text.len(), sentence));
        }
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_core::config::ChunkingStrategy;

    fn config(chunk_size: usize, overlap: usize, min: usize, max: usize, per_chunk: usize) -> ChunkingConfig {
        ChunkingConfig {
            strategy: ChunkingStrategy::TokenWindow,
            chunk_size,
            chunk_overlap: overlap,
            min_chunk_size: min,
            max_chunk_size: max,
            messages_per_chunk: per_chunk,
        }
    }

    #[test]
    fn token_window_splits_with_overlap() {
        let text = (1..=10).map(|n| n.to_string()).collect::<Vec<_>>().join(" ");
        let cfg = config(4, 1, 1, 100, 1);
        let chunks = chunk_token_window(&text, &cfg);
        assert!(chunks.len() >= 2);
        assert_eq!(chunks[0].token_count, 4);
    }

    #[test]
    fn token_window_discards_trailing_small_chunk_unless_only_one() {
        let text = (1..=5).map(|n| n.to_string()).collect::<Vec<_>>().join(" ");
        let cfg = config(4, 0, 3, 100, 1);
        let chunks = chunk_token_window(&text, &cfg);
        // second window would be just "5" (1 token) < min_chunk_size=3, dropped
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].token_count, 4);
    }

    #[test]
    fn token_window_keeps_sole_chunk_even_if_small() {
        let text = "one two";
        let cfg = config(4, 0, 10, 100, 1);
        let chunks = chunk_token_window(text, &cfg);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].token_count, 2);
    }

    #[test]
    fn fixed_size_groups_exact_message_count_with_smaller_last_chunk() {
        let bodies: Vec<String> = (1..=5).map(|n| format!("msg{n}")).collect();
        let cfg = config(512, 0, 0, 1024, 2);
        let chunks = chunk_fixed_size(&bodies, &cfg);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text, "msg1\n\nmsg2");
        assert_eq!(chunks[2].text, "msg5");
    }

    #[test]
    fn semantic_packs_whole_sentences_without_exceeding_target() {
        let text = "One two three. Four five six. Seven eight nine ten.";
        let cfg = config(6, 0, 0, 100, 1);
        let chunks = chunk_semantic(text, &cfg);
        assert!(chunks.iter().all(|c| c.token_count <= 6));
        let joined: String = chunks.iter().map(|c| c.text.clone()).collect::<Vec<_>>().join(" ");
        assert!(joined.contains("One two three."));
        assert!(joined.contains("Seven eight nine ten."));
    }

    #[test]
    fn semantic_never_splits_a_sentence_across_chunks() {
        let text = "Alpha beta gamma delta epsilon. Zeta.";
        let cfg = config(3, 0, 0, 100, 1);
        let chunks = chunk_semantic(text, &cfg);
        assert!(chunks[0].text.starts_with("Alpha beta gamma delta epsilon."));
    }
}
