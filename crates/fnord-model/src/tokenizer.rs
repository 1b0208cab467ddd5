// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Token counting behind one contract, with two interchangeable backends.
//!
//! [`BpeCounter`] counts by encoding against a loaded vocabulary;
//! [`CharCounter`] approximates one token per four characters when no
//! vocabulary is available.  Both satisfy [`TokenCounter`], so everything
//! above this module (compaction thresholds, accumulator budgets) is
//! backend-agnostic.

use std::collections::HashMap;

use crate::Message;

pub trait TokenCounter: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u32>;
    fn decode(&self, tokens: &[u32]) -> String;
    fn estimate_tokens(&self, text: &str) -> usize;

    /// Estimate across a whole message list.
    fn estimate_messages(&self, messages: &[Message]) -> usize {
        messages
            .iter()
            .map(|m| m.char_len().div_ceil(4).max(1))
            .sum()
    }
}

/// chars/4 fallback estimator.  `encode` maps characters to their code
/// points so `decode(encode(s)) == s` holds, keeping the contract total.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharCounter;

impl TokenCounter for CharCounter {
    fn encode(&self, text: &str) -> Vec<u32> {
        text.chars().map(|c| c as u32).collect()
    }

    fn decode(&self, tokens: &[u32]) -> String {
        tokens
            .iter()
            .filter_map(|&t| char::from_u32(t))
            .collect()
    }

    fn estimate_tokens(&self, text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }
}

/// Greedy longest-match encoder over a byte-pair vocabulary.
///
/// Exact counts: `estimate_tokens` is `encode(text).len()`.  Single
/// characters absent from the vocabulary fall back to one token each so
/// encoding never fails.
pub struct BpeCounter {
    vocab: HashMap<String, u32>,
    reverse: HashMap<u32, String>,
    max_piece_len: usize,
}

impl BpeCounter {
    pub fn from_vocab(pairs: impl IntoIterator<Item = (String, u32)>) -> Self {
        let vocab: HashMap<String, u32> = pairs.into_iter().collect();
        let reverse = vocab.iter().map(|(s, &id)| (id, s.clone())).collect();
        let max_piece_len = vocab.keys().map(|s| s.chars().count()).max().unwrap_or(1);
        Self {
            vocab,
            reverse,
            max_piece_len,
        }
    }
}

/// Sentinel id for characters outside the vocabulary: the character's code
/// point offset past the vocabulary id space.
const FALLBACK_BASE: u32 = 0x4000_0000;

impl TokenCounter for BpeCounter {
    fn encode(&self, text: &str) -> Vec<u32> {
        let chars: Vec<char> = text.chars().collect();
        let mut tokens = Vec::new();
        let mut i = 0;
        while i < chars.len() {
            let mut matched = None;
            let end = (i + self.max_piece_len).min(chars.len());
            // Longest match first.
            for j in (i + 1..=end).rev() {
                let piece: String = chars[i..j].iter().collect();
                if let Some(&id) = self.vocab.get(&piece) {
                    matched = Some((id, j));
                    break;
                }
            }
            match matched {
                Some((id, j)) => {
                    tokens.push(id);
                    i = j;
                }
                None => {
                    tokens.push(FALLBACK_BASE + chars[i] as u32);
                    i += 1;
                }
            }
        }
        tokens
    }

    fn decode(&self, tokens: &[u32]) -> String {
        let mut out = String::new();
        for &t in tokens {
            if t >= FALLBACK_BASE {
                if let Some(c) = char::from_u32(t - FALLBACK_BASE) {
                    out.push(c);
                }
            } else if let Some(piece) = self.reverse.get(&t) {
                out.push_str(piece);
            }
        }
        out
    }

    fn estimate_tokens(&self, text: &str) -> usize {
        self.encode(text).len()
    }
}

/// Canonical chunk size in characters for feeding oversized input to a model:
/// `context_tokens × 4 × reduction_factor`, rounded down to a multiple of 4.
pub fn chunk_chars(context_tokens: usize, reduction_factor: f32) -> usize {
    let raw = (context_tokens as f32 * 4.0 * reduction_factor) as usize;
    raw / 4 * 4
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── CharCounter ───────────────────────────────────────────────────────────

    #[test]
    fn char_counter_rounds_up() {
        let c = CharCounter;
        assert_eq!(c.estimate_tokens(""), 0);
        assert_eq!(c.estimate_tokens("abc"), 1);
        assert_eq!(c.estimate_tokens("abcd"), 1);
        assert_eq!(c.estimate_tokens("abcde"), 2);
    }

    #[test]
    fn char_counter_encode_decode_round_trips() {
        let c = CharCounter;
        let s = "hello, wörld";
        assert_eq!(c.decode(&c.encode(s)), s);
    }

    #[test]
    fn estimate_messages_sums_per_message() {
        let c = CharCounter;
        let msgs = vec![Message::user("12345678"), Message::assistant("abcd")];
        // 8 chars → 2, 4 chars → 1
        assert_eq!(c.estimate_messages(&msgs), 3);
    }

    // ── BpeCounter ────────────────────────────────────────────────────────────

    fn tiny_vocab() -> BpeCounter {
        BpeCounter::from_vocab(vec![
            ("hello".to_string(), 1),
            ("hell".to_string(), 2),
            ("he".to_string(), 3),
            ("lo".to_string(), 4),
            (" ".to_string(), 5),
            ("world".to_string(), 6),
        ])
    }

    #[test]
    fn bpe_prefers_longest_match() {
        let b = tiny_vocab();
        assert_eq!(b.encode("hello"), vec![1]);
    }

    #[test]
    fn bpe_falls_back_per_char_outside_vocab() {
        let b = tiny_vocab();
        let tokens = b.encode("xyz");
        assert_eq!(tokens.len(), 3);
    }

    #[test]
    fn bpe_encode_decode_round_trips() {
        let b = tiny_vocab();
        let s = "hello world xyz";
        assert_eq!(b.decode(&b.encode(s)), s);
    }

    #[test]
    fn bpe_estimate_is_encoding_length() {
        let b = tiny_vocab();
        assert_eq!(b.estimate_tokens("hello world"), b.encode("hello world").len());
    }

    // ── chunk_chars ───────────────────────────────────────────────────────────

    #[test]
    fn chunk_chars_is_multiple_of_four() {
        for tokens in [100, 1000, 4097, 128_000] {
            for rf in [0.3_f32, 0.5, 0.75, 1.0] {
                assert_eq!(chunk_chars(tokens, rf) % 4, 0);
            }
        }
    }

    #[test]
    fn chunk_chars_scales_with_reduction_factor() {
        assert_eq!(chunk_chars(1000, 1.0), 4000);
        assert_eq!(chunk_chars(1000, 0.5), 2000);
    }

    #[test]
    fn chunk_chars_rounds_down() {
        // 10 × 4 × 0.3 = 12.0 exactly; 11 × 4 × 0.3 = 13.2 → 12
        assert_eq!(chunk_chars(11, 0.3), 12);
    }
}
