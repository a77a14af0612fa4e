use crate::extractor::PageText;
use crate::models::Chunk;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Tokens are whitespace-separated words, the unit used for chunk sizes and
/// the answer token budget alike.
pub fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

pub fn normalize_whitespace(text: &str) -> String {
    text.replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChunkingConfig {
    pub target_tokens: usize,
    /// Fraction of `target_tokens` repeated at the head of the next chunk.
    pub overlap_ratio: f32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: 400,
            overlap_ratio: 0.125,
        }
    }
}

impl ChunkingConfig {
    pub fn overlap_tokens(&self) -> usize {
        let overlap = (self.target_tokens as f32 * self.overlap_ratio).round() as usize;
        overlap.min(self.target_tokens.saturating_sub(1))
    }
}

/// Chunk text and position before ids and embeddings are assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDraft {
    pub chunk_index: u32,
    pub text: String,
    pub token_count: usize,
    pub page_start: u32,
    pub page_end: u32,
}

impl ChunkDraft {
    pub fn into_chunk(self, document_id: &str, generation: u32, embedding: Vec<f32>) -> Chunk {
        let chunk_id = make_chunk_id(document_id, generation, self.chunk_index, &self.text);
        Chunk {
            embedding_ref: chunk_id.clone(),
            chunk_id,
            document_id: document_id.to_string(),
            generation,
            chunk_index: self.chunk_index,
            text: self.text,
            token_count: self.token_count,
            page_start: self.page_start,
            page_end: self.page_end,
            embedding,
        }
    }
}

struct Word<'a> {
    text: &'a str,
    page: u32,
    sentence_end: bool,
    paragraph_end: bool,
}

fn ends_sentence(word: &str) -> bool {
    let trimmed = word.trim_end_matches(['"', '\'', ')', ']', '\u{201d}', '\u{2019}']);
    trimmed.ends_with(['.', '!', '?'])
}

fn collect_words(pages: &[PageText]) -> Vec<Word<'_>> {
    let mut words = Vec::new();
    for page in pages {
        let mut paragraph_start = words.len();
        for line in page.text.lines() {
            if line.trim().is_empty() {
                if words.len() > paragraph_start {
                    mark_paragraph_end(&mut words);
                }
                paragraph_start = words.len();
                continue;
            }
            for token in line.split_whitespace() {
                words.push(Word {
                    text: token,
                    page: page.number,
                    sentence_end: ends_sentence(token),
                    paragraph_end: false,
                });
            }
        }
        if words.len() > paragraph_start {
            mark_paragraph_end(&mut words);
        }
    }
    words
}

fn mark_paragraph_end(words: &mut [Word<'_>]) {
    if let Some(last) = words.last_mut() {
        last.sentence_end = true;
        last.paragraph_end = true;
    }
}

/// Splits page text into overlapping chunks of at most `target_tokens`
/// words. A chunk ends on the last sentence or paragraph break inside the
/// window when one falls in its second half, otherwise it is cut at the
/// window edge. The next chunk starts `overlap` words back, moved forward
/// to the nearest break when one lies inside the overlap.
pub fn chunk_pages(pages: &[PageText], config: &ChunkingConfig) -> Vec<ChunkDraft> {
    let words = collect_words(pages);
    let total = words.len();
    if total == 0 {
        return Vec::new();
    }

    let target = config.target_tokens.max(1);
    let overlap = config.overlap_tokens();
    // boundaries[i] is true when a break follows word i - 1.
    let mut boundaries = vec![false; total + 1];
    for (index, word) in words.iter().enumerate() {
        boundaries[index + 1] = word.sentence_end;
    }

    let mut drafts = Vec::new();
    let mut start = 0;
    loop {
        let end = if total - start <= target {
            total
        } else {
            let limit = start + target;
            let floor = (start + target / 2).max(start + 1);
            (floor..=limit)
                .rev()
                .find(|&position| boundaries[position])
                .unwrap_or(limit)
        };

        drafts.push(build_draft(&words[start..end], drafts.len() as u32));
        if end == total {
            break;
        }

        let desired = end.saturating_sub(overlap).max(start + 1);
        start = (desired..end)
            .find(|&position| boundaries[position])
            .unwrap_or(desired);
    }

    drafts
}

fn build_draft(words: &[Word<'_>], chunk_index: u32) -> ChunkDraft {
    let mut text = String::new();
    for (position, word) in words.iter().enumerate() {
        if position > 0 {
            text.push_str(if words[position - 1].paragraph_end {
                "\n\n"
            } else {
                " "
            });
        }
        text.push_str(word.text);
    }

    ChunkDraft {
        chunk_index,
        text,
        token_count: words.len(),
        page_start: words.first().map_or(1, |word| word.page),
        page_end: words.last().map_or(1, |word| word.page),
    }
}

/// Deterministic per generation, so a reprocess never reuses a stale id.
pub fn make_chunk_id(document_id: &str, generation: u32, chunk_index: u32, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(generation.to_le_bytes());
    hasher.update(chunk_index.to_le_bytes());
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    uuid::Builder::from_random_bytes(bytes)
        .into_uuid()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentences(words: usize, per_sentence: usize) -> String {
        (1..=words)
            .map(|n| {
                if n % per_sentence == 0 {
                    format!("w{n}.")
                } else {
                    format!("w{n}")
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn page(number: u32, text: String) -> PageText {
        PageText { number, text }
    }

    #[test]
    fn whitespace_is_normalized() {
        assert_eq!(normalize_whitespace("A  \t lot\nof\u{a0}spacing"), "A lot of spacing");
    }

    #[test]
    fn twelve_hundred_tokens_make_four_overlapping_chunks() {
        let text = sentences(1200, 10);
        let words: Vec<&str> = text.split_whitespace().collect();
        let pages = vec![
            page(1, words[..400].join(" ")),
            page(2, words[400..800].join(" ")),
            page(3, words[800..].join(" ")),
        ];

        let drafts = chunk_pages(&pages, &ChunkingConfig::default());

        assert_eq!(drafts.len(), 4);
        for (index, draft) in drafts.iter().enumerate() {
            assert_eq!(draft.chunk_index, index as u32);
            assert!(draft.token_count <= 400);
        }
        assert_eq!(drafts[0].page_start, 1);
        assert_eq!(drafts[3].page_end, 3);
        assert!(drafts[1].text.starts_with("w351"));
        assert!(drafts[2].text.starts_with("w701"));
    }

    #[test]
    fn chunks_end_on_sentence_breaks() {
        let text = "Alpha beta gamma. Delta epsilon zeta eta theta. Iota kappa lambda mu nu xi.";
        let drafts = chunk_pages(
            &[page(1, text.to_string())],
            &ChunkingConfig {
                target_tokens: 10,
                overlap_ratio: 0.0,
            },
        );

        assert_eq!(drafts[0].text, "Alpha beta gamma. Delta epsilon zeta eta theta.");
        assert_eq!(drafts[1].text, "Iota kappa lambda mu nu xi.");
    }

    #[test]
    fn paragraph_breaks_survive_in_chunk_text() {
        let drafts = chunk_pages(
            &[page(1, "First paragraph here\n\nSecond paragraph".to_string())],
            &ChunkingConfig::default(),
        );
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].text, "First paragraph here\n\nSecond paragraph");
    }

    #[test]
    fn progress_is_guaranteed_with_full_overlap() {
        let drafts = chunk_pages(
            &[page(1, sentences(50, 1))],
            &ChunkingConfig {
                target_tokens: 4,
                overlap_ratio: 1.0,
            },
        );
        assert!(drafts.len() < 50);
        assert_eq!(drafts.last().map(|d| d.text.ends_with("w50.")), Some(true));
    }

    #[test]
    fn empty_pages_make_no_chunks() {
        assert!(chunk_pages(&[page(1, "   \n".to_string())], &ChunkingConfig::default()).is_empty());
    }

    #[test]
    fn chunk_ids_change_per_generation() {
        let first = make_chunk_id("doc-1", 1, 0, "text");
        let again = make_chunk_id("doc-1", 1, 0, "text");
        let next = make_chunk_id("doc-1", 2, 0, "text");

        assert_eq!(first, again);
        assert_ne!(first, next);
        assert!(uuid::Uuid::parse_str(&first).is_ok());
    }
}
