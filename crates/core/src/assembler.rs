use crate::chunking::count_tokens;
use crate::models::{AssembledContext, Citation, RankedChunk};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AssemblerConfig {
    /// Upper bound on chunk tokens placed in the context window.
    pub token_budget: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self { token_budget: 2000 }
    }
}

fn citation(chunk: &RankedChunk) -> Citation {
    Citation {
        document_id: chunk.document_id.clone(),
        chunk_index: chunk.chunk_index,
        chunk_id: chunk.chunk_id.clone(),
        filename: chunk.filename.clone(),
        page_start: chunk.page_start,
        page_end: chunk.page_end,
        score: chunk.score,
    }
}

fn push_block(context: &mut String, number: usize, citation: &Citation, text: &str) {
    context.push_str(&format!("[{number}] {}\n{text}\n\n", citation.format_inline()));
}

/// Packs ranked chunks into a context window.
///
/// Chunks are taken in rank order and never split; selection stops at the
/// first chunk that would push the total past `token_budget`. When even the
/// top chunk does not fit, its leading `token_budget` tokens are used
/// instead so the context is never empty and never over budget. Only chunk
/// text counts against the budget, not the citation headers.
pub fn assemble(query: &str, ranked: &[RankedChunk], token_budget: usize) -> AssembledContext {
    let mut assembled = AssembledContext::default();
    if token_budget == 0 {
        return assembled;
    }

    for chunk in ranked {
        let tokens = count_tokens(&chunk.text);
        if assembled.token_count + tokens > token_budget {
            break;
        }
        let cite = citation(chunk);
        push_block(&mut assembled.context, assembled.citations.len() + 1, &cite, chunk.text.trim());
        assembled.token_count += tokens;
        assembled.citations.push(cite);
    }

    if assembled.citations.is_empty() {
        if let Some(top) = ranked.first() {
            let cut: Vec<&str> = top.text.split_whitespace().take(token_budget).collect();
            let cite = citation(top);
            push_block(&mut assembled.context, 1, &cite, &cut.join(" "));
            assembled.token_count = cut.len();
            assembled.citations.push(cite);
            assembled.truncated = true;
        }
    }

    debug!(
        query,
        candidates = ranked.len(),
        included = assembled.citations.len(),
        tokens = assembled.token_count,
        truncated = assembled.truncated,
        "assembled context"
    );
    assembled
}

fn sources_list(citations: &[Citation]) -> String {
    citations
        .iter()
        .enumerate()
        .map(|(index, citation)| format!("[{}] {}", index + 1, citation.format_inline()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Prompt for the generation service, restricted to the assembled context.
pub fn build_grounded_prompt(query: &str, assembled: &AssembledContext) -> String {
    format!(
        r#"You answer questions using ONLY the numbered document excerpts below.

RULES:
1. Use only information stated in the excerpts.
2. If the excerpts do not contain the answer, reply "This information is not available in the provided documents."
3. Cite every claim with the excerpt number in brackets, for example [1] or [2][3].

EXCERPTS:
{context}
SOURCES:
{sources}

QUESTION: {query}

ANSWER:"#,
        context = assembled.context,
        sources = sources_list(&assembled.citations),
        query = query.trim()
    )
}
