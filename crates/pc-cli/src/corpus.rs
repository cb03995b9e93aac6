//! Keyword retriever over a directory of plain-text documents.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use pc_core::tokenizer::content_terms;
use pc_core::{CollabError, Retriever, SearchHit};

const SNIPPET_CHARS: usize = 160;

struct Passage {
    doc_id: String,
    text: String,
    terms: BTreeSet<String>,
}

/// Scores paragraphs by the share of query content terms they contain.
pub struct CorpusRetriever {
    passages: Vec<Passage>,
}

impl CorpusRetriever {
    /// Load every `.txt` and `.md` file in `dir`, one passage per
    /// blank-line separated paragraph.
    pub fn load(dir: &Path) -> Result<Self> {
        let entries =
            std::fs::read_dir(dir).with_context(|| format!("failed to read dir {}", dir.display()))?;
        let mut paths: Vec<_> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|ext| matches!(ext, "txt" | "md"))
            })
            .collect();
        paths.sort();

        let mut passages = Vec::new();
        for path in &paths {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("unnamed");
            passages.extend(split_passages(stem, &content));
        }
        tracing::info!(
            documents = paths.len(),
            passages = passages.len(),
            "loaded corpus"
        );
        Ok(Self { passages })
    }

    pub fn from_texts(docs: &[(&str, &str)]) -> Self {
        let passages = docs
            .iter()
            .flat_map(|(id, text)| split_passages(id, text))
            .collect();
        Self { passages }
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }
}

fn split_passages(doc: &str, content: &str) -> Vec<Passage> {
    content
        .split("\n\n")
        .map(|p| p.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|p| !p.is_empty())
        .enumerate()
        .map(|(i, text)| Passage {
            doc_id: format!("{doc}#{i}"),
            terms: content_terms(&text),
            text,
        })
        .collect()
}

fn snippet(text: &str) -> String {
    if text.chars().count() <= SNIPPET_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(SNIPPET_CHARS).collect();
    match cut.rfind(' ') {
        Some(i) => cut[..i].to_string(),
        None => cut,
    }
}

impl Retriever for CorpusRetriever {
    fn search(&mut self, query: &str, top_k: usize) -> Result<Vec<SearchHit>, CollabError> {
        let terms = content_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let mut hits: Vec<SearchHit> = self
            .passages
            .iter()
            .filter_map(|p| {
                let shared = terms.intersection(&p.terms).count();
                (shared > 0).then(|| SearchHit {
                    doc_id: p.doc_id.clone(),
                    score: shared as f64 / terms.len() as f64,
                    snippet: snippet(&p.text),
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.doc_id.cmp(&b.doc_id)));
        hits.truncate(top_k);
        Ok(hits)
    }
}
