//! Recursive character text splitter.
//!
//! Splits document text into [`Chunk`]s of at most `chunk_size` characters,
//! with up to `chunk_overlap` characters repeated between neighbours.
//! Boundaries are searched in order of preference: paragraph (`\n\n`), line
//! (`\n`), word (` `), and finally a hard cut between characters. Separators
//! stay attached to the start of the piece that follows them, and every
//! emitted chunk is whitespace-trimmed; empty chunks are dropped.
//!
//! Lengths are measured in characters, never bytes.

use crate::documents::Document;
use crate::models::Chunk;

const SEPARATORS: &[&str] = &["\n\n", "\n", " ", ""];

#[derive(Debug, Clone)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl TextSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            chunk_overlap: chunk_overlap.min(chunk_size - 1),
        }
    }

    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_recursive(text, SEPARATORS)
    }

    /// Split every document; chunk indices restart at 0 per source.
    pub fn split_documents(&self, documents: &[Document]) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        for doc in documents {
            for (index, text) in self.split_text(&doc.text).into_iter().enumerate() {
                chunks.push(Chunk {
                    source: doc.source.clone(),
                    index,
                    text,
                });
            }
        }
        tracing::info!(
            documents = documents.len(),
            chunks = chunks.len(),
            "split documents into chunks"
        );
        chunks
    }

    fn split_recursive(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let mut separator = "";
        let mut remaining: &[&str] = &[];
        for (i, sep) in separators.iter().enumerate() {
            if sep.is_empty() || text.contains(sep) {
                separator = sep;
                remaining = &separators[i + 1..];
                break;
            }
        }

        let mut out = Vec::new();
        let mut good: Vec<&str> = Vec::new();
        for piece in split_keep_start(text, separator) {
            if char_len(piece) < self.chunk_size {
                good.push(piece);
                continue;
            }
            if !good.is_empty() {
                out.extend(self.merge(&good));
                good.clear();
            }
            if remaining.is_empty() {
                out.push(piece.to_string());
            } else {
                out.extend(self.split_recursive(piece, remaining));
            }
        }
        if !good.is_empty() {
            out.extend(self.merge(&good));
        }
        out
    }

    /// Greedily concatenate pieces up to `chunk_size`, carrying a tail of at
    /// most `chunk_overlap` characters into the next chunk.
    fn merge(&self, pieces: &[&str]) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut window: std::collections::VecDeque<(&str, usize)> = Default::default();
        let mut total = 0usize;

        for piece in pieces {
            let len = char_len(piece);
            if total + len > self.chunk_size && !window.is_empty() {
                push_trimmed(&mut chunks, &window);
                while total > self.chunk_overlap
                    || (total + len > self.chunk_size && total > 0)
                {
                    match window.pop_front() {
                        Some((_, front_len)) => total -= front_len,
                        None => break,
                    }
                }
            }
            window.push_back((piece, len));
            total += len;
        }
        push_trimmed(&mut chunks, &window);
        chunks
    }
}

fn push_trimmed(chunks: &mut Vec<String>, window: &std::collections::VecDeque<(&str, usize)>) {
    let joined: String = window.iter().map(|(s, _)| *s).collect();
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

/// Split on `separator`, keeping each separator at the start of the piece
/// after it. The empty separator splits into single characters.
fn split_keep_start<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    if separator.is_empty() {
        return text
            .char_indices()
            .map(|(i, c)| &text[i..i + c.len_utf8()])
            .collect();
    }
    let mut pieces = Vec::new();
    let mut start = 0;
    for (pos, _) in text.match_indices(separator) {
        if pos > start {
            pieces.push(&text[start..pos]);
        }
        start = pos;
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_single_chunk() {
        let splitter = TextSplitter::new(500, 50);
        let chunks = splitter.split_text("Keep your hips close to the wall.");
        assert_eq!(chunks, vec!["Keep your hips close to the wall."]);
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        let splitter = TextSplitter::new(500, 50);
        assert!(splitter.split_text("").is_empty());
        assert!(splitter.split_text("   \n\n  ").is_empty());
    }

    #[test]
    fn test_unbroken_text_hard_cut_with_overlap() {
        let text: String = (0..600).map(|i| (b'a' + (i % 26) as u8) as char).collect();
        let chunks = TextSplitter::new(500, 50).split_text(&text);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], text[..500]);
        assert_eq!(chunks[1], text[450..]);
    }

    #[test]
    fn test_prefers_paragraph_boundaries() {
        let para_a = "a".repeat(30);
        let para_b = "b".repeat(30);
        let text = format!("{}\n\n{}", para_a, para_b);
        let chunks = TextSplitter::new(40, 0).split_text(&text);
        assert_eq!(chunks, vec![para_a, para_b]);
    }

    #[test]
    fn test_separator_kept_on_following_piece() {
        assert_eq!(
            split_keep_start("one two three", " "),
            vec!["one", " two", " three"]
        );
        assert_eq!(split_keep_start("\n\nlead", "\n\n"), vec!["\n\nlead"]);
    }

    #[test]
    fn test_no_chunk_exceeds_size() {
        let text = (0..200)
            .map(|i| {
                let sep = if i % 7 == 6 { "\n\n" } else { "\n" };
                format!("Move {} flags the left foot and rocks over.{}", i, sep)
            })
            .collect::<String>();
        for (size, overlap) in [(500, 50), (100, 20), (37, 5), (10, 2)] {
            let chunks = TextSplitter::new(size, overlap).split_text(&text);
            assert!(!chunks.is_empty());
            for c in &chunks {
                assert!(c.chars().count() <= size, "{} > {}", c.chars().count(), size);
            }
        }
    }

    #[test]
    fn test_multibyte_counts_chars() {
        let text = "é".repeat(120);
        let chunks = TextSplitter::new(100, 10).split_text(&text);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].chars().count(), 100);
        assert_eq!(chunks[1].chars().count(), 30);
    }

    #[test]
    fn test_split_documents_indexes_per_source() {
        let docs = vec![
            Document {
                source: "grip.txt".into(),
                text: "x".repeat(120),
            },
            Document {
                source: "feet.txt".into(),
                text: "Quiet feet.".into(),
            },
        ];
        let chunks = TextSplitter::new(100, 10).split_documents(&docs);
        let keys: Vec<(&str, usize)> = chunks.iter().map(|c| (c.source.as_str(), c.index)).collect();
        assert_eq!(keys, vec![("grip.txt", 0), ("grip.txt", 1), ("feet.txt", 0)]);
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha beta\n\nGamma delta epsilon\nZeta eta theta iota kappa";
        let splitter = TextSplitter::new(12, 3);
        assert_eq!(splitter.split_text(text), splitter.split_text(text));
    }
}
