use std::{
    collections::HashMap,
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use common::{Chunk, ChunkMeta};
use serde::Deserialize;

use crate::error::IndexError;

/// One prepared forum record, as produced by the dump converters.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SourceRecord {
    pub qid: String,
    pub component: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub accepted: bool,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub answer: String,
    /// Set when the record is already a chunk of a larger document.
    #[serde(default)]
    pub chunk_index: Option<usize>,
    /// Pre-rendered passage text; rendered from the other fields when absent.
    #[serde(default)]
    pub content: Option<String>,
}

impl SourceRecord {
    pub fn render(&self) -> String {
        format!(
            "[Component] {}\n[Tags] {}\n[Title] {}\n\nQuestion:\n{}\n\nAnswer:\n{}\n",
            self.component,
            self.tags.join(", "),
            self.title,
            self.question,
            self.answer
        )
    }

    fn meta(&self, chunk_index: usize) -> ChunkMeta {
        ChunkMeta {
            source_id: self.qid.clone(),
            chunk_index,
            component: self.component.clone(),
            tags: self.tags.clone(),
            relevance_score: self.score,
            accepted: self.accepted,
            title: self.title.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 900,
            chunk_overlap: 150,
        }
    }
}

/// Reads one JSON record per line. Blank lines are skipped; a malformed line is an error.
pub fn read_jsonl(path: &Path) -> Result<Vec<SourceRecord>, IndexError> {
    let file = File::open(path).map_err(|source| IndexError::io(path, source))?;
    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| IndexError::io(path, source))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record = serde_json::from_str::<SourceRecord>(line).map_err(|source| {
            IndexError::Record {
                path: path.to_path_buf(),
                line: idx + 1,
                source,
            }
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Turns records into chunks. Records carrying `chunk_index` pass through as-is; the rest
/// are rendered and split into overlapping windows numbered per source, starting after the
/// highest pass-through index of that source so `(qid, chunk_index)` stays unique.
pub fn records_to_chunks(records: &[SourceRecord], cfg: ChunkingConfig) -> Vec<Chunk> {
    let mut next_index: HashMap<&str, usize> = HashMap::new();
    for record in records {
        if let Some(chunk_index) = record.chunk_index {
            let slot = next_index.entry(record.qid.as_str()).or_insert(0);
            *slot = (*slot).max(chunk_index + 1);
        }
    }
    let mut out = Vec::new();
    for record in records {
        if let Some(chunk_index) = record.chunk_index {
            out.push(Chunk {
                content: record.content.clone().unwrap_or_else(|| record.render()),
                meta: record.meta(chunk_index),
            });
            continue;
        }
        let text = record.content.clone().unwrap_or_else(|| record.render());
        for piece in split_text(&text, cfg) {
            let slot = next_index.entry(record.qid.as_str()).or_insert(0);
            out.push(Chunk {
                content: piece,
                meta: record.meta(*slot),
            });
            *slot += 1;
        }
    }
    out
}

/// Character windows of at most `chunk_size`, cut at the last whitespace when one exists
/// in the back half of the window.
fn split_text(text: &str, cfg: ChunkingConfig) -> Vec<String> {
    let chars = text.chars().collect::<Vec<_>>();
    let size = cfg.chunk_size.max(1);
    let overlap = cfg.chunk_overlap.min(size / 2);
    if chars.len() <= size {
        return vec![text.to_string()];
    }

    let mut pieces = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let hard_end = (start + size).min(chars.len());
        let end = if hard_end == chars.len() {
            hard_end
        } else {
            chars[start + size / 2..hard_end]
                .iter()
                .rposition(|c| c.is_whitespace())
                .map_or(hard_end, |p| start + size / 2 + p + 1)
        };
        let piece = chars[start..end].iter().collect::<String>();
        if !piece.trim().is_empty() {
            pieces.push(piece.trim().to_string());
        }
        if end == chars.len() {
            break;
        }
        start = end.saturating_sub(overlap).max(start + 1);
    }
    pieces
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use common::Chunk;

    use super::{ChunkingConfig, SourceRecord, read_jsonl, records_to_chunks, split_text};
    use crate::error::IndexError;

    fn record(qid: &str, answer: &str) -> SourceRecord {
        SourceRecord {
            qid: qid.to_string(),
            component: "hive".to_string(),
            tags: vec!["metastore".to_string(), "timeout".to_string()],
            score: 4,
            accepted: true,
            title: "Metastore timeout".to_string(),
            question: "Why does the metastore time out?".to_string(),
            answer: answer.to_string(),
            chunk_index: None,
            content: None,
        }
    }

    #[test]
    fn renders_labelled_passage() {
        let text = record("q1", "Raise hive.metastore.client.socket.timeout").render();
        assert!(text.starts_with("[Component] hive\n[Tags] metastore, timeout\n[Title] Metastore timeout"));
        assert!(text.contains("Answer:\nRaise hive.metastore.client.socket.timeout"));
    }

    #[test]
    fn short_records_become_single_chunks() {
        let chunks = records_to_chunks(&[record("q1", "short")], ChunkingConfig::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].meta.chunk_index, 0);
        assert_eq!(chunks[0].meta.relevance_score, 4);
    }

    #[test]
    fn long_records_split_with_sequential_indexes() {
        let answer = "word ".repeat(400);
        let chunks = records_to_chunks(
            &[record("q9", &answer)],
            ChunkingConfig {
                chunk_size: 300,
                chunk_overlap: 50,
            },
        );
        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.meta.chunk_index, i);
            assert!(chunk.content.chars().count() <= 300);
        }
    }

    #[test]
    fn pre_chunked_records_pass_through() {
        let mut r = record("q2", "ignored");
        r.chunk_index = Some(3);
        r.content = Some("already chunked".to_string());
        let chunks = records_to_chunks(&[r], ChunkingConfig::default());
        assert_eq!(chunks[0].meta.chunk_index, 3);
        assert_eq!(chunks[0].content, "already chunked");
    }

    #[test]
    fn windowed_records_number_after_pass_through_chunks() {
        let mut pre = record("q5", "ignored");
        pre.chunk_index = Some(0);
        pre.content = Some("pre-chunked part".to_string());
        let windowed = record("q5", "short answer");
        let other = record("q6", "short answer");

        let chunks = records_to_chunks(&[windowed, pre, other], ChunkingConfig::default());
        let idents = chunks
            .iter()
            .map(|c| (c.meta.source_id.as_str(), c.meta.chunk_index))
            .collect::<Vec<_>>();
        assert_eq!(idents, vec![("q5", 1), ("q5", 0), ("q6", 0)]);

        let keys = chunks.iter().map(Chunk::fusion_key).collect::<std::collections::HashSet<_>>();
        assert_eq!(keys.len(), chunks.len());
    }

    #[test]
    fn split_always_terminates_on_unbroken_text() {
        let text = "x".repeat(1000);
        let pieces = split_text(
            &text,
            ChunkingConfig {
                chunk_size: 100,
                chunk_overlap: 20,
            },
        );
        assert!(pieces.iter().all(|p| p.len() <= 100));
        assert!(pieces.len() >= 10);
    }

    #[test]
    fn reads_jsonl_and_reports_bad_line() {
        let mut file = tempfile::NamedTempFile::new().expect("tmp");
        writeln!(file, r#"{{"qid":"1","component":"kafka","title":"lag"}}"#).expect("write");
        writeln!(file).expect("write");
        writeln!(file, "{{not json").expect("write");

        let err = read_jsonl(file.path()).expect_err("bad line");
        assert!(matches!(err, IndexError::Record { line: 3, .. }));
    }
}
