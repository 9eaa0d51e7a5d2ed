use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::Path,
};

use ahash::AHashMap;
use common::{Chunk, ScoredChunk};
use serde::{Deserialize, Serialize};

use crate::{
    error::IndexError,
    filter::AttributeFilter,
    storage::write_atomic,
    tokenize::{DefaultTokenizer, TextTokenizer},
};

pub const BM25_FORMAT: &str = "sop-rag/bm25";
pub const BM25_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bm25Params {
    pub k1: f64,
    pub b: f64,
    /// Fraction of the mean IDF that replaces negative IDF values.
    pub epsilon: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self {
            k1: 1.5,
            b: 0.75,
            epsilon: 0.25,
        }
    }
}

/// Keyword ranking over an attribute-filtered subset of the corpus.
pub trait LexicalScorer: Send + Sync {
    fn search(&self, query: &str, k: usize, filter: &AttributeFilter) -> Vec<ScoredChunk>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Okapi BM25 index with component and tag posting lists.
///
/// Statistics are computed once by [`Bm25Index::build_with`] and frozen; the index is
/// read-only afterwards and can be shared across threads without locking.
pub struct Bm25Index<T = DefaultTokenizer> {
    tokenizer: T,
    params: Bm25Params,
    chunks: Vec<Chunk>,
    corpus: Vec<Vec<String>>,
    term_freqs: Vec<AHashMap<String, u32>>,
    idf: BTreeMap<String, f64>,
    avgdl: f64,
    by_component: BTreeMap<String, BTreeSet<usize>>,
    by_tag: BTreeMap<String, BTreeSet<usize>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LexicalStats {
    pub documents: usize,
    pub vocabulary: usize,
    pub avgdl: f64,
    pub components: BTreeMap<String, usize>,
    pub tags: BTreeMap<String, usize>,
}

/// Everything an index holds apart from the tokenizer and the derived term frequencies.
struct Bm25Parts {
    params: Bm25Params,
    chunks: Vec<Chunk>,
    corpus: Vec<Vec<String>>,
    idf: BTreeMap<String, f64>,
    avgdl: f64,
    by_component: Postings,
    by_tag: Postings,
}

#[derive(Deserialize)]
struct Bm25Header {
    format: String,
    version: u32,
    tokenizer: String,
}

#[derive(Serialize)]
struct Bm25DocumentRef<'a> {
    format: &'static str,
    version: u32,
    tokenizer: &'static str,
    params: Bm25Params,
    chunks: &'a [Chunk],
    corpus: &'a [Vec<String>],
    stats: Bm25StatsRef<'a>,
    by_component: &'a BTreeMap<String, BTreeSet<usize>>,
    by_tag: &'a BTreeMap<String, BTreeSet<usize>>,
}

#[derive(Serialize)]
struct Bm25StatsRef<'a> {
    doc_count: usize,
    avgdl: f64,
    idf: &'a BTreeMap<String, f64>,
}

#[derive(Deserialize)]
struct Bm25Document {
    params: Bm25Params,
    chunks: Vec<Chunk>,
    corpus: Vec<Vec<String>>,
    stats: Bm25Stats,
    by_component: BTreeMap<String, BTreeSet<usize>>,
    by_tag: BTreeMap<String, BTreeSet<usize>>,
}

#[derive(Deserialize)]
struct Bm25Stats {
    doc_count: usize,
    avgdl: f64,
    idf: BTreeMap<String, f64>,
}

impl Bm25Index<DefaultTokenizer> {
    pub fn build(chunks: Vec<Chunk>, params: Bm25Params) -> Self {
        Self::build_with(chunks, DefaultTokenizer, params)
    }

    pub fn load(path: &Path) -> Result<Self, IndexError> {
        Self::load_with(path, DefaultTokenizer)
    }
}

impl<T: TextTokenizer> Bm25Index<T> {
    pub fn build_with(chunks: Vec<Chunk>, tokenizer: T, params: Bm25Params) -> Self {
        let corpus = chunks
            .iter()
            .map(|chunk| tokenizer.tokenize(&chunk.content))
            .collect::<Vec<_>>();
        let idf = frozen_idf(&corpus, params.epsilon);
        let avgdl = average_len(&corpus);
        let (by_component, by_tag) = postings(&chunks);
        tracing::debug!(
            chunks = chunks.len(),
            vocabulary = idf.len(),
            avgdl,
            "built bm25 index"
        );
        Self::assemble(
            tokenizer,
            Bm25Parts {
                params,
                chunks,
                corpus,
                idf,
                avgdl,
                by_component,
                by_tag,
            },
        )
    }

    fn assemble(tokenizer: T, parts: Bm25Parts) -> Self {
        let Bm25Parts {
            params,
            chunks,
            corpus,
            idf,
            avgdl,
            by_component,
            by_tag,
        } = parts;
        let term_freqs = corpus
            .iter()
            .map(|doc| {
                let mut tf = AHashMap::with_capacity(doc.len());
                for term in doc {
                    *tf.entry(term.clone()).or_insert(0u32) += 1;
                }
                tf
            })
            .collect();
        Self {
            tokenizer,
            params,
            chunks,
            corpus,
            term_freqs,
            idf,
            avgdl,
            by_component,
            by_tag,
        }
    }

    /// Writes the index as one JSON document, through a temp file and a rename.
    pub fn save(&self, path: &Path) -> Result<(), IndexError> {
        let doc = Bm25DocumentRef {
            format: BM25_FORMAT,
            version: BM25_VERSION,
            tokenizer: T::ID,
            params: self.params,
            chunks: &self.chunks,
            corpus: &self.corpus,
            stats: Bm25StatsRef {
                doc_count: self.chunks.len(),
                avgdl: self.avgdl,
                idf: &self.idf,
            },
            by_component: &self.by_component,
            by_tag: &self.by_tag,
        };
        let bytes = serde_json::to_vec(&doc).map_err(IndexError::Encode)?;
        write_atomic(path, &bytes)
    }

    pub fn load_with(path: &Path, tokenizer: T) -> Result<Self, IndexError> {
        let raw = fs::read_to_string(path).map_err(|source| IndexError::io(path, source))?;
        let decode = |source| IndexError::Decode {
            path: path.to_path_buf(),
            source,
        };

        let header = serde_json::from_str::<Bm25Header>(&raw).map_err(decode)?;
        if header.format != BM25_FORMAT {
            return Err(IndexError::Format {
                expected: BM25_FORMAT,
                found: header.format,
            });
        }
        if header.version != BM25_VERSION {
            return Err(IndexError::Version {
                found: header.version,
                supported: BM25_VERSION,
            });
        }
        if header.tokenizer != T::ID {
            return Err(IndexError::Tokenizer {
                expected: T::ID,
                found: header.tokenizer,
            });
        }

        let doc = serde_json::from_str::<Bm25Document>(&raw).map_err(decode)?;
        validate(&doc)?;
        tracing::info!(
            path = %path.display(),
            chunks = doc.chunks.len(),
            vocabulary = doc.stats.idf.len(),
            "loaded bm25 index"
        );
        Ok(Self::assemble(
            tokenizer,
            Bm25Parts {
                params: doc.params,
                chunks: doc.chunks,
                corpus: doc.corpus,
                idf: doc.stats.idf,
                avgdl: doc.stats.avgdl,
                by_component: doc.by_component,
                by_tag: doc.by_tag,
            },
        ))
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub const fn params(&self) -> Bm25Params {
        self.params
    }

    pub fn stats(&self) -> LexicalStats {
        let counts = |map: &BTreeMap<String, BTreeSet<usize>>| {
            map.iter()
                .map(|(k, v)| (k.clone(), v.len()))
                .collect::<BTreeMap<_, _>>()
        };
        LexicalStats {
            documents: self.chunks.len(),
            vocabulary: self.idf.len(),
            avgdl: self.avgdl,
            components: counts(&self.by_component),
            tags: counts(&self.by_tag),
        }
    }

    fn score(&self, pos: usize, query: &[String]) -> f64 {
        let Bm25Params { k1, b, .. } = self.params;
        let doc_len = self.corpus[pos].len() as f64;
        let len_ratio = if self.avgdl > 0.0 {
            doc_len / self.avgdl
        } else {
            0.0
        };
        let tf_map = &self.term_freqs[pos];

        query
            .iter()
            .map(|term| {
                let Some(idf) = self.idf.get(term) else {
                    return 0.0;
                };
                let tf = f64::from(tf_map.get(term).copied().unwrap_or(0));
                if tf == 0.0 {
                    return 0.0;
                }
                idf * (tf * (k1 + 1.0)) / (tf + k1 * (1.0 - b + b * len_ratio))
            })
            .sum()
    }

    /// Positions allowed by `filter`, or `None` when the whole corpus is eligible.
    fn candidates(&self, filter: &AttributeFilter) -> Option<BTreeSet<usize>> {
        let union = |map: &BTreeMap<String, BTreeSet<usize>>, keys: &[String]| {
            keys.iter()
                .filter_map(|key| map.get(key))
                .flatten()
                .copied()
                .collect::<BTreeSet<_>>()
        };
        let by_component =
            (!filter.components().is_empty()).then(|| union(&self.by_component, filter.components()));
        let by_tag = (!filter.tags().is_empty()).then(|| union(&self.by_tag, filter.tags()));

        match (by_component, by_tag) {
            (Some(c), Some(t)) => Some(c.intersection(&t).copied().collect()),
            (Some(only), None) | (None, Some(only)) => Some(only),
            (None, None) => None,
        }
    }
}

impl<T: TextTokenizer> LexicalScorer for Bm25Index<T> {
    fn search(&self, query: &str, k: usize, filter: &AttributeFilter) -> Vec<ScoredChunk> {
        let tokens = self.tokenizer.tokenize(query);
        if tokens.is_empty() || k == 0 {
            return Vec::new();
        }
        let positions = match self.candidates(filter) {
            Some(set) => set.into_iter().collect::<Vec<_>>(),
            None => (0..self.chunks.len()).collect(),
        };

        let mut scored = positions
            .into_iter()
            .map(|pos| (pos, self.score(pos, &tokens)))
            .filter(|(_, score)| *score > 0.0)
            .collect::<Vec<_>>();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);

        scored
            .into_iter()
            .map(|(pos, score)| ScoredChunk {
                chunk: self.chunks[pos].clone(),
                score,
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.chunks.len()
    }
}

fn frozen_idf(corpus: &[Vec<String>], epsilon: f64) -> BTreeMap<String, f64> {
    let mut doc_freq = BTreeMap::<&str, usize>::new();
    for doc in corpus {
        let unique = doc.iter().map(String::as_str).collect::<BTreeSet<_>>();
        for term in unique {
            *doc_freq.entry(term).or_default() += 1;
        }
    }

    let n = corpus.len() as f64;
    let mut idf = BTreeMap::new();
    let mut idf_sum = 0.0;
    let mut negative = Vec::new();
    for (term, df) in doc_freq {
        let df = df as f64;
        let value = (n - df + 0.5).ln() - (df + 0.5).ln();
        idf_sum += value;
        if value < 0.0 {
            negative.push(term);
        }
        idf.insert(term.to_string(), value);
    }

    if !idf.is_empty() {
        let floor = epsilon * idf_sum / idf.len() as f64;
        for term in negative {
            idf.insert(term.to_string(), floor);
        }
    }
    idf
}

fn average_len(corpus: &[Vec<String>]) -> f64 {
    if corpus.is_empty() {
        return 0.0;
    }
    let total = corpus.iter().map(Vec::len).sum::<usize>();
    total as f64 / corpus.len() as f64
}

type Postings = BTreeMap<String, BTreeSet<usize>>;

fn postings(chunks: &[Chunk]) -> (Postings, Postings) {
    let mut by_component = Postings::new();
    let mut by_tag = Postings::new();
    for (pos, chunk) in chunks.iter().enumerate() {
        let component = chunk.meta.component.trim().to_lowercase();
        if !component.is_empty() {
            by_component.entry(component).or_default().insert(pos);
        }
        for tag in &chunk.meta.tags {
            let tag = tag.trim().to_lowercase();
            if !tag.is_empty() {
                by_tag.entry(tag).or_default().insert(pos);
            }
        }
    }
    (by_component, by_tag)
}

fn validate(doc: &Bm25Document) -> Result<(), IndexError> {
    let n = doc.chunks.len();
    if doc.corpus.len() != n {
        return Err(IndexError::Corrupt(format!(
            "{} tokenized documents for {n} chunks",
            doc.corpus.len()
        )));
    }
    if doc.stats.doc_count != n {
        return Err(IndexError::Corrupt(format!(
            "stats describe {} documents, found {n}",
            doc.stats.doc_count
        )));
    }
    if let Some(term) = doc
        .corpus
        .iter()
        .flatten()
        .find(|term| !doc.stats.idf.contains_key(*term))
    {
        return Err(IndexError::Corrupt(format!("term `{term}` has no idf entry")));
    }
    let (by_component, by_tag) = postings(&doc.chunks);
    if by_component != doc.by_component {
        return Err(IndexError::Corrupt(
            "component postings disagree with chunks".to_string(),
        ));
    }
    if by_tag != doc.by_tag {
        return Err(IndexError::Corrupt(
            "tag postings disagree with chunks".to_string(),
        ));
    }
    Ok(())
}
