use std::sync::LazyLock;

use regex::Regex;

/// Splits text into index terms. Index build and query time must share one implementation,
/// which is why the lexical index persists `ID` and refuses to load under another tokenizer.
pub trait TextTokenizer: Send + Sync {
    const ID: &'static str;

    fn tokenize(&self, text: &str) -> Vec<String>;
}

// Identifier runs stay whole (`spark.sql.shuffle.partitions`, `/var/log/hive`); every CJK
// ideograph becomes its own term.
static TOKEN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[a-z0-9_.#/\-]+|[\x{4e00}-\x{9fff}]").expect("token pattern compiles")
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DefaultTokenizer;

impl TextTokenizer for DefaultTokenizer {
    const ID: &'static str = "sop-rag/lower-ident-cjk/v1";

    fn tokenize(&self, text: &str) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }
        let lowered = text.to_lowercase();
        TOKEN_PATTERN
            .find_iter(&lowered)
            .map(|m| m.as_str().to_string())
            .collect()
    }
}
