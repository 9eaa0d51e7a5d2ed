use ahash::AHashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredId {
    pub id: String,
    pub score: f64,
}

/// Reciprocal Rank Fusion of a dense and a sparse ranking.
///
/// Each occurrence at 1-based `rank` contributes `1 / (rank + c)`. The result is sorted by
/// fused score, descending. Exact ties keep first-seen order, scanning `dense_ids` before
/// `sparse_ids`, so the output is reproducible for equal inputs.
pub fn rrf_fuse(dense_ids: &[String], sparse_ids: &[String], c: f64) -> Vec<ScoredId> {
    let mut slots: AHashMap<&str, usize> = AHashMap::new();
    let mut fused: Vec<ScoredId> = Vec::new();

    for ids in [dense_ids, sparse_ids] {
        for (rank, id) in ids.iter().enumerate() {
            let rr = 1.0 / ((rank + 1) as f64 + c);
            let slot = *slots.entry(id.as_str()).or_insert_with(|| {
                fused.push(ScoredId {
                    id: id.clone(),
                    score: 0.0,
                });
                fused.len() - 1
            });
            fused[slot].score += rr;
        }
    }

    // stable: equal scores stay in first-seen order
    fused.sort_by(|a, b| b.score.total_cmp(&a.score));
    fused
}
