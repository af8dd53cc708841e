use std::collections::BinaryHeap;

use roaring::RoaringBitmap;

use crate::core::error::Result;
use crate::core::types::{DocNr, MAX_WEIGHT};
use crate::index::btree::BTree;
use crate::query::accumulator::Accumulator;

/// Where per-document cosine norms come from at query time.
pub trait DocWeightSource {
    fn doc_weight(&self, doc: DocNr) -> f32;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankedHit {
    pub doc: DocNr,
    pub rank: f32,
}

struct HeapHit(RankedHit);

impl PartialEq for HeapHit {
    fn eq(&self, other: &Self) -> bool {
        self.0.rank == other.0.rank
    }
}
impl Eq for HeapHit {}
impl PartialOrd for HeapHit {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapHit {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // reversed: BinaryHeap pops the lowest-ranked hit first
        other.0.rank.total_cmp(&self.0.rank)
    }
}

const ADD_FACTOR: f32 = 0.007;
const INSERT_FACTOR: f32 = 0.12;

/// Smax-truncated accumulator scoring with cosine normalization over the
/// precomputed document weights.
pub fn ranked_search(
    fulltext: &BTree,
    weights: &dyn DocWeightSource,
    max_doc_nr: DocNr,
    query_terms: &[String],
    filter: Option<&RoaringBitmap>,
    all_terms_required: bool,
    report_limit: usize,
) -> Result<Vec<RankedHit>> {
    if report_limit == 0 || query_terms.is_empty() || max_doc_nr == 0 {
        return Ok(Vec::new());
    }
    let max_d = max_doc_nr as f32;

    // collect unique terms with occurrence counts and their idf
    struct TermPlan {
        payload: crate::index::btree::Payload,
        idf: f32,
        wq: f32,
    }

    let mut plans: Vec<(String, u32)> = Vec::new();
    for term in query_terms {
        match plans.iter_mut().find(|(t, _)| t == term) {
            Some((_, occurrences)) => *occurrences += 1,
            None => plans.push((term.clone(), 1)),
        }
    }

    let mut terms: Vec<TermPlan> = Vec::new();
    let mut found_all_terms = true;
    for (term, occurrences) in plans {
        match fulltext.find(&term)? {
            Some(payload) => {
                let df = payload.doc_count().max(1);
                let idf = (1.0 + max_d / df as f32).ln();
                terms.push(TermPlan {
                    payload,
                    idf,
                    wq: MAX_WEIGHT as f32 * idf * occurrences as f32,
                });
            }
            None => found_all_terms = false,
        }
    }

    if terms.is_empty() || (all_terms_required && !found_all_terms) {
        return Ok(Vec::new());
    }

    terms.sort_by(|a, b| b.wq.total_cmp(&a.wq));
    // keep it civil
    if terms.len() > 100 {
        terms.truncate(25);
    }

    let term_count = terms.len() as u32;
    let first_wq = terms[0].wq;
    let mut query_weight = 0.0f32;
    let mut s_max = 0.0f32;
    let mut accumulator = Accumulator::new(max_doc_nr);

    for term in &terms {
        if 100.0 * term.wq < first_wq {
            break;
        }

        let s_add = ADD_FACTOR * s_max;
        let s_ins = INSERT_FACTOR * s_max;
        let f_add = (s_add / (term.wq * term.wq)).min(255.0) as u8;
        let f_ins = (s_ins / (term.wq * term.wq)).min(255.0) as u8;

        query_weight += term.wq * term.wq;

        let mut postings = fulltext.weighted_iterator(&term.payload)?;
        while let Some((doc, weight)) = postings.next_posting()? {
            if weight < f_add {
                continue;
            }
            if weight >= f_ins || accumulator.get(doc) > 0.0 {
                let score = term.idf * weight as f32 * term.wq;
                let total = accumulator.add(doc, score);
                if total > s_max {
                    s_max = total;
                }
            }
        }
    }

    let query_weight = query_weight.sqrt();
    let min_term_count = if all_terms_required { term_count } else { 0 };
    let mut docs = accumulator.collect(min_term_count);

    if let Some(filter) = filter {
        docs.retain(|d| filter.contains(*d));
    }

    let mut best: BinaryHeap<HeapHit> = BinaryHeap::with_capacity(report_limit.min(docs.len()) + 1);
    for doc in docs {
        let doc_weight = weights.doc_weight(doc);
        if doc_weight <= 0.0 {
            continue;
        }
        let rank = accumulator.get(doc) / (doc_weight * query_weight);
        if best.len() < report_limit {
            best.push(HeapHit(RankedHit { doc, rank }));
        } else if let Some(worst) = best.peek() {
            if worst.0.rank < rank {
                best.pop();
                best.push(HeapHit(RankedHit { doc, rank }));
            }
        }
    }

    let mut hits: Vec<RankedHit> = best.into_iter().map(|h| h.0).collect();
    hits.sort_by(|a, b| b.rank.total_cmp(&a.rank));
    Ok(hits)
}

/// Walk the whole weighted index once and accumulate the squared
/// idf-scaled weights per document: `docWeight[d] = √Σ (idf·w)²`.
pub fn calculate_document_weights(fulltext: &BTree, max_doc_nr: DocNr) -> Result<Vec<f32>> {
    let max_d = max_doc_nr as f32;
    let mut weights = vec![0.0f32; max_doc_nr as usize + 1];

    let mut iter = fulltext.iter_from(None)?;
    while let Some((_, payload)) = iter.next_entry()? {
        let df = payload.doc_count().max(1);
        let idf = (1.0 + max_d / df as f32).ln();
        let mut postings = fulltext.weighted_iterator(&payload)?;
        while let Some((doc, weight)) = postings.next_posting()? {
            let w = idf * weight as f32;
            weights[doc as usize] += w * w;
        }
    }

    for w in &mut weights {
        *w = w.sqrt();
    }
    Ok(weights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::core::types::IndexType;
    use crate::io::cache::PageCache;
    use crate::io::file::OpenMode;
    use crate::lexicon::Lexicon;

    struct SliceWeights(Vec<f32>);

    impl DocWeightSource for SliceWeights {
        fn doc_weight(&self, doc: DocNr) -> f32 {
            self.0[doc as usize]
        }
    }

    /// docs: "alpha beta", "beta gamma", "alpha gamma delta"
    fn build_fulltext(dir: &tempfile::TempDir) -> BTree {
        let lexicon = Arc::new(Lexicon::new());
        let tree = BTree::open(
            dir.path().join("full-text.index"),
            OpenMode::ReadWrite,
            PageCache::new(),
            Some(IndexType::CharWeighted),
        )
        .unwrap();
        tree.set_batch_mode(lexicon.clone()).unwrap();

        let postings: &[(&str, &[(u32, u8)])] = &[
            ("alpha", &[(1, 255), (3, 255)]),
            ("beta", &[(1, 255), (2, 255)]),
            ("gamma", &[(2, 255), (3, 255)]),
            ("delta", &[(3, 255)]),
        ];
        for (term, docs) in postings {
            let id = lexicon.store(term.as_bytes()).unwrap();
            tree.batch_insert_weighted(id, docs).unwrap();
        }
        tree.finish_batch().unwrap();
        tree
    }

    fn weights_for(tree: &BTree) -> SliceWeights {
        SliceWeights(calculate_document_weights(tree, 3).unwrap())
    }

    #[test]
    fn single_term_hits() {
        let dir = tempfile::tempdir().unwrap();
        let tree = build_fulltext(&dir);
        let weights = weights_for(&tree);

        let hits = ranked_search(&tree, &weights, 3, &["beta".into()], None, false, 10).unwrap();
        let mut docs: Vec<u32> = hits.iter().map(|h| h.doc).collect();
        docs.sort_unstable();
        assert_eq!(docs, vec![1, 2]);
        for h in &hits {
            assert!(h.rank > 0.0);
        }
    }

    #[test]
    fn all_terms_required() {
        let dir = tempfile::tempdir().unwrap();
        let tree = build_fulltext(&dir);
        let weights = weights_for(&tree);

        let hits =
            ranked_search(&tree, &weights, 3, &["alpha".into(), "gamma".into()], None, true, 10)
                .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc, 3);

        // a missing term empties the result when every term must match
        let hits =
            ranked_search(&tree, &weights, 3, &["alpha".into(), "absent".into()], None, true, 10)
                .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn filter_restricts_hits() {
        let dir = tempfile::tempdir().unwrap();
        let tree = build_fulltext(&dir);
        let weights = weights_for(&tree);

        let mut filter = RoaringBitmap::new();
        filter.insert(2);
        let hits =
            ranked_search(&tree, &weights, 3, &["beta".into()], Some(&filter), false, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc, 2);
    }

    #[test]
    fn limit_keeps_best() {
        let dir = tempfile::tempdir().unwrap();
        let tree = build_fulltext(&dir);
        let weights = weights_for(&tree);

        let hits = ranked_search(
            &tree,
            &weights,
            3,
            &["alpha".into(), "beta".into(), "gamma".into(), "delta".into()],
            None,
            false,
            2,
        )
        .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].rank >= hits[1].rank);
    }

    #[test]
    fn empty_query_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let tree = build_fulltext(&dir);
        let weights = weights_for(&tree);
        assert!(ranked_search(&tree, &weights, 3, &[], None, false, 10).unwrap().is_empty());
    }

    #[test]
    fn document_weights_match_definition() {
        let dir = tempfile::tempdir().unwrap();
        let tree = build_fulltext(&dir);

        let weights = calculate_document_weights(&tree, 3).unwrap();
        for doc in 1..=3 {
            assert!(weights[doc] > 0.0);
        }

        // doc 1 holds alpha and beta, both df=2
        let idf = (1.0f32 + 3.0 / 2.0).ln();
        let w = idf * 255.0;
        let expected = (2.0 * w * w).sqrt();
        assert!((weights[1] - expected).abs() < 1e-3);
    }
}
