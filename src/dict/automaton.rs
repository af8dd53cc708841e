use std::collections::BinaryHeap;
use std::path::Path;

use crate::analysis::tokenizer::case_fold;
use crate::core::error::{Error, ErrorKind, Result};
use crate::dict::builder::Transition;

const MATCH_REWARD: i32 = 1;
const DELETE_PENALTY: i32 = -1;
const INSERT_PENALTY: i32 = -4;
const SUBSTITUTE_PENALTY: i32 = -2;
const TRANSPOSE_PENALTY: i32 = -2;

const MAX_SCORE_TABLE_SIZE: usize = 20;
const MAX_EDITS: u32 = 2;
const MAX_SCORE_DISTANCE: i32 = 12;

const MAX_COMPLETIONS: usize = 100;

/// The loaded spelling automaton: the transition array built by
/// `DictionaryBuilder`, read-only for the databank's lifetime.
#[derive(Debug)]
pub struct Dictionary {
    doc_count: u32,
    automaton: Vec<Transition>,
}

impl Dictionary {
    pub fn load(path: impl AsRef<Path>) -> Result<Dictionary> {
        let data = std::fs::read(path)?;
        if data.len() < 12 {
            return Err(Error::new(ErrorKind::Corrupt, "dictionary file too small"));
        }
        let doc_count = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let count = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;

        let expected = 8 + count * 8 + 4;
        if data.len() != expected {
            return Err(Error::new(ErrorKind::Corrupt, "dictionary length mismatch"));
        }
        // the legacy format lacks the trailing zero
        let trailer = u32::from_le_bytes(data[expected - 4..].try_into().unwrap());
        if trailer != 0 {
            return Err(Error::new(ErrorKind::Corrupt, "legacy dictionary format"));
        }

        let mut automaton = Vec::with_capacity(count);
        for i in 0..count {
            let off = 8 + i * 8;
            automaton.push(Transition(u64::from_le_bytes(data[off..off + 8].try_into().unwrap())));
        }
        if automaton.is_empty() {
            return Err(Error::new(ErrorKind::Corrupt, "empty dictionary"));
        }
        Ok(Dictionary { doc_count, automaton })
    }

    fn start_state(&self) -> u32 {
        self.automaton[self.automaton.len() - 1].dest()
    }

    /// Candidate corrections for a (possibly misspelled) word, best
    /// first, weighted by document frequency shifted down with edit
    /// distance.
    pub fn suggest_correction(&self, word: &str) -> Vec<(String, u16)> {
        let word = case_fold(word);
        let mut table = ScoreTable::new(&self.automaton);
        table.test(self.start_state(), 0, 0, Vec::new(), word.as_bytes());
        let scores = table.into_sorted();

        let mut corrections = Vec::new();
        if scores.is_empty() {
            return corrections;
        }

        let min_df = scores[0].df;
        let max_score = scores[0].score;
        let mut unique = std::collections::HashSet::new();

        for score in &scores {
            let term = String::from_utf8_lossy(&score.term).into_owned();
            if term == word || !unique.insert(term.clone()) {
                continue;
            }
            if score.df >= min_df {
                let distance = (score.score - max_score).abs();
                if distance > MAX_SCORE_DISTANCE {
                    break;
                }
                let weight = (score.df as u32) >> (2 * distance as u32);
                corrections.push((term, weight as u16));
            }
        }
        corrections
    }

    /// Completions of a prefix, most distinctive (rarest) first.
    pub fn suggest_search_terms(&self, word: &str) -> Vec<String> {
        let word = case_fold(word);
        let mut state = self.start_state();

        for &ch in word.as_bytes() {
            let mut s = state;
            loop {
                let t = self.automaton[s as usize];
                if t.attr() == ch {
                    state = t.dest();
                    break;
                }
                if t.last() {
                    return Vec::new();
                }
                s += 1;
            }
        }

        let mut heap: BinaryHeap<Suggestion> = BinaryHeap::new();
        self.extend_suggestion(state, word.as_bytes(), &mut heap);

        let mut suggestions: Vec<Suggestion> = heap.into_vec();
        suggestions.sort_by(|a, b| b.idf.total_cmp(&a.idf));
        suggestions
            .into_iter()
            .map(|s| String::from_utf8_lossy(&s.word).into_owned())
            .collect()
    }

    fn extend_suggestion(&self, state: u32, prefix: &[u8], heap: &mut BinaryHeap<Suggestion>) {
        let mut s = state;
        loop {
            let t = self.automaton[s as usize];
            let ch = t.attr();
            let mut word = prefix.to_vec();
            word.push(ch);

            if t.term() {
                let idf = (1.0 + self.doc_count as f64 / t.df().max(1) as f64).ln() as f32;
                heap.push(Suggestion { idf, word: word.clone() });
                if heap.len() > MAX_COMPLETIONS {
                    heap.pop();
                }
            }
            if t.dest() != 0 {
                self.extend_suggestion(t.dest(), &word, heap);
            }
            if t.last() {
                break;
            }
            s += 1;
        }
    }
}

struct Suggestion {
    idf: f32,
    word: Vec<u8>,
}

impl PartialEq for Suggestion {
    fn eq(&self, other: &Self) -> bool {
        self.idf == other.idf
    }
}
impl Eq for Suggestion {}
impl PartialOrd for Suggestion {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Suggestion {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // max-heap on idf: the least frequent completion is evicted
        // first when the heap overflows
        self.idf.total_cmp(&other.idf)
    }
}

#[derive(Clone)]
struct Score {
    term: Vec<u8>,
    score: i32,
    df: u16,
}

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score
    }
}
impl Eq for Score {}
impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Score {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // reversed: the heap keeps the lowest score on top
        other.score.cmp(&self.score)
    }
}

/// Bounded-edit-distance exploration of the automaton, keeping the 20
/// best-scoring terminal states.
struct ScoreTable<'a> {
    automaton: &'a [Transition],
    scores: BinaryHeap<Score>,
}

impl<'a> ScoreTable<'a> {
    fn new(automaton: &'a [Transition]) -> Self {
        ScoreTable { automaton, scores: BinaryHeap::new() }
    }

    fn min_score(&self) -> i32 {
        self.scores.peek().map(|s| s.score).unwrap_or(0)
    }

    fn add(&mut self, term: Vec<u8>, score: i32, df: u16) {
        if self.scores.len() >= MAX_SCORE_TABLE_SIZE {
            if score > self.min_score() {
                self.scores.pop();
                self.scores.push(Score { term, score, df });
            }
        } else {
            self.scores.push(Score { term, score, df });
        }
    }

    fn into_sorted(self) -> Vec<Score> {
        let mut scores = self.scores.into_vec();
        scores.sort_by(|a, b| b.score.cmp(&a.score));
        scores
    }

    fn test(&mut self, state: u32, score: i32, edits: u32, matched: Vec<u8>, word: &[u8]) {
        self.match_step(state, score, edits, matched.clone(), word);

        if score >= (self.min_score() - 3).max(0) && edits < 3 {
            self.delete(state, score, edits, matched.clone(), word);
            self.insert(state, score, edits, matched.clone(), word);
            self.transpose(state, score, edits, matched.clone(), word);
            self.substitute(state, score, edits, matched, word);
        }
    }

    fn match_step(&mut self, state: u32, score: i32, edits: u32, mut matched: Vec<u8>, word: &[u8]) {
        let first = match word.first() {
            Some(&c) => c,
            None => return,
        };

        let mut s = state;
        loop {
            let t = self.automaton[s as usize];
            if t.attr() == first {
                let score = score + MATCH_REWARD;
                matched.push(first);
                if t.term() && edits + (word.len() as u32 - 1) <= MAX_EDITS {
                    self.add(
                        matched.clone(),
                        score + (word.len() as i32 - 1) * DELETE_PENALTY,
                        t.df(),
                    );
                }
                self.test(t.dest(), score, edits, matched, &word[1..]);
                return;
            }
            if t.last() {
                return;
            }
            s += 1;
        }
    }

    fn delete(&mut self, state: u32, score: i32, edits: u32, matched: Vec<u8>, word: &[u8]) {
        let mut s = state;
        loop {
            let t = self.automaton[s as usize];
            let mut extended = matched.clone();
            extended.push(t.attr());

            if t.term() && edits + word.len() as u32 <= MAX_EDITS {
                self.add(extended.clone(), score + word.len() as i32 * DELETE_PENALTY, t.df());
            }
            self.test(t.dest(), score + DELETE_PENALTY, edits + 1, extended, word);

            if t.last() {
                break;
            }
            s += 1;
        }
    }

    fn insert(&mut self, state: u32, score: i32, edits: u32, matched: Vec<u8>, word: &[u8]) {
        if !word.is_empty() {
            self.test(state, score + INSERT_PENALTY, edits + 1, matched, &word[1..]);
        }
    }

    fn transpose(&mut self, state: u32, score: i32, edits: u32, matched: Vec<u8>, word: &[u8]) {
        if word.len() >= 2 {
            let mut swapped = Vec::with_capacity(word.len());
            swapped.push(word[1]);
            swapped.push(word[0]);
            swapped.extend_from_slice(&word[2..]);
            self.test(state, score + TRANSPOSE_PENALTY, edits + 1, matched, &swapped);
        }
    }

    fn substitute(&mut self, state: u32, score: i32, edits: u32, matched: Vec<u8>, word: &[u8]) {
        if word.is_empty() {
            return;
        }
        let mut s = state;
        loop {
            let t = self.automaton[s as usize];
            let mut extended = matched.clone();
            extended.push(t.attr());

            if t.term() && edits + word.len() as u32 <= MAX_EDITS {
                self.add(
                    extended.clone(),
                    score + SUBSTITUTE_PENALTY + (word.len() as i32 - 1) * DELETE_PENALTY,
                    t.df(),
                );
            }
            self.test(t.dest(), score + SUBSTITUTE_PENALTY, edits + 1, extended, &word[1..]);

            if t.last() {
                break;
            }
            s += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::builder::DictionaryBuilder;
    use crate::io::file::{FileHandle, OpenMode};

    fn build(dir: &tempfile::TempDir, words: &[(&str, u32)], doc_count: u32) -> Dictionary {
        let path = dir.path().join("full-text.dict");
        let file = FileHandle::open(&path, OpenMode::ReadWrite).unwrap();
        let mut builder = DictionaryBuilder::new(doc_count);
        let mut sorted: Vec<_> = words.to_vec();
        sorted.sort();
        for (word, df) in sorted {
            builder.visit(word.as_bytes(), df).unwrap();
        }
        builder.finish(doc_count, &file).unwrap();
        Dictionary::load(&path).unwrap()
    }

    #[test]
    fn correction_finds_transposition() {
        let dir = tempfile::tempdir().unwrap();
        let dict = build(
            &dir,
            &[("protein", 50), ("proteins", 40), ("proteome", 10), ("proton", 5)],
            100,
        );

        let corrections = dict.suggest_correction("protien");
        assert!(!corrections.is_empty());
        assert_eq!(corrections[0].0, "protein");
    }

    #[test]
    fn completion_orders_by_rarity() {
        let dir = tempfile::tempdir().unwrap();
        let dict = build(
            &dir,
            &[("protein", 50), ("proteins", 40), ("proteome", 10), ("proton", 5)],
            100,
        );

        let completions = dict.suggest_search_terms("prot");
        assert_eq!(completions, vec!["proton", "proteome", "proteins", "protein"]);
    }

    #[test]
    fn completion_of_unknown_prefix_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let dict = build(&dir, &[("protein", 50)], 100);
        assert!(dict.suggest_search_terms("xyz").is_empty());
    }

    #[test]
    fn legacy_format_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("full-text.dict");
        let file = FileHandle::open(&path, OpenMode::ReadWrite).unwrap();
        let mut builder = DictionaryBuilder::new(100);
        builder.visit(b"protein", 50).unwrap();
        builder.finish(100, &file).unwrap();

        // strip the trailing format marker
        let size = file.size();
        file.truncate(size - 4).unwrap();
        let err = Dictionary::load(&path).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Corrupt);
    }

    #[test]
    fn exact_word_is_not_its_own_correction() {
        let dir = tempfile::tempdir().unwrap();
        let dict = build(&dir, &[("protein", 50), ("proteins", 40)], 100);
        let corrections = dict.suggest_correction("protein");
        assert!(corrections.iter().all(|(t, _)| t != "protein"));
    }
}
