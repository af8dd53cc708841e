use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::Result;
use crate::core::types::{DocNr, MAX_WEIGHT};
use crate::batch::run_merger::{MergedStream, RunMerger};

/// One posting on its way to the index writers: a term occurrence in a
/// document and field, with the normalized weight and the optional
/// in-document locations.
#[derive(Debug, Serialize, Deserialize)]
pub struct BufferEntry {
    pub term: u32,
    pub doc: DocNr,
    pub ix: u8,
    pub weight: u8,
    pub idl: Option<Vec<u32>>,
}

impl PartialEq for BufferEntry {
    fn eq(&self, other: &Self) -> bool {
        self.term == other.term && self.doc == other.doc
    }
}

impl Eq for BufferEntry {}

impl PartialOrd for BufferEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BufferEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // (term, doc) only; entries of one pair keep producer order
        self.term
            .cmp(&other.term)
            .then_with(|| self.doc.cmp(&other.doc))
    }
}

/// Per-document buffer entries per run; the most important tuning knob
/// for indexing speed versus memory.
pub const BUFFER_ENTRY_COUNT: usize = 8_000_000;

struct DocWord {
    freq: u32,
    locations: Vec<u32>,
}

/// Collects term occurrences per document, normalizes frequencies to
/// weights on `flush_doc`, and feeds the entries into the external
/// sorter whose merged output drives all index writers.
pub struct FullTextIx {
    doc_words: BTreeMap<(u32, u8), DocWord>,
    doc_word_location: u32,
    uses_idl: [bool; 256],
    exclude_in_full_text: [bool; 256],
    merger: RunMerger<BufferEntry>,
}

impl FullTextIx {
    pub fn new(scratch_dir: impl AsRef<Path>) -> Self {
        FullTextIx::with_capacity(scratch_dir, BUFFER_ENTRY_COUNT)
    }

    pub fn with_capacity(scratch_dir: impl AsRef<Path>, capacity: usize) -> Self {
        FullTextIx {
            doc_words: BTreeMap::new(),
            doc_word_location: 1,
            uses_idl: [false; 256],
            exclude_in_full_text: [false; 256],
            merger: RunMerger::new(scratch_dir, capacity),
        }
    }

    pub fn set_uses_in_doc_location(&mut self, index_nr: u8) {
        self.uses_idl[index_nr as usize] = true;
    }

    pub fn uses_in_doc_location(&self, index_nr: u8) -> bool {
        self.uses_idl[index_nr as usize]
    }

    pub fn set_exclude_in_full_text(&mut self, index_nr: u8) {
        self.exclude_in_full_text[index_nr as usize] = true;
    }

    pub fn excludes_in_full_text(&self, index_nr: u8) -> bool {
        self.exclude_in_full_text[index_nr as usize]
    }

    pub fn full_text_exclusions(&self) -> [bool; 256] {
        self.exclude_in_full_text
    }

    /// Register one token occurrence. Word 0 (the stop sentinel) still
    /// advances the location counter.
    pub fn add_word(&mut self, index_nr: u8, word: u32) {
        self.doc_word_location += 1;
        if word == 0 {
            return;
        }

        let entry = self
            .doc_words
            .entry((word, index_nr))
            .or_insert_with(|| DocWord { freq: 0, locations: Vec::new() });
        entry.freq += 1;
        if self.uses_idl[index_nr as usize] {
            entry.locations.push(self.doc_word_location);
        }
    }

    /// Normalize the collected frequencies to weights in [1..MAX_WEIGHT]
    /// and push this document's entries into the sort runs.
    pub fn flush_doc(&mut self, doc_nr: DocNr) -> Result<()> {
        let max_freq = self.doc_words.values().map(|w| w.freq).max().unwrap_or(1);

        let words = std::mem::take(&mut self.doc_words);
        for ((word, ix), doc_word) in words {
            if doc_word.freq == 0 {
                continue;
            }
            let weight = ((doc_word.freq * MAX_WEIGHT) / max_freq).max(1) as u8;
            self.merger.push(BufferEntry {
                term: word,
                doc: doc_nr,
                ix,
                weight,
                idl: if self.uses_idl[ix as usize] {
                    Some(doc_word.locations)
                } else {
                    None
                },
            })?;
        }

        self.doc_word_location = 1;
        Ok(())
    }

    pub fn entry_count(&self) -> u64 {
        self.merger.len()
    }

    /// Flush the pending run and return the globally sorted entry
    /// stream.
    pub fn finish(self) -> Result<MergedStream<BufferEntry>> {
        self.merger.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_normalize_to_max() {
        let dir = tempfile::tempdir().unwrap();
        let mut ix = FullTextIx::with_capacity(dir.path(), 64);

        // word 1 three times, word 2 once
        ix.add_word(1, 1);
        ix.add_word(1, 1);
        ix.add_word(1, 1);
        ix.add_word(1, 2);
        ix.flush_doc(1).unwrap();

        let mut stream = ix.finish().unwrap();
        let first = stream.next().unwrap().unwrap();
        let second = stream.next().unwrap().unwrap();
        assert!(stream.next().unwrap().is_none());

        assert_eq!((first.term, first.weight), (1, MAX_WEIGHT as u8));
        assert_eq!(second.term, 2);
        assert_eq!(second.weight as u32, MAX_WEIGHT / 3);
    }

    #[test]
    fn entries_come_back_term_then_doc_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let mut ix = FullTextIx::with_capacity(dir.path(), 4);

        for doc in 1..=20u32 {
            ix.add_word(1, doc % 5 + 1);
            ix.add_word(1, 3);
            ix.flush_doc(doc).unwrap();
        }

        let mut stream = ix.finish().unwrap();
        let mut last = (0u32, 0u32);
        while let Some(e) = stream.next().unwrap() {
            assert!((e.term, e.doc) >= last);
            last = (e.term, e.doc);
        }
    }

    #[test]
    fn idl_locations_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut ix = FullTextIx::with_capacity(dir.path(), 64);
        ix.set_uses_in_doc_location(2);

        ix.add_word(2, 7); // location 2
        ix.add_word(2, 9); // location 3
        ix.add_word(2, 7); // location 4
        ix.flush_doc(1).unwrap();

        let mut stream = ix.finish().unwrap();
        let mut by_term = std::collections::HashMap::new();
        while let Some(e) = stream.next().unwrap() {
            by_term.insert(e.term, e.idl.clone());
        }
        assert_eq!(by_term[&7], Some(vec![2, 4]));
        assert_eq!(by_term[&9], Some(vec![3]));
    }

    #[test]
    fn stop_words_only_advance_location() {
        let dir = tempfile::tempdir().unwrap();
        let mut ix = FullTextIx::with_capacity(dir.path(), 64);
        ix.set_uses_in_doc_location(1);

        ix.add_word(1, 0);
        ix.add_word(1, 5);
        ix.flush_doc(1).unwrap();

        let mut stream = ix.finish().unwrap();
        let e = stream.next().unwrap().unwrap();
        assert_eq!(e.term, 5);
        assert_eq!(e.idl, Some(vec![3]));
    }
}
