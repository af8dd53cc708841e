use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::DocNr;
use crate::batch::run_merger::RunMerger;
use crate::index::btree::BTree;
use crate::index::comparator::float_to_key;
use crate::io::bits::{write_array, OBitStream};
use crate::io::file::FileHandle;

/// What a field writer does with a finished term.
enum WriterKind {
    /// Plain multi index (string values, links); excluded from the
    /// full-text field.
    Multi,
    /// Full-text field index with an IDL sidecar file.
    MultiIdl { idl_file: FileHandle },
    /// The synthetic weighted full-text index.
    Weighted,
}

enum FlushedTerm {
    Multi { term: u32, docs: Vec<DocNr> },
    MultiIdl { term: u32, docs: Vec<DocNr>, idl_offset: u64 },
    Weighted { term: u32, postings: Vec<(DocNr, u8)> },
}

/// Consumes the per-term posting runs of the merged full-text stream for
/// one named index. Postings of one term are accumulated between term
/// boundaries; a background flush thread feeds them to the tree's batch
/// builder.
pub struct FieldWriter {
    kind: WriterKind,
    index: Arc<BTree>,
    last_term: u32,
    last_doc: DocNr,
    docs: Vec<DocNr>,
    postings: Vec<(DocNr, u8)>,
    idl_bits: OBitStream,
    flush_tx: Option<Sender<FlushedTerm>>,
    flush_thread: Option<JoinHandle<()>>,
    error: Arc<Mutex<Option<Error>>>,
}

impl FieldWriter {
    pub fn new_multi(index: Arc<BTree>) -> FieldWriter {
        FieldWriter::spawn(WriterKind::Multi, index)
    }

    pub fn new_multi_idl(index: Arc<BTree>, idl_file: FileHandle) -> FieldWriter {
        FieldWriter::spawn(WriterKind::MultiIdl { idl_file }, index)
    }

    pub fn new_weighted(index: Arc<BTree>) -> FieldWriter {
        FieldWriter::spawn(WriterKind::Weighted, index)
    }

    fn spawn(kind: WriterKind, index: Arc<BTree>) -> FieldWriter {
        let (flush_tx, flush_rx) = bounded::<FlushedTerm>(100);
        let error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));

        let thread_index = index.clone();
        let thread_error = error.clone();
        let flush_thread = std::thread::spawn(move || {
            for term in flush_rx.iter() {
                let outcome = match term {
                    FlushedTerm::Multi { term, docs } => thread_index.batch_insert_multi(term, &docs),
                    FlushedTerm::MultiIdl { term, docs, idl_offset } => {
                        thread_index.batch_insert_multi_idl(term, idl_offset, &docs)
                    }
                    FlushedTerm::Weighted { term, postings } => {
                        thread_index.batch_insert_weighted(term, &postings)
                    }
                };
                if let Err(e) = outcome {
                    let mut slot = thread_error.lock();
                    if slot.is_none() {
                        *slot = Some(e);
                    }
                    return;
                }
            }
        });

        FieldWriter {
            kind,
            index,
            last_term: 0,
            last_doc: 0,
            docs: Vec::new(),
            postings: Vec::new(),
            idl_bits: OBitStream::new(),
            flush_tx: Some(flush_tx),
            flush_thread: Some(flush_thread),
            error,
        }
    }

    pub fn index(&self) -> &Arc<BTree> {
        &self.index
    }

    fn check_error(&self) -> Result<()> {
        if let Some(e) = self.error.lock().take() {
            return Err(e);
        }
        Ok(())
    }

    /// Feed one posting; postings arrive grouped by term, in doc order.
    pub fn add_doc_term(
        &mut self,
        doc: DocNr,
        term: u32,
        weight: u8,
        idl: Option<&[u32]>,
    ) -> Result<()> {
        if term != self.last_term && !self.is_empty() {
            self.flush_term()?;
        }
        debug_assert!(term != self.last_term || doc > self.last_doc || self.is_empty());
        self.last_term = term;
        self.last_doc = doc;

        match &self.kind {
            WriterKind::Multi => self.docs.push(doc),
            WriterKind::MultiIdl { .. } => {
                self.docs.push(doc);
                if let Some(locations) = idl {
                    write_array(&mut self.idl_bits, locations)?;
                }
            }
            WriterKind::Weighted => self.postings.push((doc, weight.max(1))),
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.docs.is_empty() && self.postings.is_empty()
    }

    fn flush_term(&mut self) -> Result<()> {
        self.check_error()?;
        let term = self.last_term;
        let flushed = match &self.kind {
            WriterKind::Multi => FlushedTerm::Multi { term, docs: std::mem::take(&mut self.docs) },
            WriterKind::MultiIdl { idl_file } => {
                self.idl_bits.sync()?;
                let idl_offset = idl_file.append(self.idl_bits.bytes())?;
                self.idl_bits.clear();
                FlushedTerm::MultiIdl { term, docs: std::mem::take(&mut self.docs), idl_offset }
            }
            WriterKind::Weighted => {
                FlushedTerm::Weighted { term, postings: std::mem::take(&mut self.postings) }
            }
        };
        if let Some(tx) = &self.flush_tx {
            tx.send(flushed)
                .map_err(|_| Error::new(ErrorKind::Io, "index flush thread gone"))?;
        }
        self.last_doc = 0;
        Ok(())
    }

    /// Flush the trailing term and stop the flush thread.
    pub fn finish_terms(&mut self) -> Result<()> {
        if !self.is_empty() {
            self.flush_term()?;
        }
        drop(self.flush_tx.take());
        if let Some(thread) = self.flush_thread.take() {
            let _ = thread.join();
        }
        self.check_error()
    }
}

impl Drop for FieldWriter {
    fn drop(&mut self) {
        drop(self.flush_tx.take());
        if let Some(thread) = self.flush_thread.take() {
            let _ = thread.join();
        }
    }
}

/// Sortable record of a typed value index run.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct ValueEntry {
    // numbers as i64, floats via their order-preserving bit pattern
    pub value: ValueKey,
    pub doc: DocNr,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub enum ValueKey {
    Number(i64),
    Float(u64),
}

/// Run-sorted builder for a typed multi value index (number or float):
/// values are pushed unordered during the batch, sorted externally, and
/// inserted per distinct value with a deduplicated doc list on finish.
pub struct ValueIndexer {
    index: Arc<BTree>,
    merger: RunMerger<ValueEntry>,
}

pub const VALUE_RUN_COUNT: usize = 1024 * 1024;

impl ValueIndexer {
    pub fn new(index: Arc<BTree>, scratch_dir: impl AsRef<std::path::Path>, capacity: usize) -> Self {
        ValueIndexer { index, merger: RunMerger::new(scratch_dir, capacity) }
    }

    pub fn index(&self) -> &Arc<BTree> {
        &self.index
    }

    pub fn add_number(&mut self, value: &str, doc: DocNr) -> Result<()> {
        let value: i64 = value
            .trim()
            .parse()
            .map_err(|_| Error::new(ErrorKind::Parse, format!("not a number: {}", value)))?;
        self.merger.push(ValueEntry { value: ValueKey::Number(value), doc })
    }

    pub fn add_float(&mut self, value: f64, doc: DocNr) -> Result<()> {
        let ordered = u64::from_be_bytes(float_to_key(value));
        self.merger.push(ValueEntry { value: ValueKey::Float(ordered), doc })
    }

    /// Merge the runs and insert one posting list per distinct value.
    pub fn finish(self) -> Result<()> {
        let index = self.index;
        let mut stream = self.merger.finish()?;

        let mut current: Option<(ValueKey, Vec<DocNr>)> = None;
        loop {
            let next = stream.next()?;
            let boundary = match (&current, &next) {
                (Some((value, _)), Some(entry)) => *value != entry.value,
                (Some(_), None) => true,
                _ => false,
            };

            if boundary {
                let (value, mut docs) = current.take().unwrap();
                docs.sort_unstable();
                docs.dedup();
                match value {
                    ValueKey::Number(n) => index.insert_multi(&n.to_string(), &docs)?,
                    ValueKey::Float(bits) => {
                        index.insert_multi_key(&bits.to_be_bytes(), &docs)?
                    }
                }
            }

            match next {
                Some(entry) => match &mut current {
                    Some((_, docs)) => docs.push(entry.doc),
                    None => current = Some((entry.value, vec![entry.doc])),
                },
                None => break,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::IndexType;
    use crate::io::cache::PageCache;
    use crate::io::file::OpenMode;
    use crate::lexicon::Lexicon;

    fn tree(dir: &tempfile::TempDir, name: &str, t: IndexType) -> Arc<BTree> {
        Arc::new(
            BTree::open(dir.path().join(name), OpenMode::ReadWrite, PageCache::new(), Some(t))
                .unwrap(),
        )
    }

    #[test]
    fn multi_writer_groups_terms() {
        let dir = tempfile::tempdir().unwrap();
        let lexicon = Arc::new(Lexicon::new());
        let t1 = lexicon.store(b"alpha").unwrap();
        let t2 = lexicon.store(b"beta").unwrap();

        let index = tree(&dir, "kw.index", IndexType::CharMulti);
        index.set_batch_mode(lexicon).unwrap();

        let mut writer = FieldWriter::new_multi(index.clone());
        writer.add_doc_term(1, t1, 1, None).unwrap();
        writer.add_doc_term(3, t1, 1, None).unwrap();
        writer.add_doc_term(2, t2, 1, None).unwrap();
        writer.finish_terms().unwrap();
        index.finish_batch().unwrap();

        let p = index.find("alpha").unwrap().unwrap();
        assert_eq!(index.posting_iterator(&p).unwrap().collect_docs().unwrap(), vec![1, 3]);
        let p = index.find("beta").unwrap().unwrap();
        assert_eq!(index.posting_iterator(&p).unwrap().collect_docs().unwrap(), vec![2]);
    }

    #[test]
    fn weighted_writer_preserves_weights() {
        let dir = tempfile::tempdir().unwrap();
        let lexicon = Arc::new(Lexicon::new());
        let t1 = lexicon.store(b"gene").unwrap();

        let index = tree(&dir, "full-text.index", IndexType::CharWeighted);
        index.set_batch_mode(lexicon).unwrap();

        let mut writer = FieldWriter::new_weighted(index.clone());
        writer.add_doc_term(1, t1, 255, None).unwrap();
        writer.add_doc_term(2, t1, 0, None).unwrap(); // clamped up to 1
        writer.finish_terms().unwrap();
        index.finish_batch().unwrap();

        let p = index.find("gene").unwrap().unwrap();
        let mut iter = index.weighted_iterator(&p).unwrap();
        assert_eq!(iter.next_posting().unwrap(), Some((1, 255)));
        assert_eq!(iter.next_posting().unwrap(), Some((2, 1)));
        assert_eq!(iter.next_posting().unwrap(), None);
    }

    #[test]
    fn idl_writer_stores_locations() {
        let dir = tempfile::tempdir().unwrap();
        let lexicon = Arc::new(Lexicon::new());
        let t1 = lexicon.store(b"actin").unwrap();

        let idl_file = FileHandle::open(dir.path().join("text.idl"), OpenMode::ReadWrite).unwrap();
        let index = tree(&dir, "text.index", IndexType::CharMultiIdl);
        index.set_batch_mode(lexicon).unwrap();

        let mut writer = FieldWriter::new_multi_idl(index.clone(), idl_file.clone());
        writer.add_doc_term(1, t1, 1, Some(&[2, 5, 9])).unwrap();
        writer.add_doc_term(4, t1, 1, Some(&[3])).unwrap();
        writer.finish_terms().unwrap();
        index.finish_batch().unwrap();

        let p = index.find("actin").unwrap().unwrap();
        assert_eq!(index.posting_iterator(&p).unwrap().collect_docs().unwrap(), vec![1, 4]);
        let mut idl = index.idl_iterator(&idl_file, &p).unwrap();
        assert_eq!(idl.next_locations().unwrap(), vec![2, 5, 9]);
        assert_eq!(idl.next_locations().unwrap(), vec![3]);
    }

    #[test]
    fn value_indexer_dedups_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let index = tree(&dir, "year.index", IndexType::NumberMulti);

        let mut values = ValueIndexer::new(index.clone(), dir.path(), 4);
        values.add_number("2001", 2).unwrap();
        values.add_number("1999", 1).unwrap();
        values.add_number("2001", 2).unwrap();
        values.add_number("2001", 9).unwrap();
        values.finish().unwrap();

        let p = index.find("2001").unwrap().unwrap();
        assert_eq!(index.posting_iterator(&p).unwrap().collect_docs().unwrap(), vec![2, 9]);
        let p = index.find("1999").unwrap().unwrap();
        assert_eq!(index.posting_iterator(&p).unwrap().collect_docs().unwrap(), vec![1]);
    }

    #[test]
    fn float_value_indexer_round_trips_keys() {
        let dir = tempfile::tempdir().unwrap();
        let index = tree(&dir, "mass.index", IndexType::FloatMulti);

        let mut values = ValueIndexer::new(index.clone(), dir.path(), 4);
        values.add_float(42.5, 1).unwrap();
        values.add_float(-1.0, 2).unwrap();
        values.finish().unwrap();

        let p = index.find("42.5").unwrap().unwrap();
        assert_eq!(index.posting_iterator(&p).unwrap().collect_docs().unwrap(), vec![1]);
        let p = index.find("-1").unwrap().unwrap();
        assert_eq!(index.posting_iterator(&p).unwrap().collect_docs().unwrap(), vec![2]);
    }
}
