use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::progress::Progress;
use crate::core::types::{DataType, DocNr, IndexType, MAX_INDEX_NR, MAX_WEIGHT};
use crate::batch::field_writers::{FieldWriter, ValueIndexer, VALUE_RUN_COUNT};
use crate::batch::fulltext::{FullTextIx, BUFFER_ENTRY_COUNT};
use crate::index::btree::BTree;
use crate::io::cache::PageCache;
use crate::io::file::{FileHandle, OpenMode};
use crate::lexicon::Lexicon;
use crate::store::document::{IndexTokens, IndexValue, InputDocument};

/// Percent-encode a databank name for use as a link index file name;
/// '/' in particular becomes "%2F".
pub fn encode_db_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// A finished index, ready for the databank's registry.
pub struct IndexDesc {
    pub name: String,
    pub index_type: IndexType,
    pub tree: Arc<BTree>,
    pub idl_file: Option<FileHandle>,
    pub is_link: bool,
}

struct WriterDesc {
    name: String,
    index_type: IndexType,
    writer: FieldWriter,
    idl_file: Option<FileHandle>,
    is_link: bool,
}

/// Routes the per-document indexing directives to the full-text
/// collector, the typed value runs and the unique indices, and drives
/// the §batch finish: merged stream dispatch, parallel tree
/// materialization.
pub struct BatchIndexProcessor {
    databank_id: String,
    db_dir: PathBuf,
    cache: Arc<PageCache>,
    lexicon: Arc<Lexicon>,
    fulltext: FullTextIx,
    writers: Vec<WriterDesc>,
    value_indexers: Vec<(String, IndexType, ValueIndexer)>,
    unique_indices: Vec<(String, IndexType, Arc<BTree>)>,
    value_run_capacity: usize,
}

impl BatchIndexProcessor {
    pub fn new(
        databank_id: &str,
        db_dir: impl Into<PathBuf>,
        cache: Arc<PageCache>,
        lexicon: Arc<Lexicon>,
    ) -> Self {
        Self::with_capacities(databank_id, db_dir, cache, lexicon, BUFFER_ENTRY_COUNT, VALUE_RUN_COUNT)
    }

    pub fn with_capacities(
        databank_id: &str,
        db_dir: impl Into<PathBuf>,
        cache: Arc<PageCache>,
        lexicon: Arc<Lexicon>,
        fulltext_capacity: usize,
        value_run_capacity: usize,
    ) -> Self {
        let db_dir = db_dir.into();
        BatchIndexProcessor {
            databank_id: databank_id.to_string(),
            cache,
            lexicon: lexicon.clone(),
            fulltext: FullTextIx::with_capacity(&db_dir, fulltext_capacity),
            writers: Vec::new(),
            value_indexers: Vec::new(),
            unique_indices: Vec::new(),
            value_run_capacity,
            db_dir,
        }
    }

    fn index_path(&self, name: &str, is_link: bool) -> PathBuf {
        if is_link {
            self.db_dir.join("links").join(format!("{}.index", encode_db_name(name)))
        } else {
            self.db_dir.join(format!("{}.index", name))
        }
    }

    fn check_name_free(&self, name: &str, index_type: IndexType) -> Result<()> {
        let clash = self
            .writers
            .iter()
            .any(|w| w.name == name && w.index_type != index_type)
            || self
                .value_indexers
                .iter()
                .any(|(n, t, _)| n == name && *t != index_type)
            || self
                .unique_indices
                .iter()
                .any(|(n, t, _)| n == name && *t != index_type);
        if clash {
            return Err(Error::new(
                ErrorKind::Unsupported,
                format!("inconsistent use of index '{}'", name),
            ));
        }
        Ok(())
    }

    /// Writer-backed (char) index; created on first use, fed from the
    /// merged full-text stream at finish.
    fn get_writer(&mut self, name: &str, index_type: IndexType, is_link: bool) -> Result<usize> {
        if let Some(ix) = self
            .writers
            .iter()
            .position(|w| w.name == name && w.index_type == index_type && w.is_link == is_link)
        {
            return Ok(ix);
        }
        self.check_name_free(name, index_type)?;
        if self.writers.len() + 1 >= MAX_INDEX_NR {
            return Err(Error::new(ErrorKind::Overflow, "too many indices"));
        }

        let index_nr = self.writers.len() as u8 + 1;
        let tree = Arc::new(BTree::open(
            self.index_path(name, is_link),
            OpenMode::ReadWrite,
            self.cache.clone(),
            Some(index_type),
        )?);
        tree.set_batch_mode(self.lexicon.clone())?;

        let (writer, idl_file) = match index_type {
            IndexType::CharMultiIdl => {
                let idl_path = self.db_dir.join(format!("{}.idl", name));
                let idl_file = FileHandle::open(idl_path, OpenMode::ReadWrite)?;
                self.fulltext.set_uses_in_doc_location(index_nr);
                (FieldWriter::new_multi_idl(tree, idl_file.clone()), Some(idl_file))
            }
            IndexType::CharMulti | IndexType::Link => {
                self.fulltext.set_exclude_in_full_text(index_nr);
                (FieldWriter::new_multi(tree), None)
            }
            _ => {
                return Err(Error::new(ErrorKind::Unsupported, "unexpected writer index type"))
            }
        };

        self.writers.push(WriterDesc {
            name: name.to_string(),
            index_type,
            writer,
            idl_file,
            is_link,
        });
        Ok(self.writers.len() - 1)
    }

    fn unique_index(&mut self, name: &str, index_type: IndexType) -> Result<Arc<BTree>> {
        if let Some((_, _, tree)) = self
            .unique_indices
            .iter()
            .find(|(n, t, _)| n == name && *t == index_type)
        {
            return Ok(tree.clone());
        }
        self.check_name_free(name, index_type)?;

        let tree = Arc::new(BTree::open(
            self.index_path(name, false),
            OpenMode::ReadWrite,
            self.cache.clone(),
            Some(index_type),
        )?);
        self.unique_indices.push((name.to_string(), index_type, tree.clone()));
        Ok(tree)
    }

    fn value_indexer(&mut self, name: &str, index_type: IndexType) -> Result<&mut ValueIndexer> {
        if let Some(ix) = self
            .value_indexers
            .iter()
            .position(|(n, t, _)| n == name && *t == index_type)
        {
            return Ok(&mut self.value_indexers[ix].2);
        }
        self.check_name_free(name, index_type)?;

        let tree = Arc::new(BTree::open(
            self.index_path(name, false),
            OpenMode::ReadWrite,
            self.cache.clone(),
            Some(index_type),
        )?);
        let indexer = ValueIndexer::new(tree, &self.db_dir, self.value_run_capacity);
        self.value_indexers.push((name.to_string(), index_type, indexer));
        Ok(&mut self.value_indexers.last_mut().unwrap().2)
    }

    /// Remap a document-local token list to global lexicon ids and feed
    /// the full-text collector.
    pub fn index_tokens(&mut self, doc: &InputDocument, tokens: &IndexTokens) -> Result<()> {
        if tokens.tokens.is_empty() {
            return Ok(());
        }

        match tokens.data_type {
            DataType::String => {
                for &t in &tokens.tokens {
                    let global = self.remap(doc, t)?;
                    self.fulltext.add_word(0, global);
                }
            }
            DataType::Text => {
                let writer = self.get_writer(&tokens.index_name, IndexType::CharMultiIdl, false)?;
                let index_nr = writer as u8 + 1;
                for &t in &tokens.tokens {
                    let global = self.remap(doc, t)?;
                    self.fulltext.add_word(index_nr, global);
                }
            }
            _ => {
                return Err(Error::new(ErrorKind::Unsupported, "token list with a value type"))
            }
        }
        Ok(())
    }

    fn remap(&self, doc: &InputDocument, local: u32) -> Result<u32> {
        if local == 0 {
            return Ok(0);
        }
        self.lexicon.store(doc.local_word(local))
    }

    pub fn index_value(&mut self, value: &IndexValue, doc_nr: DocNr) -> Result<()> {
        match value {
            IndexValue::Str { index_name, value, unique: true } => {
                let index = self.unique_index(index_name, IndexType::Char)?;
                self.insert_unique(&index, index_name, value, doc_nr)
            }
            IndexValue::Number { index_name, value, unique: true } => {
                let index = self.unique_index(index_name, IndexType::Number)?;
                self.insert_unique(&index, index_name, value, doc_nr)
            }
            IndexValue::Float { index_name, value, unique: true } => {
                let index = self.unique_index(index_name, IndexType::Float)?;
                self.insert_unique(&index, index_name, &value.to_string(), doc_nr)
            }
            IndexValue::Str { index_name, value, unique: false } => {
                let ix = self.get_writer(index_name, IndexType::CharMulti, false)?;
                let index_nr = ix as u8 + 1;
                let term = self.lexicon.store(value.as_bytes())?;
                self.fulltext.add_word(index_nr, term);
                Ok(())
            }
            IndexValue::Number { index_name, value, unique: false } => {
                let name = index_name.clone();
                let value = value.clone();
                self.value_indexer(&name, IndexType::NumberMulti)?.add_number(&value, doc_nr)
            }
            IndexValue::Float { index_name, value, unique: false } => {
                let name = index_name.clone();
                let value = *value;
                self.value_indexer(&name, IndexType::FloatMulti)?.add_float(value, doc_nr)
            }
        }
    }

    /// A duplicate key in a unique index is reported and skipped; the
    /// first mapping wins and the batch continues.
    fn insert_unique(&self, index: &BTree, name: &str, value: &str, doc_nr: DocNr) -> Result<()> {
        match index.insert_unique(value, doc_nr) {
            Ok(()) => Ok(()),
            Err(e) if e.is_duplicate_key() => {
                eprintln!("warning: {}: duplicate key '{}' for document {}", name, value, doc_nr);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn index_link(&mut self, _doc_nr: DocNr, db: &str, id: &str) -> Result<()> {
        let ix = self.get_writer(db, IndexType::Link, true)?;
        let index_nr = ix as u8 + 1;
        let term = self.lexicon.store(id.as_bytes())?;
        self.fulltext.add_word(index_nr, term);
        Ok(())
    }

    pub fn flush_doc(&mut self, doc_nr: DocNr) -> Result<()> {
        self.fulltext.flush_doc(doc_nr)
    }

    /// Drain the merged posting stream into the per-field writers and
    /// the synthetic full-text index, then materialize every index.
    pub fn finish(mut self, doc_count: u32) -> Result<(Vec<IndexDesc>, Arc<BTree>)> {
        let fulltext_tree = Arc::new(BTree::open(
            self.db_dir.join("full-text.index"),
            OpenMode::ReadWrite,
            self.cache.clone(),
            Some(IndexType::CharWeighted),
        )?);
        fulltext_tree.set_batch_mode(self.lexicon.clone())?;
        let mut ft_writer = FieldWriter::new_weighted(fulltext_tree.clone());

        let exclude = self.fulltext.full_text_exclusions();
        let entry_count = self.fulltext.entry_count();
        let progress = Progress::new(&self.databank_id, entry_count as i64, "assembling index");

        let mut stream = self.fulltext.finish()?;
        let mut entry = match stream.next()? {
            Some(e) => e,
            None => return Err(Error::new(ErrorKind::Corrupt, "nothing was indexed")),
        };

        let mut last_term = entry.term;
        let mut last_doc = entry.doc;
        let mut term_freq = 0u32;
        let mut entries_read = 0i64;

        loop {
            debug_assert!(entry.doc <= doc_count);

            entries_read += 1;
            if entries_read % 10_000 == 0 {
                progress.progress(entries_read);
            }

            if entry.doc != last_doc || entry.term != last_term {
                if term_freq > 0 {
                    ft_writer.add_doc_term(last_doc, last_term, term_freq as u8, None)?;
                }
                last_doc = entry.doc;
                last_term = entry.term;
                term_freq = 0;
            }

            if entry.ix > 0 {
                let writer = &mut self.writers[entry.ix as usize - 1].writer;
                writer.add_doc_term(entry.doc, entry.term, entry.weight, entry.idl.as_deref())?;
            }

            if !exclude[entry.ix as usize] {
                term_freq = (term_freq + entry.weight as u32).min(MAX_WEIGHT);
            }

            entry = match stream.next()? {
                Some(e) => e,
                None => break,
            };
        }
        if term_freq > 0 {
            ft_writer.add_doc_term(last_doc, last_term, term_freq as u8, None)?;
        }
        progress.progress(entries_read);

        ft_writer.finish_terms()?;
        for desc in &mut self.writers {
            desc.writer.finish_terms()?;
        }

        let mut value_trees: Vec<(String, IndexType, Arc<BTree>)> = Vec::new();
        if !self.value_indexers.is_empty() {
            let progress = Progress::new(
                &self.databank_id,
                self.value_indexers.len() as i64,
                "writing value indices",
            );
            for (name, index_type, indexer) in std::mem::take(&mut self.value_indexers) {
                progress.message(&name);
                let tree = indexer.index().clone();
                indexer.finish()?;
                progress.consumed(1);
                value_trees.push((name, index_type, tree));
            }
        }

        // materialize all trees in parallel: batch trees are finished,
        // interactive ones compacted
        let mut jobs: Vec<Arc<BTree>> = Vec::new();
        jobs.push(fulltext_tree.clone());
        let mut descs: Vec<IndexDesc> = Vec::new();
        for desc in self.writers.drain(..) {
            jobs.push(desc.writer.index().clone());
            descs.push(IndexDesc {
                name: desc.name,
                index_type: desc.index_type,
                tree: desc.writer.index().clone(),
                idl_file: desc.idl_file,
                is_link: desc.is_link,
            });
        }
        for (name, index_type, tree) in self.unique_indices.drain(..) {
            jobs.push(tree.clone());
            descs.push(IndexDesc { name, index_type, tree, idl_file: None, is_link: false });
        }
        for (name, index_type, tree) in value_trees {
            jobs.push(tree.clone());
            descs.push(IndexDesc { name, index_type, tree, idl_file: None, is_link: false });
        }

        let error: Mutex<Option<Error>> = Mutex::new(None);
        rayon::scope(|scope| {
            for tree in &jobs {
                let error = &error;
                scope.spawn(move |_| {
                    let outcome = if tree.is_in_batch_mode() {
                        tree.finish_batch()
                    } else {
                        tree.vacuum()
                    };
                    if let Err(e) = outcome {
                        let mut slot = error.lock();
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                    }
                });
            }
        });
        if let Some(e) = error.into_inner() {
            return Err(e);
        }

        Ok((descs, fulltext_tree))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_name_encoding() {
        assert_eq!(encode_db_name("uniprot"), "uniprot");
        assert_eq!(encode_db_name("pdb/structures"), "pdb%2Fstructures");
        assert_eq!(encode_db_name("a b"), "a%20b");
    }
}
