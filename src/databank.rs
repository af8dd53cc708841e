use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, Sender};
use parking_lot::Mutex;
use roaring::RoaringBitmap;
use serde::Serialize;

use crate::analysis::tokenizer::{case_fold, Tokenizer};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::progress::Progress;
use crate::core::types::{DocNr, IndexType, QueryOperator};
use crate::batch::indexer::{encode_db_name, BatchIndexProcessor};
use crate::dict::automaton::Dictionary;
use crate::dict::builder::DictionaryBuilder;
use crate::index::btree::{BTree, Payload};
use crate::io::cache::PageCache;
use crate::io::file::{FileHandle, OpenMode};
use crate::lexicon::Lexicon;
use crate::query::ast::Query;
use crate::query::executor::{calculate_document_weights, ranked_search, DocWeightSource, RankedHit};
use crate::query::parser::QueryParser;
use crate::store::docstore::DocStore;
use crate::store::document::{FetchedDocument, InputDocument};

#[derive(Debug, Serialize)]
pub struct IndexInfo {
    pub name: String,
    pub description: String,
    pub index_type: IndexType,
    pub entries: u64,
    pub file_size: u64,
}

#[derive(Debug, Serialize)]
pub struct DatabankInfo {
    pub uuid: String,
    pub version: String,
    pub doc_count: u32,
    pub raw_text_size: u64,
    pub store_size: u64,
    pub total_size: u64,
    pub indices: Vec<IndexInfo>,
    pub last_error: Option<String>,
}

/// The per-document cosine norms, memory-mapped from the weights file
/// and locked resident where the OS allows it.
pub struct DocWeights {
    mmap: memmap2::Mmap,
    count: u32,
}

impl DocWeights {
    fn open(path: &Path, max_doc_nr: DocNr) -> Result<Option<DocWeights>> {
        if !path.exists() {
            return Ok(None);
        }
        let file = std::fs::File::open(path)?;
        let len = file.metadata()?.len();
        if len != max_doc_nr as u64 * 4 {
            return Ok(None);
        }
        if len == 0 {
            return Ok(None);
        }
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        let _ = mmap.lock();
        Ok(Some(DocWeights { mmap, count: max_doc_nr }))
    }

    pub fn get(&self, doc: DocNr) -> f32 {
        if doc == 0 || doc > self.count {
            return 0.0;
        }
        let off = (doc as usize - 1) * 4;
        f32::from_le_bytes(self.mmap[off..off + 4].try_into().unwrap())
    }
}

impl DocWeightSource for DocWeights {
    fn doc_weight(&self, doc: DocNr) -> f32 {
        self.get(doc)
    }
}

struct IndexEntry {
    name: String,
    description: String,
    tree: Arc<BTree>,
    idl_file: Option<FileHandle>,
}

struct BatchHandle {
    store_tx: Option<Sender<InputDocument>>,
    store_thread: Option<JoinHandle<()>>,
    index_thread: Option<JoinHandle<Option<BatchIndexProcessor>>>,
    error: Arc<Mutex<Option<String>>>,
}

/// A databank: one directory holding the document store, the per-field
/// indices, the weighted full-text index, the document weights and the
/// spelling dictionary. Batch-built once, then read-mostly.
pub struct Databank {
    id: String,
    uuid: String,
    version: String,
    dir: PathBuf,
    cache: Arc<PageCache>,
    store: Arc<DocStore>,
    fulltext: Option<Arc<BTree>>,
    indices: Vec<IndexEntry>,
    link_indices: Vec<IndexEntry>,
    weights: Option<DocWeights>,
    dictionary: Option<Dictionary>,
    link_map: Vec<String>,
    batch: Option<BatchHandle>,
    last_error: Mutex<Option<String>>,
}

impl Databank {
    /// Create a fresh databank directory, wiping any previous content.
    pub fn create(
        id: &str,
        path: impl AsRef<Path>,
        version: &str,
        index_names: &[(String, String)],
    ) -> Result<Databank> {
        let dir = path.as_ref().to_path_buf();
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(dir.join("links"))?;

        let uuid = uuid::Uuid::new_v4().to_string();
        std::fs::write(dir.join("uuid"), format!("{}\n", uuid))?;

        let version = if version.is_empty() {
            chrono::Utc::now().format("%Y-%m-%d").to_string()
        } else {
            version.to_string()
        };
        std::fs::write(dir.join("version.txt"), format!("{}\n", version))?;

        if !index_names.is_empty() {
            let mut file = std::fs::File::create(dir.join("index-names.txt"))?;
            for (name, description) in index_names {
                writeln!(file, "{}\t{}", name, description)?;
            }
        }

        let cache = PageCache::global();
        let store = Arc::new(DocStore::open(dir.join("data"), OpenMode::ReadWrite, cache.clone())?);

        Ok(Databank {
            id: id.to_string(),
            uuid,
            version,
            dir,
            cache,
            store,
            fulltext: None,
            indices: Vec::new(),
            link_indices: Vec::new(),
            weights: None,
            dictionary: None,
            link_map: Vec::new(),
            batch: None,
            last_error: Mutex::new(None),
        })
    }

    /// Open an existing databank, discovering all indices from the
    /// directory contents.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Databank> {
        let dir = path.as_ref().to_path_buf();
        if !dir.is_dir() {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("databank path is invalid ({})", dir.display()),
            ));
        }

        let cache = PageCache::global();
        let store = Arc::new(DocStore::open(dir.join("data"), mode, cache.clone())?);

        let uuid = std::fs::read_to_string(dir.join("uuid"))
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        let version = match std::fs::read_to_string(dir.join("version.txt")) {
            Ok(s) if !s.trim().is_empty() => s.trim().to_string(),
            _ => {
                let mtime = std::fs::metadata(dir.join("data"))
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                chrono::DateTime::<chrono::Utc>::from(mtime).format("%Y-%m-%d").to_string()
            }
        };

        let mut descriptions = std::collections::HashMap::new();
        if let Ok(content) = std::fs::read_to_string(dir.join("index-names.txt")) {
            for line in content.lines() {
                if let Some((name, description)) = line.split_once('\t') {
                    descriptions.insert(name.to_string(), description.to_string());
                }
            }
        }

        let fulltext_path = dir.join("full-text.index");
        let fulltext = if fulltext_path.exists() {
            Some(Arc::new(BTree::open(
                &fulltext_path,
                mode,
                cache.clone(),
                Some(IndexType::CharWeighted),
            )?))
        } else {
            None
        };

        let mut indices = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("index") {
                continue;
            }
            let name = match path.file_stem().and_then(|s| s.to_str()) {
                Some(name) if name != "full-text" => name.to_string(),
                _ => continue,
            };
            let tree = Arc::new(BTree::open(&path, mode, cache.clone(), None)?);
            let idl_path = dir.join(format!("{}.idl", name));
            let idl_file = if tree.index_type() == IndexType::CharMultiIdl && idl_path.exists() {
                Some(FileHandle::open(idl_path, OpenMode::ReadOnly)?)
            } else {
                None
            };
            indices.push(IndexEntry {
                description: descriptions.get(&name).cloned().unwrap_or_default(),
                name,
                tree,
                idl_file,
            });
        }

        let mut link_indices = Vec::new();
        let links_dir = dir.join("links");
        if links_dir.is_dir() {
            for entry in std::fs::read_dir(&links_dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("index") {
                    continue;
                }
                let name = match path.file_stem().and_then(|s| s.to_str()) {
                    Some(name) => name.to_string(),
                    None => continue,
                };
                link_indices.push(IndexEntry {
                    description: String::new(),
                    name,
                    tree: Arc::new(BTree::open(&path, mode, cache.clone(), None)?),
                    idl_file: None,
                });
            }
        }

        let weights = DocWeights::open(&dir.join("full-text.weights"), store.max_doc_nr())?;

        let dict_path = dir.join("full-text.dict");
        let dictionary = if dict_path.exists()
            && std::fs::metadata(&dict_path).map(|m| m.len() > 0).unwrap_or(false)
        {
            Some(Dictionary::load(&dict_path)?)
        } else {
            None
        };

        Ok(Databank {
            id: dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("databank")
                .to_string(),
            uuid,
            version,
            dir,
            cache,
            store,
            fulltext,
            indices,
            link_indices,
            weights,
            dictionary,
            link_map: Vec::new(),
            batch: None,
            last_error: Mutex::new(None),
        })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn size(&self) -> u32 {
        self.store.size()
    }

    pub fn max_doc_nr(&self) -> DocNr {
        self.store.max_doc_nr()
    }

    pub fn doc_store(&self) -> &DocStore {
        &self.store
    }

    // ------------------------------------------------------------------
    // batch import

    /// Start the batch pipeline: a store worker writing blobs and fasta,
    /// chained to an index worker feeding the batch processor.
    pub fn start_batch(&mut self, lexicon: Arc<Lexicon>) -> Result<()> {
        self.start_batch_with_capacities(
            lexicon,
            crate::batch::fulltext::BUFFER_ENTRY_COUNT,
            crate::batch::field_writers::VALUE_RUN_COUNT,
        )
    }

    pub fn start_batch_with_capacities(
        &mut self,
        lexicon: Arc<Lexicon>,
        fulltext_capacity: usize,
        value_capacity: usize,
    ) -> Result<()> {
        if self.batch.is_some() {
            return Err(Error::new(ErrorKind::Unsupported, "batch already running"));
        }

        let (store_tx, store_rx) = bounded::<InputDocument>(100);
        let (index_tx, index_rx) = bounded::<InputDocument>(100);
        let error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let store = self.store.clone();
        let store_error = error.clone();
        let fasta_path = self.dir.join("fasta");
        let store_thread = std::thread::spawn(move || {
            let mut fasta_file: Option<std::fs::File> = None;
            for mut doc in store_rx.iter() {
                let outcome = (|| -> Result<()> {
                    doc.compress(&store)?;
                    let doc_nr = store.store_document(doc.compressed(), doc.raw_size())?;
                    doc.set_doc_nr(doc_nr);

                    if let Some(fasta) = doc.fasta() {
                        if fasta_file.is_none() {
                            fasta_file = Some(std::fs::File::create(&fasta_path)?);
                        }
                        fasta_file.as_mut().unwrap().write_all(fasta.as_bytes())?;
                    }
                    Ok(())
                })();
                match outcome {
                    Ok(()) => {
                        if index_tx.send(doc).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let mut slot = store_error.lock();
                        if slot.is_none() {
                            *slot = Some(e.to_string());
                        }
                        return;
                    }
                }
            }
        });

        let mut processor = BatchIndexProcessor::with_capacities(
            &self.id,
            &self.dir,
            self.cache.clone(),
            lexicon,
            fulltext_capacity,
            value_capacity,
        );
        let index_error = error.clone();
        let index_thread = std::thread::spawn(move || {
            for doc in index_rx.iter() {
                let doc_nr = doc.doc_nr();
                let outcome = (|| -> Result<()> {
                    for tokens in doc.token_lists() {
                        processor.index_tokens(&doc, tokens)?;
                    }
                    for value in doc.values() {
                        processor.index_value(value, doc_nr)?;
                    }
                    for (db, ids) in doc.links() {
                        for id in ids {
                            processor.index_link(doc_nr, db, id)?;
                        }
                    }
                    processor.flush_doc(doc_nr)
                })();
                if let Err(e) = outcome {
                    let mut slot = index_error.lock();
                    if slot.is_none() {
                        *slot = Some(e.to_string());
                    }
                    return None;
                }
            }
            Some(processor)
        });

        self.batch = Some(BatchHandle {
            store_tx: Some(store_tx),
            store_thread: Some(store_thread),
            index_thread: Some(index_thread),
            error,
        });
        Ok(())
    }

    /// Enqueue one document for storing and indexing.
    pub fn store(&self, doc: InputDocument) -> Result<()> {
        let batch = self
            .batch
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::Unsupported, "no batch is running"))?;

        if let Some(message) = batch.error.lock().clone() {
            return Err(Error::new(ErrorKind::Io, message));
        }
        batch
            .store_tx
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::Unsupported, "batch already ended"))?
            .send(doc)
            .map_err(|_| Error::new(ErrorKind::Io, "batch workers are gone"))
    }

    /// Close the ingestion side and join the workers. The batch is then
    /// ready for `finish_batch`.
    pub fn end_batch(&mut self) -> Result<BatchIndexProcessor> {
        let batch = self
            .batch
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::Unsupported, "no batch is running"))?;

        drop(batch.store_tx.take());
        if let Some(t) = batch.store_thread.take() {
            let _ = t.join();
        }
        let processor = batch.index_thread.take().and_then(|t| t.join().ok()).flatten();

        let error_message = batch.error.lock().clone();
        if let Some(message) = error_message {
            *self.last_error.lock() = Some(message.clone());
            self.batch = None;
            return Err(Error::new(ErrorKind::Io, message));
        }
        processor.ok_or_else(|| Error::new(ErrorKind::Io, "index worker lost"))
    }

    /// Run the batch finish: merged-stream dispatch, tree
    /// materialization, document weights and the spelling dictionary.
    pub fn finish_batch(&mut self, processor: BatchIndexProcessor) -> Result<()> {
        let batch = self.batch.take();
        let doc_count = self.store.size();

        let result = (|| -> Result<()> {
            let (descs, fulltext) = processor.finish(doc_count)?;

            self.store.commit()?;
            self.fulltext = Some(fulltext);
            self.indices.clear();
            self.link_indices.clear();
            for desc in descs {
                let entry = IndexEntry {
                    description: String::new(),
                    // link indices are registered under their file name
                    name: if desc.is_link { encode_db_name(&desc.name) } else { desc.name },
                    tree: desc.tree,
                    idl_file: desc.idl_file,
                };
                if desc.is_link {
                    self.link_indices.push(entry);
                } else {
                    self.indices.push(entry);
                }
            }

            self.recalculate_document_weights()?;
            self.create_dictionary()?;
            Ok(())
        })();

        drop(batch);
        if let Err(e) = &result {
            *self.last_error.lock() = Some(e.to_string());
        }
        result
    }

    /// Recompute the per-document weight vector from the full-text
    /// index and persist it as the raw float array.
    pub fn recalculate_document_weights(&mut self) -> Result<()> {
        let fulltext = self
            .fulltext
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::Corrupt, "no full-text index"))?;
        let max_doc_nr = self.store.max_doc_nr();

        let progress = Progress::new(&self.id, fulltext.size() as i64, "calculating weights");
        let weights = calculate_document_weights(fulltext, max_doc_nr)?;
        progress.progress(fulltext.size() as i64);

        let path = self.dir.join("full-text.weights");
        let mut out = Vec::with_capacity(max_doc_nr as usize * 4);
        for doc in 1..=max_doc_nr {
            out.extend_from_slice(&weights[doc as usize].to_le_bytes());
        }
        std::fs::write(&path, out)?;

        self.weights = DocWeights::open(&path, max_doc_nr)?;
        Ok(())
    }

    /// Build the spelling dictionary from the full-text vocabulary.
    pub fn create_dictionary(&mut self) -> Result<()> {
        let fulltext = self
            .fulltext
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::Corrupt, "no full-text index"))?;
        let doc_count = self.store.size();

        let progress = Progress::new(&self.id, fulltext.size() as i64, "creating dictionary");
        let mut builder = DictionaryBuilder::new(doc_count);
        let mut visited = 0i64;
        fulltext.visit_keys(|key, count| {
            builder.visit(key, count)?;
            visited += 1;
            if visited % 10_000 == 0 {
                progress.progress(visited);
            }
            Ok(true)
        })?;
        progress.progress(visited);

        let path = self.dir.join("full-text.dict");
        let file = FileHandle::open(&path, OpenMode::ReadWrite)?;
        builder.finish(doc_count, &file)?;

        self.dictionary = Some(Dictionary::load(&path)?);
        Ok(())
    }

    // ------------------------------------------------------------------
    // fetch

    pub fn fetch(&self, doc_nr: DocNr) -> Result<Option<FetchedDocument>> {
        self.store.fetch(doc_nr)
    }

    /// Fetch through the unique `id` index.
    pub fn fetch_by_id(&self, id: &str) -> Result<Option<FetchedDocument>> {
        self.fetch_by_index("id", id)
    }

    pub fn fetch_by_index(&self, index: &str, value: &str) -> Result<Option<FetchedDocument>> {
        let entry = match self.index_named(index) {
            Some(e) => e,
            None => return Ok(None),
        };
        match entry.tree.find_unique(&case_fold(value))? {
            Some(doc_nr) => self.fetch(doc_nr),
            None => Ok(None),
        }
    }

    fn index_named(&self, name: &str) -> Option<&IndexEntry> {
        self.indices.iter().find(|e| e.name.eq_ignore_ascii_case(name))
    }

    // ------------------------------------------------------------------
    // search

    /// Ranked search; boolean constructs degrade to an unranked filter
    /// result.
    pub fn find(&self, query: &str, all_terms_required: bool, report_limit: usize) -> Result<Vec<RankedHit>> {
        let parsed = QueryParser::parse(query)?;
        let mut terms = parsed.terms.clone();

        if !parsed.is_boolean {
            if let Some(filter) = &parsed.filter {
                self.collect_text_terms(filter, &mut terms);
            }
        }

        if parsed.is_boolean || terms.is_empty() {
            let docs = match &parsed.filter {
                Some(filter) => self.evaluate_filter(filter)?,
                None => RoaringBitmap::new(),
            };
            return Ok(docs
                .iter()
                .take(report_limit)
                .map(|doc| RankedHit { doc, rank: 1.0 })
                .collect());
        }

        let (fulltext, weights) = match (&self.fulltext, &self.weights) {
            (Some(tree), Some(weights)) => (tree, weights),
            // nothing indexed yet
            _ => return Ok(Vec::new()),
        };

        let filter_docs = match &parsed.filter {
            Some(filter) => Some(self.evaluate_filter(filter)?),
            None => None,
        };

        ranked_search(
            fulltext,
            weights,
            self.store.max_doc_nr(),
            &terms,
            filter_docs.as_ref(),
            all_terms_required,
            report_limit,
        )
    }

    /// Pure boolean evaluation of a query string.
    pub fn find_boolean(&self, query: &str, report_limit: usize) -> Result<Vec<DocNr>> {
        let parsed = QueryParser::parse(query)?;
        let mut filter = parsed.filter;
        for term in parsed.terms {
            let q = Query::Term { field: None, term };
            filter = Some(match filter {
                Some(prev) => Query::And(Box::new(prev), Box::new(q)),
                None => q,
            });
        }
        let docs = match filter {
            Some(f) => self.evaluate_filter(&f)?,
            None => RoaringBitmap::new(),
        };
        Ok(docs.iter().take(report_limit).collect())
    }

    /// Terms of text-field predicates also participate in ranking.
    fn collect_text_terms(&self, query: &Query, terms: &mut Vec<String>) {
        match query {
            Query::Term { field: Some(field), term } => {
                if let Some(entry) = self.index_named(field) {
                    if entry.tree.index_type() == IndexType::CharMultiIdl {
                        terms.push(term.clone());
                    }
                }
            }
            Query::And(a, b) | Query::Or(a, b) => {
                self.collect_text_terms(a, terms);
                self.collect_text_terms(b, terms);
            }
            _ => {}
        }
    }

    fn all_docs(&self) -> RoaringBitmap {
        let mut bitmap = RoaringBitmap::new();
        let max = self.store.max_doc_nr();
        if max > 0 {
            bitmap.insert_range(1..=max);
        }
        bitmap
    }

    fn evaluate_filter(&self, query: &Query) -> Result<RoaringBitmap> {
        let mut bitmap = RoaringBitmap::new();
        match query {
            Query::Term { field, term } => {
                let term = case_fold(term);
                match field {
                    Some(name) => {
                        if let Some(entry) = self.index_named(name) {
                            entry.tree.find_op(&term, QueryOperator::Equals, &mut bitmap)?;
                        }
                    }
                    None => {
                        if let Some(fulltext) = &self.fulltext {
                            fulltext.find_op(&term, QueryOperator::Equals, &mut bitmap)?;
                        }
                    }
                }
            }
            Query::Pattern { field, pattern } => match field {
                Some(name) => {
                    if let Some(entry) = self.index_named(name) {
                        entry.tree.find_pattern(pattern, &mut bitmap)?;
                    }
                }
                None => {
                    if let Some(fulltext) = &self.fulltext {
                        fulltext.find_pattern(pattern, &mut bitmap)?;
                    }
                }
            },
            Query::Phrase { field, phrase } => {
                bitmap = self.find_string_docs(field.as_deref(), phrase)?;
            }
            Query::Range { field, lo, hi } => {
                if let Some(entry) = self.index_named(field) {
                    entry.tree.find_range(lo, hi, &mut bitmap)?;
                }
            }
            Query::Compare { field, op, value } => {
                if let Some(entry) = self.index_named(field) {
                    entry.tree.find_op(&case_fold(value), *op, &mut bitmap)?;
                }
            }
            Query::DocNr(doc) => {
                if *doc >= 1 && *doc <= self.store.max_doc_nr() {
                    bitmap.insert(*doc);
                }
            }
            Query::And(a, b) => {
                bitmap = self.evaluate_filter(a)? & self.evaluate_filter(b)?;
            }
            Query::Or(a, b) => {
                bitmap = self.evaluate_filter(a)? | self.evaluate_filter(b)?;
            }
            Query::Not(inner) => {
                bitmap = self.all_docs() - self.evaluate_filter(inner)?;
            }
        }
        Ok(bitmap)
    }

    /// Exact string (phrase) lookup: all words present, at consecutive
    /// in-document locations when the field carries location data.
    fn find_string_docs(&self, field: Option<&str>, phrase: &str) -> Result<RoaringBitmap> {
        let words: Vec<String> = Tokenizer::new(phrase).collect();
        if words.is_empty() {
            return Ok(RoaringBitmap::new());
        }

        // candidate set: docs containing every word
        let mut candidates: Option<RoaringBitmap> = None;
        for word in &words {
            let mut docs = RoaringBitmap::new();
            match field {
                Some(name) => {
                    if let Some(entry) = self.index_named(name) {
                        entry.tree.find_op(word, QueryOperator::Equals, &mut docs)?;
                    }
                }
                None => {
                    if let Some(fulltext) = &self.fulltext {
                        fulltext.find_op(word, QueryOperator::Equals, &mut docs)?;
                    }
                }
            }
            candidates = Some(match candidates {
                Some(c) => c & docs,
                None => docs,
            });
        }
        let candidates = candidates.unwrap_or_default();
        if candidates.is_empty() || words.len() == 1 {
            return Ok(candidates);
        }

        // adjacency check via the IDL sidecars. A qualified phrase is
        // verified in its own field; an unqualified one in every text
        // field, and a document survives when any of them holds the
        // phrase.
        let entries: Vec<&IndexEntry> = match field {
            Some(name) => match self.index_named(name) {
                Some(e) if e.idl_file.is_some() => vec![e],
                // no location data to verify against
                _ => return Ok(candidates),
            },
            None => {
                let text_fields: Vec<&IndexEntry> = self
                    .indices
                    .iter()
                    .filter(|e| e.tree.index_type() == IndexType::CharMultiIdl && e.idl_file.is_some())
                    .collect();
                if text_fields.is_empty() {
                    return Ok(candidates);
                }
                text_fields
            }
        };

        let mut result = RoaringBitmap::new();
        for entry in entries {
            if let Some(idl_file) = &entry.idl_file {
                result |= self.phrase_docs_in_field(entry, idl_file, &words, &candidates)?;
            }
        }
        Ok(result)
    }

    /// Documents of `candidates` holding the words of a phrase at
    /// consecutive locations within one text field.
    fn phrase_docs_in_field(
        &self,
        entry: &IndexEntry,
        idl_file: &FileHandle,
        words: &[String],
        candidates: &RoaringBitmap,
    ) -> Result<RoaringBitmap> {
        let mut per_word_locations: Vec<std::collections::HashMap<DocNr, Vec<u32>>> = Vec::new();
        for word in words {
            let mut locations = std::collections::HashMap::new();
            if let Some(payload) = entry.tree.find(word)? {
                let mut postings = entry.tree.posting_iterator(&payload)?;
                let mut idl = entry.tree.idl_iterator(idl_file, &payload)?;
                while let Some(doc) = postings.next_doc()? {
                    let locs = idl.next_locations()?;
                    if candidates.contains(doc) {
                        locations.insert(doc, locs);
                    }
                }
            }
            per_word_locations.push(locations);
        }

        let mut result = RoaringBitmap::new();
        'docs: for doc in candidates.iter() {
            let first = match per_word_locations[0].get(&doc) {
                Some(locs) => locs,
                None => continue,
            };
            for &start in first {
                let mut ok = true;
                for (i, locations) in per_word_locations.iter().enumerate().skip(1) {
                    let needed = start + i as u32;
                    match locations.get(&doc) {
                        Some(locs) if locs.binary_search(&needed).is_ok() => {}
                        _ => {
                            ok = false;
                            break;
                        }
                    }
                }
                if ok {
                    result.insert(doc);
                    continue 'docs;
                }
            }
        }
        Ok(result)
    }

    /// Per-index term lookup (`*` searches every index).
    pub fn find_term(&self, index: &str, term: &str, op: QueryOperator) -> Result<RoaringBitmap> {
        let term = case_fold(term);
        let mut bitmap = RoaringBitmap::new();
        for entry in &self.indices {
            if index != "*" && !entry.name.eq_ignore_ascii_case(index) {
                continue;
            }
            let _ = entry.tree.find_op(&term, op, &mut bitmap);
        }
        Ok(bitmap)
    }

    pub fn find_in_range(&self, index: &str, lo: &str, hi: &str) -> Result<RoaringBitmap> {
        let mut bitmap = RoaringBitmap::new();
        if let Some(entry) = self.index_named(index) {
            entry.tree.find_range(lo, hi, &mut bitmap)?;
        }
        Ok(bitmap)
    }

    pub fn find_pattern(&self, index: &str, pattern: &str) -> Result<RoaringBitmap> {
        let mut bitmap = RoaringBitmap::new();
        if let Some(entry) = self.index_named(index) {
            entry.tree.find_pattern(&case_fold(pattern), &mut bitmap)?;
        }
        Ok(bitmap)
    }

    pub fn find_string(&self, index: &str, phrase: &str) -> Result<RoaringBitmap> {
        self.find_string_docs(Some(index), phrase)
    }

    /// Does `value` exist in `index`; for a unique index the mapped
    /// document number comes back too.
    pub fn exists(&self, index: &str, value: &str) -> Result<(bool, Option<DocNr>)> {
        let entry = match self.index_named(index) {
            Some(e) => e,
            None => return Ok((false, None)),
        };
        let value = case_fold(value);
        match entry.tree.find(&value)? {
            Some(Payload::Unique(doc)) => Ok((true, Some(doc))),
            Some(_) => Ok((true, None)),
            None => Ok((false, None)),
        }
    }

    /// Keys of an index between `first` and `last` (both optional), for
    /// the browse UI.
    pub fn list_index_entries(
        &self,
        index: &str,
        first: Option<&str>,
        last: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let entry = self
            .index_named(index)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("no index '{}'", index)))?;

        let comparator = entry.tree.comparator();
        let from_key = match first {
            Some(f) => Some(comparator.string_to_key(f)?),
            None => None,
        };
        let until_key = match last {
            Some(l) => Some(comparator.string_to_key(l)?),
            None => None,
        };

        let mut keys = Vec::new();
        let mut iter = entry.tree.iter_from(from_key.as_deref())?;
        while let Some((key, _)) = iter.next_entry()? {
            if let Some(until) = &until_key {
                if comparator.compare(&key, until) == std::cmp::Ordering::Greater {
                    break;
                }
            }
            keys.push(comparator.key_to_string(&key));
            if keys.len() >= limit {
                break;
            }
        }
        Ok(keys)
    }

    // ------------------------------------------------------------------
    // links

    /// Declare the databanks this one links to; lookups against other
    /// names short-circuit.
    pub fn init_link_map(&mut self, linked_dbs: &[String]) {
        self.link_map = linked_dbs.iter().map(|db| encode_db_name(db)).collect();
    }

    pub fn is_linked(&self, db: &str, id: &str) -> Result<bool> {
        if !self.link_map.is_empty() && !self.link_map.iter().any(|d| d == &encode_db_name(db)) {
            return Ok(false);
        }
        self.is_linked_indexed(db, id)
    }

    fn is_linked_indexed(&self, db: &str, id: &str) -> Result<bool> {
        let encoded = encode_db_name(db);
        match self.link_indices.iter().find(|e| e.name == encoded) {
            Some(entry) => entry.tree.contains(&case_fold(id)),
            None => Ok(false),
        }
    }

    pub fn linked_documents(&self, db: &str, id: &str) -> Result<RoaringBitmap> {
        let mut bitmap = RoaringBitmap::new();
        let encoded = encode_db_name(db);
        if let Some(entry) = self.link_indices.iter().find(|e| e.name == encoded) {
            entry.tree.find_op(&case_fold(id), QueryOperator::Equals, &mut bitmap)?;
        }
        Ok(bitmap)
    }

    // ------------------------------------------------------------------
    // spelling

    pub fn suggest_correction(&self, word: &str) -> Vec<(String, u16)> {
        match &self.dictionary {
            Some(dict) => dict.suggest_correction(word),
            None => Vec::new(),
        }
    }

    pub fn suggest_search_terms(&self, word: &str) -> Vec<String> {
        match &self.dictionary {
            Some(dict) => dict.suggest_search_terms(word),
            None => Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // maintenance

    pub fn get_info(&self) -> Result<DatabankInfo> {
        let (doc_count, store_size, raw_text_size) = self.store.get_info();

        let mut indices = Vec::new();
        if let Some(fulltext) = &self.fulltext {
            indices.push(IndexInfo {
                name: "full-text".to_string(),
                description: String::new(),
                index_type: IndexType::CharWeighted,
                entries: fulltext.size(),
                file_size: fulltext.file_size(),
            });
        }
        for entry in self.indices.iter().chain(&self.link_indices) {
            indices.push(IndexInfo {
                name: entry.name.clone(),
                description: entry.description.clone(),
                index_type: entry.tree.index_type(),
                entries: entry.tree.size(),
                file_size: entry.tree.file_size(),
            });
        }

        let mut total_size = 0u64;
        for dir in [self.dir.clone(), self.dir.join("links")] {
            if let Ok(entries) = std::fs::read_dir(dir) {
                for entry in entries.flatten() {
                    if let Ok(meta) = entry.metadata() {
                        if meta.is_file() {
                            total_size += meta.len();
                        }
                    }
                }
            }
        }

        Ok(DatabankInfo {
            uuid: self.uuid.clone(),
            version: self.version.clone(),
            doc_count,
            raw_text_size,
            store_size,
            total_size,
            indices,
            last_error: self.last_error.lock().clone(),
        })
    }

    /// Compact every index in key order.
    pub fn vacuum(&self) -> Result<()> {
        let mut size = 0;
        for entry in self.indices.iter().chain(&self.link_indices) {
            size += entry.tree.size();
        }
        let progress = Progress::new(&self.id, size as i64 + 1, "vacuuming");

        if let Some(fulltext) = &self.fulltext {
            fulltext.vacuum()?;
        }
        for entry in self.indices.iter().chain(&self.link_indices) {
            entry.tree.vacuum()?;
            progress.consumed(entry.tree.size() as i64);
        }
        progress.consumed(1);
        Ok(())
    }

    /// Check store and index invariants.
    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;

        for entry in self.indices.iter().chain(&self.link_indices) {
            let comparator = entry.tree.comparator();
            let mut iter = entry.tree.iter_from(None)?;
            let mut previous: Option<Vec<u8>> = None;
            while let Some((key, _)) = iter.next_entry()? {
                if let Some(prev) = &previous {
                    if comparator.compare(prev, &key) != std::cmp::Ordering::Less {
                        return Err(Error::new(
                            ErrorKind::Corrupt,
                            format!("index '{}' keys out of order", entry.name),
                        ));
                    }
                }
                previous = Some(key);
            }
        }
        Ok(())
    }
}

impl Drop for Databank {
    fn drop(&mut self) {
        if let Some(batch) = &mut self.batch {
            drop(batch.store_tx.take());
            if let Some(t) = batch.store_thread.take() {
                let _ = t.join();
            }
            if let Some(t) = batch.index_thread.take() {
                let _ = t.join();
            }
        }
        let _ = self.store.commit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn import(db: &mut Databank, docs: Vec<InputDocument>) {
        let lexicon = Arc::new(Lexicon::new());
        db.start_batch_with_capacities(lexicon, 64, 16).unwrap();
        for doc in docs {
            db.store(doc).unwrap();
        }
        let processor = db.end_batch().unwrap();
        db.finish_batch(processor).unwrap();
    }

    fn three_doc_databank(dir: &tempfile::TempDir) -> Databank {
        let mut db = Databank::create("test", dir.path().join("db"), "2026-08-01", &[]).unwrap();

        let texts = ["alpha beta", "beta gamma", "alpha gamma delta"];
        let ids = ["a", "b", "c"];
        let mut docs = Vec::new();
        for (text, id) in texts.iter().zip(ids) {
            let mut doc = InputDocument::new(*text);
            doc.set_attribute("id", id).unwrap();
            doc.index_text("text", text).unwrap();
            doc.index_value("id", id, true);
            docs.push(doc);
        }
        import(&mut db, docs);
        db
    }

    #[test]
    fn empty_databank() {
        let dir = tempfile::tempdir().unwrap();
        let db = Databank::create("empty", dir.path().join("db"), "", &[]).unwrap();

        assert!(db.fetch(1).unwrap().is_none());
        assert!(db.find("anything", false, 10).unwrap().is_empty());
        assert!(db.find_term("*", "anything", QueryOperator::Equals).unwrap().is_empty());
    }

    #[test]
    fn three_doc_sanity() {
        let dir = tempfile::tempdir().unwrap();
        let db = three_doc_databank(&dir);

        let doc = db.fetch_by_id("b").unwrap().unwrap();
        assert_eq!(doc.text, "beta gamma");
        assert_eq!(doc.attribute("id"), Some("b"));

        let hits = db.find("text:beta", false, 10).unwrap();
        let mut docs: Vec<u32> = hits.iter().map(|h| h.doc).collect();
        docs.sort_unstable();
        assert_eq!(docs, vec![1, 2]);
        assert!(hits.iter().all(|h| h.rank > 0.0));

        let hits = db.find("alpha AND gamma", false, 10).unwrap();
        assert_eq!(hits.iter().map(|h| h.doc).collect::<Vec<_>>(), vec![3]);

        let hits = db.find("delta OR epsilon", false, 10).unwrap();
        assert_eq!(hits.iter().map(|h| h.doc).collect::<Vec<_>>(), vec![3]);

        let weights = db.weights.as_ref().unwrap();
        for doc in 1..=3 {
            assert!(weights.get(doc) > 0.0, "doc {} has no weight", doc);
        }
    }

    #[test]
    fn fetch_round_trips_attributes_and_links() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Databank::create("test", dir.path().join("db"), "", &[]).unwrap();

        let mut doc = InputDocument::new("some protein record text");
        doc.set_attribute("id", "p1").unwrap();
        doc.set_attribute("title", "a protein").unwrap();
        doc.add_link("taxonomy", "9606");
        doc.index_text("text", "some protein record text").unwrap();
        doc.index_value("id", "p1", true);
        import(&mut db, vec![doc]);

        let fetched = db.fetch(1).unwrap().unwrap();
        assert_eq!(fetched.text, "some protein record text");
        assert_eq!(fetched.attribute("title"), Some("a protein"));
        assert_eq!(fetched.links, vec![("taxonomy".to_string(), vec!["9606".to_string()])]);

        assert!(db.is_linked("taxonomy", "9606").unwrap());
        assert!(!db.is_linked("taxonomy", "10090").unwrap());
        assert_eq!(db.linked_documents("taxonomy", "9606").unwrap().iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn numeric_range_queries() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Databank::create("test", dir.path().join("db"), "", &[]).unwrap();

        let years = ["1999", "2001", "2003", "2010"];
        let mut docs = Vec::new();
        for year in years {
            let mut doc = InputDocument::new(format!("entry from {}", year));
            doc.index_text("text", "entry").unwrap();
            doc.index_number("year", year, false);
            docs.push(doc);
        }
        import(&mut db, docs);

        let hits = db.find("year:[2000 TO 2005]", false, 10).unwrap();
        let mut found: Vec<u32> = hits.iter().map(|h| h.doc).collect();
        found.sort_unstable();
        assert_eq!(found, vec![2, 3]);

        let hits = db.find("year>=2003", false, 10).unwrap();
        let mut found: Vec<u32> = hits.iter().map(|h| h.doc).collect();
        found.sort_unstable();
        assert_eq!(found, vec![3, 4]);
    }

    #[test]
    fn glob_queries() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Databank::create("test", dir.path().join("db"), "", &[]).unwrap();

        let names = ["acetyl", "acid", "actin", "beta"];
        let mut docs = Vec::new();
        for name in names {
            let mut doc = InputDocument::new(format!("record about {}", name));
            doc.index_text("text", "record").unwrap();
            doc.index_value("name", name, false);
            docs.push(doc);
        }
        import(&mut db, docs);

        let hits = db.find("name:ac*", false, 10).unwrap();
        let mut found: Vec<u32> = hits.iter().map(|h| h.doc).collect();
        found.sort_unstable();
        assert_eq!(found, vec![1, 2, 3]);

        let hits = db.find("name:?ct??", false, 10).unwrap();
        assert_eq!(hits.iter().map(|h| h.doc).collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn duplicate_unique_key_keeps_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Databank::create("test", dir.path().join("db"), "", &[]).unwrap();

        let mut docs = Vec::new();
        for text in ["first record", "second record"] {
            let mut doc = InputDocument::new(text);
            doc.index_text("text", text).unwrap();
            doc.index_value("acc", "P00001", true);
            docs.push(doc);
        }
        import(&mut db, docs);

        let (found, doc_nr) = db.exists("acc", "P00001").unwrap();
        assert!(found);
        assert_eq!(doc_nr, Some(1));
    }

    #[test]
    fn boolean_not_complements() {
        let dir = tempfile::tempdir().unwrap();
        let db = three_doc_databank(&dir);

        let docs = db.find_boolean("NOT beta", 10).unwrap();
        assert_eq!(docs, vec![3]);
    }

    #[test]
    fn doc_nr_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let db = three_doc_databank(&dir);

        let hits = db.find("#2", false, 10).unwrap();
        assert_eq!(hits.iter().map(|h| h.doc).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn phrase_search_uses_locations() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Databank::create("test", dir.path().join("db"), "", &[]).unwrap();

        let texts = ["the quick brown fox", "the brown quick fox"];
        let mut docs = Vec::new();
        for text in texts {
            let mut doc = InputDocument::new(text);
            doc.index_text("text", text).unwrap();
            docs.push(doc);
        }
        import(&mut db, docs);

        let docs = db.find_string("text", "quick brown").unwrap();
        assert_eq!(docs.iter().collect::<Vec<_>>(), vec![1]);

        let docs = db.find_string("text", "brown fox").unwrap();
        assert_eq!(docs.iter().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn unqualified_phrase_checks_every_text_field() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = Databank::create("test", dir.path().join("db"), "", &[]).unwrap();

        // the phrase lives in a different field per document
        let mut one = InputDocument::new("first record");
        one.index_text("title", "heat shock protein").unwrap();
        one.index_text("body", "a chaperone family").unwrap();

        let mut two = InputDocument::new("second record");
        two.index_text("title", "a chaperone family").unwrap();
        two.index_text("body", "heat shock protein").unwrap();

        let mut three = InputDocument::new("third record");
        three.index_text("title", "shock heat protein").unwrap();
        three.index_text("body", "heat protein shock").unwrap();

        import(&mut db, vec![one, two, three]);

        let hits = db.find("\"heat shock\"", false, 10).unwrap();
        let mut found: Vec<u32> = hits.iter().map(|h| h.doc).collect();
        found.sort_unstable();
        assert_eq!(found, vec![1, 2]);

        // qualified phrases stay restricted to their own field
        let docs = db.find_string("title", "heat shock").unwrap();
        assert_eq!(docs.iter().collect::<Vec<_>>(), vec![1]);
        let docs = db.find_string("body", "heat shock").unwrap();
        assert_eq!(docs.iter().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn info_and_validate() {
        let dir = tempfile::tempdir().unwrap();
        let db = three_doc_databank(&dir);

        let info = db.get_info().unwrap();
        assert_eq!(info.doc_count, 3);
        assert!(info.total_size > 0);
        assert!(info.indices.iter().any(|i| i.name == "full-text"));
        assert!(info.indices.iter().any(|i| i.name == "text"));
        assert!(info.indices.iter().any(|i| i.name == "id"));
        assert!(info.last_error.is_none());
        assert!(!info.uuid.is_empty());
        assert_eq!(info.version, "2026-08-01");

        db.validate().unwrap();
    }

    #[test]
    fn reopen_built_databank() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let _db = three_doc_databank(&dir);
        }

        let db = Databank::open(&path, OpenMode::ReadOnly).unwrap();
        assert_eq!(db.size(), 3);
        assert_eq!(db.fetch_by_id("c").unwrap().unwrap().text, "alpha gamma delta");

        let hits = db.find("alpha gamma", true, 10).unwrap();
        assert_eq!(hits.iter().map(|h| h.doc).collect::<Vec<_>>(), vec![3]);

        db.validate().unwrap();
    }

    #[test]
    fn directory_layout() {
        let dir = tempfile::tempdir().unwrap();
        let db = three_doc_databank(&dir);
        let root = dir.path().join("db");

        for file in ["uuid", "version.txt", "data", "full-text.index", "full-text.weights", "full-text.dict"] {
            assert!(root.join(file).exists(), "missing {}", file);
        }
        assert!(root.join("text.index").exists());
        assert!(root.join("text.idl").exists());
        assert!(root.join("id.index").exists());
        drop(db);
    }

    #[test]
    fn erase_documents_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let db = three_doc_databank(&dir);
        assert_eq!(db.doc_store().erase_document(1).unwrap_err().kind, ErrorKind::Unsupported);
    }
}
