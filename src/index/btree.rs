use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use roaring::RoaringBitmap;

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{DocNr, IndexType, QueryOperator, MAX_KEY_LEN, MAX_WEIGHT};
use crate::index::comparator::Comparator;
use crate::index::posting::{
    encode_multi, encode_weighted, IdlIterator, PostingIterator, WeightedIterator,
};
use crate::io::cache::{PageCache, PageRef, PAGE_SIZE};
use crate::io::file::{FileHandle, OpenMode};
use crate::lexicon::Lexicon;

const MAGIC: u32 = 0x6D36_6978; // "m6ix"

const PAGE_TYPE_LEAF: u8 = 1;
const PAGE_TYPE_BRANCH: u8 = 2;

// page header: type u8, flags u8, n u16, link u32, heap_top u16, pad u16
const PAGE_HEADER_SIZE: usize = 12;
const ENTRY_KEY_FIELDS: usize = 4; // key offset + key length

fn read_u16(b: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([b[off], b[off + 1]])
}

fn read_u32(b: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn read_u64(b: &[u8], off: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&b[off..off + 8]);
    u64::from_be_bytes(buf)
}

/// Leaf value payload; the variant in use is fixed per index type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Payload {
    Unique(DocNr),
    Multi { count: u32, offset: u64 },
    MultiIdl { count: u32, offset: u64, idl_offset: u64 },
    Weighted { count: u32, offset: u64 },
}

impl Payload {
    pub fn doc_count(&self) -> u32 {
        match *self {
            Payload::Unique(_) => 1,
            Payload::Multi { count, .. }
            | Payload::MultiIdl { count, .. }
            | Payload::Weighted { count, .. } => count,
        }
    }
}

fn payload_size(index_type: IndexType) -> usize {
    match index_type {
        IndexType::Char | IndexType::Number | IndexType::Float => 4,
        IndexType::CharMulti
        | IndexType::NumberMulti
        | IndexType::FloatMulti
        | IndexType::Link
        | IndexType::CharWeighted => 12,
        IndexType::CharMultiIdl => 20,
    }
}

fn encode_payload(index_type: IndexType, payload: &Payload, out: &mut [u8]) {
    match (index_type, payload) {
        (IndexType::Char | IndexType::Number | IndexType::Float, Payload::Unique(doc)) => {
            out[0..4].copy_from_slice(&doc.to_be_bytes());
        }
        (
            IndexType::CharMulti | IndexType::NumberMulti | IndexType::FloatMulti | IndexType::Link,
            Payload::Multi { count, offset },
        )
        | (IndexType::CharWeighted, Payload::Weighted { count, offset }) => {
            out[0..4].copy_from_slice(&count.to_be_bytes());
            out[4..12].copy_from_slice(&offset.to_be_bytes());
        }
        (IndexType::CharMultiIdl, Payload::MultiIdl { count, offset, idl_offset }) => {
            out[0..4].copy_from_slice(&count.to_be_bytes());
            out[4..12].copy_from_slice(&offset.to_be_bytes());
            out[12..20].copy_from_slice(&idl_offset.to_be_bytes());
        }
        _ => unreachable!("payload variant does not match index type"),
    }
}

fn decode_payload(index_type: IndexType, b: &[u8]) -> Payload {
    match index_type {
        IndexType::Char | IndexType::Number | IndexType::Float => Payload::Unique(read_u32(b, 0)),
        IndexType::CharMulti | IndexType::NumberMulti | IndexType::FloatMulti | IndexType::Link => {
            Payload::Multi { count: read_u32(b, 0), offset: read_u64(b, 4) }
        }
        IndexType::CharWeighted => Payload::Weighted { count: read_u32(b, 0), offset: read_u64(b, 4) },
        IndexType::CharMultiIdl => Payload::MultiIdl {
            count: read_u32(b, 0),
            offset: read_u64(b, 4),
            idl_offset: read_u64(b, 12),
        },
    }
}

/// One page of the tree. Entries (key reference + payload) grow from the
/// front, key bytes are packed into a heap growing down from the page
/// end, so split points follow the byte budget rather than entry count.
struct TreePage {
    page: PageRef,
    payload_size: usize,
}

impl TreePage {
    fn entry_size(&self) -> usize {
        ENTRY_KEY_FIELDS + self.payload_size
    }

    fn page_type(&self) -> u8 {
        self.page.bytes()[0]
    }

    fn set_page_type(&self, t: u8) {
        self.page.write(0, &[t]);
    }

    fn n(&self) -> usize {
        read_u16(self.page.bytes(), 2) as usize
    }

    fn set_n(&self, n: usize) {
        self.page.write(2, &(n as u16).to_be_bytes());
    }

    fn link(&self) -> u32 {
        read_u32(self.page.bytes(), 4)
    }

    fn set_link(&self, link: u32) {
        self.page.write(4, &link.to_be_bytes());
    }

    fn heap_top(&self) -> usize {
        let t = read_u16(self.page.bytes(), 8) as usize;
        if t == 0 {
            PAGE_SIZE
        } else {
            t
        }
    }

    fn set_heap_top(&self, top: usize) {
        self.page.write(8, &(top as u16).to_be_bytes());
    }

    fn key(&self, ix: usize) -> &[u8] {
        let b = self.page.bytes();
        let off = PAGE_HEADER_SIZE + ix * self.entry_size();
        let key_off = read_u16(b, off) as usize;
        let key_len = read_u16(b, off + 2) as usize;
        &b[key_off..key_off + key_len]
    }

    fn payload_bytes(&self, ix: usize) -> &[u8] {
        let b = self.page.bytes();
        let off = PAGE_HEADER_SIZE + ix * self.entry_size() + ENTRY_KEY_FIELDS;
        &b[off..off + self.payload_size]
    }

    fn set_payload_bytes(&self, ix: usize, payload: &[u8]) {
        let off = PAGE_HEADER_SIZE + ix * self.entry_size() + ENTRY_KEY_FIELDS;
        self.page.write(off, payload);
    }

    fn free_space(&self) -> usize {
        let entries_end = PAGE_HEADER_SIZE + self.n() * self.entry_size();
        self.heap_top().saturating_sub(entries_end)
    }

    fn fits(&self, key_len: usize) -> bool {
        self.free_space() >= self.entry_size() + key_len
    }

    /// Insert an entry at `ix`; the caller has checked `fits`.
    fn insert(&self, ix: usize, key: &[u8], payload: &[u8]) {
        let n = self.n();
        let entry_size = self.entry_size();
        let key_off = self.heap_top() - key.len();

        self.page.with_mut(|b| {
            let start = PAGE_HEADER_SIZE + ix * entry_size;
            let end = PAGE_HEADER_SIZE + n * entry_size;
            b.copy_within(start..end, start + entry_size);
            b[key_off..key_off + key.len()].copy_from_slice(key);
            b[start..start + 2].copy_from_slice(&(key_off as u16).to_be_bytes());
            b[start + 2..start + 4].copy_from_slice(&(key.len() as u16).to_be_bytes());
            b[start + ENTRY_KEY_FIELDS..start + entry_size].copy_from_slice(payload);
        });
        self.set_heap_top(key_off);
        self.set_n(n + 1);
    }

    fn remove(&self, ix: usize) {
        let n = self.n();
        let entry_size = self.entry_size();
        self.page.with_mut(|b| {
            let start = PAGE_HEADER_SIZE + ix * entry_size;
            let end = PAGE_HEADER_SIZE + n * entry_size;
            b.copy_within(start + entry_size..end, start);
        });
        // the key bytes stay behind in the heap until the next rewrite
        self.set_n(n - 1);
    }

    fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..self.n())
            .map(|i| (self.key(i).to_vec(), self.payload_bytes(i).to_vec()))
            .collect()
    }

    /// Repack the page from scratch with the given ordered entries.
    fn rewrite(&self, page_type: u8, link: u32, entries: &[(Vec<u8>, Vec<u8>)]) {
        let entry_size = self.entry_size();
        self.page.with_mut(|b| b.fill(0));
        self.set_page_type(page_type);
        self.set_link(link);

        let mut heap_top = PAGE_SIZE;
        self.page.with_mut(|b| {
            for (i, (key, payload)) in entries.iter().enumerate() {
                heap_top -= key.len();
                let start = PAGE_HEADER_SIZE + i * entry_size;
                b[heap_top..heap_top + key.len()].copy_from_slice(key);
                b[start..start + 2].copy_from_slice(&(heap_top as u16).to_be_bytes());
                b[start + 2..start + 4].copy_from_slice(&(key.len() as u16).to_be_bytes());
                b[start + ENTRY_KEY_FIELDS..start + entry_size].copy_from_slice(payload);
            }
        });
        self.set_heap_top(heap_top);
        self.set_n(entries.len());
    }

    /// First index whose key is not less than `key`; also reports an
    /// exact match.
    fn lower_bound(&self, key: &[u8], comparator: &Comparator) -> (usize, bool) {
        let mut lo = 0;
        let mut hi = self.n();
        let mut exact = false;
        while lo < hi {
            let mid = (lo + hi) / 2;
            match comparator.compare(self.key(mid), key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Equal => {
                    exact = true;
                    hi = mid;
                }
                Ordering::Greater => hi = mid,
            }
        }
        (lo, exact)
    }

    /// Child page for `key` in a branch: the rightmost entry with a
    /// separator not greater than `key`, the leftmost child otherwise.
    fn branch_child(&self, key: &[u8], comparator: &Comparator) -> u32 {
        let (ix, exact) = self.lower_bound(key, comparator);
        let ix = if exact { ix + 1 } else { ix };
        if ix == 0 {
            self.link()
        } else {
            read_u32(self.payload_bytes(ix - 1), 0)
        }
    }
}

struct BatchEntry {
    term: u32,
    payload: Payload,
}

struct BatchState {
    lexicon: Arc<Lexicon>,
    entries: Vec<BatchEntry>,
    // scratch for posting streams; relocated behind the tree on finish
    scratch: FileHandle,
    _scratch_guard: tempfile::TempPath,
}

struct TreeState {
    root: u32,
    count: u64,
    depth: u32,
    max_weight: u32,
    posting_base: u64,
    batch: Option<BatchState>,
}

/// Prefix-friendly B+-tree over a single index file. The key order comes
/// from a pluggable comparator; leaf payloads address bit-packed posting
/// streams appended to the same file.
pub struct BTree {
    file: FileHandle,
    cache: Arc<PageCache>,
    comparator: Comparator,
    index_type: IndexType,
    state: Mutex<TreeState>,
}

pub fn comparator_for(index_type: IndexType) -> Comparator {
    match index_type {
        IndexType::Number | IndexType::NumberMulti => Comparator::Numeric,
        IndexType::Float | IndexType::FloatMulti => Comparator::Float,
        _ => Comparator::Bytewise,
    }
}

impl BTree {
    /// Open an index file; `expected` describes the type when creating a
    /// fresh file and is verified against the header otherwise.
    pub fn open(
        path: impl AsRef<Path>,
        mode: OpenMode,
        cache: Arc<PageCache>,
        expected: Option<IndexType>,
    ) -> Result<BTree> {
        let file = FileHandle::open(path, mode)?;

        if file.size() == 0 {
            let index_type = expected.ok_or_else(|| {
                Error::new(ErrorKind::Corrupt, "empty index file without a declared type")
            })?;
            file.truncate(PAGE_SIZE as u64)?;
            let tree = BTree {
                file,
                cache,
                comparator: comparator_for(index_type),
                index_type,
                state: Mutex::new(TreeState {
                    root: 0,
                    count: 0,
                    depth: 0,
                    max_weight: MAX_WEIGHT,
                    posting_base: 0,
                    batch: None,
                }),
            };
            tree.write_header()?;
            return Ok(tree);
        }

        let page = cache.load(&file, 0)?;
        let b = page.bytes();
        if read_u32(b, 0) != MAGIC {
            return Err(Error::new(ErrorKind::Corrupt, "bad index signature"));
        }
        let index_type = IndexType::from_tag(b[4])
            .ok_or_else(|| Error::new(ErrorKind::Corrupt, "unknown index type"))?;
        if let Some(expected) = expected {
            if expected != index_type {
                return Err(Error::new(ErrorKind::Unsupported, "index type mismatch"));
            }
        }
        let state = TreeState {
            root: read_u32(b, 8),
            count: read_u64(b, 16),
            depth: read_u32(b, 24),
            max_weight: read_u32(b, 28),
            posting_base: read_u64(b, 32),
            batch: None,
        };
        drop(page);

        Ok(BTree {
            file,
            cache,
            comparator: comparator_for(index_type),
            index_type,
            state: Mutex::new(state),
        })
    }

    pub fn index_type(&self) -> IndexType {
        self.index_type
    }

    pub fn comparator(&self) -> Comparator {
        self.comparator
    }

    pub fn size(&self) -> u64 {
        self.state.lock().count
    }

    pub fn depth(&self) -> u32 {
        self.state.lock().depth
    }

    pub fn max_weight(&self) -> u32 {
        self.state.lock().max_weight
    }

    pub fn file_size(&self) -> u64 {
        self.file.size()
    }

    fn write_header(&self) -> Result<()> {
        let state = self.state.lock();
        let page = self.cache.load(&self.file, 0)?;
        page.with_mut(|b| {
            b[0..4].copy_from_slice(&MAGIC.to_be_bytes());
            b[4] = self.index_type.on_disk_tag();
            b[8..12].copy_from_slice(&state.root.to_be_bytes());
            b[12..16].copy_from_slice(&(PAGE_SIZE as u32).to_be_bytes());
            b[16..24].copy_from_slice(&state.count.to_be_bytes());
            b[24..28].copy_from_slice(&state.depth.to_be_bytes());
            b[28..32].copy_from_slice(&state.max_weight.to_be_bytes());
            b[32..40].copy_from_slice(&state.posting_base.to_be_bytes());
        });
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        self.write_header()?;
        self.cache.flush(&self.file)?;
        self.file.sync()
    }

    fn load(&self, page_nr: u32) -> Result<TreePage> {
        Ok(TreePage {
            page: self.cache.load(&self.file, page_nr)?,
            payload_size: payload_size(self.index_type),
        })
    }

    fn allocate(&self, page_type: u8) -> Result<TreePage> {
        let size = self.file.size();
        let page_nr = ((size + PAGE_SIZE as u64 - 1) / PAGE_SIZE as u64).max(1) as u32;
        self.file.truncate((page_nr as u64 + 1) * PAGE_SIZE as u64)?;
        let page = self.load(page_nr)?;
        page.page.with_mut(|b| b.fill(0));
        page.set_page_type(page_type);
        page.set_heap_top(PAGE_SIZE);
        Ok(page)
    }

    fn page_nr_of(page: &TreePage) -> u32 {
        page.page.page_nr()
    }

    // ------------------------------------------------------------------
    // mutation

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(Error::new(
                ErrorKind::Overflow,
                format!("invalid key length {}", key.len()),
            ));
        }
        Ok(())
    }

    fn in_batch(&self) -> bool {
        self.state.lock().batch.is_some()
    }

    fn insert_payload(&self, key: &[u8], payload: Payload) -> Result<()> {
        self.check_key(key)?;
        if self.in_batch() {
            return Err(Error::new(ErrorKind::Unsupported, "tree is in batch mode"));
        }

        let mut payload_buf = vec![0u8; payload_size(self.index_type)];
        encode_payload(self.index_type, &payload, &mut payload_buf);

        let mut state = self.state.lock();
        if state.root == 0 {
            let root = self.allocate(PAGE_TYPE_LEAF)?;
            state.root = Self::page_nr_of(&root);
            state.depth = 1;
        }

        let split = self.insert_into(state.root, key, &payload_buf)?;
        if let Some((sep, new_page)) = split {
            let root = self.allocate(PAGE_TYPE_BRANCH)?;
            root.set_link(state.root);
            root.insert(0, &sep, &new_page.to_be_bytes());
            state.root = Self::page_nr_of(&root);
            state.depth += 1;
        }
        state.count += 1;
        Ok(())
    }

    fn insert_into(&self, page_nr: u32, key: &[u8], payload: &[u8]) -> Result<Option<(Vec<u8>, u32)>> {
        let page = self.load(page_nr)?;

        match page.page_type() {
            PAGE_TYPE_LEAF => {
                let (ix, exact) = page.lower_bound(key, &self.comparator);
                if exact {
                    return Err(Error::new(
                        ErrorKind::DuplicateKey,
                        format!("duplicate key '{}'", self.comparator.key_to_string(key)),
                    ));
                }
                if page.fits(key.len()) {
                    page.insert(ix, key, payload);
                    return Ok(None);
                }
                self.split_insert(&page, PAGE_TYPE_LEAF, ix, key, payload)
            }
            PAGE_TYPE_BRANCH => {
                let child = page.branch_child(key, &self.comparator);
                let split = self.insert_into(child, key, payload)?;
                let (sep, new_child) = match split {
                    Some(s) => s,
                    None => return Ok(None),
                };

                let (ix, _) = page.lower_bound(&sep, &self.comparator);
                if page.fits(sep.len()) {
                    page.insert(ix, &sep, &new_child.to_be_bytes());
                    return Ok(None);
                }
                self.split_branch(&page, ix, &sep, new_child)
            }
            t => Err(Error::new(ErrorKind::Corrupt, format!("bad tree page type {}", t))),
        }
    }

    /// Split a full leaf by byte budget and insert the pending entry.
    fn split_insert(
        &self,
        page: &TreePage,
        page_type: u8,
        ix: usize,
        key: &[u8],
        payload: &[u8],
    ) -> Result<Option<(Vec<u8>, u32)>> {
        let mut entries = page.entries();
        entries.insert(ix, (key.to_vec(), payload.to_vec()));

        let split = split_point(&entries, page.entry_size());
        let right_entries = entries.split_off(split);

        let new_page = self.allocate(page_type)?;
        new_page.rewrite(page_type, page.link(), &right_entries);
        page.rewrite(page_type, Self::page_nr_of(&new_page), &entries);

        let sep = right_entries[0].0.clone();
        Ok(Some((sep, Self::page_nr_of(&new_page))))
    }

    /// Split a full branch; the middle separator moves up.
    fn split_branch(
        &self,
        page: &TreePage,
        ix: usize,
        sep: &[u8],
        new_child: u32,
    ) -> Result<Option<(Vec<u8>, u32)>> {
        let mut entries = page.entries();
        entries.insert(ix, (sep.to_vec(), new_child.to_be_bytes().to_vec()));

        let split = split_point(&entries, page.entry_size()).clamp(1, entries.len() - 1);
        let mut right_entries = entries.split_off(split);
        let (up_key, up_payload) = right_entries.remove(0);
        let up_child = read_u32(&up_payload, 0);

        let new_page = self.allocate(PAGE_TYPE_BRANCH)?;
        new_page.rewrite(PAGE_TYPE_BRANCH, up_child, &right_entries);
        page.rewrite(PAGE_TYPE_BRANCH, page.link(), &entries);

        Ok(Some((up_key, Self::page_nr_of(&new_page))))
    }

    /// Insert into a unique index; an existing key fails with
    /// `DuplicateKey` and leaves the previous mapping in place.
    pub fn insert_unique(&self, key: &str, doc: DocNr) -> Result<()> {
        let key = self.comparator.string_to_key(key)?;
        self.insert_payload(&key, Payload::Unique(doc))
    }

    /// Insert (or merge into) a multi index entry.
    pub fn insert_multi(&self, key: &str, docs: &[DocNr]) -> Result<()> {
        let key = self.comparator.string_to_key(key)?;
        self.insert_multi_key(&key, docs)
    }

    pub fn insert_multi_key(&self, key: &[u8], docs: &[DocNr]) -> Result<()> {
        if self.in_batch() {
            return Err(Error::new(ErrorKind::Unsupported, "tree is in batch mode"));
        }
        let mut docs = docs.to_vec();
        docs.sort_unstable();
        docs.dedup();

        if let Some(existing) = self.find_key(key)? {
            let mut merged = self.posting_iterator(&existing)?.collect_docs()?;
            merged.extend_from_slice(&docs);
            merged.sort_unstable();
            merged.dedup();
            let offset = self.append_posting(&encode_multi(&merged)?)?;
            let payload = Payload::Multi { count: merged.len() as u32, offset };
            return self.replace_payload(key, payload);
        }

        let offset = self.append_posting(&encode_multi(&docs)?)?;
        self.insert_payload(key, Payload::Multi { count: docs.len() as u32, offset })
    }

    pub fn insert_weighted(&self, key: &str, postings: &[(DocNr, u8)]) -> Result<()> {
        if self.in_batch() {
            return Err(Error::new(ErrorKind::Unsupported, "tree is in batch mode"));
        }
        let key = self.comparator.string_to_key(key)?;
        let offset = self.append_posting(&encode_weighted(postings)?)?;
        self.insert_payload(&key, Payload::Weighted { count: postings.len() as u32, offset })
    }

    pub fn insert_multi_idl(&self, key: &str, idl_offset: u64, docs: &[DocNr]) -> Result<()> {
        if self.in_batch() {
            return Err(Error::new(ErrorKind::Unsupported, "tree is in batch mode"));
        }
        let key = self.comparator.string_to_key(key)?;
        let offset = self.append_posting(&encode_multi(docs)?)?;
        self.insert_payload(
            &key,
            Payload::MultiIdl { count: docs.len() as u32, offset, idl_offset },
        )
    }

    fn replace_payload(&self, key: &[u8], payload: Payload) -> Result<()> {
        let mut payload_buf = vec![0u8; payload_size(self.index_type)];
        encode_payload(self.index_type, &payload, &mut payload_buf);

        let state = self.state.lock();
        let mut page_nr = state.root;
        loop {
            let page = self.load(page_nr)?;
            match page.page_type() {
                PAGE_TYPE_BRANCH => page_nr = page.branch_child(key, &self.comparator),
                PAGE_TYPE_LEAF => {
                    let (ix, exact) = page.lower_bound(key, &self.comparator);
                    if !exact {
                        return Err(Error::new(ErrorKind::NotFound, "key vanished during update"));
                    }
                    page.set_payload_bytes(ix, &payload_buf);
                    return Ok(());
                }
                t => return Err(Error::new(ErrorKind::Corrupt, format!("bad tree page type {}", t))),
            }
        }
    }

    /// Remove a key. Underflowing pages are left sparse; the space is
    /// reclaimed by the next vacuum.
    pub fn erase(&self, key: &str) -> Result<()> {
        let key = self.comparator.string_to_key(key)?;
        if self.in_batch() {
            return Err(Error::new(ErrorKind::Unsupported, "tree is in batch mode"));
        }

        let mut state = self.state.lock();
        if state.root == 0 {
            return Err(Error::new(ErrorKind::NotFound, "key not found"));
        }
        let mut page_nr = state.root;
        loop {
            let page = self.load(page_nr)?;
            match page.page_type() {
                PAGE_TYPE_BRANCH => page_nr = page.branch_child(&key, &self.comparator),
                PAGE_TYPE_LEAF => {
                    let (ix, exact) = page.lower_bound(&key, &self.comparator);
                    if !exact {
                        return Err(Error::new(ErrorKind::NotFound, "key not found"));
                    }
                    page.remove(ix);
                    state.count -= 1;
                    return Ok(());
                }
                t => return Err(Error::new(ErrorKind::Corrupt, format!("bad tree page type {}", t))),
            }
        }
    }

    fn append_posting(&self, bits: &crate::io::bits::OBitStream) -> Result<u64> {
        let base = self.state.lock().posting_base;
        let absolute = self.file.append(bits.bytes())?;
        Ok(absolute - base)
    }

    // ------------------------------------------------------------------
    // lookup

    pub fn find(&self, key: &str) -> Result<Option<Payload>> {
        let key = self.comparator.string_to_key(key)?;
        self.find_key(&key)
    }

    pub fn find_key(&self, key: &[u8]) -> Result<Option<Payload>> {
        let root = self.state.lock().root;
        if root == 0 {
            return Ok(None);
        }
        let mut page_nr = root;
        loop {
            let page = self.load(page_nr)?;
            match page.page_type() {
                PAGE_TYPE_BRANCH => page_nr = page.branch_child(key, &self.comparator),
                PAGE_TYPE_LEAF => {
                    let (ix, exact) = page.lower_bound(key, &self.comparator);
                    if !exact {
                        return Ok(None);
                    }
                    return Ok(Some(decode_payload(self.index_type, page.payload_bytes(ix))));
                }
                t => return Err(Error::new(ErrorKind::Corrupt, format!("bad tree page type {}", t))),
            }
        }
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.find(key)?.is_some())
    }

    pub fn find_unique(&self, key: &str) -> Result<Option<DocNr>> {
        match self.find(key)? {
            Some(Payload::Unique(doc)) => Ok(Some(doc)),
            Some(_) => Err(Error::new(ErrorKind::Unsupported, "not a unique index")),
            None => Ok(None),
        }
    }

    /// Iterator over posting documents of a payload.
    pub fn posting_iterator(&self, payload: &Payload) -> Result<PostingIterator> {
        let base = self.state.lock().posting_base;
        match *payload {
            Payload::Unique(_) => Err(Error::new(ErrorKind::Unsupported, "unique payload has no list")),
            Payload::Multi { count, offset } | Payload::MultiIdl { count, offset, .. } => {
                Ok(PostingIterator::from_file(self.file.clone(), base + offset, count))
            }
            Payload::Weighted { .. } => {
                Err(Error::new(ErrorKind::Unsupported, "use weighted_iterator"))
            }
        }
    }

    pub fn weighted_iterator(&self, payload: &Payload) -> Result<WeightedIterator> {
        let base = self.state.lock().posting_base;
        match *payload {
            Payload::Weighted { count, offset } => {
                Ok(WeightedIterator::from_file(self.file.clone(), base + offset, count))
            }
            _ => Err(Error::new(ErrorKind::Unsupported, "not a weighted payload")),
        }
    }

    pub fn idl_iterator(&self, idl_file: &FileHandle, payload: &Payload) -> Result<IdlIterator> {
        match *payload {
            Payload::MultiIdl { idl_offset, .. } => {
                Ok(IdlIterator::from_file(idl_file.clone(), idl_offset))
            }
            _ => Err(Error::new(ErrorKind::Unsupported, "index has no location data")),
        }
    }

    fn payload_into_bitmap(&self, payload: &Payload, bitmap: &mut RoaringBitmap) -> Result<u32> {
        match *payload {
            Payload::Unique(doc) => {
                bitmap.insert(doc);
                Ok(1)
            }
            Payload::Weighted { count, offset } => {
                let base = self.state.lock().posting_base;
                let mut iter = WeightedIterator::from_file(self.file.clone(), base + offset, count);
                while let Some((doc, _)) = iter.next_posting()? {
                    bitmap.insert(doc);
                }
                Ok(count)
            }
            _ => {
                let mut iter = self.posting_iterator(payload)?;
                let count = iter.count();
                while let Some(doc) = iter.next_doc()? {
                    bitmap.insert(doc);
                }
                Ok(count)
            }
        }
    }

    /// Leftmost leaf position whose key is ≥ `key` (or the very first
    /// position when `key` is None).
    fn seek(&self, key: Option<&[u8]>) -> Result<Option<(u32, usize)>> {
        let root = self.state.lock().root;
        if root == 0 {
            return Ok(None);
        }
        let mut page_nr = root;
        loop {
            let page = self.load(page_nr)?;
            match page.page_type() {
                PAGE_TYPE_BRANCH => {
                    page_nr = match key {
                        Some(k) => page.branch_child(k, &self.comparator),
                        None => page.link(),
                    };
                }
                PAGE_TYPE_LEAF => {
                    let ix = match key {
                        Some(k) => page.lower_bound(k, &self.comparator).0,
                        None => 0,
                    };
                    if ix < page.n() {
                        return Ok(Some((page_nr, ix)));
                    }
                    // key is past this leaf; continue at the next one
                    let link = page.link();
                    if link == 0 {
                        return Ok(None);
                    }
                    return Ok(Some((link, 0)));
                }
                t => return Err(Error::new(ErrorKind::Corrupt, format!("bad tree page type {}", t))),
            }
        }
    }

    /// Stream keys in comparator order from `from` (or the start).
    pub fn iter_from(&self, from: Option<&[u8]>) -> Result<TreeIter<'_>> {
        let pos = self.seek(from)?;
        Ok(TreeIter { tree: self, pos })
    }

    /// Comparison-operator lookup into a bitmap; returns the number of
    /// postings added.
    pub fn find_op(&self, key: &str, op: QueryOperator, bitmap: &mut RoaringBitmap) -> Result<u32> {
        let key = self.comparator.string_to_key(key)?;
        let mut added = 0;

        match op {
            QueryOperator::Equals => {
                if let Some(payload) = self.find_key(&key)? {
                    added += self.payload_into_bitmap(&payload, bitmap)?;
                }
            }
            QueryOperator::LessThan | QueryOperator::LessOrEqual => {
                let mut iter = self.iter_from(None)?;
                while let Some((k, payload)) = iter.next_entry()? {
                    let ord = self.comparator.compare(&k, &key);
                    if ord == Ordering::Greater || (ord == Ordering::Equal && op == QueryOperator::LessThan) {
                        break;
                    }
                    added += self.payload_into_bitmap(&payload, bitmap)?;
                }
            }
            QueryOperator::GreaterThan | QueryOperator::GreaterOrEqual => {
                let mut iter = self.iter_from(Some(&key))?;
                while let Some((k, payload)) = iter.next_entry()? {
                    if op == QueryOperator::GreaterThan
                        && self.comparator.compare(&k, &key) == Ordering::Equal
                    {
                        continue;
                    }
                    added += self.payload_into_bitmap(&payload, bitmap)?;
                }
            }
        }
        Ok(added)
    }

    /// Range lookup, both bounds inclusive.
    pub fn find_range(&self, lo: &str, hi: &str, bitmap: &mut RoaringBitmap) -> Result<u32> {
        let lo = self.comparator.string_to_key(lo)?;
        let hi = self.comparator.string_to_key(hi)?;
        let mut added = 0;

        let mut iter = self.iter_from(Some(&lo))?;
        while let Some((k, payload)) = iter.next_entry()? {
            if self.comparator.compare(&k, &hi) == Ordering::Greater {
                break;
            }
            added += self.payload_into_bitmap(&payload, bitmap)?;
        }
        Ok(added)
    }

    /// Glob lookup: prefix pruning up to the first wildcard, then a leaf
    /// scan with full pattern matching.
    pub fn find_pattern(&self, pattern: &str, bitmap: &mut RoaringBitmap) -> Result<u32> {
        let prefix: &str = pattern
            .split(['*', '?'])
            .next()
            .unwrap_or("");
        let regex = glob_to_regex(pattern)?;
        let mut added = 0;

        let from = if prefix.is_empty() { None } else { Some(prefix.as_bytes()) };
        let mut iter = self.iter_from(from)?;
        while let Some((k, payload)) = iter.next_entry()? {
            if !prefix.is_empty() && !k.starts_with(prefix.as_bytes()) {
                break;
            }
            if regex.is_match(&k) {
                added += self.payload_into_bitmap(&payload, bitmap)?;
            }
        }
        Ok(added)
    }

    /// Stream every key with its posting count, in key order.
    pub fn visit_keys(&self, mut visit: impl FnMut(&[u8], u32) -> Result<bool>) -> Result<()> {
        let mut iter = self.iter_from(None)?;
        while let Some((k, payload)) = iter.next_entry()? {
            if !visit(&k, payload.doc_count())? {
                break;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // batch mode

    /// Switch a fresh tree into batch mode: keyed inserts are collected
    /// (keys are lexicon ids) and the tree is materialized bottom-up on
    /// `finish_batch`.
    pub fn set_batch_mode(&self, lexicon: Arc<Lexicon>) -> Result<()> {
        let mut state = self.state.lock();
        if state.root != 0 || state.batch.is_some() {
            return Err(Error::new(ErrorKind::Unsupported, "batch mode needs an empty tree"));
        }
        let scratch = tempfile::NamedTempFile::new()?;
        let scratch_path = scratch.into_temp_path();
        let scratch_file = FileHandle::open(&scratch_path, OpenMode::ReadWrite)?;
        state.batch = Some(BatchState {
            lexicon,
            entries: Vec::new(),
            scratch: scratch_file,
            _scratch_guard: scratch_path,
        });
        Ok(())
    }

    pub fn is_in_batch_mode(&self) -> bool {
        self.in_batch()
    }

    fn batch_push(&self, term: u32, payload: Payload) -> Result<()> {
        let mut state = self.state.lock();
        let batch = state
            .batch
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::Unsupported, "tree is not in batch mode"))?;
        batch.entries.push(BatchEntry { term, payload });
        Ok(())
    }

    fn batch_append(&self, bits: &crate::io::bits::OBitStream) -> Result<u64> {
        let state = self.state.lock();
        let batch = state
            .batch
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::Unsupported, "tree is not in batch mode"))?;
        batch.scratch.append(bits.bytes())
    }

    pub fn batch_insert_multi(&self, term: u32, docs: &[DocNr]) -> Result<()> {
        let offset = self.batch_append(&encode_multi(docs)?)?;
        self.batch_push(term, Payload::Multi { count: docs.len() as u32, offset })
    }

    pub fn batch_insert_weighted(&self, term: u32, postings: &[(DocNr, u8)]) -> Result<()> {
        let offset = self.batch_append(&encode_weighted(postings)?)?;
        self.batch_push(term, Payload::Weighted { count: postings.len() as u32, offset })
    }

    pub fn batch_insert_multi_idl(&self, term: u32, idl_offset: u64, docs: &[DocNr]) -> Result<()> {
        let offset = self.batch_append(&encode_multi(docs)?)?;
        self.batch_push(
            term,
            Payload::MultiIdl { count: docs.len() as u32, offset, idl_offset },
        )
    }

    /// Materialize the tree: sort the collected entries in key order,
    /// emit leaves and branch levels bottom-up, then move the posting
    /// region in behind the tree.
    pub fn finish_batch(&self) -> Result<()> {
        let batch = {
            let mut state = self.state.lock();
            state
                .batch
                .take()
                .ok_or_else(|| Error::new(ErrorKind::Unsupported, "tree is not in batch mode"))?
        };

        let comparator = self.comparator;
        let lexicon = batch.lexicon.clone();
        let mut entries = batch.entries;
        entries.sort_by(|a, b| lexicon.compare(a.term, b.term, |x, y| comparator.compare(x, y)));

        let mut payload_buf = vec![0u8; payload_size(self.index_type)];
        let mut count = 0u64;

        // leaf level
        let mut level: Vec<(Vec<u8>, u32)> = Vec::new();
        let mut leaf = self.allocate(PAGE_TYPE_LEAF)?;
        let mut first_key_of_leaf: Option<Vec<u8>> = None;
        for entry in &entries {
            let key = lexicon.get(entry.term);
            self.check_key(&key)?;
            encode_payload(self.index_type, &entry.payload, &mut payload_buf);

            if !leaf.fits(key.len()) {
                let next = self.allocate(PAGE_TYPE_LEAF)?;
                leaf.set_link(Self::page_nr_of(&next));
                level.push((
                    first_key_of_leaf.take().unwrap_or_default(),
                    Self::page_nr_of(&leaf),
                ));
                leaf = next;
            }
            if first_key_of_leaf.is_none() {
                first_key_of_leaf = Some(key.clone());
            }
            leaf.insert(leaf.n(), &key, &payload_buf);
            count += 1;
        }
        level.push((
            first_key_of_leaf.take().unwrap_or_default(),
            Self::page_nr_of(&leaf),
        ));

        // branch levels
        let mut depth = 1u32;
        while level.len() > 1 {
            let mut next_level: Vec<(Vec<u8>, u32)> = Vec::new();
            let mut branch = self.allocate(PAGE_TYPE_BRANCH)?;
            let mut first_key_of_branch: Option<Vec<u8>> = None;
            let mut has_link = false;

            for (key, page_nr) in level {
                if !has_link {
                    branch.set_link(page_nr);
                    first_key_of_branch = Some(key);
                    has_link = true;
                    continue;
                }
                if !branch.fits(key.len()) {
                    next_level.push((
                        first_key_of_branch.take().unwrap_or_default(),
                        Self::page_nr_of(&branch),
                    ));
                    branch = self.allocate(PAGE_TYPE_BRANCH)?;
                    branch.set_link(page_nr);
                    first_key_of_branch = Some(key);
                    continue;
                }
                branch.insert(branch.n(), &key, &page_nr.to_be_bytes());
            }
            next_level.push((
                first_key_of_branch.take().unwrap_or_default(),
                Self::page_nr_of(&branch),
            ));
            level = next_level;
            depth += 1;
        }

        // relocate the posting scratch behind the tree region
        let posting_base = self.file.size();
        let scratch_size = batch.scratch.size();
        let mut copied = 0u64;
        let mut buf = vec![0u8; 1 << 20];
        while copied < scratch_size {
            let take = buf.len().min((scratch_size - copied) as usize);
            batch.scratch.pread(&mut buf[..take], copied)?;
            self.file.append(&buf[..take])?;
            copied += take as u64;
        }

        {
            let mut state = self.state.lock();
            state.root = level[0].1;
            state.count = count;
            state.depth = depth;
            state.posting_base = posting_base;
        }
        self.commit()
    }

    // ------------------------------------------------------------------
    // vacuum

    /// Rewrite the whole file in key order: drains every entry and its
    /// posting stream, truncates, and rebuilds tree plus posting region
    /// compactly. The cache drops the stale pages on truncate, so the
    /// reopened header stays the only external reference.
    pub fn vacuum(&self) -> Result<()> {
        if self.in_batch() {
            return Err(Error::new(ErrorKind::Unsupported, "tree is in batch mode"));
        }

        enum Drained {
            Unique(DocNr),
            Multi(Vec<DocNr>),
            MultiIdl(Vec<DocNr>, u64),
            Weighted(Vec<(DocNr, u8)>),
        }

        let mut drained: Vec<(Vec<u8>, Drained)> = Vec::new();
        {
            let mut iter = self.iter_from(None)?;
            while let Some((key, payload)) = iter.next_entry()? {
                let data = match payload {
                    Payload::Unique(doc) => Drained::Unique(doc),
                    Payload::Multi { .. } => {
                        Drained::Multi(self.posting_iterator(&payload)?.collect_docs()?)
                    }
                    Payload::MultiIdl { idl_offset, .. } => Drained::MultiIdl(
                        self.posting_iterator(&payload)?.collect_docs()?,
                        idl_offset,
                    ),
                    Payload::Weighted { .. } => {
                        let mut iter = self.weighted_iterator(&payload)?;
                        let mut postings = Vec::new();
                        while let Some(p) = iter.next_posting()? {
                            postings.push(p);
                        }
                        Drained::Weighted(postings)
                    }
                };
                drained.push((key, data));
            }
        }

        self.cache.truncate(&self.file, PAGE_SIZE as u64)?;
        self.file.truncate(PAGE_SIZE as u64)?;

        // encode all posting streams first so leaf payloads are final
        let mut posting_bytes: Vec<u8> = Vec::new();
        let mut rebuilt: Vec<(Vec<u8>, Payload)> = Vec::with_capacity(drained.len());
        for (key, data) in drained {
            let payload = match data {
                Drained::Unique(doc) => Payload::Unique(doc),
                Drained::Multi(docs) => {
                    let bits = encode_multi(&docs)?;
                    let offset = posting_bytes.len() as u64;
                    posting_bytes.extend_from_slice(bits.bytes());
                    Payload::Multi { count: docs.len() as u32, offset }
                }
                Drained::MultiIdl(docs, idl_offset) => {
                    let bits = encode_multi(&docs)?;
                    let offset = posting_bytes.len() as u64;
                    posting_bytes.extend_from_slice(bits.bytes());
                    Payload::MultiIdl { count: docs.len() as u32, offset, idl_offset }
                }
                Drained::Weighted(postings) => {
                    let bits = encode_weighted(&postings)?;
                    let offset = posting_bytes.len() as u64;
                    posting_bytes.extend_from_slice(bits.bytes());
                    Payload::Weighted { count: postings.len() as u32, offset }
                }
            };
            rebuilt.push((key, payload));
        }

        let mut payload_buf = vec![0u8; payload_size(self.index_type)];
        let mut count = 0u64;
        let mut level: Vec<(Vec<u8>, u32)> = Vec::new();

        let mut leaf = self.allocate(PAGE_TYPE_LEAF)?;
        let mut first_key: Option<Vec<u8>> = None;
        for (key, payload) in &rebuilt {
            encode_payload(self.index_type, payload, &mut payload_buf);
            if !leaf.fits(key.len()) {
                let next = self.allocate(PAGE_TYPE_LEAF)?;
                leaf.set_link(Self::page_nr_of(&next));
                level.push((first_key.take().unwrap_or_default(), Self::page_nr_of(&leaf)));
                leaf = next;
            }
            if first_key.is_none() {
                first_key = Some(key.clone());
            }
            leaf.insert(leaf.n(), key, &payload_buf);
            count += 1;
        }
        level.push((first_key.take().unwrap_or_default(), Self::page_nr_of(&leaf)));

        let mut depth = 1u32;
        while level.len() > 1 {
            let mut next_level: Vec<(Vec<u8>, u32)> = Vec::new();
            let mut branch = self.allocate(PAGE_TYPE_BRANCH)?;
            let mut branch_key: Option<Vec<u8>> = None;
            let mut has_link = false;
            for (key, page_nr) in level {
                if !has_link {
                    branch.set_link(page_nr);
                    branch_key = Some(key);
                    has_link = true;
                } else if !branch.fits(key.len()) {
                    next_level.push((branch_key.take().unwrap_or_default(), Self::page_nr_of(&branch)));
                    branch = self.allocate(PAGE_TYPE_BRANCH)?;
                    branch.set_link(page_nr);
                    branch_key = Some(key);
                } else {
                    branch.insert(branch.n(), &key, &page_nr.to_be_bytes());
                }
            }
            next_level.push((branch_key.take().unwrap_or_default(), Self::page_nr_of(&branch)));
            level = next_level;
            depth += 1;
        }

        let posting_base = self.file.size();
        self.file.append(&posting_bytes)?;

        {
            let mut state = self.state.lock();
            state.root = if count == 0 { 0 } else { level[0].1 };
            state.count = count;
            state.depth = if count == 0 { 0 } else { depth };
            state.posting_base = posting_base;
        }
        self.commit()
    }

    pub fn file(&self) -> &FileHandle {
        &self.file
    }

    pub fn close(&self) -> Result<()> {
        self.commit()?;
        self.cache.purge(&self.file)
    }
}

/// Split position by byte budget: the first index where the cumulative
/// entry + key bytes pass half of the total.
fn split_point(entries: &[(Vec<u8>, Vec<u8>)], entry_size: usize) -> usize {
    let total: usize = entries.iter().map(|(k, _)| entry_size + k.len()).sum();
    let mut acc = 0;
    for (i, (k, _)) in entries.iter().enumerate() {
        acc += entry_size + k.len();
        if acc * 2 >= total {
            return (i + 1).min(entries.len() - 1).max(1);
        }
    }
    entries.len() / 2
}

fn glob_to_regex(pattern: &str) -> Result<regex::bytes::Regex> {
    let mut expr = String::with_capacity(pattern.len() * 2 + 2);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            c => expr.push_str(&regex::escape(&c.to_string())),
        }
    }
    expr.push('$');
    regex::bytes::RegexBuilder::new(&expr)
        .unicode(false)
        .build()
        .map_err(|e| Error::new(ErrorKind::Parse, format!("bad pattern: {}", e)))
}

/// Sequential reader over leaf entries via the next-leaf links.
pub struct TreeIter<'a> {
    tree: &'a BTree,
    pos: Option<(u32, usize)>,
}

impl<'a> TreeIter<'a> {
    pub fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Payload)>> {
        loop {
            let (page_nr, ix) = match self.pos {
                Some(p) => p,
                None => return Ok(None),
            };
            let page = self.tree.load(page_nr)?;
            if ix < page.n() {
                let key = page.key(ix).to_vec();
                let payload = decode_payload(self.tree.index_type, page.payload_bytes(ix));
                self.pos = Some((page_nr, ix + 1));
                return Ok(Some((key, payload)));
            }
            let link = page.link();
            self.pos = if link == 0 { None } else { Some((link, 0)) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_tree(dir: &tempfile::TempDir, name: &str, index_type: IndexType) -> BTree {
        BTree::open(
            dir.path().join(name),
            OpenMode::ReadWrite,
            PageCache::new(),
            Some(index_type),
        )
        .unwrap()
    }

    #[test]
    fn unique_insert_and_find() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir, "acc.index", IndexType::Char);

        tree.insert_unique("p00001", 1).unwrap();
        tree.insert_unique("q12345", 2).unwrap();

        assert_eq!(tree.find_unique("p00001").unwrap(), Some(1));
        assert_eq!(tree.find_unique("q12345").unwrap(), Some(2));
        assert_eq!(tree.find_unique("absent").unwrap(), None);
        assert!(tree.contains("p00001").unwrap());
    }

    #[test]
    fn duplicate_key_keeps_first_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir, "acc.index", IndexType::Char);

        tree.insert_unique("p00001", 1).unwrap();
        let err = tree.insert_unique("p00001", 2).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateKey);
        assert_eq!(tree.find_unique("p00001").unwrap(), Some(1));
    }

    #[test]
    fn many_keys_split_and_iterate_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir, "name.index", IndexType::Char);

        let mut keys: Vec<String> = (0..5000).map(|i| format!("key{:05}", i * 7 % 5000)).collect();
        for (i, k) in keys.iter().enumerate() {
            tree.insert_unique(k, i as u32 + 1).unwrap();
        }
        assert!(tree.depth() > 1);
        assert_eq!(tree.size(), 5000);

        keys.sort();
        let mut iter = tree.iter_from(None).unwrap();
        let mut seen = Vec::new();
        while let Some((k, _)) = iter.next_entry().unwrap() {
            seen.push(String::from_utf8(k).unwrap());
        }
        assert_eq!(seen, keys);
    }

    #[test]
    fn multi_index_merges_documents() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir, "kw.index", IndexType::CharMulti);

        tree.insert_multi("kinase", &[3, 1, 2]).unwrap();
        tree.insert_multi("kinase", &[2, 9]).unwrap();

        let payload = tree.find("kinase").unwrap().unwrap();
        let docs = tree.posting_iterator(&payload).unwrap().collect_docs().unwrap();
        assert_eq!(docs, vec![1, 2, 3, 9]);
    }

    #[test]
    fn numeric_range_scan() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir, "year.index", IndexType::NumberMulti);

        tree.insert_multi("1999", &[1]).unwrap();
        tree.insert_multi("2001", &[2]).unwrap();
        tree.insert_multi("2003", &[3]).unwrap();
        tree.insert_multi("2010", &[4]).unwrap();

        let mut bitmap = RoaringBitmap::new();
        let count = tree.find_range("2000", "2005", &mut bitmap).unwrap();
        assert_eq!(count, 2);
        assert_eq!(bitmap.iter().collect::<Vec<_>>(), vec![2, 3]);

        let mut lt = RoaringBitmap::new();
        tree.find_op("2003", QueryOperator::LessThan, &mut lt).unwrap();
        assert_eq!(lt.iter().collect::<Vec<_>>(), vec![1, 2]);

        let mut ge = RoaringBitmap::new();
        tree.find_op("2003", QueryOperator::GreaterOrEqual, &mut ge).unwrap();
        assert_eq!(ge.iter().collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test]
    fn glob_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir, "name.index", IndexType::CharMulti);

        tree.insert_multi("acetyl", &[1]).unwrap();
        tree.insert_multi("acid", &[2]).unwrap();
        tree.insert_multi("actin", &[3]).unwrap();
        tree.insert_multi("beta", &[4]).unwrap();

        let mut prefix = RoaringBitmap::new();
        tree.find_pattern("ac*", &mut prefix).unwrap();
        assert_eq!(prefix.iter().collect::<Vec<_>>(), vec![1, 2, 3]);

        let mut question = RoaringBitmap::new();
        tree.find_pattern("?ct??", &mut question).unwrap();
        assert_eq!(question.iter().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn float_index_orders_numerically() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir, "mass.index", IndexType::FloatMulti);

        tree.insert_multi("10.5", &[1]).unwrap();
        tree.insert_multi("2.5", &[2]).unwrap();
        tree.insert_multi("-3.25", &[3]).unwrap();

        let mut bitmap = RoaringBitmap::new();
        tree.find_range("0", "11", &mut bitmap).unwrap();
        assert_eq!(bitmap.iter().collect::<Vec<_>>(), vec![1, 2]);

        let mut lt = RoaringBitmap::new();
        tree.find_op("0", QueryOperator::LessThan, &mut lt).unwrap();
        assert_eq!(lt.iter().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn batch_build_equals_interactive() {
        let dir = tempfile::tempdir().unwrap();
        let lexicon = Arc::new(Lexicon::new());

        let words: Vec<String> = (0..800).map(|i| format!("term{:04}", (i * 13) % 800)).collect();
        let mut ids = Vec::new();
        for w in &words {
            ids.push(lexicon.store(w.as_bytes()).unwrap());
        }

        let batch_tree = open_tree(&dir, "batch.index", IndexType::CharMulti);
        batch_tree.set_batch_mode(lexicon.clone()).unwrap();
        assert!(batch_tree.insert_multi("x", &[1]).is_err());
        for (i, &id) in ids.iter().enumerate() {
            batch_tree.batch_insert_multi(id, &[i as u32 + 1, i as u32 + 2]).unwrap();
        }
        batch_tree.finish_batch().unwrap();

        let plain_tree = open_tree(&dir, "plain.index", IndexType::CharMulti);
        for (i, w) in words.iter().enumerate() {
            plain_tree.insert_multi(w, &[i as u32 + 1, i as u32 + 2]).unwrap();
        }

        let mut batch_iter = batch_tree.iter_from(None).unwrap();
        let mut plain_iter = plain_tree.iter_from(None).unwrap();
        loop {
            let a = batch_iter.next_entry().unwrap();
            let b = plain_iter.next_entry().unwrap();
            match (a, b) {
                (None, None) => break,
                (Some((ka, pa)), Some((kb, pb))) => {
                    assert_eq!(ka, kb);
                    let da = batch_tree.posting_iterator(&pa).unwrap().collect_docs().unwrap();
                    let db = plain_tree.posting_iterator(&pb).unwrap().collect_docs().unwrap();
                    assert_eq!(da, db);
                }
                _ => panic!("trees differ in length"),
            }
        }
    }

    #[test]
    fn vacuum_preserves_content() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir, "kw.index", IndexType::CharMulti);

        for i in 0..300u32 {
            tree.insert_multi(&format!("kw{:03}", i), &[i + 1, i + 2, i + 100]).unwrap();
        }

        let mut before = Vec::new();
        let mut iter = tree.iter_from(None).unwrap();
        while let Some((k, p)) = iter.next_entry().unwrap() {
            before.push((k, tree.posting_iterator(&p).unwrap().collect_docs().unwrap()));
        }

        let size_before = tree.file_size();
        tree.vacuum().unwrap();
        assert!(tree.file_size() <= size_before);

        let mut after = Vec::new();
        let mut iter = tree.iter_from(None).unwrap();
        while let Some((k, p)) = iter.next_entry().unwrap() {
            after.push((k, tree.posting_iterator(&p).unwrap().collect_docs().unwrap()));
        }
        assert_eq!(before, after);

        // keys still strictly increasing
        for pair in after.windows(2) {
            assert!(pair[0].0 < pair[1].0);
        }
    }

    #[test]
    fn visit_keys_reports_counts() {
        let dir = tempfile::tempdir().unwrap();
        let tree = open_tree(&dir, "kw.index", IndexType::CharMulti);
        tree.insert_multi("one", &[1]).unwrap();
        tree.insert_multi("three", &[1, 2, 3]).unwrap();

        let mut seen = Vec::new();
        tree.visit_keys(|k, count| {
            seen.push((k.to_vec(), count));
            Ok(true)
        })
        .unwrap();
        assert_eq!(seen, vec![(b"one".to_vec(), 1), (b"three".to_vec(), 3)]);
    }

    #[test]
    fn reopen_after_commit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PageCache::new();
        {
            let tree = BTree::open(
                dir.path().join("acc.index"),
                OpenMode::ReadWrite,
                cache.clone(),
                Some(IndexType::Char),
            )
            .unwrap();
            tree.insert_unique("p00001", 7).unwrap();
            tree.close().unwrap();
        }
        let tree = BTree::open(dir.path().join("acc.index"), OpenMode::ReadOnly, cache, None).unwrap();
        assert_eq!(tree.index_type(), IndexType::Char);
        assert_eq!(tree.find_unique("p00001").unwrap(), Some(7));
    }
}
