use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::DocNr;
use crate::io::cache::{PageCache, PageRef, PAGE_SIZE};
use crate::io::file::{FileHandle, OpenMode};
use crate::store::document::FetchedDocument;

const SIGNATURE: u32 = 0x6D36_6473; // "m6ds"
const HEADER_SIZE: u32 = 64;

const PAGE_HEADER_SIZE: usize = 8;
const TEXT_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;
const INDEX_ENTRY_SIZE: usize = 12;
const INDEX_COUNT: usize = TEXT_SIZE / INDEX_ENTRY_SIZE;
// start a new data page when free space drops below this
const TEXT_CUT_OFF: usize = 64;
// per-fragment overhead: docNr + length
const FRAGMENT_HEADER: usize = 6;

const PAGE_TYPE_EMPTY: u8 = 0;
const PAGE_TYPE_DATA: u8 = 1;
const PAGE_TYPE_INDEX_LEAF: u8 = 2;
const PAGE_TYPE_INDEX_BRANCH: u8 = 3;

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

#[derive(Clone, Copy, Default)]
struct Header {
    doc_count: u32,
    index_root: u32,
    next_doc_nr: u32,
    first_data_page: u32,
    last_data_page: u32,
    first_free_data_page: u32,
    raw_size: u64,
}

/// Typed view over a pinned page.
struct Page(PageRef);

impl Page {
    fn page_type(&self) -> u8 {
        self.0.bytes()[0]
    }

    fn set_page_type(&self, t: u8) {
        self.0.write(0, &[t]);
    }

    fn n(&self) -> usize {
        read_u16(self.0.bytes(), 2) as usize
    }

    fn set_n(&self, n: usize) {
        self.0.write(2, &(n as u16).to_be_bytes());
    }

    fn link(&self) -> u32 {
        read_u32(self.0.bytes(), 4)
    }

    fn set_link(&self, link: u32) {
        self.0.write(4, &link.to_be_bytes());
    }

    fn page_nr(&self) -> u32 {
        self.0.page_nr()
    }

    // index page entries: packed (docNr, page, size) triples

    fn entry(&self, ix: usize) -> (u32, u32, u32) {
        let off = PAGE_HEADER_SIZE + ix * INDEX_ENTRY_SIZE;
        let b = self.0.bytes();
        (read_u32(b, off), read_u32(b, off + 4), read_u32(b, off + 8))
    }

    fn set_entry(&self, ix: usize, entry: (u32, u32, u32)) {
        let off = PAGE_HEADER_SIZE + ix * INDEX_ENTRY_SIZE;
        let mut buf = [0u8; INDEX_ENTRY_SIZE];
        buf[0..4].copy_from_slice(&entry.0.to_be_bytes());
        buf[4..8].copy_from_slice(&entry.1.to_be_bytes());
        buf[8..12].copy_from_slice(&entry.2.to_be_bytes());
        self.0.write(off, &buf);
    }

    fn insert_entry(&self, ix: usize, entry: (u32, u32, u32)) {
        let n = self.n();
        self.0.with_mut(|page| {
            let start = PAGE_HEADER_SIZE + ix * INDEX_ENTRY_SIZE;
            let end = PAGE_HEADER_SIZE + n * INDEX_ENTRY_SIZE;
            page.copy_within(start..end, start + INDEX_ENTRY_SIZE);
        });
        self.set_entry(ix, entry);
        self.set_n(n + 1);
    }

    fn move_entries_to(&self, dst: &Page, from: usize) {
        let n = self.n();
        for (j, i) in (from..n).enumerate() {
            dst.set_entry(j, self.entry(i));
        }
        dst.set_n(n - from);
        self.set_n(from);
    }

    /// Append a fragment of `doc` to a data page; returns the number of
    /// payload bytes consumed (zero when the page is too full).
    fn store_fragment(&self, doc_nr: DocNr, data: &[u8]) -> usize {
        let n = self.n();
        let free = TEXT_SIZE - n;
        if free <= TEXT_CUT_OFF {
            return 0;
        }

        let take = data.len().min(free - FRAGMENT_HEADER);
        let off = PAGE_HEADER_SIZE + n;
        let mut buf = Vec::with_capacity(FRAGMENT_HEADER + take);
        buf.extend_from_slice(&doc_nr.to_be_bytes());
        buf.extend_from_slice(&(take as u16).to_be_bytes());
        buf.extend_from_slice(&data[..take]);
        self.0.write(off, &buf);
        self.set_n(n + FRAGMENT_HEADER + take);
        take
    }

    /// Locate the fragment of `doc_nr` on a data page.
    fn load_fragment(&self, doc_nr: DocNr) -> Result<Vec<u8>> {
        let b = self.0.bytes();
        let end = PAGE_HEADER_SIZE + self.n();
        let mut pos = PAGE_HEADER_SIZE;
        while pos + FRAGMENT_HEADER <= end {
            let nr = read_u32(b, pos);
            let len = read_u16(b, pos + 4) as usize;
            pos += FRAGMENT_HEADER;
            if nr == doc_nr {
                return Ok(b[pos..pos + len].to_vec());
            }
            pos += len;
        }
        Err(Error::new(
            ErrorKind::Corrupt,
            format!("document {} not found on page {}", doc_nr, self.page_nr()),
        ))
    }
}

struct StoreState {
    header: Header,
    attrs: Vec<String>,
    dirty: bool,
}

/// Variable-length blob store over chained data pages with an embedded
/// B+-tree mapping docNr to (first page, total size). Single writer
/// during a batch; read-mostly afterwards.
pub struct DocStore {
    file: FileHandle,
    cache: Arc<PageCache>,
    state: Mutex<StoreState>,
    attr_lookup: RwLock<Vec<String>>,
    auto_commit: bool,
}

impl DocStore {
    pub fn open(path: impl AsRef<Path>, mode: OpenMode, cache: Arc<PageCache>) -> Result<DocStore> {
        let file = FileHandle::open(path, mode)?;
        let fresh = file.size() == 0;

        if fresh {
            if mode == OpenMode::ReadOnly {
                return Err(Error::new(ErrorKind::Corrupt, "empty document store"));
            }
            file.truncate(PAGE_SIZE as u64)?;
            let store = DocStore {
                file,
                cache,
                state: Mutex::new(StoreState {
                    header: Header { next_doc_nr: 1, ..Header::default() },
                    attrs: Vec::new(),
                    dirty: true,
                }),
                attr_lookup: RwLock::new(Vec::new()),
                auto_commit: false,
            };
            store.commit()?;
            return Ok(store);
        }

        let page = cache.load(&file, 0)?;
        let b = page.bytes();
        if read_u32(b, 0) != SIGNATURE {
            return Err(Error::new(ErrorKind::Corrupt, "bad document store signature"));
        }
        let header = Header {
            doc_count: read_u32(b, 8),
            index_root: read_u32(b, 12),
            next_doc_nr: read_u32(b, 16),
            first_data_page: read_u32(b, 20),
            last_data_page: read_u32(b, 24),
            first_free_data_page: read_u32(b, 28),
            raw_size: read_u64(b, 32),
        };

        let mut attrs = Vec::new();
        let mut pos = HEADER_SIZE as usize;
        while b[pos] != 0 {
            let len = b[pos] as usize;
            attrs.push(String::from_utf8_lossy(&b[pos + 1..pos + 1 + len]).into_owned());
            pos += 1 + len;
        }

        Ok(DocStore {
            file,
            cache,
            state: Mutex::new(StoreState { header, attrs: attrs.clone(), dirty: false }),
            attr_lookup: RwLock::new(attrs),
            auto_commit: false,
        })
    }

    pub fn size(&self) -> u32 {
        self.state.lock().header.doc_count
    }

    pub fn max_doc_nr(&self) -> DocNr {
        self.state.lock().header.next_doc_nr - 1
    }

    pub fn get_info(&self) -> (u32, u64, u64) {
        let state = self.state.lock();
        (state.header.doc_count, self.file.size(), state.header.raw_size)
    }

    /// With auto-commit every store is flushed on its own; the batch
    /// importer leaves this off and commits once at the end.
    pub fn set_auto_commit(&mut self, auto_commit: bool) {
        self.auto_commit = auto_commit;
    }

    fn load(&self, page_nr: u32) -> Result<Page> {
        if page_nr == 0 {
            return Err(Error::new(ErrorKind::Corrupt, "page number zero in chain"));
        }
        Ok(Page(self.cache.load(&self.file, page_nr)?))
    }

    fn allocate(&self, page_type: u8) -> Result<Page> {
        let size = self.file.size();
        let page_nr = ((size + PAGE_SIZE as u64 - 1) / PAGE_SIZE as u64).max(1) as u32;
        self.file.truncate((page_nr as u64 + 1) * PAGE_SIZE as u64)?;
        let page = self.load(page_nr)?;
        page.0.with_mut(|b| b.fill(0));
        page.set_page_type(page_type);
        Ok(page)
    }

    /// Store one compressed blob; returns the assigned document number.
    pub fn store_document(&self, blob: &[u8], raw_size: u64) -> Result<DocNr> {
        if blob.is_empty() {
            return Err(Error::new(ErrorKind::Unsupported, "empty document"));
        }

        let mut state = self.state.lock();
        let doc_nr = state.header.next_doc_nr;

        let mut page = if state.header.last_data_page == 0 {
            let page = self.allocate(PAGE_TYPE_DATA)?;
            state.header.first_data_page = page.page_nr();
            state.header.last_data_page = page.page_nr();
            page
        } else {
            self.load(state.header.last_data_page)?
        };

        let mut doc_page_nr = page.page_nr();
        let mut remaining = blob;
        let mut first = true;
        while !remaining.is_empty() {
            let written = page.store_fragment(doc_nr, remaining);
            remaining = &remaining[written..];

            if !remaining.is_empty() || written == 0 {
                let next = self.allocate(PAGE_TYPE_DATA)?;
                page.set_link(next.page_nr());
                state.header.last_data_page = next.page_nr();
                if first && written == 0 {
                    // the previous page was too full to start the document
                    doc_page_nr = next.page_nr();
                }
                page = next;
            }
            if written > 0 {
                first = false;
            }
        }

        self.index_insert(&mut state, doc_nr, doc_page_nr, blob.len() as u32)?;

        state.header.next_doc_nr += 1;
        state.header.doc_count += 1;
        state.header.raw_size += raw_size;
        state.dirty = true;

        if self.auto_commit {
            self.commit_locked(&mut state)?;
        }
        Ok(doc_nr)
    }

    fn index_insert(&self, state: &mut StoreState, doc_nr: DocNr, page_nr: u32, size: u32) -> Result<()> {
        if state.header.index_root == 0 {
            let root = self.allocate(PAGE_TYPE_INDEX_LEAF)?;
            state.header.index_root = root.page_nr();
        }

        if let Some((sep, new_page)) = self.insert_into(state.header.index_root, doc_nr, page_nr, size)? {
            let root = self.allocate(PAGE_TYPE_INDEX_BRANCH)?;
            root.set_link(state.header.index_root);
            root.set_entry(0, (sep, new_page, 0));
            root.set_n(1);
            state.header.index_root = root.page_nr();
        }
        Ok(())
    }

    fn insert_into(&self, page_nr: u32, doc_nr: DocNr, doc_page: u32, size: u32) -> Result<Option<(u32, u32)>> {
        let page = self.load(page_nr)?;

        match page.page_type() {
            PAGE_TYPE_INDEX_LEAF => {
                let n = page.n();
                let mut ix = n;
                while ix > 0 && page.entry(ix - 1).0 > doc_nr {
                    ix -= 1;
                }
                if ix > 0 && page.entry(ix - 1).0 == doc_nr {
                    return Err(Error::new(
                        ErrorKind::DuplicateKey,
                        format!("document {} already stored", doc_nr),
                    ));
                }

                if n < INDEX_COUNT {
                    page.insert_entry(ix, (doc_nr, doc_page, size));
                    return Ok(None);
                }

                let split = n / 2;
                let new_leaf = self.allocate(PAGE_TYPE_INDEX_LEAF)?;
                new_leaf.set_link(page.link());
                page.set_link(new_leaf.page_nr());
                page.move_entries_to(&new_leaf, split);

                let sep = new_leaf.entry(0).0;
                if doc_nr >= sep {
                    new_leaf.insert_entry(new_leaf.n(), (doc_nr, doc_page, size));
                } else {
                    page.insert_entry(ix, (doc_nr, doc_page, size));
                }
                Ok(Some((sep, new_leaf.page_nr())))
            }
            PAGE_TYPE_INDEX_BRANCH => {
                let n = page.n();
                let mut child_ix = None;
                for i in (0..n).rev() {
                    if page.entry(i).0 <= doc_nr {
                        child_ix = Some(i);
                        break;
                    }
                }
                let child = match child_ix {
                    Some(i) => page.entry(i).1,
                    None => page.link(),
                };

                let split = self.insert_into(child, doc_nr, doc_page, size)?;
                let (sep, new_child) = match split {
                    Some(s) => s,
                    None => return Ok(None),
                };

                let mut ix = n;
                while ix > 0 && page.entry(ix - 1).0 > sep {
                    ix -= 1;
                }

                if n < INDEX_COUNT {
                    page.insert_entry(ix, (sep, new_child, 0));
                    return Ok(None);
                }

                // branch split: the middle separator moves up
                let split_at = n / 2;
                let (up_key, up_child, _) = page.entry(split_at);
                let new_branch = self.allocate(PAGE_TYPE_INDEX_BRANCH)?;
                new_branch.set_link(up_child);
                page.move_entries_to(&new_branch, split_at + 1);
                page.set_n(split_at);

                if sep >= up_key {
                    let mut j = new_branch.n();
                    while j > 0 && new_branch.entry(j - 1).0 > sep {
                        j -= 1;
                    }
                    new_branch.insert_entry(j, (sep, new_child, 0));
                } else {
                    page.insert_entry(ix.min(page.n()), (sep, new_child, 0));
                }
                Ok(Some((up_key, new_branch.page_nr())))
            }
            t => Err(Error::new(ErrorKind::Corrupt, format!("unexpected page type {}", t))),
        }
    }

    /// Locate a document: (first fragment page, total blob size).
    pub fn fetch_document(&self, doc_nr: DocNr) -> Result<Option<(u32, u32)>> {
        let root = self.state.lock().header.index_root;
        if root == 0 || doc_nr == 0 {
            return Ok(None);
        }

        let mut page_nr = root;
        loop {
            let page = self.load(page_nr)?;
            match page.page_type() {
                PAGE_TYPE_INDEX_BRANCH => {
                    let n = page.n();
                    let mut child = page.link();
                    for i in (0..n).rev() {
                        if page.entry(i).0 <= doc_nr {
                            child = page.entry(i).1;
                            break;
                        }
                    }
                    page_nr = child;
                }
                PAGE_TYPE_INDEX_LEAF => {
                    let n = page.n();
                    for i in 0..n {
                        let (nr, doc_page, size) = page.entry(i);
                        if nr == doc_nr {
                            return Ok(Some((doc_page, size)));
                        }
                        if nr > doc_nr {
                            break;
                        }
                    }
                    return Ok(None);
                }
                t => {
                    return Err(Error::new(
                        ErrorKind::Corrupt,
                        format!("unexpected page type {} in docstore index", t),
                    ))
                }
            }
        }
    }

    /// Streaming reader over the (compressed) blob of a document.
    pub fn document_reader(&self, doc_nr: DocNr) -> Result<Option<ChainReader>> {
        match self.fetch_document(doc_nr)? {
            Some((page_nr, size)) => Ok(Some(ChainReader {
                store_file: self.file.clone(),
                cache: self.cache.clone(),
                doc_nr,
                next_page: page_nr,
                remaining: size as usize,
                buffer: Vec::new(),
                buffer_pos: 0,
            })),
            None => Ok(None),
        }
    }

    pub fn fetch(&self, doc_nr: DocNr) -> Result<Option<FetchedDocument>> {
        match self.document_reader(doc_nr)? {
            Some(reader) => Ok(Some(FetchedDocument::decompress(doc_nr, reader, self)?)),
            None => Ok(None),
        }
    }

    /// Declared for API completeness; the store is append-only.
    pub fn erase_document(&self, _doc_nr: DocNr) -> Result<()> {
        Err(Error::new(ErrorKind::Unsupported, "document erase is not supported"))
    }

    pub fn register_attribute(&self, name: &str) -> Result<u8> {
        {
            let attrs = self.attr_lookup.read();
            if let Some(ix) = attrs.iter().position(|a| a == name) {
                return Ok(ix as u8 + 1);
            }
        }

        let mut state = self.state.lock();
        let mut attrs = self.attr_lookup.write();
        if let Some(ix) = attrs.iter().position(|a| a == name) {
            return Ok(ix as u8 + 1);
        }
        if attrs.len() >= 255 || name.len() > 255 {
            return Err(Error::new(ErrorKind::Overflow, "attribute table overflow"));
        }
        attrs.push(name.to_string());
        state.attrs = attrs.clone();
        state.dirty = true;
        Ok(attrs.len() as u8)
    }

    pub fn attribute_name(&self, attr_nr: u8) -> Result<String> {
        self.attr_lookup
            .read()
            .get(attr_nr as usize - 1)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::Corrupt, format!("unknown attribute {}", attr_nr)))
    }

    pub fn commit(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.commit_locked(&mut state)
    }

    fn commit_locked(&self, state: &mut StoreState) -> Result<()> {
        let page = self.cache.load(&self.file, 0)?;
        let header = state.header;
        let attrs = state.attrs.clone();
        page.with_mut(|b| {
            b[0..4].copy_from_slice(&SIGNATURE.to_be_bytes());
            b[4..8].copy_from_slice(&HEADER_SIZE.to_be_bytes());
            b[8..12].copy_from_slice(&header.doc_count.to_be_bytes());
            b[12..16].copy_from_slice(&header.index_root.to_be_bytes());
            b[16..20].copy_from_slice(&header.next_doc_nr.to_be_bytes());
            b[20..24].copy_from_slice(&header.first_data_page.to_be_bytes());
            b[24..28].copy_from_slice(&header.last_data_page.to_be_bytes());
            b[28..32].copy_from_slice(&header.first_free_data_page.to_be_bytes());
            b[32..40].copy_from_slice(&header.raw_size.to_be_bytes());

            let mut pos = HEADER_SIZE as usize;
            for name in &attrs {
                b[pos] = name.len() as u8;
                b[pos + 1..pos + 1 + name.len()].copy_from_slice(name.as_bytes());
                pos += 1 + name.len();
            }
            b[pos] = 0;
        });
        drop(page);

        self.cache.flush(&self.file)?;
        self.file.sync()?;
        state.dirty = false;
        Ok(())
    }

    /// Check the index and data-chain invariants.
    pub fn validate(&self) -> Result<()> {
        let header = self.state.lock().header;
        if header.index_root == 0 {
            return Ok(());
        }

        // descend to the leftmost leaf, then walk the leaf chain
        let mut page_nr = header.index_root;
        loop {
            let page = self.load(page_nr)?;
            match page.page_type() {
                PAGE_TYPE_INDEX_BRANCH => page_nr = page.link(),
                PAGE_TYPE_INDEX_LEAF => break,
                t => return Err(Error::new(ErrorKind::Corrupt, format!("bad index page type {}", t))),
            }
        }

        let mut last_doc = 0u32;
        let mut seen = 0u32;
        loop {
            let page = self.load(page_nr)?;
            for i in 0..page.n() {
                let (doc_nr, doc_page, _) = page.entry(i);
                if doc_nr <= last_doc {
                    return Err(Error::new(ErrorKind::Corrupt, "docstore index out of order"));
                }
                let data = self.load(doc_page)?;
                if data.page_type() != PAGE_TYPE_DATA {
                    return Err(Error::new(ErrorKind::Corrupt, "index entry points at a non-data page"));
                }
                last_doc = doc_nr;
                seen += 1;
            }
            page_nr = page.link();
            if page_nr == 0 {
                break;
            }
        }

        if seen != header.doc_count {
            return Err(Error::new(ErrorKind::Corrupt, "document count mismatch"));
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.commit()?;
        self.cache.purge(&self.file)
    }
}

/// `Read` over the chained fragments of one document.
pub struct ChainReader {
    store_file: FileHandle,
    cache: Arc<PageCache>,
    doc_nr: DocNr,
    next_page: u32,
    remaining: usize,
    buffer: Vec<u8>,
    buffer_pos: usize,
}

impl Read for ChainReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.buffer_pos >= self.buffer.len() {
            if self.remaining == 0 || self.next_page == 0 {
                return Ok(0);
            }
            let page = self
                .cache
                .load(&self.store_file, self.next_page)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
            let page = Page(page);
            let mut fragment = page
                .load_fragment(self.doc_nr)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
            fragment.truncate(self.remaining);
            self.remaining -= fragment.len();
            self.next_page = page.link();
            self.buffer = fragment;
            self.buffer_pos = 0;
        }

        let take = buf.len().min(self.buffer.len() - self.buffer_pos);
        buf[..take].copy_from_slice(&self.buffer[self.buffer_pos..self.buffer_pos + take]);
        self.buffer_pos += take;
        Ok(take)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &tempfile::TempDir) -> DocStore {
        DocStore::open(dir.path().join("data"), OpenMode::ReadWrite, PageCache::new()).unwrap()
    }

    #[test]
    fn store_and_fetch_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let blob = b"not really compressed but stored verbatim".to_vec();
        let doc_nr = store.store_document(&blob, blob.len() as u64).unwrap();
        assert_eq!(doc_nr, 1);
        store.commit().unwrap();

        let (page, size) = store.fetch_document(1).unwrap().unwrap();
        assert!(page > 0);
        assert_eq!(size as usize, blob.len());

        let mut reader = store.document_reader(1).unwrap().unwrap();
        let mut read_back = Vec::new();
        reader.read_to_end(&mut read_back).unwrap();
        assert_eq!(read_back, blob);
    }

    #[test]
    fn fetch_missing_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        assert!(store.fetch_document(1).unwrap().is_none());
        assert!(store.fetch(1).unwrap().is_none());
    }

    #[test]
    fn large_documents_span_pages() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        // payloads from a fraction of a page to several pages
        let sizes = [100usize, TEXT_SIZE - FRAGMENT_HEADER, TEXT_SIZE, 3 * PAGE_SIZE, 10 * PAGE_SIZE + 17];
        let mut blobs = Vec::new();
        for (i, &size) in sizes.iter().enumerate() {
            let blob: Vec<u8> = (0..size).map(|j| ((i * 7 + j) % 251) as u8).collect();
            let doc_nr = store.store_document(&blob, size as u64).unwrap();
            assert_eq!(doc_nr as usize, i + 1);
            blobs.push(blob);
        }
        store.commit().unwrap();

        for (i, blob) in blobs.iter().enumerate() {
            let mut reader = store.document_reader(i as u32 + 1).unwrap().unwrap();
            let mut read_back = Vec::new();
            reader.read_to_end(&mut read_back).unwrap();
            assert_eq!(&read_back, blob, "doc {}", i + 1);
        }
        store.validate().unwrap();
    }

    #[test]
    fn page_boundary_fragmentation() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        // exactly one fragment worth of payload
        let fits = vec![1u8; TEXT_SIZE - FRAGMENT_HEADER];
        let doc = store.store_document(&fits, 0).unwrap();
        let (first_page, _) = store.fetch_document(doc).unwrap().unwrap();
        let page = store.load(first_page).unwrap();
        assert_eq!(page.load_fragment(doc).unwrap().len(), fits.len());

        // one byte more must continue on a second page
        let spills = vec![2u8; TEXT_SIZE - FRAGMENT_HEADER + 1];
        let doc2 = store.store_document(&spills, 0).unwrap();
        let mut reader = store.document_reader(doc2).unwrap().unwrap();
        let mut read_back = Vec::new();
        reader.read_to_end(&mut read_back).unwrap();
        assert_eq!(read_back, spills);
    }

    #[test]
    fn index_survives_many_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        // enough documents to force leaf splits in the embedded tree
        for i in 0..2000u32 {
            let blob = format!("document number {}", i).into_bytes();
            store.store_document(&blob, blob.len() as u64).unwrap();
        }
        store.commit().unwrap();
        store.validate().unwrap();

        for doc_nr in [1u32, 77, 681, 682, 683, 1500, 2000] {
            let mut reader = store.document_reader(doc_nr).unwrap().unwrap();
            let mut text = Vec::new();
            reader.read_to_end(&mut text).unwrap();
            assert_eq!(text, format!("document number {}", doc_nr - 1).into_bytes());
        }
        assert_eq!(store.size(), 2000);
        assert_eq!(store.max_doc_nr(), 2000);
    }

    #[test]
    fn reopen_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PageCache::new();
        {
            let store =
                DocStore::open(dir.path().join("data"), OpenMode::ReadWrite, cache.clone()).unwrap();
            store.register_attribute("id").unwrap();
            store.register_attribute("title").unwrap();
            store.store_document(b"persisted", 9).unwrap();
            store.close().unwrap();
        }

        let store = DocStore::open(dir.path().join("data"), OpenMode::ReadOnly, cache).unwrap();
        assert_eq!(store.size(), 1);
        assert_eq!(store.attribute_name(1).unwrap(), "id");
        assert_eq!(store.attribute_name(2).unwrap(), "title");
        assert_eq!(store.register_attribute("title").unwrap(), 2);

        let mut reader = store.document_reader(1).unwrap().unwrap();
        let mut text = Vec::new();
        reader.read_to_end(&mut text).unwrap();
        assert_eq!(text, b"persisted");
    }

    #[test]
    fn erase_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.store_document(b"x", 1).unwrap();
        assert_eq!(store.erase_document(1).unwrap_err().kind, ErrorKind::Unsupported);
    }
}
