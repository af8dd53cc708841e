use std::cell::{Cell, UnsafeCell};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::core::error::{Error, ErrorKind, Result};
use crate::io::file::FileHandle;

pub const PAGE_SIZE: usize = 8192;
const CACHE_PAGE_COUNT: usize = 1024;
const BUCKET_COUNT: usize = 4 * CACHE_PAGE_COUNT;
const NIL: u32 = u32::MAX;

fn bucket_for(file_id: u64, page_nr: u32) -> usize {
    let h = file_id
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(page_nr as u64)
        .wrapping_mul(0x2545_F491_4F6C_DD1D);
    (h >> 13) as usize % BUCKET_COUNT
}

struct Slot {
    file: Option<FileHandle>,
    page_nr: u32,
    ref_count: u32,
    dirty: bool,
    link: u32,
    prev: u32,
    next: u32,
}

struct CacheState {
    slots: Vec<Slot>,
    buckets: Vec<u32>,
    lru_head: u32,
    lru_tail: u32,
}

struct Arena(UnsafeCell<Box<[u8]>>);

// Page payloads are only touched while the owning slot is pinned; the
// pin (ref_count) is what serializes access, not the cache mutex.
unsafe impl Sync for Arena {}

/// Process-shared page cache: a fixed arena of slots, a hash table of
/// slot indices and an intrusive LRU list, all index-linked so there are
/// no owning pointer cycles.
pub struct PageCache {
    arena: Arena,
    state: Mutex<CacheState>,
    // handed to PageRefs so they can release their pin on drop
    self_ref: OnceLock<Weak<PageCache>>,
}

impl PageCache {
    pub fn new() -> Arc<PageCache> {
        let mut slots = Vec::with_capacity(CACHE_PAGE_COUNT);
        for i in 0..CACHE_PAGE_COUNT {
            slots.push(Slot {
                file: None,
                page_nr: 0,
                ref_count: 0,
                dirty: false,
                link: NIL,
                prev: if i == 0 { NIL } else { i as u32 - 1 },
                next: if i + 1 == CACHE_PAGE_COUNT { NIL } else { i as u32 + 1 },
            });
        }

        let mut data = vec![0u8; CACHE_PAGE_COUNT * PAGE_SIZE].into_boxed_slice();
        // keep the arena resident; failure is acceptable
        unsafe {
            libc::mlock(data.as_mut_ptr() as *const libc::c_void, data.len());
        }

        let cache = Arc::new(PageCache {
            arena: Arena(UnsafeCell::new(data)),
            state: Mutex::new(CacheState {
                slots,
                buckets: vec![NIL; BUCKET_COUNT],
                lru_head: 0,
                lru_tail: CACHE_PAGE_COUNT as u32 - 1,
            }),
            self_ref: OnceLock::new(),
        });
        let _ = cache.self_ref.set(Arc::downgrade(&cache));
        cache
    }

    /// The process-wide default instance.
    pub fn global() -> Arc<PageCache> {
        static GLOBAL: OnceLock<Arc<PageCache>> = OnceLock::new();
        GLOBAL.get_or_init(PageCache::new).clone()
    }

    fn page_ptr(&self, slot: u32) -> *mut u8 {
        unsafe { (*self.arena.0.get()).as_mut_ptr().add(slot as usize * PAGE_SIZE) }
    }

    fn arc(&self) -> Arc<PageCache> {
        self.self_ref
            .get()
            .and_then(|w| w.upgrade())
            .expect("page cache constructed outside PageCache::new")
    }

    /// Load the page `page_nr` of `file`, pinning its slot.
    pub fn load(&self, file: &FileHandle, page_nr: u32) -> Result<PageRef> {
        let mut state = self.state.lock();

        let bucket = bucket_for(file.id(), page_nr);
        let mut index = state.buckets[bucket];
        while index != NIL {
            let slot = &state.slots[index as usize];
            if slot.page_nr == page_nr
                && slot.file.as_ref().map(|f| f.id()) == Some(file.id())
            {
                state.slots[index as usize].ref_count += 1;
                Self::lru_to_head(&mut state, index);
                return Ok(self.make_ref(index, page_nr));
            }
            index = state.slots[index as usize].link;
        }

        // miss: recycle the least recently used unpinned slot
        let mut victim = state.lru_tail;
        while victim != NIL && state.slots[victim as usize].ref_count > 0 {
            victim = state.slots[victim as usize].prev;
        }
        if victim == NIL {
            return Err(Error::new(ErrorKind::CacheFull, "no evictable page in cache"));
        }

        self.evict(&mut state, victim)?;
        Self::lru_to_head(&mut state, victim);

        let bucket_head = state.buckets[bucket];
        {
            let slot = &mut state.slots[victim as usize];
            slot.file = Some(file.clone());
            slot.page_nr = page_nr;
            slot.dirty = false;
            slot.ref_count = 1;
            slot.link = bucket_head;
        }
        state.buckets[bucket] = victim;

        let page = unsafe { std::slice::from_raw_parts_mut(self.page_ptr(victim), PAGE_SIZE) };
        let read = file.pread_some(page, page_nr as u64 * PAGE_SIZE as u64)?;
        page[read..].fill(0);

        Ok(self.make_ref(victim, page_nr))
    }

    fn make_ref(&self, slot: u32, page_nr: u32) -> PageRef {
        PageRef {
            cache: self.arc(),
            slot,
            page_nr: Cell::new(page_nr),
            dirty: Cell::new(false),
        }
    }

    fn lru_to_head(state: &mut CacheState, index: u32) {
        if state.lru_head == index {
            return;
        }
        let (prev, next) = {
            let slot = &state.slots[index as usize];
            (slot.prev, slot.next)
        };
        if prev != NIL {
            state.slots[prev as usize].next = next;
        }
        if next != NIL {
            state.slots[next as usize].prev = prev;
        }
        if state.lru_tail == index {
            state.lru_tail = prev;
        }
        state.slots[index as usize].prev = NIL;
        state.slots[index as usize].next = state.lru_head;
        let head = state.lru_head;
        if head != NIL {
            state.slots[head as usize].prev = index;
        }
        state.lru_head = index;
    }

    /// Write back (if dirty) and unhook `index` from its bucket.
    fn evict(&self, state: &mut CacheState, index: u32) -> Result<()> {
        let (file, page_nr, dirty) = {
            let slot = &state.slots[index as usize];
            (slot.file.clone(), slot.page_nr, slot.dirty)
        };
        let file = match file {
            Some(f) => f,
            None => return Ok(()),
        };

        if dirty {
            let page = unsafe { std::slice::from_raw_parts(self.page_ptr(index), PAGE_SIZE) };
            file.pwrite(page, page_nr as u64 * PAGE_SIZE as u64)?;
        }

        let bucket = bucket_for(file.id(), page_nr);
        let mut ix = state.buckets[bucket];
        if ix == index {
            state.buckets[bucket] = state.slots[index as usize].link;
        } else {
            while ix != NIL {
                let next = state.slots[ix as usize].link;
                if next == index {
                    state.slots[ix as usize].link = state.slots[index as usize].link;
                    break;
                }
                ix = next;
            }
        }

        let slot = &mut state.slots[index as usize];
        slot.file = None;
        slot.page_nr = 0;
        slot.dirty = false;
        slot.link = NIL;
        Ok(())
    }

    fn reference(&self, slot: u32) {
        let mut state = self.state.lock();
        state.slots[slot as usize].ref_count += 1;
    }

    fn release(&self, slot: u32, dirty: bool) {
        let mut state = self.state.lock();
        let s = &mut state.slots[slot as usize];
        assert!(s.ref_count > 0, "page released more often than referenced");
        s.ref_count -= 1;
        if dirty {
            s.dirty = true;
        }
    }

    fn touch(&self, slot: u32) {
        let mut state = self.state.lock();
        state.slots[slot as usize].dirty = true;
    }

    /// Exchange the on-disk locations of two pinned pages of one file.
    pub fn swap(&self, a: &PageRef, b: &PageRef) -> Result<()> {
        if a.slot == b.slot {
            return Ok(());
        }
        let mut state = self.state.lock();

        let file_a = state.slots[a.slot as usize].file.clone();
        let file_b = state.slots[b.slot as usize].file.clone();
        let (file_a, file_b) = match (file_a, file_b) {
            (Some(fa), Some(fb)) if fa.id() == fb.id() => (fa, fb),
            _ => return Err(Error::new(ErrorKind::Unsupported, "swap requires pages of one file")),
        };

        for (slot, file) in [(a.slot, &file_a), (b.slot, &file_b)] {
            let page_nr = state.slots[slot as usize].page_nr;
            let bucket = bucket_for(file.id(), page_nr);
            let mut ix = state.buckets[bucket];
            if ix == slot {
                state.buckets[bucket] = state.slots[slot as usize].link;
            } else {
                while ix != NIL {
                    let next = state.slots[ix as usize].link;
                    if next == slot {
                        state.slots[ix as usize].link = state.slots[slot as usize].link;
                        break;
                    }
                    ix = next;
                }
            }
        }

        let nr_a = state.slots[a.slot as usize].page_nr;
        let nr_b = state.slots[b.slot as usize].page_nr;
        state.slots[a.slot as usize].page_nr = nr_b;
        state.slots[b.slot as usize].page_nr = nr_a;
        state.slots[a.slot as usize].dirty = true;
        state.slots[b.slot as usize].dirty = true;

        for slot in [a.slot, b.slot] {
            let page_nr = state.slots[slot as usize].page_nr;
            let bucket = bucket_for(file_a.id(), page_nr);
            state.slots[slot as usize].link = state.buckets[bucket];
            state.buckets[bucket] = slot;
        }

        a.page_nr.set(nr_b);
        b.page_nr.set(nr_a);
        Ok(())
    }

    /// Write all dirty pages of `file`.
    pub fn flush(&self, file: &FileHandle) -> Result<()> {
        let mut state = self.state.lock();
        for index in 0..CACHE_PAGE_COUNT {
            let slot = &state.slots[index];
            if slot.dirty && slot.file.as_ref().map(|f| f.id()) == Some(file.id()) {
                let page_nr = slot.page_nr;
                let page = unsafe { std::slice::from_raw_parts(self.page_ptr(index as u32), PAGE_SIZE) };
                file.pwrite(page, page_nr as u64 * PAGE_SIZE as u64)?;
                state.slots[index].dirty = false;
            }
        }
        Ok(())
    }

    /// Drop all pages of `file` from the cache, writing dirty ones back.
    /// All of them must be unpinned.
    pub fn purge(&self, file: &FileHandle) -> Result<()> {
        let mut state = self.state.lock();
        for index in 0..CACHE_PAGE_COUNT as u32 {
            let slot = &state.slots[index as usize];
            if slot.file.as_ref().map(|f| f.id()) == Some(file.id()) {
                if slot.ref_count > 0 {
                    return Err(Error::new(ErrorKind::Unsupported, "purge of a pinned page"));
                }
                self.evict(&mut state, index)?;
            }
        }
        Ok(())
    }

    /// Drop cached pages at or beyond `size` (the file is being truncated).
    pub fn truncate(&self, file: &FileHandle, size: u64) -> Result<()> {
        let mut state = self.state.lock();
        for index in 0..CACHE_PAGE_COUNT as u32 {
            let slot = &mut state.slots[index as usize];
            if slot.file.as_ref().map(|f| f.id()) == Some(file.id())
                && slot.page_nr as u64 * PAGE_SIZE as u64 >= size
            {
                if slot.ref_count > 0 {
                    return Err(Error::new(ErrorKind::Unsupported, "truncate of a pinned page"));
                }
                slot.dirty = false; // contents are gone with the truncation
                self.evict(&mut state, index)?;
            }
        }
        Ok(())
    }
}

/// Pinned page handle. While a `PageRef` (or a clone) is alive the slot
/// cannot be recycled; dropping it releases the pin, carrying the dirty
/// flag accumulated through `write`/`with_mut`/`touch`.
pub struct PageRef {
    cache: Arc<PageCache>,
    slot: u32,
    page_nr: Cell<u32>,
    dirty: Cell<bool>,
}

impl std::fmt::Debug for PageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageRef")
            .field("slot", &self.slot)
            .field("page_nr", &self.page_nr.get())
            .field("dirty", &self.dirty.get())
            .finish()
    }
}

impl PageRef {
    pub fn page_nr(&self) -> u32 {
        self.page_nr.get()
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.cache.page_ptr(self.slot), PAGE_SIZE) }
    }

    /// Mutate the page contents; marks the page dirty.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.dirty.set(true);
        let page = unsafe { std::slice::from_raw_parts_mut(self.cache.page_ptr(self.slot), PAGE_SIZE) };
        f(page)
    }

    pub fn write(&self, offset: usize, data: &[u8]) {
        self.with_mut(|page| page[offset..offset + data.len()].copy_from_slice(data));
    }

    /// Mark dirty without writing.
    pub fn touch(&self) {
        self.dirty.set(true);
        self.cache.touch(self.slot);
    }
}

impl Clone for PageRef {
    fn clone(&self) -> Self {
        self.cache.reference(self.slot);
        PageRef {
            cache: self.cache.clone(),
            slot: self.slot,
            page_nr: Cell::new(self.page_nr.get()),
            dirty: Cell::new(false),
        }
    }
}

impl Drop for PageRef {
    fn drop(&mut self) {
        self.cache.release(self.slot, self.dirty.get());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::file::OpenMode;

    fn scratch_file(dir: &tempfile::TempDir, name: &str, pages: u32) -> FileHandle {
        let file = FileHandle::open(dir.path().join(name), OpenMode::ReadWrite).unwrap();
        file.truncate(pages as u64 * PAGE_SIZE as u64).unwrap();
        file
    }

    #[test]
    fn load_hit_and_writeback() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PageCache::new();
        let file = scratch_file(&dir, "a", 4);

        {
            let page = cache.load(&file, 2).unwrap();
            page.write(0, b"payload");
        }
        cache.flush(&file).unwrap();

        let mut buf = [0u8; 7];
        file.pread(&mut buf, 2 * PAGE_SIZE as u64).unwrap();
        assert_eq!(&buf, b"payload");

        // hit returns the same content without re-reading
        let page = cache.load(&file, 2).unwrap();
        assert_eq!(&page.bytes()[..7], b"payload");
    }

    #[test]
    fn eviction_writes_dirty_pages() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PageCache::new();
        let file = scratch_file(&dir, "a", CACHE_PAGE_COUNT as u32 + 8);

        {
            let page = cache.load(&file, 0).unwrap();
            page.write(0, b"first");
        }
        // churn through enough pages to evict page 0
        for nr in 1..CACHE_PAGE_COUNT as u32 + 4 {
            let _ = cache.load(&file, nr).unwrap();
        }

        let mut buf = [0u8; 5];
        file.pread(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"first");
    }

    #[test]
    fn cache_full_when_all_pinned() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PageCache::new();
        let file = scratch_file(&dir, "a", CACHE_PAGE_COUNT as u32 + 1);

        let mut pins = Vec::new();
        for nr in 0..CACHE_PAGE_COUNT as u32 {
            pins.push(cache.load(&file, nr).unwrap());
        }
        let err = cache.load(&file, CACHE_PAGE_COUNT as u32).unwrap_err();
        assert_eq!(err.kind, ErrorKind::CacheFull);

        pins.pop();
        assert!(cache.load(&file, CACHE_PAGE_COUNT as u32).is_ok());
    }

    #[test]
    fn swap_exchanges_disk_locations() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PageCache::new();
        let file = scratch_file(&dir, "a", 2);

        {
            let a = cache.load(&file, 0).unwrap();
            let b = cache.load(&file, 1).unwrap();
            a.write(0, b"AAAA");
            b.write(0, b"BBBB");
            cache.swap(&a, &b).unwrap();
            assert_eq!(a.page_nr(), 1);
            assert_eq!(b.page_nr(), 0);
        }
        cache.flush(&file).unwrap();

        let mut buf = [0u8; 4];
        file.pread(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"BBBB");
        file.pread(&mut buf, PAGE_SIZE as u64).unwrap();
        assert_eq!(&buf, b"AAAA");
    }

    #[test]
    fn purge_refuses_pinned_pages() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PageCache::new();
        let file = scratch_file(&dir, "a", 2);

        let pin = cache.load(&file, 0).unwrap();
        assert!(cache.purge(&file).is_err());
        drop(pin);
        cache.purge(&file).unwrap();
    }

    #[test]
    fn truncate_discards_cached_tail() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PageCache::new();
        let file = scratch_file(&dir, "a", 4);

        {
            let page = cache.load(&file, 3).unwrap();
            page.write(0, b"tail");
        }
        cache.truncate(&file, 2 * PAGE_SIZE as u64).unwrap();
        file.truncate(2 * PAGE_SIZE as u64).unwrap();

        // reloading past the end reads zeroes, not the stale cache entry
        file.truncate(4 * PAGE_SIZE as u64).unwrap();
        let page = cache.load(&file, 3).unwrap();
        assert_eq!(&page.bytes()[..4], &[0, 0, 0, 0]);
    }
}
