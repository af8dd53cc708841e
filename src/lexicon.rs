use std::cmp::Ordering;

use parking_lot::RwLock;

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::MAX_KEY_LEN;

const ARENA_SIZE: usize = 8 * 1024 * 1024;

#[derive(Clone, Copy)]
struct EntryLoc {
    arena: u32,
    offset: u32,
    len: u32,
}

struct Node {
    bit: i32,
    id: u32,
    left: u32,
    right: u32,
}

struct LexiconImpl {
    arenas: Vec<Vec<u8>>,
    entries: Vec<EntryLoc>,
    nodes: Vec<Node>,
}

impl LexiconImpl {
    fn new() -> Self {
        LexiconImpl {
            arenas: Vec::new(),
            entries: Vec::new(),
            // head node; id 0 stands for the empty (sentinel) key
            nodes: vec![Node { bit: -1, id: 0, left: 0, right: 0 }],
        }
    }

    fn key(&self, id: u32) -> &[u8] {
        if id == 0 {
            return &[];
        }
        let loc = self.entries[id as usize - 1];
        let arena = &self.arenas[loc.arena as usize];
        &arena[loc.offset as usize..(loc.offset + loc.len) as usize]
    }

    /// Bit `pos` of `key`, bytes padded with zeroes beyond the end.
    fn bit(key: &[u8], pos: i32) -> bool {
        let byte = pos as usize / 8;
        if byte >= key.len() {
            return false;
        }
        key[byte] >> (7 - pos as usize % 8) & 1 == 1
    }

    /// Candidate node for `word`: the trie's best guess, to be verified
    /// by a full comparison.
    fn candidate(&self, word: &[u8]) -> u32 {
        let mut p = 0u32;
        let mut x = self.nodes[0].left;
        while self.nodes[x as usize].bit > self.nodes[p as usize].bit {
            p = x;
            let node = &self.nodes[x as usize];
            x = if Self::bit(word, node.bit) { node.right } else { node.left };
        }
        x
    }

    fn lookup(&self, word: &[u8]) -> u32 {
        let node = self.candidate(word);
        let id = self.nodes[node as usize].id;
        if self.key(id) == word {
            id
        } else {
            0
        }
    }

    fn first_diff_bit(a: &[u8], b: &[u8]) -> Option<i32> {
        let len = a.len().max(b.len());
        for i in 0..len {
            let ba = a.get(i).copied().unwrap_or(0);
            let bb = b.get(i).copied().unwrap_or(0);
            if ba != bb {
                let bit = (ba ^ bb).leading_zeros() as i32;
                return Some(i as i32 * 8 + bit);
            }
        }
        None
    }

    fn intern_bytes(&mut self, word: &[u8]) -> EntryLoc {
        let need = word.len();
        let fits = self
            .arenas
            .last()
            .map(|a| a.capacity() - a.len() >= need)
            .unwrap_or(false);
        if !fits {
            self.arenas.push(Vec::with_capacity(ARENA_SIZE.max(need)));
        }
        let arena_ix = self.arenas.len() - 1;
        let arena = &mut self.arenas[arena_ix];
        let offset = arena.len();
        arena.extend_from_slice(word);
        EntryLoc {
            arena: arena_ix as u32,
            offset: offset as u32,
            len: need as u32,
        }
    }

    fn store(&mut self, word: &[u8]) -> u32 {
        let cand = self.candidate(word);
        let cand_id = self.nodes[cand as usize].id;
        if self.key(cand_id) == word {
            return cand_id;
        }

        let diff = match Self::first_diff_bit(word, self.key(cand_id)) {
            Some(d) => d,
            // only reachable for a key equal to the sentinel
            None => return cand_id,
        };

        let loc = self.intern_bytes(word);
        self.entries.push(loc);
        let id = self.entries.len() as u32;

        // find the insertion point: the first link crossing `diff`
        let mut p = 0u32;
        let mut x = self.nodes[0].left;
        while self.nodes[x as usize].bit > self.nodes[p as usize].bit
            && self.nodes[x as usize].bit < diff
        {
            p = x;
            let node = &self.nodes[x as usize];
            x = if Self::bit(word, node.bit) { node.right } else { node.left };
        }

        let new_ix = self.nodes.len() as u32;
        let word_bit = Self::bit(word, diff);
        self.nodes.push(Node {
            bit: diff,
            id,
            left: if word_bit { x } else { new_ix },
            right: if word_bit { new_ix } else { x },
        });

        let parent = &mut self.nodes[p as usize];
        if parent.left == x {
            parent.left = new_ix;
        } else {
            parent.right = new_ix;
        }

        id
    }
}

/// Monotone string-to-id interner shared by the batch workers. Ids are
/// dense, start at 1 and never change; id 0 is the stop/sentinel word.
///
/// Readers take the shared lock; `store` follows the double-checked
/// pattern: a shared-mode lookup first, then the exclusive lock for the
/// actual insert.
pub struct Lexicon {
    inner: RwLock<LexiconImpl>,
}

impl Default for Lexicon {
    fn default() -> Self {
        Lexicon::new()
    }
}

impl Lexicon {
    pub fn new() -> Self {
        Lexicon { inner: RwLock::new(LexiconImpl::new()) }
    }

    pub fn lookup(&self, word: &[u8]) -> u32 {
        self.inner.read().lookup(word)
    }

    pub fn store(&self, word: &[u8]) -> Result<u32> {
        if word.is_empty() {
            return Err(Error::new(ErrorKind::Unsupported, "empty lexicon key"));
        }
        if word.len() > MAX_KEY_LEN {
            return Err(Error::new(
                ErrorKind::Overflow,
                format!("key longer than {} bytes", MAX_KEY_LEN),
            ));
        }

        let found = self.inner.read().lookup(word);
        if found != 0 {
            return Ok(found);
        }
        Ok(self.inner.write().store(word))
    }

    pub fn get(&self, id: u32) -> Vec<u8> {
        self.inner.read().key(id).to_vec()
    }

    /// Borrow the stored bytes of `id` for the duration of the closure.
    pub fn with_key<R>(&self, id: u32, f: impl FnOnce(&[u8]) -> R) -> R {
        f(self.inner.read().key(id))
    }

    /// Compare two stored keys under the given ordering.
    pub fn compare(&self, a: u32, b: u32, comp: impl Fn(&[u8], &[u8]) -> Ordering) -> Ordering {
        let inner = self.inner.read();
        comp(inner.key(a), inner.key(b))
    }

    pub fn count(&self) -> u32 {
        self.inner.read().entries.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_is_idempotent_and_dense() {
        let lex = Lexicon::new();
        let a = lex.store(b"alpha").unwrap();
        let b = lex.store(b"beta").unwrap();
        let a2 = lex.store(b"alpha").unwrap();

        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(a2, a);
        assert_eq!(lex.count(), 2);
    }

    #[test]
    fn lookup_round_trip() {
        let lex = Lexicon::new();
        let words: Vec<String> = (0..500).map(|i| format!("word{:03}", i)).collect();
        let mut ids = Vec::new();
        for w in &words {
            ids.push(lex.store(w.as_bytes()).unwrap());
        }
        for (w, &id) in words.iter().zip(&ids) {
            assert_eq!(lex.lookup(w.as_bytes()), id);
            assert_eq!(lex.get(id), w.as_bytes());
        }
        assert_eq!(lex.lookup(b"missing"), 0);
    }

    #[test]
    fn prefix_keys_are_distinct() {
        let lex = Lexicon::new();
        let a = lex.store(b"prot").unwrap();
        let b = lex.store(b"protein").unwrap();
        let c = lex.store(b"proteins").unwrap();

        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(lex.lookup(b"prot"), a);
        assert_eq!(lex.lookup(b"protein"), b);
        assert_eq!(lex.lookup(b"proteins"), c);
    }

    #[test]
    fn ids_monotone_in_insertion_order() {
        let lex = Lexicon::new();
        let mut last = 0;
        for w in ["zebra", "yak", "xenopus", "wombat", "vole"] {
            let id = lex.store(w.as_bytes()).unwrap();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn compare_by_id() {
        let lex = Lexicon::new();
        let b = lex.store(b"beta").unwrap();
        let a = lex.store(b"alpha").unwrap();
        assert_eq!(lex.compare(a, b, |x, y| x.cmp(y)), Ordering::Less);
        assert_eq!(lex.compare(b, a, |x, y| x.cmp(y)), Ordering::Greater);
        assert_eq!(lex.compare(a, a, |x, y| x.cmp(y)), Ordering::Equal);
    }

    #[test]
    fn rejects_oversized_keys() {
        let lex = Lexicon::new();
        let ok = vec![b'a'; MAX_KEY_LEN];
        let too_long = vec![b'a'; MAX_KEY_LEN + 1];
        assert!(lex.store(&ok).is_ok());
        let err = lex.store(&too_long).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Overflow);
    }
}
