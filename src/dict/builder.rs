use crate::core::error::{Error, ErrorKind, Result};
use crate::io::file::FileHandle;

pub const MIN_WORD_LENGTH: usize = 4;
pub const MIN_WORD_OCCURRENCE: u32 = 4;
const MAX_STRING_LENGTH: usize = 256;
const HASH_TABLE_SIZE: usize = 1 << 20;
const MAX_AUTOMATON_SIZE: usize = u32::MAX as usize;

/// One packed automaton transition:
/// (attr:u8, last:1, term:1, df:u16, dest:u32) in 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Transition(pub u64);

impl Transition {
    pub fn new(attr: u8, last: bool, term: bool, df: u16, dest: u32) -> Self {
        let mut d = dest as u64;
        d |= (df as u64) << 32;
        if term {
            d |= 1 << 48;
        }
        if last {
            d |= 1 << 49;
        }
        d |= (attr as u64) << 56;
        Transition(d)
    }

    pub fn attr(self) -> u8 {
        (self.0 >> 56) as u8
    }

    pub fn last(self) -> bool {
        self.0 >> 49 & 1 == 1
    }

    pub fn term(self) -> bool {
        self.0 >> 48 & 1 == 1
    }

    pub fn df(self) -> u16 {
        (self.0 >> 32) as u16
    }

    pub fn dest(self) -> u32 {
        self.0 as u32
    }

    fn with_last(self) -> Self {
        Transition(self.0 | 1 << 49)
    }
}

struct Bucket {
    addr: u32,
    size: u32,
    next: u32,
}

/// Equivalence-class registry: states (transition sequences) are hashed
/// and identical ones reuse the first stored address, which is what
/// makes the automaton minimal.
struct StateHashTable {
    table: Vec<u32>,
    buckets: Vec<Bucket>,
}

impl StateHashTable {
    fn new() -> Self {
        StateHashTable {
            table: vec![0; HASH_TABLE_SIZE],
            buckets: vec![Bucket { addr: 0, size: 0, next: 0 }], // dummy
        }
    }

    fn hash(state: &[Transition]) -> usize {
        let sum: u64 = state.iter().fold(0u64, |acc, t| acc.wrapping_add(t.0));
        (sum.wrapping_mul(324_027) >> 13) as usize % HASH_TABLE_SIZE
    }

    fn lookup(&mut self, state: &mut Vec<Transition>, automaton: &mut Vec<Transition>) -> Result<u32> {
        if state.is_empty() {
            state.push(Transition::default());
        }
        let n = state.len();
        state[n - 1] = state[n - 1].with_last();

        let slot = Self::hash(state);
        let mut ix = self.table[slot];
        while ix != 0 {
            let bucket = &self.buckets[ix as usize];
            if bucket.size as usize == state.len() {
                let addr = bucket.addr as usize;
                if automaton[addr..addr + state.len()]
                    .iter()
                    .zip(state.iter())
                    .all(|(a, b)| a == b)
                {
                    return Ok(bucket.addr);
                }
            }
            ix = bucket.next;
        }

        let addr = automaton.len();
        if addr + state.len() > MAX_AUTOMATON_SIZE {
            return Err(Error::new(ErrorKind::Overflow, "dictionary automaton overflow"));
        }
        automaton.extend_from_slice(state);

        self.buckets.push(Bucket {
            addr: addr as u32,
            size: state.len() as u32,
            next: self.table[slot],
        });
        self.table[slot] = self.buckets.len() as u32 - 1;
        Ok(addr as u32)
    }
}

/// Builds the minimal acyclic automaton from the sorted full-text
/// vocabulary using a stack of larval states, one per key depth.
pub struct DictionaryBuilder {
    min_word_occurrence: u32,
    automaton: Vec<Transition>,
    hash: StateHashTable,
    s0: [u8; MAX_STRING_LENGTH],
    larval: Vec<Vec<Transition>>,
    is_terminal: [bool; MAX_STRING_LENGTH + 1],
    df: [u16; MAX_STRING_LENGTH + 1],
    depth: usize,
    accepted: u64,
}

impl DictionaryBuilder {
    pub fn new(doc_count: u32) -> Self {
        let from_corpus = (doc_count.max(1) as f64).log10() as u32;
        DictionaryBuilder {
            min_word_occurrence: from_corpus.max(MIN_WORD_OCCURRENCE),
            automaton: Vec::new(),
            hash: StateHashTable::new(),
            s0: [0; MAX_STRING_LENGTH],
            larval: vec![Vec::new(); MAX_STRING_LENGTH + 1],
            is_terminal: [false; MAX_STRING_LENGTH + 1],
            df: [0; MAX_STRING_LENGTH + 1],
            depth: 0,
            accepted: 0,
        }
    }

    /// Feed the next key in sorted order with its posting count. Keys
    /// failing the triple filter (occurrence, length, digits) are
    /// ignored.
    pub fn visit(&mut self, key: &[u8], count: u32) -> Result<()> {
        let digits = key.iter().filter(|b| b.is_ascii_digit()).count();
        if count < self.min_word_occurrence
            || key.len() < MIN_WORD_LENGTH
            || key.len() >= MAX_STRING_LENGTH
            || digits >= 2
        {
            return Ok(());
        }

        let df = count.min(u16::MAX as u32) as u16;
        let q = key.len();

        let mut p = 0;
        loop {
            let a = key.get(p).copied().unwrap_or(0);
            let b = self.s0[p];
            if a != b {
                if a < b {
                    return Err(Error::new(ErrorKind::Corrupt, "dictionary keys are unsorted"));
                }
                break;
            }
            if a == 0 {
                break;
            }
            p += 1;
        }

        while self.depth > p {
            self.freeze_level()?;
        }

        while self.depth < q {
            self.s0[self.depth] = key[self.depth];
            self.depth += 1;
            self.is_terminal[self.depth] = false;
            self.df[self.depth] = 0;
            self.larval[self.depth].clear();
        }

        self.s0[q] = 0;
        self.is_terminal[q] = true;
        self.df[q] = df;
        self.accepted += 1;
        Ok(())
    }

    fn freeze_level(&mut self) -> Result<()> {
        let i = self.depth;
        let mut state = std::mem::take(&mut self.larval[i]);
        let dest = self.hash.lookup(&mut state, &mut self.automaton)?;
        self.larval[i] = state;

        let trans = Transition::new(self.s0[i - 1], false, self.is_terminal[i], self.df[i], dest);
        self.depth -= 1;
        self.larval[self.depth].push(trans);
        Ok(())
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Freeze the remaining larval states and write the dictionary
    /// file: doc count, transition count, the packed transitions and a
    /// trailing zero marking the current format.
    pub fn finish(mut self, doc_count: u32, file: &FileHandle) -> Result<()> {
        while self.depth > 0 {
            self.freeze_level()?;
        }

        let mut root = std::mem::take(&mut self.larval[0]);
        let start = self.hash.lookup(&mut root, &mut self.automaton)?;
        self.automaton.push(Transition::new(0, false, false, 0, start));

        let mut out = Vec::with_capacity(8 + self.automaton.len() * 8 + 4);
        out.extend_from_slice(&doc_count.to_le_bytes());
        out.extend_from_slice(&(self.automaton.len() as u32).to_le_bytes());
        for t in &self.automaton {
            out.extend_from_slice(&t.0.to_le_bytes());
        }
        out.extend_from_slice(&0u32.to_le_bytes());

        file.truncate(0)?;
        file.append(&out)?;
        file.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::file::OpenMode;

    #[test]
    fn transition_packing_round_trip() {
        let t = Transition::new(b'x', true, false, 12345, 0xDEAD_BEEF);
        assert_eq!(t.attr(), b'x');
        assert!(t.last());
        assert!(!t.term());
        assert_eq!(t.df(), 12345);
        assert_eq!(t.dest(), 0xDEAD_BEEF);
    }

    #[test]
    fn filter_rejects_short_rare_and_numeric() {
        let mut builder = DictionaryBuilder::new(1000);
        builder.visit(b"abc", 100).unwrap(); // too short
        builder.visit(b"abcd", 2).unwrap(); // too rare
        builder.visit(b"ab12cd", 100).unwrap(); // too many digits
        builder.visit(b"abcde", 100).unwrap();
        assert_eq!(builder.accepted(), 1);
    }

    #[test]
    fn unsorted_input_is_corrupt() {
        let mut builder = DictionaryBuilder::new(10);
        builder.visit(b"beta", 10).unwrap();
        let err = builder.visit(b"alpha", 10).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Corrupt);
    }

    #[test]
    fn shared_suffixes_are_merged() {
        // two automata over word sets with shared suffixes must be
        // smaller than the trie of the same words
        let dir = tempfile::tempdir().unwrap();
        let file = FileHandle::open(dir.path().join("dict"), OpenMode::ReadWrite).unwrap();

        let mut builder = DictionaryBuilder::new(1000);
        for word in ["diffusion", "fission", "fusion", "mission", "passion"] {
            builder.visit(word.as_bytes(), 100).unwrap();
        }
        builder.finish(1000, &file).unwrap();

        let size = file.size();
        let transition_count = (size - 8 - 4) / 8;
        // a plain trie would need one transition per character (41)
        assert!(transition_count < 30, "automaton not minimal: {} transitions", transition_count);
    }
}
