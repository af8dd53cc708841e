use roaring::RoaringBitmap;

use crate::core::error::Result;
use crate::core::types::{DocNr, WEIGHT_BIT_COUNT};
use crate::io::bits::{read_array, IBitStream, OBitStream};
use crate::io::file::FileHandle;

/// Encode a sorted, duplicate-free document list: γ(first doc) then
/// γ-coded deltas.
pub fn encode_multi(docs: &[DocNr]) -> Result<OBitStream> {
    let mut bits = OBitStream::new();
    let mut prev = 0u32;
    for &doc in docs {
        bits.write_gamma(doc - prev)?;
        prev = doc;
    }
    bits.sync()?;
    Ok(bits)
}

/// Encode a doc-ordered weighted posting list: per posting a γ delta and
/// a fixed-width weight.
pub fn encode_weighted(postings: &[(DocNr, u8)]) -> Result<OBitStream> {
    let mut bits = OBitStream::new();
    let mut prev = 0u32;
    for &(doc, weight) in postings {
        bits.write_gamma(doc - prev)?;
        bits.write_binary(WEIGHT_BIT_COUNT, weight.max(1) as u32)?;
        prev = doc;
    }
    bits.sync()?;
    Ok(bits)
}

/// Lazy decoder over a multi posting list.
pub struct PostingIterator {
    bits: IBitStream,
    remaining: u32,
    doc: DocNr,
}

impl PostingIterator {
    pub fn new(bits: IBitStream, count: u32) -> Self {
        PostingIterator { bits, remaining: count, doc: 0 }
    }

    pub fn from_file(file: FileHandle, offset: u64, count: u32) -> Self {
        PostingIterator::new(IBitStream::from_file(file, offset, 4096), count)
    }

    pub fn count(&self) -> u32 {
        self.remaining
    }

    pub fn next_doc(&mut self) -> Result<Option<DocNr>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        self.doc += self.bits.read_gamma()?;
        Ok(Some(self.doc))
    }

    pub fn into_bitmap(mut self) -> Result<RoaringBitmap> {
        let mut bitmap = RoaringBitmap::new();
        while let Some(doc) = self.next_doc()? {
            bitmap.insert(doc);
        }
        Ok(bitmap)
    }

    pub fn collect_docs(mut self) -> Result<Vec<DocNr>> {
        let mut docs = Vec::with_capacity(self.remaining as usize);
        while let Some(doc) = self.next_doc()? {
            docs.push(doc);
        }
        Ok(docs)
    }
}

/// Lazy decoder over a weighted posting list, in document order.
pub struct WeightedIterator {
    bits: IBitStream,
    remaining: u32,
    total: u32,
    doc: DocNr,
}

impl WeightedIterator {
    pub fn new(bits: IBitStream, count: u32) -> Self {
        WeightedIterator { bits, remaining: count, total: count, doc: 0 }
    }

    pub fn from_file(file: FileHandle, offset: u64, count: u32) -> Self {
        WeightedIterator::new(IBitStream::from_file(file, offset, 4096), count)
    }

    /// Document frequency of the term this list belongs to.
    pub fn count(&self) -> u32 {
        self.total
    }

    pub fn next_posting(&mut self) -> Result<Option<(DocNr, u8)>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        self.doc += self.bits.read_gamma()?;
        let weight = self.bits.read_binary(WEIGHT_BIT_COUNT)? as u8;
        Ok(Some((self.doc, weight)))
    }
}

/// In-document locations for the postings of one term: one γ-coded
/// array per document, concatenated in posting order in the sidecar
/// file.
pub struct IdlIterator {
    bits: IBitStream,
}

impl IdlIterator {
    pub fn from_file(file: FileHandle, offset: u64) -> Self {
        IdlIterator { bits: IBitStream::from_file(file, offset, 4096) }
    }

    /// Locations for the next document; call once per posting, in step
    /// with the posting iterator.
    pub fn next_locations(&mut self) -> Result<Vec<u32>> {
        read_array(&mut self.bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_round_trip() {
        let docs = vec![1u32, 2, 17, 18, 400, 100_000];
        let bits = encode_multi(&docs).unwrap();
        let iter = PostingIterator::new(IBitStream::from_obits(&bits), docs.len() as u32);
        assert_eq!(iter.collect_docs().unwrap(), docs);
    }

    #[test]
    fn weighted_round_trip() {
        let postings = vec![(1u32, 255u8), (5, 1), (6, 128), (5000, 42)];
        let bits = encode_weighted(&postings).unwrap();
        let mut iter = WeightedIterator::new(IBitStream::from_obits(&bits), postings.len() as u32);
        let mut out = Vec::new();
        while let Some(p) = iter.next_posting().unwrap() {
            out.push(p);
        }
        assert_eq!(out, postings);
    }

    #[test]
    fn zero_weight_is_clamped() {
        let bits = encode_weighted(&[(3, 0)]).unwrap();
        let mut iter = WeightedIterator::new(IBitStream::from_obits(&bits), 1);
        assert_eq!(iter.next_posting().unwrap(), Some((3, 1)));
    }

    #[test]
    fn bitmap_materialization() {
        let docs = vec![2u32, 3, 5, 8, 13];
        let bits = encode_multi(&docs).unwrap();
        let bitmap = PostingIterator::new(IBitStream::from_obits(&bits), docs.len() as u32)
            .into_bitmap()
            .unwrap();
        assert_eq!(bitmap.len(), docs.len() as u64);
        for d in docs {
            assert!(bitmap.contains(d));
        }
    }
}
