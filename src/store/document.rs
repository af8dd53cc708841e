use std::collections::HashMap;
use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::analysis::tokenizer::{case_fold, Tokenizer};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{DataType, DocNr, MAX_KEY_LEN};
use crate::store::docstore::DocStore;

const MAX_ATTRIBUTE_COUNT: usize = 255;
const MAX_ATTRIBUTE_LEN: usize = 255;

/// Token list destined for one named index. Token values are ids in the
/// document-local lexicon; the index worker remaps them to global ids.
pub struct IndexTokens {
    pub index_name: String,
    pub data_type: DataType,
    pub tokens: Vec<u32>,
}

pub enum IndexValue {
    Str { index_name: String, value: String, unique: bool },
    Number { index_name: String, value: String, unique: bool },
    Float { index_name: String, value: f64, unique: bool },
}

/// A document under construction during a batch import: the raw text,
/// its attributes and links, plus the per-field indexing directives
/// collected by the record parser.
pub struct InputDocument {
    doc_nr: DocNr,
    text: String,
    attributes: Vec<(String, String)>,
    links: Vec<(String, Vec<String>)>,
    fasta: Option<String>,
    local_words: Vec<Vec<u8>>,
    local_ids: HashMap<Vec<u8>, u32>,
    token_lists: Vec<IndexTokens>,
    values: Vec<IndexValue>,
    compressed: Vec<u8>,
}

impl InputDocument {
    pub fn new(text: impl Into<String>) -> Self {
        InputDocument {
            doc_nr: 0,
            text: text.into(),
            attributes: Vec::new(),
            links: Vec::new(),
            fasta: None,
            local_words: Vec::new(),
            local_ids: HashMap::new(),
            token_lists: Vec::new(),
            values: Vec::new(),
            compressed: Vec::new(),
        }
    }

    pub fn doc_nr(&self) -> DocNr {
        self.doc_nr
    }

    pub(crate) fn set_doc_nr(&mut self, doc_nr: DocNr) {
        self.doc_nr = doc_nr;
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn fasta(&self) -> Option<&str> {
        self.fasta.as_deref()
    }

    pub fn set_fasta(&mut self, fasta: impl Into<String>) {
        self.fasta = Some(fasta.into());
    }

    pub fn set_attribute(&mut self, name: &str, value: &str) -> Result<()> {
        if self.attributes.len() >= MAX_ATTRIBUTE_COUNT {
            return Err(Error::new(ErrorKind::Overflow, "too many attributes"));
        }
        let mut value = value.to_string();
        if value.len() > MAX_ATTRIBUTE_LEN {
            eprintln!("warning: attribute '{}' truncated to {} bytes", name, MAX_ATTRIBUTE_LEN);
            let mut end = MAX_ATTRIBUTE_LEN;
            while !value.is_char_boundary(end) {
                end -= 1;
            }
            value.truncate(end);
        }
        self.attributes.push((name.to_string(), value));
        Ok(())
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }

    pub fn add_link(&mut self, db: &str, id: &str) {
        let id = case_fold(id);
        match self.links.iter_mut().find(|(d, _)| d == db) {
            Some((_, ids)) => ids.push(id),
            None => self.links.push((db.to_string(), vec![id])),
        }
    }

    pub fn links(&self) -> &[(String, Vec<String>)] {
        &self.links
    }

    fn local_id(&mut self, word: &[u8]) -> Result<u32> {
        if word.len() > MAX_KEY_LEN {
            return Err(Error::new(
                ErrorKind::Overflow,
                format!("token longer than {} bytes", MAX_KEY_LEN),
            ));
        }
        if let Some(&id) = self.local_ids.get(word) {
            return Ok(id);
        }
        self.local_words.push(word.to_vec());
        let id = self.local_words.len() as u32;
        self.local_ids.insert(word.to_vec(), id);
        Ok(id)
    }

    /// Tokenize `text` into the named index (full text with in-document
    /// locations).
    pub fn index_text(&mut self, index_name: &str, text: &str) -> Result<()> {
        let words: Vec<String> = Tokenizer::new(text).collect();
        let mut tokens = Vec::with_capacity(words.len());
        for w in &words {
            tokens.push(self.local_id(w.as_bytes())?);
        }
        self.push_tokens(index_name, DataType::Text, tokens);
        Ok(())
    }

    /// Tokenize `text` into the synthetic full-text field only.
    pub fn index_string(&mut self, index_name: &str, text: &str) -> Result<()> {
        let words: Vec<String> = Tokenizer::new(text).collect();
        let mut tokens = Vec::with_capacity(words.len());
        for w in &words {
            tokens.push(self.local_id(w.as_bytes())?);
        }
        self.push_tokens(index_name, DataType::String, tokens);
        Ok(())
    }

    fn push_tokens(&mut self, index_name: &str, data_type: DataType, tokens: Vec<u32>) {
        match self
            .token_lists
            .iter_mut()
            .find(|t| t.index_name == index_name && t.data_type == data_type)
        {
            Some(list) => list.tokens.extend(tokens),
            None => self.token_lists.push(IndexTokens {
                index_name: index_name.to_string(),
                data_type,
                tokens,
            }),
        }
    }

    /// Untokenized string value, normalized like query terms.
    pub fn index_value(&mut self, index_name: &str, value: &str, unique: bool) {
        self.values.push(IndexValue::Str {
            index_name: index_name.to_string(),
            value: case_fold(value),
            unique,
        });
    }

    pub fn index_number(&mut self, index_name: &str, value: &str, unique: bool) {
        self.values.push(IndexValue::Number {
            index_name: index_name.to_string(),
            value: value.to_string(),
            unique,
        });
    }

    pub fn index_float(&mut self, index_name: &str, value: f64, unique: bool) {
        self.values.push(IndexValue::Float {
            index_name: index_name.to_string(),
            value,
            unique,
        });
    }

    pub fn token_lists(&self) -> &[IndexTokens] {
        &self.token_lists
    }

    pub fn values(&self) -> &[IndexValue] {
        &self.values
    }

    pub fn local_word(&self, local_id: u32) -> &[u8] {
        &self.local_words[local_id as usize - 1]
    }

    /// Build the on-disk blob: attributes, links block and text, deflated
    /// without a zlib header, preceded by a CRC of the uncompressed
    /// payload.
    pub fn compress(&mut self, store: &DocStore) -> Result<()> {
        let mut payload = Vec::with_capacity(self.text.len() / 2 + 64);

        for (name, value) in &self.attributes {
            let attr_nr = store.register_attribute(name)?;
            payload.push(attr_nr);
            payload.push(value.len() as u8);
            payload.extend_from_slice(value.as_bytes());
        }
        payload.push(0);

        if !self.links.is_empty() {
            payload.extend_from_slice(b"[[\n");
            for (db, ids) in &self.links {
                payload.extend_from_slice(db.as_bytes());
                payload.push(b'\t');
                for id in ids {
                    payload.extend_from_slice(id.as_bytes());
                    payload.push(b';');
                }
                payload.push(b'\n');
            }
            payload.extend_from_slice(b"]]\n");
        }

        payload.extend_from_slice(self.text.as_bytes());

        let crc = crc32fast::hash(&payload);
        let mut blob = Vec::with_capacity(payload.len() / 2 + 8);
        blob.extend_from_slice(&crc.to_le_bytes());

        let mut encoder = DeflateEncoder::new(blob, Compression::fast());
        encoder.write_all(&payload)?;
        self.compressed = encoder.finish()?;
        Ok(())
    }

    pub fn compressed(&self) -> &[u8] {
        &self.compressed
    }

    pub fn raw_size(&self) -> u64 {
        self.text.len() as u64
    }
}

/// A document read back from the store.
#[derive(Debug, PartialEq)]
pub struct FetchedDocument {
    pub doc_nr: DocNr,
    pub text: String,
    pub attributes: Vec<(String, String)>,
    pub links: Vec<(String, Vec<String>)>,
}

impl FetchedDocument {
    /// Decode a blob produced by `InputDocument::compress`.
    pub fn decompress(doc_nr: DocNr, blob: impl Read, store: &DocStore) -> Result<FetchedDocument> {
        let mut blob = blob;
        let mut crc_bytes = [0u8; 4];
        blob.read_exact(&mut crc_bytes)
            .map_err(|_| Error::new(ErrorKind::Corrupt, "document blob too short"))?;
        let stored_crc = u32::from_le_bytes(crc_bytes);

        let mut payload = Vec::new();
        DeflateDecoder::new(blob).read_to_end(&mut payload)?;

        if crc32fast::hash(&payload) != stored_crc {
            return Err(Error::new(
                ErrorKind::Corrupt,
                format!("document {} fails its checksum", doc_nr),
            ));
        }

        let mut pos = 0;
        let mut attributes = Vec::new();
        loop {
            let attr_nr = *payload
                .get(pos)
                .ok_or_else(|| Error::new(ErrorKind::Corrupt, "truncated attribute table"))?;
            pos += 1;
            if attr_nr == 0 {
                break;
            }
            let len = *payload
                .get(pos)
                .ok_or_else(|| Error::new(ErrorKind::Corrupt, "truncated attribute table"))?
                as usize;
            pos += 1;
            let value = payload
                .get(pos..pos + len)
                .ok_or_else(|| Error::new(ErrorKind::Corrupt, "truncated attribute table"))?;
            pos += len;
            attributes.push((
                store.attribute_name(attr_nr)?,
                String::from_utf8_lossy(value).into_owned(),
            ));
        }

        let mut links = Vec::new();
        let rest = &payload[pos..];
        let text_start = if rest.starts_with(b"[[\n") {
            let mut cursor = pos + 3;
            loop {
                let line_end = payload[cursor..]
                    .iter()
                    .position(|&b| b == b'\n')
                    .map(|p| cursor + p)
                    .ok_or_else(|| Error::new(ErrorKind::Corrupt, "unterminated links block"))?;
                let line = &payload[cursor..line_end];
                cursor = line_end + 1;
                if line == b"]]" {
                    break;
                }
                let tab = line
                    .iter()
                    .position(|&b| b == b'\t')
                    .ok_or_else(|| Error::new(ErrorKind::Corrupt, "malformed link line"))?;
                let db = String::from_utf8_lossy(&line[..tab]).into_owned();
                let ids = line[tab + 1..]
                    .split(|&b| b == b';')
                    .filter(|s| !s.is_empty())
                    .map(|s| String::from_utf8_lossy(s).into_owned())
                    .collect();
                links.push((db, ids));
            }
            cursor
        } else {
            pos
        };

        Ok(FetchedDocument {
            doc_nr,
            text: String::from_utf8_lossy(&payload[text_start..]).into_owned(),
            attributes,
            links,
        })
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}
