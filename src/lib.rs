//! Read-optimized, batch-built databank engine for biological sequence
//! records: a paged document store, a family of B+-tree indices over
//! bit-packed posting lists, ranked full-text retrieval and a minimal
//! acyclic automaton for spelling suggestions.
//!
//! A databank is built once from a record stream and is read-mostly
//! afterwards:
//!
//! ```text
//! records -> InputDocument -> Databank::store -> store worker (blob)
//!                                             -> index worker (tokens,
//!                                                values, links)
//!         -> external sort runs -> merged posting stream
//!         -> per-field B+-trees + weighted full-text index
//!         -> document weights + spelling dictionary
//! ```

pub mod analysis;
pub mod batch;
pub mod core;
pub mod databank;
pub mod dict;
pub mod index;
pub mod io;
pub mod lexicon;
pub mod query;
pub mod store;

pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::core::types::{DataType, DocNr, IndexType, QueryOperator};
pub use crate::databank::{Databank, DatabankInfo, IndexInfo};
pub use crate::io::file::OpenMode;
pub use crate::lexicon::Lexicon;
pub use crate::query::executor::RankedHit;
pub use crate::store::document::{FetchedDocument, InputDocument};
