use crate::core::types::{DocNr, QueryOperator};

/// Boolean filter tree. Leaves are field-qualified predicates (a `None`
/// field targets the full-text index), inner nodes are set combinators
/// evaluated over document bitmaps.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Term { field: Option<String>, term: String },
    Pattern { field: Option<String>, pattern: String },
    Phrase { field: Option<String>, phrase: String },
    Range { field: String, lo: String, hi: String },
    Compare { field: String, op: QueryOperator, value: String },
    DocNr(DocNr),
    And(Box<Query>, Box<Query>),
    Or(Box<Query>, Box<Query>),
    Not(Box<Query>),
}

/// A parsed query: free terms feed the ranked accumulator, the filter
/// tree restricts the candidate set. A boolean query has no ranked
/// component.
#[derive(Debug, Default)]
pub struct ParsedQuery {
    pub terms: Vec<String>,
    pub filter: Option<Query>,
    pub is_boolean: bool,
}
