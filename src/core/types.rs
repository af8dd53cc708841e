use serde::Serialize;

/// Dense 1-based document identifier within one databank.
pub type DocNr = u32;

/// Maximum key length accepted by any index.
pub const MAX_KEY_LEN: usize = 255;

/// Maximum posting weight; weights are normalized into [1..MAX_WEIGHT].
pub const MAX_WEIGHT: u32 = 255;

/// Bits used for a fixed-width weight in posting streams.
pub const WEIGHT_BIT_COUNT: u32 = 8;

/// Highest admissible per-field index number (0 is the full-text bucket).
pub const MAX_INDEX_NR: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IndexType {
    Char,
    Number,
    Float,
    CharMulti,
    NumberMulti,
    FloatMulti,
    Link,
    CharMultiIdl,
    CharWeighted,
}

impl IndexType {
    pub fn is_unique(self) -> bool {
        matches!(self, IndexType::Char | IndexType::Number | IndexType::Float)
    }

    pub fn on_disk_tag(self) -> u8 {
        match self {
            IndexType::Char => 1,
            IndexType::Number => 2,
            IndexType::Float => 3,
            IndexType::CharMulti => 4,
            IndexType::NumberMulti => 5,
            IndexType::FloatMulti => 6,
            IndexType::Link => 7,
            IndexType::CharMultiIdl => 8,
            IndexType::CharWeighted => 9,
        }
    }

    pub fn from_tag(tag: u8) -> Option<IndexType> {
        Some(match tag {
            1 => IndexType::Char,
            2 => IndexType::Number,
            3 => IndexType::Float,
            4 => IndexType::CharMulti,
            5 => IndexType::NumberMulti,
            6 => IndexType::FloatMulti,
            7 => IndexType::Link,
            8 => IndexType::CharMultiIdl,
            9 => IndexType::CharWeighted,
            _ => return None,
        })
    }
}

/// Comparison operator for typed index lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOperator {
    Equals,
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
}

/// Data type of an index directive attached to an input document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    String,
    Text,
    Number,
    Float,
}
