use std::cmp::Ordering;

use crate::core::error::{Error, ErrorKind, Result};

/// Key ordering of an index. `Numeric` orders decimal strings by value,
/// `Float` compares 8-byte normalized keys (see `float_to_key`) so a
/// plain byte comparison gives numeric order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Bytewise,
    Numeric,
    Float,
}

impl Comparator {
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            Comparator::Bytewise | Comparator::Float => a.cmp(b),
            Comparator::Numeric => compare_numeric(a, b),
        }
    }

    /// Normalize an external string key into its stored form.
    pub fn string_to_key(&self, s: &str) -> Result<Vec<u8>> {
        match self {
            Comparator::Bytewise | Comparator::Numeric => Ok(s.as_bytes().to_vec()),
            Comparator::Float => {
                let value: f64 = s
                    .parse()
                    .map_err(|_| Error::new(ErrorKind::Parse, format!("not a number: {}", s)))?;
                Ok(float_to_key(value).to_vec())
            }
        }
    }

    pub fn key_to_string(&self, key: &[u8]) -> String {
        match self {
            Comparator::Bytewise | Comparator::Numeric => String::from_utf8_lossy(key).into_owned(),
            Comparator::Float => match key.try_into() {
                Ok(bytes) => key_to_float(bytes).to_string(),
                Err(_) => String::new(),
            },
        }
    }
}

/// Decimal strings ordered by numeric value: sign, then magnitude by
/// digit count, then lexicographically.
fn compare_numeric(a: &[u8], b: &[u8]) -> Ordering {
    let (neg_a, a) = strip_sign(a);
    let (neg_b, b) = strip_sign(b);

    match (neg_a, neg_b) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }

    let a = strip_leading_zeros(a);
    let b = strip_leading_zeros(b);

    let magnitude = a.len().cmp(&b.len()).then_with(|| a.cmp(b));
    if neg_a {
        magnitude.reverse()
    } else {
        magnitude
    }
}

fn strip_sign(s: &[u8]) -> (bool, &[u8]) {
    match s.first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    }
}

fn strip_leading_zeros(s: &[u8]) -> &[u8] {
    let mut i = 0;
    while i + 1 < s.len() && s[i] == b'0' {
        i += 1;
    }
    &s[i..]
}

/// Order-preserving 8-byte encoding of an IEEE-754 double: positive
/// values get the sign bit flipped, negative values all bits, so that
/// big-endian byte order equals numeric order.
pub fn float_to_key(value: f64) -> [u8; 8] {
    let bits = value.to_bits();
    let ordered = if bits & 0x8000_0000_0000_0000 != 0 {
        !bits
    } else {
        bits ^ 0x8000_0000_0000_0000
    };
    ordered.to_be_bytes()
}

pub fn key_to_float(key: &[u8; 8]) -> f64 {
    let ordered = u64::from_be_bytes(*key);
    let bits = if ordered & 0x8000_0000_0000_0000 != 0 {
        ordered ^ 0x8000_0000_0000_0000
    } else {
        !ordered
    };
    f64::from_bits(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_order() {
        let cmp = Comparator::Numeric;
        assert_eq!(cmp.compare(b"2", b"10"), Ordering::Less);
        assert_eq!(cmp.compare(b"0002", b"2"), Ordering::Equal);
        assert_eq!(cmp.compare(b"1999", b"2001"), Ordering::Less);
        assert_eq!(cmp.compare(b"-5", b"3"), Ordering::Less);
        assert_eq!(cmp.compare(b"-10", b"-2"), Ordering::Less);
        assert_eq!(cmp.compare(b"42", b"42"), Ordering::Equal);
    }

    #[test]
    fn float_keys_sort_numerically() {
        let mut values = [3.5, -1.25, 0.0, -1000.0, 2.0, 1e-9, -0.5];
        let mut keys: Vec<[u8; 8]> = values.iter().map(|&v| float_to_key(v)).collect();
        keys.sort();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let decoded: Vec<f64> = keys.iter().map(key_to_float).collect();
        assert_eq!(decoded, values);
    }

    #[test]
    fn float_string_round_trip() {
        let cmp = Comparator::Float;
        let key = cmp.string_to_key("2.5").unwrap();
        assert_eq!(cmp.key_to_string(&key), "2.5");
        assert!(cmp.string_to_key("abc").is_err());
    }
}
