use crate::analysis::tokenizer::{QueryToken, QueryTokenizer, Tokenizer};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::QueryOperator;
use crate::query::ast::{ParsedQuery, Query};

/// An operand of the boolean grammar: either a free ranked term or an
/// actual filter predicate.
enum Operand {
    Free(String),
    Filter(Query),
}

impl Operand {
    fn into_query(self) -> Query {
        match self {
            Operand::Free(term) => Query::Term { field: None, term },
            Operand::Filter(q) => q,
        }
    }
}

/// Recursive-descent parser over the query token stream. Precedence is
/// NOT over AND over OR; adjacency at the top level is a ranked term
/// list, not an operator.
pub struct QueryParser {
    tokens: Vec<QueryToken>,
    pos: usize,
    is_boolean: bool,
}

impl QueryParser {
    pub fn parse(input: &str) -> Result<ParsedQuery> {
        let tokens: Vec<QueryToken> = QueryTokenizer::new(input).collect();
        let mut parser = QueryParser { tokens, pos: 0, is_boolean: false };
        parser.parse_query()
    }

    fn peek(&self) -> &QueryToken {
        self.tokens.get(self.pos).unwrap_or(&QueryToken::End)
    }

    fn next(&mut self) -> QueryToken {
        let t = self.tokens.get(self.pos).cloned().unwrap_or(QueryToken::End);
        self.pos += 1;
        t
    }

    fn expect(&mut self, token: QueryToken) -> Result<()> {
        let got = self.next();
        if got != token {
            return Err(Error::new(
                ErrorKind::Parse,
                format!("expected {:?}, found {:?}", token, got),
            ));
        }
        Ok(())
    }

    fn parse_query(&mut self) -> Result<ParsedQuery> {
        let mut result = ParsedQuery::default();

        loop {
            match self.peek() {
                QueryToken::End => break,
                QueryToken::Slash => {
                    // path separators carry no meaning of their own
                    self.next();
                    continue;
                }
                _ => {}
            }

            match self.parse_or()? {
                Operand::Free(term) => result.terms.push(term),
                Operand::Filter(filter) => {
                    result.filter = Some(match result.filter.take() {
                        Some(prev) => Query::And(Box::new(prev), Box::new(filter)),
                        None => filter,
                    });
                }
            }
        }

        result.is_boolean = self.is_boolean;
        Ok(result)
    }

    fn parse_or(&mut self) -> Result<Operand> {
        let mut lhs = self.parse_and()?;
        while *self.peek() == QueryToken::Or {
            self.next();
            self.is_boolean = true;
            let rhs = self.parse_and()?;
            lhs = Operand::Filter(Query::Or(
                Box::new(lhs.into_query()),
                Box::new(rhs.into_query()),
            ));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Operand> {
        let mut lhs = self.parse_not()?;
        while *self.peek() == QueryToken::And {
            self.next();
            self.is_boolean = true;
            let rhs = self.parse_not()?;
            lhs = Operand::Filter(Query::And(
                Box::new(lhs.into_query()),
                Box::new(rhs.into_query()),
            ));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Operand> {
        if *self.peek() == QueryToken::Not {
            self.next();
            self.is_boolean = true;
            let operand = self.parse_not()?;
            return Ok(Operand::Filter(Query::Not(Box::new(operand.into_query()))));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Operand> {
        match self.next() {
            QueryToken::OpenParen => {
                // a parenthesized group is always a filter
                let mut group: Option<Query> = None;
                loop {
                    if *self.peek() == QueryToken::CloseParen {
                        self.next();
                        break;
                    }
                    if *self.peek() == QueryToken::End {
                        return Err(Error::new(ErrorKind::Parse, "unbalanced parenthesis"));
                    }
                    let operand = self.parse_or()?.into_query();
                    group = Some(match group {
                        Some(prev) => Query::And(Box::new(prev), Box::new(operand)),
                        None => operand,
                    });
                }
                group
                    .map(Operand::Filter)
                    .ok_or_else(|| Error::new(ErrorKind::Parse, "empty group"))
            }
            QueryToken::DocNr(nr) => {
                self.is_boolean = true;
                Ok(Operand::Filter(Query::DocNr(nr)))
            }
            QueryToken::Pattern(pattern) => {
                self.is_boolean = true;
                Ok(Operand::Filter(Query::Pattern { field: None, pattern }))
            }
            QueryToken::QuotedString(phrase) => Ok(Operand::Filter(Query::Phrase {
                field: None,
                phrase,
            })),
            QueryToken::Word(word) => self.parse_after_name(word),
            QueryToken::Number(number) => Ok(Operand::Free(number)),
            t => Err(Error::new(ErrorKind::Parse, format!("unexpected token {:?}", t))),
        }
    }

    /// A bare word, or the field name of a qualified predicate.
    fn parse_after_name(&mut self, word: String) -> Result<Operand> {
        let op = match self.peek() {
            QueryToken::Colon | QueryToken::Equals => None,
            QueryToken::LessThan => Some(QueryOperator::LessThan),
            QueryToken::LessOrEqual => Some(QueryOperator::LessOrEqual),
            QueryToken::GreaterThan => Some(QueryOperator::GreaterThan),
            QueryToken::GreaterOrEqual => Some(QueryOperator::GreaterOrEqual),
            QueryToken::Between => {
                self.next();
                self.is_boolean = true;
                let lo = self.parse_bound()?;
                // the AND between the bounds is part of the sugar
                if *self.peek() == QueryToken::And {
                    self.next();
                }
                let hi = self.parse_bound()?;
                return Ok(Operand::Filter(Query::Range { field: word, lo, hi }));
            }
            _ => return Ok(Operand::Free(word)),
        };
        self.next();

        if let Some(op) = op {
            self.is_boolean = true;
            let value = self.parse_bound()?;
            return Ok(Operand::Filter(Query::Compare { field: word, op, value }));
        }

        // field:value, where value may be a term, pattern, phrase or range.
        // A plain qualified term keeps the query rankable; the other
        // predicate forms make it boolean.
        match self.next() {
            QueryToken::Word(value) | QueryToken::Number(value) => {
                Ok(Operand::Filter(Query::Term { field: Some(word), term: value }))
            }
            QueryToken::QuotedString(phrase) => {
                Ok(Operand::Filter(Query::Phrase { field: Some(word), phrase }))
            }
            QueryToken::Pattern(pattern) => {
                self.is_boolean = true;
                Ok(Operand::Filter(Query::Pattern { field: Some(word), pattern }))
            }
            QueryToken::OpenBracket => {
                self.is_boolean = true;
                let lo = self.parse_bound()?;
                // tolerate the TO keyword of the range syntax
                if matches!(self.peek(), QueryToken::Word(w) if w == "to") {
                    self.next();
                }
                let hi = self.parse_bound()?;
                self.expect(QueryToken::CloseBracket)?;
                Ok(Operand::Filter(Query::Range { field: word, lo, hi }))
            }
            t => Err(Error::new(ErrorKind::Parse, format!("missing value after '{}:', found {:?}", word, t))),
        }
    }

    fn parse_bound(&mut self) -> Result<String> {
        match self.next() {
            QueryToken::Word(w) => Ok(w),
            QueryToken::Number(n) => Ok(n),
            QueryToken::QuotedString(s) => Ok(s),
            t => Err(Error::new(ErrorKind::Parse, format!("expected a value, found {:?}", t))),
        }
    }
}

/// Tokenize a free-text query into ranked search terms with the same
/// normalization used at index time.
pub fn ranked_terms(text: &str) -> Vec<String> {
    Tokenizer::new(text).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_terms_are_not_boolean() {
        let q = QueryParser::parse("alpha beta gamma").unwrap();
        assert_eq!(q.terms, vec!["alpha", "beta", "gamma"]);
        assert!(q.filter.is_none());
        assert!(!q.is_boolean);
    }

    #[test]
    fn and_or_not() {
        let q = QueryParser::parse("alpha AND gamma").unwrap();
        assert!(q.is_boolean);
        assert_eq!(
            q.filter.unwrap(),
            Query::And(
                Box::new(Query::Term { field: None, term: "alpha".into() }),
                Box::new(Query::Term { field: None, term: "gamma".into() }),
            )
        );

        let q = QueryParser::parse("delta OR epsilon").unwrap();
        assert!(matches!(q.filter.unwrap(), Query::Or(_, _)));

        let q = QueryParser::parse("NOT delta").unwrap();
        assert!(matches!(q.filter.unwrap(), Query::Not(_)));
    }

    #[test]
    fn field_predicates() {
        let q = QueryParser::parse("text:beta").unwrap();
        assert_eq!(
            q.filter.unwrap(),
            Query::Term { field: Some("text".into()), term: "beta".into() }
        );

        let q = QueryParser::parse("name:ac*").unwrap();
        assert_eq!(
            q.filter.unwrap(),
            Query::Pattern { field: Some("name".into()), pattern: "ac*".into() }
        );

        let q = QueryParser::parse("year:[2000 TO 2005]").unwrap();
        assert_eq!(
            q.filter.unwrap(),
            Query::Range { field: "year".into(), lo: "2000".into(), hi: "2005".into() }
        );

        let q = QueryParser::parse("year BETWEEN 2000 AND 2005").unwrap();
        assert_eq!(
            q.filter.unwrap(),
            Query::Range { field: "year".into(), lo: "2000".into(), hi: "2005".into() }
        );

        let q = QueryParser::parse("mass<=42.5").unwrap();
        assert_eq!(
            q.filter.unwrap(),
            Query::Compare {
                field: "mass".into(),
                op: QueryOperator::LessOrEqual,
                value: "42.5".into()
            }
        );
    }

    #[test]
    fn doc_nr_and_groups() {
        let q = QueryParser::parse("#42").unwrap();
        assert_eq!(q.filter.unwrap(), Query::DocNr(42));

        let q = QueryParser::parse("(alpha OR beta) AND year:[1 TO 2]").unwrap();
        assert!(q.is_boolean);
        assert!(matches!(q.filter.unwrap(), Query::And(_, _)));
    }

    #[test]
    fn mixed_free_terms_and_filter() {
        let q = QueryParser::parse("kinase year:[2000 TO 2002]").unwrap();
        assert_eq!(q.terms, vec!["kinase"]);
        assert!(matches!(q.filter.unwrap(), Query::Range { .. }));
    }

    #[test]
    fn malformed_queries_fail() {
        assert!(QueryParser::parse("(alpha").is_err());
        assert!(QueryParser::parse("year:[2000").is_err());
        assert!(QueryParser::parse("field:").is_err());
        assert_eq!(QueryParser::parse("(").unwrap_err().kind, ErrorKind::Parse);
    }
}
