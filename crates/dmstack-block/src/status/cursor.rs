//! Token cursor over status parameters

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

use super::FailureKind;

/// Metadata mode reported by clone and cache targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataMode {
    ReadOnly,
    ReadWrite,
    Failed,
}

impl fmt::Display for MetadataMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataMode::ReadOnly => write!(f, "ro"),
            MetadataMode::ReadWrite => write!(f, "rw"),
            MetadataMode::Failed => write!(f, "Fail"),
        }
    }
}

/// Sequential reader over whitespace separated status tokens
///
/// Each `take_*` call consumes from the front of the stream. Errors carry
/// the tokens that were left when the failing call started.
#[derive(Debug, Clone)]
pub struct StatusCursor<'a> {
    tokens: Vec<&'a str>,
    pos: usize,
}

impl<'a> StatusCursor<'a> {
    pub fn new(params: &'a str) -> Self {
        Self {
            tokens: params.split_whitespace().collect(),
            pos: 0,
        }
    }

    /// Tokens not yet consumed, space separated
    pub fn remaining(&self) -> String {
        self.tokens[self.pos..].join(" ")
    }

    /// Number of tokens not yet consumed
    pub fn len(&self) -> usize {
        self.tokens.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn failure_sentinel(&self) -> Option<FailureKind> {
        match self.tokens.get(self.pos).copied() {
            Some("Fail") => Some(FailureKind::Fail),
            Some("Error") => Some(FailureKind::Error),
            _ => None,
        }
    }

    /// Next raw token
    pub fn take_token(&mut self, field: &'static str) -> Result<&'a str, ParseError> {
        match self.tokens.get(self.pos) {
            Some(token) => {
                self.pos += 1;
                Ok(token)
            }
            None => Err(ParseError::Truncated {
                field,
                remaining: String::new(),
            }),
        }
    }

    /// Next token as an unsigned integer
    pub fn take_int(&mut self, field: &'static str) -> Result<u64, ParseError> {
        let remaining = self.remaining();
        let token = self.take_token(field)?;
        token.parse().map_err(|_| ParseError::InvalidInteger {
            field,
            token: token.to_string(),
            remaining,
        })
    }

    /// Next token as an integer, or `-` for none
    pub fn take_optional_int(&mut self, field: &'static str) -> Result<Option<u64>, ParseError> {
        if self.tokens.get(self.pos) == Some(&"-") {
            self.pos += 1;
            return Ok(None);
        }
        self.take_int(field).map(Some)
    }

    /// Next token as `<used>/<total>`
    pub fn take_ratio(&mut self, field: &'static str) -> Result<(u64, u64), ParseError> {
        let remaining = self.remaining();
        let token = self.take_token(field)?;
        let parsed = token
            .split_once('/')
            .and_then(|(n, d)| Some((n.parse().ok()?, d.parse().ok()?)));
        parsed.ok_or_else(|| ParseError::InvalidRatio {
            field,
            token: token.to_string(),
            remaining,
        })
    }

    /// A count `n` followed by exactly `n` tokens
    pub fn take_counted_list(&mut self, field: &'static str) -> Result<Vec<String>, ParseError> {
        let count = self.take_int(field)?;
        self.take_n(field, count)
    }

    /// An even count `2n` followed by `n` key/value pairs
    pub fn take_counted_pairs(
        &mut self,
        field: &'static str,
    ) -> Result<Vec<(String, String)>, ParseError> {
        let count = self.take_int(field)?;
        if count % 2 != 0 {
            return Err(ParseError::OddPairCount {
                field,
                count,
                remaining: self.remaining(),
            });
        }

        let flat = self.take_n(field, count)?;
        Ok(flat
            .chunks_exact(2)
            .map(|kv| (kv[0].clone(), kv[1].clone()))
            .collect())
    }

    fn take_n(&mut self, field: &'static str, count: u64) -> Result<Vec<String>, ParseError> {
        if count > self.len() as u64 {
            return Err(ParseError::Truncated {
                field,
                remaining: self.remaining(),
            });
        }
        let end = self.pos + count as usize;
        let items = self.tokens[self.pos..end]
            .iter()
            .map(|s| s.to_string())
            .collect();
        self.pos = end;
        Ok(items)
    }

    /// `ro`, `rw` or `Fail`
    pub fn take_mode(&mut self, field: &'static str) -> Result<MetadataMode, ParseError> {
        let remaining = self.remaining();
        match self.take_token(field)? {
            "ro" => Ok(MetadataMode::ReadOnly),
            "rw" => Ok(MetadataMode::ReadWrite),
            "Fail" => Ok(MetadataMode::Failed),
            other => Err(ParseError::UnknownMode {
                field,
                token: other.to_string(),
                remaining,
            }),
        }
    }

    /// One of a fixed set of keywords
    pub fn take_choice<T: Copy>(
        &mut self,
        field: &'static str,
        choices: &[(&str, T)],
        expected: &'static str,
    ) -> Result<T, ParseError> {
        let remaining = self.remaining();
        let token = self.take_token(field)?;
        choices
            .iter()
            .find(|(word, _)| *word == token)
            .map(|(_, value)| *value)
            .ok_or_else(|| ParseError::UnexpectedToken {
                field,
                token: token.to_string(),
                expected,
                remaining,
            })
    }

    /// Fail unless every token was consumed
    pub fn finish(&self, target: &'static str) -> Result<(), ParseError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(ParseError::TrailingTokens {
                target,
                remaining: self.remaining(),
            })
        }
    }
}

pub(crate) fn write_counted_list(f: &mut fmt::Formatter<'_>, items: &[String]) -> fmt::Result {
    write!(f, "{}", items.len())?;
    for item in items {
        write!(f, " {item}")?;
    }
    Ok(())
}

pub(crate) fn write_counted_pairs(
    f: &mut fmt::Formatter<'_>,
    pairs: &[(String, String)],
) -> fmt::Result {
    write!(f, "{}", pairs.len() * 2)?;
    for (k, v) in pairs {
        write!(f, " {k} {v}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitives() {
        let mut c = StatusCursor::new("64 10/100 2 a b 4 k1 v1 k2 v2 rw");
        assert_eq!(c.take_int("a").unwrap(), 64);
        assert_eq!(c.take_ratio("b").unwrap(), (10, 100));
        assert_eq!(c.take_counted_list("c").unwrap(), vec!["a", "b"]);
        assert_eq!(
            c.take_counted_pairs("d").unwrap(),
            vec![
                ("k1".to_string(), "v1".to_string()),
                ("k2".to_string(), "v2".to_string())
            ]
        );
        assert_eq!(c.take_mode("e").unwrap(), MetadataMode::ReadWrite);
        assert!(c.finish("test").is_ok());
    }

    #[test]
    fn test_truncated() {
        let mut c = StatusCursor::new("");
        assert_eq!(
            c.take_int("md_block_size").unwrap_err(),
            ParseError::Truncated {
                field: "md_block_size",
                remaining: String::new()
            }
        );

        let mut c = StatusCursor::new("3 a b");
        assert!(matches!(
            c.take_counted_list("features"),
            Err(ParseError::Truncated { field: "features", .. })
        ));
    }

    #[test]
    fn test_errors_carry_remaining() {
        let mut c = StatusCursor::new("12 x7 rest");
        c.take_int("a").unwrap();
        assert_eq!(
            c.take_int("b").unwrap_err(),
            ParseError::InvalidInteger {
                field: "b",
                token: "x7".into(),
                remaining: "x7 rest".into()
            }
        );

        let mut c = StatusCursor::new("10-100");
        assert!(matches!(
            c.take_ratio("md"),
            Err(ParseError::InvalidRatio { .. })
        ));

        let mut c = StatusCursor::new("3 a b c");
        assert!(matches!(
            c.take_counted_pairs("core_args"),
            Err(ParseError::OddPairCount { count: 3, .. })
        ));

        let mut c = StatusCursor::new("wo");
        assert!(matches!(
            c.take_mode("mode"),
            Err(ParseError::UnknownMode { .. })
        ));
    }

    #[test]
    fn test_trailing_tokens() {
        let mut c = StatusCursor::new("1 2");
        c.take_int("a").unwrap();
        assert_eq!(
            c.finish("clone").unwrap_err(),
            ParseError::TrailingTokens {
                target: "clone",
                remaining: "2".into()
            }
        );
    }

    #[test]
    fn test_take_choice() {
        let choices = [("-", false), ("needs_check", true)];
        let mut c = StatusCursor::new("needs_check bogus");
        assert!(c.take_choice("needs_check", &choices, "'-' or needs_check").unwrap());
        assert!(matches!(
            c.take_choice("needs_check", &choices, "'-' or needs_check"),
            Err(ParseError::UnexpectedToken { .. })
        ));
    }
}
