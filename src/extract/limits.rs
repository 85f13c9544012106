//! Size ceilings checked before any shaping or upstream call.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestLimits {
    /// Raw request body, in bytes.
    pub max_body_bytes: usize,
    /// Any single string field (transcript, document text), in characters.
    pub max_item_chars: usize,
    /// Page images or candidate items per request.
    pub max_items: usize,
    /// Sum over every text field and attachment payload, in characters.
    pub max_total_chars: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_body_bytes: 40 * 1024 * 1024,
            max_item_chars: 2_000_000,
            max_items: 60,
            max_total_chars: 30_000_000,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LimitError {
    #[error("request body is {actual} bytes; the limit is {limit}")]
    BodyTooLarge { actual: usize, limit: usize },
    #[error("`{field}` is {actual} characters; the limit is {limit}")]
    FieldTooLong {
        field: String,
        actual: usize,
        limit: usize,
    },
    #[error("{actual} items supplied; the limit is {limit}")]
    TooManyItems { actual: usize, limit: usize },
    #[error("request carries {actual} characters in total; the limit is {limit}")]
    TotalTooLarge { actual: usize, limit: usize },
}

impl RequestLimits {
    pub fn check_body(&self, bytes: usize) -> Result<(), LimitError> {
        if bytes > self.max_body_bytes {
            return Err(LimitError::BodyTooLarge {
                actual: bytes,
                limit: self.max_body_bytes,
            });
        }
        Ok(())
    }

    /// Returns the field's character count so callers can feed a [`Budget`].
    pub fn check_field(&self, field: &str, text: &str) -> Result<usize, LimitError> {
        let chars = text.chars().count();
        if chars > self.max_item_chars {
            return Err(LimitError::FieldTooLong {
                field: field.to_string(),
                actual: chars,
                limit: self.max_item_chars,
            });
        }
        Ok(chars)
    }

    pub fn check_items(&self, count: usize) -> Result<(), LimitError> {
        if count > self.max_items {
            return Err(LimitError::TooManyItems {
                actual: count,
                limit: self.max_items,
            });
        }
        Ok(())
    }

    pub fn budget(&self) -> Budget {
        Budget {
            used: 0,
            limit: self.max_total_chars,
        }
    }
}

/// Running total for the aggregate character ceiling.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    used: usize,
    limit: usize,
}

impl Budget {
    pub fn charge(&mut self, chars: usize) -> Result<(), LimitError> {
        self.used = self.used.saturating_add(chars);
        if self.used > self.limit {
            return Err(LimitError::TotalTooLarge {
                actual: self.used,
                limit: self.limit,
            });
        }
        Ok(())
    }

    pub fn used(&self) -> usize {
        self.used
    }
}
