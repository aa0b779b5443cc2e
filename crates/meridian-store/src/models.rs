//! Plain data types returned by the record model.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::IdGenerator;

/// Result of a successful `create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedRecord {
    pub id: String,
}

/// Options of `batch_create`.
#[derive(Default, Clone, Copy)]
pub struct BatchCreateOptions<'a> {
    /// Ignore ids carried by the items and assign fresh ones.
    pub create_with_new_id: bool,
    /// Overrides the model's id generator for this batch.
    pub id_generator: Option<&'a dyn IdGenerator>,
}

/// An item rejected by schema validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItemError {
    /// Position in the input.
    pub index: usize,
    pub diagnostic: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCreateResult {
    pub added: usize,
    /// Ids of the inserted records, in input order.
    pub ids: Vec<String>,
    /// Ids that already existed and were left untouched.
    pub skips: Vec<String>,
    pub errors: Vec<BatchItemError>,
    /// `true` only when every item was inserted.
    pub success: bool,
}

/// Filtered, paginated listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    /// `(field path, value)` pairs that must all match.
    pub filters: Vec<(String, Value)>,
    /// Page size; `None` returns everything after the filters.
    pub page_size: Option<u64>,
    /// Zero-based page index.
    pub current: u64,
}

impl QueryOptions {
    pub fn filter(mut self, path: impl Into<String>, value: Value) -> Self {
        self.filters.push((path.into(), value));
        self
    }

    pub fn page(mut self, page_size: u64, current: u64) -> Self {
        self.page_size = Some(page_size);
        self.current = current;
        self
    }

    pub(crate) fn offset(&self) -> u64 {
        self.page_size.map(|size| size * self.current).unwrap_or(0)
    }
}
