//! Narration job payload

use serde::{Deserialize, Serialize};

/// Queue job kind for page narration
pub const NARRATION_JOB_KIND: &str = "narrate_page";

/// One page to narrate
///
/// Keyed by `(book_id, page_number)` so that enqueueing the same page twice
/// never produces two live jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NarrationJob {
    pub page_id: i64,
    pub book_id: i64,
    pub page_number: i64,
}

impl NarrationJob {
    pub fn new(page_id: i64, book_id: i64, page_number: i64) -> Self {
        Self {
            page_id,
            book_id,
            page_number,
        }
    }

    /// Idempotency key, `page:<book_id>:<page_number>`
    pub fn idempotency_key(&self) -> String {
        idempotency_key(self.book_id, self.page_number)
    }
}

/// Idempotency key for a page
pub fn idempotency_key(book_id: i64, page_number: i64) -> String {
    format!("page:{}:{}", book_id, page_number)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_key_format() {
        assert_eq!(NarrationJob::new(12, 7, 3).idempotency_key(), "page:7:3");
    }

    #[test]
    fn test_payload_is_plain_json_object() {
        let json = serde_json::to_value(NarrationJob::new(12, 7, 3)).unwrap();
        assert_eq!(json, serde_json::json!({"page_id": 12, "book_id": 7, "page_number": 3}));
    }
}
