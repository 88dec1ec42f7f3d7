//! Freshet Core - Data Types and Capability Traits
//!
//! Pure data structures shared by every Freshet crate: column keys, row
//! views, read requests, freshener records, per-column outcomes, the error
//! taxonomy, reader configuration, and the two capability traits a
//! freshener is built from. No engine logic lives here.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

mod column;
mod config;
mod error;
mod freshener;
mod outcome;
mod record;
mod request;
mod row;

pub use column::*;
pub use config::*;
pub use error::*;
pub use freshener::*;
pub use outcome::*;
pub use record::*;
pub use request::*;
pub use row::*;

// ============================================================================
// PRIMITIVE TYPES
// ============================================================================

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Value stored in one cell.
pub type CellValue = serde_json::Value;

/// SHA-256 content hash.
pub type ContentHash = [u8; 32];

/// Compute SHA-256 hash of content.
pub fn compute_content_hash(content: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}
