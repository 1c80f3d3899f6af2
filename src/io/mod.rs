//! Artifact I/O: object store construction, key layout and the storage adapter.

mod keys;
mod storage;
mod store;

pub use keys::{KeyLayout, Stage};
pub use storage::Storage;
pub use store::{create_object_store, parse_s3_uri};
