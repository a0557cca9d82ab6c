pub mod content_store;
pub mod error;
pub mod format;

pub use content_store::{ContentEntry, ContentStore};
pub use error::{Result, StoreError};
pub use format::PayloadFormat;
