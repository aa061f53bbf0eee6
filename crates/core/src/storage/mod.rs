pub mod blob;
pub mod event_log;
pub mod run_store;

pub use blob::{BlobStore, FilesystemBlobStore};
pub use event_log::{EventLog, StreamItem};
pub use run_store::{RedbRunStore, RunStore};
