mod delta;
mod normalizer;
mod service;

pub use delta::{DeltaSyncOptions, DeltaSyncWorker, SyncError, SyncStats};
pub use normalizer::{Bundle, NormalizeError, normalize};
pub use service::{IngestError, IngestFailure, IngestService, IngestStats};
