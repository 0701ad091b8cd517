//! In-process progress events for jobs and items.

pub mod progress;

pub use progress::{IngestProgressEvent, ItemProgressTracker, ProgressBroadcaster};
