//! In-process event fan-out.
//!
//! Nothing here is needed for correctness: workers and replay streams
//! coordinate through the database. These channels only let live
//! subscribers react without waiting for the next poll.

pub mod chat_notifier;
pub mod vod_progress;

pub use chat_notifier::ChatNotifier;
pub use vod_progress::{ProgressPhase, VodProgressBroadcaster, VodProgressEvent, VodProgressTracker};
