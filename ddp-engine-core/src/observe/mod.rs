//! # Observe machinery
//!
//! The read-path pipeline between the document store and subscriptions:
//!
//! ```text
//! store ← PollingObserveDriver → ObserveMultiplexer → ObserveHandle*
//!              ↑ (invalidations)        │ (task queue: cache + fan-out)
//!          Crossbar                 CachingChangeObserver
//! ```
//!
//! One driver polls per distinct query; the multiplexer deduplicates
//! subscribers onto it and fans events out with a consistent cache.

mod cache;
mod driver;
mod multiplexer;
mod throttle;

pub use cache::CachingChangeObserver;
pub use cache::OrderedDocMap;
pub use driver::PollingObserveDriver;
pub use multiplexer::ObserveCallbacks;
pub use multiplexer::ObserveHandle;
pub use multiplexer::ObserveMultiplexer;
pub use throttle::Throttle;

use ddp_engine_proto::Document;
use ddp_engine_proto::FieldPatch;
use ddp_engine_proto::Fields;

/// The event vocabulary flowing from a driver into its multiplexer.
#[derive(Debug, Clone)]
pub enum ObserveEvent {
    /// Replace the whole cache (drivers that own the full result set).
    InitialAdds { docs: Vec<Document> },
    /// Unordered insert.
    Added { id: String, fields: Fields },
    /// Ordered insert before `before` (`None` = at the end).
    AddedBefore {
        id: String,
        fields: Fields,
        before: Option<String>,
    },
    /// Field-level patch; `None` values delete fields.
    Changed { id: String, patch: FieldPatch },
    /// Ordered relocation.
    MovedBefore { id: String, before: Option<String> },
    Removed { id: String },
}

impl ObserveEvent {
    /// Adds are the only events legal before the readiness barrier.
    pub fn is_add(&self) -> bool {
        matches!(
            self,
            ObserveEvent::InitialAdds { .. }
                | ObserveEvent::Added { .. }
                | ObserveEvent::AddedBefore { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ObserveEvent::InitialAdds { .. } => "initial_adds",
            ObserveEvent::Added { .. } => "added",
            ObserveEvent::AddedBefore { .. } => "added_before",
            ObserveEvent::Changed { .. } => "changed",
            ObserveEvent::MovedBefore { .. } => "moved_before",
            ObserveEvent::Removed { .. } => "removed",
        }
    }
}

#[cfg(test)]
mod multiplexer_test;
