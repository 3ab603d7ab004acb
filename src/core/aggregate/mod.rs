// src/core/aggregate/mod.rs

//! The aggregation layer: merges snapshots, event streams, resource streams,
//! and manual refresh across all live clusters.

pub mod events;
pub mod refresh;
pub mod snapshot;
pub mod stream;

pub use events::{AggregateEventStream, EventFrame, EventSubscription};
pub use refresh::{AggregateRefreshQueue, AggregateRefreshStatus};
pub use snapshot::AggregateSnapshotService;
pub use stream::{AggregateResourceStream, StreamRequest};
