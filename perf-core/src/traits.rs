//! External-collaborator interfaces.
//!
//! The object store, pub/sub bus, and notifier are external systems;
//! abstracting them behind traits keeps the engine testable and breaks
//! the dependency cycles between the loop, the stores, and notification.
//! Wiring happens once at boot in the embedding binary.

use crate::alert::Alert;
use crate::errors::Result;
use crate::regression::ClusterSummary;
use crate::tile::CommitDetail;

/// Read access to the object store the measurement files land in.
pub trait ObjectStore: Send + Sync {
    /// Fetch an object's bytes. Transport failures are `Transient`.
    fn fetch(&self, bucket: &str, name: &str) -> Result<Vec<u8>>;
}

/// Acknowledgement handle for one delivered event.
///
/// Ack on success or permanent failure; nack only on transient failure.
/// Nack is the only path that permits redelivery.
pub trait Acker: Send {
    fn ack(self: Box<Self>);
    fn nack(self: Box<Self>);
}

/// One event pulled off the bus.
pub struct Delivery {
    pub payload: Vec<u8>,
    pub acker: Box<dyn Acker>,
}

/// A subscription delivering file-arrival events.
pub trait EventSource: Send + Sync {
    /// Block for the next delivery. `Ok(None)` means the source is closed
    /// and the pipeline should drain and stop.
    fn pull(&self) -> Result<Option<Delivery>>;
}

/// Fire-and-forget publisher for "file ingested" events.
pub trait Publisher: Send + Sync {
    fn publish(&self, payload: &[u8]) -> Result<()>;
}

/// Owner notification on newly found regressions.
pub trait Notifier: Send + Sync {
    fn regression_found(
        &self,
        commit: &CommitDetail,
        alert: &Alert,
        summary: &ClusterSummary,
    ) -> Result<()>;
}
