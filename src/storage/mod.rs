//! Event Storage (C1): the durable queue between ingress and uplink.
//! `put` accepts a serialized event; `get_event_pack` checks out up to
//! `batch_size` events idempotently until `event_pack_processing_done`
//! retires the checkout (spec §4.1).

pub mod file;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::StorageError;

#[async_trait]
pub trait EventStorage: Send + Sync {
    /// Durable-on-return for file/db backends. Returns `false` (not an
    /// error) when capacity is exhausted and the event was dropped.
    async fn put(&self, bytes: Vec<u8>) -> Result<bool, StorageError>;

    /// Returns up to the configured batch size of events. Repeated calls
    /// without an intervening `event_pack_processing_done` return the same
    /// pack — checkout is idempotent until committed.
    async fn get_event_pack(&self) -> Result<Vec<Vec<u8>>, StorageError>;

    /// Retires the current checkout so the next `get_event_pack` advances.
    async fn event_pack_processing_done(&self) -> Result<(), StorageError>;

    /// Flushes and releases resources.
    async fn stop(&self) -> Result<(), StorageError>;
}
