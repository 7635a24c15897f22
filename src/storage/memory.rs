//! In-memory `EventStorage` backend. A bounded ring that rejects new events
//! once `storage.max_records_count` is reached rather than evicting old
//! ones — losing unacknowledged events silently would violate the
//! at-least-once guarantee the rest of the pipeline relies on.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::StorageError;

use super::EventStorage;

struct State {
    events: VecDeque<Vec<u8>>,
    /// Length of the pack currently checked out from the front of `events`,
    /// or `None` if nothing is checked out.
    checked_out: Option<usize>,
}

pub struct MemoryStorage {
    max_records_count: usize,
    batch_size: usize,
    state: Mutex<State>,
}

impl MemoryStorage {
    pub fn new(max_records_count: usize, batch_size: usize) -> Self {
        MemoryStorage {
            max_records_count,
            batch_size,
            state: Mutex::new(State {
                events: VecDeque::new(),
                checked_out: None,
            }),
        }
    }
}

#[async_trait]
impl EventStorage for MemoryStorage {
    async fn put(&self, bytes: Vec<u8>) -> Result<bool, StorageError> {
        let mut state = self.state.lock().await;
        if state.events.len() >= self.max_records_count {
            return Ok(false);
        }
        state.events.push_back(bytes);
        Ok(true)
    }

    async fn get_event_pack(&self) -> Result<Vec<Vec<u8>>, StorageError> {
        let mut state = self.state.lock().await;
        let len = match state.checked_out {
            Some(len) => len,
            None => {
                let len = state.events.len().min(self.batch_size);
                state.checked_out = Some(len);
                len
            }
        };
        Ok(state.events.iter().take(len).cloned().collect())
    }

    async fn event_pack_processing_done(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if let Some(len) = state.checked_out.take() {
            state.events.drain(..len);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_rejects_once_capacity_is_reached() {
        crate::test_log::init();
        let storage = MemoryStorage::new(2, 10);
        assert!(storage.put(vec![1]).await.unwrap());
        assert!(storage.put(vec![2]).await.unwrap());
        assert!(!storage.put(vec![3]).await.unwrap());
    }

    #[tokio::test]
    async fn checkout_is_idempotent_until_commit() {
        let storage = MemoryStorage::new(10, 2);
        for i in 0..3u8 {
            storage.put(vec![i]).await.unwrap();
        }

        let first = storage.get_event_pack().await.unwrap();
        assert_eq!(first, vec![vec![0], vec![1]]);

        let again = storage.get_event_pack().await.unwrap();
        assert_eq!(again, first);

        storage.event_pack_processing_done().await.unwrap();
        let next = storage.get_event_pack().await.unwrap();
        assert_eq!(next, vec![vec![2]]);
    }
}
