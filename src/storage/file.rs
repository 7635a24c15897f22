//! File-backed `EventStorage`. An append-only log segmented into numbered
//! files under `storage.data_folder_path`, each holding up to
//! `max_records_per_file` newline-delimited records; at most
//! `max_file_count` segments are kept at once. Segments are only ever
//! appended to or deleted whole once fully committed, so a crash mid-write
//! loses at most the last partially-written line.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::StorageError;

use super::EventStorage;

struct Segment {
    id: u64,
    path: PathBuf,
    len: usize,
}

struct Cursor {
    segment: usize,
    offset: usize,
}

struct State {
    segments: VecDeque<Segment>,
    read: Cursor,
    checked_out: Option<(Vec<Vec<u8>>, Cursor)>,
    next_id: u64,
}

pub struct FileStorage {
    data_folder_path: PathBuf,
    max_file_count: usize,
    max_records_per_file: usize,
    batch_size: usize,
    state: Mutex<State>,
}

fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id:020}.dat"))
}

async fn read_lines(path: &Path) -> Result<Vec<Vec<u8>>, StorageError> {
    let contents = fs::read(path).await?;
    Ok(contents
        .split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| line.to_vec())
        .collect())
}

impl FileStorage {
    /// Scans `data_folder_path` for existing `NNNN.dat` segments, rebuilding
    /// the in-memory index so storage survives a restart.
    pub async fn new(
        data_folder_path: &Path,
        max_file_count: usize,
        max_records_per_file: usize,
        batch_size: usize,
    ) -> Result<Self, StorageError> {
        fs::create_dir_all(data_folder_path).await?;

        let mut ids = Vec::new();
        let mut entries = fs::read_dir(data_folder_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = entry
                .path()
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();

        let mut segments = VecDeque::new();
        for id in &ids {
            let path = segment_path(data_folder_path, *id);
            let len = read_lines(&path).await?.len();
            segments.push_back(Segment { id: *id, path, len });
        }
        let next_id = ids.last().map(|id| id + 1).unwrap_or(0);

        Ok(FileStorage {
            data_folder_path: data_folder_path.to_path_buf(),
            max_file_count,
            max_records_per_file,
            batch_size,
            state: Mutex::new(State {
                segments,
                read: Cursor {
                    segment: 0,
                    offset: 0,
                },
                checked_out: None,
                next_id,
            }),
        })
    }
}

#[async_trait]
impl EventStorage for FileStorage {
    async fn put(&self, bytes: Vec<u8>) -> Result<bool, StorageError> {
        if bytes.contains(&b'\n') {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "event payload must not contain a newline",
            )));
        }

        let mut state = self.state.lock().await;

        let needs_new_segment = match state.segments.back() {
            Some(seg) => seg.len >= self.max_records_per_file,
            None => true,
        };

        if needs_new_segment {
            if !state.segments.is_empty() && state.segments.len() >= self.max_file_count {
                return Ok(false);
            }
            let id = state.next_id;
            state.next_id += 1;
            state.segments.push_back(Segment {
                id,
                path: segment_path(&self.data_folder_path, id),
                len: 0,
            });
        }

        let seg = state.segments.back_mut().unwrap();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&seg.path)
            .await?;
        file.write_all(&bytes).await?;
        file.write_all(b"\n").await?;
        seg.len += 1;

        Ok(true)
    }

    async fn get_event_pack(&self) -> Result<Vec<Vec<u8>>, StorageError> {
        let mut state = self.state.lock().await;
        if let Some((pack, _)) = &state.checked_out {
            return Ok(pack.clone());
        }

        let mut pack = Vec::new();
        let mut segment = state.read.segment;
        let mut offset = state.read.offset;

        while pack.len() < self.batch_size {
            let Some(seg) = state.segments.get(segment) else {
                break;
            };
            let lines = read_lines(&seg.path).await?;
            while offset < lines.len() && pack.len() < self.batch_size {
                pack.push(lines[offset].clone());
                offset += 1;
            }
            if offset >= lines.len() {
                segment += 1;
                offset = 0;
            } else {
                break;
            }
        }

        state.checked_out = Some((pack.clone(), Cursor { segment, offset }));
        Ok(pack)
    }

    async fn event_pack_processing_done(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let Some((_, cursor)) = state.checked_out.take() else {
            return Ok(());
        };
        state.read = cursor;

        while state.read.segment > 0 {
            if let Some(seg) = state.segments.pop_front() {
                fs::remove_file(&seg.path).await.ok();
            }
            state.read.segment -= 1;
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
    async fn rotates_segments_and_rejects_past_capacity() {
        crate::test_log::init();
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path(), 2, 2, 10).await.unwrap();

        for i in 0..4u8 {
            assert!(storage.put(vec![i]).await.unwrap());
        }
        // 2 segments * 2 records each = capacity exhausted
        assert!(!storage.put(vec![99]).await.unwrap());
    }

    #[tokio::test]
    async fn checkout_spans_segments_and_commit_deletes_consumed_ones() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path(), 4, 2, 3).await.unwrap();
        for i in 0..4u8 {
            storage.put(vec![i]).await.unwrap();
        }

        let pack = storage.get_event_pack().await.unwrap();
        assert_eq!(pack.len(), 3);
        assert_eq!(pack, vec![vec![0], vec![1], vec![2]]);

        let again = storage.get_event_pack().await.unwrap();
        assert_eq!(again, pack);

        storage.event_pack_processing_done().await.unwrap();

        let mut remaining = std::fs::read_dir(dir.path()).unwrap().count();
        assert!(remaining <= 2);

        let next = storage.get_event_pack().await.unwrap();
        assert_eq!(next, vec![vec![3]]);
        remaining = std::fs::read_dir(dir.path()).unwrap().count();
        assert!(remaining >= 1);
    }

    #[tokio::test]
    async fn reload_from_disk_rebuilds_index() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = FileStorage::new(dir.path(), 4, 2, 10).await.unwrap();
            storage.put(vec![1]).await.unwrap();
            storage.put(vec![2]).await.unwrap();
        }

        let storage = FileStorage::new(dir.path(), 4, 2, 10).await.unwrap();
        let pack = storage.get_event_pack().await.unwrap();
        assert_eq!(pack, vec![vec![1], vec![2]]);
    }
}
