//! Progress tracking for sync operations

use depot_proto::DepotId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Progress event delivered to the embedder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub depot_id: DepotId,
    pub bytes_so_far: u64,
    pub bytes_total: u64,
    /// File that just completed, for file-granular events
    pub current_file: Option<String>,
    /// `true` for per-file events, `false` for per-depot summaries
    pub file_granular: bool,
}

impl SyncProgress {
    pub fn percentage(&self) -> f32 {
        if self.bytes_total == 0 {
            return 100.0;
        }
        (self.bytes_so_far as f32 / self.bytes_total as f32) * 100.0
    }
}

pub type ProgressCallback = Arc<dyn Fn(&SyncProgress) + Send + Sync>;

/// Byte counters for one scope (the whole run or a single depot)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteCounters {
    /// Bytes received on the wire
    pub downloaded_compressed: u64,
    /// Bytes written after decompression
    pub downloaded_uncompressed: u64,
    /// Bytes of content now correctly in place, fetched or reused
    pub size_downloaded: u64,
    /// Bytes the scope will hold when complete
    pub complete_size: u64,
    pub chunks_fetched: u64,
}

#[derive(Debug, Default)]
struct CounterState {
    global: ByteCounters,
    depots: BTreeMap<DepotId, ByteCounters>,
}

/// Global and per-depot counters, updated together under one lock
#[derive(Debug, Default)]
pub struct DownloadCounters {
    state: Mutex<CounterState>,
}

impl DownloadCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare how many bytes a depot will hold
    pub async fn add_expected(&self, depot_id: DepotId, bytes: u64) {
        let mut state = self.state.lock().await;
        state.global.complete_size += bytes;
        state.depots.entry(depot_id).or_default().complete_size += bytes;
    }

    /// Account bytes already valid on disk; returns the depot's counters afterwards
    pub async fn record_in_place(&self, depot_id: DepotId, bytes: u64) -> ByteCounters {
        let mut state = self.state.lock().await;
        state.global.size_downloaded += bytes;
        let depot = state.depots.entry(depot_id).or_default();
        depot.size_downloaded += bytes;
        *depot
    }

    /// Account one fetched chunk; returns the depot's counters afterwards
    pub async fn record_chunk(
        &self,
        depot_id: DepotId,
        compressed: u64,
        uncompressed: u64,
    ) -> ByteCounters {
        let mut state = self.state.lock().await;
        state.global.downloaded_compressed += compressed;
        state.global.downloaded_uncompressed += uncompressed;
        state.global.size_downloaded += uncompressed;
        state.global.chunks_fetched += 1;

        let depot = state.depots.entry(depot_id).or_default();
        depot.downloaded_compressed += compressed;
        depot.downloaded_uncompressed += uncompressed;
        depot.size_downloaded += uncompressed;
        depot.chunks_fetched += 1;
        *depot
    }

    pub async fn global(&self) -> ByteCounters {
        self.state.lock().await.global
    }

    pub async fn depot(&self, depot_id: DepotId) -> ByteCounters {
        self.state
            .lock()
            .await
            .depots
            .get(&depot_id)
            .copied()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters_track_global_and_depot() {
        let counters = DownloadCounters::new();
        counters.add_expected(1, 300).await;
        counters.add_expected(2, 100).await;

        counters.record_in_place(1, 100).await;
        let depot1 = counters.record_chunk(1, 60, 200).await;
        counters.record_chunk(2, 100, 100).await;

        assert_eq!(depot1.size_downloaded, 300);
        assert_eq!(depot1.complete_size, 300);
        assert_eq!(depot1.downloaded_compressed, 60);
        assert_eq!(depot1.chunks_fetched, 1);

        let global = counters.global().await;
        assert_eq!(global.complete_size, 400);
        assert_eq!(global.size_downloaded, 400);
        assert_eq!(global.downloaded_compressed, 160);
        assert_eq!(global.downloaded_uncompressed, 300);
        assert_eq!(global.chunks_fetched, 2);

        assert_eq!(counters.depot(3).await, ByteCounters::default());
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_consistent() {
        let counters = Arc::new(DownloadCounters::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let counters = counters.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    counters.record_chunk(9, 3, 7).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let depot = counters.depot(9).await;
        assert_eq!(depot.chunks_fetched, 800);
        assert_eq!(depot.downloaded_compressed, 2400);
        assert_eq!(depot.downloaded_uncompressed, 5600);
    }

    #[test]
    fn test_progress_percentage() {
        let progress = SyncProgress {
            depot_id: 1,
            bytes_so_far: 50,
            bytes_total: 200,
            current_file: None,
            file_granular: false,
        };
        assert_eq!(progress.percentage(), 25.0);

        let empty = SyncProgress {
            bytes_total: 0,
            ..progress
        };
        assert_eq!(empty.percentage(), 100.0);
    }
}
