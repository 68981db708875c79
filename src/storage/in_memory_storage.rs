use std::collections::VecDeque;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::{
    reading::{Reading, Sample, Timestamp, now_millis},
    storage::{AppendReceipt, Backend, QueryLimits, Storage, StoreError},
};

/// Readings in insertion order, plus the last timestamp handed out.
struct Ring {
    readings: VecDeque<Reading>,
    last_timestamp: Timestamp,
}

/// Keeps the most recent `capacity` readings in memory.
///
/// On overflow the oldest readings are evicted first, so the ring never holds
/// more than `capacity` entries. Contents live only as long as the process.
pub struct InMemoryStorage {
    capacity: usize,
    limits: QueryLimits,
    // One lock covers both the ring and the timestamp counter so that
    // stamping and inserting a reading is a single step.
    ring: RwLock<Ring>,
}

impl InMemoryStorage {
    pub fn new(capacity: usize, limits: QueryLimits) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            limits,
            ring: RwLock::new(Ring {
                readings: VecDeque::with_capacity(capacity.min(4096)),
                last_timestamp: Timestamp::MIN,
            }),
        }
    }
}

#[async_trait::async_trait]
impl Storage for InMemoryStorage {
    fn backend(&self) -> Backend {
        Backend::Memory
    }

    #[instrument(skip_all)]
    async fn append(&self, sample: Sample) -> Result<AppendReceipt, StoreError> {
        let mut ring = self.ring.write().await;
        let timestamp = now_millis().max(ring.last_timestamp);
        let reading = sample.at(timestamp);

        // Drop just enough from the head to make room for the new reading.
        while ring.readings.len() >= self.capacity {
            ring.readings.pop_front();
        }
        ring.readings.push_back(reading);
        ring.last_timestamp = timestamp;

        let size = ring.readings.len();
        debug!(size, "Stored reading in memory");
        Ok(AppendReceipt {
            id: None,
            size: Some(size),
            reading,
        })
    }

    #[instrument(skip_all)]
    async fn recent(&self, limit: Option<usize>) -> Result<Vec<Reading>, StoreError> {
        let limit = self.limits.resolve(limit);
        let ring = self.ring.read().await;
        let skip = ring.readings.len().saturating_sub(limit);
        let result: Vec<_> = ring.readings.iter().skip(skip).copied().collect();
        debug!("Found {} readings", result.len());
        Ok(result)
    }

    async fn latest(&self) -> Result<Option<Reading>, StoreError> {
        Ok(self.ring.read().await.readings.back().copied())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn sample(t: f64, h: f64) -> Sample {
        Sample::new(t, h).unwrap()
    }

    fn values(readings: &[Reading]) -> Vec<(f64, f64)> {
        readings
            .iter()
            .map(|r| (r.temperature, r.humidity))
            .collect()
    }

    #[tokio::test]
    async fn test_empty_store() {
        let store = InMemoryStorage::new(10, QueryLimits::default());
        assert_eq!(store.latest().await.unwrap(), None);
        assert!(store.recent(Some(5)).await.unwrap().is_empty());
        assert!(store.recent(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overflow_evicts_oldest() {
        let store = InMemoryStorage::new(3, QueryLimits::default());
        for (t, h) in [(20.0, 50.0), (21.0, 51.0), (22.0, 52.0), (23.0, 53.0)] {
            store.append(sample(t, h)).await.unwrap();
        }

        let recent = store.recent(Some(10)).await.unwrap();
        assert_eq!(
            values(&recent),
            vec![(21.0, 51.0), (22.0, 52.0), (23.0, 53.0)]
        );
        let latest = store.latest().await.unwrap().unwrap();
        assert_eq!((latest.temperature, latest.humidity), (23.0, 53.0));
        assert_eq!(store.recent(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_retains_last_n_in_order() {
        let store = InMemoryStorage::new(5, QueryLimits::default());
        for i in 0..12 {
            let receipt = store.append(sample(i as f64, 40.0)).await.unwrap();
            assert!(receipt.size.unwrap() <= 5);
            assert_eq!(receipt.id, None);
        }

        let recent = store.recent(None).await.unwrap();
        let temperatures: Vec<_> = recent.iter().map(|r| r.temperature).collect();
        assert_eq!(temperatures, vec![7.0, 8.0, 9.0, 10.0, 11.0]);
        assert!(recent.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(recent.last().copied(), store.latest().await.unwrap());
    }

    #[tokio::test]
    async fn test_recent_window_and_clamp() {
        let store = InMemoryStorage::new(100, QueryLimits { default: 4, max: 6 });
        for i in 0..10 {
            store.append(sample(i as f64, 0.0)).await.unwrap();
        }

        let two: Vec<_> = store
            .recent(Some(2))
            .await
            .unwrap()
            .iter()
            .map(|r| r.temperature)
            .collect();
        assert_eq!(two, vec![8.0, 9.0]);
        assert_eq!(store.recent(None).await.unwrap().len(), 4);
        assert_eq!(store.recent(Some(0)).await.unwrap().len(), 4);
        assert_eq!(store.recent(Some(50)).await.unwrap().len(), 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends() {
        let store = Arc::new(InMemoryStorage::new(1000, QueryLimits::default()));
        let tasks: Vec<_> = (0..64)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.append(sample(i as f64, 1.0)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let recent = store.recent(Some(1000)).await.unwrap();
        assert_eq!(recent.len(), 64);
        assert!(recent.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }
}
