//! In-process partitioned log implementing [`LogCluster`].
//!
//! Records are appended per partition; consumer groups share a topic's
//! partitions round-robin among their live readers and resume from the
//! group's committed offset. Uncommitted records are therefore seen again by
//! whichever member next owns the partition.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::domain::{BackendError, RequiredAcks, TlsOptions};
use crate::ports::{
    LogCluster, LogProducer, LogReader, LogRecord, OffsetCommitter, OutboundRecord,
    ProducerConfig, ReaderConfig, RecordMetadata,
};

type GroupKey = (String, String);

#[derive(Default)]
struct ClusterState {
    unreachable: bool,
    connected: bool,
    partitions: i32,
    topics: HashMap<String, Vec<Vec<LogRecord>>>,
    committed: HashMap<(String, String, i32), i64>,
    members: HashMap<GroupKey, Vec<u64>>,
    next_member: u64,
    failing_sends: usize,
    producers_created: usize,
    open_producers: usize,
    round_robin: usize,
}

impl ClusterState {
    fn partitions_of(&mut self, topic: &str) -> &mut Vec<Vec<LogRecord>> {
        let count = self.partitions.max(1) as usize;
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); count])
    }

    fn committed(&self, group: &str, topic: &str, partition: i32) -> i64 {
        self.committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
            .unwrap_or(0)
    }

    /// Partitions owned by `member` under the current membership.
    fn assignment(&self, group: &str, topic: &str, member: u64) -> Vec<i32> {
        let members = match self.members.get(&(group.to_string(), topic.to_string())) {
            Some(members) => members,
            None => return Vec::new(),
        };
        let Some(index) = members.iter().position(|m| *m == member) else {
            return Vec::new();
        };
        (0..self.partitions.max(1))
            .filter(|p| *p as usize % members.len() == index)
            .collect()
    }
}

/// Shared handle to an in-process log cluster. Clones see the same data.
#[derive(Clone)]
pub struct MemoryLogCluster {
    state: Arc<Mutex<ClusterState>>,
    appended: Arc<Notify>,
}

impl Default for MemoryLogCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLogCluster {
    /// Single-partition cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::with_partitions(1)
    }

    #[must_use]
    pub fn with_partitions(partitions: i32) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClusterState {
                partitions: partitions.max(1),
                ..ClusterState::default()
            })),
            appended: Arc::new(Notify::new()),
        }
    }

    /// When false, `connect` fails as if no seed broker answered.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unreachable = !reachable;
    }

    /// Reject the next `count` sends on any producer.
    pub fn fail_next_sends(&self, count: usize) {
        self.state.lock().failing_sends = count;
    }

    #[must_use]
    pub fn producers_created(&self) -> usize {
        self.state.lock().producers_created
    }

    #[must_use]
    pub fn open_producers(&self) -> usize {
        self.state.lock().open_producers
    }

    /// Every record on `topic`, partition by partition.
    #[must_use]
    pub fn records(&self, topic: &str) -> Vec<LogRecord> {
        self.state
            .lock()
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Next offset `group` will read on `partition`, if it ever committed.
    #[must_use]
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state
            .lock()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Records on `topic` not yet committed by `group`.
    #[must_use]
    pub fn consumer_lag(&self, group: &str, topic: &str) -> i64 {
        lag(&self.state.lock(), group, topic)
    }

    /// Live readers in `group` on `topic`.
    #[must_use]
    pub fn group_members(&self, group: &str, topic: &str) -> usize {
        self.state
            .lock()
            .members
            .get(&(group.to_string(), topic.to_string()))
            .map_or(0, Vec::len)
    }
}

fn lag(state: &ClusterState, group: &str, topic: &str) -> i64 {
    state.topics.get(topic).map_or(0, |partitions| {
        partitions
            .iter()
            .enumerate()
            .map(|(p, records)| records.len() as i64 - state.committed(group, topic, p as i32))
            .sum()
    })
}

#[async_trait]
impl LogCluster for MemoryLogCluster {
    async fn connect(
        &self,
        addresses: &[String],
        _tls: Option<&TlsOptions>,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if state.unreachable {
            return Err(BackendError::Unreachable(addresses.join(",")));
        }
        state.connected = true;
        Ok(())
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.state.lock().connected = false;
        self.appended.notify_waiters();
        Ok(())
    }

    async fn producer(&self, config: ProducerConfig) -> Result<Arc<dyn LogProducer>, BackendError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(BackendError::SessionClosed);
        }
        state.producers_created += 1;
        state.open_producers += 1;
        Ok(Arc::new(MemoryLogProducer {
            cluster: self.clone(),
            config,
            closed: AtomicBool::new(false),
        }))
    }

    async fn reader(&self, config: ReaderConfig) -> Result<Box<dyn LogReader>, BackendError> {
        let member = {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(BackendError::SessionClosed);
            }
            state.next_member += 1;
            let member = state.next_member;
            state
                .members
                .entry((config.group.clone(), config.topic.clone()))
                .or_default()
                .push(member);
            member
        };
        debug!(group = %config.group, topic = %config.topic, member, "Reader joined group");

        Ok(Box::new(MemoryLogReader {
            cluster: self.clone(),
            config,
            member,
            positions: HashMap::new(),
            buffer: VecDeque::new(),
            last_lag_report: Instant::now(),
            closed: false,
        }))
    }
}

struct MemoryLogProducer {
    cluster: MemoryLogCluster,
    config: ProducerConfig,
    closed: AtomicBool,
}

#[async_trait]
impl LogProducer for MemoryLogProducer {
    async fn send(&self, record: OutboundRecord) -> Result<RecordMetadata, BackendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::SessionClosed);
        }
        let metadata = {
            let mut state = self.cluster.state.lock();
            if !state.connected {
                return Err(BackendError::SessionClosed);
            }
            if state.failing_sends > 0 {
                state.failing_sends -= 1;
                return Err(BackendError::Rejected("leader not available".into()));
            }

            let count = state.partitions.max(1) as usize;
            let partition = match &record.key {
                Some(key) => {
                    let mut hasher = DefaultHasher::new();
                    key.hash(&mut hasher);
                    (hasher.finish() % count as u64) as usize
                }
                None => {
                    let next = state.round_robin % count;
                    state.round_robin = state.round_robin.wrapping_add(1);
                    next
                }
            };

            let topic = self.config.topic.clone();
            let log = &mut state.partitions_of(&topic)[partition];
            let offset = log.len() as i64;
            log.push(LogRecord {
                topic,
                partition: partition as i32,
                offset,
                key: record.key,
                headers: record.headers,
                value: record.value,
            });
            RecordMetadata {
                partition: partition as i32,
                offset: match self.config.required_acks {
                    RequiredAcks::None => -1,
                    RequiredAcks::Leader | RequiredAcks::All => offset,
                },
            }
        };
        self.cluster.appended.notify_waiters();
        Ok(metadata)
    }

    async fn close(&self) -> Result<(), BackendError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.cluster.state.lock().open_producers -= 1;
        }
        Ok(())
    }
}

struct MemoryLogReader {
    cluster: MemoryLogCluster,
    config: ReaderConfig,
    member: u64,
    positions: HashMap<i32, i64>,
    buffer: VecDeque<LogRecord>,
    last_lag_report: Instant,
    closed: bool,
}

impl MemoryLogReader {
    /// Move available records into the buffer once `min_bytes` are pending,
    /// or any at all once `flush` is set. Returns true when something moved.
    fn fill(&mut self, flush: bool) -> Result<bool, BackendError> {
        let state = self.cluster.state.lock();
        if !state.connected || self.closed {
            return Err(BackendError::SessionClosed);
        }

        let assigned = state.assignment(&self.config.group, &self.config.topic, self.member);
        self.positions.retain(|p, _| assigned.contains(p));
        for partition in &assigned {
            self.positions.entry(*partition).or_insert_with(|| {
                state.committed(&self.config.group, &self.config.topic, *partition)
            });
        }

        let Some(partitions) = state.topics.get(&self.config.topic) else {
            return Ok(false);
        };
        let pending: Vec<&LogRecord> = assigned
            .iter()
            .flat_map(|p| {
                let from = self.positions.get(p).copied().unwrap_or(0).max(0) as usize;
                partitions
                    .get(*p as usize)
                    .map(|records| records.get(from..).unwrap_or_default())
                    .unwrap_or_default()
            })
            .collect();

        let pending_bytes: usize = pending.iter().map(|r| r.value.len()).sum();
        if pending.is_empty() || (!flush && pending_bytes < self.config.min_bytes) {
            return Ok(false);
        }

        let mut taken = 0;
        for record in pending {
            if taken > 0 && taken + record.value.len() > self.config.max_bytes {
                break;
            }
            taken += record.value.len();
            self.positions.insert(record.partition, record.offset + 1);
            self.buffer.push_back(record.clone());
        }

        if let Some(interval) = self.config.read_lag_interval {
            if self.last_lag_report.elapsed() >= interval {
                self.last_lag_report = Instant::now();
                debug!(
                    group = %self.config.group,
                    topic = %self.config.topic,
                    lag = lag(&state, &self.config.group, &self.config.topic),
                    "Consumer lag"
                );
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl LogReader for MemoryLogReader {
    async fn fetch(&mut self) -> Result<Option<LogRecord>, BackendError> {
        let deadline = Instant::now() + self.config.max_wait;
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Ok(Some(record));
            }

            let appended = Arc::clone(&self.cluster.appended);
            let notified = appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let expired = Instant::now() >= deadline;
            if self.fill(expired)? {
                continue;
            }
            if expired {
                return Ok(None);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = sleep_until(deadline) => {}
            }
        }
    }

    fn committer(&self) -> Arc<dyn OffsetCommitter> {
        Arc::new(GroupCommitter {
            state: Arc::clone(&self.cluster.state),
            group: self.config.group.clone(),
            topic: self.config.topic.clone(),
        })
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.buffer.clear();
        let mut state = self.cluster.state.lock();
        if let Some(members) = state
            .members
            .get_mut(&(self.config.group.clone(), self.config.topic.clone()))
        {
            members.retain(|m| *m != self.member);
        }
        debug!(group = %self.config.group, member = self.member, "Reader left group");
        Ok(())
    }
}

struct GroupCommitter {
    state: Arc<Mutex<ClusterState>>,
    group: String,
    topic: String,
}

impl OffsetCommitter for GroupCommitter {
    fn commit(&self, partition: i32, offset: i64) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(BackendError::SessionClosed);
        }
        let entry = state
            .committed
            .entry((self.group.clone(), self.topic.clone(), partition))
            .or_insert(0);
        *entry = (*entry).max(offset + 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn reader_config(group: &str) -> ReaderConfig {
        ReaderConfig {
            topic: "orders".into(),
            group: group.into(),
            min_bytes: 1,
            max_bytes: 1024 * 1024,
            max_wait: Duration::from_millis(30),
            read_lag_interval: None,
        }
    }

    fn record(value: &'static str) -> OutboundRecord {
        OutboundRecord {
            key: None,
            headers: Default::default(),
            value: Bytes::from_static(value.as_bytes()),
        }
    }

    async fn connected(partitions: i32) -> MemoryLogCluster {
        let cluster = MemoryLogCluster::with_partitions(partitions);
        cluster.connect(&[], None).await.unwrap();
        cluster
    }

    async fn producer(cluster: &MemoryLogCluster) -> Arc<dyn LogProducer> {
        cluster
            .producer(ProducerConfig {
                topic: "orders".into(),
                required_acks: RequiredAcks::All,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_times_out_empty() {
        let cluster = connected(1).await;
        let mut reader = cluster.reader(reader_config("g")).await.unwrap();
        assert_eq!(reader.fetch().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_uncommitted_records_return_after_rejoin() {
        let cluster = connected(1).await;
        let producer = producer(&cluster).await;
        producer.send(record("a")).await.unwrap();
        producer.send(record("b")).await.unwrap();

        let mut reader = cluster.reader(reader_config("g")).await.unwrap();
        let first = reader.fetch().await.unwrap().unwrap();
        reader.committer().commit(first.partition, first.offset).unwrap();
        let second = reader.fetch().await.unwrap().unwrap();
        assert_eq!(second.offset, 1);
        reader.close().await.unwrap();

        let mut rejoined = cluster.reader(reader_config("g")).await.unwrap();
        let again = rejoined.fetch().await.unwrap().unwrap();
        assert_eq!(again.value, Bytes::from_static(b"b"));
        assert_eq!(cluster.consumer_lag("g", "orders"), 1);
    }

    #[tokio::test]
    async fn test_group_members_split_partitions() {
        let cluster = connected(2).await;
        let producer = producer(&cluster).await;
        producer.send(record("a")).await.unwrap();
        producer.send(record("b")).await.unwrap();

        let mut first = cluster.reader(reader_config("g")).await.unwrap();
        let mut second = cluster.reader(reader_config("g")).await.unwrap();
        assert_eq!(cluster.group_members("g", "orders"), 2);

        let a = first.fetch().await.unwrap().unwrap();
        let b = second.fetch().await.unwrap().unwrap();
        assert_ne!(a.partition, b.partition);
        assert_eq!(first.fetch().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_min_bytes_waits_for_max_wait() {
        let cluster = connected(1).await;
        let producer = producer(&cluster).await;
        producer.send(record("tiny")).await.unwrap();

        let mut reader = cluster
            .reader(ReaderConfig {
                min_bytes: 1024,
                ..reader_config("g")
            })
            .await
            .unwrap();
        let started = Instant::now();
        let fetched = reader.fetch().await.unwrap().unwrap();
        assert_eq!(fetched.value, Bytes::from_static(b"tiny"));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_closed_cluster_rejects_io() {
        let cluster = connected(1).await;
        let producer = producer(&cluster).await;
        let mut reader = cluster.reader(reader_config("g")).await.unwrap();
        cluster.close().await.unwrap();

        assert_eq!(
            producer.send(record("x")).await.unwrap_err(),
            BackendError::SessionClosed
        );
        assert_eq!(reader.fetch().await.unwrap_err(), BackendError::SessionClosed);
    }

    #[tokio::test]
    async fn test_unreachable_connect() {
        let cluster = MemoryLogCluster::new();
        cluster.set_reachable(false);
        let err = cluster
            .connect(&["kafka-0:9092".to_string()], None)
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::Unreachable("kafka-0:9092".into()));
    }
}
