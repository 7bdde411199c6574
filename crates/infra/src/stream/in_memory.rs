//! In-memory consumer-group stream for tests/dev.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{Instant, timeout_at};

use super::{EventStream, StreamMessage};
use crate::error::TransportError;

#[derive(Debug, Default)]
struct GroupState {
    /// Index of the next undelivered entry.
    cursor: usize,
    /// Delivered-but-unacknowledged entry ids → consumer name.
    pending: BTreeMap<String, String>,
    acked: Vec<String>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<StreamMessage>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

/// Consumer-group stream twin.
///
/// Entry ids are `<seq>-0`. Group reads hand each entry to exactly one
/// consumer and park it in the group's pending list until acknowledged.
#[derive(Default)]
pub struct InMemoryEventStream {
    streams: Mutex<HashMap<String, StreamState>>,
    wakeup: Notify,
}

impl InMemoryEventStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries ever appended to `key`, in order.
    pub fn entries(&self, key: &str) -> Vec<StreamMessage> {
        self.streams
            .lock()
            .unwrap()
            .get(key)
            .map(|s| s.entries.clone())
            .unwrap_or_default()
    }

    /// Ids acknowledged by `group` on `key`, in ack order.
    pub fn acked(&self, key: &str, group: &str) -> Vec<String> {
        self.streams
            .lock()
            .unwrap()
            .get(key)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.acked.clone())
            .unwrap_or_default()
    }

    /// Delivered-but-unacknowledged entry count for `group` on `key`.
    pub fn pending_count(&self, key: &str, group: &str) -> usize {
        self.streams
            .lock()
            .unwrap()
            .get(key)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventStream for InMemoryEventStream {
    async fn exists(&self, key: &str) -> Result<bool, TransportError> {
        Ok(self.streams.lock().unwrap().contains_key(key))
    }

    async fn create_group(&self, key: &str, group: &str) -> Result<(), TransportError> {
        let mut streams = self.streams.lock().unwrap();
        let state = streams.entry(key.to_string()).or_default();
        state.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn add(
        &self,
        key: &str,
        fields: &BTreeMap<String, String>,
        maxlen: Option<u64>,
    ) -> Result<String, TransportError> {
        let id = {
            let mut streams = self.streams.lock().unwrap();
            let state = streams.entry(key.to_string()).or_default();
            state.next_seq += 1;
            let id = format!("{}-0", state.next_seq);
            state.entries.push(StreamMessage {
                id: id.clone(),
                stream_key: key.to_string(),
                fields: fields.clone(),
            });
            // approximate trim: drop oldest entries past the target,
            // adjusting group cursors so undelivered entries stay aligned
            if let Some(maxlen) = maxlen {
                let excess = state.entries.len().saturating_sub(maxlen as usize);
                if excess > 0 {
                    state.entries.drain(0..excess);
                    for group in state.groups.values_mut() {
                        group.cursor = group.cursor.saturating_sub(excess);
                    }
                }
            }
            id
        };
        self.wakeup.notify_waiters();
        Ok(id)
    }

    async fn read_group(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, TransportError> {
        let deadline = Instant::now() + block;
        loop {
            {
                let mut streams = self.streams.lock().unwrap();
                let Some(state) = streams.get_mut(key) else {
                    return Err(TransportError::command(format!("no such stream {key:?}")));
                };
                let Some(group_state) = state.groups.get_mut(group) else {
                    return Err(TransportError::command(format!(
                        "NOGROUP no such consumer group {group:?} for stream {key:?}"
                    )));
                };
                if group_state.cursor < state.entries.len() {
                    let end = (group_state.cursor + count).min(state.entries.len());
                    let batch: Vec<StreamMessage> =
                        state.entries[group_state.cursor..end].to_vec();
                    group_state.cursor = end;
                    for message in &batch {
                        group_state
                            .pending
                            .insert(message.id.clone(), consumer.to_string());
                    }
                    return Ok(batch);
                }
            }

            let waiter = self.wakeup.notified();
            if timeout_at(deadline, waiter).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, key: &str, group: &str, id: &str) -> Result<(), TransportError> {
        let mut streams = self.streams.lock().unwrap();
        if let Some(group_state) = streams
            .get_mut(key)
            .and_then(|s| s.groups.get_mut(group))
        {
            if group_state.pending.remove(id).is_some() {
                group_state.acked.push(id.to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(value: &str) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("event".to_string(), value.to_string());
        map
    }

    #[tokio::test]
    async fn group_read_delivers_each_entry_once() {
        let stream = InMemoryEventStream::new();
        stream.create_group("s", "g").await.unwrap();
        stream.add("s", &fields("a"), None).await.unwrap();
        stream.add("s", &fields("b"), None).await.unwrap();

        let first = stream
            .read_group("s", "g", "c1", 1, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        let second = stream
            .read_group("s", "g", "c2", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].id, second[0].id);
        assert_eq!(stream.pending_count("s", "g"), 2);
    }

    #[tokio::test]
    async fn ack_moves_entries_out_of_pending() {
        let stream = InMemoryEventStream::new();
        stream.create_group("s", "g").await.unwrap();
        let id = stream.add("s", &fields("a"), None).await.unwrap();
        stream
            .read_group("s", "g", "c", 10, Duration::from_millis(10))
            .await
            .unwrap();

        stream.ack("s", "g", &id).await.unwrap();
        assert_eq!(stream.pending_count("s", "g"), 0);
        assert_eq!(stream.acked("s", "g"), vec![id]);
    }

    #[tokio::test]
    async fn blocked_read_wakes_on_append() {
        let stream = std::sync::Arc::new(InMemoryEventStream::new());
        stream.create_group("s", "g").await.unwrap();

        let reader = {
            let stream = stream.clone();
            tokio::spawn(async move {
                stream
                    .read_group("s", "g", "c", 10, Duration::from_secs(2))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.add("s", &fields("late"), None).await.unwrap();

        let messages = reader.await.unwrap().unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn maxlen_trims_oldest_entries() {
        let stream = InMemoryEventStream::new();
        for i in 0..5 {
            stream
                .add("s", &fields(&i.to_string()), Some(3))
                .await
                .unwrap();
        }
        let entries = stream.entries("s");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].fields["event"], "2");
    }

    #[tokio::test]
    async fn reading_an_unknown_group_fails() {
        let stream = InMemoryEventStream::new();
        stream.add("s", &fields("a"), None).await.unwrap();
        let err = stream
            .read_group("s", "missing", "c", 1, Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("NOGROUP"));
    }
}
