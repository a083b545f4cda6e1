use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;

use super::types::Event;
use crate::core::error::{CoreError, CoreResult};

/// Delivery seam. Implementations hand the event to whatever fans it out
/// further; the core never reads events back.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, channel: &str, event: &Event) -> CoreResult<()>;
}

/// One broadcast channel per logical channel name. A channel exists only
/// while someone is subscribed to it; per-run channels come and go with
/// their listeners.
pub struct BroadcastHub {
    capacity: usize,
    channels: Mutex<HashMap<String, broadcast::Sender<Event>>>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channels(&self) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Sender<Event>>> {
        self.channels.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Event> {
        self.channels()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Drop channels whose last subscriber went away. Returns how many.
    pub fn prune_idle(&self) -> usize {
        let mut channels = self.channels();
        let before = channels.len();
        channels.retain(|_, sender| sender.receiver_count() > 0);
        before - channels.len()
    }

    #[cfg(test)]
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.channels().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl EventSink for BroadcastHub {
    async fn publish(&self, channel: &str, event: &Event) -> CoreResult<()> {
        // No live subscribers is not a delivery failure
        let mut channels = self.channels();
        let abandoned = channels
            .get(channel)
            .is_some_and(|sender| sender.send(event.clone()).is_err());
        if abandoned {
            channels.remove(channel);
        }
        Ok(())
    }
}

/// Appends every event seen on the global channel to a JSON-lines file, so
/// out-of-process consumers can follow along.
pub struct JsonlSink {
    path: PathBuf,
    global_channel: String,
    lock: tokio::sync::Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: PathBuf, global_channel: String) -> Self {
        Self {
            path,
            global_channel,
            lock: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl EventSink for JsonlSink {
    async fn publish(&self, channel: &str, event: &Event) -> CoreResult<()> {
        if channel != self.global_channel {
            return Ok(());
        }
        let mut line = serde_json::to_string(event).map_err(|e| CoreError::Publish(e.to_string()))?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| CoreError::Publish(format!("{}: {}", self.path.display(), e)))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| CoreError::Publish(format!("{}: {}", self.path.display(), e)))?;
        Ok(())
    }
}

/// Keeps every (channel, event) pair in memory. Can be told to fail.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingSink {
    pub delivered: Mutex<Vec<(String, Event)>>,
    pub fail: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl RecordingSink {
    pub fn events_on(&self, channel: &str) -> Vec<Event> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, channel: &str, event: &Event) -> CoreResult<()> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(CoreError::Publish(format!("{} unavailable", channel)));
        }
        self.delivered
            .lock()
            .unwrap()
            .push((channel.to_string(), event.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::EventType;

    #[tokio::test]
    async fn subscribers_receive_only_their_channel() {
        let hub = BroadcastHub::new(8);
        let mut global = hub.subscribe("dagsync:global");
        let mut other = hub.subscribe("dagsync:job:x");

        let event = Event::new(EventType::ChainCompleted, "job-1");
        hub.publish("dagsync:global", &event).await.unwrap();

        assert_eq!(global.recv().await.unwrap().event_id, event.event_id);
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_fine() {
        let hub = BroadcastHub::new(8);
        let event = Event::new(EventType::ChainFailed, "job-1");
        hub.publish("dagsync:global", &event).await.unwrap();
        assert!(hub.channel_names().is_empty());
    }

    #[tokio::test]
    async fn channels_go_away_with_their_last_subscriber() {
        let hub = BroadcastHub::new(8);
        let global = hub.subscribe("dagsync:global");
        let run = hub.subscribe("dagsync:job:j:run:r1");
        let job = hub.subscribe("dagsync:job:j");
        assert_eq!(hub.channel_names().len(), 3);

        drop(run);
        let event = Event::new(EventType::WorkflowCompleted, "j");
        hub.publish("dagsync:job:j:run:r1", &event).await.unwrap();
        assert_eq!(
            hub.channel_names(),
            vec!["dagsync:global".to_string(), "dagsync:job:j".to_string()]
        );

        drop(job);
        assert_eq!(hub.prune_idle(), 1);
        assert_eq!(hub.channel_names(), vec!["dagsync:global".to_string()]);
        drop(global);
    }

    #[tokio::test]
    async fn jsonl_sink_appends_global_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let sink = JsonlSink::new(path.clone(), "dagsync:global".to_string());

        let event = Event::new(EventType::WorkflowTriggered, "job-1");
        sink.publish("dagsync:global", &event).await.unwrap();
        sink.publish("dagsync:job:job-1", &event).await.unwrap();
        sink.publish("dagsync:global", &event).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: Event = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.event_type, EventType::WorkflowTriggered);
    }
}
