//! Stream lifecycle for one throughput phase.
//!
//! A `StreamSet` owns the tasks of every concurrent transfer stream of a
//! phase. Streams only talk back through an event channel; the set is owned
//! by the phase task and never shared. Dropping the set aborts every stream.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Extra delay added before every stream start.
const START_SLACK: Duration = Duration::from_millis(1);

/// Notifications sent by stream tasks to their phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Cumulative bytes of the transfer currently in flight on `index`
    Progress { index: usize, loaded: u64 },
    /// A transfer finished and the stream is starting a fresh one
    TransferCompleted { index: usize },
    /// The stream hit a transport error and stopped
    Failed { index: usize, reason: String },
}

/// Sending side handed to each stream task.
#[derive(Debug, Clone)]
pub struct StreamEvents {
    index: usize,
    sender: mpsc::UnboundedSender<StreamEvent>,
}

impl StreamEvents {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn progress(&self, loaded: u64) {
        let _ = self.sender.send(StreamEvent::Progress {
            index: self.index,
            loaded,
        });
    }

    pub fn completed(&self) {
        let _ = self.sender.send(StreamEvent::TransferCompleted { index: self.index });
    }

    pub fn failed(&self, reason: impl Into<String>) {
        let _ = self.sender.send(StreamEvent::Failed {
            index: self.index,
            reason: reason.into(),
        });
    }
}

/// Body run by every stream task.
pub type StreamBody = Arc<dyn Fn(StreamEvents) -> BoxFuture<'static, ()> + Send + Sync>;

/// Concurrent transfer streams of one phase.
pub struct StreamSet {
    body: StreamBody,
    sender: mpsc::UnboundedSender<StreamEvent>,
    receiver: Option<mpsc::UnboundedReceiver<StreamEvent>>,
    streams: HashMap<usize, JoinHandle<()>>,
}

impl StreamSet {
    pub fn new(body: StreamBody) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            body,
            sender,
            receiver: Some(receiver),
            streams: HashMap::new(),
        }
    }

    /// Starts stream `index` after `delay`.
    pub fn spawn(&mut self, index: usize, delay: Duration) {
        if self.receiver.is_none() {
            return;
        }
        let events = StreamEvents {
            index,
            sender: self.sender.clone(),
        };
        let body = self.body.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay + START_SLACK).await;
            body(events).await;
        });
        if let Some(previous) = self.streams.insert(index, handle) {
            previous.abort();
        }
    }

    /// Replaces stream `index` with a fresh one started without delay.
    pub fn retry(&mut self, index: usize) {
        self.discard(index);
        self.spawn(index, Duration::ZERO);
    }

    /// Cancels stream `index` without replacement.
    pub fn discard(&mut self, index: usize) {
        if let Some(handle) = self.streams.remove(&index) {
            handle.abort();
        }
    }

    /// Streams that have not been discarded and are still running.
    pub fn live_count(&self) -> usize {
        self.streams
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Waits for the next stream event. Returns `None` once detached.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.recv().await,
            None => None,
        }
    }

    /// Detaches the event observer, cancels every stream and forgets them.
    pub fn abort_all(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            receiver.close();
        }
        for (_, handle) in self.streams.drain() {
            handle.abort();
        }
    }
}

impl Drop for StreamSet {
    fn drop(&mut self) {
        self.abort_all();
    }
}

impl fmt::Debug for StreamSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSet")
            .field("streams", &self.streams.len())
            .field("attached", &self.receiver.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt;

    use super::*;

    fn counting_body(started: Arc<AtomicUsize>) -> StreamBody {
        Arc::new(move |events: StreamEvents| {
            let started = started.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                events.progress(100);
                // Run until cancelled
                std::future::pending::<()>().await;
            }
            .boxed()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_streams_start_staggered() {
        let started = Arc::new(AtomicUsize::new(0));
        let mut set = StreamSet::new(counting_body(started.clone()));
        for index in 0..3 {
            set.spawn(index, Duration::from_millis(300) * index as u32);
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(started.load(Ordering::SeqCst), 2);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(started.load(Ordering::SeqCst), 3);
        assert_eq!(set.live_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_carry_stream_index() {
        let started = Arc::new(AtomicUsize::new(0));
        let mut set = StreamSet::new(counting_body(started));
        set.spawn(4, Duration::ZERO);

        let event = set.next_event().await;
        assert_eq!(
            event,
            Some(StreamEvent::Progress {
                index: 4,
                loaded: 100
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_all_detaches_and_cancels() {
        let started = Arc::new(AtomicUsize::new(0));
        let mut set = StreamSet::new(counting_body(started.clone()));
        set.spawn(0, Duration::ZERO);
        set.spawn(1, Duration::from_secs(10));
        tokio::time::sleep(Duration::from_millis(10)).await;

        set.abort_all();
        assert_eq!(set.live_count(), 0);
        assert_eq!(set.next_event().await, None);

        // Spawning after abort is ignored
        set.spawn(2, Duration::ZERO);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_and_discard() {
        let started = Arc::new(AtomicUsize::new(0));
        let mut set = StreamSet::new(counting_body(started.clone()));
        set.spawn(0, Duration::ZERO);
        set.spawn(1, Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(10)).await;

        set.retry(0);
        set.discard(1);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(started.load(Ordering::SeqCst), 3);
        assert_eq!(set.live_count(), 1);
    }
}
