//! The three persistent event channels a host subscribes to once.
//!
//! Channels outlive every subsystem generation. Sessions are handed an
//! `Arc<EventChannels>` and publish through it; a reset never replaces the
//! channels, so host subscriptions keep working across rebuilds.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::trace;

use texplorer_core::dispose::Disposable;
use texplorer_core::errors::DisposeError;
use texplorer_core::events::{LoadEvent, RetireEvent, RunEvent};

pub const DEFAULT_CAPACITY: usize = 1024;

/// A single named broadcast channel.
pub struct Channel<T> {
    name: &'static str,
    tx: broadcast::Sender<T>,
    closed: CancellationToken,
}

impl<T: Clone + Send + 'static> Channel<T> {
    fn new(name: &'static str, capacity: usize, closed: CancellationToken) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { name, tx, closed }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Publish to every current subscriber. Returns how many received it.
    /// Publishing with no subscribers, or after close, is not an error.
    pub fn emit(&self, event: T) -> usize {
        if self.closed.is_cancelled() {
            trace!(channel = self.name, "dropping event on closed channel");
            return 0;
        }
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn stream(&self) -> BroadcastStream<T> {
        BroadcastStream::new(self.tx.subscribe())
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

pub struct EventChannels {
    pub load: Channel<LoadEvent>,
    pub run: Channel<RunEvent>,
    pub retire: Channel<RetireEvent>,
    closed: CancellationToken,
}

impl EventChannels {
    pub fn new(capacity: usize) -> Self {
        let closed = CancellationToken::new();
        Self {
            load: Channel::new("load", capacity, closed.clone()),
            run: Channel::new("run", capacity, closed.clone()),
            retire: Channel::new("retire", capacity, closed.clone()),
            closed,
        }
    }

    /// Stop delivering on all three channels. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the channels are closed. Forwarding tasks select on this,
    /// since receivers never observe `RecvError::Closed` while senders live.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    /// Owned variant of [`Self::closed`] for spawned tasks.
    pub fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl Default for EventChannels {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl Disposable for EventChannels {
    fn name(&self) -> &str {
        "event-channels"
    }

    async fn dispose(&self) -> Result<(), DisposeError> {
        self.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use texplorer_core::ids::{GenerationId, TestId};

    #[tokio::test]
    async fn emit_without_subscribers_is_fine() {
        let channels = EventChannels::default();
        assert_eq!(channels.retire.emit(RetireEvent::all()), 0);
    }

    #[tokio::test]
    async fn every_subscriber_receives() {
        let channels = EventChannels::default();
        let mut a = channels.load.subscribe();
        let mut b = channels.load.subscribe();

        let generation = GenerationId::new();
        let delivered = channels.load.emit(LoadEvent::Started {
            generation: generation.clone(),
        });
        assert_eq!(delivered, 2);

        assert_eq!(a.recv().await.unwrap().generation(), &generation);
        assert_eq!(b.recv().await.unwrap().generation(), &generation);
    }

    #[tokio::test]
    async fn stream_yields_events() {
        let channels = EventChannels::default();
        let mut stream = channels.retire.stream();
        channels
            .retire
            .emit(RetireEvent::tests(vec![TestId::new("a::b")]));

        let event = stream.next().await.unwrap().unwrap();
        assert!(event.covers(&TestId::new("a::b")));
    }

    #[tokio::test]
    async fn closed_channels_drop_events() {
        let channels = EventChannels::default();
        let mut rx = channels.retire.subscribe();
        channels.dispose().await.unwrap();

        assert!(channels.is_closed());
        assert!(channels.retire.is_closed());
        assert_eq!(channels.retire.emit(RetireEvent::all()), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_future_resolves_on_close() {
        let channels = std::sync::Arc::new(EventChannels::default());
        let token = channels.close_token();
        let waiter = tokio::spawn(async move { token.cancelled().await });
        channels.close();
        waiter.await.unwrap();
        channels.closed().await;
    }
}
