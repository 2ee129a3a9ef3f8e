use crate::error::RelayError;
use crate::metrics::{counters, gauges, histograms};
use crate::registry::Registry;
use courier_common::Envelope;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Outcome of dispatching one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the recipient's connection.
    Delivered,
    /// Recipient not connected; message dropped.
    RecipientAbsent,
    /// Write failed; recipient closed and deregistered.
    WriteFailed,
    /// Message could not be encoded; dropped.
    EncodeFailed,
}

struct Queued {
    envelope: Envelope,
    enqueued_at: Instant,
}

/// Intake point for the router. Cheap to clone; one per session.
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::Sender<Queued>,
}

impl RouterHandle {
    /// Queue a stamped message for delivery.
    ///
    /// Waits while the queue is full, which backpressures the caller's reads.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::RouterClosed`] if the router has stopped.
    pub async fn submit(&self, envelope: Envelope) -> Result<(), RelayError> {
        let queued = Queued {
            envelope,
            enqueued_at: Instant::now(),
        };
        self.tx
            .send(queued)
            .await
            .map_err(|_| RelayError::RouterClosed)?;
        gauges::route_queue_depth(self.tx.max_capacity() - self.tx.capacity());
        Ok(())
    }
}

/// Single-worker dispatcher. Messages are handled one at a time in the
/// order they were queued, so two writes to one connection never overlap.
pub struct Router {
    registry: Arc<Registry>,
    rx: mpsc::Receiver<Queued>,
}

pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Create a router bound to `registry` with a queue of `capacity` messages.
///
/// # Panics
///
/// Panics if `capacity` is zero.
#[must_use]
pub fn channel(registry: Arc<Registry>, capacity: usize) -> (RouterHandle, Router) {
    let (tx, rx) = mpsc::channel(capacity);
    (RouterHandle { tx }, Router { registry, rx })
}

impl Router {
    /// Process messages until every [`RouterHandle`] is dropped and the
    /// queue is empty.
    pub async fn run(mut self) {
        info!("router started");
        while let Some(queued) = self.rx.recv().await {
            self.process(queued).await;
        }
        info!("router stopped");
    }

    /// Like [`Router::run`], but once `shutdown` flips to `true` stop
    /// accepting new messages and return after draining what is queued.
    pub async fn run_with_shutdown(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("router started");
        loop {
            tokio::select! {
                biased;
                queued = self.rx.recv() => match queued {
                    Some(queued) => self.process(queued).await,
                    None => break,
                },
                () = stopped(&mut shutdown) => {
                    self.rx.close();
                    let mut drained = 0usize;
                    while let Some(queued) = self.rx.recv().await {
                        self.process(queued).await;
                        drained += 1;
                    }
                    debug!(drained, "router queue drained");
                    break;
                }
            }
        }
        info!("router stopped");
    }

    async fn process(&self, queued: Queued) {
        gauges::route_queue_depth(self.rx.len());
        if self.dispatch(queued.envelope).await == Delivery::Delivered {
            histograms::delivery_latency_seconds(queued.enqueued_at.elapsed().as_secs_f64());
        }
    }

    /// Deliver one message to its recipient's live connection, if any.
    pub async fn dispatch(&self, envelope: Envelope) -> Delivery {
        let Some(handle) = self.registry.lookup(&envelope.recipient) else {
            debug!(recipient = %envelope.recipient, "recipient not connected, dropping message");
            counters::messages_dropped_total("offline");
            return Delivery::RecipientAbsent;
        };

        let text = match envelope.to_outbound().encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(recipient = %envelope.recipient, error = %e, "failed to encode message");
                counters::messages_dropped_total("encode");
                return Delivery::EncodeFailed;
            }
        };

        match handle.conn.write(Message::Text(text)).await {
            Ok(()) => {
                counters::messages_relayed_total();
                Delivery::Delivered
            }
            Err(e) => {
                warn!(
                    recipient = %handle.identity,
                    conn_id = handle.id,
                    error = %e,
                    "write to recipient failed, dropping connection"
                );
                counters::messages_dropped_total("write_failed");
                handle.conn.close().await;
                self.registry.deregister_if(&handle.identity, handle.id);
                Delivery::WriteFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mock::MockConnection;
    use crate::connection::Connection;
    use crate::registry::ConnHandle;

    fn envelope(sender: &str, recipient: &str, body: &str) -> Envelope {
        Envelope {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            body: body.to_string(),
        }
    }

    fn register(registry: &Registry, identity: &str, conn: Arc<MockConnection>) -> ConnHandle {
        let handle = registry.handle(identity.to_string(), conn);
        let _ = registry.register(handle.clone()).unwrap();
        handle
    }

    #[tokio::test]
    async fn dispatch_writes_once_to_recipient_only() {
        let registry = Arc::new(Registry::new());
        let bob = MockConnection::new();
        let carol = MockConnection::new();
        register(&registry, "bob", bob.clone());
        register(&registry, "carol", carol.clone());
        let (_handle, router) = channel(Arc::clone(&registry), 8);

        let outcome = router.dispatch(envelope("alice", "bob", "hi")).await;

        assert_eq!(outcome, Delivery::Delivered);
        let delivered = bob.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].sender, "alice");
        assert_eq!(delivered[0].body, "hi");
        assert!(carol.delivered().is_empty());
    }

    #[tokio::test]
    async fn dispatch_to_absent_recipient_drops_message() {
        let registry = Arc::new(Registry::new());
        let bob = MockConnection::new();
        register(&registry, "bob", bob.clone());
        let (_handle, router) = channel(Arc::clone(&registry), 8);

        let outcome = router.dispatch(envelope("alice", "dave", "hello?")).await;

        assert_eq!(outcome, Delivery::RecipientAbsent);
        assert!(bob.delivered().is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn write_failure_closes_and_deregisters_recipient() {
        let registry = Arc::new(Registry::new());
        let bob = MockConnection::failing();
        register(&registry, "bob", bob.clone());
        let (_handle, router) = channel(Arc::clone(&registry), 8);

        let outcome = router.dispatch(envelope("alice", "bob", "hi")).await;

        assert_eq!(outcome, Delivery::WriteFailed);
        assert!(registry.lookup("bob").is_none());
        assert!(bob.is_closed());
    }

    #[tokio::test]
    async fn write_failure_leaves_other_recipients_alone() {
        let registry = Arc::new(Registry::new());
        let bob = MockConnection::failing();
        let carol = MockConnection::new();
        register(&registry, "bob", bob.clone());
        register(&registry, "carol", carol.clone());
        let (_handle, router) = channel(Arc::clone(&registry), 8);

        assert_eq!(
            router.dispatch(envelope("alice", "bob", "1")).await,
            Delivery::WriteFailed
        );
        assert_eq!(
            router.dispatch(envelope("alice", "carol", "2")).await,
            Delivery::Delivered
        );
        assert_eq!(
            router.dispatch(envelope("alice", "bob", "3")).await,
            Delivery::RecipientAbsent
        );

        assert!(registry.lookup("carol").is_some());
        assert!(!carol.is_closed());
        assert_eq!(carol.delivered().len(), 1);
    }

    #[tokio::test]
    async fn run_preserves_submission_order() {
        let registry = Arc::new(Registry::new());
        let bob = MockConnection::new();
        register(&registry, "bob", bob.clone());
        let (handle, router) = channel(Arc::clone(&registry), 4);
        let worker = tokio::spawn(router.run());

        for i in 0..10 {
            handle
                .submit(envelope("alice", "bob", &format!("msg {i}")))
                .await
                .unwrap();
        }
        drop(handle);
        worker.await.unwrap();

        let bodies: Vec<String> = bob.delivered().into_iter().map(|m| m.body).collect();
        let expected: Vec<String> = (0..10).map(|i| format!("msg {i}")).collect();
        assert_eq!(bodies, expected);
    }

    #[tokio::test]
    async fn absent_recipient_does_not_stall_the_queue() {
        let registry = Arc::new(Registry::new());
        let bob = MockConnection::new();
        register(&registry, "bob", bob.clone());
        let (handle, router) = channel(Arc::clone(&registry), 2);
        let worker = tokio::spawn(router.run());

        handle.submit(envelope("alice", "ghost", "1")).await.unwrap();
        handle.submit(envelope("alice", "ghost", "2")).await.unwrap();
        handle.submit(envelope("alice", "bob", "3")).await.unwrap();
        drop(handle);
        worker.await.unwrap();

        let delivered = bob.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].body, "3");
    }

    #[tokio::test]
    async fn submit_waits_while_queue_is_full() {
        let registry = Arc::new(Registry::new());
        let (handle, mut router) = channel(registry, 1);

        handle.submit(envelope("alice", "bob", "1")).await.unwrap();
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            handle.submit(envelope("alice", "bob", "2")),
        )
        .await;
        assert!(blocked.is_err(), "submit returned with a full queue");

        // freeing the slot lets the next submit through
        let queued = router.rx.recv().await.unwrap();
        assert_eq!(queued.envelope.body, "1");
        handle.submit(envelope("alice", "bob", "3")).await.unwrap();
    }

    #[tokio::test]
    async fn submit_after_router_stopped_fails() {
        let registry = Arc::new(Registry::new());
        let (handle, router) = channel(registry, 1);
        drop(router);

        let result = handle.submit(envelope("alice", "bob", "hi")).await;
        assert!(matches!(result, Err(RelayError::RouterClosed)));
    }

    #[tokio::test]
    async fn run_with_shutdown_drains_queue_then_stops() {
        let registry = Arc::new(Registry::new());
        let bob = MockConnection::new();
        register(&registry, "bob", bob.clone());
        let (handle, router) = channel(Arc::clone(&registry), 8);

        for i in 0..3 {
            handle
                .submit(envelope("alice", "bob", &format!("{i}")))
                .await
                .unwrap();
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        stop_tx.send_replace(true);

        // handle is still alive: shutdown alone must end the worker
        tokio::time::timeout(
            std::time::Duration::from_secs(2),
            router.run_with_shutdown(stop_rx),
        )
        .await
        .expect("router did not stop");

        assert_eq!(bob.delivered().len(), 3);
        assert!(matches!(
            handle.submit(envelope("alice", "bob", "late")).await,
            Err(RelayError::RouterClosed)
        ));
    }
}
