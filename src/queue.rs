//! Ordered, at-least-once delivery channel between the capture side and
//! the privileged context holding network credentials. At most one
//! delivery attempt is in flight; a failed head event goes back to the
//! front of the queue and is retried after a fixed interval.
//!
//! Nothing here is persistent: events still queued when the owning
//! context is torn down are lost, which is an accepted gap.

use std::{collections::VecDeque, time::Duration};

use tokio::sync::mpsc;

pub trait Sink<T> {
    fn deliver(
        &mut self,
        item: &T,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}

pub struct DeliveryQueue<T, S> {
    pending: VecDeque<T>,
    sink: S,
    send_interval: Duration,
    /// Consecutive failures of one event before it is dead-lettered.
    /// 0 retries forever.
    max_attempts: u32,
    attempts: u32,
    dead: Vec<T>,
}

impl<T, S> DeliveryQueue<T, S>
where
    T: std::fmt::Debug,
    S: Sink<T>,
{
    pub fn new(sink: S, send_interval: Duration, max_attempts: u32) -> Self {
        Self {
            pending: VecDeque::new(),
            sink,
            send_interval,
            max_attempts,
            attempts: 0,
            dead: Vec::new(),
        }
    }

    pub fn push(&mut self, item: T) {
        self.pending.push_back(item);
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn dead_letters(&self) -> &[T] {
        &self.dead
    }

    #[must_use]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Deliver everything currently pending, in order.
    pub async fn drain(&mut self) {
        while let Some(item) = self.pending.pop_front() {
            match self.sink.deliver(&item).await {
                Ok(()) => {
                    self.attempts = 0;
                }
                Err(error) => {
                    self.attempts += 1;
                    if self.max_attempts > 0
                        && self.attempts >= self.max_attempts
                    {
                        tracing::warn!(
                            ?item,
                            %error,
                            attempts = self.attempts,
                            "Dead-lettering undeliverable event."
                        );
                        self.dead.push(item);
                        self.attempts = 0;
                    } else {
                        tracing::debug!(
                            %error,
                            attempt = self.attempts,
                            "Delivery failed. Requeueing at head."
                        );
                        self.pending.push_front(item);
                    }
                }
            }
            tokio::time::sleep(self.send_interval).await;
        }
    }

    /// Event-loop form: enqueue everything arriving on `rx`, draining
    /// between arrivals. Returns when the channel closes and the queue
    /// is empty (or fully dead-lettered).
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<T>) -> Self {
        while let Some(item) = rx.recv().await {
            self.push(item);
            while let Ok(more) = rx.try_recv() {
                self.push(more);
            }
            self.drain().await;
        }
        self
    }
}
