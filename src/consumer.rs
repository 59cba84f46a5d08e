// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Runtime
//!
//! Owns the delivery pipeline of one consumer: provisions its topology, then
//! runs exactly `concurrency` workers, each on its own subscription. A worker
//! loops over
//!
//! 1. acquire a permit from the shared [`RateGate`]
//! 2. receive the next delivery
//! 3. dispatch it through the [`DeliveryDispatcher`]
//! 4. ack it, or reject it without requeue for a retryable failure
//!
//! When the broker closes a worker's subscription, the worker re-subscribes
//! with a doubling pause until it succeeds or the consumer is stopped.
//!
//! Stopping is cooperative: the stop signal is only observed between
//! deliveries, so a handler is never abandoned half way and no delivery is
//! settled twice.

use crate::{
    configs::ConsumerConfig,
    converter::MessageConverter,
    dispatcher::{DeliveryDispatcher, DispatchOutcome, InboundDelivery},
    errors::AmqpError,
    rate::RateGate,
    registry::HandlerRegistry,
    topology::TopologyProvisioner,
};
use async_trait::async_trait;
use futures_util::{
    future::{join_all, BoxFuture},
    stream::BoxStream,
    StreamExt,
};
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// First pause before a worker re-subscribes after losing its subscription.
const RESUBSCRIBE_BACKOFF_MIN: Duration = Duration::from_millis(100);
/// Upper bound of the doubling re-subscribe pause.
const RESUBSCRIBE_BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Settles one delivery on the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    /// Negative acknowledgement without requeue.
    async fn reject(&self) -> Result<(), AmqpError>;
}

/// A delivery together with the handle that settles it.
pub struct InboundMessage {
    pub delivery: InboundDelivery,
    pub acker: Box<dyn Acknowledger>,
}

/// Deliveries of one subscription and the means to end it.
pub struct Subscription {
    deliveries: BoxStream<'static, Result<InboundMessage, AmqpError>>,
    closer: BoxFuture<'static, ()>,
}

impl Subscription {
    /// # Parameters
    /// * `deliveries` - Stream of deliveries; its end means the broker closed
    ///   the subscription
    /// * `closer` - Future that cancels the subscription and releases its channel
    pub fn new(
        deliveries: BoxStream<'static, Result<InboundMessage, AmqpError>>,
        closer: BoxFuture<'static, ()>,
    ) -> Subscription {
        Subscription { deliveries, closer }
    }

    /// Ends the subscription. Deliveries received but not settled go back to
    /// the queue.
    pub async fn close(self) {
        self.closer.await
    }
}

/// Opens subscriptions on a queue.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Opens one subscription on `queue` holding at most `prefetch`
    /// unacknowledged deliveries.
    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<Subscription, AmqpError>;
}

/// Lifecycle of a [`ConsumerRuntime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Stopped,
    Provisioning,
    Running,
    Stopping,
    /// Provisioning or subscribing failed; the consumer may be started again.
    Failed,
}

/// One consumer: its topology, its handler and `concurrency` workers.
pub struct ConsumerRuntime {
    cfg: Arc<ConsumerConfig>,
    provisioner: TopologyProvisioner,
    subscriber: Arc<dyn Subscriber>,
    dispatcher: Arc<DeliveryDispatcher>,
    gate: Arc<RateGate>,
    state: ConsumerState,
    stop: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl ConsumerRuntime {
    /// Builds a stopped consumer.
    ///
    /// # Parameters
    /// * `cfg` - Consumer configuration, validated here
    /// * `registry` - Registry the configured handler is resolved from
    /// * `converter` - Payload codec used by the dispatcher
    /// * `provisioner` - Declares the topology on `start`
    /// * `subscriber` - Opens the worker subscriptions
    ///
    /// # Returns
    /// The consumer, or a configuration error when `cfg` is invalid or its
    /// handler is not registered
    pub fn new(
        cfg: ConsumerConfig,
        registry: &HandlerRegistry,
        converter: Arc<dyn MessageConverter>,
        provisioner: TopologyProvisioner,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<ConsumerRuntime, AmqpError> {
        cfg.validate()?;

        let cfg = Arc::new(cfg);
        let dispatcher = DeliveryDispatcher::new(cfg.clone(), registry, converter)?;

        Ok(ConsumerRuntime {
            gate: Arc::new(RateGate::from_config(&cfg)),
            cfg,
            provisioner,
            subscriber,
            dispatcher: Arc::new(dispatcher),
            state: ConsumerState::Stopped,
            stop: CancellationToken::new(),
            workers: vec![],
        })
    }

    /// Consumer identity used in logs and consumer tags.
    pub fn name(&self) -> &str {
        self.cfg.identity()
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.cfg
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Workers currently alive. A worker that lost its subscription stays
    /// alive while it re-subscribes.
    pub fn worker_count(&self) -> usize {
        self.workers.iter().filter(|w| !w.is_finished()).count()
    }

    /// Provisions the topology, opens one subscription per worker and spawns
    /// the workers.
    ///
    /// # Returns
    /// Ok(()) once all workers run; [`AmqpError::AlreadyRunning`] when started
    /// twice; the provisioning or subscription error otherwise, leaving the
    /// consumer [`ConsumerState::Failed`]
    pub async fn start(&mut self) -> Result<(), AmqpError> {
        if matches!(self.state, ConsumerState::Running | ConsumerState::Provisioning) {
            return Err(AmqpError::AlreadyRunning(self.name().to_owned()));
        }

        self.state = ConsumerState::Provisioning;
        if let Err(err) = self.provisioner.provision_consumer(&self.cfg).await {
            self.state = ConsumerState::Failed;
            return Err(err);
        }

        let mut subscriptions = Vec::with_capacity(usize::from(self.cfg.concurrency));
        for index in 0..self.cfg.concurrency {
            let tag = format!("{}-{}", self.name(), index);
            match self
                .subscriber
                .subscribe(&self.cfg.queue, &tag, self.cfg.prefetch)
                .await
            {
                Ok(subscription) => subscriptions.push((tag, subscription)),
                Err(err) => {
                    error!(consumer = self.name(), error = err.to_string(), "failure to subscribe");
                    join_all(subscriptions.into_iter().map(|(_, s)| s.close())).await;
                    self.state = ConsumerState::Failed;
                    return Err(err);
                }
            }
        }

        self.stop = CancellationToken::new();
        self.workers = subscriptions
            .into_iter()
            .map(|(tag, subscription)| {
                let worker = Worker {
                    tag,
                    queue: self.cfg.queue.clone(),
                    prefetch: self.cfg.prefetch,
                    subscriber: self.subscriber.clone(),
                    dispatcher: self.dispatcher.clone(),
                    gate: self.gate.clone(),
                    stop: self.stop.clone(),
                };
                tokio::spawn(worker.run(subscription))
            })
            .collect();

        self.state = ConsumerState::Running;
        info!(
            consumer = self.name(),
            queue = %self.cfg.queue,
            workers = self.workers.len(),
            "consumer started"
        );
        Ok(())
    }

    /// Signals every worker to stop after its current delivery and waits for
    /// all of them.
    pub async fn stop(&mut self) {
        if self.state != ConsumerState::Running {
            return;
        }

        self.state = ConsumerState::Stopping;
        self.stop.cancel();

        for result in join_all(self.workers.drain(..)).await {
            if let Err(err) = result {
                error!(consumer = self.name(), error = err.to_string(), "worker ended abnormally");
            }
        }

        self.state = ConsumerState::Stopped;
        info!(consumer = self.name(), "consumer stopped");
    }
}

/// Why a worker stopped reading its subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Stopped,
    StreamEnded,
}

struct Worker {
    tag: String,
    queue: String,
    prefetch: u16,
    subscriber: Arc<dyn Subscriber>,
    dispatcher: Arc<DeliveryDispatcher>,
    gate: Arc<RateGate>,
    stop: CancellationToken,
}

impl Worker {
    async fn run(self, first: Subscription) {
        debug!(worker = self.tag, "worker started");

        let mut subscription = first;
        loop {
            let exit = self.consume(&mut subscription).await;
            subscription.close().await;

            if exit == Exit::Stopped {
                break;
            }
            match self.resubscribe().await {
                Some(next) => subscription = next,
                None => break,
            }
        }

        debug!(worker = self.tag, "worker stopped");
    }

    async fn consume(&self, subscription: &mut Subscription) -> Exit {
        loop {
            if self.gate.acquire(&self.stop).await.is_err() {
                return Exit::Stopped;
            }

            let next = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Exit::Stopped,
                next = subscription.deliveries.next() => next,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(err)) => {
                    error!(worker = self.tag, error = err.to_string(), "errors consume msg");
                    continue;
                }
                None => {
                    warn!(worker = self.tag, queue = %self.queue, "subscription closed by the broker");
                    return Exit::StreamEnded;
                }
            };

            let outcome = self.dispatcher.dispatch(&message.delivery).await;
            settle(&self.tag, &message, &outcome).await;
        }
    }

    /// Re-subscribes with a doubling pause until it succeeds or the worker is
    /// stopped.
    async fn resubscribe(&self) -> Option<Subscription> {
        let mut backoff = RESUBSCRIBE_BACKOFF_MIN;

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return None,
                _ = sleep(backoff) => {}
            }

            match self
                .subscriber
                .subscribe(&self.queue, &self.tag, self.prefetch)
                .await
            {
                Ok(subscription) => {
                    info!(worker = self.tag, queue = %self.queue, "worker re-subscribed");
                    return Some(subscription);
                }
                Err(err) => {
                    warn!(
                        worker = self.tag,
                        error = err.to_string(),
                        retry_in_ms = backoff.as_millis() as u64,
                        "failure to re-subscribe"
                    );
                    backoff = (backoff * 2).min(RESUBSCRIBE_BACKOFF_MAX);
                }
            }
        }
    }
}

async fn settle(tag: &str, message: &InboundMessage, outcome: &DispatchOutcome) {
    let settled = if outcome.acknowledges() {
        message.acker.ack().await
    } else {
        message.acker.reject().await
    };

    if let Err(err) = settled {
        error!(
            worker = tag,
            delivery_tag = message.delivery.delivery_tag,
            error = err.to_string(),
            "failure to settle message"
        );
    }
}
