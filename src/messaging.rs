// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Bootstrap
//!
//! Turns a [`MessagingConfigs`] document into running consumers and ready
//! producers. Every consumer and producer is a unit of its own: a unit whose
//! configuration, handler or topology is broken is recorded as a
//! [`UnitFailure`] and the remaining units carry on. A connection that cannot
//! be opened only fails the units configured on it.

use crate::{
    channel::AmqpTransport,
    configs::{ConsumerConfig, MessagingConfigs, ProducerConfig},
    consumer::{ConsumerRuntime, ConsumerState, Subscriber},
    converter::{MessageConverter, SimpleMessageConverter},
    errors::AmqpError,
    publisher::{ProducerRuntime, Sender},
    registry::HandlerRegistry,
    topology::{Declarer, Naming, TopologyProvisioner},
};
use futures_util::future::join_all;
use std::{collections::HashMap, sync::Arc};
use tracing::{error, info, warn};

/// The three broker seams of one connection.
#[derive(Clone)]
pub struct BrokerLink {
    declarer: Arc<dyn Declarer>,
    subscriber: Arc<dyn Subscriber>,
    sender: Arc<dyn Sender>,
}

impl BrokerLink {
    pub fn new<T>(transport: Arc<T>) -> BrokerLink
    where
        T: Declarer + Subscriber + Sender + 'static,
    {
        BrokerLink {
            declarer: transport.clone(),
            subscriber: transport.clone(),
            sender: transport,
        }
    }
}

/// A unit that could not be built or started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFailure {
    pub unit: String,
    pub error: AmqpError,
}

/// Collects configuration, handlers and transports, then builds [`Messaging`].
pub struct MessagingBuilder {
    configs: MessagingConfigs,
    registry: HandlerRegistry,
    converter: Arc<dyn MessageConverter>,
    links: HashMap<String, BrokerLink>,
    unreachable: HashMap<String, AmqpError>,
    transports: Vec<Arc<AmqpTransport>>,
}

impl MessagingBuilder {
    pub fn new(configs: MessagingConfigs, registry: HandlerRegistry) -> MessagingBuilder {
        MessagingBuilder {
            configs,
            registry,
            converter: Arc::new(SimpleMessageConverter),
            links: HashMap::new(),
            unreachable: HashMap::new(),
            transports: vec![],
        }
    }

    pub fn converter(mut self, converter: Arc<dyn MessageConverter>) -> Self {
        self.converter = converter;
        self
    }

    /// Uses `link` for every unit naming connection `id`.
    pub fn transport(mut self, id: &str, link: BrokerLink) -> Self {
        self.links.insert(id.to_owned(), link);
        self
    }

    /// Opens a lapin connection for every configured connection that has no
    /// transport yet.
    ///
    /// A connection that fails to open is remembered; [`MessagingBuilder::build`]
    /// records its error against each unit configured on it.
    pub async fn connect(mut self) -> Self {
        for cfg in &self.configs.connections {
            if self.links.contains_key(&cfg.id) {
                continue;
            }

            match AmqpTransport::connect(cfg).await {
                Ok(transport) => {
                    info!(connection = %cfg.id, host = %cfg.host, "connection established");
                    self.links
                        .insert(cfg.id.clone(), BrokerLink::new(transport.clone()));
                    self.transports.push(transport);
                }
                Err(err) => {
                    error!(
                        connection = %cfg.id,
                        host = %cfg.host,
                        error = err.to_string(),
                        "connection unavailable, its units will fail"
                    );
                    self.unreachable.insert(cfg.id.clone(), err);
                }
            }
        }
        self
    }

    /// Builds every producer (provisioning its exchange) and every consumer.
    pub async fn build(self) -> Messaging {
        let naming = Naming::new(&self.configs.namespace);
        let mut messaging = Messaging {
            consumers: vec![],
            producers: HashMap::new(),
            failures: vec![],
            transports: self.transports.clone(),
        };

        for cfg in &self.configs.producers {
            match self.build_producer(cfg, &naming).await {
                Ok(producer) => {
                    messaging
                        .producers
                        .insert(cfg.name.clone(), Arc::new(producer));
                }
                Err(err) => messaging.record(&cfg.name, err),
            }
        }

        for cfg in &self.configs.consumers {
            match self.build_consumer(cfg, &naming) {
                Ok(consumer) => messaging.consumers.push(consumer),
                Err(err) => messaging.record(cfg.identity(), err),
            }
        }

        info!(
            consumers = messaging.consumers.len(),
            producers = messaging.producers.len(),
            failures = messaging.failures.len(),
            "messaging built"
        );
        messaging
    }

    fn link(&self, connection: &str) -> Result<&BrokerLink, AmqpError> {
        if let Some(link) = self.links.get(connection) {
            return Ok(link);
        }
        Err(self
            .unreachable
            .get(connection)
            .cloned()
            .unwrap_or_else(|| AmqpError::UnknownConnection(connection.to_owned())))
    }

    async fn build_producer(
        &self,
        cfg: &ProducerConfig,
        naming: &Naming,
    ) -> Result<ProducerRuntime, AmqpError> {
        let link = self.link(&cfg.connection)?;
        let producer = ProducerRuntime::new(
            cfg.clone(),
            naming.clone(),
            link.sender.clone(),
            self.converter.clone(),
        )?;

        TopologyProvisioner::new(link.declarer.clone(), naming.clone())
            .provision_producer(cfg)
            .await?;
        Ok(producer)
    }

    fn build_consumer(
        &self,
        cfg: &ConsumerConfig,
        naming: &Naming,
    ) -> Result<ConsumerRuntime, AmqpError> {
        let link = self.link(&cfg.connection)?;
        ConsumerRuntime::new(
            cfg.clone(),
            &self.registry,
            self.converter.clone(),
            TopologyProvisioner::new(link.declarer.clone(), naming.clone()),
            link.subscriber.clone(),
        )
    }
}

/// Owns all runtimes built from one configuration document.
pub struct Messaging {
    consumers: Vec<ConsumerRuntime>,
    producers: HashMap<String, Arc<ProducerRuntime>>,
    failures: Vec<UnitFailure>,
    transports: Vec<Arc<AmqpTransport>>,
}

impl Messaging {
    fn record(&mut self, unit: &str, error: AmqpError) {
        error!(unit, error = error.to_string(), "messaging unit failed");
        self.failures.push(UnitFailure {
            unit: unit.to_owned(),
            error,
        });
    }

    /// Starts every consumer that is not running. Returns how many are
    /// running afterwards; the others are recorded in [`Messaging::failures`].
    pub async fn start(&mut self) -> usize {
        let mut failed = vec![];
        for consumer in &mut self.consumers {
            if consumer.state() == ConsumerState::Running {
                continue;
            }
            if let Err(err) = consumer.start().await {
                failed.push((consumer.name().to_owned(), err));
            }
        }

        for (unit, err) in failed {
            self.record(&unit, err);
        }

        let running = self
            .consumers
            .iter()
            .filter(|c| c.state() == ConsumerState::Running)
            .count();
        if running < self.consumers.len() {
            warn!(running, total = self.consumers.len(), "some consumers are not running");
        } else {
            info!(running, "all consumers running");
        }
        running
    }

    /// Stops every consumer, then closes the connections this instance opened.
    pub async fn stop(&mut self) {
        join_all(self.consumers.iter_mut().map(|c| c.stop())).await;

        for transport in self.transports.drain(..) {
            if let Err(err) = transport.close().await {
                warn!(connection = transport.id(), error = err.to_string(), "failure to close connection");
            }
        }
        info!("messaging stopped");
    }

    pub fn producer(&self, name: &str) -> Option<Arc<ProducerRuntime>> {
        self.producers.get(name).cloned()
    }

    pub fn consumer(&self, name: &str) -> Option<&ConsumerRuntime> {
        self.consumers.iter().find(|c| c.name() == name)
    }

    pub fn consumers(&self) -> &[ConsumerRuntime] {
        &self.consumers
    }

    pub fn failures(&self) -> &[UnitFailure] {
        &self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        configs::ConnectionConfig,
        consumer::Subscription,
        converter::Payload,
        exchange::ExchangeDefinition,
        handler::HandlerError,
        publisher::OutboundMessage,
        queue::{QueueBinding, QueueDefinition},
    };
    use async_trait::async_trait;
    use futures_util::{FutureExt, StreamExt};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBroker {
        queues: Mutex<Vec<String>>,
        exchanges: Mutex<Vec<String>>,
        published: Mutex<Vec<(String, String)>>,
        refuse_subscriptions: bool,
    }

    #[async_trait]
    impl Declarer for FakeBroker {
        async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
            self.exchanges.lock().unwrap().push(def.name().to_owned());
            Ok(())
        }

        async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
            self.queues.lock().unwrap().push(def.name().to_owned());
            Ok(())
        }

        async fn bind_queue(&self, _binding: &QueueBinding) -> Result<(), AmqpError> {
            Ok(())
        }
    }

    #[async_trait]
    impl Subscriber for FakeBroker {
        async fn subscribe(&self, queue: &str, _: &str, _: u16) -> Result<Subscription, AmqpError> {
            if self.refuse_subscriptions {
                return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
            }
            Ok(Subscription::new(
                futures_util::stream::pending().boxed(),
                async {}.boxed(),
            ))
        }
    }

    #[async_trait]
    impl Sender for FakeBroker {
        async fn send(&self, msg: &OutboundMessage, _confirm: bool) -> Result<(), AmqpError> {
            self.published
                .lock()
                .unwrap()
                .push((msg.exchange.clone(), msg.routing_key.clone()));
            Ok(())
        }
    }

    fn configs() -> MessagingConfigs {
        MessagingConfigs::from_json_str(
            r#"{
                "namespace": "shop",
                "consumers": [
                    {
                        "name": "orders",
                        "queue": "orders.work",
                        "topic": "orders.created",
                        "handler": "orders",
                        "mode": "retry",
                        "retry_interval": 5,
                        "concurrency": 2
                    },
                    {
                        "name": "ghost",
                        "queue": "ghost.work",
                        "topic": "ghost.created",
                        "handler": "unregistered"
                    }
                ],
                "producers": [
                    { "name": "orders-out", "topic": "orders.created", "exchange": "orders" },
                    { "name": "elsewhere", "connection": "secondary", "topic": "x" }
                ]
            }"#,
        )
        .unwrap()
    }

    fn registry() -> HandlerRegistry {
        HandlerRegistry::new().register_fn("orders", |_msg| async { Ok::<(), HandlerError>(()) })
    }

    #[tokio::test]
    async fn broken_units_are_recorded_and_others_built() {
        let broker = Arc::new(FakeBroker::default());
        let mut messaging = MessagingBuilder::new(configs(), registry())
            .transport("default", BrokerLink::new(broker.clone()))
            .build()
            .await;

        let failed: Vec<_> = messaging.failures().iter().map(|f| f.unit.as_str()).collect();
        assert_eq!(failed, vec!["elsewhere", "ghost"]);
        assert_eq!(
            messaging.failures()[0].error,
            AmqpError::UnknownConnection("secondary".to_owned())
        );
        assert_eq!(broker.exchanges.lock().unwrap().clone(), vec!["orders".to_owned()]);

        assert_eq!(messaging.start().await, 1);
        assert_eq!(messaging.consumer("orders").unwrap().worker_count(), 2);
        assert!(broker
            .queues
            .lock()
            .unwrap()
            .contains(&"orders.work.retry".to_owned()));

        let producer = messaging.producer("orders-out").unwrap();
        producer
            .publish_sync(Payload::Text("hi".to_owned()))
            .await
            .unwrap();
        producer
            .publish_delayed(Payload::Text("later".to_owned()), 10)
            .await
            .unwrap();
        assert_eq!(
            broker.published.lock().unwrap().clone(),
            vec![
                ("orders".to_owned(), "orders.created".to_owned()),
                ("amq.topic".to_owned(), "shop_delay.10m.orders.created".to_owned()),
            ]
        );
        assert!(messaging.producer("elsewhere").is_none());

        messaging.stop().await;
        assert_eq!(
            messaging.consumer("orders").unwrap().state(),
            ConsumerState::Stopped
        );
    }

    #[tokio::test]
    async fn unreachable_connection_only_fails_its_own_units() {
        let mut cfg = configs();
        cfg.connections.push(ConnectionConfig {
            id: "secondary".to_owned(),
            host: "127.0.0.1".to_owned(),
            port: 1,
            ..ConnectionConfig::default()
        });

        let broker = Arc::new(FakeBroker::default());
        let mut messaging = MessagingBuilder::new(cfg, registry())
            .transport("default", BrokerLink::new(broker))
            .connect()
            .await
            .build()
            .await;

        let elsewhere = messaging
            .failures()
            .iter()
            .find(|f| f.unit == "elsewhere")
            .unwrap();
        assert!(matches!(elsewhere.error, AmqpError::ConnectionError(_)));
        assert!(elsewhere.error.is_transport());

        assert!(messaging.producer("orders-out").is_some());
        assert!(messaging.producer("elsewhere").is_none());
        assert_eq!(messaging.start().await, 1);
        assert_eq!(
            messaging.consumer("orders").unwrap().state(),
            ConsumerState::Running
        );

        messaging.stop().await;
    }

    #[tokio::test]
    async fn start_failures_do_not_stop_other_consumers() {
        let mut cfg = configs();
        cfg.consumers[1].handler = "orders".to_owned();
        cfg.consumers[1].connection = "flaky".to_owned();

        let broker = Arc::new(FakeBroker::default());
        let flaky = Arc::new(FakeBroker {
            refuse_subscriptions: true,
            ..FakeBroker::default()
        });
        let mut messaging = MessagingBuilder::new(cfg, registry())
            .transport("default", BrokerLink::new(broker))
            .transport("flaky", BrokerLink::new(flaky))
            .build()
            .await;

        assert_eq!(messaging.start().await, 1);
        let last = messaging.failures().last().unwrap();
        assert_eq!(last.unit, "ghost");
        assert!(last.error.is_transport());
        assert_eq!(
            messaging.consumer("ghost").unwrap().state(),
            ConsumerState::Failed
        );

        messaging.stop().await;
    }
}
