// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! A [`TopologyPlan`] is derived from a consumer or producer configuration by a
//! pure function and then declared through a [`Declarer`]. Derivation never
//! depends on broker state, so provisioning the same configuration twice sends
//! the broker the same declarations, which it treats as no-ops.
//!
//! Three consumer shapes exist:
//!
//! - normal: a durable work queue bound to the topic exchange
//! - retry: the work queue dead-letters into the shared retry exchange; a TTL
//!   retry queue bound there dead-letters back into the topic exchange
//! - delay: a TTL delay queue bound to the topic exchange under a synthesized
//!   delay topic dead-letters into the shared delay exchange, where the work
//!   queue listens under the same delay topic

use crate::{
    configs::{ConsumerConfig, DeliveryMode, ProducerConfig, DEFAULT_NAMESPACE},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel, ExchangeKind,
};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Broker-predeclared topic exchange every work queue is reachable from.
pub const TOPIC_EXCHANGE: &str = "amq.topic";

/// Names of the shared exchanges and synthesized topics, scoped by a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Naming {
    namespace: String,
}

impl Default for Naming {
    fn default() -> Self {
        Naming::new(DEFAULT_NAMESPACE)
    }
}

impl Naming {
    /// Creates the naming scheme for `namespace`.
    ///
    /// # Parameters
    /// * `namespace` - Prefix of the shared exchanges and delay topics
    pub fn new(namespace: &str) -> Naming {
        Naming {
            namespace: namespace.to_owned(),
        }
    }

    /// `<namespace>.retry`, the exchange work queues dead-letter into.
    pub fn retry_exchange(&self) -> String {
        format!("{}.retry", self.namespace)
    }

    /// `<namespace>.expire`, the exchange expired delay messages reach.
    pub fn delay_exchange(&self) -> String {
        format!("{}.expire", self.namespace)
    }

    /// Routing key of a message delayed by `minutes` on `topic`.
    ///
    /// # Returns
    /// `<namespace>_delay.<minutes>m.<topic>`
    pub fn delay_topic(&self, minutes: u32, topic: &str) -> String {
        format!("{}_delay.{}m.{}", self.namespace, minutes, topic)
    }
}

/// Seam between topology derivation and the broker.
///
/// Declarations must be idempotent: identical arguments are a no-op, conflicting
/// ones fail with a provisioning error.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Declarer: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;
}

/// The exchanges, queues and bindings implied by one configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopologyPlan {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) bindings: Vec<QueueBinding>,
}

impl TopologyPlan {
    /// Derives the topology a consumer needs. The configuration is validated
    /// first; nothing is derived from an invalid one.
    pub fn for_consumer(cfg: &ConsumerConfig, naming: &Naming) -> Result<TopologyPlan, AmqpError> {
        cfg.validate()?;

        let plan = match cfg.mode {
            DeliveryMode::Normal => {
                let exchange = cfg
                    .federation_exchange
                    .as_deref()
                    .filter(|name| !name.is_empty())
                    .unwrap_or(TOPIC_EXCHANGE);

                TopologyPlan::default()
                    .exchange(ExchangeDefinition::new(exchange).durable())
                    .queue(QueueDefinition::new(&cfg.queue).durable())
                    .binding(
                        QueueBinding::new(&cfg.queue)
                            .exchange(exchange)
                            .routing_key(&cfg.topic),
                    )
            }

            DeliveryMode::Retry => {
                let retry_exchange = naming.retry_exchange();
                let retry_queue = cfg.retry_queue_name();

                TopologyPlan::default()
                    .exchange(ExchangeDefinition::new(TOPIC_EXCHANGE).durable())
                    .exchange(ExchangeDefinition::new(&retry_exchange).durable())
                    .queue(
                        QueueDefinition::new(&cfg.queue)
                            .durable()
                            .dead_letter_exchange(&retry_exchange),
                    )
                    .queue(
                        QueueDefinition::new(&retry_queue)
                            .durable()
                            .ttl(cfg.retry_ttl_ms()?)
                            .dead_letter_exchange(TOPIC_EXCHANGE),
                    )
                    .binding(
                        QueueBinding::new(&cfg.queue)
                            .exchange(TOPIC_EXCHANGE)
                            .routing_key(&cfg.topic),
                    )
                    .binding(
                        QueueBinding::new(&retry_queue)
                            .exchange(&retry_exchange)
                            .routing_key(&cfg.topic),
                    )
            }

            DeliveryMode::Delay => {
                let delay_exchange = naming.delay_exchange();
                let delay_queue = cfg.delay_queue_name();
                let delay_topic = naming.delay_topic(cfg.delay_interval, &cfg.topic);

                TopologyPlan::default()
                    .exchange(ExchangeDefinition::new(TOPIC_EXCHANGE).durable())
                    .exchange(ExchangeDefinition::new(&delay_exchange).durable())
                    .queue(QueueDefinition::new(&cfg.queue).durable())
                    .queue(
                        QueueDefinition::new(&delay_queue)
                            .durable()
                            .ttl(cfg.delay_ttl_ms()?)
                            .dead_letter_exchange(&delay_exchange),
                    )
                    .binding(
                        QueueBinding::new(&cfg.queue)
                            .exchange(&delay_exchange)
                            .routing_key(&delay_topic),
                    )
                    .binding(
                        QueueBinding::new(&delay_queue)
                            .exchange(TOPIC_EXCHANGE)
                            .routing_key(&delay_topic),
                    )
            }
        };

        Ok(plan)
    }

    /// Derives the topology a producer publishes against: its target exchange.
    pub fn for_producer(cfg: &ProducerConfig) -> Result<TopologyPlan, AmqpError> {
        cfg.validate()?;
        Ok(TopologyPlan::default().exchange(ExchangeDefinition::new(&cfg.exchange).durable()))
    }

    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn binding(mut self, binding: QueueBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Exchanges in declaration order, predeclared ones included.
    pub fn exchanges(&self) -> &[ExchangeDefinition] {
        &self.exchanges
    }

    /// Queues in declaration order, the work queue first.
    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    /// Bindings in declaration order.
    pub fn bindings(&self) -> &[QueueBinding] {
        &self.bindings
    }

    /// Declares exchanges, then queues, then bindings. The first refusal stops
    /// the installation and is returned as is.
    pub async fn install(&self, declarer: &dyn Declarer) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            if exch.is_predeclared() {
                debug!("exchange: {} is predeclared by the broker", exch.name);
                continue;
            }
            declarer.declare_exchange(exch).await?;
        }

        for queue in &self.queues {
            declarer.declare_queue(queue).await?;
        }

        for binding in &self.bindings {
            declarer.bind_queue(binding).await?;
        }

        Ok(())
    }
}

/// Derives and installs topologies for consumers and producers.
#[derive(Clone)]
pub struct TopologyProvisioner {
    declarer: Arc<dyn Declarer>,
    naming: Naming,
}

impl TopologyProvisioner {
    /// Creates a provisioner.
    ///
    /// # Parameters
    /// * `declarer` - Broker seam the declarations are sent through
    /// * `naming` - Naming scheme of the shared exchanges
    pub fn new(declarer: Arc<dyn Declarer>, naming: Naming) -> TopologyProvisioner {
        TopologyProvisioner { declarer, naming }
    }

    pub fn naming(&self) -> &Naming {
        &self.naming
    }

    /// Derives the consumer's topology and declares it.
    ///
    /// # Parameters
    /// * `cfg` - Consumer configuration, validated before anything is declared
    ///
    /// # Returns
    /// The installed plan, a configuration error for an invalid `cfg`, or the
    /// first declaration the broker refused
    pub async fn provision_consumer(&self, cfg: &ConsumerConfig) -> Result<TopologyPlan, AmqpError> {
        let plan = TopologyPlan::for_consumer(cfg, &self.naming)?;
        plan.install(self.declarer.as_ref()).await.inspect_err(|err| {
            error!(consumer = cfg.identity(), error = err.to_string(), "failure to provision consumer");
        })?;

        info!(
            consumer = cfg.identity(),
            queue = %cfg.queue,
            mode = ?cfg.mode,
            "consumer topology provisioned"
        );
        Ok(plan)
    }

    /// Declares the producer's target exchange unless the broker predeclares it.
    ///
    /// # Returns
    /// The installed plan, or the error that aborted it
    pub async fn provision_producer(&self, cfg: &ProducerConfig) -> Result<TopologyPlan, AmqpError> {
        let plan = TopologyPlan::for_producer(cfg)?;
        plan.install(self.declarer.as_ref()).await.inspect_err(|err| {
            error!(producer = %cfg.name, error = err.to_string(), "failure to provision producer");
        })?;

        info!(producer = %cfg.name, exchange = %cfg.exchange, "producer topology provisioned");
        Ok(plan)
    }
}

#[async_trait]
impl Declarer for Channel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .exchange_declare(
                &def.name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone(), err.to_string()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                def.arguments(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = %def.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone(), err.to_string()))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_MESSAGE_TTL};
    use lapin::types::{AMQPValue, LongString};
    use std::sync::Mutex;

    /// Records every declaration it receives, in order.
    #[derive(Default)]
    struct RecordingDeclarer {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Declarer for RecordingDeclarer {
        async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
            self.calls.lock().unwrap().push(format!("exchange {}", def.name));
            Ok(())
        }

        async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("queue {} {:?}", def.name, def.arguments()));
            Ok(())
        }

        async fn bind_queue(&self, b: &QueueBinding) -> Result<(), AmqpError> {
            self.calls.lock().unwrap().push(format!(
                "bind {} {} {}",
                b.queue_name, b.exchange_name, b.routing_key
            ));
            Ok(())
        }
    }

    fn orders_retry() -> ConsumerConfig {
        ConsumerConfig::new("orders", "orders.work", "orders.created", "orders")
            .with_retry("orders.retry", 5)
            .with_concurrency(2)
    }

    fn ttl_of(def: &QueueDefinition) -> Option<AMQPValue> {
        def.arguments().inner().get(AMQP_HEADERS_MESSAGE_TTL).cloned()
    }

    fn dlx_of(def: &QueueDefinition) -> Option<AMQPValue> {
        def.arguments().inner().get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE).cloned()
    }

    #[test]
    fn normal_mode_binds_work_queue_to_topic_exchange() {
        let cfg = ConsumerConfig::new("audit", "audit.work", "audit.#", "audit");
        let plan = TopologyPlan::for_consumer(&cfg, &Naming::default()).unwrap();

        assert_eq!(plan.queues().len(), 1);
        assert!(plan.queues()[0].durable);
        assert!(dlx_of(&plan.queues()[0]).is_none());
        assert_eq!(
            plan.bindings(),
            &[QueueBinding::new("audit.work").exchange("amq.topic").routing_key("audit.#")]
        );
    }

    #[test]
    fn normal_mode_prefers_federation_exchange() {
        let mut cfg = ConsumerConfig::new("audit", "audit.work", "audit.#", "audit");
        cfg.federation_exchange = Some("fed.events".to_owned());
        let plan = TopologyPlan::for_consumer(&cfg, &Naming::default()).unwrap();

        assert_eq!(plan.exchanges()[0].name(), "fed.events");
        assert_eq!(plan.bindings()[0].exchange_name, "fed.events");
    }

    #[test]
    fn retry_mode_wires_dead_letter_loop() {
        let plan = TopologyPlan::for_consumer(&orders_retry(), &Naming::default()).unwrap();

        let work = &plan.queues()[0];
        let retry = &plan.queues()[1];
        assert_eq!(work.name(), "orders.work");
        assert_eq!(
            dlx_of(work),
            Some(AMQPValue::LongString(LongString::from("relay.retry")))
        );
        assert_eq!(retry.name(), "orders.retry");
        assert_eq!(ttl_of(retry), Some(AMQPValue::LongInt(5 * 60 * 1000)));
        assert_eq!(
            dlx_of(retry),
            Some(AMQPValue::LongString(LongString::from("amq.topic")))
        );
        assert_eq!(
            plan.bindings(),
            &[
                QueueBinding::new("orders.work")
                    .exchange("amq.topic")
                    .routing_key("orders.created"),
                QueueBinding::new("orders.retry")
                    .exchange("relay.retry")
                    .routing_key("orders.created"),
            ]
        );
    }

    #[test]
    fn delay_mode_routes_through_delay_topic() {
        let cfg = ConsumerConfig::new("notify", "notify.work", "notify.send", "notify")
            .with_delay("notify.delay", 10);
        let plan = TopologyPlan::for_consumer(&cfg, &Naming::new("shop")).unwrap();

        let delay = &plan.queues()[1];
        assert_eq!(delay.name(), "notify.delay");
        assert_eq!(ttl_of(delay), Some(AMQPValue::LongInt(600_000)));
        assert_eq!(
            dlx_of(delay),
            Some(AMQPValue::LongString(LongString::from("shop.expire")))
        );
        assert_eq!(
            plan.bindings(),
            &[
                QueueBinding::new("notify.work")
                    .exchange("shop.expire")
                    .routing_key("shop_delay.10m.notify.send"),
                QueueBinding::new("notify.delay")
                    .exchange("amq.topic")
                    .routing_key("shop_delay.10m.notify.send"),
            ]
        );
    }

    #[test]
    fn invalid_config_derives_nothing() {
        let cfg = ConsumerConfig::new("orders", "orders.work", "", "orders");
        let err = TopologyPlan::for_consumer(&cfg, &Naming::default()).unwrap_err();
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn provisioning_twice_is_identical() {
        let declarer = Arc::new(RecordingDeclarer::default());
        let provisioner = TopologyProvisioner::new(declarer.clone(), Naming::default());

        let first = provisioner.provision_consumer(&orders_retry()).await.unwrap();
        let after_first = declarer.calls.lock().unwrap().clone();
        let second = provisioner.provision_consumer(&orders_retry()).await.unwrap();
        let after_second = declarer.calls.lock().unwrap().clone();

        assert_eq!(first, second);
        assert_eq!(after_second.len(), after_first.len() * 2);
        assert_eq!(after_second[..after_first.len()], after_second[after_first.len()..]);
        assert!(!after_first.iter().any(|call| call == "exchange amq.topic"));
        assert!(after_first.contains(&"exchange relay.retry".to_owned()));
    }

    #[tokio::test]
    async fn conflicting_declaration_aborts_provisioning() {
        let mut declarer = MockDeclarer::new();
        declarer.expect_declare_exchange().times(1).returning(|_| Ok(()));
        declarer.expect_declare_queue().times(1).returning(|def| {
            Err(AmqpError::DeclareQueueError(
                def.name.clone(),
                "PRECONDITION_FAILED - inequivalent arg 'x-message-ttl'".to_owned(),
            ))
        });
        declarer.expect_bind_queue().never();

        let provisioner = TopologyProvisioner::new(Arc::new(declarer), Naming::default());
        let err = provisioner.provision_consumer(&orders_retry()).await.unwrap_err();

        assert!(err.is_provision());
    }

    #[tokio::test]
    async fn producer_skips_predeclared_exchange() {
        let mut declarer = MockDeclarer::new();
        declarer.expect_declare_exchange().never();
        declarer.expect_declare_queue().never();
        declarer.expect_bind_queue().never();

        let provisioner = TopologyProvisioner::new(Arc::new(declarer), Naming::default());
        let plan = provisioner
            .provision_producer(&ProducerConfig::new("orders-out"))
            .await
            .unwrap();

        assert_eq!(plan.exchanges().len(), 1);
    }

    #[tokio::test]
    async fn producer_declares_custom_exchange() {
        let mut declarer = MockDeclarer::new();
        declarer
            .expect_declare_exchange()
            .withf(|def| def.name() == "billing" && def.durable)
            .times(1)
            .returning(|_| Ok(()));

        let mut cfg = ProducerConfig::new("billing-out");
        cfg.exchange = "billing".to_owned();

        let provisioner = TopologyProvisioner::new(Arc::new(declarer), Naming::default());
        assert!(provisioner.provision_producer(&cfg).await.is_ok());
    }
}
