// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Dispatcher
//!
//! Decodes one delivery, runs the consumer's handler on it and classifies the
//! result. The dispatcher never acknowledges anything itself: it returns a
//! [`DispatchOutcome`] and the worker settles the delivery accordingly.
//!
//! Classification:
//!
//! | situation                                   | outcome            |
//! |---------------------------------------------|--------------------|
//! | no header map                               | `Success` (drop)   |
//! | payload cannot be decoded                   | `FatalFailure`     |
//! | handler succeeded                           | `Success`          |
//! | handler failed, mode is not retry           | `FatalFailure`     |
//! | handler failed, retry budget spent          | `FatalFailure`     |
//! | handler failed, retry budget left           | `RetryableFailure` |

use crate::{
    configs::{ConsumerConfig, DeliveryMode},
    converter::{MessageConverter, SimpleMessageConverter},
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage},
    otel,
    registry::HandlerRegistry,
};
use futures_util::FutureExt;
use lapin::{message::Delivery, types::FieldTable};
use opentelemetry::trace::{Span, Status};
use std::{panic::AssertUnwindSafe, sync::Arc};
use tracing::{debug, error, info, warn};

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";
/// Constant for the queue field in the x-death header
pub const AMQP_HEADERS_QUEUE: &str = "queue";
/// Constant for the reason field in the x-death header
pub const AMQP_HEADERS_REASON: &str = "reason";
/// Reason RabbitMQ records for messages rejected without requeue
pub const AMQP_DEATH_REASON_REJECTED: &str = "rejected";

const LOGGED_PAYLOAD_BYTES: usize = 256;

/// One inbound message, detached from the broker acknowledgement handle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub headers: Option<FieldTable>,
    pub data: Vec<u8>,
}

impl From<&Delivery> for InboundDelivery {
    fn from(delivery: &Delivery) -> InboundDelivery {
        InboundDelivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            correlation_id: delivery.properties.correlation_id().as_ref().map(|id| id.to_string()),
            content_type: delivery.properties.content_type().as_ref().map(|ct| ct.to_string()),
            headers: delivery.properties.headers().clone(),
            data: delivery.data.clone(),
        }
    }
}

impl InboundDelivery {
    /// Number of times this message was rejected from `queue` and dead-lettered,
    /// as recorded by the broker in the `x-death` header.
    pub fn rejections_from(&self, queue: &str) -> i64 {
        let Some(headers) = &self.headers else {
            return 0;
        };

        let Some(deaths) = headers
            .inner()
            .get(AMQP_HEADERS_X_DEATH)
            .and_then(|value| value.as_array())
        else {
            return 0;
        };

        deaths
            .as_slice()
            .iter()
            .filter_map(|death| death.as_field_table())
            .filter(|death| {
                header_str(death, AMQP_HEADERS_QUEUE) == Some(queue)
                    && header_str(death, AMQP_HEADERS_REASON) == Some(AMQP_DEATH_REASON_REJECTED)
            })
            .map(|death| {
                death
                    .inner()
                    .get(AMQP_HEADERS_COUNT)
                    .and_then(|count| count.as_long_long_int())
                    .unwrap_or(1)
            })
            .sum()
    }

    /// Whether the broker attached any dead-letter history.
    pub fn has_death_history(&self) -> bool {
        self.headers
            .as_ref()
            .is_some_and(|headers| headers.inner().contains_key(AMQP_HEADERS_X_DEATH))
    }

    fn payload_preview(&self) -> String {
        let end = self.data.len().min(LOGGED_PAYLOAD_BYTES);
        String::from_utf8_lossy(&self.data[..end]).into_owned()
    }
}

fn header_str<'a>(table: &'a FieldTable, key: &str) -> Option<&'a str> {
    match table.inner().get(key)? {
        lapin::types::AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes()).ok(),
        lapin::types::AMQPValue::ShortString(value) => Some(value.as_str()),
        _ => None,
    }
}

/// Result of dispatching one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Acknowledge.
    Success,
    /// Reject without requeue so dead-lettering routes it to the retry queue.
    RetryableFailure { cause: String },
    /// Acknowledge and drop.
    FatalFailure { cause: String },
}

impl DispatchOutcome {
    /// Whether the delivery is acknowledged (as opposed to rejected).
    pub fn acknowledges(&self) -> bool {
        !matches!(self, DispatchOutcome::RetryableFailure { .. })
    }
}

/// Per-consumer dispatcher, shared by all of the consumer's workers.
pub struct DeliveryDispatcher {
    cfg: Arc<ConsumerConfig>,
    consumer: Arc<str>,
    queue: Arc<str>,
    handler: Arc<dyn ConsumerHandler>,
    converter: Arc<dyn MessageConverter>,
}

impl DeliveryDispatcher {
    /// Builds a dispatcher, resolving the configured handler immediately.
    pub fn new(
        cfg: Arc<ConsumerConfig>,
        registry: &HandlerRegistry,
        converter: Arc<dyn MessageConverter>,
    ) -> Result<DeliveryDispatcher, AmqpError> {
        let handler = registry.resolve(&cfg.handler).inspect_err(|_| {
            error!(
                consumer = cfg.identity(),
                handler = cfg.handler,
                "failed to find handler for consumer"
            );
        })?;

        Ok(DeliveryDispatcher {
            consumer: Arc::from(cfg.identity()),
            queue: Arc::from(cfg.queue.as_str()),
            cfg,
            handler,
            converter,
        })
    }

    pub fn with_simple_converter(
        cfg: Arc<ConsumerConfig>,
        registry: &HandlerRegistry,
    ) -> Result<DeliveryDispatcher, AmqpError> {
        DeliveryDispatcher::new(cfg, registry, Arc::new(SimpleMessageConverter))
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.cfg
    }

    pub async fn dispatch(&self, delivery: &InboundDelivery) -> DispatchOutcome {
        let correlation_id = delivery.correlation_id.clone().unwrap_or_default();

        let Some(headers) = &delivery.headers else {
            error!(
                consumer = %self.consumer,
                correlation_id,
                delivery_tag = delivery.delivery_tag,
                "received message without headers, dropping"
            );
            return DispatchOutcome::Success;
        };

        info!(consumer = %self.consumer, correlation_id, "handle message");

        let (ctx, mut span) = otel::new_span(Some(headers), &self.consumer);

        let payload = match self
            .converter
            .from_message(&delivery.data, delivery.content_type.as_deref())
        {
            Ok(payload) => payload,
            Err(err) => {
                error!(
                    consumer = %self.consumer,
                    correlation_id,
                    payload = delivery.payload_preview(),
                    error = err.to_string(),
                    "failed to decode message, dropping"
                );
                span.record_error(&err);
                span.set_status(Status::error(err.to_string()));
                return DispatchOutcome::FatalFailure {
                    cause: err.to_string(),
                };
            }
        };

        let msg = ConsumerMessage {
            consumer: self.consumer.clone(),
            queue: self.queue.clone(),
            routing_key: delivery.routing_key.clone(),
            correlation_id: delivery.correlation_id.clone(),
            headers: headers.clone(),
            payload,
            trace_context: ctx.clone(),
        };

        let result = AssertUnwindSafe(self.handler.exec(&ctx, &msg))
            .catch_unwind()
            .await;

        let cause = match result {
            Ok(Ok(())) => {
                debug!(consumer = %self.consumer, correlation_id, "message successfully processed");
                span.set_status(Status::Ok);
                return DispatchOutcome::Success;
            }
            Ok(Err(err)) => err.to_string(),
            Err(_) => "handler panicked".to_owned(),
        };

        span.set_status(Status::error(cause.clone()));
        self.classify_failure(delivery, &correlation_id, cause)
    }

    fn classify_failure(
        &self,
        delivery: &InboundDelivery,
        correlation_id: &str,
        cause: String,
    ) -> DispatchOutcome {
        if self.cfg.mode != DeliveryMode::Retry {
            error!(
                consumer = %self.consumer,
                correlation_id,
                payload = delivery.payload_preview(),
                error = cause,
                "failed to handle message"
            );
            return DispatchOutcome::FatalFailure { cause };
        }

        let attempts = delivery.rejections_from(&self.queue);
        if attempts >= i64::from(self.cfg.max_retries) {
            error!(
                consumer = %self.consumer,
                correlation_id,
                attempts,
                payload = delivery.payload_preview(),
                error = cause,
                "retry failed to handle message"
            );
            return DispatchOutcome::FatalFailure { cause };
        }

        warn!(
            consumer = %self.consumer,
            correlation_id,
            attempts,
            payload = delivery.payload_preview(),
            error = cause,
            "failed to handle message, parking it in the retry queue"
        );
        DispatchOutcome::RetryableFailure { cause }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::handler::HandlerError;
    use lapin::types::{AMQPValue, FieldArray, LongString, ShortString};
    use std::{
        collections::BTreeMap,
        sync::atomic::{AtomicUsize, Ordering},
    };

    pub(crate) fn delivery(body: &str, headers: Option<FieldTable>) -> InboundDelivery {
        InboundDelivery {
            correlation_id: Some("abc".to_owned()),
            content_type: Some("application/json".to_owned()),
            routing_key: "orders.created".to_owned(),
            headers,
            data: body.as_bytes().to_vec(),
            ..InboundDelivery::default()
        }
    }

    pub(crate) fn x_death(queue: &str, reason: &str, count: i64) -> FieldTable {
        let mut death = BTreeMap::new();
        death.insert(ShortString::from(AMQP_HEADERS_COUNT), AMQPValue::LongLongInt(count));
        death.insert(
            ShortString::from(AMQP_HEADERS_QUEUE),
            AMQPValue::LongString(LongString::from(queue)),
        );
        death.insert(
            ShortString::from(AMQP_HEADERS_REASON),
            AMQPValue::LongString(LongString::from(reason)),
        );

        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from(AMQP_HEADERS_X_DEATH),
            AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(FieldTable::from(
                death,
            ))])),
        );
        FieldTable::from(headers)
    }

    fn orders(mode_retry: bool) -> Arc<ConsumerConfig> {
        let cfg = ConsumerConfig::new("orders", "orders.work", "orders.created", "orders");
        if mode_retry {
            Arc::new(cfg.with_retry("orders.retry", 5))
        } else {
            Arc::new(cfg)
        }
    }

    fn failing() -> HandlerRegistry {
        HandlerRegistry::new()
            .register_fn("orders", |_msg| async { Err::<(), HandlerError>("stock service down".into()) })
    }

    #[test]
    fn unresolved_handler_fails_construction() {
        let err = DeliveryDispatcher::with_simple_converter(orders(false), &HandlerRegistry::new())
            .err()
            .unwrap();
        assert_eq!(err, AmqpError::UnresolvedHandler("orders".to_owned()));
    }

    #[tokio::test]
    async fn delivers_decoded_payload_to_handler() {
        let seen = Arc::new(AtomicUsize::new(0));
        let registry = {
            let seen = seen.clone();
            HandlerRegistry::new().register_fn("orders", move |msg| {
                let seen = seen.clone();
                async move {
                    let order: serde_json::Value = msg.payload.decode()?;
                    assert_eq!(order["id"], 42);
                    assert_eq!(msg.correlation_id.as_deref(), Some("abc"));
                    assert_eq!(&*msg.queue, "orders.work");
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), HandlerError>(())
                }
            })
        };

        let dispatcher = DeliveryDispatcher::with_simple_converter(orders(false), &registry).unwrap();
        let outcome = dispatcher
            .dispatch(&delivery(r#"{"id":42}"#, Some(FieldTable::default())))
            .await;

        assert_eq!(outcome, DispatchOutcome::Success);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_headers_are_dropped_without_invoking_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = {
            let calls = calls.clone();
            HandlerRegistry::new().register_fn("orders", move |_msg| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), HandlerError>(()) }
            })
        };

        let dispatcher = DeliveryDispatcher::with_simple_converter(orders(true), &registry).unwrap();
        let outcome = dispatcher.dispatch(&delivery("{}", None)).await;

        assert_eq!(outcome, DispatchOutcome::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn malformed_payload_is_fatal() {
        let registry = HandlerRegistry::new()
            .register_fn("orders", |_msg| async { Ok::<(), HandlerError>(()) });
        let dispatcher = DeliveryDispatcher::with_simple_converter(orders(true), &registry).unwrap();

        let outcome = dispatcher
            .dispatch(&delivery("{broken", Some(FieldTable::default())))
            .await;

        assert!(matches!(outcome, DispatchOutcome::FatalFailure { .. }));
        assert!(outcome.acknowledges());
    }

    #[tokio::test]
    async fn failure_outside_retry_mode_is_fatal() {
        let dispatcher = DeliveryDispatcher::with_simple_converter(orders(false), &failing()).unwrap();
        let outcome = dispatcher.dispatch(&delivery("{}", Some(FieldTable::default()))).await;

        assert_eq!(
            outcome,
            DispatchOutcome::FatalFailure {
                cause: "stock service down".to_owned()
            }
        );
    }

    #[tokio::test]
    async fn first_failure_in_retry_mode_is_retryable() {
        let dispatcher = DeliveryDispatcher::with_simple_converter(orders(true), &failing()).unwrap();
        let outcome = dispatcher.dispatch(&delivery("{}", Some(FieldTable::default()))).await;

        assert!(matches!(outcome, DispatchOutcome::RetryableFailure { .. }));
        assert!(!outcome.acknowledges());
    }

    #[tokio::test]
    async fn failure_after_one_retry_cycle_is_fatal() {
        let dispatcher = DeliveryDispatcher::with_simple_converter(orders(true), &failing()).unwrap();
        let redelivered = delivery("{}", Some(x_death("orders.work", "rejected", 1)));

        let outcome = dispatcher.dispatch(&redelivered).await;

        assert!(matches!(outcome, DispatchOutcome::FatalFailure { .. }));
    }

    #[tokio::test]
    async fn larger_budget_allows_more_cycles() {
        let mut cfg = ConsumerConfig::new("orders", "orders.work", "orders.created", "orders")
            .with_retry("orders.retry", 5);
        cfg.max_retries = 3;
        let dispatcher = DeliveryDispatcher::with_simple_converter(Arc::new(cfg), &failing()).unwrap();

        let twice = delivery("{}", Some(x_death("orders.work", "rejected", 2)));
        assert!(matches!(
            dispatcher.dispatch(&twice).await,
            DispatchOutcome::RetryableFailure { .. }
        ));

        let thrice = delivery("{}", Some(x_death("orders.work", "rejected", 3)));
        assert!(matches!(
            dispatcher.dispatch(&thrice).await,
            DispatchOutcome::FatalFailure { .. }
        ));
    }

    #[tokio::test]
    async fn panicking_handler_counts_as_failure() {
        let registry = HandlerRegistry::new().register_fn("orders", |_msg| async {
            if true {
                panic!("handler bug");
            }
            Ok::<(), HandlerError>(())
        });
        let dispatcher = DeliveryDispatcher::with_simple_converter(orders(true), &registry).unwrap();

        let outcome = dispatcher.dispatch(&delivery("{}", Some(FieldTable::default()))).await;

        assert_eq!(
            outcome,
            DispatchOutcome::RetryableFailure {
                cause: "handler panicked".to_owned()
            }
        );
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Tenant(u32);

    #[tokio::test]
    async fn handler_receives_extracted_trace_context() {
        let seen = Arc::new(AtomicUsize::new(0));
        let registry = {
            let seen = seen.clone();
            HandlerRegistry::new().register_fn("orders", move |msg| {
                let seen = seen.clone();
                async move {
                    assert_eq!(msg.trace_context.get::<Tenant>(), Some(&Tenant(7)));
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), HandlerError>(())
                }
            })
        };
        let dispatcher = DeliveryDispatcher::with_simple_converter(orders(false), &registry).unwrap();

        // the default propagator extracts into the current context
        let _guard = opentelemetry::Context::current_with_value(Tenant(7)).attach();
        let outcome = dispatcher.dispatch(&delivery("{}", Some(FieldTable::default()))).await;

        assert_eq!(outcome, DispatchOutcome::Success);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn counts_only_rejections_from_own_queue() {
        let expired = delivery("{}", Some(x_death("orders.retry", "expired", 4)));
        assert_eq!(expired.rejections_from("orders.work"), 0);
        assert!(expired.has_death_history());

        let rejected = delivery("{}", Some(x_death("orders.work", "rejected", 2)));
        assert_eq!(rejected.rejections_from("orders.work"), 2);

        assert_eq!(delivery("{}", None).rejections_from("orders.work"), 0);
    }
}
