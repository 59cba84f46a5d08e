// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! [`ProducerRuntime`] encodes payloads with the configured converter, stamps
//! the AMQP properties every outbound message carries and hands the result to a
//! [`Sender`]. Publishing is either confirmed (`publish_sync`) or
//! fire-and-forget (`publish`); neither is retried.
//!
//! Every message is persistent and carries a generated message id, a
//! correlation id, the converter's content type, the producer template as
//! `app_id` and the current OpenTelemetry context in its headers.

use crate::{
    configs::ProducerConfig,
    converter::{MessageConverter, Payload},
    errors::AmqpError,
    otel,
    topology::{Naming, TOPIC_EXCHANGE},
};
use async_trait::async_trait;
use lapin::{
    types::{
        AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
    },
    BasicProperties,
};
use opentelemetry::Context;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{debug, error};
use uuid::Uuid;

/// AMQP delivery mode for messages that survive a broker restart.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// A message ready for the wire.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub bytes: Vec<u8>,
    pub properties: BasicProperties,
}

/// Seam between producers and the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Sender: Send + Sync {
    /// Publishes `msg`. With `confirm`, waits for the broker to confirm it and
    /// fails when it is nacked.
    async fn send(&self, msg: &OutboundMessage, confirm: bool) -> Result<(), AmqpError>;
}

/// Application header values.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    ShortString(String),
    LongString(String),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    LongUint(u32),
    Bool(bool),
}

impl From<HeaderValue> for AMQPValue {
    fn from(value: HeaderValue) -> AMQPValue {
        match value {
            HeaderValue::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValue::Int(v) => AMQPValue::ShortInt(ShortInt::from(v)),
            HeaderValue::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValue::LongUint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
            HeaderValue::Bool(v) => AMQPValue::Boolean(v),
        }
    }
}

/// What the application publishes: a payload and optional routing details.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerMessage {
    payload: Payload,
    topic: Option<String>,
    correlation_id: Option<String>,
    headers: HashMap<String, HeaderValue>,
}

impl ProducerMessage {
    pub fn new(payload: Payload) -> ProducerMessage {
        ProducerMessage {
            payload,
            topic: None,
            correlation_id: None,
            headers: HashMap::new(),
        }
    }

    /// Routing key, overriding the producer's default topic.
    pub fn topic(mut self, topic: &str) -> Self {
        self.topic = Some(topic.to_owned());
        self
    }

    pub fn correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: HeaderValue) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }
}

impl From<Payload> for ProducerMessage {
    fn from(payload: Payload) -> ProducerMessage {
        ProducerMessage::new(payload)
    }
}

pub struct ProducerRuntime {
    cfg: ProducerConfig,
    naming: Naming,
    sender: Arc<dyn Sender>,
    converter: Arc<dyn MessageConverter>,
}

impl ProducerRuntime {
    /// Creates a producer.
    ///
    /// # Parameters
    /// * `cfg` - Producer configuration, validated here
    /// * `naming` - Naming scheme used for delay topics
    /// * `sender` - Broker seam messages are handed to
    /// * `converter` - Payload codec
    ///
    /// # Returns
    /// The producer, or a configuration error
    pub fn new(
        cfg: ProducerConfig,
        naming: Naming,
        sender: Arc<dyn Sender>,
        converter: Arc<dyn MessageConverter>,
    ) -> Result<ProducerRuntime, AmqpError> {
        cfg.validate()?;

        Ok(ProducerRuntime {
            cfg,
            naming,
            sender,
            converter,
        })
    }

    /// Name the producer is looked up by.
    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.cfg
    }

    /// Publishes and waits for the broker confirmation.
    ///
    /// # Parameters
    /// * `msg` - Payload, optionally with topic, correlation id and headers
    ///
    /// # Returns
    /// Ok(()) once the broker confirmed the message; a configuration error when
    /// no topic is known; a transport error on publish failure or nack
    pub async fn publish_sync(&self, msg: impl Into<ProducerMessage>) -> Result<(), AmqpError> {
        let msg = msg.into();
        let routing_key = self.routing_key(&msg)?;
        let outbound = self.prepare(&self.cfg.exchange, routing_key, &msg)?;

        self.sender.send(&outbound, true).await.inspect_err(|err| {
            error!(
                producer = %self.cfg.name,
                routing_key = %outbound.routing_key,
                error = err.to_string(),
                "failure to publish message"
            );
        })
    }

    /// Publishes in the background without waiting for a confirmation.
    ///
    /// Encoding and routing errors are returned immediately; transport errors
    /// are only logged. The send runs on the current Tokio runtime.
    ///
    /// # Returns
    /// The handle of the background send, which may be dropped, or
    /// [`AmqpError::InternalError`] when called outside a Tokio runtime
    pub fn publish(&self, msg: impl Into<ProducerMessage>) -> Result<JoinHandle<()>, AmqpError> {
        let msg = msg.into();
        let routing_key = self.routing_key(&msg)?;
        let outbound = self.prepare(&self.cfg.exchange, routing_key, &msg)?;
        self.spawn_send(outbound)
    }

    /// Publishes with `publish` or `publish_sync`, as the producer's
    /// `asynchronous` flag says.
    pub async fn send(&self, msg: impl Into<ProducerMessage>) -> Result<(), AmqpError> {
        if self.cfg.asynchronous {
            self.publish(msg).map(|_| ())
        } else {
            self.publish_sync(msg).await
        }
    }

    /// Publishes on the topic exchange under the delay topic for `minutes`, so
    /// the message reaches consumers of its topic that run in delay mode with
    /// the same interval only once the delay has elapsed.
    pub async fn publish_delayed(
        &self,
        msg: impl Into<ProducerMessage>,
        minutes: u32,
    ) -> Result<(), AmqpError> {
        let msg = msg.into();
        let topic = self.routing_key(&msg)?;
        let routing_key = self.naming.delay_topic(minutes, &topic);
        let outbound = self.prepare(TOPIC_EXCHANGE, routing_key, &msg)?;

        if self.cfg.asynchronous {
            return self.spawn_send(outbound).map(|_| ());
        }
        self.sender.send(&outbound, true).await
    }

    fn spawn_send(&self, outbound: OutboundMessage) -> Result<JoinHandle<()>, AmqpError> {
        let runtime = Handle::try_current().map_err(|err| {
            error!(producer = %self.cfg.name, error = err.to_string(), "no runtime to publish on");
            AmqpError::InternalError(format!("asynchronous publish needs a tokio runtime: {err}"))
        })?;
        let sender = self.sender.clone();
        let producer = self.cfg.name.clone();

        Ok(runtime.spawn(async move {
            if let Err(err) = sender.send(&outbound, false).await {
                error!(
                    producer,
                    routing_key = %outbound.routing_key,
                    error = err.to_string(),
                    "failure to publish message"
                );
            }
        }))
    }

    fn routing_key(&self, msg: &ProducerMessage) -> Result<String, AmqpError> {
        msg.topic
            .as_ref()
            .or(self.cfg.topic.as_ref())
            .filter(|topic| !topic.is_empty())
            .cloned()
            .ok_or_else(|| AmqpError::MissingConfig {
                unit: self.cfg.name.clone(),
                field: "topic".to_owned(),
            })
    }

    fn prepare(
        &self,
        exchange: &str,
        routing_key: String,
        msg: &ProducerMessage,
    ) -> Result<OutboundMessage, AmqpError> {
        let encoded = self.converter.to_message(&msg.payload)?;

        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject(&Context::current(), &mut headers);
        for (key, value) in msg.headers.clone() {
            headers.insert(ShortString::from(key), value.into());
        }

        let message_id = Uuid::new_v4().to_string();
        let correlation_id = msg
            .correlation_id
            .clone()
            .unwrap_or_else(|| message_id.clone());

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(encoded.content_type))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_message_id(ShortString::from(message_id))
            .with_correlation_id(ShortString::from(correlation_id))
            .with_headers(FieldTable::from(headers));
        if !self.cfg.template.is_empty() {
            properties = properties.with_app_id(ShortString::from(self.cfg.template.clone()));
        }

        debug!(producer = %self.cfg.name, exchange, routing_key, "message prepared");

        Ok(OutboundMessage {
            exchange: exchange.to_owned(),
            routing_key,
            bytes: encoded.bytes,
            properties,
        })
    }
}
