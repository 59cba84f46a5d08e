// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! [`AmqpTransport`] owns one connection to RabbitMQ and implements the three
//! broker seams of the crate on top of `lapin`:
//!
//! - [`Declarer`] on a dedicated administration channel
//! - [`Subscriber`] with a fresh channel per subscription, so every worker has
//!   its own channel and its own prefetch window
//! - [`Sender`] on a publisher channel in confirm mode

use crate::{
    configs::ConnectionConfig,
    consumer::{Acknowledger, InboundMessage, Subscriber, Subscription},
    dispatcher::InboundDelivery,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    publisher::{OutboundMessage, Sender},
    queue::{QueueBinding, QueueDefinition},
    topology::Declarer,
};
use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions,
    },
    types::{FieldTable, LongString},
    Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error, warn};

const REPLY_SUCCESS: u16 = 200;

/// Creates a new AMQP connection and a channel on it.
pub async fn new_amqp_channel(
    cfg: &ConnectionConfig,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app_name.clone()));

    let conn = match Connection::connect(&cfg.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError(err.to_string()))
        }
    }?;
    debug!("amqp connected");

    let channel = open_channel(&conn).await?;
    Ok((Arc::new(conn), Arc::new(channel)))
}

async fn open_channel(conn: &Connection) -> Result<Channel, AmqpError> {
    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok(c)
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError(err.to_string()))
        }
    }
}

/// One RabbitMQ connection with the channels the relay needs.
pub struct AmqpTransport {
    id: String,
    connection: Arc<Connection>,
    admin: Arc<Channel>,
    publisher: Arc<Channel>,
}

impl AmqpTransport {
    pub async fn connect(cfg: &ConnectionConfig) -> Result<Arc<AmqpTransport>, AmqpError> {
        let (connection, admin) = new_amqp_channel(cfg).await?;

        let publisher = open_channel(&connection).await?;
        if let Err(err) = publisher
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
        {
            error!(error = err.to_string(), "failure to enable publisher confirms");
            return Err(AmqpError::ChannelError(err.to_string()));
        }

        Ok(Arc::new(AmqpTransport {
            id: cfg.id.clone(),
            connection,
            admin,
            publisher: Arc::new(publisher),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn close(&self) -> Result<(), AmqpError> {
        self.connection
            .close(REPLY_SUCCESS, "relay shutdown")
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))
    }
}

#[async_trait]
impl Declarer for AmqpTransport {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.admin.declare_exchange(def).await
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.admin.declare_queue(def).await
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.admin.bind_queue(binding).await
    }
}

/// Settles a lapin delivery.
struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn reject(&self) -> Result<(), AmqpError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue: false,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }
}

#[async_trait]
impl Subscriber for AmqpTransport {
    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<Subscription, AmqpError> {
        let channel = open_channel(&self.connection).await?;

        if let Err(err) = channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
        {
            error!(error = err.to_string(), queue, "failure to configure qos");
            return Err(AmqpError::QoSDeclarationError(err.to_string()));
        }

        let consumer = match channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let deliveries = consumer
            .map(|result| match result {
                Ok(delivery) => {
                    let inbound = InboundDelivery::from(&delivery);
                    Ok(InboundMessage {
                        delivery: inbound,
                        acker: Box::new(LapinAcker(delivery.acker)) as Box<dyn Acknowledger>,
                    })
                }
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed();

        let tag = consumer_tag.to_owned();
        let closer = async move {
            if let Err(err) = channel.close(REPLY_SUCCESS, "consumer stopped").await {
                warn!(error = err.to_string(), consumer_tag = tag, "failure to close consumer channel");
            }
        }
        .boxed();

        Ok(Subscription::new(deliveries, closer))
    }
}

#[async_trait]
impl Sender for AmqpTransport {
    async fn send(&self, msg: &OutboundMessage, confirm: bool) -> Result<(), AmqpError> {
        let pending = match self
            .publisher
            .basic_publish(
                &msg.exchange,
                &msg.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &msg.bytes,
                msg.properties.clone(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            Ok(pending) => Ok(pending),
        }?;

        if !confirm {
            return Ok(());
        }

        match pending.await {
            Ok(confirmation) if confirmation.is_nack() => {
                error!(exchange = msg.exchange, "publish was nacked by the broker");
                Err(AmqpError::PublishNotConfirmed(msg.exchange.clone()))
            }
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "error waiting for publish confirmation");
                Err(AmqpError::PublishingError(err.to_string()))
            }
        }
    }
}
