// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Relay
//!
//! Declarative producers and consumers over a topic-routed RabbitMQ broker.
//! A consumer configuration picks one of three delivery modes and the relay
//! provisions the matching exchanges, queues, bindings and dead-letter wiring:
//!
//! - normal: a work queue bound to `amq.topic`
//! - retry: failed deliveries wait in a TTL queue and are redelivered
//! - delay: messages published under a delay topic reach the work queue late
//!
//! Start with [`messaging::MessagingBuilder`], or wire the runtimes by hand
//! with [`consumer::ConsumerRuntime`] and [`publisher::ProducerRuntime`].

mod otel;

pub mod channel;
pub mod configs;
pub mod consumer;
pub mod converter;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod logging;
pub mod messaging;
pub mod publisher;
pub mod queue;
pub mod rate;
pub mod registry;
pub mod topology;

pub use configs::{ConnectionConfig, ConsumerConfig, DeliveryMode, MessagingConfigs, ProducerConfig};
pub use errors::AmqpError;
pub use handler::{ConsumerHandler, ConsumerMessage, HandlerError};
pub use messaging::{Messaging, MessagingBuilder};
pub use registry::HandlerRegistry;
