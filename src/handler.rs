// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Application Handlers
//!
//! The single entry point application code implements to receive messages.

use crate::converter::Payload;
use async_trait::async_trait;
use lapin::types::FieldTable;
use opentelemetry::Context;
use std::{error::Error, future::Future, marker::PhantomData, sync::Arc};

/// Any application failure. The dispatcher treats every error the same way.
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// A decoded message as seen by a handler.
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub consumer: Arc<str>,
    pub queue: Arc<str>,
    pub routing_key: String,
    pub correlation_id: Option<String>,
    pub headers: FieldTable,
    pub payload: Payload,
    /// Trace context extracted from the headers; parent of any span the
    /// handler opens.
    pub trace_context: Context,
}

/// Application entry point for one consumer.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError>;
}

/// Adapts an async closure taking the message into a [`ConsumerHandler`].
///
/// The closure finds the `exec` context in [`ConsumerMessage::trace_context`].
pub struct FnHandler<F, Fut> {
    func: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    pub fn new(func: F) -> FnHandler<F, Fut> {
        FnHandler {
            func,
            _fut: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> ConsumerHandler for FnHandler<F, Fut>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        let msg = ConsumerMessage {
            trace_context: ctx.clone(),
            ..msg.clone()
        };
        (self.func)(msg).await
    }
}
