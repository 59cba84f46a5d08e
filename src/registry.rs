// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Registry
//!
//! Maps the handler identifiers used in consumer configurations to handler
//! instances. Consumers resolve their handler once, when they are built, so an
//! unknown identifier is reported before any message is received.

use crate::{
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage, FnHandler, HandlerError},
};
use std::{collections::HashMap, future::Future, sync::Arc};
use tracing::{debug, warn};

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ConsumerHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> HandlerRegistry {
        HandlerRegistry::default()
    }

    /// Registers `handler` under `id`, replacing any previous registration.
    pub fn register(mut self, id: &str, handler: Arc<dyn ConsumerHandler>) -> Self {
        if self.handlers.insert(id.to_owned(), handler).is_some() {
            warn!(handler = id, "handler registration replaced");
        } else {
            debug!(handler = id, "handler registered");
        }
        self
    }

    /// Registers an async closure as a handler.
    pub fn register_fn<F, Fut>(self, id: &str, func: F) -> Self
    where
        F: Fn(ConsumerMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(id, Arc::new(FnHandler::new(func)))
    }

    pub fn resolve(&self, id: &str) -> Result<Arc<dyn ConsumerHandler>, AmqpError> {
        self.handlers
            .get(id)
            .cloned()
            .ok_or_else(|| AmqpError::UnresolvedHandler(id.to_owned()))
    }

    /// # Parameters
    /// * `id` - Handler id as named by a consumer configuration
    ///
    /// # Returns
    /// Whether a handler is registered under `id`
    pub fn contains(&self, id: &str) -> bool {
        self.handlers.contains_key(id)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered yet.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
