// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Owned descriptions of the exchanges a topology needs. Every exchange the
//! relay routes through is a topic exchange, so a definition only carries a
//! name and its durability.

/// Prefix of the names RabbitMQ reserves for its own predeclared exchanges.
pub const RESERVED_EXCHANGE_PREFIX: &str = "amq.";

/// Definition of a RabbitMQ topic exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
}

impl ExchangeDefinition {
    /// Creates a new, non-durable topic exchange definition.
    ///
    /// # Parameters
    /// * `name` - Name of the exchange
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            durable: false,
        }
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the broker owns this exchange and refuses its declaration.
    pub fn is_predeclared(&self) -> bool {
        self.name.starts_with(RESERVED_EXCHANGE_PREFIX)
    }
}
