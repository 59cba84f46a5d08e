// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Process-wide `tracing` subscriber setup.

use crate::errors::AmqpError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs a fmt subscriber filtered by `RUST_LOG`, or by `default_filter`
/// when the variable is unset.
///
/// Fails when the filter does not parse or a global subscriber is already set.
pub fn init(default_filter: &str) -> Result<(), AmqpError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter).map_err(|err| AmqpError::InvalidConfig {
            unit: "logging".to_owned(),
            field: "filter".to_owned(),
            reason: err.to_string(),
        })?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .map_err(|err| AmqpError::InternalError(err.to_string()))
}
