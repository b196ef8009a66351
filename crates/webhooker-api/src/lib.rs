//! Webhooker HTTP API.
//!
//! A thin inbound surface over the delivery engine: health probes, an
//! event trigger that runs a broadcast, manual replay of stored attempts,
//! and a development receiver that echoes delivered payloads.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use webhooker_core::Clock;
use webhooker_delivery::{storage::DeliveryStorage, Broadcaster};

pub mod config;
pub mod handlers;
pub mod server;

pub use config::Config;
pub use server::{create_router, shutdown_signal, start_server};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Storage used for readiness checks.
    pub storage: Arc<dyn DeliveryStorage>,
    /// Fan-out entry point.
    pub broadcaster: Arc<Broadcaster>,
    /// Time source for response timestamps.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Creates application state.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        broadcaster: Arc<Broadcaster>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, broadcaster, clock }
    }
}
