//! In-process providers for the trait seams
//!
//! Used by tests and local development. Neither speaks the real MLS wire
//! format or HTTP.

pub mod delivery_service;
pub mod mock_engine;

pub use delivery_service::{InMemoryApiClient, InMemoryDeliveryService, RejoinRequest};
pub use mock_engine::MockCryptoEngine;
