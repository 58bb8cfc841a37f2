//! Services - business logic and state management
//!
//! This module contains the core services:
//! - `store` - Latest record per junction
//! - `reconciler` - Applies feed snapshots to the store
//! - `registry` - Subscriber registry and upstream feed lifecycle
//! - `enrichment` - Asynchronous text enrichment requests
//! - `bridge` - Forwards pipeline output to a presentation

pub mod bridge;
pub mod enrichment;
pub mod reconciler;
pub mod registry;
pub mod store;

// Re-export commonly used types
pub use bridge::{BridgeOptions, Presentation, PresentationBridge};
pub use enrichment::{EnrichmentDispatcher, EnrichmentRequest, TextGenerator};
pub use reconciler::Reconciler;
pub use registry::{RegistryOptions, Subscriber, SubscriptionHandle, TrafficFeed, TrafficRegistry};
pub use store::TrafficStore;
