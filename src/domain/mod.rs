//! Domain models - junction records, feed payloads and pure geo helpers
//!
//! - `types` - `JunctionRecord`, feed wire format and feed events
//! - `geo` - haversine distance, congestion classification, radius filter
//! - `stats` - density summary over a record set

pub mod geo;
pub mod stats;
pub mod types;

pub use geo::{classify_density, distance_meters, filter_within_radius, Congestion, GeoPoint};
pub use stats::DensityStats;
pub use types::{FeedError, FeedEvent, FeedSnapshot, JunctionId, JunctionRecord};
