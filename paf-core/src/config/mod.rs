//! Config Store (spec §4.1): load/save per-family profile sets from on-disk
//! JSON, with an in-memory, copy-on-write snapshot that the hot path reads
//! and the freeze/unfreeze machinery rewrites.

mod error;
mod store;
mod types;

pub use error::ConfigError;
pub use store::{normalize, ConfigStore};
pub use types::{
    ActiveName, EndpointProfile, FamilyState, HealthCheckSettings, LoadBalancerSettings, Mode,
    Strategy, SystemConfig,
};
