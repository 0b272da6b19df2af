//! Candidate file discovery: the Stability Detector (C2, §4.2) and the
//! Discovery Source (C3, §4.3).

mod source;
mod stability;

pub use source::{DiscoveryFilter, DiscoverySource};
pub use stability::{watch_until_stable, Stability, StabilityConfig};
