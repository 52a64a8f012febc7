//! Hivelink Ingest
//!
//! Workers that sit between device uploads and the routed exchange:
//!
//! ```text
//! device -> [device traffic] -> Chopper ----------> [routed] -> storage sinks
//!                 |                                    ^
//!                 +-> TrafficPulseGenerator -----------+
//! broker connection list -> ConnectionPulseGenerator --+
//! ```

pub mod chopper;
pub mod config;
pub mod management;
pub mod pulse;

pub use chopper::{Chopper, ChopperFactory};
pub use config::{IngestConfig, Mode};
pub use management::{ConnectionSource, ManagementClient, ManagementError};
pub use pulse::{
    ConnectionPulseGenerator, PulseError, PulseGenerator, PulseSchedule, TrafficPulseGenerator,
};
