//! Storyweave - Real-time Agent-Orchestration Fabric
//!
//! Server-side fabric mediating between a pool of narrative-pipeline agents
//! (input parsing, world modeling, narrative generation) and many connected
//! clients: live status, progress, metrics, and intervention events over
//! WebSockets, with priority scheduling across the agent pool.

pub mod agents;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod performance;
pub mod platform;
pub mod realtime;
pub mod session;

pub use errors::{FabricError, Result};
pub use events::{Event, EventFilter, EventType};
pub use platform::{Platform, PlatformConfig, PlatformContext, PlatformRuntime};
