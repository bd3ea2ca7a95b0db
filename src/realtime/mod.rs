//! Real-time communication: event bus, WebSocket lifecycle, fan-out, and
//! progressive feedback.

pub mod connection;
pub mod feedback;
pub mod gateway;
pub mod manager;
pub mod protocol;
pub mod publisher;
pub mod workflow;

pub use feedback::FeedbackTracker;
pub use gateway::BrokerGateway;
pub use manager::ConnectionManager;
pub use publisher::{EventPublisher, EventSink};
pub use workflow::{Milestone, WorkflowStage, WorkflowTracker};
