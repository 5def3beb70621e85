// Swarm daemon: process shell around the coordination engine. Hosts the
// named-tool surface, the dashboard's read API, and the scheduler loop.

pub mod bridge;
pub mod http;
pub mod ticker;
pub mod tools;

pub use bridge::{BridgeNotifier, LoggingBridge};
pub use http::{router, AppState, VERSION};
pub use tools::{ToolContext, ToolRegistry, ToolResponse};
