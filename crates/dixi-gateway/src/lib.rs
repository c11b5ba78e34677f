//! Dixi Gateway - viewer hub, gesture pipeline, and HTTP/WebSocket server

pub mod hub;
pub mod pipeline;
pub mod server;
pub mod vision;
pub mod ws;

pub use hub::{BroadcastHub, BroadcastOutcome, ClientConnection, ClientInfo, Outbound, TransportState};
pub use pipeline::{GesturePipeline, DEGRADED_REPLY};
pub use server::{router, start_gateway, AppState};
pub use vision::{VisionClient, VisionError};
