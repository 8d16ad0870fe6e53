//! The coordinator server: leader election, follower forwarding, the
//! heartbeat surface, the service layer, and the admin HTTP API, wired
//! into a single [`server::Server`] value — every process-wide concern is
//! an explicit field, not a global.

pub mod forward;
pub mod heartbeat;
pub mod http;
pub mod member;
pub mod observability;
pub mod server;
pub mod service;
pub mod status;

pub use forward::ForwardClient;
pub use heartbeat::{FrameQueue, HeartbeatFrame, HeartbeatHandler, OutboundFrame};
pub use member::{LeaderInfo, Member};
pub use server::Server;
pub use service::MetaService;
pub use status::{ServerStatus, Status};
