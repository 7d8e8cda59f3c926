//! Control-packet path: parse, decide, re-inject.

pub mod inject;
pub mod parse;
pub mod router;

pub use inject::{Inject, RawInjector};
pub use router::{ControlPacketRouter, RouteDecision, bind_control_socket, decide};
