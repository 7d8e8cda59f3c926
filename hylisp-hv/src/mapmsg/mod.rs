//! Mapping-message path between the kernel and the control planes.

pub mod channel;
pub mod mux;
pub mod parse;
pub mod router;

pub use channel::{MapChannel, open_kernel_socket};
pub use mux::MapEventMultiplexer;
pub use router::MapEventRouter;
