//! Tunnels: one relayed TCP connection each.
//!
//! This module contains:
//! - [`Tunnel`]: socket ownership, reader and writer contexts, inbound path
//! - [`TunnelState`] / [`CloseReason`]: lifecycle and teardown causes
//! - the outbound FIFO shared by a tunnel's two contexts

mod queue;
mod session;
mod state;

pub use session::{Role, Tunnel, TunnelContext, TunnelError};
pub use state::{CloseReason, TunnelState};
