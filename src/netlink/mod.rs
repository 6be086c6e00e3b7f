//! Generic netlink plumbing.
//!
//! - `attr`: attribute trees for outgoing messages, tables for incoming ones
//! - `message`: header framing, datagram splitting, message classification
//! - `socket`: transports, handles and their callback tables
//! - `scripted`: in-memory transport for tests and dry runs

pub mod attr;
pub mod message;
pub mod scripted;
pub mod socket;
