//! nl80211d - nl80211 transport and event fan-in for a wireless control
//! daemon.
//!
//! The crate owns every netlink socket a wireless daemon needs to talk to
//! the kernel's nl80211 family: a command socket for synchronous requests,
//! a multicast event socket, per-interface management and connection-owner
//! sockets, and one beacon listener per physical radio. Kernel traffic on
//! any of them is translated into [`DriverEvent`]s.
//!
//! # Architecture
//!
//! - **GlobalSession** - command and event sockets, resolved family ids
//! - **SessionRegistry** - per-radio sessions and shared listeners
//! - **Dispatch** - reactor callbacks routing kernel events to radios
//! - **Mode** - interface-type transitions with their side effects
//!
//! Everything is single-threaded. The owner drives a [`Reactor`] and calls
//! into [`dispatch`] when a registered descriptor becomes readable or a
//! timer fires.
//!
//! # Modules
//!
//! - [`netlink`] - attribute codec, framing and socket handles
//! - [`engine`] - request/response exchanges
//! - [`nl80211`] - family vocabulary and command builders
//! - [`session`] - global, radio, interface and listener state
//! - [`config`] - configuration loading

pub mod config;
pub mod constants;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod mode;
pub mod netlink;
pub mod nl80211;
pub mod os;
pub mod reactor;
pub mod session;

pub use config::DriverConfig;
pub use error::{Error, Result};
pub use events::{DriverEvent, EventSink, LinkChange};
pub use mode::InterfaceMode;
pub use reactor::{PollReactor, Reactor, ReactorEvent};
pub use session::{Ctx, GlobalSession, RadioId, SessionRegistry};
