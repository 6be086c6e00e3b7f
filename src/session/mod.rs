//! Session layer: the global session, per-radio sessions, their virtual
//! interfaces and the shared beacon listeners.
//!
//! Operations that span several of these take a [`Ctx`], a bundle of
//! mutable borrows of everything the entry point owns. Its fields are
//! disjoint, so an operation can hold an interface from the registry while
//! opening a socket through the global session.

pub mod global;
pub mod iface;
pub mod listener;
pub mod radio;
pub mod registry;

pub use global::{GlobalSession, SessionState};
pub use iface::{Subscription, VirtualInterface};
pub use listener::SharedListener;
pub use radio::{RadioId, RadioSession};
pub use registry::SessionRegistry;

use crate::os::IfaceControl;
use crate::reactor::Reactor;

/// Mutable view of the driver state for one operation.
pub struct Ctx<'a> {
    /// Process-wide handles and family ids.
    pub global: &'a mut GlobalSession,
    /// Radio sessions and listeners.
    pub registry: &'a mut SessionRegistry,
    /// Descriptor and timer registrations.
    pub reactor: &'a mut dyn Reactor,
    /// Link and bridge control.
    pub os: &'a mut dyn IfaceControl,
}

impl std::fmt::Debug for Ctx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ctx")
            .field("global", &self.global)
            .field("radios", &self.registry.radios().len())
            .finish()
    }
}
