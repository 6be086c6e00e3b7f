//! Process-wide lists of radio sessions and shared listeners.
//!
//! Owned by the process entry point and passed by reference. Radios are
//! only added and removed through [`SessionRegistry::add_radio`] and
//! [`SessionRegistry::remove_radio`]; listeners only through
//! [`super::listener::acquire`] and [`super::listener::release`].

use crate::error::{Error, Result};

use super::iface::VirtualInterface;
use super::listener::SharedListener;
use super::radio::{RadioId, RadioSession};

/// Every radio session and shared listener, keyed by id and phy.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    radios: Vec<RadioSession>,
    listeners: Vec<SharedListener>,
    next_id: u32,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the id for a session about to be added.
    pub fn allocate_id(&mut self) -> RadioId {
        let id = RadioId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    /// Add a session built with an id from [`allocate_id`](Self::allocate_id).
    pub fn add_radio(&mut self, radio: RadioSession) -> RadioId {
        let id = radio.id();
        log::debug!("[Radio] Registered {} on phy{}", id, radio.phy());
        self.radios.push(radio);
        id
    }

    /// Take a session out of the registry.
    pub fn remove_radio(&mut self, id: RadioId) -> Result<RadioSession> {
        let index = self
            .radios
            .iter()
            .position(|r| r.id() == id)
            .ok_or(Error::UnknownRadio(id.0))?;
        Ok(self.radios.remove(index))
    }

    /// Session `id`.
    pub fn radio(&self, id: RadioId) -> Result<&RadioSession> {
        self.radios
            .iter()
            .find(|r| r.id() == id)
            .ok_or(Error::UnknownRadio(id.0))
    }

    /// Session `id`, mutably.
    pub fn radio_mut(&mut self, id: RadioId) -> Result<&mut RadioSession> {
        self.radios
            .iter_mut()
            .find(|r| r.id() == id)
            .ok_or(Error::UnknownRadio(id.0))
    }

    /// Every session, in registration order.
    pub fn radios(&self) -> &[RadioSession] {
        &self.radios
    }

    /// Ids of every session, in registration order.
    pub fn ids(&self) -> Vec<RadioId> {
        self.radios.iter().map(RadioSession::id).collect()
    }

    /// No session is registered.
    pub fn is_empty(&self) -> bool {
        self.radios.is_empty()
    }

    /// Session owning the interface `ifindex`.
    pub fn radio_for_ifindex(&self, ifindex: u32) -> Option<RadioId> {
        self.radios
            .iter()
            .find(|r| r.iface(ifindex).is_some())
            .map(RadioSession::id)
    }

    /// Sessions bound to physical radio `phy`.
    pub fn radios_on_phy(&self, phy: u32) -> Vec<RadioId> {
        self.radios
            .iter()
            .filter(|r| r.phy() == phy)
            .map(RadioSession::id)
            .collect()
    }

    /// Interface `ifindex`, wherever it lives.
    pub fn iface_mut(&mut self, ifindex: u32) -> Result<&mut VirtualInterface> {
        self.radios
            .iter_mut()
            .find_map(|r| r.iface_mut(ifindex))
            .ok_or(Error::UnknownInterface(ifindex))
    }

    /// Open shared listeners.
    pub fn listeners(&self) -> &[SharedListener] {
        &self.listeners
    }

    pub(crate) fn listeners_mut(&mut self) -> &mut Vec<SharedListener> {
        &mut self.listeners
    }

    /// Listener for physical radio `phy`.
    pub fn listener(&self, phy: u32) -> Option<&SharedListener> {
        self.listeners.iter().find(|l| l.phy() == phy)
    }

    /// Listener for `phy`, mutably.
    pub fn listener_mut(&mut self, phy: u32) -> Option<&mut SharedListener> {
        self.listeners.iter_mut().find(|l| l.phy() == phy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::InterfaceMode;
    use crate::nl80211::commands::WiphyCaps;

    fn radio(registry: &mut SessionRegistry, phy: u32, ifindex: u32) -> RadioId {
        let id = registry.allocate_id();
        let primary = VirtualInterface::new(ifindex, format!("wlan{ifindex}"), false);
        registry.add_radio(RadioSession::new(
            id,
            phy,
            InterfaceMode::Station,
            WiphyCaps::default(),
            primary,
        ))
    }

    #[test]
    fn test_lookup_by_ifindex_and_phy() {
        let mut registry = SessionRegistry::new();
        let a = radio(&mut registry, 0, 3);
        let b = radio(&mut registry, 0, 4);
        let c = radio(&mut registry, 1, 5);

        assert_eq!(registry.radio_for_ifindex(4), Some(b));
        assert_eq!(registry.radio_for_ifindex(9), None);
        assert_eq!(registry.radios_on_phy(0), vec![a, b]);
        assert_eq!(registry.radios_on_phy(1), vec![c]);
        assert_eq!(registry.iface_mut(5).unwrap().ifname(), "wlan5");
        assert!(matches!(registry.iface_mut(6), Err(Error::UnknownInterface(6))));
    }

    #[test]
    fn test_remove_radio() {
        let mut registry = SessionRegistry::new();
        let a = radio(&mut registry, 0, 3);
        let b = radio(&mut registry, 0, 4);
        assert_ne!(a, b);

        let removed = registry.remove_radio(a).unwrap();
        assert_eq!(removed.id(), a);
        assert!(matches!(registry.radio(a), Err(Error::UnknownRadio(_))));
        assert!(registry.remove_radio(a).is_err());
        assert_eq!(registry.ids(), vec![b]);
    }
}
