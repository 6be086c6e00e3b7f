//! Shared beacon listener, one per physical radio.
//!
//! Beacon delivery is registered per wiphy, and the kernel allows only one
//! socket to hold that registration. Every radio session on the same phy
//! therefore shares one listener handle. The registry keeps the list;
//! [`acquire`] and [`release`] are the only places that change it so the
//! attached-radio lists stay exact.

use crate::error::{Error, Result};
use crate::netlink::socket::{NlHandle, SocketRole};
use crate::nl80211::commands;
use crate::reactor::{ReadToken, Reactor};

use super::global::GlobalSession;
use super::radio::RadioId;
use super::registry::SessionRegistry;

/// Listener socket for one physical radio.
#[derive(Debug)]
pub struct SharedListener {
    phy: u32,
    handle: NlHandle,
    radios: Vec<RadioId>,
}

impl SharedListener {
    /// Physical radio index.
    pub fn phy(&self) -> u32 {
        self.phy
    }

    /// Radio sessions currently attached, in attach order.
    pub fn radios(&self) -> &[RadioId] {
        &self.radios
    }

    /// Listener handle.
    pub fn handle_mut(&mut self) -> &mut NlHandle {
        &mut self.handle
    }

    /// Messages parked on the listener handle.
    pub fn backlog_len(&self) -> usize {
        self.handle.backlog_len()
    }

    /// Descriptor of the listener socket.
    pub fn fd(&self) -> std::os::fd::RawFd {
        self.handle.fd()
    }
}

/// Attach `radio` to the listener for `phy`, creating it on first use.
///
/// Creating the listener opens a socket, asks for the phy's beacons on it
/// and watches it under [`ReadToken::RadioListener`]. Nothing is left
/// behind when any of those steps fails.
pub fn acquire<'r>(
    global: &mut GlobalSession,
    registry: &'r mut SessionRegistry,
    reactor: &mut dyn Reactor,
    radio: RadioId,
    phy: u32,
) -> Result<&'r SharedListener> {
    registry.radio(radio)?;

    let index = match registry.listeners().iter().position(|l| l.phy == phy) {
        Some(index) => {
            let listener = &mut registry.listeners_mut()[index];
            if !listener.radios.contains(&radio) {
                listener.radios.push(radio);
                log::debug!(
                    "[Listener] {} joined phy{} listener ({} attached)",
                    radio,
                    phy,
                    listener.radios.len()
                );
            }
            index
        }
        None => {
            let family = global.family_id()?;
            let mut handle = global.open_handle(SocketRole::Listener, format!("phy{phy}-beacons"))?;
            commands::register_beacons(&mut handle, family, phy)?;
            reactor.register_read(handle.fd(), ReadToken::RadioListener { phy })?;
            handle.mark_registered();
            log::info!("[Listener] Opened beacon listener for phy{} ({})", phy, radio);
            let listeners = registry.listeners_mut();
            listeners.push(SharedListener {
                phy,
                handle,
                radios: vec![radio],
            });
            listeners.len() - 1
        }
    };

    registry.radio_mut(radio)?.listener_phy = Some(phy);
    registry
        .listeners()
        .get(index)
        .ok_or_else(|| Error::Protocol(format!("listener for phy{phy} vanished")))
}

/// Detach `radio` from its listener. The socket is unregistered and closed
/// when the last radio detaches. Detaching a radio without a listener is a
/// no-op.
pub fn release(registry: &mut SessionRegistry, reactor: &mut dyn Reactor, radio: RadioId) {
    let phy = match registry.radio_mut(radio) {
        Ok(session) => session.listener_phy.take(),
        Err(_) => None,
    };
    let listeners = registry.listeners_mut();
    let index = match phy {
        Some(phy) => listeners.iter().position(|l| l.phy == phy),
        None => listeners.iter().position(|l| l.radios.contains(&radio)),
    };
    let Some(index) = index else {
        return;
    };

    let listener = &mut listeners[index];
    listener.radios.retain(|&r| r != radio);
    if !listener.radios.is_empty() {
        log::debug!(
            "[Listener] {} left phy{} listener ({} still attached)",
            radio,
            listener.phy,
            listener.radios.len()
        );
        return;
    }

    let mut listener = listeners.remove(index);
    if listener.handle.fd_state().is_registered() {
        reactor.unregister_read(listener.handle.fd());
        listener.handle.mark_unregistered();
    }
    log::info!("[Listener] Closed beacon listener for phy{}", listener.phy);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nl80211::consts::NL80211_CMD_REGISTER_BEACONS;
    use crate::session::testing;

    #[test]
    fn test_acquire_twice_shares_one_socket() {
        let mut env = testing::ready_env();
        let a = testing::add_bare_radio(&mut env, 0, 3, "wlan0");
        let b = testing::add_bare_radio(&mut env, 0, 4, "wlan1");

        let first = acquire(&mut env.global, &mut env.registry, &mut env.reactor, a, 0)
            .unwrap()
            .fd();
        let second = acquire(&mut env.global, &mut env.registry, &mut env.reactor, b, 0)
            .unwrap()
            .fd();
        assert_eq!(first, second);

        let handles = env.factory.handles(SocketRole::Listener);
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].sent_cmds(), vec![NL80211_CMD_REGISTER_BEACONS]);
        assert_eq!(env.registry.listener(0).unwrap().radios(), &[a, b]);
        assert_eq!(
            env.reactor.token_for(first),
            Some(ReadToken::RadioListener { phy: 0 })
        );
    }

    #[test]
    fn test_release_closes_after_last_detach() {
        let mut env = testing::ready_env();
        let a = testing::add_bare_radio(&mut env, 0, 3, "wlan0");
        let b = testing::add_bare_radio(&mut env, 0, 4, "wlan1");
        acquire(&mut env.global, &mut env.registry, &mut env.reactor, a, 0).unwrap();
        acquire(&mut env.global, &mut env.registry, &mut env.reactor, b, 0).unwrap();
        let socket = env.factory.handles(SocketRole::Listener)[0].clone();

        release(&mut env.registry, &mut env.reactor, a);
        assert_eq!(socket.close_count(), 0);
        assert_eq!(env.registry.listener(0).unwrap().radios(), &[b]);

        release(&mut env.registry, &mut env.reactor, b);
        assert_eq!(socket.close_count(), 1);
        assert!(env.registry.listener(0).is_none());
        assert_eq!(env.reactor.token_for(socket.fd()), None);

        release(&mut env.registry, &mut env.reactor, b);
        assert_eq!(socket.close_count(), 1);
    }

    #[test]
    fn test_acquire_is_idempotent_per_radio() {
        let mut env = testing::ready_env();
        let a = testing::add_bare_radio(&mut env, 1, 3, "wlan0");
        acquire(&mut env.global, &mut env.registry, &mut env.reactor, a, 1).unwrap();
        acquire(&mut env.global, &mut env.registry, &mut env.reactor, a, 1).unwrap();
        assert_eq!(env.registry.listener(1).unwrap().radios(), &[a]);
        release(&mut env.registry, &mut env.reactor, a);
        assert!(env.registry.listener(1).is_none());
    }

    #[test]
    fn test_separate_phys_get_separate_listeners() {
        let mut env = testing::ready_env();
        let a = testing::add_bare_radio(&mut env, 0, 3, "wlan0");
        let b = testing::add_bare_radio(&mut env, 1, 4, "wlan1");
        acquire(&mut env.global, &mut env.registry, &mut env.reactor, a, 0).unwrap();
        acquire(&mut env.global, &mut env.registry, &mut env.reactor, b, 1).unwrap();
        assert_eq!(env.factory.handles(SocketRole::Listener).len(), 2);
        assert_eq!(env.registry.listeners().len(), 2);
    }

    #[test]
    fn test_failed_beacon_registration_leaves_nothing() {
        let mut env = testing::ready_env_with(|role, req| {
            if role == SocketRole::Listener {
                vec![crate::netlink::scripted::reply::error(req, -libc::EOPNOTSUPP)]
            } else {
                testing::kernel(role, req)
            }
        });
        let a = testing::add_bare_radio(&mut env, 0, 3, "wlan0");
        assert!(acquire(&mut env.global, &mut env.registry, &mut env.reactor, a, 0).is_err());
        assert!(env.registry.listeners().is_empty());
        assert_eq!(env.factory.handles(SocketRole::Listener)[0].close_count(), 1);
        assert_eq!(env.registry.radio(a).unwrap().listener_phy, None);
    }

    #[test]
    fn test_unknown_radio_is_rejected() {
        let mut env = testing::ready_env();
        assert!(matches!(
            acquire(&mut env.global, &mut env.registry, &mut env.reactor, RadioId(42), 0),
            Err(Error::UnknownRadio(42))
        ));
    }
}
