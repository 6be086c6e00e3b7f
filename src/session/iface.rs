//! Per-virtual-interface state and auxiliary sockets.
//!
//! An interface may own two auxiliary handles besides the global ones:
//!
//! - **mgmt**: management-frame subscriptions. nl80211 has no per-frame
//!   unregister, so changing the subscription set closes the handle and
//!   opens a fresh one.
//! - **connect**: connection-owner socket. The kernel tears the
//!   connection down when this socket closes.
//!
//! Both are registered with the reactor under
//! [`ReadToken::Interface`] and feed the per-interface dispatcher.

use crate::error::Result;
use crate::netlink::socket::{NlHandle, SocketRole};
use crate::nl80211::commands;
use crate::nl80211::consts::*;
use crate::nl80211::MacAddr;
use crate::reactor::{IfaceSocket, ReadToken, Reactor};

use super::global::GlobalSession;

/// Frames subscribed on the management handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    /// No management handle.
    None,
    /// Frames an access point processes in user space.
    Ap,
    /// Action frames a station handles.
    NonAp,
    /// Action and authentication frames for mesh peering.
    Mesh,
}

/// (frame control, body prefix) pairs for AP mode.
const AP_FRAMES: &[(u16, &[u8])] = &[
    (WLAN_FC_AUTH, &[]),
    (WLAN_FC_ASSOC_REQ, &[]),
    (WLAN_FC_REASSOC_REQ, &[]),
    (WLAN_FC_DISASSOC, &[]),
    (WLAN_FC_DEAUTH, &[]),
    (WLAN_FC_PROBE_REQ, &[]),
    (WLAN_FC_ACTION, &[]),
];

const NON_AP_FRAMES: &[(u16, &[u8])] = &[
    (WLAN_FC_ACTION, &[WLAN_ACTION_PUBLIC]),
    (WLAN_FC_ACTION, &[WLAN_ACTION_FT]),
    (WLAN_FC_ACTION, &[WLAN_ACTION_SA_QUERY]),
    (WLAN_FC_ACTION, &[WLAN_ACTION_WNM]),
    (WLAN_FC_ACTION, &[WLAN_ACTION_RADIO_MEASUREMENT]),
];

const MESH_FRAMES: &[(u16, &[u8])] = &[(WLAN_FC_ACTION, &[]), (WLAN_FC_AUTH, &[])];

/// Bridge the interface belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bridge {
    /// Bridge device name.
    pub name: String,
    /// Bridge ifindex, when resolved.
    pub ifindex: Option<u32>,
}

/// One netdev bound to a radio.
#[derive(Debug)]
pub struct VirtualInterface {
    ifindex: u32,
    ifname: String,
    /// Current hardware address.
    pub mac: Option<MacAddr>,
    /// Operating frequency in MHz.
    pub freq: Option<u32>,
    /// Bridge membership, if bridged.
    pub bridge: Option<Bridge>,
    /// Taken out of `bridge` while leaving AP mode; re-added on the next AP entry.
    pub removed_from_bridge: bool,
    /// Beaconing has been configured.
    pub beacon_set: bool,
    added_by_us: bool,
    mgmt: Option<NlHandle>,
    subscription: Subscription,
    connect: Option<NlHandle>,
}

impl VirtualInterface {
    /// Interface with no handles open and no subscription.
    pub fn new(ifindex: u32, ifname: impl Into<String>, added_by_us: bool) -> Self {
        Self {
            ifindex,
            ifname: ifname.into(),
            mac: None,
            freq: None,
            bridge: None,
            removed_from_bridge: false,
            beacon_set: false,
            added_by_us,
            mgmt: None,
            subscription: Subscription::None,
            connect: None,
        }
    }

    /// Kernel interface index.
    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    /// Interface name.
    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    /// Created through `NEW_INTERFACE` rather than discovered.
    pub fn added_by_us(&self) -> bool {
        self.added_by_us
    }

    /// Management frames currently registered for.
    pub fn subscription(&self) -> Subscription {
        self.subscription
    }

    /// Auxiliary handle of `kind`, if open.
    pub fn handle_mut(&mut self, kind: IfaceSocket) -> Option<&mut NlHandle> {
        match kind {
            IfaceSocket::Mgmt => self.mgmt.as_mut(),
            IfaceSocket::Connect => self.connect.as_mut(),
        }
    }

    /// True when the handle of `kind` is open.
    pub fn has_handle(&self, kind: IfaceSocket) -> bool {
        match kind {
            IfaceSocket::Mgmt => self.mgmt.is_some(),
            IfaceSocket::Connect => self.connect.is_some(),
        }
    }

    /// Messages parked on the `kind` handle by request exchanges.
    pub fn backlog_len(&self, kind: IfaceSocket) -> usize {
        let handle = match kind {
            IfaceSocket::Mgmt => self.mgmt.as_ref(),
            IfaceSocket::Connect => self.connect.as_ref(),
        };
        handle.map_or(0, NlHandle::backlog_len)
    }

    fn slot(&mut self, kind: IfaceSocket) -> &mut Option<NlHandle> {
        match kind {
            IfaceSocket::Mgmt => &mut self.mgmt,
            IfaceSocket::Connect => &mut self.connect,
        }
    }

    /// Open (or reuse) the auxiliary handle of `kind` and watch it.
    pub fn open_aux(
        &mut self,
        global: &mut GlobalSession,
        reactor: &mut dyn Reactor,
        kind: IfaceSocket,
    ) -> Result<&mut NlHandle> {
        let ifindex = self.ifindex;
        let label = format!("{}-{}", self.ifname, kind_label(kind));
        let slot = self.slot(kind);
        if slot.is_none() {
            let role = match kind {
                IfaceSocket::Mgmt => SocketRole::Mgmt,
                IfaceSocket::Connect => SocketRole::Connect,
            };
            let mut handle = global.open_handle(role, label)?;
            reactor.register_read(handle.fd(), ReadToken::Interface { ifindex, kind })?;
            handle.mark_registered();
            log::debug!("[Iface] Opened {} handle for ifindex {}", kind_label(kind), ifindex);
            *slot = Some(handle);
        }
        slot.as_mut().ok_or(crate::error::Error::UnknownInterface(ifindex))
    }

    /// Stop watching and close the auxiliary handle of `kind`.
    pub fn close_aux(&mut self, reactor: &mut dyn Reactor, kind: IfaceSocket) {
        if let Some(mut handle) = self.slot(kind).take() {
            if handle.fd_state().is_registered() {
                reactor.unregister_read(handle.fd());
                handle.mark_unregistered();
            }
            log::debug!("[Iface] Closed {} handle for ifindex {}", kind_label(kind), self.ifindex);
        }
        if kind == IfaceSocket::Mgmt {
            self.subscription = Subscription::None;
        }
    }

    /// Make the management handle carry exactly `target`'s frame set.
    ///
    /// AP and mesh registrations must all succeed. Station registrations
    /// are best effort: failures are logged and the handle is kept.
    pub fn subscribe(
        &mut self,
        global: &mut GlobalSession,
        reactor: &mut dyn Reactor,
        target: Subscription,
    ) -> Result<()> {
        if target == Subscription::None {
            self.close_aux(reactor, IfaceSocket::Mgmt);
            return Ok(());
        }
        if self.subscription == target && self.mgmt.is_some() {
            return Ok(());
        }
        self.close_aux(reactor, IfaceSocket::Mgmt);

        let frames: &[(u16, &[u8])] = match target {
            Subscription::Ap => AP_FRAMES,
            Subscription::NonAp => NON_AP_FRAMES,
            Subscription::Mesh => MESH_FRAMES,
            Subscription::None => &[],
        };
        let family = global.family_id()?;
        let ifindex = self.ifindex;
        let handle = self.open_aux(global, reactor, IfaceSocket::Mgmt)?;

        let mut registered = 0;
        let mut failure = None;
        for (frame_type, prefix) in frames {
            match commands::register_frame(handle, family, ifindex, *frame_type, prefix) {
                Ok(()) => registered += 1,
                Err(e) if target == Subscription::NonAp => {
                    log::debug!(
                        "[Iface] Optional frame registration {:#06x}/{:02x?} failed on ifindex {}: {}",
                        frame_type,
                        prefix,
                        ifindex,
                        e
                    );
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            log::warn!("[Iface] Frame subscription {:?} failed on {}: {}", target, self.ifname, e);
            self.close_aux(reactor, IfaceSocket::Mgmt);
            return Err(e);
        }
        self.subscription = target;
        log::info!(
            "[Iface] {} subscribed to {:?} frames ({}/{} registrations)",
            self.ifname,
            target,
            registered,
            frames.len()
        );
        Ok(())
    }

    /// Close every auxiliary handle.
    pub fn teardown(&mut self, reactor: &mut dyn Reactor) {
        self.close_aux(reactor, IfaceSocket::Mgmt);
        self.close_aux(reactor, IfaceSocket::Connect);
        self.beacon_set = false;
    }
}

fn kind_label(kind: IfaceSocket) -> &'static str {
    match kind {
        IfaceSocket::Mgmt => "mgmt",
        IfaceSocket::Connect => "connect",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing;

    #[test]
    fn test_ap_subscription_registers_all_frames() {
        let mut env = testing::ready_env();
        let mut vif = VirtualInterface::new(3, "wlan0", false);
        vif.subscribe(&mut env.global, &mut env.reactor, Subscription::Ap).unwrap();

        let mgmt = env.factory.handles(SocketRole::Mgmt).remove(0);
        let types: Vec<u16> = mgmt
            .sent()
            .iter()
            .map(|r| r.table().unwrap().u16(NL80211_ATTR_FRAME_TYPE).unwrap())
            .collect();
        assert_eq!(types, AP_FRAMES.iter().map(|(t, _)| *t).collect::<Vec<_>>());
        assert_eq!(
            env.reactor.token_for(mgmt.fd()),
            Some(ReadToken::Interface { ifindex: 3, kind: IfaceSocket::Mgmt })
        );
        assert_eq!(vif.subscription(), Subscription::Ap);
    }

    #[test]
    fn test_same_subscription_is_not_reopened() {
        let mut env = testing::ready_env();
        let mut vif = VirtualInterface::new(3, "wlan0", false);
        vif.subscribe(&mut env.global, &mut env.reactor, Subscription::Mesh).unwrap();
        vif.subscribe(&mut env.global, &mut env.reactor, Subscription::Mesh).unwrap();
        assert_eq!(env.factory.handles(SocketRole::Mgmt).len(), 1);
    }

    #[test]
    fn test_changing_subscription_replaces_handle() {
        let mut env = testing::ready_env();
        let mut vif = VirtualInterface::new(3, "wlan0", false);
        vif.subscribe(&mut env.global, &mut env.reactor, Subscription::Ap).unwrap();
        vif.subscribe(&mut env.global, &mut env.reactor, Subscription::NonAp).unwrap();

        let handles = env.factory.handles(SocketRole::Mgmt);
        assert_eq!(handles.len(), 2);
        assert_eq!(handles[0].close_count(), 1);
        assert_eq!(env.reactor.token_for(handles[0].fd()), None);
        assert_eq!(handles[1].sent().len(), NON_AP_FRAMES.len());
    }

    #[test]
    fn test_non_ap_failures_are_tolerated() {
        let mut env = testing::ready_env_with(|role, req| {
            if role == SocketRole::Mgmt {
                vec![crate::netlink::scripted::reply::error(req, -libc::EALREADY)]
            } else {
                testing::kernel(role, req)
            }
        });
        let mut vif = VirtualInterface::new(3, "wlan0", false);
        vif.subscribe(&mut env.global, &mut env.reactor, Subscription::NonAp).unwrap();
        assert_eq!(vif.subscription(), Subscription::NonAp);
        assert!(vif.has_handle(IfaceSocket::Mgmt));
    }

    #[test]
    fn test_ap_failure_closes_handle() {
        let mut env = testing::ready_env_with(|role, req| {
            if role == SocketRole::Mgmt {
                vec![crate::netlink::scripted::reply::error(req, -libc::EOPNOTSUPP)]
            } else {
                testing::kernel(role, req)
            }
        });
        let mut vif = VirtualInterface::new(3, "wlan0", false);
        let err = vif
            .subscribe(&mut env.global, &mut env.reactor, Subscription::Ap)
            .unwrap_err();
        assert!(err.is_errno(libc::EOPNOTSUPP));
        assert!(!vif.has_handle(IfaceSocket::Mgmt));
        assert_eq!(vif.subscription(), Subscription::None);
        assert_eq!(env.factory.handles(SocketRole::Mgmt)[0].close_count(), 1);
    }

    #[test]
    fn test_teardown_unregisters_everything() {
        let mut env = testing::ready_env();
        let mut vif = VirtualInterface::new(3, "wlan0", true);
        vif.open_aux(&mut env.global, &mut env.reactor, IfaceSocket::Connect).unwrap();
        vif.subscribe(&mut env.global, &mut env.reactor, Subscription::Mesh).unwrap();
        assert_eq!(env.reactor.registered().len(), 3);

        vif.teardown(&mut env.reactor);
        assert_eq!(env.reactor.registered().len(), 1);
        assert_eq!(env.reactor.registered()[0].1, ReadToken::GlobalEvents);
        assert!(!vif.has_handle(IfaceSocket::Connect));
    }
}
