//! Per-radio session.
//!
//! A radio session is created by attaching to an existing netdev, which
//! becomes its primary interface. Further interfaces can be created on the
//! same phy with [`add_interface`]. The session caches the wiphy
//! capabilities, the current interface mode and the association state the
//! global dispatcher maintains.

use std::fmt;

use crate::engine;
use crate::error::{Error, Result};
use crate::events::{DriverEvent, EventSink};
use crate::mode::InterfaceMode;
use crate::netlink::message::Message;
use crate::nl80211::commands::{self, ScanEntry, WiphyCaps};
use crate::nl80211::consts::{NL80211_ATTR_IFINDEX, NL80211_ATTR_SOCKET_OWNER};
use crate::nl80211::MacAddr;
use crate::reactor::IfaceSocket;

use super::iface::{Bridge, VirtualInterface};
use super::listener;
use super::Ctx;

/// Identifier of a radio session, unique for the life of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RadioId(pub u32);

impl fmt::Display for RadioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "radio{}", self.0)
    }
}

/// Authentication parameters kept for a retry after a fresh scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAuth {
    /// Target of the failed authentication.
    pub bssid: MacAddr,
    /// Its frequency, when known.
    pub freq: Option<u32>,
    /// Set when the consumer asked for a retry once the next scan completes.
    pub awaiting_scan: bool,
}

/// Per-radio state: mode, association and the interfaces on one wiphy.
#[derive(Debug)]
pub struct RadioSession {
    id: RadioId,
    phy: u32,
    pub(crate) mode: InterfaceMode,
    caps: WiphyCaps,
    pub(crate) associated: bool,
    pub(crate) bssid: Option<MacAddr>,
    pub(crate) pending_auth: Option<PendingAuth>,
    pub(crate) disabled_11b: bool,
    pub(crate) ignore_next_down: bool,
    pub(crate) link_disabled: bool,
    pub(crate) listener_phy: Option<u32>,
    ifaces: Vec<VirtualInterface>,
}

impl RadioSession {
    /// New session whose primary interface is `primary`.
    pub fn new(id: RadioId, phy: u32, mode: InterfaceMode, caps: WiphyCaps, primary: VirtualInterface) -> Self {
        Self {
            id,
            phy,
            mode,
            caps,
            associated: false,
            bssid: None,
            pending_auth: None,
            disabled_11b: false,
            ignore_next_down: false,
            link_disabled: false,
            listener_phy: None,
            ifaces: vec![primary],
        }
    }

    /// Registry id of this session.
    pub fn id(&self) -> RadioId {
        self.id
    }

    /// Physical radio (wiphy) index.
    pub fn phy(&self) -> u32 {
        self.phy
    }

    /// Mode of the primary interface.
    pub fn mode(&self) -> InterfaceMode {
        self.mode
    }

    /// Capabilities read when the radio was attached.
    pub fn caps(&self) -> &WiphyCaps {
        &self.caps
    }

    /// A station connection is up.
    pub fn is_associated(&self) -> bool {
        self.associated
    }

    /// BSS of the current association.
    pub fn bssid(&self) -> Option<MacAddr> {
        self.bssid
    }

    /// 802.11b rates are currently masked off.
    pub fn disabled_11b(&self) -> bool {
        self.disabled_11b
    }

    /// The next interface-down notification will be swallowed.
    pub fn ignore_next_down(&self) -> bool {
        self.ignore_next_down
    }

    /// An interface-disabled notification has gone out and no enable since.
    pub fn link_disabled(&self) -> bool {
        self.link_disabled
    }

    /// Physical radio of the listener this session holds, if any.
    pub fn listener_phy(&self) -> Option<u32> {
        self.listener_phy
    }

    /// Parameters stored for an authentication retry.
    pub fn pending_auth(&self) -> Option<&PendingAuth> {
        self.pending_auth.as_ref()
    }

    /// Remember authentication parameters for a later retry.
    pub fn set_pending_auth(&mut self, bssid: MacAddr, freq: Option<u32>) {
        self.pending_auth = Some(PendingAuth {
            bssid,
            freq,
            awaiting_scan: false,
        });
    }

    /// Ask for an [`DriverEvent::AuthRetry`] when the next scan completes.
    /// Returns false when no parameters are stored.
    pub fn request_auth_retry(&mut self) -> bool {
        match self.pending_auth.as_mut() {
            Some(pending) => {
                pending.awaiting_scan = true;
                true
            }
            None => false,
        }
    }

    /// Forget stored authentication parameters.
    pub fn clear_pending_auth(&mut self) {
        self.pending_auth = None;
    }

    pub(crate) fn mark_associated(&mut self, bssid: Option<MacAddr>) {
        self.associated = true;
        self.bssid = bssid;
        self.pending_auth = None;
    }

    pub(crate) fn clear_association(&mut self) {
        self.associated = false;
        self.bssid = None;
    }

    /// Interfaces, primary first.
    pub fn ifaces(&self) -> &[VirtualInterface] {
        &self.ifaces
    }

    /// Interface the radio was attached through.
    pub fn primary(&self) -> &VirtualInterface {
        // ifaces is never empty: the primary is only removed with the session.
        &self.ifaces[0]
    }

    /// Mutable access to the primary interface.
    pub fn primary_mut(&mut self) -> &mut VirtualInterface {
        &mut self.ifaces[0]
    }

    /// Interface with `ifindex`, if it belongs to this radio.
    pub fn iface(&self, ifindex: u32) -> Option<&VirtualInterface> {
        self.ifaces.iter().find(|i| i.ifindex() == ifindex)
    }

    /// Mutable lookup by ifindex.
    pub fn iface_mut(&mut self, ifindex: u32) -> Option<&mut VirtualInterface> {
        self.ifaces.iter_mut().find(|i| i.ifindex() == ifindex)
    }

    pub(crate) fn push_iface(&mut self, iface: VirtualInterface) {
        self.ifaces.push(iface);
    }

    pub(crate) fn take_iface(&mut self, ifindex: u32) -> Result<VirtualInterface> {
        match self.ifaces.iter().position(|i| i.ifindex() == ifindex) {
            Some(0) => Err(Error::PrimaryInterface(ifindex)),
            Some(index) => Ok(self.ifaces.remove(index)),
            None => Err(Error::UnknownInterface(ifindex)),
        }
    }

    fn take_all_ifaces(&mut self) -> Vec<VirtualInterface> {
        std::mem::take(&mut self.ifaces)
    }
}

/// Attach to the existing interface `ifname` and register a session for
/// its radio. Attaching an interface that already has a session returns
/// that session.
pub fn attach_radio(ctx: &mut Ctx<'_>, ifname: &str) -> Result<RadioId> {
    let ifindex = ctx.os.ifindex(ifname)?;
    if let Some(existing) = ctx.registry.radio_for_ifindex(ifindex) {
        log::debug!("[Radio] {} already attached as {}", ifname, existing);
        return Ok(existing);
    }

    let (handle, family) = ctx.global.command()?;
    let info = commands::get_interface(handle, family, ifindex)?;
    let phy = info
        .wiphy
        .ok_or_else(|| Error::Protocol(format!("{ifname} reported no wiphy index")))?;
    let caps = commands::get_wiphy(handle, family, phy)?;
    let mode = info.iftype.map_or(InterfaceMode::Unset, InterfaceMode::from_iftype);

    let mut primary = VirtualInterface::new(ifindex, ifname, false);
    primary.mac = info.mac;
    primary.freq = info.freq;
    if let Some(name) = ctx.os.master_bridge(ifname) {
        let bridge_ifindex = ctx.os.ifindex(&name).ok();
        log::debug!("[Radio] {} is a member of bridge {}", ifname, name);
        primary.bridge = Some(Bridge {
            name,
            ifindex: bridge_ifindex,
        });
    }

    let id = ctx.registry.allocate_id();
    ctx.registry.add_radio(RadioSession::new(id, phy, mode, caps, primary));
    log::info!(
        "[Radio] Attached {} (ifindex {}) as {} on phy{} in {} mode",
        ifname,
        ifindex,
        id,
        phy,
        mode
    );
    Ok(id)
}

/// Tear a radio session down: leave its listener, close every auxiliary
/// socket, delete the interfaces we created and restore what we changed on
/// the primary. Cleanup failures are logged, not returned.
pub fn release_radio(ctx: &mut Ctx<'_>, id: RadioId) -> Result<()> {
    listener::release(ctx.registry, ctx.reactor, id);
    let mut session = ctx.registry.remove_radio(id)?;
    let disabled_11b = session.disabled_11b;

    for (position, mut vif) in session.take_all_ifaces().into_iter().enumerate() {
        vif.teardown(ctx.reactor);

        if position == 0 && disabled_11b {
            if let Ok((handle, family)) = ctx.global.command() {
                if let Err(e) = commands::set_legacy_rates(handle, family, vif.ifindex(), false) {
                    log::warn!("[Radio] Could not re-enable 11b rates on {}: {}", vif.ifname(), e);
                }
            }
        }

        if vif.removed_from_bridge {
            if let Some(bridge) = &vif.bridge {
                if let Err(e) = ctx.os.bridge_add(&bridge.name, vif.ifname()) {
                    log::warn!("[Radio] Could not restore {} to {}: {}", vif.ifname(), bridge.name, e);
                }
            }
        }

        if vif.added_by_us() {
            match ctx.global.command() {
                Ok((handle, family)) => {
                    if let Err(e) = commands::del_interface(handle, family, vif.ifindex()) {
                        log::warn!("[Radio] Could not delete {}: {}", vif.ifname(), e);
                    }
                }
                Err(e) => log::warn!("[Radio] Leaving {} behind: {}", vif.ifname(), e),
            }
        }
    }
    log::info!("[Radio] Released {} (phy{})", id, session.phy);
    Ok(())
}

/// Create interface `ifname` in `mode` on the radio's phy.
pub fn add_interface(
    ctx: &mut Ctx<'_>,
    sink: &mut dyn EventSink,
    radio: RadioId,
    ifname: &str,
    mode: InterfaceMode,
) -> Result<u32> {
    let phy = ctx.registry.radio(radio)?.phy();
    let (handle, family) = ctx.global.command()?;
    let info = commands::new_interface(handle, family, phy, ifname, mode.iftype())?;
    let ifindex = match info.ifindex {
        0 => ctx.os.ifindex(ifname)?,
        ifindex => ifindex,
    };

    let mut vif = VirtualInterface::new(ifindex, ifname, true);
    vif.mac = info.mac;
    ctx.registry.radio_mut(radio)?.push_iface(vif);
    log::info!("[Radio] Created {} (ifindex {}) on {} as {}", ifname, ifindex, radio, mode);
    sink.emit(DriverEvent::InterfaceAdded {
        radio,
        ifindex,
        ifname: Some(ifname.to_string()),
    });
    Ok(ifindex)
}

/// Remove a secondary interface. Only interfaces we created are deleted
/// in the kernel; discovered ones are just forgotten.
pub fn remove_interface(
    ctx: &mut Ctx<'_>,
    sink: &mut dyn EventSink,
    radio: RadioId,
    ifindex: u32,
) -> Result<()> {
    let mut vif = ctx.registry.radio_mut(radio)?.take_iface(ifindex)?;
    vif.teardown(ctx.reactor);

    let result = if vif.added_by_us() {
        let (handle, family) = ctx.global.command()?;
        commands::del_interface(handle, family, ifindex)
    } else {
        Ok(())
    };
    log::info!("[Radio] Removed {} (ifindex {}) from {}", vif.ifname(), ifindex, radio);
    sink.emit(DriverEvent::InterfaceRemoved { radio, ifindex });
    result
}

/// Send a caller-built connect request on the primary interface's
/// connection-owner socket, so the kernel drops the connection if this
/// process goes away.
pub fn connect_owned(ctx: &mut Ctx<'_>, radio: RadioId, mut msg: Message) -> Result<()> {
    let session = ctx.registry.radio_mut(radio)?;
    let vif = session.primary_mut();
    if !msg.attrs().contains_any(&[NL80211_ATTR_IFINDEX]) {
        msg.attrs_mut().put_u32(NL80211_ATTR_IFINDEX, vif.ifindex())?;
    }
    if !msg.attrs().contains_any(&[NL80211_ATTR_SOCKET_OWNER]) {
        msg.attrs_mut().put_flag(NL80211_ATTR_SOCKET_OWNER)?;
    }
    let handle = vif.open_aux(ctx.global, ctx.reactor, IfaceSocket::Connect)?;
    engine::send_msg(handle, msg)
}

/// Current scan results of the radio's primary interface.
pub fn scan_results(ctx: &mut Ctx<'_>, radio: RadioId) -> Result<Vec<ScanEntry>> {
    let ifindex = ctx.registry.radio(radio)?.primary().ifindex();
    let attempts = ctx.global.config().dump_retry_attempts;
    let (handle, family) = ctx.global.command()?;
    let entries = commands::get_scan(handle, family, ifindex, attempts)?;
    log::debug!("[Radio] {} scan results for {}", entries.len(), radio);
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::scripted::reply;
    use crate::netlink::socket::SocketRole;
    use crate::nl80211::consts::*;
    use crate::session::testing;

    #[test]
    fn test_attach_discovers_interface_and_caps() {
        let mut env = testing::ready_env();
        env.os.add_link("wlan0", 3);
        let id = attach_radio(&mut env.ctx(), "wlan0").unwrap();

        let radio = env.registry.radio(id).unwrap();
        assert_eq!(radio.phy(), testing::PHY);
        assert_eq!(radio.mode(), InterfaceMode::Station);
        assert!(radio.caps().supports(NL80211_IFTYPE_AP));
        assert_eq!(radio.primary().ifindex(), 3);
        assert_eq!(radio.primary().mac, Some(testing::MAC));
        assert!(!radio.primary().added_by_us());

        assert_eq!(attach_radio(&mut env.ctx(), "wlan0").unwrap(), id);
        assert_eq!(env.registry.radios().len(), 1);
    }

    #[test]
    fn test_attach_records_bridge() {
        let mut env = testing::ready_env();
        env.os.add_link("wlan0", 3);
        env.os.add_link("br0", 9);
        env.os.bridges.insert("wlan0".into(), "br0".into());
        let id = attach_radio(&mut env.ctx(), "wlan0").unwrap();
        let bridge = env.registry.radio(id).unwrap().primary().bridge.clone().unwrap();
        assert_eq!(bridge.name, "br0");
        assert_eq!(bridge.ifindex, Some(9));
    }

    #[test]
    fn test_attach_unknown_interface_fails() {
        let mut env = testing::ready_env();
        let err = attach_radio(&mut env.ctx(), "wlan7").unwrap_err();
        assert!(err.is_errno(libc::ENODEV));
        assert!(env.registry.is_empty());
    }

    #[test]
    fn test_add_and_remove_interface() {
        let mut env = testing::ready_env();
        let id = testing::attach(&mut env, "wlan0", 3);
        let mut events = Vec::new();

        let ifindex = add_interface(&mut env.ctx(), &mut events, id, "wlan0-ap", InterfaceMode::Ap).unwrap();
        assert_eq!(ifindex, testing::NEW_IFINDEX);
        assert!(env.registry.radio(id).unwrap().iface(ifindex).unwrap().added_by_us());

        remove_interface(&mut env.ctx(), &mut events, id, ifindex).unwrap();
        assert!(env.registry.radio(id).unwrap().iface(ifindex).is_none());
        assert_eq!(
            events,
            vec![
                DriverEvent::InterfaceAdded {
                    radio: id,
                    ifindex,
                    ifname: Some("wlan0-ap".into())
                },
                DriverEvent::InterfaceRemoved { radio: id, ifindex },
            ]
        );

        let cmds = env.factory.handles(SocketRole::Command)[0].sent_cmds();
        assert!(cmds.contains(&NL80211_CMD_NEW_INTERFACE));
        assert_eq!(cmds.last(), Some(&NL80211_CMD_DEL_INTERFACE));
    }

    #[test]
    fn test_primary_cannot_be_removed_alone() {
        let mut env = testing::ready_env();
        let id = testing::attach(&mut env, "wlan0", 3);
        let mut events = Vec::new();
        let err = remove_interface(&mut env.ctx(), &mut events, id, 3).unwrap_err();
        assert!(matches!(err, Error::PrimaryInterface(3)));
        assert!(events.is_empty());
    }

    #[test]
    fn test_release_deletes_only_our_interfaces() {
        let mut env = testing::ready_env();
        let id = testing::attach(&mut env, "wlan0", 3);
        let mut events = Vec::new();
        add_interface(&mut env.ctx(), &mut events, id, "wlan0-ap", InterfaceMode::Ap).unwrap();

        release_radio(&mut env.ctx(), id).unwrap();
        assert!(env.registry.is_empty());
        let sent = env.factory.handles(SocketRole::Command)[0].sent();
        let deleted: Vec<u32> = sent
            .iter()
            .filter(|r| r.cmd == NL80211_CMD_DEL_INTERFACE)
            .map(|r| r.table().unwrap().u32(NL80211_ATTR_IFINDEX).unwrap())
            .collect();
        assert_eq!(deleted, vec![testing::NEW_IFINDEX]);
        assert!(matches!(release_radio(&mut env.ctx(), id), Err(Error::UnknownRadio(_))));
    }

    #[test]
    fn test_connect_owned_uses_owner_socket() {
        let mut env = testing::ready_env();
        let id = testing::attach(&mut env, "wlan0", 3);
        let mut msg = Message::build(testing::NL80211_ID, NL80211_CMD_CONNECT, 0);
        msg.attrs_mut().put(NL80211_ATTR_SSID, b"home").unwrap();
        connect_owned(&mut env.ctx(), id, msg).unwrap();

        let connect = env.factory.handles(SocketRole::Connect).remove(0);
        let sent = connect.sent();
        assert_eq!(sent.len(), 1);
        let table = sent[0].table().unwrap();
        assert!(table.has(NL80211_ATTR_SOCKET_OWNER));
        assert_eq!(table.u32(NL80211_ATTR_IFINDEX), Some(3));
        assert!(env.registry.radio(id).unwrap().primary().has_handle(IfaceSocket::Connect));

        let msg = Message::build(testing::NL80211_ID, NL80211_CMD_CONNECT, 0);
        connect_owned(&mut env.ctx(), id, msg).unwrap();
        assert_eq!(env.factory.handles(SocketRole::Connect).len(), 1);
    }

    #[test]
    fn test_scan_results_retries_interrupted_dump() {
        let mut interrupted = true;
        let mut env = testing::ready_env_with(move |role, req| {
            if req.cmd == NL80211_CMD_GET_SCAN {
                let mut bss = crate::netlink::attr::AttrTree::new();
                bss.put(NL80211_BSS_BSSID, &[2, 0, 0, 0, 0, 9]).unwrap();
                bss.put_u32(NL80211_BSS_FREQUENCY, 2437).unwrap();
                let mut attrs = crate::netlink::attr::AttrTree::new();
                attrs.put_nested(NL80211_ATTR_BSS, bss).unwrap();
                let end = if interrupted {
                    reply::done_interrupted(req)
                } else {
                    reply::done(req)
                };
                interrupted = false;
                return vec![reply::data(req, NL80211_CMD_NEW_SCAN_RESULTS, &attrs), end];
            }
            testing::kernel(role, req)
        });
        let id = testing::attach(&mut env, "wlan0", 3);
        let entries = scan_results(&mut env.ctx(), id).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].freq, 2437);
    }

    #[test]
    fn test_pending_auth_retry_flag() {
        let mut env = testing::ready_env();
        let id = testing::attach(&mut env, "wlan0", 3);
        let radio = env.registry.radio_mut(id).unwrap();
        assert!(!radio.request_auth_retry());
        radio.set_pending_auth(MacAddr([2, 0, 0, 0, 0, 1]), Some(2412));
        assert!(radio.request_auth_retry());
        assert!(radio.pending_auth().unwrap().awaiting_scan);
        radio.mark_associated(Some(MacAddr([2, 0, 0, 0, 0, 1])));
        assert!(radio.pending_auth().is_none());
        assert!(radio.is_associated());
    }
}
