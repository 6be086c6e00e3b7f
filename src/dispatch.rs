//! Event dispatch.
//!
//! The reactor hands back the [`ReadToken`] a descriptor was registered
//! under, and [`on_readable`] routes to one of three dispatchers:
//!
//! - **global**: multicast events on the session's event socket, routed by
//!   ifindex to the owning radio (then by wiphy, then to every radio)
//! - **interface**: traffic on one interface's management or
//!   connection-owner socket, scoped to that interface's radio
//! - **listener**: beacons on a shared listener, fanned out to every radio
//!   attached to it
//!
//! Everything runs synchronously inside the read callback. Nothing here
//! sends a request; work that needs one (re-resolving families) goes
//! through a timer and [`on_timeout`].

use crate::error::{Error, Result};
use crate::events::{DriverEvent, EventSink, LinkChange, MlmeKind};
use crate::netlink::attr::AttrTable;
use crate::netlink::message::{MsgKind, NlMessage};
use crate::nl80211::consts::*;
use crate::nl80211::MacAddr;
use crate::reactor::{IfaceSocket, ReadToken, TimerToken};
use crate::session::{Ctx, RadioId};

/// Drain and dispatch everything pending on the descriptor behind `token`.
pub fn on_readable(ctx: &mut Ctx<'_>, sink: &mut dyn EventSink, token: ReadToken) -> Result<()> {
    match token {
        ReadToken::GlobalEvents => {
            let Some(events) = ctx.global.events_mut() else {
                return Err(Error::NotReady("no event socket"));
            };
            let drained = events.drain_pending();
            for msg in &drained.messages {
                dispatch_global(ctx, sink, msg);
            }
            if drain_error("Event socket", drained.error)? {
                ctx.global.schedule_refresh(ctx.reactor);
            }
            Ok(())
        }
        ReadToken::Interface { ifindex, kind } => {
            let Some(radio) = ctx.registry.radio_for_ifindex(ifindex) else {
                log::debug!("[Dispatch] Readable socket for unknown ifindex {}", ifindex);
                return Ok(());
            };
            let vif = ctx.registry.iface_mut(ifindex)?;
            let Some(handle) = vif.handle_mut(kind) else {
                return Ok(());
            };
            let drained = handle.drain_pending();
            for msg in &drained.messages {
                dispatch_iface(ctx, sink, radio, ifindex, kind, msg);
            }
            drain_error(&format!("{:?} socket of ifindex {}", kind, ifindex), drained.error)?;
            Ok(())
        }
        ReadToken::RadioListener { phy } => {
            let Some(listener) = ctx.registry.listener_mut(phy) else {
                log::debug!("[Dispatch] Readable listener for unknown phy{}", phy);
                return Ok(());
            };
            let drained = listener.handle_mut().drain_pending();
            let radios = listener.radios().to_vec();
            for msg in &drained.messages {
                dispatch_listener(sink, phy, &radios, msg);
            }
            drain_error(&format!("Listener of phy{}", phy), drained.error)?;
            Ok(())
        }
    }
}

/// Sort out the failure that ended a drain. Returns true for a receive
/// buffer overrun, which loses events but leaves the socket usable.
fn drain_error(what: &str, error: Option<Error>) -> Result<bool> {
    match error {
        None => Ok(false),
        Some(e) if e.is_errno(libc::ENOBUFS) => {
            log::warn!("[Dispatch] {} overrun, events were lost", what);
            Ok(true)
        }
        Some(e) => Err(e),
    }
}

/// Run deferred work.
pub fn on_timeout(ctx: &mut Ctx<'_>, token: TimerToken) -> Result<()> {
    match token {
        TimerToken::RegroupFamilies => {
            log::info!("[Dispatch] Re-resolving nl80211 family and groups");
            ctx.global.refresh_families()
        }
    }
}

/// Dispatch messages parked in handle backlogs by request exchanges.
///
/// Parked messages do not make a descriptor readable, so the entry point
/// calls this after every operation and every loop iteration.
pub fn flush_backlogs(ctx: &mut Ctx<'_>, sink: &mut dyn EventSink) -> Result<()> {
    let mut tokens = Vec::new();
    if ctx.global.events_mut().is_some_and(|h| h.backlog_len() > 0) {
        tokens.push(ReadToken::GlobalEvents);
    }
    for radio in ctx.registry.radios() {
        for vif in radio.ifaces() {
            for kind in [IfaceSocket::Mgmt, IfaceSocket::Connect] {
                if vif.backlog_len(kind) > 0 {
                    tokens.push(ReadToken::Interface {
                        ifindex: vif.ifindex(),
                        kind,
                    });
                }
            }
        }
    }
    for listener in ctx.registry.listeners() {
        if listener.backlog_len() > 0 {
            tokens.push(ReadToken::RadioListener { phy: listener.phy() });
        }
    }
    for token in tokens {
        on_readable(ctx, sink, token)?;
    }
    Ok(())
}

/// Link state reported by the OS interface layer.
///
/// One down notification is swallowed after a mode switch took the
/// interface down. Enabled is only reported after a reported disable.
pub fn on_link_change(ctx: &mut Ctx<'_>, sink: &mut dyn EventSink, change: LinkChange) {
    let Some(radio) = ctx.registry.radio_for_ifindex(change.ifindex) else {
        return;
    };
    let Ok(session) = ctx.registry.radio_mut(radio) else {
        return;
    };

    if let Some(mac) = change.mac {
        if let Some(vif) = session.iface_mut(change.ifindex) {
            if vif.mac != Some(mac) {
                vif.mac = Some(mac);
                log::info!("[Dispatch] ifindex {} address changed to {}", change.ifindex, mac);
                sink.emit(DriverEvent::MacChanged {
                    radio,
                    ifindex: change.ifindex,
                    mac,
                });
            }
        }
    }

    if change.up {
        if session.link_disabled {
            session.link_disabled = false;
            sink.emit(DriverEvent::InterfaceEnabled {
                radio,
                ifindex: change.ifindex,
            });
        }
    } else if session.ignore_next_down {
        session.ignore_next_down = false;
        log::debug!("[Dispatch] Ignoring down event for ifindex {} after mode switch", change.ifindex);
    } else if !session.link_disabled {
        session.link_disabled = true;
        sink.emit(DriverEvent::InterfaceDisabled {
            radio,
            ifindex: change.ifindex,
        });
    }
}

fn data_of(msg: &NlMessage) -> Option<(u8, AttrTable<'_>)> {
    match msg.kind() {
        Ok(MsgKind::Data(genl)) => match genl.table() {
            Ok(table) => Some((genl.cmd, table)),
            Err(e) => {
                log::debug!("[Dispatch] Dropping malformed event {}: {}", genl.cmd, e);
                None
            }
        },
        Ok(MsgKind::Error(report)) if report.code != 0 => {
            log::debug!("[Dispatch] Stray error report {} for seq {}", report.code, report.request_seq);
            None
        }
        Ok(_) => None,
        Err(e) => {
            log::debug!("[Dispatch] Dropping unparsable message: {}", e);
            None
        }
    }
}

fn dispatch_global(ctx: &mut Ctx<'_>, sink: &mut dyn EventSink, msg: &NlMessage) {
    if matches!(msg.kind(), Ok(MsgKind::Overrun)) {
        ctx.global.schedule_refresh(ctx.reactor);
        return;
    }
    let msg_type = msg.header.msg_type;
    if Some(msg_type) == ctx.global.ctrl_family_id() {
        if let Some((cmd, table)) = data_of(msg) {
            if cmd == CTRL_CMD_NEWFAMILY
                && table.str(CTRL_ATTR_FAMILY_NAME) == Some(NL80211_GENL_NAME)
            {
                log::info!("[Dispatch] nl80211 family (re)registered");
                ctx.global.schedule_refresh(ctx.reactor);
            }
        }
        return;
    }
    if ctx.global.family_id().ok() != Some(msg_type) {
        log::debug!("[Dispatch] Ignoring message for family {}", msg_type);
        return;
    }
    let Some((cmd, table)) = data_of(msg) else {
        return;
    };

    let ifindex = table.u32(NL80211_ATTR_IFINDEX);
    let wiphy = table.u32(NL80211_ATTR_WIPHY);
    let targets = match (ifindex, wiphy) {
        (Some(ifindex), _) => match ctx.registry.radio_for_ifindex(ifindex) {
            Some(radio) => vec![radio],
            // A new interface is not owned yet; its radio is known by wiphy.
            None if cmd == NL80211_CMD_NEW_INTERFACE && wiphy.is_some() => {
                wiphy.map(|phy| ctx.registry.radios_on_phy(phy)).unwrap_or_default()
            }
            None => {
                log::debug!("[Dispatch] Event {} for foreign ifindex {} dropped", cmd, ifindex);
                return;
            }
        },
        (None, Some(phy)) => ctx.registry.radios_on_phy(phy),
        (None, None) => ctx.registry.ids(),
    };
    for radio in targets {
        handle_event(ctx, sink, radio, ifindex, cmd, &table);
    }
}

fn dispatch_iface(
    ctx: &mut Ctx<'_>,
    sink: &mut dyn EventSink,
    radio: RadioId,
    ifindex: u32,
    kind: IfaceSocket,
    msg: &NlMessage,
) {
    let Some((cmd, table)) = data_of(msg) else {
        return;
    };
    if let Some(other) = table.u32(NL80211_ATTR_IFINDEX) {
        if other != ifindex {
            log::debug!("[Dispatch] {:?} socket of ifindex {} saw event for {}", kind, ifindex, other);
            return;
        }
    }
    handle_event(ctx, sink, radio, Some(ifindex), cmd, &table);
}

fn dispatch_listener(sink: &mut dyn EventSink, phy: u32, radios: &[RadioId], msg: &NlMessage) {
    let Some((cmd, table)) = data_of(msg) else {
        return;
    };
    if cmd != NL80211_CMD_FRAME {
        log::debug!("[Dispatch] phy{} listener ignoring command {}", phy, cmd);
        return;
    }
    let Some(frame) = table.get(NL80211_ATTR_FRAME) else {
        return;
    };
    let freq = table.u32(NL80211_ATTR_WIPHY_FREQ);
    let signal_dbm = table.i32(NL80211_ATTR_RX_SIGNAL_DBM);
    for &radio in radios {
        sink.emit(DriverEvent::BeaconReceived {
            radio,
            frame: frame.to_vec(),
            freq,
            signal_dbm,
        });
    }
}

fn mac(table: &AttrTable<'_>) -> Option<MacAddr> {
    table.get(NL80211_ATTR_MAC).and_then(MacAddr::from_slice)
}

fn mlme_kind(cmd: u8) -> Option<MlmeKind> {
    Some(match cmd {
        NL80211_CMD_AUTHENTICATE => MlmeKind::Authenticate,
        NL80211_CMD_ASSOCIATE => MlmeKind::Associate,
        NL80211_CMD_DEAUTHENTICATE => MlmeKind::Deauthenticate,
        NL80211_CMD_DISASSOCIATE => MlmeKind::Disassociate,
        NL80211_CMD_UNPROT_DEAUTHENTICATE => MlmeKind::UnprotectedDeauthenticate,
        NL80211_CMD_UNPROT_DISASSOCIATE => MlmeKind::UnprotectedDisassociate,
        _ => return None,
    })
}

/// Translate one nl80211 event for `radio` and update its state.
fn handle_event(
    ctx: &mut Ctx<'_>,
    sink: &mut dyn EventSink,
    radio: RadioId,
    ifindex: Option<u32>,
    cmd: u8,
    table: &AttrTable<'_>,
) {
    let Ok(session) = ctx.registry.radio_mut(radio) else {
        return;
    };

    if let Some(kind) = mlme_kind(cmd) {
        let timed_out = table.has(NL80211_ATTR_TIMED_OUT);
        if matches!(kind, MlmeKind::Deauthenticate | MlmeKind::Disassociate) {
            session.clear_association();
        }
        sink.emit(DriverEvent::Mlme {
            radio,
            kind,
            addr: mac(table),
            frame: table.get(NL80211_ATTR_FRAME).map(<[u8]>::to_vec),
            timed_out,
        });
        return;
    }

    let event = match cmd {
        NL80211_CMD_TRIGGER_SCAN => DriverEvent::ScanStarted { radio },
        NL80211_CMD_NEW_SCAN_RESULTS => {
            sink.emit(DriverEvent::ScanResults { radio });
            if let Some(pending) = session.pending_auth.as_mut().filter(|p| p.awaiting_scan) {
                pending.awaiting_scan = false;
                log::debug!("[Dispatch] Scan done, retrying authentication with {}", pending.bssid);
                sink.emit(DriverEvent::AuthRetry {
                    radio,
                    bssid: pending.bssid,
                });
            }
            return;
        }
        NL80211_CMD_SCAN_ABORTED => DriverEvent::ScanAborted { radio },
        NL80211_CMD_CONNECT | NL80211_CMD_ROAM => {
            let status = table.u16(NL80211_ATTR_STATUS_CODE).unwrap_or(0);
            let bssid = mac(table);
            if status == 0 {
                session.mark_associated(bssid);
            }
            DriverEvent::Connected {
                radio,
                bssid,
                status,
                roamed: cmd == NL80211_CMD_ROAM,
                req_ie: table.get(NL80211_ATTR_REQ_IE).unwrap_or_default().to_vec(),
                resp_ie: table.get(NL80211_ATTR_RESP_IE).unwrap_or_default().to_vec(),
            }
        }
        NL80211_CMD_DISCONNECT => {
            session.clear_association();
            DriverEvent::Disconnected {
                radio,
                reason: table.u16(NL80211_ATTR_REASON_CODE).unwrap_or(0),
                by_ap: table.has(NL80211_ATTR_DISCONNECTED_BY_AP),
            }
        }
        NL80211_CMD_CH_SWITCH_NOTIFY | NL80211_CMD_CH_SWITCH_STARTED_NOTIFY => {
            let Some(freq) = table.u32(NL80211_ATTR_WIPHY_FREQ) else {
                log::debug!("[Dispatch] Channel switch without frequency for {}", radio);
                return;
            };
            let started = cmd == NL80211_CMD_CH_SWITCH_STARTED_NOTIFY;
            if !started {
                if let Some(vif) = ifindex.and_then(|i| session.iface_mut(i)) {
                    vif.freq = Some(freq);
                }
            }
            DriverEvent::ChannelSwitch {
                radio,
                freq,
                width: table.u32(NL80211_ATTR_CHANNEL_WIDTH),
                center_freq1: table.u32(NL80211_ATTR_CENTER_FREQ1),
                center_freq2: table.u32(NL80211_ATTR_CENTER_FREQ2),
                started,
            }
        }
        NL80211_CMD_REG_CHANGE | NL80211_CMD_WIPHY_REG_CHANGE => DriverEvent::RegulatoryChange {
            radio,
            alpha2: table.str(NL80211_ATTR_REG_ALPHA2).map(str::to_string),
            initiator: table.u8(NL80211_ATTR_REG_INITIATOR),
        },
        NL80211_CMD_REG_BEACON_HINT => DriverEvent::BeaconHint { radio },
        NL80211_CMD_NEW_STATION | NL80211_CMD_DEL_STATION => {
            let Some(addr) = mac(table) else {
                return;
            };
            if cmd == NL80211_CMD_NEW_STATION {
                DriverEvent::StationAdded { radio, addr }
            } else {
                DriverEvent::StationRemoved { radio, addr }
            }
        }
        NL80211_CMD_NEW_INTERFACE => {
            let Some(ifindex) = ifindex else {
                return;
            };
            if session.iface(ifindex).is_some_and(|v| v.added_by_us()) {
                log::debug!("[Dispatch] Echo of our own NEW_INTERFACE for {}", ifindex);
                return;
            }
            DriverEvent::InterfaceAdded {
                radio,
                ifindex,
                ifname: table.str(NL80211_ATTR_IFNAME).map(str::to_string),
            }
        }
        NL80211_CMD_DEL_INTERFACE => {
            let Some(ifindex) = ifindex else {
                return;
            };
            match session.take_iface(ifindex) {
                Ok(mut vif) => vif.teardown(ctx.reactor),
                Err(Error::PrimaryInterface(_)) => {
                    log::warn!("[Dispatch] Primary interface {} of {} was deleted", ifindex, radio);
                }
                Err(_) => return,
            }
            DriverEvent::InterfaceRemoved { radio, ifindex }
        }
        NL80211_CMD_MICHAEL_MIC_FAILURE => DriverEvent::MichaelMicFailure {
            radio,
            addr: mac(table),
        },
        NL80211_CMD_REMAIN_ON_CHANNEL | NL80211_CMD_CANCEL_REMAIN_ON_CHANNEL => DriverEvent::RemainOnChannel {
            radio,
            freq: table.u32(NL80211_ATTR_WIPHY_FREQ),
            cookie: table.u64(NL80211_ATTR_COOKIE),
            cancelled: cmd == NL80211_CMD_CANCEL_REMAIN_ON_CHANNEL,
        },
        NL80211_CMD_NOTIFY_CQM => {
            let cqm = match table.nested(NL80211_ATTR_CQM) {
                Ok(Some(cqm)) => cqm,
                _ => return,
            };
            DriverEvent::SignalChange {
                radio,
                rssi_event: cqm.u32(NL80211_ATTR_CQM_RSSI_THRESHOLD_EVENT),
                packet_loss: cqm.u32(NL80211_ATTR_CQM_PKT_LOSS_EVENT),
            }
        }
        NL80211_CMD_VENDOR => {
            let (Some(vendor_id), Some(subcmd)) = (
                table.u32(NL80211_ATTR_VENDOR_ID),
                table.u32(NL80211_ATTR_VENDOR_SUBCMD),
            ) else {
                return;
            };
            DriverEvent::Vendor {
                radio,
                vendor_id,
                subcmd,
                data: table.get(NL80211_ATTR_VENDOR_DATA).unwrap_or_default().to_vec(),
            }
        }
        NL80211_CMD_PORT_AUTHORIZED => DriverEvent::PortAuthorized {
            radio,
            bssid: mac(table),
        },
        NL80211_CMD_FRAME => {
            let (Some(ifindex), Some(frame)) = (ifindex, table.get(NL80211_ATTR_FRAME)) else {
                return;
            };
            DriverEvent::FrameReceived {
                radio,
                ifindex,
                frame: frame.to_vec(),
                freq: table.u32(NL80211_ATTR_WIPHY_FREQ),
                signal_dbm: table.i32(NL80211_ATTR_RX_SIGNAL_DBM),
            }
        }
        NL80211_CMD_FRAME_TX_STATUS => {
            let Some(ifindex) = ifindex else {
                return;
            };
            DriverEvent::FrameTxStatus {
                radio,
                ifindex,
                cookie: table.u64(NL80211_ATTR_COOKIE),
                acked: table.has(NL80211_ATTR_ACK),
                frame: table.get(NL80211_ATTR_FRAME).unwrap_or_default().to_vec(),
            }
        }
        other => {
            log::debug!("[Dispatch] Ignoring nl80211 event {} for {}", other, radio);
            return;
        }
    };
    sink.emit(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::{self, InterfaceMode};
    use crate::netlink::attr::AttrTree;
    use crate::netlink::scripted::reply;
    use crate::netlink::socket::SocketRole;
    use crate::session::testing::{self, TestEnv, NL80211_ID};

    fn push_event(env: &TestEnv, cmd: u8, attrs: &AttrTree) {
        env.factory.handles(SocketRole::Event)[0].push(reply::event(NL80211_ID, cmd, attrs));
    }

    fn iface_attrs(ifindex: u32) -> AttrTree {
        let mut attrs = AttrTree::new();
        attrs.put_u32(NL80211_ATTR_IFINDEX, ifindex).unwrap();
        attrs
    }

    fn global(env: &mut TestEnv) -> Vec<DriverEvent> {
        let mut events = Vec::new();
        on_readable(&mut env.ctx(), &mut events, ReadToken::GlobalEvents).unwrap();
        events
    }

    #[test]
    fn test_routes_by_ifindex() {
        let mut env = testing::ready_env();
        let a = testing::attach(&mut env, "wlan0", 3);
        let _b = testing::attach(&mut env, "wlan1", 4);
        push_event(&env, NL80211_CMD_TRIGGER_SCAN, &iface_attrs(3));
        assert_eq!(global(&mut env), vec![DriverEvent::ScanStarted { radio: a }]);
    }

    #[test]
    fn test_foreign_interface_is_dropped() {
        let mut env = testing::ready_env();
        testing::attach(&mut env, "wlan0", 3);
        push_event(&env, NL80211_CMD_TRIGGER_SCAN, &iface_attrs(99));
        assert!(global(&mut env).is_empty());
    }

    #[test]
    fn test_wiphy_and_global_fan_out() {
        let mut env = testing::ready_env();
        let a = testing::attach(&mut env, "wlan0", 3);
        let b = testing::attach(&mut env, "wlan1", 4);

        let mut attrs = AttrTree::new();
        attrs.put_u32(NL80211_ATTR_WIPHY, testing::PHY).unwrap();
        push_event(&env, NL80211_CMD_REG_BEACON_HINT, &attrs);
        assert_eq!(
            global(&mut env),
            vec![DriverEvent::BeaconHint { radio: a }, DriverEvent::BeaconHint { radio: b }]
        );

        let mut attrs = AttrTree::new();
        attrs.put_str(NL80211_ATTR_REG_ALPHA2, "DE").unwrap();
        push_event(&env, NL80211_CMD_REG_CHANGE, &attrs);
        let events = global(&mut env);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], DriverEvent::RegulatoryChange { alpha2: Some(a2), .. } if a2 == "DE"));
    }

    #[test]
    fn test_connect_and_disconnect_track_association() {
        let mut env = testing::ready_env();
        let a = testing::attach(&mut env, "wlan0", 3);
        let bssid = MacAddr([0, 0x11, 0x22, 0x33, 0x44, 0x55]);

        let mut attrs = iface_attrs(3);
        attrs.put(NL80211_ATTR_MAC, &bssid.0).unwrap();
        attrs.put_u16(NL80211_ATTR_STATUS_CODE, 0).unwrap();
        attrs.put(NL80211_ATTR_RESP_IE, &[1, 2, 3]).unwrap();
        push_event(&env, NL80211_CMD_CONNECT, &attrs);
        let events = global(&mut env);
        assert!(matches!(
            &events[0],
            DriverEvent::Connected { status: 0, roamed: false, resp_ie, .. } if resp_ie == &[1, 2, 3]
        ));
        assert_eq!(env.registry.radio(a).unwrap().bssid(), Some(bssid));

        let mut attrs = iface_attrs(3);
        attrs.put_u16(NL80211_ATTR_REASON_CODE, 3).unwrap();
        attrs.put_flag(NL80211_ATTR_DISCONNECTED_BY_AP).unwrap();
        push_event(&env, NL80211_CMD_DISCONNECT, &attrs);
        assert_eq!(
            global(&mut env),
            vec![DriverEvent::Disconnected { radio: a, reason: 3, by_ap: true }]
        );
        assert!(!env.registry.radio(a).unwrap().is_associated());
    }

    #[test]
    fn test_mlme_timeout_flag() {
        let mut env = testing::ready_env();
        let a = testing::attach(&mut env, "wlan0", 3);
        let mut attrs = iface_attrs(3);
        attrs.put_flag(NL80211_ATTR_TIMED_OUT).unwrap();
        attrs.put(NL80211_ATTR_MAC, &[2, 0, 0, 0, 0, 7]).unwrap();
        push_event(&env, NL80211_CMD_AUTHENTICATE, &attrs);
        assert_eq!(
            global(&mut env),
            vec![DriverEvent::Mlme {
                radio: a,
                kind: MlmeKind::Authenticate,
                addr: Some(MacAddr([2, 0, 0, 0, 0, 7])),
                frame: None,
                timed_out: true,
            }]
        );
    }

    #[test]
    fn test_scan_results_trigger_auth_retry_once() {
        let mut env = testing::ready_env();
        let a = testing::attach(&mut env, "wlan0", 3);
        let bssid = MacAddr([2, 0, 0, 0, 0, 9]);
        let radio = env.registry.radio_mut(a).unwrap();
        radio.set_pending_auth(bssid, Some(2412));
        radio.request_auth_retry();

        push_event(&env, NL80211_CMD_NEW_SCAN_RESULTS, &iface_attrs(3));
        push_event(&env, NL80211_CMD_NEW_SCAN_RESULTS, &iface_attrs(3));
        assert_eq!(
            global(&mut env),
            vec![
                DriverEvent::ScanResults { radio: a },
                DriverEvent::AuthRetry { radio: a, bssid },
                DriverEvent::ScanResults { radio: a },
            ]
        );
    }

    #[test]
    fn test_family_reload_schedules_refresh() {
        let mut env = testing::ready_env();
        let mut attrs = AttrTree::new();
        attrs.put_str(CTRL_ATTR_FAMILY_NAME, NL80211_GENL_NAME).unwrap();
        attrs.put_u16(CTRL_ATTR_FAMILY_ID, NL80211_ID).unwrap();
        env.factory.handles(SocketRole::Event)[0].push(reply::event(GENL_ID_CTRL, CTRL_CMD_NEWFAMILY, &attrs));
        assert!(global(&mut env).is_empty());
        assert!(env.reactor.has_timer(TimerToken::RegroupFamilies));

        on_timeout(&mut env.ctx(), TimerToken::RegroupFamilies).unwrap();
        assert_eq!(
            env.factory.handles(SocketRole::Event)[0].memberships(),
            vec![5, 6, 7, 8, testing::CTRL_NOTIFY_GROUP]
        );
    }

    #[test]
    fn test_deleted_secondary_interface_is_forgotten() {
        let mut env = testing::ready_env();
        let a = testing::attach(&mut env, "wlan0", 3);
        let mut sink = Vec::new();
        crate::session::radio::add_interface(&mut env.ctx(), &mut sink, a, "wlan0-1", InterfaceMode::Station)
            .unwrap();

        push_event(&env, NL80211_CMD_DEL_INTERFACE, &iface_attrs(testing::NEW_IFINDEX));
        assert_eq!(
            global(&mut env),
            vec![DriverEvent::InterfaceRemoved { radio: a, ifindex: testing::NEW_IFINDEX }]
        );
        assert!(env.registry.radio_for_ifindex(testing::NEW_IFINDEX).is_none());
    }

    #[test]
    fn test_own_new_interface_echo_is_suppressed() {
        let mut env = testing::ready_env();
        let a = testing::attach(&mut env, "wlan0", 3);
        let mut sink = Vec::new();
        crate::session::radio::add_interface(&mut env.ctx(), &mut sink, a, "wlan0-1", InterfaceMode::Station)
            .unwrap();
        push_event(&env, NL80211_CMD_NEW_INTERFACE, &iface_attrs(testing::NEW_IFINDEX));
        assert!(global(&mut env).is_empty());
    }

    #[test]
    fn test_new_interface_on_our_phy_is_reported() {
        let mut env = testing::ready_env();
        let a = testing::attach(&mut env, "wlan0", 3);
        let mut attrs = iface_attrs(42);
        attrs.put_u32(NL80211_ATTR_WIPHY, testing::PHY).unwrap();
        attrs.put_str(NL80211_ATTR_IFNAME, "mon0").unwrap();
        push_event(&env, NL80211_CMD_NEW_INTERFACE, &attrs);
        assert_eq!(
            global(&mut env),
            vec![DriverEvent::InterfaceAdded {
                radio: a,
                ifindex: 42,
                ifname: Some("mon0".to_string()),
            }]
        );
    }

    #[test]
    fn test_mgmt_socket_frames_are_scoped_to_interface() {
        let mut env = testing::ready_env();
        let a = testing::attach(&mut env, "wlan0", 3);
        mode::set_mode(&mut env.ctx(), a, InterfaceMode::Ap).unwrap();

        let mut attrs = iface_attrs(3);
        attrs.put(NL80211_ATTR_FRAME, &[0xb0, 0, 1, 2]).unwrap();
        attrs.put_u32(NL80211_ATTR_WIPHY_FREQ, 2412).unwrap();
        let mgmt = env.factory.handles(SocketRole::Mgmt)[0].clone();
        mgmt.push(reply::event(NL80211_ID, NL80211_CMD_FRAME, &attrs));

        let mut events = Vec::new();
        on_readable(
            &mut env.ctx(),
            &mut events,
            ReadToken::Interface { ifindex: 3, kind: IfaceSocket::Mgmt },
        )
        .unwrap();
        assert_eq!(
            events,
            vec![DriverEvent::FrameReceived {
                radio: a,
                ifindex: 3,
                frame: vec![0xb0, 0, 1, 2],
                freq: Some(2412),
                signal_dbm: None,
            }]
        );
    }

    #[test]
    fn test_beacons_fan_out_to_attached_radios() {
        let mut env = testing::ready_env();
        let a = testing::attach(&mut env, "wlan0", 3);
        let b = testing::attach(&mut env, "wlan1", 4);
        mode::set_mode(&mut env.ctx(), a, InterfaceMode::Ap).unwrap();
        mode::set_mode(&mut env.ctx(), b, InterfaceMode::Ap).unwrap();

        let mut attrs = AttrTree::new();
        attrs.put(NL80211_ATTR_FRAME, &[0x80, 0]).unwrap();
        env.factory.handles(SocketRole::Listener)[0].push(reply::event(NL80211_ID, NL80211_CMD_FRAME, &attrs));

        let mut events = Vec::new();
        on_readable(&mut env.ctx(), &mut events, ReadToken::RadioListener { phy: testing::PHY }).unwrap();
        let radios: Vec<RadioId> = events.iter().map(DriverEvent::radio).collect();
        assert_eq!(radios, vec![a, b]);
    }

    #[test]
    fn test_overrun_schedules_refresh() {
        let mut env = testing::ready_env();
        let overrun = crate::netlink::message::encode_nlmsg(
            crate::netlink::message::NLMSG_OVERRUN,
            0,
            0,
            0,
            &[],
        );
        env.factory.handles(SocketRole::Event)[0].push(overrun);
        assert!(global(&mut env).is_empty());
        assert!(env.reactor.has_timer(TimerToken::RegroupFamilies));
    }

    #[test]
    fn test_overrun_keeps_events_read_before_it() {
        let mut env = testing::ready_env();
        let a = testing::attach(&mut env, "wlan0", 3);
        let parked = reply::event(NL80211_ID, NL80211_CMD_TRIGGER_SCAN, &iface_attrs(3));
        let parked = crate::netlink::message::parse_datagram(&parked).unwrap().remove(0);
        env.global.events_mut().unwrap().push_backlog(parked);
        push_event(&env, NL80211_CMD_NEW_SCAN_RESULTS, &iface_attrs(3));
        env.factory.handles(SocketRole::Event)[0].push_failure(libc::ENOBUFS);

        assert_eq!(
            global(&mut env),
            vec![DriverEvent::ScanStarted { radio: a }, DriverEvent::ScanResults { radio: a }]
        );
        assert!(env.reactor.has_timer(TimerToken::RegroupFamilies));
    }

    #[test]
    fn test_interface_overrun_keeps_frames_and_continues() {
        let mut env = testing::ready_env();
        let a = testing::attach(&mut env, "wlan0", 3);
        mode::set_mode(&mut env.ctx(), a, InterfaceMode::Ap).unwrap();

        let mut attrs = iface_attrs(3);
        attrs.put(NL80211_ATTR_FRAME, &[0xb0, 0]).unwrap();
        let mgmt = env.factory.handles(SocketRole::Mgmt)[0].clone();
        mgmt.push(reply::event(NL80211_ID, NL80211_CMD_FRAME, &attrs));
        mgmt.push_failure(libc::ENOBUFS);
        mgmt.push(reply::event(NL80211_ID, NL80211_CMD_FRAME, &attrs));

        let token = ReadToken::Interface { ifindex: 3, kind: IfaceSocket::Mgmt };
        let mut events = Vec::new();
        on_readable(&mut env.ctx(), &mut events, token).unwrap();
        assert_eq!(events.len(), 1);
        on_readable(&mut env.ctx(), &mut events, token).unwrap();
        assert_eq!(events.len(), 2);
        assert!(!env.reactor.has_timer(TimerToken::RegroupFamilies));
    }

    #[test]
    fn test_listener_read_error_still_delivers_beacons() {
        let mut env = testing::ready_env();
        let a = testing::attach(&mut env, "wlan0", 3);
        mode::set_mode(&mut env.ctx(), a, InterfaceMode::Ap).unwrap();

        let mut attrs = AttrTree::new();
        attrs.put(NL80211_ATTR_FRAME, &[0x80, 0]).unwrap();
        let listener = env.factory.handles(SocketRole::Listener)[0].clone();
        listener.push(reply::event(NL80211_ID, NL80211_CMD_FRAME, &attrs));
        listener.push_failure(libc::ENOBUFS);

        let token = ReadToken::RadioListener { phy: testing::PHY };
        let mut events = Vec::new();
        on_readable(&mut env.ctx(), &mut events, token).unwrap();
        assert_eq!(events.len(), 1);

        listener.push(reply::event(NL80211_ID, NL80211_CMD_FRAME, &attrs));
        listener.push_failure(libc::EIO);
        let err = on_readable(&mut env.ctx(), &mut events, token).unwrap_err();
        assert!(err.is_errno(libc::EIO));
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_ignore_next_down_swallows_one_event() {
        let mut env = testing::ready_env();
        let a = testing::attach(&mut env, "wlan0", 3);
        env.registry.radio_mut(a).unwrap().ignore_next_down = true;
        let mut events = Vec::new();
        let down = LinkChange { ifindex: 3, up: false, mac: None };
        let up = LinkChange { ifindex: 3, up: true, mac: None };

        on_link_change(&mut env.ctx(), &mut events, down);
        on_link_change(&mut env.ctx(), &mut events, up);
        assert!(events.is_empty());

        on_link_change(&mut env.ctx(), &mut events, down);
        on_link_change(&mut env.ctx(), &mut events, up);
        assert_eq!(
            events,
            vec![
                DriverEvent::InterfaceDisabled { radio: a, ifindex: 3 },
                DriverEvent::InterfaceEnabled { radio: a, ifindex: 3 },
            ]
        );
    }

    #[test]
    fn test_mac_change_is_reported_once() {
        let mut env = testing::ready_env();
        let a = testing::attach(&mut env, "wlan0", 3);
        let mac = MacAddr([2, 0, 0, 0, 0, 0x42]);
        let mut events = Vec::new();
        let change = LinkChange { ifindex: 3, up: true, mac: Some(mac) };
        on_link_change(&mut env.ctx(), &mut events, change);
        on_link_change(&mut env.ctx(), &mut events, change);
        assert_eq!(events, vec![DriverEvent::MacChanged { radio: a, ifindex: 3, mac }]);
    }

    #[test]
    fn test_parked_events_are_flushed() {
        let mut env = testing::ready_env();
        let a = testing::attach(&mut env, "wlan0", 3);
        let mut events = Vec::new();
        crate::session::radio::connect_owned(
            &mut env.ctx(),
            a,
            crate::netlink::message::Message::build(NL80211_ID, NL80211_CMD_CONNECT, 0),
        )
        .unwrap();

        let connect = env.factory.handles(SocketRole::Connect)[0].clone();
        let mut attrs = iface_attrs(3);
        attrs.put_u16(NL80211_ATTR_STATUS_CODE, 0).unwrap();
        let event = reply::event(NL80211_ID, NL80211_CMD_CONNECT, &attrs);
        connect.set_responder(move |req| vec![event.clone(), reply::ack(req)]);
        crate::session::radio::connect_owned(
            &mut env.ctx(),
            a,
            crate::netlink::message::Message::build(NL80211_ID, NL80211_CMD_CONNECT, 0),
        )
        .unwrap();

        flush_backlogs(&mut env.ctx(), &mut events).unwrap();
        assert!(matches!(events.as_slice(), [DriverEvent::Connected { status: 0, .. }]));
        assert!(env.registry.radio(a).unwrap().is_associated());
    }
}
