//! Interface mode state machine.
//!
//! mac80211 refuses most type changes while an interface is up, and a
//! type change can race with the kernel still tearing down the previous
//! mode. [`set_mode`] therefore tries a direct change first and falls back
//! to a bounded down/set/up cycle:
//!
//! ```text
//! direct SET_INTERFACE ──ok──────────────────────────────┐
//!        │ err                                           │
//!        ├─ -ENODEV ─────────────────────────► fail      │
//!        ├─ kernel/recorded type == target ──────────────┤
//!        ▼                                               │
//!   ┌► down ─ -EACCES/-ENODEV ──► stop                   │
//!   │   │ (leave bridge when leaving AP)                 │
//!   │   ▼                                                │
//!   │  SET_INTERFACE ─ -EBUSY ─► sleep ─┐                │
//!   │   │ other                         │                │
//!   └───┼───────────────────────────────┘                │
//!       ▼                                                ▼
//!      up (always) ──► record mode ──► per-mode side effects
//! ```
//!
//! Side effects: P2P modes mask 802.11b rates, AP modes take the shared
//! beacon listener and the AP frame subscription, mesh subscribes action
//! and authentication frames, everything else gets the best-effort station
//! action-frame set.

use std::fmt;
use std::str::FromStr;
use std::thread;

use crate::error::{Error, Result};
use crate::nl80211::commands;
use crate::nl80211::consts::*;
use crate::session::iface::Subscription;
use crate::session::{listener, Ctx, RadioId};

/// nl80211 interface types the driver distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum InterfaceMode {
    Unset,
    AdHoc,
    Station,
    Ap,
    ApVlan,
    Monitor,
    Mesh,
    P2pClient,
    P2pGo,
    P2pDevice,
    Ocb,
    /// Any other `NL80211_IFTYPE_*` value.
    Other(u32),
}

impl InterfaceMode {
    /// `NL80211_IFTYPE_*` value.
    pub fn iftype(self) -> u32 {
        match self {
            Self::Unset => NL80211_IFTYPE_UNSPECIFIED,
            Self::AdHoc => NL80211_IFTYPE_ADHOC,
            Self::Station => NL80211_IFTYPE_STATION,
            Self::Ap => NL80211_IFTYPE_AP,
            Self::ApVlan => NL80211_IFTYPE_AP_VLAN,
            Self::Monitor => NL80211_IFTYPE_MONITOR,
            Self::Mesh => NL80211_IFTYPE_MESH_POINT,
            Self::P2pClient => NL80211_IFTYPE_P2P_CLIENT,
            Self::P2pGo => NL80211_IFTYPE_P2P_GO,
            Self::P2pDevice => NL80211_IFTYPE_P2P_DEVICE,
            Self::Ocb => NL80211_IFTYPE_OCB,
            Self::Other(iftype) => iftype,
        }
    }

    /// Mode for an `NL80211_IFTYPE_*` value.
    pub fn from_iftype(iftype: u32) -> Self {
        match iftype {
            NL80211_IFTYPE_UNSPECIFIED => Self::Unset,
            NL80211_IFTYPE_ADHOC => Self::AdHoc,
            NL80211_IFTYPE_STATION => Self::Station,
            NL80211_IFTYPE_AP => Self::Ap,
            NL80211_IFTYPE_AP_VLAN => Self::ApVlan,
            NL80211_IFTYPE_MONITOR => Self::Monitor,
            NL80211_IFTYPE_MESH_POINT => Self::Mesh,
            NL80211_IFTYPE_P2P_CLIENT => Self::P2pClient,
            NL80211_IFTYPE_P2P_GO => Self::P2pGo,
            NL80211_IFTYPE_P2P_DEVICE => Self::P2pDevice,
            NL80211_IFTYPE_OCB => Self::Ocb,
            other => Self::Other(other),
        }
    }

    /// Beaconing modes.
    pub fn is_ap(self) -> bool {
        matches!(self, Self::Ap | Self::P2pGo)
    }

    /// P2P netdev modes (client and group owner).
    pub fn is_p2p(self) -> bool {
        matches!(self, Self::P2pClient | Self::P2pGo)
    }

    /// Name accepted by [`FromStr`].
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::AdHoc => "adhoc",
            Self::Station => "station",
            Self::Ap => "ap",
            Self::ApVlan => "ap-vlan",
            Self::Monitor => "monitor",
            Self::Mesh => "mesh",
            Self::P2pClient => "p2p-client",
            Self::P2pGo => "p2p-go",
            Self::P2pDevice => "p2p-device",
            Self::Ocb => "ocb",
            Self::Other(_) => "other",
        }
    }

    /// Frame subscription the mode needs on its management socket.
    fn subscription(self) -> Subscription {
        match self {
            Self::Ap | Self::P2pGo => Subscription::Ap,
            Self::Mesh => Subscription::Mesh,
            Self::Station | Self::AdHoc | Self::P2pClient | Self::P2pDevice => Subscription::NonAp,
            Self::Unset | Self::ApVlan | Self::Monitor | Self::Ocb | Self::Other(_) => Subscription::None,
        }
    }
}

impl fmt::Display for InterfaceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(iftype) => write!(f, "iftype {iftype}"),
            mode => f.write_str(mode.as_str()),
        }
    }
}

impl FromStr for InterfaceMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "station" | "sta" | "managed" => Self::Station,
            "ap" | "master" => Self::Ap,
            "adhoc" | "ibss" => Self::AdHoc,
            "mesh" => Self::Mesh,
            "monitor" => Self::Monitor,
            "ap-vlan" => Self::ApVlan,
            "p2p-client" => Self::P2pClient,
            "p2p-go" => Self::P2pGo,
            "p2p-device" => Self::P2pDevice,
            "ocb" => Self::Ocb,
            other => return Err(format!("unknown interface mode '{other}'")),
        })
    }
}

/// Switch the primary interface of `radio` to `target`.
///
/// Already being in `target` is success. Any error left after the
/// down/set/up recovery is returned; a bridge membership dropped on the
/// way out of AP mode is only restored by the next AP entry.
pub fn set_mode(ctx: &mut Ctx<'_>, radio: RadioId, target: InterfaceMode) -> Result<()> {
    let session = ctx.registry.radio(radio)?;
    let previous = session.mode();
    let ifindex = session.primary().ifindex();
    let ifname = session.primary().ifname().to_string();
    let iftype = target.iftype();

    let (handle, family) = ctx.global.command()?;
    let mut result = commands::set_interface_type(handle, family, ifindex, iftype);
    if let Err(e) = result {
        if e.is_errno(libc::ENODEV) {
            log::error!("[Mode] {} disappeared while switching to {}: {}", ifname, target, e);
            return Err(e);
        }
        log::debug!("[Mode] Direct switch of {} to {} failed: {}", ifname, target, e);
        let current = commands::get_interface(handle, family, ifindex).ok().and_then(|i| i.iftype);
        result = if current == Some(iftype) || previous == target {
            log::debug!("[Mode] {} already in {} mode, ignoring error", ifname, target);
            Ok(())
        } else {
            Err(e)
        };
    }

    if result.is_err() {
        result = switch_while_down(ctx, radio, previous, target, &ifname, ifindex);
    }
    if let Err(e) = result {
        log::error!("[Mode] Switching {} from {} to {} failed: {}", ifname, previous, target, e);
        return Err(e);
    }

    ctx.registry.radio_mut(radio)?.mode = target;
    if previous != target {
        log::info!("[Mode] {} switched from {} to {}", ifname, previous, target);
    }
    apply_side_effects(ctx, radio, previous, target)
}

fn switch_while_down(
    ctx: &mut Ctx<'_>,
    radio: RadioId,
    previous: InterfaceMode,
    target: InterfaceMode,
    ifname: &str,
    ifindex: u32,
) -> Result<()> {
    let attempts = ctx.global.config().mode_switch_attempts.max(1);
    let delay = ctx.global.config().mode_switch_busy_delay();
    let mut took_down = false;
    let mut result = Err(Error::kernel(-libc::EBUSY));

    for attempt in 1..=attempts {
        if let Err(e) = ctx.os.set_up(ifname, false) {
            let fatal = e.is_errno(libc::EACCES) || e.is_errno(libc::ENODEV);
            log::warn!("[Mode] Could not take {} down (attempt {}): {}", ifname, attempt, e);
            result = Err(e);
            if fatal || attempt == attempts {
                break;
            }
            thread::sleep(delay);
            continue;
        }
        took_down = true;

        if previous.is_ap() && !target.is_ap() {
            if let Err(e) = leave_bridge(ctx, radio) {
                result = Err(e);
                break;
            }
        }

        result = ctx
            .global
            .command()
            .and_then(|(handle, family)| commands::set_interface_type(handle, family, ifindex, target.iftype()));
        match &result {
            Ok(()) => {
                log::debug!("[Mode] {} switched to {} while down (attempt {})", ifname, target, attempt);
                break;
            }
            Err(e) if e.is_errno(libc::EBUSY) && attempt < attempts => {
                log::debug!("[Mode] {} busy (attempt {}/{}), retrying", ifname, attempt, attempts);
                thread::sleep(delay);
            }
            Err(_) => break,
        }
    }

    if took_down {
        if let Ok(session) = ctx.registry.radio_mut(radio) {
            session.ignore_next_down = true;
        }
    }
    if let Err(e) = ctx.os.set_up(ifname, true) {
        log::error!("[Mode] Could not bring {} back up: {}", ifname, e);
        if result.is_ok() {
            result = Err(e);
        }
    }
    result
}

/// Take the primary out of its bridge, once, while it leaves AP mode.
fn leave_bridge(ctx: &mut Ctx<'_>, radio: RadioId) -> Result<()> {
    let vif = ctx.registry.radio_mut(radio)?.primary_mut();
    if vif.removed_from_bridge {
        return Ok(());
    }
    let Some(bridge) = vif.bridge.clone() else {
        return Ok(());
    };
    if ctx.os.master_bridge(vif.ifname()).as_deref() != Some(bridge.name.as_str()) {
        return Ok(());
    }
    match ctx.os.bridge_remove(&bridge.name, vif.ifname()) {
        Ok(()) => vif.removed_from_bridge = true,
        Err(e) => log::warn!("[Mode] Could not remove {} from {}: {}", vif.ifname(), bridge.name, e),
    }
    Ok(())
}

fn apply_side_effects(
    ctx: &mut Ctx<'_>,
    radio: RadioId,
    previous: InterfaceMode,
    target: InterfaceMode,
) -> Result<()> {
    update_legacy_rates(ctx, radio, target)?;

    if target.is_ap() {
        return setup_ap(ctx, radio);
    }
    if previous.is_ap() || ctx.registry.radio(radio)?.listener_phy().is_some() {
        teardown_ap(ctx, radio)?;
    }

    let subscription = target.subscription();
    let vif = ctx.registry.radio_mut(radio)?.primary_mut();
    match vif.subscribe(ctx.global, ctx.reactor, subscription) {
        Ok(()) => Ok(()),
        Err(e) if subscription == Subscription::NonAp => {
            log::warn!("[Mode] No action-frame delivery on {}: {}", vif.ifname(), e);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn update_legacy_rates(ctx: &mut Ctx<'_>, radio: RadioId, target: InterfaceMode) -> Result<()> {
    let session = ctx.registry.radio_mut(radio)?;
    let disable = target.is_p2p();
    if disable == session.disabled_11b {
        return Ok(());
    }
    let ifindex = session.primary().ifindex();
    let (handle, family) = ctx.global.command()?;
    match commands::set_legacy_rates(handle, family, ifindex, disable) {
        Ok(()) => {
            session.disabled_11b = disable;
            log::debug!("[Mode] 11b rates {} on ifindex {}", if disable { "disabled" } else { "enabled" }, ifindex);
        }
        Err(e) => log::warn!("[Mode] Could not update 11b rates on ifindex {}: {}", ifindex, e),
    }
    Ok(())
}

fn setup_ap(ctx: &mut Ctx<'_>, radio: RadioId) -> Result<()> {
    let phy = ctx.registry.radio(radio)?.phy();
    listener::acquire(ctx.global, ctx.registry, ctx.reactor, radio, phy)?;

    let vif = ctx.registry.radio_mut(radio)?.primary_mut();
    vif.subscribe(ctx.global, ctx.reactor, Subscription::Ap)?;

    if vif.removed_from_bridge {
        if let Some(bridge) = vif.bridge.clone() {
            match ctx.os.bridge_add(&bridge.name, vif.ifname()) {
                Ok(()) => vif.removed_from_bridge = false,
                Err(e) => log::warn!("[Mode] Could not re-add {} to {}: {}", vif.ifname(), bridge.name, e),
            }
        }
    }
    Ok(())
}

fn teardown_ap(ctx: &mut Ctx<'_>, radio: RadioId) -> Result<()> {
    listener::release(ctx.registry, ctx.reactor, radio);
    let vif = ctx.registry.radio_mut(radio)?.primary_mut();
    vif.subscribe(ctx.global, ctx.reactor, Subscription::None)?;
    vif.beacon_set = false;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::config::DriverConfig;
    use crate::netlink::scripted::reply;
    use crate::netlink::socket::SocketRole;
    use crate::session::testing::{self, TestEnv};

    /// Environment whose SET_INTERFACE replies pop from the returned queue
    /// (a negative errno each) and ack once it is empty.
    fn env_with_set_results(results: &[i32]) -> (TestEnv, Rc<RefCell<VecDeque<i32>>>) {
        env_with_config(testing::config(), results)
    }

    fn env_with_config(config: DriverConfig, results: &[i32]) -> (TestEnv, Rc<RefCell<VecDeque<i32>>>) {
        let queue = Rc::new(RefCell::new(results.iter().copied().collect::<VecDeque<_>>()));
        let kernel_queue = Rc::clone(&queue);
        let env = testing::ready_env_with_config(config, move |role, req| {
            if req.cmd == NL80211_CMD_SET_INTERFACE {
                if let Some(code) = kernel_queue.borrow_mut().pop_front() {
                    return vec![reply::error(req, code)];
                }
            }
            testing::kernel(role, req)
        });
        (env, queue)
    }

    fn set_interface_count(env: &TestEnv) -> usize {
        env.factory.handles(SocketRole::Command)[0]
            .sent_cmds()
            .iter()
            .filter(|&&c| c == NL80211_CMD_SET_INTERFACE)
            .count()
    }

    #[test]
    fn test_mode_names_round_trip() {
        for mode in [InterfaceMode::Station, InterfaceMode::Ap, InterfaceMode::P2pGo, InterfaceMode::Mesh] {
            assert_eq!(mode.as_str().parse::<InterfaceMode>().unwrap(), mode);
            assert_eq!(InterfaceMode::from_iftype(mode.iftype()), mode);
        }
        assert_eq!(InterfaceMode::from_iftype(12), InterfaceMode::Other(12));
        assert!("bogus".parse::<InterfaceMode>().is_err());
        assert!(InterfaceMode::P2pGo.is_ap());
        assert!(!InterfaceMode::P2pDevice.is_p2p());
    }

    #[test]
    fn test_same_mode_has_no_down_cycle() {
        let mut env = testing::ready_env();
        let id = testing::attach(&mut env, "wlan0", 3);
        set_mode(&mut env.ctx(), id, InterfaceMode::Station).unwrap();
        assert_eq!(env.os.downs(), 0);
        assert_eq!(env.registry.radio(id).unwrap().mode(), InterfaceMode::Station);
    }

    #[test]
    fn test_rejected_set_into_current_mode_is_success() {
        let (mut env, _) = env_with_set_results(&[-libc::EBUSY]);
        let id = testing::attach(&mut env, "wlan0", 3);
        set_mode(&mut env.ctx(), id, InterfaceMode::Station).unwrap();
        assert_eq!(env.os.downs(), 0);
        assert_eq!(set_interface_count(&env), 1);
    }

    #[test]
    fn test_busy_three_times_then_success() {
        let (mut env, queue) = env_with_set_results(&[-libc::EBUSY, -libc::EBUSY, -libc::EBUSY]);
        let id = testing::attach(&mut env, "wlan0", 3);
        set_mode(&mut env.ctx(), id, InterfaceMode::AdHoc).unwrap();

        assert!(queue.borrow().is_empty());
        assert_eq!(set_interface_count(&env), 4);
        assert_eq!(env.os.downs(), 3);
        assert_eq!(env.os.up.get("wlan0"), Some(&true));
        assert_eq!(env.os.calls.last().map(String::as_str), Some("up wlan0"));
        let radio = env.registry.radio(id).unwrap();
        assert_eq!(radio.mode(), InterfaceMode::AdHoc);
        assert!(radio.ignore_next_down());
    }

    #[test]
    fn test_enodev_is_fatal_without_down_cycle() {
        let (mut env, _) = env_with_set_results(&[-libc::ENODEV]);
        let id = testing::attach(&mut env, "wlan0", 3);
        let err = set_mode(&mut env.ctx(), id, InterfaceMode::AdHoc).unwrap_err();
        assert!(err.is_errno(libc::ENODEV));
        assert!(env.os.calls.is_empty());
        assert_eq!(env.registry.radio(id).unwrap().mode(), InterfaceMode::Station);
    }

    #[test]
    fn test_down_permission_error_stops_but_brings_up() {
        let (mut env, _) = env_with_set_results(&[-libc::EBUSY]);
        let id = testing::attach(&mut env, "wlan0", 3);
        env.os.down_errors.push_back(libc::EACCES);
        let err = set_mode(&mut env.ctx(), id, InterfaceMode::AdHoc).unwrap_err();
        assert!(matches!(err, Error::Os { errno, .. } if errno == -libc::EACCES));
        assert_eq!(env.os.calls, vec!["down wlan0".to_string(), "up wlan0".to_string()]);
        assert!(!env.registry.radio(id).unwrap().ignore_next_down());
    }

    #[test]
    fn test_busy_forever_exhausts_attempts() {
        let (mut env, _) = env_with_set_results(&[-libc::EBUSY; 20]);
        let id = testing::attach(&mut env, "wlan0", 3);
        let err = set_mode(&mut env.ctx(), id, InterfaceMode::AdHoc).unwrap_err();
        assert!(err.is_errno(libc::EBUSY));
        assert_eq!(env.os.downs(), 10);
        assert_eq!(env.os.calls.last().map(String::as_str), Some("up wlan0"));
        assert_eq!(env.registry.radio(id).unwrap().mode(), InterfaceMode::Station);
    }

    #[test]
    fn test_last_busy_attempt_does_not_sleep() {
        let config = DriverConfig {
            mode_switch_attempts: 1,
            mode_switch_busy_delay_ms: 60_000,
            ..testing::config()
        };
        let (mut env, _) = env_with_config(config, &[-libc::EBUSY, -libc::EBUSY]);
        let id = testing::attach(&mut env, "wlan0", 3);
        let started = Instant::now();
        let err = set_mode(&mut env.ctx(), id, InterfaceMode::AdHoc).unwrap_err();
        assert!(err.is_errno(libc::EBUSY));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(set_interface_count(&env), 2);
        assert_eq!(env.os.calls, vec!["down wlan0", "up wlan0"]);
    }

    #[test]
    fn test_failure_inside_down_cycle_still_brings_interface_up() {
        let mut env = testing::ready_env();
        let id = testing::attach(&mut env, "wlan0", 3);
        env.global.shutdown(&mut env.reactor);

        let err = switch_while_down(
            &mut env.ctx(),
            id,
            InterfaceMode::Station,
            InterfaceMode::AdHoc,
            "wlan0",
            3,
        )
        .unwrap_err();
        assert!(matches!(err, Error::NotReady(_)));
        assert_eq!(env.os.calls, vec!["down wlan0", "up wlan0"]);
        assert!(env.registry.radio(id).unwrap().ignore_next_down());
    }

    #[test]
    fn test_unknown_radio_while_leaving_ap_still_brings_interface_up() {
        let mut env = testing::ready_env();
        testing::attach(&mut env, "wlan0", 3);
        let err = switch_while_down(
            &mut env.ctx(),
            RadioId(99),
            InterfaceMode::Ap,
            InterfaceMode::Station,
            "wlan0",
            3,
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnknownRadio(_)));
        assert_eq!(env.os.calls, vec!["down wlan0", "up wlan0"]);
    }

    #[test]
    fn test_other_error_stops_retrying() {
        let (mut env, _) = env_with_set_results(&[-libc::EBUSY, -libc::EOPNOTSUPP]);
        let id = testing::attach(&mut env, "wlan0", 3);
        let err = set_mode(&mut env.ctx(), id, InterfaceMode::AdHoc).unwrap_err();
        assert!(err.is_errno(libc::EOPNOTSUPP));
        assert_eq!(env.os.downs(), 1);
    }

    #[test]
    fn test_ap_entry_and_exit() {
        let mut env = testing::ready_env();
        let id = testing::attach(&mut env, "wlan0", 3);

        set_mode(&mut env.ctx(), id, InterfaceMode::Ap).unwrap();
        let radio = env.registry.radio(id).unwrap();
        assert_eq!(radio.listener_phy(), Some(testing::PHY));
        assert_eq!(radio.primary().subscription(), Subscription::Ap);
        assert_eq!(env.registry.listener(testing::PHY).unwrap().radios(), &[id]);

        set_mode(&mut env.ctx(), id, InterfaceMode::Station).unwrap();
        let radio = env.registry.radio(id).unwrap();
        assert_eq!(radio.listener_phy(), None);
        assert_eq!(radio.primary().subscription(), Subscription::NonAp);
        assert!(env.registry.listener(testing::PHY).is_none());
        assert_eq!(env.factory.handles(SocketRole::Listener)[0].close_count(), 1);
    }

    #[test]
    fn test_bridge_removed_leaving_ap_and_restored_on_return() {
        let (mut env, queue) = env_with_set_results(&[]);
        env.os.add_link("br0", 9);
        env.os.bridges.insert("wlan0".into(), "br0".into());
        let id = testing::attach(&mut env, "wlan0", 3);
        set_mode(&mut env.ctx(), id, InterfaceMode::Ap).unwrap();

        queue.borrow_mut().push_back(-libc::EBUSY);
        set_mode(&mut env.ctx(), id, InterfaceMode::AdHoc).unwrap();
        assert!(env.os.calls.contains(&"bridge_remove br0 wlan0".to_string()));
        assert!(env.registry.radio(id).unwrap().primary().removed_from_bridge);

        set_mode(&mut env.ctx(), id, InterfaceMode::Ap).unwrap();
        assert_eq!(env.os.calls.last().map(String::as_str), Some("bridge_add br0 wlan0"));
        assert!(!env.registry.radio(id).unwrap().primary().removed_from_bridge);
    }

    #[test]
    fn test_p2p_masks_legacy_rates() {
        let mut env = testing::ready_env();
        let id = testing::attach(&mut env, "wlan0", 3);
        set_mode(&mut env.ctx(), id, InterfaceMode::P2pClient).unwrap();
        assert!(env.registry.radio(id).unwrap().disabled_11b());

        set_mode(&mut env.ctx(), id, InterfaceMode::Station).unwrap();
        assert!(!env.registry.radio(id).unwrap().disabled_11b());
        let masks = env.factory.handles(SocketRole::Command)[0]
            .sent_cmds()
            .iter()
            .filter(|&&c| c == NL80211_CMD_SET_TX_BITRATE_MASK)
            .count();
        assert_eq!(masks, 2);
    }

    #[test]
    fn test_mesh_subscribes_auth_frames() {
        let mut env = testing::ready_env();
        let id = testing::attach(&mut env, "wlan0", 3);
        set_mode(&mut env.ctx(), id, InterfaceMode::Mesh).unwrap();
        let mgmt = env.factory.handles(SocketRole::Mgmt);
        let types: Vec<u16> = mgmt
            .last()
            .unwrap()
            .sent()
            .iter()
            .map(|r| r.table().unwrap().u16(NL80211_ATTR_FRAME_TYPE).unwrap())
            .collect();
        assert_eq!(types, vec![WLAN_FC_ACTION, WLAN_FC_AUTH]);
    }
}
