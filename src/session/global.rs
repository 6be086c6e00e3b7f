//! Process-wide nl80211 session.
//!
//! Owns the command handle, the multicast event handle and the resolved
//! family/group ids. Lifecycle:
//!
//! ```text
//! Uninitialized ──init()──► ResolvingFamilies ──► Ready ──shutdown()──► ShutDown
//!        ▲                         │
//!        └──────── fatal error ────┘
//! ```
//!
//! Family ids can change when the nl80211 module is reloaded, silently
//! dropping group memberships. The event handle listens on nlctrl's
//! `notify` group; dispatch schedules [`TimerToken::RegroupFamilies`] and
//! [`GlobalSession::refresh_families`] re-resolves and re-joins from the
//! timer, outside any dispatch.

use crate::config::DriverConfig;
use crate::error::{Error, Result};
use crate::netlink::socket::{NlHandle, SocketRole, TransportFactory};
use crate::nl80211::commands::{self, FamilyInfo};
use crate::nl80211::consts::{
    CTRL_GROUP_NOTIFY, EVENT_GROUPS, GENL_CTRL_NAME, NL80211_GENL_NAME,
};
use crate::reactor::{ReadToken, Reactor, TimerToken};

/// Lifecycle state of the global session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not started, or a failed start was rolled back.
    Uninitialized,
    /// Inside `init`, looking up family and group ids.
    ResolvingFamilies,
    /// Handles open and the `scan` group joined.
    Ready,
    /// Closed for good.
    ShutDown,
}

impl SessionState {
    /// Lowercase name for errors and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::ResolvingFamilies => "resolving-families",
            Self::Ready => "ready",
            Self::ShutDown => "shut-down",
        }
    }
}

/// Process-wide handles and family ids.
pub struct GlobalSession {
    state: SessionState,
    config: DriverConfig,
    factory: Box<dyn TransportFactory>,
    command: Option<NlHandle>,
    events: Option<NlHandle>,
    nl80211: Option<FamilyInfo>,
    ctrl: Option<FamilyInfo>,
    joined: Vec<(&'static str, u32)>,
}

impl std::fmt::Debug for GlobalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalSession")
            .field("state", &self.state)
            .field("nl80211", &self.nl80211.as_ref().map(|f| f.id))
            .field("joined", &self.joined)
            .finish()
    }
}

impl GlobalSession {
    /// New, uninitialized session opening sockets through `factory`.
    pub fn new(config: DriverConfig, factory: Box<dyn TransportFactory>) -> Self {
        Self {
            state: SessionState::Uninitialized,
            config,
            factory,
            command: None,
            events: None,
            nl80211: None,
            ctrl: None,
            joined: Vec::new(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Driver tunables.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Open the command and event handles, resolve families and join the
    /// event groups.
    ///
    /// Failing to resolve either family or to join `scan` is fatal and
    /// leaves the session uninitialized. The other groups are optional.
    pub fn init(&mut self, reactor: &mut dyn Reactor) -> Result<()> {
        if self.state != SessionState::Uninitialized {
            return Err(Error::NotReady(self.state.as_str()));
        }
        self.state = SessionState::ResolvingFamilies;
        match self.init_inner(reactor) {
            Ok(()) => {
                self.state = SessionState::Ready;
                log::info!(
                    "[Session] Ready: nl80211 family {}, {} groups joined",
                    self.nl80211.as_ref().map_or(0, |f| f.id),
                    self.joined.len()
                );
                Ok(())
            }
            Err(e) => {
                log::error!("[Session] Initialization failed: {}", e);
                if let Some(events) = self.events.take() {
                    if events.fd_state().is_registered() {
                        reactor.unregister_read(events.fd());
                    }
                }
                self.command = None;
                self.nl80211 = None;
                self.ctrl = None;
                self.joined.clear();
                self.state = SessionState::Uninitialized;
                Err(e)
            }
        }
    }

    fn init_inner(&mut self, reactor: &mut dyn Reactor) -> Result<()> {
        let mut command = NlHandle::open(self.factory.as_mut(), SocketRole::Command, "command")?;
        let nl80211 = commands::get_family(&mut command, NL80211_GENL_NAME)?;
        let ctrl = commands::get_family(&mut command, GENL_CTRL_NAME)?;
        log::debug!("[Session] nl80211 id {} nlctrl id {}", nl80211.id, ctrl.id);
        self.command = Some(command);
        self.nl80211 = Some(nl80211);
        self.ctrl = Some(ctrl);

        let events = NlHandle::open(self.factory.as_mut(), SocketRole::Event, "events")?;
        self.events = Some(events);
        self.join_event_groups()?;

        if let Some(events) = self.events.as_mut() {
            reactor.register_read(events.fd(), ReadToken::GlobalEvents)?;
            events.mark_registered();
        }
        Ok(())
    }

    fn join_event_groups(&mut self) -> Result<()> {
        self.joined.clear();
        for (i, group) in EVENT_GROUPS.iter().enumerate() {
            match self.join_group(NL80211_GENL_NAME, group) {
                Ok(id) => self.joined.push((group, id)),
                Err(e) if i == 0 => {
                    log::error!("[Session] Could not join nl80211 group '{}': {}", group, e);
                    return Err(e);
                }
                Err(e) => {
                    log::warn!("[Session] Could not join nl80211 group '{}': {}", group, e);
                }
            }
        }
        match self.join_group(GENL_CTRL_NAME, CTRL_GROUP_NOTIFY) {
            Ok(id) => self.joined.push((CTRL_GROUP_NOTIFY, id)),
            Err(e) => log::warn!("[Session] Family reload detection unavailable: {}", e),
        }
        Ok(())
    }

    fn join_group(&mut self, family: &str, group: &str) -> Result<u32> {
        let id = self.resolve_multicast_group(family, group)?;
        let events = self.events.as_mut().ok_or(Error::NotReady(self.state.as_str()))?;
        events.add_membership(id)?;
        Ok(id)
    }

    /// Look up the numeric id of `group` in `family`.
    ///
    /// Usable while resolving and once ready. An unknown group is reported
    /// as `-ENOENT`.
    pub fn resolve_multicast_group(&mut self, family: &str, group: &str) -> Result<u32> {
        let command = self.command_for_resolution()?;
        let info = commands::get_family(command, family)?;
        info.group(group).ok_or_else(|| Error::Kernel {
            code: -libc::ENOENT,
            message: Some(format!("family {family} has no multicast group {group}")),
        })
    }

    fn command_for_resolution(&mut self) -> Result<&mut NlHandle> {
        match self.state {
            SessionState::ResolvingFamilies | SessionState::Ready => {}
            other => return Err(Error::NotReady(other.as_str())),
        }
        self.command.as_mut().ok_or(Error::NotReady("no command socket"))
    }

    /// nl80211 family id.
    pub fn family_id(&self) -> Result<u16> {
        self.ensure_ready()?;
        self.nl80211
            .as_ref()
            .map(|f| f.id)
            .ok_or(Error::NotReady(self.state.as_str()))
    }

    /// nlctrl family id (the fixed `GENL_ID_CTRL` in practice).
    pub fn ctrl_family_id(&self) -> Option<u16> {
        self.ctrl.as_ref().map(|f| f.id)
    }

    /// Resolved nl80211 family, including its groups.
    pub fn nl80211(&self) -> Option<&FamilyInfo> {
        self.nl80211.as_ref()
    }

    /// Groups joined on the event handle.
    pub fn joined_groups(&self) -> &[(&'static str, u32)] {
        &self.joined
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.state == SessionState::Ready {
            Ok(())
        } else {
            Err(Error::NotReady(self.state.as_str()))
        }
    }

    /// Command handle together with the nl80211 family id.
    pub fn command(&mut self) -> Result<(&mut NlHandle, u16)> {
        let family = self.family_id()?;
        let handle = self.command.as_mut().ok_or(Error::NotReady("no command socket"))?;
        Ok((handle, family))
    }

    /// Multicast event handle.
    pub fn events_mut(&mut self) -> Option<&mut NlHandle> {
        self.events.as_mut()
    }

    /// Open an auxiliary handle through the session's factory.
    pub fn open_handle(&mut self, role: SocketRole, label: impl Into<String>) -> Result<NlHandle> {
        self.ensure_ready()?;
        NlHandle::open(self.factory.as_mut(), role, label)
    }

    /// Schedule a deferred [`refresh_families`](Self::refresh_families).
    pub fn schedule_refresh(&self, reactor: &mut dyn Reactor) {
        log::info!(
            "[Session] Re-resolving nl80211 groups in {:?}",
            self.config.regroup_delay()
        );
        reactor.register_timeout(self.config.regroup_delay(), TimerToken::RegroupFamilies);
    }

    /// Re-resolve the nl80211 family and re-join every event group.
    pub fn refresh_families(&mut self) -> Result<()> {
        self.ensure_ready()?;
        let command = self.command.as_mut().ok_or(Error::NotReady("no command socket"))?;
        let nl80211 = commands::get_family(command, NL80211_GENL_NAME)?;
        if let Some(old) = &self.nl80211 {
            if old.id != nl80211.id {
                log::warn!("[Session] nl80211 family id changed {} -> {}", old.id, nl80211.id);
            }
        }
        self.nl80211 = Some(nl80211);

        let previous = std::mem::take(&mut self.joined);
        if let Some(events) = self.events.as_mut() {
            for (_, id) in &previous {
                if let Err(e) = events.drop_membership(*id) {
                    log::debug!("[Session] Dropping stale group {} failed: {}", id, e);
                }
            }
        }
        if let Err(e) = self.join_event_groups() {
            self.rejoin(previous);
            return Err(e);
        }
        Ok(())
    }

    /// Go back to the memberships held before a failed refresh.
    fn rejoin(&mut self, previous: Vec<(&'static str, u32)>) {
        let Some(events) = self.events.as_mut() else {
            return;
        };
        for (group, id) in previous {
            match events.add_membership(id) {
                Ok(()) => self.joined.push((group, id)),
                Err(e) => log::warn!("[Session] Could not rejoin group '{}' ({}): {}", group, id, e),
            }
        }
        log::warn!("[Session] Refresh failed, kept {} previous groups", self.joined.len());
    }

    /// Close both handles and stop watching the event descriptor.
    pub fn shutdown(&mut self, reactor: &mut dyn Reactor) {
        reactor.cancel_timeout(TimerToken::RegroupFamilies);
        if let Some(events) = self.events.take() {
            if events.fd_state().is_registered() {
                reactor.unregister_read(events.fd());
            }
        }
        self.command = None;
        self.joined.clear();
        self.state = SessionState::ShutDown;
        log::info!("[Session] Shut down");
    }
}
