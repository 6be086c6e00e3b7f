//! Upward event notifications.
//!
//! Dispatch turns kernel messages into [`DriverEvent`]s and hands them to an
//! [`EventSink`] synchronously, from inside the reactor read callback. The
//! sink must not block and must not assume any ordering relative to request
//! completions.

use crate::nl80211::MacAddr;
use crate::session::radio::RadioId;

/// Which MLME step a kernel notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum MlmeKind {
    Authenticate,
    Associate,
    Deauthenticate,
    Disassociate,
    UnprotectedDeauthenticate,
    UnprotectedDisassociate,
}

/// Event delivered to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum DriverEvent {
    InterfaceAdded {
        radio: RadioId,
        ifindex: u32,
        ifname: Option<String>,
    },
    InterfaceRemoved {
        radio: RadioId,
        ifindex: u32,
    },
    InterfaceEnabled {
        radio: RadioId,
        ifindex: u32,
    },
    InterfaceDisabled {
        radio: RadioId,
        ifindex: u32,
    },
    MacChanged {
        radio: RadioId,
        ifindex: u32,
        mac: MacAddr,
    },
    /// Management frame delivered through a subscription.
    FrameReceived {
        radio: RadioId,
        ifindex: u32,
        frame: Vec<u8>,
        freq: Option<u32>,
        signal_dbm: Option<i32>,
    },
    /// Beacon from the shared radio listener.
    BeaconReceived {
        radio: RadioId,
        frame: Vec<u8>,
        freq: Option<u32>,
        signal_dbm: Option<i32>,
    },
    FrameTxStatus {
        radio: RadioId,
        ifindex: u32,
        cookie: Option<u64>,
        acked: bool,
        frame: Vec<u8>,
    },
    ScanStarted {
        radio: RadioId,
    },
    ScanResults {
        radio: RadioId,
    },
    ScanAborted {
        radio: RadioId,
    },
    Mlme {
        radio: RadioId,
        kind: MlmeKind,
        addr: Option<MacAddr>,
        frame: Option<Vec<u8>>,
        timed_out: bool,
    },
    /// Connect or roam result. `status` 0 is success.
    Connected {
        radio: RadioId,
        bssid: Option<MacAddr>,
        status: u16,
        roamed: bool,
        req_ie: Vec<u8>,
        resp_ie: Vec<u8>,
    },
    Disconnected {
        radio: RadioId,
        reason: u16,
        by_ap: bool,
    },
    ChannelSwitch {
        radio: RadioId,
        freq: u32,
        width: Option<u32>,
        center_freq1: Option<u32>,
        center_freq2: Option<u32>,
        started: bool,
    },
    RegulatoryChange {
        radio: RadioId,
        alpha2: Option<String>,
        initiator: Option<u8>,
    },
    BeaconHint {
        radio: RadioId,
    },
    StationAdded {
        radio: RadioId,
        addr: MacAddr,
    },
    StationRemoved {
        radio: RadioId,
        addr: MacAddr,
    },
    MichaelMicFailure {
        radio: RadioId,
        addr: Option<MacAddr>,
    },
    RemainOnChannel {
        radio: RadioId,
        freq: Option<u32>,
        cookie: Option<u64>,
        cancelled: bool,
    },
    SignalChange {
        radio: RadioId,
        rssi_event: Option<u32>,
        packet_loss: Option<u32>,
    },
    Vendor {
        radio: RadioId,
        vendor_id: u32,
        subcmd: u32,
        data: Vec<u8>,
    },
    PortAuthorized {
        radio: RadioId,
        bssid: Option<MacAddr>,
    },
    /// A scan requested for a failed authentication finished; the consumer
    /// should retry authentication with the stored parameters.
    AuthRetry {
        radio: RadioId,
        bssid: MacAddr,
    },
}

impl DriverEvent {
    /// Radio the event belongs to.
    pub fn radio(&self) -> RadioId {
        match self {
            Self::InterfaceAdded { radio, .. }
            | Self::InterfaceRemoved { radio, .. }
            | Self::InterfaceEnabled { radio, .. }
            | Self::InterfaceDisabled { radio, .. }
            | Self::MacChanged { radio, .. }
            | Self::FrameReceived { radio, .. }
            | Self::BeaconReceived { radio, .. }
            | Self::FrameTxStatus { radio, .. }
            | Self::ScanStarted { radio }
            | Self::ScanResults { radio }
            | Self::ScanAborted { radio }
            | Self::Mlme { radio, .. }
            | Self::Connected { radio, .. }
            | Self::Disconnected { radio, .. }
            | Self::ChannelSwitch { radio, .. }
            | Self::RegulatoryChange { radio, .. }
            | Self::BeaconHint { radio }
            | Self::StationAdded { radio, .. }
            | Self::StationRemoved { radio, .. }
            | Self::MichaelMicFailure { radio, .. }
            | Self::RemainOnChannel { radio, .. }
            | Self::SignalChange { radio, .. }
            | Self::Vendor { radio, .. }
            | Self::PortAuthorized { radio, .. }
            | Self::AuthRetry { radio, .. } => *radio,
        }
    }
}

/// Consumer of driver events.
pub trait EventSink {
    /// Deliver one event.
    fn emit(&mut self, event: DriverEvent);
}

impl EventSink for Vec<DriverEvent> {
    fn emit(&mut self, event: DriverEvent) {
        self.push(event);
    }
}

/// Link state reported by the OS interface layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkChange {
    /// Interface index.
    pub ifindex: u32,
    /// Administrative/operational up.
    pub up: bool,
    /// Current hardware address, when the notification carries one.
    pub mac: Option<MacAddr>,
}
