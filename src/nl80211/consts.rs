//! nl80211 and nlctrl numbering.
//!
//! Values match `include/uapi/linux/nl80211.h` and
//! `include/uapi/linux/genetlink.h`. Only the subset the transport core and
//! its event dispatch touch is listed.

#![allow(missing_docs)]

// ============================================================================
// nlctrl
// ============================================================================

pub const NETLINK_GENERIC: i32 = 16;

pub const GENL_ID_CTRL: u16 = 0x10;
pub const GENL_CTRL_NAME: &str = "nlctrl";
pub const GENL_CTRL_VERSION: u8 = 1;

pub const CTRL_CMD_NEWFAMILY: u8 = 1;
pub const CTRL_CMD_DELFAMILY: u8 = 2;
pub const CTRL_CMD_GETFAMILY: u8 = 3;

pub const CTRL_ATTR_FAMILY_ID: u16 = 1;
pub const CTRL_ATTR_FAMILY_NAME: u16 = 2;
pub const CTRL_ATTR_MCAST_GROUPS: u16 = 7;

pub const CTRL_ATTR_MCAST_GRP_NAME: u16 = 1;
pub const CTRL_ATTR_MCAST_GRP_ID: u16 = 2;

/// nlctrl multicast group announcing family registration changes.
pub const CTRL_GROUP_NOTIFY: &str = "notify";

// ============================================================================
// nl80211 family and groups
// ============================================================================

pub const NL80211_GENL_NAME: &str = "nl80211";

pub const NL80211_MULTICAST_GROUP_SCAN: &str = "scan";
pub const NL80211_MULTICAST_GROUP_MLME: &str = "mlme";
pub const NL80211_MULTICAST_GROUP_REG: &str = "regulatory";
pub const NL80211_MULTICAST_GROUP_VENDOR: &str = "vendor";

/// Groups the event handle joins, in order. Only the first is mandatory.
pub const EVENT_GROUPS: [&str; 4] = [
    NL80211_MULTICAST_GROUP_SCAN,
    NL80211_MULTICAST_GROUP_MLME,
    NL80211_MULTICAST_GROUP_REG,
    NL80211_MULTICAST_GROUP_VENDOR,
];

// ============================================================================
// nl80211 commands
// ============================================================================

pub const NL80211_CMD_GET_WIPHY: u8 = 1;
pub const NL80211_CMD_NEW_WIPHY: u8 = 3;
pub const NL80211_CMD_GET_INTERFACE: u8 = 5;
pub const NL80211_CMD_SET_INTERFACE: u8 = 6;
pub const NL80211_CMD_NEW_INTERFACE: u8 = 7;
pub const NL80211_CMD_DEL_INTERFACE: u8 = 8;
pub const NL80211_CMD_NEW_STATION: u8 = 19;
pub const NL80211_CMD_DEL_STATION: u8 = 20;
pub const NL80211_CMD_GET_SCAN: u8 = 32;
pub const NL80211_CMD_TRIGGER_SCAN: u8 = 33;
pub const NL80211_CMD_NEW_SCAN_RESULTS: u8 = 34;
pub const NL80211_CMD_SCAN_ABORTED: u8 = 35;
pub const NL80211_CMD_REG_CHANGE: u8 = 36;
pub const NL80211_CMD_AUTHENTICATE: u8 = 37;
pub const NL80211_CMD_ASSOCIATE: u8 = 38;
pub const NL80211_CMD_DEAUTHENTICATE: u8 = 39;
pub const NL80211_CMD_DISASSOCIATE: u8 = 40;
pub const NL80211_CMD_MICHAEL_MIC_FAILURE: u8 = 41;
pub const NL80211_CMD_REG_BEACON_HINT: u8 = 42;
pub const NL80211_CMD_CONNECT: u8 = 46;
pub const NL80211_CMD_ROAM: u8 = 47;
pub const NL80211_CMD_DISCONNECT: u8 = 48;
pub const NL80211_CMD_REMAIN_ON_CHANNEL: u8 = 55;
pub const NL80211_CMD_CANCEL_REMAIN_ON_CHANNEL: u8 = 56;
pub const NL80211_CMD_SET_TX_BITRATE_MASK: u8 = 57;
pub const NL80211_CMD_REGISTER_FRAME: u8 = 58;
pub const NL80211_CMD_FRAME: u8 = 59;
pub const NL80211_CMD_FRAME_TX_STATUS: u8 = 60;
pub const NL80211_CMD_NOTIFY_CQM: u8 = 64;
pub const NL80211_CMD_UNPROT_DEAUTHENTICATE: u8 = 70;
pub const NL80211_CMD_UNPROT_DISASSOCIATE: u8 = 71;
pub const NL80211_CMD_REGISTER_BEACONS: u8 = 85;
pub const NL80211_CMD_CH_SWITCH_NOTIFY: u8 = 88;
pub const NL80211_CMD_CONN_FAILED: u8 = 91;
pub const NL80211_CMD_VENDOR: u8 = 103;
pub const NL80211_CMD_CH_SWITCH_STARTED_NOTIFY: u8 = 110;
pub const NL80211_CMD_WIPHY_REG_CHANGE: u8 = 113;
pub const NL80211_CMD_PORT_AUTHORIZED: u8 = 125;

// ============================================================================
// nl80211 attributes
// ============================================================================

pub const NL80211_ATTR_WIPHY: u16 = 1;
pub const NL80211_ATTR_WIPHY_NAME: u16 = 2;
pub const NL80211_ATTR_IFINDEX: u16 = 3;
pub const NL80211_ATTR_IFNAME: u16 = 4;
pub const NL80211_ATTR_IFTYPE: u16 = 5;
pub const NL80211_ATTR_MAC: u16 = 6;
pub const NL80211_ATTR_KEY_DATA: u16 = 7;
pub const NL80211_ATTR_KEY_SEQ: u16 = 10;
pub const NL80211_ATTR_SUPPORTED_IFTYPES: u16 = 32;
pub const NL80211_ATTR_REG_ALPHA2: u16 = 33;
pub const NL80211_ATTR_WIPHY_FREQ: u16 = 38;
pub const NL80211_ATTR_MAX_NUM_SCAN_SSIDS: u16 = 43;
pub const NL80211_ATTR_GENERATION: u16 = 46;
pub const NL80211_ATTR_BSS: u16 = 47;
pub const NL80211_ATTR_REG_INITIATOR: u16 = 48;
pub const NL80211_ATTR_REG_TYPE: u16 = 49;
pub const NL80211_ATTR_FRAME: u16 = 51;
pub const NL80211_ATTR_SSID: u16 = 52;
pub const NL80211_ATTR_REASON_CODE: u16 = 54;
pub const NL80211_ATTR_TIMED_OUT: u16 = 65;
pub const NL80211_ATTR_DISCONNECTED_BY_AP: u16 = 71;
pub const NL80211_ATTR_STATUS_CODE: u16 = 72;
pub const NL80211_ATTR_REQ_IE: u16 = 77;
pub const NL80211_ATTR_RESP_IE: u16 = 78;
pub const NL80211_ATTR_KEY: u16 = 80;
pub const NL80211_ATTR_KEYS: u16 = 81;
pub const NL80211_ATTR_COOKIE: u16 = 88;
pub const NL80211_ATTR_TX_RATES: u16 = 90;
pub const NL80211_ATTR_FRAME_MATCH: u16 = 91;
pub const NL80211_ATTR_ACK: u16 = 92;
pub const NL80211_ATTR_CQM: u16 = 94;
pub const NL80211_ATTR_FRAME_TYPE: u16 = 101;
pub const NL80211_ATTR_OFFCHANNEL_TX_OK: u16 = 108;
pub const NL80211_ATTR_REKEY_DATA: u16 = 122;
pub const NL80211_ATTR_DEVICE_AP_SME: u16 = 141;
pub const NL80211_ATTR_FEATURE_FLAGS: u16 = 143;
pub const NL80211_ATTR_RX_SIGNAL_DBM: u16 = 151;
pub const NL80211_ATTR_WDEV: u16 = 153;
pub const NL80211_ATTR_CHANNEL_WIDTH: u16 = 159;
pub const NL80211_ATTR_CENTER_FREQ1: u16 = 160;
pub const NL80211_ATTR_CENTER_FREQ2: u16 = 161;
pub const NL80211_ATTR_VENDOR_ID: u16 = 195;
pub const NL80211_ATTR_VENDOR_SUBCMD: u16 = 196;
pub const NL80211_ATTR_VENDOR_DATA: u16 = 197;
pub const NL80211_ATTR_SOCKET_OWNER: u16 = 204;
pub const NL80211_ATTR_FILS_KEK: u16 = 242;
pub const NL80211_ATTR_PMK: u16 = 254;
pub const NL80211_ATTR_PMKR0_NAME: u16 = 258;

/// Top-level attributes that may carry symmetric keys or PSK material.
pub const KEY_MATERIAL_ATTRS: &[u16] = &[
    NL80211_ATTR_KEY_DATA,
    NL80211_ATTR_KEY_SEQ,
    NL80211_ATTR_KEY,
    NL80211_ATTR_KEYS,
    NL80211_ATTR_REKEY_DATA,
    NL80211_ATTR_FILS_KEK,
    NL80211_ATTR_PMK,
    NL80211_ATTR_PMKR0_NAME,
];

// Nested in NL80211_ATTR_BSS
pub const NL80211_BSS_BSSID: u16 = 1;
pub const NL80211_BSS_FREQUENCY: u16 = 2;
pub const NL80211_BSS_TSF: u16 = 3;
pub const NL80211_BSS_BEACON_INTERVAL: u16 = 4;
pub const NL80211_BSS_CAPABILITY: u16 = 5;
pub const NL80211_BSS_INFORMATION_ELEMENTS: u16 = 6;
pub const NL80211_BSS_SIGNAL_MBM: u16 = 7;
pub const NL80211_BSS_STATUS: u16 = 9;
pub const NL80211_BSS_SEEN_MS_AGO: u16 = 10;

// Nested in NL80211_ATTR_CQM
pub const NL80211_ATTR_CQM_RSSI_THRESHOLD_EVENT: u16 = 2;
pub const NL80211_ATTR_CQM_PKT_LOSS_EVENT: u16 = 4;

// Nested in NL80211_ATTR_TX_RATES
pub const NL80211_BAND_2GHZ: u16 = 0;
pub const NL80211_TXRATE_LEGACY: u16 = 1;

/// 2.4 GHz OFDM rates in 500 kbps units (6, 9, 12, 18, 24, 36, 48, 54 Mbps).
pub const OFDM_LEGACY_RATES: &[u8] = &[0x0c, 0x12, 0x18, 0x24, 0x30, 0x48, 0x60, 0x6c];

// ============================================================================
// Interface types
// ============================================================================

pub const NL80211_IFTYPE_UNSPECIFIED: u32 = 0;
pub const NL80211_IFTYPE_ADHOC: u32 = 1;
pub const NL80211_IFTYPE_STATION: u32 = 2;
pub const NL80211_IFTYPE_AP: u32 = 3;
pub const NL80211_IFTYPE_AP_VLAN: u32 = 4;
pub const NL80211_IFTYPE_WDS: u32 = 5;
pub const NL80211_IFTYPE_MONITOR: u32 = 6;
pub const NL80211_IFTYPE_MESH_POINT: u32 = 7;
pub const NL80211_IFTYPE_P2P_CLIENT: u32 = 8;
pub const NL80211_IFTYPE_P2P_GO: u32 = 9;
pub const NL80211_IFTYPE_P2P_DEVICE: u32 = 10;
pub const NL80211_IFTYPE_OCB: u32 = 11;
pub const NL80211_IFTYPE_NAN: u32 = 12;

// ============================================================================
// 802.11 management frame subtypes (frame control, little endian on air)
// ============================================================================

pub const WLAN_FC_ASSOC_REQ: u16 = 0x0000;
pub const WLAN_FC_REASSOC_REQ: u16 = 0x0020;
pub const WLAN_FC_PROBE_REQ: u16 = 0x0040;
pub const WLAN_FC_BEACON: u16 = 0x0080;
pub const WLAN_FC_DISASSOC: u16 = 0x00a0;
pub const WLAN_FC_AUTH: u16 = 0x00b0;
pub const WLAN_FC_DEAUTH: u16 = 0x00c0;
pub const WLAN_FC_ACTION: u16 = 0x00d0;

// Action frame category codes used as match prefixes
pub const WLAN_ACTION_PUBLIC: u8 = 0x04;
pub const WLAN_ACTION_RADIO_MEASUREMENT: u8 = 0x05;
pub const WLAN_ACTION_FT: u8 = 0x06;
pub const WLAN_ACTION_SA_QUERY: u8 = 0x08;
pub const WLAN_ACTION_WNM: u8 = 0x0a;
