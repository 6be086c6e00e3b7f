//! Request builders and reply parsers.
//!
//! Each function sends one request through [`crate::engine`] on the handle
//! it is given and parses the reply into a plain struct. The family id is
//! passed explicitly; it comes from the global session.

use crate::engine::{self, ErrorVerdict, Request};
use crate::error::{Error, Result};
use crate::netlink::attr::{AttrTable, AttrTree};
use crate::netlink::message::{GenlMsg, Message, NLM_F_DUMP};
use crate::netlink::socket::NlHandle;

use super::consts::*;
use super::MacAddr;

// ─── nlctrl ────────────────────────────────────────────────────────────────

/// One multicast group of a family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McastGroup {
    /// Group name, e.g. `scan`.
    pub name: String,
    /// Numeric id to join.
    pub id: u32,
}

/// A resolved generic-netlink family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyInfo {
    /// Family name as registered with nlctrl.
    pub name: String,
    /// Message type used for the family's requests.
    pub id: u16,
    /// Multicast groups the family offers.
    pub groups: Vec<McastGroup>,
}

impl FamilyInfo {
    /// Id of the group called `name`.
    pub fn group(&self, name: &str) -> Option<u32> {
        self.groups.iter().find(|g| g.name == name).map(|g| g.id)
    }
}

/// Parse a `CTRL_CMD_NEWFAMILY` payload (reply or notification).
pub fn parse_family(table: &AttrTable<'_>) -> Result<FamilyInfo> {
    let id = table
        .u16(CTRL_ATTR_FAMILY_ID)
        .ok_or_else(|| Error::Protocol("family reply without CTRL_ATTR_FAMILY_ID".into()))?;
    let name = table.str(CTRL_ATTR_FAMILY_NAME).unwrap_or_default().to_string();
    let groups = table
        .nested_array(CTRL_ATTR_MCAST_GROUPS)?
        .iter()
        .filter_map(|g| {
            Some(McastGroup {
                name: g.str(CTRL_ATTR_MCAST_GRP_NAME)?.to_string(),
                id: g.u32(CTRL_ATTR_MCAST_GRP_ID)?,
            })
        })
        .collect();
    Ok(FamilyInfo { name, id, groups })
}

/// Resolve a family by name through nlctrl.
pub fn get_family(handle: &mut NlHandle, name: &str) -> Result<FamilyInfo> {
    let mut msg = Message::build(GENL_ID_CTRL, CTRL_CMD_GETFAMILY, 0).with_version(GENL_CTRL_VERSION);
    msg.attrs_mut().put_str(CTRL_ATTR_FAMILY_NAME, name)?;

    let mut found = None;
    let req = Request::new(msg).on_valid(|genl| {
        found = Some(parse_family(&genl.table()?)?);
        Ok(())
    });
    engine::send(handle, req)?;
    found.ok_or_else(|| Error::Protocol(format!("no reply data for family {name}")))
}

// ─── Interfaces and wiphys ─────────────────────────────────────────────────

/// Fields of an nl80211 interface message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceInfo {
    /// Interface index, 0 when the message carried none.
    pub ifindex: u32,
    /// Interface name.
    pub ifname: Option<String>,
    /// Physical radio the interface lives on.
    pub wiphy: Option<u32>,
    /// `NL80211_IFTYPE_*` value.
    pub iftype: Option<u32>,
    /// Hardware address.
    pub mac: Option<MacAddr>,
    /// Wireless device id.
    pub wdev: Option<u64>,
    /// Operating frequency in MHz.
    pub freq: Option<u32>,
}

/// Parse an interface message (`GET_INTERFACE` reply, `NEW_INTERFACE`).
pub fn parse_interface(table: &AttrTable<'_>) -> InterfaceInfo {
    InterfaceInfo {
        ifindex: table.u32(NL80211_ATTR_IFINDEX).unwrap_or(0),
        ifname: table.str(NL80211_ATTR_IFNAME).map(str::to_string),
        wiphy: table.u32(NL80211_ATTR_WIPHY),
        iftype: table.u32(NL80211_ATTR_IFTYPE),
        mac: table.get(NL80211_ATTR_MAC).and_then(MacAddr::from_slice),
        wdev: table.u64(NL80211_ATTR_WDEV),
        freq: table.u32(NL80211_ATTR_WIPHY_FREQ),
    }
}

fn single_interface_reply(handle: &mut NlHandle, msg: Message) -> Result<InterfaceInfo> {
    let mut info = None;
    let req = Request::new(msg).on_valid(|genl| {
        info = Some(parse_interface(&genl.table()?));
        Ok(())
    });
    engine::send(handle, req)?;
    info.ok_or_else(|| Error::Protocol("interface request returned no data".into()))
}

/// Query one interface.
pub fn get_interface(handle: &mut NlHandle, family: u16, ifindex: u32) -> Result<InterfaceInfo> {
    let mut msg = Message::build(family, NL80211_CMD_GET_INTERFACE, 0);
    msg.attrs_mut().put_u32(NL80211_ATTR_IFINDEX, ifindex)?;
    single_interface_reply(handle, msg)
}

/// Set the interface type.
pub fn set_interface_type(handle: &mut NlHandle, family: u16, ifindex: u32, iftype: u32) -> Result<()> {
    let mut msg = Message::build(family, NL80211_CMD_SET_INTERFACE, 0);
    msg.attrs_mut().put_u32(NL80211_ATTR_IFINDEX, ifindex)?;
    msg.attrs_mut().put_u32(NL80211_ATTR_IFTYPE, iftype)?;
    engine::send_msg(handle, msg)
}

/// Create a virtual interface on `wiphy`.
pub fn new_interface(
    handle: &mut NlHandle,
    family: u16,
    wiphy: u32,
    ifname: &str,
    iftype: u32,
) -> Result<InterfaceInfo> {
    let mut msg = Message::build(family, NL80211_CMD_NEW_INTERFACE, 0);
    msg.attrs_mut().put_u32(NL80211_ATTR_WIPHY, wiphy)?;
    msg.attrs_mut().put_str(NL80211_ATTR_IFNAME, ifname)?;
    msg.attrs_mut().put_u32(NL80211_ATTR_IFTYPE, iftype)?;
    single_interface_reply(handle, msg)
}

/// Delete a virtual interface.
pub fn del_interface(handle: &mut NlHandle, family: u16, ifindex: u32) -> Result<()> {
    let mut msg = Message::build(family, NL80211_CMD_DEL_INTERFACE, 0);
    msg.attrs_mut().put_u32(NL80211_ATTR_IFINDEX, ifindex)?;
    engine::send_msg(handle, msg)
}

/// Radio capabilities the session layer cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WiphyCaps {
    /// Radio name, e.g. `phy0`.
    pub name: Option<String>,
    /// Bit `n` set when `NL80211_IFTYPE` `n` is supported.
    pub supported_iftypes: u32,
    /// The device runs the AP state machine itself.
    pub ap_sme: bool,
    /// Frames may be sent off the operating channel.
    pub offchannel_tx: bool,
    /// Most SSIDs one scan request may carry.
    pub max_scan_ssids: u8,
}

impl WiphyCaps {
    /// True if interfaces of `iftype` can be created.
    pub fn supports(&self, iftype: u32) -> bool {
        iftype < 32 && self.supported_iftypes & (1 << iftype) != 0
    }
}

/// Parse a `NEW_WIPHY` message.
pub fn parse_wiphy(table: &AttrTable<'_>) -> Result<WiphyCaps> {
    let mut supported_iftypes = 0;
    if let Some(types) = table.nested(NL80211_ATTR_SUPPORTED_IFTYPES)? {
        for attr in types.iter() {
            if attr.tag < 32 {
                supported_iftypes |= 1 << attr.tag;
            }
        }
    }
    Ok(WiphyCaps {
        name: table.str(NL80211_ATTR_WIPHY_NAME).map(str::to_string),
        supported_iftypes,
        ap_sme: table.has(NL80211_ATTR_DEVICE_AP_SME),
        offchannel_tx: table.has(NL80211_ATTR_OFFCHANNEL_TX_OK),
        max_scan_ssids: table.u8(NL80211_ATTR_MAX_NUM_SCAN_SSIDS).unwrap_or(0),
    })
}

/// Query one wiphy's capabilities.
pub fn get_wiphy(handle: &mut NlHandle, family: u16, wiphy: u32) -> Result<WiphyCaps> {
    let mut msg = Message::build(family, NL80211_CMD_GET_WIPHY, 0);
    msg.attrs_mut().put_u32(NL80211_ATTR_WIPHY, wiphy)?;
    let mut caps = None;
    let req = Request::new(msg).on_valid(|genl| {
        caps = Some(parse_wiphy(&genl.table()?)?);
        Ok(())
    });
    engine::send(handle, req)?;
    caps.ok_or_else(|| Error::Protocol(format!("no wiphy data for phy{wiphy}")))
}

// ─── Frames and rates ──────────────────────────────────────────────────────

/// Subscribe `handle` to management frames of `frame_type` whose body
/// starts with `match_prefix`.
///
/// `-EALREADY` (another socket holds the same subscription) is reported.
pub fn register_frame(
    handle: &mut NlHandle,
    family: u16,
    ifindex: u32,
    frame_type: u16,
    match_prefix: &[u8],
) -> Result<()> {
    let mut msg = Message::build(family, NL80211_CMD_REGISTER_FRAME, 0);
    msg.attrs_mut().put_u32(NL80211_ATTR_IFINDEX, ifindex)?;
    msg.attrs_mut().put_u16(NL80211_ATTR_FRAME_TYPE, frame_type)?;
    msg.attrs_mut().put(NL80211_ATTR_FRAME_MATCH, match_prefix)?;
    engine::send_msg(handle, msg)
}

/// Ask for beacons of `wiphy` on `handle`. Already-registered is success.
pub fn register_beacons(handle: &mut NlHandle, family: u16, wiphy: u32) -> Result<()> {
    let mut msg = Message::build(family, NL80211_CMD_REGISTER_BEACONS, 0);
    msg.attrs_mut().put_u32(NL80211_ATTR_WIPHY, wiphy)?;
    let req = Request::new(msg).on_error(|report| {
        if report.code == -libc::EALREADY {
            ErrorVerdict::Ignore
        } else {
            ErrorVerdict::Fail
        }
    });
    engine::send(handle, req)
}

/// Restrict 2.4 GHz legacy rates to OFDM (`ofdm_only`) or lift the mask.
pub fn set_legacy_rates(handle: &mut NlHandle, family: u16, ifindex: u32, ofdm_only: bool) -> Result<()> {
    let mut bands = AttrTree::new();
    if ofdm_only {
        let mut band = AttrTree::new();
        band.put(NL80211_TXRATE_LEGACY, OFDM_LEGACY_RATES)?;
        bands.put_nested(NL80211_BAND_2GHZ, band)?;
    }
    let mut msg = Message::build(family, NL80211_CMD_SET_TX_BITRATE_MASK, 0);
    msg.attrs_mut().put_u32(NL80211_ATTR_IFINDEX, ifindex)?;
    msg.attrs_mut().put_nested(NL80211_ATTR_TX_RATES, bands)?;
    engine::send_msg(handle, msg)
}

// ─── Scan results ──────────────────────────────────────────────────────────

/// One BSS from a scan dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    /// BSS address.
    pub bssid: MacAddr,
    /// Frequency in MHz.
    pub freq: u32,
    /// Timestamp from the last beacon or probe response.
    pub tsf: u64,
    /// Beacon interval in time units.
    pub beacon_interval: u16,
    /// Capability information field.
    pub capability: u16,
    /// Raw information elements.
    pub ies: Vec<u8>,
    /// Signal in mBm (100 × dBm).
    pub signal_mbm: i32,
    /// `NL80211_BSS_STATUS` (associated/authenticated/ibss joined).
    pub status: Option<u32>,
    /// Age of the entry in milliseconds.
    pub seen_ms_ago: u32,
}

impl ScanEntry {
    /// SSID from the information elements, if present and valid UTF-8.
    pub fn ssid(&self) -> Option<String> {
        let mut ies = self.ies.as_slice();
        while ies.len() >= 2 {
            let (id, len) = (ies[0], ies[1] as usize);
            let body = ies.get(2..2 + len)?;
            if id == 0 {
                return std::str::from_utf8(body).ok().map(str::to_string);
            }
            ies = &ies[2 + len..];
        }
        None
    }
}

/// Parse one `NEW_SCAN_RESULTS` dump part. Parts without a BSS nest are skipped.
pub fn parse_scan_entry(genl: &GenlMsg<'_>) -> Result<Option<ScanEntry>> {
    let table = genl.table()?;
    let Some(bss) = table.nested(NL80211_ATTR_BSS)? else {
        return Ok(None);
    };
    let Some(bssid) = bss.get(NL80211_BSS_BSSID).and_then(MacAddr::from_slice) else {
        return Ok(None);
    };
    Ok(Some(ScanEntry {
        bssid,
        freq: bss.u32(NL80211_BSS_FREQUENCY).unwrap_or(0),
        tsf: bss.u64(NL80211_BSS_TSF).unwrap_or(0),
        beacon_interval: bss.u16(NL80211_BSS_BEACON_INTERVAL).unwrap_or(0),
        capability: bss.u16(NL80211_BSS_CAPABILITY).unwrap_or(0),
        ies: bss.get(NL80211_BSS_INFORMATION_ELEMENTS).unwrap_or_default().to_vec(),
        signal_mbm: bss.i32(NL80211_BSS_SIGNAL_MBM).unwrap_or(0),
        status: bss.u32(NL80211_BSS_STATUS),
        seen_ms_ago: bss.u32(NL80211_BSS_SEEN_MS_AGO).unwrap_or(0),
    }))
}

/// Dump the scan results of `ifindex`, retrying interrupted dumps.
pub fn get_scan(handle: &mut NlHandle, family: u16, ifindex: u32, attempts: u32) -> Result<Vec<ScanEntry>> {
    engine::send_with_dump_retry(
        handle,
        attempts,
        || {
            let mut msg = Message::build(family, NL80211_CMD_GET_SCAN, NLM_F_DUMP);
            msg.attrs_mut().put_u32(NL80211_ATTR_IFINDEX, ifindex)?;
            Ok(msg)
        },
        parse_scan_entry,
    )
}
