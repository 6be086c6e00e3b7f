//! Netlink and generic-netlink framing.
//!
//! A request is a [`Message`]: family id, command, flags and an
//! [`AttrTree`]. The sequence number and port are only known when the
//! message is sent, so they are supplied to [`Message::encode`].
//!
//! Received datagrams are split by [`parse_datagram`] into owned
//! [`NlMessage`]s, which classify themselves via [`NlMessage::kind`].

use zeroize::Zeroizing;

use super::attr::{nla_align, AttrTable, AttrTree};
use crate::error::{Error, Result};
use crate::nl80211::consts::KEY_MATERIAL_ATTRS;

/// Size of `struct nlmsghdr`.
pub const NLMSG_HDRLEN: usize = 16;

/// Size of `struct genlmsghdr`.
pub const GENL_HDRLEN: usize = 4;

/// No-op message.
pub const NLMSG_NOOP: u16 = 0x1;
/// Ack or error report.
pub const NLMSG_ERROR: u16 = 0x2;
/// End of a multi-part reply.
pub const NLMSG_DONE: u16 = 0x3;
/// Data lost to a full receive buffer.
pub const NLMSG_OVERRUN: u16 = 0x4;

/// Request message.
pub const NLM_F_REQUEST: u16 = 0x01;
/// Part of a multi-part reply.
pub const NLM_F_MULTI: u16 = 0x02;
/// Ask for an ack.
pub const NLM_F_ACK: u16 = 0x04;
/// Echo the request.
pub const NLM_F_ECHO: u16 = 0x08;
/// The dump was interrupted by a change and is inconsistent.
pub const NLM_F_DUMP_INTR: u16 = 0x10;

/// Return the whole table (GET modifier).
pub const NLM_F_ROOT: u16 = 0x100;
/// Return all matches (GET modifier).
pub const NLM_F_MATCH: u16 = 0x200;
/// Dump request.
pub const NLM_F_DUMP: u16 = NLM_F_ROOT | NLM_F_MATCH;

/// Error report carries only the request header.
pub const NLM_F_CAPPED: u16 = 0x100;
/// Error report carries extended-ack attributes.
pub const NLM_F_ACK_TLVS: u16 = 0x200;

/// Extended-ack error text.
pub const NLMSGERR_ATTR_MSG: u16 = 1;
/// Extended-ack offset of the offending attribute.
pub const NLMSGERR_ATTR_OFFS: u16 = 2;

/// Write a complete netlink message (header plus payload, padded).
pub fn encode_nlmsg(msg_type: u16, flags: u16, seq: u32, pid: u32, payload: &[u8]) -> Vec<u8> {
    let len = NLMSG_HDRLEN + payload.len();
    let mut out = Vec::with_capacity(nla_align(len));
    out.extend_from_slice(&(len as u32).to_ne_bytes());
    out.extend_from_slice(&msg_type.to_ne_bytes());
    out.extend_from_slice(&flags.to_ne_bytes());
    out.extend_from_slice(&seq.to_ne_bytes());
    out.extend_from_slice(&pid.to_ne_bytes());
    out.extend_from_slice(payload);
    out.resize(nla_align(len), 0);
    out
}

// ─── Outgoing ──────────────────────────────────────────────────────────────

/// A generic-netlink request under construction.
///
/// Messages carrying key material are zeroed on drop. A message is treated
/// as sensitive when it was marked explicitly or when any top-level
/// attribute is one of the known key-carrying nl80211 tags.
#[derive(Debug)]
pub struct Message {
    family: u16,
    cmd: u8,
    version: u8,
    flags: u16,
    attrs: AttrTree,
    sensitive: bool,
}

impl Message {
    /// Start a request for `family`/`cmd`.
    ///
    /// `NLM_F_REQUEST` and `NLM_F_ACK` are always set so every exchange ends
    /// in an ack, an error or (for dumps) `NLMSG_DONE`.
    pub fn build(family: u16, cmd: u8, flags: u16) -> Self {
        Self {
            family,
            cmd,
            version: 0,
            flags: flags | NLM_F_REQUEST | NLM_F_ACK,
            attrs: AttrTree::new(),
            sensitive: false,
        }
    }

    /// Override the generic-netlink version byte (nlctrl expects 1).
    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    /// Family id this message is addressed to.
    pub fn family(&self) -> u16 {
        self.family
    }

    /// Generic-netlink command.
    pub fn cmd(&self) -> u8 {
        self.cmd
    }

    /// Netlink header flags.
    pub fn flags(&self) -> u16 {
        self.flags
    }

    /// True for dump requests.
    pub fn is_dump(&self) -> bool {
        self.flags & NLM_F_DUMP == NLM_F_DUMP
    }

    /// Attribute tree (read-only).
    pub fn attrs(&self) -> &AttrTree {
        &self.attrs
    }

    /// Attribute tree for appending.
    pub fn attrs_mut(&mut self) -> &mut AttrTree {
        &mut self.attrs
    }

    /// Flag the message as carrying secrets regardless of its tags.
    pub fn mark_sensitive(&mut self) {
        self.sensitive = true;
    }

    /// Whether the payload must be wiped once the exchange completes.
    pub fn is_sensitive(&self) -> bool {
        self.sensitive || self.attrs.contains_any(KEY_MATERIAL_ATTRS)
    }

    /// Zero every attribute payload.
    pub fn wipe(&mut self) {
        self.attrs.wipe();
    }

    /// Encode with the given sequence number and sender port.
    ///
    /// The returned buffer zeroes itself on drop, since it holds a copy of
    /// any key material in the tree.
    pub fn encode(&self, seq: u32, port: u32) -> Zeroizing<Vec<u8>> {
        let mut payload = Zeroizing::new(Vec::with_capacity(GENL_HDRLEN + self.attrs.encoded_len()));
        payload.push(self.cmd);
        payload.push(self.version);
        payload.extend_from_slice(&0u16.to_ne_bytes());
        self.attrs.encode_into(&mut payload);
        Zeroizing::new(encode_nlmsg(self.family, self.flags, seq, port, &payload))
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if self.is_sensitive() {
            self.attrs.wipe();
        }
    }
}

// ─── Incoming ──────────────────────────────────────────────────────────────

/// Decoded `struct nlmsghdr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct NlHeader {
    pub len: u32,
    pub msg_type: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
}

impl NlHeader {
    fn parse(buf: &[u8]) -> Option<Self> {
        let word = |at: usize| -> Option<u32> {
            buf.get(at..at + 4)
                .and_then(|b| b.try_into().ok())
                .map(u32::from_ne_bytes)
        };
        let half = |at: usize| -> Option<u16> {
            buf.get(at..at + 2).map(|b| u16::from_ne_bytes([b[0], b[1]]))
        };
        Some(Self {
            len: word(0)?,
            msg_type: half(4)?,
            flags: half(6)?,
            seq: word(8)?,
            pid: word(12)?,
        })
    }
}

/// Contents of an `NLMSG_ERROR` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    /// 0 for an ack, negative errno otherwise.
    pub code: i32,
    /// Sequence number of the request being answered.
    pub request_seq: u32,
    /// `NLMSGERR_ATTR_MSG` text.
    pub ext_msg: Option<String>,
    /// `NLMSGERR_ATTR_OFFS`: byte offset of the offending attribute.
    pub ext_offset: Option<u32>,
}

impl ErrorReport {
    /// Convert a non-zero report into the library error.
    pub fn into_error(self) -> Error {
        Error::Kernel {
            code: self.code,
            message: self.ext_msg,
        }
    }
}

/// Generic-netlink data message view.
#[derive(Debug, Clone, Copy)]
pub struct GenlMsg<'a> {
    /// Family command.
    pub cmd: u8,
    /// Family version.
    pub version: u8,
    /// Attribute bytes after the generic header.
    pub attrs: &'a [u8],
}

impl<'a> GenlMsg<'a> {
    /// Parse the attribute payload.
    pub fn table(&self) -> Result<AttrTable<'a>> {
        AttrTable::parse(self.attrs)
    }
}

/// Classification of a received message.
#[derive(Debug, Clone)]
pub enum MsgKind<'a> {
    /// Nothing to do.
    Noop,
    /// Ack (code 0) or kernel error.
    Error(ErrorReport),
    /// End of a multi-part dump. A negative code reports a dump failure.
    Done(i32),
    /// The socket receive buffer overflowed and messages were dropped.
    Overrun,
    /// Family data message.
    Data(GenlMsg<'a>),
}

/// One netlink message taken from a datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NlMessage {
    /// Decoded netlink header.
    pub header: NlHeader,
    /// Everything after the header.
    pub payload: Vec<u8>,
}

impl NlMessage {
    /// True if the kernel flagged this dump part as inconsistent.
    pub fn is_dump_interrupted(&self) -> bool {
        self.header.flags & NLM_F_DUMP_INTR != 0
    }

    /// True if this is one part of a multi-part reply.
    pub fn is_multi(&self) -> bool {
        self.header.flags & NLM_F_MULTI != 0
    }

    /// Classify the message.
    pub fn kind(&self) -> Result<MsgKind<'_>> {
        match self.header.msg_type {
            NLMSG_NOOP => Ok(MsgKind::Noop),
            NLMSG_OVERRUN => Ok(MsgKind::Overrun),
            NLMSG_ERROR => parse_error(self.header.flags, &self.payload).map(MsgKind::Error),
            NLMSG_DONE => {
                let code = self
                    .payload
                    .get(..4)
                    .and_then(|b| b.try_into().ok())
                    .map(i32::from_ne_bytes)
                    .unwrap_or(0);
                Ok(MsgKind::Done(code))
            }
            _ => self.genl().map(MsgKind::Data),
        }
    }

    /// Generic-netlink view of a data message.
    pub fn genl(&self) -> Result<GenlMsg<'_>> {
        if self.payload.len() < GENL_HDRLEN {
            return Err(Error::Protocol(format!(
                "data message type {} too short for genlmsghdr ({} bytes)",
                self.header.msg_type,
                self.payload.len()
            )));
        }
        Ok(GenlMsg {
            cmd: self.payload[0],
            version: self.payload[1],
            attrs: &self.payload[GENL_HDRLEN..],
        })
    }
}

fn parse_error(flags: u16, payload: &[u8]) -> Result<ErrorReport> {
    let code = payload
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .map(i32::from_ne_bytes)
        .ok_or_else(|| Error::Protocol("truncated NLMSG_ERROR".into()))?;
    let orig = payload
        .get(4..)
        .and_then(NlHeader::parse)
        .ok_or_else(|| Error::Protocol("NLMSG_ERROR missing original header".into()))?;

    let mut report = ErrorReport {
        code,
        request_seq: orig.seq,
        ext_msg: None,
        ext_offset: None,
    };

    if flags & NLM_F_ACK_TLVS != 0 {
        // Without CAPPED the whole original request is echoed back before the TLVs.
        let echoed = if flags & NLM_F_CAPPED != 0 {
            NLMSG_HDRLEN
        } else {
            nla_align(orig.len as usize)
        };
        if let Some(tlvs) = payload.get(4 + echoed..) {
            let table = AttrTable::parse(tlvs)?;
            report.ext_msg = table.str(NLMSGERR_ATTR_MSG).map(str::to_string);
            report.ext_offset = table.u32(NLMSGERR_ATTR_OFFS);
        }
    }
    Ok(report)
}

/// Split a received datagram into messages.
pub fn parse_datagram(buf: &[u8]) -> Result<Vec<NlMessage>> {
    let mut out = Vec::new();
    let mut rest = buf;
    while rest.len() >= NLMSG_HDRLEN {
        let header = NlHeader::parse(rest)
            .ok_or_else(|| Error::Protocol("truncated nlmsghdr".into()))?;
        let len = header.len as usize;
        if len < NLMSG_HDRLEN || len > rest.len() {
            return Err(Error::Protocol(format!(
                "message length {len} invalid with {} bytes remaining",
                rest.len()
            )));
        }
        out.push(NlMessage {
            header,
            payload: rest[NLMSG_HDRLEN..len].to_vec(),
        });
        rest = &rest[nla_align(len).min(rest.len())..];
    }
    Ok(out)
}

/// Build the payload of an `NLMSG_ERROR` reply to `request`.
///
/// Used by the scripted transport; the kernel builds these for real sockets.
pub fn encode_error_payload(code: i32, request: &NlHeader, ext_msg: Option<&str>) -> Result<(u16, Vec<u8>)> {
    let mut payload = Vec::with_capacity(4 + NLMSG_HDRLEN);
    payload.extend_from_slice(&code.to_ne_bytes());
    payload.extend_from_slice(&request.len.to_ne_bytes());
    payload.extend_from_slice(&request.msg_type.to_ne_bytes());
    payload.extend_from_slice(&request.flags.to_ne_bytes());
    payload.extend_from_slice(&request.seq.to_ne_bytes());
    payload.extend_from_slice(&request.pid.to_ne_bytes());
    let mut flags = NLM_F_CAPPED;
    if let Some(text) = ext_msg {
        let mut tlvs = AttrTree::new();
        tlvs.put_str(NLMSGERR_ATTR_MSG, text)?;
        tlvs.encode_into(&mut payload);
        flags |= NLM_F_ACK_TLVS;
    }
    Ok((flags, payload))
}

/// Parse only the header of an encoded request.
pub fn peek_header(buf: &[u8]) -> Option<NlHeader> {
    NlHeader::parse(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let mut msg = Message::build(0x1c, 6, 0);
        msg.attrs_mut().put_u32(3, 4).unwrap();
        let bytes = msg.encode(77, 1234);

        let header = peek_header(&bytes).unwrap();
        assert_eq!(header.len as usize, bytes.len());
        assert_eq!(header.msg_type, 0x1c);
        assert_eq!(header.flags, NLM_F_REQUEST | NLM_F_ACK);
        assert_eq!(header.seq, 77);
        assert_eq!(header.pid, 1234);
        assert_eq!(bytes[NLMSG_HDRLEN], 6);
        assert_eq!(bytes.len(), NLMSG_HDRLEN + GENL_HDRLEN + 8);
    }

    #[test]
    fn test_parse_datagram_with_two_messages() {
        let mut a = Message::build(0x1c, 7, 0);
        a.attrs_mut().put_str(4, "wlan1").unwrap();
        let b = Message::build(0x1c, 8, 0);
        let mut buf = a.encode(1, 0).to_vec();
        buf.extend_from_slice(&b.encode(2, 0));

        let msgs = parse_datagram(&buf).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].header.seq, 1);
        match msgs[0].kind().unwrap() {
            MsgKind::Data(genl) => {
                assert_eq!(genl.cmd, 7);
                assert_eq!(genl.table().unwrap().str(4), Some("wlan1"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(msgs[1].genl().unwrap().cmd, 8);
    }

    #[test]
    fn test_parse_datagram_rejects_bad_length() {
        let msg = Message::build(0x1c, 7, 0);
        let mut buf = msg.encode(1, 0).to_vec();
        buf[0] = 200;
        assert!(parse_datagram(&buf).is_err());
    }

    #[test]
    fn test_error_with_ext_ack_text() {
        let request = Message::build(0x1c, 6, NLM_F_ACK);
        let req_header = peek_header(&request.encode(9, 55)).unwrap();
        let (flags, payload) =
            encode_error_payload(-libc::EINVAL, &req_header, Some("missing attribute")).unwrap();
        let raw = encode_nlmsg(NLMSG_ERROR, flags, 9, 0, &payload);

        let msgs = parse_datagram(&raw).unwrap();
        match msgs[0].kind().unwrap() {
            MsgKind::Error(report) => {
                assert_eq!(report.code, -libc::EINVAL);
                assert_eq!(report.request_seq, 9);
                assert_eq!(report.ext_msg.as_deref(), Some("missing attribute"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_ack_without_tlvs() {
        let request = Message::build(0x1c, 6, NLM_F_ACK);
        let req_header = peek_header(&request.encode(3, 0)).unwrap();
        let (flags, payload) = encode_error_payload(0, &req_header, None).unwrap();
        let raw = encode_nlmsg(NLMSG_ERROR, flags, 3, 0, &payload);
        match parse_datagram(&raw).unwrap()[0].kind().unwrap() {
            MsgKind::Error(report) => {
                assert_eq!(report.code, 0);
                assert!(report.ext_msg.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_done_and_dump_intr_flag() {
        let raw = encode_nlmsg(NLMSG_DONE, NLM_F_MULTI | NLM_F_DUMP_INTR, 4, 0, &0i32.to_ne_bytes());
        let msg = &parse_datagram(&raw).unwrap()[0];
        assert!(msg.is_dump_interrupted());
        assert!(matches!(msg.kind().unwrap(), MsgKind::Done(0)));
    }

    #[test]
    fn test_key_attribute_marks_message_sensitive() {
        let mut msg = Message::build(0x1c, 11, 0);
        assert!(!msg.is_sensitive());
        msg.attrs_mut()
            .put(crate::nl80211::consts::NL80211_ATTR_KEY_DATA, &[0x5a; 16])
            .unwrap();
        assert!(msg.is_sensitive());
        msg.wipe();
        assert!(msg.attrs().is_wiped());
    }
}
