//! Tagged, length-prefixed attribute trees.
//!
//! Every netlink attribute on the wire is:
//!
//! ```text
//! [u16 NE nla_len] [u16 NE nla_type] [payload: nla_len-4 bytes] [pad to 4]
//! ```
//!
//! `nla_len` covers the 4-byte header plus the payload but not the padding.
//! The two top bits of `nla_type` are flags (`NLA_F_NESTED`,
//! `NLA_F_NET_BYTEORDER`); the remaining 14 bits are the tag.
//!
//! Building goes through [`AttrTree`], an owned, ordered list that tracks
//! its encoded size as it grows so an oversized tree is rejected at `put`
//! time rather than producing a truncated length field. Parsing goes through
//! [`AttrTable`], a borrowed view over a received payload where the first
//! occurrence of a tag is authoritative.

use zeroize::Zeroize;

use crate::error::{Error, Result};

/// Size of the attribute header (`nla_len` + `nla_type`).
pub const NLA_HDRLEN: usize = 4;

/// Attribute alignment on the wire.
pub const NLA_ALIGNTO: usize = 4;

/// Flag bit marking an attribute whose payload is itself an attribute list.
pub const NLA_F_NESTED: u16 = 1 << 15;

/// Flag bit marking a payload in network byte order.
pub const NLA_F_NET_BYTEORDER: u16 = 1 << 14;

/// Mask extracting the tag from `nla_type`.
pub const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

/// Largest encoded tree accepted by [`AttrTree`].
///
/// A tree is either nested inside an attribute (whose `nla_len` is a u16) or
/// is the top-level payload; both are held to the 16-bit limit.
pub const MAX_TREE_LEN: usize = u16::MAX as usize;

/// Round `len` up to the attribute alignment.
pub const fn nla_align(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

// ─── Building ──────────────────────────────────────────────────────────────

/// Value carried by one attribute in an [`AttrTree`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    /// Opaque payload bytes (integers are stored native-endian).
    Bytes(Vec<u8>),
    /// Nested attribute list.
    Nested(AttrTree),
}

/// One `(tag, value)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    /// Attribute tag (flags stripped).
    pub tag: u16,
    /// Attribute payload.
    pub value: AttrValue,
}

/// Ordered attribute tree under construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttrTree {
    attrs: Vec<Attr>,
    encoded_len: usize,
}

impl AttrTree {
    /// Empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encoded size of the tree in bytes, including padding.
    pub fn encoded_len(&self) -> usize {
        self.encoded_len
    }

    /// Number of top-level attributes.
    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    /// True if no attribute has been added.
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// Top-level attributes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Attr> {
        self.attrs.iter()
    }

    /// True if any top-level attribute carries one of `tags`.
    pub fn contains_any(&self, tags: &[u16]) -> bool {
        self.attrs.iter().any(|a| tags.contains(&a.tag))
    }

    fn reserve_attr(&self, tag: u16, payload_len: usize) -> Result<usize> {
        if tag & !NLA_TYPE_MASK != 0 {
            return Err(Error::Build(format!("attribute tag {tag:#x} overlaps flag bits")));
        }
        let attr_len = NLA_HDRLEN + payload_len;
        if attr_len > MAX_TREE_LEN {
            return Err(Error::Build(format!(
                "attribute {tag} payload of {payload_len} bytes exceeds the 16-bit length field"
            )));
        }
        let total = self.encoded_len + nla_align(attr_len);
        if total > MAX_TREE_LEN {
            return Err(Error::Build(format!(
                "attribute tree would grow to {total} bytes (max {MAX_TREE_LEN})"
            )));
        }
        Ok(total)
    }

    /// Append an attribute with an opaque payload.
    ///
    /// Fails without modifying the tree if the encoded size would overflow
    /// the 16-bit length field.
    pub fn put(&mut self, tag: u16, payload: &[u8]) -> Result<()> {
        let total = self.reserve_attr(tag, payload.len())?;
        self.attrs.push(Attr {
            tag,
            value: AttrValue::Bytes(payload.to_vec()),
        });
        self.encoded_len = total;
        Ok(())
    }

    /// Append a nested attribute list.
    pub fn put_nested(&mut self, tag: u16, nested: AttrTree) -> Result<()> {
        let total = self.reserve_attr(tag, nested.encoded_len())?;
        self.attrs.push(Attr {
            tag,
            value: AttrValue::Nested(nested),
        });
        self.encoded_len = total;
        Ok(())
    }

    /// Append a `u8` attribute.
    pub fn put_u8(&mut self, tag: u16, value: u8) -> Result<()> {
        self.put(tag, &[value])
    }

    /// Append a native-endian `u16` attribute.
    pub fn put_u16(&mut self, tag: u16, value: u16) -> Result<()> {
        self.put(tag, &value.to_ne_bytes())
    }

    /// Append a native-endian `u32` attribute.
    pub fn put_u32(&mut self, tag: u16, value: u32) -> Result<()> {
        self.put(tag, &value.to_ne_bytes())
    }

    /// Append a native-endian `u64` attribute.
    pub fn put_u64(&mut self, tag: u16, value: u64) -> Result<()> {
        self.put(tag, &value.to_ne_bytes())
    }

    /// Append a zero-length flag attribute.
    pub fn put_flag(&mut self, tag: u16) -> Result<()> {
        self.put(tag, &[])
    }

    /// Append a NUL-terminated string attribute.
    pub fn put_str(&mut self, tag: u16, value: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(value.len() + 1);
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
        self.put(tag, &bytes)
    }

    /// Serialize the tree, appending to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.reserve(self.encoded_len);
        for attr in &self.attrs {
            let (flags, payload_len) = match &attr.value {
                AttrValue::Bytes(b) => (0, b.len()),
                AttrValue::Nested(t) => (NLA_F_NESTED, t.encoded_len()),
            };
            let nla_len = (NLA_HDRLEN + payload_len) as u16;
            out.extend_from_slice(&nla_len.to_ne_bytes());
            out.extend_from_slice(&(attr.tag | flags).to_ne_bytes());
            match &attr.value {
                AttrValue::Bytes(b) => out.extend_from_slice(b),
                AttrValue::Nested(t) => t.encode_into(out),
            }
            let pad = nla_align(payload_len) - payload_len;
            out.extend(std::iter::repeat(0u8).take(pad));
        }
    }

    /// Serialize the tree into a fresh buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len);
        self.encode_into(&mut out);
        out
    }

    /// Zero every payload byte in the tree, recursively.
    ///
    /// Tags and lengths are left intact; only values are cleared.
    pub fn wipe(&mut self) {
        for attr in &mut self.attrs {
            match &mut attr.value {
                AttrValue::Bytes(b) => b.zeroize(),
                AttrValue::Nested(t) => t.wipe(),
            }
        }
    }

    /// True if every payload byte in the tree is zero.
    pub fn is_wiped(&self) -> bool {
        self.attrs.iter().all(|a| match &a.value {
            AttrValue::Bytes(b) => b.iter().all(|&x| x == 0),
            AttrValue::Nested(t) => t.is_wiped(),
        })
    }
}

// ─── Parsing ───────────────────────────────────────────────────────────────

/// One attribute as it appears in a received buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawAttr<'a> {
    /// Tag with flag bits stripped.
    pub tag: u16,
    /// Whether `NLA_F_NESTED` was set.
    pub nested: bool,
    /// Payload without header or padding.
    pub payload: &'a [u8],
}

/// Iterator over the attributes in a buffer.
///
/// Yields an error and stops at the first malformed header. Trailing bytes
/// shorter than a header are ignored, as the kernel may pad the payload.
#[derive(Debug, Clone)]
pub struct AttrIter<'a> {
    buf: &'a [u8],
    failed: bool,
}

impl<'a> AttrIter<'a> {
    /// Iterate the attributes in `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, failed: false }
    }
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = Result<RawAttr<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.buf.len() < NLA_HDRLEN {
            return None;
        }
        let nla_len = u16::from_ne_bytes([self.buf[0], self.buf[1]]) as usize;
        let nla_type = u16::from_ne_bytes([self.buf[2], self.buf[3]]);
        if nla_len < NLA_HDRLEN || nla_len > self.buf.len() {
            self.failed = true;
            return Some(Err(Error::Protocol(format!(
                "attribute length {nla_len} invalid with {} bytes remaining",
                self.buf.len()
            ))));
        }
        let attr = RawAttr {
            tag: nla_type & NLA_TYPE_MASK,
            nested: nla_type & NLA_F_NESTED != 0,
            payload: &self.buf[NLA_HDRLEN..nla_len],
        };
        let advance = nla_align(nla_len).min(self.buf.len());
        self.buf = &self.buf[advance..];
        Some(Ok(attr))
    }
}

/// Tag → value lookup over a received attribute buffer.
#[derive(Debug, Clone, Default)]
pub struct AttrTable<'a> {
    entries: Vec<RawAttr<'a>>,
}

impl<'a> AttrTable<'a> {
    /// Parse every attribute in `buf`.
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        let entries = AttrIter::new(buf).collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    /// Number of attributes, duplicates included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the buffer held no attributes.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All attributes in wire order.
    pub fn iter(&self) -> impl Iterator<Item = &RawAttr<'a>> {
        self.entries.iter()
    }

    /// First attribute with this tag.
    pub fn raw(&self, tag: u16) -> Option<&RawAttr<'a>> {
        self.entries.iter().find(|a| a.tag == tag)
    }

    /// Payload of the first attribute with this tag.
    pub fn get(&self, tag: u16) -> Option<&'a [u8]> {
        self.raw(tag).map(|a| a.payload)
    }

    /// True if the tag is present (flag attributes).
    pub fn has(&self, tag: u16) -> bool {
        self.raw(tag).is_some()
    }

    /// `u8` value, if present and long enough.
    pub fn u8(&self, tag: u16) -> Option<u8> {
        self.get(tag).and_then(|p| p.first().copied())
    }

    /// Native-endian `u16` value.
    pub fn u16(&self, tag: u16) -> Option<u16> {
        self.get(tag)
            .and_then(|p| p.get(..2))
            .map(|b| u16::from_ne_bytes([b[0], b[1]]))
    }

    /// Native-endian `u32` value.
    pub fn u32(&self, tag: u16) -> Option<u32> {
        self.get(tag)
            .and_then(|p| p.get(..4))
            .and_then(|b| b.try_into().ok())
            .map(u32::from_ne_bytes)
    }

    /// Native-endian `i32` value.
    pub fn i32(&self, tag: u16) -> Option<i32> {
        self.u32(tag).map(|v| v as i32)
    }

    /// Native-endian `u64` value.
    pub fn u64(&self, tag: u16) -> Option<u64> {
        self.get(tag)
            .and_then(|p| p.get(..8))
            .and_then(|b| b.try_into().ok())
            .map(u64::from_ne_bytes)
    }

    /// String value with any trailing NUL bytes removed.
    pub fn str(&self, tag: u16) -> Option<&'a str> {
        let payload = self.get(tag)?;
        let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
        std::str::from_utf8(&payload[..end]).ok()
    }

    /// Parse the payload of `tag` as a nested attribute list.
    pub fn nested(&self, tag: u16) -> Result<Option<AttrTable<'a>>> {
        match self.get(tag) {
            Some(payload) => AttrTable::parse(payload).map(Some),
            None => Ok(None),
        }
    }

    /// Iterate a nested array: the payload of `tag` holds a list of
    /// attributes whose own payloads are attribute lists (the tags of the
    /// elements are indices and carry no meaning).
    pub fn nested_array(&self, tag: u16) -> Result<Vec<AttrTable<'a>>> {
        let Some(payload) = self.get(tag) else {
            return Ok(Vec::new());
        };
        AttrIter::new(payload)
            .map(|elem| elem.and_then(|e| AttrTable::parse(e.payload)))
            .collect()
    }
}
