//! nl80211 and nlctrl vocabulary.
//!
//! - `consts`: command, attribute and group numbering
//! - `commands`: the handful of request builders and reply parsers the
//!   session layer needs (family resolution, interface type, frame
//!   registration, scan dump)

pub mod commands;
pub mod consts;

use std::fmt;

/// 48-bit hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Take the first six bytes of an attribute payload.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.get(..6).and_then(|b| b.try_into().ok()).map(Self)
    }

    /// All-zero address.
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_display_and_parse() {
        let mac = MacAddr::from_slice(&[0x02, 0, 0, 0xab, 0xcd, 0xef, 0xff]).unwrap();
        assert_eq!(mac.to_string(), "02:00:00:ab:cd:ef");
        assert!(MacAddr::from_slice(&[1, 2]).is_none());
        assert!(MacAddr::default().is_zero());
    }
}
