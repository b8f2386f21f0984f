/*
Copyright 2025 The Ringeth Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use core::fmt;
use core::str::FromStr;

use thiserror::Error;

/// Shortest frame the MAC puts on the wire, FCS excluded. Shorter frames are
/// zero padded before transmission.
pub const MIN_FRAME_LEN: usize = 64;

/// Receive buffer size and largest accepted frame without jumbo frames.
pub const MAX_FRAME_LEN: usize = 1536;

pub const MIN_MTU: usize = 64;
pub const MAX_MTU: usize = 1500;
pub const MAX_JUMBO_MTU: usize = 4096;

/// Ethernet header, VLAN tag, FCS and DMA alignment slack on top of the MTU.
pub const FRAME_OVERHEAD: usize = 36;

/// Largest accepted frame with jumbo frames enabled.
pub const MAX_JUMBO_FRAME_LEN: usize = MAX_JUMBO_MTU + FRAME_OVERHEAD;

/// Frame length needed for a given MTU, never below [`MAX_FRAME_LEN`].
pub const fn frame_len_for_mtu(mtu: usize) -> usize {
    let needed = mtu + FRAME_OVERHEAD;
    if needed < MAX_FRAME_LEN {
        MAX_FRAME_LEN
    } else {
        needed
    }
}

/// Organizationally unique prefix used for generated station addresses.
pub const FALLBACK_MAC_PREFIX: [u8; 5] = [0x00, 0x0c, 0x43, 0x28, 0x80];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid MAC address")]
pub struct ParseMacError;

/// A 48 bit station address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const ZERO: MacAddress = MacAddress([0; 6]);
    pub const BROADCAST: MacAddress = MacAddress([0xff; 6]);

    /// Address from the fallback prefix and a caller-chosen last byte.
    pub const fn with_fallback_prefix(last: u8) -> Self {
        let p = FALLBACK_MAC_PREFIX;
        MacAddress([p[0], p[1], p[2], p[3], p[4], last])
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// Usable as a station address: unicast and not all zeros.
    pub fn is_valid_unicast(&self) -> bool {
        !self.is_zero() && !self.is_multicast()
    }

    /// Split into the `(hi, lo)` register pair: bytes 0-1 and bytes 2-5.
    pub fn to_register_pair(&self) -> (u32, u32) {
        let b = self.0;
        let hi = u32::from(b[0]) << 8 | u32::from(b[1]);
        let lo = u32::from_be_bytes([b[2], b[3], b[4], b[5]]);
        (hi, lo)
    }

    pub fn from_register_pair(hi: u32, lo: u32) -> Self {
        let l = lo.to_be_bytes();
        MacAddress([(hi >> 8) as u8, hi as u8, l[0], l[1], l[2], l[3]])
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for byte in out.iter_mut() {
            let part = parts.next().ok_or(ParseMacError)?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(ParseMacError);
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| ParseMacError)?;
        }
        if parts.next().is_some() {
            return Err(ParseMacError);
        }
        Ok(MacAddress(out))
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(b: [u8; 6]) -> Self {
        MacAddress(b)
    }
}
