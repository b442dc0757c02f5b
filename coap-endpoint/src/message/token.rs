// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use core::ops::Deref;

/// Type for holding the value of a CoAP message token: zero to eight bytes,
/// stored inline.
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone, Ord, PartialOrd)]
pub struct MsgToken {
    len: u8,
    bytes: [u8; MsgToken::MAX_LEN],
}

impl MsgToken {
    /// The largest token the wire format can carry.
    pub const MAX_LEN: usize = 8;

    /// Constant representing an empty token.
    pub const EMPTY: MsgToken = MsgToken {
        len: 0u8,
        bytes: [0; MsgToken::MAX_LEN],
    };

    /// Creates a new token from the given byte slice, returning `None` if the
    /// slice is longer than [`MsgToken::MAX_LEN`].
    pub fn try_new(x: &[u8]) -> Option<MsgToken> {
        if x.len() > MsgToken::MAX_LEN {
            return None;
        }
        let mut bytes = [0u8; MsgToken::MAX_LEN];
        bytes[..x.len()].copy_from_slice(x);
        Some(MsgToken {
            len: x.len() as u8,
            bytes,
        })
    }

    /// Returns the length of this token.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Returns true if the length of this token is zero.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns a byte slice containing this token.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl std::fmt::Display for MsgToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.as_bytes() {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

impl Default for MsgToken {
    fn default() -> Self {
        MsgToken::EMPTY
    }
}

impl Deref for MsgToken {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_bytes()
    }
}

impl core::cmp::PartialEq<[u8]> for MsgToken {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_bytes() == other
    }
}

impl core::convert::From<u64> for MsgToken {
    fn from(x: u64) -> Self {
        MsgToken::try_new(&x.to_be_bytes()).unwrap()
    }
}

impl core::convert::From<u16> for MsgToken {
    fn from(x: u16) -> Self {
        if x == 0 {
            return MsgToken::EMPTY;
        }
        let bytes = x.to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        MsgToken::try_new(&bytes[skip..]).unwrap()
    }
}

/// Creating a token from a slice panics if the slice is longer than eight
/// bytes; use [`MsgToken::try_new`] for untrusted input.
impl core::convert::From<&[u8]> for MsgToken {
    fn from(x: &[u8]) -> Self {
        MsgToken::try_new(x).expect("token too long")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds() {
        assert!(MsgToken::try_new(&[0u8; 9]).is_none());
        assert_eq!(MsgToken::try_new(&[0u8; 8]).unwrap().len(), 8);
        assert!(MsgToken::EMPTY.is_empty());
    }

    #[test]
    fn display_hex() {
        let token = MsgToken::from(&b"q"[..]);
        assert_eq!(token.to_string(), "71");
        assert_eq!(token.as_bytes(), b"q");
    }
}
