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

/// A type representing the value of an ETag option: one to eight opaque
/// bytes, stored inline.
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone, Ord, PartialOrd)]
pub struct ETag {
    len: u8,
    bytes: [u8; ETag::MAX_LEN],
}

impl ETag {
    /// The largest ETag value the option can carry.
    pub const MAX_LEN: usize = 8;

    /// Creates an `ETag` from the given byte slice, returning `None` when
    /// the slice is empty or longer than [`ETag::MAX_LEN`].
    pub fn try_new(x: &[u8]) -> Option<ETag> {
        if x.is_empty() || x.len() > ETag::MAX_LEN {
            return None;
        }
        let mut bytes = [0u8; ETag::MAX_LEN];
        bytes[..x.len()].copy_from_slice(x);
        Some(ETag {
            len: x.len() as u8,
            bytes,
        })
    }

    /// Returns the length of this ETag, in bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Returns a byte slice containing this ETag's value.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl std::fmt::Display for ETag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.as_bytes() {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}
