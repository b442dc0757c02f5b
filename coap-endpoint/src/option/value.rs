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

/// Type describing the kind of value an option carries.
#[derive(Debug, Copy, Eq, PartialEq, Hash, Clone)]
pub enum OptionValueType {
    /// Option value is determined by the presence or absence of the option.
    Empty,

    /// Opaque option value.
    Opaque,

    /// UTF8 string value.
    String,

    /// Unsigned integer value, big-endian with leading zeros trimmed.
    Uint,

    /// Integer value containing a `ContentFormat`.
    ContentFormat,

    /// Integer value containing a `BlockInfo`.
    Block,
}

/// Encodes an unsigned 32-bit number as a CoAP uint option value.
///
/// The returned vector holds the big-endian representation with all leading
/// zero bytes trimmed; zero encodes to an empty vector.
pub fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    bytes[skip..].to_vec()
}

/// Attempts to decode the given big-endian-encoded integer to a `u32`.
/// Input may be up to four bytes long; an empty input decodes to zero.
/// If the input is larger than four bytes long, returns `None`.
pub fn try_decode_u32(src: &[u8]) -> Option<u32> {
    if src.len() > 4 {
        return None;
    }
    Some(src.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32))
}

/// Attempts to decode the given big-endian-encoded integer to a `u16`.
/// Input may be up to two bytes long; an empty input decodes to zero.
/// If the input is larger than two bytes long, returns `None`.
pub fn try_decode_u16(src: &[u8]) -> Option<u16> {
    if src.len() > 2 {
        return None;
    }
    Some(src.iter().fold(0u16, |acc, &b| (acc << 8) | b as u16))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uint_encode() {
        let cases: &[(u32, &[u8])] = &[
            (0, &[]),
            (1, &[1]),
            (2, &[2]),
            (40, &[40]),
            (50, &[50]),
            (255, &[255]),
            (256, &[1, 0]),
            (1000, &[3, 232]),
        ];
        for (value, expected) in cases {
            assert_eq!(encode_uint(*value), *expected, "value: {}", value);
        }
    }

    #[test]
    fn uint_decode() {
        for value in &[0u32, 1, 2, 40, 50, 255, 256, 1000, 0xFFFF, 0x1_0000, 0xFFFF_FFFF] {
            assert_eq!(try_decode_u32(&encode_uint(*value)), Some(*value));
        }
        assert_eq!(try_decode_u32(&[0; 5]), None);
        assert_eq!(try_decode_u16(&[0; 3]), None);
        assert_eq!(try_decode_u16(&[3, 232]), Some(1000));
    }

    #[test]
    fn uint_encoded_length() {
        // Encoded length is always ceil(bit_length/8).
        for value in &[0u32, 1, 255, 256, 1000, 0xFFFF, 0x10000, 0xFFFFFF, 0x1000000] {
            let expected = (32 - value.leading_zeros() as usize + 7) / 8;
            assert_eq!(encode_uint(*value).len(), expected, "value: {}", value);
        }
    }
}
