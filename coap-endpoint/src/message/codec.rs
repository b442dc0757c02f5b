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

//! Low-level message codec.
//!
//! Wire layout per [IETF-RFC7252 Section 3](https://tools.ietf.org/html/rfc7252#section-3):
//! a four-byte fixed header (version, type, token length, code, message id),
//! the token, a delta-encoded option list, and an optional `0xFF`-marked
//! payload.

use super::*;
use crate::error::Error;
use crate::option::MAX_OPTION_VALUE_SIZE;

const COAP_VERSION: u8 = 1;

const PAYLOAD_MARKER: u8 = 0xFF;

/// Appends the delta/length header of one option, including any extended
/// bytes, but not the value itself.
fn encode_option_header(out: &mut Vec<u8>, delta: u16, value_len: usize) -> Result<(), Error> {
    if value_len > MAX_OPTION_VALUE_SIZE {
        return Err(Error::InvalidArgument);
    }

    fn nibble(value: usize) -> u8 {
        if value >= 269 {
            14
        } else if value >= 13 {
            13
        } else {
            value as u8
        }
    }

    let header_at = out.len();
    out.push(nibble(delta as usize) << 4 | nibble(value_len));

    for field in &[delta as usize, value_len] {
        match nibble(*field) {
            13 => out.push((*field - 13) as u8),
            14 => out.extend_from_slice(&((*field - 269) as u16).to_be_bytes()),
            _ => {}
        }
    }

    debug_assert_ne!(out[header_at], PAYLOAD_MARKER);
    Ok(())
}

/// Reads the extended form of one delta/length nibble.
///
/// * nibble in 0..=12 — the value itself, no bytes consumed.
/// * nibble 13 — one following byte, value + 13.
/// * nibble 14 — two following bytes, big-endian, value + 269.
/// * nibble 15 — reserved, format error.
fn decode_ext_field(nibble: u8, buffer: &[u8], at: &mut usize) -> Result<usize, Error> {
    match nibble {
        0..=12 => Ok(nibble as usize),
        13 => {
            let byte = *buffer.get(*at).ok_or(Error::Format)?;
            *at += 1;
            Ok(byte as usize + 13)
        }
        14 => {
            let bytes = buffer.get(*at..*at + 2).ok_or(Error::Format)?;
            *at += 2;
            Ok(((bytes[0] as usize) << 8 | bytes[1] as usize) + 269)
        }
        _ => Err(Error::Format),
    }
}

impl Message {
    /// Encodes this message into its datagram representation.
    ///
    /// Fails with [`Error::InvalidArgument`] if the message violates a model
    /// invariant: an empty code combined with a token, options, or a
    /// payload, or an oversized option value.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        if self.code().is_empty()
            && !(self.token().is_empty() && self.has_no_options() && self.payload().is_empty())
        {
            return Err(Error::InvalidArgument);
        }

        let mut out = Vec::with_capacity(4 + self.token().len() + self.payload().len() + 16);

        out.push(
            (COAP_VERSION << 6) | ((self.msg_type() as u8) << 4) | (self.token().len() as u8),
        );
        out.push(self.code() as u8);
        out.extend_from_slice(&self.msg_id().to_be_bytes());
        out.extend_from_slice(self.token().as_bytes());

        let mut prev = OptionNumber(0);
        for (number, value) in self.options() {
            // The list is maintained sorted, so the delta never underflows.
            encode_option_header(&mut out, number - prev, value.len())?;
            out.extend_from_slice(value);
            prev = number;
        }

        if !self.payload().is_empty() {
            out.push(PAYLOAD_MARKER);
            out.extend_from_slice(self.payload());
        }

        Ok(out)
    }

    /// Decodes a message from its datagram representation.
    pub fn decode(buffer: &[u8]) -> Result<Message, Error> {
        if buffer.len() < 4 {
            return Err(Error::Format);
        }

        if buffer[0] >> 6 != COAP_VERSION {
            return Err(Error::Format);
        }

        let msg_type = MsgType::try_from((buffer[0] >> 4) & 0b11).ok_or(Error::Format)?;
        let code = MsgCode::try_from(buffer[1]).ok_or(Error::Format)?;
        let msg_id = u16::from_be_bytes([buffer[2], buffer[3]]);

        let token_len = (buffer[0] & 0xF) as usize;
        if token_len > MsgToken::MAX_LEN {
            return Err(Error::Format);
        }
        let token_bytes = buffer.get(4..4 + token_len).ok_or(Error::Format)?;
        let token = MsgToken::try_new(token_bytes).ok_or(Error::Format)?;

        let mut msg = Message::new(msg_type, code);
        msg.set_msg_id(msg_id);
        msg.set_token(token);

        let mut at = 4 + token_len;
        let mut prev: u16 = 0;

        while at < buffer.len() {
            let header = buffer[at];
            at += 1;

            if header == PAYLOAD_MARKER {
                // A payload marker followed by a zero-length payload is a
                // format error.
                if at == buffer.len() {
                    return Err(Error::Format);
                }
                msg.set_payload(&buffer[at..]);
                at = buffer.len();
                break;
            }

            let delta = decode_ext_field(header >> 4, buffer, &mut at)?;
            let value_len = decode_ext_field(header & 0xF, buffer, &mut at)?;

            // Don't let the option number wrap.
            let number = (prev as usize)
                .checked_add(delta)
                .filter(|n| *n <= u16::MAX as usize)
                .ok_or(Error::Format)? as u16;
            let value = buffer.get(at..at + value_len).ok_or(Error::Format)?;
            at += value_len;

            msg.insert_option(OptionNumber(number), value.to_vec());
            prev = number;
        }

        if code.is_empty()
            && !(token.is_empty() && msg.has_no_options() && msg.payload().is_empty())
        {
            return Err(Error::Format);
        }

        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etag::ETag;

    #[test]
    fn encode_empty_con() {
        let mut msg = Message::new(MsgType::Con, MsgCode::Empty);
        msg.set_msg_id(0);
        assert_eq!(msg.encode().unwrap(), vec![0x40, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn decode_empty_con() {
        let msg = Message::decode(&[0x40, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(msg.msg_type(), MsgType::Con);
        assert_eq!(msg.msg_id(), 0);
        assert_eq!(msg.code(), MsgCode::Empty);
        assert!(msg.token().is_empty());
        assert!(msg.payload().is_empty());
    }

    #[test]
    fn encode_piggybacked_ack_with_etag() {
        let mut msg = Message::new(MsgType::Ack, MsgCode::SuccessContent);
        msg.set_msg_id(0xBC90);
        msg.set_token(MsgToken::from(&b"q"[..]));
        msg.add_etag(ETag::try_new(b"abcd").unwrap());
        msg.set_payload(&b"temp = 22.5 C"[..]);

        let expected: Vec<u8> = [
            &[0x61u8, 0x45, 0xBC, 0x90, 0x71, 0x44][..],
            b"abcd",
            &[0xFF],
            b"temp = 22.5 C",
        ]
        .concat();

        assert_eq!(msg.encode().unwrap(), expected);
    }

    #[test]
    fn decode_piggybacked_ack_with_etag() {
        let raw: Vec<u8> = [
            &[0x61u8, 0x45, 0xBC, 0x90, 0x71, 0x44][..],
            b"abcd",
            &[0xFF],
            b"temp = 22.5 C",
        ]
        .concat();

        let msg = Message::decode(&raw).unwrap();
        assert_eq!(msg.msg_type(), MsgType::Ack);
        assert_eq!(msg.msg_id(), 0xBC90);
        assert_eq!(msg.code(), MsgCode::SuccessContent);
        assert_eq!(msg.token().as_bytes(), b"q");
        assert_eq!(msg.payload(), b"temp = 22.5 C");
        assert_eq!(msg.etags(), vec![ETag::try_new(b"abcd").unwrap()]);
        assert_eq!(msg.options().count(), 1);
    }

    #[test]
    fn encode_rejects_nonempty_empty_code() {
        let mut msg = Message::new(MsgType::Con, MsgCode::Empty);
        msg.set_token(MsgToken::from(&b"q"[..]));
        assert_eq!(msg.encode(), Err(Error::InvalidArgument));
    }

    #[test]
    fn round_trip_with_options_and_payload() {
        let mut msg = Message::request(MsgCode::MethodPost);
        msg.set_msg_id(0x1234);
        msg.set_token(MsgToken::from(&[1, 2, 3, 4, 5, 6, 7, 8][..]));
        msg.set_uri_path(&["sensors", "temperature"]);
        msg.set_uri_queries(&["unit=c"]);
        msg.set_option_uint(OptionNumber::CONTENT_FORMAT, 0);
        msg.set_observe(0x123456);
        msg.set_payload(&b"22.5"[..]);

        let encoded = msg.encode().unwrap();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);

        // Re-encoding is byte-stable.
        assert_eq!(decoded.encode().unwrap(), encoded);
    }

    #[test]
    fn round_trip_extended_option_fields() {
        // Option number 300 needs a two-byte delta extension; a 20-byte value
        // needs a one-byte length extension; 300 bytes needs two.
        let mut msg = Message::request(MsgCode::MethodGet);
        msg.set_msg_id(7);
        msg.insert_option(OptionNumber(300), vec![0xAB; 20]);
        msg.insert_option(OptionNumber(2000), vec![0xCD; 300]);

        let encoded = msg.encode().unwrap();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn extended_field_values() {
        let mut at = 0;
        assert_eq!(decode_ext_field(0, b"aaaa", &mut at), Ok(0));
        assert_eq!(at, 0);

        at = 0;
        assert_eq!(decode_ext_field(12, b"aaaa", &mut at), Ok(12));
        assert_eq!(at, 0);

        at = 0;
        assert_eq!(decode_ext_field(13, b"aaaa", &mut at), Ok(110));
        assert_eq!(at, 1);

        at = 0;
        assert_eq!(decode_ext_field(14, b"aaaa", &mut at), Ok(25198));
        assert_eq!(at, 2);

        at = 0;
        assert_eq!(decode_ext_field(13, b"", &mut at), Err(Error::Format));
        at = 0;
        assert_eq!(decode_ext_field(14, b"a", &mut at), Err(Error::Format));
        at = 0;
        assert_eq!(decode_ext_field(15, b"aaaa", &mut at), Err(Error::Format));
    }

    #[test]
    fn uint_leading_zeros_are_normalized() {
        // An Observe value hand-encoded with a leading zero byte decodes to
        // the same integer, but re-encodes trimmed.
        let raw = [0x40, 0x01, 0x00, 0x07, 0x62, 0x00, 0x05];
        let msg = Message::decode(&raw).unwrap();
        assert_eq!(msg.observe(), Some(5));

        let mut normalized = msg.clone();
        normalized.set_observe(5);
        assert_ne!(normalized.encode().unwrap(), raw);
        assert_eq!(
            Message::decode(&normalized.encode().unwrap()).unwrap().observe(),
            Some(5)
        );
    }

    #[test]
    fn decode_rejects_malformed_input() {
        // Truncated header.
        assert_eq!(Message::decode(&[0x40, 0x01]), Err(Error::Format));
        // Wrong version.
        assert_eq!(Message::decode(&[0x00, 0x01, 0x00, 0x01]), Err(Error::Format));
        // Token length over eight.
        assert_eq!(Message::decode(&[0x49, 0x01, 0x00, 0x01]), Err(Error::Format));
        // Token runs past the end of the datagram.
        assert_eq!(Message::decode(&[0x42, 0x01, 0x00, 0x01, 0x61]), Err(Error::Format));
        // Payload marker with nothing after it.
        assert_eq!(Message::decode(&[0x40, 0x01, 0x00, 0x01, 0xFF]), Err(Error::Format));
        // Reserved delta nibble inside an option header.
        assert_eq!(Message::decode(&[0x40, 0x01, 0x00, 0x01, 0xF0]), Err(Error::Format));
        // Option value runs past the end of the datagram.
        assert_eq!(Message::decode(&[0x40, 0x01, 0x00, 0x01, 0xB3, 0x61]), Err(Error::Format));
        // Empty message code with a token.
        assert_eq!(Message::decode(&[0x41, 0x00, 0x00, 0x01, 0x61]), Err(Error::Format));
    }
}
