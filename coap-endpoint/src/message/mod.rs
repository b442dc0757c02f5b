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

//! The CoAP message model and its wire codec.

mod msg_type;
pub use msg_type::MsgType;

mod msg_code;
pub use msg_code::{MsgCode, MsgCodeClass};

mod token;
pub use token::MsgToken;

mod codec;

use crate::block::BlockInfo;
use crate::content_format::ContentFormat;
use crate::etag::ETag;
use crate::option::{encode_uint, try_decode_u32, OptionNumber};

/// Type alias for the 16-bit CoAP message id.
pub type MsgId = u16;

/// An owned CoAP message: type, code, message id, token, a sorted option
/// list, and the payload.
///
/// The peer address is not part of the message; it travels alongside the
/// message through the endpoint API, since its concrete type belongs to the
/// socket in use.
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct Message {
    msg_type: MsgType,
    code: MsgCode,
    msg_id: MsgId,
    token: MsgToken,
    options: Vec<(OptionNumber, Vec<u8>)>,
    payload: Vec<u8>,
}

impl Message {
    /// Creates a new message with the given type and code and no other content.
    pub fn new(msg_type: MsgType, code: MsgCode) -> Message {
        Message {
            msg_type,
            code,
            ..Default::default()
        }
    }

    /// Creates a new confirmable request with the given method code.
    pub fn request(code: MsgCode) -> Message {
        Message::new(MsgType::Con, code)
    }

    /// Creates an empty acknowledgement for the given message id.
    pub fn empty_ack(msg_id: MsgId) -> Message {
        let mut msg = Message::new(MsgType::Ack, MsgCode::Empty);
        msg.msg_id = msg_id;
        msg
    }

    /// Creates a reset message for the given message id.
    pub fn reset(msg_id: MsgId) -> Message {
        let mut msg = Message::new(MsgType::Rst, MsgCode::Empty);
        msg.msg_id = msg_id;
        msg
    }

    /// Creates a piggy-backed acknowledgement carrying a response to `request`:
    /// same message id, same token.
    pub fn piggybacked_reply(request: &Message, code: MsgCode) -> Message {
        let mut msg = Message::new(MsgType::Ack, code);
        msg.msg_id = request.msg_id;
        msg.token = request.token;
        msg
    }

    /// The message type.
    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    /// Replaces the message type.
    pub fn set_msg_type(&mut self, msg_type: MsgType) {
        self.msg_type = msg_type;
    }

    /// The message code.
    pub fn code(&self) -> MsgCode {
        self.code
    }

    /// Replaces the message code.
    pub fn set_code(&mut self, code: MsgCode) {
        self.code = code;
    }

    /// The message id.
    pub fn msg_id(&self) -> MsgId {
        self.msg_id
    }

    /// Replaces the message id.
    pub fn set_msg_id(&mut self, msg_id: MsgId) {
        self.msg_id = msg_id;
    }

    /// The message token.
    pub fn token(&self) -> MsgToken {
        self.token
    }

    /// Replaces the message token.
    pub fn set_token(&mut self, token: MsgToken) {
        self.token = token;
    }

    /// The message payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The message payload, interpreted as UTF-8.
    pub fn payload_as_str(&self) -> Option<&str> {
        core::str::from_utf8(&self.payload).ok()
    }

    /// Replaces the message payload.
    pub fn set_payload<P: Into<Vec<u8>>>(&mut self, payload: P) {
        self.payload = payload.into();
    }

    /// Takes the payload out of the message, leaving it empty.
    pub fn take_payload(&mut self) -> Vec<u8> {
        core::mem::replace(&mut self.payload, Vec::new())
    }

    /// Iterates over all options in ascending option-number order.
    pub fn options(&self) -> impl Iterator<Item = (OptionNumber, &[u8])> {
        self.options.iter().map(|(num, value)| (*num, value.as_slice()))
    }

    /// Returns true if the message carries no options.
    pub fn has_no_options(&self) -> bool {
        self.options.is_empty()
    }

    /// Inserts an option, keeping the list sorted by option number. Repeats
    /// of the same number keep their insertion order.
    pub fn insert_option<V: Into<Vec<u8>>>(&mut self, number: OptionNumber, value: V) {
        let at = self
            .options
            .iter()
            .position(|(num, _)| *num > number)
            .unwrap_or_else(|| self.options.len());
        self.options.insert(at, (number, value.into()));
    }

    /// Replaces every instance of the given option with a single value.
    pub fn set_option<V: Into<Vec<u8>>>(&mut self, number: OptionNumber, value: V) {
        self.remove_option(number);
        self.insert_option(number, value);
    }

    /// Removes every instance of the given option.
    pub fn remove_option(&mut self, number: OptionNumber) {
        self.options.retain(|(num, _)| *num != number);
    }

    /// Returns the value of the first instance of the given option.
    pub fn option_value(&self, number: OptionNumber) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|(num, _)| *num == number)
            .map(|(_, value)| value.as_slice())
    }

    /// Iterates over the values of every instance of the given option.
    pub fn option_values(&self, number: OptionNumber) -> impl Iterator<Item = &[u8]> {
        self.options
            .iter()
            .filter(move |(num, _)| *num == number)
            .map(|(_, value)| value.as_slice())
    }

    /// Returns the first instance of the given option decoded as a uint.
    ///
    /// Returns `None` both when the option is absent and when its value is
    /// longer than four bytes.
    pub fn option_uint(&self, number: OptionNumber) -> Option<u32> {
        self.option_value(number).and_then(try_decode_u32)
    }

    /// Replaces the given option with a uint value.
    pub fn set_option_uint(&mut self, number: OptionNumber, value: u32) {
        self.set_option(number, encode_uint(value));
    }

    /// Replaces a repeatable option with one instance per element of the
    /// given sequence.
    ///
    /// Taking an iterator (rather than a single value) is what makes the
    /// "passed a bare string where a sequence was expected" mistake
    /// impossible to express.
    pub fn set_repeated_option<I, V>(&mut self, number: OptionNumber, values: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<Vec<u8>>,
    {
        self.remove_option(number);
        for value in values {
            self.insert_option(number, value);
        }
    }

    /// The Uri-Path options as owned segments, in order.
    pub fn uri_path(&self) -> Vec<String> {
        self.option_values(OptionNumber::URI_PATH)
            .map(|segment| String::from_utf8_lossy(segment).into_owned())
            .collect()
    }

    /// Replaces the Uri-Path options from a sequence of segments.
    pub fn set_uri_path<I, S>(&mut self, segments: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.set_repeated_option(
            OptionNumber::URI_PATH,
            segments.into_iter().map(|s| s.as_ref().as_bytes().to_vec()),
        );
    }

    /// The Uri-Query options as owned strings, in order.
    pub fn uri_queries(&self) -> Vec<String> {
        self.option_values(OptionNumber::URI_QUERY)
            .map(|item| String::from_utf8_lossy(item).into_owned())
            .collect()
    }

    /// Replaces the Uri-Query options from a sequence of items.
    pub fn set_uri_queries<I, S>(&mut self, items: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.set_repeated_option(
            OptionNumber::URI_QUERY,
            items.into_iter().map(|s| s.as_ref().as_bytes().to_vec()),
        );
    }

    /// The Observe option value, if present.
    pub fn observe(&self) -> Option<u32> {
        self.option_uint(OptionNumber::OBSERVE)
    }

    /// Replaces the Observe option.
    pub fn set_observe(&mut self, value: u32) {
        self.set_option_uint(OptionNumber::OBSERVE, value);
    }

    /// Removes the Observe option.
    pub fn clear_observe(&mut self) {
        self.remove_option(OptionNumber::OBSERVE);
    }

    /// The Block1 option value, if present and valid.
    pub fn block1(&self) -> Option<BlockInfo> {
        self.option_uint(OptionNumber::BLOCK1)
            .and_then(|raw| BlockInfo(raw).valid())
    }

    /// Replaces or removes the Block1 option.
    pub fn set_block1(&mut self, block: Option<BlockInfo>) {
        match block {
            Some(block) => self.set_option_uint(OptionNumber::BLOCK1, block.0),
            None => self.remove_option(OptionNumber::BLOCK1),
        }
    }

    /// The Block2 option value, if present and valid.
    pub fn block2(&self) -> Option<BlockInfo> {
        self.option_uint(OptionNumber::BLOCK2)
            .and_then(|raw| BlockInfo(raw).valid())
    }

    /// Replaces or removes the Block2 option.
    pub fn set_block2(&mut self, block: Option<BlockInfo>) {
        match block {
            Some(block) => self.set_option_uint(OptionNumber::BLOCK2, block.0),
            None => self.remove_option(OptionNumber::BLOCK2),
        }
    }

    /// The Content-Format option, if present.
    pub fn content_format(&self) -> Option<ContentFormat> {
        self.option_uint(OptionNumber::CONTENT_FORMAT)
            .map(|raw| ContentFormat(raw as u16))
    }

    /// Replaces the Content-Format option.
    pub fn set_content_format(&mut self, format: ContentFormat) {
        self.set_option_uint(OptionNumber::CONTENT_FORMAT, format.0 as u32);
    }

    /// The Accept option, if present.
    pub fn accept(&self) -> Option<ContentFormat> {
        self.option_uint(OptionNumber::ACCEPT)
            .map(|raw| ContentFormat(raw as u16))
    }

    /// Replaces the Accept option.
    pub fn set_accept(&mut self, format: ContentFormat) {
        self.set_option_uint(OptionNumber::ACCEPT, format.0 as u32);
    }

    /// The ETag options, in order.
    pub fn etags(&self) -> Vec<ETag> {
        self.option_values(OptionNumber::ETAG)
            .filter_map(ETag::try_new)
            .collect()
    }

    /// Adds an ETag option.
    pub fn add_etag(&mut self, etag: ETag) {
        self.insert_option(OptionNumber::ETAG, etag.as_bytes().to_vec());
    }

    /// Returns true if this message is a request (its code is a method).
    pub fn is_request(&self) -> bool {
        self.code.is_method()
    }

    /// Returns true if this message is a response (success or error code).
    pub fn is_response(&self) -> bool {
        !self.code.is_empty() && !self.code.is_method()
    }

    /// Returns the first unrecognized critical option, if any.
    pub fn unknown_critical_option(&self) -> Option<OptionNumber> {
        self.options
            .iter()
            .map(|(num, _)| *num)
            .find(|num| num.is_critical() && !num.is_recognized())
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} MID:0x{:04X}", self.msg_type, self.code, self.msg_id)?;

        if !self.token.is_empty() {
            write!(f, " TOK:{}", self.token)?;
        }

        for (number, value) in self.options() {
            f.write_str(" ")?;
            number.fmt_with_value(f, value)?;
        }

        if !self.payload.is_empty() {
            write!(f, " {}B", self.payload.len())?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_ordering_is_maintained() {
        let mut msg = Message::request(MsgCode::MethodGet);
        msg.set_option_uint(OptionNumber::ACCEPT, 0);
        msg.set_uri_path(&["a", "b"]);
        msg.insert_option(OptionNumber::ETAG, vec![1, 2]);

        let numbers: Vec<u16> = msg.options().map(|(num, _)| num.0).collect();
        assert_eq!(numbers, vec![4, 11, 11, 17]);
    }

    #[test]
    fn repeated_setter_replaces() {
        let mut msg = Message::request(MsgCode::MethodGet);
        msg.set_uri_path(&["core"]);
        assert_eq!(msg.uri_path(), vec!["core"]);

        msg.set_uri_path(&["core", ".well-known"]);
        assert_eq!(msg.uri_path(), vec!["core", ".well-known"]);
        assert_eq!(msg.option_values(OptionNumber::URI_PATH).count(), 2);
    }

    #[test]
    fn uint_accessors_trim() {
        let mut msg = Message::request(MsgCode::MethodGet);
        msg.set_observe(0);
        assert_eq!(msg.option_value(OptionNumber::OBSERVE), Some(&[][..]));
        assert_eq!(msg.observe(), Some(0));

        msg.set_observe(0x1234);
        assert_eq!(msg.option_value(OptionNumber::OBSERVE), Some(&[0x12, 0x34][..]));
    }

    #[test]
    fn unknown_critical_detection() {
        let mut msg = Message::request(MsgCode::MethodGet);
        msg.set_uri_path(&["x"]);
        assert_eq!(msg.unknown_critical_option(), None);

        msg.insert_option(OptionNumber(65), vec![]);
        assert_eq!(msg.unknown_critical_option(), Some(OptionNumber(65)));
    }
}
