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

/// Enum representing the *class* of a CoAP message code: the high three bits
/// of the 3/5 class/detail split.
#[derive(Debug, Copy, Eq, PartialEq, Clone)]
pub enum MsgCodeClass {
    /// Class for methods.
    Method = 0,

    /// Class for successful responses.
    Success = 2,

    /// Class for client error responses.
    ClientError = 4,

    /// Class for server error responses.
    ServerError = 5,
}

impl MsgCodeClass {
    /// Tries to calculate the message code class from the given message code.
    pub fn try_from(x: u8) -> Option<MsgCodeClass> {
        match x {
            0 => Some(MsgCodeClass::Method),
            2 => Some(MsgCodeClass::Success),
            4 => Some(MsgCodeClass::ClientError),
            5 => Some(MsgCodeClass::ServerError),
            _ => None,
        }
    }

    /// Returns true if the given message code is in this message code class.
    pub fn contains(self, code: MsgCode) -> bool {
        let code_u8 = code as u8;

        code_u8 != 0 && (code_u8 >> 5) == self as u8
    }
}

/// Helper function
const fn calc_code(class: u8, detail: u8) -> isize {
    (((class & 0x7) << 5) + detail) as isize
}

/// Enum representing a CoAP message code.
#[derive(Debug, Copy, Eq, PartialEq, Clone, Hash)]
pub enum MsgCode {
    /// Empty message code. Only used for ping requests, resets, and empty acknowledgements.
    Empty = 0x00,

    /// CoAP GET method.
    MethodGet = calc_code(0, 1),

    /// CoAP POST method.
    MethodPost = calc_code(0, 2),

    /// CoAP PUT method.
    MethodPut = calc_code(0, 3),

    /// CoAP DELETE method.
    MethodDelete = calc_code(0, 4),

    /// CoAP 2.01 CREATED success code.
    SuccessCreated = calc_code(2, 1),

    /// CoAP 2.02 DELETED success code.
    SuccessDeleted = calc_code(2, 2),

    /// CoAP 2.03 VALID success code.
    SuccessValid = calc_code(2, 3),

    /// CoAP 2.04 CHANGED success code.
    SuccessChanged = calc_code(2, 4),

    /// CoAP 2.05 CONTENT success code.
    SuccessContent = calc_code(2, 5),

    /// CoAP 2.31 CONTINUE success code, acknowledging an intermediate block.
    SuccessContinue = calc_code(2, 31),

    /// CoAP 4.00 BAD_REQUEST client error.
    ClientErrorBadRequest = calc_code(4, 0),

    /// CoAP 4.01 UNAUTHORIZED client error.
    ClientErrorUnauthorized = calc_code(4, 1),

    /// CoAP 4.02 BAD_OPTION client error.
    ClientErrorBadOption = calc_code(4, 2),

    /// CoAP 4.03 FORBIDDEN client error.
    ClientErrorForbidden = calc_code(4, 3),

    /// CoAP 4.04 NOT_FOUND client error.
    ClientErrorNotFound = calc_code(4, 4),

    /// CoAP 4.05 METHOD_NOT_ALLOWED client error.
    ClientErrorMethodNotAllowed = calc_code(4, 5),

    /// CoAP 4.06 NOT_ACCEPTABLE client error.
    ClientErrorNotAcceptable = calc_code(4, 6),

    /// CoAP 4.08 REQUEST_ENTITY_INCOMPLETE client error.
    ClientErrorRequestEntityIncomplete = calc_code(4, 8),

    /// CoAP 4.12 PRECONDITION_FAILED client error.
    ClientErrorPreconditionFailed = calc_code(4, 12),

    /// CoAP 4.13 REQUEST_ENTITY_TOO_LARGE client error.
    ClientErrorRequestEntityTooLarge = calc_code(4, 13),

    /// CoAP 4.15 UNSUPPORTED_CONTENT_FORMAT client error.
    ClientErrorUnsupportedContentFormat = calc_code(4, 15),

    /// CoAP 5.00 INTERNAL_SERVER_ERROR server error.
    ServerErrorInternal = calc_code(5, 0),

    /// CoAP 5.01 NOT_IMPLEMENTED server error.
    ServerErrorNotImplemented = calc_code(5, 1),

    /// CoAP 5.02 BAD_GATEWAY server error.
    ServerErrorBadGateway = calc_code(5, 2),

    /// CoAP 5.03 SERVICE_UNAVAILABLE server error.
    ServerErrorServiceUnavailable = calc_code(5, 3),

    /// CoAP 5.04 GATEWAY_TIMEOUT server error.
    ServerErrorGatewayTimeout = calc_code(5, 4),

    /// CoAP 5.05 PROXYING_NOT_SUPPORTED server error.
    ServerErrorProxyingNotSupported = calc_code(5, 5),
}

impl MsgCode {
    /// Tries to convert the given `u8` into a `MsgCode`. If the given code isn't recognized,
    /// this method will return `None`.
    pub fn try_from(x: u8) -> Option<MsgCode> {
        use MsgCode::*;
        match x {
            0x00 => Some(Empty),
            0x01 => Some(MethodGet),
            0x02 => Some(MethodPost),
            0x03 => Some(MethodPut),
            0x04 => Some(MethodDelete),

            0x41 => Some(SuccessCreated),
            0x42 => Some(SuccessDeleted),
            0x43 => Some(SuccessValid),
            0x44 => Some(SuccessChanged),
            0x45 => Some(SuccessContent),
            0x5F => Some(SuccessContinue),

            0x80 => Some(ClientErrorBadRequest),
            0x81 => Some(ClientErrorUnauthorized),
            0x82 => Some(ClientErrorBadOption),
            0x83 => Some(ClientErrorForbidden),
            0x84 => Some(ClientErrorNotFound),
            0x85 => Some(ClientErrorMethodNotAllowed),
            0x86 => Some(ClientErrorNotAcceptable),
            0x88 => Some(ClientErrorRequestEntityIncomplete),
            0x8C => Some(ClientErrorPreconditionFailed),
            0x8D => Some(ClientErrorRequestEntityTooLarge),
            0x8F => Some(ClientErrorUnsupportedContentFormat),

            0xA0 => Some(ServerErrorInternal),
            0xA1 => Some(ServerErrorNotImplemented),
            0xA2 => Some(ServerErrorBadGateway),
            0xA3 => Some(ServerErrorServiceUnavailable),
            0xA4 => Some(ServerErrorGatewayTimeout),
            0xA5 => Some(ServerErrorProxyingNotSupported),

            _ => None,
        }
    }

    /// Returns the class part of this code (the high three bits).
    pub fn class(self) -> u8 {
        (self as u8) >> 5
    }

    /// Returns the detail part of this code (the low five bits).
    pub fn detail(self) -> u8 {
        (self as u8) & 0b11111
    }

    /// Returns true if this is the empty code.
    pub fn is_empty(self) -> bool {
        self as u8 == 0
    }

    /// Returns true if message code is a method.
    pub fn is_method(self) -> bool {
        MsgCodeClass::Method.contains(self)
    }

    /// Returns true if message code is a client error.
    pub fn is_client_error(self) -> bool {
        MsgCodeClass::ClientError.contains(self)
    }

    /// Returns true if message code is a server error.
    pub fn is_server_error(self) -> bool {
        MsgCodeClass::ServerError.contains(self)
    }

    /// Returns true if message code is any sort of error.
    pub fn is_error(self) -> bool {
        self.is_client_error() || self.is_server_error()
    }

    /// Returns true if message code indicates success.
    pub fn is_success(self) -> bool {
        MsgCodeClass::Success.contains(self)
    }
}

impl Default for MsgCode {
    fn default() -> Self {
        MsgCode::Empty
    }
}

impl core::convert::From<MsgCode> for u8 {
    fn from(code: MsgCode) -> Self {
        code as u8
    }
}

impl core::fmt::Display for MsgCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_detail_split() {
        assert_eq!(MsgCode::SuccessContent.class(), 2);
        assert_eq!(MsgCode::SuccessContent.detail(), 5);
        assert_eq!(MsgCode::SuccessContinue.detail(), 31);
        assert_eq!(MsgCode::ClientErrorUnsupportedContentFormat.detail(), 15);
        assert_eq!(MsgCode::SuccessContent.to_string(), "2.05");
        assert_eq!(MsgCode::ClientErrorBadRequest.to_string(), "4.00");
    }

    #[test]
    fn classification() {
        assert!(MsgCode::MethodGet.is_method());
        assert!(!MsgCode::Empty.is_method());
        assert!(MsgCode::SuccessContinue.is_success());
        assert!(MsgCode::ClientErrorNotFound.is_client_error());
        assert!(MsgCode::ServerErrorInternal.is_error());
        assert!(!MsgCode::SuccessContent.is_error());
    }

    #[test]
    fn round_trip() {
        for byte in 0u8..=0xFF {
            if let Some(code) = MsgCode::try_from(byte) {
                assert_eq!(code as u8, byte);
            }
        }
    }
}
