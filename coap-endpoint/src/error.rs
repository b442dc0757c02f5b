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

use crate::message::MsgCode;
use std::fmt::{Debug, Display, Formatter};

/// Type for errors encountered while sending or receiving CoAP requests and responses.
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone)]
pub enum Error {
    /// The message or one of its options was malformed: bad header, bad option
    /// encoding, or a payload marker followed by nothing.
    Format,

    /// A critical option present in the message was not recognized.
    BadOption,

    /// The content format of the payload is not supported by the resource.
    UnsupportedContentFormat,

    /// No resource is registered for the requested path.
    NotFound,

    /// A resource exists for the requested path, but it does not accept the
    /// request method.
    MethodNotAllowed,

    /// The retransmission budget for a confirmable message was exhausted
    /// without an acknowledgement.
    Timeout,

    /// The peer answered with a reset message.
    Reset,

    /// This operation has been cancelled.
    Cancelled,

    /// An uncategorized failure inside a resource handler.
    Internal,

    /// One or more of the supplied arguments are not valid for the given operation.
    InvalidArgument,

    /// The message would exceed the maximum datagram size.
    OutOfSpace,

    /// An I/O error occurred while performing this operation.
    Io,
}

impl Error {
    /// Maps this error to the CoAP response code a server emits for it.
    ///
    /// Transport-level kinds that never turn into a response (`Timeout`,
    /// `Reset`, `Cancelled`, `Io`) map to 5.00 as a last resort, matching
    /// the policy that nothing escapes a handler as anything other than a
    /// response code.
    pub fn response_code(&self) -> MsgCode {
        match self {
            Error::Format => MsgCode::ClientErrorBadRequest,
            Error::BadOption => MsgCode::ClientErrorBadOption,
            Error::UnsupportedContentFormat => MsgCode::ClientErrorUnsupportedContentFormat,
            Error::NotFound => MsgCode::ClientErrorNotFound,
            Error::MethodNotAllowed => MsgCode::ClientErrorMethodNotAllowed,
            _ => MsgCode::ServerErrorInternal,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(_: std::io::Error) -> Self {
        Error::Io
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        <Self as Debug>::fmt(self, f)
    }
}

impl Default for Error {
    fn default() -> Self {
        Error::Internal
    }
}
