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

//! An asynchronous implementation of a Constrained Application Protocol
//! (CoAP, [IETF-RFC7252]) endpoint, covering both the client and the server
//! role over UDP datagrams, with [Block-wise Transfer][IETF-RFC7959] and
//! [Observe][IETF-RFC7641] support.
//!
//! [IETF-RFC7252]: https://tools.ietf.org/html/rfc7252
//! [IETF-RFC7959]: https://tools.ietf.org/html/rfc7959
//! [IETF-RFC7641]: https://tools.ietf.org/html/rfc7641
//!
//! The crate is the *protocol engine* only: message framing and the option
//! codec, the message-layer reliability machinery (confirmable
//! retransmission, deduplication, separate responses), token-based
//! request/response matching, block-wise reassembly and fragmentation, and
//! observe relationship tracking. Resource trees, link-format handling, and
//! URI parsing are left to the application, which is reached through the
//! [`datagram::ResourceDispatch`] trait.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use futures::prelude::*;
//! use futures::executor::LocalPool;
//! use futures::task::LocalSpawnExt;
//! use coap_endpoint::prelude::*;
//! use coap_endpoint::datagram::{AllowStdUdpSocket, Endpoint};
//!
//! // Create our asynchronous socket. In this case, it is just an
//! // (inefficient) wrapper around the standard rust `UdpSocket`.
//! let socket = AllowStdUdpSocket::bind("[::]:0").expect("UDP bind failed");
//!
//! let endpoint = Arc::new(Endpoint::new(socket));
//!
//! let mut pool = LocalPool::new();
//!
//! // Run the receive loop so that the endpoint can process
//! // inbound datagrams.
//! let loop_endpoint = endpoint.clone();
//! pool.spawner()
//!     .spawn_local(async move {
//!         let _ = loop_endpoint.receive_loop().await;
//!     })
//!     .unwrap();
//!
//! let dest = "[::1]:5683".parse().unwrap();
//!
//! let mut request = Message::request(MsgCode::MethodGet);
//! request.set_uri_path(&["large"]);
//!
//! let response = pool
//!     .run_until(endpoint.request(dest, request))
//!     .expect("CoAP request failed");
//!
//! println!("Got response: {}", response);
//! ```

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![warn(clippy::all)]
#![warn(missing_docs)]

#[macro_use]
extern crate log;

pub mod message;
pub mod option;

mod content_format;
pub use content_format::ContentFormat;

mod block;
pub use block::{block_slice, BlockAssembler, BlockInfo};

mod trans_params;
pub use trans_params::TransParams;

pub mod consts;
#[doc(hidden)]
pub use consts::*;

mod error;
pub use error::Error;

mod etag;
pub use etag::ETag;

pub mod datagram;

#[doc(hidden)]
pub mod prelude {
    pub use super::datagram::ResourceDispatch;

    pub use super::message::Message;
    pub use super::message::MsgCode;
    pub use super::message::MsgCodeClass;
    pub use super::message::MsgId;
    pub use super::message::MsgToken;
    pub use super::message::MsgType;

    pub use super::option::OptionNumber;

    pub use super::BlockInfo;
    pub use super::ContentFormat;
    pub use super::Error;
    pub use super::TransParams;
}
