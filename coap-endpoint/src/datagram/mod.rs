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

//! The datagram-based CoAP endpoint engine.
//!
//! [`Endpoint`] drives the whole protocol core over any transport that
//! implements [`AsyncDatagramSocket`]: UDP via [`AllowStdUdpSocket`], the
//! in-process [`LoopbackSocket`], the black-hole [`NullSocket`], or your
//! own.

use crate::block::{block_slice, BlockAssembler, BlockInfo};
use crate::error::Error;
use crate::message::{Message, MsgCode, MsgId, MsgToken, MsgType};
use crate::option::OptionNumber;
use crate::trans_params::TransParams;

mod async_socket;
pub use async_socket::{
    AsyncDatagramSocket, AsyncRecvFrom, AsyncSendTo, DatagramSocketTypes, RecvFromFuture,
    SendToFuture,
};

mod allow_udp_socket;
pub use allow_udp_socket::AllowStdUdpSocket;

mod loopback_socket;
pub use loopback_socket::{LoopbackSocket, LoopbackSocketAddr};

mod null_socket;
pub use null_socket::{NullSocket, NullSocketAddr};

mod dispatch;
pub use dispatch::{NullDispatch, ResourceDispatch};

mod matcher;
use matcher::{Disposition, Matcher, ResponseHandler};

mod dedup;
use dedup::{DedupCache, DedupOutcome};

mod observe;
use observe::{ObserveSink, Observation};

mod transaction;
use transaction::TransactionFuture;

mod exchange;
pub use exchange::ExchangeFuture;

mod endpoint;
pub use endpoint::Endpoint;
pub(crate) use endpoint::EndpointInner;

mod server;
