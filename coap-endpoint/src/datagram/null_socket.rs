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

use super::*;
use futures::task::{Context, Poll};
use std::fmt::{Debug, Display, Formatter};
use std::pin::Pin;

/// The "SocketAddr" type for [`NullSocket`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct NullSocketAddr;

impl Display for NullSocketAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.write_str("null")
    }
}

/// An instance of [`AsyncDatagramSocket`] that is connected to nothing:
/// transmissions are silently discarded and nothing is ever received.
///
/// Useful for exercising retransmission and timeout paths.
#[derive(Debug, Default)]
pub struct NullSocket;

impl NullSocket {
    /// Creates a new instance of [`NullSocket`].
    pub fn new() -> NullSocket {
        NullSocket
    }
}

impl Unpin for NullSocket {}

impl AsyncDatagramSocket for NullSocket {}

impl DatagramSocketTypes for NullSocket {
    type SocketAddr = NullSocketAddr;
    type Error = Error;

    fn local_addr(&self) -> Result<Self::SocketAddr, Self::Error> {
        Ok(NullSocketAddr)
    }
}

impl AsyncSendTo for NullSocket {
    fn poll_send_to(
        self: Pin<&Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
        _addr: Self::SocketAddr,
    ) -> Poll<Result<usize, Self::Error>> {
        Poll::Ready(Ok(buf.len()))
    }
}

impl AsyncRecvFrom for NullSocket {
    fn poll_recv_from(
        self: Pin<&Self>,
        _cx: &mut Context<'_>,
        _buf: &mut [u8],
    ) -> Poll<Result<(usize, Self::SocketAddr), Self::Error>> {
        Poll::Pending
    }
}
