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
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::prelude::*;
use futures::task::{Context, Poll};
use std::fmt::{Debug, Display, Formatter};
use std::pin::Pin;
use std::sync::Mutex;

/// Simplified "SocketAddr" for [`LoopbackSocket`]: the index of one side of
/// the loop.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LoopbackSocketAddr(pub u8);

impl Display for LoopbackSocketAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "loop-{}", self.0)
    }
}

/// An instance of [`AsyncDatagramSocket`] that never touches the network.
///
/// [`LoopbackSocket::new`] creates a socket whose transmissions are looped
/// straight back to its own input, which is enough to exercise an endpoint
/// holding both the client and the server role. [`LoopbackSocket::pair`]
/// creates two cross-connected sockets for driving two distinct endpoints
/// against each other.
#[derive(Debug)]
pub struct LoopbackSocket {
    local: LoopbackSocketAddr,
    // Message is (packet_bytes, source_addr).
    sender: UnboundedSender<(Vec<u8>, LoopbackSocketAddr)>,
    receiver: Mutex<UnboundedReceiver<(Vec<u8>, LoopbackSocketAddr)>>,
}

impl LoopbackSocket {
    /// Creates a socket that receives everything it sends.
    pub fn new() -> LoopbackSocket {
        let (sender, receiver) = unbounded();
        LoopbackSocket {
            local: LoopbackSocketAddr(0),
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    /// Creates two cross-connected sockets: everything sent on one arrives
    /// on the other, with source addresses `loop-0` and `loop-1`.
    pub fn pair() -> (LoopbackSocket, LoopbackSocket) {
        let (sender_a, receiver_a) = unbounded();
        let (sender_b, receiver_b) = unbounded();
        (
            LoopbackSocket {
                local: LoopbackSocketAddr(0),
                sender: sender_b,
                receiver: Mutex::new(receiver_a),
            },
            LoopbackSocket {
                local: LoopbackSocketAddr(1),
                sender: sender_a,
                receiver: Mutex::new(receiver_b),
            },
        )
    }
}

impl Default for LoopbackSocket {
    fn default() -> Self {
        LoopbackSocket::new()
    }
}

impl Unpin for LoopbackSocket {}

impl AsyncDatagramSocket for LoopbackSocket {}

impl DatagramSocketTypes for LoopbackSocket {
    type SocketAddr = LoopbackSocketAddr;
    type Error = Error;

    fn local_addr(&self) -> Result<Self::SocketAddr, Self::Error> {
        Ok(self.local)
    }
}

impl AsyncSendTo for LoopbackSocket {
    fn poll_send_to(
        self: Pin<&Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
        _addr: Self::SocketAddr,
    ) -> Poll<Result<usize, Self::Error>> {
        let this = self.get_ref();
        match this.sender.unbounded_send((buf.to_vec(), this.local)) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(Error::Io)),
        }
    }
}

impl AsyncRecvFrom for LoopbackSocket {
    fn poll_recv_from(
        self: Pin<&Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<Result<(usize, Self::SocketAddr), Self::Error>> {
        let mut receiver = self.get_ref().receiver.lock().expect("Lock failed");

        match Pin::new(&mut *receiver).poll_next(cx) {
            Poll::Ready(Some((packet, from))) => {
                let len = packet.len();
                if buf.len() >= len {
                    buf[..len].copy_from_slice(&packet);
                    Poll::Ready(Ok((len, from)))
                } else {
                    Poll::Ready(Err(Error::Io))
                }
            }
            Poll::Ready(None) => Poll::Ready(Err(Error::Io)),
            Poll::Pending => Poll::Pending,
        }
    }
}
