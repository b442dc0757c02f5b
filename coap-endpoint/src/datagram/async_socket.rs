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

use futures::prelude::*;
use futures::task::{Context, Poll};
use std::pin::Pin;

/// A trait for asynchronous datagram sockets.
///
/// This is an empty convenience trait that requires several additional traits to be
/// implemented: [`DatagramSocketTypes`], [`AsyncSendTo`], [`AsyncRecvFrom`], and
/// [`Send`]+[`Sync`].
///
/// Implementations of this trait can be used with
/// [`Endpoint`][crate::datagram::Endpoint].
pub trait AsyncDatagramSocket:
    DatagramSocketTypes + AsyncSendTo + AsyncRecvFrom + Send + Sync + 'static
{
}

/// Trait implemented by a "socket" that describes the underlying `SocketAddr` and socket
/// error types as associated types.
pub trait DatagramSocketTypes: Unpin {
    /// The "`SocketAddr`" type used by this "socket". Typically [`std::net::SocketAddr`].
    type SocketAddr: core::fmt::Display
        + core::fmt::Debug
        + core::hash::Hash
        + Eq
        + Send
        + Sync
        + Unpin
        + Copy;

    /// The error type for errors emitted from this socket. Typically [`std::io::Error`].
    type Error: core::fmt::Display + core::fmt::Debug + Send;

    /// Returns the local `SocketAddr` of this "socket".
    fn local_addr(&self) -> Result<Self::SocketAddr, Self::Error>;
}

/// Trait for providing `send_to` functionality for asynchronous, datagram-based sockets.
pub trait AsyncSendTo: DatagramSocketTypes {
    /// A non-blocking, `poll_*` version of `std::net::UdpSocket::send_to`.
    fn poll_send_to(
        self: Pin<&Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
        addr: Self::SocketAddr,
    ) -> Poll<Result<usize, Self::Error>>;

    /// Returns a future that uses [`AsyncSendTo::poll_send_to`].
    fn send_to<'a, 'b>(&'a self, buf: &'b [u8], addr: Self::SocketAddr) -> SendToFuture<'a, 'b, Self> {
        SendToFuture {
            socket: self,
            buffer: buf,
            addr,
        }
    }
}

/// Future returned from [`AsyncSendTo::send_to`].
#[derive(Debug)]
pub struct SendToFuture<'a, 'b, T>
where
    T: DatagramSocketTypes + AsyncSendTo + ?Sized,
{
    socket: &'a T,
    buffer: &'b [u8],
    addr: T::SocketAddr,
}

impl<'a, 'b, T> Future for SendToFuture<'a, 'b, T>
where
    T: DatagramSocketTypes + AsyncSendTo + ?Sized,
{
    type Output = Result<usize, T::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(this.socket).poll_send_to(cx, this.buffer, this.addr)
    }
}

/// Trait for providing `recv_from` functionality for asynchronous, datagram-based sockets.
pub trait AsyncRecvFrom: DatagramSocketTypes {
    /// A non-blocking, `poll_*` version of [`std::net::UdpSocket::recv_from`].
    fn poll_recv_from(
        self: Pin<&Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<Result<(usize, Self::SocketAddr), Self::Error>>;

    /// Returns a future that uses [`poll_recv_from`][AsyncRecvFrom::poll_recv_from].
    fn recv_from<'a, 'b>(&'a self, buf: &'b mut [u8]) -> RecvFromFuture<'a, 'b, Self> {
        RecvFromFuture {
            socket: self,
            buffer: buf,
        }
    }
}

/// Future returned from [`AsyncRecvFrom::recv_from`].
#[derive(Debug)]
pub struct RecvFromFuture<'a, 'b, T: AsyncRecvFrom + ?Sized> {
    socket: &'a T,
    buffer: &'b mut [u8],
}

impl<'a, 'b, T: AsyncRecvFrom + ?Sized> Future for RecvFromFuture<'a, 'b, T> {
    type Output = Result<(usize, T::SocketAddr), T::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(this.socket).poll_recv_from(cx, this.buffer)
    }
}
