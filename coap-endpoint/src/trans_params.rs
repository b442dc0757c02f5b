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

use crate::block::BlockInfo;
use std::time::Duration;

/// [CoAP transmission parameters][tp], as used by an [`Endpoint`].
///
/// The `Default` implementation carries the values recommended by
/// [IETF-RFC7252 Section 4.8][tp].
///
/// [tp]: https://tools.ietf.org/html/rfc7252#section-4.8
/// [`Endpoint`]: crate::datagram::Endpoint
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TransParams {
    /// Initial acknowledgement timeout for confirmable messages.
    pub ack_timeout: Duration,

    /// Randomization factor applied to the initial timeout; the first
    /// timeout is drawn uniformly from
    /// `[ack_timeout, ack_timeout * ack_random_factor]`.
    pub ack_random_factor: f32,

    /// Maximum number of retransmissions of a confirmable message.
    pub max_retransmit: u32,

    /// Maximum number of simultaneous outstanding confirmable interactions
    /// with a given peer.
    pub nstart: u32,

    /// Block size exponent used when this endpoint initiates a block-wise
    /// transfer: block size is `2^(default_block_szx + 4)` bytes.
    pub default_block_szx: u8,

    /// Largest datagram this endpoint will emit. Responses that would
    /// exceed it are carried as a block-wise transfer.
    pub max_message_size: usize,

    /// How long a `(peer, message id)` pair must be remembered for
    /// deduplication and late acknowledgement handling.
    ///
    /// From RFC7252: `MAX_TRANSMIT_SPAN + (2 * MAX_LATENCY) +
    /// PROCESSING_DELAY`, or 247 seconds with the default parameters.
    pub exchange_lifetime: Duration,

    /// The time a node takes to turn a confirmable request around into an
    /// acknowledgement. A handler still running when a fraction of this
    /// budget has elapsed gets an empty acknowledgement and a separate
    /// response.
    pub processing_delay: Duration,
}

/// From RFC7252: the maximum time a datagram is expected to take from the
/// start of its transmission to the completion of its reception,
/// "arbitrarily" defined to be 100 seconds.
const MAX_LATENCY: Duration = Duration::from_secs(100);

impl Default for TransParams {
    fn default() -> Self {
        TransParams {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            nstart: 1,
            default_block_szx: BlockInfo::SZX_MAX,
            max_message_size: 1152,
            exchange_lifetime: Duration::from_secs(247),
            processing_delay: Duration::from_secs(2),
        }
    }
}

impl TransParams {
    /// Draws the initial retransmission timeout: uniformly distributed over
    /// `[ack_timeout, ack_timeout * ack_random_factor]`. Subsequent timeouts
    /// double this value.
    pub fn initial_retransmit_timeout(&self) -> Duration {
        let base = self.ack_timeout.as_millis() as u64;

        const JDIV: u64 = 512u64;
        let rmod: u64 = (JDIV as f32 * (self.ack_random_factor - 1.0)) as u64;
        let jmul = if rmod == 0 {
            JDIV
        } else {
            JDIV + rand::random::<u64>() % rmod
        };

        Duration::from_millis(base * jmul / JDIV)
    }

    /// From RFC7252: the maximum time from the first transmission of a
    /// confirmable message to its last retransmission:
    /// `ACK_TIMEOUT * ((2 ** MAX_RETRANSMIT) - 1) * ACK_RANDOM_FACTOR`,
    /// 45 seconds with the default parameters.
    pub fn max_transmit_span(&self) -> Duration {
        let ms = self.ack_timeout.as_millis() as f32
            * ((1u64 << self.max_retransmit) - 1) as f32
            * self.ack_random_factor;
        Duration::from_millis(ms as u64)
    }

    /// From RFC7252: the maximum time from the first transmission of a
    /// confirmable message to the time the sender gives up:
    /// `ACK_TIMEOUT * ((2 ** (MAX_RETRANSMIT + 1)) - 1) * ACK_RANDOM_FACTOR`,
    /// 93 seconds with the default parameters.
    pub fn max_transmit_wait(&self) -> Duration {
        let ms = self.ack_timeout.as_millis() as f32
            * ((1u64 << (self.max_retransmit + 1)) - 1) as f32
            * self.ack_random_factor;
        Duration::from_millis(ms as u64)
    }

    /// From RFC7252: the maximum round-trip time,
    /// `(2 * MAX_LATENCY) + PROCESSING_DELAY`. This bounds how long an
    /// exchange stays open awaiting a separate response after an empty
    /// acknowledgement.
    pub fn max_rtt(&self) -> Duration {
        2 * MAX_LATENCY + self.processing_delay
    }

    /// The block size in bytes implied by `default_block_szx`.
    pub fn default_block_size(&self) -> usize {
        1 << (self.default_block_szx as usize + 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc_defaults() {
        let params = TransParams::default();
        assert_eq!(params.ack_timeout, Duration::from_secs(2));
        assert_eq!(params.max_retransmit, 4);
        assert_eq!(params.nstart, 1);
        assert_eq!(params.default_block_size(), 1024);
        assert_eq!(params.exchange_lifetime, Duration::from_secs(247));
        assert_eq!(params.max_transmit_span(), Duration::from_secs(45));
        assert_eq!(params.max_transmit_wait(), Duration::from_secs(93));
        assert_eq!(params.max_rtt(), Duration::from_secs(202));
    }

    #[test]
    fn initial_timeout_within_jitter_window() {
        let params = TransParams::default();
        for _ in 0..64 {
            let timeout = params.initial_retransmit_timeout();
            assert!(timeout >= params.ack_timeout);
            assert!(timeout <= Duration::from_secs(3));
        }
    }

    #[test]
    fn retransmit_schedule_shape() {
        // With the default parameters the transmission attempts land near
        // t = 0, 2..3, 6..9, 14..21 and 30..45 seconds.
        let params = TransParams::default();
        let initial = params.initial_retransmit_timeout();

        let mut elapsed = Duration::from_secs(0);
        let mut timeout = initial;
        for _ in 0..params.max_retransmit {
            elapsed += timeout;
            timeout *= 2;
        }

        assert!(elapsed >= Duration::from_secs(30));
        assert!(elapsed <= Duration::from_secs(45));
    }
}
