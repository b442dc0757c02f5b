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
use crate::consts::{OBSERVE_FRESHNESS_PERIOD, OBSERVE_SEQ_WINDOW};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Decides whether a notification bearing `new_seq` is fresher than the one
/// last accepted.
///
/// Sequence numbers live in a 24-bit space, so ordering is decided inside a
/// half-space window; after 128 seconds any sequence number wins regardless.
pub(crate) fn notification_is_fresher(
    last_seq: u32,
    last_time: Instant,
    new_seq: u32,
    now: Instant,
) -> bool {
    (last_seq < new_seq && new_seq - last_seq < OBSERVE_SEQ_WINDOW)
        || (last_seq > new_seq && last_seq - new_seq > OBSERVE_SEQ_WINDOW)
        || now > last_time + OBSERVE_FRESHNESS_PERIOD
}

/// One server-side observe relationship: the stored registration request
/// (re-dispatched to render each notification) and the 24-bit notification
/// sequence counter.
#[derive(Debug, Clone)]
pub(crate) struct Observation {
    pub(crate) request: Message,
    pub(crate) seq: u32,
}

impl Observation {
    pub(crate) fn new(request: Message) -> Observation {
        Observation { request, seq: 0 }
    }

    /// The path this observation is attached to.
    pub(crate) fn path(&self) -> Vec<String> {
        self.request.uri_path()
    }

    /// Advances and returns the next notification sequence number.
    pub(crate) fn next_seq(&mut self) -> u32 {
        self.seq = (self.seq + 1) % crate::consts::OBSERVE_SEQ_MODULO;
        self.seq
    }
}

/// Client-side observe state for one relationship: the notification
/// callback, staleness tracking, and reassembly state for notifications
/// that span multiple blocks.
///
/// Once the registering exchange has delivered its first response, the
/// matcher's token entry points here and every subsequent notification
/// flows through [`ObserveSink::handle_response`].
pub(crate) struct ObserveSink<S: AsyncDatagramSocket> {
    endpoint: Weak<EndpointInner<S>>,
    peer: S::SocketAddr,
    token: MsgToken,
    request: Message,
    callback: Box<dyn FnMut(&Message) + Send>,
    last_seq: Option<(u32, Instant)>,
    assembly: Option<NotificationAssembly>,
    active: bool,
}

#[derive(Debug)]
struct NotificationAssembly {
    assembler: BlockAssembler,
    /// The sequence number carried on the notification's first block,
    /// recorded once the assembly completes.
    seq: u32,
    /// The first block's message, which supplies code and options for the
    /// assembled notification.
    first: Message,
}

impl<S: AsyncDatagramSocket> ObserveSink<S> {
    pub(crate) fn new(
        endpoint: &Arc<EndpointInner<S>>,
        peer: S::SocketAddr,
        token: MsgToken,
        request: Message,
        callback: Box<dyn FnMut(&Message) + Send>,
    ) -> ObserveSink<S> {
        ObserveSink {
            endpoint: Arc::downgrade(endpoint),
            peer,
            token,
            request,
            callback,
            last_seq: None,
            assembly: None,
            active: true,
        }
    }

    /// The token this relationship is registered under.
    pub(crate) fn token(&self) -> MsgToken {
        self.token
    }

    /// The registration request this relationship was created with.
    pub(crate) fn request(&self) -> &Message {
        &self.request
    }

    /// Tears the relationship down locally. The matcher entry is removed by
    /// whoever holds the matcher lock.
    pub(crate) fn deactivate(&mut self) {
        self.active = false;
        self.assembly = None;
    }

    /// Feeds the first response of the registering exchange: seeds the
    /// staleness tracking and invokes the callback once.
    pub(crate) fn deliver_first(&mut self, message: &Message) {
        if let Some(seq) = message.observe() {
            self.last_seq = Some((seq, Instant::now()));
        }
        (self.callback)(message);
    }

    fn accept(&mut self, seq: u32) -> bool {
        let now = Instant::now();
        let fresh = match self.last_seq {
            Some((last_seq, last_time)) => notification_is_fresher(last_seq, last_time, seq, now),
            None => true,
        };
        if fresh {
            self.last_seq = Some((seq, now));
        }
        fresh
    }

    /// Asks the endpoint to fetch the next block of a multi-block
    /// notification: a confirmable GET without Observe, on this
    /// relationship's token.
    fn request_next_block(&self, block: BlockInfo) {
        let endpoint = match self.endpoint.upgrade() {
            Some(endpoint) => endpoint,
            None => return,
        };

        let mut request = self.request.clone();
        request.set_msg_type(MsgType::Con);
        request.set_msg_id(endpoint.next_msg_id());
        request.set_token(self.token);
        request.clear_observe();
        request.set_block2(Some(block));
        request.set_payload(Vec::new());

        endpoint.send_reliable_detached(self.peer, request);
    }
}

impl<S: AsyncDatagramSocket> ResponseHandler<S::SocketAddr> for ObserveSink<S> {
    fn handle_response(&mut self, message: &Message) -> Disposition<S::SocketAddr> {
        if !self.active {
            return Disposition::Finish;
        }

        if message.code().is_error() {
            debug!("observe {}: error response {}, deregistering", self.token, message.code());
            (self.callback)(message);
            self.deactivate();
            if let Some(endpoint) = self.endpoint.upgrade() {
                endpoint.remove_sink(self.peer, self.token);
            }
            return Disposition::Finish;
        }

        if let Some(seq) = message.observe() {
            // A new notification. Anything being reassembled is stale now.
            let had_assembly = self.assembly.take().is_some();
            if had_assembly {
                debug!("observe {}: fresher notification invalidates partial assembly", self.token);
            }

            let stale = {
                let now = Instant::now();
                match self.last_seq {
                    Some((last_seq, last_time)) => {
                        !notification_is_fresher(last_seq, last_time, seq, now)
                    }
                    None => false,
                }
            };
            if stale {
                debug!("observe {}: dropping stale notification seq {}", self.token, seq);
                return Disposition::Keep;
            }

            match message.block2() {
                Some(block) if block.more_flag() => {
                    // First block of a multi-block notification; the rest is
                    // fetched without the Observe option on the same token.
                    let mut assembler = BlockAssembler::new();
                    if assembler.feed(block, message.payload()).is_err() {
                        return Disposition::Keep;
                    }
                    let next = assembler.next_block();
                    self.assembly = Some(NotificationAssembly {
                        assembler,
                        seq,
                        first: message.clone(),
                    });
                    self.request_next_block(next);
                }
                _ => {
                    self.accept(seq);
                    (self.callback)(message);
                }
            }

            return Disposition::Keep;
        }

        if let (Some(block), true) = (message.block2(), self.assembly.is_some()) {
            // Continuation of a multi-block notification.
            let mut assembly = self.assembly.take().expect("assembly checked above");
            match assembly.assembler.feed(block, message.payload()) {
                Err(_) => {
                    debug!("observe {}: bad continuation block, dropping assembly", self.token);
                }
                Ok(false) => {
                    let next = assembly.assembler.next_block();
                    self.assembly = Some(assembly);
                    self.request_next_block(next);
                }
                Ok(true) => {
                    let NotificationAssembly { assembler, seq, mut first } = assembly;
                    first.set_payload(assembler.into_payload());
                    first.set_block2(None);
                    self.accept(seq);
                    (self.callback)(&first);
                }
            }
            return Disposition::Keep;
        }

        // A response without Observe terminates the relationship.
        debug!("observe {}: response without Observe, deregistering", self.token);
        (self.callback)(message);
        self.deactivate();
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.remove_sink(self.peer, self.token);
        }
        Disposition::Finish
    }
}

impl<S: AsyncDatagramSocket> std::fmt::Debug for ObserveSink<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserveSink")
            .field("peer", &self.peer)
            .field("token", &self.token)
            .field("last_seq", &self.last_seq)
            .field("active", &self.active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn freshness_window() {
        let t1 = Instant::now();

        // Sequence going backwards within the window is stale...
        assert!(!notification_is_fresher(5, t1, 3, t1 + Duration::from_secs(1)));
        // ...but acceptable once the freshness period has passed.
        assert!(notification_is_fresher(5, t1, 3, t1 + Duration::from_secs(200)));

        // Ordinary forward progress.
        assert!(notification_is_fresher(5, t1, 6, t1 + Duration::from_secs(1)));

        // A duplicate is never fresher.
        assert!(!notification_is_fresher(5, t1, 5, t1 + Duration::from_secs(1)));

        // Wrap-around: a tiny sequence number beats one near the top of the
        // 24-bit space.
        let top = crate::consts::OBSERVE_SEQ_MODULO - 2;
        assert!(notification_is_fresher(top, t1, 1, t1 + Duration::from_secs(1)));
        assert!(!notification_is_fresher(1, t1, top, t1 + Duration::from_secs(1)));
    }

    #[test]
    fn observation_sequence_increments() {
        let mut request = Message::request(MsgCode::MethodGet);
        request.set_uri_path(&["obs"]);
        let mut observation = Observation::new(request);
        assert_eq!(observation.path(), vec!["obs"]);
        assert_eq!(observation.next_seq(), 1);
        assert_eq!(observation.next_seq(), 2);
    }
}
