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
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};

/// What a handler wants done with its matcher registration after it has
/// seen a message.
pub(crate) enum Disposition<SA> {
    /// Leave the registration in place; more messages are expected.
    Keep,

    /// Remove the registration.
    Finish,

    /// Replace the token registration with a different handler. Used by an
    /// exchange handing its token over to an observe sink once the first
    /// notification-bearing response has been delivered.
    Handoff(Arc<Mutex<dyn ResponseHandler<SA>>>),
}

/// A handler reachable through the match tables.
///
/// `handle_ack` fires for acknowledgements and resets matched on
/// `(peer, message id)`: the message layer. `handle_response` fires for
/// response-coded messages matched on `(peer, token)`: the request layer. A
/// piggy-backed response triggers both, in that order.
pub(crate) trait ResponseHandler<SA>: Send {
    /// Called for an ACK or RST matched by message id. The message id
    /// registration is removed unconditionally before this is called; the
    /// returned disposition governs the token registration.
    fn handle_ack(&mut self, message: &Message) -> Disposition<SA> {
        let _ = message;
        Disposition::Keep
    }

    /// Called for a response matched by token.
    fn handle_response(&mut self, message: &Message) -> Disposition<SA> {
        let _ = message;
        Disposition::Keep
    }
}

/// The request/response match tables: the `recent_local_ids` side of the
/// engine.
///
/// Handlers are held weakly; a dropped exchange disappears from the tables
/// on its own, with explicit removal keeping them tidy.
pub(crate) struct Matcher<SA> {
    by_msg_id: HashMap<(SA, MsgId), Weak<Mutex<dyn ResponseHandler<SA>>>>,
    by_token: HashMap<(SA, MsgToken), Weak<Mutex<dyn ResponseHandler<SA>>>>,
}

impl<SA: Eq + Hash + Copy + Debug> Debug for Matcher<SA> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("Matcher")
            .field("by_msg_id", &self.by_msg_id.keys())
            .field("by_token", &self.by_token.keys())
            .finish()
    }
}

impl<SA: Eq + Hash + Copy> Matcher<SA> {
    pub(crate) fn new() -> Self {
        Matcher {
            by_msg_id: HashMap::new(),
            by_token: HashMap::new(),
        }
    }

    /// Registers a handler under a message id and, when the token is
    /// non-empty, under the token as well.
    pub(crate) fn register(
        &mut self,
        peer: SA,
        msg_id: MsgId,
        token: MsgToken,
        handler: &Arc<Mutex<dyn ResponseHandler<SA>>>,
    ) {
        self.by_msg_id.insert((peer, msg_id), Arc::downgrade(handler));
        if !token.is_empty() {
            self.by_token.insert((peer, token), Arc::downgrade(handler));
        }
    }

    /// Removes both registrations of a handler.
    pub(crate) fn deregister(&mut self, peer: SA, msg_id: MsgId, token: MsgToken) {
        self.by_msg_id.remove(&(peer, msg_id));
        if !token.is_empty() {
            self.by_token.remove(&(peer, token));
        }
    }

    /// Routes an inbound ACK or RST to the handler registered under
    /// `(peer, message id)`. Returns true if a live handler saw it.
    pub(crate) fn handle_ack(&mut self, peer: SA, message: &Message) -> bool {
        let weak = match self.by_msg_id.remove(&(peer, message.msg_id())) {
            Some(weak) => weak,
            None => return false,
        };

        let mutex = match weak.upgrade() {
            Some(mutex) => mutex,
            None => return false,
        };

        let disposition = mutex.lock().expect("lock failure").handle_ack(message);
        self.apply_token_disposition(peer, message.token(), disposition);
        true
    }

    /// Routes an inbound response to the handler registered under
    /// `(peer, token)`. Returns true if a live handler saw it.
    pub(crate) fn handle_response(&mut self, peer: SA, message: &Message) -> bool {
        let key = (peer, message.token());

        let mutex = match self.by_token.get(&key).and_then(Weak::upgrade) {
            Some(mutex) => mutex,
            None => {
                self.by_token.remove(&key);
                return false;
            }
        };

        let disposition = mutex.lock().expect("lock failure").handle_response(message);
        self.apply_token_disposition(peer, message.token(), disposition);
        true
    }

    fn apply_token_disposition(&mut self, peer: SA, token: MsgToken, disposition: Disposition<SA>) {
        match disposition {
            Disposition::Keep => {}
            Disposition::Finish => {
                if !token.is_empty() {
                    self.by_token.remove(&(peer, token));
                }
            }
            Disposition::Handoff(handler) => {
                if !token.is_empty() {
                    self.by_token.insert((peer, token), Arc::downgrade(&handler));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        acks: usize,
        responses: usize,
        disposition: fn() -> Disposition<u8>,
    }

    impl ResponseHandler<u8> for Recorder {
        fn handle_ack(&mut self, _message: &Message) -> Disposition<u8> {
            self.acks += 1;
            (self.disposition)()
        }

        fn handle_response(&mut self, _message: &Message) -> Disposition<u8> {
            self.responses += 1;
            (self.disposition)()
        }
    }

    fn recorder(disposition: fn() -> Disposition<u8>) -> Arc<Mutex<Recorder>> {
        Arc::new(Mutex::new(Recorder {
            acks: 0,
            responses: 0,
            disposition,
        }))
    }

    #[test]
    fn ack_matching_is_one_shot() {
        let mut matcher = Matcher::new();
        let handler = recorder(|| Disposition::Keep);
        let handler_dyn: Arc<Mutex<dyn ResponseHandler<u8>>> = handler.clone();

        let token = MsgToken::from(&b"tok"[..]);
        matcher.register(1u8, 42, token, &handler_dyn);

        let mut ack = Message::empty_ack(42);
        ack.set_token(MsgToken::EMPTY);

        assert!(matcher.handle_ack(1, &ack));
        assert!(!matcher.handle_ack(1, &ack));
        assert_eq!(handler.lock().unwrap().acks, 1);

        // The token registration survived the empty ACK.
        let mut response = Message::new(MsgType::Con, MsgCode::SuccessContent);
        response.set_token(token);
        assert!(matcher.handle_response(1, &response));
    }

    #[test]
    fn finish_removes_token_entry() {
        let mut matcher = Matcher::new();
        let handler = recorder(|| Disposition::Finish);
        let handler_dyn: Arc<Mutex<dyn ResponseHandler<u8>>> = handler.clone();

        let token = MsgToken::from(&b"tok"[..]);
        matcher.register(1u8, 42, token, &handler_dyn);

        let mut response = Message::new(MsgType::Ack, MsgCode::SuccessContent);
        response.set_msg_id(42);
        response.set_token(token);

        assert!(matcher.handle_response(1, &response));
        assert!(!matcher.handle_response(1, &response));
    }

    #[test]
    fn dead_handlers_do_not_match() {
        let mut matcher = Matcher::new();
        let token = MsgToken::from(&b"tok"[..]);
        {
            let handler = recorder(|| Disposition::Keep);
            let handler_dyn: Arc<Mutex<dyn ResponseHandler<u8>>> = handler.clone();
            matcher.register(1u8, 42, token, &handler_dyn);
        }

        let mut response = Message::new(MsgType::Ack, MsgCode::SuccessContent);
        response.set_msg_id(42);
        response.set_token(token);
        assert!(!matcher.handle_response(1, &response));
    }
}
