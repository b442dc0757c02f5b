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
use futures::prelude::*;
use futures::task::{Context, Poll, Waker};
use futures_timer::Delay;
use std::fmt::{Display, Formatter};
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Future returned by [`Endpoint::request`][super::Endpoint::request] and
/// friends: one client exchange, resolving with the first (block-wise
/// reassembled) response.
///
/// Dropping the future cancels the exchange: the retransmission timer dies
/// with it and its matcher registrations are removed.
pub struct ExchangeFuture<S: AsyncDatagramSocket> {
    inner: Arc<Mutex<ExchangeState<S>>>,
}

#[derive(Debug)]
enum ExchangeStage {
    /// The current message hasn't been (re)built and transmitted yet.
    Uninit,

    /// A confirmable message is in flight; we retransmit until it is
    /// acknowledged or answered.
    ActivelyWaiting,

    /// Waiting for a (separate) response; no retransmissions.
    PassivelyWaiting,

    /// Finished, result not yet collected by the owner.
    Finished(Result<Message, Error>),

    /// Result collected.
    Expired,
}

impl Display for ExchangeStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            ExchangeStage::Uninit => f.write_str("Uninit"),
            ExchangeStage::ActivelyWaiting => f.write_str("ActivelyWaiting"),
            ExchangeStage::PassivelyWaiting => f.write_str("PassivelyWaiting"),
            ExchangeStage::Finished(Ok(_)) => f.write_str("Finished"),
            ExchangeStage::Finished(Err(e)) => write!(f, "Errored({:?})", e),
            ExchangeStage::Expired => f.write_str("Expired"),
        }
    }
}

/// Progress of a block1 (request body) upload.
#[derive(Debug)]
struct Block1Cursor {
    payload: Vec<u8>,
    szx: u8,
    next_offset: usize,
    pending_len: usize,
}

impl Block1Cursor {
    fn is_last_pending(&self) -> bool {
        self.next_offset + self.pending_len >= self.payload.len()
    }
}

pub(crate) struct ExchangeState<S: AsyncDatagramSocket> {
    endpoint: Weak<EndpointInner<S>>,
    dest: S::SocketAddr,

    /// The request as the caller handed it over, used as the template for
    /// block continuations.
    template: Message,

    /// The message currently on the wire (or about to be).
    current: Message,
    encoded: Option<Vec<u8>>,

    stage: ExchangeStage,
    waker: Option<Waker>,
    delay: Option<Delay>,
    timeout: Duration,
    attempts: u32,

    /// The matcher registration this exchange currently owns.
    registered: Option<(MsgId, MsgToken)>,
    /// A message-id registration made obsolete by a block continuation.
    stale_mid: Option<MsgId>,
    holds_flight_slot: bool,

    block1: Option<Block1Cursor>,
    block2: Option<BlockAssembler>,

    observe_sink: Option<Arc<Mutex<ObserveSink<S>>>>,
    sink_installed: bool,
    /// Observe sequence from the first block of a block-wise first
    /// response; later blocks don't carry the option.
    first_observe_seq: Option<u32>,

    is_ping: bool,
}

impl<S: AsyncDatagramSocket> ExchangeState<S> {
    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }

    fn finish(&mut self, result: Result<Message, Error>) {
        self.delay = None;
        self.stage = ExchangeStage::Finished(result);
        self.wake();
    }

    /// Builds the follow-up GET for the next block2 chunk: identical options,
    /// no payload, no Observe, fresh message id and token.
    fn prepare_block2_continuation(&mut self, endpoint: &Arc<EndpointInner<S>>, next: BlockInfo) {
        let mut next_msg = self.template.clone();
        next_msg.set_msg_id(endpoint.next_msg_id());
        next_msg.set_token(endpoint.next_token());
        next_msg.clear_observe();
        next_msg.set_block2(Some(next));
        next_msg.set_block1(None);
        next_msg.set_payload(Vec::new());

        self.stale_mid = self.registered.map(|(msg_id, _)| msg_id);
        self.current = next_msg;
        self.encoded = None;
        self.attempts = 0;
        self.stage = ExchangeStage::Uninit;
        self.wake();
    }

    /// Builds the next block1 chunk at the cursor position, keeping the
    /// token and taking a fresh message id.
    fn prepare_block1_continuation(&mut self, endpoint: &Arc<EndpointInner<S>>) {
        let cursor = self.block1.as_mut().expect("block1 cursor");
        let size = 1usize << (cursor.szx + 4);
        let num = (cursor.next_offset / size) as u32;
        let end = cursor.payload.len().min(cursor.next_offset + size);
        let chunk = cursor.payload[cursor.next_offset..end].to_vec();
        let more = end < cursor.payload.len();
        cursor.pending_len = chunk.len();

        let block = BlockInfo::new(num, more, cursor.szx).expect("block1 cursor out of range");

        let mut next_msg = self.template.clone();
        next_msg.set_msg_id(endpoint.next_msg_id());
        next_msg.set_token(self.current.token());
        next_msg.set_block1(Some(block));
        next_msg.set_option_uint(OptionNumber::SIZE1, cursor.payload.len() as u32);
        next_msg.set_payload(chunk);

        self.stale_mid = self.registered.map(|(msg_id, _)| msg_id);
        self.current = next_msg;
        self.encoded = None;
        self.attempts = 0;
        self.stage = ExchangeStage::Uninit;
        self.wake();
    }

    /// Delivers the logical response: the exchange's final transition.
    fn complete(&mut self, mut response: Message) -> Disposition<S::SocketAddr> {
        if response.observe().is_none() {
            if let Some(seq) = self.first_observe_seq {
                response.set_observe(seq);
            }
        }

        let mut disposition = Disposition::Finish;

        if let Some(sink) = self.observe_sink.clone() {
            let keep_sink = response.observe().is_some() && !response.code().is_error();
            if keep_sink {
                sink.lock().expect("sink mutex poisoned").deliver_first(&response);
                if !self.sink_installed {
                    // Hand the token entry over to the sink so later
                    // notifications keep flowing.
                    self.sink_installed = true;
                    disposition = Disposition::Handoff(sink);
                }
            } else if !self.sink_installed {
                sink.lock().expect("sink mutex poisoned").deactivate();
            }
        }

        // The matcher drops (or replaces) the token entry per the returned
        // disposition; only the message-id entry may still need cleanup.
        self.registered = self.registered.map(|(msg_id, _)| (msg_id, MsgToken::EMPTY));
        self.finish(Ok(response));
        disposition
    }
}

impl<S: AsyncDatagramSocket> ResponseHandler<S::SocketAddr> for ExchangeState<S> {
    fn handle_ack(&mut self, message: &Message) -> Disposition<S::SocketAddr> {
        match self.stage {
            ExchangeStage::ActivelyWaiting | ExchangeStage::PassivelyWaiting => {}
            _ => return Disposition::Keep,
        }

        if self.holds_flight_slot {
            // The peer has spoken; this interaction no longer counts
            // against NSTART.
            if let Some(endpoint) = self.endpoint.upgrade() {
                endpoint.release_flight(self.dest);
            }
            self.holds_flight_slot = false;
        }

        if message.msg_type().is_rst() {
            self.registered = None;
            if self.is_ping {
                // A reset is the expected answer to a ping.
                self.finish(Ok(message.clone()));
            } else {
                self.finish(Err(Error::Reset));
            }
            return Disposition::Finish;
        }

        if message.code().is_empty() {
            if self.is_ping {
                self.registered = None;
                self.finish(Ok(message.clone()));
                return Disposition::Finish;
            }

            // Empty ACK: the response will arrive separately, matched by
            // token. Stop retransmitting and wait out MAX_RTT.
            debug!("exchange MID:0x{:04X}: empty ack, awaiting separate response", message.msg_id());
            self.stage = ExchangeStage::PassivelyWaiting;
            if let Some(endpoint) = self.endpoint.upgrade() {
                self.delay = Some(Delay::new(endpoint.params().max_rtt()));
            }
            self.wake();
            return Disposition::Keep;
        }

        // Piggy-backed response: the content is delivered through
        // handle_response immediately after this call. Just stop the
        // retransmission timer here.
        self.stage = ExchangeStage::PassivelyWaiting;
        self.delay = None;
        Disposition::Keep
    }

    fn handle_response(&mut self, message: &Message) -> Disposition<S::SocketAddr> {
        match self.stage {
            ExchangeStage::ActivelyWaiting | ExchangeStage::PassivelyWaiting => {}
            _ => return Disposition::Keep,
        }

        let endpoint = match self.endpoint.upgrade() {
            Some(endpoint) => endpoint,
            None => {
                self.finish(Err(Error::Cancelled));
                return Disposition::Finish;
            }
        };

        if self.holds_flight_slot {
            endpoint.release_flight(self.dest);
            self.holds_flight_slot = false;
        }

        // Block1 upload in progress: intermediate blocks are acknowledged
        // with 2.31 Continue.
        if let Some(cursor) = self.block1.as_mut() {
            if message.code() == MsgCode::SuccessContinue && !cursor.is_last_pending() {
                cursor.next_offset += cursor.pending_len;

                // The server may shrink the block size; later blocks restart
                // at the number the new size implies for our offset.
                if let Some(echo) = message.block1() {
                    if echo.szx() < cursor.szx {
                        debug!(
                            "block1: peer renegotiated szx {} -> {}",
                            cursor.szx,
                            echo.szx()
                        );
                        cursor.szx = echo.szx();
                    }
                }

                self.prepare_block1_continuation(&endpoint);
                return Disposition::Keep;
            }
            // Anything else is the logical response to the whole upload.
            self.block1 = None;
        }

        // Block2 download: collect chunks until the more flag clears.
        if let Some(block) = message.block2() {
            let assembler = self.block2.get_or_insert_with(BlockAssembler::new);
            match assembler.feed(block, message.payload()) {
                Err(e) => {
                    self.registered = self.registered.map(|(msg_id, _)| (msg_id, MsgToken::EMPTY));
                    self.finish(Err(e));
                    return Disposition::Finish;
                }
                Ok(false) => {
                    let next = assembler.next_block();

                    // Only the first block of an observe notification
                    // carries Observe; if we are registering, the token must
                    // belong to the sink before the continuation GETs (which
                    // use fresh tokens) go out.
                    let mut disposition = Disposition::Finish;
                    if let (Some(sink), Some(seq), false) =
                        (self.observe_sink.clone(), message.observe(), self.sink_installed)
                    {
                        self.sink_installed = true;
                        self.first_observe_seq = Some(seq);
                        disposition = Disposition::Handoff(sink);
                    }

                    self.prepare_block2_continuation(&endpoint, next);
                    return disposition;
                }
                Ok(true) => {
                    let assembler = self.block2.take().expect("assembler just fed");
                    let mut response = message.clone();
                    response.set_payload(assembler.into_payload());
                    response.set_block2(None);
                    return self.complete(response);
                }
            }
        }

        self.complete(message.clone())
    }
}

impl<S: AsyncDatagramSocket> ExchangeFuture<S> {
    pub(crate) fn new(
        endpoint: &Arc<EndpointInner<S>>,
        dest: S::SocketAddr,
        mut message: Message,
        observe_sink: Option<Arc<Mutex<ObserveSink<S>>>>,
    ) -> ExchangeFuture<S> {
        let is_ping = message.code().is_empty();

        if message.token().is_empty() && !is_ping {
            message.set_token(endpoint.next_token());
        }
        message.set_msg_id(endpoint.next_msg_id());

        let template = message.clone();

        // A request body larger than the block size is uploaded with block1.
        let mut block1 = None;
        let block_size_limit = message
            .block1()
            .map(|block| block.szx().min(endpoint.params().default_block_szx))
            .unwrap_or(endpoint.params().default_block_szx);

        let szx = block_size_limit;
        let size = 1usize << (szx as usize + 4);
        if message.is_request() && message.payload().len() > size {
            let payload = message.take_payload();
            let chunk = payload[..size].to_vec();

            message.set_block1(Some(BlockInfo::new(0, true, szx).expect("szx in range")));
            message.set_option_uint(OptionNumber::SIZE1, payload.len() as u32);
            message.set_payload(chunk);

            block1 = Some(Block1Cursor {
                payload,
                szx,
                next_offset: 0,
                pending_len: size,
            });
        }

        let timeout = endpoint.params().initial_retransmit_timeout();

        ExchangeFuture {
            inner: Arc::new(Mutex::new(ExchangeState {
                endpoint: Arc::downgrade(endpoint),
                dest,
                template,
                current: message,
                encoded: None,
                stage: ExchangeStage::Uninit,
                waker: None,
                delay: None,
                timeout,
                attempts: 0,
                registered: None,
                stale_mid: None,
                holds_flight_slot: false,
                block1,
                block2: None,
                observe_sink,
                sink_installed: false,
                first_observe_seq: None,
                is_ping,
            })),
        }
    }

    fn poll_inner(&mut self, cx: &mut Context<'_>) -> Poll<Result<Message, Error>> {
        let mut register_after: Option<(S::SocketAddr, MsgId, MsgToken)> = None;
        let mut deregister_after: Option<(S::SocketAddr, MsgId)> = None;
        let mut finished: Option<Result<Message, Error>> = None;

        {
            let mut state = self.inner.lock().expect("exchange mutex poisoned");

            let endpoint = match state.endpoint.upgrade() {
                Some(endpoint) => endpoint,
                None => return Poll::Ready(Err(Error::Cancelled)),
            };

            match state.stage {
                ExchangeStage::Uninit => {
                    let confirmable = state.current.msg_type().is_con();

                    // NSTART: only so many confirmable interactions may be
                    // outstanding toward one peer.
                    if confirmable && !state.holds_flight_slot {
                        if endpoint.try_acquire_flight(state.dest, cx.waker()) {
                            state.holds_flight_slot = true;
                        } else {
                            state.waker = Some(cx.waker().clone());
                            return Poll::Pending;
                        }
                    }

                    if state.encoded.is_none() {
                        match state.current.encode() {
                            Ok(encoded) => {
                                if encoded.len() > endpoint.params().max_message_size {
                                    state.finish(Err(Error::OutOfSpace));
                                } else {
                                    state.encoded = Some(encoded);
                                }
                            }
                            Err(e) => state.finish(Err(e)),
                        }
                    }

                    if let Some(encoded) = state.encoded.as_ref() {
                        debug!("OUTBOUND: {} {}", state.dest, state.current);
                        match Pin::new(endpoint.socket()).poll_send_to(cx, encoded, state.dest) {
                            Poll::Pending => {}
                            Poll::Ready(Err(e)) => {
                                warn!("send_to: io error: {:?} (dest={})", e, state.dest);
                                state.finish(Err(Error::Io));
                            }
                            Poll::Ready(Ok(_)) => {
                                if confirmable {
                                    state.timeout = endpoint.params().initial_retransmit_timeout();
                                    let timeout = state.timeout;
                                    state.delay = Some(Delay::new(timeout));
                                    state.stage = ExchangeStage::ActivelyWaiting;
                                } else {
                                    state.delay = Some(Delay::new(endpoint.params().max_rtt()));
                                    state.stage = ExchangeStage::PassivelyWaiting;
                                }

                                register_after = Some((
                                    state.dest,
                                    state.current.msg_id(),
                                    state.current.token(),
                                ));
                                deregister_after =
                                    state.stale_mid.take().map(|msg_id| (state.dest, msg_id));
                            }
                        }
                    }
                }

                ExchangeStage::ActivelyWaiting => {
                    let expired = match state.delay.as_mut() {
                        Some(delay) => Pin::new(delay).poll(cx).is_ready(),
                        None => false,
                    };

                    if expired {
                        if state.attempts < endpoint.params().max_retransmit {
                            let sent = {
                                let encoded = state.encoded.as_ref().expect("encoded in flight");
                                Pin::new(endpoint.socket()).poll_send_to(cx, encoded, state.dest)
                            };
                            match sent {
                                Poll::Pending => {}
                                Poll::Ready(Err(e)) => {
                                    warn!("send_to: io error: {:?} (dest={})", e, state.dest);
                                    state.finish(Err(Error::Io));
                                }
                                Poll::Ready(Ok(_)) => {
                                    state.attempts += 1;
                                    state.timeout *= 2;
                                    let timeout = state.timeout;
                                    debug!(
                                        "OUTBOUND[{}]: {} {}",
                                        state.attempts, state.dest, state.current
                                    );
                                    match state.delay.as_mut() {
                                        Some(delay) => delay.reset(timeout),
                                        None => state.delay = Some(Delay::new(timeout)),
                                    }
                                    if let Some(delay) = state.delay.as_mut() {
                                        let _ = Pin::new(delay).poll(cx);
                                    }
                                }
                            }
                        } else {
                            state.finish(Err(Error::Timeout));
                        }
                    }
                }

                ExchangeStage::PassivelyWaiting => {
                    let expired = match state.delay.as_mut() {
                        Some(delay) => Pin::new(delay).poll(cx).is_ready(),
                        None => false,
                    };

                    if expired {
                        state.finish(Err(Error::Timeout));
                    }
                }

                ExchangeStage::Finished(_) | ExchangeStage::Expired => {}
            }

            if let ExchangeStage::Finished(_) = state.stage {
                let mut stage = ExchangeStage::Expired;
                std::mem::swap(&mut state.stage, &mut stage);
                if let ExchangeStage::Finished(result) = stage {
                    finished = Some(result);
                }
            } else {
                state.waker = Some(cx.waker().clone());
            }
        }

        if let Some((dest, msg_id)) = deregister_after {
            if let Some(endpoint) = self.endpoint() {
                endpoint
                    .matcher()
                    .lock()
                    .expect("matcher mutex poisoned")
                    .deregister(dest, msg_id, MsgToken::EMPTY);
            }
        }

        if let Some((dest, msg_id, token)) = register_after {
            if let Some(endpoint) = self.endpoint() {
                let handler: Arc<Mutex<dyn ResponseHandler<S::SocketAddr>>> = self.inner.clone();
                endpoint
                    .matcher()
                    .lock()
                    .expect("matcher mutex poisoned")
                    .register(dest, msg_id, token, &handler);
                self.inner.lock().expect("exchange mutex poisoned").registered =
                    Some((msg_id, token));
            }
        }

        if let Some(result) = finished {
            self.cleanup();
            Poll::Ready(result)
        } else {
            Poll::Pending
        }
    }

    fn endpoint(&self) -> Option<Arc<EndpointInner<S>>> {
        self.inner
            .lock()
            .expect("exchange mutex poisoned")
            .endpoint
            .upgrade()
    }

    /// Removes whatever the exchange still owns: matcher entries, the
    /// NSTART slot, and an observe sink that was never installed.
    fn cleanup(&mut self) {
        let (endpoint, dest, registered, flight, sink) = {
            let mut state = self.inner.lock().expect("exchange mutex poisoned");
            let flight = state.holds_flight_slot;
            state.holds_flight_slot = false;
            let sink = if !state.sink_installed {
                state.observe_sink.take()
            } else {
                None
            };
            (
                state.endpoint.upgrade(),
                state.dest,
                state.registered.take(),
                flight,
                sink,
            )
        };

        let endpoint = match endpoint {
            Some(endpoint) => endpoint,
            None => return,
        };

        if let Some((msg_id, token)) = registered {
            endpoint
                .matcher()
                .lock()
                .expect("matcher mutex poisoned")
                .deregister(dest, msg_id, token);
        }

        if flight {
            endpoint.release_flight(dest);
        }

        if let Some(sink) = sink {
            let token = {
                let mut sink = sink.lock().expect("sink mutex poisoned");
                sink.deactivate();
                sink.token()
            };
            endpoint.remove_sink(dest, token);
        }
    }
}

impl<S: AsyncDatagramSocket> Future for ExchangeFuture<S> {
    type Output = Result<Message, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().poll_inner(cx)
    }
}

impl<S: AsyncDatagramSocket> Drop for ExchangeFuture<S> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl<S: AsyncDatagramSocket> std::fmt::Debug for ExchangeFuture<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock().expect("exchange mutex poisoned");
        f.debug_struct("ExchangeFuture")
            .field("dest", &state.dest)
            .field("stage", &state.stage)
            .field("attempts", &state.attempts)
            .finish()
    }
}
