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

//! The inbound half of the endpoint: the receive loop, the request
//! pipeline (dedup, block1 reassembly, dispatch, block2 serving, observe
//! registration), and server-initiated notifications.

use super::endpoint::Block2Entry;
use super::*;
use futures::future::Either;
use futures::prelude::*;
use futures::stream::FuturesUnordered;
use futures_timer::Delay;
use std::sync::Arc;
use std::time::Instant;

impl<S: AsyncDatagramSocket> Endpoint<S> {
    /// Drives the endpoint: receives datagrams, routes responses to their
    /// exchanges, dispatches requests, and completes deferred work
    /// (separate responses, notifications, block fetches).
    ///
    /// Every other future this endpoint hands out requires this loop to be
    /// running. It only returns on socket failure.
    pub async fn receive_loop(&self) -> Result<(), Error> {
        let inner = self.inner().clone();

        let mut task_queue = inner.take_task_queue().ok_or(Error::InvalidArgument)?;
        let mut tasks: FuturesUnordered<futures::future::BoxFuture<'static, ()>> =
            FuturesUnordered::new();

        let mut buffer = vec![0u8; inner.params().max_message_size.max(2048)];

        loop {
            futures::select! {
                result = inner.socket().recv_from(&mut buffer).fuse() => {
                    let (len, from) = match result {
                        Ok(x) => x,
                        Err(e) => {
                            error!("receive loop: socket error: {:?}", e);
                            return Err(Error::Io);
                        }
                    };
                    inner.process_datagram(&buffer[..len], from);
                }
                task = task_queue.select_next_some() => {
                    tasks.push(task);
                }
                _ = tasks.select_next_some() => {}
            }
        }
    }

    /// Tells the engine that the resource at `path` has changed: every
    /// observation of that path is re-rendered through the dispatcher and
    /// sent a confirmable notification.
    ///
    /// Observations whose peer resets or never acknowledges are dropped.
    pub fn notify<T: AsRef<str>>(&self, path: &[T]) -> impl Future<Output = ()> {
        let inner = self.inner().clone();
        let path: Vec<String> = path.iter().map(|s| s.as_ref().to_string()).collect();

        async move {
            // The representation changed; partial transfers of the old one
            // are void.
            inner
                .block2_cache()
                .lock()
                .expect("block2 cache mutex poisoned")
                .retain(|(_, cached_path), _| *cached_path != path);

            let targets: Vec<(S::SocketAddr, MsgToken, Message, u32)> = {
                let mut observations = inner
                    .observations()
                    .lock()
                    .expect("observations mutex poisoned");
                observations
                    .iter_mut()
                    .filter(|(_, observation)| observation.path() == path)
                    .map(|((peer, token), observation)| {
                        (*peer, *token, observation.request.clone(), observation.next_seq())
                    })
                    .collect()
            };

            let notifications = targets.into_iter().map(|(peer, token, request, seq)| {
                let inner = inner.clone();
                async move {
                    let result = inner.dispatch().dispatch(request.clone(), peer).await;
                    let failed = result.is_err();

                    let mut response = inner.render_response(&request, result, peer);
                    response.set_msg_type(MsgType::Con);
                    response.set_msg_id(inner.next_msg_id());
                    response.set_token(token);
                    response.set_observe(seq);

                    let response = inner.apply_block2(&request, response, peer, None);

                    debug!("NOTIFY: {} {}", peer, response);
                    let delivered = match TransactionFuture::new(&inner, peer, &response) {
                        Ok(transaction) => transaction.await.is_ok(),
                        Err(e) => {
                            warn!("notification encode failed: {:?}", e);
                            false
                        }
                    };

                    if !delivered || failed {
                        info!("dropping observation {} for {}", token, peer);
                        inner
                            .observations()
                            .lock()
                            .expect("observations mutex poisoned")
                            .remove(&(peer, token));
                    }
                }
            });

            futures::future::join_all(notifications).await;
        }
    }
}

impl<S: AsyncDatagramSocket> EndpointInner<S> {
    /// Classifies one inbound datagram and routes it. Synchronous: anything
    /// slow is pushed onto the task queue.
    pub(crate) fn process_datagram(&self, packet: &[u8], from: S::SocketAddr) {
        let message = match Message::decode(packet) {
            Ok(message) => message,
            Err(e) => {
                warn!("undecodable datagram from {}: {:?}", from, e);
                // The mid is still legible for most malformed datagrams;
                // answer confirmable garbage with a reset.
                if packet.len() >= 4 && packet[0] >> 6 == 1 && (packet[0] >> 4) & 0b11 == 0 {
                    let msg_id = u16::from_be_bytes([packet[2], packet[3]]);
                    self.send_detached(Message::reset(msg_id), from);
                }
                return;
            }
        };

        debug!("INBOUND: {} {}", from, message);

        if message.is_request() {
            self.process_request(message, from);
            return;
        }

        if message.code().is_empty() {
            match message.msg_type() {
                // An empty CON is a ping; a reset is its pong.
                MsgType::Con => {
                    self.send_detached(Message::reset(message.msg_id()), from);
                }
                MsgType::Ack | MsgType::Rst => {
                    let handled = self
                        .matcher()
                        .lock()
                        .expect("matcher mutex poisoned")
                        .handle_ack(from, &message);
                    if !handled {
                        debug!("stray {} from {}", message.msg_type(), from);
                    }
                }
                MsgType::Non => {}
            }
            return;
        }

        // A response.
        self.process_response(message, from);
    }

    fn process_response(&self, message: Message, from: S::SocketAddr) {
        let msg_type = message.msg_type();

        // Separate responses arrive as CON/NON and are subject to the same
        // dedup rules as requests.
        if msg_type.is_con() || msg_type.is_non() {
            match self.dedup().lock().expect("dedup mutex poisoned").check(from, message.msg_id()) {
                DedupOutcome::New => {}
                DedupOutcome::Duplicate => {
                    if msg_type.is_con() {
                        self.send_detached(Message::empty_ack(message.msg_id()), from);
                    }
                    return;
                }
                DedupOutcome::DuplicateWithReply(reply) => {
                    self.send_raw_detached(reply, from);
                    return;
                }
            }
        }

        let matched = {
            let mut matcher = self.matcher().lock().expect("matcher mutex poisoned");
            if msg_type.is_ack() {
                // Piggy-backed: settle the message layer first, then deliver
                // the content by token.
                matcher.handle_ack(from, &message);
            }
            matcher.handle_response(from, &message)
        };

        if matched {
            if msg_type.is_con() {
                let ack = Message::empty_ack(message.msg_id());
                if let Ok(bytes) = ack.encode() {
                    self.dedup()
                        .lock()
                        .expect("dedup mutex poisoned")
                        .cache_reply(from, message.msg_id(), bytes.clone());
                    self.send_raw_detached(bytes, from);
                }
            }
        } else if msg_type.is_con() || msg_type.is_non() {
            // A response nothing is waiting for: answer with reset.
            debug!("response with unknown token from {}, sending reset", from);
            let reset = Message::reset(message.msg_id());
            if let Ok(bytes) = reset.encode() {
                self.dedup()
                    .lock()
                    .expect("dedup mutex poisoned")
                    .cache_reply(from, message.msg_id(), bytes.clone());
                self.send_raw_detached(bytes, from);
            }
        }
    }

    fn process_request(&self, message: Message, from: S::SocketAddr) {
        // Message-layer dedup: a duplicate gets the cached reply verbatim,
        // or another acknowledgement while the original is still cooking.
        match self.dedup().lock().expect("dedup mutex poisoned").check(from, message.msg_id()) {
            DedupOutcome::New => {}
            DedupOutcome::Duplicate => {
                if message.msg_type().is_con() {
                    self.send_detached(Message::empty_ack(message.msg_id()), from);
                }
                return;
            }
            DedupOutcome::DuplicateWithReply(reply) => {
                debug!("duplicate request MID:0x{:04X}, replaying reply", message.msg_id());
                self.send_raw_detached(reply, from);
                return;
            }
        }

        // Critical options must be understood before anything else happens.
        if let Some(number) = message.unknown_critical_option() {
            info!("request from {} carries unknown critical option {}", from, number);
            self.reply_with_error(&message, Error::BadOption, from);
            return;
        }

        // Block1: reassemble the request body; intermediate blocks never
        // reach the dispatcher.
        let mut block1_echo = None;
        let mut request = message;
        if let Some(block) = request.block1() {
            let key = (from, request.token());
            let mut partials = self.block1_partial().lock().expect("block1 mutex poisoned");

            if block.num() == 0 {
                partials.insert(key, BlockAssembler::new());
            }

            let assembler = match partials.get_mut(&key) {
                Some(assembler) => assembler,
                None => {
                    drop(partials);
                    self.reply_with_error_code(
                        &request,
                        MsgCode::ClientErrorRequestEntityIncomplete,
                        from,
                    );
                    return;
                }
            };

            match assembler.feed(block, request.payload()) {
                Err(_) => {
                    partials.remove(&key);
                    drop(partials);
                    self.reply_with_error_code(
                        &request,
                        MsgCode::ClientErrorRequestEntityIncomplete,
                        from,
                    );
                    return;
                }
                Ok(false) => {
                    drop(partials);
                    let mut reply =
                        Message::piggybacked_reply(&request, MsgCode::SuccessContinue);
                    if request.msg_type().is_non() {
                        reply.set_msg_type(MsgType::Non);
                        reply.set_msg_id(self.next_msg_id());
                    }
                    reply.set_block1(Some(block.with_more_flag()));
                    self.reply_and_cache(reply, request.msg_id(), from);
                    return;
                }
                Ok(true) => {
                    let assembler = partials.remove(&key).expect("assembler just fed");
                    drop(partials);
                    request.set_payload(assembler.into_payload());
                    request.set_block1(None);
                    block1_echo = Some(block.without_more_flag());
                }
            }
        }

        // Observe cancellation is effective immediately, before dispatch.
        if request.code() == MsgCode::MethodGet
            && request.observe() == Some(crate::consts::OBSERVE_DEREGISTER)
        {
            self.observations()
                .lock()
                .expect("observations mutex poisoned")
                .remove(&(from, request.token()));
        }

        // A continuation GET for a block-wise response is served from the
        // representation cache when possible; it falls through to a fresh
        // dispatch otherwise.
        if let Some(block) = request.block2() {
            if block.num() > 0 {
                let cached = {
                    let cache = self.block2_cache().lock().expect("block2 cache mutex poisoned");
                    cache
                        .get(&(from, request.uri_path()))
                        .filter(|entry| entry.expires > Instant::now())
                        .map(|entry| entry.response.clone())
                };
                if let Some(full) = cached {
                    let mut response = self.apply_block2(&request, full, from, Some(block));
                    response.clear_observe();
                    self.finish_reply(&request, &mut response, from);
                    self.reply_and_cache(response, request.msg_id(), from);
                    return;
                }
            }
        }

        self.spawn_dispatch(request, from, block1_echo);
    }

    /// Runs the dispatcher, racing it against the empty-acknowledgement
    /// budget for confirmable requests.
    fn spawn_dispatch(
        &self,
        request: Message,
        from: S::SocketAddr,
        block1_echo: Option<BlockInfo>,
    ) {
        let inner = self.arc();

        self.spawn(
            async move {
                let dispatch_future = inner.dispatch().dispatch(request.clone(), from);

                if request.msg_type().is_con() {
                    // Half the processing budget keeps the empty ACK ahead of
                    // the client's first retransmission draw.
                    let budget = inner.params().processing_delay / 2;

                    match futures::future::select(dispatch_future, Delay::new(budget)).await {
                        Either::Left((result, _)) => {
                            let mut response = inner.render_response(&request, result, from);
                            response = inner.apply_block2(&request, response, from, request.block2());
                            response.set_msg_type(MsgType::Ack);
                            response.set_msg_id(request.msg_id());
                            response.set_token(request.token());
                            if let Some(echo) = block1_echo {
                                response.set_block1(Some(echo));
                            }
                            inner.reply_and_cache(response, request.msg_id(), from);
                        }
                        Either::Right((_, dispatch_future)) => {
                            // Too slow for a piggy-backed reply: empty ACK
                            // now, the real response on its own transaction.
                            debug!("deferring response for MID:0x{:04X}", request.msg_id());
                            let ack = Message::empty_ack(request.msg_id());
                            if let Ok(bytes) = ack.encode() {
                                inner
                                    .dedup()
                                    .lock()
                                    .expect("dedup mutex poisoned")
                                    .cache_reply(from, request.msg_id(), bytes.clone());
                                inner.send_raw_detached(bytes, from);
                            }

                            let result = dispatch_future.await;
                            let mut response = inner.render_response(&request, result, from);
                            response = inner.apply_block2(&request, response, from, request.block2());
                            response.set_msg_type(MsgType::Con);
                            response.set_msg_id(inner.next_msg_id());
                            response.set_token(request.token());
                            if let Some(echo) = block1_echo {
                                response.set_block1(Some(echo));
                            }

                            debug!("SEPARATE: {} {}", from, response);
                            match TransactionFuture::new(&inner, from, &response) {
                                Ok(transaction) => {
                                    if let Err(e) = transaction.await {
                                        info!("separate response to {} failed: {:?}", from, e);
                                    }
                                }
                                Err(e) => warn!("separate response encode failed: {:?}", e),
                            }
                        }
                    }
                } else {
                    let result = dispatch_future.await;
                    let mut response = inner.render_response(&request, result, from);
                    response = inner.apply_block2(&request, response, from, request.block2());
                    response.set_msg_type(MsgType::Non);
                    response.set_msg_id(inner.next_msg_id());
                    response.set_token(request.token());
                    if let Some(echo) = block1_echo {
                        response.set_block1(Some(echo));
                    }
                    inner.reply_and_cache(response, request.msg_id(), from);
                }
            }
            .boxed(),
        );
    }

    /// Turns a dispatch result into a bare response message and performs
    /// observe registration. Framing (type, message id, token) is applied by
    /// the caller.
    pub(crate) fn render_response(
        &self,
        request: &Message,
        result: Result<Message, Error>,
        from: S::SocketAddr,
    ) -> Message {
        let mut response = match result {
            Ok(response) => response,
            Err(e) => {
                info!("handler error for {} from {}: {:?}", request.code(), from, e);
                Message::new(MsgType::Ack, e.response_code())
            }
        };

        if request.code() == MsgCode::MethodGet
            && request.observe() == Some(crate::consts::OBSERVE_REGISTER)
            && response.code().is_success()
        {
            let mut observations = self.observations().lock().expect("observations mutex poisoned");
            let observation = observations
                .entry((from, request.token()))
                .or_insert_with(|| Observation::new(request.clone()));
            response.set_observe(observation.seq);
        }

        response
    }

    /// Applies server-side block2 framing: a payload that does not fit one
    /// block (or an explicit block request) is cached whole and answered
    /// one block at a time.
    pub(crate) fn apply_block2(
        &self,
        request: &Message,
        mut response: Message,
        from: S::SocketAddr,
        requested: Option<BlockInfo>,
    ) -> Message {
        let mut szx = self.params().default_block_szx;
        if let Some(block) = requested {
            szx = szx.min(block.szx());
        }
        let size = 1usize << (szx as usize + 4);

        let total = response.payload().len();
        let requested_num = requested.map(|block| block.num()).unwrap_or(0);

        if total <= size && requested_num == 0 {
            return response;
        }

        let block = match BlockInfo::new(requested_num, false, szx) {
            Some(block) => block,
            None => {
                return Message::new(MsgType::Ack, MsgCode::ClientErrorBadRequest);
            }
        };

        let (chunk, more) = match block_slice(response.payload(), block) {
            Some(x) => x,
            None => {
                info!("block2 request past end of representation from {}", from);
                return Message::new(MsgType::Ack, MsgCode::ClientErrorBadRequest);
            }
        };
        let chunk = chunk.to_vec();

        // Remember the full representation for the follow-up requests.
        if more || requested_num > 0 {
            let expires = Instant::now() + self.params().exchange_lifetime;
            self.block2_cache()
                .lock()
                .expect("block2 cache mutex poisoned")
                .insert(
                    (from, request.uri_path()),
                    Block2Entry {
                        response: response.clone(),
                        expires,
                    },
                );
        }

        response.set_option_uint(OptionNumber::SIZE2, total as u32);
        response.set_block2(Some(if more {
            BlockInfo::new(requested_num, true, szx).expect("block checked above")
        } else {
            block
        }));
        if requested_num > 0 {
            // Only the first block of a notification carries Observe.
            response.clear_observe();
        }
        response.set_payload(chunk);
        response
    }

    /// Completes the framing of a reply to `request` (piggy-backed for CON,
    /// non-confirmable otherwise).
    fn finish_reply(&self, request: &Message, response: &mut Message, _from: S::SocketAddr) {
        if request.msg_type().is_con() {
            response.set_msg_type(MsgType::Ack);
            response.set_msg_id(request.msg_id());
        } else {
            response.set_msg_type(MsgType::Non);
            response.set_msg_id(self.next_msg_id());
        }
        response.set_token(request.token());
    }

    fn reply_with_error(&self, request: &Message, error: Error, from: S::SocketAddr) {
        self.reply_with_error_code(request, error.response_code(), from);
    }

    fn reply_with_error_code(
        &self,
        request: &Message,
        code: MsgCode,
        from: S::SocketAddr,
    ) {
        let mut response = Message::new(MsgType::Ack, code);
        self.finish_reply(request, &mut response, from);
        self.reply_and_cache(response, request.msg_id(), from);
    }

    /// Sends a reply and parks its bytes in the dedup cache so duplicates
    /// of the request replay it identically.
    fn reply_and_cache(&self, response: Message, request_mid: MsgId, from: S::SocketAddr) {
        debug!("OUTBOUND: {} {}", from, response);
        match response.encode() {
            Ok(bytes) => {
                self.dedup()
                    .lock()
                    .expect("dedup mutex poisoned")
                    .cache_reply(from, request_mid, bytes.clone());
                self.send_raw_detached(bytes, from);
            }
            Err(e) => warn!("reply encode failed: {:?}", e),
        }
    }

    /// Fire-and-forget send of a message that needs no reliability.
    pub(crate) fn send_detached(&self, message: Message, dest: S::SocketAddr) {
        match message.encode() {
            Ok(bytes) => self.send_raw_detached(bytes, dest),
            Err(e) => warn!("encode failed: {:?}", e),
        }
    }

    /// Fire-and-forget send of pre-encoded bytes.
    pub(crate) fn send_raw_detached(&self, bytes: Vec<u8>, dest: S::SocketAddr) {
        let inner = self.arc();
        self.spawn(
            async move {
                if let Err(e) = inner.socket().send_to(&bytes, dest).await {
                    warn!("send_to: io error: {:?} (dest={})", e, dest);
                }
            }
            .boxed(),
        );
    }
}
