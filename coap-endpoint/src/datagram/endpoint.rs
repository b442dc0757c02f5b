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
use crate::consts::{OBSERVE_DEREGISTER, OBSERVE_REGISTER};
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::future::BoxFuture;
use futures::prelude::*;
use futures::task::Waker;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

// Lock discipline: the matcher lock is taken first and a handler's state
// lock second (the receive loop path); a handler that needs the matcher
// defers that work until its own lock is released (see ExchangeFuture).
// The flights lock nests innermost; the remaining tables never nest.

/// A datagram-based CoAP endpoint: client and server rolled into one.
///
/// The endpoint owns the socket, the request/response matcher, the
/// message-id dedup cache, block transfer state, and the observe registries.
/// Inbound traffic is processed by [`receive_loop`][Endpoint::receive_loop],
/// which must be running for anything else to make progress.
pub struct Endpoint<S: AsyncDatagramSocket> {
    inner: Arc<EndpointInner<S>>,
}

pub(crate) struct EndpointInner<S: AsyncDatagramSocket> {
    /// Back-reference to the Arc this inner state lives in, so deferred
    /// tasks can own the endpoint.
    this: Weak<EndpointInner<S>>,

    socket: S,
    params: TransParams,
    dispatch: Arc<dyn ResourceDispatch<S::SocketAddr>>,

    next_msg_id: AtomicU16,
    token_salt: u64,
    token_counter: AtomicU64,

    matcher: Mutex<Matcher<S::SocketAddr>>,
    dedup: Mutex<DedupCache<S::SocketAddr>>,

    /// Server-side observe relationships, keyed `(peer, token)`.
    observations: Mutex<HashMap<(S::SocketAddr, MsgToken), Observation>>,

    /// Client-side observe sinks, keyed `(peer, token)`. This map holds the
    /// strong references; the matcher only holds weak ones.
    sinks: Mutex<HashMap<(S::SocketAddr, MsgToken), Arc<Mutex<ObserveSink<S>>>>>,

    /// Full response payloads being served block-wise, keyed by
    /// `(peer, Uri-Path)`.
    block2_cache: Mutex<HashMap<(S::SocketAddr, Vec<String>), Block2Entry>>,

    /// Request bodies being assembled from a block1 upload, keyed
    /// `(peer, token)`.
    block1_partial: Mutex<HashMap<(S::SocketAddr, MsgToken), BlockAssembler>>,

    /// Per-peer NSTART bookkeeping.
    flights: Mutex<HashMap<S::SocketAddr, PeerFlight>>,

    tasks_tx: UnboundedSender<BoxFuture<'static, ()>>,
    tasks_rx: Mutex<Option<UnboundedReceiver<BoxFuture<'static, ()>>>>,
}

#[derive(Debug)]
pub(crate) struct Block2Entry {
    pub(crate) response: Message,
    pub(crate) expires: Instant,
}

#[derive(Debug, Default)]
struct PeerFlight {
    active: u32,
    waiters: VecDeque<Waker>,
}

impl<S: AsyncDatagramSocket> Endpoint<S> {
    /// Creates a client-only endpoint: inbound requests are answered
    /// with 4.04.
    pub fn new(socket: S) -> Endpoint<S> {
        Endpoint::with_dispatch(socket, NullDispatch)
    }

    /// Creates an endpoint whose inbound requests are handed to `dispatch`.
    pub fn with_dispatch<D>(socket: S, dispatch: D) -> Endpoint<S>
    where
        D: ResourceDispatch<S::SocketAddr> + 'static,
    {
        Endpoint::with_dispatch_and_params(socket, dispatch, TransParams::default())
    }

    /// Creates an endpoint with explicit transmission parameters.
    pub fn with_dispatch_and_params<D>(socket: S, dispatch: D, params: TransParams) -> Endpoint<S>
    where
        D: ResourceDispatch<S::SocketAddr> + 'static,
    {
        let (tasks_tx, tasks_rx) = unbounded();

        Endpoint {
            inner: Arc::new_cyclic(|this| EndpointInner {
                this: this.clone(),
                socket,
                params,
                dispatch: Arc::new(dispatch),
                next_msg_id: AtomicU16::new(rand::random()),
                token_salt: rand::random(),
                token_counter: AtomicU64::new(0),
                matcher: Mutex::new(Matcher::new()),
                dedup: Mutex::new(DedupCache::new(params.exchange_lifetime)),
                observations: Mutex::new(HashMap::new()),
                sinks: Mutex::new(HashMap::new()),
                block2_cache: Mutex::new(HashMap::new()),
                block1_partial: Mutex::new(HashMap::new()),
                flights: Mutex::new(HashMap::new()),
                tasks_tx,
                tasks_rx: Mutex::new(Some(tasks_rx)),
            }),
        }
    }

    /// Borrows a reference to the underlying socket.
    pub fn socket(&self) -> &S {
        self.inner.socket()
    }

    /// The transmission parameters this endpoint runs with.
    pub fn params(&self) -> &TransParams {
        self.inner.params()
    }

    /// Sends a request and resolves with the first (block-wise reassembled)
    /// response.
    ///
    /// The endpoint assigns the message id and, unless the message already
    /// carries one, the token. Payloads exceeding the block size are
    /// uploaded with block1; block-wise responses are reassembled before
    /// delivery.
    pub fn request(&self, dest: S::SocketAddr, message: Message) -> ExchangeFuture<S> {
        ExchangeFuture::new(&self.inner, dest, message, None)
    }

    /// Registers as an observer of the resource addressed by `message`
    /// (which must be a GET).
    ///
    /// The returned future resolves with the first response, which is also
    /// handed to `callback`; every subsequent fresh notification invokes
    /// `callback` again. The relationship ends when the peer sends an error
    /// or observe-less response, or through
    /// [`stop_observing`][Endpoint::stop_observing] with the token of the
    /// first response.
    pub fn observe<F>(
        &self,
        dest: S::SocketAddr,
        mut message: Message,
        callback: F,
    ) -> ExchangeFuture<S>
    where
        F: FnMut(&Message) + Send + 'static,
    {
        message.set_observe(OBSERVE_REGISTER);
        if message.token().is_empty() {
            message.set_token(self.inner.next_token());
        }
        let token = message.token();

        let sink = Arc::new(Mutex::new(ObserveSink::new(
            &self.inner,
            dest,
            token,
            message.clone(),
            Box::new(callback),
        )));

        self.inner
            .sinks
            .lock()
            .expect("sinks mutex poisoned")
            .insert((dest, token), sink.clone());

        ExchangeFuture::new(&self.inner, dest, message, Some(sink))
    }

    /// Cancels an observe relationship: deregisters the local sink and asks
    /// the peer to drop us by repeating the GET with Observe=1.
    ///
    /// Resolves with the peer's (final, notification-less) response.
    pub fn stop_observing(&self, dest: S::SocketAddr, token: MsgToken) -> ExchangeFuture<S> {
        let sink = self
            .inner
            .sinks
            .lock()
            .expect("sinks mutex poisoned")
            .remove(&(dest, token));

        let mut message = match sink {
            Some(sink) => {
                let mut sink = sink.lock().expect("sink mutex poisoned");
                sink.deactivate();
                sink.request().clone()
            }
            None => {
                let mut message = Message::request(MsgCode::MethodGet);
                message.set_token(token);
                message
            }
        };

        message.set_observe(OBSERVE_DEREGISTER);
        message.set_token(token);
        ExchangeFuture::new(&self.inner, dest, message, None)
    }

    /// Sends a CoAP ping (an empty confirmable message); the peer's reset
    /// answers it.
    pub fn ping(&self, dest: S::SocketAddr) -> impl Future<Output = Result<(), Error>> {
        ExchangeFuture::new(
            &self.inner,
            dest,
            Message::new(MsgType::Con, MsgCode::Empty),
            None,
        )
        .map_ok(|_| ())
    }

    pub(crate) fn inner(&self) -> &Arc<EndpointInner<S>> {
        &self.inner
    }
}

impl<S: AsyncDatagramSocket> EndpointInner<S> {
    /// An owning handle to this endpoint. Infallible while any caller can
    /// reach `&self` through the endpoint's own `Arc`.
    pub(crate) fn arc(&self) -> Arc<EndpointInner<S>> {
        self.this.upgrade().expect("endpoint gone")
    }

    pub(crate) fn socket(&self) -> &S {
        &self.socket
    }

    pub(crate) fn params(&self) -> &TransParams {
        &self.params
    }

    pub(crate) fn dispatch(&self) -> &Arc<dyn ResourceDispatch<S::SocketAddr>> {
        &self.dispatch
    }

    pub(crate) fn matcher(&self) -> &Mutex<Matcher<S::SocketAddr>> {
        &self.matcher
    }

    pub(crate) fn dedup(&self) -> &Mutex<DedupCache<S::SocketAddr>> {
        &self.dedup
    }

    pub(crate) fn observations(
        &self,
    ) -> &Mutex<HashMap<(S::SocketAddr, MsgToken), Observation>> {
        &self.observations
    }

    pub(crate) fn block2_cache(
        &self,
    ) -> &Mutex<HashMap<(S::SocketAddr, Vec<String>), Block2Entry>> {
        &self.block2_cache
    }

    pub(crate) fn block1_partial(
        &self,
    ) -> &Mutex<HashMap<(S::SocketAddr, MsgToken), BlockAssembler>> {
        &self.block1_partial
    }

    pub(crate) fn next_msg_id(&self) -> MsgId {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocates a fresh eight-byte token: a pseudo-random salt mixed with a
    /// monotonic counter, so no two in-flight requests collide.
    pub(crate) fn next_token(&self) -> MsgToken {
        let counter = self.token_counter.fetch_add(1, Ordering::Relaxed);
        let mixed = self.token_salt ^ counter.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        MsgToken::from(mixed)
    }

    /// Claims an NSTART slot toward `peer`, or queues the waker for when one
    /// frees up.
    pub(crate) fn try_acquire_flight(&self, peer: S::SocketAddr, waker: &Waker) -> bool {
        let mut flights = self.flights.lock().expect("flights mutex poisoned");
        let flight = flights.entry(peer).or_default();
        if flight.active < self.params.nstart {
            flight.active += 1;
            true
        } else {
            flight.waiters.push_back(waker.clone());
            false
        }
    }

    /// Releases an NSTART slot toward `peer` and wakes the next waiter.
    pub(crate) fn release_flight(&self, peer: S::SocketAddr) {
        let mut flights = self.flights.lock().expect("flights mutex poisoned");
        if let Some(flight) = flights.get_mut(&peer) {
            flight.active = flight.active.saturating_sub(1);
            if let Some(waker) = flight.waiters.pop_front() {
                waker.wake();
            }
            if flight.active == 0 && flight.waiters.is_empty() {
                flights.remove(&peer);
            }
        }
    }

    /// Drops a client-side observe sink.
    pub(crate) fn remove_sink(&self, peer: S::SocketAddr, token: MsgToken) {
        self.sinks
            .lock()
            .expect("sinks mutex poisoned")
            .remove(&(peer, token));
    }

    /// Queues a task onto the receive loop's task set.
    pub(crate) fn spawn(&self, task: BoxFuture<'static, ()>) {
        // Failure means the receive loop (and its queue) is gone; the task
        // is moot then.
        let _ = self.tasks_tx.unbounded_send(task);
    }

    pub(crate) fn take_task_queue(&self) -> Option<UnboundedReceiver<BoxFuture<'static, ()>>> {
        self.tasks_rx.lock().expect("tasks mutex poisoned").take()
    }

    /// Sends a confirmable message on a detached transaction: retransmitted
    /// until acknowledged, with failures logged rather than surfaced.
    pub(crate) fn send_reliable_detached(&self, dest: S::SocketAddr, message: Message) {
        let endpoint = self.arc();
        self.spawn(
            async move {
                match TransactionFuture::new(&endpoint, dest, &message) {
                    Ok(transaction) => {
                        if let Err(e) = transaction.await {
                            info!("detached transaction to {} failed: {:?}", dest, e);
                        }
                    }
                    Err(e) => warn!("detached transaction encode failed: {:?}", e),
                }
            }
            .boxed(),
        );
    }
}

impl<S: AsyncDatagramSocket> std::fmt::Debug for Endpoint<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("params", &self.inner.params)
            .finish()
    }
}

impl<S: AsyncDatagramSocket> std::fmt::Debug for EndpointInner<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointInner")
            .field("params", &self.params)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_format::ContentFormat;
    use futures::executor::block_on;
    use futures::future::Either;
    use futures_timer::Delay;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const CLIENT_ADDR: LoopbackSocketAddr = LoopbackSocketAddr(0);
    const SERVER_ADDR: LoopbackSocketAddr = LoopbackSocketAddr(1);

    /// Runs `future` against the given receive loops, panicking if a loop
    /// terminates first.
    fn run_with_loops<R>(
        loops: Vec<BoxFuture<'_, Result<(), Error>>>,
        future: BoxFuture<'_, R>,
    ) -> R {
        let combined = futures::future::join_all(loops);
        match block_on(futures::future::select(future, combined)) {
            Either::Left((ret, _)) => ret,
            Either::Right(_) => panic!("Receive loop terminated unexpectedly"),
        }
    }

    /// A dispatcher serving a fixed payload for GET and echoing the request
    /// body length for POST, counting its invocations.
    fn text_dispatch(
        payload: Vec<u8>,
        hits: Arc<AtomicUsize>,
    ) -> impl Fn(Message, LoopbackSocketAddr) -> BoxFuture<'static, Result<Message, Error>>
           + Send
           + Sync
           + 'static {
        move |request: Message, _remote: LoopbackSocketAddr| {
            hits.fetch_add(1, Ordering::SeqCst);
            let payload = payload.clone();
            async move {
                match request.code() {
                    MsgCode::MethodGet => {
                        let mut response = Message::new(MsgType::Ack, MsgCode::SuccessContent);
                        response.set_content_format(ContentFormat::TEXT_PLAIN_UTF8);
                        response.set_payload(payload);
                        Ok(response)
                    }
                    MsgCode::MethodPost => {
                        let mut response = Message::new(MsgType::Ack, MsgCode::SuccessChanged);
                        response.set_payload(format!("{}", request.payload().len()));
                        Ok(response)
                    }
                    _ => Err(Error::MethodNotAllowed),
                }
            }
            .boxed()
        }
    }

    #[test]
    fn ping_loopback() {
        let endpoint = Endpoint::new(LoopbackSocket::new());

        let result = run_with_loops(
            vec![endpoint.receive_loop().boxed()],
            endpoint.ping(LoopbackSocketAddr(0)).boxed(),
        );
        assert_eq!(result, Ok(()));
    }

    /// Retransmissions against a silent peer end in `Timeout`. Takes the
    /// better part of a minute, so it doesn't run by default.
    #[test]
    #[ignore]
    fn request_null_times_out() {
        let endpoint = Endpoint::new(NullSocket::new());

        let mut request = Message::request(MsgCode::MethodGet);
        request.set_uri_path(&["void"]);

        let result = run_with_loops(
            vec![endpoint.receive_loop().boxed()],
            endpoint.request(NullSocketAddr, request).boxed(),
        );
        assert_eq!(result, Err(Error::Timeout));
    }

    #[test]
    fn get_small_payload_is_a_single_response() {
        let (client_socket, server_socket) = LoopbackSocket::pair();
        let hits = Arc::new(AtomicUsize::new(0));

        let client = Endpoint::new(client_socket);
        let server = Endpoint::with_dispatch(
            server_socket,
            text_dispatch(vec![b'x'; 100], hits.clone()),
        );

        let mut request = Message::request(MsgCode::MethodGet);
        request.set_uri_path(&["text"]);

        let response = run_with_loops(
            vec![client.receive_loop().boxed(), server.receive_loop().boxed()],
            client.request(SERVER_ADDR, request).boxed(),
        )
        .expect("request failed");

        assert_eq!(response.code(), MsgCode::SuccessContent);
        assert_eq!(response.payload().len(), 100);
        assert_eq!(response.block2(), None);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn get_large_payload_reassembles_block2() {
        let (client_socket, server_socket) = LoopbackSocket::pair();
        let hits = Arc::new(AtomicUsize::new(0));

        let payload: Vec<u8> = (0..2500u32).map(|x| x as u8).collect();
        let client = Endpoint::new(client_socket);
        let server =
            Endpoint::with_dispatch(server_socket, text_dispatch(payload.clone(), hits.clone()));

        let mut request = Message::request(MsgCode::MethodGet);
        request.set_uri_path(&["large"]);

        let response = run_with_loops(
            vec![client.receive_loop().boxed(), server.receive_loop().boxed()],
            client.request(SERVER_ADDR, request).boxed(),
        )
        .expect("request failed");

        assert_eq!(response.code(), MsgCode::SuccessContent);
        assert_eq!(response.payload(), &payload[..]);
        assert_eq!(response.block2(), None);
    }

    #[test]
    fn block2_early_negotiation_shrinks_block_size() {
        let (client_socket, server_socket) = LoopbackSocket::pair();
        let hits = Arc::new(AtomicUsize::new(0));

        let payload: Vec<u8> = (0..1000u32).map(|x| x as u8).collect();
        let client = Endpoint::new(client_socket);
        let server =
            Endpoint::with_dispatch(server_socket, text_dispatch(payload.clone(), hits.clone()));

        let mut request = Message::request(MsgCode::MethodGet);
        request.set_uri_path(&["large"]);
        request.set_block2(BlockInfo::new(0, false, 2));

        let response = run_with_loops(
            vec![client.receive_loop().boxed(), server.receive_loop().boxed()],
            client.request(SERVER_ADDR, request).boxed(),
        )
        .expect("request failed");

        assert_eq!(response.payload(), &payload[..]);
    }

    #[test]
    fn post_large_body_uploads_with_block1() {
        let (client_socket, server_socket) = LoopbackSocket::pair();
        let hits = Arc::new(AtomicUsize::new(0));

        let client = Endpoint::new(client_socket);
        let server =
            Endpoint::with_dispatch(server_socket, text_dispatch(Vec::new(), hits.clone()));

        let mut request = Message::request(MsgCode::MethodPost);
        request.set_uri_path(&["sink"]);
        request.set_payload(vec![b'y'; 2500]);

        let response = run_with_loops(
            vec![client.receive_loop().boxed(), server.receive_loop().boxed()],
            client.request(SERVER_ADDR, request).boxed(),
        )
        .expect("request failed");

        assert_eq!(response.code(), MsgCode::SuccessChanged);
        // The dispatcher saw the whole body, exactly once.
        assert_eq!(response.payload_as_str(), Some("2500"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_request_replays_identical_reply() {
        let (raw_socket, server_socket) = LoopbackSocket::pair();
        let hits = Arc::new(AtomicUsize::new(0));

        let server =
            Endpoint::with_dispatch(server_socket, text_dispatch(b"hello".to_vec(), hits.clone()));

        let mut request = Message::request(MsgCode::MethodGet);
        request.set_msg_id(0x1234);
        request.set_token(MsgToken::from(&b"tk"[..]));
        request.set_uri_path(&["text"]);
        let bytes = request.encode().unwrap();

        let hits_after = hits.clone();
        let driver = async move {
            let mut buffer = [0u8; 2048];

            raw_socket.send_to(&bytes, SERVER_ADDR).await.unwrap();
            let (len, _) = raw_socket.recv_from(&mut buffer).await.unwrap();
            let first = buffer[..len].to_vec();

            raw_socket.send_to(&bytes, SERVER_ADDR).await.unwrap();
            let (len, _) = raw_socket.recv_from(&mut buffer).await.unwrap();
            let second = buffer[..len].to_vec();

            (first, second)
        };

        let (first, second) =
            run_with_loops(vec![server.receive_loop().boxed()], driver.boxed());

        assert_eq!(first, second);
        let reply = Message::decode(&first).unwrap();
        assert_eq!(reply.msg_type(), MsgType::Ack);
        assert_eq!(reply.code(), MsgCode::SuccessContent);
        assert_eq!(reply.msg_id(), 0x1234);
        assert_eq!(hits_after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn slow_handler_gets_a_separate_response() {
        let (client_socket, server_socket) = LoopbackSocket::pair();

        let dispatch = |_request: Message, _remote: LoopbackSocketAddr| {
            async move {
                Delay::new(Duration::from_millis(120)).await;
                let mut response = Message::new(MsgType::Ack, MsgCode::SuccessContent);
                response.set_payload(&b"eventually"[..]);
                Ok::<_, Error>(response)
            }
            .boxed()
        };

        let mut params = TransParams::default();
        params.processing_delay = Duration::from_millis(50);

        let client = Endpoint::new(client_socket);
        let server = Endpoint::with_dispatch_and_params(server_socket, dispatch, params);

        let mut request = Message::request(MsgCode::MethodGet);
        request.set_uri_path(&["slow"]);

        let response = run_with_loops(
            vec![client.receive_loop().boxed(), server.receive_loop().boxed()],
            client.request(SERVER_ADDR, request).boxed(),
        )
        .expect("request failed");

        assert_eq!(response.code(), MsgCode::SuccessContent);
        assert_eq!(response.payload_as_str(), Some("eventually"));
    }

    #[test]
    fn unknown_critical_option_gets_bad_option() {
        let (client_socket, server_socket) = LoopbackSocket::pair();
        let hits = Arc::new(AtomicUsize::new(0));

        let client = Endpoint::new(client_socket);
        let server =
            Endpoint::with_dispatch(server_socket, text_dispatch(Vec::new(), hits.clone()));

        let mut request = Message::request(MsgCode::MethodGet);
        request.set_uri_path(&["text"]);
        request.insert_option(crate::option::OptionNumber(65), Vec::new());

        let response = run_with_loops(
            vec![client.receive_loop().boxed(), server.receive_loop().boxed()],
            client.request(SERVER_ADDR, request).boxed(),
        )
        .expect("request failed");

        assert_eq!(response.code(), MsgCode::ClientErrorBadOption);
        // The dispatcher never ran.
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn client_only_endpoint_answers_not_found() {
        let (client_socket, server_socket) = LoopbackSocket::pair();

        let client = Endpoint::new(client_socket);
        let server = Endpoint::new(server_socket);

        let mut request = Message::request(MsgCode::MethodGet);
        request.set_uri_path(&["nothing", "here"]);

        let response = run_with_loops(
            vec![client.receive_loop().boxed(), server.receive_loop().boxed()],
            client.request(SERVER_ADDR, request).boxed(),
        )
        .expect("request failed");

        assert_eq!(response.code(), MsgCode::ClientErrorNotFound);
    }

    #[test]
    fn observe_delivers_notifications_in_order() {
        let (client_socket, server_socket) = LoopbackSocket::pair();

        let counter = Arc::new(AtomicUsize::new(0));
        let dispatch_counter = counter.clone();
        let dispatch = move |request: Message, _remote: LoopbackSocketAddr| {
            let value = dispatch_counter.load(Ordering::SeqCst);
            async move {
                if request.code() != MsgCode::MethodGet {
                    return Err(Error::MethodNotAllowed);
                }
                let mut response = Message::new(MsgType::Ack, MsgCode::SuccessContent);
                response.set_payload(format!("value-{}", value));
                Ok(response)
            }
            .boxed()
        };

        let client = Endpoint::new(client_socket);
        let server = Endpoint::with_dispatch(server_socket, dispatch);

        let seen: Arc<Mutex<Vec<(Option<u32>, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();

        let mut request = Message::request(MsgCode::MethodGet);
        request.set_uri_path(&["obs"]);

        let scenario = async {
            let first = client
                .observe(SERVER_ADDR, request, move |notification: &Message| {
                    seen_cb.lock().unwrap().push((
                        notification.observe(),
                        notification.payload_as_str().unwrap_or("").to_string(),
                    ));
                })
                .await
                .expect("observe failed");

            assert_eq!(first.code(), MsgCode::SuccessContent);
            assert_eq!(first.payload_as_str(), Some("value-0"));
            assert_eq!(first.observe(), Some(0));
            let token = first.token();

            // The first response reached the callback exactly once.
            assert_eq!(seen.lock().unwrap().len(), 1);

            // A change to the resource pushes a notification; notify()
            // resolves once the peer has acknowledged it.
            counter.store(1, Ordering::SeqCst);
            server.notify(&["obs"]).await;

            {
                let seen = seen.lock().unwrap();
                assert_eq!(seen.len(), 2);
                assert_eq!(seen[1], (Some(1), "value-1".to_string()));
            }

            // Unrelated paths notify nobody.
            server.notify(&["other"]).await;
            assert_eq!(seen.lock().unwrap().len(), 2);

            // Deregistration: the final response carries no Observe option
            // and later notifies are no-ops.
            let last = client
                .stop_observing(SERVER_ADDR, token)
                .await
                .expect("deregister failed");
            assert_eq!(last.observe(), None);

            counter.store(2, Ordering::SeqCst);
            server.notify(&["obs"]).await;
            assert_eq!(seen.lock().unwrap().len(), 2);
        };

        run_with_loops(
            vec![client.receive_loop().boxed(), server.receive_loop().boxed()],
            scenario.boxed(),
        );
    }

    #[test]
    fn observe_notification_spanning_blocks_is_reassembled() {
        let (client_socket, server_socket) = LoopbackSocket::pair();

        let generation = Arc::new(AtomicUsize::new(0));
        let dispatch_generation = generation.clone();
        let dispatch = move |_request: Message, _remote: LoopbackSocketAddr| {
            let generation = dispatch_generation.load(Ordering::SeqCst);
            async move {
                // Generation 1 no longer fits a single block.
                let payload = if generation == 0 {
                    vec![b'a'; 16]
                } else {
                    vec![b'b'; 2500]
                };
                let mut response = Message::new(MsgType::Ack, MsgCode::SuccessContent);
                response.set_payload(payload);
                Ok::<_, Error>(response)
            }
            .boxed()
        };

        let client = Endpoint::new(client_socket);
        let server = Endpoint::with_dispatch(server_socket, dispatch);

        let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();

        let mut request = Message::request(MsgCode::MethodGet);
        request.set_uri_path(&["obs-large"]);

        let scenario = async {
            let first = client
                .observe(SERVER_ADDR, request, move |notification: &Message| {
                    seen_cb.lock().unwrap().push(notification.payload().to_vec());
                })
                .await
                .expect("observe failed");
            assert_eq!(first.payload().len(), 16);

            generation.store(1, Ordering::SeqCst);
            server.notify(&["obs-large"]).await;

            // The notification body arrives over several block fetches after
            // notify() resolves; poll briefly for the reassembled result.
            for _ in 0..100 {
                if seen.lock().unwrap().len() >= 2 {
                    break;
                }
                Delay::new(Duration::from_millis(20)).await;
            }

            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 2);
            assert_eq!(seen[1], vec![b'b'; 2500]);
        };

        run_with_loops(
            vec![client.receive_loop().boxed(), server.receive_loop().boxed()],
            scenario.boxed(),
        );
    }

    #[test]
    fn non_confirmable_round_trip() {
        let (client_socket, server_socket) = LoopbackSocket::pair();
        let hits = Arc::new(AtomicUsize::new(0));

        let client = Endpoint::new(client_socket);
        let server =
            Endpoint::with_dispatch(server_socket, text_dispatch(b"non".to_vec(), hits.clone()));

        let mut request = Message::new(MsgType::Non, MsgCode::MethodGet);
        request.set_uri_path(&["text"]);

        let response = run_with_loops(
            vec![client.receive_loop().boxed(), server.receive_loop().boxed()],
            client.request(SERVER_ADDR, request).boxed(),
        )
        .expect("request failed");

        assert_eq!(response.msg_type(), MsgType::Non);
        assert_eq!(response.payload_as_str(), Some("non"));
    }

    #[test]
    fn stray_response_is_reset() {
        let (raw_socket, client_socket) = LoopbackSocket::pair();
        let client = Endpoint::new(client_socket);

        // A CON response bearing a token nobody is waiting for.
        let mut stray = Message::new(MsgType::Con, MsgCode::SuccessContent);
        stray.set_msg_id(0x77AA);
        stray.set_token(MsgToken::from(&b"ghost"[..]));
        stray.set_payload(&b"?"[..]);
        let bytes = stray.encode().unwrap();

        let driver = async move {
            let mut buffer = [0u8; 2048];
            raw_socket.send_to(&bytes, CLIENT_ADDR).await.unwrap();
            let (len, _) = raw_socket.recv_from(&mut buffer).await.unwrap();
            Message::decode(&buffer[..len]).unwrap()
        };

        let reply = run_with_loops(vec![client.receive_loop().boxed()], driver.boxed());
        assert_eq!(reply.msg_type(), MsgType::Rst);
        assert_eq!(reply.msg_id(), 0x77AA);
    }
}
