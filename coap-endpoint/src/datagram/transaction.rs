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
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// A message-layer transaction: one outbound message plus, for confirmable
/// messages, the retransmission loop that runs until the peer acknowledges,
/// resets, or the retransmission budget runs out.
///
/// This is what carries server-originated confirmable traffic: separate
/// responses and observe notifications. (Client requests ride in
/// [`ExchangeFuture`][super::ExchangeFuture], which additionally tracks the
/// response.)
pub(crate) struct TransactionFuture<S: AsyncDatagramSocket> {
    inner: Arc<Mutex<TransactionState<S>>>,
}

#[derive(Debug, Eq, PartialEq)]
enum TransactionStage {
    Uninit,
    Waiting,
    Finished(Result<(), Error>),
    Expired,
}

struct TransactionState<S: AsyncDatagramSocket> {
    endpoint: Weak<EndpointInner<S>>,
    dest: S::SocketAddr,
    encoded: Vec<u8>,
    msg_id: MsgId,
    confirmable: bool,
    stage: TransactionStage,
    waker: Option<Waker>,
    delay: Option<Delay>,
    timeout: Duration,
    attempts: u32,
}

impl<S: AsyncDatagramSocket> TransactionState<S> {
    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

impl<S: AsyncDatagramSocket> ResponseHandler<S::SocketAddr> for TransactionState<S> {
    fn handle_ack(&mut self, message: &Message) -> Disposition<S::SocketAddr> {
        if self.stage == TransactionStage::Waiting {
            let result = if message.msg_type().is_rst() {
                Err(Error::Reset)
            } else {
                Ok(())
            };
            self.stage = TransactionStage::Finished(result);
            self.delay = None;
            self.wake();
        }
        Disposition::Finish
    }
}

impl<S: AsyncDatagramSocket> TransactionFuture<S> {
    /// Creates a transaction for an already-encoded message. The message id
    /// in `message` must be the one the bytes carry.
    pub(crate) fn new(
        endpoint: &Arc<EndpointInner<S>>,
        dest: S::SocketAddr,
        message: &Message,
    ) -> Result<TransactionFuture<S>, Error> {
        let encoded = message.encode()?;
        let timeout = endpoint.params().initial_retransmit_timeout();

        Ok(TransactionFuture {
            inner: Arc::new(Mutex::new(TransactionState {
                endpoint: Arc::downgrade(endpoint),
                dest,
                encoded,
                msg_id: message.msg_id(),
                confirmable: message.msg_type().is_con(),
                stage: TransactionStage::Uninit,
                waker: None,
                delay: None,
                timeout,
                attempts: 0,
            })),
        })
    }

    fn poll_inner(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        let mut register_after = false;

        {
            let mut state = self.inner.lock().expect("transaction mutex poisoned");

            let endpoint = match state.endpoint.upgrade() {
                Some(endpoint) => endpoint,
                None => return Poll::Ready(Err(Error::Cancelled)),
            };

            match state.stage {
                TransactionStage::Uninit => {
                    match Pin::new(endpoint.socket()).poll_send_to(cx, &state.encoded, state.dest) {
                        Poll::Pending => {}
                        Poll::Ready(Err(e)) => {
                            warn!("transaction send_to failed: {:?} (dest={})", e, state.dest);
                            state.stage = TransactionStage::Finished(Err(Error::Io));
                        }
                        Poll::Ready(Ok(_)) => {
                            if state.confirmable {
                                let timeout = state.timeout;
                                state.delay = Some(Delay::new(timeout));
                                state.stage = TransactionStage::Waiting;
                                register_after = true;
                            } else {
                                state.stage = TransactionStage::Finished(Ok(()));
                            }
                        }
                    }
                }

                TransactionStage::Waiting => {
                    let expired = match state.delay.as_mut() {
                        Some(delay) => Pin::new(delay).poll(cx).is_ready(),
                        None => false,
                    };

                    if expired {
                        let max_retransmit = endpoint.params().max_retransmit;
                        if state.attempts < max_retransmit {
                            // Resend the identical bytes and double the timeout.
                            match Pin::new(endpoint.socket())
                                .poll_send_to(cx, &state.encoded, state.dest)
                            {
                                Poll::Pending => {}
                                Poll::Ready(Err(e)) => {
                                    warn!(
                                        "transaction send_to failed: {:?} (dest={})",
                                        e, state.dest
                                    );
                                    state.stage = TransactionStage::Finished(Err(Error::Io));
                                }
                                Poll::Ready(Ok(_)) => {
                                    state.attempts += 1;
                                    state.timeout *= 2;
                                    let timeout = state.timeout;
                                    debug!(
                                        "retransmit {} of MID:0x{:04X}, next timeout {:?}",
                                        state.attempts, state.msg_id, timeout
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
                            state.stage = TransactionStage::Finished(Err(Error::Timeout));
                        }
                    }
                }

                TransactionStage::Finished(_) | TransactionStage::Expired => {}
            }

            if let TransactionStage::Finished(result) = &state.stage {
                let result = *result;
                state.stage = TransactionStage::Expired;
                state.delay = None;
                return Poll::Ready(result);
            }

            state.waker = Some(cx.waker().clone());
        }

        // Registration happens outside the state lock; see the module-level
        // lock-order note in endpoint.rs.
        if register_after {
            let (endpoint, dest, msg_id) = {
                let state = self.inner.lock().expect("transaction mutex poisoned");
                (state.endpoint.upgrade(), state.dest, state.msg_id)
            };
            if let Some(endpoint) = endpoint {
                let handler: Arc<Mutex<dyn ResponseHandler<S::SocketAddr>>> = self.inner.clone();
                endpoint
                    .matcher()
                    .lock()
                    .expect("matcher mutex poisoned")
                    .register(dest, msg_id, MsgToken::EMPTY, &handler);
            }
        }

        Poll::Pending
    }
}

impl<S: AsyncDatagramSocket> Future for TransactionFuture<S> {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().poll_inner(cx)
    }
}

impl<S: AsyncDatagramSocket> Drop for TransactionFuture<S> {
    fn drop(&mut self) {
        let (endpoint, dest, msg_id) = {
            let state = self.inner.lock().expect("transaction mutex poisoned");
            (state.endpoint.upgrade(), state.dest, state.msg_id)
        };
        if let Some(endpoint) = endpoint {
            endpoint
                .matcher()
                .lock()
                .expect("matcher mutex poisoned")
                .deregister(dest, msg_id, MsgToken::EMPTY);
        }
    }
}

impl<S: AsyncDatagramSocket> std::fmt::Debug for TransactionFuture<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionFuture").finish()
    }
}
