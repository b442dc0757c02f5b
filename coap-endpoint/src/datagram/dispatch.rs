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
use futures::future::BoxFuture;
use futures::prelude::*;

/// The contract between the protocol engine and the application's resource
/// tree.
///
/// The engine hands over a fully decoded request (Uri-Path already split
/// into option instances, block-wise request bodies already reassembled) and
/// expects back a response message carrying the code, options, and payload;
/// the engine takes care of all message-layer framing, including whether the
/// response travels piggy-backed or separately.
///
/// Returning an error is equivalent to returning a response whose code is
/// [`Error::response_code`]; uncategorized errors surface as 5.00.
///
/// `dispatch` is invoked for every request and must not block: slow work
/// belongs inside the returned future, which the engine races against the
/// empty-acknowledgement budget.
pub trait ResourceDispatch<SA>: Send + Sync {
    /// Produces the response for one decoded request.
    fn dispatch(&self, request: Message, remote: SA) -> BoxFuture<'static, Result<Message, Error>>;
}

/// Closures of the matching shape are dispatchers, which is the convenient
/// form for tests and small servers.
impl<SA, F> ResourceDispatch<SA> for F
where
    F: Fn(Message, SA) -> BoxFuture<'static, Result<Message, Error>> + Send + Sync,
{
    fn dispatch(&self, request: Message, remote: SA) -> BoxFuture<'static, Result<Message, Error>> {
        self(request, remote)
    }
}

/// A dispatcher with no resources: every request is answered with 4.04.
///
/// This is what a client-only [`Endpoint`][super::Endpoint] uses.
#[derive(Debug, Default, Copy, Clone)]
pub struct NullDispatch;

impl<SA> ResourceDispatch<SA> for NullDispatch {
    fn dispatch(&self, _request: Message, _remote: SA) -> BoxFuture<'static, Result<Message, Error>> {
        future::ready(Err(Error::NotFound)).boxed()
    }
}
