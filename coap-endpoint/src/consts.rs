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

//! Module defining various CoAP-related constants.

use std::time::Duration;

/// The standard default IP port number used for CoAP-over-UDP.
pub const DEFAULT_PORT_COAP_UDP: u16 = 5683;

/// The standard default IP port number used for CoAP-over-DTLS.
/// Listed for completeness; DTLS transport is not implemented.
pub const DEFAULT_PORT_COAP_DTLS: u16 = 5684;

/// The standard URI scheme for vanilla CoAP-over-UDP on IP networks.
pub const URI_SCHEME_COAP: &str = "coap";

/// The standard URI scheme for CoAP-over-DTLS on IP networks.
pub const URI_SCHEME_COAPS: &str = "coaps";

/// Value for `OptionNumber::OBSERVE` when registering an observer.
///
/// Note that this is only for requests; in replies the option carries the
/// notification sequence number.
///
/// Defined by [IETF-RFC7641](https://tools.ietf.org/html/rfc7641).
pub const OBSERVE_REGISTER: u32 = 0;

/// Value for `OptionNumber::OBSERVE` when deregistering an observer.
///
/// Defined by [IETF-RFC7641](https://tools.ietf.org/html/rfc7641).
pub const OBSERVE_DEREGISTER: u32 = 1;

/// Modulus of the observe notification sequence number (24-bit space).
pub const OBSERVE_SEQ_MODULO: u32 = 1 << 24;

/// Half the observe sequence space; the comparison window for ordering
/// two notification sequence numbers.
pub const OBSERVE_SEQ_WINDOW: u32 = 1 << 23;

/// After this much time, any notification sequence number is considered
/// fresher than the one currently held, regardless of ordering.
///
/// Defined by [IETF-RFC7641 Section 3.4](https://tools.ietf.org/html/rfc7641#section-3.4).
pub const OBSERVE_FRESHNESS_PERIOD: Duration = Duration::from_secs(128);
