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

//! Types and codecs for CoAP options.

mod num;
pub use num::OptionNumber;

mod value;
pub use value::{encode_uint, try_decode_u16, try_decode_u32, OptionValueType};

/// The largest option value length this implementation will encode or accept.
///
/// This is a sanity bound well above anything that fits in a single datagram.
pub const MAX_OPTION_VALUE_SIZE: usize = 1034;
