// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Payload marshalling for generated stubs.
//!
//! Messages are encoded with [bincode](https://docs.rs/bincode). Failures are reported as
//! [`Status`] so that stubs can use `?` inside handlers: an undecodable request surfaces as
//! [`Code::InvalidArgument`](crate::Code::InvalidArgument).

use crate::status::Status;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode a message.
pub fn marshal<T: Serialize>(message: &T) -> Result<Bytes, Status> {
    bincode::serialize(message).map(Bytes::from).map_err(|e| Status::internal(format!("marshal message: {e}")))
}

/// Decode a message.
pub fn unmarshal<T: DeserializeOwned>(payload: &[u8]) -> Result<T, Status> {
    bincode::deserialize(payload).map_err(|e| Status::invalid_argument(format!("unmarshal message: {e}")))
}
