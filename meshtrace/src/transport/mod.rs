// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! The meshrpc wire: length-delimited, bincode encoded request and response frames.

pub mod codec;

use crate::metadata::Metadata;
use crate::status::Status;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serde::formats::Bincode;
use tokio_util::codec::LengthDelimitedCodec;

/// Default maximum frame length, 4 MiB.
pub const DEFAULT_MAX_FRAME_LEN: usize = 4 << 20;

/// A unary request as sent over the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Fully qualified service name, e.g. `api.HelloService`.
    pub service: String,
    /// Method name, e.g. `SayHello`.
    pub method: String,
    /// Remaining time budget in nanoseconds; zero means no deadline.
    pub timeout_nano: u64,
    /// Call metadata.
    pub metadata: Metadata,
    /// The marshalled request message.
    pub payload: Bytes,
}

/// A request tagged with the stream it belongs to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Identifies the call on its connection.
    pub stream_id: u32,
    /// The request.
    pub request: Request,
}

/// A response tagged with the stream it answers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseFrame {
    /// The stream id of the answered request.
    pub stream_id: u32,
    /// The marshalled response message, or the call's failure.
    pub response: Result<Bytes, Status>,
}

/// A framed transport reading `Item`s and writing `SinkItem`s.
pub(crate) type Transport<T, Item, SinkItem> = tokio_serde::Framed<tokio_util::codec::Framed<T, LengthDelimitedCodec>, Item, SinkItem, Bincode<Item, SinkItem>>;

/// Frame `io` with a length-delimited bincode codec.
pub(crate) fn new_transport<T, Item, SinkItem>(io: T, max_frame_len: usize) -> Transport<T, Item, SinkItem>
where
    T: AsyncRead + AsyncWrite,
{
    let framed = LengthDelimitedCodec::builder().max_frame_length(max_frame_len).new_framed(io);
    tokio_serde::Framed::new(framed, Bincode::default())
}
