// src/network/codec.rs
// Length-prefixed framing of {header, data} messages.
//
// Wire layout of one message:
//   frame 1     JSON header  {"sessionId": .., "messageType": ..}
//   frame 2..N  JSON payload, split into CHUNK_SIZE pieces
// Every frame carries a 4-byte big-endian length prefix. The writer closes
// its half of the stream after the last chunk; the reader concatenates chunks
// until end-of-stream and parses the payload once.
//
// The fixed 4-byte prefix does not interoperate with unsigned-varint
// length-prefixed framing as used by libp2p stream protocols.

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use super::message::{Message, MessageHeader};

/// Payload chunk size (1 MiB)
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Default cap on a reassembled payload
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 256 * 1024 * 1024;

pub type MessageReader<R> = FramedRead<R, LengthDelimitedCodec>;
pub type MessageWriter<W> = FramedWrite<W, LengthDelimitedCodec>;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("stream ended before the header frame")]
    MissingHeader,
    #[error("message carried no payload chunks")]
    EmptyPayload,
    #[error("payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("frame i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

fn length_delimited() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(CHUNK_SIZE)
        .new_codec()
}

pub fn reader<R: AsyncRead>(inner: R) -> MessageReader<R> {
    FramedRead::new(inner, length_delimited())
}

pub fn writer<W: AsyncWrite>(inner: W) -> MessageWriter<W> {
    FramedWrite::new(inner, length_delimited())
}

/// Header frame followed by the payload chunks, without length prefixes.
pub fn encode_frames(message: &Message) -> Result<Vec<Bytes>, CodecError> {
    let header = serde_json::to_vec(&message.header)?;
    let data = Bytes::from(serde_json::to_vec(&message.data)?);

    let mut frames = Vec::with_capacity(2 + data.len() / CHUNK_SIZE);
    frames.push(Bytes::from(header));

    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + CHUNK_SIZE).min(data.len());
        frames.push(data.slice(offset..end));
        offset = end;
    }
    Ok(frames)
}

/// Write one message and close the write half of the stream.
pub async fn write_message<W>(writer: &mut MessageWriter<W>, message: &Message) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    for frame in encode_frames(message)? {
        writer.feed(frame).await?;
    }
    SinkExt::<Bytes>::close(writer).await?;
    Ok(())
}

/// Read the header frame only. Payload chunks stay on the stream.
pub async fn read_header<R>(reader: &mut MessageReader<R>) -> Result<MessageHeader, CodecError>
where
    R: AsyncRead + Unpin,
{
    let frame = reader.next().await.ok_or(CodecError::MissingHeader)??;
    Ok(serde_json::from_slice(&frame)?)
}

/// Drain payload chunks until end-of-stream and parse them as one value.
pub async fn read_payload<R>(reader: &mut MessageReader<R>, max_bytes: usize) -> Result<Value, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::new();
    let mut chunks = 0usize;
    while let Some(frame) = reader.next().await {
        let frame = frame?;
        if buf.len() + frame.len() > max_bytes {
            return Err(CodecError::PayloadTooLarge { limit: max_bytes });
        }
        buf.extend_from_slice(&frame);
        chunks += 1;
    }
    if chunks == 0 {
        return Err(CodecError::EmptyPayload);
    }
    Ok(serde_json::from_slice(&buf)?)
}

/// Header and payload in one go, for callers that validate nothing in between.
pub async fn read_message<R>(reader: &mut MessageReader<R>, max_bytes: usize) -> Result<Message, CodecError>
where
    R: AsyncRead + Unpin,
{
    let header = read_header(reader).await?;
    let data = read_payload(reader, max_bytes).await?;
    Ok(Message { header, data })
}
