//! Length-prefixed protobuf framing.
//!
//! Every frame is a 16-bit big-endian body length followed by one encoded
//! message. Long-lived sessions use [`FrameReader`]/[`FrameWriter`] built on
//! `tokio-util`'s `LengthDelimitedCodec`; one-shot handshakes on raw sockets
//! use [`read_message`]/[`write_message`], which never consume bytes past the
//! frame they read so the socket can be handed over to a byte copier.

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Encoder, FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::error::{ProtoError, ProtoResult};

/// Maximum frame size accepted by relay nodes.
pub const MAX_RELAY_FRAME: usize = 4096;

/// Maximum frame size for RPC sessions (the length prefix limit).
pub const MAX_RPC_FRAME: usize = u16::MAX as usize;

/// Reading half of a framed session.
pub type FrameReader<R> = FramedRead<R, LengthDelimitedCodec>;

/// Writing half of a framed session.
pub type FrameWriter<W> = FramedWrite<W, LengthDelimitedCodec>;

/// Builds the codec used for every NPP frame.
#[must_use]
pub fn frame_codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(2)
        .big_endian()
        .max_frame_length(max_frame_length)
        .new_codec()
}

/// Wraps a reader into a frame stream.
pub fn frame_reader<R: AsyncRead>(io: R, max_frame_length: usize) -> FrameReader<R> {
    FramedRead::new(io, frame_codec(max_frame_length))
}

/// Wraps a writer into a frame sink.
pub fn frame_writer<W: AsyncWrite>(io: W, max_frame_length: usize) -> FrameWriter<W> {
    FramedWrite::new(io, frame_codec(max_frame_length))
}

fn encode_checked<M: Message>(msg: &M, max: usize) -> ProtoResult<Bytes> {
    let size = msg.encoded_len();
    if size > max {
        return Err(ProtoError::FrameTooLarge { size, max });
    }
    Ok(Bytes::from(msg.encode_to_vec()))
}

/// Sends one message through a frame sink.
pub async fn send<W, M>(writer: &mut FrameWriter<W>, msg: &M) -> ProtoResult<()>
where
    W: AsyncWrite + Unpin,
    M: Message,
{
    let max = writer.encoder().max_frame_length();
    writer.send(encode_checked(msg, max)?).await?;
    Ok(())
}

/// Receives one message from a frame stream.
///
/// Returns [`ProtoError::Closed`] when the stream ends cleanly.
pub async fn recv<R, M>(reader: &mut FrameReader<R>) -> ProtoResult<M>
where
    R: AsyncRead + Unpin,
    M: Message + Default,
{
    match reader.next().await {
        Some(Ok(frame)) => Ok(M::decode(frame.freeze())?),
        Some(Err(e)) => Err(e.into()),
        None => Err(ProtoError::Closed),
    }
}

/// Writes a single framed message directly to a socket.
pub async fn write_message<W, M>(io: &mut W, msg: &M, max: usize) -> ProtoResult<()>
where
    W: AsyncWrite + Unpin,
    M: Message,
{
    let body = encode_checked(msg, max)?;
    let mut frame = BytesMut::with_capacity(body.len() + 2);
    frame_codec(max).encode(body, &mut frame)?;
    io.write_all(&frame).await?;
    io.flush().await?;
    Ok(())
}

/// Reads exactly one framed message from a socket.
pub async fn read_message<R, M>(io: &mut R, max: usize) -> ProtoResult<M>
where
    R: AsyncRead + Unpin,
    M: Message + Default,
{
    let size = usize::from(io.read_u16().await.map_err(eof_as_closed)?);
    if size > max {
        return Err(ProtoError::FrameTooLarge { size, max });
    }
    let mut body = vec![0u8; size];
    io.read_exact(&mut body).await.map_err(eof_as_closed)?;
    Ok(M::decode(body.as_slice())?)
}

fn eof_as_closed(err: std::io::Error) -> ProtoError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtoError::Closed
    } else {
        ProtoError::Io(err)
    }
}
