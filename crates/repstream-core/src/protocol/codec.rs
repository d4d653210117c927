//! Frame encoding, incremental decoding and the async frame writer
//!
//! Format: [opcode:2][body_len:4][body:N], big-endian

use super::context::ProtocolContext;
use super::message::{Message, Opcode};
use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Frame header size in bytes
pub const HEADER_LEN: usize = 6;

/// Largest body accepted from a peer
pub const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// Encode a full frame
pub fn encode_frame(message: &Message, ctx: &ProtocolContext) -> Result<Bytes> {
    let body_len = message.body_len(ctx);
    if body_len > MAX_BODY_LEN {
        return Err(Error::protocol(format!(
            "{:?} body of {} bytes exceeds the {} byte limit",
            message.opcode(),
            body_len,
            MAX_BODY_LEN
        )));
    }
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body_len);
    buf.put_i16(message.opcode() as i16);
    buf.put_i32(body_len as i32);
    message.encode_body(ctx, &mut buf)?;
    Ok(buf.freeze())
}

/// Validate a header against the session and return the opcode and body length
pub fn parse_header(header: &[u8; HEADER_LEN], ctx: &ProtocolContext) -> Result<(Opcode, usize)> {
    let raw = i16::from_be_bytes([header[0], header[1]]);
    let opcode = Opcode::try_from(raw)?;
    if opcode.sub_protocol() != ctx.sub_protocol {
        return Err(Error::protocol(format!(
            "{:?} not valid in the {:?} sub-protocol",
            opcode, ctx.sub_protocol
        )));
    }
    let len = i32::from_be_bytes([header[2], header[3], header[4], header[5]]);
    let len = usize::try_from(len)
        .map_err(|_| Error::protocol(format!("{:?} has negative body length {}", opcode, len)))?;
    if len > MAX_BODY_LEN {
        return Err(Error::protocol(format!(
            "{:?} body length {} exceeds the {} byte limit",
            opcode, len, MAX_BODY_LEN
        )));
    }
    Ok((opcode, len))
}

/// Decode one complete frame; the slice must hold exactly one frame
pub fn decode_frame(frame: &[u8], ctx: &ProtocolContext) -> Result<Message> {
    if frame.len() < HEADER_LEN {
        return Err(Error::protocol("Frame shorter than its header"));
    }
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&frame[..HEADER_LEN]);
    let (opcode, len) = parse_header(&header, ctx)?;
    if frame.len() != HEADER_LEN + len {
        return Err(Error::protocol(format!(
            "{:?} frame declares {} body bytes, carries {}",
            opcode,
            len,
            frame.len() - HEADER_LEN
        )));
    }
    Message::decode_body(opcode, &frame[HEADER_LEN..], ctx)
}

/// Pop one frame off the front of `buf` if it is complete
pub fn try_decode(buf: &mut BytesMut, ctx: &ProtocolContext) -> Result<Option<Message>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&buf[..HEADER_LEN]);
    let (opcode, len) = parse_header(&header, ctx)?;
    if buf.len() < HEADER_LEN + len {
        buf.reserve(HEADER_LEN + len - buf.len());
        return Ok(None);
    }
    buf.advance(HEADER_LEN);
    let body = buf.split_to(len);
    Message::decode_body(opcode, &body, ctx).map(Some)
}

/// Write a frame to an async stream
pub async fn write_message_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
    ctx: &ProtocolContext,
) -> Result<usize> {
    let frame = encode_frame(message, ctx)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(frame.len())
}
