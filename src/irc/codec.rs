//! IRC line codec — frames a byte stream into IRC messages.
//!
//! Splits on `\r\n`, decodes each line as UTF-8 (lossily, so a client with
//! a broken encoding cannot kill its connection), parses it into a
//! [`Message`], and serializes outgoing messages with `\r\n` termination.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::{Message, ParseError};

/// Maximum line length (including `\r\n`). RFC 1459 says 512 bytes, but
/// translated upstream lines can run longer; be generous.
const MAX_LINE_LENGTH: usize = 8191;

/// Codec error: either a protocol parse failure or an I/O error.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("line exceeds maximum length ({MAX_LINE_LENGTH} bytes)")]
    LineTooLong,
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A tokio codec that frames IRC messages on `\r\n` boundaries.
#[derive(Debug, Default)]
pub struct IrcCodec;

impl Decoder for IrcCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = src.windows(2).position(|w| w == b"\r\n") else {
                // No complete line yet. Check if the buffer is getting too large.
                if src.len() > MAX_LINE_LENGTH {
                    return Err(CodecError::LineTooLong);
                }
                return Ok(None);
            };

            // Extract the line (without \r\n), advance the buffer.
            let line_bytes = src.split_to(pos);
            src.advance(2); // skip \r\n

            let line = String::from_utf8_lossy(&line_bytes);
            match Message::parse(&line) {
                Ok(msg) => return Ok(Some(msg)),
                // Stray blank lines are tolerated.
                Err(ParseError::Empty) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Encoder<Message> for IrcCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire = item.to_wire();
        dst.reserve(wire.len() + 2);
        dst.put_slice(wire.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
