//! tokio codecs for the two control channel directions: raw command lines
//! coming from the client and reply blocks coming from the origin.

use super::line_parser::parse_reply_code;
use crate::server::error::ProxyError;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

const MAX_LINE_LENGTH: usize = 4096;

// Decodes one raw command line at a time, split on LF. The line keeps its
// original terminator; normalization happens when the line is forwarded.
// Invalid UTF-8 decodes lossily, which normalization then strips as junk.
pub(crate) struct CommandCodec {
    // Index of the next byte to examine for a '\n', so already scanned bytes
    // are not scanned again when decode is called with more data.
    next_index: usize,
}

impl CommandCodec {
    pub(crate) fn new() -> Self {
        CommandCodec { next_index: 0 }
    }
}

impl Decoder for CommandCodec {
    type Item = String;
    type Error = ProxyError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if let Some(newline_offset) = buf[self.next_index..].iter().position(|b| *b == b'\n') {
            let newline_index = newline_offset + self.next_index;
            let line = buf.split_to(newline_index + 1);
            self.next_index = 0;
            Ok(Some(String::from_utf8_lossy(&line).into_owned()))
        } else if buf.len() > MAX_LINE_LENGTH {
            Err(ProxyError::LineTooLong)
        } else {
            self.next_index = buf.len();
            Ok(None)
        }
    }
}

/// A complete reply from the origin: a single line, or a whole multi-line
/// block merged into one buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReplyBlock {
    /// Code of the (first) reply line, when it carries one.
    pub code: Option<u16>,
    /// The raw bytes exactly as the origin sent them, terminators included.
    pub buf: Bytes,
}

impl ReplyBlock {
    pub(crate) fn starts_with(&self, prefix: &[u8]) -> bool {
        self.buf.starts_with(prefix)
    }
}

// Decodes origin replies. A line opening with `NNN-` starts a block that is
// accumulated until a line with the same code followed by a space arrives;
// the whole block is then emitted as one frame so it reaches the client as
// one write.
pub(crate) struct ReplyCodec {
    next_index: usize,
    block: Option<(u16, BytesMut)>,
}

impl ReplyCodec {
    pub(crate) fn new() -> Self {
        ReplyCodec { next_index: 0, block: None }
    }

    fn take_line(&mut self, buf: &mut BytesMut) -> Result<Option<BytesMut>, ProxyError> {
        if let Some(newline_offset) = buf[self.next_index..].iter().position(|b| *b == b'\n') {
            let newline_index = newline_offset + self.next_index;
            let line = buf.split_to(newline_index + 1);
            self.next_index = 0;
            Ok(Some(line))
        } else if buf.len() > MAX_LINE_LENGTH {
            Err(ProxyError::LineTooLong)
        } else {
            self.next_index = buf.len();
            Ok(None)
        }
    }
}

impl Decoder for ReplyCodec {
    type Item = ReplyBlock;
    type Error = ProxyError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<ReplyBlock>, Self::Error> {
        loop {
            let line = match self.take_line(buf)? {
                Some(line) => line,
                None => return Ok(None),
            };

            if let Some((code, mut acc)) = self.block.take() {
                acc.extend_from_slice(&line);
                let terminal = matches!(parse_reply_code(&line), Some((c, b' ')) if c == code);
                if terminal {
                    return Ok(Some(ReplyBlock {
                        code: Some(code),
                        buf: acc.freeze(),
                    }));
                }
                self.block = Some((code, acc));
                continue;
            }

            match parse_reply_code(&line) {
                Some((code, b'-')) => {
                    self.block = Some((code, line));
                }
                parsed => {
                    return Ok(Some(ReplyBlock {
                        code: parsed.map(|(code, _)| code),
                        buf: line.freeze(),
                    }));
                }
            }
        }
    }
}
