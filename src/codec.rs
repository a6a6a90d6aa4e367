use std::collections::VecDeque;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::error::Error;

const BLOCK_START: &str = "START";
const BLOCK_END: &str = "END";

/// One unit of protocol output: a bare line, or the interior lines of a
/// START/END delimited block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    Line(String),
    Block(Vec<String>),
}

/// Streaming frame reassembly for the bloomd wire protocol.
///
/// Incoming chunks are split on `\r\n`, `\r` or `\n` and buffered as
/// complete lines; a line equal to `START` opens a block that ends at the
/// matching `END` line. A block still missing its `END` remembers how far
/// it has been scanned, so feeding a large block in small chunks stays
/// linear instead of rescanning from `START` on every chunk.
///
/// Outbound, requests are single lines terminated with `\n`.
#[derive(Debug, Default)]
pub(crate) struct FrameCodec {
    lines: VecDeque<String>,
    /// Index into `lines` up to which an open block has been scanned for
    /// its `END` marker.
    scanned: usize,
}

impl FrameCodec {
    /// Move every complete line out of `src`, leaving unterminated text
    /// (and a possibly-dangling `\r`) for the next chunk.
    fn extract_lines(&mut self, src: &mut BytesMut) {
        loop {
            let mut terminator = None;
            for (index, byte) in src.iter().enumerate() {
                match byte {
                    b'\n' => {
                        terminator = Some((index, 1));
                        break;
                    }
                    b'\r' => {
                        // A trailing `\r` may still be the first half of
                        // `\r\n`; hold it until the next byte arrives.
                        if index + 1 < src.len() {
                            let width = if src[index + 1] == b'\n' { 2 } else { 1 };
                            terminator = Some((index, width));
                        }
                        break;
                    }
                    _ => {}
                }
            }
            match terminator {
                Some((index, width)) => {
                    let line = src.split_to(index);
                    src.advance(width);
                    self.lines
                        .push_back(String::from_utf8_lossy(&line).into_owned());
                }
                None => break,
            }
        }
    }

    fn take_frame(&mut self) -> Option<Frame> {
        if self.lines.front()?.as_str() != BLOCK_START {
            self.scanned = 0;
            return self.lines.pop_front().map(Frame::Line);
        }
        let mut index = self.scanned.max(1);
        while index < self.lines.len() {
            if self.lines[index] == BLOCK_END {
                let mut body: Vec<String> = self.lines.drain(..=index).collect();
                body.pop();
                body.remove(0);
                self.scanned = 0;
                return Some(Frame::Block(body));
            }
            index += 1;
        }
        // Resume the END scan here once more lines arrive.
        self.scanned = index;
        None
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        self.extract_lines(src);
        let frame = self.take_frame();
        if let Some(frame) = &frame {
            trace!(?frame, "decoded frame");
        }
        Ok(frame)
    }
}

impl Encoder<String> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), Error> {
        dst.reserve(line.len() + 1);
        dst.put(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
