//! NETCONF message framing.
//!
//! A `Framer` owns the reception buffer for one direction of a session. It
//! splits the raw byte stream into whole NETCONF messages and frames outgoing
//! messages the same way the peer talks. Two wire formats exist: base:1.0
//! terminates each message with `]]>]]>`, base:1.1 sends length-prefixed
//! chunks followed by a `\n##\n` marker. The format is sniffed from the first
//! bytes of the stream and stays fixed for the rest of the session.

use std::fmt;

const EOM: &[u8] = b"]]>]]>";
const CHUNK_INTRO: &[u8] = b"\n#";
const END_OF_CHUNKS: &[u8] = b"\n##\n";

// how many buffered bytes we need before classifying the stream
const DETECT_THRESHOLD: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingMode {
    /// Not enough bytes seen to classify the stream yet.
    Unknown,
    /// base:1.0 end-of-message framing.
    Base10,
    /// base:1.1 chunked framing.
    Base11,
}

/// A framing violation on a chunked stream. The buffer is dropped when one of
/// these is reported, and the framer goes back to sniffing the mode so it can
/// resynchronize on whatever arrives next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Bytes at a chunk boundary that start neither a chunk header nor the
    /// end-of-chunks marker.
    UnexpectedBytes,
    /// A chunk header whose length field is empty or not a decimal number.
    BadChunkLength,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::UnexpectedBytes => write!(f, "unexpected bytes at chunk boundary"),
            FrameError::BadChunkLength => write!(f, "malformed chunk length"),
        }
    }
}

impl std::error::Error for FrameError {}

/// The outcome of one `feed` call.
#[derive(Debug, Default)]
pub struct Feed {
    /// Whole messages completed by this batch of bytes, in arrival order.
    pub messages: Vec<Vec<u8>>,
    /// Set when decoding stopped on a framing violation.
    pub error: Option<FrameError>,
}

pub struct Framer {
    mode: FramingMode,
    buf: Vec<u8>,
}

impl Framer {
    pub fn new() -> Framer {
        Framer { mode: FramingMode::Unknown, buf: Vec::new() }
    }

    pub fn mode(&self) -> FramingMode {
        self.mode
    }

    /// Number of unconsumed bytes waiting for the rest of a message.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append `bytes` to the reception buffer and extract every message that
    /// is now complete. Never blocks and never reorders messages. A partial
    /// message stays buffered for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Feed {
        self.buf.extend_from_slice(bytes);
        let mut feed = Feed::default();

        if self.mode == FramingMode::Unknown {
            if self.buf.len() <= DETECT_THRESHOLD {
                return feed;
            }
            self.mode = if self.buf.starts_with(CHUNK_INTRO) {
                FramingMode::Base11
            } else {
                FramingMode::Base10
            };
        }

        if self.mode == FramingMode::Base10 {
            self.decode_eom(&mut feed);
        } else {
            self.decode_chunked(&mut feed);
        }
        feed
    }

    /// Frame one outgoing message in this direction's mode.
    pub fn encode(&self, msg: &[u8]) -> Vec<u8> {
        match self.mode {
            FramingMode::Base11 => {
                let header = format!("\n#{}\n", msg.len());
                let mut out = Vec::with_capacity(header.len() + msg.len() + END_OF_CHUNKS.len());
                out.extend_from_slice(header.as_bytes());
                out.extend_from_slice(msg);
                out.extend_from_slice(END_OF_CHUNKS);
                out
            }
            // an unclassified direction answers in end-of-message framing
            _ => {
                let mut out = Vec::with_capacity(msg.len() + EOM.len());
                out.extend_from_slice(msg);
                out.extend_from_slice(EOM);
                out
            }
        }
    }

    fn decode_eom(&mut self, feed: &mut Feed) {
        let mut start = 0;
        while let Some(at) = find(&self.buf[start..], EOM) {
            feed.messages.push(self.buf[start..start + at].to_vec());
            start += at + EOM.len();
        }
        if start > 0 {
            self.buf.drain(..start);
        }
    }

    fn decode_chunked(&mut self, feed: &mut Feed) {
        let mut pos = 0; // cursor into buf
        let mut consumed = 0; // bytes belonging to fully emitted messages
        let mut acc: Vec<u8> = Vec::new();
        loop {
            let rest = &self.buf[pos..];
            if rest.is_empty() {
                break;
            }
            if rest[0] != b'\n' {
                return self.bail(feed, FrameError::UnexpectedBytes);
            }
            if rest.len() < 2 {
                break; // lone newline, header or marker still arriving
            }
            if rest[1] != b'#' {
                return self.bail(feed, FrameError::UnexpectedBytes);
            }
            if rest.get(2).copied() == Some(b'#') {
                // end-of-chunks marker, or a prefix of one
                match rest.get(3).copied() {
                    Some(b'\n') => {
                        feed.messages.push(std::mem::take(&mut acc));
                        pos += END_OF_CHUNKS.len();
                        consumed = pos;
                        continue;
                    }
                    Some(_) => return self.bail(feed, FrameError::UnexpectedBytes),
                    None => break,
                }
            }
            if rest.len() < 3 {
                break; // bare "\n#", could go either way
            }

            // chunk header: \n#<decimal-length>\n
            let mut end = 2;
            while end < rest.len() && rest[end].is_ascii_digit() {
                end += 1;
            }
            match rest.get(end).copied() {
                Some(b'\n') => {
                    if end == 2 {
                        return self.bail(feed, FrameError::BadChunkLength);
                    }
                    let parsed: Option<usize> =
                        std::str::from_utf8(&rest[2..end]).ok().and_then(|s| s.parse().ok());
                    let len = match parsed {
                        Some(n) => n,
                        None => return self.bail(feed, FrameError::BadChunkLength),
                    };
                    let body = end + 1;
                    if rest.len() - body >= len {
                        acc.extend_from_slice(&rest[body..body + len]);
                        pos += body + len;
                    } else {
                        break; // wait for the rest of the chunk
                    }
                }
                Some(_) => return self.bail(feed, FrameError::BadChunkLength),
                None => break, // length field still arriving
            }
        }
        self.buf.drain(..consumed);
    }

    fn bail(&mut self, feed: &mut Feed, err: FrameError) {
        feed.error = Some(err);
        self.buf.clear();
        self.mode = FramingMode::Unknown;
    }
}

impl Default for Framer {
    fn default() -> Self {
        Framer::new()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
