//! Netstring framing (spec.md §4.1).
//!
//! A netstring is `<ascii-decimal-length>":"<payload bytes>","`. This
//! mirrors the shape of the original Python implementation's
//! `netstring.py`: a [`SingleStringFetcher`]-equivalent that reads one
//! string's pieces out of a byte buffer and raises `WantRead` (here,
//! returns `Ok(None)`) when the buffer runs dry mid-string, driven by a
//! [`StreamReader`] that owns the accumulated input and hands out one
//! fetcher at a time.
//!
//! [`Decoder`] is the convenience wrapper the socketmap responder actually
//! uses: it drives a [`StreamReader`] to completion on every `feed()` call
//! and returns whichever complete payloads became available.

use std::fmt;

/// Errors from netstring parsing. All are fatal to the current connection
/// (spec.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetstringError {
    /// A non-digit byte appeared before the `:`, or no length digits were
    /// seen at all.
    BadLength,
    /// The declared length exceeds the configured maximum, detected before
    /// the terminating `:` is even reached.
    TooLong,
    /// The byte following the payload was not `,`.
    BadTerminator,
    /// The input ended while a string was still being parsed.
    IncompleteNetstring,
    /// `next_string()` was called while the previous fetcher was not yet
    /// exhausted. A caller bug, not a protocol error.
    InappropriateParserState,
}

impl fmt::Display for NetstringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            NetstringError::BadLength => "non-digit symbol or missing length before ':'",
            NetstringError::TooLong => "netstring length is over limit",
            NetstringError::BadTerminator => "bad netstring terminator",
            NetstringError::IncompleteNetstring => "input ends on unfinished string",
            NetstringError::InappropriateParserState => {
                "next_string() invoked while previous fetcher is not exhausted"
            }
        };
        f.write_str(msg)
    }
}

impl std::error::Error for NetstringError {}

/// Encode a single netstring.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 12);
    out.extend_from_slice(data.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(data);
    out.push(b',');
    out
}

/// Decode a buffer known to hold zero or more complete netstrings
/// back-to-back, with no trailing partial string.
///
/// Used by tests for the round-trip property; the responder itself drives
/// [`Decoder`] incrementally instead.
pub fn decode(data: &[u8]) -> Result<Vec<Vec<u8>>, NetstringError> {
    let mut decoder = Decoder::new(None);
    let mut out = decoder.feed(data)?;
    if !decoder.is_idle() {
        return Err(NetstringError::IncompleteNetstring);
    }
    out.shrink_to_fit();
    Ok(out)
}

/// Pulls the pieces of a single netstring payload out of a byte slice that
/// may not yet contain the whole thing.
#[derive(Debug)]
struct SingleStringFetcher {
    max_len: Option<usize>,
    len: Option<usize>,
    len_known: bool,
    remaining: usize,
    done: bool,
}

impl SingleStringFetcher {
    fn new(max_len: Option<usize>) -> Self {
        Self {
            max_len,
            len: None,
            len_known: false,
            remaining: 0,
            done: false,
        }
    }

    fn done(&self) -> bool {
        self.done
    }

    fn pending(&self) -> bool {
        self.len.is_some()
    }

    /// Advances `input`, returning `Ok(Some(piece))` (an empty `piece`
    /// signals end-of-string, once the terminator has been consumed) or
    /// `Ok(None)` when `input` ran out before the string was exhausted.
    fn read(&mut self, input: &mut &[u8]) -> Result<Option<Vec<u8>>, NetstringError> {
        if !self.len_known {
            loop {
                let Some((&byte, rest)) = input.split_first() else {
                    return Ok(None);
                };
                *input = rest;
                if byte == b':' {
                    if self.len.is_none() {
                        return Err(NetstringError::BadLength);
                    }
                    self.len_known = true;
                    self.remaining = self.len.unwrap();
                    break;
                }
                if !byte.is_ascii_digit() {
                    return Err(NetstringError::BadLength);
                }
                let digit = (byte - b'0') as usize;
                let new_len = self.len.unwrap_or(0).saturating_mul(10).saturating_add(digit);
                if let Some(max) = self.max_len {
                    if new_len > max {
                        return Err(NetstringError::TooLong);
                    }
                }
                self.len = Some(new_len);
            }
        }

        if self.remaining > 0 {
            if input.is_empty() {
                return Ok(None);
            }
            let take = input.len().min(self.remaining);
            let piece = input[..take].to_vec();
            *input = &input[take..];
            self.remaining -= take;
            return Ok(Some(piece));
        }

        if !self.done {
            let Some((&byte, rest)) = input.split_first() else {
                return Ok(None);
            };
            *input = rest;
            if byte == b',' {
                self.done = true;
            } else {
                return Err(NetstringError::BadTerminator);
            }
        }
        Ok(Some(Vec::new()))
    }
}

/// Async-friendly netstring decoder: fed arbitrary byte chunks, dispenses
/// one [`SingleStringFetcher`] at a time via [`StreamReader::next_string`].
pub struct StreamReader {
    max_len: Option<usize>,
    buf: Vec<u8>,
    pos: usize,
    fetcher: Option<SingleStringFetcher>,
}

impl StreamReader {
    /// `max_len` of `None` means unbounded.
    pub fn new(max_len: Option<usize>) -> Self {
        Self {
            max_len,
            buf: Vec::new(),
            pos: 0,
            fetcher: None,
        }
    }

    /// Append newly arrived bytes, compacting already-consumed input.
    pub fn feed(&mut self, data: &[u8]) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(data);
    }

    /// Whether a length has been parsed for the current string but it is
    /// not yet fully read — i.e. input ending now would be an
    /// [`NetstringError::IncompleteNetstring`].
    pub fn pending(&self) -> bool {
        self.fetcher.as_ref().is_some_and(|f| f.pending())
    }

    /// Start fetching a new string. Errors if the previous one (if any)
    /// was not fully consumed.
    pub fn next_string(&mut self) -> Result<(), NetstringError> {
        if let Some(fetcher) = &self.fetcher {
            if !fetcher.done() {
                return Err(NetstringError::InappropriateParserState);
            }
        }
        self.fetcher = Some(SingleStringFetcher::new(self.max_len));
        Ok(())
    }

    /// Read the next piece of the current string. An empty piece signals
    /// end-of-string; `None` signals the buffer ran dry (`WantRead`).
    ///
    /// # Panics
    ///
    /// Panics if [`StreamReader::next_string`] was not called first.
    pub fn read(&mut self) -> Result<Option<Vec<u8>>, NetstringError> {
        let fetcher = self
            .fetcher
            .as_mut()
            .expect("read() called before next_string()");
        let mut slice = &self.buf[self.pos..];
        let before = slice.len();
        let result = fetcher.read(&mut slice)?;
        self.pos += before - slice.len();
        Ok(result)
    }
}

/// Drives a [`StreamReader`] to completion on every `feed()`, returning
/// whichever payloads are now complete. This is the API the socketmap
/// responder (§4.4) actually uses; [`StreamReader`] is the lower-level
/// primitive it is built from.
pub struct Decoder {
    reader: StreamReader,
    awaiting_new_string: bool,
}

impl Decoder {
    pub fn new(max_len: Option<usize>) -> Self {
        Self {
            reader: StreamReader::new(max_len),
            awaiting_new_string: true,
        }
    }

    /// Whether the decoder is between strings (i.e. input ending now would
    /// not be an error).
    pub fn is_idle(&self) -> bool {
        self.awaiting_new_string && !self.reader.pending()
    }

    /// Feed a chunk of bytes, returning every netstring payload that
    /// became complete as a result.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>, NetstringError> {
        self.reader.feed(data);
        let mut out = Vec::new();
        loop {
            if self.awaiting_new_string {
                self.reader.next_string()?;
                self.awaiting_new_string = false;
            }
            let mut pieces: Vec<u8> = Vec::new();
            loop {
                match self.reader.read()? {
                    Some(piece) if piece.is_empty() => break,
                    Some(mut piece) => pieces.append(&mut piece),
                    None => return Ok(out),
                }
            }
            self.awaiting_new_string = true;
            out.push(pieces);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for s in [&b""[..], b"a", b"hello world", &[0u8, 1, 2, 255]] {
            let encoded = encode(s);
            let decoded = decode(&encoded).unwrap();
            assert_eq!(decoded, vec![s.to_vec()]);
        }
    }

    #[test]
    fn concatenated_round_trip() {
        let mut buf = Vec::new();
        buf.extend(encode(b"first"));
        buf.extend(encode(b"second"));
        buf.extend(encode(b""));
        let decoded = decode(&buf).unwrap();
        assert_eq!(
            decoded,
            vec![b"first".to_vec(), b"second".to_vec(), b"".to_vec()]
        );
    }

    #[test]
    fn streaming_decode_is_split_independent() {
        let mut whole = Vec::new();
        whole.extend(encode(b"test good.loc"));
        whole.extend(encode(b"another.domain"));

        for chunk_size in 1..=whole.len() {
            let mut decoder = Decoder::new(Some(4096));
            let mut results = Vec::new();
            for chunk in whole.chunks(chunk_size) {
                results.extend(decoder.feed(chunk).unwrap());
            }
            assert_eq!(
                results,
                vec![b"test good.loc".to_vec(), b"another.domain".to_vec()],
                "failed for chunk_size={chunk_size}"
            );
        }
    }

    #[test]
    fn bad_length_non_digit() {
        assert_eq!(decode(b"3a:xyz,"), Err(NetstringError::BadLength));
    }

    #[test]
    fn bad_length_missing_digits() {
        assert_eq!(decode(b":xyz,"), Err(NetstringError::BadLength));
    }

    #[test]
    fn too_long() {
        let mut decoder = Decoder::new(Some(10));
        assert_eq!(decoder.feed(b"999999:"), Err(NetstringError::TooLong));
    }

    #[test]
    fn bad_terminator() {
        assert_eq!(decode(b"4:test!"), Err(NetstringError::BadTerminator));
    }

    #[test]
    fn incomplete_netstring() {
        let mut decoder = Decoder::new(None);
        decoder.feed(b"5:hel").unwrap();
        assert!(!decoder.is_idle());
    }

    #[test]
    fn leading_zeros_accepted() {
        let decoded = decode(b"007:abcdefg,").unwrap();
        assert_eq!(decoded, vec![b"abcdefg".to_vec()]);
    }

    #[test]
    fn inappropriate_parser_state() {
        let mut reader = StreamReader::new(None);
        reader.feed(b"3:ab");
        reader.next_string().unwrap();
        // Fetcher is still pending (length known, payload incomplete).
        assert_eq!(
            reader.next_string(),
            Err(NetstringError::InappropriateParserState)
        );
    }
}
