//! Serialized command/response channel to one instrument session.
//!
//! Every exchange goes through a single [`parking_lot::Mutex`] because the
//! instrument accepts exactly one outstanding request at a time. Callers that
//! need several commands to reach the instrument back to back (select a data
//! source, then read its curve) take the [`Session`] guard with
//! [`Transport::lock`] and issue them while holding it.
//!
//! The transport never retries. A failure is reported once, with the command
//! that caused it, and the caller decides what to do about it.

use parking_lot::{Mutex, MutexGuard};
use std::io::{self, BufRead, BufReader, Read, Write};

/// Commands ending in this character expect a reply.
pub const QUERY_MARKER: char = '?';
/// Separates chained commands and the fields of their combined reply.
pub const FIELD_SEPARATOR: char = ';';

const TERMINATOR: u8 = b'\n';
const BLOCK_MARKER: u8 = b'#';

/// Byte stream to an instrument, usually a TCP socket or a serial port.
pub trait Link: Read + Write + Send {
    /// Drop any bytes the instrument sent that nobody asked for.
    fn clear_input(&mut self) -> io::Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    #[error("Block does not start with '#' (found {found:?})")]
    MissingMarker { found: Option<u8> },

    #[error("Invalid block digit count {found:?}")]
    BadDigitCount { found: Option<u8> },

    #[error("Invalid block length field {field:?}")]
    BadLength { field: String },

    #[error("Block declares {declared} payload bytes but only {available} arrived")]
    Truncated { declared: usize, available: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error on `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Malformed block in reply to `{command}`: {source}")]
    Decode {
        command: String,
        #[source]
        source: BlockError,
    },

    #[error("Reply to `{command}` is not valid UTF-8")]
    Utf8 { command: String },
}

impl TransportError {
    fn io(command: &str, source: io::Error) -> Self {
        Self::Io {
            command: command.to_string(),
            source,
        }
    }

    pub fn command(&self) -> &str {
        match self {
            Self::Io { command, .. } | Self::Decode { command, .. } | Self::Utf8 { command } => {
                command
            }
        }
    }

    /// Short classification used to count repeated failures of the same kind.
    pub fn signature(&self) -> String {
        match self {
            Self::Io { source, .. } => format!("io:{:?}", source.kind()),
            Self::Decode { .. } => "decode".to_string(),
            Self::Utf8 { .. } => "utf8".to_string(),
        }
    }
}

/// Parsed `#<d><length>` prefix of a definite-length binary block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub digits: usize,
    pub payload_len: usize,
}

impl BlockHeader {
    /// Bytes taken by the marker, the digit count and the length field.
    pub const fn header_len(&self) -> usize {
        2 + self.digits
    }

    pub fn parse(frame: &[u8]) -> Result<Self, BlockError> {
        let marker = frame.first().copied();
        Self::check_marker(marker)?;
        let digits = Self::digit_count(frame.get(1).copied())?;
        let field = frame.get(2..2 + digits).ok_or_else(|| BlockError::BadLength {
            field: String::from_utf8_lossy(&frame[2.min(frame.len())..]).into_owned(),
        })?;
        Ok(Self {
            digits,
            payload_len: Self::payload_len(field)?,
        })
    }

    fn check_marker(found: Option<u8>) -> Result<(), BlockError> {
        if found == Some(BLOCK_MARKER) {
            Ok(())
        } else {
            Err(BlockError::MissingMarker { found })
        }
    }

    fn digit_count(found: Option<u8>) -> Result<usize, BlockError> {
        // '#0' is the indefinite-length form, which the scope never sends for curves
        match found {
            Some(d @ b'1'..=b'9') => Ok(usize::from(d - b'0')),
            _ => Err(BlockError::BadDigitCount { found }),
        }
    }

    fn payload_len(field: &[u8]) -> Result<usize, BlockError> {
        let bad = || BlockError::BadLength {
            field: String::from_utf8_lossy(field).into_owned(),
        };
        if field.is_empty() || !field.iter().all(u8::is_ascii_digit) {
            return Err(bad());
        }
        std::str::from_utf8(field)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(bad)
    }
}

/// Return the payload of a complete block frame, with the header and the
/// trailing terminator removed.
pub fn decode_block(frame: &[u8]) -> Result<&[u8], BlockError> {
    let header = BlockHeader::parse(frame)?;
    let start = header.header_len();
    let available = frame.len() - start;
    if available < header.payload_len {
        return Err(BlockError::Truncated {
            declared: header.payload_len,
            available,
        });
    }
    Ok(&frame[start..start + header.payload_len])
}

/// Join several query headers into one request, e.g. `A?;:B?;:C?`.
pub fn combined_query<S: AsRef<str>>(headers: &[S]) -> String {
    let mut query = String::new();
    for (i, header) in headers.iter().enumerate() {
        if i > 0 {
            query.push(FIELD_SEPARATOR);
            query.push(':');
        }
        query.push_str(header.as_ref());
        query.push(QUERY_MARKER);
    }
    query
}

/// Split a combined reply into its fields, in request order.
pub fn split_fields(reply: &str) -> Vec<String> {
    reply
        .split(FIELD_SEPARATOR)
        .map(|field| field.trim().to_string())
        .collect()
}

enum BlockRead {
    Io(io::Error),
    Decode(BlockError),
}

impl From<io::Error> for BlockRead {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<BlockError> for BlockRead {
    fn from(e: BlockError) -> Self {
        Self::Decode(e)
    }
}

/// Exclusive access to the instrument, obtained from [`Transport::lock`].
pub struct Session {
    reader: BufReader<Box<dyn Link>>,
}

impl Session {
    /// Send a command that produces no reply.
    pub fn write(&mut self, command: &str) -> Result<(), TransportError> {
        log::trace!("> {command}");
        let link = self.reader.get_mut();
        link.write_all(command.as_bytes())
            .and_then(|()| link.write_all(&[TERMINATOR]))
            .and_then(|()| link.flush())
            .map_err(|e| TransportError::io(command, e))
    }

    /// Send a query and return its reply without the line terminator.
    pub fn query(&mut self, command: &str) -> Result<String, TransportError> {
        self.write(command)?;

        let mut line = Vec::new();
        let read = self.reader.read_until(TERMINATOR, &mut line);
        if let Err(e) = read {
            self.discard_input();
            return Err(TransportError::io(command, e));
        }
        if line.last() != Some(&TERMINATOR) {
            return Err(TransportError::io(
                command,
                io::ErrorKind::UnexpectedEof.into(),
            ));
        }

        let reply = String::from_utf8(line).map_err(|_| TransportError::Utf8 {
            command: command.to_string(),
        })?;
        let reply = reply.trim_end_matches(|c| c == '\r' || c == '\n').to_string();
        log::trace!("< {reply}");
        Ok(reply)
    }

    /// Send several queries as one request and split the combined reply.
    pub fn query_fields<S: AsRef<str>>(
        &mut self,
        headers: &[S],
    ) -> Result<Vec<String>, TransportError> {
        let query = combined_query(headers);
        log::debug!("Combined query: {query}");
        Ok(split_fields(&self.query(&query)?))
    }

    /// Send a query answered with a definite-length binary block and return
    /// exactly the payload bytes.
    pub fn query_binary_block(&mut self, command: &str) -> Result<Vec<u8>, TransportError> {
        self.write(command)?;
        match self.read_block() {
            Ok(payload) => {
                log::trace!("< {} byte block", payload.len());
                Ok(payload)
            }
            Err(BlockRead::Io(e)) => {
                self.discard_input();
                Err(TransportError::io(command, e))
            }
            Err(BlockRead::Decode(e)) => {
                self.discard_input();
                Err(TransportError::Decode {
                    command: command.to_string(),
                    source: e,
                })
            }
        }
    }

    fn read_block(&mut self) -> Result<Vec<u8>, BlockRead> {
        let mut lead = [0u8; 2];
        self.reader.read_exact(&mut lead)?;
        BlockHeader::check_marker(Some(lead[0]))?;
        let digits = BlockHeader::digit_count(Some(lead[1]))?;

        let mut field = vec![0u8; digits];
        self.reader.read_exact(&mut field)?;
        let declared = BlockHeader::payload_len(&field)?;

        // A stream that ends before the declared length means the framing is
        // lost; a read error mid-payload is still an I/O failure.
        let mut payload = vec![0u8; declared];
        let mut filled = 0;
        while filled < declared {
            match self.reader.read(&mut payload[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        if filled < declared {
            return Err(BlockError::Truncated {
                declared,
                available: filled,
            }
            .into());
        }

        let mut terminator = [0u8; 1];
        if let Ok(1) = self.reader.read(&mut terminator) {
            if terminator[0] != TERMINATOR {
                log::warn!("Unexpected block terminator 0x{:02x}", terminator[0]);
            }
        }
        Ok(payload)
    }

    /// Throw away buffered and pending input so the next reply starts clean.
    pub fn discard_input(&mut self) {
        let buffered = self.reader.buffer().len();
        self.reader.consume(buffered);
        if let Err(e) = self.reader.get_mut().clear_input() {
            log::warn!("Failed to clear instrument input: {e}");
        }
    }
}

/// Shared handle to one instrument session.
pub struct Transport {
    session: Mutex<Session>,
}

impl Transport {
    pub fn new(link: Box<dyn Link>) -> Self {
        Self {
            session: Mutex::new(Session {
                reader: BufReader::new(link),
            }),
        }
    }

    /// Take exclusive use of the session; blocks while another caller has it.
    pub fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock()
    }

    pub fn write(&self, command: &str) -> Result<(), TransportError> {
        self.lock().write(command)
    }

    pub fn query(&self, command: &str) -> Result<String, TransportError> {
        self.lock().query(command)
    }

    pub fn query_fields<S: AsRef<str>>(&self, headers: &[S]) -> Result<Vec<String>, TransportError> {
        self.lock().query_fields(headers)
    }

    pub fn query_binary_block(&self, command: &str) -> Result<Vec<u8>, TransportError> {
        self.lock().query_binary_block(command)
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}
