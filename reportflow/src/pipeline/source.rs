//! Record sources.

use async_trait::async_trait;
use futures::stream::{self, Stream};
use std::collections::VecDeque;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::Record;
use crate::errors::{ReportflowError, Result};

const READ_CHUNK: usize = 8 * 1024;

/// Yields records one at a time.
#[async_trait]
pub trait RecordSource: Send {
    /// Returns the next record, or `None` when the source is exhausted.
    async fn next_record(&mut self) -> Result<Option<Record>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SplitState {
    /// Before the opening bracket.
    Start,
    /// After `[` or `,`, waiting for an element.
    Expecting,
    /// Inside an element.
    InElement,
    /// After the closing bracket.
    Done,
}

/// Splits a top-level JSON array into its elements without reading the
/// whole document.
///
/// Only the bytes of the element being assembled are buffered. Completely
/// empty input is treated as an empty array.
pub struct JsonArraySource<R> {
    reader: R,
    chunk: Box<[u8]>,
    pos: usize,
    filled: usize,
    element: Vec<u8>,
    state: SplitState,
    depth: usize,
    in_string: bool,
    escaped: bool,
    ordinal: u64,
}

impl<R> std::fmt::Debug for JsonArraySource<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonArraySource")
            .field("state", &self.state)
            .field("ordinal", &self.ordinal)
            .finish_non_exhaustive()
    }
}

impl JsonArraySource<tokio::fs::File> {
    /// Opens a JSON array file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = tokio::fs::File::open(path.as_ref()).await?;
        Ok(Self::new(file))
    }
}

impl<R: AsyncRead + Unpin + Send> JsonArraySource<R> {
    /// Creates a source over a reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            chunk: vec![0; READ_CHUNK].into_boxed_slice(),
            pos: 0,
            filled: 0,
            element: Vec::new(),
            state: SplitState::Start,
            depth: 0,
            in_string: false,
            escaped: false,
            ordinal: 0,
        }
    }

    /// Returns the number of records yielded so far.
    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    /// Turns the source into a stream of records.
    pub fn into_stream(self) -> impl Stream<Item = Result<Record>> {
        stream::unfold(Some(self), |source| async move {
            let mut source = source?;
            match source.next_record().await {
                Ok(Some(record)) => Some((Ok(record), Some(source))),
                Ok(None) => None,
                Err(err) => Some((Err(err), None)),
            }
        })
    }

    async fn next_byte(&mut self) -> Result<Option<u8>> {
        if self.pos == self.filled {
            self.filled = self.reader.read(&mut self.chunk).await?;
            self.pos = 0;
            if self.filled == 0 {
                return Ok(None);
            }
        }
        let byte = self.chunk[self.pos];
        self.pos += 1;
        Ok(Some(byte))
    }

    fn malformed(&self, message: &str) -> ReportflowError {
        ReportflowError::MalformedResponse(format!(
            "JSON array source, after record {}: {message}",
            self.ordinal
        ))
    }

    fn emit(&mut self) -> Result<Record> {
        let record = serde_json::from_slice(&self.element).map_err(|err| {
            ReportflowError::MalformedResponse(format!(
                "JSON array source, record {}: {err}",
                self.ordinal + 1
            ))
        })?;
        self.element.clear();
        self.ordinal += 1;
        Ok(record)
    }

    /// Feeds one element byte. Returns the next state when the byte ends the
    /// element (a separator or the closing bracket at depth 0).
    fn feed(&mut self, byte: u8) -> Option<SplitState> {
        if self.in_string {
            self.element.push(byte);
            if self.escaped {
                self.escaped = false;
            } else if byte == b'\\' {
                self.escaped = true;
            } else if byte == b'"' {
                self.in_string = false;
            }
            return None;
        }

        match byte {
            b',' if self.depth == 0 => Some(SplitState::Expecting),
            b']' if self.depth == 0 => Some(SplitState::Done),
            b'"' => {
                self.in_string = true;
                self.element.push(byte);
                None
            }
            b'{' | b'[' => {
                self.depth += 1;
                self.element.push(byte);
                None
            }
            b'}' | b']' => {
                self.depth = self.depth.saturating_sub(1);
                self.element.push(byte);
                None
            }
            _ => {
                self.element.push(byte);
                None
            }
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> RecordSource for JsonArraySource<R> {
    async fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            let Some(byte) = self.next_byte().await? else {
                return match self.state {
                    SplitState::Start | SplitState::Done => Ok(None),
                    SplitState::Expecting | SplitState::InElement => {
                        Err(self.malformed("unexpected end of input"))
                    }
                };
            };

            match self.state {
                SplitState::Start => {
                    if byte.is_ascii_whitespace() {
                        continue;
                    }
                    if byte != b'[' {
                        return Err(self.malformed("expected a top-level array"));
                    }
                    self.state = SplitState::Expecting;
                }
                SplitState::Expecting => {
                    if byte.is_ascii_whitespace() {
                        continue;
                    }
                    if byte == b']' && self.ordinal == 0 {
                        self.state = SplitState::Done;
                        continue;
                    }
                    if byte == b',' || byte == b']' {
                        return Err(self.malformed("missing array element"));
                    }
                    self.state = SplitState::InElement;
                    if let Some(next) = self.feed(byte) {
                        self.state = next;
                        return self.emit().map(Some);
                    }
                }
                SplitState::InElement => {
                    if let Some(next) = self.feed(byte) {
                        self.state = next;
                        return self.emit().map(Some);
                    }
                }
                SplitState::Done => {
                    if !byte.is_ascii_whitespace() {
                        return Err(self.malformed("trailing content after the array"));
                    }
                }
            }
        }
    }
}

/// A source over records already in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    records: VecDeque<Record>,
}

impl MemorySource {
    /// Creates a source yielding `records` in order.
    #[must_use]
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records: records.into(),
        }
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    async fn next_record(&mut self) -> Result<Option<Record>> {
        Ok(self.records.pop_front())
    }
}
