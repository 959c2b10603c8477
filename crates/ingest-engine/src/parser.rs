//! Streaming feed parser -- raw bytes in, calendar components out.
//!
//! The parser is a push-based state machine: callers feed it chunks of any
//! size via [`FeedParser::push`] and receive [`ParseEvent`]s as soon as a
//! block footer (`END:VEVENT`, ...) is seen. Memory is bounded by one
//! logical line plus the properties of the component currently open,
//! regardless of feed size.
//!
//! # Key design decisions
//!
//! - **Bytes until the logical line is complete**: folding may split a
//!   multi-byte UTF-8 sequence, so continuation lines are joined as bytes and
//!   decoded only once the next non-continuation line arrives.
//! - **Recover per component**: a broken boundary or content line costs at
//!   most the component it sits in, and is reported as a warning event.
//! - **Fail fast on size**: the byte ceiling is checked before a chunk is
//!   processed, and against a declared length before anything is read.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{IngestError, Result};
use crate::model::{CalendarComponent, ComponentKind, Property};

/// Components that may appear directly under VCALENDAR.
const TOP_LEVEL: &[&str] = &["VEVENT", "VTODO", "VJOURNAL", "VFREEBUSY", "VTIMEZONE"];

/// Memory and size bounds for one parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserLimits {
    /// Size ceiling for the whole feed.
    pub max_feed_bytes: u64,
    /// Longest logical (unfolded) line kept; the excess is dropped.
    pub max_line_bytes: usize,
    /// Most properties kept per component.
    pub max_properties: usize,
    /// Read size for streamed input.
    pub chunk_size: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self {
            max_feed_bytes: 10 * 1024 * 1024,
            max_line_bytes: 16 * 1024,
            max_properties: 512,
            chunk_size: 8 * 1024,
        }
    }
}

/// Output of the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseEvent {
    Component(CalendarComponent),
    /// A recovered structural problem.
    Warning(String),
}

#[derive(Debug)]
struct OpenComponent {
    name: String,
    line: usize,
    properties: Vec<Property>,
    /// Names of nested sub-components currently open (VALARM, STANDARD, ...).
    nested: Vec<String>,
    dropped: usize,
}

#[derive(Debug)]
struct LogicalLine {
    line: usize,
    bytes: Vec<u8>,
    truncated: bool,
}

/// Incremental, bounded-memory parser.
#[derive(Debug)]
pub struct FeedParser {
    limits: ParserLimits,
    source: Arc<str>,
    consumed: u64,
    line_no: usize,
    /// Current physical line, not yet terminated by LF.
    pending: Vec<u8>,
    pending_overflow: bool,
    logical: Option<LogicalLine>,
    open: Option<OpenComponent>,
    calendar_depth: usize,
    finished: bool,
}

impl FeedParser {
    pub fn new(limits: ParserLimits, source: impl Into<Arc<str>>) -> Self {
        Self {
            limits,
            source: source.into(),
            consumed: 0,
            line_no: 0,
            pending: Vec::new(),
            pending_overflow: false,
            logical: None,
            open: None,
            calendar_depth: 0,
            finished: false,
        }
    }

    pub fn limits(&self) -> &ParserLimits {
        &self.limits
    }

    /// Bytes accepted so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Reject a feed whose declared length is already over the ceiling.
    ///
    /// # Errors
    /// Returns `IngestError::ContentTooLarge` when `declared` exceeds the limit.
    pub fn check_declared_size(&self, declared: Option<u64>) -> Result<()> {
        match declared {
            Some(len) if len > self.limits.max_feed_bytes => Err(IngestError::ContentTooLarge {
                limit: self.limits.max_feed_bytes,
                observed: len,
            }),
            _ => Ok(()),
        }
    }

    /// Feed the next chunk. Chunk boundaries may fall anywhere.
    ///
    /// # Errors
    /// Returns `IngestError::ContentTooLarge` as soon as the running total
    /// exceeds the ceiling; the chunk is not processed.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<ParseEvent>> {
        let observed = self.consumed.saturating_add(chunk.len() as u64);
        if observed > self.limits.max_feed_bytes {
            return Err(IngestError::ContentTooLarge {
                limit: self.limits.max_feed_bytes,
                observed,
            });
        }
        self.consumed = observed;

        let mut out = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            self.append_pending(&rest[..pos]);
            self.take_physical_line(&mut out);
            rest = &rest[pos + 1..];
        }
        self.append_pending(rest);
        Ok(out)
    }

    /// Flush buffered input at end of stream.
    pub fn finish(&mut self) -> Vec<ParseEvent> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.finished = true;
        if !self.pending.is_empty() {
            self.take_physical_line(&mut out);
        }
        self.flush_logical(&mut out);
        if let Some(open) = self.open.take() {
            out.push(ParseEvent::Warning(format!(
                "line {}: {} never closed before end of feed, skipped",
                open.line, open.name
            )));
        }
        out
    }

    fn append_pending(&mut self, bytes: &[u8]) {
        if self.pending_overflow {
            return;
        }
        // +1 leaves room for a trailing CR.
        let room = (self.limits.max_line_bytes + 1).saturating_sub(self.pending.len());
        if bytes.len() > room {
            self.pending.extend_from_slice(&bytes[..room]);
            self.pending_overflow = true;
        } else {
            self.pending.extend_from_slice(bytes);
        }
    }

    fn take_physical_line(&mut self, out: &mut Vec<ParseEvent>) {
        let mut line = std::mem::take(&mut self.pending);
        let overflowed = std::mem::take(&mut self.pending_overflow);
        // An overflowed line was cut before its terminator.
        if !overflowed && line.last() == Some(&b'\r') {
            line.pop();
        }
        self.physical_line(line, overflowed, out);
    }

    fn physical_line(&mut self, line: Vec<u8>, overflowed: bool, out: &mut Vec<ParseEvent>) {
        self.line_no += 1;
        if line.is_empty() {
            return;
        }
        if matches!(line[0], b' ' | b'\t') {
            let max = self.limits.max_line_bytes;
            match self.logical.as_mut() {
                Some(logical) => {
                    let room = max.saturating_sub(logical.bytes.len());
                    let continuation = &line[1..];
                    if continuation.len() > room {
                        logical.bytes.extend_from_slice(&continuation[..room]);
                        logical.truncated = true;
                    } else {
                        logical.bytes.extend_from_slice(continuation);
                        logical.truncated |= overflowed;
                    }
                }
                None => out.push(ParseEvent::Warning(format!(
                    "line {}: continuation line with nothing to continue, skipped",
                    self.line_no
                ))),
            }
            return;
        }
        self.flush_logical(out);
        let truncated = overflowed || line.len() > self.limits.max_line_bytes;
        let mut bytes = line;
        bytes.truncate(self.limits.max_line_bytes);
        self.logical = Some(LogicalLine {
            line: self.line_no,
            bytes,
            truncated,
        });
    }

    fn flush_logical(&mut self, out: &mut Vec<ParseEvent>) {
        let Some(logical) = self.logical.take() else {
            return;
        };
        if logical.truncated {
            out.push(ParseEvent::Warning(format!(
                "line {}: longer than {} bytes, truncated",
                logical.line, self.limits.max_line_bytes
            )));
        }
        let text = match String::from_utf8(logical.bytes) {
            Ok(text) => text,
            Err(e) => {
                out.push(ParseEvent::Warning(format!(
                    "line {}: invalid UTF-8 replaced",
                    logical.line
                )));
                String::from_utf8_lossy(e.as_bytes()).into_owned()
            }
        };
        match parse_content_line(&text, logical.line) {
            Ok(property) => self.apply(property, logical.line, out),
            Err(e) => out.push(ParseEvent::Warning(format!("{e}, line skipped"))),
        }
    }

    fn apply(&mut self, property: Property, line: usize, out: &mut Vec<ParseEvent>) {
        match property.name.as_str() {
            "BEGIN" => self.begin(property.value.trim().to_ascii_uppercase(), line, out),
            "END" => self.end(property.value.trim().to_ascii_uppercase(), line, out),
            _ => {
                let max = self.limits.max_properties;
                if let Some(open) = self.open.as_mut() {
                    if !open.nested.is_empty() {
                        return;
                    }
                    if open.properties.len() < max {
                        open.properties.push(property);
                    } else {
                        open.dropped += 1;
                    }
                }
            }
        }
    }

    fn begin(&mut self, name: String, line: usize, out: &mut Vec<ParseEvent>) {
        let Some(open) = self.open.as_mut() else {
            if name == "VCALENDAR" {
                self.calendar_depth += 1;
            } else {
                self.open = Some(OpenComponent {
                    name,
                    line,
                    properties: Vec::new(),
                    nested: Vec::new(),
                    dropped: 0,
                });
            }
            return;
        };

        if open.nested.is_empty() && TOP_LEVEL.contains(&name.as_str()) {
            out.push(ParseEvent::Warning(format!(
                "line {}: {} not closed before BEGIN:{} at line {line}, skipped",
                open.line, open.name, name
            )));
            self.open = Some(OpenComponent {
                name,
                line,
                properties: Vec::new(),
                nested: Vec::new(),
                dropped: 0,
            });
        } else {
            open.nested.push(name);
        }
    }

    fn end(&mut self, name: String, line: usize, out: &mut Vec<ParseEvent>) {
        let Some(mut open) = self.open.take() else {
            if name == "VCALENDAR" && self.calendar_depth > 0 {
                self.calendar_depth -= 1;
            } else {
                out.push(ParseEvent::Warning(format!(
                    "line {line}: END:{name} without matching BEGIN"
                )));
            }
            return;
        };

        if let Some(inner) = open.nested.last() {
            if *inner == name {
                open.nested.pop();
                self.open = Some(open);
            } else {
                out.push(ParseEvent::Warning(format!(
                    "line {line}: END:{name} does not close BEGIN:{inner}, {} at line {} skipped",
                    open.name, open.line
                )));
                self.close_calendar_if(&name);
            }
            return;
        }

        if open.name != name {
            out.push(ParseEvent::Warning(format!(
                "line {line}: END:{name} does not close {} at line {}, skipped",
                open.name, open.line
            )));
            self.close_calendar_if(&name);
            return;
        }

        if open.dropped > 0 {
            out.push(ParseEvent::Warning(format!(
                "line {}: {} has more than {} properties, {} dropped",
                open.line, open.name, self.limits.max_properties, open.dropped
            )));
        }
        out.push(ParseEvent::Component(CalendarComponent {
            kind: ComponentKind::from_name(&open.name),
            properties: open.properties,
            source: self.source.clone(),
            line: open.line,
        }));
    }

    fn close_calendar_if(&mut self, name: &str) {
        if name == "VCALENDAR" && self.calendar_depth > 0 {
            self.calendar_depth -= 1;
        }
    }
}

/// Parse one unfolded content line: `NAME *(";" PARAM "=" VALUE) ":" VALUE`.
///
/// # Errors
/// Returns `IngestError::Structural` if the line has no name, no colon, or an
/// unterminated quoted parameter.
pub fn parse_content_line(line: &str, line_no: usize) -> Result<Property> {
    let err = |message: String| IngestError::Structural {
        line: line_no,
        message,
    };

    let name_end = line
        .find([';', ':'])
        .ok_or_else(|| err("missing ':' separator".to_string()))?;
    let name = &line[..name_end];
    if name.is_empty() {
        return Err(err("missing property name".to_string()));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(err(format!("invalid property name {name:?}")));
    }

    let mut params = Vec::new();
    let mut rest = &line[name_end..];
    while let Some(after) = rest.strip_prefix(';') {
        let eq = after
            .find('=')
            .ok_or_else(|| err("parameter without '='".to_string()))?;
        let param_name = after[..eq].trim().to_ascii_uppercase();
        let mut cursor = &after[eq + 1..];
        let mut value = String::new();
        loop {
            if let Some(quoted) = cursor.strip_prefix('"') {
                let close = quoted
                    .find('"')
                    .ok_or_else(|| err("unterminated quoted parameter".to_string()))?;
                value.push_str(&quoted[..close]);
                cursor = &quoted[close + 1..];
            } else {
                let end = cursor
                    .find([',', ';', ':'])
                    .ok_or_else(|| err("missing ':' separator".to_string()))?;
                value.push_str(&cursor[..end]);
                cursor = &cursor[end..];
            }
            match cursor.strip_prefix(',') {
                Some(next) => {
                    value.push(',');
                    cursor = next;
                }
                None => break,
            }
        }
        params.push((param_name, value));
        rest = cursor;
    }

    let value = rest
        .strip_prefix(':')
        .ok_or_else(|| err("missing ':' separator".to_string()))?;
    Ok(Property {
        name: name.to_ascii_uppercase(),
        params,
        value: value.to_string(),
    })
}

/// Lazy, single-pass iterator over an in-memory feed.
pub struct Events<'a> {
    parser: FeedParser,
    input: &'a [u8],
    pos: usize,
    queue: VecDeque<ParseEvent>,
    error: Option<IngestError>,
    failed: bool,
}

impl Iterator for Events<'_> {
    type Item = Result<ParseEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.error.take() {
            self.failed = true;
            return Some(Err(e));
        }
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Some(Ok(event));
            }
            if self.failed || self.parser.finished {
                return None;
            }
            if self.pos == self.input.len() {
                self.queue.extend(self.parser.finish());
                continue;
            }
            let end = (self.pos + self.parser.limits.chunk_size.max(1)).min(self.input.len());
            match self.parser.push(&self.input[self.pos..end]) {
                Ok(events) => self.queue.extend(events),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
            self.pos = end;
        }
    }
}

/// Parse a complete feed held in memory.
///
/// The size ceiling is checked up front, before any line is parsed.
pub fn parse_str<'a>(limits: ParserLimits, source: &str, feed: &'a str) -> Events<'a> {
    let parser = FeedParser::new(limits, source);
    let error = parser.check_declared_size(Some(feed.len() as u64)).err();
    Events {
        parser,
        input: feed.as_bytes(),
        pos: 0,
        queue: VecDeque::new(),
        error,
        failed: false,
    }
}

struct StreamState<R> {
    reader: R,
    parser: FeedParser,
    buf: Vec<u8>,
    queue: VecDeque<ParseEvent>,
    done: bool,
}

/// Parse a feed from an async reader, one chunk at a time.
///
/// Yields to the scheduler after every chunk. At most one chunk's worth of
/// events is buffered.
pub fn component_stream<R>(reader: R, parser: FeedParser) -> impl Stream<Item = Result<ParseEvent>>
where
    R: AsyncRead + Unpin,
{
    let chunk_size = parser.limits.chunk_size.max(1);
    let state = StreamState {
        reader,
        parser,
        buf: vec![0; chunk_size],
        queue: VecDeque::new(),
        done: false,
    };
    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.queue.pop_front() {
                return Some((Ok(event), st));
            }
            if st.done {
                return None;
            }
            match st.reader.read(&mut st.buf).await {
                Ok(0) => {
                    st.done = true;
                    let tail = st.parser.finish();
                    st.queue.extend(tail);
                }
                Ok(n) => match st.parser.push(&st.buf[..n]) {
                    Ok(events) => st.queue.extend(events),
                    Err(e) => {
                        st.done = true;
                        return Some((Err(e), st));
                    }
                },
                Err(e) => {
                    st.done = true;
                    return Some((Err(IngestError::Io(e)), st));
                }
            }
            tokio::task::yield_now().await;
        }
    })
}
