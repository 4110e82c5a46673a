//! Byte-fed parser for AT command responses.
//!
//! [`AtParser`] is a pure state machine: it consumes bytes one at a time,
//! segments them into lines, classifies each line through the scanner chain
//! and assembles the response body in a fixed-capacity buffer. It performs
//! no I/O and no allocation; the dispatcher drives it from the reader task
//! and routes the emitted [`Event`]s.

use core::str::FromStr;
use heapless::{String, Vec};

use crate::scan::{LineKind, LineScanner, scan_generic};

/// Maximum length of a data-prompt marker.
pub const AT_PROMPT_SIZE: usize = 8;
/// The standard "send your payload now" marker.
pub const DATA_PROMPT: &str = "> ";

/// An output of the parser, borrowed from its buffer.
///
/// The bytes stay valid until the parser is fed again or reset.
#[derive(Debug, Eq, PartialEq)]
pub enum Event<'a> {
    /// A complete response body: intermediate lines joined by `\n`.
    Response(&'a [u8]),
    /// A single unsolicited line, not part of any response.
    Urc(&'a [u8]),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    /// No command outstanding; every complete line is a URC.
    Idle,
    /// A command is outstanding, awaiting its final line.
    ReadLine,
    /// As `ReadLine`, but the prompt bytes also terminate the response.
    DataPrompt,
    /// Capturing `data_left` raw payload bytes.
    RawData,
    /// Capturing `data_left` payload bytes sent as ASCII hex pairs.
    HexData,
}

/// Buffer fixup deferred until the next feed, because the bytes it removes
/// back the `Event` handed to the caller.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Deferred {
    Reset,
    DropLine,
}

#[derive(Debug, PartialEq)]
pub struct AtParser<const N: usize> {
    buf: Vec<u8, N>,
    /// Start of the line under construction; `[0, current)` holds the
    /// committed lines of the current response, `\n`-separated.
    current: usize,
    state: State,
    data_left: usize,
    high_nibble: Option<u8>,
    prompt: String<AT_PROMPT_SIZE>,
    command_scanner: Option<LineScanner>,
    session_scanner: Option<LineScanner>,
    deferred: Option<Deferred>,
}

impl<const N: usize> Default for AtParser<N> {
    fn default() -> Self {
        Self::new(None)
    }
}

impl<const N: usize> AtParser<N> {
    pub fn new(session_scanner: Option<LineScanner>) -> Self {
        Self {
            buf: Vec::new(),
            current: 0,
            state: State::Idle,
            data_left: 0,
            high_nibble: None,
            prompt: String::from_str(DATA_PROMPT).unwrap_or_default(),
            command_scanner: None,
            session_scanner,
            deferred: None,
        }
    }

    /// Returns the parser to `Idle`, dropping any partial response and the
    /// per-command scanner. The session scanner survives.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.current = 0;
        self.state = State::Idle;
        self.data_left = 0;
        self.high_nibble = None;
        self.prompt = String::from_str(DATA_PROMPT).unwrap_or_default();
        self.command_scanner = None;
        self.deferred = None;
    }

    /// Arms the parser for the response to a command about to be sent.
    pub fn expect_response(&mut self, scanner: Option<LineScanner>) {
        self.flush_deferred();
        self.state = State::ReadLine;
        self.command_scanner = scanner;
    }

    /// Arms the parser for a response that may end with a data prompt
    /// instead of a complete line.
    pub fn expect_prompt(&mut self, prompt: String<AT_PROMPT_SIZE>, scanner: Option<LineScanner>) {
        self.flush_deferred();
        self.state = State::DataPrompt;
        self.prompt = prompt;
        self.command_scanner = scanner;
    }

    /// Feeds a slice, forwarding every emitted event to `sink`.
    pub fn feed<F: FnMut(Event<'_>)>(&mut self, data: &[u8], mut sink: F) {
        for &ch in data {
            if let Some(event) = self.feed_byte(ch) {
                sink(event);
            }
        }
    }

    /// Drives the state machine with one byte.
    pub fn feed_byte(&mut self, ch: u8) -> Option<Event<'_>> {
        self.flush_deferred();
        match self.state {
            State::Idle | State::ReadLine | State::DataPrompt => {
                if ch == b'\n' {
                    return self.handle_line();
                }
                if ch == b'\r' {
                    // Lines are LF-terminated; a lone CR never completes one.
                    return None;
                }
                self.append(ch);
                if self.state == State::DataPrompt && self.line() == self.prompt.as_bytes() {
                    let len = self.buf.len();
                    self.deferred = Some(Deferred::Reset);
                    return Some(Event::Response(&self.buf[..len]));
                }
                None
            }
            State::RawData => {
                self.append(ch);
                self.data_left -= 1;
                if self.data_left == 0 {
                    self.finish_capture();
                }
                None
            }
            State::HexData => {
                if let Some(val) = hex_value(ch) {
                    match self.high_nibble.take() {
                        None => self.high_nibble = Some(val << 4),
                        Some(high) => {
                            self.append(high | val);
                            self.data_left -= 1;
                        }
                    }
                }
                if self.data_left == 0 {
                    self.finish_capture();
                }
                None
            }
        }
    }

    fn handle_line(&mut self) -> Option<Event<'_>> {
        if self.current == self.buf.len() {
            // Consecutive CR/LF collapse; an empty line is never emitted.
            return None;
        }
        if self.state == State::Idle {
            return self.take_urc();
        }
        match self.classify() {
            LineKind::Urc => self.take_urc(),
            LineKind::Intermediate => {
                self.current = self.buf.len();
                None
            }
            LineKind::FinalOk => {
                // The confirmation line and its separator are not part of
                // the delivered body.
                let end = self.current.saturating_sub(1);
                self.deferred = Some(Deferred::Reset);
                Some(Event::Response(&self.buf[..end]))
            }
            LineKind::FinalError => {
                self.current = self.buf.len();
                let end = self.buf.len();
                self.deferred = Some(Deferred::Reset);
                Some(Event::Response(&self.buf[..end]))
            }
            LineKind::RawDataFollows(len) => {
                self.current = self.buf.len();
                self.begin_capture(State::RawData, len);
                None
            }
            LineKind::HexDataFollows(len) => {
                self.current = self.buf.len();
                self.high_nibble = None;
                self.begin_capture(State::HexData, len);
                None
            }
        }
    }

    fn classify(&self) -> LineKind {
        let line = &self.buf[self.current..];
        self.command_scanner
            .and_then(|scan| scan(line))
            .or_else(|| self.session_scanner.and_then(|scan| scan(line)))
            .unwrap_or_else(|| scan_generic(line))
    }

    fn take_urc(&mut self) -> Option<Event<'_>> {
        let start = self.current;
        self.deferred = Some(Deferred::DropLine);
        Some(Event::Urc(&self.buf[start..]))
    }

    fn begin_capture(&mut self, state: State, len: usize) {
        if len == 0 {
            self.state = State::ReadLine;
        } else {
            self.data_left = len;
            self.state = state;
        }
    }

    fn finish_capture(&mut self) {
        // The captured bytes become one committed line of the response.
        let _ = self.buf.push(b'\n');
        self.current = self.buf.len();
        self.state = State::ReadLine;
    }

    /// Appends a byte, inserting the `\n` separator between the previous
    /// committed line and a freshly started one. Bytes that do not fit are
    /// dropped; an oversized response is delivered truncated.
    fn append(&mut self, ch: u8) {
        if !self.buf.is_empty() && self.current == self.buf.len() && self.buf.push(b'\n').is_ok() {
            self.current = self.buf.len();
        }
        let _ = self.buf.push(ch);
    }

    fn line(&self) -> &[u8] {
        &self.buf[self.current..]
    }

    fn flush_deferred(&mut self) {
        match self.deferred.take() {
            Some(Deferred::Reset) => self.reset(),
            Some(Deferred::DropLine) => {
                self.buf.truncate(self.current);
                if self.current > 0 {
                    self.current -= 1;
                    self.buf.truncate(self.current);
                }
            }
            None => {}
        }
    }
}

fn hex_value(ch: u8) -> Option<u8> {
    match ch {
        b'0'..=b'9' => Some(ch - b'0'),
        b'a'..=b'f' => Some(ch - b'a' + 10),
        b'A'..=b'F' => Some(ch - b'A' + 10),
        _ => None,
    }
}
