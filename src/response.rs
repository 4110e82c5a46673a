//! Response bodies and `+CMD: value,...` line parsing.

use core::fmt::{Display, Write};
use core::str::FromStr;
use heapless::{String, Vec};

use crate::error::Error;

/// Outbound command scratch, trailing CR included.
pub const AT_COMMAND_SIZE: usize = 80;
/// Response accumulation buffer of the parser and the delivered body.
pub const AT_BUF_SIZE: usize = 256;
/// A single inbound line: URCs and command responses.
pub const AT_LINE_SIZE: usize = 128;
const AT_VALUE_COUNT: usize = 8;

/// A complete response body: the command's intermediate lines joined by
/// `\n`, exactly as accumulated by the parser. An error final line is part
/// of the body; a confirming `OK` never is.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AtResponse {
    buf: Vec<u8, AT_BUF_SIZE>,
}

impl AtResponse {
    pub(crate) fn from_body(body: &[u8]) -> Self {
        let mut buf = Vec::new();
        let len = body.len().min(AT_BUF_SIZE);
        // Cannot fail, the source buffer is never larger.
        let _ = buf.extend_from_slice(&body[..len]);
        Self { buf }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_str(&self) -> crate::Result<&str> {
        core::str::from_utf8(&self.buf).map_err(|_| Error::StringEncodingError)
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The non-empty lines of the body.
    pub fn lines(&self) -> impl Iterator<Item = &[u8]> {
        self.buf.split(|&ch| ch == b'\n').filter(|line| !line.is_empty())
    }

    /// Finds and parses the first `+{command}: values` line of the body.
    pub fn command_response(&self, command: &str) -> Option<CommandResponse> {
        self.lines()
            .filter_map(|line| core::str::from_utf8(line).ok())
            .filter_map(|line| CommandResponse::new(line).ok())
            .find(|response| response.command() == command)
    }
}

impl Display for AtResponse {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for &byte in &self.buf {
            let ch = if byte == b'\n' || (0x20..0x7f).contains(&byte) {
                byte as char
            } else {
                '.'
            };
            f.write_char(ch)?;
        }
        Ok(())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for AtResponse {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{=[u8]:a}", self.buf.as_slice())
    }
}

/// One `+CMD: rest` line, with access to the command name and its
/// comma-separated values.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandResponse {
    line: String<AT_LINE_SIZE>,
    prefix_end: usize,
}

impl CommandResponse {
    pub fn new(line: &str) -> crate::Result<Self> {
        let (name, rest) = Self::split_command(line).ok_or(Error::ParseError)?;
        Self::split_values(rest)?;
        Ok(Self {
            line: String::from_str(line).map_err(|_| Error::BufferTooSmallError)?,
            prefix_end: 1 + name.len(),
        })
    }

    /// The command name, without the leading `+`.
    pub fn command(&self) -> &str {
        &self.line[1..self.prefix_end]
    }

    /// Everything after the `: ` separator, verbatim.
    pub fn rest(&self) -> &str {
        &self.line[self.prefix_end + 2..]
    }

    pub fn values(&self) -> Vec<&str, AT_VALUE_COUNT> {
        Self::split_values(self.rest()).unwrap_or_default()
    }

    /// Splits `+NAME: rest` into the name and the rest.
    fn split_command(line: &str) -> Option<(&str, &str)> {
        line.strip_prefix('+')?.split_once(": ")
    }

    /// Parses the values of an AT command response.
    ///
    /// Double quotes around strings are dropped, numbers stay strings:
    /// `1,"google.com",15` is parsed into `["1", "google.com", "15"]`.
    fn split_values(rest: &str) -> Result<Vec<&str, AT_VALUE_COUNT>, Error> {
        let mut values = Vec::new();
        let mut tail = rest;
        while !tail.is_empty() {
            let (value, after) = Self::take_value(tail)?;
            values.push(value).map_err(|_| Error::BufferTooSmallError)?;
            tail = after;
        }
        Ok(values)
    }

    /// Takes the leading value off `input`, returning it together with
    /// whatever follows its comma.
    fn take_value(input: &str) -> Result<(&str, &str), Error> {
        let Some(quoted) = input.strip_prefix('"') else {
            return Ok(match input.split_once(',') {
                Some((value, after)) => (value, after),
                None => (input, ""),
            });
        };
        let closing = quoted.find('"').ok_or(Error::ParseError)?;
        let after = match &quoted[closing + 1..] {
            "" => "",
            // The closing quote must be followed by a separator.
            rest => rest.strip_prefix(',').ok_or(Error::ParseError)?,
        };
        Ok((&quoted[..closing], after))
    }

    /// Parses every value as `T`.
    pub fn parse_values<T: FromStr>(&self) -> Result<Vec<T, AT_VALUE_COUNT>, Error> {
        let mut parsed = Vec::new();
        for value in self.values() {
            let value = value.parse().map_err(|_| Error::ParseError)?;
            parsed.push(value).map_err(|_| Error::BufferTooSmallError)?;
        }
        Ok(parsed)
    }
}

impl Display for CommandResponse {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.line.trim())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for CommandResponse {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{}", self.line)
    }
}
