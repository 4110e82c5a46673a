//! Line classification for inbound AT responses.
//!
//! Every finalized line is classified by a chain of scanners: the
//! per-command scanner, then the session scanner, then [`scan_generic`].
//! A scanner returning `None` defers to the next one in the chain; the
//! generic scanner is total and terminates the chain.

/// A caller-supplied line classifier. `None` defers to the next scanner.
pub type LineScanner = fn(&[u8]) -> Option<LineKind>;

/// The category a finalized line falls into.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LineKind {
    /// A non-final line, delivered as part of the response body.
    Intermediate,
    /// A final line confirming the command; dropped from the body.
    FinalOk,
    /// A final line reporting an error; kept in the body.
    FinalError,
    /// An unsolicited result code, routed outside the response.
    Urc,
    /// Final line announcing that this many raw payload bytes follow.
    RawDataFollows(usize),
    /// Final line announcing a payload of this many bytes, hex-encoded.
    HexDataFollows(usize),
}

const URC_PREFIXES: &[&str] = &["RING"];
const FINAL_ERROR_PREFIXES: &[&str] = &["ERROR", "NO CARRIER", "+CME ERROR:", "+CMS ERROR:"];
const FINAL_OK_PREFIXES: &[&str] = &["OK", "> "];

fn prefix_in_table(line: &[u8], table: &[&str]) -> bool {
    table.iter().any(|prefix| line.starts_with(prefix.as_bytes()))
}

/// Classifies a line by the standard V.250/3GPP result code prefixes.
pub fn scan_generic(line: &[u8]) -> LineKind {
    if prefix_in_table(line, URC_PREFIXES) {
        LineKind::Urc
    } else if prefix_in_table(line, FINAL_ERROR_PREFIXES) {
        LineKind::FinalError
    } else if prefix_in_table(line, FINAL_OK_PREFIXES) {
        LineKind::FinalOk
    } else {
        LineKind::Intermediate
    }
}
