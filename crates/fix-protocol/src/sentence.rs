//! Sentence shape and checksum handling
//!
//! A sentence is one line of the form `$<address>,<fields>*<hh>` where `hh`
//! is the two-digit hexadecimal XOR of every byte between `$` and `*`.
//! Detection only needs [`is_sentence_shape`]; [`Sentence`] adds the full
//! checksum and address breakdown for logging and simulation.

use std::fmt;

use crate::error::ParseError;

/// Strip any trailing `\r` / `\n` bytes from a line
fn trim_line_end(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\r' | b'\n') {
        end -= 1;
    }
    &line[..end]
}

/// Check whether a line has the shape of a sentence
///
/// The line must start with `$` and carry the `*` checksum delimiter exactly
/// three characters before the end of the line. The checksum digits
/// themselves are not verified.
pub fn is_sentence_shape(line: &[u8]) -> bool {
    let line = trim_line_end(line);
    line.len() >= 4 && line[0] == b'$' && line[line.len() - 3] == b'*'
}

/// Compute the XOR checksum over a sentence body (bytes between `$` and `*`)
pub fn checksum(body: &[u8]) -> u8 {
    body.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// A parsed sentence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    /// Talker identifier (`GP`, `GN`, ... or `P` for proprietary sentences)
    pub talker: String,
    /// Sentence type (`GGA`, `RMC`, ...)
    pub kind: String,
    /// Comma-separated data fields after the address
    pub fields: Vec<String>,
}

impl Sentence {
    /// Build a sentence from its parts
    pub fn new(talker: impl Into<String>, kind: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            talker: talker.into(),
            kind: kind.into(),
            fields,
        }
    }

    /// Parse a line, verifying its checksum
    pub fn parse(line: &[u8]) -> Result<Self, ParseError> {
        let line = trim_line_end(line);
        if line.first() != Some(&b'$') {
            return Err(ParseError::MissingStart);
        }
        if !is_sentence_shape(line) {
            return Err(ParseError::MissingChecksum);
        }

        let star = line.len() - 3;
        let body = &line[1..star];
        let digits = String::from_utf8_lossy(&line[star + 1..]).into_owned();
        let expected =
            u8::from_str_radix(&digits, 16).map_err(|_| ParseError::InvalidChecksum(digits))?;
        let actual = checksum(body);
        if expected != actual {
            return Err(ParseError::ChecksumMismatch { expected, actual });
        }

        let body = String::from_utf8_lossy(body);
        let mut parts = body.split(',');
        let address = parts.next().unwrap_or_default();
        let (talker, kind) = split_address(address)?;

        Ok(Self {
            talker: talker.to_string(),
            kind: kind.to_string(),
            fields: parts.map(str::to_string).collect(),
        })
    }

    /// Whether this is a vendor-proprietary (`$P...`) sentence
    pub fn is_proprietary(&self) -> bool {
        self.talker == "P"
    }

    /// The body covered by the checksum (address and fields)
    fn body(&self) -> String {
        let mut body = format!("{}{}", self.talker, self.kind);
        for field in &self.fields {
            body.push(',');
            body.push_str(field);
        }
        body
    }

    /// Encode as a wire line, including checksum and `\r\n` terminator
    pub fn to_line(&self) -> String {
        format!("{}\r\n", self)
    }
}

impl fmt::Display for Sentence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = self.body();
        write!(f, "${}*{:02X}", body, checksum(body.as_bytes()))
    }
}

/// Split an address field into talker and sentence type
fn split_address(address: &str) -> Result<(&str, &str), ParseError> {
    if !address.is_ascii() {
        return Err(ParseError::InvalidAddress(address.to_string()));
    }
    if let Some(kind) = address.strip_prefix('P') {
        if !kind.is_empty() {
            return Ok(("P", kind));
        }
    } else if address.len() >= 3 {
        return Ok(address.split_at(2));
    }
    Err(ParseError::InvalidAddress(address.to_string()))
}
