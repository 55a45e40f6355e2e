//! Location Sentence Framing Library
//!
//! This crate provides the byte-level pieces needed to decide whether an
//! open channel is speaking a `$`-framed, checksum-terminated location
//! protocol, without a handshake:
//!
//! - **ASCII run scanning**: cheap rejection of binary noise produced by a
//!   channel running at the wrong baud rate
//! - **Line framing**: a streaming framer that splits raw reads into lines
//! - **Sentence validation**: the `$...*hh` shape test, XOR checksums and
//!   talker/sentence-type extraction
//!
//! # Example
//!
//! ```rust
//! use fix_protocol::{has_ascii_run, is_sentence_shape, LineFramer};
//!
//! let raw = b"$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47\r\n";
//! assert!(has_ascii_run(raw, 10));
//!
//! let mut framer = LineFramer::new();
//! framer.push_bytes(raw);
//! let line = framer.next_line().unwrap();
//! assert!(is_sentence_shape(&line));
//! ```

pub mod ascii;
pub mod error;
pub mod framer;
pub mod sentence;

pub use ascii::{ascii_run_length, has_ascii_run, PRINTABLE_MAX, PRINTABLE_MIN};
pub use error::ParseError;
pub use framer::{LineFramer, DEFAULT_MAX_LINE_LEN};
pub use sentence::{checksum, is_sentence_shape, Sentence};
