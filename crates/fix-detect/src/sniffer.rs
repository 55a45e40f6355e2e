//! Protocol sniffing for location devices
//!
//! Location devices start transmitting as soon as their channel is opened,
//! so there is no probe command to send. The sniffer instead walks a list of
//! baud rates, reads one buffer at each, and looks for printable ASCII
//! followed by a line with the `$...*hh` sentence shape.

use std::io;
use std::time::Duration;

use fix_protocol::{has_ascii_run, is_sentence_shape, LineFramer, Sentence, DEFAULT_MAX_LINE_LEN};
use tokio::io::AsyncReadExt;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use crate::error::DetectError;
use crate::link::{LinkOpener, SerialLink};

/// Rates tried when a device has no history, fastest first
pub const DEFAULT_BAUD_RATES: [u32; 6] = [115_200, 57_600, 38_400, 19_200, 9_600, 4_800];

/// Configuration for sniffing
#[derive(Debug, Clone)]
pub struct SnifferConfig {
    /// Timeout for each read; short because real devices talk immediately
    pub read_timeout: Duration,
    /// Rates tried after the device's last successful rate
    pub baud_rates: Vec<u32>,
    /// Contiguous printable bytes needed before lines are inspected
    pub min_ascii_run: usize,
    /// Lines inspected for a sentence before the rate is given up
    pub max_sentence_lines: usize,
    /// Size of each read
    pub read_buffer_size: usize,
    /// Longest unterminated line kept by the framer
    pub max_line_len: usize,
}

impl Default for SnifferConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(1),
            baud_rates: DEFAULT_BAUD_RATES.to_vec(),
            min_ascii_run: 10,
            max_sentence_lines: 10,
            read_buffer_size: 512,
            max_line_len: DEFAULT_MAX_LINE_LEN,
        }
    }
}

/// The channel being sniffed and how to reopen it
#[derive(Clone, Copy)]
pub struct SniffTarget<'a> {
    /// Transport address, used for reopening and in errors
    pub address: &'a str,
    /// Opener used to recover from a channel-state error
    pub opener: &'a dyn LinkOpener,
}

/// Baud-rate scanning protocol sniffer
#[derive(Debug, Clone, Default)]
pub struct ProtocolSniffer {
    config: SnifferConfig,
}

impl ProtocolSniffer {
    /// Create a sniffer with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sniffer with custom configuration
    pub fn with_config(config: SnifferConfig) -> Self {
        Self { config }
    }

    /// Get the current configuration
    pub fn config(&self) -> &SnifferConfig {
        &self.config
    }

    /// Build the rate list: the last successful rate first, then the defaults
    pub fn candidate_baud_rates(&self, last_success: Option<u32>) -> Vec<u32> {
        let mut rates = Vec::with_capacity(self.config.baud_rates.len() + 1);
        rates.extend(last_success);
        rates.extend(
            self.config
                .baud_rates
                .iter()
                .copied()
                .filter(|&rate| Some(rate) != last_success),
        );
        rates
    }

    /// Sniff `link` at each of `rates` in order
    ///
    /// Returns the confirming rate, `None` when no rate produced a sentence,
    /// or an error when the channel failed in a way a reopen could not fix
    /// or went quiet after showing a plausible signal.
    pub async fn sniff(
        &self,
        link: &mut Box<dyn SerialLink>,
        target: SniffTarget<'_>,
        rates: &[u32],
    ) -> Result<Option<u32>, DetectError> {
        for &baud in rates {
            let mut reopened = false;
            let data = loop {
                match self.read_at_rate(link, baud).await {
                    Ok(data) => break data,
                    Err(e) if !reopened => {
                        warn!(
                            "Channel error on {} at {} baud ({}), reopening",
                            target.address, baud, e
                        );
                        *link = target.opener.open(target.address, baud)?;
                        reopened = true;
                    }
                    Err(e) => {
                        return Err(DetectError::TransportError {
                            device: target.address.to_string(),
                            reason: e.to_string(),
                        })
                    }
                }
            };

            let Some(data) = data else {
                debug!("{}: no data at {} baud", target.address, baud);
                continue;
            };

            if !has_ascii_run(&data, self.config.min_ascii_run) {
                debug!("{}: no ASCII run at {} baud", target.address, baud);
                continue;
            }

            if self.find_sentence(link, &data, target.address).await? {
                info!("{}: protocol confirmed at {} baud", target.address, baud);
                return Ok(Some(baud));
            }

            debug!(
                "{}: ASCII at {} baud but no sentence in {} lines",
                target.address, baud, self.config.max_sentence_lines
            );
        }

        Ok(None)
    }

    /// Re-clock the channel and read one buffer
    ///
    /// Channels hand back whatever has arrived, so reads are accumulated
    /// until the buffer is full or `read_timeout` has passed. `Ok(None)`
    /// means nothing arrived at all.
    async fn read_at_rate(
        &self,
        link: &mut Box<dyn SerialLink>,
        baud: u32,
    ) -> io::Result<Option<Vec<u8>>> {
        link.set_baud_rate(baud)?;
        link.discard_input()?;

        let mut buf = vec![0u8; self.config.read_buffer_size];
        let mut filled = 0;
        let deadline = Instant::now() + self.config.read_timeout;

        while filled < buf.len() {
            match timeout_at(deadline, link.read(&mut buf[filled..])).await {
                Err(_) => break,
                Ok(Ok(0)) if filled == 0 => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "channel closed",
                    ))
                }
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => break,
                Ok(Err(e)) => return Err(e),
            }
        }

        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        trace!("Read at {} baud: {:02X?}", baud, buf);
        Ok(Some(buf))
    }

    /// Read lines until one has the sentence shape or the line budget is spent
    async fn find_sentence(
        &self,
        link: &mut Box<dyn SerialLink>,
        initial: &[u8],
        address: &str,
    ) -> Result<bool, DetectError> {
        let mut framer = LineFramer::with_max_line_len(self.config.max_line_len);
        framer.push_bytes(initial);

        let mut buf = vec![0u8; self.config.read_buffer_size];
        let mut lines = 0;

        while lines < self.config.max_sentence_lines {
            if let Some(line) = framer.next_line() {
                lines += 1;
                if is_sentence_shape(&line) {
                    match Sentence::parse(&line) {
                        Ok(sentence) => debug!(
                            "{}: {} sentence from talker {}",
                            address, sentence.kind, sentence.talker
                        ),
                        Err(e) => debug!("{}: sentence shape found ({})", address, e),
                    }
                    return Ok(true);
                }
                trace!("{}: not a sentence: {:?}", address, String::from_utf8_lossy(&line));
                continue;
            }

            match timeout(self.config.read_timeout, link.read(&mut buf)).await {
                Err(_) => {
                    return Err(DetectError::Timeout {
                        device: address.to_string(),
                    })
                }
                Ok(Ok(0)) => {
                    return Err(DetectError::TransportError {
                        device: address.to_string(),
                        reason: "channel closed".to_string(),
                    })
                }
                Ok(Ok(n)) => framer.push_bytes(&buf[..n]),
                Ok(Err(e)) => return Err(DetectError::from_io_error(address, &e)),
            }
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use proptest::prelude::*;
    use tokio::io::{AsyncRead, ReadBuf};

    const GGA: &[u8] = b"$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47\r\n";

    /// Streams `data` in a loop, at most `chunk` bytes per read
    struct ChunkedLink {
        data: &'static [u8],
        chunk: usize,
        cursor: usize,
    }

    impl AsyncRead for ChunkedLink {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let this = self.get_mut();
            let n = this
                .chunk
                .min(buf.remaining())
                .min(this.data.len() - this.cursor);
            buf.put_slice(&this.data[this.cursor..this.cursor + n]);
            this.cursor = (this.cursor + n) % this.data.len();
            Poll::Ready(Ok(()))
        }
    }

    impl SerialLink for ChunkedLink {
        fn set_baud_rate(&mut self, _baud_rate: u32) -> io::Result<()> {
            Ok(())
        }

        fn discard_input(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct NoReopen;

    impl LinkOpener for NoReopen {
        fn open(&self, address: &str, _baud_rate: u32) -> Result<Box<dyn SerialLink>, DetectError> {
            Err(DetectError::TransportUnavailable {
                device: address.to_string(),
                reason: "no reopen in tests".to_string(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_reads_are_accumulated() {
        let sniffer = ProtocolSniffer::new();
        let mut link: Box<dyn SerialLink> = Box::new(ChunkedLink {
            data: GGA,
            chunk: 4,
            cursor: 0,
        });
        let target = SniffTarget {
            address: "COM7",
            opener: &NoReopen,
        };

        assert_eq!(sniffer.sniff(&mut link, target, &[9_600]).await, Ok(Some(9_600)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_byte_reads_still_confirm() {
        let sniffer = ProtocolSniffer::new();
        let mut link: Box<dyn SerialLink> = Box::new(ChunkedLink {
            data: GGA,
            chunk: 1,
            cursor: 0,
        });
        let target = SniffTarget {
            address: "COM7",
            opener: &NoReopen,
        };

        assert_eq!(sniffer.sniff(&mut link, target, &[4_800]).await, Ok(Some(4_800)));
    }

    proptest! {
        #[test]
        fn prop_candidate_rates_put_history_first(
            last in proptest::option::of(prop_oneof![
                proptest::sample::select(DEFAULT_BAUD_RATES.to_vec()),
                300u32..1_000_000,
            ])
        ) {
            let rates = ProtocolSniffer::new().candidate_baud_rates(last);

            if let Some(last) = last {
                prop_assert_eq!(rates[0], last);
            }
            let unique: HashSet<_> = rates.iter().copied().collect();
            prop_assert_eq!(unique.len(), rates.len());
            for rate in DEFAULT_BAUD_RATES {
                prop_assert!(unique.contains(&rate));
            }
            let extra = usize::from(last.is_some_and(|l| !DEFAULT_BAUD_RATES.contains(&l)));
            prop_assert_eq!(rates.len(), DEFAULT_BAUD_RATES.len() + extra);
        }

        #[test]
        fn prop_defaults_keep_their_order(last in proptest::option::of(300u32..1_000_000)) {
            let rates = ProtocolSniffer::new().candidate_baud_rates(last);
            let defaults: Vec<_> = rates
                .iter()
                .copied()
                .filter(|r| DEFAULT_BAUD_RATES.contains(r) && Some(*r) != last)
                .collect();
            let expected: Vec<_> = DEFAULT_BAUD_RATES
                .iter()
                .copied()
                .filter(|r| Some(*r) != last)
                .collect();
            prop_assert_eq!(defaults, expected);
        }
    }

    #[test]
    fn test_sniffer_config_default() {
        let config = SnifferConfig::default();
        assert_eq!(config.read_timeout, Duration::from_secs(1));
        assert_eq!(config.baud_rates, vec![115_200, 57_600, 38_400, 19_200, 9_600, 4_800]);
        assert_eq!(config.min_ascii_run, 10);
        assert_eq!(config.max_sentence_lines, 10);
    }

    #[test]
    fn test_candidate_rates_without_history() {
        let sniffer = ProtocolSniffer::new();
        assert_eq!(sniffer.candidate_baud_rates(None), DEFAULT_BAUD_RATES.to_vec());
    }

    #[test]
    fn test_candidate_rates_last_success_first() {
        let sniffer = ProtocolSniffer::new();
        assert_eq!(
            sniffer.candidate_baud_rates(Some(9_600)),
            vec![9_600, 115_200, 57_600, 38_400, 19_200, 4_800]
        );
    }

    #[test]
    fn test_candidate_rates_nonstandard_history() {
        let sniffer = ProtocolSniffer::new();
        let rates = sniffer.candidate_baud_rates(Some(14_400));
        assert_eq!(rates.len(), 7);
        assert_eq!(rates[0], 14_400);
    }
}
