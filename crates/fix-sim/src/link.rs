//! Simulated byte channels
//!
//! A [`SimulatedLink`] behaves like a serial port with a device attached: at
//! the device's native rate it streams valid sentences, at any other rate it
//! yields the garbage a UART produces when clocked wrong.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use fix_detect::SerialLink;
use fix_protocol::Sentence;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::trace;

/// Bytes a UART typically produces when the line rate is wrong
pub const NOISE: [u8; 6] = [0xFF, 0xE0, 0x3C, 0x80, 0x1C, 0xF8];

/// What sits behind a simulated address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimBehavior {
    /// Receiver streaming sentences at `native_baud`
    Gps { native_baud: u32 },
    /// Receiver whose reads return at most `chunk` bytes, like a slow UART
    Trickle { native_baud: u32, chunk: usize },
    /// Printable text that never has the sentence shape (a modem, a console)
    AsciiChatter,
    /// Binary noise at every rate
    Noise,
    /// Opens fine, never sends anything
    Silent,
    /// Sends the start of a sentence at `native_baud`, then goes quiet
    Stalls { native_baud: u32 },
    /// Opening fails; `permission_denied` selects the pairing-rejection flavor
    OpenFails { permission_denied: bool },
    /// Opens fine, every read fails
    ReadFails,
}

/// One I/O operation observed on the simulated bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoEvent {
    /// A channel was opened
    Open { address: String, baud_rate: u32 },
    /// Opening a channel failed
    OpenFailed { address: String, baud_rate: u32 },
    /// The channel was re-clocked
    SetBaud { address: String, baud_rate: u32 },
    /// Buffered input was discarded
    Discard { address: String },
    /// A read returned data
    Read { address: String, bytes: usize },
    /// The channel was dropped
    Closed { address: String },
}

impl IoEvent {
    /// Address the event happened on
    pub fn address(&self) -> &str {
        match self {
            Self::Open { address, .. }
            | Self::OpenFailed { address, .. }
            | Self::SetBaud { address, .. }
            | Self::Discard { address }
            | Self::Read { address, .. }
            | Self::Closed { address } => address,
        }
    }
}

/// Shared I/O log
pub type Journal = Arc<Mutex<Vec<IoEvent>>>;

fn log(journal: &Journal, event: IoEvent) {
    trace!("sim: {:?}", event);
    journal
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(event);
}

/// The sentence cycle a simulated receiver transmits
pub fn sentence_stream() -> Vec<u8> {
    fn fields(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    [
        Sentence::new(
            "GP",
            "GGA",
            fields(&[
                "123519", "4807.038", "N", "01131.000", "E", "1", "08", "0.9", "545.4", "M",
                "46.9", "M", "", "",
            ]),
        ),
        Sentence::new(
            "GP",
            "RMC",
            fields(&[
                "123519", "A", "4807.038", "N", "01131.000", "E", "022.4", "084.4", "230394",
                "003.1", "W",
            ]),
        ),
        Sentence::new(
            "GP",
            "GSA",
            fields(&[
                "A", "3", "04", "05", "", "09", "12", "", "", "24", "", "", "", "", "2.5", "1.3",
                "2.1",
            ]),
        ),
    ]
    .iter()
    .flat_map(|s| s.to_line().into_bytes())
    .collect()
}

/// An open simulated channel
pub struct SimulatedLink {
    address: String,
    behavior: SimBehavior,
    baud_rate: u32,
    stream: Vec<u8>,
    cursor: usize,
    stalled: bool,
    journal: Journal,
}

impl SimulatedLink {
    pub(crate) fn new(
        address: String,
        behavior: SimBehavior,
        baud_rate: u32,
        journal: Journal,
    ) -> Self {
        let stream = match behavior {
            SimBehavior::AsciiChatter => b"AT+CGMI\r\nOK\r\nready> \r\n".to_vec(),
            _ => sentence_stream(),
        };
        Self {
            address,
            behavior,
            baud_rate,
            stream,
            cursor: 0,
            stalled: false,
            journal,
        }
    }

    /// Current channel speed
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Next bytes the device would put on the wire, or `None` if it is quiet
    fn next_chunk(&mut self, max: usize) -> io::Result<Option<Vec<u8>>> {
        match self.behavior {
            SimBehavior::Gps { native_baud } if native_baud == self.baud_rate => {
                Ok(Some(self.cycle(max)))
            }
            SimBehavior::Trickle { native_baud, chunk } if native_baud == self.baud_rate => {
                Ok(Some(self.cycle(max.min(chunk.max(1)))))
            }
            SimBehavior::Trickle { chunk, .. } => Ok(Some(
                NOISE.iter().copied().cycle().take(max.min(chunk.max(1))).collect(),
            )),
            SimBehavior::AsciiChatter => Ok(Some(self.cycle(max))),
            SimBehavior::Stalls { native_baud } if native_baud == self.baud_rate => {
                if self.stalled {
                    return Ok(None);
                }
                self.stalled = true;
                let partial = b"$GPGGA,123519,4807.038,N";
                Ok(Some(partial[..partial.len().min(max)].to_vec()))
            }
            SimBehavior::Gps { .. } | SimBehavior::Noise | SimBehavior::Stalls { .. } => {
                Ok(Some(NOISE.iter().copied().cycle().take(max).collect()))
            }
            SimBehavior::Silent | SimBehavior::OpenFails { .. } => Ok(None),
            SimBehavior::ReadFails => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "device disconnected",
            )),
        }
    }

    fn cycle(&mut self, max: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(max);
        while out.len() < max {
            let end = (self.cursor + (max - out.len())).min(self.stream.len());
            out.extend_from_slice(&self.stream[self.cursor..end]);
            self.cursor = end % self.stream.len();
        }
        out
    }
}

impl AsyncRead for SimulatedLink {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let max = buf.remaining();
        if max == 0 {
            return Poll::Ready(Ok(()));
        }

        // Quiet channels never wake; callers bound reads with a timeout.
        match this.next_chunk(max) {
            Ok(Some(chunk)) => {
                buf.put_slice(&chunk);
                log(
                    &this.journal,
                    IoEvent::Read {
                        address: this.address.clone(),
                        bytes: chunk.len(),
                    },
                );
                Poll::Ready(Ok(()))
            }
            Ok(None) => Poll::Pending,
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl SerialLink for SimulatedLink {
    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()> {
        self.baud_rate = baud_rate;
        log(
            &self.journal,
            IoEvent::SetBaud {
                address: self.address.clone(),
                baud_rate,
            },
        );
        Ok(())
    }

    fn discard_input(&mut self) -> io::Result<()> {
        log(
            &self.journal,
            IoEvent::Discard {
                address: self.address.clone(),
            },
        );
        Ok(())
    }
}

impl Drop for SimulatedLink {
    fn drop(&mut self) {
        log(
            &self.journal,
            IoEvent::Closed {
                address: self.address.clone(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fix_protocol::{has_ascii_run, LineFramer};
    use tokio::io::AsyncReadExt;

    fn link(behavior: SimBehavior, baud_rate: u32) -> (SimulatedLink, Journal) {
        let journal = Journal::default();
        let link = SimulatedLink::new("COM1".into(), behavior, baud_rate, journal.clone());
        (link, journal)
    }

    #[test]
    fn test_sentence_stream_parses() {
        let mut framer = LineFramer::new();
        framer.push_bytes(&sentence_stream());
        let mut count = 0;
        while let Some(line) = framer.next_line() {
            Sentence::parse(&line).unwrap();
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_native_rate_streams_sentences() {
        let (mut link, _) = link(SimBehavior::Gps { native_baud: 9_600 }, 9_600);
        let mut buf = [0u8; 200];
        let n = link.read(&mut buf).await.unwrap();
        assert_eq!(n, 200);
        assert!(buf.starts_with(b"$GPGGA,"));
        assert!(has_ascii_run(&buf, 10));
    }

    #[tokio::test]
    async fn test_wrong_rate_is_noise() {
        let (mut link, _) = link(SimBehavior::Gps { native_baud: 9_600 }, 115_200);
        let mut buf = [0u8; 64];
        link.read(&mut buf).await.unwrap();
        assert!(!has_ascii_run(&buf, 10));

        link.set_baud_rate(9_600).unwrap();
        link.read(&mut buf).await.unwrap();
        assert!(has_ascii_run(&buf, 10));
    }

    #[tokio::test]
    async fn test_trickle_returns_short_reads() {
        let (mut link, _) = link(
            SimBehavior::Trickle {
                native_baud: 4_800,
                chunk: 4,
            },
            4_800,
        );
        let mut buf = [0u8; 64];
        assert_eq!(link.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf[..4], b"$GPG");
        assert_eq!(link.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf[..4], b"GA,1");
    }

    #[tokio::test]
    async fn test_read_fails() {
        let (mut link, _) = link(SimBehavior::ReadFails, 4_800);
        let mut buf = [0u8; 16];
        assert!(link.read(&mut buf).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_sends_once() {
        let (mut link, _) = link(SimBehavior::Stalls { native_baud: 4_800 }, 4_800);
        let mut buf = [0u8; 64];
        let n = link.read(&mut buf).await.unwrap();
        assert!(n > 10);

        let second = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            link.read(&mut buf),
        )
        .await;
        assert!(second.is_err());
    }

    #[test]
    fn test_drop_records_close() {
        let (link, journal) = link(SimBehavior::Silent, 4_800);
        drop(link);
        assert_eq!(
            journal.lock().unwrap().last(),
            Some(&IoEvent::Closed {
                address: "COM1".into()
            })
        );
    }
}
