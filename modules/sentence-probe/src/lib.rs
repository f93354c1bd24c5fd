//! Recognizes checksummed `$`-sentence streams on an open channel.

mod sentence;

use std::io;

use async_trait::async_trait;
use gpslink_core::{Channel, ProtocolValidator, TestReport};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

pub use sentence::{checksum, parse, Sentence, SentenceError, MAX_LINE};

pub const DEFAULT_MIN_VALID: usize = 2;
pub const DEFAULT_MAX_LINES: usize = 40;

enum Next {
    Line(String),
    Eof,
    Deadline,
    Failed(io::Error),
}

/// Splits a channel's byte stream into lines, bounded by a deadline.
struct LineReader<'a> {
    channel: &'a mut Channel,
    pending: Vec<u8>,
    eof: bool,
}

impl<'a> LineReader<'a> {
    fn new(channel: &'a mut Channel) -> Self {
        Self { channel, pending: Vec::new(), eof: false }
    }

    async fn next_line(&mut self, deadline: Instant) -> Next {
        loop {
            if let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = self.pending.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw).trim().to_string();
                if line.is_empty() {
                    continue;
                }
                return Next::Line(line);
            }
            if self.pending.len() > MAX_LINE || (self.eof && !self.pending.is_empty()) {
                let junk = String::from_utf8_lossy(&self.pending).trim().to_string();
                self.pending.clear();
                return Next::Line(junk);
            }
            if self.eof {
                return Next::Eof;
            }
            let mut chunk = [0u8; 256];
            match timeout_at(deadline, self.channel.read(&mut chunk)).await {
                Err(_) => return Next::Deadline,
                Ok(Ok(0)) => self.eof = true,
                Ok(Ok(n)) => self.pending.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Next::Failed(e),
            }
        }
    }
}

/// A stream is valid once `min_valid` sentences with good checksums arrive
/// within the first `max_lines` lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentenceValidator {
    pub min_valid: usize,
    pub max_lines: usize,
}

impl Default for SentenceValidator {
    fn default() -> Self {
        Self { min_valid: DEFAULT_MIN_VALID, max_lines: DEFAULT_MAX_LINES }
    }
}

#[async_trait]
impl ProtocolValidator for SentenceValidator {
    async fn is_valid(&self, channel: &mut Channel, deadline: Instant) -> bool {
        let mut reader = LineReader::new(channel);
        let mut valid = 0;
        for _ in 0..self.max_lines {
            match reader.next_line(deadline).await {
                Next::Line(line) => match parse(&line) {
                    Ok(_) => {
                        valid += 1;
                        if valid >= self.min_valid.max(1) {
                            return true;
                        }
                    }
                    Err(e) => trace!(error = %e, %line, "not a sentence"),
                },
                Next::Eof => {
                    debug!(valid, "stream ended before validating");
                    return false;
                }
                Next::Deadline => {
                    debug!(valid, "validation deadline reached");
                    return false;
                }
                Next::Failed(e) => {
                    debug!(valid, error = %e, "read failed during validation");
                    return false;
                }
            }
        }
        false
    }

    async fn inspect(&self, channel: &mut Channel, max_units: usize, deadline: Instant) -> TestReport {
        let mut reader = LineReader::new(channel);
        let mut report = TestReport::default();
        while report.units_read < max_units {
            match reader.next_line(deadline).await {
                Next::Line(line) => {
                    report.units_read += 1;
                    match parse(&line) {
                        Ok(sentence) => {
                            report.valid_units += 1;
                            report.capabilities.merge(sentence.capabilities());
                            report.log.push(line);
                        }
                        Err(e) => report.log.push(format!("invalid ({e}): {line}")),
                    }
                }
                Next::Eof => {
                    report.log.push("end of stream".into());
                    break;
                }
                Next::Deadline => {
                    report.log.push("deadline reached".into());
                    break;
                }
                Next::Failed(e) => {
                    report.log.push(format!("read error: {e}"));
                    break;
                }
            }
        }
        report
    }
}
