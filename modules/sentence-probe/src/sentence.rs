//! Framing and checksum for `$TTFFF,field,...*HH` sentences.

use gpslink_core::Capabilities;
use thiserror::Error;

/// Longest line considered before it is discarded as noise.
pub const MAX_LINE: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SentenceError {
    #[error("missing '$' or '!' start")]
    MissingStart,
    #[error("missing '*' checksum delimiter")]
    MissingChecksum,
    #[error("malformed checksum {0:?}")]
    MalformedChecksum(String),
    #[error("checksum mismatch: computed {computed:02X}, sentence says {stated:02X}")]
    BadChecksum { computed: u8, stated: u8 },
    #[error("address field too short")]
    ShortAddress,
    #[error("non-printable data")]
    NotPrintable,
}

/// A checksummed sentence. `talker` is empty for proprietary (`P...`) sentences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence<'a> {
    pub talker: &'a str,
    pub formatter: &'a str,
    pub fields: Vec<&'a str>,
}

/// XOR of every byte between the start marker and `*`.
pub fn checksum(body: &[u8]) -> u8 {
    body.iter().fold(0, |acc, b| acc ^ b)
}

pub fn parse(line: &str) -> Result<Sentence<'_>, SentenceError> {
    let line = line.trim();
    if !line.bytes().all(|b| (0x20..0x7F).contains(&b)) {
        return Err(SentenceError::NotPrintable);
    }
    let body = line.strip_prefix('$').or_else(|| line.strip_prefix('!')).ok_or(SentenceError::MissingStart)?;
    let (body, stated) = body.rsplit_once('*').ok_or(SentenceError::MissingChecksum)?;
    if stated.len() != 2 {
        return Err(SentenceError::MalformedChecksum(stated.into()));
    }
    let stated = u8::from_str_radix(stated, 16).map_err(|_| SentenceError::MalformedChecksum(stated.into()))?;
    let computed = checksum(body.as_bytes());
    if computed != stated {
        return Err(SentenceError::BadChecksum { computed, stated });
    }

    let mut parts = body.split(',');
    let address = parts.next().unwrap_or_default();
    let (talker, formatter) = if address.starts_with('P') && address.len() >= 2 {
        ("", address)
    } else if address.len() >= 5 {
        address.split_at(2)
    } else {
        return Err(SentenceError::ShortAddress);
    };
    Ok(Sentence { talker, formatter, fields: parts.collect() })
}

impl Sentence<'_> {
    fn has(&self, idx: usize) -> bool {
        self.fields.get(idx).is_some_and(|f| !f.is_empty())
    }

    /// Which kinds of data this sentence carries.
    pub fn capabilities(&self) -> Capabilities {
        let mut c = Capabilities::default();
        match self.formatter {
            "GGA" => {
                c.position = self.has(1);
                c.altitude = self.has(8);
                c.satellites = self.has(6);
                c.precision = self.has(7);
            }
            "GNS" => {
                c.position = self.has(1);
                c.altitude = self.has(8);
                c.satellites = self.has(6);
            }
            "RMC" => {
                c.position = self.has(2);
                c.speed = self.has(6);
                c.bearing = self.has(7);
            }
            "GLL" => c.position = self.has(0),
            "VTG" => {
                c.bearing = self.has(0);
                c.speed = self.has(4) || self.has(6);
            }
            "GSA" => {
                c.precision = self.has(14);
                c.satellites = true;
            }
            "GSV" => c.satellites = true,
            "GST" => c.precision = true,
            "HDT" | "HDG" | "HDM" => c.bearing = self.has(0),
            _ => {}
        }
        c
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reference_sentences() {
        let gga = parse("$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47").unwrap();
        assert_eq!((gga.talker, gga.formatter), ("GP", "GGA"));
        assert_eq!(gga.fields[1], "4807.038");
        let c = gga.capabilities();
        assert!(c.position && c.altitude && c.satellites && c.precision);
        assert!(!c.speed);

        let rmc = parse("$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A\r\n").unwrap();
        let c = rmc.capabilities();
        assert!(c.position && c.speed && c.bearing);
    }

    #[test]
    fn rejects_damaged_lines() {
        assert_eq!(parse("GPGGA,1*00"), Err(SentenceError::MissingStart));
        assert_eq!(parse("$GPGGA,123519"), Err(SentenceError::MissingChecksum));
        assert!(matches!(
            parse("$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*48"),
            Err(SentenceError::BadChecksum { stated: 0x48, .. })
        ));
        assert!(matches!(parse("$GPGGA*zz"), Err(SentenceError::MalformedChecksum(_))));
        assert_eq!(parse("$G\u{1}*01"), Err(SentenceError::NotPrintable));
    }

    #[test]
    fn empty_fix_fields_carry_nothing() {
        let body = "GPGGA,,,,,,0,,,,,,,,";
        let line = format!("${body}*{:02X}", checksum(body.as_bytes()));
        let c = parse(&line).unwrap().capabilities();
        assert!(!c.position && !c.altitude);
    }
}
