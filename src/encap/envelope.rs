//! Envelope framing for connectionless transports.
//!
//! Layout (little endian):
//!
//! ```text
//! magic "TSE\0" | version u8 | body_len u32 | body (msgpack) | crc32(body) u32
//! ```

use super::sequencer::{Gap, GapDetector, Sequencer};
use crate::error::{Result, StoreError};
use crate::notification::Notification;
use crate::types::{Path, Timestamp};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Magic bytes for an envelope.
const ENVELOPE_MAGIC: &[u8; 4] = b"TSE\0";

/// Current envelope format version.
const ENVELOPE_VERSION: u8 = 1;

/// Fixed bytes around the body.
const HEADER_LEN: usize = 4 + 1 + 4;
const TRAILER_LEN: usize = 4;

/// A batch of notifications for one datagram.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub originator: Path,
    /// Transmit time, when the sender stamps one.
    pub timestamp: Option<Timestamp>,
    pub sequence: u64,
    pub notifications: Vec<Notification>,
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = rmp_serde::to_vec_named(self)?;
        let body_len = u32::try_from(body.len()).map_err(|_| {
            StoreError::InvalidArgument(format!("envelope body of {} bytes is too large", body.len()))
        })?;

        let mut out = Vec::with_capacity(HEADER_LEN + body.len() + TRAILER_LEN);
        out.extend_from_slice(ENVELOPE_MAGIC);
        out.push(ENVELOPE_VERSION);
        out.extend_from_slice(&body_len.to_le_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN + TRAILER_LEN {
            return Err(StoreError::InvalidFormat(format!(
                "envelope too short: {} bytes",
                bytes.len()
            )));
        }
        if &bytes[..4] != ENVELOPE_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid envelope magic".into()));
        }
        if bytes[4] != ENVELOPE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported envelope version: {}",
                bytes[4]
            )));
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[5..HEADER_LEN]);
        let body_len = u32::from_le_bytes(len_bytes) as usize;
        if bytes.len() != HEADER_LEN + body_len + TRAILER_LEN {
            return Err(StoreError::InvalidFormat(format!(
                "envelope length mismatch: header says {} body bytes, frame has {}",
                body_len,
                bytes.len().saturating_sub(HEADER_LEN + TRAILER_LEN)
            )));
        }

        let body = &bytes[HEADER_LEN..HEADER_LEN + body_len];
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&bytes[HEADER_LEN + body_len..]);
        let stored_checksum = u32::from_le_bytes(crc_bytes);
        let computed_checksum = crc32fast::hash(body);
        if stored_checksum != computed_checksum {
            return Err(StoreError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        Ok(rmp_serde::from_slice(body)?)
    }
}

/// Seals notification batches into numbered envelopes.
#[derive(Debug)]
pub struct EnvelopeWriter {
    originator: Path,
    sequencer: Sequencer,
}

impl EnvelopeWriter {
    pub fn new(originator: Path) -> Self {
        Self {
            originator,
            sequencer: Sequencer::new(),
        }
    }

    /// Wrap `notifications` in the next envelope.
    pub fn seal(&self, timestamp: Option<Timestamp>, notifications: Vec<Notification>) -> Envelope {
        Envelope {
            originator: self.originator.clone(),
            timestamp,
            sequence: self.sequencer.next(),
            notifications,
        }
    }

    /// Seal and encode in one step.
    pub fn encode(&self, timestamp: Option<Timestamp>, notifications: Vec<Notification>) -> Result<Vec<u8>> {
        self.seal(timestamp, notifications).encode()
    }
}

/// Decodes envelopes and tracks sequence continuity.
#[derive(Debug, Default)]
pub struct EnvelopeReader {
    detector: GapDetector,
}

impl EnvelopeReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one frame. A gap is reported alongside the envelope; it is
    /// never an error.
    pub fn read(&mut self, bytes: &[u8]) -> Result<(Envelope, Option<Gap>)> {
        let envelope = Envelope::decode(bytes)?;
        let gap = self.detector.observe(envelope.sequence);
        if let Some(gap) = gap {
            warn!(
                originator = %envelope.originator,
                last = gap.last,
                observed = gap.observed,
                "envelope sequence gap"
            );
        }
        Ok((envelope, gap))
    }

    pub fn gaps(&self) -> u64 {
        self.detector.gaps()
    }
}
