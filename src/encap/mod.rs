//! Encapsulation for lossy, connectionless transports.
//!
//! Notifications are batched into [`Envelope`]s carrying the originator
//! path and a sequence number. Receivers feed sequence numbers to a
//! [`GapDetector`] to learn about lost batches; what to do about a gap
//! (resync, alert, ignore) is up to the consumer.

mod envelope;
mod sequencer;

pub use envelope::{Envelope, EnvelopeReader, EnvelopeWriter};
pub use sequencer::{Gap, GapDetector, Sequencer};
