/*!
 * Unit Messages
 * Everything a unit says to the outside world travels over its outbound channel
 */

use crate::security::traits::ViolationSink;
use crate::security::types::Violation;
use std::cell::Cell;

/// Marker appended once output reaches its cap
pub const TRUNCATION_MARKER: &str = "[output truncated]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitMessage {
    Stdout(String),
    Stderr(String),
    Violation(Violation),
}

/// Violation sink that forwards onto the unit's outbound channel
pub struct ChannelSink {
    tx: flume::Sender<UnitMessage>,
}

impl ChannelSink {
    pub fn new(tx: flume::Sender<UnitMessage>) -> Self {
        Self { tx }
    }
}

impl ViolationSink for ChannelSink {
    fn record(&self, violation: Violation) {
        // The receiver outlives the unit; a send only fails during teardown
        let _ = self.tx.send(UnitMessage::Violation(violation));
    }
}

/// Capped stdout/stderr writer
pub struct OutputSink {
    tx: flume::Sender<UnitMessage>,
    remaining: Cell<usize>,
    truncated: Cell<bool>,
}

impl OutputSink {
    pub fn new(tx: flume::Sender<UnitMessage>, max_bytes: usize) -> Self {
        Self {
            tx,
            remaining: Cell::new(max_bytes),
            truncated: Cell::new(false),
        }
    }

    pub fn stdout(&self, line: String) {
        self.write(line, UnitMessage::Stdout);
    }

    pub fn stderr(&self, line: String) {
        self.write(line, UnitMessage::Stderr);
    }

    #[inline]
    pub fn is_truncated(&self) -> bool {
        self.truncated.get()
    }

    fn write(&self, mut line: String, wrap: fn(String) -> UnitMessage) {
        if self.truncated.get() {
            return;
        }
        let remaining = self.remaining.get();
        if line.len() > remaining {
            let mut cut = remaining;
            while !line.is_char_boundary(cut) {
                cut -= 1;
            }
            line.truncate(cut);
            self.truncated.set(true);
            self.remaining.set(0);
            if !line.is_empty() {
                let _ = self.tx.send(wrap(line));
            }
            let _ = self.tx.send(UnitMessage::Stderr(TRUNCATION_MARKER.to_string()));
            return;
        }
        self.remaining.set(remaining - line.len());
        let _ = self.tx.send(wrap(line));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::types::{Severity, ViolationKind, ViolationSource};

    #[test]
    fn test_channel_sink_forwards() {
        let (tx, rx) = flume::unbounded();
        let sink = ChannelSink::new(tx);
        sink.record(Violation::new(
            ViolationKind::CapabilityDenied,
            Severity::High,
            ViolationSource::CapabilityGate,
            "denied",
        ));
        assert!(matches!(rx.try_recv(), Ok(UnitMessage::Violation(_))));
    }

    #[test]
    fn test_output_is_capped_once() {
        let (tx, rx) = flume::unbounded();
        let sink = OutputSink::new(tx, 8);
        sink.stdout("hello".into());
        sink.stdout("world".into());
        sink.stdout("again".into());
        let messages: Vec<UnitMessage> = rx.drain().collect();
        assert_eq!(
            messages,
            vec![
                UnitMessage::Stdout("hello".into()),
                UnitMessage::Stdout("wor".into()),
                UnitMessage::Stderr(TRUNCATION_MARKER.into()),
            ]
        );
        assert!(sink.is_truncated());
    }
}
