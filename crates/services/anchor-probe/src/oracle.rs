use crate::error::Result;
use crate::expression::Expression;
use crate::transport::{Frame, FrameStatus, LineTransport};
use crate::types::ProbeResult;
use std::time::Duration;
use tracing::{debug, warn};

/// Default phrase the service prints when the shared variable divides by zero.
pub const DEFAULT_ERROR_PHRASE: &str = "stop breaking things >:(";

/// The single predicate that recognises the distinguishing error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorSignal {
    phrase: String,
}

impl Default for ErrorSignal {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_PHRASE)
    }
}

impl ErrorSignal {
    pub fn new(phrase: impl Into<String>) -> Self {
        Self {
            phrase: phrase.into(),
        }
    }

    pub fn phrase(&self) -> &str {
        &self.phrase
    }

    pub fn matches(&self, text: &str) -> bool {
        !self.phrase.is_empty() && text.contains(&self.phrase)
    }

    /// Classify a frame.
    ///
    /// An observed phrase is a match even in a degraded frame: the service
    /// only prints it after evaluating the division.
    pub fn classify(&self, frame: &Frame) -> ProbeResult {
        if self.matches(&frame.text) {
            ProbeResult::ErrorSignal
        } else if frame.status != FrameStatus::Complete {
            ProbeResult::Ambiguous
        } else {
            ProbeResult::Normal
        }
    }
}

/// Sends one expression per call over an exclusively owned transport.
pub struct Oracle<T> {
    transport: T,
    signal: ErrorSignal,
    read_timeout: Duration,
    round_trips: u64,
}

impl<T: LineTransport> Oracle<T> {
    pub fn new(transport: T, signal: ErrorSignal, read_timeout: Duration) -> Self {
        Self {
            transport,
            signal,
            read_timeout,
            round_trips: 0,
        }
    }

    /// Send `expression` and read the framed response.
    pub async fn evaluate(&mut self, expression: &Expression) -> Result<Frame> {
        self.transport.send_line(expression.as_str()).await?;
        self.round_trips += 1;
        let frame = self.transport.read_until_marker(self.read_timeout).await?;
        match frame.status {
            FrameStatus::Complete => {}
            FrameStatus::TimedOut => warn!(
                "No prompt within {:?} after {:?}",
                self.read_timeout,
                expression.as_str()
            ),
            FrameStatus::Eof => warn!("Stream ended before prompt after {:?}", expression.as_str()),
        }
        Ok(frame)
    }

    /// Evaluate and classify in one round trip.
    pub async fn query(&mut self, expression: &Expression) -> Result<ProbeResult> {
        let frame = self.evaluate(expression).await?;
        let result = self.signal.classify(&frame);
        debug!("{} -> {:?}", expression, result);
        Ok(result)
    }

    pub fn classify(&self, frame: &Frame) -> ProbeResult {
        self.signal.classify(frame)
    }

    /// Read the banner the service prints before its first prompt.
    pub async fn read_banner(&mut self, wait: Duration) -> Result<Frame> {
        self.transport.read_until_marker(wait).await
    }

    pub fn round_trips(&self) -> u64 {
        self.round_trips
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub async fn close(&mut self) -> Result<()> {
        self.transport.close().await
    }

    pub fn into_transport(self) -> T {
        self.transport
    }
}
