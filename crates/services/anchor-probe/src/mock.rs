//! In-memory interpreter for driving the probe without a network.
//!
//! Mirrors the remote service: every successful evaluation is stored in the
//! shared variable, position `n` reads the `n`th secret byte, and dividing by
//! a zero shared variable prints the error phrase without touching state.

use crate::error::{ProbeError, Result};
use crate::oracle::DEFAULT_ERROR_PHRASE;
use crate::transport::{Frame, FrameStatus, LineTransport};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Fault injected on a given (1-based) send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFault {
    /// The line is evaluated but its response misses the read deadline.
    /// Like any [`LineTransport`], the late response is then dropped.
    Timeout,
    /// The line is evaluated and the stream then ends.
    Eof,
    /// Writing the line fails with a broken pipe.
    BrokenPipe,
}

pub struct MockInterpreter {
    secret: Vec<u8>,
    shared_name: String,
    position_name: String,
    error_phrase: String,
    shared: i64,
    sent: Vec<String>,
    history: Vec<i64>,
    pending: VecDeque<Frame>,
    faults: HashMap<usize, MockFault>,
    close_calls: usize,
    closed: bool,
}

impl MockInterpreter {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            shared_name: "a".into(),
            position_name: "b".into(),
            error_phrase: DEFAULT_ERROR_PHRASE.into(),
            shared: 0,
            sent: Vec::new(),
            history: Vec::new(),
            pending: VecDeque::new(),
            faults: HashMap::new(),
            close_calls: 0,
            closed: false,
        }
    }

    /// Queue an introductory banner ahead of the first response.
    pub fn with_banner(mut self, banner: &str) -> Self {
        self.pending.push_back(Frame::complete(banner));
        self
    }

    pub fn with_error_phrase(mut self, phrase: &str) -> Self {
        self.error_phrase = phrase.into();
        self
    }

    pub fn with_fault(mut self, send_index: usize, fault: MockFault) -> Self {
        self.faults.insert(send_index, fault);
        self
    }

    pub fn shared_value(&self) -> i64 {
        self.shared
    }

    /// Every line received, in order.
    pub fn sent(&self) -> &[String] {
        &self.sent
    }

    /// Shared variable value after each received line.
    pub fn history(&self) -> &[i64] {
        &self.history
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn operand(&self, token: &str) -> Option<i64> {
        if token == self.shared_name {
            return Some(self.shared);
        }
        let unit = self.position_name.as_str();
        if token.is_empty() || token.len() % unit.len() != 0 {
            return None;
        }
        if token.as_bytes().chunks(unit.len()).any(|c| c != unit.as_bytes()) {
            return None;
        }
        let position = token.len() / unit.len();
        self.secret.get(position - 1).map(|b| i64::from(*b))
    }

    fn evaluate(&mut self, line: &str) -> String {
        if line.chars().any(char::is_whitespace) {
            return "no spaces allowed".into();
        }

        let value = if let Some((lhs, rhs)) = line.split_once('-') {
            match (self.operand(lhs), self.operand(rhs)) {
                (Some(l), Some(r)) => Ok(l - r),
                _ => Err(format!("NameError: {line}")),
            }
        } else if let Some((lhs, rhs)) = line.split_once('/') {
            match (self.operand(lhs), self.operand(rhs)) {
                (Some(_), Some(0)) => Err(self.error_phrase.clone()),
                (Some(l), Some(r)) => Ok(l / r),
                _ => Err(format!("NameError: {line}")),
            }
        } else {
            self.operand(line)
                .ok_or_else(|| format!("NameError: {line}"))
        };

        match value {
            Ok(v) => {
                self.shared = v;
                format!("{v}\n")
            }
            Err(message) => format!("{message}\n"),
        }
    }
}

#[async_trait]
impl LineTransport for MockInterpreter {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        if self.closed {
            return Err(ProbeError::transport(
                "using a closed session",
                std::io::Error::from(std::io::ErrorKind::NotConnected),
            ));
        }

        let index = self.sent.len() + 1;
        let fault = self.faults.get(&index).copied();
        if fault == Some(MockFault::BrokenPipe) {
            return Err(ProbeError::transport(
                format!("sending {line:?}"),
                std::io::Error::from(std::io::ErrorKind::BrokenPipe),
            ));
        }

        self.sent.push(line.to_string());
        let text = self.evaluate(line);
        self.history.push(self.shared);

        let frame = match fault {
            Some(MockFault::Timeout) => Frame {
                text: String::new(),
                status: FrameStatus::TimedOut,
            },
            Some(MockFault::Eof) => Frame {
                text,
                status: FrameStatus::Eof,
            },
            _ => Frame::complete(text),
        };
        self.pending.push_back(frame);
        Ok(())
    }

    async fn read_until_marker(&mut self, _timeout: Duration) -> Result<Frame> {
        Ok(self.pending.pop_front().unwrap_or(Frame {
            text: String::new(),
            status: FrameStatus::TimedOut,
        }))
    }

    async fn close(&mut self) -> Result<()> {
        self.close_calls += 1;
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(mock: &mut MockInterpreter, line: &str) -> Frame {
        mock.send_line(line).await.unwrap();
        mock.read_until_marker(Duration::ZERO).await.unwrap()
    }

    #[tokio::test]
    async fn test_interpreter_semantics() {
        let mut mock = MockInterpreter::new("infobahn{");

        assert_eq!(roundtrip(&mut mock, "bb").await.text, "110\n");
        assert_eq!(mock.shared_value(), i64::from(b'n'));

        roundtrip(&mut mock, "a-bbbbbbbb").await;
        assert_eq!(mock.shared_value(), 0);

        let frame = roundtrip(&mut mock, "bb/a").await;
        assert!(frame.text.contains(DEFAULT_ERROR_PHRASE));
        assert_eq!(mock.shared_value(), 0);

        assert_eq!(roundtrip(&mut mock, "a - b").await.text, "no spaces allowed\n");
        assert!(roundtrip(&mut mock, "bbbbbbbbbbbbbbb").await.text.starts_with("NameError"));
    }

    #[tokio::test]
    async fn test_faults() {
        let mut mock = MockInterpreter::new("ab")
            .with_fault(1, MockFault::Timeout)
            .with_fault(2, MockFault::BrokenPipe);

        let frame = roundtrip(&mut mock, "b").await;
        assert_eq!(frame.status, FrameStatus::TimedOut);
        // Evaluated even though the response was lost
        assert_eq!(mock.shared_value(), i64::from(b'a'));

        assert!(mock.send_line("bb").await.is_err());
        assert_eq!(mock.sent().len(), 1);
    }
}
