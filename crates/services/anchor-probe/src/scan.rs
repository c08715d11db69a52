//! Linear index scan for services that answer an index with the character at
//! that index, e.g. `Character at Index 3: f`, until `Index out of range!`.

use crate::error::Result;
use crate::transport::{FrameStatus, LineTransport};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Scan responses end at a newline unless a prompt is configured.
pub const LINE_FRAME: &str = "\n";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// Prompt marker for the scan service; [`LINE_FRAME`] when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Substring identifying a line that carries a character.
    pub character_marker: String,
    /// Substring signalling the end of the secret.
    pub end_marker: String,
    /// First index queried.
    pub start: usize,
    /// Upper bound on queries.
    pub limit: usize,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            prompt: None,
            character_marker: "Character at Index".into(),
            end_marker: "Index out of range!".into(),
            start: 0,
            limit: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOutcome {
    pub secret: String,
    pub queries: usize,
    /// The end marker was seen; otherwise the scan stopped early.
    pub finished: bool,
}

pub struct IndexScan {
    settings: ScanSettings,
    read_timeout: Duration,
}

impl IndexScan {
    pub fn new(settings: ScanSettings, read_timeout: Duration) -> Self {
        Self {
            settings,
            read_timeout,
        }
    }

    /// Character carried by a response, if any.
    pub fn extract(&self, text: &str) -> Option<char> {
        text.lines()
            .find(|line| line.contains(&self.settings.character_marker))
            .and_then(|line| line.trim_end_matches('\r').chars().last())
    }

    /// Query indices in order, starting with the response to the banner.
    pub async fn run<T: LineTransport>(&self, transport: &mut T) -> Result<ScanOutcome> {
        let mut secret = String::new();
        let mut queries = 0;
        let mut index = self.settings.start;
        let mut frame = transport.read_until_marker(self.read_timeout).await?;

        loop {
            if frame.text.contains(&self.settings.end_marker) {
                info!("Index {} is out of range; scan complete", index.saturating_sub(1));
                return Ok(ScanOutcome {
                    secret,
                    queries,
                    finished: true,
                });
            }
            if let Some(c) = self.extract(&frame.text) {
                debug!("Index {} -> {:?}", index.saturating_sub(1), c);
                secret.push(c);
            }
            if frame.status == FrameStatus::Eof
                || (frame.status == FrameStatus::TimedOut && frame.text.is_empty())
            {
                warn!("Scan stopped at index {}: {:?}", index, frame.status);
                break;
            }
            if queries >= self.settings.limit {
                warn!("Scan stopped after {} queries", queries);
                break;
            }

            transport.send_line(&index.to_string()).await?;
            queries += 1;
            index += 1;
            frame = transport.read_until_marker(self.read_timeout).await?;
        }

        Ok(ScanOutcome {
            secret,
            queries,
            finished: false,
        })
    }
}
