//! # anchor-probe
//!
//! Recover an unknown secret from a remote line-oriented interpreter that
//! only leaks one bit per request: whether a division raised its
//! distinguishing error.
//!
//! Positions of the secret with a known symbol serve as anchors. For each
//! anchor the shared interpreter variable is loaded with the anchor's value,
//! then every target position is compared against it. Matching targets are
//! grouped into clusters and rendered into a template with wildcards for
//! whatever stayed unresolved.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use anchor_probe::{AnchorProbe, ProbeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProbeConfig::builder("challenge.example", 1337)
//!         .prefix("infobahn{")
//!         .anchor_order(vec![1, 2, 3, 4, 5, 6, 7, 9])
//!         .targets(10, 55)
//!         .build()?;
//!
//!     let mut probe = AnchorProbe::connect(&config).await?;
//!     let report = probe.run().await;
//!     println!("{}", report.rendered);
//!     Ok(())
//! }
//! ```
//!
//! ## Offline
//!
//! [`mock::MockInterpreter`] implements [`LineTransport`] in memory and can
//! stand in for the TCP session anywhere.

pub mod aggregator;
pub mod config;
pub mod controller;
pub mod error;
pub mod expression;
pub mod loader;
pub mod mock;
pub mod oracle;
pub mod scan;
pub mod transport;
pub mod types;

// Re-export main types
pub use aggregator::Aggregator;
pub use config::{AdvisoryWarning, ProbeConfig, ProbeConfigBuilder};
pub use controller::{AnchorProbe, PairOutcome, ProbeEvent, StepFailure};
pub use error::{ProbeError, Result};
pub use expression::{Expression, VariableNames};
pub use loader::{LoadedProbeConfig, load_merged};
pub use oracle::{ErrorSignal, Oracle};
pub use scan::{IndexScan, ScanOutcome, ScanSettings};
pub use transport::{Frame, FrameStatus, LineTransport, TcpSession};
pub use types::{
    AbortReason, Anchor, ProbeReport, ProbeResult, ProbeStep, RunStats, Slot, TargetDiagnostic,
    TargetRange, Template,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
