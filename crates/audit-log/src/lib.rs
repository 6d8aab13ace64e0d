//! Append-only JSON-lines audit log for policy decisions.
//!
//! Each event is serialised as a single newline-terminated JSON object and
//! appended to a log file by a background task, producing a
//! [JSON Lines](https://jsonlines.org/) stream that is easy to ship, parse,
//! and replay.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (sink, _handle) = AuditSink::start("/var/log/policy-gate/audit.jsonl").await?;
//!
//! sink.log(AuditEntry::new(
//!     AuditEventType::PolicyValidationFailed,
//!     AuditSource::new("policy-gate"),
//!     serde_json::json!({"error": "duplicate rule id: 'r1'"}),
//! ))
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod entry;
pub mod sink;
pub mod writer;

pub use entry::{AuditEntry, AuditEventType, AuditSource, PolicyDecisionRecord};
pub use sink::{AuditSink, AuditSinkClosed};
pub use writer::{read_entries, AuditWriteError, AuditWriter};
