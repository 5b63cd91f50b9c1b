//! # jobmgr-id
//!
//! Typed identifiers for workloads managed by the job manager.
//!
//! Every workload id is `{prefix}-{ulid}` with the ULID rendered in
//! lowercase, for example `batchjob-01hv4z2wqxkjnm8gpqy6vbkc3d`. The ULID
//! makes ids sortable by creation time, which the store relies on for
//! deterministic queue order and descending pagination.
//!
//! The lowercase form keeps ids usable as Kubernetes object names.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

pub use ulid::Ulid;
