//! `redrun-core`: job lifecycle and submission model.
//!
//! This crate contains **pure domain** types (no infrastructure concerns): the
//! job record and its state machine, the test run request with its validation
//! rules, and the redacted form that is safe to persist.

pub mod error;
pub mod id;
pub mod job;
pub mod path;
pub mod redact;
pub mod request;

pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job::{error_kinds, error_notice, AggregatedResult, Job, JobError, JobResult, JobStatus};
pub use redact::{RedactedClient, RedactedRequest};
pub use request::{
    BasicTestSpec, ClientConfig, ClientKind, CustomTestSpec, EffectiveRunConfig, ReportLanguage,
    RunConfig, RunDefaults, TestParameter, TestPlan, TestRunRequest, TestSpec, ValidationPolicy,
};
