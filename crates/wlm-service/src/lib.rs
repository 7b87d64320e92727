//! # wlm-service: Orchestration Layer
//!
//! The workflows an external host (HTTP, CLI, scheduler) calls into:
//!
//! - [`import`] - `.inp` → topology + DMAs + stored input file
//! - [`readings`] - labelled reading batches, all-or-nothing
//! - [`analysis`] - the one-shot ingest → detect → localize report
//!
//! Everything here is thin composition over `wlm-core` repositories and
//! `wlm-algo` engines; request validation and wire mapping stay in the host.

pub mod analysis;
pub mod import;
pub mod readings;

pub use analysis::{AnalysisReport, AnalysisService, AnalysisSummary, DetectionReport};
pub use import::{create_dmas_for_mainlines, ImportReport, ImportService, IMPORT_PERSIST_TIMEOUT};
pub use readings::{ReadingInput, ReadingService};
