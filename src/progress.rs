//! Progress-callback trait for per-row pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the pipeline moves through its stages and rows.
//!
//! # Example
//!
//! ```rust
//! use edgequake_tab2rag::{PipelineConfig, PipelineProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl PipelineProgressCallback for CountingCallback {
//!     fn on_row_complete(&self, row: usize, total_rows: usize, degraded: bool) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("Row {}/{} done (degraded: {})", row + 1, total_rows, degraded);
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { completed: AtomicUsize::new(0) });
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(counter as Arc<dyn PipelineProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::pipeline::PipelineStage;
use std::sync::Arc;

/// Called by the pipeline as it advances through stages and rows.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Rows are processed one at a time, but the trait is
/// `Send + Sync` so an implementation can be shared with other tasks.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once after ingestion, when the row count is known.
    fn on_run_start(&self, total_rows: usize) {
        let _ = total_rows;
    }

    /// Called on every state transition, including `Done` and `Failed`.
    fn on_stage(&self, stage: PipelineStage) {
        let _ = stage;
    }

    /// Called before a row is standardized.
    ///
    /// # Arguments
    /// * `row`       : zero-based row index
    /// * `total_rows`: rows in the table
    fn on_row_start(&self, row: usize, total_rows: usize) {
        let _ = (row, total_rows);
    }

    /// Called after a row's record is built.
    ///
    /// `degraded` is true when any field or caption of the row fell back.
    fn on_row_complete(&self, row: usize, total_rows: usize, degraded: bool) {
        let _ = (row, total_rows, degraded);
    }

    /// Called once after validation.
    ///
    /// # Arguments
    /// * `total_rows`: records produced
    /// * `clean_rows`: records without schema violations
    fn on_run_complete(&self, total_rows: usize, clean_rows: usize) {
        let _ = (total_rows, clean_rows);
    }
}

/// A no-op implementation, the default when no callback is configured.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;
