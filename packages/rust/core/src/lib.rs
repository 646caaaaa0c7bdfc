//! Stage orchestration for novelkb.
//!
//! Each stage reads its upstream artifact from disk and writes its own, so
//! any stage can be re-run on its own: chunk → extract → merge → build-docs.

pub mod pipeline;

pub use pipeline::{
    BuildDocsJob, ChunkJob, ChunkReport, ExtractJob, MergeJob, MergeReport, ProgressReporter,
    SilentProgress, backend_from_config, run_build_docs, run_chunk, run_extract, run_merge,
};
