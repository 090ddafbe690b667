//! CSV outputs of the pipeline.
//!
//! # Submodules
//!
//! - [`csv`]: append-only per-worker page files and generic CSV read/write
//! - [`merge`]: combines every worker file into one sorted master file
//!
//! # Output Structure
//!
//! ```text
//! backup_dir/
//! ├── progress_worker_1.json   # checkpoint, see crate::progress
//! ├── completed_worker_1.json  # finished issues
//! ├── output_worker_1.csv      # title,aid,year,month,day,page,text
//! ├── ...
//! └── anno_pages.csv           # merged, sorted by aid,year,month,day,page
//! ```

pub mod csv;
pub mod merge;
