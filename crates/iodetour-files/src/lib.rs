//! # iodetour-files
//!
//! Process-wide record of every file a detoured process touches.
//!
//! - [`FileRegistry`] - path and handle maps, shared by every hooked thread
//! - [`FileInfo`] / [`ProcInfo`] - per-file and per-child records
//! - [`Classifier`] - system, temporary, pipe, stdio and volume detection
//! - [`path`] - lexical Win32 path normalization and mount remapping
//! - [`open`] - what a `CreateFile` request means for a file
//! - [`dump`] - ignore-option filtering of the final dependency list and of
//!   accesses streamed while the process runs

pub mod classify;
pub mod dump;
pub mod info;
pub mod open;
pub mod path;
pub mod registry;

pub use classify::{Classifier, ClassifierRoots};
pub use dump::{is_reported, stream_line, DumpLine};
pub use info::{Binding, FileFlags, FileInfo, ProcInfo};
pub use open::OpenRequest;
pub use path::{command_executable, normalize, MountTable};
pub use registry::{FileRegistry, RegistryConfig};
