//! Dependency file output.

use std::fs::File;
use std::io::{self, BufWriter};
use std::path::Path;

/// Open (truncating) the dependency file the server writes into.
pub fn create_dependency_file(path: &Path) -> io::Result<BufWriter<File>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(BufWriter::new(File::create(path)?))
}
