use crate::error::Result;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Write `path` through a temporary sibling file that replaces it in one rename.
///
/// Readers see either the old contents or the new ones, never a partial write.
/// When the rename-over fails (some platforms refuse to replace a file that is
/// open elsewhere) the destination is removed first and the rename retried,
/// which leaves a short window where `path` does not exist.
pub fn write_atomically<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<&File>) -> Result<()>,
{
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let temp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(temp.as_file());
        write(&mut writer)?;
        writer.flush()?;
    }
    temp.as_file().sync_all()?;

    match temp.persist(path) {
        Ok(_) => {
            debug!(path = %path.display(), "replaced file atomically");
            Ok(())
        }
        Err(err) => {
            warn!(
                path = %path.display(),
                error = %err.error,
                "atomic replace failed, falling back to remove-then-rename"
            );
            if path.exists() {
                fs::remove_file(path)?;
            }
            err.file.persist(path).map_err(|e| e.error)?;
            Ok(())
        }
    }
}
