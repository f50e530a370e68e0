//! Zip packaging of a job output directory.

use std::fs::File;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use super::backend::ArtifactError;

/// Zip every regular file under `dir` into one archive.
///
/// Entries use `/`-separated paths relative to `dir` and are written in sorted
/// order. Symbolic links (to files or directories) are skipped, so nothing
/// outside `dir` ends up in the archive. Returns `None` when `dir` does not
/// exist. Blocking; call from `spawn_blocking`.
pub fn package_directory(dir: &Path) -> Result<Option<Bytes>, ArtifactError> {
    match std::fs::symlink_metadata(dir) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return Ok(None),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ArtifactError::Packaging(e.to_string())),
    }

    let mut files = Vec::new();
    collect_files(dir, dir, &mut files).map_err(|e| ArtifactError::Packaging(e.to_string()))?;
    files.sort_by(|a, b| a.0.cmp(&b.0));

    let mut zip_writer = ZipWriter::new(Cursor::new(Vec::new()));
    let zip_options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .compression_level(Some(6));

    let mut buf = Vec::new();
    for (entry, path) in &files {
        buf.clear();
        File::open(path)
            .and_then(|mut f| f.read_to_end(&mut buf))
            .map_err(|e| ArtifactError::Packaging(format!("failed to read '{entry}': {e}")))?;
        zip_writer
            .start_file(entry.as_str(), zip_options)
            .map_err(|e| ArtifactError::Packaging(format!("failed to add '{entry}': {e}")))?;
        zip_writer
            .write_all(&buf)
            .map_err(|e| ArtifactError::Packaging(format!("failed to write '{entry}': {e}")))?;
    }

    let finished = zip_writer
        .finish()
        .map_err(|e| ArtifactError::Packaging(format!("failed to finalize archive: {e}")))?;
    Ok(Some(Bytes::from(finished.into_inner())))
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<(String, PathBuf)>) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            let Ok(rel) = path.strip_prefix(root) else {
                continue;
            };
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push((name, path));
        }
    }
    Ok(())
}
