//! Plugin payload copying for installs

use std::io;
use std::path::{Path, PathBuf};

/// Recursively copy `source` into `target`, creating `target`
///
/// Symlinks are skipped so a payload cannot pull files from outside its own
/// directory into the managed install root. Returns the number of files copied.
pub async fn copy_payload(source: &Path, target: &Path) -> io::Result<usize> {
    let mut copied = 0;
    let mut pending: Vec<(PathBuf, PathBuf)> = vec![(source.to_path_buf(), target.to_path_buf())];

    while let Some((from, to)) = pending.pop() {
        tokio::fs::create_dir_all(&to).await?;
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let destination = to.join(entry.file_name());
            if file_type.is_dir() {
                pending.push((entry.path(), destination));
            } else if file_type.is_file() {
                tokio::fs::copy(entry.path(), &destination).await?;
                copied += 1;
            } else {
                tracing::warn!("Skipping {} during install: not a regular file", entry.path().display());
            }
        }
    }

    Ok(copied)
}

/// Remove a previous install, tolerating its absence
pub async fn remove_payload(target: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(target).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Whether `a` and `b` name the same existing directory
pub fn same_directory(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
