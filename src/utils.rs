use std::{io::Write, path::Path};

use anyhow::{Context, Result};
use log::debug;

pub fn hash(data: &[u8]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(data);
    let hash = hasher.finalize();
    hash.to_string()
}

/// Writes `data` to `path` via a temporary file in the same directory,
/// so an interrupted run never leaves a truncated file behind.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).context("failed to create temporary file")?;
    tmp.write_all(data).context("failed to write temporary file")?;
    tmp.persist(path)
        .with_context(|| format!("failed to move file into place at {}", path.display()))?;
    debug!("Wrote {} bytes to {}", data.len(), path.display());
    Ok(())
}

/// Keeps only the last path component of a server-supplied filename.
pub fn safe_filename(name: &str) -> Option<&str> {
    let name = name.rsplit(&['/', '\\'][..]).next()?;
    match name {
        "" | "." | ".." => None,
        _ => Some(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash() {
        assert_eq!(hash(b"hello"), "ea8f163db38682925e4491c5e58d4bb3506ef8c14eb78a86e908c5624a67200f");
    }

    #[test]
    fn test_write_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_safe_filename() {
        assert_eq!(safe_filename("fox_00001_.png"), Some("fox_00001_.png"));
        assert_eq!(safe_filename("../../etc/passwd"), Some("passwd"));
        assert_eq!(safe_filename("sub\\x.png"), Some("x.png"));
        assert_eq!(safe_filename(".."), None);
        assert_eq!(safe_filename("dir/"), None);
    }
}
