//! Image store - session-scoped persistence of tool-result images
//!
//! Copies land under `images/{session_id}/{phase_name}/image_{N}.{ext}`.
//! Content is immutable once written: indices only ever grow, and an
//! existing file is never overwritten.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::echo::Echo;
use crate::tools::ToolError;

/// Persist copies of tool-result images and record them on the Echo
///
/// Returns the persisted paths in source order.
pub fn persist_images(
    images_root: &Path,
    echo: &mut Echo,
    phase_name: &str,
    sources: &[PathBuf],
) -> Result<Vec<PathBuf>, ToolError> {
    if sources.is_empty() {
        return Ok(Vec::new());
    }

    let dir = images_root.join(&echo.session_id).join(phase_name);
    std::fs::create_dir_all(&dir).map_err(|e| ToolError::io("image_store", e.to_string()))?;

    let mut persisted = Vec::with_capacity(sources.len());
    for source in sources {
        let ext = source
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("png")
            .to_string();

        let mut index = echo.image_count(phase_name);
        let mut target = dir.join(format!("image_{}.{}", index, ext));
        while target.exists() {
            index += 1;
            target = dir.join(format!("image_{}.{}", index, ext));
        }

        std::fs::copy(source, &target).map_err(|e| {
            ToolError::io(
                "image_store",
                format!("copy {} -> {}: {}", source.display(), target.display(), e),
            )
        })?;

        debug!(source = %source.display(), target = %target.display(), "image persisted");
        echo.record_image(phase_name, target.clone());
        persisted.push(target);
    }

    Ok(persisted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_source(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_persist_copies_under_session_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let source = write_source(tmp.path(), "chart.png", b"fake png");
        let mut echo = Echo::new("sess-1");

        let persisted = persist_images(tmp.path(), &mut echo, "analyze", &[source]).unwrap();
        assert_eq!(persisted.len(), 1);
        assert!(persisted[0].ends_with("sess-1/analyze/image_0.png"));
        assert_eq!(std::fs::read(&persisted[0]).unwrap(), b"fake png");
        assert_eq!(echo.image_count("analyze"), 1);
    }

    #[test]
    fn test_indices_continue_across_calls() {
        let tmp = tempfile::tempdir().unwrap();
        let a = write_source(tmp.path(), "a.png", b"a");
        let b = write_source(tmp.path(), "b.jpg", b"b");
        let mut echo = Echo::new("sess-1");

        persist_images(tmp.path(), &mut echo, "p", &[a]).unwrap();
        let second = persist_images(tmp.path(), &mut echo, "p", &[b]).unwrap();
        assert!(second[0].ends_with("image_1.jpg"));
    }

    #[test]
    fn test_existing_file_never_overwritten() {
        let tmp = tempfile::tempdir().unwrap();
        let source = write_source(tmp.path(), "x.png", b"new");
        let mut echo = Echo::new("sess-1");

        // Simulate a leftover file at index 0 from a previous process
        let dir = tmp.path().join("sess-1").join("p");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("image_0.png"), b"old").unwrap();

        let persisted = persist_images(tmp.path(), &mut echo, "p", &[source]).unwrap();
        assert!(persisted[0].ends_with("image_1.png"));
        assert_eq!(std::fs::read(dir.join("image_0.png")).unwrap(), b"old");
    }

    #[test]
    fn test_missing_source_is_io_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut echo = Echo::new("s");
        let result = persist_images(tmp.path(), &mut echo, "p", &[PathBuf::from("/does/not/exist.png")]);
        assert!(matches!(result, Err(ToolError::Io { .. })));
    }
}
