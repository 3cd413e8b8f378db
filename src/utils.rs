use std::{
    io::Write,
    os::unix::prelude::PermissionsExt,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use log::info;

use crate::generator::GeneratedImage;

/// Writes each image into `dir` under a fresh uuid name, keeping the engine's extension.
/// Files appear atomically: they are written to a temporary file first and then renamed.
pub fn save_images(dir: &Path, images: &[GeneratedImage]) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let uuid = uuid::Uuid::new_v4();
    let mut paths = Vec::new();
    for (i, image) in images.iter().enumerate() {
        let extension = Path::new(&image.filename)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("png");
        let path = dir.join(format!("{}.{}.{}", uuid, i, extension));
        info!("Saving {} bytes to {}", image.data.len(), path.display());
        let tmp = tempfile::NamedTempFile::new_in(dir).context("failed to create temporary file")?;
        tmp.as_file().write_all(&image.data).context("failed to write temporary file")?;
        tmp.as_file()
            .set_permissions(PermissionsExt::from_mode(0o644))
            .context("failed to chmod temporary file")?;
        tmp.persist(&path)
            .with_context(|| format!("failed to persist {}", path.display()))?;
        paths.push(path);
    }
    Ok(paths)
}

pub fn hash(text: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(text.as_bytes());
    let hash = hasher.finalize();
    hash.to_string()
}
