//! Post-retrieval compression of received directories

use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

/// Replace every top-level directory under `root` by `<dir>.tar.gz`.
///
/// Returns the archives written, in directory name order.
pub fn compress_subdirectories(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(root)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|entry| entry.path())
        .collect();
    dirs.sort();

    let mut archives = Vec::with_capacity(dirs.len());
    for dir in dirs {
        let archive = compress_directory(&dir)?;
        std::fs::remove_dir_all(&dir)?;
        info!("🗜️ Compressed {} into {}", dir.display(), archive.display());
        archives.push(archive);
    }
    Ok(archives)
}

fn compress_directory(dir: &Path) -> io::Result<PathBuf> {
    let name = dir
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "directory has no name"))?;
    let mut archive_name = name.to_os_string();
    archive_name.push(".tar.gz");
    let archive_path = dir.with_file_name(archive_name);

    let file = File::create(&archive_path)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.append_dir_all(name, dir)?;
    builder.into_inner()?.finish()?;
    Ok(archive_path)
}
