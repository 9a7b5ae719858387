//! Bundled datasource containers (`.tdsx`)
//!
//! A container is a zip archive holding the descriptor and, when downloaded
//! with data, the extract. Repackaging keeps the entry list and every
//! untouched member byte-for-byte; replaced members keep their compression
//! method.

use crate::error::{RefreshError, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;
use zip::write::FileOptions;
use zip::{ZipArchive, ZipWriter};

pub const DESCRIPTOR_EXTENSION: &str = "tds";

/// True when `path` is a readable zip archive.
pub fn is_container(path: impl AsRef<Path>) -> bool {
    File::open(path.as_ref())
        .ok()
        .and_then(|file| ZipArchive::new(file).ok())
        .is_some()
}

#[derive(Debug, Clone)]
pub struct Container {
    path: PathBuf,
    entries: Vec<String>,
}

impl Container {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut archive = ZipArchive::new(File::open(&path)?)?;
        // central directory order, not file_names() hash order
        let mut entries = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            entries.push(archive.by_index_raw(index)?.name().to_string());
        }
        debug!("container {} holds {} entries", path.display(), entries.len());

        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entry names in archive order
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn contains(&self, member: &str) -> bool {
        self.entries.iter().any(|e| e == member)
    }

    /// The single descriptor member at any depth.
    pub fn descriptor_member(&self) -> Result<&str> {
        let mut descriptors = self.entries.iter().filter(|name| {
            Path::new(name.as_str())
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case(DESCRIPTOR_EXTENSION))
                .unwrap_or(false)
        });

        match (descriptors.next(), descriptors.next()) {
            (Some(name), None) => Ok(name.as_str()),
            (None, _) => Err(RefreshError::Container(format!(
                "{} contains no descriptor",
                self.path.display()
            ))),
            (Some(_), Some(_)) => Err(RefreshError::Container(format!(
                "{} contains more than one descriptor",
                self.path.display()
            ))),
        }
    }

    /// Copy one member below `dest_dir`, keeping its relative path.
    pub fn unpack_member(&self, member: &str, dest_dir: &Path) -> Result<PathBuf> {
        let mut archive = ZipArchive::new(File::open(&self.path)?)?;
        let mut entry = archive.by_name(member)?;
        let relative = entry.enclosed_name().map(Path::to_path_buf).ok_or_else(|| {
            RefreshError::Container(format!("Member '{}' escapes the unpack directory", member))
        })?;

        let target = dest_dir.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
        Ok(target)
    }

    /// Rewrite the archive in place, swapping the listed members for file contents.
    pub fn repackage(&self, replacements: &HashMap<String, PathBuf>) -> Result<()> {
        for member in replacements.keys() {
            if !self.contains(member) {
                return Err(RefreshError::Container(format!(
                    "Cannot replace '{}': not a member of {}",
                    member,
                    self.path.display()
                )));
            }
        }

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut archive = ZipArchive::new(File::open(&self.path)?)?;
        let mut writer = ZipWriter::new(tempfile::NamedTempFile::new_in(&dir)?);

        for index in 0..archive.len() {
            let entry = archive.by_index_raw(index)?;
            let name = entry.name().to_string();

            match replacements.get(&name) {
                Some(source) => {
                    let size = std::fs::metadata(source)?.len();
                    let mut options = FileOptions::default()
                        .compression_method(entry.compression())
                        .last_modified_time(entry.last_modified())
                        .large_file(size >= u32::MAX as u64);
                    if let Some(mode) = entry.unix_mode() {
                        options = options.unix_permissions(mode);
                    }
                    drop(entry);

                    debug!("replacing member {} ({} bytes)", name, size);
                    writer.start_file(name, options)?;
                    io::copy(&mut File::open(source)?, &mut writer)?;
                }
                None => writer.raw_copy_file(entry)?,
            }
        }

        let temp = writer.finish()?;
        temp.persist(&self.path).map_err(|e| {
            RefreshError::Container(format!("Failed to replace {}: {}", self.path.display(), e))
        })?;
        Ok(())
    }
}
