//! Duplicate-link resolution and numbered file names

use crate::error::{DownloadError, Result};
use crate::model::{DownloadFile, DownloadStatus, FileId};
use rivulet_config::DuplicateAction;
use std::collections::HashSet;
use std::path::Path;

/// What to do with a URL that already has download records
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplicateResolution {
    /// Add a new record under this file name
    AddWithName(String),
    /// Delete these records and their files, then add as usual
    ReplaceExisting { remove: Vec<FileId> },
    ShowComplete(FileId),
    Resume(FileId),
    Start(FileId),
    AlreadyActive(FileId),
}

/// Decide how to handle a URL matching `existing` records
///
/// `taken` holds the file names of records in `dir`. `LetUserChoose` is not a
/// final action and yields [`DownloadError::DuplicateActionRequired`].
pub fn resolve(
    action: DuplicateAction,
    url: &str,
    existing: &[DownloadFile],
    dir: &Path,
    file_name: &str,
    taken: &HashSet<String>,
) -> Result<DuplicateResolution> {
    match action {
        DuplicateAction::LetUserChoose => Err(DownloadError::DuplicateActionRequired {
            url: url.to_string(),
        }),
        DuplicateAction::DuplicateWithNumber => Ok(DuplicateResolution::AddWithName(
            unique_file_name(dir, file_name, taken),
        )),
        DuplicateAction::OverwriteExisting => Ok(DuplicateResolution::ReplaceExisting {
            remove: existing.iter().map(|file| file.id).collect(),
        }),
        DuplicateAction::ShowCompleteDialogOrResume => {
            let latest = existing
                .iter()
                .max_by_key(|file| (file.date_added, file.id))
                .ok_or_else(|| DownloadError::DuplicateActionRequired {
                    url: url.to_string(),
                })?;
            Ok(match latest.status {
                DownloadStatus::Completed => DuplicateResolution::ShowComplete(latest.id),
                DownloadStatus::Paused => DuplicateResolution::Resume(latest.id),
                DownloadStatus::None | DownloadStatus::Stopped | DownloadStatus::Error => {
                    DuplicateResolution::Start(latest.id)
                }
                DownloadStatus::Downloading | DownloadStatus::Merging | DownloadStatus::Stopping => {
                    DuplicateResolution::AlreadyActive(latest.id)
                }
            })
        }
    }
}

/// `file_name` itself when free, otherwise the first free numbered variant
pub fn unique_file_name(dir: &Path, file_name: &str, taken: &HashSet<String>) -> String {
    if is_free(dir, file_name, taken) {
        file_name.to_string()
    } else {
        numbered_file_name(dir, file_name, taken)
    }
}

/// First of `stem_2.ext`, `stem_3.ext`, ... colliding with neither a record
/// name in `taken` nor a file on disk
pub fn numbered_file_name(dir: &Path, file_name: &str, taken: &HashSet<String>) -> String {
    let (stem, extension) = split_name(file_name);
    let mut counter: u64 = 2;
    loop {
        let candidate = format!("{}_{}{}", stem, counter, extension);
        if is_free(dir, &candidate, taken) {
            return candidate;
        }
        counter += 1;
    }
}

fn is_free(dir: &Path, name: &str, taken: &HashSet<String>) -> bool {
    !taken.contains(name) && !dir.join(name).exists()
}

/// Split into stem and extension including the dot; dot files have no extension
fn split_name(file_name: &str) -> (&str, &str) {
    match file_name.rfind('.') {
        Some(index) if index > 0 => file_name.split_at(index),
        _ => (file_name, ""),
    }
}
