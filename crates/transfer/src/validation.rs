use std::path::{Component, Path};

use crate::TransferError;

/// Checks that `rel` stays inside whatever directory it is joined onto.
///
/// Used for chunk locations read back from a metadata journal before they
/// are resolved against the store root.
pub fn validate_relative_path(rel: &str) -> Result<(), TransferError> {
    if rel.is_empty() {
        return Err(TransferError::InvalidPath("empty path".into()));
    }

    for component in Path::new(rel).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {rel}"
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute path not allowed: {rel}"
                )));
            }
        }
    }
    Ok(())
}
