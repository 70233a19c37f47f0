use std::path::{Component, Path};

use crate::TransferError;

/// Validates that `name` is exactly one plain path component.
///
/// File names and session ids end up as directory entries on the receiving
/// side, so they must not be able to name anything outside their parent.
///
/// Rejects:
/// - Empty names
/// - Anything containing a separator (`a/b`)
/// - `.` and `..`
/// - Absolute paths and Windows prefixes (`C:`, `\\server`)
pub fn validate_path_component(name: &str) -> Result<(), TransferError> {
    if name.is_empty() {
        return Err(TransferError::InvalidPath("empty name".into()));
    }

    if name.contains('/') || name.contains('\\') {
        return Err(TransferError::InvalidPath(format!(
            "path separators not allowed: {name}"
        )));
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        (Some(Component::ParentDir), _) => Err(TransferError::InvalidPath(format!(
            "parent directory not allowed: {name}"
        ))),
        _ => Err(TransferError::InvalidPath(format!(
            "not a plain file name: {name}"
        ))),
    }
}
