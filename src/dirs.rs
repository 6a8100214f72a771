//! Directory browsing endpoints: listing a directory's immediate children
//! and producing breadcrumbs for a path, both gated by the same allow-list
//! [`crate::path_guard`] enforces for session working directories.

use crate::error::AppError;
use crate::path_guard;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub path: PathBuf,
    pub is_dir: bool,
}

#[derive(Debug, Serialize)]
pub struct Breadcrumb {
    pub name: String,
    pub path: PathBuf,
}

/// Lists the immediate children of `path`, sorted directories-first then
/// lexicographically. Rejects paths outside `allowed`.
pub fn list(path: &Path, allowed: &[PathBuf]) -> Result<Vec<DirEntry>, AppError> {
    if !path_guard::admit(path, allowed) {
        return Err(AppError::Forbidden(format!("path not allowed: {}", path.display())));
    }

    let read_dir = std::fs::read_dir(path).map_err(|e| AppError::BadRequest(e.to_string()))?;
    let mut entries = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|e| AppError::BadRequest(e.to_string()))?;
        let file_type = entry.file_type().map_err(|e| AppError::BadRequest(e.to_string()))?;
        entries.push(DirEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: entry.path(),
            is_dir: file_type.is_dir(),
        });
    }
    entries.sort_by(|a, b| match (a.is_dir, b.is_dir) {
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        _ => a.name.cmp(&b.name),
    });
    Ok(entries)
}

/// Breadcrumbs from the allow-list root containing `path` down to `path`
/// itself. Rejects paths outside `allowed`.
pub fn breadcrumbs(path: &Path, allowed: &[PathBuf]) -> Result<Vec<Breadcrumb>, AppError> {
    let resolved = path_guard::canonicalize(path)
        .filter(|resolved| path_guard::is_allowed(resolved, allowed))
        .ok_or_else(|| AppError::Forbidden(format!("path not allowed: {}", path.display())))?;

    let mut crumbs = Vec::new();
    let mut current = PathBuf::new();
    for component in resolved.components() {
        current.push(component);
        crumbs.push(Breadcrumb {
            name: component.as_os_str().to_string_lossy().into_owned(),
            path: current.clone(),
        });
    }
    Ok(crumbs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn list_rejects_disallowed_path() {
        let err = list(Path::new("/etc"), &[PathBuf::from("/srv")]).unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[test]
    fn list_sorts_dirs_before_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("a_dir")).unwrap();

        let entries = list(dir.path(), &[]).unwrap();
        assert_eq!(entries[0].name, "a_dir");
        assert!(entries[0].is_dir);
        assert_eq!(entries[1].name, "b.txt");
    }

    #[test]
    fn breadcrumbs_rejects_disallowed_path() {
        let err = breadcrumbs(Path::new("/etc"), &[PathBuf::from("/srv")]).unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[test]
    fn breadcrumbs_includes_every_component() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("a").join("b");
        std::fs::create_dir_all(&sub).unwrap();

        let crumbs = breadcrumbs(&sub, &[]).unwrap();
        assert!(crumbs.len() >= 3);
        assert_eq!(crumbs.last().unwrap().name, "b");
    }
}
