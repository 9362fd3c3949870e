//! Source traversal.
//!
//! Recursively walks a directory and produces a descriptor for every regular
//! file, sorted by path. Symlinks are not followed; special files are skipped.

use std::fs::Metadata;
use std::path::Path;

use chrono::{DateTime, Utc};
use chunkvault_protocol::{FileDescriptor, FileType};
use tracing::debug;

use crate::TransferError;

/// Scans `root` recursively and returns descriptors for every regular file.
///
/// Paths are absolute. A `root` that is itself a regular file yields a single
/// descriptor.
pub fn scan_files(root: &Path) -> Result<Vec<FileDescriptor>, TransferError> {
    let root = std::fs::canonicalize(root)?;
    let metadata = std::fs::symlink_metadata(&root)?;

    let mut files = Vec::new();
    if metadata.is_file() {
        files.push(descriptor_for(&root, &metadata)?);
    } else {
        walk_dir(&root, &mut files)?;
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

fn walk_dir(current: &Path, files: &mut Vec<FileDescriptor>) -> Result<(), TransferError> {
    for entry in std::fs::read_dir(current)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = std::fs::symlink_metadata(&path)?;

        if metadata.is_dir() {
            walk_dir(&path, files)?;
        } else if metadata.is_file() {
            files.push(descriptor_for(&path, &metadata)?);
        } else {
            debug!(
                path = %path.display(),
                kind = %file_type_of(&metadata).as_char(),
                "skipping non-regular file"
            );
        }
    }
    Ok(())
}

/// Captures a descriptor from already-fetched metadata.
pub fn descriptor_for(path: &Path, metadata: &Metadata) -> Result<FileDescriptor, TransferError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| TransferError::InvalidPath(format!("non UTF-8 path: {}", path.display())))?
        .to_owned();

    let mod_time: DateTime<Utc> = metadata.modified()?.into();
    let symlink_target = if metadata.file_type().is_symlink() {
        std::fs::read_link(path)
            .ok()
            .map(|t| t.to_string_lossy().into_owned())
    } else {
        None
    };

    let attrs = platform_attrs(metadata, mod_time);

    Ok(FileDescriptor {
        path: path_str,
        size: metadata.len(),
        mode: attrs.mode,
        owner: attrs.owner,
        group: attrs.group,
        mod_time,
        access_time: attrs.access_time,
        change_time: attrs.change_time,
        file_type: file_type_of(metadata),
        symlink_target,
    })
}

struct PlatformAttrs {
    mode: u32,
    owner: u32,
    group: u32,
    access_time: DateTime<Utc>,
    change_time: DateTime<Utc>,
}

#[cfg(unix)]
fn platform_attrs(metadata: &Metadata, _mod_time: DateTime<Utc>) -> PlatformAttrs {
    use std::os::unix::fs::MetadataExt;

    let ts = |secs: i64, nanos: i64| {
        DateTime::from_timestamp(secs, nanos.clamp(0, 999_999_999) as u32).unwrap_or_default()
    };
    PlatformAttrs {
        mode: metadata.mode() & 0o7777,
        owner: metadata.uid(),
        group: metadata.gid(),
        access_time: ts(metadata.atime(), metadata.atime_nsec()),
        change_time: ts(metadata.ctime(), metadata.ctime_nsec()),
    }
}

#[cfg(not(unix))]
fn platform_attrs(metadata: &Metadata, mod_time: DateTime<Utc>) -> PlatformAttrs {
    let mode = if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    };
    PlatformAttrs {
        mode,
        owner: 0,
        group: 0,
        access_time: metadata.accessed().map(Into::into).unwrap_or(mod_time),
        change_time: metadata.created().map(Into::into).unwrap_or(mod_time),
    }
}

fn file_type_of(metadata: &Metadata) -> FileType {
    let ft = metadata.file_type();
    if ft.is_file() {
        return FileType::Regular;
    }
    if ft.is_dir() {
        return FileType::Directory;
    }
    if ft.is_symlink() {
        return FileType::Symlink;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if ft.is_fifo() {
            return FileType::NamedPipe;
        }
        if ft.is_socket() {
            return FileType::Socket;
        }
        if ft.is_block_device() {
            return FileType::BlockDevice;
        }
        if ft.is_char_device() {
            return FileType::CharDevice;
        }
    }
    FileType::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn create_test_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();

        fs::write(root.join("b.bin"), b"BBBB").unwrap();
        fs::write(root.join("a.txt"), b"A").unwrap();
        fs::create_dir_all(root.join("etc").join("conf.d")).unwrap();
        fs::write(root.join("etc").join("hosts"), b"127.0.0.1").unwrap();
        fs::write(root.join("etc").join("conf.d").join("x.conf"), b"").unwrap();

        dir
    }

    #[test]
    fn scan_finds_regular_files_sorted() {
        let dir = create_test_tree();
        let files = scan_files(dir.path()).unwrap();

        let root = fs::canonicalize(dir.path()).unwrap();
        let rel: Vec<String> = files
            .iter()
            .map(|f| {
                Path::new(&f.path)
                    .strip_prefix(&root)
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert_eq!(rel, vec!["a.txt", "b.bin", "etc/conf.d/x.conf", "etc/hosts"]);
        assert!(files.iter().all(|f| Path::new(&f.path).is_absolute()));
        assert!(files.iter().all(|f| f.file_type == FileType::Regular));
    }

    #[test]
    fn scan_records_size() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("test.bin"), vec![0u8; 1234]).unwrap();

        let files = scan_files(dir.path()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].size, 1234);
    }

    #[test]
    fn scan_single_file_root() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("only.dat");
        fs::write(&path, b"x").unwrap();

        let files = scan_files(&path).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].path.ends_with("only.dat"));
    }

    #[test]
    fn scan_empty_dir() {
        let dir = TempDir::new().unwrap();
        assert!(scan_files(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn scan_nonexistent_dir() {
        assert!(scan_files(Path::new("/nonexistent/path/that/does/not/exist")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn scan_skips_symlinks_and_captures_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let target = dir.path().join("real");
        fs::write(&target, b"data").unwrap();
        fs::set_permissions(&target, fs::Permissions::from_mode(0o640)).unwrap();
        std::os::unix::fs::symlink(&target, dir.path().join("link")).unwrap();

        let files = scan_files(dir.path()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].mode, 0o640);
    }
}
