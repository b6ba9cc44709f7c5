use std::{
    io,
    path::{Component, Path, PathBuf},
};

use log::debug;

fn has_ancestor_in_root(root: &Path, path: &Path) -> bool {
    if let Ok(p) = path.canonicalize() {
        return p.starts_with(root);
    }

    if let Some(p) = path.parent() {
        has_ancestor_in_root(root, p)
    } else {
        false
    }
}

/// Resolves a guest path to its location on the host, below the mounted guest
/// root.
///
/// Absolute paths are taken relative to the guest root, and the result must
/// stay inside it once symlinks are resolved. Paths that don't exist yet are
/// accepted if their closest existing ancestor is inside the guest.
pub(crate) fn guest_path(root: &Path, path: &Path) -> Result<PathBuf, io::Error> {
    let root = root.canonicalize()?;

    let mut joined = root.clone();
    for part in path.components() {
        match part {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => joined.push(".."),
            Component::Normal(c) => joined.push(c),
        }
    }

    let canonical = match joined.canonicalize() {
        Ok(p) => p,
        Err(e) => {
            if e.kind() == io::ErrorKind::NotFound && has_ancestor_in_root(&root, &joined) {
                debug!(
                    "{} doesn't exist yet, but its parent is in the guest",
                    joined.display()
                );

                return Ok(joined);
            }

            return Err(e);
        }
    };

    if !canonical.starts_with(&root) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} escapes the guest root", path.display()),
        ));
    }

    Ok(canonical)
}

#[cfg(test)]
mod guest_path_tests {
    use std::{
        fs::{self, File},
        os,
        path::{Path, PathBuf},
    };

    use tempfile::TempDir;
    use test_log::test;

    use crate::guest::guest_path;

    const HOST_SECRET_DIR: &str = "host-secret";
    const GUEST_DIR: &str = "guest";

    fn create_guest() -> (TempDir, PathBuf) {
        let host_dir = TempDir::new().unwrap();
        let host = host_dir.path().canonicalize().unwrap();

        fs::create_dir(host.join(HOST_SECRET_DIR)).unwrap();
        File::create(host.join(HOST_SECRET_DIR).join("shadow")).unwrap();

        let guest = host.join(GUEST_DIR);
        fs::create_dir_all(guest.join("etc/cloud")).unwrap();
        File::create(guest.join("etc/hostname")).unwrap();

        os::unix::fs::symlink(host.join(HOST_SECRET_DIR), guest.join("escape")).unwrap();
        os::unix::fs::symlink("/etc", guest.join("etc-link")).unwrap();

        (host_dir, guest)
    }

    #[test]
    fn test_absolute_file() {
        let (_dir, guest) = create_guest();

        assert_eq!(
            guest_path(&guest, Path::new("/etc/hostname")).unwrap(),
            guest.join("etc/hostname")
        );
    }

    #[test]
    fn test_absolute_file_missing() {
        let (_dir, guest) = create_guest();

        assert_eq!(
            guest_path(&guest, Path::new("/etc/cloud/cloud.cfg.d/chosi.cfg")).unwrap(),
            guest.join("etc/cloud/cloud.cfg.d/chosi.cfg")
        );
    }

    #[test]
    fn test_relative_file() {
        let (_dir, guest) = create_guest();

        assert_eq!(
            guest_path(&guest, Path::new("etc/hostname")).unwrap(),
            guest.join("etc/hostname")
        );
    }

    #[test]
    fn test_root_itself() {
        let (_dir, guest) = create_guest();

        assert_eq!(guest_path(&guest, Path::new("")).unwrap(), guest);
    }

    #[test]
    fn test_parent_escape() {
        let (_dir, guest) = create_guest();

        guest_path(&guest, Path::new("/etc/../../host-secret/shadow")).unwrap_err();
    }

    #[test]
    fn test_symlink_escape() {
        let (_dir, guest) = create_guest();

        guest_path(&guest, Path::new("/escape/shadow")).unwrap_err();
        guest_path(&guest, Path::new("/escape/not-there")).unwrap_err();
    }

    #[test]
    fn test_absolute_symlink_escape() {
        let (_dir, guest) = create_guest();

        guest_path(&guest, Path::new("/etc-link/passwd")).unwrap_err();
    }
}
