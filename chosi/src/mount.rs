use std::{
    fs,
    path::{Path, PathBuf},
};

use log::{debug, trace};
use types::{BootLayout, ChosiError, PartitionRole};

use crate::{
    guest::guest_path,
    host::{Host, MountKind},
    loopdev::partition_device,
};

/// Kernel API filesystems the package tools expect inside the chroot,
/// mounted after the partitions.
const API_FILESYSTEMS: [(&str, &str, MountKind); 3] = [
    ("proc", "/proc", MountKind::Filesystem("proc")),
    ("sysfs", "/sys", MountKind::Filesystem("sysfs")),
    ("/dev", "/dev", MountKind::Bind),
];

fn mount_partition<H: Host>(
    host: &mut H,
    device: &Path,
    root: &Path,
    role: PartitionRole,
    number: u32,
) -> Result<(), ChosiError> {
    let part = partition_device(device, number);
    let mount_error = |target: &Path, source| ChosiError::Mount {
        role,
        device: part.clone(),
        target: target.to_path_buf(),
        source,
    };

    let target = guest_path(root, Path::new(role.mount_point()))
        .map_err(|e| mount_error(&root.join(role.mount_point()), e))?;

    fs::create_dir_all(&target).map_err(|e| mount_error(&target, e))?;

    debug!(
        "Mounting {role} partition {} on {}",
        part.display(),
        target.display()
    );

    host.mount(&part, &target, MountKind::Filesystem(role.fstype()))
        .map_err(|e| mount_error(&target, e))?;

    trace!("{role} partition mounted");
    Ok(())
}

fn mount_api_filesystems<H: Host>(host: &mut H, root: &Path) -> Result<(), ChosiError> {
    for (source, guest_target, kind) in API_FILESYSTEMS {
        let fstype = match kind {
            MountKind::Filesystem(fstype) => fstype,
            MountKind::Bind => "bind",
        };
        let api_error = |target: PathBuf, source| ChosiError::ApiFilesystem {
            fstype,
            target,
            source,
        };

        let target = guest_path(root, Path::new(guest_target))
            .map_err(|e| api_error(root.join(guest_target), e))?;

        fs::create_dir_all(&target).map_err(|e| api_error(target.clone(), e))?;

        debug!("Mounting {fstype} on {}", target.display());

        host.mount(Path::new(source), &target, kind)
            .map_err(|e| api_error(target.clone(), e))?;
    }

    Ok(())
}

/// Mounts the loop device's partitions below `root`, in dependency order: the
/// root partition, then the boot partition if the layout has one, then the
/// ESP, and finally the API filesystems.
///
/// A failure leaves the partitions that did mount in place; [`unmount_tree`]
/// takes care of them.
pub(crate) fn mount_partitions<H: Host>(
    host: &mut H,
    device: &Path,
    root: &Path,
    layout: &BootLayout,
) -> Result<(), ChosiError> {
    for (role, number) in layout.partitions() {
        mount_partition(host, device, root, role, number)?;
    }

    mount_api_filesystems(host, root)
}

/// Unmounts everything mounted at or below `root`, most recent mount first.
pub(crate) fn unmount_tree<H: Host>(host: &mut H, root: &Path) -> Result<(), ChosiError> {
    let unmount_error = |source| ChosiError::Unmount {
        target: root.to_path_buf(),
        source,
    };

    let root = root.canonicalize().map_err(unmount_error)?;
    let mounts: Vec<PathBuf> = host
        .active_mounts()
        .map_err(unmount_error)?
        .into_iter()
        .filter(|m| m.starts_with(&root))
        .collect();

    if mounts.is_empty() {
        debug!("Nothing mounted under {}", root.display());
        return Ok(());
    }

    for target in mounts.iter().rev() {
        debug!("Unmounting {}", target.display());

        host.unmount(target)
            .map_err(|source| ChosiError::Unmount {
                target: target.clone(),
                source,
            })?;
    }

    Ok(())
}

#[cfg(test)]
mod mount_tests {
    use std::path::{Path, PathBuf};

    use tempfile::TempDir;
    use test_log::test;
    use types::{Architecture, ChosiError, PartitionRole};

    use crate::{
        host::mock::{Call, MockHost},
        mount::{mount_partitions, unmount_tree},
    };

    const DEVICE: &str = "/dev/loop7";

    fn mount_targets(host: &MockHost) -> Vec<(PathBuf, PathBuf)> {
        host.calls
            .iter()
            .filter_map(|c| match c {
                Call::Mount { source, target } => Some((source.clone(), target.clone())),
                Call::Attach(_) | Call::Detach(_) | Call::Unmount(_) | Call::Run(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_riscv64_mount_order() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let mut host = MockHost::new();

        mount_partitions(
            &mut host,
            Path::new(DEVICE),
            &root,
            Architecture::Riscv64.boot_layout(),
        )
        .unwrap();

        assert_eq!(
            mount_targets(&host),
            vec![
                (PathBuf::from("/dev/loop7p1"), root.clone()),
                (PathBuf::from("/dev/loop7p16"), root.join("boot")),
                (PathBuf::from("/dev/loop7p15"), root.join("boot/efi")),
                (PathBuf::from("proc"), root.join("proc")),
                (PathBuf::from("sysfs"), root.join("sys")),
                (PathBuf::from("/dev"), root.join("dev")),
            ]
        );
    }

    #[test]
    fn test_amd64_has_no_boot_mount() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let mut host = MockHost::new();

        mount_partitions(
            &mut host,
            Path::new(DEVICE),
            &root,
            Architecture::Amd64.boot_layout(),
        )
        .unwrap();

        let targets = mount_targets(&host);
        assert_eq!(targets[0], (PathBuf::from("/dev/loop7p1"), root.clone()));
        assert_eq!(
            targets[1],
            (PathBuf::from("/dev/loop7p15"), root.join("boot/efi"))
        );
        assert!(!targets.iter().any(|(s, _)| s.ends_with("loop7p16")));
    }

    #[test]
    fn test_mount_then_unmount_leaves_nothing() {
        for arch in [Architecture::Amd64, Architecture::Riscv64] {
            let dir = TempDir::new().unwrap();
            let root = dir.path().canonicalize().unwrap();
            let mut host = MockHost::new();

            mount_partitions(&mut host, Path::new(DEVICE), &root, arch.boot_layout()).unwrap();
            assert!(!host.mounted().is_empty());

            unmount_tree(&mut host, &root).unwrap();
            assert!(host.mounted().is_empty(), "{arch} left mounts behind");

            let unmounted: Vec<PathBuf> = host
                .calls
                .iter()
                .filter_map(|c| match c {
                    Call::Unmount(t) => Some(t.clone()),
                    Call::Attach(_) | Call::Detach(_) | Call::Mount { .. } | Call::Run(_) => None,
                })
                .collect();
            assert_eq!(unmounted.last(), Some(&root));
            assert_eq!(unmounted.first(), Some(&root.join("dev")));
        }
    }

    #[test]
    fn test_partial_mount_is_reversible() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let mut host = MockHost::new().fail_when(
            |c| matches!(c, Call::Mount { source, .. } if source.ends_with("loop7p15")),
        );

        let err = mount_partitions(
            &mut host,
            Path::new(DEVICE),
            &root,
            Architecture::Riscv64.boot_layout(),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            ChosiError::Mount {
                role: PartitionRole::Esp,
                ..
            }
        ));
        assert_eq!(host.mounted(), [root.clone(), root.join("boot")]);

        unmount_tree(&mut host, &root).unwrap();
        assert!(host.mounted().is_empty());
    }

    #[test]
    fn test_unmount_nothing_mounted() {
        let dir = TempDir::new().unwrap();
        let mut host = MockHost::new();

        unmount_tree(&mut host, dir.path()).unwrap();
        assert!(host.calls.is_empty());
    }

    #[test]
    fn test_busy_mount_fails() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let busy = root.join("boot/efi");
        let mut host = MockHost::new()
            .fail_when(move |c| matches!(c, Call::Unmount(t) if *t == busy));

        mount_partitions(
            &mut host,
            Path::new(DEVICE),
            &root,
            Architecture::Amd64.boot_layout(),
        )
        .unwrap();

        let err = unmount_tree(&mut host, &root).unwrap_err();
        assert!(matches!(err, ChosiError::Unmount { .. }));
        assert!(host.mounted().contains(&root));
    }
}
