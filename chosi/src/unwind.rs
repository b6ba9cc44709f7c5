use std::{fs, io, path::PathBuf};

use types::ChosiError;

use crate::{host::Host, loopdev::LoopDevice, mount::unmount_tree, report::Reporter};

/// A resource release, registered right after the matching acquisition
#[derive(Debug)]
pub(crate) enum Release {
    Detach(LoopDevice),

    /// Removes an empty scratch directory. Never recursive: a directory
    /// that still holds a mount must not take the guest content with it.
    RemoveDir(PathBuf),

    /// Recursively unmounts everything below a directory
    Unmount(PathBuf),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReleaseKind {
    Detach,
    RemoveDir,
    Unmount,
}

impl Release {
    fn kind(&self) -> ReleaseKind {
        match self {
            Self::Detach(_) => ReleaseKind::Detach,
            Self::RemoveDir(_) => ReleaseKind::RemoveDir,
            Self::Unmount(_) => ReleaseKind::Unmount,
        }
    }

    fn execute<H: Host>(self, host: &mut H) -> Result<(), ChosiError> {
        match self {
            Self::Detach(device) => device.detach(host),
            Self::RemoveDir(dir) => match fs::remove_dir(&dir) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
                Ok(()) | Err(_) => Ok(()),
            },
            Self::Unmount(root) => unmount_tree(host, &root),
        }
    }
}

/// Outcome of a single release
#[derive(Debug)]
pub(crate) struct Released {
    pub(crate) kind: ReleaseKind,
    pub(crate) result: Result<(), ChosiError>,
}

/// Releases pending for the resources acquired so far, run in reverse order
/// of registration.
#[derive(Debug, Default)]
pub(crate) struct ReleaseStack {
    actions: Vec<Release>,
}

impl ReleaseStack {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, release: Release) {
        self.actions.push(release);
    }

    /// Runs every pending release, most recent first. A failing release
    /// doesn't prevent the following ones from running.
    pub(crate) fn unwind<H: Host>(&mut self, host: &mut H, reporter: &Reporter) -> Vec<Released> {
        let mut released = Vec::with_capacity(self.actions.len());

        while let Some(release) = self.actions.pop() {
            let kind = release.kind();
            reporter.debug(format_args!("Releasing: {kind:?}"));

            let result = release.execute(host);
            if let Err(e) = &result {
                reporter.error(format_args!("Release {kind:?} failed: {e}"));
            }

            released.push(Released { kind, result });
        }

        released
    }
}

#[cfg(test)]
mod unwind_tests {
    use std::{fs, path::Path};

    use tempfile::TempDir;
    use test_log::test;

    use crate::{
        host::mock::{Call, MockHost},
        loopdev::LoopDevice,
        report::Reporter,
        unwind::{Release, ReleaseKind, ReleaseStack},
    };

    #[test]
    fn test_reverse_order() {
        let dir = TempDir::new().unwrap();
        let scratch = dir.path().join("scratch");
        fs::create_dir(&scratch).unwrap();

        let mut host = MockHost::new();
        let device = LoopDevice::attach(&mut host, Path::new("image.raw")).unwrap();

        let mut stack = ReleaseStack::new();
        stack.push(Release::Detach(device));
        stack.push(Release::RemoveDir(scratch.clone()));
        stack.push(Release::Unmount(scratch.clone()));

        let released = stack.unwind(&mut host, &Reporter::new());

        assert_eq!(
            released.iter().map(|r| r.kind).collect::<Vec<_>>(),
            vec![
                ReleaseKind::Unmount,
                ReleaseKind::RemoveDir,
                ReleaseKind::Detach
            ]
        );
        assert!(released.iter().all(|r| r.result.is_ok()));
        assert!(!scratch.exists());
        assert!(host.attached().is_empty());
        assert!(stack.unwind(&mut host, &Reporter::new()).is_empty());
    }

    #[test]
    fn test_failure_does_not_stop_unwind() {
        let dir = TempDir::new().unwrap();
        let scratch = dir.path().join("scratch");
        fs::create_dir(&scratch).unwrap();
        fs::write(scratch.join("leftover"), b"guest data").unwrap();

        let mut host = MockHost::new();
        let device = LoopDevice::attach(&mut host, Path::new("image.raw")).unwrap();

        let mut stack = ReleaseStack::new();
        stack.push(Release::Detach(device));
        stack.push(Release::RemoveDir(scratch.clone()));

        let released = stack.unwind(&mut host, &Reporter::new());

        assert!(released[0].result.is_err());
        assert!(scratch.join("leftover").exists());
        assert!(released[1].result.is_ok());
        assert_eq!(host.count(|c| matches!(c, Call::Detach(_))), 1);
    }

    #[test]
    fn test_missing_dir_is_released() {
        let dir = TempDir::new().unwrap();
        let mut host = MockHost::new();

        let mut stack = ReleaseStack::new();
        stack.push(Release::RemoveDir(dir.path().join("never-created")));

        let released = stack.unwind(&mut host, &Reporter::new());
        assert!(released[0].result.is_ok());
    }
}
