use std::{
    ffi::{OsStr, OsString},
    fs, io,
    os::unix::ffi::OsStringExt as _,
    path::{Path, PathBuf},
    process::Command,
};

use log::{debug, trace};
use loopdev::{LoopControl, LoopDevice};
use sys_mount::{Mount, MountFlags, UnmountFlags};
use types::ChosiError;

const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// How a source gets attached to a mount point
#[derive(Clone, Copy, Debug)]
pub(crate) enum MountKind {
    Filesystem(&'static str),
    Bind,
}

/// The privileged operations we perform on the host.
///
/// Every side effect outside of plain file I/O goes through this trait, so
/// that the sequencing and cleanup logic can be exercised without root.
pub(crate) trait Host {
    /// Binds the image to the next free loop device, with partition scanning
    /// enabled, and returns the device path.
    fn attach_loop(&mut self, image: &Path) -> Result<PathBuf, ChosiError>;

    fn detach_loop(&mut self, device: &Path) -> Result<(), ChosiError>;

    fn mount(&mut self, source: &Path, target: &Path, kind: MountKind) -> Result<(), io::Error>;

    /// Unmounts a single mount point. Busy mount points must be reported, not
    /// lazily detached.
    fn unmount(&mut self, target: &Path) -> Result<(), io::Error>;

    /// Returns the active mount points, in the order they were mounted.
    fn active_mounts(&self) -> Result<Vec<PathBuf>, io::Error>;

    /// Runs a program to completion and returns its standard output.
    fn run(&mut self, program: &str, args: &[&OsStr]) -> Result<String, ChosiError>;
}

#[derive(Debug, Default)]
pub(crate) struct SystemHost;

impl Host for SystemHost {
    fn attach_loop(&mut self, image: &Path) -> Result<PathBuf, ChosiError> {
        let attach = || -> Result<PathBuf, io::Error> {
            let ctrl = LoopControl::open()?;
            let loop_device = ctrl.next_free()?;

            let path = loop_device.path().ok_or(io::Error::new(
                io::ErrorKind::NotFound,
                "Loop Device File Not Found",
            ))?;

            debug!("Using loop device {}", path.display());

            loop_device.with().part_scan(true).attach(image)?;

            Ok(path)
        };

        attach().map_err(|source| ChosiError::Attach {
            image: image.to_path_buf(),
            source,
        })
    }

    fn detach_loop(&mut self, device: &Path) -> Result<(), ChosiError> {
        LoopDevice::open(device)
            .and_then(|dev| dev.detach())
            .map_err(|source| ChosiError::Detach {
                device: device.to_path_buf(),
                source,
            })
    }

    fn mount(&mut self, source: &Path, target: &Path, kind: MountKind) -> Result<(), io::Error> {
        let builder = Mount::builder();
        let builder = match kind {
            MountKind::Filesystem(fstype) => builder.fstype(fstype),
            MountKind::Bind => builder.flags(MountFlags::BIND),
        };

        builder.mount(source, target)?;

        trace!("Mount Successful");
        Ok(())
    }

    fn unmount(&mut self, target: &Path) -> Result<(), io::Error> {
        sys_mount::unmount(target, UnmountFlags::empty())
    }

    fn active_mounts(&self) -> Result<Vec<PathBuf>, io::Error> {
        let content = fs::read_to_string(MOUNTINFO_PATH)?;

        Ok(parse_mountinfo(&content))
    }

    fn run(&mut self, program: &str, args: &[&OsStr]) -> Result<String, ChosiError> {
        trace!(
            "Running '{program} {}'",
            args.join(OsStr::new(" ")).to_string_lossy()
        );

        let output = Command::new(program).args(args).output()?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        for line in stdout.lines().chain(stderr.lines()) {
            trace!(target: program, "{line}");
        }

        if !output.status.success() {
            let diagnostic = if stderr.trim().is_empty() {
                stdout
            } else {
                stderr
            };

            return Err(ChosiError::Command {
                program: program.to_owned(),
                status: output.status.to_string(),
                output: diagnostic.trim().to_owned(),
            });
        }

        Ok(stdout)
    }
}

fn unescape_mountinfo(field: &str) -> PathBuf {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());

    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'\\' && idx + 3 < bytes.len() {
            let octal = &bytes[idx + 1..idx + 4];

            if octal.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let val = octal
                    .iter()
                    .fold(0_u16, |acc, b| (acc << 3) | u16::from(b - b'0'));

                if let Ok(val) = u8::try_from(val) {
                    out.push(val);
                    idx += 4;
                    continue;
                }
            }
        }

        out.push(bytes[idx]);
        idx += 1;
    }

    PathBuf::from(OsString::from_vec(out))
}

/// Extracts the mount points out of a `mountinfo` table, preserving order.
pub(crate) fn parse_mountinfo(content: &str) -> Vec<PathBuf> {
    content
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .map(unescape_mountinfo)
        .collect()
}
