use std::{ffi::OsStr, fs, path::Path};

use log::{debug, info};
use types::{BootLayout, ChosiError};

use crate::{customize::chroot, guest::guest_path, host::Host};

/// Location of the boot loader configuration in the guest
pub(crate) const EXTLINUX_CONF_PATH: &str = "/boot/extlinux/extlinux.conf";

const EXTLINUX_TEMPLATE: &str = "\
default chosi
timeout 0

label chosi
\tkernel /{kernel}
\tinitrd /{initrd}
\tappend {cmdline}
";

/// A boot entry for a given kernel, laid out for a given architecture
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct BootEntry {
    pub(crate) kernel: String,
    pub(crate) initrd: String,
    pub(crate) cmdline: String,
}

impl BootEntry {
    pub(crate) fn new(layout: &BootLayout, version: &str) -> Self {
        Self {
            kernel: format!("{}vmlinuz-{version}", layout.boot_prefix),
            initrd: format!("{}initrd.img-{version}", layout.boot_prefix),
            cmdline: layout.cmdline.to_owned(),
        }
    }

    pub(crate) fn render(&self) -> String {
        EXTLINUX_TEMPLATE
            .replace("{kernel}", &self.kernel)
            .replace("{initrd}", &self.initrd)
            .replace("{cmdline}", &self.cmdline)
    }
}

fn update_initramfs<H: Host>(
    host: &mut H,
    root: &Path,
    version: &str,
) -> Result<(), ChosiError> {
    let existing = guest_path(root, Path::new(&format!("/boot/initrd.img-{version}")))?;
    let mode = if existing.exists() { "-u" } else { "-c" };

    debug!("Running update-initramfs {mode} for kernel {version}");

    chroot(
        host,
        root,
        &[
            OsStr::new("update-initramfs"),
            OsStr::new(mode),
            OsStr::new("-k"),
            OsStr::new(version),
        ],
    )?;

    Ok(())
}

fn write_boot_config(root: &Path, entry: &BootEntry) -> Result<(), ChosiError> {
    let path = guest_path(root, Path::new(EXTLINUX_CONF_PATH))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    debug!("Writing boot loader configuration to {}", path.display());
    fs::write(&path, entry.render())?;

    Ok(())
}

/// Regenerates the initrd of the kernel `version` inside the guest, then
/// points the boot loader at it.
pub(crate) fn regenerate_boot<H: Host>(
    host: &mut H,
    root: &Path,
    layout: &BootLayout,
    version: &str,
) -> Result<(), ChosiError> {
    info!("Setting up boot for kernel {version}");

    let setup_error = |source| ChosiError::BootSetup {
        version: version.to_owned(),
        source: Box::new(source),
    };

    update_initramfs(host, root, version).map_err(setup_error)?;
    write_boot_config(root, &BootEntry::new(layout, version)).map_err(setup_error)?;

    Ok(())
}
