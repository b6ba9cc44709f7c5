use std::path::{Path, PathBuf};

use log::debug;
use types::ChosiError;

use crate::host::Host;

/// A raw image bound to a host loop device.
///
/// Detaching consumes the device, so it can only ever be released once.
#[derive(Debug)]
pub(crate) struct LoopDevice {
    path: PathBuf,
    image: PathBuf,
}

impl LoopDevice {
    pub(crate) fn attach<H: Host>(host: &mut H, image: &Path) -> Result<Self, ChosiError> {
        let path = host.attach_loop(image)?;

        debug!("Attached {} to {}", image.display(), path.display());

        Ok(Self {
            path,
            image: image.to_path_buf(),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn detach<H: Host>(self, host: &mut H) -> Result<(), ChosiError> {
        debug!(
            "Detaching {} from {}",
            self.image.display(),
            self.path.display()
        );

        host.detach_loop(&self.path)?;

        debug!("Loop device detached");
        Ok(())
    }
}

/// Returns the device node of a partition of a loop device, e.g.
/// `/dev/loop0p15`
pub(crate) fn partition_device(device: &Path, number: u32) -> PathBuf {
    let mut name = device.as_os_str().to_os_string();
    name.push(format!("p{number}"));

    PathBuf::from(name)
}
