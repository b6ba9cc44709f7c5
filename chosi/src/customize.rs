use std::{
    ffi::OsStr,
    fs, io,
    path::{Path, PathBuf},
};

use log::{debug, trace};
use types::{BootLayout, ChosiError, CustomizationStage};

use crate::{bootloader::regenerate_boot, guest::guest_path, host::Host, report::Reporter};

/// Where the boot-time configuration document lands in the guest
pub(crate) const GUEST_CONFIG_PATH: &str = "/etc/cloud/cloud.cfg.d/chosi.cfg";

const GUEST_STAGING_PARENT: &str = "/tmp";
const STAGING_PREFIX: &str = "chosi-";

/// What to change in the guest
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct CustomizationSpec {
    /// Host path of the boot-time configuration document
    pub(crate) boot_config: PathBuf,

    /// Packages to purge, in order
    pub(crate) remove_packages: Vec<String>,

    /// Host paths of the package artifacts to unpack, in order
    pub(crate) install_packages: Vec<PathBuf>,

    pub(crate) kernel_version: Option<String>,
}

/// Runs a command with its root switched to the guest
pub(crate) fn chroot<H: Host>(
    host: &mut H,
    root: &Path,
    args: &[&OsStr],
) -> Result<String, ChosiError> {
    let mut chroot_args = Vec::with_capacity(args.len() + 1);
    chroot_args.push(root.as_os_str());
    chroot_args.extend_from_slice(args);

    host.run("chroot", &chroot_args)
}

fn inject_config(root: &Path, source: &Path) -> Result<(), ChosiError> {
    let inject = || -> Result<(), ChosiError> {
        let target = guest_path(root, Path::new(GUEST_CONFIG_PATH))?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        debug!("Copying {} to {}", source.display(), target.display());
        fs::copy(source, &target)?;

        Ok(())
    };

    inject().map_err(|e| ChosiError::ConfigInjection(Box::new(e)))
}

fn remove_packages<H: Host>(
    host: &mut H,
    root: &Path,
    packages: &[String],
) -> Result<(), ChosiError> {
    for package in packages {
        debug!("Purging {package}");

        chroot(
            host,
            root,
            &[OsStr::new("dpkg"), OsStr::new("--purge"), OsStr::new(package)],
        )
        .map_err(|e| ChosiError::PackageRemoval {
            package: package.clone(),
            source: Box::new(e),
        })?;
    }

    Ok(())
}

fn install_error(artifact: &Path) -> impl FnOnce(ChosiError) -> ChosiError + '_ {
    move |e| ChosiError::PackageInstall {
        artifact: artifact.to_path_buf(),
        source: Box::new(e),
    }
}

fn artifact_name(artifact: &Path) -> Result<&OsStr, ChosiError> {
    artifact.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} isn't a file path", artifact.display()),
        )
        .into()
    })
}

fn unpack<H: Host>(
    host: &mut H,
    root: &Path,
    guest_staging: &Path,
    artifact: &Path,
) -> Result<(), ChosiError> {
    let guest_artifact = guest_staging.join(artifact_name(artifact)?);

    debug!("Unpacking {}", guest_artifact.display());
    chroot(
        host,
        root,
        &[
            OsStr::new("dpkg"),
            OsStr::new("--unpack"),
            guest_artifact.as_os_str(),
        ],
    )?;

    Ok(())
}

/// Copies every artifact into `staging`, then unpacks them one by one,
/// stopping at the first failure.
fn stage_and_unpack<H: Host>(
    host: &mut H,
    root: &Path,
    staging: &Path,
    guest_staging: &Path,
    artifacts: &[PathBuf],
) -> Result<(), ChosiError> {
    for artifact in artifacts {
        let stage = || -> Result<(), ChosiError> {
            let dest = staging.join(artifact_name(artifact)?);

            trace!("Staging {} as {}", artifact.display(), dest.display());
            fs::copy(artifact, &dest)?;

            Ok(())
        };

        stage().map_err(install_error(artifact))?;
    }

    for artifact in artifacts {
        unpack(host, root, guest_staging, artifact).map_err(install_error(artifact))?;
    }

    Ok(())
}

fn install_packages<H: Host>(
    host: &mut H,
    root: &Path,
    artifacts: &[PathBuf],
    reporter: &Reporter,
) -> Result<(), ChosiError> {
    let staging_error = |e: ChosiError| ChosiError::PackageStaging(Box::new(e));

    let parent = guest_path(root, Path::new(GUEST_STAGING_PARENT))
        .map_err(|e| staging_error(e.into()))?;
    fs::create_dir_all(&parent).map_err(|e| staging_error(e.into()))?;

    let staging = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempdir_in(&parent)
        .map_err(|e| staging_error(e.into()))?;

    let guest_staging = Path::new(GUEST_STAGING_PARENT).join(
        staging
            .path()
            .file_name()
            .ok_or_else(|| staging_error(io::Error::from(io::ErrorKind::InvalidInput).into()))?,
    );

    reporter.debug(format_args!(
        "Staging {} packages in {}",
        artifacts.len(),
        guest_staging.display()
    ));

    let res = stage_and_unpack(host, root, staging.path(), &guest_staging, artifacts);
    let closed = staging.close();

    match (res, closed) {
        (Err(e), Err(close)) => {
            reporter.warn(format_args!("Couldn't remove the staging directory: {close}"));
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(()), Err(close)) => Err(staging_error(close.into())),
        (Ok(()), Ok(())) => Ok(()),
    }
}

/// Applies the customization stages to the guest mounted at `root`, in
/// order, stopping at the first failing one.
///
/// Returns the stages that ran. Configuration injection always runs, the
/// others only when they have something to do.
pub(crate) fn customize<H: Host>(
    host: &mut H,
    root: &Path,
    spec: &CustomizationSpec,
    layout: &BootLayout,
    reporter: &Reporter,
) -> Result<Vec<CustomizationStage>, ChosiError> {
    let mut done = Vec::new();

    reporter.info(CustomizationStage::ConfigInjection);
    inject_config(root, &spec.boot_config)?;
    done.push(CustomizationStage::ConfigInjection);

    if !spec.remove_packages.is_empty() {
        reporter.info(CustomizationStage::PackageRemoval);
        remove_packages(host, root, &spec.remove_packages)?;
        done.push(CustomizationStage::PackageRemoval);
    }

    if !spec.install_packages.is_empty() {
        reporter.info(CustomizationStage::PackageInstall);
        install_packages(host, root, &spec.install_packages, reporter)?;
        done.push(CustomizationStage::PackageInstall);
    }

    if let Some(version) = &spec.kernel_version {
        reporter.info(CustomizationStage::BootSetup);
        regenerate_boot(host, root, layout, version)?;
        done.push(CustomizationStage::BootSetup);
    }

    Ok(done)
}
