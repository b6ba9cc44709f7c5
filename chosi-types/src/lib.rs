#![doc = include_str!("../README.md")]
#![allow(clippy::multiple_crate_versions)]

extern crate alloc;

use alloc::fmt;
use core::str::FromStr;
use std::{io, path::PathBuf};

/// Representation of the architecture of the guest image
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
#[clap(rename_all = "lower")]
pub enum Architecture {
    /// Intel's X86-64 Architecture
    #[default]
    Amd64,

    /// RISC-V 64-bit Architecture
    Riscv64,
}

/// Where an architecture's cloud images keep their partitions and boot
/// artifacts, and how their kernel expects to be started.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootLayout {
    /// Partition number of the root filesystem
    pub root_partition: u32,

    /// Partition number of the dedicated boot partition, if the kernel and
    /// initrd don't live on the root filesystem
    pub boot_partition: Option<u32>,

    /// Partition number of the EFI System Partition
    pub esp_partition: u32,

    /// Prefix of the kernel and initrd paths, relative to the filesystem the
    /// boot loader reads them from
    pub boot_prefix: &'static str,

    /// Kernel command line
    pub cmdline: &'static str,
}

const AMD64_LAYOUT: BootLayout = BootLayout {
    root_partition: 1,
    boot_partition: None,
    esp_partition: 15,
    boot_prefix: "boot/",
    cmdline: "root=LABEL=cloudimg-rootfs ro",
};

const RISCV64_LAYOUT: BootLayout = BootLayout {
    root_partition: 1,
    boot_partition: Some(16),
    esp_partition: 15,
    boot_prefix: "",
    cmdline: "root=/dev/vda1 rw console=ttyS0 earlycon",
};

impl Architecture {
    /// Returns the Debian architecture name
    #[must_use]
    pub fn as_debian_str(self) -> &'static str {
        match self {
            Self::Amd64 => "amd64",
            Self::Riscv64 => "riscv64",
        }
    }

    /// Returns the partition and boot layout of this architecture's images
    #[must_use]
    pub fn boot_layout(self) -> &'static BootLayout {
        match self {
            Self::Amd64 => &AMD64_LAYOUT,
            Self::Riscv64 => &RISCV64_LAYOUT,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_debian_str())
    }
}

/// Role of a partition in the guest mount tree
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionRole {
    /// Root filesystem, mounted first
    Root,

    /// Extended boot partition holding the kernel and initrd
    Boot,

    /// EFI System Partition
    Esp,
}

impl PartitionRole {
    /// Returns the mount point of the partition, relative to the guest root
    #[must_use]
    pub fn mount_point(self) -> &'static str {
        match self {
            Self::Root => "",
            Self::Boot => "boot",
            Self::Esp => "boot/efi",
        }
    }

    /// Returns the filesystem type the partition is formatted with
    #[must_use]
    pub fn fstype(self) -> &'static str {
        match self {
            Self::Root | Self::Boot => "ext4",
            Self::Esp => "vfat",
        }
    }
}

impl fmt::Display for PartitionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Root => "root",
            Self::Boot => "boot",
            Self::Esp => "esp",
        })
    }
}

impl BootLayout {
    /// Returns the partitions to mount, in mount order
    #[must_use]
    pub fn partitions(&self) -> Vec<(PartitionRole, u32)> {
        let mut parts = vec![(PartitionRole::Root, self.root_partition)];

        if let Some(boot) = self.boot_partition {
            parts.push((PartitionRole::Boot, boot));
        }

        parts.push((PartitionRole::Esp, self.esp_partition));
        parts
    }
}

/// Disk image encodings understood by the converter
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageFormat {
    /// Raw disk image
    Raw,

    /// QEMU Copy-On-Write v2
    Qcow2,

    /// Fixed-size Virtual Hard Disk
    Vhd,
}

impl ImageFormat {
    /// Returns the format name `qemu-img` expects
    #[must_use]
    pub fn as_qemu_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Qcow2 => "qcow2",
            Self::Vhd => "vpc",
        }
    }

    /// Returns the file extension used for images of this format
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Qcow2 => "qcow2",
            Self::Vhd => "vhd",
        }
    }
}

impl FromStr for ImageFormat {
    type Err = ChosiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "raw" => Self::Raw,
            "qcow2" => Self::Qcow2,
            "vhd" | "vpc" => Self::Vhd,
            _ => return Err(ChosiError::Config(format!("Unknown image format: {s}"))),
        })
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Guest customization stages, in execution order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CustomizationStage {
    /// Boot-time configuration injection
    ConfigInjection,

    /// Package removal
    PackageRemoval,

    /// Package installation
    PackageInstall,

    /// initrd and boot loader configuration regeneration
    BootSetup,
}

impl fmt::Display for CustomizationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ConfigInjection => "configuration injection",
            Self::PackageRemoval => "package removal",
            Self::PackageInstall => "package installation",
            Self::BootSetup => "boot setup",
        })
    }
}

/// Our Error Type
#[derive(thiserror::Error, Debug)]
pub enum ChosiError {
    /// The process lacks the privileges needed to attach and mount images
    #[error("Insufficient Privileges: {0}")]
    Privilege(String),

    /// The configuration is missing a field or has an invalid value
    #[error("Invalid Configuration: {0}")]
    Config(String),

    /// An error has occurred when downloading the base image
    #[error("Download Failure")]
    Download(#[from] reqwest::Error),

    /// A step of an image conversion has failed
    #[error("Couldn't {step}")]
    Conversion {
        /// Conversion step that failed
        step: String,

        /// Underlying failure
        #[source]
        source: Box<ChosiError>,
    },

    /// The image couldn't be bound to a loop device
    #[error("Couldn't attach {} to a loop device", image.display())]
    Attach {
        /// Image that was being attached
        image: PathBuf,

        /// Underlying failure
        #[source]
        source: io::Error,
    },

    /// The loop device couldn't be released
    #[error("Couldn't detach loop device {}", device.display())]
    Detach {
        /// Loop device path
        device: PathBuf,

        /// Underlying failure
        #[source]
        source: io::Error,
    },

    /// A partition couldn't be mounted
    #[error("Couldn't mount {role} partition {} on {}", device.display(), target.display())]
    Mount {
        /// Role of the partition in the mount tree
        role: PartitionRole,

        /// Partition device
        device: PathBuf,

        /// Mount point
        target: PathBuf,

        /// Underlying failure
        #[source]
        source: io::Error,
    },

    /// A kernel API filesystem couldn't be mounted in the guest
    #[error("Couldn't mount {fstype} on {}", target.display())]
    ApiFilesystem {
        /// Filesystem type, or `bind` for bind mounts
        fstype: &'static str,

        /// Mount point
        target: PathBuf,

        /// Underlying failure
        #[source]
        source: io::Error,
    },

    /// A mount point couldn't be unmounted
    #[error("Couldn't unmount {}", target.display())]
    Unmount {
        /// Mount point
        target: PathBuf,

        /// Underlying failure
        #[source]
        source: io::Error,
    },

    /// The boot-time configuration couldn't be copied into the guest
    #[error("Couldn't inject the boot-time configuration")]
    ConfigInjection(#[source] Box<ChosiError>),

    /// A package couldn't be purged from the guest
    #[error("Couldn't remove package {package}")]
    PackageRemoval {
        /// Package name
        package: String,

        /// Underlying failure
        #[source]
        source: Box<ChosiError>,
    },

    /// The package staging directory couldn't be created in the guest
    #[error("Couldn't prepare the package staging directory")]
    PackageStaging(#[source] Box<ChosiError>),

    /// A package artifact couldn't be staged or unpacked in the guest
    #[error("Couldn't install package {}", artifact.display())]
    PackageInstall {
        /// Path to the package artifact on the host
        artifact: PathBuf,

        /// Underlying failure
        #[source]
        source: Box<ChosiError>,
    },

    /// The initrd or the boot loader configuration couldn't be generated
    #[error("Couldn't set up boot artifacts for kernel {version}")]
    BootSetup {
        /// Kernel version
        version: String,

        /// Underlying failure
        #[source]
        source: Box<ChosiError>,
    },

    /// An external command has exited unsuccessfully
    #[error("Command {program} failed ({status}): {output}")]
    Command {
        /// Program name
        program: String,

        /// Exit status description
        status: String,

        /// Diagnostic output of the command
        output: String,
    },

    /// An error has occurred when accessing the local filesystem or files
    #[error("I/O Error")]
    Io(#[from] io::Error),

    /// An error has occurred when parsing JSON data
    #[error("JSON Parsing Failure")]
    Json(#[from] serde_json::Error),

    /// An error has occurred when parsing TOML configuration files
    #[error("Configuration File Format Error")]
    Toml(#[from] toml::de::Error),

    /// An error has occurred when parsing a URL
    #[error("Invalid URL")]
    Url(#[from] url::ParseError),
}

impl ChosiError {
    /// Returns the customization stage this error was raised from, if any
    #[must_use]
    pub fn customization_stage(&self) -> Option<CustomizationStage> {
        match self {
            Self::ConfigInjection(_) => Some(CustomizationStage::ConfigInjection),
            Self::PackageRemoval { .. } => Some(CustomizationStage::PackageRemoval),
            Self::PackageStaging(_) | Self::PackageInstall { .. } => {
                Some(CustomizationStage::PackageInstall)
            }
            Self::BootSetup { .. } => Some(CustomizationStage::BootSetup),
            Self::Privilege(_)
            | Self::Config(_)
            | Self::Download(_)
            | Self::Conversion { .. }
            | Self::Attach { .. }
            | Self::Detach { .. }
            | Self::Mount { .. }
            | Self::ApiFilesystem { .. }
            | Self::Unmount { .. }
            | Self::Command { .. }
            | Self::Io(_)
            | Self::Json(_)
            | Self::Toml(_)
            | Self::Url(_) => None,
        }
    }
}
