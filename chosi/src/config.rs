use std::{
    env, fs,
    path::{Path, PathBuf},
};

use log::debug;
use serde::Deserialize;
use types::{Architecture, ChosiError, ImageFormat};
use url::Url;

use crate::customize::CustomizationSpec;

const BASE_IMAGE_NAME: &str = "base.qcow2";
const RAW_IMAGE_STEM: &str = "image";

/// The configuration file, as written by the user
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct Config {
    /// Path to the cloud-init configuration document to inject
    pub(crate) cloudinit_config_path: PathBuf,

    /// Location of the base qcow2 image
    pub(crate) image_url: String,

    /// Local `.deb` artifacts to install in the guest
    pub(crate) extra_packages: Vec<PathBuf>,

    /// Names of the packages to purge from the guest
    pub(crate) remove_packages: Vec<String>,

    /// Kernel to regenerate the initrd and boot loader configuration for
    pub(crate) kernel_version: String,

    /// Encoding of the final image. Empty means raw.
    pub(crate) output_format: String,
}

impl Config {
    /// Loads the configuration from a file. Files with a `.toml` extension
    /// are parsed as TOML, everything else as JSON.
    pub(crate) fn from_path(path: &Path) -> Result<Self, ChosiError> {
        debug!("Loading configuration from {}", path.display());

        let content = fs::read_to_string(path)?;

        let cfg = if path.extension().is_some_and(|ext| ext == "toml") {
            toml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };

        Ok(cfg)
    }

    fn output_format(&self) -> Result<Option<ImageFormat>, ChosiError> {
        if self.output_format.is_empty() {
            return Ok(None);
        }

        match self.output_format.parse()? {
            ImageFormat::Raw => Ok(None),
            format => Ok(Some(format)),
        }
    }

    /// Validates the configuration and resolves it into the settings of a
    /// run targeting `arch`, with all images kept in `work_dir`.
    pub(crate) fn into_settings(
        self,
        arch: Architecture,
        work_dir: &Path,
    ) -> Result<Settings, ChosiError> {
        if self.image_url.is_empty() {
            return Err(ChosiError::Config(String::from("image_url missing")));
        }

        if self.cloudinit_config_path.as_os_str().is_empty() {
            return Err(ChosiError::Config(String::from(
                "cloudinit_config_path missing",
            )));
        }

        let image_url = Url::parse(&self.image_url)?;
        let output = self.output_format()?.map(|format| {
            let path = work_dir.join(format!("{RAW_IMAGE_STEM}.{}", format.extension()));

            (path, format)
        });

        let kernel_version = Some(self.kernel_version).filter(|v| !v.is_empty());

        Ok(Settings {
            image_url,
            base_image: work_dir.join(BASE_IMAGE_NAME),
            raw_image: work_dir.join(format!(
                "{RAW_IMAGE_STEM}.{}",
                ImageFormat::Raw.extension()
            )),
            output,
            arch,
            scratch_parent: env::temp_dir(),
            customization: CustomizationSpec {
                boot_config: self.cloudinit_config_path,
                remove_packages: self.remove_packages,
                install_packages: self.extra_packages,
                kernel_version,
            },
        })
    }
}

/// Everything a run needs, validated
#[derive(Debug)]
pub(crate) struct Settings {
    pub(crate) image_url: Url,

    /// Where the downloaded base image lives
    pub(crate) base_image: PathBuf,

    /// Where the decoded image being customized lives
    pub(crate) raw_image: PathBuf,

    /// Re-encoded image path and format, if one was requested
    pub(crate) output: Option<(PathBuf, ImageFormat)>,

    pub(crate) arch: Architecture,

    /// Directory the scratch mount point gets created in
    pub(crate) scratch_parent: PathBuf,

    pub(crate) customization: CustomizationSpec,
}

#[cfg(test)]
mod config_tests {
    use std::{fs, path::Path};

    use tempfile::TempDir;
    use test_log::test;
    use types::{Architecture, ChosiError, ImageFormat};

    use crate::config::Config;

    fn write(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_minimal_json() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "chosi.json",
            r#"{
                "cloudinit_config_path": "user-data.cfg",
                "image_url": "https://cloud-images.ubuntu.com/jammy/current/jammy-server-cloudimg-riscv64.img"
            }"#,
        );

        let settings = Config::from_path(&path)
            .unwrap()
            .into_settings(Architecture::Riscv64, Path::new("work"))
            .unwrap();

        assert_eq!(settings.image_url.host_str(), Some("cloud-images.ubuntu.com"));
        assert_eq!(settings.base_image, Path::new("work/base.qcow2"));
        assert_eq!(settings.raw_image, Path::new("work/image.raw"));
        assert!(settings.output.is_none());
        assert_eq!(settings.arch, Architecture::Riscv64);

        let spec = settings.customization;
        assert_eq!(spec.boot_config, Path::new("user-data.cfg"));
        assert!(spec.remove_packages.is_empty());
        assert!(spec.install_packages.is_empty());
        assert_eq!(spec.kernel_version, None);
    }

    #[test]
    fn test_full_toml() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "chosi.toml",
            r#"
cloudinit_config_path = "user-data.cfg"
image_url = "https://example.com/base.img"
extra_packages = ["linux-image-5.15.0-76-generic.deb", "firmware.deb"]
remove_packages = ["snapd"]
kernel_version = "5.15.0-76-generic"
output_format = "vhd"
"#,
        );

        let settings = Config::from_path(&path)
            .unwrap()
            .into_settings(Architecture::Amd64, Path::new("/srv/images"))
            .unwrap();

        assert_eq!(
            settings.output,
            Some((Path::new("/srv/images/image.vhd").to_path_buf(), ImageFormat::Vhd))
        );

        let spec = settings.customization;
        assert_eq!(spec.install_packages.len(), 2);
        assert_eq!(spec.remove_packages, vec![String::from("snapd")]);
        assert_eq!(spec.kernel_version.as_deref(), Some("5.15.0-76-generic"));
    }

    #[test]
    fn test_raw_output_means_no_reencode() {
        let cfg = Config {
            cloudinit_config_path: "user-data.cfg".into(),
            image_url: String::from("https://example.com/base.img"),
            output_format: String::from("raw"),
            ..Config::default()
        };

        let settings = cfg.into_settings(Architecture::Amd64, Path::new(".")).unwrap();
        assert!(settings.output.is_none());
    }

    #[test]
    fn test_missing_required_fields() {
        let err = Config {
            image_url: String::from("https://example.com/base.img"),
            ..Config::default()
        }
        .into_settings(Architecture::Amd64, Path::new("."))
        .unwrap_err();
        assert!(matches!(err, ChosiError::Config(ref msg) if msg.contains("cloudinit_config_path")));

        let err = Config {
            cloudinit_config_path: "user-data.cfg".into(),
            ..Config::default()
        }
        .into_settings(Architecture::Amd64, Path::new("."))
        .unwrap_err();
        assert!(matches!(err, ChosiError::Config(ref msg) if msg.contains("image_url")));
    }

    #[test]
    fn test_invalid_values() {
        let err = Config {
            cloudinit_config_path: "user-data.cfg".into(),
            image_url: String::from("not a url"),
            ..Config::default()
        }
        .into_settings(Architecture::Amd64, Path::new("."))
        .unwrap_err();
        assert!(matches!(err, ChosiError::Url(_)));

        let err = Config {
            cloudinit_config_path: "user-data.cfg".into(),
            image_url: String::from("https://example.com/base.img"),
            output_format: String::from("vmdk"),
            ..Config::default()
        }
        .into_settings(Architecture::Amd64, Path::new("."))
        .unwrap_err();
        assert!(matches!(err, ChosiError::Config(_)));
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "chosi.json",
            r#"{"image_url": "https://example.com/base.img", "extra_pakages": []}"#,
        );

        assert!(matches!(
            Config::from_path(&path).unwrap_err(),
            ChosiError::Json(_)
        ));
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();

        assert!(matches!(
            Config::from_path(&dir.path().join("absent.json")).unwrap_err(),
            ChosiError::Io(_)
        ));
    }
}
