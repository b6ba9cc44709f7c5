use std::{ffi::OsStr, fs, path::Path};

use log::{debug, info};
use serde::Deserialize;
use types::{ChosiError, ImageFormat};

use crate::host::Host;

const QEMU_IMG: &str = "qemu-img";

/// `qemu-img` creation options for a fixed-size VHD whose size is exactly the
/// input size, instead of the nearest CHS geometry.
const VHD_FIXED_OPTIONS: &str = "subformat=fixed,force_size";

#[derive(Debug, Deserialize)]
struct ImageInfo {
    #[serde(rename = "virtual-size")]
    virtual_size: u64,
}

fn conversion_error(step: impl Into<String>) -> impl FnOnce(ChosiError) -> ChosiError {
    let step = step.into();

    move |source| ChosiError::Conversion {
        step,
        source: Box::new(source),
    }
}

pub(crate) fn parse_virtual_size(info: &str) -> Result<u64, ChosiError> {
    let info: ImageInfo = serde_json::from_str(info)?;

    Ok(info.virtual_size)
}

fn virtual_size<H: Host>(host: &mut H, image: &Path, format: ImageFormat) -> Result<u64, ChosiError> {
    if format == ImageFormat::Raw {
        return Ok(fs::metadata(image)?.len());
    }

    let info = host.run(
        QEMU_IMG,
        &[
            OsStr::new("info"),
            OsStr::new("--output=json"),
            OsStr::new("-f"),
            OsStr::new(format.as_qemu_str()),
            image.as_os_str(),
        ],
    )?;

    parse_virtual_size(&info)
}

/// Returns the size a fixed-size VHD must be declared with to hold `size`
/// bytes: the next whole mebibyte.
pub(crate) fn vhd_size(size: u64) -> u64 {
    size::mib_ceil(size)
}

/// Grows the image to a mebibyte boundary, as a fixed-size VHD requires.
///
/// Returns the resulting size. An image that is already aligned is left
/// untouched.
pub(crate) fn resize_for_vhd<H: Host>(
    host: &mut H,
    image: &Path,
    format: ImageFormat,
) -> Result<u64, ChosiError> {
    let current = virtual_size(host, image, format)?;
    let aligned = vhd_size(current);

    if aligned == current {
        debug!(
            "{} is already aligned ({} MiB)",
            image.display(),
            size::div_round_up(current, size::MIB)
        );
        return Ok(current);
    }

    debug!(
        "Resizing {} from {current} to {aligned} bytes",
        image.display()
    );

    let aligned_str = aligned.to_string();
    host.run(
        QEMU_IMG,
        &[
            OsStr::new("resize"),
            OsStr::new("-f"),
            OsStr::new(format.as_qemu_str()),
            image.as_os_str(),
            OsStr::new(&aligned_str),
        ],
    )?;

    Ok(aligned)
}

/// Converts `input` into a new image at `output`.
///
/// When `remove_input` is set, the input image is deleted once the
/// conversion succeeded. Failing to delete it is an error too.
pub(crate) fn convert<H: Host>(
    host: &mut H,
    input: &Path,
    output: &Path,
    input_format: ImageFormat,
    output_format: ImageFormat,
    remove_input: bool,
) -> Result<(), ChosiError> {
    info!(
        "Converting {} ({input_format}) to {} ({output_format})",
        input.display(),
        output.display()
    );

    let mut args = vec![
        OsStr::new("convert"),
        OsStr::new("-f"),
        OsStr::new(input_format.as_qemu_str()),
        OsStr::new("-O"),
        OsStr::new(output_format.as_qemu_str()),
    ];

    if output_format == ImageFormat::Vhd {
        resize_for_vhd(host, input, input_format)
            .map_err(conversion_error(format!("resize {}", input.display())))?;

        args.extend([OsStr::new("-o"), OsStr::new(VHD_FIXED_OPTIONS)]);
    }

    args.extend([input.as_os_str(), output.as_os_str()]);

    host.run(QEMU_IMG, &args).map_err(conversion_error(format!(
        "convert {} to {output_format}",
        input.display()
    )))?;

    if remove_input {
        debug!("Removing {}", input.display());

        fs::remove_file(input)
            .map_err(ChosiError::from)
            .map_err(conversion_error(format!("remove {}", input.display())))?;
    }

    Ok(())
}
