use std::{
    fs::{self, File},
    io::{BufWriter, Write as _},
    path::{Path, PathBuf},
};

use log::{debug, info};
use reqwest::blocking::Client;
use types::ChosiError;
use url::Url;

/// Retrieves a remote file to a local path
pub(crate) trait Fetch {
    fn fetch(&self, url: &Url, dest: &Path) -> Result<(), ChosiError>;
}

#[derive(Debug, Default)]
pub(crate) struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(".part");

    PathBuf::from(name)
}

impl Fetch for HttpFetcher {
    fn fetch(&self, url: &Url, dest: &Path) -> Result<(), ChosiError> {
        debug!("Requesting {url}");

        let mut resp = self.client.get(url.clone()).send()?.error_for_status()?;

        // Stream into a side file so an interrupted download never passes
        // for a present image on the next run.
        let partial = partial_path(dest);
        let mut out = BufWriter::new(File::create(&partial)?);

        let written = resp.copy_to(&mut out)?;
        out.flush()?;
        out.into_inner()
            .map_err(|e| e.into_error())?
            .sync_all()?;

        debug!("Wrote {written} bytes to {}", partial.display());

        fs::rename(&partial, dest)?;
        Ok(())
    }
}

/// Makes sure the base image is available locally, downloading it only if
/// there's no file at `dest` yet.
///
/// Returns whether a download happened.
pub(crate) fn ensure_base_image<F: Fetch>(
    fetcher: &F,
    url: &Url,
    dest: &Path,
) -> Result<bool, ChosiError> {
    if dest.exists() {
        info!("{} found, skipping download", dest.display());
        return Ok(false);
    }

    info!("Downloading {url} to {}", dest.display());
    fetcher.fetch(url, dest)?;
    info!("Download succeeded");

    Ok(true)
}
