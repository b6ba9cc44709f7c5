use core::fmt;
use std::path::{Path, PathBuf};

use types::{ChosiError, ImageFormat};

use crate::{
    config::Settings,
    convert::convert,
    customize::customize,
    download::{ensure_base_image, Fetch},
    host::Host,
    loopdev::LoopDevice,
    mount::mount_partitions,
    report::Reporter,
    unwind::{Release, ReleaseKind, ReleaseStack},
};

const SCRATCH_PREFIX: &str = "chosi-mount-";

/// Steps of a run that can fail, each with its own exit code
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Stage {
    Download,
    Decode,
    Attach,
    MountDir,
    Mount,
    Customize,
    Unmount,
    Detach,
    RemoveScratch,
    Reencode,
}

impl Stage {
    pub(crate) fn exit_code(self) -> u8 {
        match self {
            Self::Download => 4,
            Self::Decode | Self::Reencode => 5,
            Self::Attach => 6,
            Self::MountDir => 7,
            Self::Mount => 8,
            Self::Customize => 9,
            Self::Unmount => 10,
            Self::Detach => 11,
            Self::RemoveScratch => 12,
        }
    }
}

impl From<ReleaseKind> for Stage {
    fn from(kind: ReleaseKind) -> Self {
        match kind {
            ReleaseKind::Detach => Self::Detach,
            ReleaseKind::RemoveDir => Self::RemoveScratch,
            ReleaseKind::Unmount => Self::Unmount,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Download => "download",
            Self::Decode => "conversion to raw",
            Self::Attach => "loop device attach",
            Self::MountDir => "mount directory creation",
            Self::Mount => "mount",
            Self::Customize => "customization",
            Self::Unmount => "unmount",
            Self::Detach => "loop device detach",
            Self::RemoveScratch => "mount directory removal",
            Self::Reencode => "re-encoding",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    Idle,
    ImageReady,
    Attached,
    Mounted,
    Customized,
    Unmounted,
    Detached,
    Reencoded,
    Done,
    Failed(Stage),
}

#[derive(Debug)]
pub(crate) struct Failure {
    pub(crate) stage: Stage,
    pub(crate) error: ChosiError,
}

#[derive(Debug)]
pub(crate) enum PipelineOutcome {
    Success,
    Failed {
        failure: Failure,

        /// Release failures that happened while unwinding after `failure`
        secondary: Vec<Failure>,
    },
}

impl PipelineOutcome {
    pub(crate) fn exit_code(&self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failed { failure, .. } => failure.stage.exit_code(),
        }
    }
}

fn failed(stage: Stage) -> impl FnOnce(ChosiError) -> Failure {
    move |error| Failure { stage, error }
}

/// Drives a single customization run, from the download of the base image
/// to the optional re-encoding of the customized one.
#[derive(Debug)]
pub(crate) struct Pipeline<'a> {
    settings: &'a Settings,
    reporter: Reporter,
    state: State,
    history: Vec<State>,
    releases: ReleaseStack,
}

impl<'a> Pipeline<'a> {
    pub(crate) fn new(settings: &'a Settings, reporter: Reporter) -> Self {
        Self {
            settings,
            reporter,
            state: State::Idle,
            history: vec![State::Idle],
            releases: ReleaseStack::new(),
        }
    }

    pub(crate) fn state(&self) -> State {
        self.state
    }

    /// Every state the pipeline went through, in order
    pub(crate) fn history(&self) -> &[State] {
        &self.history
    }

    fn transition(&mut self, next: State) {
        if let State::Failed(_) = self.state {
            return;
        }

        self.reporter.debug(format_args!("{:?} -> {next:?}", self.state));
        self.state = next;
        self.history.push(next);
    }

    fn prepare_image<F: Fetch, H: Host>(
        &mut self,
        host: &mut H,
        fetcher: &F,
    ) -> Result<(), Failure> {
        let settings = self.settings;

        ensure_base_image(fetcher, &settings.image_url, &settings.base_image)
            .map_err(failed(Stage::Download))?;

        convert(
            host,
            &settings.base_image,
            &settings.raw_image,
            ImageFormat::Qcow2,
            ImageFormat::Raw,
            false,
        )
        .map_err(failed(Stage::Decode))?;

        self.reporter = self.reporter.with("image", settings.raw_image.display());
        self.reporter.info("Image converted to raw");
        self.transition(State::ImageReady);

        Ok(())
    }

    fn attach<H: Host>(&mut self, host: &mut H) -> Result<PathBuf, Failure> {
        let device =
            LoopDevice::attach(host, &self.settings.raw_image).map_err(failed(Stage::Attach))?;
        let path = device.path().to_path_buf();

        self.releases.push(Release::Detach(device));
        self.reporter = self.reporter.with("device", path.display());
        self.reporter.info("Image attached to loop device");
        self.transition(State::Attached);

        Ok(path)
    }

    fn create_mount_dir(&mut self) -> Result<PathBuf, Failure> {
        let dir = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .keep(true)
            .tempdir_in(&self.settings.scratch_parent)
            .map_err(ChosiError::from)
            .map_err(failed(Stage::MountDir))?;
        let path = dir.path().to_path_buf();

        self.releases.push(Release::RemoveDir(path.clone()));
        self.reporter = self.reporter.with("mount", path.display());

        Ok(path)
    }

    fn mount_and_customize<H: Host>(
        &mut self,
        host: &mut H,
        device: &Path,
    ) -> Result<(), Failure> {
        let layout = self.settings.arch.boot_layout();
        let root = self.create_mount_dir()?;

        self.releases.push(Release::Unmount(root.clone()));
        mount_partitions(host, device, &root, layout).map_err(failed(Stage::Mount))?;
        self.reporter.info("Image mounted");
        self.transition(State::Mounted);

        let stages = customize(
            host,
            &root,
            &self.settings.customization,
            layout,
            &self.reporter,
        )
        .map_err(failed(Stage::Customize))?;

        self.reporter
            .info(format_args!("Image customization done ({} stages)", stages.len()));
        self.transition(State::Customized);

        Ok(())
    }

    fn acquire_and_customize<F: Fetch, H: Host>(
        &mut self,
        host: &mut H,
        fetcher: &F,
    ) -> Result<(), Failure> {
        self.prepare_image(host, fetcher)?;
        let device = self.attach(host)?;
        self.mount_and_customize(host, &device)
    }

    /// Runs every pending release and returns the ones that failed
    fn release<H: Host>(&mut self, host: &mut H) -> Vec<Failure> {
        let mut failures = Vec::new();

        for released in self.releases.unwind(host, &self.reporter) {
            match released.result {
                Ok(()) => match released.kind {
                    ReleaseKind::Unmount => self.transition(State::Unmounted),
                    ReleaseKind::Detach => self.transition(State::Detached),
                    ReleaseKind::RemoveDir => {}
                },
                Err(error) => failures.push(Failure {
                    stage: released.kind.into(),
                    error,
                }),
            }
        }

        failures
    }

    fn reencode<H: Host>(&mut self, host: &mut H) -> Result<(), Failure> {
        let settings = self.settings;
        let Some((output, format)) = &settings.output else {
            return Ok(());
        };

        convert(
            host,
            &settings.raw_image,
            output,
            ImageFormat::Raw,
            *format,
            true,
        )
        .map_err(failed(Stage::Reencode))?;

        self.reporter
            .info(format_args!("Image re-encoded to {}", output.display()));
        self.transition(State::Reencoded);

        Ok(())
    }

    fn fail(&mut self, failure: Failure, secondary: Vec<Failure>) -> PipelineOutcome {
        self.transition(State::Failed(failure.stage));
        PipelineOutcome::Failed { failure, secondary }
    }

    /// Runs the whole pipeline.
    ///
    /// Whatever got acquired is released in reverse order, whether the
    /// customization succeeded or not. Release failures only become the
    /// outcome of the run if nothing failed before them.
    pub(crate) fn run<F: Fetch, H: Host>(&mut self, host: &mut H, fetcher: &F) -> PipelineOutcome {
        let primary = self.acquire_and_customize(host, fetcher);

        // Releases after a failure don't move the state machine anymore.
        if let Err(failure) = &primary {
            self.reporter
                .warn(format_args!("{} failed, releasing resources", failure.stage));
            self.transition(State::Failed(failure.stage));
        }

        let mut secondary = self.release(host);

        if let Err(failure) = primary {
            return self.fail(failure, secondary);
        }

        if !secondary.is_empty() {
            let failure = secondary.remove(0);
            return self.fail(failure, secondary);
        }

        if let Err(failure) = self.reencode(host) {
            return self.fail(failure, Vec::new());
        }

        self.transition(State::Done);
        PipelineOutcome::Success
    }
}
