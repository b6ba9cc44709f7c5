use core::fmt;

use log::{log, Level};

/// Logs on behalf of the pipeline, tagging every message with the context
/// accumulated so far (image, loop device, mount point).
#[derive(Clone, Debug, Default)]
pub(crate) struct Reporter {
    fields: Vec<(&'static str, String)>,
}

impl Reporter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns a reporter carrying one more piece of context. A key that is
    /// already present gets its value replaced.
    #[must_use]
    pub(crate) fn with(&self, key: &'static str, value: impl fmt::Display) -> Self {
        let mut fields = self.fields.clone();
        let value = value.to_string();

        if let Some(field) = fields.iter_mut().find(|(k, _)| *k == key) {
            field.1 = value;
        } else {
            fields.push((key, value));
        }

        Self { fields }
    }

    fn context(&self) -> String {
        self.fields
            .iter()
            .map(|(k, v)| format!(" {k}={v}"))
            .collect()
    }

    fn emit(&self, level: Level, msg: impl fmt::Display) {
        log!(level, "{msg}{}", self.context());
    }

    pub(crate) fn debug(&self, msg: impl fmt::Display) {
        self.emit(Level::Debug, msg);
    }

    pub(crate) fn info(&self, msg: impl fmt::Display) {
        self.emit(Level::Info, msg);
    }

    pub(crate) fn warn(&self, msg: impl fmt::Display) {
        self.emit(Level::Warn, msg);
    }

    pub(crate) fn error(&self, msg: impl fmt::Display) {
        self.emit(Level::Error, msg);
    }
}
