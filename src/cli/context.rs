use std::path::{Path, PathBuf};
use std::sync::Arc;

use pdfpipe::AppConfig;

use super::output::OutputFormat;

pub struct CliContext {
    config: Arc<AppConfig>,
    config_path: PathBuf,
    from_file: bool,
    format: OutputFormat,
}

impl CliContext {
    pub fn new(config: AppConfig, config_path: PathBuf, from_file: bool, format: OutputFormat) -> Self {
        Self {
            config: Arc::new(config),
            config_path,
            from_file,
            format,
        }
    }

    pub fn config(&self) -> &AppConfig {
        self.config.as_ref()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// False when the config path did not exist and defaults are in use.
    pub fn config_from_file(&self) -> bool {
        self.from_file
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }
}
