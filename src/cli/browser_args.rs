use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Args;
use pdfpipe::config::parse_timeout;
use pdfpipe::{BrowserOptions, WaitStrategy};

/// Per-invocation overrides of the configured browser options.
#[derive(Args, Clone, Debug, Default)]
pub struct BrowserArgs {
    /// Readiness conditions, comma separated: load, network-idle, js-variable
    #[arg(long, value_name = "LIST", value_parser = WaitStrategy::parse_list)]
    pub wait: Option<WaitStrategy>,

    /// Expression polled by the js-variable condition
    #[arg(long, value_name = "EXPR")]
    pub wait_variable: Option<String>,

    /// Value the js-variable expression must produce
    #[arg(long = "wait-value", value_name = "VALUE")]
    pub wait_variable_value: Option<String>,

    /// Readiness deadline in milliseconds, or "none"
    #[arg(long, value_name = "MS|none")]
    pub timeout_ms: Option<String>,

    /// Chromium binary to launch
    #[arg(long, value_name = "PATH")]
    pub chromium: Option<PathBuf>,

    /// Upper bound on concurrent prints
    #[arg(long, value_name = "N")]
    pub max_renders: Option<usize>,
}

impl BrowserArgs {
    pub fn apply(&self, options: &mut BrowserOptions) -> Result<()> {
        if let Some(wait) = self.wait {
            options.wait_strategy = wait;
        }
        if let Some(expr) = &self.wait_variable {
            options.wait_variable = Some(expr.clone());
            if self.wait.is_none() {
                options.wait_strategy |= WaitStrategy::JAVASCRIPT_VARIABLE;
            }
        }
        if let Some(value) = &self.wait_variable_value {
            options.wait_variable_value = Some(value.clone());
        }
        if let Some(raw) = &self.timeout_ms {
            options.wait_timeout_ms =
                parse_timeout(raw).map_err(|reason| anyhow!("--timeout-ms: {reason}"))?;
        }
        if let Some(path) = &self.chromium {
            options.binary_path = Some(path.clone());
        }
        if let Some(max) = self.max_renders {
            options.max_concurrent_renders = max;
        }

        if options.wait_strategy.contains(WaitStrategy::JAVASCRIPT_VARIABLE)
            && options.wait_variable.is_none()
        {
            return Err(anyhow!(
                "the js-variable wait condition needs --wait-variable (or browser.wait_variable)"
            ));
        }
        Ok(())
    }

    pub fn browser_options(&self, base: &BrowserOptions) -> Result<BrowserOptions> {
        let mut options = base.clone();
        self.apply(&mut options)?;
        Ok(options)
    }
}
