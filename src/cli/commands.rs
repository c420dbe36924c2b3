use clap::Subcommand;

use super::config::ConfigArgs;
use super::info::InfoArgs;
use super::render::RenderArgs;
use super::sign::SignArgs;

#[derive(Subcommand, Clone)]
pub enum Commands {
    /// Render an HTML file to PDF
    Render(RenderArgs),

    /// Sign the signature areas of an HTML page or an existing PDF
    Sign(SignArgs),

    /// Show the Chromium binary, its version and host resources
    Info(InfoArgs),

    /// Inspect the effective configuration
    Config(ConfigArgs),
}
