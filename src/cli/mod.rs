//! Command-line interface definitions for the `kiln` binary.
//!
//! The parser lives here so the build script can reuse it when generating
//! the manual page.

use clap::Parser;

/// Top-level CLI for the `kiln` binary.
///
/// Provider, broker, and timeout settings come from `kiln.toml` and the
/// `KILN_BUILD_*`, `KILN_NOTIFY_*`, `KILN_SSH_*`, and `SCW_*` environment
/// variables.
#[derive(Debug, Parser)]
#[command(
    name = "kiln",
    version,
    about = "Provision an ephemeral build host, run the build script, and tear it down"
)]
pub(crate) struct Cli {
    /// Render the provisioning script to standard output without touching
    /// any cloud resource.
    #[arg(long)]
    pub(crate) dry_run: bool,
}
