//! `containai-install`: verified blue/green installer.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser;
use tracing::error;

use containai::config::{ContainaiConfig, Context};
use containai::integrity::audit::AuditLog;
use containai::kernel::SystemKernel;
use containai::logging::{self, LogFormat};
use containai::Channel;

use installer::bundle::HttpFetcher;
use installer::config::{InstallRequest, TrustPolicy};
use installer::install::{self, InstallDeps, InstallOutcome};
use installer::self_check::{self, RunningExecutable};

/// Install a verified ContainAI release.
#[derive(Parser)]
#[command(name = "containai-install", about, disable_version_flag = true)]
struct Cli {
    /// Release tag to install, e.g. `v1.4.0`.
    #[arg(long = "version", value_name = "TAG", required_unless_present_any = ["verify_only", "inject_self_hash"])]
    tag: Option<String>,

    /// GitHub `owner/repo` to download from.
    #[arg(long, env = "CONTAINAI_REPO")]
    repo: Option<String>,

    /// Directory holding the bundle or its loose members.
    #[arg(long)]
    asset_dir: Option<PathBuf>,

    /// Install root (default: configured install root).
    #[arg(long)]
    install_root: Option<PathBuf>,

    /// Release channel.
    #[arg(long, default_value = "prod")]
    channel: Channel,

    /// Only re-check the current release.
    #[arg(long)]
    verify_only: bool,

    /// Write the self-hash into a built installer (release pipeline).
    #[arg(long, value_name = "PATH", hide = true)]
    inject_self_hash: Option<PathBuf>,

    /// Emit diagnostic logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_cli(if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Text
    });
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "install failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    if let Some(path) = &cli.inject_self_hash {
        let digest = self_check::inject_self_hash(path)
            .with_context(|| format!("failed to inject self-hash into {}", path.display()))?;
        println!("{digest}");
        return Ok(());
    }

    let config = ContainaiConfig::load().context("failed to load configuration")?;
    let root = cli
        .install_root
        .clone()
        .unwrap_or_else(|| config.paths.install_root.clone());
    let kernel = SystemKernel::new(&config.kernel);
    let audit = AuditLog::from_config(&config.audit);
    let ctx = Context::new(root, cli.channel, config);

    if cli.verify_only {
        if let InstallOutcome::Verified { path, files } = install::verify_current(&ctx)? {
            println!("OK: {} ({files} files verified)", path.display());
        }
        return Ok(());
    }

    let tag = cli
        .tag
        .ok_or_else(|| anyhow::anyhow!("--version is required"))?;
    if cli.repo.is_none() && cli.asset_dir.is_none() {
        anyhow::bail!("--repo is required unless --asset-dir is given");
    }
    let mut request = InstallRequest::new(tag, cli.repo.unwrap_or_default());
    if let Some(dir) = cli.asset_dir {
        request = request.with_asset_dir(dir);
    }

    let fetcher = HttpFetcher::new()?;
    let trust = TrustPolicy::baked();
    let deps = InstallDeps {
        fetcher: &fetcher,
        kernel: &kernel,
        audit: &audit,
        self_integrity: &RunningExecutable,
        trust: &trust,
    };
    if let InstallOutcome::Installed {
        version,
        path,
        reused,
        attested,
    } = install::install(&ctx, &request, &deps)?
    {
        println!(
            "installed {version} at {}{}{}",
            path.display(),
            if reused { " (reused)" } else { "" },
            if attested { "" } else { " (unattested, dev channel)" }
        );
    }
    Ok(())
}
