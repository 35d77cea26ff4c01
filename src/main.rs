//! ContainAI host CLI.
//!
//! Provides `generate`, `enforce`, `gate` and `integrity-check` for
//! rendering channel profiles, loading them into the kernel, checking them
//! before a container launch and verifying an installed release tree.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use containai::config::{ContainaiConfig, Context};
use containai::gate::Verdict;
use containai::integrity::audit::AuditLog;
use containai::integrity::{self, IntegrityPolicy, IntegrityReport, SUMS_FILE};
use containai::kernel::SystemKernel;
use containai::logging::{self, LogFormat};
use containai::profiles::generator;
use containai::{enforcer, gate, Channel};

/// ContainAI host-side sandbox policy tooling.
#[derive(Parser)]
#[command(name = "containai", version, about)]
struct Cli {
    /// Emit diagnostic logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Render channel-suffixed profiles and their manifest from templates.
    Generate {
        /// Directory holding `apparmor/` and `seccomp/` templates.
        #[arg(long)]
        templates: PathBuf,
        /// Output directory (default: `<install root>/host/profiles`).
        #[arg(long)]
        out: Option<PathBuf>,
        /// Channel to render for.
        #[arg(long)]
        channel: Channel,
    },
    /// Install and load a channel's profiles (requires root).
    Enforce {
        /// Install root containing `host/profiles`.
        install_root: PathBuf,
        /// Channel to enforce.
        channel: Channel,
    },
    /// Check profiles before a container launch.
    Gate {
        /// Release root (default: `<install root>/current`).
        #[arg(long)]
        root: Option<PathBuf>,
        /// Channel to check.
        #[arg(long)]
        channel: Channel,
        /// Print the report as JSON on stdout.
        #[arg(long)]
        json: bool,
    },
    /// Verify a release tree against its SHA256SUMS.
    IntegrityCheck {
        /// Release tree to check.
        #[arg(long)]
        root: PathBuf,
        /// Sums file (default: `<root>/SHA256SUMS`).
        #[arg(long)]
        sums: Option<PathBuf>,
        /// Channel of the tree.
        #[arg(long, default_value = "prod")]
        channel: Channel,
        /// Treat a missing sums file as fatal on every channel.
        #[arg(long)]
        strict: bool,
    },
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    logging::init_cli(if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Text
    });
    let config = ContainaiConfig::load().context("failed to load configuration")?;

    match cli.command {
        Command::Generate {
            templates,
            out,
            channel,
        } => handle_generate(&config, &templates, out, channel),
        Command::Enforce {
            install_root,
            channel,
        } => handle_enforce(config, install_root, channel),
        Command::Gate {
            root,
            channel,
            json,
        } => handle_gate(config, root, channel, json),
        Command::IntegrityCheck {
            root,
            sums,
            channel,
            strict,
        } => handle_integrity_check(&config, &root, sums, channel, strict),
    }
}

fn handle_generate(
    config: &ContainaiConfig,
    templates: &std::path::Path,
    out: Option<PathBuf>,
    channel: Channel,
) -> anyhow::Result<ExitCode> {
    let out = out.unwrap_or_else(|| {
        config
            .paths
            .install_root
            .join(containai::profiles::PROFILES_SUBDIR)
    });
    let set = generator::generate(templates, &out, channel)
        .with_context(|| format!("failed to generate {channel} profiles"))?;
    for artifact in &set.artifacts {
        println!("{}  {}", artifact.sha256, artifact.path.display());
    }
    println!("manifest: {}", set.manifest_path.display());
    Ok(ExitCode::SUCCESS)
}

fn handle_enforce(
    config: ContainaiConfig,
    install_root: PathBuf,
    channel: Channel,
) -> anyhow::Result<ExitCode> {
    let kernel = SystemKernel::new(&config.kernel);
    let audit = AuditLog::from_config(&config.audit);
    let ctx = Context::new(install_root, channel, config);

    let report = enforcer::enforce(&ctx, &kernel)
        .with_context(|| format!("failed to enforce {channel} profiles"))?;
    audit.record(
        "enforce",
        serde_json::json!({
            "channel": channel,
            "root": ctx.install_root().display().to_string(),
            "loaded": report.loaded_count(),
            "unchanged": report.unchanged_count(),
        }),
    );
    println!(
        "{channel}: {} profiles enforced ({} loaded, {} unchanged)",
        report.profiles.len(),
        report.loaded_count(),
        report.unchanged_count()
    );
    Ok(ExitCode::SUCCESS)
}

fn handle_gate(
    config: ContainaiConfig,
    root: Option<PathBuf>,
    channel: Channel,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let kernel = SystemKernel::new(&config.kernel);
    let root = root.unwrap_or_else(|| config.paths.install_root.join("current"));
    let ctx = Context::new(root, channel, config);

    let report = gate::check(&ctx, &kernel);
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to serialize gate report")?
        );
    } else {
        for check in &report.checks {
            println!("{:?}\t{}\t{}", check.verdict, check.file, check.reason);
        }
        println!("overall: {:?}", report.verdict);
    }
    if !report.platform_supported {
        warn!("AppArmor unavailable; AppArmor profiles could not be checked");
    }

    if report.verdict == Verdict::Fail {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn handle_integrity_check(
    config: &ContainaiConfig,
    root: &std::path::Path,
    sums: Option<PathBuf>,
    channel: Channel,
    strict: bool,
) -> anyhow::Result<ExitCode> {
    let sums = sums.unwrap_or_else(|| root.join(SUMS_FILE));
    let policy = if strict {
        IntegrityPolicy::strict(channel)
    } else {
        IntegrityPolicy {
            channel,
            allow_missing_sums_on_dev: config.integrity.allow_missing_sums_on_dev,
        }
    };
    match integrity::verify_tree(root, &sums, policy)
        .with_context(|| format!("integrity check of {} failed", root.display()))?
    {
        IntegrityReport::Verified { files } => {
            info!(files, "release tree verified");
            println!("OK: {files} files verified");
        }
        IntegrityReport::SumsMissingTolerated => {
            println!("WARN: {} missing; nothing verified", sums.display());
        }
    }
    Ok(ExitCode::SUCCESS)
}
