//! Command surface of the RelayCRM update runner.
//!
//! The `crmup` binary wires an upgrade package directory, a site
//! directory, and the registry database together and executes the
//! package through [`run_update`]. The library never terminates the
//! process; a failed run surfaces as [`RunStatus::Failed`] and the
//! binary maps it to a nonzero exit.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use relaycrm_update_core::{
    evaluate_run, format_rfc3339, now_utc, preflight, recurse_delete, render_failure_page,
    run_steps, FailureReport, HostLimits, PackageManifest, RunStatus, UpdateLogger, VersionMarker,
};
use relaycrm_update_store_sqlite::{SchemaImporter, SqliteCrmStore};

mod package;

#[derive(Debug, Parser)]
#[command(name = "crmup")]
#[command(about = "RelayCRM update runner")]
pub struct Cli {
    #[arg(long, default_value = "./relaycrm.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Execute an upgrade package against a site.
    Run(RunArgs),
    /// Check host limits without touching the site or the database.
    Preflight(LimitArgs),
    /// Show every recorded upgrade attempt.
    History,
    /// Show the currently recorded system version.
    Version,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Directory holding manifest.json, dbscheme/, data/ and
    /// config-templates/.
    #[arg(long)]
    package: PathBuf,

    /// Site root; the run log lands under cache/logs/.
    #[arg(long, default_value = ".")]
    site_dir: PathBuf,

    #[arg(long, default_value = "system")]
    actor: String,

    #[command(flatten)]
    limits: LimitArgs,
}

#[derive(Debug, Args)]
pub struct LimitArgs {
    /// Host execution time limit in seconds; 0 means unenforced.
    #[arg(long, default_value_t = 0)]
    max_execution_time: u64,

    /// Host input time limit in seconds; 0 means unenforced.
    #[arg(long, default_value_t = 0)]
    max_input_time: u64,
}

impl LimitArgs {
    fn host_limits(&self) -> HostLimits {
        HostLimits {
            max_execution_time: self.max_execution_time,
            max_input_time: self.max_input_time,
        }
    }
}

/// Everything a package step may touch during one run.
pub struct RunContext {
    pub store: SqliteCrmStore,
    pub importer: SchemaImporter,
    pub package_dir: PathBuf,
    pub site_dir: PathBuf,
    pub manifest: PackageManifest,
}

pub struct RunOptions {
    pub db: PathBuf,
    pub package_dir: PathBuf,
    pub site_dir: PathBuf,
    pub actor: String,
    pub limits: HostLimits,
}

/// Executes one upgrade package end to end and returns the gated outcome.
///
/// Preflight runs before the database is opened or the site is touched.
/// A fatal step fault and a clean pass with accumulated soft errors both
/// land on the same failure path: failure marker, forced target version,
/// cache teardown.
///
/// # Errors
/// Returns an error for infrastructure faults (unreadable package,
/// rejected preflight, database open failure); a gated run failure is
/// the `Ok(RunStatus::Failed)` value, not an error.
pub fn run_update(options: &RunOptions) -> Result<RunStatus> {
    let manifest = PackageManifest::load(&options.package_dir)?;
    preflight(&options.limits)?;

    let log_dir = options.site_dir.join("cache/logs");
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
    let updates_dir = options.site_dir.join("cache/updates");
    std::fs::create_dir_all(&updates_dir)
        .with_context(|| format!("failed to create work directory {}", updates_dir.display()))?;

    let mut logger = UpdateLogger::new(log_dir.join("update.log"));
    logger.log(&format!(
        "Update package: {} ({} -> {})",
        manifest.label, manifest.from_version, manifest.to_version
    ))?;

    let store = SqliteCrmStore::open(&options.db)?;
    store.ensure_base_schema()?;

    let mut ctx = RunContext {
        store,
        importer: SchemaImporter::new(),
        package_dir: options.package_dir.clone(),
        site_dir: options.site_dir.clone(),
        manifest,
    };

    if let Err(err) = run_steps(&mut ctx, &mut logger, package::main_steps(), flush_importer) {
        let report = fault_report(&ctx, &logger, &err);
        return finalize_failure(&mut ctx, &mut logger, options, report);
    }
    if let Err(err) = run_steps(
        &mut ctx,
        &mut logger,
        package::post_update_steps(),
        flush_importer,
    ) {
        let report = fault_report(&ctx, &logger, &err);
        return finalize_failure(&mut ctx, &mut logger, options, report);
    }

    ctx.importer.flush_logs(&mut logger)?;

    match evaluate_run(logger.errors(), ctx.importer.logs()) {
        RunStatus::Completed => {
            let marker = VersionMarker::for_run(&ctx.manifest, &options.actor, true);
            ctx.store.insert_version_marker(&marker)?;
            ctx.store
                .set_current_version(&ctx.manifest.to_version, now_utc())?;
            logger.log(&format!("Update completed: {}", ctx.manifest.to_version))?;
            Ok(RunStatus::Completed)
        }
        RunStatus::Failed(report) => finalize_failure(&mut ctx, &mut logger, options, report),
    }
}

fn flush_importer(ctx: &mut RunContext, logger: &mut UpdateLogger) {
    // Best effort; the fault that brought us here is the one to surface.
    let _ = ctx.importer.flush_logs(logger);
}

fn fault_report(ctx: &RunContext, logger: &UpdateLogger, err: &anyhow::Error) -> FailureReport {
    let mut errors = logger.errors().to_vec();
    errors.push(format!("  [ERROR] {err:#}"));
    FailureReport {
        errors,
        import_log: ctx.importer.logs().to_string(),
    }
}

fn finalize_failure(
    ctx: &mut RunContext,
    logger: &mut UpdateLogger,
    options: &RunOptions,
    report: FailureReport,
) -> Result<RunStatus> {
    let marker = VersionMarker::for_run(&ctx.manifest, &options.actor, false);
    ctx.store.insert_version_marker(&marker)?;
    ctx.store
        .set_current_version(&ctx.manifest.to_version, now_utc())?;
    recurse_delete(&ctx.site_dir.join("cache/updates"))?;
    recurse_delete(&ctx.site_dir.join("cache/templates_c"))?;
    ctx.store.clear_cache_table()?;
    logger.log(&format!("Update failed: {}", ctx.manifest.label))?;
    Ok(RunStatus::Failed(report))
}

pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => {
            let options = RunOptions {
                db: cli.db,
                package_dir: args.package,
                site_dir: args.site_dir.clone(),
                actor: args.actor,
                limits: args.limits.host_limits(),
            };
            match run_update(&options)? {
                RunStatus::Completed => {
                    println!("update completed");
                    Ok(())
                }
                RunStatus::Failed(report) => {
                    println!("{}", render_failure_page(&report));
                    Err(anyhow!(
                        "update failed, see {}",
                        args.site_dir.join("cache/logs/update.log").display()
                    ))
                }
            }
        }
        Command::Preflight(limits) => {
            preflight(&limits.host_limits())?;
            println!("preflight: ok");
            Ok(())
        }
        Command::History => {
            let store = SqliteCrmStore::open(&cli.db)?;
            store.ensure_base_schema()?;
            for marker in store.version_history()? {
                println!(
                    "{} {} {} -> {} {} ({})",
                    format_rfc3339(marker.time)?,
                    if marker.result { "ok " } else { "FAIL" },
                    marker.from_version,
                    marker.to_version,
                    marker.label,
                    marker.actor,
                );
            }
            Ok(())
        }
        Command::Version => {
            let store = SqliteCrmStore::open(&cli.db)?;
            store.ensure_base_schema()?;
            match store.current_version()? {
                Some(version) => println!("{version}"),
                None => println!("no recorded version"),
            }
            Ok(())
        }
    }
}
