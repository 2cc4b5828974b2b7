//! Site-Mirror main entry point
//!
//! This is the command-line interface for the Site-Mirror website mirroring engine.

use anyhow::{Context, Result};
use clap::Parser;
use site_mirror::config::{load_config_with_hash, Config, SessionOptions};
use site_mirror::crawler::{Mirror, ReqwestTransport, TracingObserver};
use site_mirror::output::{print_filter_analysis, print_statistics};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use url::Url;

/// Number of URLs listed per decision in the filter analysis
const ANALYSIS_LIMIT: usize = 25;

/// Site-Mirror: a recursive website mirroring engine
///
/// Site-Mirror downloads a website into a local directory, rewriting every
/// link so that the copy can be browsed offline. URLs rejected by the filter
/// stay linked to the live site.
#[derive(Parser, Debug)]
#[command(name = "site-mirror")]
#[command(version)]
#[command(about = "Mirror a website into a local directory", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Validate config and show the effective session without mirroring
    #[arg(long)]
    dry_run: bool,

    /// Remove the local and temp directories before starting
    #[arg(long)]
    clean: bool,

    /// Additional URL to mirror besides the configured entry (repeatable)
    #[arg(long = "url", value_name = "URL")]
    urls: Vec<Url>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    // Load and validate configuration
    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", hash);

    let mut options = config
        .session_options()
        .context("invalid session configuration")?;
    if cli.clean {
        options.clean_local = true;
    }

    if cli.dry_run {
        handle_dry_run(&config, &options, &cli.urls);
        return Ok(());
    }

    handle_mirror(options, &cli.urls).await
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("site_mirror=info,warn"),
            1 => EnvFilter::new("site_mirror=debug,info"),
            2 => EnvFilter::new("site_mirror=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: shows the effective session
fn handle_dry_run(config: &Config, options: &SessionOptions, extra: &[Url]) {
    println!("=== Site-Mirror Dry Run ===\n");

    println!("Project:");
    println!("  Entry URL: {}", options.entry);
    println!("  Local path: {}", options.local_path.display());
    println!("  Temp dir: {}", options.temp_dir.display());
    println!("  Clean before start: {}", options.clean_local);
    println!("  Default index: {}", options.default_index);
    println!(
        "  Aggressive URL sanitation: {}",
        options.aggressive_url_sanitation
    );
    println!("  Prioritize assets: {}", options.prioritize_assets);

    println!("\nFetching:");
    println!("  User agent: {}", options.user_agent);
    if let Some(proxy) = &options.proxy {
        println!("  Proxy: {}", proxy);
    }
    println!("  Max retries: {}", options.max_retries);
    println!("  Header timeout: {:?}", options.timeout_to_headers);
    println!("  Download timeout: {:?}", options.timeout_to_download);
    println!(
        "  Pacing: {:?} + up to {:?}",
        options.base_wait, options.random_wait
    );

    println!("\nFiles:");
    println!("  Skip existing: {}", options.skip_existing);
    if options.skip_existing {
        let mut excluded: Vec<_> = options.skip_existing_exclusion.iter().collect();
        excluded.sort();
        for mime in excluded {
            println!("    except {}", mime);
        }
    }
    println!("  Link redirects: {}", options.link_redirects);

    if config.filter.is_empty() {
        println!("\nFilter: same host as {}", options.entry);
    } else {
        println!("\nFilter Rules ({}):", config.filter.len());
        for rule in &config.filter {
            println!("  - {:?}", rule);
        }
    }

    if !config.mime.is_empty() {
        println!("\nExtra MIME Types ({}):", config.mime.len());
        for definition in &config.mime {
            println!("  - {} ({})", definition.mime, definition.extensions.join(", "));
        }
    }

    if !extra.is_empty() {
        println!("\nAdditional URLs ({}):", extra.len());
        for url in extra {
            println!("  * {}", url);
        }
    }

    println!("\n✓ Configuration is valid");
}

/// Handles the main mirror operation
async fn handle_mirror(options: SessionOptions, extra: &[Url]) -> Result<()> {
    let transport = ReqwestTransport::new(&options.user_agent, options.proxy.as_deref())
        .context("failed to build HTTP client")?;
    let mirror = Mirror::new(options, Arc::new(transport), Arc::new(TracingObserver));

    let interrupted = mirror.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupted.stop();
        }
    });

    mirror.start().await.context("failed to start mirror")?;
    for url in extra {
        mirror
            .add_url(url, None)
            .await
            .with_context(|| format!("failed to add {}", url))?;
    }
    let completed = mirror.process_queue().await;

    println!();
    print_statistics(&mirror.stats());
    println!();
    print_filter_analysis(&mirror.filter_analysis(), ANALYSIS_LIMIT);

    if completed {
        tracing::info!("Mirror completed successfully");
    } else {
        tracing::warn!("Mirror ended before the queue was empty");
    }
    Ok(())
}
