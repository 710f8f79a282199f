use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use quarry_client::{ReqwestTransport, ThrottleConfig, ThrottledTransport};
use quarry_core::traits::Transport;
use quarry_core::{Cache, FetchResult, MemoryStore, Scheduler, SchedulerConfig, TracingStatsSink};

#[derive(Parser)]
#[command(name = "quarry", version, about = "Priority-scheduled polite fetcher")]
struct Cli {
    /// URLs to fetch, in priority order (earlier arguments fetch first)
    urls: Vec<String>,

    /// File with one URL per line, appended after positional URLs
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Site host that relative URLs are anchored to
    /// (defaults to the host of the first absolute URL)
    #[arg(short, long, env = "QUARRY_SITE")]
    site: Option<String>,

    /// Maximum number of simultaneous fetches
    #[arg(short, long, default_value_t = 6)]
    concurrency: usize,

    /// Per-fetch deadline in seconds
    #[arg(short, long, default_value_t = 20)]
    timeout_secs: u64,

    /// Bypass the response cache entirely
    #[arg(long, default_value_t = false)]
    no_cache: bool,

    /// Minimum delay between requests to the same domain, in milliseconds
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    /// Random jitter added on top of --delay-ms, in milliseconds
    #[arg(long, default_value_t = 0)]
    jitter_ms: u64,

    /// Session header sent with every request, as "Name: Value".
    /// Repeat for multiple headers (e.g. --header "Cookie: session-id=...")
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Directory to write fetched bodies into (one file per URL);
    /// bodies are discarded when omitted
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// User-Agent header
    #[arg(long, env = "QUARRY_USER_AGENT", default_value = "Quarry/0.1")]
    user_agent: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("quarry=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut urls = cli.urls.clone();
    if let Some(path) = &cli.input {
        let listing = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read URL list: {}", path.display()))?;
        urls.extend(
            listing
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string),
        );
    }
    if urls.is_empty() {
        bail!("no URLs given; pass them as arguments or via --input");
    }

    let site = match &cli.site {
        Some(site) => site.clone(),
        None => derive_site(&urls)?,
    };

    if let Some(dir) = &cli.out {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create output directory: {}", dir.display()))?;
    }

    let transport = build_transport(&cli)?;
    let config = SchedulerConfig::for_site(&site)
        .with_concurrency(cli.concurrency)
        .with_request_timeout(Duration::from_secs(cli.timeout_secs));

    if cli.delay_ms > 0 {
        let throttle = ThrottleConfig::new(Duration::from_millis(cli.delay_ms))
            .with_jitter(Duration::from_millis(cli.jitter_ms));
        run(&cli, &urls, ThrottledTransport::new(transport, throttle), config).await
    } else {
        run(&cli, &urls, transport, config).await
    }
}

async fn run<X>(cli: &Cli, urls: &[String], transport: X, config: SchedulerConfig) -> Result<()>
where
    X: Transport + 'static,
{
    let cache = Cache::new("fetches", MemoryStore::new());
    let scheduler = Scheduler::new(cache, transport, config);
    scheduler.publish_statistics(TracingStatsSink);

    tracing::info!(urls = urls.len(), "starting fetch session");

    // Argument order is the priority order: earlier URLs outrank later
    // ones when more are queued than can run at once.
    let fetches = urls.iter().enumerate().map(|(i, url)| {
        let scheduler = scheduler.clone();
        async move {
            let result = scheduler
                .schedule_fetch(
                    url,
                    |response| Ok(response.body.clone()),
                    &format!("{i:05}"),
                    cli.no_cache,
                    url,
                )
                .await;
            (i, url.clone(), result)
        }
    });
    let results = futures::future::join_all(fetches).await;

    let mut fetched = 0usize;
    let mut failed = 0usize;
    for (i, url, result) in results {
        match result {
            Ok(FetchResult { query, result: body }) => {
                fetched += 1;
                if let Some(dir) = &cli.out {
                    let path = dir.join(format!("{i:05}.html"));
                    std::fs::write(&path, &body)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    tracing::info!(url = %query, path = %path.display(), bytes = body.len(), "saved");
                } else {
                    tracing::info!(url = %query, bytes = body.len(), "fetched");
                }
            }
            Err(err) => {
                failed += 1;
                tracing::error!(url = %url, error = %err, "fetch failed");
            }
        }
    }

    let stats = scheduler.statistics();
    println!("{}", serde_json::to_string_pretty(&stats)?);

    if failed > 0 {
        bail!("{failed} of {} fetches failed", fetched + failed);
    }
    Ok(())
}

/// Derive the anchor site from the first absolute URL.
fn derive_site(urls: &[String]) -> Result<String> {
    for candidate in urls {
        if let Ok(parsed) = url::Url::parse(candidate) {
            if let Some(host) = parsed.host_str() {
                return Ok(host.to_string());
            }
        }
    }
    bail!("no absolute URL to derive the site from; pass --site")
}

fn build_transport(cli: &Cli) -> Result<ReqwestTransport> {
    let mut builder = ReqwestTransport::builder()
        .user_agent(&cli.user_agent)
        // The scheduler applies the real per-fetch deadline; the client
        // timeout is a backstop for stalled connections.
        .timeout(Duration::from_secs(cli.timeout_secs.saturating_mul(2)));
    for header in &cli.headers {
        let (name, value) = header
            .split_once(':')
            .with_context(|| format!("malformed header {header:?}; expected \"Name: Value\""))?;
        builder = builder
            .header(name.trim(), value.trim())
            .map_err(|e| anyhow::anyhow!(e))?;
    }
    builder.build().map_err(|e| anyhow::anyhow!(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_derived_from_first_absolute_url() {
        let urls = vec![
            "/orders".to_string(),
            "https://www.shop.example/orders?page=2".to_string(),
        ];
        assert_eq!(derive_site(&urls).unwrap(), "www.shop.example");
    }

    #[test]
    fn site_derivation_fails_without_absolute_urls() {
        let urls = vec!["/orders".to_string()];
        assert!(derive_site(&urls).is_err());
    }
}
