//! Command-line host for the Nganya Groove offline asset cache.
//!
//! Installs and activates the configured worker version, then serves each
//! URL given on the command line through it.
//!
//! ## Usage
//!
//! ```bash
//! # Precache the deployed manifest into memory and fetch two pages
//! nganya-host / /gal/index.html
//!
//! # Use a config file with disk storage and JSON logs
//! nganya-host --config worker.json --log-format json https://nganya.example/
//! ```

use clap::Parser;
use nganya_common::{
    init_logging, LogConfig, LogFormat, LoaderSettings, LoggingSettings, WorkerConfig,
};
use nganya_net::{LoaderConfig, NetError, Request, ResourceLoader, Url};
use nganya_sw::{
    CacheError, CacheManager, CacheStorage, CacheStore, DiskCacheStorage, FetchResponse,
    HostHandle, PrecacheManifest, ServiceWorkerHost, WorkerVersion,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "nganya-host")]
#[command(about = "Run the Nganya Groove offline asset cache")]
struct Cli {
    /// Worker configuration file (JSON); defaults to the deployed site
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Activate without waiting for clients to detach
    #[arg(long)]
    skip_waiting: bool,

    /// Log output format (pretty, compact, json)
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Debug logging with source locations and span events
    #[arg(short, long)]
    verbose: bool,

    /// URLs to fetch once active; relative URLs resolve against the origin
    urls: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => WorkerConfig::load(path)?,
        None => WorkerConfig::default(),
    };

    init_logging(log_config(&cli, &config.logging))?;

    let origin = config.origin_url()?;
    let manifest = PrecacheManifest::resolve(&origin, config.precache.as_slice())?;
    let version = WorkerVersion::new(config.cache_name.clone(), manifest);

    let loader = ResourceLoader::new(loader_config(&config.loader))?;
    let store: Arc<dyn CacheStore> = match &config.storage_dir {
        Some(dir) => Arc::new(DiskCacheStorage::open(dir).await?),
        None => Arc::new(CacheStorage::new()),
    };

    let (manager, mut events) = CacheManager::new(store, Arc::new(loader));
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            debug!(?event, "Worker event");
        }
    });
    manager.restore().await?;

    let (host, _task) = ServiceWorkerHost::spawn(Arc::new(manager), 64);

    let report = run(&host, version, cli.skip_waiting, &origin, &cli.urls).await;
    for (target, result) in &report.fetched {
        match result {
            Ok(response) => println!("{}", describe(target, response)),
            Err(e) => eprintln!("{target}: {e}"),
        }
    }

    if report.failed() > 0 {
        std::process::exit(1);
    }

    Ok(())
}

/// Outcome of one install / activate / fetch pass.
struct Report {
    /// Why the new version is not serving, if it is not.
    lifecycle_error: Option<CacheError>,
    fetched: Vec<(String, Result<FetchResponse, CacheError>)>,
}

impl Report {
    fn failed(&self) -> usize {
        usize::from(self.lifecycle_error.is_some())
            + self.fetched.iter().filter(|(_, r)| r.is_err()).count()
    }
}

/// Install and activate `version`, then fetch every target.
///
/// A failed install or activation does not stop the fetches: they are served
/// by whatever generation is still active, or by the network.
async fn run(
    host: &HostHandle,
    version: WorkerVersion,
    skip_waiting: bool,
    origin: &Url,
    targets: &[String],
) -> Report {
    let lifecycle = async {
        host.install(version).await?;
        if skip_waiting {
            host.skip_waiting().await
        } else {
            host.activate().await
        }
    };

    let lifecycle_error = match lifecycle.await {
        Ok(outcome) => {
            info!(?outcome, "Activation settled");
            None
        }
        Err(e) => {
            warn!(error = %e, "New version not activated; serving from the previous cache");
            Some(e)
        }
    };

    let mut fetched = Vec::with_capacity(targets.len());
    for target in targets {
        fetched.push((target.clone(), fetch(host, origin, target).await));
    }

    Report {
        lifecycle_error,
        fetched,
    }
}

fn log_config(cli: &Cli, settings: &LoggingSettings) -> LogConfig {
    let mut config = if cli.verbose {
        LogConfig {
            filter: settings.filter.clone(),
            format: settings.format,
            ..LogConfig::debug()
        }
    } else {
        LogConfig::from_settings(settings)
    };
    if let Some(format) = cli.log_format {
        config.format = format;
    }
    config
}

fn loader_config(settings: &LoaderSettings) -> LoaderConfig {
    LoaderConfig {
        user_agent: settings.user_agent.clone(),
        default_timeout: settings.timeout_secs.map(Duration::from_secs),
        max_redirects: settings.max_redirects,
        ..Default::default()
    }
}

/// Resolve `target` against the origin.
fn resolve(origin: &Url, target: &str) -> Result<Url, NetError> {
    origin
        .join(target)
        .map_err(|e| NetError::InvalidUrl(format!("{target}: {e}")))
}

async fn fetch(host: &HostHandle, origin: &Url, target: &str) -> Result<FetchResponse, CacheError> {
    let url = resolve(origin, target).map_err(CacheError::FetchPath)?;
    host.fetch(Request::get(url)).await
}

/// One output line: status, source, body length, URL.
fn describe(target: &str, response: &FetchResponse) -> String {
    let source = if response.from_cache { "cache" } else { "network" };
    format!(
        "{} {:<7} {:>8} bytes  {}",
        response.status.as_u16(),
        source,
        response.body.len(),
        target
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};
    use nganya_net::{Fetcher, Response};
    use nganya_sw::CacheEntry;
    use tracing::Level;

    struct Offline;

    #[async_trait]
    impl Fetcher for Offline {
        async fn fetch(&self, request: Request) -> Result<Response, NetError> {
            Err(NetError::RequestFailed(format!("offline: {}", request.url)))
        }
    }

    /// Host over a store whose active generation `v1` holds the home page.
    async fn restored_host() -> HostHandle {
        let store = Arc::new(CacheStorage::new());
        let home = CacheEntry {
            url: "https://nganya.example/".to_string(),
            method: "GET".to_string(),
            status: 200,
            headers: vec![("content-type".to_string(), b"text/html".to_vec())],
            body: b"<html></html>".to_vec(),
            cached_at: 0,
        };
        store.put_all("v1", vec![home]).await.unwrap();
        store.set_active("v1").await.unwrap();

        let (manager, _events) = CacheManager::new(store, Arc::new(Offline));
        manager.restore().await.unwrap();
        ServiceWorkerHost::spawn(Arc::new(manager), 8).0
    }

    fn next_version() -> WorkerVersion {
        let manifest = PrecacheManifest::resolve(&origin(), &["/", "/gal/home.css"]).unwrap();
        WorkerVersion::new("v2", manifest)
    }

    #[tokio::test]
    async fn test_failed_install_still_serves_targets() {
        let host = restored_host().await;
        let targets = vec!["/".to_string(), "/gal/booking/".to_string()];

        let report = run(&host, next_version(), false, &origin(), &targets).await;

        assert!(matches!(
            report.lifecycle_error,
            Some(CacheError::InstallFetch { .. })
        ));
        assert_eq!(report.fetched.len(), 2);

        let (target, home) = &report.fetched[0];
        assert_eq!(target, "/");
        let home = home.as_ref().unwrap();
        assert!(home.from_cache);
        assert_eq!(&home.body[..], b"<html></html>");

        assert!(matches!(
            report.fetched[1].1,
            Err(CacheError::FetchPath(NetError::RequestFailed(_)))
        ));
        assert_eq!(report.failed(), 2);
    }

    #[tokio::test]
    async fn test_failed_install_without_targets_still_fails() {
        let host = restored_host().await;
        let report = run(&host, next_version(), true, &origin(), &[]).await;

        assert!(report.fetched.is_empty());
        assert_eq!(report.failed(), 1);
    }

    #[test]
    fn test_verbose_selects_debug_logging() {
        let cli = Cli::parse_from(["nganya-host", "-v", "--log-format", "compact"]);
        let config = log_config(&cli, &LoggingSettings::default());

        assert_eq!(config.level, Level::DEBUG);
        assert!(config.include_span_events);
        assert!(config.include_location);
        assert_eq!(config.format, LogFormat::Compact);
    }

    #[test]
    fn test_log_config_follows_settings() {
        let cli = Cli::parse_from(["nganya-host"]);
        let settings = LoggingSettings {
            level: "warn".to_string(),
            ..Default::default()
        };
        let config = log_config(&cli, &settings);

        assert_eq!(config.level, Level::WARN);
        assert!(!config.include_span_events);
        assert_eq!(config.format, LogFormat::Pretty);
    }

    fn origin() -> Url {
        Url::parse("https://nganya.example/").unwrap()
    }

    #[test]
    fn test_cli_parses_flags_and_urls() {
        let cli = Cli::parse_from([
            "nganya-host",
            "--config",
            "worker.json",
            "--skip-waiting",
            "--log-format",
            "json",
            "/",
            "/gal/index.html",
        ]);

        assert_eq!(cli.config, Some(PathBuf::from("worker.json")));
        assert!(cli.skip_waiting);
        assert_eq!(cli.log_format, Some(LogFormat::Json));
        assert_eq!(cli.urls, vec!["/", "/gal/index.html"]);
    }

    #[test]
    fn test_cli_rejects_unknown_log_format() {
        assert!(Cli::try_parse_from(["nganya-host", "--log-format", "xml"]).is_err());
    }

    #[test]
    fn test_resolve_relative_and_absolute() {
        assert_eq!(
            resolve(&origin(), "/gal/home.css").unwrap().as_str(),
            "https://nganya.example/gal/home.css"
        );
        assert_eq!(
            resolve(&origin(), "https://fonts.googleapis.com/css2").unwrap().as_str(),
            "https://fonts.googleapis.com/css2"
        );
    }

    #[test]
    fn test_loader_config_from_settings() {
        let settings = LoaderSettings {
            timeout_secs: Some(5),
            ..Default::default()
        };
        let config = loader_config(&settings);
        assert_eq!(config.default_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.max_redirects, 10);
        assert_eq!(config.user_agent, settings.user_agent);
    }

    #[test]
    fn test_describe() {
        let response = FetchResponse {
            url: "https://nganya.example/".to_string(),
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"<html></html>"),
            from_cache: true,
        };

        assert_eq!(describe("/", &response), "200 cache         13 bytes  /");
    }
}
