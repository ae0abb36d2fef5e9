//! HTTP client for the plugin registry.
//!
//! Endpoints, relative to the configured base URL:
//!
//! ```text
//! GET /plugins/search?q=…        → {"plugins": [PluginMetadata]}
//! GET /plugins/{name}            → PluginMetadata (latest)
//! GET /plugins/{name}/{version}  → PluginMetadata
//! GET /plugins/{name}/versions   → {"versions": ["1.0.0", …]}
//! GET /plugins/{name}/{version}/download → gzip tarball
//! GET /stats                     → RegistryStats
//! GET /health                    → {"status": "ok"}
//! ```
//!
//! Failures are surfaced as-is. Nothing here retries: a registry outage must
//! be visible to the caller.

use crate::config::PluginConfig;
use crate::error::{PluginError, Result};
use crate::paths;
use crate::types::{
    PluginMetadata, RegistryHealth, RegistryStats, SearchFilters, SortKey, SortOrder,
};
use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    plugins: Vec<PluginMetadata>,
}

#[derive(Debug, Deserialize)]
struct VersionsResponse {
    #[serde(default)]
    versions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedSearch {
    fetched_at: DateTime<Utc>,
    plugins: Vec<PluginMetadata>,
}

// ---------------------------------------------------------------------------
// RegistryClient
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RegistryClient {
    base_url: String,
    http: Client,
    timeout: Duration,
    api_key: Option<String>,
    search_cache_dir: PathBuf,
    search_ttl: Duration,
}

impl RegistryClient {
    pub fn new(config: &PluginConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("xaheen-plugins/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PluginError::Network {
                url: config.registry_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            base_url: config.registry_url.trim_end_matches('/').to_string(),
            http,
            timeout: config.timeout,
            api_key: config.api_key.clone(),
            search_cache_dir: paths::search_cache_dir(&config.cache_dir),
            search_ttl: config.search_cache_ttl,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Issue a GET and turn transport failures and non-success statuses into
    /// typed errors. `what` names the resource for 404 messages.
    fn get(&self, path: &str, query: &[(&str, String)], what: &str) -> Result<Response> {
        let url = self.url(path);
        tracing::debug!(%url, "registry request");
        let mut req = self.http.get(&url).query(query);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().map_err(|e| self.transport_error(e))?;
        match resp.status() {
            s if s.is_success() => Ok(resp),
            StatusCode::NOT_FOUND => Err(PluginError::NotFound(what.to_string())),
            s => Err(PluginError::RegistryResponse {
                status: s.as_u16(),
                url,
            }),
        }
    }

    fn transport_error(&self, e: reqwest::Error) -> PluginError {
        if e.is_timeout() {
            PluginError::Timeout {
                url: self.base_url.clone(),
                secs: self.timeout.as_secs(),
            }
        } else {
            PluginError::Network {
                url: self.base_url.clone(),
                reason: error_chain(&e),
            }
        }
    }

    fn read_bytes(&self, resp: Response) -> Result<Vec<u8>> {
        resp.bytes()
            .map(|b| b.to_vec())
            .map_err(|e| self.transport_error(e))
    }

    fn read_json<T: serde::de::DeserializeOwned>(&self, resp: Response) -> Result<T> {
        let body = self.read_bytes(resp)?;
        Ok(serde_json::from_slice(&body)?)
    }

    // -----------------------------------------------------------------------
    // Metadata
    // -----------------------------------------------------------------------

    /// Metadata for `name`, at `version` or the latest published version.
    pub fn get_metadata(&self, name: &str, version: Option<&str>) -> Result<PluginMetadata> {
        paths::validate_plugin_name(name)?;
        let (path, what) = match version {
            Some(v) => (format!("/plugins/{name}/{v}"), format!("plugin {name}@{v}")),
            None => (format!("/plugins/{name}"), format!("plugin {name}")),
        };
        let resp = self.get(&path, &[], &what)?;
        let meta: PluginMetadata = self.read_json(resp)?;
        if meta.name != name {
            return Err(PluginError::Validation(format!(
                "registry answered for '{}' when asked for '{name}'",
                meta.name
            )));
        }
        if let Some(v) = version {
            let same = match (semver::Version::parse(&meta.version), semver::Version::parse(v)) {
                (Ok(got), Ok(asked)) => got == asked,
                _ => meta.version == v,
            };
            if !same {
                return Err(PluginError::Validation(format!(
                    "registry answered with {name}@{} when asked for {name}@{v}",
                    meta.version
                )));
            }
        }
        Ok(meta)
    }

    /// Published versions in ascending semver order.
    pub fn list_versions(&self, name: &str) -> Result<Vec<semver::Version>> {
        paths::validate_plugin_name(name)?;
        let resp = self.get(
            &format!("/plugins/{name}/versions"),
            &[],
            &format!("plugin {name}"),
        )?;
        let body: VersionsResponse = self.read_json(resp)?;
        let mut versions: Vec<semver::Version> = body
            .versions
            .iter()
            .filter_map(|raw| match semver::Version::parse(raw) {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!(plugin = name, version = %raw, "skipping unparseable version: {e}");
                    None
                }
            })
            .collect();
        versions.sort();
        versions.dedup();
        Ok(versions)
    }

    /// Raw archive bytes for `name@version`.
    pub fn download(&self, name: &str, version: &str) -> Result<Vec<u8>> {
        paths::validate_plugin_name(name)?;
        let resp = self.get(
            &format!("/plugins/{name}/{version}/download"),
            &[],
            &format!("archive for {name}@{version}"),
        )?;
        self.read_bytes(resp)
    }

    // -----------------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------------

    /// Search the registry. Responses are cached for the configured TTL;
    /// `refresh` skips the cached copy and replaces it.
    pub fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        refresh: bool,
    ) -> Result<Vec<PluginMetadata>> {
        let cache_file = self.search_cache_file(query, filters)?;
        if !refresh {
            if let Some(hit) = self.read_cached_search(&cache_file) {
                tracing::debug!(query, "search served from cache");
                return Ok(rank(hit, filters));
            }
        }

        let mut params: Vec<(&str, String)> = vec![
            ("q", query.to_string()),
            ("sort", filters.sort.to_string()),
            ("order", filters.order.to_string()),
        ];
        if let Some(c) = &filters.category {
            params.push(("category", c.clone()));
        }
        if let Some(a) = &filters.author {
            params.push(("author", a.clone()));
        }
        if let Some(c) = filters.certified {
            params.push(("certified", c.to_string()));
        }
        if let Some(r) = filters.min_rating {
            params.push(("min_rating", r.to_string()));
        }
        if let Some(l) = filters.limit {
            params.push(("limit", l.to_string()));
        }

        let resp = self.get("/plugins/search", &params, "search endpoint")?;
        let body: SearchResponse = self.read_json(resp)?;

        if !self.search_ttl.is_zero() {
            let cached = CachedSearch {
                fetched_at: Utc::now(),
                plugins: body.plugins.clone(),
            };
            let data = serde_json::to_vec(&cached)?;
            if let Err(e) = crate::io::atomic_write(&cache_file, &data) {
                tracing::warn!(path = %cache_file.display(), "failed to cache search response: {e}");
            }
        }

        Ok(rank(body.plugins, filters))
    }

    fn search_cache_file(&self, query: &str, filters: &SearchFilters) -> Result<PathBuf> {
        let key = serde_json::to_string(&(&self.base_url, query, filters))?;
        Ok(self
            .search_cache_dir
            .join(format!("{}.json", crate::io::sha256_hex(key.as_bytes()))))
    }

    fn read_cached_search(&self, path: &std::path::Path) -> Option<Vec<PluginMetadata>> {
        if self.search_ttl.is_zero() {
            return None;
        }
        let data = std::fs::read(path).ok()?;
        let cached: CachedSearch = serde_json::from_slice(&data).ok()?;
        let age = Utc::now().signed_duration_since(cached.fetched_at);
        let ttl = chrono::Duration::from_std(self.search_ttl).ok()?;
        if age < chrono::Duration::zero() || age > ttl {
            return None;
        }
        Some(cached.plugins)
    }

    /// Delete cached search responses. Returns how many were removed.
    pub fn clear_search_cache(&self) -> Result<usize> {
        let mut removed = 0;
        let entries = match std::fs::read_dir(&self.search_cache_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                crate::io::remove_file_if_exists(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Registry status
    // -----------------------------------------------------------------------

    pub fn stats(&self) -> Result<RegistryStats> {
        let resp = self.get("/stats", &[], "stats endpoint")?;
        self.read_json(resp)
    }

    /// Probe `/health`. A reachable registry answering with an error status
    /// is reported as unhealthy rather than as an error.
    pub fn health(&self) -> Result<RegistryHealth> {
        let started = Instant::now();
        let outcome = self.get("/health", &[], "health endpoint");
        let latency_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(resp) => {
                let body: HealthResponse = self.read_json(resp)?;
                let healthy = matches!(body.status.as_str(), "ok" | "healthy" | "up");
                Ok(RegistryHealth {
                    url: self.base_url.clone(),
                    status: body.status,
                    healthy,
                    latency_ms,
                })
            }
            Err(PluginError::RegistryResponse { status, .. }) => Ok(RegistryHealth {
                url: self.base_url.clone(),
                status: format!("HTTP {status}"),
                healthy: false,
                latency_ms,
            }),
            Err(PluginError::NotFound(_)) => Ok(RegistryHealth {
                url: self.base_url.clone(),
                status: "HTTP 404".to_string(),
                healthy: false,
                latency_ms,
            }),
            Err(e) => Err(e),
        }
    }
}

fn error_chain(e: &dyn std::error::Error) -> String {
    let mut msg = e.to_string();
    let mut source = e.source();
    while let Some(s) = source {
        msg.push_str(": ");
        msg.push_str(&s.to_string());
        source = s.source();
    }
    msg
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

/// Apply filters, sort and limit. Ties always fall back to name ascending so
/// results are deterministic whatever the registry returned.
pub fn rank(plugins: Vec<PluginMetadata>, filters: &SearchFilters) -> Vec<PluginMetadata> {
    let mut out: Vec<PluginMetadata> = plugins
        .into_iter()
        .filter(|p| {
            filters
                .category
                .as_deref()
                .map_or(true, |c| p.category.eq_ignore_ascii_case(c))
        })
        .filter(|p| {
            filters
                .author
                .as_deref()
                .map_or(true, |a| p.author.eq_ignore_ascii_case(a))
        })
        .filter(|p| filters.certified.map_or(true, |c| p.certified == c))
        .filter(|p| filters.min_rating.map_or(true, |r| p.rating >= r))
        .collect();

    out.sort_by(|a, b| {
        let primary = match filters.sort {
            SortKey::Rating => a.rating.partial_cmp(&b.rating).unwrap_or(Ordering::Equal),
            SortKey::Downloads => a.downloads.cmp(&b.downloads),
            SortKey::Name => Ordering::Equal,
        };
        let primary = match filters.order {
            SortOrder::Asc => primary,
            SortOrder::Desc => primary.reverse(),
        };
        let by_name = match (filters.sort, filters.order) {
            (SortKey::Name, SortOrder::Desc) => b.name.cmp(&a.name),
            _ => a.name.cmp(&b.name),
        };
        primary.then(by_name)
    });

    if let Some(limit) = filters.limit {
        out.truncate(limit);
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{metadata, test_config};
    use mockito::Matcher;
    use tempfile::TempDir;

    fn client(dir: &TempDir, url: &str) -> RegistryClient {
        RegistryClient::new(&test_config(dir.path(), url)).unwrap()
    }

    #[test]
    fn rank_sorts_by_rating_with_name_tiebreak() {
        let mut a = metadata("beta", "1.0.0");
        a.rating = 4.0;
        let mut b = metadata("alpha", "1.0.0");
        b.rating = 4.0;
        let mut c = metadata("gamma", "1.0.0");
        c.rating = 5.0;

        let ranked = rank(vec![a, b, c], &SearchFilters::default());
        let names: Vec<&str> = ranked.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["gamma", "alpha", "beta"]);
    }

    #[test]
    fn rank_applies_filters_and_limit() {
        let mut a = metadata("auth-a", "1.0.0");
        a.certified = true;
        a.category = "security".into();
        a.downloads = 10;
        let mut b = metadata("auth-b", "1.0.0");
        b.certified = true;
        b.category = "Security".into();
        b.downloads = 50;
        let mut c = metadata("auth-c", "1.0.0");
        c.category = "security".into();

        let filters = SearchFilters {
            category: Some("security".into()),
            certified: Some(true),
            sort: SortKey::Downloads,
            order: SortOrder::Desc,
            limit: Some(1),
            ..Default::default()
        };
        let ranked = rank(vec![a, b, c], &filters);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].name, "auth-b");
    }

    #[test]
    fn rank_by_name_respects_order() {
        let filters = SearchFilters {
            sort: SortKey::Name,
            order: SortOrder::Asc,
            ..Default::default()
        };
        let ranked = rank(
            vec![metadata("b", "1.0.0"), metadata("a", "1.0.0")],
            &filters,
        );
        assert_eq!(ranked[0].name, "a");
    }

    #[test]
    fn get_metadata_and_not_found() {
        let mut server = mockito::Server::new();
        let dir = TempDir::new().unwrap();
        let body = serde_json::to_string(&metadata("auth", "1.2.0")).unwrap();
        let _m = server
            .mock("GET", "/plugins/auth")
            .with_status(200)
            .with_body(body)
            .create();
        let _missing = server
            .mock("GET", "/plugins/ghost")
            .with_status(404)
            .create();

        let c = client(&dir, &server.url());
        assert_eq!(c.get_metadata("auth", None).unwrap().version, "1.2.0");
        assert!(matches!(
            c.get_metadata("ghost", None),
            Err(PluginError::NotFound(_))
        ));
    }

    #[test]
    fn exact_metadata_must_match_requested_version() {
        let mut server = mockito::Server::new();
        let dir = TempDir::new().unwrap();
        let body = serde_json::to_string(&metadata("stripe", "2.2.0")).unwrap();
        let _m = server
            .mock("GET", "/plugins/stripe/2.1.0")
            .with_status(200)
            .with_body(body)
            .create();

        let err = client(&dir, &server.url())
            .get_metadata("stripe", Some("2.1.0"))
            .unwrap_err();
        assert!(matches!(err, PluginError::Validation(_)), "{err}");
        assert!(err.to_string().contains("stripe@2.2.0"), "{err}");
    }

    #[test]
    fn silent_registry_times_out() {
        // Accepted by the kernel backlog, never answered.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config(dir.path(), &url);
        cfg.timeout = std::time::Duration::from_secs(1);
        let c = RegistryClient::new(&cfg).unwrap();

        let err = c.get_metadata("auth", None).unwrap_err();
        assert!(matches!(err, PluginError::Timeout { .. }), "{err}");
        assert!(err.is_network());
        drop(listener);
    }

    #[test]
    fn server_error_is_registry_response() {
        let mut server = mockito::Server::new();
        let dir = TempDir::new().unwrap();
        let _m = server.mock("GET", "/stats").with_status(503).create();
        let err = client(&dir, &server.url()).stats().unwrap_err();
        assert!(matches!(err, PluginError::RegistryResponse { status: 503, .. }));
        assert!(err.is_network());
    }

    #[test]
    fn unreachable_registry_is_network_error() {
        let dir = TempDir::new().unwrap();
        let err = client(&dir, "http://127.0.0.1:1")
            .search("auth", &SearchFilters::default(), true)
            .unwrap_err();
        assert!(matches!(err, PluginError::Network { .. }), "got {err:?}");
        assert!(err.to_string().contains("unable to connect"));
    }

    #[test]
    fn list_versions_sorts_and_skips_garbage() {
        let mut server = mockito::Server::new();
        let dir = TempDir::new().unwrap();
        let _m = server
            .mock("GET", "/plugins/auth/versions")
            .with_status(200)
            .with_body(r#"{"versions": ["2.0.0", "nope", "1.0.0", "1.10.0"]}"#)
            .create();
        let versions = client(&dir, &server.url()).list_versions("auth").unwrap();
        let rendered: Vec<String> = versions.iter().map(|v| v.to_string()).collect();
        assert_eq!(rendered, ["1.0.0", "1.10.0", "2.0.0"]);
    }

    #[test]
    fn search_is_cached_until_refresh() {
        let mut server = mockito::Server::new();
        let dir = TempDir::new().unwrap();
        let body = serde_json::json!({ "plugins": [metadata("auth", "1.0.0")] }).to_string();
        let m = server
            .mock("GET", "/plugins/search")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(body)
            .expect(2)
            .create();

        let c = client(&dir, &server.url());
        let filters = SearchFilters::default();
        assert_eq!(c.search("auth", &filters, false).unwrap().len(), 1);
        // Served from the cache file, no request.
        assert_eq!(c.search("auth", &filters, false).unwrap().len(), 1);
        // Bypasses the cache.
        assert_eq!(c.search("auth", &filters, true).unwrap().len(), 1);
        m.assert();

        assert_eq!(c.clear_search_cache().unwrap(), 1);
        assert_eq!(c.clear_search_cache().unwrap(), 0);
    }

    #[test]
    fn search_sends_filters_as_query() {
        let mut server = mockito::Server::new();
        let dir = TempDir::new().unwrap();
        let m = server
            .mock("GET", "/plugins/search")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("q".into(), "auth".into()),
                Matcher::UrlEncoded("category".into(), "security".into()),
                Matcher::UrlEncoded("certified".into(), "true".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"plugins": []}"#)
            .create();
        let filters = SearchFilters {
            category: Some("security".into()),
            certified: Some(true),
            ..Default::default()
        };
        client(&dir, &server.url())
            .search("auth", &filters, true)
            .unwrap();
        m.assert();
    }

    #[test]
    fn api_key_is_sent_as_bearer() {
        let mut server = mockito::Server::new();
        let dir = TempDir::new().unwrap();
        let m = server
            .mock("GET", "/stats")
            .match_header("authorization", "Bearer secret")
            .with_status(200)
            .with_body(r#"{"totalPlugins": 3}"#)
            .create();
        let mut cfg = test_config(dir.path(), &server.url());
        cfg.api_key = Some("secret".into());
        let stats = RegistryClient::new(&cfg).unwrap().stats().unwrap();
        assert_eq!(stats.total_plugins, 3);
        m.assert();
    }

    #[test]
    fn health_reports_status() {
        let mut server = mockito::Server::new();
        let dir = TempDir::new().unwrap();
        let _m = server
            .mock("GET", "/health")
            .with_status(200)
            .with_body(r#"{"status": "ok"}"#)
            .create();
        let health = client(&dir, &server.url()).health().unwrap();
        assert!(health.healthy);
        assert_eq!(health.status, "ok");
    }

    #[test]
    fn unhealthy_status_is_not_an_error() {
        let mut server = mockito::Server::new();
        let dir = TempDir::new().unwrap();
        let _m = server.mock("GET", "/health").with_status(500).create();
        let health = client(&dir, &server.url()).health().unwrap();
        assert!(!health.healthy);
        assert_eq!(health.status, "HTTP 500");
    }
}
