//! Local archive cache keyed by `name@version`.
//!
//! Layout:
//!   <cacheDir>/packages/
//!     xaheen-auth-generator@1.2.0.tgz   archive bytes
//!     xaheen-auth-generator@1.2.0.yaml  CacheEntry sidecar
//!
//! An entry is trusted only when the archive still hashes to the recorded
//! checksum (and to the registry's digest, when one is supplied); otherwise
//! it is evicted. Entries outlive uninstall and go away only on `clear`.

use crate::error::{PluginError, Result};
use crate::io;
use crate::paths;
use crate::registry::RegistryClient;
use crate::types::{cache_key, PluginMetadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

const TEMP_PREFIX: &str = ".tmp";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub name: String,
    pub version: String,
    pub tarball: PathBuf,
    pub checksum: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    Cache,
    Network,
}

#[derive(Debug, Clone)]
pub struct Fetched {
    pub path: PathBuf,
    pub checksum: String,
    pub source: FetchSource,
}

#[derive(Debug, Clone)]
pub struct PackageCache {
    dir: PathBuf,
}

impl PackageCache {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            dir: paths::packages_dir(cache_dir),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn tarball_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.tgz"))
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.yaml"))
    }

    /// A verified entry for `name@version`, or `None`. Entries that fail
    /// verification are evicted on the way out.
    pub fn lookup(
        &self,
        name: &str,
        version: &str,
        expected_checksum: Option<&str>,
    ) -> Result<Option<CacheEntry>> {
        let key = cache_key(name, version);
        let entry_path = self.entry_path(&key);
        if !entry_path.exists() {
            return Ok(None);
        }

        let entry: CacheEntry = match std::fs::read_to_string(&entry_path)
            .map_err(PluginError::from)
            .and_then(|data| serde_yaml::from_str(&data).map_err(PluginError::from))
        {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(%key, "unreadable cache entry, evicting: {e}");
                self.evict(&key)?;
                return Ok(None);
            }
        };

        let tarball = self.tarball_path(&key);
        if !tarball.is_file() {
            self.evict(&key)?;
            return Ok(None);
        }

        let actual = io::sha256_file(&tarball)?;
        let recorded = io::normalize_checksum(&entry.checksum);
        let expected_ok = expected_checksum
            .map(|e| io::normalize_checksum(e) == actual)
            .unwrap_or(true);
        if actual != recorded || !expected_ok {
            tracing::warn!(%key, "cached archive failed checksum verification, evicting");
            self.evict(&key)?;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Write `bytes` as the archive for `name@version`: temp file in the cache
    /// directory, rename into place, then the sidecar entry.
    pub fn store(&self, name: &str, version: &str, bytes: &[u8]) -> Result<CacheEntry> {
        io::ensure_dir(&self.dir)?;
        let key = cache_key(name, version);
        let tarball = self.tarball_path(&key);

        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&tarball).map_err(|e| e.error)?;

        let entry = CacheEntry {
            key: key.clone(),
            name: name.to_string(),
            version: version.to_string(),
            tarball,
            checksum: io::sha256_hex(bytes),
            fetched_at: Utc::now(),
        };
        let data = serde_yaml::to_string(&entry)?;
        io::atomic_write(&self.entry_path(&key), data.as_bytes())?;
        Ok(entry)
    }

    /// Archive path for `meta`, from the cache when possible. `refresh`
    /// forces a download even on a valid hit.
    pub fn fetch(
        &self,
        registry: &RegistryClient,
        meta: &PluginMetadata,
        refresh: bool,
    ) -> Result<Fetched> {
        crate::compat::parse_version(&meta.version)?;
        let expected = meta
            .checksum
            .as_deref()
            .map(io::normalize_checksum)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| PluginError::PackageCorrupted {
                name: meta.name.clone(),
                version: meta.version.clone(),
                reason: "registry did not publish a checksum".to_string(),
            })?;

        if !refresh {
            if let Some(entry) = self.lookup(&meta.name, &meta.version, Some(&expected))? {
                tracing::debug!(key = %entry.key, "cache hit");
                return Ok(Fetched {
                    path: entry.tarball,
                    checksum: entry.checksum,
                    source: FetchSource::Cache,
                });
            }
        }

        tracing::debug!(key = %meta.key(), "downloading archive");
        let bytes = registry.download(&meta.name, &meta.version)?;
        let actual = io::sha256_hex(&bytes);
        if actual != expected {
            return Err(PluginError::PackageCorrupted {
                name: meta.name.clone(),
                version: meta.version.clone(),
                reason: format!("checksum mismatch: expected {expected}, got {actual}"),
            });
        }
        let entry = self.store(&meta.name, &meta.version, &bytes)?;
        tracing::info!(key = %entry.key, bytes = bytes.len(), "cached archive");
        Ok(Fetched {
            path: entry.tarball,
            checksum: entry.checksum,
            source: FetchSource::Network,
        })
    }

    pub fn evict(&self, key: &str) -> Result<()> {
        io::remove_file_if_exists(&self.entry_path(key))?;
        io::remove_file_if_exists(&self.tarball_path(key))?;
        Ok(())
    }

    /// All readable entries, sorted by key.
    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        let read = match std::fs::read_dir(&self.dir) {
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for item in read {
            let path = item?.path();
            if path.extension().map_or(true, |ext| ext != "yaml") {
                continue;
            }
            let Ok(data) = std::fs::read_to_string(&path) else {
                continue;
            };
            if let Ok(entry) = serde_yaml::from_str::<CacheEntry>(&data) {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    /// Remove every entry, or only those of plugin `name`. Returns the count.
    pub fn clear(&self, name: Option<&str>) -> Result<usize> {
        let mut removed = 0;
        for entry in self.entries()? {
            if name.is_some_and(|n| n != entry.name) {
                continue;
            }
            self.evict(&entry.key)?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Remove temp files left by interrupted downloads. Only files older than
    /// `grace` are touched so a concurrent download is left alone.
    pub fn sweep_temp_files(&self, grace: Duration) -> Result<usize> {
        let read = match std::fs::read_dir(&self.dir) {
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut swept = 0;
        for item in read {
            let path = item?.path();
            let is_temp = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(TEMP_PREFIX));
            if is_temp && io::is_older_than(&path, grace) {
                io::remove_file_if_exists(&path)?;
                swept += 1;
            }
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_config, Fixture};
    use tempfile::TempDir;

    #[test]
    fn store_then_lookup_hits() {
        let dir = TempDir::new().unwrap();
        let cache = PackageCache::new(dir.path());
        let entry = cache.store("auth", "1.0.0", b"archive").unwrap();
        assert_eq!(entry.key, "auth@1.0.0");

        let hit = cache.lookup("auth", "1.0.0", None).unwrap().unwrap();
        assert_eq!(hit.checksum, io::sha256_hex(b"archive"));
        assert!(cache.lookup("auth", "2.0.0", None).unwrap().is_none());
    }

    #[test]
    fn tampered_archive_is_evicted() {
        let dir = TempDir::new().unwrap();
        let cache = PackageCache::new(dir.path());
        let entry = cache.store("auth", "1.0.0", b"archive").unwrap();
        std::fs::write(&entry.tarball, b"tampered").unwrap();

        assert!(cache.lookup("auth", "1.0.0", None).unwrap().is_none());
        assert!(!entry.tarball.exists());
        assert!(cache.entries().unwrap().is_empty());
    }

    #[test]
    fn digest_mismatch_against_registry_evicts() {
        let dir = TempDir::new().unwrap();
        let cache = PackageCache::new(dir.path());
        cache.store("auth", "1.0.0", b"archive").unwrap();
        let other = io::sha256_hex(b"something else");
        assert!(cache.lookup("auth", "1.0.0", Some(&other)).unwrap().is_none());
    }

    #[test]
    fn fetch_downloads_once_then_hits_cache() {
        let mut server = mockito::Server::new();
        let dir = TempDir::new().unwrap();
        let cfg = test_config(dir.path(), &server.url());
        let registry = RegistryClient::new(&cfg).unwrap();
        let cache = PackageCache::new(&cfg.cache_dir);

        let fixture = Fixture::new("xaheen-stripe-integration", "2.1.0").commands(&["stripe"]);
        let published = fixture.publish(&mut server, 1);
        let meta = fixture.metadata();

        let first = cache.fetch(&registry, &meta, false).unwrap();
        assert_eq!(first.source, FetchSource::Network);
        let second = cache.fetch(&registry, &meta, false).unwrap();
        assert_eq!(second.source, FetchSource::Cache);
        assert_eq!(first.path, second.path);
        published.download.assert();
    }

    #[test]
    fn refresh_bypasses_cache() {
        let mut server = mockito::Server::new();
        let dir = TempDir::new().unwrap();
        let cfg = test_config(dir.path(), &server.url());
        let registry = RegistryClient::new(&cfg).unwrap();
        let cache = PackageCache::new(&cfg.cache_dir);

        let fixture = Fixture::new("auth", "1.0.0");
        let published = fixture.publish(&mut server, 2);
        let meta = fixture.metadata();
        cache.fetch(&registry, &meta, false).unwrap();
        let again = cache.fetch(&registry, &meta, true).unwrap();
        assert_eq!(again.source, FetchSource::Network);
        published.download.assert();
    }

    #[test]
    fn corrupted_download_leaves_nothing_behind() {
        let mut server = mockito::Server::new();
        let dir = TempDir::new().unwrap();
        let cfg = test_config(dir.path(), &server.url());
        let registry = RegistryClient::new(&cfg).unwrap();
        let cache = PackageCache::new(&cfg.cache_dir);

        let fixture = Fixture::new("auth", "1.0.0").corrupt();
        let _published = fixture.publish(&mut server, 1);
        let err = cache.fetch(&registry, &fixture.metadata(), false).unwrap_err();
        assert!(matches!(err, PluginError::PackageCorrupted { .. }));

        let leftovers: Vec<_> = std::fs::read_dir(cache.dir())
            .map(|r| r.collect())
            .unwrap_or_default();
        assert!(leftovers.is_empty(), "unexpected files: {leftovers:?}");
    }

    #[test]
    fn missing_checksum_is_refused() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(dir.path(), "http://127.0.0.1:1");
        let registry = RegistryClient::new(&cfg).unwrap();
        let cache = PackageCache::new(&cfg.cache_dir);
        let mut meta = Fixture::new("auth", "1.0.0").metadata();
        meta.checksum = None;
        assert!(matches!(
            cache.fetch(&registry, &meta, false),
            Err(PluginError::PackageCorrupted { .. })
        ));
    }

    #[test]
    fn clear_by_name_and_all() {
        let dir = TempDir::new().unwrap();
        let cache = PackageCache::new(dir.path());
        cache.store("auth", "1.0.0", b"a").unwrap();
        cache.store("auth", "1.1.0", b"b").unwrap();
        cache.store("stripe", "2.1.0", b"c").unwrap();

        assert_eq!(cache.clear(Some("auth")).unwrap(), 2);
        let keys: Vec<String> = cache.entries().unwrap().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, ["stripe@2.1.0"]);
        assert_eq!(cache.clear(None).unwrap(), 1);
        assert!(cache.entries().unwrap().is_empty());
    }

    #[test]
    fn sweep_only_removes_old_temp_files() {
        let dir = TempDir::new().unwrap();
        let cache = PackageCache::new(dir.path());
        io::ensure_dir(cache.dir()).unwrap();
        std::fs::write(cache.dir().join(".tmpABC123"), b"partial").unwrap();
        std::fs::write(cache.dir().join("auth@1.0.0.tgz"), b"real").unwrap();

        assert_eq!(cache.sweep_temp_files(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(cache.sweep_temp_files(Duration::ZERO).unwrap(), 1);
        assert!(cache.dir().join("auth@1.0.0.tgz").exists());
    }
}
