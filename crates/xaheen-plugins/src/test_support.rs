//! Fixtures shared by the unit tests: plugin archives and a mockito-backed
//! registry.

use crate::config::{Overrides, PluginConfig, RegistrySettings};
use crate::types::{CommandSpec, PackageManifest, PluginMetadata};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::path::Path;
use std::time::Duration;

pub const HOST_VERSION: &str = "2.4.0";

/// Config rooted entirely under `dir`, pointed at `registry_url`.
pub fn test_config(dir: &Path, registry_url: &str) -> PluginConfig {
    let mut cfg = PluginConfig::resolve(
        &dir.join("home"),
        &dir.join("project"),
        &RegistrySettings::default(),
        Overrides {
            registry_url: Some(registry_url.to_string()),
            ..Default::default()
        },
    );
    cfg.timeout = Duration::from_secs(5);
    cfg.lock_timeout = Duration::from_millis(200);
    cfg
}

pub fn metadata(name: &str, version: &str) -> PluginMetadata {
    PluginMetadata {
        name: name.to_string(),
        version: version.to_string(),
        description: format!("{name} test plugin"),
        author: "xaheen".to_string(),
        category: "testing".to_string(),
        keywords: Vec::new(),
        host: None,
        certified: false,
        rating: 0.0,
        downloads: 0,
        repository: None,
        checksum: None,
    }
}

/// Gzip tarball containing `files` (path, contents).
pub fn build_archive(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, path, contents.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

pub fn package_manifest(
    name: &str,
    version: &str,
    commands: &[&str],
    deps: &[(&str, &str)],
) -> PackageManifest {
    PackageManifest {
        name: name.to_string(),
        version: version.to_string(),
        description: format!("{name} test plugin"),
        host: None,
        commands: commands
            .iter()
            .map(|c| CommandSpec {
                name: c.to_string(),
                description: format!("{c} command from {name}"),
                entry: format!("bin/{c}.sh"),
                interpreter: Some("sh".to_string()),
                options: Vec::new(),
            })
            .collect(),
        dependencies: deps
            .iter()
            .map(|(d, r)| (d.to_string(), r.to_string()))
            .collect(),
    }
}

pub fn package_yaml(
    name: &str,
    version: &str,
    commands: &[&str],
    deps: &[(&str, &str)],
) -> String {
    serde_yaml::to_string(&package_manifest(name, version, commands, deps)).unwrap()
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

/// A publishable plugin.
#[derive(Debug, Clone)]
pub struct Fixture {
    pub name: String,
    pub version: String,
    pub host: Option<String>,
    pub commands: Vec<String>,
    pub deps: Vec<(String, String)>,
    pub corrupt: bool,
}

impl Fixture {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            host: None,
            commands: Vec::new(),
            deps: Vec::new(),
            corrupt: false,
        }
    }

    pub fn host(mut self, range: &str) -> Self {
        self.host = Some(range.to_string());
        self
    }

    pub fn commands(mut self, commands: &[&str]) -> Self {
        self.commands = commands.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn dep(mut self, name: &str, req: &str) -> Self {
        self.deps.push((name.to_string(), req.to_string()));
        self
    }

    /// Serve bytes that do not match the advertised checksum.
    pub fn corrupt(mut self) -> Self {
        self.corrupt = true;
        self
    }

    pub fn archive(&self) -> Vec<u8> {
        let commands: Vec<&str> = self.commands.iter().map(String::as_str).collect();
        let deps: Vec<(&str, &str)> = self
            .deps
            .iter()
            .map(|(d, r)| (d.as_str(), r.as_str()))
            .collect();
        let manifest = package_yaml(&self.name, &self.version, &commands, &deps);
        let scripts: Vec<(String, String)> = self
            .commands
            .iter()
            .map(|c| {
                (
                    format!("bin/{c}.sh"),
                    format!("echo \"{c} from {} $@\"\n", self.name),
                )
            })
            .collect();
        let mut files: Vec<(&str, &str)> = vec![("xaheen-plugin.yaml", manifest.as_str())];
        files.extend(scripts.iter().map(|(p, s)| (p.as_str(), s.as_str())));
        build_archive(&files)
    }

    pub fn metadata(&self) -> PluginMetadata {
        let mut meta = metadata(&self.name, &self.version);
        meta.host = self.host.clone();
        meta.checksum = Some(format!(
            "sha256:{}",
            crate::io::sha256_hex(&self.archive())
        ));
        meta
    }

    /// Register metadata, version list and download mocks. The download
    /// mock expects exactly `downloads` hits.
    pub fn publish(&self, server: &mut mockito::ServerGuard, downloads: usize) -> Published {
        let mut published = self.publish_exact(server, downloads);
        let latest = server
            .mock("GET", format!("/plugins/{}", self.name).as_str())
            .with_status(200)
            .with_body(serde_json::to_string(&self.metadata()).unwrap())
            .create();
        let versions = server
            .mock("GET", format!("/plugins/{}/versions", self.name).as_str())
            .with_status(200)
            .with_body(serde_json::json!({ "versions": [self.version] }).to_string())
            .create();
        published._metadata.extend([latest, versions]);
        published
    }

    /// Only the version-specific metadata and download mocks, so several
    /// versions of one plugin can be served side by side.
    pub fn publish_exact(&self, server: &mut mockito::ServerGuard, downloads: usize) -> Published {
        let exact = server
            .mock(
                "GET",
                format!("/plugins/{}/{}", self.name, self.version).as_str(),
            )
            .with_status(200)
            .with_body(serde_json::to_string(&self.metadata()).unwrap())
            .create();

        let served = if self.corrupt {
            b"this is not the archive you are looking for".to_vec()
        } else {
            self.archive()
        };
        let download = server
            .mock(
                "GET",
                format!("/plugins/{}/{}/download", self.name, self.version).as_str(),
            )
            .with_status(200)
            .with_body(served)
            .expect(downloads)
            .create();
        Published {
            download,
            _metadata: vec![exact],
        }
    }
}

/// Mocks for one published fixture; keep it alive for the whole test.
pub struct Published {
    pub download: mockito::Mock,
    _metadata: Vec<mockito::Mock>,
}
