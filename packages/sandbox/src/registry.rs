// ABOUTME: Sandbox registry: the declarative allow-list of permitted sandbox configurations
// ABOUTME: Loads entries from JSON or TOML, validates them, and supports atomic hot-reload

use crate::error::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

const DEFAULT_PIDS_LIMIT: i64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkPolicy {
    /// No network interface besides loopback
    None,
    /// Default bridge network, required for terminal port publishing
    Bridge,
}

impl NetworkPolicy {
    pub fn network_mode(&self) -> &'static str {
        match self {
            NetworkPolicy::None => "none",
            NetworkPolicy::Bridge => "bridge",
        }
    }

    pub fn allows_published_ports(&self) -> bool {
        matches!(self, NetworkPolicy::Bridge)
    }
}

/// Inline image build definition, built on demand and cached by content hash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSpec {
    pub dockerfile: String,
}

/// A validated, immutable registry entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryEntry {
    pub name: String,
    pub aliases: Vec<String>,
    pub image: String,
    pub build: Option<BuildSpec>,
    pub cpu_limit: f64,
    pub mem_limit_bytes: u64,
    pub pids_limit: i64,
    pub network_policy: NetworkPolicy,
    pub default_ttl_secs: u64,
    /// Empty means every configured language is allowed
    pub languages: Vec<String>,
    pub terminal_port: Option<u16>,
    pub env: BTreeMap<String, String>,
}

impl RegistryEntry {
    pub fn allows_language(&self, canonical: &str) -> bool {
        self.languages.is_empty()
            || self
                .languages
                .iter()
                .any(|l| l.eq_ignore_ascii_case(canonical))
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MemLimit {
    Bytes(u64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    name: String,
    #[serde(default)]
    aliases: Vec<String>,
    image: String,
    #[serde(default)]
    build: Option<BuildSpec>,
    cpu_limit: f64,
    mem_limit: MemLimit,
    #[serde(default)]
    pids_limit: Option<i64>,
    network_policy: NetworkPolicy,
    default_ttl: u64,
    #[serde(default)]
    languages: Vec<String>,
    #[serde(default)]
    terminal_port: Option<u16>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    #[allow(dead_code)]
    version: Option<String>,
    entries: Vec<RawEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryFormat {
    Json,
    Toml,
}

impl RegistryFormat {
    fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(RegistryFormat::Json),
            Some("toml") => Ok(RegistryFormat::Toml),
            other => Err(SandboxError::Config(format!(
                "Unsupported registry file extension {:?} for {} (expected .json or .toml)",
                other,
                path.display()
            ))),
        }
    }
}

/// Immutable view of the whole entry set; swapped as a unit on reload
#[derive(Debug, Default)]
struct RegistrySnapshot {
    entries: HashMap<String, Arc<RegistryEntry>>,
    /// Lowercased name or alias -> canonical name
    index: HashMap<String, String>,
}

impl RegistrySnapshot {
    fn build(entries: Vec<RegistryEntry>) -> Result<Self> {
        let mut snapshot = RegistrySnapshot::default();

        for entry in entries {
            let keys = std::iter::once(&entry.name).chain(entry.aliases.iter());
            for key in keys {
                let lowered = key.to_lowercase();
                if let Some(owner) = snapshot.index.get(&lowered) {
                    return Err(SandboxError::Config(format!(
                        "Registry name or alias '{}' of entry '{}' is already claimed by entry '{}'",
                        key, entry.name, owner
                    )));
                }
                snapshot.index.insert(lowered, entry.name.clone());
            }
            snapshot
                .entries
                .insert(entry.name.clone(), Arc::new(entry));
        }

        Ok(snapshot)
    }

    fn resolve(&self, name: &str) -> Option<Arc<RegistryEntry>> {
        if let Some(entry) = self.entries.get(name) {
            return Some(entry.clone());
        }
        self.index
            .get(&name.to_lowercase())
            .and_then(|canonical| self.entries.get(canonical))
            .cloned()
    }
}

/// Registry of allowed sandbox configurations
pub struct Registry {
    path: Option<PathBuf>,
    snapshot: RwLock<Arc<RegistrySnapshot>>,
}

impl Registry {
    /// Load the registry from a `.json` or `.toml` file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = Self::read_snapshot(&path).await?;

        info!(
            "Loaded {} registry entries from {}",
            snapshot.entries.len(),
            path.display()
        );

        Ok(Self {
            path: Some(path),
            snapshot: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Build a registry from already-constructed entries (no backing file)
    pub fn from_entries(entries: Vec<RegistryEntry>) -> Result<Self> {
        let entries = entries
            .into_iter()
            .map(validate_entry)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            path: None,
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::build(entries)?)),
        })
    }

    /// Parse registry contents in the given format (no backing file)
    pub fn parse(contents: &str, format: RegistryFormat) -> Result<Self> {
        Ok(Self {
            path: None,
            snapshot: RwLock::new(Arc::new(parse_snapshot(contents, format)?)),
        })
    }

    /// Re-read the backing file and atomically replace the entry set.
    /// On failure the previous entries stay in place.
    pub async fn reload(&self) -> Result<usize> {
        let path = self.path.as_ref().ok_or_else(|| {
            SandboxError::Config("Registry has no backing file to reload from".to_string())
        })?;

        let snapshot = match Self::read_snapshot(path).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    "Registry reload from {} failed, keeping previous entries: {}",
                    path.display(),
                    e
                );
                return Err(e);
            }
        };

        let count = snapshot.entries.len();
        *self.snapshot.write().await = Arc::new(snapshot);
        info!("Reloaded {} registry entries from {}", count, path.display());
        Ok(count)
    }

    /// Resolve a name or alias to its entry
    pub async fn resolve(&self, name: &str) -> Result<Arc<RegistryEntry>> {
        let snapshot = self.snapshot.read().await.clone();
        snapshot.resolve(name).ok_or_else(|| {
            SandboxError::Registry(format!("'{}' is not an allowed sandbox configuration", name))
        })
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.snapshot.read().await.resolve(name).is_some()
    }

    /// All entries sorted by name
    pub async fn list(&self) -> Vec<Arc<RegistryEntry>> {
        let snapshot = self.snapshot.read().await.clone();
        let mut entries: Vec<_> = snapshot.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn read_snapshot(path: &Path) -> Result<RegistrySnapshot> {
        let format = RegistryFormat::from_path(path)?;
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            SandboxError::Config(format!(
                "Failed to read registry file {}: {}",
                path.display(),
                e
            ))
        })?;
        parse_snapshot(&contents, format)
    }
}

fn parse_snapshot(contents: &str, format: RegistryFormat) -> Result<RegistrySnapshot> {
    let file: RegistryFile = match format {
        RegistryFormat::Json => serde_json::from_str(contents)
            .map_err(|e| SandboxError::Config(format!("Invalid registry file: {}", e)))?,
        RegistryFormat::Toml => toml::from_str(contents)
            .map_err(|e| SandboxError::Config(format!("Invalid registry file: {}", e)))?,
    };

    let entries = file
        .entries
        .into_iter()
        .map(|raw| {
            let mem_limit_bytes = match raw.mem_limit {
                MemLimit::Bytes(bytes) => bytes,
                MemLimit::Text(text) => parse_mem_limit(&text).map_err(|e| {
                    SandboxError::Config(format!("Entry '{}': {}", raw.name, e))
                })?,
            };
            validate_entry(RegistryEntry {
                name: raw.name,
                aliases: raw.aliases,
                image: raw.image,
                build: raw.build,
                cpu_limit: raw.cpu_limit,
                mem_limit_bytes,
                pids_limit: raw.pids_limit.unwrap_or(DEFAULT_PIDS_LIMIT),
                network_policy: raw.network_policy,
                default_ttl_secs: raw.default_ttl,
                languages: raw.languages,
                terminal_port: raw.terminal_port,
                env: raw.env,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    RegistrySnapshot::build(entries)
}

fn validate_entry(entry: RegistryEntry) -> Result<RegistryEntry> {
    let fail = |msg: String| SandboxError::Config(format!("Entry '{}': {}", entry.name, msg));

    if entry.name.trim().is_empty() {
        return Err(SandboxError::Config(
            "Registry entry with empty name".to_string(),
        ));
    }
    if entry.image.trim().is_empty() {
        return Err(fail("image must not be empty".to_string()));
    }
    if !entry.cpu_limit.is_finite() || entry.cpu_limit <= 0.0 {
        return Err(fail(format!(
            "cpu_limit must be a finite positive number, got {}",
            entry.cpu_limit
        )));
    }
    if entry.mem_limit_bytes < 4 * 1024 * 1024 {
        return Err(fail(format!(
            "mem_limit must be at least 4m, got {} bytes",
            entry.mem_limit_bytes
        )));
    }
    if entry.pids_limit <= 0 {
        return Err(fail("pids_limit must be positive".to_string()));
    }
    if entry.default_ttl_secs == 0 {
        return Err(fail("default_ttl must be at least 1 second".to_string()));
    }
    if entry.terminal_port == Some(0) {
        return Err(fail("terminal_port must be between 1 and 65535".to_string()));
    }
    if entry.build.is_some() && image_has_tag(&entry.image) {
        return Err(fail(format!(
            "image '{}' must be an untagged repository when build is set; the tag is derived from the Dockerfile hash",
            entry.image
        )));
    }
    if entry.aliases.iter().any(|a| a.trim().is_empty()) {
        return Err(fail("aliases must not be empty".to_string()));
    }

    Ok(entry)
}

fn image_has_tag(image: &str) -> bool {
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    last_segment.contains(':') || last_segment.contains('@')
}

/// Parse a docker-style memory limit such as `512m`, `1g`, `65536k` or `1048576`
pub fn parse_mem_limit(text: &str) -> std::result::Result<u64, String> {
    let trimmed = text.trim().to_lowercase();
    let trimmed = trimmed.strip_suffix('b').unwrap_or(&trimmed);
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k') => (&trimmed[..trimmed.len() - 1], 1024u64),
        Some('m') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('g') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        Some(c) if c.is_ascii_digit() => (trimmed, 1),
        _ => return Err(format!("invalid mem_limit '{}'", text)),
    };

    digits
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|v| v.checked_mul(multiplier))
        .ok_or_else(|| format!("invalid mem_limit '{}'", text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const JSON_REGISTRY: &str = r#"{
        "version": "1",
        "entries": [
            {
                "name": "python-small",
                "aliases": ["py", "Python"],
                "image": "python:3.12-slim",
                "cpu_limit": 0.5,
                "mem_limit": "256m",
                "network_policy": "none",
                "default_ttl": 300,
                "languages": ["python"]
            },
            {
                "name": "polyglot",
                "image": "sandkeep/polyglot",
                "build": { "dockerfile": "FROM alpine:3.20\nRUN apk add --no-cache python3 nodejs ttyd\n" },
                "cpu_limit": 1,
                "mem_limit": 536870912,
                "network_policy": "bridge",
                "default_ttl": 900,
                "terminal_port": 7681
            }
        ]
    }"#;

    const TOML_REGISTRY: &str = r#"
[[entries]]
name = "node"
image = "node:20-alpine"
cpu_limit = 1.0
mem_limit = "1g"
network_policy = "bridge"
default_ttl = 600
"#;

    #[test]
    fn test_parse_json_registry() {
        let snapshot = parse_snapshot(JSON_REGISTRY, RegistryFormat::Json).unwrap();
        assert_eq!(snapshot.entries.len(), 2);

        let python = snapshot.resolve("python-small").unwrap();
        assert_eq!(python.mem_limit_bytes, 256 * 1024 * 1024);
        assert_eq!(python.network_policy, NetworkPolicy::None);
        assert_eq!(python.pids_limit, DEFAULT_PIDS_LIMIT);

        let poly = snapshot.resolve("polyglot").unwrap();
        assert!(poly.build.is_some());
        assert_eq!(poly.terminal_port, Some(7681));
    }

    #[test]
    fn test_parse_toml_registry() {
        let snapshot = parse_snapshot(TOML_REGISTRY, RegistryFormat::Toml).unwrap();
        let node = snapshot.resolve("node").unwrap();
        assert_eq!(node.mem_limit_bytes, 1024 * 1024 * 1024);
        assert_eq!(node.default_ttl_secs, 600);
    }

    #[test]
    fn test_missing_required_field_is_config_error() {
        let missing_image = r#"{"entries": [{"name": "x", "cpu_limit": 1, "mem_limit": "64m",
            "network_policy": "none", "default_ttl": 10}]}"#;
        let err = parse_snapshot(missing_image, RegistryFormat::Json).unwrap_err();
        assert!(matches!(err, SandboxError::Config(_)));
        assert!(err.to_string().contains("image"));
    }

    #[test]
    fn test_alias_resolution_is_case_insensitive() {
        let snapshot = parse_snapshot(JSON_REGISTRY, RegistryFormat::Json).unwrap();
        assert_eq!(snapshot.resolve("PY").unwrap().name, "python-small");
        assert_eq!(snapshot.resolve("python").unwrap().name, "python-small");
        assert!(snapshot.resolve("ruby").is_none());
    }

    #[test]
    fn test_alias_conflict_rejected() {
        let conflicting = r#"{"entries": [
            {"name": "a", "aliases": ["shared"], "image": "alpine", "cpu_limit": 1,
             "mem_limit": "64m", "network_policy": "none", "default_ttl": 10},
            {"name": "b", "aliases": ["SHARED"], "image": "alpine", "cpu_limit": 1,
             "mem_limit": "64m", "network_policy": "none", "default_ttl": 10}
        ]}"#;
        let err = parse_snapshot(conflicting, RegistryFormat::Json).unwrap_err();
        assert!(matches!(err, SandboxError::Config(_)));
        assert!(err.to_string().contains("already claimed"));
    }

    #[test]
    fn test_tagged_image_with_build_rejected() {
        let bad = r#"{"entries": [{"name": "x", "image": "repo/x:latest",
            "build": {"dockerfile": "FROM alpine"}, "cpu_limit": 1, "mem_limit": "64m",
            "network_policy": "none", "default_ttl": 10}]}"#;
        let err = parse_snapshot(bad, RegistryFormat::Json).unwrap_err();
        assert!(err.to_string().contains("untagged"));
    }

    #[test]
    fn test_parse_mem_limit() {
        assert_eq!(parse_mem_limit("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_mem_limit("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_mem_limit("64kb").unwrap(), 64 * 1024);
        assert_eq!(parse_mem_limit("1048576").unwrap(), 1_048_576);
        assert!(parse_mem_limit("lots").is_err());
        assert!(parse_mem_limit("").is_err());
    }

    #[test]
    fn test_image_has_tag() {
        assert!(image_has_tag("python:3.12"));
        assert!(image_has_tag("localhost:5000/repo:tag"));
        assert!(!image_has_tag("localhost:5000/repo"));
        assert!(!image_has_tag("sandkeep/polyglot"));
    }

    #[tokio::test]
    async fn test_load_missing_file_is_config_error() {
        let err = Registry::load("/nonexistent/registry.json")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SandboxError::Config(_)));
    }

    #[tokio::test]
    async fn test_resolve_unknown_is_registry_error() {
        let registry = Registry::parse(JSON_REGISTRY, RegistryFormat::Json).unwrap();
        let err = registry.resolve("does-not-exist").await.unwrap_err();
        assert!(matches!(err, SandboxError::Registry(_)));
    }

    #[tokio::test]
    async fn test_reload_swaps_entries_and_keeps_old_on_failure() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(file, "{}", TOML_REGISTRY).unwrap();

        let registry = Registry::load(file.path()).await.unwrap();
        assert_eq!(registry.path(), Some(file.path()));
        let held = registry.resolve("node").await.unwrap();

        std::fs::write(
            file.path(),
            TOML_REGISTRY.replace("name = \"node\"", "name = \"node-lts\""),
        )
        .unwrap();
        assert_eq!(registry.reload().await.unwrap(), 1);
        assert!(registry.resolve("node").await.is_err());
        assert!(registry.contains("node-lts").await);
        // An entry resolved before the reload stays valid for its holder
        assert_eq!(held.name, "node");

        std::fs::write(file.path(), "not = [valid").unwrap();
        assert!(registry.reload().await.is_err());
        assert!(registry.contains("node-lts").await);
    }
}
