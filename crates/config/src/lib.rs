#![forbid(unsafe_code)]

use argus_core::{DiscoveryConfig, Transport};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const DEFAULT_ROOT: &str = "/etc/argus";
const MAX_BACKUPS_DEFAULT: usize = 5;

/// Filesystem layout under the config root.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub root: PathBuf,
    pub discovery_yaml: PathBuf,
    pub port_bindings: PathBuf,
    pub state_dir: PathBuf,
    versions_dir: PathBuf,
    meta_file: PathBuf,
}

impl ConfigPaths {
    pub fn new(root: PathBuf) -> Self {
        let state_dir = root.join("state");
        ConfigPaths {
            discovery_yaml: root.join("discovery.yaml"),
            port_bindings: root.join("ports.conf"),
            versions_dir: state_dir.join("versions"),
            meta_file: state_dir.join("meta"),
            state_dir,
            root,
        }
    }
}

pub fn default_root() -> PathBuf {
    std::env::var("ARGUS_CONFIG_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_ROOT))
}

/// Load the worker tunables. A missing or empty file means defaults; an
/// unknown key or out-of-range value is an error.
pub fn load_discovery_config(paths: &ConfigPaths) -> Result<DiscoveryConfig, String> {
    let path = &paths.discovery_yaml;
    let config = if path.exists() {
        let body = fs::read_to_string(path)
            .map_err(|e| format!("read tunables {}: {e}", path.display()))?;
        if body.trim().is_empty() {
            DiscoveryConfig::default()
        } else {
            serde_yaml::from_str(&body)
                .map_err(|e| format!("parse tunables {}: {e}", path.display()))?
        }
    } else {
        DiscoveryConfig::default()
    };
    config.validate()?;
    Ok(config)
}

/// One operator-supplied port binding from ports.conf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub detector: String,
    pub transport: Transport,
    pub port: u16,
    pub reversed: bool,
}

/// Parse ports.conf: one `<detector> <tcp|udp|udp-reversed> <port>` binding
/// per line, `#` comments allowed. A missing file means no bindings.
pub fn load_port_bindings(paths: &ConfigPaths) -> Result<Vec<PortBinding>, String> {
    let path = &paths.port_bindings;
    if !path.exists() {
        return Ok(Vec::new());
    }
    let body = fs::read_to_string(path)
        .map_err(|e| format!("read port bindings {}: {e}", path.display()))?;
    let mut bindings = Vec::new();
    for (lineno, raw) in body.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let detector = fields.next();
        let transport = fields.next();
        let port = fields.next();
        let (Some(detector), Some(transport), Some(port)) = (detector, transport, port) else {
            return Err(format!(
                "{}:{}: expected <detector> <transport> <port>",
                path.display(),
                lineno + 1
            ));
        };
        if fields.next().is_some() {
            return Err(format!(
                "{}:{}: trailing fields after port",
                path.display(),
                lineno + 1
            ));
        }
        let (transport, reversed) = match transport {
            "tcp" => (Transport::Tcp, false),
            "udp" => (Transport::Udp, false),
            "udp-reversed" => (Transport::Udp, true),
            other => {
                return Err(format!(
                    "{}:{}: unknown transport {other}",
                    path.display(),
                    lineno + 1
                ));
            }
        };
        let port: u16 = port.parse().map_err(|_| {
            format!("{}:{}: invalid port {port}", path.display(), lineno + 1)
        })?;
        bindings.push(PortBinding {
            detector: detector.to_string(),
            transport,
            port,
            reversed,
        });
    }
    Ok(bindings)
}

#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub hash_hex: String,
    pub tampered: bool,
}

/// Versioned store for the tracked config files. Recording a version copies
/// them aside and notes a content hash so later edits outside the tool show
/// up as tampering.
pub struct ConfigStore {
    pub paths: ConfigPaths,
    max_backups: usize,
}

impl ConfigStore {
    pub fn new(root: PathBuf) -> Result<Self, String> {
        Self::with_backups(root, MAX_BACKUPS_DEFAULT)
    }

    pub fn with_backups(root: PathBuf, max_backups: usize) -> Result<Self, String> {
        let store = ConfigStore {
            paths: ConfigPaths::new(root),
            max_backups: max_backups.max(1),
        };
        for dir in [
            store.paths.root.as_path(),
            store.paths.state_dir.as_path(),
            store.paths.versions_dir.as_path(),
        ] {
            fs::create_dir_all(dir).map_err(|e| format!("create dir {}: {e}", dir.display()))?;
        }
        Ok(store)
    }

    fn tracked(&self) -> [&Path; 2] {
        [&self.paths.discovery_yaml, &self.paths.port_bindings]
    }

    fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for path in self.tracked() {
            hasher.update(path.to_string_lossy().as_bytes());
            if let Ok(mut f) = fs::File::open(path) {
                let mut buf = [0u8; 8192];
                while let Ok(n) = f.read(&mut buf) {
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
            }
        }
        hex::encode(hasher.finalize())
    }

    fn read_meta(&self) -> (u64, String) {
        let Ok(body) = fs::read_to_string(&self.paths.meta_file) else {
            return (0, String::new());
        };
        let mut fields = body.split_whitespace();
        let version = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        let hash = fields.next().unwrap_or("").to_string();
        (version, hash)
    }

    fn write_meta(&self, version: u64, hash: &str) -> Result<(), String> {
        let updated_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        fs::write(
            &self.paths.meta_file,
            format!("{version} {hash} {updated_at}\n"),
        )
        .map_err(|e| format!("write meta {}: {e}", self.paths.meta_file.display()))
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        let (version, recorded) = self.read_meta();
        let hash = self.content_hash();
        ConfigSnapshot {
            version,
            tampered: !recorded.is_empty() && recorded != hash,
            hash_hex: hash,
        }
    }

    /// Snapshot the tracked files into a new version directory.
    pub fn record_version(&self) -> Result<ConfigSnapshot, String> {
        let (version, _) = self.read_meta();
        let version = version.saturating_add(1);
        let dir = self.paths.versions_dir.join(format!("v{version}"));
        fs::create_dir_all(&dir).map_err(|e| format!("create {}: {e}", dir.display()))?;
        for path in self.tracked() {
            if path.exists()
                && let Some(name) = path.file_name()
            {
                let _ = fs::copy(path, dir.join(name));
            }
        }
        self.prune_backups()?;
        self.write_meta(version, &self.content_hash())?;
        Ok(self.snapshot())
    }

    /// Restore the tracked files from the previous version.
    pub fn rollback(&self) -> Result<ConfigSnapshot, String> {
        let (version, _) = self.read_meta();
        if version == 0 {
            return Err("no recorded versions to roll back to".into());
        }
        let target = version - 1;
        let dir = self.paths.versions_dir.join(format!("v{target}"));
        if !dir.exists() {
            return Err(format!("version {target} backup missing"));
        }
        for path in self.tracked() {
            if let Some(name) = path.file_name() {
                let backup = dir.join(name);
                if backup.exists() {
                    fs::copy(&backup, path)
                        .map_err(|e| format!("restore {}: {e}", path.display()))?;
                }
            }
        }
        self.write_meta(target, &self.content_hash())?;
        Ok(self.snapshot())
    }

    fn prune_backups(&self) -> Result<(), String> {
        let entries = fs::read_dir(&self.paths.versions_dir)
            .map_err(|e| format!("read {}: {e}", self.paths.versions_dir.display()))?;
        let mut versions: Vec<(u64, PathBuf)> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                e.file_name()
                    .to_string_lossy()
                    .strip_prefix('v')
                    .and_then(|v| v.parse().ok())
                    .map(|v| (v, e.path()))
            })
            .collect();
        versions.sort_by_key(|(v, _)| *v);
        while versions.len() > self.max_backups {
            let (_, path) = versions.remove(0);
            let _ = fs::remove_dir_all(path);
        }
        Ok(())
    }
}
