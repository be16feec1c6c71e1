use crate::error::{ManagerError, Result};
use proxy_protocol::ProxyType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const CURRENT_VERSION: u32 = 3;
pub const STATE_FILE_NAME: &str = "state.json";
const DEFAULT_PORT_LIMIT: u32 = 10;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateDocument {
    pub version: u32,
    #[serde(default = "default_port_limit")]
    pub port_limit: u32,
    #[serde(default)]
    pub proxy_type: ProxyType,
    #[serde(default = "default_true")]
    pub logging_enabled: bool,
    #[serde(default)]
    pub wireproxy_path: Option<String>,
    #[serde(default)]
    pub profiles: Vec<ProfileRecord>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileRecord {
    pub name: String,
    #[serde(default)]
    pub conf_path: Option<PathBuf>,
    #[serde(default, alias = "proxy_port")]
    pub port: Option<u16>,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub proxy_type: Option<ProxyType>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub last_port: Option<u16>,
    #[serde(default)]
    pub last_connected: Option<u64>,
}

impl Default for StateDocument {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            port_limit: DEFAULT_PORT_LIMIT,
            proxy_type: ProxyType::Socks,
            logging_enabled: true,
            wireproxy_path: None,
            profiles: Vec::new(),
        }
    }
}

impl StateDocument {
    pub fn profile(&self, name: &str) -> Option<&ProfileRecord> {
        self.profiles.iter().find(|profile| profile.name == name)
    }

    pub fn profile_mut(&mut self, name: &str) -> Option<&mut ProfileRecord> {
        self.profiles.iter_mut().find(|profile| profile.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.profile(name).is_some()
    }
}

impl ProfileRecord {
    pub fn new(name: impl Into<String>, conf_path: PathBuf) -> Self {
        Self {
            name: name.into(),
            conf_path: Some(conf_path),
            port: None,
            running: false,
            proxy_type: None,
            pid: None,
            last_port: None,
            last_connected: None,
        }
    }

    pub fn effective_proxy_type(&self, default: ProxyType) -> ProxyType {
        self.proxy_type.unwrap_or(default)
    }

    /// Clears session fields, remembering the port for the next connect.
    pub fn mark_stopped(&mut self) {
        if let Some(port) = self.port.take() {
            self.last_port = Some(port);
        }
        self.running = false;
        self.pid = None;
    }
}

/// Result of [`StateStore::load`].
#[derive(Debug)]
pub struct LoadedState {
    pub document: StateDocument,
    pub migrated_from: Option<u32>,
    pub backup: Option<PathBuf>,
}

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads, migrates and (when migrated) rewrites the state file.
    pub fn load(&self) -> Result<LoadedState> {
        let Some(raw) = self.read_raw()? else {
            return Ok(LoadedState {
                document: StateDocument::default(),
                migrated_from: None,
                backup: None,
            });
        };
        let found = document_version(&raw, &self.path)?;
        let (migrated, backup) = self.migrate(raw)?;
        let document: StateDocument =
            serde_json::from_value(migrated).map_err(|err| self.corrupt(err.to_string()))?;
        let migrated_from = (found != document.version).then_some(found);
        if migrated_from.is_some() {
            self.save(&document)?;
            tracing::info!(
                path = %self.path.display(),
                from = found,
                to = CURRENT_VERSION,
                "state file migrated"
            );
        }
        Ok(LoadedState {
            document,
            migrated_from,
            backup,
        })
    }

    /// Like [`load`](Self::load), but a corrupt file is set aside and replaced by defaults.
    /// Schema errors still propagate.
    pub fn load_or_recover(&self) -> Result<LoadedState> {
        match self.load() {
            Ok(loaded) => Ok(loaded),
            Err(err @ ManagerError::CorruptState { .. }) => {
                let kept = self.quarantine()?;
                tracing::warn!(
                    error = %err,
                    kept = %kept.display(),
                    "state file unreadable, starting from defaults"
                );
                Ok(LoadedState {
                    document: StateDocument::default(),
                    migrated_from: None,
                    backup: None,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Upgrades a raw document to [`CURRENT_VERSION`]. A backup of the file on disk is
    /// written before the first step runs; a current document is returned untouched.
    pub fn migrate(&self, mut raw: Value) -> Result<(Value, Option<PathBuf>)> {
        let mut version = document_version(&raw, &self.path)?;
        if version > CURRENT_VERSION {
            return Err(ManagerError::UnsupportedSchema {
                found: version,
                supported: CURRENT_VERSION,
            });
        }
        if version == CURRENT_VERSION {
            return Ok((raw, None));
        }

        let backup = self.backup()?;
        let object = raw
            .as_object_mut()
            .ok_or_else(|| self.corrupt("top level is not an object".to_string()))?;
        while version < CURRENT_VERSION {
            match version {
                0 => {}
                1 => {
                    object
                        .entry("proxy_type")
                        .or_insert_with(|| Value::from(ProxyType::Socks.as_str()));
                }
                2 => {
                    object
                        .entry("logging_enabled")
                        .or_insert(Value::Bool(true));
                }
                _ => unreachable!("version bounded by CURRENT_VERSION"),
            }
            version += 1;
        }
        object.insert("version".to_string(), Value::from(CURRENT_VERSION));
        Ok((raw, backup))
    }

    pub fn save(&self, document: &StateDocument) -> Result<()> {
        let payload = serde_json::to_vec_pretty(document)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        write_atomic(&self.path, &payload)?;
        Ok(())
    }

    fn read_raw(&self) -> Result<Option<Value>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let value: Value =
            serde_json::from_slice(&bytes).map_err(|err| self.corrupt(err.to_string()))?;
        if !value.is_object() {
            return Err(self.corrupt("top level is not an object".to_string()));
        }
        Ok(Some(value))
    }

    fn backup(&self) -> Result<Option<PathBuf>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let target = self.sibling(&format!("bak-{}", unix_now()));
        fs::copy(&self.path, &target)?;
        tracing::info!(backup = %target.display(), "state file backed up before migration");
        Ok(Some(target))
    }

    fn quarantine(&self) -> Result<PathBuf> {
        let target = self.sibling(&format!("corrupt-{}", unix_now()));
        fs::copy(&self.path, &target)?;
        Ok(target)
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| STATE_FILE_NAME.into());
        name.push(format!(".{suffix}"));
        self.path.with_file_name(name)
    }

    fn corrupt(&self, reason: String) -> ManagerError {
        ManagerError::CorruptState {
            path: self.path.clone(),
            reason,
        }
    }
}

fn document_version(raw: &Value, path: &Path) -> Result<u32> {
    let object: &Map<String, Value> = raw.as_object().ok_or_else(|| ManagerError::CorruptState {
        path: path.to_path_buf(),
        reason: "top level is not an object".to_string(),
    })?;
    match object.get("version") {
        None | Some(Value::Null) => Ok(0),
        Some(value) => value
            .as_u64()
            .and_then(|version| u32::try_from(version).ok())
            .ok_or_else(|| ManagerError::CorruptState {
                path: path.to_path_buf(),
                reason: format!("invalid version field {value}"),
            }),
    }
}

/// Writes through a temp file in the same directory and renames it over `path`.
pub(crate) fn write_atomic(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    tmp_name.push(format!(".tmp-{}", std::process::id()));
    let tmp = path.with_file_name(tmp_name);
    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(payload)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn default_port_limit() -> u32 {
    DEFAULT_PORT_LIMIT
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::temp_dir;

    fn backups_in(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with("state.json.bak-"))
            .collect()
    }

    #[test]
    fn missing_file_loads_default_document() {
        let dir = temp_dir("wpm-store-missing");
        let store = StateStore::new(dir.join(STATE_FILE_NAME));
        let loaded = store.load().expect("load");
        assert_eq!(loaded.document, StateDocument::default());
        assert!(loaded.migrated_from.is_none());
        assert!(!store.path().exists());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn v1_document_gains_proxy_type_and_backup() {
        let dir = temp_dir("wpm-store-v1");
        let path = dir.join(STATE_FILE_NAME);
        fs::write(
            &path,
            r#"{"version":1,"port_limit":4,"profiles":[{"name":"nl","proxy_port":60002,"running":true}]}"#,
        )
        .unwrap();
        let store = StateStore::new(&path);
        let loaded = store.load().expect("load");

        assert_eq!(loaded.migrated_from, Some(1));
        assert_eq!(loaded.document.version, CURRENT_VERSION);
        assert_eq!(loaded.document.proxy_type, ProxyType::Socks);
        assert!(loaded.document.logging_enabled);
        assert_eq!(loaded.document.port_limit, 4);
        assert_eq!(loaded.document.profiles[0].port, Some(60002));

        let backups = backups_in(&dir);
        assert_eq!(backups.len(), 1);
        assert_eq!(loaded.backup, Some(dir.join(&backups[0])));
        let original = fs::read_to_string(dir.join(&backups[0])).unwrap();
        assert!(original.contains(r#""version":1"#));

        let rewritten: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(rewritten["version"], CURRENT_VERSION);
        assert_eq!(rewritten["proxy_type"], "socks");
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn migration_keeps_existing_values() {
        let dir = temp_dir("wpm-store-keep");
        let store = StateStore::new(dir.join(STATE_FILE_NAME));
        let raw = serde_json::json!({"version": 2, "proxy_type": "http", "logging_enabled": false});
        let (migrated, backup) = store.migrate(raw).expect("migrate");
        assert!(backup.is_none(), "no file on disk to back up");
        assert_eq!(migrated["proxy_type"], "http");
        assert_eq!(migrated["logging_enabled"], false);
        assert_eq!(migrated["version"], CURRENT_VERSION);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn current_document_migrates_to_itself_without_backup() {
        let dir = temp_dir("wpm-store-current");
        let path = dir.join(STATE_FILE_NAME);
        let store = StateStore::new(&path);
        store.save(&StateDocument::default()).unwrap();
        let raw: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();

        let (migrated, backup) = store.migrate(raw.clone()).expect("migrate");
        assert_eq!(migrated, raw);
        assert!(backup.is_none());
        let (again, _) = store.migrate(migrated).expect("migrate twice");
        assert_eq!(again, raw);
        assert!(backups_in(&dir).is_empty());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn future_version_is_rejected() {
        let dir = temp_dir("wpm-store-future");
        let path = dir.join(STATE_FILE_NAME);
        fs::write(&path, r#"{"version":99,"profiles":[]}"#).unwrap();
        let store = StateStore::new(&path);
        let err = store.load().expect_err("future version");
        assert!(matches!(
            err,
            ManagerError::UnsupportedSchema { found: 99, .. }
        ));
        assert!(matches!(
            store.load_or_recover(),
            Err(ManagerError::UnsupportedSchema { .. })
        ));
        assert!(backups_in(&dir).is_empty());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn corrupt_file_is_reported_then_recovered() {
        let dir = temp_dir("wpm-store-corrupt");
        let path = dir.join(STATE_FILE_NAME);
        fs::write(&path, "{not json").unwrap();
        let store = StateStore::new(&path);
        assert!(matches!(store.load(), Err(ManagerError::CorruptState { .. })));

        let document = store.load_or_recover().expect("recover").document;
        assert_eq!(document, StateDocument::default());
        let kept = fs::read_dir(&dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .any(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("state.json.corrupt-")
            });
        assert!(kept);
        assert_eq!(fs::read_to_string(&path).unwrap(), "{not json");
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn non_object_document_is_corrupt() {
        let dir = temp_dir("wpm-store-array");
        let path = dir.join(STATE_FILE_NAME);
        fs::write(&path, "[1,2,3]").unwrap();
        let store = StateStore::new(&path);
        assert!(matches!(store.load(), Err(ManagerError::CorruptState { .. })));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn save_replaces_file_without_leftovers() {
        let dir = temp_dir("wpm-store-save");
        let path = dir.join(STATE_FILE_NAME);
        let store = StateStore::new(&path);
        let mut document = StateDocument::default();
        document
            .profiles
            .push(ProfileRecord::new("de", dir.join("de.conf")));
        store.save(&document).unwrap();
        document.port_limit = 0;
        store.save(&document).unwrap();

        let names: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec![STATE_FILE_NAME.to_string()]);
        assert_eq!(store.load().unwrap().document, document);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn mark_stopped_remembers_last_port() {
        let mut record = ProfileRecord::new("fr", PathBuf::from("fr.conf"));
        record.port = Some(60010);
        record.running = true;
        record.pid = Some(4242);
        record.mark_stopped();
        assert_eq!(record.port, None);
        assert_eq!(record.last_port, Some(60010));
        assert!(!record.running);
        assert!(record.pid.is_none());
    }
}
