use crate::error::{ManagerError, Result};
use crate::store::{write_atomic, ProfileRecord, StateDocument};
use crate::wireguard;
use std::fs;
use std::path::{Path, PathBuf};
use system_utils::path::safe_file_stem;

pub const GENERATED_SUFFIX: &str = "_wireproxy.conf";
const CONF_EXTENSION: &str = "conf";
const MAX_NAME_LEN: usize = 64;
const FALLBACK_NAME: &str = "imported";

/// Owns the managed profile directory: one `<name>.conf` per registered profile.
pub struct ProfileImporter {
    profiles_dir: PathBuf,
}

impl ProfileImporter {
    pub fn new(profiles_dir: impl Into<PathBuf>) -> Self {
        Self {
            profiles_dir: profiles_dir.into(),
        }
    }

    pub fn profiles_dir(&self) -> &Path {
        &self.profiles_dir
    }

    pub fn conf_path(&self, name: &str) -> PathBuf {
        self.profiles_dir.join(format!("{name}.{CONF_EXTENSION}"))
    }

    /// Validates `config`, copies it into the profile directory and appends the new
    /// record to `document`. Nothing is touched when validation or the copy fails.
    pub fn import(
        &self,
        document: &mut StateDocument,
        config: &str,
        suggested_name: Option<&str>,
    ) -> Result<ProfileRecord> {
        wireguard::validate(config)?;
        let name = derive_name(config, suggested_name)?;
        let path = self.conf_path(&name);
        if document.contains(&name) || path.exists() {
            return Err(ManagerError::DuplicateProfile(name));
        }
        write_atomic(&path, config.as_bytes())?;
        let record = ProfileRecord::new(name, path);
        document.profiles.push(record.clone());
        tracing::info!(profile = %record.name, "profile imported");
        Ok(record)
    }

    pub fn import_file(&self, document: &mut StateDocument, source: &Path) -> Result<ProfileRecord> {
        let config = fs::read_to_string(source)?;
        let stem = source
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string());
        self.import(document, &config, stem.as_deref())
    }

    /// Registers `.conf` files that were dropped into the profile directory by hand.
    pub fn discover(&self, document: &mut StateDocument) -> Result<Vec<String>> {
        fs::create_dir_all(&self.profiles_dir)?;
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.profiles_dir)? {
            let path = entry?.path();
            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if file_name.ends_with(GENERATED_SUFFIX)
                || path.extension().and_then(|ext| ext.to_str()) != Some(CONF_EXTENSION)
            {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if document.contains(name) {
                continue;
            }
            if safe_file_stem(name) != name || name.len() > MAX_NAME_LEN {
                tracing::warn!(path = %path.display(), "skipping profile with unsupported name");
                continue;
            }
            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "failed to read profile");
                    continue;
                }
            };
            if let Err(err) = wireguard::validate(&text) {
                tracing::warn!(path = %path.display(), error = %err, "skipping invalid profile");
                continue;
            }
            document
                .profiles
                .push(ProfileRecord::new(name.to_string(), path.clone()));
            tracing::info!(profile = %name, "discovered profile on disk");
            found.push(name.to_string());
        }
        found.sort();
        Ok(found)
    }

    pub fn write_config(&self, path: &Path, config: &str) -> Result<()> {
        wireguard::validate(config)?;
        write_atomic(path, config.as_bytes())?;
        Ok(())
    }

    pub fn read_config(&self, record: &ProfileRecord) -> Result<String> {
        Ok(fs::read_to_string(self.record_path(record))?)
    }

    pub fn rename(&self, from: &ProfileRecord, to: &str) -> Result<PathBuf> {
        let target = self.conf_path(to);
        if target.exists() {
            return Err(ManagerError::DuplicateProfile(to.to_string()));
        }
        fs::rename(self.record_path(from), &target)?;
        Ok(target)
    }

    pub fn remove(&self, record: &ProfileRecord) -> Result<()> {
        match fs::remove_file(self.record_path(record)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn record_path(&self, record: &ProfileRecord) -> PathBuf {
        record
            .conf_path
            .clone()
            .unwrap_or_else(|| self.conf_path(&record.name))
    }
}

/// `base`, then `base_1`, `base_2`, ... until one is unused.
pub fn suggest_name(document: &StateDocument, base: &str) -> String {
    let base = match safe_file_stem(base.trim()) {
        name if name.is_empty() => FALLBACK_NAME.to_string(),
        name => name,
    };
    if !document.contains(&base) {
        return base;
    }
    (1..)
        .map(|index| format!("{base}_{index}"))
        .find(|candidate| !document.contains(candidate))
        .unwrap_or(base)
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ManagerError::InvalidConfig(
            "profile name cannot be empty".to_string(),
        ));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ManagerError::InvalidConfig(format!(
            "profile name longer than {MAX_NAME_LEN} characters"
        )));
    }
    if safe_file_stem(name) != name {
        return Err(ManagerError::InvalidConfig(
            "profile name may only contain letters, digits, - or _".to_string(),
        ));
    }
    Ok(())
}

fn derive_name(config: &str, suggested: Option<&str>) -> Result<String> {
    if let Some(suggested) = suggested.map(str::trim).filter(|name| !name.is_empty()) {
        let name = safe_file_stem(suggested);
        validate_name(&name)?;
        return Ok(name);
    }
    let from_endpoint = wireguard::endpoint_host(config)
        .map(|host| safe_file_stem(&host.replace(['.', ':'], "-")))
        .filter(|name| !name.is_empty())
        .map(|name| name.chars().take(MAX_NAME_LEN).collect::<String>());
    Ok(from_endpoint.unwrap_or_else(|| FALLBACK_NAME.to_string()))
}
