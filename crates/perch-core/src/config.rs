//! Configuration loading.
//!
//! A [`ConfigFile`] is a read-only view of one config file on disk. The
//! format is picked from the file extension (`.json`, `.yaml`/`.yml`,
//! `.ini`) and the parsed value is cached after the first successful read;
//! call [`ConfigFile::invalidate`] to force a re-read. The mapping itself is
//! never mutated after construction.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use serde_json::Value;

use crate::{errors::Error, ini, Result};

/// Default directory for config files, relative to the working directory.
pub const CONFIG_DIRECTORY: &str = "config";

/// Resolves `file_name` inside the default config directory.
pub fn config_path(file_name: &str) -> PathBuf {
    Path::new(CONFIG_DIRECTORY).join(file_name)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Format {
    Json,
    Yaml,
    Ini,
}

impl Format {
    fn detect(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "json" => Some(Format::Json),
            "yaml" | "yml" => Some(Format::Yaml),
            "ini" => Some(Format::Ini),
            _ => None,
        }
    }
}

/// A cached, format-detected configuration file.
#[derive(Debug)]
pub struct ConfigFile {
    path: PathBuf,
    format: Format,
    cache: Mutex<Option<Arc<Value>>>,
}

impl ConfigFile {
    /// Validates the path and picks a reader for it.
    ///
    /// Fails with [`Error::NotFound`] if the path does not exist,
    /// [`Error::AccessDenied`] if it is not a readable regular file, and
    /// [`Error::UnsupportedFormat`] if the extension is not recognized.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let format = Format::detect(&path)
            .ok_or_else(|| Error::UnsupportedFormat(path.clone()))?;

        let meta = fs::metadata(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::NotFound(path.clone()),
            io::ErrorKind::PermissionDenied => Error::AccessDenied(path.clone()),
            _ => Error::Io(e),
        })?;
        if !meta.is_file() {
            return Err(Error::AccessDenied(path));
        }

        Ok(Self {
            path,
            format,
            cache: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the parsed mapping, reading the file on the first call.
    pub fn get(&self) -> Result<Arc<Value>> {
        if let Some(v) = self.cache.lock().ok().and_then(|g| g.clone()) {
            return Ok(v);
        }

        let text = fs::read_to_string(&self.path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::NotFound(self.path.clone()),
            io::ErrorKind::PermissionDenied => Error::AccessDenied(self.path.clone()),
            _ => Error::Io(e),
        })?;

        let value = match self.format {
            Format::Json => serde_json::from_str(&text)?,
            Format::Yaml => {
                let yaml: serde_yaml::Value = serde_yaml::from_str(&text)?;
                serde_json::to_value(yaml)?
            }
            Format::Ini => ini::load(&text)?,
        };

        let value = Arc::new(value);
        if let Ok(mut guard) = self.cache.lock() {
            *guard = Some(value.clone());
        }
        Ok(value)
    }

    /// Discards the cached value; the next `get` re-reads from disk.
    /// Returns the previously cached value, if any.
    pub fn invalidate(&self) -> Option<Arc<Value>> {
        self.cache.lock().ok().and_then(|mut g| g.take())
    }

    pub fn is_cached(&self) -> bool {
        self.cache
            .lock()
            .map(|g| g.is_some())
            .unwrap_or(false)
    }
}

/// Credentials the bot needs before it will start.
#[derive(Clone, Debug)]
pub struct BotAuth {
    pub token: String,
    pub client_id: String,
}

impl BotAuth {
    /// Extracts `auth.token` and `auth.client_id` from the config mapping.
    pub fn from_config(cfg: &Value) -> Result<Self> {
        let auth = cfg.get("auth").ok_or_else(|| {
            Error::Config(
                "config must contain an `auth` section with `token` and `client_id`".to_string(),
            )
        })?;

        let token = required_str(auth, "token")?;
        let client_id = required_str(auth, "client_id")?;

        Ok(Self { token, client_id })
    }
}

fn required_str(section: &Value, key: &str) -> Result<String> {
    match section.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(Error::Config(format!(
            "`auth` section is missing required field `{key}`"
        ))),
    }
}

/// Connection settings for the shared database pool, read from the optional
/// `database` section.
#[derive(Clone, Debug, serde::Deserialize)]
pub struct DbConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

impl DbConfig {
    pub fn from_config(cfg: &Value) -> Option<Self> {
        serde_json::from_value(cfg.get("database")?.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = PathBuf::from(format!("/tmp/perch-cfg-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn reads_json_and_caches() {
        let dir = scratch_dir("json");
        let path = dir.join("bot.json");
        fs::write(&path, r#"{"auth":{"token":"t","client_id":"c"}}"#).unwrap();

        let cfg = ConfigFile::open(&path).unwrap();
        assert!(!cfg.is_cached());
        let v = cfg.get().unwrap();
        assert_eq!(v["auth"]["token"], "t");
        assert!(cfg.is_cached());

        // A rewrite is invisible until invalidated.
        fs::write(&path, r#"{"auth":{"token":"t2","client_id":"c"}}"#).unwrap();
        assert_eq!(cfg.get().unwrap()["auth"]["token"], "t");
        cfg.invalidate();
        assert_eq!(cfg.get().unwrap()["auth"]["token"], "t2");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn reads_yaml_and_ini() {
        let dir = scratch_dir("fmt");

        let yaml = dir.join("bot.yaml");
        fs::write(&yaml, "auth:\n  token: t\n  client_id: c\n").unwrap();
        let v = ConfigFile::open(&yaml).unwrap().get().unwrap();
        assert_eq!(v["auth"]["client_id"], "c");

        let ini = dir.join("bot.ini");
        fs::write(&ini, "[auth]\ntoken = t\nclient_id = c\n").unwrap();
        let v = ConfigFile::open(&ini).unwrap().get().unwrap();
        assert_eq!(v["auth"]["token"], "t");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let err = ConfigFile::open("/tmp/whatever.toml").unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = ConfigFile::open("/tmp/perch-no-such-file.json").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn auth_requires_both_fields() {
        let ok = json!({"auth": {"token": "t", "client_id": "c"}});
        let auth = BotAuth::from_config(&ok).unwrap();
        assert_eq!(auth.token, "t");
        assert_eq!(auth.client_id, "c");

        for broken in [
            json!({}),
            json!({"auth": {"token": "t"}}),
            json!({"auth": {"client_id": "c"}}),
            json!({"auth": {"token": "", "client_id": "c"}}),
        ] {
            assert!(matches!(
                BotAuth::from_config(&broken),
                Err(Error::Config(_))
            ));
        }
    }

    #[test]
    fn numeric_client_id_is_accepted() {
        let cfg = json!({"auth": {"token": "t", "client_id": 42}});
        assert_eq!(BotAuth::from_config(&cfg).unwrap().client_id, "42");
    }

    #[test]
    fn db_config_is_optional() {
        assert!(DbConfig::from_config(&json!({})).is_none());
        let cfg = json!({"database": {"url": "postgres://localhost/perch"}});
        let db = DbConfig::from_config(&cfg).unwrap();
        assert_eq!(db.max_connections, 10);
    }
}
