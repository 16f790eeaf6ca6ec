use std::{
    fs::{self, File},
    io::Write as _,
    path::{Path, PathBuf},
};

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest as _, Sha256};

use crate::{config::LogNamingConfig, error::EngineError, har::LogDocument};

pub const LOG_EXTENSION: &str = "har";
const TEST_ID_HASH_LEN: usize = 12;

/// Who owns a log: one log per test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestIdentity {
    pub id: String,
    pub title: String,
    /// Source file the test lives in; used to namespace logs.
    pub file: Option<PathBuf>,
}

impl TestIdentity {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            file: None,
        }
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogValidation {
    Valid { entry_count: usize },
    Missing,
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogStats {
    pub exists: bool,
    pub size_bytes: u64,
    pub entry_count: Option<usize>,
    pub version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LogStore {
    naming: LogNamingConfig,
}

impl LogStore {
    pub fn new(naming: LogNamingConfig) -> Self {
        Self { naming }
    }

    pub fn dir(&self) -> &Path {
        &self.naming.dir
    }

    /// `<dir>/[<file stem>/]<title>[-<id hash>].har`, every segment slugged.
    pub fn log_path(&self, test: &TestIdentity) -> PathBuf {
        let max_len = self.naming.max_name_len.max(1);
        let mut path = self.naming.dir.clone();

        if self.naming.organize_by_file
            && let Some(stem) = test
                .file
                .as_deref()
                .and_then(Path::file_stem)
                .and_then(|stem| stem.to_str())
        {
            path.push(slug_ascii(stem, max_len, "tests"));
        }

        let mut name = slug_ascii(&test.title, max_len, "test");
        if self.naming.include_test_id {
            name.push('-');
            name.push_str(&test_id_hash(&test.id));
        }
        path.push(format!("{name}.{LOG_EXTENSION}"));
        path
    }

    pub async fn ensure_parent_dir(&self, path: &Path) -> Result<(), EngineError> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || ensure_parent_dir_blocking(&path))
            .await
            .map_err(|err| EngineError::task("ensure log directory", err))?
    }

    pub async fn validate(&self, path: &Path) -> LogValidation {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || validate_blocking(&path))
            .await
            .unwrap_or_else(|err| LogValidation::Invalid(format!("validation task failed: {err}")))
    }

    pub async fn load(&self, path: &Path) -> Result<LogDocument, EngineError> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || load_blocking(&path))
            .await
            .map_err(|err| EngineError::task("load exchange log", err))?
    }

    pub async fn write(&self, path: &Path, document: LogDocument) -> Result<(), EngineError> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || write_blocking(&path, &document))
            .await
            .map_err(|err| EngineError::task("write exchange log", err))?
    }

    pub async fn stats(&self, path: &Path) -> LogStats {
        let path = path.to_path_buf();
        let fallback = LogStats {
            exists: false,
            size_bytes: 0,
            entry_count: None,
            version: None,
        };
        tokio::task::spawn_blocking(move || stats_blocking(&path))
            .await
            .unwrap_or(fallback)
    }
}

fn ensure_parent_dir_blocking(path: &Path) -> Result<(), EngineError> {
    let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) else {
        return Ok(());
    };
    fs::create_dir_all(parent).map_err(|source| EngineError::Write {
        path: parent.to_path_buf(),
        source,
    })
}

fn validate_blocking(path: &Path) -> LogValidation {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return LogValidation::Missing,
        Err(err) => return LogValidation::Invalid(format!("unreadable: {err}")),
    };

    let value: Value = match serde_json::from_slice(&raw) {
        Ok(value) => value,
        Err(err) => return LogValidation::Invalid(format!("not valid JSON: {err}")),
    };
    let Some(entries) = value
        .get("log")
        .and_then(|log| log.get("entries"))
        .and_then(Value::as_array)
    else {
        return LogValidation::Invalid("missing `log.entries` array".to_owned());
    };
    let entry_count = entries.len();

    match serde_json::from_value::<LogDocument>(value) {
        Ok(_) => LogValidation::Valid { entry_count },
        Err(err) => LogValidation::Invalid(format!("malformed entry: {err}")),
    }
}

fn load_blocking(path: &Path) -> Result<LogDocument, EngineError> {
    let raw = fs::read(path).map_err(|source| EngineError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&raw).map_err(|source| EngineError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn write_blocking(path: &Path, document: &LogDocument) -> Result<(), EngineError> {
    let json = serde_json::to_vec_pretty(document).map_err(EngineError::Serialize)?;
    ensure_parent_dir_blocking(path)?;

    let tmp_path = temp_sibling(path);
    let result = (|| {
        let mut file = File::create(&tmp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if let Err(err) = result {
        let _ = fs::remove_file(&tmp_path);
        return Err(EngineError::Write {
            path: path.to_path_buf(),
            source: err,
        });
    }
    Ok(())
}

fn stats_blocking(path: &Path) -> LogStats {
    let Ok(metadata) = fs::metadata(path) else {
        return LogStats {
            exists: false,
            size_bytes: 0,
            entry_count: None,
            version: None,
        };
    };

    let document = fs::read(path)
        .ok()
        .and_then(|raw| serde_json::from_slice::<Value>(&raw).ok());
    let log = document.as_ref().and_then(|document| document.get("log"));
    LogStats {
        exists: true,
        size_bytes: metadata.len(),
        entry_count: log
            .and_then(|log| log.get("entries"))
            .and_then(Value::as_array)
            .map(Vec::len),
        version: log
            .and_then(|log| log.get("version"))
            .and_then(Value::as_str)
            .map(str::to_owned),
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.tmp", std::process::id()));
    path.with_file_name(name)
}

fn test_id_hash(id: &str) -> String {
    let mut hex = format!("{:x}", Sha256::digest(id.as_bytes()));
    hex.truncate(TEST_ID_HASH_LEN);
    hex
}

fn slug_ascii(value: &str, max_len: usize, fallback: &str) -> String {
    let mut slug = String::new();
    let mut previous_dash = false;
    for ch in value.chars() {
        let lowered = ch.to_ascii_lowercase();
        if lowered.is_ascii_alphanumeric() {
            slug.push(lowered);
            previous_dash = false;
        } else if !previous_dash {
            slug.push('-');
            previous_dash = true;
        }
        if slug.len() >= max_len {
            break;
        }
    }
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        fallback.to_owned()
    } else {
        slug.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path};

    use chrono::Utc;
    use hyper::{Method, StatusCode};
    use url::Url;

    use super::{LogStore, LogValidation, TestIdentity, slug_ascii, test_id_hash};
    use crate::{
        builder::{CaptureOptions, build_entry, new_log, push_entry},
        config::LogNamingConfig,
        intercept::{InterceptedRequest, InterceptedResponse},
    };

    fn store(dir: &Path) -> LogStore {
        LogStore::new(LogNamingConfig {
            dir: dir.to_path_buf(),
            ..LogNamingConfig::default()
        })
    }

    #[test]
    fn log_path_is_namespaced_by_test_file() {
        let store = store(Path::new("logs"));
        let test = TestIdentity::new("t-1", "User can log in!").with_file("tests/auth/login.spec.ts");
        assert_eq!(
            store.log_path(&test),
            Path::new("logs/login-spec/user-can-log-in.har")
        );
        assert_eq!(store.log_path(&test), store.log_path(&test.clone()));
    }

    #[test]
    fn log_path_caps_slugs_and_can_append_test_id_hash() {
        let store = LogStore::new(LogNamingConfig {
            dir: "logs".into(),
            organize_by_file: false,
            max_name_len: 10,
            include_test_id: true,
        });
        let a = store.log_path(&TestIdentity::new("suite::a", "A very long test title"));
        let b = store.log_path(&TestIdentity::new("suite::b", "A very long test title"));
        assert_ne!(a, b);

        let name = a.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, format!("a-very-lon-{}.har", test_id_hash("suite::a")));
        assert_eq!(test_id_hash("suite::a").len(), 12);
    }

    #[test]
    fn slug_ascii_collapses_delimiters_and_truncates() {
        assert_eq!(slug_ascii("AAA___BBB___CCC___DDD", 10, "fallback"), "aaa-bbb-cc");
        assert_eq!(slug_ascii("!!!", 10, "fallback"), "fallback");
    }

    #[tokio::test]
    async fn validate_distinguishes_missing_malformed_and_valid() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let store = store(dir.path());

        let missing = dir.path().join("missing.har");
        assert_eq!(store.validate(&missing).await, LogValidation::Missing);

        let garbage = dir.path().join("garbage.har");
        fs::write(&garbage, "{ not json").unwrap();
        assert!(matches!(store.validate(&garbage).await, LogValidation::Invalid(_)));

        let no_entries = dir.path().join("no-entries.har");
        fs::write(&no_entries, r#"{"log":{"version":"1.2"}}"#).unwrap();
        assert_eq!(
            store.validate(&no_entries).await,
            LogValidation::Invalid("missing `log.entries` array".to_owned())
        );

        let empty = dir.path().join("empty.har");
        store.write(&empty, new_log()).await.unwrap();
        assert_eq!(
            store.validate(&empty).await,
            LogValidation::Valid { entry_count: 0 }
        );
    }

    #[tokio::test]
    async fn write_is_atomic_and_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let store = store(dir.path());
        let path = dir.path().join("nested/dir/flow.har");

        let mut document = new_log();
        let request = InterceptedRequest::new(
            Method::GET,
            Url::parse("https://api.example.com/movies").unwrap(),
        );
        let response = InterceptedResponse::new(StatusCode::OK).with_body("[]");
        let now = Utc::now();
        push_entry(
            &mut document.log,
            build_entry(&request, Some(&response), now, now, &CaptureOptions::default()),
        );

        store.write(&path, document.clone()).await.unwrap();
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("flow.har")]);

        let loaded = store.load(&path).await.unwrap();
        assert_eq!(loaded, document);

        let stats = store.stats(&path).await;
        assert!(stats.exists);
        assert!(stats.size_bytes > 0);
        assert_eq!(stats.entry_count, Some(1));
        assert_eq!(stats.version.as_deref(), Some("1.2"));
    }

    #[tokio::test]
    async fn stats_for_missing_log() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let stats = store(dir.path()).stats(&dir.path().join("nope.har")).await;
        assert!(!stats.exists);
        assert_eq!(stats.entry_count, None);
    }

    #[tokio::test]
    async fn load_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let path = dir.path().join("bad.har");
        fs::write(&path, "[]").unwrap();
        let err = store(dir.path()).load(&path).await.unwrap_err();
        assert_eq!(err.kind(), "parse");
        assert!(err.to_string().contains("bad.har"), "unexpected: {err}");
    }
}
