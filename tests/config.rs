use assert_matches::assert_matches;

use repos_consumer::config::{ConfigLoader, LockScope, PlaceholderPolicy};
use repos_consumer::error::HarvestError;

fn write_config(content: &str) -> (tempfile::TempDir, String) {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("repos-consumer.json");
    std::fs::write(&path, content).unwrap();
    let path = path.to_str().unwrap().to_string();
    (temp, path)
}

#[test]
fn load_full_config_file() {
    let (_temp, path) = write_config(
        r#"{
            "source": "https://producer.example.org/",
            "storage_root": "/var/lib/repos-consumer",
            "default_auth": "localdb",
            "default_auth_force_user_create": true,
            "lock_scope": "global",
            "lock_ttl_secs": 60,
            "force_http_urls": false,
            "placeholder_on_failure": "delete"
        }"#,
    );

    let config = ConfigLoader::resolve(Some(&path)).unwrap();
    assert_eq!(config.source.as_deref(), Some("https://producer.example.org"));
    assert_eq!(config.storage_root.as_str(), "/var/lib/repos-consumer");
    assert_eq!(config.default_auth.as_deref(), Some("localdb"));
    assert!(config.force_user_create);
    assert_eq!(config.lock_scope, LockScope::Global);
    assert_eq!(config.lock_ttl_secs, 60);
    assert!(!config.force_http_urls);
    assert_eq!(config.placeholder_on_failure, PlaceholderPolicy::Delete);
    assert_eq!(config.key_parameter, "key");
}

#[test]
fn unknown_lock_scope_is_parse_error() {
    let (_temp, path) = write_config(r#"{"lock_scope": "cluster"}"#);
    assert_matches!(
        ConfigLoader::resolve(Some(&path)),
        Err(HarvestError::ConfigParse(_))
    );
}

#[test]
fn explicit_missing_path_is_read_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("absent.json");
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(HarvestError::ConfigRead(_))
    );
}

#[test]
fn invalid_source_in_file() {
    let (_temp, path) = write_config(r#"{"source": "ftp://producer.example.org"}"#);
    assert_matches!(
        ConfigLoader::resolve(Some(&path)),
        Err(HarvestError::InvalidSource(_))
    );
}
