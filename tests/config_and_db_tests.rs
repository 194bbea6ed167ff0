use std::fs::File;
use std::io::Write;
use std::time::Duration;
use tempfile::tempdir;

use playback_gateway::config::{CacheTtlRule, Config};
use playback_gateway::db;
use playback_gateway::gateway::GatewaySettings;
use playback_gateway::models::TokenState;
use playback_gateway::store::{SqliteTokenStore, TokenStore};

#[test]
fn config_from_path_parses_toml_with_defaults() {
    let td = tempdir().unwrap();
    let cfg_path = td.path().join("cfg.toml");
    let mut f = File::create(&cfg_path).unwrap();
    let toml = r#"
db_path = "/tmp/test.db"
log_dir = "/tmp"
poll_idle_secs = 45

[[cache_ttl]]
prefix = "/me/player"
secs = 2
"#;
    f.write_all(toml.as_bytes()).unwrap();
    let cfg = Config::from_path(&cfg_path).expect("parse config");
    assert_eq!(cfg.db_path.to_str().unwrap(), "/tmp/test.db");
    assert_eq!(cfg.poll_idle_secs, 45);
    assert_eq!(cfg.poll_active_secs, 5);
    assert_eq!(cfg.refresh_buffer(), Duration::from_secs(300));
    assert_eq!(cfg.request_timeout(), Duration::from_secs(10));
    assert_eq!(cfg.cache_ttl, vec![CacheTtlRule { prefix: "/me/player".into(), secs: 2 }]);
    cfg.validate().expect("valid");

    let settings = GatewaySettings::from_config(&cfg);
    assert_eq!(settings.ttl_for("/me/player"), Duration::from_secs(2));
    assert_eq!(settings.ttl_for("/search?q=x"), Duration::from_secs(30));
}

#[test]
fn shipped_example_config_is_valid() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config/example-config.toml");
    let cfg = Config::from_path(&path).expect("example config parses");
    cfg.validate().expect("example config validates");
    assert_eq!(cfg.cache_ttl.len(), 2);
}

#[test]
fn edited_poll_settings_in_example_config_take_effect() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config/example-config.toml");
    let shipped = std::fs::read_to_string(&path).unwrap();
    let edited = shipped
        .replace("poll_active_secs = 5", "poll_active_secs = 7")
        .replace("poll_idle_secs = 30", "poll_idle_secs = 45")
        .replace("poll_max_backoff_secs = 120", "poll_max_backoff_secs = 90");
    assert_ne!(edited, shipped);

    let td = tempdir().unwrap();
    let cfg_path = td.path().join("cfg.toml");
    std::fs::write(&cfg_path, edited).unwrap();
    let cfg = Config::from_path(&cfg_path).expect("parse edited config");
    assert_eq!(cfg.poll_active_secs, 7);
    assert_eq!(cfg.poll_idle_secs, 45);
    assert_eq!(cfg.poll_max_backoff_secs, 90);
}

#[test]
fn misplaced_keys_after_cache_ttl_tables_are_rejected() {
    let toml = r#"
[[cache_ttl]]
prefix = "/me/player"
secs = 3
poll_active_secs = 7
"#;
    let td = tempdir().unwrap();
    let cfg_path = td.path().join("cfg.toml");
    std::fs::write(&cfg_path, toml).unwrap();
    assert!(Config::from_path(&cfg_path).is_err());
}

#[test]
fn validate_rejects_inconsistent_settings() {
    let cfg = Config { poll_active_secs: 60, poll_idle_secs: 30, ..Config::default() };
    assert!(cfg.validate().is_err());

    let cfg = Config { refresh_buffer_secs: 3600, ..Config::default() };
    assert!(cfg.validate().is_err());

    let cfg = Config { rate_limit_max_retries: 0, ..Config::default() };
    assert!(cfg.validate().is_err());

    let cfg = Config {
        cache_ttl: vec![CacheTtlRule { prefix: "me".into(), secs: 1 }],
        ..Config::default()
    };
    assert!(cfg.validate().is_err());

    let cfg = Config { api_base: "not a url".into(), ..Config::default() };
    assert!(cfg.validate().is_err());

    assert!(Config::default().validate().is_ok());
}

#[test]
fn run_migrations_creates_tables() {
    let td = tempdir().unwrap();
    let db_path = td.path().join("test.db");
    let conn = rusqlite::Connection::open(&db_path).unwrap();
    db::run_migrations(&conn).expect("run migrations");
    // idempotent
    db::run_migrations(&conn).expect("run migrations again");
    for table in ["credentials", "metadata"] {
        let found: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type='table' AND name=?1",
                [table],
                |r| r.get(0),
            )
            .ok();
        assert_eq!(found.as_deref(), Some(table), "{} table should exist", table);
    }
}

#[test]
fn credentials_upsert_preserves_client_fields() {
    let td = tempdir().unwrap();
    let conn = db::open_or_create(&td.path().join("nested/dir/test.db")).expect("open");
    db::save_credential_raw(&conn, "spotify", "{}", Some("id"), Some("secret")).unwrap();
    db::save_credential_raw(&conn, "spotify", r#"{"v":2}"#, None, None).unwrap();

    let (json, id, secret) = db::load_credential_with_client(&conn, "spotify").unwrap().expect("row");
    assert_eq!(json, r#"{"v":2}"#);
    assert_eq!(id.as_deref(), Some("id"));
    assert_eq!(secret.as_deref(), Some("secret"));

    assert!(db::delete_credential(&conn, "spotify").unwrap());
    assert!(!db::delete_credential(&conn, "spotify").unwrap());
    assert!(db::load_credential_with_client(&conn, "spotify").unwrap().is_none());
}

#[test]
fn metadata_upserts() {
    let td = tempdir().unwrap();
    let conn = db::open_or_create(&td.path().join("test.db")).expect("open");
    assert_eq!(db::get_metadata(&conn, "k").unwrap(), None);
    db::set_metadata(&conn, "k", "one").unwrap();
    db::set_metadata(&conn, "k", "two").unwrap();
    assert_eq!(db::get_metadata(&conn, "k").unwrap().as_deref(), Some("two"));
}

#[test]
fn sqlite_store_round_trips_and_clears() {
    let td = tempdir().unwrap();
    let store = SqliteTokenStore::new(td.path().join("tokens.db"), "spotify");
    let token = TokenState {
        access_token: "a".into(),
        token_type: "Bearer".into(),
        expires_at: 1_700_000_000,
        refresh_token: Some("r".into()),
        scope: Some("user-read-private".into()),
    };

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        assert_eq!(store.get().await.unwrap(), None);
        store.set(&token).await.unwrap();
        assert_eq!(store.get().await.unwrap(), Some(token.clone()));
        store.clear().await.unwrap();
        assert_eq!(store.get().await.unwrap(), None);
    });
}
