use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS credentials (
    provider TEXT PRIMARY KEY,
    token_json TEXT NOT NULL,
    client_id TEXT,
    client_secret TEXT,
    last_refreshed INTEGER
);
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
";

pub fn open_or_create(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    run_migrations(&conn)?;
    Ok(conn)
}

pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Save raw credential JSON for a provider, with optional client_id/client_secret.
/// Existing client credentials are preserved when `None` is passed.
pub fn save_credential_raw(
    conn: &Connection,
    provider: &str,
    json_blob: &str,
    client_id: Option<&str>,
    client_secret: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO credentials (provider, token_json, client_id, client_secret, last_refreshed) VALUES (?1, ?2, ?3, ?4, strftime('%s','now')) ON CONFLICT(provider) DO UPDATE SET token_json = excluded.token_json, client_id = COALESCE(excluded.client_id, credentials.client_id), client_secret = COALESCE(excluded.client_secret, credentials.client_secret), last_refreshed = strftime('%s','now')",
        params![provider, json_blob, client_id, client_secret],
    )?;
    Ok(())
}

/// Load raw credential JSON and client_id/client_secret for a provider
pub fn load_credential_with_client(conn: &Connection, provider: &str) -> Result<Option<(String, Option<String>, Option<String>)>> {
    let mut stmt = conn.prepare("SELECT token_json, client_id, client_secret FROM credentials WHERE provider = ?1 LIMIT 1")?;
    let row = stmt
        .query_row(params![provider], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, Option<String>>(1)?, r.get::<_, Option<String>>(2)?))
        })
        .optional()?;
    Ok(row)
}

/// Remove the stored credential row for a provider. Returns true if a row was removed.
pub fn delete_credential(conn: &Connection, provider: &str) -> Result<bool> {
    let removed = conn.execute("DELETE FROM credentials WHERE provider = ?1", params![provider])?;
    Ok(removed > 0)
}

/// Upsert a small metadata record (last refresh time, cached user id ...).
pub fn set_metadata(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO metadata (key, value, updated_at) VALUES (?1, ?2, strftime('%s','now')) ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = strftime('%s','now')",
        params![key, value],
    )?;
    Ok(())
}

pub fn get_metadata(conn: &Connection, key: &str) -> Result<Option<String>> {
    let row = conn
        .query_row("SELECT value FROM metadata WHERE key = ?1 LIMIT 1", params![key], |r| r.get::<_, String>(0))
        .optional()?;
    Ok(row)
}
