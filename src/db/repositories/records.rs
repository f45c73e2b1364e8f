use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::{
    db::{
        helpers::{from_json, to_json},
        Database,
    },
    upload::StructuredStore,
};

pub struct RecordRepository<'a> {
    conn: &'a Connection,
}

impl<'a> RecordRepository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Upsert by path; the original creation time survives overwrites.
    pub fn put(&self, path: &str, body: &serde_json::Value) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO records (path, body, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(path) DO UPDATE SET
                 body = excluded.body,
                 updated_at = excluded.updated_at",
            params![path, to_json(body, "record body")?, now],
        )?;
        Ok(())
    }

    pub fn get(&self, path: &str) -> Result<Option<serde_json::Value>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM records WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|body| from_json(&body, "record body")).transpose()
    }

    pub fn list(&self, prefix: &str) -> Result<Vec<(String, serde_json::Value)>> {
        let mut stmt = self.conn.prepare(
            "SELECT path, body FROM records
             WHERE substr(path, 1, length(?1)) = ?1
             ORDER BY path",
        )?;

        let mut rows = stmt.query(params![prefix])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let path: String = row.get(0)?;
            let body: String = row.get(1)?;
            records.push((path, from_json(&body, "record body")?));
        }
        Ok(records)
    }
}

impl Database {
    pub async fn write_record(&self, path: &str, body: &serde_json::Value) -> Result<()> {
        let path = path.to_string();
        let body = body.clone();
        self.execute(move |conn| RecordRepository::new(conn).put(&path, &body))
            .await
    }

    pub async fn read_record(&self, path: &str) -> Result<Option<serde_json::Value>> {
        let path = path.to_string();
        self.execute(move |conn| RecordRepository::new(conn).get(&path))
            .await
    }

    /// Records whose path starts with `prefix`, ordered by path.
    pub async fn list_records(&self, prefix: &str) -> Result<Vec<(String, serde_json::Value)>> {
        let prefix = prefix.to_string();
        self.execute(move |conn| RecordRepository::new(conn).list(&prefix))
            .await
    }
}

#[async_trait]
impl StructuredStore for Database {
    async fn write(&self, path: &str, record: &serde_json::Value) -> Result<()> {
        self.write_record(path, record).await
    }

    async fn read(&self, path: &str) -> Result<Option<serde_json::Value>> {
        self.read_record(path).await
    }
}
