//! SQLite-backed version store for controllers that run without write access
//! to PropagatedVersion objects in the host cluster.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::{counter, histogram};
use rusqlite::{params, Connection, OptionalExtension};

use kfed_core::{FedError, FedResult, PropagatedVersion, QualifiedName};

use crate::VersionStore;

pub struct SqliteVersionStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteVersionStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("KFED_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        let me = Self::init(db)?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    pub fn open_in_memory() -> Result<Self> { Self::init(Connection::open_in_memory().context("opening in-memory sqlite db")?) }

    fn init(db: Connection) -> Result<Self> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS propagated_versions (
                namespace        TEXT NOT NULL,
                name             TEXT NOT NULL,
                rv               INTEGER NOT NULL,
                template_version TEXT NOT NULL,
                override_version TEXT NOT NULL,
                clusters         TEXT NOT NULL,
                PRIMARY KEY (namespace, name)
            )",
            [],
        )
        .context("creating propagated_versions table")?;
        Ok(Self { db: Arc::new(Mutex::new(db)) })
    }

    async fn run<T, F>(&self, f: F) -> FedResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> FedResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut conn = db.lock().map_err(|_| FedError::Invariant("sqlite connection poisoned".into()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| FedError::Invariant(format!("sqlite task failed: {}", e)))?
    }
}

fn db_err(e: rusqlite::Error) -> FedError { FedError::Transient(format!("sqlite: {}", e)) }

fn ns_col(ns: Option<&str>) -> String { ns.unwrap_or_default().to_string() }

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, i64, String, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
}

fn decode(raw: (String, String, i64, String, String, String)) -> FedResult<PropagatedVersion> {
    let (ns, name, rv, template_version, override_version, clusters) = raw;
    let cluster_versions: BTreeMap<String, String> = serde_json::from_str(&clusters)
        .map_err(|e| FedError::Invariant(format!("corrupt cluster versions for {}: {}", name, e)))?;
    Ok(PropagatedVersion {
        namespace: Some(ns).filter(|n| !n.is_empty()),
        name,
        template_version,
        override_version,
        cluster_versions,
        resource_version: Some(rv.to_string()),
    })
}

fn encode_clusters(r: &PropagatedVersion) -> FedResult<String> {
    serde_json::to_string(&r.cluster_versions).map_err(|e| FedError::Invariant(format!("encoding cluster versions: {}", e)))
}

const SELECT: &str = "SELECT namespace, name, rv, template_version, override_version, clusters FROM propagated_versions";

#[async_trait]
impl VersionStore for SqliteVersionStore {
    async fn list(&self, namespace: Option<&str>) -> FedResult<Vec<PropagatedVersion>> {
        let ns = namespace.map(|s| s.to_string());
        self.run(move |db| {
            let raw = match ns {
                Some(ns) => {
                    let mut stmt = db.prepare(&format!("{} WHERE namespace = ?1", SELECT)).map_err(db_err)?;
                    let rows = stmt.query_map([ns], row_to_record).map_err(db_err)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)?
                }
                None => {
                    let mut stmt = db.prepare(SELECT).map_err(db_err)?;
                    let rows = stmt.query_map([], row_to_record).map_err(db_err)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)?
                }
            };
            raw.into_iter().map(decode).collect()
        })
        .await
    }

    async fn get(&self, name: &QualifiedName) -> FedResult<Option<PropagatedVersion>> {
        let (ns, n) = (ns_col(name.namespace()), name.name.clone());
        self.run(move |db| {
            let raw = db
                .query_row(&format!("{} WHERE namespace = ?1 AND name = ?2", SELECT), params![ns, n], row_to_record)
                .optional()
                .map_err(db_err)?;
            raw.map(decode).transpose()
        })
        .await
    }

    async fn create(&self, record: &PropagatedVersion) -> FedResult<PropagatedVersion> {
        let started = std::time::Instant::now();
        let clusters = encode_clusters(record)?;
        let mut out = record.clone();
        let (ns, name) = (ns_col(record.namespace.as_deref()), record.name.clone());
        let (tv, ov) = (record.template_version.clone(), record.override_version.clone());
        self.run(move |db| {
            let res = db.execute(
                "INSERT INTO propagated_versions(namespace, name, rv, template_version, override_version, clusters)
                 VALUES (?1, ?2, 1, ?3, ?4, ?5)",
                params![ns, name, tv, ov, clusters],
            );
            match res {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(f, _)) if f.code == rusqlite::ErrorCode::ConstraintViolation => {
                    Err(FedError::AlreadyExists(format!("propagated version {}", name)))
                }
                Err(e) => Err(db_err(e)),
            }
        })
        .await?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64, "op" => "create");
        out.resource_version = Some("1".to_string());
        Ok(out)
    }

    async fn update(&self, record: &PropagatedVersion) -> FedResult<PropagatedVersion> {
        let started = std::time::Instant::now();
        let expected: i64 = record
            .resource_version
            .as_deref()
            .and_then(|rv| rv.parse().ok())
            .ok_or_else(|| FedError::Conflict(format!("propagated version {} has no usable resource version", record.name)))?;
        let clusters = encode_clusters(record)?;
        let mut out = record.clone();
        let (ns, name) = (ns_col(record.namespace.as_deref()), record.name.clone());
        let (tv, ov) = (record.template_version.clone(), record.override_version.clone());
        let next = self
            .run(move |db| {
                let tx = db.transaction().map_err(db_err)?;
                let current: Option<i64> = tx
                    .query_row(
                        "SELECT rv FROM propagated_versions WHERE namespace = ?1 AND name = ?2",
                        params![ns, name],
                        |r| r.get(0),
                    )
                    .optional()
                    .map_err(db_err)?;
                match current {
                    None => return Err(FedError::NotFound(format!("propagated version {}", name))),
                    Some(rv) if rv != expected => {
                        return Err(FedError::Conflict(format!("propagated version {} is at {}, not {}", name, rv, expected)))
                    }
                    Some(_) => {}
                }
                tx.execute(
                    "UPDATE propagated_versions SET rv = ?3, template_version = ?4, override_version = ?5, clusters = ?6
                     WHERE namespace = ?1 AND name = ?2",
                    params![ns, name, expected + 1, tv, ov, clusters],
                )
                .map_err(db_err)?;
                tx.commit().map_err(db_err)?;
                Ok(expected + 1)
            })
            .await?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64, "op" => "update");
        out.resource_version = Some(next.to_string());
        Ok(out)
    }

    async fn delete(&self, name: &QualifiedName) -> FedResult<()> {
        let (ns, n) = (ns_col(name.namespace()), name.name.clone());
        self.run(move |db| {
            let removed = db
                .execute("DELETE FROM propagated_versions WHERE namespace = ?1 AND name = ?2", params![ns, n])
                .map_err(db_err)?;
            if removed == 0 {
                return Err(FedError::NotFound(format!("propagated version {}", n)));
            }
            Ok(())
        })
        .await
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".kfed");
        let _ = std::fs::create_dir_all(&p);
        p.push("versions.db");
        return p.to_string_lossy().to_string();
    }
    "kfed-versions.db".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> PropagatedVersion {
        let mut clusters = BTreeMap::new();
        clusters.insert("c1".to_string(), "gen:1".to_string());
        PropagatedVersion {
            namespace: Some("ns".into()),
            name: name.into(),
            template_version: "t1".into(),
            override_version: "o1".into(),
            cluster_versions: clusters,
            resource_version: None,
        }
    }

    #[tokio::test]
    async fn create_update_conflict_delete() {
        let s = SqliteVersionStore::open_in_memory().unwrap();
        let created = s.create(&record("deployment-web")).await.unwrap();
        assert_eq!(created.resource_version.as_deref(), Some("1"));
        assert!(s.create(&record("deployment-web")).await.unwrap_err().is_already_exists());

        let mut next = created.clone();
        next.template_version = "t2".into();
        let updated = s.update(&next).await.unwrap();
        assert_eq!(updated.resource_version.as_deref(), Some("2"));
        // stale token
        assert!(s.update(&next).await.unwrap_err().is_conflict());

        let got = s.get(&QualifiedName::new(Some("ns"), "deployment-web")).await.unwrap().unwrap();
        assert_eq!(got.template_version, "t2");
        assert_eq!(got.cluster_versions.get("c1").map(String::as_str), Some("gen:1"));

        assert_eq!(s.list(Some("ns")).await.unwrap().len(), 1);
        assert!(s.list(Some("other")).await.unwrap().is_empty());

        s.delete(&got.qualified_name()).await.unwrap();
        assert!(s.delete(&got.qualified_name()).await.unwrap_err().is_not_found());
        assert!(s.update(&updated).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn cluster_scoped_records_use_empty_namespace() {
        let s = SqliteVersionStore::open_in_memory().unwrap();
        let mut r = record("clusterrole-admin");
        r.namespace = None;
        s.create(&r).await.unwrap();
        let all = s.list(None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].namespace, None);
    }
}
