//! Checkpoints persisted in a SQLite database.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;

use super::job::Checkpoint;
use super::store::CheckpointStore;
use crate::common::lock;
use crate::errors::tracked_err;
use crate::errors::Reraise;
use crate::errors::Result;
use crate::identity::BodyId;

fn get_migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "CREATE TABLE ckpts ( \
         created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
         body_id TEXT NOT NULL, \
         ckpt_index INTEGER NOT NULL CHECK (ckpt_index >= 0), \
         ser_ckpt TEXT NOT NULL, \
         PRIMARY KEY (body_id, ckpt_index) \
         ) STRICT",
    )])
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    get_migrations().validate()
}

/// Setup our connection-level pragmas. Run this on each connection.
fn setup_conn(conn: &mut Connection) -> Result<()> {
    // These are recommended by Litestream.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", "5000")?;
    get_migrations()
        .to_latest(conn)
        .reraise("error migrating checkpoint database")?;
    Ok(())
}

/// Every checkpoint ever stored, until discarded, as JSON rows.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    pub fn open(path: &Path) -> Result<Self> {
        tracing::info!("Opening checkpoint DB at {path:?}");
        let mut conn = Connection::open(path)
            .reraise(&format!("error opening checkpoint DB at {path:?}"))?;
        setup_conn(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        setup_conn(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn store(&self, checkpoint: Checkpoint) -> Result<()> {
        tracing::trace!(body = %checkpoint.body, index = checkpoint.index, "Writing checkpoint");
        let ser_ckpt = serde_json::to_string(&checkpoint)?;
        // SQLite has no unsigned 64-bit column type.
        let ckpt_index = i64::try_from(checkpoint.index)
            .map_err(|_| tracked_err("checkpoint index out of range"))?;
        lock(&self.conn).execute(
            "INSERT INTO ckpts (body_id, ckpt_index, ser_ckpt) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT (body_id, ckpt_index) DO UPDATE \
             SET ser_ckpt = EXCLUDED.ser_ckpt",
            (&checkpoint.body.0, ckpt_index, ser_ckpt),
        )?;
        Ok(())
    }

    fn latest(&self, body: &BodyId) -> Result<Option<Checkpoint>> {
        let ser_ckpt: Option<String> = lock(&self.conn)
            .query_row(
                "SELECT ser_ckpt \
                 FROM ckpts \
                 WHERE body_id = ?1 \
                 ORDER BY ckpt_index DESC \
                 LIMIT 1",
                (&body.0,),
                |row| row.get(0),
            )
            .optional()?;
        ser_ckpt
            .map(|ser| {
                serde_json::from_str::<Checkpoint>(&ser).reraise("error decoding stored checkpoint")
            })
            .transpose()
    }

    fn discard(&self, body: &BodyId) -> Result<()> {
        lock(&self.conn).execute("DELETE FROM ckpts WHERE body_id = ?1", (&body.0,))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_is_highest_index() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        let body = BodyId::from("a");
        assert_eq!(store.latest(&body).unwrap(), None);

        store.store(Checkpoint::new(body.clone(), 1, vec![1])).unwrap();
        store.store(Checkpoint::new(body.clone(), 5, vec![5])).unwrap();
        store.store(Checkpoint::new(body.clone(), 3, vec![3])).unwrap();
        store
            .store(Checkpoint::new(BodyId::from("b"), 9, vec![9]))
            .unwrap();

        let found = store.latest(&body).unwrap().unwrap();
        assert_eq!(found.index, 5);
        assert_eq!(found.state, vec![5]);
    }

    #[test]
    fn same_index_overwrites() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        let body = BodyId::from("a");
        store.store(Checkpoint::new(body.clone(), 1, vec![1])).unwrap();
        let newer = Checkpoint::new(body.clone(), 1, vec![7, 7]);
        store.store(newer.clone()).unwrap();
        assert_eq!(store.latest(&body).unwrap(), Some(newer));
    }

    #[test]
    fn discard_only_touches_one_body() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        store
            .store(Checkpoint::new(BodyId::from("a"), 1, vec![]))
            .unwrap();
        store
            .store(Checkpoint::new(BodyId::from("b"), 1, vec![]))
            .unwrap();
        store.discard(&BodyId::from("a")).unwrap();
        assert_eq!(store.latest(&BodyId::from("a")).unwrap(), None);
        assert!(store.latest(&BodyId::from("b")).unwrap().is_some());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpts.sqlite3");
        let body = BodyId::from("a");
        {
            let store = SqliteCheckpointStore::open(&path).unwrap();
            store.store(Checkpoint::new(body.clone(), 4, vec![4])).unwrap();
        }
        let store = SqliteCheckpointStore::open(&path).unwrap();
        assert_eq!(store.latest(&body).unwrap().unwrap().index, 4);
    }

    #[test]
    fn file_connection_pragmas() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = Connection::open(dir.path().join("ckpts.sqlite3")).unwrap();
        setup_conn(&mut conn).unwrap();

        let journal: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(journal, "wal");
        let busy: i64 = conn
            .query_row("PRAGMA busy_timeout", [], |row| row.get(0))
            .unwrap();
        assert_eq!(busy, 5000);
    }
}
