//! Local account storage using SQLite

use crate::auth::Account;
use crate::error::Result;
use chrono::DateTime;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;

const CURRENT_ACCOUNT_KEY: &str = "current_account";

pub struct AccountStore {
    conn: Mutex<Connection>,
}

impl AccountStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let conn = Connection::open(data_dir.join("accounts.db"))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS accounts (
                uuid TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                auth_token TEXT NOT NULL,
                refresh_token TEXT NOT NULL,
                expiration INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    // ========================================================================
    // Settings
    // ========================================================================

    fn save_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn get_setting(&self, key: &str) -> Option<String> {
        self.conn
            .lock()
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .ok()
    }

    fn delete_setting(&self, key: &str) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }

    // ========================================================================
    // Accounts
    // ========================================================================

    pub fn upsert(&self, account: &Account) -> Result<()> {
        self.conn.lock().execute(
            r#"INSERT OR REPLACE INTO accounts
               (uuid, name, auth_token, refresh_token, expiration)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
            params![
                account.uuid,
                account.name,
                account.auth_token,
                account.refresh_token,
                account.expiration.timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, uuid: &str) -> Result<Option<Account>> {
        let conn = self.conn.lock();
        let result = conn.query_row(
            "SELECT uuid, name, auth_token, refresh_token, expiration FROM accounts WHERE uuid = ?1",
            params![uuid],
            row_to_account,
        );
        match result {
            Ok(account) => Ok(Some(account)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn accounts(&self) -> Result<Vec<Account>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT uuid, name, auth_token, refresh_token, expiration FROM accounts ORDER BY name",
        )?;
        let rows = stmt.query_map([], row_to_account)?;

        let mut accounts = Vec::new();
        for row in rows {
            accounts.push(row?);
        }
        Ok(accounts)
    }

    pub fn remove(&self, uuid: &str) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM accounts WHERE uuid = ?1", params![uuid])?;
        if self.get_setting(CURRENT_ACCOUNT_KEY).as_deref() == Some(uuid) {
            self.delete_setting(CURRENT_ACCOUNT_KEY)?;
        }
        Ok(())
    }

    pub fn set_current(&self, uuid: &str) -> Result<()> {
        self.save_setting(CURRENT_ACCOUNT_KEY, uuid)
    }

    pub fn current_account(&self) -> Result<Option<Account>> {
        match self.get_setting(CURRENT_ACCOUNT_KEY) {
            Some(uuid) => self.get(&uuid),
            None => Ok(None),
        }
    }
}

fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    let expiration: i64 = row.get(4)?;
    Ok(Account {
        uuid: row.get(0)?,
        name: row.get(1)?,
        auth_token: row.get(2)?,
        refresh_token: row.get(3)?,
        expiration: DateTime::from_timestamp(expiration, 0).unwrap_or(DateTime::UNIX_EPOCH),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn account(uuid: &str, name: &str) -> Account {
        Account::new(
            name,
            uuid,
            "auth-token".to_string(),
            "refresh-token".to_string(),
            Utc::now() + Duration::hours(24),
        )
        .unwrap()
    }

    #[test]
    fn accounts_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path()).unwrap();

        let a = account("067e61623b6f4ae2a1712470b63dff00", "Alice");
        let b = account("11111111111111111111111111111111", "Bob");
        store.upsert(&a).unwrap();
        store.upsert(&b).unwrap();

        let listed = store.accounts().unwrap();
        assert_eq!(listed.len(), 2);
        let loaded = store.get(&a.uuid).unwrap().unwrap();
        assert_eq!(loaded, a);
        assert_eq!(loaded.auth_token, "auth-token");
        // sub-second precision is dropped by the store
        assert_eq!(loaded.expiration.timestamp(), a.expiration.timestamp());

        // upsert replaces in place
        let mut renamed = a.clone();
        renamed.name = "Alice2".to_string();
        store.upsert(&renamed).unwrap();
        assert_eq!(store.accounts().unwrap().len(), 2);
        assert_eq!(store.get(&a.uuid).unwrap().unwrap().name, "Alice2");
    }

    #[test]
    fn current_account_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path()).unwrap();
        assert!(store.current_account().unwrap().is_none());

        let a = account("067e61623b6f4ae2a1712470b63dff00", "Alice");
        store.upsert(&a).unwrap();
        store.set_current(&a.uuid).unwrap();
        assert_eq!(store.current_account().unwrap().unwrap(), a);

        // removing the current account clears the pointer
        store.remove(&a.uuid).unwrap();
        assert!(store.current_account().unwrap().is_none());
    }
}
