use anyhow::Result;
use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};

use super::types::{HostRecord, HostState, NewHost};
use super::{Store, text_col};

const HOST_COLUMNS: &str = "id, name, address, port, username, auth_type, sealed_credential, state,
    status_message, active_config_id, auth_failures, last_seen_at, os_info, docker_version,
    nginx_version, created_at, updated_at";

fn host_from_row(row: &Row<'_>) -> rusqlite::Result<HostRecord> {
    Ok(HostRecord {
        id: row.get("id")?,
        name: row.get("name")?,
        address: row.get("address")?,
        port: row.get("port")?,
        username: row.get("username")?,
        auth_type: row.get("auth_type")?,
        sealed_credential: row.get("sealed_credential")?,
        state: text_col(row, "state")?,
        status_message: row.get("status_message")?,
        active_config_id: row.get("active_config_id")?,
        auth_failures: row.get("auth_failures")?,
        last_seen_at: row.get("last_seen_at")?,
        os_info: row.get("os_info")?,
        docker_version: row.get("docker_version")?,
        nginx_version: row.get("nginx_version")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

impl Store {
    pub async fn insert_host(&self, host: &NewHost) -> Result<HostRecord> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        {
            let db = self.db.lock().await;
            db.execute(
                "INSERT INTO hosts (id, name, address, port, username, auth_type, sealed_credential,
                    state, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                params![
                    id,
                    host.name,
                    host.address,
                    host.port,
                    host.username,
                    host.auth_type,
                    host.sealed_credential,
                    HostState::Pending.as_str(),
                    now
                ],
            )?;
        }
        self.get_host(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("host {} vanished after insert", id))
    }

    pub async fn get_host(&self, id: &str) -> Result<Option<HostRecord>> {
        let db = self.db.lock().await;
        let sql = format!("SELECT {} FROM hosts WHERE id = ?1", HOST_COLUMNS);
        let host = db.query_row(&sql, params![id], host_from_row).optional()?;
        Ok(host)
    }

    pub async fn list_hosts(&self) -> Result<Vec<HostRecord>> {
        let db = self.db.lock().await;
        let sql = format!("SELECT {} FROM hosts ORDER BY created_at ASC", HOST_COLUMNS);
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map([], host_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn find_host_by_endpoint(
        &self,
        address: &str,
        port: u16,
        username: &str,
    ) -> Result<Option<HostRecord>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM hosts WHERE address = ?1 AND port = ?2 AND username = ?3",
            HOST_COLUMNS
        );
        let host = db
            .query_row(&sql, params![address, port, username], host_from_row)
            .optional()?;
        Ok(host)
    }

    pub async fn set_host_state(
        &self,
        id: &str,
        state: HostState,
        message: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE hosts SET state = ?2, status_message = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, state.as_str(), message, Utc::now()],
        )?;
        Ok(())
    }

    /// A successful round trip: refresh `last_seen_at` and forget earlier
    /// authentication failures.
    pub async fn record_host_contact(&self, id: &str) -> Result<()> {
        let db = self.db.lock().await;
        let now = Utc::now();
        db.execute(
            "UPDATE hosts SET last_seen_at = ?2, auth_failures = 0, updated_at = ?2 WHERE id = ?1",
            params![id, now],
        )?;
        Ok(())
    }

    /// Returns the consecutive failure count after this one.
    pub async fn record_auth_failure(&self, id: &str) -> Result<u32> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE hosts SET auth_failures = auth_failures + 1, updated_at = ?2 WHERE id = ?1",
            params![id, Utc::now()],
        )?;
        let count = db.query_row(
            "SELECT auth_failures FROM hosts WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub async fn update_host_facts(
        &self,
        id: &str,
        os_info: Option<&str>,
        docker_version: Option<&str>,
        nginx_version: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE hosts SET
                os_info = COALESCE(?2, os_info),
                docker_version = COALESCE(?3, docker_version),
                nginx_version = COALESCE(?4, nginx_version),
                updated_at = ?5
             WHERE id = ?1",
            params![id, os_info, docker_version, nginx_version, Utc::now()],
        )?;
        Ok(())
    }

    pub async fn delete_host(&self, id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute("DELETE FROM hosts WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::test_support::sample_host;

    #[tokio::test]
    async fn inserted_host_starts_pending() {
        let store = Store::in_memory().unwrap();
        let host = store.insert_host(&sample_host("10.0.0.1")).await.unwrap();
        assert_eq!(host.state, HostState::Pending);
        assert_eq!(host.auth_failures, 0);
        assert!(host.active_config_id.is_none());

        let listed = store.list_hosts().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, host.id);
    }

    #[tokio::test]
    async fn duplicate_endpoint_is_rejected() {
        let store = Store::in_memory().unwrap();
        store.insert_host(&sample_host("10.0.0.1")).await.unwrap();
        assert!(store.insert_host(&sample_host("10.0.0.1")).await.is_err());
        assert!(
            store
                .find_host_by_endpoint("10.0.0.1", 22, "root")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn auth_failures_accumulate_until_contact() {
        let store = Store::in_memory().unwrap();
        let host = store.insert_host(&sample_host("10.0.0.2")).await.unwrap();
        assert_eq!(store.record_auth_failure(&host.id).await.unwrap(), 1);
        assert_eq!(store.record_auth_failure(&host.id).await.unwrap(), 2);
        store.record_host_contact(&host.id).await.unwrap();
        let host = store.get_host(&host.id).await.unwrap().unwrap();
        assert_eq!(host.auth_failures, 0);
        assert!(host.last_seen_at.is_some());
    }

    #[tokio::test]
    async fn facts_update_keeps_unspecified_values() {
        let store = Store::in_memory().unwrap();
        let host = store.insert_host(&sample_host("10.0.0.3")).await.unwrap();
        store
            .update_host_facts(&host.id, Some("Ubuntu 24.04"), Some("Docker 27.0"), None)
            .await
            .unwrap();
        store
            .update_host_facts(&host.id, None, None, Some("nginx/1.24.0"))
            .await
            .unwrap();
        let host = store.get_host(&host.id).await.unwrap().unwrap();
        assert_eq!(host.os_info.as_deref(), Some("Ubuntu 24.04"));
        assert_eq!(host.docker_version.as_deref(), Some("Docker 27.0"));
        assert_eq!(host.nginx_version.as_deref(), Some("nginx/1.24.0"));
    }
}
