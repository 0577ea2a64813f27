use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tokio_rusqlite::{Connection, params, rusqlite};

use super::ts;
use crate::core::client::{Client, ClientStatus, TerraformState};

pub async fn get(conn: &Connection, client_id: String) -> Result<Option<Client>> {
    let document = conn
        .call(move |c| {
            let mut stmt = c.prepare("SELECT document FROM clients WHERE id = ?1")?;
            let mut rows = stmt.query_map(params![client_id], |row| row.get::<_, String>(0))?;
            rows.next().transpose()
        })
        .await
        .map_err(|e| anyhow!("Failed to get client: {}", e))?;

    document
        .map(|doc| serde_json::from_str(&doc).context("Malformed client document"))
        .transpose()
}

/// Insert or replace the stored copy of a client.
pub async fn save(conn: &Connection, client: &Client) -> Result<()> {
    let document = serde_json::to_string(client)?;
    let id = client.id.clone();
    let name = client.name.clone();
    let status = client.status.as_str();
    let updated_at = ts(client.updated_at);

    conn.call(move |c| {
        c.execute(
            "INSERT INTO clients (id, name, status, document, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                document = excluded.document,
                updated_at = excluded.updated_at",
            params![id, name, status, document, updated_at],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await
    .map_err(|e| anyhow!("Failed to save client: {}", e))
}

pub async fn list_active_with_dr_frequency(conn: &Connection) -> Result<Vec<Client>> {
    let documents = conn
        .call(|c| {
            let mut stmt = c.prepare("SELECT document FROM clients WHERE status = ?1 ORDER BY id")?;
            let rows = stmt.query_map(params![ClientStatus::Active.as_str()], |row| {
                row.get::<_, String>(0)
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
        .map_err(|e| anyhow!("Failed to list clients: {}", e))?;

    let mut clients = Vec::with_capacity(documents.len());
    for doc in documents {
        let client: Client = serde_json::from_str(&doc).context("Malformed client document")?;
        if client.backup_config.dr_test_frequency.is_some() {
            clients.push(client);
        }
    }
    Ok(clients)
}

/// Rewrite `terraform_state` inside the stored document.
pub async fn set_terraform_state(
    conn: &Connection,
    client_id: String,
    state: TerraformState,
) -> Result<()> {
    let updated = conn
        .call(move |c| {
            let tx = c.transaction()?;
            let document: Option<String> = {
                let mut stmt = tx.prepare("SELECT document FROM clients WHERE id = ?1")?;
                let mut rows = stmt.query_map(params![client_id], |row| row.get::<_, String>(0))?;
                rows.next().transpose()?
            };
            let Some(document) = document else {
                return Ok(false);
            };

            let mut client: Client = serde_json::from_str(&document)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            client.terraform_state = state;
            client.updated_at = Utc::now();
            let document = serde_json::to_string(&client)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

            tx.execute(
                "UPDATE clients SET document = ?1, updated_at = ?2 WHERE id = ?3",
                params![document, ts(client.updated_at), client.id],
            )?;
            tx.commit()?;
            Ok::<bool, rusqlite::Error>(true)
        })
        .await
        .map_err(|e| anyhow!("Failed to update terraform state: {}", e))?;

    if !updated {
        return Err(anyhow!("Client not found"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::client::DrTestFrequency;
    use crate::core::models::Provider;
    use crate::db::init_in_memory;

    #[tokio::test]
    async fn save_get_and_update_state() {
        let conn = init_in_memory().await.unwrap();
        let client = Client::new("Acme", vec![Provider::Aws]);
        save(&conn, &client).await.unwrap();

        let loaded = get(&conn, client.id.clone()).await.unwrap().unwrap();
        assert_eq!(loaded.name, "Acme");

        set_terraform_state(&conn, client.id.clone(), TerraformState::Initialized)
            .await
            .unwrap();
        let loaded = get(&conn, client.id.clone()).await.unwrap().unwrap();
        assert_eq!(loaded.terraform_state, TerraformState::Initialized);

        assert!(
            set_terraform_state(&conn, "missing".into(), TerraformState::Failed)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn lists_only_active_clients_with_cadence() {
        let conn = init_in_memory().await.unwrap();

        let mut weekly = Client::new("Weekly", vec![Provider::Aws]);
        weekly.backup_config.dr_test_frequency = Some(DrTestFrequency::Weekly);
        let mut none = Client::new("None", vec![Provider::Aws]);
        none.backup_config.dr_test_frequency = None;
        let mut paused = Client::new("Paused", vec![Provider::Aws]);
        paused.status = ClientStatus::Paused;

        for client in [&weekly, &none, &paused] {
            save(&conn, client).await.unwrap();
        }

        let listed = list_active_with_dr_frequency(&conn).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, weekly.id);
    }
}
