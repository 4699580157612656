//! Persistence collaborator for the chat engine.
//!
//! The engine only moves live events; durable storage happens through this
//! trait before (messages) or after (read receipts) broadcast. The SQLite
//! implementation is the production binding.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;

use crate::db::DbPool;

pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// A message as handed to the store, with client-controlled fields only.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: i64,
    pub remitente_id: i64,
    pub remitente_nombre: String,
    pub contenido: String,
    pub tipo_mensaje: String,
    pub archivo_url: Option<String>,
}

/// A durably stored message: id and created_at are assigned by the store and
/// are the canonical values every recipient sees.
#[derive(Debug, Clone, Serialize)]
pub struct PersistedMessage {
    pub id: i64,
    pub chat_id: i64,
    pub remitente_id: i64,
    pub remitente_nombre: String,
    pub contenido: String,
    pub tipo_mensaje: String,
    pub archivo_url: Option<String>,
    pub created_at: String,
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Whether the user may join/see the given chat.
    async fn room_access(&self, chat_id: i64, user_id: i64) -> Result<bool, StoreError>;

    /// Durably store a message, assigning id and created_at.
    async fn persist_message(&self, mensaje: NewMessage) -> Result<PersistedMessage, StoreError>;

    /// Mark a message read by a user. Returns false if the message does not
    /// exist; marking twice is not an error.
    async fn mark_message_read(&self, mensaje_id: i64, reader_id: i64) -> Result<bool, StoreError>;

    /// All registered participants of a chat, connected or not.
    async fn room_participants(&self, chat_id: i64) -> Result<Vec<i64>, StoreError>;
}

/// SQLite-backed store. All calls run on the blocking pool; the shared
/// connection is behind a mutex.
pub struct SqliteChatStore {
    db: DbPool,
}

impl SqliteChatStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn room_access(&self, chat_id: i64, user_id: i64) -> Result<bool, StoreError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|e| format!("DB lock error: {e}"))?;
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM chats c
                 JOIN chat_participantes p ON p.chat_id = c.id
                 WHERE c.id = ?1 AND c.activo = 1 AND p.user_id = ?2",
                rusqlite::params![chat_id, user_id],
                |row| row.get(0),
            )?;
            Ok::<_, StoreError>(count > 0)
        })
        .await?
    }

    async fn persist_message(&self, mensaje: NewMessage) -> Result<PersistedMessage, StoreError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|e| format!("DB lock error: {e}"))?;
            let created_at = Utc::now().to_rfc3339();

            conn.execute(
                "INSERT INTO mensajes_chat
                    (chat_id, remitente_id, remitente_nombre, contenido, tipo_mensaje, archivo_url, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    mensaje.chat_id,
                    mensaje.remitente_id,
                    mensaje.remitente_nombre,
                    mensaje.contenido,
                    mensaje.tipo_mensaje,
                    mensaje.archivo_url,
                    created_at,
                ],
            )?;
            let id = conn.last_insert_rowid();

            Ok::<_, StoreError>(PersistedMessage {
                id,
                chat_id: mensaje.chat_id,
                remitente_id: mensaje.remitente_id,
                remitente_nombre: mensaje.remitente_nombre,
                contenido: mensaje.contenido,
                tipo_mensaje: mensaje.tipo_mensaje,
                archivo_url: mensaje.archivo_url,
                created_at,
            })
        })
        .await?
    }

    async fn mark_message_read(&self, mensaje_id: i64, reader_id: i64) -> Result<bool, StoreError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|e| format!("DB lock error: {e}"))?;

            let exists: i64 = conn.query_row(
                "SELECT COUNT(*) FROM mensajes_chat WHERE id = ?1",
                rusqlite::params![mensaje_id],
                |row| row.get(0),
            )?;
            if exists == 0 {
                return Ok(false);
            }

            conn.execute(
                "INSERT OR IGNORE INTO mensajes_leidos (mensaje_id, user_id, leido_at)
                 VALUES (?1, ?2, ?3)",
                rusqlite::params![mensaje_id, reader_id, Utc::now().to_rfc3339()],
            )?;
            Ok::<_, StoreError>(true)
        })
        .await?
    }

    async fn room_participants(&self, chat_id: i64) -> Result<Vec<i64>, StoreError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|e| format!("DB lock error: {e}"))?;
            let mut stmt =
                conn.prepare("SELECT user_id FROM chat_participantes WHERE chat_id = ?1")?;
            let participantes: Vec<i64> = stmt
                .query_map(rusqlite::params![chat_id], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            Ok::<_, StoreError>(participantes)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn test_store() -> SqliteChatStore {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        crate::db::migrations::migrations().to_latest(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO chats (id, proceso_id, titulo, activo, created_at)
             VALUES (42, 1, 'Proceso 1', 1, ?1)",
            rusqlite::params![Utc::now().to_rfc3339()],
        )
        .unwrap();
        for user_id in [1, 2] {
            conn.execute(
                "INSERT INTO chat_participantes (chat_id, user_id, agregado_at) VALUES (42, ?1, ?2)",
                rusqlite::params![user_id, Utc::now().to_rfc3339()],
            )
            .unwrap();
        }
        SqliteChatStore::new(Arc::new(Mutex::new(conn)))
    }

    #[tokio::test]
    async fn access_requires_participation() {
        let store = test_store();
        assert!(store.room_access(42, 1).await.unwrap());
        assert!(!store.room_access(42, 99).await.unwrap());
        assert!(!store.room_access(7, 1).await.unwrap());
    }

    #[tokio::test]
    async fn persist_assigns_id_and_timestamp() {
        let store = test_store();
        let persisted = store
            .persist_message(NewMessage {
                chat_id: 42,
                remitente_id: 1,
                remitente_nombre: "Ana".into(),
                contenido: "hola".into(),
                tipo_mensaje: "texto".into(),
                archivo_url: None,
            })
            .await
            .unwrap();
        assert!(persisted.id > 0);
        assert!(!persisted.created_at.is_empty());

        let second = store
            .persist_message(NewMessage {
                chat_id: 42,
                remitente_id: 2,
                remitente_nombre: "Luis".into(),
                contenido: "buenas".into(),
                tipo_mensaje: "texto".into(),
                archivo_url: None,
            })
            .await
            .unwrap();
        assert!(second.id > persisted.id);
    }

    #[tokio::test]
    async fn mark_read_is_idempotent_and_checks_existence() {
        let store = test_store();
        let persisted = store
            .persist_message(NewMessage {
                chat_id: 42,
                remitente_id: 1,
                remitente_nombre: "Ana".into(),
                contenido: "hola".into(),
                tipo_mensaje: "texto".into(),
                archivo_url: None,
            })
            .await
            .unwrap();

        assert!(store.mark_message_read(persisted.id, 2).await.unwrap());
        assert!(store.mark_message_read(persisted.id, 2).await.unwrap());
        assert!(!store.mark_message_read(9999, 2).await.unwrap());
    }

    #[tokio::test]
    async fn participants_listed() {
        let store = test_store();
        let mut p = store.room_participants(42).await.unwrap();
        p.sort();
        assert_eq!(p, vec![1, 2]);
    }
}
