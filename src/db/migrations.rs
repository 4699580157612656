use rusqlite_migration::{Migrations, M};

/// Define all schema migrations.
/// Uses SQLite user_version pragma for tracking — no migration table needed.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "-- Migration 1: chat schema

CREATE TABLE chats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    proceso_id INTEGER NOT NULL,
    titulo TEXT NOT NULL,
    activo INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE INDEX idx_chats_proceso ON chats(proceso_id);

CREATE TABLE chat_participantes (
    chat_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    agregado_at TEXT NOT NULL,
    PRIMARY KEY (chat_id, user_id),
    FOREIGN KEY (chat_id) REFERENCES chats(id)
);

CREATE INDEX idx_participantes_user ON chat_participantes(user_id);

CREATE TABLE mensajes_chat (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_id INTEGER NOT NULL,
    remitente_id INTEGER NOT NULL,
    remitente_nombre TEXT NOT NULL,
    contenido TEXT NOT NULL,
    tipo_mensaje TEXT NOT NULL DEFAULT 'texto',
    archivo_url TEXT,
    created_at TEXT NOT NULL,
    FOREIGN KEY (chat_id) REFERENCES chats(id)
);

CREATE INDEX idx_mensajes_chat ON mensajes_chat(chat_id, created_at);

CREATE TABLE mensajes_leidos (
    mensaje_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    leido_at TEXT NOT NULL,
    PRIMARY KEY (mensaje_id, user_id),
    FOREIGN KEY (mensaje_id) REFERENCES mensajes_chat(id)
);",
    )])
}
