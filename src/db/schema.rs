//! Application schema, expressed as the ordered migration set.
//!
//! Tables: `conversations`, `messages` (+ `messages_fts` FTS5 index kept in sync
//! by triggers), `conversation_summaries`, `context_cache`, `entities`,
//! `entity_mentions`. `persistence_state` is owned by the migration runner.

use super::migrations::Migration;

const V1_CONVERSATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    title TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    role TEXT NOT NULL CHECK(role IN ('user','assistant','system')),
    content TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    parent_message_id TEXT REFERENCES messages(id) ON DELETE SET NULL,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);
"#;

const V1_MESSAGES_FTS: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
    content,
    content='messages',
    content_rowid='rowid'
);

CREATE TRIGGER IF NOT EXISTS messages_fts_insert AFTER INSERT ON messages BEGIN
    INSERT INTO messages_fts (rowid, content) VALUES (new.rowid, new.content);
END;

CREATE TRIGGER IF NOT EXISTS messages_fts_delete AFTER DELETE ON messages BEGIN
    INSERT INTO messages_fts (messages_fts, rowid, content) VALUES ('delete', old.rowid, old.content);
END;

CREATE TRIGGER IF NOT EXISTS messages_fts_update AFTER UPDATE OF content ON messages BEGIN
    INSERT INTO messages_fts (messages_fts, rowid, content) VALUES ('delete', old.rowid, old.content);
    INSERT INTO messages_fts (rowid, content) VALUES (new.rowid, new.content);
END;
"#;

const V2_SUMMARIES: &str = r#"
CREATE TABLE IF NOT EXISTS conversation_summaries (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    level TEXT NOT NULL CHECK(level IN ('brief','standard','detailed')),
    summary_text TEXT NOT NULL,
    token_count INTEGER NOT NULL CHECK(token_count >= 0),
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    generated_at INTEGER NOT NULL,
    message_count INTEGER NOT NULL DEFAULT 0,
    start_message_id TEXT,
    end_message_id TEXT,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_summaries_conversation ON conversation_summaries(conversation_id);
"#;

const V3_CONTEXT_CACHE: &str = r#"
CREATE TABLE IF NOT EXISTS context_cache (
    id TEXT PRIMARY KEY,
    cache_key TEXT NOT NULL UNIQUE,
    summary_ids TEXT NOT NULL DEFAULT '[]',
    assembled_context TEXT NOT NULL,
    token_count INTEGER NOT NULL CHECK(token_count >= 0),
    created_at INTEGER NOT NULL,
    accessed_at INTEGER NOT NULL,
    access_count INTEGER NOT NULL DEFAULT 0,
    expires_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_context_cache_accessed ON context_cache(accessed_at);
CREATE INDEX IF NOT EXISTS idx_context_cache_expires ON context_cache(expires_at);
"#;

const V4_ENTITIES: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    normalized_name TEXT NOT NULL,
    type TEXT NOT NULL,
    confidence_score REAL NOT NULL DEFAULT 1.0 CHECK(confidence_score >= 0.0 AND confidence_score <= 1.0),
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    mention_count INTEGER NOT NULL DEFAULT 0,
    UNIQUE(normalized_name, type)
);

CREATE TABLE IF NOT EXISTS entity_mentions (
    id TEXT PRIMARY KEY,
    entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    mention_text TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_mentions_entity ON entity_mentions(entity_id);
CREATE INDEX IF NOT EXISTS idx_mentions_message ON entity_mentions(message_id);
"#;

const V5_PERFORMANCE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_messages_conversation_time ON messages(conversation_id, created_at);
CREATE INDEX IF NOT EXISTS idx_conversations_updated ON conversations(updated_at DESC);
CREATE INDEX IF NOT EXISTS idx_summaries_conversation_level ON conversation_summaries(conversation_id, level);
CREATE INDEX IF NOT EXISTS idx_entities_type ON entities(type);
"#;

/// The full, ordered migration set for the application schema.
pub fn migrations() -> Vec<Migration> {
    vec![
        Migration::new(1, "conversations, messages, and full-text index", &[V1_CONVERSATIONS, V1_MESSAGES_FTS])
            .with_down(&[
                "DROP TRIGGER IF EXISTS messages_fts_update;
                 DROP TRIGGER IF EXISTS messages_fts_delete;
                 DROP TRIGGER IF EXISTS messages_fts_insert;
                 DROP TABLE IF EXISTS messages_fts;",
                "DROP TABLE IF EXISTS messages; DROP TABLE IF EXISTS conversations;",
            ]),
        Migration::new(2, "conversation summaries", &[V2_SUMMARIES])
            .with_down(&["DROP TABLE IF EXISTS conversation_summaries;"]),
        Migration::new(3, "persistent context cache", &[V3_CONTEXT_CACHE])
            .with_down(&["DROP TABLE IF EXISTS context_cache;"]),
        Migration::new(4, "entities and mentions", &[V4_ENTITIES])
            .with_down(&["DROP TABLE IF EXISTS entity_mentions; DROP TABLE IF EXISTS entities;"]),
        Migration::new(5, "query performance indexes", &[V5_PERFORMANCE_INDEXES]).with_down(&[
            "DROP INDEX IF EXISTS idx_entities_type;
             DROP INDEX IF EXISTS idx_summaries_conversation_level;
             DROP INDEX IF EXISTS idx_conversations_updated;
             DROP INDEX IF EXISTS idx_messages_conversation_time;",
        ]),
    ]
}
