//! SQLite storage for tier records, the relation graph and the memory config

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use uuid::Uuid;

use crate::affect::AffectEntry;
use crate::chat::ChatChange;
use crate::config::{Config, MemoryConfig};
use crate::encoding::EncodingEntry;
use crate::error::{Error, Result};
use crate::graph::{GraphEntity, GraphRelation, GraphUpdate, Mention};
use crate::river::RiverEntry;
use crate::salience::SalienceEntry;
use crate::types::ChatId;

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (or create) the database under the configured data directory
    pub fn new(config: &Config) -> Result<Self> {
        Self::from_connection(Connection::open(config.sqlite_path())?)
    }

    /// A private database that lives only as long as this value
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| Error::storage(e.to_string()))
    }

    /// Write every record of a change in one transaction
    pub fn apply_change(&self, chat_id: &str, change: &ChatChange) -> Result<()> {
        if change.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        for entry in &change.river {
            save_river(&tx, entry)?;
        }
        for id in &change.river_removed {
            tx.execute(
                "DELETE FROM river_entries WHERE chat_id = ?1 AND id = ?2",
                params![chat_id, id],
            )?;
        }
        for entry in &change.affect {
            save_affect(&tx, entry)?;
        }
        for entry in &change.encodings {
            save_encoding(&tx, entry)?;
        }
        for entry in &change.salience {
            save_salience(&tx, entry)?;
        }
        for id in &change.muted {
            tx.execute(
                "INSERT OR IGNORE INTO muted_messages (chat_id, message_id) VALUES (?1, ?2)",
                params![chat_id, id],
            )?;
        }
        save_graph(&tx, &change.graph)?;

        tx.commit()?;
        Ok(())
    }

    /// Every chat's tier records, grouped per chat as one change each
    pub fn load_chats(&self) -> Result<HashMap<ChatId, ChatChange>> {
        let conn = self.lock()?;
        let mut chats: HashMap<ChatId, ChatChange> = HashMap::new();

        let mut stmt = conn.prepare(
            "SELECT chat_id, id, role, content, timestamp, muted FROM river_entries",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RiverRow {
                chat_id: row.get(0)?,
                id: row.get(1)?,
                role: row.get(2)?,
                content: row.get(3)?,
                timestamp: row.get(4)?,
                muted: row.get(5)?,
            })
        })?;
        for row in rows {
            let entry = row?.into_entry()?;
            chats.entry(entry.chat_id.clone()).or_default().river.push(entry);
        }

        let mut stmt = conn.prepare(
            r#"
            SELECT id, chat_id, message_id, tag, intensity, reason, created_at
            FROM affect_entries ORDER BY created_at
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(AffectRow {
                id: row.get(0)?,
                chat_id: row.get(1)?,
                message_id: row.get(2)?,
                tag: row.get(3)?,
                intensity: row.get(4)?,
                reason: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?;
        for row in rows {
            let entry = row?.into_entry()?;
            chats.entry(entry.chat_id.clone()).or_default().affect.push(entry);
        }

        let mut stmt = conn.prepare(
            r#"
            SELECT id, chat_id, source_message_id, content, base_strength, encoding_strength,
                   last_boosted_at, created_at, boost_count, suppressed
            FROM encoding_entries
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(EncodingRow {
                id: row.get(0)?,
                chat_id: row.get(1)?,
                source_message_id: row.get(2)?,
                content: row.get(3)?,
                base_strength: row.get(4)?,
                encoding_strength: row.get(5)?,
                last_boosted_at: row.get(6)?,
                created_at: row.get(7)?,
                boost_count: row.get(8)?,
                suppressed: row.get(9)?,
            })
        })?;
        for row in rows {
            let entry = row?.into_entry()?;
            chats.entry(entry.chat_id.clone()).or_default().encodings.push(entry);
        }

        let mut stmt = conn.prepare(
            r#"
            SELECT id, chat_id, source_id, encoding_id, score, pinned, content, suppressed,
                   created_at, updated_at
            FROM salience_entries
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SalienceRow {
                id: row.get(0)?,
                chat_id: row.get(1)?,
                source_id: row.get(2)?,
                encoding_id: row.get(3)?,
                score: row.get(4)?,
                pinned: row.get(5)?,
                content: row.get(6)?,
                suppressed: row.get(7)?,
                created_at: row.get(8)?,
                updated_at: row.get(9)?,
            })
        })?;
        for row in rows {
            let entry = row?.into_entry()?;
            chats.entry(entry.chat_id.clone()).or_default().salience.push(entry);
        }

        let mut stmt = conn.prepare("SELECT chat_id, message_id FROM muted_messages")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (chat_id, message_id) = row?;
            chats.entry(chat_id).or_default().muted.push(message_id);
        }

        Ok(chats)
    }

    /// The whole relation graph
    pub fn load_graph(&self) -> Result<GraphUpdate> {
        let conn = self.lock()?;
        let mut graph = GraphUpdate::default();

        let mut stmt = conn.prepare(
            r#"
            SELECT value, entity_type, display, mention_count, first_seen, last_seen
            FROM graph_entities
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        for row in rows {
            let (value, entity_type, display, mention_count, first_seen, last_seen) = row?;
            graph.entities.push(GraphEntity {
                value,
                entity_type,
                display,
                mention_count: mention_count.max(0) as u64,
                first_seen: parse_time(&first_seen)?,
                last_seen: parse_time(&last_seen)?,
            });
        }

        let mut stmt = conn.prepare(
            r#"
            SELECT from_entity, to_entity, relation_type, chat_id, weight, updated_at
            FROM graph_relations
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, f64>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;
        for row in rows {
            let (from_entity, to_entity, relation_type, chat_id, weight, updated_at) = row?;
            graph.relations.push(GraphRelation {
                from_entity,
                to_entity,
                relation_type,
                chat_id: Some(chat_id).filter(|c| !c.is_empty()),
                weight,
                updated_at: parse_time(&updated_at)?,
            });
        }

        let mut stmt = conn.prepare("SELECT entity, chat_id, message_id FROM graph_mentions")?;
        let rows = stmt.query_map([], |row| {
            Ok(Mention {
                entity: row.get(0)?,
                chat_id: row.get(1)?,
                message_id: row.get(2)?,
            })
        })?;
        graph.mentions = rows.collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(graph)
    }

    /// The persisted memory config, if one was ever saved
    pub fn load_memory_config(&self) -> Result<Option<MemoryConfig>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row("SELECT config FROM memory_config WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        raw.map(|json| serde_json::from_str(&json).map_err(Error::from))
            .transpose()
    }

    pub fn save_memory_config(&self, config: &MemoryConfig) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO memory_config (id, config, updated_at) VALUES (1, ?1, ?2)
            ON CONFLICT(id) DO UPDATE SET
                config = excluded.config,
                updated_at = excluded.updated_at
            "#,
            params![serde_json::to_string(config)?, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

fn save_river(tx: &Transaction<'_>, entry: &RiverEntry) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO river_entries (chat_id, id, role, content, timestamp, muted)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(chat_id, id) DO UPDATE SET
            role = excluded.role,
            content = excluded.content,
            timestamp = excluded.timestamp,
            muted = excluded.muted
        "#,
        params![
            entry.chat_id,
            entry.id,
            entry.role.to_string(),
            entry.content,
            entry.timestamp.to_rfc3339(),
            entry.muted,
        ],
    )?;
    Ok(())
}

fn save_affect(tx: &Transaction<'_>, entry: &AffectEntry) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO affect_entries (id, chat_id, message_id, tag, intensity, reason, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            entry.id.to_string(),
            entry.chat_id,
            entry.message_id,
            entry.tag,
            entry.intensity,
            entry.reason,
            entry.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn save_encoding(tx: &Transaction<'_>, entry: &EncodingEntry) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO encoding_entries (
            id, chat_id, source_message_id, content, base_strength, encoding_strength,
            last_boosted_at, created_at, boost_count, suppressed
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(chat_id, source_message_id) DO UPDATE SET
            id = excluded.id,
            content = excluded.content,
            base_strength = excluded.base_strength,
            encoding_strength = excluded.encoding_strength,
            last_boosted_at = excluded.last_boosted_at,
            boost_count = excluded.boost_count,
            suppressed = excluded.suppressed
        "#,
        params![
            entry.id.to_string(),
            entry.chat_id,
            entry.source_message_id,
            entry.content,
            entry.base_strength,
            entry.encoding_strength,
            entry.last_boosted_at.to_rfc3339(),
            entry.created_at.to_rfc3339(),
            entry.boost_count,
            entry.suppressed,
        ],
    )?;
    Ok(())
}

fn save_salience(tx: &Transaction<'_>, entry: &SalienceEntry) -> Result<()> {
    tx.execute(
        r#"
        INSERT INTO salience_entries (
            id, chat_id, source_id, encoding_id, score, pinned, content, suppressed,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(chat_id, source_id) DO UPDATE SET
            id = excluded.id,
            encoding_id = excluded.encoding_id,
            score = excluded.score,
            pinned = excluded.pinned,
            content = excluded.content,
            suppressed = excluded.suppressed,
            updated_at = excluded.updated_at
        "#,
        params![
            entry.id.to_string(),
            entry.chat_id,
            entry.source_id,
            entry.encoding_id.map(|id| id.to_string()),
            entry.score,
            entry.pinned,
            entry.content,
            entry.suppressed,
            entry.created_at.to_rfc3339(),
            entry.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn save_graph(tx: &Transaction<'_>, update: &GraphUpdate) -> Result<()> {
    for entity in &update.entities {
        tx.execute(
            r#"
            INSERT INTO graph_entities (value, entity_type, display, mention_count, first_seen, last_seen)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(value) DO UPDATE SET
                mention_count = excluded.mention_count,
                last_seen = excluded.last_seen
            "#,
            params![
                entity.value,
                entity.entity_type,
                entity.display,
                entity.mention_count as i64,
                entity.first_seen.to_rfc3339(),
                entity.last_seen.to_rfc3339(),
            ],
        )?;
    }
    for relation in &update.relations {
        tx.execute(
            r#"
            INSERT INTO graph_relations (from_entity, to_entity, relation_type, chat_id, weight, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(from_entity, to_entity, relation_type, chat_id) DO UPDATE SET
                weight = excluded.weight,
                updated_at = excluded.updated_at
            "#,
            params![
                relation.from_entity,
                relation.to_entity,
                relation.relation_type,
                relation.chat_id.as_deref().unwrap_or(""),
                relation.weight,
                relation.updated_at.to_rfc3339(),
            ],
        )?;
    }
    for mention in &update.mentions {
        tx.execute(
            "INSERT OR IGNORE INTO graph_mentions (entity, chat_id, message_id) VALUES (?1, ?2, ?3)",
            params![mention.entity, mention.chat_id, mention.message_id],
        )?;
    }
    Ok(())
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::storage(format!("bad timestamp {raw:?}: {e}")))
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| Error::storage(e.to_string()))
}

/// Intermediate structs for reading from SQLite
struct RiverRow {
    chat_id: String,
    id: String,
    role: String,
    content: String,
    timestamp: String,
    muted: bool,
}

impl RiverRow {
    fn into_entry(self) -> Result<RiverEntry> {
        Ok(RiverEntry {
            role: self
                .role
                .parse()
                .map_err(|_| Error::storage(format!("Unknown role: {}", self.role)))?,
            timestamp: parse_time(&self.timestamp)?,
            muted: self.muted,
            id: self.id,
            chat_id: self.chat_id,
            content: self.content,
        })
    }
}

struct AffectRow {
    id: String,
    chat_id: String,
    message_id: String,
    tag: String,
    intensity: f64,
    reason: Option<String>,
    created_at: String,
}

impl AffectRow {
    fn into_entry(self) -> Result<AffectEntry> {
        Ok(AffectEntry {
            id: parse_uuid(&self.id)?,
            chat_id: self.chat_id,
            message_id: self.message_id,
            tag: self.tag,
            intensity: self.intensity,
            reason: self.reason,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

struct EncodingRow {
    id: String,
    chat_id: String,
    source_message_id: String,
    content: String,
    base_strength: f64,
    encoding_strength: f64,
    last_boosted_at: String,
    created_at: String,
    boost_count: u32,
    suppressed: bool,
}

impl EncodingRow {
    fn into_entry(self) -> Result<EncodingEntry> {
        Ok(EncodingEntry {
            id: parse_uuid(&self.id)?,
            chat_id: self.chat_id,
            source_message_id: self.source_message_id,
            content: self.content,
            base_strength: self.base_strength,
            encoding_strength: self.encoding_strength,
            last_boosted_at: parse_time(&self.last_boosted_at)?,
            created_at: parse_time(&self.created_at)?,
            boost_count: self.boost_count,
            suppressed: self.suppressed,
        })
    }
}

struct SalienceRow {
    id: String,
    chat_id: String,
    source_id: String,
    encoding_id: Option<String>,
    score: f64,
    pinned: bool,
    content: String,
    suppressed: bool,
    created_at: String,
    updated_at: String,
}

impl SalienceRow {
    fn into_entry(self) -> Result<SalienceEntry> {
        Ok(SalienceEntry {
            id: parse_uuid(&self.id)?,
            chat_id: self.chat_id,
            source_id: self.source_id,
            encoding_id: self.encoding_id.as_deref().map(parse_uuid).transpose()?,
            score: self.score,
            pinned: self.pinned,
            content: self.content,
            suppressed: self.suppressed,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::river::Role;

    #[test]
    fn change_round_trips_through_sqlite() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let now = Utc::now();
        let river = RiverEntry::new("m1", "c1", Role::Assistant, "hello there", now);
        let encoding = EncodingEntry::new("c1", "m1", "hello there", now);
        let salience = SalienceEntry::pinned("c1", "m1", "hello", now);
        let affect = AffectEntry::new("c1", "m1", "joy", 0.3, Some("greeting".into())).unwrap();

        storage
            .apply_change(
                "c1",
                &ChatChange {
                    river: vec![river.clone()],
                    affect: vec![affect.clone()],
                    encodings: vec![encoding.clone()],
                    salience: vec![salience.clone()],
                    muted: vec!["m9".into()],
                    ..Default::default()
                },
            )
            .unwrap();

        let chats = storage.load_chats().unwrap();
        let c1 = &chats["c1"];
        assert_eq!(c1.river[0].role, Role::Assistant);
        assert_eq!(c1.encodings[0].id, encoding.id);
        assert!(c1.salience[0].pinned);
        assert_eq!(c1.affect[0].reason.as_deref(), Some("greeting"));
        assert_eq!(c1.muted, vec!["m9".to_string()]);
    }

    #[test]
    fn removals_and_upserts_replace_rows() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let now = Utc::now();
        let entry = RiverEntry::new("m1", "c1", Role::User, "v1", now);
        storage
            .apply_change("c1", &ChatChange {
                river: vec![entry.clone()],
                ..Default::default()
            })
            .unwrap();
        let muted = RiverEntry {
            muted: true,
            ..entry
        };
        storage
            .apply_change("c1", &ChatChange {
                river: vec![muted],
                ..Default::default()
            })
            .unwrap();
        assert!(storage.load_chats().unwrap()["c1"].river[0].muted);

        storage
            .apply_change(
                "c1",
                &ChatChange {
                    river_removed: vec!["m1".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(storage.load_chats().unwrap().get("c1").is_none());
    }

    #[test]
    fn memory_config_is_absent_until_saved() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        assert!(storage.load_memory_config().unwrap().is_none());
        let config = MemoryConfig {
            decay_rate: 0.5,
            ..MemoryConfig::default()
        };
        storage.save_memory_config(&config).unwrap();
        assert_eq!(storage.load_memory_config().unwrap(), Some(config));
    }

    #[test]
    fn graph_records_round_trip_with_global_relations() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let now = Utc::now();
        let update = GraphUpdate {
            entities: vec![GraphEntity {
                value: "acme".into(),
                entity_type: "proper".into(),
                display: "Acme".into(),
                mention_count: 2,
                first_seen: now,
                last_seen: now,
            }],
            relations: vec![GraphRelation {
                from_entity: "alice".into(),
                to_entity: "acme".into(),
                relation_type: "works_at".into(),
                chat_id: None,
                weight: 3.0,
                updated_at: now,
            }],
            mentions: vec![Mention {
                entity: "acme".into(),
                chat_id: "c1".into(),
                message_id: "m1".into(),
            }],
        };
        storage
            .apply_change("c1", &ChatChange {
                graph: update,
                ..Default::default()
            })
            .unwrap();

        let loaded = storage.load_graph().unwrap();
        assert_eq!(loaded.entities[0].mention_count, 2);
        assert_eq!(loaded.relations[0].chat_id, None);
        assert_eq!(loaded.mentions.len(), 1);
    }
}
