use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::{Calibration, SystemConfig};
use crate::error::{Result, StorageError};
use crate::ids::Id;
use crate::state::diff::{StateDiff, StreakOp};
use crate::state::model::{
    Clock, Entity, EventRecord, Fact, FailureStreak, InventoryEntry, Relationship, Scene,
    SessionRecord, Summary, Thread,
};

pub const SCHEMA_VERSION: i32 = 1;

/// The single write authority for one campaign. Projections are mutable
/// snapshots; the event log is append-only and every accepted turn commits
/// its diff and its record in one transaction.
pub struct Store {
    conn: Connection,
    campaign: String,
}

#[derive(Debug, Clone)]
pub struct CampaignRow {
    pub id: String,
    pub name: String,
    pub scenario_id: String,
    pub system: SystemConfig,
    pub calibration: Calibration,
    pub prompt_versions: BTreeMap<String, String>,
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: DeserializeOwned>(raw: &str) -> Result<T> {
    Ok(serde_json::from_str(raw)?)
}

impl Store {
    pub fn open(db_path: &Path, campaign: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::with_connection(conn, campaign)
    }

    pub fn open_in_memory(campaign: &str) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, campaign)
    }

    fn with_connection(conn: Connection, campaign: &str) -> Result<Self> {
        let store = Store {
            conn,
            campaign: campaign.to_string(),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn campaign_id(&self) -> &str {
        &self.campaign
    }

    fn init_schema(&self) -> Result<()> {
        let current: i32 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if current != 0 && current != SCHEMA_VERSION {
            return Err(StorageError::ConstraintViolation(format!(
                "database schema version {current} is not {SCHEMA_VERSION}"
            ))
            .into());
        }

        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS campaigns (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                scenario_id TEXT NOT NULL,
                system_config TEXT NOT NULL,
                calibration TEXT NOT NULL,
                prompt_versions TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS entities (
                campaign_id TEXT NOT NULL,
                id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                name TEXT NOT NULL,
                attributes TEXT NOT NULL,
                tags TEXT NOT NULL,
                origin TEXT NOT NULL,
                pack_id TEXT,
                pack_entity_id TEXT,
                PRIMARY KEY (campaign_id, id)
            );

            CREATE TABLE IF NOT EXISTS facts (
                campaign_id TEXT NOT NULL,
                id TEXT NOT NULL,
                subject TEXT NOT NULL,
                predicate TEXT NOT NULL,
                object TEXT NOT NULL,
                visibility TEXT NOT NULL,
                confidence REAL NOT NULL,
                tags TEXT NOT NULL,
                discovered_turn INTEGER,
                discovery_method TEXT,
                origin TEXT NOT NULL,
                pack_id TEXT,
                PRIMARY KEY (campaign_id, id)
            );

            CREATE TABLE IF NOT EXISTS scene (
                campaign_id TEXT PRIMARY KEY,
                data TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS threads (
                campaign_id TEXT NOT NULL,
                id TEXT NOT NULL,
                data TEXT NOT NULL,
                status TEXT NOT NULL,
                PRIMARY KEY (campaign_id, id)
            );

            CREATE TABLE IF NOT EXISTS clocks (
                campaign_id TEXT NOT NULL,
                id TEXT NOT NULL,
                name TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (campaign_id, id)
            );

            CREATE TABLE IF NOT EXISTS inventory (
                campaign_id TEXT NOT NULL,
                owner TEXT NOT NULL,
                item TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                flags TEXT NOT NULL,
                PRIMARY KEY (campaign_id, owner, item)
            );

            CREATE TABLE IF NOT EXISTS relationships (
                campaign_id TEXT NOT NULL,
                from_id TEXT NOT NULL,
                to_id TEXT NOT NULL,
                rel_type TEXT NOT NULL,
                intensity INTEGER NOT NULL,
                notes TEXT NOT NULL,
                PRIMARY KEY (campaign_id, from_id, to_id, rel_type)
            );

            CREATE TABLE IF NOT EXISTS failure_streaks (
                campaign_id TEXT NOT NULL,
                subject TEXT NOT NULL,
                category TEXT NOT NULL,
                count INTEGER NOT NULL,
                PRIMARY KEY (campaign_id, subject, category)
            );

            CREATE TABLE IF NOT EXISTS events (
                campaign_id TEXT NOT NULL,
                turn INTEGER NOT NULL,
                record TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (campaign_id, turn)
            );

            CREATE TABLE IF NOT EXISTS summaries (
                campaign_id TEXT NOT NULL,
                scope TEXT NOT NULL,
                scope_id TEXT NOT NULL,
                turn_start INTEGER NOT NULL,
                turn_end INTEGER NOT NULL,
                text TEXT NOT NULL,
                PRIMARY KEY (campaign_id, scope, scope_id)
            );

            CREATE TABLE IF NOT EXISTS sessions (
                campaign_id TEXT NOT NULL,
                id TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                turn_start INTEGER NOT NULL,
                turn_end INTEGER,
                recap TEXT,
                PRIMARY KEY (campaign_id, id)
            );

            CREATE TABLE IF NOT EXISTS scene_lore (
                campaign_id TEXT PRIMARY KEY,
                data TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_facts_subject
                ON facts(campaign_id, subject);
            CREATE INDEX IF NOT EXISTS idx_events_turn
                ON events(campaign_id, turn);
            "#,
        )?;
        self.conn
            .execute(&format!("PRAGMA user_version = {SCHEMA_VERSION}"), [])?;
        Ok(())
    }

    // ---- campaign row ----

    pub fn create_campaign(&self, row: &CampaignRow) -> Result<()> {
        self.conn.execute(
            "INSERT INTO campaigns (id, name, scenario_id, system_config, calibration, \
             prompt_versions, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.id,
                row.name,
                row.scenario_id,
                to_json(&row.system)?,
                to_json(&row.calibration)?,
                to_json(&row.prompt_versions)?,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn load_campaign(&self) -> Result<CampaignRow> {
        self.conn
            .query_row(
                "SELECT id, name, scenario_id, system_config, calibration, prompt_versions \
                 FROM campaigns WHERE id = ?1",
                params![self.campaign],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| StorageError::MissingRow(format!("campaign {}", self.campaign)).into())
            .and_then(|(id, name, scenario_id, system, calibration, versions)| {
                Ok(CampaignRow {
                    id,
                    name,
                    scenario_id,
                    system: from_json(&system)?,
                    calibration: from_json(&calibration)?,
                    prompt_versions: from_json(&versions)?,
                })
            })
    }

    /// Copy the campaign header under a new id; used to seed a replay
    /// sandbox. Projections and events are not copied.
    pub fn clone_campaign_row(&self, to: &str) -> Result<()> {
        let affected = self.conn.execute(
            "INSERT OR REPLACE INTO campaigns \
             SELECT ?2, name, scenario_id, system_config, calibration, prompt_versions, ?3 \
             FROM campaigns WHERE id = ?1",
            params![self.campaign, to, chrono::Utc::now().to_rfc3339()],
        )?;
        if affected == 0 {
            return Err(StorageError::MissingRow(format!("campaign {}", self.campaign)).into());
        }
        Ok(())
    }

    pub fn set_prompt_versions(&self, versions: &BTreeMap<String, String>) -> Result<()> {
        self.conn.execute(
            "UPDATE campaigns SET prompt_versions = ?2 WHERE id = ?1",
            params![self.campaign, to_json(versions)?],
        )?;
        Ok(())
    }

    // ---- projection getters ----

    pub fn entities(&self) -> Result<Vec<Entity>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, entity_type, name, attributes, tags, origin, pack_id, pack_entity_id \
             FROM entities WHERE campaign_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![self.campaign], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, ty, name, attributes, tags, origin, pack_id, pack_entity_id) = row?;
            out.push(Entity {
                id: Id::from(id),
                entity_type: ty
                    .parse()
                    .map_err(|_| StorageError::ConstraintViolation(format!("entity type {ty}")))?,
                name,
                attributes: from_json(&attributes)?,
                tags: from_json(&tags)?,
                origin: origin.parse().map_err(|_| {
                    StorageError::ConstraintViolation(format!("origin {origin}"))
                })?,
                pack_id,
                pack_entity_id: pack_entity_id.map(Id::from),
            });
        }
        Ok(out)
    }

    pub fn entity(&self, id: &Id) -> Result<Option<Entity>> {
        Ok(self
            .entities()?
            .into_iter()
            .find(|e| &e.id == id))
    }

    pub fn facts(&self) -> Result<Vec<Fact>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, subject, predicate, object, visibility, confidence, tags, \
             discovered_turn, discovery_method, origin, pack_id \
             FROM facts WHERE campaign_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![self.campaign], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, f64>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, Option<i64>>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, Option<String>>(10)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (
                id,
                subject,
                predicate,
                object,
                visibility,
                confidence,
                tags,
                discovered_turn,
                discovery_method,
                origin,
                pack_id,
            ) = row?;
            out.push(Fact {
                id: Id::from(id),
                subject: Id::from(subject),
                predicate,
                object: from_json(&object)?,
                visibility: visibility.parse().map_err(|_| {
                    StorageError::ConstraintViolation(format!("visibility {visibility}"))
                })?,
                confidence,
                tags: from_json(&tags)?,
                discovered_turn: discovered_turn.map(|t| t as u64),
                discovery_method,
                origin: origin.parse().map_err(|_| {
                    StorageError::ConstraintViolation(format!("origin {origin}"))
                })?,
                pack_id,
            });
        }
        Ok(out)
    }

    pub fn facts_for_subject(&self, subject: &Id) -> Result<Vec<Fact>> {
        Ok(self
            .facts()?
            .into_iter()
            .filter(|f| &f.subject == subject)
            .collect())
    }

    pub fn clocks(&self) -> Result<Vec<Clock>> {
        let mut stmt = self
            .conn
            .prepare("SELECT data FROM clocks WHERE campaign_id = ?1 ORDER BY name")?;
        let rows = stmt.query_map(params![self.campaign], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(from_json(&row?)?);
        }
        Ok(out)
    }

    pub fn clock_by_name(&self, name: &str) -> Result<Option<Clock>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT data FROM clocks WHERE campaign_id = ?1 AND name = ?2",
                params![self.campaign, name],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|r| from_json(&r)).transpose()
    }

    pub fn scene(&self) -> Result<Option<Scene>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT data FROM scene WHERE campaign_id = ?1",
                params![self.campaign],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|r| from_json(&r)).transpose()
    }

    pub fn threads(&self) -> Result<Vec<Thread>> {
        let mut stmt = self
            .conn
            .prepare("SELECT data FROM threads WHERE campaign_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![self.campaign], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(from_json(&row?)?);
        }
        Ok(out)
    }

    pub fn inventory(&self) -> Result<Vec<InventoryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT owner, item, quantity, flags FROM inventory \
             WHERE campaign_id = ?1 ORDER BY owner, item",
        )?;
        let rows = stmt.query_map(params![self.campaign], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (owner, item, quantity, flags) = row?;
            out.push(InventoryEntry {
                owner: Id::from(owner),
                item: Id::from(item),
                quantity,
                flags: from_json(&flags)?,
            });
        }
        Ok(out)
    }

    pub fn inventory_for(&self, owner: &Id) -> Result<Vec<InventoryEntry>> {
        Ok(self
            .inventory()?
            .into_iter()
            .filter(|e| &e.owner == owner)
            .collect())
    }

    pub fn relationships(&self) -> Result<Vec<Relationship>> {
        let mut stmt = self.conn.prepare(
            "SELECT from_id, to_id, rel_type, intensity, notes FROM relationships \
             WHERE campaign_id = ?1 ORDER BY from_id, to_id",
        )?;
        let rows = stmt.query_map(params![self.campaign], |row| {
            Ok(Relationship {
                from: Id::from(row.get::<_, String>(0)?),
                to: Id::from(row.get::<_, String>(1)?),
                rel_type: row.get(2)?,
                intensity: row.get(3)?,
                notes: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn failure_streaks(&self) -> Result<Vec<FailureStreak>> {
        let mut stmt = self.conn.prepare(
            "SELECT subject, category, count FROM failure_streaks WHERE campaign_id = ?1",
        )?;
        let rows = stmt.query_map(params![self.campaign], |row| {
            Ok(FailureStreak {
                subject: Id::from(row.get::<_, String>(0)?),
                category: row.get(1)?,
                count: row.get::<_, i64>(2)? as u32,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn streak(&self, subject: &Id, category: &str) -> Result<u32> {
        let count: Option<i64> = self
            .conn
            .query_row(
                "SELECT count FROM failure_streaks \
                 WHERE campaign_id = ?1 AND subject = ?2 AND category = ?3",
                params![self.campaign, subject.as_str(), category],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0) as u32)
    }

    // ---- event log ----

    pub fn last_turn(&self) -> Result<u64> {
        let turn: Option<i64> = self.conn.query_row(
            "SELECT MAX(turn) FROM events WHERE campaign_id = ?1",
            params![self.campaign],
            |row| row.get(0),
        )?;
        Ok(turn.unwrap_or(0) as u64)
    }

    pub fn event_count(&self) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM events WHERE campaign_id = ?1",
            params![self.campaign],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn event(&self, turn: u64) -> Result<Option<EventRecord>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT record FROM events WHERE campaign_id = ?1 AND turn = ?2",
                params![self.campaign, turn as i64],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|r| from_json(&r)).transpose()
    }

    pub fn events_in_range(&self, start: u64, end: u64) -> Result<Vec<EventRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT record FROM events \
             WHERE campaign_id = ?1 AND turn >= ?2 AND turn <= ?3 ORDER BY turn",
        )?;
        let rows = stmt.query_map(
            params![self.campaign, start as i64, end as i64],
            |row| row.get::<_, String>(0),
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(from_json(&row?)?);
        }
        Ok(out)
    }

    /// Commit a turn: apply its diff and append its record in one
    /// transaction. The record is never updated afterwards.
    pub fn commit_turn(&mut self, record: &EventRecord) -> Result<()> {
        let campaign = self.campaign.clone();
        let tx = self.conn.transaction()?;
        apply_diff_tx(&tx, &campaign, &record.diff)?;
        tx.execute(
            "INSERT INTO events (campaign_id, turn, record, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                campaign,
                record.turn as i64,
                to_json(record)?,
                record.created_at,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Apply a diff without an event record. Scenario seeding and replay
    /// reconstruction go through here; play turns use `commit_turn`.
    pub fn apply_state_diff(&mut self, diff: &StateDiff) -> Result<()> {
        let campaign = self.campaign.clone();
        let tx = self.conn.transaction()?;
        apply_diff_tx(&tx, &campaign, diff)?;
        tx.commit()?;
        Ok(())
    }

    /// Wipe the event log for this campaign. Only sandbox campaigns go
    /// through this, when a replay range is re-run; live campaigns never
    /// delete events.
    pub fn clear_events(&self) -> Result<()> {
        self.conn.execute(
            "DELETE FROM events WHERE campaign_id = ?1",
            params![self.campaign],
        )?;
        Ok(())
    }

    /// Drop every projection row for this campaign, leaving the event log
    /// and campaign header intact. Replay rebuilds from here.
    pub fn reset_projections(&mut self) -> Result<()> {
        let campaign = self.campaign.clone();
        let tx = self.conn.transaction()?;
        for table in [
            "entities",
            "facts",
            "scene",
            "threads",
            "clocks",
            "inventory",
            "relationships",
            "failure_streaks",
            "summaries",
            "scene_lore",
        ] {
            tx.execute(
                &format!("DELETE FROM {table} WHERE campaign_id = ?1"),
                params![campaign],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ---- summaries, sessions, scene lore ----

    pub fn upsert_summary(&self, summary: &Summary) -> Result<()> {
        self.conn.execute(
            "INSERT INTO summaries (campaign_id, scope, scope_id, turn_start, turn_end, text) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT (campaign_id, scope, scope_id) DO UPDATE SET \
             turn_start = excluded.turn_start, turn_end = excluded.turn_end, \
             text = excluded.text",
            params![
                self.campaign,
                summary.scope,
                summary.scope_id,
                summary.turn_start as i64,
                summary.turn_end as i64,
                summary.text,
            ],
        )?;
        Ok(())
    }

    pub fn summary(&self, scope: &str, scope_id: &str) -> Result<Option<Summary>> {
        self.conn
            .query_row(
                "SELECT turn_start, turn_end, text FROM summaries \
                 WHERE campaign_id = ?1 AND scope = ?2 AND scope_id = ?3",
                params![self.campaign, scope, scope_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?
            .map(|(turn_start, turn_end, text)| {
                Ok(Summary {
                    scope: scope.to_string(),
                    scope_id: scope_id.to_string(),
                    turn_start: turn_start as u64,
                    turn_end: turn_end as u64,
                    text,
                })
            })
            .transpose()
    }

    pub fn insert_session(&self, session: &SessionRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sessions (campaign_id, id, started_at, ended_at, turn_start, \
             turn_end, recap) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                self.campaign,
                session.id,
                session.started_at,
                session.ended_at,
                session.turn_start as i64,
                session.turn_end.map(|t| t as i64),
                session.recap,
            ],
        )?;
        Ok(())
    }

    pub fn update_session(&self, session: &SessionRecord) -> Result<()> {
        self.conn.execute(
            "UPDATE sessions SET ended_at = ?3, turn_end = ?4, recap = ?5 \
             WHERE campaign_id = ?1 AND id = ?2",
            params![
                self.campaign,
                session.id,
                session.ended_at,
                session.turn_end.map(|t| t as i64),
                session.recap,
            ],
        )?;
        Ok(())
    }

    pub fn latest_session(&self) -> Result<Option<SessionRecord>> {
        self.conn
            .query_row(
                "SELECT id, started_at, ended_at, turn_start, turn_end, recap FROM sessions \
                 WHERE campaign_id = ?1 ORDER BY started_at DESC LIMIT 1",
                params![self.campaign],
                |row| {
                    Ok(SessionRecord {
                        id: row.get(0)?,
                        started_at: row.get(1)?,
                        ended_at: row.get(2)?,
                        turn_start: row.get::<_, i64>(3)? as u64,
                        turn_end: row.get::<_, Option<i64>>(4)?.map(|t| t as u64),
                        recap: row.get(5)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn save_scene_lore(&self, data: &serde_json::Value) -> Result<()> {
        self.conn.execute(
            "INSERT INTO scene_lore (campaign_id, data) VALUES (?1, ?2) \
             ON CONFLICT (campaign_id) DO UPDATE SET data = excluded.data",
            params![self.campaign, to_json(data)?],
        )?;
        Ok(())
    }

    pub fn load_scene_lore(&self) -> Result<Option<serde_json::Value>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT data FROM scene_lore WHERE campaign_id = ?1",
                params![self.campaign],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|r| from_json(&r)).transpose()
    }

    pub fn clear_scene_lore(&self) -> Result<()> {
        self.conn.execute(
            "DELETE FROM scene_lore WHERE campaign_id = ?1",
            params![self.campaign],
        )?;
        Ok(())
    }
}

fn constraint(detail: String) -> crate::error::Error {
    StorageError::ConstraintViolation(detail).into()
}

fn entity_exists(tx: &rusqlite::Transaction, campaign: &str, id: &Id) -> Result<bool> {
    let found: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM entities WHERE campaign_id = ?1 AND id = ?2",
            params![campaign, id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Apply a diff inside an open transaction, enforcing the projection
/// invariants: clock bounds, non-negative inventory, known foreign keys.
fn apply_diff_tx(tx: &rusqlite::Transaction, campaign: &str, diff: &StateDiff) -> Result<()> {
    // New clocks and entities first so the rest of the diff may reference
    // them.
    for clock in &diff.clocks_to_add {
        tx.execute(
            "INSERT OR REPLACE INTO clocks (campaign_id, id, name, data) \
             VALUES (?1, ?2, ?3, ?4)",
            params![campaign, clock.id.as_str(), clock.name, to_json(clock)?],
        )?;
    }

    for entity in &diff.entities_to_add {
        tx.execute(
            "INSERT OR REPLACE INTO entities \
             (campaign_id, id, entity_type, name, attributes, tags, origin, pack_id, \
              pack_entity_id) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                campaign,
                entity.id.as_str(),
                entity.entity_type.to_string(),
                entity.name,
                to_json(&entity.attributes)?,
                to_json(&entity.tags)?,
                entity.origin.to_string(),
                entity.pack_id,
                entity.pack_entity_id.as_ref().map(|id| id.as_str().to_string()),
            ],
        )?;
    }

    for fact in &diff.facts_to_add {
        if !entity_exists(tx, campaign, &fact.subject)? {
            return Err(constraint(format!(
                "fact {} references unknown subject {}",
                fact.id, fact.subject
            )));
        }
        tx.execute(
            "INSERT OR REPLACE INTO facts \
             (campaign_id, id, subject, predicate, object, visibility, confidence, tags, \
              discovered_turn, discovery_method, origin, pack_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                campaign,
                fact.id.as_str(),
                fact.subject.as_str(),
                fact.predicate,
                to_json(&fact.object)?,
                fact.visibility.to_string(),
                fact.confidence,
                to_json(&fact.tags)?,
                fact.discovered_turn.map(|t| t as i64),
                fact.discovery_method,
                fact.origin.to_string(),
                fact.pack_id,
            ],
        )?;
    }

    for update in &diff.fact_updates {
        if update.retract {
            let removed = tx.execute(
                "DELETE FROM facts WHERE campaign_id = ?1 AND id = ?2",
                params![campaign, update.id.as_str()],
            )?;
            if removed == 0 {
                return Err(constraint(format!("retraction of unknown fact {}", update.id)));
            }
            continue;
        }
        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM facts WHERE campaign_id = ?1 AND id = ?2",
                params![campaign, update.id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_none() {
            return Err(constraint(format!("update of unknown fact {}", update.id)));
        }
        if let Some(object) = &update.object {
            tx.execute(
                "UPDATE facts SET object = ?3 WHERE campaign_id = ?1 AND id = ?2",
                params![campaign, update.id.as_str(), to_json(object)?],
            )?;
        }
        if let Some(visibility) = update.visibility {
            tx.execute(
                "UPDATE facts SET visibility = ?3 WHERE campaign_id = ?1 AND id = ?2",
                params![campaign, update.id.as_str(), visibility.to_string()],
            )?;
        }
        if let Some(confidence) = update.confidence {
            tx.execute(
                "UPDATE facts SET confidence = ?3 WHERE campaign_id = ?1 AND id = ?2",
                params![campaign, update.id.as_str(), confidence],
            )?;
        }
        if let Some(turn) = update.discovered_turn {
            tx.execute(
                "UPDATE facts SET discovered_turn = ?3, discovery_method = ?4 \
                 WHERE campaign_id = ?1 AND id = ?2",
                params![
                    campaign,
                    update.id.as_str(),
                    turn as i64,
                    update.discovery_method,
                ],
            )?;
        }
    }

    for (name, delta) in &diff.clock_deltas {
        let raw: Option<String> = tx
            .query_row(
                "SELECT data FROM clocks WHERE campaign_id = ?1 AND name = ?2",
                params![campaign, name],
                |row| row.get(0),
            )
            .optional()?;
        let Some(raw) = raw else {
            return Err(constraint(format!("delta against unknown clock {name}")));
        };
        let mut clock: Clock = from_json(&raw)?;
        let next = clock.value + delta;
        if next < 0 || next > clock.max {
            return Err(constraint(format!(
                "clock {name} would leave bounds: {} + {delta} not in 0..={}",
                clock.value, clock.max
            )));
        }
        clock.value = next;
        tx.execute(
            "UPDATE clocks SET data = ?3 WHERE campaign_id = ?1 AND name = ?2",
            params![campaign, name, to_json(&clock)?],
        )?;
    }

    for delta in &diff.inventory_deltas {
        if !entity_exists(tx, campaign, &delta.owner)? {
            return Err(constraint(format!("inventory owner {} unknown", delta.owner)));
        }
        if !entity_exists(tx, campaign, &delta.item)? {
            return Err(constraint(format!("inventory item {} unknown", delta.item)));
        }
        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT quantity, flags FROM inventory \
                 WHERE campaign_id = ?1 AND owner = ?2 AND item = ?3",
                params![campaign, delta.owner.as_str(), delta.item.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (quantity, mut flags) = match existing {
            Some((q, f)) => (q, from_json::<Vec<String>>(&f)?),
            None => (0, Vec::new()),
        };
        let next = quantity + delta.delta;
        if next < 0 {
            return Err(constraint(format!(
                "inventory of {} for {} would go negative",
                delta.item, delta.owner
            )));
        }
        for flag in &delta.add_flags {
            if !flags.contains(flag) {
                flags.push(flag.clone());
            }
        }
        flags.retain(|f| !delta.remove_flags.contains(f));
        if next == 0 && flags.is_empty() {
            tx.execute(
                "DELETE FROM inventory WHERE campaign_id = ?1 AND owner = ?2 AND item = ?3",
                params![campaign, delta.owner.as_str(), delta.item.as_str()],
            )?;
        } else {
            tx.execute(
                "INSERT INTO inventory (campaign_id, owner, item, quantity, flags) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT (campaign_id, owner, item) DO UPDATE SET \
                 quantity = excluded.quantity, flags = excluded.flags",
                params![
                    campaign,
                    delta.owner.as_str(),
                    delta.item.as_str(),
                    next,
                    to_json(&flags)?,
                ],
            )?;
        }
    }

    if let Some(scene) = &diff.scene_replacement {
        if !entity_exists(tx, campaign, &scene.location)? {
            return Err(constraint(format!("scene location {} unknown", scene.location)));
        }
        for present in &scene.present {
            if !entity_exists(tx, campaign, present)? {
                return Err(constraint(format!("scene lists unknown entity {present}")));
            }
        }
        tx.execute(
            "INSERT INTO scene (campaign_id, data) VALUES (?1, ?2) \
             ON CONFLICT (campaign_id) DO UPDATE SET data = excluded.data",
            params![campaign, to_json(scene)?],
        )?;
    }

    for thread in &diff.threads_to_add {
        tx.execute(
            "INSERT OR REPLACE INTO threads (campaign_id, id, data, status) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                campaign,
                thread.id.as_str(),
                to_json(thread)?,
                thread.status.to_string(),
            ],
        )?;
    }

    for update in &diff.thread_updates {
        let raw: Option<String> = tx
            .query_row(
                "SELECT data FROM threads WHERE campaign_id = ?1 AND id = ?2",
                params![campaign, update.id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(raw) = raw else {
            return Err(constraint(format!("status update of unknown thread {}", update.id)));
        };
        let mut thread: Thread = from_json(&raw)?;
        thread.status = update.status;
        tx.execute(
            "UPDATE threads SET data = ?3, status = ?4 WHERE campaign_id = ?1 AND id = ?2",
            params![
                campaign,
                update.id.as_str(),
                to_json(&thread)?,
                thread.status.to_string(),
            ],
        )?;
    }

    for update in &diff.relationship_updates {
        for end in [&update.from, &update.to] {
            if !entity_exists(tx, campaign, end)? {
                return Err(constraint(format!("relationship references unknown {end}")));
            }
        }
        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT intensity, notes FROM relationships \
                 WHERE campaign_id = ?1 AND from_id = ?2 AND to_id = ?3 AND rel_type = ?4",
                params![
                    campaign,
                    update.from.as_str(),
                    update.to.as_str(),
                    update.rel_type,
                ],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (intensity, notes) = existing.unwrap_or((0, String::new()));
        tx.execute(
            "INSERT INTO relationships (campaign_id, from_id, to_id, rel_type, intensity, notes) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT (campaign_id, from_id, to_id, rel_type) DO UPDATE SET \
             intensity = excluded.intensity, notes = excluded.notes",
            params![
                campaign,
                update.from.as_str(),
                update.to.as_str(),
                update.rel_type,
                intensity + update.intensity_delta,
                update.notes.clone().unwrap_or(notes),
            ],
        )?;
    }

    for update in &diff.streak_updates {
        match update.op {
            StreakOp::Increment => {
                tx.execute(
                    "INSERT INTO failure_streaks (campaign_id, subject, category, count) \
                     VALUES (?1, ?2, ?3, 1) \
                     ON CONFLICT (campaign_id, subject, category) DO UPDATE SET \
                     count = count + 1",
                    params![campaign, update.subject.as_str(), update.category],
                )?;
            }
            StreakOp::Reset => {
                tx.execute(
                    "DELETE FROM failure_streaks \
                     WHERE campaign_id = ?1 AND subject = ?2 AND category = ?3",
                    params![campaign, update.subject.as_str(), update.category],
                )?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Origin;
    use crate::state::model::{EntityType, Visibility};
    use serde_json::Map;

    fn store_with_pc() -> Store {
        let mut store = Store::open_in_memory("campaign:test").unwrap();
        let mut diff = StateDiff::default();
        diff.entities_to_add.push(Entity {
            id: Id::from("campaign:pc"),
            entity_type: EntityType::Pc,
            name: "Riley".into(),
            attributes: Map::new(),
            tags: vec![],
            origin: Origin::Campaign,
            pack_id: None,
            pack_entity_id: None,
        });
        store.apply_state_diff(&diff).unwrap();
        store
    }

    #[test]
    fn negative_inventory_is_rejected_and_nothing_commits() {
        let mut store = store_with_pc();
        let mut diff = StateDiff::default();
        diff.entities_to_add.push(Entity {
            id: Id::from("campaign:chip"),
            entity_type: EntityType::Item,
            name: "Data chip".into(),
            attributes: Map::new(),
            tags: vec![],
            origin: Origin::Campaign,
            pack_id: None,
            pack_entity_id: None,
        });
        diff.inventory_deltas.push(crate::state::diff::InventoryDelta {
            owner: Id::from("campaign:pc"),
            item: Id::from("campaign:chip"),
            delta: -1,
            add_flags: vec![],
            remove_flags: vec![],
        });
        assert!(store.apply_state_diff(&diff).is_err());
        // The entity insert in the same diff must have rolled back too.
        assert!(store.entity(&Id::from("campaign:chip")).unwrap().is_none());
    }

    #[test]
    fn clock_deltas_respect_bounds() {
        let mut store = store_with_pc();
        let mut diff = StateDiff::default();
        diff.clock_deltas.insert("heat".into(), 1);
        // Unknown clock.
        assert!(store.apply_state_diff(&diff).is_err());

        let rule = crate::config::ClockRule {
            name: "heat".into(),
            segments: 2,
            start: 2,
            triggers: Default::default(),
            tags: vec![],
            bidirectional: false,
        };
        let mut create = StateDiff::default();
        create.clocks_to_add.push(Clock::from_rule(&rule));
        store.apply_state_diff(&create).unwrap();
        // Already at max; +1 would leave bounds.
        assert!(store.apply_state_diff(&diff).is_err());
        assert_eq!(store.clock_by_name("heat").unwrap().unwrap().value, 2);
    }

    #[test]
    fn fact_with_unknown_subject_is_rejected() {
        let mut store = store_with_pc();
        let mut diff = StateDiff::default();
        diff.facts_to_add.push(Fact {
            id: Id::from("campaign:f1"),
            subject: Id::from("campaign:ghost"),
            predicate: "haunts".into(),
            object: serde_json::Value::Null,
            visibility: Visibility::Known,
            confidence: 1.0,
            tags: vec![],
            discovered_turn: None,
            discovery_method: None,
            origin: Origin::Campaign,
            pack_id: None,
        });
        assert!(store.apply_state_diff(&diff).is_err());
    }

    #[test]
    fn committed_turn_appends_exactly_one_record() {
        let mut store = store_with_pc();
        let record = EventRecord {
            turn: 1,
            player_input: "look around".into(),
            context_packet: serde_json::Value::Null,
            interpreter: serde_json::Value::Null,
            validator: serde_json::Value::Null,
            planner: serde_json::Value::Null,
            resolver: serde_json::Value::Null,
            narrator: serde_json::Value::Null,
            engine_events: vec![],
            diff: StateDiff::default(),
            final_text: "The bar hums around you.".into(),
            prompt_versions: BTreeMap::new(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        store.commit_turn(&record).unwrap();
        assert_eq!(store.event_count().unwrap(), 1);
        assert_eq!(store.last_turn().unwrap(), 1);
        let loaded = store.event(1).unwrap().unwrap();
        assert_eq!(loaded.final_text, record.final_text);
    }
}
