use std::collections::{HashMap, HashSet};
use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{PackError, Result};
use crate::lore::estimate_tokens;
use crate::lore::pack::{Chunk, PackManifest, load_pack};

/// Retrieval over installed content packs plus campaign-generated history
/// summaries. Read-only during play; installs and history appends happen
/// between turns.
pub struct LoreIndex {
    conn: Connection,
}

#[derive(Debug, Clone)]
pub struct PackSummary {
    pub id: String,
    pub name: String,
    pub version: String,
    pub layer: i64,
    pub chunk_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorpusFilter {
    Authored,
    History,
    Both,
}

#[derive(Debug, Clone)]
pub struct LoreQuery {
    pub campaign: String,
    pub location: Option<String>,
    pub entities: Vec<String>,
    pub factions: Vec<String>,
    pub threads: Vec<String>,
    pub tags: Vec<String>,
    /// Free text assembled from scene, entities, threads, the latest event
    /// and the player input; drives stage-2 ranking.
    pub text: String,
    pub budget_tokens: usize,
    pub corpus: CorpusFilter,
    /// Pre-computed similarity ranking (chunk id, score), highest first.
    /// Supplied by the embedding store when one is configured; the index
    /// falls back to FTS ranking when absent.
    pub vector_hits: Option<Vec<(String, f64)>>,
}

#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    pub score: f64,
}

impl LoreIndex {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let index = LoreIndex { conn };
        index.init_schema()?;
        Ok(index)
    }

    pub fn open_in_memory() -> Result<Self> {
        let index = LoreIndex {
            conn: Connection::open_in_memory()?,
        };
        index.init_schema()?;
        Ok(index)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS content_packs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                version TEXT NOT NULL,
                layer INTEGER NOT NULL,
                dependencies TEXT NOT NULL,
                description TEXT NOT NULL,
                installed_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pack_chunks (
                id TEXT PRIMARY KEY,
                pack_id TEXT NOT NULL,
                file_path TEXT NOT NULL,
                section_path TEXT NOT NULL,
                body TEXT NOT NULL,
                kind TEXT NOT NULL,
                entity_refs TEXT NOT NULL,
                faction_refs TEXT NOT NULL,
                location_refs TEXT NOT NULL,
                tags TEXT NOT NULL,
                token_count INTEGER NOT NULL,
                corpus TEXT NOT NULL,
                layer INTEGER NOT NULL,
                campaign_id TEXT,
                embedding_id TEXT
            );

            CREATE VIRTUAL TABLE IF NOT EXISTS chunk_fts USING fts5(
                body,
                section_path,
                chunk_id UNINDEXED,
                tokenize = 'porter unicode61'
            );

            CREATE TABLE IF NOT EXISTS entity_lore (
                campaign_id TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                chunk_id TEXT NOT NULL,
                PRIMARY KEY (campaign_id, entity_id, chunk_id)
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_pack ON pack_chunks(pack_id);
            CREATE INDEX IF NOT EXISTS idx_chunks_corpus ON pack_chunks(corpus);
            "#,
        )?;
        Ok(())
    }

    // ---- build stage ----

    pub fn install_pack(&mut self, dir: &Path) -> Result<(PackManifest, usize)> {
        let (manifest, chunks) = load_pack(dir)?;

        let installed: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM content_packs WHERE id = ?1",
                params![manifest.id],
                |row| row.get(0),
            )
            .optional()?;
        if installed.is_some() {
            return Err(PackError::AlreadyInstalled(manifest.id).into());
        }
        for dependency in &manifest.dependencies {
            let found: Option<String> = self
                .conn
                .query_row(
                    "SELECT id FROM content_packs WHERE id = ?1",
                    params![dependency],
                    |row| row.get(0),
                )
                .optional()?;
            if found.is_none() {
                return Err(PackError::MissingDependency {
                    id: manifest.id,
                    dependency: dependency.clone(),
                }
                .into());
            }
        }

        let count = chunks.len();
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO content_packs \
             (id, name, version, layer, dependencies, description, installed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                manifest.id,
                manifest.name,
                manifest.version,
                manifest.layer,
                serde_json::to_string(&manifest.dependencies)?,
                manifest.description,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        for chunk in &chunks {
            insert_chunk(&tx, chunk, "authored", manifest.layer, None)?;
        }
        tx.commit()?;
        Ok((manifest, count))
    }

    pub fn list_packs(&self) -> Result<Vec<PackSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT p.id, p.name, p.version, p.layer, \
             (SELECT COUNT(*) FROM pack_chunks c WHERE c.pack_id = p.id) \
             FROM content_packs p ORDER BY p.layer, p.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PackSummary {
                id: row.get(0)?,
                name: row.get(1)?,
                version: row.get(2)?,
                layer: row.get(3)?,
                chunk_count: row.get::<_, i64>(4)? as u64,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Whether any installed pack's front matter references the entity id.
    /// Scenario loading uses this to reject `pack:` references that no
    /// installed pack actually defines.
    pub fn has_entity(&self, entity_id: &str) -> Result<bool> {
        let needle = format!("\"{entity_id}\"");
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM pack_chunks WHERE corpus = 'authored' \
                 AND instr(entity_refs, ?1) > 0 LIMIT 1",
                params![needle],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn is_installed(&self, pack_id: &str) -> Result<bool> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM content_packs WHERE id = ?1",
                params![pack_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Campaign history corpus: one chunk per stored summary span.
    pub fn add_history_chunk(
        &mut self,
        campaign: &str,
        scope_id: &str,
        turn_start: u64,
        turn_end: u64,
        text: &str,
        tags: &[String],
    ) -> Result<()> {
        let chunk = Chunk {
            id: format!("{campaign}:history:{scope_id}#{turn_start}-{turn_end}"),
            pack_id: campaign.to_string(),
            file_path: format!("history/{scope_id}.md"),
            section_path: format!("history > turns {turn_start}-{turn_end}"),
            token_count: estimate_tokens(text),
            body: text.to_string(),
            kind: "history".to_string(),
            entity_refs: vec![],
            faction_refs: vec![],
            location_refs: vec![],
            tags: tags.to_vec(),
        };
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM chunk_fts WHERE chunk_id = ?1",
            params![chunk.id],
        )?;
        tx.execute(
            "DELETE FROM pack_chunks WHERE id = ?1",
            params![chunk.id],
        )?;
        insert_chunk(&tx, &chunk, "history", 0, Some(campaign))?;
        tx.commit()?;
        Ok(())
    }

    /// Precompute the entity-lore manifest for a campaign: every entity id
    /// mapped to the chunks that reference it. Stage 1 prefers this lookup.
    pub fn build_entity_manifest(&mut self, campaign: &str, entity_ids: &[String]) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM entity_lore WHERE campaign_id = ?1",
            params![campaign],
        )?;
        for entity in entity_ids {
            let needle = format!("\"{entity}\"");
            let mut stmt = tx.prepare(
                "SELECT id FROM pack_chunks WHERE corpus = 'authored' \
                 AND instr(entity_refs, ?1) > 0 ORDER BY id",
            )?;
            let chunk_ids = stmt
                .query_map(params![needle], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            for chunk_id in chunk_ids {
                tx.execute(
                    "INSERT OR IGNORE INTO entity_lore (campaign_id, entity_id, chunk_id) \
                     VALUES (?1, ?2, ?3)",
                    params![campaign, entity, chunk_id],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // ---- query stage ----

    /// Three-stage hybrid retrieval: metadata filter, then similarity or
    /// FTS ranking over the filtered set, then a greedy token-budget cap.
    /// Deterministic for a given index state and query; ranking ties break
    /// by (pack layer, chunk id).
    pub fn query(&self, q: &LoreQuery) -> Result<Vec<RetrievedChunk>> {
        let candidates = self.metadata_filter(q)?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let candidate_ids: HashSet<String> =
            candidates.iter().map(|(c, _)| c.id.clone()).collect();

        // Stage 2: ranked ids, best first. Vector hits when available,
        // FTS otherwise. Candidates missing from the ranking keep their
        // deterministic tie order after the ranked ones.
        let mut scores: HashMap<String, f64> = HashMap::new();
        match &q.vector_hits {
            Some(hits) => {
                for (chunk_id, score) in hits {
                    if candidate_ids.contains(chunk_id) {
                        scores.insert(chunk_id.clone(), *score);
                    }
                }
            }
            None => {
                for (chunk_id, score) in self.fts_rank(&q.text)? {
                    if candidate_ids.contains(&chunk_id) {
                        scores.insert(chunk_id, score);
                    }
                }
            }
        }

        let mut ranked = candidates;
        // Higher layer wins ties: a city pack overrides the core book.
        ranked.sort_by(|(a, la), (b, lb)| {
            let sa = scores.get(&a.id).copied().unwrap_or(f64::MIN);
            let sb = scores.get(&b.id).copied().unwrap_or(f64::MIN);
            sb.partial_cmp(&sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(lb.cmp(la))
                .then(a.id.cmp(&b.id))
        });

        // Over-fetch 2x the budget before the final cap.
        let mut overfetched = Vec::new();
        let mut fetched_tokens = 0usize;
        for (chunk, _) in ranked {
            if fetched_tokens >= q.budget_tokens * 2 {
                break;
            }
            fetched_tokens += chunk.token_count;
            overfetched.push(chunk);
        }

        // Stage 3: greedy admission in rank order under the budget.
        let mut admitted = Vec::new();
        let mut budget_used = 0usize;
        for chunk in overfetched {
            if budget_used + chunk.token_count > q.budget_tokens {
                continue;
            }
            budget_used += chunk.token_count;
            let score = scores.get(&chunk.id).copied().unwrap_or(0.0);
            admitted.push(RetrievedChunk { chunk, score });
        }
        Ok(admitted)
    }

    /// Stage 1: chunks whose front matter references any of the query's
    /// location, entities, factions, threads or tags. Entities go through
    /// the precomputed manifest when one exists for the campaign.
    fn metadata_filter(&self, q: &LoreQuery) -> Result<Vec<(Chunk, i64)>> {
        let mut ids: HashSet<String> = HashSet::new();

        let manifest_ids = self.manifest_lookup(&q.campaign, &q.entities)?;
        let manifest_hit = !manifest_ids.is_empty();
        ids.extend(manifest_ids);

        let mut clauses: Vec<String> = Vec::new();
        let mut needles: Vec<String> = Vec::new();
        if let Some(location) = &q.location {
            clauses.push("instr(location_refs, ?) > 0 OR instr(entity_refs, ?) > 0".into());
            needles.push(format!("\"{location}\""));
            needles.push(format!("\"{location}\""));
        }
        if !manifest_hit {
            for entity in &q.entities {
                clauses.push("instr(entity_refs, ?) > 0".into());
                needles.push(format!("\"{entity}\""));
            }
        }
        for faction in &q.factions {
            clauses.push("instr(faction_refs, ?) > 0".into());
            needles.push(format!("\"{faction}\""));
        }
        for thread in &q.threads {
            clauses.push("instr(entity_refs, ?) > 0".into());
            needles.push(format!("\"{thread}\""));
        }
        for tag in &q.tags {
            clauses.push("instr(tags, ?) > 0".into());
            needles.push(format!("\"{tag}\""));
        }

        if !clauses.is_empty() {
            let sql = format!(
                "SELECT id FROM pack_chunks WHERE ({})",
                clauses
                    .iter()
                    .map(|c| format!("({c})"))
                    .collect::<Vec<_>>()
                    .join(" OR ")
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params_from_iter(needles.iter()),
                |row| row.get::<_, String>(0),
            )?;
            for row in rows {
                ids.insert(row?);
            }
        }

        let mut out = Vec::new();
        for id in ids {
            if let Some((chunk, layer, corpus, campaign)) = self.chunk_row(&id)? {
                let corpus_ok = match q.corpus {
                    CorpusFilter::Authored => corpus == "authored",
                    CorpusFilter::History => corpus == "history",
                    CorpusFilter::Both => true,
                };
                let campaign_ok =
                    campaign.is_none() || campaign.as_deref() == Some(q.campaign.as_str());
                if corpus_ok && campaign_ok {
                    out.push((chunk, layer));
                }
            }
        }
        out.sort_by(|(a, _), (b, _)| a.id.cmp(&b.id));
        Ok(out)
    }

    fn manifest_lookup(&self, campaign: &str, entities: &[String]) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for entity in entities {
            let mut stmt = self.conn.prepare(
                "SELECT chunk_id FROM entity_lore \
                 WHERE campaign_id = ?1 AND entity_id = ?2 ORDER BY chunk_id",
            )?;
            let rows = stmt.query_map(params![campaign, entity], |row| {
                row.get::<_, String>(0)
            })?;
            for row in rows {
                out.push(row?);
            }
        }
        Ok(out)
    }

    fn fts_rank(&self, text: &str) -> Result<Vec<(String, f64)>> {
        let match_query = build_match_query(text);
        if match_query.is_empty() {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(
            "SELECT chunk_id, rank FROM chunk_fts WHERE chunk_fts MATCH ?1 \
             ORDER BY rank LIMIT 256",
        )?;
        let rows = stmt.query_map(params![match_query], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?;
        // fts5 rank is more negative for better matches; flip the sign so
        // higher is better everywhere else.
        Ok(rows
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(id, rank)| (id, -rank))
            .collect())
    }

    fn chunk_row(&self, id: &str) -> Result<Option<(Chunk, i64, String, Option<String>)>> {
        self.conn
            .query_row(
                "SELECT id, pack_id, file_path, section_path, body, kind, entity_refs, \
                 faction_refs, location_refs, tags, token_count, corpus, layer, campaign_id \
                 FROM pack_chunks WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, String>(9)?,
                        row.get::<_, i64>(10)?,
                        row.get::<_, String>(11)?,
                        row.get::<_, i64>(12)?,
                        row.get::<_, Option<String>>(13)?,
                    ))
                },
            )
            .optional()?
            .map(|row| {
                let (
                    id,
                    pack_id,
                    file_path,
                    section_path,
                    body,
                    kind,
                    entity_refs,
                    faction_refs,
                    location_refs,
                    tags,
                    token_count,
                    corpus,
                    layer,
                    campaign_id,
                ) = row;
                Ok((
                    Chunk {
                        id,
                        pack_id,
                        file_path,
                        section_path,
                        body,
                        kind,
                        entity_refs: serde_json::from_str(&entity_refs)?,
                        faction_refs: serde_json::from_str(&faction_refs)?,
                        location_refs: serde_json::from_str(&location_refs)?,
                        tags: serde_json::from_str(&tags)?,
                        token_count: token_count as usize,
                    },
                    layer,
                    corpus,
                    campaign_id,
                ))
            })
            .transpose()
    }

    /// Every authored chunk, for embedding-store construction at install.
    pub fn authored_chunks(&self) -> Result<Vec<Chunk>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM pack_chunks WHERE corpus = 'authored' ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut out = Vec::new();
        for id in ids {
            if let Some((chunk, _, _, _)) = self.chunk_row(&id)? {
                out.push(chunk);
            }
        }
        Ok(out)
    }
}

fn insert_chunk(
    tx: &rusqlite::Transaction,
    chunk: &Chunk,
    corpus: &str,
    layer: i64,
    campaign: Option<&str>,
) -> Result<()> {
    tx.execute(
        "INSERT INTO pack_chunks \
         (id, pack_id, file_path, section_path, body, kind, entity_refs, faction_refs, \
          location_refs, tags, token_count, corpus, layer, campaign_id, embedding_id) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, NULL)",
        params![
            chunk.id,
            chunk.pack_id,
            chunk.file_path,
            chunk.section_path,
            chunk.body,
            chunk.kind,
            serde_json::to_string(&chunk.entity_refs)?,
            serde_json::to_string(&chunk.faction_refs)?,
            serde_json::to_string(&chunk.location_refs)?,
            serde_json::to_string(&chunk.tags)?,
            chunk.token_count as i64,
            corpus,
            layer,
            campaign,
        ],
    )?;
    tx.execute(
        "INSERT INTO chunk_fts (body, section_path, chunk_id) VALUES (?1, ?2, ?3)",
        params![chunk.body, chunk.section_path, chunk.id],
    )?;
    Ok(())
}

/// Turn free text into an FTS5 OR-query of sanitized tokens.
fn build_match_query(text: &str) -> String {
    let mut seen = HashSet::new();
    let mut tokens = Vec::new();
    for raw in text.split(|c: char| !c.is_alphanumeric() && c != '_') {
        let token = raw.trim().to_lowercase();
        if token.len() < 3 || !seen.insert(token.clone()) {
            continue;
        }
        tokens.push(format!("\"{token}\""));
    }
    tokens.join(" OR ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_fixture_pack(dir: &Path) {
        fs::create_dir_all(dir.join("locations")).unwrap();
        fs::write(
            dir.join("pack.yaml"),
            "id: core\nname: Core Setting\nversion: \"1.0\"\nlayer: 1\n",
        )
        .unwrap();
        fs::write(
            dir.join("locations/rusted_anchor.md"),
            "---\ntitle: The Rusted Anchor\ntype: location\nentity_id: pack:rusted_anchor\n\
             tags: [bar]\n---\n# The Rusted Anchor\n\nA dockside bar.\n\n## Atmosphere\n\n\
             Engine oil and old beer, a broken cooler humming.\n\n## Regulars\n\n\
             Longshore crews, one fixer.\n",
        )
        .unwrap();
    }

    fn installed_index() -> LoreIndex {
        let dir = tempfile::tempdir().unwrap();
        write_fixture_pack(dir.path());
        let mut index = LoreIndex::open_in_memory().unwrap();
        index.install_pack(dir.path()).unwrap();
        index
    }

    fn base_query() -> LoreQuery {
        LoreQuery {
            campaign: "campaign:test".into(),
            location: Some("pack:rusted_anchor".into()),
            entities: vec![],
            factions: vec![],
            threads: vec![],
            tags: vec![],
            text: "cooler humming".into(),
            budget_tokens: 3000,
            corpus: CorpusFilter::Authored,
            vector_hits: None,
        }
    }

    #[test]
    fn install_then_query_by_location() {
        let index = installed_index();
        let packs = index.list_packs().unwrap();
        assert_eq!(packs.len(), 1);
        assert_eq!(packs[0].chunk_count, 3);

        let results = index.query(&base_query()).unwrap();
        assert!(!results.is_empty());
        // The FTS hit on "cooler" must outrank the unmatched chunks.
        assert!(results[0].chunk.body.contains("cooler"));
    }

    #[test]
    fn duplicate_install_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture_pack(dir.path());
        let mut index = LoreIndex::open_in_memory().unwrap();
        index.install_pack(dir.path()).unwrap();
        assert!(index.install_pack(dir.path()).is_err());
    }

    #[test]
    fn budget_cap_is_respected() {
        let index = installed_index();
        let mut query = base_query();
        query.budget_tokens = 12;
        let results = index.query(&query).unwrap();
        let total: usize = results.iter().map(|r| r.chunk.token_count).sum();
        assert!(total <= 12);
    }

    #[test]
    fn query_is_deterministic() {
        let index = installed_index();
        let a: Vec<String> = index
            .query(&base_query())
            .unwrap()
            .into_iter()
            .map(|r| r.chunk.id)
            .collect();
        let b: Vec<String> = index
            .query(&base_query())
            .unwrap()
            .into_iter()
            .map(|r| r.chunk.id)
            .collect();
        assert_eq!(a, b);
    }

    #[test]
    fn entity_manifest_short_circuits_stage_one() {
        let mut index = installed_index();
        index
            .build_entity_manifest("campaign:test", &["pack:rusted_anchor".to_string()])
            .unwrap();
        let mut query = base_query();
        query.location = None;
        query.entities = vec!["pack:rusted_anchor".into()];
        let results = index.query(&query).unwrap();
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn history_corpus_is_separated_from_authored() {
        let mut index = installed_index();
        index
            .add_history_chunk(
                "campaign:test",
                "scene",
                1,
                4,
                "The crew cased the bar.",
                &["history".to_string()],
            )
            .unwrap();

        let mut query = base_query();
        query.location = None;
        query.tags = vec!["history".into()];
        query.text = "cased the bar".into();

        query.corpus = CorpusFilter::History;
        let results = index.query(&query).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.kind, "history");

        // The authored view of the same query must not see it.
        query.corpus = CorpusFilter::Authored;
        let results = index.query(&query).unwrap();
        assert!(results.iter().all(|r| r.chunk.kind != "history"));
    }

    #[test]
    fn history_chunks_stay_inside_their_campaign() {
        let mut index = installed_index();
        index
            .add_history_chunk(
                "campaign:other",
                "scene",
                1,
                2,
                "Someone else's story.",
                &["history".to_string()],
            )
            .unwrap();
        let mut query = base_query();
        query.location = None;
        query.tags = vec!["history".into()];
        query.corpus = CorpusFilter::History;
        assert!(index.query(&query).unwrap().is_empty());
    }
}
