use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use pc_core::{
    Action, AgentSnapshot, CollabError, CycleRecord, EventSink, Fact, FactKey, Gap, GapType,
    Polarity, unix_to_iso8601,
};

use crate::error::{Result, StoreError};
use crate::schema;

const SNAPSHOT_KEYS: [&str; 5] = [
    "snapshot_cycle",
    "snapshot_field",
    "snapshot_cooldowns",
    "snapshot_plan",
    "snapshot_kpis",
];

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // --- Metadata ---

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM metadata WHERE key = ?1")?;
        Ok(stmt.query_row([key], |row| row.get(0)).optional()?)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        set_metadata_on(&self.conn, key, value)
    }

    // --- Snapshots ---

    /// Replace the stored agent state with `snapshot`. Facts and gaps are
    /// rows; field, cooldowns, plan and counters are JSON metadata.
    ///
    /// A field with non-finite values is refused and the previous state is
    /// left in place.
    pub fn save_snapshot(&self, snapshot: &AgentSnapshot) -> Result<()> {
        let field = &snapshot.field;
        if !field.t.is_finite()
            || [&field.s, &field.l, &field.src_s, &field.src_l]
                .iter()
                .any(|v| v.iter().any(|x| !x.is_finite()))
        {
            return Err(StoreError::InvalidData(
                "refusing to save a field with non-finite values".to_string(),
            ));
        }

        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch("DELETE FROM facts; DELETE FROM gaps;")?;

        {
            let mut insert = tx.prepare(
                "INSERT INTO facts (predicate, args, polarity, source, timestamp, confidence)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for fact in &snapshot.facts {
                insert.execute(params![
                    fact.predicate(),
                    serde_json::to_string(fact.args())?,
                    polarity_str(fact.polarity()),
                    fact.source(),
                    fact.timestamp() as i64,
                    fact.confidence(),
                ])?;
            }
        }

        {
            let mut insert = tx.prepare(
                "INSERT INTO gaps (gap_type, description, context, priority, attempts)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for gap in &snapshot.gaps {
                insert.execute(params![
                    gap.gap_type.to_string(),
                    gap.description,
                    serde_json::to_string(&gap.context)?,
                    gap.priority,
                    gap.attempts,
                ])?;
            }
        }

        set_metadata_on(&tx, "snapshot_cycle", &snapshot.cycle.to_string())?;
        set_metadata_on(&tx, "snapshot_field", &serde_json::to_string(&snapshot.field)?)?;
        set_metadata_on(
            &tx,
            "snapshot_cooldowns",
            &serde_json::to_string(&snapshot.cooldowns)?,
        )?;
        set_metadata_on(&tx, "snapshot_plan", &serde_json::to_string(&snapshot.plan)?)?;
        set_metadata_on(&tx, "snapshot_kpis", &serde_json::to_string(&snapshot.kpis)?)?;

        tx.commit()?;
        tracing::debug!(
            cycle = snapshot.cycle,
            facts = snapshot.facts.len(),
            gaps = snapshot.gaps.len(),
            "saved agent snapshot"
        );
        Ok(())
    }

    /// The last saved snapshot, or `None` for a fresh database.
    pub fn load_snapshot(&self) -> Result<Option<AgentSnapshot>> {
        let Some(cycle) = self.get_metadata("snapshot_cycle")? else {
            return Ok(None);
        };
        let cycle = cycle
            .parse::<u64>()
            .map_err(|e| StoreError::InvalidData(format!("snapshot cycle '{cycle}': {e}")))?;

        let snapshot = AgentSnapshot {
            cycle,
            facts: self.load_facts()?,
            gaps: self.load_gaps()?,
            field: self.metadata_json("snapshot_field")?,
            cooldowns: self.metadata_json("snapshot_cooldowns")?,
            plan: self.metadata_json("snapshot_plan")?,
            kpis: self.metadata_json("snapshot_kpis")?,
        };
        Ok(Some(snapshot))
    }

    /// Drop the saved agent state. The cycle log is kept.
    pub fn clear_snapshot(&self) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch("DELETE FROM facts; DELETE FROM gaps;")?;
        for key in SNAPSHOT_KEYS {
            tx.execute("DELETE FROM metadata WHERE key = ?1", [key])?;
        }
        tx.commit()?;
        Ok(())
    }

    fn metadata_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<T> {
        let raw = self
            .get_metadata(key)?
            .ok_or_else(|| StoreError::InvalidData(format!("snapshot is missing {key}")))?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn load_facts(&self) -> Result<Vec<Fact>> {
        let mut stmt = self.conn.prepare(
            "SELECT predicate, args, polarity, source, timestamp, confidence
             FROM facts ORDER BY id",
        )?;
        let rows: Vec<(String, String, String, String, i64, f64)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;

        rows.into_iter()
            .map(|(predicate, args, polarity, source, timestamp, confidence)| {
                let key = FactKey {
                    predicate,
                    args: serde_json::from_str(&args)?,
                };
                Ok(Fact::new(
                    key,
                    parse_polarity(&polarity)?,
                    source,
                    timestamp.max(0) as u64,
                    confidence,
                ))
            })
            .collect()
    }

    fn load_gaps(&self) -> Result<Vec<Gap>> {
        let mut stmt = self.conn.prepare(
            "SELECT gap_type, description, context, priority, attempts FROM gaps ORDER BY seq",
        )?;
        let rows: Vec<(String, String, String, f64, u32)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;

        rows.into_iter()
            .map(|(gap_type, description, context, priority, attempts)| {
                Ok(Gap {
                    gap_type: gap_type.parse::<GapType>().map_err(StoreError::InvalidData)?,
                    description,
                    context: serde_json::from_str(&context)?,
                    priority,
                    attempts,
                })
            })
            .collect()
    }

    // --- Cycle log ---

    pub fn append_cycle(&self, record: &CycleRecord) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO cycles (cycle, timestamp, recorded_at, input, action, response, signal_vector, state_summary)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.cycle as i64,
                record.timestamp as i64,
                unix_to_iso8601(record.timestamp),
                record.input,
                record.action.as_str(),
                record.response,
                serde_json::to_string(&record.signal_vector)?,
                serde_json::to_string(&record.state_summary)?,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// The newest `limit` records, oldest first.
    pub fn recent_cycles(&self, limit: usize) -> Result<Vec<CycleRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT cycle, timestamp, input, action, response, signal_vector, state_summary
             FROM cycles ORDER BY id DESC LIMIT ?1",
        )?;
        let rows: Vec<(i64, i64, String, String, String, String, String)> = stmt
            .query_map([limit as i64], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;

        let mut records = rows
            .into_iter()
            .map(|(cycle, timestamp, input, action, response, signals, summary)| {
                Ok(CycleRecord {
                    timestamp: timestamp.max(0) as u64,
                    cycle: cycle.max(0) as u64,
                    input,
                    action: Action::parse(&action).ok_or_else(|| {
                        StoreError::InvalidData(format!("unknown action '{action}'"))
                    })?,
                    response,
                    signal_vector: serde_json::from_str(&signals)?,
                    state_summary: serde_json::from_str(&summary)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        records.reverse();
        Ok(records)
    }

    pub fn cycle_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM cycles", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Logged cycles per action name.
    pub fn action_counts(&self) -> Result<BTreeMap<String, u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT action, COUNT(*) FROM cycles GROUP BY action")?;
        let counts = stmt
            .query_map([], |row| {
                let action: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((action, count.max(0) as u64))
            })?
            .collect::<std::result::Result<_, _>>()?;
        Ok(counts)
    }

    /// Database size in bytes (page_count * page_size).
    pub fn db_size(&self) -> u64 {
        self.conn
            .query_row(
                "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|size| size.max(0) as u64)
            .unwrap_or(0)
    }
}

impl EventSink for Store {
    fn append(&mut self, record: &CycleRecord) -> std::result::Result<(), CollabError> {
        self.append_cycle(record)
            .map(|_| ())
            .map_err(|e| CollabError::Failed(e.to_string()))
    }
}

fn set_metadata_on(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

fn polarity_str(polarity: Polarity) -> &'static str {
    match polarity {
        Polarity::Positive => "positive",
        Polarity::Negative => "negative",
    }
}

fn parse_polarity(s: &str) -> Result<Polarity> {
    match s {
        "positive" => Ok(Polarity::Positive),
        "negative" => Ok(Polarity::Negative),
        other => Err(StoreError::InvalidData(format!("invalid polarity '{other}'"))),
    }
}
