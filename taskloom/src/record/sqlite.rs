//! SQLite-backed execution recorder.
//!
//! [`SqliteRecorder`] persists the full execution hierarchy in four tables
//! (`plan_execution_record`, `agent_execution_record`, `think_act_record`,
//! `act_tool_info`). Uses [`rusqlite`] for synchronous access, bridged to
//! async via [`tokio::task::spawn_blocking`].
//!
//! # Storage Model
//!
//! A plan row owns its ordered steps as a JSON column; agent executions,
//! think-act cycles, and tool-call entries are relational with cascade
//! deletes down the ownership chain. Tool-call writes are two-phase:
//! name/parameters land before execution with a null result, the result is
//! written after. WAL journal mode and per-relation indexes keep
//! concurrent reads cheap.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use super::model::{
    ActToolInfo, AgentExecutionRecord, ExecutionStatus, Plan, Step, ThinkActRecord,
};
use super::{ActToolResult, RecorderError, RecorderResult};
use crate::id::{Ids, now_millis};

/// Durable recorder for the plan/agent execution hierarchy.
///
/// Cloneable via `Arc<Mutex<Connection>>`; all blocking I/O is offloaded to
/// the tokio blocking thread pool. Schema is auto-created on construction.
#[derive(Debug, Clone)]
pub struct SqliteRecorder {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecorder {
    /// Opens (or creates) a database at `path` and initializes the schema.
    pub fn open(path: impl AsRef<Path>) -> RecorderResult<Self> {
        Self::from_connection(Connection::open(path.as_ref())?)
    }

    /// Opens an ephemeral in-memory database (data lost on drop).
    pub fn in_memory() -> RecorderResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wraps an existing [`Connection`], applying pragmas and schema setup.
    pub fn from_connection(conn: Connection) -> RecorderResult<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;\
             PRAGMA foreign_keys = ON;\
             PRAGMA busy_timeout = 5000;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS plan_execution_record (
                id                 INTEGER PRIMARY KEY AUTOINCREMENT,
                current_plan_id    TEXT    NOT NULL UNIQUE,
                root_plan_id       TEXT    NOT NULL,
                parent_plan_id     TEXT,
                tool_call_id       TEXT,
                title              TEXT    NOT NULL,
                user_request       TEXT    NOT NULL,
                summary            TEXT,
                result             TEXT,
                completed          INTEGER NOT NULL DEFAULT 0,
                start_time         INTEGER NOT NULL,
                end_time           INTEGER,
                model_name         TEXT,
                current_step_index INTEGER NOT NULL DEFAULT 0,
                steps              TEXT    NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agent_execution_record (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                step_id           TEXT    NOT NULL UNIQUE,
                conversation_id   TEXT,
                agent_name        TEXT    NOT NULL,
                agent_description TEXT,
                agent_request     TEXT,
                result            TEXT,
                error_message     TEXT,
                status            TEXT    NOT NULL,
                start_time        INTEGER NOT NULL,
                end_time          INTEGER,
                max_steps         INTEGER NOT NULL,
                current_step      INTEGER NOT NULL DEFAULT 0,
                model_name        TEXT
            );

            CREATE TABLE IF NOT EXISTS think_act_record (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                parent_execution_id INTEGER NOT NULL
                    REFERENCES agent_execution_record(id) ON DELETE CASCADE,
                think_act_id        TEXT    NOT NULL UNIQUE,
                think_input         TEXT,
                think_output        TEXT,
                error_message       TEXT,
                input_char_count    INTEGER NOT NULL DEFAULT 0,
                output_char_count   INTEGER NOT NULL DEFAULT 0,
                action_needed       INTEGER NOT NULL DEFAULT 0,
                action_result       TEXT,
                think_start_time    INTEGER NOT NULL DEFAULT 0,
                think_end_time      INTEGER NOT NULL DEFAULT 0,
                act_start_time      INTEGER NOT NULL DEFAULT 0,
                act_end_time        INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS act_tool_info (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                think_act_record_id INTEGER
                    REFERENCES think_act_record(id) ON DELETE CASCADE,
                tool_call_id        TEXT    NOT NULL UNIQUE,
                name                TEXT    NOT NULL,
                parameters          TEXT    NOT NULL,
                result              TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_agent_execution_step
            ON agent_execution_record (step_id);

            CREATE INDEX IF NOT EXISTS idx_think_act_parent
            ON think_act_record (parent_execution_id);

            CREATE INDEX IF NOT EXISTS idx_act_tool_call
            ON act_tool_info (tool_call_id);

            CREATE INDEX IF NOT EXISTS idx_plan_root
            ON plan_execution_record (root_plan_id);

            CREATE INDEX IF NOT EXISTS idx_plan_tool_call
            ON plan_execution_record (tool_call_id);",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Bridges a synchronous closure onto the tokio blocking thread pool.
    async fn blocking<F, T>(&self, f: F) -> RecorderResult<T>
    where
        F: FnOnce(&Connection) -> RecorderResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| RecorderError::Lock(e.to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| RecorderError::Task(e.to_string()))?
    }

    /// Records the start of a plan, inserting the plan row and its steps.
    ///
    /// Idempotent on `current_plan_id`: re-recording an existing plan is a
    /// no-op. Steps missing an id get one generated here.
    pub async fn record_plan_start(&self, plan: &Plan) -> RecorderResult<()> {
        let mut plan = plan.clone();
        for step in &mut plan.steps {
            if step.step_id.is_empty() {
                step.step_id = Ids::new_step_id();
            }
        }
        debug!(plan_id = %plan.current_plan_id, steps = plan.steps.len(), "Recording plan start");

        self.blocking(move |conn| {
            let steps_json = serde_json::to_string(&plan.steps)?;
            conn.execute(
                "INSERT OR IGNORE INTO plan_execution_record
                 (current_plan_id, root_plan_id, parent_plan_id, tool_call_id,
                  title, user_request, completed, start_time, model_name,
                  current_step_index, steps)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?9, ?10)",
                params![
                    plan.current_plan_id,
                    plan.root_plan_id,
                    plan.parent_plan_id,
                    plan.tool_call_id,
                    plan.title,
                    plan.user_request,
                    plan.start_time,
                    plan.model_name,
                    plan.current_step_index as i64,
                    steps_json,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Records a step entering `IN_PROGRESS` and advances the plan's
    /// current step index.
    pub async fn record_step_start(&self, step: &Step, plan_id: &str) -> RecorderResult<()> {
        self.update_step(step.clone(), plan_id.to_owned()).await
    }

    /// Records a step reaching a terminal status.
    pub async fn record_step_end(&self, step: &Step, plan_id: &str) -> RecorderResult<()> {
        self.update_step(step.clone(), plan_id.to_owned()).await
    }

    async fn update_step(&self, step: Step, plan_id: String) -> RecorderResult<()> {
        self.blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let steps_json: String = tx
                .query_row(
                    "SELECT steps FROM plan_execution_record WHERE current_plan_id = ?1",
                    params![plan_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| RecorderError::NotFound(format!("plan '{plan_id}'")))?;

            let mut steps: Vec<Step> = serde_json::from_str(&steps_json)?;
            let slot = steps
                .iter_mut()
                .find(|s| s.step_id == step.step_id)
                .ok_or_else(|| {
                    RecorderError::NotFound(format!("step '{}' in plan '{plan_id}'", step.step_id))
                })?;
            let step_index = step.step_index;
            *slot = step;

            tx.execute(
                "UPDATE plan_execution_record
                 SET steps = ?1, current_step_index = ?2
                 WHERE current_plan_id = ?3",
                params![serde_json::to_string(&steps)?, step_index as i64, plan_id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Records the start of an agent execution and returns its database id.
    ///
    /// At most one `RUNNING` record may exist per step: starting over a
    /// running record is a [`RecorderError::Conflict`]; starting over a
    /// terminal record replaces it (re-execution of the step).
    pub async fn record_agent_start(
        &self,
        record: &AgentExecutionRecord,
    ) -> RecorderResult<i64> {
        let record = record.clone();
        self.blocking(move |conn| {
            let existing: Option<(i64, String)> = conn
                .query_row(
                    "SELECT id, status FROM agent_execution_record WHERE step_id = ?1",
                    params![record.step_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            if let Some((id, status)) = existing {
                if ExecutionStatus::parse(&status) == ExecutionStatus::Running {
                    return Err(RecorderError::Conflict(format!(
                        "step '{}' already has a running agent execution",
                        record.step_id
                    )));
                }
                conn.execute(
                    "UPDATE agent_execution_record
                     SET conversation_id = ?1, agent_name = ?2, agent_description = ?3,
                         agent_request = ?4, result = NULL, error_message = NULL,
                         status = ?5, start_time = ?6, end_time = NULL,
                         max_steps = ?7, current_step = 0, model_name = ?8
                     WHERE id = ?9",
                    params![
                        record.conversation_id,
                        record.agent_name,
                        record.agent_description,
                        record.agent_request,
                        ExecutionStatus::Running.as_str(),
                        record.start_time,
                        record.max_steps as i64,
                        record.model_name,
                        id,
                    ],
                )?;
                return Ok(id);
            }

            conn.execute(
                "INSERT INTO agent_execution_record
                 (step_id, conversation_id, agent_name, agent_description,
                  agent_request, status, start_time, max_steps, current_step, model_name)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.step_id,
                    record.conversation_id,
                    record.agent_name,
                    record.agent_description,
                    record.agent_request,
                    ExecutionStatus::Running.as_str(),
                    record.start_time,
                    record.max_steps as i64,
                    record.current_step as i64,
                    record.model_name,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Records the terminal state of an agent execution.
    pub async fn record_agent_end(&self, record: &AgentExecutionRecord) -> RecorderResult<()> {
        let record = record.clone();
        self.blocking(move |conn| {
            let updated = conn.execute(
                "UPDATE agent_execution_record
                 SET result = ?1, error_message = ?2, status = ?3,
                     end_time = ?4, current_step = ?5
                 WHERE id = ?6",
                params![
                    record.result,
                    record.error_message,
                    record.status.as_str(),
                    record.end_time.unwrap_or_else(now_millis),
                    record.current_step as i64,
                    record.id,
                ],
            )?;
            if updated == 0 {
                return Err(RecorderError::NotFound(format!(
                    "agent execution {}",
                    record.id
                )));
            }
            Ok(())
        })
        .await
    }

    /// Records a think-act cycle with its tool-call entries (results null)
    /// and returns the cycle's database id.
    ///
    /// This is the first phase of the two-phase tool write; idempotent on
    /// `think_act_id`.
    pub async fn record_think_act(&self, record: &ThinkActRecord) -> RecorderResult<i64> {
        let record = record.clone();
        self.blocking(move |conn| {
            if let Some(id) = conn
                .query_row(
                    "SELECT id FROM think_act_record WHERE think_act_id = ?1",
                    params![record.think_act_id],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?
            {
                return Ok(id);
            }

            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO think_act_record
                 (parent_execution_id, think_act_id, think_input, think_output,
                  error_message, input_char_count, output_char_count, action_needed,
                  action_result, think_start_time, think_end_time,
                  act_start_time, act_end_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    record.parent_execution_id,
                    record.think_act_id,
                    record.think_input,
                    record.think_output,
                    record.error_message,
                    record.input_char_count as i64,
                    record.output_char_count as i64,
                    i64::from(record.action_needed),
                    record.action_result,
                    record.think_start_time,
                    record.think_end_time,
                    record.act_start_time,
                    record.act_end_time,
                ],
            )?;
            let think_act_id = tx.last_insert_rowid();

            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO act_tool_info
                     (think_act_record_id, tool_call_id, name, parameters)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for info in &record.act_tool_info_list {
                    stmt.execute(params![
                        think_act_id,
                        info.tool_call_id,
                        info.name,
                        info.parameters,
                    ])?;
                }
            }

            tx.commit()?;
            Ok(think_act_id)
        })
        .await
    }

    /// Records the act-phase outcome of a think-act cycle.
    pub async fn record_think_act_result(
        &self,
        think_act_id: i64,
        action_result: &str,
        act_end_time: i64,
    ) -> RecorderResult<()> {
        let action_result = action_result.to_owned();
        self.blocking(move |conn| {
            let updated = conn.execute(
                "UPDATE think_act_record SET action_result = ?1, act_end_time = ?2
                 WHERE id = ?3",
                params![action_result, act_end_time, think_act_id],
            )?;
            if updated == 0 {
                return Err(RecorderError::NotFound(format!(
                    "think-act record {think_act_id}"
                )));
            }
            Ok(())
        })
        .await
    }

    /// Applies post-execution tool results, the second phase of the
    /// two-phase tool write.
    ///
    /// Each entry updates the row found by `tool_call_id`; an entry whose
    /// row does not exist yet is inserted, tolerating out-of-order writes.
    pub async fn record_action_result(&self, results: &[ActToolResult]) -> RecorderResult<()> {
        let results = results.to_vec();
        self.blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            for entry in &results {
                let updated = tx.execute(
                    "UPDATE act_tool_info SET result = ?1 WHERE tool_call_id = ?2",
                    params![entry.result, entry.tool_call_id],
                )?;
                if updated == 0 {
                    tx.execute(
                        "INSERT INTO act_tool_info (tool_call_id, name, parameters, result)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![entry.tool_call_id, entry.name, entry.parameters, entry.result],
                    )?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Marks a plan as completed, storing summary and result.
    pub async fn record_plan_complete(&self, plan: &Plan) -> RecorderResult<()> {
        let plan = plan.clone();
        self.blocking(move |conn| {
            let updated = conn.execute(
                "UPDATE plan_execution_record
                 SET completed = 1, end_time = ?1, summary = ?2, result = ?3, steps = ?4
                 WHERE current_plan_id = ?5",
                params![
                    plan.end_time.unwrap_or_else(now_millis),
                    plan.summary,
                    plan.result,
                    serde_json::to_string(&plan.steps)?,
                    plan.current_plan_id,
                ],
            )?;
            if updated == 0 {
                return Err(RecorderError::NotFound(format!(
                    "plan '{}'",
                    plan.current_plan_id
                )));
            }
            Ok(())
        })
        .await
    }

    /// Loads a plan with its steps.
    pub async fn find_plan(&self, plan_id: &str) -> RecorderResult<Option<Plan>> {
        let plan_id = plan_id.to_owned();
        self.blocking(move |conn| {
            conn.query_row(
                &format!("{PLAN_SELECT} WHERE current_plan_id = ?1"),
                params![plan_id],
                row_to_plan,
            )
            .optional()?
            .transpose()
        })
        .await
    }

    /// Loads every plan of a tree, roots first, ordered by start time.
    pub async fn plans_by_root(&self, root_plan_id: &str) -> RecorderResult<Vec<Plan>> {
        let root_plan_id = root_plan_id.to_owned();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{PLAN_SELECT} WHERE root_plan_id = ?1 ORDER BY start_time ASC, id ASC"
            ))?;
            let plans = stmt
                .query_map(params![root_plan_id], row_to_plan)?
                .collect::<Result<Vec<_>, _>>()?;
            plans.into_iter().collect()
        })
        .await
    }

    /// Finds the tool-call entry with the given id, if recorded.
    pub async fn find_act_tool_by_call_id(
        &self,
        tool_call_id: &str,
    ) -> RecorderResult<Option<ActToolInfo>> {
        let tool_call_id = tool_call_id.to_owned();
        self.blocking(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT tool_call_id, name, parameters, result
                     FROM act_tool_info WHERE tool_call_id = ?1",
                    params![tool_call_id],
                    |row| {
                        Ok(ActToolInfo {
                            tool_call_id: row.get(0)?,
                            name: row.get(1)?,
                            parameters: row.get(2)?,
                            result: row.get(3)?,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    /// Loads the agent execution for a step without its think-act detail.
    pub async fn find_agent_execution(
        &self,
        step_id: &str,
    ) -> RecorderResult<Option<AgentExecutionRecord>> {
        let step_id = step_id.to_owned();
        self.blocking(move |conn| {
            Ok(conn
                .query_row(
                    &format!("{AGENT_SELECT} WHERE step_id = ?1"),
                    params![step_id],
                    row_to_agent,
                )
                .optional()?)
        })
        .await
    }

    /// Loads the full agent execution detail for a step: the record plus
    /// every think-act cycle and its tool-call entries.
    ///
    /// Think-acts and tool infos are fetched with a single join to avoid
    /// N+1 queries.
    pub async fn get_agent_execution_detail(
        &self,
        step_id: &str,
    ) -> RecorderResult<AgentExecutionRecord> {
        let step_id = step_id.to_owned();
        self.blocking(move |conn| {
            let mut record = conn
                .query_row(
                    &format!("{AGENT_SELECT} WHERE step_id = ?1"),
                    params![step_id],
                    row_to_agent,
                )
                .optional()?
                .ok_or_else(|| {
                    RecorderError::NotFound(format!("agent execution for step '{step_id}'"))
                })?;

            let mut stmt = conn.prepare(
                "SELECT ta.id, ta.parent_execution_id, ta.think_act_id, ta.think_input,
                        ta.think_output, ta.error_message, ta.input_char_count,
                        ta.output_char_count, ta.action_needed, ta.action_result,
                        ta.think_start_time, ta.think_end_time, ta.act_start_time,
                        ta.act_end_time,
                        ati.tool_call_id, ati.name, ati.parameters, ati.result
                 FROM think_act_record ta
                 LEFT JOIN act_tool_info ati ON ati.think_act_record_id = ta.id
                 WHERE ta.parent_execution_id = ?1
                 ORDER BY ta.id ASC, ati.id ASC",
            )?;

            let mut cycles: Vec<ThinkActRecord> = Vec::new();
            let mut rows = stmt.query(params![record.id])?;
            while let Some(row) = rows.next()? {
                let cycle_id: i64 = row.get(0)?;
                if cycles.last().is_none_or(|c| c.id != cycle_id) {
                    cycles.push(ThinkActRecord {
                        id: cycle_id,
                        parent_execution_id: row.get(1)?,
                        think_act_id: row.get(2)?,
                        think_input: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                        think_output: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                        error_message: row.get(5)?,
                        input_char_count: usize::try_from(row.get::<_, i64>(6)?).unwrap_or(0),
                        output_char_count: usize::try_from(row.get::<_, i64>(7)?).unwrap_or(0),
                        action_needed: row.get::<_, i64>(8)? != 0,
                        action_result: row.get(9)?,
                        think_start_time: row.get(10)?,
                        think_end_time: row.get(11)?,
                        act_start_time: row.get(12)?,
                        act_end_time: row.get(13)?,
                        act_tool_info_list: Vec::new(),
                    });
                }
                if let Some(tool_call_id) = row.get::<_, Option<String>>(14)?
                    && let Some(cycle) = cycles.last_mut()
                {
                    cycle.act_tool_info_list.push(ActToolInfo {
                        tool_call_id,
                        name: row.get(15)?,
                        parameters: row.get(16)?,
                        result: row.get(17)?,
                    });
                }
            }

            record.think_act_steps = cycles;
            Ok(record)
        })
        .await
    }
}

const PLAN_SELECT: &str = "SELECT current_plan_id, root_plan_id, parent_plan_id, tool_call_id,
        title, user_request, summary, result, completed, start_time, end_time,
        model_name, current_step_index, steps
 FROM plan_execution_record";

fn row_to_plan(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecorderResult<Plan>> {
    let steps_json: String = row.get(13)?;
    let plan = Plan {
        current_plan_id: row.get(0)?,
        root_plan_id: row.get(1)?,
        parent_plan_id: row.get(2)?,
        tool_call_id: row.get(3)?,
        title: row.get(4)?,
        user_request: row.get(5)?,
        summary: row.get(6)?,
        result: row.get(7)?,
        completed: row.get::<_, i64>(8)? != 0,
        start_time: row.get(9)?,
        end_time: row.get(10)?,
        model_name: row.get(11)?,
        current_step_index: usize::try_from(row.get::<_, i64>(12)?).unwrap_or(0),
        steps: Vec::new(),
    };
    Ok(serde_json::from_str(&steps_json)
        .map_err(RecorderError::from)
        .map(|steps| Plan { steps, ..plan }))
}

const AGENT_SELECT: &str = "SELECT id, step_id, conversation_id, agent_name, agent_description,
        agent_request, result, error_message, status, start_time, end_time,
        max_steps, current_step, model_name
 FROM agent_execution_record";

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentExecutionRecord> {
    Ok(AgentExecutionRecord {
        id: row.get(0)?,
        step_id: row.get(1)?,
        conversation_id: row.get(2)?,
        agent_name: row.get(3)?,
        agent_description: row.get(4)?,
        agent_request: row.get(5)?,
        result: row.get(6)?,
        error_message: row.get(7)?,
        status: ExecutionStatus::parse(&row.get::<_, String>(8)?),
        start_time: row.get(9)?,
        end_time: row.get(10)?,
        max_steps: usize::try_from(row.get::<_, i64>(11)?).unwrap_or(0),
        current_step: usize::try_from(row.get::<_, i64>(12)?).unwrap_or(0),
        model_name: row.get(13)?,
        think_act_steps: Vec::new(),
    })
}
