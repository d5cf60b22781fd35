#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

//! SQLite-backed registry store and schema importer for the RelayCRM
//! update runner.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use relaycrm_update_core::{
    format_rfc3339, FieldSpec, UpdateLogger, VersionMarker,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

const BASE_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS crm_modules (
  tabid INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  presence INTEGER NOT NULL DEFAULT 0,
  customized INTEGER NOT NULL DEFAULT 0,
  isentitytype INTEGER NOT NULL DEFAULT 1,
  trackmodifiedinfo INTEGER NOT NULL DEFAULT 0 CHECK (trackmodifiedinfo IN (0, 1))
);

CREATE TABLE IF NOT EXISTS crm_blocks (
  blockid INTEGER PRIMARY KEY AUTOINCREMENT,
  tabid INTEGER NOT NULL,
  blocklabel TEXT NOT NULL,
  sequence INTEGER NOT NULL DEFAULT 0,
  showtitle INTEGER NOT NULL DEFAULT 1,
  visible INTEGER NOT NULL DEFAULT 1,
  icon TEXT,
  FOREIGN KEY (tabid) REFERENCES crm_modules(tabid)
);

CREATE TABLE IF NOT EXISTS crm_fields (
  fieldid INTEGER PRIMARY KEY AUTOINCREMENT,
  tabid INTEGER NOT NULL,
  block INTEGER NOT NULL,
  columnname TEXT NOT NULL,
  tablename TEXT NOT NULL,
  fieldname TEXT NOT NULL,
  fieldlabel TEXT NOT NULL,
  uitype INTEGER NOT NULL,
  typeofdata TEXT NOT NULL,
  displaytype INTEGER NOT NULL DEFAULT 1,
  presence INTEGER NOT NULL DEFAULT 2,
  quickcreate INTEGER NOT NULL DEFAULT 1,
  masseditable INTEGER NOT NULL DEFAULT 1,
  summaryfield INTEGER NOT NULL DEFAULT 0,
  sequence INTEGER NOT NULL DEFAULT 0,
  maximumlength TEXT,
  defaultvalue TEXT,
  fieldparams TEXT,
  FOREIGN KEY (tabid) REFERENCES crm_modules(tabid),
  FOREIGN KEY (block) REFERENCES crm_blocks(blockid)
);

CREATE TABLE IF NOT EXISTS crm_fieldmodulerel (
  fieldid INTEGER NOT NULL,
  module TEXT NOT NULL,
  relmodule TEXT NOT NULL,
  sequence INTEGER NOT NULL DEFAULT 0,
  FOREIGN KEY (fieldid) REFERENCES crm_fields(fieldid)
);

CREATE TABLE IF NOT EXISTS crm_picklist_values (
  valueid INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  value TEXT NOT NULL,
  sortorderid INTEGER NOT NULL DEFAULT 0,
  presence INTEGER NOT NULL DEFAULT 1,
  close_state INTEGER NOT NULL DEFAULT 0 CHECK (close_state IN (0, 1)),
  UNIQUE (name, value)
);

CREATE TABLE IF NOT EXISTS crm_relatedlists (
  relation_id INTEGER PRIMARY KEY AUTOINCREMENT,
  tabid INTEGER NOT NULL,
  related_tabid INTEGER NOT NULL,
  name TEXT NOT NULL,
  label TEXT NOT NULL,
  sequence INTEGER NOT NULL DEFAULT 0,
  presence INTEGER NOT NULL DEFAULT 0,
  actions TEXT NOT NULL DEFAULT '',
  favorites INTEGER NOT NULL DEFAULT 0,
  view_type TEXT NOT NULL DEFAULT 'RelatedTab'
);

CREATE TABLE IF NOT EXISTS crm_profiles (
  profileid INTEGER PRIMARY KEY AUTOINCREMENT,
  profilename TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS crm_actionmapping (
  actionid INTEGER PRIMARY KEY AUTOINCREMENT,
  actionname TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS crm_profile2utility (
  profileid INTEGER NOT NULL,
  tabid INTEGER NOT NULL,
  activityid INTEGER NOT NULL,
  permission INTEGER NOT NULL DEFAULT 1 CHECK (permission IN (0, 1)),
  UNIQUE (profileid, tabid, activityid),
  FOREIGN KEY (profileid) REFERENCES crm_profiles(profileid),
  FOREIGN KEY (tabid) REFERENCES crm_modules(tabid),
  FOREIGN KEY (activityid) REFERENCES crm_actionmapping(actionid)
);

CREATE TABLE IF NOT EXISTS crm_eventhandlers (
  eventhandler_id INTEGER PRIMARY KEY AUTOINCREMENT,
  event_name TEXT NOT NULL,
  handler_class TEXT NOT NULL,
  is_active INTEGER NOT NULL DEFAULT 1 CHECK (is_active IN (0, 1)),
  include_modules TEXT NOT NULL DEFAULT '',
  exclude_modules TEXT NOT NULL DEFAULT '',
  priority INTEGER NOT NULL DEFAULT 5,
  UNIQUE (event_name, handler_class)
);

CREATE TABLE IF NOT EXISTS crm_links (
  linkid INTEGER PRIMARY KEY AUTOINCREMENT,
  tabid INTEGER NOT NULL,
  linktype TEXT NOT NULL,
  linklabel TEXT NOT NULL,
  linkurl TEXT NOT NULL,
  linkicon TEXT,
  sequence INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS crm_workflow_tasktypes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  tasktypename TEXT NOT NULL UNIQUE,
  label TEXT NOT NULL,
  classname TEXT NOT NULL,
  classpath TEXT NOT NULL,
  templatepath TEXT NOT NULL,
  modules TEXT NOT NULL DEFAULT '{}',
  sourcemodule TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS crm_picklist_dependency_map (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  tabid INTEGER NOT NULL,
  source_field TEXT NOT NULL,
  second_field TEXT NOT NULL,
  third_field TEXT,
  UNIQUE (tabid, source_field, second_field)
);

CREATE TABLE IF NOT EXISTS crm_picklist_dependency_data (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  map_id INTEGER NOT NULL,
  source_value TEXT NOT NULL,
  second_value TEXT NOT NULL,
  third_value TEXT,
  FOREIGN KEY (map_id) REFERENCES crm_picklist_dependency_map(id)
);

CREATE TABLE IF NOT EXISTS crm_batch_methods (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  method TEXT NOT NULL,
  params TEXT NOT NULL DEFAULT '[]',
  status INTEGER NOT NULL DEFAULT 0,
  created_time TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS crm_cache (
  cache_key TEXT PRIMARY KEY,
  cache_value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS crm_version (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  current_version TEXT NOT NULL,
  last_update TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS crm_updates (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL UNIQUE,
  actor TEXT NOT NULL,
  label TEXT NOT NULL,
  from_version TEXT NOT NULL,
  to_version TEXT NOT NULL,
  result INTEGER NOT NULL CHECK (result IN (0, 1)),
  time TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS crm_schema_constraints (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  table_name TEXT NOT NULL,
  constraint_name TEXT NOT NULL,
  constraint_sql TEXT NOT NULL DEFAULT '',
  UNIQUE (table_name, constraint_name)
);
";

/// Registry-side relation between two modules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationSpec {
    pub module: String,
    pub related_module: String,
    pub name: String,
    pub label: String,
    pub actions: Vec<String>,
    pub view_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionMappingKind {
    Add,
    Remove,
}

/// One utility action change: `Add` grants the action to every profile
/// for the named modules, `Remove` retires the action id together with
/// all of its grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionMapping {
    pub name: String,
    pub kind: ActionMappingKind,
    pub modules: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerSpec {
    pub event_name: String,
    pub handler_class: String,
    pub is_active: bool,
    pub include_modules: String,
    pub exclude_modules: String,
    pub priority: i64,
}

/// Insert seed: `rows` are positional against `columns`; rows already
/// present (matched on every column) are skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedInsert {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeedUpdate {
    pub table: String,
    pub set: Vec<(String, Value)>,
    pub filter: Vec<(String, Value)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeedDelete {
    pub table: String,
    pub filter: Vec<(String, Value)>,
}

pub struct SqliteCrmStore {
    conn: Connection,
}

impl SqliteCrmStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Applies the idempotent registry schema; safe to call on every run.
    pub fn ensure_base_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(BASE_SCHEMA)
            .context("failed to apply registry base schema")
    }

    pub fn module_id(&self, name: &str) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT tabid FROM crm_modules WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to look up module {name}"))
    }

    /// Registers a module; logs and skips when it is already present.
    pub fn install_module(&self, logger: &mut UpdateLogger, name: &str) -> Result<i64> {
        if let Some(tabid) = self.module_id(name)? {
            logger.info(&format!("Module exist: {name}"))?;
            return Ok(tabid);
        }
        self.conn
            .execute(
                "INSERT INTO crm_modules(name, presence, customized, isentitytype)
                 VALUES (?1, 0, 0, 1)",
                params![name],
            )
            .with_context(|| format!("failed to register module {name}"))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Removes a module and its registry rows; logs and skips when absent.
    pub fn remove_module(&self, logger: &mut UpdateLogger, name: &str) -> Result<()> {
        let Some(tabid) = self.module_id(name)? else {
            logger.info(&format!("Module not exists: {name}"))?;
            return Ok(());
        };

        self.conn.execute(
            "DELETE FROM crm_fieldmodulerel
             WHERE fieldid IN (SELECT fieldid FROM crm_fields WHERE tabid = ?1)
                OR relmodule = ?2",
            params![tabid, name],
        )?;
        self.conn
            .execute("DELETE FROM crm_fields WHERE tabid = ?1", params![tabid])?;
        self.conn
            .execute("DELETE FROM crm_blocks WHERE tabid = ?1", params![tabid])?;
        self.conn.execute(
            "DELETE FROM crm_relatedlists WHERE tabid = ?1 OR related_tabid = ?1",
            params![tabid],
        )?;
        self.conn.execute(
            "DELETE FROM crm_profile2utility WHERE tabid = ?1",
            params![tabid],
        )?;
        self.conn
            .execute("DELETE FROM crm_links WHERE tabid = ?1", params![tabid])?;
        self.conn
            .execute("DELETE FROM crm_modules WHERE tabid = ?1", params![tabid])?;
        Ok(())
    }

    pub fn enable_tracking(&self, module: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE crm_modules SET trackmodifiedinfo = 1 WHERE name = ?1",
                params![module],
            )
            .with_context(|| format!("failed to enable change tracking for {module}"))?;
        Ok(())
    }

    pub fn field_exists(&self, tabid: i64, field_name: &str, table_name: &str) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM crm_fields
                 WHERE tabid = ?1 AND fieldname = ?2 AND tablename = ?3
                 LIMIT 1",
                params![tabid, field_name, table_name],
                |_| Ok(()),
            )
            .optional()
            .context("failed to query crm_fields")?
            .is_some();
        Ok(found)
    }

    /// Creates new fields end to end: registry row, physical column,
    /// picklist values, and reference targets. Per field, an existing
    /// definition or a missing module is logged and skipped so the batch
    /// stays idempotent; any other failure propagates.
    pub fn add_fields(&self, logger: &mut UpdateLogger, specs: &[FieldSpec]) -> Result<usize> {
        let mut created = 0;
        for spec in specs {
            spec.validate()?;
            let Some(tabid) = self.module_id(&spec.module)? else {
                logger.error(&format!("Module not exists: {}", spec.module))?;
                continue;
            };
            if self.field_exists(tabid, &spec.name, &spec.table)? {
                logger.info(&format!(
                    "Skip adding field. Module: {}, field name: {}",
                    spec.module, spec.name
                ))?;
                continue;
            }

            let blockid = self.resolve_block(tabid, spec)?;
            let sequence: i64 = self.conn.query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM crm_fields WHERE block = ?1",
                params![blockid],
                |row| row.get(0),
            )?;
            self.conn
                .execute(
                    "INSERT INTO crm_fields(
                       tabid, block, columnname, tablename, fieldname, fieldlabel,
                       uitype, typeofdata, displaytype, presence, quickcreate,
                       masseditable, summaryfield, sequence, maximumlength,
                       defaultvalue, fieldparams)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                    params![
                        tabid,
                        blockid,
                        spec.column,
                        spec.table,
                        spec.name,
                        spec.label,
                        i64::from(spec.uitype),
                        spec.type_of_data,
                        spec.display_type,
                        spec.presence,
                        spec.quick_create,
                        spec.mass_editable,
                        spec.summary_field,
                        sequence,
                        spec.maximum_length,
                        spec.default_value,
                        spec.field_params,
                    ],
                )
                .with_context(|| format!("failed to register field {}", spec.name))?;
            let fieldid = self.conn.last_insert_rowid();

            self.ensure_physical_column(spec)?;

            if spec.is_picklist() {
                self.add_picklist_values(
                    &spec.name,
                    &spec
                        .picklist_values
                        .iter()
                        .map(String::as_str)
                        .collect::<Vec<_>>(),
                )?;
            }
            if spec.is_reference() {
                for related in &spec.related_modules {
                    self.conn.execute(
                        "INSERT INTO crm_fieldmodulerel(fieldid, module, relmodule)
                         SELECT ?1, ?2, ?3
                         WHERE NOT EXISTS (
                           SELECT 1 FROM crm_fieldmodulerel
                           WHERE fieldid = ?1 AND relmodule = ?3)",
                        params![fieldid, spec.module, related],
                    )?;
                }
            }
            created += 1;
        }
        Ok(created)
    }

    fn resolve_block(&self, tabid: i64, spec: &FieldSpec) -> Result<i64> {
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT blockid FROM crm_blocks WHERE tabid = ?1 AND blocklabel = ?2",
                params![tabid, spec.block_label],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(blockid) = existing {
            return Ok(blockid);
        }

        let Some(block) = &spec.block else {
            return Err(anyhow!(
                "block '{}' not found for module {} and no block definition supplied",
                spec.block_label,
                spec.module
            ));
        };
        self.conn.execute(
            "INSERT INTO crm_blocks(tabid, blocklabel, sequence, showtitle, visible, icon)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                tabid,
                block.label,
                block.sequence,
                i64::from(block.show_title),
                i64::from(block.visible),
                block.icon,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn ensure_physical_column(&self, spec: &FieldSpec) -> Result<()> {
        if !table_exists(&self.conn, &spec.table)? {
            return Err(anyhow!(
                "entity table {} does not exist; schema import must run before field creation",
                spec.table
            ));
        }
        if column_exists(&self.conn, &spec.table, &spec.column)? {
            return Ok(());
        }
        self.conn
            .execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                spec.table,
                spec.column,
                spec.column_type.as_sql()
            ))
            .with_context(|| {
                format!("failed to add column {}.{}", spec.table, spec.column)
            })?;
        Ok(())
    }

    pub fn picklist_values(&self, name: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT value FROM crm_picklist_values WHERE name = ?1 ORDER BY sortorderid, valueid",
        )?;
        let mut rows = stmt.query(params![name])?;
        let mut values = Vec::new();
        while let Some(row) = rows.next()? {
            values.push(row.get(0)?);
        }
        Ok(values)
    }

    pub fn add_picklist_values(&self, name: &str, values: &[&str]) -> Result<usize> {
        let mut added = 0;
        for value in values {
            let sortorderid: i64 = self.conn.query_row(
                "SELECT COALESCE(MAX(sortorderid), 0) + 1 FROM crm_picklist_values WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )?;
            added += self.conn.execute(
                "INSERT OR IGNORE INTO crm_picklist_values(name, value, sortorderid)
                 VALUES (?1, ?2, ?3)",
                params![name, value, sortorderid],
            )?;
        }
        Ok(added)
    }

    pub fn set_close_state(&self, name: &str, value: &str, close: bool) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE crm_picklist_values SET close_state = ?3 WHERE name = ?1 AND value = ?2",
            params![name, value, i64::from(close)],
        )?;
        if changed == 0 {
            return Err(anyhow!("picklist {name} has no value {value}"));
        }
        Ok(())
    }

    /// Adds or refreshes module relations; a missing endpoint module is
    /// logged and skipped.
    pub fn set_relations(
        &self,
        logger: &mut UpdateLogger,
        relations: &[RelationSpec],
    ) -> Result<()> {
        for relation in relations {
            let (Some(tabid), Some(related_tabid)) = (
                self.module_id(&relation.module)?,
                self.module_id(&relation.related_module)?,
            ) else {
                logger.info(&format!(
                    "Skip relation {}: module {} or {} not available",
                    relation.name, relation.module, relation.related_module
                ))?;
                continue;
            };
            let actions = relation.actions.join(",");

            let existing: Option<i64> = self
                .conn
                .query_row(
                    "SELECT relation_id FROM crm_relatedlists
                     WHERE tabid = ?1 AND related_tabid = ?2 AND name = ?3",
                    params![tabid, related_tabid, relation.name],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(relation_id) = existing {
                self.conn.execute(
                    "UPDATE crm_relatedlists
                     SET label = ?2, actions = ?3, view_type = ?4
                     WHERE relation_id = ?1",
                    params![relation_id, relation.label, actions, relation.view_type],
                )?;
                continue;
            }

            let sequence: i64 = self.conn.query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM crm_relatedlists WHERE tabid = ?1",
                params![tabid],
                |row| row.get(0),
            )?;
            self.conn.execute(
                "INSERT INTO crm_relatedlists(
                   tabid, related_tabid, name, label, sequence, actions, view_type)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    tabid,
                    related_tabid,
                    relation.name,
                    relation.label,
                    sequence,
                    actions,
                    relation.view_type,
                ],
            )?;
        }
        Ok(())
    }

    /// Applies action mapping changes. Adds grant the action to every
    /// profile for the mapping's modules, leaving existing grants
    /// untouched; removals delete the action id and all of its grants.
    pub fn apply_action_mappings(
        &self,
        logger: &mut UpdateLogger,
        mappings: &[ActionMapping],
    ) -> Result<()> {
        let mut profiles: Vec<i64> = Vec::new();
        {
            let mut stmt = self.conn.prepare("SELECT profileid FROM crm_profiles")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                profiles.push(row.get(0)?);
            }
        }

        for mapping in mappings {
            match mapping.kind {
                ActionMappingKind::Add => {
                    self.conn.execute(
                        "INSERT OR IGNORE INTO crm_actionmapping(actionname) VALUES (?1)",
                        params![mapping.name],
                    )?;
                    let actionid: i64 = self.conn.query_row(
                        "SELECT actionid FROM crm_actionmapping WHERE actionname = ?1",
                        params![mapping.name],
                        |row| row.get(0),
                    )?;

                    for module in &mapping.modules {
                        let Some(tabid) = self.module_id(module)? else {
                            logger.info(&format!(
                                "Skip action {} grant: module not available: {module}",
                                mapping.name
                            ))?;
                            continue;
                        };
                        for profileid in &profiles {
                            self.conn.execute(
                                "INSERT OR IGNORE INTO crm_profile2utility(profileid, tabid, activityid, permission)
                                 VALUES (?1, ?2, ?3, 1)",
                                params![profileid, tabid, actionid],
                            )?;
                        }
                    }
                }
                ActionMappingKind::Remove => {
                    let existing: Option<i64> = self
                        .conn
                        .query_row(
                            "SELECT actionid FROM crm_actionmapping WHERE actionname = ?1",
                            params![mapping.name],
                            |row| row.get(0),
                        )
                        .optional()?;
                    let Some(actionid) = existing else {
                        logger.info(&format!("Action already absent: {}", mapping.name))?;
                        continue;
                    };
                    self.conn.execute(
                        "DELETE FROM crm_profile2utility WHERE activityid = ?1",
                        params![actionid],
                    )?;
                    self.conn.execute(
                        "DELETE FROM crm_actionmapping WHERE actionid = ?1",
                        params![actionid],
                    )?;
                }
            }
        }
        Ok(())
    }

    pub fn register_handler(&self, handler: &HandlerSpec) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO crm_eventhandlers(
                   event_name, handler_class, is_active, include_modules,
                   exclude_modules, priority)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    handler.event_name,
                    handler.handler_class,
                    i64::from(handler.is_active),
                    handler.include_modules,
                    handler.exclude_modules,
                    handler.priority,
                ],
            )
            .with_context(|| format!("failed to register handler {}", handler.handler_class))?;
        Ok(())
    }

    /// Inserts seed rows that are not already present; a row matches when
    /// every seeded column compares equal (NULL-aware).
    pub fn batch_insert(&self, seed: &SeedInsert) -> Result<usize> {
        let mut inserted = 0;
        for row in &seed.rows {
            if row.len() != seed.columns.len() {
                return Err(anyhow!(
                    "seed row for {} has {} values but {} columns",
                    seed.table,
                    row.len(),
                    seed.columns.len()
                ));
            }
            let (clause, values) = build_conditions(
                &seed
                    .columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect::<Vec<_>>(),
            );
            let exists = self
                .conn
                .query_row(
                    &format!("SELECT 1 FROM {} WHERE {clause} LIMIT 1", seed.table),
                    params_from_iter(values.iter()),
                    |_| Ok(()),
                )
                .optional()
                .with_context(|| format!("failed to probe seed row in {}", seed.table))?
                .is_some();
            if exists {
                continue;
            }

            let placeholders = (1..=row.len())
                .map(|idx| format!("?{idx}"))
                .collect::<Vec<_>>()
                .join(", ");
            self.conn
                .execute(
                    &format!(
                        "INSERT INTO {}({}) VALUES ({placeholders})",
                        seed.table,
                        seed.columns.join(", ")
                    ),
                    params_from_iter(row.iter().map(json_to_sql)),
                )
                .with_context(|| format!("failed to insert seed row into {}", seed.table))?;
            inserted += 1;
        }
        Ok(inserted)
    }

    pub fn batch_update(&self, seed: &SeedUpdate) -> Result<usize> {
        let mut assignments = Vec::with_capacity(seed.set.len());
        let mut values: Vec<rusqlite::types::Value> = Vec::new();
        for (column, value) in &seed.set {
            values.push(json_to_sql(value));
            assignments.push(format!("{column} = ?{}", values.len()));
        }

        let mut conditions = Vec::with_capacity(seed.filter.len());
        for (column, value) in &seed.filter {
            if value.is_null() {
                conditions.push(format!("{column} IS NULL"));
            } else {
                values.push(json_to_sql(value));
                conditions.push(format!("{column} = ?{}", values.len()));
            }
        }

        let mut sql = format!("UPDATE {} SET {}", seed.table, assignments.join(", "));
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        let changed = self
            .conn
            .execute(&sql, params_from_iter(values.iter()))
            .with_context(|| format!("failed to update seed rows in {}", seed.table))?;
        Ok(changed)
    }

    pub fn batch_delete(&self, seed: &SeedDelete) -> Result<usize> {
        let (clause, values) = build_conditions(&seed.filter);
        let deleted = self
            .conn
            .execute(
                &format!("DELETE FROM {} WHERE {clause}", seed.table),
                params_from_iter(values.iter()),
            )
            .with_context(|| format!("failed to delete seed rows from {}", seed.table))?;
        Ok(deleted)
    }

    /// Converts legacy picklist dependency rows into the map/data layout.
    ///
    /// Conversion is grouped by module; a fault in one module (typically a
    /// malformed target-value payload) is logged and the remaining modules
    /// still convert. The legacy table is dropped only when every module
    /// converted cleanly, so a corrected re-run still has its source rows.
    pub fn rebuild_picklist_dependencies(&self, logger: &mut UpdateLogger) -> Result<usize> {
        if !table_exists(&self.conn, "crm_picklist_dependency")? {
            logger.info("Skip picklist dependency conversion: no legacy table")?;
            return Ok(0);
        }

        let mut tabids = Vec::new();
        {
            let mut stmt = self
                .conn
                .prepare("SELECT DISTINCT tabid FROM crm_picklist_dependency ORDER BY tabid")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                tabids.push(row.get::<_, i64>(0)?);
            }
        }

        let mut converted = 0;
        let mut faulted = false;
        for tabid in tabids {
            match self.convert_dependency_module(tabid) {
                Ok(()) => converted += 1,
                Err(err) => {
                    faulted = true;
                    logger.log(&format!("  [ERROR]: {err:?}"))?;
                }
            }
        }

        if faulted {
            logger.info("Legacy picklist dependency table kept for retry")?;
        } else {
            self.conn
                .execute_batch("DROP TABLE crm_picklist_dependency")
                .context("failed to drop legacy picklist dependency table")?;
        }
        Ok(converted)
    }

    fn convert_dependency_module(&self, tabid: i64) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "SELECT sourcefield, targetfield, sourcevalue, targetvalues
             FROM crm_picklist_dependency WHERE tabid = ?1 ORDER BY id",
        )?;
        let mut rows = stmt.query(params![tabid])?;

        while let Some(row) = rows.next()? {
            let source_field: String = row.get(0)?;
            let target_field: String = row.get(1)?;
            let source_value: String = row.get(2)?;
            let raw_targets: String = row.get(3)?;

            let targets: Vec<String> = serde_json::from_str(&raw_targets).with_context(|| {
                format!("malformed target values for module {tabid} field {source_field}")
            })?;

            self.conn.execute(
                "INSERT OR IGNORE INTO crm_picklist_dependency_map(tabid, source_field, second_field)
                 VALUES (?1, ?2, ?3)",
                params![tabid, source_field, target_field],
            )?;
            let map_id: i64 = self.conn.query_row(
                "SELECT id FROM crm_picklist_dependency_map
                 WHERE tabid = ?1 AND source_field = ?2 AND second_field = ?3",
                params![tabid, source_field, target_field],
                |row| row.get(0),
            )?;
            for target in targets {
                self.conn.execute(
                    "INSERT INTO crm_picklist_dependency_data(map_id, source_value, second_value)
                     SELECT ?1, ?2, ?3
                     WHERE NOT EXISTS (
                       SELECT 1 FROM crm_picklist_dependency_data
                       WHERE map_id = ?1 AND source_value = ?2 AND second_value = ?3)",
                    params![map_id, source_value, target],
                )?;
            }
        }
        Ok(())
    }

    /// Queues a deferred maintenance method unless an identical pending
    /// entry already exists.
    pub fn queue_batch_method(&self, method: &str, method_params: &Value) -> Result<bool> {
        let serialized = serde_json::to_string(method_params)
            .context("failed to serialize batch method params")?;
        let pending = self
            .conn
            .query_row(
                "SELECT 1 FROM crm_batch_methods
                 WHERE method = ?1 AND params = ?2 AND status = 0
                 LIMIT 1",
                params![method, serialized],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if pending {
            return Ok(false);
        }

        let now = format_rfc3339(relaycrm_update_core::now_utc())
            .map_err(|err| anyhow!(err.to_string()))?;
        self.conn.execute(
            "INSERT INTO crm_batch_methods(method, params, status, created_time)
             VALUES (?1, ?2, 0, ?3)",
            params![method, serialized, now],
        )?;
        Ok(true)
    }

    pub fn update_workflow_task_modules(&self, tasktype: &str, modules: &Value) -> Result<()> {
        let serialized =
            serde_json::to_string(modules).context("failed to serialize task type modules")?;
        self.conn.execute(
            "UPDATE crm_workflow_tasktypes SET modules = ?2 WHERE tasktypename = ?1",
            params![tasktype, serialized],
        )?;
        Ok(())
    }

    pub fn insert_version_marker(&self, marker: &VersionMarker) -> Result<()> {
        let time = format_rfc3339(marker.time).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO crm_updates(run_id, actor, label, from_version, to_version, result, time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    marker.run_id.to_string(),
                    marker.actor,
                    marker.label,
                    marker.from_version,
                    marker.to_version,
                    i64::from(marker.result),
                    time,
                ],
            )
            .context("failed to insert version marker")?;
        Ok(())
    }

    pub fn version_history(&self) -> Result<Vec<VersionMarker>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, actor, label, from_version, to_version, result, time
             FROM crm_updates ORDER BY id",
        )?;
        let mut rows = stmt.query([])?;
        let mut markers = Vec::new();
        while let Some(row) = rows.next()? {
            let run_id: String = row.get(0)?;
            let result: i64 = row.get(5)?;
            let time: String = row.get(6)?;
            markers.push(VersionMarker {
                run_id: Ulid::from_string(&run_id)
                    .map_err(|err| anyhow!("corrupt run id {run_id}: {err}"))?,
                actor: row.get(1)?,
                label: row.get(2)?,
                from_version: row.get(3)?,
                to_version: row.get(4)?,
                result: result != 0,
                time: relaycrm_update_core::parse_rfc3339_utc(&time)
                    .map_err(|err| anyhow!(err.to_string()))?,
            });
        }
        Ok(markers)
    }

    pub fn current_version(&self) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT current_version FROM crm_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read current version")
    }

    pub fn set_current_version(&self, version: &str, at: OffsetDateTime) -> Result<()> {
        let last_update = format_rfc3339(at).map_err(|err| anyhow!(err.to_string()))?;
        self.conn.execute(
            "INSERT INTO crm_version(id, current_version, last_update)
             VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET current_version = ?1, last_update = ?2",
            params![version, last_update],
        )?;
        Ok(())
    }

    /// Existence probe for tables that only older installs carry.
    pub fn table_present(&self, name: &str) -> Result<bool> {
        table_exists(&self.conn, name)
    }

    pub fn clear_cache_table(&self) -> Result<usize> {
        self.conn
            .execute("DELETE FROM crm_cache", [])
            .context("failed to clear cache table")
    }
}

/// Applies an upgrade package's SQL files and tracks its own cumulative
/// log, kept separate from the run log until flushed.
pub struct SchemaImporter {
    scheme_files: Vec<PathBuf>,
    data_files: Vec<PathBuf>,
    log: String,
    flushed: usize,
}

impl Default for SchemaImporter {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaImporter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            scheme_files: Vec::new(),
            data_files: Vec::new(),
            log: String::new(),
            flushed: 0,
        }
    }

    /// Collects `dbscheme/*.sql` and `data/*.sql` from the package
    /// directory, each set sorted by file name. Missing directories leave
    /// the corresponding set empty.
    pub fn load_files(&mut self, package_dir: &Path) -> Result<()> {
        self.scheme_files = sql_files(&package_dir.join("dbscheme"))?;
        self.data_files = sql_files(&package_dir.join("data"))?;
        self.record(&format!(
            "Loaded {} schema files, {} data files",
            self.scheme_files.len(),
            self.data_files.len()
        ));
        Ok(())
    }

    #[must_use]
    pub fn scheme_files(&self) -> &[PathBuf] {
        &self.scheme_files
    }

    #[must_use]
    pub fn data_files(&self) -> &[PathBuf] {
        &self.data_files
    }

    /// Runs the engine integrity and foreign key checks. In strict mode a
    /// violation is recorded with the `Error` prefix the failure gate
    /// reacts to; otherwise violations are recorded as plain notes.
    pub fn check_integrity(&mut self, conn: &Connection, strict: bool) -> Result<usize> {
        let verdict: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .context("failed to run quick_check")?;
        let mut violations = 0;
        if verdict != "ok" {
            violations += 1;
            if strict {
                self.record(&format!("Error: integrity check failed: {verdict}"));
            } else {
                self.record(&format!("integrity note (pre-import): {verdict}"));
            }
        }

        let mut stmt = conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to run foreign_key_check")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let table: String = row.get(0)?;
            let target: String = row.get(2)?;
            violations += 1;
            if strict {
                self.record(&format!(
                    "Error: foreign key violation: {table} references missing {target}"
                ));
            } else {
                self.record(&format!(
                    "foreign key note (pre-import): {table} references missing {target}"
                ));
            }
        }

        if violations == 0 {
            self.record("Integrity check: ok");
        }
        Ok(violations)
    }

    pub fn drop_indexes(&mut self, conn: &Connection, indexes: &[(&str, &str)]) -> Result<()> {
        for (table, index) in indexes {
            if index_exists(conn, index)? {
                conn.execute_batch(&format!("DROP INDEX {index}"))
                    .with_context(|| format!("failed to drop index {index} on {table}"))?;
                self.record(&format!("Dropped index {index} on {table}"));
            } else {
                self.record(&format!("Index {index} on {table} already absent"));
            }
        }
        Ok(())
    }

    pub fn drop_columns(&mut self, conn: &Connection, columns: &[(&str, &str)]) -> Result<()> {
        for (table, column) in columns {
            if !table_exists(conn, table)? || !column_exists(conn, table, column)? {
                self.record(&format!("Column {table}.{column} already absent"));
                continue;
            }
            conn.execute_batch(&format!("ALTER TABLE {table} DROP COLUMN {column}"))
                .with_context(|| format!("failed to drop column {table}.{column}"))?;
            self.record(&format!("Dropped column {table}.{column}"));
        }
        Ok(())
    }

    pub fn drop_tables(&mut self, conn: &Connection, tables: &[&str]) -> Result<()> {
        for table in tables {
            if table_exists(conn, table)? {
                conn.execute_batch(&format!("DROP TABLE {table}"))
                    .with_context(|| format!("failed to drop table {table}"))?;
                self.record(&format!("Dropped table {table}"));
            } else {
                self.record(&format!("Table {table} already absent"));
            }
        }
        Ok(())
    }

    /// Retires named constraints from the constraint registry; the engine
    /// itself cannot drop a foreign key in place, so enforcement follows
    /// the registry.
    pub fn drop_foreign_keys(
        &mut self,
        conn: &Connection,
        constraints: &[(&str, &str)],
    ) -> Result<()> {
        for (table, constraint) in constraints {
            let removed = conn.execute(
                "DELETE FROM crm_schema_constraints
                 WHERE table_name = ?1 AND constraint_name = ?2",
                params![table, constraint],
            )?;
            if removed > 0 {
                self.record(&format!("Dropped foreign key {constraint} on {table}"));
            } else {
                self.record(&format!("Foreign key {constraint} on {table} already absent"));
            }
        }
        Ok(())
    }

    /// Applies every loaded schema file. A failing file is recorded with
    /// the `Error` prefix and the remaining files still run; the failure
    /// gate decides the run outcome afterwards.
    pub fn update_scheme(&mut self, conn: &Connection) -> Result<()> {
        let files = std::mem::take(&mut self.scheme_files);
        self.apply_sql_files(conn, &files)?;
        self.scheme_files = files;
        Ok(())
    }

    pub fn import_data(&mut self, conn: &Connection) -> Result<()> {
        let files = std::mem::take(&mut self.data_files);
        self.apply_sql_files(conn, &files)?;
        self.data_files = files;
        Ok(())
    }

    fn apply_sql_files(&mut self, conn: &Connection, files: &[PathBuf]) -> Result<()> {
        for file in files {
            let body = std::fs::read_to_string(file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            match conn.execute_batch(&body) {
                Ok(()) => self.record(&format!("Applied {}", display_name(file))),
                Err(err) => {
                    self.record(&format!("Error: {}: {err}", display_name(file)));
                }
            }
        }
        Ok(())
    }

    /// Drops cached prepared statements and re-reads the schema cookie so
    /// later statements see the imported schema.
    pub fn refresh_schema(&mut self, conn: &Connection) -> Result<()> {
        conn.flush_prepared_statement_cache();
        let cookie: i64 = conn
            .query_row("PRAGMA schema_version", [], |row| row.get(0))
            .context("failed to read schema version")?;
        self.record(&format!("Schema refreshed, cookie {cookie}"));
        Ok(())
    }

    pub fn post_update(&mut self, conn: &Connection) -> Result<()> {
        conn.execute_batch("ANALYZE")
            .context("failed to analyze database")?;
        self.record("Analyzed database statistics");
        Ok(())
    }

    /// Cumulative importer log; flushing never truncates it.
    #[must_use]
    pub fn logs(&self) -> &str {
        &self.log
    }

    /// Appends importer lines produced since the previous flush to the run
    /// log.
    pub fn flush_logs(&mut self, logger: &mut UpdateLogger) -> Result<()> {
        let pending = self.log[self.flushed..].to_string();
        for line in pending.lines() {
            logger.log(line).map_err(|err| anyhow!(err.to_string()))?;
        }
        self.flushed = self.log.len();
        Ok(())
    }

    fn record(&mut self, line: &str) {
        self.log.push_str(line);
        self.log.push('\n');
    }
}

fn sql_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(anyhow!("failed to list sql files in {}: {err}", dir.display()))
        }
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("failed to list sql files in {}", dir.display()))?
            .path();
        if path.extension().is_some_and(|ext| ext == "sql") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .map_or_else(|| path.display().to_string(), ToString::to_string)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();
    Ok(exists)
}

fn column_exists(conn: &Connection, table_name: &str, column_name: &str) -> Result<bool> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column_name {
            return Ok(true);
        }
    }
    Ok(false)
}

fn index_exists(conn: &Connection, index_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'index' AND name = ?1
             LIMIT 1",
            params![index_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();
    Ok(exists)
}

fn json_to_sql(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Bool(flag) => rusqlite::types::Value::Integer(i64::from(*flag)),
        Value::Number(number) => number.as_i64().map_or_else(
            || rusqlite::types::Value::Real(number.as_f64().unwrap_or(0.0)),
            rusqlite::types::Value::Integer,
        ),
        Value::String(text) => rusqlite::types::Value::Text(text.clone()),
        other => rusqlite::types::Value::Text(other.to_string()),
    }
}

fn build_conditions(pairs: &[(String, Value)]) -> (String, Vec<rusqlite::types::Value>) {
    let mut clauses = Vec::with_capacity(pairs.len());
    let mut values = Vec::new();
    for (column, value) in pairs {
        if value.is_null() {
            clauses.push(format!("{column} IS NULL"));
        } else {
            values.push(json_to_sql(value));
            clauses.push(format!("{column} = ?{}", values.len()));
        }
    }
    if clauses.is_empty() {
        ("1 = 1".to_string(), values)
    } else {
        (clauses.join(" AND "), values)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use proptest::prelude::*;
    use relaycrm_update_core::{evaluate_run, BlockSpec, ColumnType, RunStatus};
    use serde_json::json;

    fn must<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:?}"),
        }
    }

    fn fixture_store() -> SqliteCrmStore {
        let store = must(SqliteCrmStore::open(Path::new(":memory:")));
        must(store.ensure_base_schema());
        store
    }

    fn fixture_logger() -> UpdateLogger {
        UpdateLogger::new(
            std::env::temp_dir().join(format!("relaycrm-store-test-{}.log", Ulid::new())),
        )
    }

    fn cleanup(logger: &UpdateLogger) {
        let _ = std::fs::remove_file(logger.path());
    }

    fn payments_field(column: &str) -> FieldSpec {
        FieldSpec {
            module: "PaymentsIn".to_string(),
            table: "crm_paymentsin".to_string(),
            column: column.to_string(),
            name: column.to_string(),
            label: format!("FL_{}", column.to_uppercase()),
            uitype: 10,
            column_type: ColumnType::Integer {
                width: 10,
                unsigned: true,
            },
            type_of_data: "I~O".to_string(),
            display_type: 1,
            presence: 2,
            quick_create: 1,
            mass_editable: 1,
            summary_field: 0,
            maximum_length: Some("0,4294967295".to_string()),
            default_value: None,
            field_params: None,
            block_label: "LBL_PAYMENT_INFORMATION".to_string(),
            block: Some(BlockSpec {
                label: "LBL_PAYMENT_INFORMATION".to_string(),
                sequence: 1,
                show_title: true,
                visible: true,
                icon: None,
            }),
            picklist_values: Vec::new(),
            related_modules: vec!["FInvoiceProforma".to_string()],
        }
    }

    fn seed_payments_module(store: &SqliteCrmStore, logger: &mut UpdateLogger) -> i64 {
        must(store.connection().execute_batch(
            "CREATE TABLE IF NOT EXISTS crm_paymentsin (
               paymentsinid INTEGER PRIMARY KEY,
               paymentsvalue TEXT
             )",
        ));
        must(store.install_module(logger, "PaymentsIn"))
    }

    #[test]
    fn removing_an_absent_module_logs_info_and_does_not_fault() {
        let store = fixture_store();
        let mut logger = fixture_logger();

        must(store.remove_module(&mut logger, "OSSPasswords"));

        let body = must(std::fs::read_to_string(logger.path()));
        assert!(body.contains("  [INFO] Module not exists: OSSPasswords"));
        assert!(!logger.has_errors());
        cleanup(&logger);
    }

    #[test]
    fn removing_a_present_module_deletes_registry_rows() {
        let store = fixture_store();
        let mut logger = fixture_logger();
        let tabid = seed_payments_module(&store, &mut logger);
        must(store.add_fields(&mut logger, &[payments_field("finvoiceproformaid")]));

        must(store.remove_module(&mut logger, "PaymentsIn"));

        assert_eq!(must(store.module_id("PaymentsIn")), None);
        let orphans: i64 = must(store.connection().query_row(
            "SELECT COUNT(*) FROM crm_fields WHERE tabid = ?1",
            params![tabid],
            |row| row.get(0),
        ));
        assert_eq!(orphans, 0);
        cleanup(&logger);
    }

    #[test]
    fn installing_a_module_twice_logs_exist_and_keeps_one_row() {
        let store = fixture_store();
        let mut logger = fixture_logger();

        let first = must(store.install_module(&mut logger, "SMSTemplates"));
        let second = must(store.install_module(&mut logger, "SMSTemplates"));

        assert_eq!(first, second);
        let body = must(std::fs::read_to_string(logger.path()));
        assert!(body.contains("  [INFO] Module exist: SMSTemplates"));
        cleanup(&logger);
    }

    #[test]
    fn add_fields_is_idempotent_and_logs_skip() {
        let store = fixture_store();
        let mut logger = fixture_logger();
        seed_payments_module(&store, &mut logger);
        let specs = [payments_field("finvoiceproformaid")];

        assert_eq!(must(store.add_fields(&mut logger, &specs)), 1);
        assert_eq!(must(store.add_fields(&mut logger, &specs)), 0);

        let body = must(std::fs::read_to_string(logger.path()));
        assert!(body.contains(
            "  [INFO] Skip adding field. Module: PaymentsIn, field name: finvoiceproformaid"
        ));

        let registered: i64 = must(store.connection().query_row(
            "SELECT COUNT(*) FROM crm_fields WHERE fieldname = 'finvoiceproformaid'",
            [],
            |row| row.get(0),
        ));
        assert_eq!(registered, 1);
        assert!(must(column_exists(
            store.connection(),
            "crm_paymentsin",
            "finvoiceproformaid"
        )));
        let references: i64 = must(store.connection().query_row(
            "SELECT COUNT(*) FROM crm_fieldmodulerel WHERE relmodule = 'FInvoiceProforma'",
            [],
            |row| row.get(0),
        ));
        assert_eq!(references, 1);
        cleanup(&logger);
    }

    #[test]
    fn add_fields_for_missing_module_accumulates_error_and_continues() {
        let store = fixture_store();
        let mut logger = fixture_logger();
        seed_payments_module(&store, &mut logger);

        let mut missing = payments_field("paymentstatus");
        missing.module = "PaymentsOut".to_string();
        let created = must(store.add_fields(
            &mut logger,
            &[missing, payments_field("finvoiceproformaid")],
        ));

        assert_eq!(created, 1);
        assert_eq!(logger.errors().len(), 1);
        assert!(logger.errors()[0].contains("Module not exists: PaymentsOut"));
        cleanup(&logger);
    }

    #[test]
    fn picklist_values_insert_once_and_track_close_state() {
        let store = fixture_store();

        assert_eq!(
            must(store.add_picklist_values(
                "smsnotifier_status",
                &["PLL_QUEUED", "PLL_SENT", "PLL_FAILED"],
            )),
            3
        );
        assert_eq!(
            must(store.add_picklist_values("smsnotifier_status", &["PLL_SENT"])),
            0
        );
        must(store.set_close_state("smsnotifier_status", "PLL_SENT", true));

        assert_eq!(
            must(store.picklist_values("smsnotifier_status")),
            vec!["PLL_QUEUED", "PLL_SENT", "PLL_FAILED"]
        );
        assert!(store
            .set_close_state("smsnotifier_status", "PLL_MISSING", true)
            .is_err());
    }

    #[test]
    fn relations_insert_then_refresh_in_place() {
        let store = fixture_store();
        let mut logger = fixture_logger();
        must(store.install_module(&mut logger, "PaymentsIn"));
        must(store.install_module(&mut logger, "FInvoice"));

        let mut relation = RelationSpec {
            module: "FInvoice".to_string(),
            related_module: "PaymentsIn".to_string(),
            name: "getRelatedList".to_string(),
            label: "PaymentsIn".to_string(),
            actions: vec!["ADD".to_string()],
            view_type: "RelatedTab".to_string(),
        };
        must(store.set_relations(&mut logger, std::slice::from_ref(&relation)));
        relation.actions = vec!["ADD".to_string(), "SELECT".to_string()];
        must(store.set_relations(&mut logger, std::slice::from_ref(&relation)));

        let (count, actions): (i64, String) = must(store.connection().query_row(
            "SELECT COUNT(*), MAX(actions) FROM crm_relatedlists WHERE name = 'getRelatedList'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        ));
        assert_eq!(count, 1);
        assert_eq!(actions, "ADD,SELECT");
        cleanup(&logger);
    }

    #[test]
    fn action_mappings_grant_every_profile_once() {
        let store = fixture_store();
        let mut logger = fixture_logger();
        must(store.install_module(&mut logger, "FInvoiceProforma"));
        for profile in ["Administrator", "Sales"] {
            must(store.connection().execute(
                "INSERT INTO crm_profiles(profilename) VALUES (?1)",
                params![profile],
            ));
        }

        let mapping = ActionMapping {
            name: "RecordConversion".to_string(),
            kind: ActionMappingKind::Add,
            modules: vec!["FInvoiceProforma".to_string()],
        };
        must(store.apply_action_mappings(&mut logger, std::slice::from_ref(&mapping)));
        must(store.apply_action_mappings(&mut logger, std::slice::from_ref(&mapping)));

        let grants: i64 = must(store.connection().query_row(
            "SELECT COUNT(*) FROM crm_profile2utility",
            [],
            |row| row.get(0),
        ));
        assert_eq!(grants, 2);
        cleanup(&logger);
    }

    #[test]
    fn action_mapping_removal_deletes_action_and_grants() {
        let store = fixture_store();
        let mut logger = fixture_logger();
        must(store.install_module(&mut logger, "FInvoiceProforma"));
        must(store.connection().execute(
            "INSERT INTO crm_profiles(profilename) VALUES ('Administrator')",
            [],
        ));
        must(store.apply_action_mappings(
            &mut logger,
            &[ActionMapping {
                name: "DuplicateRecord".to_string(),
                kind: ActionMappingKind::Add,
                modules: vec!["FInvoiceProforma".to_string()],
            }],
        ));

        let removal = ActionMapping {
            name: "DuplicateRecord".to_string(),
            kind: ActionMappingKind::Remove,
            modules: Vec::new(),
        };
        must(store.apply_action_mappings(&mut logger, std::slice::from_ref(&removal)));

        let actions: i64 = must(store.connection().query_row(
            "SELECT COUNT(*) FROM crm_actionmapping WHERE actionname = 'DuplicateRecord'",
            [],
            |row| row.get(0),
        ));
        let grants: i64 = must(store.connection().query_row(
            "SELECT COUNT(*) FROM crm_profile2utility",
            [],
            |row| row.get(0),
        ));
        assert_eq!(actions, 0);
        assert_eq!(grants, 0);

        // Removing it again is a logged no-op.
        must(store.apply_action_mappings(&mut logger, std::slice::from_ref(&removal)));
        let body = must(std::fs::read_to_string(logger.path()));
        assert!(body.contains("  [INFO] Action already absent: DuplicateRecord"));
        assert!(!logger.has_errors());
        cleanup(&logger);
    }

    #[test]
    fn handlers_register_once() {
        let store = fixture_store();
        let handler = HandlerSpec {
            event_name: "EntityAfterSave".to_string(),
            handler_class: "SMSNotifier_SMSNotifierHandler_Handler".to_string(),
            is_active: true,
            include_modules: String::new(),
            exclude_modules: String::new(),
            priority: 5,
        };

        must(store.register_handler(&handler));
        must(store.register_handler(&handler));

        let registered: i64 = must(store.connection().query_row(
            "SELECT COUNT(*) FROM crm_eventhandlers",
            [],
            |row| row.get(0),
        ));
        assert_eq!(registered, 1);
    }

    #[test]
    fn batch_seeds_are_null_aware_and_idempotent() {
        let store = fixture_store();
        let seed = SeedInsert {
            table: "crm_links".to_string(),
            columns: vec![
                "tabid".to_string(),
                "linktype".to_string(),
                "linklabel".to_string(),
                "linkurl".to_string(),
                "linkicon".to_string(),
            ],
            rows: vec![
                vec![
                    json!(4),
                    json!("DASHBOARDWIDGET"),
                    json!("History"),
                    json!("index.php?module=Home&view=ShowWidget"),
                    Value::Null,
                ],
                vec![
                    json!(4),
                    json!("DASHBOARDWIDGET"),
                    json!("Upcoming"),
                    json!("index.php?module=Home&view=ShowWidget&name=Upcoming"),
                    Value::Null,
                ],
            ],
        };

        assert_eq!(must(store.batch_insert(&seed)), 2);
        assert_eq!(must(store.batch_insert(&seed)), 0);

        let changed = must(store.batch_update(&SeedUpdate {
            table: "crm_links".to_string(),
            set: vec![("sequence".to_string(), json!(9))],
            filter: vec![
                ("linklabel".to_string(), json!("History")),
                ("linkicon".to_string(), Value::Null),
            ],
        }));
        assert_eq!(changed, 1);

        let deleted = must(store.batch_delete(&SeedDelete {
            table: "crm_links".to_string(),
            filter: vec![("linklabel".to_string(), json!("Upcoming"))],
        }));
        assert_eq!(deleted, 1);
    }

    #[test]
    fn picklist_dependency_conversion_survives_a_malformed_module() {
        let store = fixture_store();
        let mut logger = fixture_logger();
        must(store.connection().execute_batch(
            "CREATE TABLE crm_picklist_dependency (
               id INTEGER PRIMARY KEY,
               tabid INTEGER NOT NULL,
               sourcefield TEXT NOT NULL,
               targetfield TEXT NOT NULL,
               sourcevalue TEXT NOT NULL,
               targetvalues TEXT NOT NULL
             );
             INSERT INTO crm_picklist_dependency
               (tabid, sourcefield, targetfield, sourcevalue, targetvalues)
             VALUES
               (7, 'industry', 'subindustry', 'Banking', '[\"Retail\",\"Investment\"]'),
               (9, 'leadstatus', 'leadreason', 'Lost', 'not-json'),
               (12, 'ticketstatus', 'ticketreason', 'Closed', '[\"Resolved\"]');",
        ));

        let converted = must(store.rebuild_picklist_dependencies(&mut logger));

        assert_eq!(converted, 2);
        assert_eq!(logger.errors().len(), 1);
        assert!(logger.errors()[0].contains("malformed target values for module 9"));
        let data_rows: i64 = must(store.connection().query_row(
            "SELECT COUNT(*) FROM crm_picklist_dependency_data",
            [],
            |row| row.get(0),
        ));
        assert_eq!(data_rows, 3);
        // The faulted module's source rows survive the partial conversion.
        assert!(must(table_exists(
            store.connection(),
            "crm_picklist_dependency"
        )));
        cleanup(&logger);
    }

    #[test]
    fn failed_dependency_conversion_keeps_legacy_rows_for_retry() {
        let store = fixture_store();
        let mut logger = fixture_logger();
        must(store.connection().execute_batch(
            "CREATE TABLE crm_picklist_dependency (
               id INTEGER PRIMARY KEY,
               tabid INTEGER NOT NULL,
               sourcefield TEXT NOT NULL,
               targetfield TEXT NOT NULL,
               sourcevalue TEXT NOT NULL,
               targetvalues TEXT NOT NULL
             );
             INSERT INTO crm_picklist_dependency
               (tabid, sourcefield, targetfield, sourcevalue, targetvalues)
             VALUES
               (7, 'industry', 'subindustry', 'Banking', '[\"Retail\"]'),
               (9, 'leadstatus', 'leadreason', 'Lost', 'not-json');",
        ));

        assert_eq!(must(store.rebuild_picklist_dependencies(&mut logger)), 1);
        assert!(must(table_exists(
            store.connection(),
            "crm_picklist_dependency"
        )));

        // After the payload is corrected, a re-run converts the remaining
        // module without duplicating the already-converted rows, then
        // drops the legacy table.
        must(store.connection().execute(
            "UPDATE crm_picklist_dependency SET targetvalues = '[\"Budget\"]' WHERE tabid = 9",
            [],
        ));
        assert_eq!(must(store.rebuild_picklist_dependencies(&mut logger)), 2);
        assert!(!must(table_exists(
            store.connection(),
            "crm_picklist_dependency"
        )));
        let data_rows: i64 = must(store.connection().query_row(
            "SELECT COUNT(*) FROM crm_picklist_dependency_data",
            [],
            |row| row.get(0),
        ));
        assert_eq!(data_rows, 2);
        cleanup(&logger);
    }

    #[test]
    fn batch_methods_queue_once_while_pending() {
        let store = fixture_store();
        let params_value = json!(["crm_paymentsin"]);

        assert!(must(store.queue_batch_method(
            "Maintenance::recalculateSums",
            &params_value
        )));
        assert!(!must(store.queue_batch_method(
            "Maintenance::recalculateSums",
            &params_value
        )));
        assert!(must(store.queue_batch_method(
            "Maintenance::recalculateSums",
            &json!(["crm_finvoice"])
        )));
    }

    #[test]
    fn version_markers_round_trip_and_track_current_version() {
        let store = fixture_store();
        let manifest = relaycrm_update_core::PackageManifest {
            label: "RelayCRM 6.4.0".to_string(),
            from_version: "6.3.0".to_string(),
            to_version: "6.4.0".to_string(),
        };

        must(store.insert_version_marker(&VersionMarker::for_run(&manifest, "system", false)));
        must(store.insert_version_marker(&VersionMarker::for_run(&manifest, "system", true)));
        must(store.set_current_version("6.4.0", relaycrm_update_core::now_utc()));

        let history = must(store.version_history());
        assert_eq!(history.len(), 2);
        assert!(!history[0].result);
        assert!(history[1].result);
        assert_eq!(must(store.current_version()), Some("6.4.0".to_string()));
    }

    #[test]
    fn importer_applies_files_and_gates_on_error_lines() {
        let store = fixture_store();
        let mut logger = fixture_logger();
        let package_dir =
            std::env::temp_dir().join(format!("relaycrm-package-{}", Ulid::new()));
        must(std::fs::create_dir_all(package_dir.join("dbscheme")));
        must(std::fs::create_dir_all(package_dir.join("data")));
        must(std::fs::write(
            package_dir.join("dbscheme/01_tables.sql"),
            "CREATE TABLE crm_smsnotifier_queue (id INTEGER PRIMARY KEY, message TEXT);",
        ));
        must(std::fs::write(
            package_dir.join("data/01_seed.sql"),
            "INSERT INTO crm_smsnotifier_queue(message) VALUES ('welcome');",
        ));

        let mut importer = SchemaImporter::new();
        must(importer.load_files(&package_dir));
        assert_eq!(importer.scheme_files().len(), 1);
        must(importer.update_scheme(store.connection()));
        must(importer.import_data(store.connection()));
        must(importer.refresh_schema(store.connection()));
        must(importer.check_integrity(store.connection(), true));
        must(importer.post_update(store.connection()));

        assert!(importer.logs().contains("Applied 01_tables.sql"));
        assert!(importer.logs().contains("Integrity check: ok"));
        assert_eq!(
            evaluate_run(logger.errors(), importer.logs()),
            RunStatus::Completed
        );

        // A broken file is recorded with the Error prefix and fails the gate.
        must(std::fs::write(
            package_dir.join("data/02_broken.sql"),
            "INSERT INTO crm_missing_table(message) VALUES ('x');",
        ));
        must(importer.load_files(&package_dir));
        must(importer.import_data(store.connection()));
        assert!(importer.logs().contains("Error: 02_broken.sql"));
        assert!(evaluate_run(logger.errors(), importer.logs()).is_failed());

        must(importer.flush_logs(&mut logger));
        let body = must(std::fs::read_to_string(logger.path()));
        assert!(body.contains("Applied 01_tables.sql"));
        cleanup(&logger);
        let _ = std::fs::remove_dir_all(&package_dir);
    }

    #[test]
    fn importer_flush_keeps_cumulative_log_and_skips_flushed_lines() {
        let mut importer = SchemaImporter::new();
        let mut logger = fixture_logger();

        importer.record("first line");
        must(importer.flush_logs(&mut logger));
        importer.record("second line");
        must(importer.flush_logs(&mut logger));

        assert_eq!(importer.logs(), "first line\nsecond line\n");
        let body = must(std::fs::read_to_string(logger.path()));
        let first_count = body.lines().filter(|line| *line == "first line").count();
        assert_eq!(first_count, 1);
        cleanup(&logger);
    }

    #[test]
    fn importer_drop_helpers_tolerate_absent_objects() {
        let store = fixture_store();
        let mut importer = SchemaImporter::new();
        must(store.connection().execute_batch(
            "CREATE TABLE crm_legacy (id INTEGER PRIMARY KEY, stale TEXT);
             CREATE INDEX idx_crm_legacy_stale ON crm_legacy(stale);
             INSERT INTO crm_schema_constraints(table_name, constraint_name)
             VALUES ('crm_legacy', 'fk_crm_legacy_owner');",
        ));

        must(importer.drop_indexes(
            store.connection(),
            &[
                ("crm_legacy", "idx_crm_legacy_stale"),
                ("crm_legacy", "idx_never_existed"),
            ],
        ));
        must(importer.drop_columns(
            store.connection(),
            &[("crm_legacy", "stale"), ("crm_legacy", "gone")],
        ));
        must(importer.drop_foreign_keys(
            store.connection(),
            &[
                ("crm_legacy", "fk_crm_legacy_owner"),
                ("crm_legacy", "fk_never_existed"),
            ],
        ));
        must(importer.drop_tables(store.connection(), &["crm_legacy", "crm_never_existed"]));

        assert!(!must(table_exists(store.connection(), "crm_legacy")));
        assert!(importer.logs().contains("Dropped index idx_crm_legacy_stale"));
        assert!(importer.logs().contains("Index idx_never_existed on crm_legacy already absent"));
        assert!(importer.logs().contains("Dropped column crm_legacy.stale"));
        assert!(importer
            .logs()
            .contains("Dropped foreign key fk_crm_legacy_owner on crm_legacy"));
    }

    proptest! {
        #[test]
        fn adding_the_same_field_twice_registers_one_row(
            column in "[a-z][a-z0-9_]{2,14}",
        ) {
            let store = fixture_store();
            let mut logger = fixture_logger();
            seed_payments_module(&store, &mut logger);
            // Prefix keeps generated names clear of SQL keywords.
            let column = format!("c_{column}");
            let specs = [payments_field(&column)];

            let first = must(store.add_fields(&mut logger, &specs));
            let second = must(store.add_fields(&mut logger, &specs));

            prop_assert_eq!(first, 1);
            prop_assert_eq!(second, 0);
            let registered: i64 = must(store.connection().query_row(
                "SELECT COUNT(*) FROM crm_fields WHERE fieldname = ?1",
                params![column],
                |row| row.get(0),
            ));
            prop_assert_eq!(registered, 1);
            cleanup(&logger);
        }
    }
}
