//! SQLite-backed document store for the `settings` and `state` documents.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::settings::Settings;
use crate::trading::{Position, TradingMode};

pub const SETTINGS_DOC: &str = "settings";
pub const STATE_DOC: &str = "state";

/// Persisted engine state. Older documents used camelCase keys; both spellings
/// are read, snake_case is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeState {
    pub balance: f64,
    #[serde(alias = "activePositions")]
    pub active_positions: Vec<Position>,
    #[serde(alias = "tradeHistory")]
    pub trade_history: Vec<Position>,
    #[serde(alias = "tradeIdCounter")]
    pub trade_id_counter: u64,
    #[serde(alias = "isRunning")]
    pub is_running: bool,
    #[serde(alias = "tradingMode")]
    pub trading_mode: TradingMode,
}

impl RuntimeState {
    pub fn fresh(balance: f64) -> Self {
        Self {
            balance,
            active_positions: Vec::new(),
            trade_history: Vec::new(),
            trade_id_counter: 1,
            is_running: true,
            trading_mode: TradingMode::Virtual,
        }
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::fresh(Settings::default().initial_virtual_balance)
    }
}

/// A whole document ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    Settings(Settings),
    State(RuntimeState),
}

impl Document {
    pub fn name(&self) -> &'static str {
        match self {
            Document::Settings(_) => SETTINGS_DOC,
            Document::State(_) => STATE_DOC,
        }
    }

    pub fn body(&self) -> Result<Value, StoreError> {
        Ok(match self {
            Document::Settings(s) => serde_json::to_value(s)?,
            Document::State(s) => serde_json::to_value(s)?,
        })
    }
}

pub struct DocumentStore {
    conn: Connection,
}

impl DocumentStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let mut store = Self { conn: Connection::open(path)? };
        store.init()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let mut store = Self { conn: Connection::open_in_memory()? };
        store.init()?;
        Ok(store)
    }

    fn init(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS documents (
                name TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<Option<Value>, StoreError> {
        let body: Option<String> = self
            .conn
            .query_row("SELECT body FROM documents WHERE name = ?1", params![name], |row| row.get(0))
            .optional()?;
        body.map(|b| serde_json::from_str::<Value>(&b)).transpose().map_err(StoreError::from)
    }

    /// Replaces the named document in one statement.
    pub fn save(&mut self, name: &str, body: &Value) -> Result<(), StoreError> {
        let text = serde_json::to_string(body)?;
        self.conn.execute(
            "INSERT INTO documents (name, body, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
            params![name, text, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn write(&mut self, doc: &Document) -> Result<(), StoreError> {
        let body = doc.body()?;
        self.save(doc.name(), &body)
    }

    /// Loads settings, migrating legacy keys. A missing document is created
    /// from defaults; a migrated one is written back.
    pub fn load_settings(&mut self) -> Result<Settings, StoreError> {
        let Some(doc) = self.load(SETTINGS_DOC)? else {
            warn!("no settings document, writing defaults");
            let settings = Settings::default();
            self.write(&Document::Settings(settings.clone()))?;
            return Ok(settings);
        };
        let (settings, notes) = Settings::from_document(doc)?;
        if !notes.is_empty() {
            for note in &notes {
                info!(note = %note, "settings migrated");
            }
            self.write(&Document::Settings(settings.clone()))?;
        }
        Ok(settings)
    }

    /// Loads runtime state, initialising it from `settings` when absent.
    pub fn load_state(&mut self, settings: &Settings) -> Result<RuntimeState, StoreError> {
        match self.load(STATE_DOC)? {
            Some(doc) => Ok(serde_json::from_value(doc)?),
            None => {
                warn!("no state document, starting fresh");
                let state = RuntimeState::fresh(settings.initial_virtual_balance);
                self.write(&Document::State(state.clone()))?;
                Ok(state)
            }
        }
    }
}

/// Runs the store on a blocking thread, writing every document it receives
/// until the sender side is dropped. Failed writes are logged and skipped.
pub fn spawn_writer(mut store: DocumentStore, mut rx: mpsc::Receiver<Document>) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while let Some(doc) = rx.blocking_recv() {
            match store.write(&doc) {
                Ok(()) => debug!(doc = doc.name(), "document saved"),
                Err(e) => error!(doc = doc.name(), error = %e, "document save failed"),
            }
        }
        debug!("persistence writer drained");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_documents_are_initialised() {
        let mut store = DocumentStore::in_memory().unwrap();
        let settings = store.load_settings().unwrap();
        assert_eq!(settings, Settings::default());
        assert!(store.load(SETTINGS_DOC).unwrap().is_some());

        let state = store.load_state(&settings).unwrap();
        assert_eq!(state, RuntimeState::fresh(10_000.0));
        assert!(store.load(STATE_DOC).unwrap().is_some());
    }

    #[test]
    fn test_save_replaces_document() {
        let mut store = DocumentStore::in_memory().unwrap();
        store.save("x", &json!({ "a": 1 })).unwrap();
        store.save("x", &json!({ "a": 2 })).unwrap();
        assert_eq!(store.load("x").unwrap(), Some(json!({ "a": 2 })));
        assert_eq!(store.load("y").unwrap(), None);
    }

    #[test]
    fn test_legacy_settings_rewritten() {
        let mut store = DocumentStore::in_memory().unwrap();
        store.save(SETTINGS_DOC, &json!({ "CIRCUIT_BREAKER_THRESHOLD_PCT": -4.0 })).unwrap();
        let s = store.load_settings().unwrap();
        assert_eq!(s.circuit_breaker_block_threshold_pct, -4.0);
        let stored = store.load(SETTINGS_DOC).unwrap().unwrap();
        assert!(stored.get("CIRCUIT_BREAKER_THRESHOLD_PCT").is_none());
        assert_eq!(stored["CIRCUIT_BREAKER_BLOCK_THRESHOLD_PCT"], -4.0);
    }

    #[test]
    fn test_invalid_settings_is_an_error() {
        let mut store = DocumentStore::in_memory().unwrap();
        store.save(SETTINGS_DOC, &json!({ "NOT_A_SETTING": true })).unwrap();
        assert!(matches!(store.load_settings(), Err(StoreError::Settings(_))));
    }

    #[test]
    fn test_camel_case_state_accepted() {
        let mut store = DocumentStore::in_memory().unwrap();
        store
            .save(STATE_DOC, &json!({ "balance": 950.5, "tradeIdCounter": 12, "isRunning": false, "tradingMode": "REAL_PAPER" }))
            .unwrap();
        let state = store.load_state(&Settings::default()).unwrap();
        assert_eq!(state.balance, 950.5);
        assert_eq!(state.trade_id_counter, 12);
        assert!(!state.is_running);
        assert_eq!(state.trading_mode, TradingMode::RealPaper);
    }

    #[tokio::test]
    async fn test_writer_persists_until_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.sqlite");
        let path = path.to_str().unwrap().to_string();

        let (tx, rx) = mpsc::channel(4);
        let handle = spawn_writer(DocumentStore::open(&path).unwrap(), rx);
        let mut state = RuntimeState::fresh(500.0);
        state.trade_id_counter = 9;
        tx.send(Document::State(state.clone())).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let mut reopened = DocumentStore::open(&path).unwrap();
        assert_eq!(reopened.load_state(&Settings::default()).unwrap(), state);
    }
}
