//! # Triad Store
//!
//! Owns every triad, the matrix parameters, and the validator set. The
//! in-memory collection mirrors the durable records in [`MatrixDB`].
//!
//! ## Lifecycle
//!
//! ```text
//! new() -> start()/initialize() -> [ready] -> close()
//!             |
//!             +-- Initialized | Error(..) on the event channel
//! ```
//!
//! `new` performs no I/O. Loading happens in `initialize`, which `start`
//! runs on a blocking task so the caller never waits on disk. Until the load
//! completes, mutating operations fail with [`MatrixError::NotInitialized`].
//!
//! ## Write ordering
//!
//! Each mutation follows the same order:
//!
//! 1. Build the new record from the current in-memory state.
//! 2. Write it to `MatrixDB` (which flushes).
//! 3. Commit it to memory.
//! 4. Emit the event.
//!
//! A failed write leaves memory untouched and emits nothing. Steps 1-4 run
//! under one write lock, so two mutations never interleave.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::{MatrixConfig, EVENT_CHANNEL_CAPACITY};
use crate::matrix::consensus::consensus_score;
use crate::matrix::events::MatrixEvent;
use crate::matrix::triad::{now_millis, Triad};
use crate::storage::{DbError, MatrixDB, StateMetadata};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by store operations.
#[derive(Debug, Error)]
pub enum MatrixError {
    /// The persisted state has not finished loading (or the store is closed).
    #[error("matrix store is not initialized")]
    NotInitialized,

    /// Malformed arguments to creation, import, or registration.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No triad with the given id.
    #[error("triad not found: {0}")]
    NotFound(String),

    /// Durable storage fault.
    #[error(transparent)]
    Storage(#[from] DbError),
}

pub type MatrixResult<T> = Result<T, MatrixError>;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Point-in-time copy of the matrix, as returned by
/// [`TriadStore::get_matrix_state`] and carried in `STATUS_UPDATE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatrixSnapshot {
    pub dimensions: u32,
    pub complexity: u32,
    pub triads_count: usize,
    /// All triads in insertion order.
    pub triads: Vec<Triad>,
    pub validators: Vec<String>,
    pub consensus_threshold: f64,
    pub is_initialized: bool,
}

// ---------------------------------------------------------------------------
// In-memory state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct MatrixState {
    config: MatrixConfig,
    /// Insertion-ordered triads.
    triads: Vec<Triad>,
    /// id -> position in `triads`.
    index: HashMap<String, usize>,
    validators: BTreeSet<String>,
    initialized: bool,
}

impl MatrixState {
    fn metadata(&self) -> StateMetadata {
        StateMetadata {
            dimensions: self.config.dimensions,
            complexity: self.config.complexity,
            consensus_threshold: self.config.consensus_threshold,
            validators: self.validators.clone(),
            last_updated: now_millis(),
        }
    }

    fn ensure_initialized(&self) -> MatrixResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(MatrixError::NotInitialized)
        }
    }

    fn push(&mut self, triad: Triad) {
        self.index.insert(triad.id.clone(), self.triads.len());
        self.triads.push(triad);
    }

    fn replace(&mut self, idx: usize, triad: Triad) {
        self.triads[idx] = triad;
    }
}

fn validate_payload(data: &Value) -> MatrixResult<()> {
    match data {
        Value::Null => Err(MatrixError::InvalidInput("data is required".to_string())),
        Value::String(s) if s.is_empty() => Err(MatrixError::InvalidInput(
            "data must not be an empty string".to_string(),
        )),
        _ => Ok(()),
    }
}

fn validate_address(address: &str, what: &str) -> MatrixResult<()> {
    if address.trim().is_empty() {
        return Err(MatrixError::InvalidInput(format!("{what} address is required")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// TriadStore
// ---------------------------------------------------------------------------

/// The triad store. Share it as `Arc<TriadStore>`.
pub struct TriadStore {
    db: MatrixDB,
    state: RwLock<MatrixState>,
    events: broadcast::Sender<MatrixEvent>,
    /// Lossless subscribers. Dropped receivers are pruned on the next event.
    listeners: Mutex<Vec<mpsc::UnboundedSender<MatrixEvent>>>,
}

impl TriadStore {
    /// Creates an uninitialized store over `db`. Performs no I/O.
    ///
    /// `config` is used only when the database holds no metadata yet.
    pub fn new(db: MatrixDB, config: MatrixConfig) -> MatrixResult<Self> {
        config.validate().map_err(MatrixError::InvalidInput)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            db,
            state: RwLock::new(MatrixState {
                config,
                triads: Vec::new(),
                index: HashMap::new(),
                validators: BTreeSet::new(),
                initialized: false,
            }),
            events,
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Subscribes to store events. Subscribe before [`start`](Self::start) to
    /// observe `Initialized` / `Error`.
    pub fn subscribe(&self) -> broadcast::Receiver<MatrixEvent> {
        self.events.subscribe()
    }

    /// Registers a subscriber that receives every later event, however far
    /// behind it falls. Use it where a skipped event would be lost work; the
    /// gossip runtime announces triads from it.
    pub fn listen(&self) -> mpsc::UnboundedReceiver<MatrixEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().push(tx);
        rx
    }

    /// Runs [`initialize`](Self::initialize) on the blocking pool.
    ///
    /// Must be called from within a tokio runtime. The outcome is reported on
    /// the event channel.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            // Outcome is logged and emitted by initialize itself.
            let _ = store.initialize();
        })
    }

    /// Loads metadata and replays every persisted triad into memory.
    ///
    /// On a fresh database, writes metadata built from the supplied config.
    /// Emits `Initialized` on success and `Error` on failure. Calling it on an
    /// initialized store is a no-op.
    pub fn initialize(&self) -> MatrixResult<()> {
        let mut state = self.state.write();
        if state.initialized {
            return Ok(());
        }

        match self.load(&mut state) {
            Ok(()) => {
                state.initialized = true;
                info!(
                    triads = state.triads.len(),
                    validators = state.validators.len(),
                    dimensions = state.config.dimensions,
                    complexity = state.config.complexity,
                    threshold = state.config.consensus_threshold,
                    "matrix store initialized"
                );
                self.emit(MatrixEvent::Initialized);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "matrix store failed to initialize");
                self.emit(MatrixEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    fn load(&self, state: &mut MatrixState) -> MatrixResult<()> {
        match self.db.get_metadata()? {
            Some(metadata) => {
                let persisted = MatrixConfig {
                    dimensions: metadata.dimensions,
                    complexity: metadata.complexity,
                    consensus_threshold: metadata.consensus_threshold,
                };
                persisted.validate().map_err(|reason| {
                    MatrixError::InvalidInput(format!("persisted matrix parameters: {reason}"))
                })?;
                if persisted != state.config {
                    debug!(?persisted, supplied = ?state.config, "using persisted matrix parameters");
                }
                state.config = persisted;
                state.validators = metadata.validators;
            }
            None => {
                debug!("fresh matrix store, writing initial metadata");
                self.db.put_metadata(&state.metadata())?;
            }
        }

        let mut triads = self.db.triads()?;
        triads.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

        state.triads.clear();
        state.index.clear();
        for triad in triads {
            state.push(triad);
        }
        Ok(())
    }

    /// Returns `true` once the persisted state is loaded.
    pub fn is_initialized(&self) -> bool {
        self.state.read().initialized
    }

    /// Current matrix parameters.
    pub fn config(&self) -> MatrixConfig {
        self.state.read().config
    }

    /// Creates a pending triad at a random position and persists it.
    pub fn create_triad(&self, data: Value, validator: &str) -> MatrixResult<Triad> {
        let mut state = self.state.write();
        state.ensure_initialized()?;
        validate_payload(&data)?;
        validate_address(validator, "validator")?;

        let triad = Triad::new(data, validator, state.config.dimensions);
        self.db.put_triad_with_metadata(&triad, &state.metadata())?;
        state.push(triad.clone());

        info!(
            triad_id = %triad.id,
            validator = %triad.validator,
            x = triad.position.x,
            y = triad.position.y,
            z = triad.position.z,
            "triad created"
        );
        self.emit(MatrixEvent::TriadCreated(triad.clone()));
        Ok(triad)
    }

    /// Scores a pending triad and validates it if the score reaches the
    /// threshold. Already-validated triads are returned unchanged.
    pub fn validate_triad(&self, id: &str, validator: &str) -> MatrixResult<Triad> {
        let mut state = self.state.write();
        state.ensure_initialized()?;

        let idx = *state
            .index
            .get(id)
            .ok_or_else(|| MatrixError::NotFound(id.to_string()))?;
        let current = &state.triads[idx];
        if current.validated {
            debug!(triad_id = %id, "triad already validated, skipping");
            return Ok(current.clone());
        }

        let registered = state.validators.contains(validator);
        let score = consensus_score(current, &state.triads, state.config.complexity, registered);

        let mut updated = current.clone();
        updated.validation_attempts += 1;
        updated.consensus = score;
        if score >= state.config.consensus_threshold {
            updated.validated = true;
        }

        self.db.put_triad(&updated)?;
        state.replace(idx, updated.clone());

        info!(
            triad_id = %id,
            validator = %validator,
            registered,
            consensus = score,
            validated = updated.validated,
            attempts = updated.validation_attempts,
            "triad validation attempt"
        );
        self.emit(MatrixEvent::TriadValidated(updated.clone()));
        Ok(updated)
    }

    /// Durable lookup. A missing id is `Ok(None)`, not an error.
    pub fn get_triad(&self, id: &str) -> MatrixResult<Option<Triad>> {
        Ok(self.db.get_triad(id)?)
    }

    /// Returns `true` if a triad with `id` is held in memory.
    pub fn contains(&self, id: &str) -> bool {
        self.state.read().index.contains_key(id)
    }

    /// Number of triads held in memory.
    pub fn triad_count(&self) -> usize {
        self.state.read().triads.len()
    }

    /// Copies the current matrix state.
    pub fn get_matrix_state(&self) -> MatrixSnapshot {
        let state = self.state.read();
        MatrixSnapshot {
            dimensions: state.config.dimensions,
            complexity: state.config.complexity,
            triads_count: state.triads.len(),
            triads: state.triads.clone(),
            validators: state.validators.iter().cloned().collect(),
            consensus_threshold: state.config.consensus_threshold,
            is_initialized: state.initialized,
        }
    }

    /// Registers `address` as a validator.
    ///
    /// Returns `false` if it was already registered. The in-memory set is
    /// updated first; a failure to persist the metadata is logged and does
    /// not fail the registration.
    pub fn add_validator(&self, address: &str) -> MatrixResult<bool> {
        validate_address(address, "validator")?;
        let mut state = self.state.write();
        state.ensure_initialized()?;

        if !state.validators.insert(address.to_string()) {
            return Ok(false);
        }

        info!(validator = %address, total = state.validators.len(), "validator registered");
        if let Err(e) = self.db.put_metadata(&state.metadata()) {
            warn!(validator = %address, error = %e, "failed to persist validator set");
        }
        Ok(true)
    }

    /// Returns `true` if `address` is a registered validator.
    pub fn is_validator(&self, address: &str) -> bool {
        self.state.read().validators.contains(address)
    }

    /// Stores a triad received from a peer, keeping its id, position and
    /// timestamp. Returns `false` without effect if the id is already known.
    pub fn import_triad(&self, triad: Triad) -> MatrixResult<bool> {
        let mut state = self.state.write();
        state.ensure_initialized()?;

        if state.index.contains_key(&triad.id) {
            return Ok(false);
        }
        if triad.id.is_empty() {
            return Err(MatrixError::InvalidInput("triad id is required".to_string()));
        }
        validate_payload(&triad.data)?;
        validate_address(&triad.validator, "validator")?;
        if !triad.position.within(state.config.dimensions) {
            return Err(MatrixError::InvalidInput(format!(
                "position ({}, {}, {}) outside matrix of dimension {}",
                triad.position.x, triad.position.y, triad.position.z, state.config.dimensions
            )));
        }
        if !(0.0..=1.0).contains(&triad.consensus) {
            return Err(MatrixError::InvalidInput(format!(
                "consensus {} outside [0, 1]",
                triad.consensus
            )));
        }

        self.db.put_triad(&triad)?;
        state.push(triad.clone());

        debug!(triad_id = %triad.id, "imported triad from peer");
        self.emit(MatrixEvent::TriadImported(triad));
        Ok(true)
    }

    /// Applies a peer's validation result.
    ///
    /// Only takes effect when the local copy exists, is still pending, and the
    /// incoming copy is validated. Returns whether anything changed.
    pub fn apply_remote_validation(&self, incoming: &Triad) -> MatrixResult<bool> {
        let mut state = self.state.write();
        state.ensure_initialized()?;

        let Some(&idx) = state.index.get(&incoming.id) else {
            return Ok(false);
        };
        let current = &state.triads[idx];
        if current.validated || !incoming.validated {
            return Ok(false);
        }

        let mut updated = current.clone();
        updated.validated = true;
        updated.consensus = incoming.consensus.clamp(0.0, 1.0);
        updated.validation_attempts = incoming.validation_attempts;

        self.db.put_triad(&updated)?;
        state.replace(idx, updated.clone());

        info!(triad_id = %updated.id, consensus = updated.consensus, "applied remote validation");
        self.emit(MatrixEvent::ValidationImported(updated));
        Ok(true)
    }

    /// Flushes and marks the store closed. Later operations fail with
    /// `NotInitialized`. The sled handle is released when the last clone of
    /// the store is dropped.
    pub fn close(&self) -> MatrixResult<()> {
        let mut state = self.state.write();
        state.initialized = false;
        self.db.flush()?;
        info!("matrix store closed");
        Ok(())
    }

    fn emit(&self, event: MatrixEvent) {
        self.listeners
            .lock()
            .retain(|listener| listener.send(event.clone()).is_ok());
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
