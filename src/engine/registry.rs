//! Model registry: on-demand loading, aliasing and release of engines.
//!
//! Each engine owns one slot guarded by an `RwLock`:
//! - `ensure_loaded` takes the write lock, so concurrent callers for the
//!   same engine serialize and exactly one of them instantiates the model.
//! - a scoring call holds a read guard on the physical slot through an
//!   [`EngineLease`], so `release` (write lock) waits for in-flight scoring
//!   and a request never observes a half-torn-down engine.
//!
//! Lock order: an alias slot may be locked before its primary slot, never
//! the other way round. `release` never holds two slots at once.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{EngineError, EngineSpec, LoadedEngine, ModelLoader};

/// Footprint reported for an unloaded engine.
const UNLOADED_FOOTPRINT: &str = "0 GB";

/// How many times an alias re-checks its primary after a racing release.
const ALIAS_LOAD_ATTEMPTS: usize = 3;

// ═══════════════════════════════════════════════════════════
// Slot state
// ═══════════════════════════════════════════════════════════

#[derive(Debug)]
enum SlotState {
    Unloaded,
    /// Physical engine resident in memory.
    Loaded(Arc<LoadedEngine>),
    /// Logical engine marked ready on top of its primary's weights.
    Aliased,
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    loaded_at: Option<DateTime<Utc>>,
}

impl Slot {
    fn empty() -> Self {
        Self {
            state: SlotState::Unloaded,
            loaded_at: None,
        }
    }

    fn reset(&mut self) -> bool {
        let was_loaded = !matches!(self.state, SlotState::Unloaded);
        self.state = SlotState::Unloaded;
        self.loaded_at = None;
        was_loaded
    }
}

#[derive(Debug)]
struct EngineSlot {
    spec: EngineSpec,
    slot: RwLock<Slot>,
}

impl EngineSlot {
    fn read(&self) -> RwLockReadGuard<'_, Slot> {
        self.slot.read().unwrap_or_else(|poisoned| {
            tracing::warn!(engine = %self.spec.name, "Engine slot lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Non-blocking read. `None` while the slot is locked for writing.
    fn peek(&self) -> Option<RwLockReadGuard<'_, Slot>> {
        match self.slot.try_read() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    fn is_resident(&self) -> bool {
        self.peek()
            .map(|slot| matches!(slot.state, SlotState::Loaded(_)))
            .unwrap_or(false)
    }

    fn is_aliased(&self) -> bool {
        self.peek()
            .map(|slot| matches!(slot.state, SlotState::Aliased))
            .unwrap_or(false)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Slot> {
        self.slot.write().unwrap_or_else(|poisoned| {
            tracing::warn!(engine = %self.spec.name, "Engine slot lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

// ═══════════════════════════════════════════════════════════
// Public types
// ═══════════════════════════════════════════════════════════

/// Which engines a `release` call targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseTarget {
    All,
    Engine(String),
}

impl ReleaseTarget {
    /// `"all"` / `"todas"` select every engine, anything else one engine.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "all" | "todas" => Self::All,
            other => Self::Engine(other.to_string()),
        }
    }
}

/// Point-in-time view of one engine slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub name: String,
    pub display_name: String,
    pub kind: String,
    pub loaded: bool,
    /// Approximate memory held (`"~1.5 GB"` while loaded, `"0 GB"` otherwise).
    pub footprint: String,
    pub loaded_at: Option<String>,
    pub alias_of: Option<String>,
}

/// Read access to a loaded engine for the duration of one scoring call.
///
/// While a lease is alive the engine cannot be released.
pub struct EngineLease<'a> {
    spec: &'a EngineSpec,
    engine: Arc<LoadedEngine>,
    _guard: RwLockReadGuard<'a, Slot>,
}

impl EngineLease<'_> {
    /// Definition of the engine that was asked for (the alias, not its primary).
    pub fn spec(&self) -> &EngineSpec {
        self.spec
    }

    pub fn engine(&self) -> &LoadedEngine {
        &self.engine
    }
}

impl std::fmt::Debug for EngineLease<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineLease")
            .field("engine", &self.spec.name)
            .finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════

/// Owns every engine slot and the loader that fills them.
pub struct ModelRegistry {
    slots: Vec<EngineSlot>,
    loader: Box<dyn ModelLoader>,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("slots", &self.slots)
            .finish_non_exhaustive()
    }
}

impl ModelRegistry {
    /// Build a registry. Every alias must point at a known, non-alias engine
    /// and names must be unique.
    pub fn new(specs: Vec<EngineSpec>, loader: Box<dyn ModelLoader>) -> Result<Self, EngineError> {
        for (i, spec) in specs.iter().enumerate() {
            if specs[..i].iter().any(|s| s.name == spec.name) {
                return Err(EngineError::Configuration(format!(
                    "duplicate engine name '{}'",
                    spec.name
                )));
            }
            if let Some(target) = &spec.alias_of {
                let primary = specs.iter().find(|s| &s.name == target);
                match primary {
                    Some(p) if !p.is_alias() => {}
                    Some(_) => {
                        return Err(EngineError::Configuration(format!(
                            "'{}' aliases '{target}', which is itself an alias",
                            spec.name
                        )))
                    }
                    None => {
                        return Err(EngineError::Configuration(format!(
                            "'{}' aliases unknown engine '{target}'",
                            spec.name
                        )))
                    }
                }
            }
        }

        let slots = specs
            .into_iter()
            .map(|spec| EngineSlot {
                spec,
                slot: RwLock::new(Slot::empty()),
            })
            .collect();
        Ok(Self { slots, loader })
    }

    /// Registry with the deployed engines (`biomedclip` + `biovil` alias).
    pub fn with_default_engines(loader: Box<dyn ModelLoader>) -> Result<Self, EngineError> {
        Self::new(EngineSpec::defaults(), loader)
    }

    pub fn spec(&self, name: &str) -> Option<&EngineSpec> {
        self.find(name).map(|s| &s.spec)
    }

    pub fn specs(&self) -> impl Iterator<Item = &EngineSpec> {
        self.slots.iter().map(|s| &s.spec)
    }

    fn find(&self, name: &str) -> Option<&EngineSlot> {
        self.slots.iter().find(|s| s.spec.name == name)
    }

    fn slot(&self, name: &str) -> Result<&EngineSlot, EngineError> {
        self.find(name)
            .ok_or_else(|| EngineError::UnknownEngine(name.to_string()))
    }

    /// Slot that physically holds `name`'s weights.
    fn physical(&self, name: &str) -> Result<&EngineSlot, EngineError> {
        let slot = self.slot(name)?;
        match &slot.spec.alias_of {
            Some(target) => self.slot(target),
            None => Ok(slot),
        }
    }

    // ── Loading ─────────────────────────────────────────────

    /// Load `name` if it is not resident. Idempotent; concurrent calls
    /// produce exactly one instantiation. On failure the engine stays
    /// unloaded and a later call retries.
    pub fn ensure_loaded(&self, name: &str) -> Result<(), EngineError> {
        let slot = self.slot(name)?;
        match slot.spec.alias_of.clone() {
            None => self.ensure_primary(slot),
            Some(target) => self.ensure_alias(slot, &target),
        }
    }

    fn ensure_primary(&self, slot: &EngineSlot) -> Result<(), EngineError> {
        if matches!(slot.read().state, SlotState::Loaded(_)) {
            return Ok(());
        }

        let mut guard = slot.write();
        if matches!(guard.state, SlotState::Loaded(_)) {
            return Ok(());
        }

        tracing::info!(
            engine = %slot.spec.name,
            model = %slot.spec.display_name,
            "Loading engine"
        );
        let started = std::time::Instant::now();
        match self.loader.load(&slot.spec) {
            Ok(engine) => {
                guard.state = SlotState::Loaded(Arc::new(engine));
                guard.loaded_at = Some(Utc::now());
                tracing::info!(
                    engine = %slot.spec.name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Engine loaded"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(engine = %slot.spec.name, error = %e, "Engine load failed");
                Err(match e {
                    EngineError::ModelLoad { .. } => e,
                    other => EngineError::ModelLoad {
                        engine: slot.spec.name.clone(),
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    fn ensure_alias(&self, slot: &EngineSlot, target: &str) -> Result<(), EngineError> {
        let primary = self.slot(target)?;
        for _ in 0..ALIAS_LOAD_ATTEMPTS {
            self.ensure_primary(primary)?;

            let mut alias = slot.write();
            let primary_guard = primary.read();
            if !matches!(primary_guard.state, SlotState::Loaded(_)) {
                // Released between load and mark; load again.
                continue;
            }
            if !matches!(alias.state, SlotState::Aliased) {
                alias.state = SlotState::Aliased;
                alias.loaded_at = Some(Utc::now());
                tracing::info!(
                    engine = %slot.spec.name,
                    primary = %target,
                    "Engine ready on shared weights"
                );
            }
            return Ok(());
        }
        Err(EngineError::ModelUnavailable {
            engine: slot.spec.name.clone(),
            reason: format!("'{target}' was released while loading"),
        })
    }

    // ── Queries ─────────────────────────────────────────────

    /// Whether `name` is resident. Unknown names are never loaded.
    /// An alias counts as loaded when marked ready or when its primary is.
    ///
    /// Never blocks: a slot in the middle of a load or release reports
    /// unloaded, so async handlers can call this directly.
    pub fn is_loaded(&self, name: &str) -> bool {
        let Some(slot) = self.find(name) else {
            return false;
        };
        match &slot.spec.alias_of {
            None => slot.is_resident(),
            Some(target) => slot.is_aliased() || self.is_loaded(target),
        }
    }

    /// Borrow a loaded engine. Fails with `ModelUnavailable` if the physical
    /// engine is not resident; callers run `ensure_loaded` first.
    pub fn lease(&self, name: &str) -> Result<EngineLease<'_>, EngineError> {
        let logical = self.slot(name)?;
        let physical = self.physical(name)?;
        let guard = physical.read();
        let engine = match &guard.state {
            SlotState::Loaded(engine) => Arc::clone(engine),
            _ => {
                return Err(EngineError::ModelUnavailable {
                    engine: name.to_string(),
                    reason: "engine is not loaded".to_string(),
                })
            }
        };
        Ok(EngineLease {
            spec: &logical.spec,
            engine,
            _guard: guard,
        })
    }

    pub fn status(&self) -> Vec<EngineStatus> {
        self.slots
            .iter()
            .map(|slot| {
                let loaded = self.is_loaded(&slot.spec.name);
                let loaded_at = if loaded {
                    self.physical(&slot.spec.name)
                        .ok()
                        .and_then(|physical| physical.peek())
                        .and_then(|physical| physical.loaded_at)
                        .map(|t| t.to_rfc3339())
                } else {
                    None
                };
                EngineStatus {
                    name: slot.spec.name.clone(),
                    display_name: slot.spec.display_name.clone(),
                    kind: slot.spec.kind.clone(),
                    loaded,
                    footprint: if loaded {
                        slot.spec.footprint.clone()
                    } else {
                        UNLOADED_FOOTPRINT.to_string()
                    },
                    loaded_at,
                    alias_of: slot.spec.alias_of.clone(),
                }
            })
            .collect()
    }

    pub fn engine_status(&self, name: &str) -> Result<EngineStatus, EngineError> {
        self.slot(name)?;
        self.status()
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| EngineError::UnknownEngine(name.to_string()))
    }

    // ── Release ─────────────────────────────────────────────

    /// Unload the targeted engines and reclaim memory. Waits for in-flight
    /// leases. Releasing a primary also resets its aliases. Returns the
    /// number of slots that were loaded; unknown names are a logged no-op.
    pub fn release(&self, target: &ReleaseTarget) -> usize {
        let names: Vec<&str> = match target {
            ReleaseTarget::All => self.slots.iter().map(|s| s.spec.name.as_str()).collect(),
            ReleaseTarget::Engine(name) => {
                let Some(slot) = self.find(name) else {
                    tracing::warn!(engine = %name, "Release requested for unknown engine");
                    return 0;
                };
                let mut names = vec![slot.spec.name.as_str()];
                names.extend(
                    self.slots
                        .iter()
                        .filter(|s| s.spec.alias_of.as_deref() == Some(name.as_str()))
                        .map(|s| s.spec.name.as_str()),
                );
                names
            }
        };

        let mut released = 0;
        for name in names {
            if let Some(slot) = self.find(name) {
                if slot.write().reset() {
                    tracing::info!(engine = %name, "Engine released");
                    released += 1;
                }
            }
        }

        self.loader.reclaim();
        tracing::info!(released, "Release pass complete");
        released
    }
}
