//! Config Store: a single-writer, multi-reader in-memory snapshot backed by
//! an atomically-persisted JSON file per family.
//!
//! Grounded in the teacher's `ArcSwap`-based hot-reloadable `RuntimeState`
//! (`server/setup.rs`, `runtime/state.rs`): readers call `snapshot()` and get
//! a cheap `Arc` clone that can never observe a half-written state. Persistence
//! itself uses the standard write-tempfile-then-rename pattern (not present
//! verbatim in the teacher, who only reloads from files others write;
//! grounded more generally in the "atomic replace" idiom common across the
//! pack's config-writing crates, e.g. `osobh-clawops/crates/claw-persist`).

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::error::ConfigError;
use super::types::{EndpointProfile, FamilyState, Mode, SystemConfig};
use crate::family::Family;

pub struct ConfigStore {
    data_dir: PathBuf,
    anthropic: ArcSwap<FamilyState>,
    openai: ArcSwap<FamilyState>,
    system: ArcSwap<SystemConfig>,
    /// Serialises `mutate_family` read-modify-write cycles so two concurrent
    /// freezes (or a freeze racing a REST edit) can't lose an update; plain
    /// `snapshot()` reads never take this lock.
    write_lock: Mutex<()>,
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let path_str = path.display().to_string();
    let bytes = std::fs::read(path).map_err(|_| ConfigError::Missing {
        path: path_str.clone(),
    })?;
    serde_json::from_slice(&bytes).map_err(|source| ConfigError::Invalid {
        path: path_str,
        source,
    })
}

/// Write-tempfile-then-rename: readers of `path` either see the full prior
/// contents or the full new contents, never a partial write.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), ConfigError> {
    let path_str = path.display().to_string();
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|source| ConfigError::Persist {
        path: path_str.clone(),
        source,
    })?;

    let tmp_path = dir.join(format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("config"),
        std::process::id()
    ));

    let body = serde_json::to_vec_pretty(value).map_err(|source| ConfigError::Invalid {
        path: path_str.clone(),
        source,
    })?;

    (|| -> io::Result<()> {
        std::fs::write(&tmp_path, &body)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    })()
    .map_err(|source| ConfigError::Persist {
        path: path_str,
        source,
    })
}

impl ConfigStore {
    /// Loads both family files and the system file, then builds the store.
    /// A missing file is treated as fatal; callers that want "create on
    /// first run" semantics should use [`ConfigStore::bootstrap`].
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let data_dir = data_dir.into();
        let anthropic = Self::load_family_file(&data_dir, Family::Anthropic)?;
        let openai = Self::load_family_file(&data_dir, Family::OpenAi)?;
        let system = read_json(&Self::system_path(&data_dir))?;

        Ok(Self {
            data_dir,
            anthropic: ArcSwap::from_pointee(anthropic),
            openai: ArcSwap::from_pointee(openai),
            system: ArcSwap::from_pointee(system),
            write_lock: Mutex::new(()),
        })
    }

    /// Like `open`, but missing files are written with defaults first
    /// (`paf config init` / first run), rather than surfacing
    /// `config-missing`.
    pub fn bootstrap(data_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir).map_err(|source| ConfigError::Persist {
            path: data_dir.display().to_string(),
            source,
        })?;

        for family in Family::ALL {
            let path = Self::family_path(&data_dir, family);
            if !path.exists() {
                write_json_atomic(&path, &FamilyState::default())?;
            }
        }
        let sys_path = Self::system_path(&data_dir);
        if !sys_path.exists() {
            let mut sys = SystemConfig::default();
            sys.data_dir = data_dir.display().to_string();
            write_json_atomic(&sys_path, &sys)?;
        }

        Self::open(data_dir)
    }

    /// Startup loader (spec §7): a missing or invalid system file is fatal;
    /// a missing per-family file gets a default write instead of failing, so
    /// a fresh data directory with no family files yet still boots (a hand
    /// deleted family file is treated the same as "not configured yet", not
    /// as a startup failure). Used by `paf run`; `paf config check` uses the
    /// stricter [`ConfigStore::open`] instead, since checking must never
    /// write.
    pub fn open_for_server(data_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir).map_err(|source| ConfigError::Persist {
            path: data_dir.display().to_string(),
            source,
        })?;

        for family in Family::ALL {
            let path = Self::family_path(&data_dir, family);
            if !path.exists() {
                write_json_atomic(&path, &FamilyState::default())?;
            }
        }

        let anthropic = Self::load_family_file(&data_dir, Family::Anthropic)?;
        let openai = Self::load_family_file(&data_dir, Family::OpenAi)?;
        let system = read_json(&Self::system_path(&data_dir))?;

        Ok(Self {
            data_dir,
            anthropic: ArcSwap::from_pointee(anthropic),
            openai: ArcSwap::from_pointee(openai),
            system: ArcSwap::from_pointee(system),
            write_lock: Mutex::new(()),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn system(&self) -> Arc<SystemConfig> {
        self.system.load_full()
    }

    fn family_path(data_dir: &Path, family: Family) -> PathBuf {
        data_dir.join(format!("{}.json", family.config_name()))
    }

    fn system_path(data_dir: &Path) -> PathBuf {
        data_dir.join("system.json")
    }

    fn load_family_file(data_dir: &Path, family: Family) -> Result<FamilyState, ConfigError> {
        read_json(&Self::family_path(data_dir, family))
    }

    /// Re-reads a family file from disk, replacing the in-memory snapshot.
    /// Used by `paf config check`/`dump` and to pick up external hand-edits
    /// on demand; the hot path uses `snapshot()`.
    pub fn reload(&self, family: Family) -> Result<(), ConfigError> {
        let state = Self::load_family_file(&self.data_dir, family)?;
        self.slot(family).store(Arc::new(state));
        Ok(())
    }

    fn slot(&self, family: Family) -> &ArcSwap<FamilyState> {
        match family {
            Family::Anthropic => &self.anthropic,
            Family::OpenAi => &self.openai,
        }
    }

    /// Cheap read of the latest committed version.
    pub fn snapshot(&self, family: Family) -> Arc<FamilyState> {
        self.slot(family).load_full()
    }

    /// Normalises, writes the whole file atomically, then publishes the new
    /// in-memory snapshot.
    pub fn save_family(&self, family: Family, mut state: FamilyState) -> Result<(), ConfigError> {
        normalize(&mut state);
        write_json_atomic(&Self::family_path(&self.data_dir, family), &state)?;
        self.slot(family).store(Arc::new(state));
        Ok(())
    }

    /// Whole-profile replacement mutation helper: applies `f` to a cloned
    /// snapshot, then calls `save_family`. No caller ever observes a
    /// partially-updated profile. Serialised against other mutators so two
    /// concurrent freezes can't race each other's read-modify-write.
    pub fn mutate_family(
        &self,
        family: Family,
        f: impl FnOnce(&mut FamilyState),
    ) -> Result<(), ConfigError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut state = (*self.snapshot(family)).clone();
        f(&mut state);
        self.save_family(family, state)
    }

    /// Writes `frozen-until` for `name`, extending (never shortening) an
    /// existing freeze window. A no-op if `name` is not found — the profile
    /// may have been deleted between the failing request and this call.
    pub fn extend_freeze(
        &self,
        family: Family,
        name: &str,
        until_ms: i64,
    ) -> Result<(), ConfigError> {
        self.mutate_family(family, |state| {
            if let Some(profile) = state.find_mut(name) {
                profile.freeze_until = Some(match profile.freeze_until {
                    Some(existing) => existing.max(until_ms),
                    None => until_ms,
                });
            }
        })
    }

    /// Clears `frozen-until`, if set. A no-op if `name` is not found or
    /// already unfrozen.
    pub fn clear_freeze(&self, family: Family, name: &str) -> Result<(), ConfigError> {
        self.mutate_family(family, |state| {
            if let Some(profile) = state.find_mut(name)
                && profile.freeze_until.is_some()
            {
                profile.freeze_until = None;
            }
        })
    }

    /// The slice load-balance mode uses, or at most the active profile in
    /// manual mode.
    pub fn eligible_pool(&self, family: Family) -> Vec<EndpointProfile> {
        let snap = self.snapshot(family);
        match snap.mode {
            Mode::LoadBalance => snap
                .configs
                .iter()
                .filter(|p| p.enabled)
                .cloned()
                .collect(),
            Mode::Manual => snap
                .find(snap.active_name())
                .filter(|p| p.enabled)
                .cloned()
                .into_iter()
                .collect(),
        }
    }
}

/// Enable defaults true, weight defaults 1 (both already guaranteed by serde
/// defaults on load, restated here so in-process mutation call sites get the
/// same guarantee), and the active name is repaired if it no longer refers
/// to an enabled profile.
pub fn normalize(state: &mut FamilyState) {
    for profile in &mut state.configs {
        if profile.weight < 0.0 {
            profile.weight = 1.0;
        }
    }

    let active_valid = state
        .find(state.active_name())
        .is_some_and(|p| p.enabled);

    if !active_valid {
        state.active.name = state
            .configs
            .iter()
            .find(|p| p.enabled)
            .map(|p| p.name.clone())
            .unwrap_or_default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn profile(name: &str, enabled: bool, weight: f64) -> EndpointProfile {
        EndpointProfile {
            name: name.to_string(),
            base_url: "https://example.invalid".to_string(),
            auth_token: None,
            api_key: None,
            weight,
            enabled,
            freeze_until: None,
        }
    }

    #[test]
    fn round_trip_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::bootstrap(dir.path()).unwrap();

        let mut state = FamilyState::default();
        state.configs.push(profile("a", true, 3.0));
        state.configs.push(profile("b", true, 1.0));
        state.mode = Mode::LoadBalance;
        store.save_family(Family::Anthropic, state.clone()).unwrap();

        let loaded = store.snapshot(Family::Anthropic);
        assert_eq!(loaded.configs.len(), 2);
        assert_eq!(loaded.configs[0].name, "a");
        assert_eq!(loaded.mode, Mode::LoadBalance);
    }

    #[test]
    fn active_name_repaired_when_invalid() {
        let mut state = FamilyState::default();
        state.configs.push(profile("a", false, 1.0));
        state.configs.push(profile("b", true, 1.0));
        state.active.name = "a".to_string();

        normalize(&mut state);
        assert_eq!(state.active_name(), "b");
    }

    #[test]
    fn active_name_empty_when_nothing_enabled() {
        let mut state = FamilyState::default();
        state.configs.push(profile("a", false, 1.0));
        state.active.name = "a".to_string();

        normalize(&mut state);
        assert_eq!(state.active_name(), "");
    }

    #[test]
    fn missing_family_file_is_config_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigStore::open(dir.path()).unwrap_err();
        assert_eq!(err.kind(), "config-missing");
    }

    #[test]
    fn open_for_server_defaults_missing_family_but_not_missing_system() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigStore::open_for_server(dir.path()).unwrap_err();
        assert_eq!(err.kind(), "config-missing");

        // A hand-written system file plus no family files at all still boots:
        // per-family absence gets a default write, never a fatal error.
        write_json_atomic(&ConfigStore::system_path(dir.path()), &SystemConfig::default()).unwrap();
        let store = ConfigStore::open_for_server(dir.path()).unwrap();
        assert_eq!(store.snapshot(Family::Anthropic).configs.len(), 0);
        assert_eq!(store.snapshot(Family::OpenAi).configs.len(), 0);
        assert!(ConfigStore::family_path(dir.path(), Family::Anthropic).exists());
    }

    #[test]
    fn concurrent_readers_never_see_partial_state() {
        use std::sync::Arc as StdArc;
        use std::thread;

        let dir = tempfile::tempdir().unwrap();
        let store = StdArc::new(ConfigStore::bootstrap(dir.path()).unwrap());

        let mut base = FamilyState::default();
        base.configs.push(profile("x", true, 1.0));
        store.save_family(Family::Anthropic, base).unwrap();

        let writer = {
            let store = StdArc::clone(&store);
            thread::spawn(move || {
                for i in 0..50 {
                    let mut state = FamilyState::default();
                    state.configs.push(profile(&format!("gen-{i}"), true, 1.0));
                    store.save_family(Family::Anthropic, state).unwrap();
                }
            })
        };

        let mut readers = Vec::new();
        for _ in 0..20 {
            let store = StdArc::clone(&store);
            readers.push(thread::spawn(move || {
                for _ in 0..50 {
                    let snap = store.snapshot(Family::Anthropic);
                    assert_eq!(snap.configs.len(), 1);
                }
            }));
        }

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }
}
