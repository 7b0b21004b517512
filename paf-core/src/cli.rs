//! CLI-facing plumbing behind the `paf` binary's `config init`/`config
//! check` subcommands (SPEC_FULL §10.3). Grounded in the teacher's
//! `cli::conf::{init,check}` pair (`snakeway-core/src/cli/conf/{init,check}.rs`),
//! narrowed from the teacher's TOML route/service/device template bundle to
//! this spec's two JSON config kinds (the per-family files and the system
//! file), since `paf` has no embedded template assets to unpack.

use std::path::PathBuf;

use anyhow::Result;

use crate::config::ConfigStore;
use crate::family::Family;

/// `$PAF_DATA_DIR`, or `$HOME/.paf` if unset (spec §6).
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PAF_DATA_DIR") {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".paf")
}

/// `paf config init`: writes default per-family and system config files if
/// absent, creating the data directory if necessary. Refuses nothing —
/// re-running against an already-initialized directory is a no-op for any
/// file that already exists.
pub fn init(data_dir: PathBuf) -> Result<()> {
    ConfigStore::bootstrap(&data_dir)?;

    println!("initialized paf config in {}", data_dir.display());
    println!("created (or left untouched):");
    for family in Family::ALL {
        println!("  - {}.json", family.config_name());
    }
    println!("  - system.json");
    Ok(())
}

/// `paf config check`: loads and validates both family configs and the
/// system config, printing a summary, without starting any listener and
/// without writing anything. Exits non-zero on `config-missing`/
/// `config-invalid`.
pub fn check(data_dir: PathBuf) -> Result<()> {
    let store = match ConfigStore::open(&data_dir) {
        Ok(store) => store,
        Err(err) => {
            eprintln!("{}: {err}", err.kind());
            std::process::exit(1);
        }
    };

    println!("config loaded from {}", data_dir.display());
    for family in Family::ALL {
        let state = store.snapshot(family);
        println!(
            "  {}: mode={:?} strategy={:?} endpoints={} active={:?}",
            family.config_name(),
            state.mode,
            state.loadbalancer.strategy,
            state.configs.len(),
            state.active_name(),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_then_check_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");

        init(data_dir.clone()).unwrap();
        check(data_dir).unwrap();
    }

}
