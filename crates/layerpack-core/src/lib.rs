//! Assembly engine for layerpack bundles.
//!
//! This crate ties the schema, store, runtime, elf and fetch crates together
//! into the `Engine`, which runs the assembly pipeline stage by stage:
//! lower layers, package retrieval, overlay composition, sandboxed install,
//! dependency resolution and materialization. Progress is persisted after
//! every stage so an interrupted run resumes where it stopped, and mounts
//! are torn down on every exit path.

pub mod concurrency;
pub mod engine;
pub mod report;
pub mod resolve;

pub use concurrency::{install_signal_handler, WorkdirLock};
pub use engine::{clean_workdir, workdir_status, Engine, EngineParts};
pub use report::{BuildReport, CleanReport, FetchSummary, WorkdirStatus};
pub use resolve::{resolve_tree, ResolveTarget};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("config error: {0}")]
    Config(#[from] layerpack_schema::ConfigError),
    #[error("workdir error: {0}")]
    Store(#[from] layerpack_store::StoreError),
    #[error("runtime error: {0}")]
    Runtime(#[from] layerpack_runtime::RuntimeError),
    #[error("resolve error: {0}")]
    Elf(#[from] layerpack_elf::ElfError),
    #[error("fetch error: {0}")]
    Fetch(#[from] layerpack_fetch::FetchError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("workdir lock: {} is held by another assembly", .0.display())]
    Locked(PathBuf),
    #[error("{0}")]
    Prerequisites(String),
    #[error("{} package(s) could not be fetched: {}", failed.len(), failed.join("; "))]
    FetchFailed { failed: Vec<String> },
    #[error("workdir error: mounts still active under {}", .0.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", "))]
    MountsActive(Vec<PathBuf>),
    #[error("assembly cancelled")]
    Cancelled,
}
