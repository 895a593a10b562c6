use std::path::PathBuf;
use std::sync::Arc;

use crate::catalog::{MemoryPolicyStore, Policy};
use crate::gateway::SandboxGateway;

use super::{Engine, EngineConfig};

pub(crate) fn wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("caravel_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{name}.wal"));
    let _ = std::fs::remove_file(&path);
    path
}

/// Engine with a fresh WAL, sandbox gateway and default policies.
pub(crate) async fn engine(name: &str) -> Engine {
    engine_with(name, EngineConfig::default()).await.0
}

/// Engine plus handles to its sandbox gateway and policy store, so tests can
/// script gateway failures, inspect refunds, and override policies.
pub(crate) async fn engine_with(
    name: &str,
    config: EngineConfig,
) -> (Engine, Arc<SandboxGateway>, Arc<MemoryPolicyStore>) {
    let gateway = Arc::new(SandboxGateway::new());
    let policies = Arc::new(MemoryPolicyStore::new(Policy::default()));
    let engine = Engine::new(wal_path(name), gateway.clone(), policies.clone(), config)
        .expect("test engine");
    (engine, gateway, policies)
}

/// Reopen an engine against an existing WAL (restart simulation).
pub(crate) async fn reopen(path: PathBuf) -> Engine {
    Engine::new(
        path,
        Arc::new(SandboxGateway::new()),
        Arc::new(MemoryPolicyStore::new(Policy::default())),
        EngineConfig::default(),
    )
    .expect("reopened engine")
}
