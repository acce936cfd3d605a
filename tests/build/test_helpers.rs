//! Shared fixtures for build BDD scenarios.

use std::io;
use std::sync::Arc;

use kiln::test_support::{
    CallLog, FakeBackend, FakeConnector, FakePubSub, MemoryBlobStore, RecordingNotifier,
    ScriptTree,
};
use kiln::{BuildOutcome, ErrorKind};
use rstest::fixture;
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct BuildContext {
    pub log: CallLog,
    pub tree: Arc<ScriptTree>,
    pub backend: FakeBackend,
    pub connector: FakeConnector,
    pub pubsub: FakePubSub,
    pub store: MemoryBlobStore,
    pub notifier: RecordingNotifier,
    pub outcome: Option<BuildResult>,
}

#[derive(Clone, Debug)]
pub struct BuildFailure {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Clone, Debug)]
pub enum BuildResult {
    Success(BuildOutcome),
    Failure(BuildFailure),
}

#[derive(Debug, Error)]
pub enum BuildTestError {
    #[error("invalid build fixture: {0}")]
    Fixture(#[from] io::Error),
}

pub type BuildContextResult = Result<BuildContext, BuildTestError>;

#[fixture]
pub fn build_context_result() -> BuildContextResult {
    let log = CallLog::new();
    Ok(BuildContext {
        tree: Arc::new(ScriptTree::new()?),
        backend: FakeBackend::new(&log),
        connector: FakeConnector::new(&log),
        pubsub: FakePubSub::new(&log),
        store: MemoryBlobStore::new(&log),
        notifier: RecordingNotifier::new(),
        outcome: None,
        log,
    })
}

#[fixture]
pub fn build_context(build_context_result: BuildContextResult) -> BuildContext {
    build_context_result
        .unwrap_or_else(|err| panic!("build context fixture should initialise: {err}"))
}
