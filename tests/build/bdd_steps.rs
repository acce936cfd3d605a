//! BDD step definitions for the `kiln` build workflow.

use kiln::test_support::{BackendStep, test_settings};
use kiln::{BuildOutcome, BuildPipeline, ErrorKind, RunMode};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{BuildContext, BuildFailure, BuildResult, BuildTestError};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Setup(#[from] BuildTestError),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a ready build workflow")]
fn ready_workflow(build_context: BuildContext) -> BuildContext {
    build_context
}

#[given("the provider rejects instance launches")]
fn launch_fails(mut build_context: BuildContext) -> BuildContext {
    build_context.backend = build_context.backend.failing_at(BackendStep::Launch);
    build_context
}

#[given("the provider rejects termination requests")]
fn terminate_fails(mut build_context: BuildContext) -> BuildContext {
    build_context.backend = build_context.backend.failing_at(BackendStep::Terminate);
    build_context
}

#[given("the build host never reports ready")]
fn never_ready(mut build_context: BuildContext) -> BuildContext {
    build_context.pubsub = build_context.pubsub.silent();
    build_context
}

#[given("the build host refuses \"{count}\" connections")]
fn refuses_connections(mut build_context: BuildContext, count: u32) -> BuildContext {
    build_context.connector = build_context.connector.refusing(count);
    build_context
}

#[when("I run the build")]
fn run_build(build_context: BuildContext) -> Result<BuildContext, StepError> {
    execute(build_context, RunMode::Execute)
}

#[when("I run the build as a dry run")]
fn run_dry(build_context: BuildContext) -> Result<BuildContext, StepError> {
    execute(build_context, RunMode::DryRun)
}

fn execute(build_context: BuildContext, mode: RunMode) -> Result<BuildContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let pipeline = BuildPipeline::new(
        test_settings(build_context.tree.inputs()),
        build_context.backend.clone(),
        build_context.connector.clone(),
        build_context.pubsub.clone(),
        build_context.store.clone(),
        build_context.notifier.clone(),
    );

    let result = runtime.block_on(async move { pipeline.run(mode).await });
    let outcome = match result {
        Ok(done) => BuildResult::Success(done),
        Err(err) => BuildResult::Failure(BuildFailure {
            kind: err.kind(),
            message: err.to_string(),
        }),
    };

    Ok(BuildContext {
        outcome: Some(outcome),
        ..build_context
    })
}

#[then("the build result is successful")]
fn build_success(build_context: &BuildContext) -> Result<(), StepError> {
    match build_context.outcome {
        Some(BuildResult::Success(_)) => Ok(()),
        Some(BuildResult::Failure(ref failure)) => Err(StepError::Assertion(format!(
            "expected success, got failure: {}",
            failure.message
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

#[then("the build error kind is \"{kind}\"")]
fn build_error_kind(build_context: &BuildContext, kind: String) -> Result<(), StepError> {
    let expected = parse_kind(&kind)?;
    let Some(BuildResult::Failure(failure)) = &build_context.outcome else {
        return Err(StepError::Assertion(String::from(
            "expected failure outcome",
        )));
    };
    if failure.kind == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected failure kind {expected:?}, got {:?} ({})",
            failure.kind, failure.message
        )))
    }
}

#[then("the build logs are stored")]
fn logs_stored(build_context: &BuildContext) -> Result<(), StepError> {
    let keys: Vec<String> = build_context
        .store
        .blobs()
        .into_iter()
        .map(|blob| blob.key)
        .collect();
    let expected = [
        "builds/frontend-ssr-web/build-stdout.txt",
        "builds/frontend-ssr-web/build-stderr.txt",
    ];
    if keys == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected logs {expected:?}, stored {keys:?}"
        )))
    }
}

#[then("the instance is terminated before the credential is revoked")]
fn terminated_then_revoked(build_context: &BuildContext) -> Result<(), StepError> {
    let entries = build_context.log.without_polls();
    let terminate = entries.iter().position(|entry| entry == "terminate_instance");
    let revoke = entries.iter().position(|entry| entry == "revoke_credential");
    match (terminate, revoke) {
        (Some(first), Some(second)) if first < second => Ok(()),
        _ => Err(StepError::Assertion(format!(
            "expected termination before revocation, calls were {entries:?}"
        ))),
    }
}

#[then("the credential is revoked")]
fn credential_revoked(build_context: &BuildContext) -> Result<(), StepError> {
    expect_count(build_context, "revoke_credential", 1)
}

#[then("the host was contacted \"{count}\" times")]
fn host_contacted(build_context: &BuildContext, count: usize) -> Result<(), StepError> {
    expect_count(build_context, "connect", count)
}

#[then("no provider operation is called")]
fn no_provider_calls(build_context: &BuildContext) -> Result<(), StepError> {
    let entries = build_context.log.entries();
    if entries.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no calls, got {entries:?}"
        )))
    }
}

#[then("the rendered script unpacks the bootstrap folder")]
fn script_unpacks_bootstrap(build_context: &BuildContext) -> Result<(), StepError> {
    let Some(BuildResult::Success(BuildOutcome::DryRunCompleted { script })) =
        &build_context.outcome
    else {
        return Err(StepError::Assertion(String::from(
            "expected a dry-run outcome",
        )));
    };
    if script.contains("mkdir -p bootstrap\n") && script.ends_with("bash main.sh\n") {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "unexpected script:\n{script}"
        )))
    }
}

#[then("downstream consumers are told about the new build")]
fn downstream_told(build_context: &BuildContext) -> Result<(), StepError> {
    let published = build_context.pubsub.published();
    let expected = vec![(
        String::from("updates:frontend-ssr-web:do_update"),
        String::from("1"),
    )];
    if published == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {expected:?}, published {published:?}"
        )))
    }
}

#[then("downstream consumers are not told about a new build")]
fn downstream_not_told(build_context: &BuildContext) -> Result<(), StepError> {
    let published = build_context.pubsub.published();
    if published.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no publication, got {published:?}"
        )))
    }
}

#[then("the operators are told the readiness wait timed out")]
fn operators_told_timeout(build_context: &BuildContext) -> Result<(), StepError> {
    let messages = build_context.notifier.messages();
    if messages
        .iter()
        .any(|message| message == "Timed out waiting for build to report ready")
    {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "missing timeout notification in {messages:?}"
        )))
    }
}

fn expect_count(build_context: &BuildContext, entry: &str, expected: usize) -> Result<(), StepError> {
    let actual = build_context.log.count(entry);
    if actual == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {expected} {entry} calls, got {actual}"
        )))
    }
}

fn parse_kind(raw: &str) -> Result<ErrorKind, StepError> {
    match raw {
        "provisioning" => Ok(ErrorKind::ProvisioningFailure),
        "timeout" => Ok(ErrorKind::Timeout),
        "connectivity" => Ok(ErrorKind::ConnectivityFailure),
        "remote" => Ok(ErrorKind::RemoteExecutionFailure),
        "cleanup" => Ok(ErrorKind::CleanupFailure),
        "storage" => Ok(ErrorKind::Storage),
        other => Err(StepError::Assertion(format!("unknown error kind {other}"))),
    }
}
