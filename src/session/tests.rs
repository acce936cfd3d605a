//! Unit tests for the build session state machine.

use std::time::{Duration, Instant};

use rstest::{fixture, rstest};

use super::*;
use crate::exec::StreamKind;
use crate::pubsub::PubSub;
use crate::test_support::{
    BackendStep, CallLog, FAKE_ADDRESS, FAKE_CREDENTIAL_ID, FAKE_INSTANCE_ID, FakeBackend,
    FakeConnector, FakePubSub, MemoryBlobStore, RecordingNotifier, ScriptTree, ScriptedChannel,
    test_settings,
};

type TestPipeline =
    BuildPipeline<FakeBackend, FakeConnector, FakePubSub, MemoryBlobStore, RecordingNotifier>;

struct Harness {
    log: CallLog,
    tree: ScriptTree,
    policy: TimeoutPolicy,
    backend: FakeBackend,
    connector: FakeConnector,
    pubsub: FakePubSub,
    store: MemoryBlobStore,
    notifier: RecordingNotifier,
}

impl Harness {
    fn pipeline(&self) -> TestPipeline {
        let mut settings = test_settings(self.tree.inputs());
        settings.policy = self.policy;
        BuildPipeline::new(
            settings,
            self.backend.clone(),
            self.connector.clone(),
            self.pubsub.clone(),
            self.store.clone(),
            self.notifier.clone(),
        )
    }

    async fn run(&self) -> Result<BuildOutcome, BuildError> {
        self.pipeline().run(RunMode::Execute).await
    }

    fn has_message(&self, text: &str) -> bool {
        self.notifier.messages().iter().any(|message| message == text)
    }

    fn has_message_containing(&self, fragment: &str) -> bool {
        self.notifier
            .messages()
            .iter()
            .any(|message| message.contains(fragment))
    }

    fn position(&self, entry: &str) -> usize {
        self.log
            .without_polls()
            .iter()
            .position(|recorded| recorded == entry)
            .unwrap_or_else(|| panic!("{entry} was never called: {:?}", self.log.entries()))
    }
}

#[fixture]
fn harness() -> Harness {
    let log = CallLog::new();
    Harness {
        tree: ScriptTree::new().expect("script tree should be created"),
        policy: crate::test_support::fast_policy(),
        backend: FakeBackend::new(&log),
        connector: FakeConnector::new(&log),
        pubsub: FakePubSub::new(&log),
        store: MemoryBlobStore::new(&log),
        notifier: RecordingNotifier::new(),
        log,
    }
}

#[rstest]
#[tokio::test]
async fn successful_run_provisions_executes_and_tears_down_in_order(harness: Harness) {
    let outcome = harness.run().await.expect("build should succeed");

    assert_eq!(
        harness.log.without_polls(),
        vec![
            "create_credential",
            "launch_instance",
            "subscribe updates:frontend-ssr-web:build_ready",
            "connect",
            "upload /root/initial_script.sh",
            "chmod /root/initial_script.sh",
            "exec sudo bash /root/initial_script.sh",
            "store builds/frontend-ssr-web/build-stdout.txt",
            "store builds/frontend-ssr-web/build-stderr.txt",
            "terminate_instance",
            "revoke_credential",
            "publish updates:frontend-ssr-web:do_update",
        ]
    );
    let BuildOutcome::Completed { session, logs } = outcome else {
        panic!("expected a completed build, got {outcome:?}");
    };
    assert_eq!(session.instance_id.as_deref(), Some(FAKE_INSTANCE_ID));
    assert_eq!(session.credential_id.as_deref(), Some(FAKE_CREDENTIAL_ID));
    assert_eq!(session.private_address, Some(FAKE_ADDRESS));
    assert_eq!(session.status, InstanceStatus::Running);
    assert_eq!(logs.result.stdout, "build ok\n");
    assert_eq!(logs.result.stderr, "warning: cache cold\n");
    assert_eq!(logs.bucket, "builds");
}

#[rstest]
#[tokio::test]
async fn uploads_the_rendered_script_and_stores_both_logs_durably(harness: Harness) {
    harness.run().await.expect("build should succeed");

    let expected = render_script(harness.tree.inputs()).expect("script should render");
    let uploads = harness.connector.uploads();
    assert_eq!(
        uploads,
        vec![(
            String::from("/root/initial_script.sh"),
            expected.into_bytes()
        )]
    );
    let blobs = harness.store.blobs();
    assert_eq!(blobs.len(), 2);
    assert!(blobs.iter().all(|blob| blob.synchronous && blob.bucket == "builds"));
    assert_eq!(
        harness.pubsub.published(),
        vec![(
            String::from("updates:frontend-ssr-web:do_update"),
            String::from(UPDATE_PAYLOAD)
        )]
    );
}

#[rstest]
#[tokio::test]
async fn narrates_progress_to_operators(harness: Harness) {
    harness.run().await.expect("build should succeed");

    let messages = harness.notifier.messages();
    assert!(
        messages
            .first()
            .is_some_and(|first| first.starts_with("Generated key pair key-frontend-ssr-web-build-")),
        "messages: {messages:?}"
    );
    assert!(harness.has_message("Launched instance srv-1"));
    assert!(harness.has_message("Instance srv-1 is now running"));
    assert!(harness.has_message("Build reported ready"));
    assert!(harness.has_message("Terminated instance srv-1"));
    assert_eq!(messages.last().map(String::as_str), Some("Build complete"));
}

#[rstest]
#[tokio::test]
async fn dry_run_renders_without_contacting_anything(harness: Harness) {
    let outcome = harness
        .pipeline()
        .run(RunMode::DryRun)
        .await
        .expect("dry run should succeed");

    let expected = render_script(harness.tree.inputs()).expect("script should render");
    assert_eq!(outcome, BuildOutcome::DryRunCompleted { script: expected });
    assert!(harness.log.entries().is_empty());
    assert!(harness.notifier.messages().is_empty());
}

#[rstest]
fn standalone_dry_run_matches_the_pipeline(harness: Harness) {
    let outcome = dry_run(&test_settings(harness.tree.inputs())).expect("dry run should succeed");

    let expected = render_script(harness.tree.inputs()).expect("script should render");
    assert_eq!(outcome, BuildOutcome::DryRunCompleted { script: expected });
    assert!(harness.log.entries().is_empty());
}

#[rstest]
fn standalone_dry_run_reports_unreadable_inputs(harness: Harness) {
    let mut settings = test_settings(harness.tree.inputs());
    settings.script.script_folder = settings.script.script_folder.join("absent");

    let err = dry_run(&settings).expect_err("missing folder should fail");

    assert_eq!(err.kind(), ErrorKind::Script);
}

#[rstest]
#[tokio::test]
async fn start_timeout_still_releases_instance_and_credential(mut harness: Harness) {
    harness.backend = harness.backend.clone().with_statuses([InstanceStatus::Pending]);

    let err = harness.run().await.expect_err("start should time out");

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(matches!(
        err,
        BuildError::Timeout {
            point: WaitPoint::InstanceStart,
            ..
        }
    ));
    assert!(harness.position("terminate_instance") < harness.position("revoke_credential"));
    assert_eq!(harness.log.count("connect"), 0);
    assert!(harness.pubsub.published().is_empty());
    assert!(harness.has_message("Timed out waiting for instance srv-1 to start"));
    assert!(harness.has_message_containing("build error in protected scope"));
}

#[rstest]
#[tokio::test]
async fn instance_lost_while_starting_fails_fast(mut harness: Harness) {
    harness.backend = harness
        .backend
        .clone()
        .with_statuses([InstanceStatus::Pending, InstanceStatus::NonExistent]);

    let err = harness.run().await.expect_err("start should fail");

    assert_eq!(err.kind(), ErrorKind::ProvisioningFailure);
    assert!(matches!(
        err,
        BuildError::InstanceLost {
            status: InstanceStatus::NonExistent,
            ..
        }
    ));
    assert_eq!(harness.log.count("terminate_instance"), 1);
    assert_eq!(harness.log.count("revoke_credential"), 1);
}

#[rstest]
#[tokio::test]
async fn running_without_address_is_a_provisioning_failure(mut harness: Harness) {
    harness.backend = harness.backend.clone().without_address();

    let err = harness.run().await.expect_err("run should fail");

    assert!(matches!(err, BuildError::MissingAddress { ref instance_id } if instance_id == "srv-1"));
    assert_eq!(harness.log.count("connect"), 0);
}

#[rstest]
#[tokio::test]
async fn readiness_timeout_after_script_skips_log_harvest(mut harness: Harness) {
    harness.pubsub = harness.pubsub.clone().silent();

    let err = harness.run().await.expect_err("readiness should time out");

    assert!(matches!(
        err,
        BuildError::Timeout {
            point: WaitPoint::Readiness,
            ..
        }
    ));
    assert_eq!(harness.log.count("exec sudo bash /root/initial_script.sh"), 1);
    assert!(harness.store.blobs().is_empty());
    assert!(harness.position("terminate_instance") < harness.position("revoke_credential"));
    assert!(harness.has_message("Timed out waiting for build to report ready"));
}

#[rstest]
#[tokio::test]
async fn script_timeout_is_reported_and_unwound(mut harness: Harness) {
    harness.connector = harness
        .connector
        .clone()
        .with_channel(ScriptedChannel::never_finishing());
    harness.policy.script_timeout = Duration::from_millis(50);
    harness.policy.command_timeout = Duration::from_millis(300);

    let err = harness.run().await.expect_err("script should time out");

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(matches!(
        err,
        BuildError::Timeout {
            point: WaitPoint::ScriptExecution,
            ..
        }
    ));
    assert_eq!(harness.log.count("terminate_instance"), 1);
    assert_eq!(harness.log.count("revoke_credential"), 1);
    assert!(harness.has_message("Timed out waiting for the provisioning script"));
}

#[rstest]
fn script_timeout_bounds_the_running_command(mut harness: Harness) {
    harness.connector = harness
        .connector
        .clone()
        .with_channel(ScriptedChannel::never_finishing());
    harness.policy.script_timeout = Duration::from_millis(50);
    harness.policy.command_timeout = Duration::from_secs(30);
    let runtime = tokio::runtime::Runtime::new().expect("runtime should start");
    let started = Instant::now();

    let err = runtime
        .block_on(harness.run())
        .expect_err("script should time out");
    drop(runtime);

    assert!(matches!(
        err,
        BuildError::Timeout {
            point: WaitPoint::ScriptExecution,
            ..
        }
    ));
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "shell worker outlived the run by {:?}",
        started.elapsed()
    );
}

#[rstest]
#[tokio::test]
async fn script_timeout_stops_connection_retries(mut harness: Harness) {
    harness.connector = harness.connector.clone().refusing(u32::MAX);
    harness.policy.connect_attempts = u32::MAX;
    harness.policy.connect_backoff = Duration::from_millis(5);
    harness.policy.script_timeout = Duration::from_millis(50);

    let err = harness.run().await.expect_err("script should time out");
    tokio::time::sleep(Duration::from_millis(30)).await;
    let attempts_after_timeout = harness.log.count("connect");
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(attempts_after_timeout > 0);
    assert_eq!(harness.log.count("connect"), attempts_after_timeout);
}

#[rstest]
#[tokio::test]
async fn engine_timeout_inside_script_budget_is_a_timeout(mut harness: Harness) {
    harness.connector = harness
        .connector
        .clone()
        .with_channel(ScriptedChannel::never_finishing());
    harness.policy.command_timeout = Duration::from_millis(30);

    let err = harness.run().await.expect_err("command should time out");

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(matches!(err, BuildError::Remote(_)), "unexpected error: {err}");
}

#[rstest]
#[tokio::test]
async fn refused_connections_are_retried(mut harness: Harness) {
    harness.connector = harness.connector.clone().refusing(2);

    harness.run().await.expect("third attempt should succeed");

    assert_eq!(harness.log.count("connect"), 3);
    assert_eq!(harness.connector.uploads().len(), 1);
}

#[rstest]
#[tokio::test]
async fn exhausted_connection_attempts_are_a_connectivity_failure(mut harness: Harness) {
    harness.connector = harness.connector.clone().refusing(10);

    let err = harness.run().await.expect_err("host should stay unreachable");

    assert_eq!(err.kind(), ErrorKind::ConnectivityFailure);
    assert!(matches!(err, BuildError::Unreachable { attempts: 3, .. }));
    assert_eq!(harness.log.count("connect"), 3);
    assert_eq!(harness.log.count("terminate_instance"), 1);
}

#[rstest]
#[tokio::test]
async fn launch_failure_only_revokes_the_credential(mut harness: Harness) {
    harness.backend = harness.backend.clone().failing_at(BackendStep::Launch);

    let err = harness.run().await.expect_err("launch should fail");

    assert_eq!(err.kind(), ErrorKind::ProvisioningFailure);
    assert_eq!(
        harness.log.entries(),
        vec!["create_credential", "launch_instance", "revoke_credential"]
    );
    assert!(harness.has_message_containing("Deleted key pair key-frontend-ssr-web-build-"));
}

#[rstest]
#[tokio::test]
async fn credential_failure_leaves_nothing_to_release(mut harness: Harness) {
    harness.backend = harness
        .backend
        .clone()
        .failing_at(BackendStep::CreateCredential);

    let err = harness.run().await.expect_err("credential should fail");

    assert!(matches!(
        err,
        BuildError::Provisioning {
            operation: "create credential",
            ..
        }
    ));
    assert_eq!(harness.log.entries(), vec!["create_credential"]);
}

#[rstest]
#[tokio::test]
async fn cleanup_failure_after_success_is_surfaced(mut harness: Harness) {
    harness.backend = harness.backend.clone().failing_at(BackendStep::Revoke);

    let err = harness.run().await.expect_err("cleanup should fail");

    assert_eq!(err.kind(), ErrorKind::CleanupFailure);
    assert!(err.trigger().is_none());
    assert!(
        matches!(err, BuildError::Cleanup { ref label, .. } if label.starts_with("revoke credential")),
        "unexpected error: {err}"
    );
    assert!(harness.pubsub.published().is_empty());
    assert!(harness.has_message_containing("revoke credential failed"));
}

#[rstest]
#[tokio::test]
async fn cleanup_failure_keeps_the_triggering_failure(mut harness: Harness) {
    harness.pubsub = harness.pubsub.clone().silent();
    harness.backend = harness.backend.clone().failing_at(BackendStep::Terminate);

    let err = harness.run().await.expect_err("run should fail");

    assert!(
        matches!(err, BuildError::Cleanup { ref label, .. } if label == "terminate instance srv-1"),
        "unexpected error: {err}"
    );
    assert!(matches!(
        err.trigger(),
        Some(BuildError::Timeout {
            point: WaitPoint::Readiness,
            ..
        })
    ));
    assert!(err.to_string().contains("unwinding after"));
    assert!(harness.position("terminate_instance") < harness.position("revoke_credential"));
    assert!(harness.has_message_containing("build error in protected scope: timed out"));
    assert!(harness.has_message_containing("terminate instance failed"));
}

#[rstest]
#[tokio::test]
async fn unconfirmed_termination_is_not_fatal(mut harness: Harness) {
    harness.backend = harness
        .backend
        .clone()
        .with_terminate_status(InstanceStatus::Pending);

    let outcome = harness.run().await.expect("build should still succeed");

    assert!(matches!(outcome, BuildOutcome::Completed { .. }));
    assert!(harness.has_message("Timed out waiting for instance srv-1 to terminate"));
    assert_eq!(harness.log.count("revoke_credential"), 1);
}

#[rstest]
#[tokio::test]
async fn non_zero_script_exit_does_not_fail_the_build(mut harness: Harness) {
    harness.connector = harness.connector.clone().with_channel(
        ScriptedChannel::finishing_after(1)
            .with_exit_code(2)
            .with_late(StreamKind::Stderr, "make: *** [all] Error 2\n"),
    );

    let outcome = harness.run().await.expect("build should complete");

    let BuildOutcome::Completed { logs, .. } = outcome else {
        panic!("expected a completed build");
    };
    assert_eq!(logs.result.exit_code, Some(2));
    assert_eq!(logs.result.stderr, "make: *** [all] Error 2\n");
}

#[rstest]
#[tokio::test]
async fn subscribe_failure_stops_before_connecting(mut harness: Harness) {
    harness.pubsub = harness.pubsub.clone().failing_subscribe();

    let err = harness.run().await.expect_err("subscribe should fail");

    assert_eq!(err.kind(), ErrorKind::ConnectivityFailure);
    assert_eq!(harness.log.count("connect"), 0);
    assert_eq!(harness.log.count("terminate_instance"), 1);
}

#[rstest]
#[tokio::test]
async fn storage_failure_is_surfaced_after_unwind(mut harness: Harness) {
    harness.store = MemoryBlobStore::failing(&harness.log);

    let err = harness.run().await.expect_err("harvest should fail");

    assert_eq!(err.kind(), ErrorKind::Storage);
    assert_eq!(harness.log.count("revoke_credential"), 1);
}

#[rstest]
#[tokio::test]
async fn failed_delivery_never_fails_the_build(mut harness: Harness) {
    harness.notifier = RecordingNotifier::failing();

    harness.run().await.expect("build should succeed");

    assert!(harness.has_message("Build complete"));
}

#[rstest]
#[case(false, RunMode::Execute)]
#[case(true, RunMode::DryRun)]
fn maps_dry_run_flag(#[case] flag: bool, #[case] expected: RunMode) {
    assert_eq!(RunMode::from_dry_run(flag), expected);
}

#[rstest]
#[tokio::test]
async fn cancelling_a_silent_readiness_wait_twice_ends_it(harness: Harness) {
    let subscription = harness
        .pubsub
        .clone()
        .silent()
        .subscribe("updates:frontend-ssr-web:build_ready")
        .await
        .expect("subscription should open");
    let readiness = ReadinessWait::spawn(
        subscription,
        String::from("updates:frontend-ssr-web:build_ready"),
    );
    let canceller = readiness.canceller();

    canceller.cancel();
    canceller.cancel();
    let result = readiness.wait(Duration::from_secs(5)).await;

    assert!(
        matches!(result, Err(BuildError::Worker(ref message)) if message.contains("cancelled")),
        "unexpected result: {result:?}"
    );
}

#[rstest]
#[tokio::test]
async fn cancelling_after_the_signal_keeps_the_payload(harness: Harness) {
    let subscription = harness
        .pubsub
        .subscribe("updates:frontend-ssr-web:build_ready")
        .await
        .expect("subscription should open");
    let readiness = ReadinessWait::spawn(
        subscription,
        String::from("updates:frontend-ssr-web:build_ready"),
    );
    let canceller = readiness.canceller();
    tokio::time::sleep(Duration::from_millis(20)).await;

    canceller.cancel();
    canceller.cancel();
    let result = readiness.wait(Duration::from_secs(5)).await;

    assert_eq!(result.ok().as_deref(), Some(UPDATE_PAYLOAD));
}

#[rstest]
fn timeout_message_keeps_sub_second_limits() {
    let err = BuildError::Timeout {
        point: WaitPoint::Readiness,
        timeout: Duration::from_millis(200),
    };

    assert_eq!(
        err.to_string(),
        "timed out after 200ms waiting for readiness signal"
    );
}
