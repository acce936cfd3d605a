//! Unit tests for the cleanup stack.

use std::sync::{Arc, Mutex, PoisonError};

use rstest::rstest;
use thiserror::Error;

use super::*;
use crate::test_support::RecordingObserver;

#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{0}")]
struct TestError(&'static str);

type Journal = Arc<Mutex<Vec<usize>>>;

fn journal_entries(journal: &Journal) -> Vec<usize> {
    journal
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

fn push_recording<'a>(
    stack: &mut CleanupStack<'a, TestError>,
    journal: &Journal,
    index: usize,
    failure: Option<&'static str>,
) {
    let entries = Arc::clone(journal);
    stack.push(format!("action-{index}"), move || async move {
        entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(index);
        failure.map_or(Ok(()), |message| Err(TestError(message)))
    });
}

fn stack_with(
    journal: &Journal,
    failures: &[Option<&'static str>],
) -> CleanupStack<'static, TestError> {
    let mut stack = CleanupStack::new();
    for (index, failure) in failures.iter().enumerate() {
        push_recording(&mut stack, journal, index, *failure);
    }
    stack
}

#[rstest]
#[case::normal_exit(Ok(7))]
#[case::failed_scope(Err(TestError("body")))]
#[tokio::test]
async fn runs_every_action_once_in_reverse_order(#[case] outcome: Result<i32, TestError>) {
    let journal = Journal::default();
    let stack = stack_with(&journal, &[None, None, None, None]);
    let observer = RecordingObserver::new();

    let result = stack.unwind(outcome.clone(), &observer).await;

    assert_eq!(journal_entries(&journal), vec![3, 2, 1, 0]);
    match outcome {
        Ok(value) => assert_eq!(result.ok(), Some(value)),
        Err(expected) => assert!(
            matches!(result, Err(UnwindError::Body(ref err)) if *err == expected),
            "unexpected result: {result:?}"
        ),
    }
}

#[tokio::test]
async fn continues_after_a_failing_action_and_surfaces_it() {
    let journal = Journal::default();
    let stack = stack_with(&journal, &[None, None, Some("revoke failed"), None]);
    let observer = RecordingObserver::new();

    let result = stack.unwind(Ok(()), &observer).await;

    assert_eq!(journal_entries(&journal), vec![3, 2, 1, 0]);
    match result {
        Err(UnwindError::Cleanup {
            label,
            failure,
            trigger,
        }) => {
            assert_eq!(label, "action-2");
            assert_eq!(failure, TestError("revoke failed"));
            assert!(trigger.is_none());
        }
        other => panic!("expected cleanup failure, got {other:?}"),
    }
    assert_eq!(observer.messages(), vec![String::from("revoke failed")]);
}

#[tokio::test]
async fn last_cleanup_failure_wins_over_the_trigger() {
    let journal = Journal::default();
    let stack = stack_with(&journal, &[None, Some("terminate failed"), None]);
    let observer = RecordingObserver::new();

    let result = stack
        .unwind::<()>(Err(TestError("readiness timed out")), &observer)
        .await;

    match result {
        Err(UnwindError::Cleanup {
            label,
            failure,
            trigger,
        }) => {
            assert_eq!(label, "action-1");
            assert_eq!(failure, TestError("terminate failed"));
            assert_eq!(trigger, Some(TestError("readiness timed out")));
        }
        other => panic!("expected cleanup failure, got {other:?}"),
    }
    assert_eq!(
        observer.messages(),
        vec![
            String::from("readiness timed out"),
            String::from("terminate failed"),
        ],
        "the trigger is reported before the unwind starts"
    );
}

#[tokio::test]
async fn every_failure_is_reported_and_the_last_one_is_returned() {
    let journal = Journal::default();
    let stack = stack_with(&journal, &[Some("first"), Some("second"), Some("third")]);
    let observer = RecordingObserver::new();

    let result = stack.unwind(Ok(()), &observer).await;

    assert_eq!(journal_entries(&journal), vec![2, 1, 0]);
    assert!(
        matches!(result, Err(UnwindError::Cleanup { ref failure, .. }) if *failure == TestError("first")),
        "action-0 runs last so its failure is surfaced: {result:?}"
    );
    assert_eq!(
        observer.messages(),
        vec![
            String::from("third"),
            String::from("second"),
            String::from("first"),
        ]
    );
}

#[tokio::test]
async fn empty_stack_passes_the_outcome_through() {
    let stack: CleanupStack<'_, TestError> = CleanupStack::new();
    let observer = RecordingObserver::new();

    assert!(stack.is_empty());
    let result = stack.unwind(Ok("done"), &observer).await;

    assert_eq!(result.ok(), Some("done"));
    assert!(observer.messages().is_empty());
}

#[rstest]
fn labels_follow_registration_order() {
    let journal = Journal::default();
    let stack = stack_with(&journal, &[None, None]);

    assert_eq!(stack.len(), 2);
    assert_eq!(stack.labels(), vec!["action-0", "action-1"]);
}

#[rstest]
fn debug_lists_registered_labels() {
    let journal = Journal::default();
    let stack = stack_with(&journal, &[None, None]);

    assert_eq!(
        format!("{stack:?}"),
        r#"CleanupStack { labels: ["action-0", "action-1"] }"#
    );
}

#[rstest]
fn inspection_does_not_require_an_error_bound() {
    let stack: CleanupStack<'_, String> = CleanupStack::default();

    assert!(stack.is_empty());
    assert_eq!(stack.len(), 0);
    assert_eq!(format!("{stack:?}"), "CleanupStack { labels: [] }");
}
