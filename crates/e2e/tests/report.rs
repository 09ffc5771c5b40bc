//! Scenario recording, soft versus hard checks and the JSON report

use canvas_e2e::report::{ArtifactKind, Report, ReportSink, ScenarioRecorder, ScenarioStatus};
use canvas_e2e::testing::{FakePage, FAKE_PNG};
use canvas_e2e::E2eError;

#[tokio::test]
async fn soft_checks_do_not_fail_the_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let mut recorder = ScenarioRecorder::start("host transcript", dir.path()).unwrap();

    assert!(!recorder.soft_check("transcript panel visible", false));
    assert!(!recorder.soft_check("share button enabled", false));
    assert!(recorder.soft_check("session title shown", true));
    assert_eq!(recorder.status(), ScenarioStatus::Running);

    let result = recorder.finish().unwrap();
    assert_eq!(result.status, ScenarioStatus::Passed);
    assert_eq!(
        result.soft_notes,
        vec!["transcript panel visible".to_string(), "share button enabled".to_string()]
    );
    assert!(result.failures.is_empty());
}

#[tokio::test]
async fn hard_failure_captures_page_context() {
    let dir = tempfile::tempdir().unwrap();
    let page = FakePage::new("host");
    page.set_texts("h1", &["Host Control Panel"]);
    let mut recorder = ScenarioRecorder::start("Host Session Opener", dir.path()).unwrap();

    let err = recorder
        .hard_check(Some(&page), "session opener visible", false)
        .await
        .unwrap_err();
    assert!(matches!(err, E2eError::AssertionFailed(_)));
    assert_eq!(recorder.status(), ScenarioStatus::Failed);

    let result = recorder.finish().unwrap();
    assert_eq!(result.status, ScenarioStatus::Failed);
    assert_eq!(result.failures, vec!["Assertion failed: session opener visible".to_string()]);

    let screenshot = result.artifact("host-session-opener-failure-1.png").unwrap();
    assert_eq!(screenshot.kind, ArtifactKind::Screenshot);
    assert_eq!(std::fs::read(&screenshot.path).unwrap(), FAKE_PNG);
    let snapshot = result.artifact("host-session-opener-failure-1.html").unwrap();
    assert!(std::fs::read_to_string(&snapshot.path).unwrap().contains("Host Control Panel"));
}

#[tokio::test]
async fn terminal_states_are_final() {
    let dir = tempfile::tempdir().unwrap();
    let mut recorder = ScenarioRecorder::start("participants", dir.path()).unwrap();

    recorder
        .error(None, &E2eError::FixtureUnavailable("database down".to_string()))
        .await
        .unwrap();
    assert_eq!(recorder.status(), ScenarioStatus::Errored);

    let again = recorder.fail(None, &E2eError::AssertionFailed("late".to_string())).await;
    assert!(matches!(again, Err(E2eError::InvalidTransition { .. })));

    let result = recorder.finish().unwrap();
    assert_eq!(result.status, ScenarioStatus::Errored);
    assert_eq!(result.failures.len(), 1);
}

#[tokio::test]
async fn failures_accumulate_on_a_failed_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let mut recorder = ScenarioRecorder::start("convergence", dir.path()).unwrap();

    for peer in ["Spider-Man", "Green Lantern"] {
        let err = E2eError::ConvergenceTimeout {
            observer: "Black Panther".to_string(),
            peer: peer.to_string(),
            elapsed_ms: 10_000,
        };
        recorder.record_error(None, &err).await.unwrap();
    }

    let result = recorder.finish().unwrap();
    assert_eq!(result.status, ScenarioStatus::Failed);
    assert_eq!(result.failures.len(), 2);
}

#[tokio::test]
async fn artifacts_are_write_once() {
    let dir = tempfile::tempdir().unwrap();
    let page = FakePage::new("user");
    let mut recorder = ScenarioRecorder::start("landing", dir.path()).unwrap();

    recorder.attach_screenshot(&page, "landing.png").await.unwrap();
    let second = recorder.attach_screenshot(&page, "landing.png").await;
    assert!(matches!(second, Err(E2eError::ArtifactExists(_))));
}

#[tokio::test]
async fn report_totals_and_file() {
    let dir = tempfile::tempdir().unwrap();
    let sink = ReportSink::new();

    let passed = ScenarioRecorder::start("a", dir.path()).unwrap().finish().unwrap();
    sink.record("user-landing", passed).unwrap();

    let mut failing = ScenarioRecorder::start("b", dir.path()).unwrap();
    failing
        .fail(None, &E2eError::AssertionFailed("no participants".to_string()))
        .await
        .unwrap();
    sink.record("participant-list", failing.finish().unwrap()).unwrap();

    let report = sink.flush();
    assert_eq!((report.total, report.passed, report.failed, report.errored), (2, 1, 1, 0));
    assert!(!report.success());

    let path = report.write(dir.path()).unwrap();
    assert!(path.ends_with("test-results.json"));
    let written: Report = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(written.run_id, report.run_id);
    assert_eq!(written.results[1].name, "participant-list");
    assert_eq!(written.results[1].status, ScenarioStatus::Failed);
}
