//! Multi-actor registration and convergence on a simulated participant list

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use canvas_e2e::actors::{ActorIdentity, ActorScript, ConvergenceProbe, LaunchMode, MultiActorSynchronizer};
use canvas_e2e::spec::ScenarioStep;
use canvas_e2e::testing::{FakeBrowser, FakePage};
use canvas_e2e::{E2eError, Page, ReadinessCondition, ReadinessProber};

const PARTICIPANTS: &str = r#"[data-testid="participant-name"]"#;
const SUPERHEROES: [(&str, &str, &str); 5] = [
    ("Spider-Man", "spiderman@example.com", "US"),
    ("Wonder Woman", "wonderwoman@example.com", "GR"),
    ("Black Panther", "blackpanther@example.com", "KE"),
    ("Captain Marvel", "captainmarvel@example.com", "US"),
    ("Green Lantern", "greenlantern@example.com", "US"),
];

/// Shared session state: registering broadcasts the name to every open page
/// after a propagation delay, and the newcomer also receives everyone
/// registered before it. Pages labelled in `deaf` never receive broadcasts.
/// With `registered_only`, pages that have not registered yet miss them too.
#[derive(Default)]
struct Session {
    pages: Mutex<Vec<FakePage>>,
    registered: Mutex<Vec<String>>,
    deaf: HashSet<String>,
    registered_only: bool,
}

fn session_browser(deaf: &[&str]) -> (FakeBrowser, Arc<Session>) {
    browser_for(Session {
        deaf: deaf.iter().map(|d| d.to_string()).collect(),
        ..Default::default()
    })
}

fn browser_for(session: Session) -> (FakeBrowser, Arc<Session>) {
    let session = Arc::new(session);
    let shared = Arc::clone(&session);

    let browser = FakeBrowser::with_setup(move |page| {
        shared.pages.lock().push(page.clone());
        let session = Arc::clone(&shared);
        page.on_action("#register", move |p, _| {
            let name = p.value_of("#name").unwrap_or_default();
            let earlier = session.registered.lock().clone();
            session.registered.lock().push(name.clone());

            let deaf = session.deaf.clone();
            let pages = session.pages.lock().clone();
            let newcomer = p.label().to_string();
            let session = Arc::clone(&session);
            p.after(Duration::from_millis(400), move |_| {
                let registered = session.registered.lock().clone();
                for page in &pages {
                    if deaf.contains(page.label()) {
                        continue;
                    }
                    if session.registered_only && !registered.iter().any(|r| r == page.label()) {
                        continue;
                    }
                    page.push_text(PARTICIPANTS, &name);
                    if page.label() == newcomer {
                        for other in &earlier {
                            page.push_text(PARTICIPANTS, other);
                        }
                    }
                }
            });
        });
    });
    (browser, session)
}

fn registration_steps() -> Vec<ScenarioStep> {
    vec![
        ScenarioStep::Navigate {
            url: "/user/landing/{token}".to_string(),
            ready: vec![],
        },
        ScenarioStep::Fill {
            selector: "#name".to_string(),
            value: "{name}".to_string(),
            blazor: true,
        },
        ScenarioStep::Fill {
            selector: "#email".to_string(),
            value: "{email}".to_string(),
            blazor: false,
        },
        ScenarioStep::Click {
            selector: "#register".to_string(),
        },
    ]
}

fn scripts(count: usize) -> Vec<ActorScript> {
    SUPERHEROES[..count]
        .iter()
        .map(|(name, email, country)| ActorScript {
            identity: ActorIdentity::new(name, email, country, "DPH42JR5"),
            steps: registration_steps(),
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn five_superheroes_converge() {
    let (browser, session) = session_browser(&[]);
    let prober = ReadinessProber::default();
    let probe = ConvergenceProbe::new(PARTICIPANTS, Duration::from_secs(10));

    let outcomes = MultiActorSynchronizer::new(&browser, &prober, probe)
        .base_url("https://localhost:9091")
        .run_concurrent_actors(scripts(5))
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 5);
    for outcome in &outcomes {
        assert!(outcome.succeeded(), "{} did not converge: {:?}", outcome.actor, outcome.peer_checks);
        assert_eq!(outcome.peer_checks.len(), 4);
        assert!(outcome.peer_checks.iter().all(|c| c.peer == outcome.actor));
    }
    assert_eq!(session.registered.lock().len(), 5);

    let page = browser.page("Wonder Woman").unwrap();
    assert_eq!(page.current_url().as_deref(), Some("https://localhost:9091/user/landing/DPH42JR5"));
    assert!(page.actions().contains(&"fill #name=Wonder Woman".to_string()));
    assert!(browser.pages().iter().all(|p| p.is_closed()));
}

#[tokio::test(start_paused = true)]
async fn stale_observer_fails_each_pair_separately() {
    let (browser, _session) = session_browser(&["Black Panther"]);
    let prober = ReadinessProber::default();
    let probe = ConvergenceProbe::new(PARTICIPANTS, Duration::from_secs(3));

    let outcomes = MultiActorSynchronizer::new(&browser, &prober, probe)
        .run_concurrent_actors(scripts(5))
        .await
        .unwrap();

    let failures: Vec<E2eError> = outcomes.iter().flat_map(|o| o.failures()).collect();
    assert_eq!(failures.len(), 4);
    for failure in &failures {
        match failure {
            E2eError::ConvergenceTimeout {
                observer,
                peer,
                elapsed_ms,
            } => {
                assert_eq!(observer, "Black Panther");
                assert_ne!(peer, "Black Panther");
                assert!(*elapsed_ms >= 3_000);
            }
            other => panic!("unexpected failure {}", other),
        }
    }

    // Everyone else still sees the stale actor register
    let panther = outcomes.iter().find(|o| o.actor == "Black Panther").unwrap();
    assert!(panther.succeeded());
    assert!(outcomes.iter().all(|o| o.completed));
}

#[tokio::test(start_paused = true)]
async fn staggered_actors_see_earlier_arrivals() {
    let (browser, _session) = session_browser(&[]);
    let prober = ReadinessProber::default();
    let probe = ConvergenceProbe::new(PARTICIPANTS, Duration::from_secs(5));

    let outcomes = MultiActorSynchronizer::new(&browser, &prober, probe)
        .mode(LaunchMode::Staggered)
        .run_concurrent_actors(scripts(3))
        .await
        .unwrap();

    let checks: usize = outcomes.iter().map(|o| o.peer_checks.len()).sum();
    assert_eq!(checks, 6);
    assert!(outcomes.iter().all(|o| o.succeeded()));

    // The last arrival was checked for seeing both earlier actors
    let third = &outcomes[2].actor;
    let observed_by_third: usize = outcomes
        .iter()
        .flat_map(|o| o.peer_checks.iter())
        .filter(|c| &c.observer == third)
        .count();
    assert_eq!(observed_by_third, 2);
}

#[tokio::test(start_paused = true)]
async fn failed_script_is_reported_without_peer_checks() {
    let (browser, _session) = session_browser(&[]);
    let prober = ReadinessProber::new(Duration::from_secs(1), Duration::from_millis(100));
    let probe = ConvergenceProbe::new(PARTICIPANTS, Duration::from_secs(2));

    let mut scripts = scripts(2);
    scripts[1].steps.insert(
        0,
        ScenarioStep::Wait {
            condition: ReadinessCondition::visible("#maintenance-banner"),
            timeout_ms: None,
        },
    );

    let outcomes = MultiActorSynchronizer::new(&browser, &prober, probe)
        .run_concurrent_actors(scripts)
        .await
        .unwrap();

    assert!(outcomes[0].completed);
    assert!(!outcomes[1].completed);
    assert!(outcomes[1].error.as_deref().unwrap_or_default().contains("maintenance-banner"));
    assert!(outcomes[0].peer_checks.is_empty());
    assert!(outcomes[1].peer_checks.is_empty());
}

#[tokio::test(start_paused = true)]
async fn late_finisher_gets_the_full_window_to_converge() {
    let (browser, _session) = browser_for(Session {
        registered_only: true,
        ..Default::default()
    });
    let prober = ReadinessProber::default();
    let probe = ConvergenceProbe::new(PARTICIPANTS, Duration::from_secs(3));

    // Wonder Woman only registers once Spider-Man's window would long be over
    let mut scripts = scripts(2);
    scripts[1].steps.insert(0, ScenarioStep::Sleep { ms: 5_000 });

    let outcomes = MultiActorSynchronizer::new(&browser, &prober, probe)
        .run_concurrent_actors(scripts)
        .await
        .unwrap();

    for outcome in &outcomes {
        assert!(outcome.succeeded(), "{} did not converge: {:?}", outcome.actor, outcome.peer_checks);
        assert_eq!(outcome.peer_checks.len(), 1);
        assert!(outcome.peer_checks[0].elapsed_ms < 3_000);
    }
}
