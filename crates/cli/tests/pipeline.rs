//! End-to-end tests: scripted source -> dispatch -> engine -> handlers

use cli_lib::{monitor, MonitorConfig};
use fanwatch_core::{Action, ActionKind, EventMask, OVERFLOW_REASON, UNCLASSIFIED_REASON};
use journal::ActionJournal;
use policy::ActionHandler;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use watcher::scripted::{MapResolver, RawEventBuilder, ScriptEnd, ScriptedSource, Step};
use watcher::{DispatchError, EventSource, LoopState};

const DATA_FD: i32 = 7;
const TMP_HANDLE: &[u8] = b"tmp-dir-handle";

fn config_text(extra: &str) -> String {
    format!(
        r#"
        [monitor]
        poll_timeout_ms = 10
        reconcile_interval_secs = 3600

        [[watch]]
        path = "/tmp"

        [[watch]]
        path = "/srv/data"
        events = ["modify", "close_write"]

        [[rule]]
        name = "tmp-create"
        patterns = ["/tmp/"]
        events = ["create"]
        action = "alert"
        reason = "new entry in /tmp"

        {}
        "#,
        extra
    )
}

/// Modify on /srv/data/report.csv, a queue overflow, then a create of /tmp/x
fn scripted(end: ScriptEnd) -> ScriptedSource {
    let resolver = MapResolver::new()
        .with_fd(DATA_FD, "/srv/data/report.csv")
        .with_handle(TMP_HANDLE, "/tmp");

    ScriptedSource::new()
        .with_resolver(resolver)
        .data(
            RawEventBuilder::new()
                .fd_event(EventMask::MODIFY, DATA_FD, 100)
                .build(),
        )
        .step(Step::Overflow)
        .data(
            RawEventBuilder::new()
                .name_event(EventMask::CREATE, 200, TMP_HANDLE, "x")
                .build(),
        )
        .ending(end)
}

#[derive(Clone, Default)]
struct Collected(Arc<Mutex<Vec<Action>>>);

impl Collected {
    fn snapshot(&self) -> Vec<Action> {
        self.0.lock().unwrap().clone()
    }

    fn wait_for(&self, count: usize) -> Vec<Action> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.0.lock().unwrap().len() < count {
            assert!(Instant::now() < deadline, "timed out waiting for {} actions", count);
            std::thread::sleep(Duration::from_millis(5));
        }
        self.snapshot()
    }
}

impl ActionHandler for Collected {
    fn handle(&mut self, action: &Action) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(action.clone());
        Ok(())
    }
}

fn summary(actions: &[Action]) -> Vec<(ActionKind, String, String)> {
    actions
        .iter()
        .map(|a| {
            (
                a.kind,
                a.record.path().display().to_string(),
                a.reason.clone(),
            )
        })
        .collect()
}

fn expected() -> Vec<(ActionKind, String, String)> {
    vec![
        (
            ActionKind::Log,
            "/srv/data/report.csv".to_string(),
            UNCLASSIFIED_REASON.to_string(),
        ),
        (ActionKind::Alert, String::new(), OVERFLOW_REASON.to_string()),
        (
            ActionKind::Alert,
            "/tmp/x".to_string(),
            "new entry in /tmp".to_string(),
        ),
    ]
}

#[test]
fn test_actions_arrive_in_order_and_stop_is_clean() {
    let config = MonitorConfig::from_toml_str(&config_text("")).unwrap();
    let collected = Collected::default();

    let running = monitor::start(
        scripted(ScriptEnd::Idle),
        &config,
        vec![Box::new(collected.clone())],
    )
    .unwrap();
    assert!(running.failed_watches().is_empty());
    assert_eq!(running.registry().list_active().len(), 2);

    let actions = collected.wait_for(3);
    assert_eq!(summary(&actions), expected());
    assert_eq!(actions[0].record.subject_pid, Some(100));
    assert_eq!(actions[2].rule.as_deref(), Some("tmp-create"));

    let registry = Arc::clone(running.registry());
    let stop = running.stop_handle();
    let report = running.shutdown().unwrap();

    assert_eq!(stop.state(), LoopState::Idle);
    assert_eq!(report.dispatch.events, 2);
    assert_eq!(report.dispatch.overflows, 1);
    assert_eq!(report.engine.processed, 3);
    assert_eq!(report.engine.alerts, 2);
    assert_eq!(report.drain.handled, 3);
    assert!(registry.list_all().is_empty());
}

#[test]
fn test_create_under_plain_watch_logs_once() {
    let config = MonitorConfig::from_toml_str(
        r#"
        [monitor]
        poll_timeout_ms = 10
        reconcile_interval_secs = 3600

        [[watch]]
        path = "/data"
        events = ["create", "delete"]
        recursive = false
        "#,
    )
    .unwrap();
    let source = ScriptedSource::new()
        .with_resolver(MapResolver::new().with_handle(b"data-dir", "/data"))
        .data(
            RawEventBuilder::new()
                .name_event(EventMask::CREATE, 300, b"data-dir", "new.txt")
                .build(),
        )
        .ending(ScriptEnd::Idle);
    let collected = Collected::default();

    let running = monitor::start(source, &config, vec![Box::new(collected.clone())]).unwrap();
    let watched = running.registry().list_active();
    assert_eq!(watched.len(), 1);
    assert_eq!(watched[0].mask, EventMask::CREATE | EventMask::DELETE);
    assert!(!watched[0].recursive);

    collected.wait_for(1);
    let report = running.shutdown().unwrap();

    assert_eq!(
        summary(&collected.snapshot()),
        vec![(
            ActionKind::Log,
            "/data/new.txt".to_string(),
            UNCLASSIFIED_REASON.to_string()
        )]
    );
    assert_eq!(report.engine.processed, 1);
    assert_eq!(report.engine.logged, 1);
}

#[test]
fn test_watch_added_while_running_reaches_source() {
    let config = MonitorConfig::from_toml_str(&config_text("")).unwrap();

    let running = monitor::start(ScriptedSource::new().ending(ScriptEnd::Idle), &config, Vec::new())
        .unwrap();

    running
        .registry()
        .add_watch("/var/log", EventMask::MODIFY, false)
        .unwrap();

    let source = running.registry().source();
    assert_eq!(source.lock().mark_of(Path::new("/var/log")), Some(EventMask::MODIFY));

    running.shutdown().unwrap();
    assert!(source.lock().is_closed());
}

#[test]
fn test_source_close_drains_then_fails() {
    let config = MonitorConfig::from_toml_str(&config_text("")).unwrap();
    let collected = Collected::default();

    let running = monitor::start(
        scripted(ScriptEnd::Close),
        &config,
        vec![Box::new(collected.clone())],
    )
    .unwrap();

    let err = running.wait().unwrap_err();

    let closed = err
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<DispatchError>(), Some(DispatchError::Closed)));
    assert!(closed, "unexpected error: {:#}", err);
    assert_eq!(monitor::exit_code(&err), 1);

    // Everything read before the failure was still classified and handled
    assert_eq!(summary(&collected.snapshot()), expected());
}

#[test]
fn test_failed_watch_does_not_stop_the_others() {
    let config = MonitorConfig::from_toml_str(&config_text("")).unwrap();
    let source = scripted(ScriptEnd::Idle).missing("/srv/data");

    let running = monitor::start(source, &config, Vec::new()).unwrap();

    let failed: Vec<_> = running
        .failed_watches()
        .iter()
        .map(|(path, err)| (path.clone(), err.is_not_found()))
        .collect();
    assert_eq!(failed, vec![(Path::new("/srv/data").to_path_buf(), true)]);
    assert_eq!(running.registry().list_active().len(), 1);

    running.shutdown().unwrap();
}

#[test]
fn test_journal_archives_alerts() {
    let temp_dir = TempDir::new().unwrap();
    let journal_dir = temp_dir.path().join("journal");
    let extra = format!(
        "[journal]\nenabled = true\npath = {:?}\n",
        journal_dir.display().to_string()
    );
    let config = MonitorConfig::from_toml_str(&config_text(&extra)).unwrap();

    let handler = cli_lib::JournalHandler::open(&journal_dir, config.retention()).unwrap();
    let running = monitor::start(scripted(ScriptEnd::Close), &config, vec![Box::new(handler)]).unwrap();
    assert!(running.wait().is_err());

    let journal = ActionJournal::open(&journal_dir).unwrap();
    let archived: Vec<(ActionKind, String)> = journal
        .last_n(10)
        .unwrap()
        .into_iter()
        .map(|entry| (entry.action.kind, entry.action.reason))
        .collect();
    assert_eq!(
        archived,
        vec![
            (ActionKind::Alert, OVERFLOW_REASON.to_string()),
            (ActionKind::Alert, "new entry in /tmp".to_string()),
        ]
    );
}

#[test]
fn test_drop_oldest_sink_config() {
    let config = MonitorConfig::from_toml_str(&config_text(
        "[sink]\ncapacity = 1\noverflow = \"drop-oldest\"\n",
    ))
    .unwrap();
    let collected = Collected::default();

    let running = monitor::start(
        scripted(ScriptEnd::Idle),
        &config,
        vec![Box::new(collected.clone())],
    )
    .unwrap();

    // Evictions depend on scheduling; the survivors keep their order
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let seen = collected.snapshot();
        if seen.last().map(|a| a.record.path() == Path::new("/tmp/x")).unwrap_or(false) {
            break;
        }
        assert!(Instant::now() < deadline, "last action never arrived");
        std::thread::sleep(Duration::from_millis(5));
    }

    let report = running.shutdown().unwrap();
    let seen = summary(&collected.snapshot());
    let all = expected();
    let positions: Vec<usize> = seen
        .iter()
        .map(|action| all.iter().position(|e| e == action).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(seen.len() as u64 + report.dropped_actions, 3);
}
