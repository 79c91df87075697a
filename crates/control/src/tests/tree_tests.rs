use super::*;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result as AnyResult;
use async_trait::async_trait;

const SAMPLE: &str = r#"
apparatus_id = "teststand"

[[subsystem]]
name = "readout"

  [[subsystem.app]]
  name = "ru01"
  host = "127.0.0.1"
  port = 3333

  [[subsystem.app]]
  name = "ru02"
  host = "127.0.0.1"
  port = 3334

[[subsystem]]
name = "trigger"

  [[subsystem.app]]
  name = "tr01"
  host = "127.0.0.1"
  port = 3401
"#;

fn apparatus() -> Apparatus {
    let config = ApparatusConfig::from_toml_str(SAMPLE).expect("config");
    Apparatus::from_config(&config)
}

#[derive(Default)]
struct TestProcessManager {
    running: AtomicBool,
}

#[async_trait]
impl ProcessManager for TestProcessManager {
    async fn boot(&self, _descriptors: &[Arc<AppDescriptor>], _timeout: Duration) -> AnyResult<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn terminate(&self) -> AnyResult<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_alive(&self, _app: &str) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn ping(&self, _app: &str) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[test]
fn builds_arena_from_config() {
    let apparatus = apparatus();
    assert_eq!(apparatus.apparatus_id(), "teststand");

    let readout = apparatus.find("readout").expect("readout group");
    let ru01 = apparatus.find("ru01").expect("ru01 leaf");
    assert_eq!(apparatus.node(readout).kind(), NodeKind::Group);
    assert_eq!(apparatus.node(ru01).kind(), NodeKind::Application);
    assert_eq!(apparatus.node(ru01).parent(), Some(readout));
    assert_eq!(apparatus.node(ru01).state(), FsmState::None);

    let status = apparatus.status();
    let groups: Vec<&str> = status.children.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(groups, ["readout", "trigger"]);
    assert_eq!(status.children[0].children.len(), 2);
}

#[test]
fn selects_whole_tree_and_subtrees() {
    let apparatus = apparatus();
    assert_eq!(apparatus.select(None).expect("whole tree").leaf_count(), 3);
    assert_eq!(
        apparatus.select(Some("teststand")).expect("by id").leaf_count(),
        3
    );
    assert_eq!(
        apparatus.select(Some("readout")).expect("subsystem").leaf_count(),
        2
    );
    assert_eq!(
        apparatus
            .select(Some("teststand/trigger/tr01"))
            .expect("single leaf")
            .leaf_count(),
        1
    );
    assert!(apparatus.select(Some("no_such_node")).is_err());
    assert!(apparatus.select(Some("readout/tr01")).is_err());
}

#[test]
fn gate_is_all_or_nothing() {
    let mut apparatus = apparatus();
    let selection = apparatus.select(None).expect("selection");

    apparatus.gate(&selection, CommandKind::Boot).expect("boot is legal from NONE");

    let err = apparatus
        .gate(&selection, CommandKind::Conf)
        .err()
        .expect("conf is illegal from NONE");
    assert_eq!(err.required, FsmState::Initial);
    // Every targeted node disagrees, groups included.
    assert_eq!(err.offenders.len(), 6);
    assert!(err.offenders.iter().any(|o| o == "ru01 (NONE)"));

    // One node out of step refuses the whole dispatch.
    apparatus.force_states(FsmState::Initial);
    let ru02 = apparatus.find("ru02").expect("ru02");
    apparatus.nodes[ru02.0].state = FsmState::None;
    let err = apparatus
        .gate(&selection, CommandKind::Conf)
        .err()
        .expect("one offender is enough");
    assert_eq!(err.offenders, ["ru02 (NONE)"]);
}

#[tokio::test]
async fn broadcast_without_supervisors_reports_not_booted() {
    let mut apparatus = apparatus();
    let selection = apparatus.select(Some("readout")).expect("selection");

    let report = apparatus
        .broadcast(
            &selection,
            CommandKind::Init,
            Map::new(),
            Duration::from_millis(100),
            false,
        )
        .await;
    assert_eq!(report.outcome(), CommandOutcome::Failure);
    assert!(report.ok.is_empty());
    let kinds: Vec<FailureKind> = report.failed.iter().map(|f| f.kind).collect();
    assert_eq!(kinds, [FailureKind::NotBooted, FailureKind::Skipped]);

    let forced = apparatus
        .broadcast(
            &selection,
            CommandKind::Init,
            Map::new(),
            Duration::from_millis(100),
            true,
        )
        .await;
    let kinds: Vec<FailureKind> = forced.failed.iter().map(|f| f.kind).collect();
    assert_eq!(kinds, [FailureKind::NotBooted, FailureKind::NotBooted]);

    // Failures never move states.
    let ru01 = apparatus.find("ru01").expect("ru01");
    assert_eq!(apparatus.node(ru01).state(), FsmState::None);
}

#[tokio::test]
async fn boot_and_terminate_drive_states_through_the_process_manager() {
    let mut apparatus = apparatus();
    let selection = apparatus.select(None).expect("selection");
    let pm = TestProcessManager::default();
    let listener = Arc::new(
        listener::ResponseListener::bind(0)
            .await
            .expect("bind listener"),
    );

    let report = apparatus
        .boot(&selection, &pm, &listener, Duration::from_secs(2), None, None)
        .await;
    assert!(report.all_ok(), "boot failed: {:?}", report.failed);
    assert_eq!(report.ok.len(), 3);

    // Leaves, groups and the root all reach INITIAL.
    let status = apparatus.status();
    assert_eq!(status.state, FsmState::Initial);
    assert_eq!(status.children[0].state, FsmState::Initial);
    assert_eq!(status.children[0].children[0].state, FsmState::Initial);

    let report = apparatus.terminate_apps(&selection, &pm).await;
    assert!(report.all_ok(), "terminate failed: {:?}", report.failed);
    assert_eq!(apparatus.status().state, FsmState::None);
}

#[tokio::test]
async fn boot_failure_marks_every_leaf() {
    let mut apparatus = apparatus();
    let selection = apparatus.select(None).expect("selection");
    let listener = Arc::new(
        listener::ResponseListener::bind(0)
            .await
            .expect("bind listener"),
    );

    let report = apparatus
        .boot(
            &selection,
            &crate::process::MissingProcessManager,
            &listener,
            Duration::from_secs(1),
            None,
            None,
        )
        .await;
    assert_eq!(report.outcome(), CommandOutcome::Failure);
    assert_eq!(report.failed.len(), 3);
    assert!(report
        .failed
        .iter()
        .all(|f| f.kind == FailureKind::NotAlive));
    assert_eq!(apparatus.status().state, FsmState::None);
}
