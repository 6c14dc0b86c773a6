mod support;

use fleet_warden::config::FleetConfig;
use fleet_warden::server::ServerStatus;
use fleet_warden::update::UpdateOutcome;
use fleet_warden::Error;
use std::path::Path;
use std::time::Duration;
use support::{Harness, RecordingTool, assert_subsequence, installed_server};
use tempfile::TempDir;

fn fleet_config(root: &Path, servers: &[(&str, u16, &str)]) -> FleetConfig {
    let mut config = FleetConfig::default();
    config.shutdown.timeout_secs = Some(300);
    config.backup.root = root.join("backups");
    config.servers = servers
        .iter()
        .map(|(name, port, build)| installed_server(root, name, *port, build))
        .collect();
    config
}

#[tokio::test(start_paused = true)]
async fn test_three_server_update_scenario() {
    let dir = TempDir::new().unwrap();
    let config = fleet_config(
        dir.path(),
        &[("alpha", 27020, "100"), ("beta", 27021, "200"), ("gamma", 27022, "100")],
    );
    let tool = RecordingTool::new(Duration::from_secs(30), Some("200"));
    let h = Harness::new(config, tool, Some("200"));

    h.bring_up("alpha", true).await;
    h.bring_up("gamma", false).await;
    assert_eq!(h.server("alpha").state().status(), ServerStatus::Running);
    assert_eq!(h.server("beta").state().status(), ServerStatus::Stopped);
    assert_eq!(h.server("gamma").state().status(), ServerStatus::Starting);

    let results = h.fleet.update_now().await.unwrap();
    assert_eq!(results.len(), 2);
    let outcome = |name: &str| {
        results
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.outcome.clone())
    };
    assert_eq!(outcome("alpha"), Some(UpdateOutcome::Updated { restarted: true }));
    assert_eq!(outcome("gamma"), Some(UpdateOutcome::Updated { restarted: false }));
    assert_eq!(outcome("beta"), None);

    // Server 1: graceful shutdown, update, relaunch, then the monitor sees RCON again.
    let alpha = h.server("alpha");
    assert_eq!(alpha.state().status(), ServerStatus::Starting);
    h.fleet.monitor().refresh(&alpha).await;
    assert_subsequence(
        &alpha.state().status_trail(),
        &[
            ServerStatus::Running,
            ServerStatus::UpdatePending,
            ServerStatus::Stopped,
            ServerStatus::Updating,
            ServerStatus::Stopped,
            ServerStatus::Running,
        ],
    );
    assert!(h.rcon.commands(27020).contains(&"DoExit".to_string()));

    // Server 2: untouched.
    let beta = h.server("beta");
    assert_eq!(beta.state().status_trail(), vec![ServerStatus::Stopped]);

    // Server 3: killed without a countdown, updated, left stopped.
    let gamma = h.server("gamma");
    assert_eq!(gamma.state().status(), ServerStatus::Stopped);
    assert_subsequence(
        &gamma.state().status_trail(),
        &[
            ServerStatus::Starting,
            ServerStatus::Stopped,
            ServerStatus::Updating,
            ServerStatus::Stopped,
        ],
    );
    assert!(!gamma.state().status_trail().contains(&ServerStatus::UpdatePending));
    assert_eq!(h.processes.kills(), vec!["gamma".to_string()]);

    assert_eq!(h.processes.launches(), vec!["alpha".to_string()]);
    assert_eq!(h.tool.calls().len(), 2);
    assert!(!alpha.state().update_available());
    assert!(!h.fleet.lock().is_held());
}

#[tokio::test(start_paused = true)]
async fn test_update_tool_never_runs_twice_at_once() {
    let dir = TempDir::new().unwrap();
    let config = fleet_config(
        dir.path(),
        &[("alpha", 27020, "1"), ("beta", 27021, "1"), ("gamma", 27022, "1"), ("delta", 27023, "1")],
    );
    let tool = RecordingTool::new(Duration::from_secs(60), Some("2"));
    let h = Harness::new(config, tool, Some("2"));
    for name in ["alpha", "beta", "gamma"] {
        h.bring_up(name, true).await;
    }

    let results = h.fleet.update_now().await.unwrap();

    assert_eq!(results.len(), 4);
    assert_eq!(h.tool.calls().len(), 4);
    assert_eq!(h.tool.max_concurrent(), 1);
    assert!(
        results
            .iter()
            .all(|r| matches!(r.outcome, UpdateOutcome::Updated { .. }))
    );
}

#[tokio::test(start_paused = true)]
async fn test_tool_timeout_leaves_server_in_error() {
    let dir = TempDir::new().unwrap();
    let mut config = fleet_config(dir.path(), &[("alpha", 27020, "1")]);
    config.update.tool_timeout_secs = 300;
    let tool = RecordingTool::new(Duration::from_secs(3600), Some("2"));
    let h = Harness::new(config, tool, Some("2"));
    h.bring_up("alpha", true).await;

    let results = h.fleet.update_now().await.unwrap();

    assert!(matches!(&results[0].outcome, UpdateOutcome::Failed(reason) if reason.contains("timed out")));
    let alpha = h.server("alpha");
    assert_eq!(alpha.state().status(), ServerStatus::Error);
    assert!(h.processes.launches().is_empty());
    assert!(h.notifier.posts().iter().any(|p| p.contains("alpha") && p.contains("failed")));
    assert!(!h.fleet.lock().is_held());

    // Error is terminal for the monitor.
    h.fleet.monitor().refresh(&alpha).await;
    assert_eq!(alpha.state().status(), ServerStatus::Error);
}

#[tokio::test(start_paused = true)]
async fn test_failed_tool_run_does_not_stop_the_others() {
    let dir = TempDir::new().unwrap();
    let config = fleet_config(dir.path(), &[("alpha", 27020, "1"), ("beta", 27021, "1")]);
    let tool = RecordingTool::new(Duration::from_secs(10), Some("2"));
    let h = Harness::new(config, tool, Some("2"));
    h.tool.fail_for(h.server("alpha").install_dir());

    let results = h.fleet.update_now().await.unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(h.server("alpha").state().status(), ServerStatus::Error);
    assert_eq!(h.server("beta").state().status(), ServerStatus::Stopped);
    assert!(!h.server("beta").state().update_available());
}

#[tokio::test(start_paused = true)]
async fn test_failed_relaunch_is_an_error() {
    let dir = TempDir::new().unwrap();
    let config = fleet_config(dir.path(), &[("alpha", 27020, "1")]);
    let h = Harness::new(config, RecordingTool::new(Duration::from_secs(5), Some("2")), Some("2"));
    h.bring_up("alpha", true).await;
    h.processes.fail_launches();

    let results = h.fleet.update_now().await.unwrap();

    assert!(matches!(&results[0].outcome, UpdateOutcome::Failed(_)));
    assert_eq!(h.server("alpha").state().status(), ServerStatus::Error);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_latest_build_updates_nothing() {
    let dir = TempDir::new().unwrap();
    let config = fleet_config(dir.path(), &[("alpha", 27020, "1")]);
    let h = Harness::new(config, RecordingTool::new(Duration::from_secs(5), None), None);

    let checks = h.fleet.check_updates().await;
    assert_eq!(checks.len(), 1);
    assert_eq!(checks[0].1.installed_build.as_deref(), Some("1"));
    assert!(!checks[0].1.update_available);

    assert!(h.fleet.update_now().await.unwrap().is_empty());
    assert!(h.tool.calls().is_empty());
}

#[tokio::test]
async fn test_update_refused_while_another_operation_runs() {
    let dir = TempDir::new().unwrap();
    let config = fleet_config(dir.path(), &[("alpha", 27020, "1")]);
    let h = Harness::new(config, RecordingTool::new(Duration::ZERO, Some("2")), Some("2"));

    let _guard = h.fleet.lock().try_acquire("backup").unwrap();
    match h.fleet.update_now().await {
        Err(Error::OperationInProgress(holder)) => assert_eq!(holder, "backup"),
        other => panic!("expected OperationInProgress, got {:?}", other.map(|r| r.len())),
    }
    assert!(h.tool.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_process_that_survives_shutdown_is_never_updated() {
    let dir = TempDir::new().unwrap();
    let config = fleet_config(dir.path(), &[("alpha", 27020, "1"), ("beta", 27021, "1")]);
    let h = Harness::new(config, RecordingTool::new(Duration::from_secs(5), Some("2")), Some("2"));
    h.bring_up("alpha", true).await;
    h.rcon.ignore_exit(27020);
    h.processes.make_unkillable("alpha");

    let results = h.fleet.update_now().await.unwrap();

    let alpha = results.iter().find(|r| r.name == "alpha").unwrap();
    assert!(
        matches!(&alpha.outcome, UpdateOutcome::Failed(reason) if reason.contains("still running"))
    );
    assert_eq!(h.server("alpha").state().status(), ServerStatus::Error);
    assert!(h.processes.is_running("alpha"));
    assert!(h.processes.launches().is_empty());

    // The tool only ran for beta.
    let alpha_dir = h.server("alpha").install_dir().to_path_buf();
    assert_eq!(h.tool.calls(), vec![h.server("beta").install_dir().to_path_buf()]);
    assert!(!h.tool.calls().contains(&alpha_dir));

    assert!(
        h.notifier
            .posts()
            .iter()
            .any(|p| p.contains("Update of alpha failed"))
    );
    assert!(!h.fleet.lock().is_held());
}
