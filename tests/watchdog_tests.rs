mod support;

use async_trait::async_trait;
use fleet_warden::config::{ConfigHandle, FleetConfig};
use fleet_warden::error::{Error, Result};
use fleet_warden::notify::{Attachment, Notifier};
use fleet_warden::server::{ManagedServer, ServerStatus};
use fleet_warden::watchdog::{CsvGraphRenderer, GraphRenderer, ReportOutcome, WatchdogReporter, status_table};
use fleet_warden::OperationLock;
use mockall::{Sequence, mock};
use std::path::Path;
use std::sync::Arc;
use support::installed_server;
use tempfile::TempDir;

mock! {
    pub Channel {}

    #[async_trait]
    impl Notifier for Channel {
        async fn post(&self, content: &str) -> Result<String>;
        async fn edit(&self, message_id: &str, content: &str) -> Result<()>;
        async fn delete(&self, message_id: &str) -> Result<()>;
        async fn post_attachment(&self, content: &str, attachment: Attachment) -> Result<String>;
    }
}

fn fleet_config(root: &Path, graph_interval_secs: u64) -> FleetConfig {
    let mut config = FleetConfig::default();
    config.watchdog.interval_secs = 60;
    config.watchdog.graph_interval_secs = graph_interval_secs;
    config.servers = vec![installed_server(root, "island", 27020, "1")];
    let mut retired = installed_server(root, "retired", 27021, "1");
    retired.active = false;
    config.servers.push(retired);
    config
}

fn reporter(
    channel: MockChannel,
    config: ConfigHandle,
    lock: OperationLock,
) -> WatchdogReporter {
    let servers = config
        .read()
        .servers
        .iter()
        .cloned()
        .map(|c| Arc::new(ManagedServer::new(c)))
        .collect();
    WatchdogReporter::new(
        Arc::new(channel),
        config,
        lock,
        servers,
        Arc::new(CsvGraphRenderer),
    )
}

#[tokio::test]
async fn test_status_message_posted_then_edited_then_reposted() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fleet.json");
    fleet_config(dir.path(), 0).save_to_file(&path).unwrap();
    let config = ConfigHandle::load(&path).unwrap();

    let mut channel = MockChannel::new();
    let mut seq = Sequence::new();
    channel
        .expect_post()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|content| {
            assert!(content.contains("island"));
            assert!(!content.contains("retired"));
            Ok("100".to_string())
        });
    channel
        .expect_edit()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|id, _| {
            assert_eq!(id, "100");
            Ok(())
        });
    channel
        .expect_edit()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|id, _| Err(Error::MessageNotFound(id.to_string())));
    channel
        .expect_post()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Ok("101".to_string()));
    channel.expect_delete().never();
    channel.expect_post_attachment().never();

    let reporter = reporter(channel, config.clone(), OperationLock::new());

    assert_eq!(
        reporter.report_once().await.unwrap(),
        ReportOutcome::Posted("100".to_string())
    );
    assert_eq!(
        FleetConfig::from_file(&path)
            .unwrap()
            .watchdog
            .status_message_id
            .as_deref(),
        Some("100")
    );

    assert_eq!(
        reporter.report_once().await.unwrap(),
        ReportOutcome::Edited("100".to_string())
    );
    assert_eq!(
        reporter.report_once().await.unwrap(),
        ReportOutcome::Reposted("101".to_string())
    );
    assert_eq!(
        config.read().watchdog.status_message_id.as_deref(),
        Some("101")
    );
    assert_eq!(
        FleetConfig::from_file(&path)
            .unwrap()
            .watchdog
            .status_message_id
            .as_deref(),
        Some("101")
    );
}

#[tokio::test]
async fn test_other_edit_failures_keep_the_remembered_id() {
    let dir = TempDir::new().unwrap();
    let mut config = fleet_config(dir.path(), 0);
    config.watchdog.status_message_id = Some("100".to_string());
    let config = ConfigHandle::in_memory(config);

    let mut channel = MockChannel::new();
    channel
        .expect_edit()
        .times(1)
        .returning(|_, _| Err(Error::Notification("429 Too Many Requests".to_string())));
    channel.expect_post().never();

    let reporter = reporter(channel, config.clone(), OperationLock::new());

    assert!(matches!(
        reporter.report_once().await,
        Err(Error::Notification(_))
    ));
    assert_eq!(
        config.read().watchdog.status_message_id.as_deref(),
        Some("100")
    );
}

#[tokio::test]
async fn test_nothing_sent_while_an_operation_runs() {
    let dir = TempDir::new().unwrap();
    let config = ConfigHandle::in_memory(fleet_config(dir.path(), 60));

    let mut channel = MockChannel::new();
    channel.expect_post().never();
    channel.expect_edit().never();
    channel.expect_delete().never();
    channel.expect_post_attachment().never();

    let lock = OperationLock::new();
    let reporter = reporter(channel, config, lock.clone());
    let _guard = lock.try_acquire("update").unwrap();

    assert_eq!(reporter.report_once().await.unwrap(), ReportOutcome::Skipped);
}

#[tokio::test]
async fn test_graphs_are_deleted_and_posted_again() {
    let dir = TempDir::new().unwrap();
    let mut config = fleet_config(dir.path(), 120);
    config.watchdog.status_message_id = Some("100".to_string());
    config.watchdog.graph_message_id = Some("200".to_string());
    let config = ConfigHandle::in_memory(config);

    let mut channel = MockChannel::new();
    let mut seq = Sequence::new();
    channel.expect_edit().times(2).returning(|_, _| Ok(()));
    channel
        .expect_delete()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|id| {
            assert_eq!(id, "200");
            Err(Error::MessageNotFound(id.to_string()))
        });
    channel
        .expect_post_attachment()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|content, attachment| {
            assert_eq!(content, "Fleet performance");
            assert_eq!(attachment.file_name, "fleet-metrics.csv");
            Ok("201".to_string())
        });
    channel.expect_post().never();

    let reporter = reporter(channel, config.clone(), OperationLock::new());

    // Graphs every second cycle.
    reporter.report_once().await.unwrap();
    assert_eq!(
        config.read().watchdog.graph_message_id.as_deref(),
        Some("200")
    );
    reporter.report_once().await.unwrap();
    assert_eq!(
        config.read().watchdog.graph_message_id.as_deref(),
        Some("201")
    );
}

#[test]
fn test_status_table_lists_active_installed_servers() {
    let dir = TempDir::new().unwrap();
    let config = fleet_config(dir.path(), 0);
    let mut missing = installed_server(dir.path(), "ghost", 27022, "1");
    missing.install_dir = dir.path().join("not-installed");

    let servers: Vec<Arc<ManagedServer>> = config
        .servers
        .into_iter()
        .chain(std::iter::once(missing))
        .map(|c| Arc::new(ManagedServer::new(c)))
        .collect();
    servers[0]
        .state()
        .set_status(ServerStatus::Updating, None)
        .unwrap();

    let table = status_table(&servers);

    assert!(table.contains("island"));
    assert!(table.contains("Updating"));
    assert!(!table.contains("retired"));
    assert!(!table.contains("ghost"));
    assert!(table.ends_with("```"));
}

#[test]
fn test_csv_renderer_writes_one_row_per_sample() {
    let attachment = CsvGraphRenderer.render(&[]).unwrap();
    let csv = String::from_utf8(attachment.bytes).unwrap();
    assert_eq!(csv, "server,taken_at,cpu_percent,memory_mb,players\n");
}
