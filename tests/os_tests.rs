
use std::time::Duration;

use remote_runner::error::RunnerError;
use remote_runner::remote::executor::{CommandExecutor, RunOptions};
use remote_runner::remote::ops::HostOps;
use remote_runner::remote::os::{self, RemoteOs, UNIX_PROBE, WINDOWS_PROBE};
use remote_runner::config::ConnectConfig;
use remote_runner::ssh::{ConnectionManager, ConnectionParams};
use test_harness::{
    capture_logs, connect_mock, fast_executor_config, MockHost, MockTransport, Reply,
};

fn test_executor() -> CommandExecutor {
    CommandExecutor::new(fast_executor_config())
}

#[tokio::test]
async fn test_detects_windows() {
    let host = MockHost::windows();
    let conn = connect_mock("win1", host.clone()).await;

    assert_eq!(os::detect(&test_executor(), &conn).await, RemoteOs::Windows);
    assert_eq!(host.executed(), vec![WINDOWS_PROBE.to_string()]);
}

#[tokio::test]
async fn test_detects_linux() {
    let host = MockHost::linux();
    host.reply(WINDOWS_PROBE, Reply::fail("sh: 1: ver: not found\n", 127));
    let conn = connect_mock("web1", host.clone()).await;

    assert_eq!(os::detect(&test_executor(), &conn).await, RemoteOs::Linux);
    assert_eq!(
        host.executed(),
        vec![WINDOWS_PROBE.to_string(), UNIX_PROBE.to_string()]
    );
}

#[tokio::test]
async fn test_unrecognized_output_is_unknown() {
    let host = MockHost::new();
    host.reply(UNIX_PROBE, Reply::ok("Darwin mac 23.1.0\n"));
    let conn = connect_mock("mac1", host).await;

    assert_eq!(os::detect(&test_executor(), &conn).await, RemoteOs::Unknown);
}

#[tokio::test]
async fn test_failing_probes_yield_unknown() {
    let host = MockHost::new();
    host.reply(WINDOWS_PROBE, Reply::hang());
    host.reply(UNIX_PROBE, Reply::hang());
    let conn = connect_mock("odd", host).await;

    let mut config = fast_executor_config();
    config.probe_timeout = Duration::from_millis(150);
    let executor = CommandExecutor::new(config);

    assert_eq!(os::detect(&executor, &conn).await, RemoteOs::Unknown);
}

#[tokio::test]
async fn test_resolve_caches_known_os() {
    let host = MockHost::linux();
    let conn = connect_mock("web1", host.clone()).await;
    let executor = test_executor();

    assert_eq!(os::resolve(&executor, &conn).await, RemoteOs::Linux);
    assert_eq!(os::resolve(&executor, &conn).await, RemoteOs::Linux);

    assert_eq!(host.count_executed(UNIX_PROBE), 1);
    assert_eq!(conn.cached_os(), Some(RemoteOs::Linux));
}

#[tokio::test]
async fn test_resolve_does_not_cache_unknown() {
    let host = MockHost::new();
    let conn = connect_mock("odd", host.clone()).await;
    let executor = test_executor();

    assert_eq!(os::resolve(&executor, &conn).await, RemoteOs::Unknown);
    assert_eq!(conn.cached_os(), None);

    host.reply(UNIX_PROBE, Reply::ok("Linux odd 5.15.0\n"));
    assert_eq!(os::resolve(&executor, &conn).await, RemoteOs::Linux);
    assert_eq!(host.count_executed(UNIX_PROBE), 2);
}

#[tokio::test]
async fn test_powershell_on_windows() {
    let host = MockHost::windows();
    host.reply("powershell -Command \"Get-Date\"", Reply::ok("Monday\r\n"));
    let conn = connect_mock("win1", host).await;

    let output = HostOps::new(test_executor())
        .run_powershell(&conn, "Get-Date", RunOptions::default())
        .await
        .unwrap();
    assert_eq!(output.stdout, "Monday\r\n");
}

#[tokio::test]
async fn test_powershell_on_linux_requires_pwsh() {
    let host = MockHost::linux();
    let conn = connect_mock("web1", host.clone()).await;
    let ops = HostOps::new(test_executor());

    let err = ops
        .run_powershell(&conn, "Get-Date", RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::Execution(ref m) if m.contains("pwsh")));

    host.reply("which pwsh", Reply::ok("/usr/bin/pwsh\n"));
    host.reply("pwsh -Command \"Get-Date\"", Reply::ok("Monday\n"));
    let output = ops
        .run_powershell(&conn, "Get-Date", RunOptions::default())
        .await
        .unwrap();
    assert_eq!(output.stdout, "Monday\n");
}

#[tokio::test]
async fn test_reboot_commands() {
    let linux = MockHost::linux();
    let conn = connect_mock("web1", linux.clone()).await;
    HostOps::new(test_executor()).reboot(&conn).await.unwrap();
    assert!(linux.executed().contains(&"sudo -S -p '' reboot".to_string()));
    assert_eq!(linux.stdin_for("sudo -S -p '' reboot").unwrap(), b"secret\n");

    let keyed = MockHost::linux();
    let manager = ConnectionManager::with_transport(
        MockTransport::with_host("web2", keyed.clone()),
        ConnectConfig::default(),
    );
    let conn = manager
        .open(ConnectionParams::with_key_file("web2", "deploy", "/keys/id_ed25519"))
        .await
        .unwrap();
    HostOps::new(test_executor()).reboot(&conn).await.unwrap();
    assert!(keyed.executed().contains(&"sudo -n reboot".to_string()));
    assert!(keyed.stdin_for("sudo -n reboot").is_none());

    let windows = MockHost::windows();
    let conn = connect_mock("win1", windows.clone()).await;
    HostOps::new(test_executor()).reboot(&conn).await.unwrap();
    assert!(windows.executed().contains(&"shutdown /r /t 0".to_string()));
}

#[tokio::test]
async fn test_reboot_keeps_password_out_of_logs_and_commands() {
    let host = MockHost::linux();
    let conn = connect_mock("web1", host.clone()).await;
    let (logs, _guard) = capture_logs();

    HostOps::new(test_executor()).reboot(&conn).await.unwrap();

    let logged = logs.contents();
    assert!(logged.contains("sudo -S -p '' reboot"), "{logged}");
    assert!(!logged.contains("secret"), "{logged}");
    assert!(host.executed().iter().all(|c| !c.contains("secret")));
}
