
use std::fs;
use std::sync::atomic::Ordering;

use remote_runner::error::RunnerError;
use remote_runner::remote::executor::CommandExecutor;
use remote_runner::remote::sync::FileSync;
use test_harness::{connect_mock, fast_executor_config, MockHost};

fn file_sync() -> FileSync {
    FileSync::new(CommandExecutor::new(fast_executor_config()))
}

fn scratch_suffix_ok(segment: &str, prefix: &str) -> bool {
    segment
        .strip_prefix(prefix)
        .map(|rest| rest.len() == 8 && rest.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or(false)
}

#[tokio::test]
async fn test_send_file_to_linux_scratch_dir() {
    let host = MockHost::linux();
    let conn = connect_mock("web1", host.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("job.py");
    fs::write(&local, b"print('hi')\n").unwrap();

    let remote = file_sync().send_file(&conn, &local, None).await.unwrap();

    let parts: Vec<&str> = remote.split('/').collect();
    assert_eq!(&parts[..3], &["", "home", "deploy"]);
    assert!(scratch_suffix_ok(parts[3], ".tmp_"), "scratch dir: {}", parts[3]);
    assert_eq!(parts[4], "job.py");
    assert_eq!(host.file(&remote).unwrap(), b"print('hi')\n");

    let scratch = format!("/home/deploy/{}", parts[3]);
    assert!(host.executed().contains(&format!("mkdir -p '{scratch}'")));
}

#[tokio::test]
async fn test_send_file_to_windows_scratch_dir() {
    let host = MockHost::windows();
    let conn = connect_mock("win1", host.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("job.py");
    fs::write(&local, b"print('hi')\r\n").unwrap();

    let remote = file_sync().send_file(&conn, &local, None).await.unwrap();

    let parts: Vec<&str> = remote.split('\\').collect();
    assert_eq!(&parts[..3], &["C:", "Users", "deploy"]);
    assert!(scratch_suffix_ok(parts[3], ".tmp_"), "scratch dir: {}", parts[3]);
    assert_eq!(parts[4], "job.py");
    assert!(host.file(&remote).is_some());
}

#[tokio::test]
async fn test_send_file_to_explicit_destination() {
    let host = MockHost::linux();
    let conn = connect_mock("web1", host.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("app.conf");
    fs::write(&local, b"port = 8080\n").unwrap();

    let remote = file_sync()
        .send_file(&conn, &local, Some("/opt/app"))
        .await
        .unwrap();

    assert_eq!(remote, "/opt/app/app.conf");
    assert_eq!(host.file("/opt/app/app.conf").unwrap(), b"port = 8080\n");
    assert!(!host.executed().contains(&"echo $HOME".to_string()));
}

#[tokio::test]
async fn test_send_missing_file_is_local_not_found() {
    let host = MockHost::linux();
    let conn = connect_mock("web1", host.clone()).await;
    let dir = tempfile::tempdir().unwrap();

    let err = file_sync()
        .send_file(&conn, &dir.path().join("missing.py"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::LocalNotFound(_)), "{err}");

    // A directory is not a file either.
    let err = file_sync()
        .send_file(&conn, dir.path(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::LocalNotFound(_)), "{err}");
    assert_eq!(host.sftp_opened.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_os_needs_explicit_destination() {
    let host = MockHost::new();
    let conn = connect_mock("odd", host.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("data.bin");
    fs::write(&local, [0u8, 1, 2, 3]).unwrap();

    let err = file_sync().send_file(&conn, &local, None).await.unwrap_err();
    assert!(matches!(err, RunnerError::Transfer(_)), "{err}");

    let remote = file_sync()
        .send_file(&conn, &local, Some("/srv/drop"))
        .await
        .unwrap();
    assert_eq!(remote, "/srv/drop/data.bin");
    assert_eq!(host.file(&remote).unwrap(), vec![0u8, 1, 2, 3]);
}

#[tokio::test]
async fn test_send_directory_mirrors_tree() {
    let host = MockHost::linux();
    let conn = connect_mock("web1", host.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let site = dir.path().join("site");
    fs::create_dir_all(site.join("css")).unwrap();
    fs::create_dir_all(site.join("uploads")).unwrap();
    fs::write(site.join("index.html"), b"<h1>hi</h1>").unwrap();
    fs::write(site.join("css").join("style.css"), b"body {}").unwrap();

    let root = file_sync()
        .send_directory(&conn, &site, None)
        .await
        .unwrap();

    let name = root.strip_prefix("/home/deploy/").unwrap();
    assert!(scratch_suffix_ok(name, ".tmp_site_"), "root: {root}");

    let files = host.files();
    assert_eq!(files.len(), 2);
    assert_eq!(files[&format!("{root}/index.html")], b"<h1>hi</h1>");
    assert_eq!(files[&format!("{root}/css/style.css")], b"body {}");

    let dirs = host.dirs();
    assert!(dirs.contains(&root));
    assert!(dirs.contains(&format!("{root}/css")));
    assert!(dirs.contains(&format!("{root}/uploads")), "empty dirs are kept");
}

#[cfg(unix)]
#[tokio::test]
async fn test_send_directory_skips_directory_links() {
    use std::os::unix::fs::symlink;

    let host = MockHost::linux();
    let conn = connect_mock("web1", host.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let app = dir.path().join("app");
    fs::create_dir_all(app.join("lib")).unwrap();
    fs::write(app.join("lib").join("core.py"), b"x = 1").unwrap();
    fs::write(dir.path().join("shared.env"), b"MODE=prod").unwrap();
    symlink(&app, app.join("lib").join("loop")).unwrap();
    symlink(dir.path().join("shared.env"), app.join("app.env")).unwrap();
    symlink(dir.path().join("gone"), app.join("dangling")).unwrap();

    let root = file_sync()
        .send_directory(&conn, &app, Some("/opt/app"))
        .await
        .unwrap();

    assert_eq!(root, "/opt/app");
    let files = host.files();
    assert_eq!(files.len(), 2, "{:?}", files.keys());
    assert_eq!(files["/opt/app/lib/core.py"], b"x = 1");
    assert_eq!(files["/opt/app/app.env"], b"MODE=prod");
    assert!(!host.dirs().contains("/opt/app/lib/loop"));
}

#[tokio::test]
async fn test_refused_sftp_breaks_connection() {
    let host = MockHost::linux();
    let conn = connect_mock("web1", host.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("notes.txt");
    fs::write(&local, b"notes").unwrap();

    host.drop_sessions();
    let err = file_sync()
        .receive_file(&conn, "/etc/hostname", &local)
        .await
        .unwrap_err();

    assert!(
        matches!(err, RunnerError::SessionLost { ref reason, .. } if reason.contains("SFTP")),
        "{err}"
    );
    assert!(conn.is_broken());
    assert_eq!(host.sftp_opened.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_send_directory_into_existing_destination() {
    let host = MockHost::linux();
    let conn = connect_mock("web1", host.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let conf = dir.path().join("conf");
    fs::create_dir_all(&conf).unwrap();
    fs::write(conf.join("a.toml"), b"a = 1").unwrap();

    let sync = file_sync();
    sync.send_directory(&conn, &conf, Some("/etc/app")).await.unwrap();
    fs::write(conf.join("a.toml"), b"a = 2").unwrap();
    let root = sync.send_directory(&conn, &conf, Some("/etc/app")).await.unwrap();

    assert_eq!(root, "/etc/app");
    assert_eq!(host.file("/etc/app/a.toml").unwrap(), b"a = 2");
}

#[tokio::test]
async fn test_send_directory_rejects_file() {
    let host = MockHost::linux();
    let conn = connect_mock("web1", host).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("plain.txt");
    fs::write(&local, b"x").unwrap();

    let err = file_sync()
        .send_directory(&conn, &local, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::Transfer(_)));
}

#[tokio::test]
async fn test_sftp_session_released_on_failure() {
    let host = MockHost::linux();
    host.fail_uploads.store(true, Ordering::SeqCst);
    let conn = connect_mock("web1", host.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("job.py");
    fs::write(&local, b"pass\n").unwrap();
    fs::create_dir_all(dir.path().join("tree")).unwrap();
    fs::write(dir.path().join("tree").join("f"), b"f").unwrap();

    let sync = file_sync();
    let err = sync.send_file(&conn, &local, None).await.unwrap_err();
    assert!(matches!(err, RunnerError::Transfer(ref m) if m.contains("permission denied")));
    let err = sync
        .send_directory(&conn, &dir.path().join("tree"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::Transfer(_)));

    assert_eq!(host.sftp_opened.load(Ordering::SeqCst), 2);
    assert_eq!(host.sftp_released.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_receive_file() {
    let host = MockHost::linux();
    host.put_file("/var/log/app.log", b"started\nready\n");
    let conn = connect_mock("web1", host.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("app.log");

    let sync = file_sync();
    let bytes = sync
        .receive_file(&conn, "/var/log/app.log", &local)
        .await
        .unwrap();
    assert_eq!(bytes, 14);
    assert_eq!(fs::read(&local).unwrap(), b"started\nready\n");

    let err = sync
        .receive_file(&conn, "/var/log/missing.log", &local)
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::Transfer(_)));
    assert_eq!(
        host.sftp_opened.load(Ordering::SeqCst),
        host.sftp_released.load(Ordering::SeqCst)
    );
}
