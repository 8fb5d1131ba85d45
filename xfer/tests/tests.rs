use assert_cmd::cargo::CommandCargoExt;
use predicates::prelude::PredicateBooleanExt;
use predicates::str::contains;

fn xfer() -> assert_cmd::Command {
    assert_cmd::Command::cargo_bin("xfer").unwrap()
}

fn setup_test_env() -> (tempfile::TempDir, tempfile::TempDir) {
    let src_dir = tempfile::tempdir().unwrap();
    let dst_dir = tempfile::tempdir().unwrap();
    (src_dir, dst_dir)
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ seed).collect()
}

fn path_str(path: &std::path::Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn check_xfer_help() {
    xfer()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("Transfer options").and(contains("Daemon mode")));
}

#[test]
fn copies_a_single_file_to_a_fresh_target() {
    let (src_dir, dst_dir) = setup_test_env();
    let data = pattern(5 * 1024, 0);
    let src_file = src_dir.path().join("five.bin");
    std::fs::write(&src_file, &data).unwrap();
    let dst_file = dst_dir.path().join("copy").join("five.bin");
    xfer()
        .args(["--summary", path_str(&src_file), path_str(&dst_file)])
        .assert()
        .success()
        .stdout(contains("files transferred: 1").and(contains("files skipped: 0")));
    assert_eq!(std::fs::read(&dst_file).unwrap(), data);
}

#[test]
fn single_file_into_an_existing_directory() {
    let (src_dir, dst_dir) = setup_test_env();
    let src_file = src_dir.path().join("note.txt");
    std::fs::write(&src_file, "note").unwrap();
    xfer()
        .args([path_str(&src_file), path_str(dst_dir.path())])
        .assert()
        .success();
    assert_eq!(
        std::fs::read_to_string(dst_dir.path().join("note.txt")).unwrap(),
        "note"
    );
}

#[test]
fn resumes_a_partial_copy() {
    let (src_dir, dst_dir) = setup_test_env();
    let data = pattern(3 * 1024 * 1024, 7);
    let src_file = src_dir.path().join("big.bin");
    let dst_file = dst_dir.path().join("big.bin");
    std::fs::write(&src_file, &data).unwrap();
    std::fs::write(&dst_file, &data[..1024 * 1024]).unwrap();
    xfer()
        .args(["--summary", path_str(&src_file), path_str(&dst_file)])
        .assert()
        .success()
        .stdout(contains("files resumed: 1").and(contains("files restarted: 0")));
    assert_eq!(std::fs::read(&dst_file).unwrap(), data);
}

#[test]
fn larger_destination_is_restarted() {
    let (src_dir, dst_dir) = setup_test_env();
    let src_file = src_dir.path().join("shrunk.txt");
    let dst_file = dst_dir.path().join("shrunk.txt");
    std::fs::write(&src_file, "new and short").unwrap();
    std::fs::write(&dst_file, "the old version was a lot longer").unwrap();
    xfer()
        .args(["--summary", path_str(&src_file), path_str(&dst_file)])
        .assert()
        .success()
        .stdout(contains("files restarted: 1"));
    assert_eq!(std::fs::read_to_string(&dst_file).unwrap(), "new and short");
}

#[test]
fn same_size_different_content_is_rewritten() {
    let (src_dir, dst_dir) = setup_test_env();
    let src_file = src_dir.path().join("same.txt");
    let dst_file = dst_dir.path().join("same.txt");
    std::fs::write(&src_file, "aaaa").unwrap();
    std::fs::write(&dst_file, "bbbb").unwrap();
    xfer()
        .args([path_str(&src_file), path_str(&dst_file)])
        .assert()
        .success();
    assert_eq!(std::fs::read_to_string(&dst_file).unwrap(), "aaaa");
}

#[test]
fn directory_with_many_files_and_workers() {
    let (src_dir, dst_dir) = setup_test_env();
    for idx in 0..100 {
        let dir = src_dir.path().join(format!("d{}", idx % 7));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("f{idx}.bin")), pattern(idx * 31, idx as u8)).unwrap();
    }
    let target = dst_dir.path().join("mirror");
    xfer()
        .args(["-n", "4", "--summary", path_str(src_dir.path()), path_str(&target)])
        .assert()
        .success()
        .stdout(contains("files transferred: 100").and(contains("files failed: 0")));
    for idx in 0..100 {
        let relative = format!("d{}/f{idx}.bin", idx % 7);
        assert_eq!(
            std::fs::read(target.join(&relative)).unwrap(),
            pattern(idx * 31, idx as u8),
            "{relative}"
        );
    }
    // a second run finds everything in place
    xfer()
        .args(["-n", "4", "--summary", path_str(src_dir.path()), path_str(&target)])
        .assert()
        .success()
        .stdout(contains("files skipped: 100").and(contains("files transferred: 0")));
}

#[test]
fn hidden_entries_are_skipped_on_request() {
    let (src_dir, dst_dir) = setup_test_env();
    std::fs::create_dir_all(src_dir.path().join(".cache")).unwrap();
    std::fs::write(src_dir.path().join(".cache").join("blob"), "x").unwrap();
    std::fs::write(src_dir.path().join(".profile"), "x").unwrap();
    std::fs::write(src_dir.path().join("visible.txt"), "v").unwrap();
    let skipped = dst_dir.path().join("skipped");
    xfer()
        .args(["--skip-hidden", path_str(src_dir.path()), path_str(&skipped)])
        .assert()
        .success();
    assert!(skipped.join("visible.txt").exists());
    assert!(!skipped.join(".profile").exists());
    assert!(!skipped.join(".cache").exists());
    let everything = dst_dir.path().join("everything");
    xfer()
        .args([path_str(src_dir.path()), path_str(&everything)])
        .assert()
        .success();
    assert!(everything.join(".cache").join("blob").exists());
    assert!(everything.join(".profile").exists());
}

#[test]
fn missing_source_fails() {
    let (src_dir, dst_dir) = setup_test_env();
    xfer()
        .args([
            path_str(&src_dir.path().join("nope")),
            path_str(dst_dir.path()),
        ])
        .assert()
        .failure()
        .code(1)
        .stderr(contains("does not exist"));
}

#[test]
fn unsupported_scheme_fails() {
    let dst_dir = tempfile::tempdir().unwrap();
    xfer()
        .args(["gopher://example.com/file", path_str(dst_dir.path())])
        .assert()
        .failure()
        .code(1)
        .stderr(contains("unsupported scheme"));
}

#[test]
fn target_ending_with_dot_is_rejected() {
    let (src_dir, dst_dir) = setup_test_env();
    let target = format!("{}/.", path_str(dst_dir.path()));
    xfer()
        .args([path_str(src_dir.path()), &target])
        .assert()
        .failure()
        .stderr(contains("cannot end with '.'"));
}

#[test]
fn zero_concurrency_is_rejected() {
    let (src_dir, dst_dir) = setup_test_env();
    std::fs::write(src_dir.path().join("a"), "a").unwrap();
    xfer()
        .args(["-n", "0", path_str(src_dir.path()), path_str(dst_dir.path())])
        .assert()
        .failure()
        .stderr(contains("concurrency must be at least 1"));
}

#[test]
fn daemon_requires_a_target() {
    let src_dir = tempfile::tempdir().unwrap();
    xfer()
        .args(["--daemon", path_str(src_dir.path())])
        .assert()
        .failure()
        .stderr(contains("--daemon requires a TARGET"));
}

#[test]
fn invalid_daemon_time_is_a_usage_error() {
    let (src_dir, dst_dir) = setup_test_env();
    xfer()
        .args([
            "--daemon",
            "--daemon-at",
            "7pm",
            path_str(src_dir.path()),
            path_str(dst_dir.path()),
        ])
        .assert()
        .failure()
        .stderr(contains("HH:MM"));
}

struct ServerProcess(std::process::Child);

impl Drop for ServerProcess {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn wait_for_port(port: u16) {
    for _ in 0..100 {
        if std::net::TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
    panic!("server on port {port} did not come up");
}

#[test]
fn upload_to_and_download_from_a_serving_instance() {
    let (src_dir, served_dir) = setup_test_env();
    std::fs::create_dir_all(src_dir.path().join("sub")).unwrap();
    std::fs::write(src_dir.path().join("a.txt"), "alpha").unwrap();
    std::fs::write(src_dir.path().join("sub").join("b.bin"), pattern(70_000, 3)).unwrap();
    let port = free_port();
    let _server = ServerProcess(
        std::process::Command::cargo_bin("xfer")
            .unwrap()
            .args([
                "--quiet",
                path_str(served_dir.path()),
                "--server",
                &format!("127.0.0.1:{port}"),
            ])
            .spawn()
            .unwrap(),
    );
    wait_for_port(port);
    let url = format!("http://127.0.0.1:{port}/incoming");
    xfer()
        .args(["-n", "2", "--summary", path_str(src_dir.path()), &url])
        .assert()
        .success()
        .stdout(contains("files transferred: 2"));
    assert_eq!(
        std::fs::read(served_dir.path().join("incoming").join("sub").join("b.bin")).unwrap(),
        pattern(70_000, 3)
    );
    let back = tempfile::tempdir().unwrap();
    xfer()
        .args([&url, path_str(back.path())])
        .assert()
        .success();
    assert_eq!(
        std::fs::read_to_string(back.path().join("a.txt")).unwrap(),
        "alpha"
    );
    xfer()
        .args([&format!("http://127.0.0.1:{port}/../etc/passwd"), path_str(back.path())])
        .assert()
        .failure();
}
