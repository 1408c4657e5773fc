use predicates::prelude::PredicateBooleanExt;
use std::os::unix::fs::PermissionsExt;

#[test]
fn check_tarpipe_help() {
    let mut cmd = assert_cmd::Command::cargo_bin("tarpipe").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("--create-zip"));
}

/// Source tree with a nested file, plus an empty directory standing in for the remote home.
fn setup_test_env() -> (tempfile::TempDir, tempfile::TempDir) {
    let src_dir = tempfile::tempdir().unwrap();
    let remote_dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(src_dir.path().join("sub")).unwrap();
    create_test_file(&src_dir.path().join("a.txt"), "alpha", 0o644);
    create_test_file(&src_dir.path().join("sub/run.sh"), "#!/bin/sh\n", 0o755);
    (src_dir, remote_dir)
}

fn create_test_file(path: &std::path::Path, content: &str, mode: u32) {
    std::fs::write(path, content).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
}

fn get_file_mode(path: &std::path::Path) -> u32 {
    std::fs::metadata(path).unwrap().permissions().mode() & 0o7777
}

fn get_file_content(path: &std::path::Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

fn tarpipe(src_dir: &tempfile::TempDir, remote_dir: &tempfile::TempDir) -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::cargo_bin("tarpipe").unwrap();
    cmd.current_dir(src_dir.path())
        .arg("--local-root")
        .arg(remote_dir.path());
    cmd
}

#[test]
fn test_upload_extracts_files() {
    let (src_dir, remote_dir) = setup_test_env();
    tarpipe(&src_dir, &remote_dir)
        .args(["--dest", "deploy/app", "a.txt", "sub"])
        .assert()
        .success()
        .stdout(predicates::str::contains("successfully uploaded to"));
    let app = remote_dir.path().join("deploy/app");
    assert_eq!(get_file_content(&app.join("a.txt")), "alpha");
    assert_eq!(get_file_content(&app.join("sub/run.sh")), "#!/bin/sh\n");
    assert_eq!(get_file_mode(&app.join("sub/run.sh")), 0o755);
}

#[test]
fn test_base_path_strips_prefix() {
    let (src_dir, remote_dir) = setup_test_env();
    tarpipe(&src_dir, &remote_dir)
        .args(["--dest", ".", "--base-path", "sub", "sub"])
        .assert()
        .success();
    assert!(remote_dir.path().join("run.sh").is_file());
    assert!(!remote_dir.path().join("sub").exists());
}

#[test]
fn test_plain_tar_stream() {
    let (src_dir, remote_dir) = setup_test_env();
    tarpipe(&src_dir, &remote_dir)
        .args(["--dest", "out", "--no-compress", "a.txt"])
        .assert()
        .success();
    assert_eq!(get_file_content(&remote_dir.path().join("out/a.txt")), "alpha");
}

#[test]
fn test_local_archives_are_delivered() {
    let (src_dir, remote_dir) = setup_test_env();
    tarpipe(&src_dir, &remote_dir)
        .args([
            "--dest",
            "app",
            "--create-zip",
            "--zip-name",
            "dist/bundle.zip",
            "--create-targz",
            "--targz-name",
            "dist/bundle.tar.gz",
            "--summary",
            "a.txt",
            "sub",
        ])
        .assert()
        .success()
        .stdout(predicates::str::contains("files archived: 2"));

    let zip_path = src_dir.path().join("dist/bundle.zip");
    let tgz_path = src_dir.path().join("dist/bundle.tar.gz");
    let mut zip = zip::ZipArchive::new(std::fs::File::open(&zip_path).unwrap()).unwrap();
    let mut names: Vec<String> = zip.file_names().map(String::from).collect();
    names.sort();
    assert_eq!(names, vec!["a.txt", "sub/run.sh"]);
    let mut content = String::new();
    std::io::Read::read_to_string(&mut zip.by_name("a.txt").unwrap(), &mut content).unwrap();
    assert_eq!(content, "alpha");

    let mut tgz = tar::Archive::new(flate2::read::GzDecoder::new(
        std::fs::File::open(&tgz_path).unwrap(),
    ));
    let tgz_names: Vec<String> = tgz
        .entries()
        .unwrap()
        .map(|entry| entry.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(tgz_names, vec!["a.txt", "sub/run.sh"]);

    let app = remote_dir.path().join("app");
    assert_eq!(get_file_content(&app.join("a.txt")), "alpha");
    assert_eq!(
        std::fs::read(app.join("bundle.zip")).unwrap(),
        std::fs::read(&zip_path).unwrap()
    );
    assert_eq!(
        std::fs::read(app.join("bundle.tar.gz")).unwrap(),
        std::fs::read(&tgz_path).unwrap()
    );
}

#[test]
fn test_missing_path_fails() {
    let (src_dir, remote_dir) = setup_test_env();
    tarpipe(&src_dir, &remote_dir)
        .args([
            "--dest",
            "app",
            "--create-zip",
            "--zip-name",
            "bundle.zip",
            "a.txt",
            "missing.txt",
        ])
        .assert()
        .failure()
        .stdout(predicates::str::contains("successfully uploaded").not())
        .stderr(predicates::str::contains("missing.txt"));
    assert!(!remote_dir.path().join("app/bundle.zip").exists());
}

#[test]
fn test_failure_is_reported_on_one_line() {
    let (src_dir, remote_dir) = setup_test_env();
    let output = tarpipe(&src_dir, &remote_dir)
        .args(["--dest", "app", "a.txt", "missing.txt"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert_eq!(stderr.lines().count(), 1, "unexpected stderr: {stderr}");
    assert!(stderr.contains("missing.txt"));
}

#[test]
fn test_artifact_inside_walked_directory_is_not_archived() {
    let (src_dir, remote_dir) = setup_test_env();
    tarpipe(&src_dir, &remote_dir)
        .args([
            "--dest",
            "app",
            "--create-targz",
            "--targz-name",
            "sub/../bundle.tar.gz",
            ".",
        ])
        .assert()
        .success();
    let mut tgz = tar::Archive::new(flate2::read::GzDecoder::new(
        std::fs::File::open(src_dir.path().join("bundle.tar.gz")).unwrap(),
    ));
    let mut names: Vec<String> = tgz
        .entries()
        .unwrap()
        .map(|entry| entry.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["a.txt", "sub/run.sh"]);
}

#[test]
fn test_paths_from_file() {
    let (src_dir, remote_dir) = setup_test_env();
    std::fs::write(src_dir.path().join("files.txt"), "a.txt\n\nsub/run.sh\n").unwrap();
    tarpipe(&src_dir, &remote_dir)
        .args(["--dest", "app", "--from-file", "files.txt"])
        .assert()
        .success();
    assert!(remote_dir.path().join("app/a.txt").is_file());
    assert!(remote_dir.path().join("app/sub/run.sh").is_file());
    assert!(!remote_dir.path().join("app/files.txt").exists());
}

#[test]
fn test_paths_conflict_with_from_file() {
    let (src_dir, remote_dir) = setup_test_env();
    tarpipe(&src_dir, &remote_dir)
        .args(["--dest", "app", "--from-file", "files.txt", "a.txt"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("cannot be used with"));
}

#[test]
fn test_zip_requires_name() {
    let (src_dir, remote_dir) = setup_test_env();
    tarpipe(&src_dir, &remote_dir)
        .args(["--dest", "app", "--create-zip", "a.txt"])
        .assert()
        .failure();
}

#[test]
fn test_no_overwrite_keeps_existing_archive() {
    let (src_dir, remote_dir) = setup_test_env();
    std::fs::write(src_dir.path().join("bundle.zip"), "old").unwrap();
    tarpipe(&src_dir, &remote_dir)
        .args([
            "--dest",
            "app",
            "--no-overwrite",
            "--create-zip",
            "--zip-name",
            "bundle.zip",
            "a.txt",
        ])
        .assert()
        .failure();
    assert_eq!(get_file_content(&src_dir.path().join("bundle.zip")), "old");
    assert!(!remote_dir.path().join("app/a.txt").exists());
}

#[test]
fn test_quiet_failure_prints_nothing() {
    let (src_dir, remote_dir) = setup_test_env();
    tarpipe(&src_dir, &remote_dir)
        .args(["--dest", "app", "-q", "missing.txt"])
        .assert()
        .failure()
        .stderr(predicates::str::is_empty());
}
