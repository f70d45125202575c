//! CLI Tests
//!
//! Runs the `cloud-bridge` binary against the in-process store.

#[cfg(test)]
mod tests {
    use assert_cmd::Command;
    use predicates::prelude::*;
    use std::io::Write;

    fn cli() -> Command {
        let mut cmd = Command::cargo_bin("cloud-bridge").unwrap();
        cmd.env("RUST_LOG", "error");
        cmd
    }

    #[test]
    fn test_help_lists_commands() {
        cli()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("upload"))
            .stdout(predicate::str::contains("list-buckets"));
    }

    #[test]
    fn test_upload_prints_key_and_bucket() {
        let mut file = tempfile::Builder::new().suffix(".txt").tempfile().unwrap();
        file.write_all(b"hello from the cli").unwrap();

        let name = file.path().file_name().unwrap().to_string_lossy().into_owned();

        for mode in ["worker_pool", "executor"] {
            cli()
                .args(["--memory", "--mode", mode, "upload", "cli-bucket"])
                .arg(file.path())
                .args(["--upload-path", "incoming"])
                .assert()
                .success()
                .stdout(predicate::str::contains(format!("incoming/{}", name)))
                .stdout(predicate::str::contains("\"Bucket\": \"cli-bucket\""));
        }
    }

    #[test]
    fn test_upload_with_metrics() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 128]).unwrap();

        cli()
            .args(["--memory", "--print-metrics", "upload", "m"])
            .arg(file.path())
            .args(["--key", "blob.bin"])
            .assert()
            .success()
            .stdout(predicate::str::contains("cloud_bridge_uploads_total"))
            .stdout(predicate::str::contains("cloud_bridge_dispatch_total"));
    }

    #[test]
    fn test_get_missing_object_fails() {
        let out = tempfile::TempDir::new().unwrap();
        cli()
            .args(["--memory", "get", "nowhere", "missing.txt"])
            .arg(out.path().join("missing.txt"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("NoSuchBucket"));
    }

    #[test]
    fn test_list_buckets_on_fresh_store() {
        cli()
            .args(["--memory", "list-buckets"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"Buckets\": []"));
    }

    #[test]
    fn test_invalid_mode_rejected() {
        cli()
            .args(["--memory", "--mode", "green", "list-buckets"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown dispatch mode"));
    }

    #[test]
    fn test_missing_config_file_fails() {
        cli()
            .args(["--config", "/nonexistent/cloud-bridge.yaml", "list-buckets"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to read config file"));
    }
}
