use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn erp_store(dir: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::cargo_bin("erp-store").unwrap();
    cmd.arg("--data-dir")
        .arg(dir)
        .arg("--key-backend")
        .arg("file")
        .env_remove("ERP_DATA_DIR")
        .env_remove("ERP_MASTER_KEY_BACKEND");
    cmd
}

fn stdout_json(output: &[u8]) -> serde_json::Value {
    serde_json::from_slice(output).expect("stdout is json")
}

#[test]
fn init_creates_encrypted_store() {
    let dir = tempdir().unwrap();
    let out = erp_store(dir.path()).arg("init").assert().success();
    let value = stdout_json(&out.get_output().stdout);
    assert_eq!(value["settingsCreated"], true);
    assert_eq!(value["schemaVersion"], 2);

    assert!(dir.path().join("erp.realm").exists());
    assert!(dir.path().join("REALM_DB_MASTER_KEY.key").exists());
    let prefs = fs::read_to_string(dir.path().join("ENCRYPTED_REALM_PREFS_FILE_NAME.json")).unwrap();
    assert!(!prefs.contains("ENCRYPTED_REALM_PASSWORD_KEY"));

    let out = erp_store(dir.path()).arg("init").assert().success();
    assert_eq!(stdout_json(&out.get_output().stdout)["settingsCreated"], false);
}

#[test]
fn status_reports_app_version() {
    let dir = tempdir().unwrap();
    erp_store(dir.path()).arg("init").assert().success();
    let out = erp_store(dir.path()).arg("status").assert().success();
    let value = stdout_json(&out.get_output().stdout);
    assert_eq!(value["state"], "Open");
    assert_eq!(value["keyBackend"], "file");
    assert!(value["latestAppVersionName"].is_string());
}

#[test]
fn status_on_fresh_dir_has_no_settings() {
    let dir = tempdir().unwrap();
    let out = erp_store(dir.path()).arg("status").assert().success();
    let value = stdout_json(&out.get_output().stdout);
    assert!(value["latestAppVersionName"].is_null());
}

#[test]
fn settings_changes_persist() {
    let dir = tempdir().unwrap();
    erp_store(dir.path()).arg("init").assert().success();
    erp_store(dir.path())
        .args(["settings", "onboard", "--profile", "Gerda", "--mode", "password"])
        .assert()
        .success();
    erp_store(dir.path())
        .args(["settings", "zoom", "true"])
        .assert()
        .success();
    erp_store(dir.path())
        .args(["settings", "auth-failure"])
        .assert()
        .success();

    let out = erp_store(dir.path())
        .args(["settings", "show"])
        .assert()
        .success();
    let value = stdout_json(&out.get_output().stdout);
    assert_eq!(value["settings"]["authentication_mode"], "PASSWORD");
    assert_eq!(value["settings"]["zoom_enabled"], true);
    assert_eq!(value["settings"]["authentication_fails"], 1);
    assert_eq!(value["profiles"][0]["name"], "Gerda");
}

#[test]
fn settings_without_init_fails() {
    let dir = tempdir().unwrap();
    erp_store(dir.path())
        .args(["settings", "show"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("record not found"));
}

#[test]
fn corrupted_store_is_fatal() {
    let dir = tempdir().unwrap();
    erp_store(dir.path()).arg("init").assert().success();
    let db = dir.path().join("erp.realm");
    let mut bytes = fs::read(&db).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&db, bytes).unwrap();

    erp_store(dir.path())
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("uncaught error while opening the encrypted store"));
}

#[test]
fn lost_master_key_is_fatal() {
    let dir = tempdir().unwrap();
    erp_store(dir.path()).arg("init").assert().success();
    let prefs_path = dir.path().join("ENCRYPTED_REALM_PREFS_FILE_NAME.json");
    let prefs_before = fs::read(&prefs_path).unwrap();
    fs::remove_file(dir.path().join("REALM_DB_MASTER_KEY.key")).unwrap();

    erp_store(dir.path())
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("uncaught error"))
        .stderr(predicate::str::contains("encryption key does not match"));
    assert_eq!(fs::read(&prefs_path).unwrap(), prefs_before);
}

#[test]
fn reset_requires_confirmation() {
    let dir = tempdir().unwrap();
    erp_store(dir.path()).arg("init").assert().success();
    erp_store(dir.path())
        .arg("reset")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--yes"));
    assert!(dir.path().join("erp.realm").exists());

    erp_store(dir.path()).args(["reset", "--yes"]).assert().success();
    assert!(!dir.path().join("erp.realm").exists());
    assert!(!dir.path().join("REALM_DB_MASTER_KEY.key").exists());

    let out = erp_store(dir.path()).arg("init").assert().success();
    assert_eq!(stdout_json(&out.get_output().stdout)["settingsCreated"], true);
}

#[test]
fn unknown_key_backend_is_rejected() {
    let dir = tempdir().unwrap();
    assert_cmd::Command::cargo_bin("erp-store")
        .unwrap()
        .arg("--data-dir")
        .arg(dir.path())
        .args(["--key-backend", "tpm", "status"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown key backend"));
}
