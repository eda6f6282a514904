use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// A `spendsort` command isolated in its own home directory with no
/// completion provider keys in the environment.
fn spendsort(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("spendsort").unwrap();
    cmd.env("HOME", home.path())
        .env_remove("SPENDSORT_OWNER")
        .env_remove("SPENDSORT_DATA_DIR")
        .env_remove("OPENAI_API_KEY")
        .env_remove("ANTHROPIC_API_KEY")
        .env("RUST_LOG", "off");
    cmd
}

fn init(home: &TempDir) {
    let data_dir = home.path().join("data");
    spendsort(home)
        .args(["--owner", "alice", "init", "--data-dir"])
        .arg(&data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("Default owner:  alice"));
}

#[test]
fn test_help_lists_commands() {
    let home = TempDir::new().unwrap();
    spendsort(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("import"))
        .stdout(predicate::str::contains("batch"))
        .stdout(predicate::str::contains("categorize"));
}

#[test]
fn test_commands_require_init() {
    let home = TempDir::new().unwrap();
    spendsort(&home)
        .args(["--owner", "alice", "batch", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("spendsort init"));
}

#[test]
fn test_rule_drives_categorize() {
    let home = TempDir::new().unwrap();
    init(&home);

    spendsort(&home)
        .args(["rules", "add", "shell", "--category", "fuel"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Added rule"));

    spendsort(&home)
        .args(["rules", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Fuel"));

    spendsort(&home)
        .args([
            "categorize", "--merchant", "Shell Station 42", "--amount", "-40.00", "--no-ai",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Category:    Fuel (via rule"))
        .stdout(predicate::str::contains("-$40.00"));
}

#[test]
fn test_rule_with_unknown_category_fails() {
    let home = TempDir::new().unwrap();
    init(&home);
    spendsort(&home)
        .args(["rules", "add", "shell", "--category", "Spaceships"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Spaceships"));
}

#[test]
fn test_import_missing_file_is_rejected() {
    let home = TempDir::new().unwrap();
    init(&home);
    spendsort(&home)
        .args(["import", "--type", "bank"])
        .arg(home.path().join("nope.csv"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("nope.csv"));
}

#[test]
fn test_import_without_providers_records_failed_item() {
    let home = TempDir::new().unwrap();
    init(&home);
    let csv = home.path().join("checking.csv");
    std::fs::write(&csv, "Date,Description,Amount\n2024-01-05,Coffee,-4.50\n").unwrap();

    spendsort(&home)
        .args(["import", "--type", "bank", "--no-ai"])
        .arg(&csv)
        .assert()
        .success()
        .stdout(predicate::str::contains("1 file(s), 1 queued"))
        .stdout(predicate::str::contains("0 completed, 0 duplicate, 1 failed"))
        .stdout(predicate::str::contains("checking.csv"));

    spendsort(&home)
        .args(["batch", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("bank_statement").or(predicate::str::contains("bank")));
}
