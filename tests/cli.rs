use assert_cmd::Command;
use tempfile::tempdir;

fn kamehouse() -> Command {
    let mut cmd = Command::cargo_bin("kamehouse").expect("binary built");
    cmd.env_remove("KAMEHOUSE_DATABASE_URL")
        .env_remove("KAMEHOUSE_LOG_DIR")
        .env("RUST_LOG", "warn");
    cmd
}

#[test]
fn migrate_applies_then_reports_up_to_date() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let db = dir.path().join("kamehouse.sqlite3");
    let url = format!("sqlite://{}", db.display());

    let first = kamehouse().args(["migrate", "--database-url", &url]).output()?;
    assert!(first.status.success(), "{}", String::from_utf8_lossy(&first.stderr));
    let stdout = String::from_utf8_lossy(&first.stdout);
    assert!(stdout.contains("Applied 5 migration(s):"), "{stdout}");
    assert!(stdout.contains("202601050900_users_households.sql"));
    assert!(db.exists());

    let second = kamehouse().args(["--database-url", &url, "migrate"]).output()?;
    assert!(second.status.success());
    assert!(String::from_utf8_lossy(&second.stdout).contains("Database is up to date."));
    Ok(())
}

#[test]
fn vacuum_runs_against_a_migrated_database() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let url = format!("sqlite://{}", dir.path().join("vac.sqlite3").display());
    kamehouse().args(["migrate", "--database-url", &url]).assert().success();
    let output = kamehouse().args(["db", "vacuum", "--database-url", &url]).output()?;
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("Database vacuum completed."));
    Ok(())
}

#[test]
fn invalid_config_exits_non_zero() {
    kamehouse()
        .env("KAMEHOUSE_PORT", "not-a-port")
        .arg("migrate")
        .assert()
        .failure();
}
