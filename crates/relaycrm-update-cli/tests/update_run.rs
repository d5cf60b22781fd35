use std::path::PathBuf;

use relaycrm_update_cli::{run_update, RunOptions};
use relaycrm_update_core::{render_failure_page, HostLimits, RunStatus};
use rusqlite::Connection;
use serde_json::Value;
use ulid::Ulid;

fn must<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err:?}"),
    }
}

struct Fixture {
    root: PathBuf,
}

impl Fixture {
    /// Builds a package and site layout under a throwaway directory.
    /// With `seed_modules` the package data seeds the module registry the
    /// field definitions expect.
    fn new(seed_modules: bool) -> Self {
        let root = std::env::temp_dir().join(format!("relaycrm-cli-test-{}", Ulid::new()));
        let package = root.join("package");
        must(std::fs::create_dir_all(package.join("dbscheme")));
        must(std::fs::create_dir_all(package.join("data")));
        must(std::fs::create_dir_all(package.join("config-templates")));
        must(std::fs::create_dir_all(root.join("site/cache/templates_c")));
        must(std::fs::write(
            root.join("site/cache/templates_c/stale.tpl"),
            "stale",
        ));

        must(std::fs::write(
            package.join("manifest.json"),
            r#"{"label":"RelayCRM 6.4.0","from_version":"6.3.0","to_version":"6.4.0"}"#,
        ));
        must(std::fs::write(
            package.join("dbscheme/01_tables.sql"),
            "CREATE TABLE IF NOT EXISTS crm_paymentsin (
               paymentsinid INTEGER PRIMARY KEY,
               paymentsvalue TEXT
             );
             CREATE TABLE IF NOT EXISTS crm_users (
               id INTEGER PRIMARY KEY,
               user_name TEXT
             );",
        ));
        let mut seed = String::from(
            "INSERT OR IGNORE INTO crm_profiles(profilename) VALUES ('Administrator');\n",
        );
        if seed_modules {
            seed.push_str(
                "INSERT OR IGNORE INTO crm_modules(name) VALUES
                   ('PaymentsIn'), ('Users'), ('FInvoice'), ('FInvoiceProforma');\n",
            );
        }
        must(std::fs::write(package.join("data/01_seed.sql"), seed));
        must(std::fs::write(
            package.join("config-templates/performance.json"),
            r#"{"query_limit": 100, "cache_ttl": 3600}"#,
        ));

        Self { root }
    }

    fn options(&self) -> RunOptions {
        RunOptions {
            db: self.root.join("relaycrm.sqlite3"),
            package_dir: self.root.join("package"),
            site_dir: self.root.join("site"),
            actor: "system".to_string(),
            limits: HostLimits::unlimited(),
        }
    }

    fn open_db(&self) -> Connection {
        must(Connection::open(self.root.join("relaycrm.sqlite3")))
    }

    fn run_log(&self) -> String {
        must(std::fs::read_to_string(
            self.root.join("site/cache/logs/update.log"),
        ))
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

fn marker_results(conn: &Connection) -> Vec<i64> {
    let mut stmt = must(conn.prepare("SELECT result FROM crm_updates ORDER BY id"));
    let mut rows = must(stmt.query([]));
    let mut results = Vec::new();
    while let Some(row) = must(rows.next()) {
        results.push(must(row.get(0)));
    }
    results
}

fn column_names(conn: &Connection, table: &str) -> Vec<String> {
    let mut stmt = must(conn.prepare(&format!("PRAGMA table_info({table})")));
    let mut rows = must(stmt.query([]));
    let mut names = Vec::new();
    while let Some(row) = must(rows.next()) {
        names.push(must(row.get::<_, String>(1)));
    }
    names
}

#[test]
fn successful_run_completes_and_records_marker() {
    let fixture = Fixture::new(true);

    let status = must(run_update(&fixture.options()));
    assert_eq!(status, RunStatus::Completed);

    let conn = fixture.open_db();
    assert_eq!(marker_results(&conn), vec![1]);
    let version: String = must(conn.query_row(
        "SELECT current_version FROM crm_version WHERE id = 1",
        [],
        |row| row.get(0),
    ));
    assert_eq!(version, "6.4.0");

    let columns = column_names(&conn, "crm_paymentsin");
    assert!(columns.iter().any(|name| name == "finvoiceproformaid"));
    assert!(columns.iter().any(|name| name == "paymentsin_status"));

    let smstemplates: i64 = must(conn.query_row(
        "SELECT COUNT(*) FROM crm_modules WHERE name = 'SMSTemplates'",
        [],
        |row| row.get(0),
    ));
    assert_eq!(smstemplates, 1);

    let config_body = must(std::fs::read_to_string(
        fixture.root.join("site/config/performance.json"),
    ));
    let config: Value = must(serde_json::from_str(&config_body));
    assert_eq!(config["query_limit"], Value::from(100));

    let log = fixture.run_log();
    assert!(log.contains("Update package: RelayCRM 6.4.0 (6.3.0 -> 6.4.0)"));
    assert!(log.contains("add_fields | "));
    assert!(log.contains(" min"));
    assert!(log.contains("  [WARNING] Skip mail configuration update: no mail config"));
    assert!(log.contains("Update completed: 6.4.0"));
}

#[test]
fn missing_modules_fail_the_gate_and_tear_down_caches() {
    let fixture = Fixture::new(false);

    let status = must(run_update(&fixture.options()));
    let RunStatus::Failed(report) = status else {
        panic!("expected a failed run");
    };
    assert!(report
        .errors
        .iter()
        .any(|line| line.contains("Module not exists: PaymentsIn")));

    let page = render_failure_page(&report);
    assert!(page.contains("System update failed"));

    let conn = fixture.open_db();
    assert_eq!(marker_results(&conn), vec![0]);
    // A failed run still forces the target version so the package cannot
    // be applied twice on top of a half-updated site.
    let version: String = must(conn.query_row(
        "SELECT current_version FROM crm_version WHERE id = 1",
        [],
        |row| row.get(0),
    ));
    assert_eq!(version, "6.4.0");

    assert!(!fixture.root.join("site/cache/updates").exists());
    assert!(!fixture.root.join("site/cache/templates_c").exists());
    assert!(fixture.run_log().contains("Update failed: RelayCRM 6.4.0"));
}

#[test]
fn preflight_rejection_leaves_site_and_database_untouched() {
    let fixture = Fixture::new(true);
    let mut options = fixture.options();
    options.limits = HostLimits {
        max_execution_time: 300,
        max_input_time: 0,
    };

    let err = match run_update(&options) {
        Ok(status) => panic!("expected a preflight rejection, got {status:?}"),
        Err(err) => err,
    };
    assert!(format!("{err:#}").contains("max_execution_time = 300 < 600"));
    assert!(!fixture.root.join("relaycrm.sqlite3").exists());
    assert!(!fixture.root.join("site/cache/logs").exists());
}

#[test]
fn rerunning_a_completed_package_stays_idempotent() {
    let fixture = Fixture::new(true);

    assert_eq!(must(run_update(&fixture.options())), RunStatus::Completed);
    assert_eq!(must(run_update(&fixture.options())), RunStatus::Completed);

    let conn = fixture.open_db();
    assert_eq!(marker_results(&conn), vec![1, 1]);
    let fields: i64 = must(conn.query_row(
        "SELECT COUNT(*) FROM crm_fields WHERE fieldname = 'finvoiceproformaid'",
        [],
        |row| row.get(0),
    ));
    assert_eq!(fields, 1);
    assert!(fixture
        .run_log()
        .contains("Skip adding field. Module: PaymentsIn, field name: finvoiceproformaid"));
}

#[test]
fn mail_configuration_migrates_to_combined_host_format() {
    let fixture = Fixture::new(true);
    let config_dir = fixture.root.join("site/config");
    must(std::fs::create_dir_all(&config_dir));
    must(std::fs::write(
        config_dir.join("mail.json"),
        r#"{
            "imap_hosts": {"mail.example.com": "mail.example.com"},
            "smtp_host": "smtp.example.com",
            "smtp_port": 587,
            "plugins": ["archive", "advanced_search"]
        }"#,
    ));

    assert_eq!(must(run_update(&fixture.options())), RunStatus::Completed);

    let body = must(std::fs::read_to_string(config_dir.join("mail.json")));
    let config: Value = must(serde_json::from_str(&body));
    assert_eq!(
        config["smtp_host"],
        Value::String("smtp.example.com:587".to_string())
    );
    assert!(config.get("smtp_port").is_none());
    assert!(config["imap_hosts"]
        .as_object()
        .is_some_and(|hosts| hosts.contains_key("mail.example.com:993")));
    assert_eq!(
        config["plugins"],
        Value::Array(vec![Value::String("archive".to_string())])
    );
}

#[test]
fn run_log_survives_the_failure_teardown() {
    let fixture = Fixture::new(false);

    let status = must(run_update(&fixture.options()));
    assert!(matches!(status, RunStatus::Failed(_)));

    // The log lives under cache/logs, which teardown leaves alone.
    let log = fixture.run_log();
    assert!(log.contains("remove_modules | "));
    assert!(fixture.root.join("site/cache/logs/update.log").exists());
}
