//! Read-only schema checks against the store's PostgREST interface.
//!
//! Each check produces a [`CheckResult`]; [`run`] collects them into a
//! [`Report`] that the caller prints once.

use std::fmt;

use serde_json::Value;
use tracing::debug;

pub const SHOWCASE_COLUMNS: &[&str] = &[
    "id",
    "user_id",
    "title",
    "slug",
    "visibility",
    "status",
    "input_path",
    "output_path",
    "created_at",
    "updated_at",
];

pub const JOB_COLUMNS: &[&str] = &[
    "id",
    "showcase_id",
    "input_path",
    "output_path",
    "status",
    "attempt_count",
    "started_at",
    "finished_at",
    "error",
    "created_at",
    "updated_at",
];

const FUNCTIONS: &[&str] = &["create_showcase_and_job", "ensure_unique_slug"];

/// Objects REST cannot see, reported as warnings naming what should exist.
const UNVERIFIABLE: &[(&str, &str, &str)] = &[
    ("Functions", "tg_set_updated_at", "trigger function"),
    ("Types", "visibility_t", "public, unlisted, private"),
    ("Types", "showcase_status_t", "uploaded, processing, ready, failed"),
    ("Types", "job_status_t", "queued, running, complete, failed"),
    ("Extensions", "pgcrypto", "extension"),
    ("Extensions", "uuid-ossp", "extension"),
    ("Triggers", "tr_showcases_set_updated", "on showcases"),
    ("Triggers", "tr_jobs_set_updated", "on jobs"),
    ("Indexes", "idx_showcases_user_id", "on showcases(user_id)"),
    ("Indexes", "idx_jobs_showcase_id", "on jobs(showcase_id)"),
    ("Indexes", "idx_jobs_status", "on jobs(status)"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    Fail,
    Warn,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult {
    pub category: &'static str,
    pub name: String,
    pub status: CheckStatus,
    pub details: String,
}

impl CheckResult {
    fn new(
        category: &'static str,
        name: impl Into<String>,
        status: CheckStatus,
        details: impl Into<String>,
    ) -> Self {
        Self {
            category,
            name: name.into(),
            status,
            details: details.into(),
        }
    }
}

impl fmt::Display for CheckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self.status {
            CheckStatus::Pass => '✓',
            CheckStatus::Fail => '✗',
            CheckStatus::Warn => '⚠',
        };
        write!(f, "  {symbol} [{}] {}", self.category, self.name)?;
        if !self.details.is_empty() {
            write!(f, ": {}", self.details)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Report {
    pub results: Vec<CheckResult>,
}

impl Report {
    fn count(&self, status: CheckStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn passed(&self) -> usize {
        self.count(CheckStatus::Pass)
    }

    pub fn failed(&self) -> usize {
        self.count(CheckStatus::Fail)
    }

    pub fn warnings(&self) -> usize {
        self.count(CheckStatus::Warn)
    }

    pub fn exit_code(&self) -> i32 {
        if self.failed() > 0 {
            1
        } else {
            0
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for result in &self.results {
            writeln!(f, "{result}")?;
        }
        writeln!(f)?;
        writeln!(f, "  Total checks: {}", self.results.len())?;
        writeln!(f, "  ✓ Passed: {}", self.passed())?;
        writeln!(f, "  ✗ Failed: {}", self.failed())?;
        writeln!(f, "  ⚠ Warnings: {}", self.warnings())?;
        writeln!(f)?;
        let status = if self.failed() > 0 {
            "VERIFICATION FAILED"
        } else if self.warnings() > 0 {
            "VERIFICATION INCOMPLETE (some objects cannot be seen through REST)"
        } else {
            "ALL CHECKS PASSED"
        };
        write!(f, "  STATUS: {status}")
    }
}

/// Outcome of a single HTTP probe.
#[derive(Debug, Clone, PartialEq)]
pub enum Probe {
    Ok(Value),
    Status(u16, String),
    Transport(String),
}

impl Probe {
    fn mentions_missing(&self) -> bool {
        match self {
            Probe::Status(_, body) => body.to_lowercase().contains("does not exist"),
            Probe::Transport(msg) => msg.to_lowercase().contains("does not exist"),
            Probe::Ok(_) => false,
        }
    }

    fn describe(&self) -> String {
        match self {
            Probe::Ok(_) => "ok".into(),
            Probe::Status(code, body) => format!("HTTP {code}: {body}"),
            Probe::Transport(msg) => msg.clone(),
        }
    }
}

pub fn check_table(name: &str, columns: &[&str], probe: &Probe) -> CheckResult {
    let expected = format!("expected columns: {}", columns.join(", "));
    match probe {
        _ if probe.mentions_missing() => {
            CheckResult::new("Tables", name, CheckStatus::Fail, "table does not exist")
        }
        Probe::Ok(_) => CheckResult::new(
            "Tables",
            name,
            CheckStatus::Pass,
            format!("exists and is accessible; {expected}"),
        ),
        _ => CheckResult::new(
            "Tables",
            name,
            CheckStatus::Pass,
            format!("exists (access may be restricted); {expected}"),
        ),
    }
}

pub fn check_view(name: &str, probe: &Probe) -> CheckResult {
    match probe {
        _ if probe.mentions_missing() => {
            CheckResult::new("Views", name, CheckStatus::Fail, "view does not exist")
        }
        Probe::Ok(_) => {
            CheckResult::new("Views", name, CheckStatus::Pass, "exists and is accessible")
        }
        other => CheckResult::new(
            "Views",
            name,
            CheckStatus::Warn,
            format!("may exist but: {}", other.describe()),
        ),
    }
}

/// Looks the function up in the OpenAPI document served at `/rest/v1/`.
pub fn check_function(name: &str, openapi: &Probe) -> CheckResult {
    let Probe::Ok(document) = openapi else {
        return CheckResult::new(
            "Functions",
            name,
            CheckStatus::Warn,
            format!("could not read API description: {}", openapi.describe()),
        );
    };

    let path = format!("/rpc/{name}");
    let listed = document
        .get("paths")
        .and_then(Value::as_object)
        .map(|paths| paths.contains_key(&path))
        .unwrap_or(false);

    if listed {
        CheckResult::new("Functions", name, CheckStatus::Pass, "function exists")
    } else {
        CheckResult::new(
            "Functions",
            name,
            CheckStatus::Fail,
            "function does not exist",
        )
    }
}

/// `probe` is a read of `showcases` made with the anonymous key.
pub fn check_rls(probe: &Probe) -> CheckResult {
    let name = "showcases table RLS";
    match probe {
        Probe::Status(401 | 403, _) => CheckResult::new(
            "RLS",
            name,
            CheckStatus::Pass,
            "enabled (access denied without auth)",
        ),
        Probe::Ok(Value::Array(rows)) if rows.is_empty() => CheckResult::new(
            "RLS",
            name,
            CheckStatus::Warn,
            "no rows visible without auth; could not tell RLS from an empty table",
        ),
        Probe::Ok(_) => CheckResult::new(
            "RLS",
            name,
            CheckStatus::Warn,
            "rows readable without auth; RLS may be disabled",
        ),
        other => CheckResult::new(
            "RLS",
            name,
            CheckStatus::Warn,
            format!("unexpected response: {}", other.describe()),
        ),
    }
}

pub fn unverifiable_checks() -> impl Iterator<Item = CheckResult> {
    UNVERIFIABLE.iter().map(|(category, name, expected)| {
        CheckResult::new(
            *category,
            *name,
            CheckStatus::Warn,
            format!("cannot verify through REST ({expected}); check the schema deployment"),
        )
    })
}

pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
    service_key: String,
    anon_key: String,
}

impl RestClient {
    pub fn new(base_url: &str, service_key: &str, anon_key: Option<&str>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.to_string(),
            anon_key: anon_key.unwrap_or(service_key).to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get(&self, path: &str, key: &str) -> Probe {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "Probing");
        let response = match self
            .client
            .get(&url)
            .header("apikey", key)
            .bearer_auth(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return Probe::Transport(err.to_string()),
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            Probe::Ok(serde_json::from_str(&body).unwrap_or(Value::Null))
        } else {
            Probe::Status(status.as_u16(), body)
        }
    }
}

pub async fn run(client: &RestClient) -> Report {
    let mut report = Report::default();

    for (table, columns) in [("showcases", SHOWCASE_COLUMNS), ("jobs", JOB_COLUMNS)] {
        let probe = client
            .get(&format!("/rest/v1/{table}?limit=0"), &client.service_key)
            .await;
        report.results.push(check_table(table, columns, &probe));
    }

    let probe = client
        .get("/rest/v1/public_showcases?limit=0", &client.service_key)
        .await;
    report.results.push(check_view("public_showcases", &probe));

    let openapi = client.get("/rest/v1/", &client.service_key).await;
    for function in FUNCTIONS {
        report.results.push(check_function(function, &openapi));
    }

    let probe = client
        .get("/rest/v1/showcases?limit=1", &client.anon_key)
        .await;
    report.results.push(check_rls(&probe));

    report.results.extend(unverifiable_checks());

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_table_fails() {
        let probe = Probe::Status(404, r#"{"message":"relation \"jobs\" does not exist"}"#.into());
        assert_eq!(check_table("jobs", JOB_COLUMNS, &probe).status, CheckStatus::Fail);
    }

    #[test]
    fn restricted_table_still_passes() {
        let probe = Probe::Status(401, "permission denied".into());
        let result = check_table("jobs", JOB_COLUMNS, &probe);
        assert_eq!(result.status, CheckStatus::Pass);
        assert!(result.details.contains("attempt_count"));
    }

    #[test]
    fn view_errors_warn() {
        let probe = Probe::Status(500, "boom".into());
        assert_eq!(check_view("public_showcases", &probe).status, CheckStatus::Warn);
        assert_eq!(
            check_view("public_showcases", &Probe::Ok(json!([]))).status,
            CheckStatus::Pass
        );
    }

    #[test]
    fn functions_are_looked_up_in_openapi_paths() {
        let doc = Probe::Ok(json!({"paths": {"/rpc/ensure_unique_slug": {}}}));
        assert_eq!(check_function("ensure_unique_slug", &doc).status, CheckStatus::Pass);
        assert_eq!(
            check_function("create_showcase_and_job", &doc).status,
            CheckStatus::Fail
        );
        assert_eq!(
            check_function("ensure_unique_slug", &Probe::Transport("refused".into())).status,
            CheckStatus::Warn
        );
    }

    #[test]
    fn anonymous_denial_means_rls() {
        assert_eq!(check_rls(&Probe::Status(401, String::new())).status, CheckStatus::Pass);
        assert_eq!(check_rls(&Probe::Status(403, String::new())).status, CheckStatus::Pass);
        assert_eq!(check_rls(&Probe::Ok(json!([{"id": 1}]))).status, CheckStatus::Warn);
    }

    #[test]
    fn report_exit_code_follows_failures() {
        let mut report = Report::default();
        report.results.extend(unverifiable_checks());
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.warnings(), UNVERIFIABLE.len());

        report.results.push(check_view("v", &Probe::Status(404, "does not exist".into())));
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.failed(), 1);
        assert!(report.to_string().contains("VERIFICATION FAILED"));
    }
}
