use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use greenlight_core::audit::TracingAuditSink;
use greenlight_core::config::{AppConfig, LoadOptions};
use greenlight_core::engine::{ApprovalEngine, EngineOptions};
use greenlight_core::notify::TracingNotificationSink;
use greenlight_core::store::ApprovalStore;
use greenlight_core::validation::validate_template;
use greenlight_db::{connect_with_settings, migrations, SqlStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

const STORAGE_CHECKS: [&str; 2] = ["workflow_templates", "approval_queue"];

pub fn run(json_output: bool) -> String {
    let report = build_report();

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
            )
        });
    }

    render_human(&report)
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(pass("config_validation", "configuration loaded and validated"));
            config
        }
        Err(error) => {
            checks.push(fail("config_validation", error.to_string()));
            checks.push(skipped("database_connectivity", "configuration did not load"));
            for name in STORAGE_CHECKS {
                checks.push(skipped(name, "configuration did not load"));
            }
            return finish(checks);
        }
    };

    match storage_checks(&config) {
        Ok(storage) => checks.extend(storage),
        Err(details) => {
            checks.push(fail("database_connectivity", details));
            for name in STORAGE_CHECKS {
                checks.push(skipped(name, "database is not reachable"));
            }
        }
    }

    finish(checks)
}

/// All database-backed checks share one pool on one runtime; a connection
/// failure fails connectivity and skips the rest.
fn storage_checks(config: &AppConfig) -> Result<Vec<DoctorCheck>, String> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|error| format!("failed to initialize async runtime: {error}"))?;

    runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| format!("failed to connect to database: {error}"))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| format!("failed to bring schema current: {error}"))?;

        let store = Arc::new(SqlStore::new(pool.clone()));
        let checks = vec![
            pass(
                "database_connectivity",
                format!("connected with a current schema via `{}`", config.database.url),
            ),
            template_inventory(&store).await,
            approval_queue(&store, config).await,
        ];

        pool.close().await;
        Ok(checks)
    })
}

/// Every stored template must still satisfy the write-time validation
/// rules; a template edited out from under the engine shows up here.
async fn template_inventory(store: &Arc<SqlStore>) -> DoctorCheck {
    let templates = match store.all_templates().await {
        Ok(templates) => templates,
        Err(error) => {
            return fail("workflow_templates", format!("failed to load templates: {error}"));
        }
    };

    let invalid: Vec<&str> = templates
        .iter()
        .filter(|template| validate_template(template).is_err())
        .map(|template| template.id.0.as_str())
        .collect();

    if invalid.is_empty() {
        pass("workflow_templates", format!("{} stored templates, all valid", templates.len()))
    } else {
        fail("workflow_templates", format!("invalid templates: {}", invalid.join(", ")))
    }
}

/// Counts the pending set and how much of it is past its step deadline. A
/// pending request whose workflow data no longer resolves is an integrity
/// fault: the timeout sweep can never settle it.
async fn approval_queue(store: &Arc<SqlStore>, config: &AppConfig) -> DoctorCheck {
    let engine = ApprovalEngine::new(
        store.clone(),
        TracingNotificationSink,
        TracingAuditSink,
        EngineOptions {
            system_actor: config.engine.system_actor.clone(),
            quorum_counting: config.engine.quorum_counting,
        },
    );

    let pending = match store.list_pending().await {
        Ok(pending) => pending,
        Err(error) => {
            return fail("approval_queue", format!("failed to list pending approvals: {error}"));
        }
    };

    let now = Utc::now();
    let mut overdue = 0usize;
    let mut unresolved = Vec::new();
    for request in &pending {
        match engine.current_deadline(request).await {
            Ok(Some(deadline)) if deadline <= now => overdue += 1,
            Ok(_) => {}
            Err(_) => unresolved.push(request.id.0.clone()),
        }
    }

    if unresolved.is_empty() {
        pass("approval_queue", format!("{} pending, {overdue} past deadline", pending.len()))
    } else {
        fail(
            "approval_queue",
            format!("pending requests reference missing workflow data: {}", unresolved.join(", ")),
        )
    }
}

fn pass(name: &'static str, details: impl Into<String>) -> DoctorCheck {
    DoctorCheck { name, status: CheckStatus::Pass, details: details.into() }
}

fn fail(name: &'static str, details: impl Into<String>) -> DoctorCheck {
    DoctorCheck { name, status: CheckStatus::Fail, details: details.into() }
}

fn skipped(name: &'static str, details: impl Into<String>) -> DoctorCheck {
    DoctorCheck { name, status: CheckStatus::Skipped, details: details.into() }
}

fn finish(checks: Vec<DoctorCheck>) -> DoctorReport {
    let passed = checks.iter().filter(|check| check.status == CheckStatus::Pass).count();
    let total = checks.len();
    if passed == total {
        DoctorReport {
            overall_status: CheckStatus::Pass,
            summary: format!("doctor: all {total} readiness checks passed"),
            checks,
        }
    } else {
        DoctorReport {
            overall_status: CheckStatus::Fail,
            summary: format!("doctor: {passed} of {total} readiness checks passed"),
            checks,
        }
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}
