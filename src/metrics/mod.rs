use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::runtime::Handle;

use crate::backup::ArtifactKind;
use crate::config::Config;
use crate::journal::BackupLog;

const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStatus {
    Failure = 0,
    Success = 1,
}

impl BackupStatus {
    pub fn value(self) -> u8 {
        self as u8
    }
}

/// Best-effort gauge reporting. Failures are logged by the implementation and
/// never returned.
pub trait ReportMetric: Send + Sync {
    fn report(&self, kind: ArtifactKind, status: BackupStatus);
}

/// Pushes a single gauge sample per report to a Prometheus Pushgateway.
///
/// `report` blocks until the push finishes or times out, so it must be called
/// from a blocking thread, never from an async task.
pub struct PushgatewayReporter {
    endpoint: Option<Endpoint>,
    node_id: String,
    db_name: String,
    app_name: String,
    journal: Arc<BackupLog>,
}

struct Endpoint {
    base_url: String,
    client: reqwest::Client,
    runtime: Handle,
}

impl PushgatewayReporter {
    pub fn from_config(cfg: &Config, journal: Arc<BackupLog>) -> Self {
        let endpoint = cfg
            .metrics
            .pushgateway_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .and_then(|url| match Handle::try_current() {
                Ok(runtime) => Some(Endpoint {
                    base_url: url.trim_end_matches('/').to_string(),
                    client: reqwest::Client::new(),
                    runtime,
                }),
                Err(_) => {
                    journal.error("Metrics disabled: no async runtime available");
                    None
                }
            });

        Self {
            endpoint,
            node_id: cfg.node.id.clone(),
            db_name: cfg.database.name.clone(),
            app_name: cfg.archive.app.clone(),
            journal,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    fn series(&self, kind: ArtifactKind) -> Series<'_> {
        match kind {
            ArtifactKind::Database => Series {
                job: "db_backup",
                label: "db",
                value: &self.db_name,
            },
            ArtifactKind::Config => Series {
                job: "conf_backup",
                label: "app",
                value: &self.app_name,
            },
        }
    }
}

impl ReportMetric for PushgatewayReporter {
    fn report(&self, kind: ArtifactKind, status: BackupStatus) {
        let Some(endpoint) = &self.endpoint else {
            return;
        };

        let series = self.series(kind);
        let url = push_url(&endpoint.base_url, series.job, &self.node_id);
        let body = render_sample(&series, &self.node_id, status);

        match endpoint.runtime.block_on(push(&endpoint.client, &url, body)) {
            Ok(()) => self.journal.info(&format!("Push metric: {}", status.value())),
            Err(e) => self
                .journal
                .error(&format!("Push metric error ({}): {:#}", kind, e)),
        }
    }
}

pub struct Series<'a> {
    pub job: &'static str,
    pub label: &'static str,
    pub value: &'a str,
}

/// One line of text exposition format, e.g.
/// `db_backup{db="panel", node="10.0.0.5"} 1`.
pub fn render_sample(series: &Series<'_>, node_id: &str, status: BackupStatus) -> String {
    format!(
        "{}{{{}=\"{}\", node=\"{}\"}} {}\n",
        series.job,
        series.label,
        series.value,
        node_id,
        status.value()
    )
}

pub fn push_url(base_url: &str, job: &str, node_id: &str) -> String {
    format!(
        "{}/metrics/job/{}/instance/{}",
        base_url.trim_end_matches('/'),
        job,
        node_id
    )
}

async fn push(client: &reqwest::Client, url: &str, body: String) -> Result<()> {
    client
        .post(url)
        .timeout(PUSH_TIMEOUT)
        .body(body)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}
