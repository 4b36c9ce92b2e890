//! The monitor
//!
//! A read-only observer: it samples hook snapshots (one hook at a
//! time — atomic per entity, not across entities), molecule progress,
//! and recent failure events, and compares them against the
//! configured thresholds. Snapshots and alerts persist under
//! `metrics/` for the dashboard collaborators.

use crate::guild::Core;
use crate::RuntimeResult;
use chrono::{DateTime, Utc};
use guild_ledger::LedgerQuery;
use guild_storage::RecordKind;
use guild_types::{MoleculeId, MoleculeStatus, OwnerId, WorkItemId};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Alert severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

/// One health alert.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthAlert {
    pub severity: Severity,
    /// What tripped ("heartbeat age 420s").
    pub condition: String,
    /// Which entity ("agent w2").
    pub subject: String,
    pub suggested_action: String,
}

/// Per-agent sample.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub owner: OwnerId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_age_secs: Option<i64>,
    pub queue_depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_item: Option<WorkItemId>,
}

/// Per-molecule sample.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MoleculeMetrics {
    pub id: MoleculeId,
    pub name: String,
    pub status: MoleculeStatus,
    pub progress: f64,
}

/// A failure event surfaced from the ledger tail.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub sequence: u64,
    pub entity_id: String,
    pub event_kind: String,
}

/// Consistent point-in-time view of the system.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub collected_at: DateTime<Utc>,
    pub agents: Vec<AgentMetrics>,
    pub molecules: Vec<MoleculeMetrics>,
    pub recent_errors: Vec<ErrorEvent>,
}

/// Observes; never mutates hooks, molecules, or contracts.
pub struct Monitor {
    core: Core,
}

impl Monitor {
    pub fn new(core: Core) -> Self {
        Self { core }
    }

    /// Sample the system and persist the snapshot to
    /// `metrics/current`.
    pub async fn collect_metrics(&self) -> RuntimeResult<MetricsSnapshot> {
        let now = Utc::now();

        let agents: Vec<AgentMetrics> = self
            .core
            .hooks
            .snapshots()
            .await
            .into_iter()
            .map(|snapshot| AgentMetrics {
                heartbeat_age_secs: snapshot
                    .last_heartbeat
                    .map(|hb| now.signed_duration_since(hb).num_seconds()),
                queue_depth: snapshot.queue_depth,
                current_item: snapshot.current_item,
                owner: snapshot.owner,
            })
            .collect();

        let mut molecules = Vec::new();
        for molecule in self.core.engine.list(Some(MoleculeStatus::Active)).await {
            let progress = self.core.engine.progress(&molecule.id).await?;
            molecules.push(MoleculeMetrics {
                id: molecule.id,
                name: molecule.name,
                status: molecule.status,
                progress,
            });
        }

        // The last stretch of the ledger, filtered to failure events.
        let latest = self.core.ledger.latest_sequence().await;
        let since = latest.saturating_sub(200).max(1);
        let recent_errors = self
            .core
            .ledger
            .query(&LedgerQuery {
                since: Some(since),
                ..Default::default()
            })
            .await
            .into_iter()
            .filter(|entry| entry.event_kind.contains("failed"))
            .map(|entry| ErrorEvent {
                sequence: entry.sequence,
                entity_id: entry.entity_id,
                event_kind: entry.event_kind,
            })
            .collect();

        let snapshot = MetricsSnapshot {
            collected_at: now,
            agents,
            molecules,
            recent_errors,
        };

        let body =
            serde_json::to_value(&snapshot).map_err(guild_storage::StorageError::from)?;
        self.core
            .store
            .put(RecordKind::Metrics, "current", body)
            .await?;
        debug!(agents = snapshot.agents.len(), "metrics collected");
        Ok(snapshot)
    }

    /// Compare the current snapshot against the thresholds; persist
    /// active alerts to `metrics/alerts`.
    pub async fn check_health(&self) -> RuntimeResult<Vec<HealthAlert>> {
        let snapshot = self.collect_metrics().await?;
        let thresholds = self.core.config.monitor;
        let mut alerts = Vec::new();

        for agent in &snapshot.agents {
            if let Some(age) = agent.heartbeat_age_secs {
                if age > thresholds.heartbeat_critical_secs {
                    alerts.push(HealthAlert {
                        severity: Severity::Critical,
                        condition: format!("heartbeat age {age}s"),
                        subject: format!("agent {}", agent.owner),
                        suggested_action: "restart agent".to_string(),
                    });
                } else if age > thresholds.heartbeat_warning_secs {
                    alerts.push(HealthAlert {
                        severity: Severity::Warning,
                        condition: format!("heartbeat age {age}s"),
                        subject: format!("agent {}", agent.owner),
                        suggested_action: "check agent".to_string(),
                    });
                }
            }

            if agent.queue_depth > thresholds.queue_depth_critical {
                alerts.push(HealthAlert {
                    severity: Severity::Critical,
                    condition: format!("queue depth {}", agent.queue_depth),
                    subject: format!("agent {}", agent.owner),
                    suggested_action: "investigate bottleneck".to_string(),
                });
            } else if agent.queue_depth > thresholds.queue_depth_warning {
                alerts.push(HealthAlert {
                    severity: Severity::Warning,
                    condition: format!("queue depth {}", agent.queue_depth),
                    subject: format!("agent {}", agent.owner),
                    suggested_action: "scale workers".to_string(),
                });
            }
        }

        let body = serde_json::to_value(&alerts).map_err(guild_storage::StorageError::from)?;
        self.core
            .store
            .put(RecordKind::Metrics, "alerts", body)
            .await?;
        Ok(alerts)
    }
}
