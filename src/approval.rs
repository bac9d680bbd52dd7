//! Out-of-band approval coordination.
//!
//! An interceptor that hits a configured [`ApprovalPattern`] calls
//! [`ApprovalCoordinator::request_approval`], which notifies every
//! registered [`Decider`] (best-effort) and then blocks the calling task
//! on a [`tokio::sync::Notify`] until a decision arrives or the pattern's
//! timeout elapses. `SubmitDecision` — driven by the `/approvals/{id}/...`
//! HTTP routes — is the only way to wake that wait early.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use uuid::Uuid;

use crate::config::{ApprovalConfig, TagMatch};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Pending,
    Approved,
    Rejected,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub username: String,
    pub connection_id: Uuid,
    pub method: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalOutcome {
    pub decision: Decision,
    pub decided_by: Option<String>,
    pub reason: Option<String>,
}

/// External out-of-band decision provider (Slack, a generic webhook,
/// ...). The coordinator never blocks on these; a failed send is logged
/// and otherwise ignored.
#[async_trait]
pub trait Decider: Send + Sync {
    async fn send(&self, request: &ApprovalRequest) -> Result<(), anyhow::Error>;
}

pub struct WebhookDecider {
    client: reqwest::Client,
    url: String,
}

impl WebhookDecider {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl Decider for WebhookDecider {
    async fn send(&self, request: &ApprovalRequest) -> Result<(), anyhow::Error> {
        self.client
            .post(&self.url)
            .json(&serde_json::json!({
                "id": request.id,
                "username": request.username,
                "connection_id": request.connection_id,
                "method": request.method,
                "path": request.path,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

pub struct SlackDecider {
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackDecider {
    pub fn new(webhook_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url,
        }
    }
}

#[async_trait]
impl Decider for SlackDecider {
    async fn send(&self, request: &ApprovalRequest) -> Result<(), anyhow::Error> {
        let text = format!(
            "Approval needed: {} requests `{} {}` on connection `{}`",
            request.username, request.method, request.path, request.connection_id
        );
        self.client
            .post(&self.webhook_url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// A compiled approval pattern: fires on `"METHOD path"` / `"CMD ARG..."`
/// when both the regex and the connection's tags match.
pub struct ApprovalPattern {
    regex: Regex,
    tags: HashSet<String>,
    tag_match: TagMatch,
    pub timeout: Duration,
}

impl ApprovalPattern {
    fn matches(&self, subject: &str, connection_tags: &HashSet<String>) -> bool {
        if !self.regex.is_match(subject) {
            return false;
        }
        if self.tags.is_empty() {
            return true;
        }
        match self.tag_match {
            TagMatch::All => self.tags.iter().all(|t| connection_tags.contains(t)),
            TagMatch::Any => self.tags.iter().any(|t| connection_tags.contains(t)),
        }
    }
}

struct PendingRequest {
    notify: Arc<tokio::sync::Notify>,
    outcome: parking_lot::Mutex<Option<ApprovalOutcome>>,
}

pub struct ApprovalCoordinator {
    patterns: Vec<ApprovalPattern>,
    deciders: Vec<Arc<dyn Decider>>,
    pending: parking_lot::Mutex<HashMap<Uuid, Arc<PendingRequest>>>,
}

impl ApprovalCoordinator {
    pub fn from_config(config: Option<&ApprovalConfig>) -> Result<Self, anyhow::Error> {
        let mut patterns = Vec::new();
        let mut deciders: Vec<Arc<dyn Decider>> = Vec::new();

        if let Some(cfg) = config {
            if cfg.enabled {
                for p in &cfg.patterns {
                    patterns.push(ApprovalPattern {
                        regex: Regex::new(&format!("(?i){}", p.pattern))?,
                        tags: p.tags.clone(),
                        tag_match: p.tag_match,
                        timeout: Duration::from_secs(p.timeout_seconds),
                    });
                }
                if let Some(webhook) = &cfg.webhook {
                    deciders.push(Arc::new(WebhookDecider::new(webhook.url.clone())));
                }
                if let Some(slack) = &cfg.slack {
                    deciders.push(Arc::new(SlackDecider::new(slack.webhook_url.clone())));
                }
            }
        }

        Ok(Self {
            patterns,
            deciders,
            pending: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    /// `RequiresApproval`: first matching pattern wins.
    pub fn requires_approval(
        &self,
        subject: &str,
        connection_tags: &HashSet<String>,
    ) -> Option<Duration> {
        self.patterns
            .iter()
            .find(|p| p.matches(subject, connection_tags))
            .map(|p| p.timeout)
    }

    /// Inserts the request, best-effort-notifies every decider, then
    /// blocks until a decision arrives or `timeout` elapses.
    pub async fn request_approval(
        &self,
        request: ApprovalRequest,
        timeout: Duration,
    ) -> ApprovalOutcome {
        let id = request.id;
        let entry = Arc::new(PendingRequest {
            notify: Arc::new(tokio::sync::Notify::new()),
            outcome: parking_lot::Mutex::new(None),
        });
        self.pending.lock().insert(id, entry.clone());

        for decider in &self.deciders {
            if let Err(e) = decider.send(&request).await {
                tracing::warn!(error = %e, request_id = %id, "approval decider failed to send");
            }
        }

        let outcome = tokio::select! {
            _ = entry.notify.notified() => {
                entry.outcome.lock().clone().unwrap_or(ApprovalOutcome {
                    decision: Decision::TimedOut,
                    decided_by: None,
                    reason: None,
                })
            }
            _ = tokio::time::sleep(timeout) => {
                // `notify_waiters()` stores no permit, so a decision that
                // lands between `pending.insert` and this select! registering
                // its `notified()` future would otherwise be lost. Re-check
                // the stored outcome before concluding the wait really timed
                // out.
                entry.outcome.lock().clone().unwrap_or(ApprovalOutcome {
                    decision: Decision::TimedOut,
                    decided_by: None,
                    reason: Some("timeout".to_string()),
                })
            }
        };

        self.pending.lock().remove(&id);
        let label = match outcome.decision {
            Decision::Approved => "approved",
            Decision::Rejected => "rejected",
            Decision::TimedOut => "timed_out",
            Decision::Pending => "pending",
        };
        crate::metrics::APPROVAL_DECISIONS_TOTAL.with_label_values(&[label]).inc();
        outcome
    }

    /// `SubmitDecision`: idempotent — the first call for an `id` wins,
    /// subsequent calls are a no-op.
    pub fn submit_decision(
        &self,
        id: Uuid,
        approved: bool,
        decided_by: Option<String>,
        reason: Option<String>,
    ) -> bool {
        let entry = match self.pending.lock().get(&id).cloned() {
            Some(e) => e,
            None => return false,
        };

        let mut guard = entry.outcome.lock();
        if guard.is_some() {
            return false;
        }
        *guard = Some(ApprovalOutcome {
            decision: if approved {
                Decision::Approved
            } else {
                Decision::Rejected
            },
            decided_by,
            reason,
        });
        drop(guard);
        entry.notify.notify_waiters();
        true
    }
}
