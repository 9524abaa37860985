//! Out-of-band message channel.
//!
//! A small HTTP side channel used for completion signaling, progress
//! monitoring, and crash reconciliation. Strictly an accelerator: when the
//! endpoint is unreachable at startup the channel is disabled for the rest of
//! the run and every operation becomes a no-op returning a neutral value.
//! Correctness never depends on it.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::config::OobConfig;

/// Orchestrator identity on the channel.
pub const ORCHESTRATOR: &str = "herd-runner";

/// Message subjects exchanged with workers.
pub mod subject {
    pub fn task(bead_id: &str) -> String {
        format!("TASK: {bead_id}")
    }

    pub fn done(bead_id: &str) -> String {
        format!("DONE: {bead_id}")
    }

    pub fn progress(bead_id: &str) -> String {
        format!("PROGRESS: {bead_id}")
    }

    pub fn epic_done(epic_id: &str) -> String {
        format!("EPIC_DONE: {epic_id}")
    }

    /// Bead ID from a `DONE: <bead>` subject, if that is what this is.
    pub fn parse_done(subject: &str) -> Option<&str> {
        subject
            .strip_prefix("DONE:")
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

/// A message fetched from the inbox, newest-last.
#[derive(Debug, Clone, Deserialize)]
pub struct OobMessage {
    pub id: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub acked: bool,
}

#[derive(Debug, Deserialize)]
struct InboxResponse {
    #[serde(default)]
    messages: Vec<OobMessage>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    id: String,
}

/// The channel handle. `base: None` means permanently disabled.
#[derive(Debug, Clone)]
pub struct OobChannel {
    base: Option<String>,
}

impl OobChannel {
    /// Probe the configured endpoint once. Unreachable or unconfigured means
    /// a disabled channel for the whole run.
    pub fn connect(config: &OobConfig) -> Self {
        if !config.enabled {
            return Self { base: None };
        }
        let Some(ref url) = config.url else {
            return Self { base: None };
        };
        let base = url.trim_end_matches('/').to_string();

        let probe = agent().get(format!("{base}/health")).call();
        match probe {
            Ok(_) => Self { base: Some(base) },
            Err(e) => {
                tracing::warn!("oob channel unreachable, disabling for this run: {e}");
                eprintln!("note: message channel unreachable; continuing without it");
                Self { base: None }
            }
        }
    }

    /// A handle that is always disabled (used by `check` and tests).
    pub fn disabled() -> Self {
        Self { base: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.base.is_some()
    }

    /// Idempotent identity registration.
    pub fn register_agent(&self, name: &str, program: &str, model: &str) {
        let Some(ref base) = self.base else { return };
        let result = agent().post(format!("{base}/agents/register")).send_json(json!({
            "name": name,
            "program": program,
            "model": model,
        }));
        if let Err(e) = result {
            tracing::warn!("oob register_agent failed: {e}");
        }
    }

    /// Send a message; returns the server-assigned ID when the channel is up.
    pub fn send_message(
        &self,
        from: &str,
        to: &[&str],
        subject: &str,
        body: &str,
        ack_required: bool,
    ) -> Option<String> {
        let base = self.base.as_ref()?;
        let result = agent().post(format!("{base}/messages")).send_json(json!({
            "from": from,
            "to": to,
            "subject": subject,
            "body": body,
            "ack_required": ack_required,
        }));
        match result {
            Ok(mut resp) => resp
                .body_mut()
                .read_json::<SendResponse>()
                .ok()
                .map(|r| r.id),
            Err(e) => {
                tracing::warn!("oob send_message failed: {e}");
                None
            }
        }
    }

    /// Fetch the inbox for `agent_name`, newest-last. Empty when disabled.
    pub fn fetch_inbox(&self, agent_name: &str, limit: u32) -> Vec<OobMessage> {
        let Some(ref base) = self.base else {
            return Vec::new();
        };
        let result = agent()
            .get(format!("{base}/inbox/{agent_name}"))
            .query("limit", limit.to_string())
            .call();
        match result {
            Ok(mut resp) => resp
                .body_mut()
                .read_json::<InboxResponse>()
                .map(|r| r.messages)
                .unwrap_or_default(),
            Err(e) => {
                tracing::warn!("oob fetch_inbox failed: {e}");
                Vec::new()
            }
        }
    }

    pub fn acknowledge(&self, agent_name: &str, message_id: &str) {
        let Some(ref base) = self.base else { return };
        let result = agent()
            .post(format!("{base}/messages/{message_id}/ack"))
            .send_json(json!({ "agent": agent_name }));
        if let Err(e) = result {
            tracing::warn!("oob acknowledge failed: {e}");
        }
    }

    /// Advisory path reservation for concurrent workers. Purely cooperative;
    /// false means the channel is down or the reservation was refused.
    pub fn reserve_paths(
        &self,
        agent_name: &str,
        globs: &[String],
        ttl_seconds: u64,
        exclusive: bool,
    ) -> bool {
        let Some(ref base) = self.base else {
            return false;
        };
        let result = agent().post(format!("{base}/reservations")).send_json(json!({
            "agent": agent_name,
            "globs": globs,
            "ttl_seconds": ttl_seconds,
            "exclusive": exclusive,
        }));
        match result {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("oob reserve_paths failed: {e}");
                false
            }
        }
    }

    /// Release every reservation held by `agent_name`.
    pub fn release(&self, agent_name: &str) {
        let Some(ref base) = self.base else { return };
        let result = agent()
            .delete(format!("{base}/reservations/{agent_name}"))
            .call();
        if let Err(e) = result {
            tracing::warn!("oob release failed: {e}");
        }
    }
}

fn agent() -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(Duration::from_secs(5)))
        .build()
        .into()
}
