//! Profile-admission gate client.
//!
//! Image-content moderation lives outside the relay; this module only
//! fetches its opaque accept/reject decision before a profile is allowed
//! to register. With no endpoint configured, every profile is approved.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::Profile;

/// Errors that can occur while consulting the gate.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Profile rejected: {reason}")]
    Rejected { reason: String },
}

/// Submission sent to the gate for screening.
#[derive(Debug, Serialize)]
struct Submission<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    avatar: Option<&'a str>,
}

/// The gate's decision.
#[derive(Debug, Deserialize)]
struct Decision {
    approved: bool,
    #[serde(default)]
    reason: Option<String>,
}

/// Client for the external profile-admission gate.
#[derive(Debug, Clone)]
pub struct GateClient {
    client: Client,
    endpoint: Option<String>,
}

impl GateClient {
    /// Create a gate client. `endpoint` is the screening service URL; when
    /// absent the gate approves everything.
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint,
        }
    }

    /// Screen a profile before registration.
    ///
    /// Returns `Ok(())` when approved. Rejection and transport failures both
    /// keep the profile out; the caller decides how loudly to log.
    pub async fn screen(&self, profile: &Profile) -> Result<(), GateError> {
        let Some(endpoint) = &self.endpoint else {
            return Ok(());
        };

        let submission = Submission {
            id: &profile.id,
            avatar: profile.avatar.as_deref(),
        };
        let response = self
            .client
            .post(endpoint)
            .json(&submission)
            .send()
            .await?
            .error_for_status()?;

        let decision: Decision = response.json().await?;
        if decision.approved {
            Ok(())
        } else {
            Err(GateError::Rejected {
                reason: decision
                    .reason
                    .unwrap_or_else(|| "unspecified".to_string()),
            })
        }
    }
}
