//! Typed job payloads.
//!
//! Every job row stores its payload as JSON next to a `job_type` tag. This
//! module turns that pair into a [`JobPayload`] variant and validates it at
//! the submission boundary, so workers never trust a shape they did not check.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use super::error::JobError;

pub const WEBHOOK_PROCESSING: &str = "webhook_processing";
pub const AI_RESPONSE: &str = "ai_response";
pub const MESSAGE_DELIVERY: &str = "message_delivery";
pub const NOTIFICATION: &str = "notification";

/// Name of the payload field carrying the tenant identifier.
pub const TENANT_ID_FIELD: &str = "tenant_id";

lazy_static! {
    static ref JOB_TYPE_PATTERN: Regex = Regex::new(r"^[a-z0-9_.:-]{1,64}$").unwrap();
}

/// Inbound webhook event to be processed for a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub tenant_id: String,
    pub event_id: String,
    pub source: String,
    #[serde(default)]
    pub body: Value,
}

/// Request to generate an AI reply within a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiResponsePayload {
    pub tenant_id: String,
    pub conversation_id: String,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Outbound message to deliver on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDeliveryPayload {
    pub tenant_id: String,
    pub recipient_id: String,
    pub channel: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub tenant_id: String,
    pub user_id: String,
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// A job payload keyed by its type.
///
/// Known job types get a typed struct; anything else travels as
/// [`JobPayload::Opaque`] and only has its envelope validated.
#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    Webhook(WebhookPayload),
    AiResponse(AiResponsePayload),
    MessageDelivery(MessageDeliveryPayload),
    Notification(NotificationPayload),
    Opaque { job_type: String, data: Value },
}

impl JobPayload {
    /// Build and validate a payload from its stored or submitted parts.
    pub fn from_parts(job_type: &str, data: Value) -> Result<Self, JobError> {
        let payload = match job_type {
            WEBHOOK_PROCESSING => JobPayload::Webhook(decode(job_type, data)?),
            AI_RESPONSE => JobPayload::AiResponse(decode(job_type, data)?),
            MESSAGE_DELIVERY => JobPayload::MessageDelivery(decode(job_type, data)?),
            NOTIFICATION => JobPayload::Notification(decode(job_type, data)?),
            other => JobPayload::Opaque {
                job_type: other.to_string(),
                data,
            },
        };

        payload.validate()?;
        Ok(payload)
    }

    pub fn job_type(&self) -> &str {
        match self {
            JobPayload::Webhook(_) => WEBHOOK_PROCESSING,
            JobPayload::AiResponse(_) => AI_RESPONSE,
            JobPayload::MessageDelivery(_) => MESSAGE_DELIVERY,
            JobPayload::Notification(_) => NOTIFICATION,
            JobPayload::Opaque { job_type, .. } => job_type,
        }
    }

    pub fn tenant_id(&self) -> Option<&str> {
        match self {
            JobPayload::Webhook(p) => Some(p.tenant_id.as_str()),
            JobPayload::AiResponse(p) => Some(p.tenant_id.as_str()),
            JobPayload::MessageDelivery(p) => Some(p.tenant_id.as_str()),
            JobPayload::Notification(p) => Some(p.tenant_id.as_str()),
            JobPayload::Opaque { data, .. } => data.get(TENANT_ID_FIELD).and_then(Value::as_str),
        }
        .filter(|t| !t.trim().is_empty())
    }

    /// Serialize back to the JSON stored in the ledger.
    pub fn to_value(&self) -> Result<Value, JobError> {
        let value = match self {
            JobPayload::Webhook(p) => serde_json::to_value(p),
            JobPayload::AiResponse(p) => serde_json::to_value(p),
            JobPayload::MessageDelivery(p) => serde_json::to_value(p),
            JobPayload::Notification(p) => serde_json::to_value(p),
            JobPayload::Opaque { data, .. } => Ok(data.clone()),
        };
        value.map_err(|e| JobError::validation(format!("unserializable payload: {}", e)))
    }

    pub fn validate(&self) -> Result<(), JobError> {
        let job_type = self.job_type();
        if !JOB_TYPE_PATTERN.is_match(job_type) {
            return Err(JobError::validation(format!(
                "invalid job type {:?}",
                job_type
            )));
        }

        if let JobPayload::Opaque { data, .. } = self {
            if !data.is_object() {
                return Err(JobError::validation(format!(
                    "payload for {} must be a JSON object",
                    job_type
                )));
            }
        }

        if is_tenant_scoped(job_type) && self.tenant_id().is_none() {
            return Err(JobError::validation(format!(
                "{} payload is missing {}",
                job_type, TENANT_ID_FIELD
            )));
        }

        Ok(())
    }
}

/// Whether jobs of this type must run inside a tenant context.
pub fn is_tenant_scoped(job_type: &str) -> bool {
    matches!(
        job_type,
        WEBHOOK_PROCESSING | AI_RESPONSE | MESSAGE_DELIVERY | NOTIFICATION
    )
}

fn decode<T: DeserializeOwned>(job_type: &str, data: Value) -> Result<T, JobError> {
    serde_json::from_value(data)
        .map_err(|e| JobError::validation(format!("invalid {} payload: {}", job_type, e)))
}
