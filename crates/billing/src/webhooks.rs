//! Provider webhook deliveries
//!
//! Parsing of the `{ "type", "data" }` envelope into the action the billing
//! service should take. Only called on bodies whose signature has already
//! been verified.

use serde::Deserialize;

use crate::error::{BillingError, BillingResult};
use crate::models::CHECKOUT_SUCCEEDED;

pub const HEADER_WEBHOOK_ID: &str = "webhook-id";
pub const HEADER_WEBHOOK_TIMESTAMP: &str = "webhook-timestamp";
pub const HEADER_WEBHOOK_SIGNATURE: &str = "webhook-signature";

/// One inbound delivery as received by the HTTP layer
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub webhook_id: String,
    pub timestamp: String,
    pub signature: String,
    /// Raw body bytes, unmodified
    pub body: Vec<u8>,
}

impl WebhookRequest {
    pub fn new(
        webhook_id: impl Into<String>,
        timestamp: impl Into<String>,
        signature: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            webhook_id: webhook_id.into(),
            timestamp: timestamp.into(),
            signature: signature.into(),
            body: body.into(),
        }
    }

    /// Build from header pairs; names match case-insensitively and absent
    /// headers are left empty for the verifier to reject.
    pub fn from_headers<'a, I>(headers: I, body: impl Into<Vec<u8>>) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut request = Self::new("", "", "", body);
        for (name, value) in headers {
            if name.eq_ignore_ascii_case(HEADER_WEBHOOK_ID) {
                request.webhook_id = value.to_string();
            } else if name.eq_ignore_ascii_case(HEADER_WEBHOOK_TIMESTAMP) {
                request.timestamp = value.to_string();
            } else if name.eq_ignore_ascii_case(HEADER_WEBHOOK_SIGNATURE) {
                request.signature = value.to_string();
            }
        }
        request
    }
}

/// Result of handling a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Subscription and quota were refreshed from the provider
    Synced {
        organization_id: uuid::Uuid,
        status: String,
    },
    /// Verified but not relevant (unknown type, unfinished checkout)
    Ignored { event_type: String },
    /// Already processed or being processed under the same webhook-id
    Duplicate,
}

/// Event types billing reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEventType {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionActive,
    SubscriptionCanceled,
    SubscriptionUncanceled,
    SubscriptionRevoked,
    CheckoutCreated,
    CheckoutUpdated,
    CheckoutCompleted,
    OrderPaid,
}

impl WebhookEventType {
    pub fn parse(event_type: &str) -> Option<Self> {
        Some(match event_type {
            "subscription.created" => Self::SubscriptionCreated,
            "subscription.updated" => Self::SubscriptionUpdated,
            "subscription.active" => Self::SubscriptionActive,
            "subscription.canceled" => Self::SubscriptionCanceled,
            "subscription.uncanceled" => Self::SubscriptionUncanceled,
            "subscription.revoked" => Self::SubscriptionRevoked,
            "checkout.created" => Self::CheckoutCreated,
            "checkout.updated" => Self::CheckoutUpdated,
            "checkout.completed" => Self::CheckoutCompleted,
            "order.paid" => Self::OrderPaid,
            _ => return None,
        })
    }

    fn is_checkout(self) -> bool {
        matches!(
            self,
            Self::CheckoutCreated | Self::CheckoutUpdated | Self::CheckoutCompleted
        )
    }
}

/// What a verified delivery asks billing to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAction {
    /// Refresh the customer's subscription from the provider
    Sync { external_customer_id: String },
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    pub event_type: String,
    pub action: WebhookAction,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: EventData,
}

#[derive(Debug, Default, Deserialize)]
struct EventData {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    customer_external_id: Option<String>,
    #[serde(default)]
    customer: Option<EventCustomer>,
}

#[derive(Debug, Default, Deserialize)]
struct EventCustomer {
    #[serde(default)]
    external_id: Option<String>,
}

impl EventData {
    fn nested_external_id(&self) -> Option<&str> {
        self.customer
            .as_ref()
            .and_then(|c| c.external_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    fn root_external_id(&self) -> Option<&str> {
        self.customer_external_id
            .as_deref()
            .filter(|id| !id.is_empty())
    }
}

/// Parse a verified body into the action to take
pub fn parse_event(raw_body: &[u8]) -> BillingResult<WebhookEvent> {
    let envelope: Envelope = serde_json::from_slice(raw_body)
        .map_err(|e| BillingError::InvalidPayload(format!("malformed webhook body: {}", e)))?;

    let Some(kind) = WebhookEventType::parse(&envelope.event_type) else {
        tracing::info!(event_type = %envelope.event_type, "Unhandled webhook event type");
        return Ok(WebhookEvent {
            event_type: envelope.event_type,
            action: WebhookAction::Ignore,
        });
    };

    let data = &envelope.data;
    let external_id = if kind.is_checkout() {
        if data.status.as_deref() != Some(CHECKOUT_SUCCEEDED) {
            tracing::debug!(
                event_type = %envelope.event_type,
                status = ?data.status,
                "Checkout not yet succeeded, nothing to sync"
            );
            return Ok(WebhookEvent {
                event_type: envelope.event_type,
                action: WebhookAction::Ignore,
            });
        }
        data.root_external_id().or_else(|| data.nested_external_id())
    } else {
        data.nested_external_id().or_else(|| data.root_external_id())
    };

    let external_customer_id = external_id
        .ok_or_else(|| {
            BillingError::InvalidPayload(format!(
                "{} event without an external customer id",
                envelope.event_type
            ))
        })?
        .to_string();

    Ok(WebhookEvent {
        event_type: envelope.event_type,
        action: WebhookAction::Sync {
            external_customer_id,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_id(body: &str) -> Option<String> {
        match parse_event(body.as_bytes()).unwrap().action {
            WebhookAction::Sync {
                external_customer_id,
            } => Some(external_customer_id),
            WebhookAction::Ignore => None,
        }
    }

    #[test]
    fn test_subscription_events_sync_nested_customer() {
        for kind in [
            "subscription.created",
            "subscription.updated",
            "subscription.active",
            "subscription.canceled",
            "subscription.uncanceled",
            "subscription.revoked",
        ] {
            let body = format!(
                r#"{{"type":"{}","data":{{"id":"sub_1","customer":{{"external_id":"org_a"}}}}}}"#,
                kind
            );
            assert_eq!(sync_id(&body).as_deref(), Some("org_a"), "{}", kind);
        }
    }

    #[test]
    fn test_subscription_falls_back_to_root_external_id() {
        let body = r#"{"type":"subscription.updated","data":{"customer":{},"customer_external_id":"org_b"}}"#;
        assert_eq!(sync_id(body).as_deref(), Some("org_b"));
    }

    #[test]
    fn test_checkout_only_syncs_when_succeeded() {
        let open = r#"{"type":"checkout.updated","data":{"status":"open","customer_external_id":"org_c"}}"#;
        assert_eq!(sync_id(open), None);

        let done = r#"{"type":"checkout.updated","data":{"status":"succeeded","customer_external_id":"org_c"}}"#;
        assert_eq!(sync_id(done).as_deref(), Some("org_c"));

        let nested = r#"{"type":"checkout.completed","data":{"status":"succeeded","customer":{"external_id":"org_d"}}}"#;
        assert_eq!(sync_id(nested).as_deref(), Some("org_d"));
    }

    #[test]
    fn test_order_paid_syncs() {
        let body = r#"{"type":"order.paid","data":{"customer":{"external_id":"org_e"}}}"#;
        assert_eq!(sync_id(body).as_deref(), Some("org_e"));
    }

    #[test]
    fn test_unknown_event_is_ignored() {
        let event = parse_event(br#"{"type":"benefit.granted","data":{}}"#).unwrap();
        assert_eq!(event.event_type, "benefit.granted");
        assert_eq!(event.action, WebhookAction::Ignore);
    }

    #[test]
    fn test_missing_external_id_is_invalid() {
        let result = parse_event(br#"{"type":"subscription.updated","data":{"customer":{"external_id":""}}}"#);
        assert!(matches!(result, Err(BillingError::InvalidPayload(_))));
    }

    #[test]
    fn test_malformed_body_is_invalid() {
        assert!(matches!(
            parse_event(b"not json"),
            Err(BillingError::InvalidPayload(_))
        ));
        assert!(matches!(
            parse_event(br#"{"data":{}}"#),
            Err(BillingError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_request_from_headers() {
        let request = WebhookRequest::from_headers(
            [
                ("Webhook-Id", "msg_1"),
                ("webhook-timestamp", "1760700000"),
                ("WEBHOOK-SIGNATURE", "v1,abc"),
                ("content-type", "application/json"),
            ],
            b"{}".to_vec(),
        );
        assert_eq!(request.webhook_id, "msg_1");
        assert_eq!(request.timestamp, "1760700000");
        assert_eq!(request.signature, "v1,abc");
        assert_eq!(request.body, b"{}");
    }
}
