use std::collections::BTreeMap;
use std::sync::Arc;

use crate::log_store::DeliveryLog;
use crate::payload::PreparedEnvelope;
use crate::signature;
use crate::transport::Transport;
use crate::types::{DeliveryLogEntry, EntityKind, NewDelivery, Subscription, SIGNATURE_HEADER, TOKEN_HEADER};

/// Performs one POST per call and records exactly one log entry for it.
pub struct DeliveryExecutor {
    transport: Arc<dyn Transport>,
    log: Arc<DeliveryLog>,
    sign_payloads: bool,
}

impl DeliveryExecutor {
    pub fn new(transport: Arc<dyn Transport>, log: Arc<DeliveryLog>, sign_payloads: bool) -> Self {
        Self {
            transport,
            log,
            sign_payloads,
        }
    }

    pub fn log(&self) -> &Arc<DeliveryLog> {
        &self.log
    }

    pub fn request_headers(&self, subscription: &Subscription, body: &str) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers.insert(TOKEN_HEADER.to_string(), subscription.shared_secret.clone());
        if self.sign_payloads {
            headers.insert(
                SIGNATURE_HEADER.to_string(),
                signature::sign(&subscription.shared_secret, body.as_bytes()),
            );
        }
        headers
    }

    /// Never fails: transport errors become a status-0 entry. `None` only
    /// when the subscription was deleted while the request was in flight.
    pub async fn deliver(
        &self,
        subscription: &Subscription,
        envelope: &PreparedEnvelope,
        trigger_kind: EntityKind,
    ) -> Option<DeliveryLogEntry> {
        let headers = self.request_headers(subscription, &envelope.body);

        let (response_status, response_body, response_headers) = match self
            .transport
            .post(&subscription.target_url, &headers, &envelope.body)
            .await
        {
            Ok(resp) => {
                tracing::info!(
                    subscription_id = subscription.id,
                    kind = %trigger_kind,
                    status = resp.status,
                    "webhook delivered"
                );
                (resp.status, resp.body, resp.headers)
            }
            Err(e) => {
                tracing::warn!(
                    subscription_id = subscription.id,
                    kind = %trigger_kind,
                    url = %subscription.target_url,
                    error = %e,
                    "webhook delivery failed"
                );
                (0, e.to_string(), BTreeMap::new())
            }
        };

        self.log.append(NewDelivery {
            subscription_id: subscription.id,
            trigger_kind,
            request_url: subscription.target_url.clone(),
            request_body: envelope.value.as_ref().clone(),
            request_headers: headers,
            response_status,
            response_body,
            response_headers,
        })
    }
}
