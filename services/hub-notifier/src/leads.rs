//! "Add to lead" action for purchase-order notifications
//!
//! A proposal that already references a lead gets its items appended to that
//! lead. Otherwise a new in-progress lead is created for the counterparty and
//! the items are added to it.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::auth::TokenProvider;
use crate::config::LeadsConfig;
use crate::error::{HubError, Result};
use crate::io::{HttpClient, HttpResponse};
use crate::types::PurchaseOrderNotification;

/// Lead status assigned to newly created leads
const LEAD_STATUS_IN_PROGRESS: u32 = 1;

#[derive(Debug, Deserialize)]
struct CreatedLead {
    #[serde(default)]
    id: Option<i64>,
}

/// What [`LeadClient::add_to_lead`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeadUpdate {
    pub lead_id: i64,
    pub created: bool,
    pub items_added: usize,
}

pub struct LeadClient {
    api_base_url: String,
    http: Arc<dyn HttpClient>,
    token_provider: TokenProvider,
}

impl LeadClient {
    pub fn new(config: &LeadsConfig, token_provider: TokenProvider, http: Arc<dyn HttpClient>) -> Self {
        Self {
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            http,
            token_provider,
        }
    }

    pub async fn add_to_lead(&self, notification: &PurchaseOrderNotification) -> Result<LeadUpdate> {
        let proposal = &notification.purchase_order;
        if proposal.items.is_empty() {
            return Err(HubError::InvalidEvent(
                "Purchase order has no items".to_string(),
            ));
        }
        let token = self.token_provider.get_token().await;

        let (lead_id, created) = match proposal.lead_id {
            Some(lead_id) => (lead_id, false),
            None => {
                let (Some(contragent_id), Some(_)) =
                    (proposal.contragent_id, proposal.contragent_name.as_ref())
                else {
                    return Err(HubError::InvalidEvent(
                        "Missing contragent information, cannot create lead".to_string(),
                    ));
                };
                (self.create_lead(contragent_id, token.as_str()).await?, true)
            }
        };

        let items = serde_json::to_value(&proposal.items)?;
        let url = format!("{}/api/PurchaseOrder/{}", self.api_base_url, lead_id);
        let response = self.http.post_json(&url, token.as_str(), &items).await?;
        check_status(&response, "Failed to add items to lead")?;

        info!("Added {} item(s) to lead {}", proposal.items.len(), lead_id);
        Ok(LeadUpdate {
            lead_id,
            created,
            items_added: proposal.items.len(),
        })
    }

    async fn create_lead(&self, contragent_id: i64, bearer: &str) -> Result<i64> {
        let url = format!("{}/api/Lead", self.api_base_url);
        let body: Value = json!({
            "contragentId": contragent_id,
            "startDate": Utc::now().to_rfc3339(),
            "status": LEAD_STATUS_IN_PROGRESS,
        });
        debug!("Creating lead for contragent {}", contragent_id);

        let response = self.http.post_json(&url, bearer, &body).await?;
        check_status(&response, "Failed to create lead")?;

        let created: CreatedLead = serde_json::from_str(&response.body)?;
        created
            .id
            .ok_or_else(|| HubError::Http("Created lead but no id was returned".to_string()))
    }
}

fn check_status(response: &HttpResponse, context: &str) -> Result<()> {
    if response.is_success() {
        Ok(())
    } else {
        Err(HubError::Http(format!(
            "{}: status {} {}",
            context, response.status, response.body
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MockHttpClient;
    use crate::types::{PurchaseOrderItem, PurchaseOrderProposal};

    fn notification(lead_id: Option<i64>, contragent_id: Option<i64>) -> PurchaseOrderNotification {
        PurchaseOrderNotification {
            title: "Proposal".to_string(),
            message: String::new(),
            purchase_order: PurchaseOrderProposal {
                contragent_id,
                contragent_name: contragent_id.map(|_| "Apteka".to_string()),
                lead_id,
                items: vec![PurchaseOrderItem {
                    medicine_name: "Aspirin".to_string(),
                    quantity: Some(10.0),
                    ..Default::default()
                }],
            },
            timestamp: None,
            notification_type: "PurchaseOrder".to_string(),
        }
    }

    fn client(http: MockHttpClient) -> LeadClient {
        LeadClient::new(
            &LeadsConfig {
                api_base_url: "https://api.example.com/".to_string(),
            },
            TokenProvider::anonymous(),
            Arc::new(http),
        )
    }

    fn ok(body: &str) -> HttpResponse {
        HttpResponse {
            status: 200,
            body: body.to_string(),
        }
    }

    #[tokio::test]
    async fn existing_lead_gets_items() {
        let mut http = MockHttpClient::new();
        http.expect_post_json()
            .times(1)
            .withf(|url, _, body| {
                url == "https://api.example.com/api/PurchaseOrder/42"
                    && body[0]["medicineName"] == "Aspirin"
            })
            .returning(|_, _, _| Box::pin(async { Ok(ok("")) }));

        let update = client(http).add_to_lead(&notification(Some(42), None)).await.unwrap();
        assert_eq!(
            update,
            LeadUpdate {
                lead_id: 42,
                created: false,
                items_added: 1
            }
        );
    }

    #[tokio::test]
    async fn missing_lead_is_created_first() {
        let mut http = MockHttpClient::new();
        let mut sequence = mockall::Sequence::new();
        http.expect_post_json()
            .times(1)
            .in_sequence(&mut sequence)
            .withf(|url, _, body| {
                url == "https://api.example.com/api/Lead"
                    && body["contragentId"] == 7
                    && body["status"] == 1
            })
            .returning(|_, _, _| Box::pin(async { Ok(ok(r#"{"id": 99}"#)) }));
        http.expect_post_json()
            .times(1)
            .in_sequence(&mut sequence)
            .withf(|url, _, _| url == "https://api.example.com/api/PurchaseOrder/99")
            .returning(|_, _, _| Box::pin(async { Ok(ok("")) }));

        let update = client(http).add_to_lead(&notification(None, Some(7))).await.unwrap();
        assert_eq!(update.lead_id, 99);
        assert!(update.created);
    }

    #[tokio::test]
    async fn missing_contragent_is_invalid() {
        let mut http = MockHttpClient::new();
        http.expect_post_json().never();

        let err = client(http).add_to_lead(&notification(None, None)).await.unwrap_err();
        assert!(matches!(err, HubError::InvalidEvent(_)));
    }

    #[tokio::test]
    async fn server_error_is_http_error() {
        let mut http = MockHttpClient::new();
        http.expect_post_json().returning(|_, _, _| {
            Box::pin(async {
                Ok(HttpResponse {
                    status: 500,
                    body: "boom".to_string(),
                })
            })
        });

        let err = client(http).add_to_lead(&notification(Some(1), None)).await.unwrap_err();
        assert!(matches!(err, HubError::Http(_)));
    }
}
