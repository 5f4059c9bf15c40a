//! Typed views of notification payloads
//!
//! Payloads are stored untouched as JSON; these structs are the shapes the
//! backend is known to send. Unknown fields are ignored and most fields are
//! optional because the server is not strict about them.

use serde::{Deserialize, Serialize};

/// Payload of a `PurchaseOrderNotification` invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseOrderNotification {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    pub purchase_order: PurchaseOrderProposal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub notification_type: String,
}

/// Proposed order for a counterparty
///
/// The backend spells the counterparty fields `contragnet*`; that spelling is
/// kept on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PurchaseOrderProposal {
    #[serde(rename = "contragnetId", default)]
    pub contragent_id: Option<i64>,
    #[serde(rename = "contragnetName", default)]
    pub contragent_name: Option<String>,
    #[serde(rename = "leadId", default, skip_serializing_if = "Option::is_none")]
    pub lead_id: Option<i64>,
    #[serde(default)]
    pub items: Vec<PurchaseOrderItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseOrderItem {
    #[serde(default)]
    pub medicine_name: String,
    #[serde(default)]
    pub dosage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_quantity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_quantity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub form: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusNotification {
    pub order_id: String,
    pub status: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    Warning,
    Error,
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemAlertNotification {
    pub alert_type: AlertType,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn purchase_order_with_backend_spelling() {
        let payload = json!({
            "title": "New proposal",
            "message": "Restock suggested",
            "notificationType": "PurchaseOrder",
            "purchaseOrder": {
                "contragnetId": 17,
                "contragnetName": "Apteka Plus",
                "items": [
                    {"medicineName": "Ibuprofen", "dosage": "200mg", "quantity": 40,
                     "price": 3.5, "currency": "UAH", "form": "tablet", "sku": "ignored"}
                ]
            },
            "extra": true
        });
        let parsed: PurchaseOrderNotification = serde_json::from_value(payload).unwrap();
        assert_eq!(parsed.purchase_order.contragent_id, Some(17));
        assert_eq!(
            parsed.purchase_order.contragent_name.as_deref(),
            Some("Apteka Plus")
        );
        assert!(parsed.purchase_order.lead_id.is_none());
        assert_eq!(parsed.purchase_order.items[0].quantity, Some(40.0));
        assert!(parsed.timestamp.is_none());
    }

    #[test]
    fn system_alert_types_are_lowercase() {
        let alert: SystemAlertNotification =
            serde_json::from_value(json!({"alertType": "warning", "title": "Disk", "message": "low"}))
                .unwrap();
        assert_eq!(alert.alert_type, AlertType::Warning);
        assert!(serde_json::from_value::<SystemAlertNotification>(json!({"alertType": "fatal"})).is_err());
    }
}
