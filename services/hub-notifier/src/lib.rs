//! Hub Notifier
//!
//! Real-time notification client for a SignalR hub: a reconnecting push
//! connection, a normalizer that turns server events into notifications, and
//! an in-memory newest-first feed.

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod io;
pub mod leads;
pub mod notification;
pub mod oauth;
pub mod protocol;
pub mod service;
pub mod store;
pub mod types;

pub use auth::{AccessToken, AuthError, NoAuth, StaticTokenSource, TokenProvider, TokenSource};
pub use config::{load_config, AuthConfig, Config, HubConfig, LeadsConfig, ReconnectConfig};
pub use connection::{wait_for_state, HubConnection, InvocationStream};
pub use error::{HubError, Result};
pub use events::ConnectionState;
pub use leads::{LeadClient, LeadUpdate};
pub use notification::{normalize, payload_from_arguments, Notification, NotificationKind};
pub use oauth::OAuthTokenSource;
pub use service::NotificationHub;
pub use store::NotificationStore;
pub use types::{
    AlertType, OrderStatusNotification, PurchaseOrderItem, PurchaseOrderNotification,
    PurchaseOrderProposal, SystemAlertNotification,
};
