//! Hub Notifier CLI
//!
//! Connects to a notification hub and logs the feed as it changes.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use hub_notifier::io::ReqwestHttpClient;
use hub_notifier::{
    load_config, Config, LeadClient, Notification, NotificationHub, NotificationKind,
    TokenProvider,
};
use tracing::{debug, info, warn, Level};

#[derive(Parser)]
#[command(name = "hub-notifier")]
#[command(about = "Real-time notification client for a SignalR hub")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend base URL (overrides config file)
    #[arg(long)]
    url: Option<String>,

    /// Log level
    #[arg(short, long, default_value = "info", value_parser = clap::value_parser!(Level))]
    log_level: Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the hub and report the connection state
    Status,

    /// Connect to the hub and log notifications until interrupted
    Monitor {
        /// Add every purchase-order proposal to a lead (requires `leads` config)
        #[arg(long)]
        add_to_lead: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .init();

    debug!(
        "Parsed command line arguments: config={:?}, url={:?}, log_level={:?}",
        args.config, args.url, args.log_level
    );

    let mut config = match &args.config {
        Some(path) => {
            debug!("Loading configuration from {:?}", path);
            load_config(path)?
        }
        None => Config::default(),
    };
    if let Some(url) = args.url {
        config.hub.base_url = url;
    }
    config.resolve_secrets()?;
    config.hub.validate()?;

    let http = Arc::new(ReqwestHttpClient::default());
    let token_provider = TokenProvider::from_config(&config.auth, http.clone());
    let hub = NotificationHub::new(config.hub.clone(), token_provider.clone());

    match args.command {
        Commands::Status => run_status(&hub).await?,
        Commands::Monitor { add_to_lead } => {
            let leads = match (&config.leads, add_to_lead) {
                (Some(leads), true) => Some(LeadClient::new(leads, token_provider, http)),
                (None, true) => {
                    warn!("--add-to-lead needs a `leads` section in the configuration, ignoring");
                    None
                }
                _ => None,
            };
            run_monitor(&hub, leads.as_ref()).await?;
        }
    }

    Ok(())
}

async fn run_status(hub: &NotificationHub) -> Result<(), Box<dyn std::error::Error>> {
    info!("Connecting to {}...", hub.connection().hub_url());
    hub.start().await?;
    info!("Connection state: {}", hub.connection().state());
    hub.stop().await;
    Ok(())
}

async fn run_monitor(
    hub: &NotificationHub,
    leads: Option<&LeadClient>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut feed = hub.store().subscribe();
    let mut states = hub.connection().subscribe_state();

    info!("Connecting to {}...", hub.connection().hub_url());
    hub.start().await?;
    info!("Monitoring notifications (press Ctrl+C to stop)...");

    let mut seen = 0usize;
    loop {
        tokio::select! {
            changed = feed.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = feed.borrow_and_update().clone();
                let fresh = snapshot.len().saturating_sub(seen);
                seen = snapshot.len();
                for notification in snapshot.iter().take(fresh).rev() {
                    print_notification(notification);
                    if let Some(leads) = leads {
                        add_to_lead(leads, notification).await;
                    }
                }
                info!("Unread notifications: {}", hub.store().unread_count());
            }
            state = states.recv() => {
                match state {
                    Ok(state) => info!("Connection: {}", state),
                    Err(e) => debug!("State receiver error: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    hub.stop().await;
    Ok(())
}

fn print_notification(notification: &Notification) {
    match &notification.kind {
        NotificationKind::PurchaseOrder => match notification.as_purchase_order() {
            Ok(order) => info!(
                "Purchase order: {} - {} ({}, {} item(s))",
                order.title,
                order.message,
                order
                    .purchase_order
                    .contragent_name
                    .as_deref()
                    .unwrap_or("unknown contragent"),
                order.purchase_order.items.len()
            ),
            Err(e) => info!(
                "Purchase order {} with unexpected payload ({}): {}",
                notification.id, e, notification.payload
            ),
        },
        NotificationKind::OrderStatus => match notification.as_order_status() {
            Ok(status) => info!(
                "Order {} is {}: {}",
                status.order_id, status.status, status.message
            ),
            Err(_) => info!("Order status: {}", notification.payload),
        },
        NotificationKind::SystemAlert => match notification.as_system_alert() {
            Ok(alert) => info!(
                "System alert ({:?}): {} - {}",
                alert.alert_type, alert.title, alert.message
            ),
            Err(_) => info!("System alert: {}", notification.payload),
        },
        NotificationKind::Other(tag) => info!("{}: {}", tag, notification.payload),
    }
}

async fn add_to_lead(leads: &LeadClient, notification: &Notification) {
    if notification.kind != NotificationKind::PurchaseOrder {
        return;
    }
    let order = match notification.as_purchase_order() {
        Ok(order) => order,
        Err(e) => {
            warn!("Cannot add {} to a lead: {}", notification.id, e);
            return;
        }
    };
    match leads.add_to_lead(&order).await {
        Ok(update) if update.created => info!(
            "Created lead {} with {} item(s)",
            update.lead_id, update.items_added
        ),
        Ok(update) => info!(
            "Added {} item(s) to lead {}",
            update.items_added, update.lead_id
        ),
        Err(e) => warn!("Failed to add {} to a lead: {}", notification.id, e),
    }
}
