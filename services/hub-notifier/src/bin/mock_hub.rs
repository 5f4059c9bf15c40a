//! Mock notification hub for testing
//!
//! A minimal SignalR-style hub speaking the JSON hub protocol over a plain
//! WebSocket. It answers the handshake, records group joins and pushes a
//! `PurchaseOrderNotification` to every client at a fixed interval.
//!
//! Usage:
//!   mock_hub [--port PORT] [--interval-secs SECS]
//!
//! Negotiation is not implemented, so clients must set `skip_negotiation`.
//! The port can also be set via the MOCK_HUB_PORT environment variable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn, Level};

const RECORD_SEPARATOR: char = '\u{1e}';

#[derive(Parser)]
#[command(name = "mock_hub")]
#[command(about = "Mock SignalR hub pushing purchase-order notifications")]
struct Args {
    /// Port to listen on (default: MOCK_HUB_PORT or 5000)
    #[arg(long)]
    port: Option<u16>,

    /// Seconds between pushed notifications
    #[arg(long, default_value = "5")]
    interval_secs: u64,

    /// Log level
    #[arg(short, long, default_value = "info", value_parser = clap::value_parser!(Level))]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .init();

    // Port priority: command line arg > environment variable > default (5000)
    let port = args
        .port
        .or_else(|| {
            std::env::var("MOCK_HUB_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
        })
        .unwrap_or(5000);

    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    info!("Mock hub listening on ws://{}", listener.local_addr()?);

    let interval = Duration::from_secs(args.interval_secs.max(1));
    let sequence = Arc::new(AtomicU64::new(1));

    loop {
        tokio::select! {
            accept = listener.accept() => {
                let (stream, addr) = accept?;
                info!("Connection from {}", addr);
                let sequence = sequence.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, interval, sequence).await {
                        warn!("Client {} failed: {}", addr, e);
                    }
                    info!("Client {} disconnected", addr);
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Mock hub shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    interval: Duration,
    sequence: Arc<AtomicU64>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws.split();
    let mut handshaken = false;
    let mut push = tokio::time::interval(interval);

    loop {
        tokio::select! {
            message = read.next() => {
                let text = match message {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                };

                for record in text.split(RECORD_SEPARATOR).filter(|r| !r.trim().is_empty()) {
                    let value: Value = serde_json::from_str(record)?;
                    if !handshaken {
                        debug!("Handshake: {}", value);
                        write.send(Message::text(format!("{{}}{}", RECORD_SEPARATOR))).await?;
                        handshaken = true;
                        continue;
                    }
                    match value.get("type").and_then(Value::as_u64) {
                        Some(1) => info!(
                            "Client invoked {} with {}",
                            value["target"], value["arguments"]
                        ),
                        Some(6) => {
                            debug!("Ping from client");
                            write.send(Message::text(record_of(&json!({"type": 6})))).await?;
                        }
                        Some(7) => {
                            info!("Client closed the hub connection");
                            return Ok(());
                        }
                        other => debug!("Ignoring message type {:?}", other),
                    }
                }
            }
            _ = push.tick(), if handshaken => {
                let n = sequence.fetch_add(1, Ordering::Relaxed);
                let invocation = json!({
                    "type": 1,
                    "target": "PurchaseOrderNotification",
                    "arguments": [purchase_order(n)],
                });
                debug!("Pushing purchase order {}", n);
                write.send(Message::text(record_of(&invocation))).await?;
            }
        }
    }
}

fn record_of(value: &Value) -> String {
    format!("{}{}", value, RECORD_SEPARATOR)
}

fn purchase_order(n: u64) -> Value {
    json!({
        "title": format!("Purchase order proposal #{}", n),
        "message": "Stock is running low, a restock is proposed",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "notificationType": "PurchaseOrder",
        "purchaseOrder": {
            "contragnetId": 1000 + n,
            "contragnetName": format!("Pharmacy {}", n),
            "items": [
                {
                    "medicineName": "Paracetamol",
                    "dosage": "500mg",
                    "quantity": 20 + n,
                    "minQuantity": 10,
                    "maxQuantity": 100,
                    "price": 2.75,
                    "currency": "UAH",
                    "form": "tablet"
                }
            ]
        }
    })
}
