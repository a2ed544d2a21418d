use clap::Parser;
use std::sync::Arc;
use swrcache::channel::events::BackupStatus;
use swrcache::channel::{Notification, WsTransport};
use swrcache::{SwrClient, SwrConfig};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
  name = "swr-watch",
  about = "Follow an admin metrics push channel",
  version
)]
struct Args {
  #[arg(long, env = "SWRCACHE_URL")]
  url: Option<String>,
  #[arg(short, long)]
  config: Option<String>,
  #[arg(long)]
  log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
  let args = Args::parse();

  // Load config: explicit path > auto-detect > defaults
  let mut config = if let Some(path) = &args.config {
    SwrConfig::from_file(path)?
  } else {
    SwrConfig::find_and_load()?.unwrap_or_default()
  };

  if let Some(url) = args.url {
    config.channel.url = url;
  }
  if let Some(level) = args.log_level {
    config.logging.level = level;
  }

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  let client = SwrClient::new(config.clone());
  client.start_gc();

  let transport = Arc::new(WsTransport::new(&config.channel.url));
  let channel = client.push_channel(transport).build();
  let mut socket = client.use_metrics_socket(&channel);
  let mut notifications = socket.notifications();

  tracing::info!("Watching {}", config.channel.url);

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => {
        tracing::info!("Shutting down");
        break;
      }
      changed = socket.changed() => {
        if !changed {
          break;
        }
        if let Some(snapshot) = socket.metrics() {
          let system = &snapshot.metrics;
          tracing::info!(
            state = %socket.connection_state(),
            cpu = ?system.cpu.as_ref().and_then(|c| c.usage.clone()),
            memory = ?system.memory.as_ref().and_then(|m| m.usage_percent.clone()),
            uptime = ?system.application.as_ref().and_then(|a| a.uptime.clone()),
            services = snapshot.health.services.len(),
            "metrics"
          );
        }
      }
      received = notifications.recv() => match received {
        Ok(notification) => log_notification(notification),
        Err(RecvError::Lagged(n)) => tracing::warn!("Missed {} notifications", n),
        Err(RecvError::Closed) => break,
      }
    }
  }

  drop(socket);
  client.shutdown();
  Ok(())
}

fn log_notification(notification: Notification) {
  match notification {
    Notification::ServiceAlert(alert) => {
      tracing::warn!("Service {} is {}", alert.service, alert.status)
    }
    Notification::SessionTerminated(stats) => tracing::info!(%stats, "Session terminated"),
    Notification::Backup(progress) => match progress.status {
      BackupStatus::Failed => tracing::error!(
        "Backup failed: {}",
        progress.message.unwrap_or_default()
      ),
      status => tracing::info!(?status, message = ?progress.message, "Backup"),
    },
    Notification::BulkProgress(progress) => tracing::info!(
      kind = %progress.kind,
      "Bulk operation {:.0}% ({}/{})",
      progress.percent(),
      progress.completed,
      progress.total
    ),
    Notification::ServerError(message) => tracing::error!("Server error: {}", message),
  }
}
