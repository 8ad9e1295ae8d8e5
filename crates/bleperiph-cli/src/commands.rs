//! Command handlers for the bleperiph CLI

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use bleperiph::native::simulated::StackCall;
use bleperiph::{
    DeliveryReport, EventFilter, EventKind, NotifyTarget, PeripheralEvent, PeripheralInfo,
    SimulatedStack, UART_RX_CHARACTERISTIC_UUID, UART_TX_CHARACTERISTIC_UUID,
};

use crate::app::{counter_service, uart_service, PeripheralApp, COUNTER_CHARACTERISTIC_UUID};
use crate::cli::Commands;
use crate::config::CliConfig;
use crate::error::Result;

/// Central the simulated backend drives through the UART demo
pub const SIMULATED_CENTRAL: &str = "sim-central";

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(command: Commands, app: &PeripheralApp) -> Result<()> {
        match command {
            Commands::Uart { duration } => {
                let echoed =
                    Self::handle_uart_command(app, duration.map(Duration::from_secs)).await?;
                println!("Echoed {} writes", echoed);
                Ok(())
            }
            Commands::Notify {
                message,
                count,
                interval_ms,
            } => {
                let reports = Self::handle_notify_command(
                    app,
                    &message,
                    count,
                    Duration::from_millis(interval_ms),
                )
                .await?;
                let delivered: usize = reports.iter().map(DeliveryReport::delivered_count).sum();
                let refused: usize = reports.iter().map(DeliveryReport::rejected_count).sum();
                println!(
                    "Sent {} notifications: {} deliveries, {} refused",
                    reports.len(),
                    delivered,
                    refused
                );
                Ok(())
            }
            Commands::Info => {
                let info = Self::handle_info_command(app).await?;
                println!("{}", serde_json::to_string_pretty(&info)?);
                Ok(())
            }
            Commands::ExampleConfig => {
                println!("{}", CliConfig::example_config());
                Ok(())
            }
        }
    }

    /// Echo every write on TX back to RX subscribers; returns the echo count.
    ///
    /// Runs until Ctrl+C or the duration elapses. On the simulated backend a
    /// scripted central writes a few lines and the demo ends when it leaves.
    pub async fn handle_uart_command(
        app: &PeripheralApp,
        duration: Option<Duration>,
    ) -> Result<usize> {
        let handle = app.handle();
        let mut events = handle.subscribe(EventFilter::only([
            EventKind::Write,
            EventKind::Connection,
            EventKind::Subscription,
        ]));
        app.serve(uart_service()).await?;

        let script = app
            .simulated_stack()
            .cloned()
            .map(|stack| tokio::spawn(simulate_uart_central(stack)));
        if script.is_none() {
            println!("Waiting for centrals... Press Ctrl+C to stop");
        }

        let deadline = async {
            match duration {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let mut echoed = 0;
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        PeripheralEvent::WriteRequest(write) => {
                            println!(
                                "{} wrote {} bytes: {} ({})",
                                write.central,
                                write.value.len(),
                                hex::encode(&write.value),
                                String::from_utf8_lossy(&write.value)
                            );
                            let report = handle
                                .notify(UART_RX_CHARACTERISTIC_UUID, write.value, NotifyTarget::AllSubscribed)
                                .await?;
                            debug!(
                                "Echo {}: {} delivered, {} queued",
                                report.notification,
                                report.delivered_count(),
                                report.queued_count()
                            );
                            echoed += 1;
                        }
                        PeripheralEvent::CentralConnected { central, max_update_len } => {
                            println!("{} connected (max update {} bytes)", central, max_update_len);
                        }
                        PeripheralEvent::SubscriptionChanged { central, enabled, .. } => {
                            let action = if enabled { "subscribed to" } else { "unsubscribed from" };
                            println!("{} {} RX", central, action);
                        }
                        PeripheralEvent::CentralDisconnected { central, .. } => {
                            println!("{} disconnected", central);
                            if script.is_some() && central.as_str() == SIMULATED_CENTRAL {
                                break;
                            }
                        }
                        _ => {}
                    }
                }
                _ = &mut deadline => {
                    info!("Demo duration elapsed");
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    break;
                }
            }
        }

        if let Some(script) = script {
            script.abort();
        }
        Ok(echoed)
    }

    /// Notify the counter characteristic `count` times.
    ///
    /// On the simulated backend two centrals with different max update
    /// lengths subscribe first, so long messages show per-central limits.
    pub async fn handle_notify_command(
        app: &PeripheralApp,
        message: &str,
        count: u32,
        interval: Duration,
    ) -> Result<Vec<DeliveryReport>> {
        let handle = app.handle();
        app.serve(counter_service()?).await?;

        if let Some(stack) = app.simulated_stack() {
            stack.subscribe("sim-small", COUNTER_CHARACTERISTIC_UUID, 20);
            stack.subscribe("sim-large", COUNTER_CHARACTERISTIC_UUID, 512);
        }

        let mut reports = Vec::new();
        for sequence in 1..=count {
            let payload = format!("{} #{}", message, sequence).into_bytes();
            let report = handle
                .notify(COUNTER_CHARACTERISTIC_UUID, payload, NotifyTarget::AllSubscribed)
                .await?;
            if report.targets.is_empty() {
                println!("{}: no subscribers", report.notification);
            }
            for target in &report.targets {
                println!("{} -> {}: {:?}", report.notification, target.central, target.status);
            }
            reports.push(report);

            if sequence < count {
                tokio::time::sleep(interval).await;
            }
        }
        Ok(reports)
    }

    /// Serve the UART service, define the counter one and snapshot the state
    pub async fn handle_info_command(app: &PeripheralApp) -> Result<PeripheralInfo> {
        app.serve(uart_service()).await?;
        app.handle().define(counter_service()?).await?;
        Ok(app.handle().info().await?)
    }
}

/// Subscribe, write a few lines and wait for each echo before leaving
async fn simulate_uart_central(stack: Arc<SimulatedStack>) {
    stack.subscribe(SIMULATED_CENTRAL, UART_RX_CHARACTERISTIC_UUID, 185);

    for line in ["hello", "from", "a simulated central"] {
        stack.write(
            SIMULATED_CENTRAL,
            UART_TX_CHARACTERISTIC_UUID,
            line.as_bytes().to_vec(),
            true,
        );
        stack
            .until_call(|call| {
                matches!(call, StackCall::SendValue { value, .. } if value.as_slice() == line.as_bytes())
            })
            .await;
    }

    stack.disconnect(SIMULATED_CENTRAL);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bleperiph::{CentralId, DeliveryStatus};

    #[tokio::test]
    async fn test_uart_echoes_simulated_writes() {
        let app = PeripheralApp::simulated(CliConfig::default());

        let echoed = CommandDispatcher::handle_uart_command(&app, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(echoed, 3);

        let stack = app.simulated_stack().unwrap();
        let echoes: Vec<Vec<u8>> = stack
            .sent_values()
            .into_iter()
            .map(|sent| sent.value)
            .collect();
        assert_eq!(
            echoes,
            vec![
                b"hello".to_vec(),
                b"from".to_vec(),
                b"a simulated central".to_vec()
            ]
        );
        app.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_notify_respects_connection_limits() {
        let app = PeripheralApp::simulated(CliConfig::default());

        let reports = CommandDispatcher::handle_notify_command(
            &app,
            "bleperiph notification",
            2,
            Duration::ZERO,
        )
        .await
        .unwrap();

        assert_eq!(reports.len(), 2);
        for report in &reports {
            assert!(matches!(
                report.status_for(&CentralId::from("sim-small")),
                Some(DeliveryStatus::PayloadTooLarge { max: 20, .. })
            ));
            assert_eq!(
                report.status_for(&CentralId::from("sim-large")),
                Some(&DeliveryStatus::Delivered)
            );
        }
        app.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_info_reports_demo_services() {
        let app = PeripheralApp::simulated(CliConfig::default());

        let info = CommandDispatcher::handle_info_command(&app).await.unwrap();
        assert!(info.is_advertising());
        assert_eq!(info.services.len(), 2);
        assert_eq!(info.services.iter().filter(|s| s.published).count(), 1);

        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("PoweredOn"));
        app.stop().await.unwrap();
    }
}
