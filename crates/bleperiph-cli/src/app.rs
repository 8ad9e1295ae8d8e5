//! Peripheral application wiring
//!
//! Opens the selected native stack, starts the manager on it and holds the
//! demo service definitions.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use bleperiph::{
    short_uuid, Characteristic, PeripheralBuilder, PeripheralError, PeripheralHandle,
    ServiceBuilder, ServiceDefinition, SessionInfo, SimulatedStack, UART_RX_CHARACTERISTIC_UUID,
    UART_SERVICE_UUID, UART_TX_CHARACTERISTIC_UUID,
};
#[cfg(all(feature = "bluez", target_os = "linux"))]
use bleperiph::BluezStack;

use crate::cli::Backend;
use crate::config::CliConfig;
use crate::error::{CliError, Result};

/// Counter service used by the notify demo
pub const COUNTER_SERVICE_UUID: Uuid = short_uuid(0xFFE0);
pub const COUNTER_CHARACTERISTIC_UUID: Uuid = short_uuid(0xFFE1);

// ----------------------------------------------------------------------------
// Application
// ----------------------------------------------------------------------------

/// A running peripheral manager plus the stack it runs on
pub struct PeripheralApp {
    config: CliConfig,
    handle: PeripheralHandle,
    simulated: Option<Arc<SimulatedStack>>,
}

impl PeripheralApp {
    pub async fn new(config: CliConfig, backend: Backend) -> Result<Self> {
        match backend {
            Backend::Simulated => Ok(Self::simulated(config)),
            Backend::Bluez => Self::bluez(config).await,
        }
    }

    /// Start on an in-memory stack
    pub fn simulated(config: CliConfig) -> Self {
        let stack = Arc::new(SimulatedStack::new());
        let handle = PeripheralBuilder::new(stack.clone())
            .with_config(config.peripheral.clone())
            .start();
        Self {
            config,
            handle,
            simulated: Some(stack),
        }
    }

    #[cfg(all(feature = "bluez", target_os = "linux"))]
    async fn bluez(config: CliConfig) -> Result<Self> {
        let stack = Arc::new(BluezStack::connect(config.bluez.clone()).await?);
        let handle = PeripheralBuilder::new(stack)
            .with_config(config.peripheral.clone())
            .start();
        Ok(Self {
            config,
            handle,
            simulated: None,
        })
    }

    #[cfg(not(all(feature = "bluez", target_os = "linux")))]
    async fn bluez(_config: CliConfig) -> Result<Self> {
        Err(CliError::FeatureNotAvailable(
            "the BlueZ backend needs the `bluez` feature on Linux".to_string(),
        ))
    }

    pub fn handle(&self) -> &PeripheralHandle {
        &self.handle
    }

    /// The in-memory stack, when running on one
    pub fn simulated_stack(&self) -> Option<&Arc<SimulatedStack>> {
        self.simulated.as_ref()
    }

    pub fn config(&self) -> &CliConfig {
        &self.config
    }

    /// Wait for the adapter to report powered on
    pub async fn wait_until_powered(&self) -> Result<()> {
        let mut state = self.handle.watch_adapter();
        let timeout = self.config.power_on_timeout();
        let result = match tokio::time::timeout(timeout, state.wait_for(|state| state.is_powered_on())).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(PeripheralError::Shutdown.into()),
            Err(_) => Err(CliError::AdapterNotReady(format!(
                "adapter still {} after {}s",
                self.handle.adapter_state(),
                timeout.as_secs()
            ))),
        };
        result
    }

    /// Define, publish and advertise a service under the configured name
    pub async fn serve(&self, service: ServiceDefinition) -> Result<SessionInfo> {
        let uuid = service.uuid;
        self.wait_until_powered().await?;

        let defined = self.handle.define(service).await?;
        self.handle.publish(uuid).await?;
        let session = self
            .handle
            .start_advertising(uuid, self.config.local_name.clone())
            .await?;

        info!(
            "Advertising {} as '{}' ({})",
            defined, self.config.local_name, session.id
        );
        Ok(session)
    }

    /// Stop advertising and shut the manager down
    pub async fn stop(&self) -> Result<()> {
        if self.handle.is_running() {
            if let Err(e) = self.handle.stop_advertising().await {
                warn!("Failed to stop advertising: {}", e);
            }
        }
        self.handle.shutdown().await?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Demo Services
// ----------------------------------------------------------------------------

/// UART-style service: centrals write TX and subscribe to RX
pub fn uart_service() -> ServiceDefinition {
    ServiceDefinition::new(UART_SERVICE_UUID)
        .with_characteristic(
            Characteristic::builder(UART_TX_CHARACTERISTIC_UUID)
                .write()
                .write_without_response()
                .description("TX")
                .build(),
        )
        .with_characteristic(
            Characteristic::builder(UART_RX_CHARACTERISTIC_UUID)
                .read()
                .notify()
                .description("RX")
                .build(),
        )
}

pub fn counter_service() -> Result<ServiceDefinition> {
    Ok(ServiceBuilder::parse("FFE0")
        .characteristic_with("FFE1", |characteristic| {
            characteristic.read().notify().description("Counter")
        })
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bleperiph::AdapterState;

    #[test]
    fn test_demo_services_validate() {
        assert!(uart_service().validate().is_ok());

        let counter = counter_service().unwrap();
        assert_eq!(counter.uuid, COUNTER_SERVICE_UUID);
        assert!(counter.characteristic(&COUNTER_CHARACTERISTIC_UUID).is_some());
    }

    #[tokio::test]
    async fn test_serve_publishes_and_advertises() {
        let app = PeripheralApp::simulated(CliConfig::default());
        let session = app.serve(uart_service()).await.unwrap();

        let stack = app.simulated_stack().unwrap();
        assert_eq!(stack.published_services(), vec![UART_SERVICE_UUID]);
        assert_eq!(stack.advertising().unwrap().local_name, "bleperiph");
        assert!(app.handle().info().await.unwrap().is_advertising());
        assert_eq!(
            app.handle().info().await.unwrap().advertising.map(|s| s.id),
            Some(session.id)
        );

        app.stop().await.unwrap();
        assert!(!stack.is_advertising());
        app.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_serve_times_out_without_power() {
        let mut config = CliConfig::default();
        config.power_on_timeout_secs = 1;
        let app = PeripheralApp::simulated(config);
        app.simulated_stack()
            .unwrap()
            .set_power(AdapterState::PoweredOff);

        let mut state = app.handle().watch_adapter();
        state
            .wait_for(|state| *state == AdapterState::PoweredOff)
            .await
            .unwrap();

        assert!(matches!(
            app.serve(uart_service()).await,
            Err(CliError::AdapterNotReady(_))
        ));
        app.stop().await.unwrap();
    }
}
