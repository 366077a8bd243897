// Loopback demo: a central and a peripheral sharing an in-memory radio
//
// The peripheral serves a counter service; the central discovers it,
// subscribes, reads, writes and receives notifications.

use anyhow::{bail, Context, Result};
use colored::*;
use gattlink_core::central::{CentralListener, CentralState, DisconnectReason};
use gattlink_core::codec;
use gattlink_core::gatt::uuid_from_short;
use gattlink_core::loopback::{run_router, LoopbackRadio};
use gattlink_core::peripheral::PeripheralListener;
use gattlink_core::{
    AdvertiseSettings, CapabilitySpec, CentralController, CharId, Characteristic, DeviceId,
    GattLinkConfig, Peripheral, PeripheralRegistry, ServiceDefinition, ServiceId,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub fn counter_service() -> ServiceId {
    uuid_from_short(0xFFE0)
}

pub fn counter() -> CharId {
    uuid_from_short(0xFFE1)
}

/// Write-without-response characteristic that resets the counter
pub fn reset() -> CharId {
    uuid_from_short(0xFFE2)
}

pub fn counter_registry() -> Result<PeripheralRegistry> {
    let definition = ServiceDefinition::new(counter_service())
        .on_read(counter(), |_, _| Ok(()))
        .on_write(counter(), |req, res| {
            res.write(req.value.clone());
            Ok(())
        })
        .notifiable(counter())
        .initial_value(counter(), codec::encode_u32_le(0).to_vec())
        .on_write_with(reset(), false, |req, _| {
            debug!("Reset requested by {}", req.device);
            Ok(())
        });
    PeripheralRegistry::from_definitions([definition]).context("Failed to build counter service")
}

fn counter_spec() -> CapabilitySpec {
    CapabilitySpec::builder(counter_service())
        .observable(counter())
        .readable(counter())
        .writable(counter())
        .sendable(reset())
        .build()
}

#[derive(Debug)]
enum DemoEvent {
    State(CentralState),
    Ready,
    Disconnected(DisconnectReason, String),
    Changed(Option<u32>),
    Read(bool, Option<u32>),
    Written(bool),
    ScanFailure(i32),
}

struct DemoListener(mpsc::UnboundedSender<DemoEvent>);

impl DemoListener {
    fn forward(&self, event: DemoEvent) {
        let _ = self.0.send(event);
    }
}

impl CentralListener for DemoListener {
    fn on_state_changed(&self, service_id: ServiceId, state: CentralState) {
        info!("Central {} for {}", state, service_id);
        self.forward(DemoEvent::State(state));
    }

    fn on_subscriptions_ready(&self) {
        self.forward(DemoEvent::Ready);
    }

    fn on_disconnected(&self, reason: DisconnectReason, message: &str) {
        self.forward(DemoEvent::Disconnected(reason, message.to_string()));
    }

    fn on_characteristic_changed(&self, characteristic: &Characteristic) {
        self.forward(DemoEvent::Changed(characteristic.int_value()));
    }

    fn on_characteristic_read(&self, success: bool, characteristic: &Characteristic) {
        self.forward(DemoEvent::Read(success, characteristic.int_value()));
    }

    fn on_characteristic_write(&self, success: bool, _characteristic: &Characteristic) {
        self.forward(DemoEvent::Written(success));
    }

    fn on_scan_failure(&self, code: i32) {
        self.forward(DemoEvent::ScanFailure(code));
    }
}

struct AdvertiserLog;

impl PeripheralListener for AdvertiserLog {
    fn on_advertise_success(&self, settings: &AdvertiseSettings) {
        info!("Advertising ({:?}, {:?})", settings.mode, settings.tx_power);
    }

    fn on_advertise_failure(&self, code: i32) {
        info!("Advertising failed with code {}", code);
    }

    fn on_connection_state_changed(&self, device: &DeviceId, connected: bool) {
        info!(
            "Peripheral sees {} {}",
            device,
            if connected { "connected" } else { "disconnected" }
        );
    }
}

fn show_value(value: Option<u32>) -> String {
    value.map_or_else(|| "?".to_string(), |v| v.to_string())
}

/// Wait for the next event the predicate accepts, skipping the rest
async fn wait_for<T>(
    events: &mut mpsc::UnboundedReceiver<DemoEvent>,
    what: &str,
    mut accept: impl FnMut(DemoEvent) -> Option<Result<T>>,
) -> Result<T> {
    loop {
        let event = tokio::time::timeout(STEP_TIMEOUT, events.recv())
            .await
            .with_context(|| format!("Timed out waiting for {}", what))?
            .context("Central listener closed")?;
        debug!("Demo event {:?}", event);
        if let DemoEvent::ScanFailure(code) = event {
            bail!("Scan failed with code {}", code);
        }
        if let Some(outcome) = accept(event) {
            return outcome;
        }
    }
}

pub async fn run(config: GattLinkConfig, writes: u32) -> Result<()> {
    let (radio, radio_events) =
        LoopbackRadio::new(DeviceId::from("demo-central"), DeviceId::from("demo-counter"));

    let peripheral = Arc::new(Peripheral::new(
        Arc::new(radio.peripheral()),
        counter_registry()?,
        config.peripheral.clone(),
        Arc::new(AdvertiserLog),
    ));
    let (tx, mut events) = mpsc::unbounded_channel();
    let central = CentralController::new(
        Arc::new(radio.central()),
        config.central.clone(),
        Arc::new(DemoListener(tx)),
    )
    .context("Failed to create central")?;
    let router = tokio::spawn(run_router(
        radio_events,
        central.clone(),
        Arc::clone(&peripheral),
    ));

    peripheral.start().context("Failed to start peripheral")?;
    central.start(counter_spec()).context("Failed to start central")?;
    println!("{} Scanning for {}", "→".cyan(), counter_service());

    wait_for(&mut events, "subscriptions", |event| match event {
        DemoEvent::Ready => Some(Ok(())),
        DemoEvent::State(CentralState::Error) => Some(Err(anyhow::anyhow!("Central entered Error"))),
        DemoEvent::Disconnected(reason, message) => Some(Err(anyhow::anyhow!(
            "Disconnected before ready: {} {}",
            reason,
            message
        ))),
        _ => None,
    })
    .await?;
    println!("{} Connected and subscribed", "✓".green());

    central.read(counter())?;
    let initial = wait_for(&mut events, "read", |event| match event {
        DemoEvent::Read(success, value) => Some(Ok((success, value))),
        _ => None,
    })
    .await?;
    println!("{} Read counter = {}", "✓".green(), show_value(initial.1));

    for n in 1..=writes {
        central.write(counter(), codec::encode_u32_le(n).to_vec())?;
        let mut notified = None;
        let acked = wait_for(&mut events, "write", |event| match event {
            DemoEvent::Changed(value) => {
                notified = value;
                None
            }
            DemoEvent::Written(success) => Some(Ok(success)),
            _ => None,
        })
        .await?;
        println!(
            "{} Wrote {} (ack: {}, notified: {})",
            "✓".green(),
            n,
            acked,
            show_value(notified)
        );
    }

    let pushed = peripheral.update_value(
        counter_service(),
        counter(),
        codec::encode_u32_le(100).to_vec(),
    );
    let value = wait_for(&mut events, "notification", |event| match event {
        DemoEvent::Changed(value) => Some(Ok(value)),
        _ => None,
    })
    .await?;
    println!(
        "{} Peripheral pushed {} to {} subscriber(s)",
        "✓".green(),
        show_value(value),
        pushed
    );

    central.send(reset(), Vec::new())?;
    wait_for(&mut events, "send", |event| match event {
        DemoEvent::Written(success) => Some(Ok(success)),
        _ => None,
    })
    .await?;
    println!("{} Sent reset without response", "✓".green());

    central.stop();
    peripheral.stop();
    router.abort();
    println!("{} Session closed", "✓".green());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_registry_shape() {
        let registry = counter_registry().expect("registry");
        let services = registry.service_descriptors();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].characteristics.len(), 2);
    }

    #[tokio::test]
    async fn test_demo_runs_to_completion() {
        run(GattLinkConfig::default(), 2).await.expect("demo");
    }
}
