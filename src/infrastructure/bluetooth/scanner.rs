//! BLE Scanner Module
//!
//! Finds a heater by its Bluetooth address.

use crate::infrastructure::bluetooth::transport::TransportError;
use btleplug::api::{BDAddr, Central, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Peripheral};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How often the adapter's peripheral list is checked while scanning
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// BLE Scanner looking for one specific device
pub struct BleScanner {
    adapter: Adapter,
}

impl BleScanner {
    /// Create a new scanner
    pub fn new(adapter: Adapter) -> Self {
        Self { adapter }
    }

    /// Scan until a peripheral with `address` shows up or `timeout` runs out
    pub async fn find_by_address(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Option<Peripheral>, TransportError> {
        let target: BDAddr = address
            .parse()
            .map_err(|_| TransportError::InvalidAddress(address.to_string()))?;

        info!("Starting BLE scan for {}", target);
        self.adapter.start_scan(ScanFilter::default()).await?;

        let found = tokio::time::timeout(timeout, self.poll_for(target)).await;

        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop BLE scan: {}", e);
        }

        match found {
            Ok(Ok(peripheral)) => {
                debug!("Found peripheral {:?}", peripheral.id());
                Ok(Some(peripheral))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    async fn poll_for(&self, target: BDAddr) -> Result<Peripheral, TransportError> {
        loop {
            for peripheral in self.adapter.peripherals().await? {
                if peripheral.address() == target {
                    return Ok(peripheral);
                }
            }
            tokio::time::sleep(SCAN_POLL_INTERVAL).await;
        }
    }
}
