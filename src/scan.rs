//! Network scan results and the scan producer seam

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::frame::MacAddress;
use crate::Result;

/// Advertised security of a network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecurityType {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "WEP")]
    Wep,
    #[serde(rename = "WPA")]
    Wpa,
    #[serde(rename = "WPA2")]
    Wpa2,
    #[serde(rename = "WPA3")]
    Wpa3,
    #[serde(rename = "WPA/WPA2")]
    WpaWpa2,
    #[serde(rename = "ENTERPRISE")]
    Enterprise,
}

impl Default for SecurityType {
    fn default() -> Self {
        Self::Open
    }
}

/// One discovered network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub ssid: String,
    pub bssid: MacAddress,
    pub channel: u8,
    pub rssi: i8,
    pub security: SecurityType,
    pub hidden: bool,
}

impl NetworkInfo {
    pub fn new(ssid: &str, bssid: MacAddress, channel: u8, rssi: i8, security: SecurityType) -> Self {
        Self {
            ssid: ssid.to_string(),
            bssid,
            channel,
            rssi,
            security,
            hidden: ssid.is_empty(),
        }
    }
}

/// Progress of a background scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanPoll {
    Running,
    Complete(Vec<NetworkInfo>),
    Failed(String),
}

/// Passive network enumeration
#[async_trait::async_trait]
pub trait ScanProducer: Send + Sync {
    /// Begin a scan, optionally restricted to one channel
    async fn start_scan(&self, channel: Option<u8>) -> Result<()>;

    async fn poll(&self) -> ScanPoll;

    fn name(&self) -> &str;
}

/// Scanner that reports a fixed set of networks after a delay
#[derive(Debug)]
pub struct StaticScanner {
    networks: Vec<NetworkInfo>,
    delay: Duration,
    pending: Mutex<Option<(Instant, Option<u8>)>>,
}

impl StaticScanner {
    pub fn new(networks: Vec<NetworkInfo>, delay: Duration) -> Self {
        Self {
            networks,
            delay,
            pending: Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl ScanProducer for StaticScanner {
    async fn start_scan(&self, channel: Option<u8>) -> Result<()> {
        if let Ok(mut pending) = self.pending.lock() {
            *pending = Some((Instant::now(), channel));
        }
        Ok(())
    }

    async fn poll(&self) -> ScanPoll {
        let mut pending = match self.pending.lock() {
            Ok(pending) => pending,
            Err(_) => return ScanPoll::Failed("Scanner state poisoned".to_string()),
        };

        let state = *pending;
        match state {
            None => ScanPoll::Failed("No scan in progress".to_string()),
            Some((started, _)) if started.elapsed() < self.delay => ScanPoll::Running,
            Some((_, channel)) => {
                *pending = None;
                let found = self
                    .networks
                    .iter()
                    .filter(|n| channel.map_or(true, |c| n.channel == c))
                    .cloned()
                    .collect();
                ScanPoll::Complete(found)
            }
        }
    }

    fn name(&self) -> &str {
        "static"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn networks() -> Vec<NetworkInfo> {
        vec![
            NetworkInfo::new("HomeNet", MacAddress([0x10; 6]), 6, -48, SecurityType::Wpa2),
            NetworkInfo::new("", MacAddress([0x20; 6]), 11, -80, SecurityType::Open),
        ]
    }

    #[test]
    fn test_network_wire_shape() {
        let value = serde_json::to_value(&networks()[0]).unwrap();
        assert_eq!(value["ssid"], "HomeNet");
        assert_eq!(value["bssid"], "10:10:10:10:10:10");
        assert_eq!(value["security"], "WPA2");
        assert_eq!(value["hidden"], false);
        assert!(networks()[1].hidden);

        let mixed = serde_json::to_value(SecurityType::WpaWpa2).unwrap();
        assert_eq!(mixed, "WPA/WPA2");
    }

    #[tokio::test]
    async fn test_static_scanner() {
        let scanner = StaticScanner::new(networks(), Duration::ZERO);
        assert!(matches!(scanner.poll().await, ScanPoll::Failed(_)));

        scanner.start_scan(None).await.unwrap();
        assert_eq!(scanner.poll().await, ScanPoll::Complete(networks()));

        scanner.start_scan(Some(11)).await.unwrap();
        match scanner.poll().await {
            ScanPoll::Complete(found) => {
                assert_eq!(found.len(), 1);
                assert_eq!(found[0].channel, 11);
            }
            other => panic!("unexpected poll result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_static_scanner_running() {
        let scanner = StaticScanner::new(networks(), Duration::from_secs(60));
        scanner.start_scan(None).await.unwrap();
        assert_eq!(scanner.poll().await, ScanPoll::Running);
    }
}
