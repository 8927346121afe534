//! Live capture source: opens a link-layer interface and yields raw frames
//! with their kernel timestamps.

use chrono::{DateTime, Utc};
use pcap::{Active, Capture, Device};
use std::fmt;

/// Errors from opening or reading a capture.
#[derive(Debug)]
pub enum CaptureError {
    /// The named interface does not exist (or no default was found).
    NoDevice(String),
    /// The BPF filter expression failed to compile or apply.
    Filter(pcap::Error),
    /// Any other pcap failure.
    Pcap(pcap::Error),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::NoDevice(msg) => write!(f, "no capture device: {}", msg),
            CaptureError::Filter(e) => write!(f, "filter error: {}", e),
            CaptureError::Pcap(e) => write!(f, "capture error: {}", e),
        }
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CaptureError::NoDevice(_) => None,
            CaptureError::Filter(e) | CaptureError::Pcap(e) => Some(e),
        }
    }
}

impl From<pcap::Error> for CaptureError {
    fn from(e: pcap::Error) -> Self {
        CaptureError::Pcap(e)
    }
}

/// Settings for opening a capture.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub interface: Option<String>,
    pub promiscuous: bool,
    pub snaplen: i32,
    pub timeout_ms: i32,
    pub filter: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            interface: None,
            promiscuous: true,
            snaplen: 65535,
            timeout_ms: 100,
            filter: None,
        }
    }
}

/// One captured frame, borrowed from the capture handle until the next read.
#[derive(Debug)]
pub struct Frame<'a> {
    pub data: &'a [u8],
    /// Length on the wire; can exceed `data.len()` under snaplen truncation.
    pub wire_len: usize,
    pub timestamp: DateTime<Utc>,
}

/// An open live capture on one interface.
pub struct CaptureSource {
    cap: Capture<Active>,
}

impl CaptureSource {
    /// Open the configured interface in promiscuous mode and apply the BPF
    /// filter. Every failure here is a startup fault for the pipeline.
    pub fn open(config: &CaptureConfig) -> Result<Self, CaptureError> {
        let device = match &config.interface {
            Some(name) => Device::list()
                .map_err(CaptureError::Pcap)?
                .into_iter()
                .find(|d| d.name == *name)
                .ok_or_else(|| {
                    CaptureError::NoDevice(format!("interface '{}' not found", name))
                })?,
            None => Device::lookup()
                .map_err(CaptureError::Pcap)?
                .ok_or_else(|| CaptureError::NoDevice("no default interface".into()))?,
        };

        let mut cap = Capture::from_device(device)
            .map_err(CaptureError::Pcap)?
            .promisc(config.promiscuous)
            .snaplen(config.snaplen)
            .timeout(config.timeout_ms)
            .open()
            .map_err(CaptureError::Pcap)?;

        // An empty expression means no filtering at all.
        if let Some(filter) = config.filter.as_deref().filter(|f| !f.is_empty()) {
            cap.filter(filter, true).map_err(CaptureError::Filter)?;
        }

        Ok(CaptureSource { cap })
    }

    /// Block for the next frame. `Ok(None)` means the read timeout elapsed
    /// and the caller should retry (this is how the capture thread notices
    /// shutdown requests).
    pub fn next_frame(&mut self) -> Result<Option<Frame<'_>>, CaptureError> {
        match self.cap.next_packet() {
            Ok(packet) => {
                let ts = packet.header.ts;
                let timestamp = DateTime::from_timestamp(
                    ts.tv_sec as i64,
                    (ts.tv_usec as u32).saturating_mul(1000),
                )
                .unwrap_or_else(Utc::now);
                Ok(Some(Frame {
                    data: packet.data,
                    wire_len: packet.header.len as usize,
                    timestamp,
                }))
            }
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(e) => Err(CaptureError::Pcap(e)),
        }
    }
}

/// Enumerate capture-capable interfaces for the CLI.
pub fn list_interfaces() -> Result<Vec<Device>, CaptureError> {
    Device::list().map_err(CaptureError::Pcap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_interface_is_a_startup_fault() {
        let config = CaptureConfig {
            interface: Some("definitely-not-a-real-interface-0".into()),
            ..CaptureConfig::default()
        };
        match CaptureSource::open(&config) {
            Err(CaptureError::NoDevice(msg)) => {
                assert!(msg.contains("definitely-not-a-real-interface-0"))
            }
            Err(other) => panic!("expected NoDevice, got {}", other),
            Ok(_) => panic!("open unexpectedly succeeded"),
        }
    }
}
