//! Scan pass bookkeeping
//!
//! Pure state machine: the central task owns the native scan and the timer,
//! this type decides what each scan event means.

use gattlink_core::{AdvertisementData, DeviceId, GattError, Result};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Scan Session
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanState {
    #[default]
    Idle,
    Scanning,
    /// Last pass ended through its timeout
    TimedOut,
}

/// How a native sighting relates to the current pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    /// First sighting of this device in the pass
    New,
    /// Device already seen in this pass
    Repeat,
    /// Not scanning, or filtered out
    Dropped,
}

/// Accepted scan start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanStart {
    pub generation: u64,
    /// Whether a timeout timer must be armed
    pub timed: bool,
}

#[derive(Debug, Default)]
pub struct ScanSession {
    state: ScanState,
    generation: u64,
    filter: Vec<Uuid>,
    discovered: Vec<DeviceId>,
}

impl ScanSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn is_scanning(&self) -> bool {
        self.state == ScanState::Scanning
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn filter(&self) -> &[Uuid] {
        &self.filter
    }

    /// Devices seen during the current (or last) pass, in sighting order
    pub fn discovered(&self) -> &[DeviceId] {
        &self.discovered
    }

    pub fn start(&mut self, filter: Vec<Uuid>, continuous: bool) -> Result<ScanStart> {
        if self.is_scanning() {
            return Err(GattError::AlreadyScanning);
        }

        self.state = ScanState::Scanning;
        self.generation += 1;
        self.filter = filter;
        self.discovered.clear();

        Ok(ScanStart {
            generation: self.generation,
            timed: !continuous,
        })
    }

    /// Returns to `Idle` from any state; returns whether a pass was running
    pub fn stop(&mut self) -> bool {
        let was_scanning = self.is_scanning();
        self.state = ScanState::Idle;
        was_scanning
    }

    /// Native scan failure ends the pass
    pub fn fail(&mut self) {
        self.state = ScanState::Idle;
    }

    pub fn observe(&mut self, device: DeviceId, advertisement: &AdvertisementData) -> Sighting {
        if !self.is_scanning() || !advertisement.matches_filter(&self.filter) {
            return Sighting::Dropped;
        }

        if self.discovered.contains(&device) {
            Sighting::Repeat
        } else {
            self.discovered.push(device);
            Sighting::New
        }
    }

    /// Apply a timer expiry; yields the pass results if it was still current
    pub fn on_timeout(&mut self, generation: u64) -> Option<Vec<DeviceId>> {
        if !self.is_scanning() || generation != self.generation {
            return None;
        }
        self.state = ScanState::TimedOut;
        Some(self.discovered.clone())
    }
}
