//! Per-device GATT operation lanes
//!
//! Native stacks accept a single outstanding GATT request per connection, so
//! every device gets a read lane, a write lane (notification changes share it)
//! and a discovery flag. Requests that find their lane busy wait in FIFO
//! order.

use std::collections::{HashMap, VecDeque};

use gattlink_core::{DeviceId, GattError, Result, WriteMode};

use crate::transport::CharacteristicRef;

/// Work carried by the write lane
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Value {
        target: CharacteristicRef,
        data: Vec<u8>,
        mode: WriteMode,
    },
    Notify {
        target: CharacteristicRef,
        enable: bool,
        /// Descriptor payload when the transport needs an explicit CCCD write
        cccd: Option<[u8; 2]>,
    },
}

impl WriteOp {
    pub fn target(&self) -> &CharacteristicRef {
        match self {
            WriteOp::Value { target, .. } | WriteOp::Notify { target, .. } => target,
        }
    }
}

/// Operations cut short by a link loss
#[derive(Debug, Default)]
pub struct Aborted {
    pub reads: Vec<CharacteristicRef>,
    pub writes: Vec<WriteOp>,
    pub discovery: bool,
}

#[derive(Debug, Default)]
struct DeviceLanes {
    read: Option<CharacteristicRef>,
    read_queue: VecDeque<CharacteristicRef>,
    write: Option<WriteOp>,
    write_queue: VecDeque<WriteOp>,
    discovering: bool,
}

// ----------------------------------------------------------------------------
// Operation Lanes
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct OperationLanes {
    devices: HashMap<DeviceId, DeviceLanes>,
}

impl OperationLanes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the read should be issued now
    pub fn submit_read(&mut self, target: CharacteristicRef) -> bool {
        let lanes = self.devices.entry(target.device).or_default();
        if lanes.read.is_some() {
            lanes.read_queue.push_back(target);
            false
        } else {
            lanes.read = Some(target);
            true
        }
    }

    /// Clear the in-flight read if it matches
    pub fn take_read(&mut self, target: &CharacteristicRef) -> bool {
        match self.devices.get_mut(&target.device) {
            Some(lanes) if lanes.read.as_ref() == Some(target) => {
                lanes.read = None;
                true
            }
            _ => false,
        }
    }

    /// Promote the next queued read once the lane is free
    pub fn next_read(&mut self, device: &DeviceId) -> Option<CharacteristicRef> {
        let lanes = self.devices.get_mut(device)?;
        if lanes.read.is_some() {
            return None;
        }
        let next = lanes.read_queue.pop_front()?;
        lanes.read = Some(next);
        Some(next)
    }

    /// Returns the op when it should be issued now
    pub fn submit_write(&mut self, op: WriteOp) -> Option<WriteOp> {
        let lanes = self.devices.entry(op.target().device).or_default();
        if lanes.write.is_some() {
            lanes.write_queue.push_back(op);
            None
        } else {
            lanes.write = Some(op.clone());
            Some(op)
        }
    }

    /// Clear the in-flight write if `matches` accepts it
    pub fn take_write<F>(&mut self, device: &DeviceId, matches: F) -> Option<WriteOp>
    where
        F: FnOnce(&WriteOp) -> bool,
    {
        let lanes = self.devices.get_mut(device)?;
        if lanes.write.as_ref().is_some_and(matches) {
            lanes.write.take()
        } else {
            None
        }
    }

    pub fn next_write(&mut self, device: &DeviceId) -> Option<WriteOp> {
        let lanes = self.devices.get_mut(device)?;
        if lanes.write.is_some() {
            return None;
        }
        let next = lanes.write_queue.pop_front()?;
        lanes.write = Some(next.clone());
        Some(next)
    }

    pub fn begin_discovery(&mut self, device: DeviceId) -> Result<()> {
        let lanes = self.devices.entry(device).or_default();
        if lanes.discovering {
            return Err(GattError::OperationInProgress {
                operation: "service discovery",
                device,
            });
        }
        lanes.discovering = true;
        Ok(())
    }

    /// Returns whether a discovery pass was in flight
    pub fn end_discovery(&mut self, device: &DeviceId) -> bool {
        match self.devices.get_mut(device) {
            Some(lanes) if lanes.discovering => {
                lanes.discovering = false;
                true
            }
            _ => false,
        }
    }

    pub fn is_discovering(&self, device: &DeviceId) -> bool {
        self.devices
            .get(device)
            .map(|lanes| lanes.discovering)
            .unwrap_or(false)
    }

    /// Drop every in-flight and queued operation for a device
    pub fn abort_device(&mut self, device: &DeviceId) -> Aborted {
        let Some(lanes) = self.devices.remove(device) else {
            return Aborted::default();
        };

        Aborted {
            reads: lanes.read.into_iter().chain(lanes.read_queue).collect(),
            writes: lanes.write.into_iter().chain(lanes.write_queue).collect(),
            discovery: lanes.discovering,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gattlink_core::short_uuid;

    fn target(characteristic: u16) -> CharacteristicRef {
        CharacteristicRef::new(
            DeviceId::from_mac([1, 2, 3, 4, 5, 6]),
            short_uuid(0xBEEF),
            short_uuid(characteristic),
        )
    }

    fn write(characteristic: u16, byte: u8) -> WriteOp {
        WriteOp::Value {
            target: target(characteristic),
            data: vec![byte],
            mode: WriteMode::WithResponse,
        }
    }

    #[test]
    fn test_reads_are_serialised_fifo() {
        let mut lanes = OperationLanes::new();
        assert!(lanes.submit_read(target(0xBEF0)));
        assert!(!lanes.submit_read(target(0xBEF1)));
        assert!(!lanes.submit_read(target(0xBEF2)));

        let device = target(0).device;
        assert_eq!(lanes.next_read(&device), None);
        assert!(!lanes.take_read(&target(0xBEF1)));
        assert!(lanes.take_read(&target(0xBEF0)));
        assert_eq!(lanes.next_read(&device), Some(target(0xBEF1)));
        assert!(lanes.take_read(&target(0xBEF1)));
        assert_eq!(lanes.next_read(&device), Some(target(0xBEF2)));
        assert!(lanes.take_read(&target(0xBEF2)));
        assert_eq!(lanes.next_read(&device), None);
    }

    #[test]
    fn test_writes_and_notify_share_a_lane() {
        let mut lanes = OperationLanes::new();
        let device = target(0).device;
        assert_eq!(lanes.submit_write(write(0xBEF0, 1)), Some(write(0xBEF0, 1)));

        let notify = WriteOp::Notify {
            target: target(0xBEF1),
            enable: true,
            cccd: Some([1, 0]),
        };
        assert_eq!(lanes.submit_write(notify.clone()), None);

        assert_eq!(lanes.take_write(&device, |op| matches!(op, WriteOp::Notify { .. })), None);
        assert_eq!(
            lanes.take_write(&device, |op| op.target() == &target(0xBEF0)),
            Some(write(0xBEF0, 1))
        );
        assert_eq!(lanes.next_write(&device), Some(notify));
        assert_eq!(lanes.next_write(&device), None);
    }

    #[test]
    fn test_discovery_never_interleaves() {
        let mut lanes = OperationLanes::new();
        let device = target(0).device;
        lanes.begin_discovery(device).unwrap();
        assert!(matches!(
            lanes.begin_discovery(device),
            Err(GattError::OperationInProgress { .. })
        ));
        assert!(lanes.end_discovery(&device));
        assert!(!lanes.end_discovery(&device));
        assert!(lanes.begin_discovery(device).is_ok());
    }

    #[test]
    fn test_abort_returns_everything_in_order() {
        let mut lanes = OperationLanes::new();
        let device = target(0).device;
        lanes.submit_read(target(0xBEF0));
        lanes.submit_read(target(0xBEF1));
        lanes.submit_write(write(0xBEF0, 1));
        lanes.submit_write(write(0xBEF0, 2));
        lanes.begin_discovery(device).unwrap();

        let aborted = lanes.abort_device(&device);
        assert_eq!(aborted.reads, vec![target(0xBEF0), target(0xBEF1)]);
        assert_eq!(aborted.writes, vec![write(0xBEF0, 1), write(0xBEF0, 2)]);
        assert!(aborted.discovery);
        let again = lanes.abort_device(&device);
        assert!(again.reads.is_empty() && again.writes.is_empty() && !again.discovery);
        assert!(!lanes.is_discovering(&device));
    }
}
