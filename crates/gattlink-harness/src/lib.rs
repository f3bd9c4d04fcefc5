#![doc = "gattlink Harness\n\nScriptable mock transports for both GATT roles, sample GATT fixtures and\nhelpers for awaiting session events in tests."]

pub mod central;
pub mod events;
pub mod fixtures;
pub mod peripheral;

pub use central::{CentralCall, CentralOp, MockCentral};
pub use events::{drain, expect_event, wait_for, EVENT_TIMEOUT};
pub use fixtures::*;
pub use peripheral::{MockPeripheral, PeripheralCall, PeripheralOp};
