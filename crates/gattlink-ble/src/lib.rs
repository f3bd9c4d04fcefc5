//! GATT session layer for Bluetooth Low Energy
//!
//! This crate turns callback-driven native BLE stacks into two session
//! objects with a single owner for all mutable state:
//!
//! - [`GattSession`] - central role: scanning, connections, service discovery,
//!   characteristic reads/writes and notification subscriptions
//! - [`PeripheralSession`] - peripheral role: local service table, advertising
//!   and answering remote ATT requests
//!
//! ## Architecture
//!
//! - [`transport`] - the [`GattTransport`] / [`PeripheralTransport`] seams a
//!   native stack implements
//! - [`scan`], [`connection`], [`operations`] - pure state machines for scan
//!   passes, link lifecycles and per-device operation lanes
//! - [`dispatch`] - routing of link lifecycle calls onto a host executor
//! - [`events`] - events published to session subscribers
//! - `backend` - btleplug adapter (feature `btleplug`)
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gattlink_ble::{GattSession, GattTransport, SessionEvent};
//! use gattlink_core::SessionConfig;
//!
//! # async fn example(transport: Arc<dyn GattTransport>) -> gattlink_core::Result<()> {
//! let session = GattSession::spawn(transport, SessionConfig::new());
//! let mut events = session.events();
//!
//! session.start_scan().await?;
//! while let Ok(event) = events.recv().await {
//!     if let SessionEvent::DeviceDiscovered(device) = event {
//!         session.connect(device.id).await?;
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod central;
pub mod channels;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod operations;
pub mod peripheral;
pub mod scan;
pub mod transport;

#[cfg(feature = "btleplug")]
pub mod backend;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use central::GattSession;
pub use channels::{PeripheralEventReceiver, SessionEventReceiver, ValueReceiver};
pub use dispatch::{Dispatcher, InlineDispatcher, NativeCall, NativeOperation, RuntimeDispatcher};
pub use error::{TransportError, TransportResult};
pub use events::{PeripheralEvent, SessionEvent};
pub use peripheral::PeripheralSession;
pub use transport::{
    AdvertiseFailure, AdvertisingSupport, AttStatus, CharacteristicRef, EventSink, GattTransport,
    PeripheralEventSink, PeripheralTransport, PeripheralTransportEvent, RequestId,
    TransportCapabilities, TransportEvent, TransportEventSink,
};

#[cfg(feature = "btleplug")]
pub use backend::BtleplugCentral;
