//! Per-device link lifecycle
//!
//! Tracks `Disconnected → Connecting → Connected` for every device the
//! session has touched. Each connect attempt gets a fresh number so that a
//! timer armed for an abandoned attempt cannot fail a newer one.

use std::collections::HashMap;

use gattlink_core::{DeviceId, DeviceState};

// ----------------------------------------------------------------------------
// Transition Outcomes
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectAction {
    /// Issue the native connect and arm a timer for this attempt
    Issue { attempt: u64 },
    AlreadyConnecting,
    AlreadyConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectedOutcome {
    Established,
    /// Link was already up; the caller re-confirms it
    Duplicate,
    /// No attempt is pending (cancelled or timed out); tear the link down
    Stray,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectAction {
    /// Abandon a pending attempt
    CancelAttempt,
    /// Tear down an established link
    Teardown,
    AlreadyDisconnected,
}

// ----------------------------------------------------------------------------
// Connection Session
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Link {
    state: DeviceState,
    attempt: u64,
}

#[derive(Debug, Default)]
pub struct ConnectionSession {
    links: HashMap<DeviceId, Link>,
    next_attempt: u64,
}

impl ConnectionSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, device: &DeviceId) -> DeviceState {
        self.links
            .get(device)
            .map(|link| link.state)
            .unwrap_or_default()
    }

    /// Devices with a pending or established link
    pub fn linked(&self) -> Vec<DeviceId> {
        let mut devices: Vec<_> = self
            .links
            .iter()
            .filter(|(_, link)| link.state.is_linked())
            .map(|(id, _)| *id)
            .collect();
        devices.sort();
        devices
    }

    pub fn begin_connect(&mut self, device: DeviceId) -> ConnectAction {
        match self.state(&device) {
            DeviceState::Connected => ConnectAction::AlreadyConnected,
            DeviceState::Connecting => ConnectAction::AlreadyConnecting,
            DeviceState::Disconnected => {
                self.next_attempt += 1;
                let attempt = self.next_attempt;
                self.links.insert(
                    device,
                    Link {
                        state: DeviceState::Connecting,
                        attempt,
                    },
                );
                ConnectAction::Issue { attempt }
            }
        }
    }

    pub fn on_connected(&mut self, device: DeviceId) -> ConnectedOutcome {
        match self.links.get_mut(&device) {
            Some(link) if link.state == DeviceState::Connecting => {
                link.state = DeviceState::Connected;
                ConnectedOutcome::Established
            }
            Some(link) if link.state == DeviceState::Connected => ConnectedOutcome::Duplicate,
            _ => ConnectedOutcome::Stray,
        }
    }

    /// Native connect failure; returns whether an attempt was pending
    pub fn on_failed(&mut self, device: DeviceId) -> bool {
        self.reset_if(device, DeviceState::Connecting)
    }

    /// Timer expiry; returns whether it ended the pending attempt
    pub fn on_timeout(&mut self, device: DeviceId, attempt: u64) -> bool {
        match self.links.get_mut(&device) {
            Some(link) if link.state == DeviceState::Connecting && link.attempt == attempt => {
                link.state = DeviceState::Disconnected;
                true
            }
            _ => false,
        }
    }

    /// Native link loss; returns whether an established link went down
    ///
    /// Disconnects for pending attempts are left to the failure path, and
    /// confirmations of a teardown the session already applied are ignored.
    pub fn on_disconnected(&mut self, device: DeviceId) -> bool {
        self.reset_if(device, DeviceState::Connected)
    }

    /// Caller-requested disconnect; the link always ends `Disconnected`
    pub fn begin_disconnect(&mut self, device: DeviceId) -> DisconnectAction {
        let action = match self.state(&device) {
            DeviceState::Connecting => DisconnectAction::CancelAttempt,
            DeviceState::Connected => DisconnectAction::Teardown,
            DeviceState::Disconnected => DisconnectAction::AlreadyDisconnected,
        };
        if let Some(link) = self.links.get_mut(&device) {
            link.state = DeviceState::Disconnected;
        }
        action
    }

    pub fn forget(&mut self, device: &DeviceId) {
        self.links.remove(device);
    }

    fn reset_if(&mut self, device: DeviceId, expected: DeviceState) -> bool {
        match self.links.get_mut(&device) {
            Some(link) if link.state == expected => {
                link.state = DeviceState::Disconnected;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceId {
        DeviceId::from_mac([0xAA, 0xBB, 0xCC, 0, 0, 1])
    }

    #[test]
    fn test_connect_lifecycle() {
        let mut links = ConnectionSession::new();
        assert_eq!(links.state(&device()), DeviceState::Disconnected);

        let ConnectAction::Issue { .. } = links.begin_connect(device()) else {
            panic!("expected a native connect");
        };
        assert_eq!(links.state(&device()), DeviceState::Connecting);
        assert_eq!(links.begin_connect(device()), ConnectAction::AlreadyConnecting);

        assert_eq!(links.on_connected(device()), ConnectedOutcome::Established);
        assert_eq!(links.state(&device()), DeviceState::Connected);
        assert_eq!(links.begin_connect(device()), ConnectAction::AlreadyConnected);
        assert_eq!(links.on_connected(device()), ConnectedOutcome::Duplicate);
        assert_eq!(links.linked(), vec![device()]);
    }

    #[test]
    fn test_timeout_only_hits_current_attempt() {
        let mut links = ConnectionSession::new();
        let ConnectAction::Issue { attempt: first } = links.begin_connect(device()) else {
            panic!("expected a native connect");
        };
        assert!(links.on_failed(device()));

        let ConnectAction::Issue { attempt: second } = links.begin_connect(device()) else {
            panic!("expected a native connect");
        };
        assert_ne!(first, second);
        assert!(!links.on_timeout(device(), first));
        assert_eq!(links.state(&device()), DeviceState::Connecting);

        assert!(links.on_timeout(device(), second));
        assert_eq!(links.state(&device()), DeviceState::Disconnected);
        assert!(!links.on_timeout(device(), second));
    }

    #[test]
    fn test_late_connect_after_timeout_is_stray() {
        let mut links = ConnectionSession::new();
        let ConnectAction::Issue { attempt } = links.begin_connect(device()) else {
            panic!("expected a native connect");
        };
        links.on_timeout(device(), attempt);
        assert_eq!(links.on_connected(device()), ConnectedOutcome::Stray);
        assert_eq!(links.state(&device()), DeviceState::Disconnected);

        let unknown = DeviceId::from_mac([1; 6]);
        assert_eq!(links.on_connected(unknown), ConnectedOutcome::Stray);
    }

    #[test]
    fn test_disconnect_actions() {
        let mut links = ConnectionSession::new();
        assert_eq!(
            links.begin_disconnect(device()),
            DisconnectAction::AlreadyDisconnected
        );

        links.begin_connect(device());
        assert_eq!(links.begin_disconnect(device()), DisconnectAction::CancelAttempt);
        assert_eq!(links.state(&device()), DeviceState::Disconnected);

        links.begin_connect(device());
        links.on_connected(device());
        assert_eq!(links.begin_disconnect(device()), DisconnectAction::Teardown);
        assert_eq!(
            links.begin_disconnect(device()),
            DisconnectAction::AlreadyDisconnected
        );
        assert!(links.linked().is_empty());
    }

    #[test]
    fn test_native_disconnect_only_drops_established_links() {
        let mut links = ConnectionSession::new();
        links.begin_connect(device());
        assert!(!links.on_disconnected(device()));
        assert_eq!(links.state(&device()), DeviceState::Connecting);

        links.on_connected(device());
        assert!(links.on_disconnected(device()));
        assert!(!links.on_disconnected(device()));
    }
}
