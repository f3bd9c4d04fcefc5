//! Helpers for awaiting broadcast session events
//!
//! Tests run with a paused clock, so [`EVENT_TIMEOUT`] only elapses once every
//! earlier session timer has fired.

use std::fmt::Debug;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::TryRecvError};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(600);

/// Next event on the feed; panics on timeout or a closed feed
pub async fn expect_event<E: Clone + Debug>(events: &mut broadcast::Receiver<E>) -> E {
    match tokio::time::timeout(EVENT_TIMEOUT, events.recv()).await {
        Ok(Ok(event)) => event,
        Ok(Err(e)) => panic!("event feed failed: {}", e),
        Err(_) => panic!("no event within {:?}", EVENT_TIMEOUT),
    }
}

/// Skip events until one satisfies `matches`
pub async fn wait_for<E, F>(events: &mut broadcast::Receiver<E>, mut matches: F) -> E
where
    E: Clone + Debug,
    F: FnMut(&E) -> bool,
{
    loop {
        let event = expect_event(events).await;
        if matches(&event) {
            return event;
        }
    }
}

/// Every event already queued on the feed
pub fn drain<E: Clone>(events: &mut broadcast::Receiver<E>) -> Vec<E> {
    let mut drained = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => drained.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return drained,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_for_skips_unrelated_events() {
        let (tx, mut rx) = broadcast::channel(8);
        for n in 1..=4u8 {
            tx.send(n).ok();
        }
        assert_eq!(wait_for(&mut rx, |n| *n == 3).await, 3);
        assert_eq!(drain(&mut rx), vec![4]);
        assert!(drain(&mut rx).is_empty());
    }
}
