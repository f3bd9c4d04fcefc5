//! Routing of native calls onto a host-chosen executor
//!
//! Some vendor stacks misbehave unless connect and disconnect are issued from
//! a particular thread. The session wraps those calls in a [`NativeCall`] and
//! hands them to a [`Dispatcher`] when the [`DispatchPolicy`] asks for it.

use futures::future::BoxFuture;
use futures::FutureExt;
use gattlink_core::DispatchPolicy;
use tokio::runtime::Handle;

use crate::error::{TransportError, TransportResult};

/// Native calls subject to the dispatch policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeOperation {
    Connect,
    Disconnect,
    DiscoverServices,
}

impl NativeOperation {
    /// Whether the policy routes this operation through the dispatcher
    pub fn is_routed(self, policy: &DispatchPolicy) -> bool {
        match self {
            NativeOperation::Connect => policy.connect,
            NativeOperation::Disconnect => policy.disconnect,
            NativeOperation::DiscoverServices => policy.discover_services,
        }
    }
}

/// A pending native call
pub type NativeCall = BoxFuture<'static, TransportResult<()>>;

/// Executes native calls on behalf of a session
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, operation: NativeOperation, call: NativeCall) -> NativeCall;
}

/// Runs the call on the session task itself
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn dispatch(&self, _operation: NativeOperation, call: NativeCall) -> NativeCall {
        call
    }
}

/// Runs the call on another tokio runtime, e.g. a current-thread runtime
/// standing in for a platform main loop
#[derive(Debug, Clone)]
pub struct RuntimeDispatcher {
    handle: Handle,
}

impl RuntimeDispatcher {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

impl Dispatcher for RuntimeDispatcher {
    fn dispatch(&self, operation: NativeOperation, call: NativeCall) -> NativeCall {
        let task = self.handle.spawn(call);
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(TransportError::Platform(format!(
                    "{:?} dispatch failed: {}",
                    operation, e
                ))),
            }
        }
        .boxed()
    }
}
