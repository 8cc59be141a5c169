use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::error::ChannelError;
use crate::reactor::ReactorEvent;

/// A parsed channel endpoint.
///
/// `tcp://host:port` endpoints cross process boundaries;
/// `inproc://name` endpoints rendezvous through an `IpcContext`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Inproc(String),
}

impl Endpoint {
    pub fn parse(endpoint: &str) -> Result<Self, ChannelError> {
        if let Some(addr) = endpoint.strip_prefix("tcp://") {
            if addr.is_empty() {
                return Err(ChannelError::InvalidEndpoint(endpoint.into()));
            }
            // Accept the wildcard host form used in configuration files.
            let addr = match addr.strip_prefix("*:") {
                Some(port) => format!("0.0.0.0:{port}"),
                None => addr.to_string(),
            };
            Ok(Endpoint::Tcp(addr))
        } else if let Some(name) = endpoint.strip_prefix("inproc://") {
            if name.is_empty() {
                return Err(ChannelError::InvalidEndpoint(endpoint.into()));
            }
            Ok(Endpoint::Inproc(name.into()))
        } else {
            Err(ChannelError::InvalidEndpoint(endpoint.into()))
        }
    }
}

pub(crate) struct PairHalf {
    pub(crate) tx: mpsc::UnboundedSender<ReactorEvent>,
    pub(crate) rx: mpsc::UnboundedReceiver<ReactorEvent>,
}

#[derive(Default)]
struct ContextState {
    pending_pairs: HashMap<String, PairHalf>,
}

/// Explicit messaging context: the rendezvous point for in-process pair
/// channels. Passed into channel constructors instead of living in a
/// process-wide singleton, so tests and teardown stay deterministic.
#[derive(Clone, Default)]
pub struct IpcContext {
    state: Arc<Mutex<ContextState>>,
}

impl IpcContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn publish_pair(&self, name: &str, half: PairHalf) {
        let mut state = self.lock();
        state.pending_pairs.insert(name.to_string(), half);
    }

    pub(crate) fn take_pair(&self, name: &str) -> Option<PairHalf> {
        self.lock().pending_pairs.remove(name)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("ipc context lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_and_inproc() {
        assert_eq!(
            Endpoint::parse("tcp://127.0.0.1:5000").unwrap(),
            Endpoint::Tcp("127.0.0.1:5000".into())
        );
        assert_eq!(
            Endpoint::parse("tcp://*:5000").unwrap(),
            Endpoint::Tcp("0.0.0.0:5000".into())
        );
        assert_eq!(
            Endpoint::parse("inproc://rx_channel").unwrap(),
            Endpoint::Inproc("rx_channel".into())
        );
    }

    #[test]
    fn rejects_unknown_schemes() {
        assert!(Endpoint::parse("ipc:///tmp/sock").is_err());
        assert!(Endpoint::parse("tcp://").is_err());
        assert!(Endpoint::parse("plain-string").is_err());
    }
}
