//! Transport contract and static registry.
//!
//! A transport owns one listening surface (TCP, HTTP long poll, anything
//! that can carry sync envelopes) and is opaque to the core: it hands the
//! node raw request bytes and gets raw response bytes back. The registry
//! maps protocol ids to constructors and is populated explicitly at process
//! start; there is no discovery.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::core::{EndpointKey, FleetError, TransportFault};

/// Bind and identity parameters handed to every transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Host or address to bind.
    pub bind_host: String,
    /// Port to bind.
    pub bind_port: u16,
    /// Public key endpoints use to verify this node.
    pub public_key: Vec<u8>,
}

/// What a started transport is actually serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Protocol id of the transport.
    pub protocol_id: u8,
    /// Host the transport bound.
    pub host: String,
    /// Port the transport bound.
    pub port: u16,
}

/// Callbacks a transport drives into the session layer.
///
/// Every `on_sync_request` resolves through its `respond` sender exactly
/// once or not at all; a dropped sender tells the transport the session
/// closed underneath the request.
pub trait ChannelHandler: Send + Sync + 'static {
    /// A sync envelope arrived on a channel.
    fn on_sync_request(&self, bytes: Vec<u8>, respond: oneshot::Sender<Vec<u8>>);

    /// The endpoint's channel closed cleanly.
    fn on_close(&self, endpoint: &EndpointKey);

    /// The endpoint's channel failed.
    fn on_error(&self, endpoint: &EndpointKey, fault: TransportFault);
}

/// A pluggable channel implementation.
pub trait Transport: Send + 'static {
    /// Protocol id this transport serves.
    fn protocol_id(&self) -> u8;

    /// Bind configuration and attach the handler. Called once, before
    /// [`start`](Self::start).
    fn init(
        &mut self,
        config: &TransportConfig,
        handler: std::sync::Arc<dyn ChannelHandler>,
    ) -> Result<(), FleetError>;

    /// Start serving.
    fn start(&mut self) -> Result<(), FleetError>;

    /// Stop serving and release the listening surface.
    fn stop(&mut self);

    /// What this transport is serving; valid after a successful start.
    fn connection_info(&self) -> ConnectionInfo;
}

/// Constructor for a transport implementation.
pub type TransportConstructor = fn() -> Box<dyn Transport>;

/// Explicit protocol-id-to-constructor map.
#[derive(Default)]
pub struct TransportRegistry {
    constructors: HashMap<u8, TransportConstructor>,
}

impl TransportRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for a protocol id.
    ///
    /// Two transports claiming the same id is a wiring bug; startup aborts.
    pub fn register(
        &mut self,
        protocol_id: u8,
        constructor: TransportConstructor,
    ) -> Result<(), FleetError> {
        if self.constructors.insert(protocol_id, constructor).is_some() {
            return Err(FleetError::Fatal(format!(
                "duplicate transport registration for protocol id {protocol_id:#04x}"
            )));
        }
        Ok(())
    }

    /// Instantiate the transport for a protocol id.
    pub fn instantiate(&self, protocol_id: u8) -> Option<Box<dyn Transport>> {
        self.constructors.get(&protocol_id).map(|ctor| ctor())
    }

    /// Registered protocol ids, ascending.
    pub fn protocol_ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.constructors.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Instantiate every registered transport.
    pub fn instantiate_all(&self) -> Vec<Box<dyn Transport>> {
        self.protocol_ids()
            .into_iter()
            .filter_map(|id| self.instantiate(id))
            .collect()
    }
}
