//! What the controller knows about the connected switch
//!
//! Fed from FEATURES_REPLY, PORT_STATUS, GET_CONFIG_REPLY and the DESC stats
//! reply the engine requests right after the handshake.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use ofc_core::Result;
use ofc_wire::{
    DescStats, Message, MessageKind, PhyPort, PortReason, StatsBody, SwitchConfig,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::connection::MessageListener;
use crate::controller::ControllerHandle;
use crate::services::{Service, ServiceCatalog};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SwitchSnapshot {
    pub datapath_id: Option<u64>,
    pub n_buffers: u32,
    pub n_tables: u8,
    pub capabilities: u32,
    pub actions: u32,
    pub ports: BTreeMap<u16, PhyPort>,
    pub config: Option<SwitchConfig>,
    pub description: Option<DescStats>,
}

#[derive(Debug, Default)]
pub struct SwitchState {
    inner: RwLock<SwitchSnapshot>,
}

impl SwitchState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SwitchSnapshot {
        match self.inner.read() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn datapath_id(&self) -> Option<u64> {
        self.snapshot().datapath_id
    }

    pub fn port(&self, port_no: u16) -> Option<PhyPort> {
        self.snapshot().ports.get(&port_no).cloned()
    }

    fn update(&self, f: impl FnOnce(&mut SwitchSnapshot)) {
        match self.inner.write() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl MessageListener for SwitchState {
    fn on_message(&self, message: &Message) {
        match &message.kind {
            MessageKind::FeaturesReply(features) => {
                info!(
                    datapath_id = format_args!("{:016x}", features.datapath_id),
                    ports = features.ports.len(),
                    n_tables = features.n_tables,
                    "switch features"
                );
                self.update(|state| {
                    state.datapath_id = Some(features.datapath_id);
                    state.n_buffers = features.n_buffers;
                    state.n_tables = features.n_tables;
                    state.capabilities = features.capabilities;
                    state.actions = features.actions;
                    state.ports = features
                        .ports
                        .iter()
                        .map(|port| (port.port_no, port.clone()))
                        .collect();
                });
            }
            MessageKind::PortStatus(status) => {
                debug!(port = status.desc.port_no, reason = ?status.reason, "port status");
                self.update(|state| match status.reason {
                    PortReason::Delete => {
                        state.ports.remove(&status.desc.port_no);
                    }
                    _ => {
                        state.ports.insert(status.desc.port_no, status.desc.clone());
                    }
                });
            }
            MessageKind::GetConfigReply(config) => {
                self.update(|state| state.config = Some(*config));
            }
            MessageKind::StatsReply(reply) => {
                if let StatsBody::Desc(desc) = &reply.body {
                    info!(
                        manufacturer = %desc.mfr_desc,
                        software = %desc.sw_desc,
                        "switch description"
                    );
                    self.update(|state| state.description = Some(desc.clone()));
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Service for SwitchState {
    fn name(&self) -> &str {
        "switch-state"
    }

    async fn start(self: Arc<Self>, controller: &ControllerHandle, _catalog: &ServiceCatalog) -> Result<()> {
        controller.add_listener(self);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ofc_wire::{PortStatus, SwitchFeatures};

    fn port(port_no: u16, name: &str) -> PhyPort {
        PhyPort {
            port_no,
            hw_addr: Default::default(),
            name: name.to_string(),
            config: 0,
            state: 0,
            curr: 0,
            advertised: 0,
            supported: 0,
            peer: 0,
        }
    }

    #[test]
    fn test_features_then_port_changes() {
        let state = SwitchState::new();
        state.on_message(&Message::new(
            1,
            MessageKind::FeaturesReply(SwitchFeatures {
                datapath_id: 42,
                n_buffers: 256,
                n_tables: 1,
                capabilities: 0,
                actions: 0,
                ports: vec![port(1, "eth1"), port(2, "eth2")],
            }),
        ));
        assert_eq!(state.datapath_id(), Some(42));
        assert_eq!(state.snapshot().ports.len(), 2);

        state.on_message(&Message::new(
            0,
            MessageKind::PortStatus(PortStatus {
                reason: PortReason::Delete,
                desc: port(2, "eth2"),
            }),
        ));
        state.on_message(&Message::new(
            0,
            MessageKind::PortStatus(PortStatus {
                reason: PortReason::Add,
                desc: port(3, "eth3"),
            }),
        ));

        let ports: Vec<u16> = state.snapshot().ports.keys().copied().collect();
        assert_eq!(ports, vec![1, 3]);
        assert_eq!(state.port(3).map(|p| p.name), Some("eth3".to_string()));
    }

    #[test]
    fn test_config_reply() {
        let state = SwitchState::new();
        let config = SwitchConfig {
            flags: 0,
            miss_send_len: 128,
        };
        state.on_message(&Message::new(5, MessageKind::GetConfigReply(config)));
        assert_eq!(state.snapshot().config, Some(config));
    }
}
