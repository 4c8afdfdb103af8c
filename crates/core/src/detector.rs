#![forbid(unsafe_code)]

use crate::discovery::ServiceArgs;
use crate::pattern::ServicePatterns;
use crate::ports::{PortSide, PortTable};
use crate::types::{AppId, ServiceVerdict, Transport};
use crate::TraceLog;
use std::collections::HashMap;

/// Marks a flow-data slot as service-module state so collaborators sharing
/// the flow's scratch map cannot collide with other subsystems.
pub const SERVICE_MODULE_STATE_BIT: u32 = 1 << 20;

/// Validation callback. Detectors inspect the packet through the args and
/// report verdicts through `args.api`.
pub type ValidateFn = fn(&mut ServiceArgs<'_, '_>) -> ServiceVerdict;

/// Index into the detector table. Stable across worker threads because
/// module registration order is deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DetectorId(pub usize);

/// Capability record for one registered detector. Identity is the validate
/// callback plus the optional user-data handle.
#[derive(Debug, Clone)]
pub struct Detector {
    pub validate: ValidateFn,
    pub user_data: Option<u32>,
    pub name: String,
    pub ref_count: u32,
    pub current_ref_count: u32,
    pub provides_user: bool,
    pub extracts_additional: bool,
    pub udp_reversed_eligible: bool,
    pub flow_data_key: u32,
}

impl Detector {
    pub fn is_active(&self) -> bool {
        self.current_ref_count > 0
    }
}

/// Identity and bookkeeping for a registration call.
#[derive(Debug, Clone, Copy)]
pub struct DetectorSpec<'n> {
    pub validate: ValidateFn,
    pub user_data: Option<u32>,
    pub name: &'n str,
    pub provides_user: bool,
    pub flow_data_key: u32,
}

/// All registered detectors plus the per-transport order the brute-force
/// walk follows.
#[derive(Debug, Default)]
pub struct DetectorTable {
    items: Vec<Detector>,
    tcp_order: Vec<DetectorId>,
    udp_order: Vec<DetectorId>,
}

impl DetectorTable {
    pub fn get(&self, id: DetectorId) -> &Detector {
        &self.items[id.0]
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn find(&self, validate: ValidateFn, user_data: Option<u32>) -> Option<DetectorId> {
        self.items
            .iter()
            .position(|d| std::ptr::fn_addr_eq(d.validate, validate) && d.user_data == user_data)
            .map(DetectorId)
    }

    fn intern(&mut self, spec: &DetectorSpec) -> DetectorId {
        if let Some(id) = self.find(spec.validate, spec.user_data) {
            return id;
        }
        self.items.push(Detector {
            validate: spec.validate,
            user_data: spec.user_data,
            name: spec.name.to_string(),
            ref_count: 0,
            current_ref_count: 0,
            provides_user: spec.provides_user,
            extracts_additional: false,
            udp_reversed_eligible: false,
            flow_data_key: spec.flow_data_key,
        });
        DetectorId(self.items.len() - 1)
    }

    fn note_transport(&mut self, id: DetectorId, transport: Transport) {
        let order = match transport {
            Transport::Tcp => &mut self.tcp_order,
            Transport::Udp => &mut self.udp_order,
        };
        if !order.contains(&id) {
            order.push(id);
        }
    }

    /// Next active detector in the transport's registration order, starting
    /// after `after` (or from the top).
    pub fn next_active(&self, transport: Transport, after: Option<DetectorId>) -> Option<DetectorId> {
        let order = match transport {
            Transport::Tcp => &self.tcp_order,
            Transport::Udp => &self.udp_order,
        };
        let start = match after {
            Some(id) => match order.iter().position(|d| *d == id) {
                Some(at) => at + 1,
                None => 0,
            },
            None => 0,
        };
        order
            .get(start..)
            .unwrap_or(&[])
            .iter()
            .copied()
            .find(|id| self.items[id.0].is_active())
    }

    /// Activate every detector: a detector's live reference count equals its
    /// registration count exactly while it is enabled.
    pub fn activate_all(&mut self) {
        for d in &mut self.items {
            d.current_ref_count = d.ref_count;
        }
    }

    pub fn set_active(&mut self, id: DetectorId, active: bool) {
        let d = &mut self.items[id.0];
        d.current_ref_count = if active { d.ref_count } else { 0 };
    }
}

/// A detector's claim on an application id, recorded through
/// `set_app_validator`.
#[derive(Debug, Clone, Copy)]
pub struct AppBinding {
    pub detector: DetectorId,
    pub extracts_additional: bool,
    pub udp_reversed: bool,
}

/// Everything a worker registers before traffic flows: detectors, pattern
/// indexes, port tables, app bindings. Thread-local; never shared.
#[derive(Debug, Default)]
pub struct Registry {
    pub detectors: DetectorTable,
    pub tcp_patterns: ServicePatterns,
    pub udp_patterns: ServicePatterns,
    pub ports: PortTable,
    pub app_bindings: HashMap<AppId, AppBinding>,
    ftp_fast_path: Option<DetectorId>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// First detector ever bound to TCP/21; FTP data channels adopt it
    /// without a search.
    pub fn ftp_fast_path(&self) -> Option<DetectorId> {
        self.ftp_fast_path
    }

    pub fn register_pattern(
        &mut self,
        spec: &DetectorSpec,
        transport: Transport,
        pattern: &[u8],
        position: Option<usize>,
        trace: &mut TraceLog,
    ) -> Option<DetectorId> {
        if pattern.is_empty() {
            trace.log(|| format!("empty pattern from {} skipped", spec.name));
            return None;
        }
        let id = self.detectors.intern(spec);
        let patterns = match transport {
            Transport::Tcp => &mut self.tcp_patterns,
            Transport::Udp => &mut self.udp_patterns,
        };
        patterns.register(id, pattern, position);
        self.detectors.note_transport(id, transport);
        self.detectors.items[id.0].ref_count += 1;
        Some(id)
    }

    pub fn add_port(
        &mut self,
        spec: &DetectorSpec,
        transport: Transport,
        port: u16,
        reversed: bool,
    ) -> DetectorId {
        let id = self.detectors.intern(spec);
        let side = PortSide::from_transport(transport, reversed);
        if self.ports.add(side, port, id) {
            self.detectors.items[id.0].ref_count += 1;
        }
        if transport == Transport::Tcp && port == 21 && self.ftp_fast_path.is_none() {
            self.ftp_fast_path = Some(id);
        }
        // Reversed registrations stay out of the brute-force order; they
        // only make sense from the initiator side.
        if !reversed {
            self.detectors.note_transport(id, transport);
        }
        id
    }

    pub fn remove_ports(&mut self, validate: ValidateFn, user_data: Option<u32>) {
        let Some(id) = self.detectors.find(validate, user_data) else {
            return;
        };
        let removed = self.ports.remove_all(id);
        let d = &mut self.detectors.items[id.0];
        d.ref_count = d.ref_count.saturating_sub(removed);
        if self.ftp_fast_path == Some(id) {
            self.ftp_fast_path = None;
        }
    }

    /// Bind an app id to an already-registered detector and record what it
    /// extracts. Fails when the detector was never registered.
    pub fn set_app_validator(
        &mut self,
        validate: ValidateFn,
        user_data: Option<u32>,
        app_id: AppId,
        extracts_additional: bool,
        udp_reversed: bool,
    ) -> Result<(), String> {
        if !extracts_additional && !udp_reversed {
            // Nothing to record for a validator without extraction claims.
            return Ok(());
        }
        let id = self
            .detectors
            .find(validate, user_data)
            .ok_or_else(|| format!("no registered detector for app id {app_id}"))?;
        let d = &mut self.detectors.items[id.0];
        d.extracts_additional |= extracts_additional;
        d.udp_reversed_eligible |= udp_reversed;
        self.app_bindings.insert(
            app_id,
            AppBinding {
                detector: id,
                extracts_additional,
                udp_reversed,
            },
        );
        Ok(())
    }
}

/// Port binding declared statically by a service module.
#[derive(Debug, Clone, Copy)]
pub struct PortSpec {
    pub transport: Transport,
    pub port: u16,
    pub reversed: bool,
}

/// A service detector module: one validate callback, its static port
/// bindings, and an init hook for pattern and app-id registration.
#[derive(Debug, Clone, Copy)]
pub struct ServiceModule {
    pub name: &'static str,
    pub provides_user: bool,
    pub validate: ValidateFn,
    pub user_data: Option<u32>,
    pub ports: &'static [PortSpec],
    pub init: Option<fn(&mut Registrar) -> Result<(), String>>,
}

/// Registration surface handed to a module's init hook. Carries the worker
/// identity so modules can label their own diagnostics.
pub struct Registrar<'a> {
    pub(crate) registry: &'a mut Registry,
    pub(crate) trace: &'a mut TraceLog,
    pub instance_id: u32,
    pub debug: bool,
    pub(crate) flow_data_key: u32,
}

impl<'a> Registrar<'a> {
    pub fn register_pattern(
        &mut self,
        validate: ValidateFn,
        user_data: Option<u32>,
        transport: Transport,
        pattern: &[u8],
        position: Option<usize>,
        name: &str,
        provides_user: bool,
    ) {
        let spec = DetectorSpec {
            validate,
            user_data,
            name,
            provides_user,
            flow_data_key: self.flow_data_key,
        };
        self.registry
            .register_pattern(&spec, transport, pattern, position, self.trace);
    }

    pub fn add_port(
        &mut self,
        validate: ValidateFn,
        user_data: Option<u32>,
        transport: Transport,
        port: u16,
        reversed: bool,
        name: &str,
        provides_user: bool,
    ) {
        let spec = DetectorSpec {
            validate,
            user_data,
            name,
            provides_user,
            flow_data_key: self.flow_data_key,
        };
        self.registry.add_port(&spec, transport, port, reversed);
    }

    pub fn remove_ports(&mut self, validate: ValidateFn, user_data: Option<u32>) {
        self.registry.remove_ports(validate, user_data);
    }

    pub fn set_app_validator(
        &mut self,
        validate: ValidateFn,
        user_data: Option<u32>,
        app_id: AppId,
        extracts_additional: bool,
        udp_reversed: bool,
    ) -> Result<(), String> {
        self.registry
            .set_app_validator(validate, user_data, app_id, extracts_additional, udp_reversed)
    }
}
