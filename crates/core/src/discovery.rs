#![forbid(unsafe_code)]

use crate::detector::{
    DetectorId, DetectorSpec, DetectorTable, Registrar, Registry, ServiceModule,
    SERVICE_MODULE_STATE_BIT,
};
use crate::flow::{DhcpLease, FlowContext, ServiceSubtype, SmbInfo, MAX_CANDIDATES};
use crate::host::{
    HostEntry, HostKey, HostState, HostTracker, INCONCLUSIVE_WEIGHT, INVALID_CLIENT_THRESHOLD,
    MAX_VALID_COUNT,
};
use crate::pattern::ServiceMatch;
use crate::pool::Pool;
use crate::types::{AppId, Direction, PacketView, ServiceVerdict, Transport};
use crate::{DiscoveryConfig, TraceLog};
use std::io::{self, Write};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

const MAX_SERVICE_MODULES: u32 = 1 << 16;
const POOL_DEPTH: usize = 64;

/// Free lists for the node types that churn per packet and per flow.
#[derive(Debug)]
pub struct DiscoveryPools {
    pub match_lists: Pool<Vec<ServiceMatch>>,
    pub dhcp_leases: Pool<Box<DhcpLease>>,
    pub smb_infos: Pool<Box<SmbInfo>>,
}

impl DiscoveryPools {
    fn new() -> Self {
        DiscoveryPools {
            match_lists: Pool::new(POOL_DEPTH),
            dhcp_leases: Pool::new(POOL_DEPTH),
            smb_infos: Pool::new(POOL_DEPTH),
        }
    }
}

/// What a validate callback sees: the packet, its flow, the detector's own
/// registration identity, and the verdict/side-channel surface.
pub struct ServiceArgs<'a, 'p> {
    pub pkt: &'a PacketView<'p>,
    pub dir: Direction,
    pub flow: &'a mut FlowContext,
    pub detector: DetectorId,
    pub user_data: Option<u32>,
    pub flow_data_key: u32,
    pub api: DetectorApi<'a>,
}

/// Verdict and side-channel surface handed to detectors during validation.
/// Never holds a host shard lock across a detector call.
pub struct DetectorApi<'t> {
    tracker: &'t HostTracker,
    detectors: &'t DetectorTable,
    pools: &'t mut DiscoveryPools,
    trace: &'t mut TraceLog,
    detection_level: u8,
    rna_mode: bool,
}

impl<'t> DetectorApi<'t> {
    /// True while the flow is mid-walk over a non-empty candidate list;
    /// individual fails are deferred until the walk is done. Once the list
    /// drains, the orchestrator's own fail goes through for real.
    fn walk_in_progress(&self, flow: &FlowContext) -> bool {
        flow.chosen.is_none() && !flow.candidates.is_empty() && flow.host_key.is_some()
    }

    fn inactive(&self, detector: Option<DetectorId>) -> bool {
        detector.is_some_and(|d| !self.detectors.get(d).is_active())
    }

    /// Attach the flow to the responder's host entry, creating it when this
    /// is the first verdict for the endpoint.
    fn attach_responder_entry(
        &mut self,
        flow: &mut FlowContext,
        pkt: &PacketView,
        detector: Option<DetectorId>,
    ) -> Result<(), ServiceVerdict> {
        if flow.host_key.is_none() {
            let port = flow.service_port.unwrap_or(pkt.src_port);
            let key = HostKey {
                ip: pkt.src_ip,
                transport: pkt.transport,
                port,
                level: self.detection_level,
            };
            let created = self.tracker.ensure(&key, |e, created| {
                if created {
                    e.state = HostState::New;
                    e.svc = detector;
                }
            });
            if created.is_none() {
                self.trace
                    .log(|| "verdict handler failed to create host state".to_string());
                return Err(ServiceVerdict::OutOfMemory);
            }
            flow.host_key = Some(key);
            flow.service_ip = Some(pkt.src_ip);
            flow.service_port = Some(port);
        } else if flow.service_ip.is_none() {
            flow.service_ip = Some(pkt.src_ip);
            if flow.service_port.is_none() {
                flow.service_port = Some(pkt.src_port);
            }
        }
        if let Some(key) = flow.host_key {
            self.tracker.with_entry(&key, |e| e.reset_time = None);
        }
        Ok(())
    }

    /// Commit path: the detector has identified the service.
    #[allow(clippy::too_many_arguments)]
    pub fn add_service(
        &mut self,
        flow: &mut FlowContext,
        pkt: &PacketView,
        dir: Direction,
        detector: DetectorId,
        app_id: AppId,
        vendor: Option<&str>,
        version: Option<&str>,
        subtypes: &[ServiceSubtype],
    ) -> ServiceVerdict {
        if !self.detectors.get(detector).is_active() {
            // Disabled detectors claim success but change nothing.
            return ServiceVerdict::Success;
        }
        flow.chosen = Some(detector);
        flow.subtypes = subtypes.to_vec();
        if let Some(v) = vendor {
            flow.vendor = Some(v.to_string());
        }
        if let Some(v) = version {
            flow.version = Some(v.to_string());
        }
        flow.service_detected = true;
        flow.app_id = Some(app_id);
        if flow.ignore_host {
            return ServiceVerdict::Success;
        }

        let (ip, mut port) = if flow.udp_reversed {
            match dir {
                Direction::Initiator => (pkt.src_ip, pkt.src_port),
                Direction::Responder => (pkt.dst_ip, pkt.dst_port),
            }
        } else {
            match dir {
                Direction::Initiator => (pkt.dst_ip, pkt.dst_port),
                Direction::Responder => (pkt.src_ip, pkt.src_port),
            }
        };
        if !flow.udp_reversed
            && let Some(sp) = flow.service_port
        {
            port = sp;
        }
        let key = HostKey {
            ip,
            transport: pkt.transport,
            port,
            level: self.detection_level,
        };

        // A reversed commit re-homes the flow onto the real server's entry.
        if flow.udp_reversed {
            flow.host_key = self.tracker.contains(&key).then_some(key);
        }

        let target = flow.host_key.unwrap_or(key);
        let existed = self
            .tracker
            .with_entry(&target, |e| {
                if let Some(list) = e.matches.take() {
                    self.pools.match_lists.put(list);
                }
                e.cursor = 0;
            })
            .is_some();
        if existed {
            if flow.service_ip.is_none() {
                flow.service_ip = Some(ip);
                flow.service_port = Some(port);
            }
        } else {
            if self.tracker.ensure(&target, |_, _| ()).is_none() {
                self.trace
                    .log(|| "add service failed to create host state".to_string());
                return ServiceVerdict::OutOfMemory;
            }
            flow.service_ip = Some(ip);
            flow.service_port = Some(port);
        }
        flow.host_key = Some(target);

        self.tracker.with_entry(&target, |e| {
            e.reset_time = None;
            if e.state != HostState::Valid {
                e.state = HostState::Valid;
                e.valid_count = 0;
                e.invalid_client_count = 0;
                e.last_invalid_client = None;
                e.detract_count = 0;
                e.last_detract = None;
            }
            e.svc = Some(detector);
            if e.valid_count == 0 {
                e.valid_count = 1;
                e.invalid_client_count = 0;
                e.last_invalid_client = None;
                e.detract_count = 0;
                e.last_detract = None;
            } else if e.valid_count < MAX_VALID_COUNT {
                e.valid_count += 1;
            }
            // Done looking for this endpoint.
            e.searching = false;
        });
        ServiceVerdict::Success
    }

    /// The detector needs more packets before it can decide.
    pub fn in_process(
        &mut self,
        flow: &mut FlowContext,
        pkt: &PacketView,
        dir: Direction,
        detector: DetectorId,
    ) -> ServiceVerdict {
        if dir == Direction::Initiator || flow.ignore_host || flow.udp_reversed {
            return ServiceVerdict::Success;
        }
        match self.attach_responder_entry(flow, pkt, Some(detector)) {
            Ok(()) => ServiceVerdict::Success,
            Err(v) => v,
        }
    }

    /// The client side of this flow looks wrong for the detector, which says
    /// little about the server. Weighted separately from a plain fail.
    pub fn incompatible_data(
        &mut self,
        flow: &mut FlowContext,
        pkt: &PacketView,
        dir: Direction,
        detector: Option<DetectorId>,
        flow_data_key: Option<u32>,
    ) -> ServiceVerdict {
        if let Some(key) = flow_data_key {
            flow.data_remove(key);
        }
        if self.walk_in_progress(flow) {
            return ServiceVerdict::Success;
        }
        flow.service_detected = true;
        flow.continue_monitoring = false;
        flow.app_id = None;
        if flow.ignore_host || flow.udp_reversed || self.inactive(detector) {
            return ServiceVerdict::Success;
        }
        if dir == Direction::Initiator {
            flow.incompatible = true;
            return ServiceVerdict::Success;
        }
        match self.attach_responder_entry(flow, pkt, detector) {
            Ok(()) => ServiceVerdict::Success,
            Err(v) => v,
        }
    }

    /// The detector has ruled the service out.
    pub fn fail_service(
        &mut self,
        flow: &mut FlowContext,
        pkt: &PacketView,
        dir: Direction,
        detector: Option<DetectorId>,
        flow_data_key: Option<u32>,
    ) -> ServiceVerdict {
        if let Some(key) = flow_data_key {
            flow.data_remove(key);
        }
        if self.walk_in_progress(flow) {
            return ServiceVerdict::Success;
        }
        flow.app_id = None;
        flow.service_detected = true;
        flow.continue_monitoring = false;
        if flow.ignore_host || flow.udp_reversed || self.inactive(detector) {
            return ServiceVerdict::Success;
        }
        if dir == Direction::Initiator {
            return ServiceVerdict::Success;
        }
        match self.attach_responder_entry(flow, pkt, detector) {
            Ok(()) => ServiceVerdict::Success,
            Err(v) => v,
        }
    }

    /// DHCP option fingerprint side channel; first one per flow wins.
    pub fn add_dhcp(&mut self, flow: &mut FlowContext, op55: &[u8], op60: &[u8], mac: [u8; 6]) {
        flow.set_dhcp_fingerprint(op55, op60, mac);
    }

    /// DHCP lease side channel. Ignored outside host-monitor mode and for
    /// all-zero addresses.
    pub fn add_host_ip(
        &mut self,
        flow: &mut FlowContext,
        mac: [u8; 6],
        ip: Ipv4Addr,
        netmask: u32,
        lease_secs: u32,
        router: u32,
    ) {
        if mac == [0u8; 6] || ip.is_unspecified() {
            return;
        }
        if !self.rna_mode || flow.dhcp_lease.is_some() {
            return;
        }
        let mut lease = self.pools.dhcp_leases.take().unwrap_or_default();
        *lease = DhcpLease {
            ip,
            mac,
            netmask,
            lease_secs,
            router,
        };
        flow.dhcp_lease = Some(lease);
    }

    /// SMB dialect side channel; the first fingerprint on a flow sticks.
    pub fn add_smb_info(&mut self, flow: &mut FlowContext, major: u32, minor: u32, flags: u32) {
        if flow.smb_info.is_some() {
            return;
        }
        let mut info = self.pools.smb_infos.take().unwrap_or_default();
        *info = SmbInfo {
            major,
            minor,
            flags,
        };
        flow.smb_info = Some(info);
    }

    /// Record a miscellaneous application seen riding on the flow.
    pub fn add_misc(&mut self, flow: &mut FlowContext, app_id: AppId) {
        flow.misc_app_id = Some(app_id);
    }
}

#[derive(Debug, Clone)]
struct RegisteredModule {
    name: &'static str,
    flow_data_key: u32,
}

/// One worker's discovery engine: thread-local registries plus a handle to
/// the shared host cache. Construct one per worker, register the same module
/// list in the same order, then `finalize_patterns` before traffic.
pub struct ServiceDiscovery {
    registry: Registry,
    tracker: Arc<HostTracker>,
    pools: DiscoveryPools,
    config: DiscoveryConfig,
    trace: TraceLog,
    modules: Vec<RegisteredModule>,
}

impl ServiceDiscovery {
    pub fn new(config: DiscoveryConfig, tracker: Arc<HostTracker>) -> Self {
        let trace = TraceLog::new(config.debug, 512);
        ServiceDiscovery {
            registry: Registry::new(),
            tracker,
            pools: DiscoveryPools::new(),
            config,
            trace,
            modules: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn tracker(&self) -> &HostTracker {
        &self.tracker
    }

    pub fn trace(&self) -> &TraceLog {
        &self.trace
    }

    /// Register a service module: bind its static ports, assign its flow
    /// data slot, and run its init hook for pattern and app-id registration.
    pub fn register_module(&mut self, module: &ServiceModule) -> Result<u32, String> {
        if self.modules.len() as u32 >= MAX_SERVICE_MODULES {
            return Err("maximum number of service modules exceeded".to_string());
        }
        let flow_data_key = self.modules.len() as u32 | SERVICE_MODULE_STATE_BIT;
        let spec = DetectorSpec {
            validate: module.validate,
            user_data: module.user_data,
            name: module.name,
            provides_user: module.provides_user,
            flow_data_key,
        };
        for binding in module.ports {
            self.registry
                .add_port(&spec, binding.transport, binding.port, binding.reversed);
        }
        if let Some(init) = module.init {
            let mut registrar = Registrar {
                registry: &mut self.registry,
                trace: &mut self.trace,
                instance_id: self.config.instance_id,
                debug: self.config.debug,
                flow_data_key,
            };
            init(&mut registrar).map_err(|e| format!("init of service {}: {e}", module.name))?;
        }
        self.modules.push(RegisteredModule {
            name: module.name,
            flow_data_key,
        });
        Ok(flow_data_key)
    }

    /// Activate registered detectors and build both pattern automatons.
    /// Must run after registration and before the first packet.
    pub fn finalize_patterns(&mut self) -> Result<(), String> {
        self.registry.detectors.activate_all();
        self.registry.tcp_patterns.prepare()?;
        self.registry.udp_patterns.prepare()
    }

    pub fn module_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.modules.iter().map(|m| m.name)
    }

    /// Commit an FTP data channel to the control channel's fast path
    /// detector, skipping the search entirely.
    pub fn prime_expected_ftp(&self, flow: &mut FlowContext) -> bool {
        match self.registry.ftp_fast_path() {
            Some(id) => {
                flow.chosen = Some(id);
                true
            }
            None => false,
        }
    }

    /// Give pooled side-channel nodes back when a flow is torn down.
    pub fn recycle_flow(&mut self, flow: &mut FlowContext) {
        if let Some(lease) = flow.dhcp_lease.take() {
            self.pools.dhcp_leases.put(lease);
        }
        if let Some(info) = flow.smb_info.take() {
            self.pools.smb_infos.put(info);
        }
        flow.candidates.clear();
    }

    pub fn dump_ports(&self, out: &mut dyn Write) -> io::Result<()> {
        self.registry.ports.dump(out)
    }

    fn api(&mut self) -> DetectorApi<'_> {
        DetectorApi {
            tracker: &self.tracker,
            detectors: &self.registry.detectors,
            pools: &mut self.pools,
            trace: &mut self.trace,
            detection_level: self.config.detection_level,
            rna_mode: self.config.rna_mode,
        }
    }

    fn run_validator(
        &mut self,
        id: DetectorId,
        pkt: &PacketView,
        dir: Direction,
        flow: &mut FlowContext,
    ) -> ServiceVerdict {
        let (validate, user_data, flow_data_key) = {
            let d = self.registry.detectors.get(id);
            (d.validate, d.user_data, d.flow_data_key)
        };
        let verdict = {
            let mut args = ServiceArgs {
                pkt,
                dir,
                flow,
                detector: id,
                user_data,
                flow_data_key,
                api: DetectorApi {
                    tracker: &self.tracker,
                    detectors: &self.registry.detectors,
                    pools: &mut self.pools,
                    trace: &mut self.trace,
                    detection_level: self.config.detection_level,
                    rna_mode: self.config.rna_mode,
                },
            };
            validate(&mut args)
        };
        self.trace.log(|| {
            format!(
                "{} returned {verdict:?}",
                self.registry.detectors.get(id).name
            )
        });
        verdict
    }

    /// Resolve a UDP-reverse candidate before any entry lock is taken:
    /// reverse-direction host knowledge first, then the reversed port table,
    /// then a pattern scan of the payload. `Some(..)` means the attempt was
    /// made, even if it found nothing.
    fn reverse_candidate(
        &mut self,
        pkt: &PacketView,
        dir: Direction,
        flow: &FlowContext,
    ) -> Option<Option<DetectorId>> {
        if dir != Direction::Initiator
            || pkt.transport != Transport::Udp
            || flow.additional_packet
            || flow.tried_reverse_service
        {
            return None;
        }
        let reverse_key = HostKey {
            ip: pkt.src_ip,
            transport: pkt.transport,
            port: pkt.src_port,
            level: self.config.detection_level,
        };
        if let Some(svc) = self.tracker.svc_of(&reverse_key) {
            return Some(Some(svc));
        }
        if let Some(first) = self.registry.ports.reversed_first(pkt.src_port) {
            return Some(Some(first));
        }
        if !pkt.payload.is_empty() {
            let list = self.registry.udp_patterns.find_all(
                pkt.payload,
                &mut self.pools.match_lists,
                &mut self.trace,
            );
            let first = list.first().map(|m| m.detector);
            self.pools.match_lists.put(list);
            return Some(first);
        }
        Some(None)
    }

    /// Per-packet entry point. Consults the host cache, assembles and runs
    /// the candidate walk, interprets verdicts, and feeds failures back into
    /// the host state machine.
    pub fn discover(
        &mut self,
        pkt: &PacketView,
        dir: Direction,
        flow: &mut FlowContext,
        now: Instant,
    ) -> ServiceVerdict {
        let transport = pkt.transport;
        flow.note_endpoints(pkt, dir);

        let (ip, port) = match (flow.service_ip, flow.service_port) {
            (Some(ip), Some(port)) => (ip, port),
            _ => pkt.server_endpoint(dir),
        };
        if port == 0 {
            self.trace
                .log(|| format!("dropping portless {transport:?} packet for {ip}"));
            return ServiceVerdict::Invalid;
        }

        let key = match flow.host_key {
            Some(k) => k,
            None => {
                let k = HostKey {
                    ip,
                    transport,
                    port,
                    level: self.config.detection_level,
                };
                if self.tracker.ensure(&k, |_, _| ()).is_none() {
                    self.trace
                        .log(|| "discover failed to create host state".to_string());
                    return ServiceVerdict::OutOfMemory;
                }
                flow.host_key = Some(k);
                k
            }
        };

        if flow.chosen.is_none() {
            self.tracker.with_entry(&key, |e| {
                if e.state == HostState::Valid && e.svc.is_some() {
                    // The cache already knows this endpoint; adopt it.
                    flow.chosen = e.svc;
                } else if e.state == HostState::BruteForce
                    && flow.candidates_tried == 0
                    && !e.searching
                {
                    let next = self.registry.detectors.next_active(transport, e.svc);
                    flow.chosen = next;
                    e.svc = next;
                }
            });
        }

        let mut ret;
        let mut validated: Option<DetectorId> = None;

        if let Some(chosen) = flow.chosen {
            let verdict = self.run_validator(chosen, pkt, dir, flow);
            if verdict == ServiceVerdict::NotCompatible {
                flow.got_incompatible = true;
            }
            validated = Some(chosen);
            ret = verdict;
        } else {
            if !flow.candidates_active {
                flow.candidates_active = true;
                flow.candidates.clear();
                flow.candidates_tried = 0;
                // Another flow mid-search on this endpoint means contention;
                // restart the sequence for this one.
                self.tracker.with_entry(&key, |e| {
                    if e.searching {
                        e.state = HostState::New;
                    }
                    e.searching = true;
                });
            }

            let mut reverse = self.reverse_candidate(pkt, dir, flow);
            let ssl_decoded = self.config.detection_level == 1;

            self.tracker.with_entry(&key, |e| {
                let eligible = matches!(e.state, HostState::New | HostState::Port)
                    || (e.state == HostState::Pattern && dir == Direction::Responder);
                if !eligible {
                    return;
                }
                while (flow.candidates_tried as usize) < MAX_CANDIDATES {
                    let next = next_service(
                        e,
                        flow,
                        pkt,
                        dir,
                        &self.registry,
                        &mut self.pools,
                        &mut self.trace,
                        &mut reverse,
                        ssl_decoded,
                    );
                    match next {
                        Some(id) if !flow.candidates.contains(&id) => {
                            flow.candidates.push(id);
                            flow.candidates_tried += 1;
                        }
                        _ => break,
                    }
                }
            });

            // Run every current candidate in insertion order.
            ret = ServiceVerdict::InProcess;
            let mut i = 0;
            while i < flow.candidates.len() {
                let candidate = flow.candidates[i];
                let verdict = self.run_validator(candidate, pkt, dir, flow);
                if verdict == ServiceVerdict::NotCompatible {
                    flow.got_incompatible = true;
                }
                match verdict {
                    ServiceVerdict::Success => {
                        ret = ServiceVerdict::Success;
                        flow.chosen = Some(candidate);
                        flow.candidates.clear();
                        flow.candidates_active = false;
                        validated = Some(candidate);
                        break;
                    }
                    ServiceVerdict::InProcess => i += 1,
                    _ => {
                        flow.candidates.remove(i);
                    }
                }
            }

            if ret != ServiceVerdict::Success
                && flow.candidates.is_empty()
                && (flow.candidates_tried as usize >= MAX_CANDIDATES
                    || self.tracker.with_entry(&key, |e| e.state) == Some(HostState::BruteForce))
            {
                // Tried everything and found nothing.
                self.api().fail_service(flow, pkt, dir, None, None);
                ret = ServiceVerdict::NoMatch;
            }
        }

        if validated.is_some() {
            self.tracker.with_entry(&key, |e| e.reset_time = None);
        } else if dir == Direction::Responder {
            // Bidirectional exchange without an identification.
            self.trace.log(|| "no service detector claimed the flow".to_string());
            self.api().fail_service(flow, pkt, dir, None, None);
            ret = ServiceVerdict::NoMatch;
        }

        if ret != ServiceVerdict::InProcess && ret != ServiceVerdict::Success {
            let (client_ip, _) = pkt.client_endpoint(dir);
            let walk_active = flow.candidates_active;
            let got_incompatible = flow.got_incompatible;
            self.tracker.with_entry(&key, |e| {
                if got_incompatible && e.invalid_client_count < INVALID_CLIENT_THRESHOLD {
                    if e.last_invalid_client == Some(client_ip) {
                        e.invalid_client_count += 1;
                    } else {
                        e.invalid_client_count += 3;
                        e.last_invalid_client = Some(client_ip);
                    }
                }
                e.handle_failure(client_ip, false, walk_active, now);
            });
        }

        // Pattern lists are dead weight once the search settles.
        self.tracker.with_entry(&key, |e| {
            if matches!(e.state, HostState::BruteForce | HostState::Valid) {
                e.release_matches(&mut self.pools.match_lists);
            }
        });

        ret
    }

    /// Flow teardown while a detector was still working: weigh it as
    /// inconclusive and run the failure handler with the true client IP,
    /// flagged as a timeout.
    pub fn fail_in_process(&mut self, flow: &mut FlowContext, now: Instant) {
        if flow.service_detected || flow.udp_reversed {
            return;
        }
        if flow.service_ip.is_none() {
            return;
        }
        let Some(key) = flow.host_key else {
            return;
        };
        let Some(client_ip) = flow.client_ip() else {
            return;
        };
        let svc_inactive = self.tracker.with_entry(&key, |e| {
            e.svc
                .is_some_and(|s| !self.registry.detectors.get(s).is_active())
        });
        match svc_inactive {
            None | Some(true) => return,
            Some(false) => {}
        }
        let walk_active = flow.candidates_active;
        self.tracker.with_entry(&key, |e| {
            e.invalid_client_count += INCONCLUSIVE_WEIGHT;
            e.handle_failure(client_ip, true, walk_active, now);
        });
    }
}

/// Pick the next detector to trial for this host, advancing the entry's
/// search state: ports first, then patterns (or the one-shot UDP-reverse
/// probe from the initiator side), then brute force.
#[allow(clippy::too_many_arguments)]
fn next_service(
    entry: &mut HostEntry,
    flow: &mut FlowContext,
    pkt: &PacketView,
    dir: Direction,
    registry: &Registry,
    pools: &mut DiscoveryPools,
    trace: &mut TraceLog,
    reverse: &mut Option<Option<DetectorId>>,
    ssl_decoded: bool,
) -> Option<DetectorId> {
    if entry.state == HostState::New {
        entry.state = HostState::Port;
        entry.svc = None;
    }

    if entry.state == HostState::Port {
        let port = match dir {
            Direction::Responder => pkt.src_port,
            Direction::Initiator => pkt.dst_port,
        };
        if let Some(next) = registry
            .ports
            .next_by_port(pkt.transport, port, entry.svc, ssl_decoded)
        {
            entry.svc = Some(next);
            return Some(next);
        }
        entry.state = HostState::Pattern;
        entry.svc = None;
        entry.cursor = 0;
    }

    if entry.state == HostState::Pattern {
        if dir == Direction::Initiator {
            if let Some(attempt) = reverse.take() {
                flow.tried_reverse_service = true;
                if let Some(rev) = attempt {
                    entry.svc = Some(rev);
                    return Some(rev);
                }
            }
            return None;
        }
        if entry.matches.is_none() {
            let patterns = match pkt.transport {
                Transport::Tcp => &registry.tcp_patterns,
                Transport::Udp => &registry.udp_patterns,
            };
            let list = patterns.find_all(pkt.payload, &mut pools.match_lists, trace);
            if let Some(first) = list.first().map(|m| m.detector) {
                entry.svc = Some(first);
                entry.matches = Some(list);
                entry.cursor = 0;
                return Some(first);
            }
            pools.match_lists.put(list);
        } else if let Some(next) = entry.next_by_pattern(&registry.detectors) {
            entry.svc = Some(next);
            return Some(next);
        }
        entry.state = HostState::BruteForce;
        entry.svc = None;
    }

    // Valid and brute-force states hand out nothing here.
    None
}
