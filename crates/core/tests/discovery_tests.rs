#![forbid(unsafe_code)]

use argus_core::{
    AppId, DetectorSpec, Direction, DiscoveryConfig, FlowContext, HostKey, HostState, HostTracker,
    PacketView, PortSpec, ServiceArgs, ServiceDiscovery, ServiceModule, ServiceVerdict, Transport,
    SERVICE_MODULE_STATE_BIT,
};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Instant;

const APP_FTP: AppId = 21;
const APP_SIP: AppId = 5060;
const APP_IMAP: AppId = 143;
const APP_SNMP: AppId = 161;

#[derive(Debug, Clone, Copy)]
enum Step {
    Succeed(AppId),
    SucceedReversed(AppId),
    InProcess,
    Fail,
    Incompatible,
    SideData,
    SideDataAlt,
    SideDataZero,
}

const LEASE_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

thread_local! {
    static SCRIPTS: RefCell<HashMap<&'static str, VecDeque<Step>>> =
        RefCell::new(HashMap::new());
}

fn script(name: &'static str, steps: &[Step]) {
    SCRIPTS.with(|s| {
        s.borrow_mut().insert(name, steps.iter().copied().collect());
    });
}

fn remaining(name: &'static str) -> usize {
    SCRIPTS.with(|s| s.borrow().get(name).map(|q| q.len()).unwrap_or(0))
}

fn run_script(name: &'static str, args: &mut ServiceArgs<'_, '_>) -> ServiceVerdict {
    let step = SCRIPTS
        .with(|s| s.borrow_mut().get_mut(name).and_then(|q| q.pop_front()))
        .unwrap_or(Step::Fail);
    match step {
        Step::Succeed(app) => {
            args.api.add_service(
                args.flow,
                args.pkt,
                args.dir,
                args.detector,
                app,
                Some("acme"),
                Some("1.0"),
                &[],
            );
            ServiceVerdict::Success
        }
        Step::SucceedReversed(app) => {
            args.flow.udp_reversed = true;
            args.api.add_service(
                args.flow,
                args.pkt,
                args.dir,
                args.detector,
                app,
                None,
                None,
                &[],
            );
            ServiceVerdict::Success
        }
        Step::InProcess => {
            args.api
                .in_process(args.flow, args.pkt, args.dir, args.detector);
            ServiceVerdict::InProcess
        }
        Step::Fail => {
            args.api
                .fail_service(args.flow, args.pkt, args.dir, Some(args.detector), None);
            ServiceVerdict::Fail
        }
        Step::Incompatible => {
            args.api.incompatible_data(
                args.flow,
                args.pkt,
                args.dir,
                Some(args.detector),
                None,
            );
            ServiceVerdict::NotCompatible
        }
        Step::SideData => {
            args.api
                .add_dhcp(args.flow, &[1, 3, 6, 15], b"udhcp 1.30", LEASE_MAC);
            args.api.add_host_ip(
                args.flow,
                LEASE_MAC,
                Ipv4Addr::new(10, 0, 0, 99),
                0xffff_ff00,
                86_400,
                0x0a00_0001,
            );
            args.api.add_smb_info(args.flow, 3, 1, 0x0004);
            args.api.add_misc(args.flow, 150);
            args.api
                .in_process(args.flow, args.pkt, args.dir, args.detector);
            ServiceVerdict::InProcess
        }
        Step::SideDataAlt => {
            args.api.add_dhcp(args.flow, &[9], &[], LEASE_MAC);
            args.api.add_host_ip(
                args.flow,
                LEASE_MAC,
                Ipv4Addr::new(10, 0, 0, 77),
                0xffff_0000,
                600,
                0x0a00_0002,
            );
            args.api.add_smb_info(args.flow, 2, 0, 0);
            args.api.add_misc(args.flow, 151);
            args.api
                .in_process(args.flow, args.pkt, args.dir, args.detector);
            ServiceVerdict::InProcess
        }
        Step::SideDataZero => {
            args.api.add_dhcp(args.flow, &[], &[], [0; 6]);
            args.api.add_host_ip(
                args.flow,
                [0; 6],
                Ipv4Addr::UNSPECIFIED,
                0,
                0,
                0,
            );
            args.api
                .in_process(args.flow, args.pkt, args.dir, args.detector);
            ServiceVerdict::InProcess
        }
    }
}

macro_rules! scripted {
    ($fn_name:ident, $name:literal) => {
        fn $fn_name(args: &mut ServiceArgs<'_, '_>) -> ServiceVerdict {
            run_script($name, args)
        }
    };
}

scripted!(v_ftp, "ftp");
scripted!(v_bgp, "bgp");
scripted!(v_boot, "boot");
scripted!(v_imap, "imap");
scripted!(v_snmp, "snmp");
scripted!(v_sip1, "sip1");
scripted!(v_sip2, "sip2");
scripted!(v_sip3, "sip3");
scripted!(v_sip4, "sip4");
scripted!(v_alt, "alt");
scripted!(v_w00, "w00");
scripted!(v_w01, "w01");
scripted!(v_w02, "w02");
scripted!(v_w03, "w03");
scripted!(v_w04, "w04");
scripted!(v_w05, "w05");
scripted!(v_w06, "w06");
scripted!(v_w07, "w07");
scripted!(v_w08, "w08");
scripted!(v_w09, "w09");
scripted!(v_w10, "w10");
scripted!(v_w11, "w11");

fn engine() -> ServiceDiscovery {
    engine_with(DiscoveryConfig::default())
}

fn engine_with(config: DiscoveryConfig) -> ServiceDiscovery {
    ServiceDiscovery::new(config, Arc::new(HostTracker::new(1024, 4)))
}

fn spec(validate: argus_core::ValidateFn, name: &str) -> DetectorSpec<'_> {
    DetectorSpec {
        validate,
        user_data: None,
        name,
        provides_user: false,
        flow_data_key: 0,
    }
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn packet<'p>(
    src: &str,
    src_port: u16,
    dst: &str,
    dst_port: u16,
    transport: Transport,
    payload: &'p [u8],
) -> PacketView<'p> {
    PacketView {
        src_ip: ip(src),
        dst_ip: ip(dst),
        src_port,
        dst_port,
        transport,
        payload,
    }
}

const SERVER: &str = "5.6.7.8";
const CLIENT: &str = "1.2.3.4";

#[test]
fn port_led_hit_learns_the_endpoint() {
    let mut engine = engine();
    engine
        .registry_mut()
        .add_port(&spec(v_ftp, "ftp"), Transport::Tcp, 21, false);
    engine.finalize_patterns().unwrap();

    script("ftp", &[Step::Succeed(APP_FTP)]);
    let mut flow = FlowContext::new();
    let reply = packet(SERVER, 21, CLIENT, 40000, Transport::Tcp, b"220 ready");
    let verdict = engine.discover(&reply, Direction::Responder, &mut flow, Instant::now());
    assert_eq!(verdict, ServiceVerdict::Success);
    assert!(flow.service_detected);
    assert_eq!(flow.app_id, Some(APP_FTP));
    assert_eq!(flow.service_ip, Some(ip(SERVER)));
    assert_eq!(flow.service_port, Some(21));
    assert_eq!(flow.vendor.as_deref(), Some("acme"));

    let key = HostKey {
        ip: ip(SERVER),
        transport: Transport::Tcp,
        port: 21,
        level: 0,
    };
    let (state, valid_count) = engine
        .tracker()
        .with_entry(&key, |e| (e.state, e.valid_count))
        .unwrap();
    assert_eq!(state, HostState::Valid);
    assert_eq!(valid_count, 1);

    // A different flow to the same endpoint adopts the detector without a
    // candidate walk.
    script("ftp", &[Step::Succeed(APP_FTP)]);
    let mut flow2 = FlowContext::new();
    let hello = packet("9.9.9.9", 51000, SERVER, 21, Transport::Tcp, b"");
    let verdict = engine.discover(&hello, Direction::Initiator, &mut flow2, Instant::now());
    assert_eq!(verdict, ServiceVerdict::Success);
    assert!(!flow2.candidates_active);
    assert!(flow2.candidates.is_empty());
    let valid_count = engine
        .tracker()
        .with_entry(&key, |e| e.valid_count)
        .unwrap();
    assert_eq!(valid_count, 2);
}

#[test]
fn positioned_pattern_miss_escalates_to_brute_force() {
    let mut engine = engine();
    let mut trace = argus_core::TraceLog::new(false, 8);
    // Marker must sit at offset 19; this payload carries it at offset 0.
    engine.registry_mut().register_pattern(
        &spec(v_bgp, "bgp"),
        Transport::Tcp,
        &[0xff; 16],
        Some(19),
        &mut trace,
    );
    engine.finalize_patterns().unwrap();

    let mut payload = vec![0u8; 40];
    payload[..16].copy_from_slice(&[0xff; 16]);
    let mut flow = FlowContext::new();
    let reply = packet(SERVER, 179, CLIENT, 40001, Transport::Tcp, &payload);
    let verdict = engine.discover(&reply, Direction::Responder, &mut flow, Instant::now());
    assert_eq!(verdict, ServiceVerdict::NoMatch);

    let key = HostKey {
        ip: ip(SERVER),
        transport: Transport::Tcp,
        port: 179,
        level: 0,
    };
    let state = engine.tracker().with_entry(&key, |e| e.state).unwrap();
    assert_eq!(state, HostState::BruteForce);
}

#[test]
fn parallel_candidates_commit_to_the_second() {
    let mut engine = engine();
    for (validate, name) in [
        (v_sip1 as argus_core::ValidateFn, "sip1"),
        (v_sip2, "sip2"),
        (v_sip3, "sip3"),
        (v_sip4, "sip4"),
    ] {
        engine
            .registry_mut()
            .add_port(&spec(validate, name), Transport::Udp, 5060, false);
    }
    engine.finalize_patterns().unwrap();

    script("sip1", &[Step::InProcess, Step::InProcess]);
    script("sip2", &[Step::InProcess, Step::Succeed(APP_SIP)]);
    script("sip3", &[Step::InProcess]);
    script("sip4", &[Step::InProcess]);

    let mut flow = FlowContext::new();
    let invite = packet(CLIENT, 40002, SERVER, 5060, Transport::Udp, b"INVITE");
    let verdict = engine.discover(&invite, Direction::Initiator, &mut flow, Instant::now());
    assert_eq!(verdict, ServiceVerdict::InProcess);
    assert_eq!(flow.candidates.len(), 4);
    flow.additional_packet = true;

    let ok = packet(SERVER, 5060, CLIENT, 40002, Transport::Udp, b"200 OK");
    let verdict = engine.discover(&ok, Direction::Responder, &mut flow, Instant::now());
    assert_eq!(verdict, ServiceVerdict::Success);
    assert!(flow.candidates.is_empty());
    assert_eq!(flow.app_id, Some(APP_SIP));
    // sip3 and sip4 were never consulted after the commit; sip2 consumed
    // both steps, sip1 only its first.
    assert_eq!(remaining("sip2"), 0);
    assert_eq!(remaining("sip3"), 0);
    assert_eq!(remaining("sip4"), 0);

    // Later packets go straight to the committed detector.
    script("sip2", &[Step::Succeed(APP_SIP)]);
    let more = packet(SERVER, 5060, CLIENT, 40002, Transport::Udp, b"more");
    let verdict = engine.discover(&more, Direction::Responder, &mut flow, Instant::now());
    assert_eq!(verdict, ServiceVerdict::Success);
    assert_eq!(remaining("sip1"), 1);
}

#[test]
fn detract_hysteresis_steps_valid_count_down() {
    let mut engine = engine();
    engine
        .registry_mut()
        .add_port(&spec(v_ftp, "ftp"), Transport::Tcp, 21, false);
    engine.finalize_patterns().unwrap();

    let key = HostKey {
        ip: ip(SERVER),
        transport: Transport::Tcp,
        port: 21,
        level: 0,
    };
    // Three clean commits from distinct clients take valid_count to 3.
    for client in ["1.1.1.1", "1.1.1.2", "1.1.1.3"] {
        script("ftp", &[Step::Succeed(APP_FTP)]);
        let mut flow = FlowContext::new();
        let reply = packet(SERVER, 21, client, 40100, Transport::Tcp, b"220");
        engine.discover(&reply, Direction::Responder, &mut flow, Instant::now());
    }
    assert_eq!(
        engine.tracker().with_entry(&key, |e| e.valid_count),
        Some(3)
    );

    // The same client failing three times detracts once.
    let noisy = "6.6.6.6";
    for _ in 0..3 {
        script("ftp", &[Step::Fail]);
        let mut flow = FlowContext::new();
        let reply = packet(SERVER, 21, noisy, 40200, Transport::Tcp, b"junk");
        engine.discover(&reply, Direction::Responder, &mut flow, Instant::now());
    }
    let (state, valid_count) = engine
        .tracker()
        .with_entry(&key, |e| (e.state, e.valid_count))
        .unwrap();
    assert_eq!(state, HostState::Valid);
    assert_eq!(valid_count, 2);

    // With the invalid-client count at the threshold, the next fail steps
    // down again and clears the counters.
    engine
        .tracker()
        .with_entry(&key, |e| e.invalid_client_count = 9)
        .unwrap();
    script("ftp", &[Step::Fail]);
    let mut flow = FlowContext::new();
    let reply = packet(SERVER, 21, noisy, 40201, Transport::Tcp, b"junk");
    engine.discover(&reply, Direction::Responder, &mut flow, Instant::now());
    let (state, valid_count, invalid) = engine
        .tracker()
        .with_entry(&key, |e| (e.state, e.valid_count, e.invalid_client_count))
        .unwrap();
    assert_eq!(state, HostState::Valid);
    assert_eq!(valid_count, 1);
    assert_eq!(invalid, 0);

    // At valid_count 1 a further repeat-client fail resets the entry.
    script("ftp", &[Step::Fail]);
    let mut flow = FlowContext::new();
    let reply = packet(SERVER, 21, noisy, 40202, Transport::Tcp, b"junk");
    engine.discover(&reply, Direction::Responder, &mut flow, Instant::now());
    let (state, valid_count) = engine
        .tracker()
        .with_entry(&key, |e| (e.state, e.valid_count))
        .unwrap();
    assert_eq!(state, HostState::New);
    assert_eq!(valid_count, 0);
}

#[test]
fn ssl_remap_reaches_cleartext_registrations() {
    let mut engine = engine_with(DiscoveryConfig {
        detection_level: 1,
        ..DiscoveryConfig::default()
    });
    engine
        .registry_mut()
        .add_port(&spec(v_imap, "imap"), Transport::Tcp, 143, false);
    engine.finalize_patterns().unwrap();

    // Registry-level: port 993 resolves through the remap.
    let id = engine.registry().detectors.find(v_imap, None).unwrap();
    assert_eq!(
        engine
            .registry()
            .ports
            .next_by_port(Transport::Tcp, 993, None, true),
        Some(id)
    );

    // End to end: a flow to 993 is validated by the 143 registration.
    script("imap", &[Step::Succeed(APP_IMAP)]);
    let mut flow = FlowContext::new();
    let reply = packet(SERVER, 993, CLIENT, 40300, Transport::Tcp, b"* OK");
    let verdict = engine.discover(&reply, Direction::Responder, &mut flow, Instant::now());
    assert_eq!(verdict, ServiceVerdict::Success);
    assert_eq!(flow.app_id, Some(APP_IMAP));
}

#[test]
fn walk_swallows_individual_fails_until_exhausted() {
    let mut engine = engine();
    engine
        .registry_mut()
        .add_port(&spec(v_ftp, "ftp"), Transport::Tcp, 2121, false);
    engine
        .registry_mut()
        .add_port(&spec(v_alt, "alt"), Transport::Tcp, 2121, false);
    engine.finalize_patterns().unwrap();

    script("ftp", &[Step::Fail]);
    script("alt", &[Step::InProcess, Step::Fail]);

    let mut flow = FlowContext::new();
    let reply = packet(SERVER, 2121, CLIENT, 40400, Transport::Tcp, b"hello");
    let verdict = engine.discover(&reply, Direction::Responder, &mut flow, Instant::now());
    // The first detector's fail was swallowed and it left the list; the
    // second is still working.
    assert_eq!(verdict, ServiceVerdict::NoMatch);
    assert_eq!(flow.candidates.len(), 1);
    assert!(!flow.service_detected);

    let reply = packet(SERVER, 2121, CLIENT, 40400, Transport::Tcp, b"more");
    let verdict = engine.discover(&reply, Direction::Responder, &mut flow, Instant::now());
    assert_eq!(verdict, ServiceVerdict::NoMatch);
    assert!(flow.candidates.is_empty());
    assert!(flow.service_detected);

    let key = HostKey {
        ip: ip(SERVER),
        transport: Transport::Tcp,
        port: 2121,
        level: 0,
    };
    let state = engine.tracker().with_entry(&key, |e| e.state).unwrap();
    assert_eq!(state, HostState::BruteForce);
}

#[test]
fn candidate_list_is_capped() {
    let mut engine = engine();
    let detectors: [(argus_core::ValidateFn, &str); 12] = [
        (v_w00, "w00"),
        (v_w01, "w01"),
        (v_w02, "w02"),
        (v_w03, "w03"),
        (v_w04, "w04"),
        (v_w05, "w05"),
        (v_w06, "w06"),
        (v_w07, "w07"),
        (v_w08, "w08"),
        (v_w09, "w09"),
        (v_w10, "w10"),
        (v_w11, "w11"),
    ];
    for (validate, name) in detectors {
        engine
            .registry_mut()
            .add_port(&spec(validate, name), Transport::Tcp, 7000, false);
        script(name, &[Step::InProcess]);
    }
    engine.finalize_patterns().unwrap();

    let mut flow = FlowContext::new();
    let reply = packet(SERVER, 7000, CLIENT, 40500, Transport::Tcp, b"??");
    engine.discover(&reply, Direction::Responder, &mut flow, Instant::now());
    assert_eq!(flow.candidates.len(), 10);
    assert_eq!(flow.candidates_tried, 10);
    // The two detectors beyond the cap were never started.
    assert_eq!(remaining("w10"), 1);
    assert_eq!(remaining("w11"), 1);
}

#[test]
fn udp_reversed_registration_identifies_the_initiator() {
    let mut engine = engine();
    engine
        .registry_mut()
        .add_port(&spec(v_snmp, "snmp"), Transport::Udp, 162, true);
    engine.finalize_patterns().unwrap();

    script("snmp", &[Step::SucceedReversed(APP_SNMP)]);
    let mut flow = FlowContext::new();
    // The agent (initiator) sends the trap from its service port.
    let trap = packet("10.0.0.9", 162, "10.0.0.50", 5500, Transport::Udp, b"trap");
    let verdict = engine.discover(&trap, Direction::Initiator, &mut flow, Instant::now());
    assert_eq!(verdict, ServiceVerdict::Success);
    assert!(flow.udp_reversed);
    assert!(flow.tried_reverse_service);
    assert_eq!(flow.service_ip, Some(ip("10.0.0.9")));
    assert_eq!(flow.service_port, Some(162));
}

#[test]
fn in_process_is_idempotent_on_the_host_entry() {
    let mut engine = engine();
    engine
        .registry_mut()
        .add_port(&spec(v_ftp, "ftp"), Transport::Tcp, 21, false);
    engine.finalize_patterns().unwrap();

    script("ftp", &[Step::InProcess, Step::InProcess, Step::InProcess]);
    let mut flow = FlowContext::new();
    let key = HostKey {
        ip: ip(SERVER),
        transport: Transport::Tcp,
        port: 21,
        level: 0,
    };
    for _ in 0..3 {
        let reply = packet(SERVER, 21, CLIENT, 40600, Transport::Tcp, b"2");
        engine.discover(&reply, Direction::Responder, &mut flow, Instant::now());
    }
    assert_eq!(flow.service_ip, Some(ip(SERVER)));
    let entry = engine
        .tracker()
        .with_entry(&key, |e| (e.state, e.valid_count, e.svc))
        .unwrap();
    // The endpoint is pinned but nothing was validated or counted, no
    // matter how often the detector reported in-process.
    assert_eq!(entry, (HostState::BruteForce, 0, None));
}

#[test]
fn teardown_mid_search_weighs_as_inconclusive() {
    let mut engine = engine();
    engine
        .registry_mut()
        .add_port(&spec(v_ftp, "ftp"), Transport::Tcp, 21, false);
    engine.finalize_patterns().unwrap();

    script("ftp", &[Step::InProcess]);
    let mut flow = FlowContext::new();
    let reply = packet(SERVER, 21, CLIENT, 40700, Transport::Tcp, b"2");
    engine.discover(&reply, Direction::Responder, &mut flow, Instant::now());
    assert!(!flow.service_detected);

    engine.fail_in_process(&mut flow, Instant::now());
    let key = HostKey {
        ip: ip(SERVER),
        transport: Transport::Tcp,
        port: 21,
        level: 0,
    };
    let (state, invalid, searching) = engine
        .tracker()
        .with_entry(&key, |e| (e.state, e.invalid_client_count, e.searching))
        .unwrap();
    assert_eq!(invalid, 3);
    // Timed-out searches restart the sequence for the next flow.
    assert_eq!(state, HostState::New);
    assert!(!searching);
}

#[test]
fn side_channels_reach_the_flow_through_the_api() {
    let mut engine = engine_with(DiscoveryConfig {
        rna_mode: true,
        ..DiscoveryConfig::default()
    });
    engine
        .registry_mut()
        .add_port(&spec(v_boot, "boot"), Transport::Udp, 67, false);
    engine.finalize_patterns().unwrap();

    script("boot", &[Step::SideData, Step::SideDataAlt]);
    let mut flow = FlowContext::new();
    let offer = packet(SERVER, 67, CLIENT, 68, Transport::Udp, b"\x02offer");
    engine.discover(&offer, Direction::Responder, &mut flow, Instant::now());

    let fp = flow.dhcp_fingerprint.as_ref().unwrap();
    assert_eq!(fp.op55, vec![1, 3, 6, 15]);
    assert_eq!(fp.op60, b"udhcp 1.30");
    assert_eq!(fp.mac, LEASE_MAC);
    let lease = flow.dhcp_lease.as_ref().unwrap();
    assert_eq!(lease.ip, Ipv4Addr::new(10, 0, 0, 99));
    assert_eq!(lease.lease_secs, 86_400);
    let smb = flow.smb_info.as_ref().unwrap();
    assert_eq!((smb.major, smb.minor, smb.flags), (3, 1, 0x0004));
    assert_eq!(flow.misc_app_id, Some(150));

    // Second round with different data: fingerprint, lease, and dialect
    // stick with their first values; only the misc app id follows along.
    let offer = packet(SERVER, 67, CLIENT, 68, Transport::Udp, b"\x05ack");
    engine.discover(&offer, Direction::Responder, &mut flow, Instant::now());
    assert_eq!(flow.dhcp_fingerprint.as_ref().unwrap().op55, vec![1, 3, 6, 15]);
    assert_eq!(
        flow.dhcp_lease.as_ref().unwrap().ip,
        Ipv4Addr::new(10, 0, 0, 99)
    );
    assert_eq!(flow.smb_info.as_ref().unwrap().major, 3);
    assert_eq!(flow.misc_app_id, Some(151));

    // Teardown returns the pooled nodes; a later flow gets fresh values
    // through the recycled buffers.
    engine.recycle_flow(&mut flow);
    assert!(flow.dhcp_lease.is_none());
    assert!(flow.smb_info.is_none());

    script("boot", &[Step::SideData]);
    let mut flow2 = FlowContext::new();
    let offer = packet(SERVER, 67, "9.9.9.9", 68, Transport::Udp, b"\x02offer");
    engine.discover(&offer, Direction::Responder, &mut flow2, Instant::now());
    assert_eq!(
        flow2.dhcp_lease.as_ref().unwrap().ip,
        Ipv4Addr::new(10, 0, 0, 99)
    );
    assert_eq!(flow2.smb_info.as_ref().unwrap().major, 3);
}

#[test]
fn lease_side_channel_requires_monitor_mode_and_real_addresses() {
    // Outside host-monitor mode the lease is dropped; the other channels
    // still land.
    let mut engine = engine();
    engine
        .registry_mut()
        .add_port(&spec(v_boot, "boot"), Transport::Udp, 67, false);
    engine.finalize_patterns().unwrap();
    script("boot", &[Step::SideData]);
    let mut flow = FlowContext::new();
    let offer = packet(SERVER, 67, CLIENT, 68, Transport::Udp, b"\x02offer");
    engine.discover(&offer, Direction::Responder, &mut flow, Instant::now());
    assert!(flow.dhcp_lease.is_none());
    assert!(flow.dhcp_fingerprint.is_some());
    assert!(flow.smb_info.is_some());
    assert_eq!(flow.misc_app_id, Some(150));

    // All-zero MAC and address are rejected even in monitor mode, and an
    // empty option list never fingerprints.
    let mut engine = engine_with(DiscoveryConfig {
        rna_mode: true,
        ..DiscoveryConfig::default()
    });
    engine
        .registry_mut()
        .add_port(&spec(v_boot, "boot"), Transport::Udp, 67, false);
    engine.finalize_patterns().unwrap();
    script("boot", &[Step::SideDataZero]);
    let mut flow = FlowContext::new();
    let offer = packet(SERVER, 67, CLIENT, 68, Transport::Udp, b"\x02offer");
    engine.discover(&offer, Direction::Responder, &mut flow, Instant::now());
    assert!(flow.dhcp_lease.is_none());
    assert!(flow.dhcp_fingerprint.is_none());
}

#[test]
fn module_registration_assigns_flagged_flow_data_slots() {
    static FTP_PORTS: &[PortSpec] = &[PortSpec {
        transport: Transport::Tcp,
        port: 21,
        reversed: false,
    }];
    let module = ServiceModule {
        name: "ftp",
        provides_user: true,
        validate: v_ftp,
        user_data: None,
        ports: FTP_PORTS,
        init: None,
    };
    let mut engine = engine();
    let key = engine.register_module(&module).unwrap();
    assert_eq!(key, SERVICE_MODULE_STATE_BIT);
    assert_eq!(engine.module_names().collect::<Vec<_>>(), vec!["ftp"]);
    engine.finalize_patterns().unwrap();

    let id = engine.registry().detectors.find(v_ftp, None).unwrap();
    assert_eq!(engine.registry().detectors.get(id).flow_data_key, key);
    assert!(engine.registry().detectors.get(id).provides_user);
    assert_eq!(engine.registry().ftp_fast_path(), Some(id));

    // An expected FTP data channel adopts the fast path without a search.
    let mut flow = FlowContext::new();
    assert!(engine.prime_expected_ftp(&mut flow));
    assert_eq!(flow.chosen, Some(id));

    let mut out = Vec::new();
    engine.dump_ports(&mut out).unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "(tcp 21) \n(udp ) \n");
}
