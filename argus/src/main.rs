#![forbid(unsafe_code)]

use argus_config::{
    default_root, load_discovery_config, load_port_bindings, ConfigPaths, ConfigStore, PortBinding,
};
use argus_core::{
    DetectorSpec, DiscoveryConfig, FlowContext, HostTracker, PacketView, ServiceDiscovery,
};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

mod detectors;
mod trace;
use trace::{parse_trace, FlowId, TracePacket};

fn main() {
    let mut args = std::env::args().skip(1);
    let Some(cmd) = args.next() else {
        print_usage_and_exit();
        return;
    };

    let result = match cmd.as_str() {
        "show-config-root" => {
            println!("{}", default_root().display());
            Ok(())
        }
        "show-config" => cmd_show_config(),
        "config-status" => cmd_config_status(),
        "config-record" => cmd_config_record(),
        "config-rollback" => cmd_config_rollback(),
        "dump-ports" => cmd_dump_ports(),
        "replay" => cmd_replay(args.collect()),
        _ => Err(format!("Unknown command: {}", cmd)),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn print_usage_and_exit() {
    eprintln!(
        "usage: argus <command>\n\
         \n\
         commands:\n\
         \x20 show-config-root          print the config root ($ARGUS_CONFIG_ROOT)\n\
         \x20 show-config               print the effective worker tunables\n\
         \x20 config-status             show config version and tamper state\n\
         \x20 config-record             snapshot the tracked config files\n\
         \x20 config-rollback           restore the previous config version\n\
         \x20 dump-ports                print occupied detector ports\n\
         \x20 replay --file <trace> [--workers N] [--debug]\n\
         \x20                           run discovery over a packet trace"
    );
    std::process::exit(2);
}

fn cmd_show_config() -> Result<(), String> {
    let paths = ConfigPaths::new(default_root());
    let config = load_discovery_config(&paths)?;
    println!("instance_id: {}", config.instance_id);
    println!("debug: {}", config.debug);
    println!("detection_level: {}", config.detection_level);
    println!("rna_mode: {}", config.rna_mode);
    println!("host_cache_capacity: {}", config.host_cache_capacity);
    println!("host_cache_shards: {}", config.host_cache_shards);
    let bindings = load_port_bindings(&paths)?;
    for b in bindings {
        println!(
            "port binding: {} {:?} {} reversed={}",
            b.detector, b.transport, b.port, b.reversed
        );
    }
    Ok(())
}

fn cmd_config_status() -> Result<(), String> {
    let store = ConfigStore::new(default_root())?;
    let snap = store.snapshot();
    println!("version: {}", snap.version);
    println!("hash: {}", snap.hash_hex);
    println!("tampered: {}", snap.tampered);
    Ok(())
}

fn cmd_config_record() -> Result<(), String> {
    let store = ConfigStore::new(default_root())?;
    let snap = store.record_version()?;
    println!("recorded version {}", snap.version);
    Ok(())
}

fn cmd_config_rollback() -> Result<(), String> {
    let store = ConfigStore::new(default_root())?;
    let snap = store.rollback()?;
    println!("rolled back to version {}", snap.version);
    Ok(())
}

fn cmd_dump_ports() -> Result<(), String> {
    let paths = ConfigPaths::new(default_root());
    let config = load_discovery_config(&paths)?;
    let bindings = load_port_bindings(&paths)?;
    let tracker = Arc::new(HostTracker::new(
        config.host_cache_capacity,
        config.host_cache_shards,
    ));
    let engine = build_engine(config, tracker, &bindings)?;
    let mut out = std::io::stdout();
    engine
        .dump_ports(&mut out)
        .and_then(|_| out.flush())
        .map_err(|e| format!("write ports: {e}"))
}

/// Register the bundled modules (stable order), apply operator port
/// bindings, and arm the pattern indexes.
fn build_engine(
    config: DiscoveryConfig,
    tracker: Arc<HostTracker>,
    bindings: &[PortBinding],
) -> Result<ServiceDiscovery, String> {
    let mut engine = ServiceDiscovery::new(config, tracker);
    let mut module_keys: HashMap<&'static str, u32> = HashMap::new();
    for module in detectors::MODULES {
        let key = engine.register_module(module)?;
        module_keys.insert(module.name, key);
    }
    for binding in bindings {
        let Some(module) = detectors::MODULES
            .iter()
            .find(|m| m.name == binding.detector)
        else {
            return Err(format!("ports.conf: unknown detector {}", binding.detector));
        };
        let spec = DetectorSpec {
            validate: module.validate,
            user_data: module.user_data,
            name: module.name,
            provides_user: module.provides_user,
            flow_data_key: module_keys[module.name],
        };
        engine
            .registry_mut()
            .add_port(&spec, binding.transport, binding.port, binding.reversed);
    }
    engine.finalize_patterns()?;
    Ok(engine)
}

struct WorkerReport {
    lines: Vec<String>,
    flows: usize,
    detected: usize,
    trace: Vec<String>,
}

fn shard_index(id: &FlowId, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    (hasher.finish() as usize) % workers
}

fn run_worker(
    idx: usize,
    config: DiscoveryConfig,
    tracker: Arc<HostTracker>,
    bindings: &[PortBinding],
    packets: Vec<TracePacket>,
) -> Result<WorkerReport, String> {
    let mut engine = build_engine(config, tracker, bindings)?;
    let mut flows: HashMap<FlowId, FlowContext> = HashMap::new();
    let mut order: Vec<FlowId> = Vec::new();

    for p in &packets {
        let id = p.flow_id();
        let flow = flows.entry(id).or_insert_with(|| {
            order.push(id);
            FlowContext::new()
        });
        let view = PacketView {
            src_ip: p.src,
            dst_ip: p.dst,
            src_port: p.src_port,
            dst_port: p.dst_port,
            transport: p.transport,
            payload: &p.payload,
        };
        engine.discover(&view, p.dir, flow, Instant::now());
        flow.additional_packet = true;
    }

    let mut lines = Vec::new();
    let mut detected = 0;
    for id in &order {
        let Some(flow) = flows.get_mut(id) else {
            continue;
        };
        if !flow.service_detected {
            engine.fail_in_process(flow, Instant::now());
        }
        let service = match (flow.service_detected, flow.chosen, flow.app_id) {
            (true, Some(chosen), Some(app)) => {
                detected += 1;
                let name = &engine.registry().detectors.get(chosen).name;
                match (&flow.vendor, &flow.version) {
                    (Some(vendor), _) => format!("{name} (app {app}, {vendor})"),
                    (None, Some(version)) => format!("{name} (app {app}, v{version})"),
                    (None, None) => format!("{name} (app {app})"),
                }
            }
            _ => "unknown".to_string(),
        };
        let endpoint = match (flow.service_ip, flow.service_port) {
            (Some(ip), Some(port)) => format!("{ip}:{port}"),
            _ => format!("{}:{}", id.high.0, id.high.1),
        };
        let proto = if id.transport_tcp { "tcp" } else { "udp" };
        lines.push(format!("worker {idx}: {proto} {endpoint} -> {service}"));
        engine.recycle_flow(flow);
    }

    Ok(WorkerReport {
        lines,
        flows: order.len(),
        detected,
        trace: engine.trace().lines().map(String::from).collect(),
    })
}

fn cmd_replay(args: Vec<String>) -> Result<(), String> {
    let mut file: Option<String> = None;
    let mut workers = 1usize;
    let mut debug = false;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--file" => file = iter.next().cloned(),
            "--workers" => {
                workers = iter
                    .next()
                    .ok_or("Missing value for --workers")?
                    .parse()
                    .map_err(|_| "invalid worker count")?;
            }
            "--debug" => debug = true,
            other => return Err(format!("Unknown flag {other}")),
        }
    }
    let file = file.ok_or("Missing --file <trace>")?;
    let workers = workers.max(1);

    let paths = ConfigPaths::new(default_root());
    let mut config = load_discovery_config(&paths)?;
    if debug {
        config.debug = true;
    }
    let bindings = load_port_bindings(&paths)?;

    let body = fs::read_to_string(&file).map_err(|e| format!("read {file}: {e}"))?;
    let packets = parse_trace(&body)?;

    // Flows shard by their symmetric tuple so each lands on exactly one
    // worker; the host cache is the only thing workers share.
    let mut shards: Vec<Vec<TracePacket>> = vec![Vec::new(); workers];
    for p in packets {
        let at = shard_index(&p.flow_id(), workers);
        shards[at].push(p);
    }
    let tracker = Arc::new(HostTracker::new(
        config.host_cache_capacity,
        config.host_cache_shards,
    ));

    let mut reports: Vec<WorkerReport> = Vec::new();
    let mut failures: Vec<String> = Vec::new();
    thread::scope(|scope| {
        let mut handles = Vec::new();
        for (idx, work) in shards.into_iter().enumerate() {
            let tracker = tracker.clone();
            let mut config = config.clone();
            config.instance_id += idx as u32;
            let bindings = &bindings;
            handles.push(scope.spawn(move || run_worker(idx, config, tracker, bindings, work)));
        }
        for handle in handles {
            match handle.join() {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(e)) => failures.push(e),
                Err(_) => failures.push("worker panicked".to_string()),
            }
        }
    });
    if let Some(first) = failures.into_iter().next() {
        return Err(first);
    }

    let mut flows = 0;
    let mut detected = 0;
    for report in &reports {
        flows += report.flows;
        detected += report.detected;
        for line in &report.lines {
            println!("{line}");
        }
    }
    println!("{flows} flows, {detected} identified");
    println!("host cache entries: {}", tracker.len());
    if debug {
        for report in &reports {
            for line in &report.trace {
                println!("trace: {line}");
            }
        }
    }
    Ok(())
}
