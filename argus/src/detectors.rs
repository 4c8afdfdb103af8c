#![forbid(unsafe_code)]

// Reference detectors for the replay command. Real deployments register
// their own module list; these cover enough of the common banners to make
// a capture walk-through useful.

use argus_core::{
    AppId, Direction, PortSpec, Registrar, ServiceArgs, ServiceModule, ServiceVerdict, Transport,
};

pub const APP_FTP: AppId = 21;
pub const APP_SSH: AppId = 22;
pub const APP_DNS: AppId = 53;
pub const APP_HTTP: AppId = 80;
pub const APP_SMB: AppId = 445;

static FTP_PORTS: &[PortSpec] = &[PortSpec {
    transport: Transport::Tcp,
    port: 21,
    reversed: false,
}];

static SSH_PORTS: &[PortSpec] = &[PortSpec {
    transport: Transport::Tcp,
    port: 22,
    reversed: false,
}];

static HTTP_PORTS: &[PortSpec] = &[
    PortSpec {
        transport: Transport::Tcp,
        port: 80,
        reversed: false,
    },
    PortSpec {
        transport: Transport::Tcp,
        port: 8080,
        reversed: false,
    },
];

static DNS_PORTS: &[PortSpec] = &[PortSpec {
    transport: Transport::Udp,
    port: 53,
    reversed: false,
}];

static SMB_PORTS: &[PortSpec] = &[PortSpec {
    transport: Transport::Tcp,
    port: 445,
    reversed: false,
}];

pub static MODULES: &[ServiceModule] = &[
    ServiceModule {
        name: "ftp",
        provides_user: true,
        validate: validate_ftp,
        user_data: None,
        ports: FTP_PORTS,
        init: Some(init_ftp),
    },
    ServiceModule {
        name: "ssh",
        provides_user: false,
        validate: validate_ssh,
        user_data: None,
        ports: SSH_PORTS,
        init: Some(init_ssh),
    },
    ServiceModule {
        name: "http",
        provides_user: false,
        validate: validate_http,
        user_data: None,
        ports: HTTP_PORTS,
        init: Some(init_http),
    },
    ServiceModule {
        name: "dns",
        provides_user: false,
        validate: validate_dns,
        user_data: None,
        ports: DNS_PORTS,
        init: None,
    },
    ServiceModule {
        name: "smb",
        provides_user: false,
        validate: validate_smb,
        user_data: None,
        ports: SMB_PORTS,
        init: None,
    },
];

fn init_ftp(api: &mut Registrar) -> Result<(), String> {
    api.register_pattern(validate_ftp, None, Transport::Tcp, b"220 ", Some(0), "ftp", true);
    api.register_pattern(validate_ftp, None, Transport::Tcp, b"220-", Some(0), "ftp", true);
    Ok(())
}

fn init_ssh(api: &mut Registrar) -> Result<(), String> {
    api.register_pattern(validate_ssh, None, Transport::Tcp, b"SSH-", Some(0), "ssh", false);
    Ok(())
}

fn init_http(api: &mut Registrar) -> Result<(), String> {
    api.register_pattern(validate_http, None, Transport::Tcp, b"HTTP/", None, "http", false);
    api.set_app_validator(validate_http, None, APP_HTTP, true, false)
}

fn wait_for_server(args: &mut ServiceArgs<'_, '_>) -> ServiceVerdict {
    args.api
        .in_process(args.flow, args.pkt, args.dir, args.detector);
    ServiceVerdict::InProcess
}

fn refuse(args: &mut ServiceArgs<'_, '_>) -> ServiceVerdict {
    args.api
        .fail_service(args.flow, args.pkt, args.dir, Some(args.detector), None);
    ServiceVerdict::Fail
}

fn validate_ftp(args: &mut ServiceArgs<'_, '_>) -> ServiceVerdict {
    let payload = args.pkt.payload;
    if args.dir == Direction::Initiator || payload.is_empty() {
        return wait_for_server(args);
    }
    if payload.len() < 4 {
        return wait_for_server(args);
    }
    if payload.starts_with(b"220 ") || payload.starts_with(b"220-") {
        let banner = banner_text(&payload[4..]);
        args.api.add_service(
            args.flow,
            args.pkt,
            args.dir,
            args.detector,
            APP_FTP,
            banner.as_deref(),
            None,
            &[],
        );
        return ServiceVerdict::Success;
    }
    refuse(args)
}

fn validate_ssh(args: &mut ServiceArgs<'_, '_>) -> ServiceVerdict {
    let payload = args.pkt.payload;
    if args.dir == Direction::Initiator || payload.is_empty() {
        return wait_for_server(args);
    }
    if payload.len() < 4 {
        return wait_for_server(args);
    }
    if let Some(rest) = payload.strip_prefix(b"SSH-") {
        let (version, software) = split_ssh_banner(rest);
        args.api.add_service(
            args.flow,
            args.pkt,
            args.dir,
            args.detector,
            APP_SSH,
            software.as_deref(),
            version.as_deref(),
            &[],
        );
        return ServiceVerdict::Success;
    }
    refuse(args)
}

fn validate_http(args: &mut ServiceArgs<'_, '_>) -> ServiceVerdict {
    let payload = args.pkt.payload;
    if args.dir == Direction::Initiator || payload.is_empty() {
        return wait_for_server(args);
    }
    if payload.len() < 5 {
        return wait_for_server(args);
    }
    if let Some(rest) = payload.strip_prefix(b"HTTP/") {
        let version = banner_text(rest).map(|v| {
            v.split_whitespace().next().unwrap_or_default().to_string()
        });
        args.api.add_service(
            args.flow,
            args.pkt,
            args.dir,
            args.detector,
            APP_HTTP,
            None,
            version.as_deref(),
            &[],
        );
        return ServiceVerdict::Success;
    }
    refuse(args)
}

fn validate_dns(args: &mut ServiceArgs<'_, '_>) -> ServiceVerdict {
    let payload = args.pkt.payload;
    if args.dir == Direction::Initiator || payload.is_empty() {
        return wait_for_server(args);
    }
    // Header only: a response bit and a sane opcode are enough here.
    if payload.len() >= 12 && payload[2] & 0x80 != 0 && (payload[2] >> 3) & 0x0f <= 5 {
        args.api.add_service(
            args.flow,
            args.pkt,
            args.dir,
            args.detector,
            APP_DNS,
            None,
            None,
            &[],
        );
        return ServiceVerdict::Success;
    }
    refuse(args)
}

fn validate_smb(args: &mut ServiceArgs<'_, '_>) -> ServiceVerdict {
    let payload = args.pkt.payload;
    if args.dir == Direction::Initiator || payload.is_empty() {
        return wait_for_server(args);
    }
    // NetBIOS session header, then the SMB protocol magic.
    if payload.len() < 8 {
        return wait_for_server(args);
    }
    let magic = &payload[4..8];
    let dialect = if magic == b"\xffSMB" {
        Some(1)
    } else if magic == b"\xfeSMB" {
        Some(2)
    } else {
        None
    };
    if let Some(major) = dialect {
        args.api.add_smb_info(args.flow, major, 0, 0);
        args.api.add_service(
            args.flow,
            args.pkt,
            args.dir,
            args.detector,
            APP_SMB,
            None,
            None,
            &[],
        );
        return ServiceVerdict::Success;
    }
    refuse(args)
}

/// First printable run of a banner line, if any.
fn banner_text(payload: &[u8]) -> Option<String> {
    let end = payload
        .iter()
        .position(|b| *b == b'\r' || *b == b'\n')
        .unwrap_or(payload.len());
    let line = std::str::from_utf8(&payload[..end]).ok()?.trim();
    if line.is_empty() {
        None
    } else {
        Some(line.to_string())
    }
}

/// "2.0-OpenSSH_8.9p1" -> (protocol version, software name).
fn split_ssh_banner(rest: &[u8]) -> (Option<String>, Option<String>) {
    let Some(line) = banner_text(rest) else {
        return (None, None);
    };
    match line.split_once('-') {
        Some((version, software)) => (
            Some(version.to_string()),
            software
                .split_whitespace()
                .next()
                .map(|s| s.to_string()),
        ),
        None => (Some(line), None),
    }
}
