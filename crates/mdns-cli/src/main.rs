//! Command-line front end for browsing and advertising DNS-SD services.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dns_types::protocol::types::TxtValue;
use mdns_net::{Family, UdpMulticastTransport, MDNS_IPV4_GROUP, MDNS_IPV6_GROUP, MDNS_PORT};
use mdns_sd::{Protocol, Service, ServiceRegistration};
use tokio_util::sync::CancellationToken;

/// Browse for, or advertise, DNS-SD services over multicast DNS.
#[derive(Parser)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    /// This host's own addresses, for recognising loopback copies of our
    /// own traffic; can be given more than once.
    #[clap(long, value_parser)]
    local_address: Vec<IpAddr>,

    /// Join the IPv6 multicast group instead of IPv4.
    #[clap(long, action(clap::ArgAction::SetTrue))]
    ipv6: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Watch for instances of a service type, printing each as it is
    /// discovered, updated, or withdrawn.
    Browse {
        /// Service type, e.g. "http" for _http._tcp.local.
        service_type: String,

        /// Transport protocol the service runs over.
        #[clap(long, default_value = "tcp", value_parser)]
        protocol: Protocol,

        /// Restrict to a subtype; can be given more than once.
        #[clap(long = "subtype", value_parser)]
        subtypes: Vec<String>,
    },

    /// Advertise a service instance until interrupted.
    Advertise {
        /// Instance name, e.g. "My Printer".
        instance: String,

        /// Service type, e.g. "http".
        service_type: String,

        /// Transport protocol the service runs over.
        #[clap(long, default_value = "tcp", value_parser)]
        protocol: Protocol,

        /// Port the service listens on.
        #[clap(long, value_parser)]
        port: u16,

        /// Address the service is reachable at.
        #[clap(long, value_parser)]
        address: IpAddr,

        /// Subtype this instance also advertises under; can be given more
        /// than once.
        #[clap(long = "subtype", value_parser)]
        subtypes: Vec<String>,

        /// TXT attribute as "key=value", "key" (present with no value), or
        /// "key="  (present with an empty value); can be given more than
        /// once.
        #[clap(long = "txt", value_parser)]
        txt: Vec<String>,
    },
}

fn parse_txt(raw: &str) -> (String, TxtValue) {
    match raw.split_once('=') {
        None => (raw.to_string(), TxtValue::Present),
        Some((key, "")) => (key.to_string(), TxtValue::Empty),
        Some((key, value)) => (key.to_string(), TxtValue::Bytes(value.as_bytes().to_vec())),
    }
}

fn family_of(ipv6: bool) -> Family {
    if ipv6 {
        Family::V6
    } else {
        Family::V4
    }
}

async fn bind_transport(family: Family, local_addresses: Vec<IpAddr>) -> std::io::Result<UdpMulticastTransport> {
    use socket2::{Domain, Socket, Type};

    let domain = match family {
        Family::V4 => Domain::IPV4,
        Family::V6 => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    let bind_addr: SocketAddr = match family {
        Family::V4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), MDNS_PORT),
        Family::V6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), MDNS_PORT),
    };
    socket.bind(&bind_addr.into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    let tokio_socket = tokio::net::UdpSocket::from_std(std_socket)?;
    match family {
        Family::V4 => tokio_socket.join_multicast_v4(MDNS_IPV4_GROUP, Ipv4Addr::UNSPECIFIED)?,
        Family::V6 => tokio_socket.join_multicast_v6(&MDNS_IPV6_GROUP, 0)?,
    }

    Ok(UdpMulticastTransport::new(tokio_socket, family, local_addresses))
}

fn begin_logging() {
    let format: std::collections::HashSet<String> = std::env::var("RUST_LOG_FORMAT")
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_ansi(!format.contains("no-ansi"));

    if format.contains("json") {
        let builder = builder.json();
        if format.contains("no-time") {
            builder.without_time().init();
        } else {
            builder.init();
        }
    } else if format.contains("pretty") {
        let builder = builder.pretty();
        if format.contains("no-time") {
            builder.without_time().init();
        } else {
            builder.init();
        }
    } else if format.contains("compact") {
        let builder = builder.compact();
        if format.contains("no-time") {
            builder.without_time().init();
        } else {
            builder.init();
        }
    } else if format.contains("no-time") {
        builder.without_time().init();
    } else {
        builder.init();
    }
}

fn print_service(service: &Service) {
    let subtypes = if service.subtypes.is_empty() {
        String::new()
    } else {
        format!(" subtypes={}", service.subtypes.join(","))
    };
    let txt = service
        .txt
        .iter()
        .map(|(k, v)| match v {
            TxtValue::Present => k.clone(),
            TxtValue::Empty => format!("{k}="),
            TxtValue::Bytes(bytes) => format!("{k}={}", String::from_utf8_lossy(bytes)),
        })
        .collect::<Vec<_>>()
        .join(" ");

    if service.is_active {
        println!(
            "+ {} {}:{}{} {}",
            service.instance, service.host, service.port, subtypes, txt
        );
    } else {
        println!("- {}", service.instance);
    }
}

async fn run_browse(
    service_type: String,
    protocol: Protocol,
    subtypes: Vec<String>,
    ipv6: bool,
    local_address: Vec<IpAddr>,
) -> process::ExitCode {
    let transport = match bind_transport(family_of(ipv6), local_address).await {
        Ok(transport) => Arc::new(transport),
        Err(error) => {
            tracing::error!(%error, "could not bind multicast socket");
            eprintln!("error: could not bind multicast socket: {error}");
            return process::ExitCode::FAILURE;
        }
    };

    tracing::info!(%service_type, ?protocol, "browsing");
    let cancel = CancellationToken::new();
    let mut events = mdns_sd::browse(service_type, protocol, subtypes, transport, cancel.clone());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                cancel.cancel();
                break;
            }
            event = events.recv() => {
                match event {
                    Some(service) => print_service(&service),
                    None => break,
                }
            }
        }
    }

    process::ExitCode::SUCCESS
}

async fn run_advertise(
    instance: String,
    service_type: String,
    protocol: Protocol,
    port: u16,
    address: IpAddr,
    subtypes: Vec<String>,
    txt: Vec<String>,
    ipv6: bool,
    local_address: Vec<IpAddr>,
) -> process::ExitCode {
    let transport = match bind_transport(family_of(ipv6), local_address).await {
        Ok(transport) => Arc::new(transport),
        Err(error) => {
            tracing::error!(%error, "could not bind multicast socket");
            eprintln!("error: could not bind multicast socket: {error}");
            return process::ExitCode::FAILURE;
        }
    };

    tracing::info!(%instance, %service_type, ?protocol, %port, "advertising");
    let registration = ServiceRegistration {
        instance,
        service_type,
        protocol,
        subtypes,
        host: address,
        port,
        txt: txt.iter().map(|raw| parse_txt(raw)).collect(),
    };

    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel_for_signal.cancel();
    });

    match mdns_sd::advertise(registration, transport, cancel).await {
        Ok(()) => process::ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "advertise failed");
            eprintln!("error: {error}");
            process::ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> process::ExitCode {
    begin_logging();
    let args = Args::parse();
    let local_address = args.local_address.clone();
    let ipv6 = args.ipv6;

    match args.command {
        Command::Browse {
            service_type,
            protocol,
            subtypes,
        } => run_browse(service_type, protocol, subtypes, ipv6, local_address).await,
        Command::Advertise {
            instance,
            service_type,
            protocol,
            port,
            address,
            subtypes,
            txt,
        } => run_advertise(instance, service_type, protocol, port, address, subtypes, txt, ipv6, local_address).await,
    }
}
