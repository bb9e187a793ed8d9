//! DNS-SD service advertisement (component F) and discovery (component G)
//! built on top of the responder and the continuous querier.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use dns_types::protocol::types::{
    DomainName, QueryType, Question, RecordClass, RecordType, RecordTypeWithData, ResourceRecord, TxtValue,
};
use mdns_net::Transport;
use mdns_query::{CacheEventKind, Query};
use mdns_responder::{respond, ResponderError};

/// How long a sliding window of `NameTaken` failures is tracked for before
/// giving up (RFC 6762 section 8.3's renaming policy, as narrowed by this
/// crate's spec).
const RENAME_WINDOW: Duration = Duration::from_secs(10);
/// Renaming failures allowed within `RENAME_WINDOW` before giving up.
const RENAME_LIMIT: usize = 15;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn label(self) -> &'static str {
        match self {
            Protocol::Tcp => "_tcp",
            Protocol::Udp => "_udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UnknownProtocol(String);

impl fmt::Display for UnknownProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown protocol {:?}, expected \"tcp\" or \"udp\"", self.0)
    }
}

impl std::error::Error for UnknownProtocol {}

impl std::str::FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(UnknownProtocol(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AdvertiseError {
    RenameExhausted,
    Conflict,
    Aborted,
}

impl fmt::Display for AdvertiseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdvertiseError::RenameExhausted => write!(f, "exhausted renaming attempts"),
            AdvertiseError::Conflict => write!(f, "a peer is authoritatively announcing our name"),
            AdvertiseError::Aborted => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for AdvertiseError {}

/// What a caller wants to advertise. `host` is the address the A/AAAA record
/// carries; the instance name itself serves as the owner name for SRV, TXT,
/// and the address record.
#[derive(Debug, Clone)]
pub struct ServiceRegistration {
    pub instance: String,
    pub service_type: String,
    pub protocol: Protocol,
    pub subtypes: Vec<String>,
    pub host: IpAddr,
    pub port: u16,
    pub txt: Vec<(String, TxtValue)>,
}

fn base_type_name(service_type: &str, protocol: Protocol) -> DomainName {
    let dotted = format!("_{}.{}.local.", service_type.trim_start_matches('_'), protocol.label());
    DomainName::from_dotted_string(&dotted).expect("service type and protocol form a valid domain name")
}

fn subtype_type_name(subtype: &str, base: &DomainName) -> DomainName {
    let label = DomainName::from_dotted_string(&format!("_{}._sub.", subtype.trim_start_matches('_')))
        .expect("subtype label is a valid domain name fragment");
    label.prepended_to(base).expect("subtype name within length limits")
}

fn instance_name(instance: &str, base: &DomainName) -> Option<DomainName> {
    let label = DomainName::from_dotted_string(&format!("{instance}."))?;
    label.prepended_to(base)
}

/// The PTR/SRV/TXT/address record ensemble for one registration attempt at
/// a given (possibly renamed) instance name.
fn compose_records(registration: &ServiceRegistration, instance: &DomainName, base: &DomainName) -> Vec<ResourceRecord> {
    let mut records = vec![
        ResourceRecord {
            name: base.clone(),
            rtype_with_data: RecordTypeWithData::PTR {
                ptrdname: instance.clone(),
            },
            rclass: RecordClass::Internet,
            ttl: 0,
            is_unique: false,
        },
        ResourceRecord {
            name: instance.clone(),
            rtype_with_data: RecordTypeWithData::SRV {
                priority: 0,
                weight: 0,
                port: registration.port,
                target: instance.clone(),
            },
            rclass: RecordClass::Internet,
            ttl: 0,
            is_unique: true,
        },
        ResourceRecord {
            name: instance.clone(),
            rtype_with_data: RecordTypeWithData::TXT {
                attributes: registration.txt.clone(),
            },
            rclass: RecordClass::Internet,
            ttl: 0,
            is_unique: true,
        },
        address_record(instance, registration.host),
    ];

    for subtype in &registration.subtypes {
        records.push(ResourceRecord {
            name: subtype_type_name(subtype, base),
            rtype_with_data: RecordTypeWithData::PTR {
                ptrdname: instance.clone(),
            },
            rclass: RecordClass::Internet,
            ttl: 0,
            is_unique: false,
        });
    }

    records
}

fn address_record(instance: &DomainName, host: IpAddr) -> ResourceRecord {
    let rtype_with_data = match host {
        IpAddr::V4(address) => RecordTypeWithData::A { address },
        IpAddr::V6(address) => RecordTypeWithData::AAAA { address },
    };
    ResourceRecord {
        name: instance.clone(),
        rtype_with_data,
        rclass: RecordClass::Internet,
        ttl: 0,
        is_unique: true,
    }
}

/// Advertise `registration` until `cancel` fires. Probing, announcing,
/// answering, and defending are the responder's job; this drives the
/// rename-on-`NameTaken` and wait-and-retry-on-`SimultaneousProbe` policy
/// around it.
pub async fn advertise<T: Transport>(
    registration: ServiceRegistration,
    transport: Arc<T>,
    cancel: CancellationToken,
) -> Result<(), AdvertiseError> {
    let base = base_type_name(&registration.service_type, registration.protocol);
    let mut suffix: u32 = 1;
    let mut recent_name_taken: Vec<Instant> = Vec::new();

    loop {
        let candidate = if suffix == 1 {
            registration.instance.clone()
        } else {
            format!("{} ({suffix})", registration.instance)
        };
        let instance = instance_name(&candidate, &base).ok_or(AdvertiseError::Aborted)?;
        let records = compose_records(&registration, &instance, &base);

        match respond(records, Arc::clone(&transport), cancel.clone()).await {
            Ok(()) => return Ok(()),
            Err(ResponderError::Aborted) => return Err(AdvertiseError::Aborted),
            Err(ResponderError::Conflict) => return Err(AdvertiseError::Conflict),
            Err(ResponderError::NameTaken) => {
                let now = Instant::now();
                recent_name_taken.push(now);
                recent_name_taken.retain(|&at| now.duration_since(at) < RENAME_WINDOW);
                if recent_name_taken.len() > RENAME_LIMIT {
                    return Err(AdvertiseError::RenameExhausted);
                }
                suffix += 1;
                tracing::debug!(instance = %candidate, "name taken, retrying as a new instance name");
            }
            Err(ResponderError::SimultaneousProbe) => {
                tracing::debug!(instance = %candidate, "lost a simultaneous probe tie-break, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    _ = cancel.cancelled() => return Err(AdvertiseError::Aborted),
                }
            }
        }
    }
}

/// A discovered service instance. Emitted once with `is_active: true` when
/// SRV, TXT, and an address are all known, and again with `is_active: false`
/// when the address is flushed or expires.
#[derive(Debug, Clone)]
pub struct Service {
    pub instance: DomainName,
    pub service_type: String,
    pub protocol: Protocol,
    pub subtypes: Vec<String>,
    pub host: IpAddr,
    pub port: u16,
    pub txt: Vec<(String, TxtValue)>,
    pub is_active: bool,
}

#[derive(Clone)]
struct ServiceKind {
    service_type: String,
    protocol: Protocol,
    subtypes: Vec<String>,
}

async fn fetch_one(query: &Query, name: &DomainName, rtype: RecordType) -> Option<ResourceRecord> {
    if let Some(rr) = query.answers(name, QueryType::Record(rtype)).await.into_iter().next() {
        return Some(rr);
    }
    query
        .additional(name)
        .await
        .into_iter()
        .find(|rr| rr.rtype() == rtype)
}

fn host_of(record: &ResourceRecord) -> Option<IpAddr> {
    match &record.rtype_with_data {
        RecordTypeWithData::A { address } => Some(IpAddr::V4(*address)),
        RecordTypeWithData::AAAA { address } => Some(IpAddr::V6(*address)),
        _ => None,
    }
}

fn srv_port(record: &ResourceRecord) -> Option<u16> {
    match &record.rtype_with_data {
        RecordTypeWithData::SRV { port, .. } => Some(*port),
        _ => None,
    }
}

fn txt_attributes(record: &ResourceRecord) -> Vec<(String, TxtValue)> {
    match &record.rtype_with_data {
        RecordTypeWithData::TXT { attributes } => attributes.clone(),
        _ => Vec::new(),
    }
}

/// Resolves one discovered instance: pulls SRV/TXT/address from the PTR
/// response's additional section where possible, falling back to a
/// dedicated sub-query for whatever is missing, then emits active/inactive
/// `Service` events as the address record comes and goes.
async fn resolve_instance<T: Transport>(
    instance: DomainName,
    kind: ServiceKind,
    main: Query,
    transport: Arc<T>,
    events_tx: mpsc::UnboundedSender<Service>,
    mut stop_rx: mpsc::UnboundedReceiver<()>,
) {
    let sub_questions = vec![RecordType::SRV, RecordType::TXT, RecordType::A, RecordType::AAAA]
        .into_iter()
        .map(|rtype| Question {
            name: instance.clone(),
            qtype: QueryType::Record(rtype),
            qclass: RecordClass::Internet,
        })
        .collect();
    let (sub, mut sub_events) = Query::start(sub_questions, transport);

    let mut srv = fetch_one(&main, &instance, RecordType::SRV).await;
    let mut txt = fetch_one(&main, &instance, RecordType::TXT).await;
    let mut addr = match fetch_one(&main, &instance, RecordType::A).await {
        Some(rr) => Some(rr),
        None => fetch_one(&main, &instance, RecordType::AAAA).await,
    };
    let mut is_active = false;

    try_emit(&instance, &kind, &srv, &txt, &addr, &events_tx, &mut is_active);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                sub.end();
                return;
            }
            event = sub_events.recv() => {
                let Some(event) = event else {
                    sub.end();
                    return;
                };
                match event.kind {
                    CacheEventKind::Added => {
                        match event.record.rtype() {
                            RecordType::SRV => srv = Some(event.record),
                            RecordType::TXT => txt = Some(event.record),
                            RecordType::A | RecordType::AAAA => addr = Some(event.record),
                            _ => {}
                        }
                        try_emit(&instance, &kind, &srv, &txt, &addr, &events_tx, &mut is_active);
                    }
                    CacheEventKind::Flushed | CacheEventKind::Expired => {
                        if matches!(event.record.rtype(), RecordType::A | RecordType::AAAA) {
                            if is_active {
                                emit_inactive(&instance, &kind, &srv, &txt, &addr, &events_tx);
                                is_active = false;
                            }
                            addr = None;
                        }
                    }
                }
            }
        }
    }
}

fn try_emit(
    instance: &DomainName,
    kind: &ServiceKind,
    srv: &Option<ResourceRecord>,
    txt: &Option<ResourceRecord>,
    addr: &Option<ResourceRecord>,
    events_tx: &mpsc::UnboundedSender<Service>,
    is_active: &mut bool,
) {
    if *is_active {
        return;
    }
    let (Some(srv_rr), Some(txt_rr), Some(addr_rr)) = (srv, txt, addr) else {
        return;
    };
    let Some(host) = host_of(addr_rr) else { return };
    let Some(port) = srv_port(srv_rr) else { return };
    let _ = events_tx.send(Service {
        instance: instance.clone(),
        service_type: kind.service_type.clone(),
        protocol: kind.protocol,
        subtypes: kind.subtypes.clone(),
        host,
        port,
        txt: txt_attributes(txt_rr),
        is_active: true,
    });
    *is_active = true;
}

fn emit_inactive(
    instance: &DomainName,
    kind: &ServiceKind,
    srv: &Option<ResourceRecord>,
    txt: &Option<ResourceRecord>,
    addr: &Option<ResourceRecord>,
    events_tx: &mpsc::UnboundedSender<Service>,
) {
    let host = addr.as_ref().and_then(host_of).unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));
    let port = srv.as_ref().and_then(srv_port).unwrap_or(0);
    let txt = txt.as_ref().map(txt_attributes).unwrap_or_default();
    let _ = events_tx.send(Service {
        instance: instance.clone(),
        service_type: kind.service_type.clone(),
        protocol: kind.protocol,
        subtypes: kind.subtypes.clone(),
        host,
        port,
        txt,
        is_active: false,
    });
}

/// Browse for instances of `service_type`/`protocol`, starting a resolver
/// for each as its PTR record appears and tearing it down when the PTR
/// record expires.
pub fn browse<T: Transport>(
    service_type: String,
    protocol: Protocol,
    subtypes: Vec<String>,
    transport: Arc<T>,
    cancel: CancellationToken,
) -> mpsc::UnboundedReceiver<Service> {
    let base = base_type_name(&service_type, protocol);
    let question = Question {
        name: base,
        qtype: QueryType::Record(RecordType::PTR),
        qclass: RecordClass::Internet,
    };
    let (main, mut main_events) = Query::start(vec![question], Arc::clone(&transport));
    let kind = ServiceKind {
        service_type,
        protocol,
        subtypes,
    };

    let (out_tx, out_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut resolvers: HashMap<DomainName, mpsc::UnboundedSender<()>> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    main.end();
                    for stop_tx in resolvers.into_values() {
                        let _ = stop_tx.send(());
                    }
                    return;
                }
                event = main_events.recv() => {
                    let Some(event) = event else {
                        return;
                    };
                    let RecordTypeWithData::PTR { ptrdname } = &event.record.rtype_with_data else {
                        continue;
                    };
                    let instance = ptrdname.clone();

                    match event.kind {
                        CacheEventKind::Added => {
                            if resolvers.contains_key(&instance) {
                                continue;
                            }
                            let (stop_tx, stop_rx) = mpsc::unbounded_channel();
                            resolvers.insert(instance.clone(), stop_tx);
                            tokio::spawn(resolve_instance(
                                instance,
                                kind.clone(),
                                main.clone(),
                                Arc::clone(&transport),
                                out_tx.clone(),
                                stop_rx,
                            ));
                        }
                        CacheEventKind::Expired => {
                            if let Some(stop_tx) = resolvers.remove(&instance) {
                                let _ = stop_tx.send(());
                            }
                        }
                        CacheEventKind::Flushed => {}
                    }
                }
            }
        }
    });

    out_rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composes_instance_and_subtype_names() {
        let base = base_type_name("http", Protocol::Tcp);
        assert_eq!(base.to_dotted_string(), "_http._tcp.local.");

        let instance = instance_name("my printer", &base).unwrap();
        assert_eq!(instance.to_dotted_string(), "my printer._http._tcp.local.");

        let sub = subtype_type_name("printer", &base);
        assert_eq!(sub.to_dotted_string(), "_printer._sub._http._tcp.local.");
    }

    #[test]
    fn compose_records_includes_ptr_srv_txt_and_address() {
        let registration = ServiceRegistration {
            instance: "box".to_string(),
            service_type: "http".to_string(),
            protocol: Protocol::Tcp,
            subtypes: vec!["printer".to_string()],
            host: IpAddr::V4(std::net::Ipv4Addr::new(192, 168, 1, 5)),
            port: 8080,
            txt: vec![("path".to_string(), TxtValue::Bytes(b"/index".to_vec()))],
        };
        let base = base_type_name(&registration.service_type, registration.protocol);
        let instance = instance_name(&registration.instance, &base).unwrap();
        let records = compose_records(&registration, &instance, &base);

        assert_eq!(records.len(), 5);
        assert!(records.iter().any(|r| r.rtype() == RecordType::PTR && r.name == base));
        assert!(records.iter().any(|r| r.rtype() == RecordType::SRV && r.name == instance));
        assert!(records.iter().any(|r| r.rtype() == RecordType::TXT && r.name == instance));
        assert!(records.iter().any(|r| r.rtype() == RecordType::A && r.name == instance));
        assert!(records
            .iter()
            .any(|r| r.rtype() == RecordType::PTR && r.name.to_dotted_string() == "_printer._sub._http._tcp.local."));
    }
}
