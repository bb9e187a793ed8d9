//! The responder (component E): probe for proposed records, announce them,
//! answer queries for them, and defend them against conflicting peers.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use dns_types::protocol::types::{
    DomainName, Header, Message, Opcode, QueryType, Question, Rcode, RecordClass, RecordType,
    RecordTypeWithData, ResourceRecord,
};
use mdns_net::Transport;

/// TTL (seconds) for A/AAAA/SRV/PTR records on outbound answers.
const SHORT_TTL: u32 = 120;
/// TTL (seconds) for everything else (TXT, NSEC), 75 minutes.
const LONG_TTL: u32 = 4500;

/// The three probes of RFC 6762 section 8.1 are spaced this far apart.
const PROBE_INTERVAL: Duration = Duration::from_millis(250);
/// How long a record sent out stays in `recently_sent` before it can be
/// queued or dispatched again.
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ResponderError {
    NameTaken,
    SimultaneousProbe,
    Conflict,
    Aborted,
}

impl fmt::Display for ResponderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponderError::NameTaken => write!(f, "name is already in use on the network"),
            ResponderError::SimultaneousProbe => write!(f, "lost a simultaneous-probe tie-break"),
            ResponderError::Conflict => write!(f, "a peer is authoritatively announcing our record"),
            ResponderError::Aborted => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for ResponderError {}

fn normalized_ttl(rtype: RecordType) -> u32 {
    match rtype {
        RecordType::A | RecordType::AAAA | RecordType::SRV | RecordType::PTR => SHORT_TTL,
        _ => LONG_TTL,
    }
}

fn is_unique_type(rtype: RecordType) -> bool {
    rtype != RecordType::PTR
}

/// Normalise a caller-proposed record: is_unique follows from its type, TTL
/// is set per the outbound normalisation rule rather than whatever the
/// caller filled in.
fn normalize(record: &ResourceRecord) -> ResourceRecord {
    let rtype = record.rtype();
    ResourceRecord {
        name: record.name.clone(),
        rtype_with_data: record.rtype_with_data.clone(),
        rclass: record.rclass,
        ttl: normalized_ttl(rtype),
        is_unique: is_unique_type(rtype),
    }
}

/// RFC 6762 section 8.2 record order: class, then type, then RDATA as an
/// uncompressed octet sequence, shorter-is-less on prefix equality.
fn record_order(a: &ResourceRecord, b: &ResourceRecord) -> Ordering {
    u16::from(a.rclass)
        .cmp(&u16::from(b.rclass))
        .then_with(|| u16::from(a.rtype()).cmp(&u16::from(b.rtype())))
        .then_with(|| a.canonical_rdata().cmp(&b.canonical_rdata()))
}

/// Tie-break comparison between our conflicting records and theirs: sorted
/// pairwise, first difference decides; if one is a prefix of the other, the
/// longer one wins.
fn tie_break(ours: &[ResourceRecord], theirs: &[ResourceRecord]) -> Ordering {
    let mut ours_sorted = ours.to_vec();
    let mut theirs_sorted = theirs.to_vec();
    ours_sorted.sort_by(record_order);
    theirs_sorted.sort_by(record_order);
    for (a, b) in ours_sorted.iter().zip(theirs_sorted.iter()) {
        let ord = record_order(a, b);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    ours_sorted.len().cmp(&theirs_sorted.len())
}

/// The subset of `records` and `authority` that conflict: same name, same
/// type, both unique.
fn conflicting_subset(
    records: &[ResourceRecord],
    authority: &[ResourceRecord],
) -> (Vec<ResourceRecord>, Vec<ResourceRecord>) {
    let mut ours = Vec::new();
    let mut theirs = Vec::new();
    for their in authority {
        if !their.is_unique {
            continue;
        }
        for our in records {
            if our.is_unique && our.name.matches(&their.name) && our.rtype() == their.rtype() {
                ours.push(our.clone());
                theirs.push(their.clone());
            }
        }
    }
    (ours, theirs)
}

fn new_message(id: u16, is_response: bool) -> Message {
    Message {
        header: Header {
            id,
            is_response,
            opcode: Opcode::Standard,
            is_authoritative: is_response,
            is_truncated: false,
            recursion_desired: false,
            recursion_available: false,
            z: false,
            authentic_data: false,
            checking_disabled: false,
            rcode: Rcode::NoError,
        },
        questions: Vec::new(),
        answers: Vec::new(),
        authority: Vec::new(),
        additional: Vec::new(),
    }
}

fn build_outbound(answers: Vec<ResourceRecord>, additional: Vec<ResourceRecord>) -> Message {
    let mut msg = new_message(rand::thread_rng().gen(), true);
    msg.answers = answers;
    msg.additional = additional;
    msg
}

/// Other proposed records not already present in `answers`, for the
/// additional section (the usual PTR/SRV/TXT/A glue pattern).
fn additional_for(records: &[ResourceRecord], answers: &[ResourceRecord]) -> Vec<ResourceRecord> {
    records
        .iter()
        .filter(|r| !answers.iter().any(|a| a.name.matches(&r.name) && a.rtype() == r.rtype()))
        .cloned()
        .collect()
}

async fn dispatch<T: Transport>(transport: &Arc<T>, message: Message) {
    let bytes = match message.into_octets() {
        Ok(b) => b,
        Err(err) => {
            tracing::warn!(?err, "failed to encode outbound message");
            return;
        }
    };
    if let Err(err) = transport.send(&bytes).await {
        tracing::warn!(?err, "failed to send outbound message");
    }
}

async fn sleep_until_or_pending(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

fn sent_key(r: &ResourceRecord) -> (DomainName, RecordType, Vec<u8>) {
    (r.name.clone(), r.rtype(), r.canonical_rdata())
}

fn purge_recently_sent(map: &mut HashMap<(DomainName, RecordType, Vec<u8>), Instant>, now: Instant) {
    map.retain(|_, sent_at| now.duration_since(*sent_at) < RATE_LIMIT_WINDOW);
}

fn mark_sent(map: &mut HashMap<(DomainName, RecordType, Vec<u8>), Instant>, records: &[ResourceRecord], now: Instant) {
    for r in records {
        map.insert(sent_key(r), now);
    }
}

fn filter_recently_sent(
    answers: Vec<ResourceRecord>,
    recently_sent: &HashMap<(DomainName, RecordType, Vec<u8>), Instant>,
    now: Instant,
) -> Vec<ResourceRecord> {
    answers
        .into_iter()
        .filter(|r| match recently_sent.get(&sent_key(r)) {
            Some(sent_at) => now.duration_since(*sent_at) >= RATE_LIMIT_WINDOW,
            None => true,
        })
        .collect()
}

/// Types an inbound query can be authoritatively refused for with NSEC.
/// A/AAAA are excluded: a responder only ever speaks for one address
/// family's records and can't prove the other family's absence.
fn should_refute_absence(missing_rtype: RecordType) -> bool {
    !matches!(missing_rtype, RecordType::A | RecordType::AAAA)
}

fn synthesize_nsec(records: &[ResourceRecord], name: &DomainName) -> Option<ResourceRecord> {
    let mut types: Vec<RecordType> = records
        .iter()
        .filter(|r| r.name.matches(name))
        .map(|r| r.rtype())
        .collect();
    if types.is_empty() {
        return None;
    }
    types.sort_by_key(|t| u16::from(*t));
    types.dedup();
    Some(ResourceRecord {
        name: name.clone(),
        rtype_with_data: RecordTypeWithData::NSEC {
            next_domain: name.clone(),
            types,
        },
        rclass: RecordClass::Internet,
        ttl: LONG_TTL,
        is_unique: true,
    })
}

/// Candidate answers for one question: matching records, minus anything the
/// query's own answer section already lists with at least half our TTL.
fn answer_question(records: &[ResourceRecord], question: &Question, known_answers: &[ResourceRecord]) -> Vec<ResourceRecord> {
    records
        .iter()
        .filter(|r| r.name.matches(&question.name) && question.qtype.matches(r.rtype()))
        .cloned()
        .filter(|candidate| {
            !known_answers.iter().any(|ka| {
                ka.name.matches(&candidate.name)
                    && ka.rtype() == candidate.rtype()
                    && ka.canonical_rdata() == candidate.canonical_rdata()
                    && ka.ttl * 2 >= candidate.ttl
            })
        })
        .collect()
}

/// The full answer set for a query message, and whether every question in
/// it got at least one answer (real or synthesised NSEC).
fn compute_answers_for_message(records: &[ResourceRecord], message: &Message) -> (Vec<ResourceRecord>, bool) {
    let mut answers = Vec::new();
    let mut all_answered = true;

    for question in &message.questions {
        let mut qa = answer_question(records, question, &message.answers);
        if qa.is_empty() {
            let synthesised = match question.qtype {
                QueryType::Record(missing_rtype) if should_refute_absence(missing_rtype) => {
                    synthesize_nsec(records, &question.name)
                }
                _ => None,
            };
            match synthesised {
                Some(nsec) => qa.push(nsec),
                None => all_answered = false,
            }
        }
        answers.append(&mut qa);
    }

    (answers, all_answered)
}

/// Checks an inbound message seen while probing. Returns an error the moment
/// our name is taken or we lose a tie-break.
fn check_probe_message(records: &[ResourceRecord], message: &Message) -> Result<(), ResponderError> {
    if message.header.is_response {
        for answer in &message.answers {
            if !answer.is_unique {
                continue;
            }
            if records
                .iter()
                .any(|r| r.is_unique && r.name.matches(&answer.name) && r.rtype() == answer.rtype())
            {
                return Err(ResponderError::NameTaken);
            }
        }
    } else if !message.authority.is_empty() {
        let (ours, theirs) = conflicting_subset(records, &message.authority);
        if !ours.is_empty() && tie_break(&ours, &theirs) == Ordering::Less {
            return Err(ResponderError::SimultaneousProbe);
        }
    }
    Ok(())
}

async fn send_probe<T: Transport>(transport: &Arc<T>, unique_names: &[DomainName], records: &[ResourceRecord]) {
    let questions = unique_names
        .iter()
        .map(|name| Question {
            name: name.clone(),
            qtype: QueryType::Any,
            qclass: RecordClass::Internet,
        })
        .collect();
    let mut msg = new_message(rand::thread_rng().gen(), false);
    msg.questions = questions;
    msg.authority = records.to_vec();
    dispatch(transport, msg).await;
}

async fn probe<T: Transport>(
    records: &[ResourceRecord],
    unique_names: &[DomainName],
    transport: &Arc<T>,
    cancel: &CancellationToken,
) -> Result<(), ResponderError> {
    let initial_delay = Duration::from_millis(rand::thread_rng().gen_range(0..=250));
    tokio::select! {
        _ = tokio::time::sleep(initial_delay) => {}
        _ = cancel.cancelled() => return Err(ResponderError::Aborted),
    }

    for _ in 0..3 {
        send_probe(transport, unique_names, records).await;
        let deadline = Instant::now() + PROBE_INTERVAL;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ResponderError::Aborted),
                _ = tokio::time::sleep_until(deadline) => break,
                received = transport.receive() => {
                    if let Ok((bytes, from)) = received {
                        if transport.is_own_address(&from.ip()) {
                            continue;
                        }
                        if let Ok(message) = Message::from_octets(&bytes) {
                            check_probe_message(records, &message)?;
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

async fn announce<T: Transport>(transport: &Arc<T>, records: &[ResourceRecord]) {
    let msg = build_outbound(records.to_vec(), Vec::new());
    dispatch(transport, msg.clone()).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    dispatch(transport, msg).await;
}

async fn send_goodbye<T: Transport>(transport: &Arc<T>, records: &[ResourceRecord]) {
    let mut goodbye = records.to_vec();
    for r in &mut goodbye {
        r.ttl = 0;
    }
    dispatch(transport, build_outbound(goodbye, Vec::new())).await;
}

/// Re-announce any of our records a peer is trying to let expire
/// prematurely (same name/type/RDATA, TTL = 0), and detect conflicts: a
/// peer authoritatively holding a different RDATA for one of our unique
/// records.
fn check_response_in_responding_phase(
    records: &[ResourceRecord],
    message: &Message,
) -> Result<Vec<ResourceRecord>, ResponderError> {
    let mut reannounce = Vec::new();
    for answer in &message.answers {
        for ours in records {
            if !(ours.name.matches(&answer.name) && ours.rtype() == answer.rtype()) {
                continue;
            }
            let same_rdata = ours.canonical_rdata() == answer.canonical_rdata();
            if same_rdata && answer.ttl == 0 {
                reannounce.push(ours.clone());
            } else if !same_rdata && ours.is_unique && answer.is_unique {
                return Err(ResponderError::Conflict);
            }
        }
    }
    Ok(reannounce)
}

async fn respond_loop<T: Transport>(
    records: &[ResourceRecord],
    transport: &Arc<T>,
    cancel: &CancellationToken,
    mut recently_sent: HashMap<(DomainName, RecordType, Vec<u8>), Instant>,
) -> Result<(), ResponderError> {
    let mut queued: Vec<ResourceRecord> = Vec::new();
    let mut aggregation_due: Option<Instant> = None;

    loop {
        purge_recently_sent(&mut recently_sent, Instant::now());

        tokio::select! {
            _ = cancel.cancelled() => {
                send_goodbye(transport, records).await;
                return Err(ResponderError::Aborted);
            }

            received = transport.receive() => {
                let (bytes, from) = match received {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if transport.is_own_address(&from.ip()) {
                    continue;
                }
                let message = match Message::from_octets(&bytes) {
                    Ok(m) => m,
                    Err(err) => {
                        tracing::warn!(?err, "dropping malformed inbound datagram");
                        continue;
                    }
                };

                if message.header.is_response {
                    let reannounce = check_response_in_responding_phase(records, &message)?;
                    if !reannounce.is_empty() {
                        let now = Instant::now();
                        let additional = additional_for(records, &reannounce);
                        dispatch(transport, build_outbound(reannounce.clone(), additional)).await;
                        mark_sent(&mut recently_sent, &reannounce, now);
                    }
                } else {
                    let now = Instant::now();
                    let (answers, all_answered) = compute_answers_for_message(records, &message);
                    let answers = filter_recently_sent(answers, &recently_sent, now);
                    if answers.is_empty() {
                        continue;
                    }

                    let is_probe = !message.authority.is_empty();
                    let defended = is_probe
                        && answers.iter().any(|a| {
                            message.authority.iter().any(|auth| auth.name.matches(&a.name) && auth.rtype() == a.rtype())
                        });
                    let all_unique = answers.iter().all(|a| a.is_unique);

                    if defended || (all_answered && all_unique) {
                        let additional = additional_for(records, &answers);
                        dispatch(transport, build_outbound(answers.clone(), additional)).await;
                        mark_sent(&mut recently_sent, &answers, now);
                    } else {
                        for a in answers {
                            if !queued.iter().any(|q: &ResourceRecord| {
                                q.name.matches(&a.name) && q.rtype() == a.rtype() && q.canonical_rdata() == a.canonical_rdata()
                            }) {
                                queued.push(a);
                            }
                        }
                        if aggregation_due.is_none() {
                            let delay = Duration::from_millis(rand::thread_rng().gen_range(20..=120));
                            aggregation_due = Some(now + delay);
                        }
                    }
                }
            }

            _ = sleep_until_or_pending(aggregation_due) => {
                let now = Instant::now();
                let additional = additional_for(records, &queued);
                dispatch(transport, build_outbound(queued.clone(), additional)).await;
                mark_sent(&mut recently_sent, &queued, now);
                queued.clear();
                aggregation_due = None;
            }
        }
    }
}

/// Probe, announce, and then answer and defend `proposed_records` until
/// `cancel` fires, at which point a goodbye is sent and `Aborted` returned.
/// Any other error means the task gave up the name outright.
pub async fn respond<T: Transport>(
    proposed_records: Vec<ResourceRecord>,
    transport: Arc<T>,
    cancel: CancellationToken,
) -> Result<(), ResponderError> {
    let records: Vec<ResourceRecord> = proposed_records.iter().map(normalize).collect();
    let mut unique_names: Vec<DomainName> = Vec::new();
    for r in &records {
        if r.is_unique && !unique_names.iter().any(|n| n.matches(&r.name)) {
            unique_names.push(r.name.clone());
        }
    }

    probe(&records, &unique_names, &transport, &cancel).await?;
    announce(&transport, &records).await;

    let mut recently_sent = HashMap::new();
    mark_sent(&mut recently_sent, &records, Instant::now());

    respond_loop(&records, &transport, &cancel, recently_sent).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_types::protocol::types::test_util::{a_record, domain};
    use std::net::Ipv4Addr;

    #[test]
    fn tie_break_prefers_larger_rdata() {
        let ours = vec![a_record("x.local.", Ipv4Addr::new(1, 1, 1, 1))];
        let theirs = vec![a_record("x.local.", Ipv4Addr::new(2, 2, 2, 2))];
        assert_eq!(tie_break(&ours, &theirs), Ordering::Less);
        assert_eq!(tie_break(&theirs, &ours), Ordering::Greater);
    }

    #[test]
    fn tie_break_equal_sets_are_not_a_conflict() {
        let a = vec![a_record("x.local.", Ipv4Addr::new(1, 1, 1, 1))];
        let b = vec![a_record("x.local.", Ipv4Addr::new(1, 1, 1, 1))];
        assert_eq!(tie_break(&a, &b), Ordering::Equal);
    }

    #[test]
    fn tie_break_prefix_shorter_loses() {
        let short = vec![a_record("x.local.", Ipv4Addr::new(1, 1, 1, 1))];
        let mut long = short.clone();
        long.push(a_record("y.local.", Ipv4Addr::new(1, 1, 1, 1)));
        assert_eq!(tie_break(&short, &long), Ordering::Less);
    }

    #[test]
    fn nsec_not_synthesised_for_address_types() {
        let records = vec![a_record("x.local.", Ipv4Addr::new(1, 1, 1, 1))];
        assert!(!should_refute_absence(RecordType::A));
        assert!(!should_refute_absence(RecordType::AAAA));
        assert!(should_refute_absence(RecordType::SRV));
        assert!(synthesize_nsec(&records, &domain("x.local.")).is_some());
    }

    #[test]
    fn normalize_sets_ttl_and_uniqueness_by_type() {
        let a = a_record("x.local.", Ipv4Addr::new(1, 1, 1, 1));
        let normalized = normalize(&a);
        assert_eq!(normalized.ttl, SHORT_TTL);
        assert!(normalized.is_unique);
    }
}
