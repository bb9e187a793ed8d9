//! The continuous mDNS querier (component D): multicast a question list,
//! cache answers with TTL-driven expiry and proactive re-query, suppress
//! duplicated questions and known answers, and emit cache events.

pub mod cache;

use std::cmp::Ordering;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use dns_types::protocol::types::{DomainName, Message, QueryType, Question, RecordClass, RecordType, ResourceRecord};
use mdns_net::Transport;

pub use cache::{Cache, CacheEvent, CacheEventKind};

type QuestionKey = (DomainName, QueryType);

/// A pending timer: fires at `at`, carries `payload` to identify what to do.
/// Ordering is by `at` only, so unrelated payload types don't need `Ord`.
struct Timer<T> {
    at: Instant,
    payload: T,
}

impl<T> PartialEq for Timer<T> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}
impl<T> Eq for Timer<T> {}
impl<T> PartialOrd for Timer<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for Timer<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at.cmp(&other.at)
    }
}

/// A snapshot of the querier's internal state, for the CLI harness to print -
/// built fresh on request, mirroring the teacher's plain `Metrics` struct
/// rather than threading counters through global state.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Stats {
    pub cache_size: usize,
    pub outstanding_requeries: usize,
}

struct Shared {
    cache: Cache,
    additional: HashMap<DomainName, Vec<ResourceRecord>>,
}

/// A handle to a running querier. Dropping this does not stop the
/// background task; call `end()` for that.
#[derive(Clone)]
pub struct Query {
    shared: Arc<Mutex<Shared>>,
    requery_count: Arc<AtomicUsize>,
    end_tx: mpsc::UnboundedSender<()>,
}

impl Query {
    /// Start a querier for `questions` over `transport`. Returns the handle
    /// and the cache event stream; the stream closes once `end()` is called.
    ///
    /// Generic rather than `Arc<dyn Transport>`: `Transport`'s async methods
    /// make it dispatch this way only through monomorphisation, not a vtable.
    pub fn start<T: Transport>(
        questions: Vec<Question>,
        transport: Arc<T>,
    ) -> (Self, mpsc::UnboundedReceiver<CacheEvent>) {
        let shared = Arc::new(Mutex::new(Shared {
            cache: Cache::new(),
            additional: HashMap::new(),
        }));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (end_tx, end_rx) = mpsc::unbounded_channel();
        let requery_count = Arc::new(AtomicUsize::new(0));

        let task_shared = shared.clone();
        let task_requery_count = requery_count.clone();
        tokio::spawn(run(
            questions,
            transport,
            task_shared,
            task_requery_count,
            events_tx,
            end_rx,
        ));

        (
            Self {
                shared,
                requery_count,
                end_tx,
            },
            events_rx,
        )
    }

    /// Cached records matching `name` and `qtype`.
    pub async fn answers(&self, name: &DomainName, qtype: QueryType) -> Vec<ResourceRecord> {
        self.shared.lock().await.cache.get(name, qtype)
    }

    /// Records seen in the additional section of a response naming `name`.
    pub async fn additional(&self, name: &DomainName) -> Vec<ResourceRecord> {
        self.shared
            .lock()
            .await
            .additional
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn stats(&self) -> Stats {
        let sh = self.shared.lock().await;
        Stats {
            cache_size: sh.cache.len(),
            outstanding_requeries: self.requery_count.load(AtomicOrdering::Relaxed),
        }
    }

    /// Cancel all timers and close the event stream. No further cache
    /// events are emitted after this.
    pub fn end(&self) {
        let _ = self.end_tx.send(());
    }
}

fn remember_additional(store: &mut HashMap<DomainName, Vec<ResourceRecord>>, records: &[ResourceRecord]) {
    for record in records {
        let bucket = store.entry(record.name.clone()).or_default();
        bucket.retain(|existing| existing.rtype() != record.rtype());
        bucket.push(record.clone());
    }
}

/// Schedule the 80/85/90/95%-of-TTL re-query ladder for a freshly added
/// record (RFC 6762 section 5.2's proactive cache refresh).
fn schedule_requery_ladder(heap: &mut BinaryHeap<Reverse<Timer<QuestionKey>>>, record: &ResourceRecord, now: Instant) {
    let key = (record.name.clone(), QueryType::Record(record.rtype()));
    let mut rng = rand::thread_rng();
    for percent in [80u32, 85, 90, 95] {
        let jitter_percent = rng.gen_range(0..=2);
        let at_percent = (percent + jitter_percent).min(100);
        let millis = u64::from(record.ttl) * 1000 * u64::from(at_percent) / 100;
        heap.push(Reverse(Timer {
            at: now + Duration::from_millis(millis),
            payload: key.clone(),
        }));
    }
}

async fn run<T: Transport>(
    questions: Vec<Question>,
    transport: Arc<T>,
    shared: Arc<Mutex<Shared>>,
    requery_count: Arc<AtomicUsize>,
    events_tx: mpsc::UnboundedSender<CacheEvent>,
    mut end_rx: mpsc::UnboundedReceiver<()>,
) {
    let mut suppressed: HashSet<QuestionKey> = HashSet::new();
    let mut requery_heap: BinaryHeap<Reverse<Timer<QuestionKey>>> = BinaryHeap::new();

    let first_delay_ms = rand::thread_rng().gen_range(20..=120);
    let mut next_base_query = Instant::now() + Duration::from_millis(first_delay_ms);
    let mut base_interval = Duration::from_secs(1);
    let mut base_fired = false;

    loop {
        let next_cache_expiry = {
            let sh = shared.lock().await;
            sh.cache.next_expiry().map(Instant::from_std)
        };
        let next_requery = requery_heap.peek().map(|Reverse(t)| t.at);

        tokio::select! {
            _ = end_rx.recv() => {
                return;
            }

            received = transport.receive() => {
                if let Ok((bytes, from)) = received {
                    if !transport.is_own_address(&from.ip()) {
                        handle_inbound(&bytes, &questions, &shared, &events_tx, &mut suppressed, &mut requery_heap).await;
                        requery_count.store(requery_heap.len(), AtomicOrdering::Relaxed);
                    }
                }
            }

            _ = tokio::time::sleep_until(next_base_query) => {
                send_scheduled_query(&transport, &questions, &shared, &mut suppressed).await;
                if !base_fired {
                    base_fired = true;
                    next_base_query = Instant::now() + base_interval;
                } else {
                    base_interval = (base_interval * 2).min(Duration::from_secs(3600));
                    next_base_query = Instant::now() + base_interval;
                }
            }

            _ = sleep_until_or_pending(next_requery) => {
                if let Some(Reverse(timer)) = requery_heap.pop() {
                    requery_count.store(requery_heap.len(), AtomicOrdering::Relaxed);
                    send_requery(&transport, &timer.payload, &shared, &suppressed).await;
                }
            }

            _ = sleep_until_or_pending(next_cache_expiry) => {
                let now = std::time::Instant::now();
                let mut sh = shared.lock().await;
                let expired = sh.cache.remove_expired(now);
                drop(sh);
                for event in expired {
                    let requery_key = (event.record.name.clone(), QueryType::Record(event.record.rtype()));
                    tracing::debug!(name = %event.record.name, rtype = %event.record.rtype(), "cache record expired");
                    requery_heap.push(Reverse(Timer { at: Instant::now(), payload: requery_key }));
                    requery_count.store(requery_heap.len(), AtomicOrdering::Relaxed);
                    let _ = events_tx.send(event);
                }
            }
        }
    }
}

async fn sleep_until_or_pending(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

/// Rule 1+2+3 of "question filtering before each send" (spec.md section
/// 4.D): drop suppressed questions (clearing the flag), drop non-PTR
/// questions the cache already answers, skip entirely if nothing remains.
async fn send_scheduled_query<T: Transport>(
    transport: &Arc<T>,
    questions: &[Question],
    shared: &Arc<Mutex<Shared>>,
    suppressed: &mut HashSet<QuestionKey>,
) {
    let sh = shared.lock().await;
    let mut to_send = Vec::new();
    for q in questions {
        let key = (q.name.clone(), q.qtype);
        if suppressed.remove(&key) {
            continue;
        }
        let is_ptr = matches!(q.qtype, QueryType::Record(RecordType::PTR));
        if !is_ptr && sh.cache.has_answer(&q.name, q.qtype) {
            continue;
        }
        to_send.push(q.clone());
    }
    if to_send.is_empty() {
        return;
    }
    let answers = known_answers(&sh, &to_send);
    drop(sh);
    dispatch(transport, to_send, answers).await;
}

/// A record-specific re-query (the TTL-ladder and post-expiry refresh).
/// Bypasses the "cache already has an answer" rule - that's the whole point
/// - but still honours passive duplicate suppression.
async fn send_requery<T: Transport>(
    transport: &Arc<T>,
    key: &QuestionKey,
    shared: &Arc<Mutex<Shared>>,
    suppressed: &HashSet<QuestionKey>,
) {
    if suppressed.contains(key) {
        return;
    }
    let question = Question {
        name: key.0.clone(),
        qtype: key.1,
        qclass: RecordClass::Internet,
    };
    let sh = shared.lock().await;
    let answers = known_answers(&sh, std::slice::from_ref(&question));
    drop(sh);
    dispatch(transport, vec![question], answers).await;
}

fn known_answers(shared: &Shared, questions: &[Question]) -> Vec<ResourceRecord> {
    let mut answers = Vec::new();
    for q in questions {
        answers.extend(shared.cache.get(&q.name, q.qtype));
    }
    answers
}

async fn dispatch<T: Transport>(transport: &Arc<T>, questions: Vec<Question>, answers: Vec<ResourceRecord>) {
    let id = rand::thread_rng().gen();
    let mut msg = Message::query(id, questions);
    msg.answers = answers;
    let bytes = match msg.into_octets() {
        Ok(b) => b,
        Err(err) => {
            tracing::warn!(?err, "failed to encode outbound query");
            return;
        }
    };
    if let Err(err) = transport.send(&bytes).await {
        tracing::warn!(?err, "failed to send outbound query");
    }
}

async fn handle_inbound(
    bytes: &[u8],
    questions: &[Question],
    shared: &Arc<Mutex<Shared>>,
    events_tx: &mpsc::UnboundedSender<CacheEvent>,
    suppressed: &mut HashSet<QuestionKey>,
    requery_heap: &mut BinaryHeap<Reverse<Timer<QuestionKey>>>,
) {
    let message = match Message::from_octets(bytes) {
        Ok(m) => m,
        Err(err) => {
            tracing::warn!(?err, "dropping malformed inbound datagram");
            return;
        }
    };

    if !message.header.is_response {
        if !message.answers.is_empty() {
            return;
        }
        for iq in &message.questions {
            for ours in questions {
                if ours.name.matches(&iq.name) && ours.qtype == iq.qtype {
                    suppressed.insert((ours.name.clone(), ours.qtype));
                }
            }
        }
        return;
    }

    let mut matched_once = false;
    let now = Instant::now();
    for answer in &message.answers {
        let matches_ours = questions.iter().any(|q| answer.matches(q));
        if !matches_ours {
            continue;
        }

        let mut sh = shared.lock().await;
        let events = sh.cache.insert(answer);
        if !matched_once {
            remember_additional(&mut sh.additional, &message.additional);
            matched_once = true;
        }
        drop(sh);

        for event in events {
            if event.kind == CacheEventKind::Added {
                schedule_requery_ladder(requery_heap, &event.record, now);
                tracing::debug!(name = %event.record.name, rtype = %event.record.rtype(), "cache record added");
            } else if event.kind == CacheEventKind::Flushed {
                tracing::debug!(name = %event.record.name, rtype = %event.record.rtype(), "cache record flushed");
            }
            let _ = events_tx.send(event);
        }
    }
}

