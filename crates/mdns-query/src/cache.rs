//! The querier's answer cache: TTL-keyed storage with cache-flush (unique
//! record) semantics and an expiry-ordered priority queue, generalising the
//! resolver cache's `PriorityQueue<DomainName, Reverse<Instant>>` idiom down
//! to individual records rather than whole domains, since mDNS needs to
//! flush or expire one RDATA variant without touching its siblings.

use priority_queue::PriorityQueue;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use dns_types::protocol::types::{QueryType, RecordClass, RecordType, RecordTypeWithData};
use dns_types::protocol::types::{DomainName, ResourceRecord};

/// Something happened to a cached record, worth telling a consumer about.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CacheEventKind {
    Added,
    Flushed,
    Expired,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CacheEvent {
    pub kind: CacheEventKind,
    pub record: ResourceRecord,
}

impl CacheEvent {
    fn added(record: ResourceRecord) -> Self {
        Self {
            kind: CacheEventKind::Added,
            record,
        }
    }

    fn flushed(record: ResourceRecord) -> Self {
        Self {
            kind: CacheEventKind::Flushed,
            record,
        }
    }

    fn expired(record: ResourceRecord) -> Self {
        Self {
            kind: CacheEventKind::Expired,
            record,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
struct CacheKey {
    name: DomainName,
    rtype: RecordType,
    rdata: Vec<u8>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    rtype_with_data: RecordTypeWithData,
    rclass: RecordClass,
    is_unique: bool,
    expiry: Instant,
}

/// Caching for `ResourceRecord`s, keyed by (name, type, canonical RDATA) so
/// that distinct answers for the same (name, type) - A records from two
/// different hosts, say - can be flushed and expired independently.
#[derive(Debug, Default)]
pub struct Cache {
    entries: HashMap<CacheKey, CacheEntry>,
    expiry_priority: PriorityQueue<CacheKey, Reverse<Instant>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records matching `name` and `qtype`, with TTL relative to now. Expired
    /// entries are never returned - callers see only what's still live.
    pub fn get(&self, name: &DomainName, qtype: QueryType) -> Vec<ResourceRecord> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|(key, _)| key.name.matches(name) && qtype.matches(key.rtype))
            .filter_map(|(key, entry)| to_rr(key, entry, now))
            .collect()
    }

    /// True if the cache holds at least one live record matching.
    pub fn has_answer(&self, name: &DomainName, qtype: QueryType) -> bool {
        let now = Instant::now();
        self.entries
            .iter()
            .any(|(key, entry)| key.name.matches(name) && qtype.matches(key.rtype) && entry.expiry > now)
    }

    /// Insert a record observed on the wire, applying cache-flush semantics
    /// for `is_unique` records and goodbye (TTL=0) handling (RFC 6762
    /// sections 10.1/10.2). Returns the events this caused.
    pub fn insert(&mut self, record: &ResourceRecord) -> Vec<CacheEvent> {
        let now = Instant::now();
        let is_goodbye = record.ttl == 0;
        let effective_ttl = if is_goodbye { 1 } else { record.ttl };
        let expiry = now + Duration::from_secs(effective_ttl.into());
        let rtype = record.rtype();
        let rdata = record.canonical_rdata();
        let key = CacheKey {
            name: record.name.clone(),
            rtype,
            rdata: rdata.clone(),
        };

        let mut events = Vec::new();

        if record.is_unique {
            let existing_key = self
                .entries
                .keys()
                .find(|k| k.name.matches(&record.name) && k.rtype == rtype)
                .cloned();

            match existing_key {
                Some(ek) if ek.rdata == rdata => {
                    // Same record re-observed. A goodbye still shortens its
                    // life and is worth an Added re-affirming the impending
                    // expiry; an ordinary refresh is silent.
                    if is_goodbye {
                        if let Some(entry) = self.entries.get_mut(&ek) {
                            entry.expiry = expiry;
                        }
                        self.expiry_priority.change_priority(&ek, Reverse(expiry));
                        if let Some(entry) = self.entries.get(&ek) {
                            if let Some(rr) = to_rr(&ek, entry, now) {
                                events.push(CacheEvent::added(rr));
                            } else {
                                events.push(CacheEvent::added(record.clone()));
                            }
                        }
                    }
                }
                Some(ek) => {
                    // Differing RDATA under the same unique (name, type):
                    // flush the old value out before taking the new one.
                    if let Some(old) = self.entries.remove(&ek) {
                        self.expiry_priority.remove(&ek);
                        events.push(CacheEvent::flushed(ResourceRecord {
                            name: ek.name.clone(),
                            rtype_with_data: old.rtype_with_data,
                            rclass: old.rclass,
                            ttl: 0,
                            is_unique: true,
                        }));
                    }
                    self.insert_new(key, record, expiry, &mut events, now);
                }
                None => self.insert_new(key, record, expiry, &mut events, now),
            }
        } else {
            self.insert_new(key, record, expiry, &mut events, now);
        }

        events
    }

    fn insert_new(
        &mut self,
        key: CacheKey,
        record: &ResourceRecord,
        expiry: Instant,
        events: &mut Vec<CacheEvent>,
        now: Instant,
    ) {
        let entry = CacheEntry {
            rtype_with_data: record.rtype_with_data.clone(),
            rclass: record.rclass,
            is_unique: record.is_unique,
            expiry,
        };
        self.expiry_priority.push(key.clone(), Reverse(expiry));
        if let Some(rr) = to_rr(&key, &entry, now) {
            events.push(CacheEvent::added(rr));
        } else {
            events.push(CacheEvent::added(record.clone()));
        }
        self.entries.insert(key, entry);
    }

    /// Remove and emit `Expired` for every record whose expiry has passed.
    pub fn remove_expired(&mut self, now: Instant) -> Vec<CacheEvent> {
        let mut events = Vec::new();
        while let Some((_, Reverse(expiry))) = self.expiry_priority.peek() {
            if *expiry > now {
                break;
            }
            let (key, _) = self.expiry_priority.pop().expect("just peeked");
            if let Some(entry) = self.entries.remove(&key) {
                events.push(CacheEvent::expired(ResourceRecord {
                    name: key.name,
                    rtype_with_data: entry.rtype_with_data,
                    rclass: entry.rclass,
                    ttl: 0,
                    is_unique: entry.is_unique,
                }));
            }
        }
        events
    }

    /// When the next record is due to expire, if any.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.expiry_priority.peek().map(|(_, Reverse(t))| *t)
    }

    /// The number of distinct records currently cached.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn to_rr(key: &CacheKey, entry: &CacheEntry, now: Instant) -> Option<ResourceRecord> {
    let remaining = entry.expiry.saturating_duration_since(now);
    let ttl = remaining.as_secs().min(u32::MAX as u64) as u32;
    Some(ResourceRecord {
        name: key.name.clone(),
        rtype_with_data: entry.rtype_with_data.clone(),
        rclass: entry.rclass,
        ttl,
        is_unique: entry.is_unique,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_types::protocol::types::test_util::*;
    use std::net::Ipv4Addr;

    #[test]
    fn insert_unique_differing_rdata_flushes_then_adds() {
        let mut cache = Cache::new();
        let mut first = a_record("x.local.", Ipv4Addr::new(5, 5, 5, 5));
        first.ttl = 1000;
        let mut second = a_record("x.local.", Ipv4Addr::new(6, 6, 6, 6));
        second.ttl = 1000;

        let events1 = cache.insert(&first);
        assert_eq!(events1.len(), 1);
        assert_eq!(events1[0].kind, CacheEventKind::Added);

        let events2 = cache.insert(&second);
        assert_eq!(events2.len(), 2);
        assert_eq!(events2[0].kind, CacheEventKind::Flushed);
        assert_eq!(events2[1].kind, CacheEventKind::Added);

        let got = cache.get(&domain("x.local."), QueryType::Record(RecordType::A));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].rtype_with_data, second.rtype_with_data);
    }

    #[test]
    fn insert_unique_exact_duplicate_is_silent() {
        let mut cache = Cache::new();
        let mut rr = a_record("x.local.", Ipv4Addr::new(5, 5, 5, 5));
        rr.ttl = 1000;

        cache.insert(&rr);
        let events = cache.insert(&rr);
        assert!(events.is_empty());
    }

    #[test]
    fn goodbye_shortens_ttl_and_then_expires() {
        let mut cache = Cache::new();
        let mut rr = a_record("x.local.", Ipv4Addr::new(5, 5, 5, 5));
        rr.ttl = 60;
        cache.insert(&rr);

        let mut goodbye = rr.clone();
        goodbye.ttl = 0;
        let events = cache.insert(&goodbye);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, CacheEventKind::Added);

        let expired = cache.remove_expired(Instant::now() + Duration::from_secs(2));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].kind, CacheEventKind::Expired);
    }

    #[test]
    fn non_unique_records_accumulate() {
        let mut cache = Cache::new();
        let a = ptr_record("_http._tcp.local.", "a._http._tcp.local.");
        let b = ptr_record("_http._tcp.local.", "b._http._tcp.local.");
        cache.insert(&a);
        cache.insert(&b);

        let got = cache.get(&domain("_http._tcp.local."), QueryType::Record(RecordType::PTR));
        assert_eq!(got.len(), 2);
    }
}
