use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

// flags1: QR(1) OPCODE(4) AA(1) TC(1) RD(1)
pub const HEADER_MASK_QR: u8 = 0b1000_0000;
pub const HEADER_MASK_OPCODE: u8 = 0b0111_1000;
pub const HEADER_OFFSET_OPCODE: usize = 3;
pub const HEADER_MASK_AA: u8 = 0b0000_0100;
pub const HEADER_MASK_TC: u8 = 0b0000_0010;
pub const HEADER_MASK_RD: u8 = 0b0000_0001;

// flags2: RA(1) Z(1) AD(1) CD(1) RCODE(4)
pub const HEADER_MASK_RA: u8 = 0b1000_0000;
pub const HEADER_MASK_Z: u8 = 0b0100_0000;
pub const HEADER_MASK_AD: u8 = 0b0010_0000;
pub const HEADER_MASK_CD: u8 = 0b0001_0000;
pub const HEADER_MASK_RCODE: u8 = 0b0000_1111;
pub const HEADER_OFFSET_RCODE: usize = 0;

/// Basic DNS message format, used for both queries and responses.
///
/// ```text
///     +---------------------+
///     |        Header       |
///     +---------------------+
///     |       Question      | the question for the name server
///     +---------------------+
///     |        Answer       | RRs answering the question
///     +---------------------+
///     |      Authority      | RRs pointing toward an authority
///     +---------------------+
///     |      Additional     | RRs holding additional information
///     +---------------------+
/// ```
///
/// See section 4.1 of RFC 1035.
#[derive(Debug, Clone, Eq, PartialEq)]
#[cfg_attr(any(feature = "test-util", test), derive(arbitrary::Arbitrary))]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authority: Vec<ResourceRecord>,
    pub additional: Vec<ResourceRecord>,
}

impl Message {
    /// Build an empty response shell copying this message's ID and opcode.
    pub fn make_response(&self) -> Self {
        Self {
            header: Header {
                id: self.header.id,
                is_response: true,
                opcode: self.header.opcode,
                is_authoritative: false,
                is_truncated: false,
                recursion_desired: self.header.recursion_desired,
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

    /// Build a query message (QR=0, no RD) for the given questions.
    pub fn query(id: u16, questions: Vec<Question>) -> Self {
        Self {
            header: Header {
                id,
                is_response: false,
                opcode: Opcode::Standard,
                is_authoritative: false,
                is_truncated: false,
                recursion_desired: false,
                recursion_available: false,
                z: false,
                authentic_data: false,
                checking_disabled: false,
                rcode: Rcode::NoError,
            },
            questions,
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }
}

/// Common header type for all messages.
///
/// ```text
///                                     1  1  1  1  1  1
///       0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                      ID                       |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |QR|   Opcode  |AA|TC|RD|RA| Z|AD|CD|   RCODE   |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                    QDCOUNT                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                    ANCOUNT                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                    NSCOUNT                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                    ARCOUNT                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// ```
///
/// See section 4.1.1 of RFC 1035, extended with the AD/CD bits of RFC 4035
/// (mDNS does not use them, but a captured packet may set them and they must
/// round-trip).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(any(feature = "test-util", test), derive(arbitrary::Arbitrary))]
pub struct Header {
    pub id: u16,
    pub is_response: bool,
    pub opcode: Opcode,
    pub is_authoritative: bool,
    pub is_truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub z: bool,
    pub authentic_data: bool,
    pub checking_disabled: bool,
    pub rcode: Rcode,
}

/// A `Header` as it appears on the network, including the section counts.
/// Used for serialisation and deserialisation only: including the counts in
/// the normal `Header` would let them drift from the actual section
/// lengths.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct WireHeader {
    pub header: Header,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

/// A single question, as carried in the question section.
///
/// See section 4.1.2 of RFC 1035 and section 18.12 of RFC 6762 (the top bit
/// of QCLASS is the "unicast response requested" bit on the wire, but per
/// this implementation's scope it is not surfaced: only the low 15 bits are
/// used).
#[derive(Debug, Clone, Eq, PartialEq)]
#[cfg_attr(any(feature = "test-util", test), derive(arbitrary::Arbitrary))]
pub struct Question {
    pub name: DomainName,
    pub qtype: QueryType,
    pub qclass: RecordClass,
}

/// The answer, authority, and additional sections are all the same format:
/// a variable number of resource records.
///
/// See section 4.1.3 of RFC 1035. `is_unique` is the cache-flush bit
/// repurposed from the top bit of the class field by RFC 6762 section 10.2;
/// it is carried as a separate field here rather than folded into `rclass`
/// so record matching by `(name, type, class)` doesn't have to mask it out
/// everywhere.
#[derive(Debug, Clone, Eq, PartialEq)]
#[cfg_attr(any(feature = "test-util", test), derive(arbitrary::Arbitrary))]
pub struct ResourceRecord {
    pub name: DomainName,
    pub rtype_with_data: RecordTypeWithData,
    pub rclass: RecordClass,
    pub ttl: u32,
    pub is_unique: bool,
}

impl ResourceRecord {
    pub fn rtype(&self) -> RecordType {
        self.rtype_with_data.rtype()
    }

    pub fn matches(&self, question: &Question) -> bool {
        self.name.matches(&question.name) && self.rtype().matches(question.qtype)
    }

    /// Re-encode just the RDATA, uncompressed, for canonical comparison
    /// (RFC 6762 section 8.2's tie-break, and known-answer matching).
    pub fn canonical_rdata(&self) -> Vec<u8> {
        let mut buffer = crate::protocol::serialise::WritableBuffer::default();
        self.rtype_with_data
            .clone()
            .serialise_uncompressed(&mut buffer);
        buffer.octets
    }
}

/// A record type with its associated, deserialised, data. Restricted to the
/// types mDNS/DNS-SD actually use; everything else is `Unknown` with its
/// RDATA left opaque.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RecordTypeWithData {
    /// A 32 bit IPv4 address.
    A { address: Ipv4Addr },

    /// A 128 bit IPv6 address.
    AAAA { address: Ipv6Addr },

    /// A domain name this record points to.
    PTR { ptrdname: DomainName },

    /// An ordered list of attributes. Duplicate keys are permitted on the
    /// wire (and preserved here); consumers that care about uniqueness pick
    /// the first.
    TXT { attributes: Vec<(String, TxtValue)> },

    /// A service location record (RFC 2782): who to connect to, and how
    /// eagerly.
    SRV {
        priority: u16,
        weight: u16,
        port: u16,
        target: DomainName,
    },

    /// A non-existence assertion, restricted to the single
    /// window-0/bitmap-≤32-bytes form that covers type numbers 0..=255
    /// (RFC 4034 section 4, restricted per this crate's scope). A record
    /// using any other window or a bitmap run longer than that is kept as
    /// `Unknown` instead of failing to parse.
    NSEC {
        next_domain: DomainName,
        types: Vec<RecordType>,
    },

    /// Any other record type. RDATA is not interpreted.
    Unknown { tag: u16, octets: Vec<u8> },
}

impl RecordTypeWithData {
    pub fn rtype(&self) -> RecordType {
        match self {
            RecordTypeWithData::A { .. } => RecordType::A,
            RecordTypeWithData::AAAA { .. } => RecordType::AAAA,
            RecordTypeWithData::PTR { .. } => RecordType::PTR,
            RecordTypeWithData::TXT { .. } => RecordType::TXT,
            RecordTypeWithData::SRV { .. } => RecordType::SRV,
            RecordTypeWithData::NSEC { .. } => RecordType::NSEC,
            RecordTypeWithData::Unknown { tag, .. } => RecordType::from(*tag),
        }
    }
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for RecordTypeWithData {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(match u.int_in_range::<u8>(0..=5)? {
            0 => RecordTypeWithData::A {
                address: Ipv4Addr::from(u.arbitrary::<u32>()?),
            },
            1 => RecordTypeWithData::AAAA {
                address: Ipv6Addr::from(u.arbitrary::<u128>()?),
            },
            2 => RecordTypeWithData::PTR {
                ptrdname: u.arbitrary()?,
            },
            3 => {
                let n = u.int_in_range::<usize>(0..=4)?;
                let mut attributes = Vec::with_capacity(n);
                for _ in 0..n {
                    let len = u.int_in_range::<usize>(1..=8)?;
                    let mut key = String::with_capacity(len);
                    for _ in 0..len {
                        key.push(char::from(u.int_in_range::<u8>(b'a'..=b'z')?));
                    }
                    attributes.push((key, u.arbitrary()?));
                }
                RecordTypeWithData::TXT { attributes }
            }
            4 => RecordTypeWithData::SRV {
                priority: u.arbitrary()?,
                weight: u.arbitrary()?,
                port: u.arbitrary()?,
                target: u.arbitrary()?,
            },
            _ => {
                let mut types: Vec<RecordType> = (0..u.int_in_range::<usize>(0..=8)?)
                    .map(|_| RecordType::from(u.int_in_range::<u16>(0..=255).unwrap_or(0)))
                    .collect();
                types.sort();
                types.dedup();
                RecordTypeWithData::NSEC {
                    next_domain: u.arbitrary()?,
                    types,
                }
            }
        })
    }
}

/// The value half of a TXT attribute. The wire format distinguishes three
/// states (RFC 6763 section 6.4): no `=` at all, a trailing `=` with
/// nothing after it, and a genuine (possibly empty) byte string.
#[derive(Debug, Clone, Eq, PartialEq)]
#[cfg_attr(any(feature = "test-util", test), derive(arbitrary::Arbitrary))]
pub enum TxtValue {
    /// `key` with no `=` at all.
    Present,
    /// `key=` with nothing following.
    Empty,
    /// `key=<bytes>`.
    Bytes(Vec<u8>),
}

/// A domain name: an ordered sequence of non-empty labels, each 1–63 bytes.
/// The empty-label root terminator is implicit and not stored.
///
/// Comparison, hashing, and ordering are case-insensitive over ASCII (RFC
/// 1035 section 2.3.3); the original case of each label is kept so it can be
/// re-serialised unchanged.
#[derive(Clone, Eq)]
pub struct DomainName {
    pub labels: Vec<Vec<u8>>,
}

/// A label may not be empty or longer than 63 octets.
pub const LABEL_MAX_LEN: usize = 63;

/// Total encoded length (length octets + label bytes + 1 for the root
/// terminator) may not exceed 255 octets.
pub const DOMAINNAME_MAX_LEN: usize = 255;

impl DomainName {
    pub fn root() -> Self {
        DomainName { labels: Vec::new() }
    }

    pub fn is_root(&self) -> bool {
        self.labels.is_empty()
    }

    /// Total on-wire length assuming no compression: every label costs
    /// `1 + len`, plus the 1 byte root terminator.
    pub fn wire_len(&self) -> usize {
        self.labels.iter().map(|l| 1 + l.len()).sum::<usize>() + 1
    }

    pub fn is_subdomain_of(&self, other: &DomainName) -> bool {
        if other.labels.len() > self.labels.len() {
            return false;
        }
        let offset = self.labels.len() - other.labels.len();
        self.labels[offset..]
            .iter()
            .zip(other.labels.iter())
            .all(|(a, b)| ascii_eq_ignore_case(a, b))
    }

    /// True if `self` and `other` name the same domain (case-insensitive).
    pub fn matches(&self, other: &DomainName) -> bool {
        self.labels.len() == other.labels.len()
            && self
                .labels
                .iter()
                .zip(other.labels.iter())
                .all(|(a, b)| ascii_eq_ignore_case(a, b))
    }

    pub fn to_dotted_string(&self) -> String {
        if self.labels.is_empty() {
            return ".".to_string();
        }
        let mut out = String::with_capacity(self.wire_len());
        for (i, label) in self.labels.iter().enumerate() {
            if i != 0 {
                out.push('.');
            }
            for octet in label {
                out.push(*octet as char);
            }
        }
        out
    }

    pub fn from_dotted_string(s: &str) -> Option<Self> {
        if s == "." || s.is_empty() {
            return Some(Self::root());
        }
        let s = s.strip_suffix('.').unwrap_or(s);
        let labels = s
            .split('.')
            .map(|l| l.as_bytes().to_vec())
            .collect::<Vec<_>>();
        Self::from_labels(labels)
    }

    pub fn from_labels(labels: Vec<Vec<u8>>) -> Option<Self> {
        let mut total = 1usize; // root terminator
        for label in &labels {
            if label.is_empty() || label.len() > LABEL_MAX_LEN || !label.is_ascii() {
                return None;
            }
            total += 1 + label.len();
        }
        if total > DOMAINNAME_MAX_LEN {
            return None;
        }
        Some(DomainName { labels })
    }

    /// Build `<this>.<suffix>`, e.g. an instance label joined onto
    /// `_type._tcp.local`.
    pub fn prepended_to(&self, suffix: &DomainName) -> Option<Self> {
        let mut labels = self.labels.clone();
        labels.extend(suffix.labels.iter().cloned());
        Self::from_labels(labels)
    }
}

fn ascii_eq_ignore_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|(x, y)| x.to_ascii_lowercase() == y.to_ascii_lowercase())
}

fn ascii_lower(label: &[u8]) -> Vec<u8> {
    label.iter().map(|b| b.to_ascii_lowercase()).collect()
}

impl PartialEq for DomainName {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other)
    }
}

impl std::hash::Hash for DomainName {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.labels.len().hash(state);
        for label in &self.labels {
            ascii_lower(label).hash(state);
        }
    }
}

impl Ord for DomainName {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let a: Vec<Vec<u8>> = self.labels.iter().map(|l| ascii_lower(l)).collect();
        let b: Vec<Vec<u8>> = other.labels.iter().map(|l| ascii_lower(l)).collect();
        a.cmp(&b)
    }
}

impl PartialOrd for DomainName {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DomainName")
            .field(&self.to_dotted_string())
            .finish()
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_dotted_string())
    }
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for DomainName {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let num_labels = u.int_in_range::<usize>(0..=6)?;
        let mut labels = Vec::with_capacity(num_labels);
        for _ in 0..num_labels {
            let label_len = u.int_in_range::<u8>(1..=20)?;
            let mut label = Vec::with_capacity(label_len as usize);
            for _ in 0..label_len {
                label.push(u.int_in_range::<u8>(b'a'..=b'z')?);
            }
            labels.push(label);
        }
        Ok(DomainName { labels })
    }
}

/// Query types are a superset of record types: `QTYPE = ANY` (255) matches
/// any record type and is used for mDNS probes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum QueryType {
    Record(RecordType),
    Any,
}

impl QueryType {
    pub fn matches(self, rtype: RecordType) -> bool {
        match self {
            QueryType::Any => true,
            QueryType::Record(t) => t == rtype,
        }
    }
}

impl From<u16> for QueryType {
    fn from(value: u16) -> Self {
        match value {
            255 => QueryType::Any,
            _ => QueryType::Record(RecordType::from(value)),
        }
    }
}

impl From<QueryType> for u16 {
    fn from(value: QueryType) -> Self {
        match value {
            QueryType::Any => 255,
            QueryType::Record(rtype) => rtype.into(),
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            QueryType::Any => write!(f, "ANY"),
            QueryType::Record(rtype) => write!(f, "{rtype}"),
        }
    }
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for QueryType {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(Self::from(u.arbitrary::<u16>()?))
    }
}

/// The six record types this crate interprets, plus an opaque catch-all for
/// everything else (RFC 1035's NS/CNAME/MX/SOA/etc included).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RecordType {
    A,
    PTR,
    TXT,
    AAAA,
    SRV,
    NSEC,
    Unknown(RecordTypeUnknown),
}

/// A struct with a private constructor, to ensure invalid `RecordType`s
/// cannot be created directly.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordTypeUnknown(u16);

impl RecordType {
    pub fn matches(self, qtype: QueryType) -> bool {
        qtype.matches(self)
    }
}

impl From<u16> for RecordType {
    fn from(value: u16) -> Self {
        match value {
            1 => RecordType::A,
            12 => RecordType::PTR,
            16 => RecordType::TXT,
            28 => RecordType::AAAA,
            33 => RecordType::SRV,
            47 => RecordType::NSEC,
            other => RecordType::Unknown(RecordTypeUnknown(other)),
        }
    }
}

impl From<RecordType> for u16 {
    fn from(value: RecordType) -> Self {
        match value {
            RecordType::A => 1,
            RecordType::PTR => 12,
            RecordType::TXT => 16,
            RecordType::AAAA => 28,
            RecordType::SRV => 33,
            RecordType::NSEC => 47,
            RecordType::Unknown(RecordTypeUnknown(value)) => value,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecordType::A => write!(f, "A"),
            RecordType::PTR => write!(f, "PTR"),
            RecordType::TXT => write!(f, "TXT"),
            RecordType::AAAA => write!(f, "AAAA"),
            RecordType::SRV => write!(f, "SRV"),
            RecordType::NSEC => write!(f, "NSEC"),
            RecordType::Unknown(RecordTypeUnknown(n)) => write!(f, "TYPE{n}"),
        }
    }
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for RecordType {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(Self::from(u.arbitrary::<u16>()?))
    }
}

/// Record (and question) classes. In practice this is always `IN`; the
/// `Unknown` arm exists so a captured packet with something unexpected in
/// the class field still decodes instead of erroring.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RecordClass {
    Internet,
    Unknown(RecordClassUnknown),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordClassUnknown(u16);

impl From<u16> for RecordClass {
    fn from(value: u16) -> Self {
        match value {
            1 => RecordClass::Internet,
            other => RecordClass::Unknown(RecordClassUnknown(other)),
        }
    }
}

impl From<RecordClass> for u16 {
    fn from(value: RecordClass) -> Self {
        match value {
            RecordClass::Internet => 1,
            RecordClass::Unknown(RecordClassUnknown(value)) => value,
        }
    }
}

impl fmt::Display for RecordClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecordClass::Internet => write!(f, "IN"),
            RecordClass::Unknown(RecordClassUnknown(n)) => write!(f, "CLASS{n}"),
        }
    }
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for RecordClass {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        // keep the low 15 bits only, per this crate's scope (see `Question`)
        Ok(Self::from(u.arbitrary::<u16>()? & 0x7fff))
    }
}

/// A four bit field specifying the kind of query. mDNS only ever uses
/// `Standard`; the rest exist so arbitrary captured headers round-trip.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Opcode {
    Standard,
    Inverse,
    Status,
    Reserved(OpcodeReserved),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct OpcodeReserved(u8);

impl From<u8> for Opcode {
    fn from(octet: u8) -> Self {
        match octet & 0b0000_1111 {
            0 => Opcode::Standard,
            1 => Opcode::Inverse,
            2 => Opcode::Status,
            other => Opcode::Reserved(OpcodeReserved(other)),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(value: Opcode) -> Self {
        match value {
            Opcode::Standard => 0,
            Opcode::Inverse => 1,
            Opcode::Status => 2,
            Opcode::Reserved(OpcodeReserved(v)) => v,
        }
    }
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for Opcode {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(Self::from(u.arbitrary::<u8>()?))
    }
}

/// A four bit response code.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Rcode {
    NoError,
    FormatError,
    ServerFailure,
    NameError,
    NotImplemented,
    Refused,
    Reserved(RcodeReserved),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RcodeReserved(u8);

impl From<u8> for Rcode {
    fn from(octet: u8) -> Self {
        match octet & 0b0000_1111 {
            0 => Rcode::NoError,
            1 => Rcode::FormatError,
            2 => Rcode::ServerFailure,
            3 => Rcode::NameError,
            4 => Rcode::NotImplemented,
            5 => Rcode::Refused,
            other => Rcode::Reserved(RcodeReserved(other)),
        }
    }
}

impl From<Rcode> for u8 {
    fn from(value: Rcode) -> Self {
        match value {
            Rcode::NoError => 0,
            Rcode::FormatError => 1,
            Rcode::ServerFailure => 2,
            Rcode::NameError => 3,
            Rcode::NotImplemented => 4,
            Rcode::Refused => 5,
            Rcode::Reserved(RcodeReserved(v)) => v,
        }
    }
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for Rcode {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(Self::from(u.arbitrary::<u8>()?))
    }
}

#[cfg(any(feature = "test-util", test))]
pub mod test_util {
    use super::*;

    pub fn domain(name: &str) -> DomainName {
        DomainName::from_dotted_string(name).unwrap()
    }

    pub fn a_record(name: &str, address: Ipv4Addr) -> ResourceRecord {
        ResourceRecord {
            name: domain(name),
            rtype_with_data: RecordTypeWithData::A { address },
            rclass: RecordClass::Internet,
            ttl: 120,
            is_unique: true,
        }
    }

    pub fn ptr_record(name: &str, target: &str) -> ResourceRecord {
        ResourceRecord {
            name: domain(name),
            rtype_with_data: RecordTypeWithData::PTR {
                ptrdname: domain(target),
            },
            rclass: RecordClass::Internet,
            ttl: 4500,
            is_unique: false,
        }
    }
}
