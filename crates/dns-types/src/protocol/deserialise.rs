//! Deserialisation of DNS messages from the network.  See the `types`
//! module for details of the format.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::protocol::types::*;

impl Message {
    /// # Errors
    ///
    /// If the message cannot be parsed.
    pub fn from_octets(octets: &[u8]) -> Result<Self, Error> {
        Self::deserialise(&mut ConsumableBuffer::new(octets))
    }

    /// # Errors
    ///
    /// If the message cannot be parsed.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let wire_header = WireHeader::deserialise(buffer)?;
        let mut questions = Vec::with_capacity(wire_header.qdcount.into());
        let mut answers = Vec::with_capacity(wire_header.ancount.into());
        let mut authority = Vec::with_capacity(wire_header.nscount.into());
        let mut additional = Vec::with_capacity(wire_header.arcount.into());

        for _ in 0..wire_header.qdcount {
            questions.push(Question::deserialise(wire_header.header.id, buffer)?);
        }
        for _ in 0..wire_header.ancount {
            answers.push(ResourceRecord::deserialise(wire_header.header.id, buffer)?);
        }
        for _ in 0..wire_header.nscount {
            authority.push(ResourceRecord::deserialise(wire_header.header.id, buffer)?);
        }
        for _ in 0..wire_header.arcount {
            additional.push(ResourceRecord::deserialise(wire_header.header.id, buffer)?);
        }

        Ok(Self {
            header: wire_header.header,
            questions,
            answers,
            authority,
            additional,
        })
    }
}

impl WireHeader {
    /// # Errors
    ///
    /// If the header is too short.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let id = buffer.next_u16().ok_or(Error::CompletelyBusted)?;
        let flags1 = buffer.next_u8().ok_or(Error::HeaderTooShort(id))?;
        let flags2 = buffer.next_u8().ok_or(Error::HeaderTooShort(id))?;
        let qdcount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
        let ancount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
        let nscount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
        let arcount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;

        Ok(Self {
            header: Header {
                id,
                is_response: flags1 & HEADER_MASK_QR != 0,
                opcode: Opcode::from((flags1 & HEADER_MASK_OPCODE) >> HEADER_OFFSET_OPCODE),
                is_authoritative: flags1 & HEADER_MASK_AA != 0,
                is_truncated: flags1 & HEADER_MASK_TC != 0,
                recursion_desired: flags1 & HEADER_MASK_RD != 0,
                recursion_available: flags2 & HEADER_MASK_RA != 0,
                z: flags2 & HEADER_MASK_Z != 0,
                authentic_data: flags2 & HEADER_MASK_AD != 0,
                checking_disabled: flags2 & HEADER_MASK_CD != 0,
                rcode: Rcode::from((flags2 & HEADER_MASK_RCODE) >> HEADER_OFFSET_RCODE),
            },
            qdcount,
            ancount,
            nscount,
            arcount,
        })
    }
}

impl Question {
    /// # Errors
    ///
    /// If the question cannot be parsed.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(id, buffer)?;
        let qtype = QueryType::deserialise(id, buffer)?;
        let raw_qclass = buffer.next_u16().ok_or(Error::QuestionTooShort(id))?;
        // the top bit is "unicast response requested" (RFC 6762 section
        // 18.12), not part of the class value itself.
        let qclass = RecordClass::from(raw_qclass & 0x7fff);

        Ok(Self {
            name,
            qtype,
            qclass,
        })
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the record cannot be parsed.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(id, buffer)?;
        let rtype = RecordType::deserialise(id, buffer)?;
        let raw_rclass = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?;
        // the top bit is the cache-flush bit (RFC 6762 section 10.2), not
        // part of the class value itself.
        let is_unique = raw_rclass & 0x8000 != 0;
        let rclass = RecordClass::from(raw_rclass & 0x7fff);
        let ttl = buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?;
        let rdlength = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?;

        let rdata_start = buffer.position();

        let mut raw_rdata = || {
            if let Some(octets) = buffer.take(rdlength as usize) {
                Ok(octets.to_vec())
            } else {
                Err(Error::ResourceRecordTooShort(id))
            }
        };

        let rtype_with_data = match rtype {
            RecordType::A => RecordTypeWithData::A {
                address: Ipv4Addr::from(
                    buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?,
                ),
            },
            RecordType::AAAA => RecordTypeWithData::AAAA {
                address: Ipv6Addr::new(
                    buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                    buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                    buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                    buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                    buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                    buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                    buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                    buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                ),
            },
            RecordType::PTR => RecordTypeWithData::PTR {
                ptrdname: DomainName::deserialise(id, buffer)?,
            },
            RecordType::TXT => {
                let octets = raw_rdata()?;
                RecordTypeWithData::TXT {
                    attributes: parse_txt_attributes(&octets),
                }
            }
            RecordType::SRV => RecordTypeWithData::SRV {
                priority: buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                weight: buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                port: buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?,
                target: DomainName::deserialise(id, buffer)?,
            },
            RecordType::NSEC => {
                // the restricted form this crate understands: window block 0,
                // bitmap <= 32 bytes (covers type numbers 0..=255). Anything
                // else is parsed as Unknown instead, so we speculatively try
                // the restricted parse first and fall back on mismatch.
                let restricted_start = buffer.position();
                match parse_restricted_nsec(id, buffer, rdata_start, rdlength) {
                    Some((next_domain, types)) => RecordTypeWithData::NSEC { next_domain, types },
                    None => {
                        buffer.seek(restricted_start);
                        let octets = raw_rdata()?;
                        RecordTypeWithData::Unknown {
                            tag: u16::from(RecordType::NSEC),
                            octets,
                        }
                    }
                }
            }
            RecordType::Unknown(_) => RecordTypeWithData::Unknown {
                tag: rtype.into(),
                octets: raw_rdata()?,
            },
        };

        let rdata_stop = buffer.position();

        if rdata_stop == rdata_start + (rdlength as usize) {
            Ok(Self {
                name,
                rtype_with_data,
                rclass,
                ttl,
                is_unique,
            })
        } else {
            Err(Error::ResourceRecordInvalid(id))
        }
    }
}

/// Parse the restricted NSEC form (RFC 4034 section 4, window 0 only,
/// bitmap <= 32 bytes). Returns `None` (without consuming beyond `rdlength`)
/// if the record uses any other window or a too-long bitmap, so the caller
/// can retry as opaque RDATA.
fn parse_restricted_nsec(
    id: u16,
    buffer: &mut ConsumableBuffer,
    rdata_start: usize,
    rdlength: u16,
) -> Option<(DomainName, Vec<RecordType>)> {
    let rdata_end = rdata_start + rdlength as usize;
    let next_domain = DomainName::deserialise(id, buffer).ok()?;
    if buffer.position() >= rdata_end {
        return None;
    }
    let window = buffer.next_u8()?;
    let bitmap_len = buffer.next_u8()?;
    if window != 0 || bitmap_len == 0 || bitmap_len > 32 {
        return None;
    }
    let bitmap = buffer.take(bitmap_len as usize)?;
    if buffer.position() != rdata_end {
        return None;
    }
    let mut types = Vec::new();
    for (byte_index, byte) in bitmap.iter().enumerate() {
        for bit in 0..8u16 {
            if byte & (0b1000_0000 >> bit) != 0 {
                types.push(RecordType::from((byte_index as u16) * 8 + bit));
            }
        }
    }
    Some((next_domain, types))
}

/// Parse a TXT record's RDATA into its tri-state attributes (RFC 6763
/// section 6.3/6.4): each attribute is a length-prefixed byte string,
/// optionally containing a single `=` separating key from value.
fn parse_txt_attributes(octets: &[u8]) -> Vec<(String, TxtValue)> {
    let mut attributes = Vec::new();
    let mut pos = 0;
    while pos < octets.len() {
        let len = octets[pos] as usize;
        pos += 1;
        if pos + len > octets.len() {
            break;
        }
        let item = &octets[pos..pos + len];
        pos += len;
        if item.is_empty() {
            continue;
        }
        match item.iter().position(|&b| b == b'=') {
            Some(eq) => {
                let key = String::from_utf8_lossy(&item[..eq]).into_owned();
                let value = &item[eq + 1..];
                if value.is_empty() {
                    attributes.push((key, TxtValue::Empty));
                } else {
                    attributes.push((key, TxtValue::Bytes(value.to_vec())));
                }
            }
            None => {
                let key = String::from_utf8_lossy(item).into_owned();
                attributes.push((key, TxtValue::Present));
            }
        }
    }
    attributes
}

impl DomainName {
    /// # Errors
    ///
    /// If the domain cannot be parsed.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        Self::deserialise_from(id, buffer, 0)
    }

    fn deserialise_from(id: u16, buffer: &mut ConsumableBuffer, jumps: u8) -> Result<Self, Error> {
        // RFC 1035 section 4.1.4 pointers may only point strictly backwards,
        // which already rules out simple self-loops; this bound guards
        // against longer pointer chains that each point validly backwards
        // but still cycle through a bounded region of the datagram.
        if jumps > 32 {
            return Err(Error::DomainPointerLoop(id));
        }

        let mut labels = Vec::<Vec<u8>>::with_capacity(5);
        let mut wire_len = 1usize; // root terminator
        let start = buffer.position();

        loop {
            let size = buffer.next_u8().ok_or(Error::DomainTooShort(id))?;

            if usize::from(size) <= LABEL_MAX_LEN {
                if size == 0 {
                    break;
                }

                let label = buffer
                    .take(size as usize)
                    .ok_or(Error::DomainTooShort(id))?
                    .to_vec();
                wire_len += 1 + label.len();
                labels.push(label);

                if wire_len > DOMAINNAME_MAX_LEN {
                    return Err(Error::DomainTooLong(id));
                }
            } else if size >= 192 {
                let hi = size & 0b0011_1111;
                let lo = buffer.next_u8().ok_or(Error::DomainTooShort(id))?;
                let ptr = usize::from(u16::from_be_bytes([hi, lo]));

                // pointer must be to an earlier position (RFC 1035 section
                // 4.1.4), not merely a different one.
                if ptr >= start {
                    return Err(Error::DomainPointerInvalid(id));
                }

                let mut pointee = buffer.at_offset(ptr);
                let other = DomainName::deserialise_from(id, &mut pointee, jumps + 1)?;
                for label in other.labels {
                    wire_len += 1 + label.len();
                    labels.push(label);
                }
                if wire_len > DOMAINNAME_MAX_LEN {
                    return Err(Error::DomainTooLong(id));
                }
                break;
            } else {
                return Err(Error::DomainLabelInvalid(id));
            }
        }

        Ok(DomainName { labels })
    }
}

impl QueryType {
    /// # Errors
    ///
    /// If the query type is too short.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let value = buffer.next_u16().ok_or(Error::QuestionTooShort(id))?;
        Ok(Self::from(value))
    }
}

impl RecordType {
    /// # Errors
    ///
    /// If the record type is too short.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let value = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?;
        Ok(Self::from(value))
    }
}

/// Errors encountered when parsing a datagram.  In all the errors
/// which have a `u16` parameter, that is the ID from the header - so
/// that an error response can be sent.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// The datagram is not even 2 octets long, so it doesn't even
    /// contain a valid ID.  An error cannot even be sent back to the
    /// client in this case as, without an ID, it cannot be linked
    /// with the correct query.
    CompletelyBusted,

    /// The header is missing one or more required fields.
    HeaderTooShort(u16),

    /// A question ends with an incomplete field.
    QuestionTooShort(u16),

    /// A resource record ends with an incomplete field.
    ResourceRecordTooShort(u16),

    /// A resource record is the wrong format.
    ResourceRecordInvalid(u16),

    /// A domain is incomplete.
    DomainTooShort(u16),

    /// A domain is over 255 octets in size.
    DomainTooLong(u16),

    /// A domain pointer points to or after the current record.
    DomainPointerInvalid(u16),

    /// A domain pointer chain is implausibly long; bails out rather than
    /// spin on a maliciously-crafted datagram.
    DomainPointerLoop(u16),

    /// A domain label is longer than 63 octets, but not a pointer.
    DomainLabelInvalid(u16),
}

impl Error {
    pub fn id(self) -> Option<u16> {
        match self {
            Error::CompletelyBusted => None,
            Error::HeaderTooShort(id)
            | Error::QuestionTooShort(id)
            | Error::ResourceRecordTooShort(id)
            | Error::ResourceRecordInvalid(id)
            | Error::DomainTooShort(id)
            | Error::DomainTooLong(id)
            | Error::DomainPointerInvalid(id)
            | Error::DomainPointerLoop(id)
            | Error::DomainLabelInvalid(id) => Some(id),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::CompletelyBusted => write!(f, "datagram too short to contain a header"),
            Error::HeaderTooShort(id) => write!(f, "header truncated (id {id})"),
            Error::QuestionTooShort(id) => write!(f, "question truncated (id {id})"),
            Error::ResourceRecordTooShort(id) => write!(f, "resource record truncated (id {id})"),
            Error::ResourceRecordInvalid(id) => {
                write!(f, "resource record rdlength mismatch (id {id})")
            }
            Error::DomainTooShort(id) => write!(f, "domain name truncated (id {id})"),
            Error::DomainTooLong(id) => write!(f, "domain name over 255 octets (id {id})"),
            Error::DomainPointerInvalid(id) => {
                write!(f, "domain pointer does not point strictly backwards (id {id})")
            }
            Error::DomainPointerLoop(id) => write!(f, "domain pointer chain too long (id {id})"),
            Error::DomainLabelInvalid(id) => write!(f, "domain label over 63 octets (id {id})"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// A buffer which will be consumed by the parsing process.
pub struct ConsumableBuffer<'a> {
    octets: &'a [u8],
    position: usize,
}

impl<'a> ConsumableBuffer<'a> {
    pub fn new(octets: &'a [u8]) -> Self {
        Self {
            octets,
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Move the cursor back to an earlier position in the same buffer.
    /// Used to retry a speculative parse (e.g. the restricted NSEC form)
    /// from its start.
    pub fn seek(&mut self, position: usize) {
        self.position = position;
    }

    pub fn next_u8(&mut self) -> Option<u8> {
        if self.octets.len() > self.position {
            let a = self.octets[self.position];
            self.position += 1;
            Some(a)
        } else {
            None
        }
    }

    pub fn next_u16(&mut self) -> Option<u16> {
        if self.octets.len() > self.position + 1 {
            let a = self.octets[self.position];
            let b = self.octets[self.position + 1];
            self.position += 2;
            Some(u16::from_be_bytes([a, b]))
        } else {
            None
        }
    }

    pub fn next_u32(&mut self) -> Option<u32> {
        if self.octets.len() > self.position + 3 {
            let a = self.octets[self.position];
            let b = self.octets[self.position + 1];
            let c = self.octets[self.position + 2];
            let d = self.octets[self.position + 3];
            self.position += 4;
            Some(u32::from_be_bytes([a, b, c, d]))
        } else {
            None
        }
    }

    pub fn take(&mut self, size: usize) -> Option<&'a [u8]> {
        if self.octets.len() >= self.position + size {
            let slice = &self.octets[self.position..self.position + size];
            self.position += size;
            Some(slice)
        } else {
            None
        }
    }

    pub fn at_offset(&self, position: usize) -> ConsumableBuffer<'a> {
        Self {
            octets: self.octets,
            position,
        }
    }
}
