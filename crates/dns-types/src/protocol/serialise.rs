//! Serialisation of DNS messages to the wire format.  See the `types`
//! module for details of the format.

use std::collections::HashMap;

use crate::protocol::types::*;

impl Message {
    /// # Errors
    ///
    /// If the message is invalid (the `Message` type permits more
    /// states than strictly allowed).
    pub fn into_octets(self) -> Result<Vec<u8>, Error> {
        let mut buffer = WritableBuffer::default();
        self.serialise(&mut buffer)?;
        Ok(buffer.octets)
    }

    /// # Errors
    ///
    /// If the message is invalid (the `Message` type permits more
    /// states than strictly allowed).
    pub fn serialise(self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        let qdcount = usize_to_u16(self.questions.len())?;
        let ancount = usize_to_u16(self.answers.len())?;
        let nscount = usize_to_u16(self.authority.len())?;
        let arcount = usize_to_u16(self.additional.len())?;

        self.header.serialise(buffer);
        buffer.write_u16(qdcount);
        buffer.write_u16(ancount);
        buffer.write_u16(nscount);
        buffer.write_u16(arcount);

        for question in self.questions {
            question.serialise(buffer);
        }
        for rr in self.answers {
            rr.serialise(buffer)?;
        }
        for rr in self.authority {
            rr.serialise(buffer)?;
        }
        for rr in self.additional {
            rr.serialise(buffer)?;
        }

        Ok(())
    }
}

impl Header {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        // octet 1
        let flag_qr = if self.is_response { HEADER_MASK_QR } else { 0 };
        let field_opcode = HEADER_MASK_OPCODE & (u8::from(self.opcode) << HEADER_OFFSET_OPCODE);
        let flag_aa = if self.is_authoritative {
            HEADER_MASK_AA
        } else {
            0
        };
        let flag_tc = if self.is_truncated { HEADER_MASK_TC } else { 0 };
        let flag_rd = if self.recursion_desired {
            HEADER_MASK_RD
        } else {
            0
        };
        // octet 2
        let flag_ra = if self.recursion_available {
            HEADER_MASK_RA
        } else {
            0
        };
        let flag_z = if self.z { HEADER_MASK_Z } else { 0 };
        let flag_ad = if self.authentic_data { HEADER_MASK_AD } else { 0 };
        let flag_cd = if self.checking_disabled {
            HEADER_MASK_CD
        } else {
            0
        };
        let field_rcode = HEADER_MASK_RCODE & (u8::from(self.rcode) << HEADER_OFFSET_RCODE);

        buffer.write_u16(self.id);
        buffer.write_u8(flag_qr | field_opcode | flag_aa | flag_tc | flag_rd);
        buffer.write_u8(flag_ra | flag_z | flag_ad | flag_cd | field_rcode);
    }
}

impl Question {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        self.name.serialise(buffer);
        self.qtype.serialise(buffer);
        buffer.write_u16(self.qclass.into());
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the RDATA is too long.
    pub fn serialise(self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        self.name.serialise(buffer);
        self.rtype_with_data.rtype().serialise(buffer);

        let raw_rclass: u16 = self.rclass.into();
        let raw_rclass = if self.is_unique {
            raw_rclass | 0x8000
        } else {
            raw_rclass
        };
        buffer.write_u16(raw_rclass);
        buffer.write_u32(self.ttl);

        // filled in below
        let rdlength_index = buffer.index();
        buffer.write_u16(0);

        self.rtype_with_data.serialise_rdata(buffer);

        // -2 so we don't also include the 2 octets for the rdlength
        let rdlength = usize_to_u16(buffer.index() - rdlength_index - 2)?;
        let [hi, lo] = rdlength.to_be_bytes();
        buffer.octets[rdlength_index] = hi;
        buffer.octets[rdlength_index + 1] = lo;

        Ok(())
    }
}

impl RecordTypeWithData {
    fn serialise_rdata(self, buffer: &mut WritableBuffer) {
        match self {
            RecordTypeWithData::A { address } => buffer.write_octets(&address.octets()),
            RecordTypeWithData::AAAA { address } => buffer.write_octets(&address.octets()),
            RecordTypeWithData::PTR { ptrdname } => ptrdname.serialise(buffer),
            RecordTypeWithData::TXT { attributes } => write_txt_attributes(&attributes, buffer),
            RecordTypeWithData::SRV {
                priority,
                weight,
                port,
                target,
            } => {
                buffer.write_u16(priority);
                buffer.write_u16(weight);
                buffer.write_u16(port);
                target.serialise(buffer);
            }
            RecordTypeWithData::NSEC { next_domain, types } => {
                next_domain.serialise(buffer);
                write_nsec_bitmap(&types, buffer);
            }
            RecordTypeWithData::Unknown { octets, .. } => buffer.write_octets(&octets),
        }
    }

    /// Encode the RDATA with no name compression at all, for canonical
    /// comparison (RFC 6762 section 8.2 tie-break, known-answer matching).
    pub fn serialise_uncompressed(self, buffer: &mut WritableBuffer) {
        match self {
            RecordTypeWithData::PTR { ptrdname } => ptrdname.serialise_uncompressed_into(buffer),
            RecordTypeWithData::SRV {
                priority,
                weight,
                port,
                target,
            } => {
                buffer.write_u16(priority);
                buffer.write_u16(weight);
                buffer.write_u16(port);
                target.serialise_uncompressed_into(buffer);
            }
            RecordTypeWithData::NSEC { next_domain, types } => {
                next_domain.serialise_uncompressed_into(buffer);
                write_nsec_bitmap(&types, buffer);
            }
            other => other.serialise_rdata(buffer),
        }
    }
}

fn write_txt_attributes(attributes: &[(String, TxtValue)], buffer: &mut WritableBuffer) {
    if attributes.is_empty() {
        // an empty TXT record is still one zero-length string on the wire
        buffer.write_u8(0);
        return;
    }
    for (key, value) in attributes {
        let mut item = key.clone().into_bytes();
        match value {
            TxtValue::Present => {}
            TxtValue::Empty => item.push(b'='),
            TxtValue::Bytes(bytes) => {
                item.push(b'=');
                item.extend_from_slice(bytes);
            }
        }
        buffer.write_u8(item.len() as u8);
        buffer.write_octets(&item);
    }
}

fn write_nsec_bitmap(types: &[RecordType], buffer: &mut WritableBuffer) {
    let mut bitmap = [0u8; 32];
    let mut highest_byte = 0usize;
    for rtype in types {
        let value: u16 = (*rtype).into();
        if value > 255 {
            continue;
        }
        let byte_index = (value / 8) as usize;
        let bit = 7 - (value % 8);
        bitmap[byte_index] |= 1 << bit;
        highest_byte = highest_byte.max(byte_index);
    }
    let bitmap_len = highest_byte + 1;
    buffer.write_u8(0); // window block 0
    buffer.write_u8(bitmap_len as u8);
    buffer.write_octets(&bitmap[..bitmap_len]);
}

impl DomainName {
    /// Serialise using compression: labels are written as pointers back to
    /// an earlier occurrence of the same label suffix where possible.
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        let mut labels = self.labels.as_slice();
        loop {
            if labels.is_empty() {
                buffer.write_u8(0);
                return;
            }

            let key: Vec<Vec<u8>> = labels.iter().map(|l| ascii_lower(l)).collect();
            if let Some(&pointer) = buffer.name_offsets.get(&key) {
                let pointer = pointer | 0xc000;
                buffer.write_u16(pointer);
                return;
            }

            // only offsets that fit in the 14 bit pointer field are usable
            // as compression targets.
            if buffer.index() < 0x4000 {
                buffer.name_offsets.insert(key, buffer.index() as u16);
            }

            let label = &labels[0];
            buffer.write_u8(label.len() as u8);
            buffer.write_octets(label);
            labels = &labels[1..];
        }
    }

    /// Serialise without consulting or updating the compression table, for
    /// RDATA that must stay byte-identical regardless of what preceded it
    /// in the message (SRV target, NSEC next domain, canonical comparison).
    pub fn serialise_uncompressed_into(&self, buffer: &mut WritableBuffer) {
        for label in &self.labels {
            buffer.write_u8(label.len() as u8);
            buffer.write_octets(label);
        }
        buffer.write_u8(0);
    }
}

fn ascii_lower(label: &[u8]) -> Vec<u8> {
    label.iter().map(|b| b.to_ascii_lowercase()).collect()
}

impl QueryType {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

impl RecordType {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

/// Errors encountered when serialising a message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// A counter does not fit in the desired width.
    CounterTooLarge { counter: usize, bits: u32 },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CounterTooLarge { counter, bits } => {
                write!(f, "'{counter}' cannot be converted to a u{bits}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// A buffer which can be written to, for serialisation purposes.
pub struct WritableBuffer {
    pub octets: Vec<u8>,
    /// Maps a lowercased label suffix to the offset of its first
    /// occurrence, for name compression (RFC 1035 section 4.1.4).
    name_offsets: HashMap<Vec<Vec<u8>>, u16>,
}

impl Default for WritableBuffer {
    fn default() -> Self {
        Self {
            octets: Vec::with_capacity(512),
            name_offsets: HashMap::new(),
        }
    }
}

impl WritableBuffer {
    pub fn index(&self) -> usize {
        self.octets.len()
    }

    pub fn write_u8(&mut self, octet: u8) {
        self.octets.push(octet);
    }

    pub fn write_u16(&mut self, value: u16) {
        for octet in value.to_be_bytes() {
            self.octets.push(octet);
        }
    }

    pub fn write_u32(&mut self, value: u32) {
        for octet in value.to_be_bytes() {
            self.octets.push(octet);
        }
    }

    pub fn write_octets(&mut self, octets: &[u8]) {
        for octet in octets {
            self.octets.push(*octet);
        }
    }
}

/// Helper function to convert a `usize` into a `u16` (or return an error).
///
/// # Errors
///
/// If the value cannot be converted.
fn usize_to_u16(counter: usize) -> Result<u16, Error> {
    if let Ok(t) = u16::try_from(counter) {
        Ok(t)
    } else {
        Err(Error::CounterTooLarge {
            counter,
            bits: u16::BITS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::test_util::*;

    #[test]
    #[rustfmt::skip]
    fn test_sets_rdlength() {
        let mut buf = WritableBuffer::default();
        buf.write_u8(1);
        buf.write_u8(2);
        buf.write_u8(3);
        buf.write_u8(4);

        // target's domain shares no suffix with the owner name, so this
        // exercises rdlength accounting without also exercising compression.
        let rr = ResourceRecord {
            name: domain("www.example.com."),
            rtype_with_data: RecordTypeWithData::SRV {
                priority: 0,
                weight: 0,
                port: 80,
                target: domain("target.example.net."),
            },
            rclass: RecordClass::Internet,
            ttl: 300,
            is_unique: true,
        };
        let _ = rr.serialise(&mut buf);

        assert_eq!(
            vec![
                1, 2, 3, 4,
                // NAME
                3, 119, 119, 119, // "www"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
                // TYPE
                0b0000_0000, 0b0010_0001, // SRV
                // CLASS (with cache-flush bit set)
                0b1000_0000, 0b0000_0001, // IN | flush
                // TTL
                0b0000_0000, 0b0000_0000, 0b0000_0001, 0b0010_1100, // 300
                // RDLENGTH
                0b0000_0000, 0b0001_1010, // 26 octets
                // RDATA
                0, 0, // priority
                0, 0, // weight
                0, 80, // port
                6, 116, 97, 114, 103, 101, 116, // "target"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 110, 101, 116, 0, // "net"
            ],
            buf.octets,
        );
    }

    #[test]
    fn test_srv_target_is_compressed_against_owner_name() {
        let mut buf = WritableBuffer::default();
        let rr = ResourceRecord {
            name: domain("host.example.com."),
            rtype_with_data: RecordTypeWithData::SRV {
                priority: 0,
                weight: 0,
                port: 80,
                target: domain("other.example.com."),
            },
            rclass: RecordClass::Internet,
            ttl: 300,
            is_unique: true,
        };
        let _ = rr.serialise(&mut buf);

        // "example.com." was already written as part of the owner name, so
        // the target's tail should be a pointer back into it rather than a
        // second copy of those labels.
        let pointer_bytes = &buf.octets[buf.octets.len() - 2..];
        let pointer = u16::from_be_bytes([pointer_bytes[0], pointer_bytes[1]]);
        assert_eq!(pointer & 0xc000, 0xc000);
    }

    #[test]
    fn test_compresses_repeated_suffix() {
        let mut buffer = WritableBuffer::default();
        domain("a.example.com.").serialise(&mut buffer);
        let first_len = buffer.index();
        domain("b.example.com.").serialise(&mut buffer);

        // the second name should be: 1 length byte + "b" + a 2 byte pointer,
        // much shorter than writing "example.com." out again.
        assert_eq!(buffer.index(), first_len + 1 + 1 + 2);
        let pointer = u16::from_be_bytes([buffer.octets[first_len + 2], buffer.octets[first_len + 3]]);
        assert_eq!(pointer & 0xc000, 0xc000);
    }

    #[test]
    fn test_txt_tristate_roundtrip() {
        use crate::protocol::deserialise::ConsumableBuffer;

        let rr = ResourceRecord {
            name: domain("_http._tcp.local."),
            rtype_with_data: RecordTypeWithData::TXT {
                attributes: vec![
                    ("flag".to_string(), TxtValue::Present),
                    ("cleared".to_string(), TxtValue::Empty),
                    ("path".to_string(), TxtValue::Bytes(b"/index.html".to_vec())),
                ],
            },
            rclass: RecordClass::Internet,
            ttl: 4500,
            is_unique: true,
        };

        let mut buffer = WritableBuffer::default();
        rr.clone().serialise(&mut buffer).unwrap();

        let decoded = ResourceRecord::deserialise(0, &mut ConsumableBuffer::new(&buffer.octets)).unwrap();
        assert_eq!(decoded, rr);
    }
}
