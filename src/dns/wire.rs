//! RFC 1035 wire format.
//!
//! Decoding accepts compression pointers in names (with a jump budget so a
//! crafted pointer loop cannot spin); encoding writes names uncompressed.
//! Only the record types the server answers with are modeled structurally;
//! everything else is carried as opaque rdata.

use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;

/// Classic DNS over UDP without EDNS caps messages at 512 octets.
pub const MAX_UDP_PAYLOAD: usize = 512;

/// Upper bound accepted from an EDNS payload-size hint.
pub const MAX_EDNS_PAYLOAD: usize = 4096;

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 255;
const MAX_POINTER_JUMPS: usize = 5;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("message ends unexpectedly")]
    UnexpectedEnd,

    #[error("name compression pointer loop")]
    PointerLoop,

    #[error("label exceeds 63 octets")]
    LabelTooLong,

    #[error("name exceeds 255 octets")]
    NameTooLong,
}

/// Response codes this server produces (plus decode of anything else).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rcode {
    NoError,
    FormErr,
    ServFail,
    NxDomain,
    NotImp,
    Refused,
    Other(u8),
}

impl Rcode {
    pub fn to_u8(self) -> u8 {
        match self {
            Rcode::NoError => 0,
            Rcode::FormErr => 1,
            Rcode::ServFail => 2,
            Rcode::NxDomain => 3,
            Rcode::NotImp => 4,
            Rcode::Refused => 5,
            Rcode::Other(code) => code,
        }
    }

    pub fn from_u8(code: u8) -> Self {
        match code {
            0 => Rcode::NoError,
            1 => Rcode::FormErr,
            2 => Rcode::ServFail,
            3 => Rcode::NxDomain,
            4 => Rcode::NotImp,
            5 => Rcode::Refused,
            other => Rcode::Other(other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Rcode::NoError => "NOERROR",
            Rcode::FormErr => "FORMERR",
            Rcode::ServFail => "SERVFAIL",
            Rcode::NxDomain => "NXDOMAIN",
            Rcode::NotImp => "NOTIMP",
            Rcode::Refused => "REFUSED",
            Rcode::Other(_) => "OTHER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    Aaaa,
    Opt,
    Any,
    Other(u16),
}

impl RecordType {
    pub fn to_u16(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Aaaa => 28,
            RecordType::Opt => 41,
            RecordType::Any => 255,
            RecordType::Other(code) => code,
        }
    }

    pub fn from_u16(code: u16) -> Self {
        match code {
            1 => RecordType::A,
            28 => RecordType::Aaaa,
            41 => RecordType::Opt,
            255 => RecordType::Any,
            other => RecordType::Other(other),
        }
    }
}

pub const CLASS_IN: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub response: bool,
    pub opcode: u8,
    pub authoritative: bool,
    pub truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub rcode: Rcode,
    pub question_count: u16,
    pub answer_count: u16,
    pub authority_count: u16,
    pub additional_count: u16,
}

impl Header {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        let id = reader.read_u16()?;
        let flags = reader.read_u16()?;
        Ok(Self {
            id,
            response: flags & 0x8000 != 0,
            opcode: ((flags >> 11) & 0x0F) as u8,
            authoritative: flags & 0x0400 != 0,
            truncated: flags & 0x0200 != 0,
            recursion_desired: flags & 0x0100 != 0,
            recursion_available: flags & 0x0080 != 0,
            rcode: Rcode::from_u8((flags & 0x000F) as u8),
            question_count: reader.read_u16()?,
            answer_count: reader.read_u16()?,
            authority_count: reader.read_u16()?,
            additional_count: reader.read_u16()?,
        })
    }

    fn flags(&self) -> u16 {
        let mut flags = 0u16;
        if self.response {
            flags |= 0x8000;
        }
        flags |= ((self.opcode & 0x0F) as u16) << 11;
        if self.authoritative {
            flags |= 0x0400;
        }
        if self.truncated {
            flags |= 0x0200;
        }
        if self.recursion_desired {
            flags |= 0x0100;
        }
        if self.recursion_available {
            flags |= 0x0080;
        }
        flags | (self.rcode.to_u8() & 0x0F) as u16
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: RecordType,
    pub qclass: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Opaque(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub rtype: RecordType,
    pub class: u16,
    pub ttl: u32,
    pub data: RecordData,
}

impl Record {
    pub fn a(name: &str, ttl: u32, address: Ipv4Addr) -> Self {
        Self {
            name: name.to_string(),
            rtype: RecordType::A,
            class: CLASS_IN,
            ttl,
            data: RecordData::A(address),
        }
    }

    pub fn aaaa(name: &str, ttl: u32, address: Ipv6Addr) -> Self {
        Self {
            name: name.to_string(),
            rtype: RecordType::Aaaa,
            class: CLASS_IN,
            ttl,
            data: RecordData::Aaaa(address),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub authorities: Vec<Record>,
    pub additionals: Vec<Record>,
}

impl Message {
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(buf);
        let header = Header::decode(&mut reader)?;

        let mut questions = Vec::with_capacity(header.question_count as usize);
        for _ in 0..header.question_count {
            let name = reader.read_name()?;
            let qtype = RecordType::from_u16(reader.read_u16()?);
            let qclass = reader.read_u16()?;
            questions.push(Question {
                name,
                qtype,
                qclass,
            });
        }

        let answers = read_records(&mut reader, header.answer_count)?;
        let authorities = read_records(&mut reader, header.authority_count)?;
        let additionals = read_records(&mut reader, header.additional_count)?;

        Ok(Self {
            header,
            questions,
            answers,
            authorities,
            additionals,
        })
    }

    /// Encode the message, dropping answer records that do not fit within
    /// `limit` octets. Returns the wire bytes; the TC bit is set in them if
    /// anything was dropped.
    pub fn encode(&self, limit: usize) -> Result<Vec<u8>, WireError> {
        let mut writer = Writer::new();

        let mut header = self.header.clone();
        writer.write_u16(header.id);
        let flags_pos = writer.len();
        writer.write_u16(header.flags());
        writer.write_u16(self.questions.len() as u16);
        let answer_count_pos = writer.len();
        writer.write_u16(self.answers.len() as u16);
        writer.write_u16(self.authorities.len() as u16);
        writer.write_u16(self.additionals.len() as u16);

        for question in &self.questions {
            writer.write_name(&question.name)?;
            writer.write_u16(question.qtype.to_u16());
            writer.write_u16(question.qclass);
        }

        let mut written = 0u16;
        for record in &self.answers {
            let rollback = writer.len();
            write_record(&mut writer, record)?;
            if writer.len() > limit {
                writer.truncate(rollback);
                header.truncated = true;
                break;
            }
            written += 1;
        }

        for record in self.authorities.iter().chain(&self.additionals) {
            write_record(&mut writer, record)?;
        }

        if header.truncated {
            writer.patch_u16(flags_pos, header.flags());
            writer.patch_u16(answer_count_pos, written);
        }

        Ok(writer.into_bytes())
    }

    /// EDNS0 payload-size hint from an OPT record in the additional
    /// section, clamped to a sane range. `None` when the query carries no
    /// OPT.
    pub fn edns_payload_size(&self) -> Option<usize> {
        self.additionals
            .iter()
            .find(|r| r.rtype == RecordType::Opt)
            // For OPT the class field carries the requested payload size
            .map(|r| {
                (r.class as usize)
                    .max(MAX_UDP_PAYLOAD)
                    .min(MAX_EDNS_PAYLOAD)
            })
    }
}

fn read_records(reader: &mut Reader<'_>, count: u16) -> Result<Vec<Record>, WireError> {
    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = reader.read_name()?;
        let rtype = RecordType::from_u16(reader.read_u16()?);
        let class = reader.read_u16()?;
        let ttl = reader.read_u32()?;
        let rdlength = reader.read_u16()? as usize;
        let rdata = reader.read_slice(rdlength)?;

        let data = match rtype {
            RecordType::A if rdlength == 4 => {
                RecordData::A(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]))
            }
            RecordType::Aaaa if rdlength == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                RecordData::Aaaa(Ipv6Addr::from(octets))
            }
            _ => RecordData::Opaque(rdata.to_vec()),
        };

        records.push(Record {
            name,
            rtype,
            class,
            ttl,
            data,
        });
    }
    Ok(records)
}

fn write_record(writer: &mut Writer, record: &Record) -> Result<(), WireError> {
    writer.write_name(&record.name)?;
    writer.write_u16(record.rtype.to_u16());
    writer.write_u16(record.class);
    writer.write_u32(record.ttl);
    match &record.data {
        RecordData::A(address) => {
            writer.write_u16(4);
            writer.write_bytes(&address.octets());
        }
        RecordData::Aaaa(address) => {
            writer.write_u16(16);
            writer.write_bytes(&address.octets());
        }
        RecordData::Opaque(bytes) => {
            writer.write_u16(bytes.len() as u16);
            writer.write_bytes(bytes);
        }
    }
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        let byte = *self.buf.get(self.pos).ok_or(WireError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16, WireError> {
        Ok(((self.read_u8()? as u16) << 8) | self.read_u8()? as u16)
    }

    fn read_u32(&mut self) -> Result<u32, WireError> {
        Ok(((self.read_u16()? as u32) << 16) | self.read_u16()? as u32)
    }

    fn read_slice(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos.checked_add(len).ok_or(WireError::UnexpectedEnd)?;
        let slice = self.buf.get(self.pos..end).ok_or(WireError::UnexpectedEnd)?;
        self.pos = end;
        Ok(slice)
    }

    /// Read a possibly-compressed name into dotted form (no trailing dot
    /// for the root handling; "" decodes the root name).
    fn read_name(&mut self) -> Result<String, WireError> {
        let mut name = String::new();
        let mut pos = self.pos;
        let mut jumps = 0usize;
        let mut after_first_jump: Option<usize> = None;

        loop {
            let len = *self.buf.get(pos).ok_or(WireError::UnexpectedEnd)?;

            if len & 0xC0 == 0xC0 {
                if jumps >= MAX_POINTER_JUMPS {
                    return Err(WireError::PointerLoop);
                }
                let low = *self.buf.get(pos + 1).ok_or(WireError::UnexpectedEnd)?;
                if after_first_jump.is_none() {
                    after_first_jump = Some(pos + 2);
                }
                pos = (((len & 0x3F) as usize) << 8) | low as usize;
                jumps += 1;
                continue;
            }

            let len = len as usize;
            pos += 1;
            if len == 0 {
                break;
            }
            if len > MAX_LABEL_LEN {
                return Err(WireError::LabelTooLong);
            }

            let label = self
                .buf
                .get(pos..pos + len)
                .ok_or(WireError::UnexpectedEnd)?;
            if !name.is_empty() {
                name.push('.');
            }
            // Labels are ASCII on the happy path; anything else is carried
            // through lossily and will simply fail the registry lookup
            name.push_str(&String::from_utf8_lossy(label));
            pos += len;

            if name.len() > MAX_NAME_LEN {
                return Err(WireError::NameTooLong);
            }
        }

        self.pos = after_first_jump.unwrap_or(pos);
        Ok(name)
    }
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self {
            buf: Vec::with_capacity(MAX_UDP_PAYLOAD),
        }
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn patch_u16(&mut self, pos: usize, value: u16) {
        self.buf[pos..pos + 2].copy_from_slice(&value.to_be_bytes());
    }

    /// Write a name as uncompressed length-prefixed labels.
    fn write_name(&mut self, name: &str) -> Result<(), WireError> {
        let trimmed = name.trim_end_matches('.');
        if trimmed.len() > MAX_NAME_LEN {
            return Err(WireError::NameTooLong);
        }
        if !trimmed.is_empty() {
            for label in trimmed.split('.') {
                if label.len() > MAX_LABEL_LEN {
                    return Err(WireError::LabelTooLong);
                }
                self.write_u8(label.len() as u8);
                self.write_bytes(label.as_bytes());
            }
        }
        self.write_u8(0);
        Ok(())
    }
}

/// Build a query message (client side of the codec; used by tests and by
/// operators poking the server with the library).
pub fn query(id: u16, name: &str, qtype: RecordType) -> Message {
    Message {
        header: Header {
            id,
            response: false,
            opcode: 0,
            authoritative: false,
            truncated: false,
            recursion_desired: true,
            recursion_available: false,
            rcode: Rcode::NoError,
            question_count: 1,
            answer_count: 0,
            authority_count: 0,
            additional_count: 0,
        },
        questions: vec![Question {
            name: name.to_string(),
            qtype,
            qclass: CLASS_IN,
        }],
        answers: Vec::new(),
        authorities: Vec::new(),
        additionals: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_round_trip() {
        let message = query(0x1234, "app.example.com", RecordType::A);
        let bytes = message.encode(MAX_UDP_PAYLOAD).unwrap();
        let decoded = Message::decode(&bytes).unwrap();

        assert_eq!(decoded.header.id, 0x1234);
        assert!(!decoded.header.response);
        assert!(decoded.header.recursion_desired);
        assert_eq!(decoded.questions.len(), 1);
        assert_eq!(decoded.questions[0].name, "app.example.com");
        assert_eq!(decoded.questions[0].qtype, RecordType::A);
        assert_eq!(decoded.questions[0].qclass, CLASS_IN);
    }

    #[test]
    fn test_response_round_trip_with_answers() {
        let mut message = query(7, "app.example.com", RecordType::A);
        message.header.response = true;
        message.header.authoritative = true;
        message.answers.push(Record::a(
            "app.example.com",
            30,
            "10.0.1.10".parse().unwrap(),
        ));
        message.answers.push(Record::aaaa(
            "app.example.com",
            30,
            "2001:db8::1".parse().unwrap(),
        ));
        message.header.answer_count = 2;

        let bytes = message.encode(MAX_UDP_PAYLOAD).unwrap();
        let decoded = Message::decode(&bytes).unwrap();

        assert!(decoded.header.authoritative);
        assert_eq!(decoded.answers.len(), 2);
        assert_eq!(
            decoded.answers[0].data,
            RecordData::A("10.0.1.10".parse().unwrap())
        );
        assert_eq!(decoded.answers[0].ttl, 30);
        assert_eq!(
            decoded.answers[1].data,
            RecordData::Aaaa("2001:db8::1".parse().unwrap())
        );
    }

    #[test]
    fn test_decode_compressed_name() {
        // Query for app.example.com followed by an answer whose name is a
        // pointer back to offset 12
        let mut buf = Vec::new();
        buf.extend_from_slice(&0x00a1u16.to_be_bytes());
        buf.extend_from_slice(&0x8400u16.to_be_bytes()); // QR|AA
        buf.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
        buf.extend_from_slice(&1u16.to_be_bytes()); // ANCOUNT
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        for label in ["app", "example", "com"] {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
        buf.push(0);
        buf.extend_from_slice(&1u16.to_be_bytes()); // QTYPE A
        buf.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN
        buf.extend_from_slice(&[0xC0, 12]); // pointer to the question name
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&60u32.to_be_bytes());
        buf.extend_from_slice(&4u16.to_be_bytes());
        buf.extend_from_slice(&[10, 0, 1, 10]);

        let decoded = Message::decode(&buf).unwrap();
        assert_eq!(decoded.answers[0].name, "app.example.com");
        assert_eq!(
            decoded.answers[0].data,
            RecordData::A("10.0.1.10".parse().unwrap())
        );
    }

    #[test]
    fn test_decode_pointer_loop_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&[0xC0, 12]); // points at itself
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());

        assert_eq!(Message::decode(&buf), Err(WireError::PointerLoop));
    }

    #[test]
    fn test_decode_short_buffer_rejected() {
        let message = query(9, "app.example.com", RecordType::A);
        let bytes = message.encode(MAX_UDP_PAYLOAD).unwrap();
        assert_eq!(
            Message::decode(&bytes[..bytes.len() - 3]),
            Err(WireError::UnexpectedEnd)
        );
        assert_eq!(Message::decode(&[0x12]), Err(WireError::UnexpectedEnd));
    }

    #[test]
    fn test_encode_rejects_oversized_label() {
        let long_label = "a".repeat(64);
        let message = query(1, &format!("{long_label}.example.com"), RecordType::A);
        assert_eq!(
            message.encode(MAX_UDP_PAYLOAD),
            Err(WireError::LabelTooLong)
        );
    }

    #[test]
    fn test_truncation_drops_answers_and_sets_tc() {
        let mut message = query(3, "app.example.com", RecordType::A);
        message.header.response = true;
        for i in 0..40 {
            message
                .answers
                .push(Record::a("app.example.com", 30, Ipv4Addr::new(10, 0, 1, i)));
        }
        message.header.answer_count = 40;

        let bytes = message.encode(MAX_UDP_PAYLOAD).unwrap();
        assert!(bytes.len() <= MAX_UDP_PAYLOAD);

        let decoded = Message::decode(&bytes).unwrap();
        assert!(decoded.header.truncated);
        assert!(decoded.answers.len() < 40);
        assert!(!decoded.answers.is_empty());
    }

    #[test]
    fn test_edns_payload_size_hint() {
        let mut message = query(4, "app.example.com", RecordType::A);
        message.additionals.push(Record {
            name: String::new(),
            rtype: RecordType::Opt,
            class: 1232, // requested payload size
            ttl: 0,
            data: RecordData::Opaque(Vec::new()),
        });
        message.header.additional_count = 1;

        let bytes = message.encode(MAX_UDP_PAYLOAD).unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded.edns_payload_size(), Some(1232));

        let plain = query(5, "app.example.com", RecordType::A);
        assert_eq!(plain.edns_payload_size(), None);
    }

    #[test]
    fn test_edns_hint_is_clamped() {
        let mut message = query(6, "app.example.com", RecordType::A);
        message.additionals.push(Record {
            name: String::new(),
            rtype: RecordType::Opt,
            class: 200, // below the classic minimum
            ttl: 0,
            data: RecordData::Opaque(Vec::new()),
        });
        assert_eq!(message.edns_payload_size(), Some(MAX_UDP_PAYLOAD));

        message.additionals[0].class = 65000;
        assert_eq!(message.edns_payload_size(), Some(MAX_EDNS_PAYLOAD));
    }

    #[test]
    fn test_root_name_round_trip() {
        let message = query(8, ".", RecordType::A);
        let bytes = message.encode(MAX_UDP_PAYLOAD).unwrap();
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded.questions[0].name, "");
    }
}
