// Minimal DNS protocol implementation for the tunnel
//
// Implements just enough of RFC 1035 and RFC 6891 to:
// - Build recursive A queries carrying an EDNS0 OPT record
// - Parse responses, following name compression pointers
// - Build CNAME answers and error responses on the authoritative side

use bytes::{Buf, BufMut, BytesMut};
use std::io::Cursor;
use thiserror::Error;

pub const TYPE_A: u16 = 1;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_OPT: u16 = 41;
pub const CLASS_IN: u16 = 1;

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_FORMERR: u8 = 1;
pub const RCODE_SERVFAIL: u8 = 2;
pub const RCODE_NXDOMAIN: u8 = 3;
pub const RCODE_REFUSED: u8 = 5;

/// UDP payload size advertised in the OPT record
pub const EDNS_UDP_SIZE: u16 = 4096;

/// Classic DNS message limit without EDNS0
pub const DEFAULT_UDP_SIZE: usize = 512;

const HEADER_LEN: usize = 12;
const MAX_NAME_WIRE_LEN: usize = 255;
const MAX_COMPRESSION_JUMPS: usize = 128;
const MAX_RECORDS: u16 = 64;

const FLAG_QR: u16 = 0x8000;
const FLAG_AA: u16 = 0x0400;
const FLAG_TC: u16 = 0x0200;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;
const OPCODE_MASK: u16 = 0x7800;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    #[error("Invalid DNS message: {0}")]
    InvalidMessage(String),

    #[error("Encoding error: {0}")]
    EncodingError(String),
}

pub type Result<T> = std::result::Result<T, DnsError>;

/// DNS message header (12 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl DnsHeader {
    /// Standard query, recursion desired
    pub fn new_query(id: u16) -> Self {
        Self {
            id,
            flags: FLAG_RD,
            qdcount: 1,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        }
    }

    /// Authoritative response to `query`, copying its opcode and RD bit
    pub fn new_response(query: &DnsHeader, rcode: u8) -> Self {
        Self {
            id: query.id,
            flags: FLAG_QR
                | FLAG_AA
                | (query.flags & (OPCODE_MASK | FLAG_RD))
                | (rcode & 0x0f) as u16,
            qdcount: 0,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        }
    }

    pub fn parse(buf: &mut Cursor<&[u8]>) -> Result<Self> {
        if buf.remaining() < HEADER_LEN {
            return Err(DnsError::InvalidMessage("Header too short".into()));
        }

        Ok(Self {
            id: buf.get_u16(),
            flags: buf.get_u16(),
            qdcount: buf.get_u16(),
            ancount: buf.get_u16(),
            nscount: buf.get_u16(),
            arcount: buf.get_u16(),
        })
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u16(self.id);
        buf.put_u16(self.flags);
        buf.put_u16(self.qdcount);
        buf.put_u16(self.ancount);
        buf.put_u16(self.nscount);
        buf.put_u16(self.arcount);
    }

    pub fn is_response(&self) -> bool {
        (self.flags & FLAG_QR) != 0
    }

    pub fn is_truncated(&self) -> bool {
        (self.flags & FLAG_TC) != 0
    }

    pub fn recursion_desired(&self) -> bool {
        (self.flags & FLAG_RD) != 0
    }

    pub fn recursion_available(&self) -> bool {
        (self.flags & FLAG_RA) != 0
    }

    pub fn rcode(&self) -> u8 {
        (self.flags & 0x000f) as u8
    }
}

/// DNS question
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub qname: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl DnsQuestion {
    pub fn new(qname: &str, qtype: u16) -> Self {
        Self {
            qname: qname.trim_end_matches('.').to_string(),
            qtype,
            qclass: CLASS_IN,
        }
    }

    pub fn parse(msg: &[u8], buf: &mut Cursor<&[u8]>) -> Result<Self> {
        let qname = read_domain_name(msg, buf)?;

        if buf.remaining() < 4 {
            return Err(DnsError::InvalidMessage("Question too short".into()));
        }

        Ok(Self {
            qname,
            qtype: buf.get_u16(),
            qclass: buf.get_u16(),
        })
    }

    pub fn write(&self, buf: &mut BytesMut) -> Result<()> {
        write_domain_name(&self.qname, buf)?;
        buf.put_u16(self.qtype);
        buf.put_u16(self.qclass);
        Ok(())
    }
}

/// Record payload, decoded for the types the tunnel cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    Cname(String),
    Raw(Vec<u8>),
}

/// DNS resource record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: u16,
    /// Class, or the advertised UDP payload size for OPT
    pub rclass: u16,
    pub ttl: u32,
    pub data: RecordData,
}

impl DnsRecord {
    pub fn new_cname(name: &str, target: &str, ttl: u32) -> Self {
        Self {
            name: name.trim_end_matches('.').to_string(),
            rtype: TYPE_CNAME,
            rclass: CLASS_IN,
            ttl,
            data: RecordData::Cname(target.trim_end_matches('.').to_string()),
        }
    }

    /// EDNS0 pseudo-record advertising `udp_size`
    pub fn new_opt(udp_size: u16) -> Self {
        Self {
            name: String::new(),
            rtype: TYPE_OPT,
            rclass: udp_size,
            ttl: 0,
            data: RecordData::Raw(Vec::new()),
        }
    }

    pub fn parse(msg: &[u8], buf: &mut Cursor<&[u8]>) -> Result<Self> {
        let name = read_domain_name(msg, buf)?;

        if buf.remaining() < 10 {
            return Err(DnsError::InvalidMessage("Record too short".into()));
        }

        let rtype = buf.get_u16();
        let rclass = buf.get_u16();
        let ttl = buf.get_u32();
        let rdlen = buf.get_u16() as usize;

        if buf.remaining() < rdlen {
            return Err(DnsError::InvalidMessage("Truncated record data".into()));
        }

        let data = if rtype == TYPE_CNAME {
            let start = buf.position();
            let end = start as usize + rdlen;
            let target = read_domain_name(msg, buf)?;
            if buf.position() as usize > end {
                return Err(DnsError::InvalidMessage("CNAME overruns its record".into()));
            }
            buf.set_position(end as u64);
            RecordData::Cname(target)
        } else {
            let mut rdata = vec![0u8; rdlen];
            buf.copy_to_slice(&mut rdata);
            RecordData::Raw(rdata)
        };

        Ok(Self {
            name,
            rtype,
            rclass,
            ttl,
            data,
        })
    }

    pub fn write(&self, buf: &mut BytesMut) -> Result<()> {
        write_domain_name(&self.name, buf)?;
        buf.put_u16(self.rtype);
        buf.put_u16(self.rclass);
        buf.put_u32(self.ttl);

        let mut rdata = BytesMut::new();
        match &self.data {
            RecordData::Cname(target) => write_domain_name(target, &mut rdata)?,
            RecordData::Raw(raw) => rdata.put_slice(raw),
        }
        if rdata.len() > u16::MAX as usize {
            return Err(DnsError::EncodingError("Record data too long".into()));
        }
        buf.put_u16(rdata.len() as u16);
        buf.put_slice(&rdata);
        Ok(())
    }

    /// Target name if this is a CNAME record
    pub fn cname(&self) -> Option<&str> {
        match &self.data {
            RecordData::Cname(target) if self.rtype == TYPE_CNAME => Some(target),
            _ => None,
        }
    }
}

/// DNS message (complete query or response)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsMessage {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub additionals: Vec<DnsRecord>,
}

impl DnsMessage {
    /// Recursive A query for `name`, advertising a large EDNS0 buffer
    pub fn new_query(name: &str, id: u16) -> Self {
        let mut header = DnsHeader::new_query(id);
        header.arcount = 1;
        Self {
            header,
            questions: vec![DnsQuestion::new(name, TYPE_A)],
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: vec![DnsRecord::new_opt(EDNS_UDP_SIZE)],
        }
    }

    /// Answer `query` with a single CNAME record pointing at `target`
    pub fn cname_response(query: &DnsMessage, target: &str, ttl: u32) -> Self {
        let mut response = Self::error_response(query, RCODE_NOERROR);
        if let Some(question) = query.questions.first() {
            response
                .answers
                .push(DnsRecord::new_cname(&question.qname, target, ttl));
        }
        response.header.ancount = response.answers.len() as u16;
        response
    }

    /// Answer-less response carrying `rcode`, echoing the question
    pub fn error_response(query: &DnsMessage, rcode: u8) -> Self {
        let mut header = DnsHeader::new_response(&query.header, rcode);
        let questions: Vec<DnsQuestion> = query.questions.iter().take(1).cloned().collect();
        let additionals = match query.edns_udp_size() {
            Some(_) => vec![DnsRecord::new_opt(EDNS_UDP_SIZE)],
            None => Vec::new(),
        };
        header.qdcount = questions.len() as u16;
        header.arcount = additionals.len() as u16;
        Self {
            header,
            questions,
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let header = DnsHeader::parse(&mut cursor)?;

        if header.qdcount > MAX_RECORDS
            || header.ancount > MAX_RECORDS
            || header.nscount > MAX_RECORDS
            || header.arcount > MAX_RECORDS
        {
            return Err(DnsError::InvalidMessage("Implausible record count".into()));
        }

        let mut questions = Vec::with_capacity(header.qdcount as usize);
        for _ in 0..header.qdcount {
            questions.push(DnsQuestion::parse(data, &mut cursor)?);
        }

        let mut answers = Vec::with_capacity(header.ancount as usize);
        for _ in 0..header.ancount {
            answers.push(DnsRecord::parse(data, &mut cursor)?);
        }

        let mut authorities = Vec::with_capacity(header.nscount as usize);
        for _ in 0..header.nscount {
            authorities.push(DnsRecord::parse(data, &mut cursor)?);
        }

        let mut additionals = Vec::with_capacity(header.arcount as usize);
        for _ in 0..header.arcount {
            additionals.push(DnsRecord::parse(data, &mut cursor)?);
        }

        Ok(Self {
            header,
            questions,
            answers,
            authorities,
            additionals,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(DEFAULT_UDP_SIZE);

        self.header.write(&mut buf);
        for q in &self.questions {
            q.write(&mut buf)?;
        }
        for record in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
        {
            record.write(&mut buf)?;
        }

        Ok(buf.to_vec())
    }

    pub fn first_question(&self) -> Result<&DnsQuestion> {
        self.questions
            .first()
            .ok_or_else(|| DnsError::InvalidMessage("No questions in message".into()))
    }

    /// UDP payload size the sender advertised via EDNS0, if any
    pub fn edns_udp_size(&self) -> Option<u16> {
        self.additionals
            .iter()
            .find(|r| r.rtype == TYPE_OPT)
            .map(|r| r.rclass)
    }
}

/// Read a domain name, following compression pointers
///
/// Pointers may only jump backwards, which rules out loops; the jump count is
/// capped regardless. The cursor ends up just past the name as it appears at
/// the current position.
fn read_domain_name(msg: &[u8], buf: &mut Cursor<&[u8]>) -> Result<String> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = buf.position() as usize;
    let mut resume_at: Option<usize> = None;
    let mut jumps = 0;
    let mut wire_len = 0;

    loop {
        let len = *msg
            .get(pos)
            .ok_or_else(|| DnsError::InvalidMessage("Truncated domain name".into()))?;

        match len & 0xC0 {
            0x00 => {
                pos += 1;
                if len == 0 {
                    break;
                }

                let end = pos + len as usize;
                let label = msg
                    .get(pos..end)
                    .ok_or_else(|| DnsError::InvalidMessage("Truncated label".into()))?;
                wire_len += label.len() + 1;
                if wire_len > MAX_NAME_WIRE_LEN {
                    return Err(DnsError::InvalidMessage("Domain name too long".into()));
                }

                let label = std::str::from_utf8(label).map_err(|_| {
                    DnsError::InvalidMessage("Invalid UTF-8 in domain name".into())
                })?;
                labels.push(label.to_string());
                pos = end;
            }
            0xC0 => {
                let low = *msg
                    .get(pos + 1)
                    .ok_or_else(|| DnsError::InvalidMessage("Truncated pointer".into()))?;
                let target = (((len & 0x3F) as usize) << 8) | low as usize;
                if target >= pos {
                    return Err(DnsError::InvalidMessage("Forward compression pointer".into()));
                }

                jumps += 1;
                if jumps > MAX_COMPRESSION_JUMPS {
                    return Err(DnsError::InvalidMessage("Too many compression jumps".into()));
                }
                if resume_at.is_none() {
                    resume_at = Some(pos + 2);
                }
                pos = target;
            }
            _ => {
                return Err(DnsError::InvalidMessage("Reserved label type".into()));
            }
        }
    }

    buf.set_position(resume_at.unwrap_or(pos) as u64);
    Ok(labels.join("."))
}

/// Write a domain name without compression
fn write_domain_name(domain: &str, buf: &mut BytesMut) -> Result<()> {
    let domain = domain.trim_end_matches('.');
    if domain.len() + 2 > MAX_NAME_WIRE_LEN {
        return Err(DnsError::EncodingError(format!(
            "Domain name too long: {} characters",
            domain.len()
        )));
    }

    if !domain.is_empty() {
        for label in domain.split('.') {
            let bytes = label.as_bytes();
            if bytes.is_empty() || bytes.len() > 63 {
                return Err(DnsError::EncodingError(format!(
                    "Invalid label length {} in {}",
                    bytes.len(),
                    domain
                )));
            }
            buf.put_u8(bytes.len() as u8);
            buf.put_slice(bytes);
        }
    }
    buf.put_u8(0);
    Ok(())
}
