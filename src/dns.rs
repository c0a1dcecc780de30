//! DNS message parsing and construction.

use std::borrow::Cow;
use std::net::{Ipv4Addr, Ipv6Addr};

use rustc_hash::FxHashMap;
use thiserror::Error;

pub const HEADER_LEN: usize = 12;

/// Smallest payload every DNS client accepts over UDP.
pub const MIN_UDP_PAYLOAD: usize = 512;
/// Upper bound we are willing to send over UDP, whatever EDNS advertises.
pub const MAX_UDP_PAYLOAD: usize = 4096;

const MAX_NAME_LEN: usize = 255;
const MAX_POINTER_JUMPS: usize = 64;

const FLAG_QR: u16 = 0x8000;
const FLAG_AA: u16 = 0x0400;
const FLAG_TC: u16 = 0x0200;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;
const FLAG_CD: u16 = 0x0010;
const OPCODE_MASK: u16 = 0x7800;
const RCODE_MASK: u16 = 0x000F;

/// Record types the proxy cares about.
pub mod rtype {
    pub const A: u16 = 1;
    pub const NS: u16 = 2;
    pub const CNAME: u16 = 5;
    pub const SOA: u16 = 6;
    pub const PTR: u16 = 12;
    pub const MX: u16 = 15;
    pub const TXT: u16 = 16;
    pub const AAAA: u16 = 28;
    pub const SRV: u16 = 33;
    pub const OPT: u16 = 41;
    pub const ANY: u16 = 255;
}

/// Record classes.
pub mod class {
    pub const IN: u16 = 1;
    pub const CH: u16 = 3;
    pub const HS: u16 = 4;
    pub const ANY: u16 = 255;
}

/// Response codes.
pub mod rcode {
    pub const NOERROR: u8 = 0;
    pub const FORMERR: u8 = 1;
    pub const SERVFAIL: u8 = 2;
}

/// Mnemonic for a record type, `TYPE<n>` when unknown.
pub fn type_name(value: u16) -> Cow<'static, str> {
    let name = match value {
        rtype::A => "A",
        rtype::NS => "NS",
        rtype::CNAME => "CNAME",
        rtype::SOA => "SOA",
        rtype::PTR => "PTR",
        rtype::MX => "MX",
        rtype::TXT => "TXT",
        rtype::AAAA => "AAAA",
        rtype::SRV => "SRV",
        rtype::OPT => "OPT",
        rtype::ANY => "ANY",
        other => return Cow::Owned(format!("TYPE{other}")),
    };
    Cow::Borrowed(name)
}

/// Mnemonic for a record class, `CLASS<n>` when unknown.
pub fn class_name(value: u16) -> Cow<'static, str> {
    let name = match value {
        class::IN => "IN",
        class::CH => "CH",
        class::HS => "HS",
        class::ANY => "ANY",
        other => return Cow::Owned(format!("CLASS{other}")),
    };
    Cow::Borrowed(name)
}

/// Errors raised while decoding a message from the wire.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("message truncated")]
    Truncated,

    #[error("invalid label in domain name")]
    InvalidLabel,

    #[error("compression pointer loop")]
    PointerLoop,

    #[error("domain name exceeds 255 octets")]
    NameTooLong,

    #[error("malformed rdata for record type {rtype}")]
    BadRdata { rtype: u16 },
}

/// A DNS question section entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub domain: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// Decoded record data.
///
/// Types that embed domain names are decoded so that a re-encoded
/// message never carries compression pointers into the original packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(String),
    Ns(String),
    Ptr(String),
    Mx {
        preference: u16,
        exchange: String,
    },
    Soa {
        mname: String,
        rname: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    Other(Vec<u8>),
}

/// A DNS resource record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: RData,
}

impl DnsRecord {
    pub fn a(name: &str, ttl: u32, addr: Ipv4Addr) -> Self {
        Self {
            name: name.to_string(),
            rtype: rtype::A,
            class: class::IN,
            ttl,
            rdata: RData::A(addr),
        }
    }

    pub fn aaaa(name: &str, ttl: u32, addr: Ipv6Addr) -> Self {
        Self {
            name: name.to_string(),
            rtype: rtype::AAAA,
            class: class::IN,
            ttl,
            rdata: RData::Aaaa(addr),
        }
    }
}

/// A complete DNS message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsMessage {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub additionals: Vec<DnsRecord>,
}

impl DnsMessage {
    /// Build a recursion-desired IN query for a single name.
    pub fn query(id: u16, domain: &str, qtype: u16) -> Self {
        Self {
            id,
            flags: FLAG_RD,
            questions: vec![DnsQuestion {
                domain: domain.trim_end_matches('.').to_string(),
                qtype,
                qclass: class::IN,
            }],
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        }
    }

    /// Create an empty NOERROR reply to `request`.
    ///
    /// Copies the ID and opcode, sets QR, carries RD and CD over and echoes
    /// the first question.
    pub fn reply_to(request: &DnsMessage) -> Self {
        let flags = FLAG_QR | (request.flags & (OPCODE_MASK | FLAG_RD | FLAG_CD));
        Self {
            id: request.id,
            flags,
            questions: request.questions.iter().take(1).cloned().collect(),
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        }
    }

    /// Create an empty reply to `request` carrying `code`.
    pub fn failure(request: &DnsMessage, code: u8) -> Self {
        let mut message = Self::reply_to(request);
        message.set_rcode(code);
        message
    }

    /// Build a FORMERR reply from the raw header of an unparsable packet.
    pub fn format_error(packet: &[u8]) -> Option<Self> {
        if packet.len() < HEADER_LEN {
            return None;
        }
        let id = u16::from_be_bytes([packet[0], packet[1]]);
        let flags = u16::from_be_bytes([packet[2], packet[3]]);
        if flags & FLAG_QR != 0 {
            return None;
        }
        Some(Self {
            id,
            flags: FLAG_QR | (flags & (OPCODE_MASK | FLAG_RD)) | rcode::FORMERR as u16,
            questions: Vec::new(),
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        })
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }

    pub fn authoritative(&self) -> bool {
        self.flags & FLAG_AA != 0
    }

    pub fn set_authoritative(&mut self, on: bool) {
        self.set_flag(FLAG_AA, on);
    }

    pub fn truncated_flag(&self) -> bool {
        self.flags & FLAG_TC != 0
    }

    pub fn recursion_available(&self) -> bool {
        self.flags & FLAG_RA != 0
    }

    pub fn set_recursion_available(&mut self, on: bool) {
        self.set_flag(FLAG_RA, on);
    }

    pub fn rcode(&self) -> u8 {
        (self.flags & RCODE_MASK) as u8
    }

    pub fn set_rcode(&mut self, code: u8) {
        self.flags = (self.flags & !RCODE_MASK) | (code as u16 & RCODE_MASK);
    }

    fn set_flag(&mut self, flag: u16, on: bool) {
        if on {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    /// UDP payload size the sender can receive (EDNS0 OPT class).
    pub fn udp_payload_size(&self) -> usize {
        self.additionals
            .iter()
            .find(|r| r.rtype == rtype::OPT)
            .map(|opt| (opt.class as usize).clamp(MIN_UDP_PAYLOAD, MAX_UDP_PAYLOAD))
            .unwrap_or(MIN_UDP_PAYLOAD)
    }

    /// Copy of the message whose EDNS0 payload size is at most `max`.
    ///
    /// Borrows when no OPT record advertises more than `max`.
    pub fn with_udp_payload_limit(&self, max: u16) -> Cow<'_, DnsMessage> {
        let oversized = |r: &DnsRecord| r.rtype == rtype::OPT && r.class > max;
        if !self.additionals.iter().any(oversized) {
            return Cow::Borrowed(self);
        }

        let mut limited = self.clone();
        for opt in limited.additionals.iter_mut().filter(|r| oversized(r)) {
            opt.class = max;
        }
        Cow::Owned(limited)
    }

    /// Header and question only, with TC set.
    pub fn truncated(&self) -> Self {
        Self {
            id: self.id,
            flags: self.flags | FLAG_TC,
            questions: self.questions.clone(),
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        }
    }

    /// Parse a DNS message from raw bytes.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < HEADER_LEN {
            return Err(ParseError::Truncated);
        }

        let id = read_u16(data, 0)?;
        let flags = read_u16(data, 2)?;
        let qdcount = read_u16(data, 4)? as usize;
        let ancount = read_u16(data, 6)? as usize;
        let nscount = read_u16(data, 8)? as usize;
        let arcount = read_u16(data, 10)? as usize;

        let mut pos = HEADER_LEN;

        let mut questions = Vec::with_capacity(qdcount.min(4));
        for _ in 0..qdcount {
            let (domain, next) = read_name(data, pos)?;
            let qtype = read_u16(data, next)?;
            let qclass = read_u16(data, next + 2)?;
            pos = next + 4;
            questions.push(DnsQuestion {
                domain,
                qtype,
                qclass,
            });
        }

        let answers = read_records(data, &mut pos, ancount)?;
        let authorities = read_records(data, &mut pos, nscount)?;
        let additionals = read_records(data, &mut pos, arcount)?;

        Ok(Self {
            id,
            flags,
            questions,
            answers,
            authorities,
            additionals,
        })
    }

    /// Encode the message to wire format bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::default();

        enc.u16(self.id);
        enc.u16(self.flags);
        enc.u16(self.questions.len() as u16);
        enc.u16(self.answers.len() as u16);
        enc.u16(self.authorities.len() as u16);
        enc.u16(self.additionals.len() as u16);

        for q in &self.questions {
            enc.name(&q.domain);
            enc.u16(q.qtype);
            enc.u16(q.qclass);
        }

        for record in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
        {
            enc.record(record);
        }

        enc.buf
    }
}

fn read_u16(data: &[u8], pos: usize) -> Result<u16, ParseError> {
    match data.get(pos..pos + 2) {
        Some(b) => Ok(u16::from_be_bytes([b[0], b[1]])),
        None => Err(ParseError::Truncated),
    }
}

fn read_u32(data: &[u8], pos: usize) -> Result<u32, ParseError> {
    match data.get(pos..pos + 4) {
        Some(b) => Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]])),
        None => Err(ParseError::Truncated),
    }
}

/// Read a possibly compressed name starting at `pos`.
///
/// Returns the dotted name (no trailing dot) and the offset just past the
/// name in the original byte stream.
fn read_name(data: &[u8], mut pos: usize) -> Result<(String, usize), ParseError> {
    let mut name = String::new();
    let mut wire_len = 1;
    let mut end = None;
    let mut jumps = 0;

    loop {
        let len = *data.get(pos).ok_or(ParseError::Truncated)?;
        match len & 0xC0 {
            0x00 => {
                if len == 0 {
                    pos += 1;
                    break;
                }
                let start = pos + 1;
                let stop = start + len as usize;
                let label = data.get(start..stop).ok_or(ParseError::Truncated)?;
                let label = std::str::from_utf8(label).map_err(|_| ParseError::InvalidLabel)?;
                if label.contains('.') {
                    return Err(ParseError::InvalidLabel);
                }
                wire_len += label.len() + 1;
                if wire_len > MAX_NAME_LEN {
                    return Err(ParseError::NameTooLong);
                }
                if !name.is_empty() {
                    name.push('.');
                }
                name.push_str(label);
                pos = stop;
            }
            0xC0 => {
                let low = *data.get(pos + 1).ok_or(ParseError::Truncated)?;
                if end.is_none() {
                    end = Some(pos + 2);
                }
                jumps += 1;
                if jumps > MAX_POINTER_JUMPS {
                    return Err(ParseError::PointerLoop);
                }
                pos = (((len & 0x3F) as usize) << 8) | low as usize;
            }
            _ => return Err(ParseError::InvalidLabel),
        }
    }

    Ok((name, end.unwrap_or(pos)))
}

fn read_records(data: &[u8], pos: &mut usize, count: usize) -> Result<Vec<DnsRecord>, ParseError> {
    let mut records = Vec::with_capacity(count.min(16));
    for _ in 0..count {
        let (name, next) = read_name(data, *pos)?;
        let rtype = read_u16(data, next)?;
        let class = read_u16(data, next + 2)?;
        let ttl = read_u32(data, next + 4)?;
        let rdlength = read_u16(data, next + 8)? as usize;
        let start = next + 10;
        let stop = start + rdlength;
        if stop > data.len() {
            return Err(ParseError::Truncated);
        }
        let rdata = read_rdata(data, rtype, start, stop)?;
        records.push(DnsRecord {
            name,
            rtype,
            class,
            ttl,
            rdata,
        });
        *pos = stop;
    }
    Ok(records)
}

fn read_rdata(data: &[u8], rtype: u16, start: usize, stop: usize) -> Result<RData, ParseError> {
    let bad = ParseError::BadRdata { rtype };
    let rdata = match rtype {
        rtype::A => {
            let b: [u8; 4] = data[start..stop].try_into().map_err(|_| bad)?;
            RData::A(Ipv4Addr::from(b))
        }
        rtype::AAAA => {
            let b: [u8; 16] = data[start..stop].try_into().map_err(|_| bad)?;
            RData::Aaaa(Ipv6Addr::from(b))
        }
        rtype::CNAME | rtype::NS | rtype::PTR => {
            let (target, end) = read_name(data, start)?;
            if end != stop {
                return Err(bad);
            }
            match rtype {
                rtype::CNAME => RData::Cname(target),
                rtype::NS => RData::Ns(target),
                _ => RData::Ptr(target),
            }
        }
        rtype::MX => {
            let preference = read_u16(data, start)?;
            let (exchange, end) = read_name(data, start + 2)?;
            if end != stop {
                return Err(bad);
            }
            RData::Mx {
                preference,
                exchange,
            }
        }
        rtype::SOA => {
            let (mname, next) = read_name(data, start)?;
            let (rname, next) = read_name(data, next)?;
            if next + 20 != stop {
                return Err(bad);
            }
            RData::Soa {
                mname,
                rname,
                serial: read_u32(data, next)?,
                refresh: read_u32(data, next + 4)?,
                retry: read_u32(data, next + 8)?,
                expire: read_u32(data, next + 12)?,
                minimum: read_u32(data, next + 16)?,
            }
        }
        _ => RData::Other(data[start..stop].to_vec()),
    };
    Ok(rdata)
}

/// Wire encoder with name compression.
#[derive(Default)]
struct Encoder {
    buf: Vec<u8>,
    names: FxHashMap<String, u16>,
}

impl Encoder {
    fn u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn name(&mut self, name: &str) {
        let mut rest = name.trim_end_matches('.');
        loop {
            if rest.is_empty() {
                self.buf.push(0);
                return;
            }
            let key = rest.to_ascii_lowercase();
            if let Some(&offset) = self.names.get(&key) {
                self.u16(0xC000 | offset);
                return;
            }
            let offset = self.buf.len();
            if offset < 0x3FFF {
                self.names.insert(key, offset as u16);
            }
            let (label, tail) = rest.split_once('.').unwrap_or((rest, ""));
            let label = &label.as_bytes()[..label.len().min(63)];
            self.buf.push(label.len() as u8);
            self.buf.extend_from_slice(label);
            rest = tail;
        }
    }

    fn record(&mut self, record: &DnsRecord) {
        self.name(&record.name);
        self.u16(record.rtype);
        self.u16(record.class);
        self.u32(record.ttl);

        let len_pos = self.buf.len();
        self.u16(0);
        match &record.rdata {
            RData::A(addr) => self.buf.extend_from_slice(&addr.octets()),
            RData::Aaaa(addr) => self.buf.extend_from_slice(&addr.octets()),
            RData::Cname(target) | RData::Ns(target) | RData::Ptr(target) => self.name(target),
            RData::Mx {
                preference,
                exchange,
            } => {
                self.u16(*preference);
                self.name(exchange);
            }
            RData::Soa {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                self.name(mname);
                self.name(rname);
                for value in [serial, refresh, retry, expire, minimum] {
                    self.u32(*value);
                }
            }
            RData::Other(bytes) => self.buf.extend_from_slice(bytes),
        }
        let rdlength = (self.buf.len() - len_pos - 2) as u16;
        self.buf[len_pos..len_pos + 2].copy_from_slice(&rdlength.to_be_bytes());
    }
}
