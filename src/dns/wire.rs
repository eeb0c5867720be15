// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Minimal DNS wire codec: enough to ask A/AAAA questions over UDP and parse
//! the answers (A, AAAA, CNAME), compression pointers included. Unknown
//! record types are skipped, not rejected.

use crate::error::Error;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_SERVFAIL: u8 = 2;
pub const RCODE_NXDOMAIN: u8 = 3;

const TYPE_A: u16 = 1;
const TYPE_CNAME: u16 = 5;
const TYPE_AAAA: u16 = 28;
const CLASS_IN: u16 = 1;

const HEADER_LEN: usize = 12;
const MAX_LABEL_LEN: usize = 63;
const MAX_POINTER_HOPS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Aaaa,
    Cname,
}

impl RecordType {
    fn to_u16(self) -> u16 {
        match self {
            RecordType::A => TYPE_A,
            RecordType::Aaaa => TYPE_AAAA,
            RecordType::Cname => TYPE_CNAME,
        }
    }

    fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            TYPE_A => Some(RecordType::A),
            TYPE_AAAA => Some(RecordType::Aaaa),
            TYPE_CNAME => Some(RecordType::Cname),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub name: String,
    pub data: RData,
    pub ttl: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub rtype: RecordType,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub id: u16,
    pub rcode: u8,
    pub answers: Vec<Answer>,
}

fn malformed(what: &str) -> Error {
    Error::NetworkFailure(io::Error::new(io::ErrorKind::InvalidData, what.to_owned()))
}

fn push_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn read_u16(buf: &[u8], pos: usize) -> Result<u16, Error> {
    let bytes = buf
        .get(pos..pos + 2)
        .ok_or_else(|| malformed("truncated message"))?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32(buf: &[u8], pos: usize) -> Result<u32, Error> {
    let bytes = buf
        .get(pos..pos + 4)
        .ok_or_else(|| malformed("truncated message"))?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn encode_name(buf: &mut Vec<u8>, name: &str) -> Result<(), Error> {
    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(malformed("invalid label length"));
        }
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
    Ok(())
}

/// Read a (possibly compressed) name starting at `start`. Returns the name
/// and the offset just past it in the uncompressed stream.
fn read_name(buf: &[u8], start: usize) -> Result<(String, usize), Error> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = start;
    let mut resume: Option<usize> = None;
    let mut hops = 0;

    loop {
        let len = *buf.get(pos).ok_or_else(|| malformed("truncated name"))? as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        if len & 0xC0 == 0xC0 {
            let low = *buf.get(pos + 1).ok_or_else(|| malformed("truncated pointer"))? as usize;
            let target = ((len & 0x3F) << 8) | low;
            if resume.is_none() {
                resume = Some(pos + 2);
            }
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return Err(malformed("compression pointer loop"));
            }
            pos = target;
            continue;
        }
        if len > MAX_LABEL_LEN {
            return Err(malformed("invalid label length"));
        }
        let bytes = buf
            .get(pos + 1..pos + 1 + len)
            .ok_or_else(|| malformed("truncated label"))?;
        labels.push(String::from_utf8_lossy(bytes).to_ascii_lowercase());
        pos += 1 + len;
    }

    Ok((labels.join("."), resume.unwrap_or(pos)))
}

/// Build a recursion-desired query for `name`.
pub fn encode_query(id: u16, name: &str, rtype: RecordType) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::with_capacity(HEADER_LEN + name.len() + 6);
    push_u16(&mut buf, id);
    push_u16(&mut buf, 0x0100); // RD
    push_u16(&mut buf, 1); // QDCOUNT
    push_u16(&mut buf, 0); // ANCOUNT
    push_u16(&mut buf, 0); // NSCOUNT
    push_u16(&mut buf, 0); // ARCOUNT
    encode_name(&mut buf, name)?;
    push_u16(&mut buf, rtype.to_u16());
    push_u16(&mut buf, CLASS_IN);
    Ok(buf)
}

/// Parse a response: header rcode plus the A/AAAA/CNAME answers. Question
/// and authority/additional sections are skipped.
pub fn parse_response(buf: &[u8]) -> Result<Response, Error> {
    if buf.len() < HEADER_LEN {
        return Err(malformed("short header"));
    }
    let id = read_u16(buf, 0)?;
    let flags = read_u16(buf, 2)?;
    let rcode = (flags & 0x000F) as u8;
    let qdcount = read_u16(buf, 4)?;
    let ancount = read_u16(buf, 6)?;

    let mut pos = HEADER_LEN;
    for _ in 0..qdcount {
        let (_, next) = read_name(buf, pos)?;
        pos = next + 4; // type + class
    }

    let mut answers = Vec::with_capacity(ancount as usize);
    for _ in 0..ancount {
        let (name, next) = read_name(buf, pos)?;
        pos = next;
        let rtype = read_u16(buf, pos)?;
        let _class = read_u16(buf, pos + 2)?;
        let ttl = read_u32(buf, pos + 4)?;
        let rdlen = read_u16(buf, pos + 8)? as usize;
        pos += 10;
        let rdata = buf
            .get(pos..pos + rdlen)
            .ok_or_else(|| malformed("truncated rdata"))?;

        let data = match RecordType::from_u16(rtype) {
            Some(RecordType::A) if rdlen == 4 => {
                Some(RData::A(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])))
            }
            Some(RecordType::Aaaa) if rdlen == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                Some(RData::Aaaa(Ipv6Addr::from(octets)))
            }
            Some(RecordType::Cname) => {
                let (target, _) = read_name(buf, pos)?;
                Some(RData::Cname(target))
            }
            _ => None, // unknown or malformed record, skip
        };
        pos += rdlen;

        if let Some(data) = data {
            answers.push(Answer { name, data, ttl });
        }
    }

    Ok(Response { id, rcode, answers })
}

/// Parse the question out of a query datagram (the mock server side).
pub fn parse_query(buf: &[u8]) -> Result<(u16, Question), Error> {
    if buf.len() < HEADER_LEN {
        return Err(malformed("short header"));
    }
    let id = read_u16(buf, 0)?;
    let qdcount = read_u16(buf, 4)?;
    if qdcount != 1 {
        return Err(malformed("expected exactly one question"));
    }
    let (name, next) = read_name(buf, HEADER_LEN)?;
    let rtype = read_u16(buf, next)?;
    let rtype = RecordType::from_u16(rtype).ok_or_else(|| malformed("unsupported qtype"))?;
    Ok((id, Question { name, rtype }))
}

/// Build a response to `question` (the mock server side). Answer names are
/// encoded inline, no compression.
pub fn encode_response(
    id: u16,
    question: &Question,
    rcode: u8,
    answers: &[Answer],
) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::with_capacity(512);
    push_u16(&mut buf, id);
    push_u16(&mut buf, 0x8180 | u16::from(rcode)); // QR | RD | RA
    push_u16(&mut buf, 1); // QDCOUNT
    push_u16(&mut buf, answers.len() as u16);
    push_u16(&mut buf, 0); // NSCOUNT
    push_u16(&mut buf, 0); // ARCOUNT

    encode_name(&mut buf, &question.name)?;
    push_u16(&mut buf, question.rtype.to_u16());
    push_u16(&mut buf, CLASS_IN);

    for answer in answers {
        encode_name(&mut buf, &answer.name)?;
        let (rtype, rdata) = match &answer.data {
            RData::A(ip) => (TYPE_A, ip.octets().to_vec()),
            RData::Aaaa(ip) => (TYPE_AAAA, ip.octets().to_vec()),
            RData::Cname(target) => {
                let mut encoded = Vec::new();
                encode_name(&mut encoded, target)?;
                (TYPE_CNAME, encoded)
            }
        };
        push_u16(&mut buf, rtype);
        push_u16(&mut buf, CLASS_IN);
        buf.extend_from_slice(&answer.ttl.to_be_bytes());
        push_u16(&mut buf, rdata.len() as u16);
        buf.extend_from_slice(&rdata);
    }

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_round_trips() {
        let query = encode_query(0x1234, "a.test", RecordType::Aaaa).unwrap();
        let (id, question) = parse_query(&query).unwrap();
        assert_eq!(id, 0x1234);
        assert_eq!(question.name, "a.test");
        assert_eq!(question.rtype, RecordType::Aaaa);
    }

    #[test]
    fn response_round_trips() {
        let question = Question {
            name: "a.test".to_owned(),
            rtype: RecordType::A,
        };
        let answers = vec![
            Answer {
                name: "a.test".to_owned(),
                data: RData::Cname("b.test".to_owned()),
                ttl: 60,
            },
            Answer {
                name: "b.test".to_owned(),
                data: RData::A(Ipv4Addr::new(77, 88, 55, 55)),
                ttl: 13,
            },
        ];
        let wire = encode_response(7, &question, RCODE_NOERROR, &answers).unwrap();

        let response = parse_response(&wire).unwrap();
        assert_eq!(response.id, 7);
        assert_eq!(response.rcode, RCODE_NOERROR);
        assert_eq!(response.answers, answers);
    }

    #[test]
    fn servfail_has_no_answers() {
        let question = Question {
            name: "x.test".to_owned(),
            rtype: RecordType::A,
        };
        let wire = encode_response(9, &question, RCODE_SERVFAIL, &[]).unwrap();
        let response = parse_response(&wire).unwrap();
        assert_eq!(response.rcode, RCODE_SERVFAIL);
        assert!(response.answers.is_empty());
    }

    #[test]
    fn compressed_names_are_followed() {
        // header + question "a.test" A IN, answer name as pointer to offset 12
        let mut buf = Vec::new();
        push_u16(&mut buf, 1); // id
        push_u16(&mut buf, 0x8180);
        push_u16(&mut buf, 1); // qd
        push_u16(&mut buf, 1); // an
        push_u16(&mut buf, 0);
        push_u16(&mut buf, 0);
        encode_name(&mut buf, "a.test").unwrap();
        push_u16(&mut buf, TYPE_A);
        push_u16(&mut buf, CLASS_IN);
        // answer: pointer to the question name
        buf.extend_from_slice(&[0xC0, HEADER_LEN as u8]);
        push_u16(&mut buf, TYPE_A);
        push_u16(&mut buf, CLASS_IN);
        buf.extend_from_slice(&13u32.to_be_bytes());
        push_u16(&mut buf, 4);
        buf.extend_from_slice(&[77, 88, 55, 60]);

        let response = parse_response(&buf).unwrap();
        assert_eq!(response.answers.len(), 1);
        assert_eq!(response.answers[0].name, "a.test");
        assert_eq!(
            response.answers[0].data,
            RData::A(Ipv4Addr::new(77, 88, 55, 60))
        );
    }

    #[test]
    fn pointer_loops_are_rejected() {
        let mut buf = Vec::new();
        push_u16(&mut buf, 1);
        push_u16(&mut buf, 0x8180);
        push_u16(&mut buf, 1);
        push_u16(&mut buf, 0);
        push_u16(&mut buf, 0);
        push_u16(&mut buf, 0);
        // question name points at itself
        buf.extend_from_slice(&[0xC0, HEADER_LEN as u8]);
        push_u16(&mut buf, TYPE_A);
        push_u16(&mut buf, CLASS_IN);

        assert!(parse_response(&buf).is_err());
    }

    #[test]
    fn names_are_case_folded() {
        let query = encode_query(1, "A.TeSt", RecordType::A).unwrap();
        let (_, question) = parse_query(&query).unwrap();
        assert_eq!(question.name, "a.test");
    }
}
