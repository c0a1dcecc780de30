//! Query and answer policy.
//!
//! Everything here is a pure function of a [`FilterConfig`] and the
//! question or message being checked, so it can be shared freely between
//! query tasks.

mod answer;
mod suffix;

use std::net::Ipv4Addr;

pub use answer::{AnswerRejected, filter_answers};
pub use suffix::first_match;

use crate::dns::{DnsMessage, DnsRecord, class, rtype};
use crate::hosts::AddressFamily;
use crate::question::Question;

/// Filtering rules, fixed at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterConfig {
    /// Only answer A and AAAA questions (ANY is rewritten to A).
    pub restrict_to_ip_types: bool,
    /// Names must match one of these suffixes when non-empty.
    pub allowed_suffixes: Vec<String>,
    /// A answers must start with one of these textual prefixes when non-empty.
    pub allowed_answer_ip_prefixes: Vec<String>,
    /// Address returned instead of a failure, if any.
    pub sinkhole_address: Option<Ipv4Addr>,
    pub sinkhole_ttl: u32,
}

/// What kind of address a question asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    NotAddress,
    Ipv4,
    Ipv6,
}

impl QueryKind {
    pub fn is_address(self) -> bool {
        self != QueryKind::NotAddress
    }

    pub fn family(self) -> Option<AddressFamily> {
        match self {
            QueryKind::Ipv4 => Some(AddressFamily::V4),
            QueryKind::Ipv6 => Some(AddressFamily::V6),
            QueryKind::NotAddress => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Reject,
}

/// Classify a question: IN-class A and AAAA are address queries.
pub fn classify(question: &Question) -> QueryKind {
    if question.qclass != class::IN {
        return QueryKind::NotAddress;
    }
    match question.qtype {
        rtype::A => QueryKind::Ipv4,
        rtype::AAAA => QueryKind::Ipv6,
        _ => QueryKind::NotAddress,
    }
}

/// Query type to actually resolve: ANY becomes A under the address-type
/// restriction.
pub fn effective_qtype(config: &FilterConfig, qtype: u16) -> u16 {
    if config.restrict_to_ip_types && qtype == rtype::ANY {
        rtype::A
    } else {
        qtype
    }
}

/// Reject non-address queries when the address-type restriction is on.
///
/// Expects the question after [`effective_qtype`] has been applied.
pub fn pre_check(config: &FilterConfig, kind: QueryKind) -> Verdict {
    if config.restrict_to_ip_types && !kind.is_address() {
        Verdict::Reject
    } else {
        Verdict::Allow
    }
}

/// Check a normalized domain against the suffix allow-list.
pub fn suffix_check(domain: &str, allowed_suffixes: &[String]) -> Verdict {
    if allowed_suffixes.is_empty() || first_match(domain, allowed_suffixes).is_some() {
        Verdict::Allow
    } else {
        Verdict::Reject
    }
}

/// Build the synthetic answer used in place of a failed resolution.
///
/// Returns `None` when no sinkhole address is configured. The answer is a
/// single authoritative A record for the requested name.
pub fn sinkhole(config: &FilterConfig, request: &DnsMessage) -> Option<DnsMessage> {
    let address = config.sinkhole_address?;
    let name = request
        .questions
        .first()
        .map(|q| q.domain.as_str())
        .unwrap_or_default();

    let mut message = DnsMessage::reply_to(request);
    message.set_authoritative(true);
    message
        .answers
        .push(DnsRecord::a(name, config.sinkhole_ttl, address));
    Some(message)
}
