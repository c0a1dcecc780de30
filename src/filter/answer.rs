//! Filtering applied to fresh upstream answers.

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::dns::{DnsMessage, RData, rtype};

use super::FilterConfig;

/// An A record fell outside every allowed address prefix.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("answer {address} does not match any allowed prefix")]
pub struct AnswerRejected {
    pub address: Ipv4Addr,
}

/// Apply the answer-level policy to an upstream response.
///
/// With an address prefix list configured, every A record must start with
/// one of the prefixes; the first record that does not rejects the whole
/// response. With the address-type restriction on, only A, AAAA and CNAME
/// records are kept in the answer section.
pub fn filter_answers(
    mut message: DnsMessage,
    config: &FilterConfig,
) -> Result<DnsMessage, AnswerRejected> {
    if !config.allowed_answer_ip_prefixes.is_empty() {
        for record in &message.answers {
            if let RData::A(address) = record.rdata {
                let text = address.to_string();
                match config
                    .allowed_answer_ip_prefixes
                    .iter()
                    .find(|prefix| text.starts_with(prefix.as_str()))
                {
                    Some(prefix) => {
                        tracing::debug!(%address, %prefix, "answer matches address filter");
                    }
                    None => return Err(AnswerRejected { address }),
                }
            }
        }
    }

    if config.restrict_to_ip_types {
        message
            .answers
            .retain(|r| matches!(r.rtype, rtype::A | rtype::AAAA | rtype::CNAME));
    }

    Ok(message)
}
