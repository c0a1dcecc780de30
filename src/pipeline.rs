//! DNS query resolution logic.
//!
//! Handles the core query processing pipeline:
//! 1. Normalize and classify the question (ANY may become A)
//! 2. Policy pre-checks (query type, domain suffix)
//! 3. Hosts-file overrides
//! 4. Cache lookup
//! 5. Forward upstream, filter the answer, sinkhole on failure
//! 6. Cache fresh address answers
//!
//! Transports handle the actual I/O, the pipeline handles decisions.

use std::borrow::Cow;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::debug;

use crate::cache::ResponseCache;
use crate::dns::{DnsMessage, DnsRecord, rcode};
use crate::filter::{self, FilterConfig, QueryKind, Verdict};
use crate::hosts::HostsTable;
use crate::question::Question;
use crate::transport::Protocol;
use crate::upstream::Upstream;

/// How a query was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Hosts,
    Cache,
    Upstream,
    Rejected,
    Sinkholed,
    Failed,
}

impl Disposition {
    pub fn as_str(self) -> &'static str {
        match self {
            Disposition::Hosts => "HOSTS",
            Disposition::Cache => "CACHED",
            Disposition::Upstream => "FORWARDED",
            Disposition::Rejected => "REJECTED",
            Disposition::Sinkholed => "SINKHOLED",
            Disposition::Failed => "FAILED",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reply for the client plus how it was produced.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub response: DnsMessage,
    pub disposition: Disposition,
}

impl PipelineResult {
    fn new(response: DnsMessage, disposition: Disposition) -> Self {
        Self {
            response,
            disposition,
        }
    }
}

/// Hosts-file overrides as used by the pipeline.
pub struct HostsOverride {
    pub table: HostsTable,
    pub ttl: u32,
}

/// Per-query decision pipeline.
///
/// Shared by every transport task. The hosts table and filter rules are
/// read-only; the cache synchronizes internally and hands out copies, so
/// rewriting the transaction ID of a cached answer needs no extra locking.
pub struct ProxyPipeline {
    hosts: Option<HostsOverride>,
    cache: Arc<dyn ResponseCache>,
    upstream: Arc<dyn Upstream>,
    filters: FilterConfig,
}

impl ProxyPipeline {
    pub fn new(
        hosts: Option<HostsOverride>,
        cache: Arc<dyn ResponseCache>,
        upstream: Arc<dyn Upstream>,
        filters: FilterConfig,
    ) -> Self {
        Self {
            hosts,
            cache,
            upstream,
            filters,
        }
    }

    pub fn cache(&self) -> &Arc<dyn ResponseCache> {
        &self.cache
    }

    /// Resolve one request. Never fails: every outcome is a DNS reply.
    pub async fn handle(&self, request: &DnsMessage, protocol: Protocol) -> PipelineResult {
        let Some(asked) = request.questions.first() else {
            debug!(id = request.id, "request without question");
            return PipelineResult::new(
                DnsMessage::failure(request, rcode::FORMERR),
                Disposition::Failed,
            );
        };

        let mut question = Question::from_wire(asked);
        question.qtype = filter::effective_qtype(&self.filters, asked.qtype);
        let qtype = question.qtype;
        let kind = filter::classify(&question);
        debug!(%question, ?kind, "question");

        if filter::pre_check(&self.filters, kind) == Verdict::Reject {
            debug!(%question, "only address queries allowed (A, AAAA)");
            return self.reject(request);
        }

        if filter::suffix_check(&question.name, &self.filters.allowed_suffixes) == Verdict::Reject
        {
            debug!(name = %question.name, "no suffix filter matches");
            return self.reject(request);
        }
        if let Some(suffix) = filter::first_match(&question.name, &self.filters.allowed_suffixes) {
            debug!(name = %question.name, suffix, "suffix filter matches");
        }

        if let Some(response) = self.lookup_hosts(request, &question, kind) {
            return PipelineResult::new(response, Disposition::Hosts);
        }

        let key = kind.is_address().then(|| question.cache_key());
        if let Some(key) = &key {
            match self.cache.get(key) {
                Some(mut cached) => {
                    debug!(%question, "cache hit");
                    cached.id = request.id;
                    cached.questions = request.questions.clone();
                    return PipelineResult::new(cached, Disposition::Cache);
                }
                None => debug!(%question, "cache miss"),
            }
        }

        let forwarded = if qtype == asked.qtype {
            Cow::Borrowed(request)
        } else {
            let mut rewritten = request.clone();
            rewritten.questions[0].qtype = qtype;
            Cow::Owned(rewritten)
        };

        let resolved = match self.upstream.lookup(&forwarded, protocol).await {
            Ok(response) => filter::filter_answers(response, &self.filters).map_err(|rejected| {
                debug!(%question, address = %rejected.address, "answer does not match any address filter");
            }),
            Err(e) => {
                debug!(%question, error = %e, "upstream lookup failed");
                Err(())
            }
        };

        let Ok(mut response) = resolved else {
            return self.resolution_failed(request);
        };
        response.id = request.id;

        if let Some(key) = &key {
            if !response.answers.is_empty() {
                match self.cache.set(key, &response) {
                    Ok(()) => debug!(%question, "inserted into cache"),
                    Err(e) => debug!(%question, error = %e, "cache insert failed"),
                }
            }
        }

        PipelineResult::new(response, Disposition::Upstream)
    }

    fn lookup_hosts(
        &self,
        request: &DnsMessage,
        question: &Question,
        kind: QueryKind,
    ) -> Option<DnsMessage> {
        let hosts = self.hosts.as_ref()?;
        let family = kind.family()?;

        let Some(addr) = hosts.table.lookup(&question.name, family) else {
            debug!(name = %question.name, "not found in hosts file");
            return None;
        };
        debug!(name = %question.name, %addr, "found in hosts file");

        let name = &request.questions[0].domain;
        let record = match addr {
            IpAddr::V4(v4) => DnsRecord::a(name, hosts.ttl, v4),
            IpAddr::V6(v6) => DnsRecord::aaaa(name, hosts.ttl, v6),
        };

        let mut response = DnsMessage::reply_to(request);
        response.answers.push(record);
        Some(response)
    }

    fn reject(&self, request: &DnsMessage) -> PipelineResult {
        PipelineResult::new(
            DnsMessage::failure(request, rcode::SERVFAIL),
            Disposition::Rejected,
        )
    }

    fn resolution_failed(&self, request: &DnsMessage) -> PipelineResult {
        match filter::sinkhole(&self.filters, request) {
            Some(response) => PipelineResult::new(response, Disposition::Sinkholed),
            None => PipelineResult::new(
                DnsMessage::failure(request, rcode::SERVFAIL),
                Disposition::Failed,
            ),
        }
    }
}
