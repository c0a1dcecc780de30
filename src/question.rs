//! Normalized view of the question a client asked.

use std::fmt;

use crate::dns::{DnsQuestion, class_name, type_name};

/// The (name, type, class) triple a query asks for.
///
/// The name is lowercased with any trailing dot stripped, so it can be
/// compared directly against hosts entries, suffix rules and cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl Question {
    pub fn new(name: &str, qtype: u16, qclass: u16) -> Self {
        Self {
            name: name.trim_end_matches('.').to_ascii_lowercase(),
            qtype,
            qclass,
        }
    }

    pub fn from_wire(question: &DnsQuestion) -> Self {
        Self::new(&question.domain, question.qtype, question.qclass)
    }

    /// Key under which answers to this question are cached.
    pub fn cache_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.name,
            class_name(self.qclass),
            type_name(self.qtype)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{class, rtype};

    #[test]
    fn new_strips_trailing_dot_and_lowercases() {
        let question = Question::new("WWW.Example.COM.", rtype::A, class::IN);

        assert_eq!(question.name, "www.example.com");
    }

    #[test]
    fn cache_key_joins_name_class_and_type() {
        let question = Question::new("example.com", rtype::AAAA, class::IN);

        assert_eq!(question.cache_key(), "example.com IN AAAA");
    }

    #[test]
    fn cache_key_distinguishes_types() {
        let a = Question::new("example.com", rtype::A, class::IN);
        let aaaa = Question::new("example.com", rtype::AAAA, class::IN);

        assert_ne!(a.cache_key(), aaaa.cache_key());
    }
}
