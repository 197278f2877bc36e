//! Host candidates and the tag predicate.

use convoy_state::{HostId, Tags};

/// A host considered for one placement decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCandidate {
    pub host_id: HostId,
    pub tags: Tags,
    /// Healthy and not shutting down.
    pub available: bool,
    /// Active jobs of the same (formation, type) already on this host.
    pub load: u32,
}

impl HostCandidate {
    /// Whether this host may receive a job requiring `required` tags.
    pub fn is_eligible(&self, required: &Tags) -> bool {
        self.available && tags_match(required, &self.tags)
    }
}

/// Every required key must be present on the host; an empty required
/// value matches any host value.
pub fn tags_match(required: &Tags, host: &Tags) -> bool {
    required
        .iter()
        .all(|(k, v)| host.get(k).is_some_and(|hv| v.is_empty() || hv == v))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_predicate_matches_everything() {
        assert!(tags_match(&Tags::new(), &Tags::new()));
        assert!(tags_match(&Tags::new(), &tags(&[("disk", "ssd")])));
    }

    #[test]
    fn required_values_must_match() {
        let host = tags(&[("disk", "ssd"), ("zone", "a")]);
        assert!(tags_match(&tags(&[("disk", "ssd")]), &host));
        assert!(!tags_match(&tags(&[("disk", "hdd")]), &host));
        assert!(!tags_match(&tags(&[("gpu", "true")]), &host));
    }

    #[test]
    fn empty_required_value_matches_any_value() {
        let host = tags(&[("zone", "b")]);
        assert!(tags_match(&tags(&[("zone", "")]), &host));
        assert!(!tags_match(&tags(&[("rack", "")]), &host));
    }

    #[test]
    fn unavailable_hosts_are_not_eligible() {
        let candidate = HostCandidate {
            host_id: "host1".to_string(),
            tags: Tags::new(),
            available: false,
            load: 0,
        };
        assert!(!candidate.is_eligible(&Tags::new()));
    }
}
