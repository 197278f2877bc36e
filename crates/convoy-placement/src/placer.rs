//! Placement engine: picks the least-loaded eligible host.

use thiserror::Error;
use tracing::debug;

use convoy_state::Tags;

use crate::scorer::HostCandidate;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlacementError {
    #[error("no hosts match tags {0:?}")]
    NoHostsMatch(Tags),
}

/// Choose a host for one job.
///
/// Candidates are expected in host-id order; among equally loaded hosts
/// the first one wins, so placement is deterministic for a given table.
pub fn choose_host<'a>(
    candidates: &'a [HostCandidate],
    required: &Tags,
) -> Result<&'a HostCandidate, PlacementError> {
    let chosen = candidates
        .iter()
        .filter(|c| c.is_eligible(required))
        .fold(None::<&HostCandidate>, |best, c| match best {
            Some(b) if b.load <= c.load => Some(b),
            _ => Some(c),
        })
        .ok_or_else(|| PlacementError::NoHostsMatch(required.clone()))?;

    debug!(host_id = %chosen.host_id, load = chosen.load, "host chosen");
    Ok(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, load: u32, available: bool, tags: &[(&str, &str)]) -> HostCandidate {
        HostCandidate {
            host_id: id.to_string(),
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            available,
            load,
        }
    }

    #[test]
    fn picks_least_loaded() {
        let candidates = vec![
            candidate("host1", 2, true, &[]),
            candidate("host2", 0, true, &[]),
            candidate("host3", 1, true, &[]),
        ];
        let chosen = choose_host(&candidates, &Tags::new()).unwrap();
        assert_eq!(chosen.host_id, "host2");
    }

    #[test]
    fn ties_go_to_first_candidate() {
        let candidates = vec![
            candidate("host1", 1, true, &[]),
            candidate("host2", 1, true, &[]),
        ];
        let chosen = choose_host(&candidates, &Tags::new()).unwrap();
        assert_eq!(chosen.host_id, "host1");
    }

    #[test]
    fn skips_unavailable_and_mismatched_hosts() {
        let required: Tags = [("disk".to_string(), "ssd".to_string())].into();
        let candidates = vec![
            candidate("host1", 0, false, &[("disk", "ssd")]),
            candidate("host2", 0, true, &[("disk", "hdd")]),
            candidate("host3", 5, true, &[("disk", "ssd")]),
        ];
        let chosen = choose_host(&candidates, &required).unwrap();
        assert_eq!(chosen.host_id, "host3");
    }

    #[test]
    fn no_match_is_an_error() {
        let required: Tags = [("gpu".to_string(), "true".to_string())].into();
        let candidates = vec![candidate("host1", 0, true, &[])];
        assert_eq!(
            choose_host(&candidates, &required),
            Err(PlacementError::NoHostsMatch(required.clone()))
        );
        assert!(choose_host(&[], &Tags::new()).is_err());
    }
}
