//! Weighted least-loaded host selection.
//!
//! Selection is a pure function of the catalog and a load view: no state is
//! kept between calls, so the same inputs always produce the same target.

use rffmpeg_proto::{HostRecord, LoadView, SelectedTarget};
use serde::Serialize;
use tracing::{debug, warn};

/// A catalog entry annotated with its current load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate<'a> {
    pub host: &'a HostRecord,
    pub active: usize,
    pub weighted_load: usize,
    pub bad: bool,
}

/// Annotates every host in catalog order.
pub fn rank<'a>(catalog: &'a [HostRecord], view: &LoadView) -> Vec<Candidate<'a>> {
    catalog
        .iter()
        .map(|host| {
            let active = view.active(&host.name);
            Candidate {
                host,
                active,
                weighted_load: host.weighted_load(active),
                bad: view.is_bad(&host.name),
            }
        })
        .collect()
}

/// Picks the healthy host with the lowest weighted load.
///
/// Ties go to the host declared first. Falls back to [`SelectedTarget::Local`]
/// when the catalog is empty or every host is marked bad.
pub fn select(catalog: &[HostRecord], view: &LoadView) -> SelectedTarget {
    let candidates = rank(catalog, view);
    for c in &candidates {
        debug!(
            host = %c.host.name,
            active = c.active,
            weight = c.host.weight.get(),
            weighted_load = c.weighted_load,
            bad = c.bad,
            "Considering host"
        );
    }

    // min_by_key keeps the first of equal minimums
    match candidates
        .into_iter()
        .filter(|c| !c.bad)
        .min_by_key(|c| c.weighted_load)
    {
        Some(best) => SelectedTarget::Remote(best.host.clone()),
        None => {
            warn!(
                hosts = catalog.len(),
                "Failed to find a valid target host - using local fallback instead"
            );
            SelectedTarget::Local
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rffmpeg_proto::StateLine;
    use std::num::NonZeroU32;

    fn host(name: &str, weight: u32) -> HostRecord {
        HostRecord::new(name, format!("{name}.lan"), "jellyfin", "/k")
            .with_weight(NonZeroU32::new(weight).unwrap())
    }

    fn view(lines: &[StateLine]) -> LoadView {
        lines.iter().collect()
    }

    fn claim(name: &str) -> StateLine {
        StateLine::Claim(name.to_string())
    }

    fn selected_name(target: &SelectedTarget) -> &str {
        match target {
            SelectedTarget::Remote(host) => &host.name,
            SelectedTarget::Local => "local",
        }
    }

    #[test]
    fn test_tie_at_zero_picks_first_declared() {
        let catalog = [host("A", 1), host("B", 2)];
        let target = select(&catalog, &LoadView::new());
        assert_eq!(selected_name(&target), "A");
    }

    #[test]
    fn test_loaded_host_loses_to_idle_host() {
        let catalog = [host("A", 1), host("B", 1)];
        let target = select(&catalog, &view(&[claim("A")]));
        assert_eq!(selected_name(&target), "B");
    }

    #[test]
    fn test_bad_host_is_excluded_regardless_of_load() {
        let catalog = [host("A", 1), host("B", 1)];
        let lines = [
            StateLine::BadHost("A".into()),
            claim("B"),
            claim("B"),
            claim("B"),
        ];
        let target = select(&catalog, &view(&lines));
        assert_eq!(selected_name(&target), "B");
    }

    #[test]
    fn test_empty_catalog_falls_back_to_local() {
        assert_eq!(select(&[], &LoadView::new()), SelectedTarget::Local);
    }

    #[test]
    fn test_all_bad_falls_back_to_local() {
        let catalog = [host("A", 1), host("B", 4)];
        let lines = [StateLine::BadHost("A".into()), StateLine::BadHost("B".into())];
        assert_eq!(select(&catalog, &view(&lines)), SelectedTarget::Local);
    }

    #[test]
    fn test_weight_absorbs_load() {
        // A: 1 claim / 1 = 1, B: 3 claims / 4 = 0
        let catalog = [host("A", 1), host("B", 4)];
        let lines = [claim("A"), claim("B"), claim("B"), claim("B")];
        let target = select(&catalog, &view(&lines));
        assert_eq!(selected_name(&target), "B");
    }

    #[test]
    fn test_equal_weighted_load_is_deterministic() {
        let catalog = [host("A", 1), host("B", 1), host("C", 1)];
        let lines = [claim("A"), claim("B"), claim("C")];
        for _ in 0..10 {
            assert_eq!(selected_name(&select(&catalog, &view(&lines))), "A");
        }
    }

    #[test]
    fn test_dangling_claims_are_ignored() {
        let catalog = [host("A", 1)];
        let lines = [
            claim("retired"),
            claim("localhost"),
            StateLine::BadHost("gone".into()),
        ];
        let target = select(&catalog, &view(&lines));
        assert_eq!(selected_name(&target), "A");
    }

    #[test]
    fn test_rank_reports_loads() {
        let catalog = [host("A", 2), host("B", 1)];
        let lines = [claim("A"), claim("A"), claim("A"), StateLine::BadHost("B".into())];
        let view = view(&lines);
        let ranked = rank(&catalog, &view);

        assert_eq!(ranked[0].active, 3);
        assert_eq!(ranked[0].weighted_load, 1);
        assert!(!ranked[0].bad);
        assert!(ranked[1].bad);
        assert_eq!(ranked[1].active, 0);
    }
}
