// Version graph resolver - latest version per line and the patch chain to reach it

use super::version::{Version, VersionLine};
use super::UpdateError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A published patch turning an installation at `from` into one at `to`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UpdateEdge {
    pub from: Version,
    pub to: Version,
}

impl fmt::Display for UpdateEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// Ordered edges leading from `start` to `target`.
/// Consecutive edges connect (`edges[i].to == edges[i + 1].from`); empty iff `start == target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateChain {
    start: Version,
    target: Version,
    edges: Vec<UpdateEdge>,
}

impl UpdateChain {
    pub fn start(&self) -> Version {
        self.start
    }

    pub fn target(&self) -> Version {
        self.target
    }

    pub fn edges(&self) -> &[UpdateEdge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Version the installation holds once the first `applied` edges went through
    pub fn version_after(&self, applied: usize) -> Version {
        match applied.checked_sub(1).and_then(|i| self.edges.get(i)) {
            Some(edge) => edge.to,
            None if applied == 0 => self.start,
            None => self.target,
        }
    }
}

/// Highest version reachable on `current`'s major.minor line
pub fn resolve_target(current: Version, edges: &[UpdateEdge]) -> Result<Version, UpdateError> {
    let line = current.line();
    edges
        .iter()
        .filter(|e| e.to.line() == line)
        .map(|e| e.to.patch)
        .max()
        .map(|patch| line.with_patch(patch))
        .ok_or(UpdateError::NoUpdatesForLine(line))
}

/// Walk forward from `current`, one edge per step, until `target` is reached.
///
/// When several edges leave the same version the one jumping furthest (without
/// passing `target`) wins. A missing link fails the whole resolution instead of
/// returning a shorter chain.
pub fn resolve_chain(
    current: Version,
    target: Version,
    edges: &[UpdateEdge],
) -> Result<UpdateChain, UpdateError> {
    if current > target {
        return Err(UpdateError::AheadOfCatalog {
            installed: current,
            target,
        });
    }

    let mut chain = Vec::new();
    let mut frontier = current;

    while frontier != target {
        // Only forward edges that stay at or below target; guarantees termination
        let next = edges
            .iter()
            .filter(|e| e.from == frontier && e.to > frontier && e.to <= target)
            .max_by_key(|e| e.to)
            .copied()
            .ok_or(UpdateError::UnreachableTarget { frontier, target })?;

        tracing::info!("Need update from {} to {}", next.from, next.to);
        chain.push(next);
        frontier = next.to;
    }

    Ok(UpdateChain {
        start: current,
        target,
        edges: chain,
    })
}

/// Targets resolved during one orchestration run, keyed by version line.
///
/// Owned by the run and passed to every update it performs, so installations on
/// different lines each get their own target.
#[derive(Debug, Default, Clone)]
pub struct LatestVersions {
    targets: HashMap<VersionLine, Version>,
}

impl LatestVersions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, line: VersionLine) -> Option<Version> {
        self.targets.get(&line).copied()
    }

    /// Return the cached target for `current`'s line, resolving it from `edges` on a miss
    pub fn resolve(
        &mut self,
        current: Version,
        edges: &[UpdateEdge],
    ) -> Result<Version, UpdateError> {
        let line = current.line();
        if let Some(target) = self.get(line) {
            return Ok(target);
        }
        let target = resolve_target(current, edges)?;
        tracing::info!("Latest version for line {} is {}", line, target);
        self.targets.insert(line, target);
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    fn edge(from: &str, to: &str) -> UpdateEdge {
        UpdateEdge {
            from: v(from),
            to: v(to),
        }
    }

    #[test]
    fn test_resolve_target_picks_highest_on_line() {
        let edges = vec![
            edge("1.1.100", "1.1.101"),
            edge("1.1.101", "1.1.102"),
            edge("1.0.0", "1.0.5"),
            edge("2.0.1", "2.0.9"),
        ];
        assert_eq!(resolve_target(v("1.1.100"), &edges).unwrap(), v("1.1.102"));
        assert_eq!(resolve_target(v("1.0.0"), &edges).unwrap(), v("1.0.5"));
    }

    #[test]
    fn test_resolve_target_no_updates_for_line() {
        let edges = vec![edge("1.1.100", "1.1.101")];
        let err = resolve_target(v("0.17.79"), &edges).unwrap_err();
        assert!(matches!(err, UpdateError::NoUpdatesForLine(line) if line == v("0.17.0").line()));
    }

    #[test]
    fn test_chain_through_intermediate() {
        let triples = [("0.0.1", "0.0.2", "0.0.3"), ("1.1.9", "1.1.10", "1.1.99")];
        for (a, b, c) in triples {
            let edges = vec![edge(b, c), edge(a, b)];
            let chain = resolve_chain(v(a), v(c), &edges).unwrap();
            assert_eq!(chain.edges(), &[edge(a, b), edge(b, c)]);
            assert_eq!(chain.start(), v(a));
            assert_eq!(chain.target(), v(c));
        }
    }

    #[test]
    fn test_chain_empty_when_current() {
        let edges = vec![edge("1.1.100", "1.1.101")];
        let chain = resolve_chain(v("1.1.101"), v("1.1.101"), &edges).unwrap();
        assert!(chain.is_empty());
        assert_eq!(chain.version_after(0), v("1.1.101"));
    }

    #[test]
    fn test_chain_gap_is_unreachable() {
        let edges = vec![edge("1.1.1", "1.1.2"), edge("1.1.3", "1.1.4")];
        for target in ["1.1.3", "1.1.4"] {
            let err = resolve_chain(v("1.1.1"), v(target), &edges).unwrap_err();
            assert!(matches!(
                err,
                UpdateError::UnreachableTarget { frontier, .. } if frontier == v("1.1.2")
            ));
        }
    }

    #[test]
    fn test_chain_prefers_longest_hop() {
        let edges = vec![
            edge("1.1.1", "1.1.2"),
            edge("1.1.1", "1.1.3"),
            edge("1.1.2", "1.1.3"),
            edge("1.1.3", "1.1.4"),
        ];
        let chain = resolve_chain(v("1.1.1"), v("1.1.4"), &edges).unwrap();
        assert_eq!(chain.edges(), &[edge("1.1.1", "1.1.3"), edge("1.1.3", "1.1.4")]);
    }

    #[test]
    fn test_chain_ignores_overshooting_hop() {
        let edges = vec![
            edge("1.1.1", "1.1.9"),
            edge("1.1.1", "1.1.2"),
            edge("1.1.2", "1.1.3"),
        ];
        let chain = resolve_chain(v("1.1.1"), v("1.1.3"), &edges).unwrap();
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_chain_ahead_of_catalog() {
        let err = resolve_chain(v("1.1.5"), v("1.1.4"), &[]).unwrap_err();
        assert!(matches!(err, UpdateError::AheadOfCatalog { .. }));
    }

    #[test]
    fn test_version_after() {
        let edges = vec![
            edge("1.1.1", "1.1.2"),
            edge("1.1.2", "1.1.3"),
            edge("1.1.3", "1.1.4"),
        ];
        let chain = resolve_chain(v("1.1.1"), v("1.1.4"), &edges).unwrap();
        assert_eq!(chain.version_after(0), v("1.1.1"));
        assert_eq!(chain.version_after(2), v("1.1.3"));
        assert_eq!(chain.version_after(3), v("1.1.4"));
    }

    #[test]
    fn test_latest_versions_caches_per_line() {
        let mut latest = LatestVersions::new();
        let edges = vec![edge("1.1.1", "1.1.2"), edge("1.0.1", "1.0.4")];

        assert_eq!(latest.resolve(v("1.1.1"), &edges).unwrap(), v("1.1.2"));
        assert_eq!(latest.resolve(v("1.0.1"), &edges).unwrap(), v("1.0.4"));

        // Cached targets survive without edges
        assert_eq!(latest.resolve(v("1.1.2"), &[]).unwrap(), v("1.1.2"));
        assert_eq!(latest.get(v("1.0.0").line()), Some(v("1.0.4")));
        assert!(latest.resolve(v("2.0.0"), &[]).is_err());
    }
}
