//! Synthetic machine topology, injected into the pools.
//!
//! Pools do not probe the hardware themselves. They accept, per worker, a
//! locality group tag and a list of neighbor lists sorted by distance; the
//! lazy pool uses the groups to scope its sleep bookkeeping and both pools
//! use the neighbor lists to order steal probes. [`distribute`] builds these
//! views for an idealized machine of equally sized groups; anything richer
//! can be constructed by hand and passed to `with_topology`.

/// How workers are assigned to locality groups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Distribution {
    /// Spread workers round-robin across the groups, maximizing the cache
    /// and memory bandwidth available to each worker.
    Fan,
    /// Pack workers into groups sequentially, filling each before starting
    /// the next.
    Seq,
}

/// One worker's view of the machine.
#[derive(Clone, Debug)]
pub struct TopologyNode {
    /// The locality group this worker belongs to.
    pub group: usize,
    /// Worker indices bucketed by distance, closest first. The first bucket
    /// is always the worker itself.
    pub neighbors: Vec<Vec<usize>>,
}

/// Builds the per-worker views for `workers` workers spread over `groups`
/// equally distant locality groups.
///
/// With a single group every other worker sits at distance one. With more,
/// same-group peers are closer than remote ones.
pub fn distribute(workers: usize, groups: usize, strategy: Distribution) -> Vec<TopologyNode> {
    assert!(groups > 0, "a topology needs at least one group");

    let chunk = workers.max(1).div_ceil(groups);
    let group_of = move |index: usize| match strategy {
        Distribution::Fan => index % groups,
        Distribution::Seq => index / chunk,
    };

    (0..workers)
        .map(|index| {
            let group = group_of(index);
            let near: Vec<usize> = (0..workers)
                .filter(|&other| other != index && group_of(other) == group)
                .collect();
            let far: Vec<usize> = (0..workers)
                .filter(|&other| group_of(other) != group)
                .collect();

            let mut neighbors = vec![vec![index]];
            if !near.is_empty() {
                neighbors.push(near);
            }
            if !far.is_empty() {
                neighbors.push(far);
            }
            TopologyNode { group, neighbors }
        })
        .collect()
}

/// A single-group topology where every peer is an immediate neighbor.
pub fn flat(workers: usize) -> Vec<TopologyNode> {
    distribute(workers, 1, Distribution::Seq)
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_complete(nodes: &[TopologyNode]) {
        for (index, node) in nodes.iter().enumerate() {
            assert_eq!(node.neighbors[0], vec![index]);
            let mut all: Vec<usize> = node.neighbors.iter().flatten().copied().collect();
            all.sort_unstable();
            assert_eq!(all, (0..nodes.len()).collect::<Vec<_>>());
        }
    }

    #[test]
    fn flat_reaches_everyone() {
        for workers in 1..16 {
            let nodes = flat(workers);
            assert_eq!(nodes.len(), workers);
            assert_complete(&nodes);
            assert!(nodes.iter().all(|node| node.group == 0));
        }
    }

    #[test]
    fn fan_spreads_and_seq_packs() {
        let fan = distribute(8, 4, Distribution::Fan);
        assert_eq!(
            fan.iter().map(|n| n.group).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 0, 1, 2, 3]
        );
        let seq = distribute(8, 4, Distribution::Seq);
        assert_eq!(
            seq.iter().map(|n| n.group).collect::<Vec<_>>(),
            vec![0, 0, 1, 1, 2, 2, 3, 3]
        );
        assert_complete(&fan);
        assert_complete(&seq);
    }

    #[test]
    fn same_group_peers_are_closer() {
        let nodes = distribute(8, 2, Distribution::Seq);
        for node in &nodes {
            if node.neighbors.len() == 3 {
                assert!(node.neighbors[1]
                    .iter()
                    .all(|&peer| nodes[peer].group == node.group));
                assert!(node.neighbors[2]
                    .iter()
                    .all(|&peer| nodes[peer].group != node.group));
            }
        }
    }
}
