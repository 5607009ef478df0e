use crate::context::{Context, Objective};
use crate::hypergraph::Hypergraph;
use crate::HyperedgeWeight;

/// Σ ω(e) over hyperedges spanning at least two blocks.
pub fn cut(hg: &Hypergraph) -> HyperedgeWeight {
    hg.edges()
        .filter(|&e| hg.connectivity(e) >= 2)
        .map(|e| hg.edge_weight(e))
        .sum()
}

/// Σ ω(e) · (λ(e) − 1), the connectivity-minus-one metric.
pub fn km1(hg: &Hypergraph) -> HyperedgeWeight {
    hg.edges()
        .map(|e| hg.edge_weight(e) * (hg.connectivity(e).saturating_sub(1)) as HyperedgeWeight)
        .sum()
}

pub fn objective(hg: &Hypergraph, obj: Objective) -> HyperedgeWeight {
    match obj {
        Objective::Cut => cut(hg),
        Objective::Km1 => km1(hg),
    }
}

/// max_i c(V_i) / ⌈c(V)/k⌉ − 1, or the analogous ratio against the
/// individual block weights when those are in use.
pub fn imbalance(hg: &Hypergraph, context: &Context) -> f64 {
    let k = hg.k();
    if context.partition.use_individual_block_weights {
        (0..k)
            .map(|p| {
                hg.part_weight(p) as f64
                    / context.partition.individual_block_weights[p as usize] as f64
            })
            .fold(0.0f64, f64::max)
            - 1.0
    } else {
        let average = (hg.total_weight() as f64 / k as f64).ceil();
        let heaviest = (0..k).map(|p| hg.part_weight(p)).max().unwrap_or(0);
        heaviest as f64 / average - 1.0
    }
}

/// True when every block respects its capacity.
pub fn is_balanced(hg: &Hypergraph, context: &Context) -> bool {
    (0..hg.k()).all(|p| hg.part_weight(p) <= context.partition.max_part_weights[p as usize])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partitioned_fixture() -> Hypergraph {
        let mut hg = Hypergraph::new(
            3,
            &[1; 7],
            &[1, 1000, 1, 1000],
            &[vec![0, 2], vec![0, 1, 3, 4], vec![3, 4, 6], vec![2, 5, 6]],
        );
        for v in [0, 1, 3, 4] {
            hg.set_node_part(v, 0);
        }
        for v in [2, 5] {
            hg.set_node_part(v, 1);
        }
        hg.set_node_part(6, 2);
        hg
    }

    #[test]
    fn cut_counts_spanning_edges_once() {
        let hg = partitioned_fixture();
        // Edges {0,2}, {3,4,6} and {2,5,6} are cut, {0,1,3,4} is not.
        assert_eq!(cut(&hg), 1 + 1 + 1000);
    }

    #[test]
    fn km1_weights_by_spanned_blocks() {
        let hg = partitioned_fixture();
        // λ = 2, 1, 2, 2 respectively.
        assert_eq!(km1(&hg), 1 + 0 + 1 + 1000);
    }

    #[test]
    fn imbalance_relative_to_average() {
        let hg = partitioned_fixture();
        let mut context = Context::default();
        context.partition.k = 3;
        // heaviest = 4, ceil(7/3) = 3.
        assert!((imbalance(&hg, &context) - (4.0 / 3.0 - 1.0)).abs() < 1e-9);
    }
}
