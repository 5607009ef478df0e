use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::warn;

use crate::error::{Error, Result};
use crate::hypergraph::Hypergraph;
use crate::{HyperedgeWeight, HypernodeId, NodeWeight, PartitionId};

/// Reads a hypergraph in hMetis format: a header `|E| |V| [fmt]`, one pin
/// line per hyperedge (1-based indices), then per-hyperedge and per-vertex
/// weights depending on fmt (1 = edge weights, 10 = node weights, 11 =
/// both). `%` starts a comment line. Hyperedges larger than
/// `max_hyperedge_size` and single-pin hyperedges are dropped.
pub fn read_hypergraph(
    path: &Path,
    k: u32,
    max_hyperedge_size: Option<usize>,
) -> Result<Hypergraph> {
    let content = fs::read_to_string(path)?;
    parse_hypergraph(&content, k, max_hyperedge_size, &path.display().to_string())
}

pub(crate) fn parse_hypergraph(
    content: &str,
    k: u32,
    max_hyperedge_size: Option<usize>,
    file: &str,
) -> Result<Hypergraph> {
    let malformed = |reason: String| Error::MalformedInput {
        file: file.to_string(),
        reason,
    };

    let mut lines = content
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.trim_start().starts_with('%'));
    let header = lines
        .next()
        .ok_or_else(|| malformed("missing header line".to_string()))?;
    let fields: Vec<&str> = header.split_whitespace().collect();
    if fields.len() < 2 {
        return Err(malformed(format!("bad header '{header}'")));
    }
    let num_edges: usize = fields[0]
        .parse()
        .map_err(|_| malformed(format!("bad hyperedge count '{}'", fields[0])))?;
    let num_nodes: usize = fields[1]
        .parse()
        .map_err(|_| malformed(format!("bad vertex count '{}'", fields[1])))?;
    let fmt = if fields.len() > 2 { fields[2] } else { "0" };
    let (has_edge_weights, has_node_weights) = match fmt {
        "0" => (false, false),
        "1" => (true, false),
        "10" => (false, true),
        "11" => (true, true),

        other => return Err(malformed(format!("unknown fmt '{other}'"))),
    };

    let mut edge_weights: Vec<HyperedgeWeight> = vec![];
    let mut nets: Vec<Vec<HypernodeId>> = vec![];
    for e in 0..num_edges {
        let line = lines
            .next()
            .ok_or_else(|| malformed(format!("missing hyperedge line {}", e + 1)))?;
        let mut numbers = line.split_whitespace().map(|t| {
            t.parse::<i64>()
                .map_err(|_| malformed(format!("bad token '{t}' in hyperedge {}", e + 1)))
        });
        let weight: HyperedgeWeight = if has_edge_weights {
            let w = numbers
                .next()
                .ok_or_else(|| malformed(format!("missing weight of hyperedge {}", e + 1)))??;
            if w <= 0 {
                return Err(malformed(format!("non-positive weight of hyperedge {}", e + 1)));
            }
            w
        } else {
            1
        };
        let mut pins: Vec<HypernodeId> = vec![];
        for pin in numbers {
            let pin = pin?;
            if pin < 1 || pin as usize > num_nodes {
                return Err(malformed(format!("pin {pin} out of range in hyperedge {}", e + 1)));
            }
            pins.push((pin - 1) as HypernodeId);
        }
        pins.sort_unstable();
        pins.dedup();
        if pins.len() < 2 {
            warn!("dropping single-pin hyperedge {} of {file}", e + 1);
            continue;
        }
        if max_hyperedge_size.is_some_and(|limit| pins.len() > limit) {
            continue;
        }
        edge_weights.push(weight);
        nets.push(pins);
    }

    let mut node_weights: Vec<NodeWeight> = vec![1; num_nodes];
    if has_node_weights {
        for v in 0..num_nodes {
            let line = lines
                .next()
                .ok_or_else(|| malformed(format!("missing weight of vertex {}", v + 1)))?;
            let w: NodeWeight = line
                .trim()
                .parse()
                .map_err(|_| malformed(format!("bad weight of vertex {}", v + 1)))?;
            if w < 0 {
                return Err(malformed(format!("negative weight of vertex {}", v + 1)));
            }
            node_weights[v] = w;
        }
    }

    Ok(Hypergraph::new(k, &node_weights, &edge_weights, &nets))
}

/// `<input>.part<k>.epsilon<ε>.seed<seed>.KaHyPar`
pub fn partition_file_name(input: &Path, k: u32, epsilon: f64, seed: u64) -> PathBuf {
    let mut name = input.as_os_str().to_os_string();
    name.push(format!(".part{k}.epsilon{epsilon}.seed{seed}.KaHyPar"));
    PathBuf::from(name)
}

/// One block id per vertex, in vertex order.
pub fn write_partition(path: &Path, partition: &[PartitionId]) -> Result<()> {
    let mut out = String::with_capacity(partition.len() * 2);
    for &p in partition {
        out.push_str(&p.to_string());
        out.push('\n');
    }
    let mut file = fs::File::create(path)?;
    file.write_all(out.as_bytes())?;
    Ok(())
}

pub fn read_partition(path: &Path) -> Result<Vec<PartitionId>> {
    let content = fs::read_to_string(path)?;
    content
        .lines()
        .map(|l| {
            l.trim().parse::<PartitionId>().map_err(|_| Error::MalformedInput {
                file: path.display().to_string(),
                reason: format!("bad block id '{l}'"),
            })
        })
        .collect()
}

/// One integer per vertex; −1 marks a free vertex, any other value forces
/// the vertex into that block for the whole run.
pub fn apply_fixed_vertices(hg: &mut Hypergraph, path: &Path, k: u32) -> Result<()> {
    let content = fs::read_to_string(path)?;
    let malformed = |reason: String| Error::MalformedInput {
        file: path.display().to_string(),
        reason,
    };
    let values: Vec<i64> = content
        .split_whitespace()
        .map(|t| {
            t.parse::<i64>()
                .map_err(|_| malformed(format!("bad fixed-vertex entry '{t}'")))
        })
        .collect::<Result<_>>()?;
    if values.len() != hg.initial_num_nodes() {
        return Err(malformed(format!(
            "expected {} fixed-vertex entries, found {}",
            hg.initial_num_nodes(),
            values.len()
        )));
    }
    for (v, &value) in values.iter().enumerate() {
        match value {
            -1 => {}
            b if b >= 0 && (b as u32) < k => {
                hg.set_fixed_vertex(v as HypernodeId, b as PartitionId);
            }
            b => {
                return Err(malformed(format!("fixed block {b} out of range for k={k}")));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_plain_format() {
        let content = "% a comment\n4 7 \n1 3\n1 2 4 5\n4 5 7\n3 6 7\n";
        let hg = parse_hypergraph(content, 2, None, "test.hgr").unwrap();
        assert_eq!(hg.num_nodes(), 7);
        assert_eq!(hg.num_edges(), 4);
        let pins: Vec<_> = hg.pins(1).collect();
        assert_eq!(pins, vec![0, 1, 3, 4]);
        assert_eq!(hg.edge_weight(0), 1);
        assert_eq!(hg.node_weight(0), 1);
    }

    #[test]
    fn parses_edge_and_node_weights() {
        let content = "2 3 11\n7 1 2\n9 2 3\n10\n20\n30\n";
        let hg = parse_hypergraph(content, 2, None, "test.hgr").unwrap();
        assert_eq!(hg.edge_weight(0), 7);
        assert_eq!(hg.edge_weight(1), 9);
        assert_eq!(hg.node_weight(0), 10);
        assert_eq!(hg.node_weight(2), 30);
        assert_eq!(hg.total_weight(), 60);
    }

    #[test]
    fn drops_oversized_and_single_pin_hyperedges() {
        let content = "3 5 \n1 2 3 4 5\n2 3\n4\n";
        let hg = parse_hypergraph(content, 2, Some(3), "test.hgr").unwrap();
        // The 5-pin hyperedge exceeds the threshold, the 1-pin one carries
        // no cut information.
        assert_eq!(hg.num_edges(), 1);
        assert_eq!(hg.pins(0).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse_hypergraph("", 2, None, "x").is_err());
        assert!(parse_hypergraph("2 3\n1 2\n", 2, None, "x").is_err());
        assert!(parse_hypergraph("1 3\n1 9\n", 2, None, "x").is_err());
        assert!(parse_hypergraph("1 3 7\n1 2\n", 2, None, "x").is_err());
    }

    #[test]
    fn partition_file_round_trips() {
        let partition: Vec<PartitionId> = vec![0, 0, 1, 0, 0, 1, 1];
        let path = std::env::temp_dir().join(format!(
            "hypart-io-test-{}.part",
            std::process::id()
        ));
        write_partition(&path, &partition).unwrap();
        let read_back = read_partition(&path).unwrap();
        fs::remove_file(&path).ok();
        assert_eq!(read_back, partition);
    }

    #[test]
    fn partition_file_name_matches_the_convention() {
        let name = partition_file_name(Path::new("ibm01.hgr"), 4, 0.03, 42);
        assert_eq!(
            name.to_string_lossy(),
            "ibm01.hgr.part4.epsilon0.03.seed42.KaHyPar"
        );
    }

    #[test]
    fn fixed_vertex_file_must_cover_every_vertex() {
        let content = "2 3\n1 2\n2 3\n";
        let mut hg = parse_hypergraph(content, 2, None, "x").unwrap();
        let path = std::env::temp_dir().join(format!(
            "hypart-fixed-test-{}.fix",
            std::process::id()
        ));
        fs::write(&path, "-1 0\n").unwrap();
        let truncated = apply_fixed_vertices(&mut hg, &path, 2);
        assert!(truncated.is_err());
        fs::write(&path, "-1 0 1\n").unwrap();
        apply_fixed_vertices(&mut hg, &path, 2).unwrap();
        fs::remove_file(&path).ok();
        assert!(!hg.is_fixed(0));
        assert_eq!(hg.fixed_block(1), Some(0));
        assert_eq!(hg.fixed_block(2), Some(1));
    }
}
