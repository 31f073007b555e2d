//! Named directive nodes chained into a DAG
//!
//! Cycles are rejected at load with a three-colour depth-first search.
//! Resolution walks the chain with an explicit stack and drops nodes whose
//! content was already visited under another name.

use super::DirectiveNode;
use crate::error::DirectiveError;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Colour {
    White,
    Grey,
    Black,
}

#[derive(Debug, Clone, Default)]
pub struct DirectiveGraph {
    nodes: BTreeMap<String, DirectiveNode>,
}

impl DirectiveGraph {
    pub fn new(nodes: BTreeMap<String, DirectiveNode>) -> Result<Self, DirectiveError> {
        let graph = Self { nodes };
        graph.validate()?;
        Ok(graph)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    fn validate(&self) -> Result<(), DirectiveError> {
        for (name, node) in &self.nodes {
            for next in &node.chain {
                if !self.nodes.contains_key(next) {
                    return Err(DirectiveError::UnknownNode {
                        referenced_by: format!("Directive {}", name),
                        name: next.clone(),
                    });
                }
            }
        }

        let mut colours: HashMap<&str, Colour> =
            self.nodes.keys().map(|k| (k.as_str(), Colour::White)).collect();

        for start in self.nodes.keys() {
            if colours.get(start.as_str()) != Some(&Colour::White) {
                continue;
            }

            // (node, index of the next chain entry to explore)
            let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
            colours.insert(start.as_str(), Colour::Grey);

            while let Some((name, idx)) = stack.last().copied() {
                let chain = self.nodes.get(name).map(|n| n.chain.as_slice()).unwrap_or(&[]);

                if idx >= chain.len() {
                    colours.insert(name, Colour::Black);
                    stack.pop();
                    continue;
                }
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }

                let next = chain[idx].as_str();
                match colours.get(next).copied().unwrap_or(Colour::White) {
                    Colour::White => {
                        colours.insert(next, Colour::Grey);
                        stack.push((next, 0));
                    }
                    Colour::Grey => {
                        let from = stack.iter().position(|(n, _)| *n == next).unwrap_or(0);
                        let mut path: Vec<String> =
                            stack[from..].iter().map(|(n, _)| n.to_string()).collect();
                        path.push(next.to_string());
                        return Err(DirectiveError::Cycle(path));
                    }
                    Colour::Black => {}
                }
            }
        }

        Ok(())
    }

    /// Nodes reachable from `root` in depth-first pre-order, structurally unique
    pub fn resolve(&self, root: &str) -> Vec<&DirectiveNode> {
        let mut resolved = Vec::new();
        let mut seen_names: HashSet<&str> = HashSet::new();
        let mut seen_content: HashSet<[u8; 32]> = HashSet::new();
        let mut worklist: Vec<&str> = vec![root];

        while let Some(name) = worklist.pop() {
            if !seen_names.insert(name) {
                continue;
            }
            let Some(node) = self.nodes.get(name) else {
                continue;
            };

            if seen_content.insert(content_hash(node)) {
                resolved.push(node);
            }

            for next in node.chain.iter().rev() {
                worklist.push(next.as_str());
            }
        }

        resolved
    }
}

fn content_hash(node: &DirectiveNode) -> [u8; 32] {
    // chain targets are visited separately; identity is the node's own payload
    let payload = serde_json::to_vec(&(&node.stock_t2, &node.point_t2, &node.combine))
        .unwrap_or_default();
    Sha256::digest(&payload).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::T2Compute;
    use serde_json::json;

    fn node(unit: &str, chain: &[&str]) -> DirectiveNode {
        DirectiveNode {
            stock_t2: vec![T2Compute {
                unit: unit.to_string(),
                config: json!({}),
                group: Default::default(),
            }],
            chain: chain.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_depth_first() {
        let nodes = BTreeMap::from([
            ("root".to_string(), node("R", &["left", "right"])),
            ("left".to_string(), node("L", &["leaf"])),
            ("right".to_string(), node("Rt", &["leaf"])),
            ("leaf".to_string(), node("F", &[])),
        ]);
        let graph = DirectiveGraph::new(nodes).unwrap();

        let units: Vec<&str> = graph
            .resolve("root")
            .iter()
            .map(|n| n.stock_t2[0].unit.as_str())
            .collect();
        assert_eq!(units, vec!["R", "L", "F", "Rt"]);
    }

    #[test]
    fn test_structural_duplicates_collapse() {
        let nodes = BTreeMap::from([
            ("root".to_string(), node("R", &["a", "b"])),
            ("a".to_string(), node("Same", &[])),
            ("b".to_string(), node("Same", &[])),
        ]);
        let graph = DirectiveGraph::new(nodes).unwrap();
        assert_eq!(graph.resolve("root").len(), 2);
    }

    #[test]
    fn test_cycle_detected() {
        let nodes = BTreeMap::from([
            ("a".to_string(), node("A", &["b"])),
            ("b".to_string(), node("B", &["c"])),
            ("c".to_string(), node("C", &["a"])),
        ]);
        match DirectiveGraph::new(nodes) {
            Err(DirectiveError::Cycle(path)) => {
                assert_eq!(path, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_self_loop_and_unknown_reference() {
        let looped = BTreeMap::from([("a".to_string(), node("A", &["a"]))]);
        assert!(matches!(DirectiveGraph::new(looped), Err(DirectiveError::Cycle(_))));

        let dangling = BTreeMap::from([("a".to_string(), node("A", &["ghost"]))]);
        assert!(matches!(
            DirectiveGraph::new(dangling),
            Err(DirectiveError::UnknownNode { .. })
        ));
    }
}
