use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};

/// One channel asking for one piece of content
#[derive(Debug, Clone)]
pub struct CompileRequest<C> {
    pub channel: String,
    pub tags: BTreeSet<String>,
    /// Empty means every group
    pub groups: BTreeSet<u32>,
    pub content: C,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledOp<C> {
    /// Hex SHA-256 of the canonical content bytes
    pub key: String,
    pub content: C,
    pub channels: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub groups: BTreeSet<u32>,
    /// Distinct non-empty group subsets were requested for this content
    pub group_conflict: bool,
}

/// Union of two group subsets where empty stands for every group
///
/// Returns the merged set and whether the inputs were distinct non-empty subsets.
pub fn merge_groups(a: &BTreeSet<u32>, b: &BTreeSet<u32>) -> (BTreeSet<u32>, bool) {
    if a.is_empty() || b.is_empty() {
        return (BTreeSet::new(), false);
    }
    (a.union(b).copied().collect(), a != b)
}

/// Collapses requests with byte-identical content into single operations
pub struct Compiler;

impl Compiler {
    /// Canonical bytes of `content`; object keys are emitted sorted
    pub fn content_bytes<C: Serialize>(content: &C) -> Vec<u8> {
        serde_json::to_value(content)
            .and_then(|v| serde_json::to_vec(&v))
            .unwrap_or_default()
    }

    /// Ops come out in order of first request
    pub fn compile<C: Serialize>(requests: Vec<CompileRequest<C>>) -> Vec<CompiledOp<C>> {
        let mut ops: Vec<CompiledOp<C>> = Vec::new();
        let mut index: HashMap<Vec<u8>, usize> = HashMap::new();

        for request in requests {
            let bytes = Self::content_bytes(&request.content);

            match index.get(&bytes) {
                Some(&i) => {
                    let op = &mut ops[i];
                    let (groups, conflict) = merge_groups(&op.groups, &request.groups);
                    if conflict && !op.group_conflict {
                        log::warn!(
                            "⚠️  Group conflict on {}: {:?} vs {:?} from channel {}, keeping union",
                            op.key,
                            op.groups,
                            request.groups,
                            request.channel
                        );
                    }
                    op.groups = groups;
                    op.group_conflict |= conflict;
                    op.channels.insert(request.channel);
                    op.tags.extend(request.tags);
                }
                None => {
                    let key = hex::encode(Sha256::digest(&bytes));
                    index.insert(bytes, ops.len());
                    ops.push(CompiledOp {
                        key,
                        content: request.content,
                        channels: BTreeSet::from([request.channel]),
                        tags: request.tags,
                        groups: request.groups,
                        group_conflict: false,
                    });
                }
            }
        }

        ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(channel: &str, content: serde_json::Value, groups: &[u32]) -> CompileRequest<serde_json::Value> {
        CompileRequest {
            channel: channel.to_string(),
            tags: BTreeSet::from([format!("tag_{}", channel)]),
            groups: groups.iter().copied().collect(),
            content,
        }
    }

    #[test]
    fn test_identical_content_merges() {
        let ops = Compiler::compile(vec![
            request("A", json!({ "unit": "T2Fit", "config": { "b": 1, "a": 2 } }), &[]),
            request("B", json!({ "config": { "a": 2, "b": 1 }, "unit": "T2Fit" }), &[]),
            request("C", json!({ "unit": "T2Other" }), &[]),
        ]);

        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].channels, BTreeSet::from(["A".to_string(), "B".to_string()]));
        assert_eq!(
            ops[0].tags,
            BTreeSet::from(["tag_A".to_string(), "tag_B".to_string()])
        );
        assert_ne!(ops[0].key, ops[1].key);
    }

    #[test]
    fn test_no_duplicate_content_in_output() {
        let ops = Compiler::compile(
            (0..5)
                .map(|i| request(&format!("C{}", i), json!({ "unit": "T2Same" }), &[]))
                .collect(),
        );
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].channels.len(), 5);
    }

    #[test]
    fn test_group_conflict_is_union_and_flag() {
        let ops = Compiler::compile(vec![
            request("A", json!({ "unit": "T2Fit" }), &[1, 2]),
            request("B", json!({ "unit": "T2Fit" }), &[2, 3]),
        ]);

        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].groups, BTreeSet::from([1, 2, 3]));
        assert!(ops[0].group_conflict);
    }

    #[test]
    fn test_all_groups_absorbs_subsets() {
        let (merged, conflict) = merge_groups(&BTreeSet::from([1]), &BTreeSet::new());
        assert!(merged.is_empty());
        assert!(!conflict);

        let (merged, conflict) = merge_groups(&BTreeSet::from([4]), &BTreeSet::from([4]));
        assert_eq!(merged, BTreeSet::from([4]));
        assert!(!conflict);
    }
}
