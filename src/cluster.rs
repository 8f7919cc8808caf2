//! Cluster node-list resolution and sweep partitioning.
//!
//! Cluster job schedulers report allocated nodes in a condensed notation
//! such as `node[001-004,007],login01`. This module is the single place
//! that parses that textual contract, validates it against the externally
//! known node count, and derives this process's share of a sweep.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeListError {
    #[error("malformed node list {input:?}: {reason}")]
    Format { input: String, reason: String },

    #[error("node list {input:?} expands to {actual} nodes, expected {expected}")]
    CountMismatch {
        input: String,
        expected: usize,
        actual: usize,
    },

    #[error("node {node:?} is not part of node list {input:?}")]
    Membership { node: String, input: String },
}

/// Node-list notations understood by [`resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeListMode {
    /// `prefix[ranges]` bracket notation mixed with bare node names.
    Condensed,
}

impl NodeListMode {
    /// Parse a mode string from configuration.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "condensed" => Some(Self::Condensed),
            _ => None,
        }
    }
}

/// Expand a condensed node-list string into an explicit, validated node list.
///
/// The result is sorted lexicographically ascending and deduplicated. The
/// expansion is validated against `expected_node_count`, and `this_node_id`
/// must be a member of the list.
///
/// # Errors
///
/// `Format` for an empty input, an unrecognized mode, or bad bracket syntax;
/// `CountMismatch` / `Membership` for failed validation.
pub fn resolve(
    node_list: &str,
    mode: &str,
    expected_node_count: usize,
    this_node_id: &str,
) -> Result<Vec<String>, NodeListError> {
    let format_err = |reason: &str| NodeListError::Format {
        input: node_list.to_string(),
        reason: reason.to_string(),
    };

    if node_list.trim().is_empty() {
        return Err(format_err("empty node list"));
    }
    match NodeListMode::parse(mode) {
        Some(NodeListMode::Condensed) => {}
        None => {
            return Err(NodeListError::Format {
                input: node_list.to_string(),
                reason: format!("unrecognized mode {:?}", mode),
            })
        }
    }

    let mut nodes = Vec::new();
    for atom in split_atoms(node_list) {
        let atom = atom.trim();
        if atom.is_empty() {
            return Err(format_err("empty node reference"));
        }
        match atom.find('[') {
            None => {
                if atom.contains(']') {
                    return Err(format_err("unmatched ']'"));
                }
                nodes.push(atom.to_string());
            }
            Some(open) => {
                let prefix = &atom[..open];
                let rest = &atom[open + 1..];
                let close = rest
                    .find(']')
                    .ok_or_else(|| format_err("unmatched '['"))?;
                if !rest[close + 1..].is_empty() {
                    return Err(format_err("trailing characters after ']'"));
                }
                expand_bracket(prefix, &rest[..close], &mut nodes)
                    .map_err(|reason| format_err(&reason))?;
            }
        }
    }

    nodes.sort();
    nodes.dedup();

    if nodes.len() != expected_node_count {
        return Err(NodeListError::CountMismatch {
            input: node_list.to_string(),
            expected: expected_node_count,
            actual: nodes.len(),
        });
    }
    if !nodes.iter().any(|n| n == this_node_id) {
        return Err(NodeListError::Membership {
            node: this_node_id.to_string(),
            input: node_list.to_string(),
        });
    }

    Ok(nodes)
}

/// Split on top-level commas, leaving bracket groups intact.
fn split_atoms(input: &str) -> Vec<&str> {
    let mut atoms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in input.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                atoms.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    atoms.push(&input[start..]);
    atoms
}

/// Expand one `prefix[ranges]` group. All numbers in a group share the
/// zero-padding width of the first entry.
fn expand_bracket(prefix: &str, ranges: &str, out: &mut Vec<String>) -> Result<(), String> {
    if ranges.is_empty() {
        return Err("empty bracket group".to_string());
    }
    let mut width = None;
    for part in ranges.split(',') {
        let part = part.trim();
        let (start_text, stop_text) = match part.split_once('-') {
            Some((a, b)) => (a, b),
            None => (part, part),
        };
        let start: u64 = start_text
            .parse()
            .map_err(|_| format!("invalid range start {:?}", start_text))?;
        let stop: u64 = stop_text
            .parse()
            .map_err(|_| format!("invalid range stop {:?}", stop_text))?;
        if stop < start {
            return Err(format!("descending range {:?}", part));
        }
        let width = *width.get_or_insert(start_text.len());
        for n in start..=stop {
            out.push(format!("{}{:0width$}", prefix, n, width = width));
        }
    }
    Ok(())
}

/// This process's identity within a resolved cluster allocation.
#[derive(Debug, Clone)]
pub struct ClusterContext {
    nodes: Vec<String>,
    node_name: String,
    node_index: usize,
}

impl ClusterContext {
    /// Resolve the node list and locate `node_name` within it.
    pub fn resolve(
        node_list: &str,
        mode: &str,
        num_nodes: usize,
        node_name: &str,
    ) -> Result<Self, NodeListError> {
        let nodes = resolve(node_list, mode, num_nodes, node_name)?;
        // Membership was just validated, so position() always finds the node.
        let node_index = nodes
            .iter()
            .position(|n| n == node_name)
            .unwrap_or_default();
        tracing::info!(
            node = node_name,
            index = node_index,
            total = nodes.len(),
            "Resolved cluster allocation"
        );
        Ok(Self {
            nodes,
            node_name: node_name.to_string(),
            node_index,
        })
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn node_index(&self) -> usize {
        self.node_index
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// This node's share of a sweep: item `i` belongs to node `i % num_nodes`.
    ///
    /// Every node applies the same rule to the same ordered item list, so the
    /// shares are disjoint and jointly cover the sweep.
    pub fn assigned<T>(&self, items: Vec<T>) -> Vec<T> {
        let num_nodes = self.nodes.len();
        items
            .into_iter()
            .enumerate()
            .filter(|(i, _)| i % num_nodes == self.node_index)
            .map(|(_, item)| item)
            .collect()
    }
}
