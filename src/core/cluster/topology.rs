// src/core/cluster/topology.rs

//! Parsing of the cluster-control replies the router depends on:
//! `CLUSTER SLOTS` for the slot layout and `CLUSTER INFO` for the ready check.

use crate::connection::NodeEndpoint;
use crate::core::ClusterError;
use crate::core::protocol::{RespFrame, command_frame};
use crate::core::slot::NUM_SLOTS;
use bytes::Bytes;
use std::collections::HashMap;

/// One row of a `CLUSTER SLOTS` reply: an inclusive slot range and the nodes
/// serving it, primary first.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
    /// `(endpoint, read_only)`; the first entry is the primary.
    pub nodes: Vec<(NodeEndpoint, bool)>,
}

impl SlotRange {
    /// The node keys of this range, primary first.
    pub fn keys(&self) -> Vec<String> {
        self.nodes.iter().map(|(endpoint, _)| endpoint.key()).collect()
    }
}

/// The outgoing `CLUSTER SLOTS` frame.
pub fn slots_frame() -> RespFrame {
    command_frame("CLUSTER", &[Bytes::from_static(b"SLOTS")])
}

/// The outgoing `CLUSTER INFO` frame.
pub fn info_frame() -> RespFrame {
    command_frame("CLUSTER", &[Bytes::from_static(b"INFO")])
}

/// The outgoing `QUIT` frame.
pub fn quit_frame() -> RespFrame {
    command_frame("QUIT", &[])
}

/// Parses a `CLUSTER SLOTS` reply into slot ranges.
///
/// Each row is `[slotStart, slotEnd, primary, replica…]` where an endpoint is
/// `[host, port, …]`. The first endpoint of a row is its primary.
pub fn parse_cluster_slots(frame: &RespFrame) -> Result<Vec<SlotRange>, ClusterError> {
    let RespFrame::Array(rows) = frame else {
        return Err(ClusterError::ProtocolError(
            "malformed CLUSTER SLOTS reply".to_string(),
        ));
    };
    rows.iter().map(parse_slot_row).collect()
}

fn parse_slot_row(row: &RespFrame) -> Result<SlotRange, ClusterError> {
    let malformed = || ClusterError::ProtocolError("malformed CLUSTER SLOTS row".to_string());

    let RespFrame::Array(items) = row else {
        return Err(malformed());
    };
    let (RespFrame::Integer(start), RespFrame::Integer(end)) =
        (items.first().ok_or_else(malformed)?, items.get(1).ok_or_else(malformed)?)
    else {
        return Err(malformed());
    };
    let (start, end) = (*start, *end);
    if start < 0 || end < start || end >= NUM_SLOTS as i64 {
        return Err(malformed());
    }

    let mut nodes = Vec::with_capacity(items.len().saturating_sub(2));
    for (index, item) in items[2..].iter().enumerate() {
        let endpoint = parse_endpoint(item).ok_or_else(malformed)?;
        // The first endpoint of the row is its primary; the rest are replicas.
        nodes.push((endpoint, index > 0));
    }
    if nodes.is_empty() {
        return Err(malformed());
    }

    Ok(SlotRange {
        start: start as u16,
        end: end as u16,
        nodes,
    })
}

fn parse_endpoint(item: &RespFrame) -> Option<NodeEndpoint> {
    let RespFrame::Array(parts) = item else {
        return None;
    };
    let RespFrame::BulkString(host) = parts.first()? else {
        return None;
    };
    let RespFrame::Integer(port) = parts.get(1)? else {
        return None;
    };
    if host.is_empty() || *port < 0 || *port > u16::MAX as i64 {
        return None;
    }
    Some(NodeEndpoint::new(
        String::from_utf8_lossy(host).into_owned(),
        *port as u16,
    ))
}

/// Computes the authoritative node set from parsed ranges: the union of every
/// endpoint, where an endpoint listed as a primary anywhere is a primary.
pub fn node_set(ranges: &[SlotRange]) -> Vec<(NodeEndpoint, bool)> {
    let mut merged: HashMap<String, (NodeEndpoint, bool)> = HashMap::new();
    for range in ranges {
        for (endpoint, read_only) in &range.nodes {
            merged
                .entry(endpoint.key())
                .and_modify(|entry| entry.1 &= *read_only)
                .or_insert_with(|| (endpoint.clone(), *read_only));
        }
    }
    merged.into_values().collect()
}

/// Extracts the `cluster_state` value from a `CLUSTER INFO` reply.
pub fn cluster_state(frame: &RespFrame) -> Option<String> {
    let text = match frame {
        RespFrame::BulkString(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        RespFrame::SimpleString(text) => text.clone(),
        _ => return None,
    };
    for line in text.lines() {
        if let Some(value) = line.strip_prefix("cluster_state:") {
            return Some(value.trim().to_string());
        }
    }
    None
}
