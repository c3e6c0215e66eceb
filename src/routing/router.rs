//! # Target Router
//!
//! Resolves a routing directive against a registry snapshot.
//!
//! [`select`] is the pure selection rule per [`TargetType`]. [`resolve`] adds
//! the sender-aware policy the relay applies before delivery: optional
//! removal of the sender itself, and the distinction between
//! `SelfReferenceRejected` (a `DIRECT` send whose only candidate was the
//! sender) and `NoTargetFound` (everything else that comes up empty).

use std::sync::Arc;

use crate::error::{constants, ProtocolError};
use crate::protocol::envelope::{ErrorKind, ErrorPacket, TargetType};
use crate::routing::registry::PeerRecord;

/// Why an envelope could not be routed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    NoTargetFound { target_type: TargetType, target: String },
    SelfReferenceRejected { peer: String },
    /// `SERVER` envelopes never reach the router
    LocalTarget,
}

impl RouteError {
    /// Error packet reported back to the sender
    pub fn to_packet(&self) -> ErrorPacket {
        match self {
            RouteError::NoTargetFound {
                target_type,
                target,
            } => ErrorPacket::new(
                ErrorKind::NoTargetFound,
                format!("{} ({target_type:?} '{target}')", constants::ERR_NO_TARGET),
            ),
            RouteError::SelfReferenceRejected { peer } => ErrorPacket::new(
                ErrorKind::SelfReferenceRejected,
                format!("{} ('{peer}')", constants::ERR_SELF_REFERENCE),
            ),
            RouteError::LocalTarget => ErrorPacket::remote("SERVER envelopes are not routable"),
        }
    }
}

impl From<RouteError> for ProtocolError {
    fn from(error: RouteError) -> Self {
        ProtocolError::from(&error.to_packet())
    }
}

/// Apply the selection rule for `target_type` to `snapshot`.
///
/// Load-balanced selection picks the least recently written peer of the
/// group; ties go to the earliest-registered peer.
pub fn select(
    target_type: TargetType,
    identifier: &str,
    snapshot: &[Arc<PeerRecord>],
) -> Vec<Arc<PeerRecord>> {
    match target_type {
        TargetType::Direct => snapshot
            .iter()
            .filter(|p| p.unique_id() == identifier)
            .take(1)
            .cloned()
            .collect(),
        TargetType::Type => snapshot
            .iter()
            .filter(|p| p.group() == identifier)
            .cloned()
            .collect(),
        TargetType::LoadBalanced => least_recently_written(
            snapshot.iter().filter(|p| p.group() == identifier),
        )
        .into_iter()
        .collect(),
        TargetType::Broadcast => snapshot.to_vec(),
        TargetType::Server => Vec::new(),
    }
}

fn least_recently_written<'a>(
    candidates: impl Iterator<Item = &'a Arc<PeerRecord>>,
) -> Option<Arc<PeerRecord>> {
    let mut best: Option<&Arc<PeerRecord>> = None;
    for candidate in candidates {
        match best {
            Some(current) if current.last_write() <= candidate.last_write() => {}
            _ => best = Some(candidate),
        }
    }
    best.cloned()
}

/// Resolve the destination set for an envelope from `sender`.
pub fn resolve(
    target_type: TargetType,
    identifier: &str,
    sender: &str,
    allow_self_forward: bool,
    snapshot: &[Arc<PeerRecord>],
) -> Result<Vec<Arc<PeerRecord>>, RouteError> {
    if target_type == TargetType::Server {
        return Err(RouteError::LocalTarget);
    }

    let selected = if target_type == TargetType::LoadBalanced && !allow_self_forward {
        // Exclude the sender before picking so another group member can win
        let others: Vec<_> = snapshot
            .iter()
            .filter(|p| p.unique_id() != sender)
            .cloned()
            .collect();
        select(target_type, identifier, &others)
    } else {
        select(target_type, identifier, snapshot)
    };

    let had_candidates = !selected.is_empty();
    let targets: Vec<_> = if allow_self_forward {
        selected
    } else {
        selected
            .into_iter()
            .filter(|p| p.unique_id() != sender)
            .collect()
    };

    if !targets.is_empty() {
        return Ok(targets);
    }

    if had_candidates && target_type == TargetType::Direct {
        return Err(RouteError::SelfReferenceRejected {
            peer: sender.to_string(),
        });
    }

    Err(RouteError::NoTargetFound {
        target_type,
        target: identifier.to_string(),
    })
}
