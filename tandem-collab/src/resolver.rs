//! Conflict resolution after the gate returns `Conflict { latest }`.
//!
//! Stream content replays the buffered operations on top of the newer
//! server state, after mapping them past what changed upstream. Whole-state
//! content is merged three ways against the last confirmed base.
//!
//! An operation that can no longer be placed is dropped and counted, never
//! surfaced as an error.

use tandem_core::{ContentCapability, ContentKind};

/// Result of folding local work onto a newer server state.
#[derive(Debug, Clone, PartialEq)]
pub struct RebaseReport<D, O> {
    /// New local content.
    pub content: D,
    /// Operations still pending relative to the adopted base.
    pub ops: Vec<O>,
    /// Local operations that were discarded.
    pub dropped: usize,
}

/// Rebase `pending` (defined against `ancestor`, producing `local`) onto `latest`.
pub fn rebase<C: ContentCapability>(
    capability: &C,
    ancestor: &C::Doc,
    local: &C::Doc,
    pending: &[C::Op],
    latest: &C::Doc,
) -> RebaseReport<C::Doc, C::Op> {
    match capability.kind() {
        ContentKind::Stream => replay(capability, ancestor, pending, latest),
        ContentKind::WholeState => {
            let content = capability.merge_whole_state(local, latest, ancestor);
            let ops = capability.diff(latest, &content);
            RebaseReport {
                content,
                ops,
                dropped: 0,
            }
        }
    }
}

fn replay<C: ContentCapability>(
    capability: &C,
    ancestor: &C::Doc,
    pending: &[C::Op],
    latest: &C::Doc,
) -> RebaseReport<C::Doc, C::Op> {
    let upstream = capability.diff(ancestor, latest);
    let mapped = capability.rebase_ops(pending, &upstream);

    let mut content = latest.clone();
    let mut ops = Vec::with_capacity(pending.len());
    let mut dropped = 0;

    for (original, op) in pending.iter().zip(mapped) {
        let Some(op) = op else {
            log::warn!("Dropping local edit {original:?}: its target was changed upstream");
            dropped += 1;
            continue;
        };
        match capability.apply_op(&content, &op) {
            Ok(next) => {
                content = next;
                ops.push(op);
            }
            Err(e) => {
                log::warn!("Dropping local edit {op:?}: {e}");
                dropped += 1;
            }
        }
    }

    RebaseReport {
        content,
        ops,
        dropped,
    }
}
