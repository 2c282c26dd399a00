//! Plain-text stream content.
//!
//! Positions are counted in Unicode scalar values, never bytes. Deletes carry
//! the text they remove so that replaying one against a base whose region was
//! rewritten fails instead of deleting the wrong characters.

use serde::{Deserialize, Serialize};

use crate::content::{ContentCapability, ContentError, ContentKind};

/// A single replayable text edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextOp {
    Insert { at: usize, text: String },
    Delete { at: usize, text: String },
}

impl TextOp {
    pub fn insert(at: usize, text: impl Into<String>) -> Self {
        TextOp::Insert { at, text: text.into() }
    }

    pub fn delete(at: usize, text: impl Into<String>) -> Self {
        TextOp::Delete { at, text: text.into() }
    }

    /// Character position the operation targets.
    pub fn at(&self) -> usize {
        match self {
            TextOp::Insert { at, .. } | TextOp::Delete { at, .. } => *at,
        }
    }

    /// Length of the inserted or deleted run, in characters.
    pub fn char_len(&self) -> usize {
        match self {
            TextOp::Insert { text, .. } | TextOp::Delete { text, .. } => text.chars().count(),
        }
    }

    /// The op that undoes this one, defined on the state it produced.
    pub fn inverse(&self) -> Self {
        match self {
            TextOp::Insert { at, text } => TextOp::Delete { at: *at, text: text.clone() },
            TextOp::Delete { at, text } => TextOp::Insert { at: *at, text: text.clone() },
        }
    }

    fn moved_to(&self, at: usize) -> Self {
        match self {
            TextOp::Insert { text, .. } => TextOp::Insert { at, text: text.clone() },
            TextOp::Delete { text, .. } => TextOp::Delete { at, text: text.clone() },
        }
    }
}

/// Capability for plain-text documents (`Doc = String`).
#[derive(Debug, Clone, Copy, Default)]
pub struct TextContent;

impl TextContent {
    pub fn new() -> Self {
        Self
    }
}

/// Byte offset of the `char_idx`-th character; `None` past the end.
fn byte_offset(s: &str, char_idx: usize) -> Option<usize> {
    s.char_indices()
        .map(|(b, _)| b)
        .chain(std::iter::once(s.len()))
        .nth(char_idx)
}

/// Inclusion transform: rewrite `op` so it applies after `against`, where both
/// were defined on the same state. `op_first` breaks ties between two inserts
/// at the same position. Returns `None` when the regions overlap.
fn transform(op: &TextOp, against: &TextOp, op_first: bool) -> Option<TextOp> {
    let p = against.at();
    let n = against.char_len();
    let at = op.at();

    match (op, against) {
        (TextOp::Insert { .. }, TextOp::Insert { .. }) => {
            if at > p || (at == p && !op_first) {
                Some(op.moved_to(at + n))
            } else {
                Some(op.clone())
            }
        }
        (TextOp::Insert { .. }, TextOp::Delete { .. }) => {
            if at <= p {
                Some(op.clone())
            } else if at >= p + n {
                Some(op.moved_to(at - n))
            } else {
                None
            }
        }
        (TextOp::Delete { .. }, TextOp::Insert { .. }) => {
            let m = op.char_len();
            if p <= at {
                Some(op.moved_to(at + n))
            } else if p >= at + m {
                Some(op.clone())
            } else {
                None
            }
        }
        (TextOp::Delete { .. }, TextOp::Delete { .. }) => {
            let m = op.char_len();
            if at + m <= p {
                Some(op.clone())
            } else if at >= p + n {
                Some(op.moved_to(at - n))
            } else {
                None
            }
        }
    }
}

/// Map `op` past a sequence defined on the same state. Returns the mapped op
/// and the sequence rewritten to apply after it; `None` if any step overlaps.
fn map_through(op: &TextOp, seq: &[TextOp]) -> (Option<TextOp>, Vec<TextOp>) {
    let mut current = op.clone();
    let mut rewritten = Vec::with_capacity(seq.len());
    for s in seq {
        match (transform(s, &current, true), transform(&current, s, false)) {
            (Some(s_after), Some(next)) => {
                rewritten.push(s_after);
                current = next;
            }
            _ => return (None, seq.to_vec()),
        }
    }
    (Some(current), rewritten)
}

impl ContentCapability for TextContent {
    type Doc = String;
    type Op = TextOp;

    fn kind(&self) -> ContentKind {
        ContentKind::Stream
    }

    fn apply_op(&self, doc: &String, op: &TextOp) -> Result<String, ContentError> {
        let len = doc.chars().count();
        match op {
            TextOp::Insert { at, text } => {
                let b = byte_offset(doc, *at).ok_or_else(|| {
                    ContentError::OutOfRange(format!("insert at {at} beyond length {len}"))
                })?;
                let mut out = String::with_capacity(doc.len() + text.len());
                out.push_str(&doc[..b]);
                out.push_str(text);
                out.push_str(&doc[b..]);
                Ok(out)
            }
            TextOp::Delete { at, text } => {
                let end_char = at + text.chars().count();
                let (start, end) = match (byte_offset(doc, *at), byte_offset(doc, end_char)) {
                    (Some(s), Some(e)) => (s, e),
                    _ => {
                        return Err(ContentError::OutOfRange(format!(
                            "delete {at}..{end_char} beyond length {len}"
                        )))
                    }
                };
                if &doc[start..end] != text.as_str() {
                    return Err(ContentError::TargetMismatch(format!(
                        "expected {:?} at {at}, found {:?}",
                        text,
                        &doc[start..end]
                    )));
                }
                let mut out = String::with_capacity(doc.len() - (end - start));
                out.push_str(&doc[..start]);
                out.push_str(&doc[end..]);
                Ok(out)
            }
        }
    }

    fn diff(&self, old: &String, new: &String) -> Vec<TextOp> {
        let old: Vec<char> = old.chars().collect();
        let new: Vec<char> = new.chars().collect();

        let prefix = old.iter().zip(new.iter()).take_while(|(a, b)| a == b).count();
        let max_suffix = old.len().min(new.len()) - prefix;
        let suffix = old
            .iter()
            .rev()
            .zip(new.iter().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();

        let removed: String = old[prefix..old.len() - suffix].iter().collect();
        let inserted: String = new[prefix..new.len() - suffix].iter().collect();

        let mut ops = Vec::with_capacity(2);
        if !removed.is_empty() {
            ops.push(TextOp::Delete { at: prefix, text: removed });
        }
        if !inserted.is_empty() {
            ops.push(TextOp::Insert { at: prefix, text: inserted });
        }
        ops
    }

    fn merge_whole_state(&self, local: &String, remote: &String, ancestor: &String) -> String {
        let local_ops = self.diff(ancestor, local);
        let upstream = self.diff(ancestor, remote);

        let mut merged = remote.clone();
        for op in self.rebase_ops(&local_ops, &upstream).into_iter().flatten() {
            match self.apply_op(&merged, &op) {
                Ok(next) => merged = next,
                Err(e) => log::debug!("Skipping unmergeable text op {op:?}: {e}"),
            }
        }
        merged
    }

    fn rebase_ops(&self, local: &[TextOp], upstream: &[TextOp]) -> Vec<Option<TextOp>> {
        let mut upstream = upstream.to_vec();
        // Takes the current local state back to the state holding only the
        // local ops kept so far. Grows by one inverse per dropped op.
        let mut undo: Vec<TextOp> = Vec::new();
        let mut out = Vec::with_capacity(local.len());

        for op in local {
            let (kept, undo_after) = map_through(op, &undo);
            let mapped = kept.and_then(|k| {
                let (m, upstream_after) = map_through(&k, &upstream);
                m.map(|m| (m, upstream_after))
            });

            match mapped {
                Some((m, upstream_after)) => {
                    undo = undo_after;
                    upstream = upstream_after;
                    out.push(Some(m));
                }
                None => {
                    undo.insert(0, op.inverse());
                    out.push(None);
                }
            }
        }
        out
    }

    fn encode(&self, doc: &String) -> Result<Vec<u8>, ContentError> {
        Ok(doc.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<String, ContentError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| ContentError::Malformed(e.to_string()))
    }
}
