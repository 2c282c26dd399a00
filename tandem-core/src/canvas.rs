//! Freeform canvas content: an ordered set of positioned elements.
//!
//! Element order is paint order (first = bottom). Elements are identified by
//! a caller-chosen string id, unique within one canvas.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::content::{ContentCapability, ContentError, ContentKind};

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub enum ElementKind {
    Rect,
    Ellipse,
    Text { content: String },
    Image { src: String },
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Element {
    pub id: String,
    pub kind: ElementKind,
    pub bounds: Rect,
}

impl Element {
    pub fn new(id: impl Into<String>, kind: ElementKind, bounds: Rect) -> Self {
        Self {
            id: id.into(),
            kind,
            bounds,
        }
    }

    pub fn rect(id: impl Into<String>, x: f32, y: f32, width: f32, height: f32) -> Self {
        Self::new(id, ElementKind::Rect, Rect::new(x, y, width, height))
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Canvas {
    pub elements: Vec<Element>,
}

impl Canvas {
    pub fn new(elements: Vec<Element>) -> Self {
        Self { elements }
    }

    pub fn get(&self, id: &str) -> Option<&Element> {
        self.elements.iter().find(|e| e.id == id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.elements.iter().map(|e| e.id.as_str()).collect()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.elements.iter().position(|e| e.id == id)
    }
}

/// Canvas edit. `Put` inserts or replaces an element at a paint index.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub enum CanvasOp {
    Put { element: Element, index: usize },
    Remove { id: String },
}

/// Capability for canvas documents (`Doc = Canvas`).
#[derive(Debug, Clone, Copy, Default)]
pub struct CanvasContent;

impl CanvasContent {
    pub fn new() -> Self {
        Self
    }
}

impl ContentCapability for CanvasContent {
    type Doc = Canvas;
    type Op = CanvasOp;

    fn kind(&self) -> ContentKind {
        ContentKind::WholeState
    }

    fn apply_op(&self, doc: &Canvas, op: &CanvasOp) -> Result<Canvas, ContentError> {
        let mut next = doc.clone();
        match op {
            CanvasOp::Put { element, index } => {
                if let Some(pos) = next.position(&element.id) {
                    next.elements.remove(pos);
                }
                let index = (*index).min(next.elements.len());
                next.elements.insert(index, element.clone());
            }
            CanvasOp::Remove { id } => {
                let pos = next
                    .position(id)
                    .ok_or_else(|| ContentError::ElementNotFound(id.clone()))?;
                next.elements.remove(pos);
            }
        }
        Ok(next)
    }

    fn diff(&self, old: &Canvas, new: &Canvas) -> Vec<CanvasOp> {
        let mut ops = Vec::new();
        let mut current = old.clone();

        for element in &old.elements {
            if new.get(&element.id).is_none() {
                ops.push(CanvasOp::Remove {
                    id: element.id.clone(),
                });
            }
        }
        current.elements.retain(|e| new.get(&e.id).is_some());

        // After step i, current[..=i] == new[..=i].
        for (index, element) in new.elements.iter().enumerate() {
            if current.elements.get(index) != Some(element) {
                if let Some(pos) = current.position(&element.id) {
                    current.elements.remove(pos);
                }
                current.elements.insert(index, element.clone());
                ops.push(CanvasOp::Put {
                    element: element.clone(),
                    index,
                });
            }
        }
        ops
    }

    fn merge_whole_state(&self, local: &Canvas, remote: &Canvas, ancestor: &Canvas) -> Canvas {
        let local_by_id: HashMap<&str, &Element> =
            local.elements.iter().map(|e| (e.id.as_str(), e)).collect();
        let ancestor_by_id: HashMap<&str, &Element> =
            ancestor.elements.iter().map(|e| (e.id.as_str(), e)).collect();

        let mut merged: Vec<Element> = Vec::with_capacity(remote.elements.len());

        for theirs in &remote.elements {
            let base = ancestor_by_id.get(theirs.id.as_str());
            match local_by_id.get(theirs.id.as_str()) {
                // Local copy wins only when the user actually touched it.
                Some(ours) if base.is_some_and(|b| b == ours) => merged.push(theirs.clone()),
                Some(ours) => merged.push((*ours).clone()),
                // Deleted locally; honour it unless upstream changed the element.
                None if base.is_some_and(|b| *b == theirs) => {}
                None => merged.push(theirs.clone()),
            }
        }

        for (pos, ours) in local.elements.iter().enumerate() {
            if remote.get(&ours.id).is_some() {
                continue;
            }
            if let Some(base) = ancestor_by_id.get(ours.id.as_str()) {
                // Deleted upstream: stays deleted unless edited locally.
                if *base == ours {
                    continue;
                }
            }

            // Keep paint order relative to the nearest surviving predecessor.
            let insert_at = local.elements[..pos]
                .iter()
                .rev()
                .find_map(|prev| merged.iter().position(|m| m.id == prev.id))
                .map_or(0, |i| i + 1);
            merged.insert(insert_at, ours.clone());
        }

        Canvas { elements: merged }
    }

    fn encode(&self, doc: &Canvas) -> Result<Vec<u8>, ContentError> {
        serde_json::to_vec(doc).map_err(|e| ContentError::Malformed(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Canvas, ContentError> {
        serde_json::from_slice(bytes).map_err(|e| ContentError::Malformed(e.to_string()))
    }
}
