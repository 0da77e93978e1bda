//! Layered-document change analysis
//!
//! Compares the layer trees of two versions of a layered document and
//! produces the change summary carried inside layered smart deltas.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pixel position of a layer within its document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LayerPosition {
    pub x: i64,
    pub y: i64,
}

/// A single layer as reported by the scanner collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerRecord {
    /// Layer id within the document
    pub id: u32,

    /// Layer name; the source format treats names as stable identifiers
    pub name: String,

    /// Hash of the layer's pixel/vector content
    pub content_hash: String,

    /// Opacity in [0, 255]
    pub opacity: u8,

    /// Layer visibility flag
    pub visible: bool,

    /// Blend mode name ("normal", "multiply", ...)
    pub blend_mode: String,

    /// Layer position
    pub position: LayerPosition,
}

/// Old/new value pair for a changed layer property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyChange {
    pub old: serde_json::Value,
    pub new: serde_json::Value,
}

/// A detected change to a single layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerChange {
    /// Layer id (from the newer tree when present)
    pub layer_id: u32,

    /// Layer name
    pub layer_name: String,

    /// Content hash before the change, when the layer existed before
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_hash: Option<String>,

    /// Content hash after the change, when the layer still exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_hash: Option<String>,

    /// Property-level old/new values for modified layers
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub property_changes: BTreeMap<String, PropertyChange>,
}

/// Full analysis of the differences between two layer trees
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeAnalysis {
    /// Number of layers in the newer tree
    pub total_layers: u32,

    /// Layers present in the new tree only
    pub added: Vec<LayerChange>,

    /// Layers present in the old tree only
    pub deleted: Vec<LayerChange>,

    /// Layers present in both whose content hash differs
    pub modified: Vec<LayerChange>,

    /// new layers minus modified minus added
    pub unchanged_count: u32,

    /// Human-readable one-line summary
    pub summary: String,
}

impl ChangeAnalysis {
    /// Total number of detected changes across all categories
    pub fn change_count(&self) -> usize {
        self.added.len() + self.deleted.len() + self.modified.len()
    }
}

/// Compare two layer trees and describe what changed.
///
/// Layers are matched by name. Duplicate names within one tree keep the
/// first occurrence.
pub fn analyze_layer_changes(old: &[LayerRecord], new: &[LayerRecord]) -> ChangeAnalysis {
    let old_by_name = index_by_name(old);
    let new_by_name = index_by_name(new);

    let mut added = Vec::new();
    let mut deleted = Vec::new();
    let mut modified = Vec::new();

    for layer in new {
        if !is_first_occurrence(&new_by_name, layer) {
            continue; // shadowed duplicate name
        }
        if !old_by_name.contains_key(layer.name.as_str()) {
            added.push(LayerChange {
                layer_id: layer.id,
                layer_name: layer.name.clone(),
                old_hash: None,
                new_hash: Some(layer.content_hash.clone()),
                property_changes: BTreeMap::new(),
            });
        }
    }

    for layer in old {
        if !is_first_occurrence(&old_by_name, layer) {
            continue;
        }
        if !new_by_name.contains_key(layer.name.as_str()) {
            deleted.push(LayerChange {
                layer_id: layer.id,
                layer_name: layer.name.clone(),
                old_hash: Some(layer.content_hash.clone()),
                new_hash: None,
                property_changes: BTreeMap::new(),
            });
        }
    }

    for layer in new {
        if !is_first_occurrence(&new_by_name, layer) {
            continue;
        }
        if let Some(old_layer) = old_by_name.get(layer.name.as_str()) {
            if old_layer.content_hash != layer.content_hash {
                modified.push(LayerChange {
                    layer_id: layer.id,
                    layer_name: layer.name.clone(),
                    old_hash: Some(old_layer.content_hash.clone()),
                    new_hash: Some(layer.content_hash.clone()),
                    property_changes: property_changes(old_layer, layer),
                });
            }
        }
    }

    let distinct_new = new_by_name.len() as u32;
    let unchanged_count =
        distinct_new.saturating_sub(modified.len() as u32 + added.len() as u32);

    let summary = summarize(&added, &deleted, &modified);

    ChangeAnalysis {
        total_layers: distinct_new,
        added,
        deleted,
        modified,
        unchanged_count,
        summary,
    }
}

fn index_by_name(layers: &[LayerRecord]) -> BTreeMap<&str, &LayerRecord> {
    let mut map: BTreeMap<&str, &LayerRecord> = BTreeMap::new();
    for layer in layers {
        map.entry(layer.name.as_str()).or_insert(layer);
    }
    map
}

fn is_first_occurrence(index: &BTreeMap<&str, &LayerRecord>, layer: &LayerRecord) -> bool {
    index
        .get(layer.name.as_str())
        .map(|first| std::ptr::eq(*first, layer))
        .unwrap_or(false)
}

fn property_changes(old: &LayerRecord, new: &LayerRecord) -> BTreeMap<String, PropertyChange> {
    let mut changes = BTreeMap::new();

    if old.opacity != new.opacity {
        changes.insert(
            "opacity".to_string(),
            PropertyChange {
                old: serde_json::json!(old.opacity),
                new: serde_json::json!(new.opacity),
            },
        );
    }

    if old.visible != new.visible {
        changes.insert(
            "visibility".to_string(),
            PropertyChange {
                old: serde_json::json!(old.visible),
                new: serde_json::json!(new.visible),
            },
        );
    }

    if old.blend_mode != new.blend_mode {
        changes.insert(
            "blend_mode".to_string(),
            PropertyChange {
                old: serde_json::json!(old.blend_mode),
                new: serde_json::json!(new.blend_mode),
            },
        );
    }

    if old.position != new.position {
        changes.insert(
            "position".to_string(),
            PropertyChange {
                old: serde_json::json!(old.position),
                new: serde_json::json!(new.position),
            },
        );
    }

    changes
}

fn summarize(added: &[LayerChange], deleted: &[LayerChange], modified: &[LayerChange]) -> String {
    let total = added.len() + deleted.len() + modified.len();
    if total == 0 {
        return "No layer changes detected".to_string();
    }

    let mut summary = format!("{} layer(s) changed", total);
    if !added.is_empty() {
        summary.push_str(&format!(", {} added", added.len()));
    }
    if !deleted.is_empty() {
        summary.push_str(&format!(", {} deleted", deleted.len()));
    }
    if !modified.is_empty() {
        summary.push_str(&format!(", {} modified", modified.len()));
    }
    summary
}
