// src/image/layering.rs

//! Layering strategy
//!
//! Content items are mapped to image layers in one of two modes:
//!
//! - `flat`: a single layer holding everything
//! - `layered`: one layer per content item, coalesced until the count fits
//!   the bound. The smallest layer (lowest index on ties) is repeatedly
//!   merged into its smaller neighbour, so ordering is preserved.
//!
//! The greedy merge does not try to balance layer sizes. Many small closure
//! paths next to one large artifact end up as one heavy layer and a few tiny
//! ones; that placement is accepted as-is.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::content::{ContentEntry, ContentItem};
use crate::error::{Error, Result};

/// Default layer bound for layered images
pub const DEFAULT_MAX_LAYERS: usize = 42;

/// How content is split into layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum LayeringMode {
    Flat,
    Layered {
        #[serde(default = "default_max_layers")]
        max_layers: usize,
    },
}

fn default_max_layers() -> usize {
    DEFAULT_MAX_LAYERS
}

impl Default for LayeringMode {
    fn default() -> Self {
        Self::Flat
    }
}

impl LayeringMode {
    pub fn layered() -> Self {
        Self::Layered {
            max_layers: DEFAULT_MAX_LAYERS,
        }
    }
}

/// One image layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    /// Names of the content items placed in this layer, in order
    pub items: Vec<String>,
    pub entries: Vec<ContentEntry>,
    /// Total bytes of file contents
    pub size: u64,
}

impl Layer {
    fn from_item(item: ContentItem) -> Self {
        Self {
            items: vec![item.name],
            entries: item.entries,
            size: item.size,
        }
    }

    fn absorb(&mut self, other: Layer) {
        self.items.extend(other.items);
        self.entries.extend(other.entries);
        self.size += other.size;
    }
}

/// Split content into layers for the named image
pub fn layer(image: &str, mode: LayeringMode, content: Vec<ContentItem>) -> Result<Vec<Layer>> {
    match mode {
        LayeringMode::Flat => {
            let mut single = Layer {
                items: Vec::new(),
                entries: Vec::new(),
                size: 0,
            };
            for item in content {
                single.absorb(Layer::from_item(item));
            }
            Ok(vec![single])
        }
        LayeringMode::Layered { max_layers } => {
            if max_layers == 0 {
                return Err(Error::Layering {
                    image: image.to_string(),
                    reason: "max_layers must be at least 1".to_string(),
                });
            }
            let natural: Vec<Layer> = content.into_iter().map(Layer::from_item).collect();
            debug!(
                "{}: {} natural layers, bound {}",
                image,
                natural.len(),
                max_layers
            );
            Ok(coalesce(natural, max_layers))
        }
    }
}

fn coalesce(mut layers: Vec<Layer>, max_layers: usize) -> Vec<Layer> {
    while layers.len() > max_layers {
        // len > max_layers >= 1, so every layer has at least one neighbour
        let smallest = layers
            .iter()
            .enumerate()
            .min_by_key(|(i, l)| (l.size, *i))
            .map(|(i, _)| i)
            .unwrap_or(0);

        let last = layers.len() - 1;
        let neighbour = if smallest == 0 {
            1
        } else if smallest == last {
            smallest - 1
        } else if layers[smallest - 1].size <= layers[smallest + 1].size {
            smallest - 1
        } else {
            smallest + 1
        };

        let (keep, merge) = if smallest < neighbour {
            (smallest, neighbour)
        } else {
            (neighbour, smallest)
        };
        let merged = layers.remove(merge);
        layers[keep].absorb(merged);
    }
    layers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::content::ContentOrigin;

    fn item(name: &str, size: usize) -> ContentItem {
        ContentItem::new(
            name,
            ContentOrigin::Closure,
            vec![ContentEntry::inline(&format!("/data/{}", name), vec![0u8; size], 0o644)],
        )
        .unwrap()
    }

    fn names(layers: &[Layer]) -> Vec<Vec<&str>> {
        layers
            .iter()
            .map(|l| l.items.iter().map(String::as_str).collect())
            .collect()
    }

    #[test]
    fn test_flat_is_single_layer() {
        let content = vec![item("a", 1), item("b", 2), item("c", 3)];
        let layers = layer("img", LayeringMode::Flat, content).unwrap();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].size, 6);
        assert_eq!(names(&layers), vec![vec!["a", "b", "c"]]);
    }

    #[test]
    fn test_five_items_coalesce_to_two() {
        let content = vec![
            item("a", 10),
            item("b", 1),
            item("c", 5),
            item("d", 2),
            item("e", 20),
        ];
        let layers = layer("img", LayeringMode::Layered { max_layers: 2 }, content).unwrap();

        assert_eq!(layers.len(), 2);
        // b merges into c (smaller neighbour), d joins it, then the group
        // of 8 merges into a
        assert_eq!(names(&layers), vec![vec!["a", "b", "c", "d"], vec!["e"]]);
        assert_eq!(layers[0].size, 18);
        assert_eq!(layers[1].size, 20);
    }

    #[test]
    fn test_under_bound_keeps_natural_layers() {
        let content = vec![item("a", 1), item("b", 2)];
        let layers = layer("img", LayeringMode::layered(), content).unwrap();
        assert_eq!(names(&layers), vec![vec!["a"], vec!["b"]]);
    }

    #[test]
    fn test_bound_always_holds() {
        for max in 1..8 {
            let content: Vec<_> = (0..12).map(|i| item(&format!("i{}", i), (i * 7) % 5)).collect();
            let layers = layer("img", LayeringMode::Layered { max_layers: max }, content).unwrap();
            assert_eq!(layers.len(), max);
            let total: u64 = layers.iter().map(|l| l.size).sum();
            assert_eq!(total, (0..12).map(|i| ((i * 7) % 5) as u64).sum::<u64>());
        }
    }

    #[test]
    fn test_ties_merge_lowest_index() {
        let content = vec![item("a", 3), item("b", 3), item("c", 3)];
        let layers = layer("img", LayeringMode::Layered { max_layers: 2 }, content).unwrap();
        assert_eq!(names(&layers), vec![vec!["a", "b"], vec!["c"]]);
    }

    #[test]
    fn test_zero_max_layers_is_error() {
        let err = layer("mayastor", LayeringMode::Layered { max_layers: 0 }, vec![item("a", 1)])
            .unwrap_err();
        assert!(matches!(err, Error::Layering { ref image, .. } if image == "mayastor"));
    }

    #[test]
    fn test_mode_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            layering: LayeringMode,
        }
        let w: Wrapper = toml::from_str("layering = { mode = \"layered\" }").unwrap();
        assert_eq!(w.layering, LayeringMode::layered());
        let w: Wrapper = toml::from_str("layering = { mode = \"flat\" }").unwrap();
        assert_eq!(w.layering, LayeringMode::Flat);
    }
}
