use common::ChunkMeta;

/// Component/tag restriction shared by the lexical index and the dense post-filter.
///
/// Values are compared lower-cased. An empty list means "not supplied", so `None` and
/// `Some(vec![])` describe the same filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeFilter {
    components: Vec<String>,
    tags: Vec<String>,
}

impl AttributeFilter {
    pub fn new(components: Option<&[String]>, tags: Option<&[String]>) -> Self {
        Self {
            components: normalize(components),
            tags: normalize(tags),
        }
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty() && self.tags.is_empty()
    }

    /// Component must be one of the requested ones; tags need a non-empty intersection.
    pub fn matches(&self, meta: &ChunkMeta) -> bool {
        let component_ok = self.components.is_empty()
            || self
                .components
                .contains(&meta.component.trim().to_lowercase());
        let tags_ok = self.tags.is_empty()
            || meta
                .tags
                .iter()
                .map(|t| t.trim().to_lowercase())
                .any(|t| self.tags.contains(&t));
        component_ok && tags_ok
    }
}

fn normalize(values: Option<&[String]>) -> Vec<String> {
    let mut out = values
        .unwrap_or_default()
        .iter()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect::<Vec<_>>();
    out.sort();
    out.dedup();
    out
}
