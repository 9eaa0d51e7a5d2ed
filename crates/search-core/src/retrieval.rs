use common::RetrievalSettings;

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalDefaults {
    pub top_k: usize,
    pub fetch_k: usize,
    pub rrf_c: f64,
}

impl Default for RetrievalDefaults {
    fn default() -> Self {
        Self::from(&RetrievalSettings::default())
    }
}

impl From<&RetrievalSettings> for RetrievalDefaults {
    fn from(settings: &RetrievalSettings) -> Self {
        Self {
            top_k: settings.top_k.max(1),
            fetch_k: settings.fetch_k.max(1),
            rrf_c: settings.rrf_c,
        }
    }
}

/// Per-request sizes after defaults are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrievalParams {
    pub top_k: usize,
    pub fetch_k: usize,
}

impl RetrievalParams {
    /// Both sizes are at least 1 and the dense candidate pool is never smaller than `top_k`.
    pub fn resolve(defaults: &RetrievalDefaults, top_k: Option<usize>, fetch_k: Option<usize>) -> Self {
        let top_k = top_k.unwrap_or(defaults.top_k).max(1);
        let fetch_k = fetch_k.unwrap_or(defaults.fetch_k).max(top_k);
        Self { top_k, fetch_k }
    }
}

#[cfg(test)]
mod tests {
    use super::{RetrievalDefaults, RetrievalParams};

    #[test]
    fn aligns_with_service_baseline() {
        let d = RetrievalDefaults::default();
        assert_eq!(d.top_k, 8);
        assert_eq!(d.fetch_k, 40);
        assert!((d.rrf_c - 60.0).abs() < f64::EPSILON);
    }

    #[test]
    fn resolve_fills_defaults_and_clamps() {
        let d = RetrievalDefaults::default();
        assert_eq!(
            RetrievalParams::resolve(&d, None, None),
            RetrievalParams { top_k: 8, fetch_k: 40 }
        );
        assert_eq!(
            RetrievalParams::resolve(&d, Some(0), Some(0)),
            RetrievalParams { top_k: 1, fetch_k: 1 }
        );
        assert_eq!(
            RetrievalParams::resolve(&d, Some(50), Some(10)),
            RetrievalParams { top_k: 50, fetch_k: 50 }
        );
    }
}
