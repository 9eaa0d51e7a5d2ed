use common::EmbeddingSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingConfig {
    pub model_path: String,
    pub tokenizer_path: Option<String>,
    pub vector_dim: usize,
    pub max_sequence_length: usize,
    pub batch_size: usize,
    pub allow_pseudo_fallback: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self::from(&EmbeddingSettings::default())
    }
}

impl From<&EmbeddingSettings> for EmbeddingConfig {
    fn from(settings: &EmbeddingSettings) -> Self {
        // A tokenizer.json next to the model is picked up when none is configured.
        let tokenizer_path = settings.tokenizer_path.clone().or_else(|| {
            let candidate = std::path::Path::new(&settings.model_path).with_extension("tokenizer.json");
            candidate
                .exists()
                .then(|| candidate.display().to_string())
        });
        Self {
            model_path: settings.model_path.clone(),
            tokenizer_path,
            vector_dim: settings.vector_dim.max(1),
            max_sequence_length: settings.max_sequence_length.max(1),
            batch_size: settings.batch_size.max(1),
            allow_pseudo_fallback: settings.allow_pseudo,
        }
    }
}

impl EmbeddingConfig {
    pub fn pseudo(vector_dim: usize) -> Self {
        Self {
            vector_dim: vector_dim.max(1),
            allow_pseudo_fallback: true,
            ..Self::default()
        }
    }
}
