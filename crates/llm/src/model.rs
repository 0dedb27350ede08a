/// Model used when neither settings nor the backend name one.
pub const DEFAULT_MODEL: &str = "llama2";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub id: String,
    pub label: String,
}

impl Model {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }

    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id)
    }
}

/// Models offered for selection. `warning` is set when the list is a fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCatalog {
    pub models: Vec<Model>,
    pub warning: Option<String>,
}

impl ModelCatalog {
    pub fn listed(models: Vec<Model>) -> Self {
        Self {
            models,
            warning: None,
        }
    }

    pub fn fallback(models: Vec<Model>, warning: impl Into<String>) -> Self {
        Self {
            models,
            warning: Some(warning.into()),
        }
    }
}

/// Served when the local backend cannot be reached.
pub fn default_local_models() -> Vec<Model> {
    vec![Model::from_id(DEFAULT_MODEL)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_fallback_offers_the_default_model() {
        let models = default_local_models();

        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, DEFAULT_MODEL);
        assert_eq!(models[0].label, DEFAULT_MODEL);
    }

    #[test]
    fn only_fallback_catalogs_carry_a_warning() {
        let listed = ModelCatalog::listed(vec![Model::from_id("mistral")]);
        let fallback = ModelCatalog::fallback(default_local_models(), "connection refused");

        assert_eq!(listed.warning, None);
        assert_eq!(fallback.warning.as_deref(), Some("connection refused"));
    }
}
