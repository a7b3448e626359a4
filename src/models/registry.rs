// The supported model set is deliberately closed: tiny/base/small cover the
// deployment footprint the co-located server is tuned for.

#[derive(Debug, Clone, Copy)]
pub struct ModelSpec {
    pub name: &'static str,
    pub size_mb: f64,
    /// Logical version pin; bumped when the upstream files change.
    pub version: &'static str,
    pub url: &'static str,
}

impl ModelSpec {
    /// On-disk filename under the models directory.
    pub fn file_name(&self) -> String {
        format!("ggml-{}.en.bin", self.name)
    }
}

static SUPPORTED: &[ModelSpec] = &[
    ModelSpec {
        name: "tiny",
        size_mb: 75.0,
        version: "main",
        url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-tiny.en.bin",
    },
    ModelSpec {
        name: "base",
        size_mb: 145.0,
        version: "main",
        url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-base.en.bin",
    },
    ModelSpec {
        name: "small",
        size_mb: 480.0,
        version: "main",
        url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-small.en.bin",
    },
];

pub fn supported_models() -> &'static [ModelSpec] {
    SUPPORTED
}

pub fn spec_for(name: &str) -> Option<&'static ModelSpec> {
    SUPPORTED.iter().find(|m| m.name == name)
}

/// Comma-separated names for error messages.
pub fn supported_names() -> String {
    SUPPORTED
        .iter()
        .map(|m| m.name)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_the_closed_supported_set() {
        let names: Vec<_> = supported_models().iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["tiny", "base", "small"]);
        assert!(spec_for("large").is_none());
    }

    #[test]
    fn file_names_follow_ggml_convention() {
        assert_eq!(spec_for("base").unwrap().file_name(), "ggml-base.en.bin");
    }
}
