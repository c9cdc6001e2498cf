use std::path::Path;

/// The format used to represent the configuration data.
/// YAML for humans, JSON for programs; YAML is a superset here so it is the
/// fallback for unknown extensions.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Format {
    Json,
    #[default]
    Yaml,
}

impl Format {
    pub fn from_path<T: AsRef<Path>>(path: T) -> Self {
        match path.as_ref().extension() {
            Some(ext) if ext == "json" => Format::Json,
            _ => Format::Yaml,
        }
    }

    /// Parse the string represented in the specified format.
    pub fn deserialize<T: serde::de::DeserializeOwned>(&self, content: &str) -> crate::Result<T> {
        match self {
            Format::Json => serde_json::from_str(content).map_err(|err| err.to_string().into()),
            Format::Yaml => serde_yaml::from_str(content).map_err(|err| err.to_string().into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_path() {
        assert_eq!(Format::from_path("gnmic.json"), Format::Json);
        assert_eq!(Format::from_path("gnmic.yaml"), Format::Yaml);
        assert_eq!(Format::from_path("gnmic.yml"), Format::Yaml);
        assert_eq!(Format::from_path("gnmic.conf"), Format::Yaml);
    }
}
