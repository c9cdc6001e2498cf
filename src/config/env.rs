use serde_yaml::Value;

/// Override config leaves from the environment.
///
/// For every scalar leaf in the parsed document, the variable name is the
/// prefix plus the path segments joined by `_`, with dots and dashes mapped
/// to underscores and the whole thing uppercased:
/// `api-server.address` becomes `GNMIC_API_SERVER_ADDRESS`.
///
/// Only paths that already exist in the document are overridden, so a typo
/// in the environment cannot invent config sections.
pub fn apply_env_overrides(value: &mut Value, prefix: &str) {
    walk(value, prefix.trim_end_matches('_'))
}

fn walk(value: &mut Value, name: &str) {
    match value {
        Value::Mapping(mapping) => {
            for (key, child) in mapping.iter_mut() {
                let Some(key) = key.as_str() else {
                    continue;
                };

                let child_name = format!("{}_{}", name, env_segment(key));
                walk(child, &child_name);
            }
        }
        Value::Sequence(_) => {}
        leaf => {
            if let Ok(raw) = std::env::var(name) {
                *leaf = parse_scalar(&raw);
            }
        }
    }
}

fn env_segment(key: &str) -> String {
    key.replace(['-', '.'], "_").to_ascii_uppercase()
}

fn parse_scalar(raw: &str) -> Value {
    // the YAML scalar parser gives booleans and numbers their real types
    serde_yaml::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_existing_leaves() {
        let mut value: Value = serde_yaml::from_str(
            r#"
api-server:
  address: 127.0.0.1:7890
  enable-metrics: false
targets:
  leaf1:
    address: 10.0.0.1:57400
"#,
        )
        .unwrap();

        std::env::set_var("GNMIC_TEST_API_SERVER_ADDRESS", "0.0.0.0:7890");
        std::env::set_var("GNMIC_TEST_API_SERVER_ENABLE_METRICS", "true");
        std::env::set_var("GNMIC_TEST_NOT_A_SECTION", "42");

        apply_env_overrides(&mut value, "GNMIC_TEST_");

        assert_eq!(
            value["api-server"]["address"].as_str(),
            Some("0.0.0.0:7890")
        );
        assert_eq!(value["api-server"]["enable-metrics"].as_bool(), Some(true));
        assert_eq!(
            value["targets"]["leaf1"]["address"].as_str(),
            Some("10.0.0.1:57400")
        );
        assert!(value.get("not-a-section").is_none());

        std::env::remove_var("GNMIC_TEST_API_SERVER_ADDRESS");
        std::env::remove_var("GNMIC_TEST_API_SERVER_ENABLE_METRICS");
        std::env::remove_var("GNMIC_TEST_NOT_A_SECTION");
    }
}
