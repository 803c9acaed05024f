//! YAML reading and writing for values files, specs and rendered manifests.
//!
//! Parsing goes through yaml-rust2 straight into `serde_json::Value`, which is
//! the untyped tree used everywhere else. Emission uses serde_yaml.

use serde::Serialize;
use serde_json::{Map, Number, Value};
use thiserror::Error;
use yaml_rust2::{Yaml, YamlLoader};

/// YAML could not be parsed or produced
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct YamlError(String);

/// Parse the first YAML document in `input`. Empty input yields `Value::Null`.
pub fn parse_yaml(input: &str) -> Result<Value, YamlError> {
    let docs = YamlLoader::load_from_str(input).map_err(|e| YamlError(e.to_string()))?;
    match docs.into_iter().next() {
        Some(doc) => yaml_to_json(doc),
        None => Ok(Value::Null),
    }
}

/// Serialize any value as a YAML document
pub fn to_yaml<T: Serialize>(value: &T) -> Result<String, YamlError> {
    serde_yaml::to_string(value).map_err(|e| YamlError(e.to_string()))
}

fn yaml_to_json(yaml: Yaml) -> Result<Value, YamlError> {
    match yaml {
        Yaml::Null => Ok(Value::Null),
        Yaml::Boolean(b) => Ok(Value::Bool(b)),
        Yaml::Integer(i) => Ok(Value::Number(i.into())),
        Yaml::Real(s) => {
            let f: f64 = s
                .parse()
                .map_err(|e: std::num::ParseFloatError| YamlError(e.to_string()))?;
            Ok(Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null))
        }
        Yaml::String(s) => Ok(Value::String(s)),
        Yaml::Array(items) => items
            .into_iter()
            .map(yaml_to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Yaml::Hash(map) => map
            .into_iter()
            .map(|(k, v)| {
                let key = match k {
                    Yaml::String(s) | Yaml::Real(s) => s,
                    Yaml::Integer(i) => i.to_string(),
                    Yaml::Boolean(b) => b.to_string(),
                    Yaml::Null => "null".to_string(),
                    _ => return Err(YamlError("unsupported YAML key type".to_string())),
                };
                yaml_to_json(v).map(|v| (key, v))
            })
            .collect::<Result<Map<String, Value>, _>>()
            .map(Value::Object),
        Yaml::Alias(_) => Err(YamlError("YAML aliases not supported".to_string())),
        Yaml::BadValue => Err(YamlError("bad YAML value".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn values_file_parses_into_nested_tree() {
        let yaml = r#"
global:
  hub: docker.io/mesh
  monitoringPort: 15014
pilot:
  enabled: true
  autoscaleMin: 1
  traceSampling: 1.5
"#;
        let tree = parse_yaml(yaml).unwrap();
        assert_eq!(tree["global"]["hub"], "docker.io/mesh");
        assert_eq!(tree["global"]["monitoringPort"], 15014);
        assert_eq!(tree["pilot"]["enabled"], true);
        let sampling = tree["pilot"]["traceSampling"].as_f64().unwrap();
        assert!((sampling - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_input_is_null() {
        assert_eq!(parse_yaml("").unwrap(), Value::Null);
    }

    #[test]
    fn invalid_yaml_is_rejected() {
        assert!(parse_yaml("a: b: c: {{").is_err());
    }

    #[test]
    fn non_string_keys_are_stringified() {
        let tree = parse_yaml("ports:\n  80: http\n  true: yes").unwrap();
        assert_eq!(tree["ports"]["80"], "http");
        assert_eq!(tree["ports"]["true"], "yes");
    }

    #[test]
    fn emitted_yaml_parses_back() {
        let tree = json!({"hub": "docker.io/mesh", "trafficManagement": {"enabled": true}});
        let text = to_yaml(&tree).unwrap();
        assert_eq!(parse_yaml(&text).unwrap(), tree);
    }
}
