//! Computed conversions between values settings and K8s spec blocks.
//!
//! Each forward conversion has an inverse used when a spec is rendered back
//! into values for the chart renderer.

use serde_json::{json, Map, Value};

use crate::tree::{is_unset, type_name, Path};
use crate::Error;

/// Autoscale switch key under a component root
pub const AUTOSCALE_ENABLED: &str = "autoscaleEnabled";
/// Autoscale lower bound key
pub const AUTOSCALE_MIN: &str = "autoscaleMin";
/// Autoscale upper bound key
pub const AUTOSCALE_MAX: &str = "autoscaleMax";

/// Build an `hpaSpec` from the three autoscale settings.
///
/// An explicit `autoscaleEnabled: false` yields nothing; otherwise every
/// non-zero bound present is carried over.
pub fn autoscale(
    root: &Path,
    enabled: Option<&Value>,
    min: Option<&Value>,
    max: Option<&Value>,
) -> Result<Option<Value>, Error> {
    match enabled {
        None | Some(Value::Null) | Some(Value::Bool(true)) => {}
        Some(Value::Bool(false)) => return Ok(None),
        Some(other) => {
            return Err(Error::translation(
                root.child(AUTOSCALE_ENABLED).to_string(),
                format!("expected a boolean, found {}", type_name(other)),
            ))
        }
    }

    let mut hpa = Map::new();
    for (key, value, field) in [
        (AUTOSCALE_MIN, min, "minReplicas"),
        (AUTOSCALE_MAX, max, "maxReplicas"),
    ] {
        match value {
            None => {}
            Some(v) if is_unset(v) => {}
            Some(Value::Number(n)) if n.is_u64() => {
                hpa.insert(field.to_string(), Value::Number(n.clone()));
            }
            Some(other) => {
                return Err(Error::translation(
                    root.child(key).to_string(),
                    format!("expected a non-negative integer, found {other}"),
                ))
            }
        }
    }

    Ok((!hpa.is_empty()).then_some(Value::Object(hpa)))
}

/// Inverse of [`autoscale`]: the settings an `hpaSpec` came from.
pub fn autoscale_settings(hpa: &Value) -> Vec<(&'static str, Value)> {
    let mut settings = vec![(AUTOSCALE_ENABLED, Value::Bool(true))];
    for (field, key) in [("minReplicas", AUTOSCALE_MIN), ("maxReplicas", AUTOSCALE_MAX)] {
        if let Some(bound) = hpa.get(field).filter(|v| !v.is_null()) {
            settings.push((key, bound.clone()));
        }
    }
    settings
}

/// Convert an `env` mapping into a `[{name, value}]` list sorted by name.
pub fn env_list(source: &Path, value: &Value) -> Result<Option<Value>, Error> {
    let Value::Object(vars) = value else {
        return Err(Error::translation(
            source.to_string(),
            format!(
                "expected a mapping of variable names to values, found {}",
                type_name(value)
            ),
        ));
    };

    let mut names: Vec<&String> = vars.keys().collect();
    names.sort();

    let entries = names
        .into_iter()
        .map(|name| {
            let v = &vars[name.as_str()];
            let text = match v {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                Value::Bool(_) | Value::Number(_) => v.to_string(),
                other => {
                    return Err(Error::translation(
                        source.child(name.as_str()).to_string(),
                        format!("expected a scalar, found {}", type_name(other)),
                    ))
                }
            };
            Ok(json!({ "name": name, "value": text }))
        })
        .collect::<Result<Vec<_>, Error>>()?;

    Ok((!entries.is_empty()).then_some(Value::Array(entries)))
}

/// Inverse of [`env_list`]
pub fn env_mapping(list: &Value) -> Value {
    let vars = list
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|entry| {
            let name = entry.get("name")?.as_str()?;
            let value = entry.get("value").cloned().unwrap_or(Value::String(String::new()));
            Some((name.to_string(), value))
        })
        .collect();
    Value::Object(vars)
}

/// Convert `podAntiAffinityLabelSelector` entries into a required pod
/// anti-affinity block.
///
/// Each entry needs `key` and `topologyKey`; `operator` defaults to `In`
/// and `values` may be a comma separated string or a sequence.
pub fn anti_affinity(source: &Path, value: &Value) -> Result<Option<Value>, Error> {
    let Value::Array(selectors) = value else {
        return Err(Error::translation(
            source.to_string(),
            format!("expected a sequence of selectors, found {}", type_name(value)),
        ));
    };

    let terms = selectors
        .iter()
        .enumerate()
        .map(|(index, selector)| {
            let at = source.child(index.to_string());
            let key = required_str(selector, "key", &at)?;
            let topology_key = required_str(selector, "topologyKey", &at)?;
            let operator = selector
                .get("operator")
                .and_then(Value::as_str)
                .unwrap_or("In");
            let values = selector_values(&at, selector.get("values"))?;

            Ok(json!({
                "labelSelector": {
                    "matchExpressions": [{ "key": key, "operator": operator, "values": values }]
                },
                "topologyKey": topology_key,
            }))
        })
        .collect::<Result<Vec<_>, Error>>()?;

    if terms.is_empty() {
        return Ok(None);
    }
    Ok(Some(json!({
        "podAntiAffinity": { "requiredDuringSchedulingIgnoredDuringExecution": terms }
    })))
}

fn required_str<'a>(selector: &'a Value, name: &str, at: &Path) -> Result<&'a str, Error> {
    selector
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::translation(at.to_string(), format!("missing string field '{name}'")))
}

fn selector_values(at: &Path, values: Option<&Value>) -> Result<Vec<String>, Error> {
    match values {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(joined)) => Ok(joined
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                Value::Bool(_) | Value::Number(_) => Ok(item.to_string()),
                other => Err(Error::translation(
                    at.child("values").to_string(),
                    format!("expected scalar selector values, found {}", type_name(other)),
                )),
            })
            .collect(),
        Some(other) => Err(Error::translation(
            at.child("values").to_string(),
            format!("expected a string or sequence, found {}", type_name(other)),
        )),
    }
}

/// Inverse of [`anti_affinity`]: one selector per match expression.
pub fn anti_affinity_selectors(affinity: &Value) -> Value {
    let terms = affinity
        .pointer("/podAntiAffinity/requiredDuringSchedulingIgnoredDuringExecution")
        .and_then(Value::as_array)
        .into_iter()
        .flatten();

    let mut selectors = Vec::new();
    for term in terms {
        let topology_key = term.get("topologyKey").cloned().unwrap_or(Value::Null);
        let expressions = term
            .pointer("/labelSelector/matchExpressions")
            .and_then(Value::as_array)
            .into_iter()
            .flatten();
        for expr in expressions {
            let values: Vec<&str> = expr
                .get("values")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .collect();
            selectors.push(json!({
                "key": expr.get("key").cloned().unwrap_or(Value::Null),
                "operator": expr.get("operator").cloned().unwrap_or(Value::Null),
                "values": values.join(","),
                "topologyKey": topology_key.clone(),
            }));
        }
    }
    Value::Array(selectors)
}
