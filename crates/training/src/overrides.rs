//! `key.path=value` overrides applied to a [`TrainingConfig`] through its JSON form.

use std::str::FromStr;

use serde_json::{Map, Number, Value};

use crate::{TrainingConfig, TrainingError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigOverride {
    pub path: String,
    pub value: String,
}

impl FromStr for ConfigOverride {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

pub fn apply_overrides(
    config: TrainingConfig,
    overrides: &[ConfigOverride],
) -> Result<TrainingConfig, TrainingError> {
    if overrides.is_empty() {
        return Ok(config);
    }

    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;
    for item in overrides {
        let segments = parse_path(&item.path)?;
        assign(&mut value, &segments, parse_value(&item.value))?;
    }

    serde_json::from_value(value).map_err(|err| {
        TrainingError::ConfigFormat(format!("config invalid after overrides: {err}"))
    })
}

fn parse_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Some(number) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

#[derive(Debug, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// `runtime.checkpoint.metric` or `metrics[1].kind`.
fn parse_path(path: &str) -> Result<Vec<Segment>, TrainingError> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        let (key, mut rest) = match part.find('[') {
            Some(pos) => part.split_at(pos),
            None => (part, ""),
        };
        if key.is_empty() {
            return Err(TrainingError::runtime(format!(
                "override path '{path}' has an empty segment"
            )));
        }
        segments.push(Segment::Key(key.to_string()));
        while let Some(inner) = rest.strip_prefix('[') {
            let (index, tail) = inner.split_once(']').ok_or_else(|| {
                TrainingError::runtime(format!("unclosed index in override path '{path}'"))
            })?;
            let index = index.parse::<usize>().map_err(|err| {
                TrainingError::runtime(format!("invalid index in override path '{path}': {err}"))
            })?;
            segments.push(Segment::Index(index));
            rest = tail;
        }
        if !rest.is_empty() {
            return Err(TrainingError::runtime(format!(
                "unexpected '{rest}' in override path '{path}'"
            )));
        }
    }
    Ok(segments)
}

fn assign(target: &mut Value, segments: &[Segment], new_value: Value) -> Result<(), TrainingError> {
    let Some((head, tail)) = segments.split_first() else {
        *target = new_value;
        return Ok(());
    };

    match head {
        Segment::Key(key) => {
            if target.is_null() {
                *target = Value::Object(Map::new());
            }
            let Value::Object(map) = target else {
                return Err(TrainingError::runtime(format!(
                    "override segment '{key}' points into a non-object value"
                )));
            };
            assign(map.entry(key.clone()).or_insert(Value::Null), tail, new_value)
        }
        Segment::Index(index) => {
            if target.is_null() {
                *target = Value::Array(Vec::new());
            }
            let Value::Array(items) = target else {
                return Err(TrainingError::runtime(format!(
                    "override index [{index}] points into a non-array value"
                )));
            };
            if items.len() <= *index {
                items.resize(index + 1, Value::Null);
            }
            assign(&mut items[*index], tail, new_value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(items: &[&str]) -> Vec<ConfigOverride> {
        items.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn overrides_nested_fields_and_list_entries() {
        let config = apply_overrides(
            TrainingConfig::default(),
            &parse(&[
                "runtime.epochs=3",
                "optimizer.learning_rate=0.001",
                "metrics[0].kind=iou",
                "runtime.checkpoint.metric=iou",
                "scheduler.milestones=[10, 20]",
                "runtime.visualization.enabled=false",
            ]),
        )
        .unwrap();

        assert_eq!(config.runtime.epochs, 3);
        assert_eq!(config.optimizer.learning_rate, 0.001);
        assert_eq!(config.metrics[0].name(), "iou");
        assert_eq!(config.scheduler.milestones, vec![10, 20]);
        assert!(!config.runtime.visualization.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_malformed_paths_and_types() {
        assert!("no_equals".parse::<ConfigOverride>().is_err());
        assert!(parse_path("metrics[x].kind").is_err());
        assert!(parse_path("runtime..epochs").is_err());
        let err = apply_overrides(TrainingConfig::default(), &parse(&["runtime.epochs=many"]));
        assert!(matches!(err, Err(TrainingError::ConfigFormat(_))));
    }

    #[test]
    fn parses_indexed_segments() {
        assert_eq!(
            parse_path("a[2][0].b").unwrap(),
            vec![
                Segment::Key("a".into()),
                Segment::Index(2),
                Segment::Index(0),
                Segment::Key("b".into()),
            ]
        );
    }
}
