//! Declarative processor schemas.
//!
//! A processor describes its slots as plain data; the job cache validates
//! requests against the schema before anything runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parameter value kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Integer,
    Float,
    String,
    Boolean,
    /// Any JSON value.
    Json,
}

/// An input or output file slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotSpec {
    pub name: String,
    #[serde(default)]
    pub optional: bool,
}

impl SlotSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            optional: false,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            optional: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: false,
            default: None,
            min: None,
            max: None,
            choices: None,
            description: None,
        }
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Integer)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Float)
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::String)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Boolean)
    }

    pub fn json(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Json)
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// A default also makes the parameter optional.
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self.optional = true;
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn choices<I, V>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.choices = Some(choices.into_iter().map(Into::into).collect());
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Coerce `value` to this parameter's kind and check its constraints.
    pub fn check(&self, value: &Value) -> Result<Value, String> {
        let coerced = match self.kind {
            ParamKind::Integer => match value {
                Value::Number(n) if n.is_i64() || n.is_u64() => value.clone(),
                Value::Number(n) => match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Value::from(f as i64),
                    _ => return Err(self.type_error("an integer", value)),
                },
                _ => return Err(self.type_error("an integer", value)),
            },
            ParamKind::Float => match value.as_f64() {
                Some(f) => Value::from(f),
                None => return Err(self.type_error("a number", value)),
            },
            ParamKind::String => match value {
                Value::String(_) => value.clone(),
                _ => return Err(self.type_error("a string", value)),
            },
            ParamKind::Boolean => match value {
                Value::Bool(_) => value.clone(),
                _ => return Err(self.type_error("a boolean", value)),
            },
            ParamKind::Json => value.clone(),
        };

        if let Some(n) = coerced.as_f64() {
            if let Some(min) = self.min {
                if n < min {
                    return Err(format!(
                        "parameter '{}' must be >= {}, got {}",
                        self.name, min, coerced
                    ));
                }
            }
            if let Some(max) = self.max {
                if n > max {
                    return Err(format!(
                        "parameter '{}' must be <= {}, got {}",
                        self.name, max, coerced
                    ));
                }
            }
        }

        if let Some(choices) = &self.choices {
            if !choices.contains(&coerced) {
                return Err(format!(
                    "parameter '{}' must be one of {}, got {}",
                    self.name,
                    Value::Array(choices.clone()),
                    coerced
                ));
            }
        }

        Ok(coerced)
    }

    fn type_error(&self, expected: &str, got: &Value) -> String {
        format!("parameter '{}' must be {}, got {}", self.name, expected, got)
    }
}

/// Everything the dispatcher needs to know about a processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorSpec {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub inputs: Vec<SlotSpec>,
    #[serde(default)]
    pub outputs: Vec<SlotSpec>,
    #[serde(default)]
    pub parameters: Vec<ParamSpec>,
}

impl ProcessorSpec {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            parameters: Vec::new(),
        }
    }

    pub fn input(mut self, slot: SlotSpec) -> Self {
        self.inputs.push(slot);
        self
    }

    pub fn output(mut self, slot: SlotSpec) -> Self {
        self.outputs.push(slot);
        self
    }

    pub fn parameter(mut self, param: ParamSpec) -> Self {
        self.parameters.push(param);
        self
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Fill in declared defaults for parameters the request leaves out.
    pub fn with_defaults(&self, params: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
        let mut out = params.clone();
        for p in &self.parameters {
            if let Some(default) = &p.default {
                out.entry(p.name.clone()).or_insert_with(|| default.clone());
            }
        }
        out
    }

    /// Validate parameters (defaults already applied) and return them coerced.
    pub fn validate_parameters(
        &self,
        params: &BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>, String> {
        if let Some(unknown) = params.keys().find(|k| self.param(k).is_none()) {
            return Err(format!(
                "unknown parameter '{}' for processor {}",
                unknown, self.name
            ));
        }

        let mut validated = BTreeMap::new();
        for p in &self.parameters {
            match params.get(&p.name) {
                Some(value) => {
                    validated.insert(p.name.clone(), p.check(value)?);
                }
                None if p.optional => {}
                None => return Err(format!("missing required parameter '{}'", p.name)),
            }
        }
        Ok(validated)
    }

    /// Check the provided input slots against the declared ones.
    pub fn validate_inputs<V>(&self, inputs: &BTreeMap<String, V>) -> Result<(), String> {
        if let Some(unknown) = inputs
            .keys()
            .find(|k| !self.inputs.iter().any(|s| &s.name == *k))
        {
            return Err(format!(
                "unknown input '{}' for processor {}",
                unknown, self.name
            ));
        }
        if let Some(missing) = self
            .inputs
            .iter()
            .find(|s| !s.optional && !inputs.contains_key(&s.name))
        {
            return Err(format!("missing required input '{}'", missing.name));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    fn spec() -> ProcessorSpec {
        ProcessorSpec::new("sorter", "0.1.0")
            .input(SlotSpec::required("raw"))
            .input(SlotSpec::optional("geom"))
            .output(SlotSpec::required("firings"))
            .parameter(ParamSpec::integer("detect_sign").choices([-1, 0, 1]))
            .parameter(ParamSpec::integer("clip_size").min(0.0).with_default(50))
            .parameter(ParamSpec::float("threshold").min(0.0).max(100.0).optional())
    }

    #[test]
    fn test_defaults_and_coercion() {
        let spec = spec();
        let p = spec.with_defaults(&params(json!({"detect_sign": 1.0, "threshold": 3})));
        let v = spec.validate_parameters(&p).unwrap();
        assert_eq!(v["detect_sign"], json!(1));
        assert_eq!(v["clip_size"], json!(50));
        assert_eq!(v["threshold"], json!(3.0));
    }

    #[test]
    fn test_bounds() {
        let spec = spec();
        let err = spec
            .validate_parameters(&spec.with_defaults(&params(json!({"detect_sign": 1, "clip_size": -3}))))
            .unwrap_err();
        assert!(err.contains("clip_size"));
        assert!(err.contains(">= 0"));

        let err = spec
            .validate_parameters(&params(json!({"detect_sign": 1, "threshold": 100.5})))
            .unwrap_err();
        assert!(err.contains("<= 100"));
    }

    #[test]
    fn test_type_and_choice_errors() {
        let spec = spec();
        assert!(spec
            .validate_parameters(&params(json!({"detect_sign": "1"})))
            .unwrap_err()
            .contains("integer"));
        assert!(spec
            .validate_parameters(&params(json!({"detect_sign": 1.5})))
            .is_err());
        assert!(spec
            .validate_parameters(&params(json!({"detect_sign": 2})))
            .unwrap_err()
            .contains("one of"));
    }

    #[test]
    fn test_missing_and_unknown() {
        let spec = spec();
        assert!(spec
            .validate_parameters(&params(json!({})))
            .unwrap_err()
            .contains("missing required parameter 'detect_sign'"));
        assert!(spec
            .validate_parameters(&params(json!({"detect_sign": 1, "bogus": 0})))
            .unwrap_err()
            .contains("unknown parameter 'bogus'"));
    }

    #[test]
    fn test_inputs() {
        let spec = spec();
        let mut inputs = BTreeMap::new();
        assert!(spec.validate_inputs(&inputs).is_err());
        inputs.insert("raw".to_string(), "sha1://...".to_string());
        assert!(spec.validate_inputs(&inputs).is_ok());
        inputs.insert("other".to_string(), "x".to_string());
        assert!(spec.validate_inputs(&inputs).is_err());
    }
}
