//! Method signatures and their wire descriptions.
//!
//! A [`MethodSignature`] is declared by whoever registers a server method.
//! At registration time it is turned into an immutable [`MethodDescriptor`],
//! the form served on every `GET /`:
//!
//! ```json
//! {"docstring": "...", "args": [["code", "unspecified"]],
//!  "kwargs": {"nproc": {"type": "unspecified", "default": 4}}}
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const UNSPECIFIED_TYPE: &str = "unspecified";

const RECEIVER_PARAM: &str = "self";

#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    name: String,
    type_hint: String,
    default: Option<Value>,
}

impl Param {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_hint: UNSPECIFIED_TYPE.to_string(),
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, default: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            type_hint: UNSPECIFIED_TYPE.to_string(),
            default: Some(default.into()),
        }
    }

    pub fn with_type(mut self, type_hint: impl Into<String>) -> Self {
        self.type_hint = type_hint.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_hint(&self) -> &str {
        &self.type_hint
    }

    pub fn default(&self) -> Option<&Value> {
        self.default.as_ref()
    }
}

/// Declared parameter list and documentation of a server method.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MethodSignature {
    docstring: String,
    params: Vec<Param>,
}

impl MethodSignature {
    pub fn new(docstring: impl Into<String>) -> Self {
        Self {
            docstring: docstring.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    pub fn docstring(&self) -> &str {
        &self.docstring
    }

    /// Parameters in declaration order, with any receiver parameter removed.
    pub fn params(&self) -> impl Iterator<Item = &Param> {
        self.params
            .iter()
            .filter(|param| param.name != RECEIVER_PARAM)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeywordArg {
    #[serde(rename = "type", default = "unspecified_type")]
    pub type_hint: String,
    pub default: Value,
}

impl KeywordArg {
    /// The default as it should be sent on the wire.
    pub fn default_value(&self) -> Value {
        parse_default(&self.default)
    }
}

fn unspecified_type() -> String {
    UNSPECIFIED_TYPE.to_string()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MethodDescriptor {
    #[serde(skip)]
    pub name: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub docstring: String,
    #[serde(default)]
    pub args: Vec<(String, String)>,
    #[serde(default)]
    pub kwargs: IndexMap<String, KeywordArg>,
}

impl MethodDescriptor {
    pub fn from_signature(name: impl Into<String>, signature: &MethodSignature) -> Self {
        let mut args = Vec::new();
        let mut kwargs = IndexMap::new();
        for param in signature.params() {
            match param.default() {
                None => args.push((param.name().to_string(), param.type_hint().to_string())),
                Some(default) => {
                    kwargs.insert(
                        param.name().to_string(),
                        KeywordArg {
                            type_hint: param.type_hint().to_string(),
                            default: render_default(default),
                        },
                    );
                }
            }
        }
        Self {
            name: name.into(),
            docstring: signature.docstring().to_string(),
            args,
            kwargs,
        }
    }

    /// One-line rendering such as `m(x: 'str', y: 'unspecified' = 5)`.
    pub fn signature_line(&self) -> String {
        let mut parts: Vec<String> = self
            .args
            .iter()
            .map(|(name, hint)| format!("{name}: '{hint}'"))
            .collect();
        for (name, kwarg) in self.kwargs.iter() {
            let default = match &kwarg.default {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            parts.push(format!("{name}: '{}' = {default}", kwarg.type_hint));
        }
        format!("{}({})", self.name, parts.join(", "))
    }
}

fn nullable_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Wire form of a default: strings travel quoted, everything else literally.
pub fn render_default(value: &Value) -> Value {
    match value {
        Value::String(text) => Value::String(format!("\"{text}\"")),
        other => other.clone(),
    }
}

/// Inverse of [`render_default`].
pub fn parse_default(value: &Value) -> Value {
    match value {
        Value::String(text) if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') => {
            Value::String(text[1..text.len() - 1].to_string())
        }
        other => other.clone(),
    }
}

/// Ordered `name -> descriptor` table as served by `GET /`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RegistryDescription(IndexMap<String, MethodDescriptor>);

impl RegistryDescription {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `descriptor` unless its name is already described.
    pub fn push(&mut self, descriptor: MethodDescriptor) -> bool {
        if self.0.contains_key(&descriptor.name) {
            return false;
        }
        self.0.insert(descriptor.name.clone(), descriptor);
        true
    }

    pub fn get(&self, name: &str) -> Option<&MethodDescriptor> {
        self.0.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &MethodDescriptor> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for RegistryDescription {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut methods = IndexMap::<String, MethodDescriptor>::deserialize(deserializer)?;
        for (name, descriptor) in methods.iter_mut() {
            descriptor.name = name.clone();
        }
        Ok(Self(methods))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fit_signature() -> MethodSignature {
        MethodSignature::new("Fit a ligand.")
            .param(Param::required("self"))
            .param(Param::required("map_file"))
            .param(Param::optional("resolution", 3.0))
            .param(Param::optional("thoroughness", "medium"))
    }

    #[test]
    fn splits_required_and_keyword_params() {
        let descriptor = MethodDescriptor::from_signature("fit", &fit_signature());
        assert_eq!(
            descriptor.args,
            vec![("map_file".to_string(), UNSPECIFIED_TYPE.to_string())]
        );
        assert_eq!(descriptor.kwargs.len(), 2);
        assert_eq!(descriptor.kwargs.get("resolution").unwrap().default, json!(3.0));
        assert_eq!(
            descriptor.kwargs.get("thoroughness").unwrap().default,
            json!("\"medium\"")
        );
    }

    #[test]
    fn string_defaults_unquote_for_the_wire() {
        let descriptor = MethodDescriptor::from_signature("fit", &fit_signature());
        let kwarg = descriptor.kwargs.get("thoroughness").unwrap();
        assert_eq!(kwarg.default_value(), json!("medium"));
        assert_eq!(parse_default(&json!(4)), json!(4));
    }

    #[test]
    fn renders_signature_line() {
        let descriptor = MethodDescriptor::from_signature("fit", &fit_signature());
        assert_eq!(
            descriptor.signature_line(),
            "fit(map_file: 'unspecified', resolution: 'unspecified' = 3.0, \
             thoroughness: 'unspecified' = \"medium\")"
        );
    }

    #[test]
    fn description_round_trips_through_json() {
        let mut description = RegistryDescription::new();
        description.push(MethodDescriptor::from_signature("fit", &fit_signature()));
        description.push(MethodDescriptor::from_signature(
            "working_dir",
            &MethodSignature::new("Report the directory."),
        ));

        let text = serde_json::to_string(&description).unwrap();
        let parsed: RegistryDescription = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, description);
        assert_eq!(
            parsed.names().cloned().collect::<Vec<_>>(),
            vec!["fit".to_string(), "working_dir".to_string()]
        );
    }

    #[test]
    fn repeated_wire_keys_keep_the_last_entry() {
        let text = r#"{
            "m": {"docstring": "first", "args": [], "kwargs": {}},
            "n": {"docstring": "other", "args": [], "kwargs": {}},
            "m": {"docstring": "second", "args": [], "kwargs": {}}
        }"#;
        let parsed: RegistryDescription = serde_json::from_str(text).unwrap();
        let generic: Value = serde_json::from_str(text).unwrap();
        assert_eq!(parsed.get("m").unwrap().docstring, "second");
        assert_eq!(generic["m"]["docstring"], json!("second"));
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn push_keeps_the_first_descriptor_of_a_name() {
        let mut description = RegistryDescription::new();
        assert!(description.push(MethodDescriptor::from_signature(
            "m",
            &MethodSignature::new("first")
        )));
        assert!(!description.push(MethodDescriptor::from_signature(
            "m",
            &MethodSignature::new("second")
        )));
        assert_eq!(description.get("m").unwrap().docstring, "first");
    }

    #[test]
    fn accepts_minimal_wire_descriptor() {
        let parsed: RegistryDescription = serde_json::from_value(json!({
            "m": {"docstring": null, "args": [["x", "str"]], "kwargs": {"y": {"default": 5}}}
        }))
        .unwrap();
        let descriptor = parsed.get("m").unwrap();
        assert_eq!(descriptor.name, "m");
        assert_eq!(descriptor.kwargs.get("y").unwrap().type_hint, UNSPECIFIED_TYPE);
    }
}
