use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// JSON type a required field must carry. The set mirrors the record shapes
/// seen across deployments; anything else in a config file is a parse error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl FieldKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Array => "array",
            FieldKind::Object => "object",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FieldKind,
}

/// The required shape of an accepted record, supplied by configuration.
/// Swapping field sets per deployment needs no code change.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SchemaSpec {
    pub required: Vec<FieldSpec>,
}

impl SchemaSpec {
    pub fn new(required: Vec<FieldSpec>) -> Self {
        Self { required }
    }

    /// Human-readable field list for prompts and correctives, in declaration
    /// order: `date (string), projectName (string), locations (array)`.
    pub fn describe(&self) -> String {
        self.required
            .iter()
            .map(|field| format!("{} ({})", field.name, field.kind.as_str()))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Every reason the value fails the schema, one entry per offending
    /// field. An empty result means the value conforms.
    pub fn problems(&self, value: &Value) -> Vec<String> {
        let Some(object) = value.as_object() else {
            return vec!["a single JSON object is required".to_string()];
        };
        let mut problems = Vec::new();
        for field in &self.required {
            match object.get(&field.name) {
                None | Some(Value::Null) => {
                    problems.push(format!("{} (missing)", field.name));
                }
                Some(found) if !field.kind.matches(found) => {
                    problems.push(format!("{} (expected {})", field.name, field.kind.as_str()));
                }
                Some(_) => {}
            }
        }
        problems
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Parsed and schema-conformant; carries the record.
    Accepted(Value),
    /// Not valid JSON even after fence stripping.
    Unparsable,
    /// Valid JSON that misses or mistypes required fields.
    Mismatch(Vec<String>),
}

/// Validates a raw assistant reply: strip code fences, parse as JSON, check
/// required fields. Prose with an embedded object is still `Unparsable`;
/// there is no substring salvage.
pub fn accept(raw: &str, schema: &SchemaSpec) -> Verdict {
    let candidate = strip_fences(raw.trim());
    let Ok(value) = serde_json::from_str::<Value>(candidate) else {
        debug!("Reply did not parse as JSON");
        return Verdict::Unparsable;
    };
    let problems = schema.problems(&value);
    if problems.is_empty() {
        Verdict::Accepted(value)
    } else {
        debug!(?problems, "Reply parsed but failed the schema check");
        Verdict::Mismatch(problems)
    }
}

/// Removes a surrounding Markdown code fence, including an optional language
/// tag on the opening line. Anything else passes through untouched.
fn strip_fences(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let Some(inner) = rest.strip_suffix("```") else {
        return text;
    };
    let inner = inner.trim();
    if inner.starts_with('{') || inner.starts_with('[') {
        return inner;
    }
    // first line is a language tag such as `json`
    match inner.split_once('\n') {
        Some((_, body)) => body.trim(),
        None => inner,
    }
}
