//! Extraction schema and prompt synthesis from user-defined fields.
//!
//! Centralising schema and prompt construction here serves two purposes:
//!
//! 1. **Single source of truth** — the structured-output contract sent to
//!    the model and the prompt describing it cannot drift apart.
//!
//! 2. **Testability** — unit tests can inspect the generated schema and
//!    rendered prompt directly without spinning up a model.
//!
//! Only descriptors carrying a non-empty extraction instruction participate
//! in generation; fields without one exist for manual entry and are
//! filtered out silently.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Primitive type of a user-defined field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Number,
    Boolean,
}

impl FieldKind {
    /// JSON-schema type name for this kind.
    pub fn json_type(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
        }
    }
}

/// A user-defined field, category, or project entry.
///
/// The same shape serves all three collections: a stable `code` used as the
/// schema property name, a primitive `kind`, and an optional natural-language
/// `instruction` telling the model what to look for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub code: String,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
}

impl FieldDescriptor {
    pub fn new(code: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            code: code.into(),
            kind,
            instruction: None,
        }
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }

    /// The instruction, if present and non-empty.
    fn active_instruction(&self) -> Option<&str> {
        self.instruction.as_deref().filter(|s| !s.trim().is_empty())
    }
}

/// Default prompt template used when
/// [`crate::config::ProcessingConfig::extraction_template`] is `None`.
pub const DEFAULT_EXTRACTION_TEMPLATE: &str = r#"You are an expert bookkeeping assistant. Read the attached document images and extract the requested fields exactly as they appear.

Fields to extract:
{fields}

Known category codes (pick the closest match when a field asks for one): {category_codes}
Known project codes: {project_codes}

If the document itemises multiple positions (an itemised receipt, a multi-line invoice), report each position as one entry of "items" with the same fields. Report values verbatim from the document; never invent a value that is not printed. Respond with a single JSON object and nothing else."#;

/// Build the structured-output schema for the given field definitions.
///
/// The result is a JSON-schema object whose properties are exactly the
/// fields with a non-empty instruction, each typed per its declared
/// primitive kind with the instruction as its description. A required
/// `items` property holds an array of objects with the identical property
/// set, representing repeated line items within one document. Both levels
/// forbid undeclared properties and require every declared one.
pub fn build_schema(fields: &[FieldDescriptor]) -> Value {
    let mut properties = Map::new();
    let mut required: Vec<Value> = Vec::new();

    for field in fields {
        let Some(instruction) = field.active_instruction() else {
            continue;
        };
        properties.insert(
            field.code.clone(),
            json!({
                "type": field.kind.json_type(),
                "description": instruction,
            }),
        );
        required.push(Value::String(field.code.clone()));
    }

    let item_schema = json!({
        "type": "object",
        "properties": Value::Object(properties.clone()),
        "required": Value::Array(required.clone()),
        "additionalProperties": false,
    });

    let mut top_properties = properties;
    top_properties.insert(
        "items".to_string(),
        json!({
            "type": "array",
            "items": item_schema,
        }),
    );
    let mut top_required = required;
    top_required.push(Value::String("items".to_string()));

    json!({
        "type": "object",
        "properties": Value::Object(top_properties),
        "required": Value::Array(top_required),
        "additionalProperties": false,
    })
}

/// Render a prompt template by substituting its placeholders.
///
/// Recognised placeholders:
///
/// | Placeholder        | Resolves to |
/// |--------------------|-------------|
/// | `{fields}`         | bullet list of instructed fields (`- code: instruction`) |
/// | `{categories}`     | bullet list of instructed categories |
/// | `{projects}`       | bullet list of instructed projects |
/// | `{category_codes}` | comma-joined codes of ALL categories |
/// | `{project_codes}`  | comma-joined codes of ALL projects |
///
/// Substitution is a single literal pass: placeholder-like text inside a
/// substituted value is left untouched, and a placeholder with no matching
/// entries resolves to an empty string. Unrecognised `{...}` sequences pass
/// through verbatim.
pub fn render_prompt(
    template: &str,
    fields: &[FieldDescriptor],
    categories: &[FieldDescriptor],
    projects: &[FieldDescriptor],
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open..];
        match after.find('}') {
            Some(close) => {
                let name = &after[1..close];
                match resolve_placeholder(name, fields, categories, projects) {
                    Some(value) => out.push_str(&value),
                    None => out.push_str(&after[..=close]),
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(after);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

fn resolve_placeholder(
    name: &str,
    fields: &[FieldDescriptor],
    categories: &[FieldDescriptor],
    projects: &[FieldDescriptor],
) -> Option<String> {
    match name {
        "fields" => Some(bullet_list(fields)),
        "categories" => Some(bullet_list(categories)),
        "projects" => Some(bullet_list(projects)),
        "category_codes" => Some(code_list(categories)),
        "project_codes" => Some(code_list(projects)),
        _ => None,
    }
}

/// Bullet-formatted `- code: instruction` lines for instructed entries.
fn bullet_list(entries: &[FieldDescriptor]) -> String {
    entries
        .iter()
        .filter_map(|e| {
            e.active_instruction()
                .map(|instruction| format!("- {}: {}", e.code, instruction))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Comma-joined codes of all entries, instructed or not.
fn code_list(entries: &[FieldDescriptor]) -> String {
    entries
        .iter()
        .map(|e| e.code.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_fields() -> Vec<FieldDescriptor> {
        vec![
            FieldDescriptor::new("amount", FieldKind::Number).with_instruction("total paid"),
            FieldDescriptor::new("note", FieldKind::String),
        ]
    }

    #[test]
    fn schema_includes_only_instructed_fields() {
        let schema = build_schema(&sample_fields());

        let props = schema["properties"].as_object().unwrap();
        assert!(props.contains_key("amount"));
        assert!(!props.contains_key("note"));
        assert_eq!(props["amount"]["type"], "number");
        assert_eq!(props["amount"]["description"], "total paid");
    }

    #[test]
    fn schema_requires_fields_and_items_and_is_closed() {
        let schema = build_schema(&sample_fields());

        let required: Vec<&str> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert!(required.contains(&"amount"));
        assert!(required.contains(&"items"));
        assert_eq!(schema["additionalProperties"], false);
    }

    #[test]
    fn schema_items_mirror_property_set() {
        let schema = build_schema(&sample_fields());

        let item = &schema["properties"]["items"]["items"];
        let item_props = item["properties"].as_object().unwrap();
        assert!(item_props.contains_key("amount"));
        assert!(!item_props.contains_key("items"), "items must not nest");
        assert_eq!(item["additionalProperties"], false);
        let item_required: Vec<&str> = item["required"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(item_required, vec!["amount"]);
    }

    #[test]
    fn schema_with_no_instructed_fields_is_empty_but_well_formed() {
        let schema = build_schema(&[FieldDescriptor::new("note", FieldKind::String)]);
        assert!(schema["properties"]
            .as_object()
            .unwrap()
            .keys()
            .eq(["items"].iter()));
        let required = schema["required"].as_array().unwrap();
        assert_eq!(required.len(), 1);
        assert_eq!(required[0], "items");
    }

    #[test]
    fn prompt_substitutes_instructed_fields_only() {
        let rendered = render_prompt("Fields:\n{fields}", &sample_fields(), &[], &[]);
        assert_eq!(rendered, "Fields:\n- amount: total paid");
    }

    #[test]
    fn prompt_enumerates_all_codes_unfiltered() {
        let categories = vec![
            FieldDescriptor::new("travel", FieldKind::String).with_instruction("trips"),
            FieldDescriptor::new("meals", FieldKind::String),
        ];
        let rendered = render_prompt("Codes: {category_codes}", &[], &categories, &[]);
        assert_eq!(rendered, "Codes: travel, meals");
    }

    #[test]
    fn prompt_missing_entries_resolve_to_empty_string() {
        let rendered = render_prompt("[{projects}]", &[], &[], &[]);
        assert_eq!(rendered, "[]");
    }

    #[test]
    fn prompt_unknown_placeholders_pass_through() {
        let rendered = render_prompt("a {mystery} b", &[], &[], &[]);
        assert_eq!(rendered, "a {mystery} b");
    }

    #[test]
    fn prompt_substitution_is_single_pass() {
        // A placeholder smuggled inside an instruction must not expand.
        let fields =
            vec![FieldDescriptor::new("f", FieldKind::String).with_instruction("{category_codes}")];
        let categories = vec![FieldDescriptor::new("travel", FieldKind::String)];
        let rendered = render_prompt("{fields}", &fields, &categories, &[]);
        assert_eq!(rendered, "- f: {category_codes}");
    }

    #[test]
    fn prompt_unterminated_brace_passes_through() {
        let rendered = render_prompt("tail {fields", &sample_fields(), &[], &[]);
        assert_eq!(rendered, "tail {fields");
    }

    #[test]
    fn default_template_renders_without_leftover_placeholders() {
        let rendered = render_prompt(DEFAULT_EXTRACTION_TEMPLATE, &sample_fields(), &[], &[]);
        assert!(rendered.contains("- amount: total paid"));
        assert!(!rendered.contains("{fields}"));
        assert!(!rendered.contains("{category_codes}"));
    }
}
