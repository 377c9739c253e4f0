//! Call formats: decoding the raw body of a call or output into a value.
//!
//! - `json`: the body is JSON, optionally inside a Markdown code fence. An
//!   empty body is `{}`.
//! - `xml`: child elements become object keys, repeated keys become arrays,
//!   attributes are merged in, and scalars are coerced using the schema's
//!   property types. Leaf text is kept exactly; whitespace between sibling
//!   elements is dropped. Untyped scalars are read as JSON when they parse.
//! - `text`: the trimmed body as a string.
//! - `jsx`: a sequence of component elements becomes
//!   `[{component, props, children}]`.
//!
//! Schema validation happens in the router, not here.

use crate::parser::parse_attributes;
use ravel_core::capability::CallFormat;
use ravel_core::error::ParseFailure;
use ravel_core::schema::Schema;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Decode `raw` per `format`. `schema` only guides coercion.
pub fn decode(format: CallFormat, raw: &str, schema: &Schema) -> Result<Value, ParseFailure> {
    match format {
        CallFormat::Json => decode_json(raw, schema),
        CallFormat::Text => Ok(Value::String(raw.trim().to_string())),
        CallFormat::Xml => {
            let nodes = parse_nodes(raw).map_err(ParseFailure::Syntax)?;
            if has_elements(&nodes) {
                Ok(xml_value(&nodes, Some(schema.source())))
            } else {
                // A body with no fields is read like a leaf, minus the padding
                // around it.
                Ok(coerce(text_of(&nodes).trim(), Some(schema.source())))
            }
        }
        CallFormat::Jsx => {
            let nodes = parse_nodes(raw).map_err(ParseFailure::Syntax)?;
            Ok(Value::Array(jsx_children(&nodes)))
        }
    }
}

/// Render a value the way a model would write it for `format`.
pub fn encode(format: CallFormat, value: &Value) -> String {
    match format {
        CallFormat::Json => value.to_string(),
        CallFormat::Text => match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
        CallFormat::Xml => {
            let mut out = String::new();
            if let Value::Object(map) = value {
                for (key, value) in map {
                    encode_xml_field(&mut out, key, value);
                }
            } else {
                out.push_str(&scalar_text(value));
            }
            out
        }
        CallFormat::Jsx => {
            let mut out = String::new();
            if let Value::Array(items) = value {
                for item in items {
                    encode_jsx_node(&mut out, item);
                }
            }
            out
        }
    }
}

// ── JSON ──

fn decode_json(raw: &str, schema: &Schema) -> Result<Value, ParseFailure> {
    let body = strip_code_fence(raw.trim());
    if body.is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    match serde_json::from_str::<Value>(body) {
        Ok(value) => Ok(value),
        // A string-typed payload may be written bare
        Err(_) if schema.root_type() == Some("string") => Ok(Value::String(body.to_string())),
        Err(e) => Err(ParseFailure::Syntax(e.to_string())),
    }
}

fn strip_code_fence(body: &str) -> &str {
    let Some(rest) = body.strip_prefix("```") else {
        return body;
    };
    let rest = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

// ── Markup nodes ──

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Element {
        name: String,
        attributes: BTreeMap<String, String>,
        children: Vec<Node>,
    },
    Text(String),
}

struct Reader<'a> {
    src: &'a str,
    pos: usize,
}

fn parse_nodes(src: &str) -> Result<Vec<Node>, String> {
    let mut reader = Reader { src, pos: 0 };
    reader.nodes(None)
}

impl Reader<'_> {
    fn nodes(&mut self, closing: Option<&str>) -> Result<Vec<Node>, String> {
        let mut nodes = Vec::new();
        let mut text = String::new();

        while self.pos < self.src.len() {
            let rest = &self.src[self.pos..];
            if let Some(after) = rest.strip_prefix("</") {
                let end = after
                    .find('>')
                    .ok_or_else(|| format!("unterminated closing tag at offset {}", self.pos))?;
                let name = after[..end].trim();
                return match closing {
                    Some(expected) if expected == name => {
                        push_text(&mut nodes, &mut text);
                        self.pos += end + 3;
                        Ok(nodes)
                    }
                    _ => Err(format!("unexpected closing tag </{name}>")),
                };
            }

            if rest.starts_with('<') && rest[1..].starts_with(|c: char| c.is_ascii_alphabetic()) {
                let end = rest
                    .find('>')
                    .ok_or_else(|| format!("unterminated tag at offset {}", self.pos))?;
                let inner = &rest[1..end];
                let (inner, self_closing) = match inner.trim_end().strip_suffix('/') {
                    Some(body) => (body, true),
                    None => (inner, false),
                };
                let name_end = inner.find(char::is_whitespace).unwrap_or(inner.len());
                let name = inner[..name_end].to_string();
                let attributes = parse_attributes(&inner[name_end..]);

                push_text(&mut nodes, &mut text);
                self.pos += end + 1;
                let children = if self_closing {
                    Vec::new()
                } else {
                    self.nodes(Some(&name))?
                };
                nodes.push(Node::Element {
                    name,
                    attributes,
                    children,
                });
                continue;
            }

            let Some(c) = rest.chars().next() else {
                break;
            };
            text.push(c);
            self.pos += c.len_utf8();
        }

        if let Some(name) = closing {
            return Err(format!("unclosed element <{name}>"));
        }
        push_text(&mut nodes, &mut text);
        Ok(nodes)
    }
}

fn push_text(nodes: &mut Vec<Node>, text: &mut String) {
    let taken = std::mem::take(text);
    if !taken.is_empty() {
        nodes.push(Node::Text(unescape(&taken)));
    }
}

fn has_elements(nodes: &[Node]) -> bool {
    nodes.iter().any(|n| matches!(n, Node::Element { .. }))
}

fn text_of(nodes: &[Node]) -> String {
    nodes
        .iter()
        .filter_map(|n| match n {
            Node::Text(t) => Some(t.as_str()),
            _ => None,
        })
        .collect()
}

fn schema_type(schema: Option<&Value>) -> Option<&str> {
    schema.and_then(|s| s.get("type")).and_then(Value::as_str)
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

// ── XML ──

fn xml_value(nodes: &[Node], schema: Option<&Value>) -> Value {
    if !has_elements(nodes) {
        return coerce(&text_of(nodes), schema);
    }

    let mut object = Map::new();
    for node in nodes {
        let Node::Element {
            name,
            attributes,
            children,
        } = node
        else {
            continue;
        };
        let property = schema.and_then(|s| s.get("properties")).and_then(|p| p.get(name));
        let is_array = schema_type(property) == Some("array");

        // `<tags></tags>` under an array property is the empty list
        if is_array && children.is_empty() && attributes.is_empty() {
            object.entry(name.clone()).or_insert_with(|| Value::Array(Vec::new()));
            continue;
        }

        let item_schema = if is_array {
            property.and_then(|p| p.get("items"))
        } else {
            property
        };
        let value = element_value(attributes, children, item_schema);

        match object.get_mut(name) {
            Some(Value::Array(items)) if is_array || items.len() > 1 => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None if is_array => {
                object.insert(name.clone(), Value::Array(vec![value]));
            }
            None => {
                object.insert(name.clone(), value);
            }
        }
    }
    Value::Object(object)
}

fn element_value(
    attributes: &BTreeMap<String, String>,
    children: &[Node],
    schema: Option<&Value>,
) -> Value {
    let inner = xml_value(children, schema);
    if attributes.is_empty() {
        return inner;
    }
    let mut object = Map::new();
    for (key, value) in attributes {
        let property = schema.and_then(|s| s.get("properties")).and_then(|p| p.get(key));
        object.insert(key.clone(), coerce(value, property));
    }
    match inner {
        Value::Object(map) => object.extend(map),
        Value::String(s) if s.is_empty() => {}
        other => {
            object.insert("value".into(), other);
        }
    }
    Value::Object(object)
}

/// Coerce leaf text to the type the schema asks for. Strings keep their
/// exact text; untyped text is read as JSON when it parses.
fn coerce(text: &str, schema: Option<&Value>) -> Value {
    let trimmed = text.trim();
    let as_string = || Value::String(text.to_string());
    match schema_type(schema) {
        Some("string") => as_string(),
        Some("integer") => trimmed.parse::<i64>().map(Value::from).unwrap_or_else(|_| as_string()),
        Some("number") => trimmed
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(as_string),
        Some("boolean") => match trimmed {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => as_string(),
        },
        Some("null") if trimmed.is_empty() => Value::Null,
        Some("object") if trimmed.is_empty() => Value::Object(Map::new()),
        Some("array") if trimmed.is_empty() => Value::Array(Vec::new()),
        _ if trimmed.is_empty() => as_string(),
        _ => serde_json::from_str(trimmed).unwrap_or_else(|_| as_string()),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => escape(s),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn encode_xml_field(out: &mut String, key: &str, value: &Value) {
    match value {
        Value::Array(items) if items.is_empty() => out.push_str(&format!("<{key}></{key}>")),
        Value::Array(items) => {
            for item in items {
                encode_xml_field(out, key, item);
            }
        }
        Value::Object(map) => {
            out.push_str(&format!("<{key}>"));
            for (k, v) in map {
                encode_xml_field(out, k, v);
            }
            out.push_str(&format!("</{key}>"));
        }
        scalar => out.push_str(&format!("<{key}>{}</{key}>", scalar_text(scalar))),
    }
}

// ── JSX ──

fn jsx_children(nodes: &[Node]) -> Vec<Value> {
    nodes
        .iter()
        .filter_map(|node| match node {
            Node::Text(text) if text.trim().is_empty() => None,
            Node::Text(text) => Some(Value::String(text.trim().to_string())),
            Node::Element {
                name,
                attributes,
                children,
            } => Some(jsx_component(name, attributes, children)),
        })
        .collect()
}

fn jsx_component(name: &str, attributes: &BTreeMap<String, String>, children: &[Node]) -> Value {
    let props: Map<String, Value> = attributes
        .iter()
        .map(|(k, v)| (k.clone(), jsx_prop(v)))
        .collect();
    serde_json::json!({
        "component": name,
        "props": props,
        "children": jsx_children(children),
    })
}

/// `{expr}` props hold JSON; anything else is a string.
fn jsx_prop(raw: &str) -> Value {
    raw.strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_else(|| Value::String(raw.to_string()))
}

fn encode_jsx_node(out: &mut String, node: &Value) {
    let Some(component) = node.get("component").and_then(Value::as_str) else {
        if let Value::String(text) = node {
            out.push_str(&escape(text));
        }
        return;
    };
    out.push('<');
    out.push_str(component);
    if let Some(Value::Object(props)) = node.get("props") {
        for (key, value) in props {
            match value {
                Value::String(s) => out.push_str(&format!(" {key}=\"{s}\"")),
                other => out.push_str(&format!(" {key}={{{other}}}")),
            }
        }
    }
    let children = node.get("children").and_then(Value::as_array);
    match children {
        Some(children) if !children.is_empty() => {
            out.push('>');
            for child in children {
                encode_jsx_node(out, child);
            }
            out.push_str(&format!("</{component}>"));
        }
        _ => out.push_str(" />"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn search_schema() -> Schema {
        Schema::new(json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "limit": { "type": "integer" },
                "exact": { "type": "boolean" },
                "tags": { "type": "array", "items": { "type": "string" } }
            }
        }))
        .unwrap()
    }

    #[test]
    fn json_plain_fenced_and_empty() {
        let any = Schema::any();
        assert_eq!(decode(CallFormat::Json, r#" {"q": 1} "#, &any).unwrap(), json!({"q": 1}));
        assert_eq!(
            decode(CallFormat::Json, "```json\n{\"q\": 1}\n```", &any).unwrap(),
            json!({"q": 1})
        );
        assert_eq!(decode(CallFormat::Json, "  \n", &any).unwrap(), json!({}));
    }

    #[test]
    fn json_syntax_error() {
        let err = decode(CallFormat::Json, "not-json", &Schema::any()).unwrap_err();
        assert!(matches!(err, ParseFailure::Syntax(_)));
    }

    #[test]
    fn bare_string_for_string_schema() {
        let value = decode(CallFormat::Json, "hi", &Schema::string()).unwrap();
        assert_eq!(value, json!("hi"));
        let value = decode(CallFormat::Json, "\"quoted\"", &Schema::string()).unwrap();
        assert_eq!(value, json!("quoted"));
    }

    #[test]
    fn text_is_trimmed() {
        let value = decode(CallFormat::Text, "  hello world \n", &Schema::any()).unwrap();
        assert_eq!(value, json!("hello world"));
    }

    #[test]
    fn xml_coerces_by_schema() {
        let raw = "<query>weather</query><limit>5</limit><exact>true</exact><tags>a</tags>";
        let value = decode(CallFormat::Xml, raw, &search_schema()).unwrap();
        assert_eq!(
            value,
            json!({"query": "weather", "limit": 5, "exact": true, "tags": ["a"]})
        );
    }

    #[test]
    fn xml_repeated_keys_become_arrays() {
        let raw = "<item>a</item><item>b</item><item>c</item>";
        let value = decode(CallFormat::Xml, raw, &Schema::any()).unwrap();
        assert_eq!(value, json!({"item": ["a", "b", "c"]}));
    }

    #[test]
    fn xml_attributes_merge() {
        let raw = r#"<user id="7">ana</user>"#;
        let value = decode(CallFormat::Xml, raw, &Schema::any()).unwrap();
        assert_eq!(value, json!({"user": {"id": 7, "value": "ana"}}));
    }

    #[test]
    fn xml_leaf_text_is_kept_exactly() {
        let raw = "\n  <query>  padded  </query>\n  <limit>5</limit>\n";
        let value = decode(CallFormat::Xml, raw, &search_schema()).unwrap();
        assert_eq!(value, json!({"query": "  padded  ", "limit": 5}));
    }

    #[test]
    fn xml_empty_elements_follow_schema_type() {
        let schema = Schema::new(json!({
            "type": "object",
            "properties": {
                "tags": { "type": "array", "items": { "type": "string" } },
                "opts": { "type": "object" },
                "note": { "type": "string" }
            }
        }))
        .unwrap();
        let value = decode(CallFormat::Xml, "<tags></tags><opts/><note></note>", &schema).unwrap();
        assert_eq!(value, json!({"tags": [], "opts": {}, "note": ""}));
    }

    #[test]
    fn xml_untyped_scalars_read_as_json() {
        let schema = Schema::new(json!({
            "type": "object",
            "properties": { "opts": { "type": "object" } }
        }))
        .unwrap();
        let raw = "<opts><k>1</k><on>true</on><name>ana</name></opts>";
        let value = decode(CallFormat::Xml, raw, &schema).unwrap();
        assert_eq!(value, json!({"opts": {"k": 1, "on": true, "name": "ana"}}));
    }

    #[test]
    fn xml_unclosed_is_syntax_error() {
        let err = decode(CallFormat::Xml, "<query>weather", &Schema::any()).unwrap_err();
        assert!(matches!(err, ParseFailure::Syntax(m) if m.contains("unclosed")));
    }

    #[test]
    fn jsx_components() {
        let raw = r#"<Card title="Hi" count={3}><Button label="ok" /></Card>"#;
        let value = decode(CallFormat::Jsx, raw, &Schema::any()).unwrap();
        assert_eq!(
            value,
            json!([{
                "component": "Card",
                "props": {"title": "Hi", "count": 3},
                "children": [{"component": "Button", "props": {"label": "ok"}, "children": []}]
            }])
        );
    }

    #[test]
    fn encoded_values_decode_back() {
        let schema = Schema::new(json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "limit": { "type": "integer" },
                "exact": { "type": "boolean" },
                "tags": { "type": "array", "items": { "type": "string" } },
                "opts": { "type": "object" }
            }
        }))
        .unwrap();
        let cases = [
            json!({"query": "a < b", "limit": 3, "exact": false, "tags": ["x", "y"]}),
            json!({"query": "  padded  ", "tags": [], "opts": {}}),
            json!({"query": "x", "opts": {"k": 1, "deep": {"on": true}}}),
        ];
        for args in cases {
            for format in [CallFormat::Json, CallFormat::Xml] {
                let raw = encode(format, &args);
                assert_eq!(decode(format, &raw, &schema).unwrap(), args, "format {format}: {raw}");
            }
        }
    }
}
