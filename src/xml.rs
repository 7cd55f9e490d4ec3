use crate::error::FsError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use sxd_document::dom::{ChildOfElement, ChildOfRoot, Document, Element};
use sxd_document::{parser, Package};
use sxd_xpath::nodeset::Node;
use sxd_xpath::evaluate_xpath;

pub const DEFAULT_RESPONSE_BYTES: usize = 200 * 1024;
pub const MAX_SOURCE_BYTES: usize = 10 * 1024 * 1024;

const ATTRIBUTE_PREFIX: &str = "@_";
const TEXT_KEY: &str = "#text";

pub fn parse(text: &str, label: &str) -> Result<Package> {
	parser::parse(text).map_err(|err| FsError::invalid(format!("{} is not well-formed XML: {:?}", label, err)).into())
}

fn root_element<'d>(doc: &Document<'d>) -> Option<Element<'d>> {
	doc.root()
		.children()
		.into_iter()
		.find_map(
			|child| match child {
				ChildOfRoot::Element(element) => Some(element),
				_ => None,
			})
}

fn qualified(prefix: Option<&str>, local: &str) -> String {
	match prefix {
		Some(prefix) => format!("{}:{}", prefix, local),
		None => local.to_string(),
	}
}

fn element_name(element: &Element) -> String {
	qualified(element.preferred_prefix(), element.name().local_part())
}

fn child_elements<'d>(element: &Element<'d>) -> Vec<Element<'d>> {
	element
		.children()
		.into_iter()
		.filter_map(
			|child| match child {
				ChildOfElement::Element(inner) => Some(inner),
				_ => None,
			})
		.collect()
}

fn text_content(element: &Element, out: &mut String) {
	for child in element.children() {
		match child {
			ChildOfElement::Element(inner) => text_content(&inner, out),
			ChildOfElement::Text(text) => out.push_str(text.text()),
			_ => {}
		}
	}
}

// Every element in document order, root first.
fn descendants<'d>(root: Element<'d>) -> Vec<Element<'d>> {
	let mut out = Vec::new();
	let mut stack = vec![root];
	while let Some(element) = stack.pop() {
		let mut children = child_elements(&element);
		children.reverse();
		stack.extend(children);
		out.push(element);
	}
	out
}

fn attribute_pairs(element: &Element) -> Vec<(String, String)> {
	element
		.attributes()
		.into_iter()
		.map(|attr| (qualified(attr.preferred_prefix(), attr.name().local_part()), attr.value().to_string()))
		.collect()
}

fn format_node(node: &Node, include_attributes: bool) -> Value {
	match node {
		Node::Element(element) => {
			let mut text = String::new();
			text_content(element, &mut text);
			let mut formatted = json!({
				"type": "element",
				"name": element_name(element),
				"value": text.trim(),
			});
			let attributes = attribute_pairs(element);
			if include_attributes && !attributes.is_empty() {
				formatted["attributes"] = attributes
					.into_iter()
					.map(|(name, value)| json!({ "name": name, "value": value }))
					.collect();
			}
			formatted
		}
		Node::Text(text) => json!({ "type": "text", "value": text.text().trim() }),
		Node::Attribute(attr) => json!({
			"type": "attribute",
			"name": qualified(attr.preferred_prefix(), attr.name().local_part()),
			"value": attr.value(),
		}),
		other => json!({ "type": "unknown", "value": other.string_value() }),
	}
}

// Results that would push the list past `max_response_bytes` are counted in `omitted`.
pub fn query(doc: &Document, expression: &str, include_attributes: bool, max_response_bytes: usize) -> Result<Value> {
	let value = evaluate_xpath(doc, expression).map_err(|err| FsError::invalid(format!("XPath query failed: {}", err)))?;
	let formatted: Vec<Value> = match value {
		sxd_xpath::Value::Nodeset(nodes) => nodes
			.document_order()
			.iter()
			.map(|node| format_node(node, include_attributes))
			.collect(),
		sxd_xpath::Value::Boolean(flag) => vec![json!({ "type": "text", "value": flag.to_string() })],
		sxd_xpath::Value::Number(number) => vec![json!({ "type": "text", "value": number.to_string() })],
		sxd_xpath::Value::String(text) => vec![json!({ "type": "text", "value": text })],
	};
	let total = formatted.len();
	let (results, used) = fit_to_limit(formatted, max_response_bytes);
	let count = results.len();
	Ok(json!({
		"query": expression,
		"results": results,
		"count": count,
		"omitted": total - count,
		"truncated": count < total,
		"responseBytes": used,
	}))
}

// Keeps a prefix of `items` whose compact JSON array fits in `limit` bytes.
fn fit_to_limit(items: Vec<Value>, limit: usize) -> (Vec<Value>, usize) {
	let mut used: usize = 2;
	let mut kept = Vec::new();
	for item in items {
		let size = serde_json::to_string(&item).map(|text| text.len()).unwrap_or(usize::MAX) + 1;
		if used.saturating_add(size) > limit {
			break;
		}
		used += size;
		kept.push(item);
	}
	(kept, used)
}

pub fn tag_summary(doc: &Document, max_response_bytes: usize) -> Value {
	let elements = root_element(doc).map(descendants).unwrap_or_default();
	let mut tags: Vec<String> = Vec::new();
	for element in &elements {
		let name = element_name(element);
		if !tags.contains(&name) {
			tags.push(name);
		}
	}
	let total = tags.len();
	let tags: Vec<Value> = tags.into_iter().map(Value::String).collect();
	let (kept, _) = fit_to_limit(tags, max_response_bytes);
	let kept_count = kept.len();
	let mut summary = json!({
		"tags": kept,
		"count": elements.len(),
		"rootElement": root_element(doc).map(|root| element_name(&root)),
	});
	if kept_count < total {
		summary["truncated"] = json!(true);
		summary["omittedTagCount"] = json!(total - kept_count);
	}
	summary
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HierarchyNode {
	name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	has_children: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	children: Option<Vec<HierarchyNode>>,
}

// Below `max_depth` only the first child of each distinct name is expanded.
fn hierarchy(element: &Element, max_depth: usize, depth: usize) -> HierarchyNode {
	if depth >= max_depth {
		return HierarchyNode {
			name: element_name(element),
			has_children: Some(!element.children().is_empty()),
			children: None
		};
	}
	let mut seen: Vec<String> = Vec::new();
	let mut children = Vec::new();
	for child in child_elements(element) {
		let name = element_name(&child);
		if seen.contains(&name) {
			continue;
		}
		seen.push(name);
		children.push(hierarchy(&child, max_depth, depth + 1));
	}
	HierarchyNode {
		name: element_name(element),
		has_children: None,
		children: Some(children)
	}
}

pub fn structure(doc: &Document, max_depth: usize, include_attributes: bool, max_response_bytes: usize) -> Result<Value> {
	let root = root_element(doc);
	let mut elements: BTreeMap<String, u64> = BTreeMap::new();
	let mut attributes: BTreeMap<String, u64> = BTreeMap::new();
	let mut namespaces: BTreeMap<String, String> = BTreeMap::new();
	for element in root.map(descendants).unwrap_or_default() {
		let name = element_name(&element);
		if let Some(uri) = element.name().namespace_uri() {
			namespaces.insert(element.preferred_prefix().unwrap_or("").to_string(), uri.to_string());
		}
		if include_attributes {
			for (attr, _) in attribute_pairs(&element) {
				*attributes.entry(format!("{}@{}", name, attr)).or_insert(0) += 1;
			}
		}
		*elements.entry(name).or_insert(0) += 1;
	}
	let tree = root.map(|root| hierarchy(&root, max_depth, 0));
	let full = json!({
		"rootElement": root.map(|root| element_name(&root)),
		"elements": elements,
		"attributes": if include_attributes { json!(attributes) } else { Value::Null },
		"namespaces": namespaces,
		"hierarchy": tree,
	});
	let size = serde_json::to_string(&full)?.len();
	if size <= max_response_bytes {
		return Ok(full);
	}
	let children_count = tree.as_ref()
		.and_then(|node| node.children.as_ref())
		.map(Vec::len)
		.unwrap_or(0);
	Ok(json!({
		"rootElement": full["rootElement"],
		"namespaces": full["namespaces"],
		"elementTypeCount": elements.len(),
		"attributeKeyCount": attributes.len(),
		"hierarchy": tree.map(|node| json!({
			"name": node.name,
			"hasChildren": children_count > 0 || node.has_children.unwrap_or(false),
			"childrenCount": children_count,
		})),
		"truncated": true,
		"note": format!("full structure omitted to fit response limit of {} bytes", max_response_bytes),
	}))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ConvertOptions {
	pub ignore_attributes: bool,
	pub preserve_order: bool,
	pub format: bool,
	pub indent_size: usize,
}

impl Default for ConvertOptions {
	fn default() -> Self {
		Self {
			ignore_attributes: false,
			preserve_order: true,
			format: true,
			indent_size: 2
		}
	}
}

/// Converts a document to JSON. Attributes become `@_name` keys and text `#text`;
/// whitespace-only text is dropped. With `preserve_order` every element is a
/// one-key object holding an ordered child list, otherwise repeated children
/// collapse into arrays and text-only elements into plain strings.
pub fn to_json(doc: &Document, options: &ConvertOptions) -> Value {
	let Some(root) = root_element(doc) else {
		return if options.preserve_order {
			json!([])
		}
		else {
			json!({})
		};
	};
	if options.preserve_order {
		json!([ordered_element(&root, options)])
	}
	else {
		let mut top = Map::new();
		top.insert(element_name(&root), compact_element(&root, options));
		Value::Object(top)
	}
}

fn attribute_map(element: &Element, options: &ConvertOptions) -> Option<Map<String, Value>> {
	if options.ignore_attributes {
		return None;
	}
	let attributes = attribute_pairs(element);
	if attributes.is_empty() {
		return None;
	}
	Some(
		attributes
			.into_iter()
			.map(|(name, value)| (format!("{}{}", ATTRIBUTE_PREFIX, name), Value::String(value)))
			.collect()
	)
}

fn ordered_element(element: &Element, options: &ConvertOptions) -> Value {
	let mut children = Vec::new();
	for child in element.children() {
		match child {
			ChildOfElement::Element(inner) => children.push(ordered_element(&inner, options)),
			ChildOfElement::Text(text) => {
				let trimmed = text.text().trim();
				if !trimmed.is_empty() {
					children.push(json!({ TEXT_KEY: trimmed }));
				}
			}
			_ => {}
		}
	}
	let mut node = Map::new();
	node.insert(element_name(element), Value::Array(children));
	if let Some(attributes) = attribute_map(element, options) {
		node.insert(":@".to_string(), Value::Object(attributes));
	}
	Value::Object(node)
}

fn compact_element(element: &Element, options: &ConvertOptions) -> Value {
	let mut node = attribute_map(element, options).unwrap_or_default();
	let mut text = String::new();
	for child in element.children() {
		match child {
			ChildOfElement::Element(inner) => {
				let value = compact_element(&inner, options);
				let name = element_name(&inner);
				match node.remove(&name) {
					Some(Value::Array(mut items)) => {
						items.push(value);
						node.insert(name, Value::Array(items));
					}
					Some(existing) => {
						node.insert(name, json!([existing, value]));
					}
					None => {
						node.insert(name, value);
					}
				}
			}
			ChildOfElement::Text(fragment) => text.push_str(fragment.text()),
			_ => {}
		}
	}
	let text = text.trim();
	if node.is_empty() {
		return Value::String(text.to_string());
	}
	if !text.is_empty() {
		node.insert(TEXT_KEY.to_string(), Value::String(text.to_string()));
	}
	Value::Object(node)
}

pub fn render(value: &Value, options: &ConvertOptions) -> Result<String> {
	if !options.format {
		return Ok(serde_json::to_string(value)?);
	}
	let indent = " ".repeat(options.indent_size);
	let mut out = Vec::new();
	let formatter = serde_json::ser::PrettyFormatter::with_indent(indent.as_bytes());
	let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
	value.serialize(&mut serializer)?;
	Ok(String::from_utf8(out)?)
}

#[cfg(test)]
mod tests {
	use super::*;

	const CATALOG: &str = r#"<?xml version="1.0"?>
<catalog xmlns:x="urn:extra">
	<book id="b1" lang="en">
		<title>Rust</title>
		<price>30</price>
	</book>
	<book id="b2">
		<title>Tokio</title>
		<x:note>borrowed</x:note>
	</book>
	<magazine/>
</catalog>"#;

	#[test]
	fn query_formats_elements_attributes_and_text() {
		let package = parse(CATALOG, "catalog.xml").expect("parse");
		let doc = package.as_document();
		let books = query(&doc, "//book", true, DEFAULT_RESPONSE_BYTES).expect("query");
		assert_eq!(books["count"], 2);
		assert_eq!(books["results"][0]["type"], "element");
		assert_eq!(books["results"][0]["name"], "book");
		let attributes = books["results"][0]["attributes"].as_array().expect("attributes");
		assert_eq!(attributes.len(), 2);
		assert!(attributes.contains(&json!({ "name": "id", "value": "b1" })));
		assert!(books["results"][0]["value"].as_str().unwrap().starts_with("Rust"));
		let ids = query(&doc, "//book/@id", true, DEFAULT_RESPONSE_BYTES).expect("query");
		assert_eq!(ids["results"][1], json!({ "type": "attribute", "name": "id", "value": "b2" }));
		let titles = query(&doc, "//title/text()", true, DEFAULT_RESPONSE_BYTES).expect("query");
		assert_eq!(titles["results"][0], json!({ "type": "text", "value": "Rust" }));
		let bare = query(&doc, "//book", false, DEFAULT_RESPONSE_BYTES).expect("query");
		assert!(bare["results"][0].get("attributes").is_none());
		let counted = query(&doc, "count(//book)", true, DEFAULT_RESPONSE_BYTES).expect("query");
		assert_eq!(counted["results"][0]["value"], "2");
	}

	#[test]
	fn query_drops_results_past_the_response_limit() {
		let package = parse(CATALOG, "catalog.xml").expect("parse");
		let doc = package.as_document();
		let one = serde_json::to_string(&json!({ "type": "text", "value": "Rust" })).unwrap().len();
		let limited = query(&doc, "//title/text()", true, one + 3).expect("query");
		assert_eq!(limited["count"], 1);
		assert_eq!(limited["omitted"], 1);
		assert_eq!(limited["truncated"], true);
		assert!(query(&doc, "//[", true, DEFAULT_RESPONSE_BYTES).is_err());
	}

	#[test]
	fn tag_summary_lists_distinct_tags() {
		let package = parse(CATALOG, "catalog.xml").expect("parse");
		let summary = tag_summary(&package.as_document(), DEFAULT_RESPONSE_BYTES);
		assert_eq!(summary["rootElement"], "catalog");
		assert_eq!(summary["count"], 8);
		assert_eq!(summary["tags"], json!(["catalog", "book", "title", "price", "x:note", "magazine"]));
		let trimmed = tag_summary(&package.as_document(), 20);
		assert_eq!(trimmed["truncated"], true);
		assert!(trimmed["omittedTagCount"].as_u64().unwrap() > 0);
	}

	#[test]
	fn structure_counts_elements_attributes_and_namespaces() {
		let package = parse(CATALOG, "catalog.xml").expect("parse");
		let shape = structure(&package.as_document(), 1, true, DEFAULT_RESPONSE_BYTES).expect("structure");
		assert_eq!(shape["rootElement"], "catalog");
		assert_eq!(shape["elements"]["book"], 2);
		assert_eq!(shape["attributes"]["book@id"], 2);
		assert_eq!(shape["attributes"]["book@lang"], 1);
		assert_eq!(shape["namespaces"]["x"], "urn:extra");
		let children = shape["hierarchy"]["children"].as_array().expect("children");
		assert_eq!(children.len(), 2);
		assert_eq!(children[0], json!({ "name": "book", "hasChildren": true }));
		assert_eq!(children[1], json!({ "name": "magazine", "hasChildren": false }));
		let summary = structure(&package.as_document(), 3, true, 64).expect("structure");
		assert_eq!(summary["truncated"], true);
		assert_eq!(summary["hierarchy"]["childrenCount"], 2);
	}

	#[test]
	fn conversion_keeps_order_or_collapses() {
		let package = parse(r#"<r a="1"><i>x</i><i>y</i><e/></r>"#, "r.xml").expect("parse");
		let doc = package.as_document();
		let ordered = to_json(&doc, &ConvertOptions::default());
		assert_eq!(
			ordered,
			json!([{
				"r": [
					{ "i": [{ "#text": "x" }] },
					{ "i": [{ "#text": "y" }] },
					{ "e": [] }
				],
				":@": { "@_a": "1" }
			}])
		);
		let compact = ConvertOptions {
			preserve_order: false,
			ignore_attributes: true,
			..ConvertOptions::default()
		};
		assert_eq!(to_json(&doc, &compact), json!({ "r": { "i": ["x", "y"], "e": "" } }));
	}

	#[test]
	fn render_honors_indent_and_format() {
		let value = json!({ "a": [1] });
		let options = ConvertOptions {
			indent_size: 4,
			..ConvertOptions::default()
		};
		assert_eq!(render(&value, &options).unwrap(), "{\n    \"a\": [\n        1\n    ]\n}");
		let flat = ConvertOptions {
			format: false,
			..ConvertOptions::default()
		};
		assert_eq!(render(&value, &flat).unwrap(), "{\"a\":[1]}");
	}
}
