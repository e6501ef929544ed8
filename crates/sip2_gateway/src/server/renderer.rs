#![forbid(unsafe_code)]

//! Response templates.
//!
//! Templates are plain SIP2 bodies with placeholders:
//!
//! * `{{name}}` inserts a model value (`a.b` walks nested objects). Booleans
//!   render as `Y`/`N`.
//! * `{{#name}}` is the same but renders booleans as `1`/`0`.
//! * `{{name:N}}` pads to `N` characters: numbers with leading zeros, text
//!   with trailing spaces (text longer than `N` is cut).
//! * `{{?name}}...{{/name}}` renders its body only when `name` is present and
//!   not `null`, `false`, `""` or `[]`.
//! * `{{*name}}...{{/name}}` repeats its body for each element of an array;
//!   `{{.}}` is the current element.

use std::collections::HashMap;

use rust_embed::RustEmbed;
use serde_json::Value;
use sip2_domain::Command;
use thiserror::Error;

#[derive(RustEmbed)]
#[folder = "templates/"]
struct EmbeddedTemplates;

const FAILURE_TEMPLATE: &str = "failure.sip";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RenderError {
	#[error("no template registered for {0}")]
	NoTemplate(Command),

	#[error("template {name}: {reason}")]
	Template {
		name: String,
		reason: String,
	},

	#[error("model has no value for {0:?}")]
	MissingValue(String),

	#[error("model value for {0:?} cannot be rendered as text")]
	UnsupportedValue(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
	Text(String),
	Value {
		path: String,
		width: Option<usize>,
		digit: bool,
	},
	Section {
		path: String,
		repeat: bool,
		body: Vec<Node>,
	},
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
	nodes: Vec<Node>,
}

impl Template {
	pub fn parse(name: &str, source: &str) -> Result<Self, RenderError> {
		let err = |reason: String| RenderError::Template {
			name: name.to_string(),
			reason,
		};

		// Each open section keeps its path, repeat flag and the nodes collected so far.
		let mut stack: Vec<(String, bool, Vec<Node>)> = Vec::new();
		let mut current: Vec<Node> = Vec::new();
		let mut rest = source;

		while let Some(start) = rest.find("{{") {
			if start > 0 {
				current.push(Node::Text(rest[..start].to_string()));
			}
			let after = &rest[start + 2..];
			let end = after.find("}}").ok_or_else(|| err("unterminated tag".to_string()))?;
			let tag = after[..end].trim();
			rest = &after[end + 2..];

			if let Some(path) = tag.strip_prefix('?').or_else(|| tag.strip_prefix('*')) {
				let repeat = tag.starts_with('*');
				stack.push((path.trim().to_string(), repeat, std::mem::take(&mut current)));
			} else if let Some(path) = tag.strip_prefix('/') {
				let (open, repeat, parent) = stack
					.pop()
					.ok_or_else(|| err(format!("closing {path:?} without an open section")))?;
				if open != path.trim() {
					return Err(err(format!("section {open:?} closed by {path:?}")));
				}
				let body = std::mem::replace(&mut current, parent);
				current.push(Node::Section {
					path: open,
					repeat,
					body,
				});
			} else {
				let (digit, tag) = match tag.strip_prefix('#') {
					Some(rest) => (true, rest.trim()),
					None => (false, tag),
				};
				let (path, width) = match tag.rsplit_once(':') {
					Some((path, width)) => {
						let width = width
							.trim()
							.parse::<usize>()
							.map_err(|_| err(format!("invalid width in {tag:?}")))?;
						(path.trim(), Some(width))
					}
					None => (tag, None),
				};
				if path.is_empty() {
					return Err(err("empty placeholder".to_string()));
				}
				current.push(Node::Value {
					path: path.to_string(),
					width,
					digit,
				});
			}
		}

		if let Some((open, _, _)) = stack.last() {
			return Err(err(format!("section {open:?} is never closed")));
		}
		if !rest.is_empty() {
			current.push(Node::Text(rest.to_string()));
		}

		Ok(Self { nodes: current })
	}

	pub fn render(&self, model: &Value) -> Result<String, RenderError> {
		let mut out = String::new();
		let mut scopes = vec![model];
		render_nodes(&self.nodes, &mut scopes, &mut out)?;
		Ok(out)
	}
}

fn lookup<'a>(scopes: &[&'a Value], path: &str) -> Option<&'a Value> {
	if path == "." {
		return scopes.last().copied();
	}
	scopes.iter().rev().find_map(|scope| {
		let mut value = *scope;
		for part in path.split('.') {
			value = value.as_object()?.get(part)?;
		}
		Some(value)
	})
}

fn is_truthy(value: Option<&Value>) -> bool {
	match value {
		None | Some(Value::Null) | Some(Value::Bool(false)) => false,
		Some(Value::String(s)) => !s.is_empty(),
		Some(Value::Array(a)) => !a.is_empty(),
		Some(_) => true,
	}
}

fn format_value(path: &str, value: &Value, width: Option<usize>, digit: bool) -> Result<String, RenderError> {
	let text = match value {
		Value::String(s) => s.clone(),
		Value::Bool(b) => match (b, digit) {
			(true, true) => "1".to_string(),
			(false, true) => "0".to_string(),
			(true, false) => "Y".to_string(),
			(false, false) => "N".to_string(),
		},
		Value::Number(n) => {
			return Ok(match width {
				Some(w) => format!("{:0>w$}", n.to_string()),
				None => n.to_string(),
			});
		}
		Value::Null => return Err(RenderError::MissingValue(path.to_string())),
		Value::Array(_) | Value::Object(_) => return Err(RenderError::UnsupportedValue(path.to_string())),
	};

	Ok(match width {
		Some(w) => {
			let cut: String = text.chars().take(w).collect();
			format!("{cut:<w$}")
		}
		None => text,
	})
}

fn render_nodes<'a>(nodes: &[Node], scopes: &mut Vec<&'a Value>, out: &mut String) -> Result<(), RenderError> {
	for node in nodes {
		match node {
			Node::Text(text) => out.push_str(text),
			Node::Value { path, width, digit } => {
				let value = lookup(scopes, path).ok_or_else(|| RenderError::MissingValue(path.clone()))?;
				out.push_str(&format_value(path, value, *width, *digit)?);
			}
			Node::Section { path, repeat, body } => {
				let value = lookup(scopes, path);
				if !is_truthy(value) {
					continue;
				}
				match (*repeat, value) {
					(true, Some(Value::Array(items))) => {
						for item in items {
							scopes.push(item);
							let result = render_nodes(body, scopes, out);
							scopes.pop();
							result?;
						}
					}
					(true, _) => return Err(RenderError::UnsupportedValue(path.clone())),
					(false, _) => render_nodes(body, scopes, out)?,
				}
			}
		}
	}
	Ok(())
}

fn template_file(command: Command) -> String {
	format!("{}.sip", command.as_str().to_ascii_lowercase())
}

fn load_embedded(file: &str) -> Result<Option<Template>, RenderError> {
	let Some(asset) = EmbeddedTemplates::get(file) else {
		return Ok(None);
	};
	let source = std::str::from_utf8(&asset.data).map_err(|e| RenderError::Template {
		name: file.to_string(),
		reason: e.to_string(),
	})?;
	Template::parse(file, source.trim_end_matches(['\r', '\n'])).map(Some)
}

/// Command templates plus the generic failure template.
///
/// Built once at startup and shared read-only by every session.
#[derive(Debug, Clone)]
pub struct ResponseRenderer {
	templates: HashMap<Command, Template>,
	failure: Template,
}

impl ResponseRenderer {
	/// Templates bundled into the binary.
	pub fn embedded() -> Result<Self, RenderError> {
		let mut templates = HashMap::new();
		for command in Command::ALL {
			if let Some(template) = load_embedded(&template_file(command))? {
				templates.insert(command, template);
			}
		}

		let failure = load_embedded(FAILURE_TEMPLATE)?.ok_or_else(|| RenderError::Template {
			name: FAILURE_TEMPLATE.to_string(),
			reason: "missing".to_string(),
		})?;

		Ok(Self { templates, failure })
	}

	pub fn from_sources<'a>(
		templates: impl IntoIterator<Item = (Command, &'a str)>,
		failure: &str,
	) -> Result<Self, RenderError> {
		let templates = templates
			.into_iter()
			.map(|(command, source)| Ok((command, Template::parse(&template_file(command), source)?)))
			.collect::<Result<_, RenderError>>()?;
		Ok(Self {
			templates,
			failure: Template::parse(FAILURE_TEMPLATE, failure)?,
		})
	}

	pub fn has_template(&self, command: Command) -> bool {
		self.templates.contains_key(&command)
	}

	/// Render `model` with `command`'s template.
	pub fn render(&self, command: Command, model: &Value) -> Result<String, RenderError> {
		self.templates
			.get(&command)
			.ok_or(RenderError::NoTemplate(command))?
			.render(model)
	}

	/// Generic failure body carrying `message` as the screen message.
	///
	/// Uses the command's response code, or the raw request code when unknown.
	pub fn render_failure(&self, command: Option<Command>, request_code: &str, message: &str) -> Result<String, RenderError> {
		let code = command.and_then(Command::response_code).unwrap_or(request_code);
		let model = serde_json::json!({ "code": code, "message": message });
		self.failure.render(&model)
	}
}
