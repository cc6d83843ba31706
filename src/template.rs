//! Template engines
//!
//! Rendering engines are pluggable through a process-wide factory registry
//! keyed by engine name. The registry is populated at startup and should be
//! treated as read-only once modules are being built. Contexts are plain
//! values mapped deterministically: maps expose keys, pairs expose
//! `first`/`second`, lists expose indices, scalars render directly.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;

use crate::error::{Result, RuntimeError};
use crate::value::Value;

/// One compiled template
pub trait Template: Send + Sync {
    /// Compile a source body; engine options arrive as a value and default
    /// to null
    fn compile(&mut self, name: &str, source: &str, opts: &Value) -> Result<()>;

    /// Render against a context value
    fn execute(&self, context: &Value) -> Result<String>;
}

/// Produces empty templates for one engine
pub trait TemplateFactory: Send + Sync {
    fn create(&self) -> Box<dyn Template>;
}

lazy_static! {
    static ref FACTORIES: RwLock<HashMap<String, Arc<dyn TemplateFactory>>> = {
        let mut m: HashMap<String, Arc<dyn TemplateFactory>> = HashMap::new();
        m.insert("text".to_string(), Arc::new(TextTemplateFactory));
        m.insert("static".to_string(), Arc::new(StaticTemplateFactory));
        RwLock::new(m)
    };
}

/// Register (or replace) an engine factory. Call during startup, before any
/// module referencing the engine is built.
pub fn register_template_factory(name: &str, factory: Arc<dyn TemplateFactory>) {
    FACTORIES
        .write()
        .expect("template registry lock")
        .insert(name.to_string(), factory);
}

/// Create an empty template for a registered engine
pub fn new_template(engine: &str) -> Option<Box<dyn Template>> {
    FACTORIES
        .read()
        .expect("template registry lock")
        .get(engine)
        .map(|f| f.create())
}

/// Resolve a dotted path against a context value
fn lookup_path(context: &Value, path: &str) -> Result<Value> {
    if path == "." {
        return Ok(context.clone());
    }
    let mut cur = context.clone();
    for seg in path.split('.') {
        cur = match &cur {
            Value::Map(m) => m.borrow().get(seg).ok_or_else(|| {
                RuntimeError::Template(format!("context has no key '{}'", seg))
            })?,
            Value::Pair(p) => match seg {
                "first" => p.borrow().first.clone(),
                "second" => p.borrow().second.clone(),
                _ => {
                    return Err(RuntimeError::Template(format!(
                        "pair context has no field '{}'",
                        seg
                    )))
                }
            },
            Value::List(l) => {
                let idx: usize = seg.parse().map_err(|_| {
                    RuntimeError::Template(format!("list context needs an index, got '{}'", seg))
                })?;
                l.borrow().at(idx).ok_or_else(|| {
                    RuntimeError::Template(format!("list context index {} out of range", idx))
                })?
            }
            other => {
                return Err(RuntimeError::Template(format!(
                    "cannot descend into {} with '{}'",
                    other.kind_name(),
                    seg
                )))
            }
        };
    }
    Ok(cur)
}

enum TextPiece {
    Literal(String),
    Path(String),
}

/// Substitution engine: `{{ path }}` placeholders over the context mapping
#[derive(Default)]
pub struct TextTemplate {
    pieces: Vec<TextPiece>,
}

impl Template for TextTemplate {
    fn compile(&mut self, name: &str, source: &str, _opts: &Value) -> Result<()> {
        let mut pieces = Vec::new();
        let mut rest = source;
        while let Some(open) = rest.find("{{") {
            if !rest[..open].is_empty() {
                pieces.push(TextPiece::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 2..];
            let close = after.find("}}").ok_or_else(|| {
                RuntimeError::Template(format!("template '{}': unterminated placeholder", name))
            })?;
            let path = after[..close].trim();
            if path.is_empty() {
                return Err(RuntimeError::Template(format!(
                    "template '{}': empty placeholder",
                    name
                )));
            }
            pieces.push(TextPiece::Path(path.to_string()));
            rest = &after[close + 2..];
        }
        if !rest.is_empty() {
            pieces.push(TextPiece::Literal(rest.to_string()));
        }
        self.pieces = pieces;
        Ok(())
    }

    fn execute(&self, context: &Value) -> Result<String> {
        let mut out = String::new();
        for piece in &self.pieces {
            match piece {
                TextPiece::Literal(s) => out.push_str(s),
                TextPiece::Path(p) => {
                    let v = lookup_path(context, p)?;
                    let s = v
                        .to_string_value()
                        .map_err(|e| RuntimeError::Template(e.to_string()))?;
                    out.push_str(&s);
                }
            }
        }
        Ok(out)
    }
}

struct TextTemplateFactory;

impl TemplateFactory for TextTemplateFactory {
    fn create(&self) -> Box<dyn Template> {
        Box::new(TextTemplate::default())
    }
}

/// Fixed-body engine: the compiled source renders as-is, the context is
/// ignored
#[derive(Default)]
pub struct StaticTemplate {
    body: String,
}

impl Template for StaticTemplate {
    fn compile(&mut self, _name: &str, source: &str, _opts: &Value) -> Result<()> {
        self.body = source.to_string();
        Ok(())
    }

    fn execute(&self, _context: &Value) -> Result<String> {
        Ok(self.body.clone())
    }
}

struct StaticTemplateFactory;

impl TemplateFactory for StaticTemplateFactory {
    fn create(&self) -> Box<dyn Template> {
        Box::new(StaticTemplate::default())
    }
}
