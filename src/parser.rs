//! parser.rs
//!
//! Lists the functions and methods of a Python module as `TargetObject`s,
//! together with the module facts the prompt's INFO sheet is built from.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use tree_sitter::{Node, Parser, Tree};

use crate::error::ParseError;
use crate::state::{module_name_for, LineSpan, TargetObject};

thread_local! {
    static PY_PARSER: RefCell<Option<Parser>> = RefCell::new(make_python_parser());
}

fn make_python_parser() -> Option<Parser> {
    let mut p = Parser::new();
    p.set_language(&tree_sitter_python::language()).ok()?;
    Some(p)
}

fn parse_python(source: &str) -> Option<Tree> {
    PY_PARSER.with(|p| p.borrow_mut().as_mut()?.parse(source, None))
}

pub trait ObjectLister {
    /// `file` may be absolute or relative to `project_root`; the returned
    /// objects carry a project-relative `source_path`.
    fn list_objects(&self, project_root: &Path, file: &Path)
        -> Result<Vec<TargetObject>, ParseError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PythonLister;

impl ObjectLister for PythonLister {
    fn list_objects(
        &self,
        project_root: &Path,
        file: &Path,
    ) -> Result<Vec<TargetObject>, ParseError> {
        let rel = relative_to(project_root, file)?;
        if rel.extension().and_then(|e| e.to_str()) != Some("py") {
            return Err(ParseError::Unsupported(rel));
        }

        let abs = project_root.join(&rel);
        let source = fs::read_to_string(&abs).map_err(|e| ParseError::Io {
            path: abs.clone(),
            source: e,
        })?;

        let objects = list_source(&rel, &source)?;
        debug!(file = %rel.display(), objects = objects.len(), "module parsed");
        Ok(objects)
    }
}

/// Picks one object by name, optionally qualified by its class.
pub fn select(objects: Vec<TargetObject>, name: &str, class: Option<&str>) -> Option<TargetObject> {
    objects
        .into_iter()
        .find(|o| o.name == name && o.class_name.as_deref() == class)
}

/* ---------- module walk ---------- */

struct ModuleFacts {
    module: String,
    imports: Vec<String>,
    variables: Vec<String>,
    /// Top-level function name -> source.
    functions: Vec<(String, String)>,
}

pub fn list_source(rel: &Path, source: &str) -> Result<Vec<TargetObject>, ParseError> {
    let tree = parse_python(source).ok_or_else(|| ParseError::Syntax(rel.to_path_buf()))?;
    let root = tree.root_node();
    let bytes = source.as_bytes();

    let facts = collect_facts(root, bytes, module_name_for(rel));
    let mut out = Vec::new();

    let mut cursor = root.walk();
    for child in root.named_children(&mut cursor) {
        let (outer, def) = unwrap_decorated(child);
        match def.kind() {
            "function_definition" => {
                if let Some(obj) = make_object(rel, outer, def, None, bytes, &facts, None) {
                    out.push(obj);
                }
            }
            "class_definition" => {
                let Some(class_name) = field_text(def, "name", bytes) else {
                    continue;
                };
                let Some(body) = def.child_by_field_name("body") else {
                    continue;
                };

                let methods = class_methods(body);
                let init = methods
                    .iter()
                    .find(|(_, d)| field_text(*d, "name", bytes).as_deref() == Some("__init__"))
                    .and_then(|(o, _)| o.utf8_text(bytes).ok())
                    .map(str::to_owned);

                for (m_outer, m_def) in methods {
                    if let Some(obj) = make_object(
                        rel,
                        m_outer,
                        m_def,
                        Some(class_name.clone()),
                        bytes,
                        &facts,
                        init.as_deref(),
                    ) {
                        out.push(obj);
                    }
                }
            }
            _ => {}
        }
    }

    Ok(out)
}

fn collect_facts(root: Node, bytes: &[u8], module: String) -> ModuleFacts {
    let mut facts = ModuleFacts {
        module,
        imports: Vec::new(),
        variables: Vec::new(),
        functions: Vec::new(),
    };

    let mut cursor = root.walk();
    for child in root.named_children(&mut cursor) {
        let text = || child.utf8_text(bytes).ok().map(str::to_owned);
        match child.kind() {
            "import_statement" | "import_from_statement" | "future_import_statement" => {
                facts.imports.extend(text());
            }
            "expression_statement" => {
                let is_assign = child
                    .named_child(0)
                    .map(|n| matches!(n.kind(), "assignment" | "augmented_assignment"))
                    .unwrap_or(false);
                if is_assign {
                    facts.variables.extend(text());
                }
            }
            _ => {
                let (outer, def) = unwrap_decorated(child);
                if def.kind() == "function_definition" {
                    if let (Some(name), Ok(src)) =
                        (field_text(def, "name", bytes), outer.utf8_text(bytes))
                    {
                        facts.functions.push((name, src.to_owned()));
                    }
                }
            }
        }
    }

    facts
}

fn class_methods(body: Node) -> Vec<(Node, Node)> {
    let mut cursor = body.walk();
    let methods = body
        .named_children(&mut cursor)
        .map(unwrap_decorated)
        .filter(|(_, def)| def.kind() == "function_definition")
        .collect();
    methods
}

fn make_object(
    rel: &Path,
    outer: Node,
    def: Node,
    class_name: Option<String>,
    bytes: &[u8],
    facts: &ModuleFacts,
    init: Option<&str>,
) -> Option<TargetObject> {
    let name = field_text(def, "name", bytes)?;
    let source = outer.utf8_text(bytes).ok()?.to_owned();

    let mut sheet = Vec::new();
    if let (Some(cls), Some(init)) = (&class_name, init) {
        if name != "__init__" {
            sheet.push(format!("Class __init__ definition of {cls} class:\n{init}"));
        }
    }
    if !facts.imports.is_empty() {
        sheet.push(format!(
            "Following imports were made inside the {} module:\n{}",
            facts.module,
            facts.imports.join("\n")
        ));
    }
    if !facts.variables.is_empty() {
        sheet.push(format!(
            "Following variables were declared in the {} module body:\n{}",
            facts.module,
            facts.variables.join("\n")
        ));
    }
    let locals = local_calls(def, bytes, &name, facts);
    if !locals.is_empty() {
        sheet.push(format!("Local definitions:\n{}", locals.join("\n\n")));
    }

    Some(TargetObject {
        name,
        class_name,
        source_path: rel.to_path_buf(),
        span: LineSpan {
            start: outer.start_position().row as u32 + 1,
            end: outer.end_position().row as u32 + 1,
        },
        source,
        info_sheet: sheet,
    })
}

/// Module-level functions called from inside `def`.
fn local_calls(def: Node, bytes: &[u8], own_name: &str, facts: &ModuleFacts) -> Vec<String> {
    let mut called = BTreeSet::new();
    let mut stack = vec![def];
    while let Some(node) = stack.pop() {
        if node.kind() == "call" {
            if let Some(f) = node.child_by_field_name("function") {
                if f.kind() == "identifier" {
                    if let Ok(name) = f.utf8_text(bytes) {
                        called.insert(name.to_owned());
                    }
                }
            }
        }
        let mut cursor = node.walk();
        stack.extend(node.named_children(&mut cursor));
    }

    facts
        .functions
        .iter()
        .filter(|(n, _)| n != own_name && called.contains(n))
        .map(|(_, src)| src.clone())
        .collect()
}

fn unwrap_decorated(node: Node) -> (Node, Node) {
    if node.kind() == "decorated_definition" {
        if let Some(def) = node.child_by_field_name("definition") {
            return (node, def);
        }
    }
    (node, node)
}

fn field_text(node: Node, field: &str, bytes: &[u8]) -> Option<String> {
    node.child_by_field_name(field)?
        .utf8_text(bytes)
        .ok()
        .map(str::to_owned)
}

fn relative_to(project_root: &Path, file: &Path) -> Result<PathBuf, ParseError> {
    if file.is_relative() {
        if file.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(ParseError::OutsideProject { path: file.to_path_buf() });
        }
        return Ok(file.to_path_buf());
    }

    let canon = |p: &Path| {
        p.canonicalize().map_err(|e| ParseError::Io {
            path: p.to_path_buf(),
            source: e,
        })
    };
    let root = canon(project_root)?;
    let abs = canon(file)?;
    abs.strip_prefix(&root)
        .map(Path::to_path_buf)
        .map_err(|_| ParseError::OutsideProject { path: file.to_path_buf() })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODULE: &str = r#"import math
from decimal import Decimal

RATE = 0.05


def clamp(x, lo, hi):
    return max(lo, min(x, hi))


def interest(amount):
    return clamp(amount * RATE, 0, 100)


class Account:
    def __init__(self, owner):
        self.owner = owner
        self.balance = Decimal(0)

    @property
    def empty(self):
        return self.balance == 0

    def deposit(self, amount):
        if amount <= 0:
            raise ValueError("amount")
        self.balance += amount
        return self.balance
"#;

    fn objects() -> Vec<TargetObject> {
        list_source(Path::new("bank/accounts.py"), MODULE).unwrap()
    }

    #[test]
    fn lists_functions_and_methods() {
        let ids: Vec<String> = objects().iter().map(|o| o.id()).collect();
        assert_eq!(
            ids,
            vec![
                "bank/accounts.py::clamp",
                "bank/accounts.py::interest",
                "bank/accounts.py::Account.__init__",
                "bank/accounts.py::Account.empty",
                "bank/accounts.py::Account.deposit",
            ]
        );
    }

    #[test]
    fn spans_are_one_based_and_inclusive() {
        let deposit = select(objects(), "deposit", Some("Account")).unwrap();
        assert_eq!(deposit.span, LineSpan { start: 24, end: 28 });
        assert!(deposit.source.starts_with("def deposit"));

        let empty = select(objects(), "empty", Some("Account")).unwrap();
        assert!(empty.source.starts_with("@property"));
        assert_eq!(empty.span.start, 20);
    }

    #[test]
    fn info_sheet_carries_module_facts() {
        let deposit = select(objects(), "deposit", Some("Account")).unwrap();
        let sheet = deposit.info_sheet.join("\n");
        assert!(sheet.contains("Class __init__ definition of Account class"));
        assert!(sheet.contains("import math\nfrom decimal import Decimal"));
        assert!(sheet.contains("RATE = 0.05"));

        let interest = select(objects(), "interest", None).unwrap();
        let local = interest.info_sheet.last().unwrap();
        assert!(local.starts_with("Local definitions:"));
        assert!(local.contains("def clamp"));
    }

    #[test]
    fn select_needs_matching_class() {
        assert!(select(objects(), "deposit", None).is_none());
        assert!(select(objects(), "clamp", None).is_some());
    }

    #[test]
    fn lister_reads_relative_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("bank")).unwrap();
        fs::write(dir.path().join("bank/accounts.py"), MODULE).unwrap();

        let objs = PythonLister
            .list_objects(dir.path(), Path::new("bank/accounts.py"))
            .unwrap();
        assert_eq!(objs.len(), 5);
        assert_eq!(objs[0].module_name(), "bank.accounts");

        let abs = dir.path().join("bank/accounts.py");
        let objs = PythonLister.list_objects(dir.path(), &abs).unwrap();
        assert_eq!(objs[0].source_path, PathBuf::from("bank/accounts.py"));
    }

    #[test]
    fn rejects_non_python_and_escapes() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            PythonLister.list_objects(dir.path(), Path::new("lib.rs")),
            Err(ParseError::Unsupported(_))
        ));
        assert!(matches!(
            PythonLister.list_objects(dir.path(), Path::new("../x.py")),
            Err(ParseError::OutsideProject { .. })
        ));
    }
}
