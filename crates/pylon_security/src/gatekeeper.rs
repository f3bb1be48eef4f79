//! Gatekeeper: static analysis for submitted Python code.
//!
//! Validates source with a host-side AST pass before it ever reaches a
//! worker:
//! - syntax errors are reported with line/column and cost no pool borrow
//! - imports outside the active security mode's whitelist are rejected
//! - dynamic import spellings (`__import__`, `importlib.import_module`)
//!   are caught at the call sites the parser can see
//!
//! The worker enforces the same policy at runtime through its restricted
//! importer; the gatekeeper exists so obvious violations fail fast.

use pylon_protocol::SecurityMode;
use rustpython_parser::{ast, Parse};
use std::collections::HashSet;

/// Modules importable in RESTRICTED mode: pure/stateless stdlib only.
/// Must match SAFE_MODULES in pylon_bridge.py.
pub const SAFE_MODULES: &[&str] = &[
    "math",
    "json",
    "datetime",
    "itertools",
    "collections",
    "decimal",
    "random",
    "re",
    "string",
    "functools",
    "statistics",
    "textwrap",
    "time",
    "uuid",
];

/// Additional modules importable in ADMIN mode.
/// Must match ADMIN_MODULES in pylon_bridge.py.
pub const ADMIN_MODULES: &[&str] = &[
    "os",
    "subprocess",
    "sys",
    "pathlib",
    "shutil",
    "glob",
    "csv",
    "io",
    "socket",
    "urllib",
    "base64",
    "hashlib",
    "pandas",
    "numpy",
];

/// Modules never permitted, regardless of mode.
/// Must match BLOCKED_MODULES in pylon_bridge.py.
pub const BLOCKED_MODULES: &[&str] = &[
    "ctypes",
    "multiprocessing",
    "threading",
    "telnetlib",
    "paramiko",
    "pty",
    "tty",
];

/// A syntax problem with its source position (1-based line, 0-based column).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxIssue {
    pub message: String,
    pub line: u32,
    pub column: u32,
}

/// Whether `module` (or its top-level package) may be imported under `mode`.
pub fn is_module_allowed(module: &str, mode: SecurityMode) -> bool {
    let base = module.split('.').next().unwrap_or(module);
    if BLOCKED_MODULES.contains(&base) {
        return false;
    }
    match mode {
        SecurityMode::Restricted => SAFE_MODULES.contains(&base),
        SecurityMode::Admin => SAFE_MODULES.contains(&base) || ADMIN_MODULES.contains(&base),
    }
}

/// Gatekeeper validates Python source before dispatch.
pub struct Gatekeeper {
    safe: HashSet<&'static str>,
    admin: HashSet<&'static str>,
    blocked: HashSet<&'static str>,
}

impl Default for Gatekeeper {
    fn default() -> Self {
        Self::new()
    }
}

impl Gatekeeper {
    pub fn new() -> Self {
        Self {
            safe: SAFE_MODULES.iter().copied().collect(),
            admin: ADMIN_MODULES.iter().copied().collect(),
            blocked: BLOCKED_MODULES.iter().copied().collect(),
        }
    }

    /// Parse-only syntax validation.
    pub fn check_syntax(&self, source: &str) -> Result<(), SyntaxIssue> {
        match ast::Suite::parse(source, "<submitted>") {
            Ok(_) => Ok(()),
            Err(err) => Err(syntax_issue_from_parse_error(source, &err)),
        }
    }

    /// Parse and return the modules whose import would be refused under
    /// `mode`. An unparseable source is reported as a syntax issue instead.
    pub fn blocked_imports(
        &self,
        source: &str,
        mode: SecurityMode,
    ) -> Result<Vec<String>, SyntaxIssue> {
        let suite = ast::Suite::parse(source, "<submitted>")
            .map_err(|err| syntax_issue_from_parse_error(source, &err))?;

        let mut scan = ImportScan {
            gatekeeper: self,
            mode,
            blocked: Vec::new(),
            seen: HashSet::new(),
        };
        for stmt in &suite {
            scan.visit_stmt(stmt);
        }
        Ok(scan.blocked)
    }

    fn allowed(&self, module: &str, mode: SecurityMode) -> bool {
        let base = module.split('.').next().unwrap_or(module);
        if self.blocked.contains(base) {
            return false;
        }
        match mode {
            SecurityMode::Restricted => self.safe.contains(base),
            SecurityMode::Admin => self.safe.contains(base) || self.admin.contains(base),
        }
    }
}

fn syntax_issue_from_parse_error(source: &str, err: &rustpython_parser::ParseError) -> SyntaxIssue {
    let offset = err.offset.to_usize().min(source.len());
    let prefix = &source[..offset];
    let line = prefix.matches('\n').count() as u32 + 1;
    let column = prefix
        .rsplit('\n')
        .next()
        .map(|tail| tail.chars().count() as u32)
        .unwrap_or(0);
    SyntaxIssue {
        message: err.error.to_string(),
        line,
        column,
    }
}

/// Statement walker collecting refused imports. Recurses into every nested
/// statement body; dynamic imports are checked at the call expressions the
/// statement grammar exposes directly.
struct ImportScan<'a> {
    gatekeeper: &'a Gatekeeper,
    mode: SecurityMode,
    blocked: Vec<String>,
    seen: HashSet<String>,
}

impl<'a> ImportScan<'a> {
    fn refuse(&mut self, module: &str) {
        if self.seen.insert(module.to_string()) {
            self.blocked.push(module.to_string());
        }
    }

    fn check_module(&mut self, module: &str) {
        if !self.gatekeeper.allowed(module, self.mode) {
            self.refuse(module);
        }
    }

    fn visit_stmt(&mut self, stmt: &ast::Stmt) {
        match stmt {
            ast::Stmt::Import(node) => {
                for alias in &node.names {
                    self.check_module(alias.name.as_str());
                }
            }
            ast::Stmt::ImportFrom(node) => {
                if let Some(module) = &node.module {
                    self.check_module(module.as_str());
                }
            }
            ast::Stmt::FunctionDef(node) => self.visit_body(&node.body),
            ast::Stmt::AsyncFunctionDef(node) => self.visit_body(&node.body),
            ast::Stmt::ClassDef(node) => self.visit_body(&node.body),
            ast::Stmt::For(node) => {
                self.visit_body(&node.body);
                self.visit_body(&node.orelse);
            }
            ast::Stmt::AsyncFor(node) => {
                self.visit_body(&node.body);
                self.visit_body(&node.orelse);
            }
            ast::Stmt::While(node) => {
                self.visit_body(&node.body);
                self.visit_body(&node.orelse);
            }
            ast::Stmt::If(node) => {
                self.visit_body(&node.body);
                self.visit_body(&node.orelse);
            }
            ast::Stmt::With(node) => self.visit_body(&node.body),
            ast::Stmt::AsyncWith(node) => self.visit_body(&node.body),
            ast::Stmt::Try(node) => {
                self.visit_body(&node.body);
                for handler in &node.handlers {
                    let ast::ExceptHandler::ExceptHandler(h) = handler;
                    self.visit_body(&h.body);
                }
                self.visit_body(&node.orelse);
                self.visit_body(&node.finalbody);
            }
            ast::Stmt::Expr(node) => self.visit_expr(&node.value),
            ast::Stmt::Assign(node) => self.visit_expr(&node.value),
            ast::Stmt::AugAssign(node) => self.visit_expr(&node.value),
            ast::Stmt::AnnAssign(node) => {
                if let Some(value) = &node.value {
                    self.visit_expr(value);
                }
            }
            ast::Stmt::Return(node) => {
                if let Some(value) = &node.value {
                    self.visit_expr(value);
                }
            }
            _ => {}
        }
    }

    fn visit_body(&mut self, body: &[ast::Stmt]) {
        for stmt in body {
            self.visit_stmt(stmt);
        }
    }

    fn visit_expr(&mut self, expr: &ast::Expr) {
        if let ast::Expr::Call(call) = expr {
            if let Some(name) = dynamic_import_target(call) {
                self.check_module(&name);
            }
            for arg in &call.args {
                self.visit_expr(arg);
            }
        }
    }
}

/// If `call` is a recognizable dynamic import, return the imported module
/// name (or the spelling itself when the argument is not a literal).
fn dynamic_import_target(call: &ast::ExprCall) -> Option<String> {
    let is_dynamic_import = match call.func.as_ref() {
        ast::Expr::Name(name) => name.id.as_str() == "__import__",
        ast::Expr::Attribute(attr) => {
            attr.attr.as_str() == "import_module"
                && matches!(
                    attr.value.as_ref(),
                    ast::Expr::Name(value) if value.id.as_str() == "importlib"
                )
        }
        _ => false,
    };
    if !is_dynamic_import {
        return None;
    }
    match call.args.first() {
        Some(ast::Expr::Constant(constant)) => match &constant.value {
            ast::Constant::Str(s) => Some(s.to_string()),
            _ => Some("__import__".to_string()),
        },
        _ => Some("__import__".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_code_passes() {
        let gatekeeper = Gatekeeper::new();
        let code = r#"
import math
import json

def area(r):
    return math.pi * r ** 2

result = json.dumps({"area": area(2)})
"#;
        assert!(gatekeeper.check_syntax(code).is_ok());
        assert!(gatekeeper
            .blocked_imports(code, SecurityMode::Restricted)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_os_blocked_in_restricted_allowed_in_admin() {
        let gatekeeper = Gatekeeper::new();
        let code = "import os\nresult = os.getcwd()";
        let blocked = gatekeeper
            .blocked_imports(code, SecurityMode::Restricted)
            .unwrap();
        assert_eq!(blocked, vec!["os".to_string()]);
        assert!(gatekeeper
            .blocked_imports(code, SecurityMode::Admin)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_always_blocked_in_both_modes() {
        let gatekeeper = Gatekeeper::new();
        for module in ["ctypes", "multiprocessing", "threading", "pty"] {
            let code = format!("import {}", module);
            for mode in [SecurityMode::Restricted, SecurityMode::Admin] {
                let blocked = gatekeeper.blocked_imports(&code, mode).unwrap();
                assert_eq!(blocked, vec![module.to_string()], "mode {mode}");
            }
        }
    }

    #[test]
    fn test_nested_import_found() {
        let gatekeeper = Gatekeeper::new();
        let code = r#"
def run():
    import subprocess
    return subprocess.run(["ls"])
"#;
        let blocked = gatekeeper
            .blocked_imports(code, SecurityMode::Restricted)
            .unwrap();
        assert_eq!(blocked, vec!["subprocess".to_string()]);
    }

    #[test]
    fn test_from_import_and_submodule() {
        let gatekeeper = Gatekeeper::new();
        let blocked = gatekeeper
            .blocked_imports("from os.path import join", SecurityMode::Restricted)
            .unwrap();
        assert_eq!(blocked, vec!["os.path".to_string()]);
    }

    #[test]
    fn test_dynamic_import_literal() {
        let gatekeeper = Gatekeeper::new();
        let blocked = gatekeeper
            .blocked_imports("x = __import__(\"os\")", SecurityMode::Restricted)
            .unwrap();
        assert_eq!(blocked, vec!["os".to_string()]);
    }

    #[test]
    fn test_dynamic_importlib() {
        let gatekeeper = Gatekeeper::new();
        let blocked = gatekeeper
            .blocked_imports(
                "import importlib\nm = importlib.import_module(\"socket\")",
                SecurityMode::Restricted,
            )
            .unwrap();
        // importlib itself is off the whitelist too.
        assert!(blocked.contains(&"importlib".to_string()));
        assert!(blocked.contains(&"socket".to_string()));
    }

    #[test]
    fn test_dynamic_import_non_literal_flagged() {
        let gatekeeper = Gatekeeper::new();
        let blocked = gatekeeper
            .blocked_imports("name = \"os\"\nx = __import__(name)", SecurityMode::Restricted)
            .unwrap();
        assert_eq!(blocked, vec!["__import__".to_string()]);
    }

    #[test]
    fn test_syntax_error_position() {
        let gatekeeper = Gatekeeper::new();
        let issue = gatekeeper
            .check_syntax("x = 1\ndef broken(:\n    pass")
            .unwrap_err();
        assert_eq!(issue.line, 2);
        assert!(!issue.message.is_empty());
    }

    #[test]
    fn test_duplicate_imports_reported_once() {
        let gatekeeper = Gatekeeper::new();
        let blocked = gatekeeper
            .blocked_imports("import os\nimport os", SecurityMode::Restricted)
            .unwrap();
        assert_eq!(blocked.len(), 1);
    }

    #[test]
    fn test_is_module_allowed() {
        assert!(is_module_allowed("math", SecurityMode::Restricted));
        assert!(is_module_allowed("collections.abc", SecurityMode::Restricted));
        assert!(!is_module_allowed("os", SecurityMode::Restricted));
        assert!(is_module_allowed("os", SecurityMode::Admin));
        assert!(!is_module_allowed("ctypes", SecurityMode::Admin));
    }
}
