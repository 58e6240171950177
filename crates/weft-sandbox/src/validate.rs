//! Fragment validation
//!
//! Validation happens before any execution. The validating engine disables
//! `import`, `export`, and `eval` outright, so their mere presence fails
//! compilation; the compiled AST is then walked and every function-call
//! target is checked against the deny-list. A fragment rejected here has
//! invoked nothing.

use rhai::{ASTNode, Engine, Expr, Stmt};

use crate::SandboxError;

/// Names whose appearance as a call target rejects the fragment
pub const DENIED_CALLS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "import",
    "system",
    "spawn",
    "open",
    "read_file",
    "write_file",
    "remove_file",
    "rename_file",
    "connect",
    "listen",
    "getenv",
    "setenv",
    "curl",
    "fetch_url",
];

/// Symbols disabled at the parser level; using one is a compile error
pub(crate) const DISABLED_SYMBOLS: &[&str] = &["import", "export", "eval"];

pub(crate) fn apply_restrictions(engine: &mut Engine) {
    for symbol in DISABLED_SYMBOLS {
        engine.disable_symbol(*symbol);
    }
}

/// Compile and inspect a fragment without executing it
///
/// Classification: a parse failure caused by a forbidden symbol is a
/// security rejection; any other parse failure is a validation error.
pub fn validate_fragment(fragment: &str) -> Result<rhai::AST, SandboxError> {
    let mut engine = Engine::new();
    apply_restrictions(&mut engine);

    let ast = engine.compile(fragment).map_err(|e| {
        if mentions_denied_name(fragment) {
            SandboxError::Security(format!("fragment uses a forbidden construct: {e}"))
        } else {
            SandboxError::Validation(e.to_string())
        }
    })?;

    let mut violation: Option<String> = None;
    ast.walk(&mut |path| {
        let node = match path.last() {
            Some(node) => node,
            None => return true,
        };
        let name = match node {
            ASTNode::Expr(Expr::FnCall(call, _)) => Some(call.name.as_str()),
            ASTNode::Stmt(Stmt::FnCall(call, _)) => Some(call.name.as_str()),
            _ => None,
        };
        if let Some(name) = name
            && DENIED_CALLS.contains(&name)
        {
            violation = Some(name.to_string());
            return false;
        }
        true
    });

    if let Some(name) = violation {
        return Err(SandboxError::Security(format!(
            "fragment calls denied function {name}"
        )));
    }
    Ok(ast)
}

fn mentions_denied_name(fragment: &str) -> bool {
    let mut token = String::new();
    let mut tokens = Vec::new();
    for c in fragment.chars() {
        if c.is_alphanumeric() || c == '_' {
            token.push(c);
        } else if !token.is_empty() {
            tokens.push(std::mem::take(&mut token));
        }
    }
    if !token.is_empty() {
        tokens.push(token);
    }
    tokens.iter().any(|t| {
        DENIED_CALLS.contains(&t.as_str()) || DISABLED_SYMBOLS.contains(&t.as_str())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_fragment_accepted() {
        let ast = validate_fragment("let x = 1 + 2; let output = x * 3;");
        assert!(ast.is_ok());
    }

    #[test]
    fn test_import_rejected_as_security() {
        // `import` is a disabled symbol; compilation fails before any
        // execution machinery exists.
        let err = validate_fragment("import os; os.system(\"ls\")").unwrap_err();
        assert!(matches!(err, SandboxError::Security(_)));
    }

    #[test]
    fn test_eval_rejected() {
        let err = validate_fragment("eval(\"1 + 1\")").unwrap_err();
        assert!(matches!(err, SandboxError::Security(_)));
    }

    #[test]
    fn test_denied_call_rejected_by_walk() {
        let err = validate_fragment("let x = system(\"reboot\");").unwrap_err();
        assert!(matches!(err, SandboxError::Security(_)));
        assert!(err.to_string().contains("system"));
    }

    #[test]
    fn test_denied_call_in_nested_expression() {
        let err = validate_fragment("let v = [1, 2, getenv(\"PATH\")];").unwrap_err();
        assert!(matches!(err, SandboxError::Security(_)));
    }

    #[test]
    fn test_syntax_error_is_validation() {
        let err = validate_fragment("let x = ;;; nonsense ((").unwrap_err();
        assert!(matches!(err, SandboxError::Validation(_)));
    }

    #[test]
    fn test_validation_is_fast() {
        let started = std::time::Instant::now();
        let _ = validate_fragment("import os; os.system(\"ls\")");
        assert!(started.elapsed() < std::time::Duration::from_millis(50));
    }

    #[test]
    fn test_user_defined_functions_allowed() {
        let ast = validate_fragment("fn helper(x) { x + 1 }\nlet output = helper(2);");
        assert!(ast.is_ok());
    }
}
