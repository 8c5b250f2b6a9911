//! Semantic passes between parsing and IR emission.
//!
//! The closure transform makes nested procedures explicit: every
//! outer-scope variable a nested function touches is appended to its
//! prototype as a by-reference parameter, and every call site gains
//! the matching arguments. Inner functions are handled before outer
//! ones, so a function's capture set already includes whatever its
//! own nested functions lifted out of it.
//!
//! The pass is idempotent: captures are recorded on the function
//! node, prototype augmentation skips parameters that are already
//! present, and call sites that already have the full argument count
//! are left alone.

use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;

use pascal_parser::ast::{
    walk_stmt_exprs, walk_stmt_exprs_mut, Expr, ExprKind, Function, Program, ProtoRef, VarDef,
};

/// Run the closure transform over a whole program.
pub fn closure_transform(program: &mut Program) {
    let globals: HashSet<String> = program
        .globals
        .iter()
        .map(|g| g.name.to_ascii_lowercase())
        .collect();
    let top_fns: HashSet<String> = program
        .functions
        .iter()
        .map(|f| f.proto.borrow().name.to_ascii_lowercase())
        .collect();
    for f in &mut program.functions {
        transform_fn(f, &globals, &top_fns);
    }
}

/// Transform the nested functions of `f`, inner-first. `f` itself is
/// given its capture list by its own parent.
fn transform_fn(f: &mut Function, globals: &HashSet<String>, top_fns: &HashSet<String>) {
    for i in 0..f.nested.len() {
        transform_fn(&mut f.nested[i], globals, top_fns);
        compute_captures(&mut f.nested[i], globals, top_fns);

        let proto = f.nested[i].proto.clone();
        let captured = f.nested[i].captured.clone();
        if captured.is_empty() {
            continue;
        }

        {
            let mut p = proto.borrow_mut();
            for c in &captured {
                if !p.args.iter().any(|a| a.name.eq_ignore_ascii_case(&c.name)) {
                    p.args.push(VarDef::by_ref(c.name.clone(), c.ty));
                }
            }
        }

        // Call sites live in the parent's body, in siblings, and in
        // the nested function itself (recursion).
        rewrite_calls(f, &proto, &captured);
    }
}

/// The used-variables of a function body: every referenced name that
/// is neither a parameter, a local, a global, a top-level function,
/// nor the function's own result slot — unioned with the captures of
/// its nested functions.
fn compute_captures(f: &mut Function, globals: &HashSet<String>, top_fns: &HashSet<String>) {
    if !f.captured.is_empty() {
        return;
    }

    let mut known: HashSet<String> = HashSet::new();
    {
        let p = f.proto.borrow();
        known.insert(p.name.to_ascii_lowercase());
        for a in &p.args {
            known.insert(a.name.to_ascii_lowercase());
        }
    }
    for l in &f.locals {
        known.insert(l.name.to_ascii_lowercase());
    }

    let mut used: BTreeMap<String, pascal_types::TypeId> = BTreeMap::new();
    walk_stmt_exprs(&f.body, &mut |e: &Expr| {
        if let ExprKind::Variable { name } = &e.kind {
            used.entry(name.to_ascii_lowercase()).or_insert(e.ty);
        }
    });
    for n in &f.nested {
        for c in &n.captured {
            used.entry(c.name.to_ascii_lowercase()).or_insert(c.ty);
        }
    }

    for (name, ty) in used {
        if known.contains(&name) || globals.contains(&name) || top_fns.contains(&name) {
            continue;
        }
        f.captured.push(VarDef::by_ref(name, ty));
    }
}

fn rewrite_calls(f: &mut Function, proto: &ProtoRef, captured: &[VarDef]) {
    rewrite_in_stmt(&mut f.body, proto, captured);
    for n in &mut f.nested {
        rewrite_calls(n, proto, captured);
    }
}

fn rewrite_in_stmt(
    stmt: &mut pascal_parser::ast::Stmt,
    proto: &ProtoRef,
    captured: &[VarDef],
) {
    let expected = proto.borrow().args.len();
    walk_stmt_exprs_mut(stmt, &mut |e: &mut Expr| {
        if let ExprKind::Call {
            proto: Some(p),
            args,
            ..
        } = &mut e.kind
        {
            if Rc::ptr_eq(p, proto) && args.len() + captured.len() == expected {
                for c in captured {
                    args.push(Expr::new(
                        ExprKind::Variable {
                            name: c.name.clone(),
                        },
                        c.ty,
                        e.loc.clone(),
                    ));
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use pascal_parser::ast::Stmt;

    fn parse(source: &str) -> Program {
        pascal_parser::parse("test.pas", source).expect("parse").program
    }

    const NESTED: &str = "
program n;
procedure outer;
  var x: integer;
  procedure inner; begin x := x + 1 end;
begin x := 0; inner; inner; writeln(x) end;
begin outer end.
";

    fn call_arg_counts(stmt: &Stmt) -> Vec<usize> {
        let mut counts = Vec::new();
        walk_stmt_exprs(stmt, &mut |e: &Expr| {
            if let ExprKind::Call { args, proto, .. } = &e.kind {
                if proto
                    .as_ref()
                    .is_some_and(|p| p.borrow().name.eq_ignore_ascii_case("inner"))
                {
                    counts.push(args.len());
                }
            }
        });
        counts
    }

    #[test]
    fn test_nested_capture_lifted() {
        let mut program = parse(NESTED);
        closure_transform(&mut program);
        let outer = &program.functions[0];
        let inner = &outer.nested[0];
        assert_eq!(inner.captured.len(), 1);
        assert_eq!(inner.captured[0].name, "x");
        assert!(inner.captured[0].is_ref);
        let p = inner.proto.borrow();
        assert_eq!(p.args.len(), 1);
        assert!(p.args[0].is_ref);
        // Both call sites in outer pass the variable along.
        assert_eq!(call_arg_counts(&outer.body), vec![1, 1]);
    }

    #[test]
    fn test_transform_is_idempotent() {
        let mut program = parse(NESTED);
        closure_transform(&mut program);
        closure_transform(&mut program);
        let outer = &program.functions[0];
        let inner = &outer.nested[0];
        assert_eq!(inner.proto.borrow().args.len(), 1);
        assert_eq!(call_arg_counts(&outer.body), vec![1, 1]);
    }

    #[test]
    fn test_globals_are_not_captured() {
        let mut program = parse(
            "
program g;
var total: integer;
procedure bump;
  procedure inner; begin total := total + 1 end;
begin inner end;
begin bump end.
",
        );
        closure_transform(&mut program);
        let bump = &program.functions[0];
        assert!(bump.nested[0].captured.is_empty());
        assert!(bump.captured.is_empty());
    }

    #[test]
    fn test_two_level_capture_propagates() {
        let mut program = parse(
            "
program deep;
procedure outer;
  var x: integer;
  procedure mid;
    procedure inner; begin x := x + 1 end;
  begin inner end;
begin x := 0; mid; writeln(x) end;
begin outer end.
",
        );
        closure_transform(&mut program);
        let outer = &program.functions[0];
        let mid = &outer.nested[0];
        let inner = &mid.nested[0];
        // inner captures x, and mid captures it transitively.
        assert_eq!(inner.captured.len(), 1);
        assert_eq!(mid.captured.len(), 1);
        assert_eq!(mid.captured[0].name, "x");
        assert_eq!(mid.proto.borrow().args.len(), 1);
    }
}
