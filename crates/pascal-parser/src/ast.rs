//! AST node types for the Pascal compiler.
//!
//! Nodes are tagged enums, not a class hierarchy; consumers match on
//! the kind. Every expression carries its `Location` and the `TypeId`
//! the parser computed for it. Prototypes are shared `Rc<RefCell<..>>`
//! values because the closure transform appends parameters after
//! parsing, and the change must be visible to the function definition,
//! the symbol table and every call site at once.

use std::cell::RefCell;
use std::rc::Rc;

use pascal_lexer::{Location, TokenKind};
use pascal_types::TypeId;

pub type ProtoRef = Rc<RefCell<Prototype>>;

/// A declared variable: parameter, local, global or lifted capture.
#[derive(Debug, Clone)]
pub struct VarDef {
    pub name: String,
    pub ty: TypeId,
    /// `var` parameter or closure capture: the storage is a pointer
    /// to the caller's variable.
    pub is_ref: bool,
}

impl VarDef {
    pub fn new(name: impl Into<String>, ty: TypeId) -> Self {
        VarDef {
            name: name.into(),
            ty,
            is_ref: false,
        }
    }

    pub fn by_ref(name: impl Into<String>, ty: TypeId) -> Self {
        VarDef {
            name: name.into(),
            ty,
            is_ref: true,
        }
    }
}

/// A function or procedure header.
#[derive(Debug, Clone)]
pub struct Prototype {
    pub name: String,
    pub args: Vec<VarDef>,
    /// Void for procedures.
    pub ret: TypeId,
    pub is_forward: bool,
    /// True for class methods: args[0] is the implicit `self`.
    pub has_self: bool,
    /// The class a method belongs to.
    pub base_class: Option<TypeId>,
}

impl Prototype {
    pub fn new(name: impl Into<String>, args: Vec<VarDef>, ret: TypeId) -> Self {
        Prototype {
            name: name.into(),
            args,
            ret,
            is_forward: false,
            has_self: false,
            base_class: None,
        }
    }
}

/// A function definition: header, local declarations, body, and the
/// functions nested inside it. `captured` is filled by the closure
/// transform with the outer-scope variables lifted to by-reference
/// parameters.
#[derive(Debug)]
pub struct Function {
    pub proto: ProtoRef,
    pub locals: Vec<VarDef>,
    pub body: Stmt,
    pub nested: Vec<Function>,
    pub captured: Vec<VarDef>,
    pub loc: Location,
}

/// A whole parsed program. The program body is the last function,
/// named `__PascalMain`.
#[derive(Debug)]
pub struct Program {
    pub name: String,
    pub globals: Vec<VarDef>,
    pub functions: Vec<Function>,
}

// ═══════════════════════════════════════════════════════════════
// Expressions
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: TypeId,
    pub loc: Location,
}

impl Expr {
    pub fn new(kind: ExprKind, ty: TypeId, loc: Location) -> Self {
        Expr { kind, ty, loc }
    }

    /// Does this expression denote a storage location?
    pub fn is_addressable(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Variable { .. }
                | ExprKind::ArrayIndex { .. }
                | ExprKind::Field { .. }
                | ExprKind::Deref { .. }
                | ExprKind::FileBuffer { .. }
        )
    }
}

/// How a field selection resolves against its base type.
#[derive(Debug, Clone)]
pub enum FieldSel {
    /// Plain record field by declaration index.
    Record { index: usize },
    /// Field inside a record's variant part: alternative index plus
    /// field index within the alternative's anonymous record.
    Variant { alt: usize, index: usize },
    /// Object field; the offset accounts for inheritance and the
    /// vtable pointer, so it is resolved by name against the class.
    Class { name: String },
}

/// Which method a call dispatches to.
#[derive(Debug, Clone)]
pub struct MethodSel {
    pub class: TypeId,
    pub name: String,
    /// Vtable slot for virtual dispatch; None for direct calls.
    pub vtable_index: Option<usize>,
    pub is_static: bool,
}

/// One element of a set constructor: a value or a `low..high` range.
#[derive(Debug, Clone)]
pub struct SetElement {
    pub low: Expr,
    pub high: Option<Expr>,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    // Literals
    IntLit(i64),
    RealLit(f64),
    CharLit(u8),
    StringLit(String),
    NilLit,

    /// A named variable (local, parameter, global, lifted capture, or
    /// the function-result slot).
    Variable { name: String },

    /// Indexing with one expression per declared dimension.
    ArrayIndex { base: Box<Expr>, indices: Vec<Expr> },

    /// Record/variant/object field selection.
    Field { base: Box<Expr>, sel: FieldSel },

    /// Pointer dereference `p^`.
    Deref { base: Box<Expr> },

    /// File buffer variable `f^`: the current element of the file.
    FileBuffer { base: Box<Expr> },

    /// A named function used as a callee or function value.
    FunctionRef { name: String, proto: ProtoRef },

    /// Method selection `obj.m`, only valid as a callee.
    Method { base: Box<Expr>, sel: MethodSel },

    /// Set constructor `[a, b, lo..hi]`.
    SetLit { elements: Vec<SetElement> },

    Binary {
        op: TokenKind,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: TokenKind,
        operand: Box<Expr>,
    },

    /// A call through a named function, method, or function value.
    /// `proto` is present for direct calls and drives argument
    /// checking and the closure-capture rewrite.
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        proto: Option<ProtoRef>,
    },

    /// A call to a compiler builtin; emission is specialized per
    /// builtin rather than going through a prototype.
    BuiltinCall { builtin: Builtin, args: Vec<Expr> },

    /// `sizeof(expr | type)`, resolved to the measured type.
    SizeOf(TypeId),
}

/// The builtin registry tag. Lookup is case-insensitive; validation
/// and result typing live in the parser, emission in the code
/// generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Abs,
    Sqr,
    Odd,
    Sqrt,
    Sin,
    Cos,
    Arctan,
    Ln,
    Exp,
    Trunc,
    Round,
    Ord,
    Chr,
    Succ,
    Pred,
    Length,
    New,
    Dispose,
    Assign,
    Reset,
    Rewrite,
    Close,
    Eof,
    Eoln,
    Inc,
    Dec,
}

impl Builtin {
    pub fn lookup(name: &str) -> Option<Builtin> {
        use Builtin::*;
        let b = match name.to_ascii_lowercase().as_str() {
            "abs" => Abs,
            "sqr" => Sqr,
            "odd" => Odd,
            "sqrt" => Sqrt,
            "sin" => Sin,
            "cos" => Cos,
            "arctan" => Arctan,
            "ln" => Ln,
            "exp" => Exp,
            "trunc" => Trunc,
            "round" => Round,
            "ord" => Ord,
            "chr" => Chr,
            "succ" => Succ,
            "pred" => Pred,
            "length" => Length,
            "new" => New,
            "dispose" => Dispose,
            "assign" => Assign,
            "reset" => Reset,
            "rewrite" => Rewrite,
            "close" => Close,
            "eof" => Eof,
            "eoln" => Eoln,
            "inc" => Inc,
            "dec" => Dec,
            _ => return None,
        };
        Some(b)
    }
}

// ═══════════════════════════════════════════════════════════════
// Statements
// ═══════════════════════════════════════════════════════════════

/// One `write`/`writeln` argument with optional `:width` and
/// `:width:precision` format expressions.
#[derive(Debug, Clone)]
pub struct WriteArg {
    pub expr: Expr,
    pub width: Option<Expr>,
    pub precision: Option<Expr>,
}

/// One branch of a `case`: the folded ordinal labels and the body.
#[derive(Debug)]
pub struct CaseBranch {
    pub labels: Vec<i64>,
    pub body: Stmt,
}

#[derive(Debug)]
pub enum Stmt {
    Empty,
    Block(Vec<Stmt>),
    Assign {
        lhs: Expr,
        rhs: Expr,
    },
    /// Expression statement: a procedure or builtin call.
    Call(Expr),
    If {
        cond: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },
    For {
        var: String,
        start: Expr,
        end: Expr,
        down: bool,
        body: Box<Stmt>,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
    },
    Repeat {
        body: Vec<Stmt>,
        cond: Expr,
    },
    Case {
        selector: Expr,
        branches: Vec<CaseBranch>,
        otherwise: Option<Box<Stmt>>,
    },
    /// `with` scope: field names were already rebound during parsing,
    /// so only the body remains.
    With {
        body: Box<Stmt>,
    },
    Write {
        file: Option<Expr>,
        args: Vec<WriteArg>,
        newline: bool,
    },
    Read {
        file: Option<Expr>,
        args: Vec<Expr>,
        newline: bool,
    },
}

// ═══════════════════════════════════════════════════════════════
// Walkers
// ═══════════════════════════════════════════════════════════════

/// Apply `f` to every expression node in the tree, children first.
pub fn walk_expr<F: FnMut(&Expr)>(expr: &Expr, f: &mut F) {
    match &expr.kind {
        ExprKind::ArrayIndex { base, indices } => {
            walk_expr(base, f);
            for i in indices {
                walk_expr(i, f);
            }
        }
        ExprKind::Field { base, .. }
        | ExprKind::Deref { base }
        | ExprKind::FileBuffer { base }
        | ExprKind::Method { base, .. } => walk_expr(base, f),
        ExprKind::SetLit { elements } => {
            for e in elements {
                walk_expr(&e.low, f);
                if let Some(h) = &e.high {
                    walk_expr(h, f);
                }
            }
        }
        ExprKind::Binary { lhs, rhs, .. } => {
            walk_expr(lhs, f);
            walk_expr(rhs, f);
        }
        ExprKind::Unary { operand, .. } => walk_expr(operand, f),
        ExprKind::Call { callee, args, .. } => {
            walk_expr(callee, f);
            for a in args {
                walk_expr(a, f);
            }
        }
        ExprKind::BuiltinCall { args, .. } => {
            for a in args {
                walk_expr(a, f);
            }
        }
        _ => {}
    }
    f(expr);
}

/// Mutable counterpart of `walk_expr`, children first so `f` may
/// rewrite a node after its children were visited.
pub fn walk_expr_mut<F: FnMut(&mut Expr)>(expr: &mut Expr, f: &mut F) {
    match &mut expr.kind {
        ExprKind::ArrayIndex { base, indices } => {
            walk_expr_mut(base, f);
            for i in indices {
                walk_expr_mut(i, f);
            }
        }
        ExprKind::Field { base, .. }
        | ExprKind::Deref { base }
        | ExprKind::FileBuffer { base }
        | ExprKind::Method { base, .. } => walk_expr_mut(base, f),
        ExprKind::SetLit { elements } => {
            for e in elements {
                walk_expr_mut(&mut e.low, f);
                if let Some(h) = &mut e.high {
                    walk_expr_mut(h, f);
                }
            }
        }
        ExprKind::Binary { lhs, rhs, .. } => {
            walk_expr_mut(lhs, f);
            walk_expr_mut(rhs, f);
        }
        ExprKind::Unary { operand, .. } => walk_expr_mut(operand, f),
        ExprKind::Call { callee, args, .. } => {
            walk_expr_mut(callee, f);
            for a in args {
                walk_expr_mut(a, f);
            }
        }
        ExprKind::BuiltinCall { args, .. } => {
            for a in args {
                walk_expr_mut(a, f);
            }
        }
        _ => {}
    }
    f(expr);
}

/// Apply `f` to every expression under a statement.
pub fn walk_stmt_exprs<F: FnMut(&Expr)>(stmt: &Stmt, f: &mut F) {
    match stmt {
        Stmt::Empty => {}
        Stmt::Block(stmts) => {
            for s in stmts {
                walk_stmt_exprs(s, f);
            }
        }
        Stmt::Assign { lhs, rhs } => {
            walk_expr(lhs, f);
            walk_expr(rhs, f);
        }
        Stmt::Call(e) => walk_expr(e, f),
        Stmt::If {
            cond,
            then_branch,
            else_branch,
        } => {
            walk_expr(cond, f);
            walk_stmt_exprs(then_branch, f);
            if let Some(e) = else_branch {
                walk_stmt_exprs(e, f);
            }
        }
        Stmt::For {
            start, end, body, ..
        } => {
            walk_expr(start, f);
            walk_expr(end, f);
            walk_stmt_exprs(body, f);
        }
        Stmt::While { cond, body } => {
            walk_expr(cond, f);
            walk_stmt_exprs(body, f);
        }
        Stmt::Repeat { body, cond } => {
            for s in body {
                walk_stmt_exprs(s, f);
            }
            walk_expr(cond, f);
        }
        Stmt::Case {
            selector,
            branches,
            otherwise,
        } => {
            walk_expr(selector, f);
            for b in branches {
                walk_stmt_exprs(&b.body, f);
            }
            if let Some(o) = otherwise {
                walk_stmt_exprs(o, f);
            }
        }
        Stmt::With { body } => walk_stmt_exprs(body, f),
        Stmt::Write { file, args, .. } => {
            if let Some(e) = file {
                walk_expr(e, f);
            }
            for a in args {
                walk_expr(&a.expr, f);
                if let Some(w) = &a.width {
                    walk_expr(w, f);
                }
                if let Some(p) = &a.precision {
                    walk_expr(p, f);
                }
            }
        }
        Stmt::Read { file, args, .. } => {
            if let Some(e) = file {
                walk_expr(e, f);
            }
            for a in args {
                walk_expr(a, f);
            }
        }
    }
}

/// Mutable counterpart of `walk_stmt_exprs`.
pub fn walk_stmt_exprs_mut<F: FnMut(&mut Expr)>(stmt: &mut Stmt, f: &mut F) {
    match stmt {
        Stmt::Empty => {}
        Stmt::Block(stmts) => {
            for s in stmts {
                walk_stmt_exprs_mut(s, f);
            }
        }
        Stmt::Assign { lhs, rhs } => {
            walk_expr_mut(lhs, f);
            walk_expr_mut(rhs, f);
        }
        Stmt::Call(e) => walk_expr_mut(e, f),
        Stmt::If {
            cond,
            then_branch,
            else_branch,
        } => {
            walk_expr_mut(cond, f);
            walk_stmt_exprs_mut(then_branch, f);
            if let Some(e) = else_branch {
                walk_stmt_exprs_mut(e, f);
            }
        }
        Stmt::For {
            start, end, body, ..
        } => {
            walk_expr_mut(start, f);
            walk_expr_mut(end, f);
            walk_stmt_exprs_mut(body, f);
        }
        Stmt::While { cond, body } => {
            walk_expr_mut(cond, f);
            walk_stmt_exprs_mut(body, f);
        }
        Stmt::Repeat { body, cond } => {
            for s in body {
                walk_stmt_exprs_mut(s, f);
            }
            walk_expr_mut(cond, f);
        }
        Stmt::Case {
            selector,
            branches,
            otherwise,
        } => {
            walk_expr_mut(selector, f);
            for b in branches {
                walk_stmt_exprs_mut(&mut b.body, f);
            }
            if let Some(o) = otherwise {
                walk_stmt_exprs_mut(o, f);
            }
        }
        Stmt::With { body } => walk_stmt_exprs_mut(body, f),
        Stmt::Write { file, args, .. } => {
            if let Some(e) = file {
                walk_expr_mut(e, f);
            }
            for a in args {
                walk_expr_mut(&mut a.expr, f);
                if let Some(w) = &mut a.width {
                    walk_expr_mut(w, f);
                }
                if let Some(p) = &mut a.precision {
                    walk_expr_mut(p, f);
                }
            }
        }
        Stmt::Read { file, args, .. } => {
            if let Some(e) = file {
                walk_expr_mut(e, f);
            }
            for a in args {
                walk_expr_mut(a, f);
            }
        }
    }
}
