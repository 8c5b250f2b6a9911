//! Recursive descent parser for Pascal.
//!
//! Drives the lexer with a one-token lookahead, the scoped symbol
//! table, and the type arena. Declarations are resolved as they are
//! parsed: identifiers in expressions are looked up immediately, so
//! every AST node leaves the parser carrying its computed type.
//!
//! Error model: each diagnostic is printed with its `file:line`
//! position and counted; a failed parse function returns an error the
//! caller propagates. Statement lists resynchronize at `;`/`end` so
//! one bad statement does not hide the rest of a block; a non-zero
//! final count fails the compilation.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use pascal_lexer::{Lexer, Location, Token, TokenKind};
use pascal_types::{
    Field, FuncSig, MemberFunc, Param, PtrTarget, Type, TypeArena, TypeId, TypeKind, VtableSlot,
    MAX_SET_SIZE, MAX_STRING_CAPACITY,
};

use crate::ast::*;
use crate::consteval::{self, ConstValue};
use crate::scope::{ScopeStack, SymbolEntry};

#[derive(Debug, Clone)]
pub struct ParseError {
    pub msg: String,
    pub loc: Location,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.loc, self.msg)
    }
}

impl std::error::Error for ParseError {}

/// Everything one compilation produces from source text: the parsed
/// program and the type arena its nodes point into.
pub struct CompileUnit {
    pub program: Program,
    pub arena: TypeArena,
}

/// Convenience entry point: lex and parse one source file.
pub fn parse(file: &str, source: &str) -> Result<CompileUnit, ParseError> {
    let mut parser = Parser::new(file, source)?;
    parser.parse_program()
}

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    cur: Token,
    ahead: Token,
    arena: TypeArena,
    names: ScopeStack<SymbolEntry>,
    errors: u32,
    /// Enclosing function names and result types, innermost last;
    /// assignment to the innermost name sets the function result.
    func_stack: Vec<(String, TypeId)>,
    /// Set while parsing a method body: unqualified members resolve
    /// against this class through `self`.
    current_class: Option<TypeId>,
}

impl<'a> Parser<'a> {
    pub fn new(file: &str, source: &'a str) -> Result<Self, ParseError> {
        let mut lexer = Lexer::new(file, source);
        let cur = lexer.next_token().map_err(|e| ParseError {
            msg: e.msg,
            loc: e.loc,
        })?;
        let ahead = lexer.next_token().map_err(|e| ParseError {
            msg: e.msg,
            loc: e.loc,
        })?;
        let mut parser = Parser {
            lexer,
            cur,
            ahead,
            arena: TypeArena::new(),
            names: ScopeStack::new(),
            errors: 0,
            func_stack: Vec::new(),
            current_class: None,
        };
        parser.install_predefined();
        Ok(parser)
    }

    /// Predefined identifiers: the primitive type names, the boolean
    /// constants, `maxint`, and the standard text files.
    fn install_predefined(&mut self) {
        let a = &self.arena;
        let defs: [(&str, TypeId); 7] = [
            ("integer", a.integer),
            ("int64", a.int64),
            ("longint", a.int64),
            ("real", a.real),
            ("char", a.char),
            ("boolean", a.boolean),
            ("text", a.text),
        ];
        for (name, ty) in defs {
            self.names.add(name, SymbolEntry::TypeDef { ty });
        }
        self.names
            .add("true", SymbolEntry::ConstDef(ConstValue::Bool(true)));
        self.names
            .add("false", SymbolEntry::ConstDef(ConstValue::Bool(false)));
        self.names.add(
            "maxint",
            SymbolEntry::ConstDef(ConstValue::Int(i32::MAX as i64)),
        );
        let text = self.arena.text;
        self.names
            .add("input", SymbolEntry::VarDef(VarDef::new("input", text)));
        self.names
            .add("output", SymbolEntry::VarDef(VarDef::new("output", text)));
    }

    // ───────────────────────────────────────────────────────────
    // Token plumbing
    // ───────────────────────────────────────────────────────────

    fn loc(&self) -> Location {
        self.cur.loc.clone()
    }

    /// Cloned symbol lookup, so match arms are free to keep parsing.
    fn lookup(&self, name: &str) -> Option<SymbolEntry> {
        self.names.find(name).cloned()
    }

    /// Consume the current token, returning it.
    fn advance(&mut self) -> Result<Token, ParseError> {
        let next = match self.lexer.next_token() {
            Ok(t) => t,
            Err(e) => {
                return Err(self.error_at(e.loc, e.msg));
            }
        };
        let prev = std::mem::replace(&mut self.cur, std::mem::replace(&mut self.ahead, next));
        Ok(prev)
    }

    fn at(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.cur.kind) == std::mem::discriminant(kind)
    }

    fn peek_is(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.ahead.kind) == std::mem::discriminant(kind)
    }

    /// Consume the current token if it matches.
    fn eat(&mut self, kind: &TokenKind) -> Result<bool, ParseError> {
        if self.at(kind) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<Token, ParseError> {
        if self.at(kind) {
            self.advance()
        } else {
            Err(self.error(format!("expected '{}', found '{}'", kind, self.cur.kind)))
        }
    }

    fn expect_ident(&mut self) -> Result<String, ParseError> {
        match &self.cur.kind {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance()?;
                Ok(name)
            }
            other => Err(self.error(format!("expected identifier, found '{}'", other))),
        }
    }

    /// Build, print and count a diagnostic at the current position.
    fn error(&mut self, msg: impl Into<String>) -> ParseError {
        let loc = self.loc();
        self.error_at(loc, msg)
    }

    fn error_at(&mut self, loc: Location, msg: impl Into<String>) -> ParseError {
        let err = ParseError {
            msg: msg.into(),
            loc,
        };
        eprintln!("{}", err);
        self.errors += 1;
        err
    }

    // ───────────────────────────────────────────────────────────
    // Program structure
    // ───────────────────────────────────────────────────────────

    pub fn parse_program(&mut self) -> Result<CompileUnit, ParseError> {
        self.expect(&TokenKind::Program)?;
        let name = self.expect_ident()?;
        // Optional program parameter list, e.g. (input, output).
        if self.eat(&TokenKind::LeftParen)? {
            while !self.at(&TokenKind::RightParen) {
                self.expect_ident()?;
                if !self.eat(&TokenKind::Comma)? {
                    break;
                }
            }
            self.expect(&TokenKind::RightParen)?;
        }
        self.expect(&TokenKind::Semicolon)?;

        let mut globals: Vec<VarDef> = vec![
            VarDef::new("input", self.arena.text),
            VarDef::new("output", self.arena.text),
        ];
        let mut functions = Vec::new();

        loop {
            match &self.cur.kind {
                TokenKind::Var => {
                    let vars = self.parse_var_section()?;
                    globals.extend(vars);
                }
                TokenKind::Type => self.parse_type_section()?,
                TokenKind::Const => self.parse_const_section()?,
                TokenKind::Function => {
                    if let Some(f) = self.parse_function_def(true)? {
                        functions.push(f);
                    }
                }
                TokenKind::Procedure => {
                    if let Some(f) = self.parse_function_def(false)? {
                        functions.push(f);
                    }
                }
                TokenKind::Begin => break,
                other => {
                    return Err(self.error(format!(
                        "expected declaration or program body, found '{}'",
                        other
                    )))
                }
            }
        }

        // The program body becomes the zero-argument entry function.
        let loc = self.loc();
        let body = self.parse_block()?;
        self.expect(&TokenKind::Period)?;
        let main_proto = Rc::new(RefCell::new(Prototype::new(
            "__PascalMain",
            Vec::new(),
            self.arena.void,
        )));
        functions.push(Function {
            proto: main_proto,
            locals: Vec::new(),
            body,
            nested: Vec::new(),
            captured: Vec::new(),
            loc,
        });

        if self.errors > 0 {
            let n = self.errors;
            return Err(ParseError {
                msg: format!("{} error(s)", n),
                loc: self.loc(),
            });
        }

        let arena = std::mem::take(&mut self.arena);
        Ok(CompileUnit {
            program: Program {
                name,
                globals,
                functions,
            },
            arena,
        })
    }

    // ───────────────────────────────────────────────────────────
    // Declaration sections
    // ───────────────────────────────────────────────────────────

    /// `var` name {, name} : type ; ...
    fn parse_var_section(&mut self) -> Result<Vec<VarDef>, ParseError> {
        self.expect(&TokenKind::Var)?;
        let mut defs = Vec::new();
        while matches!(self.cur.kind, TokenKind::Ident(_)) {
            let mut group = vec![self.expect_ident()?];
            while self.eat(&TokenKind::Comma)? {
                group.push(self.expect_ident()?);
            }
            self.expect(&TokenKind::Colon)?;
            let ty = self.parse_type(None)?;
            self.expect(&TokenKind::Semicolon)?;
            for name in group {
                let def = VarDef::new(name.clone(), ty);
                if !self.names.add(&name, SymbolEntry::VarDef(def.clone())) {
                    self.error(format!("duplicate name '{}'", name));
                }
                defs.push(def);
            }
        }
        Ok(defs)
    }

    /// `type` name = type ; ... followed by the forward-pointer
    /// resolution pass.
    fn parse_type_section(&mut self) -> Result<(), ParseError> {
        self.expect(&TokenKind::Type)?;
        while matches!(self.cur.kind, TokenKind::Ident(_)) {
            let name = self.expect_ident()?;
            self.expect(&TokenKind::Equal)?;
            let ty = self.parse_type(Some(&name))?;
            self.expect(&TokenKind::Semicolon)?;
            if !self.names.add(&name, SymbolEntry::TypeDef { ty }) {
                self.error(format!("duplicate name '{}'", name));
            }
        }
        // Backpatch pointers that referred forward inside the block.
        let names = &self.names;
        let unresolved = self.arena.resolve_pending(|n| match names.find(n) {
            Some(SymbolEntry::TypeDef { ty }) => Some(*ty),
            _ => None,
        });
        for name in unresolved {
            self.error(format!("pointer to undefined type '{}'", name));
        }
        Ok(())
    }

    /// `const` name = constant-expression ; ...
    fn parse_const_section(&mut self) -> Result<(), ParseError> {
        self.expect(&TokenKind::Const)?;
        while matches!(self.cur.kind, TokenKind::Ident(_)) {
            let name = self.expect_ident()?;
            self.expect(&TokenKind::Equal)?;
            let value = self.parse_const_expr()?;
            self.expect(&TokenKind::Semicolon)?;
            if !self.names.add(&name, SymbolEntry::ConstDef(value)) {
                self.error(format!("duplicate name '{}'", name));
            }
        }
        Ok(())
    }

    // ───────────────────────────────────────────────────────────
    // Constant expressions
    // ───────────────────────────────────────────────────────────

    /// Inline constant folding with the Pascal precedence table over
    /// the `+ - *` / unary / `not` subset.
    fn parse_const_expr(&mut self) -> Result<ConstValue, ParseError> {
        let lhs = self.parse_const_primary()?;
        self.parse_const_bin_rhs(0, lhs)
    }

    fn parse_const_bin_rhs(
        &mut self,
        min_prec: i32,
        mut lhs: ConstValue,
    ) -> Result<ConstValue, ParseError> {
        loop {
            let prec = match self.cur.kind.precedence() {
                Some(p) if p >= min_prec => p,
                _ => return Ok(lhs),
            };
            let op = self.advance()?;
            let mut rhs = self.parse_const_primary()?;
            if let Some(next) = self.cur.kind.precedence() {
                if prec < next {
                    rhs = self.parse_const_bin_rhs(prec + 1, rhs)?;
                }
            }
            let op_text = format!("{}", op.kind);
            lhs = match consteval::apply_binary(&op_text, &lhs, &rhs) {
                Ok(v) => v,
                Err(msg) => return Err(self.error_at(op.loc, msg)),
            };
        }
    }

    /// A constant atom. Identifier tokens are translated to their
    /// constant value before use.
    fn parse_const_primary(&mut self) -> Result<ConstValue, ParseError> {
        match self.cur.kind.clone() {
            TokenKind::Integer(v) => {
                self.advance()?;
                Ok(ConstValue::Int(v))
            }
            TokenKind::Real(v) => {
                self.advance()?;
                Ok(ConstValue::Real(v))
            }
            TokenKind::CharLit(c) => {
                self.advance()?;
                Ok(ConstValue::Char(c))
            }
            TokenKind::StringLit(s) => {
                self.advance()?;
                Ok(ConstValue::Str(s))
            }
            TokenKind::Plus | TokenKind::Minus | TokenKind::Not => {
                let op = self.advance()?;
                let v = self.parse_const_primary()?;
                let op_text = format!("{}", op.kind);
                consteval::apply_unary(&op_text, &v).map_err(|msg| self.error_at(op.loc, msg))
            }
            TokenKind::LeftParen => {
                self.advance()?;
                let v = self.parse_const_expr()?;
                self.expect(&TokenKind::RightParen)?;
                Ok(v)
            }
            TokenKind::Ident(name) => {
                self.advance()?;
                match self.lookup(&name) {
                    Some(SymbolEntry::ConstDef(v)) => Ok(v),
                    Some(SymbolEntry::EnumDef { value, ty }) => {
                        Ok(ConstValue::Enum { value, ty })
                    }
                    _ => Err(self.error(format!("'{}' is not a constant", name))),
                }
            }
            other => Err(self.error(format!("expected constant, found '{}'", other))),
        }
    }

    // ───────────────────────────────────────────────────────────
    // Type parsing
    // ───────────────────────────────────────────────────────────

    /// Keyword-driven type dispatch. `decl_name` is the name being
    /// declared when inside a `type` section (objects need it).
    fn parse_type(&mut self, decl_name: Option<&str>) -> Result<TypeId, ParseError> {
        match self.cur.kind.clone() {
            TokenKind::Packed => {
                // Layout is already tight; `packed` only affects the
                // syntax we accept.
                self.advance()?;
                self.parse_type(decl_name)
            }
            TokenKind::Array => self.parse_array_type(),
            TokenKind::Record => self.parse_record_type(),
            TokenKind::Object => self.parse_object_type(decl_name),
            TokenKind::File => {
                self.advance()?;
                self.expect(&TokenKind::Of)?;
                let base = self.parse_type(None)?;
                Ok(self.arena.add(Type::File {
                    base,
                    is_text: false,
                }))
            }
            TokenKind::Set => self.parse_set_type(),
            TokenKind::LeftParen => self.parse_enum_type(),
            TokenKind::Uparrow => {
                self.advance()?;
                let name = self.expect_ident()?;
                match self.lookup(&name) {
                    Some(SymbolEntry::TypeDef { ty }) => {
                        let target = PtrTarget::Resolved(ty);
                        Ok(self.arena.add(Type::Pointer { target }))
                    }
                    // Not declared yet: leave a pending name for the
                    // post-block resolution pass.
                    _ => Ok(self.arena.add(Type::Pointer {
                        target: PtrTarget::Pending(name),
                    })),
                }
            }
            TokenKind::String_ => {
                self.advance()?;
                let capacity = if self.eat(&TokenKind::LeftSquare)? {
                    let v = self.parse_const_expr()?;
                    self.expect(&TokenKind::RightSquare)?;
                    match v.ordinal() {
                        Some(n) if n >= 1 && n <= MAX_STRING_CAPACITY => n as u32,
                        Some(n) => {
                            return Err(
                                self.error(format!("string capacity {} out of range 1..255", n))
                            )
                        }
                        None => return Err(self.error("string capacity must be an integer")),
                    }
                } else {
                    MAX_STRING_CAPACITY as u32
                };
                Ok(self.arena.add(Type::String { capacity }))
            }
            TokenKind::Ident(name) => match self.lookup(&name) {
                Some(SymbolEntry::TypeDef { ty }) => {
                    self.advance()?;
                    Ok(ty)
                }
                // A constant here starts a subrange like `lo .. hi`.
                Some(SymbolEntry::ConstDef(_)) | Some(SymbolEntry::EnumDef { .. }) => {
                    self.parse_range_type()
                }
                _ => Err(self.error(format!("unknown type '{}'", name))),
            },
            TokenKind::Integer(_)
            | TokenKind::CharLit(_)
            | TokenKind::Minus
            | TokenKind::Plus => self.parse_range_type(),
            other => Err(self.error(format!("expected type, found '{}'", other))),
        }
    }

    /// `low .. high` over any ordinal constants with a common base.
    fn parse_range_type(&mut self) -> Result<TypeId, ParseError> {
        let lo = self.parse_const_expr()?;
        self.expect(&TokenKind::DotDot)?;
        let hi = self.parse_const_expr()?;
        self.make_range(lo, hi)
    }

    fn make_range(&mut self, lo: ConstValue, hi: ConstValue) -> Result<TypeId, ParseError> {
        let (low, high) = match (lo.ordinal(), hi.ordinal()) {
            (Some(l), Some(h)) => (l, h),
            _ => return Err(self.error("range bounds must be ordinal constants")),
        };
        if low > high {
            return Err(self.error(format!("range {}..{} is empty", low, high)));
        }
        let base = lo.type_of(&self.arena);
        let base = self.arena.base_of(base);
        Ok(self.arena.add(Type::Range { base, low, high }))
    }

    /// `( name, name, ... )` — also registers the value names.
    fn parse_enum_type(&mut self) -> Result<TypeId, ParseError> {
        self.expect(&TokenKind::LeftParen)?;
        let mut names = Vec::new();
        loop {
            names.push(self.expect_ident()?);
            if !self.eat(&TokenKind::Comma)? {
                break;
            }
        }
        self.expect(&TokenKind::RightParen)?;
        let ty = self.arena.add(Type::Enum {
            names: names.clone(),
        });
        for (ordinal, name) in names.iter().enumerate() {
            let entry = SymbolEntry::EnumDef {
                value: ordinal as i64,
                ty,
            };
            if !self.names.add(name, entry) {
                self.error(format!("duplicate name '{}'", name));
            }
        }
        Ok(ty)
    }

    /// `array [ index {, index} ] of element`. An index is either an
    /// explicit range or a named integral type supplying its own.
    fn parse_array_type(&mut self) -> Result<TypeId, ParseError> {
        self.expect(&TokenKind::Array)?;
        self.expect(&TokenKind::LeftSquare)?;
        let mut ranges = Vec::new();
        loop {
            ranges.push(self.parse_index_type()?);
            if !self.eat(&TokenKind::Comma)? {
                break;
            }
        }
        self.expect(&TokenKind::RightSquare)?;
        self.expect(&TokenKind::Of)?;
        let element = self.parse_type(None)?;
        Ok(self.arena.add(Type::Array { element, ranges }))
    }

    fn parse_index_type(&mut self) -> Result<TypeId, ParseError> {
        if let TokenKind::Ident(name) = self.cur.kind.clone() {
            if let Some(SymbolEntry::TypeDef { ty }) = self.lookup(&name) {
                self.advance()?;
                return match self.arena.get_range(ty) {
                    Some((low, high)) if high - low < MAX_SET_SIZE * 4 => {
                        let base = self.arena.base_of(ty);
                        Ok(self.arena.add(Type::Range { base, low, high }))
                    }
                    Some(_) => Err(self.error("array index type is too large")),
                    None => Err(self.error("array index must be an integral type")),
                };
            }
        }
        self.parse_range_type()
    }

    /// `set of range-or-named-integral`.
    fn parse_set_type(&mut self) -> Result<TypeId, ParseError> {
        self.expect(&TokenKind::Set)?;
        self.expect(&TokenKind::Of)?;
        let elem = self.parse_index_type()?;
        let (low, high) = self.arena.get_range(elem).unwrap_or((0, -1));
        if high - low + 1 > MAX_SET_SIZE {
            return Err(self.error(format!(
                "set type with {} elements exceeds the limit of {}",
                high - low + 1,
                MAX_SET_SIZE
            )));
        }
        let base = self.arena.base_of(elem);
        Ok(self.arena.add(Type::Set { base, low, high }))
    }

    /// `record fields [variant] end`.
    fn parse_record_type(&mut self) -> Result<TypeId, ParseError> {
        self.expect(&TokenKind::Record)?;
        let mut fields = Vec::new();
        self.parse_field_group(&mut fields)?;
        let variant = if self.at(&TokenKind::Case) {
            Some(self.parse_variant_part(&mut fields)?)
        } else {
            None
        };
        self.expect(&TokenKind::End)?;
        Ok(self.arena.add(Type::Record { fields, variant }))
    }

    /// `name {, name} : type ;` repeated while an identifier starts
    /// the next group.
    fn parse_field_group(&mut self, fields: &mut Vec<Field>) -> Result<(), ParseError> {
        while matches!(self.cur.kind, TokenKind::Ident(_)) {
            let mut group = vec![self.expect_ident()?];
            while self.eat(&TokenKind::Comma)? {
                group.push(self.expect_ident()?);
            }
            self.expect(&TokenKind::Colon)?;
            let ty = self.parse_type(None)?;
            for name in group {
                if fields
                    .iter()
                    .any(|f| f.name.eq_ignore_ascii_case(&name))
                {
                    self.error(format!("duplicate field '{}'", name));
                }
                fields.push(Field {
                    name,
                    ty,
                    is_static: false,
                });
            }
            if !self.eat(&TokenKind::Semicolon)? {
                break;
            }
        }
        Ok(())
    }

    /// `case [tag :] type of labels : ( fields ) ; ...` — the tail
    /// storage shared by the alternatives. A named tag becomes an
    /// ordinary field before the variant.
    fn parse_variant_part(&mut self, fields: &mut Vec<Field>) -> Result<TypeId, ParseError> {
        self.expect(&TokenKind::Case)?;
        // `tag : type of` names a discriminant field; a bare type
        // does not.
        if matches!(self.cur.kind, TokenKind::Ident(_)) && self.peek_is(&TokenKind::Colon) {
            let tag_name = self.expect_ident()?;
            self.expect(&TokenKind::Colon)?;
            let tag_ty = self.parse_type(None)?;
            fields.push(Field {
                name: tag_name,
                ty: tag_ty,
                is_static: false,
            });
        } else {
            self.parse_type(None)?;
        }
        self.expect(&TokenKind::Of)?;

        let mut alts = Vec::new();
        while !self.at(&TokenKind::End) {
            // Labels select the alternative; layout ignores them.
            loop {
                self.parse_const_expr()?;
                if !self.eat(&TokenKind::Comma)? {
                    break;
                }
            }
            self.expect(&TokenKind::Colon)?;
            self.expect(&TokenKind::LeftParen)?;
            let mut alt_fields = Vec::new();
            self.parse_field_group(&mut alt_fields)?;
            self.expect(&TokenKind::RightParen)?;
            let alt_ty = self.arena.add(Type::Record {
                fields: alt_fields,
                variant: None,
            });
            alts.push(Field {
                name: String::new(),
                ty: alt_ty,
                is_static: false,
            });
            if !self.eat(&TokenKind::Semicolon)? {
                break;
            }
        }
        Ok(self.arena.add(Type::Variant { alts }))
    }

    /// `object [( base )] fields and method headers end`.
    fn parse_object_type(&mut self, decl_name: Option<&str>) -> Result<TypeId, ParseError> {
        let class_name = match decl_name {
            Some(n) => n.to_string(),
            None => return Err(self.error("object types must be declared in a type section")),
        };
        self.expect(&TokenKind::Object)?;
        let base = if self.eat(&TokenKind::LeftParen)? {
            let base_name = self.expect_ident()?;
            self.expect(&TokenKind::RightParen)?;
            match self.lookup(&base_name) {
                Some(SymbolEntry::TypeDef { ty })
                    if self.arena.kind(ty) == TypeKind::Class =>
                {
                    Some(ty)
                }
                _ => {
                    self.error(format!("'{}' is not an object type", base_name));
                    None
                }
            }
        } else {
            None
        };

        let mut fields = Vec::new();
        let mut members: Vec<MemberFunc> = Vec::new();
        let mut vtable: Vec<VtableSlot> = match base {
            Some(b) => self.arena.class_vtable(b).to_vec(),
            None => Vec::new(),
        };

        // A placeholder is registered up front so member signatures
        // can mention the class (e.g. ^self pointers resolve later).
        let class_id = self.arena.add(Type::Class {
            name: class_name.clone(),
            base,
            fields: Vec::new(),
            members: Vec::new(),
            vtable: Vec::new(),
        });

        while !self.at(&TokenKind::End) {
            match self.cur.kind.clone() {
                TokenKind::Ident(_) => self.parse_field_group(&mut fields)?,
                TokenKind::Procedure | TokenKind::Function => {
                    let is_function = self.at(&TokenKind::Function);
                    self.advance()?;
                    let mname = self.expect_ident()?;
                    let declared = self.parse_param_types()?;
                    let ret = if is_function {
                        self.expect(&TokenKind::Colon)?;
                        self.parse_type(None)?
                    } else {
                        self.arena.void
                    };
                    self.expect(&TokenKind::Semicolon)?;

                    let mut is_virtual = false;
                    let mut is_override = false;
                    let mut is_static = false;
                    loop {
                        if self.eat(&TokenKind::Virtual)? {
                            is_virtual = true;
                        } else if self.eat(&TokenKind::Override)? {
                            is_override = true;
                        } else if self.eat(&TokenKind::Static)? {
                            is_static = true;
                        } else {
                            break;
                        }
                        self.expect(&TokenKind::Semicolon)?;
                    }

                    // Instance methods take `self` by reference ahead
                    // of the declared parameters.
                    let mut params = Vec::with_capacity(declared.len() + 1);
                    if !is_static {
                        params.push(Param {
                            ty: class_id,
                            by_ref: true,
                        });
                    }
                    params.extend(declared);
                    let sig = FuncSig { params, ret };
                    let vtable_index = if is_override {
                        match vtable
                            .iter()
                            .position(|s| s.name.eq_ignore_ascii_case(&mname))
                        {
                            Some(idx) => {
                                vtable[idx] = VtableSlot {
                                    name: mname.clone(),
                                    impl_class: class_name.clone(),
                                    sig: sig.clone(),
                                };
                                Some(idx)
                            }
                            None => {
                                self.error(format!(
                                    "'{}' overrides no virtual method of an ancestor",
                                    mname
                                ));
                                None
                            }
                        }
                    } else if is_virtual {
                        vtable.push(VtableSlot {
                            name: mname.clone(),
                            impl_class: class_name.clone(),
                            sig: sig.clone(),
                        });
                        Some(vtable.len() - 1)
                    } else {
                        None
                    };

                    members.push(MemberFunc {
                        name: mname,
                        sig,
                        is_virtual,
                        is_override,
                        is_static,
                        vtable_index,
                    });
                }
                other => {
                    return Err(self.error(format!("unexpected '{}' in object type", other)))
                }
            }
        }
        self.expect(&TokenKind::End)?;

        self.arena.fill_class(class_id, fields, members, vtable);
        Ok(class_id)
    }

    /// Parameter declarations reduced to their types, for member
    /// signatures.
    fn parse_param_types(&mut self) -> Result<Vec<Param>, ParseError> {
        let mut out = Vec::new();
        if !self.eat(&TokenKind::LeftParen)? {
            return Ok(out);
        }
        while !self.at(&TokenKind::RightParen) {
            let by_ref = self.eat(&TokenKind::Var)?;
            let mut count = 1;
            self.expect_ident()?;
            while self.eat(&TokenKind::Comma)? {
                self.expect_ident()?;
                count += 1;
            }
            self.expect(&TokenKind::Colon)?;
            let ty = self.parse_type(None)?;
            for _ in 0..count {
                out.push(Param { ty, by_ref });
            }
            if !self.eat(&TokenKind::Semicolon)? {
                break;
            }
        }
        self.expect(&TokenKind::RightParen)?;
        Ok(out)
    }

    // ───────────────────────────────────────────────────────────
    // Functions and procedures
    // ───────────────────────────────────────────────────────────

    /// A full function/procedure definition, method implementation,
    /// or forward declaration (which yields no Function).
    fn parse_function_def(&mut self, is_function: bool) -> Result<Option<Function>, ParseError> {
        let loc = self.loc();
        self.advance()?; // procedure / function

        let first = self.expect_ident()?;
        // `procedure class.method` introduces a method body.
        let (name, method_of) = if self.eat(&TokenKind::Period)? {
            let mname = self.expect_ident()?;
            let class_id = match self.lookup(&first) {
                Some(SymbolEntry::TypeDef { ty })
                    if self.arena.kind(ty) == TypeKind::Class =>
                {
                    ty
                }
                _ => return Err(self.error(format!("'{}' is not an object type", first))),
            };
            (format!("{}.{}", first, mname), Some((class_id, mname)))
        } else {
            (first.clone(), None)
        };

        // A forward declaration leaves a prototype to be completed by
        // the real definition later.
        let existing = match self.names.find_top(&name) {
            Some(SymbolEntry::FuncDef { proto }) if proto.borrow().is_forward => {
                Some(proto.clone())
            }
            _ => None,
        };

        let mut args = Vec::new();
        let member = match &method_of {
            Some((class_id, mname)) => {
                let Some((m, _)) = self.arena.class_member(*class_id, mname) else {
                    return Err(
                        self.error(format!("'{}' is not a member of '{}'", mname, first))
                    );
                };
                if !m.is_static {
                    args.push(VarDef::by_ref("self", *class_id));
                }
                Some(m)
            }
            None => None,
        };
        args.extend(self.parse_params()?);

        let ret = if is_function {
            self.expect(&TokenKind::Colon)?;
            self.parse_type(None)?
        } else {
            self.arena.void
        };
        self.expect(&TokenKind::Semicolon)?;

        let had_forward = existing.is_some();
        let proto = match existing {
            Some(p) => {
                {
                    let mut pm = p.borrow_mut();
                    pm.is_forward = false;
                    if !args.is_empty() {
                        pm.args = args.clone();
                    } else {
                        args = pm.args.clone();
                    }
                }
                p
            }
            None => {
                let mut p = Prototype::new(name.clone(), args.clone(), ret);
                if let Some(m) = &member {
                    p.has_self = !m.is_static;
                    p.base_class = method_of.as_ref().map(|(c, _)| *c);
                }
                Rc::new(RefCell::new(p))
            }
        };

        if self.eat(&TokenKind::Forward)? {
            self.expect(&TokenKind::Semicolon)?;
            proto.borrow_mut().is_forward = true;
            if !self.names.add(
                &name,
                SymbolEntry::FuncDef {
                    proto: proto.clone(),
                },
            ) {
                self.error(format!("duplicate name '{}'", name));
            }
            return Ok(None);
        }

        // Register in the enclosing scope before the body so the
        // function can call itself; method bodies live in their class
        // instead. A completed forward declaration is already there.
        if method_of.is_none()
            && !had_forward
            && !self.names.add(
                &name,
                SymbolEntry::FuncDef {
                    proto: proto.clone(),
                },
            )
        {
            self.error(format!("duplicate name '{}'", name));
        }

        self.names.push_scope();
        self.func_stack.push((name.clone(), ret));
        let saved_class = self.current_class;
        if let Some((class_id, _)) = &method_of {
            self.current_class = Some(*class_id);
            // Unqualified fields inside the body resolve through self.
            self.bind_class_fields(*class_id, loc.clone());
        }
        for arg in &args {
            if !self.names.add(&arg.name, SymbolEntry::VarDef(arg.clone())) {
                self.error(format!("duplicate parameter '{}'", arg.name));
            }
        }

        let mut locals = Vec::new();
        let mut nested = Vec::new();
        loop {
            match &self.cur.kind {
                TokenKind::Var => locals.extend(self.parse_var_section()?),
                TokenKind::Const => self.parse_const_section()?,
                TokenKind::Type => self.parse_type_section()?,
                TokenKind::Function => {
                    if let Some(f) = self.parse_function_def(true)? {
                        nested.push(f);
                    }
                }
                TokenKind::Procedure => {
                    if let Some(f) = self.parse_function_def(false)? {
                        nested.push(f);
                    }
                }
                TokenKind::Begin => break,
                other => {
                    let msg = format!("expected declarations or 'begin', found '{}'", other);
                    self.names.pop_scope();
                    self.func_stack.pop();
                    self.current_class = saved_class;
                    return Err(self.error(msg));
                }
            }
        }

        let body = self.parse_block();
        self.names.pop_scope();
        self.func_stack.pop();
        self.current_class = saved_class;
        let body = body?;
        self.expect(&TokenKind::Semicolon)?;

        Ok(Some(Function {
            proto,
            locals,
            body,
            nested,
            captured: Vec::new(),
            loc,
        }))
    }

    /// Full parameter list with names: `( [var] a, b : t ; ... )`.
    fn parse_params(&mut self) -> Result<Vec<VarDef>, ParseError> {
        let mut out = Vec::new();
        if !self.eat(&TokenKind::LeftParen)? {
            return Ok(out);
        }
        while !self.at(&TokenKind::RightParen) {
            let by_ref = self.eat(&TokenKind::Var)?;
            let mut group = vec![self.expect_ident()?];
            while self.eat(&TokenKind::Comma)? {
                group.push(self.expect_ident()?);
            }
            self.expect(&TokenKind::Colon)?;
            let ty = self.parse_type(None)?;
            for name in group {
                out.push(VarDef {
                    name,
                    ty,
                    is_ref: by_ref,
                });
            }
            if !self.eat(&TokenKind::Semicolon)? {
                break;
            }
        }
        self.expect(&TokenKind::RightParen)?;
        Ok(out)
    }

    /// Bind every instance field of `class_id` as a with-style alias
    /// over `self` in the current scope.
    fn bind_class_fields(&mut self, class_id: TypeId, loc: Location) {
        let self_expr = Expr::new(
            ExprKind::Variable {
                name: "self".into(),
            },
            class_id,
            loc,
        );
        for name in self.arena.class_field_names(class_id) {
            if let Some((_, fty)) = self.arena.class_field(class_id, &name) {
                self.names.add(
                    &name,
                    SymbolEntry::WithDef {
                        base: self_expr.clone(),
                        sel: FieldSel::Class { name: name.clone() },
                        ty: fty,
                    },
                );
            }
        }
    }

    // ───────────────────────────────────────────────────────────
    // Statements
    // ───────────────────────────────────────────────────────────

    /// `begin stmt ; ... end` with per-statement resynchronization.
    fn parse_block(&mut self) -> Result<Stmt, ParseError> {
        self.expect(&TokenKind::Begin)?;
        let mut stmts = Vec::new();
        loop {
            while self.eat(&TokenKind::Semicolon)? {}
            if self.at(&TokenKind::End) {
                break;
            }
            match self.parse_statement() {
                Ok(s) => stmts.push(s),
                Err(_) => {
                    // Resynchronize: skip to the end of the statement.
                    while !self.at(&TokenKind::Semicolon)
                        && !self.at(&TokenKind::End)
                        && !self.at(&TokenKind::EndOfFile)
                    {
                        self.advance()?;
                    }
                    if self.at(&TokenKind::EndOfFile) {
                        return Err(self.error("unexpected end of file in block"));
                    }
                }
            }
            if !self.eat(&TokenKind::Semicolon)? {
                break;
            }
        }
        self.expect(&TokenKind::End)?;
        Ok(Stmt::Block(stmts))
    }

    fn parse_statement(&mut self) -> Result<Stmt, ParseError> {
        match self.cur.kind.clone() {
            TokenKind::Begin => self.parse_block(),
            TokenKind::If => self.parse_if(),
            TokenKind::For => self.parse_for(),
            TokenKind::While => self.parse_while(),
            TokenKind::Repeat => self.parse_repeat(),
            TokenKind::Case => self.parse_case(),
            TokenKind::With => self.parse_with(),
            TokenKind::Write => self.parse_write(false),
            TokenKind::Writeln => self.parse_write(true),
            TokenKind::Read => self.parse_read(false),
            TokenKind::Readln => self.parse_read(true),
            TokenKind::Ident(_) => self.parse_assign_or_call(),
            TokenKind::Semicolon | TokenKind::End => Ok(Stmt::Empty),
            other => Err(self.error(format!("unexpected '{}' at start of statement", other))),
        }
    }

    fn parse_if(&mut self) -> Result<Stmt, ParseError> {
        self.expect(&TokenKind::If)?;
        let cond = self.parse_expression()?;
        if !self.arena.same_as(cond.ty, self.arena.boolean) {
            self.error_at(cond.loc.clone(), "if condition must be boolean");
        }
        self.expect(&TokenKind::Then)?;
        let then_branch = Box::new(self.parse_statement()?);
        let else_branch = if self.eat(&TokenKind::Else)? {
            Some(Box::new(self.parse_statement()?))
        } else {
            None
        };
        Ok(Stmt::If {
            cond,
            then_branch,
            else_branch,
        })
    }

    fn parse_for(&mut self) -> Result<Stmt, ParseError> {
        self.expect(&TokenKind::For)?;
        let var = self.expect_ident()?;
        match self.lookup(&var) {
            Some(SymbolEntry::VarDef(d)) if self.arena.is_integral(d.ty) => {}
            Some(SymbolEntry::VarDef(_)) => {
                self.error(format!("for-loop variable '{}' must be integral", var));
            }
            _ => {
                return Err(
                    self.error(format!("for-loop variable '{}' must be a named variable", var))
                )
            }
        }
        self.expect(&TokenKind::Assign)?;
        let start = self.parse_expression()?;
        let down = if self.eat(&TokenKind::To)? {
            false
        } else if self.eat(&TokenKind::Downto)? {
            true
        } else {
            return Err(self.error("expected 'to' or 'downto'"));
        };
        let end = self.parse_expression()?;
        self.expect(&TokenKind::Do)?;
        let body = Box::new(self.parse_statement()?);
        Ok(Stmt::For {
            var,
            start,
            end,
            down,
            body,
        })
    }

    fn parse_while(&mut self) -> Result<Stmt, ParseError> {
        self.expect(&TokenKind::While)?;
        let cond = self.parse_expression()?;
        if !self.arena.same_as(cond.ty, self.arena.boolean) {
            self.error_at(cond.loc.clone(), "while condition must be boolean");
        }
        self.expect(&TokenKind::Do)?;
        let body = Box::new(self.parse_statement()?);
        Ok(Stmt::While { cond, body })
    }

    fn parse_repeat(&mut self) -> Result<Stmt, ParseError> {
        self.expect(&TokenKind::Repeat)?;
        let mut body = Vec::new();
        loop {
            while self.eat(&TokenKind::Semicolon)? {}
            if self.at(&TokenKind::Until) {
                break;
            }
            body.push(self.parse_statement()?);
            if !self.eat(&TokenKind::Semicolon)? {
                break;
            }
        }
        self.expect(&TokenKind::Until)?;
        let cond = self.parse_expression()?;
        if !self.arena.same_as(cond.ty, self.arena.boolean) {
            self.error_at(cond.loc.clone(), "until condition must be boolean");
        }
        Ok(Stmt::Repeat { body, cond })
    }

    /// `case selector of labels : stmt ; ... [otherwise ...] end`.
    fn parse_case(&mut self) -> Result<Stmt, ParseError> {
        self.expect(&TokenKind::Case)?;
        let selector = self.parse_expression()?;
        if !self.arena.is_integral(selector.ty) {
            self.error_at(selector.loc.clone(), "case selector must be integral");
        }
        self.expect(&TokenKind::Of)?;
        let mut branches = Vec::new();
        let mut otherwise = None;
        loop {
            while self.eat(&TokenKind::Semicolon)? {}
            if self.at(&TokenKind::End) {
                break;
            }
            if self.eat(&TokenKind::Otherwise)? {
                let mut stmts = Vec::new();
                loop {
                    while self.eat(&TokenKind::Semicolon)? {}
                    if self.at(&TokenKind::End) {
                        break;
                    }
                    stmts.push(self.parse_statement()?);
                    if !self.eat(&TokenKind::Semicolon)? {
                        break;
                    }
                }
                otherwise = Some(Box::new(Stmt::Block(stmts)));
                break;
            }
            let mut labels = Vec::new();
            loop {
                let lo = self.parse_const_expr()?;
                let lo = match lo.ordinal() {
                    Some(v) => v,
                    None => return Err(self.error("case label must be an ordinal constant")),
                };
                if self.eat(&TokenKind::DotDot)? {
                    let hi = self.parse_const_expr()?;
                    let hi = match hi.ordinal() {
                        Some(v) => v,
                        None => return Err(self.error("case label must be an ordinal constant")),
                    };
                    for v in lo..=hi {
                        labels.push(v);
                    }
                } else {
                    labels.push(lo);
                }
                if !self.eat(&TokenKind::Comma)? {
                    break;
                }
            }
            self.expect(&TokenKind::Colon)?;
            let body = self.parse_statement()?;
            branches.push(CaseBranch { labels, body });
            if !self.eat(&TokenKind::Semicolon)? {
                break;
            }
        }
        self.expect(&TokenKind::End)?;
        Ok(Stmt::Case {
            selector,
            branches,
            otherwise,
        })
    }

    /// `with designator {, designator} do stmt` — binds every field
    /// of each record as an alias in a fresh scope.
    fn parse_with(&mut self) -> Result<Stmt, ParseError> {
        self.expect(&TokenKind::With)?;
        let mut pushed = 0;
        let result = (|| {
            loop {
                let expr = self.parse_expression()?;
                if !expr.is_addressable() {
                    self.error_at(expr.loc.clone(), "with target must be addressable");
                }
                self.names.push_scope();
                pushed += 1;
                self.bind_with_fields(&expr);
                if !self.eat(&TokenKind::Comma)? {
                    break;
                }
            }
            self.expect(&TokenKind::Do)?;
            let body = Box::new(self.parse_statement()?);
            Ok(Stmt::With { body })
        })();
        for _ in 0..pushed {
            self.names.pop_scope();
        }
        result
    }

    fn bind_with_fields(&mut self, base: &Expr) {
        match self.arena.kind(base.ty) {
            TypeKind::Record => {
                let (fields, variant) = match self.arena.get(base.ty) {
                    Type::Record { fields, variant } => (fields.clone(), *variant),
                    _ => return,
                };
                for (index, f) in fields.iter().enumerate() {
                    self.names.add(
                        &f.name,
                        SymbolEntry::WithDef {
                            base: base.clone(),
                            sel: FieldSel::Record { index },
                            ty: f.ty,
                        },
                    );
                }
                if let Some(v) = variant {
                    if let Type::Variant { alts } = self.arena.get(v) {
                        let alts = alts.clone();
                        for (alt, a) in alts.iter().enumerate() {
                            if let Type::Record { fields, .. } = self.arena.get(a.ty) {
                                for (index, f) in fields.clone().iter().enumerate() {
                                    self.names.add(
                                        &f.name,
                                        SymbolEntry::WithDef {
                                            base: base.clone(),
                                            sel: FieldSel::Variant { alt, index },
                                            ty: f.ty,
                                        },
                                    );
                                }
                            }
                        }
                    }
                }
            }
            TypeKind::Class => {
                for name in self.arena.class_field_names(base.ty) {
                    if let Some((_, fty)) = self.arena.class_field(base.ty, &name) {
                        self.names.add(
                            &name,
                            SymbolEntry::WithDef {
                                base: base.clone(),
                                sel: FieldSel::Class { name: name.clone() },
                                ty: fty,
                            },
                        );
                    }
                }
            }
            _ => {
                self.error_at(base.loc.clone(), "with target must be a record or object");
            }
        }
    }

    /// `write[ln] [( [file ,] arg [: width [: precision]] , ... )]`.
    fn parse_write(&mut self, newline: bool) -> Result<Stmt, ParseError> {
        self.advance()?;
        let mut file = None;
        let mut args = Vec::new();
        if self.eat(&TokenKind::LeftParen)? {
            let mut first = true;
            while !self.at(&TokenKind::RightParen) {
                let expr = self.parse_expression()?;
                if first && self.arena.kind(expr.ty) == TypeKind::File {
                    file = Some(expr);
                    first = false;
                    if !self.eat(&TokenKind::Comma)? {
                        break;
                    }
                    continue;
                }
                first = false;
                let width = if self.eat(&TokenKind::Colon)? {
                    Some(self.parse_expression()?)
                } else {
                    None
                };
                let precision = if self.eat(&TokenKind::Colon)? {
                    Some(self.parse_expression()?)
                } else {
                    None
                };
                self.check_write_arg(&expr);
                args.push(WriteArg {
                    expr,
                    width,
                    precision,
                });
                if !self.eat(&TokenKind::Comma)? {
                    break;
                }
            }
            self.expect(&TokenKind::RightParen)?;
        }
        Ok(Stmt::Write {
            file,
            args,
            newline,
        })
    }

    fn check_write_arg(&mut self, expr: &Expr) {
        let ok = self.arena.is_integral(expr.ty)
            || matches!(
                self.arena.kind(expr.ty),
                TypeKind::Real | TypeKind::String
            )
            || matches!(expr.kind, ExprKind::StringLit(_) | ExprKind::CharLit(_));
        if !ok {
            self.error_at(expr.loc.clone(), "argument cannot be written");
        }
    }

    fn parse_read(&mut self, newline: bool) -> Result<Stmt, ParseError> {
        self.advance()?;
        let mut file = None;
        let mut args = Vec::new();
        if self.eat(&TokenKind::LeftParen)? {
            let mut first = true;
            while !self.at(&TokenKind::RightParen) {
                let expr = self.parse_expression()?;
                if first && self.arena.kind(expr.ty) == TypeKind::File {
                    file = Some(expr);
                    first = false;
                    if !self.eat(&TokenKind::Comma)? {
                        break;
                    }
                    continue;
                }
                first = false;
                if !expr.is_addressable() {
                    self.error_at(expr.loc.clone(), "read target must be addressable");
                }
                args.push(expr);
                if !self.eat(&TokenKind::Comma)? {
                    break;
                }
            }
            self.expect(&TokenKind::RightParen)?;
        }
        Ok(Stmt::Read {
            file,
            args,
            newline,
        })
    }

    /// A statement starting with an identifier: assignment (possibly
    /// through selectors), procedure call, or function-result
    /// assignment.
    fn parse_assign_or_call(&mut self) -> Result<Stmt, ParseError> {
        // `f := expr` inside function f assigns the result slot.
        if let TokenKind::Ident(name) = self.cur.kind.clone() {
            if self.peek_is(&TokenKind::Assign) {
                let target = self.func_stack.last().map(|(n, t)| (n.clone(), *t));
                if let Some((fname, ret)) = target {
                    let matches_result = fname.eq_ignore_ascii_case(&name)
                        || fname
                            .rsplit('.')
                            .next()
                            .is_some_and(|m| m.eq_ignore_ascii_case(&name));
                    if matches_result {
                        let loc = self.loc();
                        self.advance()?;
                        self.advance()?;
                        let rhs = self.parse_expression()?;
                        let lhs = Expr::new(ExprKind::Variable { name: fname }, ret, loc);
                        return self.finish_assignment(lhs, rhs);
                    }
                }
            }
        }

        let expr = self.parse_primary_postfix()?;
        if self.eat(&TokenKind::Assign)? {
            if !expr.is_addressable() {
                self.error_at(expr.loc.clone(), "assignment target must be addressable");
            }
            let rhs = self.parse_expression()?;
            return self.finish_assignment(expr, rhs);
        }

        // Otherwise it must be a call; a bare function reference is an
        // implicit zero-argument call.
        let call = self.make_implicit_call(expr)?;
        match &call.kind {
            ExprKind::Call { .. } | ExprKind::BuiltinCall { .. } => Ok(Stmt::Call(call)),
            _ => Err(self.error_at(call.loc.clone(), "expression is not a statement")),
        }
    }

    fn finish_assignment(&mut self, lhs: Expr, mut rhs: Expr) -> Result<Stmt, ParseError> {
        // A set constructor adopts the destination's set type.
        self.adopt_set_context(lhs.ty, &mut rhs);
        if !self.arena.assignable_type(lhs.ty, rhs.ty) {
            self.error_at(
                rhs.loc.clone(),
                format!(
                    "cannot assign {} to {}",
                    self.arena.describe(rhs.ty),
                    self.arena.describe(lhs.ty)
                ),
            );
        }
        Ok(Stmt::Assign { lhs, rhs })
    }

    fn adopt_set_context(&mut self, target: TypeId, expr: &mut Expr) {
        if self.arena.kind(target) != TypeKind::Set {
            return;
        }
        let ExprKind::SetLit { elements } = &expr.kind else {
            return;
        };
        let empty = elements.is_empty();
        let (eb, tb) = match (self.arena.get(expr.ty), self.arena.get(target)) {
            (Type::Set { base: eb, .. }, Type::Set { base: tb, .. }) => (*eb, *tb),
            _ => return,
        };
        if empty || self.arena.same_as(self.arena.base_of(eb), self.arena.base_of(tb)) {
            expr.ty = target;
        }
    }

    // ───────────────────────────────────────────────────────────
    // Expressions
    // ───────────────────────────────────────────────────────────

    pub fn parse_expression(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.parse_unary()?;
        self.parse_bin_rhs(0, lhs)
    }

    fn parse_bin_rhs(&mut self, min_prec: i32, mut lhs: Expr) -> Result<Expr, ParseError> {
        loop {
            let prec = match self.cur.kind.precedence() {
                Some(p) if p >= min_prec => p,
                _ => return Ok(lhs),
            };
            let op = self.advance()?;
            let mut rhs = self.parse_unary()?;
            if let Some(next) = self.cur.kind.precedence() {
                if prec < next {
                    rhs = self.parse_bin_rhs(prec + 1, rhs)?;
                }
            }
            lhs = self.make_binary(op, lhs, rhs)?;
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        match self.cur.kind.clone() {
            TokenKind::Minus | TokenKind::Plus | TokenKind::Not => {
                let op = self.advance()?;
                let operand = self.parse_unary()?;
                let ty = match op.kind {
                    TokenKind::Not => {
                        if !self.arena.same_as(operand.ty, self.arena.boolean)
                            && !self.arena.is_integral(operand.ty)
                        {
                            self.error_at(operand.loc.clone(), "'not' needs boolean or integer");
                        }
                        operand.ty
                    }
                    _ => {
                        let k = self.arena.kind(self.arena.base_of(operand.ty));
                        if !matches!(
                            k,
                            TypeKind::Integer | TypeKind::Int64 | TypeKind::Real
                        ) {
                            self.error_at(operand.loc.clone(), "sign needs a numeric operand");
                        }
                        operand.ty
                    }
                };
                Ok(Expr::new(
                    ExprKind::Unary {
                        op: op.kind,
                        operand: Box::new(operand),
                    },
                    ty,
                    op.loc,
                ))
            }
            _ => self.parse_primary_postfix(),
        }
    }

    fn make_binary(&mut self, op: Token, lhs: Expr, mut rhs: Expr) -> Result<Expr, ParseError> {
        use TokenKind::*;
        let boolean = self.arena.boolean;
        let ty = match &op.kind {
            In => {
                if !self.arena.is_integral(lhs.ty) {
                    self.error_at(lhs.loc.clone(), "'in' needs an ordinal left operand");
                }
                if self.arena.kind(rhs.ty) != TypeKind::Set {
                    self.error_at(rhs.loc.clone(), "'in' needs a set right operand");
                }
                boolean
            }
            Equal | NotEqual | LessThan | GreaterThan | LessOrEqual | GreaterOrEqual => {
                self.adopt_set_context(lhs.ty, &mut rhs);
                if self.arena.compatible_type(lhs.ty, rhs.ty).is_none() {
                    self.error_at(
                        op.loc.clone(),
                        format!(
                            "incompatible operands: {} {} {}",
                            self.arena.describe(lhs.ty),
                            op.kind,
                            self.arena.describe(rhs.ty)
                        ),
                    );
                }
                boolean
            }
            Divide => {
                // `/` always produces a real result.
                let ok = |a: &TypeArena, t| {
                    matches!(
                        a.kind(a.base_of(t)),
                        TypeKind::Integer | TypeKind::Int64 | TypeKind::Real
                    )
                };
                if !ok(&self.arena, lhs.ty) || !ok(&self.arena, rhs.ty) {
                    self.error_at(op.loc.clone(), "'/' needs numeric operands");
                }
                self.arena.real
            }
            Div | Mod => {
                let ok = |a: &TypeArena, t| {
                    matches!(a.kind(a.base_of(t)), TypeKind::Integer | TypeKind::Int64)
                };
                if !ok(&self.arena, lhs.ty) || !ok(&self.arena, rhs.ty) {
                    self.error_at(op.loc.clone(), "'div'/'mod' need integer operands");
                }
                self.arena
                    .compatible_type(lhs.ty, rhs.ty)
                    .unwrap_or(self.arena.integer)
            }
            And | Or => match self.arena.compatible_type(lhs.ty, rhs.ty) {
                Some(t)
                    if self.arena.same_as(t, boolean) || self.arena.is_integral(t) =>
                {
                    t
                }
                _ => {
                    self.error_at(op.loc.clone(), "'and'/'or' need boolean or integer operands");
                    boolean
                }
            },
            Plus | Minus | Multiply => {
                self.adopt_set_context(lhs.ty, &mut rhs);
                match self.arena.compatible_type(lhs.ty, rhs.ty) {
                    Some(t)
                        if matches!(
                            self.arena.kind(t),
                            TypeKind::Integer
                                | TypeKind::Int64
                                | TypeKind::Real
                                | TypeKind::Set
                        ) =>
                    {
                        t
                    }
                    _ => {
                        self.error_at(
                            op.loc.clone(),
                            format!(
                                "incompatible operands: {} {} {}",
                                self.arena.describe(lhs.ty),
                                op.kind,
                                self.arena.describe(rhs.ty)
                            ),
                        );
                        lhs.ty
                    }
                }
            }
            other => {
                return Err(
                    self.error_at(op.loc.clone(), format!("'{}' is not a binary operator", other))
                )
            }
        };
        Ok(Expr::new(
            ExprKind::Binary {
                op: op.kind,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty,
            op.loc,
        ))
    }

    fn parse_primary_postfix(&mut self) -> Result<Expr, ParseError> {
        let e = self.parse_primary()?;
        self.parse_postfix(e)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let loc = self.loc();
        match self.cur.kind.clone() {
            TokenKind::Integer(v) => {
                self.advance()?;
                Ok(Expr::new(ExprKind::IntLit(v), self.arena.integer, loc))
            }
            TokenKind::Real(v) => {
                self.advance()?;
                Ok(Expr::new(ExprKind::RealLit(v), self.arena.real, loc))
            }
            TokenKind::CharLit(c) => {
                self.advance()?;
                Ok(Expr::new(ExprKind::CharLit(c), self.arena.char, loc))
            }
            TokenKind::StringLit(s) => {
                self.advance()?;
                let ty = self.arena.add(Type::String {
                    capacity: s.len().min(MAX_STRING_CAPACITY as usize) as u32,
                });
                Ok(Expr::new(ExprKind::StringLit(s), ty, loc))
            }
            TokenKind::Nil => {
                self.advance()?;
                Ok(Expr::new(ExprKind::NilLit, self.arena.nil, loc))
            }
            TokenKind::LeftParen => {
                self.advance()?;
                let e = self.parse_expression()?;
                self.expect(&TokenKind::RightParen)?;
                Ok(e)
            }
            TokenKind::LeftSquare => self.parse_set_literal(),
            TokenKind::SizeOf => {
                self.advance()?;
                self.expect(&TokenKind::LeftParen)?;
                let measured = if let TokenKind::Ident(name) = self.cur.kind.clone() {
                    match self.lookup(&name) {
                        Some(SymbolEntry::TypeDef { ty }) => {
                            self.advance()?;
                            ty
                        }
                        _ => self.parse_expression()?.ty,
                    }
                } else {
                    self.parse_expression()?.ty
                };
                self.expect(&TokenKind::RightParen)?;
                Ok(Expr::new(ExprKind::SizeOf(measured), self.arena.integer, loc))
            }
            TokenKind::Ident(name) => {
                self.advance()?;
                self.resolve_ident(name, loc)
            }
            other => Err(self.error(format!("unexpected '{}' in expression", other))),
        }
    }

    fn resolve_ident(&mut self, name: String, loc: Location) -> Result<Expr, ParseError> {
        match self.lookup(&name) {
            Some(SymbolEntry::VarDef(d)) => Ok(Expr::new(
                ExprKind::Variable { name: d.name },
                d.ty,
                loc,
            )),
            Some(SymbolEntry::ConstDef(v)) => Ok(self.const_to_expr(v, loc)),
            Some(SymbolEntry::EnumDef { value, ty }) => {
                Ok(Expr::new(ExprKind::IntLit(value), ty, loc))
            }
            Some(SymbolEntry::WithDef { base, sel, ty }) => Ok(Expr::new(
                ExprKind::Field {
                    base: Box::new(base),
                    sel,
                },
                ty,
                loc,
            )),
            Some(SymbolEntry::FuncDef { proto }) => {
                // The reference itself has function type; the postfix
                // pass converts it into a call typed by the result.
                let (pname, sig) = {
                    let p = proto.borrow();
                    let params = p
                        .args
                        .iter()
                        .map(|a| Param {
                            ty: a.ty,
                            by_ref: a.is_ref,
                        })
                        .collect();
                    (
                        p.name.clone(),
                        FuncSig {
                            params,
                            ret: p.ret,
                        },
                    )
                };
                let fty = self.arena.add(Type::Function(sig));
                Ok(Expr::new(
                    ExprKind::FunctionRef { name: pname, proto },
                    fty,
                    loc,
                ))
            }
            Some(SymbolEntry::TypeDef { .. }) => {
                Err(self.error_at(loc, format!("type name '{}' is not a value", name)))
            }
            None => {
                // Unqualified method of the enclosing class?
                if let Some(class_id) = self.current_class {
                    if let Some((m, _)) = self.arena.class_member(class_id, &name) {
                        let base = Expr::new(
                            ExprKind::Variable {
                                name: "self".into(),
                            },
                            class_id,
                            loc.clone(),
                        );
                        return Ok(Expr::new(
                            ExprKind::Method {
                                base: Box::new(base),
                                sel: MethodSel {
                                    class: class_id,
                                    name: m.name.clone(),
                                    vtable_index: m.vtable_index,
                                    is_static: m.is_static,
                                },
                            },
                            m.sig.ret,
                            loc,
                        ));
                    }
                }
                if let Some(builtin) = Builtin::lookup(&name) {
                    return self.parse_builtin_call(builtin, loc);
                }
                Err(self.error_at(loc, format!("undefined name '{}'", name)))
            }
        }
    }

    fn const_to_expr(&mut self, v: ConstValue, loc: Location) -> Expr {
        match v {
            ConstValue::Int(n) => Expr::new(ExprKind::IntLit(n), self.arena.integer, loc),
            ConstValue::Real(r) => Expr::new(ExprKind::RealLit(r), self.arena.real, loc),
            ConstValue::Char(c) => Expr::new(ExprKind::CharLit(c), self.arena.char, loc),
            ConstValue::Bool(b) => {
                Expr::new(ExprKind::IntLit(b as i64), self.arena.boolean, loc)
            }
            ConstValue::Str(s) => {
                let ty = self.arena.add(Type::String {
                    capacity: s.len().min(MAX_STRING_CAPACITY as usize) as u32,
                });
                Expr::new(ExprKind::StringLit(s), ty, loc)
            }
            ConstValue::Enum { value, ty } => Expr::new(ExprKind::IntLit(value), ty, loc),
        }
    }

    /// `[ element {, element} ]` where an element is `e` or `e..e`.
    fn parse_set_literal(&mut self) -> Result<Expr, ParseError> {
        let loc = self.loc();
        self.expect(&TokenKind::LeftSquare)?;
        let mut elements = Vec::new();
        while !self.at(&TokenKind::RightSquare) {
            let low = self.parse_expression()?;
            let high = if self.eat(&TokenKind::DotDot)? {
                Some(self.parse_expression()?)
            } else {
                None
            };
            elements.push(SetElement { low, high });
            if !self.eat(&TokenKind::Comma)? {
                break;
            }
        }
        self.expect(&TokenKind::RightSquare)?;

        // Without assignment context the element base picks the set
        // range: small default for integers, the full range for other
        // ordinals. An empty constructor stays untyped until adopted.
        let ty = match elements.first() {
            Some(e) => {
                let base = self.arena.base_of(e.low.ty);
                if !self.arena.is_integral(base) {
                    self.error_at(e.low.loc.clone(), "set elements must be ordinal");
                }
                let (low, high) = match self.arena.kind(base) {
                    TypeKind::Integer | TypeKind::Int64 => (0, 255),
                    _ => self.arena.get_range(base).unwrap_or((0, 255)),
                };
                self.arena.add(Type::Set { base, low, high })
            }
            None => self.arena.add(Type::Set {
                base: self.arena.integer,
                low: 0,
                high: -1,
            }),
        };
        Ok(Expr::new(ExprKind::SetLit { elements }, ty, loc))
    }

    fn parse_builtin_call(&mut self, builtin: Builtin, loc: Location) -> Result<Expr, ParseError> {
        let mut args = Vec::new();
        if self.eat(&TokenKind::LeftParen)? {
            while !self.at(&TokenKind::RightParen) {
                args.push(self.parse_expression()?);
                if !self.eat(&TokenKind::Comma)? {
                    break;
                }
            }
            self.expect(&TokenKind::RightParen)?;
        }
        let ty = match self.check_builtin(builtin, &args) {
            Ok(t) => t,
            Err(msg) => {
                self.error_at(loc.clone(), msg);
                self.arena.void
            }
        };
        Ok(Expr::new(ExprKind::BuiltinCall { builtin, args }, ty, loc))
    }

    /// Validate a builtin call's arity and argument types; returns
    /// the result type.
    fn check_builtin(&self, builtin: Builtin, args: &[Expr]) -> Result<TypeId, String> {
        use Builtin::*;
        let a = &self.arena;
        let numeric = |t: TypeId| {
            matches!(
                a.kind(a.base_of(t)),
                TypeKind::Integer | TypeKind::Int64 | TypeKind::Real
            )
        };
        let want = |n: usize| {
            if args.len() != n {
                Err(format!("expected {} argument(s), got {}", n, args.len()))
            } else {
                Ok(())
            }
        };
        match builtin {
            Abs | Sqr => {
                want(1)?;
                if !numeric(args[0].ty) {
                    return Err("argument must be numeric".into());
                }
                Ok(a.base_of(args[0].ty))
            }
            Sqrt | Sin | Cos | Arctan | Ln | Exp => {
                want(1)?;
                if !numeric(args[0].ty) {
                    return Err("argument must be numeric".into());
                }
                Ok(a.real)
            }
            Trunc | Round => {
                want(1)?;
                if a.kind(a.base_of(args[0].ty)) != TypeKind::Real {
                    return Err("argument must be real".into());
                }
                Ok(a.integer)
            }
            Odd => {
                want(1)?;
                if !matches!(a.kind(a.base_of(args[0].ty)), TypeKind::Integer | TypeKind::Int64) {
                    return Err("argument must be integer".into());
                }
                Ok(a.boolean)
            }
            Ord => {
                want(1)?;
                if !a.is_integral(args[0].ty) {
                    return Err("argument must be ordinal".into());
                }
                Ok(a.integer)
            }
            Chr => {
                want(1)?;
                if !matches!(a.kind(a.base_of(args[0].ty)), TypeKind::Integer | TypeKind::Int64) {
                    return Err("argument must be integer".into());
                }
                Ok(a.char)
            }
            Succ | Pred => {
                want(1)?;
                if !a.is_integral(args[0].ty) {
                    return Err("argument must be ordinal".into());
                }
                Ok(args[0].ty)
            }
            Length => {
                want(1)?;
                if a.kind(args[0].ty) != TypeKind::String {
                    return Err("argument must be a string".into());
                }
                Ok(a.integer)
            }
            New | Dispose => {
                want(1)?;
                if a.kind(args[0].ty) != TypeKind::Pointer {
                    return Err("argument must be a pointer variable".into());
                }
                if !args[0].is_addressable() {
                    return Err("argument must be addressable".into());
                }
                Ok(a.void)
            }
            Assign => {
                want(2)?;
                if a.kind(args[0].ty) != TypeKind::File {
                    return Err("first argument must be a file".into());
                }
                let name_ok = a.kind(args[1].ty) == TypeKind::String
                    || matches!(args[1].kind, ExprKind::StringLit(_));
                if !name_ok {
                    return Err("second argument must be a file name".into());
                }
                Ok(a.void)
            }
            Reset | Rewrite | Close => {
                want(1)?;
                if a.kind(args[0].ty) != TypeKind::File {
                    return Err("argument must be a file".into());
                }
                Ok(a.void)
            }
            Eof | Eoln => {
                if args.len() > 1 {
                    return Err("expected at most one file argument".into());
                }
                if let Some(f) = args.first() {
                    if a.kind(f.ty) != TypeKind::File {
                        return Err("argument must be a file".into());
                    }
                }
                Ok(a.boolean)
            }
            Inc | Dec => {
                want(1)?;
                if !a.is_integral(args[0].ty) {
                    return Err("argument must be ordinal".into());
                }
                if !args[0].is_addressable() {
                    return Err("argument must be addressable".into());
                }
                Ok(a.void)
            }
        }
    }

    fn parse_postfix(&mut self, mut expr: Expr) -> Result<Expr, ParseError> {
        loop {
            match self.cur.kind.clone() {
                TokenKind::LeftSquare => {
                    self.advance()?;
                    let mut indices = Vec::new();
                    loop {
                        indices.push(self.parse_expression()?);
                        if !self.eat(&TokenKind::Comma)? {
                            break;
                        }
                    }
                    self.expect(&TokenKind::RightSquare)?;
                    expr = self.make_index(expr, indices)?;
                }
                TokenKind::Period => {
                    self.advance()?;
                    let field = self.expect_ident()?;
                    expr = self.make_field(expr, field)?;
                }
                TokenKind::Uparrow => {
                    self.advance()?;
                    let loc = expr.loc.clone();
                    match self.arena.kind(expr.ty) {
                        TypeKind::Pointer => {
                            let target = self.arena.sub_type(expr.ty).unwrap_or(self.arena.void);
                            expr = Expr::new(
                                ExprKind::Deref {
                                    base: Box::new(expr),
                                },
                                target,
                                loc,
                            );
                        }
                        TypeKind::File => {
                            let elem = self.arena.sub_type(expr.ty).unwrap_or(self.arena.char);
                            expr = Expr::new(
                                ExprKind::FileBuffer {
                                    base: Box::new(expr),
                                },
                                elem,
                                loc,
                            );
                        }
                        _ => {
                            return Err(self.error_at(
                                loc,
                                "'^' needs a pointer or file operand",
                            ))
                        }
                    }
                }
                TokenKind::LeftParen
                    if matches!(
                        expr.kind,
                        ExprKind::FunctionRef { .. } | ExprKind::Method { .. }
                    ) =>
                {
                    self.advance()?;
                    let mut args = Vec::new();
                    while !self.at(&TokenKind::RightParen) {
                        args.push(self.parse_expression()?);
                        if !self.eat(&TokenKind::Comma)? {
                            break;
                        }
                    }
                    self.expect(&TokenKind::RightParen)?;
                    expr = self.make_call(expr, args)?;
                }
                _ => {
                    // A bare function or method reference in value
                    // position is an implicit zero-argument call.
                    // Assignment targets never reach here: result
                    // assignment is intercepted at statement level.
                    if matches!(
                        expr.kind,
                        ExprKind::FunctionRef { .. } | ExprKind::Method { .. }
                    ) {
                        expr = self.make_call(expr, Vec::new())?;
                    }
                    return Ok(expr);
                }
            }
        }
    }

    fn make_index(&mut self, base: Expr, indices: Vec<Expr>) -> Result<Expr, ParseError> {
        let loc = base.loc.clone();
        for i in &indices {
            if !self.arena.is_integral(i.ty) {
                self.error_at(i.loc.clone(), "array index must be integral");
            }
        }
        match self.arena.get(base.ty).clone() {
            Type::Array { element, ranges } => {
                if indices.len() > ranges.len() {
                    return Err(self.error_at(loc, "too many indices"));
                }
                let ty = if indices.len() == ranges.len() {
                    element
                } else {
                    // Partial indexing peels leading dimensions.
                    let rest = ranges[indices.len()..].to_vec();
                    self.arena.add(Type::Array {
                        element,
                        ranges: rest,
                    })
                };
                Ok(Expr::new(
                    ExprKind::ArrayIndex {
                        base: Box::new(base),
                        indices,
                    },
                    ty,
                    loc,
                ))
            }
            Type::String { .. } => {
                if indices.len() != 1 {
                    return Err(self.error_at(loc, "strings take a single index"));
                }
                Ok(Expr::new(
                    ExprKind::ArrayIndex {
                        base: Box::new(base),
                        indices,
                    },
                    self.arena.char,
                    loc,
                ))
            }
            _ => Err(self.error_at(loc, "indexing needs an array or string")),
        }
    }

    fn make_field(&mut self, base: Expr, field: String) -> Result<Expr, ParseError> {
        let loc = base.loc.clone();
        match self.arena.kind(base.ty) {
            TypeKind::Record => {
                match self.find_record_field(base.ty, &field) {
                    Some((sel, ty)) => Ok(Expr::new(
                        ExprKind::Field {
                            base: Box::new(base),
                            sel,
                        },
                        ty,
                        loc,
                    )),
                    None => Err(self.error_at(loc, format!("no field '{}'", field))),
                }
            }
            TypeKind::Class => {
                if let Some((m, _)) = self.arena.class_member(base.ty, &field) {
                    let class = base.ty;
                    return Ok(Expr::new(
                        ExprKind::Method {
                            base: Box::new(base),
                            sel: MethodSel {
                                class,
                                name: m.name.clone(),
                                vtable_index: m.vtable_index,
                                is_static: m.is_static,
                            },
                        },
                        m.sig.ret,
                        loc,
                    ));
                }
                match self.arena.class_field(base.ty, &field) {
                    Some((_, ty)) => Ok(Expr::new(
                        ExprKind::Field {
                            base: Box::new(base),
                            sel: FieldSel::Class { name: field },
                        },
                        ty,
                        loc,
                    )),
                    None => Err(self.error_at(loc, format!("no field '{}'", field))),
                }
            }
            _ => Err(self.error_at(loc, "field selection needs a record or object")),
        }
    }

    fn find_record_field(&self, rec: TypeId, name: &str) -> Option<(FieldSel, TypeId)> {
        let Type::Record { fields, variant } = self.arena.get(rec) else {
            return None;
        };
        if let Some(index) = fields
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case(name))
        {
            return Some((FieldSel::Record { index }, fields[index].ty));
        }
        if let Some(v) = variant {
            if let Type::Variant { alts } = self.arena.get(*v) {
                for (alt, a) in alts.iter().enumerate() {
                    if let Type::Record { fields, .. } = self.arena.get(a.ty) {
                        if let Some(index) = fields
                            .iter()
                            .position(|f| f.name.eq_ignore_ascii_case(name))
                        {
                            return Some((
                                FieldSel::Variant { alt, index },
                                fields[index].ty,
                            ));
                        }
                    }
                }
            }
        }
        None
    }

    fn make_call(&mut self, callee: Expr, args: Vec<Expr>) -> Result<Expr, ParseError> {
        let loc = callee.loc.clone();
        match &callee.kind {
            ExprKind::FunctionRef { proto, .. } => {
                let proto = proto.clone();
                let (params, ret) = {
                    let p = proto.borrow();
                    (p.args.clone(), p.ret)
                };
                let args = self.check_call_args(&params, args)?;
                Ok(Expr::new(
                    ExprKind::Call {
                        callee: Box::new(callee),
                        args,
                        proto: Some(proto),
                    },
                    ret,
                    loc,
                ))
            }
            ExprKind::Method { sel, .. } => {
                let (m, _) = self
                    .arena
                    .class_member(sel.class, &sel.name)
                    .expect("method resolved during selection");
                // For instance methods sig.params[0] is self,
                // supplied by emission.
                let skip = if m.is_static { 0 } else { 1 };
                let params: Vec<VarDef> = m.sig.params[skip..]
                    .iter()
                    .enumerate()
                    .map(|(i, p)| VarDef {
                        name: format!("arg{}", i),
                        ty: p.ty,
                        is_ref: p.by_ref,
                    })
                    .collect();
                let args = self.check_call_args(&params, args)?;
                Ok(Expr::new(
                    ExprKind::Call {
                        callee: Box::new(callee),
                        args,
                        proto: None,
                    },
                    m.sig.ret,
                    loc,
                ))
            }
            _ => Err(self.error_at(loc, "expression is not callable")),
        }
    }

    fn check_call_args(
        &mut self,
        params: &[VarDef],
        mut args: Vec<Expr>,
    ) -> Result<Vec<Expr>, ParseError> {
        if params.len() != args.len() {
            let loc = self.loc();
            self.error_at(
                loc,
                format!("expected {} argument(s), got {}", params.len(), args.len()),
            );
            return Ok(args);
        }
        for (p, a) in params.iter().zip(args.iter_mut()) {
            self.adopt_set_context(p.ty, a);
            if p.is_ref {
                if !a.is_addressable() {
                    self.error_at(a.loc.clone(), "var argument must be addressable");
                } else if !self.arena.same_as(self.arena.base_of(p.ty), self.arena.base_of(a.ty))
                {
                    self.error_at(
                        a.loc.clone(),
                        format!(
                            "var argument type {} does not match {}",
                            self.arena.describe(a.ty),
                            self.arena.describe(p.ty)
                        ),
                    );
                }
            } else if !self.arena.assignable_type(p.ty, a.ty)
                && self.arena.compatible_type(p.ty, a.ty).is_none()
            {
                self.error_at(
                    a.loc.clone(),
                    format!(
                        "argument type {} does not match parameter type {}",
                        self.arena.describe(a.ty),
                        self.arena.describe(p.ty)
                    ),
                );
            }
        }
        Ok(args)
    }

    /// Wrap a bare function/method reference into a zero-argument
    /// call; anything else passes through.
    fn make_implicit_call(&mut self, expr: Expr) -> Result<Expr, ParseError> {
        match &expr.kind {
            ExprKind::FunctionRef { .. } | ExprKind::Method { .. } => {
                self.make_call(expr, Vec::new())
            }
            _ => Ok(expr),
        }
    }
}
