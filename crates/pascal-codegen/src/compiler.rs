/// Cranelift code generation: Pascal AST → native object file.
///
/// The compiler translates a parsed (and closure-transformed)
/// `Program` into Cranelift IR and emits a `.o` object file. A
/// subsequent linker step (driven by the CLI) joins it with
/// `libpascal_runtime.a` to produce an executable.
///
/// # Value representation
///
/// | Pascal type     | Representation  | CL type |
/// |-----------------|-----------------|---------|
/// | integer, enum   | i32             | I32     |
/// | int64           | i64             | I64     |
/// | real            | f64             | F64     |
/// | char, boolean   | i8              | I8      |
/// | pointer         | address         | I64     |
/// | array, record, object, set, string, file | memory; expressions evaluate to the address | I64 |
///
/// Variables live in memory — stack slots for locals, data objects
/// for globals — and are loaded/stored at each use, which is what the
/// for-loop and closure-capture semantics want. Element and field
/// addresses are plain `base + offset` arithmetic computed from the
/// type arena's layout.
use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::{
    types, AbiParam, Block, Function as ClifFunc, InstBuilder, MemFlags, Signature, StackSlotData,
    StackSlotKind, UserFuncName, Value,
};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::{isa, verify_function, Context};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Switch};
use cranelift_module::{DataDescription, DataId, FuncId, Linkage, Module};
use cranelift_object::{ObjectBuilder, ObjectModule, ObjectProduct};
use target_lexicon::Triple;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use pascal_lexer::{Location, TokenKind};
use pascal_parser::ast::*;
use pascal_parser::scope::ScopeStack;
use pascal_types::{
    Scalar, Type, TypeArena, TypeId, TypeKind, SET_MASK, SET_POW2_BITS,
};

use crate::builtins;

/// The pointer type on the target (64-bit).
pub(crate) const PTR: types::Type = types::I64;

/// Byte offset of the buffer pointer inside the runtime file struct
/// `{ handle: i32, buffer: ptr, record_size: i32, is_text: u8 }`.
const FILE_BUFFER_OFFSET: i32 = 8;
const FILE_RECORD_SIZE_OFFSET: i32 = 16;
const FILE_IS_TEXT_OFFSET: i32 = 20;

/// Default text-output field widths when the program gives none.
const DEFAULT_INT_WIDTH: i64 = 13;
const DEFAULT_REAL_WIDTH: i64 = 15;

#[derive(Debug, Clone)]
pub struct CodegenError {
    pub msg: String,
    pub loc: Option<Location>,
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.loc {
            Some(loc) => write!(f, "{}: {}", loc, self.msg),
            None => write!(f, "{}", self.msg),
        }
    }
}

impl std::error::Error for CodegenError {}

pub(crate) fn cl_scalar(s: Scalar) -> types::Type {
    match s {
        Scalar::I8 => types::I8,
        Scalar::I32 => types::I32,
        Scalar::I64 => types::I64,
        Scalar::F64 => types::F64,
        Scalar::Ptr => PTR,
    }
}

/// Where a named variable lives.
#[derive(Clone, Copy)]
enum Place {
    /// The address value (a stack slot's address, or an incoming
    /// by-reference parameter).
    Addr(Value),
    /// A module data object, materialized per use.
    Global(DataId),
}

#[derive(Clone, Copy)]
struct AddrEntry {
    place: Place,
    ty: TypeId,
}

// ─── Module-level compiler ────────────────────────────────────────────

pub struct Compiler {
    module: ObjectModule,
    flags: settings::Flags,
    /// Runtime extern functions (__write_int etc. → FuncId).
    runtime_funcs: HashMap<String, FuncId>,
    /// Mangled Pascal function name → FuncId.
    declared_funcs: HashMap<String, FuncId>,
    /// Lowercased global variable name → data object.
    globals: HashMap<String, (DataId, TypeId)>,
    /// Class name → vtable data object.
    vtables: HashMap<String, DataId>,
    string_literals: u32,
    errors: u32,
}

impl Compiler {
    fn new() -> Result<Self, CodegenError> {
        let mut settings_builder = settings::builder();
        settings_builder
            .set("opt_level", "speed")
            .expect("codegen: invalid cranelift setting opt_level");
        settings_builder
            .set("is_pic", "true")
            .expect("codegen: invalid cranelift setting is_pic");
        let triple = Triple::from_str(&target_lexicon::HOST.to_string())
            .expect("codegen: unsupported host triple");
        let flags = settings::Flags::new(settings_builder);
        let isa = isa::lookup(triple)
            .map_err(|e| CodegenError {
                msg: format!("unsupported target: {}", e),
                loc: None,
            })?
            .finish(flags.clone())
            .map_err(|e| CodegenError {
                msg: format!("failed to build ISA: {}", e),
                loc: None,
            })?;

        let obj_builder =
            ObjectBuilder::new(isa, "pascal_output", cranelift_module::default_libcall_names())
                .expect("codegen: failed to create object builder");
        let module = ObjectModule::new(obj_builder);

        Ok(Compiler {
            module,
            flags,
            runtime_funcs: HashMap::new(),
            declared_funcs: HashMap::new(),
            globals: HashMap::new(),
            vtables: HashMap::new(),
            string_literals: 0,
            errors: 0,
        })
    }

    /// Declare an extern "C" runtime function so we can call it.
    fn declare_runtime_func(
        &mut self,
        name: &str,
        params: &[types::Type],
        returns: &[types::Type],
    ) -> FuncId {
        if let Some(&id) = self.runtime_funcs.get(name) {
            return id;
        }
        let mut sig = self.module.make_signature();
        for &p in params {
            sig.params.push(AbiParam::new(p));
        }
        for &r in returns {
            sig.returns.push(AbiParam::new(r));
        }
        let id = self
            .module
            .declare_function(name, Linkage::Import, &sig)
            .expect("codegen: failed to declare runtime function");
        self.runtime_funcs.insert(name.to_string(), id);
        id
    }

    /// The fixed runtime ABI: write/read helpers, set helpers, heap
    /// and file management, plus libc/libm entries.
    fn declare_all_runtime_funcs(&mut self) {
        let i8t = types::I8;
        let i32t = types::I32;
        let i64t = types::I64;
        let f64t = types::F64;

        // Write family. A null file pointer selects standard output.
        self.declare_runtime_func("__write_int", &[PTR, i64t, i32t], &[]);
        self.declare_runtime_func("__write_int64", &[PTR, i64t, i32t], &[]);
        self.declare_runtime_func("__write_real", &[PTR, f64t, i32t, i32t], &[]);
        self.declare_runtime_func("__write_char", &[PTR, i8t, i32t], &[]);
        self.declare_runtime_func("__write_bool", &[PTR, i8t, i32t], &[]);
        self.declare_runtime_func("__write_str", &[PTR, PTR, i32t], &[]);
        self.declare_runtime_func("__write_bin", &[PTR, PTR], &[]);
        self.declare_runtime_func("__write_nl", &[PTR], &[]);

        // Read family; helpers return the parsed value.
        self.declare_runtime_func("__read_int", &[PTR], &[i64t]);
        self.declare_runtime_func("__read_real", &[PTR], &[f64t]);
        self.declare_runtime_func("__read_chr", &[PTR], &[i8t]);
        self.declare_runtime_func("__read_bin", &[PTR, PTR], &[]);
        self.declare_runtime_func("__read_nl", &[PTR], &[]);

        // Set helpers over 32-bit words; the word count rides along.
        self.declare_runtime_func("__SetUnion", &[PTR, PTR, PTR, i32t], &[]);
        self.declare_runtime_func("__SetDiff", &[PTR, PTR, PTR, i32t], &[]);
        self.declare_runtime_func("__SetIntersect", &[PTR, PTR, PTR, i32t], &[]);
        self.declare_runtime_func("__SetEqual", &[PTR, PTR, i32t], &[i8t]);
        self.declare_runtime_func("__SetContains", &[PTR, PTR, i32t], &[i8t]);

        // Heap and files.
        self.declare_runtime_func("__new", &[i64t], &[PTR]);
        self.declare_runtime_func("__dispose", &[PTR], &[]);
        self.declare_runtime_func("__assign", &[PTR, PTR, i32t, i8t], &[]);
        self.declare_runtime_func("__reset", &[PTR], &[]);
        self.declare_runtime_func("__rewrite", &[PTR], &[]);
        self.declare_runtime_func("__close", &[PTR], &[]);
        self.declare_runtime_func("__eof", &[PTR], &[i8t]);
        self.declare_runtime_func("__eoln", &[PTR], &[i8t]);

        // libc / libm.
        self.declare_runtime_func("memcpy", &[PTR, PTR, i64t], &[PTR]);
        for name in ["sqrt", "sin", "cos", "atan", "log", "exp"] {
            self.declare_runtime_func(name, &[f64t], &[f64t]);
        }
    }

    /// Intern a string literal as a length-prefixed data object.
    fn declare_string_data(&mut self, s: &str) -> DataId {
        let name = format!("__pas_str_{}", self.string_literals);
        self.string_literals += 1;
        let data_id = self
            .module
            .declare_data(&name, Linkage::Local, false, false)
            .expect("codegen: failed to declare string data");
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.push(s.len().min(255) as u8);
        bytes.extend_from_slice(&s.as_bytes()[..s.len().min(255)]);
        let mut desc = DataDescription::new();
        desc.define(bytes.into_boxed_slice());
        self.module
            .define_data(data_id, &desc)
            .expect("codegen: failed to define string data");
        data_id
    }

    /// Declare one zero-initialized mutable global.
    fn declare_global(&mut self, name: &str, ty: TypeId, size: u32) {
        let key = name.to_ascii_lowercase();
        if self.globals.contains_key(&key) {
            return;
        }
        let data_id = self
            .module
            .declare_data(&format!("__pas_g_{}", key), Linkage::Local, true, false)
            .expect("codegen: failed to declare global");
        let mut desc = DataDescription::new();
        desc.define_zeroinit(size.max(1) as usize);
        self.module
            .define_data(data_id, &desc)
            .expect("codegen: failed to define global");
        self.globals.insert(key, (data_id, ty));
    }

    /// Signature for a Pascal prototype. By-reference parameters and
    /// compound values travel as pointers; results must be scalar.
    fn make_sig(&mut self, arena: &TypeArena, proto: &Prototype) -> Result<Signature, CodegenError> {
        let mut sig = self.module.make_signature();
        for arg in &proto.args {
            let ct = if arg.is_ref {
                PTR
            } else {
                match arena.scalar(arg.ty) {
                    Some(s) => cl_scalar(s),
                    None => PTR,
                }
            };
            sig.params.push(AbiParam::new(ct));
        }
        if !arena.same_as(proto.ret, arena.void) {
            match arena.scalar(proto.ret) {
                Some(s) => sig.returns.push(AbiParam::new(cl_scalar(s))),
                None => {
                    return Err(CodegenError {
                        msg: format!("function '{}' must return a scalar value", proto.name),
                        loc: None,
                    })
                }
            }
        }
        Ok(sig)
    }

    /// Declare a function (and its nested functions) under its
    /// mangled name: `__PascalMain` stays literal, everything else is
    /// the enclosing chain with a leading `P`.
    fn declare_fn_tree(
        &mut self,
        arena: &TypeArena,
        f: &Function,
        prefix: &str,
    ) -> Result<(), CodegenError> {
        let (name, mangled) = {
            let p = f.proto.borrow();
            let mangled = mangle(prefix, &p.name);
            (p.name.clone(), mangled)
        };
        let sig = self.make_sig(arena, &f.proto.borrow())?;
        let linkage = if name == "__PascalMain" {
            Linkage::Export
        } else {
            Linkage::Local
        };
        let id = self
            .module
            .declare_function(&mangled, linkage, &sig)
            .expect("codegen: failed to declare function");
        self.declared_funcs.insert(mangled.clone(), id);
        for n in &f.nested {
            self.declare_fn_tree(arena, n, &mangled)?;
        }
        Ok(())
    }

    /// Emit one vtable per class that carries one: an array of
    /// function-address slots in declaration order.
    fn define_vtables(&mut self, arena: &TypeArena) -> Result<(), CodegenError> {
        for id in arena.type_ids() {
            let Type::Class { name, .. } = arena.get(id) else {
                continue;
            };
            if !arena.class_has_vtable(id) {
                continue;
            }
            let slots = arena.class_vtable(id).to_vec();
            let mut desc = DataDescription::new();
            desc.define(vec![0u8; slots.len() * 8].into_boxed_slice());
            for (i, slot) in slots.iter().enumerate() {
                let sym = format!("P.{}.{}", slot.impl_class, slot.name);
                let fid = match self.declared_funcs.get(&sym) {
                    Some(&fid) => fid,
                    None => {
                        return Err(self.report(
                            None,
                            format!(
                                "virtual method '{}.{}' has no body",
                                slot.impl_class, slot.name
                            ),
                        ));
                    }
                };
                let fref = self.module.declare_func_in_data(fid, &mut desc);
                desc.write_function_addr((i * 8) as u32, fref);
            }
            let data_id = self
                .module
                .declare_data(&format!("vtable_{}", name), Linkage::Local, false, false)
                .expect("codegen: failed to declare vtable");
            self.module
                .define_data(data_id, &desc)
                .expect("codegen: failed to define vtable");
            self.vtables.insert(name.clone(), data_id);
        }
        Ok(())
    }

    fn report(&mut self, loc: Option<Location>, msg: impl Into<String>) -> CodegenError {
        let err = CodegenError {
            msg: msg.into(),
            loc,
        };
        eprintln!("{}", err);
        self.errors += 1;
        err
    }
}

fn mangle(prefix: &str, name: &str) -> String {
    if name == "__PascalMain" {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// Compile a whole program to object-file bytes.
pub fn compile(program: &Program, arena: &TypeArena) -> Result<Vec<u8>, CodegenError> {
    let mut comp = Compiler::new()?;
    comp.declare_all_runtime_funcs();

    for g in &program.globals {
        comp.declare_global(&g.name, g.ty, arena.size(g.ty));
    }

    // First pass: declare everything so forward references and
    // vtable relocations resolve.
    for f in &program.functions {
        comp.declare_fn_tree(arena, f, "P")?;
    }
    comp.define_vtables(arena)?;

    // Second pass: emit bodies. The mangle map mirrors the scope
    // stack: one level per enclosing function.
    let mut mangles: ScopeStack<String> = ScopeStack::new();
    for f in &program.functions {
        let p = f.proto.borrow();
        mangles.add(&p.name, mangle("P", &p.name));
    }
    for f in &program.functions {
        if let Err(_e) = emit_function(&mut comp, arena, program, f, "P", &mut mangles) {
            // Diagnostic already printed and counted; the enclosing
            // function is abandoned and compilation continues.
        }
    }

    if comp.errors > 0 {
        return Err(CodegenError {
            msg: format!("{} error(s)", comp.errors),
            loc: None,
        });
    }

    let product: ObjectProduct = comp.module.finish();
    product.emit().map_err(|e| CodegenError {
        msg: format!("failed to emit object file: {}", e),
        loc: None,
    })
}

// ─── Function-level emission ──────────────────────────────────────────

/// Per-function emission state.
pub(crate) struct FuncCtx<'a, 'b> {
    pub(crate) comp: &'a mut Compiler,
    pub(crate) builder: FunctionBuilder<'b>,
    pub(crate) arena: &'a TypeArena,
    /// Address table: variable name → storage place.
    addrs: ScopeStack<AddrEntry>,
    /// Source name → mangled symbol, kept in sync with the scopes.
    mangles: &'a ScopeStack<String>,
}

impl<'a, 'b> FuncCtx<'a, 'b> {
    pub(crate) fn get_runtime_func_ref(&mut self, name: &str) -> cranelift_codegen::ir::FuncRef {
        let func_id = *self
            .comp
            .runtime_funcs
            .get(name)
            .unwrap_or_else(|| panic!("runtime function '{}' not declared", name));
        self.comp
            .module
            .declare_func_in_func(func_id, self.builder.func)
    }

    fn get_pascal_func_ref(&mut self, mangled: &str) -> Option<cranelift_codegen::ir::FuncRef> {
        let func_id = *self.comp.declared_funcs.get(mangled)?;
        Some(
            self.comp
                .module
                .declare_func_in_func(func_id, self.builder.func),
        )
    }

    /// A fresh stack slot of the given size/alignment; returns its
    /// address.
    pub(crate) fn stack_slot(&mut self, size: u32, align: u32) -> Value {
        let align_shift = align.max(1).trailing_zeros() as u8;
        let ss = self.builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            size.max(1),
            align_shift,
        ));
        self.builder.ins().stack_addr(PTR, ss, 0)
    }

    /// Materialize the address of a named storage place.
    fn place_addr(&mut self, place: Place) -> Value {
        match place {
            Place::Addr(v) => v,
            Place::Global(data_id) => {
                let gv = self
                    .comp
                    .module
                    .declare_data_in_func(data_id, self.builder.func);
                self.builder.ins().global_value(PTR, gv)
            }
        }
    }

    fn lookup_var(&mut self, name: &str) -> Option<AddrEntry> {
        if let Some(e) = self.addrs.find(name) {
            return Some(*e);
        }
        let (data_id, ty) = *self.comp.globals.get(&name.to_ascii_lowercase())?;
        Some(AddrEntry {
            place: Place::Global(data_id),
            ty,
        })
    }

    pub(crate) fn error(&mut self, loc: &Location, msg: impl Into<String>) -> CodegenError {
        self.comp.report(Some(loc.clone()), msg)
    }

    /// The address of a length-prefixed string literal.
    pub(crate) fn string_literal_addr(&mut self, s: &str) -> Value {
        let data_id = self.comp.declare_string_data(s);
        let gv = self
            .comp
            .module
            .declare_data_in_func(data_id, self.builder.func);
        self.builder.ins().global_value(PTR, gv)
    }

    /// memcpy(dest, src, n) through the libc import.
    pub(crate) fn emit_memcpy(&mut self, dest: Value, src: Value, size: u32) {
        let func_ref = self.get_runtime_func_ref("memcpy");
        let n = self.builder.ins().iconst(types::I64, size as i64);
        self.builder.ins().call(func_ref, &[dest, src, n]);
    }

    // ── Numeric adjustment ─────────────────────────────────────

    /// Convert `v` of Pascal type `from` to the target scalar. Char
    /// and boolean widen unsigned, integers signed; integers convert
    /// to real through `fcvt_from_sint`.
    pub(crate) fn adjust(&mut self, v: Value, from: TypeId, to: types::Type) -> Value {
        let from_scalar = match self.arena.scalar(from) {
            Some(s) => cl_scalar(s),
            None => return v,
        };
        if from_scalar == to {
            return v;
        }
        let unsigned = matches!(
            self.arena.kind(self.arena.base_of(from)),
            TypeKind::Char | TypeKind::Boolean
        );
        match (from_scalar, to) {
            (types::F64, _) | (_, types::F64) => {
                if from_scalar == types::F64 {
                    v // no implicit real → integer conversion
                } else {
                    let wide = if from_scalar == types::I64 {
                        v
                    } else if unsigned {
                        self.builder.ins().uextend(types::I64, v)
                    } else {
                        self.builder.ins().sextend(types::I64, v)
                    };
                    self.builder.ins().fcvt_from_sint(types::F64, wide)
                }
            }
            (a, b) if a.bytes() < b.bytes() => {
                if unsigned {
                    self.builder.ins().uextend(b, v)
                } else {
                    self.builder.ins().sextend(b, v)
                }
            }
            (a, b) if a.bytes() > b.bytes() => self.builder.ins().ireduce(b, v),
            _ => v,
        }
    }
}

/// Emit one function and, first, its nested functions.
fn emit_function(
    comp: &mut Compiler,
    arena: &TypeArena,
    program: &Program,
    f: &Function,
    prefix: &str,
    mangles: &mut ScopeStack<String>,
) -> Result<(), CodegenError> {
    let (proto_name, mangled, args, ret) = {
        let p = f.proto.borrow();
        (
            p.name.clone(),
            mangle(prefix, &p.name),
            p.args.clone(),
            p.ret,
        )
    };

    // Nested functions see one another through a pushed mangle scope.
    mangles.push_scope();
    for n in &f.nested {
        let nname = n.proto.borrow().name.clone();
        mangles.add(&nname, format!("{}.{}", mangled, nname));
    }
    let nested_result: Result<(), CodegenError> = f
        .nested
        .iter()
        .try_for_each(|n| emit_function(comp, arena, program, n, &mangled, mangles));
    // A failed nested function was reported; keep going with the body.
    let _ = nested_result;

    let func_id = comp.declared_funcs[&mangled];
    let sig = comp
        .module
        .declarations()
        .get_function_decl(func_id)
        .signature
        .clone();

    let mut func = ClifFunc::new();
    func.signature = sig;
    func.name = UserFuncName::user(0, func_id.as_u32());

    let mut fb_ctx = FunctionBuilderContext::new();
    let builder = FunctionBuilder::new(&mut func, &mut fb_ctx);

    let mut ctx = FuncCtx {
        comp,
        builder,
        arena,
        addrs: ScopeStack::new(),
        mangles,
    };

    let entry_block = ctx.builder.create_block();
    ctx.builder
        .append_block_params_for_function_params(entry_block);
    ctx.builder.switch_to_block(entry_block);
    ctx.builder.seal_block(entry_block);

    // Parameters: by-reference parameters are addresses already;
    // by-value scalars get a slot so they are addressable; by-value
    // compounds are copied into a local slot.
    let param_vals: Vec<Value> = ctx.builder.block_params(entry_block).to_vec();
    for (arg, &incoming) in args.iter().zip(param_vals.iter()) {
        let entry = if arg.is_ref {
            AddrEntry {
                place: Place::Addr(incoming),
                ty: arg.ty,
            }
        } else if let Some(s) = arena.scalar(arg.ty) {
            let ct = cl_scalar(s);
            let slot = ctx.stack_slot(ct.bytes(), ct.bytes());
            ctx.builder
                .ins()
                .store(MemFlags::trusted(), incoming, slot, 0);
            AddrEntry {
                place: Place::Addr(slot),
                ty: arg.ty,
            }
        } else {
            let size = arena.size(arg.ty);
            let slot = ctx.stack_slot(size, arena.align(arg.ty));
            ctx.emit_memcpy(slot, incoming, size);
            AddrEntry {
                place: Place::Addr(slot),
                ty: arg.ty,
            }
        };
        ctx.addrs.add(&arg.name, entry);
    }

    // Locals, with their initial images (vtable pointers).
    for local in &f.locals {
        let slot = ctx.stack_slot(arena.size(local.ty), arena.align(local.ty));
        ctx.addrs.add(
            &local.name,
            AddrEntry {
                place: Place::Addr(slot),
                ty: local.ty,
            },
        );
        emit_init_image(&mut ctx, slot, local.ty);
    }

    // The result slot is addressed by the function's own name.
    let has_result = !arena.same_as(ret, arena.void);
    if has_result {
        let s = arena.scalar(ret).expect("checked when declaring");
        let ct = cl_scalar(s);
        let slot = ctx.stack_slot(ct.bytes(), ct.bytes());
        let zero = zero_value(&mut ctx.builder, ct);
        ctx.builder.ins().store(MemFlags::trusted(), zero, slot, 0);
        ctx.addrs.add(
            &proto_name,
            AddrEntry {
                place: Place::Addr(slot),
                ty: ret,
            },
        );
    }

    if mangled == "__PascalMain" {
        emit_main_prologue(&mut ctx, program);
    }

    let body_result = emit_stmt(&mut ctx, &f.body);

    if body_result.is_ok() {
        if has_result {
            let entry = ctx.addrs.find(&proto_name).copied().unwrap();
            let addr = ctx.place_addr(entry.place);
            let ct = cl_scalar(arena.scalar(ret).unwrap());
            let v = ctx.builder.ins().load(ct, MemFlags::trusted(), addr, 0);
            ctx.builder.ins().return_(&[v]);
        } else {
            ctx.builder.ins().return_(&[]);
        }
        ctx.builder.finalize();

        if std::env::var("CLIF_DUMP").is_ok() {
            eprintln!("=== {} IR ===\n{}", mangled, func.display());
        }
        // The backend's own check before optimization + encoding.
        if let Err(errors) = verify_function(&func, &comp.flags) {
            return Err(comp.report(
                Some(f.loc.clone()),
                format!("internal: IR verification failed for {}: {}", mangled, errors),
            ));
        }
        let mut clif_ctx = Context::for_function(func);
        comp.module
            .define_function(func_id, &mut clif_ctx)
            .expect("codegen: failed to define function");
        mangles.pop_scope();
        Ok(())
    } else {
        mangles.pop_scope();
        body_result
    }
}

/// `__PascalMain` starts by wiring the standard text files and the
/// initial images of global variables.
fn emit_main_prologue(ctx: &mut FuncCtx, program: &Program) {
    for (name, handle) in [("input", 0i64), ("output", 1i64)] {
        if let Some(entry) = ctx.lookup_var(name) {
            let addr = ctx.place_addr(entry.place);
            let h = ctx.builder.ins().iconst(types::I32, handle);
            ctx.builder.ins().store(MemFlags::trusted(), h, addr, 0);
            let rs = ctx.builder.ins().iconst(types::I32, 1);
            ctx.builder
                .ins()
                .store(MemFlags::trusted(), rs, addr, FILE_RECORD_SIZE_OFFSET);
            let t = ctx.builder.ins().iconst(types::I8, 1);
            ctx.builder
                .ins()
                .store(MemFlags::trusted(), t, addr, FILE_IS_TEXT_OFFSET);
        }
    }
    for g in &program.globals {
        if let Some(entry) = ctx.lookup_var(&g.name) {
            let addr = ctx.place_addr(entry.place);
            emit_init_image(ctx, addr, g.ty);
        }
    }
}

/// Store the vtable pointers a fresh variable of this type needs.
pub(crate) fn emit_init_image(ctx: &mut FuncCtx, base: Value, ty: TypeId) {
    for (offset, class_id) in ctx.arena.init_image(ty) {
        let Some(name) = ctx.arena.class_name(class_id) else {
            continue;
        };
        let Some(&data_id) = ctx.comp.vtables.get(name) else {
            continue;
        };
        let gv = ctx
            .comp
            .module
            .declare_data_in_func(data_id, ctx.builder.func);
        let vt = ctx.builder.ins().global_value(PTR, gv);
        ctx.builder
            .ins()
            .store(MemFlags::trusted(), vt, base, offset as i32);
    }
}

pub(crate) fn zero_value(builder: &mut FunctionBuilder, ct: types::Type) -> Value {
    if ct == types::F64 {
        builder.ins().f64const(0.0)
    } else {
        builder.ins().iconst(ct, 0)
    }
}

// ─── Statements ───────────────────────────────────────────────────────

fn emit_stmt(ctx: &mut FuncCtx, stmt: &Stmt) -> Result<(), CodegenError> {
    match stmt {
        Stmt::Empty => Ok(()),
        Stmt::Block(stmts) => {
            for s in stmts {
                emit_stmt(ctx, s)?;
            }
            Ok(())
        }
        Stmt::Assign { lhs, rhs } => emit_assign(ctx, lhs, rhs),
        Stmt::Call(e) => {
            emit_expr(ctx, e)?;
            Ok(())
        }
        Stmt::If {
            cond,
            then_branch,
            else_branch,
        } => emit_if(ctx, cond, then_branch, else_branch.as_deref()),
        Stmt::While { cond, body } => emit_while(ctx, cond, body),
        Stmt::Repeat { body, cond } => emit_repeat(ctx, body, cond),
        Stmt::For {
            var,
            start,
            end,
            down,
            body,
        } => emit_for(ctx, var, start, end, *down, body),
        Stmt::Case {
            selector,
            branches,
            otherwise,
        } => emit_case(ctx, selector, branches, otherwise.as_deref()),
        Stmt::With { body } => emit_stmt(ctx, body),
        Stmt::Write {
            file,
            args,
            newline,
        } => emit_write(ctx, file.as_ref(), args, *newline),
        Stmt::Read {
            file,
            args,
            newline,
        } => emit_read(ctx, file.as_ref(), args, *newline),
    }
}

fn emit_assign(ctx: &mut FuncCtx, lhs: &Expr, rhs: &Expr) -> Result<(), CodegenError> {
    let dest = emit_addr(ctx, lhs)?;

    // String destinations have their own store protocol.
    if ctx.arena.kind(lhs.ty) == TypeKind::String {
        return emit_string_assign(ctx, dest, lhs.ty, rhs);
    }

    if ctx.arena.is_compound(lhs.ty) {
        let src = expect_value(ctx, rhs)?;
        // Copy the destination's size: a subclass value assigned to
        // an ancestor location copies the ancestor's image.
        ctx.emit_memcpy(dest, src, ctx.arena.size(lhs.ty));
        return Ok(());
    }

    let v = expect_value(ctx, rhs)?;
    let ct = cl_scalar(ctx.arena.scalar(lhs.ty).expect("scalar store"));
    let v = ctx.adjust(v, rhs.ty, ct);
    ctx.builder.ins().store(MemFlags::trusted(), v, dest, 0);
    Ok(())
}

/// `s := 'c'` writes length 1 plus the character; `s := 'text'`
/// copies the literal image; `s := t` copies the source's live bytes.
fn emit_string_assign(
    ctx: &mut FuncCtx,
    dest: Value,
    dest_ty: TypeId,
    rhs: &Expr,
) -> Result<(), CodegenError> {
    match &rhs.kind {
        ExprKind::CharLit(_) => {
            let c = expect_value(ctx, rhs)?;
            let one = ctx.builder.ins().iconst(types::I8, 1);
            ctx.builder.ins().store(MemFlags::trusted(), one, dest, 0);
            ctx.builder.ins().store(MemFlags::trusted(), c, dest, 1);
            Ok(())
        }
        ExprKind::StringLit(s) => {
            let src = ctx.string_literal_addr(s);
            let cap = ctx.arena.size(dest_ty).saturating_sub(1);
            let len = s.len().min(255) as u32;
            ctx.emit_memcpy(dest, src, len.min(cap) + 1);
            if len > cap {
                // Over-long literals truncate; the length byte says so.
                let l = ctx.builder.ins().iconst(types::I8, cap as i64);
                ctx.builder.ins().store(MemFlags::trusted(), l, dest, 0);
            }
            Ok(())
        }
        _ if ctx.arena.kind(rhs.ty) == TypeKind::Char => {
            let c = expect_value(ctx, rhs)?;
            let one = ctx.builder.ins().iconst(types::I8, 1);
            ctx.builder.ins().store(MemFlags::trusted(), one, dest, 0);
            ctx.builder.ins().store(MemFlags::trusted(), c, dest, 1);
            Ok(())
        }
        _ => {
            let src = expect_value(ctx, rhs)?;
            let n = ctx.arena.size(rhs.ty).min(ctx.arena.size(dest_ty));
            ctx.emit_memcpy(dest, src, n);
            Ok(())
        }
    }
}

fn emit_cond(ctx: &mut FuncCtx, cond: &Expr) -> Result<Value, CodegenError> {
    expect_value(ctx, cond)
}

fn emit_if(
    ctx: &mut FuncCtx,
    cond: &Expr,
    then_branch: &Stmt,
    else_branch: Option<&Stmt>,
) -> Result<(), CodegenError> {
    let c = emit_cond(ctx, cond)?;
    let then_block = ctx.builder.create_block();
    let merge_block = ctx.builder.create_block();
    let else_block = if else_branch.is_some() {
        ctx.builder.create_block()
    } else {
        merge_block
    };

    ctx.builder.ins().brif(c, then_block, &[], else_block, &[]);

    ctx.builder.switch_to_block(then_block);
    ctx.builder.seal_block(then_block);
    emit_stmt(ctx, then_branch)?;
    ctx.builder.ins().jump(merge_block, &[]);

    if let Some(e) = else_branch {
        ctx.builder.switch_to_block(else_block);
        ctx.builder.seal_block(else_block);
        emit_stmt(ctx, e)?;
        ctx.builder.ins().jump(merge_block, &[]);
    }

    ctx.builder.switch_to_block(merge_block);
    ctx.builder.seal_block(merge_block);
    Ok(())
}

fn emit_while(ctx: &mut FuncCtx, cond: &Expr, body: &Stmt) -> Result<(), CodegenError> {
    let header = ctx.builder.create_block();
    let body_block = ctx.builder.create_block();
    let exit = ctx.builder.create_block();

    ctx.builder.ins().jump(header, &[]);
    ctx.builder.switch_to_block(header);
    let c = emit_cond(ctx, cond)?;
    ctx.builder.ins().brif(c, body_block, &[], exit, &[]);

    ctx.builder.switch_to_block(body_block);
    ctx.builder.seal_block(body_block);
    emit_stmt(ctx, body)?;
    ctx.builder.ins().jump(header, &[]);
    ctx.builder.seal_block(header);

    ctx.builder.switch_to_block(exit);
    ctx.builder.seal_block(exit);
    Ok(())
}

fn emit_repeat(ctx: &mut FuncCtx, body: &[Stmt], cond: &Expr) -> Result<(), CodegenError> {
    let body_block = ctx.builder.create_block();
    let exit = ctx.builder.create_block();

    ctx.builder.ins().jump(body_block, &[]);
    ctx.builder.switch_to_block(body_block);
    for s in body {
        emit_stmt(ctx, s)?;
    }
    // repeat..until loops run until the condition turns true.
    let c = emit_cond(ctx, cond)?;
    ctx.builder.ins().brif(c, exit, &[], body_block, &[]);
    ctx.builder.seal_block(body_block);

    ctx.builder.switch_to_block(exit);
    ctx.builder.seal_block(exit);
    Ok(())
}

/// The induction variable is a named variable, stored and re-loaded
/// each iteration; the limit is evaluated once, before the loop.
fn emit_for(
    ctx: &mut FuncCtx,
    var: &str,
    start: &Expr,
    end: &Expr,
    down: bool,
    body: &Stmt,
) -> Result<(), CodegenError> {
    let entry = match ctx.lookup_var(var) {
        Some(e) => e,
        None => return Err(ctx.error(&start.loc, format!("undefined variable '{}'", var))),
    };
    let var_addr = ctx.place_addr(entry.place);
    let ct = cl_scalar(
        ctx.arena
            .scalar(entry.ty)
            .expect("loop variable is integral"),
    );

    let s = expect_value(ctx, start)?;
    let s = ctx.adjust(s, start.ty, ct);
    ctx.builder.ins().store(MemFlags::trusted(), s, var_addr, 0);
    let limit = expect_value(ctx, end)?;
    let limit = ctx.adjust(limit, end.ty, ct);

    let header = ctx.builder.create_block();
    let body_block = ctx.builder.create_block();
    let exit = ctx.builder.create_block();

    ctx.builder.ins().jump(header, &[]);
    ctx.builder.switch_to_block(header);
    let cur = ctx
        .builder
        .ins()
        .load(ct, MemFlags::trusted(), var_addr, 0);
    let cc = if down {
        IntCC::SignedGreaterThanOrEqual
    } else {
        IntCC::SignedLessThanOrEqual
    };
    let c = ctx.builder.ins().icmp(cc, cur, limit);
    ctx.builder.ins().brif(c, body_block, &[], exit, &[]);

    ctx.builder.switch_to_block(body_block);
    ctx.builder.seal_block(body_block);
    emit_stmt(ctx, body)?;
    let cur = ctx
        .builder
        .ins()
        .load(ct, MemFlags::trusted(), var_addr, 0);
    let step = if down { -1 } else { 1 };
    let next = ctx.builder.ins().iadd_imm(cur, step);
    ctx.builder
        .ins()
        .store(MemFlags::trusted(), next, var_addr, 0);
    ctx.builder.ins().jump(header, &[]);
    ctx.builder.seal_block(header);

    ctx.builder.switch_to_block(exit);
    ctx.builder.seal_block(exit);
    Ok(())
}

/// Multiway dispatch on an integral selector. Non-negative label sets
/// go through the frontend's `Switch`; a label below zero falls back
/// to a compare chain.
fn emit_case(
    ctx: &mut FuncCtx,
    selector: &Expr,
    branches: &[CaseBranch],
    otherwise: Option<&Stmt>,
) -> Result<(), CodegenError> {
    let sel = expect_value(ctx, selector)?;
    let sel = ctx.adjust(sel, selector.ty, types::I64);

    let after = ctx.builder.create_block();
    let default_block = if otherwise.is_some() {
        ctx.builder.create_block()
    } else {
        after
    };
    let branch_blocks: Vec<Block> = branches.iter().map(|_| ctx.builder.create_block()).collect();

    let has_negative = branches.iter().any(|b| b.labels.iter().any(|&l| l < 0));
    if has_negative {
        for (b, &block) in branches.iter().zip(branch_blocks.iter()) {
            for &label in &b.labels {
                let next = ctx.builder.create_block();
                let c = ctx.builder.ins().icmp_imm(IntCC::Equal, sel, label);
                ctx.builder.ins().brif(c, block, &[], next, &[]);
                ctx.builder.switch_to_block(next);
                ctx.builder.seal_block(next);
            }
        }
        ctx.builder.ins().jump(default_block, &[]);
    } else {
        let mut switch = Switch::new();
        for (b, &block) in branches.iter().zip(branch_blocks.iter()) {
            for &label in &b.labels {
                switch.set_entry(label as u128, block);
            }
        }
        switch.emit(&mut ctx.builder, sel, default_block);
    }

    for (b, &block) in branches.iter().zip(branch_blocks.iter()) {
        ctx.builder.switch_to_block(block);
        ctx.builder.seal_block(block);
        emit_stmt(ctx, &b.body)?;
        ctx.builder.ins().jump(after, &[]);
    }

    if let Some(o) = otherwise {
        ctx.builder.switch_to_block(default_block);
        ctx.builder.seal_block(default_block);
        emit_stmt(ctx, o)?;
        ctx.builder.ins().jump(after, &[]);
    }

    ctx.builder.switch_to_block(after);
    ctx.builder.seal_block(after);
    Ok(())
}

// ─── write / read ─────────────────────────────────────────────────────

fn emit_file_arg(ctx: &mut FuncCtx, file: Option<&Expr>) -> Result<(Value, bool), CodegenError> {
    match file {
        Some(e) => {
            let addr = emit_addr(ctx, e)?;
            let is_text = matches!(ctx.arena.get(e.ty), Type::File { is_text: true, .. });
            Ok((addr, is_text))
        }
        // Null means the standard text device.
        None => Ok((ctx.builder.ins().iconst(PTR, 0), true)),
    }
}

fn emit_width(
    ctx: &mut FuncCtx,
    width: Option<&Expr>,
    default: i64,
) -> Result<Value, CodegenError> {
    match width {
        Some(w) => {
            let v = expect_value(ctx, w)?;
            Ok(ctx.adjust(v, w.ty, types::I32))
        }
        None => Ok(ctx.builder.ins().iconst(types::I32, default)),
    }
}

fn emit_write(
    ctx: &mut FuncCtx,
    file: Option<&Expr>,
    args: &[WriteArg],
    newline: bool,
) -> Result<(), CodegenError> {
    let (f, is_text) = emit_file_arg(ctx, file)?;

    for arg in args {
        if !is_text {
            // Binary files move whole records through the buffer.
            let addr = emit_addr(ctx, &arg.expr)?;
            let func_ref = ctx.get_runtime_func_ref("__write_bin");
            ctx.builder.ins().call(func_ref, &[f, addr]);
            continue;
        }
        let e = &arg.expr;
        let kind = ctx.arena.kind(ctx.arena.base_of(e.ty));
        match kind {
            TypeKind::Char => {
                let v = expect_value(ctx, e)?;
                let w = emit_width(ctx, arg.width.as_ref(), 0)?;
                let func_ref = ctx.get_runtime_func_ref("__write_char");
                ctx.builder.ins().call(func_ref, &[f, v, w]);
            }
            TypeKind::Boolean => {
                let v = expect_value(ctx, e)?;
                let w = emit_width(ctx, arg.width.as_ref(), 0)?;
                let func_ref = ctx.get_runtime_func_ref("__write_bool");
                ctx.builder.ins().call(func_ref, &[f, v, w]);
            }
            TypeKind::Integer | TypeKind::Int64 | TypeKind::Enum => {
                let v = expect_value(ctx, e)?;
                let v = ctx.adjust(v, e.ty, types::I64);
                let w = emit_width(ctx, arg.width.as_ref(), DEFAULT_INT_WIDTH)?;
                let func_ref = ctx.get_runtime_func_ref("__write_int");
                ctx.builder.ins().call(func_ref, &[f, v, w]);
            }
            TypeKind::Real => {
                let v = expect_value(ctx, e)?;
                let v = ctx.adjust(v, e.ty, types::F64);
                let w = emit_width(ctx, arg.width.as_ref(), DEFAULT_REAL_WIDTH)?;
                let p = match &arg.precision {
                    Some(p) => {
                        let v = expect_value(ctx, p)?;
                        ctx.adjust(v, p.ty, types::I32)
                    }
                    None => ctx.builder.ins().iconst(types::I32, -1),
                };
                let func_ref = ctx.get_runtime_func_ref("__write_real");
                ctx.builder.ins().call(func_ref, &[f, v, w, p]);
            }
            TypeKind::String => {
                let addr = expect_value(ctx, e)?;
                let w = emit_width(ctx, arg.width.as_ref(), 0)?;
                let func_ref = ctx.get_runtime_func_ref("__write_str");
                ctx.builder.ins().call(func_ref, &[f, addr, w]);
            }
            _ => {
                return Err(ctx.error(&e.loc, "argument cannot be written"));
            }
        }
    }

    if newline {
        let func_ref = ctx.get_runtime_func_ref("__write_nl");
        ctx.builder.ins().call(func_ref, &[f]);
    }
    Ok(())
}

fn emit_read(
    ctx: &mut FuncCtx,
    file: Option<&Expr>,
    args: &[Expr],
    newline: bool,
) -> Result<(), CodegenError> {
    let (f, is_text) = emit_file_arg(ctx, file)?;

    for arg in args {
        let dest = emit_addr(ctx, arg)?;
        if !is_text {
            let func_ref = ctx.get_runtime_func_ref("__read_bin");
            ctx.builder.ins().call(func_ref, &[f, dest]);
            continue;
        }
        let kind = ctx.arena.kind(ctx.arena.base_of(arg.ty));
        match kind {
            TypeKind::Integer | TypeKind::Int64 => {
                let func_ref = ctx.get_runtime_func_ref("__read_int");
                let call = ctx.builder.ins().call(func_ref, &[f]);
                let v = ctx.builder.inst_results(call)[0];
                let ct = cl_scalar(ctx.arena.scalar(arg.ty).unwrap());
                let v = if ct == types::I64 {
                    v
                } else {
                    ctx.builder.ins().ireduce(ct, v)
                };
                ctx.builder.ins().store(MemFlags::trusted(), v, dest, 0);
            }
            TypeKind::Real => {
                let func_ref = ctx.get_runtime_func_ref("__read_real");
                let call = ctx.builder.ins().call(func_ref, &[f]);
                let v = ctx.builder.inst_results(call)[0];
                ctx.builder.ins().store(MemFlags::trusted(), v, dest, 0);
            }
            TypeKind::Char => {
                let func_ref = ctx.get_runtime_func_ref("__read_chr");
                let call = ctx.builder.ins().call(func_ref, &[f]);
                let v = ctx.builder.inst_results(call)[0];
                ctx.builder.ins().store(MemFlags::trusted(), v, dest, 0);
            }
            _ => {
                return Err(ctx.error(&arg.loc, "argument cannot be read"));
            }
        }
    }

    if newline {
        let func_ref = ctx.get_runtime_func_ref("__read_nl");
        ctx.builder.ins().call(func_ref, &[f]);
    }
    Ok(())
}

// ─── Expressions ──────────────────────────────────────────────────────

/// Evaluate an expression. Scalars yield their value; compounds yield
/// their address; procedure calls yield nothing.
pub(crate) fn emit_expr(ctx: &mut FuncCtx, e: &Expr) -> Result<Option<Value>, CodegenError> {
    match &e.kind {
        ExprKind::IntLit(v) => {
            let ct = cl_scalar(ctx.arena.scalar(e.ty).unwrap_or(Scalar::I32));
            Ok(Some(ctx.builder.ins().iconst(ct, *v)))
        }
        ExprKind::RealLit(v) => Ok(Some(ctx.builder.ins().f64const(*v))),
        ExprKind::CharLit(c) => Ok(Some(ctx.builder.ins().iconst(types::I8, *c as i64))),
        ExprKind::StringLit(s) => Ok(Some(ctx.string_literal_addr(s))),
        ExprKind::NilLit => Ok(Some(ctx.builder.ins().iconst(PTR, 0))),

        ExprKind::Variable { .. }
        | ExprKind::ArrayIndex { .. }
        | ExprKind::Field { .. }
        | ExprKind::Deref { .. }
        | ExprKind::FileBuffer { .. } => {
            let addr = emit_addr(ctx, e)?;
            match ctx.arena.scalar(e.ty) {
                Some(s) => {
                    let ct = cl_scalar(s);
                    Ok(Some(ctx.builder.ins().load(ct, MemFlags::trusted(), addr, 0)))
                }
                None => Ok(Some(addr)),
            }
        }

        ExprKind::SetLit { .. } => {
            let addr = emit_set_literal(ctx, e)?;
            Ok(Some(addr))
        }

        ExprKind::Binary { op, lhs, rhs } => emit_binary(ctx, e, op, lhs, rhs).map(Some),
        ExprKind::Unary { op, operand } => emit_unary(ctx, op, operand).map(Some),

        ExprKind::Call {
            callee,
            args,
            proto,
        } => emit_call(ctx, e, callee, args, proto.as_ref()),

        ExprKind::BuiltinCall { builtin, args } => builtins::emit_builtin(ctx, e, *builtin, args),

        ExprKind::SizeOf(ty) => {
            let size = ctx.arena.size(*ty);
            Ok(Some(ctx.builder.ins().iconst(types::I32, size as i64)))
        }

        ExprKind::FunctionRef { .. } | ExprKind::Method { .. } => {
            Err(ctx.error(&e.loc, "function reference is not a value"))
        }
    }
}

pub(crate) fn expect_value(ctx: &mut FuncCtx, e: &Expr) -> Result<Value, CodegenError> {
    match emit_expr(ctx, e)? {
        Some(v) => Ok(v),
        None => Err(ctx.error(&e.loc, "expression produces no value")),
    }
}

/// The address of an addressable expression.
pub(crate) fn emit_addr(ctx: &mut FuncCtx, e: &Expr) -> Result<Value, CodegenError> {
    match &e.kind {
        ExprKind::Variable { name } => match ctx.lookup_var(name) {
            Some(entry) => Ok(ctx.place_addr(entry.place)),
            None => Err(ctx.error(&e.loc, format!("undefined variable '{}'", name))),
        },

        ExprKind::ArrayIndex { base, indices } => {
            let base_addr = emit_addr(ctx, base)?;
            match ctx.arena.get(base.ty).clone() {
                Type::Array { element, ranges } => {
                    // Each index is rebased to its range's low bound
                    // and scaled by the product of the later
                    // dimensions.
                    let elem_size = ctx.arena.size(element) as i64;
                    let mut offset: Option<Value> = None;
                    for (i, idx) in indices.iter().enumerate() {
                        let (low, _) = ctx.arena.get_range(ranges[i]).unwrap_or((0, 0));
                        let v = expect_value(ctx, idx)?;
                        let v = ctx.adjust(v, idx.ty, types::I64);
                        let rebased = ctx.builder.ins().iadd_imm(v, -low);
                        let mut stride = elem_size;
                        for r in &ranges[i + 1..] {
                            let (l, h) = ctx.arena.get_range(*r).unwrap_or((0, 0));
                            stride *= (h - l + 1).max(0);
                        }
                        let scaled = ctx.builder.ins().imul_imm(rebased, stride);
                        offset = Some(match offset {
                            Some(o) => ctx.builder.ins().iadd(o, scaled),
                            None => scaled,
                        });
                    }
                    let offset = offset.unwrap_or_else(|| ctx.builder.ins().iconst(PTR, 0));
                    Ok(ctx.builder.ins().iadd(base_addr, offset))
                }
                Type::String { .. } => {
                    // s[i]: 1-based, data starts after the length byte.
                    let v = expect_value(ctx, &indices[0])?;
                    let v = ctx.adjust(v, indices[0].ty, types::I64);
                    Ok(ctx.builder.ins().iadd(base_addr, v))
                }
                _ => Err(ctx.error(&e.loc, "indexing needs an array or string")),
            }
        }

        ExprKind::Field { base, sel } => {
            let base_addr = emit_addr(ctx, base)?;
            let offset = field_offset(ctx, base.ty, sel)
                .ok_or_else(|| ctx.error(&e.loc, "field does not exist"))?;
            Ok(ctx.builder.ins().iadd_imm(base_addr, offset as i64))
        }

        ExprKind::Deref { base } => {
            // The pointer's value is the address.
            expect_value(ctx, base)
        }

        ExprKind::FileBuffer { base } => {
            let f = emit_addr(ctx, base)?;
            Ok(ctx
                .builder
                .ins()
                .load(PTR, MemFlags::trusted(), f, FILE_BUFFER_OFFSET))
        }

        _ => Err(ctx.error(&e.loc, "expression is not addressable")),
    }
}

fn field_offset(ctx: &FuncCtx, base_ty: TypeId, sel: &FieldSel) -> Option<u32> {
    match sel {
        FieldSel::Record { index } => Some(ctx.arena.record_field_offset(base_ty, *index)),
        FieldSel::Variant { alt, index } => {
            let var_off = ctx.arena.record_variant_offset(base_ty);
            let variant = match ctx.arena.get(base_ty) {
                Type::Record {
                    variant: Some(v), ..
                } => *v,
                _ => return None,
            };
            let alt_ty = match ctx.arena.get(variant) {
                Type::Variant { alts } => alts.get(*alt)?.ty,
                _ => return None,
            };
            Some(var_off + ctx.arena.record_field_offset(alt_ty, *index))
        }
        FieldSel::Class { name } => ctx.arena.class_field(base_ty, name).map(|(off, _)| off),
    }
}

// ─── Operators ────────────────────────────────────────────────────────

fn emit_binary(
    ctx: &mut FuncCtx,
    e: &Expr,
    op: &TokenKind,
    lhs: &Expr,
    rhs: &Expr,
) -> Result<Value, CodegenError> {
    // `in`: inline shift/mask test against the set bitmap.
    if *op == TokenKind::In {
        return emit_in(ctx, lhs, rhs);
    }

    let lk = ctx.arena.kind(ctx.arena.base_of(lhs.ty));
    let rk = ctx.arena.kind(ctx.arena.base_of(rhs.ty));

    if lk == TypeKind::Set || rk == TypeKind::Set {
        return emit_set_binary(ctx, e, op, lhs, rhs);
    }

    // The narrower operand widens to the common type; `/` widens both
    // sides to real.
    let common = if *op == TokenKind::Divide {
        ctx.arena.real
    } else {
        ctx.arena
            .compatible_type(lhs.ty, rhs.ty)
            .unwrap_or(lhs.ty)
    };
    let Some(scalar) = ctx.arena.scalar(common) else {
        return Err(ctx.error(
            &e.loc,
            format!("operator '{}' needs scalar operands", op),
        ));
    };
    let ct = cl_scalar(scalar);
    let a = expect_value(ctx, lhs)?;
    let a = ctx.adjust(a, lhs.ty, ct);
    let b = expect_value(ctx, rhs)?;
    let b = ctx.adjust(b, rhs.ty, ct);

    let is_real = ct == types::F64;
    use TokenKind::*;
    let v = match op {
        Plus if is_real => ctx.builder.ins().fadd(a, b),
        Plus => ctx.builder.ins().iadd(a, b),
        Minus if is_real => ctx.builder.ins().fsub(a, b),
        Minus => ctx.builder.ins().isub(a, b),
        Multiply if is_real => ctx.builder.ins().fmul(a, b),
        Multiply => ctx.builder.ins().imul(a, b),
        Divide => ctx.builder.ins().fdiv(a, b),
        Div => ctx.builder.ins().sdiv(a, b),
        Mod => ctx.builder.ins().srem(a, b),
        And => ctx.builder.ins().band(a, b),
        Or => ctx.builder.ins().bor(a, b),
        Equal | NotEqual | LessThan | GreaterThan | LessOrEqual | GreaterOrEqual => {
            if is_real {
                let cc = match op {
                    Equal => FloatCC::Equal,
                    NotEqual => FloatCC::NotEqual,
                    LessThan => FloatCC::LessThan,
                    GreaterThan => FloatCC::GreaterThan,
                    LessOrEqual => FloatCC::LessThanOrEqual,
                    _ => FloatCC::GreaterThanOrEqual,
                };
                ctx.builder.ins().fcmp(cc, a, b)
            } else {
                // Chars and booleans compare unsigned; wider
                // integers compare signed.
                let unsigned = matches!(
                    ctx.arena.kind(ctx.arena.base_of(common)),
                    TypeKind::Char | TypeKind::Boolean
                );
                let cc = int_cc(op, unsigned);
                ctx.builder.ins().icmp(cc, a, b)
            }
        }
        other => {
            return Err(ctx.error(&e.loc, format!("'{}' is not a binary operator", other)));
        }
    };
    Ok(v)
}

fn int_cc(op: &TokenKind, unsigned: bool) -> IntCC {
    use TokenKind::*;
    match (op, unsigned) {
        (Equal, _) => IntCC::Equal,
        (NotEqual, _) => IntCC::NotEqual,
        (LessThan, false) => IntCC::SignedLessThan,
        (LessThan, true) => IntCC::UnsignedLessThan,
        (GreaterThan, false) => IntCC::SignedGreaterThan,
        (GreaterThan, true) => IntCC::UnsignedGreaterThan,
        (LessOrEqual, false) => IntCC::SignedLessThanOrEqual,
        (LessOrEqual, true) => IntCC::UnsignedLessThanOrEqual,
        (GreaterOrEqual, false) => IntCC::SignedGreaterThanOrEqual,
        (_, true) => IntCC::UnsignedGreaterThanOrEqual,
        (_, false) => IntCC::SignedGreaterThanOrEqual,
    }
}

/// `e in s`: bit `e mod 32` of word `e div 32`, rebased to the set's
/// low bound.
fn emit_in(ctx: &mut FuncCtx, elem: &Expr, set: &Expr) -> Result<Value, CodegenError> {
    let set_addr = expect_value(ctx, set)?;
    let (low, _) = match ctx.arena.get(set.ty) {
        Type::Set { low, high, .. } => (*low, *high),
        _ => return Err(ctx.error(&set.loc, "'in' needs a set operand")),
    };
    let v = expect_value(ctx, elem)?;
    let v = ctx.adjust(v, elem.ty, types::I64);
    let idx = ctx.builder.ins().iadd_imm(v, -low);
    let word = ctx.builder.ins().ushr_imm(idx, SET_POW2_BITS as i64);
    let byte_off = ctx.builder.ins().imul_imm(word, 4);
    let word_addr = ctx.builder.ins().iadd(set_addr, byte_off);
    let w = ctx
        .builder
        .ins()
        .load(types::I32, MemFlags::trusted(), word_addr, 0);
    let bit = ctx.builder.ins().band_imm(idx, SET_MASK as i64);
    let bit = ctx.builder.ins().ireduce(types::I32, bit);
    let shifted = ctx.builder.ins().ushr(w, bit);
    let masked = ctx.builder.ins().band_imm(shifted, 1);
    Ok(ctx.builder.ins().icmp_imm(IntCC::NotEqual, masked, 0))
}

/// Binary set operators go through the runtime helpers with
/// pointer-to-set arguments plus the word count.
fn emit_set_binary(
    ctx: &mut FuncCtx,
    e: &Expr,
    op: &TokenKind,
    lhs: &Expr,
    rhs: &Expr,
) -> Result<Value, CodegenError> {
    let set_ty = if ctx.arena.kind(lhs.ty) == TypeKind::Set {
        lhs.ty
    } else {
        rhs.ty
    };
    let words = ctx.arena.set_words(set_ty);
    let a = expect_value(ctx, lhs)?;
    let b = expect_value(ctx, rhs)?;
    let w = ctx.builder.ins().iconst(types::I32, words as i64);

    use TokenKind::*;
    match op {
        Plus | Minus | Multiply => {
            let helper = match op {
                Plus => "__SetUnion",
                Minus => "__SetDiff",
                _ => "__SetIntersect",
            };
            let dest = ctx.stack_slot(words * 4, 4);
            let func_ref = ctx.get_runtime_func_ref(helper);
            ctx.builder.ins().call(func_ref, &[dest, a, b, w]);
            Ok(dest)
        }
        Equal | NotEqual => {
            let func_ref = ctx.get_runtime_func_ref("__SetEqual");
            let call = ctx.builder.ins().call(func_ref, &[a, b, w]);
            let v = ctx.builder.inst_results(call)[0];
            if *op == NotEqual {
                Ok(ctx.builder.ins().bxor_imm(v, 1))
            } else {
                Ok(v)
            }
        }
        LessOrEqual | GreaterOrEqual => {
            // Subset tests: l <= r asks whether l is contained in r.
            let (x, y) = if *op == LessOrEqual { (a, b) } else { (b, a) };
            let func_ref = ctx.get_runtime_func_ref("__SetContains");
            let call = ctx.builder.ins().call(func_ref, &[x, y, w]);
            Ok(ctx.builder.inst_results(call)[0])
        }
        other => Err(ctx.error(&e.loc, format!("'{}' does not apply to sets", other))),
    }
}

fn emit_unary(ctx: &mut FuncCtx, op: &TokenKind, operand: &Expr) -> Result<Value, CodegenError> {
    let v = expect_value(ctx, operand)?;
    let is_real = ctx.arena.kind(ctx.arena.base_of(operand.ty)) == TypeKind::Real;
    match op {
        TokenKind::Minus if is_real => Ok(ctx.builder.ins().fneg(v)),
        TokenKind::Minus => Ok(ctx.builder.ins().ineg(v)),
        TokenKind::Plus => Ok(v),
        TokenKind::Not => {
            if ctx.arena.same_as(operand.ty, ctx.arena.boolean) {
                Ok(ctx.builder.ins().bxor_imm(v, 1))
            } else {
                Ok(ctx.builder.ins().bnot(v))
            }
        }
        other => Err(ctx.error(&operand.loc, format!("'{}' is not a unary operator", other))),
    }
}

// ─── Sets ─────────────────────────────────────────────────────────────

/// Build a set value in a zeroed stack temporary. Single elements
/// OR their bit in; ranges run an inline low-to-high loop.
fn emit_set_literal(ctx: &mut FuncCtx, e: &Expr) -> Result<Value, CodegenError> {
    let ExprKind::SetLit { elements } = &e.kind else {
        return Err(ctx.error(&e.loc, "not a set constructor"));
    };
    let (low, words) = match ctx.arena.get(e.ty) {
        Type::Set { low, .. } => (*low, ctx.arena.set_words(e.ty).max(1)),
        _ => (0, 1),
    };

    let dest = ctx.stack_slot(words * 4, 4);
    let zero = ctx.builder.ins().iconst(types::I32, 0);
    for i in 0..words {
        ctx.builder
            .ins()
            .store(MemFlags::trusted(), zero, dest, (i * 4) as i32);
    }

    for el in elements {
        let lo = expect_value(ctx, &el.low)?;
        let lo = ctx.adjust(lo, el.low.ty, types::I64);
        match &el.high {
            None => emit_set_bit(ctx, dest, lo, low),
            Some(h) => {
                // for v := lo to hi do include v
                let hi = expect_value(ctx, h)?;
                let hi = ctx.adjust(hi, h.ty, types::I64);
                let cur_slot = ctx.stack_slot(8, 8);
                ctx.builder
                    .ins()
                    .store(MemFlags::trusted(), lo, cur_slot, 0);

                let header = ctx.builder.create_block();
                let body = ctx.builder.create_block();
                let exit = ctx.builder.create_block();
                ctx.builder.ins().jump(header, &[]);

                ctx.builder.switch_to_block(header);
                let cur = ctx
                    .builder
                    .ins()
                    .load(types::I64, MemFlags::trusted(), cur_slot, 0);
                let c = ctx
                    .builder
                    .ins()
                    .icmp(IntCC::SignedLessThanOrEqual, cur, hi);
                ctx.builder.ins().brif(c, body, &[], exit, &[]);

                ctx.builder.switch_to_block(body);
                ctx.builder.seal_block(body);
                emit_set_bit(ctx, dest, cur, low);
                let next = ctx.builder.ins().iadd_imm(cur, 1);
                ctx.builder
                    .ins()
                    .store(MemFlags::trusted(), next, cur_slot, 0);
                ctx.builder.ins().jump(header, &[]);
                ctx.builder.seal_block(header);

                ctx.builder.switch_to_block(exit);
                ctx.builder.seal_block(exit);
            }
        }
    }
    Ok(dest)
}

/// OR bit `(v - low) mod 32` into word `(v - low) div 32`.
fn emit_set_bit(ctx: &mut FuncCtx, set_addr: Value, v: Value, low: i64) {
    let idx = ctx.builder.ins().iadd_imm(v, -low);
    let word = ctx.builder.ins().ushr_imm(idx, SET_POW2_BITS as i64);
    let byte_off = ctx.builder.ins().imul_imm(word, 4);
    let word_addr = ctx.builder.ins().iadd(set_addr, byte_off);
    let w = ctx
        .builder
        .ins()
        .load(types::I32, MemFlags::trusted(), word_addr, 0);
    let amt = ctx.builder.ins().band_imm(idx, SET_MASK as i64);
    let amt = ctx.builder.ins().ireduce(types::I32, amt);
    let one = ctx.builder.ins().iconst(types::I32, 1);
    let bit = ctx.builder.ins().ishl(one, amt);
    let merged = ctx.builder.ins().bor(w, bit);
    ctx.builder
        .ins()
        .store(MemFlags::trusted(), merged, word_addr, 0);
}

// ─── Calls ────────────────────────────────────────────────────────────

fn emit_call(
    ctx: &mut FuncCtx,
    e: &Expr,
    callee: &Expr,
    args: &[Expr],
    proto: Option<&ProtoRef>,
) -> Result<Option<Value>, CodegenError> {
    match &callee.kind {
        ExprKind::FunctionRef { name, .. } => {
            let proto = proto.ok_or_else(|| {
                ctx.error(&e.loc, "internal: direct call without a prototype")
            })?;
            let params = proto.borrow().args.clone();
            let ret_void = {
                let p = proto.borrow();
                ctx.arena.same_as(p.ret, ctx.arena.void)
            };
            let arg_vals = emit_call_args(ctx, &params, args)?;

            let mangled = match ctx.mangles.find(name) {
                Some(m) => m.clone(),
                None => {
                    return Err(ctx.error(&e.loc, format!("undefined function '{}'", name)))
                }
            };
            let func_ref = ctx
                .get_pascal_func_ref(&mangled)
                .ok_or_else(|| ctx.error(&e.loc, format!("undeclared function '{}'", mangled)))?;
            let call = ctx.builder.ins().call(func_ref, &arg_vals);
            if ret_void {
                Ok(None)
            } else {
                Ok(Some(ctx.builder.inst_results(call)[0]))
            }
        }
        ExprKind::Method { base, sel } => emit_method_call(ctx, e, base, sel, args),
        _ => Err(ctx.error(&e.loc, "expression is not callable")),
    }
}

fn emit_call_args(
    ctx: &mut FuncCtx,
    params: &[VarDef],
    args: &[Expr],
) -> Result<Vec<Value>, CodegenError> {
    let mut out = Vec::with_capacity(args.len());
    for (p, a) in params.iter().zip(args.iter()) {
        if p.is_ref {
            // By-reference arguments must be addressable.
            if !a.is_addressable() {
                return Err(ctx.error(&a.loc, "var argument must be addressable"));
            }
            out.push(emit_addr(ctx, a)?);
        } else if let Some(s) = ctx.arena.scalar(p.ty) {
            let v = expect_value(ctx, a)?;
            out.push(ctx.adjust(v, a.ty, cl_scalar(s)));
        } else {
            // Compound by value: pass the address, the callee copies.
            out.push(expect_value(ctx, a)?);
        }
    }
    Ok(out)
}

/// Method invocation: `self` is passed by reference in front of the
/// declared arguments. Virtual members load the target through the
/// object's vtable; the rest call their implementation directly.
fn emit_method_call(
    ctx: &mut FuncCtx,
    e: &Expr,
    base: &Expr,
    sel: &MethodSel,
    args: &[Expr],
) -> Result<Option<Value>, CodegenError> {
    let (member, owner) = ctx
        .arena
        .class_member(sel.class, &sel.name)
        .ok_or_else(|| ctx.error(&e.loc, format!("no method '{}'", sel.name)))?;

    let skip = if member.is_static { 0 } else { 1 };
    let params: Vec<VarDef> = member.sig.params[skip..]
        .iter()
        .enumerate()
        .map(|(i, p)| VarDef {
            name: format!("arg{}", i),
            ty: p.ty,
            is_ref: p.by_ref,
        })
        .collect();
    let mut arg_vals = Vec::with_capacity(args.len() + 1);
    if !member.is_static {
        arg_vals.push(emit_addr(ctx, base)?);
    }
    arg_vals.extend(emit_call_args(ctx, &params, args)?);

    let ret_void = ctx.arena.same_as(member.sig.ret, ctx.arena.void);

    let call = match member.vtable_index {
        Some(idx) if !member.is_static => {
            // load vtable pointer → load entry → call indirect
            let self_addr = arg_vals[0];
            let vt = ctx
                .builder
                .ins()
                .load(PTR, MemFlags::trusted(), self_addr, 0);
            let target = ctx
                .builder
                .ins()
                .load(PTR, MemFlags::trusted(), vt, (idx * 8) as i32);
            let mut sig = ctx.comp.module.make_signature();
            sig.params.push(AbiParam::new(PTR));
            for p in &member.sig.params[1..] {
                let ct = if p.by_ref {
                    PTR
                } else {
                    ctx.arena.scalar(p.ty).map(cl_scalar).unwrap_or(PTR)
                };
                sig.params.push(AbiParam::new(ct));
            }
            if !ret_void {
                if let Some(s) = ctx.arena.scalar(member.sig.ret) {
                    sig.returns.push(AbiParam::new(cl_scalar(s)));
                }
            }
            let sig_ref = ctx.builder.import_signature(sig);
            ctx.builder.ins().call_indirect(sig_ref, target, &arg_vals)
        }
        _ => {
            let owner_name = ctx
                .arena
                .class_name(owner)
                .unwrap_or(&sel.name)
                .to_string();
            let mangled = format!("P.{}.{}", owner_name, member.name);
            let func_ref = ctx.get_pascal_func_ref(&mangled).ok_or_else(|| {
                ctx.error(&e.loc, format!("method '{}' has no body", mangled))
            })?;
            ctx.builder.ins().call(func_ref, &arg_vals)
        }
    };

    if ret_void {
        Ok(None)
    } else {
        Ok(Some(ctx.builder.inst_results(call)[0]))
    }
}
