//! Builtin function emission.
//!
//! The registry tag and call validation live in the parser; this is
//! the per-builtin code generation. Each arm validates nothing — the
//! parser already checked arity and types — and emits the specialized
//! instruction sequence or runtime call.

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{types, InstBuilder, MemFlags, Value};

use pascal_parser::ast::{Builtin, Expr, ExprKind};
use pascal_types::{Type, TypeKind};

use crate::compiler::{
    cl_scalar, emit_addr, emit_init_image, expect_value, CodegenError, FuncCtx, PTR,
};

pub(crate) fn emit_builtin(
    ctx: &mut FuncCtx,
    _call: &Expr,
    builtin: Builtin,
    args: &[Expr],
) -> Result<Option<Value>, CodegenError> {
    use Builtin::*;
    match builtin {
        Abs => {
            let a = &args[0];
            let v = expect_value(ctx, a)?;
            if ctx.arena.kind(ctx.arena.base_of(a.ty)) == TypeKind::Real {
                Ok(Some(ctx.builder.ins().fabs(v)))
            } else {
                let neg = ctx.builder.ins().ineg(v);
                let is_neg = ctx.builder.ins().icmp_imm(IntCC::SignedLessThan, v, 0);
                Ok(Some(ctx.builder.ins().select(is_neg, neg, v)))
            }
        }
        Sqr => {
            let a = &args[0];
            let v = expect_value(ctx, a)?;
            if ctx.arena.kind(ctx.arena.base_of(a.ty)) == TypeKind::Real {
                Ok(Some(ctx.builder.ins().fmul(v, v)))
            } else {
                Ok(Some(ctx.builder.ins().imul(v, v)))
            }
        }
        Odd => {
            let v = expect_value(ctx, &args[0])?;
            let bit = ctx.builder.ins().band_imm(v, 1);
            Ok(Some(ctx.builder.ins().icmp_imm(IntCC::NotEqual, bit, 0)))
        }
        Sqrt | Sin | Cos | Arctan | Ln | Exp => {
            let helper = match builtin {
                Sqrt => "sqrt",
                Sin => "sin",
                Cos => "cos",
                Arctan => "atan",
                Ln => "log",
                _ => "exp",
            };
            let a = &args[0];
            let v = expect_value(ctx, a)?;
            let v = ctx.adjust(v, a.ty, types::F64);
            let func_ref = ctx.get_runtime_func_ref(helper);
            let call = ctx.builder.ins().call(func_ref, &[v]);
            Ok(Some(ctx.builder.inst_results(call)[0]))
        }
        Trunc => {
            let v = expect_value(ctx, &args[0])?;
            Ok(Some(ctx.builder.ins().fcvt_to_sint(types::I32, v)))
        }
        Round => {
            let v = expect_value(ctx, &args[0])?;
            let n = ctx.builder.ins().nearest(v);
            Ok(Some(ctx.builder.ins().fcvt_to_sint(types::I32, n)))
        }
        Ord => {
            let a = &args[0];
            let v = expect_value(ctx, a)?;
            Ok(Some(ctx.adjust(v, a.ty, types::I32)))
        }
        Chr => {
            let a = &args[0];
            let v = expect_value(ctx, a)?;
            Ok(Some(ctx.adjust(v, a.ty, types::I8)))
        }
        Succ | Pred => {
            let v = expect_value(ctx, &args[0])?;
            let step = if builtin == Succ { 1 } else { -1 };
            Ok(Some(ctx.builder.ins().iadd_imm(v, step)))
        }
        Length => {
            let addr = expect_value(ctx, &args[0])?;
            let len = ctx
                .builder
                .ins()
                .load(types::I8, MemFlags::trusted(), addr, 0);
            Ok(Some(ctx.builder.ins().uextend(types::I32, len)))
        }
        New => {
            let a = &args[0];
            let slot = emit_addr(ctx, a)?;
            let target = ctx
                .arena
                .sub_type(a.ty)
                .ok_or_else(|| ctx.error(&a.loc, "new needs a typed pointer"))?;
            let size = ctx.arena.size(target);
            let n = ctx.builder.ins().iconst(types::I64, size as i64);
            let func_ref = ctx.get_runtime_func_ref("__new");
            let call = ctx.builder.ins().call(func_ref, &[n]);
            let ptr = ctx.builder.inst_results(call)[0];
            ctx.builder.ins().store(MemFlags::trusted(), ptr, slot, 0);
            // Fresh objects get their vtable pointers installed.
            emit_init_image(ctx, ptr, target);
            Ok(None)
        }
        Dispose => {
            let v = expect_value(ctx, &args[0])?;
            let func_ref = ctx.get_runtime_func_ref("__dispose");
            ctx.builder.ins().call(func_ref, &[v]);
            Ok(None)
        }
        Assign => {
            let f = emit_addr(ctx, &args[0])?;
            let name = match &args[1].kind {
                ExprKind::StringLit(s) => ctx.string_literal_addr(s),
                _ => expect_value(ctx, &args[1])?,
            };
            let (record_size, is_text) = match ctx.arena.get(args[0].ty) {
                Type::File { base, is_text } => (ctx.arena.size(*base), *is_text),
                _ => (1, true),
            };
            let rs = ctx.builder.ins().iconst(types::I32, record_size as i64);
            let t = ctx.builder.ins().iconst(types::I8, is_text as i64);
            let func_ref = ctx.get_runtime_func_ref("__assign");
            ctx.builder.ins().call(func_ref, &[f, name, rs, t]);
            Ok(None)
        }
        Reset | Rewrite | Close => {
            let helper = match builtin {
                Reset => "__reset",
                Rewrite => "__rewrite",
                _ => "__close",
            };
            let f = emit_addr(ctx, &args[0])?;
            let func_ref = ctx.get_runtime_func_ref(helper);
            ctx.builder.ins().call(func_ref, &[f]);
            Ok(None)
        }
        Eof | Eoln => {
            let helper = if builtin == Eof { "__eof" } else { "__eoln" };
            let f = match args.first() {
                Some(a) => emit_addr(ctx, a)?,
                None => ctx.builder.ins().iconst(PTR, 0),
            };
            let func_ref = ctx.get_runtime_func_ref(helper);
            let call = ctx.builder.ins().call(func_ref, &[f]);
            Ok(Some(ctx.builder.inst_results(call)[0]))
        }
        Inc | Dec => {
            let a = &args[0];
            let addr = emit_addr(ctx, a)?;
            let ct = cl_scalar(
                ctx.arena
                    .scalar(a.ty)
                    .ok_or_else(|| ctx.error(&a.loc, "inc/dec needs an ordinal variable"))?,
            );
            let v = ctx.builder.ins().load(ct, MemFlags::trusted(), addr, 0);
            let step = if builtin == Inc { 1 } else { -1 };
            let next = ctx.builder.ins().iadd_imm(v, step);
            ctx.builder.ins().store(MemFlags::trusted(), next, addr, 0);
            Ok(None)
        }
    }
}
