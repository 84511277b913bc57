//! Opcode handlers and the dispatch table
//!
//! Everything that is not inlined control flow goes through a 256-entry
//! function-pointer table built once per VM. Handlers pop and push raw
//! 64-bit slots; typing is positional, guaranteed by validation.

use crate::wasm::op;

use super::vm::{HostCtx, OpFn, Trap, Vm};

type R = Result<(), Trap>;

/// Build the opcode dispatch table.
pub(super) fn new_func_table() -> [Option<OpFn>; 256] {
    let mut t: [Option<OpFn>; 256] = [None; 256];

    t[op::UNREACHABLE as usize] = Some(unreachable);
    t[op::NOP as usize] = Some(nop);
    t[op::CALL as usize] = Some(call);
    t[op::CALL_INDIRECT as usize] = Some(call_indirect);
    t[op::DROP as usize] = Some(drop_op);
    t[op::SELECT as usize] = Some(select);

    t[op::LOCAL_GET as usize] = Some(local_get);
    t[op::LOCAL_SET as usize] = Some(local_set);
    t[op::LOCAL_TEE as usize] = Some(local_tee);
    t[op::GLOBAL_GET as usize] = Some(global_get);
    t[op::GLOBAL_SET as usize] = Some(global_set);

    t[op::I32_LOAD as usize] = Some(i32_load);
    t[op::I64_LOAD as usize] = Some(i64_load);
    t[op::F32_LOAD as usize] = Some(f32_load);
    t[op::F64_LOAD as usize] = Some(f64_load);
    t[op::I32_LOAD8_S as usize] = Some(i32_load8_s);
    t[op::I32_LOAD8_U as usize] = Some(i32_load8_u);
    t[op::I32_LOAD16_S as usize] = Some(i32_load16_s);
    t[op::I32_LOAD16_U as usize] = Some(i32_load16_u);
    t[op::I64_LOAD8_S as usize] = Some(i64_load8_s);
    t[op::I64_LOAD8_U as usize] = Some(i64_load8_u);
    t[op::I64_LOAD16_S as usize] = Some(i64_load16_s);
    t[op::I64_LOAD16_U as usize] = Some(i64_load16_u);
    t[op::I64_LOAD32_S as usize] = Some(i64_load32_s);
    t[op::I64_LOAD32_U as usize] = Some(i64_load32_u);
    t[op::I32_STORE as usize] = Some(i32_store);
    t[op::I64_STORE as usize] = Some(i64_store);
    t[op::F32_STORE as usize] = Some(f32_store);
    t[op::F64_STORE as usize] = Some(f64_store);
    t[op::I32_STORE8 as usize] = Some(i32_store8);
    t[op::I32_STORE16 as usize] = Some(i32_store16);
    t[op::I64_STORE8 as usize] = Some(i64_store8);
    t[op::I64_STORE16 as usize] = Some(i64_store16);
    t[op::I64_STORE32 as usize] = Some(i64_store32);
    t[op::MEMORY_SIZE as usize] = Some(memory_size);
    t[op::MEMORY_GROW as usize] = Some(memory_grow);

    t[op::I32_CONST as usize] = Some(i32_const);
    t[op::I64_CONST as usize] = Some(i64_const);
    t[op::F32_CONST as usize] = Some(f32_const);
    t[op::F64_CONST as usize] = Some(f64_const);

    t[op::I32_EQZ as usize] = Some(i32_eqz);
    t[op::I32_EQ as usize] = Some(i32_eq);
    t[op::I32_NE as usize] = Some(i32_ne);
    t[op::I32_LT_S as usize] = Some(i32_lt_s);
    t[op::I32_LT_U as usize] = Some(i32_lt_u);
    t[op::I32_GT_S as usize] = Some(i32_gt_s);
    t[op::I32_GT_U as usize] = Some(i32_gt_u);
    t[op::I32_LE_S as usize] = Some(i32_le_s);
    t[op::I32_LE_U as usize] = Some(i32_le_u);
    t[op::I32_GE_S as usize] = Some(i32_ge_s);
    t[op::I32_GE_U as usize] = Some(i32_ge_u);
    t[op::I64_EQZ as usize] = Some(i64_eqz);
    t[op::I64_EQ as usize] = Some(i64_eq);
    t[op::I64_NE as usize] = Some(i64_ne);
    t[op::I64_LT_S as usize] = Some(i64_lt_s);
    t[op::I64_LT_U as usize] = Some(i64_lt_u);
    t[op::I64_GT_S as usize] = Some(i64_gt_s);
    t[op::I64_GT_U as usize] = Some(i64_gt_u);
    t[op::I64_LE_S as usize] = Some(i64_le_s);
    t[op::I64_LE_U as usize] = Some(i64_le_u);
    t[op::I64_GE_S as usize] = Some(i64_ge_s);
    t[op::I64_GE_U as usize] = Some(i64_ge_u);
    t[op::F32_EQ as usize] = Some(f32_eq);
    t[op::F32_NE as usize] = Some(f32_ne);
    t[op::F32_LT as usize] = Some(f32_lt);
    t[op::F32_GT as usize] = Some(f32_gt);
    t[op::F32_LE as usize] = Some(f32_le);
    t[op::F32_GE as usize] = Some(f32_ge);
    t[op::F64_EQ as usize] = Some(f64_eq);
    t[op::F64_NE as usize] = Some(f64_ne);
    t[op::F64_LT as usize] = Some(f64_lt);
    t[op::F64_GT as usize] = Some(f64_gt);
    t[op::F64_LE as usize] = Some(f64_le);
    t[op::F64_GE as usize] = Some(f64_ge);

    t[op::I32_CLZ as usize] = Some(i32_clz);
    t[op::I32_CTZ as usize] = Some(i32_ctz);
    t[op::I32_POPCNT as usize] = Some(i32_popcnt);
    t[op::I32_ADD as usize] = Some(i32_add);
    t[op::I32_SUB as usize] = Some(i32_sub);
    t[op::I32_MUL as usize] = Some(i32_mul);
    t[op::I32_DIV_S as usize] = Some(i32_div_s);
    t[op::I32_DIV_U as usize] = Some(i32_div_u);
    t[op::I32_REM_S as usize] = Some(i32_rem_s);
    t[op::I32_REM_U as usize] = Some(i32_rem_u);
    t[op::I32_AND as usize] = Some(i32_and);
    t[op::I32_OR as usize] = Some(i32_or);
    t[op::I32_XOR as usize] = Some(i32_xor);
    t[op::I32_SHL as usize] = Some(i32_shl);
    t[op::I32_SHR_S as usize] = Some(i32_shr_s);
    t[op::I32_SHR_U as usize] = Some(i32_shr_u);
    t[op::I32_ROTL as usize] = Some(i32_rotl);
    t[op::I32_ROTR as usize] = Some(i32_rotr);
    t[op::I64_CLZ as usize] = Some(i64_clz);
    t[op::I64_CTZ as usize] = Some(i64_ctz);
    t[op::I64_POPCNT as usize] = Some(i64_popcnt);
    t[op::I64_ADD as usize] = Some(i64_add);
    t[op::I64_SUB as usize] = Some(i64_sub);
    t[op::I64_MUL as usize] = Some(i64_mul);
    t[op::I64_DIV_S as usize] = Some(i64_div_s);
    t[op::I64_DIV_U as usize] = Some(i64_div_u);
    t[op::I64_REM_S as usize] = Some(i64_rem_s);
    t[op::I64_REM_U as usize] = Some(i64_rem_u);
    t[op::I64_AND as usize] = Some(i64_and);
    t[op::I64_OR as usize] = Some(i64_or);
    t[op::I64_XOR as usize] = Some(i64_xor);
    t[op::I64_SHL as usize] = Some(i64_shl);
    t[op::I64_SHR_S as usize] = Some(i64_shr_s);
    t[op::I64_SHR_U as usize] = Some(i64_shr_u);
    t[op::I64_ROTL as usize] = Some(i64_rotl);
    t[op::I64_ROTR as usize] = Some(i64_rotr);

    t[op::F32_ABS as usize] = Some(f32_abs);
    t[op::F32_NEG as usize] = Some(f32_neg);
    t[op::F32_CEIL as usize] = Some(f32_ceil);
    t[op::F32_FLOOR as usize] = Some(f32_floor);
    t[op::F32_TRUNC as usize] = Some(f32_trunc);
    t[op::F32_NEAREST as usize] = Some(f32_nearest);
    t[op::F32_SQRT as usize] = Some(f32_sqrt);
    t[op::F32_ADD as usize] = Some(f32_add);
    t[op::F32_SUB as usize] = Some(f32_sub);
    t[op::F32_MUL as usize] = Some(f32_mul);
    t[op::F32_DIV as usize] = Some(f32_div);
    t[op::F32_MIN as usize] = Some(f32_min);
    t[op::F32_MAX as usize] = Some(f32_max);
    t[op::F32_COPYSIGN as usize] = Some(f32_copysign);
    t[op::F64_ABS as usize] = Some(f64_abs);
    t[op::F64_NEG as usize] = Some(f64_neg);
    t[op::F64_CEIL as usize] = Some(f64_ceil);
    t[op::F64_FLOOR as usize] = Some(f64_floor);
    t[op::F64_TRUNC as usize] = Some(f64_trunc);
    t[op::F64_NEAREST as usize] = Some(f64_nearest);
    t[op::F64_SQRT as usize] = Some(f64_sqrt);
    t[op::F64_ADD as usize] = Some(f64_add);
    t[op::F64_SUB as usize] = Some(f64_sub);
    t[op::F64_MUL as usize] = Some(f64_mul);
    t[op::F64_DIV as usize] = Some(f64_div);
    t[op::F64_MIN as usize] = Some(f64_min);
    t[op::F64_MAX as usize] = Some(f64_max);
    t[op::F64_COPYSIGN as usize] = Some(f64_copysign);

    t[op::I32_WRAP_I64 as usize] = Some(i32_wrap_i64);
    t[op::I32_TRUNC_F32_S as usize] = Some(i32_trunc_f32_s);
    t[op::I32_TRUNC_F32_U as usize] = Some(i32_trunc_f32_u);
    t[op::I32_TRUNC_F64_S as usize] = Some(i32_trunc_f64_s);
    t[op::I32_TRUNC_F64_U as usize] = Some(i32_trunc_f64_u);
    t[op::I64_EXTEND_I32_S as usize] = Some(i64_extend_i32_s);
    t[op::I64_EXTEND_I32_U as usize] = Some(i64_extend_i32_u);
    t[op::I64_TRUNC_F32_S as usize] = Some(i64_trunc_f32_s);
    t[op::I64_TRUNC_F32_U as usize] = Some(i64_trunc_f32_u);
    t[op::I64_TRUNC_F64_S as usize] = Some(i64_trunc_f64_s);
    t[op::I64_TRUNC_F64_U as usize] = Some(i64_trunc_f64_u);
    t[op::F32_CONVERT_I32_S as usize] = Some(f32_convert_i32_s);
    t[op::F32_CONVERT_I32_U as usize] = Some(f32_convert_i32_u);
    t[op::F32_CONVERT_I64_S as usize] = Some(f32_convert_i64_s);
    t[op::F32_CONVERT_I64_U as usize] = Some(f32_convert_i64_u);
    t[op::F32_DEMOTE_F64 as usize] = Some(f32_demote_f64);
    t[op::F64_CONVERT_I32_S as usize] = Some(f64_convert_i32_s);
    t[op::F64_CONVERT_I32_U as usize] = Some(f64_convert_i32_u);
    t[op::F64_CONVERT_I64_S as usize] = Some(f64_convert_i64_s);
    t[op::F64_CONVERT_I64_U as usize] = Some(f64_convert_i64_u);
    t[op::F64_PROMOTE_F32 as usize] = Some(f64_promote_f32);
    t[op::I32_REINTERPRET_F32 as usize] = Some(i32_reinterpret_f32);
    t[op::I64_REINTERPRET_F64 as usize] = Some(i64_reinterpret_f64);
    t[op::F32_REINTERPRET_I32 as usize] = Some(f32_reinterpret_i32);
    t[op::F64_REINTERPRET_I64 as usize] = Some(f64_reinterpret_i64);

    t
}

// ---- control and parametric ------------------------------------------

fn unreachable(_vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    Err(Trap::Unreachable)
}

fn nop(_vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    Ok(())
}

fn call(vm: &mut Vm, ctx: &HostCtx<'_>) -> R {
    let index = vm.fetch_u32() as i64;
    vm.invoke_function(ctx, index)
}

fn call_indirect(vm: &mut Vm, ctx: &HostCtx<'_>) -> R {
    let type_index = vm.fetch_u32();
    let elem = vm.pop_i32();
    let index = vm.table_lookup(elem, type_index)?;
    vm.invoke_function(ctx, index)
}

fn drop_op(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    vm.pop_u64();
    Ok(())
}

fn select(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let cond = vm.pop_u32();
    let b = vm.pop_u64();
    let a = vm.pop_u64();
    vm.push_u64(if cond != 0 { a } else { b });
    Ok(())
}

// ---- locals and globals ----------------------------------------------

fn local_get(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let index = vm.fetch_u32();
    vm.local_get(index);
    Ok(())
}

fn local_set(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let index = vm.fetch_u32();
    vm.local_set(index);
    Ok(())
}

fn local_tee(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let index = vm.fetch_u32();
    vm.local_tee(index);
    Ok(())
}

fn global_get(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let index = vm.fetch_u32();
    vm.global_get(index);
    Ok(())
}

fn global_set(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let index = vm.fetch_u32();
    vm.global_set(index);
    Ok(())
}

// ---- memory ----------------------------------------------------------

fn i32_load(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.with_mem(4, |m| u32::from_le_bytes([m[0], m[1], m[2], m[3]]))?;
    vm.push_u32(v);
    Ok(())
}

fn i32_load8_s(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.with_mem(1, |m| m[0] as i8)?;
    vm.push_i32(v as i32);
    Ok(())
}

fn i32_load8_u(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.with_mem(1, |m| m[0])?;
    vm.push_u32(v as u32);
    Ok(())
}

fn i32_load16_s(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.with_mem(2, |m| i16::from_le_bytes([m[0], m[1]]))?;
    vm.push_i32(v as i32);
    Ok(())
}

fn i32_load16_u(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.with_mem(2, |m| u16::from_le_bytes([m[0], m[1]]))?;
    vm.push_u32(v as u32);
    Ok(())
}

fn i64_load(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.with_mem(8, |m| {
        u64::from_le_bytes([m[0], m[1], m[2], m[3], m[4], m[5], m[6], m[7]])
    })?;
    vm.push_u64(v);
    Ok(())
}

fn i64_load8_s(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.with_mem(1, |m| m[0] as i8)?;
    vm.push_i64(v as i64);
    Ok(())
}

fn i64_load8_u(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.with_mem(1, |m| m[0])?;
    vm.push_u64(v as u64);
    Ok(())
}

fn i64_load16_s(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.with_mem(2, |m| i16::from_le_bytes([m[0], m[1]]))?;
    vm.push_i64(v as i64);
    Ok(())
}

fn i64_load16_u(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.with_mem(2, |m| u16::from_le_bytes([m[0], m[1]]))?;
    vm.push_u64(v as u64);
    Ok(())
}

fn i64_load32_s(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.with_mem(4, |m| i32::from_le_bytes([m[0], m[1], m[2], m[3]]))?;
    vm.push_i64(v as i64);
    Ok(())
}

fn i64_load32_u(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.with_mem(4, |m| u32::from_le_bytes([m[0], m[1], m[2], m[3]]))?;
    vm.push_u64(v as u64);
    Ok(())
}

fn f32_load(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.with_mem(4, |m| u32::from_le_bytes([m[0], m[1], m[2], m[3]]))?;
    vm.push_f32(f32::from_bits(v));
    Ok(())
}

fn f64_load(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.with_mem(8, |m| {
        u64::from_le_bytes([m[0], m[1], m[2], m[3], m[4], m[5], m[6], m[7]])
    })?;
    vm.push_f64(f64::from_bits(v));
    Ok(())
}

fn i32_store(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.pop_u32();
    vm.with_mem(4, |m| m.copy_from_slice(&v.to_le_bytes()))
}

fn i32_store8(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.pop_u32() as u8;
    vm.with_mem(1, |m| m[0] = v)
}

fn i32_store16(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.pop_u32() as u16;
    vm.with_mem(2, |m| m.copy_from_slice(&v.to_le_bytes()))
}

fn i64_store(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.pop_u64();
    vm.with_mem(8, |m| m.copy_from_slice(&v.to_le_bytes()))
}

fn i64_store8(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.pop_u64() as u8;
    vm.with_mem(1, |m| m[0] = v)
}

fn i64_store16(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.pop_u64() as u16;
    vm.with_mem(2, |m| m.copy_from_slice(&v.to_le_bytes()))
}

fn i64_store32(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.pop_u64() as u32;
    vm.with_mem(4, |m| m.copy_from_slice(&v.to_le_bytes()))
}

fn f32_store(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.pop_f32().to_bits();
    vm.with_mem(4, |m| m.copy_from_slice(&v.to_le_bytes()))
}

fn f64_store(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.pop_f64().to_bits();
    vm.with_mem(8, |m| m.copy_from_slice(&v.to_le_bytes()))
}

fn memory_size(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let _ = vm.fetch_u8(); // reserved
    let pages = vm.mem_pages();
    vm.push_i32(pages);
    Ok(())
}

fn memory_grow(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let _ = vm.fetch_u8(); // reserved
    let cur = vm.mem_pages();
    let n = vm.pop_i32();
    vm.mem_grow(n);
    vm.push_i32(cur);
    Ok(())
}

// ---- constants -------------------------------------------------------

fn i32_const(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.fetch_i32();
    vm.push_i32(v);
    Ok(())
}

fn i64_const(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.fetch_i64();
    vm.push_i64(v);
    Ok(())
}

fn f32_const(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.fetch_u32();
    vm.push_f32(f32::from_bits(v));
    Ok(())
}

fn f64_const(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.fetch_u64();
    vm.push_f64(f64::from_bits(v));
    Ok(())
}

// ---- i32 comparisons -------------------------------------------------

fn i32_eqz(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.pop_u32();
    vm.push_bool(v == 0);
    Ok(())
}

macro_rules! cmp_op {
    ($name:ident, $pop:ident, $op:tt) => {
        fn $name(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
            let b = vm.$pop();
            let a = vm.$pop();
            vm.push_bool(a $op b);
            Ok(())
        }
    };
}

cmp_op!(i32_eq, pop_u32, ==);
cmp_op!(i32_ne, pop_u32, !=);
cmp_op!(i32_lt_s, pop_i32, <);
cmp_op!(i32_lt_u, pop_u32, <);
cmp_op!(i32_gt_s, pop_i32, >);
cmp_op!(i32_gt_u, pop_u32, >);
cmp_op!(i32_le_s, pop_i32, <=);
cmp_op!(i32_le_u, pop_u32, <=);
cmp_op!(i32_ge_s, pop_i32, >=);
cmp_op!(i32_ge_u, pop_u32, >=);

fn i64_eqz(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.pop_u64();
    vm.push_bool(v == 0);
    Ok(())
}

cmp_op!(i64_eq, pop_u64, ==);
cmp_op!(i64_ne, pop_u64, !=);
cmp_op!(i64_lt_s, pop_i64, <);
cmp_op!(i64_lt_u, pop_u64, <);
cmp_op!(i64_gt_s, pop_i64, >);
cmp_op!(i64_gt_u, pop_u64, >);
cmp_op!(i64_le_s, pop_i64, <=);
cmp_op!(i64_le_u, pop_u64, <=);
cmp_op!(i64_ge_s, pop_i64, >=);
cmp_op!(i64_ge_u, pop_u64, >=);

cmp_op!(f32_eq, pop_f32, ==);
cmp_op!(f32_ne, pop_f32, !=);
cmp_op!(f32_lt, pop_f32, <);
cmp_op!(f32_gt, pop_f32, >);
cmp_op!(f32_le, pop_f32, <=);
cmp_op!(f32_ge, pop_f32, >=);
cmp_op!(f64_eq, pop_f64, ==);
cmp_op!(f64_ne, pop_f64, !=);
cmp_op!(f64_lt, pop_f64, <);
cmp_op!(f64_gt, pop_f64, >);
cmp_op!(f64_le, pop_f64, <=);
cmp_op!(f64_ge, pop_f64, >=);

// ---- integer arithmetic ----------------------------------------------

fn i32_clz(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.pop_u32();
    vm.push_u32(v.leading_zeros());
    Ok(())
}

fn i32_ctz(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.pop_u32();
    vm.push_u32(v.trailing_zeros());
    Ok(())
}

fn i32_popcnt(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.pop_u32();
    vm.push_u32(v.count_ones());
    Ok(())
}

macro_rules! bin_op {
    ($name:ident, $pop:ident, $push:ident, |$a:ident, $b:ident| $e:expr) => {
        fn $name(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
            let $b = vm.$pop();
            let $a = vm.$pop();
            vm.$push($e);
            Ok(())
        }
    };
}

bin_op!(i32_add, pop_u32, push_u32, |a, b| a.wrapping_add(b));
bin_op!(i32_sub, pop_u32, push_u32, |a, b| a.wrapping_sub(b));
bin_op!(i32_mul, pop_u32, push_u32, |a, b| a.wrapping_mul(b));
bin_op!(i32_and, pop_u32, push_u32, |a, b| a & b);
bin_op!(i32_or, pop_u32, push_u32, |a, b| a | b);
bin_op!(i32_xor, pop_u32, push_u32, |a, b| a ^ b);
bin_op!(i32_shl, pop_u32, push_u32, |a, b| a.wrapping_shl(b));
bin_op!(i32_shr_u, pop_u32, push_u32, |a, b| a.wrapping_shr(b));
bin_op!(i32_rotl, pop_u32, push_u32, |a, b| a.rotate_left(b & 31));
bin_op!(i32_rotr, pop_u32, push_u32, |a, b| a.rotate_right(b & 31));

fn i32_shr_s(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let b = vm.pop_u32();
    let a = vm.pop_i32();
    vm.push_i32(a.wrapping_shr(b));
    Ok(())
}

fn i32_div_s(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let b = vm.pop_i32();
    let a = vm.pop_i32();
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    if a == i32::MIN && b == -1 {
        return Err(Trap::IntegerOverflow);
    }
    vm.push_i32(a / b);
    Ok(())
}

fn i32_div_u(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let b = vm.pop_u32();
    let a = vm.pop_u32();
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    vm.push_u32(a / b);
    Ok(())
}

fn i32_rem_s(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let b = vm.pop_i32();
    let a = vm.pop_i32();
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    vm.push_i32(a.wrapping_rem(b));
    Ok(())
}

fn i32_rem_u(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let b = vm.pop_u32();
    let a = vm.pop_u32();
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    vm.push_u32(a % b);
    Ok(())
}

fn i64_clz(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.pop_u64();
    vm.push_u64(v.leading_zeros() as u64);
    Ok(())
}

fn i64_ctz(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.pop_u64();
    vm.push_u64(v.trailing_zeros() as u64);
    Ok(())
}

fn i64_popcnt(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let v = vm.pop_u64();
    vm.push_u64(v.count_ones() as u64);
    Ok(())
}

bin_op!(i64_add, pop_u64, push_u64, |a, b| a.wrapping_add(b));
bin_op!(i64_sub, pop_u64, push_u64, |a, b| a.wrapping_sub(b));
bin_op!(i64_mul, pop_u64, push_u64, |a, b| a.wrapping_mul(b));
bin_op!(i64_and, pop_u64, push_u64, |a, b| a & b);
bin_op!(i64_or, pop_u64, push_u64, |a, b| a | b);
bin_op!(i64_xor, pop_u64, push_u64, |a, b| a ^ b);

fn i64_shl(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let b = vm.pop_u64();
    let a = vm.pop_u64();
    vm.push_u64(a.wrapping_shl(b as u32));
    Ok(())
}

fn i64_shr_u(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let b = vm.pop_u64();
    let a = vm.pop_u64();
    vm.push_u64(a.wrapping_shr(b as u32));
    Ok(())
}

fn i64_shr_s(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let b = vm.pop_u64();
    let a = vm.pop_i64();
    vm.push_i64(a.wrapping_shr(b as u32));
    Ok(())
}

fn i64_rotl(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let b = vm.pop_u64();
    let a = vm.pop_u64();
    vm.push_u64(a.rotate_left((b & 63) as u32));
    Ok(())
}

fn i64_rotr(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let b = vm.pop_u64();
    let a = vm.pop_u64();
    vm.push_u64(a.rotate_right((b & 63) as u32));
    Ok(())
}

fn i64_div_s(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let b = vm.pop_i64();
    let a = vm.pop_i64();
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    if a == i64::MIN && b == -1 {
        return Err(Trap::IntegerOverflow);
    }
    vm.push_i64(a / b);
    Ok(())
}

fn i64_div_u(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let b = vm.pop_u64();
    let a = vm.pop_u64();
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    vm.push_u64(a / b);
    Ok(())
}

fn i64_rem_s(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let b = vm.pop_i64();
    let a = vm.pop_i64();
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    vm.push_i64(a.wrapping_rem(b));
    Ok(())
}

fn i64_rem_u(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let b = vm.pop_u64();
    let a = vm.pop_u64();
    if b == 0 {
        return Err(Trap::IntegerDivideByZero);
    }
    vm.push_u64(a % b);
    Ok(())
}

// ---- float arithmetic ------------------------------------------------

macro_rules! f_unary {
    ($name:ident, $pop:ident, $push:ident, |$a:ident| $e:expr) => {
        fn $name(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
            let $a = vm.$pop();
            vm.$push($e);
            Ok(())
        }
    };
}

f_unary!(f32_abs, pop_f32, push_f32, |a| a.abs());
f_unary!(f32_neg, pop_f32, push_f32, |a| -a);
f_unary!(f32_ceil, pop_f32, push_f32, |a| a.ceil());
f_unary!(f32_floor, pop_f32, push_f32, |a| a.floor());
f_unary!(f32_trunc, pop_f32, push_f32, |a| a.trunc());
f_unary!(f32_nearest, pop_f32, push_f32, |a| nearest32(a));
f_unary!(f32_sqrt, pop_f32, push_f32, |a| a.sqrt());
f_unary!(f64_abs, pop_f64, push_f64, |a| a.abs());
f_unary!(f64_neg, pop_f64, push_f64, |a| -a);
f_unary!(f64_ceil, pop_f64, push_f64, |a| a.ceil());
f_unary!(f64_floor, pop_f64, push_f64, |a| a.floor());
f_unary!(f64_trunc, pop_f64, push_f64, |a| a.trunc());
f_unary!(f64_nearest, pop_f64, push_f64, |a| nearest64(a));
f_unary!(f64_sqrt, pop_f64, push_f64, |a| a.sqrt());

bin_op!(f32_add, pop_f32, push_f32, |a, b| a + b);
bin_op!(f32_sub, pop_f32, push_f32, |a, b| a - b);
bin_op!(f32_mul, pop_f32, push_f32, |a, b| a * b);
bin_op!(f32_div, pop_f32, push_f32, |a, b| a / b);
bin_op!(f32_copysign, pop_f32, push_f32, |a, b| a.copysign(b));
bin_op!(f64_add, pop_f64, push_f64, |a, b| a + b);
bin_op!(f64_sub, pop_f64, push_f64, |a, b| a - b);
bin_op!(f64_mul, pop_f64, push_f64, |a, b| a * b);
bin_op!(f64_div, pop_f64, push_f64, |a, b| a / b);
bin_op!(f64_copysign, pop_f64, push_f64, |a, b| a.copysign(b));

fn f32_min(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let b = vm.pop_f32();
    let a = vm.pop_f32();
    vm.push_f32(if a.is_nan() || b.is_nan() {
        f32::NAN
    } else {
        a.min(b)
    });
    Ok(())
}

fn f32_max(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let b = vm.pop_f32();
    let a = vm.pop_f32();
    vm.push_f32(if a.is_nan() || b.is_nan() {
        f32::NAN
    } else {
        a.max(b)
    });
    Ok(())
}

fn f64_min(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let b = vm.pop_f64();
    let a = vm.pop_f64();
    vm.push_f64(if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.min(b)
    });
    Ok(())
}

fn f64_max(vm: &mut Vm, _ctx: &HostCtx<'_>) -> R {
    let b = vm.pop_f64();
    let a = vm.pop_f64();
    vm.push_f64(if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.max(b)
    });
    Ok(())
}

/// Round-half-to-even, the WebAssembly `nearest` semantics.
fn nearest32(v: f32) -> f32 {
    let r = v.round();
    if (r - v).abs() == 0.5 && r % 2.0 != 0.0 {
        r - v.signum()
    } else {
        r
    }
}

fn nearest64(v: f64) -> f64 {
    let r = v.round();
    if (r - v).abs() == 0.5 && r % 2.0 != 0.0 {
        r - v.signum()
    } else {
        r
    }
}

// ---- conversions -----------------------------------------------------

f_unary!(i32_wrap_i64, pop_u64, push_u32, |a| a as u32);
f_unary!(i32_trunc_f32_s, pop_f32, push_i32, |a| a as i32);
f_unary!(i32_trunc_f32_u, pop_f32, push_u32, |a| a as u32);
f_unary!(i32_trunc_f64_s, pop_f64, push_i32, |a| a as i32);
f_unary!(i32_trunc_f64_u, pop_f64, push_u32, |a| a as u32);
f_unary!(i64_extend_i32_s, pop_i32, push_i64, |a| a as i64);
f_unary!(i64_extend_i32_u, pop_u32, push_u64, |a| a as u64);
f_unary!(i64_trunc_f32_s, pop_f32, push_i64, |a| a as i64);
f_unary!(i64_trunc_f32_u, pop_f32, push_u64, |a| a as u64);
f_unary!(i64_trunc_f64_s, pop_f64, push_i64, |a| a as i64);
f_unary!(i64_trunc_f64_u, pop_f64, push_u64, |a| a as u64);
f_unary!(f32_convert_i32_s, pop_i32, push_f32, |a| a as f32);
f_unary!(f32_convert_i32_u, pop_u32, push_f32, |a| a as f32);
f_unary!(f32_convert_i64_s, pop_i64, push_f32, |a| a as f32);
f_unary!(f32_convert_i64_u, pop_u64, push_f32, |a| a as f32);
f_unary!(f32_demote_f64, pop_f64, push_f32, |a| a as f32);
f_unary!(f64_convert_i32_s, pop_i32, push_f64, |a| a as f64);
f_unary!(f64_convert_i32_u, pop_u32, push_f64, |a| a as f64);
f_unary!(f64_convert_i64_s, pop_i64, push_f64, |a| a as f64);
f_unary!(f64_convert_i64_u, pop_u64, push_f64, |a| a as f64);
f_unary!(f64_promote_f32, pop_f32, push_f64, |a| a as f64);
f_unary!(i32_reinterpret_f32, pop_f32, push_u32, |a| a.to_bits());
f_unary!(i64_reinterpret_f64, pop_f64, push_u64, |a| a.to_bits());
f_unary!(f32_reinterpret_i32, pop_u32, push_f32, |a| f32::from_bits(a));
f_unary!(f64_reinterpret_i64, pop_u64, push_f64, |a| f64::from_bits(a));
