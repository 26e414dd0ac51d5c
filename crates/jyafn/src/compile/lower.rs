//! Lowering of a folded graph into Cranelift IR.
//!
//! The generated function has signature `(env, input, output, ctx)`, all
//! pointers. Nodes lower in graph order, so every operand is already
//! materialized when it is used. `choose` lowers to a branchless `select`
//! (the DAG evaluates both branch nodes eagerly by construction). `assert`
//! and every fallible helper call lower to a conditional store of a nonzero
//! code into the status word at `ctx + 0` followed by an early return.

use std::collections::HashMap;

use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::{
    AbiParam, ExtFuncData, ExternalName, Function as ClifFunction, InstBuilder, MemFlags,
    Signature, StackSlot, StackSlotData, StackSlotKind, UserExternalName, UserFuncName, Value,
    types,
};
use cranelift_codegen::isa::{CallConv, TargetIsa};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};

use crate::compile::fold::{Resolution, resolve};
use crate::compile::helpers::HostCall;
use crate::error::CompilationError;
use crate::function::STATUS_INDEX_OOB;
use crate::graph::{Graph, NodeId};
use crate::op::{Const, Op, ScalarBinary, ScalarTest, ScalarUnary};
use crate::types::Type;

pub(crate) fn lower(
    graph: &Graph,
    resolution: &[Resolution],
    isa: &dyn TargetIsa,
) -> Result<ClifFunction, CompilationError> {
    let ptr = isa.pointer_type();
    let call_conv = isa.default_call_conv();
    let mut sig = Signature::new(call_conv);
    for _ in 0..4 {
        sig.params.push(AbiParam::new(ptr));
    }
    let mut func = ClifFunction::with_name_signature(UserFuncName::user(0, 0), sig);
    let mut fb_ctx = FunctionBuilderContext::new();
    let mut b = FunctionBuilder::new(&mut func, &mut fb_ctx);

    let entry = b.create_block();
    b.append_block_params_for_function_params(entry);
    b.switch_to_block(entry);
    let params = b.block_params(entry).to_vec();

    let mut lowerer = Lowerer {
        graph,
        resolution,
        env: params[0],
        input: params[1],
        output: params[2],
        ctx: params[3],
        vals: vec![None; graph.len()],
        helpers: HashMap::new(),
        call_conv,
        ptr,
    };

    for index in 0..graph.len() {
        lowerer.lower_node(&mut b, index)?;
    }
    lowerer.emit_return(&mut b);

    b.seal_all_blocks();
    b.finalize();
    Ok(func)
}

struct Lowerer<'a> {
    graph: &'a Graph,
    resolution: &'a [Resolution],
    env: Value,
    input: Value,
    output: Value,
    ctx: Value,
    vals: Vec<Option<Value>>,
    helpers: HashMap<HostCall, cranelift_codegen::ir::FuncRef>,
    call_conv: CallConv,
    ptr: types::Type,
}

impl Lowerer<'_> {
    fn value_of(&self, id: NodeId) -> Value {
        let id = resolve(self.resolution, id);
        self.vals[id.index()].expect("operands lower before their users")
    }

    fn helper_signature(&self, call: HostCall) -> Signature {
        use HostCall::*;
        let mut sig = Signature::new(self.call_conv);
        let (params, ret): (Vec<types::Type>, types::Type) = match call {
            Exp | Ln | Log10 | Sin | Cos | Tan | Asin | Acos | Atan | Round => {
                (vec![types::F64], types::F64)
            }
            Pow | Fmod | Atan2 | FMin | FMax => (vec![types::F64, types::F64], types::F64),
            DtField => (vec![types::I64, types::I64], types::F64),
            DtParse | DtFormat => (
                vec![self.ptr, self.ptr, types::I64, types::I64, self.ptr],
                types::I64,
            ),
            MapGet | CallGraph => (
                vec![self.ptr, self.ptr, types::I64, self.ptr, self.ptr],
                types::I64,
            ),
            MapGetOr => (
                vec![self.ptr, self.ptr, types::I64, self.ptr, self.ptr, self.ptr],
                types::I64,
            ),
            ResourceCall => (
                vec![self.ptr, self.ptr, types::I64, types::I64, self.ptr, self.ptr],
                types::I64,
            ),
        };
        for param in params {
            sig.params.push(AbiParam::new(param));
        }
        sig.returns.push(AbiParam::new(ret));
        sig
    }

    fn helper_ref(
        &mut self,
        b: &mut FunctionBuilder,
        call: HostCall,
    ) -> cranelift_codegen::ir::FuncRef {
        if let Some(existing) = self.helpers.get(&call) {
            return *existing;
        }
        let name = b.func.declare_imported_user_function(UserExternalName {
            namespace: 0,
            index: call.index(),
        });
        let signature = b.func.import_signature(self.helper_signature(call));
        let func_ref = b.func.import_function(ExtFuncData {
            name: ExternalName::User(name),
            signature,
            colocated: false,
            patchable: false,
        });
        self.helpers.insert(call, func_ref);
        func_ref
    }

    fn call_helper(&mut self, b: &mut FunctionBuilder, call: HostCall, args: &[Value]) -> Value {
        let func_ref = self.helper_ref(b, call);
        let inst = b.ins().call(func_ref, args);
        b.inst_results(inst)[0]
    }

    /// Branch to an early return that stores `status` into the status word
    /// when it is nonzero.
    fn check_status(&mut self, b: &mut FunctionBuilder, status: Value) {
        let fail = b.create_block();
        let cont = b.create_block();
        let is_err = b.ins().icmp_imm(IntCC::NotEqual, status, 0);
        b.ins().brif(is_err, fail, &[], cont, &[]);
        b.switch_to_block(fail);
        b.ins().store(MemFlags::trusted(), status, self.ctx, 0);
        b.ins().return_(&[]);
        b.switch_to_block(cont);
    }

    fn stack_slot(&self, b: &mut FunctionBuilder, words: usize) -> StackSlot {
        b.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            (words.max(1) * 8) as u32,
            3,
        ))
    }

    /// Store a typed value as a 64-bit word into a stack slot.
    fn store_word(
        &self,
        b: &mut FunctionBuilder,
        slot: StackSlot,
        word: usize,
        value: Value,
        ty: Type,
    ) {
        let offset = (word * 8) as i32;
        match ty {
            Type::Bool => {
                let wide = b.ins().uextend(types::I64, value);
                b.ins().stack_store(wide, slot, offset);
            }
            _ => {
                b.ins().stack_store(value, slot, offset);
            }
        }
    }

    /// Load a typed value from a 64-bit word behind a pointer.
    fn load_word(&self, b: &mut FunctionBuilder, base: Value, word: usize, ty: Type) -> Value {
        let offset = (word * 8) as i32;
        match ty {
            Type::Float => b.ins().load(types::F64, MemFlags::trusted(), base, offset),
            Type::Bool => {
                let wide = b.ins().load(types::I64, MemFlags::trusted(), base, offset);
                b.ins().icmp_imm(IntCC::NotEqual, wide, 0)
            }
            _ => b.ins().load(types::I64, MemFlags::trusted(), base, offset),
        }
    }

    /// Fill a fresh stack slot with typed operands and return its address.
    fn fill_slot(
        &mut self,
        b: &mut FunctionBuilder,
        operands: &[NodeId],
        types_of: &[Type],
    ) -> Value {
        let slot = self.stack_slot(b, operands.len());
        for (word, (id, ty)) in operands.iter().zip(types_of).enumerate() {
            let value = self.value_of(*id);
            self.store_word(b, slot, word, value, *ty);
        }
        b.ins().stack_addr(self.ptr, slot, 0)
    }

    fn emit_const(&mut self, b: &mut FunctionBuilder, c: Const) -> Value {
        match c {
            Const::Scalar(x) => b.ins().f64const(x),
            Const::Bool(v) => b.ins().iconst(types::I8, v as i64),
            Const::Symbol(id) => b.ins().iconst(types::I64, id as i64),
            Const::DateTime(micros) => b.ins().iconst(types::I64, micros),
        }
    }

    fn lower_node(&mut self, b: &mut FunctionBuilder, index: usize) -> Result<(), CompilationError> {
        match self.resolution[index] {
            Resolution::Elide => return Ok(()),
            Resolution::Alias(target) => {
                self.vals[index] = self.vals[target.index()];
                return Ok(());
            }
            Resolution::Const(c) => {
                let value = self.emit_const(b, c);
                self.vals[index] = Some(value);
                return Ok(());
            }
            Resolution::Keep => {}
        }

        let node = self.graph.node(NodeId::new(index));
        let arg_ids: Vec<NodeId> = node.args.iter().copied().collect();
        let arg_types: Vec<Type> = arg_ids
            .iter()
            .map(|id| self.graph.node(resolve(self.resolution, *id)).ty)
            .collect();

        let value = match &node.op {
            Op::Input { slot, ty } => Some(self.load_word(b, self.input, *slot as usize, *ty)),
            Op::Const(c) => Some(self.emit_const(b, *c)),
            Op::ScalarUnary(op) => {
                let x = self.value_of(arg_ids[0]);
                Some(match op {
                    ScalarUnary::Neg => b.ins().fneg(x),
                    ScalarUnary::Abs => b.ins().fabs(x),
                    ScalarUnary::Sqrt => b.ins().sqrt(x),
                    ScalarUnary::Floor => b.ins().floor(x),
                    ScalarUnary::Ceil => b.ins().ceil(x),
                    ScalarUnary::Exp => self.call_helper(b, HostCall::Exp, &[x]),
                    ScalarUnary::Ln => self.call_helper(b, HostCall::Ln, &[x]),
                    ScalarUnary::Log => self.call_helper(b, HostCall::Log10, &[x]),
                    ScalarUnary::Sin => self.call_helper(b, HostCall::Sin, &[x]),
                    ScalarUnary::Cos => self.call_helper(b, HostCall::Cos, &[x]),
                    ScalarUnary::Tan => self.call_helper(b, HostCall::Tan, &[x]),
                    ScalarUnary::Asin => self.call_helper(b, HostCall::Asin, &[x]),
                    ScalarUnary::Acos => self.call_helper(b, HostCall::Acos, &[x]),
                    ScalarUnary::Atan => self.call_helper(b, HostCall::Atan, &[x]),
                    ScalarUnary::Round => self.call_helper(b, HostCall::Round, &[x]),
                })
            }
            Op::ScalarTest(op) => {
                let x = self.value_of(arg_ids[0]);
                Some(match op {
                    ScalarTest::IsNan => b.ins().fcmp(FloatCC::NotEqual, x, x),
                    ScalarTest::IsFinite => {
                        let magnitude = b.ins().fabs(x);
                        let infinity = b.ins().f64const(f64::INFINITY);
                        b.ins().fcmp(FloatCC::LessThan, magnitude, infinity)
                    }
                    ScalarTest::IsInfinite => {
                        let magnitude = b.ins().fabs(x);
                        let infinity = b.ins().f64const(f64::INFINITY);
                        b.ins().fcmp(FloatCC::Equal, magnitude, infinity)
                    }
                })
            }
            Op::ScalarBinary(op) => {
                let x = self.value_of(arg_ids[0]);
                let y = self.value_of(arg_ids[1]);
                Some(match op {
                    ScalarBinary::Add => b.ins().fadd(x, y),
                    ScalarBinary::Sub => b.ins().fsub(x, y),
                    ScalarBinary::Mul => b.ins().fmul(x, y),
                    ScalarBinary::Div => b.ins().fdiv(x, y),
                    ScalarBinary::Rem => self.call_helper(b, HostCall::Fmod, &[x, y]),
                    ScalarBinary::Pow => self.call_helper(b, HostCall::Pow, &[x, y]),
                    ScalarBinary::Atan2 => self.call_helper(b, HostCall::Atan2, &[x, y]),
                    ScalarBinary::Min => self.call_helper(b, HostCall::FMin, &[x, y]),
                    ScalarBinary::Max => self.call_helper(b, HostCall::FMax, &[x, y]),
                })
            }
            Op::Compare(cmp) => {
                let x = self.value_of(arg_ids[0]);
                let y = self.value_of(arg_ids[1]);
                let cc = match cmp {
                    crate::op::Comparison::Eq => FloatCC::Equal,
                    crate::op::Comparison::Ne => FloatCC::NotEqual,
                    crate::op::Comparison::Lt => FloatCC::LessThan,
                    crate::op::Comparison::Le => FloatCC::LessThanOrEqual,
                    crate::op::Comparison::Gt => FloatCC::GreaterThan,
                    crate::op::Comparison::Ge => FloatCC::GreaterThanOrEqual,
                };
                Some(b.ins().fcmp(cc, x, y))
            }
            Op::SymbolEq => {
                let x = self.value_of(arg_ids[0]);
                let y = self.value_of(arg_ids[1]);
                Some(b.ins().icmp(IntCC::Equal, x, y))
            }
            Op::SymbolNe => {
                let x = self.value_of(arg_ids[0]);
                let y = self.value_of(arg_ids[1]);
                Some(b.ins().icmp(IntCC::NotEqual, x, y))
            }
            Op::BoolBinary(op) => {
                let x = self.value_of(arg_ids[0]);
                let y = self.value_of(arg_ids[1]);
                Some(match op {
                    crate::op::BoolBinary::And => b.ins().band(x, y),
                    crate::op::BoolBinary::Or => b.ins().bor(x, y),
                    crate::op::BoolBinary::Xor => b.ins().bxor(x, y),
                })
            }
            Op::Not => {
                let x = self.value_of(arg_ids[0]);
                Some(b.ins().bxor_imm(x, 1))
            }
            Op::Choose => {
                let cond = self.value_of(arg_ids[0]);
                let then = self.value_of(arg_ids[1]);
                let else_ = self.value_of(arg_ids[2]);
                Some(b.ins().select(cond, then, else_))
            }
            Op::Assert { message } => {
                let cond = self.value_of(arg_ids[0]);
                let ok = b.create_block();
                let fail = b.create_block();
                b.ins().brif(cond, ok, &[], fail, &[]);
                b.switch_to_block(fail);
                let code = b.ins().iconst(types::I64, (*message as i64) + 1);
                b.ins().store(MemFlags::trusted(), code, self.ctx, 0);
                b.ins().return_(&[]);
                b.switch_to_block(ok);
                None
            }
            Op::FromTimestamp => {
                let secs = self.value_of(arg_ids[0]);
                let million = b.ins().f64const(1e6);
                let micros = b.ins().fmul(secs, million);
                Some(b.ins().fcvt_to_sint_sat(types::I64, micros))
            }
            Op::Timestamp => {
                let micros = self.value_of(arg_ids[0]);
                let scalar = b.ins().fcvt_from_sint(types::F64, micros);
                let million = b.ins().f64const(1e6);
                Some(b.ins().fdiv(scalar, million))
            }
            Op::Extract(field) => {
                let micros = self.value_of(arg_ids[0]);
                let code = b.ins().iconst(types::I64, field.code() as i64);
                Some(self.call_helper(b, HostCall::DtField, &[micros, code]))
            }
            Op::ParseDateTime { format } => {
                let text = self.value_of(arg_ids[0]);
                let slot = self.stack_slot(b, 1);
                let out = b.ins().stack_addr(self.ptr, slot, 0);
                let format = b.ins().iconst(types::I64, *format as i64);
                let args = [self.env, self.ctx, text, format, out];
                let status = self.call_helper(b, HostCall::DtParse, &args);
                self.check_status(b, status);
                Some(b.ins().stack_load(types::I64, slot, 0))
            }
            Op::FormatDateTime { format } => {
                let micros = self.value_of(arg_ids[0]);
                let slot = self.stack_slot(b, 1);
                let out = b.ins().stack_addr(self.ptr, slot, 0);
                let format = b.ins().iconst(types::I64, *format as i64);
                let args = [self.env, self.ctx, micros, format, out];
                let status = self.call_helper(b, HostCall::DtFormat, &args);
                self.check_status(b, status);
                Some(b.ins().stack_load(types::I64, slot, 0))
            }
            Op::ListGet { len } => {
                let element_ty = node.ty;
                let index = self.value_of(arg_ids[0]);
                let slot = self.stack_slot(b, *len as usize);
                for (word, id) in arg_ids[1..].iter().enumerate() {
                    let value = self.value_of(*id);
                    self.store_word(b, slot, word, value, element_ty);
                }
                let index_int = b.ins().fcvt_to_sint_sat(types::I64, index);
                let ordered = b.ins().fcmp(FloatCC::Ordered, index, index);
                let length = b.ins().iconst(types::I64, *len as i64);
                let in_bounds = b.ins().icmp(IntCC::UnsignedLessThan, index_int, length);
                let ok = b.ins().band(ordered, in_bounds);
                let cont = b.create_block();
                let fail = b.create_block();
                b.ins().brif(ok, cont, &[], fail, &[]);
                b.switch_to_block(fail);
                let code = b.ins().iconst(types::I64, STATUS_INDEX_OOB as i64);
                b.ins().store(MemFlags::trusted(), code, self.ctx, 0);
                b.ins().return_(&[]);
                b.switch_to_block(cont);
                let base = b.ins().stack_addr(self.ptr, slot, 0);
                let byte_offset = b.ins().ishl_imm(index_int, 3);
                let address = b.ins().iadd(base, byte_offset);
                Some(self.load_word(b, address, 0, element_ty))
            }
            Op::MapGet {
                mapping,
                key_width,
                value_width,
            } => {
                let key = self.fill_slot(b, &arg_ids, &arg_types);
                let out_slot = self.stack_slot(b, *value_width as usize);
                let out = b.ins().stack_addr(self.ptr, out_slot, 0);
                let id = b.ins().iconst(types::I64, *mapping as i64);
                let args = [self.env, self.ctx, id, key, out];
                let status = self.call_helper(b, HostCall::MapGet, &args);
                self.check_status(b, status);
                debug_assert_eq!(arg_ids.len(), *key_width as usize);
                Some(out)
            }
            Op::MapGetOr {
                mapping,
                key_width,
                value_width,
            } => {
                let split = *key_width as usize;
                let key = self.fill_slot(b, &arg_ids[..split], &arg_types[..split]);
                let default = self.fill_slot(b, &arg_ids[split..], &arg_types[split..]);
                let out_slot = self.stack_slot(b, *value_width as usize);
                let out = b.ins().stack_addr(self.ptr, out_slot, 0);
                let id = b.ins().iconst(types::I64, *mapping as i64);
                let args = [self.env, self.ctx, id, key, default, out];
                let status = self.call_helper(b, HostCall::MapGetOr, &args);
                self.check_status(b, status);
                Some(out)
            }
            Op::ResourceCall {
                resource,
                method,
                output_width,
                ..
            } => {
                let input = self.fill_slot(b, &arg_ids, &arg_types);
                let out_slot = self.stack_slot(b, *output_width as usize);
                let out = b.ins().stack_addr(self.ptr, out_slot, 0);
                let resource = b.ins().iconst(types::I64, *resource as i64);
                let method = b.ins().iconst(types::I64, *method as i64);
                let args = [self.env, self.ctx, resource, method, input, out];
                let status = self.call_helper(b, HostCall::ResourceCall, &args);
                self.check_status(b, status);
                Some(out)
            }
            Op::CallGraph {
                subgraph,
                output_width,
                ..
            } => {
                let input = self.fill_slot(b, &arg_ids, &arg_types);
                let out_slot = self.stack_slot(b, *output_width as usize);
                let out = b.ins().stack_addr(self.ptr, out_slot, 0);
                let id = b.ins().iconst(types::I64, *subgraph as i64);
                let args = [self.env, self.ctx, id, input, out];
                let status = self.call_helper(b, HostCall::CallGraph, &args);
                self.check_status(b, status);
                Some(out)
            }
            Op::LoadSlot { offset, ty } => {
                let base = self.value_of(arg_ids[0]);
                Some(self.load_word(b, base, *offset as usize, *ty))
            }
        };
        self.vals[index] = value;
        Ok(())
    }

    fn emit_return(&mut self, b: &mut FunctionBuilder) {
        let (outputs, _) = self.graph.ret().expect("closed graphs have a return");
        for (word, id) in outputs.iter().enumerate() {
            let id = resolve(self.resolution, *id);
            let value = self.vals[id.index()].expect("return nodes are lowered");
            let ty = self.graph.node(id).ty;
            let offset = (word * 8) as i32;
            match ty {
                Type::Bool => {
                    let wide = b.ins().uextend(types::I64, value);
                    b.ins().store(MemFlags::trusted(), wide, self.output, offset);
                }
                _ => {
                    b.ins().store(MemFlags::trusted(), value, self.output, offset);
                }
            }
        }
        b.ins().return_(&[]);
    }
}
