use crate::language::types::MatchClass;
use crate::vm::error::{RuntimeError, RuntimeResult};
use crate::vm::instruction::{self, Instruction, Opcode};
use crate::vm::program::{Handler, Program};
use crate::vm::runtime::{Params, Runtime};
use crate::vm::value::Value;
use std::any::Any;

/// Per-run instruction budget; `None` means unlimited.
pub type Quota = Option<u64>;

pub const NO_QUOTA: Quota = None;

/// Invoked before each instruction executes with `(instruction, ip, sp)`.
pub type TraceLogger<'a> = &'a mut dyn FnMut(Instruction, usize, usize);

/// One handler invocation. Binds the handler, the host's userdata, the
/// interpreter-owned globals vector, a step quota and an optional trace
/// callback; dropped when `run` returns.
pub struct Runner<'a, 'g, 'u, 't> {
    program: &'a Program,
    runtime: &'a Runtime,
    handler: &'a Handler,
    globals: &'g mut Vec<Value>,
    userdata: Option<&'u mut dyn Any>,
    quota: Quota,
    trace: Option<TraceLogger<'t>>,
    stack: Vec<Value>,
    regexp_groups: Vec<String>,
}

impl<'a, 'g, 'u, 't> Runner<'a, 'g, 'u, 't> {
    pub fn new(
        program: &'a Program,
        runtime: &'a Runtime,
        handler: &'a Handler,
        globals: &'g mut Vec<Value>,
        userdata: Option<&'u mut dyn Any>,
        quota: Quota,
        trace: Option<TraceLogger<'t>>,
    ) -> Self {
        Self {
            program,
            runtime,
            handler,
            globals,
            userdata,
            quota,
            trace,
            stack: Vec::with_capacity(handler.stack_size()),
            regexp_groups: Vec::new(),
        }
    }

    /// Runs the handler to completion, quota exhaustion or error and
    /// returns its boolean decision. Exhausting the quota yields the
    /// current decision, which is false while no EXIT has executed.
    pub fn run(mut self) -> RuntimeResult<bool> {
        let code = self.handler.code();
        let mut ip = 0usize;

        loop {
            let instr = match code.get(ip) {
                Some(&instr) => instr,
                None => return Ok(false),
            };

            if let Some(trace) = self.trace.as_mut() {
                trace(instr, ip, self.stack.len());
            }

            if let Some(remaining) = self.quota.as_mut() {
                if *remaining == 0 {
                    return Ok(false);
                }
                *remaining -= 1;
            }

            let op = instruction::opcode(instr);
            let a = instruction::operand_a(instr);
            let b = instruction::operand_b(instr);
            let c = instruction::operand_c(instr);
            ip += 1;

            let pool = self.program.constants();
            match op {
                Opcode::NOP => {}

                // loads
                Opcode::ILOAD => self.stack.push(Value::Number(i64::from(a))),
                Opcode::NLOAD => self.stack.push(Value::Number(pool.number(a as usize))),
                Opcode::SLOAD => self
                    .stack
                    .push(Value::String(pool.string(a as usize).to_string())),
                Opcode::PLOAD => self.stack.push(Value::IPAddress(pool.ipaddr(a as usize))),
                Opcode::CLOAD => self.stack.push(Value::Cidr(pool.cidr(a as usize))),
                Opcode::RLOAD => self
                    .stack
                    .push(Value::RegExp(pool.regexp(a as usize).clone())),
                Opcode::HLOAD => self.stack.push(Value::Handler(a as usize)),
                Opcode::ITLOAD => self
                    .stack
                    .push(Value::IntArray(pool.int_array(a as usize).clone())),
                Opcode::STLOAD => self
                    .stack
                    .push(Value::StringArray(pool.string_array(a as usize).clone())),
                Opcode::PTLOAD => self
                    .stack
                    .push(Value::IPAddrArray(pool.ipaddr_array(a as usize).clone())),
                Opcode::CTLOAD => self
                    .stack
                    .push(Value::CidrArray(pool.cidr_array(a as usize).clone())),
                Opcode::POP => {
                    self.pop(ip)?;
                }

                // memory
                Opcode::ALLOCA => {
                    let new_len = self.stack.len() + a as usize;
                    self.stack.resize(new_len, Value::Void);
                }
                Opcode::LOAD => {
                    let value = self.stack[a as usize].clone();
                    self.stack.push(value);
                }
                Opcode::STORE => {
                    let value = self.pop(ip)?;
                    self.stack[a as usize] = value;
                }
                Opcode::GLOAD => {
                    let value = self.globals[a as usize].clone();
                    self.stack.push(value);
                }
                Opcode::GSTORE => {
                    let value = self.pop(ip)?;
                    self.globals[a as usize] = value;
                }

                // numeric
                Opcode::NADD => self.numeric_binop(ip, |l, r| l.wrapping_add(r))?,
                Opcode::NSUB => self.numeric_binop(ip, |l, r| l.wrapping_sub(r))?,
                Opcode::NMUL => self.numeric_binop(ip, |l, r| l.wrapping_mul(r))?,
                Opcode::NDIV => {
                    let (l, r) = self.pop_numbers(ip)?;
                    if r == 0 {
                        return Err(RuntimeError::DivisionByZero);
                    }
                    self.stack.push(Value::Number(l.wrapping_div(r)));
                }
                Opcode::NREM => {
                    let (l, r) = self.pop_numbers(ip)?;
                    if r == 0 {
                        return Err(RuntimeError::DivisionByZero);
                    }
                    self.stack.push(Value::Number(l.wrapping_rem(r)));
                }
                Opcode::NPOW => self.numeric_binop(ip, pow)?,
                Opcode::NSHL => self.numeric_binop(ip, |l, r| l.wrapping_shl(r as u32))?,
                Opcode::NSHR => self.numeric_binop(ip, |l, r| l.wrapping_shr(r as u32))?,
                Opcode::NAND => self.numeric_binop(ip, |l, r| l & r)?,
                Opcode::NOR => self.numeric_binop(ip, |l, r| l | r)?,
                Opcode::NXOR => self.numeric_binop(ip, |l, r| l ^ r)?,
                Opcode::NNEG => {
                    let value = self.pop(ip)?.as_number();
                    self.stack.push(Value::Number(value.wrapping_neg()));
                }
                Opcode::NNOT => {
                    let value = self.pop(ip)?.as_number();
                    self.stack.push(Value::Number(!value));
                }
                Opcode::NCMPZ => {
                    let value = self.pop(ip)?.as_number();
                    self.stack.push(Value::Boolean(value == 0));
                }
                Opcode::NCMPEQ => self.numeric_compare(ip, |l, r| l == r)?,
                Opcode::NCMPNE => self.numeric_compare(ip, |l, r| l != r)?,
                Opcode::NCMPLE => self.numeric_compare(ip, |l, r| l <= r)?,
                Opcode::NCMPGE => self.numeric_compare(ip, |l, r| l >= r)?,
                Opcode::NCMPLT => self.numeric_compare(ip, |l, r| l < r)?,
                Opcode::NCMPGT => self.numeric_compare(ip, |l, r| l > r)?,

                // boolean
                Opcode::BAND => self.boolean_binop(ip, |l, r| l && r)?,
                Opcode::BOR => self.boolean_binop(ip, |l, r| l || r)?,
                Opcode::BXOR => self.boolean_binop(ip, |l, r| l ^ r)?,
                Opcode::BNOT => {
                    let value = self.pop(ip)?.truthy();
                    self.stack.push(Value::Boolean(!value));
                }

                // strings
                Opcode::SADD => {
                    let (l, r) = self.pop_strings(ip)?;
                    self.stack.push(Value::String(l + &r));
                }
                Opcode::SCMPEQ => self.string_compare(ip, |l, r| l == r)?,
                Opcode::SCMPNE => self.string_compare(ip, |l, r| l != r)?,
                Opcode::SCMPLE => self.string_compare(ip, |l, r| l <= r)?,
                Opcode::SCMPGE => self.string_compare(ip, |l, r| l >= r)?,
                Opcode::SCMPLT => self.string_compare(ip, |l, r| l < r)?,
                Opcode::SCMPGT => self.string_compare(ip, |l, r| l > r)?,
                Opcode::SCMPBEG => self.string_compare(ip, |l, r| l.starts_with(r))?,
                Opcode::SCMPEND => self.string_compare(ip, |l, r| l.ends_with(r))?,
                Opcode::SCONTAINS => self.string_compare(ip, |l, r| r.contains(l))?,
                Opcode::SLEN => {
                    let value = self.pop_string(ip)?;
                    self.stack.push(Value::Number(value.len() as i64));
                }
                Opcode::SISEMPTY => {
                    let value = self.pop_string(ip)?;
                    self.stack.push(Value::Boolean(value.is_empty()));
                }
                Opcode::SREGMATCH => {
                    let pattern = self.pop(ip)?;
                    let subject = self.pop_string(ip)?;
                    let matched = match &pattern {
                        Value::RegExp(re) => match re.capture_groups(&subject) {
                            Some(groups) => {
                                self.regexp_groups = groups;
                                true
                            }
                            None => {
                                self.regexp_groups.clear();
                                false
                            }
                        },
                        _ => false,
                    };
                    self.stack.push(Value::Boolean(matched));
                }
                Opcode::SREGGROUP => {
                    let group = self
                        .regexp_groups
                        .get(a as usize)
                        .cloned()
                        .unwrap_or_default();
                    self.stack.push(Value::String(group));
                }

                // ip / cidr
                Opcode::PCMPEQ => {
                    let r = self.pop(ip)?;
                    let l = self.pop(ip)?;
                    self.stack.push(Value::Boolean(l == r));
                }
                Opcode::PCMPNE => {
                    let r = self.pop(ip)?;
                    let l = self.pop(ip)?;
                    self.stack.push(Value::Boolean(l != r));
                }
                Opcode::PINCIDR => {
                    let r = self.pop(ip)?;
                    let l = self.pop(ip)?;
                    let contained = match (&l, &r) {
                        (Value::IPAddress(addr), Value::Cidr(cidr)) => cidr.contains(addr),
                        _ => false,
                    };
                    self.stack.push(Value::Boolean(contained));
                }

                // conversions
                Opcode::N2S => {
                    let value = self.pop(ip)?.as_number();
                    self.stack.push(Value::String(value.to_string()));
                }
                Opcode::S2N => {
                    let value = self.pop_string(ip)?;
                    self.stack
                        .push(Value::Number(value.trim().parse().unwrap_or(0)));
                }
                Opcode::P2S | Opcode::C2S | Opcode::R2S => {
                    let value = self.pop(ip)?;
                    self.stack.push(Value::String(value.to_string()));
                }
                Opcode::B2S => {
                    let value = self.pop(ip)?.truthy();
                    self.stack
                        .push(Value::String(if value { "true" } else { "false" }.to_string()));
                }

                // control
                Opcode::BR => {
                    ip = a as usize;
                }
                Opcode::CONDBR => {
                    let cond = self.pop(ip)?.truthy();
                    ip = if cond { a as usize } else { b as usize };
                }
                Opcode::MATCH => {
                    let subject = self.pop_string(ip)?;
                    let def = pool.match_def(a as usize);
                    let mut target = def.else_pc;
                    for case in &def.cases {
                        let hit = match def.op {
                            MatchClass::Same => pool.string(case.label) == subject,
                            MatchClass::Head => subject.starts_with(pool.string(case.label)),
                            MatchClass::Tail => subject.ends_with(pool.string(case.label)),
                            MatchClass::RegExp => pool.regexp(case.label).is_match(&subject),
                        };
                        if hit {
                            target = case.pc;
                            break;
                        }
                    }
                    ip = target;
                }
                Opcode::RET => {
                    let value = self.pop(ip)?;
                    return Ok(value.truthy());
                }
                Opcode::EXIT => {
                    return Ok(a != 0);
                }

                // calls
                Opcode::CALL => {
                    let index = self.program.native_function_ref(a as usize).ok_or_else(|| {
                        RuntimeError::UnresolvedNative {
                            signature: pool.native_function(a as usize).to_string(),
                        }
                    })?;
                    let returns = c != 0;
                    let mut frame = self.call_frame(ip, b as usize)?;
                    {
                        let mut params =
                            Params::new(&mut frame, self.userdata.as_deref_mut());
                        self.runtime.native(index).invoke(&mut params);
                    }
                    if returns {
                        self.stack.push(frame.swap_remove(0));
                    }
                }
                Opcode::HANDLER => {
                    let index = self.program.native_handler_ref(a as usize).ok_or_else(|| {
                        RuntimeError::UnresolvedNative {
                            signature: pool.native_handler(a as usize).to_string(),
                        }
                    })?;
                    let mut frame = self.call_frame(ip, b as usize)?;
                    {
                        let mut params =
                            Params::new(&mut frame, self.userdata.as_deref_mut());
                        self.runtime.native(index).invoke(&mut params);
                    }
                    // a native handler returning true decides the run
                    if frame[0].truthy() {
                        return Ok(true);
                    }
                }
            }
        }
    }

    /// Pops `argc` arguments and builds the native-call frame with the
    /// reserved result slot at index 0.
    fn call_frame(&mut self, ip: usize, argc: usize) -> RuntimeResult<Vec<Value>> {
        if self.stack.len() < argc {
            return Err(RuntimeError::StackUnderflow { ip });
        }
        let args = self.stack.split_off(self.stack.len() - argc);
        let mut frame = Vec::with_capacity(argc + 1);
        frame.push(Value::Void);
        frame.extend(args);
        Ok(frame)
    }

    fn pop(&mut self, ip: usize) -> RuntimeResult<Value> {
        self.stack.pop().ok_or(RuntimeError::StackUnderflow { ip })
    }

    fn pop_string(&mut self, ip: usize) -> RuntimeResult<String> {
        let value = self.pop(ip)?;
        Ok(match value {
            Value::String(s) => s,
            other => other.to_string(),
        })
    }

    fn pop_numbers(&mut self, ip: usize) -> RuntimeResult<(i64, i64)> {
        let r = self.pop(ip)?.as_number();
        let l = self.pop(ip)?.as_number();
        Ok((l, r))
    }

    fn pop_strings(&mut self, ip: usize) -> RuntimeResult<(String, String)> {
        let r = self.pop_string(ip)?;
        let l = self.pop_string(ip)?;
        Ok((l, r))
    }

    fn numeric_binop(&mut self, ip: usize, f: impl Fn(i64, i64) -> i64) -> RuntimeResult<()> {
        let (l, r) = self.pop_numbers(ip)?;
        self.stack.push(Value::Number(f(l, r)));
        Ok(())
    }

    fn numeric_compare(&mut self, ip: usize, f: impl Fn(i64, i64) -> bool) -> RuntimeResult<()> {
        let (l, r) = self.pop_numbers(ip)?;
        self.stack.push(Value::Boolean(f(l, r)));
        Ok(())
    }

    fn string_compare(&mut self, ip: usize, f: impl Fn(&str, &str) -> bool) -> RuntimeResult<()> {
        let (l, r) = self.pop_strings(ip)?;
        self.stack.push(Value::Boolean(f(&l, &r)));
        Ok(())
    }

    fn boolean_binop(&mut self, ip: usize, f: impl Fn(bool, bool) -> bool) -> RuntimeResult<()> {
        let r = self.pop(ip)?.truthy();
        let l = self.pop(ip)?.truthy();
        self.stack.push(Value::Boolean(f(l, r)));
        Ok(())
    }
}

fn pow(base: i64, exponent: i64) -> i64 {
    if exponent < 0 {
        return 0;
    }
    base.wrapping_pow(exponent.min(u32::MAX as i64) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pow_handles_negative_exponents() {
        assert_eq!(pow(2, 10), 1024);
        assert_eq!(pow(2, -1), 0);
        assert_eq!(pow(7, 0), 1);
    }
}
