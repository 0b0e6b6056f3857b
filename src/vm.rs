use std::io::{BufRead, Write};

use crate::instruction::{Instruction, Opcode};
use crate::program::{Constant, Program};

/// Value-stack slots (32-bit each); a double occupies two.
const STACK_LIMIT: usize = 1 << 20;
const FRAME_LIMIT: usize = 1 << 14;

/// Sentinel function index of the synthetic `.start` frame.
const START_FRAME: usize = usize::MAX;

/// Fatal run-time failures. Each terminates the machine with a diagnostic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VmFault {
    DivisionByZero,
    StackUnderflow,
    StackExhausted,
    BadAddress(i32),
    BadBranch(i32),
    BadFunction(i32),
    BadConstant(i32),
    NoMain,
    MissingReturn,
    InputExhausted,
    BadInput(String),
    Io(String),
}

impl std::fmt::Display for VmFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmFault::DivisionByZero => write!(f, "integer division by zero"),
            VmFault::StackUnderflow => write!(f, "value stack underflow"),
            VmFault::StackExhausted => write!(f, "stack exhausted"),
            VmFault::BadAddress(a) => write!(f, "address {} is out of range", a),
            VmFault::BadBranch(t) => write!(f, "branch target {} is out of range", t),
            VmFault::BadFunction(k) => write!(f, "call of nonexistent function {}", k),
            VmFault::BadConstant(k) => write!(f, "constant {} is missing or has the wrong kind", k),
            VmFault::NoMain => write!(f, "program has no 'main' function"),
            VmFault::MissingReturn => write!(f, "execution ran past the end of a function"),
            VmFault::InputExhausted => write!(f, "scan hit end of input"),
            VmFault::BadInput(tok) => write!(f, "cannot parse input token '{}'", tok),
            VmFault::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for VmFault {}

struct Frame {
    func: usize,
    pc: usize,
    base: usize,
}

/// Stack-based interpreter. The `.start` sequence runs first with base 0;
/// the slots it leaves behind are the global slot array and stay at the
/// bottom of the value stack for the whole run. Addresses are absolute slot
/// indices: `loada 1, idx` yields `idx`, `loada 0, idx` yields `base + idx`.
pub struct Vm<'p, R, W> {
    program: &'p Program,
    stack: Vec<i32>,
    frames: Vec<Frame>,
    input: R,
    output: W,
}

impl<'p, R: BufRead, W: Write> Vm<'p, R, W> {
    pub fn new(program: &'p Program, input: R, output: W) -> Self {
        Self {
            program,
            stack: Vec::new(),
            frames: Vec::new(),
            input,
            output,
        }
    }

    /// Run `.start`, then `main`, until the frame stack is empty.
    pub fn run(mut self) -> Result<(), VmFault> {
        self.frames.push(Frame {
            func: START_FRAME,
            pc: 0,
            base: 0,
        });
        while let Some(frame) = self.frames.last() {
            let code = self.code_of(frame.func);
            if frame.pc >= code.len() {
                if frame.func == START_FRAME {
                    self.frames.pop();
                    self.enter_main()?;
                    continue;
                }
                return Err(VmFault::MissingReturn);
            }
            let ins = code[frame.pc];
            self.frames.last_mut().unwrap().pc += 1;
            self.step(ins)?;
        }
        self.output.flush().map_err(io_fault)?;
        Ok(())
    }

    fn code_of(&self, func: usize) -> &'p [Instruction] {
        if func == START_FRAME {
            &self.program.start
        } else {
            &self.program.functions[func].ins
        }
    }

    fn enter_main(&mut self) -> Result<(), VmFault> {
        let main = self
            .program
            .functions
            .iter()
            .find(|f| f.name == "main")
            .ok_or(VmFault::NoMain)?;
        self.frames.push(Frame {
            func: main.index as usize,
            pc: 0,
            base: self.stack.len(),
        });
        Ok(())
    }

    fn step(&mut self, ins: Instruction) -> Result<(), VmFault> {
        match ins.op {
            Opcode::Nop => {}
            Opcode::Bipush | Opcode::Ipush => self.push(ins.x)?,
            Opcode::Pop => {
                self.pop()?;
            }
            Opcode::Pop2 => {
                self.pop()?;
                self.pop()?;
            }
            Opcode::Loadc => self.load_constant(ins.x)?,
            Opcode::Loada => {
                let frame = self.frames.last().unwrap();
                let addr = match ins.x {
                    1 => ins.y,
                    0 => frame.base as i32 + ins.y,
                    _ => return Err(VmFault::BadAddress(ins.y)),
                };
                self.push(addr)?;
            }
            Opcode::Iload => {
                let addr = self.pop()?;
                let value = *self.slot(addr)?;
                self.push(value)?;
            }
            Opcode::Dload => {
                let addr = self.pop()?;
                let lo = *self.slot(addr)?;
                let hi = *self.slot(addr + 1)?;
                self.push(lo)?;
                self.push(hi)?;
            }
            Opcode::Istore => {
                let value = self.pop()?;
                let addr = self.pop()?;
                *self.slot(addr)? = value;
            }
            Opcode::Cstore => {
                let value = self.pop()? & 0xff;
                let addr = self.pop()?;
                *self.slot(addr)? = value;
            }
            Opcode::Dstore => {
                let hi = self.pop()?;
                let lo = self.pop()?;
                let addr = self.pop()?;
                *self.slot(addr)? = lo;
                *self.slot(addr + 1)? = hi;
            }
            Opcode::Iadd => self.int_binop(|a, b| Ok(a.wrapping_add(b)))?,
            Opcode::Isub => self.int_binop(|a, b| Ok(a.wrapping_sub(b)))?,
            Opcode::Imul => self.int_binop(|a, b| Ok(a.wrapping_mul(b)))?,
            Opcode::Idiv => self.int_binop(|a, b| {
                if b == 0 {
                    Err(VmFault::DivisionByZero)
                } else {
                    Ok(a.wrapping_div(b))
                }
            })?,
            Opcode::Ineg => {
                let v = self.pop()?;
                self.push(v.wrapping_neg())?;
            }
            Opcode::Icmp => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(ordering_value(a.cmp(&b)))?;
            }
            Opcode::Dadd => self.double_binop(|a, b| a + b)?,
            Opcode::Dsub => self.double_binop(|a, b| a - b)?,
            Opcode::Dmul => self.double_binop(|a, b| a * b)?,
            Opcode::Ddiv => self.double_binop(|a, b| a / b)?,
            Opcode::Dneg => {
                let v = self.pop_double()?;
                self.push_double(-v)?;
            }
            Opcode::Dcmp => {
                let b = self.pop_double()?;
                let a = self.pop_double()?;
                let value = match a.partial_cmp(&b) {
                    Some(ord) => ordering_value(ord),
                    None => 0,
                };
                self.push(value)?;
            }
            Opcode::I2d => {
                let v = self.pop()?;
                self.push_double(v as f64)?;
            }
            Opcode::D2i => {
                let v = self.pop_double()?;
                self.push(v as i32)?;
            }
            Opcode::I2c => {
                let v = self.pop()?;
                self.push(v & 0xff)?;
            }
            Opcode::Jmp => self.branch(ins.x)?,
            Opcode::Je => self.branch_if(ins.x, |v| v == 0)?,
            Opcode::Jne => self.branch_if(ins.x, |v| v != 0)?,
            Opcode::Jl => self.branch_if(ins.x, |v| v < 0)?,
            Opcode::Jle => self.branch_if(ins.x, |v| v <= 0)?,
            Opcode::Jg => self.branch_if(ins.x, |v| v > 0)?,
            Opcode::Jge => self.branch_if(ins.x, |v| v >= 0)?,
            Opcode::Call => self.call(ins.x)?,
            Opcode::Ret => {
                let frame = self.frames.pop().unwrap();
                self.stack.truncate(frame.base);
            }
            Opcode::Iret => {
                let value = self.pop()?;
                let frame = self.frames.pop().unwrap();
                self.stack.truncate(frame.base);
                self.push(value)?;
            }
            Opcode::Dret => {
                let value = self.pop_double()?;
                let frame = self.frames.pop().unwrap();
                self.stack.truncate(frame.base);
                self.push_double(value)?;
            }
            Opcode::Iprint => {
                let v = self.pop()?;
                write!(self.output, "{}", v).map_err(io_fault)?;
            }
            Opcode::Dprint => {
                let v = self.pop_double()?;
                write!(self.output, "{:.6}", v).map_err(io_fault)?;
            }
            Opcode::Cprint => {
                let v = self.pop()?;
                write!(self.output, "{}", (v & 0xff) as u8 as char).map_err(io_fault)?;
            }
            Opcode::Sprint => {
                let k = self.pop()?;
                let constant = match usize::try_from(k) {
                    Ok(i) if i < self.program.constants.len() => &self.program.constants[i],
                    _ => return Err(VmFault::BadConstant(k)),
                };
                match constant {
                    Constant::S(s) => write!(self.output, "{}", s).map_err(io_fault)?,
                    _ => return Err(VmFault::BadConstant(k)),
                }
            }
            Opcode::Printl => writeln!(self.output).map_err(io_fault)?,
            Opcode::Iscan => {
                let token = self.read_token()?;
                let value: i32 = token
                    .parse()
                    .map_err(|_| VmFault::BadInput(token.clone()))?;
                self.push(value)?;
            }
            Opcode::Dscan => {
                let token = self.read_token()?;
                let value: f64 = token
                    .parse()
                    .map_err(|_| VmFault::BadInput(token.clone()))?;
                self.push_double(value)?;
            }
            Opcode::Cscan => {
                self.skip_whitespace()?;
                let byte = self.read_byte()?.ok_or(VmFault::InputExhausted)?;
                self.push(byte as i32)?;
            }
        }
        Ok(())
    }

    // --- Stack primitives ---

    fn push(&mut self, value: i32) -> Result<(), VmFault> {
        if self.stack.len() >= STACK_LIMIT {
            return Err(VmFault::StackExhausted);
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<i32, VmFault> {
        self.stack.pop().ok_or(VmFault::StackUnderflow)
    }

    fn slot(&mut self, addr: i32) -> Result<&mut i32, VmFault> {
        usize::try_from(addr)
            .ok()
            .and_then(|a| self.stack.get_mut(a))
            .ok_or(VmFault::BadAddress(addr))
    }

    /// Doubles live as two host-order halves; the address points at the low
    /// half, the high half sits above it.
    fn push_double(&mut self, value: f64) -> Result<(), VmFault> {
        let bits = value.to_bits();
        self.push(bits as u32 as i32)?;
        self.push((bits >> 32) as u32 as i32)
    }

    fn pop_double(&mut self) -> Result<f64, VmFault> {
        let hi = self.pop()?;
        let lo = self.pop()?;
        let bits = ((hi as u32 as u64) << 32) | (lo as u32 as u64);
        Ok(f64::from_bits(bits))
    }

    fn int_binop(
        &mut self,
        apply: impl FnOnce(i32, i32) -> Result<i32, VmFault>,
    ) -> Result<(), VmFault> {
        let b = self.pop()?;
        let a = self.pop()?;
        let value = apply(a, b)?;
        self.push(value)
    }

    fn double_binop(&mut self, apply: impl FnOnce(f64, f64) -> f64) -> Result<(), VmFault> {
        let b = self.pop_double()?;
        let a = self.pop_double()?;
        self.push_double(apply(a, b))
    }

    fn load_constant(&mut self, index: i32) -> Result<(), VmFault> {
        let constant = match usize::try_from(index) {
            Ok(k) if k < self.program.constants.len() => &self.program.constants[k],
            _ => return Err(VmFault::BadConstant(index)),
        };
        match constant {
            Constant::I(v) => self.push(*v),
            Constant::D(v) => self.push_double(*v),
            // A string constant loads as its own pool index, consumed by
            // sprint.
            Constant::S(_) => self.push(index),
        }
    }

    // --- Control transfer ---

    fn branch(&mut self, target: i32) -> Result<(), VmFault> {
        let func = self.frames.last().unwrap().func;
        let len = self.code_of(func).len();
        match usize::try_from(target) {
            Ok(t) if t <= len => {
                self.frames.last_mut().unwrap().pc = t;
                Ok(())
            }
            _ => Err(VmFault::BadBranch(target)),
        }
    }

    fn branch_if(&mut self, target: i32, taken: impl FnOnce(i32) -> bool) -> Result<(), VmFault> {
        let v = self.pop()?;
        if taken(v) {
            self.branch(target)?;
        }
        Ok(())
    }

    fn call(&mut self, index: i32) -> Result<(), VmFault> {
        let param_slots = match usize::try_from(index) {
            Ok(k) if k < self.program.functions.len() => {
                self.program.functions[k].param_slots as usize
            }
            _ => return Err(VmFault::BadFunction(index)),
        };
        if self.frames.len() >= FRAME_LIMIT {
            return Err(VmFault::StackExhausted);
        }
        if self.stack.len() < param_slots {
            return Err(VmFault::StackUnderflow);
        }
        self.frames.push(Frame {
            func: index as usize,
            pc: 0,
            base: self.stack.len() - param_slots,
        });
        Ok(())
    }

    // --- Input ---

    fn read_byte(&mut self) -> Result<Option<u8>, VmFault> {
        let buf = self.input.fill_buf().map_err(io_fault)?;
        if buf.is_empty() {
            return Ok(None);
        }
        let byte = buf[0];
        self.input.consume(1);
        Ok(Some(byte))
    }

    fn peek_byte(&mut self) -> Result<Option<u8>, VmFault> {
        let buf = self.input.fill_buf().map_err(io_fault)?;
        Ok(buf.first().copied())
    }

    fn skip_whitespace(&mut self) -> Result<(), VmFault> {
        while matches!(self.peek_byte()?, Some(b) if b.is_ascii_whitespace()) {
            self.read_byte()?;
        }
        Ok(())
    }

    /// One whitespace-delimited token from stdin.
    fn read_token(&mut self) -> Result<String, VmFault> {
        self.skip_whitespace()?;
        let mut token = String::new();
        while let Some(byte) = self.peek_byte()? {
            if byte.is_ascii_whitespace() {
                break;
            }
            token.push(byte as char);
            self.read_byte()?;
        }
        if token.is_empty() {
            return Err(VmFault::InputExhausted);
        }
        Ok(token)
    }
}

fn ordering_value(ord: std::cmp::Ordering) -> i32 {
    match ord {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

fn io_fault(e: std::io::Error) -> VmFault {
    VmFault::Io(e.to_string())
}

/// Interpret a program against the given streams.
pub fn execute<R: BufRead, W: Write>(
    program: &Program,
    input: R,
    output: W,
) -> Result<(), VmFault> {
    Vm::new(program, input, output).run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyser::analyse;
    use crate::lexer::Lexer;

    fn run(source: &str, stdin: &str) -> Result<String, VmFault> {
        let program = analyse(Lexer::new(source).tokenize().unwrap()).unwrap();
        let mut out = Vec::new();
        execute(&program, stdin.as_bytes(), &mut out)?;
        Ok(String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(run("int main() { print(1+2*3); return 0; }", "").unwrap(), "7\n");
        assert_eq!(run("int main() { print(7/2); return 0; }", "").unwrap(), "3\n");
        assert_eq!(run("int main() { print(-5+2); return 0; }", "").unwrap(), "-3\n");
    }

    #[test]
    fn test_scan_and_square() {
        let out = run("int main() { int a; scan(a); print(a*a); return 0; }", "6").unwrap();
        assert_eq!(out, "36\n");
    }

    #[test]
    fn test_while_sum() {
        let src = "int main() { int i=0; int s=0; while (i<=10) { s=s+i; i=i+1; } print(s); return 0; }";
        assert_eq!(run(src, "").unwrap(), "55\n");
    }

    #[test]
    fn test_double_call() {
        let src = "double f(double x) { return x*0.5; } int main() { print(f(3)); return 0; }";
        assert_eq!(run(src, "").unwrap(), "1.500000\n");
    }

    #[test]
    fn test_globals_initialise_before_main() {
        let src = "int g = 40; int h; int main() { h = g + 2; print(h); return 0; }";
        assert_eq!(run(src, "").unwrap(), "42\n");
    }

    #[test]
    fn test_global_double_and_char() {
        let src = "double d = 1.25; char c = 'A'; int main() { print(d, c); return 0; }";
        assert_eq!(run(src, "").unwrap(), "1.250000 A\n");
    }

    #[test]
    fn test_if_else_branches() {
        let src = "int main() { int a; scan(a); if (a < 0) print(\"neg\"); else print(\"pos\"); return 0; }";
        assert_eq!(run(src, "-3").unwrap(), "neg\n");
        assert_eq!(run(src, "3").unwrap(), "pos\n");
    }

    #[test]
    fn test_recursive_factorial() {
        let src = "int fact(int n) { if (n <= 1) return 1; return n * fact(n - 1); } \
                   int main() { print(fact(6)); return 0; }";
        assert_eq!(run(src, "").unwrap(), "720\n");
    }

    #[test]
    fn test_char_round_trip() {
        let src = "int main() { char c; scan(c); print(c); return 0; }";
        assert_eq!(run(src, "  Q").unwrap(), "Q\n");
    }

    #[test]
    fn test_double_scan() {
        let src = "int main() { double d; scan(d); print(d * 2); return 0; }";
        assert_eq!(run(src, "1.25").unwrap(), "2.500000\n");
    }

    #[test]
    fn test_cast_truncates() {
        let src = "int main() { print((int)2.75); return 0; }";
        assert_eq!(run(src, "").unwrap(), "2\n");
    }

    #[test]
    fn test_plain_condition_branches_on_zero() {
        let src = "int main() { int n = 3; while (n) { print(n); n = n - 1; } return 0; }";
        assert_eq!(run(src, "").unwrap(), "3\n2\n1\n");
    }

    #[test]
    fn test_shadowed_slots() {
        let src = "int main() { int a = 1; { int a = 2; print(a); } print(a); return 0; }";
        assert_eq!(run(src, "").unwrap(), "2\n1\n");
    }

    #[test]
    fn test_statement_call_keeps_stack_balanced() {
        let src = "int bump(int x) { return x + 1; } \
                   int main() { int n = 0; bump(7); n = bump(n); print(n); return 0; }";
        assert_eq!(run(src, "").unwrap(), "1\n");
    }

    // --- Faults ---

    #[test]
    fn test_fault_division_by_zero() {
        let src = "int main() { int z = 0; print(1 / z); return 0; }";
        assert_eq!(run(src, ""), Err(VmFault::DivisionByZero));
    }

    #[test]
    fn test_double_division_by_zero_is_ieee() {
        let src = "int main() { double z = 0.0; print(1.0 / z); return 0; }";
        assert_eq!(run(src, "").unwrap(), "inf\n");
    }

    #[test]
    fn test_fault_input_exhausted() {
        let src = "int main() { int a; scan(a); return 0; }";
        assert_eq!(run(src, "   "), Err(VmFault::InputExhausted));
    }

    #[test]
    fn test_fault_bad_input() {
        let src = "int main() { int a; scan(a); return 0; }";
        assert_eq!(run(src, "abc"), Err(VmFault::BadInput("abc".into())));
    }

    #[test]
    fn test_fault_runaway_recursion() {
        let src = "int f(int n) { return f(n); } int main() { return f(1); }";
        assert_eq!(run(src, ""), Err(VmFault::StackExhausted));
    }

    #[test]
    fn test_fault_bad_function_index() {
        let mut program =
            analyse(Lexer::new("int main() { return 0; }").tokenize().unwrap()).unwrap();
        program.functions[0].ins[0] = Instruction::with_x(Opcode::Call, 7);
        let mut out = Vec::new();
        assert_eq!(
            execute(&program, &b""[..], &mut out),
            Err(VmFault::BadFunction(7))
        );
    }

    #[test]
    fn test_fault_bad_branch_target() {
        let mut program =
            analyse(Lexer::new("int main() { return 0; }").tokenize().unwrap()).unwrap();
        program.functions[0].ins[0] = Instruction::with_x(Opcode::Jmp, 99);
        let mut out = Vec::new();
        assert_eq!(
            execute(&program, &b""[..], &mut out),
            Err(VmFault::BadBranch(99))
        );
    }

    #[test]
    fn test_fault_underflow_on_corrupt_code() {
        let mut program =
            analyse(Lexer::new("int main() { return 0; }").tokenize().unwrap()).unwrap();
        program.functions[0].ins.insert(0, Instruction::new(Opcode::Iadd));
        let mut out = Vec::new();
        assert_eq!(
            execute(&program, &b""[..], &mut out),
            Err(VmFault::StackUnderflow)
        );
    }

    #[test]
    fn test_fault_missing_main_in_table() {
        let mut program =
            analyse(Lexer::new("int main() { return 0; }").tokenize().unwrap()).unwrap();
        program.functions[0].name = "other".to_string();
        let mut out = Vec::new();
        assert_eq!(execute(&program, &b""[..], &mut out), Err(VmFault::NoMain));
    }
}
