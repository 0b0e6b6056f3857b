use cc0::diagnostic::ErrorCode;
use cc0::{binary, compile_source, vm};

/// Full pipeline: compile, encode, park the binary on disk, read it back,
/// decode, interpret.
fn run_program(source: &str, stdin: &str) -> Result<String, vm::VmFault> {
    let program = compile_source(source).expect("program should compile");
    let bytes = binary::encode(&program);

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("out");
    std::fs::write(&path, &bytes).expect("write binary");
    let read_back = std::fs::read(&path).expect("read binary");
    let decoded = binary::decode(&read_back).expect("decode binary");

    let mut out = Vec::new();
    vm::execute(&decoded, stdin.as_bytes(), &mut out)?;
    Ok(String::from_utf8(out).expect("utf-8 output"))
}

fn compile_error(source: &str) -> ErrorCode {
    compile_source(source).err().expect("expected compile error").code
}

#[test]
fn scenario_constant_arithmetic() {
    let out = run_program("int main(){ print(1+2*3); return 0; }", "").unwrap();
    assert_eq!(out, "7\n");
}

#[test]
fn scenario_scan_square() {
    let out = run_program("int main(){ int a; scan(a); print(a*a); return 0; }", "6").unwrap();
    assert_eq!(out, "36\n");
}

#[test]
fn scenario_while_sum() {
    let src = "int main(){ int i=0; int s=0; while(i<=10){ s=s+i; i=i+1; } print(s); return 0; }";
    assert_eq!(run_program(src, "").unwrap(), "55\n");
}

#[test]
fn scenario_double_halving() {
    let src = "double f(double x){ return x*0.5; } int main(){ print(f(3)); return 0; }";
    assert_eq!(run_program(src, "").unwrap(), "1.500000\n");
}

#[test]
fn scenario_assign_to_constant_rejected() {
    let code = compile_error("int main(){ const int a=2; a=3; return 0; }");
    assert_eq!(code, ErrorCode::AssignToConstant);
}

#[test]
fn scenario_uninitialised_use_rejected() {
    let code = compile_error("int main(){ int x; print(x); return 0; }");
    assert_eq!(code, ErrorCode::NotInitialized);
}

#[test]
fn binary_round_trip_is_byte_identical() {
    let src = "double g = 2.5; char sep = ':';\n\
               int gcd(int a, int b) { while (b != 0) { int t = b; b = a - a / b * b; a = t; } return a; }\n\
               int main() { print(gcd(12, 18), g); print(\"end\"); return 0; }";
    let program = compile_source(src).unwrap();
    let bytes = binary::encode(&program);
    let decoded = binary::decode(&bytes).unwrap();
    assert_eq!(binary::encode(&decoded), bytes);
}

#[test]
fn compilation_is_deterministic() {
    let src = "double half(double x) { return x * 0.5; }\n\
               int main() { double d; scan(d); print(half(d), \"ok\"); return 0; }";
    let first = binary::encode(&compile_source(src).unwrap());
    let second = binary::encode(&compile_source(src).unwrap());
    assert_eq!(first, second);
}

#[test]
fn globals_run_once_before_main() {
    let src = "int a = 2; int b = a * 21; int main(){ print(b); return 0; }";
    assert_eq!(run_program(src, "").unwrap(), "42\n");
}

#[test]
fn nested_scopes_and_shadowing() {
    let src = "int x = 1;\n\
               int main() {\n\
                   int x = 2;\n\
                   { int x = 3; print(x); }\n\
                   print(x);\n\
                   return 0;\n\
               }";
    assert_eq!(run_program(src, "").unwrap(), "3\n2\n");
}

#[test]
fn mixed_print_items() {
    let src = "int main(){ char c = 'z'; print(1, 2.5, c, \"s\"); return 0; }";
    assert_eq!(run_program(src, "").unwrap(), "1 2.500000 z s\n");
}

#[test]
fn comparisons_drive_both_branch_senses() {
    let src = "int main(){ int a; scan(a);\n\
                   if (a == 7) print(\"eq\"); else print(\"ne\");\n\
                   if (a >= 5) print(\"ge\");\n\
                   if (a < 5) print(\"lt\");\n\
                   return 0; }";
    assert_eq!(run_program(src, "7").unwrap(), "eq\nge\n");
    assert_eq!(run_program(src, "3").unwrap(), "ne\nlt\n");
}

#[test]
fn integer_division_truncates_and_faults_on_zero() {
    assert_eq!(
        run_program("int main(){ print(7 / 2); return 0; }", "").unwrap(),
        "3\n"
    );
    let fault = run_program("int main(){ int z; scan(z); print(1 / z); return 0; }", "0")
        .expect_err("dividing by zero is fatal");
    assert_eq!(fault, vm::VmFault::DivisionByZero);
}

#[test]
fn recursion_through_the_wire_format() {
    let src = "int fib(int n) { if (n < 2) return n; return fib(n-1) + fib(n-2); }\n\
               int main() { print(fib(10)); return 0; }";
    assert_eq!(run_program(src, "").unwrap(), "55\n");
}

#[test]
fn casts_and_promotion() {
    let src = "int main() {\n\
                   double d = 1;\n\
                   int i = 2.75;\n\
                   print(d, i, (char)(64 + 1), (int)(2.5 * 2));\n\
                   return 0;\n\
               }";
    assert_eq!(run_program(src, "").unwrap(), "1.000000 2 A 5\n");
}

#[test]
fn scan_char_reads_one_byte() {
    let src = "int main(){ char a; char b; scan(a); scan(b); print(a, b); return 0; }";
    assert_eq!(run_program(src, " xy").unwrap(), "x y\n");
}

#[test]
fn lexical_errors_surface_with_codes() {
    assert_eq!(compile_error("int main() { int a = 3 @ 4; return 0; }"), ErrorCode::InvalidCharacter);
    assert_eq!(compile_error("/* int main() { }"), ErrorCode::UnterminatedComment);
}

#[test]
fn reserved_words_are_hard_errors() {
    assert_eq!(
        compile_error("int main() { for (;;) {} return 0; }"),
        ErrorCode::UnsupportedStatement
    );
    assert_eq!(
        compile_error("int main() { break; return 0; }"),
        ErrorCode::UnsupportedStatement
    );
}

#[test]
fn missing_main_is_rejected() {
    assert_eq!(compile_error("int helper() { return 1; }"), ErrorCode::NeedMain);
}
