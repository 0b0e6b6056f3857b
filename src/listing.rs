use std::io::{self, Write};

use crate::lexeme::Lexeme;
use crate::program::{Constant, Program};
use crate::span::Spanned;

/// 1-based line/column of a byte offset.
fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let upto = &source.as_bytes()[..offset.min(source.len())];
    let line = upto.iter().filter(|b| **b == b'\n').count() + 1;
    let col = upto.iter().rev().take_while(|b| **b != b'\n').count() + 1;
    (line, col)
}

/// `-t`: one token per line, `<line>:<col>\t<kind>\t<text>`.
pub fn write_tokens(
    source: &str,
    tokens: &[Spanned<Lexeme>],
    out: &mut impl Write,
) -> io::Result<()> {
    for token in tokens {
        if token.node == Lexeme::Eof {
            break;
        }
        let (line, col) = line_col(source, token.span.start as usize);
        let text = &source[token.span.start as usize..token.span.end as usize];
        writeln!(out, "{}:{}\t{}\t{}", line, col, token.node.kind_name(), text)?;
    }
    Ok(())
}

/// `-s`: the assembly-style listing with `.constants:`, `.start:`,
/// `.functions:` and per-function `.F<idx>:` sections.
pub fn write_program(program: &Program, out: &mut impl Write) -> io::Result<()> {
    writeln!(out, ".constants:")?;
    for (index, constant) in program.constants.iter().enumerate() {
        match constant {
            Constant::S(s) => writeln!(out, "{} S {:?}", index, s)?,
            Constant::I(v) => writeln!(out, "{} I {}", index, v)?,
            Constant::D(v) => writeln!(out, "{} D {:?}", index, v)?,
        }
    }

    writeln!(out, ".start:")?;
    for (index, ins) in program.start.iter().enumerate() {
        writeln!(out, "{}\t{}", index, ins)?;
    }

    writeln!(out, ".functions:")?;
    for func in &program.functions {
        writeln!(
            out,
            "{} {} {} {}",
            func.index, func.name_const, func.param_slots, func.level
        )?;
    }

    for func in &program.functions {
        writeln!(out, ".F{}:", func.index)?;
        for (index, ins) in func.ins.iter().enumerate() {
            writeln!(out, "{}\t{}", index, ins)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyser::analyse;
    use crate::lexer::Lexer;

    fn compile(source: &str) -> Program {
        analyse(Lexer::new(source).tokenize().unwrap()).unwrap()
    }

    #[test]
    fn test_line_col() {
        let src = "int a;\nint b;";
        assert_eq!(line_col(src, 0), (1, 1));
        assert_eq!(line_col(src, 4), (1, 5));
        assert_eq!(line_col(src, 7), (2, 1));
        assert_eq!(line_col(src, 11), (2, 5));
    }

    #[test]
    fn test_token_listing() {
        let src = "int main() {\n  return 0;\n}";
        let tokens = Lexer::new(src).tokenize().unwrap();
        let mut out = Vec::new();
        write_tokens(src, &tokens, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        insta::assert_snapshot!(text, @r"
1:1	Keyword	int
1:5	Identifier	main
1:9	Punctuator	(
1:10	Punctuator	)
1:12	Punctuator	{
2:3	Keyword	return
2:10	Integer	0
2:11	Punctuator	;
3:1	Punctuator	}
");
    }

    #[test]
    fn test_program_listing_sections() {
        let program = compile("double g = 0.5; int main() { print(g); return 0; }");
        let mut out = Vec::new();
        write_program(&program, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        insta::assert_snapshot!(text, @r#"
.constants:
0 D 0.5
1 S "main"
.start:
0	loadc 0
.functions:
0 1 0 1
.F0:
0	loada 1, 0
1	dload
2	dprint
3	printl
4	ipush 0
5	iret
6	ret
"#);
    }

    #[test]
    fn test_listing_is_deterministic() {
        let src = "int main() { print(1, 2.5, 'x'); return 0; }";
        let mut first = Vec::new();
        let mut second = Vec::new();
        write_program(&compile(src), &mut first).unwrap();
        write_program(&compile(src), &mut second).unwrap();
        assert_eq!(first, second);
    }
}
