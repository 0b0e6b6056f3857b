use crate::diagnostic::{Diagnostic, ErrorCode};
use crate::instruction::{Instruction, Opcode};
use crate::lexeme::Lexeme;
use crate::program::{Constant, Function, Program};
use crate::span::{Span, Spanned};
use crate::symtab::{Var, VarsTable};
use crate::types::Ty;

/// Recursive-descent analyser and code generator. Parsing, symbol
/// resolution, type coercion and emission happen in one walk over the token
/// stream; the first error aborts the pass.
///
/// Until the first function definition, code is emitted into the `.start`
/// sequence and names are bound in the global table. Inside a function, code
/// goes to that function's instruction list and names to its scoped locals.
pub struct Analyser {
    tokens: Vec<Spanned<Lexeme>>,
    pos: usize,
    program: Program,
    globals: VarsTable,
    global_next_slot: i32,
    current: Option<FnCtx>,
}

/// Per-function analysis state. The parameter frame is the outermost level
/// of `locals`.
struct FnCtx {
    index: usize,
    locals: VarsTable,
    next_slot: i32,
}

/// Scope operand of `loada`: 0 = current frame, 1 = global slot array.
const SCOPE_LOCAL: i32 = 0;
const SCOPE_GLOBAL: i32 = 1;

pub fn analyse(tokens: Vec<Spanned<Lexeme>>) -> Result<Program, Diagnostic> {
    let mut analyser = Analyser {
        tokens,
        pos: 0,
        program: Program::default(),
        globals: VarsTable::new(),
        global_next_slot: 0,
        current: None,
    };
    analyser.parse_program()?;
    Ok(analyser.program)
}

impl Analyser {
    // --- Program structure ---

    fn parse_program(&mut self) -> Result<(), Diagnostic> {
        self.parse_global_declarations()?;
        while !self.at(&Lexeme::Eof) {
            self.parse_function()?;
        }
        if self.program.function_index("main").is_none() {
            return Err(Diagnostic::error(
                ErrorCode::NeedMain,
                "program has no 'main' function",
                self.current_span(),
            )
            .with_help("execution starts at `int main()`"));
        }
        Ok(())
    }

    /// Top-level `{ var-decl }` run. A type specifier followed by
    /// `ident '('` is the first function definition and ends the run.
    fn parse_global_declarations(&mut self) -> Result<(), Diagnostic> {
        loop {
            let is_const = self.at(&Lexeme::Const);
            let type_at = usize::from(is_const);
            if !self.peek_at(type_at).is_type_specifier() {
                if is_const {
                    return Err(Diagnostic::error(
                        ErrorCode::NeedVarType,
                        "'const' must be followed by a type specifier",
                        self.current_span(),
                    ));
                }
                return Ok(());
            }
            if !is_const
                && matches!(self.peek_at(1), Lexeme::Ident(_))
                && *self.peek_at(2) == Lexeme::LParen
            {
                return Ok(());
            }
            self.parse_var_decl()?;
        }
    }

    fn parse_function(&mut self) -> Result<(), Diagnostic> {
        let return_ty = self.parse_type_specifier().ok_or_else(|| {
            Diagnostic::error(
                ErrorCode::InvalidDeclaration,
                format!(
                    "expected a function definition, found {}",
                    self.peek().description()
                ),
                self.current_span(),
            )
        })?;
        let (name, name_span) = self.expect_ident()?;
        if self.program.function_index(&name).is_some() {
            return Err(Diagnostic::error(
                ErrorCode::DuplicateDeclaration,
                format!("function '{}' is already defined", name),
                name_span,
            ));
        }

        let name_const = self.program.add_constant(Constant::S(name.clone()));
        let index = self.program.functions.len() as u16;
        self.program.functions.push(Function {
            name_const,
            name,
            index,
            return_ty,
            params: Vec::new(),
            param_slots: 0,
            level: 1,
            ins: Vec::new(),
        });
        self.current = Some(FnCtx {
            index: index as usize,
            locals: VarsTable::new(),
            next_slot: 0,
        });

        self.parse_parameter_clause()?;
        self.parse_compound_statement(false)?;

        // Falling off the end of any body is well-defined.
        self.emit(Instruction::new(Opcode::Ret));
        self.current = None;
        Ok(())
    }

    fn parse_parameter_clause(&mut self) -> Result<(), Diagnostic> {
        self.expect(
            &Lexeme::LParen,
            ErrorCode::InvalidDeclaration,
            "expected '(' after function name",
        )?;
        if self.eat(&Lexeme::RParen) {
            return Ok(());
        }
        loop {
            let is_const = self.eat(&Lexeme::Const);
            let ty = self.parse_type_specifier().ok_or_else(|| {
                Diagnostic::error(
                    ErrorCode::NeedVarType,
                    "parameter needs a type specifier",
                    self.current_span(),
                )
            })?;
            if ty == Ty::Void {
                return Err(Diagnostic::error(
                    ErrorCode::Void,
                    "a parameter cannot have type void",
                    self.prev_span(),
                ));
            }
            let (name, name_span) = self.expect_ident()?;
            let ctx = self.current.as_mut().unwrap();
            if !ctx.locals.can_redefine(&name) {
                return Err(Diagnostic::error(
                    ErrorCode::DuplicateDeclaration,
                    format!("parameter '{}' is already declared", name),
                    name_span,
                ));
            }
            ctx.locals.add(&name, ty, ctx.next_slot, is_const, false);
            ctx.next_slot += ty.width();
            let func = &mut self.program.functions[ctx.index];
            func.params.push(ty);
            func.param_slots += ty.width() as u16;

            if !self.eat(&Lexeme::Comma) {
                break;
            }
        }
        self.expect(
            &Lexeme::RParen,
            ErrorCode::NoRightParen,
            "expected ')' after parameters",
        )?;
        Ok(())
    }

    // --- Declarations ---

    /// `[const] type init-list ';'`, emitted into the current code stream.
    fn parse_var_decl(&mut self) -> Result<(), Diagnostic> {
        let is_const = self.eat(&Lexeme::Const);
        let ty = self.parse_type_specifier().ok_or_else(|| {
            Diagnostic::error(
                ErrorCode::NeedVarType,
                "variable declaration needs a type specifier",
                self.current_span(),
            )
        })?;
        if ty == Ty::Void {
            return Err(Diagnostic::error(
                ErrorCode::Void,
                "a variable cannot have type void",
                self.prev_span(),
            ));
        }
        loop {
            self.parse_declarator(ty, is_const)?;
            if !self.eat(&Lexeme::Comma) {
                break;
            }
        }
        self.expect_semicolon()?;
        Ok(())
    }

    fn parse_declarator(&mut self, ty: Ty, is_const: bool) -> Result<(), Diagnostic> {
        let (name, name_span) = self.expect_ident()?;
        let redefinable = match &self.current {
            Some(ctx) => ctx.locals.can_redefine(&name),
            None => self.globals.can_redefine(&name),
        };
        if !redefinable {
            return Err(Diagnostic::error(
                ErrorCode::DuplicateDeclaration,
                format!("'{}' is already declared in this scope", name),
                name_span,
            )
            .with_help("shadowing is only allowed in an inner block"));
        }

        if self.eat(&Lexeme::Assign) {
            // The initialiser lands on the stack in the declared slot; the
            // name is bound afterwards, so `int a = a;` resolves outwards.
            let value_ty = self.parse_expression()?;
            self.coerce(value_ty, ty);
            self.declare(&name, ty, is_const, false);
        } else {
            if is_const {
                return Err(Diagnostic::error(
                    ErrorCode::ConstantNeedValue,
                    format!("constant '{}' must be initialised", name),
                    name_span,
                ));
            }
            self.emit(Instruction::with_x(Opcode::Ipush, 0));
            if ty == Ty::Double {
                self.emit(Instruction::new(Opcode::I2d));
            }
            self.declare(&name, ty, false, true);
        }
        Ok(())
    }

    fn declare(&mut self, name: &str, ty: Ty, is_const: bool, uninit: bool) {
        match &mut self.current {
            Some(ctx) => {
                ctx.locals.add(name, ty, ctx.next_slot, is_const, uninit);
                ctx.next_slot += ty.width();
            }
            None => {
                self.globals
                    .add(name, ty, self.global_next_slot, is_const, uninit);
                self.global_next_slot += ty.width();
            }
        }
    }

    // --- Statements ---

    fn parse_compound_statement(&mut self, push_level: bool) -> Result<(), Diagnostic> {
        let slots_before = self.current.as_ref().map_or(0, |ctx| ctx.next_slot);
        if push_level {
            self.current.as_mut().unwrap().locals.push_level();
        }
        self.expect(
            &Lexeme::LBrace,
            ErrorCode::InvalidDeclaration,
            "expected '{' to open a block",
        )?;
        while self.at(&Lexeme::Const) || self.peek().is_type_specifier() {
            self.parse_var_decl()?;
        }
        while !self.at(&Lexeme::RBrace) && !self.at(&Lexeme::Eof) {
            self.parse_statement()?;
        }
        self.expect(
            &Lexeme::RBrace,
            ErrorCode::NoRightBrace,
            "expected '}' to close the block",
        )?;
        if push_level {
            // Block locals die with their level: release the slots so a
            // re-entered block (a loop body) lands its declarations back in
            // the same positions.
            let freed = {
                let ctx = self.current.as_mut().unwrap();
                ctx.locals.pop_level();
                let freed = ctx.next_slot - slots_before;
                ctx.next_slot = slots_before;
                freed
            };
            for _ in 0..freed / 2 {
                self.emit(Instruction::new(Opcode::Pop2));
            }
            if freed % 2 == 1 {
                self.emit(Instruction::new(Opcode::Pop));
            }
        }
        Ok(())
    }

    fn parse_statement(&mut self) -> Result<(), Diagnostic> {
        match self.peek() {
            Lexeme::LBrace => self.parse_compound_statement(true),
            Lexeme::If => self.parse_if_statement(),
            Lexeme::While => self.parse_while_statement(),
            Lexeme::Return => self.parse_return_statement(),
            Lexeme::Print => self.parse_print_statement(),
            Lexeme::Scan => self.parse_scan_statement(),
            Lexeme::Semicolon => {
                self.advance();
                Ok(())
            }
            Lexeme::Ident(_) => {
                if *self.peek_at(1) == Lexeme::LParen {
                    let ret_ty = self.parse_call()?;
                    // A discarded return value may not linger on the stack.
                    match ret_ty.width() {
                        2 => self.emit(Instruction::new(Opcode::Pop2)),
                        1 => self.emit(Instruction::new(Opcode::Pop)),
                        _ => {}
                    }
                } else {
                    self.parse_assignment()?;
                }
                self.expect_semicolon()
            }
            reserved if reserved.is_reserved() => {
                let desc = self.peek().description();
                Err(Diagnostic::error(
                    ErrorCode::UnsupportedStatement,
                    format!("{} is reserved but has no statement form", desc),
                    self.current_span(),
                )
                .with_help("supported statements are blocks, if/else, while, return, scan, print, assignments and calls"))
            }
            Lexeme::Const | Lexeme::Int | Lexeme::Char | Lexeme::Double | Lexeme::Void => {
                Err(Diagnostic::error(
                    ErrorCode::InvalidDeclaration,
                    "variable declarations must precede the statements of a block",
                    self.current_span(),
                ))
            }
            other => Err(Diagnostic::error(
                ErrorCode::IncompleteExpression,
                format!("expected a statement, found {}", other.description()),
                self.current_span(),
            )),
        }
    }

    fn parse_if_statement(&mut self) -> Result<(), Diagnostic> {
        self.advance(); // if
        self.expect(
            &Lexeme::LParen,
            ErrorCode::ConditionExpected,
            "expected '(' after 'if'",
        )?;
        let cond_jump = self.parse_condition()?;
        self.expect(
            &Lexeme::RParen,
            ErrorCode::ConditionExpected,
            "expected ')' after condition",
        )?;
        self.parse_statement()?;

        if self.at(&Lexeme::Else) {
            // Skip over the else-branch once the then-branch completes.
            let skip_jump = self.emit_placeholder(Opcode::Jmp);
            let else_start = self.code_len();
            self.patch(cond_jump, else_start);
            self.advance(); // else
            self.parse_statement()?;
            let end = self.code_len();
            self.patch(skip_jump, end);
        } else {
            let end = self.code_len();
            self.patch(cond_jump, end);
        }
        Ok(())
    }

    fn parse_while_statement(&mut self) -> Result<(), Diagnostic> {
        self.advance(); // while
        self.expect(
            &Lexeme::LParen,
            ErrorCode::ConditionExpected,
            "expected '(' after 'while'",
        )?;
        let loop_start = self.code_len();
        let cond_jump = self.parse_condition()?;
        self.expect(
            &Lexeme::RParen,
            ErrorCode::ConditionExpected,
            "expected ')' after condition",
        )?;
        self.parse_statement()?;
        self.emit(Instruction::with_x(Opcode::Jmp, loop_start as i32));
        let end = self.code_len();
        self.patch(cond_jump, end);
        Ok(())
    }

    /// `expr [relop expr]`. Emits the comparison followed by a conditional
    /// jump whose sense is the negation of the relation, with a placeholder
    /// target; returns the jump's index for back-patching.
    fn parse_condition(&mut self) -> Result<usize, Diagnostic> {
        let lhs_ty = self.parse_expression()?;
        let negated = match self.peek() {
            Lexeme::Lt => Opcode::Jge,
            Lexeme::Le => Opcode::Jg,
            Lexeme::Gt => Opcode::Jle,
            Lexeme::Ge => Opcode::Jl,
            Lexeme::NotEq => Opcode::Je,
            Lexeme::EqEq => Opcode::Jne,
            _ => {
                // Plain condition: branch taken when the value is zero.
                if lhs_ty == Ty::Double {
                    self.emit(Instruction::new(Opcode::D2i));
                }
                return Ok(self.emit_placeholder(Opcode::Je));
            }
        };
        self.advance(); // relop
        let mark = self.code_len();
        let rhs_ty = self.parse_expression()?;
        let cmp_ty = self.promote_operands(lhs_ty, mark, rhs_ty);
        self.emit(Instruction::new(if cmp_ty == Ty::Double {
            Opcode::Dcmp
        } else {
            Opcode::Icmp
        }));
        Ok(self.emit_placeholder(negated))
    }

    fn parse_return_statement(&mut self) -> Result<(), Diagnostic> {
        self.advance(); // return
        let ctx_index = self.current.as_ref().unwrap().index;
        let return_ty = self.program.functions[ctx_index].return_ty;
        if return_ty == Ty::Void {
            self.emit(Instruction::new(Opcode::Ret));
        } else {
            if self.at(&Lexeme::Semicolon) {
                return Err(Diagnostic::error(
                    ErrorCode::IncompleteExpression,
                    format!(
                        "a {} function must return a value",
                        return_ty.display()
                    ),
                    self.current_span(),
                ));
            }
            let ty = self.parse_expression()?;
            self.coerce(ty, return_ty);
            self.emit(Instruction::new(if return_ty == Ty::Double {
                Opcode::Dret
            } else {
                Opcode::Iret
            }));
        }
        self.expect_semicolon()
    }

    fn parse_print_statement(&mut self) -> Result<(), Diagnostic> {
        self.advance(); // print
        self.expect(
            &Lexeme::LParen,
            ErrorCode::IncompleteExpression,
            "expected '(' after 'print'",
        )?;
        if !self.at(&Lexeme::RParen) {
            let mut first = true;
            loop {
                if !first {
                    // A space between successive items.
                    self.emit(Instruction::with_x(Opcode::Bipush, 32));
                    self.emit(Instruction::new(Opcode::Cprint));
                }
                first = false;

                if let Lexeme::Str(text) = self.peek() {
                    let text = text.clone();
                    self.advance();
                    let index = self.program.add_constant(Constant::S(text));
                    self.emit(Instruction::with_x(Opcode::Loadc, index as i32));
                    self.emit(Instruction::new(Opcode::Sprint));
                } else {
                    let ty = self.parse_expression()?;
                    self.emit(Instruction::new(match ty {
                        Ty::Double => Opcode::Dprint,
                        Ty::Char => Opcode::Cprint,
                        _ => Opcode::Iprint,
                    }));
                }
                if !self.eat(&Lexeme::Comma) {
                    break;
                }
            }
        }
        self.emit(Instruction::new(Opcode::Printl));
        self.expect(
            &Lexeme::RParen,
            ErrorCode::NoRightParen,
            "expected ')' after print items",
        )?;
        self.expect_semicolon()
    }

    fn parse_scan_statement(&mut self) -> Result<(), Diagnostic> {
        self.advance(); // scan
        self.expect(
            &Lexeme::LParen,
            ErrorCode::IncompleteExpression,
            "expected '(' after 'scan'",
        )?;
        let (name, name_span) = self.expect_ident()?;
        let (scope, var) = self.resolve(&name).ok_or_else(|| {
            Diagnostic::error(
                ErrorCode::NotDeclared,
                format!("'{}' is not declared", name),
                name_span,
            )
        })?;
        if var.is_const {
            return Err(Diagnostic::error(
                ErrorCode::AssignToConstant,
                format!("cannot scan into constant '{}'", name),
                name_span,
            ));
        }
        self.emit(Instruction::with_xy(Opcode::Loada, scope, var.index));
        self.emit(Instruction::new(match var.ty {
            Ty::Double => Opcode::Dscan,
            Ty::Char => Opcode::Cscan,
            _ => Opcode::Iscan,
        }));
        self.emit(Instruction::new(store_op(var.ty)));
        self.mark_assigned(&name);
        self.expect(
            &Lexeme::RParen,
            ErrorCode::NoRightParen,
            "expected ')' after scan target",
        )?;
        self.expect_semicolon()
    }

    fn parse_assignment(&mut self) -> Result<(), Diagnostic> {
        let (name, name_span) = self.expect_ident()?;
        let (scope, var) = self.resolve(&name).ok_or_else(|| {
            Diagnostic::error(
                ErrorCode::NotDeclared,
                format!("'{}' is not declared", name),
                name_span,
            )
        })?;
        if var.is_const {
            return Err(Diagnostic::error(
                ErrorCode::AssignToConstant,
                format!("cannot assign to constant '{}'", name),
                name_span,
            ));
        }
        self.expect(
            &Lexeme::Assign,
            ErrorCode::IncompleteExpression,
            "expected '=' in assignment",
        )?;
        self.emit(Instruction::with_xy(Opcode::Loada, scope, var.index));
        let value_ty = self.parse_expression()?;
        self.coerce(value_ty, var.ty);
        self.emit(Instruction::new(store_op(var.ty)));
        self.mark_assigned(&name);
        Ok(())
    }

    // --- Expressions ---

    /// `mul-expr { ('+'|'-') mul-expr }`. Returns the type of the value left
    /// on the stack.
    fn parse_expression(&mut self) -> Result<Ty, Diagnostic> {
        let mut lhs_ty = self.parse_mul_expression()?;
        loop {
            let subtract = match self.peek() {
                Lexeme::Plus => false,
                Lexeme::Minus => true,
                _ => break,
            };
            self.advance();
            let mark = self.code_len();
            let rhs_ty = self.parse_mul_expression()?;
            let ty = self.promote_operands(lhs_ty, mark, rhs_ty);
            self.emit(Instruction::new(match (subtract, ty) {
                (false, Ty::Double) => Opcode::Dadd,
                (false, _) => Opcode::Iadd,
                (true, Ty::Double) => Opcode::Dsub,
                (true, _) => Opcode::Isub,
            }));
            lhs_ty = ty;
        }
        Ok(lhs_ty)
    }

    fn parse_mul_expression(&mut self) -> Result<Ty, Diagnostic> {
        let mut lhs_ty = self.parse_cast_expression()?;
        loop {
            let divide = match self.peek() {
                Lexeme::Star => false,
                Lexeme::Slash => true,
                _ => break,
            };
            self.advance();
            let mark = self.code_len();
            let rhs_ty = self.parse_cast_expression()?;
            let ty = self.promote_operands(lhs_ty, mark, rhs_ty);
            self.emit(Instruction::new(match (divide, ty) {
                (false, Ty::Double) => Opcode::Dmul,
                (false, _) => Opcode::Imul,
                (true, Ty::Double) => Opcode::Ddiv,
                (true, _) => Opcode::Idiv,
            }));
            lhs_ty = ty;
        }
        Ok(lhs_ty)
    }

    /// `[ '(' type ')' ] unary-expr`, casts may nest.
    fn parse_cast_expression(&mut self) -> Result<Ty, Diagnostic> {
        if *self.peek() == Lexeme::LParen && self.peek_at(1).is_type_specifier() {
            self.advance(); // (
            let target = self.parse_type_specifier().unwrap();
            if target == Ty::Void {
                return Err(Diagnostic::error(
                    ErrorCode::Void,
                    "cannot cast to void",
                    self.prev_span(),
                ));
            }
            self.expect(
                &Lexeme::RParen,
                ErrorCode::NoRightParen,
                "expected ')' after cast type",
            )?;
            let inner = self.parse_cast_expression()?;
            self.emit_cast(inner, target);
            return Ok(target);
        }
        self.parse_unary_expression()
    }

    fn parse_unary_expression(&mut self) -> Result<Ty, Diagnostic> {
        let negate = if self.eat(&Lexeme::Plus) {
            false
        } else {
            self.eat(&Lexeme::Minus)
        };
        let ty = self.parse_primary()?;
        if negate {
            return Ok(match ty {
                Ty::Double => {
                    self.emit(Instruction::new(Opcode::Dneg));
                    Ty::Double
                }
                _ => {
                    self.emit(Instruction::new(Opcode::Ineg));
                    Ty::Int
                }
            });
        }
        Ok(ty)
    }

    fn parse_primary(&mut self) -> Result<Ty, Diagnostic> {
        match self.peek().clone() {
            Lexeme::LParen => {
                self.advance();
                let ty = self.parse_expression()?;
                self.expect(
                    &Lexeme::RParen,
                    ErrorCode::NoRightParen,
                    "expected ')' after expression",
                )?;
                Ok(ty)
            }
            Lexeme::Integer(value) => {
                let span = self.current_span();
                self.advance();
                if value > i32::MAX as i64 {
                    return Err(Diagnostic::error(
                        ErrorCode::IntegerOverflow,
                        format!("integer literal {} does not fit in int", value),
                        span,
                    )
                    .with_help(format!("the largest int literal is {}", i32::MAX)));
                }
                self.emit(Instruction::with_x(Opcode::Ipush, value as i32));
                Ok(Ty::Int)
            }
            Lexeme::Float(value) => {
                self.advance();
                let index = self.program.add_constant(Constant::D(value));
                self.emit(Instruction::with_x(Opcode::Loadc, index as i32));
                Ok(Ty::Double)
            }
            Lexeme::CharLit(ch) => {
                self.advance();
                // Operand is a sign-extended byte.
                self.emit(Instruction::with_x(
                    Opcode::Bipush,
                    (ch as u8 as i8) as i32,
                ));
                Ok(Ty::Int)
            }
            Lexeme::Ident(_) => {
                if *self.peek_at(1) == Lexeme::LParen {
                    let span = self.current_span();
                    let ty = self.parse_call()?;
                    if ty == Ty::Void {
                        return Err(Diagnostic::error(
                            ErrorCode::Void,
                            "a void function call cannot appear in an expression",
                            span,
                        ));
                    }
                    Ok(ty)
                } else {
                    self.parse_variable_load()
                }
            }
            Lexeme::Str(_) => Err(Diagnostic::error(
                ErrorCode::IncompleteExpression,
                "string literals are only valid as print items",
                self.current_span(),
            )),
            other => Err(Diagnostic::error(
                ErrorCode::IncompleteExpression,
                format!("expected expression, found {}", other.description()),
                self.current_span(),
            )
            .with_help("expressions are literals, variables, calls, casts and arithmetic")),
        }
    }

    fn parse_variable_load(&mut self) -> Result<Ty, Diagnostic> {
        let (name, name_span) = self.expect_ident()?;
        let (scope, var) = self.resolve(&name).ok_or_else(|| {
            Diagnostic::error(
                ErrorCode::NotDeclared,
                format!("'{}' is not declared", name),
                name_span,
            )
        })?;
        if var.uninit {
            return Err(Diagnostic::error(
                ErrorCode::NotInitialized,
                format!("'{}' is used before being assigned", name),
                name_span,
            )
            .with_help("give the variable a value with '=' or scan() first"));
        }
        self.emit(Instruction::with_xy(Opcode::Loada, scope, var.index));
        self.emit(Instruction::new(if var.ty == Ty::Double {
            Opcode::Dload
        } else {
            Opcode::Iload
        }));
        Ok(var.ty)
    }

    /// `ident '(' [args] ')'`. The k-th argument is coerced to the k-th
    /// parameter type. Returns the callee's return type.
    fn parse_call(&mut self) -> Result<Ty, Diagnostic> {
        let (name, name_span) = self.expect_ident()?;
        let (func_index, params, return_ty) = {
            let func = self
                .program
                .functions
                .iter()
                .find(|f| f.name == name)
                .ok_or_else(|| {
                    Diagnostic::error(
                        ErrorCode::NotDeclared,
                        format!("function '{}' is not defined", name),
                        name_span,
                    )
                })?;
            (func.index, func.params.clone(), func.return_ty)
        };
        self.advance(); // (

        let mut argc = 0usize;
        if !self.at(&Lexeme::RParen) {
            loop {
                if argc >= params.len() {
                    return Err(Diagnostic::error(
                        ErrorCode::FunctionParams,
                        format!(
                            "'{}' takes {} argument(s), more were supplied",
                            name,
                            params.len()
                        ),
                        self.current_span(),
                    ));
                }
                let arg_ty = self.parse_expression()?;
                self.coerce(arg_ty, params[argc]);
                argc += 1;
                if !self.eat(&Lexeme::Comma) {
                    break;
                }
            }
        }
        self.expect(
            &Lexeme::RParen,
            ErrorCode::NoRightParen,
            "expected ')' after arguments",
        )?;
        if argc != params.len() {
            return Err(Diagnostic::error(
                ErrorCode::FunctionParams,
                format!(
                    "'{}' takes {} argument(s), {} supplied",
                    name,
                    params.len(),
                    argc
                ),
                name_span,
            ));
        }
        self.emit(Instruction::with_x(Opcode::Call, func_index as i32));
        Ok(return_ty)
    }

    // --- Typing helpers ---

    /// Arithmetic and comparison operands: the result is double if either
    /// side is. A narrow left side gets its `i2d` inserted at `mark`, right
    /// after its own code (expressions emit no branches, so no recorded jump
    /// can be invalidated); a narrow right side is promoted in place.
    fn promote_operands(&mut self, lhs_ty: Ty, mark: usize, rhs_ty: Ty) -> Ty {
        if lhs_ty != Ty::Double && rhs_ty != Ty::Double {
            return Ty::Int;
        }
        if lhs_ty != Ty::Double {
            self.insert(mark, Instruction::new(Opcode::I2d));
        }
        if rhs_ty != Ty::Double {
            self.emit(Instruction::new(Opcode::I2d));
        }
        Ty::Double
    }

    /// Assignment-style conversion of the value on top of the stack.
    fn coerce(&mut self, from: Ty, to: Ty) {
        if from == Ty::Double && to.is_integral() {
            self.emit(Instruction::new(Opcode::D2i));
        } else if from.is_integral() && to == Ty::Double {
            self.emit(Instruction::new(Opcode::I2d));
        }
    }

    /// Explicit `(T)` cast of the value on top of the stack.
    fn emit_cast(&mut self, from: Ty, to: Ty) {
        match (from, to) {
            (Ty::Int, Ty::Char) => self.emit(Instruction::new(Opcode::I2c)),
            (Ty::Double, Ty::Int) => self.emit(Instruction::new(Opcode::D2i)),
            (Ty::Double, Ty::Char) => {
                self.emit(Instruction::new(Opcode::D2i));
                self.emit(Instruction::new(Opcode::I2c));
            }
            (Ty::Int, Ty::Double) | (Ty::Char, Ty::Double) => {
                self.emit(Instruction::new(Opcode::I2d));
            }
            _ => {}
        }
    }

    // --- Symbol helpers ---

    /// Resolve a name to (`loada` scope operand, Var): current frame first,
    /// then the globals.
    fn resolve(&self, name: &str) -> Option<(i32, Var)> {
        if let Some(ctx) = &self.current {
            if let Some(var) = ctx.locals.info(name) {
                return Some((SCOPE_LOCAL, var));
            }
        }
        self.globals.info(name).map(|var| (SCOPE_GLOBAL, var))
    }

    fn mark_assigned(&mut self, name: &str) {
        if let Some(ctx) = &mut self.current {
            if ctx.locals.declared(name) {
                ctx.locals.assign(name);
                return;
            }
        }
        self.globals.assign(name);
    }

    // --- Emission helpers ---

    fn code(&mut self) -> &mut Vec<Instruction> {
        match &self.current {
            Some(ctx) => &mut self.program.functions[ctx.index].ins,
            None => &mut self.program.start,
        }
    }

    fn code_len(&self) -> usize {
        match &self.current {
            Some(ctx) => self.program.functions[ctx.index].ins.len(),
            None => self.program.start.len(),
        }
    }

    fn emit(&mut self, ins: Instruction) {
        self.code().push(ins);
    }

    fn insert(&mut self, at: usize, ins: Instruction) {
        self.code().insert(at, ins);
    }

    /// Emit a branch with placeholder target 0; the index is recorded at the
    /// point of emission and patched once the target is known.
    fn emit_placeholder(&mut self, op: Opcode) -> usize {
        self.emit(Instruction::with_x(op, 0));
        self.code_len() - 1
    }

    fn patch(&mut self, at: usize, target: usize) {
        self.code()[at].x = target as i32;
    }

    // --- Token cursor ---

    fn peek(&self) -> &Lexeme {
        &self.tokens[self.pos].node
    }

    fn peek_at(&self, ahead: usize) -> &Lexeme {
        let at = (self.pos + ahead).min(self.tokens.len() - 1);
        &self.tokens[at].node
    }

    fn at(&self, lexeme: &Lexeme) -> bool {
        self.peek() == lexeme
    }

    fn advance(&mut self) -> Spanned<Lexeme> {
        let tok = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, lexeme: &Lexeme) -> bool {
        if self.at(lexeme) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(
        &mut self,
        lexeme: &Lexeme,
        code: ErrorCode,
        message: &str,
    ) -> Result<(), Diagnostic> {
        if self.eat(lexeme) {
            Ok(())
        } else {
            Err(Diagnostic::error(
                code,
                format!("{}, found {}", message, self.peek().description()),
                self.current_span(),
            ))
        }
    }

    fn expect_semicolon(&mut self) -> Result<(), Diagnostic> {
        self.expect(
            &Lexeme::Semicolon,
            ErrorCode::NoSemicolon,
            "expected ';'",
        )
    }

    fn expect_ident(&mut self) -> Result<(String, Span), Diagnostic> {
        if let Lexeme::Ident(name) = self.peek() {
            let name = name.clone();
            let span = self.current_span();
            self.advance();
            Ok((name, span))
        } else {
            Err(Diagnostic::error(
                ErrorCode::NeedIdentifier,
                format!("expected identifier, found {}", self.peek().description()),
                self.current_span(),
            ))
        }
    }

    fn parse_type_specifier(&mut self) -> Option<Ty> {
        let ty = match self.peek() {
            Lexeme::Int => Ty::Int,
            Lexeme::Char => Ty::Char,
            Lexeme::Double => Ty::Double,
            Lexeme::Void => Ty::Void,
            _ => return None,
        };
        self.advance();
        Some(ty)
    }

    fn current_span(&self) -> Span {
        self.tokens[self.pos].span
    }

    fn prev_span(&self) -> Span {
        if self.pos == 0 {
            Span::dummy()
        } else {
            self.tokens[self.pos - 1].span
        }
    }
}

fn store_op(ty: Ty) -> Opcode {
    match ty {
        Ty::Double => Opcode::Dstore,
        Ty::Char => Opcode::Cstore,
        _ => Opcode::Istore,
    }
}
