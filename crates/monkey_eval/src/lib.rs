use std::fmt;
use std::rc::Rc;

use monkey_syntax::{modify_expr, modify_program, Block, Expr, InfixOp, PrefixOp, Program, Stmt};
use monkey_vm::{
    lookup_builtin, Environment, FunctionValue, HashKey, HashPair, HashValue, MacroValue, Value,
};

/// Fatal macro-usage failure: the expansion pass could not rewrite the
/// program.
#[derive(Debug, Clone, PartialEq)]
pub struct MacroError {
    pub message: String,
}

impl fmt::Display for MacroError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "macro error: {}", self.message)
    }
}

impl std::error::Error for MacroError {}

// ---------------------------------------------------------------------------
// Tree interpreter
// ---------------------------------------------------------------------------

// The interpreter signals failure in-band: errors are `Value::Error` and
// short-circuit outward, `return` bubbles as `Value::ReturnValue`.

pub fn eval_program(program: &Program, env: &Environment) -> Value {
    let mut result = Value::Null;
    for stmt in &program.statements {
        result = eval_stmt(stmt, env);
        match result {
            Value::ReturnValue(value) => return *value,
            Value::Error(_) => return result,
            _ => {}
        }
    }
    result
}

fn eval_block(block: &Block, env: &Environment) -> Value {
    let mut result = Value::Null;
    for stmt in &block.statements {
        result = eval_stmt(stmt, env);
        if matches!(result, Value::ReturnValue(_) | Value::Error(_)) {
            return result;
        }
    }
    result
}

fn eval_stmt(stmt: &Stmt, env: &Environment) -> Value {
    match stmt {
        Stmt::Expr(expr) => eval_expr(expr, env),
        Stmt::Let { name, value } => {
            let value = eval_expr(value, env);
            if value.is_error() {
                return value;
            }
            env.set(name, value);
            Value::Null
        }
        Stmt::Return(value) => {
            let value = eval_expr(value, env);
            if value.is_error() {
                return value;
            }
            Value::ReturnValue(Box::new(value))
        }
    }
}

fn eval_expr(expr: &Expr, env: &Environment) -> Value {
    match expr {
        Expr::Integer(value) => Value::Integer(*value),
        Expr::String(value) => Value::String(Rc::new(value.clone())),
        Expr::Boolean(value) => Value::Boolean(*value),
        Expr::Null => Value::Null,
        Expr::Ident(name) => eval_identifier(name, env),
        Expr::Prefix { op, right } => {
            let right = eval_expr(right, env);
            if right.is_error() {
                return right;
            }
            eval_prefix_expression(*op, right)
        }
        Expr::Infix { op, left, right } => {
            let left = eval_expr(left, env);
            if left.is_error() {
                return left;
            }
            let right = eval_expr(right, env);
            if right.is_error() {
                return right;
            }
            eval_infix_expression(*op, left, right)
        }
        Expr::If {
            condition,
            consequence,
            alternative,
        } => {
            let condition = eval_expr(condition, env);
            if condition.is_error() {
                return condition;
            }
            if is_truthy(&condition) {
                eval_block(consequence, env)
            } else if let Some(alternative) = alternative {
                eval_block(alternative, env)
            } else {
                Value::Null
            }
        }
        Expr::Function {
            parameters, body, ..
        } => Value::Function(Rc::new(FunctionValue {
            parameters: parameters.clone(),
            body: body.clone(),
            env: env.clone(),
        })),
        // Macro literals only carry meaning inside the definition pass.
        Expr::Macro { .. } => Value::Null,
        Expr::Call {
            function,
            arguments,
        } => {
            // `quote` suppresses evaluation and must win over call dispatch.
            if let Expr::Ident(name) = function.as_ref() {
                if name == "quote" && arguments.len() == 1 {
                    return quote(&arguments[0], env);
                }
            }
            let function = eval_expr(function, env);
            if function.is_error() {
                return function;
            }
            let args = match eval_expressions(arguments, env) {
                Ok(args) => args,
                Err(err) => return err,
            };
            apply_function(function, &args)
        }
        Expr::Array(elements) => match eval_expressions(elements, env) {
            Ok(elements) => Value::Array(Rc::new(elements)),
            Err(err) => err,
        },
        Expr::Index { left, index } => {
            let left = eval_expr(left, env);
            if left.is_error() {
                return left;
            }
            let index = eval_expr(index, env);
            if index.is_error() {
                return index;
            }
            eval_index_expression(left, index)
        }
        Expr::Hash(pairs) => eval_hash_literal(pairs, env),
    }
}

fn eval_expressions(exprs: &[Expr], env: &Environment) -> Result<Vec<Value>, Value> {
    let mut values = Vec::with_capacity(exprs.len());
    for expr in exprs {
        let value = eval_expr(expr, env);
        if value.is_error() {
            return Err(value);
        }
        values.push(value);
    }
    Ok(values)
}

fn eval_identifier(name: &str, env: &Environment) -> Value {
    if let Some(value) = env.get(name) {
        return value;
    }
    if let Some(builtin) = lookup_builtin(name) {
        return Value::Builtin(builtin);
    }
    Value::Error(format!("identifier not found: {name}"))
}

fn eval_prefix_expression(op: PrefixOp, right: Value) -> Value {
    match op {
        PrefixOp::Bang => Value::Boolean(!is_truthy(&right)),
        PrefixOp::Minus => match right {
            Value::Integer(value) => Value::Integer(value.wrapping_neg()),
            other => Value::Error(format!("unknown operator: -{}", other.type_name())),
        },
    }
}

fn eval_infix_expression(op: InfixOp, left: Value, right: Value) -> Value {
    match (&left, &right) {
        (Value::Integer(l), Value::Integer(r)) => eval_integer_infix_expression(op, *l, *r),
        (Value::String(l), Value::String(r)) => match op {
            InfixOp::Add => {
                let mut value = l.as_ref().clone();
                value.push_str(r);
                Value::String(Rc::new(value))
            }
            InfixOp::Eq => Value::Boolean(l == r),
            InfixOp::NotEq => Value::Boolean(l != r),
            _ => Value::Error(format!(
                "unknown operator: {} {} {}",
                left.type_name(),
                op,
                right.type_name()
            )),
        },
        _ => match op {
            InfixOp::Eq => Value::Boolean(left == right),
            InfixOp::NotEq => Value::Boolean(left != right),
            _ => {
                if left.type_name() != right.type_name() {
                    Value::Error(format!(
                        "type mismatch: {} {} {}",
                        left.type_name(),
                        op,
                        right.type_name()
                    ))
                } else {
                    Value::Error(format!(
                        "unknown operator: {} {} {}",
                        left.type_name(),
                        op,
                        right.type_name()
                    ))
                }
            }
        },
    }
}

fn eval_integer_infix_expression(op: InfixOp, left: i64, right: i64) -> Value {
    match op {
        InfixOp::Add => Value::Integer(left.wrapping_add(right)),
        InfixOp::Sub => Value::Integer(left.wrapping_sub(right)),
        InfixOp::Mul => Value::Integer(left.wrapping_mul(right)),
        InfixOp::Div => Value::Integer(left.wrapping_div(right)),
        InfixOp::Eq => Value::Boolean(left == right),
        InfixOp::NotEq => Value::Boolean(left != right),
        InfixOp::Lt => Value::Boolean(left < right),
        InfixOp::Gt => Value::Boolean(left > right),
    }
}

fn eval_index_expression(left: Value, index: Value) -> Value {
    match &left {
        Value::Array(elements) => match index {
            Value::Integer(i) => {
                if i < 0 {
                    Value::Null
                } else {
                    elements.get(i as usize).cloned().unwrap_or(Value::Null)
                }
            }
            other => Value::Error(format!(
                "index must be of type integer, got: {}",
                other.type_name()
            )),
        },
        Value::Hash(pairs) => match index.hash_key() {
            Some(key) => pairs
                .get(&key)
                .map(|pair| pair.value.clone())
                .unwrap_or(Value::Null),
            None => Value::Error(format!(
                "index must be of type integer, string or boolean, got: {}",
                index.type_name()
            )),
        },
        other => Value::Error(format!(
            "index operator not supported: {}",
            other.type_name()
        )),
    }
}

fn eval_hash_literal(pairs: &[(Expr, Expr)], env: &Environment) -> Value {
    let mut hash: HashValue = HashValue::new();
    for (key_expr, value_expr) in pairs {
        let key = eval_expr(key_expr, env);
        if key.is_error() {
            return key;
        }
        let hash_key: HashKey = match key.hash_key() {
            Some(hash_key) => hash_key,
            None => return Value::Error(format!("unusable as hash key: {}", key.type_name())),
        };
        let value = eval_expr(value_expr, env);
        if value.is_error() {
            return value;
        }
        hash.insert(hash_key, HashPair { key, value });
    }
    Value::Hash(Rc::new(hash))
}

fn apply_function(function: Value, args: &[Value]) -> Value {
    match function {
        Value::Function(func) => {
            if args.len() != func.parameters.len() {
                return Value::Error(format!(
                    "wrong amount of arguments. got {}, need {}",
                    args.len(),
                    func.parameters.len()
                ));
            }
            let call_env = Environment::new_enclosed(&func.env);
            for (param, arg) in func.parameters.iter().zip(args.iter()) {
                call_env.set(param, arg.clone());
            }
            unwrap_return_value(eval_block(&func.body, &call_env))
        }
        Value::Builtin(builtin) => (builtin.func)(args),
        other => Value::Error(format!("not a function: {}", other.type_name())),
    }
}

fn unwrap_return_value(value: Value) -> Value {
    match value {
        Value::ReturnValue(value) => *value,
        other => other,
    }
}

fn is_truthy(value: &Value) -> bool {
    !matches!(value, Value::Boolean(false) | Value::Null)
}

// ---------------------------------------------------------------------------
// Quote / unquote
// ---------------------------------------------------------------------------

/// Wraps `expr` unevaluated, after replacing every nested `unquote(x)` call
/// with the AST form of evaluating `x`.
fn quote(expr: &Expr, env: &Environment) -> Value {
    let rewritten = eval_unquote_calls(expr.clone(), env);
    Value::Quote(Rc::new(rewritten))
}

fn eval_unquote_calls(quoted: Expr, env: &Environment) -> Expr {
    modify_expr(quoted, &mut |expr| {
        let argument = match &expr {
            Expr::Call {
                function,
                arguments,
            } if arguments.len() == 1 => match function.as_ref() {
                Expr::Ident(name) if name == "unquote" => arguments[0].clone(),
                _ => return expr,
            },
            _ => return expr,
        };
        let unquoted = eval_expr(&argument, env);
        convert_value_to_expr(unquoted)
    })
}

fn convert_value_to_expr(value: Value) -> Expr {
    match value {
        Value::Integer(value) => Expr::Integer(value),
        Value::Boolean(value) => Expr::Boolean(value),
        Value::Quote(node) => (*node).clone(),
        _ => Expr::Null,
    }
}

// ---------------------------------------------------------------------------
// Macro definition and expansion
// ---------------------------------------------------------------------------

/// Harvests top-level `let name = macro(...) { ... }` statements into the
/// macro environment and removes them from the program.
pub fn define_macros(program: &mut Program, env: &Environment) {
    let statements = std::mem::take(&mut program.statements);
    let mut kept = Vec::with_capacity(statements.len());
    for stmt in statements {
        match stmt {
            Stmt::Let {
                name,
                value: Expr::Macro { parameters, body },
            } => {
                let value = Value::Macro(Rc::new(MacroValue {
                    parameters,
                    body,
                    env: env.clone(),
                }));
                env.set(&name, value);
            }
            other => kept.push(other),
        }
    }
    program.statements = kept;
}

/// Rewrites every call of a defined macro with the quoted result of
/// evaluating the macro body over the quoted arguments.
pub fn expand_macros(program: Program, env: &Environment) -> Result<Program, MacroError> {
    let mut error: Option<String> = None;
    let expanded = modify_program(program, &mut |expr| {
        if error.is_some() {
            return expr;
        }
        let (macro_value, arguments) = match macro_call(&expr, env) {
            Some(found) => found,
            None => return expr,
        };
        if arguments.len() != macro_value.parameters.len() {
            error = Some(format!(
                "wrong amount of macro arguments. got {}, need {}",
                arguments.len(),
                macro_value.parameters.len()
            ));
            return expr;
        }

        let eval_env = Environment::new_enclosed(&macro_value.env);
        for (param, arg) in macro_value.parameters.iter().zip(arguments.iter()) {
            eval_env.set(param, Value::Quote(Rc::new(arg.clone())));
        }

        let evaluated = unwrap_return_value(eval_block(&macro_value.body, &eval_env));
        match evaluated {
            Value::Quote(node) => (*node).clone(),
            other => {
                error = Some(format!(
                    "we only support returning AST-nodes from macros, got {}",
                    other.type_name()
                ));
                expr
            }
        }
    });
    match error {
        Some(message) => Err(MacroError { message }),
        None => Ok(expanded),
    }
}

fn macro_call(expr: &Expr, env: &Environment) -> Option<(Rc<MacroValue>, Vec<Expr>)> {
    let (function, arguments) = match expr {
        Expr::Call {
            function,
            arguments,
        } => (function, arguments),
        _ => return None,
    };
    let name = match function.as_ref() {
        Expr::Ident(name) => name,
        _ => return None,
    };
    match env.get(name) {
        Some(Value::Macro(macro_value)) => Some((macro_value, arguments.clone())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use monkey_parser::parse_program;
    use monkey_vm::{Compiler, Vm};

    fn parse(input: &str) -> Program {
        parse_program(input).expect("parse program")
    }

    fn eval_input(input: &str) -> Value {
        let program = parse(input);
        let env = Environment::new();
        eval_program(&program, &env)
    }

    fn int(value: i64) -> Value {
        Value::Integer(value)
    }

    #[test]
    fn evaluates_literals_and_arithmetic() {
        let cases = [
            ("5", 5),
            ("-5", -5),
            ("5 + 5 + 5 + 5 - 10", 10),
            ("2 * 2 * 2 * 2 * 2", 32),
            ("50 / 2 * 2 + 10", 60),
            ("3 * (3 * 3) + 10", 37),
        ];
        for (input, expected) in cases {
            assert_eq!(eval_input(input), int(expected), "input: {input}");
        }
    }

    #[test]
    fn evaluates_booleans_and_bang() {
        let cases = [
            ("true", true),
            ("1 < 2", true),
            ("1 > 2", false),
            ("1 == 1", true),
            ("1 != 2", true),
            ("true != false", true),
            ("!true", false),
            ("!null", true),
            ("!!5", true),
            ("\"a\" == \"a\"", true),
            ("\"a\" != \"b\"", true),
        ];
        for (input, expected) in cases {
            assert_eq!(eval_input(input), Value::Boolean(expected), "input: {input}");
        }
    }

    #[test]
    fn evaluates_conditionals_and_returns() {
        assert_eq!(eval_input("if (true) { 10 }"), int(10));
        assert_eq!(eval_input("if (false) { 10 }"), Value::Null);
        assert_eq!(eval_input("if (1 > 2) { 10 } else { 20 }"), int(20));
        assert_eq!(eval_input("return 10; 9;"), int(10));
        assert_eq!(eval_input("9; return 2 * 5; 9;"), int(10));
        assert_eq!(
            eval_input("if (10 > 1) { if (10 > 1) { return 10; } return 1; }"),
            int(10)
        );
    }

    #[test]
    fn evaluates_let_and_functions() {
        assert_eq!(eval_input("let a = 5; a;"), int(5));
        assert_eq!(eval_input("let a = 5 * 5; a;"), int(25));
        assert_eq!(
            eval_input("let identity = fn(x) { x; }; identity(5);"),
            int(5)
        );
        assert_eq!(
            eval_input("let double = fn(x) { x * 2; }; double(5);"),
            int(10)
        );
        assert_eq!(eval_input("fn(x) { x; }(5)"), int(5));
        assert_eq!(
            eval_input(
                "let newAdder = fn(x) { fn(y) { x + y }; }; let addTwo = newAdder(2); addTwo(2);"
            ),
            int(4)
        );
    }

    #[test]
    fn evaluates_strings_arrays_and_hashes() {
        assert_eq!(
            eval_input("\"Hello\" + \" \" + \"World!\""),
            Value::String(Rc::new("Hello World!".to_string()))
        );
        assert_eq!(eval_input("[1, 2 * 2, 3 + 3][2]"), int(6));
        assert_eq!(eval_input("[1, 2, 3][99]"), Value::Null);
        assert_eq!(eval_input("{\"one\": 1, \"two\": 2}[\"two\"]"), int(2));
        assert_eq!(eval_input("{\"one\": 1}[\"three\"]"), Value::Null);
        assert_eq!(eval_input("{true: 5}[true]"), int(5));
        assert_eq!(eval_input("len(\"four\")"), int(4));
        assert_eq!(eval_input("first([7, 8])"), int(7));
    }

    #[test]
    fn reports_evaluation_errors_in_band() {
        let cases = [
            ("5 + true;", "type mismatch: INTEGER + BOOLEAN"),
            ("5 + true; 5;", "type mismatch: INTEGER + BOOLEAN"),
            ("-true", "unknown operator: -BOOLEAN"),
            ("true + false;", "unknown operator: BOOLEAN + BOOLEAN"),
            ("if (10 > 1) { true + false; }", "unknown operator: BOOLEAN + BOOLEAN"),
            ("foobar", "identifier not found: foobar"),
            ("\"Hello\" - \"World\"", "unknown operator: STRING - STRING"),
            ("{[1, 2]: 1}", "unusable as hash key: ARRAY"),
            ("5(1)", "not a function: INTEGER"),
        ];
        for (input, expected) in cases {
            assert_eq!(
                eval_input(input),
                Value::Error(expected.to_string()),
                "input: {input}"
            );
        }
    }

    // -- quote / unquote ---------------------------------------------------

    fn eval_quote(input: &str) -> String {
        match eval_input(input) {
            Value::Quote(node) => node.to_string(),
            other => panic!("expected quote, got {other:?}"),
        }
    }

    #[test]
    fn quote_suppresses_evaluation() {
        let cases = [
            ("quote(5)", "5"),
            ("quote(5 + 8)", "(5 + 8)"),
            ("quote(foobar)", "foobar"),
            ("quote(foobar + barfoo)", "(foobar + barfoo)"),
        ];
        for (input, expected) in cases {
            assert_eq!(eval_quote(input), expected, "input: {input}");
        }
    }

    #[test]
    fn unquote_splices_evaluated_results() {
        let cases = [
            ("quote(unquote(4))", "4"),
            ("quote(unquote(4 + 4))", "8"),
            ("quote(8 + unquote(4 + 4))", "(8 + 8)"),
            ("quote(unquote(4 + 4) + 8)", "(8 + 8)"),
            ("let foobar = 8; quote(foobar)", "foobar"),
            ("let foobar = 8; quote(unquote(foobar))", "8"),
            ("quote(unquote(true))", "true"),
            ("quote(unquote(true == false))", "false"),
            ("quote(unquote(quote(4 + 4)))", "(4 + 4)"),
            (
                "let quotedInfixExpression = quote(4 + 4); quote(unquote(4 + 4) + unquote(quotedInfixExpression))",
                "(8 + (4 + 4))",
            ),
        ];
        for (input, expected) in cases {
            assert_eq!(eval_quote(input), expected, "input: {input}");
        }
    }

    #[test]
    fn unquote_of_unconvertible_values_becomes_null() {
        assert_eq!(eval_quote("quote(unquote(\"str\"))"), "null");
    }

    // -- macros ------------------------------------------------------------

    #[test]
    fn define_macros_harvests_top_level_definitions() {
        let mut program = parse(
            "let number = 1; let function = fn(x, y) { x + y }; let mymacro = macro(x, y) { x + y; };",
        );
        let env = Environment::new();
        define_macros(&mut program, &env);

        assert_eq!(program.statements.len(), 2);
        assert!(env.get("number").is_none());
        assert!(env.get("function").is_none());
        match env.get("mymacro") {
            Some(Value::Macro(macro_value)) => {
                assert_eq!(macro_value.parameters, vec!["x".to_string(), "y".to_string()]);
                assert_eq!(macro_value.body.to_string(), "(x + y)");
            }
            other => panic!("expected macro, got {other:?}"),
        }
    }

    fn expand_input(input: &str) -> Program {
        let mut program = parse(input);
        let env = Environment::new();
        define_macros(&mut program, &env);
        expand_macros(program, &env).expect("expand macros")
    }

    #[test]
    fn expands_macro_calls_into_quoted_bodies() {
        let cases = [
            (
                "let infixExpression = macro() { quote(1 + 2); }; infixExpression();",
                "(1 + 2)",
            ),
            (
                "let reverse = macro(a, b) { quote(unquote(b) - unquote(a)); }; reverse(2 + 2, 10 - 5);",
                "((10 - 5) - (2 + 2))",
            ),
            (
                "let unless = macro(condition, consequence, alternative) { quote(if (!(unquote(condition))) { unquote(consequence); } else { unquote(alternative); }); }; unless(10 > 5, puts(\"not greater\"), puts(\"greater\"));",
                "if (!((10 > 5))) { puts(\"not greater\") } else { puts(\"greater\") }",
            ),
        ];
        for (input, expected) in cases {
            let expanded = expand_input(input);
            let expected = parse(expected);
            assert_eq!(
                expanded.to_string(),
                expected.to_string(),
                "input: {input}"
            );
        }
    }

    #[test]
    fn expansion_is_idempotent_for_non_generative_macros() {
        let input =
            "let reverse = macro(a, b) { quote(unquote(b) - unquote(a)); }; reverse(2 + 2, 10 - 5);";
        let mut program = parse(input);
        let env = Environment::new();
        define_macros(&mut program, &env);
        let once = expand_macros(program, &env).expect("first expansion");
        let twice = expand_macros(once.clone(), &env).expect("second expansion");
        assert_eq!(once, twice);
    }

    #[test]
    fn non_quote_macro_results_are_fatal() {
        let mut program = parse("let bad = macro() { 1; }; bad();");
        let env = Environment::new();
        define_macros(&mut program, &env);
        let err = expand_macros(program, &env).expect_err("expected macro error");
        assert!(
            err.message.contains("only support returning AST-nodes"),
            "message: {}",
            err.message
        );
    }

    #[test]
    fn macro_arity_mismatches_are_fatal() {
        let mut program = parse("let m = macro(a, b) { quote(unquote(a)); }; m(1);");
        let env = Environment::new();
        define_macros(&mut program, &env);
        let err = expand_macros(program, &env).expect_err("expected macro error");
        assert!(err.message.contains("wrong amount"), "message: {}", err.message);
    }

    #[test]
    fn expanded_programs_compile_and_run() {
        let mut program =
            parse("let m = macro(x, y) { quote(unquote(y) - unquote(x)); }; m(2 + 2, 10 - 5)");
        let env = Environment::new();
        define_macros(&mut program, &env);
        let expanded = expand_macros(program, &env).expect("expand macros");
        assert_eq!(expanded.to_string(), "((10 - 5) - (2 + 2))");

        let mut compiler = Compiler::new();
        compiler.compile(&expanded).expect("compile");
        let mut vm = Vm::new(compiler.bytecode());
        vm.run().expect("run");
        assert_eq!(vm.last_popped(), int(1));
    }
}
