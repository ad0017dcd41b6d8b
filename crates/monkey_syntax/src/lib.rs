use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub statements: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let { name: String, value: Expr },
    Return(Expr),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Integer(i64),
    String(String),
    Boolean(bool),
    Null,
    Ident(String),
    Prefix {
        op: PrefixOp,
        right: Box<Expr>,
    },
    Infix {
        op: InfixOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    If {
        condition: Box<Expr>,
        consequence: Block,
        alternative: Option<Block>,
    },
    Function {
        // Attached by the parser when the literal is the value of a `let`,
        // so the body can resolve the binding as a self-reference.
        name: Option<String>,
        parameters: Vec<String>,
        body: Block,
    },
    Macro {
        parameters: Vec<String>,
        body: Block,
    },
    Call {
        function: Box<Expr>,
        arguments: Vec<Expr>,
    },
    Index {
        left: Box<Expr>,
        index: Box<Expr>,
    },
    Array(Vec<Expr>),
    Hash(Vec<(Expr, Expr)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixOp {
    Bang,
    Minus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfixOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    NotEq,
    Lt,
    Gt,
}

impl fmt::Display for PrefixOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrefixOp::Bang => write!(f, "!"),
            PrefixOp::Minus => write!(f, "-"),
        }
    }
}

impl fmt::Display for InfixOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            InfixOp::Add => "+",
            InfixOp::Sub => "-",
            InfixOp::Mul => "*",
            InfixOp::Div => "/",
            InfixOp::Eq => "==",
            InfixOp::NotEq => "!=",
            InfixOp::Lt => "<",
            InfixOp::Gt => ">",
        };
        write!(f, "{op}")
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for stmt in &self.statements {
            write!(f, "{stmt}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for stmt in &self.statements {
            write!(f, "{stmt}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stmt::Let { name, value } => write!(f, "let {name} = {value};"),
            Stmt::Return(value) => write!(f, "return {value};"),
            Stmt::Expr(expr) => write!(f, "{expr}"),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Integer(value) => write!(f, "{value}"),
            Expr::String(value) => write!(f, "{value}"),
            Expr::Boolean(value) => write!(f, "{value}"),
            Expr::Null => write!(f, "null"),
            Expr::Ident(name) => write!(f, "{name}"),
            Expr::Prefix { op, right } => write!(f, "({op}{right})"),
            Expr::Infix { op, left, right } => write!(f, "({left} {op} {right})"),
            Expr::If {
                condition,
                consequence,
                alternative,
            } => {
                write!(f, "if{condition} {consequence}")?;
                if let Some(alternative) = alternative {
                    write!(f, "else {alternative}")?;
                }
                Ok(())
            }
            Expr::Function {
                name,
                parameters,
                body,
            } => {
                write!(f, "fn")?;
                if let Some(name) = name {
                    write!(f, "<{name}>")?;
                }
                write!(f, "({}) {body}", parameters.join(", "))
            }
            Expr::Macro { parameters, body } => {
                write!(f, "macro({}) {body}", parameters.join(", "))
            }
            Expr::Call {
                function,
                arguments,
            } => {
                let args = arguments
                    .iter()
                    .map(|a| a.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "{function}({args})")
            }
            Expr::Index { left, index } => write!(f, "({left}[{index}])"),
            Expr::Array(elements) => {
                let elems = elements
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "[{elems}]")
            }
            Expr::Hash(pairs) => {
                let pairs = pairs
                    .iter()
                    .map(|(k, v)| format!("{k}:{v}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "{{{pairs}}}")
            }
        }
    }
}

/// Post-order rewrite of every expression in the program: children are
/// rewritten before the transform is applied to the node holding them.
/// Shared by macro expansion and unquote evaluation.
pub fn modify_program<F>(program: Program, f: &mut F) -> Program
where
    F: FnMut(Expr) -> Expr,
{
    Program {
        statements: program
            .statements
            .into_iter()
            .map(|stmt| modify_stmt(stmt, f))
            .collect(),
    }
}

pub fn modify_block<F>(block: Block, f: &mut F) -> Block
where
    F: FnMut(Expr) -> Expr,
{
    Block {
        statements: block
            .statements
            .into_iter()
            .map(|stmt| modify_stmt(stmt, f))
            .collect(),
    }
}

pub fn modify_stmt<F>(stmt: Stmt, f: &mut F) -> Stmt
where
    F: FnMut(Expr) -> Expr,
{
    match stmt {
        Stmt::Let { name, value } => Stmt::Let {
            name,
            value: modify_expr(value, f),
        },
        Stmt::Return(value) => Stmt::Return(modify_expr(value, f)),
        Stmt::Expr(expr) => Stmt::Expr(modify_expr(expr, f)),
    }
}

pub fn modify_expr<F>(expr: Expr, f: &mut F) -> Expr
where
    F: FnMut(Expr) -> Expr,
{
    let expr = match expr {
        Expr::Prefix { op, right } => Expr::Prefix {
            op,
            right: Box::new(modify_expr(*right, f)),
        },
        Expr::Infix { op, left, right } => Expr::Infix {
            op,
            left: Box::new(modify_expr(*left, f)),
            right: Box::new(modify_expr(*right, f)),
        },
        Expr::If {
            condition,
            consequence,
            alternative,
        } => Expr::If {
            condition: Box::new(modify_expr(*condition, f)),
            consequence: modify_block(consequence, f),
            alternative: alternative.map(|block| modify_block(block, f)),
        },
        Expr::Function {
            name,
            parameters,
            body,
        } => Expr::Function {
            name,
            parameters,
            body: modify_block(body, f),
        },
        Expr::Macro { parameters, body } => Expr::Macro {
            parameters,
            body: modify_block(body, f),
        },
        Expr::Call {
            function,
            arguments,
        } => Expr::Call {
            function: Box::new(modify_expr(*function, f)),
            arguments: arguments
                .into_iter()
                .map(|arg| modify_expr(arg, f))
                .collect(),
        },
        Expr::Index { left, index } => Expr::Index {
            left: Box::new(modify_expr(*left, f)),
            index: Box::new(modify_expr(*index, f)),
        },
        Expr::Array(elements) => Expr::Array(
            elements
                .into_iter()
                .map(|elem| modify_expr(elem, f))
                .collect(),
        ),
        Expr::Hash(pairs) => Expr::Hash(
            pairs
                .into_iter()
                .map(|(key, value)| (modify_expr(key, f), modify_expr(value, f)))
                .collect(),
        ),
        other => other,
    };
    f(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one() -> Expr {
        Expr::Integer(1)
    }

    fn two() -> Expr {
        Expr::Integer(2)
    }

    fn turn_one_into_two(expr: Expr) -> Expr {
        match expr {
            Expr::Integer(1) => Expr::Integer(2),
            other => other,
        }
    }

    #[test]
    fn modify_reaches_every_expression_slot() {
        let cases: Vec<(Expr, Expr)> = vec![
            (one(), two()),
            (
                Expr::Infix {
                    op: InfixOp::Add,
                    left: Box::new(one()),
                    right: Box::new(two()),
                },
                Expr::Infix {
                    op: InfixOp::Add,
                    left: Box::new(two()),
                    right: Box::new(two()),
                },
            ),
            (
                Expr::Prefix {
                    op: PrefixOp::Minus,
                    right: Box::new(one()),
                },
                Expr::Prefix {
                    op: PrefixOp::Minus,
                    right: Box::new(two()),
                },
            ),
            (
                Expr::Index {
                    left: Box::new(one()),
                    index: Box::new(one()),
                },
                Expr::Index {
                    left: Box::new(two()),
                    index: Box::new(two()),
                },
            ),
            (
                Expr::If {
                    condition: Box::new(one()),
                    consequence: Block {
                        statements: vec![Stmt::Expr(one())],
                    },
                    alternative: Some(Block {
                        statements: vec![Stmt::Expr(one())],
                    }),
                },
                Expr::If {
                    condition: Box::new(two()),
                    consequence: Block {
                        statements: vec![Stmt::Expr(two())],
                    },
                    alternative: Some(Block {
                        statements: vec![Stmt::Expr(two())],
                    }),
                },
            ),
            (
                Expr::Function {
                    name: None,
                    parameters: vec!["x".to_string()],
                    body: Block {
                        statements: vec![Stmt::Expr(one())],
                    },
                },
                Expr::Function {
                    name: None,
                    parameters: vec!["x".to_string()],
                    body: Block {
                        statements: vec![Stmt::Expr(two())],
                    },
                },
            ),
            (
                Expr::Call {
                    function: Box::new(Expr::Ident("f".to_string())),
                    arguments: vec![one(), one()],
                },
                Expr::Call {
                    function: Box::new(Expr::Ident("f".to_string())),
                    arguments: vec![two(), two()],
                },
            ),
            (
                Expr::Array(vec![one(), one()]),
                Expr::Array(vec![two(), two()]),
            ),
            (
                Expr::Hash(vec![(one(), one())]),
                Expr::Hash(vec![(two(), two())]),
            ),
        ];

        for (input, expected) in cases {
            let modified = modify_expr(input, &mut turn_one_into_two);
            assert_eq!(modified, expected);
        }
    }

    #[test]
    fn modify_rewrites_statements() {
        let program = Program {
            statements: vec![
                Stmt::Let {
                    name: "a".to_string(),
                    value: one(),
                },
                Stmt::Return(one()),
                Stmt::Expr(one()),
            ],
        };
        let modified = modify_program(program, &mut turn_one_into_two);
        assert_eq!(
            modified.statements,
            vec![
                Stmt::Let {
                    name: "a".to_string(),
                    value: two(),
                },
                Stmt::Return(two()),
                Stmt::Expr(two()),
            ]
        );
    }

    #[test]
    fn display_reprints_source_forms() {
        let expr = Expr::Infix {
            op: InfixOp::Sub,
            left: Box::new(Expr::Infix {
                op: InfixOp::Sub,
                left: Box::new(Expr::Integer(10)),
                right: Box::new(Expr::Integer(5)),
            }),
            right: Box::new(Expr::Infix {
                op: InfixOp::Add,
                left: Box::new(Expr::Integer(2)),
                right: Box::new(Expr::Integer(2)),
            }),
        };
        assert_eq!(expr.to_string(), "((10 - 5) - (2 + 2))");

        let stmt = Stmt::Let {
            name: "adder".to_string(),
            value: Expr::Function {
                name: Some("adder".to_string()),
                parameters: vec!["a".to_string(), "b".to_string()],
                body: Block {
                    statements: vec![Stmt::Expr(Expr::Infix {
                        op: InfixOp::Add,
                        left: Box::new(Expr::Ident("a".to_string())),
                        right: Box::new(Expr::Ident("b".to_string())),
                    })],
                },
            },
        };
        assert_eq!(stmt.to_string(), "let adder = fn<adder>(a, b) (a + b);");
    }
}
