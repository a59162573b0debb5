//! Syntax tree of a strategy program.

#[derive(Clone, Debug, PartialEq)]
pub struct Program {
    pub items: Vec<Item>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Item {
    Import(Import),
    Class(ClassDef),
    Function(FunctionDef),
    Let { name: String, value: Expr, line: usize },
}

/// `import a.b as c;` or `from a import x, y;`
#[derive(Clone, Debug, PartialEq)]
pub struct Import {
    pub module: String,
    pub alias: Option<String>,
    pub names: Vec<String>,
    pub line: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClassDef {
    pub name: String,
    pub methods: Vec<FunctionDef>,
    pub line: usize,
}

impl ClassDef {
    pub fn method(&self, name: &str) -> Option<&FunctionDef> {
        self.methods.iter().find(|m| m.name == name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
    pub line: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub line: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StmtKind {
    Let {
        name: String,
        value: Expr,
    },
    Assign {
        target: Expr,
        op: Option<BinaryOp>,
        value: Expr,
    },
    Expr(Expr),
    If {
        branches: Vec<(Expr, Vec<Stmt>)>,
        otherwise: Option<Vec<Stmt>>,
    },
    While {
        condition: Expr,
        body: Vec<Stmt>,
    },
    For {
        vars: Vec<String>,
        iter: Expr,
        body: Vec<Stmt>,
    },
    Return(Option<Expr>),
    Break,
    Continue,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub line: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    Literal(Literal),
    Name(String),
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Attribute {
        object: Box<Expr>,
        name: String,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Arg>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Arg {
    pub name: Option<String>,
    pub value: Expr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    In,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::In => "in",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

/// Depth-first walk over every expression in a program.
///
/// The validator uses this to inspect calls and attribute names without
/// caring about the statement structure around them.
pub fn walk_exprs<'a>(program: &'a Program, visit: &mut dyn FnMut(&'a Expr)) {
    for item in &program.items {
        match item {
            Item::Import(_) => {}
            Item::Let { value, .. } => walk_expr(value, visit),
            Item::Function(func) => walk_block(&func.body, visit),
            Item::Class(class) => {
                for method in &class.methods {
                    walk_block(&method.body, visit);
                }
            }
        }
    }
}

fn walk_block<'a>(body: &'a [Stmt], visit: &mut dyn FnMut(&'a Expr)) {
    for stmt in body {
        match &stmt.kind {
            StmtKind::Let { value, .. } => walk_expr(value, visit),
            StmtKind::Assign { target, value, .. } => {
                walk_expr(target, visit);
                walk_expr(value, visit);
            }
            StmtKind::Expr(expr) => walk_expr(expr, visit),
            StmtKind::If {
                branches,
                otherwise,
            } => {
                for (condition, block) in branches {
                    walk_expr(condition, visit);
                    walk_block(block, visit);
                }
                if let Some(block) = otherwise {
                    walk_block(block, visit);
                }
            }
            StmtKind::While { condition, body } => {
                walk_expr(condition, visit);
                walk_block(body, visit);
            }
            StmtKind::For { iter, body, .. } => {
                walk_expr(iter, visit);
                walk_block(body, visit);
            }
            StmtKind::Return(Some(expr)) => walk_expr(expr, visit),
            StmtKind::Return(None) | StmtKind::Break | StmtKind::Continue => {}
        }
    }
}

fn walk_expr<'a>(expr: &'a Expr, visit: &mut dyn FnMut(&'a Expr)) {
    visit(expr);
    match &expr.kind {
        ExprKind::Literal(_) | ExprKind::Name(_) => {}
        ExprKind::List(items) => {
            for item in items {
                walk_expr(item, visit);
            }
        }
        ExprKind::Dict(entries) => {
            for (key, value) in entries {
                walk_expr(key, visit);
                walk_expr(value, visit);
            }
        }
        ExprKind::Unary { operand, .. } => walk_expr(operand, visit),
        ExprKind::Binary { lhs, rhs, .. } | ExprKind::Logical { lhs, rhs, .. } => {
            walk_expr(lhs, visit);
            walk_expr(rhs, visit);
        }
        ExprKind::Attribute { object, .. } => walk_expr(object, visit),
        ExprKind::Index { object, index } => {
            walk_expr(object, visit);
            walk_expr(index, visit);
        }
        ExprKind::Call { callee, args } => {
            walk_expr(callee, visit);
            for arg in args {
                walk_expr(&arg.value, visit);
            }
        }
    }
}
