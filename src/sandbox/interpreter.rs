use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::ast::*;
use super::builtins::{self, Keywords};
use super::capabilities::{self, Access};
use super::value::{ClassValue, Dict, DictKey, Instance, Value};
use crate::constants::sandbox::{DEADLINE_CHECK_INTERVAL, MAX_CALL_DEPTH, MAX_LOG_LINES};
use crate::error::{ScriptError, ScriptFault};
use crate::models::ActionType;

/// Lines written by `log()`/`print()` during one evaluation.
pub type LogBuffer = Rc<RefCell<Vec<String>>>;

type Env = HashMap<String, Value>;

/// Cooperative stop conditions, polled before every statement and loop
/// iteration.
#[derive(Clone, Debug)]
pub struct Budget {
    cancel: Arc<AtomicBool>,
    deadline: Option<Instant>,
    steps: u64,
}

impl Budget {
    pub fn new(cancel: Arc<AtomicBool>, deadline: Option<Instant>) -> Self {
        Self {
            cancel,
            deadline,
            steps: 0,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(Arc::new(AtomicBool::new(false)), None)
    }

    fn tick(&mut self) -> Result<(), ScriptError> {
        self.steps += 1;
        if self.cancel.load(Ordering::Relaxed) {
            return Err(ScriptError::Cancelled);
        }
        if self.steps % DEADLINE_CHECK_INTERVAL == 0 {
            if let Some(deadline) = self.deadline {
                if Instant::now() >= deadline {
                    self.cancel.store(true, Ordering::Relaxed);
                    return Err(ScriptError::Cancelled);
                }
            }
        }
        Ok(())
    }
}

enum Flow {
    Normal,
    Return(Value),
    Break,
    Continue,
}

struct Frame {
    name: String,
    line: usize,
    loops: usize,
}

/// Tree-walking evaluator for one loaded strategy program.
pub struct Interpreter {
    globals: HashMap<String, Value>,
    classes: Vec<Rc<ClassValue>>,
    budget: Budget,
    stack: Vec<Frame>,
    logs: LogBuffer,
}

impl Interpreter {
    pub fn new(budget: Budget, logs: LogBuffer) -> Self {
        Self {
            globals: HashMap::new(),
            classes: Vec::new(),
            budget,
            stack: Vec::new(),
            logs,
        }
    }

    /// Bind imports, functions and classes, then evaluate top-level `let`s
    /// in source order.
    pub fn load(&mut self, program: &Program) -> Result<(), ScriptFault> {
        for item in &program.items {
            match item {
                Item::Import(import) => self.bind_import(import)?,
                Item::Function(func) => {
                    self.globals
                        .insert(func.name.clone(), Value::Function(Rc::new(func.clone())));
                }
                Item::Class(class) => {
                    let value = Rc::new(ClassValue {
                        name: class.name.clone(),
                        methods: class
                            .methods
                            .iter()
                            .map(|m| (m.name.clone(), Rc::new(m.clone())))
                            .collect(),
                    });
                    self.classes.push(value.clone());
                    self.globals.insert(class.name.clone(), Value::Class(value));
                }
                Item::Let { .. } => {}
            }
        }

        self.push_frame("<module>".to_string(), 0);
        let result = self.load_constants(program);
        self.stack.pop();
        result
    }

    fn load_constants(&mut self, program: &Program) -> Result<(), ScriptFault> {
        for item in &program.items {
            if let Item::Let { name, value, line } = item {
                self.set_line(*line);
                let mut env = Env::new();
                let value = self.eval(value, &mut env)?;
                self.globals.insert(name.clone(), value);
            }
        }
        Ok(())
    }

    fn bind_import(&mut self, import: &Import) -> Result<(), ScriptFault> {
        let module = match capabilities::module_access(&import.module) {
            Access::Allowed => capabilities::ALLOWED_MODULES
                .iter()
                .copied()
                .find(|m| *m == import.module),
            Access::Forbidden(_) | Access::Unknown => None,
        };
        let Some(module) = module else {
            return Err(self.fault(ScriptError::Unavailable(import.module.clone()), import.line));
        };

        if import.names.is_empty() {
            let name = import.alias.clone().unwrap_or_else(|| import.module.clone());
            self.globals.insert(name, Value::Module(module));
            return Ok(());
        }
        for name in &import.names {
            let Some(value) = builtins::module_attribute(module, name) else {
                return Err(self.fault(
                    ScriptError::NoAttribute {
                        type_name: "module".to_string(),
                        attr: name.clone(),
                    },
                    import.line,
                ));
            };
            self.globals.insert(name.clone(), value);
        }
        Ok(())
    }

    /// First user class exposing `should_trade`, in declaration order.
    pub fn strategy_class(&self) -> Option<Rc<ClassValue>> {
        self.classes
            .iter()
            .find(|c| !capabilities::is_vocabulary_type(&c.name) && c.methods.contains_key("should_trade"))
            .cloned()
    }

    pub fn instantiate(&self, class: &Rc<ClassValue>) -> Rc<Instance> {
        Rc::new(Instance::new(class.clone()))
    }

    /// Call `instance.name(args...)`; `Ok(None)` when the class has no such
    /// method.
    pub fn call_method(
        &mut self,
        instance: &Rc<Instance>,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>, ScriptFault> {
        let Some(method) = instance.class.methods.get(name).cloned() else {
            return Ok(None);
        };
        let qualname = format!("{}.{}", instance.class.name, name);
        let line = method.line;
        self.call_function(
            &method,
            Some(Value::Instance(instance.clone())),
            qualname,
            args,
            Vec::new(),
            line,
        )
        .map(Some)
    }

    // -----------------------------------------------------------------------
    // faults and frames
    // -----------------------------------------------------------------------

    fn fault(&self, error: ScriptError, line: usize) -> ScriptFault {
        let mut fault = ScriptFault::new(error, line);
        fault.trace = self
            .stack
            .iter()
            .map(|frame| format!("in {} (line {})", frame.name, frame.line))
            .collect();
        fault
    }

    fn push_frame(&mut self, name: String, line: usize) {
        self.stack.push(Frame {
            name,
            line,
            loops: 0,
        });
    }

    fn set_line(&mut self, line: usize) {
        if let Some(frame) = self.stack.last_mut() {
            frame.line = line;
        }
    }

    fn tick(&mut self, line: usize) -> Result<(), ScriptFault> {
        self.budget.tick().map_err(|e| self.fault(e, line))
    }

    fn in_loop(&self) -> bool {
        self.stack.last().is_some_and(|frame| frame.loops > 0)
    }

    fn adjust_loops(&mut self, entering: bool) {
        if let Some(frame) = self.stack.last_mut() {
            if entering {
                frame.loops += 1;
            } else {
                frame.loops = frame.loops.saturating_sub(1);
            }
        }
    }

    fn push_log(&self, line: String) {
        let mut logs = self.logs.borrow_mut();
        if logs.len() < MAX_LOG_LINES {
            logs.push(line);
        } else if logs.len() == MAX_LOG_LINES {
            logs.push("[log truncated]".to_string());
        }
    }

    // -----------------------------------------------------------------------
    // calls
    // -----------------------------------------------------------------------

    fn call_function(
        &mut self,
        func: &Rc<FunctionDef>,
        receiver: Option<Value>,
        qualname: String,
        args: Vec<Value>,
        keywords: Keywords,
        line: usize,
    ) -> Result<Value, ScriptFault> {
        if self.stack.len() >= MAX_CALL_DEPTH {
            return Err(self.fault(ScriptError::RecursionLimit(MAX_CALL_DEPTH), line));
        }
        self.tick(line)?;

        let mut positional = args;
        if let Some(receiver) = receiver {
            positional.insert(0, receiver);
        }
        let params: Vec<&str> = func.params.iter().map(String::as_str).collect();
        let slots = builtins::bind_arguments(&func.name, &params, params.len(), positional, keywords)
            .map_err(|e| self.fault(e, line))?;
        let mut env: Env = func
            .params
            .iter()
            .cloned()
            .zip(slots.into_iter().map(|v| v.unwrap_or(Value::None)))
            .collect();

        self.push_frame(qualname, func.line);
        let result = self.exec_block(&func.body, &mut env);
        self.stack.pop();

        match result? {
            Flow::Return(value) => Ok(value),
            Flow::Normal | Flow::Break | Flow::Continue => Ok(Value::None),
        }
    }

    fn call_value(
        &mut self,
        callee: Value,
        args: Vec<Value>,
        keywords: Keywords,
        line: usize,
    ) -> Result<Value, ScriptFault> {
        match callee {
            Value::Function(func) => {
                let qualname = func.name.clone();
                self.call_function(&func, None, qualname, args, keywords, line)
            }
            Value::BoundMethod { receiver, method } => {
                let qualname = format!("{}.{}", receiver.class.name, method.name);
                self.call_function(
                    &method,
                    Some(Value::Instance(receiver)),
                    qualname,
                    args,
                    keywords,
                    line,
                )
            }
            Value::Class(class) => {
                let instance = self.instantiate(&class);
                match class.methods.get("init").cloned() {
                    Some(init) => {
                        let qualname = format!("{}.init", class.name);
                        self.call_function(
                            &init,
                            Some(Value::Instance(instance.clone())),
                            qualname,
                            args,
                            keywords,
                            line,
                        )?;
                    }
                    None if !args.is_empty() || !keywords.is_empty() => {
                        return Err(self.fault(
                            ScriptError::bad_args(&class.name, "takes no arguments"),
                            line,
                        ));
                    }
                    None => {}
                }
                Ok(Value::Instance(instance))
            }
            Value::Builtin(name) if name == "print" || name == "log" => {
                let text = args
                    .iter()
                    .map(Value::to_string)
                    .collect::<Vec<_>>()
                    .join(" ");
                self.push_log(text);
                Ok(Value::None)
            }
            Value::Builtin(name) => {
                builtins::call_builtin(name, args, keywords).map_err(|e| self.fault(e, line))
            }
            Value::MathFunction(name) => {
                builtins::call_math(name, args, keywords).map_err(|e| self.fault(e, line))
            }
            Value::Vocabulary("Decision") => {
                builtins::make_decision(args, keywords).map_err(|e| self.fault(e, line))
            }
            Value::BoundNative { receiver, method } => {
                builtins::call_native(&receiver, method, args, keywords)
                    .map_err(|e| self.fault(e, line))
            }
            other => Err(self.fault(ScriptError::NotCallable(other.type_name()), line)),
        }
    }

    // -----------------------------------------------------------------------
    // statements
    // -----------------------------------------------------------------------

    fn exec_block(&mut self, body: &[Stmt], env: &mut Env) -> Result<Flow, ScriptFault> {
        for stmt in body {
            match self.exec_stmt(stmt, env)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt, env: &mut Env) -> Result<Flow, ScriptFault> {
        self.set_line(stmt.line);
        self.tick(stmt.line)?;

        match &stmt.kind {
            StmtKind::Let { name, value } => {
                let value = self.eval(value, env)?;
                env.insert(name.clone(), value);
            }
            StmtKind::Assign { target, op, value } => self.assign(target, *op, value, env)?,
            StmtKind::Expr(expr) => {
                self.eval(expr, env)?;
            }
            StmtKind::If {
                branches,
                otherwise,
            } => {
                for (condition, body) in branches {
                    if self.eval(condition, env)?.truthy() {
                        return self.exec_block(body, env);
                    }
                }
                if let Some(body) = otherwise {
                    return self.exec_block(body, env);
                }
            }
            StmtKind::While { condition, body } => {
                self.adjust_loops(true);
                let result = self.run_while(condition, body, env, stmt.line);
                self.adjust_loops(false);
                return result;
            }
            StmtKind::For { vars, iter, body } => {
                self.adjust_loops(true);
                let result = self.run_for(vars, iter, body, env, stmt.line);
                self.adjust_loops(false);
                return result;
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, env)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::Break | StmtKind::Continue => {
                let keyword = if matches!(stmt.kind, StmtKind::Break) {
                    "break"
                } else {
                    "continue"
                };
                if !self.in_loop() {
                    return Err(self.fault(
                        ScriptError::LoopControlOutsideLoop(keyword.to_string()),
                        stmt.line,
                    ));
                }
                return Ok(if keyword == "break" {
                    Flow::Break
                } else {
                    Flow::Continue
                });
            }
        }
        Ok(Flow::Normal)
    }

    fn run_while(
        &mut self,
        condition: &Expr,
        body: &[Stmt],
        env: &mut Env,
        line: usize,
    ) -> Result<Flow, ScriptFault> {
        loop {
            self.tick(line)?;
            if !self.eval(condition, env)?.truthy() {
                return Ok(Flow::Normal);
            }
            match self.exec_block(body, env)? {
                Flow::Break => return Ok(Flow::Normal),
                Flow::Return(value) => return Ok(Flow::Return(value)),
                Flow::Normal | Flow::Continue => {}
            }
        }
    }

    fn run_for(
        &mut self,
        vars: &[String],
        iter: &Expr,
        body: &[Stmt],
        env: &mut Env,
        line: usize,
    ) -> Result<Flow, ScriptFault> {
        let items = self
            .eval(iter, env)?
            .iter_items()
            .map_err(|e| self.fault(e, iter.line))?;
        for item in items {
            self.tick(line)?;
            self.bind_loop_vars(vars, item, env, line)?;
            match self.exec_block(body, env)? {
                Flow::Break => break,
                Flow::Return(value) => return Ok(Flow::Return(value)),
                Flow::Normal | Flow::Continue => {}
            }
        }
        Ok(Flow::Normal)
    }

    fn bind_loop_vars(
        &self,
        vars: &[String],
        item: Value,
        env: &mut Env,
        line: usize,
    ) -> Result<(), ScriptFault> {
        if let [var] = vars {
            env.insert(var.clone(), item);
            return Ok(());
        }
        let parts = match &item {
            Value::List(parts) if parts.borrow().len() == vars.len() => parts.borrow().clone(),
            other => {
                return Err(self.fault(
                    ScriptError::type_mismatch(format!(
                        "cannot unpack {} into {} variables",
                        other.repr(),
                        vars.len()
                    )),
                    line,
                ))
            }
        };
        for (var, part) in vars.iter().zip(parts) {
            env.insert(var.clone(), part);
        }
        Ok(())
    }

    fn assign(
        &mut self,
        target: &Expr,
        op: Option<BinaryOp>,
        value: &Expr,
        env: &mut Env,
    ) -> Result<(), ScriptFault> {
        let line = target.line;
        match &target.kind {
            ExprKind::Name(name) => {
                let Some(current) = env.get(name).cloned() else {
                    return Err(self.fault(ScriptError::UndeclaredAssignment(name.clone()), line));
                };
                let rhs = self.eval(value, env)?;
                let new = match op {
                    Some(op) => builtins::binary(op, &current, &rhs).map_err(|e| self.fault(e, line))?,
                    None => rhs,
                };
                env.insert(name.clone(), new);
            }
            ExprKind::Attribute { object, name } => {
                let object = self.eval(object, env)?;
                let rhs = self.eval(value, env)?;
                let new = match op {
                    Some(op) => {
                        let current = self.get_attribute(&object, name).map_err(|e| self.fault(e, line))?;
                        builtins::binary(op, &current, &rhs).map_err(|e| self.fault(e, line))?
                    }
                    None => rhs,
                };
                self.set_attribute(&object, name, new)
                    .map_err(|e| self.fault(e, line))?;
            }
            ExprKind::Index { object, index } => {
                let object = self.eval(object, env)?;
                let index = self.eval(index, env)?;
                let rhs = self.eval(value, env)?;
                let new = match op {
                    Some(op) => {
                        let current =
                            builtins::index_value(&object, &index).map_err(|e| self.fault(e, line))?;
                        builtins::binary(op, &current, &rhs).map_err(|e| self.fault(e, line))?
                    }
                    None => rhs,
                };
                builtins::set_index(&object, &index, new).map_err(|e| self.fault(e, line))?;
            }
            _ => {
                return Err(self.fault(
                    ScriptError::type_mismatch("invalid assignment target"),
                    line,
                ))
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // expressions
    // -----------------------------------------------------------------------

    fn eval(&mut self, expr: &Expr, env: &mut Env) -> Result<Value, ScriptFault> {
        let line = expr.line;
        match &expr.kind {
            ExprKind::Literal(literal) => Ok(match literal {
                Literal::None => Value::None,
                Literal::Bool(b) => Value::Bool(*b),
                Literal::Int(i) => Value::Int(*i),
                Literal::Float(f) => Value::Float(*f),
                Literal::Str(s) => Value::str(s),
            }),
            ExprKind::Name(name) => self.lookup(name, env).map_err(|e| self.fault(e, line)),
            ExprKind::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item, env)?);
                }
                Ok(Value::list(values))
            }
            ExprKind::Dict(entries) => {
                let mut dict = Dict::new();
                for (key, value) in entries {
                    let key = self.eval(key, env)?;
                    let key = DictKey::from_value(&key).map_err(|e| self.fault(e, line))?;
                    let value = self.eval(value, env)?;
                    dict.insert(key, value);
                }
                Ok(Value::dict(dict))
            }
            ExprKind::Unary { op, operand } => {
                let value = self.eval(operand, env)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
                    UnaryOp::Neg => builtins::negate(&value).map_err(|e| self.fault(e, line)),
                }
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let lhs = self.eval(lhs, env)?;
                let rhs = self.eval(rhs, env)?;
                builtins::binary(*op, &lhs, &rhs).map_err(|e| self.fault(e, line))
            }
            ExprKind::Logical { op, lhs, rhs } => {
                let lhs = self.eval(lhs, env)?;
                match (op, lhs.truthy()) {
                    (LogicalOp::And, false) | (LogicalOp::Or, true) => Ok(lhs),
                    _ => self.eval(rhs, env),
                }
            }
            ExprKind::Attribute { object, name } => {
                let object = self.eval(object, env)?;
                self.get_attribute(&object, name).map_err(|e| self.fault(e, line))
            }
            ExprKind::Index { object, index } => {
                let object = self.eval(object, env)?;
                let index = self.eval(index, env)?;
                builtins::index_value(&object, &index).map_err(|e| self.fault(e, line))
            }
            ExprKind::Call { callee, args } => {
                let callee = self.eval(callee, env)?;
                let mut positional = Vec::new();
                let mut keywords = Vec::new();
                for arg in args {
                    let value = self.eval(&arg.value, env)?;
                    match &arg.name {
                        Some(name) => keywords.push((name.clone(), value)),
                        None => positional.push(value),
                    }
                }
                self.call_value(callee, positional, keywords, line)
            }
        }
    }

    /// Locals, then module globals, then the capability table's builtins and
    /// vocabulary. Forbidden names never resolve.
    fn lookup(&self, name: &str, env: &Env) -> Result<Value, ScriptError> {
        if let Some(value) = env.get(name).or_else(|| self.globals.get(name)) {
            return Ok(value.clone());
        }
        if capabilities::function_access(name) == Access::Allowed {
            if let Some(builtin) = capabilities::BUILTIN_FUNCTIONS
                .iter()
                .copied()
                .find(|b| *b == name)
            {
                return Ok(Value::Builtin(builtin));
            }
        }
        if let Some(vocabulary) = capabilities::VOCABULARY_TYPES
            .iter()
            .copied()
            .find(|t| *t == name)
        {
            return Ok(Value::Vocabulary(vocabulary));
        }
        Err(ScriptError::UndefinedName(name.to_string()))
    }

    fn get_attribute(&self, object: &Value, name: &str) -> Result<Value, ScriptError> {
        let found = match object {
            Value::Instance(instance) => {
                let field = instance.fields.borrow().get(name).cloned();
                field.or_else(|| {
                    instance.class.methods.get(name).map(|method| Value::BoundMethod {
                        receiver: instance.clone(),
                        method: method.clone(),
                    })
                })
            }
            Value::Module(module) => builtins::module_attribute(module, name),
            Value::Vocabulary("ActionType") => ActionType::ALL
                .iter()
                .find(|action| action.as_str().eq_ignore_ascii_case(name))
                .map(|action| Value::str(action.as_str())),
            Value::Decision(decision) => builtins::decision_field(&decision.borrow(), name),
            Value::Snapshot(snapshot) => builtins::snapshot_attribute(snapshot, name),
            Value::Record(record) => record.attribute(name),
            _ => None,
        };
        if let Some(value) = found {
            return Ok(value);
        }
        if let Some(method) = builtins::native_method(object, name) {
            return Ok(Value::BoundNative {
                receiver: Box::new(object.clone()),
                method,
            });
        }
        Err(ScriptError::NoAttribute {
            type_name: object.type_name(),
            attr: name.to_string(),
        })
    }

    fn set_attribute(&self, object: &Value, name: &str, value: Value) -> Result<(), ScriptError> {
        match object {
            Value::Instance(instance) => {
                instance.fields.borrow_mut().insert(name.to_string(), value);
                Ok(())
            }
            Value::Decision(decision) => {
                if builtins::set_decision_field(&mut decision.borrow_mut(), name, value)? {
                    Ok(())
                } else {
                    Err(ScriptError::NoAttribute {
                        type_name: "Decision".to_string(),
                        attr: name.to_string(),
                    })
                }
            }
            other => Err(ScriptError::ReadOnlyAttribute {
                type_name: other.type_name(),
                attr: name.to_string(),
            }),
        }
    }
}
