/*!
 * Interpreter
 *
 * Tree-walking evaluator for the script subset. Every statement, loop
 * iteration, call and timer wait goes through `tick`, which polls the
 * unit's control block, so a halt takes effect within one step.
 */

use super::ast::*;
use super::builtins::is_method_of;
use super::heap::{
    array_bytes, closure_bytes, object_bytes, string_bytes, Charge, Collector, HeapExhausted,
    HeapMeter,
};
use super::value::*;
use crate::core::limits::{
    CPU_PUBLISH_INTERVAL, MAX_CALL_DEPTH, MAX_PENDING_TIMERS, TIMER_WAIT_SLICE_MS,
};
use crate::monitoring::probe::ThreadCpuClock;
use crate::process::context::UnitContext;
use crate::process::control::TerminationReason;
use crate::security::{CapabilityDenied, Severity};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Why evaluation stopped early
#[derive(Debug)]
pub enum RuntimeError {
    /// Script exception, catchable by `try`
    Thrown(Value),
    /// The control block was halted; not catchable
    Halted(TerminationReason),
    /// Allocation refused at the hard stop; not catchable
    HeapExhausted(HeapExhausted),
}

impl From<HeapExhausted> for RuntimeError {
    fn from(err: HeapExhausted) -> Self {
        RuntimeError::HeapExhausted(err)
    }
}

pub(super) type Eval<T> = Result<T, RuntimeError>;

/// Statement completion
enum Flow {
    Normal,
    Return(Value),
    Break,
    Continue,
}

#[derive(Clone, Copy)]
enum Binder {
    Var,
    Let,
    Const,
    Assign,
}

/// Assignment target resolved once for read-modify-write
enum Place {
    Name(Ident),
    Member(Value, Ident),
    Index(Value, Value),
}

struct Timer {
    id: u64,
    due: Instant,
    seq: u64,
    callback: Value,
    args: Vec<Value>,
    repeat: Option<Duration>,
}

pub struct Interpreter {
    pub(super) ctx: UnitContext,
    pub(super) meter: Arc<HeapMeter>,
    pub(super) collector: Collector,
    globals: Rc<Scope>,
    depth: usize,
    steps: u64,
    line: u32,
    throw_line: Option<u32>,
    cpu: ThreadCpuClock,
    pub(super) started: Instant,
    timers: Vec<Timer>,
    next_timer_id: u64,
    timer_seq: u64,
    running_timer: Option<u64>,
    running_cleared: bool,
    pub(super) rng: u64,
}

impl Interpreter {
    /// Must be created on the thread that will run the script
    pub fn new(ctx: UnitContext) -> Self {
        let meter = ctx.control.heap().clone();
        let globals = Scope::new(None, true);
        install_globals(&globals);
        let seed = uuid::Uuid::new_v4().as_u128() as u64;
        Self {
            ctx,
            meter,
            collector: Collector::default(),
            globals,
            depth: 0,
            steps: 0,
            line: 0,
            throw_line: None,
            cpu: ThreadCpuClock::start(),
            started: Instant::now(),
            timers: Vec::new(),
            next_timer_id: 1,
            timer_seq: 0,
            running_timer: None,
            running_cleared: false,
            rng: seed | 1,
        }
    }

    /// Run a program to completion, including every timer it schedules
    pub fn run(&mut self, program: &Program) -> Result<(), RuntimeError> {
        let globals = self.globals.clone();
        hoist_vars(&program.body, &globals);
        self.hoist_functions(&program.body, &globals)?;
        let result = self
            .exec_stmts(&program.body, &globals)
            .and_then(|_| self.run_timers());
        self.publish_cpu();
        debug!(
            execution_id = %self.ctx.execution_id,
            steps = self.steps,
            "Script finished"
        );
        result
    }

    /// Message for an exception nothing caught
    pub fn describe_uncaught(&self, value: &Value) -> String {
        let text = match value {
            Value::Str(s) => s.as_str().to_string(),
            Value::Object(o) if o.tag() == ObjectTag::Error => value.to_display(),
            other => self.inspect(other),
        };
        match self.throw_line {
            Some(line) => format!("Uncaught {} (line {})", text, line),
            None => format!("Uncaught {}", text),
        }
    }

    /// Break every reference cycle so all heap charges are released
    pub fn teardown(mut self) {
        self.timers.clear();
        self.collector.teardown();
    }

    /// CPU time consumed on the unit thread so far
    pub fn cpu_time(&self) -> Duration {
        self.cpu.elapsed()
    }

    // =========================================================================
    // Stepping
    // =========================================================================

    #[inline]
    pub(super) fn tick(&mut self) -> Eval<()> {
        self.steps = self.steps.wrapping_add(1);
        if let Some(reason) = self.ctx.control.halt_reason() {
            return Err(RuntimeError::Halted(reason));
        }
        if self.steps % CPU_PUBLISH_INTERVAL == 0 {
            self.publish_cpu();
            if self.ctx.control.take_reclaim_request() {
                self.collector.compact();
                debug!(execution_id = %self.ctx.execution_id, "Reclaim request honoured");
            }
        }
        Ok(())
    }

    fn publish_cpu(&self) {
        self.ctx.control.publish_cpu_time(self.cpu.elapsed());
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    pub(super) fn alloc_str(&self, text: String) -> Eval<Value> {
        let charge = Charge::heap(&self.meter, string_bytes(text.len()))?;
        Ok(Value::Str(Rc::new(StrCell::new(text, charge))))
    }

    /// Charge `len` bytes before building a string whose size the script controls
    pub(super) fn alloc_str_sized(&self, len: usize, build: impl FnOnce() -> String) -> Eval<Value> {
        let charge = Charge::heap(&self.meter, string_bytes(len))?;
        let text = build();
        charge.resize(string_bytes(text.len()))?;
        Ok(Value::Str(Rc::new(StrCell::new(text, charge))))
    }

    pub(super) fn new_array(&self, items: Vec<Value>) -> Eval<Rc<ArrayCell>> {
        let charge = Charge::heap(&self.meter, array_bytes(items.len()))?;
        let array = Rc::new(ArrayCell::new(items, charge));
        self.collector.track_array(&array);
        Ok(array)
    }

    pub(super) fn alloc_array(&self, items: Vec<Value>) -> Eval<Value> {
        self.new_array(items).map(Value::Array)
    }

    /// `len` holes, charged before the backing vector exists
    pub(super) fn alloc_array_len(&self, len: usize) -> Eval<Value> {
        let charge = Charge::heap(&self.meter, array_bytes(len))?;
        let array = Rc::new(ArrayCell::new(vec![Value::Undefined; len], charge));
        self.collector.track_array(&array);
        Ok(Value::Array(array))
    }

    pub(super) fn new_object(
        &self,
        entries: Vec<(Rc<str>, Value)>,
        tag: ObjectTag,
    ) -> Eval<Rc<ObjectCell>> {
        let charge = Charge::heap(&self.meter, object_bytes(&entries))?;
        let object = Rc::new(ObjectCell::new(entries, tag, charge));
        self.collector.track_object(&object);
        Ok(object)
    }

    pub(super) fn alloc_object(&self, entries: Vec<(Rc<str>, Value)>) -> Eval<Value> {
        self.new_object(entries, ObjectTag::Plain).map(Value::Object)
    }

    /// Buffers are charged as external memory
    pub(super) fn alloc_bytes(&self, data: Vec<u8>) -> Eval<Value> {
        let charge = Charge::external(&self.meter, data.len() as u64)?;
        Ok(Value::Bytes(Rc::new(BytesCell::new(data, charge))))
    }

    pub(super) fn alloc_bytes_zeroed(&self, len: usize) -> Eval<Value> {
        let charge = Charge::external(&self.meter, len as u64)?;
        Ok(Value::Bytes(Rc::new(BytesCell::new(vec![0; len], charge))))
    }

    fn alloc_closure(&self, def: &Rc<FunctionDef>, env: &Rc<Scope>) -> Eval<Value> {
        let charge = Charge::heap(&self.meter, closure_bytes())?;
        let closure = Rc::new(Closure::new(def.clone(), env.clone(), charge));
        self.collector.track_closure(&closure);
        Ok(Value::Function(closure))
    }

    // =========================================================================
    // Exceptions
    // =========================================================================

    pub(super) fn make_error(&self, name: &str, message: &str) -> Eval<Value> {
        let stack = format!("{}: {}\n    at <sandbox>:{}", name, message, self.line);
        let entries = vec![
            (Rc::from("name"), self.alloc_str(name.to_string())?),
            (Rc::from("message"), self.alloc_str(message.to_string())?),
            (Rc::from("stack"), self.alloc_str(stack)?),
        ];
        self.new_object(entries, ObjectTag::Error).map(Value::Object)
    }

    pub(super) fn throw(&self, name: &str, message: impl AsRef<str>) -> RuntimeError {
        match self.make_error(name, message.as_ref()) {
            Ok(value) => RuntimeError::Thrown(value),
            Err(err) => err,
        }
    }

    pub(super) fn type_error(&self, message: impl AsRef<str>) -> RuntimeError {
        self.throw("TypeError", message)
    }

    pub(super) fn range_error(&self, message: impl AsRef<str>) -> RuntimeError {
        self.throw("RangeError", message)
    }

    /// Turn a gate refusal into a script error, or a halt when critical
    pub(super) fn denied(&self, denial: CapabilityDenied) -> RuntimeError {
        if denial.severity() == Severity::Critical {
            return self.halt_for_policy(&denial.to_string());
        }
        self.throw("Error", denial.to_string())
    }

    pub(super) fn halt_for_policy(&self, why: &str) -> RuntimeError {
        self.ctx.control.halt(TerminationReason::PolicyViolation);
        warn!(execution_id = %self.ctx.execution_id, "Halting unit: {}", why);
        RuntimeError::Halted(
            self.ctx
                .control
                .halt_reason()
                .unwrap_or(TerminationReason::PolicyViolation),
        )
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn exec_stmts(&mut self, stmts: &[Stmt], scope: &Rc<Scope>) -> Eval<Flow> {
        for stmt in stmts {
            match self.exec(stmt, scope)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_block(&mut self, stmts: &[Stmt], scope: &Rc<Scope>) -> Eval<Flow> {
        if !needs_scope(stmts) {
            return self.exec_stmts(stmts, scope);
        }
        let inner = Scope::new(Some(scope.clone()), false);
        self.hoist_functions(stmts, &inner)?;
        self.exec_stmts(stmts, &inner)
    }

    fn hoist_functions(&mut self, stmts: &[Stmt], scope: &Rc<Scope>) -> Eval<()> {
        for stmt in stmts {
            if let StmtKind::Function(def) = &stmt.kind {
                if let Some(name) = &def.name {
                    let function = self.alloc_closure(def, scope)?;
                    scope.declare(name.clone(), function, true);
                }
            }
        }
        Ok(())
    }

    fn exec(&mut self, stmt: &Stmt, scope: &Rc<Scope>) -> Eval<Flow> {
        self.tick()?;
        self.line = stmt.line;
        let result = self.exec_kind(&stmt.kind, scope);
        if matches!(result, Err(RuntimeError::Thrown(_))) && self.throw_line.is_none() {
            self.throw_line = Some(stmt.line);
        }
        result
    }

    fn exec_kind(&mut self, kind: &StmtKind, scope: &Rc<Scope>) -> Eval<Flow> {
        match kind {
            StmtKind::Expr(expr) => {
                self.eval(expr, scope)?;
                Ok(Flow::Normal)
            }
            StmtKind::Decl(kind, declarators) => {
                for declarator in declarators {
                    let value = match &declarator.init {
                        Some(init) => self.eval(init, scope)?,
                        // Hoisting already created the binding
                        None if *kind == DeclKind::Var => continue,
                        None => Value::Undefined,
                    };
                    let binder = match kind {
                        DeclKind::Var => Binder::Var,
                        DeclKind::Let => Binder::Let,
                        DeclKind::Const => Binder::Const,
                    };
                    self.bind_pattern(&declarator.target, value, scope, binder)?;
                }
                Ok(Flow::Normal)
            }
            StmtKind::Function(_) => Ok(Flow::Normal),
            StmtKind::Return(expr) => {
                let value = match expr {
                    Some(expr) => self.eval(expr, scope)?,
                    None => Value::Undefined,
                };
                Ok(Flow::Return(value))
            }
            StmtKind::If(test, consequent, alternate) => {
                if self.eval(test, scope)?.truthy() {
                    self.exec(consequent, scope)
                } else if let Some(alternate) = alternate {
                    self.exec(alternate, scope)
                } else {
                    Ok(Flow::Normal)
                }
            }
            StmtKind::While(test, body) => {
                loop {
                    self.tick()?;
                    if !self.eval(test, scope)?.truthy() {
                        break;
                    }
                    match self.exec(body, scope)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::DoWhile(body, test) => {
                loop {
                    self.tick()?;
                    match self.exec(body, scope)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    if !self.eval(test, scope)?.truthy() {
                        break;
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::For {
                init,
                test,
                update,
                body,
            } => self.exec_for(init.as_deref(), test.as_ref(), update.as_ref(), body, scope),
            StmtKind::ForOf {
                decl,
                target,
                iterable,
                body,
            } => {
                let iterable = self.eval(iterable, scope)?;
                if let Value::Array(array) = &iterable {
                    // Arrays are read live so pushes during the loop are visited
                    let mut index = 0;
                    while index < array.len() {
                        let item = array.get(index);
                        index += 1;
                        match self.exec_each(*decl, target, item, body, scope)? {
                            Flow::Break => break,
                            Flow::Return(value) => return Ok(Flow::Return(value)),
                            Flow::Normal | Flow::Continue => {}
                        }
                    }
                    return Ok(Flow::Normal);
                }
                for item in self.iterate(&iterable)? {
                    match self.exec_each(*decl, target, item, body, scope)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::ForIn {
                decl,
                target,
                object,
                body,
            } => {
                let object = self.eval(object, scope)?;
                for key in self.enumerate_keys(&object)? {
                    let key = self.alloc_str(key.to_string())?;
                    match self.exec_each(*decl, target, key, body, scope)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::Switch {
                discriminant,
                cases,
            } => self.exec_switch(discriminant, cases, scope),
            StmtKind::Break => Ok(Flow::Break),
            StmtKind::Continue => Ok(Flow::Continue),
            StmtKind::Throw(expr) => {
                let value = self.eval(expr, scope)?;
                Err(RuntimeError::Thrown(value))
            }
            StmtKind::Try {
                block,
                param,
                handler,
                finalizer,
            } => {
                let mut result = self.exec_block(block, scope);
                if let Some(handler) = handler {
                    if let Err(RuntimeError::Thrown(thrown)) = result {
                        self.throw_line = None;
                        result = self.exec_handler(param.as_ref(), thrown, handler, scope);
                    }
                }
                if let Some(finalizer) = finalizer {
                    if matches!(
                        result,
                        Err(RuntimeError::Halted(_)) | Err(RuntimeError::HeapExhausted(_))
                    ) {
                        return result;
                    }
                    match self.exec_block(finalizer, scope)? {
                        Flow::Normal => {}
                        flow => return Ok(flow),
                    }
                }
                result
            }
            StmtKind::Block(stmts) => self.exec_block(stmts, scope),
            StmtKind::Empty => Ok(Flow::Normal),
        }
    }

    fn exec_for(
        &mut self,
        init: Option<&Stmt>,
        test: Option<&Expr>,
        update: Option<&Expr>,
        body: &Stmt,
        scope: &Rc<Scope>,
    ) -> Eval<Flow> {
        // Lexical loop variables get a fresh binding per iteration so
        // closures capture the value of their own iteration
        let per_iteration = matches!(
            init.map(|s| &s.kind),
            Some(StmtKind::Decl(DeclKind::Let | DeclKind::Const, _))
        );
        let mut current = if per_iteration {
            Scope::new(Some(scope.clone()), false)
        } else {
            scope.clone()
        };
        if let Some(init) = init {
            self.exec(init, &current)?;
        }
        loop {
            self.tick()?;
            if let Some(test) = test {
                if !self.eval(test, &current)?.truthy() {
                    break;
                }
            }
            match self.exec(body, &current)? {
                Flow::Break => break,
                Flow::Return(value) => return Ok(Flow::Return(value)),
                Flow::Normal | Flow::Continue => {}
            }
            if per_iteration {
                let next = Scope::new(Some(scope.clone()), false);
                for (name, value, mutable) in current.own_bindings() {
                    next.declare(name, value, mutable);
                }
                current = next;
            }
            if let Some(update) = update {
                self.eval(update, &current)?;
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_each(
        &mut self,
        decl: Option<DeclKind>,
        target: &Pattern,
        item: Value,
        body: &Stmt,
        scope: &Rc<Scope>,
    ) -> Eval<Flow> {
        self.tick()?;
        match decl {
            Some(DeclKind::Let) | Some(DeclKind::Const) => {
                let iteration = Scope::new(Some(scope.clone()), false);
                let binder = if decl == Some(DeclKind::Const) {
                    Binder::Const
                } else {
                    Binder::Let
                };
                self.bind_pattern(target, item, &iteration, binder)?;
                self.exec(body, &iteration)
            }
            Some(DeclKind::Var) => {
                self.bind_pattern(target, item, scope, Binder::Var)?;
                self.exec(body, scope)
            }
            None => {
                self.bind_pattern(target, item, scope, Binder::Assign)?;
                self.exec(body, scope)
            }
        }
    }

    fn exec_switch(
        &mut self,
        discriminant: &Expr,
        cases: &[SwitchCase],
        scope: &Rc<Scope>,
    ) -> Eval<Flow> {
        let value = self.eval(discriminant, scope)?;
        let inner = if cases.iter().any(|case| needs_scope(&case.body)) {
            let inner = Scope::new(Some(scope.clone()), false);
            for case in cases {
                self.hoist_functions(&case.body, &inner)?;
            }
            inner
        } else {
            scope.clone()
        };

        let mut start = None;
        for (index, case) in cases.iter().enumerate() {
            if let Some(test) = &case.test {
                if self.eval(test, &inner)?.strict_equals(&value) {
                    start = Some(index);
                    break;
                }
            }
        }
        let Some(start) = start.or_else(|| cases.iter().position(|case| case.test.is_none()))
        else {
            return Ok(Flow::Normal);
        };

        for case in &cases[start..] {
            match self.exec_stmts(&case.body, &inner)? {
                Flow::Normal => {}
                Flow::Break => return Ok(Flow::Normal),
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_handler(
        &mut self,
        param: Option<&Pattern>,
        thrown: Value,
        handler: &[Stmt],
        scope: &Rc<Scope>,
    ) -> Eval<Flow> {
        let handler_scope = Scope::new(Some(scope.clone()), false);
        if let Some(param) = param {
            self.bind_pattern(param, thrown, &handler_scope, Binder::Let)?;
        }
        self.exec_block(handler, &handler_scope)
    }

    // =========================================================================
    // Bindings
    // =========================================================================

    fn bind_pattern(
        &mut self,
        pattern: &Pattern,
        value: Value,
        scope: &Rc<Scope>,
        binder: Binder,
    ) -> Eval<()> {
        match pattern {
            Pattern::Ident(name) => self.bind_name(name, value, scope, binder),
            Pattern::Array(items) => {
                let values = self.iterate(&value)?;
                for (index, item) in items.iter().enumerate() {
                    if let Some(item) = item {
                        let value = values.get(index).cloned().unwrap_or(Value::Undefined);
                        self.bind_pattern(item, value, scope, binder)?;
                    }
                }
                Ok(())
            }
            Pattern::Object(props) => {
                if value.is_nullish() {
                    return Err(self.type_error(format!(
                        "Cannot destructure '{}' as it is {}.",
                        value.to_display(),
                        value.to_display()
                    )));
                }
                for (key, target) in props {
                    let property = self.get_property(&value, key)?;
                    self.bind_pattern(target, property, scope, binder)?;
                }
                Ok(())
            }
        }
    }

    fn bind_name(&mut self, name: &Ident, value: Value, scope: &Rc<Scope>, binder: Binder) -> Eval<()> {
        match binder {
            Binder::Var => {
                if scope.assign(name, value.clone()).is_err() {
                    scope.declare_var(name.clone(), value);
                }
                Ok(())
            }
            Binder::Let => {
                scope.declare(name.clone(), value, true);
                Ok(())
            }
            Binder::Const => {
                scope.declare(name.clone(), value, false);
                Ok(())
            }
            Binder::Assign => self.assign_name(name, value, scope),
        }
    }

    fn assign_name(&mut self, name: &str, value: Value, scope: &Rc<Scope>) -> Eval<()> {
        match scope.assign(name, value) {
            Ok(()) => Ok(()),
            Err(AssignFailure::Undeclared) => {
                Err(self.throw("ReferenceError", format!("{} is not defined", name)))
            }
            Err(AssignFailure::Constant) => Err(self.type_error("Assignment to constant variable.")),
        }
    }

    fn lookup(&self, name: &str, scope: &Rc<Scope>) -> Eval<Value> {
        scope
            .lookup(name)
            .ok_or_else(|| self.throw("ReferenceError", format!("{} is not defined", name)))
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    pub(super) fn eval(&mut self, expr: &Expr, scope: &Rc<Scope>) -> Eval<Value> {
        match expr {
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Str(s) => self.alloc_str(s.to_string()),
            Expr::Template(segments) => {
                let mut out = String::new();
                for segment in segments {
                    match segment {
                        TemplateSegment::Text(text) => out.push_str(text),
                        TemplateSegment::Expr(expr) => {
                            let value = self.eval(expr, scope)?;
                            out.push_str(&self.to_text(&value)?);
                        }
                    }
                }
                self.alloc_str(out)
            }
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Null => Ok(Value::Null),
            Expr::Undefined => Ok(Value::Undefined),
            Expr::Ident(name) => self.lookup(name, scope),
            Expr::Array(items) => {
                let values = self.eval_list(items, scope)?;
                self.alloc_array(values)
            }
            Expr::Object(props) => self.eval_object(props, scope),
            Expr::Function(def) => self.alloc_closure(def, scope),
            Expr::Unary(op, operand) => self.eval_unary(*op, operand, scope),
            Expr::Delete(target) => self.eval_delete(target, scope),
            Expr::Update {
                increment,
                prefix,
                target,
            } => {
                let place = self.resolve_place(target, scope)?;
                let old = self.read_place(&place, scope)?.to_number();
                let new = if *increment { old + 1.0 } else { old - 1.0 };
                self.write_place(&place, Value::Number(new), scope)?;
                Ok(Value::Number(if *prefix { new } else { old }))
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left, scope)?;
                let right = self.eval(right, scope)?;
                self.binary(*op, &left, &right)
            }
            Expr::Logical(op, left, right) => {
                let left = self.eval(left, scope)?;
                let short_circuit = match op {
                    LogicalOp::And => !left.truthy(),
                    LogicalOp::Or => left.truthy(),
                    LogicalOp::Nullish => !left.is_nullish(),
                };
                if short_circuit {
                    Ok(left)
                } else {
                    self.eval(right, scope)
                }
            }
            Expr::Conditional(test, consequent, alternate) => {
                if self.eval(test, scope)?.truthy() {
                    self.eval(consequent, scope)
                } else {
                    self.eval(alternate, scope)
                }
            }
            Expr::Assign { op, target, value } => self.eval_assign(*op, target, value, scope),
            Expr::Member { .. } | Expr::Index { .. } | Expr::Call { .. } => {
                Ok(self.eval_chain(expr, scope)?.unwrap_or(Value::Undefined))
            }
            Expr::New { callee, args } => {
                let constructor = self.eval(callee, scope)?;
                let args = self.eval_list(args, scope)?;
                self.construct(&constructor, args, callee)
            }
            Expr::Sequence(items) => {
                let mut last = Value::Undefined;
                for item in items {
                    last = self.eval(item, scope)?;
                }
                Ok(last)
            }
            Expr::Spread(_) => Err(self.throw("SyntaxError", "Unexpected spread")),
        }
    }

    /// Member, index and call chains; `None` means an optional link
    /// short-circuited the rest of the chain
    fn eval_chain(&mut self, expr: &Expr, scope: &Rc<Scope>) -> Eval<Option<Value>> {
        match expr {
            Expr::Member {
                object,
                property,
                optional,
            } => {
                let Some(base) = self.eval_chain(object, scope)? else {
                    return Ok(None);
                };
                if *optional && base.is_nullish() {
                    return Ok(None);
                }
                self.get_property(&base, property).map(Some)
            }
            Expr::Index {
                object,
                index,
                optional,
            } => {
                let Some(base) = self.eval_chain(object, scope)? else {
                    return Ok(None);
                };
                if *optional && base.is_nullish() {
                    return Ok(None);
                }
                let key = self.eval(index, scope)?;
                self.get_index(&base, &key).map(Some)
            }
            Expr::Call {
                callee,
                args,
                optional,
            } => {
                let (this, function) = match callee.as_ref() {
                    Expr::Member {
                        object,
                        property,
                        optional: link,
                    } => {
                        let Some(base) = self.eval_chain(object, scope)? else {
                            return Ok(None);
                        };
                        if *link && base.is_nullish() {
                            return Ok(None);
                        }
                        let function = self.get_property(&base, property)?;
                        (base, function)
                    }
                    Expr::Index {
                        object,
                        index,
                        optional: link,
                    } => {
                        let Some(base) = self.eval_chain(object, scope)? else {
                            return Ok(None);
                        };
                        if *link && base.is_nullish() {
                            return Ok(None);
                        }
                        let key = self.eval(index, scope)?;
                        let function = self.get_index(&base, &key)?;
                        (base, function)
                    }
                    other => {
                        let Some(function) = self.eval_chain(other, scope)? else {
                            return Ok(None);
                        };
                        (Value::Undefined, function)
                    }
                };
                if *optional && function.is_nullish() {
                    return Ok(None);
                }
                if !function.is_callable() {
                    return Err(self.type_error(format!("{} is not a function", describe_callee(callee))));
                }
                let args = self.eval_list(args, scope)?;
                self.call_value(&function, this, args).map(Some)
            }
            other => self.eval(other, scope).map(Some),
        }
    }

    /// Evaluate array items or call arguments, expanding spreads
    fn eval_list(&mut self, items: &[Expr], scope: &Rc<Scope>) -> Eval<Vec<Value>> {
        let mut values = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Expr::Spread(inner) => {
                    let spread = self.eval(inner, scope)?;
                    values.extend(self.iterate(&spread)?);
                }
                other => values.push(self.eval(other, scope)?),
            }
        }
        Ok(values)
    }

    fn eval_object(&mut self, props: &[Prop], scope: &Rc<Scope>) -> Eval<Value> {
        let object = self.new_object(Vec::new(), ObjectTag::Plain)?;
        for prop in props {
            match prop {
                Prop::Init(key, value) => {
                    let key = match key {
                        PropKey::Static(key) => key.clone(),
                        PropKey::Computed(expr) => {
                            let key = self.eval(expr, scope)?;
                            self.property_key(&key)
                        }
                    };
                    let value = self.eval(value, scope)?;
                    object.set(&key, value)?;
                }
                Prop::Spread(expr) => {
                    let source = self.eval(expr, scope)?;
                    for (key, value) in self.own_entries(&source)? {
                        object.set(&key, value)?;
                    }
                }
            }
        }
        Ok(Value::Object(object))
    }

    fn eval_unary(&mut self, op: UnaryOp, operand: &Expr, scope: &Rc<Scope>) -> Eval<Value> {
        if op == UnaryOp::Typeof {
            let value = match operand {
                Expr::Ident(name) => scope.lookup(name).unwrap_or(Value::Undefined),
                other => self.eval(other, scope)?,
            };
            return self.alloc_str(value.type_of().to_string());
        }
        let value = self.eval(operand, scope)?;
        Ok(match op {
            UnaryOp::Neg => Value::Number(-value.to_number()),
            UnaryOp::Plus => Value::Number(value.to_number()),
            UnaryOp::Not => Value::Bool(!value.truthy()),
            UnaryOp::BitNot => Value::Number(f64::from(!to_int32(value.to_number()))),
            UnaryOp::Void => Value::Undefined,
            UnaryOp::Typeof => Value::Undefined,
        })
    }

    fn eval_delete(&mut self, target: &Expr, scope: &Rc<Scope>) -> Eval<Value> {
        let (object, key) = match target {
            Expr::Member {
                object, property, ..
            } => (self.eval(object, scope)?, property.clone()),
            Expr::Index { object, index, .. } => {
                let object = self.eval(object, scope)?;
                let key = self.eval(index, scope)?;
                (object, self.property_key(&key))
            }
            _ => return Ok(Value::Bool(true)),
        };
        match &object {
            Value::Object(o) => {
                o.remove(&key);
            }
            Value::Array(a) => {
                if let Some(index) = array_index(&key) {
                    if index < a.len() {
                        a.set(index, Value::Undefined)?;
                    }
                }
            }
            Value::Host(HostObject::Env) => self.env_set(&key)?,
            Value::Undefined | Value::Null => {
                return Err(self.type_error(format!(
                    "Cannot convert undefined or null to object (deleting '{}')",
                    key
                )))
            }
            _ => {}
        }
        Ok(Value::Bool(true))
    }

    fn eval_assign(
        &mut self,
        op: AssignOp,
        target: &Expr,
        value: &Expr,
        scope: &Rc<Scope>,
    ) -> Eval<Value> {
        let place = self.resolve_place(target, scope)?;
        let value = match op {
            AssignOp::Assign => self.eval(value, scope)?,
            AssignOp::Compound(op) => {
                let current = self.read_place(&place, scope)?;
                let rhs = self.eval(value, scope)?;
                self.binary(op, &current, &rhs)?
            }
            AssignOp::Logical(op) => {
                let current = self.read_place(&place, scope)?;
                let keep = match op {
                    LogicalOp::And => !current.truthy(),
                    LogicalOp::Or => current.truthy(),
                    LogicalOp::Nullish => !current.is_nullish(),
                };
                if keep {
                    return Ok(current);
                }
                self.eval(value, scope)?
            }
        };
        self.write_place(&place, value.clone(), scope)?;
        Ok(value)
    }

    fn resolve_place(&mut self, target: &Expr, scope: &Rc<Scope>) -> Eval<Place> {
        match target {
            Expr::Ident(name) => Ok(Place::Name(name.clone())),
            Expr::Member {
                object, property, ..
            } => Ok(Place::Member(self.eval(object, scope)?, property.clone())),
            Expr::Index { object, index, .. } => {
                let object = self.eval(object, scope)?;
                let key = self.eval(index, scope)?;
                Ok(Place::Index(object, key))
            }
            _ => Err(self.throw("SyntaxError", "Invalid assignment target")),
        }
    }

    fn read_place(&mut self, place: &Place, scope: &Rc<Scope>) -> Eval<Value> {
        match place {
            Place::Name(name) => self.lookup(name, scope),
            Place::Member(object, key) => self.get_property(object, key),
            Place::Index(object, key) => self.get_index(object, key),
        }
    }

    fn write_place(&mut self, place: &Place, value: Value, scope: &Rc<Scope>) -> Eval<()> {
        match place {
            Place::Name(name) => self.assign_name(name, value, scope),
            Place::Member(object, key) => self.set_property(object, key, value),
            Place::Index(object, key) => self.set_index(object, key, value),
        }
    }

    // =========================================================================
    // Operators
    // =========================================================================

    pub(super) fn binary(&mut self, op: BinaryOp, left: &Value, right: &Value) -> Eval<Value> {
        use BinaryOp::*;
        let number = |n: f64| Ok(Value::Number(n));
        match op {
            Add => self.add(left, right),
            Sub => number(left.to_number() - right.to_number()),
            Mul => number(left.to_number() * right.to_number()),
            Div => number(left.to_number() / right.to_number()),
            Mod => number(left.to_number() % right.to_number()),
            Exp => {
                let (base, exponent) = (left.to_number(), right.to_number());
                if exponent.is_nan() {
                    number(f64::NAN)
                } else {
                    number(base.powf(exponent))
                }
            }
            Eq => Ok(Value::Bool(left.loose_equals(right))),
            NotEq => Ok(Value::Bool(!left.loose_equals(right))),
            StrictEq => Ok(Value::Bool(left.strict_equals(right))),
            StrictNotEq => Ok(Value::Bool(!left.strict_equals(right))),
            Lt => Ok(Value::Bool(compare(left, right) == Some(Ordering::Less))),
            Gt => Ok(Value::Bool(compare(left, right) == Some(Ordering::Greater))),
            LtEq => Ok(Value::Bool(matches!(
                compare(left, right),
                Some(Ordering::Less | Ordering::Equal)
            ))),
            GtEq => Ok(Value::Bool(matches!(
                compare(left, right),
                Some(Ordering::Greater | Ordering::Equal)
            ))),
            BitAnd => number(f64::from(to_int32(left.to_number()) & to_int32(right.to_number()))),
            BitOr => number(f64::from(to_int32(left.to_number()) | to_int32(right.to_number()))),
            BitXor => number(f64::from(to_int32(left.to_number()) ^ to_int32(right.to_number()))),
            Shl => number(f64::from(
                to_int32(left.to_number()).wrapping_shl(to_uint32(right.to_number()) & 31),
            )),
            Shr => number(f64::from(
                to_int32(left.to_number()).wrapping_shr(to_uint32(right.to_number()) & 31),
            )),
            UShr => number(f64::from(
                to_uint32(left.to_number()).wrapping_shr(to_uint32(right.to_number()) & 31),
            )),
            In => {
                let key = self.property_key(left);
                self.has_property(right, &key).map(Value::Bool)
            }
            InstanceOf => self.instance_of(left, right).map(Value::Bool),
        }
    }

    fn add(&mut self, left: &Value, right: &Value) -> Eval<Value> {
        if let (Value::Number(a), Value::Number(b)) = (left, right) {
            return Ok(Value::Number(a + b));
        }
        let textual = |v: &Value| !is_primitive(v) || matches!(v, Value::Str(_));
        if !textual(left) && !textual(right) {
            return Ok(Value::Number(left.to_number() + right.to_number()));
        }
        let a = self.text_of(left)?;
        let b = self.text_of(right)?;
        let len = a.len() + b.len();
        self.alloc_str_sized(len, || {
            let mut out = String::with_capacity(len);
            out.push_str(&a);
            out.push_str(&b);
            out
        })
    }

    fn has_property(&mut self, object: &Value, key: &str) -> Eval<bool> {
        Ok(match object {
            Value::Object(o) => o.has(key),
            Value::Array(a) => key == "length" || array_index(key).is_some_and(|i| i < a.len()),
            Value::Bytes(b) => key == "length" || array_index(key).is_some_and(|i| i < b.len()),
            Value::Host(HostObject::Env) => !self.env_get(key)?.is_nullish(),
            Value::Host(_) | Value::Function(_) | Value::Native(_) => {
                !self.get_property(object, key)?.is_nullish()
            }
            other => {
                return Err(self.type_error(format!(
                    "Cannot use 'in' operator to search for '{}' in {}",
                    key,
                    other.to_display()
                )))
            }
        })
    }

    fn instance_of(&mut self, value: &Value, constructor: &Value) -> Eval<bool> {
        Ok(match constructor {
            Value::Native(Native::Builtin(Builtin::Error)) => {
                matches!(value, Value::Object(o) if o.tag() == ObjectTag::Error)
            }
            Value::Native(Native::Builtin(kind @ (Builtin::TypeError | Builtin::RangeError))) => {
                matches!(value, Value::Object(o)
                    if o.tag() == ObjectTag::Error
                        && o.get("name").is_some_and(|n| n.as_str() == Some(kind.name())))
            }
            Value::Host(HostObject::Array) => matches!(value, Value::Array(_)),
            Value::Host(HostObject::Buffer) => matches!(value, Value::Bytes(_)),
            Value::Host(HostObject::Object) => !is_primitive(value),
            value_constructor if value_constructor.is_callable() => false,
            _ => return Err(self.type_error("Right-hand side of 'instanceof' is not callable")),
        })
    }

    // =========================================================================
    // Conversions
    // =========================================================================

    /// `String(value)`; nesting too deep to render is a RangeError
    pub(super) fn to_text(&self, value: &Value) -> Eval<String> {
        value
            .try_display()
            .map_err(|_| self.range_error("Maximum call stack size exceeded"))
    }

    fn text_of<'v>(&self, value: &'v Value) -> Eval<Cow<'v, str>> {
        Ok(match value {
            Value::Str(s) => Cow::Borrowed(s.as_str()),
            other => Cow::Owned(self.to_text(other)?),
        })
    }

    pub(super) fn property_key(&self, key: &Value) -> Rc<str> {
        match key {
            Value::Str(s) => Rc::from(s.as_str()),
            other => Rc::from(other.to_display()),
        }
    }

    /// Values produced by `for…of`, spreads and array patterns
    pub(super) fn iterate(&mut self, value: &Value) -> Eval<Vec<Value>> {
        match value {
            Value::Array(a) => Ok(a.snapshot()),
            Value::Str(s) => s
                .as_str()
                .chars()
                .map(|c| self.alloc_str(c.to_string()))
                .collect(),
            Value::Bytes(b) => Ok(b.data().iter().map(|&x| Value::Number(f64::from(x))).collect()),
            other => Err(self.type_error(format!("{} is not iterable", describe_value(other)))),
        }
    }

    /// Keys visited by `for…in` and `Object.keys`
    pub(super) fn enumerate_keys(&mut self, value: &Value) -> Eval<Vec<Rc<str>>> {
        Ok(match value {
            Value::Object(o) => enumerable_keys(o),
            Value::Array(a) => (0..a.len()).map(|i| Rc::from(i.to_string())).collect(),
            Value::Bytes(b) => (0..b.len()).map(|i| Rc::from(i.to_string())).collect(),
            Value::Str(s) => (0..s.char_len()).map(|i| Rc::from(i.to_string())).collect(),
            Value::Host(HostObject::Env) => self
                .ctx
                .environment
                .enumerate()
                .into_iter()
                .map(Rc::from)
                .collect(),
            _ => Vec::new(),
        })
    }

    /// Key/value pairs for spreads, `Object.entries` and `Object.assign`
    pub(super) fn own_entries(&mut self, value: &Value) -> Eval<Vec<(Rc<str>, Value)>> {
        match value {
            Value::Object(o) => Ok(o
                .entries()
                .iter()
                .filter(|(k, _)| o.tag() == ObjectTag::Plain || !is_error_field(k))
                .cloned()
                .collect()),
            Value::Host(HostObject::Env) => {
                let mut entries = Vec::new();
                for name in self.ctx.environment.enumerate() {
                    let value = self.env_get(&name)?;
                    entries.push((Rc::from(name), value));
                }
                Ok(entries)
            }
            other => {
                let keys = self.enumerate_keys(other)?;
                let mut entries = Vec::with_capacity(keys.len());
                for key in keys {
                    let value = self.get_property(other, &key)?;
                    entries.push((key, value));
                }
                Ok(entries)
            }
        }
    }

    // =========================================================================
    // Properties
    // =========================================================================

    pub(super) fn get_property(&mut self, object: &Value, key: &str) -> Eval<Value> {
        match object {
            Value::Undefined | Value::Null => Err(self.type_error(format!(
                "Cannot read properties of {} (reading '{}')",
                object.to_display(),
                key
            ))),
            Value::Object(o) => Ok(match o.get(key) {
                Some(value) => value,
                None if is_method_of(object, key) => bound(object, key),
                None => Value::Undefined,
            }),
            Value::Array(a) => Ok(if key == "length" {
                Value::Number(a.len() as f64)
            } else if let Some(index) = array_index(key) {
                a.get(index)
            } else if is_method_of(object, key) {
                bound(object, key)
            } else {
                Value::Undefined
            }),
            Value::Str(s) => {
                if key == "length" {
                    Ok(Value::Number(s.char_len() as f64))
                } else if let Some(index) = array_index(key) {
                    self.char_at(s, index)
                } else if is_method_of(object, key) {
                    Ok(bound(object, key))
                } else {
                    Ok(Value::Undefined)
                }
            }
            Value::Bytes(b) => Ok(if key == "length" || key == "byteLength" {
                Value::Number(b.len() as f64)
            } else if let Some(index) = array_index(key) {
                b.data()
                    .get(index)
                    .map(|&x| Value::Number(f64::from(x)))
                    .unwrap_or(Value::Undefined)
            } else if is_method_of(object, key) {
                bound(object, key)
            } else {
                Value::Undefined
            }),
            Value::Function(f) => match key {
                "name" => self.alloc_str(f.name().unwrap_or("").to_string()),
                "length" => Ok(Value::Number(f.def.params.len() as f64)),
                _ if is_method_of(object, key) => Ok(bound(object, key)),
                _ => Ok(Value::Undefined),
            },
            Value::Native(native) => match key {
                "name" => {
                    let name = match native {
                        Native::Builtin(b) => b.name().to_string(),
                        Native::Bound(m) => m.name.to_string(),
                    };
                    self.alloc_str(name)
                }
                _ if is_method_of(object, key) => Ok(bound(object, key)),
                _ => Ok(Value::Undefined),
            },
            Value::Number(_) | Value::Bool(_) => Ok(if is_method_of(object, key) {
                bound(object, key)
            } else {
                Value::Undefined
            }),
            Value::Host(host) => self.host_property(host, key),
        }
    }

    pub(super) fn get_index(&mut self, object: &Value, key: &Value) -> Eval<Value> {
        if let Value::Number(n) = key {
            if let Some(index) = number_index(*n) {
                match object {
                    Value::Array(a) => return Ok(a.get(index)),
                    Value::Str(s) => return self.char_at(s, index),
                    _ => {}
                }
            }
        }
        let key = self.property_key(key);
        self.get_property(object, &key)
    }

    pub(super) fn set_property(&mut self, object: &Value, key: &str, value: Value) -> Eval<()> {
        match object {
            Value::Undefined | Value::Null => Err(self.type_error(format!(
                "Cannot set properties of {} (setting '{}')",
                object.to_display(),
                key
            ))),
            Value::Object(o) => Ok(o.set(key, value)?),
            Value::Array(a) => {
                if key == "length" {
                    let Some(len) = number_index(value.to_number()) else {
                        return Err(self.range_error("Invalid array length"));
                    };
                    if len < a.len() {
                        a.truncate(len);
                    } else if len > a.len() {
                        a.set(len - 1, Value::Undefined)?;
                    }
                } else if let Some(index) = array_index(key) {
                    a.set(index, value)?;
                }
                Ok(())
            }
            Value::Bytes(b) => {
                if let Some(index) = array_index(key) {
                    b.set(index, to_uint32(value.to_number()) as u8);
                }
                Ok(())
            }
            Value::Host(HostObject::Env) => self.env_set(key),
            Value::Host(host) => Err(self.type_error(format!(
                "Cannot assign to read only property '{}' of object '{}'",
                key,
                host.name()
            ))),
            _ => Ok(()),
        }
    }

    fn set_index(&mut self, object: &Value, key: &Value, value: Value) -> Eval<()> {
        if let (Value::Array(a), Value::Number(n)) = (object, key) {
            if let Some(index) = number_index(*n) {
                return Ok(a.set(index, value)?);
            }
        }
        let key = self.property_key(key);
        self.set_property(object, &key, value)
    }

    fn char_at(&self, s: &StrCell, index: usize) -> Eval<Value> {
        let c = if s.is_ascii() {
            s.as_str().get(index..index + 1).map(str::to_string)
        } else {
            s.as_str().chars().nth(index).map(String::from)
        };
        match c {
            Some(c) => self.alloc_str(c),
            None => Ok(Value::Undefined),
        }
    }

    // =========================================================================
    // Environment
    // =========================================================================

    pub(super) fn env_get(&mut self, name: &str) -> Eval<Value> {
        match self.ctx.environment.get(name) {
            Ok(Some(value)) => self.alloc_str(value),
            Ok(None) => Ok(Value::Undefined),
            Err(denied) => Err(self.halt_for_policy(&denied.to_string())),
        }
    }

    pub(super) fn env_set(&mut self, name: &str) -> Eval<()> {
        match self.ctx.environment.set(name, "") {
            Ok(()) => Ok(()),
            Err(denied) => Err(self.type_error(denied.to_string())),
        }
    }

    // =========================================================================
    // Calls
    // =========================================================================

    pub(super) fn call_value(&mut self, callee: &Value, this: Value, args: Vec<Value>) -> Eval<Value> {
        self.tick()?;
        match callee {
            Value::Function(closure) => self.call_closure(closure, this, args),
            Value::Native(Native::Builtin(builtin)) => self.call_builtin(*builtin, args),
            Value::Native(Native::Bound(method)) => {
                let method = method.clone();
                self.call_method(&method.receiver, &method.name, args)
            }
            Value::Host(host) if host.is_constructor() => {
                let host = host.clone();
                self.call_host_constructor(&host, args, false)
            }
            other => Err(self.type_error(format!("{} is not a function", describe_value(other)))),
        }
    }

    fn call_closure(&mut self, closure: &Rc<Closure>, this: Value, args: Vec<Value>) -> Eval<Value> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(self.range_error("Maximum call stack size exceeded"));
        }
        let Some(env) = closure.env() else {
            return Err(self.type_error("Function is no longer callable"));
        };
        let def = closure.def.clone();
        let scope = Scope::new(Some(env), true);
        if !def.is_arrow {
            scope.declare(Rc::from("this"), this, false);
            if let Some(name) = &def.name {
                scope.declare(name.clone(), Value::Function(closure.clone()), true);
            }
        }

        self.depth += 1;
        let result = self.invoke(&def, &scope, args);
        self.depth -= 1;
        result
    }

    fn invoke(&mut self, def: &FunctionDef, scope: &Rc<Scope>, mut args: Vec<Value>) -> Eval<Value> {
        let rest = if args.len() > def.params.len() {
            args.split_off(def.params.len())
        } else {
            Vec::new()
        };
        let mut args = args.into_iter();
        for param in &def.params {
            let mut value = args.next().unwrap_or(Value::Undefined);
            if matches!(value, Value::Undefined) {
                if let Some(default) = &param.default {
                    value = self.eval(default, scope)?;
                }
            }
            self.bind_pattern(&param.target, value, scope, Binder::Let)?;
        }
        if let Some(name) = &def.rest {
            let rest = self.alloc_array(rest)?;
            scope.declare(name.clone(), rest, true);
        }

        match &def.body {
            FunctionBody::Expr(expr) => self.eval(expr, scope),
            FunctionBody::Block(stmts) => {
                hoist_vars(stmts, scope);
                self.hoist_functions(stmts, scope)?;
                match self.exec_stmts(stmts, scope)? {
                    Flow::Return(value) => Ok(value),
                    _ => Ok(Value::Undefined),
                }
            }
        }
    }

    fn construct(&mut self, constructor: &Value, args: Vec<Value>, callee: &Expr) -> Eval<Value> {
        match constructor {
            Value::Native(Native::Builtin(builtin)) => match builtin {
                Builtin::Error
                | Builtin::TypeError
                | Builtin::RangeError
                | Builtin::Function
                | Builtin::Boolean => self.call_builtin(*builtin, args),
                _ => Err(self.type_error(format!("{} is not a constructor", builtin.name()))),
            },
            Value::Host(host) if host.is_constructor() => {
                let host = host.clone();
                self.call_host_constructor(&host, args, true)
            }
            Value::Function(closure) if !closure.def.is_arrow => {
                let instance = self.alloc_object(Vec::new())?;
                let result = self.call_closure(closure, instance.clone(), args)?;
                Ok(if is_primitive(&result) { instance } else { result })
            }
            _ => Err(self.type_error(format!("{} is not a constructor", describe_callee(callee)))),
        }
    }

    // =========================================================================
    // Timers
    // =========================================================================

    pub(super) fn schedule_timer(
        &mut self,
        api: &str,
        mut args: Vec<Value>,
        repeat: bool,
    ) -> Eval<Value> {
        let callback = if args.is_empty() {
            Value::Undefined
        } else {
            args.remove(0)
        };
        if matches!(callback, Value::Str(_)) {
            let denial = self.ctx.capabilities.reject_timer_source(api);
            return Err(self.denied(denial));
        }
        if !callback.is_callable() {
            return Err(self.type_error(format!(
                "The \"callback\" argument of {} must be of type function",
                api
            )));
        }
        if self.timers.len() >= MAX_PENDING_TIMERS {
            return Err(self.range_error("Too many pending timers"));
        }
        let delay = if args.is_empty() {
            0.0
        } else {
            args.remove(0).to_number()
        };
        let delay = if delay.is_finite() { delay.clamp(1.0, i32::MAX as f64) } else { 1.0 };
        let delay = Duration::from_millis(delay as u64);

        let id = self.next_timer_id;
        self.next_timer_id += 1;
        self.timer_seq += 1;
        self.timers.push(Timer {
            id,
            due: Instant::now() + delay,
            seq: self.timer_seq,
            callback,
            args,
            repeat: repeat.then_some(delay),
        });
        Ok(Value::Number(id as f64))
    }

    /// Queue a callback ahead of any delayed timer
    pub(super) fn queue_immediate(&mut self, callback: Value, args: Vec<Value>) -> Eval<()> {
        if !callback.is_callable() {
            return Err(self.type_error("The \"callback\" argument must be of type function"));
        }
        if self.timers.len() >= MAX_PENDING_TIMERS {
            return Err(self.range_error("Too many pending timers"));
        }
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        self.timer_seq += 1;
        self.timers.push(Timer {
            id,
            due: self.started,
            seq: self.timer_seq,
            callback,
            args,
            repeat: None,
        });
        Ok(())
    }

    pub(super) fn clear_timer(&mut self, id: &Value) {
        let Value::Number(n) = id else {
            return;
        };
        let id = *n as u64;
        let before = self.timers.len();
        self.timers.retain(|timer| timer.id != id);
        if self.timers.len() == before && self.running_timer == Some(id) {
            self.running_cleared = true;
        }
    }

    fn run_timers(&mut self) -> Eval<()> {
        loop {
            let next = self
                .timers
                .iter()
                .enumerate()
                .min_by_key(|(_, timer)| (timer.due, timer.seq))
                .map(|(index, timer)| (index, timer.due));
            let Some((index, due)) = next else {
                return Ok(());
            };
            self.wait_until(due)?;
            let timer = self.timers.swap_remove(index);

            self.running_timer = Some(timer.id);
            self.running_cleared = false;
            let result = self.call_value(&timer.callback, Value::Undefined, timer.args.clone());
            self.running_timer = None;
            result?;

            if let Some(period) = timer.repeat {
                if !self.running_cleared {
                    self.timer_seq += 1;
                    self.timers.push(Timer {
                        due: Instant::now() + period,
                        seq: self.timer_seq,
                        ..timer
                    });
                }
            }
        }
    }

    fn wait_until(&mut self, due: Instant) -> Eval<()> {
        let slice = Duration::from_millis(TIMER_WAIT_SLICE_MS);
        loop {
            self.tick()?;
            let now = Instant::now();
            if now >= due {
                return Ok(());
            }
            std::thread::sleep((due - now).min(slice));
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn install_globals(scope: &Rc<Scope>) {
    let hosts = [
        ("console", HostObject::Console),
        ("Math", HostObject::Math),
        ("JSON", HostObject::Json),
        ("Object", HostObject::Object),
        ("Array", HostObject::Array),
        ("Number", HostObject::Number),
        ("String", HostObject::String),
        ("process", HostObject::Process),
        ("Buffer", HostObject::Buffer),
        ("Date", HostObject::Date),
    ];
    for (name, host) in hosts {
        scope.declare(Rc::from(name), Value::Host(host), false);
    }
    let builtins = [
        Builtin::ParseInt,
        Builtin::ParseFloat,
        Builtin::IsNaN,
        Builtin::IsFinite,
        Builtin::Boolean,
        Builtin::Error,
        Builtin::TypeError,
        Builtin::RangeError,
        Builtin::SetTimeout,
        Builtin::SetInterval,
        Builtin::ClearTimeout,
        Builtin::ClearInterval,
        Builtin::Require,
        Builtin::Eval,
        Builtin::Function,
    ];
    for builtin in builtins {
        scope.declare(Rc::from(builtin.name()), Value::Native(Native::Builtin(builtin)), false);
    }
    scope.declare(Rc::from("NaN"), Value::Number(f64::NAN), false);
    scope.declare(Rc::from("Infinity"), Value::Number(f64::INFINITY), false);
    scope.declare(Rc::from("undefined"), Value::Undefined, false);
    scope.declare(Rc::from("this"), Value::Undefined, false);
}

fn needs_scope(stmts: &[Stmt]) -> bool {
    stmts.iter().any(|stmt| {
        matches!(
            stmt.kind,
            StmtKind::Decl(DeclKind::Let | DeclKind::Const, _) | StmtKind::Function(_)
        )
    })
}

/// Declare every `var` of a function body up front
fn hoist_vars(stmts: &[Stmt], scope: &Rc<Scope>) {
    let mut names = Vec::new();
    for stmt in stmts {
        collect_vars(stmt, &mut names);
    }
    for name in names {
        if !scope.has_own(&name) {
            scope.declare(name, Value::Undefined, true);
        }
    }
}

fn collect_vars(stmt: &Stmt, out: &mut Vec<Ident>) {
    match &stmt.kind {
        StmtKind::Decl(DeclKind::Var, declarators) => {
            declarators.iter().for_each(|d| d.target.names(out));
        }
        StmtKind::If(_, consequent, alternate) => {
            collect_vars(consequent, out);
            if let Some(alternate) = alternate {
                collect_vars(alternate, out);
            }
        }
        StmtKind::While(_, body) | StmtKind::DoWhile(body, _) => collect_vars(body, out),
        StmtKind::For { init, body, .. } => {
            if let Some(init) = init {
                collect_vars(init, out);
            }
            collect_vars(body, out);
        }
        StmtKind::ForOf {
            decl, target, body, ..
        }
        | StmtKind::ForIn {
            decl, target, body, ..
        } => {
            if *decl == Some(DeclKind::Var) {
                target.names(out);
            }
            collect_vars(body, out);
        }
        StmtKind::Switch { cases, .. } => {
            cases.iter().flat_map(|c| &c.body).for_each(|s| collect_vars(s, out));
        }
        StmtKind::Try {
            block,
            handler,
            finalizer,
            ..
        } => {
            block.iter().for_each(|s| collect_vars(s, out));
            handler.iter().flatten().for_each(|s| collect_vars(s, out));
            finalizer.iter().flatten().for_each(|s| collect_vars(s, out));
        }
        StmtKind::Block(stmts) => stmts.iter().for_each(|s| collect_vars(s, out)),
        _ => {}
    }
}

pub(super) fn bound(receiver: &Value, name: &str) -> Value {
    Value::Native(Native::Bound(Rc::new(BoundMethod {
        receiver: receiver.clone(),
        name: Rc::from(name),
    })))
}

pub(super) fn is_primitive(value: &Value) -> bool {
    matches!(
        value,
        Value::Undefined | Value::Null | Value::Bool(_) | Value::Number(_) | Value::Str(_)
    )
}

fn is_error_field(key: &str) -> bool {
    matches!(key, "name" | "message" | "stack")
}

/// Own keys that enumeration sees; error fields stay hidden
pub(super) fn enumerable_keys(object: &ObjectCell) -> Vec<Rc<str>> {
    object
        .keys()
        .into_iter()
        .filter(|k| object.tag() == ObjectTag::Plain || !is_error_field(k))
        .collect()
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => left.to_number().partial_cmp(&right.to_number()),
    }
}

pub(super) fn to_int32(n: f64) -> i32 {
    to_uint32(n) as i32
}

pub(super) fn to_uint32(n: f64) -> u32 {
    if !n.is_finite() {
        return 0;
    }
    (n.trunc().rem_euclid(4_294_967_296.0)) as u32
}

fn describe_callee(expr: &Expr) -> String {
    match expr {
        Expr::Ident(name) => name.to_string(),
        Expr::Member {
            object, property, ..
        } => format!("{}.{}", describe_callee(object), property),
        Expr::Index { object, .. } => format!("{}[...]", describe_callee(object)),
        Expr::Call { callee, .. } => format!("{}(...)", describe_callee(callee)),
        _ => "expression".to_string(),
    }
}

pub(super) fn describe_value(value: &Value) -> String {
    match value {
        Value::Str(s) => format!("\"{}\"", s.as_str().chars().take(40).collect::<String>()),
        Value::Object(_) => "object".to_string(),
        Value::Array(_) => "array".to_string(),
        other => other.to_display(),
    }
}
