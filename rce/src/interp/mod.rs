//! Reference executor
//!
//! Runs a `Method` either as written (interpreted) or through a
//! `CompiledMethod`. Compiled execution evaluates hoisted guards at each loop
//! entry; a failing guard deoptimizes, and execution continues interpreted
//! from the entry of that loop with every original check in place.
//!
//! Comparing the two modes on the same arguments is the soundness harness:
//! the outcome and the sequence of stores must agree.

mod error;

pub use error::{ErrorKind, ExecResult, RuntimeError};

use serde::Serialize;

use crate::deopt::DeoptEvent;
use crate::fusion::eval_unfused;
use crate::ir::{Bindings, BranchAction, ExceptionKind, LoopDecl, Method, Node, Stmt, StoreId};
use crate::opt::CompiledMethod;

/// Step limit for one execution
pub const DEFAULT_FUEL: u64 = 1_000_000;

/// How a method finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Outcome {
    Returned,
    Threw(ExceptionKind),
}

/// Observable behavior of one execution
#[derive(Debug, Clone, Serialize)]
pub struct Execution {
    pub outcome: Outcome,
    /// Bytecode index of the throwing site
    pub thrown_at: Option<u32>,
    /// Every store performed, with the index written
    pub writes: Vec<(StoreId, i64)>,
    pub deopts: Vec<DeoptEvent>,
    pub steps: u64,
}

impl Execution {
    pub fn store_count(&self, store: StoreId) -> usize {
        self.writes.iter().filter(|(s, _)| *s == store).count()
    }

    /// Same outcome and same stores, in the same order
    pub fn same_behavior(&self, other: &Execution) -> bool {
        self.outcome == other.outcome && self.writes == other.writes
    }
}

/// Control flow out of a statement list
enum Flow {
    Normal,
    /// Skip the rest of the current iteration
    Continue,
    Break,
    Threw(ExceptionKind, u32),
}

pub struct Executor<'a> {
    method: &'a Method,
    compiled: Option<&'a CompiledMethod>,
    fuel: u64,
    steps: u64,
    writes: Vec<(StoreId, i64)>,
    deopts: Vec<DeoptEvent>,
}

impl<'a> Executor<'a> {
    pub fn interpreted(method: &'a Method) -> Self {
        Self::with_code(method, None)
    }

    pub fn compiled(code: &'a CompiledMethod) -> Self {
        Self::with_code(&code.method, Some(code))
    }

    fn with_code(method: &'a Method, compiled: Option<&'a CompiledMethod>) -> Self {
        Executor {
            method,
            compiled,
            fuel: DEFAULT_FUEL,
            steps: 0,
            writes: Vec::new(),
            deopts: Vec::new(),
        }
    }

    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel = fuel;
        self
    }

    /// Run the method with `args` bound to its parameters
    pub fn run(mut self, args: &Bindings) -> ExecResult<Execution> {
        self.check_arguments(args)?;
        let mut env = Bindings { params: args.params.clone(), ivs: Default::default() };
        let method = self.method;
        let flow = self.exec_block(&method.body, &mut env)?;
        let (outcome, thrown_at) = match flow {
            Flow::Threw(kind, bci) => (Outcome::Threw(kind), Some(bci)),
            Flow::Normal | Flow::Continue | Flow::Break => (Outcome::Returned, None),
        };
        Ok(Execution { outcome, thrown_at, writes: self.writes, deopts: self.deopts, steps: self.steps })
    }

    fn check_arguments(&self, args: &Bindings) -> ExecResult<()> {
        for id in &self.method.params {
            if let Node::Param { name, range } = self.method.graph.node(*id)? {
                let value = *args.params.get(name).ok_or_else(|| RuntimeError::missing_argument(name))?;
                if !range.contains(value) {
                    return Err(RuntimeError::argument_out_of_range(name, value, &range.to_string()));
                }
            }
        }
        Ok(())
    }

    fn tick(&mut self) -> ExecResult<()> {
        self.steps += 1;
        if self.steps > self.fuel {
            return Err(RuntimeError::out_of_fuel(self.fuel));
        }
        Ok(())
    }

    fn exec_block(&mut self, stmts: &[Stmt], env: &mut Bindings) -> ExecResult<Flow> {
        for stmt in stmts {
            self.tick()?;
            match self.exec_stmt(stmt, env)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt, env: &mut Bindings) -> ExecResult<Flow> {
        let method = self.method;
        let graph = &method.graph;
        match stmt {
            Stmt::Check(id) => {
                let site = method.check(*id).ok_or_else(|| RuntimeError::malformed("unknown check"))?;
                if let Some(code) = self.compiled {
                    if code.is_removed(*id) {
                        return Ok(Flow::Normal);
                    }
                    if let Some(kind) = code.throws.get(id) {
                        return Ok(Flow::Threw(*kind, site.bci));
                    }
                }
                let length = method.check_length(site)?;
                let index = graph.eval(site.index, env)?;
                let len = graph.eval(length, env)?;
                if site.mode.passes(index, len, graph.width(site.index)) {
                    Ok(Flow::Normal)
                } else {
                    Ok(Flow::Threw(ExceptionKind::IndexOutOfBounds, site.bci))
                }
            }
            Stmt::Store(id) => {
                let site = method.store(*id).ok_or_else(|| RuntimeError::malformed("unknown store"))?;
                let array = method.array(site.array).ok_or_else(|| RuntimeError::malformed("unknown array"))?;
                let index = graph.eval(site.index, env)?;
                let len = graph.eval(array.length, env)?;
                if index < 0 || index >= len {
                    return Err(RuntimeError::unsafe_access(&site.name, index, len));
                }
                self.writes.push((*id, index));
                Ok(Flow::Normal)
            }
            Stmt::Branch(id) => {
                let site = method.branch(*id).ok_or_else(|| RuntimeError::malformed("unknown branch"))?;
                let folded = self.compiled.and_then(|code| code.folded.get(id).copied());
                let fused = self.compiled.and_then(|code| code.fused.get(id));
                let taken = match (folded, fused) {
                    (Some(taken), _) => taken,
                    (None, Some(fused)) => fused.eval(graph, env)?,
                    (None, None) => eval_unfused(graph, env, &site.first, &site.second, site.shape)?,
                };
                Ok(match (taken, site.action) {
                    (false, _) => Flow::Normal,
                    (true, BranchAction::Throw(kind)) => Flow::Threw(kind, site.bci),
                    (true, BranchAction::Continue) => Flow::Continue,
                })
            }
            Stmt::BreakIf(cond) => {
                let value = graph.eval(cond.value, env)?;
                let bound = graph.eval(cond.bound, env)?;
                Ok(if cond.op.eval(value, bound) { Flow::Break } else { Flow::Normal })
            }
            Stmt::Loop(id) => {
                let lp = method.loop_decl(*id).ok_or_else(|| RuntimeError::malformed("unknown loop"))?;
                self.enter_loop(lp, env)
            }
        }
    }

    fn enter_loop(&mut self, lp: &LoopDecl, env: &mut Bindings) -> ExecResult<Flow> {
        let method = self.method;
        if let Some(code) = self.compiled {
            // Every failing guard is reported, so recompilation skips all of their sites
            let mut event: Option<DeoptEvent> = None;
            for guard in code.guards_for(lp.id) {
                if guard.pre.holds(method, env)? {
                    continue;
                }
                tracing::warn!(
                    method = %method.name,
                    guard = %guard.id,
                    bcis = ?guard.deopt.bcis,
                    reason = %guard.deopt.reason,
                    "guard failed, deoptimizing"
                );
                if let Some(event) = event.as_mut() {
                    event.absorb(guard);
                } else {
                    event = Some(DeoptEvent::from_guard(guard));
                }
            }
            if let Some(event) = event {
                self.deopts.push(event);
                // Resume interpreted at this loop's entry
                self.compiled = None;
            }
        }

        let graph = &method.graph;
        let mut iv = graph.eval(lp.init, env)?;
        let limit = graph.eval(lp.limit, env)?;
        let flow = loop {
            if !lp.test.eval(iv, limit) {
                break Flow::Normal;
            }
            self.tick()?;
            env.ivs.insert(lp.id, iv);
            match self.exec_block(&lp.body, env)? {
                Flow::Normal | Flow::Continue => {}
                Flow::Break => break Flow::Normal,
                thrown @ Flow::Threw(..) => break thrown,
            }
            iv = lp.width.wrap(iv as i128 + lp.stride as i128);
        };
        env.ivs.remove(&lp.id);
        Ok(flow)
    }
}

/// Run `method` without any optimization
pub fn run_interpreted(method: &Method, args: &Bindings) -> ExecResult<Execution> {
    Executor::interpreted(method).run(args)
}
