//! Instruction metering for sandboxed contract scripts.
//!
//! [`transform`] rewrites an ECMAScript 2016 script so that every execution
//! path reports the number of tracked operations it performs through the
//! sandbox-provided `_instruction_counter` object. Counter calls are spliced
//! into the original source by byte offset; existing source text is never
//! deleted or reordered.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt::Write as _;

use swc_core::{
    common::{sync::Lrc, BytePos, FileName, SourceFile, SourceMap, Span, Spanned},
    ecma::{
        ast::*,
        parser::{lexer::Lexer, EsSyntax, Parser, StringInput, Syntax},
        visit::{Visit, VisitWith},
    },
};
use thiserror::Error;
use tracing::debug;

/// AST vocabulary used by [`parse`], re-exported for callers that run their
/// own static checks on the same tree.
pub use swc_core::ecma::ast;

// -----------------------------------------------------------------------------
// Constants
// -----------------------------------------------------------------------------

/// Identifier under which the sandbox exposes the counter object to the
/// instrumented program. Rebinding it is rejected up front.
pub const COUNTER_IDENT: &str = "_instruction_counter";

/// Weight charged per execution of a tracked construct. Every entry in the
/// tracked set currently costs the same; the value is fixed so all honest
/// nodes account identically.
const TRACKED_WEIGHT: u64 = 1;

// -----------------------------------------------------------------------------
// Errors
// -----------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TransformError {
    /// The input is not a valid ECMAScript 2016 script.
    #[error("parse error at line {line}, column {col}: {msg}")]
    Parse { line: usize, col: usize, msg: String },

    /// The input binds the counter identifier as a variable, function name,
    /// or parameter, which would shadow the sandbox counter and defeat
    /// metering.
    #[error("reserved identifier `_instruction_counter` rebound at line {line}, column {col}")]
    ReservedIdentifier { line: usize, col: usize },
}

impl TransformError {
    fn from_parser(cm: &SourceMap, err: swc_core::ecma::parser::error::Error) -> Self {
        let (line, col) = locate(cm, err.span());
        TransformError::Parse {
            line,
            col,
            msg: err.into_kind().msg().to_string(),
        }
    }
}

fn locate(cm: &SourceMap, span: Span) -> (usize, usize) {
    if span.is_dummy() {
        return (0, 0);
    }
    let loc = cm.lookup_char_pos(span.lo());
    (loc.line, loc.col_display)
}

// -----------------------------------------------------------------------------
// Injection records
// -----------------------------------------------------------------------------

/// How a record's accumulated weight is rendered into source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Emitter {
    /// `_instruction_counter.incr(W);` in statement position.
    CounterIncr,
    /// `_instruction_counter.incr(W) && ` prefixed to an expression. `incr`
    /// returns truthy, so the original expression's value flows through.
    InnerCounterIncr,
    /// Opening `{` of a synthesized block, absorbing any weight that resolves
    /// to the wrapped statement's start.
    BlockStatementBegin,
    /// Closing `}` of a synthesized block.
    BlockStatementEnd,
}

#[derive(Debug)]
struct InjectionRecord {
    weight: u64,
    emitter: Emitter,
    /// Brace multiplicity for the block guardrails. Nested bare bodies end at
    /// the same byte offset, and each wrap still has to close its own block.
    braces: u32,
}

impl InjectionRecord {
    fn render(&self, out: &mut String) {
        match self.emitter {
            Emitter::CounterIncr => {
                let _ = write!(out, "{COUNTER_IDENT}.incr({});", self.weight);
            }
            Emitter::InnerCounterIncr => {
                let _ = write!(out, "{COUNTER_IDENT}.incr({}) && ", self.weight);
            }
            Emitter::BlockStatementBegin => {
                for _ in 0..self.braces {
                    out.push('{');
                }
                if self.weight > 0 {
                    let _ = write!(out, "{COUNTER_IDENT}.incr({});", self.weight);
                }
            }
            Emitter::BlockStatementEnd => {
                if self.weight > 0 {
                    let _ = write!(out, "{COUNTER_IDENT}.incr({});", self.weight);
                }
                for _ in 0..self.braces {
                    out.push('}');
                }
            }
        }
    }
}

/// Accumulated injection records, keyed by byte offset into the source.
///
/// Contributions at the same offset coalesce: weights sum, the emitter stays
/// as first written, and repeated block guardrails of the same kind bump the
/// brace multiplicity.
#[derive(Debug, Default)]
struct InjectionStore {
    records: BTreeMap<u32, InjectionRecord>,
}

impl InjectionStore {
    fn insert_or_add(&mut self, pos: u32, weight: u64, emitter: Emitter) {
        match self.records.entry(pos) {
            Entry::Occupied(mut e) => {
                let rec = e.get_mut();
                rec.weight += weight;
                if rec.emitter == emitter
                    && matches!(
                        emitter,
                        Emitter::BlockStatementBegin | Emitter::BlockStatementEnd
                    )
                {
                    rec.braces += 1;
                }
            }
            Entry::Vacant(e) => {
                e.insert(InjectionRecord {
                    weight,
                    emitter,
                    braces: 1,
                });
            }
        }
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    /// Splice the emitter outputs into `source`, ascending by position.
    /// Pure insertion: every byte of `source` reappears, in order.
    fn splice(&self, source: &str) -> String {
        let mut out = String::with_capacity(source.len() + self.records.len() * 40);
        let mut cursor = 0usize;
        for (&pos, rec) in &self.records {
            let pos = pos as usize;
            out.push_str(&source[cursor..pos]);
            rec.render(&mut out);
            cursor = pos;
        }
        out.push_str(&source[cursor..]);
        out
    }
}

// -----------------------------------------------------------------------------
// Injection context
// -----------------------------------------------------------------------------

/// Where a control-flow parent wants counter weight from a child subtree to
/// land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InjectionKind {
    /// Statement-form increment at the target statement's start.
    BeforeNode,
    /// Statement-form increment just inside the target block.
    #[allow(dead_code)] // part of the injection vocabulary; no classifier rule emits it today
    AtBeginning,
    /// Expression-form `incr(W) && ` prefix at the target expression's start.
    InnerBeginning,
}

#[derive(Debug, Clone, Copy)]
struct InjectionCtx {
    pos: u32,
    kind: InjectionKind,
}

impl InjectionCtx {
    fn before_node(pos: u32) -> Self {
        Self {
            pos,
            kind: InjectionKind::BeforeNode,
        }
    }

    fn inner_beginning(pos: u32) -> Self {
        Self {
            pos,
            kind: InjectionKind::InnerBeginning,
        }
    }

    /// Increment statements land just after the `{` when the target is
    /// already a block.
    #[cfg(test)]
    fn at_beginning(target_pos: u32, target_is_block: bool) -> Self {
        Self {
            pos: if target_is_block {
                target_pos + 1
            } else {
                target_pos
            },
            kind: InjectionKind::AtBeginning,
        }
    }

    fn emitter(self) -> Emitter {
        match self.kind {
            InjectionKind::BeforeNode | InjectionKind::AtBeginning => Emitter::CounterIncr,
            InjectionKind::InnerBeginning => Emitter::InnerCounterIncr,
        }
    }
}

// -----------------------------------------------------------------------------
// Instrumentation visitor
// -----------------------------------------------------------------------------

struct InstrumentVisitor<'a> {
    cm: &'a SourceMap,
    /// Offset of the parsed file inside the global source map; spans are
    /// rebased against it to get byte offsets into the input string.
    base: BytePos,
    store: InjectionStore,
    /// Inherited injection contexts, innermost last. A control-flow parent
    /// pushes a context around the child it prescribes one for; everything
    /// else inherits the current top, including across nested function
    /// expressions.
    ctx: Vec<InjectionCtx>,
    /// Start offsets of enclosing injectable statements, innermost last.
    anchors: Vec<u32>,
    err: Option<TransformError>,
}

impl<'a> InstrumentVisitor<'a> {
    fn new(cm: &'a SourceMap, fm: &SourceFile) -> Self {
        Self {
            cm,
            base: fm.start_pos,
            store: InjectionStore::default(),
            ctx: Vec::new(),
            anchors: Vec::new(),
            err: None,
        }
    }

    fn off(&self, pos: BytePos) -> u32 {
        pos.0 - self.base.0
    }

    fn with_ctx<N: VisitWith<Self>>(&mut self, ctx: InjectionCtx, node: &N) {
        self.ctx.push(ctx);
        node.visit_with(self);
        self.ctx.pop();
    }

    fn descend_with_anchor<N: VisitWith<Self>>(&mut self, pos: u32, node: &N) {
        self.anchors.push(pos);
        node.visit_children_with(self);
        self.anchors.pop();
    }

    /// Charge one tracked construct, resolving the record position from the
    /// inherited context or, failing that, the nearest injectable statement.
    fn count_tracked(&mut self, span: Span) {
        if let Some(ctx) = self.ctx.last().copied() {
            self.store.insert_or_add(ctx.pos, TRACKED_WEIGHT, ctx.emitter());
        } else if let Some(&anchor) = self.anchors.last() {
            self.store
                .insert_or_add(anchor, TRACKED_WEIGHT, Emitter::CounterIncr);
        } else {
            // No statement start to hook onto, e.g. a default-parameter
            // initializer of a top-level function. Injecting at the node
            // itself would not parse; the node stays unmetered.
            debug!(
                offset = self.off(span.lo()),
                "tracked node outside any injectable statement"
            );
        }
    }

    /// Wrap a bare statement body in `{ ... }` so later injections cannot
    /// change its scoping. Zero-weight guardrails; tracked weight resolving
    /// to the body's start coalesces into the opening brace.
    fn ensure_block(&mut self, body: &Stmt) {
        if matches!(body, Stmt::Block(_)) {
            return;
        }
        let span = body.span();
        self.store
            .insert_or_add(self.off(span.lo()), 0, Emitter::BlockStatementBegin);
        self.store
            .insert_or_add(self.off(span.hi()), 0, Emitter::BlockStatementEnd);
    }

    fn check_reserved(&mut self, ident: &Ident) {
        if ident.sym.as_ref() != COUNTER_IDENT || self.err.is_some() {
            return;
        }
        let (line, col) = locate(self.cm, ident.span);
        self.err = Some(TransformError::ReservedIdentifier { line, col });
    }
}

impl<'a> Visit for InstrumentVisitor<'a> {
    // ---------- tracked expressions ----------

    fn visit_call_expr(&mut self, n: &CallExpr) {
        self.count_tracked(n.span);
        n.visit_children_with(self);
    }

    fn visit_new_expr(&mut self, n: &NewExpr) {
        self.count_tracked(n.span);
        n.visit_children_with(self);
    }

    fn visit_assign_expr(&mut self, n: &AssignExpr) {
        self.count_tracked(n.span);
        n.visit_children_with(self);
    }

    // Covers both arithmetic/relational and logical operators; swc folds
    // ESTree's LogicalExpression into BinExpr.
    fn visit_bin_expr(&mut self, n: &BinExpr) {
        self.count_tracked(n.span);
        n.visit_children_with(self);
    }

    fn visit_unary_expr(&mut self, n: &UnaryExpr) {
        self.count_tracked(n.span);
        n.visit_children_with(self);
    }

    fn visit_update_expr(&mut self, n: &UpdateExpr) {
        self.count_tracked(n.span);
        n.visit_children_with(self);
    }

    fn visit_member_expr(&mut self, n: &MemberExpr) {
        self.count_tracked(n.span);
        n.visit_children_with(self);
    }

    // `super.x` is a member access; swc gives it its own node type.
    fn visit_super_prop_expr(&mut self, n: &SuperPropExpr) {
        self.count_tracked(n.span);
        n.visit_children_with(self);
    }

    fn visit_cond_expr(&mut self, n: &CondExpr) {
        self.count_tracked(n.span);
        n.visit_children_with(self);
    }

    fn visit_yield_expr(&mut self, n: &YieldExpr) {
        self.count_tracked(n.span);
        n.visit_children_with(self);
    }

    fn visit_meta_prop_expr(&mut self, n: &MetaPropExpr) {
        self.count_tracked(n.span);
        n.visit_children_with(self);
    }

    // ---------- injectable statements ----------

    fn visit_expr_stmt(&mut self, n: &ExprStmt) {
        let pos = self.off(n.span.lo());
        self.descend_with_anchor(pos, n);
    }

    fn visit_var_decl(&mut self, n: &VarDecl) {
        let pos = self.off(n.span.lo());
        self.descend_with_anchor(pos, n);
    }

    fn visit_return_stmt(&mut self, n: &ReturnStmt) {
        let pos = self.off(n.span.lo());
        self.descend_with_anchor(pos, n);
    }

    // Both tracked and injectable: the throw itself and any tracked nodes in
    // its argument land at the statement's start.
    fn visit_throw_stmt(&mut self, n: &ThrowStmt) {
        let pos = self.off(n.span.lo());
        self.anchors.push(pos);
        self.count_tracked(n.span);
        n.visit_children_with(self);
        self.anchors.pop();
    }

    // ---------- control flow ----------

    fn visit_if_stmt(&mut self, n: &IfStmt) {
        self.ensure_block(&n.cons);
        if let Some(alt) = &n.alt {
            self.ensure_block(alt);
        }
        let test_pos = self.off(n.test.span().lo());
        self.with_ctx(InjectionCtx::inner_beginning(test_pos), &*n.test);
        n.cons.visit_with(self);
        if let Some(alt) = &n.alt {
            alt.visit_with(self);
        }
    }

    fn visit_for_stmt(&mut self, n: &ForStmt) {
        self.ensure_block(&n.body);
        let stmt_pos = self.off(n.span.lo());
        if let Some(init) = &n.init {
            self.with_ctx(InjectionCtx::before_node(stmt_pos), init);
        }
        if let Some(test) = &n.test {
            let pos = self.off(test.span().lo());
            self.with_ctx(InjectionCtx::inner_beginning(pos), &**test);
        }
        if let Some(update) = &n.update {
            let pos = self.off(update.span().lo());
            self.with_ctx(InjectionCtx::inner_beginning(pos), &**update);
        }
        n.body.visit_with(self);
    }

    fn visit_for_in_stmt(&mut self, n: &ForInStmt) {
        self.ensure_block(&n.body);
        let stmt_pos = self.off(n.span.lo());
        self.with_ctx(InjectionCtx::before_node(stmt_pos), &n.left);
        self.with_ctx(InjectionCtx::before_node(stmt_pos), &*n.right);
        n.body.visit_with(self);
    }

    fn visit_for_of_stmt(&mut self, n: &ForOfStmt) {
        self.ensure_block(&n.body);
        let stmt_pos = self.off(n.span.lo());
        self.with_ctx(InjectionCtx::before_node(stmt_pos), &n.left);
        self.with_ctx(InjectionCtx::before_node(stmt_pos), &*n.right);
        n.body.visit_with(self);
    }

    fn visit_while_stmt(&mut self, n: &WhileStmt) {
        self.ensure_block(&n.body);
        let test_pos = self.off(n.test.span().lo());
        self.with_ctx(InjectionCtx::inner_beginning(test_pos), &*n.test);
        n.body.visit_with(self);
    }

    fn visit_do_while_stmt(&mut self, n: &DoWhileStmt) {
        self.ensure_block(&n.body);
        let test_pos = self.off(n.test.span().lo());
        self.with_ctx(InjectionCtx::inner_beginning(test_pos), &*n.test);
        n.body.visit_with(self);
    }

    fn visit_with_stmt(&mut self, n: &WithStmt) {
        self.ensure_block(&n.body);
        let stmt_pos = self.off(n.span.lo());
        self.with_ctx(InjectionCtx::before_node(stmt_pos), &*n.obj);
        n.body.visit_with(self);
    }

    fn visit_switch_stmt(&mut self, n: &SwitchStmt) {
        let stmt_pos = self.off(n.span.lo());
        self.with_ctx(InjectionCtx::before_node(stmt_pos), &*n.discriminant);
        n.cases.visit_with(self);
    }

    // ---------- reserved identifier guardrail ----------

    fn visit_var_declarator(&mut self, n: &VarDeclarator) {
        if let Some(name) = n.name.as_ident() {
            self.check_reserved(&name.id);
        }
        n.visit_children_with(self);
    }

    fn visit_fn_decl(&mut self, n: &FnDecl) {
        self.check_reserved(&n.ident);
        n.visit_children_with(self);
    }

    fn visit_fn_expr(&mut self, n: &FnExpr) {
        if let Some(ident) = &n.ident {
            self.check_reserved(ident);
        }
        n.visit_children_with(self);
    }

    // Catches simple parameters of every non-arrow function, including class
    // methods, which ESTree models as function expressions.
    fn visit_function(&mut self, n: &Function) {
        for param in &n.params {
            if let Pat::Ident(binding) = &param.pat {
                self.check_reserved(&binding.id);
            }
        }
        n.visit_children_with(self);
    }

    fn visit_constructor(&mut self, n: &Constructor) {
        for param in &n.params {
            if let ParamOrTsParamProp::Param(param) = param {
                if let Pat::Ident(binding) = &param.pat {
                    self.check_reserved(&binding.id);
                }
            }
        }
        n.visit_children_with(self);
    }
}

// -----------------------------------------------------------------------------
// Entry points
// -----------------------------------------------------------------------------

/// Instrument `source` so that every execution path reports its
/// tracked-operation count through `_instruction_counter.incr`.
///
/// The output minus the inserted counter calls and synthesized block braces
/// is byte-identical to the input. Fails with [`TransformError::Parse`] on
/// invalid input and [`TransformError::ReservedIdentifier`] when the input
/// tries to rebind the counter; no partial output is returned.
pub fn transform(source: &str) -> Result<String, TransformError> {
    let (cm, fm, script) = parse_source(source)?;
    let mut visitor = InstrumentVisitor::new(&cm, &fm);
    script.visit_with(&mut visitor);
    if let Some(err) = visitor.err {
        return Err(err);
    }
    debug!(records = visitor.store.len(), "script instrumented");
    Ok(visitor.store.splice(source))
}

/// Parse `source` as an ECMAScript 2016 script without instrumenting it.
pub fn parse(source: &str) -> Result<Script, TransformError> {
    parse_source(source).map(|(_, _, script)| script)
}

fn parse_source(source: &str) -> Result<(Lrc<SourceMap>, Lrc<SourceFile>, Script), TransformError> {
    let cm: Lrc<SourceMap> = Default::default();
    let fm = cm.new_source_file(FileName::Anon.into(), source.to_string());
    let lexer = Lexer::new(
        Syntax::Es(EsSyntax::default()),
        EsVersion::Es2016,
        StringInput::from(&*fm),
        None,
    );
    let mut parser = Parser::new_from(lexer);
    let script = match parser.parse_script() {
        Ok(script) => script,
        Err(err) => return Err(TransformError::from_parser(&cm, err)),
    };
    // Recovered diagnostics are just as fatal; no instrumentation of
    // almost-valid input.
    if let Some(err) = parser.take_errors().into_iter().next() {
        return Err(TransformError::from_parser(&cm, err));
    }
    Ok((cm, fm, script))
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
