//! Semantic pass: builds the symbol tables, resolves names, and lowers bodies
//! into [`Command`] lists.
//!
//! A [`Session`] compiles one layer at a time. Each layer bumps the depth and
//! gets its own anonymous-scope pool; scripts, functions, globals and defines
//! redeclared by a later layer replace the earlier entry in place so ids stay
//! stable across the chain.

use std::collections::HashMap;

use super::ast::*;
use super::builtins::Builtins;
use super::error::CompileError;
use super::ir::*;
use super::lexer::lex;
use super::parser::parse_file;
use super::preprocess::{contains_word, evaluate, expand_define, replace_word};
use super::source::{SourceMap, SourcePos};
use super::symbols::*;

pub const MAIN: &str = "main";

/// Compile a chain of layers, base first.
pub fn compile(layers: &[&str], builtins: &Builtins) -> Result<CompilationUnit, CompileError> {
    let mut session = Session::new(builtins);
    for source in layers {
        session.compile_layer(source)?;
    }
    Ok(session.finish())
}

/// Running compilation state threaded through the layers of one chain.
pub struct Session<'b> {
    builtins: &'b Builtins,
    unit: CompilationUnit,
    entry_file: Option<String>,
}

impl<'b> Session<'b> {
    pub fn new(builtins: &'b Builtins) -> Self {
        Self {
            builtins,
            unit: CompilationUnit::default(),
            entry_file: None,
        }
    }

    /// Only honor `#out` and `#extends` written in the file named `name`.
    pub fn entry_file(mut self, name: &str) -> Self {
        self.entry_file = Some(name.to_string());
        self
    }

    /// Compile the next layer; returns its depth.
    pub fn compile_layer(&mut self, source: &str) -> Result<u32, CompileError> {
        let depth = self.unit.depth + 1;
        self.unit.depth = depth;
        self.unit.anonymous.insert(depth, Vec::new());

        let map = SourceMap::new(source);
        let tokens = lex(source).map_err(|e| CompileError::Lex {
            pos: map.position(Span::new(e.offset, e.offset + 1)),
            message: e.message,
        })?;
        let file = parse_file(tokens, source).map_err(|e| CompileError::Syntax {
            pos: map.position(e.span),
            found: e.found,
            message: e.message,
        })?;
        tracing::debug!(depth, items = file.items.len(), "compiling layer");

        let mut resolver = Resolver {
            builtins: self.builtins,
            unit: &mut self.unit,
            map: &map,
            entry_file: self.entry_file.as_deref(),
            depth,
            frames: Vec::new(),
            params: Vec::new(),
            macro_site: None,
        };
        resolver.run(&file)?;

        tracing::debug!(
            depth,
            functions = self.unit.functions.len(),
            scripts = self.unit.scripts.len(),
            anonymous = self.unit.anonymous_scopes(depth).len(),
            "layer resolved"
        );
        Ok(depth)
    }

    pub fn unit(&self) -> &CompilationUnit {
        &self.unit
    }

    pub fn finish(self) -> CompilationUnit {
        self.unit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Global,
    Function,
    Script,
    Define,
}

/// A scope whose body is currently being lowered.
struct Frame {
    id: ScopeId,
    scope: Scope,
}

struct Resolver<'a> {
    builtins: &'a Builtins,
    unit: &'a mut CompilationUnit,
    map: &'a SourceMap,
    entry_file: Option<&'a str>,
    depth: u32,
    frames: Vec<Frame>,
    /// Params of the callable whose body is being lowered.
    params: Vec<Identifier>,
    /// Use site of the define body currently being lowered.
    macro_site: Option<SourcePos>,
}

impl Resolver<'_> {
    fn pos(&self, span: Span) -> SourcePos {
        match &self.macro_site {
            Some(site) => site.clone(),
            None => self.map.position(span),
        }
    }

    /// Layer directives only count in the entry file; elsewhere they are ignored.
    fn in_entry_file(&self, directive: &str, span: Span) -> bool {
        let Some(entry) = self.entry_file else {
            return true;
        };
        let pos = self.map.position(span);
        let owned = std::path::Path::new(&pos.file)
            .file_name()
            .is_some_and(|name| name == entry);
        if !owned {
            tracing::warn!(%pos, directive, entry, "directive outside the entry file, ignoring");
        }
        owned
    }

    fn run(&mut self, file: &File) -> Result<(), CompileError> {
        let mut layer = LayerInfo {
            depth: self.depth,
            files: self.map.files().to_vec(),
            ..LayerInfo::default()
        };
        let mut function_bodies: HashMap<&str, &Block> = HashMap::new();
        let mut script_bodies: HashMap<&str, &Block> = HashMap::new();
        let mut main_body = None;

        for item in &file.items {
            match item {
                // Positions come from the source map.
                Item::FileMarker { .. } => {}
                Item::Out { path, span } => {
                    if self.in_entry_file("#out", *span) {
                        layer.out.get_or_insert_with(|| path.clone());
                    }
                }
                Item::Extends { path, span } => {
                    if self.in_entry_file("#extends", *span) {
                        layer.extends.get_or_insert_with(|| path.clone());
                    }
                }
                Item::Global { name, span } => self.declare_global(name, *span)?,
                Item::Define(def) => self.declare_define(def)?,
                Item::Script(def) => {
                    self.declare_script(def)?;
                    if def.name == MAIN {
                        main_body = Some(&def.body);
                    } else {
                        script_bodies.insert(def.name.as_str(), &def.body);
                    }
                }
                Item::Function(def) => {
                    self.declare_function(def)?;
                    function_bodies.insert(def.name.as_str(), &def.body);
                }
            }
        }
        self.unit.layers.retain(|l| l.depth != self.depth);
        self.unit.layers.push(layer);

        if self.unit.main.is_none() {
            return Err(CompileError::MissingMain);
        }

        // A later layer may have redefined something an earlier body mentions.
        for define in self.unit.defines.values_mut() {
            define.expanded = None;
            define.node = None;
        }
        for index in 0..self.unit.defines.len() {
            if self.unit.defines[index].expanded.is_none() {
                expand_define(&mut self.unit.defines, index, 0)?;
            }
        }

        let functions: Vec<String> = self
            .unit
            .functions
            .iter()
            .filter(|(_, c)| c.depth == self.depth)
            .map(|(name, _)| name.clone())
            .collect();
        for name in functions {
            if let Some(block) = function_bodies.get(name.as_str()) {
                let owner = Owner {
                    kind: CallableKind::Function,
                    name: name.clone(),
                };
                let id = self.resolve_body(owner, block)?;
                if let Some(f) = self.unit.functions.get_mut(&name) {
                    f.body = Some(id);
                }
            }
        }

        let scripts: Vec<String> = self
            .unit
            .scripts
            .iter()
            .filter(|(_, c)| c.depth == self.depth)
            .map(|(name, _)| name.clone())
            .collect();
        for name in scripts {
            if let Some(block) = script_bodies.get(name.as_str()) {
                let owner = Owner {
                    kind: CallableKind::Script,
                    name: name.clone(),
                };
                let id = self.resolve_body(owner, block)?;
                if let Some(s) = self.unit.scripts.get_mut(&name) {
                    s.body = Some(id);
                }
            }
        }

        if let Some(block) = main_body {
            let owner = Owner {
                kind: CallableKind::Main,
                name: MAIN.to_string(),
            };
            let id = self.resolve_body(owner, block)?;
            if let Some(main) = self.unit.main.as_mut() {
                main.body = Some(id);
            }
        }
        Ok(())
    }

    // ── Declarations ────────────────────────────────────────────────

    /// Top-level identifier called `name`, ignoring the `skip` table.
    fn declared(&self, name: &str, skip: Option<Table>) -> Option<&Identifier> {
        let unit = &*self.unit;
        let main = unit.main.as_ref().filter(|m| m.ident.name == name);
        [
            (Table::Global, unit.globals.get(name).map(|g| &g.ident)),
            (Table::Function, unit.functions.get(name).map(|c| &c.ident)),
            (
                Table::Script,
                unit.scripts.get(name).or(main).map(|c| &c.ident),
            ),
            (Table::Define, unit.defines.get(name).map(|d| &d.ident)),
        ]
        .into_iter()
        .filter(|(table, _)| Some(*table) != skip)
        .find_map(|(_, ident)| ident)
    }

    fn duplicate(&self, name: &str, pos: SourcePos, existing: &Identifier) -> CompileError {
        CompileError::DuplicateIdentifier {
            pos,
            name: name.to_string(),
            existing: existing.pos.clone(),
        }
    }

    fn check_reserved(&self, name: &str, pos: &SourcePos) -> Result<(), CompileError> {
        let kind = if self.builtins.command(name).is_some() {
            "command"
        } else if self.builtins.global(name).is_some() {
            "global"
        } else {
            return Ok(());
        };
        Err(CompileError::ReservedName {
            pos: pos.clone(),
            name: name.to_string(),
            kind,
        })
    }

    fn declare_global(&mut self, name: &str, span: Span) -> Result<(), CompileError> {
        let pos = self.pos(span);
        if let Some(existing) = self.declared(name, Some(Table::Global)) {
            return Err(self.duplicate(name, pos, existing));
        }
        self.check_reserved(name, &pos)?;
        if let Some(existing) = self.unit.globals.get(name) {
            if existing.depth == self.depth {
                return Err(self.duplicate(name, pos, &existing.ident));
            }
            // Redeclared by a derived layer: same slot.
            return Ok(());
        }
        self.unit.globals.insert(
            name.to_string(),
            GlobalVar {
                ident: Identifier {
                    kind: IdentKind::Global,
                    name: name.to_string(),
                    pos,
                },
                depth: self.depth,
            },
        );
        Ok(())
    }

    fn declare_define(&mut self, def: &DefineDef) -> Result<(), CompileError> {
        let pos = self.pos(def.name_span);
        if let Some(existing) = self.declared(&def.name, Some(Table::Define)) {
            return Err(self.duplicate(&def.name, pos, existing));
        }
        self.check_reserved(&def.name, &pos)?;
        if let Some(existing) = self.unit.defines.get(&def.name) {
            if existing.depth == self.depth {
                return Err(self.duplicate(&def.name, pos, &existing.ident));
            }
        }
        self.unit.defines.insert(
            def.name.clone(),
            Define {
                ident: Identifier {
                    kind: IdentKind::Define,
                    name: def.name.clone(),
                    pos,
                },
                depth: self.depth,
                offset: def.span.start,
                text: def.text.clone(),
                expanded: None,
                node: None,
            },
        );
        Ok(())
    }

    fn declare_params(&self, def: &CallableDef) -> Result<(Vec<Identifier>, u8), CompileError> {
        let mut params: Vec<Identifier> = Vec::with_capacity(def.params.len());
        for param in &def.params {
            let pos = self.pos(param.span);
            let existing = self
                .declared(&param.name, None)
                .or_else(|| params.iter().find(|p| p.name == param.name));
            if let Some(existing) = existing {
                return Err(self.duplicate(&param.name, pos, existing));
            }
            if self.builtins.global(&param.name).is_some() {
                return Err(CompileError::ReservedName {
                    pos,
                    name: param.name.clone(),
                    kind: "global",
                });
            }
            params.push(Identifier {
                kind: IdentKind::Arg,
                name: param.name.clone(),
                pos,
            });
        }
        let ref_count = u8::try_from(def.ref_count()).map_err(|_| CompileError::Limit {
            pos: self.pos(def.name_span),
            what: "parameters",
        })?;
        if params.len() > usize::from(u8::MAX) {
            return Err(CompileError::Limit {
                pos: self.pos(def.name_span),
                what: "parameters",
            });
        }
        Ok((params, ref_count))
    }

    fn declare_script(&mut self, def: &CallableDef) -> Result<(), CompileError> {
        let pos = self.pos(def.name_span);
        if let Some(existing) = self.declared(&def.name, Some(Table::Script)) {
            return Err(self.duplicate(&def.name, pos, existing));
        }
        self.check_reserved(&def.name, &pos)?;

        let existing = if def.name == MAIN {
            self.unit.main.as_ref()
        } else {
            self.unit.scripts.get(&def.name)
        };
        if let Some(existing) = existing.filter(|c| c.depth == self.depth) {
            return Err(self.duplicate(&def.name, pos, &existing.ident));
        }

        let (params, ref_count) = self.declare_params(def)?;
        let callable = Callable {
            ident: Identifier {
                kind: IdentKind::Script,
                name: def.name.clone(),
                pos,
            },
            depth: self.depth,
            params,
            ref_count,
            body: None,
        };
        if def.name == MAIN {
            self.unit.main = Some(callable);
        } else {
            self.unit.scripts.insert(def.name.clone(), callable);
        }
        Ok(())
    }

    fn declare_function(&mut self, def: &CallableDef) -> Result<(), CompileError> {
        let pos = self.pos(def.name_span);
        if def.name == MAIN {
            return Err(CompileError::ReservedName {
                pos,
                name: def.name.clone(),
                kind: "script",
            });
        }
        if let Some(existing) = self.declared(&def.name, Some(Table::Function)) {
            return Err(self.duplicate(&def.name, pos, existing));
        }
        self.check_reserved(&def.name, &pos)?;
        if let Some(existing) = self.unit.functions.get(&def.name) {
            if existing.depth == self.depth {
                return Err(self.duplicate(&def.name, pos, &existing.ident));
            }
        }

        let (params, ref_count) = self.declare_params(def)?;
        self.unit.functions.insert(
            def.name.clone(),
            Callable {
                ident: Identifier {
                    kind: IdentKind::Function,
                    name: def.name.clone(),
                    pos,
                },
                depth: self.depth,
                params,
                ref_count,
                body: None,
            },
        );
        Ok(())
    }

    // ── Scopes ──────────────────────────────────────────────────────

    fn frame(&mut self) -> &mut Scope {
        let last = self.frames.len() - 1;
        &mut self.frames[last].scope
    }

    fn emit(&mut self, name: &str, args: Vec<PassedArg>) {
        self.frame().commands.push(Command::new(name, args));
    }

    fn push_number(&mut self, value: f64, span: Span) -> Result<u16, CompileError> {
        let pos = self.pos(span);
        let numbers = &mut self.frame().numbers;
        numbers.push(value as f32);
        u16::try_from(numbers.len() - 1).map_err(|_| CompileError::Limit {
            pos,
            what: "numbers in one scope",
        })
    }

    fn push_string(&mut self, value: &str, span: Span) -> Result<u16, CompileError> {
        let pos = self.pos(span);
        let strings = &mut self.frame().strings;
        strings.push(value.to_string());
        u16::try_from(strings.len() - 1).map_err(|_| CompileError::Limit {
            pos,
            what: "strings in one scope",
        })
    }

    /// Reserve an arena slot for a scope nested in the current frame.
    fn alloc_scope(&mut self, owner: Owner) -> ScopeId {
        let id = ScopeId(self.unit.scopes.len());
        let parent = self.frames.last().map(|f| f.id);
        let scope_depth = self.frames.len() as u32 + 1;
        self.unit
            .scopes
            .push(Scope::new(self.depth, scope_depth, owner, parent));
        id
    }

    fn resolve_body(&mut self, owner: Owner, block: &Block) -> Result<ScopeId, CompileError> {
        self.params = self
            .unit
            .callable(&owner)
            .map(|c| c.params.clone())
            .unwrap_or_default();
        let id = self.alloc_scope(owner);
        self.resolve_scope(id, block, true)
    }

    /// Lower `block` into the reserved slot `id`.
    fn resolve_scope(&mut self, id: ScopeId, block: &Block, top_level: bool) -> Result<ScopeId, CompileError> {
        let scope = self.unit.scopes[id.0].clone();
        self.frames.push(Frame { id, scope });
        let result = block.stmts.iter().try_for_each(|stmt| self.resolve_stmt(stmt));
        if let Err(e) = result {
            self.frames.pop();
            return Err(e);
        }

        if top_level {
            self.emit(CMD_LOOPBACK, Vec::new());
        } else {
            let end = Span::new(block.span.end.saturating_sub(1), block.span.end);
            let zero = self.push_number(0.0, end)?;
            self.emit(
                CMD_RETURN,
                vec![PassedArg::Number(zero), PassedArg::Raw(CallType::Scope as u16)],
            );
        }
        if let Some(frame) = self.frames.pop() {
            self.unit.scopes[id.0] = frame.scope;
        }
        Ok(id)
    }

    /// Lower a control-flow body into this depth's anonymous pool; returns its pool id.
    fn resolve_anonymous(&mut self, block: &Block) -> Result<u16, CompileError> {
        let owner = self.frame().owner.clone();
        let id = self.alloc_scope(owner);
        let pool = self.unit.anonymous.entry(self.depth).or_default();
        pool.push(id);
        let anon = u16::try_from(pool.len() - 1).map_err(|_| CompileError::Limit {
            pos: self.pos(block.span),
            what: "anonymous scopes",
        })?;
        self.resolve_scope(id, block, false)?;
        Ok(anon)
    }

    fn visible_vars(&self) -> Vec<&Identifier> {
        let chain: Vec<&[Identifier]> = self
            .frames
            .iter()
            .map(|f| f.scope.variables.as_slice())
            .collect();
        chain_vars(&*self.unit, &self.params, &chain)
    }

    fn var_slot(&self, name: &str, span: Span) -> Result<Option<u16>, CompileError> {
        let Some(index) = self.visible_vars().iter().position(|v| v.name == name) else {
            return Ok(None);
        };
        u16::try_from(index).map(Some).map_err(|_| CompileError::Limit {
            pos: self.pos(span),
            what: "variables",
        })
    }

    fn visible_define(&self, name: &str, offset: usize) -> Option<usize> {
        self.unit
            .defines
            .get_full(name)
            .filter(|(_, _, d)| d.visible_from(self.depth, offset))
            .map(|(index, _, _)| index)
    }

    /// Anything a new local named `name` would collide with.
    fn visible_ident(&self, name: &str, offset: usize) -> Option<&Identifier> {
        if let Some(v) = self.visible_vars().into_iter().find(|v| v.name == name) {
            return Some(v);
        }
        if let Some(index) = self.visible_define(name, offset) {
            return Some(&self.unit.defines[index].ident);
        }
        self.declared(name, Some(Table::Define))
    }

    // ── Statements ──────────────────────────────────────────────────

    fn resolve_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Break(span) => {
                let zero = self.push_number(0.0, *span)?;
                self.emit(
                    CMD_RETURN,
                    vec![PassedArg::Number(zero), PassedArg::Raw(CallType::Loop as u16)],
                );
            }
            Stmt::Call(call) => {
                let resolved = self.resolve_call(call)?;
                match resolved.kind {
                    CallKind::Builtin => self.emit(&call.name, resolved.args),
                    CallKind::Function => self.emit(CMD_CALL_FN, vec![PassedArg::Call(resolved)]),
                    CallKind::Script => {
                        let name = if call.collapse { CMD_COLLAPSE } else { CMD_CALL_SCRIPT };
                        self.emit(name, vec![PassedArg::Call(resolved)]);
                    }
                }
            }
            Stmt::Let {
                name,
                name_span,
                value,
                ..
            } => {
                let value = self.resolve_expr(value)?;
                let pos = self.pos(*name_span);
                if let Some(existing) = self.visible_ident(name, name_span.start) {
                    return Err(self.duplicate(name, pos, existing));
                }
                if self.builtins.global(name).is_some() {
                    return Err(CompileError::ReservedName {
                        pos,
                        name: name.clone(),
                        kind: "variable",
                    });
                }
                self.frame().variables.push(Identifier {
                    kind: IdentKind::Variable,
                    name: name.clone(),
                    pos: pos.clone(),
                });
                let slot = u16::try_from(self.visible_vars().len() - 1)
                    .map_err(|_| CompileError::Limit { pos, what: "variables" })?;
                self.emit(CMD_CREATE_VARIABLE, vec![PassedArg::Raw(0)]);
                self.emit(CMD_SET_VARIABLE, vec![PassedArg::Variable(slot), value]);
            }
            Stmt::Assign {
                name,
                name_span,
                op,
                value,
                ..
            } => {
                let slot = self.var_slot(name, *name_span)?.ok_or_else(|| CompileError::IdentDne {
                    pos: self.pos(*name_span),
                    name: name.clone(),
                })?;
                let rhs = self.resolve_expr(value)?;
                let value = match op {
                    Some(op) => PassedArg::Expression(Box::new(Expression {
                        op: (*op).into(),
                        lhs: PassedArg::Variable(slot),
                        rhs: Some(rhs),
                    })),
                    None => rhs,
                };
                self.emit(CMD_SET_VARIABLE, vec![PassedArg::Variable(slot), value]);
            }
            Stmt::Return { value, span } => {
                let value = match value {
                    Some(e) => self.resolve_expr(e)?,
                    None => PassedArg::Number(self.push_number(0.0, *span)?),
                };
                self.emit(
                    CMD_RETURN,
                    vec![value, PassedArg::Raw(CallType::Function as u16)],
                );
            }
            Stmt::Loop { body, .. } => {
                let anon = self.resolve_anonymous(body)?;
                self.emit(CMD_LOOP, vec![PassedArg::Raw(anon)]);
            }
            Stmt::If {
                branches,
                else_body,
                ..
            } => {
                let mut args = Vec::new();
                for (i, (cond, body)) in branches.iter().enumerate() {
                    let tag = if i == 0 { Branch::If } else { Branch::Elif };
                    args.push(PassedArg::Raw(tag as u16));
                    args.push(self.resolve_expr(cond)?);
                    args.push(PassedArg::Raw(self.resolve_anonymous(body)?));
                }
                if let Some(body) = else_body {
                    args.push(PassedArg::Raw(Branch::Else as u16));
                    args.push(PassedArg::Raw(self.resolve_anonymous(body)?));
                }
                args.push(PassedArg::Raw(Branch::End as u16));
                self.emit(CMD_IF, args);
            }
            Stmt::Ident { name, span } => {
                return Err(CompileError::HangingIdentifier {
                    pos: self.pos(*span),
                    name: name.clone(),
                });
            }
        }
        Ok(())
    }

    // ── Calls & expressions ─────────────────────────────────────────

    fn resolve_call(&mut self, call: &CallExpr) -> Result<Call, CompileError> {
        let pos = self.pos(call.name_span);
        let (kind, id, arity, variadic, ref_count) =
            if let Some((index, _, c)) = self.unit.scripts.get_full(&call.name) {
                (CallKind::Script, index + 1, c.arg_count(), false, c.ref_count)
            } else if let Some((index, _, c)) = self.unit.functions.get_full(&call.name) {
                (CallKind::Function, index, c.arg_count(), false, c.ref_count)
            } else if let Some(cmd) = self.builtins.command(&call.name) {
                (CallKind::Builtin, usize::from(cmd.opcode), cmd.arity(), cmd.is_variadic(), 0)
            } else if let Some(main) = self.unit.main.as_ref().filter(|_| call.name == MAIN) {
                (CallKind::Script, 0, main.arg_count(), false, main.ref_count)
            } else {
                return Err(CompileError::CallDne {
                    pos,
                    name: call.name.clone(),
                });
            };
        let id = u16::try_from(id).map_err(|_| CompileError::Limit {
            pos: pos.clone(),
            what: "callables",
        })?;

        let args = call
            .args
            .iter()
            .map(|arg| self.resolve_arg(arg))
            .collect::<Result<Vec<_>, _>>()?;

        let arity_ok = if variadic {
            !args.is_empty()
        } else {
            args.len() == arity
        };
        if !arity_ok {
            return Err(CompileError::ArgCountMismatch {
                pos,
                name: call.name.clone(),
                given: args.len(),
                expected: if variadic { 1 } else { arity },
                at_least: variadic,
            });
        }

        for (index, arg) in args.iter().enumerate().take(usize::from(ref_count)) {
            if !arg.is_variable() {
                return Err(CompileError::RefArgMismatch {
                    pos: self.pos(call.args[index].span()),
                    name: call.name.clone(),
                    index,
                });
            }
        }

        Ok(Call {
            kind,
            id,
            name: call.name.clone(),
            args,
        })
    }

    fn resolve_arg(&mut self, arg: &Arg) -> Result<PassedArg, CompileError> {
        match arg {
            Arg::Expr(e) => self.resolve_expr(e),
            Arg::Str { value, span } => Ok(PassedArg::String(self.push_string(value, *span)?)),
        }
    }

    fn resolve_expr(&mut self, expr: &Expr) -> Result<PassedArg, CompileError> {
        match &expr.kind {
            ExprKind::Number(value) => Ok(PassedArg::Number(self.push_number(*value, expr.span)?)),
            ExprKind::Calc { text } => {
                let value = self.fold(text, expr.span)?;
                Ok(PassedArg::Number(self.push_number(value, expr.span)?))
            }
            ExprKind::Not(inner) => {
                let lhs = self.resolve_expr(inner)?;
                Ok(PassedArg::Expression(Box::new(Expression {
                    op: Operator::Not,
                    lhs,
                    rhs: None,
                })))
            }
            ExprKind::BinOp { op, left, right } => {
                let lhs = self.resolve_expr(left)?;
                let rhs = self.resolve_expr(right)?;
                Ok(PassedArg::Expression(Box::new(Expression {
                    op: (*op).into(),
                    lhs,
                    rhs: Some(rhs),
                })))
            }
            ExprKind::Call(call) => Ok(PassedArg::Call(self.resolve_call(call)?)),
            ExprKind::Ident { name, from_target } => self.resolve_ident(name, *from_target, expr.span),
        }
    }

    fn resolve_ident(&mut self, name: &str, from_target: bool, span: Span) -> Result<PassedArg, CompileError> {
        // Define bodies are fully expanded, so only look defines up outside them.
        if self.macro_site.is_none() {
            if let Some(index) = self.visible_define(name, span.start) {
                return self.resolve_define(index, span);
            }
        }
        if let Some(slot) = self.var_slot(name, span)? {
            return Ok(PassedArg::Variable(slot));
        }
        if let Some(id) = self.unit.script_id(name) {
            let id = u16::try_from(id).map_err(|_| CompileError::Limit {
                pos: self.pos(span),
                what: "scripts",
            })?;
            return Ok(PassedArg::Raw(id));
        }
        if let Some(global) = self.builtins.global(name) {
            return Ok(PassedArg::Global {
                slot: global.slot,
                relative: from_target,
            });
        }
        Err(CompileError::IdentDne {
            pos: self.pos(span),
            name: name.to_string(),
        })
    }

    /// Lower a define's parsed body in place of the identifier at `span`.
    fn resolve_define(&mut self, index: usize, span: Span) -> Result<PassedArg, CompileError> {
        if self.unit.defines[index].node.is_none() {
            expand_define(&mut self.unit.defines, index, 0)?;
        }
        let Some(node) = self.unit.defines[index].node.clone() else {
            return Err(CompileError::IdentDne {
                pos: self.pos(span),
                name: self.unit.defines[index].ident.name.clone(),
            });
        };
        let site = self.pos(span);
        self.macro_site = Some(site);
        let result = self.resolve_expr(&node);
        self.macro_site = None;
        result
    }

    /// Substitute visible defines into `#calc` text and evaluate it.
    fn fold(&self, text: &str, span: Span) -> Result<f64, CompileError> {
        let mut text = text.to_string();
        if self.macro_site.is_none() {
            for define in self.unit.defines.values() {
                if !define.visible_from(self.depth, span.start) || !contains_word(&text, &define.ident.name) {
                    continue;
                }
                if let Some(expanded) = &define.expanded {
                    text = replace_word(&text, &define.ident.name, expanded);
                }
            }
        }
        evaluate(&text).map_err(|message| CompileError::Eval {
            pos: self.pos(span),
            text,
            message,
        })
    }
}
