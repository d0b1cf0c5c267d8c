//! Symbol tables and the arena of lowered scopes that make up a compiled unit.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::Serialize;
use ts_rs::TS;

use super::ast::Expr;
use super::builtins::Builtins;
use super::ir::Command;
use super::source::{FileIdent, SourcePos};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
pub enum IdentKind {
    Global,
    Arg,
    Function,
    Script,
    Variable,
    Define,
}

/// A declared name and where it was declared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
pub struct Identifier {
    pub kind: IdentKind,
    pub name: String,
    pub pos: SourcePos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallableKind {
    Main,
    Script,
    Function,
}

/// The script or function a scope belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub kind: CallableKind,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Callable {
    pub ident: Identifier,
    pub depth: u32,
    pub params: Vec<Identifier>,
    /// Number of leading reference parameters.
    pub ref_count: u8,
    /// Set once the body has been resolved.
    pub body: Option<ScopeId>,
}

impl Callable {
    pub fn arg_count(&self) -> usize {
        self.params.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalVar {
    pub ident: Identifier,
    pub depth: u32,
}

#[derive(Debug, Clone)]
pub struct Define {
    pub ident: Identifier,
    pub depth: u32,
    /// Byte offset of the declaration within its layer's text.
    pub offset: usize,
    pub text: String,
    pub expanded: Option<String>,
    pub node: Option<Expr>,
}

impl Define {
    /// Whether code at `offset` in layer `depth` can see this define.
    pub fn visible_from(&self, depth: u32, offset: usize) -> bool {
        self.depth < depth || (self.depth == depth && self.offset < offset)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scope {
    pub depth: u32,
    /// Block nesting inside the owning body; the body itself is 1.
    pub scope_depth: u32,
    pub owner: Owner,
    pub parent: Option<ScopeId>,
    pub variables: Vec<Identifier>,
    pub commands: Vec<Command>,
    pub numbers: Vec<f32>,
    pub strings: Vec<String>,
}

impl Scope {
    pub fn new(depth: u32, scope_depth: u32, owner: Owner, parent: Option<ScopeId>) -> Self {
        Self {
            depth,
            scope_depth,
            owner,
            parent,
            variables: Vec::new(),
            commands: Vec::new(),
            numbers: Vec::new(),
            strings: Vec::new(),
        }
    }
}

/// Directives and files seen in one layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerInfo {
    pub depth: u32,
    pub out: Option<String>,
    pub extends: Option<String>,
    pub files: Vec<FileIdent>,
}

/// Everything one compilation produced. Ids are table positions: function id
/// is its index, script id is its index + 1 (0 is `main`).
#[derive(Debug, Clone, Default)]
pub struct CompilationUnit {
    pub(crate) depth: u32,
    pub(crate) globals: IndexMap<String, GlobalVar>,
    pub(crate) functions: IndexMap<String, Callable>,
    pub(crate) scripts: IndexMap<String, Callable>,
    pub(crate) main: Option<Callable>,
    pub(crate) defines: IndexMap<String, Define>,
    pub(crate) scopes: Vec<Scope>,
    pub(crate) anonymous: BTreeMap<u32, Vec<ScopeId>>,
    pub(crate) layers: Vec<LayerInfo>,
}

impl CompilationUnit {
    /// Depth of the most recently compiled layer.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn globals(&self) -> &IndexMap<String, GlobalVar> {
        &self.globals
    }

    pub fn functions(&self) -> &IndexMap<String, Callable> {
        &self.functions
    }

    pub fn scripts(&self) -> &IndexMap<String, Callable> {
        &self.scripts
    }

    pub fn main(&self) -> Option<&Callable> {
        self.main.as_ref()
    }

    pub fn defines(&self) -> &IndexMap<String, Define> {
        &self.defines
    }

    pub fn scope(&self, id: ScopeId) -> Option<&Scope> {
        self.scopes.get(id.0)
    }

    /// Anonymous control-flow scopes registered at `depth`, in id order.
    pub fn anonymous_scopes(&self, depth: u32) -> &[ScopeId] {
        self.anonymous.get(&depth).map_or(&[], Vec::as_slice)
    }

    pub fn layer(&self, depth: u32) -> Option<&LayerInfo> {
        self.layers.iter().find(|l| l.depth == depth)
    }

    pub fn callable(&self, owner: &Owner) -> Option<&Callable> {
        match owner.kind {
            CallableKind::Main => self.main.as_ref(),
            CallableKind::Script => self.scripts.get(&owner.name),
            CallableKind::Function => self.functions.get(&owner.name),
        }
    }

    /// Script id of `name`; `main` is always 0.
    pub fn script_id(&self, name: &str) -> Option<usize> {
        self.scripts.get_index_of(name).map(|i| i + 1)
    }

    /// Flat list of everything nameable, for completion.
    pub fn symbols(&self, builtins: &Builtins) -> Vec<Symbol> {
        let mut out: Vec<Symbol> = builtins
            .commands()
            .map(|c| Symbol {
                name: c.name.clone(),
                kind: SymbolKind::Command,
                detail: Some(format!("({})", c.params.join(", "))),
                pos: None,
            })
            .collect();
        out.extend(builtins.globals().map(|g| Symbol {
            name: g.name.clone(),
            kind: SymbolKind::BuiltinGlobal,
            detail: Some(format!("slot {}", g.slot)),
            pos: None,
        }));
        out.extend(self.defines.values().map(|d| Symbol {
            name: d.ident.name.clone(),
            kind: SymbolKind::Define,
            detail: Some(d.text.clone()),
            pos: Some(d.ident.pos.clone()),
        }));
        out.extend(self.globals.values().map(|g| Symbol::from_ident(&g.ident)));
        for callable in self.functions.values().chain(self.scripts.values()).chain(&self.main) {
            let params: Vec<_> = callable
                .params
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    if i < usize::from(callable.ref_count) {
                        format!("&{}", p.name)
                    } else {
                        p.name.clone()
                    }
                })
                .collect();
            out.push(Symbol {
                detail: Some(format!("({})", params.join(", "))),
                ..Symbol::from_ident(&callable.ident)
            });
        }
        out
    }

    /// [`Self::symbols`] plus the params and locals visible inside `scope`,
    /// each with its variable slot.
    pub fn symbols_in_scope(&self, builtins: &Builtins, scope: ScopeId) -> Vec<Symbol> {
        let mut out = self.symbols(builtins);
        out.extend(
            all_vars(self, scope)
                .into_iter()
                .enumerate()
                .skip(self.globals.len())
                .map(|(slot, ident)| Symbol {
                    detail: Some(format!("slot {slot}")),
                    ..Symbol::from_ident(ident)
                }),
        );
        out
    }

    /// Body scope of the script or function called `name`.
    pub fn body_of(&self, name: &str) -> Option<ScopeId> {
        self.functions
            .get(name)
            .or_else(|| self.scripts.get(name))
            .or_else(|| self.main.as_ref().filter(|m| m.ident.name == name))
            .and_then(|c| c.body)
    }

    /// Where `name` was declared, searching top-level tables before locals.
    pub fn find_definition(&self, name: &str) -> Option<&Identifier> {
        self.defines
            .get(name)
            .map(|d| &d.ident)
            .or_else(|| self.globals.get(name).map(|g| &g.ident))
            .or_else(|| self.functions.get(name).map(|c| &c.ident))
            .or_else(|| self.scripts.get(name).map(|c| &c.ident))
            .or_else(|| self.main.as_ref().filter(|m| m.ident.name == name).map(|m| &m.ident))
            .or_else(|| {
                self.functions
                    .values()
                    .chain(self.scripts.values())
                    .chain(&self.main)
                    .flat_map(|c| &c.params)
                    .find(|p| p.name == name)
            })
            .or_else(|| {
                self.scopes
                    .iter()
                    .flat_map(|s| &s.variables)
                    .find(|v| v.name == name)
            })
    }
}

/// Variables visible through a scope chain, in slot order: globals, then the
/// owner's params, then locals from the outermost scope inwards.
pub fn chain_vars<'a>(
    unit: &'a CompilationUnit,
    params: &'a [Identifier],
    chain: &[&'a [Identifier]],
) -> Vec<&'a Identifier> {
    unit.globals
        .values()
        .map(|g| &g.ident)
        .chain(params)
        .chain(chain.iter().flat_map(|vars| vars.iter()))
        .collect()
}

/// All variables visible in a resolved scope, in slot order.
pub fn all_vars(unit: &CompilationUnit, scope: ScopeId) -> Vec<&Identifier> {
    let mut chain = Vec::new();
    let mut owner = None;
    let mut cur = Some(scope);
    while let Some(id) = cur {
        let Some(s) = unit.scope(id) else { break };
        chain.push(s.variables.as_slice());
        owner = Some(&s.owner);
        cur = s.parent;
    }
    chain.reverse();
    let params = owner
        .and_then(|o| unit.callable(o))
        .map_or(&[][..], |c| c.params.as_slice());
    chain_vars(unit, params, &chain)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
pub enum SymbolKind {
    Command,
    BuiltinGlobal,
    Define,
    Global,
    Arg,
    Function,
    Script,
    Variable,
}

impl From<IdentKind> for SymbolKind {
    fn from(kind: IdentKind) -> Self {
        match kind {
            IdentKind::Global => SymbolKind::Global,
            IdentKind::Arg => SymbolKind::Arg,
            IdentKind::Function => SymbolKind::Function,
            IdentKind::Script => SymbolKind::Script,
            IdentKind::Variable => SymbolKind::Variable,
            IdentKind::Define => SymbolKind::Define,
        }
    }
}

/// One completion entry.
#[derive(Debug, Clone, PartialEq, Serialize, TS)]
#[ts(export)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub detail: Option<String>,
    /// `None` for builtins.
    pub pos: Option<SourcePos>,
}

impl Symbol {
    fn from_ident(ident: &Identifier) -> Self {
        Self {
            name: ident.name.clone(),
            kind: ident.kind.into(),
            detail: None,
            pos: Some(ident.pos.clone()),
        }
    }
}
