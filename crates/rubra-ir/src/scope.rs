//! Scope table and the manager that owns it.
//!
//! Scopes form a lexical tree; each one carries its own label counter,
//! nested-closure list, inferred flags, and (once built) its finished
//! [`InterpreterContext`]. The manager also interns names and collects
//! build-time warnings.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::{
    ArgumentDescriptor, Instr, InterpreterContext, Label, ScopeFlags, ScopeId, Sym,
};

/// Lexical flavour of a scope. Most lowering decisions key off this.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeKind {
    Script,
    ModuleBody,
    ClassBody,
    MetaClassBody,
    Method { instance_method: bool },
    Closure,
    For,
    Eval,
}

impl ScopeKind {
    /// Closures, for-loop bodies, and evals share their enclosing frame.
    pub fn is_closure_like(self) -> bool {
        matches!(self, ScopeKind::Closure | ScopeKind::For | ScopeKind::Eval)
    }

    pub fn is_module_body(self) -> bool {
        matches!(
            self,
            ScopeKind::ModuleBody | ScopeKind::ClassBody | ScopeKind::MetaClassBody
        )
    }

    /// Class and module bodies excluding singleton-class bodies; these are
    /// the scopes that can declare class variables directly.
    pub fn is_non_singleton_class_body(self) -> bool {
        matches!(self, ScopeKind::ModuleBody | ScopeKind::ClassBody)
    }

    pub fn is_method(self) -> bool {
        matches!(self, ScopeKind::Method { .. })
    }
}

#[derive(Clone, Debug)]
pub struct Scope {
    pub id: ScopeId,
    pub kind: ScopeKind,
    pub name: Sym,
    pub file: String,
    pub line: u32,
    pub lexical_parent: Option<ScopeId>,
    pub closures: Vec<ScopeId>,
    pub flags: ScopeFlags,
    pub argument_descriptors: Vec<ArgumentDescriptor>,
    pub context: Option<InterpreterContext>,
    /// Set for closures lowered from `END { ... }` blocks.
    pub is_end_block: bool,
    next_label: u32,
}

impl Scope {
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }
}

/// Names the flag inference and the builder test against without going
/// through the interner each time.
#[derive(Clone, Copy, Debug)]
pub struct WellKnownSyms {
    pub eval: Sym,
    pub module_eval: Sym,
    pub class_eval: Sym,
    pub instance_eval: Sym,
    pub binding: Sym,
    pub define_method: Sym,
    pub define_singleton_method: Sym,
    pub using: Sym,
    pub refine: Sym,
    /// Placeholder hash key standing in for `**rest` in replayed
    /// zsuper keyword arguments.
    pub kw_rest_dummy: Sym,
}

impl WellKnownSyms {
    pub fn is_eval_name(&self, name: Sym) -> bool {
        name == self.eval
            || name == self.module_eval
            || name == self.class_eval
            || name == self.instance_eval
    }
}

/// A non-fatal diagnostic produced while lowering.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Warning {
    pub file: String,
    pub line: u32,
    pub message: String,
}

#[derive(Default)]
struct Interner {
    map: HashMap<String, Sym>,
    names: Vec<String>,
}

impl Interner {
    fn intern(&mut self, name: &str) -> Sym {
        if let Some(sym) = self.map.get(name) {
            return *sym;
        }
        let sym = Sym(self.names.len() as u32);
        self.names.push(name.to_owned());
        self.map.insert(name.to_owned(), sym);
        sym
    }
}

/// Callback invoked for every instruction appended to a scope.
pub type InstrListener = Box<dyn FnMut(ScopeId, &Instr, usize)>;

/// Owner of the scope table, the name interner, and build diagnostics.
///
/// Builders hold a shared reference and go through the `with_scope`
/// accessors; borrows of the table are scoped to single calls so nested
/// builders for child scopes can run while a parent build is on the
/// stack.
pub struct IrManager {
    scopes: RefCell<Vec<Scope>>,
    interner: RefCell<Interner>,
    warnings: RefCell<Vec<Warning>>,
    listener: RefCell<Option<InstrListener>>,
    well_known: WellKnownSyms,
}

impl Default for IrManager {
    fn default() -> Self {
        Self::new()
    }
}

impl IrManager {
    pub fn new() -> IrManager {
        let mut interner = Interner::default();
        let well_known = WellKnownSyms {
            eval: interner.intern("eval"),
            module_eval: interner.intern("module_eval"),
            class_eval: interner.intern("class_eval"),
            instance_eval: interner.intern("instance_eval"),
            binding: interner.intern("binding"),
            define_method: interner.intern("define_method"),
            define_singleton_method: interner.intern("define_singleton_method"),
            using: interner.intern("using"),
            refine: interner.intern("refine"),
            kw_rest_dummy: interner.intern("__kwrest__"),
        };
        IrManager {
            scopes: RefCell::new(Vec::new()),
            interner: RefCell::new(interner),
            warnings: RefCell::new(Vec::new()),
            listener: RefCell::new(None),
            well_known,
        }
    }

    pub fn intern(&self, name: &str) -> Sym {
        self.interner.borrow_mut().intern(name)
    }

    pub fn sym_name(&self, sym: Sym) -> String {
        self.interner.borrow().names[sym.0 as usize].clone()
    }

    pub fn well_known(&self) -> WellKnownSyms {
        self.well_known
    }

    pub fn new_scope(
        &self,
        kind: ScopeKind,
        name: Sym,
        file: &str,
        line: u32,
        lexical_parent: Option<ScopeId>,
    ) -> ScopeId {
        let mut scopes = self.scopes.borrow_mut();
        let id = ScopeId(scopes.len() as u32);
        scopes.push(Scope {
            id,
            kind,
            name,
            file: file.to_owned(),
            line,
            lexical_parent,
            closures: Vec::new(),
            flags: ScopeFlags::default(),
            argument_descriptors: Vec::new(),
            context: None,
            is_end_block: false,
            next_label: 0,
        });
        id
    }

    pub fn scope_count(&self) -> usize {
        self.scopes.borrow().len()
    }

    pub fn with_scope<R>(&self, id: ScopeId, f: impl FnOnce(&Scope) -> R) -> R {
        f(&self.scopes.borrow()[id.0 as usize])
    }

    pub fn with_scope_mut<R>(&self, id: ScopeId, f: impl FnOnce(&mut Scope) -> R) -> R {
        f(&mut self.scopes.borrow_mut()[id.0 as usize])
    }

    pub fn kind(&self, id: ScopeId) -> ScopeKind {
        self.with_scope(id, |s| s.kind)
    }

    pub fn lexical_parent(&self, id: ScopeId) -> Option<ScopeId> {
        self.with_scope(id, |s| s.lexical_parent)
    }

    pub fn scope_name(&self, id: ScopeId) -> Sym {
        self.with_scope(id, |s| s.name)
    }

    pub fn scope_file(&self, id: ScopeId) -> String {
        self.with_scope(id, |s| s.file.clone())
    }

    pub fn flags(&self, id: ScopeId) -> ScopeFlags {
        self.with_scope(id, |s| s.flags)
    }

    pub fn set_flags(&self, id: ScopeId, flags: ScopeFlags) {
        self.with_scope_mut(id, |s| s.flags = flags)
    }

    pub fn set_flag(&self, id: ScopeId, flag: ScopeFlags) {
        self.with_scope_mut(id, |s| s.flags.set(flag))
    }

    pub fn new_label(&self, id: ScopeId) -> Label {
        self.with_scope_mut(id, |s| s.new_label())
    }

    pub fn add_closure(&self, parent: ScopeId, child: ScopeId) {
        self.with_scope_mut(parent, |s| s.closures.push(child))
    }

    pub fn closures(&self, id: ScopeId) -> Vec<ScopeId> {
        self.with_scope(id, |s| s.closures.clone())
    }

    pub fn set_context(&self, id: ScopeId, context: InterpreterContext) {
        self.with_scope_mut(id, |s| s.context = Some(context))
    }

    /// Instruction list of an already-built scope; used when a finished
    /// method's argument receives are replayed for zsuper.
    pub fn context_instructions(&self, id: ScopeId) -> Option<Vec<Instr>> {
        self.with_scope(id, |s| s.context.as_ref().map(|c| c.instructions.clone()))
    }

    pub fn set_argument_descriptors(&self, id: ScopeId, descriptors: Vec<ArgumentDescriptor>) {
        self.with_scope_mut(id, |s| s.argument_descriptors = descriptors)
    }

    pub fn mark_end_block(&self, id: ScopeId) {
        self.with_scope_mut(id, |s| s.is_end_block = true)
    }

    pub fn warn(&self, file: &str, line: u32, message: impl Into<String>) {
        self.warnings.borrow_mut().push(Warning {
            file: file.to_owned(),
            line,
            message: message.into(),
        });
    }

    pub fn take_warnings(&self) -> Vec<Warning> {
        std::mem::take(&mut *self.warnings.borrow_mut())
    }

    pub fn set_instr_listener(&self, listener: InstrListener) {
        *self.listener.borrow_mut() = Some(listener);
    }

    pub fn notify_instr_added(&self, scope: ScopeId, instr: &Instr, index: usize) {
        if let Some(listener) = self.listener.borrow_mut().as_mut() {
            listener(scope, instr, index);
        }
    }

    /// Nearest enclosing method scope, the scope itself included.
    pub fn nearest_method(&self, id: ScopeId) -> Option<ScopeId> {
        let mut cursor = Some(id);
        while let Some(s) = cursor {
            if self.kind(s).is_method() {
                return Some(s);
            }
            cursor = self.lexical_parent(s);
        }
        None
    }

    /// Lexical hops from this scope to the nearest module/class body,
    /// or `None` when the chain tops out without one.
    pub fn nearest_module_referencing_depth(&self, id: ScopeId) -> Option<u32> {
        let mut depth = 0u32;
        let mut cursor = Some(id);
        while let Some(s) = cursor {
            if self.kind(s).is_module_body() {
                return Some(depth);
            }
            depth += 1;
            cursor = self.lexical_parent(s);
        }
        None
    }

    /// Nearest scope that is not a block, for-body, or eval.
    pub fn nearest_non_closure_like(&self, id: ScopeId) -> ScopeId {
        let mut cursor = id;
        while self.kind(cursor).is_closure_like() {
            match self.lexical_parent(cursor) {
                Some(parent) => cursor = parent,
                None => return cursor,
            }
        }
        cursor
    }

    /// Nearest scope that owns a fresh local-variable table. Evals count;
    /// plain blocks and for-bodies do not.
    pub fn nearest_top_local_variable_scope(&self, id: ScopeId) -> ScopeId {
        let mut cursor = id;
        loop {
            let kind = self.kind(cursor);
            if !kind.is_closure_like() || kind == ScopeKind::Eval {
                return cursor;
            }
            match self.lexical_parent(cursor) {
                Some(parent) => cursor = parent,
                None => return cursor,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_chain() -> (IrManager, ScopeId, ScopeId, ScopeId, ScopeId) {
        let m = IrManager::new();
        let name = m.intern("t");
        let script = m.new_scope(ScopeKind::Script, name, "t.rb", 0, None);
        let class = m.new_scope(ScopeKind::ClassBody, name, "t.rb", 0, Some(script));
        let method = m.new_scope(
            ScopeKind::Method { instance_method: true },
            name,
            "t.rb",
            1,
            Some(class),
        );
        let block = m.new_scope(ScopeKind::Closure, name, "t.rb", 2, Some(method));
        (m, script, class, method, block)
    }

    #[test]
    fn interner_reuses_symbols() {
        let m = IrManager::new();
        assert_eq!(m.intern("foo"), m.intern("foo"));
        assert_ne!(m.intern("foo"), m.intern("bar"));
        assert_eq!(m.sym_name(m.intern("foo")), "foo");
    }

    #[test]
    fn labels_are_per_scope() {
        let (m, script, class, ..) = manager_with_chain();
        assert_eq!(m.new_label(script), Label(0));
        assert_eq!(m.new_label(script), Label(1));
        assert_eq!(m.new_label(class), Label(0));
    }

    #[test]
    fn nearest_method_walks_out_of_blocks() {
        let (m, script, _, method, block) = manager_with_chain();
        assert_eq!(m.nearest_method(block), Some(method));
        assert_eq!(m.nearest_method(method), Some(method));
        assert_eq!(m.nearest_method(script), None);
    }

    #[test]
    fn module_referencing_depth_counts_hops() {
        let (m, script, class, method, block) = manager_with_chain();
        assert_eq!(m.nearest_module_referencing_depth(class), Some(0));
        assert_eq!(m.nearest_module_referencing_depth(method), Some(1));
        assert_eq!(m.nearest_module_referencing_depth(block), Some(2));
        assert_eq!(m.nearest_module_referencing_depth(script), None);
    }

    #[test]
    fn listener_observes_appended_instructions() {
        let (m, script, ..) = manager_with_chain();
        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = seen.clone();
        m.set_instr_listener(Box::new(move |scope, _, index| {
            sink.borrow_mut().push((scope, index));
        }));
        m.notify_instr_added(script, &Instr::ReceiveSelf, 0);
        m.notify_instr_added(script, &Instr::Nop, 1);
        assert_eq!(*seen.borrow(), vec![(script, 0), (script, 1)]);
    }

    #[test]
    fn eval_is_a_top_local_variable_scope() {
        let (m, _, _, method, block) = manager_with_chain();
        let name = m.intern("e");
        let eval = m.new_scope(ScopeKind::Eval, name, "(eval)", 0, Some(block));
        assert_eq!(m.nearest_top_local_variable_scope(eval), eval);
        assert_eq!(m.nearest_top_local_variable_scope(block), method);
    }
}
