//! # Symbol and Package Registry
//!
//! Symbols are interned names with three independently settable slots
//! (value, function, structure) plus a property list. Packages are the
//! namespaces symbols live in: each package owns the symbols first interned
//! into it (their *home* package) and can use other packages, inheriting
//! their exported symbols during lookup.
//!
//! ## Lookup rules
//! [`find_symbol`] searches the package's own symbols first, then the
//! exported symbols of each used package in listed order. [`intern`] follows
//! the same search and creates a fresh symbol in the package only on a miss.
//!
//! The keyword package is special: interning there auto-exports the symbol
//! and binds its value slot to the symbol itself, so `:foo` always evaluates
//! to `:foo`.
//!
//! Packages hold strong references to their symbols; the symbol→home edge is
//! weak so the registry owns package lifetimes.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::value::Value;

/// An interned (or uninterned) name with settable value, function, and
/// structure slots.
#[derive(Debug)]
pub struct Symbol {
    name: Vec<u8>,
    /// Home package; empty for uninterned symbols.
    home: RefCell<Weak<Package>>,
    external: Cell<bool>,
    value: RefCell<Option<Value>>,
    function: RefCell<Option<Value>>,
    structure: RefCell<Option<Value>>,
    /// Property list association.
    pub plist: RefCell<Value>,
}

impl Symbol {
    /// Create an uninterned symbol with the given name and no home package.
    pub fn new(name: &[u8]) -> Rc<Symbol> {
        Rc::new(Symbol {
            name: name.to_vec(),
            home: RefCell::new(Weak::new()),
            external: Cell::new(false),
            value: RefCell::new(None),
            function: RefCell::new(None),
            structure: RefCell::new(None),
            plist: RefCell::new(Value::Nil),
        })
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// Lossy UTF-8 rendering of the name, for messages and printing.
    pub fn name_string(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    /// The home package, if this symbol is interned.
    pub fn home_package(&self) -> Option<Rc<Package>> {
        self.home.borrow().upgrade()
    }

    pub fn set_home_package(&self, package: &Rc<Package>) {
        *self.home.borrow_mut() = Rc::downgrade(package);
    }

    pub fn is_external(&self) -> bool {
        self.external.get()
    }

    /// Mark the symbol as externally visible from its home package.
    pub fn export(&self) {
        self.external.set(true);
    }

    pub fn value(&self) -> Option<Value> {
        self.value.borrow().clone()
    }

    pub fn function(&self) -> Option<Value> {
        self.function.borrow().clone()
    }

    pub fn structure(&self) -> Option<Value> {
        self.structure.borrow().clone()
    }

    /// Set the value slot, flipping its is-set flag.
    pub fn set_value(&self, v: Value) {
        *self.value.borrow_mut() = Some(v);
    }

    /// Set the function slot, flipping its is-set flag.
    pub fn set_function(&self, v: Value) {
        *self.function.borrow_mut() = Some(v);
    }

    /// Set the structure slot, flipping its is-set flag.
    pub fn set_structure(&self, v: Value) {
        *self.structure.borrow_mut() = Some(v);
    }

    /// `package:name` (or `package::name` for internal symbols), used in
    /// error messages.
    pub fn qualified_name(&self) -> String {
        match self.home_package() {
            Some(p) => {
                let sep = if self.is_external() { ":" } else { "::" };
                format!("{}{}{}", p.name_string(), sep, self.name_string())
            }
            None => format!("#:{}", self.name_string()),
        }
    }
}

/// A namespace of symbols, with a search path of used packages.
#[derive(Debug)]
pub struct Package {
    name: Vec<u8>,
    symbols: RefCell<Vec<Rc<Symbol>>>,
    uses: RefCell<Vec<Rc<Package>>>,
}

impl Package {
    pub fn new(name: &str, uses: Vec<Rc<Package>>) -> Rc<Package> {
        Rc::new(Package {
            name: name.as_bytes().to_vec(),
            symbols: RefCell::new(Vec::new()),
            uses: RefCell::new(uses),
        })
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn name_string(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    /// Keyword-package interning auto-exports and self-binds symbols.
    pub fn is_keyword(&self) -> bool {
        self.name == b"keyword"
    }

    /// Snapshot of the interned symbols, in interning order.
    pub fn symbols(&self) -> Vec<Rc<Symbol>> {
        self.symbols.borrow().clone()
    }

    /// Add a package to the inherited-symbol search path.
    pub fn add_use(&self, package: Rc<Package>) {
        let mut uses = self.uses.borrow_mut();
        if !uses.iter().any(|p| Rc::ptr_eq(p, &package)) {
            uses.push(package);
        }
    }
}

/// Find a symbol by name: the package's own symbols first, then the
/// exported symbols of each used package in listed order. With
/// `include_internal` false, only the package's own external symbols match.
pub fn find_symbol(name: &[u8], package: &Rc<Package>, include_internal: bool) -> Option<Rc<Symbol>> {
    if include_internal {
        for sym in package.symbols.borrow().iter() {
            if sym.name() == name {
                return Some(sym.clone());
            }
        }
        for used in package.uses.borrow().iter() {
            if let Some(sym) = find_symbol(name, used, false) {
                return Some(sym);
            }
        }
    } else {
        for sym in package.symbols.borrow().iter() {
            if sym.is_external() && sym.name() == name {
                return Some(sym.clone());
            }
        }
    }
    None
}

/// Find-or-create a symbol in a package.
///
/// The search honors used packages, so interning a name that a used package
/// exports returns the inherited symbol rather than shadowing it.
pub fn intern(name: &[u8], package: &Rc<Package>) -> Rc<Symbol> {
    if let Some(sym) = find_symbol(name, package, true) {
        return sym;
    }
    let sym = Symbol::new(name);
    sym.set_home_package(package);
    package.symbols.borrow_mut().push(sym.clone());
    if package.is_keyword() {
        sym.set_value(Value::Symbol(sym.clone()));
        sym.export();
    }
    sym
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_idempotent_per_package() {
        let p = Package::new("scratch", Vec::new());
        let a = intern(b"x", &p);
        let b = intern(b"x", &p);
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(p.symbols().len(), 1);
    }

    #[test]
    fn used_package_exports_are_inherited() {
        let base = Package::new("base", Vec::new());
        let exported = intern(b"shared", &base);
        exported.export();
        let hidden = intern(b"hidden", &base);
        let _ = hidden;

        let user = Package::new("u", vec![base.clone()]);
        let found = intern(b"shared", &user);
        assert!(Rc::ptr_eq(&found, &exported));
        // Internal symbols of used packages are not visible.
        assert!(find_symbol(b"hidden", &user, true).is_none());
        // The inherited symbol keeps its original home.
        assert!(Rc::ptr_eq(&found.home_package().unwrap(), &base));
    }

    #[test]
    fn keyword_interning_self_binds_and_exports() {
        let kw = Package::new("keyword", Vec::new());
        let sym = intern(b"flag", &kw);
        assert!(sym.is_external());
        match sym.value() {
            Some(Value::Symbol(s)) => assert!(Rc::ptr_eq(&s, &sym)),
            other => panic!("keyword value slot was {:?}", other.map(|v| v.type_name())),
        }
    }

    #[test]
    fn slots_are_independent() {
        let p = Package::new("scratch", Vec::new());
        let sym = intern(b"s", &p);
        assert!(sym.value().is_none());
        sym.set_value(Value::Fixnum(1));
        assert!(sym.value().is_some());
        assert!(sym.function().is_none());
        assert!(sym.structure().is_none());
    }
}
