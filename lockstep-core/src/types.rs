#![forbid(unsafe_code)]

use std::collections::HashMap;

use lockstep_ast::{ClassDef, FieldDef, FnDef, LockMode, MethodDef, Param, Program, TypeRef};

/// Class declarations indexed by name, with the lock mode of each class
/// resolved against the configured default.
#[derive(Clone, Debug)]
pub struct ClassTable {
    classes: HashMap<String, ClassInfo>,
    functions: HashMap<String, FnSig>,
}

#[derive(Clone, Debug)]
pub struct ClassInfo {
    pub def: ClassDef,
    pub lock_mode: LockMode,
}

#[derive(Clone, Debug)]
pub struct FnSig {
    pub params: Vec<Param>,
    pub ret: Option<TypeRef>,
}

impl From<&FnDef> for FnSig {
    fn from(f: &FnDef) -> Self {
        FnSig {
            params: f.params.clone(),
            ret: f.ret.clone(),
        }
    }
}

impl ClassTable {
    pub fn new(program: &Program, default_mode: LockMode) -> Self {
        let classes = program
            .classes
            .iter()
            .map(|c| {
                (
                    c.name.node.clone(),
                    ClassInfo {
                        def: c.clone(),
                        lock_mode: c.lock_mode.unwrap_or(default_mode),
                    },
                )
            })
            .collect();
        let functions = program
            .functions
            .iter()
            .map(|f| (f.name.node.clone(), FnSig::from(f)))
            .collect();
        Self { classes, functions }
    }

    pub fn class(&self, name: &str) -> Option<&ClassInfo> {
        self.classes.get(name)
    }

    pub fn function(&self, name: &str) -> Option<&FnSig> {
        self.functions.get(name)
    }

    pub fn classes(&self) -> impl Iterator<Item = &ClassInfo> {
        self.classes.values()
    }

    /// Lock mode of the object a reference of type `ty` points to, or `None`
    /// when the type is not a lockable class. Activated proxies are never
    /// locked by callers.
    pub fn lock_mode_of(&self, ty: &TypeRef) -> Option<LockMode> {
        if ty.activated {
            return None;
        }
        self.class(ty.class_name()).map(|c| c.lock_mode)
    }

    pub fn is_lockable(&self, ty: &TypeRef) -> bool {
        self.lock_mode_of(ty).is_some()
    }

    /// Method lookup following base classes depth-first, in declaration order.
    pub fn lookup_method(&self, class: &str, method: &str) -> Option<&MethodDef> {
        self.lookup_in_bases(class, &mut Vec::new(), &|info| {
            info.def.methods.iter().find(|m| m.name.node == method)
        })
    }

    pub fn lookup_field(&self, class: &str, field: &str) -> Option<&FieldDef> {
        self.lookup_in_bases(class, &mut Vec::new(), &|info| {
            info.def.fields.iter().find(|f| f.name.node == field)
        })
    }

    /// Every method callable on `class`, own methods first, then inherited
    /// ones not overridden along the way.
    pub fn methods_of(&self, class: &str) -> Vec<&MethodDef> {
        let mut order = Vec::new();
        self.collect_classes(class, &mut order);
        let mut out: Vec<&MethodDef> = Vec::new();
        for info in order {
            for m in &info.def.methods {
                if !out.iter().any(|seen| seen.name.node == m.name.node) {
                    out.push(m);
                }
            }
        }
        out
    }

    fn collect_classes<'a>(&'a self, class: &str, out: &mut Vec<&'a ClassInfo>) {
        let Some(info) = self.class(class) else {
            return;
        };
        if out.iter().any(|c| c.def.name.node == class) {
            return;
        }
        out.push(info);
        for base in &info.def.bases {
            self.collect_classes(&base.node, out);
        }
    }

    fn lookup_in_bases<'a, T>(
        &'a self,
        class: &str,
        seen: &mut Vec<String>,
        find: &dyn Fn(&'a ClassInfo) -> Option<&'a T>,
    ) -> Option<&'a T> {
        if seen.iter().any(|s| s == class) {
            return None;
        }
        seen.push(class.to_string());
        let info = self.class(class)?;
        if let Some(found) = find(info) {
            return Some(found);
        }
        for base in &info.def.bases {
            if let Some(found) = self.lookup_in_bases(&base.node, seen, find) {
                return Some(found);
            }
        }
        None
    }
}
