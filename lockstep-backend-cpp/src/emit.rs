#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use lockstep_ast::{
    BinOp, Block, ClassDef, Expr, ExprKind, FnDef, LockKind, LockMode, MethodDef, Param, Program,
    Stmt, TypeRef,
};
use lockstep_core::{
    ClassTable, MessagePlan, ProgramPlan, ReturnCategory, WrapperKind, WrapperPlan,
    collect_locked, statement_locks,
};

use crate::{CppBackendError, EmitOptions};

const INDENT: &str = "  ";

pub(crate) fn emit_module_cpp(
    program: &Program,
    plan: &ProgramPlan,
    options: &EmitOptions,
) -> Result<String, CppBackendError> {
    let table = ClassTable::new(program, LockMode::default());
    let mut out = String::new();
    out.push_str("// Generated by lockstep. Lock discipline checked before emission.\n");
    out.push_str(&format!("#include \"{}\"\n\n", options.header_name));

    let classes = bases_first(program, &table);

    for class in &classes {
        out.push_str(&format!("struct {};\n", class.name.node));
        if class.activable {
            out.push_str(&format!("struct {};\n", proxy_name(&class.name.node)));
        }
    }
    out.push('\n');

    for class in &classes {
        emit_class_decl(&mut out, class, &table);
        out.push('\n');
    }

    for f in &program.functions {
        out.push_str(&function_head(f, &table));
        out.push_str(";\n");
    }
    if !program.functions.is_empty() {
        out.push('\n');
    }

    for message in &plan.messages {
        emit_message(&mut out, message, &table)?;
        out.push('\n');
    }

    for class in classes.iter().filter(|c| c.activable) {
        emit_proxy(&mut out, class, plan, &table)?;
        out.push('\n');
    }

    if options.wrappers {
        for wrapper in &plan.wrappers {
            emit_wrapper(&mut out, wrapper, &table)?;
        }
        if !plan.wrappers.is_empty() {
            out.push('\n');
        }
    }

    for class in &classes {
        for m in &class.methods {
            let Some(body) = &m.body else {
                continue;
            };
            let mut w = BodyWriter::new(&table, plan);
            if !m.is_static {
                w.declare("self", TypeRef::named(class.name.node.clone()));
            }
            for p in &m.params {
                w.declare(&p.name.node, p.ty.clone());
            }
            w.block(body)?;
            out.push_str(&method_head(class, m, &table, false));
            out.push_str(" {\n");
            out.push_str(&w.out);
            out.push_str("}\n\n");
        }
    }

    let mut has_entry = false;
    for f in &program.functions {
        let mut w = BodyWriter::new(&table, plan);
        for p in &f.params {
            w.declare(&p.name.node, p.ty.clone());
        }
        w.block(&f.body)?;
        out.push_str(&function_head(f, &table));
        out.push_str(" {\n");
        out.push_str(&w.out);
        out.push_str("}\n\n");
        has_entry |= f.name.node == "main" && f.params.is_empty();
    }
    if has_entry {
        out.push_str("int main() {\n  lockstep_main();\n  return 0;\n}\n");
    }

    Ok(out)
}

/// Program classes ordered so every base is defined before its subclasses.
fn bases_first<'p>(program: &'p Program, table: &ClassTable) -> Vec<&'p ClassDef> {
    fn visit<'p>(
        class: &'p ClassDef,
        program: &'p Program,
        table: &ClassTable,
        done: &mut HashSet<String>,
        out: &mut Vec<&'p ClassDef>,
    ) {
        if !done.insert(class.name.node.clone()) {
            return;
        }
        for base in &class.bases {
            if table.class(&base.node).is_none() {
                continue;
            }
            if let Some(b) = program.classes.iter().find(|c| c.name.node == base.node) {
                visit(b, program, table, done, out);
            }
        }
        out.push(class);
    }
    let mut done = HashSet::new();
    let mut out = Vec::new();
    for class in &program.classes {
        visit(class, program, table, &mut done, &mut out);
    }
    out
}

fn inherits_activable(class: &ClassDef, table: &ClassTable, seen: &mut HashSet<String>) -> bool {
    class.bases.iter().any(|b| {
        if !seen.insert(b.node.clone()) {
            return false;
        }
        table
            .class(&b.node)
            .is_some_and(|info| info.def.activable || inherits_activable(&info.def, table, seen))
    })
}

fn proxy_name(class: &str) -> String {
    format!("Activated_{class}")
}

fn cpp_ident(name: &str) -> String {
    const RESERVED: &[&str] = &[
        "auto", "break", "case", "catch", "char", "class", "const", "default", "delete", "do",
        "double", "else", "enum", "explicit", "float", "friend", "goto", "inline", "int", "long",
        "namespace", "new", "operator", "private", "protected", "public", "register", "short",
        "signed", "sizeof", "static", "struct", "switch", "template", "this", "throw", "typedef",
        "typename", "union", "unsigned", "using", "virtual", "void", "volatile",
    ];
    if name == "self" {
        return "this".to_string();
    }
    let name = name.replace('.', "_");
    if RESERVED.contains(&name.as_str()) {
        format!("{name}_")
    } else {
        name
    }
}

fn cpp_type(ty: Option<&TypeRef>, table: &ClassTable) -> String {
    let Some(ty) = ty else {
        return "void".to_string();
    };
    let name = ty.class_name();
    if table.class(name).is_some() {
        let pointee = if ty.activated {
            proxy_name(name)
        } else {
            name.to_string()
        };
        return if ty.is_const() {
            format!("const {pointee}*")
        } else {
            format!("{pointee}*")
        };
    }
    match name {
        "void" => "void",
        "int" | "long" | "short" => "long",
        "size_t" => "std::size_t",
        "char" => "char",
        "bint" | "bool" => "bool",
        "float" | "double" => "double",
        "str" | "string" => "std::string",
        other => return other.to_string(),
    }
    .to_string()
}

fn param_list(params: &[Param], table: &ClassTable, with_defaults: bool) -> String {
    params
        .iter()
        .map(|p| {
            let mut s = format!("{} {}", cpp_type(Some(&p.ty), table), cpp_ident(&p.name.node));
            if with_defaults {
                if let Some(d) = &p.default {
                    s.push_str(" = ");
                    s.push_str(&literal(d));
                }
            }
            s
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Default values are restricted to literals and plain names.
fn literal(e: &Expr) -> String {
    match &e.kind {
        ExprKind::IntLit(n) => n.to_string(),
        ExprKind::BoolLit(b) => b.to_string(),
        ExprKind::StringLit(s) => format!("std::string(\"{}\")", escape_string(s)),
        ExprKind::Name(id) => cpp_ident(&id.node),
        _ => "nullptr".to_string(),
    }
}

fn escape_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn emit_class_decl(out: &mut String, class: &ClassDef, table: &ClassTable) {
    let name = &class.name.node;
    let mut bases: Vec<String> = class
        .bases
        .iter()
        .filter(|b| table.class(&b.node).is_some())
        .map(|b| format!("public {}", b.node))
        .collect();
    if bases.is_empty() {
        bases.push("public virtual lockstep::Object".to_string());
    }
    if class.activable && !inherits_activable(class, table, &mut HashSet::new()) {
        bases.push("public lockstep::ActivableBase".to_string());
    }
    out.push_str(&format!("struct {name} : {} {{\n", bases.join(", ")));
    for f in &class.fields {
        out.push_str(&format!(
            "{INDENT}{} {}{{}};\n",
            cpp_type(Some(&f.ty), table),
            cpp_ident(&f.name.node)
        ));
    }
    for m in &class.methods {
        out.push_str(INDENT);
        out.push_str(&method_head(class, m, table, true));
        out.push_str(";\n");
    }
    out.push_str("};\n");
}

fn method_head(class: &ClassDef, m: &MethodDef, table: &ClassTable, in_class: bool) -> String {
    let name = &class.name.node;
    let params = param_list(&m.params, table, in_class);
    let owner = if in_class {
        String::new()
    } else {
        format!("{name}::")
    };
    match m.name.node.as_str() {
        "__init__" => format!("{owner}{name}({params})"),
        "__del__" | "__dealloc__" if in_class => format!("~{name}() override"),
        "__del__" | "__dealloc__" => format!("{owner}~{name}()"),
        method => {
            let ret = cpp_type(m.ret.as_ref(), table);
            let prefix = match (in_class, m.is_static) {
                (true, true) => "static ",
                (true, false) => "virtual ",
                (false, _) => "",
            };
            let suffix = if m.is_const && !m.is_static { " const" } else { "" };
            format!("{prefix}{ret} {owner}{}({params}){suffix}", cpp_ident(method))
        }
    }
}

fn function_head(f: &FnDef, table: &ClassTable) -> String {
    let name = if f.name.node == "main" && f.params.is_empty() {
        "lockstep_main".to_string()
    } else {
        cpp_ident(&f.name.node)
    };
    format!(
        "{} {name}({})",
        cpp_type(f.ret.as_ref(), table),
        param_list(&f.params, table, true)
    )
}

fn lookup_method<'t>(
    table: &'t ClassTable,
    class: &str,
    method: &str,
) -> Result<&'t MethodDef, CppBackendError> {
    table
        .lookup_method(class, method)
        .ok_or_else(|| CppBackendError::new(format!("no method '{method}' on class '{class}'")))
}

fn lock_call(kind: LockKind, try_: bool) -> &'static str {
    match (kind, try_) {
        (LockKind::Read, true) => "try_rlock",
        (LockKind::Write, true) => "try_wlock",
        (LockKind::Read, false) => "unrlock",
        (LockKind::Write, false) => "unwlock",
    }
}

fn emit_message(
    out: &mut String,
    message: &MessagePlan,
    table: &ClassTable,
) -> Result<(), CppBackendError> {
    let method = lookup_method(table, &message.class, &message.method)?;
    let param_ty = |name: &str| {
        method
            .params
            .iter()
            .find(|p| p.name.node == name)
            .map(|p| cpp_type(Some(&p.ty), table))
            .unwrap_or_else(|| "auto".to_string())
    };
    let ty = &message.message_type;
    let class = &message.class;

    out.push_str(&format!("struct {ty} : public lockstep::MessageInterface {{\n"));
    out.push_str(&format!("{INDENT}{class}* target;\n"));
    for a in &message.args {
        out.push_str(&format!("{INDENT}{} {};\n", param_ty(&a.name), cpp_ident(&a.name)));
    }
    out.push('\n');

    let mut ctor_params = vec![
        format!("{class}* target"),
        "lockstep::SyncInterface* sync".to_string(),
        "lockstep::ResultInterface* result".to_string(),
    ];
    let mut inits = vec![
        "lockstep::MessageInterface(sync, result)".to_string(),
        "target(target)".to_string(),
    ];
    for a in &message.args {
        let id = cpp_ident(&a.name);
        ctor_params.push(format!("{} {id}", param_ty(&a.name)));
        inits.push(format!("{id}({id})"));
    }
    out.push_str(&format!("{INDENT}{ty}({})\n", ctor_params.join(", ")));
    out.push_str(&format!("{INDENT}{INDENT}{INDENT}: {} {{\n", inits.join(", ")));
    out.push_str(&format!("{INDENT}{INDENT}lockstep::retain(this->target);\n"));
    for a in message.args.iter().filter(|a| a.is_retained()) {
        out.push_str(&format!(
            "{INDENT}{INDENT}lockstep::retain(this->{});\n",
            cpp_ident(&a.name)
        ));
    }
    out.push_str(&format!("{INDENT}}}\n\n"));

    out.push_str(&format!("{INDENT}~{ty}() override {{\n"));
    out.push_str(&format!("{INDENT}{INDENT}lockstep::release(this->target);\n"));
    for a in message.args.iter().filter(|a| a.is_retained()) {
        out.push_str(&format!(
            "{INDENT}{INDENT}lockstep::release(this->{});\n",
            cpp_ident(&a.name)
        ));
    }
    out.push_str(&format!("{INDENT}}}\n\n"));

    // activate(): admission, all-or-nothing try-locks, call, release, deliver.
    let i2 = INDENT.repeat(2);
    let i3 = INDENT.repeat(3);
    out.push_str(&format!("{INDENT}lockstep::Activation activate() override {{\n"));
    out.push_str(&format!(
        "{i2}const lockstep::Activation admitted = admission();\n\
         {i2}if (admitted != lockstep::Activation::Activated) {{\n\
         {i3}return admitted;\n\
         {i2}}}\n"
    ));
    let order: Vec<(String, LockKind, bool)> = message
        .acquisition_order()
        .into_iter()
        .map(|(name, kind)| {
            if name == "self" {
                ("this->target".to_string(), kind, false)
            } else {
                (format!("this->{}", cpp_ident(name)), kind, true)
            }
        })
        .collect();
    let unlock = |(obj, kind, nullable): &(String, LockKind, bool), indent: &str| {
        if *nullable {
            format!(
                "{indent}if ({obj} != nullptr) {{\n{indent}{INDENT}{obj}->{}();\n{indent}}}\n",
                lock_call(*kind, false)
            )
        } else {
            format!("{indent}{obj}->{}();\n", lock_call(*kind, false))
        }
    };
    for (i, (obj, kind, nullable)) in order.iter().enumerate() {
        let cond = if *nullable {
            format!("{obj} != nullptr && {obj}->{}() != 0", lock_call(*kind, true))
        } else {
            format!("{obj}->{}() != 0", lock_call(*kind, true))
        };
        out.push_str(&format!("{i2}if ({cond}) {{\n"));
        for held in order[..i].iter().rev() {
            out.push_str(&unlock(held, &i3));
        }
        out.push_str(&format!("{i3}return lockstep::Activation::Deferred;\n{i2}}}\n"));
    }

    let call_args = method
        .params
        .iter()
        .map(|p| format!("this->{}", cpp_ident(&p.name.node)))
        .collect::<Vec<_>>()
        .join(", ");
    let call = format!("this->target->{}({call_args})", cpp_ident(&message.method));
    if message.ret == ReturnCategory::Void {
        out.push_str(&format!("{i2}{call};\n"));
    } else {
        out.push_str(&format!("{i2}auto value = {call};\n"));
    }
    for held in order.iter().rev() {
        out.push_str(&unlock(held, &i2));
    }
    let push = match message.ret {
        ReturnCategory::Void => None,
        ReturnCategory::Int => Some("push_int(value)"),
        ReturnCategory::Pointer => Some("push_pointer(value)"),
        ReturnCategory::Generic => Some("push_value(value)"),
    };
    if let Some(push) = push {
        out.push_str(&format!(
            "{i2}if (this->result != nullptr) {{\n\
             {i3}this->result->wlock();\n\
             {i3}this->result->{push};\n\
             {i3}this->result->unwlock();\n\
             {i2}}}\n"
        ));
    }
    out.push_str(&format!(
        "{i2}finish();\n{i2}return lockstep::Activation::Activated;\n{INDENT}}}\n"
    ));
    out.push_str("};\n");
    Ok(())
}

fn emit_proxy(
    out: &mut String,
    class: &ClassDef,
    plan: &ProgramPlan,
    table: &ClassTable,
) -> Result<(), CppBackendError> {
    let name = &class.name.node;
    let proxy = proxy_name(name);
    let i2 = INDENT.repeat(2);
    out.push_str(&format!("struct {proxy} : public lockstep::Object {{\n"));
    out.push_str(&format!(
        "{INDENT}{name}* object;\n\
         {INDENT}lockstep::QueueInterface* queue;\n\
         {INDENT}lockstep::ResultFactory result_factory;\n\n"
    ));
    out.push_str(&format!(
        "{INDENT}{proxy}({name}* object, lockstep::QueueInterface* queue, lockstep::ResultFactory result_factory)\n\
         {INDENT}{INDENT}{INDENT}: object(object), queue(queue), result_factory(result_factory) {{\n\
         {i2}lockstep::retain(this->object);\n\
         {i2}lockstep::retain(this->queue);\n\
         {INDENT}}}\n\n"
    ));
    out.push_str(&format!(
        "{INDENT}~{proxy}() override {{\n\
         {i2}this->object->forget_proxy(this);\n\
         {i2}lockstep::release(this->queue);\n\
         {i2}lockstep::release(this->object);\n\
         {INDENT}}}\n"
    ));

    for message in plan.messages_for(name) {
        let method = lookup_method(table, name, &message.method)?;
        let mut params = vec!["lockstep::SyncInterface* sync".to_string()];
        let params_rest = param_list(&method.params, table, true);
        if !params_rest.is_empty() {
            params.push(params_rest);
        }
        let mut args = vec![
            "this->object".to_string(),
            "sync".to_string(),
            "result".to_string(),
        ];
        args.extend(message.args.iter().map(|a| cpp_ident(&a.name)));
        out.push('\n');
        out.push_str(&format!(
            "{INDENT}lockstep::ResultInterface* {}({}) {{\n",
            cpp_ident(&message.method),
            params.join(", ")
        ));
        out.push_str(&format!(
            "{i2}lockstep::ResultInterface* result = this->result_factory != nullptr ? this->result_factory() : nullptr;\n\
             {i2}if (sync != nullptr) {{\n\
             {i2}{INDENT}lockstep::wlock_guard hold(sync);\n\
             {i2}{INDENT}sync->insert_activity();\n\
             {i2}}}\n\
             {i2}this->queue->push(new {}({}));\n\
             {i2}return result;\n\
             {INDENT}}}\n",
            message.message_type,
            args.join(", ")
        ));
    }
    out.push_str("};\n\n");

    out.push_str(&format!(
        "inline {proxy}* {name}_activate({name}* object, lockstep::QueueInterface* queue = nullptr,\n\
         {INDENT}{INDENT}lockstep::ResultFactory result_factory = nullptr) {{\n\
         {INDENT}return lockstep::activate_once<{proxy}>(object, queue, result_factory);\n\
         }}\n"
    ));
    Ok(())
}

fn emit_wrapper(
    out: &mut String,
    wrapper: &WrapperPlan,
    table: &ClassTable,
) -> Result<(), CppBackendError> {
    let class = &wrapper.class;
    let guard = |self_name: &str| match wrapper.lock {
        Some(LockKind::Read) => format!("{INDENT}lockstep::rlock_guard hold({self_name});\n"),
        Some(LockKind::Write) => format!("{INDENT}lockstep::wlock_guard hold({self_name});\n"),
        None => String::new(),
    };
    match &wrapper.wrapper {
        WrapperKind::Getter { field } => {
            let def = table.lookup_field(class, field).ok_or_else(|| {
                CppBackendError::new(format!("no field '{field}' on class '{class}'"))
            })?;
            let id = cpp_ident(field);
            out.push_str(&format!(
                "inline {} {class}_get_{field}(const {class}* self) {{\n{}{INDENT}return self->{id};\n}}\n",
                cpp_type(Some(&def.ty), table),
                guard("self"),
            ));
        }
        WrapperKind::Setter { field } => {
            let def = table.lookup_field(class, field).ok_or_else(|| {
                CppBackendError::new(format!("no field '{field}' on class '{class}'"))
            })?;
            let id = cpp_ident(field);
            out.push_str(&format!(
                "inline void {class}_set_{field}({class}* self, {} value) {{\n{}{INDENT}self->{id} = value;\n}}\n",
                cpp_type(Some(&def.ty), table),
                guard("self"),
            ));
        }
        WrapperKind::Method { method, is_static } => {
            let def = lookup_method(table, class, method)?;
            let ret = cpp_type(def.ret.as_ref(), table);
            let args = def
                .params
                .iter()
                .map(|p| cpp_ident(&p.name.node))
                .collect::<Vec<_>>()
                .join(", ");
            let params = param_list(&def.params, table, false);
            let id = cpp_ident(method);
            if *is_static {
                out.push_str(&format!(
                    "inline {ret} {class}_call_{method}({params}) {{\n{INDENT}return {class}::{id}({args});\n}}\n"
                ));
            } else {
                let self_param = if params.is_empty() {
                    format!("{class}* self")
                } else {
                    format!("{class}* self, {params}")
                };
                out.push_str(&format!(
                    "inline {ret} {class}_call_{method}({self_param}) {{\n{}{INDENT}return self->{id}({args});\n}}\n",
                    guard("self"),
                ));
            }
        }
    }
    Ok(())
}

type Temps<'e> = Vec<(&'e Expr, String)>;

/// A name or attribute chain, which evaluates to the same object every time
/// within one statement.
fn is_plain_path(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::Name(_) => true,
        ExprKind::Attribute { base, .. } => is_plain_path(base),
        ExprKind::Locked { object, .. } => is_plain_path(object),
        _ => false,
    }
}

/// Renders one function or method body.
struct BodyWriter<'a> {
    table: &'a ClassTable,
    plan: &'a ProgramPlan,
    scopes: Vec<HashMap<String, TypeRef>>,
    out: String,
    depth: usize,
    next_temp: usize,
}

impl<'a> BodyWriter<'a> {
    fn new(table: &'a ClassTable, plan: &'a ProgramPlan) -> Self {
        Self {
            table,
            plan,
            scopes: vec![HashMap::new()],
            out: String::new(),
            depth: 1,
            next_temp: 0,
        }
    }

    fn declare(&mut self, name: &str, ty: TypeRef) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), ty);
        }
    }

    fn is_local(&self, name: &str) -> bool {
        self.scopes.iter().any(|s| s.contains_key(name))
    }

    fn line(&mut self, text: &str) {
        for _ in 0..self.depth {
            self.out.push_str(INDENT);
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn open(&mut self, text: &str) {
        self.line(text);
        self.depth += 1;
    }

    fn close(&mut self, text: &str) {
        self.depth = self.depth.saturating_sub(1);
        self.line(text);
    }

    fn type_of(&self, expr: &Expr) -> Option<TypeRef> {
        if let Some(ty) = &expr.ty {
            return Some(ty.clone());
        }
        match &expr.kind {
            ExprKind::Name(id) => self
                .scopes
                .iter()
                .rev()
                .find_map(|s| s.get(&id.node))
                .cloned(),
            ExprKind::Activate(inner) => self.type_of(inner).map(TypeRef::activated),
            ExprKind::Locked { object, .. } => self.type_of(object),
            ExprKind::Attribute { base, attr } => {
                let ty = self.type_of(base)?;
                self.table
                    .lookup_field(ty.class_name(), &attr.node)
                    .map(|f| f.ty.clone())
            }
            ExprKind::Call { callee, .. } => match &callee.kind {
                ExprKind::Attribute { base, attr } => {
                    let ty = self.type_of(base)?;
                    self.table
                        .lookup_method(ty.class_name(), &attr.node)
                        .and_then(|m| m.ret.clone())
                }
                ExprKind::Name(id) if self.table.class(&id.node).is_some() => {
                    Some(TypeRef::named(id.node.clone()))
                }
                ExprKind::Name(id) => self.table.function(&id.node).and_then(|f| f.ret.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Class of the object `expr` refers to, when it is a lockable class.
    fn class_of(&self, expr: &Expr) -> Option<String> {
        self.type_of(expr)
            .filter(|t| !t.activated && self.table.class(t.class_name()).is_some())
            .map(|t| t.class_name().to_string())
    }

    /// Member access operator for `base`. Unknown types are assumed to be
    /// object pointers.
    fn arrow(&self, base: &Expr) -> &'static str {
        match self.type_of(base) {
            Some(t) if self.table.class(t.class_name()).is_none() => ".",
            _ => "->",
        }
    }

    fn block(&mut self, block: &Block) -> Result<(), CppBackendError> {
        self.scopes.push(HashMap::new());
        for stmt in &block.stmts {
            self.stmt(stmt)?;
        }
        self.scopes.pop();
        Ok(())
    }

    fn nested(&mut self, block: &Block) -> Result<(), CppBackendError> {
        self.depth += 1;
        self.block(block)?;
        self.depth -= 1;
        Ok(())
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), CppBackendError> {
        match stmt {
            Stmt::Let(s) => {
                let ty = cpp_type(Some(&s.ty), self.table);
                let name = cpp_ident(&s.name.node);
                match &s.init {
                    Some(init) => {
                        let value = self.value(init)?;
                        self.line(&format!("{ty} {name} = {value};"));
                    }
                    None => self.line(&format!("{ty} {name}{{}};")),
                }
                self.declare(&s.name.node, s.ty.clone());
            }
            Stmt::Assign(_) | Stmt::Del(_) | Stmt::Return(_) | Stmt::Expr(_) => {
                let locks = statement_locks(stmt);
                let scoped = !locks.is_empty();
                if scoped {
                    self.open("{");
                }
                let (decls, temps) = self.lock_temps(&locks)?;
                for d in &decls {
                    self.line(d);
                }
                for text in self.simple_stmt(stmt, &temps)? {
                    self.line(&text);
                }
                if scoped {
                    self.close("}");
                }
            }
            Stmt::If(s) => {
                let cond = self.value(&s.cond)?;
                self.line(&format!("if ({cond}) {{"));
                self.nested(&s.then_block)?;
                if let Some(b) = &s.else_block {
                    self.line("} else {");
                    self.nested(b)?;
                }
                self.line("}");
            }
            Stmt::While(s) => {
                let cond = self.value(&s.cond)?;
                self.line(&format!("while ({cond}) {{"));
                self.nested(&s.body)?;
                self.line("}");
            }
            Stmt::For(s) => {
                let iter = self.value(&s.iter)?;
                let ty = s
                    .target_ty
                    .as_ref()
                    .map(|t| cpp_type(Some(t), self.table))
                    .unwrap_or_else(|| "auto&&".to_string());
                self.line(&format!(
                    "for ({ty} {} : {iter}) {{",
                    cpp_ident(&s.target.node)
                ));
                self.scopes.push(HashMap::new());
                if let Some(t) = &s.target_ty {
                    self.declare(&s.target.node, t.clone());
                }
                self.nested(&s.body)?;
                self.scopes.pop();
                self.line("}");
            }
            Stmt::With(s) => {
                let context = self.value(&s.context)?;
                self.open("{");
                self.scopes.push(HashMap::new());
                let name = match &s.target {
                    Some(t) => {
                        if let Some(ty) = &s.target_ty {
                            self.declare(&t.node, ty.clone());
                        }
                        cpp_ident(&t.node)
                    }
                    None => self.temp("context"),
                };
                self.line(&format!("auto&& {name} = {context};"));
                self.block(&s.body)?;
                self.scopes.pop();
                self.close("}");
            }
            Stmt::Locked(s) => {
                let target = self.value(&s.target)?;
                let guard = self.temp("guard");
                self.open("{");
                self.line(&format!(
                    "lockstep::{}_guard {guard}({target});",
                    match s.kind {
                        LockKind::Read => "rlock",
                        LockKind::Write => "wlock",
                    }
                ));
                self.block(&s.body)?;
                self.close("}");
            }
            Stmt::Try(s) => {
                if let Some(f) = &s.finally {
                    let name = self.temp("finally");
                    self.open("{");
                    self.line(&format!("lockstep::scope_exit {name}([&]() {{"));
                    self.nested(f)?;
                    self.line("});");
                }
                self.line("try {");
                self.nested(&s.body)?;
                if s.handlers.is_empty() {
                    self.line("} catch (...) {");
                    self.depth += 1;
                    self.line("throw;");
                    self.depth -= 1;
                }
                for h in &s.handlers {
                    let head = match (&h.ty, &h.name) {
                        (Some(ty), Some(n)) => {
                            format!("catch (const {}& {})", ty.class_name(), cpp_ident(&n.node))
                        }
                        (Some(ty), None) => format!("catch (const {}&)", ty.class_name()),
                        (None, _) => "catch (...)".to_string(),
                    };
                    self.line(&format!("}} {head} {{"));
                    self.scopes.push(HashMap::new());
                    if let (Some(ty), Some(n)) = (&h.ty, &h.name) {
                        self.declare(&n.node, ty.clone());
                    }
                    self.nested(&h.body)?;
                    self.scopes.pop();
                }
                self.line("}");
                if s.finally.is_some() {
                    self.close("}");
                }
            }
        }
        Ok(())
    }

    fn temp(&mut self, stem: &str) -> String {
        let n = self.next_temp;
        self.next_temp += 1;
        format!("__{stem}{n}")
    }

    /// Declarations binding each locked node to a temporary and a scoped
    /// guard, innermost first. Locked nodes over the same side-effect-free
    /// path share one temporary held at the strongest kind, so a statement
    /// never holds a read guard while taking a write guard on one object.
    fn lock_temps<'e>(
        &mut self,
        locks: &[&'e Expr],
    ) -> Result<(Vec<String>, Temps<'e>), CppBackendError> {
        let mut bound: Vec<(String, LockKind, usize, bool)> = Vec::new();
        let mut temps: Temps<'e> = Vec::new();
        for &node in locks {
            let ExprKind::Locked { kind, object } = &node.kind else {
                continue;
            };
            let text = self.expr(object, &temps)?;
            let shareable = is_plain_path(object);
            if shareable {
                if let Some(slot) = bound.iter_mut().find(|b| b.3 && b.0 == text) {
                    if *kind == LockKind::Write {
                        slot.1 = LockKind::Write;
                    }
                    temps.push((node, format!("__locked{}", slot.2)));
                    continue;
                }
            }
            let n = self.next_temp;
            self.next_temp += 1;
            bound.push((text, *kind, n, shareable));
            temps.push((node, format!("__locked{n}")));
        }

        let mut decls = Vec::new();
        for (object, kind, n, _) in bound {
            let guard = match kind {
                LockKind::Read => "rlock_guard",
                LockKind::Write => "wlock_guard",
            };
            decls.push(format!("auto* __locked{n} = {object};"));
            decls.push(format!("lockstep::{guard} __guard{n}(__locked{n});"));
        }
        Ok((decls, temps))
    }

    /// An expression evaluated outside a statement scope. Any locks it needs
    /// live inside an immediately invoked lambda, so they are released as
    /// soon as the value is computed.
    fn value(&mut self, expr: &Expr) -> Result<String, CppBackendError> {
        let mut locks = Vec::new();
        collect_locked(expr, &mut locks);
        if locks.is_empty() {
            return self.expr(expr, &Vec::new());
        }
        let (decls, temps) = self.lock_temps(&locks)?;
        let body = self.expr(expr, &temps)?;
        Ok(format!("[&]() {{ {} return {body}; }}()", decls.join(" ")))
    }

    fn simple_stmt(&self, stmt: &Stmt, temps: &Temps<'_>) -> Result<Vec<String>, CppBackendError> {
        Ok(match stmt {
            Stmt::Assign(s) => {
                let value = self.expr(&s.value, temps)?;
                match &s.target.kind {
                    ExprKind::Subscript { base, index } if self.class_of(base).is_some() => {
                        vec![format!(
                            "{}->__setitem__({}, {value});",
                            self.expr(base, temps)?,
                            self.expr(index, temps)?
                        )]
                    }
                    _ => vec![format!("{} = {value};", self.expr(&s.target, temps)?)],
                }
            }
            Stmt::Del(s) => match &s.target.kind {
                ExprKind::Subscript { base, index } => {
                    let b = self.expr(base, temps)?;
                    let i = self.expr(index, temps)?;
                    if self.class_of(base).is_some() {
                        vec![format!("{b}->__delitem__({i});")]
                    } else {
                        vec![format!("{b}.erase({i});")]
                    }
                }
                _ => {
                    let target = self.expr(&s.target, temps)?;
                    if self.class_of(&s.target).is_some() {
                        vec![
                            format!("lockstep::release({target});"),
                            format!("{target} = nullptr;"),
                        ]
                    } else {
                        vec![format!("{target} = {{}};")]
                    }
                }
            },
            Stmt::Return(s) => match &s.value {
                Some(v) => vec![format!("return {};", self.expr(v, temps)?)],
                None => vec!["return;".to_string()],
            },
            Stmt::Expr(e) => vec![format!("{};", self.expr(e, temps)?)],
            _ => Vec::new(),
        })
    }

    fn args(&self, args: &[Expr], temps: &Temps<'_>) -> Result<String, CppBackendError> {
        let rendered = args
            .iter()
            .map(|a| self.expr(a, temps))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rendered.join(", "))
    }

    fn expr(&self, expr: &Expr, temps: &Temps<'_>) -> Result<String, CppBackendError> {
        Ok(match &expr.kind {
            ExprKind::Name(id) => cpp_ident(&id.node),
            ExprKind::IntLit(n) => n.to_string(),
            ExprKind::BoolLit(b) => b.to_string(),
            ExprKind::StringLit(s) => format!("std::string(\"{}\")", escape_string(s)),
            ExprKind::NoneLit => "nullptr".to_string(),
            ExprKind::Attribute { base, attr } => match &base.kind {
                ExprKind::Name(id)
                    if !self.is_local(&id.node) && self.table.class(&id.node).is_some() =>
                {
                    format!("{}::{}", id.node, cpp_ident(&attr.node))
                }
                _ => format!(
                    "{}{}{}",
                    self.expr(base, temps)?,
                    self.arrow(base),
                    cpp_ident(&attr.node)
                ),
            },
            ExprKind::Call { callee, args } => match &callee.kind {
                ExprKind::Name(id)
                    if !self.is_local(&id.node) && self.table.class(&id.node).is_some() =>
                {
                    format!("new {}({})", id.node, self.args(args, temps)?)
                }
                _ => format!("{}({})", self.expr(callee, temps)?, self.args(args, temps)?),
            },
            ExprKind::Subscript { base, index } => {
                let b = self.expr(base, temps)?;
                let i = self.expr(index, temps)?;
                if self.class_of(base).is_some() {
                    format!("{b}->__getitem__({i})")
                } else {
                    format!("{b}[{i}]")
                }
            }
            ExprKind::Binary { left, op, right } => self.binary(left, *op, right, temps)?,
            ExprKind::Unary { op, expr: inner } => {
                let e = self.expr(inner, temps)?;
                match (op.method_name(), self.class_of(inner)) {
                    (Some(m), Some(class)) if self.table.lookup_method(&class, m).is_some() => {
                        format!("{e}->{m}()")
                    }
                    _ => format!("({}{e})", op.symbol()),
                }
            }
            ExprKind::Activate(inner) => {
                let class = self
                    .class_of(inner)
                    .filter(|c| self.is_activable(c))
                    .ok_or_else(|| {
                        CppBackendError::at(
                            "cannot activate an object whose class is not activable",
                            expr.span,
                        )
                    })?;
                format!("{class}_activate({})", self.expr(inner, temps)?)
            }
            ExprKind::Locked { object, .. } => match temps.iter().find(|(e, _)| std::ptr::eq(*e, expr)) {
                Some((_, name)) => name.clone(),
                None => self.expr(object, temps)?,
            },
            ExprKind::Send {
                target,
                class,
                method,
                message: _,
                sync,
                args,
            } => {
                if self.plan.message(class, &method.node).is_none() {
                    return Err(CppBackendError::at(
                        format!("no message was planned for '{class}.{}'", method.node),
                        expr.span,
                    ));
                }
                let sync = match sync {
                    Some(s) => self.expr(s, temps)?,
                    None => "nullptr".to_string(),
                };
                let mut rendered = vec![sync];
                if !args.is_empty() {
                    rendered.push(self.args(args, temps)?);
                }
                format!(
                    "{}->{}({})",
                    self.expr(target, temps)?,
                    cpp_ident(&method.node),
                    rendered.join(", ")
                )
            }
        })
    }

    fn is_activable(&self, class: &str) -> bool {
        self.table.class(class).is_some_and(|info| {
            info.def.activable || inherits_activable(&info.def, self.table, &mut HashSet::new())
        })
    }

    fn binary(
        &self,
        left: &Expr,
        op: BinOp,
        right: &Expr,
        temps: &Temps<'_>,
    ) -> Result<String, CppBackendError> {
        let l = self.expr(left, temps)?;
        let r = self.expr(right, temps)?;
        if let Some(m) = op.method_name() {
            if let Some(class) = self.class_of(left) {
                if self.table.lookup_method(&class, m).is_some() {
                    return Ok(format!("{l}->{m}({r})"));
                }
            }
            if let (Some(rm), Some(class)) = (op.reflected_name(), self.class_of(right)) {
                if self.table.lookup_method(&class, rm).is_some() {
                    return Ok(format!("{r}->{rm}({l})"));
                }
            }
        }
        Ok(format!("({l} {} {r})", op.symbol()))
    }
}
