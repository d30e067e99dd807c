use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use lockstep_ast::{ClassDef, Expr, FnDef, LockMode, MethodDef, Param, Program, Stmt, TypeRef};

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("lockstep-cli-{}-{name}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_tree(dir: &Path, program: &Program) -> PathBuf {
    let path = dir.join("tree.json");
    fs::write(&path, serde_json::to_string(program).unwrap()).unwrap();
    path
}

fn lockstep(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_lockstep"))
        .args(args)
        .env("NO_COLOR", "1")
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

/// `main` writes a field of a queue whose class carries no lock mode.
fn unguarded_write() -> Program {
    let mut queue = ClassDef::new("Queue", LockMode::NoLock).field("size", TypeRef::named("int"));
    queue.lock_mode = None;
    Program {
        classes: vec![queue],
        functions: vec![FnDef::new(
            "main",
            vec![],
            vec![
                Stmt::let_("q", TypeRef::named("Queue"), Some(Expr::name("Queue").call(vec![]))),
                Stmt::assign(Expr::name("q").attr("size"), Expr::int(1)),
            ],
        )],
    }
}

fn account() -> Program {
    Program {
        classes: vec![
            ClassDef::new("Account", LockMode::CheckLock)
                .activable()
                .field("balance", TypeRef::named("int"))
                .method(MethodDef::new(
                    "deposit",
                    vec![Param::new("amount", TypeRef::named("int"))],
                    None,
                )),
        ],
        functions: vec![],
    }
}

#[test]
fn check_passes_a_clean_tree() {
    let dir = scratch("clean");
    let tree = write_tree(&dir, &unguarded_write());
    let out = lockstep(&["check", tree.to_str().unwrap()]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(String::from_utf8_lossy(&out.stdout).contains("0 inserted lock(s)"));
}

#[test]
fn config_lock_mode_turns_the_write_into_a_violation() {
    let dir = scratch("checklock");
    fs::write(dir.join("lockstep.toml"), "[checker]\ndefault_lock_mode = \"checklock\"\n").unwrap();
    let tree = write_tree(&dir, &unguarded_write());

    let out = lockstep(&["check", tree.to_str().unwrap()]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("lock discipline check failed"), "{stderr}");

    // flags win over the file
    let out = lockstep(&["check", tree.to_str().unwrap(), "--default-lock-mode", "autolock"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(String::from_utf8_lossy(&out.stdout).contains("1 inserted lock(s)"));
}

#[test]
fn emit_writes_module_and_header() {
    let dir = scratch("emit");
    let tree = write_tree(&dir, &account());
    let module = dir.join("build").join("account.cpp");

    let out = lockstep(&["emit", tree.to_str().unwrap(), "-o", module.to_str().unwrap()]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let cpp = fs::read_to_string(&module).unwrap();
    assert!(cpp.contains("#include \"lockstep_rt.h\""));
    assert!(cpp.contains("struct Account_deposit_message"));
    let header = fs::read_to_string(dir.join("build").join("lockstep_rt.h")).unwrap();
    assert!(header.contains("namespace lockstep"));
}

#[test]
fn emit_without_header_writes_only_the_module() {
    let dir = scratch("no-header");
    let tree = write_tree(&dir, &account());

    let out = lockstep(&["emit", tree.to_str().unwrap(), "--no-runtime-header"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(dir.join("tree.cpp").is_file());
    assert!(!dir.join("lockstep_rt.h").exists());
}

#[test]
fn plan_prints_messages_and_wrappers() {
    let dir = scratch("plan");
    let tree = write_tree(&dir, &account());

    let out = lockstep(&["plan", tree.to_str().unwrap()]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let plan: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    let messages = plan["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["message_type"], "Account_deposit_message");
    assert!(!plan["wrappers"].as_array().unwrap().is_empty());
}

#[test]
fn malformed_tree_is_a_diagnostic() {
    let dir = scratch("malformed");
    let tree = dir.join("tree.json");
    fs::write(&tree, "{\"classes\": 3}").unwrap();
    let out = lockstep(&["check", tree.to_str().unwrap()]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("invalid tree"));
}
