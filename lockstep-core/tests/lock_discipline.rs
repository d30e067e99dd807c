use lockstep_ast::{
    BinOp, Block, ClassDef, ExceptHandler, Expr, ExprKind, FnDef, LockKind, LockMode, MethodDef,
    Param, Program, Stmt, TryStmt, TypeRef, WithStmt, ident, span,
};
use lockstep_core::{CheckFailed, CheckedProgram, CheckerConfig, LockErrorKind, check_program};

fn boxed(mode: LockMode) -> ClassDef {
    ClassDef::new("Box", mode)
        .field("value", TypeRef::named("int"))
        .method(MethodDef::new("peek", vec![], Some(TypeRef::named("int"))).constant())
}

fn run(classes: Vec<ClassDef>, functions: Vec<FnDef>) -> Result<CheckedProgram, CheckFailed> {
    check_program(Program { classes, functions }, &CheckerConfig::default())
}

fn main_fn(body: Vec<Stmt>) -> FnDef {
    FnDef::new("main", vec![], body)
}

fn new_box(name: &str) -> Stmt {
    Stmt::let_(
        name,
        TypeRef::named("Box"),
        Some(Expr::name("Box").call(vec![])),
    )
}

fn set_value(name: &str, at: usize, value: i64) -> Stmt {
    Stmt::assign(Expr::name(name).at(at, 1).attr("value"), Expr::int(value))
}

#[test]
fn unlocked_write_is_reported_on_the_binding() {
    let err = run(
        vec![boxed(LockMode::CheckLock)],
        vec![main_fn(vec![new_box("Q"), set_value("Q", 20, 5)])],
    )
    .unwrap_err();
    assert_eq!(err.diagnostics.len(), 1);
    let d = &err.diagnostics[0];
    assert_eq!(d.kind, LockErrorKind::UnlockedWrite);
    assert_eq!(d.binding, "Q");
    assert_eq!(d.required, Some(LockKind::Write));
    assert_eq!(d.span.offset(), 20);
}

#[test]
fn write_lock_block_covers_the_statement() {
    let checked = run(
        vec![boxed(LockMode::CheckLock)],
        vec![main_fn(vec![
            new_box("Q"),
            Stmt::locked(LockKind::Write, Expr::name("Q"), vec![set_value("Q", 20, 5)]),
        ])],
    )
    .unwrap();
    assert!(checked.inserted.is_empty());
}

#[test]
fn lock_scope_ends_with_its_block() {
    let err = run(
        vec![boxed(LockMode::CheckLock)],
        vec![main_fn(vec![
            new_box("Q"),
            Stmt::locked(LockKind::Write, Expr::name("Q"), vec![set_value("Q", 10, 1)]),
            set_value("Q", 30, 2),
        ])],
    )
    .unwrap_err();
    assert_eq!(err.diagnostics.len(), 1);
    assert_eq!(err.diagnostics[0].span.offset(), 30);
}

#[test]
fn nested_blocks_restore_the_outer_state() {
    let err = run(
        vec![boxed(LockMode::CheckLock)],
        vec![main_fn(vec![
            new_box("q"),
            Stmt::locked(
                LockKind::Read,
                Expr::name("q"),
                vec![
                    Stmt::locked(LockKind::Write, Expr::name("q"), vec![set_value("q", 10, 1)]),
                    Stmt::expr(Expr::name("q").attr("peek").call(vec![])),
                    set_value("q", 40, 2),
                ],
            ),
        ])],
    )
    .unwrap_err();
    assert_eq!(err.diagnostics.len(), 1);
    assert_eq!(err.diagnostics[0].kind, LockErrorKind::UnlockedWrite);
    assert_eq!(err.diagnostics[0].span.offset(), 40);
}

#[test]
fn autolock_inserts_instead_of_failing() {
    let checked = run(
        vec![boxed(LockMode::AutoLock)],
        vec![main_fn(vec![
            new_box("q"),
            set_value("q", 20, 5),
            Stmt::expr(Expr::name("q").at(40, 1).attr("peek").call(vec![])),
        ])],
    )
    .unwrap();
    let kinds: Vec<LockKind> = checked.inserted.iter().map(|l| l.kind).collect();
    assert_eq!(kinds, vec![LockKind::Write, LockKind::Read]);

    let Stmt::Assign(assign) = &checked.program.functions[0].body.stmts[1] else {
        panic!("expected assignment");
    };
    let ExprKind::Attribute { base, .. } = &assign.target.kind else {
        panic!("expected attribute target");
    };
    assert!(matches!(
        base.kind,
        ExprKind::Locked {
            kind: LockKind::Write,
            ..
        }
    ));
}

#[test]
fn autolock_inside_a_held_lock_inserts_nothing() {
    let checked = run(
        vec![boxed(LockMode::AutoLock)],
        vec![main_fn(vec![
            new_box("q"),
            Stmt::locked(LockKind::Write, Expr::name("q"), vec![set_value("q", 20, 5)]),
        ])],
    )
    .unwrap();
    assert!(checked.inserted.is_empty());
}

#[test]
fn locked_reference_is_wrapped_even_for_nolock_classes() {
    let checked = run(
        vec![boxed(LockMode::NoLock)],
        vec![main_fn(vec![
            Stmt::let_(
                "q",
                TypeRef::named("Box").locked(),
                Some(Expr::name("Box").call(vec![])),
            ),
            set_value("q", 20, 5),
        ])],
    )
    .unwrap();
    assert_eq!(checked.inserted.len(), 1);
    assert_eq!(checked.inserted[0].binding, "q");
}

#[test]
fn parameters_are_locked_at_entry() {
    let f = FnDef::new(
        "fill",
        vec![
            Param::new("dst", TypeRef::named("Box")),
            Param::new("src", TypeRef::named("Box").constant()),
        ],
        vec![
            Stmt::assign(
                Expr::name("dst").attr("value"),
                Expr::name("src").attr("value"),
            ),
            set_value("src", 50, 0),
        ],
    );
    let err = run(vec![boxed(LockMode::CheckLock)], vec![f]).unwrap_err();
    assert_eq!(err.diagnostics.len(), 1);
    assert_eq!(err.diagnostics[0].binding, "src");
    assert_eq!(err.diagnostics[0].kind, LockErrorKind::UnlockedWrite);
}

#[test]
fn rebinding_or_deleting_a_locked_name_fails_in_every_mode() {
    for mode in [LockMode::NoLock, LockMode::CheckLock, LockMode::AutoLock] {
        let err = run(
            vec![boxed(mode)],
            vec![main_fn(vec![
                new_box("q"),
                Stmt::locked(
                    LockKind::Read,
                    Expr::name("q"),
                    vec![
                        Stmt::assign(Expr::name("q"), Expr::name("Box").call(vec![])),
                        Stmt::del(Expr::name("q")),
                        Stmt::for_("q", Expr::name("items"), vec![]),
                        Stmt::With(WithStmt {
                            span: span(0, 0),
                            context: Expr::name("items"),
                            target: Some(ident("q")),
                            target_ty: None,
                            body: Block::new(vec![]),
                        }),
                        Stmt::Try(TryStmt {
                            span: span(0, 0),
                            body: Block::new(vec![]),
                            handlers: vec![ExceptHandler {
                                span: span(0, 0),
                                ty: None,
                                name: Some(ident("q")),
                                body: Block::new(vec![]),
                            }],
                            finally: None,
                        }),
                    ],
                ),
            ])],
        )
        .unwrap_err();
        assert_eq!(err.count(LockErrorKind::RebindLockedName), 4, "{mode:?}");
        assert_eq!(err.count(LockErrorKind::DeleteLockedName), 1, "{mode:?}");
    }
}

#[test]
fn rebinding_after_the_block_is_fine() {
    let checked = run(
        vec![boxed(LockMode::CheckLock)],
        vec![main_fn(vec![
            new_box("q"),
            Stmt::locked(LockKind::Read, Expr::name("q"), vec![]),
            Stmt::assign(Expr::name("q"), Expr::name("Box").call(vec![])),
            Stmt::del(Expr::name("q")),
        ])],
    );
    assert!(checked.is_ok());
}

#[test]
fn unnamed_references_are_reported_as_this_expression() {
    let make = FnDef {
        ret: Some(TypeRef::named("Box")),
        ..FnDef::new("make", vec![], vec![Stmt::ret(Some(Expr::name("Box").call(vec![])))])
    };
    let err = run(
        vec![boxed(LockMode::CheckLock)],
        vec![
            make,
            main_fn(vec![
                Stmt::assign(
                    Expr::name("make").at(10, 4).call(vec![]).attr("value"),
                    Expr::int(1),
                ),
                Stmt::locked(LockKind::Write, Expr::name("make").at(30, 4).call(vec![]), vec![]),
                Stmt::let_("n", TypeRef::named("int"), Some(Expr::int(0))),
                Stmt::locked(LockKind::Read, Expr::name("n").at(50, 1), vec![]),
            ]),
        ],
    )
    .unwrap_err();
    let kinds: Vec<LockErrorKind> = err.diagnostics.iter().map(|d| d.kind).collect();
    assert_eq!(
        kinds,
        vec![
            LockErrorKind::UnlockedWrite,
            LockErrorKind::LockUnnamedReference,
            LockErrorKind::LockNonLockableReference,
        ]
    );
    assert_eq!(err.diagnostics[0].binding, "this expression");
    assert_eq!(err.diagnostics[2].binding, "n");
}

#[test]
fn all_violations_surface_in_one_run() {
    let err = run(
        vec![boxed(LockMode::CheckLock)],
        vec![
            FnDef::new("a", vec![], vec![new_box("x"), set_value("x", 300, 1)]),
            FnDef::new("b", vec![], vec![new_box("y"), set_value("y", 100, 1)]),
            FnDef::new(
                "c",
                vec![],
                vec![
                    new_box("z"),
                    Stmt::expr(Expr::name("z").at(200, 1).attr("peek").call(vec![])),
                ],
            ),
        ],
    )
    .unwrap_err();
    let offsets: Vec<usize> = err.diagnostics.iter().map(|d| d.span.offset()).collect();
    assert_eq!(offsets, vec![100, 200, 300]);
    assert_eq!(err.count(LockErrorKind::UnlockedRead), 1);
    assert_eq!(err.count(LockErrorKind::UnlockedWrite), 2);
}

fn container() -> ClassDef {
    ClassDef::new("Shelf", LockMode::CheckLock)
        .method(
            MethodDef::new(
                "__getitem__",
                vec![Param::new("i", TypeRef::named("int"))],
                Some(TypeRef::named("Box")),
            )
            .constant(),
        )
        .method(MethodDef::new(
            "__setitem__",
            vec![
                Param::new("i", TypeRef::named("int")),
                Param::new("item", TypeRef::named("Box").constant()),
            ],
            None,
        ))
}

#[test]
fn subscript_access_follows_item_method_constness() {
    let checked = run(
        vec![boxed(LockMode::CheckLock), container()],
        vec![FnDef::new(
            "read",
            vec![Param::new("s", TypeRef::named("Shelf").constant())],
            vec![Stmt::let_(
                "b",
                TypeRef::named("Box"),
                Some(Expr::name("s").index(Expr::int(0))),
            )],
        )],
    );
    assert!(checked.is_ok());

    let err = run(
        vec![boxed(LockMode::CheckLock), container()],
        vec![FnDef::new(
            "write",
            vec![Param::new("s", TypeRef::named("Shelf").constant())],
            vec![
                new_box("b"),
                Stmt::assign(
                    Expr::name("s").at(10, 1).index(Expr::int(0)),
                    Expr::name("b").at(20, 1),
                ),
            ],
        )],
    )
    .unwrap_err();
    // the shelf needs a write lock, the stored item a read lock
    let found: Vec<(String, Option<LockKind>)> = err
        .diagnostics
        .iter()
        .map(|d| (d.binding.clone(), d.required))
        .collect();
    assert_eq!(
        found,
        vec![
            ("s".to_string(), Some(LockKind::Write)),
            ("b".to_string(), Some(LockKind::Read)),
        ]
    );
}

#[test]
fn operators_use_forward_then_reflected_methods() {
    let num = ClassDef::new("Num", LockMode::CheckLock)
        .method(
            MethodDef::new(
                "__add__",
                vec![Param::new("other", TypeRef::named("Num").constant())],
                Some(TypeRef::named("Num")),
            )
            .constant(),
        )
        .method(MethodDef::new(
            "__rsub__",
            vec![Param::new("other", TypeRef::named("int"))],
            Some(TypeRef::named("int")),
        ));
    let err = run(
        vec![num],
        vec![main_fn(vec![
            Stmt::let_("a", TypeRef::named("Num"), Some(Expr::name("Num").call(vec![]))),
            Stmt::let_("b", TypeRef::named("Num"), Some(Expr::name("Num").call(vec![]))),
            Stmt::expr(Expr::name("a").at(10, 1).binary(BinOp::Add, Expr::name("b").at(14, 1))),
            Stmt::expr(Expr::int(1).at(20, 1).binary(BinOp::Sub, Expr::name("a").at(24, 1))),
        ])],
    )
    .unwrap_err();
    let found: Vec<(usize, LockErrorKind)> = err
        .diagnostics
        .iter()
        .map(|d| (d.span.offset(), d.kind))
        .collect();
    assert_eq!(
        found,
        vec![
            (10, LockErrorKind::UnlockedRead),
            (14, LockErrorKind::UnlockedRead),
            (24, LockErrorKind::UnlockedWrite),
        ]
    );
}

#[test]
fn arguments_follow_parameter_constness() {
    let sink = ClassDef::new("Sink", LockMode::CheckLock).method(MethodDef::new(
        "absorb",
        vec![
            Param::new("from", TypeRef::named("Box")),
            Param::new("peek", TypeRef::named("Box").constant()),
        ],
        None,
    ));
    let err = run(
        vec![boxed(LockMode::CheckLock), sink],
        vec![FnDef::new(
            "main",
            vec![Param::new("s", TypeRef::named("Sink"))],
            vec![
                new_box("x"),
                new_box("y"),
                Stmt::expr(
                    Expr::name("s")
                        .attr("absorb")
                        .call(vec![Expr::name("x").at(10, 1), Expr::name("y").at(12, 1)]),
                ),
            ],
        )],
    )
    .unwrap_err();
    assert_eq!(err.diagnostics[0].required, Some(LockKind::Write));
    assert_eq!(err.diagnostics[1].required, Some(LockKind::Read));
}

#[test]
fn activation_does_not_touch_the_object() {
    let checked = run(
        vec![boxed(LockMode::CheckLock).activable()],
        vec![main_fn(vec![
            new_box("q"),
            Stmt::let_(
                "p",
                TypeRef::named("Box").activated(),
                Some(Expr::name("q").activate()),
            ),
        ])],
    );
    assert!(checked.is_ok());
}
