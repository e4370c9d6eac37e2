mod test_helpers;

use crate::test_helpers::{
    append_named, load_named, record, take_events, test_ex, test_nonex, V0_1,
};
use anyhow::format_err;
use keel_runtime::{
    keel_module, Config, Context, DependencyKind, Error, ErrorKind, ExportBuilder, LoadFailure,
    LoadingSet, ModuleExport, ModuleInstance, ModuleSource, ModuleState, PseudoInstance, Version,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn cyc_x() -> Result<ModuleExport, Error> {
    ExportBuilder::new("cyc_x")
        .with_symbol_import("y_sym", "", V0_1)
        .with_static_export("x_sym", "", V0_1, 1u8)
        .build()
}

fn cyc_y() -> Result<ModuleExport, Error> {
    ExportBuilder::new("cyc_y")
        .with_symbol_import("x_sym", "", V0_1)
        .with_static_export("y_sym", "", V0_1, 2u8)
        .build()
}

fn broken() -> Result<ModuleExport, Error> {
    ExportBuilder::new("broken")
        .with_symbol_import("a_export_0", "", V0_1)
        .with_static_export("broken_sym", "", V0_1, 0u8)
        .with_constructor(|_, _| -> anyhow::Result<()> {
            record("construct broken");
            Err(format_err!("broken on purpose"))
        })
        .build()
}

fn after_broken() -> Result<ModuleExport, Error> {
    ExportBuilder::new("after_broken")
        .with_symbol_import("broken_sym", "", V0_1)
        .build()
}

fn a_clone() -> Result<ModuleExport, Error> {
    ExportBuilder::new("a_clone")
        .with_static_export("a_export_0", "", V0_1, 0u32)
        .build()
}

fn orphan() -> Result<ModuleExport, Error> {
    ExportBuilder::new("orphan")
        .with_symbol_import("nothing_here", "", V0_1)
        .build()
}

fn evented() -> Result<ModuleExport, Error> {
    ExportBuilder::new("evented")
        .with_start_event(|instance| {
            record(format!("start {}", instance.name()));
            Ok(())
        })
        .with_stop_event(|instance| record(format!("stop {}", instance.name())))
        .build()
}

fn bad_start() -> Result<ModuleExport, Error> {
    ExportBuilder::new("bad_start")
        .with_constructor(|_, _| {
            record("construct bad_start");
            Ok(())
        })
        .with_destructor(|_, _: Arc<()>| record("destroy bad_start"))
        .with_start_event(|_| Err(format_err!("refusing to start")))
        .with_stop_event(|_| record("stop bad_start"))
        .build()
}

keel_module!(cyc_x);
keel_module!(cyc_y);
keel_module!(broken);
keel_module!(after_broken);
keel_module!(a_clone);
keel_module!(orphan);
keel_module!(evented);
keel_module!(bad_start);

fn exe_dir() -> std::path::PathBuf {
    std::env::current_exe()
        .unwrap()
        .canonicalize()
        .unwrap()
        .parent()
        .unwrap()
        .to_path_buf()
}

#[test]
fn modules_construct_after_their_imports() {
    test_ex(|| {
        let ctx = Context::new();
        load_named(&ctx, &["c", "b", "a"]).unwrap();
        let dir = exe_dir();
        assert_eq!(
            take_events(),
            vec![
                "construct a".to_owned(),
                "construct b".to_owned(),
                "construct b_export_1".to_owned(),
                "construct c".to_owned(),
                format!(
                    "c resources {:?}",
                    vec![dir.clone(), dir.join("c.bin"), dir.join("data/c.txt")]
                ),
            ]
        );

        let a = ctx.find_by_name("a").unwrap();
        assert_eq!(a.description(), Some("root module"));
        assert_eq!(a.author(), Some("keel"));
        assert_eq!(a.license(), Some("MIT"));
        assert_eq!(a.module_path(), Some(dir.as_path()));
        assert_eq!(a.dependent_count(), 1);
        assert!(ctx.namespace_exists("a"));
        assert!(ctx.namespace_exists("c"));
        let b = ctx
            .find_by_symbol("b_export_1", "", &Version::new(0, 1, 2))
            .unwrap();
        assert_eq!(b.name(), "b");

        // everything c needs stays loaded while c is
        assert_eq!(a.unload(&ctx).unwrap_err().kind(), ErrorKind::Busy);
        ctx.find_by_name("c").unwrap().unload(&ctx).unwrap();
        b.unload(&ctx).unwrap();
        a.unload(&ctx).unwrap();
        assert_eq!(
            take_events(),
            vec![
                "destroy c",
                "destroy b_export_1",
                "destroy b",
                "destroy a"
            ]
        );
        assert!(!ctx.namespace_exists("a"));
        assert_eq!(ctx.ref_count(), 1);
    })
}

#[test]
fn namespaces_gate_symbol_loading() {
    test_nonex(|| {
        let ctx = Context::new();
        load_named(&ctx, &["a", "b"]).unwrap();
        let host = PseudoInstance::new(&ctx).unwrap();
        let a = ctx.find_by_name("a").unwrap();
        let b = ctx.find_by_name("b").unwrap();

        let err = host
            .load_symbol::<u32>("a_export_0", "", &V0_1)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        host.acquire_dependency(&a).unwrap();
        assert_eq!(host.has_dependency(&a), DependencyKind::Dynamic);
        assert_eq!(
            host.acquire_dependency(&a).unwrap_err().kind(),
            ErrorKind::AlreadyExists
        );
        assert_eq!(*host.load_symbol::<u32>("a_export_0", "", &V0_1).unwrap(), 5);

        let err = host
            .load_symbol::<u32>("a_export_1", "a", &V0_1)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        host.include_namespace("a").unwrap();
        assert_eq!(host.has_namespace_dependency("a"), DependencyKind::Dynamic);
        assert_eq!(
            host.include_namespace("a").unwrap_err().kind(),
            ErrorKind::AlreadyExists
        );
        assert_eq!(*host.load_symbol::<u32>("a_export_1", "a", &V0_1).unwrap(), 10);
        host.exclude_namespace("a").unwrap();
        assert_eq!(
            host.load_symbol::<u32>("a_export_1", "a", &V0_1)
                .unwrap_err()
                .kind(),
            ErrorKind::PermissionDenied
        );
        assert_eq!(
            host.include_namespace("nowhere").unwrap_err().kind(),
            ErrorKind::NotFound
        );

        // wrong type, wrong version
        assert_eq!(
            host.load_symbol::<i64>("a_export_0", "", &V0_1)
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            host.load_symbol::<u32>("a_export_0", "", &Version::new(0, 2, 0))
                .unwrap_err()
                .kind(),
            ErrorKind::NotFound
        );

        // a loaned symbol pins its edge
        host.acquire_dependency(&b).unwrap();
        let dynamic = host
            .load_symbol::<u64>("b_export_1", "", &Version::new(0, 1, 1))
            .unwrap();
        assert_eq!(*dynamic, 7);
        assert_eq!(dynamic.id().version, Version::new(0, 1, 3));
        assert_eq!(host.remove_dependency(&b).unwrap_err().kind(), ErrorKind::Busy);
        drop(dynamic);
        host.remove_dependency(&b).unwrap();
        assert_eq!(host.has_dependency(&b), DependencyKind::None);
        assert_eq!(
            host.remove_dependency(&b).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    })
}

#[test]
fn imported_symbols_still_need_their_namespace() {
    test_ex(|| {
        let ctx = Context::new();
        let host = PseudoInstance::new(&ctx).unwrap();
        let slot: Arc<Mutex<Option<ModuleInstance>>> = Arc::default();
        let stash = slot.clone();
        let gated = ExportBuilder::new("gated")
            .with_symbol_import("a_export_0", "", V0_1)
            .with_symbol_import("a_export_1", "a", V0_1)
            .with_symbol_import("b_export_0", "b", V0_1)
            .with_constructor(|_, _| {
                record("construct gated");
                Ok(())
            })
            .with_start_event(move |instance| {
                *stash.lock().unwrap() = Some(instance.clone());
                Ok(())
            })
            .build()
            .unwrap();
        let mut set = LoadingSet::new(&ctx);
        set.append_freestanding_module(&host, gated).unwrap();
        append_named(&mut set, &["a", "b"]).unwrap();
        set.finish().unwrap();
        assert_eq!(
            take_events(),
            vec![
                "construct a",
                "construct b",
                "construct b_export_1",
                "construct gated"
            ]
        );
        for name in &["a", "b", "gated"] {
            assert_eq!(ctx.find_by_name(name).unwrap().state(), ModuleState::Loaded);
        }

        let gated = slot.lock().unwrap().take().unwrap();
        assert_eq!(gated.imports().len(), 3);
        assert_eq!(*gated.load_symbol::<u32>("a_export_0", "", &V0_1).unwrap(), 5);
        assert_eq!(
            gated
                .load_symbol::<i64>("b_export_0", "b", &V0_1)
                .unwrap_err()
                .kind(),
            ErrorKind::PermissionDenied
        );
        gated.include_namespace("b").unwrap();
        assert_eq!(gated.has_namespace_dependency("b"), DependencyKind::Dynamic);
        assert_eq!(
            *gated.load_symbol::<i64>("b_export_0", "b", &V0_1).unwrap(),
            -2
        );
        assert_eq!(
            gated
                .load_symbol::<u32>("a_export_1", "a", &V0_1)
                .unwrap_err()
                .kind(),
            ErrorKind::PermissionDenied
        );
    })
}

#[test]
fn static_edges_can_not_be_removed() {
    test_nonex(|| {
        let ctx = Context::new();
        load_named(&ctx, &["a", "b", "c"]).unwrap();
        let a = ctx.find_by_name("a").unwrap();
        let host = PseudoInstance::new(&ctx).unwrap();

        let free = ExportBuilder::new("pinned")
            .with_dependency(&a)
            .with_namespace_import("a")
            .with_start_event(|instance| {
                let a = instance.context().find_by_name("a")?;
                assert_eq!(instance.has_dependency(&a), DependencyKind::Static);
                assert_eq!(
                    instance.remove_dependency(&a).unwrap_err().kind(),
                    ErrorKind::PermissionDenied
                );
                assert_eq!(
                    instance.exclude_namespace("a").unwrap_err().kind(),
                    ErrorKind::PermissionDenied
                );
                assert_eq!(
                    *instance.load_symbol::<u32>("a_export_1", "a", &V0_1)?,
                    10
                );
                Ok(())
            })
            .build()
            .unwrap();
        let mut set = LoadingSet::new(&ctx);
        set.append_freestanding_module(&host, free).unwrap();
        assert_eq!(host.module_info().unload_lock_count(), 1);
        set.finish().unwrap();
        assert_eq!(host.module_info().unload_lock_count(), 0);
        assert_eq!(a.dependent_count(), 2);
    })
}

#[test]
fn cyclic_imports_are_rejected() {
    test_nonex(|| {
        let ctx = Context::new();
        let mut set = LoadingSet::new(&ctx);
        append_named(&mut set, &["cyc_x", "cyc_y"]).unwrap();
        match set.finish() {
            Err(Error::CyclicDependency(path)) => {
                assert!(path.contains("cyc_x") && path.contains("cyc_y"), "{}", path)
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(ctx.loaded_modules().is_empty());
        assert!(set.has_module("cyc_x"));
    })
}

#[test]
fn dynamic_dependency_cycles_are_rejected() {
    test_nonex(|| {
        let ctx = Context::new();
        let host = PseudoInstance::new(&ctx).unwrap();
        let started: Arc<Mutex<Vec<ModuleInstance>>> = Arc::default();
        let mut set = LoadingSet::new(&ctx);
        for name in &["cyc_p", "cyc_q"] {
            let started = started.clone();
            let export = ExportBuilder::new(*name)
                .with_start_event(move |instance| {
                    started.lock().unwrap().push(instance.clone());
                    Ok(())
                })
                .build()
                .unwrap();
            set.append_freestanding_module(&host, export).unwrap();
        }
        set.finish().unwrap();

        let (p, q) = {
            let started = started.lock().unwrap();
            (started[0].clone(), started[1].clone())
        };
        assert_eq!(p.name(), "cyc_p");
        match p.acquire_dependency(p.module_info()) {
            Err(Error::CyclicDependency(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        p.acquire_dependency(q.module_info()).unwrap();
        match q.acquire_dependency(p.module_info()) {
            Err(Error::CyclicDependency(path)) => assert_eq!(path, "cyc_q -> cyc_p -> cyc_q"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(
            host.acquire_dependency(host.module_info()).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        p.remove_dependency(q.module_info()).unwrap();
        q.acquire_dependency(p.module_info()).unwrap();
        assert_eq!(p.module_info().dependent_count(), 1);
    })
}

#[test]
fn failed_construction_rolls_back() {
    test_ex(|| {
        let ctx = Context::new();
        let mut set = LoadingSet::new(&ctx);
        append_named(&mut set, &["a", "b", "broken", "after_broken"]).unwrap();

        let outcomes = Arc::new(Mutex::new(vec![]));
        for name in &["a", "b", "broken", "after_broken"] {
            let ok = outcomes.clone();
            let err = outcomes.clone();
            set.append_callback(
                name,
                move |info| ok.lock().unwrap().push(format!("loaded {}", info.name())),
                move |export, failure| {
                    let what = match failure {
                        LoadFailure::Failed(e) => format!("{:?}", e.kind()),
                        LoadFailure::Dismissed => "dismissed".to_owned(),
                    };
                    err.lock()
                        .unwrap()
                        .push(format!("failed {} {}", export.name(), what));
                },
            )
            .unwrap();
        }
        let set_failures = Arc::new(AtomicUsize::new(0));
        let counter = set_failures.clone();
        set.append_set_callback(
            |_| panic!("set must not succeed"),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

        match set.finish() {
            Err(Error::ConstructionFailed { module, .. }) => assert_eq!(module, "broken"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(
            take_events(),
            vec!["construct a", "construct broken", "destroy a"]
        );
        assert!(ctx.loaded_modules().is_empty());
        assert_eq!(set_failures.load(Ordering::SeqCst), 1);
        assert_eq!(
            *outcomes.lock().unwrap(),
            vec![
                "failed broken ConstructionFailed",
                "failed after_broken ConstructionFailed",
                "failed b ConstructionFailed",
            ]
        );

        // failed modules report straight away, the rolled back one is retried
        let late = Arc::new(AtomicUsize::new(0));
        let seen = late.clone();
        set.append_callback(
            "broken",
            |_| panic!("broken can not load"),
            move |_, failure| {
                assert!(matches!(failure, LoadFailure::Failed(_)));
                seen.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();
        assert_eq!(late.load(Ordering::SeqCst), 1);
        assert!(!set.has_module("broken"));

        set.finish().unwrap();
        assert_eq!(take_events(), vec!["construct a"]);
        assert_eq!(outcomes.lock().unwrap().last().unwrap(), "loaded a");
        assert_eq!(
            ctx.find_by_name("a").unwrap().state(),
            ModuleState::Loaded
        );
    })
}

#[test]
fn start_and_stop_events() {
    test_ex(|| {
        let ctx = Context::new();
        load_named(&ctx, &["evented"]).unwrap();
        ctx.find_by_name("evented").unwrap().unload(&ctx).unwrap();
        assert_eq!(take_events(), vec!["start evented", "stop evented"]);

        let err = load_named(&ctx, &["bad_start"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConstructionFailed);
        assert_eq!(
            take_events(),
            vec!["construct bad_start", "destroy bad_start"]
        );
        assert!(ctx.find_by_name("bad_start").is_err());
    })
}

#[test]
fn appends_are_all_or_nothing() {
    test_nonex(|| {
        let ctx = Context::new();
        let mut set = LoadingSet::new(&ctx);
        append_named(&mut set, &["a"]).unwrap();
        assert_eq!(
            append_named(&mut set, &["a"]).unwrap_err().kind(),
            ErrorKind::AlreadyExists
        );
        // b is fine on its own but a_clone reuses a symbol of a
        assert_eq!(
            append_named(&mut set, &["b", "a_clone"]).unwrap_err().kind(),
            ErrorKind::AlreadyExists
        );
        assert!(!set.has_module("b"));
        assert!(set.has_module("a"));
        assert!(set.has_symbol("a_export_0", "", &V0_1));
        set.finish().unwrap();

        assert_eq!(
            set.finish().unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            append_named(&mut set, &["b"]).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );

        let mut again = LoadingSet::new(&ctx);
        assert_eq!(
            append_named(&mut again, &["a"]).unwrap_err().kind(),
            ErrorKind::AlreadyExists
        );
        assert_eq!(
            append_named(&mut again, &["a_clone"]).unwrap_err().kind(),
            ErrorKind::AlreadyExists
        );
        assert!(again.has_module("a"));
    })
}

#[test]
fn callbacks_for_loaded_and_dismissed_modules() {
    test_nonex(|| {
        let ctx = Context::new();
        load_named(&ctx, &["a"]).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let mut set = LoadingSet::new(&ctx);
        let h = hits.clone();
        set.append_callback(
            "a",
            move |info| {
                assert_eq!(info.name(), "a");
                h.fetch_add(1, Ordering::SeqCst);
            },
            |_, _| panic!("a is loaded"),
        )
        .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(
            set.append_callback("zzz", |_| {}, |_, _| {})
                .unwrap_err()
                .kind(),
            ErrorKind::NotFound
        );

        append_named(&mut set, &["b"]).unwrap();
        let h = hits.clone();
        set.append_callback(
            "b",
            |_| panic!("b is never loaded"),
            move |export, failure| {
                assert_eq!(export.name(), "b");
                assert!(matches!(failure, LoadFailure::Dismissed));
                h.fetch_add(10, Ordering::SeqCst);
            },
        )
        .unwrap();
        let h = hits.clone();
        set.append_set_callback(
            |_| panic!("never finished"),
            move |failure| {
                assert!(matches!(failure, LoadFailure::Dismissed));
                h.fetch_add(100, Ordering::SeqCst);
            },
        )
        .unwrap();
        set.dismiss();
        assert_eq!(hits.load(Ordering::SeqCst), 111);
        assert!(ctx.find_by_name("b").is_err());
    })
}

#[test]
fn set_callbacks_see_every_module() {
    test_nonex(|| {
        let ctx = Context::new();
        let mut set = LoadingSet::new(&ctx);
        append_named(&mut set, &["a", "b", "c"]).unwrap();
        let names = Arc::new(Mutex::new(vec![]));
        let n = names.clone();
        set.append_set_callback(
            move |infos| {
                n.lock()
                    .unwrap()
                    .extend(infos.iter().map(|i| i.name().to_owned()))
            },
            |_| panic!("set must succeed"),
        )
        .unwrap();
        set.finish().unwrap();
        assert_eq!(*names.lock().unwrap(), vec!["a", "b", "c"]);
    })
}

#[test]
fn unresolved_imports_change_nothing() {
    test_nonex(|| {
        let ctx = Context::new();
        let err = load_named(&ctx, &["a", "orphan"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(ctx.loaded_modules().is_empty());

        // c needs b
        let err = load_named(&ctx, &["a", "c"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(ctx.find_by_name("a").is_err());
    })
}

#[test]
fn module_limit_is_enforced() {
    test_nonex(|| {
        let ctx = Context::with_config(Config::default().with_max_modules(2)).unwrap();
        let err = load_named(&ctx, &["a", "b", "c"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        load_named(&ctx, &["a", "b"]).unwrap();
    })
}

#[test]
fn finish_inside_a_constructor_is_busy() {
    test_nonex(|| {
        let ctx = Context::new();
        let nested = Arc::new(Mutex::new(None));
        let result = nested.clone();
        let host = PseudoInstance::new(&ctx).unwrap();
        let outer = ExportBuilder::new("outer")
            .with_constructor(move |instance, _| {
                let mut inner = LoadingSet::new(instance.context());
                inner.append_modules(ModuleSource::Current, |e| e.name() == "a")?;
                *result.lock().unwrap() = Some(inner.finish().map_err(|e| e.kind()));
                Ok(())
            })
            .build()
            .unwrap();
        let mut set = LoadingSet::new(&ctx);
        set.append_freestanding_module(&host, outer).unwrap();
        set.finish().unwrap();
        assert_eq!(*nested.lock().unwrap(), Some(Err(ErrorKind::Busy)));
    })
}
