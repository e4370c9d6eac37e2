use keel_runtime::{
    Context, ErrorKind, LoadingSet, ModuleLibrary, ModuleSource, ParameterValue, PseudoInstance,
    Version,
};
use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::io::Write;
use std::path::{Path, PathBuf};

/// The `keel-library-fixture` shared object cargo built next to this test binary.
fn fixture_library() -> PathBuf {
    let deps = std::env::current_exe().unwrap();
    let deps = deps.parent().unwrap();
    let prefix = format!("{}keel_library_fixture", DLL_PREFIX);
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(deps)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| {
            let name = path.file_name().unwrap().to_string_lossy();
            name.starts_with(&prefix) && name.ends_with(DLL_SUFFIX)
        })
        .collect();
    candidates.sort_by_key(|path| std::fs::metadata(path).unwrap().modified().unwrap());
    candidates
        .pop()
        .unwrap_or_else(|| panic!("no {}* in {}", prefix, deps.display()))
}

const SHARED: Version = Version::new(0, 1, 0);

#[test]
fn missing_libraries_are_not_found() {
    let ctx = Context::new();
    let mut set = LoadingSet::new(&ctx);
    let err = set
        .append_modules(
            ModuleSource::Path(Path::new("/nonexistent/libkeel_missing.so")),
            |_| true,
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn junk_files_are_invalid() {
    let mut junk = tempfile::NamedTempFile::new().unwrap();
    junk.write_all(b"this is not a shared object").unwrap();
    junk.flush().unwrap();
    let err = ModuleLibrary::open(junk.path()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn relative_paths_resolve_against_the_module_root() {
    let root = tempfile::tempdir().unwrap();
    let ctx = Context::builder()
        .with_options_json(&format!(
            r#"[{{"type": "module_root", "path": {:?}}}]"#,
            root.path().to_str().unwrap()
        ))
        .unwrap()
        .build()
        .unwrap();
    assert_eq!(ctx.config().module_root.as_deref(), Some(root.path()));

    std::fs::write(root.path().join("libjunk.so"), b"junk").unwrap();
    let mut set = LoadingSet::new(&ctx);
    let err = set
        .append_modules(ModuleSource::Path(Path::new("libjunk.so")), |_| true)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    let err = set
        .append_modules(ModuleSource::Path(Path::new("libabsent.so")), |_| true)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn the_running_binary_is_a_library() {
    let current = ModuleLibrary::current();
    assert_eq!(
        current.path().map(Path::to_path_buf),
        Some(std::env::current_exe().unwrap().canonicalize().unwrap())
    );
    // no modules are registered in this test binary
    assert!(current.exports().unwrap().is_empty());
}

#[test]
fn shared_objects_provide_modules() {
    let path = fixture_library().canonicalize().unwrap();
    let ctx = Context::new();
    let mut set = LoadingSet::new(&ctx);
    set.append_modules(ModuleSource::Path(&path), |export| {
        export.name().starts_with("shared_")
    })
    .unwrap();
    assert!(set.has_module("shared_base"));
    assert!(set.has_module("shared_user"));
    set.finish().unwrap();
    drop(set);

    let base = ctx.find_by_name("shared_base").unwrap();
    let user = ctx.find_by_name("shared_user").unwrap();
    assert_eq!(base.module_path(), path.parent());
    assert_eq!(
        base.description(),
        Some("provides symbols from a shared object")
    );
    assert_eq!(user.dependent_count(), 0);
    assert_eq!(base.dependent_count(), 1);
    assert_eq!(
        ctx.read_parameter("shared_user", "scale").unwrap(),
        ParameterValue::U32(2)
    );
    assert_eq!(
        ctx.write_parameter("shared_user", "scale", 3u32)
            .unwrap_err()
            .kind(),
        ErrorKind::PermissionDenied
    );

    let host = PseudoInstance::new(&ctx).unwrap();
    host.acquire_dependency(&base).unwrap();
    host.include_namespace("shared").unwrap();
    assert_eq!(
        *host.load_symbol::<u32>("shared_value", "", &SHARED).unwrap(),
        42
    );
    assert_eq!(
        host.load_symbol::<String>("shared_greeting", "shared", &SHARED)
            .unwrap()
            .as_str(),
        "hello from a shared object"
    );
    host.remove_dependency(&base).unwrap();

    // destructors and drop glue live in the shared object, which stays mapped until the last
    // of its modules is gone
    user.unload(&ctx).unwrap();
    base.unload(&ctx).unwrap();
    assert!(ctx.loaded_modules().is_empty());
}
