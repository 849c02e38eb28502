//! Private-first dependency resolution against real directory layouts.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use common::Layout;
use isoload_core::prelude::*;
use isoload_core::binary::library_file_name;
use isoload_core::{BoundDependency, Resolution, StaticModule};

#[test]
fn test_strongest_private_match_wins() {
    let layout = Layout::new();
    layout.manifest(
        r#"
references = ["codec"]

[dependencies]
codec = "^1.2"
"#,
    );
    layout.module(common::hello_module());
    let plugin_dir = layout.plugin_dir();
    layout.library(&plugin_dir, "codec-1.1.0", StaticModule::library());
    layout.library(&plugin_dir, "codec-1.2.0", StaticModule::library());
    let expected = layout.library(&plugin_dir.join("deps"), "codec-1.4.2", StaticModule::library());
    layout.library(&plugin_dir, "codec-2.0.0", StaticModule::library());

    let context = load(&layout);

    match context.resolve("codec").unwrap() {
        Resolution::Private(path) => assert_eq!(path, expected),
        other => panic!("expected a private resolution, got {:?}", other),
    }
    assert_eq!(context.local_bindings(), vec!["codec".to_string()]);
    assert!(context.shared_bindings().is_empty());
}

#[test]
fn test_resolution_is_idempotent() {
    let layout = Layout::new();
    layout.manifest(
        r#"
[dependencies]
codec = "1"
"#,
    );
    layout.module(common::hello_module());
    let plugin_dir = layout.plugin_dir();
    layout.library(&plugin_dir, "codec-1.0.0", StaticModule::library());

    let context = load(&layout);
    let first = context.resolve("codec").unwrap();

    // A better candidate appearing later does not change an earlier answer
    layout.library(&plugin_dir, "codec-1.9.0", StaticModule::library());
    assert_eq!(context.resolve("codec").unwrap(), first);

    let a = context.bind_dependency("codec").unwrap();
    let b = context.bind_dependency("codec").unwrap();
    assert_eq!(a.origin(), b.origin());
    assert_eq!(layout.loader.total_opens(a.origin()), 1);
}

#[test]
fn test_undeclared_dependency_falls_back_to_shared() {
    let layout = Layout::new();
    layout.manifest(r#"references = ["runtime"]"#);
    layout.module(common::hello_module());
    // Present privately, but not declared: still shared
    layout.library(&layout.plugin_dir(), "runtime", StaticModule::library());
    let shared_copy = layout.library(&layout.shared_dir(), "runtime", StaticModule::library());

    let context = load(&layout);

    assert_eq!(context.resolve("runtime").unwrap(), Resolution::Shared);
    match context.bind_dependency("runtime").unwrap() {
        BoundDependency::Shared(dep) => {
            assert_eq!(dep.origin(), shared_copy.canonicalize().unwrap())
        }
        other => panic!("expected a shared binding, got {:?}", other),
    }
}

#[test]
fn test_unsatisfied_requirement_falls_back_to_shared() {
    let layout = Layout::new();
    layout.manifest(
        r#"
[dependencies]
codec = "^3"
"#,
    );
    layout.module(common::hello_module());
    layout.library(&layout.plugin_dir(), "codec-2.5.0", StaticModule::library());

    let context = load(&layout);
    assert_eq!(context.resolve("codec").unwrap(), Resolution::Shared);
}

#[test]
fn test_native_library_private_then_system() {
    let layout = Layout::new();
    layout.manifest(
        r#"
[native]
sqlite = "*"
zlib = "*"
"#,
    );
    layout.module(common::hello_module());
    let private = layout.library(&layout.plugin_dir().join("deps"), "sqlite", StaticModule::library());
    layout.loader.register_system("zlib", StaticModule::library());

    let context = load(&layout);
    assert_eq!(context.native_bindings(), vec!["sqlite".to_string(), "zlib".to_string()]);
    assert_eq!(layout.loader.open_handles(&private), 1);

    assert_eq!(
        context.bind_native("zlib").unwrap(),
        PathBuf::from(library_file_name("zlib"))
    );

    drop(context);
    assert_eq!(layout.loader.open_handle_count(), 0);
}

#[test]
fn test_lookups_refused_after_unload() {
    let layout = Layout::new();
    layout.module(common::hello_module());

    let context = load(&layout);
    let lease = context.lease();
    let _ticket = context.unload();

    let err = lease.bind_dependency("anything").unwrap_err();
    assert!(matches!(err, LoadError::ContextUnloading(_)));
}

fn load(layout: &Layout) -> IsolatedContext {
    IsolatedContext::load(&layout.descriptor(), &layout.env(Arc::new(SharedRegistry::new()))).unwrap()
}
