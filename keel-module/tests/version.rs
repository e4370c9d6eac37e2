use keel_module::Version;

#[test]
fn version_compatibility() {
    let required = Version::new_with_build(1, 5, 0, 10);

    // identical versions, build included
    assert!(Version::new_with_build(1, 5, 0, 10).compatible_with(&required));

    // an older minor can not stand in for a newer one
    assert!(!Version::new(1, 4, 0).compatible_with(&required));

    // a newer minor and patch can, and the build number plays no part
    assert!(Version::new(1, 9, 1).compatible_with(&required));
    assert!(Version::new(1, 5, 0).compatible_with(&required));

    // under major 0 every minor is a breaking change
    assert!(!Version::new(0, 2, 1).compatible_with(&Version::new(0, 1, 0)));
    assert!(Version::new(0, 1, 3).compatible_with(&Version::new(0, 1, 0)));

    // majors never mix
    assert!(!Version::new(2, 0, 0).compatible_with(&Version::new(1, 0, 0)));
}

#[test]
fn version_serializes_as_string() {
    let v: Version = "0.1.0+3".parse().expect("parse version");
    let json = serde_json::to_string(&v).expect("serialize version");
    assert_eq!(json, "\"0.1.0+3\"");
    let back: Version = serde_json::from_str(&json).expect("deserialize version");
    assert_eq!(back, v);
    assert!(serde_json::from_str::<Version>("\"0.1\"").is_err());
}

#[test]
fn version_macro_reads_this_crate() {
    let v = keel_module::version!();
    assert_eq!(v.to_string(), env!("CARGO_PKG_VERSION"));
}
