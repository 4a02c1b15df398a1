//! Integration tests for layer lifecycle operations of the driver.

mod common;

use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::PathBuf;

use common::{LineArchive, create_chain, driver_with_options, test_driver};
use lamina::{ChangeKind, CreateOpts, Driver, DriverConfig, MountOpts};
use lamina_common::paths::layer;
use lamina_common::{Digest, LaminaError};

#[test_log::test]
fn test_init_creates_store_layout() {
    let t = test_driver();
    let paths = t.driver.paths();
    assert!(paths.link_dir().is_dir());
    assert!(paths.runhome.is_dir());
    assert!(paths.mount_program_flag().exists());
    assert_eq!(t.driver.name(), "overlay");
    assert!(t.driver.supports_shifting());
    assert!(t.driver.use_naive_diff());
}

#[test]
fn test_status_reports_driver_facts() {
    let t = test_driver();
    let status: HashMap<_, _> = t.driver.status().into_iter().collect();
    assert_eq!(status["Native Overlay Diff"], "false");
    assert_eq!(status["Using metacopy"], "false");
    assert_eq!(status["Supports d_type"], "true");
    assert!(!status["Backing Filesystem"].is_empty());
}

#[test]
fn test_init_rejects_bad_options() {
    let root = tempfile::tempdir().unwrap();
    let config = DriverConfig::with_roots(root.path().join("g"), root.path().join("r"));

    let err = Driver::init(config.clone().with_options(["overlay.bogus=1"])).unwrap_err();
    assert!(err.to_string().contains("Unknown option"));

    let err = Driver::init(config.clone().with_options(["overlay.force_mask=0755"])).unwrap_err();
    assert!(err.to_string().contains("force_mask"));

    let err = Driver::init(config.with_options(["overlay.mount_program=/does/not/exist"])).unwrap_err();
    assert!(matches!(err, LaminaError::Config { .. }));
}

#[test]
fn test_create_and_metadata() {
    let t = test_driver();
    create_chain(&t.driver, &["base", "mid", "top"]);
    assert!(t.driver.exists("top"));

    let meta = t.driver.metadata("top").unwrap();
    let dir = t.driver.store().dir("top");
    assert_eq!(meta.upper_dir, dir.join(layer::DIFF));
    assert_eq!(meta.work_dir, dir.join(layer::WORK));
    assert_eq!(meta.merged_dir, dir.join(layer::MERGED));
    let expected = format!(
        "{}:{}",
        t.driver.store().dir("mid").join(layer::DIFF).display(),
        t.driver.store().dir("base").join(layer::DIFF).display()
    );
    assert_eq!(meta.lower_dir.as_deref(), Some(expected.as_str()));

    assert!(t.driver.metadata("base").unwrap().lower_dir.is_none());
    assert!(t.driver.metadata("ghost").unwrap_err().is_not_found());
}

#[test]
fn test_invalid_layer_id_is_rejected() {
    let t = test_driver();
    assert!(matches!(
        t.driver.create("../escape", None, None),
        Err(LaminaError::InvalidLayerId { .. })
    ));
}

#[test]
fn test_size_only_for_read_write_layers() {
    let t = test_driver();
    let opts = CreateOpts {
        storage_opt: HashMap::from([("size".to_string(), "1G".to_string())]),
        id_mappings: None,
    };
    let err = t.driver.create("ro", None, Some(&opts)).unwrap_err();
    assert!(err.to_string().contains("only supported for ReadWrite Layers"));
    assert!(!t.driver.exists("ro"));

    // Without a quota controller storage options are refused outright.
    let err = t.driver.create_read_write("rw", None, Some(&opts)).unwrap_err();
    assert!(matches!(err, LaminaError::Config { .. }));
}

#[test]
fn test_create_from_template() {
    let t = test_driver();
    create_chain(&t.driver, &["image"]);
    t.driver
        .create_from_template("container", "image", None, true)
        .unwrap();
    assert!(t.driver.store().is_parent("container", Some("image")));
}

#[test]
fn test_remove_layer() {
    let t = test_driver();
    create_chain(&t.driver, &["base", "top"]);
    t.driver.remove("top").unwrap();
    assert!(!t.driver.exists("top"));
    assert!(t.driver.exists("base"));
    t.driver.remove("top").unwrap();
}

#[test]
fn test_apply_diff_into_upper() {
    let t = driver_with_options(&["overlay.force_mask=shared"]);
    create_chain(&t.driver, &["base", "top"]);

    let mut tar = Cursor::new("a=hello\nb=world!\n");
    let size = t.driver.apply_diff("top", Some("base"), &mut tar, None).unwrap();
    assert_eq!(size, 11);
    let upper = t.driver.store().dir("top").join(layer::DIFF);
    assert_eq!(fs::read_to_string(upper.join("a")).unwrap(), "hello");

    assert_eq!(t.driver.diff_size("top", Some("base")).unwrap(), 11);
    let changes = t.driver.changes("top", Some("base")).unwrap();
    let paths: Vec<PathBuf> = changes.iter().map(|c| c.path.clone()).collect();
    assert_eq!(paths, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
    assert!(changes.iter().all(|c| c.kind == ChangeKind::Add));
    assert_eq!(LineArchive::calls(&t.archive.overlay_calls), 0);
}

#[test]
fn test_changes_with_mount_program_compare_mounted_trees() {
    let t = driver_with_options(&["overlay.force_mask=shared"]);
    create_chain(&t.driver, &["base", "top"]);
    let store = t.driver.store();
    fs::write(store.dir("base").join(layer::DIFF).join("kept"), "same").unwrap();
    fs::write(store.dir("base").join(layer::DIFF).join("edited"), "old").unwrap();
    fs::write(store.dir("top").join(layer::DIFF).join("edited"), "new").unwrap();
    fs::write(store.dir("top").join(layer::DIFF).join("added"), "fresh").unwrap();

    // The parent is the direct parent, yet FUSE upper directories are
    // never read as diffs.
    let changes = t.driver.changes("top", Some("base")).unwrap();
    let summary: Vec<String> = changes.iter().map(ToString::to_string).collect();
    assert_eq!(summary, vec!["A /added", "C /edited"]);
    assert_eq!(LineArchive::calls(&t.archive.tree_calls), 1);
    assert_eq!(LineArchive::calls(&t.archive.overlay_calls), 0);
    assert_eq!(t.driver.active_mounts(), 0);
}

#[test]
fn test_diff_with_mount_program_exports_mounted_changes() {
    let t = driver_with_options(&["overlay.force_mask=shared"]);
    create_chain(&t.driver, &["base", "top"]);
    let store = t.driver.store();
    fs::write(store.dir("base").join(layer::DIFF).join("edited"), "old").unwrap();
    fs::write(store.dir("top").join(layer::DIFF).join("edited"), "new").unwrap();
    fs::write(store.dir("top").join(layer::DIFF).join("added"), "fresh").unwrap();

    let mut stream = t.driver.diff("top", Some("base"), None).unwrap();
    // The layer stays mounted while the export is read.
    assert_eq!(t.driver.active_mounts(), 1);
    let mut exported = String::new();
    stream.read_to_string(&mut exported).unwrap();
    drop(stream);

    assert_eq!(exported, "added=fresh\nedited=new\n");
    assert_eq!(t.driver.active_mounts(), 0);
    assert_eq!(t.backend.mount_count(), t.backend.unmount_count());
    assert_eq!(LineArchive::calls(&t.archive.export_calls), 1);
    assert_eq!(LineArchive::calls(&t.archive.tar_calls), 0);

    // The export applies cleanly onto a fresh layer.
    t.driver.create("copy", Some("base"), None).unwrap();
    t.driver
        .apply_diff("copy", Some("base"), &mut Cursor::new(exported), None)
        .unwrap();
    let copy = store.dir("copy").join(layer::DIFF);
    assert_eq!(fs::read_to_string(copy.join("added")).unwrap(), "fresh");
    assert_eq!(fs::read_to_string(copy.join("edited")).unwrap(), "new");
}

#[test]
fn test_diff_without_archive_engine() {
    let root = tempfile::tempdir().unwrap();
    let config = DriverConfig::with_roots(root.path().join("g"), root.path().join("r"))
        .with_options(["overlay.mount_program=/bin/true", "overlay.skip_mount_home=true"]);
    let driver = Driver::init(config).unwrap();
    driver.create("base", None, None).unwrap();
    let err = driver.diff("base", None, None).err().unwrap();
    assert!(matches!(err, LaminaError::Config { .. }));
    assert_eq!(driver.active_mounts(), 0);
}

#[test]
fn test_apply_diff_without_archive_engine() {
    let root = tempfile::tempdir().unwrap();
    let config = DriverConfig::with_roots(root.path().join("g"), root.path().join("r"))
        .with_options(["overlay.mount_program=/bin/true", "overlay.skip_mount_home=true"]);
    let driver = Driver::init(config).unwrap();
    driver.create("base", None, None).unwrap();
    let err = driver
        .apply_diff("base", None, &mut Cursor::new(""), None)
        .unwrap_err();
    assert!(matches!(err, LaminaError::Config { .. }));
}

#[test]
fn test_update_layer_id_map_rotates_diffs() {
    let t = driver_with_options(&["overlay.force_mask=shared"]);
    create_chain(&t.driver, &["base"]);
    let dir = t.driver.store().dir("base");
    fs::write(dir.join(layer::DIFF).join("file"), b"data").unwrap();

    t.driver.update_layer_id_map("base", None, None, None).unwrap();
    assert_eq!(t.backend.mount_count(), 1);
    assert_eq!(t.backend.unmount_count(), 1);

    assert_eq!(fs::read(dir.join("diff1").join("file")).unwrap(), b"data");
    assert!(dir.join(layer::DIFF).is_dir());
    assert_eq!(fs::read_dir(dir.join(layer::DIFF)).unwrap().count(), 0);
    assert!(dir.join(layer::WORK).is_dir());

    t.driver.update_layer_id_map("base", None, None, None).unwrap();
    assert!(dir.join("diff2").join("file").exists());

    // Rotated diffs become the topmost lowers of the layer itself.
    t.driver.get("base", &MountOpts::default()).unwrap();
    let data = t.backend.last_mount().unwrap().data;
    let first_lower = data
        .split("lowerdir=")
        .nth(1)
        .and_then(|rest| rest.split(':').next())
        .unwrap();
    assert!(first_lower.ends_with("/base/diff1"), "{first_lower}");
    t.driver.put("base").unwrap();
}

#[test]
fn test_unknown_additional_layer() {
    let t = test_driver();
    let err = t
        .driver
        .lookup_additional_layer(&Digest::sha256("00"), "docker.io/library/busybox:latest")
        .unwrap_err();
    assert!(matches!(err, LaminaError::AdditionalLayerUnknown { .. }));
}

#[test]
fn test_additional_layer_store() {
    let root = tempfile::tempdir().unwrap();
    let als = root.path().join("als");
    let digest = Digest::sha256("abcd");
    let layer_dir = als.join(digest.to_string());
    fs::create_dir_all(layer_dir.join(layer::DIFF)).unwrap();
    fs::write(layer_dir.join(layer::DIFF).join("f"), b"x").unwrap();
    fs::write(layer_dir.join("info"), b"{}").unwrap();
    fs::write(layer_dir.join("blob"), b"").unwrap();

    let t = driver_with_options(&[&format!("overlay.additionallayerstore={}", als.display())]);
    let found = t.driver.lookup_additional_layer(&digest, "ref").unwrap();
    assert_eq!(found.path(), layer_dir.as_path());

    t.driver.create_from_additional_layer("al", None, &found).unwrap();
    assert_eq!(
        t.driver.store().diff_path("al").unwrap(),
        layer_dir.join(layer::DIFF)
    );
    let by_id = t.driver.lookup_additional_layer_by_id("al").unwrap();
    assert_eq!(by_id.path(), layer_dir.as_path());

    t.driver.remove("al").unwrap();
    assert!(layer_dir.join(layer::DIFF).join("f").exists());
}

#[test]
fn test_image_stores_are_reported() {
    let ro = tempfile::tempdir().unwrap();
    let t = driver_with_options(&[&format!("overlay.imagestore={}", ro.path().display())]);
    assert_eq!(t.driver.additional_image_stores(), [ro.path().to_path_buf()]);
}

#[test]
fn test_cleanup_removes_staging() {
    let t = test_driver();
    let staging = t.driver.paths().staging();
    fs::create_dir_all(staging.join("leftover")).unwrap();
    t.driver.cleanup().unwrap();
    assert!(!staging.exists());
}
