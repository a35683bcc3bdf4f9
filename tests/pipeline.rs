// tests/pipeline.rs

//! End-to-end pipeline tests with fake toolchain and patcher.

mod common;

use common::{FakeToolchain, RecordingPatcher, context, setup_engine_repo};
use std::fs;
use varimage::{Pipeline, Stage, VariantId};
use varimage::build::manifest_path;

#[test]
fn test_full_matrix_produces_artifacts_and_images() {
    let (_temp, project) = setup_engine_repo();
    let toolchain = FakeToolchain::default();
    let patcher = RecordingPatcher::default();
    let pipeline = Pipeline::new(&project, &toolchain, &patcher);
    let ctx = context("v1.0.0");

    let report = pipeline.run(&ctx, VariantId::all()).unwrap();

    assert!(report.is_success(), "failures: {:?}", report.failures);
    // 3 binaries x 4 variants
    assert_eq!(report.artifacts.len(), 12);
    // 3 images x 4 variants
    assert_eq!(report.images.len(), 12);

    let mut references: Vec<_> = report.images.iter().map(|i| i.reference.clone()).collect();
    references.sort();
    assert!(references.contains(&"mayastor:v1.0.0".to_string()));
    assert!(references.contains(&"mayastor-dev:v1.0.0".to_string()));
    assert!(references.contains(&"mayastor-csi-adhoc:v1.0.0".to_string()));
    assert!(references.contains(&"mayastor-client-coverage:v1.0.0".to_string()));

    for image in &report.images {
        let archive = image.archive.as_ref().unwrap();
        assert!(archive.path.is_file());
        assert!(image.layers >= 1);
    }
}

#[test]
fn test_variants_share_version_and_differ_in_tag() {
    let (_temp, project) = setup_engine_repo();
    let toolchain = FakeToolchain::default();
    let patcher = RecordingPatcher::default();
    let pipeline = Pipeline::new(&project, &toolchain, &patcher).with_export(false);
    let ctx = context("abc123");

    let report = pipeline
        .run(&ctx, &[VariantId::Release, VariantId::Debug])
        .unwrap();

    let release: Vec<_> = report.artifacts_for(VariantId::Release).collect();
    let debug: Vec<_> = report.artifacts_for(VariantId::Debug).collect();
    assert_eq!(release.len(), 3);
    assert_eq!(debug.len(), 3);
    for artifact in release.iter().chain(&debug) {
        assert_eq!(artifact.version.as_str(), "abc123");
    }

    let engine: Vec<_> = report
        .images
        .iter()
        .filter(|i| i.reference.starts_with("mayastor:") || i.reference.starts_with("mayastor-dev:"))
        .collect();
    assert_eq!(engine.len(), 2);
    assert!(engine.iter().all(|i| i.reference.ends_with(":abc123")));
    assert!(engine.iter().all(|i| i.archive.is_none()));
}

#[test]
fn test_debug_variant_links_debug_dependency() {
    let (temp, project) = setup_engine_repo();
    let toolchain = FakeToolchain::default();
    let patcher = RecordingPatcher::default();
    let pipeline = Pipeline::new(&project, &toolchain, &patcher).with_export(false);

    pipeline.build(&context("v1"), &[VariantId::Debug]).unwrap();

    let requests = toolchain.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let spdk = requests[0].1.as_deref().unwrap();
    assert!(spdk.ends_with("libspdk-dev"));

    let expected_lib = temp.path().join("deps/libspdk-dev/lib");
    let rpaths = patcher.rpaths();
    assert_eq!(rpaths.len(), 3);
    assert!(rpaths.iter().all(|p| *p == expected_lib));
}

#[test]
fn test_failed_variant_does_not_abort_others() {
    let (_temp, project) = setup_engine_repo();
    let toolchain = FakeToolchain::failing(VariantId::Debug);
    let patcher = RecordingPatcher::default();
    let pipeline = Pipeline::new(&project, &toolchain, &patcher).with_export(false);

    let report = pipeline
        .run(&context("v1"), &[VariantId::Release, VariantId::Debug])
        .unwrap();

    assert!(!report.is_success());
    assert_eq!(report.artifacts_for(VariantId::Release).count(), 3);
    assert_eq!(report.artifacts_for(VariantId::Debug).count(), 0);

    let build_failures: Vec<_> = report
        .failures
        .iter()
        .filter(|f| f.stage == Stage::Build)
        .collect();
    assert_eq!(build_failures.len(), 1);
    assert_eq!(build_failures[0].subject, "debug");

    // Release images are complete; debug images report the missing artifacts
    assert_eq!(
        report
            .images
            .iter()
            .filter(|i| i.variant == VariantId::Release)
            .count(),
        3
    );
    assert!(report
        .failures
        .iter()
        .filter(|f| f.stage == Stage::Image)
        .all(|f| f.subject.contains("-dev:")));
}

#[test]
fn test_fixup_failure_affects_only_that_artifact() {
    let (_temp, project) = setup_engine_repo();
    let toolchain = FakeToolchain::with_script(VariantId::Release, "mayastor-client");
    let patcher = RecordingPatcher::default();
    let pipeline = Pipeline::new(&project, &toolchain, &patcher).with_export(false);

    let report = pipeline.build(&context("v1"), &[VariantId::Release]).unwrap();

    assert_eq!(report.artifacts.len(), 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].stage, Stage::Fixup);
    assert!(report.failures[0].subject.starts_with("mayastor-client"));
}

#[test]
fn test_source_is_filtered_before_build() {
    let (_temp, project) = setup_engine_repo();
    let toolchain = FakeToolchain::default();
    let patcher = RecordingPatcher::default();
    let pipeline = Pipeline::new(&project, &toolchain, &patcher);

    let source = pipeline.prepare_source().unwrap();

    assert!(source.join("Cargo.toml").is_file());
    assert!(source.join("mayastor/src/main.rs").is_file());
    // Naive prefix matching: `csi` also selects `cside`
    assert!(source.join("cside/notes.txt").is_file());
    assert!(!source.join("docs").exists());
    assert!(!source.join("deps").exists());
}

#[test]
fn test_image_command_reuses_existing_artifacts() {
    let (_temp, project) = setup_engine_repo();
    let toolchain = FakeToolchain::default();
    let patcher = RecordingPatcher::default();
    let pipeline = Pipeline::new(&project, &toolchain, &patcher);
    let ctx = context("v2");

    pipeline.build(&ctx, &[VariantId::Release]).unwrap();

    let mut report = pipeline.existing_artifacts(&ctx, &[VariantId::Release]);
    assert_eq!(report.artifacts.len(), 3);
    pipeline
        .images(&ctx, &[VariantId::Release], &mut report)
        .unwrap();

    assert!(report.is_success(), "failures: {:?}", report.failures);
    assert_eq!(report.images.len(), 3);
    let client = report
        .images
        .iter()
        .find(|i| i.reference == "mayastor-client:v2")
        .unwrap();
    let archive = client.archive.as_ref().unwrap();
    assert!(fs::metadata(&archive.path).unwrap().len() > 0);
    assert_eq!(archive.layers.len(), client.layers);
}

#[test]
fn test_image_command_rejects_artifacts_of_another_version() {
    let (_temp, project) = setup_engine_repo();
    let toolchain = FakeToolchain::default();
    let patcher = RecordingPatcher::default();
    let pipeline = Pipeline::new(&project, &toolchain, &patcher).with_export(false);

    pipeline.build(&context("v1"), &[VariantId::Release]).unwrap();

    let ctx = context("v2");
    let mut report = pipeline.existing_artifacts(&ctx, &[VariantId::Release]);
    assert!(report.artifacts.is_empty());
    assert_eq!(report.failures.len(), 3);
    assert!(report.failures.iter().all(|f| f.stage == Stage::Image));
    assert!(report.failures[0].message.contains("v1"));

    pipeline
        .images(&ctx, &[VariantId::Release], &mut report)
        .unwrap();
    assert!(!report.is_success());
    assert!(report.images.is_empty());
}

#[test]
fn test_failed_rebuild_leaves_no_usable_artifacts() {
    let (_temp, project) = setup_engine_repo();
    let patcher = RecordingPatcher::default();
    let ctx = context("v1");

    let working = FakeToolchain::default();
    Pipeline::new(&project, &working, &patcher)
        .build(&ctx, &[VariantId::Debug])
        .unwrap();
    let manifest = manifest_path(&project.output_dir, VariantId::Debug);
    assert!(manifest.is_file());

    let broken = FakeToolchain::failing(VariantId::Debug);
    let pipeline = Pipeline::new(&project, &broken, &patcher).with_export(false);
    let report = pipeline.build(&ctx, &[VariantId::Debug]).unwrap();
    assert!(!report.is_success());
    assert!(!manifest.exists());

    // The old binaries are still on disk but no longer count as built
    assert!(project.output_dir.join("debug/bin/mayastor").is_file());
    let report = pipeline.existing_artifacts(&ctx, &[VariantId::Debug]);
    assert!(report.artifacts.is_empty());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].subject, "debug");
}

#[test]
fn test_compile_jobs_are_shared_between_variants() {
    let (_temp, project) = setup_engine_repo();
    let toolchain = FakeToolchain::default();
    let patcher = RecordingPatcher::default();
    let pipeline = Pipeline::new(&project, &toolchain, &patcher).with_export(false);

    pipeline
        .build(&context("v1").with_jobs(8), &[VariantId::Release, VariantId::Debug])
        .unwrap();
    pipeline.build(&context("v1"), VariantId::all()).unwrap();

    let jobs = toolchain.jobs.lock().unwrap();
    assert_eq!(jobs.len(), 6);
    assert!(jobs[..2].iter().all(|j| *j == 4));
    // Two jobs across four variants still leaves one per build
    assert!(jobs[2..].iter().all(|j| *j == 1));
}
