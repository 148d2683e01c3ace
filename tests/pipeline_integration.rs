// ==============================================================================
// pipeline_integration.rs - End-to-End Pipeline Tests
// ==============================================================================
// Description: Import, phenotype, association and export on one project
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================

use std::path::Path;

use variant_pipeline::format::FormatSpec;
use variant_pipeline::{
    associate, export, import, load_phenotypes, AssociationOptions, ExportOptions, ImportOptions,
    PhenotypeOptions, Project,
};

const VCF: &str = "##fileformat=VCFv4.2\n\
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\tS1\tS2\tS3\tS4\tS5\tS6\n\
1\t100\t.\tA\tG\t.\t.\t.\tGT\t0/1\t0/0\t1/1\t0/1\t0/0\t1/1\n\
1\t200\t.\tC\tT\t.\t.\t.\tGT\t0/0\t0/1\t0/1\t0/0\t1/1\t0/0\n\
2\t300\t.\tG\tA\t.\t.\t.\tGT\t0/0\t0/0\t0/0\t0/0\t0/0\t0/0\n\
3\t400\t.\tT\tC\t.\t.\t.\tGT\t0/1\t./.\t0/1\t1/1\t0/0\t0/1\n";

// S2 has the only non-binary case status, and no call on chromosome 3
const PHENOTYPES: &str = "sample_name\tBMI\tcase\n\
S1\t20\t1\n\
S2\t25\t0.5\n\
S3\t30\t0\n\
S4\t22\t1\n\
S5\t27\t0\n\
S6\t31\t1\n";

fn setup(dir: &Path) -> Project {
    let project = Project::init(&dir.join("study"), "study").unwrap();
    let vcf = dir.join("calls.vcf");
    std::fs::write(&vcf, VCF).unwrap();
    let summary = import(
        &project,
        ImportOptions {
            files: vec![vcf],
            format: FormatSpec::vcf(),
            sample_names: Vec::new(),
            force: false,
            jobs: 2,
        },
    )
    .unwrap();
    assert_eq!(summary.new_variants, 4);
    assert_eq!(summary.samples_created, 6);

    let pheno = dir.join("pheno.tsv");
    std::fs::write(&pheno, PHENOTYPES).unwrap();
    let loaded = load_phenotypes(
        &project,
        &PhenotypeOptions {
            path: pheno,
            fields: Vec::new(),
            delimiter: b'\t',
        },
    )
    .unwrap();
    assert_eq!(loaded.samples_updated, 6);
    project
}

fn sorted_lines(path: &Path) -> Vec<String> {
    let mut lines: Vec<String> = std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    lines.sort();
    lines
}

fn options(dir: &Path) -> AssociationOptions {
    let mut options = AssociationOptions::new("BMI", vec!["BurdenCorr".to_string()], vec!["chr".to_string()]);
    options.jobs = 2;
    options.output = Some(dir.join("report.tsv"));
    options.result_db = Some(dir.join("results.DB"));
    options
}

#[test]
fn test_association_reports_each_group() {
    let dir = tempfile::tempdir().unwrap();
    let project = setup(dir.path());

    let summary = associate(&project, &options(dir.path())).unwrap();
    assert_eq!(summary.samples, 6);
    assert_eq!(summary.groups_total, 3);
    assert_eq!(summary.workers, 2);
    // chromosome 2 has no polymorphic variant
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);

    let report = std::fs::read_to_string(dir.path().join("report.tsv")).unwrap();
    let lines: Vec<&str> = report.lines().collect();
    assert_eq!(lines[0], "chr\tsample_count\tvariant_count\tBurdenCorr_corr\tBurdenCorr_t");
    assert_eq!(lines.len(), 3);
    assert!(lines[1..].iter().any(|l| l.starts_with("1\t6\t2\t")));
    // S2 has no call on chromosome 3
    assert!(lines[1..].iter().any(|l| l.starts_with("3\t5\t1\t")));

    // caches are removed after the run
    let leftovers = std::fs::read_dir(project.scratch_dir())
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);
}

#[test]
fn test_rerun_skips_computed_groups() {
    let dir = tempfile::tempdir().unwrap();
    let project = setup(dir.path());
    associate(&project, &options(dir.path())).unwrap();

    let rerun = associate(&project, &options(dir.path())).unwrap();
    assert_eq!(rerun.groups_total, 3);
    assert_eq!(rerun.groups_skipped, 2);
    assert_eq!(rerun.succeeded, 0);
    assert_eq!(rerun.failed, 1);

    let mut forced = options(dir.path());
    forced.force = true;
    let forced = associate(&project, &forced).unwrap();
    assert_eq!(forced.groups_skipped, 0);
    assert_eq!(forced.succeeded, 2);
}

#[test]
fn test_export_after_association() {
    let dir = tempfile::tempdir().unwrap();
    let project = setup(dir.path());
    associate(&project, &options(dir.path())).unwrap();

    let output = dir.path().join("export.tsv");
    let summary = export(
        &project,
        &ExportOptions {
            output: output.clone(),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(summary.variants_exported, 4);
    assert_eq!(summary.samples, 6);

    let text = std::fs::read_to_string(&output).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "chr\tpos\tref\talt\tS1\tS2\tS3\tS4\tS5\tS6");
    assert_eq!(lines[3], "2\t300\tG\tA\t0\t0\t0\t0\t0\t0");
    assert_eq!(lines[4], "3\t400\tT\tC\t1\t.\t1\t2\t0\t1");
}

#[test]
fn test_unknown_method_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let project = setup(dir.path());
    let mut bad = options(dir.path());
    bad.methods = vec!["NoSuchTest".to_string()];
    assert!(associate(&project, &bad).is_err());
}

#[test]
fn test_seeded_permutation_does_not_depend_on_worker_count() {
    let dir = tempfile::tempdir().unwrap();
    let project = setup(dir.path());
    let mut reports = Vec::new();
    for jobs in [1, 3] {
        let mut perm = AssociationOptions::new(
            "BMI",
            vec!["BurdenPermute --permutations 200 --seed 7".to_string()],
            vec!["chr".to_string()],
        );
        perm.jobs = jobs;
        let path = dir.path().join(format!("perm_{}.tsv", jobs));
        perm.output = Some(path.clone());
        let summary = associate(&project, &perm).unwrap();
        assert_eq!(summary.workers, jobs);
        assert_eq!(summary.succeeded, 2);
        reports.push(sorted_lines(&path));
    }
    assert_eq!(reports[0], reports[1]);
}

#[test]
fn test_method_error_fails_only_its_group() {
    let dir = tempfile::tempdir().unwrap();
    let mut project = setup(dir.path());
    let baseline = associate(&project, &options(dir.path())).unwrap();

    // S2 is in the chromosome 1 group only, so only that group sees 0.5
    let mut counts = AssociationOptions::new("case", vec!["CaseCtrlCounts".to_string()], vec!["chr".to_string()]);
    counts.output = Some(dir.path().join("counts.tsv"));
    counts.jobs = 2;
    let summary = associate(&project, &counts).unwrap();
    assert_eq!(summary.failed, baseline.failed + 1);
    assert_eq!(summary.succeeded, baseline.succeeded - 1);

    // failed groups stay out of the report
    let lines = sorted_lines(&dir.path().join("counts.tsv"));
    assert_eq!(lines.len(), 2);
    assert!(lines.contains(&"3\t5\t1\t3\t1\t3\t2".to_string()));

    // an expired time limit fails every group instead of aborting the run
    project.settings.association_timeout_secs = Some(0);
    let mut timed = AssociationOptions::new(
        "BMI",
        vec!["BurdenPermute --permutations 100000 --seed 1".to_string()],
        vec!["chr".to_string()],
    );
    timed.output = Some(dir.path().join("timed.tsv"));
    let summary = associate(&project, &timed).unwrap();
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.failed, 3);
}
